//! # stashcache
//!
//! Two-tier object cache over `stashdb`.
//!
//! ## Architecture
//! - **MemoryCache**: slab-backed LRU of live values with count/cost/age limits
//! - **DiskCache**: archived values in a `KvStorage`, trimmed by a sweeper
//! - **Cache**: read-through/write-through composition of both, with
//!   blocking and callback APIs
//!
//! Callback operations run on worker lanes: jobs for the same key run in
//! submission order, callbacks never run inside the submitting call.

#![warn(missing_docs)]

mod archive;
mod cache;
mod disk;
mod lifecycle;
mod limits;
mod lru;
mod memory;
mod release;
mod stats;
mod worker;

pub use archive::{Archiver, BincodeArchiver, FilenameFn, FnArchiver, RawArchiver};
pub use cache::{Cache, CacheBuilder, CostFn};
pub use disk::{DiskCache, DiskCacheBuilder, DiskEntry, DEFAULT_INLINE_THRESHOLD, DEFAULT_LANES};
pub use lifecycle::{LifecycleEvent, LifecycleHub, Subscription};
pub use limits::{DiskLimits, MemoryLimits};
pub use memory::{MemoryCache, MemoryCacheBuilder, MemoryHook};
pub use release::{ReleasePolicy, ReleaseQueue, ReleaseThread};
pub use stashdb::{Error, ReconcileReport, Result, StorageType};
pub use stats::{CacheStats, Tier};
