//! # stashdb
//!
//! Hybrid key-value storage engine for the stash cache.
//!
//! ## Design
//! - **Manifest**: one SQLite row per item with size, timestamps and
//!   extended data (indexed by key and access time)
//! - **Placement**: small values inline in the row, large values in loose
//!   files under `data/` (see [`StorageType`])
//! - **Consistency**: file before row on save, row before file on remove,
//!   reconciliation on open
//! - **Concurrency**: one lock around the manifest and file directory

#![warn(missing_docs)]

mod error;
mod files;
mod item;
mod manifest;
mod storage;

pub use error::{Error, Result};
pub use item::{default_filename, StorageItem, StorageType};
pub use storage::{KvStorage, ReconcileReport};
