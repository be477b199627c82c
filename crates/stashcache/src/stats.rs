//! Read and eviction counters, split by the tier that answered

use std::sync::atomic::{AtomicU64, Ordering};

/// Tier that answered a read
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    /// Found among live values
    Memory,
    /// Decoded from storage
    Disk,
}

/// Counters shared by every handle of one cache.
///
/// A [`MemoryCache`](crate::MemoryCache) only ever sees memory hits. A
/// [`Cache`](crate::Cache) keeps its own set: a read served by storage is a
/// disk hit, and a miss means neither tier had the key. Evictions are
/// counted where they happen, in the memory tier.
#[derive(Debug, Default)]
pub struct CacheStats {
    memory_hits: AtomicU64,
    disk_hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    writes: AtomicU64,
}

impl CacheStats {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn tier(&self, tier: Tier) -> &AtomicU64 {
        match tier {
            Tier::Memory => &self.memory_hits,
            Tier::Disk => &self.disk_hits,
        }
    }

    pub(crate) fn record_hit(&self, tier: Tier) {
        self.tier(tier).fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_evictions(&self, n: usize) {
        if n > 0 {
            self.evictions.fetch_add(n as u64, Ordering::Relaxed);
        }
    }

    pub(crate) fn record_write(&self) {
        self.writes.fetch_add(1, Ordering::Relaxed);
    }

    /// Reads answered by any tier
    pub fn hits(&self) -> u64 {
        self.hits_in(Tier::Memory) + self.hits_in(Tier::Disk)
    }

    /// Reads answered by `tier`
    pub fn hits_in(&self, tier: Tier) -> u64 {
        self.tier(tier).load(Ordering::Relaxed)
    }

    /// Reads no tier could answer
    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    /// Entries dropped by limits or age, not by explicit removal
    pub fn evictions(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }

    /// Values stored, replacements included
    pub fn writes(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    /// Share of reads answered by any tier, `0.0` before the first read
    pub fn hit_ratio(&self) -> f64 {
        let hits = self.hits();
        match hits + self.misses() {
            0 => 0.0,
            reads => hits as f64 / reads as f64,
        }
    }

    /// Share of reads answered by memory alone
    pub fn memory_hit_ratio(&self) -> f64 {
        let hits = self.hits_in(Tier::Memory);
        match self.hits() + self.misses() {
            0 => 0.0,
            reads => hits as f64 / reads as f64,
        }
    }

    /// Zero every counter
    pub fn reset(&self) {
        for counter in [
            &self.memory_hits,
            &self.disk_hits,
            &self.misses,
            &self.evictions,
            &self.writes,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}
