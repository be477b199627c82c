//! Cache: memory tier in front of a disk tier

use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;
use stashdb::Result;

use crate::archive::{Archiver, BincodeArchiver};
use crate::disk::{DiskCache, DiskCacheBuilder};
use crate::lifecycle::LifecycleHub;
use crate::limits::{DiskLimits, MemoryLimits};
use crate::memory::{MemoryCache, MemoryCacheBuilder};
use crate::release::ReleasePolicy;
use crate::stats::{CacheStats, Tier};

/// Computes the memory-tier cost of a value
pub type CostFn<V> = Arc<dyn Fn(&V) -> u64 + Send + Sync>;

/// Two-tier cache: reads go through memory to disk, writes go to both.
///
/// Clones share both tiers.
pub struct Cache<V> {
    name: Arc<str>,
    memory: MemoryCache<String, V>,
    disk: DiskCache<V>,
    cost_fn: Option<CostFn<V>>,
    stats: Arc<CacheStats>,
    // Bumped whenever memory is emptied; a disk read started under an older
    // generation must not copy its value into memory.
    generation: Arc<RwLock<u64>>,
}

impl<V> Clone for Cache<V> {
    fn clone(&self) -> Self {
        Self {
            name: Arc::clone(&self.name),
            memory: self.memory.clone(),
            disk: self.disk.clone(),
            cost_fn: self.cost_fn.clone(),
            stats: Arc::clone(&self.stats),
            generation: Arc::clone(&self.generation),
        }
    }
}

/// Configures a [`Cache`]
pub struct CacheBuilder<V> {
    name: String,
    disk: DiskCacheBuilder<V>,
    memory: MemoryCacheBuilder,
    cost_fn: Option<CostFn<V>>,
}

impl<V> CacheBuilder<V>
where
    V: Clone + Send + Sync + 'static,
{
    fn new(path: &Path, disk: DiskCacheBuilder<V>) -> Self {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        Self {
            name,
            disk,
            memory: MemoryCacheBuilder::default(),
            cost_fn: None,
        }
    }

    /// Cache name, shared by both tiers
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Disk values larger than this go to files
    pub fn inline_threshold(mut self, threshold: usize) -> Self {
        self.disk = self.disk.inline_threshold(threshold);
        self
    }

    /// Replace the disk archiver
    pub fn archiver<A: Archiver<V> + 'static>(mut self, archiver: A) -> Self {
        self.disk = self.disk.archiver(archiver);
        self
    }

    /// Name disk value files with `f(key)`
    pub fn filename_fn<F>(mut self, f: F) -> Self
    where
        F: Fn(&str) -> String + Send + Sync + 'static,
    {
        self.disk = self.disk.filename_fn(f);
        self
    }

    /// Memory tier limits
    pub fn memory_limits(mut self, limits: MemoryLimits) -> Self {
        self.memory = self.memory.limits(limits);
        self
    }

    /// Disk tier limits
    pub fn disk_limits(mut self, limits: DiskLimits) -> Self {
        self.disk = self.disk.limits(limits);
        self
    }

    /// Number of worker lanes for callback operations
    pub fn worker_lanes(mut self, count: usize) -> Self {
        self.disk = self.disk.worker_lanes(count);
        self
    }

    /// Where values evicted from memory are dropped
    pub fn release(mut self, release: ReleasePolicy) -> Self {
        self.memory = self.memory.release(release);
        self
    }

    /// Lifecycle hub the memory tier listens to; `None` for none
    pub fn lifecycle_hub(mut self, hub: Option<LifecycleHub>) -> Self {
        self.memory = self.memory.lifecycle_hub(hub);
        self
    }

    /// Cost charged to the memory tier for each value
    pub fn cost_fn<F>(mut self, f: F) -> Self
    where
        F: Fn(&V) -> u64 + Send + Sync + 'static,
    {
        self.cost_fn = Some(Arc::new(f));
        self
    }

    /// Log disk failures through `tracing`
    pub fn error_logs_enabled(mut self, enabled: bool) -> Self {
        self.disk = self.disk.error_logs_enabled(enabled);
        self
    }

    /// Open both tiers.
    ///
    /// # Returns
    /// * `Result<Cache<V>>` - Fails only if the disk directory or its
    ///   manifest cannot be created
    pub fn build(self) -> Result<Cache<V>> {
        let disk = self.disk.name(self.name.clone()).build()?;
        let memory = self.memory.name(self.name.clone()).build();
        Ok(Cache {
            name: Arc::from(self.name),
            memory,
            disk,
            cost_fn: self.cost_fn,
            stats: Arc::new(CacheStats::new()),
            generation: Arc::new(RwLock::new(0)),
        })
    }
}

/// Default location for a named cache
fn default_path(name: &str) -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(name)
}

impl<V> Cache<V>
where
    V: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
    /// Open the cache `name` under the user cache directory
    ///
    /// # Arguments
    /// * `name` - Cache name, also its directory name
    ///
    /// # Returns
    /// * `Result<Cache<V>>` - Cache handle
    pub fn open(name: &str) -> Result<Self> {
        Self::builder(default_path(name)).name(name).build()
    }

    /// Open a cache rooted at `path`
    pub fn open_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::builder(path).build()
    }

    /// Start configuring a cache that archives with `bincode`
    pub fn builder<P: AsRef<Path>>(path: P) -> CacheBuilder<V> {
        let path = path.as_ref();
        CacheBuilder::new(path, DiskCache::builder_with_archiver(path, BincodeArchiver))
    }
}

impl<V> Cache<V>
where
    V: Clone + Send + Sync + 'static,
{
    /// Start configuring a cache with a custom archiver
    pub fn builder_with_archiver<P, A>(path: P, archiver: A) -> CacheBuilder<V>
    where
        P: AsRef<Path>,
        A: Archiver<V> + 'static,
    {
        let path = path.as_ref();
        CacheBuilder::new(path, DiskCache::builder_with_archiver(path, archiver))
    }

    /// Cache name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Memory tier
    pub fn memory(&self) -> &MemoryCache<String, V> {
        &self.memory
    }

    /// Disk tier
    pub fn disk(&self) -> &DiskCache<V> {
        &self.disk
    }

    /// Read counters for both tiers; evictions are in `memory().stats()`
    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }

    fn cost(&self, value: &V) -> u64 {
        self.cost_fn.as_ref().map_or(0, |f| f(value))
    }

    fn fill_memory(&self, key: &str, value: V) {
        let cost = self.cost(&value);
        self.memory.set_with_cost(key.to_string(), value, cost);
    }

    /// Copy a disk read into memory unless memory was emptied since
    /// generation `started`
    fn fill_from_disk(&self, key: &str, value: V, started: u64) {
        let generation = self.generation.read();
        if *generation == started {
            self.fill_memory(key, value);
        }
    }

    fn clear_memory(&self) {
        let mut generation = self.generation.write();
        *generation += 1;
        self.memory.remove_all();
    }

    // ---------------------------------------------------------------------
    // Blocking operations
    // ---------------------------------------------------------------------

    /// Whether either tier holds `key`
    pub fn contains(&self, key: &str) -> bool {
        self.memory.contains(&key.to_string()) || self.disk.contains(key)
    }

    /// Get a value from memory, falling back to disk.
    ///
    /// A disk hit is copied into memory.
    pub fn get(&self, key: &str) -> Option<V> {
        if let Some(value) = self.memory.get(&key.to_string()) {
            self.stats.record_hit(Tier::Memory);
            return Some(value);
        }

        let started = *self.generation.read();
        let value = match self.disk.get(key) {
            Some(value) => value,
            None => {
                self.stats.record_miss();
                return None;
            }
        };
        self.stats.record_hit(Tier::Disk);
        self.fill_from_disk(key, value.clone(), started);
        Some(value)
    }

    /// Store a value in memory, then on disk
    ///
    /// # Returns
    /// * `bool` - Whether the disk write succeeded
    pub fn set(&self, key: &str, value: V) -> bool {
        self.stats.record_write();
        self.fill_memory(key, value.clone());
        self.disk.set(key, &value)
    }

    /// Remove a value from both tiers
    pub fn remove(&self, key: &str) -> bool {
        self.memory.remove(&key.to_string());
        self.disk.remove(key)
    }

    /// Empty both tiers
    pub fn remove_all(&self) -> bool {
        self.clear_memory();
        let ok = self.disk.remove_all();
        self.clear_memory();
        ok
    }

    /// Empty both tiers, reporting disk progress as `(removed, total)`
    pub fn remove_all_with_progress<F>(&self, progress: F) -> bool
    where
        F: FnMut(u64, u64),
    {
        self.clear_memory();
        let ok = self.disk.remove_all_with_progress(progress);
        self.clear_memory();
        ok
    }

    // ---------------------------------------------------------------------
    // Callback operations
    // ---------------------------------------------------------------------
    //
    // Jobs for one key run in submission order on that key's lane. Callbacks
    // never run inside the submitting call. Writes update memory up front so
    // the caller sees them at once, and again from the lane once the disk
    // half is done, so the last job for a key leaves both tiers agreeing.

    fn keyed<F>(&self, key: &str, job: F)
    where
        F: FnOnce(&Cache<V>, &str) + Send + 'static,
    {
        let cache = self.clone();
        let owned = key.to_string();
        self.disk
            .lanes()
            .submit_keyed(key, move || job(&cache, &owned));
    }

    fn control<F>(&self, job: F)
    where
        F: FnOnce(&Cache<V>) + Send + 'static,
    {
        let cache = self.clone();
        self.disk.lanes().submit(move || job(&cache));
    }

    /// [`Cache::contains`] on a worker lane
    pub fn contains_with<F>(&self, key: &str, callback: F)
    where
        F: FnOnce(&str, bool) + Send + 'static,
    {
        self.keyed(key, move |cache, key| callback(key, cache.contains(key)));
    }

    /// [`Cache::get`] on a worker lane
    pub fn get_with<F>(&self, key: &str, callback: F)
    where
        F: FnOnce(&str, Option<V>) + Send + 'static,
    {
        self.keyed(key, move |cache, key| callback(key, cache.get(key)));
    }

    /// Store in memory now and on disk from a worker lane; `callback`
    /// reports the disk write
    pub fn set_with<F>(&self, key: &str, value: V, callback: F)
    where
        F: FnOnce(&str, bool) + Send + 'static,
    {
        self.stats.record_write();
        self.fill_memory(key, value.clone());
        self.keyed(key, move |cache, key| {
            let ok = cache.disk.set(key, &value);
            cache.fill_memory(key, value);
            callback(key, ok)
        });
    }

    /// Remove from memory now and from disk on a worker lane
    pub fn remove_with<F>(&self, key: &str, callback: F)
    where
        F: FnOnce(&str, bool) + Send + 'static,
    {
        self.memory.remove(&key.to_string());
        self.keyed(key, move |cache, key| {
            let ok = cache.disk.remove(key);
            cache.memory.remove(&key.to_string());
            callback(key, ok)
        });
    }

    /// Empty memory now and disk on the control lane
    pub fn remove_all_with<F>(&self, callback: F)
    where
        F: FnOnce(bool) + Send + 'static,
    {
        self.clear_memory();
        self.control(move |cache| {
            let ok = cache.disk.remove_all();
            cache.clear_memory();
            callback(ok)
        });
    }

    /// Empty memory now and disk on the control lane, reporting progress;
    /// `end` runs once after the last progress report
    pub fn remove_all_with_progress_async<P, E>(&self, progress: P, end: E)
    where
        P: FnMut(u64, u64) + Send + 'static,
        E: FnOnce(bool) + Send + 'static,
    {
        self.clear_memory();
        self.control(move |cache| {
            let ok = cache.disk.remove_all_with_progress(progress);
            cache.clear_memory();
            end(ok)
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam::channel;
    use std::time::Duration;
    use tempfile::TempDir;

    fn open(dir: &Path) -> Cache<String> {
        Cache::builder(dir)
            .lifecycle_hub(None)
            .release(ReleasePolicy::Inline)
            .build()
            .unwrap()
    }

    #[test]
    fn test_read_through_populates_memory() {
        let dir = TempDir::new().unwrap();
        let cache = open(dir.path());
        assert!(cache.disk().set("k", &"v".to_string()));
        assert!(!cache.memory().contains(&"k".to_string()));

        assert_eq!(cache.get("k"), Some("v".to_string()));
        assert!(cache.memory().contains(&"k".to_string()));
    }

    #[test]
    fn test_write_through() {
        let dir = TempDir::new().unwrap();
        let cache = open(dir.path());

        assert!(cache.set("k", "v".to_string()));
        assert!(cache.memory().contains(&"k".to_string()));
        assert!(cache.disk().contains("k"));
    }

    #[test]
    fn test_remove_clears_both_tiers() {
        let dir = TempDir::new().unwrap();
        let cache = open(dir.path());
        cache.set("a", "1".to_string());
        cache.set("b", "2".to_string());

        assert!(cache.remove("a"));
        assert!(!cache.contains("a"));

        assert!(cache.remove_all());
        assert!(!cache.contains("b"));
        assert_eq!(cache.memory().total_count(), 0);
        assert_eq!(cache.disk().total_count(), Some(0));
    }

    #[test]
    fn test_miss_everywhere() {
        let dir = TempDir::new().unwrap();
        let cache = open(dir.path());
        assert_eq!(cache.get("nothing"), None);
        assert_eq!(cache.stats().misses(), 1);
    }

    #[test]
    fn test_stats_count_disk_hits() {
        let dir = TempDir::new().unwrap();
        let cache = open(dir.path());
        cache.disk().set("k", &"v".to_string());

        cache.get("k");
        cache.get("k");
        let stats = cache.stats();
        assert_eq!(stats.hits_in(Tier::Disk), 1);
        assert_eq!(stats.hits_in(Tier::Memory), 1);
        assert_eq!(stats.misses(), 0);
        assert_eq!(stats.hit_ratio(), 1.0);
    }

    #[test]
    fn test_disk_read_overlapping_wipe_does_not_fill_memory() {
        let dir = TempDir::new().unwrap();
        let cache = open(dir.path());

        let started = *cache.generation.read();
        cache.clear_memory();
        cache.fill_from_disk("k", "stale".to_string(), started);
        assert!(!cache.memory().contains(&"k".to_string()));

        let current = *cache.generation.read();
        cache.fill_from_disk("k", "fresh".to_string(), current);
        assert_eq!(cache.memory().get(&"k".to_string()), Some("fresh".to_string()));
    }

    #[test]
    fn test_cost_fn_charges_memory() {
        let dir = TempDir::new().unwrap();
        let cache: Cache<String> = Cache::builder(dir.path())
            .lifecycle_hub(None)
            .cost_fn(|v: &String| v.len() as u64)
            .build()
            .unwrap();

        cache.set("k", "hello".to_string());
        assert_eq!(cache.memory().total_cost(), 5);
    }

    #[test]
    fn test_get_with_after_set_with_sees_value() {
        let dir = TempDir::new().unwrap();
        let cache = open(dir.path());
        let (tx, rx) = channel::unbounded();

        let set_tx = tx.clone();
        cache.set_with("k", "v".to_string(), move |_, ok| set_tx.send(ok).unwrap());
        cache.memory().remove_all();
        cache.get_with("k", move |_, value| {
            tx.send(value == Some("v".to_string())).unwrap()
        });

        let timeout = Duration::from_secs(5);
        assert!(rx.recv_timeout(timeout).unwrap());
        assert!(rx.recv_timeout(timeout).unwrap());
    }

    #[test]
    fn test_default_path_uses_name() {
        assert!(default_path("thumbs").ends_with("thumbs"));
    }
}
