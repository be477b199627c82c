//! DiskCache: persistent tier over [`KvStorage`]
//!
//! Values are archived to bytes, placed inline or in files by size and kept
//! within count/cost/age/free-space limits by a periodic sweep. Every
//! operation has a blocking form and a `*_with` form that runs on the cache's
//! worker lanes and reports through a callback.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use once_cell::sync::Lazy;
use parking_lot::{Mutex, RwLock};
use serde::de::DeserializeOwned;
use serde::Serialize;
use stashdb::{KvStorage, ReconcileReport, Result, StorageType};
use tracing::{debug, warn};

use crate::archive::{Archiver, BincodeArchiver, FilenameFn};
use crate::limits::DiskLimits;
use crate::worker::{Lanes, Ticker};

/// Values up to this many bytes are stored inline by default
pub const DEFAULT_INLINE_THRESHOLD: usize = 20 * 1024;

/// Worker lanes per cache by default
pub const DEFAULT_LANES: usize = 4;

/// One storage per directory per process
static STORAGES: Lazy<Mutex<HashMap<PathBuf, Weak<KvStorage>>>> = Lazy::new(Default::default);

fn shared_storage(path: &Path, storage_type: StorageType) -> Result<Arc<KvStorage>> {
    fs::create_dir_all(path)?;
    let path = fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());

    let mut storages = STORAGES.lock();
    storages.retain(|_, storage| storage.strong_count() > 0);
    if let Some(storage) = storages.get(&path).and_then(Weak::upgrade) {
        if storage.storage_type() != storage_type {
            debug!(
                "Reusing storage at {} as {:?}, not {:?}",
                path.display(),
                storage.storage_type(),
                storage_type
            );
        }
        return Ok(storage);
    }

    let storage = Arc::new(KvStorage::open(&path, storage_type)?);
    storages.insert(path, Arc::downgrade(&storage));
    Ok(storage)
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// A decoded value together with the extended data stored beside it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskEntry<V> {
    /// Decoded value
    pub value: V,
    /// Opaque data saved with the value, never part of the archived bytes
    pub extended_data: Option<Vec<u8>>,
}

struct DiskInner<V> {
    name: RwLock<String>,
    storage: Arc<KvStorage>,
    archiver: Arc<dyn Archiver<V>>,
    filename_fn: Option<FilenameFn>,
    limits: RwLock<DiskLimits>,
    lanes: Lanes,
    sweeper: Mutex<Option<Ticker>>,
}

/// Persistent cache handle; clones share the same cache
pub struct DiskCache<V> {
    inner: Arc<DiskInner<V>>,
}

impl<V> Clone for DiskCache<V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

/// Configures a [`DiskCache`]
pub struct DiskCacheBuilder<V> {
    path: PathBuf,
    name: Option<String>,
    inline_threshold: usize,
    archiver: Arc<dyn Archiver<V>>,
    filename_fn: Option<FilenameFn>,
    limits: DiskLimits,
    lane_count: usize,
    error_logs_enabled: bool,
}

impl<V: Send + 'static> DiskCacheBuilder<V> {
    fn new(path: PathBuf, archiver: Arc<dyn Archiver<V>>) -> Self {
        Self {
            path,
            name: None,
            inline_threshold: DEFAULT_INLINE_THRESHOLD,
            archiver,
            filename_fn: None,
            limits: DiskLimits::default(),
            lane_count: DEFAULT_LANES,
            error_logs_enabled: true,
        }
    }

    /// Cache name, used in logs; defaults to the directory name
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Values larger than this go to files. `0` stores every value as a
    /// file, `usize::MAX` keeps every value inline.
    pub fn inline_threshold(mut self, threshold: usize) -> Self {
        self.inline_threshold = threshold;
        self
    }

    /// Replace the archiver
    pub fn archiver<A: Archiver<V> + 'static>(mut self, archiver: A) -> Self {
        self.archiver = Arc::new(archiver);
        self
    }

    /// Name value files with `f(key)` instead of the key digest
    pub fn filename_fn<F>(mut self, f: F) -> Self
    where
        F: Fn(&str) -> String + Send + Sync + 'static,
    {
        self.filename_fn = Some(Arc::new(f));
        self
    }

    /// Initial limits
    pub fn limits(mut self, limits: DiskLimits) -> Self {
        self.limits = limits;
        self
    }

    /// Number of worker lanes for `*_with` operations
    pub fn worker_lanes(mut self, count: usize) -> Self {
        self.lane_count = count;
        self
    }

    /// Log storage failures through `tracing`
    pub fn error_logs_enabled(mut self, enabled: bool) -> Self {
        self.error_logs_enabled = enabled;
        self
    }

    /// Open the storage, start the sweeper and the worker lanes.
    ///
    /// Fails only if the directory or its manifest cannot be created.
    pub fn build(self) -> Result<DiskCache<V>> {
        let storage = shared_storage(&self.path, StorageType::for_threshold(self.inline_threshold))?;
        storage.set_error_logs_enabled(self.error_logs_enabled);

        let lanes = Lanes::new("stash-disk", self.lane_count)?;
        let name = self.name.unwrap_or_else(|| {
            self.path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default()
        });
        let first_interval = self.limits.auto_trim_interval;

        let cache = DiskCache {
            inner: Arc::new(DiskInner {
                name: RwLock::new(name),
                storage,
                archiver: self.archiver,
                filename_fn: self.filename_fn,
                limits: RwLock::new(self.limits),
                lanes,
                sweeper: Mutex::new(None),
            }),
        };

        let weak = Arc::downgrade(&cache.inner);
        match Ticker::spawn("stash-disk-trim", first_interval, move |active| {
            let cache = DiskCache { inner: weak.upgrade()? };
            if active {
                cache.trim_in_background();
            }
            Some(cache.limits().auto_trim_interval)
        }) {
            Ok(ticker) => *cache.inner.sweeper.lock() = Some(ticker),
            Err(e) => warn!("Disk cache sweeper unavailable: {}", e),
        }

        Ok(cache)
    }
}

impl<V> DiskCache<V>
where
    V: Serialize + DeserializeOwned + Send + 'static,
{
    /// Open a cache at `path` with the default inline threshold
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::builder(path).build()
    }

    /// Open a cache at `path` with a custom inline threshold
    pub fn open_with_threshold<P: AsRef<Path>>(path: P, threshold: usize) -> Result<Self> {
        Self::builder(path).inline_threshold(threshold).build()
    }

    /// Start configuring a cache that archives with `bincode`
    pub fn builder<P: AsRef<Path>>(path: P) -> DiskCacheBuilder<V> {
        DiskCacheBuilder::new(path.as_ref().to_path_buf(), Arc::new(BincodeArchiver))
    }
}

impl<V: Send + 'static> DiskCache<V> {
    /// Start configuring a cache with a custom archiver
    pub fn builder_with_archiver<P, A>(path: P, archiver: A) -> DiskCacheBuilder<V>
    where
        P: AsRef<Path>,
        A: Archiver<V> + 'static,
    {
        DiskCacheBuilder::new(path.as_ref().to_path_buf(), Arc::new(archiver))
    }

    /// Cache name
    pub fn name(&self) -> String {
        self.inner.name.read().clone()
    }

    /// Rename the cache
    pub fn set_name(&self, name: impl Into<String>) {
        *self.inner.name.write() = name.into();
    }

    /// Cache directory
    pub fn path(&self) -> &Path {
        self.inner.storage.path()
    }

    /// Largest value size stored inline
    pub fn inline_threshold(&self) -> usize {
        self.inner.storage.storage_type().inline_threshold()
    }

    /// Underlying storage
    pub fn storage(&self) -> &Arc<KvStorage> {
        &self.inner.storage
    }

    pub(crate) fn lanes(&self) -> &Lanes {
        &self.inner.lanes
    }

    /// Current limits
    pub fn limits(&self) -> DiskLimits {
        self.inner.limits.read().clone()
    }

    /// Replace the limits; applied from the next write or sweep
    pub fn set_limits(&self, limits: DiskLimits) {
        *self.inner.limits.write() = limits;
    }

    /// Update the limits in place
    pub fn update_limits<F: FnOnce(&mut DiskLimits)>(&self, f: F) {
        f(&mut self.inner.limits.write());
    }

    /// Toggle `tracing` output for storage failures
    pub fn set_error_logs_enabled(&self, enabled: bool) {
        self.inner.storage.set_error_logs_enabled(enabled);
    }

    // ---------------------------------------------------------------------
    // Blocking operations
    // ---------------------------------------------------------------------

    /// Whether `key` has a stored value
    pub fn contains(&self, key: &str) -> bool {
        self.inner.storage.exists(key).unwrap_or(false)
    }

    /// Load and decode a value. A value that fails to decode is purged and
    /// reported as a miss.
    pub fn get(&self, key: &str) -> Option<V> {
        self.get_with_extended_data(key).map(|entry| entry.value)
    }

    /// Load a value with its extended data
    pub fn get_with_extended_data(&self, key: &str) -> Option<DiskEntry<V>> {
        let item = self.inner.storage.get(key).ok()??;
        match self.inner.archiver.unarchive(&item.value) {
            Some(value) => Some(DiskEntry {
                value,
                extended_data: item.extended_data,
            }),
            None => {
                debug!("Purging undecodable value for {:?}", key);
                let _ = self.inner.storage.remove(key);
                None
            }
        }
    }

    /// Archive and store a value
    pub fn set(&self, key: &str, value: &V) -> bool {
        self.set_with_extended_data(key, value, None)
    }

    /// Archive and store a value with opaque extended data beside it
    pub fn set_with_extended_data(
        &self,
        key: &str,
        value: &V,
        extended_data: Option<&[u8]>,
    ) -> bool {
        let bytes = match self.inner.archiver.archive(value) {
            Some(bytes) => bytes,
            None => return false,
        };
        self.ensure_free_space();

        let storage = &self.inner.storage;
        let filename = match &self.inner.filename_fn {
            Some(f) if !storage.storage_type().stores_inline(bytes.len()) => Some(f(key)),
            _ => None,
        };
        storage
            .save(key, &bytes, filename.as_deref(), extended_data)
            .is_ok()
    }

    /// Remove one value; missing keys succeed
    pub fn remove(&self, key: &str) -> bool {
        self.inner.storage.remove(key).is_ok()
    }

    /// Remove every value
    pub fn remove_all(&self) -> bool {
        self.inner.storage.remove_all().is_ok()
    }

    /// Remove every value in batches, reporting `(removed, total)`
    pub fn remove_all_with_progress<F>(&self, progress: F) -> bool
    where
        F: FnMut(u64, u64),
    {
        self.inner.storage.remove_all_with_progress(progress).is_ok()
    }

    /// Number of stored values, `None` if the storage failed
    pub fn total_count(&self) -> Option<u64> {
        self.inner.storage.count().ok()
    }

    /// Sum of stored value sizes, `None` if the storage failed
    pub fn total_cost(&self) -> Option<u64> {
        self.inner.storage.total_size().ok()
    }

    /// Evict least recently used values until at most `count` remain
    pub fn trim_to_count(&self, count: u64) -> bool {
        self.inner.storage.remove_to_fit_count(count).is_ok()
    }

    /// Evict least recently used values until their total size is at most `cost`
    pub fn trim_to_cost(&self, cost: u64) -> bool {
        self.inner.storage.remove_to_fit_size(cost).is_ok()
    }

    /// Remove values last written more than `age` ago
    pub fn trim_to_age(&self, age: Duration) -> bool {
        if age.is_zero() {
            return self.remove_all();
        }
        let age = match i64::try_from(age.as_secs()) {
            Ok(secs) => secs,
            Err(_) => return true,
        };
        let cutoff = unix_now().saturating_sub(age);
        self.inner.storage.remove_older_than(cutoff).is_ok()
    }

    /// Evict until the volume has `limit` bytes free or the cache is empty.
    /// An unknown amount of free space counts as enough.
    pub fn trim_to_free_space(&self, limit: u64) -> bool {
        if limit == 0 {
            return true;
        }
        let storage = &self.inner.storage;
        let available = match fs2::available_space(storage.path()) {
            Ok(available) => available,
            Err(e) => {
                debug!("Free space unknown at {}: {}", storage.path().display(), e);
                return true;
            }
        };
        if available >= limit {
            return true;
        }
        let deficit = limit - available;
        match storage.total_size() {
            Ok(total) => storage.remove_to_fit_size(total.saturating_sub(deficit)).is_ok(),
            Err(_) => false,
        }
    }

    /// Remove orphan files and rows whose file is gone
    pub fn reconcile(&self) -> Option<ReconcileReport> {
        self.inner.storage.reconcile().ok()
    }

    fn ensure_free_space(&self) {
        let limit = self.inner.limits.read().free_disk_space_limit;
        self.trim_to_free_space(limit);
    }

    fn trim_in_background(&self) {
        let limits = self.limits();
        debug!("Sweeping disk cache {:?}", self.name());
        if limits.age_limit != Duration::MAX {
            self.trim_to_age(limits.age_limit);
        }
        self.trim_to_count(limits.count_limit);
        self.trim_to_cost(limits.cost_limit);
        self.trim_to_free_space(limits.free_disk_space_limit);
        if limits.reconcile_on_auto_trim {
            if let Some(report) = self.reconcile() {
                debug!("Reconciled disk cache {:?}: {:?}", self.name(), report);
            }
        }
    }

    // ---------------------------------------------------------------------
    // Callback operations
    // ---------------------------------------------------------------------

    fn keyed<F>(&self, key: &str, job: F)
    where
        F: FnOnce(&DiskCache<V>, &str) + Send + 'static,
    {
        let cache = self.clone();
        let owned = key.to_string();
        self.inner
            .lanes
            .submit_keyed(key, move || job(&cache, &owned));
    }

    fn control<F>(&self, job: F)
    where
        F: FnOnce(&DiskCache<V>) + Send + 'static,
    {
        let cache = self.clone();
        self.inner.lanes.submit(move || job(&cache));
    }

    /// [`DiskCache::contains`] on a worker lane
    pub fn contains_with<F>(&self, key: &str, callback: F)
    where
        F: FnOnce(&str, bool) + Send + 'static,
    {
        self.keyed(key, move |cache, key| callback(key, cache.contains(key)));
    }

    /// [`DiskCache::get`] on a worker lane
    pub fn get_with<F>(&self, key: &str, callback: F)
    where
        F: FnOnce(&str, Option<V>) + Send + 'static,
    {
        self.keyed(key, move |cache, key| callback(key, cache.get(key)));
    }

    /// [`DiskCache::get_with_extended_data`] on a worker lane
    pub fn get_with_extended_data_with<F>(&self, key: &str, callback: F)
    where
        F: FnOnce(&str, Option<DiskEntry<V>>) + Send + 'static,
    {
        self.keyed(key, move |cache, key| {
            callback(key, cache.get_with_extended_data(key))
        });
    }

    /// [`DiskCache::set`] on a worker lane
    pub fn set_with<F>(&self, key: &str, value: V, callback: F)
    where
        F: FnOnce(&str, bool) + Send + 'static,
    {
        self.keyed(key, move |cache, key| callback(key, cache.set(key, &value)));
    }

    /// [`DiskCache::set_with_extended_data`] on a worker lane
    pub fn set_with_extended_data_with<F>(
        &self,
        key: &str,
        value: V,
        extended_data: Option<Vec<u8>>,
        callback: F,
    ) where
        F: FnOnce(&str, bool) + Send + 'static,
    {
        self.keyed(key, move |cache, key| {
            let saved = cache.set_with_extended_data(key, &value, extended_data.as_deref());
            callback(key, saved)
        });
    }

    /// [`DiskCache::remove`] on a worker lane
    pub fn remove_with<F>(&self, key: &str, callback: F)
    where
        F: FnOnce(&str, bool) + Send + 'static,
    {
        self.keyed(key, move |cache, key| callback(key, cache.remove(key)));
    }

    /// [`DiskCache::remove_all`] on the control lane
    pub fn remove_all_with<F>(&self, callback: F)
    where
        F: FnOnce(bool) + Send + 'static,
    {
        self.control(move |cache| callback(cache.remove_all()));
    }

    /// [`DiskCache::remove_all_with_progress`] on the control lane; `end`
    /// runs once after the last progress report
    pub fn remove_all_with_progress_async<P, E>(&self, progress: P, end: E)
    where
        P: FnMut(u64, u64) + Send + 'static,
        E: FnOnce(bool) + Send + 'static,
    {
        self.control(move |cache| end(cache.remove_all_with_progress(progress)));
    }

    /// [`DiskCache::total_count`] on the control lane
    pub fn total_count_with<F>(&self, callback: F)
    where
        F: FnOnce(Option<u64>) + Send + 'static,
    {
        self.control(move |cache| callback(cache.total_count()));
    }

    /// [`DiskCache::total_cost`] on the control lane
    pub fn total_cost_with<F>(&self, callback: F)
    where
        F: FnOnce(Option<u64>) + Send + 'static,
    {
        self.control(move |cache| callback(cache.total_cost()));
    }

    /// [`DiskCache::trim_to_count`] on the control lane
    pub fn trim_to_count_with<F>(&self, count: u64, callback: F)
    where
        F: FnOnce(bool) + Send + 'static,
    {
        self.control(move |cache| callback(cache.trim_to_count(count)));
    }

    /// [`DiskCache::trim_to_cost`] on the control lane
    pub fn trim_to_cost_with<F>(&self, cost: u64, callback: F)
    where
        F: FnOnce(bool) + Send + 'static,
    {
        self.control(move |cache| callback(cache.trim_to_cost(cost)));
    }

    /// [`DiskCache::trim_to_age`] on the control lane
    pub fn trim_to_age_with<F>(&self, age: Duration, callback: F)
    where
        F: FnOnce(bool) + Send + 'static,
    {
        self.control(move |cache| callback(cache.trim_to_age(age)));
    }

    /// [`DiskCache::trim_to_free_space`] on the control lane
    pub fn trim_to_free_space_with<F>(&self, limit: u64, callback: F)
    where
        F: FnOnce(bool) + Send + 'static,
    {
        self.control(move |cache| callback(cache.trim_to_free_space(limit)));
    }

    /// [`DiskCache::reconcile`] on the control lane
    pub fn reconcile_with<F>(&self, callback: F)
    where
        F: FnOnce(Option<ReconcileReport>) + Send + 'static,
    {
        self.control(move |cache| callback(cache.reconcile()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::{FnArchiver, RawArchiver};
    use crossbeam::channel;
    use tempfile::TempDir;

    fn raw(dir: &Path, threshold: usize) -> DiskCache<Vec<u8>> {
        DiskCache::builder_with_archiver(dir, RawArchiver)
            .inline_threshold(threshold)
            .build()
            .unwrap()
    }

    #[test]
    fn test_set_get_remove() {
        let dir = TempDir::new().unwrap();
        let cache: DiskCache<String> = DiskCache::open(dir.path()).unwrap();

        assert!(cache.set("greeting", &"hello".to_string()));
        assert!(cache.contains("greeting"));
        assert_eq!(cache.get("greeting"), Some("hello".to_string()));

        assert!(cache.remove("greeting"));
        assert!(!cache.contains("greeting"));
        assert_eq!(cache.get("greeting"), None);
        assert!(cache.remove("greeting"));
    }

    #[test]
    fn test_placement_follows_threshold() {
        let dir = TempDir::new().unwrap();
        let cache = raw(dir.path(), 20);

        assert!(cache.set("small", &vec![1; 10]));
        assert!(cache.set("large", &vec![2; 100]));

        let small = cache.storage().get_info("small").unwrap().unwrap();
        let large = cache.storage().get_info("large").unwrap().unwrap();
        assert!(small.filename.is_none());
        let name = large.filename.unwrap();
        assert_eq!(
            fs::metadata(cache.storage().data_path().join(name)).unwrap().len(),
            100
        );
        assert_eq!(cache.get("large"), Some(vec![2; 100]));
    }

    #[test]
    fn test_missing_value_file_is_not_contained() {
        let dir = TempDir::new().unwrap();
        let cache = raw(dir.path(), 0);
        assert!(cache.set("k", &vec![3; 16]));

        let name = cache.storage().get_info("k").unwrap().unwrap().filename.unwrap();
        fs::remove_file(cache.storage().data_path().join(name)).unwrap();

        assert!(!cache.contains("k"));
        assert_eq!(cache.total_count(), Some(0));
    }

    #[test]
    fn test_custom_filename() {
        let dir = TempDir::new().unwrap();
        let cache: DiskCache<Vec<u8>> = DiskCache::builder_with_archiver(dir.path(), RawArchiver)
            .inline_threshold(0)
            .filename_fn(|key| format!("{}.bin", key))
            .build()
            .unwrap();

        assert!(cache.set("photo", &vec![7; 4]));
        assert!(cache.storage().data_path().join("photo.bin").exists());
    }

    #[test]
    fn test_extended_data_round_trip() {
        let dir = TempDir::new().unwrap();
        let cache: DiskCache<u32> = DiskCache::open(dir.path()).unwrap();

        assert!(cache.set_with_extended_data("k", &42, Some(b"meta")));
        let entry = cache.get_with_extended_data("k").unwrap();
        assert_eq!(entry.value, 42);
        assert_eq!(entry.extended_data.as_deref(), Some(&b"meta"[..]));

        assert!(cache.set("k", &43));
        assert_eq!(cache.get_with_extended_data("k").unwrap().extended_data, None);
    }

    #[test]
    fn test_undecodable_value_is_purged() {
        let dir = TempDir::new().unwrap();
        let cache: DiskCache<String> = DiskCache::builder_with_archiver(
            dir.path(),
            FnArchiver::new(
                |s: &String| Some(s.as_bytes().to_vec()),
                |b: &[u8]| String::from_utf8(b.to_vec()).ok(),
            ),
        )
        .build()
        .unwrap();

        cache.storage().save_value("bad", &[0xc3, 0x28]).unwrap();
        assert!(cache.contains("bad"));
        assert_eq!(cache.get("bad"), None);
        assert!(!cache.contains("bad"));
    }

    #[test]
    fn test_same_path_shares_storage() {
        let dir = TempDir::new().unwrap();
        let a = raw(dir.path(), 20);
        let b = raw(dir.path(), 20);
        assert!(Arc::ptr_eq(a.storage(), b.storage()));

        a.set("k", &vec![1]);
        assert_eq!(b.get("k"), Some(vec![1]));
    }

    #[test]
    fn test_trim_to_count_and_cost() {
        let dir = TempDir::new().unwrap();
        let cache = raw(dir.path(), 20);
        for i in 0..10 {
            cache.set(&format!("k{}", i), &vec![0; 10]);
        }
        assert_eq!(cache.total_count(), Some(10));
        assert_eq!(cache.total_cost(), Some(100));

        assert!(cache.trim_to_count(6));
        assert_eq!(cache.total_count(), Some(6));

        assert!(cache.trim_to_cost(30));
        assert_eq!(cache.total_cost(), Some(30));

        assert!(cache.trim_to_age(Duration::ZERO));
        assert_eq!(cache.total_count(), Some(0));
    }

    #[test]
    fn test_trim_to_age_keeps_recent() {
        let dir = TempDir::new().unwrap();
        let cache = raw(dir.path(), 20);
        cache.set("fresh", &vec![1]);

        assert!(cache.trim_to_age(Duration::from_secs(3600)));
        assert!(cache.trim_to_age(Duration::MAX));
        assert!(cache.contains("fresh"));
    }

    #[test]
    fn test_free_space_limit_evicts_before_write() {
        let dir = TempDir::new().unwrap();
        let cache = raw(dir.path(), 20);
        cache.set("a", &vec![1; 50]);
        cache.set("b", &vec![2; 50]);

        cache.update_limits(|limits| limits.free_disk_space_limit = u64::MAX);
        assert!(cache.set("c", &vec![3; 50]));

        assert!(!cache.contains("a"));
        assert!(!cache.contains("b"));
        assert_eq!(cache.get("c"), Some(vec![3; 50]));
    }

    #[test]
    fn test_remove_all_with_progress() {
        let dir = TempDir::new().unwrap();
        let cache = raw(dir.path(), 20);
        for i in 0..40 {
            cache.set(&format!("k{}", i), &vec![0; 4]);
        }

        let mut reports = Vec::new();
        assert!(cache.remove_all_with_progress(|removed, total| reports.push((removed, total))));
        assert_eq!(reports.last(), Some(&(40, 40)));
        assert_eq!(cache.total_count(), Some(0));
    }

    #[test]
    fn test_callbacks_run_in_order_per_key() {
        let dir = TempDir::new().unwrap();
        let cache = raw(dir.path(), 20);
        let (tx, rx) = channel::unbounded();

        let set_tx = tx.clone();
        cache.set_with("k", vec![9], move |_, ok| set_tx.send(("set", ok)).unwrap());
        let get_tx = tx.clone();
        cache.get_with("k", move |_, value| {
            get_tx.send(("get", value == Some(vec![9]))).unwrap()
        });
        cache.remove_with("k", move |_, ok| tx.send(("remove", ok)).unwrap());

        let timeout = Duration::from_secs(5);
        assert_eq!(rx.recv_timeout(timeout).unwrap(), ("set", true));
        assert_eq!(rx.recv_timeout(timeout).unwrap(), ("get", true));
        assert_eq!(rx.recv_timeout(timeout).unwrap(), ("remove", true));
    }

    #[test]
    fn test_control_lane_callbacks() {
        let dir = TempDir::new().unwrap();
        let cache = raw(dir.path(), 20);
        cache.set("a", &vec![1, 2, 3]);
        let (tx, rx) = channel::unbounded();

        let count_tx = tx.clone();
        cache.total_count_with(move |count| count_tx.send(count).unwrap());
        let cost_tx = tx.clone();
        cache.total_cost_with(move |cost| cost_tx.send(cost).unwrap());

        let timeout = Duration::from_secs(5);
        assert_eq!(rx.recv_timeout(timeout).unwrap(), Some(1));
        assert_eq!(rx.recv_timeout(timeout).unwrap(), Some(3));

        let (end_tx, end_rx) = channel::bounded(1);
        cache.remove_all_with_progress_async(|_, _| {}, move |ok| end_tx.send(ok).unwrap());
        assert!(end_rx.recv_timeout(timeout).unwrap());
        assert_eq!(cache.total_count(), Some(0));
    }

    #[test]
    fn test_sweeper_applies_count_limit() {
        let dir = TempDir::new().unwrap();
        let cache: DiskCache<Vec<u8>> = DiskCache::builder_with_archiver(dir.path(), RawArchiver)
            .limits(DiskLimits {
                count_limit: 1,
                auto_trim_interval: Duration::from_millis(10),
                ..DiskLimits::default()
            })
            .build()
            .unwrap();
        cache.set("a", &vec![1]);
        cache.set("b", &vec![2]);

        for _ in 0..200 {
            if cache.total_count() == Some(1) {
                return;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        panic!("sweeper never trimmed to the count limit");
    }

    #[test]
    fn test_open_fails_on_unwritable_path() {
        let dir = TempDir::new().unwrap();
        let blocker = dir.path().join("file");
        fs::write(&blocker, b"x").unwrap();

        assert!(DiskCache::<u32>::open(blocker.join("cache")).is_err());
    }
}
