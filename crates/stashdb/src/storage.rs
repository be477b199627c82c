//! Storage engine implementation
//!
//! Directory layout:
//! - `manifest.sqlite`: one row per item, inline values included
//! - `data/`: file-backed values
//! - `trash/`: retired data directories, emptied in the background
//!
//! The manifest row is the source of truth. Files are written before their
//! row commits and deleted after their row is gone, so a crash can only leave
//! unreferenced files behind; [`KvStorage::reconcile`] removes them.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::{Mutex, MutexGuard};
use rusqlite::Connection;
use tracing::{debug, error, trace, warn};

use crate::error::{Error, Result};
use crate::files;
use crate::item::{default_filename, StorageItem, StorageType};
use crate::manifest::{self, Victim, MANIFEST_FILE};

/// Rows removed per transaction by the fit-to-limit trims
const TRIM_BATCH: usize = 16;

/// Rows removed per transaction by `remove_all_with_progress`
const PROGRESS_BATCH: usize = 32;

const DATA_DIR: &str = "data";
const TRASH_DIR: &str = "trash";

/// Outcome of a reconciliation pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Files in `data/` no row referenced
    pub orphan_files_removed: usize,
    /// Rows whose value file was missing
    pub dangling_rows_removed: usize,
}

/// KvStorage is the hybrid key-value storage handle
pub struct KvStorage {
    /// Storage root
    path: PathBuf,

    /// Value file directory
    data_path: PathBuf,

    /// Retired data directories
    trash_path: PathBuf,

    /// Value placement policy
    storage_type: StorageType,

    /// Manifest connection, `None` once closed. Every operation holds this
    /// lock, so rows and files have a single writer.
    conn: Mutex<Option<Connection>>,

    /// Report failures through `tracing`
    error_logs_enabled: AtomicBool,
}

impl KvStorage {
    /// Open or create storage at the given path
    ///
    /// # Arguments
    /// * `path` - Storage root directory
    /// * `storage_type` - Value placement policy
    ///
    /// # Returns
    /// * `Result<KvStorage>` - Storage handle; fails only if the directory
    ///   or manifest cannot be created
    pub fn open<P: AsRef<Path>>(path: P, storage_type: StorageType) -> Result<Self> {
        let path = path.as_ref();
        let data_path = path.join(DATA_DIR);
        let trash_path = path.join(TRASH_DIR);
        fs::create_dir_all(&data_path)?;
        fs::create_dir_all(&trash_path)?;

        let db_path = path.join(MANIFEST_FILE);
        let conn = match manifest::open(&db_path) {
            Ok(conn) => conn,
            Err(e) => {
                warn!("Manifest at {} unusable ({}), resetting storage", db_path.display(), e);
                Self::reset_files(path, &data_path, &trash_path)?;
                manifest::open(&db_path)?
            }
        };

        let storage = KvStorage {
            path: path.to_path_buf(),
            data_path,
            trash_path,
            storage_type,
            conn: Mutex::new(Some(conn)),
            error_logs_enabled: AtomicBool::new(true),
        };

        storage.empty_trash_in_background();
        if let Err(e) = storage.reconcile() {
            storage.report("reconcile", &e);
        }

        Ok(storage)
    }

    fn reset_files(path: &Path, data_path: &Path, trash_path: &Path) -> Result<()> {
        for suffix in ["", "-wal", "-shm"] {
            files::remove(path, &format!("{}{}", MANIFEST_FILE, suffix))?;
        }
        files::move_to_trash(data_path, trash_path)?;
        Ok(())
    }

    /// Storage root directory
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Value file directory
    pub fn data_path(&self) -> &Path {
        &self.data_path
    }

    /// Value placement policy
    pub fn storage_type(&self) -> StorageType {
        self.storage_type
    }

    /// Whether failures are logged
    pub fn error_logs_enabled(&self) -> bool {
        self.error_logs_enabled.load(Ordering::Relaxed)
    }

    /// Enable or disable failure logging; never changes behavior
    pub fn set_error_logs_enabled(&self, enabled: bool) {
        self.error_logs_enabled.store(enabled, Ordering::Relaxed);
    }

    fn report(&self, op: &str, err: &Error) {
        if self.error_logs_enabled() {
            error!("stashdb {} failed at {}: {}", op, self.path.display(), err);
        }
    }

    fn logged<T>(&self, op: &str, result: Result<T>) -> Result<T> {
        if let Err(e) = &result {
            self.report(op, e);
        }
        result
    }

    fn lock(&self) -> Result<MutexGuard<'_, Option<Connection>>> {
        let guard = self.conn.lock();
        if guard.is_none() {
            return Err(Error::Closed);
        }
        Ok(guard)
    }

    // ---------------------------------------------------------------------
    // Save
    // ---------------------------------------------------------------------

    /// Save an item, keeping its `filename` and `extended_data`
    pub fn save_item(&self, item: &StorageItem) -> Result<()> {
        self.save(
            &item.key,
            &item.value,
            item.filename.as_deref(),
            item.extended_data.as_deref(),
        )
    }

    /// Save a value with default placement and no extended data
    pub fn save_value(&self, key: &str, value: &[u8]) -> Result<()> {
        self.save(key, value, None, None)
    }

    /// Save a value
    ///
    /// # Arguments
    /// * `key` - Non-empty key
    /// * `value` - Value bytes
    /// * `filename` - Name for the value file if the value is file-backed;
    ///   derived from the key when absent
    /// * `extended_data` - Opaque data stored beside the value
    pub fn save(
        &self,
        key: &str,
        value: &[u8],
        filename: Option<&str>,
        extended_data: Option<&[u8]>,
    ) -> Result<()> {
        let result = self.save_inner(key, value, filename, extended_data);
        self.logged("save", result)
    }

    fn save_inner(
        &self,
        key: &str,
        value: &[u8],
        filename: Option<&str>,
        extended_data: Option<&[u8]>,
    ) -> Result<()> {
        if key.is_empty() {
            return Err(Error::InvalidKey);
        }
        let filename = self.placement(key, value.len(), filename)?;

        let guard = self.lock()?;
        let conn = guard.as_ref().ok_or(Error::Closed)?;

        let previous = manifest::select_filename(conn, key)?.flatten();
        let now = unix_now();
        let item = StorageItem {
            key: key.to_string(),
            value: Vec::new(),
            filename: filename.clone(),
            size: value.len() as u64,
            mod_time: now,
            access_time: now,
            extended_data: extended_data.map(<[u8]>::to_vec),
        };

        match &filename {
            Some(name) => {
                files::write_atomic(&self.data_path, name, value)?;
                if let Err(e) = manifest::upsert(conn, &item, None) {
                    if previous.as_deref() == Some(name.as_str()) {
                        // The old row now describes bytes that were replaced
                        let _ = manifest::delete(conn, key);
                    }
                    let _ = files::remove(&self.data_path, name);
                    return Err(e.into());
                }
            }
            None => manifest::upsert(conn, &item, Some(value))?,
        }

        if let Some(old) = previous {
            if filename.as_deref() != Some(old.as_str()) {
                if let Err(e) = files::remove(&self.data_path, &old) {
                    self.report("save (remove replaced file)", &Error::from(e));
                }
            }
        }
        Ok(())
    }

    fn placement(&self, key: &str, len: usize, filename: Option<&str>) -> Result<Option<String>> {
        if let Some(name) = filename {
            if !files::is_valid_filename(name) {
                return Err(Error::InvalidArgument(format!("invalid filename {:?}", name)));
            }
        }
        match self.storage_type {
            StorageType::Sqlite if filename.is_some() => Err(Error::InvalidArgument(
                "sqlite storage cannot hold file-backed values".to_string(),
            )),
            _ if self.storage_type.stores_inline(len) => Ok(None),
            _ => Ok(Some(
                filename.map(str::to_string).unwrap_or_else(|| default_filename(key)),
            )),
        }
    }

    // ---------------------------------------------------------------------
    // Get
    // ---------------------------------------------------------------------

    /// Get an item with its value, bumping its access time
    pub fn get(&self, key: &str) -> Result<Option<StorageItem>> {
        let result = (|| -> Result<_> {
            let guard = self.lock()?;
            let conn = guard.as_ref().ok_or(Error::Closed)?;
            self.get_locked(conn, key)
        })();
        self.logged("get", result)
    }

    fn get_locked(&self, conn: &Connection, key: &str) -> Result<Option<StorageItem>> {
        let mut item = match manifest::select_item(conn, key)? {
            Some(item) => item,
            None => return Ok(None),
        };

        if let Some(name) = &item.filename {
            match files::read(&self.data_path, name) {
                Ok(bytes) => item.value = bytes,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    debug!("Dropping row {:?}: value file {} is missing", key, name);
                    manifest::delete(conn, key)?;
                    return Ok(None);
                }
                Err(e) => return Err(e.into()),
            }
        }

        let now = unix_now();
        manifest::touch(conn, key, now)?;
        item.access_time = now;
        Ok(Some(item))
    }

    /// Get item metadata without the value bytes; access time is untouched
    pub fn get_info(&self, key: &str) -> Result<Option<StorageItem>> {
        let result = (|| -> Result<_> {
            let guard = self.lock()?;
            let conn = guard.as_ref().ok_or(Error::Closed)?;
            Ok(manifest::select_info(conn, key)?)
        })();
        self.logged("get_info", result)
    }

    /// Get only the value bytes, bumping the access time
    pub fn get_value(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.get(key)?.map(|item| item.value))
    }

    /// Get every present item among `keys`
    pub fn get_items(&self, keys: &[&str]) -> Result<Vec<StorageItem>> {
        let result = (|| -> Result<_> {
            let guard = self.lock()?;
            let conn = guard.as_ref().ok_or(Error::Closed)?;
            let mut items = Vec::with_capacity(keys.len());
            for key in keys {
                if let Some(item) = self.get_locked(conn, key)? {
                    items.push(item);
                }
            }
            Ok(items)
        })();
        self.logged("get_items", result)
    }

    /// Get metadata for every present item among `keys`
    pub fn get_infos(&self, keys: &[&str]) -> Result<Vec<StorageItem>> {
        let result = (|| -> Result<_> {
            let guard = self.lock()?;
            let conn = guard.as_ref().ok_or(Error::Closed)?;
            Ok(manifest::select_infos(conn, keys)?)
        })();
        self.logged("get_infos", result)
    }

    /// Get value bytes for every present item among `keys`
    pub fn get_values(&self, keys: &[&str]) -> Result<HashMap<String, Vec<u8>>> {
        Ok(self
            .get_items(keys)?
            .into_iter()
            .map(|item| (item.key, item.value))
            .collect())
    }

    /// Whether `key` has a readable value.
    ///
    /// A file-backed row whose file is gone is dropped and reported absent,
    /// the same way [`KvStorage::get`] treats it.
    pub fn exists(&self, key: &str) -> Result<bool> {
        let result = (|| -> Result<_> {
            let guard = self.lock()?;
            let conn = guard.as_ref().ok_or(Error::Closed)?;
            let name = match manifest::select_filename(conn, key)? {
                None => return Ok(false),
                Some(None) => return Ok(true),
                Some(Some(name)) => name,
            };
            if self.data_path.join(&name).is_file() {
                return Ok(true);
            }
            debug!("Dropping row {:?}: value file {} is missing", key, name);
            manifest::delete(conn, key)?;
            Ok(false)
        })();
        self.logged("exists", result)
    }

    /// Number of items
    pub fn count(&self) -> Result<u64> {
        let result = (|| -> Result<_> {
            let guard = self.lock()?;
            let conn = guard.as_ref().ok_or(Error::Closed)?;
            Ok(manifest::count(conn)?)
        })();
        self.logged("count", result)
    }

    /// Sum of all value sizes in bytes
    pub fn total_size(&self) -> Result<u64> {
        let result = (|| -> Result<_> {
            let guard = self.lock()?;
            let conn = guard.as_ref().ok_or(Error::Closed)?;
            Ok(manifest::total_size(conn)?)
        })();
        self.logged("total_size", result)
    }

    // ---------------------------------------------------------------------
    // Remove
    // ---------------------------------------------------------------------

    /// Remove one item. Removing a missing key succeeds and changes nothing.
    pub fn remove(&self, key: &str) -> Result<()> {
        let result = (|| -> Result<_> {
            let mut guard = self.lock()?;
            let conn = guard.as_mut().ok_or(Error::Closed)?;
            let filename = match manifest::select_filename(conn, key)? {
                Some(filename) => filename,
                None => return Ok(()),
            };
            self.remove_victims(
                conn,
                &[Victim {
                    key: key.to_string(),
                    filename,
                    size: 0,
                }],
            )
        })();
        self.logged("remove", result)
    }

    /// Remove every item among `keys`
    pub fn remove_batch(&self, keys: &[&str]) -> Result<()> {
        let result = (|| -> Result<_> {
            let mut guard = self.lock()?;
            let conn = guard.as_mut().ok_or(Error::Closed)?;
            let victims = manifest::select_victims_for_keys(conn, keys)?;
            self.remove_victims(conn, &victims)
        })();
        self.logged("remove_batch", result)
    }

    /// Remove items whose value is larger than `size` bytes
    pub fn remove_larger_than(&self, size: u64) -> Result<()> {
        if size == u64::MAX {
            return Ok(());
        }
        if size == 0 {
            return self.remove_all();
        }
        let result = (|| -> Result<_> {
            let mut guard = self.lock()?;
            let conn = guard.as_mut().ok_or(Error::Closed)?;
            let victims = manifest::select_larger_than(conn, size)?;
            self.remove_victims(conn, &victims)
        })();
        self.logged("remove_larger_than", result)
    }

    /// Remove items last written before `time` (epoch seconds)
    pub fn remove_older_than(&self, time: i64) -> Result<()> {
        if time <= 0 {
            return Ok(());
        }
        if time == i64::MAX {
            return self.remove_all();
        }
        let result = (|| -> Result<_> {
            let mut guard = self.lock()?;
            let conn = guard.as_mut().ok_or(Error::Closed)?;
            let victims = manifest::select_modified_before(conn, time)?;
            self.remove_victims(conn, &victims)
        })();
        self.logged("remove_older_than", result)
    }

    /// Evict least recently used items until the total size is at most `max_size`
    pub fn remove_to_fit_size(&self, max_size: u64) -> Result<()> {
        if max_size == u64::MAX {
            return Ok(());
        }
        if max_size == 0 {
            return self.remove_all();
        }
        let result = (|| -> Result<_> {
            let mut guard = self.lock()?;
            let conn = guard.as_mut().ok_or(Error::Closed)?;
            let mut total = manifest::total_size(conn)?;
            while total > max_size {
                let batch = manifest::select_lru(conn, TRIM_BATCH)?;
                if batch.is_empty() {
                    break;
                }
                let mut victims = Vec::with_capacity(batch.len());
                for victim in batch {
                    if total <= max_size {
                        break;
                    }
                    total = total.saturating_sub(victim.size);
                    victims.push(victim);
                }
                self.remove_victims(conn, &victims)?;
            }
            Ok(())
        })();
        self.logged("remove_to_fit_size", result)
    }

    /// Evict least recently used items until at most `max_count` remain
    pub fn remove_to_fit_count(&self, max_count: u64) -> Result<()> {
        if max_count == u64::MAX {
            return Ok(());
        }
        if max_count == 0 {
            return self.remove_all();
        }
        let result = (|| -> Result<_> {
            let mut guard = self.lock()?;
            let conn = guard.as_mut().ok_or(Error::Closed)?;
            let mut total = manifest::count(conn)?;
            while total > max_count {
                let excess = (total - max_count).min(TRIM_BATCH as u64) as usize;
                let victims = manifest::select_lru(conn, excess)?;
                if victims.is_empty() {
                    break;
                }
                total -= victims.len() as u64;
                self.remove_victims(conn, &victims)?;
            }
            Ok(())
        })();
        self.logged("remove_to_fit_count", result)
    }

    /// Remove every item.
    ///
    /// Rows are deleted in one statement and the data directory is swapped
    /// for an empty one; the old files are deleted on a background thread.
    pub fn remove_all(&self) -> Result<()> {
        let result = (|| -> Result<_> {
            let guard = self.lock()?;
            let conn = guard.as_ref().ok_or(Error::Closed)?;
            manifest::delete_all(conn)?;
            files::move_to_trash(&self.data_path, &self.trash_path)?;
            Ok(())
        })();
        if result.is_ok() {
            self.empty_trash_in_background();
        }
        self.logged("remove_all", result)
    }

    /// Remove every item in batches, reporting `(removed, total)` after each
    pub fn remove_all_with_progress<F>(&self, mut progress: F) -> Result<()>
    where
        F: FnMut(u64, u64),
    {
        let result = (|| -> Result<_> {
            let mut guard = self.lock()?;
            let conn = guard.as_mut().ok_or(Error::Closed)?;
            let total = manifest::count(conn)?;
            let mut removed = 0;
            loop {
                let victims = manifest::select_lru(conn, PROGRESS_BATCH)?;
                if victims.is_empty() {
                    break;
                }
                self.remove_victims(conn, &victims)?;
                removed += victims.len() as u64;
                progress(removed.min(total), total);
            }
            Ok(())
        })();
        self.logged("remove_all_with_progress", result)
    }

    /// Delete rows in one transaction, then their files
    fn remove_victims(&self, conn: &mut Connection, victims: &[Victim]) -> Result<()> {
        if victims.is_empty() {
            return Ok(());
        }
        let tx = conn.transaction()?;
        for victim in victims {
            manifest::delete(&tx, &victim.key)?;
        }
        tx.commit()?;

        for victim in victims {
            trace!("Removed {:?} ({} bytes)", victim.key, victim.size);
            if let Some(name) = &victim.filename {
                // A leftover file is an orphan for the next reconcile pass
                if let Err(e) = files::remove(&self.data_path, name) {
                    self.report("remove file", &Error::from(e));
                }
            }
        }
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Maintenance
    // ---------------------------------------------------------------------

    /// Delete files no row references and rows whose file is missing
    pub fn reconcile(&self) -> Result<ReconcileReport> {
        let result = (|| -> Result<_> {
            let mut guard = self.lock()?;
            let conn = guard.as_mut().ok_or(Error::Closed)?;

            let refs = manifest::select_file_refs(conn)?;
            let on_disk: HashSet<String> = files::list(&self.data_path)?.into_iter().collect();
            let referenced: HashSet<&str> = refs.iter().map(|(_, name)| name.as_str()).collect();

            let mut report = ReconcileReport::default();
            for name in on_disk.iter().filter(|name| !referenced.contains(name.as_str())) {
                files::remove(&self.data_path, name)?;
                report.orphan_files_removed += 1;
            }

            let dangling: Vec<&str> = refs
                .iter()
                .filter(|(_, name)| !on_disk.contains(name))
                .map(|(key, _)| key.as_str())
                .collect();
            if !dangling.is_empty() {
                let tx = conn.transaction()?;
                for key in &dangling {
                    manifest::delete(&tx, key)?;
                }
                tx.commit()?;
                report.dangling_rows_removed = dangling.len();
            }

            if report != ReconcileReport::default() {
                debug!(
                    "Reconciled {}: {} orphan files, {} dangling rows",
                    self.path.display(),
                    report.orphan_files_removed,
                    report.dangling_rows_removed
                );
            }
            Ok(report)
        })();
        self.logged("reconcile", result)
    }

    fn empty_trash_in_background(&self) {
        let trash = self.trash_path.clone();
        let spawned = std::thread::Builder::new()
            .name("stashdb-trash".to_string())
            .spawn(move || files::empty_trash(&trash));
        if spawned.is_err() {
            files::empty_trash(&self.trash_path);
        }
    }

    /// Checkpoint the manifest and release the connection
    pub fn close(&self) -> Result<()> {
        let mut guard = self.conn.lock();
        if let Some(conn) = guard.take() {
            if let Err(e) = conn.query_row("PRAGMA wal_checkpoint(TRUNCATE)", [], |_| Ok(())) {
                self.report("close", &Error::from(e));
            }
            conn.close().map_err(|(_, e)| Error::from(e))?;
        }
        Ok(())
    }
}

impl Drop for KvStorage {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

/// Current time in epoch seconds
pub(crate) fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
