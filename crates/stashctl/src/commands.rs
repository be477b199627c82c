//! Operator commands over one cache directory

use std::io::Write;
use std::path::Path;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use stashcache::{DiskCache, DiskLimits, RawArchiver};
use stashdb::{StorageItem, StorageType};
use tracing::info;

/// Summary printed by `info`
#[derive(Debug, Serialize)]
pub struct Info {
    pub path: String,
    pub storage_type: String,
    pub inline_threshold: Option<usize>,
    pub count: u64,
    pub total_size: u64,
}

/// Metadata printed by `inspect`
#[derive(Debug, Serialize)]
pub struct ItemInfo {
    pub key: String,
    pub size: u64,
    pub filename: Option<String>,
    pub modified: Option<String>,
    pub accessed: Option<String>,
    pub extended_data_len: Option<usize>,
}

impl From<StorageItem> for ItemInfo {
    fn from(item: StorageItem) -> Self {
        Self {
            size: item.size,
            filename: item.filename,
            modified: timestamp(item.mod_time),
            accessed: timestamp(item.access_time),
            extended_data_len: item.extended_data.map(|d| d.len()),
            key: item.key,
        }
    }
}

fn timestamp(secs: i64) -> Option<String> {
    DateTime::<Utc>::from_timestamp(secs, 0).map(|t| t.to_rfc3339())
}

/// Limits applied by `trim`; absent targets are skipped
#[derive(Debug, Default)]
pub struct TrimTargets {
    pub count: Option<u64>,
    pub cost: Option<u64>,
    pub age: Option<u64>,
    pub free_space: Option<u64>,
}

pub struct Operator {
    cache: DiskCache<Vec<u8>>,
}

impl Operator {
    pub fn open(path: &Path, threshold: usize) -> Result<Self> {
        let cache = DiskCache::builder_with_archiver(path, RawArchiver)
            .inline_threshold(threshold)
            .worker_lanes(1)
            .limits(DiskLimits {
                auto_trim_interval: Duration::ZERO,
                ..DiskLimits::default()
            })
            .build()
            .with_context(|| format!("Failed to open cache at {}", path.display()))?;
        Ok(Self { cache })
    }

    pub fn info(&self) -> Result<Value> {
        let storage = self.cache.storage();
        let (storage_type, inline_threshold) = match storage.storage_type() {
            StorageType::File => ("file", None),
            StorageType::Sqlite => ("sqlite", None),
            StorageType::Mixed { inline_threshold } => ("mixed", Some(inline_threshold)),
        };
        let info = Info {
            path: storage.path().display().to_string(),
            storage_type: storage_type.to_string(),
            inline_threshold,
            count: storage.count()?,
            total_size: storage.total_size()?,
        };
        Ok(serde_json::to_value(info)?)
    }

    pub fn inspect(&self, keys: &[String]) -> Result<Value> {
        let keys: Vec<&str> = keys.iter().map(String::as_str).collect();
        let items: Vec<ItemInfo> = self
            .cache
            .storage()
            .get_infos(&keys)?
            .into_iter()
            .map(ItemInfo::from)
            .collect();
        Ok(serde_json::to_value(items)?)
    }

    pub fn get(&self, key: &str, output: Option<&Path>) -> Result<()> {
        let value = self
            .cache
            .get(key)
            .ok_or_else(|| anyhow!("No value for key {:?}", key))?;
        match output {
            Some(path) => std::fs::write(path, &value)
                .with_context(|| format!("Failed to write {}", path.display()))?,
            None => std::io::stdout().lock().write_all(&value)?,
        }
        Ok(())
    }

    pub fn put(&self, key: &str, value: Vec<u8>, extended: Option<Vec<u8>>) -> Result<Value> {
        if !self
            .cache
            .set_with_extended_data(key, &value, extended.as_deref())
        {
            bail!("Failed to store {:?}", key);
        }
        info!("Stored {:?} ({} bytes)", key, value.len());
        Ok(json!({ "key": key, "size": value.len() }))
    }

    pub fn remove(&self, keys: &[String]) -> Result<Value> {
        let keys: Vec<&str> = keys.iter().map(String::as_str).collect();
        self.cache.storage().remove_batch(&keys)?;
        Ok(json!({ "removed": keys }))
    }

    pub fn trim(&self, targets: TrimTargets) -> Result<Value> {
        let before = self.cache.total_count().unwrap_or(0);
        let mut ok = true;
        if let Some(age) = targets.age {
            ok &= self.cache.trim_to_age(Duration::from_secs(age));
        }
        if let Some(count) = targets.count {
            ok &= self.cache.trim_to_count(count);
        }
        if let Some(cost) = targets.cost {
            ok &= self.cache.trim_to_cost(cost);
        }
        if let Some(free_space) = targets.free_space {
            ok &= self.cache.trim_to_free_space(free_space);
        }
        if !ok {
            bail!("Trim failed; see the log for details");
        }
        let after = self.cache.total_count().unwrap_or(0);
        Ok(json!({ "removed": before.saturating_sub(after), "remaining": after }))
    }

    pub fn reconcile(&self) -> Result<Value> {
        let report = self.cache.storage().reconcile()?;
        Ok(json!({
            "orphan_files_removed": report.orphan_files_removed,
            "dangling_rows_removed": report.dangling_rows_removed,
        }))
    }

    pub fn clear(&self, progress: bool) -> Result<Value> {
        let storage = self.cache.storage();
        let count = storage.count()?;
        if progress {
            storage.remove_all_with_progress(|removed, total| {
                eprintln!("removed {}/{}", removed, total);
            })?;
        } else {
            storage.remove_all()?;
        }
        Ok(json!({ "removed": count }))
    }
}
