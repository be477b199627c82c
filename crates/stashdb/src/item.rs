//! Item and placement types

use sha2::{Digest, Sha256};

/// A stored item as recorded in the manifest
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StorageItem {
    /// Unique, non-empty key
    pub key: String,
    /// Value bytes (empty for info-only reads)
    pub value: Vec<u8>,
    /// Name of the value file under `data/`, present iff the value is file-backed
    pub filename: Option<String>,
    /// Byte length of the value
    pub size: u64,
    /// Last write, epoch seconds
    pub mod_time: i64,
    /// Last successful read or write, epoch seconds
    pub access_time: i64,
    /// Opaque caller data stored beside the value
    pub extended_data: Option<Vec<u8>>,
}

impl StorageItem {
    /// Build an item for saving
    pub fn new(key: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        let value = value.into();
        Self {
            key: key.into(),
            size: value.len() as u64,
            value,
            ..Default::default()
        }
    }

    /// Whether the value lives in a loose file
    pub fn is_file_backed(&self) -> bool {
        self.filename.is_some()
    }
}

/// Where values are placed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageType {
    /// Every value is a loose file
    File,
    /// Every value is stored inline in the manifest
    Sqlite,
    /// Values up to `inline_threshold` bytes inline, larger ones in files
    Mixed {
        /// Largest value size kept inline
        inline_threshold: usize,
    },
}

impl StorageType {
    /// Pick the storage type for an inline threshold.
    ///
    /// `0` means every value goes to a file, `usize::MAX` means none does.
    pub fn for_threshold(inline_threshold: usize) -> Self {
        match inline_threshold {
            0 => StorageType::File,
            usize::MAX => StorageType::Sqlite,
            inline_threshold => StorageType::Mixed { inline_threshold },
        }
    }

    /// Whether a value of `len` bytes is stored inline
    pub fn stores_inline(&self, len: usize) -> bool {
        match *self {
            StorageType::File => false,
            StorageType::Sqlite => true,
            StorageType::Mixed { inline_threshold } => len <= inline_threshold,
        }
    }

    /// The largest inline value size
    pub fn inline_threshold(&self) -> usize {
        match *self {
            StorageType::File => 0,
            StorageType::Sqlite => usize::MAX,
            StorageType::Mixed { inline_threshold } => inline_threshold,
        }
    }
}

/// Deterministic value filename for a key: lowercase hex SHA-256.
pub fn default_filename(key: &str) -> String {
    hex::encode(Sha256::digest(key.as_bytes()))
}
