//! Value archiving for the disk tier

use std::marker::PhantomData;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;

/// Turns values into bytes and back. A failed unarchive is a cache miss.
pub trait Archiver<V>: Send + Sync {
    /// Encode a value; `None` skips the write
    fn archive(&self, value: &V) -> Option<Vec<u8>>;

    /// Decode bytes produced by [`Archiver::archive`]
    fn unarchive(&self, bytes: &[u8]) -> Option<V>;
}

/// Default archiver: `bincode` over `serde`
#[derive(Debug, Clone, Copy, Default)]
pub struct BincodeArchiver;

impl<V> Archiver<V> for BincodeArchiver
where
    V: Serialize + DeserializeOwned,
{
    fn archive(&self, value: &V) -> Option<Vec<u8>> {
        bincode::serialize(value)
            .map_err(|e| tracing::debug!("bincode archive failed: {}", e))
            .ok()
    }

    fn unarchive(&self, bytes: &[u8]) -> Option<V> {
        bincode::deserialize(bytes)
            .map_err(|e| tracing::debug!("bincode unarchive failed: {}", e))
            .ok()
    }
}

/// Stores byte values as-is
#[derive(Debug, Clone, Copy, Default)]
pub struct RawArchiver;

impl Archiver<Vec<u8>> for RawArchiver {
    fn archive(&self, value: &Vec<u8>) -> Option<Vec<u8>> {
        Some(value.clone())
    }

    fn unarchive(&self, bytes: &[u8]) -> Option<Vec<u8>> {
        Some(bytes.to_vec())
    }
}

/// Archiver built from a pair of closures
pub struct FnArchiver<V, E, D> {
    encode: E,
    decode: D,
    _value: PhantomData<fn() -> V>,
}

impl<V, E, D> FnArchiver<V, E, D>
where
    E: Fn(&V) -> Option<Vec<u8>> + Send + Sync,
    D: Fn(&[u8]) -> Option<V> + Send + Sync,
{
    /// Wrap an encode/decode pair
    pub fn new(encode: E, decode: D) -> Self {
        Self {
            encode,
            decode,
            _value: PhantomData,
        }
    }
}

impl<V, E, D> Archiver<V> for FnArchiver<V, E, D>
where
    E: Fn(&V) -> Option<Vec<u8>> + Send + Sync,
    D: Fn(&[u8]) -> Option<V> + Send + Sync,
{
    fn archive(&self, value: &V) -> Option<Vec<u8>> {
        (self.encode)(value)
    }

    fn unarchive(&self, bytes: &[u8]) -> Option<V> {
        (self.decode)(bytes)
    }
}

/// Maps a key to the name of its value file
pub type FilenameFn = Arc<dyn Fn(&str) -> String + Send + Sync>;
