//! Limit configuration for both tiers
//!
//! Limits may change at any time; each trim pass reads them fresh.
//! Durations serialize as (fractional) seconds.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Memory tier limits
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryLimits {
    /// Maximum number of entries
    pub count_limit: usize,
    /// Maximum sum of entry costs
    pub cost_limit: u64,
    /// Maximum time since an entry was last touched
    #[serde(with = "secs")]
    pub age_limit: Duration,
    /// Sweep cadence; zero disables the sweeper
    #[serde(with = "secs")]
    pub auto_trim_interval: Duration,
}

impl Default for MemoryLimits {
    fn default() -> Self {
        Self {
            count_limit: usize::MAX,
            cost_limit: u64::MAX,
            age_limit: Duration::MAX,
            auto_trim_interval: Duration::from_secs(5),
        }
    }
}

/// Disk tier limits
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiskLimits {
    /// Maximum number of items
    pub count_limit: u64,
    /// Maximum sum of value sizes in bytes
    pub cost_limit: u64,
    /// Maximum time since an item was last written
    #[serde(with = "secs")]
    pub age_limit: Duration,
    /// Free bytes the volume should keep; best effort, zero disables
    pub free_disk_space_limit: u64,
    /// Sweep cadence; zero disables the sweeper
    #[serde(with = "secs")]
    pub auto_trim_interval: Duration,
    /// Also remove orphan files and dangling rows on each sweep
    pub reconcile_on_auto_trim: bool,
}

impl Default for DiskLimits {
    fn default() -> Self {
        Self {
            count_limit: u64::MAX,
            cost_limit: u64::MAX,
            age_limit: Duration::MAX,
            free_disk_space_limit: 0,
            auto_trim_interval: Duration::from_secs(60),
            reconcile_on_auto_trim: false,
        }
    }
}

mod secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(d.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(d)?;
        if secs.is_sign_negative() || secs.is_nan() {
            return Err(serde::de::Error::custom("duration must be non-negative seconds"));
        }
        // Anything past the representable range means "no limit"
        Ok(Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX))
    }
}
