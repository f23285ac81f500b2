/// Cache policy per entity type
///
/// Expirations and capacities tuned for different use cases:
/// - Price lookups: short TTL, small cap (quotes go stale in seconds)
/// - Portfolio snapshots: short TTL, one entry per tracked account
/// - Backtest results: long TTL (expensive to recompute, stable once done)

use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{ CacheError, CacheResult };

/// Default capacity of the change-notification queue.
const DEFAULT_CHANGE_QUEUE_CAPACITY: usize = 256;

/// Immutable per-instance cache policy, fixed at construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheSettings {
    /// Maximum entry age regardless of access; older entries read as misses.
    pub absolute_expiration: Duration,

    /// Entries idle longer than this are evicted by the purge sweep.
    pub unused_threshold: Duration,

    /// How often the purge sweep runs.
    pub purge_interval: Duration,

    /// Maximum number of entries (LRU trim when exceeded); `None` = no cap.
    pub max_items: Option<usize>,

    /// Bounded capacity of the change-notification queue.
    pub change_queue_capacity: usize,
}

impl CacheSettings {
    /// Current stock price lookups.
    pub fn price_lookups() -> Self {
        Self {
            absolute_expiration: Duration::from_secs(30),
            unused_threshold: Duration::from_secs(15),
            purge_interval: Duration::from_secs(10),
            max_items: Some(100),
            change_queue_capacity: DEFAULT_CHANGE_QUEUE_CAPACITY,
        }
    }

    /// Per-account portfolio snapshots.
    pub fn portfolio_snapshots() -> Self {
        Self {
            absolute_expiration: Duration::from_secs(30),
            unused_threshold: Duration::from_secs(15),
            purge_interval: Duration::from_secs(10),
            max_items: Some(50),
            change_queue_capacity: DEFAULT_CHANGE_QUEUE_CAPACITY,
        }
    }

    /// Backtest results (expensive to compute, stable once produced).
    pub fn backtest_results() -> Self {
        Self {
            absolute_expiration: Duration::from_secs(2 * 60 * 60),
            unused_threshold: Duration::from_secs(30 * 60),
            purge_interval: Duration::from_secs(5 * 60),
            max_items: Some(200),
            change_queue_capacity: DEFAULT_CHANGE_QUEUE_CAPACITY,
        }
    }

    /// Custom policy.
    pub fn custom(
        absolute_expiration: Duration,
        unused_threshold: Duration,
        purge_interval: Duration,
        max_items: Option<usize>,
    ) -> Self {
        Self {
            absolute_expiration,
            unused_threshold,
            purge_interval,
            max_items,
            change_queue_capacity: DEFAULT_CHANGE_QUEUE_CAPACITY,
        }
    }

    /// Check the policy for values that would break the background loops.
    pub fn validate(&self) -> CacheResult<()> {
        if self.purge_interval.is_zero() {
            return Err(CacheError::Config("purge_interval must be non-zero".to_string()));
        }
        if self.absolute_expiration.is_zero() {
            return Err(CacheError::Config("absolute_expiration must be non-zero".to_string()));
        }
        if self.unused_threshold.is_zero() {
            return Err(CacheError::Config("unused_threshold must be non-zero".to_string()));
        }
        if self.change_queue_capacity == 0 {
            return Err(CacheError::Config("change_queue_capacity must be at least 1".to_string()));
        }
        if self.max_items == Some(0) {
            return Err(CacheError::Config("max_items of 0 would evict every entry".to_string()));
        }
        Ok(())
    }

    /// Load a policy from a JSON settings file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> CacheResult<Self> {
        let data = fs
            ::read_to_string(&path)
            .map_err(|e|
                CacheError::Config(
                    format!("failed to read {}: {}", path.as_ref().display(), e)
                )
            )?;
        let raw: RawCacheSettings = serde_json
            ::from_str(&data)
            .map_err(|e| CacheError::Config(format!("invalid cache settings: {}", e)))?;

        let settings = Self {
            absolute_expiration: Duration::from_secs(raw.absolute_expiration_secs),
            unused_threshold: Duration::from_secs(raw.unused_threshold_secs),
            purge_interval: Duration::from_secs(raw.purge_interval_secs),
            max_items: raw.max_items,
            change_queue_capacity: raw.change_queue_capacity,
        };
        settings.validate()?;
        Ok(settings)
    }
}

/// On-disk schema for [`CacheSettings::from_file`].
#[derive(Debug, Clone, Deserialize)]
struct RawCacheSettings {
    absolute_expiration_secs: u64,
    unused_threshold_secs: u64,
    purge_interval_secs: u64,
    #[serde(default)]
    max_items: Option<usize>,
    #[serde(default = "default_change_queue_capacity")]
    change_queue_capacity: usize,
}

fn default_change_queue_capacity() -> usize {
    DEFAULT_CHANGE_QUEUE_CAPACITY
}
