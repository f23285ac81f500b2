use std::hash::Hash;
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;

use super::entry::CacheEntry;
use super::metrics::CacheMetrics;
use crate::config::CacheSettings;

/// Concurrency-safe key/value store; the single source of truth for
/// hits and misses.
pub struct CacheStore<K, V> {
    entries: DashMap<K, CacheEntry<V>>,
    settings: CacheSettings,
    metrics: Arc<CacheMetrics>,
    epoch: Instant,
}

impl<K, V> CacheStore<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new(settings: CacheSettings, metrics: Arc<CacheMetrics>) -> Self {
        Self {
            entries: DashMap::new(),
            settings,
            metrics,
            epoch: Instant::now(),
        }
    }

    /// Look a key up, refreshing its last-access time on a hit.
    ///
    /// An entry past its absolute expiration reads as a miss but is left in
    /// place; the purge sweep owns proactive removal, so the read path never
    /// writes to the map.
    pub fn try_get(&self, key: &K) -> Option<V> {
        if let Some(entry) = self.entries.get(key) {
            if entry.age() <= self.settings.absolute_expiration {
                entry.touch(self.epoch);
                self.metrics.record_hit();
                return Some(entry.value().value().clone());
            }
        }
        self.metrics.record_miss();
        None
    }

    /// Unmetered lookup for internal double-checks.
    pub fn peek(&self, key: &K) -> Option<V> {
        self.entries.get(key).and_then(|entry| {
            if entry.age() <= self.settings.absolute_expiration {
                entry.touch(self.epoch);
                Some(entry.value().value().clone())
            } else {
                None
            }
        })
    }

    pub fn insert(&self, key: K, value: V) {
        self.entries.insert(key, CacheEntry::new(value, self.epoch));
    }

    pub fn remove(&self, key: &K) -> bool {
        self.entries.remove(key).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&self) {
        self.entries.clear();
    }

    /// One eviction sweep. Removes entries that are idle past the unused
    /// threshold or older than the absolute expiration, then trims the
    /// least-recently-accessed entries down to `max_items` when a cap is
    /// configured. Returns the number of entries evicted.
    pub fn purge(&self) -> usize {
        let mut evicted = 0usize;
        self.entries.retain(|_, entry| {
            let dead = entry.age() > self.settings.absolute_expiration
                || entry.idle_for(self.epoch) > self.settings.unused_threshold;
            if dead {
                evicted += 1;
            }
            !dead
        });

        if let Some(max_items) = self.settings.max_items {
            let excess = self.entries.len().saturating_sub(max_items);
            if excess > 0 {
                let mut by_access: Vec<(K, u64)> = self.entries
                    .iter()
                    .map(|entry| (entry.key().clone(), entry.value().last_accessed_ms()))
                    .collect();
                by_access.sort_by_key(|(_, accessed_ms)| *accessed_ms);

                for (key, _) in by_access.into_iter().take(excess) {
                    if self.entries.remove(&key).is_some() {
                        evicted += 1;
                    }
                }
            }
        }

        evicted
    }
}
