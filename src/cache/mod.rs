//! Read-through entity cache.
//!
//! `EntityCache` serves bounded-staleness reads in front of a slow backing
//! store. Misses are resolved through the caller-supplied [`EntityFetcher`];
//! concurrent misses for the same key are collapsed into a single fetch. A
//! background purge loop ages entries out on idle time, absolute expiration
//! and capacity pressure, and a single-consumer change worker applies
//! asynchronous invalidation signals against the store. Both loops start at
//! construction and stop at [`EntityCache::shutdown`]; the cache is an
//! explicit service object owned by its composition root.

mod entry;
mod inflight;
mod metrics;
mod purge;
mod store;

pub mod changes;
pub mod fetch;

// Re-export public interfaces
pub use changes::{ ChangeNotification, ChangeType };
pub use fetch::EntityFetcher;

use std::collections::{ HashMap, HashSet };
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::Arc;
use std::sync::atomic::{ AtomicBool, Ordering };

use chrono::{ DateTime, Utc };
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use self::changes::ChangeQueue;
use self::inflight::{ InflightTable, Ticket };
use self::metrics::CacheMetrics;
use self::store::CacheStore;
use crate::config::CacheSettings;
use crate::error::{ CacheError, CacheResult };

// =============================================================================
// STATISTICS
// =============================================================================

/// Point-in-time cache statistics.
#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub dropped_notifications: u64,
    pub items: usize,
    pub sampled_at: DateTime<Utc>,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            (self.hits as f64) / (total as f64)
        }
    }
}

// =============================================================================
// CACHE FACADE
// =============================================================================

/// Read-through cache over a backing store, generic over key/value types.
///
/// Construction validates the policy and spawns the purge loop and the
/// change worker, so it must happen inside a tokio runtime.
pub struct EntityCache<K, V>
where
    K: Eq + Hash + Send + Sync,
    V: Send,
{
    store: Arc<CacheStore<K, V>>,
    inflight: InflightTable<K, V>,
    metrics: Arc<CacheMetrics>,
    queue: Arc<ChangeQueue<K>>,
    fetcher: Arc<dyn EntityFetcher<K, V>>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    disposed: AtomicBool,
}

impl<K, V> EntityCache<K, V>
where
    K: Eq + Hash + Clone + Debug + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// Create a cache with the given policy and start its background loops.
    pub fn new(
        settings: CacheSettings,
        fetcher: Arc<dyn EntityFetcher<K, V>>
    ) -> CacheResult<Self> {
        settings.validate()?;

        let metrics = Arc::new(CacheMetrics::default());
        let store = Arc::new(CacheStore::new(settings.clone(), Arc::clone(&metrics)));
        let queue = Arc::new(ChangeQueue::new(settings.change_queue_capacity));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let tasks = vec![
            tokio::spawn(
                purge::run_purge_loop(
                    Arc::clone(&store),
                    Arc::clone(&metrics),
                    settings.purge_interval,
                    shutdown_rx.clone()
                )
            ),
            tokio::spawn(
                changes::run_change_worker(
                    Arc::clone(&store),
                    Arc::clone(&queue),
                    Arc::clone(&fetcher),
                    shutdown_rx
                )
            )
        ];

        log::info!(
            "entity cache started (expiration {:?}, idle threshold {:?}, purge every {:?}, max items {:?})",
            settings.absolute_expiration,
            settings.unused_threshold,
            settings.purge_interval,
            settings.max_items
        );

        Ok(Self {
            store,
            inflight: InflightTable::new(),
            metrics,
            queue,
            fetcher,
            shutdown_tx,
            tasks: Mutex::new(tasks),
            disposed: AtomicBool::new(false),
        })
    }

    /// Get the value for `key`, fetching it from the backing store on a miss.
    ///
    /// Concurrent callers for the same uncached key share one fetch: the
    /// first caller runs it, the rest await the same outcome. A failed fetch
    /// is delivered to every caller currently waiting on it and then clears
    /// the slot, so the next call retries instead of replaying the failure.
    pub async fn get(&self, key: K) -> CacheResult<V> {
        loop {
            if self.disposed.load(Ordering::Acquire) {
                return Err(CacheError::Disposed);
            }
            if let Some(value) = self.store.try_get(&key) {
                return Ok(value);
            }
            match self.inflight.join_or_lead(key.clone()) {
                Ticket::Leader(lease) => {
                    // Another caller may have finished between our store
                    // check and taking the lead.
                    if let Some(value) = self.store.peek(&key) {
                        lease.complete(Ok(Some(value.clone())));
                        return Ok(value);
                    }
                    let outcome = match self.fetcher.fetch_one(&key).await {
                        Ok(Some(value)) => {
                            self.store.insert(key.clone(), value.clone());
                            Ok(Some(value))
                        }
                        Ok(None) => Ok(None),
                        Err(e) => Err(e),
                    };
                    lease.complete(outcome.clone());
                    return match outcome {
                        Ok(Some(value)) => Ok(value),
                        Ok(None) => Err(CacheError::NotFound(format!("{:?}", key))),
                        Err(e) => Err(e),
                    };
                }
                Ticket::Waiter(mut rx) => {
                    match rx.recv().await {
                        Ok(Ok(Some(value))) => return Ok(value),
                        Ok(Ok(None)) => return Err(CacheError::NotFound(format!("{:?}", key))),
                        Ok(Err(e)) => return Err(e),
                        // The fetch we joined vanished without an outcome;
                        // start over.
                        Err(_) => continue,
                    }
                }
            }
        }
    }

    /// Get values for a set of keys, fetching the still-uncached remainder
    /// with a single batch call.
    ///
    /// Keys the backing store has no value for are omitted from the result;
    /// a partial miss is never an error. A failed batch fetch is delivered
    /// to every caller sharing the affected keys.
    pub async fn get_many(&self, keys: &[K]) -> CacheResult<HashMap<K, V>> {
        if self.disposed.load(Ordering::Acquire) {
            return Err(CacheError::Disposed);
        }

        let mut found = HashMap::new();
        let mut waiters = Vec::new();
        let mut leases = Vec::new();
        let mut seen = HashSet::new();

        for key in keys {
            if !seen.insert(key.clone()) {
                continue;
            }
            if let Some(value) = self.store.try_get(key) {
                found.insert(key.clone(), value);
                continue;
            }
            match self.inflight.join_or_lead(key.clone()) {
                Ticket::Leader(lease) => {
                    if let Some(value) = self.store.peek(key) {
                        lease.complete(Ok(Some(value.clone())));
                        found.insert(key.clone(), value);
                    } else {
                        leases.push((key.clone(), lease));
                    }
                }
                Ticket::Waiter(rx) => waiters.push((key.clone(), rx)),
            }
        }

        if !leases.is_empty() {
            let leader_keys: Vec<K> = leases
                .iter()
                .map(|(key, _)| key.clone())
                .collect();
            match self.fetcher.fetch_many(&leader_keys).await {
                Ok(mut values) => {
                    for (key, lease) in leases {
                        match values.remove(&key) {
                            Some(value) => {
                                self.store.insert(key.clone(), value.clone());
                                lease.complete(Ok(Some(value.clone())));
                                found.insert(key, value);
                            }
                            // Absent from the batch result: not found, and
                            // nothing is inserted.
                            None => lease.complete(Ok(None)),
                        }
                    }
                }
                Err(e) => {
                    for (_, lease) in leases {
                        lease.complete(Err(e.clone()));
                    }
                    return Err(e);
                }
            }
        }

        for (key, mut rx) in waiters {
            match rx.recv().await {
                Ok(Ok(Some(value))) => {
                    found.insert(key, value);
                }
                Ok(Ok(None)) => {}
                Ok(Err(e)) => return Err(e),
                // The fetch we joined vanished; fall back to a direct get.
                Err(_) => {
                    match self.get(key.clone()).await {
                        Ok(value) => {
                            found.insert(key, value);
                        }
                        Err(CacheError::NotFound(_)) => {}
                        Err(e) => return Err(e),
                    }
                }
            }
        }

        Ok(found)
    }

    /// Full enumeration of cached values.
    ///
    /// Not supported in the current design; always fails with
    /// [`CacheError::NotImplemented`]. None of the configured caches need
    /// enumeration, and the keys of a read-through cache are not an
    /// authoritative listing of the backing store.
    pub async fn get_all(&self) -> CacheResult<Vec<V>> {
        Err(CacheError::NotImplemented("get_all"))
    }

    /// Queue an invalidation signal for the change worker.
    ///
    /// Fire-and-forget: the call never blocks, and under sustained overflow
    /// the oldest pending notification is silently dropped.
    pub fn notify_changed(&self, keys: Vec<K>, change: ChangeType) {
        if keys.is_empty() {
            return;
        }
        self.queue.push(ChangeNotification { keys, change });
    }

    /// Stop both background loops and clear the cache. Safe to call more
    /// than once; in-flight fetches complete or fail on their own.
    pub async fn shutdown(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        log::info!("shutting down entity cache");

        self.queue.close();
        let _ = self.shutdown_tx.send(true);

        let handles: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for handle in handles {
            let _ = handle.await;
        }

        self.store.clear();
        self.inflight.clear();
    }

    /// Sample the current statistics.
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.metrics.hits(),
            misses: self.metrics.misses(),
            evictions: self.metrics.evictions(),
            dropped_notifications: self.queue.dropped(),
            items: self.store.len(),
            sampled_at: Utc::now(),
        }
    }

    pub fn len(&self) -> usize {
        self.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }
}

impl<K, V> Drop for EntityCache<K, V>
where
    K: Eq + Hash + Send + Sync,
    V: Send,
{
    fn drop(&mut self) {
        // A cache dropped without shutdown() must not leave its loops running.
        for handle in self.tasks.lock().drain(..) {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tokio::time::sleep;

    struct TestBackingStore {
        values: Mutex<HashMap<String, i64>>,
        batches: AtomicUsize,
        keys_fetched: Mutex<Vec<String>>,
        delay: Duration,
        fail_next: AtomicBool,
    }

    impl TestBackingStore {
        fn new(pairs: &[(&str, i64)]) -> Arc<Self> {
            Self::with_delay(pairs, Duration::ZERO)
        }

        fn with_delay(pairs: &[(&str, i64)], delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                values: Mutex::new(
                    pairs
                        .iter()
                        .map(|(key, value)| (key.to_string(), *value))
                        .collect()
                ),
                batches: AtomicUsize::new(0),
                keys_fetched: Mutex::new(Vec::new()),
                delay,
                fail_next: AtomicBool::new(false),
            })
        }

        fn set(&self, key: &str, value: i64) {
            self.values.lock().insert(key.to_string(), value);
        }

        fn batches(&self) -> usize {
            self.batches.load(Ordering::SeqCst)
        }

        fn keys_fetched(&self) -> usize {
            self.keys_fetched.lock().len()
        }

        fn fail_next(&self) {
            self.fail_next.store(true, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl EntityFetcher<String, i64> for TestBackingStore {
        async fn fetch_many(&self, keys: &[String]) -> CacheResult<HashMap<String, i64>> {
            self.batches.fetch_add(1, Ordering::SeqCst);
            self.keys_fetched.lock().extend(keys.iter().cloned());
            if !self.delay.is_zero() {
                sleep(self.delay).await;
            }
            if self.fail_next.swap(false, Ordering::SeqCst) {
                return Err(CacheError::Fetch("backing store offline".to_string()));
            }
            let values = self.values.lock();
            Ok(
                keys
                    .iter()
                    .filter_map(|key| values.get(key).map(|value| (key.clone(), *value)))
                    .collect()
            )
        }
    }

    fn quiet_settings() -> CacheSettings {
        CacheSettings::custom(
            Duration::from_secs(60),
            Duration::from_secs(60),
            Duration::from_secs(60),
            None
        )
    }

    fn new_cache(
        backing: Arc<TestBackingStore>,
        settings: CacheSettings
    ) -> EntityCache<String, i64> {
        let fetcher: Arc<dyn EntityFetcher<String, i64>> = backing;
        EntityCache::new(settings, fetcher).unwrap()
    }

    #[tokio::test]
    async fn test_get_serves_from_store_after_first_fetch() {
        let backing = TestBackingStore::new(&[("AAPL", 187)]);
        let cache = new_cache(Arc::clone(&backing), quiet_settings());

        assert_eq!(cache.get("AAPL".to_string()).await.unwrap(), 187);
        assert_eq!(cache.get("AAPL".to_string()).await.unwrap(), 187);
        assert_eq!(backing.batches(), 1);

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.items, 1);
        assert!((stats.hit_rate() - 0.5).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_get_missing_key_is_not_found() {
        let backing = TestBackingStore::new(&[]);
        let cache = new_cache(Arc::clone(&backing), quiet_settings());

        match cache.get("GOOG".to_string()).await {
            Err(CacheError::NotFound(key)) => assert!(key.contains("GOOG")),
            other => panic!("expected NotFound, got {:?}", other),
        }
        // A not-found is not cached.
        assert_eq!(cache.len(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_single_flight_collapses_concurrent_gets() {
        let backing = TestBackingStore::with_delay(&[("AAPL", 187)], Duration::from_millis(50));
        let cache = Arc::new(new_cache(Arc::clone(&backing), quiet_settings()));

        let mut handles = Vec::new();
        for _ in 0..10 {
            let cache = Arc::clone(&cache);
            handles.push(tokio::spawn(async move { cache.get("AAPL".to_string()).await }));
        }
        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap(), 187);
        }

        assert_eq!(backing.batches(), 1);
        // Every caller resolved through the store or the shared fetch.
        let stats = cache.stats();
        assert_eq!(stats.hits + stats.misses, 10);
        assert!(stats.misses >= 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_fetch_failure_propagates_then_clears() {
        let backing = TestBackingStore::with_delay(&[("AAPL", 187)], Duration::from_millis(60));
        backing.fail_next();
        let cache = Arc::new(new_cache(Arc::clone(&backing), quiet_settings()));

        let leader = {
            let cache = Arc::clone(&cache);
            tokio::spawn(async move { cache.get("AAPL".to_string()).await })
        };
        // Join while the first fetch is still in flight.
        sleep(Duration::from_millis(15)).await;
        let joiner = {
            let cache = Arc::clone(&cache);
            tokio::spawn(async move { cache.get("AAPL".to_string()).await })
        };

        for handle in [leader, joiner] {
            match handle.await.unwrap() {
                Err(CacheError::Fetch(_)) => {}
                other => panic!("expected Fetch error, got {:?}", other),
            }
        }
        assert_eq!(backing.batches(), 1);

        // The slot was cleared, so the next call retries fresh.
        assert_eq!(cache.get("AAPL".to_string()).await.unwrap(), 187);
        assert_eq!(backing.batches(), 2);
    }

    #[tokio::test]
    async fn test_get_many_partial_miss_is_not_an_error() {
        let backing = TestBackingStore::new(&[("AAPL", 187)]);
        let cache = new_cache(Arc::clone(&backing), quiet_settings());

        let values = cache.get_many(&["AAPL".to_string(), "MSFT".to_string()]).await.unwrap();
        assert_eq!(values, HashMap::from([("AAPL".to_string(), 187)]));
        assert_eq!(cache.len(), 1);

        // No phantom entry: asking again goes back to the backing store.
        let values = cache.get_many(&["MSFT".to_string()]).await.unwrap();
        assert!(values.is_empty());
        assert_eq!(backing.batches(), 2);
    }

    #[tokio::test]
    async fn test_get_many_dedupes_requested_keys() {
        let backing = TestBackingStore::new(&[("AAPL", 187)]);
        let cache = new_cache(Arc::clone(&backing), quiet_settings());

        let values = cache
            .get_many(&["AAPL".to_string(), "AAPL".to_string()]).await
            .unwrap();
        assert_eq!(values.len(), 1);
        assert_eq!(backing.keys_fetched(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_overlapping_batches_fetch_each_key_once() {
        let backing = TestBackingStore::with_delay(
            &[("AAPL", 187), ("MSFT", 430), ("GOOG", 175)],
            Duration::from_millis(40)
        );
        let cache = Arc::new(new_cache(Arc::clone(&backing), quiet_settings()));

        let first = {
            let cache = Arc::clone(&cache);
            tokio::spawn(async move {
                cache.get_many(&["AAPL".to_string(), "MSFT".to_string()]).await
            })
        };
        let second = {
            let cache = Arc::clone(&cache);
            tokio::spawn(async move {
                cache.get_many(&["MSFT".to_string(), "GOOG".to_string()]).await
            })
        };

        let first = first.await.unwrap().unwrap();
        let second = second.await.unwrap().unwrap();
        assert_eq!(first.len(), 2);
        assert_eq!(second.len(), 2);
        assert_eq!(second[&"MSFT".to_string()], 430);

        // Three distinct keys, three fetched keys: the overlap was shared.
        assert_eq!(backing.keys_fetched(), 3);
    }

    #[tokio::test]
    async fn test_deleted_notification_forces_refetch() {
        let backing = TestBackingStore::new(&[("AAPL", 187)]);
        let cache = new_cache(Arc::clone(&backing), quiet_settings());

        assert_eq!(cache.get("AAPL".to_string()).await.unwrap(), 187);
        cache.notify_changed(vec!["AAPL".to_string()], ChangeType::Deleted);
        sleep(Duration::from_millis(80)).await;

        assert_eq!(cache.len(), 0);
        assert_eq!(cache.get("AAPL".to_string()).await.unwrap(), 187);
        assert_eq!(backing.batches(), 2);
    }

    #[tokio::test]
    async fn test_updated_notification_refreshes_in_place() {
        let backing = TestBackingStore::new(&[("AAPL", 187)]);
        let cache = new_cache(Arc::clone(&backing), quiet_settings());

        assert_eq!(cache.get("AAPL".to_string()).await.unwrap(), 187);

        backing.set("AAPL", 190);
        cache.notify_changed(vec!["AAPL".to_string()], ChangeType::Updated);
        sleep(Duration::from_millis(80)).await;

        // The refresh already fetched; this read is a hit on the new value.
        assert_eq!(cache.get("AAPL".to_string()).await.unwrap(), 190);
        assert_eq!(backing.batches(), 2);
    }

    #[tokio::test]
    async fn test_absolute_expiration_is_lazy() {
        let settings = CacheSettings::custom(
            Duration::from_millis(60),
            Duration::from_secs(60),
            Duration::from_secs(60),
            None
        );
        let backing = TestBackingStore::new(&[("AAPL", 187)]);
        let cache = new_cache(Arc::clone(&backing), settings);

        assert_eq!(cache.get("AAPL".to_string()).await.unwrap(), 187);
        sleep(Duration::from_millis(120)).await;

        // Expired entries read as misses and are refetched.
        assert_eq!(cache.get("AAPL".to_string()).await.unwrap(), 187);
        assert_eq!(backing.batches(), 2);
    }

    #[tokio::test]
    async fn test_purge_evicts_idle_entries() {
        let settings = CacheSettings::custom(
            Duration::from_secs(60),
            Duration::from_millis(40),
            Duration::from_millis(25),
            None
        );
        let backing = TestBackingStore::new(&[("AAPL", 187)]);
        let cache = new_cache(Arc::clone(&backing), settings);

        assert_eq!(cache.get("AAPL".to_string()).await.unwrap(), 187);
        sleep(Duration::from_millis(150)).await;

        assert_eq!(cache.len(), 0);
        assert!(cache.stats().evictions >= 1);
    }

    #[tokio::test]
    async fn test_capacity_purge_keeps_recently_used() {
        let settings = CacheSettings::custom(
            Duration::from_secs(60),
            Duration::from_secs(60),
            Duration::from_millis(30),
            Some(2)
        );
        let backing = TestBackingStore::new(&[("A", 1), ("B", 2), ("C", 3)]);
        let cache = new_cache(Arc::clone(&backing), settings);

        cache.get("A".to_string()).await.unwrap();
        sleep(Duration::from_millis(15)).await;
        cache.get("B".to_string()).await.unwrap();
        sleep(Duration::from_millis(15)).await;
        cache.get("C".to_string()).await.unwrap();

        sleep(Duration::from_millis(100)).await;
        assert_eq!(cache.len(), 2);

        // B and C survived; the least-recently-used A was trimmed.
        assert_eq!(backing.batches(), 3);
        cache.get("B".to_string()).await.unwrap();
        cache.get("C".to_string()).await.unwrap();
        assert_eq!(backing.batches(), 3);
        cache.get("A".to_string()).await.unwrap();
        assert_eq!(backing.batches(), 4);
    }

    #[tokio::test]
    async fn test_get_all_is_not_implemented() {
        let backing = TestBackingStore::new(&[]);
        let cache = new_cache(backing, quiet_settings());

        assert!(matches!(cache.get_all().await, Err(CacheError::NotImplemented("get_all"))));
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent_and_stops_activity() {
        let settings = CacheSettings::custom(
            Duration::from_secs(60),
            Duration::from_millis(40),
            Duration::from_millis(25),
            None
        );
        let backing = TestBackingStore::new(&[("AAPL", 187)]);
        let cache = new_cache(Arc::clone(&backing), settings);

        assert_eq!(cache.get("AAPL".to_string()).await.unwrap(), 187);

        cache.shutdown().await;
        cache.shutdown().await;

        assert!(cache.is_empty());
        assert!(matches!(cache.get("AAPL".to_string()).await, Err(CacheError::Disposed)));

        // Notifications after shutdown are discarded without effect.
        cache.notify_changed(vec!["AAPL".to_string()], ChangeType::Deleted);
        let before = cache.stats();
        sleep(Duration::from_millis(80)).await;
        let after = cache.stats();
        assert_eq!(before.evictions, after.evictions);
        assert_eq!(backing.batches(), 1);
    }
}
