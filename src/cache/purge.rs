use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::interval;

use super::metrics::CacheMetrics;
use super::store::CacheStore;

/// Periodic eviction sweep; runs until the shutdown signal fires.
///
/// Nothing escapes the loop body: a sweep that evicts nothing is a no-op
/// and the tick cadence is fixed regardless of sweep outcomes.
pub(crate) async fn run_purge_loop<K, V>(
    store: Arc<CacheStore<K, V>>,
    metrics: Arc<CacheMetrics>,
    purge_interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    let mut ticker = interval(purge_interval);
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = ticker.tick() => {
                let evicted = store.purge();
                if evicted > 0 {
                    metrics.record_evictions(evicted as u64);
                    log::debug!("purge evicted {} entries, {} remain", evicted, store.len());
                }
            }
        }
    }
    log::debug!("purge loop stopped");
}
