use std::hash::Hash;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::broadcast;

use crate::error::CacheError;

/// Result of one shared fetch: a value, a confirmed not-found, or a failure.
pub type FetchOutcome<V> = Result<Option<V>, CacheError>;

/// Tracks fetches currently in progress so concurrent callers for the same
/// key share one result instead of issuing duplicate fetches.
///
/// A key is registered only while its fetch is outstanding; completion
/// removes the slot before publishing the outcome, so the next caller for
/// that key starts a fresh fetch rather than replaying a stale result.
pub struct InflightTable<K, V> {
    fetches: DashMap<K, broadcast::Sender<FetchOutcome<V>>>,
}

/// How a caller participates in a fetch for a given key.
pub enum Ticket<'a, K, V>
where
    K: Eq + Hash,
{
    /// This caller runs the fetch; everyone arriving later joins it.
    Leader(FetchLease<'a, K, V>),
    /// Another caller's fetch is outstanding; await its outcome.
    Waiter(broadcast::Receiver<FetchOutcome<V>>),
}

/// Obligation held by the leading caller to publish an outcome.
///
/// Dropping an uncompleted lease (the leader was cancelled mid-fetch)
/// publishes a fetch failure so waiters fail fast instead of hanging on a
/// slot nobody will ever complete.
pub struct FetchLease<'a, K, V>
where
    K: Eq + Hash,
{
    table: &'a InflightTable<K, V>,
    key: Option<K>,
}

impl<'a, K, V> FetchLease<'a, K, V>
where
    K: Eq + Hash,
{
    /// Publish the outcome to all waiters and free the slot.
    pub fn complete(mut self, outcome: FetchOutcome<V>) {
        if let Some(key) = self.key.take() {
            self.table.finish(&key, outcome);
        }
    }
}

impl<'a, K, V> Drop for FetchLease<'a, K, V>
where
    K: Eq + Hash,
{
    fn drop(&mut self) {
        if let Some(key) = self.key.take() {
            self.table.finish(
                &key,
                Err(CacheError::Fetch("fetch aborted before completion".to_string()))
            );
        }
    }
}

impl<K, V> InflightTable<K, V>
where
    K: Eq + Hash,
{
    pub fn new() -> Self {
        Self { fetches: DashMap::new() }
    }

    pub fn len(&self) -> usize {
        self.fetches.len()
    }

    pub fn clear(&self) {
        self.fetches.clear();
    }

    fn finish(&self, key: &K, outcome: FetchOutcome<V>) {
        if let Some((_, tx)) = self.fetches.remove(key) {
            let _ = tx.send(outcome);
        }
    }
}

impl<K, V> InflightTable<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    /// Atomically register a fetch for `key`, or join the one in progress.
    pub fn join_or_lead(&self, key: K) -> Ticket<'_, K, V> {
        match self.fetches.entry(key.clone()) {
            Entry::Occupied(slot) => Ticket::Waiter(slot.get().subscribe()),
            Entry::Vacant(slot) => {
                let (tx, _) = broadcast::channel(1);
                slot.insert(tx);
                Ticket::Leader(FetchLease { table: self, key: Some(key) })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lead<'a>(
        table: &'a InflightTable<String, i64>,
        key: &str
    ) -> FetchLease<'a, String, i64> {
        match table.join_or_lead(key.to_string()) {
            Ticket::Leader(lease) => lease,
            Ticket::Waiter(_) => panic!("expected to lead the fetch for {}", key),
        }
    }

    fn join(
        table: &InflightTable<String, i64>,
        key: &str
    ) -> broadcast::Receiver<FetchOutcome<i64>> {
        match table.join_or_lead(key.to_string()) {
            Ticket::Waiter(rx) => rx,
            Ticket::Leader(_) => panic!("expected to join the fetch for {}", key),
        }
    }

    #[tokio::test]
    async fn test_waiters_share_the_leader_outcome() {
        let table: InflightTable<String, i64> = InflightTable::new();

        let lease = lead(&table, "AAPL");
        let mut first = join(&table, "AAPL");
        let mut second = join(&table, "AAPL");

        lease.complete(Ok(Some(187)));

        assert_eq!(first.recv().await.unwrap(), Ok(Some(187)));
        assert_eq!(second.recv().await.unwrap(), Ok(Some(187)));
        assert_eq!(table.len(), 0);
    }

    #[tokio::test]
    async fn test_failure_clears_the_slot() {
        let table: InflightTable<String, i64> = InflightTable::new();

        let lease = lead(&table, "AAPL");
        let mut rx = join(&table, "AAPL");
        lease.complete(Err(CacheError::Fetch("backing store offline".to_string())));

        assert!(matches!(rx.recv().await.unwrap(), Err(CacheError::Fetch(_))));
        // The next caller leads a fresh fetch rather than replaying the failure.
        let _retry = lead(&table, "AAPL");
    }

    #[tokio::test]
    async fn test_dropped_lease_fails_waiters() {
        let table: InflightTable<String, i64> = InflightTable::new();

        let lease = lead(&table, "AAPL");
        let mut rx = join(&table, "AAPL");
        drop(lease);

        assert!(matches!(rx.recv().await.unwrap(), Err(CacheError::Fetch(_))));
        assert_eq!(table.len(), 0);
    }
}
