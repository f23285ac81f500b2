use std::collections::HashMap;
use std::hash::Hash;

use async_trait::async_trait;

use crate::error::CacheResult;

/// Backing-store capability the cache calls out to on a miss.
///
/// The cache treats implementations as opaque async functions and takes no
/// ownership of their resources (connection pools, query scopes, etc.).
#[async_trait]
pub trait EntityFetcher<K, V>: Send + Sync
where
    K: Eq + Hash + Send + Sync,
    V: Send,
{
    /// Fetch values for a set of keys. Keys absent from the returned map
    /// have no value in the backing store; that is not an error.
    async fn fetch_many(&self, keys: &[K]) -> CacheResult<HashMap<K, V>>;

    /// Fetch a single key, by default as a one-element batch.
    async fn fetch_one(&self, key: &K) -> CacheResult<Option<V>> {
        let mut values = self.fetch_many(std::slice::from_ref(key)).await?;
        Ok(values.remove(key))
    }
}
