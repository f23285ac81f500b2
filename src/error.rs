use thiserror::Error;

/// Error taxonomy for the cache layer.
///
/// `Clone` so a single fetch failure can be delivered to every caller
/// sharing the same inflight fetch.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CacheError {
    #[error("Entity not found: {0}")] NotFound(String),

    #[error("Fetch failed: {0}")] Fetch(String),

    #[error("Configuration error: {0}")] Config(String),

    #[error("Not implemented: {0}")] NotImplemented(&'static str),

    #[error("Cache has been shut down")] Disposed,
}

impl CacheError {
    /// Whether a retry of the same call can reasonably succeed.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, CacheError::Fetch(_))
    }
}

pub type CacheResult<T> = Result<T, CacheError>;
