//! In-memory read-through cache for slow per-entity lookups (current
//! prices, portfolio snapshots, backtest results).
//!
//! Misses are resolved through a caller-supplied [`EntityFetcher`], with
//! single-flight deduplication so concurrent requests for the same key
//! share one underlying fetch. Entries age out on idle time, absolute
//! expiration and capacity pressure via a background purge loop, and an
//! asynchronous change-notification pipeline applies invalidation signals
//! without blocking readers.

pub mod cache;
pub mod config;
pub mod error;

// Re-export public interfaces
pub use cache::{ CacheStats, ChangeNotification, ChangeType, EntityCache, EntityFetcher };
pub use config::CacheSettings;
pub use error::{ CacheError, CacheResult };
