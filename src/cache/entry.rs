use std::sync::atomic::{ AtomicU64, Ordering };
use std::time::{ Duration, Instant };

/// A cached value with creation and last-access tracking.
///
/// The last-access time is an atomic millisecond offset from the owning
/// store's epoch, so concurrent readers can refresh it through a shared
/// reference.
#[derive(Debug)]
pub struct CacheEntry<V> {
    value: V,
    created_at: Instant,
    last_accessed_ms: AtomicU64,
}

impl<V> CacheEntry<V> {
    pub fn new(value: V, epoch: Instant) -> Self {
        Self {
            value,
            created_at: Instant::now(),
            last_accessed_ms: AtomicU64::new(epoch.elapsed().as_millis() as u64),
        }
    }

    pub fn value(&self) -> &V {
        &self.value
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// Refresh the last-access time.
    pub fn touch(&self, epoch: Instant) {
        self.last_accessed_ms.store(epoch.elapsed().as_millis() as u64, Ordering::Relaxed);
    }

    pub fn last_accessed_ms(&self) -> u64 {
        self.last_accessed_ms.load(Ordering::Relaxed)
    }

    /// Time since the entry was last read or created.
    pub fn idle_for(&self, epoch: Instant) -> Duration {
        let now_ms = epoch.elapsed().as_millis() as u64;
        Duration::from_millis(now_ms.saturating_sub(self.last_accessed_ms()))
    }
}
