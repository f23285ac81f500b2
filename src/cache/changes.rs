use std::collections::VecDeque;
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::Arc;
use std::sync::atomic::{ AtomicBool, AtomicU64, Ordering };

use parking_lot::Mutex;
use tokio::sync::{ watch, Notify };

use super::fetch::EntityFetcher;
use super::store::CacheStore;
use crate::error::CacheResult;

/// Kind of change the backing data went through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeType {
    Updated,
    Deleted,
}

/// Asynchronous invalidation signal for a set of keys. Transient; never
/// persisted.
#[derive(Debug, Clone)]
pub struct ChangeNotification<K> {
    pub keys: Vec<K>,
    pub change: ChangeType,
}

/// Bounded notification queue with a non-blocking producer side.
///
/// On overflow the oldest pending notification is dropped and counted;
/// the producer is never told.
pub struct ChangeQueue<K> {
    pending: Mutex<VecDeque<ChangeNotification<K>>>,
    notify: Notify,
    capacity: usize,
    closed: AtomicBool,
    dropped: AtomicU64,
}

impl<K> ChangeQueue<K> {
    pub fn new(capacity: usize) -> Self {
        Self {
            pending: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            capacity,
            closed: AtomicBool::new(false),
            dropped: AtomicU64::new(0),
        }
    }

    /// Enqueue without blocking, dropping the oldest entry on overflow.
    pub fn push(&self, notification: ChangeNotification<K>) {
        if self.closed.load(Ordering::Acquire) {
            log::debug!("change queue closed, notification discarded");
            return;
        }
        {
            let mut pending = self.pending.lock();
            pending.push_back(notification);
            while pending.len() > self.capacity {
                pending.pop_front();
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                log::warn!("change queue overflow, oldest notification dropped ({} total)", dropped);
            }
        }
        self.notify.notify_one();
    }

    pub fn pop(&self) -> Option<ChangeNotification<K>> {
        self.pending.lock().pop_front()
    }

    pub async fn notified(&self) {
        self.notify.notified().await;
    }

    /// Stop accepting notifications and wake the consumer.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_one();
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.lock().is_empty()
    }
}

/// Single consumer applying notifications strictly in arrival order.
///
/// A failure while applying one notification is logged and the worker moves
/// on; a dead worker would silently stop all future invalidation.
pub(crate) async fn run_change_worker<K, V>(
    store: Arc<CacheStore<K, V>>,
    queue: Arc<ChangeQueue<K>>,
    fetcher: Arc<dyn EntityFetcher<K, V>>,
    mut shutdown: watch::Receiver<bool>,
) where
    K: Eq + Hash + Clone + Debug + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    loop {
        while let Some(notification) = queue.pop() {
            if let Err(e) = apply_notification(store.as_ref(), fetcher.as_ref(), &notification).await {
                log::warn!(
                    "failed to apply {:?} notification for {} key(s): {}",
                    notification.change,
                    notification.keys.len(),
                    e
                );
            }
        }
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = queue.notified() => {}
        }
    }
    log::debug!("change worker stopped");
}

async fn apply_notification<K, V>(
    store: &CacheStore<K, V>,
    fetcher: &dyn EntityFetcher<K, V>,
    notification: &ChangeNotification<K>,
) -> CacheResult<()>
where
    K: Eq + Hash + Clone + Debug + Send + Sync,
    V: Clone + Send + Sync,
{
    match notification.change {
        ChangeType::Deleted => {
            for key in &notification.keys {
                store.remove(key);
            }
            Ok(())
        }
        ChangeType::Updated => {
            // Only keys we currently hold need a refresh; the rest stay cold
            // until someone asks for them.
            let mut removed = Vec::new();
            for key in &notification.keys {
                if store.remove(key) {
                    removed.push(key.clone());
                }
            }
            if removed.is_empty() {
                return Ok(());
            }
            let values = fetcher.fetch_many(&removed).await?;
            for (key, value) in values {
                store.insert(key, value);
            }
            Ok(())
        }
    }
}
