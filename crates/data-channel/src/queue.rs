//! Bounded FIFO of captured files awaiting transfer.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::{Notify, Semaphore, watch};
use tracing::{debug, warn};

use crate::{DEFAULT_QUEUE_CAPACITY, ENQUEUE_TIMEOUT};

/// A captured file waiting to be streamed to the Controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferItem {
    /// Strictly increasing, assigned at enqueue.
    pub seq: u64,
    pub path: PathBuf,
    pub len: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QueueError {
    #[error("transfer queue full ({capacity} items)")]
    Full { capacity: usize },

    #[error("transfer queue closed")]
    Closed,
}

struct Shared {
    items: Mutex<VecDeque<TransferItem>>,
    /// One permit per free slot. An item holds its slot until completed.
    slots: Semaphore,
    available: Notify,
    pending: watch::Sender<usize>,
    next_seq: AtomicU64,
    capacity: usize,
    enqueue_timeout: Duration,
}

/// Transfer queue shared by the capture loop and the transfer sender.
///
/// An item counts as pending from `enqueue` until `complete`; a failed item
/// goes back to the head and keeps its slot.
#[derive(Clone)]
pub struct TransferQueue {
    shared: Arc<Shared>,
}

impl Default for TransferQueue {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE_CAPACITY)
    }
}

impl TransferQueue {
    pub fn new(capacity: usize) -> Self {
        Self::with_timeout(capacity, ENQUEUE_TIMEOUT)
    }

    pub fn with_timeout(capacity: usize, enqueue_timeout: Duration) -> Self {
        let capacity = capacity.max(1);
        let (pending, _) = watch::channel(0);
        Self {
            shared: Arc::new(Shared {
                items: Mutex::new(VecDeque::with_capacity(capacity)),
                slots: Semaphore::new(capacity),
                available: Notify::new(),
                pending,
                next_seq: AtomicU64::new(0),
                capacity,
                enqueue_timeout,
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    /// Number of items not yet delivered, including one being sent.
    pub fn pending(&self) -> usize {
        *self.shared.pending.borrow()
    }

    /// Watches the pending count.
    pub fn subscribe(&self) -> watch::Receiver<usize> {
        self.shared.pending.subscribe()
    }

    /// Appends a file, waiting for a free slot up to the enqueue timeout.
    pub async fn enqueue(&self, path: PathBuf, len: u64) -> Result<TransferItem, QueueError> {
        let permit = match tokio::time::timeout(
            self.shared.enqueue_timeout,
            self.shared.slots.acquire(),
        )
        .await
        {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(QueueError::Closed),
            Err(_) => {
                warn!(capacity = self.shared.capacity, "transfer queue full");
                return Err(QueueError::Full {
                    capacity: self.shared.capacity,
                });
            }
        };
        permit.forget();

        let item = TransferItem {
            seq: self.shared.next_seq.fetch_add(1, Ordering::Relaxed),
            path,
            len,
        };
        self.lock().push_back(item.clone());
        self.shared.pending.send_modify(|n| *n += 1);
        self.shared.available.notify_one();
        debug!(seq = item.seq, len, path = %item.path.display(), "item queued");
        Ok(item)
    }

    /// Takes the head item, waiting until one is available.
    ///
    /// The item stays pending until [`complete`](Self::complete) or is
    /// returned with [`fail`](Self::fail).
    pub async fn next(&self) -> TransferItem {
        loop {
            if let Some(item) = self.lock().pop_front() {
                return item;
            }
            self.shared.available.notified().await;
        }
    }

    /// Marks an item as delivered and frees its slot.
    pub fn complete(&self, item: &TransferItem) {
        self.shared.pending.send_modify(|n| *n = n.saturating_sub(1));
        self.shared.slots.add_permits(1);
        debug!(seq = item.seq, "item delivered");
    }

    /// Puts an undelivered item back at the head of the queue.
    pub fn fail(&self, item: TransferItem) {
        debug!(seq = item.seq, "item returned to queue");
        self.lock().push_front(item);
        self.shared.available.notify_one();
    }

    /// Waits until every enqueued item has been delivered.
    pub async fn wait_drained(&self) {
        let mut rx = self.shared.pending.subscribe();
        // The sender lives in `self`, so this cannot fail.
        let _ = rx.wait_for(|n| *n == 0).await;
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<TransferItem>> {
        self.shared
            .items
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}
