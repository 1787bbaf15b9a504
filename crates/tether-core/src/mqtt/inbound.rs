//! Bounded hand-off queue from producer threads to the poll thread.
//!
//! Network readers and log layers run outside the poll thread; they push
//! into this queue and the poll thread drains it. When the queue is full
//! the newest item is dropped and counted.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, SyncSender, TryRecvError, TrySendError};

/// Producer half. Cheap to clone.
#[derive(Debug)]
pub struct InboundSender<T> {
    tx: SyncSender<T>,
    dropped: Arc<AtomicU64>,
}

impl<T> Clone for InboundSender<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            dropped: self.dropped.clone(),
        }
    }
}

/// Consumer half, owned by the poll thread.
#[derive(Debug)]
pub struct InboundReceiver<T> {
    rx: Receiver<T>,
    dropped: Arc<AtomicU64>,
}

/// Create a queue holding at most `capacity` items.
pub fn channel<T>(capacity: usize) -> (InboundSender<T>, InboundReceiver<T>) {
    let (tx, rx) = mpsc::sync_channel(capacity);
    let dropped = Arc::new(AtomicU64::new(0));
    (
        InboundSender {
            tx,
            dropped: dropped.clone(),
        },
        InboundReceiver { rx, dropped },
    )
}

impl<T> InboundSender<T> {
    /// Enqueue without blocking. Returns `false` if the item was dropped
    /// because the queue is full or the receiver is gone.
    pub fn push(&self, item: T) -> bool {
        match self.tx.try_send(item) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                false
            }
            Err(TrySendError::Disconnected(_)) => false,
        }
    }
}

impl<T> InboundReceiver<T> {
    /// Next queued item, if any.
    pub fn try_next(&self) -> Option<T> {
        match self.rx.try_recv() {
            Ok(item) => Some(item),
            Err(TryRecvError::Empty | TryRecvError::Disconnected) => None,
        }
    }

    /// Take everything queued right now.
    pub fn drain(&self) -> Vec<T> {
        std::iter::from_fn(|| self.try_next()).collect()
    }

    /// Items dropped because the queue was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}
