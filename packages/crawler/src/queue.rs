//! Bounded in-process work queue with a throttle sentinel.
//!
//! Batch processors hand work to their worker pool through one of these.
//! Producers see three outcomes: accepted, `Throttled` (depth crossed the
//! throttle threshold, skip a tick), or `Full` (submission timed out). The
//! current depth and capacity are readable for gauge export.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc;

/// Fraction of capacity at which producers are asked to back off.
const THROTTLE_RATIO: f64 = 0.8;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SubmitError {
    /// Depth crossed the throttle threshold; the producer should skip a tick.
    #[error("work queue above throttle threshold")]
    Throttled,

    /// The queue stayed full past the submission timeout.
    #[error("work queue full")]
    Full,

    /// The consumer side is gone (shutdown).
    #[error("work queue closed")]
    Closed,
}

pub struct WorkQueue<T> {
    tx: mpsc::Sender<T>,
    depth: Arc<AtomicUsize>,
    capacity: usize,
}

pub struct WorkReceiver<T> {
    rx: mpsc::Receiver<T>,
    depth: Arc<AtomicUsize>,
}

/// Create a bounded queue of the given capacity.
pub fn work_queue<T>(capacity: usize) -> (WorkQueue<T>, WorkReceiver<T>) {
    let (tx, rx) = mpsc::channel(capacity);
    let depth = Arc::new(AtomicUsize::new(0));
    (
        WorkQueue {
            tx,
            depth: depth.clone(),
            capacity,
        },
        WorkReceiver { rx, depth },
    )
}

impl<T> WorkQueue<T> {
    /// Submit without blocking. Reports `Throttled` once depth reaches the
    /// throttle threshold so producers can skip a tick before the queue is
    /// actually full.
    pub fn try_submit(&self, item: T) -> Result<(), SubmitError> {
        if self.is_throttled() {
            return Err(SubmitError::Throttled);
        }
        match self.tx.try_send(item) {
            Ok(()) => {
                self.depth.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
            Err(mpsc::error::TrySendError::Full(_)) => Err(SubmitError::Full),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(SubmitError::Closed),
        }
    }

    /// Submit, waiting up to `timeout` for space.
    pub async fn submit(&self, item: T, timeout: Duration) -> Result<(), SubmitError> {
        match tokio::time::timeout(timeout, self.tx.send(item)).await {
            Ok(Ok(())) => {
                self.depth.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
            Ok(Err(_)) => Err(SubmitError::Closed),
            Err(_) => Err(SubmitError::Full),
        }
    }

    pub fn is_throttled(&self) -> bool {
        self.depth() as f64 >= self.capacity as f64 * THROTTLE_RATIO
    }

    pub fn depth(&self) -> usize {
        self.depth.load(Ordering::SeqCst)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl<T> Clone for WorkQueue<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            depth: self.depth.clone(),
            capacity: self.capacity,
        }
    }
}

impl<T> WorkReceiver<T> {
    pub async fn recv(&mut self) -> Option<T> {
        let item = self.rx.recv().await;
        if item.is_some() {
            self.depth.fetch_sub(1, Ordering::SeqCst);
        }
        item
    }
}
