//! Blocking FIFO queue shared between worker threads.
//!
//! All cross-thread handshakes in this crate go through these queues: sample
//! buffers between a reader body and its consumers, and broadcast/gradient
//! tokens between tree-synchronized workers. Waits observe a [`CancelFlag`]
//! at bounded latency, so a stop request never leaves a thread parked.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use tracing::warn;

use crate::thread::CancelFlag;
use crate::utils::error::{Result, TreeSyncError};
use crate::utils::metrics;

/// How long a pop may block before a back-pressure notice is logged.
const WAIT_NOTICE: Duration = Duration::from_secs(5);
/// Granularity at which blocked waits re-check the cancellation flag.
const WAIT_TICK: Duration = Duration::from_millis(50);

/// Thread-safe FIFO with blocking and non-blocking access.
pub struct BlockingQueue<T> {
    inner: Mutex<VecDeque<T>>,
    cond: Condvar,
}

impl<T> Default for BlockingQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> BlockingQueue<T> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(VecDeque::new()),
            cond: Condvar::new(),
        }
    }

    /// Append an item. Never blocks; wakes one waiting popper.
    pub fn push(&self, item: T) {
        self.inner.lock().unwrap().push_back(item);
        self.cond.notify_one();
    }

    /// Remove and return the oldest item without blocking.
    pub fn try_pop(&self) -> Option<T> {
        self.inner.lock().unwrap().pop_front()
    }

    /// Remove and return the oldest item, blocking while the queue is empty.
    ///
    /// Returns `Err(Interrupted)` once `cancel` is set. A wait that exceeds
    /// the diagnostic threshold logs a back-pressure notice naming
    /// `wait_label`, useful for spotting e.g. data feeding that is too slow.
    pub fn pop(&self, cancel: &CancelFlag, wait_label: &str) -> Result<T> {
        self.wait(cancel, wait_label, |queue| queue.pop_front())
    }

    /// Number of queued items. Advisory only: the count can change before the
    /// caller acts on it.
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().unwrap().is_empty()
    }

    fn wait<R>(
        &self,
        cancel: &CancelFlag,
        wait_label: &str,
        mut take: impl FnMut(&mut VecDeque<T>) -> Option<R>,
    ) -> Result<R> {
        let mut queue = self.inner.lock().unwrap();
        let start = Instant::now();
        let mut noticed = false;
        let mut parked = false;
        loop {
            if let Some(item) = take(&mut queue) {
                if parked {
                    metrics::global()
                        .queue_wait_seconds
                        .observe(start.elapsed().as_secs_f64());
                }
                return Ok(item);
            }
            if cancel.is_set() {
                return Err(TreeSyncError::Interrupted);
            }
            if !noticed && start.elapsed() >= WAIT_NOTICE {
                warn!(
                    label = wait_label,
                    waited_ms = start.elapsed().as_millis() as u64,
                    "blocked on an empty queue"
                );
                noticed = true;
            }
            let (guard, _) = self.cond.wait_timeout(queue, WAIT_TICK).unwrap();
            queue = guard;
            parked = true;
        }
    }
}

impl<T: Clone> BlockingQueue<T> {
    /// Clone of the front item without removing it, non-blocking.
    pub fn try_peek(&self) -> Option<T> {
        self.inner.lock().unwrap().front().cloned()
    }

    /// Clone of the front item without removing it, blocking while empty.
    pub fn peek(&self, cancel: &CancelFlag, wait_label: &str) -> Result<T> {
        self.wait(cancel, wait_label, |queue| queue.front().cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn pops_in_fifo_order() {
        let queue = BlockingQueue::new();
        let cancel = CancelFlag::new();
        for i in 0..4 {
            queue.push(i);
        }
        for i in 0..4 {
            assert_eq!(queue.pop(&cancel, "").unwrap(), i);
        }
    }

    #[test]
    fn try_pop_on_empty_returns_none_without_blocking() {
        let queue: BlockingQueue<u32> = BlockingQueue::new();
        assert_eq!(queue.try_pop(), None);
    }

    #[test]
    fn peek_leaves_the_item_in_place() {
        let queue = BlockingQueue::new();
        let cancel = CancelFlag::new();
        queue.push("a");
        assert_eq!(queue.try_peek(), Some("a"));
        assert_eq!(queue.peek(&cancel, "").unwrap(), "a");
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.pop(&cancel, "").unwrap(), "a");
    }

    #[test]
    fn blocked_pop_unblocks_on_concurrent_push() {
        let queue = Arc::new(BlockingQueue::new());
        let producer = {
            let queue = queue.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(30));
                queue.push(99u32);
            })
        };
        let cancel = CancelFlag::new();
        let start = Instant::now();
        assert_eq!(queue.pop(&cancel, "test").unwrap(), 99);
        assert!(start.elapsed() < Duration::from_secs(2));
        producer.join().unwrap();
    }

    #[test]
    fn cancelled_pop_returns_interrupted() {
        let queue: Arc<BlockingQueue<u32>> = Arc::new(BlockingQueue::new());
        let cancel = CancelFlag::new();
        let stopper = {
            let cancel = cancel.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(30));
                cancel.request();
            })
        };
        match queue.pop(&cancel, "test") {
            Err(TreeSyncError::Interrupted) => {}
            other => panic!("expected interruption, got {other:?}"),
        }
        stopper.join().unwrap();
    }
}
