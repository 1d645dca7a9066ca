//! Bounded deadline queues.
//!
//! The two tunnel queues sit between the TUN-facing side and the
//! network-facing side. Every entry carries a deadline; entries that outlive
//! it are dropped at the head rather than delivered late. This is the
//! primary bufferbloat defense: queue latency stays bounded by the entry
//! lifetime no matter how deep the queue is configured.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::error::{Error, Result};

/// Default queue capacity in entries.
pub const DEFAULT_CAPACITY: usize = 500;

/// Default entry lifetime.
pub const DEFAULT_LIFETIME: Duration = Duration::from_millis(200);

struct Entry {
    payload: Bytes,
    deadline: Instant,
}

struct Inner {
    entries: VecDeque<Entry>,
    closed: bool,
    expired_drops: u64,
    rejected: u64,
}

/// Counters observed on a queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueStats {
    /// Entries currently queued
    pub depth: usize,
    /// Entries dropped because their deadline passed
    pub expired_drops: u64,
    /// Enqueue attempts rejected with backpressure
    pub rejected: u64,
}

/// A bounded FIFO whose entries expire.
///
/// Multi-producer, single-consumer. `push` is synchronous and never blocks;
/// `pop` suspends until an entry is available or the queue is closed.
pub struct DeadlineQueue {
    inner: Mutex<Inner>,
    notify: Notify,
    capacity: usize,
    lifetime: Duration,
}

impl DeadlineQueue {
    /// Create a queue with the given capacity and entry lifetime.
    pub fn new(capacity: usize, lifetime: Duration) -> Self {
        Self {
            inner: Mutex::new(Inner {
                entries: VecDeque::with_capacity(capacity),
                closed: false,
                expired_drops: 0,
                rejected: 0,
            }),
            notify: Notify::new(),
            capacity,
            lifetime,
        }
    }

    /// Create a queue with the default lifetime.
    pub fn with_capacity(capacity: usize) -> Self {
        Self::new(capacity, DEFAULT_LIFETIME)
    }

    /// Enqueue a payload.
    ///
    /// When the queue is full, expired head entries are evicted first; if it
    /// is still full afterwards the new entry is rejected with
    /// [`Error::Backpressure`].
    pub fn push(&self, payload: Bytes) -> Result<()> {
        let now = Instant::now();
        {
            let mut inner = self.inner.lock();
            if inner.closed {
                return Err(Error::Closed);
            }
            if inner.entries.len() >= self.capacity {
                Self::sweep_front(&mut inner, now);
            }
            if inner.entries.len() >= self.capacity {
                inner.rejected += 1;
                return Err(Error::Backpressure);
            }
            inner.entries.push_back(Entry {
                payload,
                deadline: now + self.lifetime,
            });
        }
        self.notify.notify_one();
        Ok(())
    }

    /// Dequeue the next live payload.
    ///
    /// Expired entries are discarded, never returned. Resolves to `None`
    /// once the queue is closed and drained.
    pub async fn pop(&self) -> Option<Bytes> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut inner = self.inner.lock();
                Self::sweep_front(&mut inner, Instant::now());
                if let Some(entry) = inner.entries.pop_front() {
                    return Some(entry.payload);
                }
                if inner.closed {
                    return None;
                }
            }

            notified.as_mut().await;
        }
    }

    /// Non-blocking dequeue.
    pub fn try_pop(&self) -> Option<Bytes> {
        let mut inner = self.inner.lock();
        Self::sweep_front(&mut inner, Instant::now());
        inner.entries.pop_front().map(|e| e.payload)
    }

    /// Close the queue; pending `pop` calls drain then resolve to `None`.
    pub fn close(&self) {
        self.inner.lock().closed = true;
        self.notify.notify_waiters();
    }

    /// Entries currently queued.
    pub fn depth(&self) -> usize {
        self.inner.lock().entries.len()
    }

    /// Snapshot of queue counters.
    pub fn stats(&self) -> QueueStats {
        let inner = self.inner.lock();
        QueueStats {
            depth: inner.entries.len(),
            expired_drops: inner.expired_drops,
            rejected: inner.rejected,
        }
    }

    fn sweep_front(inner: &mut Inner, now: Instant) {
        while inner
            .entries
            .front()
            .is_some_and(|e| e.deadline <= now)
        {
            inner.entries.pop_front();
            inner.expired_drops += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fifo_order() {
        let q = DeadlineQueue::with_capacity(4);
        q.push(Bytes::from_static(b"a")).unwrap();
        q.push(Bytes::from_static(b"b")).unwrap();

        assert_eq!(q.try_pop().unwrap().as_ref(), b"a");
        assert_eq!(q.try_pop().unwrap().as_ref(), b"b");
        assert!(q.try_pop().is_none());
    }

    #[test]
    fn test_capacity_never_exceeded() {
        let q = DeadlineQueue::new(3, Duration::from_secs(60));
        for _ in 0..3 {
            q.push(Bytes::from_static(b"x")).unwrap();
        }
        assert!(matches!(
            q.push(Bytes::from_static(b"y")),
            Err(Error::Backpressure)
        ));
        assert_eq!(q.depth(), 3);
        assert_eq!(q.stats().rejected, 1);
    }

    #[test]
    fn test_full_queue_evicts_expired_head() {
        let q = DeadlineQueue::new(2, Duration::from_millis(10));
        q.push(Bytes::from_static(b"old1")).unwrap();
        q.push(Bytes::from_static(b"old2")).unwrap();

        std::thread::sleep(Duration::from_millis(20));

        // Both head entries are past deadline, so the new entry fits.
        q.push(Bytes::from_static(b"new")).unwrap();
        assert_eq!(q.try_pop().unwrap().as_ref(), b"new");
        assert_eq!(q.stats().expired_drops, 2);
    }

    #[test]
    fn test_expired_entries_never_dequeued() {
        let q = DeadlineQueue::new(4, Duration::from_millis(10));
        q.push(Bytes::from_static(b"stale")).unwrap();

        std::thread::sleep(Duration::from_millis(20));

        assert!(q.try_pop().is_none());
        assert_eq!(q.stats().expired_drops, 1);
    }

    #[tokio::test]
    async fn test_pop_wakes_on_push() {
        let q = std::sync::Arc::new(DeadlineQueue::with_capacity(4));

        let popper = {
            let q = q.clone();
            tokio::spawn(async move { q.pop().await })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        q.push(Bytes::from_static(b"wake")).unwrap();

        let got = popper.await.unwrap();
        assert_eq!(got.unwrap().as_ref(), b"wake");
    }

    #[tokio::test]
    async fn test_close_resolves_pop() {
        let q = std::sync::Arc::new(DeadlineQueue::with_capacity(4));

        let popper = {
            let q = q.clone();
            tokio::spawn(async move { q.pop().await })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        q.close();
        assert!(popper.await.unwrap().is_none());
        assert!(matches!(
            q.push(Bytes::from_static(b"late")),
            Err(Error::Closed)
        ));
    }
}
