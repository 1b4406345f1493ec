//! Per-connection bounded outbound mailbox.
//!
//! Fan-out is best-effort and per-connection independent: each subscriber
//! owns a bounded FIFO drained by a single writer task, so enqueue order is
//! send order. At the high-water mark the oldest queued frame is dropped:
//! a slow connection loses its own frames instead of blocking anyone else.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;

struct Inner {
    queue: Mutex<VecDeque<String>>,
    notify: Notify,
    capacity: usize,
    closed: AtomicBool,
    dropped: AtomicU64,
}

/// Clonable handle to one connection's outbound queue.
#[derive(Clone)]
pub struct Mailbox {
    inner: Arc<Inner>,
}

impl Mailbox {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                queue: Mutex::new(VecDeque::new()),
                notify: Notify::new(),
                capacity: capacity.max(1),
                closed: AtomicBool::new(false),
                dropped: AtomicU64::new(0),
            }),
        }
    }

    /// Enqueue one serialized frame. Drops the oldest queued frame at the
    /// high-water mark; silently ignored once closed.
    pub fn push(&self, frame: String) {
        if self.inner.closed.load(Ordering::Acquire) {
            return;
        }
        {
            let mut queue = self.inner.queue.lock().expect("mailbox lock poisoned");
            if queue.len() >= self.inner.capacity {
                queue.pop_front();
                self.inner.dropped.fetch_add(1, Ordering::Relaxed);
            }
            queue.push_back(frame);
        }
        self.inner.notify.notify_one();
    }

    /// Dequeue the next frame, waiting if the queue is empty. `None` once
    /// the mailbox is closed and drained.
    pub async fn pop(&self) -> Option<String> {
        loop {
            {
                let mut queue = self.inner.queue.lock().expect("mailbox lock poisoned");
                if let Some(frame) = queue.pop_front() {
                    return Some(frame);
                }
            }
            if self.inner.closed.load(Ordering::Acquire) {
                return None;
            }
            self.inner.notify.notified().await;
        }
    }

    /// Stop accepting frames and wake the writer so it can exit.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
        self.inner.notify.notify_one();
    }

    /// Frames dropped at the high-water mark so far.
    pub fn dropped(&self) -> u64 {
        self.inner.dropped.load(Ordering::Relaxed)
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.inner.queue.lock().expect("mailbox lock poisoned").len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn preserves_fifo_order() {
        let mailbox = Mailbox::new(8);
        mailbox.push("a".into());
        mailbox.push("b".into());
        mailbox.push("c".into());
        assert_eq!(mailbox.pop().await.as_deref(), Some("a"));
        assert_eq!(mailbox.pop().await.as_deref(), Some("b"));
        assert_eq!(mailbox.pop().await.as_deref(), Some("c"));
    }

    #[tokio::test]
    async fn drops_oldest_at_high_water_mark() {
        let mailbox = Mailbox::new(2);
        mailbox.push("a".into());
        mailbox.push("b".into());
        mailbox.push("c".into());
        assert_eq!(mailbox.len(), 2);
        assert_eq!(mailbox.dropped(), 1);
        assert_eq!(mailbox.pop().await.as_deref(), Some("b"));
        assert_eq!(mailbox.pop().await.as_deref(), Some("c"));
    }

    #[tokio::test]
    async fn close_drains_then_ends() {
        let mailbox = Mailbox::new(4);
        mailbox.push("a".into());
        mailbox.close();
        mailbox.push("ignored".into());
        assert_eq!(mailbox.pop().await.as_deref(), Some("a"));
        assert_eq!(mailbox.pop().await, None);
    }

    #[tokio::test]
    async fn pop_wakes_on_push() {
        let mailbox = Mailbox::new(4);
        let reader = mailbox.clone();
        let task = tokio::spawn(async move { reader.pop().await });
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        mailbox.push("late".into());
        assert_eq!(task.await.unwrap().as_deref(), Some("late"));
    }
}
