//! Fan-out of link events to any number of subscribers.
//!
//! Publishing never blocks the communication loop: each subscriber owns a
//! bounded queue and, when it is full, the oldest queued event is dropped to
//! make room. A subscriber that falls behind sees a gap (reported by
//! [`Subscription::dropped`]) instead of stalling acquisition.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, Instant};

use log::debug;

/// Default per-subscriber queue depth
pub const DEFAULT_QUEUE_DEPTH: usize = 64;

struct Queue<E> {
    items: Mutex<VecDeque<E>>,
    ready: Condvar,
    capacity: usize,
    dropped: AtomicU64,
    closed: AtomicBool,
}

impl<E> Queue<E> {
    fn lock(&self) -> MutexGuard<'_, VecDeque<E>> {
        self.items.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn push(&self, event: E) {
        let mut items = self.lock();
        if items.len() >= self.capacity {
            items.pop_front();
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        items.push_back(event);
        drop(items);
        self.ready.notify_one();
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        // Take the lock so a receiver between its closed check and wait() can't miss this
        drop(self.lock());
        self.ready.notify_all();
    }
}

/// Publisher side, owned by a link
pub struct NotificationHub<E> {
    subscribers: Mutex<Vec<Weak<Queue<E>>>>,
    depth: usize,
}

impl<E: Clone> Default for NotificationHub<E> {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE_DEPTH)
    }
}

impl<E: Clone> NotificationHub<E> {
    /// Create a hub whose subscribers each buffer up to `depth` events
    #[must_use]
    pub fn new(depth: usize) -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
            depth: depth.max(1),
        }
    }

    fn subscribers(&self) -> MutexGuard<'_, Vec<Weak<Queue<E>>>> {
        self.subscribers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a new subscriber. It receives events published from now on.
    pub fn subscribe(&self) -> Subscription<E> {
        let queue = Arc::new(Queue {
            items: Mutex::new(VecDeque::with_capacity(self.depth)),
            ready: Condvar::new(),
            capacity: self.depth,
            dropped: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        });
        self.subscribers().push(Arc::downgrade(&queue));
        Subscription { queue }
    }

    /// Deliver `event` to every live subscriber without blocking.
    pub fn publish(&self, event: &E) {
        let mut subscribers = self.subscribers();
        subscribers.retain(|weak| match weak.upgrade() {
            Some(queue) => {
                queue.push(event.clone());
                true
            }
            None => {
                debug!("Dropping closed subscription");
                false
            }
        });
    }

    /// Number of subscriptions still alive
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.subscribers()
            .iter()
            .filter(|weak| weak.strong_count() > 0)
            .count()
    }
}

impl<E> Drop for NotificationHub<E> {
    fn drop(&mut self) {
        let subscribers = self
            .subscribers
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner);
        for queue in subscribers.iter().filter_map(Weak::upgrade) {
            queue.close();
        }
    }
}

/// Receiver side. Events arrive in publish order.
pub struct Subscription<E> {
    queue: Arc<Queue<E>>,
}

impl<E> Subscription<E> {
    /// Take the next event if one is queued
    pub fn try_recv(&self) -> Option<E> {
        self.queue.lock().pop_front()
    }

    /// Wait for the next event.
    ///
    /// Returns `None` once the publishing link is gone and the queue is drained.
    pub fn recv(&self) -> Option<E> {
        let mut items = self.queue.lock();
        loop {
            if let Some(event) = items.pop_front() {
                return Some(event);
            }
            if self.queue.closed.load(Ordering::Acquire) {
                return None;
            }
            items = self
                .queue
                .ready
                .wait(items)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Wait up to `timeout` for the next event
    pub fn recv_timeout(&self, timeout: Duration) -> Option<E> {
        let deadline = Instant::now() + timeout;
        let mut items = self.queue.lock();
        loop {
            if let Some(event) = items.pop_front() {
                return Some(event);
            }
            if self.queue.closed.load(Ordering::Acquire) {
                return None;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return None;
            }
            items = self
                .queue
                .ready
                .wait_timeout(items, remaining)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    /// Events discarded because this subscriber's queue was full
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.queue.dropped.load(Ordering::Relaxed)
    }

    /// Whether the publisher has gone away
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.queue.closed.load(Ordering::Acquire)
    }
}
