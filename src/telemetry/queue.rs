//! Bounded drop-oldest queue between the fan-out task and one subscriber

use parking_lot::Mutex;
use std::collections::VecDeque;
use tokio::sync::Notify;

#[derive(Debug)]
struct QueueState<T> {
    items: VecDeque<T>,
    closed: bool,
}

/// Single-consumer queue that never blocks the producer
///
/// When full, pushing discards the oldest pending item.
#[derive(Debug)]
pub struct SubscriptionQueue<T> {
    state: Mutex<QueueState<T>>,
    capacity: usize,
    notify: Notify,
}

impl<T> SubscriptionQueue<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(QueueState {
                items: VecDeque::with_capacity(capacity.max(1)),
                closed: false,
            }),
            capacity: capacity.max(1),
            notify: Notify::new(),
        }
    }

    /// Enqueue `item`; returns `true` if an older item was dropped for it
    ///
    /// Pushing to a closed queue is a no-op.
    pub fn push(&self, item: T) -> bool {
        let dropped = {
            let mut state = self.state.lock();
            if state.closed {
                return false;
            }
            let dropped = if state.items.len() >= self.capacity {
                state.items.pop_front();
                true
            } else {
                false
            };
            state.items.push_back(item);
            dropped
        };
        self.notify.notify_one();
        dropped
    }

    pub fn try_pop(&self) -> Option<T> {
        self.state.lock().items.pop_front()
    }

    /// Wait for the next item; `None` once closed and drained
    pub async fn pop(&self) -> Option<T> {
        loop {
            let notified = self.notify.notified();
            {
                let mut state = self.state.lock();
                if let Some(item) = state.items.pop_front() {
                    return Some(item);
                }
                if state.closed {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Stop accepting items and wake the consumer
    pub fn close(&self) {
        self.state.lock().closed = true;
        self.notify.notify_waiters();
        self.notify.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    pub fn len(&self) -> usize {
        self.state.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
