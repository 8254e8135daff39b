//! Bounded job queue behind each dispatch pool.
//!
//! `tokio::sync::mpsc` covers `block` (`send().await`) and `reject`
//! (`try_send`) but a sender cannot evict the oldest queued item, which
//! `drop_oldest` needs. One deque under a lock with two [`Notify`] wakers
//! implements all three policies, so the pool code does not branch on the
//! configured policy.

use std::collections::VecDeque;

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::config::OverflowPolicy;

/// Result of offering a job to a [`JobQueue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Queued,
    /// Queued after evicting the oldest job.
    DroppedOldest,
    /// Queue full; the new job was discarded.
    Rejected,
    /// Queue closed; the job was discarded.
    Closed,
}

impl PushOutcome {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::DroppedOldest => "dropped_oldest",
            Self::Rejected => "rejected",
            Self::Closed => "closed",
        }
    }
}

struct QueueState<T> {
    items: VecDeque<T>,
    closed: bool,
}

/// Bounded multi-consumer job queue with a configurable overflow policy.
///
/// After `close()` producers are refused while consumers keep popping until
/// the queue is empty.
pub struct JobQueue<T> {
    state: Mutex<QueueState<T>>,
    capacity: usize,
    policy: OverflowPolicy,
    not_empty: Notify,
    not_full: Notify,
}

impl<T> JobQueue<T> {
    pub fn new(capacity: usize, policy: OverflowPolicy) -> Self {
        Self {
            state: Mutex::new(QueueState {
                items: VecDeque::with_capacity(capacity),
                closed: false,
            }),
            capacity: capacity.max(1),
            policy,
            not_empty: Notify::new(),
            not_full: Notify::new(),
        }
    }

    /// Offer a job. Only [`OverflowPolicy::Block`] ever waits.
    pub async fn push(&self, item: T) -> PushOutcome {
        loop {
            let notified = self.not_full.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.state.lock();
                if state.closed {
                    return PushOutcome::Closed;
                }

                if state.items.len() < self.capacity {
                    state.items.push_back(item);
                    drop(state);
                    self.not_empty.notify_one();
                    return PushOutcome::Queued;
                }

                match self.policy {
                    OverflowPolicy::DropOldest => {
                        state.items.pop_front();
                        state.items.push_back(item);
                        drop(state);
                        self.not_empty.notify_one();
                        return PushOutcome::DroppedOldest;
                    }
                    OverflowPolicy::Reject => return PushOutcome::Rejected,
                    OverflowPolicy::Block => {}
                }
            }

            notified.await;
        }
    }

    /// Take the oldest job, waiting while the queue is empty. Returns `None`
    /// once the queue is closed and drained.
    pub async fn pop(&self) -> Option<T> {
        loop {
            let notified = self.not_empty.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.state.lock();
                if let Some(item) = state.items.pop_front() {
                    drop(state);
                    self.not_full.notify_one();
                    return Some(item);
                }
                if state.closed {
                    return None;
                }
            }

            notified.await;
        }
    }

    /// Refuse further jobs and wake every waiter.
    pub fn close(&self) {
        self.state.lock().closed = true;
        self.not_empty.notify_waiters();
        self.not_full.notify_waiters();
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
