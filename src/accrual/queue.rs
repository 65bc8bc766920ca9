// a number stays claimed from enqueue until its lease is dropped

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::Notify;

/// What happens when a number arrives at a full queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum OverflowPolicy {
    /// the new number is turned away
    Reject,
    /// the oldest queued number makes room
    DropOldest,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Enqueued {
    Accepted,
    /// already queued or being polled
    AlreadyClaimed,
    Rejected,
    Displaced(String),
    Closed,
}

#[derive(Default)]
struct Inner {
    items: VecDeque<String>,
    claimed: HashSet<String>,
    closed: bool,
}

pub struct AccrualQueue {
    inner: Mutex<Inner>,
    notify: Notify,
    capacity: usize,
    overflow: OverflowPolicy,
}

impl AccrualQueue {
    pub fn new(capacity: usize, overflow: OverflowPolicy) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            notify: Notify::new(),
            capacity: capacity.max(1),
            overflow,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Never waits.
    pub fn enqueue(&self, number: &str) -> Enqueued {
        let outcome = {
            let mut inner = self.lock();
            if inner.closed {
                return Enqueued::Closed;
            }
            if inner.claimed.contains(number) {
                return Enqueued::AlreadyClaimed;
            }
            let mut outcome = Enqueued::Accepted;
            if inner.items.len() >= self.capacity {
                match self.overflow {
                    OverflowPolicy::Reject => return Enqueued::Rejected,
                    OverflowPolicy::DropOldest => {
                        if let Some(oldest) = inner.items.pop_front() {
                            inner.claimed.remove(&oldest);
                            outcome = Enqueued::Displaced(oldest);
                        }
                    }
                }
            }
            inner.items.push_back(number.to_string());
            inner.claimed.insert(number.to_string());
            outcome
        };
        self.notify.notify_one();
        outcome
    }

    /// Waits for the next number. Returns `None` once the queue is closed.
    pub async fn dequeue(self: &Arc<Self>) -> Option<Lease> {
        loop {
            let notified = self.notify.notified();
            {
                let mut inner = self.lock();
                if inner.closed {
                    return None;
                }
                if let Some(number) = inner.items.pop_front() {
                    return Some(Lease {
                        queue: Arc::clone(self),
                        number,
                    });
                }
            }
            notified.await;
        }
    }

    /// Stops the queue: pending numbers are discarded and every waiting
    /// consumer gets `None`.
    pub fn close(&self) {
        {
            let mut inner = self.lock();
            inner.closed = true;
            let discarded: Vec<String> = inner.items.drain(..).collect();
            for number in discarded {
                inner.claimed.remove(&number);
            }
        }
        self.notify.notify_waiters();
    }

    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    pub fn is_claimed(&self, number: &str) -> bool {
        self.lock().claimed.contains(number)
    }

    fn release(&self, number: &str) {
        self.lock().claimed.remove(number);
    }
}

/// Exclusive claim on one order number, released on drop.
pub struct Lease {
    queue: Arc<AccrualQueue>,
    number: String,
}

impl Lease {
    pub fn number(&self) -> &str {
        &self.number
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        self.queue.release(&self.number);
    }
}
