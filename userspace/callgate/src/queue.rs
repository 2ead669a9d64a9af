// Copyright 2025 Callgate Contributors
// SPDX-License-Identifier: Apache-2.0

//! Blocking FIFO handoff queue between producers and consumers.
//!
//! Waits distinguish three non-success outcomes: the deadline expired, the
//! waiter was interrupted, or the queue was run down while waiting. A zero
//! timeout polls without blocking.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::client::CallbackShared;

/// Outcome of a bounded dequeue.
pub(crate) enum WaitOutcome {
    /// Head entry removed from the queue.
    Entry(Arc<CallbackShared>),
    /// The wait expired before an entry arrived.
    Timeout,
    /// An interrupt arrived while waiting.
    Interrupted,
    /// The queue was run down; no further entries will arrive.
    Abandoned,
}

struct QueueInner {
    entries: VecDeque<Arc<CallbackShared>>,
    abandoned: bool,
    interrupt_epoch: u64,
}

/// FIFO queue with blocking dequeue, interrupt, and rundown.
pub(crate) struct HandoffQueue {
    inner: Mutex<QueueInner>,
    available: Condvar,
}

impl HandoffQueue {
    pub(crate) fn new() -> Self {
        Self {
            inner: Mutex::new(QueueInner {
                entries: VecDeque::new(),
                abandoned: false,
                interrupt_epoch: 0,
            }),
            available: Condvar::new(),
        }
    }

    /// Appends an entry at the tail; producers are served in submission
    /// order.
    pub(crate) fn push_back(&self, entry: Arc<CallbackShared>) -> Result<(), crate::Error> {
        let mut inner = self.inner.lock();
        if inner.abandoned {
            return Err(crate::Error::Abandoned);
        }
        inner.entries.push_back(entry);
        self.available.notify_one();
        Ok(())
    }

    /// Puts a dequeued entry back at the head so it is redelivered next.
    pub(crate) fn push_front(&self, entry: Arc<CallbackShared>) {
        let mut inner = self.inner.lock();
        inner.entries.push_front(entry);
        self.available.notify_one();
    }

    /// Removes the head entry, waiting up to `timeout` (indefinitely when
    /// `None`, polling when zero).
    pub(crate) fn remove(&self, timeout: Option<Duration>) -> WaitOutcome {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut inner = self.inner.lock();
        let epoch = inner.interrupt_epoch;
        loop {
            if let Some(entry) = inner.entries.pop_front() {
                return WaitOutcome::Entry(entry);
            }
            if inner.abandoned {
                return WaitOutcome::Abandoned;
            }
            if inner.interrupt_epoch != epoch {
                return WaitOutcome::Interrupted;
            }
            match deadline {
                Some(deadline) => {
                    if Instant::now() >= deadline {
                        return WaitOutcome::Timeout;
                    }
                    if self.available.wait_until(&mut inner, deadline).timed_out()
                        && inner.entries.is_empty()
                        && !inner.abandoned
                        && inner.interrupt_epoch == epoch
                    {
                        return WaitOutcome::Timeout;
                    }
                }
                None => self.available.wait(&mut inner),
            }
        }
    }

    /// Wakes current waiters with [`WaitOutcome::Interrupted`].
    pub(crate) fn interrupt(&self) {
        let mut inner = self.inner.lock();
        inner.interrupt_epoch += 1;
        self.available.notify_all();
    }

    /// Marks the queue abandoned, wakes every waiter, and drains the
    /// entries that were still queued.
    pub(crate) fn rundown(&self) -> Vec<Arc<CallbackShared>> {
        let mut inner = self.inner.lock();
        inner.abandoned = true;
        let stranded = inner.entries.drain(..).collect();
        self.available.notify_all();
        stranded
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }
}
