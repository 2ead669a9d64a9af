// Copyright 2025 Callgate Contributors
// SPDX-License-Identifier: Apache-2.0

//! Per-client callback registry: id allocation, the id map, and the shared
//! callback record the bridge hands between threads.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Weak};

use callgate_abi::CallbackData;
use parking_lot::Mutex;

use crate::queue::HandoffQueue;
use crate::signal::Completion;

/// Identifier of one in-flight callback, unique for its client's lifetime.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CallbackId(u64);

impl CallbackId {
    pub(crate) fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Raw numeric value, primarily for logging and tests.
    pub fn value(self) -> u64 {
        self.0
    }
}

impl fmt::Display for CallbackId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "callback#{}", self.0)
    }
}

/// Lifecycle of a callback record.
///
/// `Created -> Queued -> Dequeued -> {Returned, Abandoned}`; destruction is
/// legal from any state not currently owned by the queue or a return in
/// progress.
pub(crate) mod state {
    pub(crate) const CREATED: u8 = 0;
    pub(crate) const QUEUED: u8 = 1;
    pub(crate) const DEQUEUED: u8 = 2;
    pub(crate) const RETURNED: u8 = 3;
    pub(crate) const ABANDONED: u8 = 4;
}

/// Shared record for one in-flight callback.
pub(crate) struct CallbackShared {
    id: CallbackId,
    client: Weak<ClientShared>,
    data: CallbackData,
    completion: Completion,
    state: AtomicU8,
}

impl CallbackShared {
    pub(crate) fn new(id: CallbackId, client: &Arc<ClientShared>, data: CallbackData) -> Arc<Self> {
        Arc::new(Self {
            id,
            client: Arc::downgrade(client),
            data,
            completion: Completion::new(),
            state: AtomicU8::new(state::CREATED),
        })
    }

    #[cfg(test)]
    pub(crate) fn for_tests(id: u64, data: CallbackData) -> Arc<Self> {
        Arc::new(Self {
            id: CallbackId::new(id),
            client: Weak::new(),
            data,
            completion: Completion::new(),
            state: AtomicU8::new(state::CREATED),
        })
    }

    pub(crate) fn id(&self) -> CallbackId {
        self.id
    }

    pub(crate) fn client(&self) -> Option<Arc<ClientShared>> {
        self.client.upgrade()
    }

    pub(crate) fn data(&self) -> &CallbackData {
        &self.data
    }

    pub(crate) fn completion(&self) -> &Completion {
        &self.completion
    }

    pub(crate) fn state(&self) -> u8 {
        self.state.load(Ordering::Acquire)
    }

    /// Transitions `from -> to`, failing if another actor moved first.
    pub(crate) fn transition(&self, from: u8, to: u8) -> bool {
        self.state
            .compare_exchange(from, to, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Unconditional move into `Abandoned` during client rundown.
    pub(crate) fn mark_abandoned(&self) {
        self.state.store(state::ABANDONED, Ordering::Release);
        self.completion.abandon();
    }
}

/// Client-side state shared between the registry and the bridge.
pub(crate) struct ClientShared {
    callbacks: Mutex<HashMap<CallbackId, Arc<CallbackShared>>>,
    last_id: AtomicU64,
    queue: HandoffQueue,
}

impl ClientShared {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            callbacks: Mutex::new(HashMap::new()),
            last_id: AtomicU64::new(0),
            queue: HandoffQueue::new(),
        })
    }

    /// Allocates the next callback id; ids start at 1 and are never reused
    /// for the client's lifetime.
    pub(crate) fn next_id(&self) -> CallbackId {
        CallbackId::new(self.last_id.fetch_add(1, Ordering::Relaxed) + 1)
    }

    pub(crate) fn queue(&self) -> &HandoffQueue {
        &self.queue
    }

    /// Inserts under the registry mutex; the map is only ever touched for
    /// the duration of the structural mutation.
    pub(crate) fn insert(&self, callback: Arc<CallbackShared>) {
        self.callbacks.lock().insert(callback.id(), callback);
    }

    /// Removes the entry **by identity**: the map drops the record only if
    /// it still maps the id to this exact callback.
    pub(crate) fn remove(&self, callback: &Arc<CallbackShared>) -> bool {
        let mut callbacks = self.callbacks.lock();
        match callbacks.get(&callback.id()) {
            Some(entry) if Arc::ptr_eq(entry, callback) => {
                callbacks.remove(&callback.id());
                true
            }
            _ => false,
        }
    }

    /// Exact-id lookup under the registry mutex.
    pub(crate) fn find(&self, id: CallbackId) -> Option<Arc<CallbackShared>> {
        self.callbacks.lock().get(&id).cloned()
    }

    /// Empties the id map, returning every registered record.
    pub(crate) fn take_all(&self) -> Vec<Arc<CallbackShared>> {
        self.callbacks.lock().drain().map(|(_, cb)| cb).collect()
    }

    pub(crate) fn outstanding(&self) -> usize {
        self.callbacks.lock().len()
    }
}
