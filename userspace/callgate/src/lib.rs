// Copyright 2025 Callgate Contributors
// SPDX-License-Identifier: Apache-2.0

#![forbid(unsafe_code)]
#![deny(clippy::all, missing_docs)]

//! CONTEXT: Synchronous callback bridge between a privileged producer and an
//!          unprivileged consumer
//! OWNERS: @runtime
//! PUBLIC API: CallbackFramework, ClientHandle, CallbackHandle, CallbackId,
//!             Removed, Error, boundary::{ConsumerSpace, UserSlice}
//! INVARIANTS: Callback ids are strictly increasing per client and never
//!             reused; the handoff queue is FIFO; a completion signal is set
//!             at most once; no consumer-supplied location is dereferenced
//!             without validation
//!
//! A producer creates a callback, enqueues it, and blocks until the consumer
//! dequeues the request, does its work out-of-line, and returns a result
//! matched back by callback id. Clients, callbacks, and their bookkeeping
//! are allocated through the bundled reference-counted object manager.

pub mod boundary;
mod client;
mod queue;
mod signal;

pub use client::CallbackId;

use std::time::Duration;

use callgate_abi::{CallbackData, CallbackReturnData};
use callgate_object::{
    CreateFlags, ObjectError, ObjectManager, ObjectRef, TypeFlags, TypeHandle, TypeParameters,
};
use thiserror::Error as ThisError;

use boundary::{ConsumerSpace, UserSlice};
use client::{state, ClientShared};
use queue::WaitOutcome;

/// Errors surfaced by bridge operations.
#[derive(Debug, ThisError, PartialEq, Eq)]
pub enum Error {
    /// Allocation failed; the caller may retry after releasing objects.
    #[error("out of memory")]
    OutOfMemory,
    /// Destination too small for the fixed payload; retry with a larger
    /// buffer, nothing was lost.
    #[error("destination buffer too small")]
    BufferTooSmall,
    /// Boundary-crossing access violation; a consumer-side bug, do not retry
    /// with the same arguments.
    #[error("boundary access fault")]
    Fault,
    /// No callback with that id is registered.
    #[error("callback not found")]
    NotFound,
    /// The returned payload does not answer the original request.
    #[error("return payload event id does not match the request")]
    EventMismatch,
    /// The client was torn down while the operation was in flight.
    #[error("client abandoned")]
    Abandoned,
    /// The callback is not in a state that permits this operation.
    #[error("operation not permitted in the callback's current state")]
    InvalidState,
}

impl From<ObjectError> for Error {
    fn from(err: ObjectError) -> Self {
        match err {
            ObjectError::OutOfMemory => Error::OutOfMemory,
            ObjectError::InvalidHandle => Error::NotFound,
            ObjectError::InvalidType | ObjectError::Underflow => Error::InvalidState,
        }
    }
}

/// Outcome of a consumer-side dequeue. The three non-success variants are
/// control outcomes, not errors: the caller chooses to retry, yield, or
/// exit.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Removed {
    /// A request was dequeued and its payload written to the consumer.
    Callback {
        /// Id the consumer must quote when returning a result.
        id: CallbackId,
        /// Bytes written into the consumer's destination slice.
        len: usize,
    },
    /// The wait expired before a request arrived.
    Timeout,
    /// The wait was interrupted by an external signal.
    Interrupted,
    /// The queue was torn down while waiting.
    Abandoned,
}

/// Construction parameters for a [`CallbackFramework`].
#[derive(Clone, Copy, Debug)]
pub struct Config {
    /// Maximum live objects across clients and callbacks.
    pub arena_capacity: usize,
    /// Freed callback records retained for reuse.
    pub callback_free_list_limit: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self { arena_capacity: 1024, callback_free_list_limit: 64 }
    }
}

/// Handle to a client session. After
/// [`CallbackFramework::destroy_client`] the handle is stale: the bridge
/// operations report abandonment and a second destroy fails with
/// [`Error::NotFound`].
pub struct ClientHandle {
    obj: ObjectRef,
    shared: std::sync::Arc<ClientShared>,
}

/// Owning handle to one in-flight callback, held by its producer.
pub struct CallbackHandle {
    obj: ObjectRef,
    shared: std::sync::Arc<client::CallbackShared>,
}

impl CallbackHandle {
    /// Id under which the consumer sees this callback.
    pub fn id(&self) -> CallbackId {
        self.shared.id()
    }

    /// Request payload this callback carries.
    pub fn data(&self) -> &CallbackData {
        self.shared.data()
    }
}

/// The callback bridge: registry, handoff queue, and boundary transfer,
/// backed by an owned [`ObjectManager`].
pub struct CallbackFramework {
    objects: ObjectManager,
    client_type: TypeHandle,
    callback_type: TypeHandle,
}

impl CallbackFramework {
    /// Creates a framework and registers its object types: `"Client"`
    /// (plain) and `"Callback"` (free-list backed).
    pub fn new(config: Config) -> Self {
        let objects = ObjectManager::with_capacity(config.arena_capacity);
        let client_type = objects.register_type(
            "Client",
            TypeFlags::empty(),
            TypeParameters::default(),
            Some(Box::new(|_| log::trace!("client record released"))),
        );
        let callback_type = objects.register_type(
            "Callback",
            TypeFlags::USE_FREE_LIST,
            TypeParameters { free_list_limit: config.callback_free_list_limit },
            Some(Box::new(|_| log::trace!("callback record released"))),
        );
        Self { objects, client_type, callback_type }
    }

    /// The object manager backing this framework, for stats queries and
    /// auto-release pools.
    pub fn objects(&self) -> &ObjectManager {
        &self.objects
    }

    /// Type handle of client objects.
    pub fn client_type(&self) -> TypeHandle {
        self.client_type
    }

    /// Type handle of callback objects.
    pub fn callback_type(&self) -> TypeHandle {
        self.callback_type
    }

    /// Creates a client with an empty id map, an id counter starting at
    /// zero, and a fresh handoff queue.
    pub fn create_client(&self) -> Result<ClientHandle, Error> {
        let shared = ClientShared::new();
        let obj = self
            .objects
            .create(self.client_type, Box::new(shared.clone()), CreateFlags::empty())?;
        log::debug!("client created (slot {})", obj.index());
        Ok(ClientHandle { obj, shared })
    }

    /// Tears the client down: the handoff queue is abandoned, waiting
    /// consumers see [`Removed::Abandoned`], every outstanding callback's
    /// completion fails with [`Error::Abandoned`], and the client object is
    /// released.
    ///
    /// Outstanding [`CallbackHandle`]s stay valid for
    /// [`CallbackFramework::destroy_callback`]; their producers observe the
    /// abandonment when `perform_callback` returns.
    pub fn destroy_client(&self, client: &ClientHandle) -> Result<(), Error> {
        for stranded in client.shared.queue().rundown() {
            stranded.mark_abandoned();
        }
        for outstanding in client.shared.take_all() {
            outstanding.mark_abandoned();
        }
        self.objects.dereference(client.obj)?;
        log::debug!("client destroyed (slot {})", client.obj.index());
        Ok(())
    }

    /// Allocates a callback for `data` and registers it in the client's id
    /// map. Ids start at 1 and are never reused for the client's lifetime.
    pub fn create_callback(
        &self,
        client: &ClientHandle,
        data: CallbackData,
    ) -> Result<CallbackHandle, Error> {
        let id = client.shared.next_id();
        let shared = client::CallbackShared::new(id, &client.shared, data);
        let obj = self
            .objects
            .create(self.callback_type, Box::new(shared.clone()), CreateFlags::empty())?;
        client.shared.insert(shared.clone());
        log::trace!("{id} created for event {}", data.event_id);
        Ok(CallbackHandle { obj, shared })
    }

    /// Unregisters the callback (removal is by identity, exactly once) and
    /// releases its record.
    ///
    /// Rejected with [`Error::InvalidState`] while the callback is still
    /// reachable from the handoff queue or a return in progress.
    pub fn destroy_callback(&self, callback: CallbackHandle) -> Result<(), Error> {
        match callback.shared.state() {
            state::QUEUED | state::DEQUEUED => return Err(Error::InvalidState),
            _ => {}
        }
        if let Some(client) = callback.shared.client() {
            client.remove(&callback.shared);
        }
        self.objects.dereference(callback.obj)?;
        Ok(())
    }

    /// Request data of the in-flight callback registered under `id`.
    pub fn find_callback(&self, client: &ClientHandle, id: CallbackId) -> Option<CallbackData> {
        client.shared.find(id).map(|cb| *cb.data())
    }

    /// Number of callbacks currently registered with the client.
    pub fn outstanding_callbacks(&self, client: &ClientHandle) -> usize {
        client.shared.outstanding()
    }

    /// Producer side: enqueues the callback at the tail of the client's
    /// handoff queue and blocks, with no timeout, until the consumer returns
    /// a result or the client is torn down.
    ///
    /// Must be called once per callback, by the thread that owns it.
    pub fn perform_callback(
        &self,
        callback: &CallbackHandle,
    ) -> Result<CallbackReturnData, Error> {
        if !callback.shared.transition(state::CREATED, state::QUEUED) {
            // Rundown may beat the producer to its own callback.
            return Err(if callback.shared.state() == state::ABANDONED {
                Error::Abandoned
            } else {
                Error::InvalidState
            });
        }
        let client = callback.shared.client().ok_or(Error::Abandoned)?;
        if let Err(err) = client.queue().push_back(callback.shared.clone()) {
            callback.shared.mark_abandoned();
            return Err(err);
        }
        log::trace!("{} queued, producer parked", callback.shared.id());
        callback.shared.completion().wait()
    }

    /// Consumer side: dequeues the next request, waiting up to `timeout`
    /// (indefinitely when `None`, polling when zero), and copies its payload
    /// into the consumer's `dest` slice.
    ///
    /// A failed copy pushes the request back onto the **head** of the queue
    /// so the next successful call redelivers it in order, and surfaces the
    /// copy error; the request is never lost.
    pub fn remove_callback(
        &self,
        client: &ClientHandle,
        timeout: Option<Duration>,
        space: &mut ConsumerSpace,
        dest: UserSlice,
    ) -> Result<Removed, Error> {
        match client.shared.queue().remove(timeout) {
            WaitOutcome::Timeout => Ok(Removed::Timeout),
            WaitOutcome::Interrupted => Ok(Removed::Interrupted),
            WaitOutcome::Abandoned => Ok(Removed::Abandoned),
            WaitOutcome::Entry(entry) => match boundary::copy_out(space, dest, entry.data()) {
                Ok(len) => {
                    if !entry.transition(state::QUEUED, state::DEQUEUED) {
                        log::warn!("{} dequeued in unexpected state", entry.id());
                    }
                    Ok(Removed::Callback { id: entry.id(), len })
                }
                Err(err) => {
                    client.shared.queue().push_front(entry);
                    Err(err)
                }
            },
        }
    }

    /// Consumer side: validates and copies the return payload in, matches it
    /// to the callback registered under `id`, and wakes the blocked
    /// producer.
    ///
    /// An `event_id` disagreement is rejected with [`Error::EventMismatch`]
    /// and leaves the callback untouched: its completion stays unset.
    pub fn return_callback(
        &self,
        client: &ClientHandle,
        id: CallbackId,
        space: &ConsumerSpace,
        src: UserSlice,
    ) -> Result<(), Error> {
        let ret = boundary::copy_in(space, src)?;
        let callback = client.shared.find(id).ok_or(Error::NotFound)?;
        if ret.event_id != callback.data().event_id {
            return Err(Error::EventMismatch);
        }
        if !callback.transition(state::DEQUEUED, state::RETURNED) {
            return Err(Error::InvalidState);
        }
        let first = callback.completion().complete(ret);
        debug_assert!(first, "completion already set despite winning the state transition");
        log::trace!("{id} returned with status {}", ret.status);
        Ok(())
    }

    /// Wakes consumers currently blocked in
    /// [`CallbackFramework::remove_callback`] with [`Removed::Interrupted`],
    /// modeling delivery of an external signal.
    pub fn interrupt(&self, client: &ClientHandle) {
        client.shared.queue().interrupt();
    }
}
