// Copyright 2025 Callgate Contributors
// SPDX-License-Identifier: Apache-2.0

#![forbid(unsafe_code)]
#![deny(clippy::all, missing_docs)]

//! CONTEXT: Reference-counted object manager backing the callback bridge
//! OWNERS: @runtime
//! PUBLIC API: ObjectManager, ObjectRef, TypeHandle, TypeFlags, CreateFlags,
//!             AutoReleasePool
//! INVARIANTS: A reference count never goes below zero; a type's delete
//!             procedure runs exactly once, on the 1 -> 0 transition; a
//!             recycled slot bumps its generation so stale handles are
//!             detected instead of aliasing a new object
//!
//! Objects live in a bounded arena of generation-tagged slots. Per-type free
//! lists and the deferred-release list are owned by the manager instance;
//! there is no process-wide state.

mod pool;

pub use pool::AutoReleasePool;

use std::any::Any;
use std::sync::atomic::{AtomicI32, AtomicU64, Ordering};
use std::sync::Arc;

use bitflags::bitflags;
use parking_lot::{Mutex, RwLock};
use thiserror::Error;

/// Opaque payload stored in an object slot.
pub type Payload = Box<dyn Any + Send + Sync>;

/// Procedure invoked with the payload when an object's count reaches zero.
pub type DeleteProc = Box<dyn Fn(Payload) + Send + Sync>;

bitflags! {
    /// Behavior flags fixed at type registration.
    #[derive(Clone, Copy, PartialEq, Eq, Debug)]
    pub struct TypeFlags: u32 {
        /// Freed instances are kept on a per-type free list for reuse.
        const USE_FREE_LIST = 1 << 0;
    }
}

bitflags! {
    /// Behavior flags for a single allocation.
    #[derive(Clone, Copy, PartialEq, Eq, Debug)]
    pub struct CreateFlags: u32 {
        /// Panic on allocation failure instead of returning
        /// [`ObjectError::OutOfMemory`]. A caller selecting this mode is
        /// never handed a dead handle silently.
        const RAISE_ON_FAIL = 1 << 0;
    }
}

/// Tuning knobs fixed at type registration.
#[derive(Clone, Copy, Debug)]
pub struct TypeParameters {
    /// Maximum number of freed slots retained on the type's free list.
    pub free_list_limit: usize,
}

impl Default for TypeParameters {
    fn default() -> Self {
        Self { free_list_limit: 64 }
    }
}

/// Errors produced by object manager operations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ObjectError {
    /// The arena has no free slot left.
    #[error("object arena exhausted")]
    OutOfMemory,
    /// The handle is stale (its slot was recycled) or never existed.
    #[error("stale or invalid object handle")]
    InvalidHandle,
    /// The type handle does not name a registered type.
    #[error("unknown object type")]
    InvalidType,
    /// The operation would drive a reference count below zero.
    #[error("reference count underflow")]
    Underflow,
}

/// Handle to a registered object type.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TypeHandle(u32);

/// Copyable handle to a live object.
///
/// The generation tag distinguishes the current occupant of a slot from any
/// previous one, so use of a released handle fails instead of touching an
/// unrelated object.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ObjectRef {
    index: u32,
    generation: u32,
}

impl ObjectRef {
    /// Arena slot index, exposed for diagnostics.
    pub fn index(&self) -> u32 {
        self.index
    }
}

/// Live-object statistics for one registered type.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TypeInfo {
    /// Name given at registration.
    pub name: String,
    /// Objects currently alive: creations minus completed deletes.
    pub live: u64,
}

struct TypeRecord {
    name: String,
    flags: TypeFlags,
    free_list_limit: usize,
    live: AtomicU64,
    delete: Option<DeleteProc>,
}

struct Live {
    type_index: u32,
    refcount: AtomicI32,
    payload: Option<Payload>,
}

struct Slot {
    generation: u32,
    live: Option<Live>,
}

struct Arena {
    slots: Vec<Slot>,
    free: Vec<u32>,
    type_free: Vec<Vec<u32>>,
}

impl Arena {
    fn locate(&self, obj: ObjectRef) -> Result<&Live, ObjectError> {
        let slot = self
            .slots
            .get(obj.index as usize)
            .ok_or(ObjectError::InvalidHandle)?;
        if slot.generation != obj.generation {
            return Err(ObjectError::InvalidHandle);
        }
        slot.live.as_ref().ok_or(ObjectError::InvalidHandle)
    }
}

/// Type-tagged, reference-counted object arena.
///
/// All pools and bookkeeping are owned by the instance. The manager is
/// `Send + Sync`; individual operations take the arena lock only for the
/// duration of the structural mutation, and delete procedures always run
/// with no manager lock held.
pub struct ObjectManager {
    types: RwLock<Vec<Arc<TypeRecord>>>,
    arena: RwLock<Arena>,
    deferred: Mutex<Vec<ObjectRef>>,
    capacity: usize,
}

impl ObjectManager {
    /// Creates a manager whose arena holds at most `capacity` objects.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            types: RwLock::new(Vec::new()),
            arena: RwLock::new(Arena {
                slots: Vec::new(),
                free: Vec::new(),
                type_free: Vec::new(),
            }),
            deferred: Mutex::new(Vec::new()),
            capacity,
        }
    }

    /// Registers a new object type; the handle is valid for the manager's
    /// lifetime.
    pub fn register_type(
        &self,
        name: &str,
        flags: TypeFlags,
        params: TypeParameters,
        delete: Option<DeleteProc>,
    ) -> TypeHandle {
        let mut types = self.types.write();
        let index = types.len() as u32;
        types.push(Arc::new(TypeRecord {
            name: name.to_string(),
            flags,
            free_list_limit: params.free_list_limit,
            live: AtomicU64::new(0),
            delete,
        }));
        log::debug!("registered object type {name:?} as #{index}");
        TypeHandle(index)
    }

    fn type_record(&self, ty: TypeHandle) -> Result<Arc<TypeRecord>, ObjectError> {
        self.types
            .read()
            .get(ty.0 as usize)
            .cloned()
            .ok_or(ObjectError::InvalidType)
    }

    /// Allocates an object of `ty` holding `payload`, with a count of one.
    ///
    /// With [`CreateFlags::RAISE_ON_FAIL`] an exhausted arena panics instead
    /// of returning [`ObjectError::OutOfMemory`].
    pub fn create(
        &self,
        ty: TypeHandle,
        payload: Payload,
        flags: CreateFlags,
    ) -> Result<ObjectRef, ObjectError> {
        let record = self.type_record(ty)?;
        let mut arena = self.arena.write();
        if arena.type_free.len() <= ty.0 as usize {
            arena.type_free.resize_with(ty.0 as usize + 1, Vec::new);
        }
        let mut index = arena.type_free[ty.0 as usize].pop();
        if index.is_none() {
            index = arena.free.pop();
        }
        if index.is_none() && arena.slots.len() < self.capacity {
            arena.slots.push(Slot { generation: 0, live: None });
            index = Some((arena.slots.len() - 1) as u32);
        }
        let index = match index {
            Some(index) => index,
            None if flags.contains(CreateFlags::RAISE_ON_FAIL) => {
                panic!("object arena exhausted while RAISE_ON_FAIL is set")
            }
            None => return Err(ObjectError::OutOfMemory),
        };
        let slot = &mut arena.slots[index as usize];
        debug_assert!(slot.live.is_none(), "allocated an occupied slot");
        slot.live = Some(Live {
            type_index: ty.0,
            refcount: AtomicI32::new(1),
            payload: Some(payload),
        });
        record.live.fetch_add(1, Ordering::Relaxed);
        Ok(ObjectRef { index, generation: slot.generation })
    }

    /// Adds one reference. The object must still be alive; referencing a
    /// handle whose count already reached zero is a caller bug and reports
    /// [`ObjectError::InvalidHandle`].
    pub fn reference(&self, obj: ObjectRef) -> Result<(), ObjectError> {
        self.reference_ex(obj, 1).map(|_| ())
    }

    /// Adds `delta` (positive or negative) references, returning the new
    /// count. A negative delta reaching zero releases the object exactly as
    /// [`ObjectManager::dereference`] does.
    pub fn reference_ex(&self, obj: ObjectRef, delta: i32) -> Result<i32, ObjectError> {
        if delta == 0 {
            let arena = self.arena.read();
            return Ok(arena.locate(obj)?.refcount.load(Ordering::Acquire));
        }
        let new_count = {
            let arena = self.arena.read();
            let live = arena.locate(obj)?;
            let mut current = live.refcount.load(Ordering::Acquire);
            loop {
                if current <= 0 {
                    return Err(ObjectError::InvalidHandle);
                }
                let next = current + delta;
                if next < 0 {
                    return Err(ObjectError::Underflow);
                }
                match live.refcount.compare_exchange_weak(
                    current,
                    next,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                ) {
                    Ok(_) => break next,
                    Err(observed) => current = observed,
                }
            }
        };
        if new_count == 0 {
            self.release(obj);
        }
        Ok(new_count)
    }

    /// Adds one reference only if the count has not already reached zero.
    ///
    /// Safe against racing a concurrent delete of an object discovered
    /// through a weak or back reference; returns `false` when the race was
    /// lost or the handle is stale.
    pub fn reference_safe(&self, obj: ObjectRef) -> bool {
        let arena = self.arena.read();
        let live = match arena.locate(obj) {
            Ok(live) => live,
            Err(_) => return false,
        };
        let mut current = live.refcount.load(Ordering::Acquire);
        loop {
            if current <= 0 {
                return false;
            }
            match live.refcount.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(observed) => current = observed,
            }
        }
    }

    /// Drops one reference; the 1 -> 0 transition runs the type's delete
    /// procedure synchronously and recycles the slot.
    pub fn dereference(&self, obj: ObjectRef) -> Result<(), ObjectError> {
        self.reference_ex(obj, -1).map(|_| ())
    }

    /// Drops one reference, but parks a would-be final release on the
    /// deferred list instead of running the delete procedure. Returns `true`
    /// when the release was parked; callers holding locks use this form and
    /// call [`ObjectManager::drain_deferred`] after unlocking.
    pub fn dereference_deferred(&self, obj: ObjectRef) -> Result<bool, ObjectError> {
        {
            let arena = self.arena.read();
            let live = arena.locate(obj)?;
            let mut current = live.refcount.load(Ordering::Acquire);
            loop {
                if current <= 0 {
                    return Err(ObjectError::InvalidHandle);
                }
                if current == 1 {
                    // Keep the final reference alive until the drain pass.
                    break;
                }
                match live.refcount.compare_exchange_weak(
                    current,
                    current - 1,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                ) {
                    Ok(_) => return Ok(false),
                    Err(observed) => current = observed,
                }
            }
        }
        self.deferred.lock().push(obj);
        log::trace!("deferred release of slot {}", obj.index);
        Ok(true)
    }

    /// Releases everything parked by
    /// [`ObjectManager::dereference_deferred`], outside any caller lock.
    /// Returns the number of objects released.
    pub fn drain_deferred(&self) -> usize {
        let parked = std::mem::take(&mut *self.deferred.lock());
        let drained = parked.len();
        for obj in parked {
            if let Err(err) = self.dereference(obj) {
                log::warn!("deferred release of slot {} failed: {err}", obj.index);
            }
        }
        drained
    }

    /// Replaces the object held by `slot`, referencing the new value before
    /// dereferencing the old one so the slot never holds zero references.
    pub fn swap(
        &self,
        slot: &mut Option<ObjectRef>,
        new: Option<ObjectRef>,
    ) -> Result<(), ObjectError> {
        if let Some(new) = new {
            self.reference(new)?;
        }
        let old = std::mem::replace(slot, new);
        if let Some(old) = old {
            self.dereference(old)?;
        }
        Ok(())
    }

    /// Runs `f` against the object's payload.
    pub fn with_payload<R>(
        &self,
        obj: ObjectRef,
        f: impl FnOnce(&(dyn Any + Send + Sync)) -> R,
    ) -> Result<R, ObjectError> {
        let arena = self.arena.read();
        let live = arena.locate(obj)?;
        let payload = live.payload.as_ref().ok_or(ObjectError::InvalidHandle)?;
        Ok(f(payload.as_ref()))
    }

    /// Live-object statistics for `ty`.
    pub fn type_info(&self, ty: TypeHandle) -> Result<TypeInfo, ObjectError> {
        let record = self.type_record(ty)?;
        Ok(TypeInfo {
            name: record.name.clone(),
            live: record.live.load(Ordering::Relaxed),
        })
    }

    /// Frees a slot whose count already reached zero. The delete procedure
    /// runs after every manager lock is released.
    fn release(&self, obj: ObjectRef) {
        let (record, payload) = {
            let mut arena = self.arena.write();
            let slot = match arena.slots.get_mut(obj.index as usize) {
                Some(slot) if slot.generation == obj.generation => slot,
                _ => {
                    debug_assert!(false, "release of stale handle");
                    return;
                }
            };
            let mut live = match slot.live.take() {
                Some(live) => live,
                None => {
                    debug_assert!(false, "release of free slot");
                    return;
                }
            };
            debug_assert_eq!(live.refcount.load(Ordering::Acquire), 0);
            slot.generation = slot.generation.wrapping_add(1);
            let record = self.types.read()[live.type_index as usize].clone();
            let type_index = live.type_index as usize;
            if record.flags.contains(TypeFlags::USE_FREE_LIST)
                && arena.type_free[type_index].len() < record.free_list_limit
            {
                arena.type_free[type_index].push(obj.index);
            } else {
                arena.free.push(obj.index);
            }
            (record, live.payload.take())
        };
        record.live.fetch_sub(1, Ordering::Relaxed);
        if let (Some(delete), Some(payload)) = (record.delete.as_ref(), payload) {
            delete(payload);
        }
        log::trace!("released slot {} of type {:?}", obj.index, record.name);
    }
}
