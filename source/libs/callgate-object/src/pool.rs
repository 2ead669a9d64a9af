// Copyright 2025 Callgate Contributors
// SPDX-License-Identifier: Apache-2.0

//! Scope-bound batch release of object references.

use std::marker::PhantomData;

use crate::{ObjectManager, ObjectRef};

/// References kept inline before spilling to the overflow buffer.
const INLINE_CAPACITY: usize = 16;

/// Overflow capacity above which a drained pool gives the buffer back,
/// so a long-lived pool does not pin its high-water mark.
const OVERFLOW_RETAIN: usize = 64;

/// A stack-scoped batch of object references released together.
///
/// Registered references are dereferenced in registration order when the
/// pool is drained, and `drain` runs from `Drop` as well, so binding a pool
/// to a call frame releases everything deferred into it. The pool is not
/// `Send`: it belongs to the thread that created it.
pub struct AutoReleasePool<'m> {
    manager: &'m ObjectManager,
    inline: [Option<ObjectRef>; INLINE_CAPACITY],
    inline_len: usize,
    overflow: Vec<ObjectRef>,
    _single_thread: PhantomData<*const ()>,
}

impl<'m> AutoReleasePool<'m> {
    /// Creates an empty pool releasing through `manager`.
    pub fn new(manager: &'m ObjectManager) -> Self {
        Self {
            manager,
            inline: [None; INLINE_CAPACITY],
            inline_len: 0,
            overflow: Vec::new(),
            _single_thread: PhantomData,
        }
    }

    /// Registers `obj` for release when the pool drains.
    pub fn defer(&mut self, obj: ObjectRef) {
        if self.inline_len < INLINE_CAPACITY {
            self.inline[self.inline_len] = Some(obj);
            self.inline_len += 1;
        } else {
            self.overflow.push(obj);
        }
    }

    /// Number of references currently registered.
    pub fn len(&self) -> usize {
        self.inline_len + self.overflow.len()
    }

    /// Whether the pool holds no registered references.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Dereferences every registered object in registration order and resets
    /// the pool for reuse.
    pub fn drain(&mut self) {
        for slot in self.inline.iter_mut().take(self.inline_len) {
            if let Some(obj) = slot.take() {
                if let Err(err) = self.manager.dereference(obj) {
                    log::warn!("auto pool release of slot {} failed: {err}", obj.index());
                }
            }
        }
        self.inline_len = 0;
        for obj in self.overflow.drain(..) {
            if let Err(err) = self.manager.dereference(obj) {
                log::warn!("auto pool release of slot {} failed: {err}", obj.index());
            }
        }
        if self.overflow.capacity() > OVERFLOW_RETAIN {
            self.overflow = Vec::new();
        }
    }
}

impl Drop for AutoReleasePool<'_> {
    fn drop(&mut self) {
        self.drain();
    }
}
