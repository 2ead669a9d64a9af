// Copyright 2025 Callgate Contributors
// SPDX-License-Identifier: Apache-2.0

//! Validated data transfer across the privilege boundary.
//!
//! The consumer's memory is modeled as a [`ConsumerSpace`]: a byte region of
//! which only an explicit window is accessible to boundary copies. Consumers
//! name locations with untrusted [`UserSlice`] pairs; every copy decodes the
//! slice, checks it against the window, and only then touches memory
//! (decode, check, execute). Privileged-side logic never dereferences a
//! consumer-supplied location directly.

use callgate_abi::{CallbackData, CallbackReturnData};

use crate::Error;

/// Untrusted (offset, length) pair naming a region of consumer memory.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct UserSlice {
    /// Byte offset into the consumer's region.
    pub offset: usize,
    /// Length the consumer claims to have reserved.
    pub len: usize,
}

impl UserSlice {
    /// Creates a slice descriptor.
    pub fn new(offset: usize, len: usize) -> Self {
        Self { offset, len }
    }

    /// Resolves the slice against the permitted window, or reports the
    /// access fault the consumer would have taken.
    fn check(&self, space: &ConsumerSpace) -> Result<std::ops::Range<usize>, Error> {
        let end = self.offset.checked_add(self.len).ok_or(Error::Fault)?;
        if self.offset < space.window.start || end > space.window.end {
            return Err(Error::Fault);
        }
        Ok(self.offset..end)
    }
}

/// Modeled consumer address region with an accessible window.
pub struct ConsumerSpace {
    bytes: Vec<u8>,
    window: std::ops::Range<usize>,
}

impl ConsumerSpace {
    /// Creates a region of `len` bytes, all of it accessible.
    pub fn new(len: usize) -> Self {
        Self { bytes: vec![0; len], window: 0..len }
    }

    /// Creates a region where only `window` is accessible to boundary
    /// copies; everything outside it faults.
    pub fn with_window(len: usize, window: std::ops::Range<usize>) -> Self {
        debug_assert!(window.end <= len);
        Self { bytes: vec![0; len], window }
    }

    /// Consumer-side write into its own memory (test and consumer setup;
    /// not a boundary crossing).
    pub fn write(&mut self, offset: usize, data: &[u8]) {
        self.bytes[offset..offset + data.len()].copy_from_slice(data);
    }

    /// Consumer-side read of its own memory.
    pub fn read(&self, offset: usize, len: usize) -> &[u8] {
        &self.bytes[offset..offset + len]
    }
}

/// Copies a request payload out to the consumer.
///
/// Rejects `BufferTooSmall` before touching memory when the destination
/// cannot hold the fixed payload; rejects `Fault` when the slice escapes the
/// permitted window. On success returns the length written.
pub fn copy_out(
    space: &mut ConsumerSpace,
    dest: UserSlice,
    data: &CallbackData,
) -> Result<usize, Error> {
    if dest.len < CallbackData::WIRE_SIZE {
        return Err(Error::BufferTooSmall);
    }
    let range = dest.check(space)?;
    data.encode_into(&mut space.bytes[range]).ok_or(Error::Fault)
}

/// Copies a return payload in from the consumer.
///
/// The slice is validated against the window before any read; a malformed
/// frame converts to `Fault` instead of terminating the privileged side, and
/// an undersized declared frame is `BufferTooSmall`.
pub fn copy_in(space: &ConsumerSpace, src: UserSlice) -> Result<CallbackReturnData, Error> {
    if src.len < CallbackReturnData::WIRE_SIZE {
        return Err(Error::BufferTooSmall);
    }
    let range = src.check(space)?;
    CallbackReturnData::decode(&space.bytes[range]).ok_or(Error::Fault)
}
