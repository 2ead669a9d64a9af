// Copyright 2025 Callgate Contributors
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), no_std)]
#![forbid(unsafe_code)]
#![deny(clippy::all, missing_docs)]

//! CONTEXT: Fixed-size payload frames crossing the privilege boundary
//! OWNERS: @runtime
//! PUBLIC API: CallbackData, CallbackReturnData, event::*, status::*
//! INVARIANTS: Frames are little-endian, versioned by their declared size;
//!             decoders never trust a length they did not verify
//!
//! The bridge treats both frames as opaque beyond the header fields defined
//! here: `event_id` ties a returned result to the kind of request it answers,
//! `size` lets newer peers append fields without breaking older decoders.

/// Request event identifiers raised by the privileged side.
pub mod event {
    /// A process is being created.
    pub const PROCESS_CREATE: u32 = 1;
    /// A process is exiting.
    pub const PROCESS_EXIT: u32 = 2;
    /// A thread is being created.
    pub const THREAD_CREATE: u32 = 3;
    /// A thread is exiting.
    pub const THREAD_EXIT: u32 = 4;
    /// An executable image is being mapped.
    pub const IMAGE_LOAD: u32 = 5;
}

/// Status codes carried on returned results.
pub mod status {
    /// Consumer processed the request and allows it.
    pub const OK: u32 = 0;
    /// Consumer denies the request.
    pub const DENIED: u32 = 1;
    /// Consumer declined to make a decision.
    pub const SKIPPED: u32 = 2;
}

/// Request payload handed from producer to consumer.
///
/// `args` is caller-defined and opaque to the bridge.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CallbackData {
    /// Declared frame size; at least [`CallbackData::WIRE_SIZE`].
    pub size: u32,
    /// Kind of request, one of [`event`].
    pub event_id: u32,
    /// Producer-side sequence number, for consumer-side tracing.
    pub sequence: u64,
    /// Opaque request arguments.
    pub args: [u64; 4],
}

impl CallbackData {
    /// Encoded size of the fields this version knows about.
    pub const WIRE_SIZE: usize = 4 + 4 + 8 + 8 * 4;

    /// Creates a current-version frame for `event_id`.
    pub fn new(event_id: u32, sequence: u64, args: [u64; 4]) -> Self {
        Self { size: Self::WIRE_SIZE as u32, event_id, sequence, args }
    }

    /// Encodes the frame into `out`, returning the length written.
    ///
    /// Returns `None` when `out` cannot hold [`CallbackData::WIRE_SIZE`]
    /// bytes.
    pub fn encode_into(&self, out: &mut [u8]) -> Option<usize> {
        if out.len() < Self::WIRE_SIZE {
            return None;
        }
        out[0..4].copy_from_slice(&self.size.to_le_bytes());
        out[4..8].copy_from_slice(&self.event_id.to_le_bytes());
        out[8..16].copy_from_slice(&self.sequence.to_le_bytes());
        for (i, arg) in self.args.iter().enumerate() {
            let at = 16 + i * 8;
            out[at..at + 8].copy_from_slice(&arg.to_le_bytes());
        }
        Some(Self::WIRE_SIZE)
    }

    /// Decodes a frame, tolerating trailing bytes a newer peer appended.
    ///
    /// Rejects frames shorter than this version, frames whose declared size
    /// is smaller than this version, and frames with a zero event id.
    pub fn decode(frame: &[u8]) -> Option<Self> {
        if frame.len() < Self::WIRE_SIZE {
            return None;
        }
        let size = u32::from_le_bytes(frame[0..4].try_into().ok()?);
        if (size as usize) < Self::WIRE_SIZE {
            return None;
        }
        let event_id = u32::from_le_bytes(frame[4..8].try_into().ok()?);
        if event_id == 0 {
            return None;
        }
        let sequence = u64::from_le_bytes(frame[8..16].try_into().ok()?);
        let mut args = [0u64; 4];
        for (i, arg) in args.iter_mut().enumerate() {
            let at = 16 + i * 8;
            *arg = u64::from_le_bytes(frame[at..at + 8].try_into().ok()?);
        }
        Some(Self { size, event_id, sequence, args })
    }
}

/// Result payload handed back from consumer to producer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CallbackReturnData {
    /// Declared frame size; at least [`CallbackReturnData::WIRE_SIZE`].
    pub size: u32,
    /// Must match the `event_id` of the request being answered.
    pub event_id: u32,
    /// One of [`status`].
    pub status: u32,
    /// Opaque consumer result.
    pub result: u64,
}

impl CallbackReturnData {
    /// Encoded size of the fields this version knows about.
    pub const WIRE_SIZE: usize = 4 + 4 + 4 + 8;

    /// Creates a current-version result frame answering `event_id`.
    pub fn new(event_id: u32, status: u32, result: u64) -> Self {
        Self { size: Self::WIRE_SIZE as u32, event_id, status, result }
    }

    /// Encodes the frame into `out`, returning the length written.
    pub fn encode_into(&self, out: &mut [u8]) -> Option<usize> {
        if out.len() < Self::WIRE_SIZE {
            return None;
        }
        out[0..4].copy_from_slice(&self.size.to_le_bytes());
        out[4..8].copy_from_slice(&self.event_id.to_le_bytes());
        out[8..12].copy_from_slice(&self.status.to_le_bytes());
        out[12..20].copy_from_slice(&self.result.to_le_bytes());
        Some(Self::WIRE_SIZE)
    }

    /// Decodes a result frame with the same size discipline as
    /// [`CallbackData::decode`].
    pub fn decode(frame: &[u8]) -> Option<Self> {
        if frame.len() < Self::WIRE_SIZE {
            return None;
        }
        let size = u32::from_le_bytes(frame[0..4].try_into().ok()?);
        if (size as usize) < Self::WIRE_SIZE {
            return None;
        }
        let event_id = u32::from_le_bytes(frame[4..8].try_into().ok()?);
        if event_id == 0 {
            return None;
        }
        let status = u32::from_le_bytes(frame[8..12].try_into().ok()?);
        let result = u64::from_le_bytes(frame[12..20].try_into().ok()?);
        Some(Self { size, event_id, status, result })
    }
}
