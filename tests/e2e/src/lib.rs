// Copyright 2025 Callgate Contributors
// SPDX-License-Identifier: Apache-2.0

#![forbid(unsafe_code)]

//! Shared helpers for the end-to-end bridge scenarios.

use std::sync::Arc;

use callgate::boundary::{ConsumerSpace, UserSlice};
use callgate::{CallbackFramework, Config};
use callgate_abi::{CallbackData, CallbackReturnData};

/// Framework with the default configuration, shareable across threads.
pub fn framework() -> Arc<CallbackFramework> {
    Arc::new(CallbackFramework::new(Config::default()))
}

/// Request payload for `event_id` with a recognizable argument pattern.
pub fn request(event_id: u32, sequence: u64) -> CallbackData {
    CallbackData::new(event_id, sequence, [sequence, sequence + 1, sequence + 2, sequence + 3])
}

/// Decodes the request frame the consumer received at `offset`.
pub fn read_request(space: &ConsumerSpace, offset: usize) -> CallbackData {
    CallbackData::decode(space.read(offset, CallbackData::WIRE_SIZE)).expect("valid request frame")
}

/// Stages a return frame in the consumer's memory and names its location.
pub fn stage_return(
    space: &mut ConsumerSpace,
    offset: usize,
    event_id: u32,
    status: u32,
    result: u64,
) -> UserSlice {
    let ret = CallbackReturnData::new(event_id, status, result);
    let mut frame = [0u8; CallbackReturnData::WIRE_SIZE];
    ret.encode_into(&mut frame).expect("encode return frame");
    space.write(offset, &frame);
    UserSlice::new(offset, CallbackReturnData::WIRE_SIZE)
}

/// Destination slice sized for one request frame at `offset`.
pub fn request_dest(offset: usize) -> UserSlice {
    UserSlice::new(offset, CallbackData::WIRE_SIZE)
}
