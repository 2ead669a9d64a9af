// Copyright 2025 Callgate Contributors
// SPDX-License-Identifier: Apache-2.0

//! One-shot completion signal waking a blocked producer.

use callgate_abi::CallbackReturnData;
use parking_lot::{Condvar, Mutex};

use crate::Error;

enum State {
    Pending,
    Ready(CallbackReturnData),
    Abandoned,
}

/// One-shot signal: set at most once, observed by at most one waiter, never
/// reset.
pub(crate) struct Completion {
    state: Mutex<State>,
    signaled: Condvar,
}

impl Completion {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(State::Pending),
            signaled: Condvar::new(),
        }
    }

    /// Stores the result and wakes the waiter. Returns `false` when the
    /// signal was already set; the first resolution wins.
    pub(crate) fn complete(&self, data: CallbackReturnData) -> bool {
        let mut state = self.state.lock();
        if !matches!(*state, State::Pending) {
            return false;
        }
        *state = State::Ready(data);
        self.signaled.notify_all();
        true
    }

    /// Resolves the signal as abandoned (client rundown). Returns `false`
    /// when a result was already stored.
    pub(crate) fn abandon(&self) -> bool {
        let mut state = self.state.lock();
        if !matches!(*state, State::Pending) {
            return false;
        }
        *state = State::Abandoned;
        self.signaled.notify_all();
        true
    }

    /// Blocks until the signal resolves; no timeout.
    pub(crate) fn wait(&self) -> Result<CallbackReturnData, Error> {
        let mut state = self.state.lock();
        loop {
            match *state {
                State::Ready(data) => return Ok(data),
                State::Abandoned => return Err(Error::Abandoned),
                State::Pending => self.signaled.wait(&mut state),
            }
        }
    }
}
