// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::fmt::Debug;
use std::sync::Arc;

use crate::resettable_event::ResettableEvent;
use crate::task::{Task, WaitOutcome};
use crate::timeout::Timeout;

/// An event whose signal wakes exactly one waiter and then rearms itself.
///
/// Built directly on [`ResettableEvent`]: `signal` is its single-delivery
/// pulse, so a signal with nobody waiting is stored and satisfies the next
/// waiter, and each delivered wake leaves the event unset for the one after.
#[derive(Debug, Default)]
pub struct AutoResetEvent {
    event: ResettableEvent,
}

impl AutoResetEvent {
    /// Creates the event in the unset state.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Wakes one waiter or continuation, or stores the wake for the next
    /// waiter. Returns `true` iff the wake was delivered before returning.
    pub fn signal(&self) -> bool {
        self.event.pulse_one()
    }

    /// Discards a stored wake, if any. Returns `true` iff one was stored.
    pub fn reset(&self) -> bool {
        self.event.reset()
    }

    /// Wakes every waiter present and fires all queued continuations.
    pub fn pulse_all(&self) -> bool {
        self.event.pulse_all()
    }

    /// Blocks until a wake is delivered to this caller or the deadline
    /// passes.
    pub fn wait(&self, timeout: &Timeout) -> WaitOutcome {
        self.event.wait(timeout)
    }

    /// [`wait`](Self::wait) with a bounded pre-blocking spin.
    pub fn wait_spin(&self, timeout: &Timeout, spin_count: u32) -> WaitOutcome {
        self.event.wait_spin(timeout, spin_count)
    }

    /// Registers a continuation eligible for a single-delivery wake.
    pub fn then<R, F>(&self, f: F, priority: i32) -> Arc<Task<R>>
    where
        R: Send + Sync + 'static,
        F: FnOnce() -> R + Send + 'static,
    {
        self.event.then(f, priority)
    }
}
