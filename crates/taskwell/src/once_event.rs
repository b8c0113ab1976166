// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::fmt::Debug;
use std::sync::Arc;

use crate::task::{Task, WaitOutcome};
use crate::timeout::Timeout;

/// A waitable that signals exactly once and stays signaled.
///
/// Like a task without a payload or a cancellation path: waiters block until
/// the single [`signal`](Self::signal), continuations registered before it
/// fire when it happens, and everything after it completes immediately.
///
/// # Examples
///
/// ```
/// use taskwell::{OnceEvent, Timeout, WaitOutcome};
///
/// let event = OnceEvent::new();
/// assert!(event.signal());
/// assert!(!event.signal()); // only the first call transitions
/// assert_eq!(event.wait(&Timeout::none()), WaitOutcome::Signaled);
/// ```
pub struct OnceEvent {
    task: Arc<Task<()>>,
}

impl Debug for OnceEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OnceEvent")
            .field("signaled", &self.is_signaled())
            .finish()
    }
}

impl Default for OnceEvent {
    fn default() -> Self {
        Self::new()
    }
}

impl OnceEvent {
    /// Creates an unsignaled event.
    #[must_use]
    pub fn new() -> Self {
        Self {
            task: Task::pending_value(),
        }
    }

    /// Signals the event, waking all waiters and firing all continuations.
    /// Returns `true` iff *this* call effected the transition.
    pub fn signal(&self) -> bool {
        self.task.complete(())
    }

    /// Whether the event has been signaled.
    #[must_use]
    pub fn is_signaled(&self) -> bool {
        self.task.is_signaled()
    }

    /// Blocks until the event signals or the deadline passes.
    pub fn wait(&self, timeout: &Timeout) -> WaitOutcome {
        self.task.wait(timeout)
    }

    /// [`wait`](Self::wait) with a bounded pre-blocking spin.
    pub fn wait_spin(&self, timeout: &Timeout, spin_count: u32) -> WaitOutcome {
        self.task.wait_spin(timeout, spin_count)
    }

    /// Registers a continuation fired when the event signals; fires
    /// immediately (on the registering thread) if it already has.
    pub fn then<R, F>(&self, f: F, priority: i32) -> Arc<Task<R>>
    where
        R: Send + Sync + 'static,
        F: FnOnce() -> R + Send + 'static,
    {
        self.task.then(move |()| f(), priority)
    }
}
