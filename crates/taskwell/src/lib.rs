// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

#![cfg_attr(
    test,
    allow(
        clippy::arithmetic_side_effects,
        clippy::cast_possible_truncation,
        clippy::unwrap_used,
        reason = "allow these lints in tests to improve the readability of the tests"
    )
)]

//! Priority-aware tasks, dispatchers, and resettable events for thread-based
//! schedulers.
//!
//! # Why?
//!
//! This crate separates *what* deferred work is from *when and where* it
//! runs. Callables are submitted to a [`Dispatch`] implementation together
//! with an integer priority (lower is more urgent) and come back as
//! [`Task`] handles that can be awaited with a deadline, cancelled
//! cooperatively, reprioritized while still queued, and chained with
//! continuations — all without committing the submitting code to any
//! particular threading model. Everything here is plain threads and atomics;
//! there is no async runtime underneath.
//!
//! # Overview
//!
//! - [`Task`] — a deferred computation with a lifecycle of pending →
//!   {signaled | cancelled}, waiting, continuation chaining, and in-flight
//!   priority changes.
//! - [`Dispatch`] / [`DispatchExt`] — the dispatcher contract and its typed
//!   entry points, including chained dispatch for callables that themselves
//!   return tasks.
//! - [`PriorityDispatcher`] — holds pending tasks sorted by priority until
//!   consumer threads pump them with `invoke`.
//! - [`SerialDispatcher`] — funnels tasks through an inner dispatcher
//!   strictly one at a time in priority order, honoring priority changes
//!   that arrive after scheduling.
//! - [`ImmediateDispatcher`] — runs everything synchronously on the
//!   dispatching thread.
//! - [`OnceEvent`], [`ResettableEvent`], [`AutoResetEvent`] — waitables with
//!   signal/reset/pulse semantics and continuation support.
//! - [`Timeout`] — an absolute deadline on a wrap-tolerant monotonic
//!   counter, shared by every waiting operation.
//!
//! # Example
//!
//! ```
//! use taskwell::{DispatchExt, PriorityDispatcher, Timeout, WaitOutcome};
//!
//! let dispatcher = PriorityDispatcher::new();
//!
//! let answer = dispatcher.dispatch(|| 6 * 7, 5);
//! let urgent = dispatcher.dispatch(|| "first", 1);
//!
//! // Some worker thread pumps the dispatcher; here, inline:
//! while dispatcher.invoke() {}
//!
//! assert_eq!(*urgent.get(), "first");
//! assert_eq!(answer.wait(&Timeout::none()), WaitOutcome::Signaled);
//! assert_eq!(*answer.then(|v| v + 1, 0).get(), 43);
//! ```
//!
//! # Thread Safety
//!
//! Every documented operation on every documented type is safe to call from
//! any thread. The only operations that block are the `wait` family (with a
//! deadline) and whatever a user-supplied dispatcher blocks on; internal
//! state is kept in single-word atomics or short critical sections.

mod auto_reset_event;
mod dispatcher;
mod linked;
mod once_event;
mod priority_dispatcher;
mod resettable_event;
mod serial_dispatcher;
mod task;
mod timeout;

pub use auto_reset_event::AutoResetEvent;
pub use dispatcher::{Dispatch, DispatchExt, ImmediateDispatcher, WorkItem};
pub use once_event::OnceEvent;
pub use priority_dispatcher::PriorityDispatcher;
pub use resettable_event::ResettableEvent;
pub use serial_dispatcher::SerialDispatcher;
pub use task::{DynTask, Task, TaskState, WaitOutcome};
pub use timeout::{Tick, Timeout};
