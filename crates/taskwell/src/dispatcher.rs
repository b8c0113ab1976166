// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The dispatcher contract and its ergonomic surface.

use std::fmt::Debug;
use std::sync::Arc;

use crate::Task;
use crate::task::RawTask;

/// A unit of accepted work, handed to a [`Dispatch`] implementation.
///
/// A dispatcher owns the decision of *when* the work runs; the item exposes
/// exactly the two things it may do with it: run it or cancel it. Both are
/// idempotent with respect to the task's single lifecycle transition.
pub struct WorkItem {
    raw: Arc<dyn RawTask>,
}

impl WorkItem {
    pub(crate) fn new(raw: Arc<dyn RawTask>) -> Self {
        Self { raw }
    }

    pub(crate) fn into_raw(self) -> Arc<dyn RawTask> {
        self.raw
    }

    /// Runs the work on the calling thread.
    ///
    /// Returns `false` if the task had already settled (for example it was
    /// cancelled while queued), in which case nothing was run.
    pub fn run(self) -> bool {
        self.raw.fire()
    }

    /// Discards the work, driving its task to the cancelled state.
    ///
    /// Returns `false` if the task had already settled.
    pub fn cancel(self) -> bool {
        self.raw.cancel_raw()
    }
}

impl Debug for WorkItem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkItem").finish_non_exhaustive()
    }
}

/// Accepts callables plus priorities and produces task handles.
///
/// Implementations decide scheduling: immediately on the caller
/// ([`ImmediateDispatcher`]), from a priority queue pumped by workers
/// ([`PriorityDispatcher`](crate::PriorityDispatcher)), or strictly one at a
/// time over another dispatcher
/// ([`SerialDispatcher`](crate::SerialDispatcher)). The typed entry points
/// live on [`DispatchExt`], which every `Dispatch` implementation gets for
/// free.
pub trait Dispatch: Send + Sync {
    /// Accepts one unit of work at `priority` (lower is more urgent).
    ///
    /// The implementation must eventually either run or cancel the item;
    /// dropping it silently strands its task as forever-pending.
    fn dispatch_item(&self, item: WorkItem, priority: i32);
}

/// Typed dispatch entry points, implemented for every [`Dispatch`].
pub trait DispatchExt: Dispatch {
    /// Dispatches a callable; the task settles with the callable's return
    /// value once the dispatcher runs it.
    fn dispatch<R, F>(&self, f: F, priority: i32) -> Arc<Task<R>>
    where
        R: Send + Sync + 'static,
        F: FnOnce() -> R + Send + 'static,
    {
        let task = Task::function(Box::new(move || Some(f())), None, priority, None);
        self.dispatch_item(WorkItem::new(task.clone()), priority);
        task
    }

    /// [`dispatch`](Self::dispatch) with a callback invoked if the task is
    /// cancelled before it runs.
    fn dispatch_with_cancel<R, F, C>(&self, f: F, on_cancel: C, priority: i32) -> Arc<Task<R>>
    where
        R: Send + Sync + 'static,
        F: FnOnce() -> R + Send + 'static,
        C: FnOnce() + Send + 'static,
    {
        let task = Task::function(
            Box::new(move || Some(f())),
            Some(Box::new(on_cancel)),
            priority,
            None,
        );
        self.dispatch_item(WorkItem::new(task.clone()), priority);
        task
    }

    /// Dispatches a callable that itself returns a task, producing a chained
    /// task that settles with the inner task's outcome.
    ///
    /// Cancellation of the chained task cancels whichever stage is currently
    /// outstanding; priority changes propagate likewise. See the
    /// `linked` module docs for the hand-off rules.
    fn dispatch_chained<R, F>(&self, f: F, priority: i32) -> Arc<Task<R>>
    where
        R: Send + Sync + 'static,
        F: FnOnce() -> Arc<Task<R>> + Send + 'static,
    {
        self.dispatch_chained_with_cancel(f, || {}, priority)
    }

    /// [`dispatch_chained`](Self::dispatch_chained) with a cancellation
    /// callback.
    fn dispatch_chained_with_cancel<R, F, C>(&self, f: F, on_cancel: C, priority: i32) -> Arc<Task<R>>
    where
        R: Send + Sync + 'static,
        F: FnOnce() -> Arc<Task<R>> + Send + 'static,
        C: FnOnce() + Send + 'static,
    {
        let (outer, stage) = Task::build_chain(f, on_cancel, priority);
        self.dispatch_item(WorkItem::new(stage), priority);
        outer
    }
}

impl<D: Dispatch + ?Sized> DispatchExt for D {}

/// Runs every dispatched task synchronously on the dispatching thread.
///
/// The degenerate dispatcher: no queue, no workers, no reordering. Useful as
/// the inner dispatcher of a
/// [`SerialDispatcher`](crate::SerialDispatcher) in tests and as the fallback
/// execution context where no scheduler is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct ImmediateDispatcher;

impl ImmediateDispatcher {
    /// Creates the dispatcher.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl Dispatch for ImmediateDispatcher {
    fn dispatch_item(&self, item: WorkItem, _priority: i32) {
        item.run();
    }
}
