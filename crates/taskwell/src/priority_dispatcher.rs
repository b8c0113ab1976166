// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::fmt::Debug;
use std::sync::{Arc, Weak};

use priq::{PriorityQueue, RemoveToken};

use crate::dispatcher::{Dispatch, WorkItem};
use crate::task::{DispatchedHandle, DynTask, QueueOwner, RawTask, Task};

/// A dispatcher that holds pending tasks sorted by priority until a consumer
/// pumps them.
///
/// Dispatching queues the task; nothing runs until some thread calls
/// [`invoke`](Self::invoke) (or a bounded variant), which pops and runs the
/// highest-priority pending task on the calling thread. Queued tasks remain
/// fully addressable: cancellation removes them in O(log n), and
/// [`Task::change_priority`](crate::Task::change_priority) moves them while
/// they wait, even under contention with concurrent `invoke` calls.
///
/// # Examples
///
/// ```
/// use taskwell::{DispatchExt, PriorityDispatcher};
///
/// let dispatcher = PriorityDispatcher::new();
/// dispatcher.dispatch(|| println!("relaxed"), 10);
/// dispatcher.dispatch(|| println!("urgent"), 1);
///
/// assert!(dispatcher.invoke()); // runs "urgent"
/// assert!(dispatcher.invoke()); // runs "relaxed"
/// assert!(!dispatcher.invoke()); // nothing left
/// ```
pub struct PriorityDispatcher {
    queue: PriorityQueue<i32, Arc<dyn RawTask>>,
    weak_self: Weak<Self>,
}

impl Debug for PriorityDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PriorityDispatcher")
            .field("len", &self.len())
            .finish_non_exhaustive()
    }
}

impl PriorityDispatcher {
    /// Creates an empty dispatcher.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new_cyclic(|weak_self| Self {
            queue: PriorityQueue::new(),
            weak_self: Weak::clone(weak_self),
        })
    }

    /// Pops and runs the highest-priority pending task.
    ///
    /// Tasks found already cancelled are discarded and the next is tried.
    /// Returns `true` iff some task was run.
    pub fn invoke(&self) -> bool {
        while let Some(entry) = self.queue.pop() {
            if entry.value().fire() {
                return true;
            }
        }
        false
    }

    /// [`invoke`](Self::invoke) bounded to tasks at least as urgent as
    /// `lowest_priority`; a head task worse than the bound is left queued.
    pub fn try_invoke(&self, lowest_priority: i32) -> bool {
        while let Some(entry) = self.queue.pop_if_at_most(&lowest_priority) {
            if entry.value().fire() {
                return true;
            }
        }
        false
    }

    /// Removes a specific queued task and runs it on the calling thread.
    ///
    /// Returns `false` if the task is not queued here (already popped,
    /// cancelled, or dispatched elsewhere).
    pub fn remove_and_invoke<T: Send + Sync + 'static>(&self, task: &Arc<Task<T>>) -> bool {
        let Some(token) = task.dispatched_token() else {
            return false;
        };
        if !self.queue.remove(&token) {
            return false;
        }
        let raw: Arc<dyn RawTask> = task.clone();
        raw.fire()
    }

    /// The head task without removing it.
    #[must_use]
    pub fn peek(&self) -> Option<Arc<dyn DynTask>> {
        self.queue.peek().map(|entry| {
            let raw = Arc::clone(entry.value());
            raw as Arc<dyn DynTask>
        })
    }

    /// The head task's priority; `i32::MAX` when empty.
    #[must_use]
    pub fn next_priority(&self) -> i32 {
        self.queue.peek_priority().unwrap_or(i32::MAX)
    }

    /// Number of queued tasks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// Whether no tasks are queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Discards all queued tasks without settling them; their handles stay
    /// pending forever. Prefer [`drain`](Self::drain) unless the tasks are
    /// known to be abandoned.
    pub fn clear(&self) {
        self.queue.clear();
    }

    /// Cancels everything queued. Returns `true` iff any task was cancelled.
    pub fn drain(&self) -> bool {
        let mut any = false;
        for entry in self.queue.drain() {
            any |= entry.value().cancel_raw();
        }
        any
    }
}

impl Dispatch for PriorityDispatcher {
    fn dispatch_item(&self, item: WorkItem, priority: i32) {
        let raw = item.into_raw();
        let token = self.queue.insert(priority, Arc::clone(&raw));
        let owner: Weak<dyn QueueOwner> = self.weak_self.clone();
        raw.set_dispatched(DispatchedHandle::new(owner, token));
    }
}

impl QueueOwner for PriorityDispatcher {
    fn cancel_queued(&self, token: &RemoveToken<i32, Arc<dyn RawTask>>) -> bool {
        self.queue.remove(token)
    }

    fn change_queued_priority(&self, token: &RemoveToken<i32, Arc<dyn RawTask>>, new_priority: i32) {
        self.queue.change_priority(token, new_priority);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use crate::DispatchExt;

    use super::*;

    #[test]
    fn dispatcher_send_and_sync() {
        static_assertions::assert_impl_all!(PriorityDispatcher: Send, Sync);
    }

    #[test]
    fn invoke_runs_in_priority_order() {
        let dispatcher = PriorityDispatcher::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        for (priority, name) in [(10, "a"), (1, "b"), (5, "c")] {
            let order = Arc::clone(&order);
            dispatcher.dispatch(move || order.lock().unwrap().push(name), priority);
        }

        while dispatcher.invoke() {}
        assert_eq!(*order.lock().unwrap(), ["b", "c", "a"]);
    }

    #[test]
    fn cancelled_tasks_are_skipped() {
        let dispatcher = PriorityDispatcher::new();
        let victim = dispatcher.dispatch(|| "cancelled", 1);
        let survivor = dispatcher.dispatch(|| "ran", 2);

        assert!(*victim.cancel().wait_get());
        assert_eq!(dispatcher.len(), 1);
        assert!(dispatcher.invoke());
        assert!(survivor.is_signaled());
        assert!(!dispatcher.invoke());
    }

    #[test]
    fn try_invoke_honors_the_bound() {
        let dispatcher = PriorityDispatcher::new();
        let task = dispatcher.dispatch(|| (), 7);

        assert!(!dispatcher.try_invoke(6));
        assert!(task.is_pending());
        assert!(dispatcher.try_invoke(7));
        assert!(task.is_signaled());
    }

    #[test]
    fn next_priority_reports_head() {
        let dispatcher = PriorityDispatcher::new();
        assert_eq!(dispatcher.next_priority(), i32::MAX);
        dispatcher.dispatch(|| (), 9);
        dispatcher.dispatch(|| (), 4);
        assert_eq!(dispatcher.next_priority(), 4);
        assert!(dispatcher.peek().is_some());
    }

    #[test]
    fn change_priority_reorders_queued_task() {
        let dispatcher = PriorityDispatcher::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        let slow = {
            let order = Arc::clone(&order);
            dispatcher.dispatch(move || order.lock().unwrap().push("promoted"), 100)
        };
        {
            let order = Arc::clone(&order);
            dispatcher.dispatch(move || order.lock().unwrap().push("other"), 10);
        }

        slow.change_priority(1);
        while dispatcher.invoke() {}
        assert_eq!(*order.lock().unwrap(), ["promoted", "other"]);
    }

    #[test]
    fn remove_and_invoke_targets_one_task() {
        let dispatcher = PriorityDispatcher::new();
        let first = dispatcher.dispatch(|| 1, 1);
        let second = dispatcher.dispatch(|| 2, 2);

        assert!(dispatcher.remove_and_invoke(&second));
        assert!(second.is_signaled());
        assert!(first.is_pending());
        assert!(!dispatcher.remove_and_invoke(&second));
    }

    #[test]
    fn drain_cancels_the_backlog() {
        let dispatcher = PriorityDispatcher::new();
        let task = dispatcher.dispatch(|| (), 0);
        assert!(dispatcher.drain());
        assert!(task.is_cancelled());
        assert!(!dispatcher.drain());
        assert!(dispatcher.is_empty());
    }
}
