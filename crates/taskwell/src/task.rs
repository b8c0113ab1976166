// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Task lifecycle, waiting, and continuation plumbing.

use std::fmt::Debug;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU8, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use parking_lot::{Condvar, Mutex};
use priq::{PriorityQueue, RemoveToken};

use crate::Timeout;
use crate::linked::LinkedBody;

/// Where a task is in its lifecycle.
///
/// A task leaves [`Pending`](TaskState::Pending) at most once, for either
/// terminal state, and never transitions again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TaskState {
    /// Not yet settled; may still be cancelled or reprioritized.
    Pending = 0,
    /// Completed; the result (if any) is valid and continuations have fired
    /// or are firing.
    Signaled = 2,
    /// Terminally cancelled; there is no result.
    Cancelled = 3,
}

/// What a bounded wait observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// The deadline expired first. Says nothing about the task's state.
    TimedOut,
    /// The waited-on object completed.
    Signaled,
    /// The waited-on object was cancelled.
    Cancelled,
}

/// Whether spinning before blocking can possibly help.
pub(crate) fn is_multiprocessor() -> bool {
    static MULTI: OnceLock<bool> = OnceLock::new();
    *MULTI.get_or_init(|| std::thread::available_parallelism().is_ok_and(|n| n.get() > 1))
}

/// Lifecycle word plus waiter parking. The lifecycle is claimed by CAS before
/// any completion work runs; waiters are notified only after that work is
/// done, so a thread woken from `block_until_settled` can rely on the result
/// being present.
pub(crate) struct Core {
    lifecycle: AtomicU8,
    lock: Mutex<()>,
    cond: Condvar,
}

impl Core {
    pub(crate) fn new(state: TaskState) -> Self {
        Self {
            lifecycle: AtomicU8::new(state as u8),
            lock: Mutex::new(()),
            cond: Condvar::new(),
        }
    }

    pub(crate) fn state(&self) -> TaskState {
        match self.lifecycle.load(Ordering::Acquire) {
            0 => TaskState::Pending,
            2 => TaskState::Signaled,
            _ => TaskState::Cancelled,
        }
    }

    /// Wins or loses the single Pending -> terminal transition.
    pub(crate) fn try_claim(&self, to: TaskState) -> bool {
        self.lifecycle
            .compare_exchange(
                TaskState::Pending as u8,
                to as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Wakes every blocked waiter. Call after the terminal state's side
    /// effects (result storage) are complete.
    pub(crate) fn notify_waiters(&self) {
        drop(self.lock.lock());
        self.cond.notify_all();
    }

    /// Blocks until settled or the deadline passes. `spin_count` bounds a
    /// pre-blocking spin that is skipped on uniprocessors.
    pub(crate) fn block_until_settled(&self, timeout: &Timeout, spin_count: u32) -> WaitOutcome {
        let mut spins = if is_multiprocessor() { spin_count } else { 0 };
        loop {
            match self.state() {
                TaskState::Signaled => return WaitOutcome::Signaled,
                TaskState::Cancelled => return WaitOutcome::Cancelled,
                TaskState::Pending => {}
            }
            if spins == 0 {
                break;
            }
            spins -= 1;
            std::hint::spin_loop();
        }

        if !timeout.is_infinite() && timeout.expired() {
            return match self.state() {
                TaskState::Signaled => WaitOutcome::Signaled,
                TaskState::Cancelled => WaitOutcome::Cancelled,
                TaskState::Pending => WaitOutcome::TimedOut,
            };
        }

        let mut guard = self.lock.lock();
        loop {
            match self.state() {
                TaskState::Signaled => return WaitOutcome::Signaled,
                TaskState::Cancelled => return WaitOutcome::Cancelled,
                TaskState::Pending => {}
            }
            if timeout.is_infinite() {
                self.cond.wait(&mut guard);
            } else {
                let remaining = timeout.pending();
                if remaining.is_zero() {
                    return WaitOutcome::TimedOut;
                }
                let _ = self.cond.wait_for(&mut guard, remaining);
            }
        }
    }
}

/// Back-link from a task to the slot it occupies in the dispatcher that
/// accepted it, giving O(log n) targeted cancellation and priority change.
/// The owner edge is weak; the queue owns the task, not the other way round.
pub(crate) struct DispatchedHandle {
    owner: Weak<dyn QueueOwner>,
    token: RemoveToken<i32, Arc<dyn RawTask>>,
}

impl DispatchedHandle {
    pub(crate) fn new(owner: Weak<dyn QueueOwner>, token: RemoveToken<i32, Arc<dyn RawTask>>) -> Self {
        Self { owner, token }
    }

    pub(crate) fn token(&self) -> &RemoveToken<i32, Arc<dyn RawTask>> {
        &self.token
    }

    fn cancel_in_owner(&self) -> bool {
        self.owner
            .upgrade()
            .is_some_and(|owner| owner.cancel_queued(&self.token))
    }

    fn change_priority_in_owner(&self, new_priority: i32) {
        if let Some(owner) = self.owner.upgrade() {
            owner.change_queued_priority(&self.token, new_priority);
        }
    }
}

impl Debug for DispatchedHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatchedHandle").finish_non_exhaustive()
    }
}

/// Implemented by everything that queues raw tasks: dispatchers and the
/// continuation queue embedded in each task.
pub(crate) trait QueueOwner: Send + Sync {
    /// Removes a queued task. True iff this call took it out of the queue.
    fn cancel_queued(&self, token: &RemoveToken<i32, Arc<dyn RawTask>>) -> bool;

    /// Moves a queued task to a new priority.
    fn change_queued_priority(&self, token: &RemoveToken<i32, Arc<dyn RawTask>>, new_priority: i32);
}

/// Object-safe view of a task, independent of its result type.
///
/// Useful where tasks of different result types flow through one queue, e.g.
/// [`PriorityDispatcher::peek`](crate::PriorityDispatcher::peek).
pub trait DynTask: Send + Sync {
    /// See [`Task::state`].
    fn state(&self) -> TaskState;

    /// See [`Task::wait_spin`].
    fn wait_spin(&self, timeout: &Timeout, spin_count: u32) -> WaitOutcome;

    /// See [`Task::cancel`].
    fn cancel(&self) -> Arc<Task<bool>>;

    /// See [`Task::change_priority`].
    fn change_priority(&self, new_priority: i32);

    /// See [`Task::priority`].
    fn priority(&self) -> i32;
}

/// Crate-internal task surface: firing, cancellation sweeps, and the
/// dispatched back-link. Kept off [`DynTask`] so users cannot signal tasks
/// they did not create.
pub(crate) trait RawTask: DynTask {
    /// Drives the task to `Signaled`, running its payload if it has one.
    /// False if the task had already settled.
    fn fire(&self) -> bool;

    /// Drives the task to `Cancelled`. False if it had already settled.
    fn cancel_raw(&self) -> bool;

    /// Records the slot this task occupies in its accepting dispatcher.
    fn set_dispatched(&self, handle: DispatchedHandle);

    /// For a chained stage that has produced its inner task: that task.
    fn chained_task(&self) -> Option<Arc<dyn RawTask>>;

    /// Registers a plain continuation to run when this task settles as
    /// signaled. Used by schedulers that must resume after a task's chain
    /// drains; cancellation of the task cancels the continuation.
    fn on_signal(&self, f: Box<dyn FnOnce() + Send>, priority: i32);
}

type PrimaryFn<T> = Box<dyn FnOnce() -> Option<T> + Send>;
type CancelFn = Box<dyn FnOnce() + Send>;

pub(crate) struct FunctionBody<T> {
    primary: Mutex<Option<PrimaryFn<T>>>,
    on_cancel: Mutex<Option<CancelFn>>,
    cell: OnceLock<T>,
    priority: AtomicI32,
    /// Set by a chained stage once the user callable has produced the inner
    /// task; read by serializing schedulers through `chained_task`.
    chained: Option<Arc<OnceLock<Arc<dyn RawTask>>>>,
}

pub(crate) enum Body<T> {
    /// Externally completed storage; used by events and pre-settled tasks.
    Value(OnceLock<T>),
    /// Runs a callable when fired.
    Function(FunctionBody<T>),
    /// Spans a chain of two dispatches; see the `linked` module.
    Linked(LinkedBody<T>),
}

/// A deferred computation with a lifecycle of pending → {signaled |
/// cancelled}.
///
/// Tasks are produced by dispatchers (see
/// [`DispatchExt`](crate::DispatchExt)) and by continuation registration
/// ([`then`](Self::then)); they are always handled through `Arc`. A task can
/// be awaited with a deadline, cancelled cooperatively, reprioritized while
/// queued, and chained: continuations registered before the task settles fire
/// in continuation-priority order when it does, and continuations registered
/// after it has signaled fire synchronously on the registering thread.
///
/// # Examples
///
/// ```
/// use taskwell::{DispatchExt, ImmediateDispatcher};
///
/// let dispatcher = ImmediateDispatcher::new();
/// let task = dispatcher.dispatch(|| 6 * 7, 0);
/// let plus_one = task.then(|v| v + 1, 0);
///
/// assert_eq!(*task.get(), 42);
/// assert_eq!(*plus_one.get(), 43);
/// ```
pub struct Task<T> {
    core: Core,
    continuations: PriorityQueue<i32, Arc<dyn RawTask>>,
    drain_done: AtomicBool,
    dispatched: OnceLock<DispatchedHandle>,
    body: Body<T>,
    weak_self: Weak<Self>,
}

impl<T: Send + Sync + 'static> Debug for Task<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl<T: Send + Sync + 'static> Task<T> {
    fn with_body(body: Body<T>, state: TaskState) -> Arc<Self> {
        Arc::new_cyclic(|weak_self| Self {
            core: Core::new(state),
            continuations: PriorityQueue::new(),
            // A task born settled has nothing to drain; registrations fire
            // inline from the start.
            drain_done: AtomicBool::new(state != TaskState::Pending),
            dispatched: OnceLock::new(),
            body,
            weak_self: Weak::clone(weak_self),
        })
    }

    /// The owning `Arc`; valid whenever a method is executing.
    pub(crate) fn strong_self(&self) -> Arc<Self> {
        self.weak_self
            .upgrade()
            .expect("task method running on a task with no strong references")
    }

    pub(crate) fn body(&self) -> &Body<T> {
        &self.body
    }

    /// The queue token recorded when a dispatcher accepted this task.
    pub(crate) fn dispatched_token(&self) -> Option<RemoveToken<i32, Arc<dyn RawTask>>> {
        self.dispatched.get().map(|handle| handle.token().clone())
    }

    /// Bare signaled transition with waiter wake-up and continuation drain;
    /// the caller is responsible for any result storage.
    pub(crate) fn settle_signal_only(&self) -> bool {
        if !self.core.try_claim(TaskState::Signaled) {
            return false;
        }
        self.core.notify_waiters();
        self.drain_signal();
        true
    }

    /// A task already settled as signaled with `value`.
    #[must_use]
    pub fn signaled(value: T) -> Arc<Self> {
        let cell = OnceLock::new();
        let set = cell.set(value);
        debug_assert!(set.is_ok());
        Self::with_body(Body::Value(cell), TaskState::Signaled)
    }

    /// A task already settled as cancelled.
    #[must_use]
    pub fn cancelled() -> Arc<Self> {
        Self::with_body(Body::Value(OnceLock::new()), TaskState::Cancelled)
    }

    /// A pending task completed later through [`complete`](Self::complete).
    pub(crate) fn pending_value() -> Arc<Self> {
        Self::with_body(Body::Value(OnceLock::new()), TaskState::Pending)
    }

    pub(crate) fn function(
        primary: PrimaryFn<T>,
        on_cancel: Option<CancelFn>,
        priority: i32,
        chained: Option<Arc<OnceLock<Arc<dyn RawTask>>>>,
    ) -> Arc<Self> {
        Self::with_body(
            Body::Function(FunctionBody {
                primary: Mutex::new(Some(primary)),
                on_cancel: Mutex::new(on_cancel),
                cell: OnceLock::new(),
                priority: AtomicI32::new(priority),
                chained,
            }),
            TaskState::Pending,
        )
    }

    pub(crate) fn linked(priority: i32) -> Arc<Self> {
        Self::with_body(Body::Linked(LinkedBody::new(priority)), TaskState::Pending)
    }

    /// Completes a value task. True iff this call effected the transition.
    pub(crate) fn complete(&self, value: T) -> bool {
        if !self.core.try_claim(TaskState::Signaled) {
            return false;
        }
        match &self.body {
            Body::Value(cell) | Body::Function(FunctionBody { cell, .. }) => {
                let set = cell.set(value);
                debug_assert!(set.is_ok());
            }
            Body::Linked(_) => unreachable!("linked tasks are completed by their chain"),
        }
        self.core.notify_waiters();
        self.drain_signal();
        true
    }

    /// Where the task is in its lifecycle.
    #[must_use]
    pub fn state(&self) -> TaskState {
        self.core.state()
    }

    /// Whether the task has completed with a valid result.
    #[must_use]
    pub fn is_signaled(&self) -> bool {
        self.state() == TaskState::Signaled
    }

    /// Whether the task has not yet settled.
    #[must_use]
    pub fn is_pending(&self) -> bool {
        self.state() == TaskState::Pending
    }

    /// Whether the task was cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.state() == TaskState::Cancelled
    }

    /// Blocks until the task settles or the deadline passes.
    pub fn wait(&self, timeout: &Timeout) -> WaitOutcome {
        self.core.block_until_settled(timeout, 0)
    }

    /// [`wait`](Self::wait) with a bounded pre-blocking spin; each iteration
    /// issues a CPU pause hint, and the spin is skipped on uniprocessors.
    pub fn wait_spin(&self, timeout: &Timeout, spin_count: u32) -> WaitOutcome {
        self.core.block_until_settled(timeout, spin_count)
    }

    /// The task's result.
    ///
    /// # Panics
    ///
    /// Panics if the task has not signaled.
    #[must_use]
    pub fn get(&self) -> &T {
        assert!(
            self.is_signaled(),
            "Task::get called before the task signaled"
        );
        match &self.body {
            Body::Value(cell) | Body::Function(FunctionBody { cell, .. }) => {
                // The lifecycle is claimed before the result is stored;
                // bridge that window.
                loop {
                    if let Some(value) = cell.get() {
                        return value;
                    }
                    std::hint::spin_loop();
                }
            }
            Body::Linked(body) => body.result(),
        }
    }

    /// Requests cancellation.
    ///
    /// The returned task completes with `true` iff *this* call effected the
    /// pending → cancelled transition; competing callers, and calls on a task
    /// that already settled, observe `false`. For most tasks the answer is
    /// immediate; for a chained task it is known only once the outcome of the
    /// chain is, so the returned handle may itself be pending.
    pub fn cancel(self: &Arc<Self>) -> Arc<Task<bool>> {
        match &self.body {
            Body::Value(_) => Task::signaled(self.settle_cancel()),
            Body::Function(_) => Task::signaled(self.cancel_function()),
            Body::Linked(_) => self.cancel_linked(),
        }
    }

    /// Moves the task to a new priority in whatever queue currently holds it.
    ///
    /// For a chained task the change propagates to whichever stage of the
    /// chain is outstanding, and is re-applied across hand-offs so a change
    /// racing the chain's progress is not lost.
    pub fn change_priority(self: &Arc<Self>, new_priority: i32) {
        match &self.body {
            Body::Value(_) => {}
            Body::Function(body) => {
                let Some(handle) = self.dispatched.get() else {
                    return;
                };
                body.priority.store(new_priority, Ordering::Release);
                let mut applying = new_priority;
                loop {
                    handle.change_priority_in_owner(applying);
                    let newer = body.priority.load(Ordering::Acquire);
                    if newer == applying {
                        break;
                    }
                    applying = newer;
                }
            }
            Body::Linked(_) => self.change_priority_linked(new_priority),
        }
    }

    /// The task's current priority. Lower is more urgent.
    #[must_use]
    pub fn priority(&self) -> i32 {
        match &self.body {
            Body::Value(_) => 0,
            Body::Function(body) => body.priority.load(Ordering::Acquire),
            Body::Linked(body) => body.priority.load(Ordering::Acquire),
        }
    }

    /// Registers a continuation on this task.
    ///
    /// When the task signals, `f` runs with a reference to the result;
    /// continuations registered before the signal fire in continuation-queue
    /// priority order, and ones registered after it fire synchronously on the
    /// registering thread. If the task is (or becomes) cancelled the
    /// continuation is cancelled instead and `f` never runs.
    pub fn then<R, F>(self: &Arc<Self>, f: F, priority: i32) -> Arc<Task<R>>
    where
        R: Send + Sync + 'static,
        F: FnOnce(&T) -> R + Send + 'static,
    {
        self.then_with_cancel(f, || {}, priority)
    }

    /// [`then`](Self::then) with a callback invoked if the continuation is
    /// cancelled instead of run.
    pub fn then_with_cancel<R, F, C>(self: &Arc<Self>, f: F, on_cancel: C, priority: i32) -> Arc<Task<R>>
    where
        R: Send + Sync + 'static,
        F: FnOnce(&T) -> R + Send + 'static,
        C: FnOnce() + Send + 'static,
    {
        let parent = Arc::downgrade(self);
        let continuation = Task::function(
            Box::new(move || parent.upgrade().map(|parent| f(parent.get()))),
            Some(Box::new(on_cancel)),
            priority,
            None,
        );
        self.register_continuation(continuation.clone(), priority);
        continuation
    }

    /// Continuation registration protocol: insert, then re-check the drain
    /// flag; if a drain slipped in, race to take the entry back — losing the
    /// race means the drain thread owns it, winning means this thread must
    /// honor the terminal state inline.
    pub(crate) fn register_continuation(self: &Arc<Self>, continuation: Arc<dyn RawTask>, priority: i32) {
        if !self.drain_done.load(Ordering::Acquire) {
            let token = self.continuations.insert(priority, Arc::clone(&continuation));
            let owner = Arc::downgrade(self);
            let owner: Weak<dyn QueueOwner> = owner;
            continuation.set_dispatched(DispatchedHandle::new(owner, token.clone()));
            if !self.drain_done.load(Ordering::Acquire) || !self.continuations.remove(&token) {
                return;
            }
        }
        if self.is_signaled() {
            continuation.fire();
        } else {
            continuation.cancel_raw();
        }
    }

    /// Terminal sweep: pop-and-fire until empty, set the drain flag, then
    /// loop once more to catch registrations that raced the flag.
    fn sweep_continuations(&self, fire: impl Fn(&Arc<dyn RawTask>)) {
        let mut flagged = false;
        loop {
            match self.continuations.pop() {
                Some(entry) => fire(entry.value()),
                None => {
                    if flagged {
                        break;
                    }
                    flagged = true;
                    self.drain_done.store(true, Ordering::Release);
                }
            }
        }
    }

    pub(crate) fn drain_signal(&self) {
        self.sweep_continuations(|c| {
            c.fire();
        });
    }

    pub(crate) fn drain_cancel(&self) {
        self.sweep_continuations(|c| {
            c.cancel_raw();
        });
    }

    /// Plain cancel transition shared by every body kind.
    pub(crate) fn settle_cancel(&self) -> bool {
        if !self.core.try_claim(TaskState::Cancelled) {
            return false;
        }
        self.core.notify_waiters();
        self.drain_cancel();
        true
    }

    fn cancel_function(&self) -> bool {
        if !self.settle_cancel() {
            return false;
        }
        if let Some(handle) = self.dispatched.get() {
            handle.cancel_in_owner();
        }
        if let Body::Function(body) = &self.body {
            let on_cancel = body.on_cancel.lock().take();
            if let Some(f) = on_cancel {
                f();
            }
            // The callable can no longer run; release what it captured.
            body.primary.lock().take();
        }
        true
    }

    fn fire_function(&self) -> bool {
        if !self.core.try_claim(TaskState::Signaled) {
            return false;
        }
        if let Body::Function(body) = &self.body {
            let primary = body.primary.lock().take();
            if let Some(f) = primary {
                match f() {
                    Some(value) => {
                        let set = body.cell.set(value);
                        debug_assert!(set.is_ok());
                    }
                    None => panic!("continuation fired after its parent task was dropped"),
                }
            }
            body.on_cancel.lock().take();
        }
        self.core.notify_waiters();
        self.drain_signal();
        true
    }
}

impl<T: Send + Sync + 'static> DynTask for Task<T> {
    fn state(&self) -> TaskState {
        Self::state(self)
    }

    fn wait_spin(&self, timeout: &Timeout, spin_count: u32) -> WaitOutcome {
        Self::wait_spin(self, timeout, spin_count)
    }

    fn cancel(&self) -> Arc<Task<bool>> {
        Self::cancel(&self.strong_self())
    }

    fn change_priority(&self, new_priority: i32) {
        Self::change_priority(&self.strong_self(), new_priority);
    }

    fn priority(&self) -> i32 {
        Self::priority(self)
    }
}

impl<T: Send + Sync + 'static> RawTask for Task<T> {
    fn fire(&self) -> bool {
        match &self.body {
            Body::Function(_) => self.fire_function(),
            Body::Value(_) => {
                // Value tasks are completed through `complete`; a bare fire
                // can only settle the lifecycle (unit-like payloads).
                if !self.core.try_claim(TaskState::Signaled) {
                    return false;
                }
                self.core.notify_waiters();
                self.drain_signal();
                true
            }
            Body::Linked(_) => self.strong_self().linked_signal(),
        }
    }

    fn cancel_raw(&self) -> bool {
        match &self.body {
            Body::Value(_) => self.settle_cancel(),
            Body::Function(_) => self.cancel_function(),
            Body::Linked(_) => *self.strong_self().cancel_linked().wait_get(),
        }
    }

    fn set_dispatched(&self, handle: DispatchedHandle) {
        let stored = self.dispatched.set(handle);
        debug_assert!(stored.is_ok(), "task dispatched twice");
    }

    fn chained_task(&self) -> Option<Arc<dyn RawTask>> {
        match &self.body {
            Body::Function(body) => body.chained.as_ref().and_then(|cell| cell.get().cloned()),
            _ => None,
        }
    }

    fn on_signal(&self, f: Box<dyn FnOnce() + Send>, priority: i32) {
        let this = self.strong_self();
        let continuation = Task::<()>::function(
            Box::new(move || {
                f();
                Some(())
            }),
            None,
            priority,
            None,
        );
        this.register_continuation(continuation, priority);
    }
}

impl<T: Send + Sync + 'static> Task<T> {
    /// Continuation queue owner hooks: continuations cancel and reprioritize
    /// through their parent task.
    fn remove_continuation(&self, token: &RemoveToken<i32, Arc<dyn RawTask>>) -> bool {
        self.continuations.remove(token)
    }
}

impl<T: Send + Sync + 'static> QueueOwner for Task<T> {
    fn cancel_queued(&self, token: &RemoveToken<i32, Arc<dyn RawTask>>) -> bool {
        self.remove_continuation(token)
    }

    fn change_queued_priority(&self, token: &RemoveToken<i32, Arc<dyn RawTask>>, new_priority: i32) {
        self.continuations.change_priority(token, new_priority);
    }
}

impl<T> Drop for Task<T> {
    fn drop(&mut self) {
        // Surviving continuations lose their parent; cancel them.
        while let Some(entry) = self.continuations.pop() {
            entry.value().cancel_raw();
        }
    }
}

impl Task<bool> {
    /// Blocks indefinitely for the result. Cancellation of a cancel-outcome
    /// task does not happen, so the result is always produced.
    pub(crate) fn wait_get(&self) -> &bool {
        let _ = self.wait(&Timeout::infinite());
        self.get()
    }
}
