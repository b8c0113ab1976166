// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::fmt::Debug;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use priq::{PriorityQueue, RemoveToken};

use crate::dispatcher::{Dispatch, DispatchExt, WorkItem};
use crate::task::{DispatchedHandle, QueueOwner, RawTask, Task};

const BUSY: u32 = 0x01;
const DIRTY: u32 = 0x02;
const SCHEDULED: u32 = 0x04;
const EXPIRED: u32 = 0x08;
const HANDOFF: u32 = 0x10;

/// The dispatcher's whole scheduling state, packed into one atomic word so
/// every transition is a single CAS.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct State {
    scheduled_priority: i32,
    flags: u32,
}

impl State {
    #[allow(
        clippy::cast_sign_loss,
        reason = "bit-level round-trip through the packed word"
    )]
    fn pack(self) -> u64 {
        let priority = u64::from(self.scheduled_priority as u32);
        (u64::from(self.flags) << 32) | priority
    }

    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_possible_wrap,
        reason = "bit-level round-trip through the packed word"
    )]
    fn unpack(word: u64) -> Self {
        Self {
            scheduled_priority: word as u32 as i32,
            flags: (word >> 32) as u32,
        }
    }

    fn has(self, flag: u32) -> bool {
        self.flags & flag != 0
    }
}

/// Funnels tasks through an inner dispatcher strictly one at a time, always
/// choosing the highest-priority pending task — even when a better task
/// arrives after a worse one has already been scheduled on the inner
/// dispatcher.
///
/// At most one *expire hook* is outstanding on the inner dispatcher at any
/// moment, dispatched at the current head's priority. When a better-priority
/// task arrives in the gap between scheduling and expiry, the hook is
/// cancelled and rescheduled; a hook that is already firing instead wins a
/// hand-off race and re-evaluates the queue itself, so the task that actually
/// runs is always one of the best pending at the moment of selection.
///
/// If the task that runs is a chained one, the next task is not considered
/// until the chain's inner task settles: tasks never overlap on the inner
/// dispatcher. An inner dispatcher that drops work without settling it
/// stalls this dispatcher silently; the dispatcher contract requires run or
/// cancel, never drop.
pub struct SerialDispatcher {
    state: AtomicU64,
    queue: PriorityQueue<i32, Arc<dyn RawTask>>,
    /// The outstanding expire hook, if any. `expire_claimed` arbitrates
    /// between the hook firing and the update loop cancelling it; the slot
    /// itself only stores the handle for that cancellation.
    expire_task: Mutex<Option<Arc<Task<()>>>>,
    expire_claimed: AtomicBool,
    inner: Arc<dyn Dispatch>,
    weak_self: Weak<Self>,
}

impl Debug for SerialDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = State::unpack(self.state.load(Ordering::Relaxed));
        f.debug_struct("SerialDispatcher")
            .field("queued", &self.queue.len())
            .field("flags", &state.flags)
            .finish_non_exhaustive()
    }
}

impl SerialDispatcher {
    /// Creates a serial dispatcher over `inner`.
    #[must_use]
    pub fn new(inner: Arc<dyn Dispatch>) -> Arc<Self> {
        Arc::new_cyclic(|weak_self| Self {
            state: AtomicU64::new(
                State {
                    scheduled_priority: 0,
                    flags: 0,
                }
                .pack(),
            ),
            queue: PriorityQueue::new(),
            expire_task: Mutex::new(None),
            expire_claimed: AtomicBool::new(false),
            inner,
            weak_self: Weak::clone(weak_self),
        })
    }

    /// Number of tasks waiting to be run.
    #[must_use]
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// Whether no tasks are waiting.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    fn load(&self) -> State {
        State::unpack(self.state.load(Ordering::Acquire))
    }

    /// One CAS attempt; on failure returns the freshly observed state.
    fn try_swap(&self, old: State, new: State) -> Result<(), State> {
        self.state
            .compare_exchange(old.pack(), new.pack(), Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(State::unpack)
    }

    fn dispatch_update_pass(&self) {
        let weak = Weak::clone(&self.weak_self);
        // Internal passes ride at the best possible priority so bookkeeping
        // never waits behind user work on the inner dispatcher.
        self.inner.dispatch(
            move || {
                if let Some(this) = weak.upgrade() {
                    this.update();
                }
            },
            i32::MIN,
        );
    }

    /// Entry point used by dispatch, cancellation, and priority change:
    /// acquire the update duty or mark it dirty for whoever holds it.
    fn kick(&self) {
        let mut old = self.load();
        loop {
            if old.has(DIRTY) {
                return;
            }
            let mut new = old;
            let own = !old.has(BUSY);
            if own {
                new.flags |= BUSY;
            } else {
                new.flags |= DIRTY;
            }
            match self.try_swap(old, new) {
                Ok(()) => {
                    if own {
                        self.dispatch_update_pass();
                    }
                    return;
                }
                Err(current) => old = current,
            }
        }
    }

    /// The expire hook fired on the inner dispatcher: the scheduled slot has
    /// reached the front. Take over (or inherit via hand-off) the update
    /// duty.
    fn expire(&self) {
        if self
            .expire_claimed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            // An unschedule beat us to the claim and owns the hook's fate.
            return;
        }
        *self.expire_task.lock() = None;
        let mut old = self.load();
        loop {
            debug_assert!(!old.has(EXPIRED));
            let mut new = old;
            new.flags &= !(SCHEDULED | HANDOFF | DIRTY);
            new.flags |= BUSY | EXPIRED;
            let own = !old.has(BUSY) || old.has(HANDOFF);
            if !own {
                new.flags |= DIRTY;
            }
            match self.try_swap(old, new) {
                Ok(()) => {
                    if own {
                        self.update();
                    }
                    return;
                }
                Err(current) => old = current,
            }
        }
    }

    /// The update loop. Runs only while this thread holds `BUSY`; `DIRTY`
    /// guarantees no pass is lost when entry points race, and `HANDOFF` is
    /// the single-consumer edge that yields the duty to a hook that is
    /// mid-fire and therefore cannot be cancelled.
    fn update(&self) {
        let mut old = self.load();
        'pass: loop {
            debug_assert!(!old.has(HANDOFF));
            if old.has(DIRTY) {
                let mut new = old;
                new.flags &= !DIRTY;
                match self.try_swap(old, new) {
                    Ok(()) => old = new,
                    Err(current) => {
                        old = current;
                        continue 'pass;
                    }
                }
            }

            let head = self.queue.peek();
            let mut head_priority = 0;
            let mut unschedule = false;
            match &head {
                None => {
                    if !old.has(SCHEDULED) {
                        // Nothing pending, nothing scheduled: release duty.
                        let mut new = old;
                        new.flags &= !(BUSY | EXPIRED);
                        match self.try_swap(old, new) {
                            Ok(()) => return,
                            Err(current) => {
                                old = current;
                                continue 'pass;
                            }
                        }
                    }
                    unschedule = true;
                }
                Some(entry) => {
                    head_priority = entry.priority();
                    if old.has(SCHEDULED) {
                        if head_priority == old.scheduled_priority {
                            // The right hook is already out there.
                            let mut new = old;
                            new.flags &= !BUSY;
                            match self.try_swap(old, new) {
                                Ok(()) => return,
                                Err(current) => {
                                    old = current;
                                    continue 'pass;
                                }
                            }
                        }
                        unschedule = true;
                    }
                }
            }

            if unschedule {
                if self
                    .expire_claimed
                    .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    // Won the claim: the hook can still be cancelled and
                    // this thread stays the only scheduler.
                    if let Some(task) = self.expire_task.lock().take() {
                        let _ = task.cancel();
                    }
                    loop {
                        let mut new = old;
                        new.flags &= !(SCHEDULED | DIRTY);
                        match self.try_swap(old, new) {
                            Ok(()) => {
                                old = new;
                                break;
                            }
                            Err(current) => old = current,
                        }
                    }
                    continue 'pass;
                }
                // The hook is firing right now: offer it the update duty.
                loop {
                    let mut new = old;
                    new.flags |= HANDOFF;
                    new.flags &= !DIRTY;
                    match self.try_swap(old, new) {
                        Ok(()) => return,
                        Err(current) => {
                            old = current;
                            if old.has(EXPIRED) {
                                // Too late for a hand-off; it already expired
                                // and this thread still owns the duty.
                                break;
                            }
                        }
                    }
                }
                continue 'pass;
            }

            if old.has(EXPIRED) {
                if head_priority <= old.scheduled_priority {
                    let entry = head.expect("expired with an empty queue");
                    if !self.queue.remove(&entry) {
                        old = self.load();
                        continue 'pass;
                    }
                    let raw = Arc::clone(entry.value());
                    if !raw.fire() {
                        // Cancelled between remove and fire; pick again.
                        old = self.load();
                        continue 'pass;
                    }
                    match raw.chained_task() {
                        None => self.resume(),
                        Some(chain) => {
                            let weak = Weak::clone(&self.weak_self);
                            chain.on_signal(
                                Box::new(move || {
                                    if let Some(this) = weak.upgrade() {
                                        this.resume();
                                    }
                                }),
                                0,
                            );
                        }
                    }
                    return;
                }
                // Expired, but the head no longer justifies it (the task the
                // hook was scheduled for is gone). Drop the grant and
                // reschedule at the real head priority.
                loop {
                    let mut new = old;
                    new.flags &= !(EXPIRED | DIRTY);
                    match self.try_swap(old, new) {
                        Ok(()) => {
                            old = new;
                            break;
                        }
                        Err(current) => old = current,
                    }
                }
                continue 'pass;
            }

            // Schedule an expire hook for the head and release the duty.
            let new = State {
                scheduled_priority: head_priority,
                flags: (old.flags & !BUSY) | SCHEDULED,
            };
            match self.try_swap(old, new) {
                Ok(()) => {}
                Err(current) => {
                    old = current;
                    continue 'pass;
                }
            }
            self.expire_claimed.store(false, Ordering::Release);
            let weak = Weak::clone(&self.weak_self);
            let hook = self.inner.dispatch(
                move || {
                    if let Some(this) = weak.upgrade() {
                        this.expire();
                    }
                },
                head_priority,
            );
            *self.expire_task.lock() = Some(hook);
            return;
        }
    }

    /// A head task finished (directly or through its chain): queue another
    /// update pass.
    fn resume(&self) {
        let mut old = self.load();
        loop {
            debug_assert!(old.has(EXPIRED) && old.has(BUSY));
            let mut new = old;
            new.flags &= !(DIRTY | EXPIRED);
            match self.try_swap(old, new) {
                Ok(()) => {
                    self.dispatch_update_pass();
                    return;
                }
                Err(current) => old = current,
            }
        }
    }
}

impl Dispatch for SerialDispatcher {
    fn dispatch_item(&self, item: WorkItem, priority: i32) {
        let raw = item.into_raw();
        let token = self.queue.insert(priority, Arc::clone(&raw));
        let owner: Weak<dyn QueueOwner> = self.weak_self.clone();
        raw.set_dispatched(DispatchedHandle::new(owner, token));
        self.kick();
    }
}

impl QueueOwner for SerialDispatcher {
    fn cancel_queued(&self, token: &RemoveToken<i32, Arc<dyn RawTask>>) -> bool {
        let removed = self.queue.remove(token);
        if removed {
            self.kick();
        }
        removed
    }

    fn change_queued_priority(&self, token: &RemoveToken<i32, Arc<dyn RawTask>>, new_priority: i32) {
        self.queue.change_priority(token, new_priority);
        self.kick();
    }
}

impl Drop for SerialDispatcher {
    fn drop(&mut self) {
        while let Some(entry) = self.queue.pop() {
            entry.value().cancel_raw();
        }
    }
}
