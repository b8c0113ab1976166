// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::fmt::Debug;
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use crate::dispatcher::{Dispatch, WorkItem};
use crate::priority_dispatcher::PriorityDispatcher;
use crate::task::{RawTask, Task, WaitOutcome, is_multiprocessor};
use crate::timeout::Timeout;

/// The event's latch position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LatchState {
    /// Nothing stored; waiters block.
    Unset,
    /// Signaled and staying signaled until reset.
    Set,
    /// One stored wake-up: the next waiter consumes it without blocking.
    Triggered,
}

struct EventInner {
    state: LatchState,
    /// Waiters currently blocked.
    stalled: usize,
    /// Single-wake credits issued to currently-blocked waiters by
    /// `pulse_one` and not yet consumed.
    single_wakes: usize,
    /// Bumped by any wake-everyone operation; a blocked waiter returns when
    /// the epoch moves past the one it enrolled under.
    epoch: u64,
    /// Continuations, in their own priority order. Created on first
    /// registration; taken whole by wake-all operations.
    delegates: Option<Arc<PriorityDispatcher>>,
}

/// A resettable condition with signal, reset, and pulse semantics.
///
/// Three latch positions: *unset* (waiters block), *set* (everything passes
/// until [`reset`](Self::reset)), and *triggered* — a single stored wake-up
/// left behind by [`pulse_one`](Self::pulse_one) when it found nobody to
/// wake, consumed by the next waiter to arrive.
///
/// | op | unset | set | triggered |
/// |---|---|---|---|
/// | `signal` | set; wake all; fire all continuations | no-op (`false`) | set; wake all; fire all |
/// | `reset` | no-op | unset | unset |
/// | `pulse_all` | wake current waiters; fire all | unset; fire all | unset; fire all |
/// | `pulse_one` | wake/fire one, else store the trigger | unset | no-op (wake already stored) |
/// | `wait` | block | return | consume trigger; return |
///
/// Continuations registered with [`then`](Self::then) queue in an embedded
/// priority dispatcher: `pulse_one` fires exactly one (preferring blocked
/// waiters), wake-all operations drain them all in priority order.
pub struct ResettableEvent {
    inner: Mutex<EventInner>,
    cond: Condvar,
}

impl Debug for ResettableEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("ResettableEvent")
            .field("state", &inner.state)
            .field("stalled", &inner.stalled)
            .finish_non_exhaustive()
    }
}

impl Default for ResettableEvent {
    fn default() -> Self {
        Self::new()
    }
}

impl ResettableEvent {
    /// Creates the event in the unset state.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(EventInner {
                state: LatchState::Unset,
                stalled: 0,
                single_wakes: 0,
                epoch: 0,
                delegates: None,
            }),
            cond: Condvar::new(),
        }
    }

    /// Creates the event already set.
    #[must_use]
    pub fn new_set() -> Self {
        let event = Self::new();
        event.inner.lock().state = LatchState::Set;
        event
    }

    /// Whether the event is currently set. Does not consume a trigger.
    #[must_use]
    pub fn is_signaled(&self) -> bool {
        self.inner.lock().state == LatchState::Set
    }

    /// Sets the event, waking every blocked waiter and firing every queued
    /// continuation. Returns `true` iff the event was unset (a stored
    /// trigger also reports `false`, the wake having effectively happened
    /// already).
    pub fn signal(&self) -> bool {
        let (was_unset, delegates) = {
            let mut inner = self.inner.lock();
            if inner.state == LatchState::Set {
                return false;
            }
            let was_unset = inner.state == LatchState::Unset;
            inner.state = LatchState::Set;
            // Everyone leaves through the set state; unconsumed single-wake
            // credits would otherwise leak into the next generation.
            inner.single_wakes = 0;
            (was_unset, inner.delegates.take())
        };
        self.cond.notify_all();
        drain_delegates(delegates);
        was_unset
    }

    /// Returns the event to unset. Waiters already woken stay woken; queued
    /// continuations stay queued. Returns `true` iff the event was not
    /// already unset.
    pub fn reset(&self) -> bool {
        let mut inner = self.inner.lock();
        let was_latched = inner.state != LatchState::Unset;
        inner.state = LatchState::Unset;
        was_latched
    }

    /// Wakes every waiter present right now and fires every queued
    /// continuation, leaving the event unset — a stored trigger is consumed
    /// rather than kept. Waiters arriving later block as usual.
    ///
    /// Returns `true` iff any waiter was woken or continuation fired.
    pub fn pulse_all(&self) -> bool {
        let (woke, delegates) = {
            let mut inner = self.inner.lock();
            let has_delegates = inner.delegates.as_ref().is_some_and(|d| !d.is_empty());
            if inner.stalled == 0 && inner.state == LatchState::Unset && !has_delegates {
                return false;
            }
            inner.epoch += 1;
            inner.state = LatchState::Unset;
            inner.single_wakes = 0;
            (inner.stalled > 0, inner.delegates.take())
        };
        self.cond.notify_all();
        let fired = drain_delegates(delegates);
        woke || fired
    }

    /// Delivers exactly one wake-up: to a blocked waiter if one exists, else
    /// to the highest-priority queued continuation, else stores the trigger
    /// for the next waiter to arrive. On a set event this auto-resets to
    /// unset instead (nobody can be blocked on a set event).
    ///
    /// Returns `true` iff a waiter or continuation was actually delivered
    /// the wake before returning.
    pub fn pulse_one(&self) -> bool {
        loop {
            enum Delivery {
                Waiter,
                Continuation(Arc<PriorityDispatcher>),
                Stored,
            }

            let delivery = {
                let mut inner = self.inner.lock();
                match inner.state {
                    // A wake is already stored; this pulse is satisfied by it.
                    LatchState::Triggered => return false,
                    LatchState::Set => {
                        inner.state = LatchState::Unset;
                        return false;
                    }
                    LatchState::Unset => {
                        if inner.stalled > inner.single_wakes {
                            inner.single_wakes += 1;
                            Delivery::Waiter
                        } else {
                            match &inner.delegates {
                                Some(d) if !d.is_empty() => Delivery::Continuation(Arc::clone(d)),
                                _ => {
                                    inner.state = LatchState::Triggered;
                                    Delivery::Stored
                                }
                            }
                        }
                    }
                }
            };
            match delivery {
                Delivery::Waiter => {
                    self.cond.notify_one();
                    return true;
                }
                Delivery::Stored => return false,
                Delivery::Continuation(delegates) => {
                    // Fired outside the lock; if everything queued turned out
                    // to be cancelled, take another look.
                    if delegates.invoke() {
                        return true;
                    }
                }
            }
        }
    }

    /// Blocks until woken or the deadline passes.
    ///
    /// A set event returns immediately; a stored trigger is consumed,
    /// returning immediately and leaving the event unset. A waiter that
    /// times out in the same instant a single wake was issued to it consumes
    /// that wake and reports [`WaitOutcome::Signaled`] — wakes are never
    /// dropped.
    pub fn wait(&self, timeout: &Timeout) -> WaitOutcome {
        self.wait_spin(timeout, 0)
    }

    /// [`wait`](Self::wait) with a bounded pre-blocking spin; skipped on
    /// uniprocessors.
    pub fn wait_spin(&self, timeout: &Timeout, spin_count: u32) -> WaitOutcome {
        let mut spins = if is_multiprocessor() { spin_count } else { 0 };
        loop {
            {
                let mut inner = self.inner.lock();
                match inner.state {
                    LatchState::Set => return WaitOutcome::Signaled,
                    LatchState::Triggered => {
                        inner.state = LatchState::Unset;
                        return WaitOutcome::Signaled;
                    }
                    LatchState::Unset => {}
                }
                if spins == 0 {
                    if !timeout.is_infinite() && timeout.expired() {
                        return WaitOutcome::TimedOut;
                    }
                    return self.block(inner, timeout);
                }
            }
            spins -= 1;
            std::hint::spin_loop();
        }
    }

    fn block(
        &self,
        mut inner: parking_lot::MutexGuard<'_, EventInner>,
        timeout: &Timeout,
    ) -> WaitOutcome {
        inner.stalled += 1;
        let enrolled_epoch = inner.epoch;
        loop {
            match inner.state {
                LatchState::Set => {
                    inner.stalled -= 1;
                    return WaitOutcome::Signaled;
                }
                LatchState::Triggered => {
                    inner.state = LatchState::Unset;
                    inner.stalled -= 1;
                    return WaitOutcome::Signaled;
                }
                LatchState::Unset => {}
            }
            if inner.single_wakes > 0 {
                inner.single_wakes -= 1;
                inner.stalled -= 1;
                return WaitOutcome::Signaled;
            }
            if inner.epoch != enrolled_epoch {
                inner.stalled -= 1;
                return WaitOutcome::Signaled;
            }
            if timeout.is_infinite() {
                self.cond.wait(&mut inner);
            } else {
                let remaining = timeout.pending();
                if remaining.is_zero() {
                    // Deadline passed; consume a wake issued to us in the
                    // meantime rather than lose it.
                    if inner.single_wakes > 0 {
                        inner.single_wakes -= 1;
                        inner.stalled -= 1;
                        return WaitOutcome::Signaled;
                    }
                    inner.stalled -= 1;
                    return WaitOutcome::TimedOut;
                }
                let _ = self.cond.wait_for(&mut inner, remaining);
            }
        }
    }

    /// Registers a continuation. On a set event it fires synchronously on
    /// the registering thread; a stored trigger is consumed to fire it the
    /// same way; otherwise it queues until a wake operation reaches it.
    pub fn then<R, F>(&self, f: F, priority: i32) -> Arc<Task<R>>
    where
        R: Send + Sync + 'static,
        F: FnOnce() -> R + Send + 'static,
    {
        let task = Task::function(Box::new(move || Some(f())), None, priority, None);
        self.register(Arc::clone(&task) as Arc<dyn RawTask>, priority);
        task
    }

    fn register(&self, raw: Arc<dyn RawTask>, priority: i32) {
        let fire_now = {
            let mut inner = self.inner.lock();
            match inner.state {
                LatchState::Set => true,
                LatchState::Triggered => {
                    inner.state = LatchState::Unset;
                    true
                }
                LatchState::Unset => {
                    let delegates = inner
                        .delegates
                        .get_or_insert_with(PriorityDispatcher::new);
                    delegates.dispatch_item(WorkItem::new(Arc::clone(&raw)), priority);
                    false
                }
            }
        };
        if fire_now {
            raw.fire();
        }
    }
}

impl Drop for ResettableEvent {
    fn drop(&mut self) {
        // Continuations that never got a wake fire now rather than dangle.
        let delegates = self.inner.get_mut().delegates.take();
        drain_delegates(delegates);
    }
}

fn drain_delegates(delegates: Option<Arc<PriorityDispatcher>>) -> bool {
    let Some(delegates) = delegates else {
        return false;
    };
    let mut fired = false;
    while delegates.invoke() {
        fired = true;
    }
    fired
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;

    fn short() -> Timeout {
        Timeout::after(Duration::from_millis(50))
    }

    #[test]
    fn event_send_and_sync() {
        static_assertions::assert_impl_all!(ResettableEvent: Send, Sync);
    }

    #[test]
    fn signal_is_level_triggered_until_reset() {
        let event = ResettableEvent::new();
        assert!(event.signal());
        assert!(!event.signal());
        assert_eq!(event.wait(&Timeout::none()), WaitOutcome::Signaled);
        assert_eq!(event.wait(&Timeout::none()), WaitOutcome::Signaled);

        assert!(event.reset());
        assert!(!event.reset());
        assert_eq!(event.wait(&Timeout::none()), WaitOutcome::TimedOut);
    }

    #[test]
    fn reset_then_signal_equals_signal_from_unset() {
        let event = ResettableEvent::new();
        event.signal();
        event.reset();
        assert!(event.signal());
        assert!(event.is_signaled());
    }

    #[test]
    fn pulse_one_with_no_waiters_stores_a_trigger() {
        let event = ResettableEvent::new();
        assert!(!event.pulse_one());
        // The stored wake satisfies the next wait without blocking.
        assert_eq!(event.wait(&short()), WaitOutcome::Signaled);
        assert!(!event.is_signaled());
        // And it was one-shot.
        assert_eq!(event.wait(&Timeout::none()), WaitOutcome::TimedOut);
    }

    #[test]
    fn second_pulse_one_rides_the_stored_trigger() {
        let event = ResettableEvent::new();
        assert!(!event.pulse_one());
        assert!(!event.pulse_one());
        assert_eq!(event.wait(&Timeout::none()), WaitOutcome::Signaled);
        assert_eq!(event.wait(&Timeout::none()), WaitOutcome::TimedOut);
    }

    #[test]
    fn pulse_all_consumes_a_stored_trigger() {
        let event = ResettableEvent::new();
        event.pulse_one();
        event.pulse_all();
        assert_eq!(event.wait(&Timeout::none()), WaitOutcome::TimedOut);
    }

    #[test]
    fn pulse_one_wakes_exactly_one_waiter() {
        let event = Arc::new(ResettableEvent::new());
        let waiters: Vec<_> = (0..3)
            .map(|_| {
                let event = Arc::clone(&event);
                std::thread::spawn(move || event.wait(&Timeout::after(Duration::from_secs(5))))
            })
            .collect();
        // Let them block.
        std::thread::sleep(Duration::from_millis(50));
        assert!(event.pulse_one());

        let outcomes: Vec<_> = waiters.into_iter().map(|w| w.join().unwrap()).collect();
        let signaled = outcomes
            .iter()
            .filter(|o| **o == WaitOutcome::Signaled)
            .count();
        assert_eq!(signaled, 1);
        assert_eq!(outcomes.len() - signaled, 2);
    }

    #[test]
    fn pulse_all_wakes_everyone_present() {
        let event = Arc::new(ResettableEvent::new());
        let waiters: Vec<_> = (0..4)
            .map(|_| {
                let event = Arc::clone(&event);
                std::thread::spawn(move || event.wait(&Timeout::after(Duration::from_secs(5))))
            })
            .collect();
        std::thread::sleep(Duration::from_millis(50));
        assert!(event.pulse_all());

        for waiter in waiters {
            assert_eq!(waiter.join().unwrap(), WaitOutcome::Signaled);
        }
        // The event itself stayed unset.
        assert!(!event.is_signaled());
    }

    #[test]
    fn continuations_fire_on_signal_in_priority_order() {
        let event = ResettableEvent::new();
        let order = Arc::new(parking_lot::Mutex::new(Vec::new()));
        for (priority, name) in [(5, "mid"), (1, "high"), (9, "low")] {
            let order = Arc::clone(&order);
            event.then(move || order.lock().push(name), priority);
        }
        event.signal();
        assert_eq!(*order.lock(), ["high", "mid", "low"]);
    }

    #[test]
    fn pulse_one_fires_a_single_continuation() {
        let event = ResettableEvent::new();
        let fired = Arc::new(AtomicUsize::new(0));
        for _ in 0..2 {
            let fired = Arc::clone(&fired);
            event.then(move || fired.fetch_add(1, Ordering::SeqCst), 0);
        }
        assert!(event.pulse_one());
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(event.pulse_one());
        assert_eq!(fired.load(Ordering::SeqCst), 2);
        // Continuations exhausted; the next pulse latches instead.
        assert!(!event.pulse_one());
        assert_eq!(event.wait(&Timeout::none()), WaitOutcome::Signaled);
    }

    #[test]
    fn continuation_on_set_event_fires_inline() {
        let event = ResettableEvent::new();
        event.signal();
        let task = event.then(|| 3, 0);
        assert!(task.is_signaled());
        assert_eq!(*task.get(), 3);
    }

    #[test]
    fn continuation_consumes_a_stored_trigger() {
        let event = ResettableEvent::new();
        event.pulse_one();
        let task = event.then(|| (), 0);
        assert!(task.is_signaled());
        assert_eq!(event.wait(&Timeout::none()), WaitOutcome::TimedOut);
    }

    #[test]
    fn waiters_between_resets_observe_their_own_wake() {
        // Pulse, reset, pulse again: each generation of waiters sees exactly
        // the wake issued while it was present.
        let event = Arc::new(ResettableEvent::new());
        for _ in 0..2 {
            let waiter = {
                let event = Arc::clone(&event);
                std::thread::spawn(move || event.wait(&Timeout::after(Duration::from_secs(5))))
            };
            std::thread::sleep(Duration::from_millis(30));
            assert!(event.pulse_all());
            assert_eq!(waiter.join().unwrap(), WaitOutcome::Signaled);
            assert!(!event.reset()); // pulse_all left it unset already
        }
    }
}
