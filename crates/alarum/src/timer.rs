// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::fmt::Debug;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use taskwell::{ResettableEvent, Task, Timeout, WaitOutcome};

use crate::engine::{ExtendOutcome, Fire, InnerTimer};

enum TriggerStyle {
    /// Latch the event; the timer stays signaled until rearmed.
    OneShot,
    /// Pulse waiters and rearm for the next interval.
    Periodic,
}

/// State shared between the public timer handle and the engine's weak
/// back-reference.
struct TimerShared {
    /// The engine-side record. Replaced only by `reschedule` when the new
    /// deadline is earlier than the current one.
    inner: Mutex<Option<Arc<InnerTimer>>>,
    event: ResettableEvent,
    handler: Option<Box<dyn Fn() + Send + Sync>>,
    style: TriggerStyle,
    /// Set by a periodic stop; checked before rearming so a stop that lost
    /// the race against an in-flight firing still ends the series.
    stopped: AtomicBool,
    weak_self: Weak<TimerShared>,
}

impl Fire for TimerShared {
    fn triggered(&self) {
        if let Some(handler) = &self.handler {
            handler();
        }
        match self.style {
            TriggerStyle::OneShot => {
                self.event.signal();
            }
            TriggerStyle::Periodic => {
                self.event.pulse_all();
                if self.stopped.load(Ordering::Acquire) {
                    return;
                }
                let inner = self.inner.lock().clone();
                if let Some(inner) = inner {
                    let _ = inner.refire();
                }
            }
        }
    }
}

impl TimerShared {
    fn build(
        timeout: Timeout,
        handler: Option<Box<dyn Fn() + Send + Sync>>,
        style: TriggerStyle,
    ) -> Arc<Self> {
        let shared = Arc::new_cyclic(|weak_self| Self {
            inner: Mutex::new(None),
            event: ResettableEvent::new(),
            handler,
            style,
            stopped: AtomicBool::new(false),
            weak_self: Weak::clone(weak_self),
        });
        if !timeout.is_infinite() {
            let inner = InnerTimer::new(timeout, shared.fire_ref());
            *shared.inner.lock() = Some(Arc::clone(&inner));
            inner.defer();
        }
        shared
    }

    fn fire_ref(&self) -> Weak<dyn Fire> {
        let weak: Weak<dyn Fire> = self.weak_self.clone();
        weak
    }

    fn current_inner(&self) -> Option<Arc<InnerTimer>> {
        self.inner.lock().clone()
    }
}

/// A timer driven by the process-wide timer engine.
///
/// Constructed armed: once the deadline passes, the engine's worker thread
/// invokes the optional handler and signals the timer, releasing waiters and
/// continuations. A fired timer can be rearmed with
/// [`refire`](Self::refire) (next multiple of the original period) or
/// [`refire_with`](Self::refire_with); a pending one can be aborted,
/// extended, or rescheduled.
///
/// Dropping the last handle aborts a pending timer. Timers created while the
/// engine is shutting down never fire.
///
/// # Examples
///
/// ```no_run
/// use std::time::Duration;
///
/// use alarum::Timer;
/// use taskwell::{Timeout, WaitOutcome};
///
/// let timer = Timer::new(Timeout::after(Duration::from_millis(50)));
/// let echo = timer.then(|| "fired", 0);
/// assert_eq!(timer.wait(&Timeout::after(Duration::from_secs(1))), WaitOutcome::Signaled);
/// assert_eq!(*echo.get(), "fired");
/// ```
pub struct Timer {
    shared: Arc<TimerShared>,
}

impl Debug for Timer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Timer")
            .field("signaled", &self.is_signaled())
            .finish_non_exhaustive()
    }
}

impl Timer {
    /// Starts a timer for `timeout`. An infinite timeout creates a dormant
    /// timer that only [`reset`](Self::reset) can arm.
    #[must_use]
    pub fn new(timeout: Timeout) -> Self {
        Self {
            shared: TimerShared::build(timeout, None, TriggerStyle::OneShot),
        }
    }

    /// Starts a timer that additionally runs `handler` on the engine's
    /// worker thread when it fires. Keep handlers short; they delay every
    /// other timer.
    #[must_use]
    pub fn with_handler<F>(timeout: Timeout, handler: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        Self {
            shared: TimerShared::build(timeout, Some(Box::new(handler)), TriggerStyle::OneShot),
        }
    }

    /// The timer's current timeout; infinite for a dormant timer.
    #[must_use]
    pub fn timeout(&self) -> Timeout {
        self.shared
            .current_inner()
            .map_or_else(Timeout::infinite, |inner| inner.timeout())
    }

    /// The period of the current timeout.
    #[must_use]
    pub fn period(&self) -> Duration {
        self.timeout().period()
    }

    /// Time remaining until the timer fires, clamped to zero.
    #[must_use]
    pub fn pending(&self) -> Duration {
        self.timeout().pending()
    }

    /// Whether the timer has fired and not been rearmed.
    #[must_use]
    pub fn is_signaled(&self) -> bool {
        self.shared.event.is_signaled()
    }

    /// Cancels a pending timer. Returns `false` if it already fired; an
    /// in-flight handler invocation is not interrupted.
    pub fn abort(&self) -> bool {
        self.shared
            .current_inner()
            .is_none_or(|inner| inner.abort())
    }

    /// Slides the deadline forward by one fresh period, reporting what the
    /// timer's state allowed.
    pub fn try_extend(&self) -> ExtendOutcome {
        self.shared
            .current_inner()
            .map_or(ExtendOutcome::Aborted, |inner| inner.try_extend())
    }

    /// Best-effort [`try_extend`](Self::try_extend).
    pub fn extend(&self) {
        let _ = self.try_extend();
    }

    /// Rearms a fired timer at the next multiple of its period, measured
    /// from the original start — a periodic caller that rearms promptly gets
    /// deadlines `start + n * period` without drift.
    ///
    /// Returns `false` (asserting in debug builds) if the timer has not
    /// fired; rearming a pending timer is a caller error.
    pub fn refire(&self) -> bool {
        self.shared.event.reset();
        self.shared
            .current_inner()
            .is_some_and(|inner| inner.refire())
    }

    /// Rearms a fired timer with a fresh timeout.
    pub fn refire_with(&self, timeout: Timeout) -> bool {
        self.shared.event.reset();
        self.shared
            .current_inner()
            .is_some_and(|inner| inner.refire_with(timeout))
    }

    /// Moves a pending timer's deadline to `timeout`.
    ///
    /// A later deadline moves in place. An earlier one cannot (the worker's
    /// map key cannot be pulled forward atomically), so the current engine
    /// record is aborted and a replacement is inserted; observable behavior
    /// is the same. An infinite timeout is treated as [`abort`](Self::abort).
    ///
    /// Returns `false` if the timer was found already fired.
    pub fn reschedule(&self, timeout: Timeout) -> bool {
        if timeout.is_infinite() {
            return self.abort();
        }
        let current = self.shared.current_inner();
        if let Some(inner) = &current {
            let (ok, replaced) = inner.try_reschedule(timeout);
            if !replaced {
                return ok;
            }
        }
        let replacement = InnerTimer::new(timeout, self.shared.fire_ref());
        let installed = {
            let mut slot = self.shared.inner.lock();
            let unchanged = match (&*slot, &current) {
                (Some(held), Some(seen)) => Arc::ptr_eq(held, seen),
                (None, None) => true,
                _ => false,
            };
            if unchanged {
                *slot = Some(Arc::clone(&replacement));
            }
            unchanged
        };
        if installed {
            replacement.defer();
        }
        // A competing reschedule replaced the record first; its deadline
        // wins and this call still counts as a success.
        true
    }

    /// Starts or restarts the timer at `timeout`, whatever state it is in:
    /// reschedules a pending timer, rearms a fired one.
    pub fn reset(&self, timeout: Timeout) {
        while !self.reschedule(timeout) && !self.refire_with(timeout) {}
    }

    /// Blocks until the timer fires or the deadline passes.
    pub fn wait(&self, timeout: &Timeout) -> WaitOutcome {
        self.shared.event.wait(timeout)
    }

    /// [`wait`](Self::wait) with a bounded pre-blocking spin.
    pub fn wait_spin(&self, timeout: &Timeout, spin_count: u32) -> WaitOutcome {
        self.shared.event.wait_spin(timeout, spin_count)
    }

    /// Registers a continuation fired when the timer does; fires immediately
    /// if it already has.
    pub fn then<R, F>(&self, f: F, priority: i32) -> Arc<Task<R>>
    where
        R: Send + Sync + 'static,
        F: FnOnce() -> R + Send + 'static,
    {
        self.shared.event.then(f, priority)
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        let _ = self.abort();
    }
}

/// A timer that fires every period until stopped.
///
/// Each expiration runs the handler on the engine's worker thread, releases
/// the waiters blocked at that moment, and rearms for the next multiple of
/// the period. Intervals stay aligned to the original start; if the process
/// falls more than a full period behind, the next firing is immediate rather
/// than replayed.
pub struct PeriodicTimer {
    shared: Arc<TimerShared>,
}

impl Debug for PeriodicTimer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeriodicTimer").finish_non_exhaustive()
    }
}

impl PeriodicTimer {
    /// Starts a periodic timer invoking `handler` every `period`.
    #[must_use]
    pub fn new<F>(period: Duration, handler: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        Self {
            shared: TimerShared::build(
                Timeout::after(period),
                Some(Box::new(handler)),
                TriggerStyle::Periodic,
            ),
        }
    }

    /// Blocks until the next firing or the deadline passes.
    pub fn wait(&self, timeout: &Timeout) -> WaitOutcome {
        self.shared.event.wait(timeout)
    }

    /// Stops the timer. Returns `false` if a firing was already in flight;
    /// that firing completes (and rearms nothing further once the stop is
    /// observed).
    pub fn stop(&self) -> bool {
        self.shared.stopped.store(true, Ordering::Release);
        self.shared
            .current_inner()
            .is_none_or(|inner| inner.abort())
    }
}

impl Drop for PeriodicTimer {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}
