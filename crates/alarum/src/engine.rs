// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The process-wide timer engine: one worker thread serving an
//! expiration-ordered map of pending timers.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;

use parking_lot::{Condvar, Mutex};
use taskwell::Timeout;

/// Implemented by the outer timer object; invoked by the worker when an
/// entry expires.
pub(crate) trait Fire: Send + Sync {
    fn triggered(&self);
}

/// Map key: the deadline plus a discriminator so timers sharing an
/// expiration instant coexist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct EntryKey {
    deadline: Timeout,
    discriminator: u32,
}

/// The transacted per-timer record. The triple is the single source of
/// truth: the map entry's position may be stale (the timeout extended after
/// insertion) and the worker re-validates against this record on every
/// expiry.
pub(crate) struct TimerRecord {
    pub(crate) timeout: Timeout,
    pub(crate) fired: bool,
    pub(crate) aborted: bool,
}

/// Engine-side half of a timer. Held strongly by the expiration map and by
/// the outer timer; holds the outer weakly so an abandoned timer cannot be
/// kept alive by the engine.
pub(crate) struct InnerTimer {
    record: Mutex<TimerRecord>,
    outer: Weak<dyn Fire>,
}

/// Outcome of a sliding-window extension attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtendOutcome {
    /// The deadline was pushed out by one fresh period.
    Extended,
    /// Too late: the timer already fired.
    AlreadyFired,
    /// The timer had been aborted; nothing to extend.
    Aborted,
}

impl InnerTimer {
    pub(crate) fn new(timeout: Timeout, outer: Weak<dyn Fire>) -> Arc<Self> {
        Arc::new(Self {
            record: Mutex::new(TimerRecord {
                timeout,
                fired: false,
                aborted: false,
            }),
            outer,
        })
    }

    pub(crate) fn timeout(&self) -> Timeout {
        self.record.lock().timeout
    }

    /// Submits the timer to the engine. An already-expired deadline triggers
    /// on the calling thread; during engine shutdown this is a no-op and the
    /// timer never fires.
    pub(crate) fn defer(self: &Arc<Self>) {
        let Some(engine) = engine() else {
            return;
        };
        let (trigger, insert_at) = {
            let mut record = self.record.lock();
            debug_assert!(!record.fired, "defer on a fired timer");
            let timeout = record.timeout;
            if timeout.is_infinite() {
                (false, None)
            } else if timeout.expired() {
                if record.aborted {
                    (false, None)
                } else {
                    record.fired = true;
                    (true, None)
                }
            } else {
                (false, Some(timeout))
            }
        };
        if trigger {
            if let Some(outer) = self.outer.upgrade() {
                outer.triggered();
            }
        } else if let Some(deadline) = insert_at {
            engine.insert(deadline, Arc::clone(self));
        }
    }

    /// Marks the timer aborted. False if it had already fired.
    pub(crate) fn abort(&self) -> bool {
        let mut record = self.record.lock();
        if record.aborted {
            return true;
        }
        if record.fired {
            return false;
        }
        record.aborted = true;
        true
    }

    /// Rearms a fired timer at the next multiple of its period.
    /// False if the timer has not fired (caller error; asserts in debug).
    pub(crate) fn refire(self: &Arc<Self>) -> bool {
        {
            let mut record = self.record.lock();
            if !record.fired {
                debug_assert!(false, "refire on a timer that has not fired");
                return false;
            }
            debug_assert!(!record.aborted);
            record.timeout.refire();
            record.fired = false;
        }
        self.defer();
        true
    }

    /// Rearms a fired timer with a new deadline.
    pub(crate) fn refire_with(self: &Arc<Self>, timeout: Timeout) -> bool {
        {
            let mut record = self.record.lock();
            if !record.fired {
                debug_assert!(false, "refire on a timer that has not fired");
                return false;
            }
            debug_assert!(!record.aborted);
            record.timeout = timeout;
            record.fired = false;
        }
        self.defer();
        true
    }

    /// Replaces the timeout with a fresh one of the same period, sliding the
    /// deadline forward. The stale map entry is fixed up by the worker when
    /// it reaches it.
    pub(crate) fn try_extend(&self) -> ExtendOutcome {
        let mut record = self.record.lock();
        if record.aborted {
            return ExtendOutcome::Aborted;
        }
        if record.fired {
            return ExtendOutcome::AlreadyFired;
        }
        record.timeout = Timeout::after(record.timeout.period());
        ExtendOutcome::Extended
    }

    /// Moves the deadline to `timeout` if that is a pure postponement.
    ///
    /// Returns `(ok, replaced)`: `ok` is false iff the timer already fired;
    /// `replaced` is true when the timer was (or had been) aborted — a
    /// deadline earlier than the current one cannot be moved in place, so
    /// the record is aborted and the caller inserts a replacement.
    pub(crate) fn try_reschedule(&self, timeout: Timeout) -> (bool, bool) {
        let mut record = self.record.lock();
        if record.aborted {
            return (true, true);
        }
        if record.fired {
            return (false, false);
        }
        let earlier = timeout < record.timeout;
        record.timeout = timeout;
        record.aborted = earlier;
        (true, earlier)
    }
}

/// Binary wake semaphore with timed acquire, in the shape the worker needs:
/// releases saturate at one pending permit.
struct WakeSemaphore {
    available: Mutex<bool>,
    cond: Condvar,
}

impl WakeSemaphore {
    fn new() -> Self {
        Self {
            available: Mutex::new(false),
            cond: Condvar::new(),
        }
    }

    fn release(&self) {
        *self.available.lock() = true;
        self.cond.notify_one();
    }

    /// Waits for a permit until the deadline; false on timeout.
    fn acquire(&self, deadline: &Timeout) -> bool {
        let mut available = self.available.lock();
        loop {
            if *available {
                *available = false;
                return true;
            }
            if deadline.is_infinite() {
                self.cond.wait(&mut available);
            } else {
                let remaining = deadline.pending();
                if remaining.is_zero() {
                    return false;
                }
                let _ = self.cond.wait_for(&mut available, remaining);
            }
        }
    }
}

struct Engine {
    timers: Mutex<BTreeMap<EntryKey, Arc<InnerTimer>>>,
    wake: WakeSemaphore,
    terminating: AtomicBool,
    next_discriminator: AtomicU32,
}

impl Engine {
    fn new() -> Self {
        Self {
            timers: Mutex::new(BTreeMap::new()),
            wake: WakeSemaphore::new(),
            terminating: AtomicBool::new(false),
            next_discriminator: AtomicU32::new(0),
        }
    }

    /// Inserts an entry; wakes the worker iff it became the new head (its
    /// current sleep deadline is now too late).
    fn insert(&self, deadline: Timeout, inner: Arc<InnerTimer>) {
        let key = EntryKey {
            deadline,
            discriminator: self.next_discriminator.fetch_add(1, Ordering::Relaxed),
        };
        let is_head = {
            let mut timers = self.timers.lock();
            timers.insert(key, inner);
            timers
                .first_key_value()
                .is_some_and(|(head, _)| *head == key)
        };
        if is_head {
            self.wake.release();
        }
    }

    /// One expired entry popped from the front, or the deadline to sleep
    /// until.
    fn pop_expired(&self) -> Result<Option<Arc<InnerTimer>>, Timeout> {
        let mut timers = self.timers.lock();
        let head = match timers.first_key_value() {
            None => return Err(Timeout::infinite()),
            Some((key, _)) => {
                if !key.deadline.expired() {
                    return Err(key.deadline);
                }
                *key
            }
        };
        Ok(timers.remove(&head))
    }
}

fn worker_main(engine: &Engine) {
    tracing::debug!("timer worker started");
    let mut sleep_until = Timeout::infinite();
    loop {
        let _ = engine.wake.acquire(&sleep_until);
        loop {
            match engine.pop_expired() {
                Err(next) => {
                    sleep_until = next;
                    break;
                }
                Ok(None) => {}
                Ok(Some(inner)) => {
                    // Re-validate against the record: the map position may
                    // have been stale.
                    enum Step {
                        Drop,
                        Reinsert(Timeout),
                        Trigger,
                    }
                    let step = {
                        let mut record = inner.record.lock();
                        if record.aborted {
                            Step::Drop
                        } else if !record.timeout.pending().is_zero() {
                            // Extended while we slept; put it back at its
                            // real deadline.
                            Step::Reinsert(record.timeout)
                        } else {
                            record.fired = true;
                            Step::Trigger
                        }
                    };
                    match step {
                        Step::Drop => {}
                        Step::Reinsert(deadline) => engine.insert(deadline, inner),
                        Step::Trigger => {
                            if let Some(outer) = inner.outer.upgrade() {
                                tracing::trace!("timer expired");
                                outer.triggered();
                            }
                        }
                    }
                }
            }
        }
        if engine.terminating.load(Ordering::Acquire) {
            break;
        }
    }
    tracing::debug!("timer worker exiting");
}

enum EngineSlot {
    Uninit,
    Live {
        engine: Arc<Engine>,
        worker: JoinHandle<()>,
    },
    Terminated,
}

static ENGINE: Mutex<EngineSlot> = Mutex::new(EngineSlot::Uninit);

/// The live engine, starting it on first use. `None` once the engine has
/// been shut down: timers created from then on never fire.
fn engine() -> Option<Arc<Engine>> {
    let mut slot = ENGINE.lock();
    match &*slot {
        EngineSlot::Live { engine, .. } => Some(Arc::clone(engine)),
        EngineSlot::Terminated => None,
        EngineSlot::Uninit => {
            let engine = Arc::new(Engine::new());
            let worker = {
                let engine = Arc::clone(&engine);
                std::thread::Builder::new()
                    .name("alarum-timer".to_owned())
                    .spawn(move || worker_main(&engine))
                    .expect("failed to spawn the timer worker thread")
            };
            tracing::debug!("timer engine initialized");
            *slot = EngineSlot::Live {
                engine: Arc::clone(&engine),
                worker,
            };
            Some(engine)
        }
    }
}

/// Tears the timer engine down: stops and joins the worker thread.
///
/// Intended for orderly process shutdown. Pending timers never fire, and
/// timers created after this call are inert. The engine does not restart.
pub fn shutdown() {
    let taken = {
        let mut slot = ENGINE.lock();
        std::mem::replace(&mut *slot, EngineSlot::Terminated)
    };
    if let EngineSlot::Live { engine, worker } = taken {
        engine.terminating.store(true, Ordering::Release);
        engine.wake.release();
        if worker.join().is_err() {
            tracing::warn!("timer worker panicked during shutdown");
        }
    }
}
