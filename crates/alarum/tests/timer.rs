// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

#![allow(missing_docs, clippy::unwrap_used, reason = "test code")]

//! Timer behavior against the live engine.
//!
//! These tests share the process-wide engine, so none of them may call
//! `alarum::shutdown`. Timing assertions use generous bounds; they check
//! ordering and lower bounds, not scheduler latency.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use alarum::{ExtendOutcome, PeriodicTimer, Timer};
use taskwell::{Timeout, WaitOutcome};

fn wait_budget() -> Timeout {
    Timeout::after(Duration::from_secs(5))
}

#[test]
fn timer_send_and_sync() {
    static_assertions::assert_impl_all!(Timer: Send, Sync);
    static_assertions::assert_impl_all!(PeriodicTimer: Send, Sync);
}

#[test]
fn fires_after_its_period() {
    let start = Instant::now();
    let timer = Timer::new(Timeout::after(Duration::from_millis(50)));
    assert_eq!(timer.wait(&wait_budget()), WaitOutcome::Signaled);
    assert!(start.elapsed() >= Duration::from_millis(45));
    assert!(timer.is_signaled());
}

#[test]
fn refire_arms_the_next_interval() {
    let timer = Timer::new(Timeout::after(Duration::from_millis(50)));
    assert_eq!(timer.wait(&wait_budget()), WaitOutcome::Signaled);

    let rearmed_at = Instant::now();
    assert!(timer.refire());
    assert!(!timer.is_signaled());
    assert_eq!(timer.wait(&wait_budget()), WaitOutcome::Signaled);
    // The second expiration lands about one period after the rearm.
    let elapsed = rearmed_at.elapsed();
    assert!(elapsed >= Duration::from_millis(20));
    assert!(elapsed < Duration::from_secs(2));
}

#[test]
fn refire_with_same_period_behaves_like_a_fresh_timer() {
    let timer = Timer::new(Timeout::after(Duration::from_millis(30)));
    assert_eq!(timer.wait(&wait_budget()), WaitOutcome::Signaled);
    assert!(timer.refire_with(Timeout::after(Duration::from_millis(30))));

    assert_eq!(timer.period(), Duration::from_millis(30));
    assert!(!timer.is_signaled());
    assert_eq!(timer.wait(&wait_budget()), WaitOutcome::Signaled);
}

#[test]
fn abort_prevents_firing() {
    let timer = Timer::new(Timeout::after(Duration::from_millis(100)));
    assert!(timer.abort());
    assert_eq!(
        timer.wait(&Timeout::after(Duration::from_millis(300))),
        WaitOutcome::TimedOut
    );
}

#[test]
fn abort_after_firing_reports_failure() {
    let timer = Timer::new(Timeout::after(Duration::from_millis(20)));
    assert_eq!(timer.wait(&wait_budget()), WaitOutcome::Signaled);
    assert!(!timer.abort());
}

#[test]
fn infinite_timer_never_fires() {
    let timer = Timer::new(Timeout::infinite());
    assert_eq!(
        timer.wait(&Timeout::after(Duration::from_secs(1))),
        WaitOutcome::TimedOut
    );
    assert!(timer.timeout().is_infinite());
}

#[test]
fn zero_duration_timer_fires_immediately() {
    let timer = Timer::new(Timeout::after(Duration::ZERO));
    assert_eq!(timer.wait(&wait_budget()), WaitOutcome::Signaled);
}

#[test]
fn continuations_fire_on_expiry() {
    let timer = Timer::new(Timeout::after(Duration::from_millis(30)));
    let echo = timer.then(|| 99, 0);
    assert_eq!(echo.wait(&wait_budget()), WaitOutcome::Signaled);
    assert_eq!(*echo.get(), 99);
}

#[test]
fn handler_runs_on_expiry() {
    let count = Arc::new(AtomicUsize::new(0));
    let timer = {
        let count = Arc::clone(&count);
        Timer::with_handler(Timeout::after(Duration::from_millis(30)), move || {
            count.fetch_add(1, Ordering::SeqCst);
        })
    };
    assert_eq!(timer.wait(&wait_budget()), WaitOutcome::Signaled);
    assert_eq!(count.load(Ordering::SeqCst), 1);
}

#[test]
fn extend_pushes_the_deadline_out() {
    let timer = Timer::new(Timeout::after(Duration::from_millis(60)));
    std::thread::sleep(Duration::from_millis(20));
    assert_eq!(timer.try_extend(), ExtendOutcome::Extended);
    // The sliding window restarts from the extension.
    let remaining = timer.pending();
    assert!(remaining > Duration::from_millis(40));
    assert_eq!(timer.wait(&wait_budget()), WaitOutcome::Signaled);
}

#[test]
fn extend_after_firing_is_rejected() {
    let timer = Timer::new(Timeout::after(Duration::from_millis(20)));
    assert_eq!(timer.wait(&wait_budget()), WaitOutcome::Signaled);
    assert_eq!(timer.try_extend(), ExtendOutcome::AlreadyFired);
}

#[test]
fn reschedule_later_moves_in_place() {
    let timer = Timer::new(Timeout::after(Duration::from_millis(40)));
    assert!(timer.reschedule(Timeout::after(Duration::from_secs(60))));
    assert_eq!(
        timer.wait(&Timeout::after(Duration::from_millis(200))),
        WaitOutcome::TimedOut
    );
    assert!(timer.abort());
}

#[test]
fn reschedule_earlier_replaces_the_entry() {
    let timer = Timer::new(Timeout::after(Duration::from_secs(60)));
    let start = Instant::now();
    assert!(timer.reschedule(Timeout::after(Duration::from_millis(40))));
    assert_eq!(timer.wait(&wait_budget()), WaitOutcome::Signaled);
    assert!(start.elapsed() < Duration::from_secs(5));
}

#[test]
fn reschedule_to_infinite_aborts() {
    let timer = Timer::new(Timeout::after(Duration::from_millis(50)));
    assert!(timer.reschedule(Timeout::infinite()));
    assert_eq!(
        timer.wait(&Timeout::after(Duration::from_millis(200))),
        WaitOutcome::TimedOut
    );
}

#[test]
fn reset_restarts_a_fired_timer() {
    let timer = Timer::new(Timeout::after(Duration::from_millis(20)));
    assert_eq!(timer.wait(&wait_budget()), WaitOutcome::Signaled);
    timer.reset(Timeout::after(Duration::from_millis(30)));
    assert!(!timer.is_signaled());
    assert_eq!(timer.wait(&wait_budget()), WaitOutcome::Signaled);
}

#[test]
fn periodic_timer_fires_repeatedly() {
    let count = Arc::new(AtomicUsize::new(0));
    let timer = {
        let count = Arc::clone(&count);
        PeriodicTimer::new(Duration::from_millis(20), move || {
            count.fetch_add(1, Ordering::SeqCst);
        })
    };
    let deadline = Instant::now() + Duration::from_secs(5);
    while count.load(Ordering::SeqCst) < 3 && Instant::now() < deadline {
        let _ = timer.wait(&Timeout::after(Duration::from_millis(100)));
    }
    assert!(count.load(Ordering::SeqCst) >= 3);

    timer.stop();
    let settled = count.load(Ordering::SeqCst);
    std::thread::sleep(Duration::from_millis(100));
    // At most one in-flight firing may land after the stop.
    assert!(count.load(Ordering::SeqCst) <= settled + 1);
}

#[test]
fn many_timers_fire_independently() {
    let fired = Arc::new(AtomicUsize::new(0));
    let timers: Vec<_> = (0..50)
        .map(|i| {
            let fired = Arc::clone(&fired);
            Timer::with_handler(
                Timeout::after(Duration::from_millis(10 + (i % 7) * 5)),
                move || {
                    fired.fetch_add(1, Ordering::SeqCst);
                },
            )
        })
        .collect();
    for timer in &timers {
        assert_eq!(timer.wait(&wait_budget()), WaitOutcome::Signaled);
    }
    assert_eq!(fired.load(Ordering::SeqCst), 50);
}

#[test]
fn abort_races_with_firing_settle_one_way() {
    // Aborts racing the worker: every timer either fires or reports a
    // successful abort, never both.
    let fired = Arc::new(AtomicUsize::new(0));
    let mut aborted = 0_usize;
    for _ in 0..100 {
        let fired = Arc::clone(&fired);
        let timer = Timer::with_handler(Timeout::after(Duration::from_millis(2)), move || {
            fired.fetch_add(1, Ordering::SeqCst);
        });
        std::thread::sleep(Duration::from_millis(1));
        if timer.abort() {
            aborted += 1;
        } else {
            assert_eq!(timer.wait(&wait_budget()), WaitOutcome::Signaled);
        }
    }
    // Give any still-pending firings no chance to be miscounted: every
    // non-aborted timer was waited on above.
    assert_eq!(fired.load(Ordering::SeqCst) + aborted, 100);
}
