// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

#![allow(missing_docs, clippy::unwrap_used, reason = "test code")]

//! Serial dispatcher ordering and exclusivity under contention.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;
use taskwell::{Dispatch, DispatchExt, PriorityDispatcher, SerialDispatcher};

#[test]
fn later_better_priority_preempts_a_scheduled_task() {
    let inner = PriorityDispatcher::new();
    let serial = SerialDispatcher::new(inner.clone() as Arc<dyn Dispatch>);
    let order = Arc::new(Mutex::new(Vec::new()));

    {
        let order = Arc::clone(&order);
        serial.dispatch(move || order.lock().push("A"), 10);
    }
    // A's expire hook sits unfired on the inner dispatcher; B outranks it.
    {
        let order = Arc::clone(&order);
        serial.dispatch(move || order.lock().push("B"), 1);
    }

    while inner.invoke() {}
    assert_eq!(*order.lock(), ["B", "A"]);
}

#[test]
fn no_two_tasks_overlap_on_the_inner_dispatcher() {
    let inner = PriorityDispatcher::new();
    let serial = SerialDispatcher::new(inner.clone() as Arc<dyn Dispatch>);

    let active = Arc::new(AtomicUsize::new(0));
    let overlapped = Arc::new(AtomicBool::new(false));
    let done = Arc::new(AtomicUsize::new(0));
    const TASKS: usize = 64;

    for _ in 0..TASKS {
        let active = Arc::clone(&active);
        let overlapped = Arc::clone(&overlapped);
        let done = Arc::clone(&done);
        serial.dispatch(
            move || {
                if active.fetch_add(1, Ordering::SeqCst) != 0 {
                    overlapped.store(true, Ordering::SeqCst);
                }
                thread::sleep(Duration::from_micros(200));
                active.fetch_sub(1, Ordering::SeqCst);
                done.fetch_add(1, Ordering::SeqCst);
            },
            fastrand::i32(0..8),
        );
    }

    // Several threads pump the inner dispatcher concurrently; the serial
    // dispatcher must still run its tasks one at a time.
    let pumpers: Vec<_> = (0..4)
        .map(|_| {
            let inner = Arc::clone(&inner);
            let done = Arc::clone(&done);
            thread::spawn(move || {
                while done.load(Ordering::SeqCst) < TASKS {
                    if !inner.invoke() {
                        thread::yield_now();
                    }
                }
            })
        })
        .collect();
    for pumper in pumpers {
        pumper.join().unwrap();
    }

    assert_eq!(done.load(Ordering::SeqCst), TASKS);
    assert!(!overlapped.load(Ordering::SeqCst));
    assert!(serial.is_empty());
}

#[test]
fn selection_always_picks_a_best_priority_task() {
    let inner = PriorityDispatcher::new();
    let serial = SerialDispatcher::new(inner.clone() as Arc<dyn Dispatch>);
    let order = Arc::new(Mutex::new(Vec::new()));

    for (priority, name) in [(7, "mid"), (9, "low"), (2, "high")] {
        let order = Arc::clone(&order);
        serial.dispatch(move || order.lock().push((priority, name)), priority);
    }
    while inner.invoke() {}

    let ran = order.lock();
    let priorities: Vec<i32> = ran.iter().map(|(p, _)| *p).collect();
    assert_eq!(priorities, [2, 7, 9]);
}

#[test]
fn chained_task_blocks_the_next_until_its_inner_settles() {
    let hook_exec = PriorityDispatcher::new();
    let serial = SerialDispatcher::new(hook_exec.clone() as Arc<dyn Dispatch>);
    let chain_exec = PriorityDispatcher::new();

    let chained = {
        let chain_exec = Arc::clone(&chain_exec);
        serial.dispatch_chained(move || chain_exec.dispatch(|| "inner", 0), 1)
    };
    let follower = serial.dispatch(|| "after", 5);

    // Pump the serial dispatcher's own executor dry: the chained stage has
    // run, but its inner task has not settled, so the follower must wait.
    while hook_exec.invoke() {}
    assert!(chained.is_pending());
    assert!(follower.is_pending());

    // Settle the chain; the serial dispatcher resumes.
    assert!(chain_exec.invoke());
    while hook_exec.invoke() {}
    assert_eq!(*chained.get(), "inner");
    assert!(follower.is_signaled());
}

#[test]
fn concurrent_producers_funnel_cleanly() {
    let inner = PriorityDispatcher::new();
    let serial = SerialDispatcher::new(inner.clone() as Arc<dyn Dispatch>);
    let ran = Arc::new(AtomicUsize::new(0));
    const PER_PRODUCER: usize = 100;

    let producers: Vec<_> = (0..4)
        .map(|p| {
            let serial = Arc::clone(&serial);
            let ran = Arc::clone(&ran);
            thread::spawn(move || {
                for i in 0..PER_PRODUCER {
                    let ran = Arc::clone(&ran);
                    serial.dispatch(
                        move || {
                            ran.fetch_add(1, Ordering::SeqCst);
                        },
                        ((p * 31 + i) % 16) as i32,
                    );
                }
            })
        })
        .collect();

    let done = Arc::new(AtomicBool::new(false));
    let pumper = {
        let inner = Arc::clone(&inner);
        let done = Arc::clone(&done);
        thread::spawn(move || {
            while !done.load(Ordering::SeqCst) {
                if !inner.invoke() {
                    thread::yield_now();
                }
            }
            while inner.invoke() {}
        })
    };

    for producer in producers {
        producer.join().unwrap();
    }
    while ran.load(Ordering::SeqCst) < 4 * PER_PRODUCER {
        thread::yield_now();
    }
    done.store(true, Ordering::SeqCst);
    pumper.join().unwrap();

    assert_eq!(ran.load(Ordering::SeqCst), 4 * PER_PRODUCER);
    assert!(serial.is_empty());
}
