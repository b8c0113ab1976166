// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

#![allow(missing_docs, clippy::unwrap_used, reason = "test code")]

//! Contention tests for `PriorityQueue`.

use std::sync::Arc;
use std::thread;

use priq::PriorityQueue;

/// A priority change that reported success leaves the element observable at
/// the new priority (or popped), even while other threads hammer the head.
#[test]
fn change_priority_under_contention_is_visible() {
    let queue = Arc::new(PriorityQueue::new());
    for i in 0..1_000 {
        queue.insert(100, i);
    }
    let target = queue.insert(100, 1_000_000);

    let changer = {
        let queue = Arc::clone(&queue);
        thread::spawn(move || queue.change_priority(&target, 1))
    };
    assert!(changer.join().unwrap());

    // The element now outranks the rest of the load.
    assert_eq!(*queue.pop().unwrap(), 1_000_000);
}

#[test]
fn racing_pop_and_remove_observe_each_element_once() {
    let queue = Arc::new(PriorityQueue::new());
    let tokens: Vec<_> = (0..10_000).map(|i| queue.insert(i % 64, i)).collect();

    let popper = {
        let queue = Arc::clone(&queue);
        thread::spawn(move || {
            let mut popped = 0_usize;
            while queue.pop().is_some() {
                popped += 1;
            }
            popped
        })
    };
    let remover = {
        let queue = Arc::clone(&queue);
        thread::spawn(move || tokens.iter().filter(|t| queue.remove(*t)).count())
    };

    let total = popper.join().unwrap() + remover.join().unwrap();
    // Some elements pop, some are removed by token, none are seen twice and
    // none survive... except those left when the popper ran dry early.
    let leftovers = {
        let mut n = 0;
        while queue.pop().is_some() {
            n += 1;
        }
        n
    };
    assert_eq!(total + leftovers, 10_000);
}

#[test]
fn concurrent_inserts_preserve_total_count() {
    let queue = Arc::new(PriorityQueue::new());
    let handles: Vec<_> = (0..8)
        .map(|t| {
            let queue = Arc::clone(&queue);
            thread::spawn(move || {
                for i in 0..1_000 {
                    queue.insert(i % 10, (t, i));
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }
    assert_eq!(queue.len(), 8_000);

    // And the drain comes out sorted.
    let drained = queue.drain();
    let priorities: Vec<i32> = drained.iter().map(priq::ValueToken::priority).collect();
    let mut sorted = priorities.clone();
    sorted.sort_unstable();
    assert_eq!(priorities, sorted);
}
