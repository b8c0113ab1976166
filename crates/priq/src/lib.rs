// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

#![cfg_attr(
    test,
    allow(
        clippy::unwrap_used,
        reason = "allow these lints in tests to improve the readability of the tests"
    )
)]

//! Concurrent priority-ordered multimap with removal tokens and in-flight
//! priority changes.
//!
//! [`PriorityQueue`] keeps elements sorted by a caller-supplied key (lower
//! keys pop first) and hands back tokens that name individual elements, so
//! that a scheduler can cancel or reprioritize a specific queued item long
//! after it was inserted, concurrently with other threads popping the head.
//!
//! # When to Use
//!
//! Use `PriorityQueue` when queued work is addressable after the fact:
//!
//! - **Dispatch queues**: cancel a queued task by token instead of scanning
//! - **Deadline maps**: move an entry to a new deadline while it is queued
//! - **Fair ordering**: elements with equal keys pop in insertion order
//!
//! # Example
//!
//! ```
//! use priq::PriorityQueue;
//!
//! let queue = PriorityQueue::new();
//! queue.insert(10, "slow");
//! let token = queue.insert(20, "slower");
//! queue.insert(1, "urgent");
//!
//! // An element can be moved while queued; its token follows it.
//! assert!(queue.change_priority(&token, 0));
//!
//! let head = queue.pop().unwrap();
//! assert_eq!(*head, "slower");
//! assert_eq!(head.priority(), 0);
//! ```
//!
//! # Ordering
//!
//! The queue is a multimap: any number of elements may share a key. Elements
//! with equal keys preserve FIFO order via an internal sequence number, so
//! two inserts at the same priority pop in the order they were made. A
//! priority change re-enters the element at the back of its new priority
//! band.
//!
//! # Thread Safety
//!
//! All operations take `&self` and are safe to call from any thread. Tokens
//! are `Send + Sync + Clone` and may be used from threads other than the
//! inserting one.

mod queue;
mod token;

pub use queue::PriorityQueue;
pub use token::{RemoveToken, Token, ValueToken};
