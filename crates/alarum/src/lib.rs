// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Precise timers served by a single worker thread over a global
//! expiration-ordered map.
//!
//! # Overview
//!
//! - [`Timer`] — a one-shot timer with abort, sliding-window extension,
//!   rearming ([`refire`](Timer::refire)) and rescheduling. Waitable, and a
//!   continuation target through [`then`](Timer::then).
//! - [`PeriodicTimer`] — fires every period until stopped, aligned to the
//!   original start.
//! - [`shutdown`] — orderly teardown of the engine at process exit.
//!
//! The first timer created lazily starts the engine: one worker thread and a
//! process-wide map ordered by absolute expiration. The worker sleeps until
//! the earliest deadline, drains everything expired, and re-validates each
//! entry against its timer's record before firing — an entry whose timer was
//! extended while the worker slept is put back at its real deadline, and an
//! aborted one is discarded. Handlers and continuations therefore run on the
//! worker thread; expiration is a lower bound, with no guaranteed upper
//! bound under backlog.
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//!
//! use alarum::Timer;
//! use taskwell::{Timeout, WaitOutcome};
//!
//! let timer = Timer::new(Timeout::after(Duration::from_millis(50)));
//! assert_eq!(
//!     timer.wait(&Timeout::after(Duration::from_secs(1))),
//!     WaitOutcome::Signaled,
//! );
//!
//! // Rearm for the next 50ms interval, aligned to the original start.
//! assert!(timer.refire());
//! ```

mod engine;
mod timer;

pub use engine::{ExtendOutcome, shutdown};
pub use timer::{PeriodicTimer, Timer};
