// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Deadline arithmetic on a wrap-tolerant monotonic counter.

use std::cmp::Ordering;
use std::sync::OnceLock;
use std::time::{Duration, Instant};

/// A reading of the monotonic clock, in nanoseconds, on a counter that is
/// allowed to wrap.
///
/// The width of the counter backing a monotonic clock is a platform detail;
/// deadline comparisons in this module therefore never assume that a later
/// reading compares numerically greater. See [`Timeout::expired`] for how
/// wraparound is compensated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Tick(u64);

fn epoch() -> Instant {
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    *EPOCH.get_or_init(Instant::now)
}

impl Tick {
    /// Reads the clock.
    #[must_use]
    #[allow(
        clippy::cast_possible_truncation,
        reason = "truncation is the point: the counter wraps and comparisons compensate"
    )]
    pub fn now() -> Self {
        Self(epoch().elapsed().as_nanos() as u64)
    }

    pub(crate) fn raw(self) -> u64 {
        self.0
    }

    #[allow(
        clippy::cast_possible_truncation,
        reason = "truncation is the point: the counter wraps and comparisons compensate"
    )]
    fn wrapping_add(self, d: Duration) -> Self {
        Self(self.0.wrapping_add(d.as_nanos() as u64))
    }

    #[allow(
        clippy::cast_possible_truncation,
        reason = "truncation is the point: the counter wraps and comparisons compensate"
    )]
    fn wrapping_sub(self, d: Duration) -> Self {
        Self(self.0.wrapping_sub(d.as_nanos() as u64))
    }
}

/// Whether a deadline has passed, tolerating counter wraparound.
///
/// Of the three orderings `start < expiration`, `now < start` and
/// `expiration <= now`, exactly one holds while the deadline is pending and
/// exactly zero or two hold once it has passed, no matter where the counter
/// wrapped — provided `start` is never in the future and the period fits in
/// half the counter range. An odd count of truths therefore means "pending".
fn deadline_passed(start: Tick, expiration: Tick, now: Tick) -> bool {
    !((start.0 < expiration.0) ^ (now.0 < start.0) ^ (expiration.0 <= now.0))
}

/// An absolute deadline derived from a starting instant and a period.
///
/// A `Timeout` represents an absolute time: re-using one across several
/// waiting calls does not extend the overall operation the way a relative
/// duration would. Construction starts the clock; when the period has fully
/// elapsed the timeout is [`expired`](Self::expired). [`refire`](Self::refire)
/// computes the next expiration aligned to the original start, which is what
/// periodic timers build on.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
///
/// use taskwell::Timeout;
///
/// let t = Timeout::after(Duration::from_secs(60));
/// assert!(!t.expired());
/// assert!(t.pending() <= Duration::from_secs(60));
///
/// assert!(!Timeout::infinite().expired());
/// assert!(Timeout::none().expired());
/// ```
#[derive(Debug, Clone, Copy)]
pub struct Timeout {
    start: Tick,
    period: Duration,
    expiration: Tick,
    infinite: bool,
}

impl Timeout {
    /// A deadline one `period` from now.
    #[must_use]
    pub fn after(period: Duration) -> Self {
        let start = Tick::now();
        Self {
            start,
            period,
            expiration: start.wrapping_add(period),
            infinite: false,
        }
    }

    /// A deadline that never expires.
    #[must_use]
    pub fn infinite() -> Self {
        Self {
            start: Tick(0),
            period: Duration::ZERO,
            expiration: Tick(0),
            infinite: true,
        }
    }

    /// An already-expired deadline; waiting against it polls.
    #[must_use]
    pub fn none() -> Self {
        Self {
            start: Tick(0),
            period: Duration::ZERO,
            expiration: Tick(0),
            infinite: false,
        }
    }

    /// Whether this timeout can never expire.
    #[must_use]
    pub fn is_infinite(&self) -> bool {
        self.infinite
    }

    /// The period this timeout was constructed from.
    #[must_use]
    pub fn period(&self) -> Duration {
        self.period
    }

    /// The raw expiration reading. Meaningless for infinite timeouts.
    #[must_use]
    pub fn expiration(&self) -> Tick {
        self.expiration
    }

    /// Whether the deadline has passed. A zero-period timeout is expired
    /// from birth; an infinite one never is.
    #[must_use]
    pub fn expired(&self) -> bool {
        if self.infinite {
            return false;
        }
        if self.period.is_zero() {
            return true;
        }
        deadline_passed(self.start, self.expiration, Tick::now())
    }

    /// Time remaining until expiration, clamped to zero.
    ///
    /// Infinite timeouts report zero here; callers that can block forever
    /// test [`is_infinite`](Self::is_infinite) first.
    #[must_use]
    pub fn pending(&self) -> Duration {
        if self.period.is_zero() || self.infinite {
            return Duration::ZERO;
        }
        let now = Tick::now();
        if deadline_passed(self.start, self.expiration, now) {
            return Duration::ZERO;
        }
        Duration::from_nanos(self.expiration.0.wrapping_sub(now.0))
    }

    /// Advances the deadline to the next multiple of the period.
    ///
    /// No-op until the current deadline has passed; `start` must never sit in
    /// the future or the wraparound compensation breaks down. If more than
    /// one full period has already elapsed the new expiration is immediate,
    /// so a periodic caller that fell behind fires now rather than replaying
    /// missed intervals.
    pub fn refire(&mut self) {
        if self.period.is_zero() || self.infinite {
            return;
        }
        let now = Tick::now();
        if !deadline_passed(self.start, self.expiration, now) {
            return;
        }
        let next = self.expiration.wrapping_add(self.period);
        if deadline_passed(self.start, next, now) {
            self.expiration = now;
            self.start = now.wrapping_sub(self.period);
        } else {
            self.start = self.start.wrapping_add(self.period);
            self.expiration = next;
        }
    }

    /// Lengthens the period, pushing the expiration out from the original
    /// start.
    pub fn extend_by(&mut self, extra: Duration) {
        if self.infinite {
            return;
        }
        self.period = self.period.saturating_add(extra);
        self.expiration = self.start.wrapping_add(self.period);
    }
}

// Ordering considers only the expiration; an infinite timeout sorts after
// every finite one. Equality is defined to agree with the ordering, so two
// timeouts with different periods but one expiration compare equal.
impl Ord for Timeout {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.infinite, self.expiration.0).cmp(&(other.infinite, other.expiration.0))
    }
}

impl PartialOrd for Timeout {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Timeout {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Timeout {}

impl From<Duration> for Timeout {
    fn from(period: Duration) -> Self {
        Self::after(period)
    }
}
