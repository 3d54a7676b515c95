//! Monotonic time and deadlines
//!
//! All waits are expressed as absolute [`Deadline`]s in nanoseconds since a
//! process-wide monotonic epoch. Relative timeouts are converted exactly once,
//! at registration, so a requeued wait never drifts.

use once_cell::sync::Lazy;
use std::fmt;
use std::time::{Duration, Instant};

/// Process-wide origin of the monotonic clock
static EPOCH: Lazy<Instant> = Lazy::new(Instant::now);

/// Current absolute monotonic time in nanoseconds
pub fn now() -> u64 {
    let nanos = EPOCH.elapsed().as_nanos();
    u64::try_from(nanos).unwrap_or(u64::MAX - 1)
}

/// Convert a relative timeout in nanoseconds into an absolute deadline.
///
/// A zero or negative timeout maps to [`Deadline::INFINITE_PAST`] (poll
/// once, never wait) and `i64::MAX` maps to [`Deadline::INFINITE_FUTURE`].
pub fn relative_timeout_to_deadline_ns(timeout_ns: i64) -> Deadline {
    if timeout_ns <= 0 {
        Deadline::INFINITE_PAST
    } else if timeout_ns == i64::MAX {
        Deadline::INFINITE_FUTURE
    } else {
        Deadline::from_nanos(now().saturating_add(timeout_ns as u64))
    }
}

/// An absolute point on the monotonic clock
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Deadline(u64);

impl Deadline {
    /// A deadline that has always already passed
    pub const INFINITE_PAST: Deadline = Deadline(0);

    /// A deadline that never arrives
    pub const INFINITE_FUTURE: Deadline = Deadline(u64::MAX);

    /// Deadline at an absolute nanosecond timestamp
    pub const fn from_nanos(ns: u64) -> Self {
        Deadline(ns)
    }

    /// Deadline `after` from now
    pub fn after(after: Duration) -> Self {
        let delta = u64::try_from(after.as_nanos()).unwrap_or(u64::MAX);
        if delta == u64::MAX {
            return Deadline::INFINITE_FUTURE;
        }
        Deadline(now().saturating_add(delta).min(u64::MAX - 1))
    }

    /// Absolute nanoseconds
    pub const fn as_nanos(self) -> u64 {
        self.0
    }

    /// Whether this deadline never arrives
    pub fn is_infinite(self) -> bool {
        self == Deadline::INFINITE_FUTURE
    }

    /// Whether the deadline is at or before `now_ns`
    pub fn has_passed(self, now_ns: u64) -> bool {
        self.0 <= now_ns
    }

    /// Time left until the deadline, zero if it already passed
    pub fn remaining(self, now_ns: u64) -> Duration {
        Duration::from_nanos(self.0.saturating_sub(now_ns))
    }

    /// The matching `Instant`, or `None` for a deadline that never arrives
    pub fn to_instant(self) -> Option<Instant> {
        if self.is_infinite() {
            return None;
        }
        EPOCH.checked_add(Duration::from_nanos(self.0))
    }
}

impl fmt::Display for Deadline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Deadline::INFINITE_PAST => f.write_str("infinite-past"),
            Deadline::INFINITE_FUTURE => f.write_str("infinite-future"),
            Deadline(ns) => write!(f, "{}ns", ns),
        }
    }
}

/// How long a wait may last
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Timeout {
    /// Do not wait at all
    Immediate,
    /// Wait for a duration measured from registration time
    After(Duration),
    /// Wait until an absolute deadline
    At(Deadline),
    /// Wait forever
    Infinite,
}

impl Timeout {
    /// Resolve to an absolute deadline against the current clock
    pub fn to_deadline(self) -> Deadline {
        match self {
            Timeout::Immediate => Deadline::INFINITE_PAST,
            Timeout::After(duration) => Deadline::after(duration),
            Timeout::At(deadline) => deadline,
            Timeout::Infinite => Deadline::INFINITE_FUTURE,
        }
    }
}

impl From<Deadline> for Timeout {
    fn from(deadline: Deadline) -> Self {
        Timeout::At(deadline)
    }
}

impl From<Duration> for Timeout {
    fn from(duration: Duration) -> Self {
        Timeout::After(duration)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_now_is_monotonic() {
        let a = now();
        std::thread::sleep(Duration::from_millis(2));
        let b = now();
        assert!(b > a);
    }

    #[test]
    fn test_relative_timeout_sentinels() {
        assert_eq!(relative_timeout_to_deadline_ns(0), Deadline::INFINITE_PAST);
        assert_eq!(relative_timeout_to_deadline_ns(-5), Deadline::INFINITE_PAST);
        assert_eq!(
            relative_timeout_to_deadline_ns(i64::MAX),
            Deadline::INFINITE_FUTURE
        );
    }

    #[test]
    fn test_relative_timeout_is_absolute() {
        let before = now();
        let deadline = relative_timeout_to_deadline_ns(1_000_000);
        let after = now();
        assert!(deadline.as_nanos() >= before + 1_000_000);
        assert!(deadline.as_nanos() <= after + 1_000_000);
    }

    #[test]
    fn test_deadline_ordering_and_remaining() {
        let near = Deadline::from_nanos(100);
        let far = Deadline::from_nanos(200);
        assert!(near < far);
        assert!(Deadline::INFINITE_PAST < near);
        assert!(far < Deadline::INFINITE_FUTURE);
        assert_eq!(far.remaining(150), Duration::from_nanos(50));
        assert_eq!(near.remaining(150), Duration::ZERO);
        assert!(near.has_passed(100));
        assert!(!far.has_passed(100));
    }

    #[test]
    fn test_timeout_to_deadline() {
        assert_eq!(Timeout::Immediate.to_deadline(), Deadline::INFINITE_PAST);
        assert_eq!(Timeout::Infinite.to_deadline(), Deadline::INFINITE_FUTURE);
        let at = Deadline::from_nanos(42);
        assert_eq!(Timeout::At(at).to_deadline(), at);
        let d = Timeout::After(Duration::from_secs(1)).to_deadline();
        assert!(d.as_nanos() >= 1_000_000_000);
        assert!(!d.is_infinite());
    }

    #[test]
    fn test_infinite_deadline_has_no_instant() {
        assert!(Deadline::INFINITE_FUTURE.to_instant().is_none());
        assert!(Deadline::from_nanos(10).to_instant().is_some());
    }
}
