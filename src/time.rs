//! Monotonic time primitives for the scheduler.
//!
//! [`TimePoint`] is an instant on a process-wide monotonic clock;
//! [`TimeDelta`] is a signed duration between two instants. Both are
//! thin nanosecond newtypes with `ZERO`/`MAX` sentinels.
//! `TimeDelta::MAX` means "no deadline"; a negative delta means the
//! deadline is already overdue.

use core::fmt;
use std::ops::{Add, Neg, Sub};
use std::sync::OnceLock;
use std::time::{Duration, Instant};

/// A signed duration in nanoseconds.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct TimeDelta(i64);

impl TimeDelta {
    /// The zero duration.
    pub const ZERO: Self = Self(0);

    /// The "no deadline" sentinel.
    pub const MAX: Self = Self(i64::MAX);

    /// Creates a delta from nanoseconds.
    #[must_use]
    pub const fn from_nanos(nanos: i64) -> Self {
        Self(nanos)
    }

    /// Creates a delta from microseconds, saturating on overflow.
    #[must_use]
    pub const fn from_micros(micros: i64) -> Self {
        Self(micros.saturating_mul(1_000))
    }

    /// Creates a delta from milliseconds, saturating on overflow.
    #[must_use]
    pub const fn from_millis(millis: i64) -> Self {
        Self(millis.saturating_mul(1_000_000))
    }

    /// Creates a delta from seconds, saturating on overflow.
    #[must_use]
    pub const fn from_secs(secs: i64) -> Self {
        Self(secs.saturating_mul(1_000_000_000))
    }

    /// Returns the delta as nanoseconds.
    #[must_use]
    pub const fn as_nanos(self) -> i64 {
        self.0
    }

    /// Returns the delta as whole milliseconds (truncated).
    #[must_use]
    pub const fn as_millis(self) -> i64 {
        self.0 / 1_000_000
    }

    /// Returns the delta as whole seconds (truncated).
    #[must_use]
    pub const fn as_secs(self) -> i64 {
        self.0 / 1_000_000_000
    }

    /// Returns true if this is the "no deadline" sentinel.
    #[must_use]
    pub const fn is_max(self) -> bool {
        self.0 == i64::MAX
    }

    /// Converts to an unsigned [`Duration`].
    ///
    /// Returns `None` for negative deltas (already overdue).
    #[must_use]
    pub fn to_duration(self) -> Option<Duration> {
        u64::try_from(self.0).ok().map(Duration::from_nanos)
    }
}

impl Add for TimeDelta {
    type Output = Self;

    fn add(self, rhs: Self) -> Self {
        Self(self.0.saturating_add(rhs.0))
    }
}

impl Sub for TimeDelta {
    type Output = Self;

    fn sub(self, rhs: Self) -> Self {
        Self(self.0.saturating_sub(rhs.0))
    }
}

impl Neg for TimeDelta {
    type Output = Self;

    fn neg(self) -> Self {
        Self(self.0.saturating_neg())
    }
}

impl From<Duration> for TimeDelta {
    fn from(duration: Duration) -> Self {
        Self(i64::try_from(duration.as_nanos()).unwrap_or(i64::MAX))
    }
}

impl fmt::Debug for TimeDelta {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TimeDelta({}ns)", self.0)
    }
}

impl fmt::Display for TimeDelta {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_max() {
            write!(f, "max")
        } else if self.0.unsigned_abs() >= 1_000_000_000 {
            write!(f, "{}.{:03}s", self.0 / 1_000_000_000, (self.0 / 1_000_000).unsigned_abs() % 1000)
        } else if self.0.unsigned_abs() >= 1_000_000 {
            write!(f, "{}ms", self.0 / 1_000_000)
        } else if self.0.unsigned_abs() >= 1_000 {
            write!(f, "{}us", self.0 / 1_000)
        } else {
            write!(f, "{}ns", self.0)
        }
    }
}

/// An instant on the process-wide monotonic clock.
///
/// Measured in nanoseconds since an anchor captured the first time the
/// clock is read, so values are small, totally ordered, and cheap to
/// store in atomics.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct TimePoint(u64);

fn clock_anchor() -> Instant {
    static ANCHOR: OnceLock<Instant> = OnceLock::new();
    *ANCHOR.get_or_init(Instant::now)
}

impl TimePoint {
    /// The clock anchor instant.
    pub const ZERO: Self = Self(0);

    /// The maximum representable instant.
    pub const MAX: Self = Self(u64::MAX);

    /// Reads the current instant.
    #[must_use]
    pub fn now() -> Self {
        Self(u64::try_from(clock_anchor().elapsed().as_nanos()).unwrap_or(u64::MAX))
    }

    /// Creates an instant from nanoseconds since the clock anchor.
    #[must_use]
    pub const fn from_nanos(nanos: u64) -> Self {
        Self(nanos)
    }

    /// Returns the instant as nanoseconds since the clock anchor.
    #[must_use]
    pub const fn as_nanos(self) -> u64 {
        self.0
    }
}

impl Add<TimeDelta> for TimePoint {
    type Output = Self;

    fn add(self, rhs: TimeDelta) -> Self {
        if rhs.0 >= 0 {
            Self(self.0.saturating_add(rhs.0.unsigned_abs()))
        } else {
            Self(self.0.saturating_sub(rhs.0.unsigned_abs()))
        }
    }
}

impl Sub for TimePoint {
    type Output = TimeDelta;

    fn sub(self, rhs: Self) -> TimeDelta {
        if self.0 >= rhs.0 {
            TimeDelta(i64::try_from(self.0 - rhs.0).unwrap_or(i64::MAX))
        } else {
            TimeDelta(i64::try_from(rhs.0 - self.0).unwrap_or(i64::MAX).saturating_neg())
        }
    }
}

impl Sub<TimeDelta> for TimePoint {
    type Output = Self;

    fn sub(self, rhs: TimeDelta) -> Self {
        self + (-rhs)
    }
}

impl fmt::Debug for TimePoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TimePoint({}ns)", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delta_conversions() {
        assert_eq!(TimeDelta::from_secs(1).as_nanos(), 1_000_000_000);
        assert_eq!(TimeDelta::from_millis(1).as_nanos(), 1_000_000);
        assert_eq!(TimeDelta::from_micros(1).as_nanos(), 1_000);
        assert_eq!(TimeDelta::from_nanos(1_500_000_000).as_millis(), 1500);
        assert_eq!(TimeDelta::from_nanos(1_500_000_000).as_secs(), 1);
    }

    #[test]
    fn delta_arithmetic_saturates() {
        assert_eq!(TimeDelta::MAX + TimeDelta::from_secs(1), TimeDelta::MAX);
        let negative = TimeDelta::ZERO - TimeDelta::from_millis(5);
        assert_eq!(negative.as_millis(), -5);
        assert_eq!(-negative, TimeDelta::from_millis(5));
    }

    #[test]
    fn delta_duration_round_trip() {
        let delta = TimeDelta::from(Duration::from_millis(250));
        assert_eq!(delta.as_millis(), 250);
        assert_eq!(delta.to_duration(), Some(Duration::from_millis(250)));
        assert_eq!((TimeDelta::ZERO - delta).to_duration(), None);
    }

    #[test]
    fn max_is_sentinel() {
        assert!(TimeDelta::MAX.is_max());
        assert!(!TimeDelta::from_secs(1).is_max());
        assert!(TimeDelta::from_secs(1) < TimeDelta::MAX);
    }

    #[test]
    fn point_ordering_and_arithmetic() {
        let earlier = TimePoint::from_nanos(1_000);
        let later = TimePoint::from_nanos(3_500);
        assert!(earlier < later);
        assert_eq!(later - earlier, TimeDelta::from_nanos(2_500));
        assert_eq!(earlier - later, TimeDelta::from_nanos(-2_500));
        assert_eq!(earlier + TimeDelta::from_nanos(2_500), later);
        assert_eq!(later - TimeDelta::from_nanos(2_500), earlier);
    }

    #[test]
    fn point_now_is_monotonic() {
        let first = TimePoint::now();
        let second = TimePoint::now();
        assert!(second >= first);
    }

    #[test]
    fn point_add_saturates_at_max() {
        assert_eq!(TimePoint::MAX + TimeDelta::from_secs(1), TimePoint::MAX);
        assert_eq!(TimePoint::ZERO + TimeDelta::from_nanos(-5), TimePoint::ZERO);
    }
}
