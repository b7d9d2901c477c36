//! Types specific to time-keeping of batches.

use std::fmt::Display;
use std::ops::{Add, Sub};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Logical timestamp of one scheduling tick, in milliseconds of wall-clock time.
///
/// BatchTimes produced by the scheduler are always multiples of the batch interval.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct BatchTime(u64);

impl BatchTime {
    /// The zero timestamp
    pub const ZERO: BatchTime = BatchTime(0);

    /// Create a BatchTime from milliseconds
    pub const fn from_millis(millis: u64) -> Self {
        Self(millis)
    }

    /// Milliseconds represented by this BatchTime
    pub const fn as_millis(&self) -> u64 {
        self.0
    }

    /// Round down to the closest multiple of `interval`
    pub fn floor(&self, interval: Duration) -> Self {
        let step = interval_millis(interval);
        Self(self.0 - self.0 % step)
    }

    /// Round up to the closest multiple of `interval`
    pub fn ceil(&self, interval: Duration) -> Self {
        let step = interval_millis(interval);
        match self.0 % step {
            0 => *self,
            rem => Self(self.0 + (step - rem)),
        }
    }

    /// True if `self - zero` is a positive whole multiple of `interval`
    pub fn is_aligned(&self, zero: BatchTime, interval: Duration) -> bool {
        self.0 > zero.0 && (self.0 - zero.0) % interval_millis(interval) == 0
    }

    /// Subtract a duration, returning `None` on underflow
    pub fn checked_sub(&self, duration: Duration) -> Option<Self> {
        self.0.checked_sub(interval_millis(duration)).map(Self)
    }

    /// Iterate all times in the half-open range `(from, to]` with the given step.
    /// `to` must be reachable from `from` in whole steps for the bound to be included.
    pub fn range_exclusive(from: BatchTime, to: BatchTime, step: Duration) -> TimeRange {
        TimeRange {
            next: from.0 + interval_millis(step),
            end: to.0,
            step: interval_millis(step),
        }
    }
}

/// Iterator returned by [BatchTime::range_exclusive]
#[derive(Debug, Clone)]
pub struct TimeRange {
    next: u64,
    end: u64,
    step: u64,
}

impl Iterator for TimeRange {
    type Item = BatchTime;

    fn next(&mut self) -> Option<Self::Item> {
        if self.next > self.end {
            return None;
        }
        let current = self.next;
        self.next += self.step;
        Some(BatchTime(current))
    }
}

impl Add<Duration> for BatchTime {
    type Output = BatchTime;

    fn add(self, rhs: Duration) -> Self::Output {
        BatchTime(self.0 + interval_millis(rhs))
    }
}

impl Sub<Duration> for BatchTime {
    type Output = BatchTime;

    /// Saturates at zero
    fn sub(self, rhs: Duration) -> Self::Output {
        BatchTime(self.0.saturating_sub(interval_millis(rhs)))
    }
}

impl Sub<BatchTime> for BatchTime {
    type Output = Duration;

    /// Saturates at zero
    fn sub(self, rhs: BatchTime) -> Self::Output {
        Duration::from_millis(self.0.saturating_sub(rhs.0))
    }
}

impl Display for BatchTime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ms", self.0)
    }
}

/// Duration in whole milliseconds. Intervals shorter than a millisecond are
/// treated as one millisecond so they can never cause a division by zero.
pub fn interval_millis(duration: Duration) -> u64 {
    (duration.as_millis() as u64).max(1)
}

/// True if `duration` is a positive whole multiple of `base`
pub fn is_multiple_of(duration: Duration, base: Duration) -> bool {
    let d = duration.as_millis() as u64;
    d > 0 && d % interval_millis(base) == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn floor_and_ceil() {
        let t = BatchTime::from_millis(2500);
        let sec = Duration::from_secs(1);
        assert_eq!(t.floor(sec), BatchTime::from_millis(2000));
        assert_eq!(t.ceil(sec), BatchTime::from_millis(3000));
        assert_eq!(BatchTime::from_millis(3000).ceil(sec), BatchTime::from_millis(3000));
    }

    #[test]
    fn alignment_is_relative_to_zero() {
        let zero = BatchTime::from_millis(500);
        let two = Duration::from_secs(2);
        assert!(BatchTime::from_millis(2500).is_aligned(zero, two));
        assert!(!BatchTime::from_millis(1500).is_aligned(zero, two));
        // the zero time itself is never a batch
        assert!(!zero.is_aligned(zero, two));
    }

    #[test]
    fn exclusive_range() {
        let times: Vec<u64> = BatchTime::range_exclusive(
            BatchTime::from_millis(1000),
            BatchTime::from_millis(4000),
            Duration::from_secs(1),
        )
        .map(|t| t.as_millis())
        .collect();
        assert_eq!(times, vec![2000, 3000, 4000]);
    }

    #[test]
    fn multiples() {
        let sec = Duration::from_secs(1);
        assert!(is_multiple_of(Duration::from_secs(3), sec));
        assert!(!is_multiple_of(Duration::from_millis(1500), sec));
        assert!(!is_multiple_of(Duration::ZERO, sec));
    }
}
