//! Wall-clock timestamps.
//!
//! Header times and vote timestamps are carried as milliseconds since the
//! Unix epoch. Comparisons here are the only clock arithmetic consensus
//! performs on wall-clock values; timeout scheduling uses the runner's
//! monotonic clock instead.

use std::fmt;
use std::time::Duration;

/// Milliseconds since the Unix epoch.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Time(u64);

impl Time {
    pub const fn from_millis(millis: u64) -> Self {
        Time(millis)
    }

    pub const fn as_millis(&self) -> u64 {
        self.0
    }

    /// Saturating addition of a duration.
    pub fn add(&self, d: Duration) -> Time {
        Time(self.0.saturating_add(d.as_millis() as u64))
    }

    pub fn is_before(&self, other: Time) -> bool {
        self.0 < other.0
    }

    pub fn is_after(&self, other: Time) -> bool {
        self.0 > other.0
    }

    /// Duration since `earlier`, zero if `earlier` is in the future.
    pub fn since(&self, earlier: Time) -> Duration {
        Duration::from_millis(self.0.saturating_sub(earlier.0))
    }
}

impl fmt::Display for Time {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}ms", self.0)
    }
}

impl fmt::Debug for Time {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Time({}ms)", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ordering_and_arithmetic() {
        let t0 = Time::from_millis(1_000);
        let t1 = t0.add(Duration::from_secs(2));
        assert!(t0.is_before(t1));
        assert!(t1.is_after(t0));
        assert_eq!(t1.since(t0), Duration::from_secs(2));
        assert_eq!(t0.since(t1), Duration::ZERO);
    }
}
