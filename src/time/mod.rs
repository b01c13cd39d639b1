//! Tick-based time representation and the external tick source contract.
//!
//! The scheduler core owns no clock. It consumes a monotonic tick counter
//! through the [`TickSource`] collaborator and expresses every deadline in
//! ticks; what a tick means in wall-clock terms is the embedder's business.

use portable_atomic::{AtomicU64, Ordering};

/// Raw tick count.
pub type Tick = u64;

/// A point on the monotonic tick timeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Instant(Tick);

impl Instant {
    /// Create an instant from a raw tick count.
    pub const fn from_ticks(ticks: Tick) -> Self {
        Self(ticks)
    }

    /// Raw tick count since the source's epoch.
    pub const fn ticks(self) -> Tick {
        self.0
    }

    /// Duration elapsed since `earlier`, saturating at zero.
    pub fn duration_since(self, earlier: Instant) -> Duration {
        Duration(self.0.saturating_sub(earlier.0))
    }
}

impl core::ops::Add<Duration> for Instant {
    type Output = Self;

    fn add(self, duration: Duration) -> Self {
        Self(self.0.saturating_add(duration.0))
    }
}

/// A span of ticks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Duration(Tick);

impl Duration {
    /// The empty duration.
    pub const ZERO: Duration = Duration(0);

    /// Create a duration from a tick count.
    pub const fn from_ticks(ticks: Tick) -> Self {
        Self(ticks)
    }

    /// Tick count in this duration.
    pub const fn ticks(self) -> Tick {
        self.0
    }
}

/// How long a blocking call is willing to wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Timeout {
    /// Fail with `Busy` immediately if the resource is unavailable.
    NoWait,
    /// Wait up to the given number of ticks, then fail with `TimedOut`.
    After(Duration),
    /// Wait until the resource becomes available.
    Forever,
}

impl Timeout {
    /// Absolute deadline for this timeout starting at `now`, if finite.
    pub fn deadline(self, now: Instant) -> Option<Instant> {
        match self {
            Timeout::NoWait => Some(now),
            Timeout::After(d) => Some(now + d),
            Timeout::Forever => None,
        }
    }

    /// Whether this timeout refuses to block at all.
    pub fn is_no_wait(self) -> bool {
        matches!(self, Timeout::NoWait)
    }
}

/// External monotonic tick counter.
///
/// Implementations read a hardware cycle counter or timer. The only
/// requirement is monotonicity; the scheduler never writes the counter.
pub trait TickSource: Send + Sync {
    /// Current tick count.
    fn now(&self) -> Instant;
}

/// A manually advanced tick source for host testing.
pub struct MockTicks {
    ticks: AtomicU64,
}

impl MockTicks {
    /// Start the mock timeline at tick zero.
    pub const fn new() -> Self {
        Self {
            ticks: AtomicU64::new(0),
        }
    }

    /// Advance the timeline by `n` ticks.
    pub fn advance(&self, n: Tick) {
        self.ticks.fetch_add(n, Ordering::AcqRel);
    }
}

impl Default for MockTicks {
    fn default() -> Self {
        Self::new()
    }
}

impl TickSource for MockTicks {
    fn now(&self) -> Instant {
        Instant::from_ticks(self.ticks.load(Ordering::Acquire))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instant_arithmetic() {
        let t0 = Instant::from_ticks(100);
        let t1 = t0 + Duration::from_ticks(50);
        assert_eq!(t1.ticks(), 150);
        assert_eq!(t1.duration_since(t0), Duration::from_ticks(50));
        assert_eq!(t0.duration_since(t1), Duration::ZERO);
    }

    #[test]
    fn timeout_deadlines() {
        let now = Instant::from_ticks(10);
        assert_eq!(Timeout::NoWait.deadline(now), Some(now));
        assert_eq!(
            Timeout::After(Duration::from_ticks(5)).deadline(now),
            Some(Instant::from_ticks(15))
        );
        assert_eq!(Timeout::Forever.deadline(now), None);
        assert!(Timeout::NoWait.is_no_wait());
        assert!(!Timeout::Forever.is_no_wait());
    }

    #[test]
    fn mock_ticks_advance() {
        let ticks = MockTicks::new();
        assert_eq!(ticks.now().ticks(), 0);
        ticks.advance(7);
        ticks.advance(3);
        assert_eq!(ticks.now().ticks(), 10);
    }
}
