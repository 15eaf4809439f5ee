//! Monotonic time types used across the stack.
//!
//! The worker needs a `const`-constructible duration (configuration
//! constants are computed at compile time) and cheap arithmetic on
//! millisecond counts; wrapping `std::time::{Instant, Duration}` directly
//! does neither, so the stack keeps its own millisecond-based
//! `Instant`/`Duration` newtypes instead of reaching for `std::time` in
//! the hot path. Host time is read in exactly one place, [`Clock::now`].

use core::fmt;
use core::ops::{Add, AddAssign, Sub, SubAssign};
use std::time::Instant as StdInstant;

/// A length of time, represented in whole milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct Duration(u64);

impl Duration {
    pub const ZERO: Duration = Duration(0);

    pub const fn from_millis(millis: u64) -> Duration {
        Duration(millis)
    }

    pub const fn from_secs(secs: u64) -> Duration {
        Duration(secs * 1000)
    }

    pub const fn millis(&self) -> u64 {
        self.0
    }

    pub const fn secs(&self) -> u64 {
        self.0 / 1000
    }

    pub fn saturating_sub(&self, other: Duration) -> Duration {
        Duration(self.0.saturating_sub(other.0))
    }
}

impl fmt::Display for Duration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}ms", self.0)
    }
}

impl Add for Duration {
    type Output = Duration;
    fn add(self, rhs: Duration) -> Duration {
        Duration(self.0 + rhs.0)
    }
}

impl Sub for Duration {
    type Output = Duration;
    fn sub(self, rhs: Duration) -> Duration {
        Duration(self.0.saturating_sub(rhs.0))
    }
}

impl From<std::time::Duration> for Duration {
    fn from(d: std::time::Duration) -> Duration {
        Duration(d.as_millis() as u64)
    }
}

impl From<Duration> for std::time::Duration {
    fn from(d: Duration) -> std::time::Duration {
        std::time::Duration::from_millis(d.0)
    }
}

/// A monotonic point in time, in milliseconds since the stack's reference
/// instant (captured the first time `Clock::default()` runs).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Instant(u64);

impl Instant {
    pub const ZERO: Instant = Instant(0);

    pub const fn from_millis(millis: u64) -> Instant {
        Instant(millis)
    }

    pub const fn millis(&self) -> u64 {
        self.0
    }

    pub fn checked_duration_since(&self, earlier: Instant) -> Option<Duration> {
        self.0.checked_sub(earlier.0).map(Duration)
    }

    /// Saturating: never goes negative, matching the delta-list timer's
    /// "time never runs backwards" assumption.
    pub fn duration_since(&self, earlier: Instant) -> Duration {
        Duration(self.0.saturating_sub(earlier.0))
    }
}

impl Add<Duration> for Instant {
    type Output = Instant;
    fn add(self, rhs: Duration) -> Instant {
        Instant(self.0 + rhs.0)
    }
}

impl AddAssign<Duration> for Instant {
    fn add_assign(&mut self, rhs: Duration) {
        self.0 += rhs.0;
    }
}

impl Sub<Duration> for Instant {
    type Output = Instant;
    fn sub(self, rhs: Duration) -> Instant {
        Instant(self.0.saturating_sub(rhs.0))
    }
}

impl SubAssign<Duration> for Instant {
    fn sub_assign(&mut self, rhs: Duration) {
        self.0 = self.0.saturating_sub(rhs.0);
    }
}

impl fmt::Display for Instant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}ms", self.0)
    }
}

/// Reads host wall-clock time and turns it into monotonic `Instant`s
/// relative to the clock's construction time. The worker owns exactly one
/// `Clock` and threads it through every timer/timeout computation; this is
/// the only place `std::time::Instant::now()` is called.
#[derive(Debug)]
pub struct Clock {
    origin: StdInstant,
}

impl Clock {
    pub fn new() -> Clock {
        Clock {
            origin: StdInstant::now(),
        }
    }

    pub fn now(&self) -> Instant {
        Instant(self.origin.elapsed().as_millis() as u64)
    }
}

impl Default for Clock {
    fn default() -> Self {
        Clock::new()
    }
}
