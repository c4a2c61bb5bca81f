// Copyright the tern-quic project authors. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Defines time related datatypes and functions

use core::{fmt, num::NonZeroU64, time::Duration};

/// An absolute point in time.
///
/// The absolute value of `Timestamp`s should be treated as opaque. It is not
/// necessarily related to any calendar time. `Timestamp`s should only be
/// compared if they are sourced from the same clock.
///
/// `Timestamp`s are similar to the `Instant` data-type in the Rust standard
/// library, but have microsecond granularity and a guaranteed 8-byte
/// representation, so `Option<Timestamp>` stays 8 bytes as well.
#[derive(PartialEq, Eq, PartialOrd, Ord, Copy, Clone, Hash)]
pub struct Timestamp(NonZeroU64);

impl Timestamp {
    /// Creates a `Timestamp` from a `Duration` since the clock's epoch.
    #[inline]
    pub fn from_duration(duration: Duration) -> Self {
        let micros = duration.as_micros() as u64;
        // `micros + 1` keeps the niche for `Option<Timestamp>` available
        Self(NonZeroU64::new(micros.saturating_add(1)).unwrap())
    }

    #[inline]
    fn as_micros(self) -> u64 {
        self.0.get() - 1
    }

    /// Tries to calculate a `Timestamp` based on the current `Timestamp` and
    /// adding the provided `Duration`, returning `None` on overflow.
    #[inline]
    pub fn checked_add(self, duration: Duration) -> Option<Self> {
        let micros = self.as_micros().checked_add(duration.as_micros() as u64)?;
        Some(Self::from_duration(Duration::from_micros(micros)))
    }

    /// Tries to calculate a `Timestamp` based on the current `Timestamp` and
    /// subtracting the provided `Duration`, returning `None` on underflow.
    #[inline]
    pub fn checked_sub(self, duration: Duration) -> Option<Self> {
        let micros = self.as_micros().checked_sub(duration.as_micros() as u64)?;
        Some(Self::from_duration(Duration::from_micros(micros)))
    }

    /// Returns the `Duration` which elapsed since an earlier `Timestamp`.
    /// If `earlier` is more recent, the method returns a `Duration` of 0.
    #[inline]
    pub fn saturating_duration_since(self, earlier: Self) -> Duration {
        Duration::from_micros(self.as_micros().saturating_sub(earlier.as_micros()))
    }
}

impl core::ops::Add<Duration> for Timestamp {
    type Output = Timestamp;

    #[inline]
    fn add(self, rhs: Duration) -> Self::Output {
        self.checked_add(rhs).expect("timestamp overflow")
    }
}

impl core::ops::AddAssign<Duration> for Timestamp {
    #[inline]
    fn add_assign(&mut self, rhs: Duration) {
        *self = *self + rhs;
    }
}

impl core::ops::Sub<Duration> for Timestamp {
    type Output = Timestamp;

    #[inline]
    fn sub(self, rhs: Duration) -> Self::Output {
        self.checked_sub(rhs).expect("timestamp underflow")
    }
}

impl core::ops::Sub<Timestamp> for Timestamp {
    type Output = Duration;

    /// Returns the `Duration` which elapsed since an earlier `Timestamp`.
    ///
    /// Saturates to zero if `rhs` is more recent; the event-driven core never
    /// requires signed time arithmetic.
    #[inline]
    fn sub(self, rhs: Timestamp) -> Self::Output {
        self.saturating_duration_since(rhs)
    }
}

impl fmt::Debug for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Timestamp({}us)", self.as_micros())
    }
}

/// A `Clock` is a source of [`Timestamp`]s.
pub trait Clock {
    /// Returns the current [`Timestamp`]
    fn get_time(&self) -> Timestamp;
}

/// A clock which always returns a Timestamp of value 1us
#[derive(Clone, Copy, Debug)]
pub struct NoopClock;

impl Clock for NoopClock {
    fn get_time(&self) -> Timestamp {
        Timestamp::from_duration(Duration::from_micros(1))
    }
}

pub mod testing {
    use super::*;

    /// A clock that can be manually advanced, for driving timer-dependent
    /// state machines in tests
    #[derive(Clone, Copy, Debug)]
    pub struct Clock {
        current_timestamp: Timestamp,
    }

    impl Default for Clock {
        fn default() -> Self {
            Self {
                current_timestamp: Timestamp::from_duration(Duration::from_micros(1)),
            }
        }
    }

    impl Clock {
        pub fn inc_by(&mut self, duration: Duration) {
            self.current_timestamp += duration;
        }
    }

    impl super::Clock for Clock {
        fn get_time(&self) -> Timestamp {
            self.current_timestamp
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timestamp_arithmetic() {
        let a = Timestamp::from_duration(Duration::from_millis(100));
        let b = a + Duration::from_millis(50);
        assert_eq!(b - a, Duration::from_millis(50));
        // subtraction saturates
        assert_eq!(a - b, Duration::ZERO);
        assert_eq!(a.saturating_duration_since(b), Duration::ZERO);
        assert_eq!(b.checked_sub(Duration::from_secs(10)), None);
    }

    #[test]
    fn option_timestamp_is_niche_optimized() {
        assert_eq!(
            core::mem::size_of::<Option<Timestamp>>(),
            core::mem::size_of::<Timestamp>()
        );
    }
}
