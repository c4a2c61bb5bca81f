// Copyright the tern-quic project authors. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use core::time::Duration;
use num_rational::Ratio;

const MICRO_BITS_PER_BYTE: u64 = 8 * 1_000_000;

/// A data transfer rate.
///
/// Stored in bits per second so that both low-rate paths and the
/// `Bandwidth::MAX` "infinite" sentinel are representable without loss.
#[derive(Copy, Clone, Debug, Default, Eq, Ord, PartialOrd, PartialEq, Hash)]
pub struct Bandwidth {
    bits_per_second: u64,
}

impl Bandwidth {
    pub const ZERO: Bandwidth = Bandwidth { bits_per_second: 0 };

    /// Used where the original algorithms need an "infinite" rate sentinel
    pub const MAX: Bandwidth = Bandwidth {
        bits_per_second: u64::MAX,
    };

    /// Constructs a new `Bandwidth` with the given bytes per interval
    pub const fn new(bytes: u64, interval: Duration) -> Self {
        if interval.is_zero() {
            Bandwidth::ZERO
        } else {
            Self {
                // Prefer multiplying by MICRO_BITS_PER_BYTE first to avoid losing resolution
                bits_per_second: match bytes.checked_mul(MICRO_BITS_PER_BYTE) {
                    Some(micro_bits) => micro_bits / interval.as_micros() as u64,
                    None => {
                        // If that overflows, divide first by the interval
                        (bytes / interval.as_micros() as u64).saturating_mul(MICRO_BITS_PER_BYTE)
                    }
                },
            }
        }
    }

    pub const fn from_bits_per_second(bits_per_second: u64) -> Self {
        Self { bits_per_second }
    }

    pub const fn from_kbits_per_second(kbits_per_second: u64) -> Self {
        Self {
            bits_per_second: kbits_per_second * 1000,
        }
    }

    #[inline]
    pub const fn as_bits_per_second(self) -> u64 {
        self.bits_per_second
    }

    #[inline]
    pub const fn as_bytes_per_second(self) -> u64 {
        self.bits_per_second / 8
    }

    #[inline]
    pub const fn is_zero(self) -> bool {
        self.bits_per_second == 0
    }

    /// The time this rate needs to move `bytes` across the path
    #[inline]
    pub fn transfer_time(self, bytes: u64) -> Duration {
        if self.is_zero() {
            return Duration::ZERO;
        }
        bytes / self
    }

    #[inline]
    pub fn saturating_sub(self, rhs: Bandwidth) -> Bandwidth {
        Bandwidth {
            bits_per_second: self.bits_per_second.saturating_sub(rhs.bits_per_second),
        }
    }
}

impl core::ops::Mul<Ratio<u64>> for Bandwidth {
    type Output = Bandwidth;

    #[inline]
    fn mul(self, rhs: Ratio<u64>) -> Self::Output {
        Bandwidth {
            bits_per_second: (rhs * self.bits_per_second).to_integer(),
        }
    }
}

impl core::ops::Mul<Duration> for Bandwidth {
    type Output = u64;

    /// The number of bytes this rate delivers over `rhs`
    #[inline]
    fn mul(self, rhs: Duration) -> Self::Output {
        // Prefer multiplying by the duration first to avoid losing resolution
        match self.bits_per_second.checked_mul(rhs.as_micros() as u64) {
            Some(micro_bits) => micro_bits / MICRO_BITS_PER_BYTE,
            None => {
                // If that overflows, divide first by MICRO_BITS_PER_BYTE
                (self.bits_per_second / MICRO_BITS_PER_BYTE).saturating_mul(rhs.as_micros() as u64)
            }
        }
    }
}

/// Divides a count of bytes by the given `Bandwidth`, producing the
/// `Duration` a path with this rate would take to transmit them.
impl core::ops::Div<Bandwidth> for u64 {
    type Output = Duration;

    #[inline]
    fn div(self, rhs: Bandwidth) -> Self::Output {
        debug_assert!(!rhs.is_zero());
        match self.checked_mul(MICRO_BITS_PER_BYTE) {
            Some(micro_bits) => Duration::from_micros(micro_bits / rhs.bits_per_second),
            None => Duration::from_micros(
                (self / rhs.bits_per_second).saturating_mul(MICRO_BITS_PER_BYTE),
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_bytes_and_interval() {
        let bandwidth = Bandwidth::new(1250, Duration::from_millis(1));
        assert_eq!(bandwidth.as_bits_per_second(), 10_000_000);
        assert_eq!(bandwidth.as_bytes_per_second(), 1_250_000);
        assert_eq!(Bandwidth::new(100, Duration::ZERO), Bandwidth::ZERO);
    }

    #[test]
    fn delivered_bytes_over_duration() {
        let bandwidth = Bandwidth::new(1000, Duration::from_secs(1));
        assert_eq!(bandwidth * Duration::from_secs(2), 2000);
        assert_eq!(bandwidth * Duration::from_millis(500), 500);
    }

    #[test]
    fn transfer_time() {
        // 10 Mbps moves one 1250-byte packet per millisecond
        let bandwidth = Bandwidth::from_kbits_per_second(10_000);
        assert_eq!(bandwidth.transfer_time(1250), Duration::from_millis(1));
        assert_eq!(1250 / bandwidth, Duration::from_millis(1));
    }

    #[test]
    fn gain_multiplication() {
        let bandwidth = Bandwidth::from_bits_per_second(1_000_000);
        let gained = bandwidth * Ratio::new(5u64, 4);
        assert_eq!(gained.as_bits_per_second(), 1_250_000);
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn round_trip_resolution() {
        bolero::check!()
            .with_type::<(u32, u32)>()
            .for_each(|(bytes, interval_us)| {
                let interval = Duration::from_micros(*interval_us as u64 + 1);
                let bandwidth = Bandwidth::new(*bytes as u64, interval);
                // converting back through the interval loses at most one byte
                // per microsecond of interval
                let delivered = bandwidth * interval;
                assert!(delivered <= *bytes as u64);
            });
    }
}
