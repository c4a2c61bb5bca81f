// Copyright the tern-quic project authors. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use crate::{recovery::INITIAL_RTT, time::Timestamp};
use core::{cmp::max, time::Duration};

/// Smoothed-RTT EWMA weight (1/8)
const ALPHA_SHIFT: u32 = 3;
/// Mean-deviation EWMA weight (1/4)
const BETA_SHIFT: u32 = 2;

/// Round trip time statistics for a connection.
///
/// `min_rtt` tracks the raw observed send delta and is never corrected for
/// the peer-reported ack delay: poor clock granularity at the peer could
/// otherwise push a large ack delay through and underestimate the floor.
#[derive(Clone, Debug)]
pub struct RttStats {
    /// The most recent RTT sample, after ack-delay correction
    latest_rtt: Duration,
    /// The minimum raw RTT observed over the lifetime of the connection
    min_rtt: Duration,
    /// An exponentially-weighted moving average of RTT samples
    smoothed_rtt: Duration,
    /// `smoothed_rtt` as it was before the most recent update
    previous_srtt: Duration,
    /// The mean deviation of RTT samples from `smoothed_rtt`
    mean_deviation: Duration,
    standard_deviation: Option<StandardDeviationCalculator>,
    initial_rtt: Duration,
    last_update_time: Option<Timestamp>,
}

impl Default for RttStats {
    fn default() -> Self {
        Self::new(INITIAL_RTT)
    }
}

impl RttStats {
    /// Creates new statistics assuming `initial_rtt` until a sample arrives
    pub fn new(initial_rtt: Duration) -> Self {
        Self {
            latest_rtt: Duration::ZERO,
            min_rtt: Duration::ZERO,
            smoothed_rtt: Duration::ZERO,
            previous_srtt: Duration::ZERO,
            mean_deviation: Duration::ZERO,
            standard_deviation: None,
            initial_rtt,
            last_update_time: None,
        }
    }

    /// Enables the optional standard deviation accumulator
    pub fn enable_standard_deviation(&mut self) {
        if self.standard_deviation.is_none() {
            self.standard_deviation = Some(StandardDeviationCalculator::default());
        }
    }

    #[inline]
    pub fn latest_rtt(&self) -> Duration {
        self.latest_rtt
    }

    #[inline]
    pub fn min_rtt(&self) -> Duration {
        self.min_rtt
    }

    #[inline]
    pub fn smoothed_rtt(&self) -> Duration {
        self.smoothed_rtt
    }

    /// The smoothed RTT prior to the most recent sample; the loss detector
    /// uses this to avoid a single spike shrinking its time threshold
    #[inline]
    pub fn previous_srtt(&self) -> Duration {
        self.previous_srtt
    }

    #[inline]
    pub fn mean_deviation(&self) -> Duration {
        self.mean_deviation
    }

    #[inline]
    pub fn initial_rtt(&self) -> Duration {
        self.initial_rtt
    }

    #[inline]
    pub fn last_update_time(&self) -> Option<Timestamp> {
        self.last_update_time
    }

    /// The smoothed RTT, or the configured initial RTT before any sample
    #[inline]
    pub fn smoothed_or_initial_rtt(&self) -> Duration {
        if self.smoothed_rtt.is_zero() {
            self.initial_rtt
        } else {
            self.smoothed_rtt
        }
    }

    /// The latest RTT, or the configured initial RTT before any sample
    #[inline]
    pub fn latest_or_initial_rtt(&self) -> Duration {
        if self.latest_rtt.is_zero() {
            self.initial_rtt
        } else {
            self.latest_rtt
        }
    }

    /// Returns true if at least one valid sample has been observed
    #[inline]
    pub fn has_first_rtt_sample(&self) -> bool {
        !self.smoothed_rtt.is_zero()
    }

    /// Updates the statistics based on a new sample.
    ///
    /// `send_delta` is the time from sending the newest acked packet to
    /// receiving its ack; `ack_delay` is the delay the peer reported in the
    /// ack frame. Returns false if the sample was rejected.
    pub fn update_rtt(&mut self, send_delta: Duration, ack_delay: Duration, now: Timestamp) -> bool {
        if send_delta.is_zero() || send_delta == Duration::MAX {
            // zero or skewed samples carry no information
            return false;
        }
        self.last_update_time = Some(now);

        if self.min_rtt.is_zero() || self.min_rtt > send_delta {
            self.min_rtt = send_delta;
        }

        let mut rtt_sample = send_delta;
        self.previous_srtt = self.smoothed_rtt;
        // Correct for ack_delay only when the corrected sample remains at
        // least as large as min_rtt; otherwise use the raw send delta.
        if rtt_sample > ack_delay && rtt_sample - self.min_rtt >= ack_delay {
            rtt_sample -= ack_delay;
        }
        self.latest_rtt = rtt_sample;

        if let Some(calculator) = &mut self.standard_deviation {
            calculator.on_new_rtt_sample(rtt_sample, self.smoothed_rtt);
        }

        if self.smoothed_rtt.is_zero() {
            self.smoothed_rtt = rtt_sample;
            self.mean_deviation = rtt_sample / 2;
        } else {
            self.mean_deviation =
                ewma(self.mean_deviation, abs_difference(self.smoothed_rtt, rtt_sample), BETA_SHIFT);
            self.smoothed_rtt = ewma(self.smoothed_rtt, rtt_sample, ALPHA_SHIFT);
        }
        true
    }

    /// Forces `smoothed_rtt` and `mean_deviation` to account for the latest
    /// sample when a timer based on them has fired
    pub fn expire_smoothed_metrics(&mut self) {
        self.mean_deviation = max(
            self.mean_deviation,
            abs_difference(self.smoothed_rtt, self.latest_rtt),
        );
        self.smoothed_rtt = max(self.smoothed_rtt, self.latest_rtt);
    }

    /// Returns the standard deviation if the accumulator is enabled and has
    /// seen enough samples, otherwise the mean deviation
    pub fn standard_or_mean_deviation(&self) -> Duration {
        match &self.standard_deviation {
            Some(calculator) if calculator.has_valid_standard_deviation => {
                calculator.standard_deviation()
            }
            _ => self.mean_deviation,
        }
    }

    /// Discards all samples, e.g. after the path changed underneath the
    /// connection
    pub fn on_connection_migration(&mut self) {
        self.latest_rtt = Duration::ZERO;
        self.min_rtt = Duration::ZERO;
        self.smoothed_rtt = Duration::ZERO;
        self.mean_deviation = Duration::ZERO;
        self.initial_rtt = INITIAL_RTT;
    }
}

/// `(1 - 2^-shift) * current + 2^-shift * sample`, on microseconds
#[inline]
fn ewma(current: Duration, sample: Duration, shift: u32) -> Duration {
    let current = current.as_micros() as u64;
    let sample = sample.as_micros() as u64;
    Duration::from_micros(current - (current >> shift) + (sample >> shift))
}

#[inline]
fn abs_difference(a: Duration, b: Duration) -> Duration {
    if a > b {
        a - b
    } else {
        b - a
    }
}

/// Welford-style variance accumulator over RTT samples
#[derive(Clone, Copy, Debug, Default)]
struct StandardDeviationCalculator {
    m2: f64,
    has_valid_standard_deviation: bool,
}

impl StandardDeviationCalculator {
    fn on_new_rtt_sample(&mut self, rtt_sample: Duration, smoothed_rtt: Duration) {
        if smoothed_rtt.is_zero() {
            return;
        }
        self.has_valid_standard_deviation = true;
        let delta = rtt_sample.as_micros() as f64 - smoothed_rtt.as_micros() as f64;
        self.m2 = 0.75 * self.m2 + 0.25 * delta * delta;
    }

    fn standard_deviation(&self) -> Duration {
        debug_assert!(self.has_valid_standard_deviation);
        Duration::from_micros(self.m2.sqrt() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::{Clock, NoopClock};

    #[test]
    fn defaults_before_any_sample() {
        let rtt_stats = RttStats::default();
        assert!(!rtt_stats.has_first_rtt_sample());
        assert_eq!(rtt_stats.smoothed_or_initial_rtt(), INITIAL_RTT);
        assert_eq!(rtt_stats.latest_or_initial_rtt(), INITIAL_RTT);
        assert_eq!(rtt_stats.min_rtt(), Duration::ZERO);
    }

    #[test]
    fn rejects_zero_and_infinite_samples() {
        let mut rtt_stats = RttStats::default();
        let now = NoopClock.get_time();
        assert!(!rtt_stats.update_rtt(Duration::ZERO, Duration::ZERO, now));
        assert!(!rtt_stats.update_rtt(Duration::MAX, Duration::ZERO, now));
        assert!(!rtt_stats.has_first_rtt_sample());
        assert_eq!(rtt_stats.last_update_time(), None);
    }

    #[test]
    fn first_sample_initializes_smoothed_metrics() {
        let mut rtt_stats = RttStats::default();
        let now = NoopClock.get_time();
        let sample = Duration::from_millis(300);
        assert!(rtt_stats.update_rtt(sample, Duration::from_millis(100), now));

        // ack_delay is not subtracted when the result would dip below min_rtt
        assert_eq!(rtt_stats.latest_rtt(), sample);
        assert_eq!(rtt_stats.min_rtt(), sample);
        assert_eq!(rtt_stats.smoothed_rtt(), sample);
        assert_eq!(rtt_stats.mean_deviation(), sample / 2);
    }

    #[test]
    fn ack_delay_correction() {
        let mut rtt_stats = RttStats::default();
        let now = NoopClock.get_time();
        rtt_stats.update_rtt(Duration::from_millis(100), Duration::ZERO, now);

        // 200ms raw with 50ms ack delay: 200 - 100 (min) >= 50, so corrected
        rtt_stats.update_rtt(Duration::from_millis(200), Duration::from_millis(50), now);
        assert_eq!(rtt_stats.latest_rtt(), Duration::from_millis(150));

        // 120ms raw with 50ms ack delay: 120 - 100 < 50, so uncorrected
        rtt_stats.update_rtt(Duration::from_millis(120), Duration::from_millis(50), now);
        assert_eq!(rtt_stats.latest_rtt(), Duration::from_millis(120));

        // min_rtt tracks the raw delta, never the corrected sample
        assert_eq!(rtt_stats.min_rtt(), Duration::from_millis(100));
    }

    #[test]
    fn smoothed_rtt_ewma() {
        let mut rtt_stats = RttStats::default();
        let now = NoopClock.get_time();
        rtt_stats.update_rtt(Duration::from_millis(100), Duration::ZERO, now);
        let prev = rtt_stats.smoothed_rtt();
        assert_eq!(rtt_stats.previous_srtt(), Duration::ZERO);

        rtt_stats.update_rtt(Duration::from_millis(300), Duration::ZERO, now);
        assert_eq!(rtt_stats.previous_srtt(), prev);
        // 7/8 * 100ms + 1/8 * 300ms = 125ms
        assert_eq!(rtt_stats.smoothed_rtt(), Duration::from_millis(125));
        // 3/4 * 50ms + 1/4 * |100 - 300|ms = 87.5ms
        assert_eq!(rtt_stats.mean_deviation(), Duration::from_micros(87_500));
    }

    /// `latest_rtt >= min_rtt` after every valid update
    #[test]
    fn latest_rtt_never_below_min_rtt() {
        bolero::check!()
            .with_type::<Vec<(u32, u32)>>()
            .for_each(|samples| {
                let mut rtt_stats = RttStats::default();
                let now = NoopClock.get_time();
                for (send_delta, ack_delay) in samples {
                    rtt_stats.update_rtt(
                        Duration::from_micros(*send_delta as u64),
                        Duration::from_micros(*ack_delay as u64),
                        now,
                    );
                    if rtt_stats.has_first_rtt_sample() {
                        assert!(rtt_stats.latest_rtt() >= rtt_stats.min_rtt());
                    }
                }
            });
    }

    #[test]
    fn expire_smoothed_metrics_catches_up_to_latest() {
        let mut rtt_stats = RttStats::default();
        let now = NoopClock.get_time();
        rtt_stats.update_rtt(Duration::from_millis(100), Duration::ZERO, now);
        rtt_stats.update_rtt(Duration::from_millis(500), Duration::ZERO, now);
        assert!(rtt_stats.smoothed_rtt() < rtt_stats.latest_rtt());

        rtt_stats.expire_smoothed_metrics();
        assert_eq!(rtt_stats.smoothed_rtt(), rtt_stats.latest_rtt());
    }

    #[test]
    fn standard_deviation() {
        let mut rtt_stats = RttStats::default();
        rtt_stats.enable_standard_deviation();
        let now = NoopClock.get_time();

        rtt_stats.update_rtt(Duration::from_millis(100), Duration::ZERO, now);
        // single sample: fall back to mean deviation
        assert_eq!(rtt_stats.standard_or_mean_deviation(), rtt_stats.mean_deviation());

        rtt_stats.update_rtt(Duration::from_millis(100), Duration::ZERO, now);
        // identical samples: no deviation
        assert_eq!(rtt_stats.standard_or_mean_deviation(), Duration::ZERO);
    }

    #[test]
    fn connection_migration_resets_samples() {
        let mut rtt_stats = RttStats::default();
        let now = NoopClock.get_time();
        rtt_stats.update_rtt(Duration::from_millis(100), Duration::ZERO, now);
        rtt_stats.on_connection_migration();
        assert!(!rtt_stats.has_first_rtt_sample());
        assert_eq!(rtt_stats.min_rtt(), Duration::ZERO);
    }
}
