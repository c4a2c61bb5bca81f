// Copyright the tern-quic project authors. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! TCP-CUBIC congestion control in bytes.
//!
//! The window calculator emulates an ensemble of N Reno connections: on
//! loss the window backs off by `Beta`, and on ack the larger of the cubic
//! target `C*(t-K)^3 + W_max` and the Reno-friendly linear estimate wins.
//! Application-limited periods reset the epoch so quiescence does not
//! artificially accelerate cubic growth.

use crate::{
    packet::number::PacketNumber,
    recovery::{bandwidth::Bandwidth, rtt::RttStats, AckedPacket, LostPacket, MAX_SEGMENT_SIZE},
    time::Timestamp,
};
use core::time::Duration;
use num_rational::Ratio;

const MSS: u64 = MAX_SEGMENT_SIZE as u64;

/// Emulated Reno connection count
const DEFAULT_NUM_CONNECTIONS: u64 = 2;

// The cubic constants are expressed in 2^10 fractions of a second instead
// of ms to allow a 10-bit shift to divide.
const CUBE_SCALE: u32 = 40; // 1024*1024^3 (first 1024 from 0.100^3) where
                            // 0.100 is the 100 ms scaling round trip time
const CUBE_CONGESTION_WINDOW_SCALE: u64 = 410;
const CUBE_FACTOR: u64 = (1u64 << CUBE_SCALE) / CUBE_CONGESTION_WINDOW_SCALE / MSS;

const MICROS_PER_SECOND: u64 = 1_000_000;

/// Burst allowance above which the sender counts as cwnd limited
const MAX_BURST_BYTES: u64 = 3 * MSS;

/// The core CUBIC window calculation
#[derive(Clone, Debug)]
pub struct CubicBytes {
    num_connections: u64,
    epoch: Option<Timestamp>,
    /// Window size before the last loss event
    last_max_congestion_window: u64,
    acked_bytes_count: u64,
    estimated_tcp_congestion_window: u64,
    origin_point_congestion_window: u64,
    /// `K` in 2^10 fractions of a second
    time_to_origin_point: u64,
    last_target_congestion_window: u64,
}

impl Default for CubicBytes {
    fn default() -> Self {
        let mut cubic = CubicBytes {
            num_connections: DEFAULT_NUM_CONNECTIONS,
            epoch: None,
            last_max_congestion_window: 0,
            acked_bytes_count: 0,
            estimated_tcp_congestion_window: 0,
            origin_point_congestion_window: 0,
            time_to_origin_point: 0,
            last_target_congestion_window: 0,
        };
        cubic.reset_cubic_state();
        cubic
    }
}

impl CubicBytes {
    pub fn set_num_connections(&mut self, num_connections: u64) {
        debug_assert!(num_connections > 0);
        self.num_connections = num_connections.max(1);
    }

    /// Backoff factor after loss for the N-connection emulation
    fn beta(&self) -> Ratio<u64> {
        // (n - 1 + 0.7) / n
        let n = self.num_connections;
        Ratio::new(10 * n - 3, 10 * n)
    }

    /// Additional backoff when loss occurs before the prior max is
    /// re-reached, conceding bandwidth to competing flows
    fn beta_last_max(&self) -> Ratio<u64> {
        // (n - 1 + 0.85) / n
        let n = self.num_connections;
        Ratio::new(20 * n - 3, 20 * n)
    }

    /// TCP-friendly additive increase factor for the N-connection emulation
    fn alpha(&self) -> Ratio<u64> {
        // 3n(1 - beta) / (1 + beta), simplified for beta = (10n - 3) / 10n
        let n = self.num_connections;
        Ratio::new(9 * n * n, 20 * n - 3)
    }

    pub fn reset_cubic_state(&mut self) {
        self.epoch = None;
        self.last_max_congestion_window = 0;
        self.acked_bytes_count = 0;
        self.estimated_tcp_congestion_window = 0;
        self.origin_point_congestion_window = 0;
        self.time_to_origin_point = 0;
        self.last_target_congestion_window = 0;
    }

    /// Cubic assumes the sender used the whole window since the epoch
    /// began; an application-limited period breaks that, so the epoch is
    /// reset, freezing growth until the window fills again.
    pub fn on_application_limited(&mut self) {
        self.epoch = None;
    }

    pub fn congestion_window_after_packet_loss(&mut self, current_congestion_window: u64) -> u64 {
        // A bytes-mode Reno estimate slightly undershoots, so the old max
        // may be missed by less than one segment without competing traffic
        // being the cause.
        if current_congestion_window + MSS < self.last_max_congestion_window {
            // The old max was never reached: assume a competing flow and
            // back off further to let it grow.
            self.last_max_congestion_window =
                (self.beta_last_max() * current_congestion_window).to_integer();
        } else {
            self.last_max_congestion_window = current_congestion_window;
        }
        self.epoch = None;
        (self.beta() * current_congestion_window).to_integer()
    }

    pub fn congestion_window_after_ack(
        &mut self,
        acked_bytes: u64,
        current_congestion_window: u64,
        delay_min: Duration,
        event_time: Timestamp,
    ) -> u64 {
        self.acked_bytes_count += acked_bytes;

        let epoch = match self.epoch {
            Some(epoch) => epoch,
            None => {
                // First ack after a loss event: start a new epoch.
                self.acked_bytes_count = acked_bytes;
                self.estimated_tcp_congestion_window = current_congestion_window;
                if self.last_max_congestion_window <= current_congestion_window {
                    self.time_to_origin_point = 0;
                    self.origin_point_congestion_window = current_congestion_window;
                } else {
                    self.time_to_origin_point = cube_root(
                        CUBE_FACTOR
                            * (self.last_max_congestion_window - current_congestion_window),
                    );
                    self.origin_point_congestion_window = self.last_max_congestion_window;
                }
                self.epoch = Some(event_time);
                event_time
            }
        };

        // Elapsed time in 2^10 fractions of a second, measured to the
        // projected arrival of the ack one min-RTT out.
        let elapsed_time =
            (((event_time + delay_min - epoch).as_micros() as u64) << 10) / MICROS_PER_SECOND;

        // The offset is forced positive, as the kernel does, since shifting
        // negative values is implementation-defined.
        let offset = self.time_to_origin_point.abs_diff(elapsed_time);
        let delta_congestion_window = ((CUBE_CONGESTION_WINDOW_SCALE as u128
            * offset as u128
            * offset as u128
            * offset as u128
            * MSS as u128)
            >> CUBE_SCALE) as u64;

        let add_delta = elapsed_time > self.time_to_origin_point;
        debug_assert!(add_delta || self.origin_point_congestion_window > delta_congestion_window);
        let target_congestion_window = if add_delta {
            self.origin_point_congestion_window + delta_congestion_window
        } else {
            self.origin_point_congestion_window - delta_congestion_window
        };
        // Limit the cwnd increase to half the acked bytes.
        let mut target_congestion_window =
            target_congestion_window.min(current_congestion_window + self.acked_bytes_count / 2);

        debug_assert!(self.estimated_tcp_congestion_window > 0);
        // Grow the Reno estimate by Alpha * MSS per estimated window of
        // acked bytes. For windows under ~25 segments this is slightly
        // slower than linear per window of bytes.
        self.estimated_tcp_congestion_window += (self.alpha() * (self.acked_bytes_count * MSS))
            .to_integer()
            / self.estimated_tcp_congestion_window;
        self.acked_bytes_count = 0;

        self.last_target_congestion_window = target_congestion_window;

        // The faster of the cubic target and the Reno estimate wins.
        if target_congestion_window < self.estimated_tcp_congestion_window {
            target_congestion_window = self.estimated_tcp_congestion_window;
        }
        target_congestion_window
    }
}

/// Integer cube root, rounding down
fn cube_root(value: u64) -> u64 {
    let mut root = (value as f64).cbrt() as u64;
    while root.checked_pow(3).map_or(true, |cubed| cubed > value) {
        root -= 1;
    }
    while (root + 1).checked_pow(3).is_some_and(|cubed| cubed <= value) {
        root += 1;
    }
    root
}

/// Cubic-bytes congestion controller state around the window calculator
#[derive(Clone, Debug)]
pub struct CubicSender {
    cubic: CubicBytes,
    largest_sent_packet_number: Option<PacketNumber>,
    largest_acked_packet_number: Option<PacketNumber>,
    /// No further backoff happens for losses at or below this number
    largest_sent_at_last_cutback: Option<PacketNumber>,
    congestion_window: u64,
    min_congestion_window: u64,
    max_congestion_window: u64,
    slowstart_threshold: u64,
    /// Smoothed RTT cached from the latest congestion event, for pacing
    cached_smoothed_rtt: Duration,
}

impl CubicSender {
    pub fn new(
        rtt_stats: &RttStats,
        initial_cwnd_in_packets: u64,
        max_cwnd_in_packets: u64,
    ) -> Self {
        Self {
            cubic: CubicBytes::default(),
            largest_sent_packet_number: None,
            largest_acked_packet_number: None,
            largest_sent_at_last_cutback: None,
            congestion_window: initial_cwnd_in_packets * MSS,
            min_congestion_window: 2 * MSS,
            max_congestion_window: max_cwnd_in_packets * MSS,
            slowstart_threshold: max_cwnd_in_packets * MSS,
            cached_smoothed_rtt: rtt_stats.smoothed_or_initial_rtt(),
        }
    }

    #[inline]
    pub fn congestion_window(&self) -> u64 {
        self.congestion_window
    }

    #[inline]
    pub fn slowstart_threshold(&self) -> u64 {
        self.slowstart_threshold
    }

    #[inline]
    pub fn in_slow_start(&self) -> bool {
        self.congestion_window < self.slowstart_threshold
    }

    #[inline]
    pub fn in_recovery(&self) -> bool {
        match (self.largest_acked_packet_number, self.largest_sent_at_last_cutback) {
            (Some(largest_acked), Some(last_cutback)) => largest_acked <= last_cutback,
            _ => false,
        }
    }

    #[inline]
    pub fn can_send(&self, bytes_in_flight: u64) -> bool {
        bytes_in_flight < self.congestion_window
    }

    pub fn bandwidth_estimate(&self) -> Bandwidth {
        if self.cached_smoothed_rtt.is_zero() {
            return Bandwidth::ZERO;
        }
        Bandwidth::new(self.congestion_window, self.cached_smoothed_rtt)
    }

    pub fn pacing_rate(&self, _bytes_in_flight: u64) -> Bandwidth {
        // Pace at 200% of the rate in slow start so acks do not limit
        // growth, and 125% afterwards to recover from under-utilization.
        let gain = if self.in_slow_start() {
            Ratio::new_raw(2, 1)
        } else {
            Ratio::new_raw(5, 4)
        };
        self.bandwidth_estimate() * gain
    }

    pub fn on_packet_sent(
        &mut self,
        _sent_time: Timestamp,
        _bytes_in_flight: u64,
        packet_number: PacketNumber,
        _bytes: u64,
        has_retransmittable_data: bool,
    ) {
        if !has_retransmittable_data {
            return;
        }
        debug_assert!(self
            .largest_sent_packet_number
            .map_or(true, |largest| largest < packet_number));
        self.largest_sent_packet_number = Some(packet_number);
    }

    pub fn on_congestion_event(
        &mut self,
        _rtt_updated: bool,
        prior_in_flight: u64,
        event_time: Timestamp,
        acked_packets: &[AckedPacket],
        lost_packets: &[LostPacket],
        rtt_stats: &RttStats,
    ) {
        self.cached_smoothed_rtt = rtt_stats.smoothed_or_initial_rtt();

        // Losses first, so the cutback state is current when acks grow the
        // window.
        for lost in lost_packets {
            self.on_packet_lost(lost.packet_number);
        }
        for acked in acked_packets {
            self.largest_acked_packet_number = Some(
                self.largest_acked_packet_number
                    .map_or(acked.packet_number, |largest| largest.max(acked.packet_number)),
            );
            self.maybe_increase_congestion_window(
                acked.bytes_acked,
                prior_in_flight,
                event_time,
                rtt_stats.min_rtt(),
            );
        }
    }

    fn on_packet_lost(&mut self, packet_number: PacketNumber) {
        // Only react once per congestion window of loss.
        if self
            .largest_sent_at_last_cutback
            .is_some_and(|last_cutback| packet_number <= last_cutback)
        {
            return;
        }

        self.congestion_window = self
            .cubic
            .congestion_window_after_packet_loss(self.congestion_window)
            .max(self.min_congestion_window);
        self.slowstart_threshold = self.congestion_window;
        self.largest_sent_at_last_cutback = self.largest_sent_packet_number;
    }

    fn maybe_increase_congestion_window(
        &mut self,
        acked_bytes: u64,
        prior_in_flight: u64,
        event_time: Timestamp,
        min_rtt: Duration,
    ) {
        if !self.is_cwnd_limited(prior_in_flight) {
            // The window is not the bottleneck; freeze cubic growth.
            self.cubic.on_application_limited();
            return;
        }
        if self.congestion_window >= self.max_congestion_window {
            return;
        }
        if self.in_slow_start() {
            self.congestion_window += MSS;
            return;
        }
        self.congestion_window = self
            .cubic
            .congestion_window_after_ack(acked_bytes, self.congestion_window, min_rtt, event_time)
            .min(self.max_congestion_window);
    }

    fn is_cwnd_limited(&self, bytes_in_flight: u64) -> bool {
        if bytes_in_flight >= self.congestion_window {
            return true;
        }
        let available_bytes = self.congestion_window - bytes_in_flight;
        let slow_start_limited = self.in_slow_start() && bytes_in_flight > self.congestion_window / 2;
        slow_start_limited || available_bytes <= MAX_BURST_BYTES
    }

    pub fn on_retransmission_timeout(&mut self, packets_retransmitted: bool) {
        self.largest_sent_at_last_cutback = None;
        if !packets_retransmitted {
            return;
        }
        self.cubic.reset_cubic_state();
        self.slowstart_threshold = self.congestion_window / 2;
        self.congestion_window = self.min_congestion_window;
    }

    pub fn on_application_limited(&mut self, _bytes_in_flight: u64) {
        self.cubic.on_application_limited();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::{Clock, NoopClock};

    fn packet_number(value: u64) -> PacketNumber {
        PacketNumber::new(value).unwrap()
    }

    fn acked(value: u64, bytes: u64) -> AckedPacket {
        AckedPacket {
            packet_number: packet_number(value),
            bytes_acked: bytes,
            receive_timestamp: None,
        }
    }

    fn lost(value: u64, bytes: u64) -> LostPacket {
        LostPacket {
            packet_number: packet_number(value),
            bytes_lost: bytes,
        }
    }

    fn rtt_stats() -> RttStats {
        let mut rtt_stats = RttStats::default();
        rtt_stats.update_rtt(Duration::from_millis(100), Duration::ZERO, NoopClock.get_time());
        rtt_stats
    }

    #[test]
    fn cube_root_values() {
        assert_eq!(cube_root(0), 0);
        assert_eq!(cube_root(1), 1);
        assert_eq!(cube_root(26), 2);
        assert_eq!(cube_root(27), 3);
        assert_eq!(cube_root(1_000_000), 100);
    }

    #[test]
    fn slow_start_grows_one_segment_per_acked_packet() {
        let mut sender = CubicSender::new(&rtt_stats(), 10, 2000);
        let now = NoopClock.get_time();
        let rtt_stats = rtt_stats();
        assert!(sender.in_slow_start());

        let prior_cwnd = sender.congestion_window();
        for i in 1..=10u64 {
            sender.on_packet_sent(now, (i - 1) * MSS, packet_number(i), MSS, true);
        }
        // the window is nearly full, so acks grow it
        sender.on_congestion_event(
            true,
            10 * MSS,
            now + Duration::from_millis(100),
            &[acked(1, MSS), acked(2, MSS)],
            &[],
            &rtt_stats,
        );
        assert_eq!(sender.congestion_window(), prior_cwnd + 2 * MSS);
    }

    #[test]
    fn loss_backs_off_by_beta() {
        let mut sender = CubicSender::new(&rtt_stats(), 100, 2000);
        let now = NoopClock.get_time();
        let rtt_stats = rtt_stats();
        for i in 1..=100u64 {
            sender.on_packet_sent(now, (i - 1) * MSS, packet_number(i), MSS, true);
        }

        let prior_cwnd = sender.congestion_window();
        sender.on_congestion_event(
            false,
            100 * MSS,
            now + Duration::from_millis(100),
            &[],
            &[lost(1, MSS)],
            &rtt_stats,
        );

        // two-connection emulation: beta = 17/20 = 0.85
        assert_eq!(sender.congestion_window(), prior_cwnd * 17 / 20);
        assert!(!sender.in_slow_start());
        assert!(sender.in_recovery());

        // losses within the same window cause no further backoff
        let cwnd_after_first_loss = sender.congestion_window();
        sender.on_congestion_event(
            false,
            100 * MSS,
            now + Duration::from_millis(110),
            &[],
            &[lost(2, MSS)],
            &rtt_stats,
        );
        assert_eq!(sender.congestion_window(), cwnd_after_first_loss);
    }

    #[test]
    fn recovery_ends_when_cutback_packet_is_acked() {
        let mut sender = CubicSender::new(&rtt_stats(), 100, 2000);
        let now = NoopClock.get_time();
        let rtt_stats = rtt_stats();
        for i in 1..=10u64 {
            sender.on_packet_sent(now, (i - 1) * MSS, packet_number(i), MSS, true);
        }
        sender.on_congestion_event(false, 10 * MSS, now, &[], &[lost(1, MSS)], &rtt_stats);
        assert!(sender.in_recovery());

        // acking past the cutback point (packet 10) exits recovery
        sender.on_congestion_event(true, 9 * MSS, now, &[acked(10, MSS)], &[], &rtt_stats);
        sender.on_packet_sent(now, 0, packet_number(11), MSS, true);
        sender.on_congestion_event(true, MSS, now, &[acked(11, MSS)], &[], &rtt_stats);
        assert!(!sender.in_recovery());
    }

    #[test]
    fn app_limited_resets_cubic_epoch() {
        let mut cubic = CubicBytes::default();
        let now = NoopClock.get_time();
        let cwnd = 100 * MSS;

        // seed an epoch
        cubic.congestion_window_after_ack(MSS, cwnd, Duration::from_millis(100), now);
        assert!(cubic.epoch.is_some());

        cubic.on_application_limited();
        assert!(cubic.epoch.is_none());
    }

    #[test]
    fn cubic_target_reaches_origin_after_loss() {
        let mut cubic = CubicBytes::default();
        let now = NoopClock.get_time();
        let cwnd = 100 * MSS;

        let reduced = cubic.congestion_window_after_packet_loss(cwnd);
        assert_eq!(reduced, cwnd * 17 / 20);

        // Well past K the cubic target exceeds the pre-loss max. Feed a
        // stream of acks so the acked-bytes cap does not bind.
        let mut window = reduced;
        let mut time = now;
        for _ in 0..100 {
            time = time + Duration::from_millis(100);
            window = cubic.congestion_window_after_ack(
                10 * MSS,
                window,
                Duration::from_millis(100),
                time,
            );
        }
        assert!(window > cwnd);
    }

    #[test]
    fn retransmission_timeout_collapses_window() {
        let mut sender = CubicSender::new(&rtt_stats(), 100, 2000);
        let prior_cwnd = sender.congestion_window();
        sender.on_retransmission_timeout(true);
        assert_eq!(sender.congestion_window(), sender.min_congestion_window);
        assert_eq!(sender.slowstart_threshold(), prior_cwnd / 2);
        assert!(!sender.in_recovery());
    }

    #[test]
    fn pacing_gain_depends_on_slow_start() {
        let sender = CubicSender::new(&rtt_stats(), 100, 2000);
        assert!(sender.in_slow_start());
        let bandwidth = sender.bandwidth_estimate();
        assert_eq!(sender.pacing_rate(0), bandwidth * Ratio::new_raw(2, 1));
    }
}
