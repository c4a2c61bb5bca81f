// Copyright the tern-quic project authors. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Packet + time threshold loss detection with adaptive reordering
//! tolerance.
//!
//! A packet is declared lost when a packet sent sufficiently later is
//! acknowledged (packet threshold), or when it has been outstanding for a
//! fraction of an RTT longer than the ack that should have covered it (time
//! threshold). When a loss later proves spurious the thresholds widen so
//! the same reordering pattern no longer triggers.

use crate::{
    packet::number::{PacketNumber, PacketNumberSpace},
    recovery::{rtt::RttStats, unacked::UnackedPacketMap, AckedPacket, LostPacket, GRANULARITY},
    time::Timestamp,
};
use core::{cmp::max, time::Duration};

/// Defaults match production behavior; the IETF shift of 3 yields the
/// "eighth-RTT" time threshold.
#[derive(Clone, Copy, Debug)]
pub struct Params {
    /// Packets of sequence-number reordering tolerated before a loss
    pub reordering_threshold: u64,
    /// Time threshold is `max_rtt + (max_rtt >> reordering_shift)`
    pub reordering_shift: u32,
    /// Widen `reordering_threshold` after a spurious loss
    pub use_adaptive_reordering_threshold: bool,
    /// Coarsen `reordering_shift` after a spurious loss
    pub use_adaptive_time_threshold: bool,
    /// Apply the packet threshold even when the acked packet is a runt
    /// (smaller than the candidate it would declare lost)
    pub use_packet_threshold_for_runt_packets: bool,
}

impl Default for Params {
    fn default() -> Self {
        Self {
            reordering_threshold: 3,
            reordering_shift: 2,
            use_adaptive_reordering_threshold: true,
            use_adaptive_time_threshold: false,
            use_packet_threshold_for_runt_packets: true,
        }
    }
}

impl Params {
    /// The configuration used when each encryption level runs its own
    /// packet number space
    pub fn eighth_rtt() -> Self {
        Self {
            reordering_shift: 3,
            ..Default::default()
        }
    }
}

/// Diagnostics accumulated per detection pass
#[derive(Clone, Copy, Debug, Default)]
pub struct DetectionStats {
    /// Largest `largest_newly_acked - packet_number` gap observed
    pub sent_packets_max_sequence_reordering: u64,
    /// Packets that survived the time threshold by less than half of the
    /// current margin
    pub sent_packets_num_borderline_time_reorderings: u64,
    /// Sum over lost packets of (detection delay / max RTT)
    pub total_loss_detection_response_time: f64,
}

#[derive(Clone, Debug)]
pub struct LossDetector {
    packet_number_space: PacketNumberSpace,
    reordering_threshold: u64,
    reordering_shift: u32,
    params: Params,
    loss_detection_timeout: Option<Timestamp>,
    /// Lowest in-flight packet; packets below it need no rescan
    least_in_flight: Option<PacketNumber>,
}

impl LossDetector {
    pub fn new(packet_number_space: PacketNumberSpace, params: Params) -> Self {
        Self {
            packet_number_space,
            reordering_threshold: params.reordering_threshold,
            reordering_shift: params.reordering_shift,
            params,
            loss_detection_timeout: None,
            least_in_flight: None,
        }
    }

    /// The deadline at which `detect_losses` must run again, if any packet
    /// is waiting on the time threshold
    #[inline]
    pub fn loss_detection_timeout(&self) -> Option<Timestamp> {
        self.loss_detection_timeout
    }

    #[inline]
    pub fn reordering_threshold(&self) -> u64 {
        self.reordering_threshold
    }

    #[inline]
    pub fn reordering_shift(&self) -> u32 {
        self.reordering_shift
    }

    pub fn reset(&mut self) {
        self.loss_detection_timeout = None;
        self.least_in_flight = None;
    }

    /// Scans in-flight packets up to `largest_newly_acked` and appends
    /// detected losses to `packets_lost` in ascending order
    pub fn detect_losses(
        &mut self,
        unacked_packets: &UnackedPacketMap,
        time: Timestamp,
        rtt_stats: &RttStats,
        largest_newly_acked: PacketNumber,
        packets_acked: &[AckedPacket],
        packets_lost: &mut Vec<LostPacket>,
    ) -> DetectionStats {
        let mut detection_stats = DetectionStats::default();

        self.loss_detection_timeout = None;
        if let (Some(first_acked), Some(least_in_flight)) =
            (packets_acked.first(), self.least_in_flight)
        {
            if first_acked.packet_number == least_in_flight {
                let contiguous_run_end =
                    least_in_flight.as_u64() + packets_acked.len() as u64 - 1;
                if packets_acked.last().map(|acked| acked.packet_number)
                    == Some(largest_newly_acked)
                    && contiguous_run_end == largest_newly_acked.as_u64()
                {
                    // No packet is missing: nothing below largest_newly_acked
                    // is still in flight. packets_acked can mix packet number
                    // spaces, so this only applies when largest_newly_acked
                    // closes the run.
                    self.least_in_flight = Some(largest_newly_acked.next());
                    return detection_stats;
                }
                // A hole exists; advance past the acked prefix.
                let mut cursor = least_in_flight;
                for acked in packets_acked {
                    if acked.packet_number != cursor {
                        break;
                    }
                    cursor = cursor.next();
                }
                self.least_in_flight = Some(cursor);
            }
        }

        let max_rtt = max(
            GRANULARITY,
            max(rtt_stats.previous_srtt(), rtt_stats.latest_rtt()),
        );

        let mut start = unacked_packets.get_least_unacked();
        if let Some(least_in_flight) = self.least_in_flight {
            if least_in_flight >= start {
                let past_end = unacked_packets
                    .largest_sent_packet()
                    .map_or(true, |largest| least_in_flight > largest.next());
                debug_assert!(!past_end, "least_in_flight is beyond largest_sent_packet + 1");
                if !past_end {
                    start = least_in_flight;
                }
            }
        }
        self.least_in_flight = None;

        let largest_newly_acked_bytes = unacked_packets
            .get_transmission_info(largest_newly_acked)
            .map(|info| info.bytes_sent)
            .unwrap_or(0);

        let mut packet_number = start;
        while packet_number <= largest_newly_acked {
            let Some(info) = unacked_packets.get_transmission_info(packet_number) else {
                break;
            };

            if unacked_packets.packet_number_space(info.encryption_level)
                != self.packet_number_space
            {
                // Skip packets of a different packet number space.
                packet_number = packet_number.next();
                continue;
            }

            if !info.in_flight {
                packet_number = packet_number.next();
                continue;
            }

            let reordering = largest_newly_acked
                .checked_distance(packet_number)
                .unwrap_or(0);
            if reordering > detection_stats.sent_packets_max_sequence_reordering {
                detection_stats.sent_packets_max_sequence_reordering = reordering;
            }

            // Skip packet threshold loss detection if largest_newly_acked is
            // a runt.
            let skip_packet_threshold_detection = !self.params.use_packet_threshold_for_runt_packets
                && info.bytes_sent > largest_newly_acked_bytes;
            if !skip_packet_threshold_detection && reordering >= self.reordering_threshold {
                packets_lost.push(LostPacket {
                    packet_number,
                    bytes_lost: u64::from(info.bytes_sent),
                });
                detection_stats.total_loss_detection_response_time +=
                    detection_response_time(max_rtt, info.sent_time, time);
                packet_number = packet_number.next();
                continue;
            }

            // Time threshold loss detection.
            let loss_delay = max_rtt + shift_right(max_rtt, self.reordering_shift);
            let when_lost = info.sent_time + loss_delay;
            if time < when_lost {
                let borderline_delay =
                    max_rtt + shift_right(max_rtt, self.reordering_shift + 1);
                if time >= info.sent_time + borderline_delay {
                    detection_stats.sent_packets_num_borderline_time_reorderings += 1;
                }
                self.loss_detection_timeout = Some(when_lost);
                // packet_number is in flight and not detected as lost
                self.least_in_flight = Some(packet_number);
                break;
            }
            packets_lost.push(LostPacket {
                packet_number,
                bytes_lost: u64::from(info.bytes_sent),
            });
            detection_stats.total_loss_detection_response_time +=
                detection_response_time(max_rtt, info.sent_time, time);
            packet_number = packet_number.next();
        }

        if self.least_in_flight.is_none() {
            // There is no in flight packet.
            self.least_in_flight = Some(largest_newly_acked.next());
        }

        detection_stats
    }

    /// Called when a packet previously declared lost is acknowledged.
    /// Widens the thresholds so the observed reordering would no longer be
    /// declared a loss.
    pub fn spurious_loss_detected(
        &mut self,
        unacked_packets: &UnackedPacketMap,
        rtt_stats: &RttStats,
        ack_receive_time: Timestamp,
        packet_number: PacketNumber,
        previous_largest_acked: PacketNumber,
    ) {
        if self.params.use_adaptive_time_threshold && self.reordering_shift > 0 {
            // Increase the reordering fraction so the packet would not have
            // been declared lost.
            if let Some(info) = unacked_packets.get_transmission_info(packet_number) {
                let time_needed = ack_receive_time - info.sent_time;
                let max_rtt = max(rtt_stats.previous_srtt(), rtt_stats.latest_rtt());
                while self.reordering_shift > 0
                    && max_rtt + shift_right(max_rtt, self.reordering_shift) < time_needed
                {
                    self.reordering_shift -= 1;
                }
            }
        }

        if self.params.use_adaptive_reordering_threshold {
            debug_assert!(packet_number < previous_largest_acked);
            // Increase reordering_threshold so packet_number would not have
            // been declared lost.
            if let Some(gap) = previous_largest_acked.checked_distance(packet_number) {
                self.reordering_threshold = max(self.reordering_threshold, gap + 1);
            }
        }
    }
}

/// How quickly the loss was detected, in units of max RTT
fn detection_response_time(rtt: Duration, send_time: Timestamp, detection_time: Timestamp) -> f64 {
    if detection_time <= send_time || rtt.is_zero() {
        // Time skewed; assume a detection exactly one RTT after the send.
        return 1.0;
    }
    let send_to_detection = detection_time - send_time;
    send_to_detection.as_micros() as f64 / rtt.as_micros() as f64
}

#[inline]
fn shift_right(duration: Duration, shift: u32) -> Duration {
    Duration::from_micros((duration.as_micros() as u64) >> shift)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        endpoint,
        packet::EncryptionLevel,
        recovery::unacked::SentPacket,
        time::{Clock, NoopClock, Timestamp},
        transmission::TransmissionType,
    };

    fn packet_number(value: u64) -> PacketNumber {
        PacketNumber::new(value).unwrap()
    }

    fn acked(value: u64) -> AckedPacket {
        AckedPacket {
            packet_number: packet_number(value),
            bytes_acked: 1200,
            receive_timestamp: None,
        }
    }

    fn send_packets(map: &mut UnackedPacketMap, range: core::ops::RangeInclusive<u64>, time: Timestamp) {
        for value in range {
            let mut packet = SentPacket {
                packet_number: packet_number(value),
                encryption_level: EncryptionLevel::OneRtt,
                transmission_type: TransmissionType::NotRetransmission,
                encrypted_length: 1200,
                has_crypto_handshake: false,
                has_ack_frequency: false,
                largest_acked: None,
                retransmittable_frames: vec![],
            };
            map.add_sent_packet(&mut packet, time, true, true, Default::default())
                .unwrap();
        }
    }

    fn rtt_with(min: Duration, latest: Duration) -> RttStats {
        let mut rtt_stats = RttStats::default();
        let now = NoopClock.get_time();
        rtt_stats.update_rtt(min, Duration::ZERO, now);
        rtt_stats.update_rtt(latest, Duration::ZERO, now);
        rtt_stats
    }

    fn on_ack(map: &mut UnackedPacketMap, packets: &[AckedPacket]) {
        for packet in packets {
            map.on_packet_acked(packet.packet_number);
        }
        map.increase_largest_acked(packets.last().unwrap().packet_number);
    }

    #[test]
    fn packet_threshold_detects_loss() {
        let start = NoopClock.get_time();
        let mut map = UnackedPacketMap::new(endpoint::Type::Client);
        send_packets(&mut map, 1..=10, start);

        let mut detector =
            LossDetector::new(PacketNumberSpace::ApplicationData, Params::default());
        let rtt_stats = rtt_with(Duration::from_millis(100), Duration::from_millis(120));

        let ack_time = start + Duration::from_millis(120);
        let packets_acked = [acked(5)];
        on_ack(&mut map, &packets_acked);

        let mut packets_lost = Vec::new();
        let stats = detector.detect_losses(
            &map,
            ack_time,
            &rtt_stats,
            packet_number(5),
            &packets_acked,
            &mut packets_lost,
        );

        // packets 1 and 2 trip the packet threshold; 3 and 4 wait on the
        // time threshold
        let lost: Vec<_> = packets_lost.iter().map(|p| p.packet_number.as_u64()).collect();
        assert_eq!(lost, [1, 2]);
        assert_eq!(stats.sent_packets_max_sequence_reordering, 4);
        // loss_delay = 120ms + 30ms; timer armed at send + 150ms
        assert_eq!(
            detector.loss_detection_timeout(),
            Some(start + Duration::from_millis(150))
        );
    }

    #[test]
    fn time_threshold_fires_after_loss_delay() {
        let start = NoopClock.get_time();
        let mut map = UnackedPacketMap::new(endpoint::Type::Client);
        send_packets(&mut map, 1..=2, start);

        let mut detector =
            LossDetector::new(PacketNumberSpace::ApplicationData, Params::default());
        let rtt_stats = rtt_with(Duration::from_millis(100), Duration::from_millis(100));

        let packets_acked = [acked(2)];
        on_ack(&mut map, &packets_acked);

        // before the time threshold: no loss, timer armed
        let mut packets_lost = Vec::new();
        detector.detect_losses(
            &map,
            start + Duration::from_millis(110),
            &rtt_stats,
            packet_number(2),
            &packets_acked,
            &mut packets_lost,
        );
        assert!(packets_lost.is_empty());
        let timeout = detector.loss_detection_timeout().unwrap();
        assert_eq!(timeout, start + Duration::from_millis(125));

        // at the timeout the packet is declared lost
        detector.detect_losses(
            &map,
            timeout,
            &rtt_stats,
            packet_number(2),
            &[],
            &mut packets_lost,
        );
        assert_eq!(packets_lost.len(), 1);
        assert_eq!(packets_lost[0].packet_number, packet_number(1));
        assert_eq!(detector.loss_detection_timeout(), None);
    }

    /// Spurious retransmit widens the thresholds so a re-run of the same
    /// trace no longer declares the packets lost
    #[test]
    fn spurious_loss_adapts_reordering_threshold() {
        let start = NoopClock.get_time();
        let mut map = UnackedPacketMap::new(endpoint::Type::Client);
        send_packets(&mut map, 1..=10, start);

        let mut detector =
            LossDetector::new(PacketNumberSpace::ApplicationData, Params::default());
        let rtt_stats = rtt_with(Duration::from_millis(100), Duration::from_millis(120));

        let ack_time = start + Duration::from_millis(120);
        let packets_acked = [acked(5)];
        on_ack(&mut map, &packets_acked);

        let mut packets_lost = Vec::new();
        detector.detect_losses(
            &map,
            ack_time,
            &rtt_stats,
            packet_number(5),
            &packets_acked,
            &mut packets_lost,
        );
        assert_eq!(packets_lost.len(), 2);

        // the "lost" packets are acked later: the loss was spurious
        let late_ack_time = start + Duration::from_millis(200);
        for value in [1u64, 2] {
            detector.spurious_loss_detected(
                &map,
                &rtt_stats,
                late_ack_time,
                packet_number(value),
                packet_number(5),
            );
        }
        // observed gap of 4 plus one
        assert!(detector.reordering_threshold() >= 5);

        // replaying the trace declares nothing lost
        let mut map = UnackedPacketMap::new(endpoint::Type::Client);
        send_packets(&mut map, 1..=10, start);
        let mut detector_rerun = LossDetector::new(
            PacketNumberSpace::ApplicationData,
            Params {
                reordering_threshold: detector.reordering_threshold(),
                reordering_shift: detector.reordering_shift(),
                ..Params::default()
            },
        );
        on_ack(&mut map, &packets_acked);
        let mut packets_lost = Vec::new();
        detector_rerun.detect_losses(
            &map,
            ack_time,
            &rtt_stats,
            packet_number(5),
            &packets_acked,
            &mut packets_lost,
        );
        assert!(packets_lost.is_empty());
    }

    #[test]
    fn adaptive_time_threshold_coarsens_shift() {
        let start = NoopClock.get_time();
        let mut map = UnackedPacketMap::new(endpoint::Type::Client);
        send_packets(&mut map, 1..=2, start);

        let params = Params {
            use_adaptive_time_threshold: true,
            ..Params::default()
        };
        let mut detector = LossDetector::new(PacketNumberSpace::ApplicationData, params);
        let rtt_stats = rtt_with(Duration::from_millis(100), Duration::from_millis(100));

        // the packet needed 160ms to be acked; 100ms + (100ms >> 2) = 125ms
        // would have declared it lost, so the shift decreases until the
        // threshold covers 160ms (100ms + 100ms >> 0 = 200ms)
        detector.spurious_loss_detected(
            &map,
            &rtt_stats,
            start + Duration::from_millis(160),
            packet_number(1),
            packet_number(2),
        );
        assert_eq!(detector.reordering_shift(), 0);
    }

    #[test]
    fn contiguous_ack_run_fast_path_skips_scan() {
        let start = NoopClock.get_time();
        let mut map = UnackedPacketMap::new(endpoint::Type::Client);
        send_packets(&mut map, 1..=3, start);

        let mut detector =
            LossDetector::new(PacketNumberSpace::ApplicationData, Params::default());
        let rtt_stats = rtt_with(Duration::from_millis(100), Duration::from_millis(100));

        // ack 1..3 contiguously
        let packets_acked = [acked(1), acked(2), acked(3)];
        on_ack(&mut map, &packets_acked);
        let mut packets_lost = Vec::new();
        detector.detect_losses(
            &map,
            start + Duration::from_millis(100),
            &rtt_stats,
            packet_number(3),
            &packets_acked,
            &mut packets_lost,
        );
        assert!(packets_lost.is_empty());
        assert_eq!(detector.loss_detection_timeout(), None);

        // send more packets; the cursor picks up from packet 4
        send_packets(&mut map, 4..=5, start + Duration::from_millis(100));
        let packets_acked = [acked(5)];
        on_ack(&mut map, &packets_acked);
        let mut packets_lost = Vec::new();
        detector.detect_losses(
            &map,
            start + Duration::from_millis(200),
            &rtt_stats,
            packet_number(5),
            &packets_acked,
            &mut packets_lost,
        );
        // packet 4 is only one behind: below the packet threshold, within
        // the time threshold
        assert!(packets_lost.is_empty());
        assert!(detector.loss_detection_timeout().is_some());
    }
}
