// Copyright the tern-quic project authors. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Delivery rate sampling.
//!
//! For every congestion-controlled packet the sampler snapshots the
//! connection totals at send time. When the packet is acked it produces a
//! bandwidth sample as the min of the send rate and the ack rate over the
//! sampling interval, which keeps ack compression from inflating the
//! estimate. The ack-aggregation tracker measures how far ack arrivals run
//! ahead of the estimated bandwidth so the congestion controller can widen
//! cwnd on paths with receive-side coalescing.

use crate::{
    packet::number::PacketNumber,
    recovery::{
        bandwidth::Bandwidth,
        windowed_filter::WindowedMaxFilter,
        AckedPacket, LostPacket,
    },
    time::Timestamp,
};
use std::collections::VecDeque;
use core::time::Duration;
use num_rational::Ratio;

/// Connection totals as they were when a packet was sent
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SendTimeState {
    /// Set for states captured from a tracked packet; a default-constructed
    /// state carries no information
    pub is_valid: bool,
    /// Whether the path was application limited at send time
    pub is_app_limited: bool,
    pub total_bytes_sent: u64,
    pub total_bytes_acked: u64,
    pub total_bytes_lost: u64,
    pub bytes_in_flight: u64,
}

/// A time/total-acked coordinate used as the starting point of an ack-rate
/// interval
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AckPoint {
    pub ack_time: Timestamp,
    pub total_bytes_acked: u64,
}

/// The last two ack points observed, so that the start of a new aggregation
/// epoch can be saved as an A0 candidate
#[derive(Clone, Copy, Debug, Default)]
struct RecentAckPoints {
    points: [Option<AckPoint>; 2],
}

impl RecentAckPoints {
    fn update(&mut self, ack_time: Timestamp, total_bytes_acked: u64) {
        debug_assert!(self.points[1].map_or(true, |p| p.total_bytes_acked <= total_bytes_acked));

        match self.points[1] {
            Some(most_recent) if ack_time <= most_recent.ack_time => {
                // clock went backwards or stood still: fold into the most
                // recent point
                self.points[1] = Some(AckPoint {
                    ack_time: most_recent.ack_time.min(ack_time),
                    total_bytes_acked,
                });
            }
            _ => {
                self.points[0] = self.points[1];
                self.points[1] = Some(AckPoint {
                    ack_time,
                    total_bytes_acked,
                });
            }
        }
    }

    fn clear(&mut self) {
        self.points = [None, None];
    }

    fn most_recent_point(&self) -> AckPoint {
        self.points[1].expect("update must be called before reading")
    }

    fn less_recent_point(&self) -> AckPoint {
        self.points[0].or(self.points[1]).expect("update must be called before reading")
    }
}

/// Per-packet sampler state captured on send
#[derive(Clone, Copy, Debug)]
struct ConnectionStateOnSentPacket {
    sent_time: Timestamp,
    size: u64,
    /// `total_bytes_sent_at_last_acked_packet` at the time of the send
    total_bytes_sent_at_last_acked_packet: u64,
    last_acked_packet_sent_time: Option<Timestamp>,
    last_acked_packet_ack_time: Option<Timestamp>,
    send_time_state: SendTimeState,
}

/// A single bandwidth measurement produced by an acked packet
#[derive(Clone, Copy, Debug, Default)]
pub struct BandwidthSample {
    /// Zero if no valid sample could be taken
    pub bandwidth: Bandwidth,
    /// The RTT implied by this ack, not corrected for ack delay
    pub rtt: Duration,
    pub state_at_send: SendTimeState,
}

/// The aggregate outcome of one ack event
#[derive(Clone, Copy, Debug, Default)]
pub struct CongestionEventSample {
    /// The maximum bandwidth sample over all acked packets
    pub sample_max_bandwidth: Bandwidth,
    /// Whether the `sample_max_bandwidth` sample was app limited
    pub sample_is_app_limited: bool,
    /// The minimum RTT sample over all acked packets
    pub sample_rtt: Option<Duration>,
    /// The maximum delivered-while-inflight observation
    pub sample_max_inflight: u64,
    /// Send state of the most recently sent packet this event touched
    pub last_packet_send_state: SendTimeState,
    /// Newly measured ack aggregation excess
    pub extra_acked: u64,
}

/// Detects ack aggregation by comparing bytes acked within an epoch to the
/// amount the bandwidth estimate predicts
#[derive(Clone, Debug)]
pub struct MaxAckHeightTracker {
    max_ack_height_filter: WindowedMaxFilter<u64, u64, u64>,
    aggregation_epoch_start_time: Option<Timestamp>,
    aggregation_epoch_bytes: u64,
    ack_aggregation_bandwidth_threshold: Ratio<u64>,
    num_ack_aggregation_epochs: u64,
}

impl MaxAckHeightTracker {
    /// Default multiple of the expected ack rate that starts a new epoch
    const DEFAULT_BANDWIDTH_THRESHOLD: Ratio<u64> = Ratio::new_raw(9, 5);

    pub fn new(window_length_in_round_trips: u64) -> Self {
        Self {
            max_ack_height_filter: WindowedMaxFilter::new(window_length_in_round_trips),
            aggregation_epoch_start_time: None,
            aggregation_epoch_bytes: 0,
            ack_aggregation_bandwidth_threshold: Self::DEFAULT_BANDWIDTH_THRESHOLD,
            num_ack_aggregation_epochs: 0,
        }
    }

    pub fn set_ack_aggregation_bandwidth_threshold(&mut self, threshold: Ratio<u64>) {
        self.ack_aggregation_bandwidth_threshold = threshold;
    }

    pub fn max_ack_height(&self) -> u64 {
        self.max_ack_height_filter.value().unwrap_or(0)
    }

    pub fn num_ack_aggregation_epochs(&self) -> u64 {
        self.num_ack_aggregation_epochs
    }

    /// Processes the bytes acked by one ack event and returns the excess
    /// over the expected delivery, or 0 when a new epoch starts
    pub fn update(
        &mut self,
        bandwidth_estimate: Bandwidth,
        round_trip_count: u64,
        ack_time: Timestamp,
        bytes_acked: u64,
    ) -> u64 {
        let epoch_start = match self.aggregation_epoch_start_time {
            Some(epoch_start) => epoch_start,
            None => {
                self.aggregation_epoch_bytes = bytes_acked;
                self.aggregation_epoch_start_time = Some(ack_time);
                self.num_ack_aggregation_epochs += 1;
                return 0;
            }
        };

        // How many bytes the max bandwidth predicts for this epoch so far
        let expected_bytes_acked = bandwidth_estimate * (ack_time - epoch_start);

        // Restart the epoch as soon as the ack arrival rate falls back to
        // the predicted rate
        let threshold =
            (self.ack_aggregation_bandwidth_threshold * expected_bytes_acked).to_integer();
        if self.aggregation_epoch_bytes <= threshold {
            self.aggregation_epoch_bytes = bytes_acked;
            self.aggregation_epoch_start_time = Some(ack_time);
            self.num_ack_aggregation_epochs += 1;
            return 0;
        }

        self.aggregation_epoch_bytes += bytes_acked;
        let extra_bytes_acked = self.aggregation_epoch_bytes - expected_bytes_acked;
        self.max_ack_height_filter.update(extra_bytes_acked, round_trip_count);
        extra_bytes_acked
    }
}

/// A queue of per-packet values indexed by packet number.
///
/// Packets must be inserted in increasing number order; gaps (skipped
/// numbers) occupy empty slots so lookup stays O(1).
#[derive(Clone, Debug)]
struct PacketNumberIndexedQueue<T> {
    entries: VecDeque<Option<T>>,
    first_packet: Option<PacketNumber>,
}

impl<T> Default for PacketNumberIndexedQueue<T> {
    fn default() -> Self {
        Self {
            entries: VecDeque::new(),
            first_packet: None,
        }
    }
}

impl<T> PacketNumberIndexedQueue<T> {
    fn last_packet(&self) -> Option<PacketNumber> {
        let first = self.first_packet?;
        if self.entries.is_empty() {
            return None;
        }
        PacketNumber::new(first.as_u64() + self.entries.len() as u64 - 1)
    }

    fn index_of(&self, packet_number: PacketNumber) -> Option<usize> {
        let first = self.first_packet?;
        let offset = packet_number.checked_distance(first)? as usize;
        if offset >= self.entries.len() {
            return None;
        }
        Some(offset)
    }

    fn emplace(&mut self, packet_number: PacketNumber, entry: T) -> bool {
        match self.last_packet() {
            None => {
                self.entries.push_back(Some(entry));
                self.first_packet = Some(packet_number);
                true
            }
            Some(last) => {
                if packet_number <= last {
                    // out of order or duplicate insert
                    return false;
                }
                let gap = packet_number.checked_distance(last).unwrap() - 1;
                for _ in 0..gap {
                    self.entries.push_back(None);
                }
                self.entries.push_back(Some(entry));
                true
            }
        }
    }

    fn get_entry(&mut self, packet_number: PacketNumber) -> Option<&mut T> {
        let index = self.index_of(packet_number)?;
        self.entries.get_mut(index)?.as_mut()
    }

    fn remove(&mut self, packet_number: PacketNumber) -> Option<T> {
        let index = self.index_of(packet_number)?;
        let entry = self.entries.get_mut(index)?.take()?;
        self.cleanup_front();
        Some(entry)
    }

    /// Drops all packets up to (but not including) `packet_number`
    fn remove_up_to(&mut self, packet_number: PacketNumber) {
        while let Some(first) = self.first_packet {
            if first >= packet_number || self.entries.is_empty() {
                break;
            }
            self.entries.pop_front();
            self.first_packet = Some(first.next());
        }
        self.cleanup_front();
    }

    /// Advances `first_packet` past leading empty slots
    fn cleanup_front(&mut self) {
        while let Some(None) = self.entries.front() {
            self.entries.pop_front();
            self.first_packet = self.first_packet.map(PacketNumber::next);
        }
        if self.entries.is_empty() {
            self.first_packet = None;
        }
    }
}

/// Configuration for the sampler, fixed at construction
#[derive(Clone, Copy, Debug)]
pub struct Params {
    /// Bound on the in-flight packet map; exceeding it indicates the owner
    /// stopped pruning obsolete packets
    pub max_tracked_packets: usize,
    /// Whether a new connection counts as app limited until it fills the
    /// window for the first time
    pub started_as_app_limited: bool,
    /// Enables A0-candidate tracking to avoid bandwidth overestimation on
    /// aggregated acks
    pub overestimate_avoidance: bool,
}

impl Default for Params {
    fn default() -> Self {
        Self {
            max_tracked_packets: 10_000,
            started_as_app_limited: true,
            overestimate_avoidance: false,
        }
    }
}

/// Delivery-rate estimator over the life of a connection
#[derive(Clone, Debug)]
pub struct BandwidthSampler {
    total_bytes_sent: u64,
    total_bytes_acked: u64,
    total_bytes_lost: u64,
    total_bytes_neutered: u64,

    /// `total_bytes_sent` at the time the most recently acked packet was
    /// sent
    total_bytes_sent_at_last_acked_packet: u64,
    last_acked_packet_sent_time: Option<Timestamp>,
    last_acked_packet_ack_time: Option<Timestamp>,
    last_sent_packet: Option<PacketNumber>,

    is_app_limited: bool,
    end_of_app_limited_phase: Option<PacketNumber>,

    connection_state_map: PacketNumberIndexedQueue<ConnectionStateOnSentPacket>,
    recent_ack_points: RecentAckPoints,
    a0_candidates: VecDeque<AckPoint>,

    max_ack_height_tracker: MaxAckHeightTracker,
    total_bytes_acked_after_last_ack_event: u64,

    params: Params,
}

impl BandwidthSampler {
    pub fn new(max_height_tracker_window_length: u64, params: Params) -> Self {
        let mut tracker = MaxAckHeightTracker::new(max_height_tracker_window_length);
        if params.overestimate_avoidance {
            tracker.set_ack_aggregation_bandwidth_threshold(Ratio::new_raw(2, 1));
        }
        Self {
            total_bytes_sent: 0,
            total_bytes_acked: 0,
            total_bytes_lost: 0,
            total_bytes_neutered: 0,
            total_bytes_sent_at_last_acked_packet: 0,
            last_acked_packet_sent_time: None,
            last_acked_packet_ack_time: None,
            last_sent_packet: None,
            is_app_limited: params.started_as_app_limited,
            end_of_app_limited_phase: None,
            connection_state_map: Default::default(),
            recent_ack_points: Default::default(),
            a0_candidates: VecDeque::new(),
            max_ack_height_tracker: tracker,
            total_bytes_acked_after_last_ack_event: 0,
            params,
        }
    }

    #[inline]
    pub fn total_bytes_sent(&self) -> u64 {
        self.total_bytes_sent
    }

    #[inline]
    pub fn total_bytes_acked(&self) -> u64 {
        self.total_bytes_acked
    }

    #[inline]
    pub fn total_bytes_lost(&self) -> u64 {
        self.total_bytes_lost
    }

    #[inline]
    pub fn total_bytes_neutered(&self) -> u64 {
        self.total_bytes_neutered
    }

    #[inline]
    pub fn is_app_limited(&self) -> bool {
        self.is_app_limited
    }

    #[inline]
    pub fn end_of_app_limited_phase(&self) -> Option<PacketNumber> {
        self.end_of_app_limited_phase
    }

    #[inline]
    pub fn last_sent_packet(&self) -> Option<PacketNumber> {
        self.last_sent_packet
    }

    #[inline]
    pub fn max_ack_height(&self) -> u64 {
        self.max_ack_height_tracker.max_ack_height()
    }

    #[inline]
    pub fn num_ack_aggregation_epochs(&self) -> u64 {
        self.max_ack_height_tracker.num_ack_aggregation_epochs()
    }

    /// Called for every sent packet. Packets without retransmittable data do
    /// not advance the totals but are still remembered as the last sent.
    pub fn on_packet_sent(
        &mut self,
        sent_time: Timestamp,
        packet_number: PacketNumber,
        bytes: u64,
        bytes_in_flight: u64,
        has_retransmittable_data: bool,
    ) {
        self.last_sent_packet = Some(packet_number);

        if !has_retransmittable_data {
            return;
        }

        self.total_bytes_sent += bytes;

        // If there are no packets in flight, the send time doubles as the A0
        // point: any ack after now measures delivery over this quiescence
        // boundary. This underestimates slightly but provides samples at the
        // start of the connection where none would otherwise exist.
        if bytes_in_flight == 0 {
            self.last_acked_packet_ack_time = Some(sent_time);
            if self.params.overestimate_avoidance {
                self.recent_ack_points.clear();
                self.recent_ack_points.update(sent_time, self.total_bytes_acked);
                self.a0_candidates.clear();
                self.a0_candidates.push_back(self.recent_ack_points.most_recent_point());
            }
            self.total_bytes_sent_at_last_acked_packet = self.total_bytes_sent;
            self.last_acked_packet_sent_time = Some(sent_time);
        }

        if let Some(last_tracked) = self.connection_state_map.last_packet() {
            debug_assert!(
                packet_number.as_u64()
                    <= last_tracked.as_u64() + self.params.max_tracked_packets as u64,
                "in-flight packet map has exceeded the maximum number of tracked packets"
            );
        }

        let inserted = self.connection_state_map.emplace(
            packet_number,
            ConnectionStateOnSentPacket {
                sent_time,
                size: bytes,
                total_bytes_sent_at_last_acked_packet: self.total_bytes_sent_at_last_acked_packet,
                last_acked_packet_sent_time: self.last_acked_packet_sent_time,
                last_acked_packet_ack_time: self.last_acked_packet_ack_time,
                send_time_state: SendTimeState {
                    is_valid: true,
                    is_app_limited: self.is_app_limited,
                    total_bytes_sent: self.total_bytes_sent,
                    total_bytes_acked: self.total_bytes_acked,
                    total_bytes_lost: self.total_bytes_lost,
                    bytes_in_flight: bytes_in_flight + bytes,
                },
            },
        );
        debug_assert!(inserted, "failed to insert packet into the sampler map");
    }

    /// Called when a packet is neutered: its bytes stop counting anywhere
    pub fn on_packet_neutered(&mut self, packet_number: PacketNumber) {
        if let Some(entry) = self.connection_state_map.remove(packet_number) {
            self.total_bytes_neutered += entry.size;
        }
    }

    /// Processes one congestion event: losses first, then acks, then the
    /// ack-aggregation update
    pub fn on_congestion_event(
        &mut self,
        ack_time: Timestamp,
        acked_packets: &[AckedPacket],
        lost_packets: &[LostPacket],
        max_bandwidth: Bandwidth,
        est_bandwidth_upper_bound: Bandwidth,
        round_trip_count: u64,
    ) -> CongestionEventSample {
        let mut event_sample = CongestionEventSample::default();

        let mut last_lost_packet_send_state = SendTimeState::default();
        for packet in lost_packets {
            let send_state = self.on_packet_lost(packet.packet_number, packet.bytes_lost);
            if send_state.is_valid {
                last_lost_packet_send_state = send_state;
            }
        }

        if acked_packets.is_empty() {
            // Only populate send state for a loss-only event.
            event_sample.last_packet_send_state = last_lost_packet_send_state;
            return event_sample;
        }

        let mut last_acked_packet_send_state = SendTimeState::default();
        for packet in acked_packets {
            let sample = self.on_packet_acknowledged(ack_time, packet.packet_number);
            if !sample.state_at_send.is_valid {
                continue;
            }

            last_acked_packet_send_state = sample.state_at_send;

            if !sample.rtt.is_zero() {
                event_sample.sample_rtt = Some(match event_sample.sample_rtt {
                    Some(rtt) => rtt.min(sample.rtt),
                    None => sample.rtt,
                });
            }
            if sample.bandwidth > event_sample.sample_max_bandwidth {
                event_sample.sample_max_bandwidth = sample.bandwidth;
                event_sample.sample_is_app_limited = sample.state_at_send.is_app_limited;
            }
            let inflight_sample =
                self.total_bytes_acked - last_acked_packet_send_state.total_bytes_acked;
            if inflight_sample > event_sample.sample_max_inflight {
                event_sample.sample_max_inflight = inflight_sample;
            }
        }

        event_sample.last_packet_send_state =
            match (last_lost_packet_send_state.is_valid, last_acked_packet_send_state.is_valid) {
                (false, _) => last_acked_packet_send_state,
                (true, false) => last_lost_packet_send_state,
                (true, true) => {
                    // A late loss alarm can declare a packet lost that was
                    // sent after the newest acked one; prefer whichever
                    // packet was sent last.
                    let last_lost = lost_packets.last().map(|p| p.packet_number);
                    let last_acked = acked_packets.last().map(|p| p.packet_number);
                    if last_lost > last_acked {
                        last_lost_packet_send_state
                    } else {
                        last_acked_packet_send_state
                    }
                }
            };

        let max_bandwidth = max_bandwidth.max(event_sample.sample_max_bandwidth);
        event_sample.extra_acked = self.on_ack_event_end(
            est_bandwidth_upper_bound.min(max_bandwidth),
            round_trip_count,
        );

        event_sample
    }

    fn on_ack_event_end(&mut self, bandwidth_estimate: Bandwidth, round_trip_count: u64) -> u64 {
        let newly_acked_bytes =
            self.total_bytes_acked - self.total_bytes_acked_after_last_ack_event;
        if newly_acked_bytes == 0 {
            return 0;
        }
        self.total_bytes_acked_after_last_ack_event = self.total_bytes_acked;

        let ack_time = self
            .last_acked_packet_ack_time
            .expect("an ack event implies an acked packet");
        let extra_acked = self.max_ack_height_tracker.update(
            bandwidth_estimate,
            round_trip_count,
            ack_time,
            newly_acked_bytes,
        );
        // A zero excess marks the start of a new aggregation epoch: the last
        // ack point of the previous epoch becomes an A0 candidate.
        if self.params.overestimate_avoidance && extra_acked == 0 {
            self.a0_candidates.push_back(self.recent_ack_points.less_recent_point());
        }
        extra_acked
    }

    fn on_packet_acknowledged(
        &mut self,
        ack_time: Timestamp,
        packet_number: PacketNumber,
    ) -> BandwidthSample {
        let sent_packet = match self.connection_state_map.remove(packet_number) {
            Some(sent_packet) => sent_packet,
            // Acks for packets the map no longer tracks (e.g. neutered
            // crypto packets) yield no sample.
            None => return BandwidthSample::default(),
        };

        self.total_bytes_acked += sent_packet.size;
        self.total_bytes_sent_at_last_acked_packet =
            sent_packet.send_time_state.total_bytes_sent;
        self.last_acked_packet_sent_time = Some(sent_packet.sent_time);
        self.last_acked_packet_ack_time = Some(ack_time);
        if self.params.overestimate_avoidance {
            self.recent_ack_points.update(ack_time, self.total_bytes_acked);
        }

        if self.is_app_limited {
            // Exit app-limited phase in two cases:
            // (1) end_of_app_limited_phase is not set, i.e. every packet so
            //     far was sent while data was buffered;
            // (2) the acked packet was sent after the app-limited phase
            //     ended.
            let past_phase_end = self
                .end_of_app_limited_phase
                .map_or(self.params.started_as_app_limited, |end| packet_number > end);
            if past_phase_end {
                self.is_app_limited = false;
            }
        }

        let last_acked_packet_sent_time = match sent_packet.last_acked_packet_sent_time {
            Some(time) => time,
            None => {
                debug_assert!(false, "last_acked_packet_sent_time unset on a tracked packet");
                return BandwidthSample::default();
            }
        };

        // An infinite rate tells the min() below to use only the ack rate.
        let send_rate = if sent_packet.sent_time > last_acked_packet_sent_time {
            Bandwidth::new(
                sent_packet.send_time_state.total_bytes_sent
                    - sent_packet.total_bytes_sent_at_last_acked_packet,
                sent_packet.sent_time - last_acked_packet_sent_time,
            )
        } else {
            Bandwidth::MAX
        };

        let a0 = match self.choose_a0_point(sent_packet.send_time_state.total_bytes_acked) {
            Some(a0) if self.params.overestimate_avoidance => a0,
            _ => AckPoint {
                ack_time: sent_packet
                    .last_acked_packet_ack_time
                    .unwrap_or(last_acked_packet_sent_time),
                total_bytes_acked: sent_packet.send_time_state.total_bytes_acked,
            },
        };

        // The slope calculation requires strictly increasing ack times;
        // clock jitter and the first packet after quiescence both land here
        // and are discarded.
        if ack_time <= a0.ack_time {
            return BandwidthSample::default();
        }
        let ack_rate = Bandwidth::new(
            self.total_bytes_acked - a0.total_bytes_acked,
            ack_time - a0.ack_time,
        );

        let mut sample = BandwidthSample {
            bandwidth: send_rate.min(ack_rate),
            // Note: this does not account for delayed acknowledgement time,
            // so samples can run high on low bandwidth connections.
            rtt: ack_time - sent_packet.sent_time,
            state_at_send: sent_packet.send_time_state,
        };
        sample.state_at_send.is_valid = true;
        sample
    }

    /// Picks the A0 candidate with the largest `total_bytes_acked` that is
    /// still at most the acked packet's snapshot, dropping older candidates
    fn choose_a0_point(&mut self, total_bytes_acked: u64) -> Option<AckPoint> {
        if !self.params.overestimate_avoidance {
            return None;
        }
        if self.a0_candidates.is_empty() {
            debug_assert!(false, "no A0 point candidates");
            return None;
        }
        if self.a0_candidates.len() == 1 {
            return self.a0_candidates.front().copied();
        }

        for i in 1..self.a0_candidates.len() {
            if self.a0_candidates[i].total_bytes_acked > total_bytes_acked {
                let a0 = self.a0_candidates[i - 1];
                if i > 1 {
                    self.a0_candidates.drain(..i - 1);
                }
                return Some(a0);
            }
        }

        // Every candidate's total is <= total_bytes_acked: use the newest.
        let a0 = *self.a0_candidates.back().unwrap();
        self.a0_candidates.drain(..self.a0_candidates.len() - 1);
        Some(a0)
    }

    fn on_packet_lost(&mut self, packet_number: PacketNumber, bytes_lost: u64) -> SendTimeState {
        self.total_bytes_lost += bytes_lost;
        if let Some(entry) = self.connection_state_map.get_entry(packet_number) {
            let mut send_time_state = entry.send_time_state;
            send_time_state.is_valid = true;
            return send_time_state;
        }
        SendTimeState::default()
    }

    /// Marks the path app limited until `bytes_in_flight` more bytes are
    /// acknowledged
    pub fn on_app_limited(&mut self) {
        self.is_app_limited = true;
        self.end_of_app_limited_phase = self.last_sent_packet;
    }

    /// Drops tracked packets below `least_unacked`.
    ///
    /// A packet becomes obsolete when the unacked map stops considering it
    /// in flight without it ever being acked or lost here, e.g. after a
    /// crypto retransmission.
    pub fn remove_obsolete_packets(&mut self, least_unacked: PacketNumber) {
        self.connection_state_map.remove_up_to(least_unacked);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::{Clock, NoopClock};

    const MSS: u64 = 1460;

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

    fn sampler() -> BandwidthSampler {
        BandwidthSampler::new(
            10,
            Params {
                started_as_app_limited: false,
                ..Default::default()
            },
        )
    }

    #[test]
    fn send_and_ack_produces_sample() {
        let mut sampler = sampler();
        let start = NoopClock.get_time();

        // one packet per ms, acked one RTT later
        for i in 1..=10u64 {
            let sent = start + Duration::from_millis(i);
            sampler.on_packet_sent(sent, packet_number(i), MSS, (i - 1) * MSS, true);
        }
        assert_eq!(sampler.total_bytes_sent(), 10 * MSS);

        let ack_time = start + Duration::from_millis(101);
        let event = sampler.on_congestion_event(
            ack_time,
            &[acked(1, MSS)],
            &[],
            Bandwidth::ZERO,
            Bandwidth::MAX,
            1,
        );
        assert_eq!(sampler.total_bytes_acked(), MSS);
        assert!(event.sample_max_bandwidth > Bandwidth::ZERO);
        assert_eq!(event.sample_rtt, Some(Duration::from_millis(100)));
        assert!(event.last_packet_send_state.is_valid);
    }

    #[test]
    fn loss_only_event_reports_send_state() {
        let mut sampler = sampler();
        let now = NoopClock.get_time();
        sampler.on_packet_sent(now, packet_number(1), MSS, 0, true);

        let event = sampler.on_congestion_event(
            now + Duration::from_millis(300),
            &[],
            &[LostPacket {
                packet_number: packet_number(1),
                bytes_lost: MSS,
            }],
            Bandwidth::ZERO,
            Bandwidth::MAX,
            1,
        );
        assert_eq!(sampler.total_bytes_lost(), MSS);
        assert_eq!(event.sample_max_bandwidth, Bandwidth::ZERO);
        assert!(event.last_packet_send_state.is_valid);
    }

    #[test]
    fn app_limited_sticks_until_later_packet_acked() {
        let mut sampler = sampler();
        let start = NoopClock.get_time();

        sampler.on_packet_sent(start, packet_number(1), MSS, 0, true);
        sampler.on_app_limited();
        assert!(sampler.is_app_limited());
        assert_eq!(sampler.end_of_app_limited_phase(), Some(packet_number(1)));

        // packet 2 is sent after the app-limited marker
        sampler.on_packet_sent(start + Duration::from_millis(1), packet_number(2), MSS, MSS, true);

        // acking packet 1 does not clear the phase
        sampler.on_congestion_event(
            start + Duration::from_millis(100),
            &[acked(1, MSS)],
            &[],
            Bandwidth::ZERO,
            Bandwidth::MAX,
            1,
        );
        assert!(sampler.is_app_limited());

        // acking packet 2 does
        sampler.on_congestion_event(
            start + Duration::from_millis(101),
            &[acked(2, MSS)],
            &[],
            Bandwidth::ZERO,
            Bandwidth::MAX,
            1,
        );
        assert!(!sampler.is_app_limited());
    }

    #[test]
    fn neutered_packets_are_excluded() {
        let mut sampler = sampler();
        let now = NoopClock.get_time();
        sampler.on_packet_sent(now, packet_number(1), MSS, 0, true);
        sampler.on_packet_neutered(packet_number(1));
        assert_eq!(sampler.total_bytes_neutered(), MSS);

        // a late ack for the neutered packet yields no sample and no totals
        let event = sampler.on_congestion_event(
            now + Duration::from_millis(100),
            &[acked(1, MSS)],
            &[],
            Bandwidth::ZERO,
            Bandwidth::MAX,
            1,
        );
        assert_eq!(sampler.total_bytes_acked(), 0);
        assert!(!event.last_packet_send_state.is_valid);
    }

    #[test]
    fn ack_rate_caps_send_rate() {
        let mut sampler = sampler();
        let start = NoopClock.get_time();

        // burst sent back-to-back (high send rate)
        for i in 1..=5u64 {
            sampler.on_packet_sent(
                start + Duration::from_micros(i),
                packet_number(i),
                MSS,
                (i - 1) * MSS,
                true,
            );
        }

        // acked slowly, one per 10ms
        let mut max_bandwidth = Bandwidth::ZERO;
        for i in 1..=5u64 {
            let event = sampler.on_congestion_event(
                start + Duration::from_millis(10 * i),
                &[acked(i, MSS)],
                &[],
                max_bandwidth,
                Bandwidth::MAX,
                i,
            );
            max_bandwidth = max_bandwidth.max(event.sample_max_bandwidth);
        }

        // the delivery estimate reflects the ack rate (~MSS / 10ms), not the
        // burst send rate
        let ack_rate = Bandwidth::new(MSS, Duration::from_millis(10));
        assert!(max_bandwidth <= ack_rate * Ratio::new_raw(11, 10));
    }

    #[test]
    fn max_ack_height_tracks_aggregation_excess() {
        let mut tracker = MaxAckHeightTracker::new(10);
        let start = NoopClock.get_time();
        let bandwidth = Bandwidth::new(MSS, Duration::from_millis(1));

        // first update starts the epoch
        assert_eq!(tracker.update(bandwidth, 1, start, 10 * MSS), 0);
        assert_eq!(tracker.num_ack_aggregation_epochs(), 1);

        // 10 packets of credit were built up; at 1 packet/ms expected, an
        // ack 1ms later of 10 more packets is 9 packets of excess
        let excess = tracker.update(bandwidth, 1, start + Duration::from_millis(1), 10 * MSS);
        assert_eq!(excess, 19 * MSS);
        assert_eq!(tracker.max_ack_height(), 19 * MSS);

        // once the arrival rate matches the estimate, a new epoch starts
        let much_later = start + Duration::from_secs(1);
        assert_eq!(tracker.update(bandwidth, 2, much_later, MSS), 0);
        assert_eq!(tracker.num_ack_aggregation_epochs(), 2);
    }

    #[test]
    fn overestimate_avoidance_uses_a0_candidates() {
        let mut sampler = BandwidthSampler::new(
            10,
            Params {
                started_as_app_limited: false,
                overestimate_avoidance: true,
                ..Default::default()
            },
        );
        let start = NoopClock.get_time();

        for i in 1..=4u64 {
            sampler.on_packet_sent(
                start + Duration::from_millis(i),
                packet_number(i),
                MSS,
                (i - 1) * MSS,
                true,
            );
        }

        // an A0 candidate exists from the quiescence boundary
        assert_eq!(sampler.a0_candidates.len(), 1);

        let event = sampler.on_congestion_event(
            start + Duration::from_millis(50),
            &[acked(1, MSS), acked(2, MSS)],
            &[],
            Bandwidth::ZERO,
            Bandwidth::MAX,
            1,
        );
        assert!(event.sample_max_bandwidth > Bandwidth::ZERO);
    }
}
