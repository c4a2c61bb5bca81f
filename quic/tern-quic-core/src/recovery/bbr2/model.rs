// Copyright the tern-quic project authors. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! The shared network model all BBRv2 modes read and write: bandwidth and
//! round-trip filters, soft lower/upper bounds, and per-round loss
//! accounting.

use crate::{
    packet::number::PacketNumber,
    recovery::{
        bandwidth::Bandwidth,
        bbr2::Params,
        sampler::{BandwidthSampler, CongestionEventSample, SendTimeState},
        AckedPacket, LostPacket, MAX_SEGMENT_SIZE,
    },
    time::Timestamp,
};
use core::time::Duration;
use num_rational::Ratio;

/// Counts packet-timed round trips: a round ends when a packet sent after
/// the previous round's end is acknowledged
#[derive(Clone, Debug, Default)]
pub struct RoundTripCounter {
    round_trip_count: u64,
    last_sent_packet: Option<PacketNumber>,
    /// Ack of a packet above this ends the current round
    end_of_round_trip: Option<PacketNumber>,
}

impl RoundTripCounter {
    #[inline]
    pub fn round_trip_count(&self) -> u64 {
        self.round_trip_count
    }

    #[inline]
    pub fn last_sent_packet(&self) -> Option<PacketNumber> {
        self.last_sent_packet
    }

    pub fn on_packet_sent(&mut self, packet_number: PacketNumber) {
        debug_assert!(self
            .last_sent_packet
            .map_or(true, |last| last < packet_number));
        self.last_sent_packet = Some(packet_number);
    }

    /// Returns true if a new round trip starts with this ack
    pub fn on_packets_acked(&mut self, last_acked_packet: PacketNumber) -> bool {
        let round_over = self
            .end_of_round_trip
            .map_or(true, |end| last_acked_packet > end);
        if round_over {
            self.round_trip_count += 1;
            self.end_of_round_trip = self.last_sent_packet;
        }
        round_over
    }

    /// Restarts the round without advancing the counter
    pub fn restart_round(&mut self) {
        self.end_of_round_trip = self.last_sent_packet;
    }
}

/// Windowed min RTT with an explicit force-update used when the filter must
/// accept a fresh (possibly larger) sample after PROBE_RTT
#[derive(Clone, Debug)]
pub struct MinRttFilter {
    min_rtt: Duration,
    min_rtt_timestamp: Option<Timestamp>,
}

impl MinRttFilter {
    pub fn new(initial_min_rtt: Duration, initial_min_rtt_timestamp: Option<Timestamp>) -> Self {
        Self {
            min_rtt: initial_min_rtt,
            min_rtt_timestamp: initial_min_rtt_timestamp,
        }
    }

    #[inline]
    pub fn get(&self) -> Duration {
        self.min_rtt
    }

    #[inline]
    pub fn timestamp(&self) -> Option<Timestamp> {
        self.min_rtt_timestamp
    }

    pub fn update(&mut self, sample_rtt: Duration, now: Timestamp) {
        if sample_rtt < self.min_rtt || self.min_rtt_timestamp.is_none() {
            self.min_rtt = sample_rtt;
            self.min_rtt_timestamp = Some(now);
        }
    }

    pub fn force_update(&mut self, sample_rtt: Duration, now: Timestamp) {
        self.min_rtt = sample_rtt;
        self.min_rtt_timestamp = Some(now);
    }

    /// Pushes the timestamp forward so idle time does not count against the
    /// probe-RTT period
    pub fn postpone_timestamp(&mut self, duration: Duration) {
        if let Some(timestamp) = self.min_rtt_timestamp {
            self.min_rtt_timestamp = Some(timestamp + duration);
        }
    }
}

/// Max bandwidth over the current and previous probe cycles. Advancing the
/// filter rotates the current cycle's max into the previous slot.
#[derive(Clone, Debug, Default)]
pub struct MaxBandwidthFilter {
    max_bandwidth: [Bandwidth; 2],
}

impl MaxBandwidthFilter {
    #[inline]
    pub fn get(&self) -> Bandwidth {
        self.max_bandwidth[0].max(self.max_bandwidth[1])
    }

    pub fn update(&mut self, sample: Bandwidth) {
        self.max_bandwidth[1] = self.max_bandwidth[1].max(sample);
    }

    pub fn advance(&mut self) {
        if self.max_bandwidth[1].is_zero() {
            return;
        }
        self.max_bandwidth[0] = self.max_bandwidth[1];
        self.max_bandwidth[1] = Bandwidth::ZERO;
    }
}

/// Everything one congestion event carries between the model and the mode
/// machine
#[derive(Clone, Copy, Debug)]
pub struct Bbr2CongestionEvent {
    pub event_time: Timestamp,
    pub prior_cwnd: u64,
    pub prior_bytes_in_flight: u64,
    /// Whether the mode in effect when the event began was probing
    pub is_probing_for_bandwidth: bool,
    /// True if this ack closed a packet-timed round trip
    pub end_of_round_trip: bool,
    pub last_sample_is_app_limited: bool,
    pub sample_min_rtt: Option<Duration>,
    pub sample_max_bandwidth: Option<Bandwidth>,
    pub bytes_acked: u64,
    pub bytes_lost: u64,
    /// In-flight bytes after acked and lost bytes are removed
    pub bytes_in_flight: u64,
    pub last_packet_send_state: SendTimeState,
}

impl Bbr2CongestionEvent {
    pub fn new(event_time: Timestamp, prior_cwnd: u64, prior_bytes_in_flight: u64) -> Self {
        Self {
            event_time,
            prior_cwnd,
            prior_bytes_in_flight,
            is_probing_for_bandwidth: false,
            end_of_round_trip: false,
            last_sample_is_app_limited: false,
            sample_min_rtt: None,
            sample_max_bandwidth: None,
            bytes_acked: 0,
            bytes_lost: 0,
            bytes_in_flight: 0,
            last_packet_send_state: SendTimeState::default(),
        }
    }
}

/// Outcome of the per-round startup bandwidth growth check
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BandwidthGrowth {
    /// The round was app limited; no conclusion
    AppLimited,
    /// Still growing
    Growth,
    /// No growth this round, but not enough rounds to exit yet
    NoGrowth,
    /// No growth for enough rounds: full bandwidth reached
    Exit,
}

#[derive(Clone, Debug)]
pub struct NetworkModel {
    round_trip_counter: RoundTripCounter,
    bandwidth_sampler: BandwidthSampler,
    min_rtt_filter: MinRttFilter,
    max_bandwidth_filter: MaxBandwidthFilter,

    /// Max bandwidth sample in the current round; only resets on round end
    bandwidth_latest: Bandwidth,
    /// Max delivered-while-inflight sample in the current round
    inflight_latest: u64,

    /// Soft loss-response bound; `Bandwidth::MAX` when unset
    bandwidth_lo: Bandwidth,
    /// Soft loss-response volume bound; `u64::MAX` when unset
    inflight_lo: u64,
    /// Probe ceiling; `u64::MAX` when unset
    inflight_hi: u64,

    cwnd_gain: Ratio<u64>,
    pacing_gain: Ratio<u64>,

    full_bandwidth_reached: bool,
    full_bandwidth_baseline: Bandwidth,
    rounds_without_bandwidth_growth: u64,
    rounds_with_queueing: u64,

    bytes_lost_in_round: u64,
    loss_events_in_round: u64,
    max_bytes_delivered_in_round: u64,
}

impl NetworkModel {
    pub fn new(
        params: &Params,
        initial_rtt: Duration,
        initial_rtt_timestamp: Option<Timestamp>,
        cwnd_gain: Ratio<u64>,
        pacing_gain: Ratio<u64>,
    ) -> Self {
        Self {
            round_trip_counter: RoundTripCounter::default(),
            bandwidth_sampler: BandwidthSampler::new(
                params.initial_max_ack_height_filter_window,
                params.sampler_params(),
            ),
            min_rtt_filter: MinRttFilter::new(initial_rtt, initial_rtt_timestamp),
            max_bandwidth_filter: MaxBandwidthFilter::default(),
            bandwidth_latest: Bandwidth::ZERO,
            inflight_latest: 0,
            bandwidth_lo: Bandwidth::MAX,
            inflight_lo: u64::MAX,
            inflight_hi: u64::MAX,
            cwnd_gain,
            pacing_gain,
            full_bandwidth_reached: false,
            full_bandwidth_baseline: Bandwidth::ZERO,
            rounds_without_bandwidth_growth: 0,
            rounds_with_queueing: 0,
            bytes_lost_in_round: 0,
            loss_events_in_round: 0,
            max_bytes_delivered_in_round: 0,
        }
    }

    #[inline]
    pub fn round_trip_count(&self) -> u64 {
        self.round_trip_counter.round_trip_count()
    }

    #[inline]
    pub fn last_sent_packet(&self) -> Option<PacketNumber> {
        self.round_trip_counter.last_sent_packet()
    }

    #[inline]
    pub fn min_rtt(&self) -> Duration {
        self.min_rtt_filter.get()
    }

    #[inline]
    pub fn min_rtt_timestamp(&self) -> Option<Timestamp> {
        self.min_rtt_filter.timestamp()
    }

    #[inline]
    pub fn max_bandwidth(&self) -> Bandwidth {
        self.max_bandwidth_filter.get()
    }

    #[inline]
    pub fn bandwidth_latest(&self) -> Bandwidth {
        self.bandwidth_latest
    }

    #[inline]
    pub fn inflight_latest(&self) -> u64 {
        self.inflight_latest
    }

    #[inline]
    pub fn bandwidth_lo(&self) -> Bandwidth {
        self.bandwidth_lo
    }

    pub fn clear_bandwidth_lo(&mut self) {
        self.bandwidth_lo = Bandwidth::MAX;
    }

    #[inline]
    pub fn inflight_lo(&self) -> u64 {
        self.inflight_lo
    }

    pub fn clear_inflight_lo(&mut self) {
        self.inflight_lo = u64::MAX;
    }

    /// Lowers `inflight_lo` to `cap` if it is set and above it
    pub fn cap_inflight_lo(&mut self, params: &Params, cap: u64) {
        if params.ignore_inflight_lo {
            return;
        }
        if self.inflight_lo != u64::MAX && self.inflight_lo > cap {
            self.inflight_lo = cap;
        }
    }

    #[inline]
    pub fn inflight_hi(&self) -> u64 {
        self.inflight_hi
    }

    #[inline]
    pub fn inflight_hi_default() -> u64 {
        u64::MAX
    }

    pub fn set_inflight_hi(&mut self, inflight_hi: u64) {
        self.inflight_hi = inflight_hi;
    }

    pub fn inflight_hi_with_headroom(&self, params: &Params) -> u64 {
        if self.inflight_hi == Self::inflight_hi_default() {
            // No probe ceiling discovered yet; there is nothing to leave
            // headroom under.
            return self.inflight_hi;
        }
        let headroom = (params.inflight_hi_headroom * self.inflight_hi).to_integer();
        self.inflight_hi.saturating_sub(headroom)
    }

    #[inline]
    pub fn cwnd_gain(&self) -> Ratio<u64> {
        self.cwnd_gain
    }

    pub fn set_cwnd_gain(&mut self, cwnd_gain: Ratio<u64>) {
        self.cwnd_gain = cwnd_gain;
    }

    #[inline]
    pub fn pacing_gain(&self) -> Ratio<u64> {
        self.pacing_gain
    }

    pub fn set_pacing_gain(&mut self, pacing_gain: Ratio<u64>) {
        self.pacing_gain = pacing_gain;
    }

    #[inline]
    pub fn full_bandwidth_reached(&self) -> bool {
        self.full_bandwidth_reached
    }

    pub fn set_full_bandwidth_reached(&mut self) {
        self.full_bandwidth_reached = true;
    }

    #[inline]
    pub fn full_bandwidth_baseline(&self) -> Bandwidth {
        self.full_bandwidth_baseline
    }

    #[inline]
    pub fn rounds_without_bandwidth_growth(&self) -> u64 {
        self.rounds_without_bandwidth_growth
    }

    #[inline]
    pub fn rounds_with_queueing(&self) -> u64 {
        self.rounds_with_queueing
    }

    #[inline]
    pub fn bytes_lost_in_round(&self) -> u64 {
        self.bytes_lost_in_round
    }

    #[inline]
    pub fn loss_events_in_round(&self) -> u64 {
        self.loss_events_in_round
    }

    #[inline]
    pub fn max_bytes_delivered_in_round(&self) -> u64 {
        self.max_bytes_delivered_in_round
    }

    #[inline]
    pub fn total_bytes_sent(&self) -> u64 {
        self.bandwidth_sampler.total_bytes_sent()
    }

    #[inline]
    pub fn total_bytes_acked(&self) -> u64 {
        self.bandwidth_sampler.total_bytes_acked()
    }

    #[inline]
    pub fn total_bytes_lost(&self) -> u64 {
        self.bandwidth_sampler.total_bytes_lost()
    }

    #[inline]
    pub fn max_ack_height(&self) -> u64 {
        self.bandwidth_sampler.max_ack_height()
    }

    #[inline]
    pub fn num_ack_aggregation_epochs(&self) -> u64 {
        self.bandwidth_sampler.num_ack_aggregation_epochs()
    }

    #[inline]
    pub fn end_of_app_limited_phase(&self) -> Option<PacketNumber> {
        self.bandwidth_sampler.end_of_app_limited_phase()
    }

    /// `min(max_bw, bandwidth_lo)`: the rate the model currently believes
    /// the path can sustain
    #[inline]
    pub fn bandwidth_estimate(&self) -> Bandwidth {
        self.max_bandwidth().min(self.bandwidth_lo)
    }

    /// Bandwidth-delay product at the estimated bandwidth
    #[inline]
    pub fn bdp(&self) -> u64 {
        self.bdp_for(self.bandwidth_estimate())
    }

    #[inline]
    pub fn bdp_for(&self, bandwidth: Bandwidth) -> u64 {
        bandwidth * self.min_rtt()
    }

    #[inline]
    pub fn bdp_with_gain(&self, bandwidth: Bandwidth, gain: Ratio<u64>) -> u64 {
        (gain * self.bdp_for(bandwidth)).to_integer()
    }

    /// Extra queueing allowance on top of the BDP when judging PROBE_UP
    #[inline]
    pub fn queueing_threshold_extra_bytes(&self) -> u64 {
        2 * u64::from(MAX_SEGMENT_SIZE)
    }

    pub fn on_packet_sent(
        &mut self,
        sent_time: Timestamp,
        bytes_in_flight: u64,
        packet_number: PacketNumber,
        bytes: u64,
        has_retransmittable_data: bool,
    ) {
        self.round_trip_counter.on_packet_sent(packet_number);
        self.bandwidth_sampler.on_packet_sent(
            sent_time,
            packet_number,
            bytes,
            bytes_in_flight,
            has_retransmittable_data,
        );
    }

    pub fn on_packet_neutered(&mut self, packet_number: PacketNumber) {
        self.bandwidth_sampler.on_packet_neutered(packet_number);
    }

    pub fn on_app_limited(&mut self) {
        self.bandwidth_sampler.on_app_limited();
    }

    pub fn is_app_limited(&self) -> bool {
        self.bandwidth_sampler.is_app_limited()
    }

    pub fn on_congestion_event_start(
        &mut self,
        params: &Params,
        event_time: Timestamp,
        acked_packets: &[AckedPacket],
        lost_packets: &[LostPacket],
        congestion_event: &mut Bbr2CongestionEvent,
    ) {
        let prior_bytes_acked = self.total_bytes_acked();
        let prior_bytes_lost = self.total_bytes_lost();

        congestion_event.event_time = event_time;
        congestion_event.end_of_round_trip = match acked_packets.last() {
            Some(newest) => self.round_trip_counter.on_packets_acked(newest.packet_number),
            None => false,
        };

        let sample: CongestionEventSample = self.bandwidth_sampler.on_congestion_event(
            event_time,
            acked_packets,
            lost_packets,
            self.max_bandwidth(),
            self.bandwidth_lo,
            self.round_trip_count(),
        );

        if sample.last_packet_send_state.is_valid {
            congestion_event.last_packet_send_state = sample.last_packet_send_state;
            congestion_event.last_sample_is_app_limited =
                sample.last_packet_send_state.is_app_limited;
        }

        // Skip the max_bandwidth_filter update on loss-only events and on
        // acks that produced no valid samples (e.g. acks of ack-only
        // packets); in both cases total_bytes_acked() is unchanged.
        if prior_bytes_acked != self.total_bytes_acked()
            && (!sample.sample_is_app_limited
                || sample.sample_max_bandwidth > self.max_bandwidth())
        {
            congestion_event.sample_max_bandwidth = Some(sample.sample_max_bandwidth);
            self.max_bandwidth_filter.update(sample.sample_max_bandwidth);
        }

        if let Some(sample_rtt) = sample.sample_rtt {
            congestion_event.sample_min_rtt = Some(sample_rtt);
            self.min_rtt_filter.update(sample_rtt, event_time);
        }

        congestion_event.bytes_acked = self.total_bytes_acked() - prior_bytes_acked;
        congestion_event.bytes_lost = self.total_bytes_lost() - prior_bytes_lost;

        congestion_event.bytes_in_flight = congestion_event
            .prior_bytes_in_flight
            .saturating_sub(congestion_event.bytes_acked + congestion_event.bytes_lost);

        if congestion_event.bytes_lost > 0 {
            self.bytes_lost_in_round += congestion_event.bytes_lost;
            self.loss_events_in_round += 1;
        }

        if congestion_event.bytes_acked > 0
            && congestion_event.last_packet_send_state.is_valid
            && self.total_bytes_acked()
                > congestion_event.last_packet_send_state.total_bytes_acked
        {
            let bytes_delivered = self.total_bytes_acked()
                - congestion_event.last_packet_send_state.total_bytes_acked;
            self.max_bytes_delivered_in_round =
                self.max_bytes_delivered_in_round.max(bytes_delivered);
        }

        // bandwidth_latest and inflight_latest only increase within a round
        if sample.sample_max_bandwidth > self.bandwidth_latest {
            self.bandwidth_latest = sample.sample_max_bandwidth;
        }
        if sample.sample_max_inflight > self.inflight_latest {
            self.inflight_latest = sample.sample_max_inflight;
        }

        self.adapt_lower_bounds(params, congestion_event);

        if !congestion_event.end_of_round_trip {
            return;
        }

        if !sample.sample_max_bandwidth.is_zero() {
            self.bandwidth_latest = sample.sample_max_bandwidth;
        }
        if sample.sample_max_inflight > 0 {
            self.inflight_latest = sample.sample_max_inflight;
        }
    }

    fn adapt_lower_bounds(&mut self, params: &Params, congestion_event: &Bbr2CongestionEvent) {
        use crate::recovery::bbr2::BwLoMode;

        if params.bw_lo_mode != BwLoMode::Default {
            if congestion_event.bytes_lost == 0 {
                return;
            }
            // Ignore losses from packets sent while probing in STARTUP or
            // PROBE_UP when they are detected in DRAIN or PROBE_DOWN.
            if self.pacing_gain < Ratio::new_raw(1, 1) {
                return;
            }
            // Decrease bandwidth_lo whenever there is loss.
            if self.bandwidth_lo == Bandwidth::MAX {
                self.bandwidth_lo = self.max_bandwidth();
            }
            match params.bw_lo_mode {
                BwLoMode::MinRttReduction => {
                    let reduction = Bandwidth::new(congestion_event.bytes_lost, self.min_rtt());
                    self.bandwidth_lo = self.bandwidth_lo.saturating_sub(reduction);
                }
                BwLoMode::InflightReduction => {
                    // Use the max of BDP and inflight to avoid starving
                    // app-limited flows.
                    let effective_inflight =
                        self.bdp().max(congestion_event.prior_bytes_in_flight);
                    if effective_inflight > 0 {
                        let kept = effective_inflight
                            .saturating_sub(congestion_event.bytes_lost);
                        self.bandwidth_lo =
                            self.bandwidth_lo * Ratio::new(kept, effective_inflight);
                    }
                }
                BwLoMode::CwndReduction => {
                    if congestion_event.prior_cwnd > 0 {
                        let kept = congestion_event
                            .prior_cwnd
                            .saturating_sub(congestion_event.bytes_lost);
                        self.bandwidth_lo =
                            self.bandwidth_lo * Ratio::new(kept, congestion_event.prior_cwnd);
                    }
                }
                BwLoMode::Default => unreachable!(),
            }
            if self.pacing_gain > params.startup_full_bw_threshold {
                // In STARTUP the pacing gain rides on bandwidth_lo; back
                // that multiplication out so the pacing rate can decrease,
                // but not below bandwidth_latest * startup_full_bw_threshold.
                let floor = self.bandwidth_latest
                    * (params.startup_full_bw_threshold / self.pacing_gain);
                self.bandwidth_lo = self.bandwidth_lo.max(floor);
            } else {
                self.bandwidth_lo = self.bandwidth_lo.max(self.bandwidth_latest);
            }
            // inflight_lo is intentionally left alone in these modes.
            return;
        }

        if !congestion_event.end_of_round_trip || congestion_event.is_probing_for_bandwidth {
            return;
        }

        if self.bytes_lost_in_round > 0 {
            if self.bandwidth_lo == Bandwidth::MAX {
                self.bandwidth_lo = self.max_bandwidth();
            }
            let one_minus_beta = Ratio::new_raw(1, 1) - params.beta;
            self.bandwidth_lo = self
                .bandwidth_latest
                .max(self.bandwidth_lo * one_minus_beta);

            if params.ignore_inflight_lo {
                return;
            }
            if self.inflight_lo == u64::MAX {
                self.inflight_lo = congestion_event.prior_cwnd;
            }
            self.inflight_lo = self
                .inflight_latest
                .max((one_minus_beta * self.inflight_lo).to_integer());
        }
    }

    pub fn on_congestion_event_finish(
        &mut self,
        least_unacked_packet: PacketNumber,
        congestion_event: &Bbr2CongestionEvent,
    ) {
        if congestion_event.end_of_round_trip {
            self.on_new_round();
        }
        self.bandwidth_sampler.remove_obsolete_packets(least_unacked_packet);
    }

    /// Seeds the min RTT from resumed network parameters
    pub fn update_network_parameters(&mut self, rtt: Duration) {
        if !rtt.is_zero() {
            if let Some(timestamp) = self.min_rtt_timestamp() {
                self.min_rtt_filter.update(rtt, timestamp);
            }
        }
    }

    /// Force-refreshes an expired min RTT estimate. Returns true when the
    /// caller should transition into PROBE_RTT.
    pub fn maybe_expire_min_rtt(
        &mut self,
        params: &Params,
        congestion_event: &Bbr2CongestionEvent,
    ) -> bool {
        let Some(min_rtt_timestamp) = self.min_rtt_timestamp() else {
            return false;
        };
        if congestion_event.event_time < min_rtt_timestamp + params.probe_rtt_period {
            return false;
        }
        let Some(sample_min_rtt) = congestion_event.sample_min_rtt else {
            return false;
        };
        self.min_rtt_filter
            .force_update(sample_min_rtt, congestion_event.event_time);
        true
    }

    pub fn postpone_min_rtt_timestamp(&mut self, duration: Duration) {
        self.min_rtt_filter.postpone_timestamp(duration);
    }

    pub fn is_congestion_window_limited(&self, congestion_event: &Bbr2CongestionEvent) -> bool {
        let prior_bytes_in_flight = congestion_event.bytes_in_flight
            + congestion_event.bytes_acked
            + congestion_event.bytes_lost;
        prior_bytes_in_flight >= congestion_event.prior_cwnd
    }

    /// Returns true when the loss rate over this round exceeded the
    /// configured threshold of the inflight volume at send time
    pub fn is_inflight_too_high(
        &self,
        params: &Params,
        congestion_event: &Bbr2CongestionEvent,
        max_loss_events: u64,
    ) -> bool {
        let send_state = &congestion_event.last_packet_send_state;
        if !send_state.is_valid {
            // Not enough information.
            return false;
        }
        if self.loss_events_in_round < max_loss_events {
            return false;
        }

        let inflight_at_send = send_state.bytes_in_flight;
        if inflight_at_send > 0 && self.bytes_lost_in_round > 0 {
            let lost_in_round_threshold =
                (params.loss_threshold * inflight_at_send).to_integer();
            if self.bytes_lost_in_round > lost_in_round_threshold {
                return true;
            }
        }
        false
    }

    /// Judges whether the path has been building a standing queue: true if
    /// inflight stayed at or above `target_gain * BDP` for this round
    pub fn check_persistent_queue(
        &mut self,
        congestion_event: &Bbr2CongestionEvent,
        target_gain: Ratio<u64>,
    ) {
        debug_assert!(congestion_event.end_of_round_trip);
        let target = (target_gain * self.bdp())
            .to_integer()
            .max(self.bdp() + self.queueing_threshold_extra_bytes());
        if congestion_event.bytes_in_flight >= target {
            self.rounds_with_queueing += 1;
        } else {
            self.rounds_with_queueing = 0;
        }
    }

    pub fn clear_rounds_with_queueing(&mut self) {
        self.rounds_with_queueing = 0;
    }

    /// Restarts the round and clears the per-round accumulators
    pub fn restart_round_early(&mut self) {
        self.on_new_round();
        self.round_trip_counter.restart_round();
    }

    fn on_new_round(&mut self) {
        self.bytes_lost_in_round = 0;
        self.loss_events_in_round = 0;
        self.max_bytes_delivered_in_round = 0;
    }

    pub fn advance_max_bandwidth_filter(&mut self) {
        self.max_bandwidth_filter.advance();
    }

    /// The per-round startup growth check. Advances the no-growth counter
    /// and latches `full_bandwidth_reached` after enough flat rounds.
    pub fn check_bandwidth_growth(
        &mut self,
        params: &Params,
        congestion_event: &Bbr2CongestionEvent,
    ) -> BandwidthGrowth {
        debug_assert!(!self.full_bandwidth_reached);
        debug_assert!(congestion_event.end_of_round_trip);
        if congestion_event.last_sample_is_app_limited {
            return BandwidthGrowth::AppLimited;
        }

        let threshold = self.full_bandwidth_baseline * params.startup_full_bw_threshold;
        if self.max_bandwidth() >= threshold {
            self.full_bandwidth_baseline = self.max_bandwidth();
            self.rounds_without_bandwidth_growth = 0;
            return BandwidthGrowth::Growth;
        }

        self.rounds_without_bandwidth_growth += 1;
        if self.rounds_without_bandwidth_growth >= params.startup_full_bw_rounds {
            self.full_bandwidth_reached = true;
            return BandwidthGrowth::Exit;
        }
        BandwidthGrowth::NoGrowth
    }
}
