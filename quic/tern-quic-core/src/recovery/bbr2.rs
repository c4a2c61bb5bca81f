// Copyright the tern-quic project authors. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! A congestion controller that implements "Bottleneck Bandwidth and
//! Round-trip propagation time" version 2 (BBRv2).
//!
//! Four modes compose into a state machine driven by per-ack congestion
//! events and round-trip boundaries:
//!
//! ```text
//!              |
//!              V
//!     +---> Startup  ------------+
//!     |        |                 |
//!     |        V                 |
//!     |     Drain  --------------+
//!     |        |                 |
//!     |        V                 |
//!     +---> ProbeBW_DOWN  -------+
//!     | ^      |                 |
//!     | |      V                 |
//!     | |   ProbeBW_CRUISE ------+
//!     | |      |                 |
//!     | |      V                 |
//!     | |   ProbeBW_REFILL  -----+
//!     | |      |                 |
//!     | |      V                 |
//!     | |   ProbeBW_UP  ---------+
//!     | |      |                 |
//!     | +------+                 |
//!     |                          |
//!     +---- ProbeRTT <-----------+
//! ```

use crate::{
    packet::number::PacketNumber,
    random,
    recovery::{
        bandwidth::Bandwidth,
        bbr2::model::{BandwidthGrowth, Bbr2CongestionEvent, NetworkModel},
        congestion_controller::Publisher,
        rtt::RttStats,
        sampler,
        AckedPacket, LostPacket, MAX_SEGMENT_SIZE,
    },
    time::Timestamp,
    transport::parameters::{ConnectionOptions, Tag},
};
use core::time::Duration;
use num_rational::Ratio;
use num_traits::Inv;

pub mod model;
mod probe_bw;
mod probe_rtt;

pub use probe_bw::CyclePhase;

/// 2.885, the gain that doubles the in-flight volume every round
const STARTUP_GAIN: Ratio<u64> = Ratio::new_raw(577, 200);

/// A congestion event may ripple through at most this many mode changes;
/// more indicates the mode machine is oscillating
const MAX_MODE_CHANGES_PER_CONGESTION_EVENT: u32 = 4;

/// How the model reduces `bandwidth_lo` in response to loss
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BwLoMode {
    /// End-of-round multiplicative decrease by `1 - beta`
    Default,
    /// Subtract `bytes_lost / min_rtt` on every loss
    MinRttReduction,
    /// Scale by the fraction of the effective inflight that survived
    InflightReduction,
    /// Scale by the fraction of the prior cwnd that survived
    CwndReduction,
}

/// BBRv2 tuning knobs, fixed at construction.
///
/// Defaults match current production values; connection options received
/// during the handshake may adjust them before the first packet is sent.
#[derive(Clone, Copy, Debug)]
pub struct Params {
    pub startup_cwnd_gain: Ratio<u64>,
    pub startup_pacing_gain: Ratio<u64>,
    /// Bandwidth growth below this ratio counts as a no-growth round
    pub startup_full_bw_threshold: Ratio<u64>,
    /// No-growth rounds before STARTUP exits
    pub startup_full_bw_rounds: u64,
    /// Loss events in one round that force a STARTUP exit
    pub startup_full_loss_count: u64,
    /// Seed `inflight_hi` from the round's max delivered bytes when that is
    /// larger than the BDP
    pub startup_loss_exit_use_max_delivered: bool,
    /// Exit STARTUP after this many queue-building rounds; 0 disables
    pub max_startup_queue_rounds: u64,

    pub drain_cwnd_gain: Ratio<u64>,
    pub drain_pacing_gain: Ratio<u64>,

    pub probe_bw_cwnd_gain: Ratio<u64>,
    pub probe_bw_probe_up_pacing_gain: Ratio<u64>,
    pub probe_bw_probe_down_pacing_gain: Ratio<u64>,
    pub probe_bw_default_pacing_gain: Ratio<u64>,
    /// Loss events in one round that count as probing too high
    pub probe_bw_full_loss_count: u64,
    /// Base wait before the next bandwidth probe
    pub probe_bw_probe_base_duration: Duration,
    /// Random extra wait added to the base duration
    pub probe_bw_probe_max_rand_duration: Duration,
    /// Random round offset subtracted from the reno-coexistence rounds
    pub probe_bw_max_probe_rand_rounds: u64,
    /// Hard bound on rounds between probes
    pub probe_bw_probe_max_rounds: u64,
    /// Multiplier on the reno-coexistence round estimate; zero disables the
    /// inflight-derived bound
    pub probe_bw_probe_reno_gain: Ratio<u64>,
    pub enable_reno_coexistence: bool,
    /// Let PROBE_UP ignore `inflight_hi`, like STARTUP does
    pub probe_up_ignore_inflight_hi: bool,
    /// Exit PROBE_UP after this many queue-building rounds; 0 selects the
    /// byte-based queueing threshold instead
    pub max_probe_up_queue_rounds: u64,

    /// Enter PROBE_RTT when min_rtt has not been refreshed for this long
    pub probe_rtt_period: Duration,
    /// How long PROBE_RTT holds inflight at its target
    pub probe_rtt_duration: Duration,
    pub probe_rtt_cwnd_gain: Ratio<u64>,

    /// Max tolerated per-round loss rate when probing
    pub loss_threshold: Ratio<u64>,
    /// Multiplicative decrease applied to the soft lower bounds
    pub beta: Ratio<u64>,
    /// Fraction of `inflight_hi` left free for cross traffic
    pub inflight_hi_headroom: Ratio<u64>,

    pub min_congestion_window: u64,
    pub max_congestion_window: u64,

    /// Window of the ack aggregation filter, in round trips
    pub initial_max_ack_height_filter_window: u64,
    /// Add the max ack height to the PROBE_UP queueing threshold
    pub add_ack_height_to_queueing_threshold: bool,
    /// Postpone the PROBE_RTT deadline over quiescence
    pub avoid_unnecessary_probe_rtt: bool,
    /// Treat a sufficiently full pipe as not app limited
    pub flexible_app_limited: bool,
    pub ignore_inflight_lo: bool,
    pub bw_lo_mode: BwLoMode,
    /// Enables bandwidth-sampler overestimate avoidance
    pub overestimate_avoidance: bool,
}

impl Default for Params {
    fn default() -> Self {
        Self {
            startup_cwnd_gain: STARTUP_GAIN,
            startup_pacing_gain: STARTUP_GAIN,
            startup_full_bw_threshold: Ratio::new_raw(5, 4),
            startup_full_bw_rounds: 3,
            startup_full_loss_count: 8,
            startup_loss_exit_use_max_delivered: true,
            max_startup_queue_rounds: 0,
            drain_cwnd_gain: STARTUP_GAIN,
            drain_pacing_gain: STARTUP_GAIN.inv(),
            probe_bw_cwnd_gain: Ratio::new_raw(2, 1),
            probe_bw_probe_up_pacing_gain: Ratio::new_raw(5, 4),
            probe_bw_probe_down_pacing_gain: Ratio::new_raw(3, 4),
            probe_bw_default_pacing_gain: Ratio::new_raw(1, 1),
            probe_bw_full_loss_count: 2,
            probe_bw_probe_base_duration: Duration::from_secs(2),
            probe_bw_probe_max_rand_duration: Duration::from_secs(1),
            probe_bw_max_probe_rand_rounds: 2,
            probe_bw_probe_max_rounds: 63,
            probe_bw_probe_reno_gain: Ratio::new_raw(1, 1),
            enable_reno_coexistence: true,
            probe_up_ignore_inflight_hi: false,
            max_probe_up_queue_rounds: 0,
            probe_rtt_period: Duration::from_secs(10),
            probe_rtt_duration: Duration::from_millis(200),
            probe_rtt_cwnd_gain: Ratio::new_raw(1, 2),
            loss_threshold: Ratio::new_raw(1, 50),
            beta: Ratio::new_raw(3, 10),
            inflight_hi_headroom: Ratio::new_raw(15, 100),
            min_congestion_window: 4 * MAX_SEGMENT_SIZE as u64,
            max_congestion_window: 2000 * MAX_SEGMENT_SIZE as u64,
            initial_max_ack_height_filter_window: 10,
            add_ack_height_to_queueing_threshold: true,
            avoid_unnecessary_probe_rtt: true,
            flexible_app_limited: false,
            ignore_inflight_lo: false,
            bw_lo_mode: BwLoMode::Default,
            overestimate_avoidance: false,
        }
    }
}

impl Params {
    /// Applies the connection options negotiated during the handshake
    pub fn apply_connection_options(&mut self, options: &ConnectionOptions) {
        if options.contains(Tag::BBR9) {
            self.flexible_app_limited = true;
        }
        if options.contains(Tag::BSAO) {
            self.overestimate_avoidance = true;
        }
        if options.contains(Tag::B2NA) {
            self.add_ack_height_to_queueing_threshold = false;
        }
        if options.contains(Tag::B2RP) {
            self.avoid_unnecessary_probe_rtt = false;
        }
    }

    pub(crate) fn sampler_params(&self) -> sampler::Params {
        sampler::Params {
            overestimate_avoidance: self.overestimate_avoidance,
            ..Default::default()
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Mode {
    Startup,
    Drain,
    ProbeBw,
    ProbeRtt,
}

#[derive(Clone, Debug)]
pub struct Bbr2Sender {
    mode: Mode,
    params: Params,
    model: NetworkModel,
    initial_cwnd: u64,
    cwnd: u64,
    pacing_rate: Bandwidth,
    cycle: probe_bw::Cycle,
    probe_rtt: probe_rtt::State,
    last_quiescence_start: Option<Timestamp>,
    last_sample_is_app_limited: bool,
}

/// A point-in-time snapshot of the sender for logs and tests
#[derive(Clone, Copy, Debug)]
pub struct DebugState {
    pub mode: Mode,
    pub cycle_phase: CyclePhase,
    pub round_trip_count: u64,
    pub bandwidth_est: Bandwidth,
    pub bandwidth_lo: Bandwidth,
    pub bandwidth_hi: Bandwidth,
    pub inflight_lo: u64,
    pub inflight_hi: u64,
    pub max_ack_height: u64,
    pub min_rtt: Duration,
    pub congestion_window: u64,
    pub pacing_rate: Bandwidth,
    pub last_sample_is_app_limited: bool,
}

impl Bbr2Sender {
    pub fn new(
        rtt_stats: &RttStats,
        initial_cwnd_in_packets: u64,
        params: Params,
    ) -> Self {
        let initial_cwnd = (initial_cwnd_in_packets * MAX_SEGMENT_SIZE as u64)
            .clamp(params.min_congestion_window, params.max_congestion_window);
        let initial_rtt = rtt_stats.smoothed_or_initial_rtt();
        let model = NetworkModel::new(
            &params,
            initial_rtt,
            rtt_stats.last_update_time(),
            params.startup_cwnd_gain,
            params.startup_pacing_gain,
        );
        let pacing_rate =
            Bandwidth::new(initial_cwnd, initial_rtt) * params.startup_pacing_gain;
        Self {
            mode: Mode::Startup,
            params,
            model,
            initial_cwnd,
            cwnd: initial_cwnd,
            pacing_rate,
            cycle: probe_bw::Cycle::default(),
            probe_rtt: probe_rtt::State::default(),
            last_quiescence_start: None,
            last_sample_is_app_limited: false,
        }
    }

    #[inline]
    pub fn mode(&self) -> Mode {
        self.mode
    }

    #[inline]
    pub fn cycle_phase(&self) -> CyclePhase {
        self.cycle.phase()
    }

    #[inline]
    pub(crate) fn model(&self) -> &NetworkModel {
        &self.model
    }

    #[inline]
    pub fn congestion_window(&self) -> u64 {
        self.cwnd
    }

    #[inline]
    pub fn bandwidth_estimate(&self) -> Bandwidth {
        self.model.bandwidth_estimate()
    }

    #[inline]
    pub fn pacing_rate(&self) -> Bandwidth {
        self.pacing_rate
    }

    #[inline]
    pub fn can_send(&self, bytes_in_flight: u64) -> bool {
        bytes_in_flight < self.cwnd
    }

    #[inline]
    pub fn in_slow_start(&self) -> bool {
        self.mode == Mode::Startup
    }

    /// `min(BDP, cwnd)`, the volume the sender is currently aiming for
    pub fn target_bytes_inflight(&self) -> u64 {
        self.model.bdp().min(self.cwnd)
    }

    fn is_probing_for_bandwidth(&self) -> bool {
        match self.mode {
            Mode::Startup => true,
            Mode::Drain | Mode::ProbeRtt => false,
            Mode::ProbeBw => self.cycle.is_probing_for_bandwidth(),
        }
    }

    pub fn on_packet_sent(
        &mut self,
        sent_time: Timestamp,
        bytes_in_flight: u64,
        packet_number: PacketNumber,
        bytes: u64,
        has_retransmittable_data: bool,
    ) {
        if bytes_in_flight == 0 && self.params.avoid_unnecessary_probe_rtt {
            self.on_exit_quiescence(sent_time);
        }
        self.model.on_packet_sent(
            sent_time,
            bytes_in_flight,
            packet_number,
            bytes,
            has_retransmittable_data,
        );
    }

    pub fn on_packet_neutered(&mut self, packet_number: PacketNumber) {
        self.model.on_packet_neutered(packet_number);
    }

    pub fn on_congestion_event(
        &mut self,
        prior_in_flight: u64,
        event_time: Timestamp,
        acked_packets: &[AckedPacket],
        lost_packets: &[LostPacket],
        least_unacked: PacketNumber,
        random: &mut dyn random::Generator,
        publisher: &mut dyn Publisher,
    ) {
        let mut congestion_event =
            Bbr2CongestionEvent::new(event_time, self.cwnd, prior_in_flight);
        congestion_event.is_probing_for_bandwidth = self.is_probing_for_bandwidth();

        self.model.on_congestion_event_start(
            &self.params,
            event_time,
            acked_packets,
            lost_packets,
            &mut congestion_event,
        );

        let mut mode_changes_allowed = MAX_MODE_CHANGES_PER_CONGESTION_EVENT;
        loop {
            let next_mode = match self.mode {
                Mode::Startup => self.startup_on_congestion_event(&congestion_event),
                Mode::Drain => self.drain_on_congestion_event(&congestion_event),
                Mode::ProbeBw => {
                    self.probe_bw_on_congestion_event(prior_in_flight, &congestion_event, random)
                }
                Mode::ProbeRtt => self.probe_rtt_on_congestion_event(&congestion_event),
            };
            if next_mode == self.mode {
                break;
            }
            self.leave_mode(&congestion_event);
            self.mode = next_mode;
            self.enter_mode(event_time, random, publisher);
            if mode_changes_allowed == 0 {
                debug_assert!(false, "exceeded max number of mode changes per congestion event");
                break;
            }
            mode_changes_allowed -= 1;
        }

        self.update_pacing_rate(congestion_event.bytes_acked, publisher);
        debug_assert!(!self.pacing_rate.is_zero(), "pacing rate must not be zero");

        self.update_congestion_window(congestion_event.bytes_acked, publisher);
        debug_assert!(self.cwnd > 0, "congestion window must not be zero");

        self.model
            .on_congestion_event_finish(least_unacked, &congestion_event);
        self.last_sample_is_app_limited = congestion_event.last_sample_is_app_limited;
        if congestion_event.bytes_in_flight == 0 && self.params.avoid_unnecessary_probe_rtt {
            self.on_enter_quiescence(event_time);
        }
    }

    fn startup_on_congestion_event(&mut self, congestion_event: &Bbr2CongestionEvent) -> Mode {
        if self.model.full_bandwidth_reached() {
            debug_assert!(false, "in STARTUP but full_bandwidth_reached is set");
            return Mode::Drain;
        }
        if !congestion_event.end_of_round_trip {
            return Mode::Startup;
        }

        let growth = self.model.check_bandwidth_growth(&self.params, congestion_event);
        let has_bandwidth_growth = growth == BandwidthGrowth::Growth;

        if self.params.max_startup_queue_rounds > 0 && !has_bandwidth_growth {
            // 1.75 is less than the 2x cwnd gain but substantially more than
            // 1.25x, the minimum bandwidth increase expected during STARTUP.
            self.model
                .check_persistent_queue(congestion_event, Ratio::new_raw(7, 4));
            if self.model.rounds_with_queueing() >= self.params.max_startup_queue_rounds {
                self.model.set_full_bandwidth_reached();
            }
        }

        if !congestion_event.last_packet_send_state.is_app_limited && !has_bandwidth_growth {
            self.check_excessive_losses(congestion_event);
        }

        if self.model.full_bandwidth_reached() {
            Mode::Drain
        } else {
            Mode::Startup
        }
    }

    fn check_excessive_losses(&mut self, congestion_event: &Bbr2CongestionEvent) {
        if self.model.full_bandwidth_reached() {
            return;
        }

        // At the end of a round trip: was loss too high in this round?
        if self.model.is_inflight_too_high(
            &self.params,
            congestion_event,
            self.params.startup_full_loss_count,
        ) {
            let mut new_inflight_hi = self.model.bdp();
            if self.params.startup_loss_exit_use_max_delivered
                && new_inflight_hi < self.model.max_bytes_delivered_in_round()
            {
                new_inflight_hi = self.model.max_bytes_delivered_in_round();
            }
            self.model.set_inflight_hi(new_inflight_hi);
            self.model.set_full_bandwidth_reached();
        }
    }

    fn drain_on_congestion_event(&mut self, congestion_event: &Bbr2CongestionEvent) -> Mode {
        let drain_target = self.model.bdp();
        if congestion_event.bytes_in_flight <= drain_target {
            Mode::ProbeBw
        } else {
            Mode::Drain
        }
    }

    fn enter_mode(
        &mut self,
        now: Timestamp,
        random: &mut dyn random::Generator,
        publisher: &mut dyn Publisher,
    ) {
        match self.mode {
            Mode::Startup => {
                self.model.set_pacing_gain(self.params.startup_pacing_gain);
                self.model.set_cwnd_gain(self.params.startup_cwnd_gain);
            }
            Mode::Drain => {
                self.model.set_pacing_gain(self.params.drain_pacing_gain);
                self.model.set_cwnd_gain(self.params.drain_cwnd_gain);
            }
            Mode::ProbeBw => self.probe_bw_enter(now, random),
            Mode::ProbeRtt => self.probe_rtt_enter(),
        }
        publisher.on_bbr_mode_changed(self.mode, self.cycle.phase());
    }

    fn leave_mode(&mut self, _congestion_event: &Bbr2CongestionEvent) {
        if self.mode == Mode::Startup {
            // Clear bandwidth_lo if it was set during STARTUP.
            self.model.clear_bandwidth_lo();
        }
    }

    fn update_pacing_rate(&mut self, bytes_acked: u64, publisher: &mut dyn Publisher) {
        if self.bandwidth_estimate().is_zero() {
            return;
        }

        if self.model.total_bytes_acked() == bytes_acked {
            // After the very first ack, cwnd is still the initial window.
            self.pacing_rate = Bandwidth::new(self.cwnd, self.model.min_rtt());
            publisher.on_pacing_rate_updated(self.pacing_rate);
            return;
        }

        let target_rate = self.bandwidth_estimate() * self.model.pacing_gain();
        if self.model.full_bandwidth_reached() {
            self.pacing_rate = target_rate;
        } else if target_rate > self.pacing_rate {
            // Before full bandwidth the pacing rate only ever increases.
            self.pacing_rate = target_rate;
        }
        publisher.on_pacing_rate_updated(self.pacing_rate);
    }

    fn update_congestion_window(&mut self, bytes_acked: u64, publisher: &mut dyn Publisher) {
        let mut target_cwnd = self.get_target_congestion_window(self.model.cwnd_gain());

        let prior_cwnd = self.cwnd;
        if self.model.full_bandwidth_reached() {
            target_cwnd += self.model.max_ack_height();
            self.cwnd = target_cwnd.min(prior_cwnd + bytes_acked);
        } else if prior_cwnd < target_cwnd || prior_cwnd < 2 * self.initial_cwnd {
            self.cwnd = prior_cwnd + bytes_acked;
        }

        self.cwnd = self.cwnd.min(self.cwnd_limit_by_mode());
        self.cwnd = self
            .cwnd
            .clamp(self.params.min_congestion_window, self.params.max_congestion_window);
        publisher.on_congestion_window_updated(self.cwnd);
    }

    fn cwnd_limit_by_mode(&self) -> u64 {
        match self.mode {
            // STARTUP and DRAIN respect only the loss-derived lower bound
            Mode::Startup | Mode::Drain => self.model.inflight_lo(),
            Mode::ProbeBw => self.probe_bw_cwnd_limit(),
            Mode::ProbeRtt => self.probe_rtt_cwnd_limit(),
        }
    }

    pub(crate) fn get_target_congestion_window(&self, gain: Ratio<u64>) -> u64 {
        self.model
            .bdp_with_gain(self.bandwidth_estimate(), gain)
            .max(self.params.min_congestion_window)
    }

    fn on_enter_quiescence(&mut self, now: Timestamp) {
        self.last_quiescence_start = Some(now);
    }

    fn on_exit_quiescence(&mut self, now: Timestamp) {
        let Some(quiescence_start) = self.last_quiescence_start.take() else {
            return;
        };
        let quiescence_start = quiescence_start.min(now);
        match self.mode {
            Mode::ProbeBw => {
                // Do not let idle time eat into the probe-RTT deadline.
                self.model.postpone_min_rtt_timestamp(now - quiescence_start);
            }
            Mode::ProbeRtt => {
                if self.probe_rtt_exit_due(now) {
                    self.mode = Mode::ProbeBw;
                    self.probe_bw_reenter_after_probe_rtt(now);
                }
            }
            Mode::Startup | Mode::Drain => {}
        }
    }

    /// Returns true when the sender wants data beyond the congestion window
    /// to keep its bandwidth probe honest
    pub fn should_send_probing_packet(&self, bytes_in_flight: u64) -> bool {
        if !self.is_probing_for_bandwidth() {
            return false;
        }
        if self.params.flexible_app_limited {
            !self.is_pipe_sufficiently_full(bytes_in_flight)
        } else {
            true
        }
    }

    fn is_pipe_sufficiently_full(&self, bytes_in_flight: u64) -> bool {
        if self.mode == Mode::Startup {
            // STARTUP exits if it doesn't observe a 25% bandwidth increase,
            // so the cwnd must be more than 25% above the target.
            return bytes_in_flight >= self.get_target_congestion_window(Ratio::new_raw(3, 2));
        }
        if self.model.pacing_gain() > Ratio::new_raw(1, 1) {
            // Super-unity PROBE_BW doesn't exit until 1.25 * BDP is achieved.
            return bytes_in_flight
                >= self.get_target_congestion_window(self.model.pacing_gain());
        }
        // Above the target window the same or more bandwidth is observable.
        bytes_in_flight >= self.get_target_congestion_window(Ratio::new_raw(11, 10))
    }

    pub fn on_application_limited(&mut self, bytes_in_flight: u64) {
        if bytes_in_flight >= self.congestion_window() {
            return;
        }
        if self.params.flexible_app_limited && self.is_pipe_sufficiently_full(bytes_in_flight) {
            return;
        }
        self.model.on_app_limited();
    }

    /// Seeds the model from resumed network parameters. Only effective in
    /// STARTUP.
    pub fn adjust_network_parameters(
        &mut self,
        rtt: Duration,
        allow_cwnd_to_decrease: bool,
        publisher: &mut dyn Publisher,
    ) {
        self.model.update_network_parameters(rtt);

        if self.mode == Mode::Startup {
            let prior_cwnd = self.cwnd;
            // Jump the cwnd to the BDP rather than walking there one
            // congestion event at a time.
            self.cwnd = self.model.bdp();
            self.update_congestion_window(0, publisher);
            if !allow_cwnd_to_decrease {
                self.cwnd = self.cwnd.max(prior_cwnd);
            }
        }
    }

    pub fn debug_state(&self) -> DebugState {
        DebugState {
            mode: self.mode,
            cycle_phase: self.cycle.phase(),
            round_trip_count: self.model.round_trip_count(),
            bandwidth_est: self.bandwidth_estimate(),
            bandwidth_lo: self.model.bandwidth_lo(),
            bandwidth_hi: self.model.max_bandwidth(),
            inflight_lo: self.model.inflight_lo(),
            inflight_hi: self.model.inflight_hi(),
            max_ack_height: self.model.max_ack_height(),
            min_rtt: self.model.min_rtt(),
            congestion_window: self.cwnd,
            pacing_rate: self.pacing_rate,
            last_sample_is_app_limited: self.last_sample_is_app_limited,
        }
    }
}

#[cfg(test)]
mod tests;
