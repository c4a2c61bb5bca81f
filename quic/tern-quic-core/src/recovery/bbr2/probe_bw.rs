// Copyright the tern-quic project authors. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! The PROBE_BW cycle: DOWN drains the queue built while probing, CRUISE
//! holds the estimate with headroom for cross traffic, REFILL rebuilds a
//! full pipe without probing, and UP pushes `inflight_hi` upward until loss
//! or queueing says stop.

use crate::{
    random,
    recovery::{
        bbr2::{
            model::{Bbr2CongestionEvent, NetworkModel},
            Bbr2Sender, BwLoMode, Mode,
        },
        MAX_SEGMENT_SIZE,
    },
    time::Timestamp,
};
use core::time::Duration;
use num_rational::Ratio;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum CyclePhase {
    /// PROBE_BW has not been entered yet
    #[default]
    NotStarted,
    Up,
    Down,
    Cruise,
    Refill,
}

impl CyclePhase {
    /// True while the phase deliberately sends beyond the estimated BDP
    pub fn is_probing(self) -> bool {
        matches!(self, Self::Refill | Self::Up)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(super) enum AdaptUpperBoundsResult {
    AdaptedOk,
    AdaptedProbedTooHigh,
    NotAdaptedInvalidSample,
    NotAdaptedInflightHighNotSet,
}

/// Mutable state of the PROBE_BW cycle. It survives excursions into
/// PROBE_RTT so the cycle resumes where it left off.
#[derive(Clone, Debug)]
pub(super) struct Cycle {
    phase: CyclePhase,
    cycle_start_time: Option<Timestamp>,
    phase_start_time: Option<Timestamp>,
    rounds_in_phase: u64,
    /// Rounds since the last REFILL/UP probe; seeded randomly so flows
    /// sharing a bottleneck do not synchronize
    rounds_since_probe: u64,
    probe_wait_time: Option<Duration>,
    probe_up_rounds: u64,
    probe_up_bytes: u64,
    probe_up_acked: u64,
    /// Loss samples taken while probing may probe "too high"
    is_sample_from_probing: bool,
    last_cycle_probed_too_high: bool,
    last_cycle_stopped_risky_probe: bool,
    has_advanced_max_bw: bool,
}

impl Default for Cycle {
    fn default() -> Self {
        Self {
            phase: CyclePhase::NotStarted,
            cycle_start_time: None,
            phase_start_time: None,
            rounds_in_phase: 0,
            rounds_since_probe: 0,
            probe_wait_time: None,
            probe_up_rounds: 0,
            probe_up_bytes: u64::MAX,
            probe_up_acked: 0,
            is_sample_from_probing: false,
            last_cycle_probed_too_high: false,
            last_cycle_stopped_risky_probe: false,
            has_advanced_max_bw: false,
        }
    }
}

impl Cycle {
    #[inline]
    pub fn phase(&self) -> CyclePhase {
        self.phase
    }

    #[inline]
    pub fn is_probing_for_bandwidth(&self) -> bool {
        self.phase.is_probing()
    }
}

impl Bbr2Sender {
    pub(super) fn probe_bw_enter(&mut self, now: Timestamp, random: &mut dyn random::Generator) {
        if self.cycle.phase == CyclePhase::NotStarted {
            // First time entering PROBE_BW: start a new probing cycle.
            self.enter_probe_down(false, false, now, random);
        } else {
            // Transitioning back from PROBE_RTT: re-enter the phase that was
            // interrupted.
            debug_assert!(matches!(
                self.cycle.phase,
                CyclePhase::Cruise | CyclePhase::Refill
            ));
            self.probe_bw_reenter_after_probe_rtt(now);
        }
    }

    pub(super) fn probe_bw_reenter_after_probe_rtt(&mut self, now: Timestamp) {
        self.cycle.cycle_start_time = Some(now);
        match self.cycle.phase {
            CyclePhase::Refill => {
                let probe_up_rounds = self.cycle.probe_up_rounds;
                self.enter_probe_refill(probe_up_rounds, now);
            }
            _ => self.enter_probe_cruise(now),
        }
    }

    pub(super) fn probe_bw_on_congestion_event(
        &mut self,
        prior_in_flight: u64,
        congestion_event: &Bbr2CongestionEvent,
        random: &mut dyn random::Generator,
    ) -> Mode {
        debug_assert_ne!(self.cycle.phase, CyclePhase::NotStarted);

        if congestion_event.end_of_round_trip {
            if self.cycle.cycle_start_time != Some(congestion_event.event_time) {
                self.cycle.rounds_since_probe += 1;
            }
            if self.cycle.phase_start_time != Some(congestion_event.event_time) {
                self.cycle.rounds_in_phase += 1;
            }
        }

        let mut switch_to_probe_rtt = false;

        match self.cycle.phase {
            CyclePhase::Up => self.update_probe_up(prior_in_flight, congestion_event, random),
            CyclePhase::Down => {
                self.update_probe_down(congestion_event);
                // Only PROBE_DOWN may roll into PROBE_RTT, and only once it
                // has finished its own transition.
                if self.cycle.phase != CyclePhase::Down
                    && self.model.maybe_expire_min_rtt(&self.params, congestion_event)
                {
                    switch_to_probe_rtt = true;
                }
            }
            CyclePhase::Cruise => self.update_probe_cruise(congestion_event),
            CyclePhase::Refill => self.update_probe_refill(congestion_event),
            CyclePhase::NotStarted => {}
        }

        if !switch_to_probe_rtt {
            self.model.set_pacing_gain(self.pacing_gain_for_phase(self.cycle.phase));
            self.model.set_cwnd_gain(self.params.probe_bw_cwnd_gain);
        }

        if switch_to_probe_rtt {
            Mode::ProbeRtt
        } else {
            Mode::ProbeBw
        }
    }

    pub(super) fn probe_bw_cwnd_limit(&self) -> u64 {
        match self.cycle.phase {
            CyclePhase::Cruise => self
                .model
                .inflight_lo()
                .min(self.model.inflight_hi_with_headroom(&self.params)),
            CyclePhase::Up if self.params.probe_up_ignore_inflight_hi => {
                // Similar to STARTUP.
                self.model.inflight_lo()
            }
            _ => self.model.inflight_lo().min(self.model.inflight_hi()),
        }
    }

    fn pacing_gain_for_phase(&self, phase: CyclePhase) -> Ratio<u64> {
        match phase {
            CyclePhase::Up => self.params.probe_bw_probe_up_pacing_gain,
            CyclePhase::Down => self.params.probe_bw_probe_down_pacing_gain,
            _ => self.params.probe_bw_default_pacing_gain,
        }
    }

    fn update_probe_down(&mut self, congestion_event: &Bbr2CongestionEvent) {
        debug_assert_eq!(self.cycle.phase, CyclePhase::Down);

        if self.cycle.rounds_in_phase == 1 && congestion_event.end_of_round_trip {
            self.cycle.is_sample_from_probing = false;

            if !congestion_event.last_packet_send_state.is_app_limited {
                // One full round in PROBE_DOWN: the probe's samples are in
                // the filter, so the window can advance.
                self.model.advance_max_bandwidth_filter();
                self.cycle.has_advanced_max_bw = true;
            }

            if self.cycle.last_cycle_stopped_risky_probe && !self.cycle.last_cycle_probed_too_high {
                self.enter_probe_refill(0, congestion_event.event_time);
                return;
            }
        }

        self.maybe_adapt_upper_bounds(congestion_event);

        if self.is_time_to_probe_bandwidth(congestion_event) {
            self.enter_probe_refill(0, congestion_event.event_time);
            return;
        }

        if self.has_stayed_long_enough_in_probe_down(congestion_event) {
            self.enter_probe_cruise(congestion_event.event_time);
            return;
        }

        let inflight_with_headroom = self.model.inflight_hi_with_headroom(&self.params);
        if congestion_event.bytes_in_flight > inflight_with_headroom {
            // Stay in PROBE_DOWN.
            return;
        }

        // Transition to PROBE_CRUISE iff we've drained to target.
        if congestion_event.bytes_in_flight < self.model.bdp() {
            self.enter_probe_cruise(congestion_event.event_time);
        }
    }

    fn update_probe_cruise(&mut self, congestion_event: &Bbr2CongestionEvent) {
        debug_assert_eq!(self.cycle.phase, CyclePhase::Cruise);
        self.maybe_adapt_upper_bounds(congestion_event);
        debug_assert!(!self.cycle.is_sample_from_probing);

        if self.is_time_to_probe_bandwidth(congestion_event) {
            self.enter_probe_refill(0, congestion_event.event_time);
        }
    }

    fn update_probe_refill(&mut self, congestion_event: &Bbr2CongestionEvent) {
        debug_assert_eq!(self.cycle.phase, CyclePhase::Refill);
        self.maybe_adapt_upper_bounds(congestion_event);
        debug_assert!(!self.cycle.is_sample_from_probing);

        if self.cycle.rounds_in_phase > 0 && congestion_event.end_of_round_trip {
            self.enter_probe_up(congestion_event.event_time);
        }
    }

    fn update_probe_up(
        &mut self,
        prior_in_flight: u64,
        congestion_event: &Bbr2CongestionEvent,
        random: &mut dyn random::Generator,
    ) {
        debug_assert_eq!(self.cycle.phase, CyclePhase::Up);
        if self.maybe_adapt_upper_bounds(congestion_event)
            == AdaptUpperBoundsResult::AdaptedProbedTooHigh
        {
            self.enter_probe_down(true, false, congestion_event.event_time, random);
            return;
        }

        self.probe_inflight_high_upward(congestion_event);

        let mut is_risky = false;
        let mut is_queuing = false;
        if self.cycle.last_cycle_probed_too_high && prior_in_flight >= self.model.inflight_hi() {
            // The last probe ended badly and inflight is already back at the
            // ceiling it found.
            is_risky = true;
        } else if self.cycle.rounds_in_phase > 0 {
            if self.params.max_probe_up_queue_rounds > 0 {
                if congestion_event.end_of_round_trip {
                    self.model.check_persistent_queue(
                        congestion_event,
                        self.params.startup_full_bw_threshold,
                    );
                    if self.model.rounds_with_queueing() >= self.params.max_probe_up_queue_rounds {
                        is_queuing = true;
                    }
                }
            } else {
                let mut queuing_threshold_extra_bytes =
                    self.model.queueing_threshold_extra_bytes();
                if self.params.add_ack_height_to_queueing_threshold {
                    queuing_threshold_extra_bytes += self.model.max_ack_height();
                }
                let queuing_threshold = (self.params.startup_full_bw_threshold
                    * self.model.bdp())
                .to_integer()
                    + queuing_threshold_extra_bytes;
                is_queuing = congestion_event.bytes_in_flight >= queuing_threshold;
            }
        }

        if is_risky || is_queuing {
            self.enter_probe_down(false, is_risky, congestion_event.event_time, random);
        }
    }

    fn maybe_adapt_upper_bounds(
        &mut self,
        congestion_event: &Bbr2CongestionEvent,
    ) -> AdaptUpperBoundsResult {
        let send_state = congestion_event.last_packet_send_state;
        if !send_state.is_valid {
            return AdaptUpperBoundsResult::NotAdaptedInvalidSample;
        }

        let inflight_at_send = send_state.bytes_in_flight;
        if self.model.is_inflight_too_high(
            &self.params,
            congestion_event,
            self.params.probe_bw_full_loss_count,
        ) {
            if self.cycle.is_sample_from_probing {
                self.cycle.is_sample_from_probing = false;
                if !send_state.is_app_limited || self.params.max_probe_up_queue_rounds > 0 {
                    let one_minus_beta = Ratio::new_raw(1, 1) - self.params.beta;
                    let inflight_target =
                        (one_minus_beta * self.target_bytes_inflight()).to_integer();
                    let new_inflight_hi = inflight_at_send.max(inflight_target);
                    self.model.set_inflight_hi(new_inflight_hi);
                }
                return AdaptUpperBoundsResult::AdaptedProbedTooHigh;
            }
            return AdaptUpperBoundsResult::AdaptedOk;
        }

        if self.model.inflight_hi() == NetworkModel::inflight_hi_default() {
            return AdaptUpperBoundsResult::NotAdaptedInflightHighNotSet;
        }

        // Raise the upper bound for inflight.
        if inflight_at_send > self.model.inflight_hi() {
            self.model.set_inflight_hi(inflight_at_send);
        }
        AdaptUpperBoundsResult::AdaptedOk
    }

    fn is_time_to_probe_bandwidth(&self, congestion_event: &Bbr2CongestionEvent) -> bool {
        if self.has_cycle_lasted(self.cycle.probe_wait_time, congestion_event) {
            return true;
        }
        self.is_time_to_probe_for_reno_coexistence(Ratio::new_raw(1, 1))
    }

    /// Prevents a flow from staying in PROBE_DOWN for more than a min RTT,
    /// as seen in multi-sender paths
    fn has_stayed_long_enough_in_probe_down(
        &self,
        congestion_event: &Bbr2CongestionEvent,
    ) -> bool {
        self.has_phase_lasted(self.model.min_rtt(), congestion_event)
    }

    fn has_cycle_lasted(
        &self,
        duration: Option<Duration>,
        congestion_event: &Bbr2CongestionEvent,
    ) -> bool {
        match (self.cycle.cycle_start_time, duration) {
            (Some(start), Some(duration)) => congestion_event.event_time - start > duration,
            _ => false,
        }
    }

    fn has_phase_lasted(&self, duration: Duration, congestion_event: &Bbr2CongestionEvent) -> bool {
        self.cycle
            .phase_start_time
            .map_or(false, |start| congestion_event.event_time - start > duration)
    }

    fn is_time_to_probe_for_reno_coexistence(&self, probe_wait_fraction: Ratio<u64>) -> bool {
        if !self.params.enable_reno_coexistence {
            return false;
        }

        let mut rounds = self.params.probe_bw_probe_max_rounds;
        let reno_gain = self.params.probe_bw_probe_reno_gain;
        if reno_gain > Ratio::new_raw(0, 1) {
            let reno_rounds = (reno_gain * self.target_bytes_inflight()).to_integer()
                / u64::from(MAX_SEGMENT_SIZE);
            rounds = rounds.min(reno_rounds);
        }
        self.cycle.rounds_since_probe >= (probe_wait_fraction * rounds).to_integer()
    }

    fn raise_inflight_high_slope(&mut self) {
        debug_assert_eq!(self.cycle.phase, CyclePhase::Up);
        let growth_this_round = 1u64 << self.cycle.probe_up_rounds.min(30);
        // Capping the rounds at 30 bounds the slope; at that point
        // inflight_hi grows by roughly one packet per packet acked.
        self.cycle.probe_up_rounds = (self.cycle.probe_up_rounds + 1).min(30);
        let probe_up_bytes = self.congestion_window() / growth_this_round;
        self.cycle.probe_up_bytes = probe_up_bytes.max(u64::from(MAX_SEGMENT_SIZE));
    }

    fn probe_inflight_high_upward(&mut self, congestion_event: &Bbr2CongestionEvent) {
        debug_assert_eq!(self.cycle.phase, CyclePhase::Up);
        if self.params.probe_up_ignore_inflight_hi {
            // inflight_hi is not in force during PROBE_UP; nothing to raise.
            return;
        }

        if congestion_event.prior_bytes_in_flight < congestion_event.prior_cwnd {
            // Not fully utilizing cwnd, so can't safely grow.
            return;
        }
        if congestion_event.prior_cwnd < self.model.inflight_hi() {
            // Not fully using inflight_hi, so don't grow it.
            return;
        }

        // Increase inflight_hi by one MSS per probe_up_bytes of acked data.
        self.cycle.probe_up_acked += congestion_event.bytes_acked;
        if self.cycle.probe_up_acked >= self.cycle.probe_up_bytes {
            let delta = self.cycle.probe_up_acked / self.cycle.probe_up_bytes;
            self.cycle.probe_up_acked -= delta * self.cycle.probe_up_bytes;
            let new_inflight_hi = self
                .model
                .inflight_hi()
                .saturating_add(delta * u64::from(MAX_SEGMENT_SIZE));
            if new_inflight_hi > self.model.inflight_hi() {
                self.model.set_inflight_hi(new_inflight_hi);
            }
        }

        if congestion_event.end_of_round_trip {
            self.raise_inflight_high_slope();
        }
    }

    fn enter_probe_down(
        &mut self,
        probed_too_high: bool,
        stopped_risky_probe: bool,
        now: Timestamp,
        random: &mut dyn random::Generator,
    ) {
        self.cycle.last_cycle_probed_too_high = probed_too_high;
        self.cycle.last_cycle_stopped_risky_probe = stopped_risky_probe;

        self.cycle.cycle_start_time = Some(now);
        self.cycle.phase = CyclePhase::Down;
        self.cycle.rounds_in_phase = 0;
        self.cycle.phase_start_time = Some(now);

        if self.params.bw_lo_mode != BwLoMode::Default {
            // Losses in PROBE_UP should not permanently depress
            // bandwidth_lo; a valid value will be quickly rediscovered.
            self.model.clear_bandwidth_lo();
        }

        // Pick the next probe wait time.
        self.cycle.rounds_since_probe =
            random.next_u64_below(self.params.probe_bw_max_probe_rand_rounds);
        let max_rand_micros = self.params.probe_bw_probe_max_rand_duration.as_micros() as u64;
        self.cycle.probe_wait_time = Some(
            self.params.probe_bw_probe_base_duration
                + Duration::from_micros(random.next_u64_below(max_rand_micros)),
        );

        self.cycle.probe_up_bytes = u64::MAX;
        self.cycle.has_advanced_max_bw = false;
        self.model.restart_round_early();
    }

    fn enter_probe_cruise(&mut self, now: Timestamp) {
        if self.cycle.phase == CyclePhase::Down {
            self.exit_probe_down();
        }
        let inflight_hi = self.model.inflight_hi();
        self.model.cap_inflight_lo(&self.params, inflight_hi);

        self.cycle.phase = CyclePhase::Cruise;
        self.cycle.rounds_in_phase = 0;
        self.cycle.phase_start_time = Some(now);
        self.cycle.is_sample_from_probing = false;
    }

    fn enter_probe_refill(&mut self, probe_up_rounds: u64, now: Timestamp) {
        if self.cycle.phase == CyclePhase::Down {
            self.exit_probe_down();
        }
        self.cycle.phase = CyclePhase::Refill;
        self.cycle.rounds_in_phase = 0;
        self.cycle.phase_start_time = Some(now);
        self.cycle.is_sample_from_probing = false;
        self.cycle.last_cycle_stopped_risky_probe = false;

        self.model.clear_bandwidth_lo();
        self.model.clear_inflight_lo();
        self.model.clear_rounds_with_queueing();
        self.cycle.probe_up_rounds = probe_up_rounds;
        self.cycle.probe_up_acked = 0;
        self.model.restart_round_early();
    }

    fn enter_probe_up(&mut self, now: Timestamp) {
        debug_assert_eq!(self.cycle.phase, CyclePhase::Refill);
        self.cycle.phase = CyclePhase::Up;
        self.cycle.rounds_in_phase = 0;
        self.cycle.phase_start_time = Some(now);
        self.cycle.is_sample_from_probing = true;
        self.raise_inflight_high_slope();
        self.model.restart_round_early();
    }

    fn exit_probe_down(&mut self) {
        debug_assert_eq!(self.cycle.phase, CyclePhase::Down);
        if !self.cycle.has_advanced_max_bw {
            self.model.advance_max_bandwidth_filter();
            self.cycle.has_advanced_max_bw = true;
        }
    }
}
