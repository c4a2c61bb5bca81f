// Copyright the tern-quic project authors. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! PROBE_RTT drains the pipe to a minimal inflight target so a genuine
//! round-trip floor can be observed, then returns to the PROBE_BW phase
//! that was interrupted.

use crate::recovery::bbr2::{model::Bbr2CongestionEvent, Bbr2Sender, Mode};
use crate::time::Timestamp;
use num_rational::Ratio;

#[derive(Clone, Copy, Debug, Default)]
pub(super) struct State {
    /// Set once inflight has drained to the target; PROBE_RTT ends when the
    /// clock passes it
    exit_time: Option<Timestamp>,
}

impl Bbr2Sender {
    pub(super) fn probe_rtt_enter(&mut self) {
        self.model.set_pacing_gain(Ratio::new_raw(1, 1));
        self.model.set_cwnd_gain(self.params.probe_rtt_cwnd_gain);
        self.probe_rtt.exit_time = None;
    }

    pub(super) fn probe_rtt_on_congestion_event(
        &mut self,
        congestion_event: &Bbr2CongestionEvent,
    ) -> Mode {
        match self.probe_rtt.exit_time {
            None => {
                if congestion_event.bytes_in_flight <= self.probe_rtt_inflight_target() {
                    // The pipe is drained; hold here for the full duration.
                    self.probe_rtt.exit_time =
                        Some(congestion_event.event_time + self.params.probe_rtt_duration);
                }
                Mode::ProbeRtt
            }
            Some(exit_time) => {
                if congestion_event.event_time > exit_time {
                    Mode::ProbeBw
                } else {
                    Mode::ProbeRtt
                }
            }
        }
    }

    /// The inflight volume PROBE_RTT drains to: the minimum window
    pub(super) fn probe_rtt_inflight_target(&self) -> u64 {
        self.params.min_congestion_window
    }

    pub(super) fn probe_rtt_cwnd_limit(&self) -> u64 {
        self.probe_rtt_inflight_target()
    }

    /// Returns true if a quiescent period outlasted the PROBE_RTT hold
    pub(super) fn probe_rtt_exit_due(&self, now: Timestamp) -> bool {
        self.probe_rtt
            .exit_time
            .map_or(false, |exit_time| now > exit_time)
    }
}
