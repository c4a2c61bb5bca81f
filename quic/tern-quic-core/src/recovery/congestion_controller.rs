// Copyright the tern-quic project authors. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use crate::{
    packet::number::PacketNumber,
    random,
    recovery::{
        bandwidth::Bandwidth,
        bbr2::{self, Bbr2Sender},
        cubic::CubicSender,
        rtt::RttStats,
        AckedPacket, LostPacket,
    },
    time::Timestamp,
};
use core::time::Duration;

/// Observability surface for congestion control decisions.
///
/// The session supplies an implementation per call; events carry enough
/// context to be emitted without reaching back into the controller.
pub trait Publisher {
    /// Invoked when the BBR mode machine changes state
    fn on_bbr_mode_changed(&mut self, _mode: bbr2::Mode, _cycle_phase: bbr2::CyclePhase) {}

    /// Invoked when the pacing rate has been updated
    fn on_pacing_rate_updated(&mut self, _pacing_rate: Bandwidth) {}

    /// Invoked when the congestion window has been updated
    fn on_congestion_window_updated(&mut self, _congestion_window: u64) {}
}

/// A publisher that drops every event
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopPublisher;

impl Publisher for NoopPublisher {}

/// An algorithm for controlling congestion.
///
/// All inputs arrive through the owning session: sent packets, bundled
/// ack/loss congestion events, and app-limited signals. Implementations
/// never fail; anomalies are absorbed with conservative defaults.
pub trait SendAlgorithm {
    /// Invoked once per incoming ack with the bundled newly-acked and
    /// newly-lost packets, in ascending packet-number order
    #[allow(clippy::too_many_arguments)]
    fn on_congestion_event(
        &mut self,
        rtt_updated: bool,
        prior_in_flight: u64,
        event_time: Timestamp,
        acked_packets: &[AckedPacket],
        lost_packets: &[LostPacket],
        rtt_stats: &RttStats,
        least_unacked: PacketNumber,
        random: &mut dyn random::Generator,
        publisher: &mut dyn Publisher,
    );

    /// Invoked when a packet is sent. `bytes_in_flight` excludes the packet
    /// being sent.
    fn on_packet_sent(
        &mut self,
        sent_time: Timestamp,
        bytes_in_flight: u64,
        packet_number: PacketNumber,
        bytes: u64,
        has_retransmittable_data: bool,
    );

    /// Invoked when a packet is neutered; its bytes stop counting anywhere
    fn on_packet_neutered(&mut self, packet_number: PacketNumber);

    /// Invoked when the retransmission timer fires
    fn on_retransmission_timeout(&mut self, packets_retransmitted: bool);

    /// Returns true if the congestion window permits sending
    fn can_send(&self, bytes_in_flight: u64) -> bool;

    /// The rate packets should leave at, given the in-flight volume
    fn pacing_rate(&self, bytes_in_flight: u64) -> Bandwidth;

    /// The current estimate of the path bandwidth
    fn bandwidth_estimate(&self) -> Bandwidth;

    /// The congestion window in bytes
    fn congestion_window(&self) -> u64;

    fn in_slow_start(&self) -> bool;

    fn in_recovery(&self) -> bool;

    /// True if the sender wants a packet beyond the window to keep its
    /// bandwidth probe honest
    fn should_send_probing_packet(&self, bytes_in_flight: u64) -> bool;

    /// Invoked when the application has nothing more to send even though
    /// the window permits more bytes
    fn on_application_limited(&mut self, bytes_in_flight: u64);
}

/// The congestion controller selected at connection creation.
///
/// A tagged sum rather than a boxed trait object: the variants are known
/// statically and the dispatch stays inlineable.
#[derive(Clone, Debug)]
pub enum CongestionController {
    Bbr2(Bbr2Sender),
    Cubic(CubicSender),
}

/// A point-in-time snapshot for logs and tests
#[derive(Clone, Debug)]
pub enum DebugState {
    Bbr2(bbr2::DebugState),
    Cubic {
        congestion_window: u64,
        slowstart_threshold: u64,
        in_recovery: bool,
    },
}

impl CongestionController {
    pub fn new_bbr2(
        rtt_stats: &RttStats,
        initial_cwnd_in_packets: u64,
        params: bbr2::Params,
    ) -> Self {
        Self::Bbr2(Bbr2Sender::new(rtt_stats, initial_cwnd_in_packets, params))
    }

    pub fn new_cubic(
        rtt_stats: &RttStats,
        initial_cwnd_in_packets: u64,
        max_cwnd_in_packets: u64,
    ) -> Self {
        Self::Cubic(CubicSender::new(
            rtt_stats,
            initial_cwnd_in_packets,
            max_cwnd_in_packets,
        ))
    }

    pub fn debug_state(&self) -> DebugState {
        match self {
            Self::Bbr2(sender) => DebugState::Bbr2(sender.debug_state()),
            Self::Cubic(sender) => DebugState::Cubic {
                congestion_window: sender.congestion_window(),
                slowstart_threshold: sender.slowstart_threshold(),
                in_recovery: sender.in_recovery(),
            },
        }
    }

    /// Seeds the controller from resumed network parameters. The resumed
    /// bandwidth itself is not trusted; only the RTT seeds the model.
    pub fn adjust_network_parameters(
        &mut self,
        rtt: Duration,
        allow_cwnd_to_decrease: bool,
        publisher: &mut dyn Publisher,
    ) {
        match self {
            Self::Bbr2(sender) => {
                sender.adjust_network_parameters(rtt, allow_cwnd_to_decrease, publisher)
            }
            // The cubic sender has no model to seed; resumption only
            // affects its initial window, set at construction.
            Self::Cubic(_) => {}
        }
    }
}

impl SendAlgorithm for CongestionController {
    fn on_congestion_event(
        &mut self,
        rtt_updated: bool,
        prior_in_flight: u64,
        event_time: Timestamp,
        acked_packets: &[AckedPacket],
        lost_packets: &[LostPacket],
        rtt_stats: &RttStats,
        least_unacked: PacketNumber,
        random: &mut dyn random::Generator,
        publisher: &mut dyn Publisher,
    ) {
        match self {
            Self::Bbr2(sender) => sender.on_congestion_event(
                prior_in_flight,
                event_time,
                acked_packets,
                lost_packets,
                least_unacked,
                random,
                publisher,
            ),
            Self::Cubic(sender) => sender.on_congestion_event(
                rtt_updated,
                prior_in_flight,
                event_time,
                acked_packets,
                lost_packets,
                rtt_stats,
            ),
        }
    }

    fn on_packet_sent(
        &mut self,
        sent_time: Timestamp,
        bytes_in_flight: u64,
        packet_number: PacketNumber,
        bytes: u64,
        has_retransmittable_data: bool,
    ) {
        match self {
            Self::Bbr2(sender) => sender.on_packet_sent(
                sent_time,
                bytes_in_flight,
                packet_number,
                bytes,
                has_retransmittable_data,
            ),
            Self::Cubic(sender) => sender.on_packet_sent(
                sent_time,
                bytes_in_flight,
                packet_number,
                bytes,
                has_retransmittable_data,
            ),
        }
    }

    fn on_packet_neutered(&mut self, packet_number: PacketNumber) {
        match self {
            Self::Bbr2(sender) => sender.on_packet_neutered(packet_number),
            Self::Cubic(_) => {}
        }
    }

    fn on_retransmission_timeout(&mut self, packets_retransmitted: bool) {
        match self {
            Self::Bbr2(_) => {}
            Self::Cubic(sender) => sender.on_retransmission_timeout(packets_retransmitted),
        }
    }

    fn can_send(&self, bytes_in_flight: u64) -> bool {
        match self {
            Self::Bbr2(sender) => sender.can_send(bytes_in_flight),
            Self::Cubic(sender) => sender.can_send(bytes_in_flight),
        }
    }

    fn pacing_rate(&self, bytes_in_flight: u64) -> Bandwidth {
        match self {
            Self::Bbr2(sender) => sender.pacing_rate(),
            Self::Cubic(sender) => sender.pacing_rate(bytes_in_flight),
        }
    }

    fn bandwidth_estimate(&self) -> Bandwidth {
        match self {
            Self::Bbr2(sender) => sender.bandwidth_estimate(),
            Self::Cubic(sender) => sender.bandwidth_estimate(),
        }
    }

    fn congestion_window(&self) -> u64 {
        match self {
            Self::Bbr2(sender) => sender.congestion_window(),
            Self::Cubic(sender) => sender.congestion_window(),
        }
    }

    fn in_slow_start(&self) -> bool {
        match self {
            Self::Bbr2(sender) => sender.in_slow_start(),
            Self::Cubic(sender) => sender.in_slow_start(),
        }
    }

    fn in_recovery(&self) -> bool {
        match self {
            // BBRv2 has no recovery state; loss response flows through the
            // model's lower bounds instead.
            Self::Bbr2(_) => false,
            Self::Cubic(sender) => sender.in_recovery(),
        }
    }

    fn should_send_probing_packet(&self, bytes_in_flight: u64) -> bool {
        match self {
            Self::Bbr2(sender) => sender.should_send_probing_packet(bytes_in_flight),
            Self::Cubic(_) => false,
        }
    }

    fn on_application_limited(&mut self, bytes_in_flight: u64) {
        match self {
            Self::Bbr2(sender) => sender.on_application_limited(bytes_in_flight),
            Self::Cubic(sender) => sender.on_application_limited(bytes_in_flight),
        }
    }
}
