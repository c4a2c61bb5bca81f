// Copyright the tern-quic project authors. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Inter-packet spacing on top of the congestion controller.
//!
//! Packets leaving quiescence may burst unpaced up to the burst-token
//! budget; after that each send advances an ideal departure time by the
//! transfer time of the packet at the current pacing rate. Lumpy tokens
//! allow short multi-packet writes inside one pacing interval so the
//! sender is not woken per packet.

use crate::{
    recovery::{bandwidth::Bandwidth, congestion_controller::SendAlgorithm, MAX_SEGMENT_SIZE},
    time::Timestamp,
};
use core::{cmp::{max, min}, time::Duration};

/// Maximum burst out of quiescence, never exceeding the cwnd in packets
const INITIAL_UNPACED_BURST: u32 = 10;

/// Most packets a lumpy write may carry
const LUMPY_PACING_SIZE: u32 = 2;

/// Fraction of the cwnd a lumpy write may cover
const LUMPY_PACING_CWND_DIVISOR: u64 = 4;

/// Below this rate one full-sized packet is already ~10ms of queueing, so
/// lumpy writes collapse to a single packet
const LUMPY_PACING_MIN_BANDWIDTH: Bandwidth = Bandwidth::from_kbits_per_second(1200);

const ALARM_GRANULARITY: Duration = Duration::from_millis(1);

/// A shaper wrapping the congestion controller's send decisions
#[derive(Clone, Debug)]
pub struct PacingSender {
    /// Caps the pacing rate regardless of the sender; zero means unlimited
    max_pacing_rate: Bandwidth,
    burst_tokens: u32,
    ideal_next_packet_send_time: Option<Timestamp>,
    initial_burst_size: u32,
    lumpy_tokens: u32,
    alarm_granularity: Duration,
    /// True while sending is throttled by pacing rather than cwnd or the
    /// application
    pacing_limited: bool,
}

impl Default for PacingSender {
    fn default() -> Self {
        Self::new()
    }
}

impl PacingSender {
    pub fn new() -> Self {
        Self {
            max_pacing_rate: Bandwidth::ZERO,
            burst_tokens: INITIAL_UNPACED_BURST,
            ideal_next_packet_send_time: None,
            initial_burst_size: INITIAL_UNPACED_BURST,
            lumpy_tokens: 0,
            alarm_granularity: ALARM_GRANULARITY,
            pacing_limited: false,
        }
    }

    #[inline]
    pub fn burst_tokens(&self) -> u32 {
        self.burst_tokens
    }

    #[inline]
    pub fn ideal_next_packet_send_time(&self) -> Option<Timestamp> {
        self.ideal_next_packet_send_time
    }

    pub fn set_max_pacing_rate(&mut self, max_pacing_rate: Bandwidth) {
        self.max_pacing_rate = max_pacing_rate;
    }

    /// Replenishes the burst budget, e.g. from a resumed session
    pub fn set_burst_tokens<S: SendAlgorithm>(&mut self, sender: &S, burst_tokens: u32) {
        self.initial_burst_size = burst_tokens;
        self.burst_tokens = min(
            self.initial_burst_size,
            (sender.congestion_window() / u64::from(MAX_SEGMENT_SIZE)) as u32,
        );
    }

    /// Forwards a congestion event, clearing the burst budget when entering
    /// recovery
    #[allow(clippy::too_many_arguments)]
    pub fn on_congestion_event<S: SendAlgorithm>(
        &mut self,
        sender: &mut S,
        rtt_updated: bool,
        prior_in_flight: u64,
        event_time: Timestamp,
        acked_packets: &[crate::recovery::AckedPacket],
        lost_packets: &[crate::recovery::LostPacket],
        rtt_stats: &crate::recovery::rtt::RttStats,
        least_unacked: crate::packet::number::PacketNumber,
        random: &mut dyn crate::random::Generator,
        publisher: &mut dyn crate::recovery::congestion_controller::Publisher,
    ) {
        if !lost_packets.is_empty() {
            // Clear any burst tokens when entering recovery.
            self.burst_tokens = 0;
        }
        sender.on_congestion_event(
            rtt_updated,
            prior_in_flight,
            event_time,
            acked_packets,
            lost_packets,
            rtt_stats,
            least_unacked,
            random,
            publisher,
        );
    }

    pub fn on_packet_sent<S: SendAlgorithm>(
        &mut self,
        sender: &mut S,
        sent_time: Timestamp,
        bytes_in_flight: u64,
        packet_number: crate::packet::number::PacketNumber,
        bytes: u64,
        has_retransmittable_data: bool,
    ) {
        sender.on_packet_sent(
            sent_time,
            bytes_in_flight,
            packet_number,
            bytes,
            has_retransmittable_data,
        );
        if !has_retransmittable_data {
            return;
        }
        // If in recovery, the connection is not coming out of quiescence.
        if bytes_in_flight == 0 && !sender.in_recovery() {
            // Replenish the burst budget when leaving quiescence, limited to
            // a single bulk write and never more than the cwnd in packets.
            self.burst_tokens = min(
                self.initial_burst_size,
                (sender.congestion_window() / u64::from(MAX_SEGMENT_SIZE)) as u32,
            );
        }
        if self.burst_tokens > 0 {
            self.burst_tokens -= 1;
            self.pacing_limited = false;
            return;
        }
        // The next packet should be sent as soon as the current one has been
        // transferred. The pacing rate includes this packet in flight.
        let delay = self
            .pacing_rate(sender, bytes_in_flight + bytes)
            .transfer_time(bytes);
        if !self.pacing_limited || self.lumpy_tokens == 0 {
            // Reset lumpy_tokens if the application or the cwnd throttled
            // sending, or the tokens ran out.
            self.lumpy_tokens = max(
                1,
                min(
                    LUMPY_PACING_SIZE,
                    (sender.congestion_window()
                        / LUMPY_PACING_CWND_DIVISOR
                        / u64::from(MAX_SEGMENT_SIZE)) as u32,
                ),
            );
            if sender.bandwidth_estimate() < LUMPY_PACING_MIN_BANDWIDTH {
                // Below 1.2Mbps, send one packet at a time.
                self.lumpy_tokens = 1;
            }
        }
        self.lumpy_tokens -= 1;
        self.ideal_next_packet_send_time = Some(match self.ideal_next_packet_send_time {
            // Make up for lost time, since pacing was the limiter.
            Some(ideal) if self.pacing_limited => ideal + delay,
            Some(ideal) => max(ideal + delay, sent_time + delay),
            None => sent_time + delay,
        });
        // Stop making up for lost time once the sender prevents sending.
        self.pacing_limited = sender.can_send(bytes_in_flight + bytes);
    }

    /// The send is application limited; stop making up for lost time
    pub fn on_application_limited(&mut self) {
        self.pacing_limited = false;
    }

    /// How long to wait before the next send.
    ///
    /// `None` means the underlying sender prevents sending entirely;
    /// `Some(Duration::ZERO)` means send immediately.
    pub fn time_until_send<S: SendAlgorithm>(
        &self,
        sender: &S,
        now: Timestamp,
        bytes_in_flight: u64,
    ) -> Option<Duration> {
        if !sender.can_send(bytes_in_flight) {
            return None;
        }

        if self.burst_tokens > 0 || bytes_in_flight == 0 || self.lumpy_tokens > 0 {
            // Don't pace if burst tokens are available or leaving quiescence.
            return Some(Duration::ZERO);
        }

        match self.ideal_next_packet_send_time {
            // Inside the alarm granularity: send immediately.
            Some(ideal) if ideal > now + self.alarm_granularity => Some(ideal - now),
            _ => Some(Duration::ZERO),
        }
    }

    pub fn pacing_rate<S: SendAlgorithm>(&self, sender: &S, bytes_in_flight: u64) -> Bandwidth {
        if !self.max_pacing_rate.is_zero() {
            return self.max_pacing_rate.min(sender.pacing_rate(bytes_in_flight));
        }
        sender.pacing_rate(bytes_in_flight)
    }
}
