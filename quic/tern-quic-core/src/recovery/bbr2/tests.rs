// Copyright the tern-quic project authors. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use super::*;
use crate::{
    random::testing::Generator,
    recovery::{bbr2::model::RoundTripCounter, congestion_controller::NoopPublisher},
    time::{testing, Clock},
};

const MSS: u64 = MAX_SEGMENT_SIZE as u64;

/// Drives a `Bbr2Sender` through send-a-window / ack-a-window rounds over
/// a path with fixed RTT
struct Harness {
    sender: Bbr2Sender,
    clock: testing::Clock,
    random: Generator,
    publisher: NoopPublisher,
    next_packet_number: u64,
    bytes_in_flight: u64,
    outstanding: Vec<(PacketNumber, u64)>,
    rtt: Duration,
}

impl Harness {
    fn new(rtt: Duration) -> Self {
        Self::with_params(rtt, Params::default())
    }

    fn with_params(rtt: Duration, params: Params) -> Self {
        Self {
            sender: Bbr2Sender::new(&RttStats::default(), 32, params),
            clock: testing::Clock::default(),
            random: Generator::default(),
            publisher: NoopPublisher,
            next_packet_number: 1,
            bytes_in_flight: 0,
            outstanding: Vec::new(),
            rtt,
        }
    }

    fn send_packet(&mut self, bytes: u64) {
        let packet_number = PacketNumber::new(self.next_packet_number).unwrap();
        self.next_packet_number += 1;
        self.sender.on_packet_sent(
            self.clock.get_time(),
            self.bytes_in_flight,
            packet_number,
            bytes,
            true,
        );
        self.bytes_in_flight += bytes;
        self.outstanding.push((packet_number, bytes));
    }

    /// Advances one RTT and acks everything outstanding in a single event
    fn ack_outstanding(&mut self) {
        self.clock.inc_by(self.rtt);
        let acked: Vec<AckedPacket> = self
            .outstanding
            .drain(..)
            .map(|(packet_number, bytes)| AckedPacket {
                packet_number,
                bytes_acked: bytes,
                receive_timestamp: Some(self.clock.get_time()),
            })
            .collect();
        let prior_in_flight = self.bytes_in_flight;
        self.bytes_in_flight = 0;
        let least_unacked = PacketNumber::new(self.next_packet_number).unwrap();
        self.sender.on_congestion_event(
            prior_in_flight,
            self.clock.get_time(),
            &acked,
            &[],
            least_unacked,
            &mut self.random,
            &mut self.publisher,
        );
    }

    /// One full round: send `packets`, then ack them one RTT later
    fn round(&mut self, packets: u64) {
        for _ in 0..packets {
            self.send_packet(MSS);
        }
        self.ack_outstanding();
    }
}

/// Constant bandwidth produces no growth; STARTUP must exit to DRAIN and,
/// with an empty pipe, fall straight through to PROBE_BW_DOWN within the
/// same ack event
#[test]
fn startup_exits_on_bandwidth_plateau() {
    let mut harness = Harness::new(Duration::from_millis(100));
    assert_eq!(harness.sender.mode(), Mode::Startup);
    assert!(harness.sender.in_slow_start());

    let mut rounds = 0;
    while harness.sender.mode() == Mode::Startup {
        harness.round(10);
        rounds += 1;
        assert!(rounds < 8, "STARTUP failed to exit on a bandwidth plateau");
    }

    // the exit requires the configured number of consecutive no-growth
    // rounds after the first valid (non app-limited) sample
    assert!(rounds > Params::default().startup_full_bw_rounds as usize);
    assert!(harness.sender.model().full_bandwidth_reached());

    // DRAIN observed an empty pipe and handed off to PROBE_BW immediately
    assert_eq!(harness.sender.mode(), Mode::ProbeBw);
    assert_eq!(harness.sender.cycle_phase(), CyclePhase::Down);
}

/// Before full bandwidth is reached, cwnd grows by the bytes acked
#[test]
fn startup_cwnd_grows_by_bytes_acked() {
    let mut harness = Harness::new(Duration::from_millis(100));
    let prior_cwnd = harness.sender.congestion_window();
    harness.round(10);
    assert_eq!(
        harness.sender.congestion_window(),
        prior_cwnd + 10 * MSS
    );
}

#[test]
fn startup_gains_are_high() {
    let harness = Harness::new(Duration::from_millis(100));
    assert_eq!(
        harness.sender.model().pacing_gain(),
        Ratio::new_raw(577, 200)
    );
    assert_eq!(harness.sender.model().cwnd_gain(), Ratio::new_raw(577, 200));
}

/// Enough loss events within a single round force a STARTUP exit that
/// seeds `inflight_hi`
#[test]
fn startup_exits_on_excessive_loss() {
    let mut harness = Harness::new(Duration::from_millis(100));

    // establish a baseline bandwidth first; the very first round is
    // discounted as app limited
    harness.round(10);
    harness.round(10);
    assert_eq!(harness.sender.mode(), Mode::Startup);

    // send a large window for the loss round
    for _ in 0..20 {
        harness.send_packet(MSS);
    }
    let mut outstanding: Vec<(PacketNumber, u64)> = harness.outstanding.drain(..).collect();
    let newest = *outstanding.last().unwrap();

    // the first ack closes the previous round; the loss events that follow
    // all land inside the new round
    let deliver = |harness: &mut Harness,
                       acked: Vec<(PacketNumber, u64)>,
                       lost: Vec<(PacketNumber, u64)>| {
        harness.clock.inc_by(Duration::from_millis(10));
        let bytes_freed: u64 = acked.iter().map(|(_, bytes)| bytes).sum::<u64>()
            + lost.iter().map(|(_, bytes)| bytes).sum::<u64>();
        let acked: Vec<AckedPacket> = acked
            .into_iter()
            .map(|(packet_number, bytes)| AckedPacket {
                packet_number,
                bytes_acked: bytes,
                receive_timestamp: Some(harness.clock.get_time()),
            })
            .collect();
        let lost: Vec<LostPacket> = lost
            .into_iter()
            .map(|(packet_number, bytes)| LostPacket {
                packet_number,
                bytes_lost: bytes,
            })
            .collect();
        let prior_in_flight = harness.bytes_in_flight;
        harness.bytes_in_flight -= bytes_freed;
        let least_unacked = PacketNumber::new(harness.next_packet_number).unwrap();
        harness.sender.on_congestion_event(
            prior_in_flight,
            harness.clock.get_time(),
            &acked,
            &lost,
            least_unacked,
            &mut harness.random,
            &mut harness.publisher,
        );
    };

    deliver(&mut harness, vec![outstanding.remove(0)], vec![]);

    // eight separate loss events within the round
    let loss_events = Params::default().startup_full_loss_count;
    for _ in 0..loss_events {
        let acked = outstanding.remove(0);
        let lost = outstanding.remove(outstanding.len() / 2);
        deliver(&mut harness, vec![acked], vec![lost]);
    }
    assert_eq!(harness.sender.mode(), Mode::Startup);
    assert_eq!(harness.sender.model().loss_events_in_round(), loss_events);

    // acking the newest sent packet ends the round and runs the loss check
    assert_eq!(newest.0, PacketNumber::new(harness.next_packet_number - 1).unwrap());
    harness.clock.inc_by(Duration::from_millis(100));
    deliver(&mut harness, outstanding, vec![]);

    assert_ne!(harness.sender.mode(), Mode::Startup);
    assert!(harness.sender.model().full_bandwidth_reached());
    // the loss-based exit leaves a finite probe ceiling behind
    assert_ne!(
        harness.sender.model().inflight_hi(),
        u64::MAX,
        "loss exit must seed inflight_hi"
    );
}

/// The PROBE_BW cycle leaves DOWN once inflight drains below the BDP
#[test]
fn probe_bw_down_transitions_to_cruise_when_drained() {
    let mut harness = Harness::new(Duration::from_millis(100));
    while harness.sender.mode() == Mode::Startup {
        harness.round(10);
    }
    assert_eq!(harness.sender.cycle_phase(), CyclePhase::Down);

    // an ack event with an empty pipe satisfies the drain target
    harness.round(2);
    assert_eq!(harness.sender.mode(), Mode::ProbeBw);
    assert!(matches!(
        harness.sender.cycle_phase(),
        CyclePhase::Cruise | CyclePhase::Refill
    ));
}

/// The pacing rate never goes to zero and follows the startup gain while
/// bandwidth grows
#[test]
fn pacing_rate_is_always_positive() {
    let mut harness = Harness::new(Duration::from_millis(100));
    assert!(!harness.sender.pacing_rate().is_zero());

    for _ in 0..8 {
        harness.round(10);
        assert!(!harness.sender.pacing_rate().is_zero());
        assert!(harness.sender.congestion_window() > 0);
    }
}

#[test]
fn connection_options_map_to_params() {
    let mut options = ConnectionOptions::default();
    options.push(Tag::BSAO);
    options.push(Tag::B2NA);
    options.push(Tag::B2RP);
    options.push(Tag::BBR9);

    let mut params = Params::default();
    params.apply_connection_options(&options);
    assert!(params.overestimate_avoidance);
    assert!(!params.add_ack_height_to_queueing_threshold);
    assert!(!params.avoid_unnecessary_probe_rtt);
    assert!(params.flexible_app_limited);
}

#[test]
fn round_trip_counter_advances_on_ack_of_newest_sent() {
    let mut counter = RoundTripCounter::default();
    let pn = |value: u64| PacketNumber::new(value).unwrap();

    counter.on_packet_sent(pn(1));
    counter.on_packet_sent(pn(2));

    // first ack always starts a round
    assert!(counter.on_packets_acked(pn(1)));
    assert_eq!(counter.round_trip_count(), 1);

    // packet 2 was the newest sent when the round started; acking it ends
    // the round
    assert!(!counter.on_packets_acked(pn(2)));
    counter.on_packet_sent(pn(3));
    assert!(counter.on_packets_acked(pn(3)));
    assert_eq!(counter.round_trip_count(), 2);
}

#[test]
fn max_bandwidth_filter_spans_two_cycles() {
    let mut filter = model::MaxBandwidthFilter::default();
    let fast = Bandwidth::from_kbits_per_second(10_000);
    let slow = Bandwidth::from_kbits_per_second(1_000);

    filter.update(fast);
    assert_eq!(filter.get(), fast);

    // the fast sample survives one advance
    filter.advance();
    filter.update(slow);
    assert_eq!(filter.get(), fast);

    // and falls out after the second
    filter.advance();
    filter.update(slow);
    assert_eq!(filter.get(), slow);
}

#[test]
fn min_rtt_filter_force_update_accepts_larger_sample() {
    let now = crate::time::NoopClock.get_time();
    let mut filter = model::MinRttFilter::new(Duration::from_millis(100), Some(now));

    filter.update(Duration::from_millis(200), now);
    assert_eq!(filter.get(), Duration::from_millis(100));

    filter.force_update(Duration::from_millis(200), now);
    assert_eq!(filter.get(), Duration::from_millis(200));
}

/// An expired min_rtt pulls PROBE_BW into PROBE_RTT, which holds at the
/// minimum window and returns to PROBE_BW after its duration
#[test]
fn probe_rtt_drain_then_exit() {
    // B2RP semantics: do not postpone the probe-RTT deadline over idle time
    let params = Params {
        avoid_unnecessary_probe_rtt: false,
        ..Params::default()
    };
    let mut harness = Harness::with_params(Duration::from_millis(100), params);
    while harness.sender.mode() == Mode::Startup {
        harness.round(10);
    }
    assert_eq!(harness.sender.mode(), Mode::ProbeBw);

    // advance far beyond the probe-RTT period; the next round's samples
    // cannot refresh the (equal) min_rtt, so the deadline expires
    harness.clock.inc_by(params.probe_rtt_period + Duration::from_secs(1));
    harness.round(10);
    assert_eq!(harness.sender.mode(), Mode::ProbeRtt);
    // PROBE_RTT caps the window at its inflight target
    assert_eq!(
        harness.sender.congestion_window(),
        params.min_congestion_window
    );

    // the drained pipe schedules the exit; once the duration passes the
    // sender resumes the PROBE_BW cycle
    harness.round(1);
    harness.clock.inc_by(params.probe_rtt_duration * 2);
    harness.round(1);
    assert_eq!(harness.sender.mode(), Mode::ProbeBw);
}
