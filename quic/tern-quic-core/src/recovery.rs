// Copyright the tern-quic project authors. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use crate::{packet::number::PacketNumber, time::Timestamp};
use core::time::Duration;

pub mod bandwidth;
pub mod bbr2;
pub mod congestion_controller;
pub mod cubic;
pub mod loss;
pub mod pacing;
pub mod rtt;
pub mod sampler;
pub mod unacked;
pub mod windowed_filter;

pub use bandwidth::Bandwidth;
pub use congestion_controller::{CongestionController, SendAlgorithm};
pub use rtt::RttStats;
pub use unacked::{TransmissionInfo, UnackedPacketMap};

/// The smallest granularity loss and pacing timers operate at
pub const GRANULARITY: Duration = Duration::from_millis(1);

/// The default maximum segment size in bytes
pub const MAX_SEGMENT_SIZE: u16 = 1460;

/// The RTT assumed before any sample is available
pub const INITIAL_RTT: Duration = Duration::from_millis(100);

/// A newly acknowledged packet, as reported by the ack processor
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AckedPacket {
    pub packet_number: PacketNumber,
    /// Bytes freed from flight by this ack; 0 if the packet was already
    /// removed from flight (e.g. it had been declared lost)
    pub bytes_acked: u64,
    /// When the ack frame carrying this packet arrived
    pub receive_timestamp: Option<Timestamp>,
}

/// A packet declared lost by the loss detector
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LostPacket {
    pub packet_number: PacketNumber,
    pub bytes_lost: u64,
}
