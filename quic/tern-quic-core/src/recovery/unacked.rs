// Copyright the tern-quic project authors. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Tracks every sent packet until it is no longer useful.
//!
//! The map is a dense deque keyed by `packet_number - least_unacked`; slots
//! for skipped numbers exist only when the packetizer deliberately skips
//! them. Entries are pruned from the front once they can no longer inform
//! RTT, congestion control, or retransmission.

use crate::{
    counter::Counter,
    endpoint,
    frame::{Frame, StreamFrame},
    inet::ExplicitCongestionNotification,
    packet::{number::PacketNumberSpace, EncryptionLevel, PacketNumber},
    session::SessionNotifier,
    time::Timestamp,
    transmission::TransmissionType,
    transport::error::{Code, Error},
};
use std::collections::VecDeque;
use core::time::Duration;

/// The state of a sent packet
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SentPacketState {
    /// A placeholder slot for a packet number the packetizer skipped
    NeverSent,
    /// Sent and awaiting acknowledgment
    #[default]
    Outstanding,
    Acked,
    Lost,
    /// Data abandoned because the encryption level advanced; the packet no
    /// longer counts anywhere
    Neutered,
    /// Sent, but must not produce an RTT sample (e.g. PTO probes sent
    /// before address validation)
    NotContributingRtt,
}

impl SentPacketState {
    /// Returns true if an ack for a packet in this state is meaningful
    #[inline]
    pub fn is_ackable(self) -> bool {
        !matches!(self, Self::NeverSent | Self::Acked | Self::Neutered)
    }
}

/// Everything the recovery machinery remembers about one sent packet
#[derive(Clone, Debug)]
pub struct TransmissionInfo {
    pub encryption_level: EncryptionLevel,
    pub transmission_type: TransmissionType,
    pub sent_time: Timestamp,
    /// Wire length of the packet
    pub bytes_sent: u32,
    /// Whether the packet currently occupies congestion window
    pub in_flight: bool,
    pub state: SentPacketState,
    pub has_crypto_handshake: bool,
    pub has_ack_frequency: bool,
    pub ecn_codepoint: ExplicitCongestionNotification,
    /// Frames that must be retransmitted if this packet is lost
    pub retransmittable_frames: Vec<Frame>,
    /// The largest packet number this packet itself acknowledged
    pub largest_acked: Option<PacketNumber>,
    /// The packet that carried this packet's data after it was declared
    /// lost; once that packet is acked the data here is obsolete
    pub first_sent_after_loss: Option<PacketNumber>,
}

impl TransmissionInfo {
    fn never_sent() -> Self {
        Self {
            encryption_level: EncryptionLevel::Initial,
            transmission_type: TransmissionType::NotRetransmission,
            sent_time: Timestamp::from_duration(Duration::ZERO),
            bytes_sent: 0,
            in_flight: false,
            state: SentPacketState::NeverSent,
            has_crypto_handshake: false,
            has_ack_frequency: false,
            ecn_codepoint: ExplicitCongestionNotification::NotEct,
            retransmittable_frames: Vec::new(),
            largest_acked: None,
            first_sent_after_loss: None,
        }
    }
}

/// A packet handed to the map by the packetizer
#[derive(Clone, Debug)]
pub struct SentPacket {
    pub packet_number: PacketNumber,
    pub encryption_level: EncryptionLevel,
    pub transmission_type: TransmissionType,
    /// Wire length after encryption
    pub encrypted_length: u32,
    pub has_crypto_handshake: bool,
    pub has_ack_frequency: bool,
    pub largest_acked: Option<PacketNumber>,
    pub retransmittable_frames: Vec<Frame>,
}

#[derive(Clone, Debug)]
pub struct UnackedPacketMap {
    perspective: endpoint::Type,
    least_unacked: PacketNumber,
    unacked_packets: VecDeque<TransmissionInfo>,

    bytes_in_flight: Counter<u64>,
    bytes_in_flight_per_packet_number_space: [u64; PacketNumberSpace::COUNT],
    packets_in_flight: u64,

    last_inflight_packet_sent_time: Option<Timestamp>,
    last_inflight_packets_sent_time: [Option<Timestamp>; PacketNumberSpace::COUNT],
    last_crypto_packet_sent_time: Option<Timestamp>,

    largest_sent_packet: Option<PacketNumber>,
    largest_sent_retransmittable_packets: [Option<PacketNumber>; PacketNumberSpace::COUNT],
    largest_sent_largest_acked: Option<PacketNumber>,
    largest_acked: Option<PacketNumber>,
    largest_acked_packets: [Option<PacketNumber>; PacketNumberSpace::COUNT],

    /// Pending coalesced ack of contiguous stream frames
    aggregated_stream_frame: Option<StreamFrame>,

    supports_multiple_packet_number_spaces: bool,
}

impl UnackedPacketMap {
    pub fn new(perspective: endpoint::Type) -> Self {
        Self {
            perspective,
            least_unacked: PacketNumber::FIRST_SENDING,
            unacked_packets: VecDeque::new(),
            bytes_in_flight: Counter::new(0),
            bytes_in_flight_per_packet_number_space: [0; PacketNumberSpace::COUNT],
            packets_in_flight: 0,
            last_inflight_packet_sent_time: None,
            last_inflight_packets_sent_time: [None; PacketNumberSpace::COUNT],
            last_crypto_packet_sent_time: None,
            largest_sent_packet: None,
            largest_sent_retransmittable_packets: [None; PacketNumberSpace::COUNT],
            largest_sent_largest_acked: None,
            largest_acked: None,
            largest_acked_packets: [None; PacketNumberSpace::COUNT],
            aggregated_stream_frame: None,
            supports_multiple_packet_number_spaces: false,
        }
    }

    /// Switches to strict three-space accounting. Must be called before any
    /// packet is sent.
    pub fn enable_multiple_packet_number_spaces_support(&mut self) -> Result<(), Error> {
        if self.supports_multiple_packet_number_spaces {
            return Err(Error::new(Code::InternalError)
                .with_reason("multiple packet number spaces already enabled"));
        }
        if self.largest_sent_packet.is_some() {
            return Err(Error::new(Code::InternalError)
                .with_reason("cannot enable multiple packet number spaces after sending"));
        }
        self.supports_multiple_packet_number_spaces = true;
        Ok(())
    }

    #[inline]
    pub fn supports_multiple_packet_number_spaces(&self) -> bool {
        self.supports_multiple_packet_number_spaces
    }

    /// Maps an encryption level to its accounting space. In legacy mode two
    /// coalesced spaces exist and the split depends on the perspective.
    pub fn packet_number_space(&self, encryption_level: EncryptionLevel) -> PacketNumberSpace {
        if self.supports_multiple_packet_number_spaces {
            return encryption_level.packet_number_space();
        }
        if self.perspective.is_client() {
            if encryption_level.is_initial() {
                PacketNumberSpace::Handshake
            } else {
                PacketNumberSpace::ApplicationData
            }
        } else if encryption_level == EncryptionLevel::OneRtt {
            PacketNumberSpace::ApplicationData
        } else {
            PacketNumberSpace::Handshake
        }
    }

    /// Records a sent packet, transferring ownership of its retransmittable
    /// frames into the map.
    ///
    /// Fails if the packet number is not strictly greater than the previous
    /// largest sent.
    pub fn add_sent_packet(
        &mut self,
        packet: &mut SentPacket,
        sent_time: Timestamp,
        set_in_flight: bool,
        measure_rtt: bool,
        ecn_codepoint: ExplicitCongestionNotification,
    ) -> Result<(), Error> {
        let packet_number = packet.packet_number;
        if self.largest_sent_packet.is_some_and(|largest| largest >= packet_number) {
            return Err(Error::new(Code::InternalError)
                .with_reason("packet number is not greater than largest sent"));
        }
        let next_slot = self.least_unacked.as_u64() + self.unacked_packets.len() as u64;
        if packet_number.as_u64() < next_slot {
            return Err(
                Error::new(Code::InternalError).with_reason("packet number reuses occupied slot")
            );
        }
        if !measure_rtt && set_in_flight {
            return Err(Error::new(Code::InternalError)
                .with_reason("in-flight packet cannot skip RTT measurement"));
        }
        while self.least_unacked.as_u64() + (self.unacked_packets.len() as u64)
            < packet_number.as_u64()
        {
            self.unacked_packets.push_back(TransmissionInfo::never_sent());
        }

        let mut info = TransmissionInfo {
            encryption_level: packet.encryption_level,
            transmission_type: packet.transmission_type,
            sent_time,
            bytes_sent: packet.encrypted_length,
            in_flight: false,
            state: SentPacketState::Outstanding,
            has_crypto_handshake: packet.has_crypto_handshake,
            has_ack_frequency: packet.has_ack_frequency,
            ecn_codepoint,
            retransmittable_frames: Vec::new(),
            largest_acked: packet.largest_acked,
            first_sent_after_loss: None,
        };
        if let Some(largest_acked) = packet.largest_acked {
            self.largest_sent_largest_acked = Some(
                self.largest_sent_largest_acked
                    .map_or(largest_acked, |current| current.max(largest_acked)),
            );
        }

        if !measure_rtt {
            info.state = SentPacketState::NotContributingRtt;
        }

        self.largest_sent_packet = Some(packet_number);
        if set_in_flight {
            let space = self.packet_number_space(info.encryption_level);
            self.bytes_in_flight += u64::from(info.bytes_sent);
            self.bytes_in_flight_per_packet_number_space[space.as_index()] +=
                u64::from(info.bytes_sent);
            self.packets_in_flight += 1;
            info.in_flight = true;
            self.largest_sent_retransmittable_packets[space.as_index()] = Some(packet_number);
            self.last_inflight_packet_sent_time = Some(sent_time);
            self.last_inflight_packets_sent_time[space.as_index()] = Some(sent_time);
        }
        if info.has_crypto_handshake {
            self.last_crypto_packet_sent_time = Some(sent_time);
        }

        // Take the frames from the packetizer rather than copying them.
        info.retransmittable_frames = core::mem::take(&mut packet.retransmittable_frames);
        self.unacked_packets.push_back(info);
        Ok(())
    }

    /// Advances `least_unacked` past front entries that are useless
    pub fn remove_obsolete_packets(&mut self) {
        while let Some(front) = self.unacked_packets.front() {
            if !self.is_packet_useless(self.least_unacked, front) {
                break;
            }
            self.unacked_packets.pop_front();
            self.least_unacked = self.least_unacked.next();
        }
    }

    fn is_packet_useful_for_measuring_rtt(
        &self,
        packet_number: PacketNumber,
        info: &TransmissionInfo,
    ) -> bool {
        // Packet can be used for RTT measurement if it may yet be acked as
        // the largest observed packet by the receiver.
        info.state.is_ackable()
            && self.largest_acked.map_or(true, |largest| packet_number > largest)
            && info.state != SentPacketState::NotContributingRtt
    }

    fn is_packet_useful_for_congestion_control(&self, info: &TransmissionInfo) -> bool {
        info.in_flight
    }

    fn is_packet_useful_for_retransmittable_data(&self, info: &TransmissionInfo) -> bool {
        // Wait for 1 RTT before giving up on the lost packet.
        info.first_sent_after_loss.is_some_and(|first_sent| {
            self.largest_acked.map_or(true, |largest| first_sent > largest)
        })
    }

    fn is_packet_useless(&self, packet_number: PacketNumber, info: &TransmissionInfo) -> bool {
        !self.is_packet_useful_for_measuring_rtt(packet_number, info)
            && !self.is_packet_useful_for_congestion_control(info)
            && !self.is_packet_useful_for_retransmittable_data(info)
    }

    /// Returns true if the packet is tracked and still useful
    pub fn is_unacked(&self, packet_number: PacketNumber) -> bool {
        match self.get_transmission_info(packet_number) {
            Some(info) => !self.is_packet_useless(packet_number, info),
            None => false,
        }
    }

    #[inline]
    pub fn get_least_unacked(&self) -> PacketNumber {
        self.least_unacked
    }

    #[inline]
    pub fn largest_sent_packet(&self) -> Option<PacketNumber> {
        self.largest_sent_packet
    }

    #[inline]
    pub fn largest_acked(&self) -> Option<PacketNumber> {
        self.largest_acked
    }

    #[inline]
    pub fn largest_sent_largest_acked(&self) -> Option<PacketNumber> {
        self.largest_sent_largest_acked
    }

    #[inline]
    pub fn bytes_in_flight(&self) -> u64 {
        *self.bytes_in_flight
    }

    #[inline]
    pub fn packets_in_flight(&self) -> u64 {
        self.packets_in_flight
    }

    #[inline]
    pub fn has_in_flight_packets(&self) -> bool {
        *self.bytes_in_flight > 0
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.unacked_packets.is_empty()
    }

    #[inline]
    pub fn last_inflight_packet_sent_time(&self) -> Option<Timestamp> {
        self.last_inflight_packet_sent_time
    }

    #[inline]
    pub fn last_crypto_packet_sent_time(&self) -> Option<Timestamp> {
        self.last_crypto_packet_sent_time
    }

    pub fn bytes_in_flight_for_space(&self, space: PacketNumberSpace) -> u64 {
        self.bytes_in_flight_per_packet_number_space[space.as_index()]
    }

    pub fn last_inflight_packet_sent_time_for_space(
        &self,
        space: PacketNumberSpace,
    ) -> Option<Timestamp> {
        self.last_inflight_packets_sent_time[space.as_index()]
    }

    pub fn largest_sent_retransmittable_of_space(
        &self,
        space: PacketNumberSpace,
    ) -> Option<PacketNumber> {
        self.largest_sent_retransmittable_packets[space.as_index()]
    }

    pub fn largest_acked_of_space(&self, space: PacketNumberSpace) -> Option<PacketNumber> {
        self.largest_acked_packets[space.as_index()]
    }

    pub fn get_transmission_info(&self, packet_number: PacketNumber) -> Option<&TransmissionInfo> {
        let index = packet_number.checked_distance(self.least_unacked)? as usize;
        self.unacked_packets.get(index)
    }

    pub fn get_mut_transmission_info(
        &mut self,
        packet_number: PacketNumber,
    ) -> Option<&mut TransmissionInfo> {
        let index = packet_number.checked_distance(self.least_unacked)? as usize;
        self.unacked_packets.get_mut(index)
    }

    /// Records that `largest_acked` was acknowledged by the peer
    pub fn increase_largest_acked(&mut self, largest_acked: PacketNumber) {
        debug_assert!(self.largest_acked.map_or(true, |current| current <= largest_acked));
        self.largest_acked = Some(largest_acked);
    }

    pub fn maybe_update_largest_acked_of_packet_number_space(
        &mut self,
        space: PacketNumberSpace,
        packet_number: PacketNumber,
    ) {
        let slot = &mut self.largest_acked_packets[space.as_index()];
        *slot = Some(slot.map_or(packet_number, |current| current.max(packet_number)));
    }

    /// Clears in-flight status and updates the per-space byte counts. When
    /// a space drains to zero bytes its last-inflight-sent-time clears too.
    pub fn remove_from_in_flight(&mut self, packet_number: PacketNumber) {
        let least_unacked = self.least_unacked;
        let Some(index) = packet_number.checked_distance(least_unacked).map(|d| d as usize) else {
            return;
        };
        let Some(info) = self.unacked_packets.get_mut(index) else {
            return;
        };
        if !info.in_flight {
            return;
        }
        info.in_flight = false;
        let bytes_sent = u64::from(info.bytes_sent);
        let encryption_level = info.encryption_level;

        debug_assert!(self.packets_in_flight > 0);
        self.bytes_in_flight -= bytes_sent;
        self.packets_in_flight = self.packets_in_flight.saturating_sub(1);

        let space = self.packet_number_space(encryption_level).as_index();
        let space_bytes = &mut self.bytes_in_flight_per_packet_number_space[space];
        debug_assert!(*space_bytes >= bytes_sent);
        *space_bytes = space_bytes.saturating_sub(bytes_sent);
        if *space_bytes == 0 {
            self.last_inflight_packets_sent_time[space] = None;
        }
    }

    /// Marks the packet acked and removes it from flight
    pub fn on_packet_acked(&mut self, packet_number: PacketNumber) {
        self.remove_from_in_flight(packet_number);
        if let Some(info) = self.get_mut_transmission_info(packet_number) {
            info.state = SentPacketState::Acked;
        }
    }

    /// Marks the packet lost (it stays useful until retransmitted data is
    /// acked) and removes it from flight
    pub fn on_packet_lost(
        &mut self,
        packet_number: PacketNumber,
        first_sent_after_loss: Option<PacketNumber>,
    ) {
        self.remove_from_in_flight(packet_number);
        if let Some(info) = self.get_mut_transmission_info(packet_number) {
            info.state = SentPacketState::Lost;
            info.first_sent_after_loss = first_sent_after_loss;
        }
    }

    /// Clears the retransmittable frames of an entry once its data can no
    /// longer need retransmission
    pub fn remove_retransmittability(&mut self, packet_number: PacketNumber) {
        if let Some(info) = self.get_mut_transmission_info(packet_number) {
            info.retransmittable_frames.clear();
            info.first_sent_after_loss = None;
        }
    }

    /// Marks Initial packets neutered when the connection advances past the
    /// initial encryption level. The session is told the data is delivered,
    /// the congestion controller is not. Returns the neutered numbers.
    pub fn neuter_unencrypted_packets(
        &mut self,
        notifier: &mut dyn SessionNotifier,
    ) -> Vec<PacketNumber> {
        self.neuter_packets(notifier, |info| {
            info.encryption_level == EncryptionLevel::Initial
        })
    }

    /// Marks handshake packets neutered when the handshake completes
    pub fn neuter_handshake_packets(
        &mut self,
        notifier: &mut dyn SessionNotifier,
    ) -> Vec<PacketNumber> {
        let handshake_space = PacketNumberSpace::Handshake;
        let mut matches = Vec::new();
        let mut packet_number = self.least_unacked;
        for info in &self.unacked_packets {
            if !info.retransmittable_frames.is_empty()
                && self.packet_number_space(info.encryption_level) == handshake_space
            {
                matches.push(packet_number);
            }
            packet_number = packet_number.next();
        }
        self.neuter_listed(notifier, matches)
    }

    fn neuter_packets(
        &mut self,
        notifier: &mut dyn SessionNotifier,
        predicate: impl Fn(&TransmissionInfo) -> bool,
    ) -> Vec<PacketNumber> {
        let mut matches = Vec::new();
        let mut packet_number = self.least_unacked;
        for info in &self.unacked_packets {
            if !info.retransmittable_frames.is_empty() && predicate(info) {
                matches.push(packet_number);
            }
            packet_number = packet_number.next();
        }
        self.neuter_listed(notifier, matches)
    }

    fn neuter_listed(
        &mut self,
        notifier: &mut dyn SessionNotifier,
        packets: Vec<PacketNumber>,
    ) -> Vec<PacketNumber> {
        for packet_number in &packets {
            self.remove_from_in_flight(*packet_number);
            if let Some(info) = self.get_mut_transmission_info(*packet_number) {
                info.state = SentPacketState::Neutered;
            }
            // Notify the session the data has been delivered; the send
            // algorithm is deliberately not notified.
            if let Some(info) = self.get_transmission_info(*packet_number) {
                let frames = info.retransmittable_frames.clone();
                for frame in &frames {
                    notifier.on_frame_acked(frame, Duration::ZERO, None);
                }
            }
            if let Some(info) = self.get_mut_transmission_info(*packet_number) {
                info.retransmittable_frames.clear();
            }
        }
        packets
    }

    /// Returns true if the packet still has frames the session considers
    /// outstanding
    pub fn has_retransmittable_frames(
        &self,
        notifier: &dyn SessionNotifier,
        packet_number: PacketNumber,
    ) -> bool {
        let Some(info) = self.get_transmission_info(packet_number) else {
            return false;
        };
        self.info_has_retransmittable_frames(notifier, info)
    }

    fn info_has_retransmittable_frames(
        &self,
        notifier: &dyn SessionNotifier,
        info: &TransmissionInfo,
    ) -> bool {
        if !info.state.is_ackable() {
            return false;
        }
        info.retransmittable_frames
            .iter()
            .any(|frame| notifier.is_frame_outstanding(frame))
    }

    /// Returns true if crypto data is waiting to be acknowledged
    pub fn has_pending_crypto_packets(&self, notifier: &dyn SessionNotifier) -> bool {
        notifier.has_unacked_crypto_data()
    }

    /// A bitfield over the frame types in the most recently sent packet,
    /// for debugging what the connection last put on the wire. `None` when
    /// nothing is tracked.
    pub fn last_packet_content(&self) -> Option<u32> {
        let last_packet = self.unacked_packets.back()?;
        let mut content = 0u32;
        for frame in &last_packet.retransmittable_frames {
            content |= frame_type_bit(frame);
        }
        if last_packet.largest_acked.is_some() {
            content |= 1 << 11;
        }
        Some(content)
    }

    /// Returns true if any in-flight packet still carries outstanding frames
    pub fn has_unacked_retransmittable_frames(&self, notifier: &dyn SessionNotifier) -> bool {
        self.unacked_packets
            .iter()
            .rev()
            .any(|info| info.in_flight && self.info_has_retransmittable_frames(notifier, info))
    }

    /// Returns true if more than one packet is in flight
    pub fn has_multiple_in_flight_packets(&self) -> bool {
        if *self.bytes_in_flight > u64::from(crate::recovery::MAX_SEGMENT_SIZE) {
            return true;
        }
        self.unacked_packets.iter().filter(|info| info.in_flight).count() > 1
    }

    /// The first in-flight packet, if any
    pub fn get_first_in_flight_transmission_info(&self) -> Option<&TransmissionInfo> {
        self.unacked_packets.iter().find(|info| info.in_flight)
    }

    /// The first in-flight packet of the given space, if any
    pub fn get_first_in_flight_transmission_info_of_space(
        &self,
        space: PacketNumberSpace,
    ) -> Option<&TransmissionInfo> {
        self.unacked_packets
            .iter()
            .find(|info| info.in_flight && self.packet_number_space(info.encryption_level) == space)
    }

    /// Fans an acked packet's frames out to the session
    pub fn notify_frames_acked(
        &mut self,
        notifier: &mut dyn SessionNotifier,
        packet_number: PacketNumber,
        ack_delay: Duration,
        receive_timestamp: Option<Timestamp>,
    ) -> bool {
        let Some(info) = self.get_transmission_info(packet_number) else {
            return false;
        };
        let frames = info.retransmittable_frames.clone();
        let mut new_data_acked = false;
        for frame in &frames {
            if notifier.on_frame_acked(frame, ack_delay, receive_timestamp) {
                new_data_acked = true;
            }
        }
        new_data_acked
    }

    /// Fans a lost packet's frames out to the session
    pub fn notify_frames_lost(
        &mut self,
        notifier: &mut dyn SessionNotifier,
        packet_number: PacketNumber,
    ) {
        let Some(info) = self.get_transmission_info(packet_number) else {
            return;
        };
        let frames = info.retransmittable_frames.clone();
        for frame in &frames {
            notifier.on_frame_lost(frame);
        }
    }

    /// Asks the session to retransmit `frames`
    pub fn retransmit_frames(
        &mut self,
        notifier: &mut dyn SessionNotifier,
        frames: &[Frame],
        transmission_type: TransmissionType,
    ) -> bool {
        notifier.retransmit_frames(frames, transmission_type)
    }

    /// Coalesces contiguous acked stream frames for the same stream to
    /// reduce notifier churn. Non-aggregatable frames flush the pending
    /// aggregate first; a FIN flushes immediately.
    pub fn maybe_aggregate_acked_stream_frames(
        &mut self,
        notifier: &mut dyn SessionNotifier,
        packet_number: PacketNumber,
        ack_delay: Duration,
        receive_timestamp: Option<Timestamp>,
    ) {
        let Some(info) = self.get_transmission_info(packet_number) else {
            return;
        };
        let frames = info.retransmittable_frames.clone();
        for frame in &frames {
            let can_aggregate = match (frame, &self.aggregated_stream_frame) {
                (Frame::Stream(stream_frame), Some(aggregated)) => {
                    stream_frame.stream_id == aggregated.stream_id
                        && stream_frame.offset == aggregated.offset + aggregated.data_length
                        && aggregated
                            .data_length
                            .checked_add(stream_frame.data_length)
                            .is_some()
                }
                (Frame::Stream(_), None) => false,
                _ => false,
            };

            if can_aggregate {
                let Frame::Stream(stream_frame) = frame else {
                    unreachable!()
                };
                let aggregated = self.aggregated_stream_frame.as_mut().unwrap();
                aggregated.data_length += stream_frame.data_length;
                aggregated.fin = stream_frame.fin;
                if aggregated.fin {
                    // a FIN completes the aggregate; deliver it now
                    self.notify_aggregated_stream_frame_acked(notifier, ack_delay);
                }
                continue;
            }

            self.notify_aggregated_stream_frame_acked(notifier, ack_delay);
            match frame {
                Frame::Stream(stream_frame) if !stream_frame.fin => {
                    // Delay notifying the session in case the next acked
                    // frame continues this one.
                    self.aggregated_stream_frame = Some(*stream_frame);
                }
                _ => {
                    notifier.on_frame_acked(frame, ack_delay, receive_timestamp);
                }
            }
        }
    }

    /// Flushes the pending stream-frame aggregate, if any
    pub fn notify_aggregated_stream_frame_acked(
        &mut self,
        notifier: &mut dyn SessionNotifier,
        ack_delay: Duration,
    ) {
        if let Some(aggregated) = self.aggregated_stream_frame.take() {
            // There is no receive timestamp for an aggregated frame: its
            // parts may have arrived in different ack events.
            notifier.on_frame_acked(&Frame::Stream(aggregated), ack_delay, None);
        }
    }

    /// Iterates over `(packet_number, info)` for every tracked packet
    pub fn iter(&self) -> impl Iterator<Item = (PacketNumber, &TransmissionInfo)> {
        let least_unacked = self.least_unacked;
        self.unacked_packets.iter().enumerate().map(move |(index, info)| {
            (
                PacketNumber::new(least_unacked.as_u64() + index as u64).unwrap(),
                info,
            )
        })
    }
}

fn frame_type_bit(frame: &Frame) -> u32 {
    match frame {
        Frame::RstStream(_) => 1 << 1,
        Frame::WindowUpdate(_) => 1 << 4,
        Frame::Blocked(_) => 1 << 5,
        Frame::Ping(_) => 1 << 7,
        Frame::Crypto(_) => 1 << 8,
        Frame::HandshakeDone(_) => 1 << 9,
        Frame::Stream(_) => 1 << 10,
        Frame::MaxStreams(_) => 1 << 14,
        Frame::StreamsBlocked(_) => 1 << 15,
        Frame::StopSending(_) => 1 << 18,
        Frame::AckFrequency(_) => 1 << 22,
    }
}
