// Copyright the tern-quic project authors. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Reliable delivery of non-stream control frames.
//!
//! Every buffered frame gets a monotonically increasing id. The queue
//! drains in id order; ids are erased in place when acked and the queue
//! head advances past erased entries. Window updates are additionally
//! indexed per stream so a newer update implicitly acknowledges the older
//! one it supersedes.

use crate::{
    frame::{
        AckFrequencyFrame, BlockedFrame, ControlFrameId, Frame, HandshakeDoneFrame,
        MaxStreamsFrame, PingFrame, RstStreamFrame, StopSendingFrame, StreamsBlockedFrame,
        WindowUpdateFrame, INVALID_CONTROL_FRAME_ID,
    },
    transmission::TransmissionType,
    transport::error::{Code, Error},
};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use core::time::Duration;

/// The maximum number of control frames waiting to be acked or sent for
/// the first time
pub const MAX_NUM_CONTROL_FRAMES: usize = 1000;

/// Where the manager writes frames: the session's packetizer. A false
/// return means the connection is write blocked; the frame stays queued.
pub trait FrameSink {
    fn write_control_frame(&mut self, frame: &Frame, transmission_type: TransmissionType) -> bool;
}

#[derive(Debug, Default)]
pub struct ControlFrameManager {
    /// Frames in id order; the front holds `least_unacked`
    control_frames: VecDeque<Frame>,
    last_control_frame_id: ControlFrameId,
    least_unacked: ControlFrameId,
    least_unsent: ControlFrameId,
    /// Ids of sent frames declared lost and not yet retransmitted
    pending_retransmissions: BTreeSet<ControlFrameId>,
    /// Latest window-update id per stream, for implicit acks
    window_update_frames: BTreeMap<u64, ControlFrameId>,
}

impl ControlFrameManager {
    pub fn new() -> Self {
        Self {
            control_frames: VecDeque::new(),
            last_control_frame_id: INVALID_CONTROL_FRAME_ID,
            least_unacked: 1,
            least_unsent: 1,
            pending_retransmissions: BTreeSet::new(),
            window_update_frames: BTreeMap::new(),
        }
    }

    #[inline]
    pub fn least_unacked(&self) -> ControlFrameId {
        self.least_unacked
    }

    #[inline]
    pub fn least_unsent(&self) -> ControlFrameId {
        self.least_unsent
    }

    pub fn has_buffered_frames(&self) -> bool {
        self.least_unsent < self.least_unacked + self.control_frames.len() as u64
    }

    pub fn has_pending_retransmission(&self) -> bool {
        !self.pending_retransmissions.is_empty()
    }

    pub fn willing_to_write(&self) -> bool {
        self.has_pending_retransmission() || self.has_buffered_frames()
    }

    fn next_id(&mut self) -> ControlFrameId {
        self.last_control_frame_id += 1;
        self.last_control_frame_id
    }

    /// Queues `frame`, writing immediately if the queue was drained
    pub fn write_or_buffer_frame(
        &mut self,
        mut frame: Frame,
        sink: &mut dyn FrameSink,
    ) -> Result<(), Error> {
        let id = self.next_id();
        frame.set_control_frame_id(id);

        let had_buffered_frames = self.has_buffered_frames();
        self.control_frames.push_back(frame);
        if self.control_frames.len() > MAX_NUM_CONTROL_FRAMES {
            return Err(Error::new(Code::TooManyBufferedControlFrames)
                .with_reason("too many buffered control frames"));
        }
        if had_buffered_frames {
            return Ok(());
        }
        self.write_buffered_frames(sink)
    }

    pub fn write_or_buffer_rst_stream(
        &mut self,
        stream_id: u64,
        error_code: u64,
        bytes_written: u64,
        sink: &mut dyn FrameSink,
    ) -> Result<(), Error> {
        self.write_or_buffer_frame(
            Frame::RstStream(RstStreamFrame {
                control_frame_id: INVALID_CONTROL_FRAME_ID,
                stream_id,
                error_code,
                final_offset: bytes_written,
            }),
            sink,
        )
    }

    pub fn write_or_buffer_window_update(
        &mut self,
        stream_id: u64,
        byte_offset: u64,
        sink: &mut dyn FrameSink,
    ) -> Result<(), Error> {
        self.write_or_buffer_frame(
            Frame::WindowUpdate(WindowUpdateFrame {
                control_frame_id: INVALID_CONTROL_FRAME_ID,
                stream_id,
                byte_offset,
            }),
            sink,
        )
    }

    pub fn write_or_buffer_blocked(
        &mut self,
        stream_id: u64,
        offset: u64,
        sink: &mut dyn FrameSink,
    ) -> Result<(), Error> {
        self.write_or_buffer_frame(
            Frame::Blocked(BlockedFrame {
                control_frame_id: INVALID_CONTROL_FRAME_ID,
                stream_id,
                offset,
            }),
            sink,
        )
    }

    pub fn write_or_buffer_stop_sending(
        &mut self,
        stream_id: u64,
        error_code: u64,
        sink: &mut dyn FrameSink,
    ) -> Result<(), Error> {
        self.write_or_buffer_frame(
            Frame::StopSending(StopSendingFrame {
                control_frame_id: INVALID_CONTROL_FRAME_ID,
                stream_id,
                error_code,
            }),
            sink,
        )
    }

    pub fn write_or_buffer_max_streams(
        &mut self,
        stream_count: u64,
        unidirectional: bool,
        sink: &mut dyn FrameSink,
    ) -> Result<(), Error> {
        self.write_or_buffer_frame(
            Frame::MaxStreams(MaxStreamsFrame {
                control_frame_id: INVALID_CONTROL_FRAME_ID,
                stream_count,
                unidirectional,
            }),
            sink,
        )
    }

    pub fn write_or_buffer_streams_blocked(
        &mut self,
        stream_count: u64,
        unidirectional: bool,
        sink: &mut dyn FrameSink,
    ) -> Result<(), Error> {
        self.write_or_buffer_frame(
            Frame::StreamsBlocked(StreamsBlockedFrame {
                control_frame_id: INVALID_CONTROL_FRAME_ID,
                stream_count,
                unidirectional,
            }),
            sink,
        )
    }

    pub fn write_or_buffer_handshake_done(&mut self, sink: &mut dyn FrameSink) -> Result<(), Error> {
        self.write_or_buffer_frame(
            Frame::HandshakeDone(HandshakeDoneFrame {
                control_frame_id: INVALID_CONTROL_FRAME_ID,
            }),
            sink,
        )
    }

    pub fn write_or_buffer_ack_frequency(
        &mut self,
        sequence_number: u64,
        packet_tolerance: u64,
        max_ack_delay: Duration,
        sink: &mut dyn FrameSink,
    ) -> Result<(), Error> {
        self.write_or_buffer_frame(
            Frame::AckFrequency(AckFrequencyFrame {
                control_frame_id: INVALID_CONTROL_FRAME_ID,
                sequence_number,
                packet_tolerance,
                max_ack_delay,
            }),
            sink,
        )
    }

    /// PING probes the path; a ping behind queued frames is useless, so it
    /// is dropped instead of buffered
    pub fn write_ping(&mut self, sink: &mut dyn FrameSink) -> Result<(), Error> {
        if self.has_buffered_frames() {
            return Ok(());
        }
        let id = self.next_id();
        self.control_frames.push_back(Frame::Ping(PingFrame {
            control_frame_id: id,
        }));
        if self.control_frames.len() > MAX_NUM_CONTROL_FRAMES {
            return Err(Error::new(Code::TooManyBufferedControlFrames)
                .with_reason("too many buffered control frames"));
        }
        self.write_buffered_frames(sink)
    }

    fn frame_at(&self, id: ControlFrameId) -> Option<&Frame> {
        let index = id.checked_sub(self.least_unacked)? as usize;
        self.control_frames.get(index)
    }

    fn frame_at_mut(&mut self, id: ControlFrameId) -> Option<&mut Frame> {
        let index = id.checked_sub(self.least_unacked)? as usize;
        self.control_frames.get_mut(index)
    }

    /// Records that `frame` was handed to the packetizer
    pub fn on_control_frame_sent(&mut self, frame: &Frame) -> Result<(), Error> {
        let id = frame.control_frame_id();
        if id == INVALID_CONTROL_FRAME_ID {
            debug_assert!(false, "sent a control frame with an invalid id");
            return Ok(());
        }
        if let Frame::WindowUpdate(window_update) = frame {
            let stream_id = window_update.stream_id;
            if let Some(&old_id) = self.window_update_frames.get(&stream_id) {
                if id > old_id {
                    // Consider the older window update of the same stream
                    // as acked.
                    self.on_control_frame_id_acked(old_id)?;
                }
            }
            self.window_update_frames.insert(stream_id, id);
        }
        if self.pending_retransmissions.remove(&id) {
            // This was a retransmission.
            return Ok(());
        }
        if id > self.least_unsent {
            return Err(Error::new(Code::InternalError)
                .with_reason("try to send control frames out of order"));
        }
        self.least_unsent += 1;
        Ok(())
    }

    /// Processes an ack. Returns true if the frame was newly acked.
    pub fn on_control_frame_acked(&mut self, frame: &Frame) -> Result<bool, Error> {
        let id = frame.control_frame_id();
        if !self.on_control_frame_id_acked(id)? {
            return Ok(false);
        }
        if let Frame::WindowUpdate(window_update) = frame {
            if self.window_update_frames.get(&window_update.stream_id) == Some(&id) {
                self.window_update_frames.remove(&window_update.stream_id);
            }
        }
        Ok(true)
    }

    /// Queues a lost frame for retransmission unless it was already acked
    pub fn on_control_frame_lost(&mut self, frame: &Frame) -> Result<(), Error> {
        let id = frame.control_frame_id();
        if id == INVALID_CONTROL_FRAME_ID {
            return Ok(());
        }
        if id >= self.least_unsent {
            return Err(Error::new(Code::InternalError)
                .with_reason("try to mark unsent control frame as lost"));
        }
        match self.frame_at(id) {
            // Already acked (or pruned): nothing to retransmit.
            None => return Ok(()),
            Some(stored) if stored.control_frame_id() == INVALID_CONTROL_FRAME_ID => {
                return Ok(());
            }
            Some(_) => {}
        }
        self.pending_retransmissions.insert(id);
        debug_assert!(
            self.pending_retransmissions.len() <= self.control_frames.len(),
            "pending retransmissions outnumber buffered control frames"
        );
        Ok(())
    }

    /// Returns true while the frame has been sent but not acked
    pub fn is_control_frame_outstanding(&self, frame: &Frame) -> bool {
        let id = frame.control_frame_id();
        if id == INVALID_CONTROL_FRAME_ID {
            // A frame without an id is never retransmitted.
            return false;
        }
        self.frame_at(id)
            .is_some_and(|stored| stored.control_frame_id() != INVALID_CONTROL_FRAME_ID)
    }

    /// The first frame waiting to be retransmitted
    pub fn next_pending_retransmission(&self) -> Option<&Frame> {
        let id = *self.pending_retransmissions.first()?;
        self.frame_at(id)
    }

    /// Writes retransmissions first, then buffered first-transmissions
    pub fn on_can_write(&mut self, sink: &mut dyn FrameSink) -> Result<(), Error> {
        if self.has_pending_retransmission() {
            // Exit early to allow streams to write pending retransmissions.
            return self.write_pending_retransmission(sink);
        }
        self.write_buffered_frames(sink)
    }

    /// Immediately retransmits `frame` (e.g. for a PTO probe). Returns
    /// false when the connection is write blocked.
    pub fn retransmit_control_frame(
        &mut self,
        frame: &Frame,
        transmission_type: TransmissionType,
        sink: &mut dyn FrameSink,
    ) -> Result<bool, Error> {
        debug_assert!(transmission_type.is_retransmission());
        let id = frame.control_frame_id();
        if id == INVALID_CONTROL_FRAME_ID {
            // No id: nothing to track, allow writing the following frames.
            return Ok(true);
        }
        if id >= self.least_unsent {
            return Err(Error::new(Code::InternalError)
                .with_reason("try to retransmit unsent control frame"));
        }
        let Some(stored) = self.frame_at(id).copied() else {
            return Ok(true);
        };
        if stored.control_frame_id() == INVALID_CONTROL_FRAME_ID {
            // Already acked.
            return Ok(true);
        }
        if sink.write_control_frame(&stored, transmission_type) {
            return Ok(true);
        }
        Ok(false)
    }

    fn write_buffered_frames(&mut self, sink: &mut dyn FrameSink) -> Result<(), Error> {
        while self.has_buffered_frames() {
            let Some(frame_to_send) = self.frame_at(self.least_unsent).copied() else {
                break;
            };
            if !sink.write_control_frame(&frame_to_send, TransmissionType::NotRetransmission) {
                // Connection is write blocked.
                break;
            }
            self.on_control_frame_sent(&frame_to_send)?;
        }
        Ok(())
    }

    fn write_pending_retransmission(&mut self, sink: &mut dyn FrameSink) -> Result<(), Error> {
        while self.has_pending_retransmission() {
            let Some(pending) = self.next_pending_retransmission().copied() else {
                break;
            };
            if !sink.write_control_frame(&pending, TransmissionType::LossRetransmission) {
                // Connection is write blocked.
                break;
            }
            self.on_control_frame_sent(&pending)?;
        }
        Ok(())
    }

    fn on_control_frame_id_acked(&mut self, id: ControlFrameId) -> Result<bool, Error> {
        if id == INVALID_CONTROL_FRAME_ID {
            return Ok(false);
        }
        if id >= self.least_unsent {
            return Err(
                Error::new(Code::InternalError).with_reason("try to ack unsent control frame")
            );
        }
        let Some(stored) = self.frame_at_mut(id) else {
            // Already acked and pruned.
            return Ok(false);
        };
        if stored.control_frame_id() == INVALID_CONTROL_FRAME_ID {
            return Ok(false);
        }

        // Erase the id in place, drop any pending retransmission, then
        // advance the queue head past acked entries.
        stored.set_control_frame_id(INVALID_CONTROL_FRAME_ID);
        self.pending_retransmissions.remove(&id);
        while let Some(front) = self.control_frames.front() {
            if front.control_frame_id() != INVALID_CONTROL_FRAME_ID {
                break;
            }
            self.control_frames.pop_front();
            self.least_unacked += 1;
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Records writes; can simulate a write-blocked connection
    #[derive(Debug, Default)]
    struct RecordingSink {
        written: Vec<(Frame, TransmissionType)>,
        blocked: bool,
    }

    impl FrameSink for RecordingSink {
        fn write_control_frame(
            &mut self,
            frame: &Frame,
            transmission_type: TransmissionType,
        ) -> bool {
            if self.blocked {
                return false;
            }
            self.written.push((*frame, transmission_type));
            true
        }
    }

    #[test]
    fn frames_get_increasing_ids_and_flush_immediately() {
        let mut manager = ControlFrameManager::new();
        let mut sink = RecordingSink::default();

        manager.write_or_buffer_rst_stream(4, 0, 100, &mut sink).unwrap();
        manager.write_or_buffer_stop_sending(4, 0, &mut sink).unwrap();

        assert_eq!(sink.written.len(), 2);
        assert_eq!(sink.written[0].0.control_frame_id(), 1);
        assert_eq!(sink.written[1].0.control_frame_id(), 2);
        assert_eq!(manager.least_unsent(), 3);
        assert!(!manager.willing_to_write());
    }

    #[test]
    fn blocked_connection_buffers_frames() {
        let mut manager = ControlFrameManager::new();
        let mut sink = RecordingSink {
            blocked: true,
            ..Default::default()
        };

        manager.write_or_buffer_window_update(4, 1000, &mut sink).unwrap();
        manager.write_or_buffer_window_update(8, 1000, &mut sink).unwrap();
        assert!(sink.written.is_empty());
        assert!(manager.has_buffered_frames());

        // once writable, the queue drains in order
        sink.blocked = false;
        manager.on_can_write(&mut sink).unwrap();
        assert_eq!(sink.written.len(), 2);
        assert_eq!(manager.least_unsent(), 3);
    }

    /// A newer window update for the same stream implicitly acks the older
    /// one
    #[test]
    fn window_update_implicit_ack() {
        let mut manager = ControlFrameManager::new();
        let mut sink = RecordingSink {
            blocked: true,
            ..Default::default()
        };

        manager.write_or_buffer_window_update(4, 1000, &mut sink).unwrap();
        manager.write_or_buffer_window_update(4, 2000, &mut sink).unwrap();
        let first = *manager.frame_at(1).unwrap();
        let second = *manager.frame_at(2).unwrap();

        sink.blocked = false;
        manager.on_can_write(&mut sink).unwrap();

        // sending the newer update implicitly acked the older one
        assert!(!manager.is_control_frame_outstanding(&first));
        assert!(manager.is_control_frame_outstanding(&second));
        assert_eq!(manager.least_unacked(), 2);

        // acking the newer update advances past both
        assert!(manager.on_control_frame_acked(&second).unwrap());
        assert!(!manager.is_control_frame_outstanding(&second));
        assert_eq!(manager.least_unacked(), 3);

        // a late ack of the first frame is a no-op
        assert!(!manager.on_control_frame_acked(&first).unwrap());
    }

    #[test]
    fn lost_frames_are_retransmitted_once() {
        let mut manager = ControlFrameManager::new();
        let mut sink = RecordingSink::default();

        manager.write_or_buffer_blocked(4, 100, &mut sink).unwrap();
        let frame = sink.written[0].0;

        manager.on_control_frame_lost(&frame).unwrap();
        assert!(manager.has_pending_retransmission());
        assert_eq!(manager.next_pending_retransmission(), Some(&frame));

        manager.on_can_write(&mut sink).unwrap();
        assert_eq!(sink.written.len(), 2);
        assert_eq!(sink.written[1].1, TransmissionType::LossRetransmission);
        assert!(!manager.has_pending_retransmission());

        // losing it again after the ack changes nothing
        manager.on_control_frame_acked(&frame).unwrap();
        manager.on_control_frame_lost(&frame).unwrap();
        assert!(!manager.has_pending_retransmission());
    }

    #[test]
    fn ping_is_dropped_when_frames_are_buffered() {
        let mut manager = ControlFrameManager::new();
        let mut sink = RecordingSink {
            blocked: true,
            ..Default::default()
        };

        manager.write_or_buffer_handshake_done(&mut sink).unwrap();
        assert!(manager.has_buffered_frames());

        manager.write_ping(&mut sink).unwrap();
        // the ping was not queued behind the handshake-done frame
        sink.blocked = false;
        manager.on_can_write(&mut sink).unwrap();
        assert_eq!(sink.written.len(), 1);
        assert!(matches!(sink.written[0].0, Frame::HandshakeDone(_)));
    }

    #[test]
    fn queue_overflow_is_fatal() {
        let mut manager = ControlFrameManager::new();
        let mut sink = RecordingSink {
            blocked: true,
            ..Default::default()
        };

        let mut result = Ok(());
        for _ in 0..=MAX_NUM_CONTROL_FRAMES {
            result = manager.write_or_buffer_blocked(4, 0, &mut sink);
            if result.is_err() {
                break;
            }
        }
        assert_eq!(
            result.unwrap_err().code,
            Code::TooManyBufferedControlFrames
        );
    }

    #[test]
    fn acking_unsent_frame_is_an_error() {
        let mut manager = ControlFrameManager::new();
        let mut sink = RecordingSink {
            blocked: true,
            ..Default::default()
        };
        manager.write_or_buffer_blocked(4, 0, &mut sink).unwrap();
        let frame = *manager.frame_at(1).unwrap();

        let error = manager.on_control_frame_acked(&frame).unwrap_err();
        assert_eq!(error.code, Code::InternalError);
        let error = manager.on_control_frame_lost(&frame).unwrap_err();
        assert_eq!(error.code, Code::InternalError);
    }

    #[test]
    fn retransmit_control_frame_for_probe() {
        let mut manager = ControlFrameManager::new();
        let mut sink = RecordingSink::default();
        manager.write_or_buffer_max_streams(100, false, &mut sink).unwrap();
        let frame = sink.written[0].0;

        // a PTO probe repeats the frame without it being declared lost
        let written = manager
            .retransmit_control_frame(&frame, TransmissionType::PtoRetransmission, &mut sink)
            .unwrap();
        assert!(written);
        assert_eq!(sink.written.len(), 2);
        assert_eq!(sink.written[1].1, TransmissionType::PtoRetransmission);

        // once acked, the retransmit request reports success with no write
        manager.on_control_frame_acked(&frame).unwrap();
        let written = manager
            .retransmit_control_frame(&frame, TransmissionType::PtoRetransmission, &mut sink)
            .unwrap();
        assert!(written);
        assert_eq!(sink.written.len(), 2);
    }
}
