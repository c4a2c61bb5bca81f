// Copyright the tern-quic project authors. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! The retransmittable frame model.
//!
//! Frames here are bookkeeping records, not wire images: stream and crypto
//! frames carry offsets and lengths while the payload bytes live in the
//! stream send buffer. Control frames additionally carry the id the control
//! frame manager assigned them so that ack/loss fan-out can find the queue
//! entry again.

use crate::packet::EncryptionLevel;
use core::time::Duration;

/// Identifier assigned to control frames in send order
pub type ControlFrameId = u64;

/// Marks a frame that has either been acked or was never under the control
/// frame manager's responsibility
pub const INVALID_CONTROL_FRAME_ID: ControlFrameId = 0;

/// The stream id used for connection-level window updates and blocked frames
pub const CONNECTION_LEVEL_ID: u64 = u64::MAX;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StreamFrame {
    pub stream_id: u64,
    pub offset: u64,
    pub data_length: u64,
    pub fin: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CryptoFrame {
    pub level: EncryptionLevel,
    pub offset: u64,
    pub data_length: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RstStreamFrame {
    pub control_frame_id: ControlFrameId,
    pub stream_id: u64,
    pub error_code: u64,
    pub final_offset: u64,
}

/// Raises the peer-visible flow control limit for a stream, or for the
/// connection when `stream_id == CONNECTION_LEVEL_ID`
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WindowUpdateFrame {
    pub control_frame_id: ControlFrameId,
    pub stream_id: u64,
    pub byte_offset: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BlockedFrame {
    pub control_frame_id: ControlFrameId,
    pub stream_id: u64,
    pub offset: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StopSendingFrame {
    pub control_frame_id: ControlFrameId,
    pub stream_id: u64,
    pub error_code: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MaxStreamsFrame {
    pub control_frame_id: ControlFrameId,
    pub stream_count: u64,
    pub unidirectional: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StreamsBlockedFrame {
    pub control_frame_id: ControlFrameId,
    pub stream_count: u64,
    pub unidirectional: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PingFrame {
    pub control_frame_id: ControlFrameId,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HandshakeDoneFrame {
    pub control_frame_id: ControlFrameId,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AckFrequencyFrame {
    pub control_frame_id: ControlFrameId,
    pub sequence_number: u64,
    pub packet_tolerance: u64,
    pub max_ack_delay: Duration,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Frame {
    Stream(StreamFrame),
    Crypto(CryptoFrame),
    RstStream(RstStreamFrame),
    WindowUpdate(WindowUpdateFrame),
    Blocked(BlockedFrame),
    StopSending(StopSendingFrame),
    MaxStreams(MaxStreamsFrame),
    StreamsBlocked(StreamsBlockedFrame),
    Ping(PingFrame),
    HandshakeDone(HandshakeDoneFrame),
    AckFrequency(AckFrequencyFrame),
}

impl Frame {
    /// Returns the control frame id, or [`INVALID_CONTROL_FRAME_ID`] for
    /// frames the control frame manager does not track
    #[inline]
    pub fn control_frame_id(&self) -> ControlFrameId {
        match self {
            Frame::Stream(_) | Frame::Crypto(_) => INVALID_CONTROL_FRAME_ID,
            Frame::RstStream(frame) => frame.control_frame_id,
            Frame::WindowUpdate(frame) => frame.control_frame_id,
            Frame::Blocked(frame) => frame.control_frame_id,
            Frame::StopSending(frame) => frame.control_frame_id,
            Frame::MaxStreams(frame) => frame.control_frame_id,
            Frame::StreamsBlocked(frame) => frame.control_frame_id,
            Frame::Ping(frame) => frame.control_frame_id,
            Frame::HandshakeDone(frame) => frame.control_frame_id,
            Frame::AckFrequency(frame) => frame.control_frame_id,
        }
    }

    /// Overwrites the control frame id. No-op for stream and crypto frames.
    #[inline]
    pub fn set_control_frame_id(&mut self, id: ControlFrameId) {
        match self {
            Frame::Stream(_) | Frame::Crypto(_) => {}
            Frame::RstStream(frame) => frame.control_frame_id = id,
            Frame::WindowUpdate(frame) => frame.control_frame_id = id,
            Frame::Blocked(frame) => frame.control_frame_id = id,
            Frame::StopSending(frame) => frame.control_frame_id = id,
            Frame::MaxStreams(frame) => frame.control_frame_id = id,
            Frame::StreamsBlocked(frame) => frame.control_frame_id = id,
            Frame::Ping(frame) => frame.control_frame_id = id,
            Frame::HandshakeDone(frame) => frame.control_frame_id = id,
            Frame::AckFrequency(frame) => frame.control_frame_id = id,
        }
    }

    #[inline]
    pub fn is_stream(&self) -> bool {
        matches!(self, Frame::Stream(_))
    }

    #[inline]
    pub fn is_crypto(&self) -> bool {
        matches!(self, Frame::Crypto(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn control_frame_id_round_trip() {
        let mut frame = Frame::WindowUpdate(WindowUpdateFrame {
            control_frame_id: 7,
            stream_id: 4,
            byte_offset: 1000,
        });
        assert_eq!(frame.control_frame_id(), 7);
        frame.set_control_frame_id(INVALID_CONTROL_FRAME_ID);
        assert_eq!(frame.control_frame_id(), INVALID_CONTROL_FRAME_ID);

        // stream frames never get a control frame id
        let mut stream = Frame::Stream(StreamFrame::default());
        stream.set_control_frame_id(9);
        assert_eq!(stream.control_frame_id(), INVALID_CONTROL_FRAME_ID);
    }
}
