// Copyright the tern-quic project authors. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use crate::{frame::Frame, time::Timestamp, transmission::TransmissionType};
use core::time::Duration;

/// The narrow capability through which the recovery machinery talks back to
/// the owning session.
///
/// The unacked packet map fans acked/lost frames out through this interface;
/// the session routes each frame to the stream, crypto stream or control
/// frame manager that produced it. All calls happen on the session thread.
pub trait SessionNotifier {
    /// Called when `frame` is acknowledged. Returns true if the frame
    /// carried data that had not been acknowledged before.
    fn on_frame_acked(
        &mut self,
        frame: &Frame,
        ack_delay: Duration,
        receive_timestamp: Option<Timestamp>,
    ) -> bool;

    /// Called when `frame` is declared lost
    fn on_frame_lost(&mut self, frame: &Frame);

    /// Called to retransmit `frames` with the given transmission type.
    /// Returns true if all frames were consumed.
    fn retransmit_frames(&mut self, frames: &[Frame], transmission_type: TransmissionType) -> bool;

    /// Returns true if `frame` is outstanding (sent and neither acked nor
    /// obsoleted by a newer frame)
    fn is_frame_outstanding(&self, frame: &Frame) -> bool;

    /// Returns true if any crypto data is waiting to be acknowledged
    fn has_unacked_crypto_data(&self) -> bool;

    /// Returns true if any stream data is waiting to be acknowledged
    fn has_unacked_stream_data(&self) -> bool;
}
