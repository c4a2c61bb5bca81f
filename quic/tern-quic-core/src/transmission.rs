// Copyright the tern-quic project authors. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

/// Why a packet was transmitted
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum TransmissionType {
    /// First transmission of the data
    #[default]
    NotRetransmission,
    /// Retransmission driven by a loss declaration
    LossRetransmission,
    /// Retransmission driven by a probe timeout rather than an ack
    PtoRetransmission,
    /// Transmission sent to probe the path (e.g. MTU or bandwidth probing)
    ProbingRetransmission,
}

impl TransmissionType {
    /// Returns true if the transmission repeats previously sent data
    #[inline]
    pub fn is_retransmission(self) -> bool {
        !matches!(self, Self::NotRetransmission)
    }
}
