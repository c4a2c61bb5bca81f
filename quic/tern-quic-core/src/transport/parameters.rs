// Copyright the tern-quic project authors. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Transport parameters exchanged during the handshake.
//!
//! The core does not encode or decode the parameter extension itself; the
//! handshake layer hands it a fully parsed [`TransportParameters`] record.
//! This module owns the semantic checks: internal consistency, idle-timeout
//! negotiation, and the 0-RTT limit-reduction rules.

use crate::transport::error::{Code, Error};
use std::{
    collections::BTreeMap,
    net::{SocketAddrV4, SocketAddrV6},
};
use core::{fmt, time::Duration};

/// A 4-byte connection option tag
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Tag(pub [u8; 4]);

impl Tag {
    /// Enable bandwidth resumption from the max observed bandwidth
    pub const BWMX: Tag = Tag(*b"BWMX");
    /// Enable bandwidth resumption from the last observed bandwidth
    pub const BWRE: Tag = Tag(*b"BWRE");
    /// Allow seeding min RTT from an address token
    pub const TRTT: Tag = Tag(*b"TRTT");
    /// Enable bandwidth-sampler overestimate avoidance
    pub const BSAO: Tag = Tag(*b"BSAO");
    /// Disable adding ack height to the PROBE_UP queueing threshold
    pub const B2NA: Tag = Tag(*b"B2NA");
    /// Disable the "avoid unnecessary PROBE_RTT" optimization
    pub const B2RP: Tag = Tag(*b"B2RP");
    /// Enable flexible app-limited behavior in BBR
    pub const BBR9: Tag = Tag(*b"BBR9");
    /// Disable TLS resumption
    pub const NRES: Tag = Tag(*b"NRES");
}

impl fmt::Debug for Tag {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        for byte in self.0 {
            if byte.is_ascii_graphic() {
                write!(f, "{}", byte as char)?;
            } else {
                write!(f, "\\x{byte:02x}")?;
            }
        }
        Ok(())
    }
}

/// An ordered list of connection option tags
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ConnectionOptions {
    options: Vec<Tag>,
}

impl ConnectionOptions {
    pub fn new(options: Vec<Tag>) -> Self {
        Self { options }
    }

    #[inline]
    pub fn contains(&self, tag: Tag) -> bool {
        self.options.contains(&tag)
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.options.is_empty()
    }

    #[inline]
    pub fn iter(&self) -> impl Iterator<Item = Tag> + '_ {
        self.options.iter().copied()
    }

    pub fn push(&mut self, tag: Tag) {
        if !self.contains(tag) {
            self.options.push(tag);
        }
    }
}

/// A server's preferred address for migration after the handshake
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PreferredAddress {
    pub ipv4: Option<SocketAddrV4>,
    pub ipv6: Option<SocketAddrV6>,
    pub connection_id: Vec<u8>,
    pub stateless_reset_token: [u8; 16],
}

/// The transport parameter record the core reads and writes.
///
/// Defaults follow the protocol's omitted-parameter values.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransportParameters {
    /// Echoed by the server, bound to the first Initial DCID
    pub original_destination_connection_id: Option<Vec<u8>>,
    /// Zero disables the idle timeout
    pub max_idle_timeout: Duration,
    pub stateless_reset_token: Option<[u8; 16]>,
    /// The peer's MTU floor
    pub max_udp_payload_size: u64,
    /// Connection-level receive window
    pub initial_max_data: u64,
    pub initial_max_stream_data_bidi_local: u64,
    pub initial_max_stream_data_bidi_remote: u64,
    pub initial_max_stream_data_uni: u64,
    pub initial_max_streams_bidi: u64,
    pub initial_max_streams_uni: u64,
    /// Exponent used to encode the ACK delay field
    pub ack_delay_exponent: u8,
    /// Upper bound on how long the receiver delays acknowledgments
    pub max_ack_delay: Duration,
    /// Must be at most `max_ack_delay`
    pub min_ack_delay: Option<Duration>,
    pub disable_active_migration: bool,
    pub preferred_address: Option<PreferredAddress>,
    /// Peer connection id pool size
    pub active_connection_id_limit: u64,
    pub initial_source_connection_id: Option<Vec<u8>>,
    pub retry_source_connection_id: Option<Vec<u8>>,
    /// 4-byte option tags steering algorithm variants
    pub google_connection_options: ConnectionOptions,
    /// Opaque passthrough, never interpreted by the core
    pub google_handshake_message: Option<Vec<u8>>,
    /// Opaque parameters by id, never interpreted by the core
    pub custom_parameters: BTreeMap<u64, Vec<u8>>,
}

/// The smallest max_udp_payload_size a peer may advertise
const MIN_MAX_UDP_PAYLOAD_SIZE: u64 = 1200;
/// The largest valid ack_delay_exponent
const MAX_ACK_DELAY_EXPONENT: u8 = 20;

impl Default for TransportParameters {
    fn default() -> Self {
        Self {
            original_destination_connection_id: None,
            max_idle_timeout: Duration::ZERO,
            stateless_reset_token: None,
            max_udp_payload_size: 65527,
            initial_max_data: 0,
            initial_max_stream_data_bidi_local: 0,
            initial_max_stream_data_bidi_remote: 0,
            initial_max_stream_data_uni: 0,
            initial_max_streams_bidi: 0,
            initial_max_streams_uni: 0,
            ack_delay_exponent: 3,
            max_ack_delay: Duration::from_millis(25),
            min_ack_delay: None,
            disable_active_migration: false,
            preferred_address: None,
            active_connection_id_limit: 2,
            initial_source_connection_id: None,
            retry_source_connection_id: None,
            google_connection_options: ConnectionOptions::default(),
            google_handshake_message: None,
            custom_parameters: BTreeMap::new(),
        }
    }
}

impl TransportParameters {
    /// Checks the internal consistency of a received parameter record
    pub fn validate(&self) -> Result<(), Error> {
        if self.ack_delay_exponent > MAX_ACK_DELAY_EXPONENT {
            return Err(Error::new(Code::ProtocolViolation).with_reason("Invalid ack_delay_exponent"));
        }
        if self.max_udp_payload_size < MIN_MAX_UDP_PAYLOAD_SIZE {
            return Err(
                Error::new(Code::ProtocolViolation).with_reason("Invalid max_udp_payload_size")
            );
        }
        if let Some(min_ack_delay) = self.min_ack_delay {
            if min_ack_delay > self.max_ack_delay {
                return Err(
                    Error::new(Code::ProtocolViolation).with_reason("min_ack_delay > max_ack_delay")
                );
            }
        }
        Ok(())
    }

    /// Returns the effective idle timeout: the min of both non-zero values,
    /// or whichever side enables it, or `None` when both sides disable it
    pub fn negotiated_idle_timeout(&self, peer: &TransportParameters) -> Option<Duration> {
        match (self.max_idle_timeout, peer.max_idle_timeout) {
            (Duration::ZERO, Duration::ZERO) => None,
            (Duration::ZERO, peer_timeout) => Some(peer_timeout),
            (local_timeout, Duration::ZERO) => Some(local_timeout),
            (local_timeout, peer_timeout) => Some(local_timeout.min(peer_timeout)),
        }
    }
}

/// The flow control limits a client cached from a previous connection and
/// has already relied on while sending 0-RTT data
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ZeroRttLimits {
    pub initial_max_data: u64,
    pub initial_max_stream_data_bidi_local: u64,
    pub initial_max_stream_data_bidi_remote: u64,
    pub initial_max_stream_data_uni: u64,
    pub initial_max_streams_bidi: u64,
    pub initial_max_streams_uni: u64,
}

impl ZeroRttLimits {
    pub fn from_parameters(parameters: &TransportParameters) -> Self {
        Self {
            initial_max_data: parameters.initial_max_data,
            initial_max_stream_data_bidi_local: parameters.initial_max_stream_data_bidi_local,
            initial_max_stream_data_bidi_remote: parameters.initial_max_stream_data_bidi_remote,
            initial_max_stream_data_uni: parameters.initial_max_stream_data_uni,
            initial_max_streams_bidi: parameters.initial_max_streams_bidi,
            initial_max_streams_uni: parameters.initial_max_streams_uni,
        }
    }

    /// Checks that the handshake-provided limits are no smaller than the
    /// cached limits 0-RTT data was sent against.
    ///
    /// A reduction is fatal either way; the error code records whether the
    /// server had accepted the 0-RTT data.
    pub fn check_not_reduced(
        &self,
        peer: &TransportParameters,
        zero_rtt_accepted: bool,
    ) -> Result<(), Error> {
        let code = if zero_rtt_accepted {
            Code::ZeroRttResumptionLimitReduced
        } else {
            Code::ZeroRttRejectionLimitReduced
        };

        let checks = [
            (peer.initial_max_data, self.initial_max_data, "initial_max_data reduced"),
            (
                peer.initial_max_stream_data_bidi_local,
                self.initial_max_stream_data_bidi_local,
                "initial_max_stream_data_bidi_local reduced",
            ),
            (
                peer.initial_max_stream_data_bidi_remote,
                self.initial_max_stream_data_bidi_remote,
                "initial_max_stream_data_bidi_remote reduced",
            ),
            (
                peer.initial_max_stream_data_uni,
                self.initial_max_stream_data_uni,
                "initial_max_stream_data_uni reduced",
            ),
            (
                peer.initial_max_streams_bidi,
                self.initial_max_streams_bidi,
                "initial_max_streams_bidi reduced",
            ),
            (
                peer.initial_max_streams_uni,
                self.initial_max_streams_uni,
                "initial_max_streams_uni reduced",
            ),
        ];

        for (provided, cached, reason) in checks {
            if provided < cached {
                return Err(Error::new(code).with_reason(reason));
            }
        }
        Ok(())
    }
}
