// Copyright the tern-quic project authors. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Supported wire versions and mutual version selection.
//!
//! Version negotiation is purely a list intersection: the client offers the
//! versions it speaks in preference order and the first mutually supported
//! one wins. The manager exists so the session can disable versions at
//! runtime without rebuilding its endpoint configuration.

/// A protocol version with its 32-bit wire label
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Version {
    /// QUIC v1 (RFC 9000)
    V1,
    /// The final pre-RFC IETF draft
    Draft29,
}

impl Version {
    /// All versions this implementation can speak, most preferred first
    pub const ALL: [Self; 2] = [Self::V1, Self::Draft29];

    /// Returns the 32-bit version label used on the wire
    #[inline]
    pub const fn label(self) -> u32 {
        match self {
            Self::V1 => 0x0000_0001,
            Self::Draft29 => 0xff00_001d,
        }
    }

    /// Looks up a version by wire label
    #[inline]
    pub fn from_label(label: u32) -> Option<Self> {
        Self::ALL.into_iter().find(|version| version.label() == label)
    }
}

/// Tracks which versions are currently enabled for negotiation
#[derive(Clone, Debug)]
pub struct VersionManager {
    enabled: Vec<Version>,
}

impl Default for VersionManager {
    fn default() -> Self {
        Self {
            enabled: Version::ALL.to_vec(),
        }
    }
}

impl VersionManager {
    /// The currently enabled versions, most preferred first
    #[inline]
    pub fn supported_versions(&self) -> &[Version] {
        &self.enabled
    }

    /// Disables a version; a no-op if it was already disabled
    pub fn disable(&mut self, version: Version) {
        self.enabled.retain(|enabled| *enabled != version);
    }

    /// Enables a version in its canonical preference position
    pub fn enable(&mut self, version: Version) {
        if !self.enabled.contains(&version) {
            let enabled = Version::ALL
                .into_iter()
                .filter(|candidate| *candidate == version || self.enabled.contains(candidate))
                .collect();
            self.enabled = enabled;
        }
    }

    /// Returns true if `version` is currently enabled
    #[inline]
    pub fn is_supported(&self, version: Version) -> bool {
        self.enabled.contains(&version)
    }

    /// Selects the first of the peer's offered labels that is enabled
    /// locally, in the peer's preference order
    pub fn negotiate(&self, offered: &[u32]) -> Option<Version> {
        offered
            .iter()
            .filter_map(|label| Version::from_label(*label))
            .find(|version| self.is_supported(*version))
    }
}
