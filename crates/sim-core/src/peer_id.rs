//! Peer identifiers.
//!
//! A [`PeerId`] is a non-zero `u64` shown as 16 zero-padded hex digits.
//! Numeric order and string order agree, so an edge sorts its endpoints the
//! same way in memory and on the wire.

use std::fmt;
use std::str::FromStr;

use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PeerIdError {
    #[error("Invalid peer ID {0:?}: expected 16 hex digits")]
    InvalidFormat(String),
    #[error("Invalid hex: {0}")]
    InvalidHex(#[from] std::num::ParseIntError),
}

/// Identifier for a simulated peer.
///
/// ```
/// use sim_core::PeerId;
///
/// let id: PeerId = "00000000000000ff".parse().unwrap();
/// assert_eq!(id.as_u64(), 0xff);
/// assert_eq!(id.to_string(), "00000000000000ff");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct PeerId(u64);

impl PeerId {
    /// A fresh random ID.
    pub fn generate() -> Self {
        Self(rand::rng().random_range(1..=u64::MAX))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

impl FromStr for PeerId {
    type Err = PeerIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != 16 || !s.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(PeerIdError::InvalidFormat(s.to_string()));
        }
        Ok(Self(u64::from_str_radix(s, 16)?))
    }
}

impl TryFrom<String> for PeerId {
    type Error = PeerIdError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<PeerId> for String {
    fn from(id: PeerId) -> String {
        id.to_string()
    }
}

impl From<u64> for PeerId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

impl From<PeerId> for u64 {
    fn from(id: PeerId) -> u64 {
        id.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trips_through_text() {
        let id = PeerId(0xa1b2c3d4e5f67890);
        assert_eq!("A1B2C3D4E5F67890".parse::<PeerId>().unwrap(), id);

        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"a1b2c3d4e5f67890\"");
        assert_eq!(serde_json::from_str::<PeerId>(&json).unwrap(), id);
    }

    #[test]
    fn test_order_matches_text_order() {
        let ids = [PeerId(0x0f), PeerId(0xf0), PeerId(0x100)];
        for pair in ids.windows(2) {
            assert!(pair[0] < pair[1]);
            assert!(pair[0].to_string() < pair[1].to_string());
        }
    }

    #[test]
    fn test_rejects_malformed() {
        for bad in ["", "ff", "ghijklmnopqrstuv", "a1b2c3d4e5f678901", "+1b2c3d4e5f67890"] {
            assert!(bad.parse::<PeerId>().is_err(), "accepted {:?}", bad);
        }
        assert!(serde_json::from_str::<PeerId>("\"zz\"").is_err());
    }

    #[test]
    fn test_generated_ids_are_non_zero() {
        assert!((0..1000).all(|_| PeerId::generate().as_u64() != 0));
    }
}
