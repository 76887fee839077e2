//! Identifiers used on the cluster bus.
//!
//! `NodeId` wraps a u64 but displays as a 16-character hex string.
//! `SessionId` is the opaque client session id shared by every node.
//! `RequestId` correlates a request with its responses.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt::{self, Display, Formatter};
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum NodeIdError {
    #[error("Invalid node ID format: expected 16 hex chars")]
    InvalidFormat,
    #[error("Invalid hex: {0}")]
    InvalidHex(#[from] std::num::ParseIntError),
}

/// A unique identifier for a node in the cluster, chosen at process start.
///
/// # Examples
/// ```
/// use cluster_core::NodeId;
///
/// let parsed: NodeId = "a1b2c3d4e5f67890".parse().unwrap();
/// assert_eq!(parsed.as_u64(), 0xa1b2c3d4e5f67890);
/// assert_eq!(parsed.to_string(), "a1b2c3d4e5f67890");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(u64);

impl NodeId {
    /// Generate a new random node ID. Never returns zero.
    pub fn generate() -> Self {
        loop {
            let id: u64 = rand::rng().random();
            if id != 0 {
                return Self(id);
            }
        }
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Display for NodeId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

impl FromStr for NodeId {
    type Err = NodeIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() == 16 && s.chars().all(|c| c.is_ascii_hexdigit()) {
            let id = u64::from_str_radix(&s.to_ascii_lowercase(), 16)?;
            return Ok(Self(id));
        }
        Err(NodeIdError::InvalidFormat)
    }
}

impl From<u64> for NodeId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

// Hex string on the wire, same as in logs
impl Serialize for NodeId {
    fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for NodeId {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let s = String::deserialize(d)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Correlates a request with its responses. Random, so collisions are
/// possible but negligible within a pending window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(u64);

impl RequestId {
    pub fn generate() -> Self {
        Self(rand::rng().random())
    }
}

impl From<u64> for RequestId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

impl Display for RequestId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Length of every session id handed out to clients.
pub const SESSION_ID_LEN: usize = 20;

const SESSION_ID_ALPHABET: &[u8] =
    b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789-_";

/// Identifies a logical client connection, stable across handoffs and
/// transport upgrades.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    /// Generate a new URL-safe session id of `SESSION_ID_LEN` characters.
    pub fn generate() -> Self {
        let mut rng = rand::rng();
        let id = (0..SESSION_ID_LEN)
            .map(|_| SESSION_ID_ALPHABET[rng.random_range(0..SESSION_ID_ALPHABET.len())] as char)
            .collect();
        Self(id)
    }

    /// Wrap a client-supplied id without validating it.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Whether this id could have been issued by some node. Ids failing this
    /// check are rejected before any cluster query.
    pub fn is_well_formed(&self) -> bool {
        self.0.len() == SESSION_ID_LEN && self.0.bytes().all(|b| SESSION_ID_ALPHABET.contains(&b))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for SessionId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_zero_padded() {
        let node_id = NodeId(0xff);
        assert_eq!(node_id.to_string(), "00000000000000ff");
    }

    #[test]
    fn test_parse_uppercase_hex() {
        let node_id: NodeId = "A1B2C3D4E5F67890".parse().unwrap();
        assert_eq!(node_id.as_u64(), 0xa1b2c3d4e5f67890);
    }

    #[test]
    fn test_reject_wrong_length() {
        assert!("a1b2c3d4e5f6789".parse::<NodeId>().is_err());
        assert!("a1b2c3d4e5f678901".parse::<NodeId>().is_err());
        assert!("".parse::<NodeId>().is_err());
        assert!("ghijklmnopqrstuv".parse::<NodeId>().is_err());
    }

    #[test]
    fn test_generate_not_zero() {
        for _ in 0..1000 {
            assert_ne!(NodeId::generate().as_u64(), 0);
        }
    }

    #[test]
    fn test_node_id_serializes_as_hex_string() {
        let json = serde_json::to_string(&NodeId(0xab)).unwrap();
        assert_eq!(json, "\"00000000000000ab\"");
        let parsed: NodeId = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, NodeId(0xab));
    }

    #[test]
    fn test_generated_session_id_is_well_formed() {
        for _ in 0..100 {
            let sid = SessionId::generate();
            assert_eq!(sid.as_str().len(), SESSION_ID_LEN);
            assert!(sid.is_well_formed());
        }
    }

    #[test]
    fn test_malformed_session_ids() {
        assert!(!SessionId::new("short").is_well_formed());
        assert!(!SessionId::new("abcdefghijklmnopqrstu").is_well_formed());
        assert!(!SessionId::new("abcdefghijklmnopqr/=").is_well_formed());
        assert!(SessionId::new("abcdefghijklmnopqr-_").is_well_formed());
    }

    #[test]
    fn test_request_id_is_a_json_number() {
        let json = serde_json::to_string(&RequestId::from(42)).unwrap();
        assert_eq!(json, "42");
    }
}
