//! Peer handshake
//!
//! Exchanges info hash, peer id, and capability bits, and applies the
//! session's stream-encryption policy. The cipher negotiation itself
//! happens outside the engine; the handshake only carries the
//! capability flag the policy is checked against.

use anyhow::Result;
use bytes::{BufMut, BytesMut};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::EngineError;

/// Protocol identifier carried in every handshake
pub const PROTOCOL_NAME: &[u8; 19] = b"BitTorrent protocol";

/// Total encoded handshake size
pub const HANDSHAKE_LEN: usize = 68;

/// Reserved-bit masks: (byte index, mask)
const CAP_ENCRYPTION: (usize, u8) = (0, 0x80);
const CAP_EXTENSION: (usize, u8) = (5, 0x10);
const CAP_DHT: (usize, u8) = (7, 0x01);

/// Stream-encryption negotiation policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum EncryptionPolicy {
    /// Never negotiate encryption
    Disabled,
    /// Use encryption when the peer advertises support
    #[default]
    EnabledIfSupported,
    /// Drop peers that do not advertise support
    Required,
}

impl EncryptionPolicy {
    /// Whether a connection may proceed given the peer's capability
    pub fn permits(&self, peer_supports: bool) -> bool {
        match self {
            EncryptionPolicy::Disabled | EncryptionPolicy::EnabledIfSupported => true,
            EncryptionPolicy::Required => peer_supports,
        }
    }

    /// Whether our side advertises the encryption capability
    pub fn advertises(&self) -> bool {
        !matches!(self, EncryptionPolicy::Disabled)
    }
}

/// Decoded handshake frame
#[derive(Debug, Clone)]
pub struct Handshake {
    pub reserved: [u8; 8],
    pub info_hash: [u8; 20],
    pub peer_id: [u8; 20],
}

impl Handshake {
    /// Build our outgoing handshake with the engine's capability bits
    pub fn new(info_hash: [u8; 20], peer_id: [u8; 20], policy: EncryptionPolicy) -> Self {
        let mut reserved = [0u8; 8];
        reserved[CAP_EXTENSION.0] |= CAP_EXTENSION.1;
        reserved[CAP_DHT.0] |= CAP_DHT.1;
        if policy.advertises() {
            reserved[CAP_ENCRYPTION.0] |= CAP_ENCRYPTION.1;
        }
        Self {
            reserved,
            info_hash,
            peer_id,
        }
    }

    /// Generate a fresh peer id (client prefix + random tail)
    pub fn generate_peer_id() -> [u8; 20] {
        let mut peer_id = [0u8; 20];
        peer_id[..8].copy_from_slice(b"-RP0100-");
        peer_id[8..].copy_from_slice(&rand::random::<[u8; 12]>());
        peer_id
    }

    /// True when the peer speaks the extension protocol
    pub fn supports_extensions(&self) -> bool {
        self.reserved[CAP_EXTENSION.0] & CAP_EXTENSION.1 != 0
    }

    /// True when the peer advertises stream encryption
    pub fn supports_encryption(&self) -> bool {
        self.reserved[CAP_ENCRYPTION.0] & CAP_ENCRYPTION.1 != 0
    }

    /// True when the peer participates in the DHT
    pub fn supports_dht(&self) -> bool {
        self.reserved[CAP_DHT.0] & CAP_DHT.1 != 0
    }

    /// Encode to the 68-byte wire form
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(HANDSHAKE_LEN);
        buf.put_u8(PROTOCOL_NAME.len() as u8);
        buf.put_slice(PROTOCOL_NAME);
        buf.put_slice(&self.reserved);
        buf.put_slice(&self.info_hash);
        buf.put_slice(&self.peer_id);
        buf.to_vec()
    }

    /// Decode a 68-byte handshake frame
    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() != HANDSHAKE_LEN {
            return Err(EngineError::protocol_with_detail(
                "Bad handshake length",
                format!("expected {} bytes, got {}", HANDSHAKE_LEN, data.len()),
            )
            .into());
        }
        if data[0] as usize != PROTOCOL_NAME.len() || &data[1..20] != PROTOCOL_NAME {
            warn!("rejecting handshake with unknown protocol string");
            return Err(EngineError::protocol("Unknown protocol string").into());
        }
        let mut reserved = [0u8; 8];
        reserved.copy_from_slice(&data[20..28]);
        let mut info_hash = [0u8; 20];
        info_hash.copy_from_slice(&data[28..48]);
        let mut peer_id = [0u8; 20];
        peer_id.copy_from_slice(&data[48..68]);
        debug!(
            info_hash = %hex::encode(info_hash),
            peer_id = %hex::encode(peer_id),
            "decoded handshake"
        );
        Ok(Self {
            reserved,
            info_hash,
            peer_id,
        })
    }

    /// Check the peer's claimed info hash against ours
    pub fn matches_torrent(&self, expected: &[u8; 20]) -> bool {
        if self.info_hash != *expected {
            warn!(
                expected = %hex::encode(expected),
                got = %hex::encode(self.info_hash),
                "handshake info hash mismatch"
            );
            return false;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_decode_round_trip() {
        let hs = Handshake::new([1u8; 20], [2u8; 20], EncryptionPolicy::EnabledIfSupported);
        let encoded = hs.encode();
        assert_eq!(encoded.len(), HANDSHAKE_LEN);

        let decoded = Handshake::decode(&encoded).unwrap();
        assert_eq!(decoded.info_hash, hs.info_hash);
        assert_eq!(decoded.peer_id, hs.peer_id);
        assert_eq!(decoded.reserved, hs.reserved);
    }

    #[test]
    fn test_capability_bits() {
        let hs = Handshake::new([0u8; 20], [0u8; 20], EncryptionPolicy::EnabledIfSupported);
        assert!(hs.supports_extensions());
        assert!(hs.supports_dht());
        assert!(hs.supports_encryption());

        let plain = Handshake::new([0u8; 20], [0u8; 20], EncryptionPolicy::Disabled);
        assert!(!plain.supports_encryption());
    }

    #[test]
    fn test_policy_permits() {
        assert!(EncryptionPolicy::Disabled.permits(false));
        assert!(EncryptionPolicy::EnabledIfSupported.permits(false));
        assert!(!EncryptionPolicy::Required.permits(false));
        assert!(EncryptionPolicy::Required.permits(true));
    }

    #[test]
    fn test_rejects_unknown_protocol() {
        let mut data = Handshake::new([0u8; 20], [0u8; 20], EncryptionPolicy::Disabled).encode();
        data[1] = b'X';
        assert!(Handshake::decode(&data).is_err());
    }

    #[test]
    fn test_matches_torrent() {
        let hs = Handshake::new([5u8; 20], [0u8; 20], EncryptionPolicy::Disabled);
        assert!(hs.matches_torrent(&[5u8; 20]));
        assert!(!hs.matches_torrent(&[6u8; 20]));
    }

    #[test]
    fn test_generated_peer_id_has_client_prefix() {
        let id = Handshake::generate_peer_id();
        assert_eq!(&id[..8], b"-RP0100-");
    }
}
