//! Decoded torrent descriptors
//!
//! The engine never parses bencoded .torrent files; an external decoder
//! supplies these types (piece count, piece length, file layout, piece
//! digests). A magnet add starts from a bare `MagnetTarget` and gains a
//! `TorrentMeta` once metadata arrives.

use std::path::PathBuf;

use anyhow::Result;
use sha1::{Digest, Sha1};
use sha2::Sha256;

use crate::error::EngineError;

/// Content hash identifying a torrent (v1 or v2)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InfoHash {
    V1([u8; 20]),
    V2([u8; 32]),
}

impl InfoHash {
    /// Raw hash bytes
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            InfoHash::V1(h) => h,
            InfoHash::V2(h) => h,
        }
    }

    /// Hex rendering, used as the resume-record key
    pub fn to_hex(&self) -> String {
        hex::encode(self.as_bytes())
    }

    /// Parse a 40- or 64-character hex string
    pub fn from_hex(s: &str) -> Result<Self> {
        let bytes = hex::decode(s).map_err(|e| {
            EngineError::config_with_field(format!("invalid info hash hex: {}", e), "info_hash")
        })?;
        match bytes.len() {
            20 => {
                let mut h = [0u8; 20];
                h.copy_from_slice(&bytes);
                Ok(InfoHash::V1(h))
            }
            32 => {
                let mut h = [0u8; 32];
                h.copy_from_slice(&bytes);
                Ok(InfoHash::V2(h))
            }
            n => Err(EngineError::config_with_field(
                format!("info hash must be 20 or 32 bytes, got {}", n),
                "info_hash",
            )
            .into()),
        }
    }

    /// 20-byte form used in the wire handshake (v2 hashes truncate)
    pub fn handshake_bytes(&self) -> [u8; 20] {
        match self {
            InfoHash::V1(h) => *h,
            InfoHash::V2(h) => {
                let mut out = [0u8; 20];
                out.copy_from_slice(&h[..20]);
                out
            }
        }
    }
}

/// Expected digest of a single piece
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PieceDigest {
    Sha1([u8; 20]),
    Sha256([u8; 32]),
}

impl PieceDigest {
    /// Recompute the digest over `data` and compare
    pub fn matches(&self, data: &[u8]) -> bool {
        match self {
            PieceDigest::Sha1(expected) => {
                let mut hasher = Sha1::new();
                hasher.update(data);
                hasher.finalize().as_slice() == expected
            }
            PieceDigest::Sha256(expected) => {
                let mut hasher = Sha256::new();
                hasher.update(data);
                hasher.finalize().as_slice() == expected
            }
        }
    }

    /// Digest of `data` with the same algorithm, for test fixtures
    pub fn of(data: &[u8], v2: bool) -> Self {
        if v2 {
            let mut hasher = Sha256::new();
            hasher.update(data);
            PieceDigest::Sha256(hasher.finalize().into())
        } else {
            let mut hasher = Sha1::new();
            hasher.update(data);
            PieceDigest::Sha1(hasher.finalize().into())
        }
    }
}

/// One file within the torrent payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    /// Path relative to the save path
    pub path: PathBuf,
    /// File size in bytes
    pub length: u64,
    /// Byte offset of the file within the torrent payload
    pub offset: u64,
}

/// Decoded torrent descriptor supplied by the external decoder
#[derive(Debug, Clone)]
pub struct TorrentMeta {
    /// Content hash
    pub info_hash: InfoHash,
    /// Display name
    pub name: String,
    /// Piece size in bytes (last piece may be shorter)
    pub piece_length: u32,
    /// Total payload size in bytes
    pub total_size: u64,
    /// Per-piece expected digests
    pub digests: Vec<PieceDigest>,
    /// Ordered file layout with byte ranges
    pub files: Vec<FileEntry>,
    /// Tracker announce URLs organized into tiers
    pub trackers: Vec<Vec<String>>,
    /// Private torrent: tracker-only peer discovery
    pub private: bool,
}

impl TorrentMeta {
    /// Number of pieces
    pub fn piece_count(&self) -> usize {
        self.digests.len()
    }

    /// Size of a specific piece (the final piece may be short)
    pub fn piece_size(&self, index: u32) -> u32 {
        let start = u64::from(index) * u64::from(self.piece_length);
        let remaining = self.total_size.saturating_sub(start);
        remaining.min(u64::from(self.piece_length)) as u32
    }

    /// Check internal consistency of a decoded descriptor
    pub fn validate(&self) -> Result<()> {
        if self.piece_length == 0 {
            return Err(EngineError::config_with_field("piece length is zero", "piece_length").into());
        }
        if self.files.is_empty() {
            return Err(EngineError::config_with_field("file list is empty", "files").into());
        }
        let file_total: u64 = self.files.iter().map(|f| f.length).sum();
        if file_total != self.total_size {
            return Err(EngineError::config_with_field(
                format!("file sizes sum to {}, expected {}", file_total, self.total_size),
                "files",
            )
            .into());
        }
        let expected_pieces =
            (self.total_size.div_ceil(u64::from(self.piece_length))).max(1) as usize;
        if self.digests.len() != expected_pieces {
            return Err(EngineError::config_with_field(
                format!("{} digests for {} pieces", self.digests.len(), expected_pieces),
                "digests",
            )
            .into());
        }
        let mut cursor = 0u64;
        for file in &self.files {
            if file.offset != cursor {
                return Err(EngineError::config_with_field(
                    format!("file {:?} offset {} != running total {}", file.path, file.offset, cursor),
                    "files",
                )
                .into());
            }
            cursor += file.length;
        }
        Ok(())
    }
}

/// Magnet identifier: content hash plus optional bootstrap trackers
#[derive(Debug, Clone)]
pub struct MagnetTarget {
    pub info_hash: InfoHash,
    pub display_name: Option<String>,
    pub trackers: Vec<String>,
}

impl MagnetTarget {
    /// Create a magnet target for a bare content hash
    pub fn new(info_hash: InfoHash) -> Self {
        Self {
            info_hash,
            display_name: None,
            trackers: Vec::new(),
        }
    }
}

#[cfg(test)]
pub(crate) fn single_file_meta(piece_length: u32, payload: &[u8]) -> TorrentMeta {
    let digests = payload
        .chunks(piece_length as usize)
        .map(|chunk| PieceDigest::of(chunk, false))
        .collect::<Vec<_>>();
    TorrentMeta {
        info_hash: InfoHash::V1([7u8; 20]),
        name: "fixture".to_string(),
        piece_length,
        total_size: payload.len() as u64,
        digests,
        files: vec![FileEntry {
            path: PathBuf::from("fixture.bin"),
            length: payload.len() as u64,
            offset: 0,
        }],
        trackers: Vec::new(),
        private: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_info_hash_hex_round_trip() {
        let hash = InfoHash::V1([0xAB; 20]);
        let parsed = InfoHash::from_hex(&hash.to_hex()).unwrap();
        assert_eq!(parsed, hash);

        let v2 = InfoHash::V2([0x01; 32]);
        assert_eq!(InfoHash::from_hex(&v2.to_hex()).unwrap(), v2);
    }

    #[test]
    fn test_info_hash_rejects_bad_length() {
        assert!(InfoHash::from_hex("abcd").is_err());
    }

    #[test]
    fn test_v2_handshake_truncation() {
        let mut full = [0u8; 32];
        for (i, b) in full.iter_mut().enumerate() {
            *b = i as u8;
        }
        let truncated = InfoHash::V2(full).handshake_bytes();
        assert_eq!(&truncated[..], &full[..20]);
    }

    #[test]
    fn test_piece_digest_matches() {
        let data = b"piece payload";
        assert!(PieceDigest::of(data, false).matches(data));
        assert!(!PieceDigest::of(data, false).matches(b"other payload"));
        assert!(PieceDigest::of(data, true).matches(data));
    }

    #[test]
    fn test_piece_size_last_piece_short() {
        let meta = single_file_meta(1024, &vec![0u8; 1500]);
        assert_eq!(meta.piece_count(), 2);
        assert_eq!(meta.piece_size(0), 1024);
        assert_eq!(meta.piece_size(1), 476);
    }

    #[test]
    fn test_validate_accepts_fixture() {
        let meta = single_file_meta(1024, &vec![0u8; 4096]);
        assert!(meta.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_size_mismatch() {
        let mut meta = single_file_meta(1024, &vec![0u8; 2048]);
        meta.total_size = 4096;
        assert!(meta.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_bad_offsets() {
        let mut meta = single_file_meta(1024, &vec![0u8; 2048]);
        meta.files.push(FileEntry {
            path: PathBuf::from("extra.bin"),
            length: 0,
            offset: 99,
        });
        assert!(meta.validate().is_err());
    }
}
