//! Resume records
//!
//! Durable snapshot of a torrent's progress: bitfield, file
//! priorities, save path, queue position, labels, and counters. A
//! record is never the sole source of truth; piece data is re-checked
//! whenever the on-disk file sizes disagree with what was recorded.

use std::path::PathBuf;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::EngineError;
use crate::piece::Bitfield;
use crate::torrent::state::FilePriority;

/// Current record format; older records are migrated forward on load
pub const RESUME_FORMAT_VERSION: u32 = 1;

/// Durable per-torrent snapshot, keyed by content hash
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResumeRecord {
    pub version: u32,
    /// Content hash in hex; doubles as the record's file name
    pub info_hash: String,
    pub name: String,
    /// Packed have-bitfield
    pub bitfield: Vec<u8>,
    pub piece_count: usize,
    pub file_priorities: Vec<FilePriority>,
    pub save_path: PathBuf,
    pub queue_position: u32,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub category: Option<String>,
    pub uploaded: u64,
    pub downloaded: u64,
    #[serde(default)]
    pub seeding_secs: u64,
    #[serde(default)]
    pub paused: bool,
    #[serde(default)]
    pub sequential: bool,
    /// File sizes at save time, checked against the disk on load
    #[serde(default)]
    pub file_sizes: Vec<u64>,
}

impl ResumeRecord {
    /// Decode a record, migrating older versions forward
    pub fn migrate(value: serde_json::Value) -> Result<Self> {
        let version = value
            .get("version")
            .and_then(|v| v.as_u64())
            .unwrap_or(0) as u32;
        if version > RESUME_FORMAT_VERSION {
            return Err(EngineError::resume_with_detail(
                "Record from a newer engine",
                format!("version {}", version),
            )
            .into());
        }
        // Fields added since the record was written take their serde
        // defaults; that is the whole migration story so far
        let mut record: ResumeRecord = serde_json::from_value(value)?;
        if record.version < RESUME_FORMAT_VERSION {
            debug!(
                from = record.version,
                to = RESUME_FORMAT_VERSION,
                hash = %record.info_hash,
                "migrated resume record"
            );
            record.version = RESUME_FORMAT_VERSION;
        }
        Ok(record)
    }

    /// Reconstruct the have-bitfield
    pub fn bitfield(&self) -> Result<Bitfield> {
        Bitfield::from_bytes(&self.bitfield, self.piece_count)
    }

    /// True when on-disk sizes match what was recorded; a mismatch
    /// means the payload changed behind our back
    pub fn sizes_match(&self, observed: &[Option<u64>]) -> bool {
        if self.file_sizes.is_empty() {
            // Legacy record without sizes: nothing to compare
            return true;
        }
        if self.file_sizes.len() != observed.len() {
            return false;
        }
        self.file_sizes
            .iter()
            .zip(observed)
            .all(|(expected, actual)| *actual == Some(*expected))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record() -> ResumeRecord {
        ResumeRecord {
            version: RESUME_FORMAT_VERSION,
            info_hash: "aa".repeat(20),
            name: "linux.iso".to_string(),
            bitfield: vec![0b1010_0000],
            piece_count: 4,
            file_priorities: vec![FilePriority::High],
            save_path: PathBuf::from("/data"),
            queue_position: 2,
            tags: vec!["iso".to_string()],
            category: Some("linux".to_string()),
            uploaded: 10,
            downloaded: 20,
            seeding_secs: 30,
            paused: false,
            sequential: true,
            file_sizes: vec![4096],
        }
    }

    #[test]
    fn test_json_round_trip_preserves_everything() {
        let original = record();
        let encoded = serde_json::to_value(&original).unwrap();
        let decoded = ResumeRecord::migrate(encoded).unwrap();
        assert_eq!(decoded, original);
    }

    #[test]
    fn test_bitfield_reconstruction() {
        let bf = record().bitfield().unwrap();
        assert!(bf.get(0));
        assert!(!bf.get(1));
        assert!(bf.get(2));
        assert_eq!(bf.len(), 4);
    }

    #[test]
    fn test_legacy_record_gains_defaults() {
        // A version-0 record predating tags, category, and file sizes
        let legacy = json!({
            "version": 0,
            "info_hash": "bb".repeat(20),
            "name": "old.bin",
            "bitfield": [0u8],
            "piece_count": 3,
            "file_priorities": ["Normal"],
            "save_path": "/data",
            "queue_position": 0,
            "uploaded": 0,
            "downloaded": 0
        });
        let migrated = ResumeRecord::migrate(legacy).unwrap();
        assert_eq!(migrated.version, RESUME_FORMAT_VERSION);
        assert!(migrated.tags.is_empty());
        assert!(migrated.category.is_none());
        assert!(migrated.file_sizes.is_empty());
    }

    #[test]
    fn test_future_version_rejected() {
        let mut value = serde_json::to_value(record()).unwrap();
        value["version"] = json!(99);
        assert!(ResumeRecord::migrate(value).is_err());
    }

    #[test]
    fn test_sizes_match() {
        let r = record();
        assert!(r.sizes_match(&[Some(4096)]));
        assert!(!r.sizes_match(&[Some(1000)]));
        assert!(!r.sizes_match(&[None]));
        assert!(!r.sizes_match(&[]));

        let mut legacy = r;
        legacy.file_sizes.clear();
        assert!(legacy.sizes_match(&[Some(1), Some(2)]));
    }
}
