//! Resume store
//!
//! One record file per torrent under a resume directory. Writes go to
//! a temporary file first and land with an atomic rename, so a crash
//! mid-write leaves the previous record intact. A record that fails to
//! decode is not an error: the caller gets `Recheck` and re-validates
//! the on-disk data instead.

use std::path::PathBuf;

use anyhow::Result;
use tokio::fs;
use tracing::{debug, info, warn};

use crate::error::EngineError;
use crate::resume::record::ResumeRecord;
use crate::torrent::metadata::InfoHash;

/// How a load attempt resolved
#[derive(Debug)]
pub enum ResumeOutcome {
    /// Record decoded (and migrated if needed)
    Loaded(ResumeRecord),
    /// Record exists but cannot be trusted; re-check the payload
    Recheck(String),
    /// No record on disk
    Missing,
}

/// Directory-backed resume persistence
pub struct ResumeStore {
    dir: PathBuf,
}

impl ResumeStore {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    fn record_path(&self, hex: &str) -> PathBuf {
        self.dir.join(format!("{}.resume", hex))
    }

    fn temp_path(&self, hex: &str) -> PathBuf {
        self.dir.join(format!("{}.resume.tmp", hex))
    }

    /// Persist a record atomically (write-temp-then-rename)
    pub async fn save(&self, record: &ResumeRecord) -> Result<()> {
        fs::create_dir_all(&self.dir).await?;
        let tmp = self.temp_path(&record.info_hash);
        let target = self.record_path(&record.info_hash);

        let encoded = serde_json::to_vec_pretty(record)?;
        fs::write(&tmp, &encoded).await.map_err(|e| {
            EngineError::disk_full("resume write failed", tmp.display().to_string(), e.to_string())
        })?;
        fs::rename(&tmp, &target).await.map_err(|e| {
            EngineError::disk_full("resume rename failed", target.display().to_string(), e.to_string())
        })?;
        debug!(hash = %record.info_hash, "resume record saved");
        Ok(())
    }

    /// Load the record for a torrent
    pub async fn load(&self, info_hash: &InfoHash) -> ResumeOutcome {
        let path = self.record_path(&info_hash.to_hex());
        let raw = match fs::read(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return ResumeOutcome::Missing,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "resume record unreadable");
                return ResumeOutcome::Recheck(e.to_string());
            }
        };
        let value: serde_json::Value = match serde_json::from_slice(&raw) {
            Ok(value) => value,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "resume record corrupt");
                return ResumeOutcome::Recheck(e.to_string());
            }
        };
        match ResumeRecord::migrate(value) {
            Ok(record) => ResumeOutcome::Loaded(record),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "resume record unmigratable");
                ResumeOutcome::Recheck(e.to_string())
            }
        }
    }

    /// Remove a torrent's record
    pub async fn delete(&self, info_hash: &InfoHash) -> Result<()> {
        let path = self.record_path(&info_hash.to_hex());
        match fs::remove_file(&path).await {
            Ok(()) => {
                info!(hash = %info_hash.to_hex(), "resume record deleted");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Hex keys of every stored record
    pub async fn list(&self) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        let mut entries = match fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(keys),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "resume") {
                if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                    keys.push(stem.to_string());
                }
            }
        }
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::torrent::state::FilePriority;

    fn record(hash: &InfoHash) -> ResumeRecord {
        ResumeRecord {
            version: crate::resume::RESUME_FORMAT_VERSION,
            info_hash: hash.to_hex(),
            name: "payload".to_string(),
            bitfield: vec![0b1100_0000],
            piece_count: 4,
            file_priorities: vec![FilePriority::Normal, FilePriority::Skip],
            save_path: PathBuf::from("/data"),
            queue_position: 1,
            tags: vec!["tag".to_string()],
            category: None,
            uploaded: 1,
            downloaded: 2,
            seeding_secs: 3,
            paused: false,
            sequential: false,
            file_sizes: vec![100, 200],
        }
    }

    #[tokio::test]
    async fn test_save_load_round_trip() {
        let dir = std::env::temp_dir().join("riptide_resume_round_trip");
        let _ = fs::remove_dir_all(&dir).await;
        let store = ResumeStore::new(dir.clone());
        let hash = InfoHash::V1([0x11; 20]);

        let original = record(&hash);
        store.save(&original).await.unwrap();

        match store.load(&hash).await {
            ResumeOutcome::Loaded(loaded) => {
                assert_eq!(loaded, original);
                assert_eq!(loaded.bitfield().unwrap(), original.bitfield().unwrap());
            }
            other => panic!("expected Loaded, got {:?}", other),
        }

        let _ = fs::remove_dir_all(&dir).await;
    }

    #[tokio::test]
    async fn test_missing_record() {
        let dir = std::env::temp_dir().join("riptide_resume_missing");
        let _ = fs::remove_dir_all(&dir).await;
        let store = ResumeStore::new(dir);
        assert!(matches!(
            store.load(&InfoHash::V1([0u8; 20])).await,
            ResumeOutcome::Missing
        ));
    }

    #[tokio::test]
    async fn test_corrupt_record_demotes_to_recheck() {
        let dir = std::env::temp_dir().join("riptide_resume_corrupt");
        let _ = fs::remove_dir_all(&dir).await;
        fs::create_dir_all(&dir).await.unwrap();
        let hash = InfoHash::V1([0x22; 20]);
        fs::write(dir.join(format!("{}.resume", hash.to_hex())), b"{not json")
            .await
            .unwrap();

        let store = ResumeStore::new(dir.clone());
        assert!(matches!(store.load(&hash).await, ResumeOutcome::Recheck(_)));

        let _ = fs::remove_dir_all(&dir).await;
    }

    #[tokio::test]
    async fn test_save_leaves_no_temp_file() {
        let dir = std::env::temp_dir().join("riptide_resume_no_tmp");
        let _ = fs::remove_dir_all(&dir).await;
        let store = ResumeStore::new(dir.clone());
        let hash = InfoHash::V1([0x33; 20]);
        store.save(&record(&hash)).await.unwrap();

        let tmp = dir.join(format!("{}.resume.tmp", hash.to_hex()));
        assert!(!tmp.exists());

        let _ = fs::remove_dir_all(&dir).await;
    }

    #[tokio::test]
    async fn test_overwrite_keeps_single_record() {
        let dir = std::env::temp_dir().join("riptide_resume_overwrite");
        let _ = fs::remove_dir_all(&dir).await;
        let store = ResumeStore::new(dir.clone());
        let hash = InfoHash::V1([0x44; 20]);

        let mut rec = record(&hash);
        store.save(&rec).await.unwrap();
        rec.queue_position = 9;
        store.save(&rec).await.unwrap();

        assert_eq!(store.list().await.unwrap().len(), 1);
        match store.load(&hash).await {
            ResumeOutcome::Loaded(loaded) => assert_eq!(loaded.queue_position, 9),
            other => panic!("expected Loaded, got {:?}", other),
        }

        let _ = fs::remove_dir_all(&dir).await;
    }

    #[tokio::test]
    async fn test_delete_and_list() {
        let dir = std::env::temp_dir().join("riptide_resume_delete");
        let _ = fs::remove_dir_all(&dir).await;
        let store = ResumeStore::new(dir.clone());
        let hash = InfoHash::V1([0x55; 20]);

        store.save(&record(&hash)).await.unwrap();
        assert_eq!(store.list().await.unwrap(), vec![hash.to_hex()]);

        store.delete(&hash).await.unwrap();
        assert!(store.list().await.unwrap().is_empty());
        // Deleting again is not an error
        store.delete(&hash).await.unwrap();

        let _ = fs::remove_dir_all(&dir).await;
    }
}
