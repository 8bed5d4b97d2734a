//! Storage backend abstraction
//!
//! Verified pieces are handed to a backend as whole buffers; the
//! backend scatters them across the file layout. The trait keeps the
//! session independent of where bytes actually land.

use std::path::{Path, PathBuf};

use anyhow::Result;
use async_trait::async_trait;
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt, SeekFrom};
use tracing::{debug, trace};

use crate::error::EngineError;
use crate::storage::files::FileLayout;

/// Destination for verified piece data
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Create the file tree at full length
    async fn allocate(&self) -> Result<()>;

    /// Scatter one verified piece across its file spans
    async fn write_piece(&self, piece: u32, data: &[u8]) -> Result<()>;

    /// Gather one piece back from disk, for re-checks and for serving
    /// peer requests
    async fn read_piece(&self, piece: u32) -> Result<Vec<u8>>;

    /// Root directory the payload lives under
    fn root(&self) -> &Path;
}

/// Local-filesystem backend
pub struct FsBackend {
    root: PathBuf,
    layout: FileLayout,
}

impl FsBackend {
    pub fn new(root: PathBuf, layout: FileLayout) -> Self {
        Self { root, layout }
    }
}

#[async_trait]
impl StorageBackend for FsBackend {
    async fn allocate(&self) -> Result<()> {
        self.layout.allocate(&self.root).await
    }

    async fn write_piece(&self, piece: u32, data: &[u8]) -> Result<()> {
        let mut cursor = 0usize;
        for span in self.layout.spans_for_piece(piece) {
            let path = self.layout.resolve(&self.root, span.file_index).ok_or_else(|| {
                EngineError::disk(format!("span references unknown file {}", span.file_index))
            })?;
            let mut file = fs::OpenOptions::new()
                .write(true)
                .create(true)
                .open(&path)
                .await
                .map_err(|e| {
                    EngineError::disk_full("open for write failed", path.display().to_string(), e.to_string())
                })?;
            file.seek(SeekFrom::Start(span.offset_in_file)).await?;
            let end = cursor + span.length as usize;
            file.write_all(&data[cursor..end]).await.map_err(|e| {
                EngineError::disk_full("piece write failed", path.display().to_string(), e.to_string())
            })?;
            file.flush().await?;
            cursor = end;
        }
        trace!(piece, bytes = data.len(), "piece written");
        Ok(())
    }

    async fn read_piece(&self, piece: u32) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        for span in self.layout.spans_for_piece(piece) {
            let path = self.layout.resolve(&self.root, span.file_index).ok_or_else(|| {
                EngineError::disk(format!("span references unknown file {}", span.file_index))
            })?;
            let mut file = fs::File::open(&path).await.map_err(|e| {
                EngineError::disk_full("open for read failed", path.display().to_string(), e.to_string())
            })?;
            file.seek(SeekFrom::Start(span.offset_in_file)).await?;
            let mut buf = vec![0u8; span.length as usize];
            file.read_exact(&mut buf).await.map_err(|e| {
                EngineError::disk_full("piece read failed", path.display().to_string(), e.to_string())
            })?;
            out.extend_from_slice(&buf);
        }
        debug!(piece, bytes = out.len(), "piece read");
        Ok(out)
    }

    fn root(&self) -> &Path {
        &self.root
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::torrent::metadata::FileEntry;

    fn two_file_backend(root: PathBuf) -> FsBackend {
        let layout = FileLayout::new(
            vec![
                FileEntry {
                    path: PathBuf::from("first.bin"),
                    length: 700,
                    offset: 0,
                },
                FileEntry {
                    path: PathBuf::from("second.bin"),
                    length: 700,
                    offset: 700,
                },
            ],
            512,
            1400,
        );
        FsBackend::new(root, layout)
    }

    #[tokio::test]
    async fn test_write_read_piece_across_file_boundary() {
        let root = std::env::temp_dir().join("riptide_backend_boundary");
        let _ = fs::remove_dir_all(&root).await;
        let backend = two_file_backend(root.clone());
        backend.allocate().await.unwrap();

        // Piece 1 covers bytes 512..1024: 188 in first.bin, 324 in second.bin
        let data: Vec<u8> = (0..512).map(|i| (i % 251) as u8).collect();
        backend.write_piece(1, &data).await.unwrap();

        let back = backend.read_piece(1).await.unwrap();
        assert_eq!(back, data);

        let _ = fs::remove_dir_all(&root).await;
    }

    #[tokio::test]
    async fn test_short_final_piece_round_trip() {
        let root = std::env::temp_dir().join("riptide_backend_final");
        let _ = fs::remove_dir_all(&root).await;
        let backend = two_file_backend(root.clone());
        backend.allocate().await.unwrap();

        // Final piece covers bytes 1024..1400
        let data = vec![0xABu8; 376];
        backend.write_piece(2, &data).await.unwrap();
        assert_eq!(backend.read_piece(2).await.unwrap(), data);

        let _ = fs::remove_dir_all(&root).await;
    }

    #[tokio::test]
    async fn test_read_missing_file_is_disk_error() {
        let root = std::env::temp_dir().join("riptide_backend_missing");
        let _ = fs::remove_dir_all(&root).await;
        let backend = two_file_backend(root.clone());

        let err = backend.read_piece(0).await.unwrap_err();
        assert!(err.to_string().contains("Disk error"));
    }
}
