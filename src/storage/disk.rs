//! Disk worker pool
//!
//! Piece writes never block the reactor: jobs run on spawned tasks
//! gated by a semaphore, and completions come back as events. Every
//! result carries the torrent id and generation it was issued under so
//! the session can drop results for torrents removed mid-flight.

use std::sync::Arc;

use tokio::sync::{mpsc, Semaphore};
use tracing::{debug, error};

use crate::storage::backend::StorageBackend;

/// Completion event for one disk job
#[derive(Debug)]
pub struct DiskJobResult {
    pub torrent: u64,
    /// Generation the job was issued under; stale generations are
    /// discarded by the receiver, never applied
    pub generation: u64,
    pub piece: u32,
    pub result: Result<(), String>,
}

/// Bounded pool for piece I/O
pub struct DiskPool {
    permits: Arc<Semaphore>,
    tx: mpsc::UnboundedSender<DiskJobResult>,
}

impl DiskPool {
    /// Create a pool running at most `max_jobs` writes concurrently
    pub fn new(max_jobs: usize) -> (Self, mpsc::UnboundedReceiver<DiskJobResult>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                permits: Arc::new(Semaphore::new(max_jobs.max(1))),
                tx,
            },
            rx,
        )
    }

    /// Queue a verified piece for writing
    pub fn spawn_write(
        &self,
        backend: Arc<dyn StorageBackend>,
        torrent: u64,
        generation: u64,
        piece: u32,
        data: Vec<u8>,
    ) {
        let permits = Arc::clone(&self.permits);
        let tx = self.tx.clone();
        tokio::spawn(async move {
            let Ok(_permit) = permits.acquire().await else {
                // Pool shut down; the write is abandoned with it
                return;
            };
            let result = backend
                .write_piece(piece, &data)
                .await
                .map_err(|e| e.to_string());
            if let Err(reason) = &result {
                error!(torrent, piece, reason = %reason, "disk write failed");
            } else {
                debug!(torrent, piece, "disk write complete");
            }
            let _ = tx.send(DiskJobResult {
                torrent,
                generation,
                piece,
                result,
            });
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::files::FileLayout;
    use crate::storage::FsBackend;
    use crate::torrent::metadata::FileEntry;
    use std::path::PathBuf;

    fn backend(root: PathBuf) -> Arc<dyn StorageBackend> {
        let layout = FileLayout::new(
            vec![FileEntry {
                path: PathBuf::from("payload.bin"),
                length: 1024,
                offset: 0,
            }],
            512,
            1024,
        );
        Arc::new(FsBackend::new(root, layout))
    }

    #[tokio::test]
    async fn test_write_job_delivers_tagged_completion() {
        let root = std::env::temp_dir().join("riptide_disk_pool");
        let _ = tokio::fs::remove_dir_all(&root).await;
        let backend = backend(root.clone());
        backend.allocate().await.unwrap();

        let (pool, mut rx) = DiskPool::new(2);
        pool.spawn_write(backend, 42, 7, 0, vec![1u8; 512]);

        let done = rx.recv().await.unwrap();
        assert_eq!(done.torrent, 42);
        assert_eq!(done.generation, 7);
        assert_eq!(done.piece, 0);
        assert!(done.result.is_ok());

        let _ = tokio::fs::remove_dir_all(&root).await;
    }

    #[tokio::test]
    async fn test_failed_write_reports_error() {
        // No allocation: parent directory missing makes the write fail
        let root = std::env::temp_dir().join("riptide_disk_pool_missing/nested/deeper");
        let backend = backend(root);

        let (pool, mut rx) = DiskPool::new(1);
        pool.spawn_write(backend, 1, 1, 0, vec![0u8; 512]);

        let done = rx.recv().await.unwrap();
        assert!(done.result.is_err());
    }

    #[tokio::test]
    async fn test_many_jobs_all_complete_under_bound() {
        let root = std::env::temp_dir().join("riptide_disk_pool_many");
        let _ = tokio::fs::remove_dir_all(&root).await;
        let backend = backend(root.clone());
        backend.allocate().await.unwrap();

        let (pool, mut rx) = DiskPool::new(2);
        for piece in 0..2u32 {
            pool.spawn_write(Arc::clone(&backend), 9, 1, piece, vec![7u8; 512]);
        }
        let mut seen = Vec::new();
        for _ in 0..2 {
            seen.push(rx.recv().await.unwrap().piece);
        }
        seen.sort_unstable();
        assert_eq!(seen, vec![0, 1]);

        let _ = tokio::fs::remove_dir_all(&root).await;
    }
}
