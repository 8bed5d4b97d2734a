//! File layout
//!
//! Maps pieces onto the byte ranges of the torrent's files. A piece
//! can straddle several small files; a file boundary can fall inside a
//! piece. The layout also yields each file's piece range for priority
//! computation and probes on-disk sizes for resume validation.

use std::path::{Path, PathBuf};

use anyhow::Result;
use tokio::fs;
use tracing::debug;

use crate::piece::store::FileRegion;
use crate::torrent::metadata::FileEntry;
use crate::torrent::state::FilePriority;

/// A contiguous slice of one file touched by a piece
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileSpan {
    pub file_index: usize,
    pub offset_in_file: u64,
    pub length: u64,
}

/// Piece-to-file geometry for one torrent
#[derive(Debug, Clone)]
pub struct FileLayout {
    files: Vec<FileEntry>,
    piece_length: u32,
    total_size: u64,
}

impl FileLayout {
    pub fn new(files: Vec<FileEntry>, piece_length: u32, total_size: u64) -> Self {
        Self {
            files,
            piece_length,
            total_size,
        }
    }

    /// The ordered file entries
    pub fn files(&self) -> &[FileEntry] {
        &self.files
    }

    /// File spans covered by one piece, in file order
    pub fn spans_for_piece(&self, piece: u32) -> Vec<FileSpan> {
        let piece_start = u64::from(piece) * u64::from(self.piece_length);
        let piece_end = (piece_start + u64::from(self.piece_length)).min(self.total_size);
        let mut spans = Vec::new();

        for (index, file) in self.files.iter().enumerate() {
            let file_start = file.offset;
            let file_end = file.offset + file.length;
            let overlap_start = piece_start.max(file_start);
            let overlap_end = piece_end.min(file_end);
            if overlap_start < overlap_end {
                spans.push(FileSpan {
                    file_index: index,
                    offset_in_file: overlap_start - file_start,
                    length: overlap_end - overlap_start,
                });
            }
        }
        spans
    }

    /// First and last piece index touching a file
    pub fn piece_range(&self, file_index: usize) -> Option<(u32, u32)> {
        let file = self.files.get(file_index)?;
        if file.length == 0 {
            // Zero-length files sit at a boundary; attribute them to
            // the piece containing their offset
            let piece = (file.offset / u64::from(self.piece_length)) as u32;
            return Some((piece, piece));
        }
        let first = (file.offset / u64::from(self.piece_length)) as u32;
        let last = ((file.offset + file.length - 1) / u64::from(self.piece_length)) as u32;
        Some((first, last))
    }

    /// Translate per-file priorities into piece regions for the store
    pub fn regions(&self, priorities: &[FilePriority]) -> Vec<FileRegion> {
        self.files
            .iter()
            .enumerate()
            .filter_map(|(index, _)| {
                let (first_piece, last_piece) = self.piece_range(index)?;
                let priority = priorities.get(index).copied().unwrap_or_default();
                Some(FileRegion {
                    first_piece,
                    last_piece,
                    priority,
                })
            })
            .collect()
    }

    /// Observed on-disk size per file; `None` for missing files
    ///
    /// Resume records are cross-checked against these sizes; any
    /// discrepancy forces a re-check instead of trusting the record.
    pub async fn probe_sizes(&self, root: &Path) -> Vec<Option<u64>> {
        let mut sizes = Vec::with_capacity(self.files.len());
        for file in &self.files {
            let path = root.join(&file.path);
            sizes.push(fs::metadata(&path).await.ok().map(|m| m.len()));
        }
        sizes
    }

    /// Create all files at their full length under `root`
    pub async fn allocate(&self, root: &Path) -> Result<()> {
        for file in &self.files {
            let path = root.join(&file.path);
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent).await?;
            }
            let handle = fs::OpenOptions::new()
                .write(true)
                .create(true)
                .open(&path)
                .await?;
            handle.set_len(file.length).await?;
        }
        debug!(files = self.files.len(), root = %root.display(), "allocated file tree");
        Ok(())
    }

    /// Resolve a file's absolute path under `root`
    pub fn resolve(&self, root: &Path, file_index: usize) -> Option<PathBuf> {
        self.files.get(file_index).map(|f| root.join(&f.path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layout() -> FileLayout {
        // 1024-byte pieces over three files: 1500 + 100 + 1500 = 3100
        FileLayout::new(
            vec![
                FileEntry {
                    path: PathBuf::from("a.bin"),
                    length: 1500,
                    offset: 0,
                },
                FileEntry {
                    path: PathBuf::from("b.bin"),
                    length: 100,
                    offset: 1500,
                },
                FileEntry {
                    path: PathBuf::from("sub/c.bin"),
                    length: 1500,
                    offset: 1600,
                },
            ],
            1024,
            3100,
        )
    }

    #[test]
    fn test_piece_spanning_three_files() {
        let spans = layout().spans_for_piece(1);
        // Piece 1 covers bytes 1024..2048: tail of a, all of b, head of c
        assert_eq!(
            spans,
            vec![
                FileSpan {
                    file_index: 0,
                    offset_in_file: 1024,
                    length: 476,
                },
                FileSpan {
                    file_index: 1,
                    offset_in_file: 0,
                    length: 100,
                },
                FileSpan {
                    file_index: 2,
                    offset_in_file: 0,
                    length: 448,
                },
            ]
        );
    }

    #[test]
    fn test_short_final_piece() {
        let spans = layout().spans_for_piece(3);
        // Bytes 3072..3100 fall entirely in the last file
        assert_eq!(spans.len(), 1);
        assert_eq!(spans[0].length, 28);
    }

    #[test]
    fn test_piece_ranges_per_file() {
        let l = layout();
        assert_eq!(l.piece_range(0), Some((0, 1)));
        assert_eq!(l.piece_range(1), Some((1, 1)));
        assert_eq!(l.piece_range(2), Some((1, 3)));
        assert_eq!(l.piece_range(9), None);
    }

    #[test]
    fn test_regions_carry_priorities() {
        let l = layout();
        let regions = l.regions(&[
            FilePriority::Skip,
            FilePriority::Maximum,
            FilePriority::Normal,
        ]);
        assert_eq!(regions.len(), 3);
        assert_eq!(regions[1].first_piece, 1);
        assert_eq!(regions[1].priority, FilePriority::Maximum);
    }

    #[tokio::test]
    async fn test_allocate_and_probe() {
        let root = std::env::temp_dir().join("riptide_layout_alloc");
        let _ = fs::remove_dir_all(&root).await;
        let l = layout();

        assert_eq!(l.probe_sizes(&root).await, vec![None, None, None]);
        l.allocate(&root).await.unwrap();
        assert_eq!(
            l.probe_sizes(&root).await,
            vec![Some(1500), Some(100), Some(1500)]
        );

        let _ = fs::remove_dir_all(&root).await;
    }
}
