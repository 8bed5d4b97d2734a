//! Per-torrent piece store
//!
//! Accumulates 16 KiB blocks into pieces, verifies digests on
//! completion, and owns the have-bitfield that scheduling and peer
//! advertising read from. A piece counts as complete only after every
//! block is present and the recomputed digest matches; a mismatch
//! discards all blocks so the piece is re-requested from scratch.

use std::collections::HashMap;

use tracing::{debug, trace, warn};

use crate::piece::Bitfield;
use crate::torrent::metadata::PieceDigest;
use crate::torrent::state::FilePriority;

/// Wire-protocol block size
pub const BLOCK_SIZE: u32 = 16 * 1024;

/// Weight assigned to the first and last piece of a file when the
/// first/last-piece-first policy is enabled; outranks `Maximum`.
const EDGE_PIECE_WEIGHT: u8 = 7;

/// A single requestable block within a piece
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockRef {
    pub piece: u32,
    pub offset: u32,
    pub length: u32,
}

/// Result of feeding a received block into the store
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockOutcome {
    /// Stored; the piece still has missing blocks
    Pending,
    /// All blocks present and the digest matched; payload ready for disk
    PieceComplete(Vec<u8>),
    /// Digest mismatch; all blocks discarded for re-download
    HashMismatch,
    /// Unknown piece, bad geometry, duplicate, or already-complete piece
    Rejected,
}

/// A file's piece span and priority, precomputed by the file layout
#[derive(Debug, Clone, Copy)]
pub struct FileRegion {
    pub first_piece: u32,
    pub last_piece: u32,
    pub priority: FilePriority,
}

#[derive(Debug)]
struct PartialPiece {
    blocks: Vec<Option<Vec<u8>>>,
}

impl PartialPiece {
    fn new(block_count: usize) -> Self {
        Self {
            blocks: vec![None; block_count],
        }
    }

    fn received(&self) -> usize {
        self.blocks.iter().filter(|b| b.is_some()).count()
    }

    fn is_full(&self) -> bool {
        self.blocks.iter().all(|b| b.is_some())
    }

    fn assemble(&self) -> Vec<u8> {
        let mut data = Vec::new();
        for block in self.blocks.iter().flatten() {
            data.extend_from_slice(block);
        }
        data
    }
}

/// Tracks download state for every piece of one torrent
#[derive(Debug)]
pub struct PieceStore {
    digests: Vec<PieceDigest>,
    piece_length: u32,
    total_size: u64,
    have: Bitfield,
    partial: HashMap<u32, PartialPiece>,
    /// Scheduling weight per piece; `None` means do-not-download
    weights: Vec<Option<u8>>,
}

impl PieceStore {
    /// Create a store with all pieces missing and normal priority
    pub fn new(digests: Vec<PieceDigest>, piece_length: u32, total_size: u64) -> Self {
        let count = digests.len();
        Self {
            digests,
            piece_length,
            total_size,
            have: Bitfield::new(count),
            partial: HashMap::new(),
            weights: vec![FilePriority::Normal.weight(); count],
        }
    }

    /// Number of pieces
    pub fn piece_count(&self) -> usize {
        self.digests.len()
    }

    /// Configured piece length (final piece may be shorter)
    pub fn piece_length(&self) -> u32 {
        self.piece_length
    }

    /// Actual size of a piece
    pub fn piece_size(&self, index: u32) -> u32 {
        let start = u64::from(index) * u64::from(self.piece_length);
        self.total_size
            .saturating_sub(start)
            .min(u64::from(self.piece_length)) as u32
    }

    /// Number of blocks in a piece
    pub fn block_count(&self, index: u32) -> usize {
        (self.piece_size(index) as usize).div_ceil(BLOCK_SIZE as usize)
    }

    /// The have-bitfield; single source of truth for scheduling and
    /// for advertising to peers
    pub fn have(&self) -> &Bitfield {
        &self.have
    }

    /// True when we hold a verified copy of the piece
    pub fn has_piece(&self, index: u32) -> bool {
        self.have.get(index as usize)
    }

    /// Number of verified pieces
    pub fn completed_count(&self) -> usize {
        self.have.count_set()
    }

    /// True when every piece is verified
    pub fn is_complete(&self) -> bool {
        self.have.is_full()
    }

    /// True when every piece with a download priority is verified;
    /// the torrent then seeds its completed subset
    pub fn selected_complete(&self) -> bool {
        (0..self.piece_count() as u32)
            .filter(|&i| self.weights[i as usize].is_some())
            .all(|i| self.has_piece(i))
    }

    /// True when every still-missing piece is marked do-not-download
    pub fn all_remaining_skipped(&self) -> bool {
        !self.is_complete() && self.selected_complete()
    }

    /// Mark a piece verified without data, from resume load or re-check
    pub fn set_have(&mut self, index: u32) {
        self.partial.remove(&index);
        self.have.set(index as usize);
    }

    /// Drop any buffered blocks for a piece
    pub fn reset_piece(&mut self, index: u32) {
        self.partial.remove(&index);
    }

    /// Forget every verified piece and buffered block; the have-set
    /// is rebuilt from a re-check afterwards
    pub fn reset_all(&mut self) {
        self.have = Bitfield::new(self.piece_count());
        self.partial.clear();
    }

    /// True when some blocks of the piece are buffered
    pub fn in_progress(&self, index: u32) -> bool {
        self.partial.contains_key(&index)
    }

    /// Scheduling weight for a piece; `None` means do-not-download
    pub fn priority(&self, index: u32) -> Option<u8> {
        self.weights.get(index as usize).copied().flatten()
    }

    /// Blocks of a piece not yet received
    pub fn missing_blocks(&self, index: u32) -> Vec<BlockRef> {
        if self.has_piece(index) || index as usize >= self.piece_count() {
            return Vec::new();
        }
        let piece_size = self.piece_size(index);
        let count = self.block_count(index);
        let received = self.partial.get(&index);
        (0..count)
            .filter(|&b| received.map_or(true, |p| p.blocks[b].is_none()))
            .map(|b| {
                let offset = b as u32 * BLOCK_SIZE;
                BlockRef {
                    piece: index,
                    offset,
                    length: (piece_size - offset).min(BLOCK_SIZE),
                }
            })
            .collect()
    }

    /// Recompute per-piece weights from file regions
    ///
    /// A piece shared by two files takes the strongest priority among
    /// them; pieces covered only by skipped files get no weight. With
    /// `first_last` set, the first and last piece of every non-skipped
    /// file are boosted above `Maximum`.
    pub fn apply_regions(&mut self, regions: &[FileRegion], first_last: bool) {
        let count = self.piece_count();
        let mut weights: Vec<Option<u8>> = vec![None; count];
        for region in regions {
            let Some(weight) = region.priority.weight() else {
                continue;
            };
            let last = (region.last_piece as usize).min(count.saturating_sub(1));
            for slot in weights
                .iter_mut()
                .take(last + 1)
                .skip(region.first_piece as usize)
            {
                *slot = Some(slot.map_or(weight, |w| w.max(weight)));
            }
        }
        if first_last {
            for region in regions {
                if region.priority.weight().is_none() {
                    continue;
                }
                for edge in [region.first_piece as usize, region.last_piece as usize] {
                    if edge < count {
                        weights[edge] = Some(EDGE_PIECE_WEIGHT);
                    }
                }
            }
        }
        debug!(
            pieces = count,
            selected = weights.iter().filter(|w| w.is_some()).count(),
            "applied piece priorities"
        );
        self.weights = weights;
    }

    /// Feed a received block into the store
    pub fn mark_block_received(&mut self, index: u32, offset: u32, data: Vec<u8>) -> BlockOutcome {
        if index as usize >= self.piece_count() || self.has_piece(index) {
            trace!(piece = index, "rejected block for unknown or complete piece");
            return BlockOutcome::Rejected;
        }
        let piece_size = self.piece_size(index);
        if offset % BLOCK_SIZE != 0 || offset >= piece_size {
            warn!(piece = index, offset, "rejected block with bad offset");
            return BlockOutcome::Rejected;
        }
        let expected_len = (piece_size - offset).min(BLOCK_SIZE) as usize;
        if data.len() != expected_len {
            warn!(
                piece = index,
                offset,
                got = data.len(),
                expected = expected_len,
                "rejected block with bad length"
            );
            return BlockOutcome::Rejected;
        }

        let block_count = self.block_count(index);
        let partial = self
            .partial
            .entry(index)
            .or_insert_with(|| PartialPiece::new(block_count));
        let slot = (offset / BLOCK_SIZE) as usize;
        if partial.blocks[slot].is_some() {
            trace!(piece = index, offset, "duplicate block ignored");
            return BlockOutcome::Rejected;
        }
        partial.blocks[slot] = Some(data);

        if !partial.is_full() {
            trace!(
                piece = index,
                received = partial.received(),
                total = block_count,
                "block stored"
            );
            return BlockOutcome::Pending;
        }

        let assembled = partial.assemble();
        self.partial.remove(&index);
        if self.digests[index as usize].matches(&assembled) {
            self.have.set(index as usize);
            debug!(piece = index, "piece verified");
            BlockOutcome::PieceComplete(assembled)
        } else {
            warn!(piece = index, "piece failed verification, discarding blocks");
            BlockOutcome::HashMismatch
        }
    }
}
