//! Piece tracking module
//!
//! Owns per-piece/per-block download state and the have-bitfield.

pub mod bitfield;
pub mod store;

// Re-export main types
pub use bitfield::Bitfield;
pub use store::{BlockOutcome, BlockRef, FileRegion, PieceStore, BLOCK_SIZE};
