//! Block scheduling module
//!
//! Decides which piece/block each peer should be asked for next.

pub mod picker;

// Re-export main types
pub use picker::{peer_useful, BlockScheduler};
