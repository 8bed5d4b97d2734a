//! Torrents
//!
//! Descriptor types supplied by the external decoder, lifecycle and
//! priority enums, and the `Torrent` aggregate that owns one
//! transfer's piece store, peers, and trackers.

pub mod metadata;
pub mod state;
#[allow(clippy::module_inception)]
pub mod torrent;

// Re-export main types
pub use metadata::{FileEntry, InfoHash, MagnetTarget, PieceDigest, TorrentMeta};
pub use state::{FilePriority, LimitAction, TorrentState};
pub use torrent::{BlockEvent, Torrent, TorrentStats};
