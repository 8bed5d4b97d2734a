//! Torrent lifecycle and priority types

use serde::{Deserialize, Serialize};

/// Lifecycle state of a torrent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TorrentState {
    /// Verifying on-disk data against piece digests
    Checking,
    /// Actively fetching missing pieces
    Downloading,
    /// Complete (or complete for its selected subset) and uploading
    Seeding,
    /// Stopped by the user or by a limit breach
    Paused,
    /// Held back by the session queueing policy
    Queued,
    /// Stopped by an unrecoverable per-torrent failure
    Error,
    /// Relocating its payload to a new save path
    Moving,
}

impl TorrentState {
    /// True for states that transfer data and count toward active caps
    pub fn is_active(&self) -> bool {
        matches!(self, TorrentState::Downloading | TorrentState::Seeding)
    }

    /// True when the torrent may be scheduled for activation
    pub fn is_startable(&self) -> bool {
        matches!(self, TorrentState::Queued | TorrentState::Downloading | TorrentState::Seeding)
    }
}

/// Per-file download priority
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum FilePriority {
    /// Do not download
    Skip,
    #[default]
    Normal,
    High,
    Maximum,
}

impl FilePriority {
    /// Numeric scheduling weight; `None` means do-not-download
    pub fn weight(&self) -> Option<u8> {
        match self {
            FilePriority::Skip => None,
            FilePriority::Normal => Some(1),
            FilePriority::High => Some(4),
            FilePriority::Maximum => Some(6),
        }
    }
}

/// Action applied when a share-ratio or seeding-time limit is breached
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LimitAction {
    Pause,
    Remove,
}
