//! Session event stream
//!
//! The engine's only outward channel: UI, logging, and notification
//! collaborators consume these events; nothing in the engine depends
//! on who is listening.

use std::net::SocketAddr;

use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::torrent::metadata::InfoHash;
use crate::tracker::TrackerStatus;

/// Events emitted by the session
#[derive(Debug, Clone)]
pub enum SessionEvent {
    TorrentAdded {
        id: u64,
        info_hash: InfoHash,
    },
    TorrentCompleted {
        id: u64,
    },
    TorrentErrored {
        id: u64,
        reason: String,
    },
    PeerBlocked {
        addr: SocketAddr,
        reason: String,
    },
    TrackerStatusChanged {
        id: u64,
        url: String,
        status: TrackerStatus,
    },
    ListenSucceeded {
        addr: SocketAddr,
    },
    ListenFailed {
        addr: String,
        reason: String,
    },
    ResumeDataSaved {
        id: u64,
    },
}

/// Sending half of the event stream
#[derive(Clone)]
pub struct EventSender {
    tx: mpsc::UnboundedSender<SessionEvent>,
}

impl EventSender {
    /// Create the stream; the receiver goes to the embedding shell
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<SessionEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Emit one event; a dropped receiver is logged, never fatal
    pub fn emit(&self, event: SessionEvent) {
        debug!(?event, "session event");
        if self.tx.send(event).is_err() {
            warn!("event receiver dropped, event discarded");
        }
    }
}
