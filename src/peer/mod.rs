//! Peer entities and connections
//!
//! One `Peer` per remote endpoint per torrent, never shared between
//! torrents; the socket-owning `PeerConnection` lives in its own task.

pub mod connection;
pub mod state;

// Re-export main types
pub use connection::{PeerConnection, PeerReader, PeerWriter, RemoteCaps};
pub use state::{ConnectionState, DisconnectReason, Peer, PeerOrigin, PeerStats};
