//! riptide-engine
//!
//! A BitTorrent session engine: per-torrent piece and block
//! scheduling, peer choking, tracker and peer-discovery coordination,
//! and crash-safe resume persistence. The engine is a library; a
//! desktop shell (or any other embedder) supplies decoded torrent
//! descriptors, consumes the session event stream, and feeds peer
//! candidates discovered outside the wire protocol.

pub mod choker;
pub mod config;
pub mod error;
pub mod peer;
pub mod piece;
pub mod protocol;
pub mod resume;
pub mod scheduler;
pub mod session;
pub mod storage;
pub mod torrent;
pub mod tracker;

pub use error::EngineError;

pub use config::SessionConfig;
pub use session::{
    EventSender, FilterWarning, IpFilter, QueueSettings, RateLimiter, Session, SessionEvent,
    ShutdownHandle,
};

pub use choker::{ChokerConfig, ChokingEngine, ChokingPolicy};
pub use peer::{
    ConnectionState, DisconnectReason, Peer, PeerConnection, PeerOrigin, PeerStats,
};
pub use piece::{Bitfield, BlockOutcome, BlockRef, PieceStore, BLOCK_SIZE};
pub use protocol::{EncryptionPolicy, Handshake, Message, MessageId};
pub use resume::{ResumeOutcome, ResumeRecord, ResumeStore};
pub use scheduler::BlockScheduler;
pub use storage::{FileLayout, FsBackend, StorageBackend};
pub use torrent::{
    FileEntry, FilePriority, InfoHash, LimitAction, MagnetTarget, PieceDigest, Torrent,
    TorrentMeta, TorrentState, TorrentStats,
};
pub use tracker::{
    AnnounceEvent, AnnounceParams, AnnounceResponse, CandidateQueue, HttpAnnouncer, Tracker,
    TrackerSet, TrackerStatus,
};
