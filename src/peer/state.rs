//! Peer state tracking
//!
//! A `Peer` holds everything the engine knows about one remote
//! endpoint on one torrent: its advertised pieces, the requests in
//! flight in both directions, choke/interest flags, transfer rates,
//! and snub status. Discovery source is a tag, not a subtype; peers
//! from DHT, PEX, or LSD behave identically once handshaked.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use anyhow::Result;
use tracing::{trace, warn};

use crate::error::EngineError;
use crate::piece::{Bitfield, BlockRef};
use crate::protocol::Message;

/// Ceiling on queued requests from one remote peer
const MAX_INCOMING_REQUESTS: usize = 250;

/// Where a peer was discovered; diagnostics only
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerOrigin {
    Tracker,
    Dht,
    Pex,
    Lsd,
    Incoming,
    Manual,
}

impl PeerOrigin {
    /// True for sources a private torrent must not use
    pub fn is_distributed(&self) -> bool {
        matches!(self, PeerOrigin::Dht | PeerOrigin::Pex | PeerOrigin::Lsd)
    }
}

/// Connection lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Connecting,
    Handshaking,
    Operational,
    Closed,
}

/// Why a connection was closed; surfaced to the session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    RequestTimeout,
    MalformedMessage,
    HashFailures,
    EncryptionRequired,
    InfoHashMismatch,
    IpFiltered,
    ConnectionLimit,
    TorrentRemoved,
    TorrentPaused,
    SessionShutdown,
    PeerClosed,
    Io,
}

impl DisconnectReason {
    /// Map a connection error onto a categorized reason
    pub fn classify(err: &anyhow::Error) -> Self {
        match err.downcast_ref::<EngineError>() {
            Some(EngineError::Protocol { .. }) => DisconnectReason::MalformedMessage,
            Some(EngineError::Network { message, .. }) if message.contains("timed out") => {
                DisconnectReason::RequestTimeout
            }
            _ => DisconnectReason::Io,
        }
    }

    /// Status label for events and logs
    pub fn as_str(&self) -> &'static str {
        match self {
            DisconnectReason::RequestTimeout => "request timeout",
            DisconnectReason::MalformedMessage => "malformed message",
            DisconnectReason::HashFailures => "too many hash failures",
            DisconnectReason::EncryptionRequired => "encryption required",
            DisconnectReason::InfoHashMismatch => "info hash mismatch",
            DisconnectReason::IpFiltered => "address filtered",
            DisconnectReason::ConnectionLimit => "connection limit reached",
            DisconnectReason::TorrentRemoved => "torrent removed",
            DisconnectReason::TorrentPaused => "torrent paused",
            DisconnectReason::SessionShutdown => "session shutdown",
            DisconnectReason::PeerClosed => "closed by peer",
            DisconnectReason::Io => "i/o error",
        }
    }
}

/// One remote endpoint on one torrent
#[derive(Debug)]
pub struct Peer {
    /// Remote address
    pub addr: SocketAddr,
    /// Remote peer id, known after handshake
    pub peer_id: Option<[u8; 20]>,
    /// Discovery source tag
    pub origin: PeerOrigin,
    /// Connection lifecycle state
    pub state: ConnectionState,
    /// We refuse to upload to them
    pub am_choking: bool,
    /// We want pieces they have
    pub am_interested: bool,
    /// They refuse to upload to us
    pub peer_choking: bool,
    /// They want pieces we have
    pub peer_interested: bool,
    /// Pieces the peer claims to possess
    pub have: Bitfield,
    /// Peer advertises stream-encryption capability
    pub supports_encryption: bool,
    /// Peer speaks the extension protocol
    pub supports_extensions: bool,
    /// Requests we issued, with issue time for timeout detection
    outgoing: Vec<(BlockRef, Instant)>,
    /// Requests the peer issued to us
    incoming: Vec<BlockRef>,
    /// Messages queued for the connection task to flush
    pub outbox: Vec<Message>,
    /// Total payload bytes received from this peer
    pub downloaded: u64,
    /// Total payload bytes sent to this peer
    pub uploaded: u64,
    /// Rolling receive rate, bytes/s
    pub download_rate: f64,
    /// Rolling send rate, bytes/s
    pub upload_rate: f64,
    sample_at: Instant,
    sample_downloaded: u64,
    sample_uploaded: u64,
    /// Last moment the peer made progress for us
    last_progress: Instant,
    /// Deprioritized for request issuance after stalling
    pub snubbed: bool,
    /// Verified-piece failures attributed to this peer
    pub hash_failures: u32,
}

impl Peer {
    /// Track a new peer for a torrent with `piece_count` pieces
    pub fn new(addr: SocketAddr, origin: PeerOrigin, piece_count: usize, now: Instant) -> Self {
        Self {
            addr,
            peer_id: None,
            origin,
            state: ConnectionState::Connecting,
            am_choking: true,
            am_interested: false,
            peer_choking: true,
            peer_interested: false,
            have: Bitfield::new(piece_count),
            supports_encryption: false,
            supports_extensions: false,
            outgoing: Vec::new(),
            incoming: Vec::new(),
            outbox: Vec::new(),
            downloaded: 0,
            uploaded: 0,
            download_rate: 0.0,
            upload_rate: 0.0,
            sample_at: now,
            sample_downloaded: 0,
            sample_uploaded: 0,
            last_progress: now,
            snubbed: false,
            hash_failures: 0,
        }
    }

    /// True when the peer advertises the piece
    pub fn has_piece(&self, index: u32) -> bool {
        self.have.get(index as usize)
    }

    /// Number of pieces the peer advertises
    pub fn piece_count(&self) -> usize {
        self.have.count_set()
    }

    /// Requests currently in flight to this peer
    pub fn outstanding(&self) -> usize {
        self.outgoing.len()
    }

    /// Blocks we are waiting on from this peer
    pub fn outstanding_blocks(&self) -> impl Iterator<Item = BlockRef> + '_ {
        self.outgoing.iter().map(|(b, _)| *b)
    }

    /// True when the scheduler may issue requests to this peer
    pub fn can_request(&self) -> bool {
        self.state == ConnectionState::Operational && self.am_interested && !self.peer_choking
    }

    /// Record an issued request
    pub fn add_request(&mut self, block: BlockRef, now: Instant) {
        self.outgoing.push((block, now));
    }

    /// True when this block is in flight to the peer
    pub fn has_request(&self, block: &BlockRef) -> bool {
        self.outgoing.iter().any(|(b, _)| b == block)
    }

    /// Drop a fulfilled or cancelled request; true when it was in flight
    pub fn clear_request(&mut self, block: &BlockRef) -> bool {
        let before = self.outgoing.len();
        self.outgoing.retain(|(b, _)| b != block);
        before != self.outgoing.len()
    }

    /// Age of the oldest in-flight request
    pub fn oldest_request_age(&self, now: Instant) -> Option<Duration> {
        self.outgoing
            .iter()
            .map(|(_, at)| now.saturating_duration_since(*at))
            .max()
    }

    /// Drain queued requests from the peer, oldest first
    pub fn take_incoming(&mut self) -> Vec<BlockRef> {
        std::mem::take(&mut self.incoming)
    }

    /// Account payload bytes received and reset the snub clock
    pub fn record_downloaded(&mut self, bytes: u64, now: Instant) {
        self.downloaded += bytes;
        self.last_progress = now;
        self.snubbed = false;
    }

    /// Account payload bytes sent
    pub fn record_uploaded(&mut self, bytes: u64) {
        self.uploaded += bytes;
    }

    /// Update rolling rates; call on a steady tick
    pub fn sample_rates(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.sample_at).as_secs_f64();
        if elapsed < 0.5 {
            return;
        }
        self.download_rate = (self.downloaded - self.sample_downloaded) as f64 / elapsed;
        self.upload_rate = (self.uploaded - self.sample_uploaded) as f64 / elapsed;
        self.sample_at = now;
        self.sample_downloaded = self.downloaded;
        self.sample_uploaded = self.uploaded;
    }

    /// Mark the peer snubbed when it has made no progress while we
    /// were entitled to expect some; returns true on the transition
    pub fn update_snub(&mut self, now: Instant, threshold: Duration) -> bool {
        let stalled = self.can_request()
            && self.outstanding() > 0
            && now.saturating_duration_since(self.last_progress) >= threshold;
        let transitioned = stalled && !self.snubbed;
        if transitioned {
            warn!(peer = %self.addr, "peer snubbed after {:?} without progress", threshold);
        }
        self.snubbed = stalled;
        transitioned
    }

    /// Apply an inbound state-bearing message
    ///
    /// `Piece` payload accounting stays with the caller; everything
    /// else (flags, have-set, request queue) lands here.
    pub fn apply_message(&mut self, message: &Message, now: Instant) -> Result<()> {
        match message {
            Message::Choke => {
                self.peer_choking = true;
                // In-flight requests die with the unchoke grant
                self.outgoing.clear();
            }
            Message::Unchoke => {
                self.peer_choking = false;
                self.last_progress = now;
            }
            Message::Interested => self.peer_interested = true,
            Message::NotInterested => self.peer_interested = false,
            Message::Have { piece } => {
                if *piece as usize >= self.have.len() {
                    return Err(EngineError::peer_with_addr(
                        format!("have for out-of-range piece {}", piece),
                        self.addr.to_string(),
                    )
                    .into());
                }
                self.have.set(*piece as usize);
            }
            Message::Bitfield { bits } => {
                self.have = Bitfield::from_bytes(bits, self.have.len())?;
                trace!(peer = %self.addr, pieces = self.have.count_set(), "bitfield received");
            }
            Message::Request { piece, offset, length } => {
                if self.am_choking {
                    trace!(peer = %self.addr, "ignoring request from choked peer");
                } else if self.incoming.len() >= MAX_INCOMING_REQUESTS {
                    warn!(peer = %self.addr, "request queue full, dropping request");
                } else {
                    self.incoming.push(BlockRef {
                        piece: *piece,
                        offset: *offset,
                        length: *length,
                    });
                }
            }
            Message::Cancel { piece, offset, length } => {
                let target = BlockRef {
                    piece: *piece,
                    offset: *offset,
                    length: *length,
                };
                self.incoming.retain(|b| *b != target);
            }
            _ => {}
        }
        Ok(())
    }

    /// Diagnostic snapshot for UI consumers
    pub fn stats(&self) -> PeerStats {
        PeerStats {
            addr: self.addr,
            origin: self.origin,
            state: self.state,
            am_choking: self.am_choking,
            peer_choking: self.peer_choking,
            am_interested: self.am_interested,
            peer_interested: self.peer_interested,
            downloaded: self.downloaded,
            uploaded: self.uploaded,
            download_rate: self.download_rate,
            upload_rate: self.upload_rate,
            snubbed: self.snubbed,
            pieces: self.piece_count(),
        }
    }
}

/// Point-in-time peer diagnostics
#[derive(Debug, Clone)]
pub struct PeerStats {
    pub addr: SocketAddr,
    pub origin: PeerOrigin,
    pub state: ConnectionState,
    pub am_choking: bool,
    pub peer_choking: bool,
    pub am_interested: bool,
    pub peer_interested: bool,
    pub downloaded: u64,
    pub uploaded: u64,
    pub download_rate: f64,
    pub upload_rate: f64,
    pub snubbed: bool,
    pub pieces: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(pieces: usize) -> Peer {
        Peer::new(
            "127.0.0.1:6881".parse().unwrap(),
            PeerOrigin::Tracker,
            pieces,
            Instant::now(),
        )
    }

    fn block(piece: u32, offset: u32) -> BlockRef {
        BlockRef {
            piece,
            offset,
            length: 16384,
        }
    }

    #[test]
    fn test_initial_flags() {
        let p = peer(8);
        assert!(p.am_choking && p.peer_choking);
        assert!(!p.am_interested && !p.peer_interested);
        assert!(!p.can_request());
    }

    #[test]
    fn test_can_request_gates() {
        let mut p = peer(8);
        p.state = ConnectionState::Operational;
        assert!(!p.can_request());
        p.am_interested = true;
        assert!(!p.can_request());
        p.peer_choking = false;
        assert!(p.can_request());
    }

    #[test]
    fn test_have_and_bitfield_messages() {
        let mut p = peer(9);
        let now = Instant::now();
        p.apply_message(&Message::Have { piece: 8 }, now).unwrap();
        assert!(p.has_piece(8));

        let mut bits = Bitfield::new(9);
        bits.set(0);
        bits.set(3);
        p.apply_message(
            &Message::Bitfield {
                bits: bits.as_bytes().to_vec(),
            },
            now,
        )
        .unwrap();
        assert!(p.has_piece(0) && p.has_piece(3));
        assert!(!p.has_piece(8));
    }

    #[test]
    fn test_out_of_range_have_is_error() {
        let mut p = peer(4);
        assert!(p
            .apply_message(&Message::Have { piece: 4 }, Instant::now())
            .is_err());
    }

    #[test]
    fn test_choke_clears_outgoing_requests() {
        let mut p = peer(4);
        let now = Instant::now();
        p.add_request(block(0, 0), now);
        p.add_request(block(1, 0), now);
        assert_eq!(p.outstanding(), 2);
        p.apply_message(&Message::Choke, now).unwrap();
        assert_eq!(p.outstanding(), 0);
        assert!(p.peer_choking);
    }

    #[test]
    fn test_request_tracking() {
        let mut p = peer(4);
        let now = Instant::now();
        let b = block(2, 16384);
        p.add_request(b, now);
        assert!(p.has_request(&b));
        assert!(p.clear_request(&b));
        assert!(!p.clear_request(&b));
    }

    #[test]
    fn test_incoming_requests_require_unchoke() {
        let mut p = peer(4);
        let now = Instant::now();
        let req = Message::Request {
            piece: 0,
            offset: 0,
            length: 16384,
        };
        p.apply_message(&req, now).unwrap();
        assert!(p.take_incoming().is_empty());

        p.am_choking = false;
        p.apply_message(&req, now).unwrap();
        assert_eq!(p.take_incoming(), vec![block(0, 0)]);
    }

    #[test]
    fn test_cancel_removes_incoming() {
        let mut p = peer(4);
        p.am_choking = false;
        let now = Instant::now();
        p.apply_message(
            &Message::Request {
                piece: 1,
                offset: 0,
                length: 16384,
            },
            now,
        )
        .unwrap();
        p.apply_message(
            &Message::Cancel {
                piece: 1,
                offset: 0,
                length: 16384,
            },
            now,
        )
        .unwrap();
        assert!(p.take_incoming().is_empty());
    }

    #[test]
    fn test_snub_detection_and_recovery() {
        let mut p = peer(4);
        let start = Instant::now();
        p.state = ConnectionState::Operational;
        p.am_interested = true;
        p.peer_choking = false;
        p.add_request(block(0, 0), start);

        let later = start + Duration::from_secs(120);
        assert!(p.update_snub(later, Duration::from_secs(60)));
        assert!(p.snubbed);

        p.record_downloaded(16384, later);
        assert!(!p.snubbed);
        assert!(!p.update_snub(later, Duration::from_secs(60)));
    }

    #[test]
    fn test_rate_sampling() {
        let mut p = peer(4);
        let start = Instant::now();
        p.record_downloaded(100_000, start);
        p.sample_rates(start + Duration::from_secs(2));
        assert!(p.download_rate > 40_000.0 && p.download_rate < 60_000.0);
    }
}
