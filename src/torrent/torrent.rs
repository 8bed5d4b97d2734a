//! Torrent aggregate
//!
//! One `Torrent` owns everything belonging to a single content hash:
//! the piece store, the peers (by index, never shared), the tracker
//! set, the discovery queue, the block scheduler, and the choking
//! engine. The session resolves peer events through the torrent id, so
//! no ownership cycle exists between the three.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Instant;

use anyhow::Result;
use tracing::{debug, info, warn};

use crate::choker::ChokingEngine;
use crate::config::SessionConfig;
use crate::error::EngineError;
use crate::peer::{ConnectionState, DisconnectReason, Peer, PeerOrigin, PeerStats};
use crate::piece::{BlockOutcome, BlockRef, PieceStore};
use crate::protocol::Message;
use crate::resume::{ResumeRecord, RESUME_FORMAT_VERSION};
use crate::scheduler::{peer_useful, BlockScheduler};
use crate::storage::FileLayout;
use crate::torrent::metadata::{InfoHash, MagnetTarget, TorrentMeta};
use crate::torrent::state::{FilePriority, LimitAction, TorrentState};
use crate::tracker::{CandidateQueue, TrackerSet};

/// What the session must do after a block landed
#[derive(Debug, PartialEq, Eq)]
pub enum BlockEvent {
    /// Block buffered; the piece is still incomplete
    Progress,
    /// Piece verified; the payload must be written to disk
    PieceVerified {
        piece: u32,
        data: Vec<u8>,
        /// Every selected piece is now verified
        finished: bool,
    },
    /// Digest mismatch; all blocks were discarded for re-download
    HashMismatch {
        piece: u32,
        /// The delivering peer crossed the failure threshold
        disconnect: bool,
    },
    /// Unknown piece, bad geometry, or duplicate; nothing changed
    Ignored,
}

/// Point-in-time torrent diagnostics
#[derive(Debug, Clone)]
pub struct TorrentStats {
    pub id: u64,
    pub info_hash: InfoHash,
    pub name: String,
    pub state: TorrentState,
    pub progress: f64,
    pub downloaded: u64,
    pub uploaded: u64,
    pub download_rate: f64,
    pub upload_rate: f64,
    pub peer_count: usize,
    pub queue_position: u32,
    pub error: Option<String>,
}

/// One torrent and everything it owns
pub struct Torrent {
    pub id: u64,
    pub info_hash: InfoHash,
    pub name: String,
    pub state: TorrentState,
    pub save_path: PathBuf,
    meta: Option<TorrentMeta>,
    store: Option<PieceStore>,
    layout: Option<FileLayout>,
    /// Peers owned by index; a disconnect removes the entry
    pub peers: Vec<Peer>,
    pub trackers: TrackerSet,
    pub candidates: CandidateQueue,
    pub scheduler: BlockScheduler,
    pub choker: ChokingEngine,
    pub file_priorities: Vec<FilePriority>,
    pub queue_position: u32,
    pub tags: Vec<String>,
    pub category: Option<String>,
    pub uploaded: u64,
    pub downloaded: u64,
    pub error: Option<String>,
    /// Bumped whenever in-flight disk jobs must be invalidated
    pub generation: u64,
    first_last: bool,
    seeding_secs_past: u64,
    seeding_since: Option<Instant>,
    limit_breached: bool,
}

impl Torrent {
    /// Create a torrent from a decoded descriptor
    pub fn from_meta(
        id: u64,
        meta: TorrentMeta,
        save_path: PathBuf,
        config: &SessionConfig,
    ) -> Result<Self> {
        meta.validate()?;
        let trackers = TrackerSet::from_tiers(
            &meta.trackers,
            config.announce_min_interval,
            config.announce_backoff_cap,
            config.announce_to_all_trackers,
            config.announce_to_all_tiers,
        );
        let mut torrent = Self {
            id,
            info_hash: meta.info_hash,
            name: meta.name.clone(),
            state: TorrentState::Checking,
            save_path,
            meta: None,
            store: None,
            layout: None,
            peers: Vec::new(),
            trackers,
            candidates: CandidateQueue::new(meta.private),
            scheduler: BlockScheduler::new(false),
            choker: ChokingEngine::new(config.choker()),
            file_priorities: vec![FilePriority::Normal; meta.files.len()],
            queue_position: 0,
            tags: Vec::new(),
            category: None,
            uploaded: 0,
            downloaded: 0,
            error: None,
            generation: 0,
            first_last: config.first_last_piece_first,
            seeding_secs_past: 0,
            seeding_since: None,
            limit_breached: false,
        };
        torrent.install_meta(meta);
        Ok(torrent)
    }

    /// Create a torrent from a magnet identifier; it has no piece
    /// store until `set_metadata` supplies a descriptor
    pub fn from_magnet(
        id: u64,
        target: MagnetTarget,
        save_path: PathBuf,
        config: &SessionConfig,
    ) -> Self {
        let tiers: Vec<Vec<String>> = if target.trackers.is_empty() {
            Vec::new()
        } else {
            vec![target.trackers.clone()]
        };
        let trackers = TrackerSet::from_tiers(
            &tiers,
            config.announce_min_interval,
            config.announce_backoff_cap,
            config.announce_to_all_trackers,
            config.announce_to_all_tiers,
        );
        Self {
            id,
            info_hash: target.info_hash,
            name: target
                .display_name
                .unwrap_or_else(|| target.info_hash.to_hex()),
            state: TorrentState::Downloading,
            save_path,
            meta: None,
            store: None,
            layout: None,
            peers: Vec::new(),
            trackers,
            candidates: CandidateQueue::new(false),
            scheduler: BlockScheduler::new(false),
            choker: ChokingEngine::new(config.choker()),
            file_priorities: Vec::new(),
            queue_position: 0,
            tags: Vec::new(),
            category: None,
            uploaded: 0,
            downloaded: 0,
            error: None,
            generation: 0,
            first_last: config.first_last_piece_first,
            seeding_secs_past: 0,
            seeding_since: None,
            limit_breached: false,
        }
    }

    fn install_meta(&mut self, meta: TorrentMeta) {
        let mut store = PieceStore::new(meta.digests.clone(), meta.piece_length, meta.total_size);
        let layout = FileLayout::new(meta.files.clone(), meta.piece_length, meta.total_size);
        if self.file_priorities.len() != meta.files.len() {
            self.file_priorities = vec![FilePriority::Normal; meta.files.len()];
        }
        store.apply_regions(&layout.regions(&self.file_priorities), self.first_last);
        self.name = meta.name.clone();
        self.store = Some(store);
        self.layout = Some(layout);
        self.meta = Some(meta);
    }

    /// Supply metadata to a magnet-added torrent
    pub fn set_metadata(&mut self, meta: TorrentMeta) -> Result<()> {
        if self.meta.is_some() {
            return Err(EngineError::config("torrent already has metadata").into());
        }
        meta.validate()?;
        if meta.info_hash != self.info_hash {
            return Err(EngineError::config_with_field(
                "metadata does not match the magnet hash",
                "info_hash",
            )
            .into());
        }
        info!(id = self.id, name = %meta.name, "metadata arrived");
        self.install_meta(meta);
        // Peers connected during the metadata phase advertise nothing
        // useful yet; their bitfields arrive with the next messages
        Ok(())
    }

    /// True once a descriptor is installed
    pub fn has_metadata(&self) -> bool {
        self.meta.is_some()
    }

    pub fn meta(&self) -> Option<&TorrentMeta> {
        self.meta.as_ref()
    }

    pub fn store(&self) -> Option<&PieceStore> {
        self.store.as_ref()
    }

    pub fn store_mut(&mut self) -> Option<&mut PieceStore> {
        self.store.as_mut()
    }

    pub fn layout(&self) -> Option<&FileLayout> {
        self.layout.as_ref()
    }

    /// Bytes still to download for selected pieces
    pub fn left(&self) -> u64 {
        let Some(store) = &self.store else {
            return 0;
        };
        (0..store.piece_count() as u32)
            .filter(|&i| !store.has_piece(i) && store.priority(i).is_some())
            .map(|i| u64::from(store.piece_size(i)))
            .sum()
    }

    /// Verified fraction of selected pieces
    pub fn progress(&self) -> f64 {
        let Some(store) = &self.store else {
            return 0.0;
        };
        let selected = (0..store.piece_count() as u32)
            .filter(|&i| store.priority(i).is_some() || store.has_piece(i))
            .count();
        if selected == 0 {
            return 0.0;
        }
        store.completed_count() as f64 / selected as f64
    }

    /// Uploaded-to-downloaded ratio; infinite history counts
    pub fn share_ratio(&self) -> f64 {
        if self.downloaded == 0 {
            if self.uploaded == 0 {
                0.0
            } else {
                f64::INFINITY
            }
        } else {
            self.uploaded as f64 / self.downloaded as f64
        }
    }

    /// Total time spent seeding, including before the last restart
    pub fn seeding_secs(&self, now: Instant) -> u64 {
        let current = self
            .seeding_since
            .map(|since| now.saturating_duration_since(since).as_secs())
            .unwrap_or(0);
        self.seeding_secs_past + current
    }

    /// Summed transfer rates over all peers, bytes/s
    pub fn rates(&self) -> (f64, f64) {
        self.peers.iter().fold((0.0, 0.0), |(down, up), p| {
            (down + p.download_rate, up + p.upload_rate)
        })
    }

    /// Move between lifecycle states, tracking seeding time
    pub fn set_state(&mut self, state: TorrentState, now: Instant) {
        if self.state == state {
            return;
        }
        debug!(id = self.id, from = ?self.state, to = ?state, "state change");
        if self.state == TorrentState::Seeding {
            self.seeding_secs_past = self.seeding_secs(now);
            self.seeding_since = None;
        }
        if state == TorrentState::Seeding {
            self.seeding_since = Some(now);
        }
        self.state = state;
    }

    /// The active state this torrent belongs in given its progress
    pub fn natural_active_state(&self) -> TorrentState {
        match &self.store {
            Some(store) if store.selected_complete() => TorrentState::Seeding,
            _ => TorrentState::Downloading,
        }
    }

    /// Apply per-file priorities and recompute piece weights
    pub fn set_file_priorities(&mut self, priorities: Vec<FilePriority>, now: Instant) -> Result<()> {
        let Some(layout) = &self.layout else {
            return Err(EngineError::config("no metadata yet").into());
        };
        if priorities.len() != layout.files().len() {
            return Err(EngineError::config_with_field(
                format!(
                    "expected {} priorities, got {}",
                    layout.files().len(),
                    priorities.len()
                ),
                "file_priorities",
            )
            .into());
        }
        let regions = layout.regions(&priorities);
        self.file_priorities = priorities;
        if let Some(store) = &mut self.store {
            store.apply_regions(&regions, self.first_last);
            // Deselecting the remainder turns the torrent into a seed
            // of its completed subset
            if store.all_remaining_skipped() && self.state == TorrentState::Downloading {
                self.set_state(TorrentState::Seeding, now);
            }
        }
        Ok(())
    }

    /// Restore progress from a resume record
    pub fn restore(&mut self, record: &ResumeRecord, now: Instant) -> Result<()> {
        let bitfield = record.bitfield()?;
        let Some(store) = &mut self.store else {
            return Err(EngineError::resume("record for a metadata-less torrent").into());
        };
        if bitfield.len() != store.piece_count() {
            return Err(EngineError::resume_with_detail(
                "piece count mismatch",
                format!("record {}, torrent {}", bitfield.len(), store.piece_count()),
            )
            .into());
        }
        for piece in bitfield.iter_set() {
            store.set_have(piece as u32);
        }
        self.queue_position = record.queue_position;
        self.tags = record.tags.clone();
        self.category = record.category.clone();
        self.uploaded = record.uploaded;
        self.downloaded = record.downloaded;
        self.seeding_secs_past = record.seeding_secs;
        self.scheduler.sequential = record.sequential;
        self.save_path = record.save_path.clone();
        if record.file_priorities.len() == self.file_priorities.len() {
            self.set_file_priorities(record.file_priorities.clone(), now)?;
        }
        let state = if record.paused {
            TorrentState::Paused
        } else {
            self.natural_active_state()
        };
        self.set_state(state, now);
        info!(
            id = self.id,
            pieces = self.store.as_ref().map(|s| s.completed_count()).unwrap_or(0),
            "restored from resume record"
        );
        Ok(())
    }

    /// Snapshot for the resume store
    pub fn snapshot(&self, now: Instant, file_sizes: Vec<u64>) -> Option<ResumeRecord> {
        let store = self.store.as_ref()?;
        Some(ResumeRecord {
            version: RESUME_FORMAT_VERSION,
            info_hash: self.info_hash.to_hex(),
            name: self.name.clone(),
            bitfield: store.have().as_bytes().to_vec(),
            piece_count: store.piece_count(),
            file_priorities: self.file_priorities.clone(),
            save_path: self.save_path.clone(),
            queue_position: self.queue_position,
            tags: self.tags.clone(),
            category: self.category.clone(),
            uploaded: self.uploaded,
            downloaded: self.downloaded,
            seeding_secs: self.seeding_secs(now),
            paused: self.state == TorrentState::Paused,
            sequential: self.scheduler.sequential,
            file_sizes,
        })
    }

    /// Index of the peer at `addr`
    pub fn peer_index(&self, addr: &SocketAddr) -> Option<usize> {
        self.peers.iter().position(|p| p.addr == *addr)
    }

    /// Track a newly handshaked peer; rejects duplicates
    pub fn add_peer(&mut self, addr: SocketAddr, origin: PeerOrigin, now: Instant) -> Option<usize> {
        if self.peer_index(&addr).is_some() {
            return None;
        }
        let piece_count = self.store.as_ref().map(|s| s.piece_count()).unwrap_or(0);
        let mut peer = Peer::new(addr, origin, piece_count, now);
        peer.state = ConnectionState::Operational;
        self.peers.push(peer);
        Some(self.peers.len() - 1)
    }

    /// Drop a peer and make its address eligible for rediscovery
    pub fn remove_peer(&mut self, addr: &SocketAddr, reason: DisconnectReason) {
        if let Some(index) = self.peer_index(addr) {
            debug!(id = self.id, peer = %addr, reason = reason.as_str(), "peer removed");
            self.peers.swap_remove(index);
            self.candidates.forget(addr);
        }
    }

    /// Feed one inbound message through the owning peer
    ///
    /// `Piece` payloads go through the piece store and may complete a
    /// piece; everything else lands in the peer's state.
    pub fn handle_message(
        &mut self,
        index: usize,
        message: Message,
        now: Instant,
        hash_failure_threshold: u32,
    ) -> Result<BlockEvent> {
        if index >= self.peers.len() {
            return Ok(BlockEvent::Ignored);
        }
        let (piece, offset, data) = match message {
            Message::Piece { piece, offset, data } => (piece, offset, data),
            other => {
                self.peers[index].apply_message(&other, now)?;
                return Ok(BlockEvent::Ignored);
            }
        };

        let block = BlockRef {
            piece,
            offset,
            length: data.len() as u32,
        };
        let expected = self.peers[index].clear_request(&block);
        if !expected {
            // Late block after a cancel; count it but do not store twice
            warn!(id = self.id, peer = %self.peers[index].addr, piece, "unrequested block");
        }
        self.peers[index].record_downloaded(data.len() as u64, now);
        self.downloaded += data.len() as u64;

        let Some(store) = &mut self.store else {
            return Ok(BlockEvent::Ignored);
        };
        match store.mark_block_received(piece, offset, data) {
            BlockOutcome::Pending => {
                self.cancel_redundant(&block, index);
                Ok(BlockEvent::Progress)
            }
            BlockOutcome::PieceComplete(payload) => {
                self.cancel_redundant(&block, index);
                self.announce_piece(piece);
                let finished = self
                    .store
                    .as_ref()
                    .is_some_and(|s| s.selected_complete());
                if finished {
                    self.set_state(TorrentState::Seeding, now);
                }
                Ok(BlockEvent::PieceVerified {
                    piece,
                    data: payload,
                    finished,
                })
            }
            BlockOutcome::HashMismatch => {
                let peer = &mut self.peers[index];
                peer.hash_failures += 1;
                let disconnect = peer.hash_failures >= hash_failure_threshold;
                warn!(
                    id = self.id,
                    peer = %peer.addr,
                    failures = peer.hash_failures,
                    "piece failed verification"
                );
                Ok(BlockEvent::HashMismatch { piece, disconnect })
            }
            BlockOutcome::Rejected => Ok(BlockEvent::Ignored),
        }
    }

    /// Cancel this block everywhere else it is in flight (endgame)
    fn cancel_redundant(&mut self, block: &BlockRef, source: usize) {
        for holder in BlockScheduler::redundant_holders(&self.peers, block, source) {
            let peer = &mut self.peers[holder];
            peer.clear_request(block);
            peer.outbox.push(Message::Cancel {
                piece: block.piece,
                offset: block.offset,
                length: block.length,
            });
        }
    }

    /// Queue a `Have` for a freshly verified piece to every peer
    fn announce_piece(&mut self, piece: u32) {
        for peer in &mut self.peers {
            if peer.state == ConnectionState::Operational {
                peer.outbox.push(Message::Have { piece });
            }
        }
    }

    /// Reconcile each peer's interested flag with what it can offer
    pub fn update_interest(&mut self) {
        let Some(store) = &self.store else { return };
        for peer in &mut self.peers {
            if peer.state != ConnectionState::Operational {
                continue;
            }
            let useful = peer_useful(store, peer);
            if useful && !peer.am_interested {
                peer.am_interested = true;
                peer.outbox.push(Message::Interested);
            } else if !useful && peer.am_interested {
                peer.am_interested = false;
                peer.outbox.push(Message::NotInterested);
            }
        }
    }

    /// Run the block picker and queue the chosen requests
    pub fn schedule_requests(&mut self, now: Instant, pipeline_depth: usize) -> usize {
        let Some(store) = &self.store else { return 0 };
        if !self.state.is_active() || self.state == TorrentState::Seeding {
            return 0;
        }
        let assigned = self.scheduler.assign(store, &self.peers, pipeline_depth);
        let count = assigned.len();
        for (index, block) in assigned {
            let peer = &mut self.peers[index];
            peer.add_request(block, now);
            peer.outbox.push(Message::Request {
                piece: block.piece,
                offset: block.offset,
                length: block.length,
            });
        }
        count
    }

    /// Run a choke evaluation and queue the transitions
    pub fn choke_tick(&mut self, rotate: bool) {
        let seeding = self.state == TorrentState::Seeding;
        let (_, upload_rate) = self.rates();
        let decision = self.choker.evaluate(&self.peers, seeding, upload_rate, rotate);
        for index in decision.unchoke {
            let peer = &mut self.peers[index];
            peer.am_choking = false;
            peer.outbox.push(Message::Unchoke);
        }
        for index in decision.choke {
            let peer = &mut self.peers[index];
            peer.am_choking = true;
            peer.outbox.push(Message::Choke);
        }
    }

    /// Periodic peer upkeep: rate samples, snub detection, timeouts
    ///
    /// Returns the peers that must be disconnected.
    pub fn maintain_peers(&mut self, config: &SessionConfig, now: Instant) -> Vec<SocketAddr> {
        let mut drop_list = Vec::new();
        for peer in &mut self.peers {
            peer.sample_rates(now);
            peer.update_snub(now, config.snub_threshold);
            if peer
                .oldest_request_age(now)
                .is_some_and(|age| age >= config.request_timeout)
            {
                drop_list.push(peer.addr);
            }
        }
        drop_list
    }

    /// Evaluate share-ratio and seeding-time limits
    ///
    /// The configured action fires exactly once per breach; the flag
    /// rearms only when the torrent is activated again.
    pub fn check_limits(&mut self, config: &SessionConfig, now: Instant) -> Option<LimitAction> {
        if self.state != TorrentState::Seeding || self.limit_breached {
            return None;
        }
        let ratio_hit = config
            .share_ratio_limit
            .is_some_and(|limit| self.share_ratio() >= limit);
        let time_hit = config
            .seeding_time_limit
            .is_some_and(|limit| self.seeding_secs(now) >= limit.as_secs());
        if ratio_hit || time_hit {
            info!(
                id = self.id,
                ratio = self.share_ratio(),
                "seeding limit reached"
            );
            self.limit_breached = true;
            Some(config.limit_action)
        } else {
            None
        }
    }

    /// Rearm the limit latch, e.g. when the user resumes the torrent
    pub fn rearm_limits(&mut self) {
        self.limit_breached = false;
    }

    /// Diagnostic snapshot
    pub fn stats(&self) -> TorrentStats {
        let (download_rate, upload_rate) = self.rates();
        TorrentStats {
            id: self.id,
            info_hash: self.info_hash,
            name: self.name.clone(),
            state: self.state,
            progress: self.progress(),
            downloaded: self.downloaded,
            uploaded: self.uploaded,
            download_rate,
            upload_rate,
            peer_count: self.peers.len(),
            queue_position: self.queue_position,
            error: self.error.clone(),
        }
    }

    /// Per-peer diagnostics
    pub fn peer_stats(&self) -> Vec<PeerStats> {
        self.peers.iter().map(|p| p.stats()).collect()
    }
}
