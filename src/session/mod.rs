//! Session orchestration
//!
//! The session owns every torrent in an id-keyed arena and runs the
//! engine's timers: choke evaluation, tracker announces, resume
//! saves, queue admission, and limit checks. Peer sockets live in
//! their own pump tasks and talk to the session over channels, so a
//! peer event always resolves its torrent through the arena by id.
//! Faults stay per-torrent: a disk error or protocol violation in one
//! transfer never touches another.

pub mod events;
pub mod ip_filter;
pub mod queue;
pub mod rate;

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant};

use anyhow::Result;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Notify};
use tokio::time::interval;
use tracing::{debug, error, info, trace, warn};

use crate::config::SessionConfig;
use crate::error::EngineError;
use crate::peer::{DisconnectReason, PeerConnection, PeerOrigin, PeerStats};
use crate::protocol::{Handshake, Message};
use crate::resume::{ResumeOutcome, ResumeStore};
use crate::storage::{DiskJobResult, DiskPool, FileLayout, FsBackend, StorageBackend};
use crate::torrent::metadata::{InfoHash, MagnetTarget, TorrentMeta};
use crate::torrent::state::{FilePriority, LimitAction, TorrentState};
use crate::torrent::torrent::{BlockEvent, Torrent, TorrentStats};
use crate::tracker::{AnnounceEvent, AnnounceParams, HttpAnnouncer};

pub use events::{EventSender, SessionEvent};
pub use ip_filter::{FilterWarning, IpFilter};
pub use queue::{QueueDecision, QueueSettings};
pub use rate::RateLimiter;

/// Peers asked for per announce
const NUMWANT: u32 = 50;

/// Largest block a remote request may ask for
const MAX_REQUEST_LEN: u32 = 128 * 1024;

/// Events from peer pump tasks back into the session
enum NetEvent {
    /// A handshaked connection ready for adoption
    Ready {
        torrent: u64,
        origin: PeerOrigin,
        conn: PeerConnection,
    },
    /// One decoded message from a live peer
    Inbound {
        torrent: u64,
        addr: SocketAddr,
        message: Message,
    },
    /// The peer's socket died or misbehaved
    Closed {
        torrent: u64,
        addr: SocketAddr,
        reason: DisconnectReason,
    },
    DialFailed {
        torrent: u64,
        addr: SocketAddr,
        reason: String,
    },
}

/// Completions from background I/O tasks
enum IoEvent {
    AnnounceDone {
        torrent: u64,
        tracker: usize,
        result: std::result::Result<crate::tracker::AnnounceResponse, String>,
    },
    CheckDone {
        torrent: u64,
        generation: u64,
        verified: Vec<u32>,
    },
    MoveDone {
        torrent: u64,
        generation: u64,
        result: std::result::Result<PathBuf, String>,
    },
}

/// Limiters applied inside one peer's pump tasks
struct PumpLimits {
    down: Vec<Arc<RateLimiter>>,
    up: Vec<Arc<RateLimiter>>,
}

/// Remote control for a running session loop
#[derive(Clone)]
pub struct ShutdownHandle {
    flag: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl ShutdownHandle {
    /// Ask the session loop to exit; resume records are saved and
    /// trackers receive a stopped announce before it returns
    pub fn shutdown(&self) {
        self.flag.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }
}

/// The engine: owns all torrents and drives every policy timer
pub struct Session {
    config: SessionConfig,
    peer_id: [u8; 20],
    torrents: HashMap<u64, Torrent>,
    next_id: u64,
    events: EventSender,
    resume: ResumeStore,
    announcer: HttpAnnouncer,
    filter: IpFilter,
    download_limiter: Arc<RateLimiter>,
    upload_limiter: Arc<RateLimiter>,
    /// Per-torrent (download, upload) buckets; unlimited by default
    torrent_limiters: HashMap<u64, (Arc<RateLimiter>, Arc<RateLimiter>)>,
    backends: HashMap<u64, Arc<dyn StorageBackend>>,
    /// Outbound message channel per live peer; dropping one closes
    /// the peer's write pump
    links: HashMap<(u64, SocketAddr), mpsc::UnboundedSender<Message>>,
    dialing: HashSet<(u64, SocketAddr)>,
    /// Handshake info hash to torrent id, shared with accept tasks
    hashes: Arc<RwLock<HashMap<[u8; 20], u64>>>,
    disk: DiskPool,
    disk_rx: mpsc::UnboundedReceiver<DiskJobResult>,
    net_tx: mpsc::UnboundedSender<NetEvent>,
    net_rx: mpsc::UnboundedReceiver<NetEvent>,
    io_tx: mpsc::UnboundedSender<IoEvent>,
    io_rx: mpsc::UnboundedReceiver<IoEvent>,
    /// Earliest next announce per (torrent, tracker)
    next_announce: HashMap<(u64, usize), Instant>,
    announcing: HashSet<(u64, usize)>,
    /// Torrents whose resume record is stale
    dirty: HashSet<u64>,
    shutdown_flag: Arc<AtomicBool>,
    shutdown_notify: Arc<Notify>,
}

impl Session {
    /// Create a session; the receiver is the event stream for the
    /// embedding shell
    pub fn new(config: SessionConfig) -> Result<(Self, mpsc::UnboundedReceiver<SessionEvent>)> {
        config.validate()?;
        let (events, event_rx) = EventSender::channel();
        let (disk, disk_rx) = DiskPool::new(config.max_disk_jobs);
        let (net_tx, net_rx) = mpsc::unbounded_channel();
        let (io_tx, io_rx) = mpsc::unbounded_channel();
        let session = Self {
            peer_id: Handshake::generate_peer_id(),
            torrents: HashMap::new(),
            next_id: 1,
            events,
            resume: ResumeStore::new(config.resume_dir.clone()),
            announcer: HttpAnnouncer::new()?,
            filter: IpFilter::empty(),
            download_limiter: Arc::new(RateLimiter::new(config.download_limit)),
            upload_limiter: Arc::new(RateLimiter::new(config.upload_limit)),
            torrent_limiters: HashMap::new(),
            backends: HashMap::new(),
            links: HashMap::new(),
            dialing: HashSet::new(),
            hashes: Arc::new(RwLock::new(HashMap::new())),
            disk,
            disk_rx,
            net_tx,
            net_rx,
            io_tx,
            io_rx,
            next_announce: HashMap::new(),
            announcing: HashSet::new(),
            dirty: HashSet::new(),
            shutdown_flag: Arc::new(AtomicBool::new(false)),
            shutdown_notify: Arc::new(Notify::new()),
            config,
        };
        Ok((session, event_rx))
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Handle for stopping `run` from another task
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            flag: Arc::clone(&self.shutdown_flag),
            notify: Arc::clone(&self.shutdown_notify),
        }
    }

    /// Install an externally parsed set of banned ranges
    pub fn set_ip_filter(&mut self, filter: IpFilter) {
        info!(ranges = filter.len(), "ip filter installed");
        self.filter = filter;
    }

    /// Load a filter file's text; malformed lines come back as
    /// line-numbered warnings
    pub fn load_ip_filter(&mut self, text: &str) -> Vec<FilterWarning> {
        let (filter, warnings) = IpFilter::parse(text);
        self.set_ip_filter(filter);
        warnings
    }

    /// Change the global rate limits
    pub fn set_rate_limits(&mut self, download: Option<u64>, upload: Option<u64>) {
        self.download_limiter.set_rate(download);
        self.upload_limiter.set_rate(upload);
    }

    /// Change one torrent's rate limits
    pub fn set_torrent_rate_limits(
        &mut self,
        id: u64,
        download: Option<u64>,
        upload: Option<u64>,
    ) -> Result<()> {
        let (down, up) = self
            .torrent_limiters
            .get(&id)
            .ok_or_else(|| EngineError::config("unknown torrent"))?;
        down.set_rate(download);
        up.set_rate(upload);
        Ok(())
    }

    fn torrent_mut(&mut self, id: u64) -> Result<&mut Torrent> {
        self.torrents
            .get_mut(&id)
            .ok_or_else(|| EngineError::config("unknown torrent").into())
    }

    fn find_by_hash(&self, info_hash: &InfoHash) -> Option<u64> {
        self.torrents
            .values()
            .find(|t| t.info_hash == *info_hash)
            .map(|t| t.id)
    }

    fn next_queue_position(&self) -> u32 {
        self.torrents
            .values()
            .map(|t| t.queue_position + 1)
            .max()
            .unwrap_or(0)
    }

    fn register_hash(&self, hash: [u8; 20], id: u64) {
        self.hashes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(hash, id);
    }

    fn unregister_hash(&self, hash: &[u8; 20]) {
        self.hashes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(hash);
    }

    /// Add a torrent from a decoded descriptor
    ///
    /// An existing resume record is restored; a missing one means a
    /// fresh download and the file tree is allocated. A record that
    /// cannot be trusted triggers a background re-check instead.
    pub async fn add_torrent(&mut self, meta: TorrentMeta, save_path: PathBuf) -> Result<u64> {
        let info_hash = meta.info_hash;
        if self.find_by_hash(&info_hash).is_some() {
            return Err(EngineError::config("torrent already in session").into());
        }
        let id = self.next_id;
        self.next_id += 1;
        let now = Instant::now();
        let mut torrent = Torrent::from_meta(id, meta, save_path, &self.config)?;
        torrent.queue_position = self.next_queue_position();

        let mut needs_check = false;
        let mut fresh = false;
        match self.resume.load(&info_hash).await {
            ResumeOutcome::Loaded(record) => match torrent.restore(&record, now) {
                Ok(()) => {
                    let Some(layout) = torrent.layout() else {
                        return Err(EngineError::config("descriptor lost its layout").into());
                    };
                    let observed = layout.probe_sizes(&torrent.save_path).await;
                    if !record.sizes_match(&observed) {
                        warn!(id, "on-disk sizes disagree with resume record");
                        needs_check = true;
                    }
                }
                Err(e) => {
                    warn!(id, error = %e, "resume record unusable");
                    needs_check = true;
                }
            },
            ResumeOutcome::Recheck(reason) => {
                warn!(id, reason = %reason, "resume record demoted to re-check");
                needs_check = true;
            }
            ResumeOutcome::Missing => fresh = true,
        }

        let Some(layout) = torrent.layout().cloned() else {
            return Err(EngineError::config("descriptor lost its layout").into());
        };
        let backend: Arc<dyn StorageBackend> =
            Arc::new(FsBackend::new(torrent.save_path.clone(), layout));
        if fresh {
            match backend.allocate().await {
                Ok(()) => torrent.set_state(TorrentState::Downloading, now),
                Err(e) => {
                    torrent.error = Some(e.to_string());
                    torrent.set_state(TorrentState::Error, now);
                    self.events.emit(SessionEvent::TorrentErrored {
                        id,
                        reason: e.to_string(),
                    });
                }
            }
        }
        // New arrivals compete for a slot like everyone else
        if self.config.queue.enabled && torrent.state.is_active() {
            torrent.set_state(TorrentState::Queued, now);
        }

        self.backends.insert(id, backend);
        self.torrent_limiters.insert(
            id,
            (
                Arc::new(RateLimiter::unlimited()),
                Arc::new(RateLimiter::unlimited()),
            ),
        );
        self.register_hash(info_hash.handshake_bytes(), id);
        self.torrents.insert(id, torrent);
        self.events.emit(SessionEvent::TorrentAdded { id, info_hash });
        self.dirty.insert(id);
        if needs_check {
            self.spawn_recheck(id);
        }
        info!(id, hash = %info_hash.to_hex(), "torrent added");
        Ok(id)
    }

    /// Add a magnet-identified torrent; it idles in the metadata
    /// phase until `set_metadata` supplies a descriptor
    pub fn add_magnet(&mut self, target: MagnetTarget, save_path: PathBuf) -> Result<u64> {
        if self.find_by_hash(&target.info_hash).is_some() {
            return Err(EngineError::config("torrent already in session").into());
        }
        let id = self.next_id;
        self.next_id += 1;
        let info_hash = target.info_hash;
        let mut torrent = Torrent::from_magnet(id, target, save_path, &self.config);
        torrent.queue_position = self.next_queue_position();
        self.torrent_limiters.insert(
            id,
            (
                Arc::new(RateLimiter::unlimited()),
                Arc::new(RateLimiter::unlimited()),
            ),
        );
        self.register_hash(info_hash.handshake_bytes(), id);
        self.torrents.insert(id, torrent);
        self.events.emit(SessionEvent::TorrentAdded { id, info_hash });
        info!(id, hash = %info_hash.to_hex(), "magnet added");
        Ok(id)
    }

    /// Supply the descriptor for a magnet-added torrent
    pub async fn set_metadata(&mut self, id: u64, meta: TorrentMeta) -> Result<()> {
        let torrent = self.torrent_mut(id)?;
        torrent.set_metadata(meta)?;
        let Some(layout) = torrent.layout().cloned() else {
            return Err(EngineError::config("descriptor lost its layout").into());
        };
        let backend: Arc<dyn StorageBackend> =
            Arc::new(FsBackend::new(torrent.save_path.clone(), layout));
        if let Err(e) = backend.allocate().await {
            self.fail_torrent(id, e.to_string());
            return Err(e);
        }
        self.backends.insert(id, backend);
        self.dirty.insert(id);
        Ok(())
    }

    /// Stop a torrent; peers disconnect and trackers get a stopped
    /// announce
    pub fn pause(&mut self, id: u64) -> Result<()> {
        let now = Instant::now();
        let torrent = self.torrent_mut(id)?;
        if torrent.state == TorrentState::Paused {
            return Ok(());
        }
        torrent.set_state(TorrentState::Paused, now);
        self.disconnect_all(id, DisconnectReason::TorrentPaused);
        if let Some(torrent) = self.torrents.get(&id) {
            self.spawn_stopped_announces(torrent);
        }
        self.next_announce.retain(|(tid, _), _| *tid != id);
        self.dirty.insert(id);
        Ok(())
    }

    /// Restart a paused, errored, or queued torrent
    pub fn resume_torrent(&mut self, id: u64) -> Result<()> {
        let queueing = self.config.queue.enabled;
        let now = Instant::now();
        let torrent = self.torrent_mut(id)?;
        if torrent.state.is_active() || torrent.state == TorrentState::Checking {
            return Ok(());
        }
        torrent.error = None;
        torrent.rearm_limits();
        let state = if queueing {
            TorrentState::Queued
        } else {
            torrent.natural_active_state()
        };
        torrent.set_state(state, now);
        torrent.trackers.force_reannounce();
        self.next_announce.retain(|(tid, _), _| *tid != id);
        self.dirty.insert(id);
        Ok(())
    }

    /// Remove a torrent, optionally deleting its payload from disk
    pub async fn remove(&mut self, id: u64, delete_data: bool) -> Result<()> {
        let Some(torrent) = self.torrents.remove(&id) else {
            return Err(EngineError::config("unknown torrent").into());
        };
        info!(id, hash = %torrent.info_hash.to_hex(), delete_data, "removing torrent");
        self.links.retain(|(tid, _), _| *tid != id);
        self.dialing.retain(|(tid, _)| *tid != id);
        self.next_announce.retain(|(tid, _), _| *tid != id);
        self.announcing.retain(|(tid, _)| *tid != id);
        self.dirty.remove(&id);
        self.torrent_limiters.remove(&id);
        self.backends.remove(&id);
        self.unregister_hash(&torrent.info_hash.handshake_bytes());
        self.spawn_stopped_announces(&torrent);
        self.resume.delete(&torrent.info_hash).await?;
        if delete_data {
            if let Some(layout) = torrent.layout().cloned() {
                let root = torrent.save_path.clone();
                tokio::spawn(async move {
                    for file in layout.files() {
                        let _ = tokio::fs::remove_file(root.join(&file.path)).await;
                    }
                });
            }
        }
        Ok(())
    }

    /// Relocate a torrent's payload; it sits in `Moving` until the
    /// background copy finishes
    pub fn move_storage(&mut self, id: u64, destination: PathBuf) -> Result<()> {
        let io = self.io_tx.clone();
        let torrent = self.torrent_mut(id)?;
        let Some(layout) = torrent.layout().cloned() else {
            return Err(EngineError::config("no metadata yet").into());
        };
        // In-flight disk jobs still target the old root
        torrent.generation += 1;
        let generation = torrent.generation;
        torrent.set_state(TorrentState::Moving, Instant::now());
        let source = torrent.save_path.clone();
        info!(id, from = %source.display(), to = %destination.display(), "moving storage");
        tokio::spawn(async move {
            let result = relocate(&layout, &source, &destination)
                .await
                .map(|_| destination)
                .map_err(|e| e.to_string());
            let _ = io.send(IoEvent::MoveDone {
                torrent: id,
                generation,
                result,
            });
        });
        Ok(())
    }

    /// Change per-file priorities
    pub fn set_file_priorities(&mut self, id: u64, priorities: Vec<FilePriority>) -> Result<()> {
        let torrent = self.torrent_mut(id)?;
        torrent.set_file_priorities(priorities, Instant::now())?;
        self.dirty.insert(id);
        Ok(())
    }

    /// Toggle strict index-order downloading
    pub fn set_sequential(&mut self, id: u64, sequential: bool) -> Result<()> {
        let torrent = self.torrent_mut(id)?;
        torrent.scheduler.sequential = sequential;
        self.dirty.insert(id);
        Ok(())
    }

    /// Reorder a torrent within the queue
    pub fn set_queue_position(&mut self, id: u64, position: u32) -> Result<()> {
        let torrent = self.torrent_mut(id)?;
        torrent.queue_position = position;
        self.dirty.insert(id);
        Ok(())
    }

    /// Re-announce to every tracker of a torrent right away
    pub fn force_reannounce(&mut self, id: u64) -> Result<()> {
        let torrent = self.torrent_mut(id)?;
        torrent.trackers.force_reannounce();
        self.next_announce.retain(|(tid, _), _| *tid != id);
        Ok(())
    }

    /// Feed discovered peer addresses from DHT, PEX, or LSD
    ///
    /// The candidate queue de-duplicates and drops distributed
    /// sources for private torrents.
    pub fn add_candidates(
        &mut self,
        id: u64,
        addrs: Vec<SocketAddr>,
        origin: PeerOrigin,
    ) -> Result<()> {
        let torrent = self.torrent_mut(id)?;
        torrent.candidates.extend(addrs, origin);
        Ok(())
    }

    /// Diagnostics for one torrent
    pub fn torrent_stats(&self, id: u64) -> Option<TorrentStats> {
        self.torrents.get(&id).map(|t| t.stats())
    }

    /// Diagnostics for every torrent
    pub fn all_stats(&self) -> Vec<TorrentStats> {
        let mut stats: Vec<TorrentStats> = self.torrents.values().map(|t| t.stats()).collect();
        stats.sort_by_key(|s| s.id);
        stats
    }

    /// Per-peer diagnostics for one torrent
    pub fn peer_stats(&self, id: u64) -> Vec<PeerStats> {
        self.torrents
            .get(&id)
            .map(|t| t.peer_stats())
            .unwrap_or_default()
    }

    /// Drive the engine until the shutdown handle fires
    pub async fn run(&mut self) -> Result<()> {
        let listen_addr = format!("0.0.0.0:{}", self.config.listen_port);
        let mut accept_rx = match TcpListener::bind(&listen_addr).await {
            Ok(listener) => {
                let local = listener.local_addr()?;
                info!(addr = %local, "listening for peers");
                self.events.emit(SessionEvent::ListenSucceeded { addr: local });
                let (tx, rx) = mpsc::unbounded_channel();
                tokio::spawn(async move {
                    loop {
                        match listener.accept().await {
                            Ok((stream, _)) => {
                                if tx.send(stream).is_err() {
                                    break;
                                }
                            }
                            Err(e) => warn!(error = %e, "accept failed"),
                        }
                    }
                });
                Some(rx)
            }
            Err(e) => {
                error!(addr = %listen_addr, error = %e, "listen failed");
                self.events.emit(SessionEvent::ListenFailed {
                    addr: listen_addr,
                    reason: e.to_string(),
                });
                None
            }
        };

        let mut maintenance = interval(Duration::from_secs(1));
        let mut choke = interval(self.config.choke_interval);
        let mut announce = interval(Duration::from_secs(2));
        let mut resume = interval(self.config.resume_interval);
        let mut keepalive = interval(Duration::from_secs(90));
        let mut last_rotate = Instant::now();

        loop {
            if self.shutdown_flag.load(Ordering::SeqCst) {
                break;
            }
            tokio::select! {
                _ = self.shutdown_notify.notified() => break,
                Some(stream) = async {
                    match accept_rx.as_mut() {
                        Some(rx) => rx.recv().await,
                        None => std::future::pending().await,
                    }
                } => {
                    self.handle_incoming(stream);
                }
                Some(event) = self.net_rx.recv() => {
                    self.handle_net(event, Instant::now());
                }
                Some(event) = self.io_rx.recv() => {
                    self.handle_io(event, Instant::now());
                }
                Some(done) = self.disk_rx.recv() => {
                    self.apply_disk_result(done);
                }
                _ = maintenance.tick() => {
                    self.maintenance_tick(Instant::now()).await;
                }
                _ = choke.tick() => {
                    let now = Instant::now();
                    let rotate = now.saturating_duration_since(last_rotate)
                        >= self.config.optimistic_interval;
                    if rotate {
                        last_rotate = now;
                    }
                    self.choke_round(rotate);
                }
                _ = announce.tick() => {
                    self.announce_tick(Instant::now());
                }
                _ = resume.tick() => {
                    self.resume_tick().await;
                }
                _ = keepalive.tick() => {
                    self.keepalive_tick();
                }
            }
        }
        self.shutdown_cleanly().await;
        Ok(())
    }

    /// Accept-path gate: the IP filter runs before any handshake
    fn handle_incoming(&mut self, stream: TcpStream) {
        let Ok(addr) = stream.peer_addr() else { return };
        if self.filter.is_blocked(&addr.ip()) {
            debug!(peer = %addr, "rejecting filtered peer");
            self.events.emit(SessionEvent::PeerBlocked {
                addr,
                reason: DisconnectReason::IpFiltered.as_str().to_string(),
            });
            return;
        }
        let hashes = Arc::clone(&self.hashes);
        let peer_id = self.peer_id;
        let policy = self.config.encryption;
        let net = self.net_tx.clone();
        tokio::spawn(async move {
            let resolve = move |hash: &[u8; 20]| {
                hashes
                    .read()
                    .unwrap_or_else(PoisonError::into_inner)
                    .get(hash)
                    .copied()
            };
            match PeerConnection::accept_matched(stream, peer_id, policy, resolve).await {
                Ok((torrent, conn)) => {
                    let _ = net.send(NetEvent::Ready {
                        torrent,
                        origin: PeerOrigin::Incoming,
                        conn,
                    });
                }
                Err(e) => debug!(peer = %addr, error = %e, "inbound handshake failed"),
            }
        });
    }

    fn handle_net(&mut self, event: NetEvent, now: Instant) {
        match event {
            NetEvent::Ready { torrent, origin, conn } => {
                self.handle_ready(torrent, origin, conn, now)
            }
            NetEvent::Inbound {
                torrent,
                addr,
                message,
            } => self.handle_inbound(torrent, addr, message, now),
            NetEvent::Closed {
                torrent,
                addr,
                reason,
            } => self.disconnect_peer(torrent, addr, reason),
            NetEvent::DialFailed {
                torrent,
                addr,
                reason,
            } => {
                self.dialing.remove(&(torrent, addr));
                debug!(torrent, peer = %addr, reason = %reason, "dial failed");
                if let Some(t) = self.torrents.get_mut(&torrent) {
                    t.candidates.forget(&addr);
                }
            }
        }
    }

    /// Adopt a handshaked connection into the torrent's peer set
    fn handle_ready(&mut self, id: u64, origin: PeerOrigin, conn: PeerConnection, now: Instant) {
        let addr = conn.addr;
        self.dialing.remove(&(id, addr));
        let Some(torrent) = self.torrents.get_mut(&id) else {
            tokio::spawn(conn.close(DisconnectReason::TorrentRemoved));
            return;
        };
        if !torrent.state.is_active() {
            tokio::spawn(conn.close(DisconnectReason::TorrentPaused));
            return;
        }
        if torrent.peers.len() >= self.config.max_connections_per_torrent
            || torrent.peer_index(&addr).is_some()
        {
            tokio::spawn(conn.close(DisconnectReason::ConnectionLimit));
            return;
        }
        let caps = conn.remote;
        let Some(index) = torrent.add_peer(addr, origin, now) else {
            tokio::spawn(conn.close(DisconnectReason::ConnectionLimit));
            return;
        };
        if let Some(caps) = caps {
            let peer = &mut torrent.peers[index];
            peer.peer_id = Some(caps.peer_id);
            peer.supports_encryption = caps.encryption;
            peer.supports_extensions = caps.extensions;
        }

        let (link_tx, link_rx) = mpsc::unbounded_channel();
        if let Some(store) = torrent.store() {
            if store.completed_count() > 0 {
                let _ = link_tx.send(Message::Bitfield {
                    bits: store.have().as_bytes().to_vec(),
                });
            }
        }
        self.links.insert((id, addr), link_tx);

        let mut down = vec![Arc::clone(&self.download_limiter)];
        let mut up = vec![Arc::clone(&self.upload_limiter)];
        if let Some((d, u)) = self.torrent_limiters.get(&id) {
            down.push(Arc::clone(d));
            up.push(Arc::clone(u));
        }
        debug!(torrent = id, peer = %addr, ?origin, "peer adopted");
        spawn_peer_pumps(conn, id, self.net_tx.clone(), link_rx, PumpLimits { down, up });
    }

    fn handle_inbound(&mut self, id: u64, addr: SocketAddr, message: Message, now: Instant) {
        let Some(torrent) = self.torrents.get_mut(&id) else {
            return;
        };
        let Some(index) = torrent.peer_index(&addr) else {
            return;
        };
        let generation = torrent.generation;
        let outcome =
            torrent.handle_message(index, message, now, self.config.hash_failure_threshold);
        match outcome {
            Ok(BlockEvent::PieceVerified {
                piece,
                data,
                finished,
            }) => {
                if let Some(backend) = self.backends.get(&id) {
                    self.disk
                        .spawn_write(Arc::clone(backend), id, generation, piece, data);
                }
                self.dirty.insert(id);
                if finished {
                    info!(id, "download complete");
                    self.events.emit(SessionEvent::TorrentCompleted { id });
                    let targets = self
                        .torrents
                        .get(&id)
                        .map(|t| t.trackers.targets())
                        .unwrap_or_default();
                    for tracker in targets {
                        self.spawn_announce(id, tracker, AnnounceEvent::Completed);
                    }
                }
            }
            Ok(BlockEvent::HashMismatch { disconnect, .. }) => {
                if disconnect {
                    self.disconnect_peer(id, addr, DisconnectReason::HashFailures);
                }
            }
            Ok(_) => {}
            Err(e) => {
                warn!(torrent = id, peer = %addr, error = %e, "peer protocol violation");
                self.disconnect_peer(id, addr, DisconnectReason::MalformedMessage);
            }
        }
    }

    fn handle_io(&mut self, event: IoEvent, now: Instant) {
        match event {
            IoEvent::AnnounceDone {
                torrent,
                tracker,
                result,
            } => self.handle_announce_done(torrent, tracker, result, now),
            IoEvent::CheckDone {
                torrent,
                generation,
                verified,
            } => {
                let queueing = self.config.queue.enabled;
                let Some(t) = self.torrents.get_mut(&torrent) else {
                    return;
                };
                if t.generation != generation {
                    debug!(torrent, "dropping stale re-check result");
                    return;
                }
                let count = verified.len();
                if let Some(store) = t.store_mut() {
                    for piece in verified {
                        store.set_have(piece);
                    }
                }
                let state = if queueing {
                    TorrentState::Queued
                } else {
                    t.natural_active_state()
                };
                t.set_state(state, now);
                info!(torrent, pieces = count, "re-check finished");
                self.dirty.insert(torrent);
            }
            IoEvent::MoveDone {
                torrent,
                generation,
                result,
            } => match result {
                Ok(path) => {
                    let Some(t) = self.torrents.get_mut(&torrent) else {
                        return;
                    };
                    if t.generation != generation {
                        return;
                    }
                    t.save_path = path;
                    let state = t.natural_active_state();
                    t.set_state(state, now);
                    if let Some(layout) = t.layout().cloned() {
                        let root = t.save_path.clone();
                        self.backends
                            .insert(torrent, Arc::new(FsBackend::new(root, layout)));
                    }
                    info!(torrent, "storage move finished");
                    self.dirty.insert(torrent);
                }
                Err(reason) => self.fail_torrent(torrent, reason),
            },
        }
    }

    fn handle_announce_done(
        &mut self,
        id: u64,
        index: usize,
        result: std::result::Result<crate::tracker::AnnounceResponse, String>,
        now: Instant,
    ) {
        self.announcing.remove(&(id, index));
        let Some(torrent) = self.torrents.get_mut(&id) else {
            return;
        };
        let Some(tracker) = torrent.trackers.get_mut(index) else {
            return;
        };
        let previous = tracker.status;
        let url = tracker.url.clone();
        let peers = match result {
            Ok(response) => {
                if let Some(warning) = &response.warning {
                    warn!(tracker = %url, warning = %warning, "tracker warning");
                }
                tracker.on_success(response.interval);
                response.peers
            }
            Err(reason) => {
                tracker.on_failure(reason);
                Vec::new()
            }
        };
        let status = tracker.status;
        self.next_announce
            .insert((id, index), now + tracker.next_interval);
        torrent.candidates.extend(peers, PeerOrigin::Tracker);
        if status != previous {
            self.events.emit(SessionEvent::TrackerStatusChanged { id, url, status });
        }
    }

    /// Drop a torrent's disk-job results that raced its removal
    fn apply_disk_result(&mut self, done: DiskJobResult) {
        let Some(torrent) = self.torrents.get(&done.torrent) else {
            trace!(torrent = done.torrent, "disk result for removed torrent");
            return;
        };
        if torrent.generation != done.generation {
            debug!(torrent = done.torrent, piece = done.piece, "stale disk result");
            return;
        }
        if let Err(reason) = done.result {
            // Disk failures pause the affected torrent only
            let message = format!("disk write for piece {} failed: {}", done.piece, reason);
            error!(torrent = done.torrent, reason = %message, "pausing on disk error");
            self.disconnect_all(done.torrent, DisconnectReason::Io);
            if let Some(t) = self.torrents.get_mut(&done.torrent) {
                t.error = Some(message.clone());
                t.set_state(TorrentState::Paused, Instant::now());
            }
            self.events.emit(SessionEvent::TorrentErrored {
                id: done.torrent,
                reason: message,
            });
            self.dirty.insert(done.torrent);
        }
    }

    /// One-second upkeep: timeouts, interest, scheduling, serving,
    /// dialing, queueing, and seeding limits
    async fn maintenance_tick(&mut self, now: Instant) {
        let ids: Vec<u64> = self.torrents.keys().copied().collect();
        let mut removals = Vec::new();
        for id in ids {
            let dropped = match self.torrents.get_mut(&id) {
                Some(t) => t.maintain_peers(&self.config, now),
                None => continue,
            };
            for addr in dropped {
                self.disconnect_peer(id, addr, DisconnectReason::RequestTimeout);
            }
            if let Some(t) = self.torrents.get_mut(&id) {
                if t.state == TorrentState::Downloading {
                    t.update_interest();
                    t.schedule_requests(now, self.config.pipeline_depth);
                }
            }
            self.serve_requests(id);
            self.flush_outbox(id);
            self.dial_candidates(id);
            let action = self
                .torrents
                .get_mut(&id)
                .and_then(|t| t.check_limits(&self.config, now));
            match action {
                Some(LimitAction::Pause) => {
                    let _ = self.pause(id);
                }
                Some(LimitAction::Remove) => removals.push(id),
                None => {}
            }
        }
        for id in removals {
            if let Err(e) = self.remove(id, false).await {
                warn!(id, error = %e, "limit-triggered removal failed");
            }
        }
        self.queue_tick(now);
    }

    /// Apply the admission policy; excess active torrents park in
    /// `Queued` until a slot frees up
    fn queue_tick(&mut self, now: Instant) {
        if !self.config.queue.enabled {
            return;
        }
        let candidates: Vec<queue::QueueCandidate> = self
            .torrents
            .values()
            .filter(|t| t.state.is_startable())
            .map(|t| {
                let (down, up) = t.rates();
                queue::QueueCandidate {
                    id: t.id,
                    queue_position: t.queue_position,
                    downloading: t.natural_active_state() == TorrentState::Downloading,
                    active: t.state.is_active(),
                    rate: down + up,
                }
            })
            .collect();
        let decision = queue::evaluate(&self.config.queue, &candidates);
        for id in decision.activate {
            if let Some(t) = self.torrents.get_mut(&id) {
                if t.state == TorrentState::Queued {
                    let state = t.natural_active_state();
                    t.set_state(state, now);
                }
            }
        }
        let mut parked = Vec::new();
        for id in decision.queue {
            if let Some(t) = self.torrents.get_mut(&id) {
                if t.state.is_active() {
                    t.set_state(TorrentState::Queued, now);
                    parked.push(id);
                }
            }
        }
        for id in parked {
            self.disconnect_all(id, DisconnectReason::TorrentPaused);
        }
    }

    /// Run the choking engine over every active torrent
    fn choke_round(&mut self, rotate: bool) {
        let ids: Vec<u64> = self.torrents.keys().copied().collect();
        for id in ids {
            if let Some(t) = self.torrents.get_mut(&id) {
                if t.state.is_active() {
                    t.choke_tick(rotate);
                }
            }
            self.flush_outbox(id);
        }
    }

    /// Start announces for every due tracker
    fn announce_tick(&mut self, now: Instant) {
        let ids: Vec<u64> = self.torrents.keys().copied().collect();
        for id in ids {
            let mut due = Vec::new();
            {
                let Some(torrent) = self.torrents.get(&id) else {
                    continue;
                };
                if !torrent.state.is_active() {
                    continue;
                }
                for index in torrent.trackers.targets() {
                    if self.announcing.contains(&(id, index)) {
                        continue;
                    }
                    let Some(tracker) = torrent.trackers.get(index) else {
                        continue;
                    };
                    let ready = tracker.next_interval.is_zero()
                        || self
                            .next_announce
                            .get(&(id, index))
                            .map_or(true, |at| now >= *at);
                    if !ready {
                        continue;
                    }
                    let event = if tracker.status == crate::tracker::TrackerStatus::NotContacted {
                        AnnounceEvent::Started
                    } else {
                        AnnounceEvent::Periodic
                    };
                    due.push((index, event));
                }
            }
            for (index, event) in due {
                self.spawn_announce(id, index, event);
            }
        }
    }

    fn spawn_announce(&mut self, id: u64, index: usize, event: AnnounceEvent) {
        if self.announcing.contains(&(id, index)) {
            return;
        }
        let port = self.config.listen_port;
        let peer_id = self.peer_id;
        let Some(torrent) = self.torrents.get_mut(&id) else {
            return;
        };
        let params = announce_params(torrent, event, port, peer_id);
        let Some(tracker) = torrent.trackers.get_mut(index) else {
            return;
        };
        tracker.begin_announce();
        let url = tracker.url.clone();
        self.announcing.insert((id, index));
        let announcer = self.announcer.clone();
        let io = self.io_tx.clone();
        tokio::spawn(async move {
            let result = announcer
                .announce(&url, &params)
                .await
                .map_err(|e| e.to_string());
            let _ = io.send(IoEvent::AnnounceDone {
                torrent: id,
                tracker: index,
                result,
            });
        });
    }

    /// Fire-and-forget stopped announces on pause, removal, shutdown
    fn spawn_stopped_announces(&self, torrent: &Torrent) {
        let params = announce_params(torrent, AnnounceEvent::Stopped, self.config.listen_port, self.peer_id);
        for tracker in torrent.trackers.iter() {
            if !tracker.is_working() {
                continue;
            }
            let announcer = self.announcer.clone();
            let url = tracker.url.clone();
            let params = params.clone();
            tokio::spawn(async move {
                let _ = announcer.announce(&url, &params).await;
            });
        }
    }

    /// Persist resume records for every dirty torrent
    async fn resume_tick(&mut self) {
        let now = Instant::now();
        let ids: Vec<u64> = self.dirty.drain().collect();
        for id in ids {
            let Some(torrent) = self.torrents.get(&id) else {
                continue;
            };
            let Some(layout) = torrent.layout() else {
                continue;
            };
            let sizes: Vec<u64> = layout
                .probe_sizes(&torrent.save_path)
                .await
                .into_iter()
                .map(|s| s.unwrap_or(0))
                .collect();
            let Some(record) = torrent.snapshot(now, sizes) else {
                continue;
            };
            match self.resume.save(&record).await {
                Ok(()) => self.events.emit(SessionEvent::ResumeDataSaved { id }),
                Err(e) => {
                    warn!(id, error = %e, "resume save failed");
                    self.dirty.insert(id);
                }
            }
        }
    }

    fn keepalive_tick(&self) {
        for link in self.links.values() {
            let _ = link.send(Message::KeepAlive);
        }
    }

    /// Answer queued peer requests from disk
    fn serve_requests(&mut self, id: u64) {
        let Some(torrent) = self.torrents.get_mut(&id) else {
            return;
        };
        let Some(backend) = self.backends.get(&id) else {
            return;
        };
        for index in 0..torrent.peers.len() {
            let requests = torrent.peers[index].take_incoming();
            if requests.is_empty() {
                continue;
            }
            let addr = torrent.peers[index].addr;
            let Some(link) = self.links.get(&(id, addr)) else {
                continue;
            };
            for block in requests {
                let Some(store) = torrent.store() else {
                    break;
                };
                if !store.has_piece(block.piece)
                    || block.length == 0
                    || block.length > MAX_REQUEST_LEN
                    || block.offset.saturating_add(block.length) > store.piece_size(block.piece)
                {
                    trace!(torrent = id, peer = %addr, piece = block.piece, "ignoring bad request");
                    continue;
                }
                torrent.peers[index].record_uploaded(u64::from(block.length));
                torrent.uploaded += u64::from(block.length);
                let backend = Arc::clone(backend);
                let link = link.clone();
                tokio::spawn(async move {
                    match backend.read_piece(block.piece).await {
                        Ok(data) => {
                            let start = block.offset as usize;
                            let end = start + block.length as usize;
                            if end <= data.len() {
                                let _ = link.send(Message::Piece {
                                    piece: block.piece,
                                    offset: block.offset,
                                    data: data[start..end].to_vec(),
                                });
                            }
                        }
                        Err(e) => warn!(piece = block.piece, error = %e, "serve read failed"),
                    }
                });
            }
        }
    }

    /// Hand queued wire messages to the pump tasks
    fn flush_outbox(&mut self, id: u64) {
        let Some(torrent) = self.torrents.get_mut(&id) else {
            return;
        };
        for peer in &mut torrent.peers {
            if peer.outbox.is_empty() {
                continue;
            }
            let Some(link) = self.links.get(&(id, peer.addr)) else {
                peer.outbox.clear();
                continue;
            };
            for message in peer.outbox.drain(..) {
                let _ = link.send(message);
            }
        }
    }

    /// Dial discovered candidates up to the connection ceiling
    fn dial_candidates(&mut self, id: u64) {
        let Some(torrent) = self.torrents.get_mut(&id) else {
            return;
        };
        if !torrent.state.is_active() {
            return;
        }
        let inflight = self.dialing.iter().filter(|(tid, _)| *tid == id).count();
        let mut budget = self
            .config
            .max_connections_per_torrent
            .saturating_sub(torrent.peers.len() + inflight);
        let hash = torrent.info_hash.handshake_bytes();
        while budget > 0 {
            let Some(candidate) = torrent.candidates.pop() else {
                break;
            };
            if self.filter.is_blocked(&candidate.addr.ip()) {
                debug!(peer = %candidate.addr, "dropping filtered candidate");
                self.events.emit(SessionEvent::PeerBlocked {
                    addr: candidate.addr,
                    reason: DisconnectReason::IpFiltered.as_str().to_string(),
                });
                continue;
            }
            if torrent.peer_index(&candidate.addr).is_some() {
                continue;
            }
            budget -= 1;
            self.dialing.insert((id, candidate.addr));
            let net = self.net_tx.clone();
            let peer_id = self.peer_id;
            let policy = self.config.encryption;
            let origin = candidate.origin;
            let addr = candidate.addr;
            tokio::spawn(async move {
                match PeerConnection::connect(addr, hash, peer_id, policy).await {
                    Ok(conn) => {
                        let _ = net.send(NetEvent::Ready { torrent: id, origin, conn });
                    }
                    Err(e) => {
                        let _ = net.send(NetEvent::DialFailed {
                            torrent: id,
                            addr,
                            reason: e.to_string(),
                        });
                    }
                }
            });
        }
    }

    /// Launch a background hash re-check of the on-disk payload
    fn spawn_recheck(&mut self, id: u64) {
        let Some(torrent) = self.torrents.get_mut(&id) else {
            return;
        };
        let Some(meta) = torrent.meta() else {
            return;
        };
        let digests = meta.digests.clone();
        // A suspect record's bitfield cannot be trusted
        if let Some(store) = torrent.store_mut() {
            store.reset_all();
        }
        torrent.set_state(TorrentState::Checking, Instant::now());
        let generation = torrent.generation;
        let Some(backend) = self.backends.get(&id).cloned() else {
            return;
        };
        let io = self.io_tx.clone();
        info!(id, pieces = digests.len(), "starting re-check");
        tokio::spawn(async move {
            let mut verified = Vec::new();
            for (piece, digest) in digests.iter().enumerate() {
                if let Ok(data) = backend.read_piece(piece as u32).await {
                    if digest.matches(&data) {
                        verified.push(piece as u32);
                    }
                }
            }
            let _ = io.send(IoEvent::CheckDone {
                torrent: id,
                generation,
                verified,
            });
        });
    }

    fn disconnect_peer(&mut self, id: u64, addr: SocketAddr, reason: DisconnectReason) {
        // Dropping the link ends the write pump, which shuts the
        // socket down
        self.links.remove(&(id, addr));
        if let Some(torrent) = self.torrents.get_mut(&id) {
            torrent.remove_peer(&addr, reason);
        }
    }

    fn disconnect_all(&mut self, id: u64, reason: DisconnectReason) {
        let addrs: Vec<SocketAddr> = self
            .torrents
            .get(&id)
            .map(|t| t.peers.iter().map(|p| p.addr).collect())
            .unwrap_or_default();
        for addr in addrs {
            self.disconnect_peer(id, addr, reason);
        }
    }

    /// Mark a torrent failed; its peers disconnect, others keep going
    fn fail_torrent(&mut self, id: u64, reason: String) {
        error!(id, reason = %reason, "torrent failed");
        self.disconnect_all(id, DisconnectReason::Io);
        if let Some(torrent) = self.torrents.get_mut(&id) {
            torrent.error = Some(reason.clone());
            torrent.set_state(TorrentState::Error, Instant::now());
        }
        self.events.emit(SessionEvent::TorrentErrored { id, reason });
        self.dirty.insert(id);
    }

    async fn shutdown_cleanly(&mut self) {
        info!("session shutting down");
        let ids: Vec<u64> = self.torrents.keys().copied().collect();
        for id in &ids {
            self.dirty.insert(*id);
        }
        self.resume_tick().await;
        for id in ids {
            if let Some(torrent) = self.torrents.get(&id) {
                self.spawn_stopped_announces(torrent);
            }
            self.disconnect_all(id, DisconnectReason::SessionShutdown);
        }
    }
}

/// Build announce parameters from a torrent's counters
fn announce_params(
    torrent: &Torrent,
    event: AnnounceEvent,
    port: u16,
    peer_id: [u8; 20],
) -> AnnounceParams {
    AnnounceParams {
        info_hash: torrent.info_hash,
        peer_id,
        port,
        uploaded: torrent.uploaded,
        downloaded: torrent.downloaded,
        left: torrent.left(),
        event,
        numwant: NUMWANT,
    }
}

/// Copy a torrent's files to a new root, removing the originals
async fn relocate(layout: &FileLayout, source: &Path, destination: &Path) -> Result<()> {
    for file in layout.files() {
        let from = source.join(&file.path);
        let to = destination.join(&file.path);
        if let Some(parent) = to.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        match tokio::fs::copy(&from, &to).await {
            Ok(_) => {
                let _ = tokio::fs::remove_file(&from).await;
            }
            // Not-yet-allocated files have nothing to carry over
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(EngineError::disk_full(
                    "move failed",
                    from.display().to_string(),
                    e.to_string(),
                )
                .into())
            }
        }
    }
    Ok(())
}

/// Run a peer's socket as two tasks: one draining the outbound
/// channel, one feeding decoded messages back to the session. Rate
/// limits apply to piece payloads in both directions.
fn spawn_peer_pumps(
    conn: PeerConnection,
    torrent: u64,
    net: mpsc::UnboundedSender<NetEvent>,
    mut outbound: mpsc::UnboundedReceiver<Message>,
    limits: PumpLimits,
) {
    let addr = conn.addr;
    let (mut reader, mut writer) = conn.into_split();

    let up = limits.up;
    tokio::spawn(async move {
        while let Some(message) = outbound.recv().await {
            if let Message::Piece { data, .. } = &message {
                for limiter in &up {
                    limiter.acquire(data.len() as u64).await;
                }
            }
            if writer.send(&message).await.is_err() {
                break;
            }
        }
        writer.shutdown().await;
    });

    let down = limits.down;
    tokio::spawn(async move {
        loop {
            match reader.receive().await {
                Ok(message) => {
                    if let Message::Piece { data, .. } = &message {
                        for limiter in &down {
                            limiter.acquire(data.len() as u64).await;
                        }
                    }
                    if net
                        .send(NetEvent::Inbound {
                            torrent,
                            addr,
                            message,
                        })
                        .is_err()
                    {
                        break;
                    }
                }
                Err(e) => {
                    let reason = DisconnectReason::classify(&e);
                    let _ = net.send(NetEvent::Closed {
                        torrent,
                        addr,
                        reason,
                    });
                    break;
                }
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::piece::BLOCK_SIZE;
    use crate::torrent::metadata::single_file_meta;
    use crate::tracker::{AnnounceResponse, TrackerStatus};

    fn test_config(name: &str) -> SessionConfig {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
        let base = std::env::temp_dir().join(format!("riptide_session_{}", name));
        SessionConfig {
            resume_dir: base.join("resume"),
            ..SessionConfig::default()
        }
    }

    fn save_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("riptide_session_{}", name)).join("data")
    }

    async fn clean(name: &str) {
        let base = std::env::temp_dir().join(format!("riptide_session_{}", name));
        let _ = tokio::fs::remove_dir_all(&base).await;
    }

    fn meta_with_hash(pieces: usize, hash: u8) -> (TorrentMeta, Vec<u8>) {
        let payload: Vec<u8> = (0..pieces * BLOCK_SIZE as usize)
            .map(|i| (i % 251) as u8)
            .collect();
        let mut meta = single_file_meta(BLOCK_SIZE, &payload);
        meta.info_hash = InfoHash::V1([hash; 20]);
        (meta, payload)
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<SessionEvent>) -> Vec<SessionEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[test]
    fn test_new_rejects_invalid_config() {
        let config = SessionConfig {
            listen_port: 0,
            ..SessionConfig::default()
        };
        assert!(Session::new(config).is_err());
    }

    #[tokio::test]
    async fn test_add_torrent_allocates_and_emits_event() {
        clean("add").await;
        let (mut session, mut rx) = Session::new(test_config("add")).unwrap();
        let (meta, payload) = meta_with_hash(2, 0x11);

        let id = session.add_torrent(meta, save_path("add")).await.unwrap();
        assert_eq!(session.torrent_stats(id).unwrap().state, TorrentState::Downloading);

        let events = drain(&mut rx);
        assert!(matches!(events[0], SessionEvent::TorrentAdded { .. }));

        // Fresh add pre-allocates the payload at full length
        let torrent = session.torrents.get(&id).unwrap();
        let sizes = torrent
            .layout()
            .unwrap()
            .probe_sizes(&torrent.save_path)
            .await;
        assert_eq!(sizes, vec![Some(payload.len() as u64)]);
        clean("add").await;
    }

    #[tokio::test]
    async fn test_duplicate_add_rejected() {
        clean("dup").await;
        let (mut session, _rx) = Session::new(test_config("dup")).unwrap();
        let (meta, _) = meta_with_hash(1, 0x22);
        session.add_torrent(meta.clone(), save_path("dup")).await.unwrap();
        assert!(session.add_torrent(meta, save_path("dup")).await.is_err());
        clean("dup").await;
    }

    #[tokio::test]
    async fn test_magnet_then_metadata() {
        clean("magnet").await;
        let (mut session, _rx) = Session::new(test_config("magnet")).unwrap();
        let (meta, _) = meta_with_hash(2, 0x33);

        let id = session
            .add_magnet(MagnetTarget::new(meta.info_hash), save_path("magnet"))
            .unwrap();
        assert!(!session.torrents.get(&id).unwrap().has_metadata());

        session.set_metadata(id, meta).await.unwrap();
        assert!(session.torrents.get(&id).unwrap().has_metadata());
        assert!(session.backends.contains_key(&id));
        clean("magnet").await;
    }

    #[tokio::test]
    async fn test_pause_and_resume() {
        clean("pause").await;
        let (mut session, _rx) = Session::new(test_config("pause")).unwrap();
        let (meta, _) = meta_with_hash(1, 0x44);
        let id = session.add_torrent(meta, save_path("pause")).await.unwrap();

        session.pause(id).unwrap();
        assert_eq!(session.torrent_stats(id).unwrap().state, TorrentState::Paused);

        session.resume_torrent(id).unwrap();
        assert_eq!(
            session.torrent_stats(id).unwrap().state,
            TorrentState::Downloading
        );
        clean("pause").await;
    }

    #[tokio::test]
    async fn test_resume_round_trip_across_sessions() {
        clean("roundtrip").await;
        let (meta, _) = meta_with_hash(4, 0x55);
        {
            let (mut session, _rx) = Session::new(test_config("roundtrip")).unwrap();
            let id = session
                .add_torrent(meta.clone(), save_path("roundtrip"))
                .await
                .unwrap();
            let torrent = session.torrents.get_mut(&id).unwrap();
            torrent.store_mut().unwrap().set_have(1);
            torrent.store_mut().unwrap().set_have(3);
            session.dirty.insert(id);
            session.resume_tick().await;
        }

        let (mut session, _rx) = Session::new(test_config("roundtrip")).unwrap();
        let id = session.add_torrent(meta, save_path("roundtrip")).await.unwrap();
        let store = session.torrents.get(&id).unwrap().store().unwrap();
        assert!(store.has_piece(1) && store.has_piece(3));
        assert!(!store.has_piece(0) && !store.has_piece(2));
        assert_eq!(
            session.torrent_stats(id).unwrap().state,
            TorrentState::Downloading
        );
        clean("roundtrip").await;
    }

    #[tokio::test]
    async fn test_remove_deletes_resume_record() {
        clean("remove").await;
        let (mut session, _rx) = Session::new(test_config("remove")).unwrap();
        let (meta, _) = meta_with_hash(1, 0x66);
        let hash = meta.info_hash;
        let id = session.add_torrent(meta, save_path("remove")).await.unwrap();
        session.resume_tick().await;

        session.remove(id, false).await.unwrap();
        assert!(session.torrents.is_empty());
        assert!(matches!(
            session.resume.load(&hash).await,
            ResumeOutcome::Missing
        ));
        clean("remove").await;
    }

    #[tokio::test]
    async fn test_queueing_caps_active_torrents() {
        clean("queue").await;
        let mut config = test_config("queue");
        config.queue = QueueSettings {
            enabled: true,
            max_active_downloads: 2,
            max_active_uploads: 2,
            max_active_torrents: 2,
            exclude_inactive: false,
            inactivity_threshold: 1024,
        };
        let (mut session, _rx) = Session::new(config).unwrap();
        for i in 0..5u8 {
            let (meta, _) = meta_with_hash(1, 0x70 + i);
            session.add_torrent(meta, save_path("queue")).await.unwrap();
        }

        // The cap holds across repeated evaluations
        for _ in 0..3 {
            session.queue_tick(Instant::now());
            let active = session
                .all_stats()
                .iter()
                .filter(|s| s.state.is_active())
                .count();
            let queued = session
                .all_stats()
                .iter()
                .filter(|s| s.state == TorrentState::Queued)
                .count();
            assert_eq!(active, 2);
            assert_eq!(queued, 3);
        }
        clean("queue").await;
    }

    #[tokio::test]
    async fn test_filtered_candidate_blocked_at_dial() {
        clean("filter").await;
        let (mut session, mut rx) = Session::new(test_config("filter")).unwrap();
        let warnings = session.load_ip_filter("10.0.0.0 - 10.0.0.255\n");
        assert!(warnings.is_empty());
        let (meta, _) = meta_with_hash(1, 0x80);
        let id = session.add_torrent(meta, save_path("filter")).await.unwrap();
        drain(&mut rx);

        session
            .add_candidates(id, vec!["10.0.0.9:6881".parse().unwrap()], PeerOrigin::Dht)
            .unwrap();
        session.dial_candidates(id);

        let events = drain(&mut rx);
        assert!(events
            .iter()
            .any(|e| matches!(e, SessionEvent::PeerBlocked { .. })));
        assert!(session.dialing.is_empty());
        clean("filter").await;
    }

    #[tokio::test]
    async fn test_disk_error_pauses_only_affected_torrent() {
        clean("diskerr").await;
        let (mut session, mut rx) = Session::new(test_config("diskerr")).unwrap();
        let (meta_a, _) = meta_with_hash(1, 0x91);
        let (meta_b, _) = meta_with_hash(1, 0x92);
        let a = session.add_torrent(meta_a, save_path("diskerr")).await.unwrap();
        let b = session.add_torrent(meta_b, save_path("diskerr")).await.unwrap();
        drain(&mut rx);

        let generation = session.torrents.get(&a).unwrap().generation;
        session.apply_disk_result(DiskJobResult {
            torrent: a,
            generation,
            piece: 0,
            result: Err("permission denied".to_string()),
        });

        assert_eq!(session.torrent_stats(a).unwrap().state, TorrentState::Paused);
        assert!(session.torrent_stats(a).unwrap().error.is_some());
        // Fault isolation: the other torrent keeps going
        assert_eq!(
            session.torrent_stats(b).unwrap().state,
            TorrentState::Downloading
        );
        let events = drain(&mut rx);
        assert!(events
            .iter()
            .any(|e| matches!(e, SessionEvent::TorrentErrored { id, .. } if *id == a)));
        clean("diskerr").await;
    }

    #[tokio::test]
    async fn test_stale_disk_result_is_dropped() {
        clean("stale").await;
        let (mut session, mut rx) = Session::new(test_config("stale")).unwrap();
        let (meta, _) = meta_with_hash(1, 0xA1);
        let id = session.add_torrent(meta, save_path("stale")).await.unwrap();
        drain(&mut rx);

        let stale_generation = session.torrents.get(&id).unwrap().generation;
        session.torrents.get_mut(&id).unwrap().generation += 1;
        session.apply_disk_result(DiskJobResult {
            torrent: id,
            generation: stale_generation,
            piece: 0,
            result: Err("late failure".to_string()),
        });

        assert_eq!(
            session.torrent_stats(id).unwrap().state,
            TorrentState::Downloading
        );
        assert!(drain(&mut rx).is_empty());
        clean("stale").await;
    }

    #[tokio::test]
    async fn test_announce_result_feeds_candidates_and_status() {
        clean("announce").await;
        let (mut session, mut rx) = Session::new(test_config("announce")).unwrap();
        let (mut meta, _) = meta_with_hash(1, 0xB1);
        meta.trackers = vec![vec!["http://t.example/announce".to_string()]];
        let id = session.add_torrent(meta, save_path("announce")).await.unwrap();
        drain(&mut rx);

        let response = AnnounceResponse {
            interval: Some(Duration::from_secs(1800)),
            peers: vec!["10.1.1.1:6881".parse().unwrap()],
            ..AnnounceResponse::default()
        };
        session.handle_io(
            IoEvent::AnnounceDone {
                torrent: id,
                tracker: 0,
                result: Ok(response),
            },
            Instant::now(),
        );

        let torrent = session.torrents.get(&id).unwrap();
        assert_eq!(torrent.trackers.get(0).unwrap().status, TrackerStatus::Working);
        assert_eq!(torrent.candidates.pending(), 1);
        let events = drain(&mut rx);
        assert!(events.iter().any(|e| matches!(
            e,
            SessionEvent::TrackerStatusChanged { status: TrackerStatus::Working, .. }
        )));
        clean("announce").await;
    }

    #[tokio::test]
    async fn test_tracker_failures_back_off_through_session() {
        clean("backoff").await;
        let (mut session, _rx) = Session::new(test_config("backoff")).unwrap();
        let (mut meta, _) = meta_with_hash(1, 0xC1);
        meta.trackers = vec![vec!["http://t.example/announce".to_string()]];
        let id = session.add_torrent(meta, save_path("backoff")).await.unwrap();

        let mut last = Duration::ZERO;
        for _ in 0..3 {
            session.handle_io(
                IoEvent::AnnounceDone {
                    torrent: id,
                    tracker: 0,
                    result: Err("unreachable".to_string()),
                },
                Instant::now(),
            );
            let interval = session
                .torrents
                .get(&id)
                .unwrap()
                .trackers
                .get(0)
                .unwrap()
                .next_interval;
            assert!(interval > last);
            last = interval;
        }
        clean("backoff").await;
    }

    #[tokio::test]
    async fn test_corrupt_resume_record_triggers_recheck() {
        clean("recheck").await;
        let config = test_config("recheck");
        tokio::fs::create_dir_all(&config.resume_dir).await.unwrap();
        let (meta, _) = meta_with_hash(1, 0xE1);
        tokio::fs::write(
            config
                .resume_dir
                .join(format!("{}.resume", meta.info_hash.to_hex())),
            b"{corrupt",
        )
        .await
        .unwrap();

        let (mut session, _rx) = Session::new(config).unwrap();
        let id = session.add_torrent(meta, save_path("recheck")).await.unwrap();
        assert_eq!(
            session.torrent_stats(id).unwrap().state,
            TorrentState::Checking
        );
        clean("recheck").await;
    }

    #[tokio::test]
    async fn test_share_ratio_breach_pauses_via_maintenance() {
        clean("ratio").await;
        let mut config = test_config("ratio");
        config.share_ratio_limit = Some(2.0);
        let (mut session, _rx) = Session::new(config).unwrap();
        let (meta, _) = meta_with_hash(1, 0xD1);
        let id = session.add_torrent(meta, save_path("ratio")).await.unwrap();

        let now = Instant::now();
        {
            let torrent = session.torrents.get_mut(&id).unwrap();
            torrent.set_state(TorrentState::Seeding, now);
            torrent.downloaded = 1000;
            torrent.uploaded = 2000;
        }
        session.maintenance_tick(now).await;
        assert_eq!(session.torrent_stats(id).unwrap().state, TorrentState::Paused);

        // Later ticks leave the paused torrent alone
        session.maintenance_tick(now).await;
        assert_eq!(session.torrent_stats(id).unwrap().state, TorrentState::Paused);
        clean("ratio").await;
    }
}
