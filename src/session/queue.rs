//! Torrent queueing
//!
//! Admission control for the session: when enabled, only the top
//! torrents by queue position may transfer, capped separately for
//! downloads, uploads, and overall. Torrents transferring below the
//! inactivity threshold keep running without consuming a slot.

use tracing::trace;

/// Queueing policy knobs
#[derive(Debug, Clone)]
pub struct QueueSettings {
    pub enabled: bool,
    pub max_active_downloads: usize,
    pub max_active_uploads: usize,
    pub max_active_torrents: usize,
    /// Let active torrents below the inactivity threshold run without
    /// consuming a slot
    pub exclude_inactive: bool,
    /// Bytes/s below which an active torrent stops counting
    pub inactivity_threshold: u64,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            max_active_downloads: 3,
            max_active_uploads: 3,
            max_active_torrents: 5,
            exclude_inactive: false,
            inactivity_threshold: 1024,
        }
    }
}

/// One torrent competing for an active slot
#[derive(Debug, Clone)]
pub struct QueueCandidate {
    pub id: u64,
    pub queue_position: u32,
    /// Still fetching pieces (else it would seed)
    pub downloading: bool,
    /// Currently in an active state
    pub active: bool,
    /// Current transfer rate, bytes/s
    pub rate: f64,
}

/// Which torrents run and which wait
#[derive(Debug, Default, PartialEq, Eq)]
pub struct QueueDecision {
    pub activate: Vec<u64>,
    pub queue: Vec<u64>,
}

/// Allocate active slots by queue position
pub fn evaluate(settings: &QueueSettings, candidates: &[QueueCandidate]) -> QueueDecision {
    let mut decision = QueueDecision::default();
    if !settings.enabled {
        decision.activate = candidates.iter().map(|c| c.id).collect();
        return decision;
    }

    let mut ordered: Vec<&QueueCandidate> = candidates.iter().collect();
    ordered.sort_by_key(|c| c.queue_position);

    let mut downloads = 0usize;
    let mut uploads = 0usize;
    let mut total = 0usize;
    for candidate in ordered {
        // Already-active torrents trickling below the threshold are
        // exempt from the caps
        let exempt = settings.exclude_inactive
            && candidate.active
            && candidate.rate < settings.inactivity_threshold as f64;
        if exempt {
            decision.activate.push(candidate.id);
            continue;
        }
        let fits = total < settings.max_active_torrents
            && if candidate.downloading {
                downloads < settings.max_active_downloads
            } else {
                uploads < settings.max_active_uploads
            };
        if fits {
            total += 1;
            if candidate.downloading {
                downloads += 1;
            } else {
                uploads += 1;
            }
            decision.activate.push(candidate.id);
        } else {
            decision.queue.push(candidate.id);
        }
    }
    trace!(
        active = decision.activate.len(),
        queued = decision.queue.len(),
        "queue evaluation"
    );
    decision
}
