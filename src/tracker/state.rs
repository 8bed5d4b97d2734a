//! Per-tracker announce state machine
//!
//! `NotContacted → Announcing → {Working, NotWorking}` and back to
//! `Announcing` on the next interval or a forced re-announce. The
//! tracker-supplied interval is bounded below by a local minimum;
//! failures back off by doubling up to a cap.

use std::time::Duration;

use tracing::{debug, warn};

/// Announce state of one tracker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TrackerStatus {
    #[default]
    NotContacted,
    Announcing,
    Working,
    NotWorking,
}

/// Reason attached to an announce
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnnounceEvent {
    Started,
    Completed,
    Stopped,
    Periodic,
}

impl AnnounceEvent {
    /// Wire value for the `event` query parameter
    pub fn query_value(&self) -> Option<&'static str> {
        match self {
            AnnounceEvent::Started => Some("started"),
            AnnounceEvent::Completed => Some("completed"),
            AnnounceEvent::Stopped => Some("stopped"),
            AnnounceEvent::Periodic => None,
        }
    }
}

/// One announce endpoint within a tier
#[derive(Debug, Clone)]
pub struct Tracker {
    /// Announce URL
    pub url: String,
    /// Tier index, lower announces first
    pub tier: usize,
    pub status: TrackerStatus,
    /// Consecutive failed announces
    pub failures: u32,
    /// Status string from the last failure
    pub last_error: Option<String>,
    /// Wait before the next announce
    pub next_interval: Duration,
    min_interval: Duration,
    backoff_cap: Duration,
}

impl Tracker {
    /// Track a new announce endpoint; a fresh tracker is due at once
    pub fn new(url: String, tier: usize, min_interval: Duration, backoff_cap: Duration) -> Self {
        Self {
            url,
            tier,
            status: TrackerStatus::NotContacted,
            failures: 0,
            last_error: None,
            next_interval: Duration::ZERO,
            min_interval,
            backoff_cap,
        }
    }

    /// Mark an announce in flight
    pub fn begin_announce(&mut self) {
        self.status = TrackerStatus::Announcing;
    }

    /// Record a successful announce and schedule the next one
    ///
    /// The tracker's interval wins but never undercuts the local
    /// minimum, to avoid hammering trackers that misreport.
    pub fn on_success(&mut self, interval: Option<Duration>) {
        self.status = TrackerStatus::Working;
        self.failures = 0;
        self.last_error = None;
        self.next_interval = interval
            .unwrap_or(Duration::from_secs(1800))
            .max(self.min_interval);
        debug!(url = %self.url, interval = ?self.next_interval, "announce ok");
    }

    /// Record a failed announce and back off
    pub fn on_failure(&mut self, reason: impl Into<String>) {
        let reason = reason.into();
        self.status = TrackerStatus::NotWorking;
        self.failures = self.failures.saturating_add(1);
        let shift = self.failures.min(16);
        let backoff = self
            .min_interval
            .saturating_mul(1u32 << shift.min(31))
            .min(self.backoff_cap);
        self.next_interval = backoff;
        warn!(url = %self.url, failures = self.failures, reason = %reason, "announce failed");
        self.last_error = Some(reason);
    }

    /// Schedule an immediate re-announce without touching status
    pub fn force(&mut self) {
        self.next_interval = Duration::ZERO;
    }

    /// True once the tracker has responded at least once
    pub fn is_working(&self) -> bool {
        self.status == TrackerStatus::Working
    }
}
