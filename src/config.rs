//! Engine configuration
//!
//! Every policy knob the session honors: rate limits, queueing caps,
//! choking cadence, tracker fan-out, encryption policy. Cadences are
//! configuration rather than constants; the defaults follow common
//! client practice.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;

use crate::choker::{ChokerConfig, ChokingPolicy};
use crate::error::EngineError;
use crate::protocol::EncryptionPolicy;
use crate::session::queue::QueueSettings;
use crate::torrent::state::LimitAction;

/// Session-wide configuration
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// TCP port for incoming peer connections
    pub listen_port: u16,
    /// Connection ceiling per torrent
    pub max_connections_per_torrent: usize,
    /// Outstanding-request ceiling per peer
    pub pipeline_depth: usize,
    /// Disconnect a peer that delivers nothing for this long
    pub request_timeout: Duration,
    /// Mark a peer snubbed after this long without progress
    pub snub_threshold: Duration,
    /// Hash failures tolerated per peer before disconnecting
    pub hash_failure_threshold: u32,

    /// Choke re-evaluation cadence
    pub choke_interval: Duration,
    /// Optimistic-unchoke rotation cadence
    pub optimistic_interval: Duration,
    pub choking_policy: ChokingPolicy,
    /// Regular upload slots
    pub upload_slots: usize,

    /// Global download limit, bytes/s
    pub download_limit: Option<u64>,
    /// Global upload limit, bytes/s
    pub upload_limit: Option<u64>,

    /// Queueing / admission control
    pub queue: QueueSettings,

    /// Stop seeding at this share ratio
    pub share_ratio_limit: Option<f64>,
    /// Stop seeding after this long
    pub seeding_time_limit: Option<Duration>,
    /// What a limit breach does to the torrent
    pub limit_action: LimitAction,

    pub encryption: EncryptionPolicy,

    /// Local floor under tracker-supplied intervals
    pub announce_min_interval: Duration,
    /// Ceiling for failure backoff
    pub announce_backoff_cap: Duration,
    pub announce_to_all_trackers: bool,
    pub announce_to_all_tiers: bool,

    /// Periodic resume-save cadence
    pub resume_interval: Duration,
    /// Directory holding resume records
    pub resume_dir: PathBuf,

    /// Concurrent disk writes
    pub max_disk_jobs: usize,
    /// Boost the first and last piece of every file
    pub first_last_piece_first: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            listen_port: 6881,
            max_connections_per_torrent: 50,
            pipeline_depth: 16,
            request_timeout: Duration::from_secs(60),
            snub_threshold: Duration::from_secs(60),
            hash_failure_threshold: 3,
            choke_interval: Duration::from_secs(10),
            optimistic_interval: Duration::from_secs(30),
            choking_policy: ChokingPolicy::FixedSlots,
            upload_slots: 4,
            download_limit: None,
            upload_limit: None,
            queue: QueueSettings::default(),
            share_ratio_limit: None,
            seeding_time_limit: None,
            limit_action: LimitAction::Pause,
            encryption: EncryptionPolicy::EnabledIfSupported,
            announce_min_interval: Duration::from_secs(60),
            announce_backoff_cap: Duration::from_secs(3600),
            announce_to_all_trackers: false,
            announce_to_all_tiers: false,
            resume_interval: Duration::from_secs(60),
            resume_dir: PathBuf::from(".resume"),
            max_disk_jobs: 4,
            first_last_piece_first: false,
        }
    }
}

impl SessionConfig {
    /// Reject configurations the engine cannot honor
    pub fn validate(&self) -> Result<()> {
        if self.listen_port == 0 {
            return Err(EngineError::config_with_field("port cannot be 0", "listen_port").into());
        }
        if self.max_connections_per_torrent == 0 {
            return Err(EngineError::config_with_field(
                "must allow at least one connection",
                "max_connections_per_torrent",
            )
            .into());
        }
        if !(4..=250).contains(&self.pipeline_depth) {
            return Err(EngineError::config_with_field(
                "pipeline depth must be within 4..=250",
                "pipeline_depth",
            )
            .into());
        }
        if self.upload_slots == 0 {
            return Err(
                EngineError::config_with_field("need at least one slot", "upload_slots").into(),
            );
        }
        if let Some(ratio) = self.share_ratio_limit {
            if ratio < 0.0 || !ratio.is_finite() {
                return Err(EngineError::config_with_field(
                    "ratio must be a non-negative number",
                    "share_ratio_limit",
                )
                .into());
            }
        }
        if self.queue.enabled
            && (self.queue.max_active_torrents == 0
                || self.queue.max_active_downloads == 0
                || self.queue.max_active_uploads == 0)
        {
            return Err(EngineError::config_with_field(
                "queueing caps must be at least 1",
                "queue",
            )
            .into());
        }
        if self.announce_min_interval > self.announce_backoff_cap {
            return Err(EngineError::config_with_field(
                "minimum interval exceeds backoff cap",
                "announce_min_interval",
            )
            .into());
        }
        if self.resume_dir.as_os_str().is_empty() {
            return Err(
                EngineError::config_with_field("resume dir cannot be empty", "resume_dir").into(),
            );
        }
        Ok(())
    }

    /// Choker tunables derived from the session knobs
    pub fn choker(&self) -> ChokerConfig {
        ChokerConfig {
            policy: self.choking_policy,
            slots: self.upload_slots,
            ..ChokerConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        assert!(SessionConfig::default().validate().is_ok());
    }

    #[test]
    fn test_zero_port_rejected() {
        let config = SessionConfig {
            listen_port: 0,
            ..SessionConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_pipeline_depth_bounds() {
        for depth in [3usize, 251] {
            let config = SessionConfig {
                pipeline_depth: depth,
                ..SessionConfig::default()
            };
            assert!(config.validate().is_err(), "depth {} should fail", depth);
        }
        let config = SessionConfig {
            pipeline_depth: 250,
            ..SessionConfig::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_negative_ratio_rejected() {
        let config = SessionConfig {
            share_ratio_limit: Some(-1.0),
            ..SessionConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_queueing_caps_checked_only_when_enabled() {
        let mut config = SessionConfig::default();
        config.queue.max_active_torrents = 0;
        assert!(config.validate().is_ok());

        config.queue.enabled = true;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_choker_config_inherits_policy() {
        let config = SessionConfig {
            choking_policy: ChokingPolicy::AntiLeech,
            upload_slots: 7,
            ..SessionConfig::default()
        };
        let choker = config.choker();
        assert_eq!(choker.policy, ChokingPolicy::AntiLeech);
        assert_eq!(choker.slots, 7);
    }
}
