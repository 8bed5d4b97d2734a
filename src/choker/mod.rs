//! Choking engine
//!
//! Runs on a fixed interval and decides which interested peers get
//! upload slots. One slot is always reserved for the optimistic
//! unchoke: a randomly chosen choked-but-interested peer, rotated
//! periodically so better partners can be discovered. Connections
//! never choke or unchoke on their own; every transition originates
//! here.

use std::net::SocketAddr;

use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::peer::{ConnectionState, Peer};

/// Upload-slot allocation policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ChokingPolicy {
    /// Top-N peers by transfer rate hold the slots
    #[default]
    FixedSlots,
    /// Slot count scales with achieved upload rate
    RateBased,
    /// Rank by net contribution, penalizing non-reciprocating peers
    AntiLeech,
}

/// Tunables for the choking engine
#[derive(Debug, Clone)]
pub struct ChokerConfig {
    pub policy: ChokingPolicy,
    /// Regular upload slots, excluding the optimistic one
    pub slots: usize,
    /// Rate-based: one slot granted per this many bytes/s uploaded
    pub rate_per_slot: u64,
    /// Rate-based slot ceiling
    pub max_slots: usize,
}

impl Default for ChokerConfig {
    fn default() -> Self {
        Self {
            policy: ChokingPolicy::FixedSlots,
            slots: 4,
            rate_per_slot: 20 * 1024,
            max_slots: 16,
        }
    }
}

/// Transitions to apply after an evaluation, as peer indices
#[derive(Debug, Default, PartialEq, Eq)]
pub struct ChokeDecision {
    pub unchoke: Vec<usize>,
    pub choke: Vec<usize>,
    pub optimistic: Option<usize>,
}

/// Per-torrent choking engine
#[derive(Debug)]
pub struct ChokingEngine {
    config: ChokerConfig,
    /// Address of the current optimistic unchoke
    optimistic: Option<SocketAddr>,
}

impl ChokingEngine {
    pub fn new(config: ChokerConfig) -> Self {
        Self {
            config,
            optimistic: None,
        }
    }

    /// Current optimistic peer, if any
    pub fn optimistic(&self) -> Option<SocketAddr> {
        self.optimistic
    }

    /// Number of regular slots for this evaluation
    fn slot_count(&self, achieved_upload_rate: f64) -> usize {
        match self.config.policy {
            ChokingPolicy::FixedSlots | ChokingPolicy::AntiLeech => self.config.slots,
            ChokingPolicy::RateBased => {
                let earned = (achieved_upload_rate / self.config.rate_per_slot as f64) as usize + 1;
                earned.clamp(1, self.config.max_slots)
            }
        }
    }

    /// Ranking score; higher is better
    fn score(&self, peer: &Peer, seeding: bool) -> f64 {
        if seeding {
            return peer.upload_rate;
        }
        match self.config.policy {
            ChokingPolicy::FixedSlots | ChokingPolicy::RateBased => peer.download_rate,
            // Net contribution: taking without giving back ranks last
            ChokingPolicy::AntiLeech => peer.download_rate - 0.5 * peer.upload_rate,
        }
    }

    /// Rank interested peers and compute slot transitions
    ///
    /// `rotate` is driven by the session's optimistic-unchoke timer.
    /// The unchoked population after applying the decision never
    /// exceeds the slot count plus the optimistic slot.
    pub fn evaluate(
        &mut self,
        peers: &[Peer],
        seeding: bool,
        achieved_upload_rate: f64,
        rotate: bool,
    ) -> ChokeDecision {
        let slots = self.slot_count(achieved_upload_rate);

        let mut candidates: Vec<usize> = peers
            .iter()
            .enumerate()
            .filter(|(_, p)| p.state == ConnectionState::Operational && p.peer_interested)
            .map(|(i, _)| i)
            .collect();
        candidates.sort_by(|&a, &b| {
            self.score(&peers[b], seeding)
                .partial_cmp(&self.score(&peers[a], seeding))
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        let regular: Vec<usize> = candidates.iter().copied().take(slots).collect();

        // Keep or rotate the optimistic slot among the leftovers
        let leftovers: Vec<usize> = candidates
            .iter()
            .copied()
            .filter(|i| !regular.contains(i))
            .collect();
        let current_still_valid = self
            .optimistic
            .map(|addr| leftovers.iter().any(|&i| peers[i].addr == addr))
            .unwrap_or(false);
        let optimistic = if !rotate && current_still_valid {
            self.optimistic
                .and_then(|addr| leftovers.iter().copied().find(|&i| peers[i].addr == addr))
        } else {
            let drawn = leftovers.choose(&mut rand::thread_rng()).copied();
            if let Some(i) = drawn {
                debug!(peer = %peers[i].addr, "optimistic unchoke");
            }
            drawn
        };
        self.optimistic = optimistic.map(|i| peers[i].addr);

        // Diff against current flags
        let mut keep: Vec<usize> = regular.clone();
        if let Some(i) = optimistic {
            keep.push(i);
        }
        let unchoke: Vec<usize> = keep
            .iter()
            .copied()
            .filter(|&i| peers[i].am_choking)
            .collect();
        let choke: Vec<usize> = peers
            .iter()
            .enumerate()
            .filter(|(i, p)| !p.am_choking && !keep.contains(i))
            .map(|(i, _)| i)
            .collect();

        trace!(
            slots,
            unchoked = keep.len(),
            choking = choke.len(),
            "choke evaluation"
        );
        ChokeDecision {
            unchoke,
            choke,
            optimistic,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::PeerOrigin;
    use std::time::Instant;

    fn interested_peer(port: u16, download_rate: f64, upload_rate: f64) -> Peer {
        let mut p = Peer::new(
            format!("127.0.0.1:{}", port).parse().unwrap(),
            PeerOrigin::Tracker,
            4,
            Instant::now(),
        );
        p.state = ConnectionState::Operational;
        p.peer_interested = true;
        p.download_rate = download_rate;
        p.upload_rate = upload_rate;
        p
    }

    fn apply(peers: &mut [Peer], decision: &ChokeDecision) {
        for &i in &decision.unchoke {
            peers[i].am_choking = false;
        }
        for &i in &decision.choke {
            peers[i].am_choking = true;
        }
    }

    #[test]
    fn test_unchoked_never_exceeds_slots_plus_optimistic() {
        let mut peers: Vec<Peer> = (0..20)
            .map(|i| interested_peer(2000 + i, (i as f64) * 100.0, 0.0))
            .collect();
        let mut engine = ChokingEngine::new(ChokerConfig {
            slots: 4,
            ..ChokerConfig::default()
        });

        for round in 0..5 {
            let decision = engine.evaluate(&peers, false, 0.0, round % 2 == 0);
            apply(&mut peers, &decision);
            let unchoked = peers.iter().filter(|p| !p.am_choking).count();
            assert!(unchoked <= 5, "round {}: {} unchoked", round, unchoked);
        }
    }

    #[test]
    fn test_fastest_downloaders_hold_slots() {
        let peers: Vec<Peer> = (0..6)
            .map(|i| interested_peer(2100 + i, (i as f64) * 1000.0, 0.0))
            .collect();
        let mut engine = ChokingEngine::new(ChokerConfig {
            slots: 2,
            ..ChokerConfig::default()
        });

        let decision = engine.evaluate(&peers, false, 0.0, false);
        // The two fastest peers (indices 5 and 4) get the regular slots
        assert!(decision.unchoke.contains(&5));
        assert!(decision.unchoke.contains(&4));
    }

    #[test]
    fn test_seeding_ranks_by_upload_rate() {
        let mut peers = vec![
            interested_peer(2200, 0.0, 100.0),
            interested_peer(2201, 0.0, 9000.0),
        ];
        let mut engine = ChokingEngine::new(ChokerConfig {
            slots: 1,
            ..ChokerConfig::default()
        });
        let decision = engine.evaluate(&peers, true, 0.0, false);
        assert!(decision.unchoke.contains(&1));
        apply(&mut peers, &decision);
        assert!(!peers[1].am_choking);
    }

    #[test]
    fn test_optimistic_drawn_from_leftovers() {
        let peers: Vec<Peer> = (0..8)
            .map(|i| interested_peer(2300 + i, (i as f64) * 1000.0, 0.0))
            .collect();
        let mut engine = ChokingEngine::new(ChokerConfig {
            slots: 4,
            ..ChokerConfig::default()
        });

        let decision = engine.evaluate(&peers, false, 0.0, true);
        let optimistic = decision.optimistic.unwrap();
        // The optimistic peer is never one of the regular slot holders
        assert!(optimistic <= 3, "optimistic {} should be a slow peer", optimistic);
    }

    #[test]
    fn test_optimistic_kept_between_rotations() {
        let peers: Vec<Peer> = (0..8)
            .map(|i| interested_peer(2400 + i, (i as f64) * 1000.0, 0.0))
            .collect();
        let mut engine = ChokingEngine::new(ChokerConfig {
            slots: 4,
            ..ChokerConfig::default()
        });

        let first = engine.evaluate(&peers, false, 0.0, true);
        let held = engine.evaluate(&peers, false, 0.0, false);
        assert_eq!(first.optimistic, held.optimistic);
    }

    #[test]
    fn test_rate_based_slot_scaling() {
        let engine = ChokingEngine::new(ChokerConfig {
            policy: ChokingPolicy::RateBased,
            rate_per_slot: 10_000,
            max_slots: 8,
            ..ChokerConfig::default()
        });
        assert_eq!(engine.slot_count(0.0), 1);
        assert_eq!(engine.slot_count(35_000.0), 4);
        assert_eq!(engine.slot_count(1_000_000.0), 8);
    }

    #[test]
    fn test_anti_leech_penalizes_takers() {
        // Same download rate, but peer 0 takes far more than it gives
        let mut leech = interested_peer(2500, 1000.0, 8000.0);
        let giver = interested_peer(2501, 1000.0, 0.0);
        leech.am_choking = false; // previously held a slot

        let mut engine = ChokingEngine::new(ChokerConfig {
            policy: ChokingPolicy::AntiLeech,
            slots: 1,
            ..ChokerConfig::default()
        });
        let decision = engine.evaluate(&[leech, giver], false, 0.0, false);
        assert!(decision.unchoke.contains(&1));
        // The leech loses its slot unless it drew the optimistic one
        if decision.optimistic != Some(0) {
            assert!(decision.choke.contains(&0));
        }
    }

    #[test]
    fn test_uninterested_peers_never_unchoked() {
        let mut idle = interested_peer(2600, 5000.0, 0.0);
        idle.peer_interested = false;
        let mut engine = ChokingEngine::new(ChokerConfig::default());
        let decision = engine.evaluate(&[idle], false, 0.0, true);
        assert!(decision.unchoke.is_empty());
        assert!(decision.optimistic.is_none());
    }
}
