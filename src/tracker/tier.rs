//! Tracker tiers
//!
//! Trackers are organized into ordered tiers. Two policy switches
//! control fan-out: announce to every tracker in a tier or only the
//! first reachable one, and announce to every tier or only the first
//! non-empty one.

use std::time::Duration;

use crate::tracker::state::Tracker;

/// All trackers of one torrent, grouped by tier
#[derive(Debug)]
pub struct TrackerSet {
    trackers: Vec<Tracker>,
    /// Announce to every tracker within a tier
    pub announce_to_all_trackers: bool,
    /// Announce to every tier, not just the first non-empty one
    pub announce_to_all_tiers: bool,
}

impl TrackerSet {
    /// Build from tiered announce URLs
    pub fn from_tiers(
        tiers: &[Vec<String>],
        min_interval: Duration,
        backoff_cap: Duration,
        announce_to_all_trackers: bool,
        announce_to_all_tiers: bool,
    ) -> Self {
        let mut trackers = Vec::new();
        for (tier, urls) in tiers.iter().enumerate() {
            for url in urls {
                trackers.push(Tracker::new(url.clone(), tier, min_interval, backoff_cap));
            }
        }
        Self {
            trackers,
            announce_to_all_trackers,
            announce_to_all_tiers,
        }
    }

    /// Number of trackers across all tiers
    pub fn len(&self) -> usize {
        self.trackers.len()
    }

    /// True when the torrent has no trackers (magnet without hints)
    pub fn is_empty(&self) -> bool {
        self.trackers.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Tracker> {
        self.trackers.iter()
    }

    pub fn get(&self, index: usize) -> Option<&Tracker> {
        self.trackers.get(index)
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut Tracker> {
        self.trackers.get_mut(index)
    }

    /// Indices of the trackers the next announce round should target
    ///
    /// Within a tier the working tracker is preferred; a tier with no
    /// working tracker retries its first member.
    pub fn targets(&self) -> Vec<usize> {
        let mut selected = Vec::new();
        let max_tier = self.trackers.iter().map(|t| t.tier).max();
        let Some(max_tier) = max_tier else {
            return selected;
        };

        for tier in 0..=max_tier {
            let members: Vec<usize> = self
                .trackers
                .iter()
                .enumerate()
                .filter(|(_, t)| t.tier == tier)
                .map(|(i, _)| i)
                .collect();
            if members.is_empty() {
                continue;
            }
            if self.announce_to_all_trackers {
                selected.extend(members.iter().copied());
            } else {
                let pick = members
                    .iter()
                    .copied()
                    .find(|&i| self.trackers[i].is_working())
                    .unwrap_or(members[0]);
                selected.push(pick);
            }
            if !self.announce_to_all_tiers {
                break;
            }
        }
        selected
    }

    /// Schedule an immediate re-announce on every tracker
    pub fn force_reannounce(&mut self) {
        for tracker in &mut self.trackers {
            tracker.force();
        }
    }
}
