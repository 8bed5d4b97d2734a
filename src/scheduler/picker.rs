//! Block picker
//!
//! Rarest-first selection among pieces we lack that connected peers
//! advertise, ties broken by lowest index. Priority weight (which
//! already folds in the first/last-piece boost) outranks rarity, and
//! partially-downloaded pieces are finished before new ones are
//! started. Sequential mode replaces rarity with strict index order.
//! Near completion the picker enters endgame and duplicates the
//! remaining in-flight blocks across idle peers.

use std::collections::{HashMap, HashSet};

use tracing::{debug, trace};

use crate::peer::Peer;
use crate::piece::{BlockRef, PieceStore};

/// New requests a snubbed peer may receive per scheduling round
const SNUBBED_BUDGET: usize = 1;

/// Per-torrent block picker
#[derive(Debug, Default)]
pub struct BlockScheduler {
    /// Strict index-order mode (streaming)
    pub sequential: bool,
    endgame: bool,
}

/// True when the peer advertises at least one piece we still want;
/// drives our interested flag
pub fn peer_useful(store: &PieceStore, peer: &Peer) -> bool {
    (0..store.piece_count() as u32).any(|i| {
        !store.has_piece(i) && store.priority(i).is_some() && peer.has_piece(i)
    })
}

impl BlockScheduler {
    pub fn new(sequential: bool) -> Self {
        Self {
            sequential,
            endgame: false,
        }
    }

    /// True once the picker has switched to duplicate-request mode
    pub fn endgame(&self) -> bool {
        self.endgame
    }

    /// Count how many connected peers advertise each piece
    pub fn availability(store: &PieceStore, peers: &[Peer]) -> Vec<u32> {
        let mut counts = vec![0u32; store.piece_count()];
        for peer in peers {
            for piece in peer.have.iter_set() {
                counts[piece] += 1;
            }
        }
        counts
    }

    /// Compute new block requests for every peer with spare pipeline
    ///
    /// Returns `(peer_index, block)` pairs; the caller records each
    /// request on the peer and queues the wire message.
    pub fn assign(
        &mut self,
        store: &PieceStore,
        peers: &[Peer],
        pipeline_depth: usize,
    ) -> Vec<(usize, BlockRef)> {
        let availability = Self::availability(store, peers);

        // Pieces still worth fetching, in request order
        let mut wanted: Vec<(u32, u8)> = (0..store.piece_count() as u32)
            .filter_map(|i| {
                if store.has_piece(i) || availability[i as usize] == 0 {
                    return None;
                }
                store.priority(i).map(|weight| (i, weight))
            })
            .collect();
        if self.sequential {
            wanted.sort_by_key(|&(piece, weight)| (std::cmp::Reverse(weight), piece));
        } else {
            wanted.sort_by_key(|&(piece, weight)| {
                (
                    std::cmp::Reverse(weight),
                    !store.in_progress(piece),
                    availability[piece as usize],
                    piece,
                )
            });
        }

        // Everything currently in flight, with per-peer ownership
        let mut in_flight: HashMap<BlockRef, Vec<usize>> = HashMap::new();
        for (idx, peer) in peers.iter().enumerate() {
            for block in peer.outstanding_blocks() {
                in_flight.entry(block).or_default().push(idx);
            }
        }

        // Endgame when every missing block of every wanted piece is
        // already requested somewhere
        let mut open_blocks = 0usize;
        for &(piece, _) in &wanted {
            for block in store.missing_blocks(piece) {
                if !in_flight.contains_key(&block) {
                    open_blocks += 1;
                }
            }
        }
        if wanted.is_empty() {
            self.endgame = false;
        } else if open_blocks == 0 && !self.endgame {
            debug!("entering endgame: all remaining blocks in flight");
            self.endgame = true;
        }

        let mut assigned: Vec<(usize, BlockRef)> = Vec::new();
        let mut claimed: HashSet<BlockRef> = HashSet::new();

        // Responsive peers first; snubbed peers keep a trickle so they
        // can prove themselves again
        let mut order: Vec<usize> = (0..peers.len()).collect();
        order.sort_by_key(|&i| peers[i].snubbed);

        for idx in order {
            let peer = &peers[idx];
            if !peer.can_request() {
                continue;
            }
            let budget = if peer.snubbed {
                SNUBBED_BUDGET.min(pipeline_depth.saturating_sub(peer.outstanding()))
            } else {
                pipeline_depth.saturating_sub(peer.outstanding())
            };
            if budget == 0 {
                continue;
            }
            let mut granted = 0usize;

            'pieces: for &(piece, _) in &wanted {
                if !peer.has_piece(piece) {
                    continue;
                }
                for block in store.missing_blocks(piece) {
                    if granted >= budget {
                        break 'pieces;
                    }
                    if peer.has_request(&block) || claimed.contains(&block) {
                        continue;
                    }
                    let holders = in_flight.get(&block);
                    let duplicate = holders.is_some_and(|h| !h.is_empty());
                    if duplicate && !self.endgame {
                        continue;
                    }
                    if duplicate && holders.is_some_and(|h| h.contains(&idx)) {
                        continue;
                    }
                    assigned.push((idx, block));
                    claimed.insert(block);
                    granted += 1;
                }
            }
            if granted > 0 {
                trace!(peer = %peer.addr, granted, "scheduled requests");
            }
        }

        assigned
    }

    /// Peers that should be sent a cancel for `block` once any peer
    /// delivered it; endgame cleanup
    pub fn redundant_holders(peers: &[Peer], block: &BlockRef, source: usize) -> Vec<usize> {
        peers
            .iter()
            .enumerate()
            .filter(|(idx, peer)| *idx != source && peer.has_request(block))
            .map(|(idx, _)| idx)
            .collect()
    }
}
