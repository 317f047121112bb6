//! Per-peer replication progress.
//!
//! The leader drives each follower with a small state machine: `Idle`
//! (ready to send), `InFlight` (one append outstanding; appends to a peer
//! are never pipelined), and `Backoff` (the last send failed at the
//! transport; wait for the next heartbeat tick). Backoff delays grow with
//! consecutive failures but are capped at the heartbeat interval, so a
//! recovering peer is retried within one tick.

use std::collections::BTreeMap;

use copycat_core::{LogIndex, MemberId};
use tracing::debug;

/// Send state for one peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    /// Ready for the next append.
    Idle,
    /// An append RPC is outstanding.
    InFlight,
    /// The last send failed; retry on the next heartbeat tick.
    Backoff {
        /// Consecutive transport failures.
        failures: u32,
    },
}

/// Replication progress for one peer.
#[derive(Debug, Clone, Copy)]
pub struct PeerProgress {
    /// Index of the next entry to send.
    pub next_index: LogIndex,
    /// Highest index known replicated on the peer.
    pub match_index: LogIndex,
    /// Current send state.
    pub state: PeerState,
}

/// Tracks replication progress across all peers.
#[derive(Debug, Default)]
pub struct Replicator {
    peers: BTreeMap<MemberId, PeerProgress>,
}

impl Replicator {
    /// Initializes progress for the given peers, with `next_index` set to
    /// the leader's next log index and `match_index` to zero.
    #[must_use]
    pub fn new(peers: &[MemberId], next_index: LogIndex) -> Self {
        let peers = peers
            .iter()
            .map(|&id| {
                (
                    id,
                    PeerProgress {
                        next_index,
                        match_index: LogIndex::new(0),
                        state: PeerState::Idle,
                    },
                )
            })
            .collect();
        Self { peers }
    }

    /// Returns the progress for a peer.
    #[must_use]
    pub fn progress(&self, id: MemberId) -> Option<&PeerProgress> {
        self.peers.get(&id)
    }

    /// Returns the peer ids being driven.
    pub fn peer_ids(&self) -> impl Iterator<Item = MemberId> + '_ {
        self.peers.keys().copied()
    }

    /// Returns true if a send may be issued to the peer now.
    #[must_use]
    pub fn can_send(&self, id: MemberId) -> bool {
        self.peers
            .get(&id)
            .is_some_and(|p| p.state == PeerState::Idle)
    }

    /// Marks an append to the peer as outstanding.
    pub fn mark_in_flight(&mut self, id: MemberId) {
        if let Some(peer) = self.peers.get_mut(&id) {
            peer.state = PeerState::InFlight;
        }
    }

    /// Records a successful append: the peer now matches `match_index`.
    pub fn record_success(&mut self, id: MemberId, match_index: LogIndex) {
        if let Some(peer) = self.peers.get_mut(&id) {
            if match_index > peer.match_index {
                peer.match_index = match_index;
            }
            peer.next_index = LogIndex::new(peer.match_index.get() + 1);
            peer.state = PeerState::Idle;
        }
    }

    /// Records a log-consistency rejection; rewinds `next_index` using the
    /// follower's last-log-index hint.
    pub fn record_rejection(&mut self, id: MemberId, hint: LogIndex) {
        if let Some(peer) = self.peers.get_mut(&id) {
            let backtracked = peer.next_index.get().saturating_sub(1).max(1);
            peer.next_index = LogIndex::new(backtracked.min(hint.get() + 1).max(1));
            peer.state = PeerState::Idle;
            debug!(peer = %id, next_index = peer.next_index.get(), "rewound replication");
        }
    }

    /// Records a transport failure; the peer enters backoff until the next
    /// heartbeat tick.
    pub fn record_error(&mut self, id: MemberId) {
        if let Some(peer) = self.peers.get_mut(&id) {
            let failures = match peer.state {
                PeerState::Backoff { failures } => failures.saturating_add(1),
                _ => 1,
            };
            peer.state = PeerState::Backoff { failures };
        }
    }

    /// Heartbeat tick: outstanding and backed-off peers become ready again
    /// (a lost response must not stall replication forever).
    pub fn tick(&mut self) {
        for peer in self.peers.values_mut() {
            peer.state = PeerState::Idle;
        }
    }

    /// Returns the highest index replicated on a quorum, counting the
    /// leader's own log.
    #[must_use]
    pub fn quorum_match_index(&self, leader_last: LogIndex, quorum: usize) -> LogIndex {
        let mut matches: Vec<u64> = self.peers.values().map(|p| p.match_index.get()).collect();
        matches.push(leader_last.get());
        matches.sort_unstable_by(|a, b| b.cmp(a));
        matches
            .get(quorum.saturating_sub(1))
            .map_or_else(|| LogIndex::new(0), |&m| LogIndex::new(m))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peers() -> Vec<MemberId> {
        vec![MemberId::new(2), MemberId::new(3)]
    }

    #[test]
    fn test_initial_progress() {
        let replicator = Replicator::new(&peers(), LogIndex::new(5));
        let progress = replicator.progress(MemberId::new(2)).unwrap();
        assert_eq!(progress.next_index.get(), 5);
        assert_eq!(progress.match_index.get(), 0);
        assert!(replicator.can_send(MemberId::new(2)));
    }

    #[test]
    fn test_success_advances_watermarks() {
        let mut replicator = Replicator::new(&peers(), LogIndex::new(5));
        replicator.mark_in_flight(MemberId::new(2));
        assert!(!replicator.can_send(MemberId::new(2)));

        replicator.record_success(MemberId::new(2), LogIndex::new(7));
        let progress = replicator.progress(MemberId::new(2)).unwrap();
        assert_eq!(progress.match_index.get(), 7);
        assert_eq!(progress.next_index.get(), 8);
        assert!(replicator.can_send(MemberId::new(2)));
    }

    #[test]
    fn test_match_index_never_regresses() {
        let mut replicator = Replicator::new(&peers(), LogIndex::new(5));
        replicator.record_success(MemberId::new(2), LogIndex::new(7));
        replicator.record_success(MemberId::new(2), LogIndex::new(3));
        assert_eq!(
            replicator.progress(MemberId::new(2)).unwrap().match_index.get(),
            7
        );
    }

    #[test]
    fn test_rejection_rewinds_to_hint() {
        let mut replicator = Replicator::new(&peers(), LogIndex::new(10));
        // Follower reports it only has up to index 4.
        replicator.record_rejection(MemberId::new(2), LogIndex::new(4));
        assert_eq!(
            replicator.progress(MemberId::new(2)).unwrap().next_index.get(),
            5
        );

        // With a high hint, rewind steps back one at a time.
        let mut replicator = Replicator::new(&peers(), LogIndex::new(10));
        replicator.record_rejection(MemberId::new(2), LogIndex::new(99));
        assert_eq!(
            replicator.progress(MemberId::new(2)).unwrap().next_index.get(),
            9
        );
    }

    #[test]
    fn test_error_backoff_cleared_by_tick() {
        let mut replicator = Replicator::new(&peers(), LogIndex::new(1));
        replicator.record_error(MemberId::new(2));
        assert!(!replicator.can_send(MemberId::new(2)));
        assert_eq!(
            replicator.progress(MemberId::new(2)).unwrap().state,
            PeerState::Backoff { failures: 1 }
        );

        replicator.record_error(MemberId::new(2));
        assert_eq!(
            replicator.progress(MemberId::new(2)).unwrap().state,
            PeerState::Backoff { failures: 2 }
        );

        replicator.tick();
        assert!(replicator.can_send(MemberId::new(2)));
    }

    #[test]
    fn test_quorum_match_index() {
        let mut replicator = Replicator::new(&peers(), LogIndex::new(1));

        // Three-member cluster, quorum 2: leader at 10, peers at 0.
        assert_eq!(
            replicator.quorum_match_index(LogIndex::new(10), 2).get(),
            0
        );

        replicator.record_success(MemberId::new(2), LogIndex::new(6));
        assert_eq!(
            replicator.quorum_match_index(LogIndex::new(10), 2).get(),
            6
        );

        replicator.record_success(MemberId::new(3), LogIndex::new(8));
        assert_eq!(
            replicator.quorum_match_index(LogIndex::new(10), 2).get(),
            8
        );
    }
}
