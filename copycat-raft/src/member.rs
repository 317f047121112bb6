//! Cluster membership view.
//!
//! The membership view is copy-on-write: the context owns an `Arc` map and
//! mutates a fresh copy in place via `Arc::make_mut`, so snapshots handed
//! to gossip messages or other threads stay immutable. Members carry a
//! per-member version; merging two views keeps the higher version of each
//! member (last writer wins), which is what lets gossip converge.

use std::collections::BTreeMap;
use std::sync::Arc;

use copycat_core::{LogIndex, MemberId};
use rand::seq::SliceRandom;
use rand::Rng;

/// How a member participates in the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MemberKind {
    /// Votes and counts toward quorum.
    Active = 0,
    /// Learns committed state via gossip; never votes.
    Passive = 1,
    /// A client-only member; not part of the replication topology.
    Remote = 2,
}

impl MemberKind {
    /// Decodes a kind from its wire byte.
    #[must_use]
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Active),
            1 => Some(Self::Passive),
            2 => Some(Self::Remote),
            _ => None,
        }
    }

    /// Returns the wire byte for this kind.
    #[must_use]
    pub const fn as_u8(self) -> u8 {
        self as u8
    }
}

/// A single cluster member.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Member {
    /// Member identifier.
    pub id: MemberId,
    /// Participation kind.
    pub kind: MemberKind,
    /// Transport address (`host:port`).
    pub address: String,
    /// The member's last known commit index, propagated by gossip.
    pub commit_index: LogIndex,
    /// The member's last known compaction floor.
    pub recycle_index: LogIndex,
    /// Vector-clock version for last-writer-wins merging.
    pub version: u64,
}

impl Member {
    /// Creates a member with zeroed gossip state.
    #[must_use]
    pub fn new(id: MemberId, kind: MemberKind, address: impl Into<String>) -> Self {
        Self {
            id,
            kind,
            address: address.into(),
            commit_index: LogIndex::new(0),
            recycle_index: LogIndex::new(0),
            version: 0,
        }
    }
}

/// The copy-on-write membership view.
#[derive(Debug, Clone, Default)]
pub struct Members {
    members: Arc<BTreeMap<MemberId, Member>>,
}

impl Members {
    /// Builds a view from seed members.
    #[must_use]
    pub fn new(seed: Vec<Member>) -> Self {
        let members = seed.into_iter().map(|m| (m.id, m)).collect();
        Self {
            members: Arc::new(members),
        }
    }

    /// Returns the member with the given id.
    #[must_use]
    pub fn get(&self, id: MemberId) -> Option<&Member> {
        self.members.get(&id)
    }

    /// Iterates over all members.
    pub fn iter(&self) -> impl Iterator<Item = &Member> {
        self.members.values()
    }

    /// Returns all members as a vector, for gossip payloads.
    #[must_use]
    pub fn to_vec(&self) -> Vec<Member> {
        self.members.values().cloned().collect()
    }

    /// Returns the number of members.
    #[must_use]
    pub fn len(&self) -> usize {
        self.members.len()
    }

    /// Returns true if the view is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Returns the ids of active (voting) members.
    #[must_use]
    pub fn active_ids(&self) -> Vec<MemberId> {
        self.members
            .values()
            .filter(|m| m.kind == MemberKind::Active)
            .map(|m| m.id)
            .collect()
    }

    /// Returns the quorum size: a majority of active members.
    #[must_use]
    pub fn quorum_size(&self) -> usize {
        let active = self
            .members
            .values()
            .filter(|m| m.kind == MemberKind::Active)
            .count();
        active / 2 + 1
    }

    /// Mutates the member with the given id in a fresh copy of the view.
    pub fn update<F: FnOnce(&mut Member)>(&mut self, id: MemberId, f: F) {
        let members = Arc::make_mut(&mut self.members);
        if let Some(member) = members.get_mut(&id) {
            f(member);
        }
    }

    /// Merges a remote view into this one, keeping the higher-versioned
    /// record of each member (last writer wins). Unknown members are
    /// adopted.
    pub fn merge(&mut self, remote: Vec<Member>) {
        let members = Arc::make_mut(&mut self.members);
        for incoming in remote {
            match members.get_mut(&incoming.id) {
                Some(existing) if existing.version >= incoming.version => {}
                Some(existing) => *existing = incoming,
                None => {
                    members.insert(incoming.id, incoming);
                }
            }
        }
    }

    /// Returns the highest recycle index any member advertises.
    #[must_use]
    pub fn max_recycle_index(&self) -> LogIndex {
        self.members
            .values()
            .map(|m| m.recycle_index)
            .max()
            .unwrap_or_else(|| LogIndex::new(0))
    }

    /// Selects up to `count` distinct random peers, excluding `local`.
    ///
    /// Selection is without replacement: a gossip round never contacts the
    /// same peer twice.
    pub fn random_peers<R: Rng>(&self, rng: &mut R, local: MemberId, count: usize) -> Vec<MemberId> {
        self.random_peers_where(rng, count, |m| {
            m.id != local && m.kind != MemberKind::Remote
        })
    }

    /// Selects up to `count` distinct random passive peers, excluding
    /// `local`.
    pub fn random_passive_peers<R: Rng>(
        &self,
        rng: &mut R,
        local: MemberId,
        count: usize,
    ) -> Vec<MemberId> {
        self.random_peers_where(rng, count, |m| {
            m.id != local && m.kind == MemberKind::Passive
        })
    }

    fn random_peers_where<R: Rng, F: Fn(&Member) -> bool>(
        &self,
        rng: &mut R,
        count: usize,
        filter: F,
    ) -> Vec<MemberId> {
        let mut candidates: Vec<MemberId> = self
            .members
            .values()
            .filter(|m| filter(m))
            .map(|m| m.id)
            .collect();
        candidates.shuffle(rng);
        candidates.truncate(count);
        candidates
    }
}
