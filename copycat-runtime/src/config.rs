//! Node configuration.
//!
//! One structure gathers every recognized option - log sizing, timing,
//! membership - and projects it into the per-layer configurations.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;

use copycat_core::limits::{
    ELECTION_TIMEOUT_MS_DEFAULT, ENTRY_SIZE_BYTES_MAX, HEARTBEAT_INTERVAL_MS_DEFAULT,
};
use copycat_core::MemberId;
use copycat_log::LogConfig;
use copycat_raft::{Member, MemberKind, RaftConfig};

/// Configuration for a Copycat node.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// This member's id.
    pub local_id: MemberId,
    /// Address the transport listens on.
    pub listen_addr: SocketAddr,
    /// Root directory for segment files.
    pub directory: PathBuf,
    /// Log name (segment filename prefix).
    pub name: String,
    /// Seed cluster membership, including this member.
    pub members: Vec<Member>,
    /// Hard cap on a single encoded entry in bytes.
    pub max_entry_size: u32,
    /// Soft cap on a segment's data region before rotation.
    pub max_segment_size: u32,
    /// Cap on index slots per segment.
    pub max_entries_per_segment: u64,
    /// Base election timeout; the timer is drawn from `[T, 2T)`.
    pub election_timeout_ms: u64,
    /// Leader heartbeat period and passive gossip period.
    pub heartbeat_interval_ms: u64,
    /// Seed for election jitter and gossip peer selection.
    pub seed: u64,
}

impl NodeConfig {
    /// Creates a configuration with default sizing and timing.
    #[must_use]
    pub fn new(
        local_id: MemberId,
        listen_addr: SocketAddr,
        directory: impl Into<PathBuf>,
    ) -> Self {
        Self {
            local_id,
            listen_addr,
            directory: directory.into(),
            name: "copycat".to_string(),
            members: Vec::new(),
            max_entry_size: ENTRY_SIZE_BYTES_MAX,
            max_segment_size: 32 * 1024 * 1024,
            max_entries_per_segment: 1 << 20,
            election_timeout_ms: ELECTION_TIMEOUT_MS_DEFAULT,
            heartbeat_interval_ms: HEARTBEAT_INTERVAL_MS_DEFAULT,
            seed: 0,
        }
    }

    /// Sets the log name.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Adds a member to the seed membership.
    #[must_use]
    pub fn with_member(
        mut self,
        id: MemberId,
        kind: MemberKind,
        address: impl Into<String>,
    ) -> Self {
        self.members.push(Member::new(id, kind, address));
        self
    }

    /// Sets the maximum encoded entry size.
    #[must_use]
    pub const fn with_max_entry_size(mut self, size: u32) -> Self {
        self.max_entry_size = size;
        self
    }

    /// Sets the maximum segment data size.
    #[must_use]
    pub const fn with_max_segment_size(mut self, size: u32) -> Self {
        self.max_segment_size = size;
        self
    }

    /// Sets the maximum index slots per segment.
    #[must_use]
    pub const fn with_max_entries_per_segment(mut self, entries: u64) -> Self {
        self.max_entries_per_segment = entries;
        self
    }

    /// Sets the base election timeout.
    #[must_use]
    pub const fn with_election_timeout_ms(mut self, timeout: u64) -> Self {
        self.election_timeout_ms = timeout;
        self
    }

    /// Sets the heartbeat interval.
    #[must_use]
    pub const fn with_heartbeat_interval_ms(mut self, interval: u64) -> Self {
        self.heartbeat_interval_ms = interval;
        self
    }

    /// Sets the randomness seed.
    #[must_use]
    pub const fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Projects the log configuration.
    #[must_use]
    pub fn log_config(&self) -> LogConfig {
        LogConfig::new(self.directory.clone(), self.name.clone())
            .with_max_entry_size(self.max_entry_size)
            .with_max_segment_size(self.max_segment_size)
            .with_max_entries_per_segment(self.max_entries_per_segment)
    }

    /// Projects the Raft configuration.
    #[must_use]
    pub fn raft_config(&self) -> RaftConfig {
        RaftConfig::new(self.local_id, self.members.clone())
            .with_election_timeout_ms(self.election_timeout_ms)
            .with_heartbeat_interval_ms(self.heartbeat_interval_ms)
            .with_seed(self.seed)
    }

    /// Returns the transport address book: every member but this one.
    #[must_use]
    pub fn peer_addresses(&self) -> HashMap<MemberId, String> {
        self.members
            .iter()
            .filter(|m| m.id != self.local_id)
            .map(|m| (m.id, m.address.clone()))
            .collect()
    }
}
