//! Raft configuration.

use copycat_core::limits::{
    CLUSTER_SIZE_MAX, ELECTION_TIMEOUT_MS_DEFAULT, HEARTBEAT_INTERVAL_MS_DEFAULT,
};
use copycat_core::MemberId;

use crate::member::{Member, MemberKind};
use crate::{RaftError, RaftResult};

/// Configuration for one Raft member.
#[derive(Debug, Clone)]
pub struct RaftConfig {
    /// This member's id.
    pub local_id: MemberId,
    /// Seed cluster membership, including this member.
    pub members: Vec<Member>,
    /// Base election timeout in milliseconds; the actual timer is drawn
    /// uniformly from `[T, 2T)`.
    pub election_timeout_ms: u64,
    /// Leader heartbeat period and passive gossip period, in milliseconds.
    pub heartbeat_interval_ms: u64,
    /// Seed for election jitter and gossip peer selection.
    pub seed: u64,
}

impl RaftConfig {
    /// Creates a configuration with default timing.
    #[must_use]
    pub const fn new(local_id: MemberId, members: Vec<Member>) -> Self {
        Self {
            local_id,
            members,
            election_timeout_ms: ELECTION_TIMEOUT_MS_DEFAULT,
            heartbeat_interval_ms: HEARTBEAT_INTERVAL_MS_DEFAULT,
            seed: 0,
        }
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

    /// Sets the randomness seed, making timers and gossip deterministic.
    #[must_use]
    pub const fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Returns this member's participation kind.
    #[must_use]
    pub fn local_kind(&self) -> MemberKind {
        self.members
            .iter()
            .find(|m| m.id == self.local_id)
            .map_or(MemberKind::Remote, |m| m.kind)
    }

    /// Validates the configuration.
    ///
    /// # Errors
    /// Returns an error if the membership or timing is invalid.
    pub fn validate(&self) -> RaftResult<()> {
        if self.members.is_empty() {
            return Err(RaftError::InvalidConfig {
                reason: "members cannot be empty".to_string(),
            });
        }
        if self.members.len() > CLUSTER_SIZE_MAX {
            return Err(RaftError::InvalidConfig {
                reason: format!(
                    "cluster size {} exceeds maximum {CLUSTER_SIZE_MAX}",
                    self.members.len()
                ),
            });
        }
        if !self.members.iter().any(|m| m.id == self.local_id) {
            return Err(RaftError::InvalidConfig {
                reason: format!("local member {} not in members", self.local_id),
            });
        }
        if self.election_timeout_ms == 0 {
            return Err(RaftError::InvalidConfig {
                reason: "election timeout must be positive".to_string(),
            });
        }
        if self.heartbeat_interval_ms * 2 >= self.election_timeout_ms {
            return Err(RaftError::InvalidConfig {
                reason: "heartbeat interval must be below half the election timeout"
                    .to_string(),
            });
        }
        Ok(())
    }
}
