//! Copycat raft - the consensus state machine.
//!
//! This crate implements the per-node Raft state: election, log
//! replication, membership gossip, linearizable query semantics, and the
//! submit pipeline. The [`RaftContext`] is a state machine driven by a
//! single-threaded executor: handlers take requests and timer events and
//! return responses plus [`RaftEffect`]s for the runtime to execute, which
//! keeps the core deterministic and directly testable.

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod commit;
mod config;
mod context;
mod member;
mod meta;
mod replicator;
mod rpc;

pub use commit::{ApplyError, StateMachine};
pub use config::RaftConfig;
pub use context::{RaftContext, RaftEffect, RoleKind};
pub use member::{Member, MemberKind, Members};
pub use meta::MetaStore;
pub use replicator::{PeerProgress, PeerState, Replicator};
pub use rpc::{
    AppendRequest, AppendResponse, Consistency, Operation, PollRequest, PollResponse,
    RaftErrorKind, Request, Response, Status, StatusRequest, StatusResponse, SubmitRequest,
    SubmitResponse, SyncRequest, SyncResponse, VoteRequest, VoteResponse,
};

use copycat_core::MemberId;
use thiserror::Error;

/// Result type for Raft operations.
pub type RaftResult<T> = Result<T, RaftError>;

/// Errors surfaced by the Raft layer.
///
/// Protocol-level rejections (stale terms, log mismatches, illegal member
/// states) are carried inside responses; this type covers failures of the
/// node itself, of which storage errors are the terminal kind.
#[derive(Debug, Error)]
pub enum RaftError {
    /// The underlying log failed; corruption tears the context down.
    #[error("log error: {0}")]
    Log(#[from] copycat_log::LogError),

    /// The request needs a leader and this node does not know one.
    #[error("no leader known")]
    NoLeader {
        /// Hint about the last known leader.
        leader: Option<MemberId>,
    },

    /// Invalid Raft configuration.
    #[error("invalid configuration: {reason}")]
    InvalidConfig {
        /// Why the configuration is invalid.
        reason: String,
    },
}

impl RaftError {
    /// Returns true if this error is storage corruption, which requires
    /// tearing down the Raft context.
    #[must_use]
    pub const fn is_corruption(&self) -> bool {
        matches!(self, Self::Log(e) if e.is_corruption())
    }
}
