//! Raft wire RPC types.
//!
//! Plain value structs with constructor functions; the runtime codec maps
//! them onto framed envelopes. Six RPCs cross the wire: `Append`, `Vote`,
//! `Poll` (pre-vote), `Sync` (gossip), `Submit`, and `Status`.

use bytes::Bytes;
use copycat_core::{LogIndex, MemberId, TermId};
use copycat_log::Entry;

use crate::member::Member;

/// Response status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Status {
    /// The request was served.
    Ok = 0,
    /// The request failed; the response carries a [`RaftErrorKind`].
    Error = 1,
}

impl Status {
    /// Decodes a status byte.
    #[must_use]
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Ok),
            1 => Some(Self::Error),
            _ => None,
        }
    }

    /// Returns the wire byte.
    #[must_use]
    pub const fn as_u8(self) -> u8 {
        self as u8
    }
}

/// Protocol error kinds carried in error responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RaftErrorKind {
    /// No leader is known to serve the request.
    NoLeader = 0,
    /// A read against the log or state machine failed.
    Read = 1,
    /// A write against the log failed.
    Write = 2,
    /// The receiving member cannot serve this request in its role.
    IllegalMemberState = 3,
    /// The client session is unknown.
    UnknownSession = 4,
    /// The state machine rejected the operation.
    Application = 5,
}

impl RaftErrorKind {
    /// Decodes an error byte.
    #[must_use]
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::NoLeader),
            1 => Some(Self::Read),
            2 => Some(Self::Write),
            3 => Some(Self::IllegalMemberState),
            4 => Some(Self::UnknownSession),
            5 => Some(Self::Application),
            _ => None,
        }
    }

    /// Returns the wire byte.
    #[must_use]
    pub const fn as_u8(self) -> u8 {
        self as u8
    }
}

/// Query consistency levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Consistency {
    /// Served from local applied state on any member.
    Serializable = 0,
    /// Served by the leader while its heartbeat lease holds.
    LinearizableLease = 1,
    /// Served by the leader after a quorum heartbeat round.
    LinearizableStrict = 2,
}

impl Consistency {
    /// Decodes a consistency byte.
    #[must_use]
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Serializable),
            1 => Some(Self::LinearizableLease),
            2 => Some(Self::LinearizableStrict),
            _ => None,
        }
    }

    /// Returns the wire byte.
    #[must_use]
    pub const fn as_u8(self) -> u8 {
        self as u8
    }
}

/// An operation submitted to the cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    /// A command replicated through the log and applied on commit.
    Command {
        /// The command key.
        key: Bytes,
        /// The command payload.
        payload: Bytes,
    },
    /// A read served from applied state at the requested consistency.
    Query {
        /// The query key.
        key: Bytes,
        /// The query payload.
        payload: Bytes,
        /// Required consistency level.
        consistency: Consistency,
    },
}

/// A request envelope body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    /// Log replication / heartbeat.
    Append(AppendRequest),
    /// Election vote.
    Vote(VoteRequest),
    /// Pre-vote probe.
    Poll(PollRequest),
    /// Gossip synchronization.
    Sync(SyncRequest),
    /// Client operation submission.
    Submit(SubmitRequest),
    /// Node status probe.
    Status(StatusRequest),
}

/// A response envelope body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    /// Response to [`Request::Append`].
    Append(AppendResponse),
    /// Response to [`Request::Vote`].
    Vote(VoteResponse),
    /// Response to [`Request::Poll`].
    Poll(PollResponse),
    /// Response to [`Request::Sync`].
    Sync(SyncResponse),
    /// Response to [`Request::Submit`].
    Submit(SubmitResponse),
    /// Response to [`Request::Status`].
    Status(StatusResponse),
}

/// Log replication request; empty `entries` is a heartbeat.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppendRequest {
    /// Leader's term.
    pub term: TermId,
    /// The leader sending the request.
    pub leader: MemberId,
    /// Index of the entry immediately preceding `entries`.
    pub prev_log_index: LogIndex,
    /// Term of the entry at `prev_log_index`.
    pub prev_log_term: TermId,
    /// Entries to replicate (empty for heartbeat).
    pub entries: Vec<Entry>,
    /// Leader's commit index.
    pub commit_index: LogIndex,
}

impl AppendRequest {
    /// Returns true if this is a heartbeat.
    #[must_use]
    pub fn is_heartbeat(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Response to an [`AppendRequest`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppendResponse {
    /// Response status.
    pub status: Status,
    /// Error kind when `status` is [`Status::Error`].
    pub error: Option<RaftErrorKind>,
    /// Responder's current term.
    pub term: TermId,
    /// True if the follower matched `prev_log_index`/`prev_log_term`.
    pub succeeded: bool,
    /// The responder's last log index, for leader backtracking.
    pub log_index: LogIndex,
}

impl AppendResponse {
    /// Builds a successful-status response.
    #[must_use]
    pub const fn ok(term: TermId, succeeded: bool, log_index: LogIndex) -> Self {
        Self {
            status: Status::Ok,
            error: None,
            term,
            succeeded,
            log_index,
        }
    }

    /// Builds an error response.
    #[must_use]
    pub const fn error(kind: RaftErrorKind, term: TermId) -> Self {
        Self {
            status: Status::Error,
            error: Some(kind),
            term,
            succeeded: false,
            log_index: LogIndex::new(0),
        }
    }
}

/// Election vote request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VoteRequest {
    /// Candidate's term.
    pub term: TermId,
    /// The candidate requesting the vote.
    pub candidate: MemberId,
    /// Index of the candidate's last log entry.
    pub last_log_index: LogIndex,
    /// Term of the candidate's last log entry.
    pub last_log_term: TermId,
}

/// Response to a [`VoteRequest`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VoteResponse {
    /// Response status.
    pub status: Status,
    /// Error kind when `status` is [`Status::Error`].
    pub error: Option<RaftErrorKind>,
    /// Responder's current term.
    pub term: TermId,
    /// True if the vote was granted.
    pub granted: bool,
}

impl VoteResponse {
    /// Builds a successful-status response.
    #[must_use]
    pub const fn ok(term: TermId, granted: bool) -> Self {
        Self {
            status: Status::Ok,
            error: None,
            term,
            granted,
        }
    }

    /// Builds an error response.
    #[must_use]
    pub const fn error(kind: RaftErrorKind, term: TermId) -> Self {
        Self {
            status: Status::Error,
            error: Some(kind),
            term,
            granted: false,
        }
    }
}

/// Pre-vote request; same shape as [`VoteRequest`] but grants nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollRequest {
    /// The term the candidate would campaign in.
    pub term: TermId,
    /// The member probing for support.
    pub candidate: MemberId,
    /// Index of the candidate's last log entry.
    pub last_log_index: LogIndex,
    /// Term of the candidate's last log entry.
    pub last_log_term: TermId,
}

/// Response to a [`PollRequest`]; same shape as [`VoteResponse`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollResponse {
    /// Response status.
    pub status: Status,
    /// Error kind when `status` is [`Status::Error`].
    pub error: Option<RaftErrorKind>,
    /// Responder's current term.
    pub term: TermId,
    /// True if the responder would grant a vote.
    pub granted: bool,
}

impl PollResponse {
    /// Builds a successful-status response.
    #[must_use]
    pub const fn ok(term: TermId, granted: bool) -> Self {
        Self {
            status: Status::Ok,
            error: None,
            term,
            granted,
        }
    }

    /// Builds an error response.
    #[must_use]
    pub const fn error(kind: RaftErrorKind, term: TermId) -> Self {
        Self {
            status: Status::Error,
            error: Some(kind),
            term,
            granted: false,
        }
    }
}

/// Gossip synchronization request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncRequest {
    /// Sender's current term.
    pub term: TermId,
    /// Sender's known leader, if any.
    pub leader: Option<MemberId>,
    /// The receiver's commit index as last known by the sender; `entries`
    /// start immediately after it.
    pub log_index: LogIndex,
    /// The sender's membership view.
    pub members: Vec<Member>,
    /// Committed entries the receiver may be missing.
    pub entries: Vec<Entry>,
}

/// Response to a [`SyncRequest`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncResponse {
    /// Response status.
    pub status: Status,
    /// Error kind when `status` is [`Status::Error`].
    pub error: Option<RaftErrorKind>,
    /// The receiver's merged membership view.
    pub members: Vec<Member>,
}

impl SyncResponse {
    /// Builds a successful-status response.
    #[must_use]
    pub const fn ok(members: Vec<Member>) -> Self {
        Self {
            status: Status::Ok,
            error: None,
            members,
        }
    }

    /// Builds an error response.
    #[must_use]
    pub const fn error(kind: RaftErrorKind) -> Self {
        Self {
            status: Status::Error,
            error: Some(kind),
            members: Vec::new(),
        }
    }
}

/// Client operation submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmitRequest {
    /// The operation to run.
    pub operation: Operation,
}

/// Response to a [`SubmitRequest`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmitResponse {
    /// Response status.
    pub status: Status,
    /// Error kind when `status` is [`Status::Error`].
    pub error: Option<RaftErrorKind>,
    /// State machine result when `status` is [`Status::Ok`].
    pub result: Option<Bytes>,
    /// Leader hint for client redirection.
    pub leader: Option<MemberId>,
}

impl SubmitResponse {
    /// Builds a successful-status response.
    #[must_use]
    pub const fn ok(result: Option<Bytes>, leader: Option<MemberId>) -> Self {
        Self {
            status: Status::Ok,
            error: None,
            result,
            leader,
        }
    }

    /// Builds an error response with a leader hint.
    #[must_use]
    pub const fn error(kind: RaftErrorKind, leader: Option<MemberId>) -> Self {
        Self {
            status: Status::Error,
            error: Some(kind),
            result: None,
            leader,
        }
    }
}

/// Node status probe; carries no fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StatusRequest;

/// Response to a [`StatusRequest`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusResponse {
    /// Response status.
    pub status: Status,
    /// Error kind when `status` is [`Status::Error`].
    pub error: Option<RaftErrorKind>,
    /// Responder's current term.
    pub term: TermId,
    /// Responder's known leader, if any.
    pub leader: Option<MemberId>,
}

impl StatusResponse {
    /// Builds a successful-status response.
    #[must_use]
    pub const fn ok(term: TermId, leader: Option<MemberId>) -> Self {
        Self {
            status: Status::Ok,
            error: None,
            term,
            leader,
        }
    }
}
