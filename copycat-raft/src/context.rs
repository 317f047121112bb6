//! The per-node Raft context.
//!
//! [`RaftContext`] owns everything a member mutates: the current term and
//! vote, the leader hint, the segmented log, the applied state machine,
//! the membership view, and the replaceable role. All mutation happens on
//! the context's designated executor thread; `check_thread` guards every
//! mutating path.
//!
//! Handlers are driven by the runtime: each takes a request, a response,
//! or a timer event and returns the wire response (where one is due) plus
//! a list of [`RaftEffect`]s - outbound requests to issue, timers to
//! reset, submissions to complete. The context never performs network I/O
//! itself, which keeps role logic deterministic and directly testable.
//!
//! ```text
//! Start ---open()---> Follower --election timeout--> Candidate
//!           |            ^                              |
//!           |            |                              +--quorum--> Leader
//!           |            +--higher term observed--------+  (also Leader -> Follower)
//!           +--(PASSIVE config)--> Passive   (never votes or leads)
//! ```

use std::collections::{BTreeMap, HashSet};
use std::thread::ThreadId;

use bytes::Bytes;
use copycat_core::limits::{
    APPEND_BATCH_BYTES_MAX, APPEND_BATCH_ENTRIES_MAX, GOSSIP_FANOUT, SYNC_BATCH_BYTES_MAX,
};
use copycat_core::{LogIndex, MemberId, TermId};
use copycat_log::{Entry, EntryKind, Log, LogConfig, LogError, Storage};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, info, warn};

use crate::commit::StateMachine;
use crate::config::RaftConfig;
use crate::member::{MemberKind, Members};
use crate::meta::MetaStore;
use crate::replicator::Replicator;
use crate::rpc::{
    AppendRequest, AppendResponse, Consistency, Operation, PollRequest, PollResponse,
    RaftErrorKind, Request, Status, StatusResponse, SubmitRequest, SubmitResponse, SyncRequest,
    SyncResponse, VoteRequest, VoteResponse,
};
use crate::RaftResult;

/// The observable role of a context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoleKind {
    /// Not yet opened; rejects everything.
    Start,
    /// Responds to RPCs; times out into an election.
    Follower,
    /// Campaigning for leadership.
    Candidate,
    /// Replicating and committing entries.
    Leader,
    /// Non-voting; learns committed state via gossip.
    Passive,
}

/// Side effects for the runtime to execute after a handler returns.
#[derive(Debug)]
pub enum RaftEffect {
    /// Restart the election timer with a fresh randomized timeout.
    ResetElectionTimer,
    /// Issue an outbound request to a peer.
    Send {
        /// Destination member.
        to: MemberId,
        /// The request to send.
        request: Request,
    },
    /// Complete a pending submission with its response.
    CompleteSubmit {
        /// The submission handle given to [`RaftContext::handle_submit`].
        submission: u64,
        /// The response to deliver.
        response: SubmitResponse,
    },
    /// The context changed role.
    RoleChanged {
        /// The new role.
        role: RoleKind,
    },
}

/// A query awaiting a quorum heartbeat round.
struct PendingQuery {
    round: u64,
    submission: u64,
    key: Bytes,
    payload: Bytes,
}

/// Leader-only state.
struct LeaderState {
    replicator: Replicator,
    /// Submissions waiting on commit, keyed by entry index.
    waiters: BTreeMap<u64, u64>,
    /// Strict queries waiting on a full heartbeat round.
    strict_queries: Vec<PendingQuery>,
    /// Monotonic heartbeat round counter.
    round: u64,
    /// Peers that acked an append this round.
    round_acks: HashSet<MemberId>,
    /// True once a quorum acked this round.
    round_acked: bool,
    /// Last instant a quorum confirmed this leadership, for the lease.
    last_quorum_contact_ms: u64,
}

/// The replaceable role slot.
enum Role {
    Start,
    Follower {
        /// Peers granting the current pre-vote round.
        polls: HashSet<MemberId>,
        /// True while a pre-vote round is outstanding.
        polling: bool,
    },
    Candidate {
        votes: HashSet<MemberId>,
    },
    Leader(Box<LeaderState>),
    Passive,
}

impl Role {
    const fn kind(&self) -> RoleKind {
        match self {
            Self::Start => RoleKind::Start,
            Self::Follower { .. } => RoleKind::Follower,
            Self::Candidate { .. } => RoleKind::Candidate,
            Self::Leader(_) => RoleKind::Leader,
            Self::Passive => RoleKind::Passive,
        }
    }

    fn follower() -> Self {
        Self::Follower {
            polls: HashSet::new(),
            polling: false,
        }
    }
}

/// The per-node Raft state machine.
pub struct RaftContext<S: Storage> {
    config: RaftConfig,
    members: Members,
    log: Log<S>,
    meta: MetaStore,
    state_machine: Box<dyn StateMachine>,
    current_term: TermId,
    voted_for: Option<MemberId>,
    leader: Option<MemberId>,
    last_applied: LogIndex,
    recycle_index: LogIndex,
    role: Role,
    rng: StdRng,
    owner: Option<ThreadId>,
}

impl<S: Storage> RaftContext<S> {
    /// Creates a context over the given storage, opening (or recovering)
    /// its log and vote metadata.
    ///
    /// # Errors
    /// Returns an error on invalid configuration or storage failure.
    pub fn new(
        config: RaftConfig,
        storage: S,
        log_config: LogConfig,
        state_machine: Box<dyn StateMachine>,
    ) -> RaftResult<Self> {
        config.validate()?;

        let meta = MetaStore::open(&storage, &log_config.directory, &log_config.name)?;
        let log = Log::open(storage, log_config)?;
        let members = Members::new(config.members.clone());
        let rng = StdRng::seed_from_u64(config.seed);

        Ok(Self {
            config,
            members,
            log,
            meta,
            state_machine,
            current_term: TermId::new(0),
            voted_for: None,
            leader: None,
            last_applied: LogIndex::new(0),
            recycle_index: LogIndex::new(0),
            role: Role::Start,
            rng,
            owner: None,
        })
    }

    /// Binds the context to the current thread; every mutating call must
    /// come from this thread afterwards.
    pub fn bind(&mut self) {
        self.owner = Some(std::thread::current().id());
    }

    /// Opens the context: loads the persisted term and vote and enters
    /// the Follower role (or Passive for a passive member).
    ///
    /// # Errors
    /// Returns an error if the metadata cannot be read.
    pub fn open(&mut self) -> RaftResult<Vec<RaftEffect>> {
        self.check_thread();
        assert!(matches!(self.role, Role::Start), "context already open");

        if let Some((term, voted_for)) = self.meta.load()? {
            self.current_term = term;
            self.voted_for = voted_for;
        }

        let mut effects = Vec::new();
        if self.config.local_kind() == MemberKind::Passive {
            self.role = Role::Passive;
        } else {
            self.role = Role::follower();
            effects.push(RaftEffect::ResetElectionTimer);
        }
        effects.push(RaftEffect::RoleChanged {
            role: self.role.kind(),
        });

        info!(
            member = %self.config.local_id,
            term = self.current_term.get(),
            role = ?self.role.kind(),
            "opened raft context"
        );
        Ok(effects)
    }

    /// Returns this member's id.
    #[must_use]
    pub const fn local_id(&self) -> MemberId {
        self.config.local_id
    }

    /// Returns the current role.
    #[must_use]
    pub const fn role_kind(&self) -> RoleKind {
        self.role.kind()
    }

    /// Returns true if this context is the leader.
    #[must_use]
    pub const fn is_leader(&self) -> bool {
        matches!(self.role, Role::Leader(_))
    }

    /// Returns the current term.
    #[must_use]
    pub const fn current_term(&self) -> TermId {
        self.current_term
    }

    /// Returns the known leader, if any.
    #[must_use]
    pub const fn leader(&self) -> Option<MemberId> {
        self.leader
    }

    /// Returns the commit index.
    #[must_use]
    pub const fn commit_index(&self) -> LogIndex {
        self.log.commit_index()
    }

    /// Returns the last applied index.
    #[must_use]
    pub const fn last_applied(&self) -> LogIndex {
        self.last_applied
    }

    /// Returns the membership view.
    #[must_use]
    pub const fn members(&self) -> &Members {
        &self.members
    }

    /// Returns the underlying log.
    #[must_use]
    pub const fn log(&self) -> &Log<S> {
        &self.log
    }

    /// Returns mutable access to the log, for maintenance such as
    /// compaction planning.
    pub fn log_mut(&mut self) -> &mut Log<S> {
        self.check_thread();
        &mut self.log
    }

    /// Draws a randomized election timeout, uniform in `[T, 2T)`.
    pub fn random_election_timeout_ms(&mut self) -> u64 {
        let base = self.config.election_timeout_ms;
        base + self.rng.gen_range(0..base)
    }

    /// Returns the heartbeat interval (also the gossip period).
    #[must_use]
    pub const fn heartbeat_interval_ms(&self) -> u64 {
        self.config.heartbeat_interval_ms
    }

    /// Flushes the log to durable storage.
    ///
    /// # Errors
    /// Returns an error if a sync fails.
    pub fn flush(&self) -> RaftResult<()> {
        self.log.flush().map_err(Into::into)
    }

    /// Flushes and closes the context.
    ///
    /// # Errors
    /// Returns an error if a sync fails.
    pub fn close(&mut self) -> RaftResult<()> {
        self.check_thread();
        self.log.close().map_err(Into::into)
    }

    // ------------------------------------------------------------------
    // Inbound requests
    // ------------------------------------------------------------------

    /// Handles a replication (or heartbeat) request from a leader.
    ///
    /// # Errors
    /// Returns an error only on storage failure; protocol rejections are
    /// carried in the response.
    pub fn handle_append(
        &mut self,
        request: &AppendRequest,
    ) -> RaftResult<(AppendResponse, Vec<RaftEffect>)> {
        self.check_thread();
        let mut effects = Vec::new();

        if matches!(self.role, Role::Start | Role::Passive) {
            return Ok((
                AppendResponse::error(RaftErrorKind::IllegalMemberState, self.current_term),
                effects,
            ));
        }

        self.observe_term(request.term, &mut effects)?;

        if request.term < self.current_term {
            let last = self.last_index();
            return Ok((AppendResponse::ok(self.current_term, false, last), effects));
        }

        // A valid append from the current term: candidates (and a stale
        // leader at an equal term) yield to the sender.
        if matches!(self.role, Role::Candidate { .. } | Role::Leader(_)) {
            self.transition_to_follower(&mut effects);
        }
        self.leader = Some(request.leader);
        effects.push(RaftEffect::ResetElectionTimer);

        // Log consistency check.
        let prev = request.prev_log_index;
        let log_ok = prev.get() == 0 || self.log.term_at(prev) == Some(request.prev_log_term);
        if !log_ok {
            let last = self.last_index();
            return Ok((AppendResponse::ok(self.current_term, false, last), effects));
        }

        // Truncate a divergent suffix and append the new entries.
        for entry in &request.entries {
            if entry.index < self.log.next_index() {
                if self.log.term_at(entry.index) == Some(entry.term) {
                    continue;
                }
                self.log.truncate(LogIndex::new(entry.index.get() - 1))?;
            }
            self.log.append(entry)?;
        }

        let last = self.last_index();
        let commit_to = LogIndex::new(request.commit_index.get().min(last.get()));
        if commit_to > self.log.commit_index() {
            self.commit_and_apply(commit_to, &mut effects)?;
        }

        Ok((AppendResponse::ok(self.current_term, true, last), effects))
    }

    /// Handles an election vote request.
    ///
    /// # Errors
    /// Returns an error only on storage failure.
    pub fn handle_vote(
        &mut self,
        request: &VoteRequest,
    ) -> RaftResult<(VoteResponse, Vec<RaftEffect>)> {
        self.check_thread();
        let mut effects = Vec::new();

        if matches!(self.role, Role::Start | Role::Passive) {
            return Ok((
                VoteResponse::error(RaftErrorKind::IllegalMemberState, self.current_term),
                effects,
            ));
        }

        self.observe_term(request.term, &mut effects)?;

        let granted = request.term >= self.current_term
            && self
                .voted_for
                .map_or(true, |voted| voted == request.candidate)
            && self.log_up_to_date(request.last_log_term, request.last_log_index);

        if granted {
            self.voted_for = Some(request.candidate);
            // The vote must be durable before the response leaves.
            self.meta.save(self.current_term, self.voted_for)?;
            effects.push(RaftEffect::ResetElectionTimer);
            debug!(member = %self.config.local_id, candidate = %request.candidate, "granted vote");
        }

        Ok((VoteResponse::ok(self.current_term, granted), effects))
    }

    /// Handles a pre-vote probe: the vote predicate with no state change.
    ///
    /// # Errors
    /// Infallible today; `Result` keeps the handler signatures uniform.
    pub fn handle_poll(
        &mut self,
        request: &PollRequest,
    ) -> RaftResult<(PollResponse, Vec<RaftEffect>)> {
        self.check_thread();

        if matches!(self.role, Role::Start | Role::Passive) {
            return Ok((
                PollResponse::error(RaftErrorKind::IllegalMemberState, self.current_term),
                Vec::new(),
            ));
        }

        let granted = request.term >= self.current_term
            && self.log_up_to_date(request.last_log_term, request.last_log_index);
        Ok((PollResponse::ok(self.current_term, granted), Vec::new()))
    }

    /// Handles a gossip synchronization request: merges membership,
    /// appends missing committed entries, and applies them.
    ///
    /// # Errors
    /// Returns an error only on storage failure.
    pub fn handle_sync(
        &mut self,
        request: SyncRequest,
    ) -> RaftResult<(SyncResponse, Vec<RaftEffect>)> {
        self.check_thread();
        let mut effects = Vec::new();

        if matches!(self.role, Role::Start) {
            return Ok((
                SyncResponse::error(RaftErrorKind::IllegalMemberState),
                effects,
            ));
        }

        if request.term > self.current_term {
            self.observe_term(request.term, &mut effects)?;
            self.leader = request.leader;
        } else if request.term == self.current_term
            && self.leader.is_none()
            && request.leader.is_some()
        {
            self.leader = request.leader;
        }

        // Refresh our own record (so the response advertises our true
        // commit index) and merge the sender's view.
        let commit = self.log.commit_index();
        self.members.update(self.config.local_id, |m| {
            m.version += 1;
            m.commit_index = commit;
        });
        self.members.merge(request.members);

        // If we are missing the sender's recorded baseline the entries
        // would leave a hole; answer with membership only and let the
        // sender retry from our advertised commit index.
        let baseline_ok =
            request.log_index.get() == 0 || self.log.contains_index(request.log_index);
        if baseline_ok {
            // Only committed entries travel via gossip, so no consistency
            // checks are needed; anything beyond our tail is appended,
            // committed, and applied.
            for entry in request.entries {
                let next = self.log.next_index();
                if entry.index < next {
                    continue;
                }
                if entry.index > next {
                    self.log.skip(entry.index.get() - next.get())?;
                }
                self.log.append(&entry)?;
                self.commit_and_apply(entry.index, &mut effects)?;
            }
        }

        let advertised = self.members.max_recycle_index();
        if advertised > self.recycle_index {
            self.recycle_index = advertised;
        }

        Ok((SyncResponse::ok(self.members.to_vec()), effects))
    }

    /// Handles a status probe.
    #[must_use]
    pub const fn handle_status(&self) -> StatusResponse {
        StatusResponse::ok(self.current_term, self.leader)
    }

    /// Handles an operation submission.
    ///
    /// The response is always delivered through a
    /// [`RaftEffect::CompleteSubmit`] carrying `submission` - immediately
    /// for rejections and local reads, or once the operation commits.
    ///
    /// # Errors
    /// Returns an error only on storage failure.
    pub fn handle_submit(
        &mut self,
        request: SubmitRequest,
        submission: u64,
        now_ms: u64,
    ) -> RaftResult<Vec<RaftEffect>> {
        self.check_thread();
        let mut effects = Vec::new();

        if matches!(self.role, Role::Start) {
            effects.push(RaftEffect::CompleteSubmit {
                submission,
                response: SubmitResponse::error(RaftErrorKind::IllegalMemberState, None),
            });
            return Ok(effects);
        }

        // Serializable reads come straight from local applied state on
        // any member.
        if let Operation::Query {
            key,
            payload,
            consistency: Consistency::Serializable,
        } = &request.operation
        {
            let response = self.local_query(key, payload);
            effects.push(RaftEffect::CompleteSubmit {
                submission,
                response,
            });
            return Ok(effects);
        }

        if !self.is_leader() {
            effects.push(RaftEffect::CompleteSubmit {
                submission,
                response: SubmitResponse::error(RaftErrorKind::NoLeader, self.leader),
            });
            return Ok(effects);
        }

        match request.operation {
            Operation::Command { key, payload } => {
                self.leader_command(key, payload, submission, now_ms, &mut effects)?;
            }
            Operation::Query {
                key,
                payload,
                consistency,
            } => {
                self.leader_query(key, payload, consistency, submission, now_ms, &mut effects);
            }
        }
        Ok(effects)
    }

    // ------------------------------------------------------------------
    // Responses to our own outbound requests
    // ------------------------------------------------------------------

    /// Handles a response to an append we issued.
    ///
    /// # Errors
    /// Returns an error only on storage failure.
    pub fn handle_append_response(
        &mut self,
        from: MemberId,
        response: AppendResponse,
        now_ms: u64,
    ) -> RaftResult<Vec<RaftEffect>> {
        self.check_thread();
        let mut effects = Vec::new();

        if response.status == Status::Error {
            warn!(peer = %from, error = ?response.error, "append rejected by peer state");
            return Ok(effects);
        }

        self.observe_term(response.term, &mut effects)?;
        if !matches!(self.role, Role::Leader(_)) || response.term != self.current_term {
            return Ok(effects);
        }

        if response.succeeded {
            let quorum = self.members.quorum_size();
            let mut ready = Vec::new();
            {
                let Role::Leader(state) = &mut self.role else {
                    unreachable!("checked above")
                };
                state.replicator.record_success(from, response.log_index);
                state.round_acks.insert(from);
                if !state.round_acked && state.round_acks.len() + 1 >= quorum {
                    state.round_acked = true;
                    state.last_quorum_contact_ms = now_ms;
                    let round = state.round;
                    let mut i = 0;
                    while i < state.strict_queries.len() {
                        if state.strict_queries[i].round < round {
                            ready.push(state.strict_queries.remove(i));
                        } else {
                            i += 1;
                        }
                    }
                }
            }
            for query in ready {
                let response = self.local_query(&query.key, &query.payload);
                effects.push(RaftEffect::CompleteSubmit {
                    submission: query.submission,
                    response,
                });
            }

            self.advance_commit(&mut effects)?;

            // Keep draining a peer that is still behind.
            let behind = {
                let Role::Leader(state) = &self.role else {
                    return Ok(effects);
                };
                state.replicator.progress(from).map_or(false, |p| {
                    self.log
                        .last_index()
                        .is_some_and(|last| p.next_index <= last)
                })
            };
            if behind {
                self.send_append(from, &mut effects)?;
            }
        } else {
            {
                let Role::Leader(state) = &mut self.role else {
                    unreachable!("checked above")
                };
                state.replicator.record_rejection(from, response.log_index);
            }
            self.send_append(from, &mut effects)?;
        }

        Ok(effects)
    }

    /// Handles a response to a vote we requested.
    ///
    /// # Errors
    /// Returns an error only on storage failure.
    pub fn handle_vote_response(
        &mut self,
        from: MemberId,
        response: VoteResponse,
        now_ms: u64,
    ) -> RaftResult<Vec<RaftEffect>> {
        self.check_thread();
        let mut effects = Vec::new();

        if response.status == Status::Error {
            return Ok(effects);
        }
        self.observe_term(response.term, &mut effects)?;

        let reached_quorum = match &mut self.role {
            Role::Candidate { votes }
                if response.term == self.current_term && response.granted =>
            {
                votes.insert(from);
                votes.len() >= self.members.quorum_size()
            }
            _ => false,
        };
        if reached_quorum {
            self.become_leader(now_ms, &mut effects)?;
        }
        Ok(effects)
    }

    /// Handles a response to a pre-vote probe.
    ///
    /// # Errors
    /// Returns an error only on storage failure.
    pub fn handle_poll_response(
        &mut self,
        from: MemberId,
        response: PollResponse,
        now_ms: u64,
    ) -> RaftResult<Vec<RaftEffect>> {
        self.check_thread();
        let mut effects = Vec::new();

        if response.status == Status::Error {
            return Ok(effects);
        }
        self.observe_term(response.term, &mut effects)?;

        let reached_quorum = match &mut self.role {
            Role::Follower { polls, polling } if *polling && response.granted => {
                polls.insert(from);
                polls.len() >= self.members.quorum_size()
            }
            _ => false,
        };
        if reached_quorum {
            self.become_candidate(now_ms, &mut effects)?;
        }
        Ok(effects)
    }

    /// Handles a response to a gossip sync we issued.
    ///
    /// # Errors
    /// Returns an error only on storage failure.
    pub fn handle_sync_response(
        &mut self,
        from: MemberId,
        response: SyncResponse,
    ) -> RaftResult<Vec<RaftEffect>> {
        self.check_thread();
        let mut effects = Vec::new();

        if response.status != Status::Ok {
            warn!(peer = %from, error = ?response.error, "sync rejected");
            return Ok(effects);
        }
        self.members.merge(response.members);

        // Recursive catch-up: keep pushing while the peer trails our
        // commit index. Continuations must carry entries, or a committed
        // range of pure gaps would loop; it waits for the next tick
        // instead.
        if matches!(self.role, Role::Passive | Role::Leader(_)) {
            let behind = self
                .members
                .get(from)
                .map_or(false, |m| m.commit_index < self.log.commit_index());
            if behind {
                self.send_sync(from, true, &mut effects);
            }
        }
        Ok(effects)
    }

    /// Records a transport failure for an outbound request to a peer.
    pub fn handle_send_error(&mut self, peer: MemberId) {
        self.check_thread();
        warn!(peer = %peer, "send failed");
        if let Role::Leader(state) = &mut self.role {
            state.replicator.record_error(peer);
        }
    }

    // ------------------------------------------------------------------
    // Timers
    // ------------------------------------------------------------------

    /// Handles an election timeout: a follower opens a pre-vote round, a
    /// candidate restarts its election.
    ///
    /// # Errors
    /// Returns an error only on storage failure.
    pub fn handle_election_timeout(&mut self, now_ms: u64) -> RaftResult<Vec<RaftEffect>> {
        self.check_thread();
        let mut effects = Vec::new();

        match self.role.kind() {
            RoleKind::Follower => {
                let local = self.config.local_id;
                {
                    let Role::Follower { polls, polling } = &mut self.role else {
                        unreachable!("kind checked above")
                    };
                    *polling = true;
                    polls.clear();
                    polls.insert(local);
                }
                effects.push(RaftEffect::ResetElectionTimer);

                let (last_log_index, last_log_term) = self.last_log_position();
                let request = PollRequest {
                    term: self.current_term.next(),
                    candidate: local,
                    last_log_index,
                    last_log_term,
                };
                for peer in self.active_peers() {
                    effects.push(RaftEffect::Send {
                        to: peer,
                        request: Request::Poll(request),
                    });
                }

                // A single-member cluster grants its own pre-vote.
                if self.poll_quorum_reached() {
                    self.become_candidate(now_ms, &mut effects)?;
                }
            }
            RoleKind::Candidate => {
                // Split vote or lost messages: campaign again in a new
                // term.
                self.become_candidate(now_ms, &mut effects)?;
            }
            RoleKind::Start | RoleKind::Leader | RoleKind::Passive => {}
        }
        Ok(effects)
    }

    /// Handles a heartbeat tick: the leader replicates to every peer and
    /// syncs passive members; a passive member runs a gossip round.
    ///
    /// # Errors
    /// Returns an error only on storage failure.
    pub fn handle_heartbeat_tick(&mut self, now_ms: u64) -> RaftResult<Vec<RaftEffect>> {
        self.check_thread();
        let mut effects = Vec::new();

        match self.role.kind() {
            RoleKind::Leader => {
                let quorum = self.members.quorum_size();
                let peers: Vec<MemberId> = {
                    let Role::Leader(state) = &mut self.role else {
                        unreachable!("kind checked above")
                    };
                    state.round += 1;
                    state.round_acks.clear();
                    state.round_acked = false;
                    state.replicator.tick();

                    // Single-member cluster: the lease renews trivially.
                    if quorum == 1 {
                        state.last_quorum_contact_ms = now_ms;
                        state.round_acked = true;
                    }
                    state.replicator.peer_ids().collect()
                };
                for peer in peers {
                    self.send_append(peer, &mut effects)?;
                }

                // The leader carries committed state to passive members
                // through the same gossip tier passives use among
                // themselves.
                self.members
                    .update(self.config.local_id, |m| m.version += 1);
                let targets = self.members.random_passive_peers(
                    &mut self.rng,
                    self.config.local_id,
                    GOSSIP_FANOUT,
                );
                for peer in targets {
                    self.send_sync(peer, false, &mut effects);
                }
            }
            RoleKind::Passive => {
                self.members
                    .update(self.config.local_id, |m| m.version += 1);
                let targets = self.members.random_peers(
                    &mut self.rng,
                    self.config.local_id,
                    GOSSIP_FANOUT,
                );
                for peer in targets {
                    self.send_sync(peer, false, &mut effects);
                }
            }
            RoleKind::Start | RoleKind::Follower | RoleKind::Candidate => {}
        }
        Ok(effects)
    }

    // ------------------------------------------------------------------
    // Role transitions
    // ------------------------------------------------------------------

    fn become_candidate(
        &mut self,
        now_ms: u64,
        effects: &mut Vec<RaftEffect>,
    ) -> RaftResult<()> {
        self.current_term = self.current_term.next();
        self.voted_for = Some(self.config.local_id);
        self.meta.save(self.current_term, self.voted_for)?;
        self.leader = None;

        let mut votes = HashSet::new();
        votes.insert(self.config.local_id);
        self.role = Role::Candidate { votes };

        info!(
            member = %self.config.local_id,
            term = self.current_term.get(),
            "starting election"
        );
        effects.push(RaftEffect::RoleChanged {
            role: RoleKind::Candidate,
        });
        effects.push(RaftEffect::ResetElectionTimer);

        let (last_log_index, last_log_term) = self.last_log_position();
        let request = VoteRequest {
            term: self.current_term,
            candidate: self.config.local_id,
            last_log_index,
            last_log_term,
        };
        for peer in self.active_peers() {
            effects.push(RaftEffect::Send {
                to: peer,
                request: Request::Vote(request),
            });
        }

        if self.members.quorum_size() == 1 {
            self.become_leader(now_ms, effects)?;
        }
        Ok(())
    }

    fn become_leader(&mut self, now_ms: u64, effects: &mut Vec<RaftEffect>) -> RaftResult<()> {
        let peers = self.active_peers();
        let next_index = self.log.next_index();
        self.leader = Some(self.config.local_id);
        self.role = Role::Leader(Box::new(LeaderState {
            replicator: Replicator::new(&peers, next_index),
            waiters: BTreeMap::new(),
            strict_queries: Vec::new(),
            round: 0,
            round_acks: HashSet::new(),
            round_acked: false,
            last_quorum_contact_ms: now_ms,
        }));

        info!(
            member = %self.config.local_id,
            term = self.current_term.get(),
            "became leader"
        );
        effects.push(RaftEffect::RoleChanged {
            role: RoleKind::Leader,
        });

        // A no-op at the new term lets prior-term entries commit by
        // quorum.
        let noop = Entry::new(
            next_index,
            self.current_term,
            EntryKind::NoOp,
            now_ms,
            Bytes::new(),
            Bytes::new(),
        )?;
        self.log.append(&noop)?;

        for peer in peers {
            self.send_append(peer, effects)?;
        }
        self.advance_commit(effects)?;
        Ok(())
    }

    fn transition_to_follower(&mut self, effects: &mut Vec<RaftEffect>) {
        let previous = std::mem::replace(&mut self.role, Role::follower());
        if let Role::Leader(state) = previous {
            // Terminal loss of leadership: every in-flight submission
            // surfaces as NoLeader.
            for (_, submission) in state.waiters {
                effects.push(RaftEffect::CompleteSubmit {
                    submission,
                    response: SubmitResponse::error(RaftErrorKind::NoLeader, self.leader),
                });
            }
            for query in state.strict_queries {
                effects.push(RaftEffect::CompleteSubmit {
                    submission: query.submission,
                    response: SubmitResponse::error(RaftErrorKind::NoLeader, self.leader),
                });
            }
            info!(member = %self.config.local_id, "stepped down");
        }
        effects.push(RaftEffect::RoleChanged {
            role: RoleKind::Follower,
        });
        effects.push(RaftEffect::ResetElectionTimer);
    }

    /// Adopts a higher observed term, stepping down if currently leading
    /// or campaigning.
    fn observe_term(&mut self, term: TermId, effects: &mut Vec<RaftEffect>) -> RaftResult<()> {
        if term <= self.current_term {
            return Ok(());
        }
        self.current_term = term;
        self.voted_for = None;
        self.leader = None;
        self.meta.save(term, None)?;

        if matches!(self.role, Role::Candidate { .. } | Role::Leader(_)) {
            self.transition_to_follower(effects);
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Leader internals
    // ------------------------------------------------------------------

    fn leader_command(
        &mut self,
        key: Bytes,
        payload: Bytes,
        submission: u64,
        now_ms: u64,
        effects: &mut Vec<RaftEffect>,
    ) -> RaftResult<()> {
        let index = self.log.next_index();
        let entry = match Entry::new(
            index,
            self.current_term,
            EntryKind::Command,
            now_ms,
            key,
            payload,
        ) {
            Ok(entry) => entry,
            Err(LogError::EntryTooLarge { .. }) => {
                effects.push(RaftEffect::CompleteSubmit {
                    submission,
                    response: SubmitResponse::error(
                        RaftErrorKind::Write,
                        Some(self.config.local_id),
                    ),
                });
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };
        match self.log.append(&entry) {
            Ok(_) => {}
            Err(LogError::EntryTooLarge { .. }) => {
                effects.push(RaftEffect::CompleteSubmit {
                    submission,
                    response: SubmitResponse::error(
                        RaftErrorKind::Write,
                        Some(self.config.local_id),
                    ),
                });
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        }

        let peers: Vec<MemberId> = {
            let Role::Leader(state) = &mut self.role else {
                unreachable!("caller checked leadership")
            };
            state.waiters.insert(index.get(), submission);
            state.replicator.peer_ids().collect()
        };
        for peer in peers {
            self.send_append(peer, effects)?;
        }
        // A single-member cluster commits immediately.
        self.advance_commit(effects)?;
        Ok(())
    }

    fn leader_query(
        &mut self,
        key: Bytes,
        payload: Bytes,
        consistency: Consistency,
        submission: u64,
        now_ms: u64,
        effects: &mut Vec<RaftEffect>,
    ) {
        let quorum = self.members.quorum_size();
        let serve_now = match consistency {
            Consistency::Serializable => true,
            Consistency::LinearizableLease => {
                // The lease holds while no new election could have
                // completed since the last quorum contact.
                quorum == 1 || {
                    let Role::Leader(state) = &self.role else {
                        unreachable!("caller checked leadership")
                    };
                    now_ms.saturating_sub(state.last_quorum_contact_ms)
                        <= self.config.election_timeout_ms
                }
            }
            Consistency::LinearizableStrict => quorum == 1,
        };

        if serve_now {
            let response = self.local_query(&key, &payload);
            effects.push(RaftEffect::CompleteSubmit {
                submission,
                response,
            });
        } else {
            let Role::Leader(state) = &mut self.role else {
                unreachable!("caller checked leadership")
            };
            state.strict_queries.push(PendingQuery {
                round: state.round,
                submission,
                key,
                payload,
            });
        }
    }

    fn send_append(&mut self, peer: MemberId, effects: &mut Vec<RaftEffect>) -> RaftResult<()> {
        let next = {
            let Role::Leader(state) = &mut self.role else {
                return Ok(());
            };
            if !state.replicator.can_send(peer) {
                return Ok(());
            }
            state.replicator.mark_in_flight(peer);
            state
                .replicator
                .progress(peer)
                .expect("peer is tracked")
                .next_index
        };
        let request = self.build_append_request(next)?;
        effects.push(RaftEffect::Send {
            to: peer,
            request: Request::Append(request),
        });
        Ok(())
    }

    fn build_append_request(&self, next: LogIndex) -> RaftResult<AppendRequest> {
        let prev = LogIndex::new(next.get().saturating_sub(1));
        let prev_term = if prev.get() == 0 {
            TermId::new(0)
        } else {
            self.log.term_at(prev).unwrap_or_else(|| TermId::new(0))
        };

        let mut entries = Vec::new();
        let mut bytes = 0u64;
        let last = self.last_index();
        let mut index = next;
        while index <= last
            && entries.len() < APPEND_BATCH_ENTRIES_MAX
            && bytes < APPEND_BATCH_BYTES_MAX
        {
            match self.log.get(index) {
                Ok(entry) => {
                    bytes += entry.encoded_len();
                    entries.push(entry);
                }
                Err(LogError::NotFound { .. }) => break,
                Err(e) => return Err(e.into()),
            }
            index = index.next();
        }

        Ok(AppendRequest {
            term: self.current_term,
            leader: self.config.local_id,
            prev_log_index: prev,
            prev_log_term: prev_term,
            entries,
            commit_index: self.log.commit_index(),
        })
    }

    /// Advances the commit index to the highest quorum-replicated entry
    /// of the current term, then applies everything newly committed.
    fn advance_commit(&mut self, effects: &mut Vec<RaftEffect>) -> RaftResult<()> {
        let quorum = self.members.quorum_size();
        let quorum_match = {
            let Role::Leader(state) = &self.role else {
                return Ok(());
            };
            let last = self.last_index();
            state.replicator.quorum_match_index(last, quorum)
        };

        // Only entries of the current term commit by counting; a gap or a
        // prior-term entry steps the candidate index back.
        let commit = self.log.commit_index().get();
        let mut n = quorum_match.get();
        while n > commit && self.log.term_at(LogIndex::new(n)) != Some(self.current_term) {
            n -= 1;
        }
        if n > commit {
            self.commit_and_apply(LogIndex::new(n), effects)?;
        }
        Ok(())
    }

    /// Commits through the log and pushes newly committed entries into
    /// the state machine in strict index order, completing any waiting
    /// submissions.
    fn commit_and_apply(
        &mut self,
        index: LogIndex,
        effects: &mut Vec<RaftEffect>,
    ) -> RaftResult<()> {
        self.log.commit(index)?;
        let commit = self.log.commit_index();

        while self.last_applied < commit {
            let next = LogIndex::new(self.last_applied.get() + 1);
            let applied = match self.log.get(next) {
                Ok(entry) if entry.kind == EntryKind::Command => {
                    match self.state_machine.apply(&entry) {
                        Ok(result) => Some(Ok(result)),
                        Err(e) => {
                            warn!(index = next.get(), error = %e, "state machine rejected entry");
                            Some(Err(e))
                        }
                    }
                }
                Ok(_) => None,
                Err(LogError::NotFound { .. }) => None,
                Err(e) => return Err(e.into()),
            };
            self.last_applied = next;

            if let Role::Leader(state) = &mut self.role {
                if let Some(submission) = state.waiters.remove(&next.get()) {
                    let response = match applied {
                        Some(Ok(result)) => {
                            SubmitResponse::ok(Some(result), Some(self.config.local_id))
                        }
                        Some(Err(_)) => SubmitResponse::error(
                            RaftErrorKind::Application,
                            Some(self.config.local_id),
                        ),
                        None => SubmitResponse::ok(None, Some(self.config.local_id)),
                    };
                    effects.push(RaftEffect::CompleteSubmit {
                        submission,
                        response,
                    });
                }
            }
        }

        // Advertise the new commit index through the membership view.
        let commit = self.log.commit_index();
        self.members.update(self.config.local_id, |m| {
            m.commit_index = commit;
            m.version += 1;
        });
        Ok(())
    }

    // ------------------------------------------------------------------
    // Gossip internals
    // ------------------------------------------------------------------

    fn send_sync(&mut self, peer: MemberId, require_entries: bool, effects: &mut Vec<RaftEffect>) {
        let peer_commit = self
            .members
            .get(peer)
            .map_or_else(|| LogIndex::new(0), |m| m.commit_index);

        let mut entries = Vec::new();
        let mut bytes = 0u64;
        let commit = self.log.commit_index();
        let mut index = LogIndex::new(peer_commit.get() + 1);
        while index <= commit && bytes < SYNC_BATCH_BYTES_MAX {
            match self.log.get(index) {
                Ok(entry) => {
                    bytes += entry.encoded_len();
                    entries.push(entry);
                }
                // Skipped or compacted slots travel as gaps.
                Err(LogError::NotFound { .. } | LogError::IndexOutOfBounds { .. }) => {}
                Err(e) => {
                    warn!(index = index.get(), error = %e, "skipping unreadable entry in sync");
                }
            }
            index = index.next();
        }

        if require_entries && entries.is_empty() {
            return;
        }

        let request = SyncRequest {
            term: self.current_term,
            leader: self.leader,
            log_index: peer_commit,
            members: self.members.to_vec(),
            entries,
        };
        debug!(peer = %peer, from = peer_commit.get() + 1, "sending sync");
        effects.push(RaftEffect::Send {
            to: peer,
            request: Request::Sync(request),
        });
    }

    // ------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------

    fn local_query(&self, key: &Bytes, payload: &Bytes) -> SubmitResponse {
        match self.state_machine.query(key, payload) {
            Ok(result) => SubmitResponse::ok(Some(result), self.leader),
            Err(e) => {
                warn!(error = %e, "query rejected by state machine");
                SubmitResponse::error(RaftErrorKind::Application, self.leader)
            }
        }
    }

    fn active_peers(&self) -> Vec<MemberId> {
        self.members
            .active_ids()
            .into_iter()
            .filter(|&id| id != self.config.local_id)
            .collect()
    }

    fn poll_quorum_reached(&self) -> bool {
        match &self.role {
            Role::Follower { polls, polling } => {
                *polling && polls.len() >= self.members.quorum_size()
            }
            _ => false,
        }
    }

    fn last_index(&self) -> LogIndex {
        self.log.last_index().unwrap_or_else(|| LogIndex::new(0))
    }

    fn last_log_position(&self) -> (LogIndex, TermId) {
        let last = self.last_index();
        let term = if last.get() == 0 {
            TermId::new(0)
        } else {
            self.log.term_at(last).unwrap_or_else(|| TermId::new(0))
        };
        (last, term)
    }

    fn log_up_to_date(&self, other_term: TermId, other_index: LogIndex) -> bool {
        let (my_index, my_term) = self.last_log_position();
        other_term > my_term || (other_term == my_term && other_index >= my_index)
    }

    fn check_thread(&self) {
        debug_assert!(
            self.owner
                .map_or(true, |owner| owner == std::thread::current().id()),
            "raft context touched off its executor thread"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commit::ApplyError;
    use crate::member::Member;
    use copycat_log::MemoryStorage;
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct KvInner {
        data: HashMap<Vec<u8>, Bytes>,
        applied: Vec<u64>,
    }

    /// Key-value state machine sharing its state with the test body.
    #[derive(Clone, Default)]
    struct SharedKv(Arc<Mutex<KvInner>>);

    impl SharedKv {
        fn get(&self, key: &[u8]) -> Option<Bytes> {
            self.0.lock().unwrap().data.get(key).cloned()
        }

        fn put(&self, key: &[u8], value: &[u8]) {
            self.0
                .lock()
                .unwrap()
                .data
                .insert(key.to_vec(), Bytes::copy_from_slice(value));
        }

        fn applied(&self) -> Vec<u64> {
            self.0.lock().unwrap().applied.clone()
        }
    }

    impl StateMachine for SharedKv {
        fn apply(&mut self, entry: &Entry) -> Result<Bytes, ApplyError> {
            let mut inner = self.0.lock().unwrap();
            inner.data.insert(entry.key.to_vec(), entry.payload.clone());
            inner.applied.push(entry.index.get());
            Ok(Bytes::from_static(b"ok"))
        }

        fn query(&self, key: &Bytes, _payload: &Bytes) -> Result<Bytes, ApplyError> {
            self.0
                .lock()
                .unwrap()
                .data
                .get(key.as_ref())
                .cloned()
                .ok_or_else(|| ApplyError::new("key not found"))
        }
    }

    fn three_active() -> Vec<Member> {
        vec![
            Member::new(MemberId::new(1), MemberKind::Active, "127.0.0.1:5001"),
            Member::new(MemberId::new(2), MemberKind::Active, "127.0.0.1:5002"),
            Member::new(MemberId::new(3), MemberKind::Active, "127.0.0.1:5003"),
        ]
    }

    fn make_context(
        id: u32,
        members: Vec<Member>,
    ) -> (RaftContext<MemoryStorage>, SharedKv) {
        let kv = SharedKv::default();
        let config = RaftConfig::new(MemberId::new(id), members).with_seed(7);
        let log_config = LogConfig::new(format!("/raft/{id}"), "copycat");
        let mut context = RaftContext::new(
            config,
            MemoryStorage::new(),
            log_config,
            Box::new(kv.clone()),
        )
        .unwrap();
        context.bind();
        (context, kv)
    }

    /// Walks a three-member context through pre-vote and election until it
    /// leads.
    fn make_leader(context: &mut RaftContext<MemoryStorage>) {
        context.open().unwrap();
        context.handle_election_timeout(0).unwrap();
        context
            .handle_poll_response(MemberId::new(2), PollResponse::ok(TermId::new(0), true), 0)
            .unwrap();
        assert_eq!(context.role_kind(), RoleKind::Candidate);
        context
            .handle_vote_response(
                MemberId::new(2),
                VoteResponse::ok(context.current_term(), true),
                0,
            )
            .unwrap();
        assert!(context.is_leader());
    }

    fn make_entry(index: u64, term: u64, key: &str, payload: &str) -> Entry {
        Entry::new(
            LogIndex::new(index),
            TermId::new(term),
            EntryKind::Command,
            0,
            Bytes::copy_from_slice(key.as_bytes()),
            Bytes::copy_from_slice(payload.as_bytes()),
        )
        .unwrap()
    }

    fn submit_command(key: &str, payload: &str) -> SubmitRequest {
        SubmitRequest {
            operation: Operation::Command {
                key: Bytes::copy_from_slice(key.as_bytes()),
                payload: Bytes::copy_from_slice(payload.as_bytes()),
            },
        }
    }

    fn completed(effects: &[RaftEffect], submission: u64) -> Option<&SubmitResponse> {
        effects.iter().find_map(|e| match e {
            RaftEffect::CompleteSubmit {
                submission: s,
                response,
            } if *s == submission => Some(response),
            _ => None,
        })
    }

    #[test]
    fn test_open_enters_follower() {
        let (mut context, _) = make_context(1, three_active());
        let effects = context.open().unwrap();

        assert_eq!(context.role_kind(), RoleKind::Follower);
        assert_eq!(context.current_term(), TermId::new(0));
        assert!(context.leader().is_none());
        assert!(effects
            .iter()
            .any(|e| matches!(e, RaftEffect::ResetElectionTimer)));
    }

    #[test]
    fn test_election_timeout_opens_poll_round() {
        let (mut context, _) = make_context(1, three_active());
        context.open().unwrap();

        let effects = context.handle_election_timeout(0).unwrap();

        // Still a follower: pre-vote does not bump the term.
        assert_eq!(context.role_kind(), RoleKind::Follower);
        assert_eq!(context.current_term(), TermId::new(0));

        let polls: Vec<_> = effects
            .iter()
            .filter(|e| matches!(e, RaftEffect::Send { request: Request::Poll(_), .. }))
            .collect();
        assert_eq!(polls.len(), 2);
    }

    #[test]
    fn test_poll_quorum_starts_election() {
        let (mut context, _) = make_context(1, three_active());
        context.open().unwrap();
        context.handle_election_timeout(0).unwrap();

        let effects = context
            .handle_poll_response(MemberId::new(2), PollResponse::ok(TermId::new(0), true), 0)
            .unwrap();

        assert_eq!(context.role_kind(), RoleKind::Candidate);
        assert_eq!(context.current_term(), TermId::new(1));
        let votes: Vec<_> = effects
            .iter()
            .filter(|e| matches!(e, RaftEffect::Send { request: Request::Vote(_), .. }))
            .collect();
        assert_eq!(votes.len(), 2);
    }

    #[test]
    fn test_vote_quorum_elects_leader() {
        let (mut context, _) = make_context(1, three_active());
        make_leader(&mut context);

        assert_eq!(context.leader(), Some(MemberId::new(1)));
        // The no-op entry for the new term is in the log.
        assert_eq!(context.log().last_index().unwrap().get(), 1);
        assert_eq!(
            context.log().get(LogIndex::new(1)).unwrap().kind,
            EntryKind::NoOp
        );
    }

    #[test]
    fn test_single_node_elects_and_commits_immediately() {
        let members = vec![Member::new(
            MemberId::new(1),
            MemberKind::Active,
            "127.0.0.1:5001",
        )];
        let (mut context, kv) = make_context(1, members);
        context.open().unwrap();
        context.handle_election_timeout(0).unwrap();
        assert!(context.is_leader());

        let effects = context
            .handle_submit(submit_command("foo", "1"), 42, 100)
            .unwrap();

        let response = completed(&effects, 42).expect("submit completed");
        assert_eq!(response.status, Status::Ok);
        assert_eq!(context.commit_index().get(), 2);
        assert_eq!(context.last_applied().get(), 2);
        assert_eq!(kv.get(b"foo").unwrap(), Bytes::from_static(b"1"));
    }

    #[test]
    fn test_vote_granted_once_per_term() {
        let (mut context, _) = make_context(1, three_active());
        context.open().unwrap();

        let request = VoteRequest {
            term: TermId::new(1),
            candidate: MemberId::new(2),
            last_log_index: LogIndex::new(0),
            last_log_term: TermId::new(0),
        };
        let (response, _) = context.handle_vote(&request).unwrap();
        assert!(response.granted);

        // A different candidate in the same term is rejected.
        let rival = VoteRequest {
            term: TermId::new(1),
            candidate: MemberId::new(3),
            last_log_index: LogIndex::new(0),
            last_log_term: TermId::new(0),
        };
        let (response, _) = context.handle_vote(&rival).unwrap();
        assert!(!response.granted);

        // The same candidate is re-granted.
        let (response, _) = context.handle_vote(&request).unwrap();
        assert!(response.granted);
    }

    #[test]
    fn test_vote_rejected_for_stale_log() {
        let (mut context, _) = make_context(1, three_active());
        context.open().unwrap();

        // Local log holds two entries of term 2.
        let append = AppendRequest {
            term: TermId::new(2),
            leader: MemberId::new(3),
            prev_log_index: LogIndex::new(0),
            prev_log_term: TermId::new(0),
            entries: vec![make_entry(1, 2, "a", "1"), make_entry(2, 2, "b", "2")],
            commit_index: LogIndex::new(0),
        };
        context.handle_append(&append).unwrap();

        // A candidate with a shorter same-term log is rejected.
        let request = VoteRequest {
            term: TermId::new(3),
            candidate: MemberId::new(2),
            last_log_index: LogIndex::new(1),
            last_log_term: TermId::new(2),
        };
        let (response, _) = context.handle_vote(&request).unwrap();
        assert!(!response.granted);

        // A candidate with a higher last term is granted.
        let request = VoteRequest {
            term: TermId::new(3),
            candidate: MemberId::new(2),
            last_log_index: LogIndex::new(1),
            last_log_term: TermId::new(3),
        };
        let (response, _) = context.handle_vote(&request).unwrap();
        assert!(response.granted);
    }

    #[test]
    fn test_append_stores_and_applies_entries() {
        let (mut context, kv) = make_context(1, three_active());
        context.open().unwrap();

        let append = AppendRequest {
            term: TermId::new(1),
            leader: MemberId::new(2),
            prev_log_index: LogIndex::new(0),
            prev_log_term: TermId::new(0),
            entries: vec![make_entry(1, 1, "x", "10")],
            commit_index: LogIndex::new(1),
        };
        let (response, effects) = context.handle_append(&append).unwrap();

        assert!(response.succeeded);
        assert_eq!(response.log_index.get(), 1);
        assert_eq!(context.leader(), Some(MemberId::new(2)));
        assert!(effects
            .iter()
            .any(|e| matches!(e, RaftEffect::ResetElectionTimer)));

        assert_eq!(context.commit_index().get(), 1);
        assert_eq!(kv.get(b"x").unwrap(), Bytes::from_static(b"10"));
        assert_eq!(kv.applied(), vec![1]);
    }

    #[test]
    fn test_append_rejects_stale_term() {
        let (mut context, _) = make_context(1, three_active());
        context.open().unwrap();

        // Adopt term 3 via a vote request.
        let vote = VoteRequest {
            term: TermId::new(3),
            candidate: MemberId::new(2),
            last_log_index: LogIndex::new(0),
            last_log_term: TermId::new(0),
        };
        context.handle_vote(&vote).unwrap();

        let append = AppendRequest {
            term: TermId::new(2),
            leader: MemberId::new(3),
            prev_log_index: LogIndex::new(0),
            prev_log_term: TermId::new(0),
            entries: Vec::new(),
            commit_index: LogIndex::new(0),
        };
        let (response, _) = context.handle_append(&append).unwrap();
        assert!(!response.succeeded);
        assert_eq!(response.term, TermId::new(3));
    }

    #[test]
    fn test_append_log_mismatch_reports_last_index() {
        let (mut context, _) = make_context(1, three_active());
        context.open().unwrap();

        let append = AppendRequest {
            term: TermId::new(1),
            leader: MemberId::new(2),
            prev_log_index: LogIndex::new(5),
            prev_log_term: TermId::new(1),
            entries: Vec::new(),
            commit_index: LogIndex::new(0),
        };
        let (response, _) = context.handle_append(&append).unwrap();

        assert!(!response.succeeded);
        assert_eq!(response.log_index.get(), 0);
    }

    #[test]
    fn test_append_truncates_divergent_suffix() {
        let (mut context, _) = make_context(1, three_active());
        context.open().unwrap();

        // Three uncommitted entries of term 1.
        let append = AppendRequest {
            term: TermId::new(1),
            leader: MemberId::new(2),
            prev_log_index: LogIndex::new(0),
            prev_log_term: TermId::new(0),
            entries: vec![
                make_entry(1, 1, "a", "1"),
                make_entry(2, 1, "b", "2"),
                make_entry(3, 1, "c", "3"),
            ],
            commit_index: LogIndex::new(1),
        };
        context.handle_append(&append).unwrap();

        // A new leader overwrites indexes 2..3 with term 2 entries.
        let append = AppendRequest {
            term: TermId::new(2),
            leader: MemberId::new(3),
            prev_log_index: LogIndex::new(1),
            prev_log_term: TermId::new(1),
            entries: vec![make_entry(2, 2, "b", "20")],
            commit_index: LogIndex::new(2),
        };
        let (response, _) = context.handle_append(&append).unwrap();

        assert!(response.succeeded);
        assert_eq!(response.log_index.get(), 2);
        let entry = context.log().get(LogIndex::new(2)).unwrap();
        assert_eq!(entry.term, TermId::new(2));
        assert_eq!(entry.payload, Bytes::from_static(b"20"));
        assert!(context.log().get(LogIndex::new(3)).is_err());
    }

    #[test]
    fn test_candidate_yields_to_leader_same_term() {
        let (mut context, _) = make_context(1, three_active());
        context.open().unwrap();
        context.handle_election_timeout(0).unwrap();
        context
            .handle_poll_response(MemberId::new(2), PollResponse::ok(TermId::new(0), true), 0)
            .unwrap();
        assert_eq!(context.role_kind(), RoleKind::Candidate);

        let append = AppendRequest {
            term: context.current_term(),
            leader: MemberId::new(2),
            prev_log_index: LogIndex::new(0),
            prev_log_term: TermId::new(0),
            entries: Vec::new(),
            commit_index: LogIndex::new(0),
        };
        let (response, _) = context.handle_append(&append).unwrap();

        assert!(response.succeeded);
        assert_eq!(context.role_kind(), RoleKind::Follower);
        assert_eq!(context.leader(), Some(MemberId::new(2)));
    }

    #[test]
    fn test_leader_steps_down_and_fails_inflight_submit() {
        let (mut context, _) = make_context(1, three_active());
        make_leader(&mut context);

        // A command is appended but cannot commit without peers.
        let effects = context
            .handle_submit(submit_command("foo", "1"), 7, 100)
            .unwrap();
        assert!(completed(&effects, 7).is_none());

        // A higher-term heartbeat arrives from a new leader.
        let append = AppendRequest {
            term: TermId::new(2),
            leader: MemberId::new(2),
            prev_log_index: LogIndex::new(0),
            prev_log_term: TermId::new(0),
            entries: Vec::new(),
            commit_index: LogIndex::new(0),
        };
        let (response, effects) = context.handle_append(&append).unwrap();

        assert!(response.succeeded);
        assert_eq!(context.role_kind(), RoleKind::Follower);
        let failed = completed(&effects, 7).expect("in-flight submit failed");
        assert_eq!(failed.status, Status::Error);
        assert_eq!(failed.error, Some(RaftErrorKind::NoLeader));
    }

    #[test]
    fn test_replication_commits_on_quorum() {
        let (mut context, kv) = make_context(1, three_active());
        make_leader(&mut context);

        let effects = context
            .handle_submit(submit_command("foo", "1"), 9, 100)
            .unwrap();
        // Appends go out to both peers.
        let sends = effects
            .iter()
            .filter(|e| matches!(e, RaftEffect::Send { request: Request::Append(_), .. }))
            .count();
        assert_eq!(sends, 2);

        // One peer acking (leader + peer = quorum of 2) commits both the
        // no-op and the command.
        let ack = AppendResponse::ok(context.current_term(), true, LogIndex::new(2));
        let effects = context
            .handle_append_response(MemberId::new(2), ack, 150)
            .unwrap();

        assert_eq!(context.commit_index().get(), 2);
        let response = completed(&effects, 9).expect("submit completed");
        assert_eq!(response.status, Status::Ok);
        assert_eq!(response.result, Some(Bytes::from_static(b"ok")));
        assert_eq!(kv.get(b"foo").unwrap(), Bytes::from_static(b"1"));
    }

    #[test]
    fn test_rejection_rewinds_and_resends() {
        let (mut context, _) = make_context(1, three_active());
        make_leader(&mut context);
        context
            .handle_submit(submit_command("foo", "1"), 1, 100)
            .unwrap();

        // Peer 2 rejects: its log is empty.
        let nack = AppendResponse::ok(context.current_term(), false, LogIndex::new(0));
        let effects = context
            .handle_append_response(MemberId::new(2), nack, 150)
            .unwrap();

        // The retry starts from the beginning of the log.
        let resent = effects.iter().find_map(|e| match e {
            RaftEffect::Send {
                to,
                request: Request::Append(request),
            } if *to == MemberId::new(2) => Some(request),
            _ => None,
        });
        let resent = resent.expect("append resent");
        assert_eq!(resent.prev_log_index.get(), 0);
        assert_eq!(resent.entries.len(), 2);
    }

    #[test]
    fn test_serializable_query_served_locally() {
        let (mut context, kv) = make_context(1, three_active());
        context.open().unwrap();
        kv.put(b"color", b"green");

        let request = SubmitRequest {
            operation: Operation::Query {
                key: Bytes::from_static(b"color"),
                payload: Bytes::new(),
                consistency: Consistency::Serializable,
            },
        };
        let effects = context.handle_submit(request, 3, 0).unwrap();

        let response = completed(&effects, 3).expect("query completed");
        assert_eq!(response.status, Status::Ok);
        assert_eq!(response.result, Some(Bytes::from_static(b"green")));
    }

    #[test]
    fn test_submit_to_non_leader_redirects() {
        let (mut context, _) = make_context(1, three_active());
        context.open().unwrap();

        // Learn the leader from a heartbeat.
        let append = AppendRequest {
            term: TermId::new(1),
            leader: MemberId::new(3),
            prev_log_index: LogIndex::new(0),
            prev_log_term: TermId::new(0),
            entries: Vec::new(),
            commit_index: LogIndex::new(0),
        };
        context.handle_append(&append).unwrap();

        let effects = context
            .handle_submit(submit_command("foo", "1"), 5, 0)
            .unwrap();
        let response = completed(&effects, 5).expect("submit rejected");
        assert_eq!(response.status, Status::Error);
        assert_eq!(response.error, Some(RaftErrorKind::NoLeader));
        assert_eq!(response.leader, Some(MemberId::new(3)));
    }

    #[test]
    fn test_strict_query_waits_for_quorum_round() {
        let (mut context, kv) = make_context(1, three_active());
        make_leader(&mut context);
        kv.put(b"color", b"blue");

        let request = SubmitRequest {
            operation: Operation::Query {
                key: Bytes::from_static(b"color"),
                payload: Bytes::new(),
                consistency: Consistency::LinearizableStrict,
            },
        };
        let effects = context.handle_submit(request, 11, 100).unwrap();
        assert!(completed(&effects, 11).is_none(), "must wait for a round");

        // Next heartbeat round, acked by a quorum.
        context.handle_heartbeat_tick(200).unwrap();
        let ack = AppendResponse::ok(context.current_term(), true, LogIndex::new(1));
        let effects = context
            .handle_append_response(MemberId::new(2), ack, 250)
            .unwrap();

        let response = completed(&effects, 11).expect("strict query completed");
        assert_eq!(response.result, Some(Bytes::from_static(b"blue")));
    }

    #[test]
    fn test_lease_query_served_within_lease() {
        let (mut context, kv) = make_context(1, three_active());
        make_leader(&mut context);
        kv.put(b"color", b"red");

        // Renew the lease via a quorum ack.
        context.handle_heartbeat_tick(100).unwrap();
        let ack = AppendResponse::ok(context.current_term(), true, LogIndex::new(1));
        context
            .handle_append_response(MemberId::new(2), ack, 120)
            .unwrap();

        let request = SubmitRequest {
            operation: Operation::Query {
                key: Bytes::from_static(b"color"),
                payload: Bytes::new(),
                consistency: Consistency::LinearizableLease,
            },
        };

        // Inside the lease window: served immediately.
        let effects = context.handle_submit(request.clone(), 21, 200).unwrap();
        assert!(completed(&effects, 21).is_some());

        // Far past the lease window: queued behind a quorum round.
        let effects = context.handle_submit(request, 22, 100_000).unwrap();
        assert!(completed(&effects, 22).is_none());
    }

    #[test]
    fn test_passive_rejects_consensus_rpcs() {
        let mut members = three_active();
        members.push(Member::new(
            MemberId::new(4),
            MemberKind::Passive,
            "127.0.0.1:5004",
        ));
        let (mut context, _) = make_context(4, members);
        context.open().unwrap();
        assert_eq!(context.role_kind(), RoleKind::Passive);

        let append = AppendRequest {
            term: TermId::new(1),
            leader: MemberId::new(1),
            prev_log_index: LogIndex::new(0),
            prev_log_term: TermId::new(0),
            entries: Vec::new(),
            commit_index: LogIndex::new(0),
        };
        let (response, _) = context.handle_append(&append).unwrap();
        assert_eq!(response.error, Some(RaftErrorKind::IllegalMemberState));

        let vote = VoteRequest {
            term: TermId::new(1),
            candidate: MemberId::new(1),
            last_log_index: LogIndex::new(0),
            last_log_term: TermId::new(0),
        };
        let (response, _) = context.handle_vote(&vote).unwrap();
        assert_eq!(response.error, Some(RaftErrorKind::IllegalMemberState));

        let poll = PollRequest {
            term: TermId::new(1),
            candidate: MemberId::new(1),
            last_log_index: LogIndex::new(0),
            last_log_term: TermId::new(0),
        };
        let (response, _) = context.handle_poll(&poll).unwrap();
        assert_eq!(response.error, Some(RaftErrorKind::IllegalMemberState));

        // The passive member never campaigns.
        let effects = context.handle_election_timeout(0).unwrap();
        assert!(effects.is_empty());
        assert_eq!(context.role_kind(), RoleKind::Passive);
    }

    #[test]
    fn test_sync_appends_committed_entries() {
        let mut members = three_active();
        members.push(Member::new(
            MemberId::new(4),
            MemberKind::Passive,
            "127.0.0.1:5004",
        ));
        let (mut context, kv) = make_context(4, members.clone());
        context.open().unwrap();

        let request = SyncRequest {
            term: TermId::new(1),
            leader: Some(MemberId::new(1)),
            log_index: LogIndex::new(0),
            members: members.clone(),
            entries: vec![make_entry(1, 1, "a", "1"), make_entry(2, 1, "b", "2")],
        };
        let (response, _) = context.handle_sync(request).unwrap();

        assert_eq!(response.status, Status::Ok);
        assert_eq!(context.commit_index().get(), 2);
        assert_eq!(context.last_applied().get(), 2);
        assert_eq!(kv.get(b"b").unwrap(), Bytes::from_static(b"2"));
        assert_eq!(context.leader(), Some(MemberId::new(1)));

        // Already-held entries are not re-applied.
        let request = SyncRequest {
            term: TermId::new(1),
            leader: Some(MemberId::new(1)),
            log_index: LogIndex::new(2),
            members,
            entries: vec![make_entry(2, 1, "b", "2")],
        };
        context.handle_sync(request).unwrap();
        assert_eq!(kv.applied(), vec![1, 2]);
    }

    #[test]
    fn test_passive_gossip_round_targets_distinct_peers() {
        let mut members = three_active();
        members.push(Member::new(
            MemberId::new(4),
            MemberKind::Passive,
            "127.0.0.1:5004",
        ));
        members.push(Member::new(
            MemberId::new(5),
            MemberKind::Passive,
            "127.0.0.1:5005",
        ));
        let (mut context, _) = make_context(4, members);
        context.open().unwrap();

        let effects = context.handle_heartbeat_tick(0).unwrap();
        let mut targets: Vec<u32> = effects
            .iter()
            .filter_map(|e| match e {
                RaftEffect::Send {
                    to,
                    request: Request::Sync(_),
                } => Some(to.get()),
                _ => None,
            })
            .collect();
        assert_eq!(targets.len(), 3);
        targets.sort_unstable();
        targets.dedup();
        assert_eq!(targets.len(), 3, "gossip targets must be distinct");
    }

    #[test]
    fn test_leader_syncs_passive_members_on_tick() {
        let mut members = three_active();
        members.push(Member::new(
            MemberId::new(4),
            MemberKind::Passive,
            "127.0.0.1:5004",
        ));
        let (mut context, _) = make_context(1, members);
        make_leader(&mut context);

        let effects = context.handle_heartbeat_tick(100).unwrap();
        let sync_targets: Vec<u32> = effects
            .iter()
            .filter_map(|e| match e {
                RaftEffect::Send {
                    to,
                    request: Request::Sync(_),
                } => Some(to.get()),
                _ => None,
            })
            .collect();
        assert_eq!(sync_targets, vec![4]);
    }

    #[test]
    fn test_status_reports_term_and_leader() {
        let (mut context, _) = make_context(1, three_active());
        make_leader(&mut context);

        let status = context.handle_status();
        assert_eq!(status.status, Status::Ok);
        assert_eq!(status.term, context.current_term());
        assert_eq!(status.leader, Some(MemberId::new(1)));
    }

    #[test]
    fn test_vote_is_durable_across_reopen() {
        let storage = MemoryStorage::new();
        let config = RaftConfig::new(MemberId::new(1), three_active()).with_seed(3);
        let log_config = LogConfig::new("/raft/shared", "copycat");

        {
            let mut context = RaftContext::new(
                config.clone(),
                storage.clone(),
                log_config.clone(),
                Box::new(SharedKv::default()),
            )
            .unwrap();
            context.bind();
            context.open().unwrap();
            let vote = VoteRequest {
                term: TermId::new(5),
                candidate: MemberId::new(2),
                last_log_index: LogIndex::new(0),
                last_log_term: TermId::new(0),
            };
            let (response, _) = context.handle_vote(&vote).unwrap();
            assert!(response.granted);
        }

        // After a restart the term and vote survive; a rival candidate in
        // the same term is refused.
        let mut context = RaftContext::new(
            config,
            storage,
            log_config,
            Box::new(SharedKv::default()),
        )
        .unwrap();
        context.bind();
        context.open().unwrap();
        assert_eq!(context.current_term(), TermId::new(5));

        let rival = VoteRequest {
            term: TermId::new(5),
            candidate: MemberId::new(3),
            last_log_index: LogIndex::new(0),
            last_log_term: TermId::new(0),
        };
        let (response, _) = context.handle_vote(&rival).unwrap();
        assert!(!response.granted);
    }
}
