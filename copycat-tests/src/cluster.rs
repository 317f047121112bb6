//! Deterministic in-memory cluster harness.
//!
//! A [`Cluster`] holds one [`RaftContext`] per member over per-node
//! [`MemoryStorage`], connected by an explicit message bus. Nothing
//! happens until the test fires a timer or steps the bus, so every
//! election, replication exchange, crash, partition, and gossip round is
//! reproducible.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use copycat_core::MemberId;
use copycat_log::{Entry, LogConfig, MemoryStorage};
use copycat_raft::{
    ApplyError, Member, MemberKind, Operation, RaftConfig, RaftContext, RaftEffect, Request,
    Response, StateMachine, SubmitRequest, SubmitResponse,
};

/// Upper bound on bus deliveries per drain, to catch livelock.
const MAX_STEPS: usize = 200_000;

#[derive(Default)]
struct KvInner {
    data: HashMap<Vec<u8>, Bytes>,
    applied: Vec<u64>,
}

/// A key-value state machine whose state stays visible to the test body.
#[derive(Clone, Default)]
pub struct TestStateMachine {
    inner: Arc<Mutex<KvInner>>,
}

impl TestStateMachine {
    /// Returns the value stored under `key`.
    #[must_use]
    pub fn value(&self, key: &[u8]) -> Option<Bytes> {
        self.inner.lock().unwrap().data.get(key).cloned()
    }

    /// Returns the indexes applied so far, in application order.
    #[must_use]
    pub fn applied_indexes(&self) -> Vec<u64> {
        self.inner.lock().unwrap().applied.clone()
    }

    /// Returns the number of applied command entries.
    #[must_use]
    pub fn applied_count(&self) -> usize {
        self.inner.lock().unwrap().applied.len()
    }
}

impl StateMachine for TestStateMachine {
    fn apply(&mut self, entry: &Entry) -> Result<Bytes, ApplyError> {
        let mut inner = self.inner.lock().unwrap();
        inner.data.insert(entry.key.to_vec(), entry.payload.clone());
        inner.applied.push(entry.index.get());
        Ok(Bytes::from_static(b"ok"))
    }

    fn query(&self, key: &Bytes, _payload: &Bytes) -> Result<Bytes, ApplyError> {
        self.inner
            .lock()
            .unwrap()
            .data
            .get(key.as_ref())
            .cloned()
            .ok_or_else(|| ApplyError::new("key not found"))
    }
}

enum Payload {
    Request { correlation: u64, request: Request },
    Response { correlation: u64, response: Response },
}

struct Envelope {
    from: u32,
    to: u32,
    payload: Payload,
}

struct Node {
    context: RaftContext<MemoryStorage>,
    storage: MemoryStorage,
    state_machine: TestStateMachine,
    raft_config: RaftConfig,
    log_config: LogConfig,
    completions: Vec<(u64, SubmitResponse)>,
    remote_submissions: HashMap<u64, (u32, u64)>,
    next_submission: u64,
}

/// A deterministic multi-member cluster.
pub struct Cluster {
    nodes: BTreeMap<u32, Node>,
    bus: VecDeque<Envelope>,
    blocked: HashSet<(u32, u32)>,
    crashed: HashSet<u32>,
    now_ms: u64,
    next_correlation: u64,
    leaders_by_term: BTreeMap<u64, HashSet<u32>>,
}

impl Cluster {
    /// Builds a cluster of `active` voting members (ids starting at 1)
    /// followed by `passive` gossip-only members, and opens every
    /// context.
    ///
    /// # Panics
    /// Panics if a context fails to open.
    #[must_use]
    pub fn new(active: u32, passive: u32) -> Self {
        let mut members = Vec::new();
        for id in 1..=active {
            members.push(Member::new(
                MemberId::new(id),
                MemberKind::Active,
                format!("10.0.0.{id}:5000"),
            ));
        }
        for id in active + 1..=active + passive {
            members.push(Member::new(
                MemberId::new(id),
                MemberKind::Passive,
                format!("10.0.0.{id}:5000"),
            ));
        }

        let mut cluster = Self {
            nodes: BTreeMap::new(),
            bus: VecDeque::new(),
            blocked: HashSet::new(),
            crashed: HashSet::new(),
            now_ms: 1_000,
            next_correlation: 1,
            leaders_by_term: BTreeMap::new(),
        };

        for id in 1..=active + passive {
            let node = Self::build_node(id, members.clone(), MemoryStorage::new());
            cluster.nodes.insert(id, node);
        }
        cluster
    }

    fn build_node(id: u32, members: Vec<Member>, storage: MemoryStorage) -> Node {
        let raft_config = RaftConfig::new(MemberId::new(id), members)
            .with_seed(u64::from(id) * 7919 + 13);
        let log_config = LogConfig::new(format!("/node-{id}"), "copycat");
        let state_machine = TestStateMachine::default();
        let mut context = RaftContext::new(
            raft_config.clone(),
            storage.clone(),
            log_config.clone(),
            Box::new(state_machine.clone()),
        )
        .expect("context creation failed");
        context.bind();
        context.open().expect("context open failed");

        Node {
            context,
            storage,
            state_machine,
            raft_config,
            log_config,
            completions: Vec::new(),
            remote_submissions: HashMap::new(),
            next_submission: 1,
        }
    }

    /// Returns the context of a member.
    ///
    /// # Panics
    /// Panics if the member is unknown.
    #[must_use]
    pub fn context(&self, id: u32) -> &RaftContext<MemoryStorage> {
        &self.nodes[&id].context
    }

    /// Returns the state machine of a member.
    ///
    /// # Panics
    /// Panics if the member is unknown.
    #[must_use]
    pub fn state_machine(&self, id: u32) -> &TestStateMachine {
        &self.nodes[&id].state_machine
    }

    /// Returns all member ids.
    #[must_use]
    pub fn member_ids(&self) -> Vec<u32> {
        self.nodes.keys().copied().collect()
    }

    /// Returns the ids of members that are alive (not crashed).
    #[must_use]
    pub fn alive_ids(&self) -> Vec<u32> {
        self.nodes
            .keys()
            .copied()
            .filter(|id| !self.crashed.contains(id))
            .collect()
    }

    /// Returns the leadership history: term to the members that led it.
    #[must_use]
    pub const fn leaders_by_term(&self) -> &BTreeMap<u64, HashSet<u32>> {
        &self.leaders_by_term
    }

    /// Returns the current leader, if exactly one node leads.
    #[must_use]
    pub fn current_leader(&self) -> Option<u32> {
        let mut leaders = self
            .nodes
            .iter()
            .filter(|(id, node)| !self.crashed.contains(id) && node.context.is_leader())
            .map(|(id, _)| *id);
        let leader = leaders.next();
        leader.filter(|_| leaders.next().is_none())
    }

    /// Advances the cluster clock.
    pub fn advance_time(&mut self, ms: u64) {
        self.now_ms += ms;
    }

    /// Fires the election timer of a member.
    ///
    /// # Panics
    /// Panics if the member is unknown or its handler fails.
    pub fn fire_election(&mut self, id: u32) {
        let now = self.now_ms;
        let effects = self
            .nodes
            .get_mut(&id)
            .expect("unknown member")
            .context
            .handle_election_timeout(now)
            .expect("election timeout failed");
        self.process_effects(id, effects);
    }

    /// Fires the heartbeat/gossip tick of a member.
    ///
    /// # Panics
    /// Panics if the member is unknown or its handler fails.
    pub fn tick(&mut self, id: u32) {
        self.advance_time(1);
        let now = self.now_ms;
        let effects = self
            .nodes
            .get_mut(&id)
            .expect("unknown member")
            .context
            .handle_heartbeat_tick(now)
            .expect("heartbeat tick failed");
        self.process_effects(id, effects);
    }

    /// Fires the heartbeat tick of every alive member, then drains the
    /// bus.
    pub fn tick_all(&mut self) {
        for id in self.alive_ids() {
            self.tick(id);
        }
        self.run_until_idle();
    }

    /// Elects a member: fires its election timer and drains the bus.
    ///
    /// # Panics
    /// Panics if the member did not win.
    pub fn elect(&mut self, id: u32) {
        self.fire_election(id);
        self.run_until_idle();
        assert!(
            self.nodes[&id].context.is_leader(),
            "member {id} failed to win the election"
        );
    }

    /// Submits an operation on a member, returning the submission handle.
    ///
    /// # Panics
    /// Panics if the member is unknown or its handler fails.
    pub fn submit(&mut self, id: u32, operation: Operation) -> u64 {
        let now = self.now_ms;
        let node = self.nodes.get_mut(&id).expect("unknown member");
        let submission = node.next_submission;
        node.next_submission += 1;
        let effects = node
            .context
            .handle_submit(SubmitRequest { operation }, submission, now)
            .expect("submit failed");
        self.process_effects(id, effects);
        submission
    }

    /// Submits a `key = value` command on a member.
    pub fn submit_command(&mut self, id: u32, key: &str, value: &str) -> u64 {
        self.submit(
            id,
            Operation::Command {
                key: Bytes::copy_from_slice(key.as_bytes()),
                payload: Bytes::copy_from_slice(value.as_bytes()),
            },
        )
    }

    /// Takes the completion recorded for a submission, if any.
    pub fn take_completion(&mut self, id: u32, submission: u64) -> Option<SubmitResponse> {
        let node = self.nodes.get_mut(&id)?;
        let position = node.completions.iter().position(|(s, _)| *s == submission)?;
        Some(node.completions.remove(position).1)
    }

    /// Crashes a member: its messages stop flowing until restart.
    pub fn crash(&mut self, id: u32) {
        self.crashed.insert(id);
    }

    /// Restarts a crashed member from its surviving storage with a fresh
    /// state machine.
    ///
    /// # Panics
    /// Panics if the member is unknown.
    pub fn restart(&mut self, id: u32) {
        self.crashed.remove(&id);
        let node = self.nodes.get_mut(&id).expect("unknown member");
        let storage = node.storage.clone();
        let raft_config = node.raft_config.clone();
        let log_config = node.log_config.clone();

        let state_machine = TestStateMachine::default();
        let mut context = RaftContext::new(
            raft_config.clone(),
            storage.clone(),
            log_config.clone(),
            Box::new(state_machine.clone()),
        )
        .expect("context recovery failed");
        context.bind();
        context.open().expect("context open failed");

        node.context = context;
        node.storage = storage;
        node.state_machine = state_machine;
        node.raft_config = raft_config;
        node.log_config = log_config;
        node.completions.clear();
        node.remote_submissions.clear();
    }

    /// Partitions the cluster: messages between `left` and `right` are
    /// dropped (in both directions) until [`Self::heal`].
    pub fn partition(&mut self, left: &[u32], right: &[u32]) {
        for &a in left {
            for &b in right {
                self.blocked.insert((a, b));
                self.blocked.insert((b, a));
            }
        }
    }

    /// Removes all partitions.
    pub fn heal(&mut self) {
        self.blocked.clear();
    }

    /// Delivers one message from the bus. Returns false when idle.
    pub fn step(&mut self) -> bool {
        let Some(envelope) = self.bus.pop_front() else {
            return false;
        };
        self.deliver(envelope);
        true
    }

    /// Delivers messages until the bus is empty.
    ///
    /// # Panics
    /// Panics if the bus fails to quiesce.
    pub fn run_until_idle(&mut self) {
        let mut steps = 0;
        while self.step() {
            steps += 1;
            assert!(steps < MAX_STEPS, "message bus did not quiesce");
        }
    }

    fn next_correlation(&mut self) -> u64 {
        let correlation = self.next_correlation;
        self.next_correlation += 1;
        correlation
    }

    fn process_effects(&mut self, id: u32, effects: Vec<RaftEffect>) {
        for effect in effects {
            match effect {
                RaftEffect::Send { to, request } => {
                    let correlation = self.next_correlation();
                    self.bus.push_back(Envelope {
                        from: id,
                        to: to.get(),
                        payload: Payload::Request {
                            correlation,
                            request,
                        },
                    });
                }
                RaftEffect::CompleteSubmit {
                    submission,
                    response,
                } => {
                    let node = self.nodes.get_mut(&id).expect("unknown member");
                    if let Some((from, correlation)) =
                        node.remote_submissions.remove(&submission)
                    {
                        self.bus.push_back(Envelope {
                            from: id,
                            to: from,
                            payload: Payload::Response {
                                correlation,
                                response: Response::Submit(response),
                            },
                        });
                    } else {
                        node.completions.push((submission, response));
                    }
                }
                RaftEffect::ResetElectionTimer | RaftEffect::RoleChanged { .. } => {}
            }
        }
        self.record_leadership(id);
    }

    fn record_leadership(&mut self, id: u32) {
        let node = &self.nodes[&id];
        if node.context.is_leader() {
            self.leaders_by_term
                .entry(node.context.current_term().get())
                .or_default()
                .insert(id);
        }
    }

    fn deliver(&mut self, envelope: Envelope) {
        // Messages from a crashed sender die with it.
        if self.crashed.contains(&envelope.from) {
            return;
        }
        // A dead or unreachable destination surfaces as a send failure at
        // the sender's transport.
        if self.crashed.contains(&envelope.to)
            || self.blocked.contains(&(envelope.from, envelope.to))
        {
            if matches!(envelope.payload, Payload::Request { .. }) {
                if let Some(node) = self.nodes.get_mut(&envelope.from) {
                    node.context.handle_send_error(MemberId::new(envelope.to));
                }
            }
            return;
        }

        match envelope.payload {
            Payload::Request {
                correlation,
                request,
            } => self.deliver_request(envelope.from, envelope.to, correlation, request),
            Payload::Response {
                correlation,
                response,
            } => self.deliver_response(envelope.from, envelope.to, correlation, response),
        }
    }

    fn deliver_request(&mut self, from: u32, to: u32, correlation: u64, request: Request) {
        let now = self.now_ms;
        let (response, effects) = {
            let node = self.nodes.get_mut(&to).expect("unknown member");
            match request {
                Request::Append(r) => {
                    let (response, effects) = node.context.handle_append(&r).expect("append");
                    (Some(Response::Append(response)), effects)
                }
                Request::Vote(r) => {
                    let (response, effects) = node.context.handle_vote(&r).expect("vote");
                    (Some(Response::Vote(response)), effects)
                }
                Request::Poll(r) => {
                    let (response, effects) = node.context.handle_poll(&r).expect("poll");
                    (Some(Response::Poll(response)), effects)
                }
                Request::Sync(r) => {
                    let (response, effects) = node.context.handle_sync(r).expect("sync");
                    (Some(Response::Sync(response)), effects)
                }
                Request::Status(_) => {
                    (Some(Response::Status(node.context.handle_status())), Vec::new())
                }
                Request::Submit(r) => {
                    let submission = node.next_submission;
                    node.next_submission += 1;
                    node.remote_submissions.insert(submission, (from, correlation));
                    let effects = node
                        .context
                        .handle_submit(r, submission, now)
                        .expect("submit");
                    (None, effects)
                }
            }
        };

        if let Some(response) = response {
            self.bus.push_back(Envelope {
                from: to,
                to: from,
                payload: Payload::Response {
                    correlation,
                    response,
                },
            });
        }
        self.process_effects(to, effects);
    }

    fn deliver_response(&mut self, from: u32, to: u32, correlation: u64, response: Response) {
        let now = self.now_ms;
        let effects = {
            let node = self.nodes.get_mut(&to).expect("unknown member");
            let sender = MemberId::new(from);
            match response {
                Response::Append(r) => node
                    .context
                    .handle_append_response(sender, r, now)
                    .expect("append response"),
                Response::Vote(r) => node
                    .context
                    .handle_vote_response(sender, r, now)
                    .expect("vote response"),
                Response::Poll(r) => node
                    .context
                    .handle_poll_response(sender, r, now)
                    .expect("poll response"),
                Response::Sync(r) => node
                    .context
                    .handle_sync_response(sender, r)
                    .expect("sync response"),
                Response::Submit(r) => {
                    node.completions.push((correlation, r));
                    Vec::new()
                }
                Response::Status(_) => Vec::new(),
            }
        };
        self.process_effects(to, effects);
    }
}
