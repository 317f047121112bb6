//! The Copycat node server.
//!
//! [`RaftServer`] runs one Raft context on a dedicated thread with a
//! current-thread tokio runtime. The event loop owns the context - all
//! state mutation happens on that single thread - and multiplexes over
//! inbound transport requests, responses to our own requests, local
//! submissions, the randomized election timer, and the heartbeat tick.
//! I/O completions from the transport are re-dispatched onto the loop
//! through channels before they touch state.

use std::collections::HashMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use copycat_core::MemberId;
use copycat_log::FsStorage;
use copycat_raft::{
    Operation, RaftContext, RaftEffect, Request, Response, StateMachine, StatusResponse,
    SubmitRequest, SubmitResponse,
};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::config::NodeConfig;
use crate::transport::{InboundRequest, TcpTransport};
use crate::transport_trait::Transport;

/// Command queue depth for local submissions.
const COMMAND_QUEUE_DEPTH: usize = 1024;

/// Server errors.
#[derive(Debug, Error)]
pub enum ServerError {
    /// The server failed to start.
    #[error("server startup failed: {0}")]
    Startup(String),

    /// The server has shut down.
    #[error("server closed")]
    Closed,
}

/// Commands from handles into the event loop.
enum ServerCommand {
    Submit {
        request: SubmitRequest,
        reply: oneshot::Sender<SubmitResponse>,
    },
    Status {
        reply: oneshot::Sender<StatusResponse>,
    },
    Shutdown,
}

/// Completions from outbound request tasks back onto the loop thread.
enum PeerEvent {
    Response { from: MemberId, response: Response },
    SendFailed { to: MemberId },
}

/// Where a pending submission's answer goes.
enum SubmitReply {
    Local(oneshot::Sender<SubmitResponse>),
    Remote(oneshot::Sender<Response>),
}

impl SubmitReply {
    fn complete(self, response: SubmitResponse) {
        match self {
            Self::Local(reply) => {
                let _ = reply.send(response);
            }
            Self::Remote(reply) => {
                let _ = reply.send(Response::Submit(response));
            }
        }
    }
}

/// A cloneable handle for talking to a running server.
#[derive(Clone)]
pub struct ServerHandle {
    commands: mpsc::Sender<ServerCommand>,
}

impl ServerHandle {
    /// Submits an operation and awaits its outcome.
    ///
    /// # Errors
    /// Returns [`ServerError::Closed`] if the server is gone.
    pub async fn submit(&self, operation: Operation) -> Result<SubmitResponse, ServerError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(ServerCommand::Submit {
                request: SubmitRequest { operation },
                reply,
            })
            .await
            .map_err(|_| ServerError::Closed)?;
        response.await.map_err(|_| ServerError::Closed)
    }

    /// Probes the node's term and leader.
    ///
    /// # Errors
    /// Returns [`ServerError::Closed`] if the server is gone.
    pub async fn status(&self) -> Result<StatusResponse, ServerError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(ServerCommand::Status { reply })
            .await
            .map_err(|_| ServerError::Closed)?;
        response.await.map_err(|_| ServerError::Closed)
    }

    /// Asks the server to shut down.
    pub async fn shutdown(&self) {
        let _ = self.commands.send(ServerCommand::Shutdown).await;
    }
}

/// A running Copycat node.
pub struct RaftServer {
    handle: ServerHandle,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl RaftServer {
    /// Starts the node: opens the log, binds the transport, and spawns
    /// the event loop on its own thread.
    ///
    /// # Errors
    /// Returns an error if the context or transport cannot be set up.
    ///
    /// # Panics
    /// Panics if the executor thread cannot be spawned.
    pub fn start(
        config: NodeConfig,
        state_machine: Box<dyn StateMachine>,
    ) -> Result<Self, ServerError> {
        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_QUEUE_DEPTH);
        let (startup_tx, startup_rx) = std::sync::mpsc::channel::<Result<(), String>>();

        let thread = std::thread::Builder::new()
            .name(format!("copycat-{}", config.local_id))
            .spawn(move || {
                let runtime = tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                    .expect("failed to build runtime");
                runtime.block_on(run_event_loop(config, state_machine, commands_rx, startup_tx));
            })
            .expect("failed to spawn executor thread");

        match startup_rx.recv() {
            Ok(Ok(())) => Ok(Self {
                handle: ServerHandle {
                    commands: commands_tx,
                },
                thread: Some(thread),
            }),
            Ok(Err(message)) => Err(ServerError::Startup(message)),
            Err(_) => Err(ServerError::Startup("executor thread died".to_string())),
        }
    }

    /// Returns a handle for submitting operations.
    #[must_use]
    pub fn handle(&self) -> ServerHandle {
        self.handle.clone()
    }

    /// Asks the server to stop and waits for its thread to exit.
    pub fn stop(mut self) {
        let handle = self.handle.clone();
        // The loop may already be gone; the join below is what matters.
        let _ = handle.commands.try_send(ServerCommand::Shutdown);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

/// Milliseconds since the Unix epoch, for entry timestamps and leases.
fn now_ms() -> u64 {
    // Safe cast: fits u64 for the next half-billion years.
    #[allow(clippy::cast_possible_truncation)]
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64;
    now
}

#[allow(clippy::too_many_lines)]
async fn run_event_loop(
    config: NodeConfig,
    state_machine: Box<dyn StateMachine>,
    mut commands: mpsc::Receiver<ServerCommand>,
    startup: std::sync::mpsc::Sender<Result<(), String>>,
) {
    // Build the context on the loop thread so the thread guard holds.
    let mut context = match RaftContext::new(
        config.raft_config(),
        FsStorage::new(),
        config.log_config(),
        state_machine,
    ) {
        Ok(context) => context,
        Err(e) => {
            let _ = startup.send(Err(e.to_string()));
            return;
        }
    };
    context.bind();

    let (transport, mut inbound) =
        match TcpTransport::start(config.local_id, config.listen_addr, config.peer_addresses())
            .await
        {
            Ok(started) => started,
            Err(e) => {
                let _ = startup.send(Err(e.to_string()));
                return;
            }
        };

    let (peer_tx, mut peer_rx) = mpsc::channel::<PeerEvent>(COMMAND_QUEUE_DEPTH);
    let mut pending_submits: HashMap<u64, SubmitReply> = HashMap::new();
    let mut next_submission: u64 = 1;
    let mut election_deadline =
        Instant::now() + Duration::from_millis(config.election_timeout_ms * 2);
    let mut heartbeat = tokio::time::interval(Duration::from_millis(config.heartbeat_interval_ms));

    let effects = match context.open() {
        Ok(effects) => effects,
        Err(e) => {
            let _ = startup.send(Err(e.to_string()));
            return;
        }
    };
    execute_effects(
        effects,
        &mut context,
        &transport,
        &peer_tx,
        &mut pending_submits,
        &mut election_deadline,
    );
    let _ = startup.send(Ok(()));

    loop {
        let step = tokio::select! {
            () = tokio::time::sleep_until(election_deadline) => {
                // Re-arm even if the role ignores the timeout, so a
                // passive member does not spin.
                election_deadline = Instant::now()
                    + Duration::from_millis(context.random_election_timeout_ms());
                context.handle_election_timeout(now_ms())
            }
            _ = heartbeat.tick() => {
                context.handle_heartbeat_tick(now_ms())
            }
            Some(event) = peer_rx.recv() => match event {
                PeerEvent::Response { from, response } => {
                    dispatch_response(&mut context, from, response)
                }
                PeerEvent::SendFailed { to } => {
                    context.handle_send_error(to);
                    Ok(Vec::new())
                }
            },
            Some(request) = inbound.recv() => {
                handle_inbound(
                    &mut context,
                    request,
                    &mut next_submission,
                    &mut pending_submits,
                )
            }
            Some(command) = commands.recv() => match command {
                ServerCommand::Submit { request, reply } => {
                    let submission = next_submission;
                    next_submission += 1;
                    pending_submits.insert(submission, SubmitReply::Local(reply));
                    context.handle_submit(request, submission, now_ms())
                }
                ServerCommand::Status { reply } => {
                    let _ = reply.send(context.handle_status());
                    Ok(Vec::new())
                }
                ServerCommand::Shutdown => {
                    info!(member = %context.local_id(), "shutting down");
                    if let Err(e) = context.close() {
                        warn!(error = %e, "close failed");
                    }
                    return;
                }
            },
        };

        match step {
            Ok(effects) => execute_effects(
                effects,
                &mut context,
                &transport,
                &peer_tx,
                &mut pending_submits,
                &mut election_deadline,
            ),
            Err(e) => {
                // Storage corruption (or any storage failure) tears the
                // context down rather than serving from a damaged store.
                error!(member = %context.local_id(), error = %e, "fatal context error");
                let _ = context.close();
                return;
            }
        }
    }
}

fn handle_inbound(
    context: &mut RaftContext<FsStorage>,
    inbound: InboundRequest,
    next_submission: &mut u64,
    pending_submits: &mut HashMap<u64, SubmitReply>,
) -> copycat_raft::RaftResult<Vec<RaftEffect>> {
    let InboundRequest { request, reply } = inbound;
    match request {
        Request::Append(r) => {
            let (response, effects) = context.handle_append(&r)?;
            let _ = reply.send(Response::Append(response));
            Ok(effects)
        }
        Request::Vote(r) => {
            let (response, effects) = context.handle_vote(&r)?;
            let _ = reply.send(Response::Vote(response));
            Ok(effects)
        }
        Request::Poll(r) => {
            let (response, effects) = context.handle_poll(&r)?;
            let _ = reply.send(Response::Poll(response));
            Ok(effects)
        }
        Request::Sync(r) => {
            let (response, effects) = context.handle_sync(r)?;
            let _ = reply.send(Response::Sync(response));
            Ok(effects)
        }
        Request::Status(_) => {
            let _ = reply.send(Response::Status(context.handle_status()));
            Ok(Vec::new())
        }
        Request::Submit(r) => {
            let submission = *next_submission;
            *next_submission += 1;
            pending_submits.insert(submission, SubmitReply::Remote(reply));
            context.handle_submit(r, submission, now_ms())
        }
    }
}

fn dispatch_response(
    context: &mut RaftContext<FsStorage>,
    from: MemberId,
    response: Response,
) -> copycat_raft::RaftResult<Vec<RaftEffect>> {
    match response {
        Response::Append(r) => context.handle_append_response(from, r, now_ms()),
        Response::Vote(r) => context.handle_vote_response(from, r, now_ms()),
        Response::Poll(r) => context.handle_poll_response(from, r, now_ms()),
        Response::Sync(r) => context.handle_sync_response(from, r),
        Response::Submit(_) | Response::Status(_) => Ok(Vec::new()),
    }
}

fn execute_effects(
    effects: Vec<RaftEffect>,
    context: &mut RaftContext<FsStorage>,
    transport: &std::sync::Arc<TcpTransport>,
    peer_tx: &mpsc::Sender<PeerEvent>,
    pending_submits: &mut HashMap<u64, SubmitReply>,
    election_deadline: &mut Instant,
) {
    for effect in effects {
        match effect {
            RaftEffect::ResetElectionTimer => {
                *election_deadline = Instant::now()
                    + Duration::from_millis(context.random_election_timeout_ms());
            }
            RaftEffect::Send { to, request } => {
                let transport = std::sync::Arc::clone(transport);
                let peer_tx = peer_tx.clone();
                tokio::spawn(async move {
                    match transport.request(to, request).await {
                        Ok(response) => {
                            let _ = peer_tx.send(PeerEvent::Response { from: to, response }).await;
                        }
                        Err(e) => {
                            debug!(peer = %to, error = %e, "request failed");
                            let _ = peer_tx.send(PeerEvent::SendFailed { to }).await;
                        }
                    }
                });
            }
            RaftEffect::CompleteSubmit {
                submission,
                response,
            } => {
                if let Some(reply) = pending_submits.remove(&submission) {
                    reply.complete(response);
                } else {
                    warn!(submission, "completion for unknown submission");
                }
            }
            RaftEffect::RoleChanged { role } => {
                info!(member = %context.local_id(), ?role, "role changed");
            }
        }
    }
}
