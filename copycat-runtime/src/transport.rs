//! TCP transport for member communication.
//!
//! Each member listens on its configured address. Outbound connections are
//! established lazily on first send and re-established on failure. Every
//! outbound request carries a correlation id; a per-connection reader task
//! matches responses back to their waiting callers. Inbound requests are
//! handed to the server event loop together with a one-shot reply channel;
//! the connection task writes the reply frame when the loop answers.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::{Buf, BytesMut};
use copycat_core::MemberId;
use copycat_raft::{Request, Response};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, info, warn};

use crate::codec::{decode_frame, encode_request, encode_response, Frame};
use crate::transport_trait::{Transport, TransportError, TransportResult};

/// Read buffer growth increment.
const READ_CHUNK: usize = 64 * 1024;

/// Inbound request queue depth.
const INBOUND_QUEUE_DEPTH: usize = 1024;

/// An inbound request awaiting an answer from the event loop.
pub struct InboundRequest {
    /// The decoded request.
    pub request: Request,
    /// Channel for the event loop's response.
    pub reply: oneshot::Sender<Response>,
}

/// Outstanding outbound requests on one connection.
type PendingMap = Arc<Mutex<HashMap<u64, oneshot::Sender<Response>>>>;

/// A live outbound connection to a peer.
struct PeerConnection {
    writer: Arc<Mutex<OwnedWriteHalf>>,
    pending: PendingMap,
}

/// TCP transport.
pub struct TcpTransport {
    local_id: MemberId,
    peers: HashMap<MemberId, String>,
    connections: Mutex<HashMap<MemberId, Arc<PeerConnection>>>,
    correlation: AtomicU64,
}

impl TcpTransport {
    /// Binds the listener and starts accepting inbound connections,
    /// delivering decoded requests to `inbound`.
    ///
    /// # Errors
    /// Returns an error if the listen address cannot be bound.
    pub async fn start(
        local_id: MemberId,
        listen_addr: SocketAddr,
        peers: HashMap<MemberId, String>,
    ) -> TransportResult<(Arc<Self>, mpsc::Receiver<InboundRequest>)> {
        let listener =
            TcpListener::bind(listen_addr)
                .await
                .map_err(|e| TransportError::Unreachable {
                    peer: local_id,
                    message: format!("bind {listen_addr}: {e}"),
                })?;
        info!(member = %local_id, addr = %listen_addr, "transport listening");

        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_QUEUE_DEPTH);

        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, remote)) => {
                        debug!(%remote, "accepted connection");
                        let inbound = inbound_tx.clone();
                        tokio::spawn(serve_connection(stream, inbound));
                    }
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                    }
                }
            }
        });

        let transport = Arc::new(Self {
            local_id,
            peers,
            connections: Mutex::new(HashMap::new()),
            correlation: AtomicU64::new(1),
        });
        Ok((transport, inbound_rx))
    }

    async fn connection(&self, to: MemberId) -> TransportResult<Arc<PeerConnection>> {
        {
            let connections = self.connections.lock().await;
            if let Some(connection) = connections.get(&to) {
                return Ok(Arc::clone(connection));
            }
        }

        let address = self
            .peers
            .get(&to)
            .ok_or(TransportError::UnknownPeer(to))?
            .clone();
        let stream =
            TcpStream::connect(&address)
                .await
                .map_err(|e| TransportError::Unreachable {
                    peer: to,
                    message: e.to_string(),
                })?;
        stream.set_nodelay(true).ok();
        let (reader, writer) = stream.into_split();

        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let connection = Arc::new(PeerConnection {
            writer: Arc::new(Mutex::new(writer)),
            pending: Arc::clone(&pending),
        });

        tokio::spawn(read_responses(reader, pending));

        let mut connections = self.connections.lock().await;
        connections.insert(to, Arc::clone(&connection));
        debug!(member = %self.local_id, peer = %to, %address, "connected to peer");
        Ok(connection)
    }

    async fn drop_connection(&self, to: MemberId) {
        let mut connections = self.connections.lock().await;
        connections.remove(&to);
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn request(&self, to: MemberId, request: Request) -> TransportResult<Response> {
        let connection = self.connection(to).await?;
        let correlation_id = self.correlation.fetch_add(1, Ordering::Relaxed);
        let frame = encode_request(correlation_id, &request)?;

        let (reply_tx, reply_rx) = oneshot::channel();
        {
            let mut pending = connection.pending.lock().await;
            pending.insert(correlation_id, reply_tx);
        }

        let write_result = {
            let mut writer = connection.writer.lock().await;
            writer.write_all(&frame).await
        };
        if let Err(e) = write_result {
            connection.pending.lock().await.remove(&correlation_id);
            self.drop_connection(to).await;
            return Err(TransportError::Unreachable {
                peer: to,
                message: e.to_string(),
            });
        }

        match reply_rx.await {
            Ok(response) => Ok(response),
            Err(_) => {
                // Reader task died: the connection is gone.
                self.drop_connection(to).await;
                Err(TransportError::ConnectionClosed(to))
            }
        }
    }
}

/// Reads response frames from an outbound connection and completes their
/// waiting requests.
async fn read_responses(mut reader: OwnedReadHalf, pending: PendingMap) {
    let mut buffer = BytesMut::with_capacity(READ_CHUNK);
    loop {
        match read_frames(&mut reader, &mut buffer).await {
            Ok(Some(Frame::Response {
                correlation_id,
                response,
            })) => {
                let sender = pending.lock().await.remove(&correlation_id);
                match sender {
                    Some(sender) => {
                        let _ = sender.send(response);
                    }
                    None => warn!(correlation_id, "response with no waiting request"),
                }
            }
            Ok(Some(Frame::Request { .. })) => {
                warn!("request frame on an outbound connection");
            }
            Ok(None) | Err(_) => break,
        }
    }
    // Fail every waiter so callers observe the drop.
    pending.lock().await.clear();
}

/// Serves one inbound connection: decodes request frames, forwards them to
/// the event loop, and writes back its responses.
async fn serve_connection(stream: TcpStream, inbound: mpsc::Sender<InboundRequest>) {
    stream.set_nodelay(true).ok();
    let (mut reader, writer) = stream.into_split();
    let writer = Arc::new(Mutex::new(writer));
    let mut buffer = BytesMut::with_capacity(READ_CHUNK);

    loop {
        match read_frames(&mut reader, &mut buffer).await {
            Ok(Some(Frame::Request {
                correlation_id,
                request,
            })) => {
                let (reply_tx, reply_rx) = oneshot::channel();
                if inbound
                    .send(InboundRequest {
                        request,
                        reply: reply_tx,
                    })
                    .await
                    .is_err()
                {
                    // Event loop is gone; close the connection.
                    break;
                }
                let writer = Arc::clone(&writer);
                tokio::spawn(async move {
                    if let Ok(response) = reply_rx.await {
                        match encode_response(correlation_id, &response) {
                            Ok(frame) => {
                                let mut writer = writer.lock().await;
                                if let Err(e) = writer.write_all(&frame).await {
                                    warn!(error = %e, "failed to write response");
                                }
                            }
                            Err(e) => warn!(error = %e, "failed to encode response"),
                        }
                    }
                });
            }
            Ok(Some(Frame::Response { .. })) => {
                warn!("response frame on an inbound connection");
            }
            Ok(None) | Err(_) => break,
        }
    }
}

/// Reads from the socket until a complete frame is buffered, then decodes
/// it. Returns `None` on a clean close.
async fn read_frames(
    reader: &mut OwnedReadHalf,
    buffer: &mut BytesMut,
) -> TransportResult<Option<Frame>> {
    loop {
        if let Some((frame, consumed)) = decode_frame(&buffer[..])? {
            buffer.advance(consumed);
            return Ok(Some(frame));
        }

        let mut chunk = [0u8; READ_CHUNK];
        let n = reader
            .read(&mut chunk)
            .await
            .map_err(|e| TransportError::Unreachable {
                peer: MemberId::new(0),
                message: e.to_string(),
            })?;
        if n == 0 {
            return Ok(None);
        }
        buffer.extend_from_slice(&chunk[..n]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use copycat_raft::{StatusRequest, StatusResponse};
    use copycat_core::TermId;

    async fn echo_member(
        id: u32,
        addr: &str,
    ) -> (Arc<TcpTransport>, tokio::task::JoinHandle<()>) {
        let (transport, mut inbound) = TcpTransport::start(
            MemberId::new(id),
            addr.parse().unwrap(),
            HashMap::new(),
        )
        .await
        .unwrap();

        // Answer every request with a fixed status response.
        let serve = tokio::spawn(async move {
            while let Some(request) = inbound.recv().await {
                let _ = request.reply.send(Response::Status(StatusResponse::ok(
                    TermId::new(id.into()),
                    Some(MemberId::new(id)),
                )));
            }
        });
        (transport, serve)
    }

    #[tokio::test]
    async fn test_request_response_over_tcp() {
        let (_server, _serve) = echo_member(2, "127.0.0.1:25802").await;

        let mut peers = HashMap::new();
        peers.insert(MemberId::new(2), "127.0.0.1:25802".to_string());
        let (client, _inbound) = TcpTransport::start(
            MemberId::new(1),
            "127.0.0.1:25801".parse().unwrap(),
            peers,
        )
        .await
        .unwrap();

        let response = client
            .request(MemberId::new(2), Request::Status(StatusRequest))
            .await
            .unwrap();
        match response {
            Response::Status(status) => {
                assert_eq!(status.leader, Some(MemberId::new(2)));
                assert_eq!(status.term, TermId::new(2));
            }
            other => panic!("unexpected response: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_unknown_peer_rejected() {
        let (client, _inbound) = TcpTransport::start(
            MemberId::new(1),
            "127.0.0.1:25811".parse().unwrap(),
            HashMap::new(),
        )
        .await
        .unwrap();

        let result = client
            .request(MemberId::new(9), Request::Status(StatusRequest))
            .await;
        assert!(matches!(result, Err(TransportError::UnknownPeer(_))));
    }

    #[tokio::test]
    async fn test_unreachable_peer_errors() {
        let mut peers = HashMap::new();
        peers.insert(MemberId::new(2), "127.0.0.1:1".to_string());
        let (client, _inbound) = TcpTransport::start(
            MemberId::new(1),
            "127.0.0.1:25821".parse().unwrap(),
            peers,
        )
        .await
        .unwrap();

        let result = client
            .request(MemberId::new(2), Request::Status(StatusRequest))
            .await;
        assert!(matches!(result, Err(TransportError::Unreachable { .. })));
    }
}
