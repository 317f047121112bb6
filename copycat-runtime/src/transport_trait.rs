//! The pluggable transport seam.
//!
//! The server drives its peers through this trait rather than a concrete
//! socket type, keeping the message-passing layer replaceable.
//! Deterministic cluster tests sidestep it entirely and feed the context
//! handlers directly.

use async_trait::async_trait;
use copycat_core::MemberId;
use copycat_raft::{Request, Response};
use thiserror::Error;

/// Transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The peer is not in the transport's address book.
    #[error("unknown peer: {0}")]
    UnknownPeer(MemberId),

    /// Connecting to or talking to the peer failed.
    #[error("peer {peer} unreachable: {message}")]
    Unreachable {
        /// The peer.
        peer: MemberId,
        /// Failure description.
        message: String,
    },

    /// The connection dropped before a response arrived.
    #[error("connection to {0} closed")]
    ConnectionClosed(MemberId),

    /// Encoding or decoding a frame failed.
    #[error("codec error: {0}")]
    Codec(#[from] crate::codec::CodecError),

    /// The transport is shut down.
    #[error("transport is shutdown")]
    Shutdown,
}

/// Result type for transport operations.
pub type TransportResult<T> = Result<T, TransportError>;

/// A message-passing layer carrying framed request/response envelopes
/// between members.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Sends a request to a peer and awaits its response.
    ///
    /// # Errors
    /// Returns an error if the peer is unknown or unreachable; protocol
    /// errors travel inside the response.
    async fn request(&self, to: MemberId, request: Request) -> TransportResult<Response>;
}
