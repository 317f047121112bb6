//! Copycat runtime - transport and executor for Copycat nodes.
//!
//! The runtime wires a [`copycat_raft::RaftContext`] to the outside world:
//! a length-prefixed frame codec, a TCP transport carrying correlated
//! request/response envelopes between members, and the single-threaded
//! event loop that owns the context and executes its effects.

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod codec;
mod config;
mod server;
mod transport;
mod transport_trait;

pub use codec::{
    decode_frame, encode_request, encode_response, CodecError, CodecResult, Frame,
};
pub use config::NodeConfig;
pub use server::{RaftServer, ServerError, ServerHandle};
pub use transport::{InboundRequest, TcpTransport};
pub use transport_trait::{Transport, TransportError, TransportResult};
