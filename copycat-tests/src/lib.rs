//! Copycat tests - deterministic cluster harness and scenarios.
//!
//! This crate drives whole clusters of [`copycat_raft::RaftContext`]s over
//! in-memory storage and an explicit message bus: every message delivery
//! and timer firing is a method call, so elections, replication, crashes,
//! partitions, and gossip run deterministically. Modules:
//!
//! - `cluster`: the harness (nodes, bus, partitions, crashes)
//! - `properties`: invariant checks shared by the scenarios
//! - `scenarios`: end-to-end cluster scenarios
//! - `server_tests`: the real TCP runtime, end to end

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

pub mod cluster;
pub mod properties;

// Test modules (only compiled for tests).
#[cfg(test)]
mod scenarios;
