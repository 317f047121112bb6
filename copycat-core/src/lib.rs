//! Copycat core - shared identifiers and limits.
//!
//! This crate holds the vocabulary types used by every other Copycat crate:
//! strongly-typed identifiers for terms, log indexes, segments, and cluster
//! members, plus the explicit limits that bound every queue, buffer, and
//! file in the system.

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

pub mod limits;
mod types;

pub use types::{LogIndex, MemberId, SegmentId, TermId, Version};
