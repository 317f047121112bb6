//! Copycat log - segmented, append-only replicated log.
//!
//! The log is a totally ordered sequence of entries indexed by a
//! monotonically increasing one-based index. Physically it is an ordered
//! collection of segments, each a pair of files (data + offset index) with
//! a fixed-size descriptor header. Compaction produces a higher-version
//! replacement segment with a retained subset of entries and atomically
//! swaps it in.
//!
//! # Design Principles
//!
//! - **Crash safety**: checksums on every entry, descriptor/filename
//!   agreement checks, version/locked recovery rules for interrupted
//!   compactions
//! - **Explicit limits**: bounded entry sizes, segment sizes, entry counts
//! - **No unsafe code**: safety over performance
//!
//! # Example
//!
//! ```ignore
//! use copycat_log::{Entry, EntryKind, Log, LogConfig, FsStorage};
//! use bytes::Bytes;
//!
//! let config = LogConfig::new("/tmp/copycat", "copycat");
//! let mut log = Log::open(FsStorage::new(), config)?;
//!
//! let index = log.next_index();
//! let entry = Entry::new(index, term, EntryKind::Command, ts,
//!     Bytes::from("key"), Bytes::from("value"))?;
//! log.append(entry)?;
//! log.commit(index)?;
//! let entry = log.get(index)?;
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod descriptor;
mod entry;
mod error;
mod index;
mod log;
mod manager;
mod pool;
mod segment;
mod storage;

pub use descriptor::{SegmentDescriptor, DESCRIPTOR_BYTES};
pub use entry::{Entry, EntryKind, ENTRY_HEADER_SIZE};
pub use error::{LogError, LogResult};
pub use index::{OffsetIndex, OrderedOffsetIndex, SearchableOffsetIndex};
pub use log::{Log, LogConfig};
pub use manager::SegmentManager;
pub use pool::{BufferPool, PooledBuf};
pub use segment::Segment;
pub use storage::{FsStorage, MemoryStorage, Storage, StorageFile};
