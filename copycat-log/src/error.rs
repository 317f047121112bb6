//! Log error types.
//!
//! All errors are explicit and typed. Corruption errors are terminal: the
//! owning Raft context closes the log and shuts down when one surfaces.

use copycat_core::LogIndex;
use thiserror::Error;

/// Result type for log operations.
pub type LogResult<T> = Result<T, LogError>;

/// Errors that can occur during log operations.
#[derive(Debug, Error)]
pub enum LogError {
    /// Entry exceeds the maximum configured size.
    #[error("entry too large: {size} bytes exceeds max {max} bytes")]
    EntryTooLarge {
        /// Actual size in bytes.
        size: u64,
        /// Maximum allowed size.
        max: u32,
    },

    /// Segment is full (size or entry count limit reached).
    #[error("segment full: {reason}")]
    SegmentFull {
        /// Why the segment is full.
        reason: &'static str,
    },

    /// CRC checksum mismatch indicates corruption.
    #[error("checksum mismatch at index {index}: expected {expected:#010x}, got {actual:#010x}")]
    ChecksumMismatch {
        /// The entry index where corruption was detected.
        index: LogIndex,
        /// Expected CRC32 value.
        expected: u32,
        /// Actual CRC32 value computed.
        actual: u32,
    },

    /// Entry or descriptor header is invalid.
    #[error("invalid header: {reason}")]
    InvalidHeader {
        /// Why the header is invalid.
        reason: &'static str,
    },

    /// Segment file descriptor disagrees with its filename.
    #[error("descriptor mismatch in {file}: {reason}")]
    DescriptorMismatch {
        /// The offending file name.
        file: String,
        /// What disagreed.
        reason: &'static str,
    },

    /// Recovered segments do not tile the index space contiguously.
    #[error("segment gap: expected first index {expected}, found {found}")]
    SegmentGap {
        /// The index the next segment was expected to start at.
        expected: LogIndex,
        /// The index it actually starts at.
        found: LogIndex,
    },

    /// Recovery detected a truncated entry record (torn write).
    #[error("truncated entry: expected {expected} bytes, found {found} bytes")]
    TruncatedEntry {
        /// Expected record size.
        expected: u32,
        /// Actual bytes available.
        found: u32,
    },

    /// Index out of the log's bounds.
    #[error("index {index} out of bounds (valid range: {first}..={last})")]
    IndexOutOfBounds {
        /// Requested index.
        index: LogIndex,
        /// First valid index.
        first: LogIndex,
        /// Last valid index (inclusive).
        last: LogIndex,
    },

    /// The index is within bounds but holds no entry (skipped or
    /// compacted away).
    #[error("no entry at index {index}")]
    NotFound {
        /// The absent index.
        index: LogIndex,
    },

    /// Truncation point is invalid (before the log or below the commit
    /// watermark).
    #[error("cannot truncate to {index}: {reason}")]
    InvalidTruncate {
        /// The requested truncation point.
        index: LogIndex,
        /// Why it is invalid.
        reason: &'static str,
    },

    /// Compaction preconditions not met.
    #[error("cannot compact segment: {reason}")]
    InvalidCompaction {
        /// Why the segment cannot be compacted.
        reason: &'static str,
    },

    /// Invalid log configuration.
    #[error("invalid configuration: {reason}")]
    InvalidConfig {
        /// Why the configuration is invalid.
        reason: String,
    },

    /// I/O error from underlying storage.
    #[error("I/O error: {operation}: {message}")]
    Io {
        /// What operation was being performed.
        operation: &'static str,
        /// Error message.
        message: String,
    },
}

impl LogError {
    /// Creates an I/O error.
    pub fn io(operation: &'static str, err: impl std::fmt::Display) -> Self {
        Self::Io {
            operation,
            message: err.to_string(),
        }
    }

    /// Returns true if this error indicates data corruption.
    ///
    /// Corruption is fatal: the node closes the log and exits its Raft
    /// context rather than serving from a damaged store.
    #[must_use]
    pub const fn is_corruption(&self) -> bool {
        matches!(
            self,
            Self::ChecksumMismatch { .. }
                | Self::InvalidHeader { .. }
                | Self::DescriptorMismatch { .. }
                | Self::SegmentGap { .. }
        )
    }
}
