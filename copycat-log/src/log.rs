//! The log facade.
//!
//! [`Log`] is the public surface of the segmented log: configuration plus
//! the operations the Raft layer drives (append, read, skip, truncate,
//! commit, compact). It delegates segment mechanics to the
//! [`SegmentManager`].

use std::path::PathBuf;

use copycat_core::limits::{
    ENTRIES_PER_SEGMENT_MAX, ENTRY_SIZE_BYTES_MAX, SEGMENT_SIZE_BYTES_MAX,
    SEGMENT_SIZE_BYTES_MIN,
};
use copycat_core::{LogIndex, SegmentId};

use crate::entry::Entry;
use crate::error::{LogError, LogResult};
use crate::manager::SegmentManager;
use crate::segment::Segment;
use crate::storage::Storage;

/// Log configuration.
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Root directory for segment files.
    pub directory: PathBuf,
    /// Log name, used as the segment filename prefix.
    pub name: String,
    /// Hard cap on a single encoded entry in bytes.
    pub max_entry_size: u32,
    /// Soft cap on a segment's data region before rotation.
    pub max_segment_size: u32,
    /// Cap on index slots per segment.
    pub max_entries_per_segment: u64,
}

impl LogConfig {
    /// Creates a configuration with default sizing.
    #[must_use]
    pub fn new(directory: impl Into<PathBuf>, name: impl Into<String>) -> Self {
        Self {
            directory: directory.into(),
            name: name.into(),
            max_entry_size: ENTRY_SIZE_BYTES_MAX,
            max_segment_size: 32 * 1024 * 1024,
            max_entries_per_segment: 1 << 20,
        }
    }

    /// Sets the maximum encoded entry size.
    #[must_use]
    pub const fn with_max_entry_size(mut self, size: u32) -> Self {
        self.max_entry_size = size;
        self
    }

    /// Sets the maximum segment data size.
    #[must_use]
    pub const fn with_max_segment_size(mut self, size: u32) -> Self {
        self.max_segment_size = size;
        self
    }

    /// Sets the maximum index slots per segment.
    #[must_use]
    pub const fn with_max_entries_per_segment(mut self, entries: u64) -> Self {
        self.max_entries_per_segment = entries;
        self
    }

    /// Validates the configuration.
    ///
    /// # Errors
    /// Returns an error if any limit is out of range or inconsistent.
    pub fn validate(&self) -> LogResult<()> {
        if self.name.is_empty() {
            return Err(LogError::InvalidConfig {
                reason: "log name cannot be empty".to_string(),
            });
        }
        if self.max_entry_size == 0 || self.max_entry_size > ENTRY_SIZE_BYTES_MAX + 64 {
            return Err(LogError::InvalidConfig {
                reason: format!("max_entry_size {} out of range", self.max_entry_size),
            });
        }
        if self.max_segment_size < SEGMENT_SIZE_BYTES_MIN
            || self.max_segment_size > SEGMENT_SIZE_BYTES_MAX
        {
            return Err(LogError::InvalidConfig {
                reason: format!("max_segment_size {} out of range", self.max_segment_size),
            });
        }
        if self.max_entry_size > self.max_segment_size {
            return Err(LogError::InvalidConfig {
                reason: "max_entry_size exceeds max_segment_size".to_string(),
            });
        }
        if self.max_entries_per_segment == 0
            || self.max_entries_per_segment > ENTRIES_PER_SEGMENT_MAX
        {
            return Err(LogError::InvalidConfig {
                reason: format!(
                    "max_entries_per_segment {} out of range",
                    self.max_entries_per_segment
                ),
            });
        }
        Ok(())
    }
}

/// The segmented, append-only replicated log.
pub struct Log<S: Storage> {
    manager: SegmentManager<S>,
}

impl<S: Storage> Log<S> {
    /// Opens or recovers a log in the configured directory.
    ///
    /// # Errors
    /// Returns an error on invalid configuration, storage failure, or
    /// corruption.
    pub fn open(storage: S, config: LogConfig) -> LogResult<Self> {
        Ok(Self {
            manager: SegmentManager::open(storage, config)?,
        })
    }

    /// Returns the first index covered by the log.
    #[must_use]
    pub fn first_index(&self) -> LogIndex {
        self.manager.first_index()
    }

    /// Returns the last index covered by the log, or `None` if empty.
    #[must_use]
    pub fn last_index(&self) -> Option<LogIndex> {
        self.manager.last_index()
    }

    /// Returns the index the next append will receive.
    #[must_use]
    pub fn next_index(&self) -> LogIndex {
        self.manager.next_index()
    }

    /// Returns the log-wide commit index.
    #[must_use]
    pub const fn commit_index(&self) -> LogIndex {
        self.manager.commit_index()
    }

    /// Returns true if the log covers no indexes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.manager.last_index().is_none()
    }

    /// Appends an entry. The entry's index must be [`Self::next_index`].
    ///
    /// # Errors
    /// Returns an error if the entry is over the size cap or storage
    /// fails.
    pub fn append(&mut self, entry: &Entry) -> LogResult<LogIndex> {
        self.manager.append(entry)
    }

    /// Reads the entry at `index`.
    ///
    /// # Errors
    /// Returns `IndexOutOfBounds` outside the log, `NotFound` for skipped
    /// or compacted slots, and corruption errors for damaged records.
    pub fn get(&self, index: LogIndex) -> LogResult<Entry> {
        self.manager.get(index)
    }

    /// Returns true if an entry exists at `index`.
    #[must_use]
    pub fn contains_index(&self, index: LogIndex) -> bool {
        self.manager.contains_index(index)
    }

    /// Returns the term of the entry at `index`, if one exists.
    #[must_use]
    pub fn term_at(&self, index: LogIndex) -> Option<copycat_core::TermId> {
        self.manager.get(index).ok().map(|e| e.term)
    }

    /// Advances the expected next index by `count`, recording a gap.
    ///
    /// # Errors
    /// Returns an error if storage fails.
    pub fn skip(&mut self, count: u64) -> LogResult<()> {
        self.manager.skip(count)
    }

    /// Removes all entries with index greater than `index`.
    ///
    /// # Errors
    /// Returns an error if `index` precedes the log or the commit
    /// watermark.
    pub fn truncate(&mut self, index: LogIndex) -> LogResult<()> {
        self.manager.truncate(index)
    }

    /// Commits all entries up to `index`, cascading across segments.
    ///
    /// # Errors
    /// Returns an error if storage fails.
    pub fn commit(&mut self, index: LogIndex) -> LogResult<()> {
        self.manager.commit(index)
    }

    /// Compacts the segment identified by `id`, retaining only entries
    /// `retain` keeps.
    ///
    /// # Errors
    /// Returns an error if the segment is unknown, not fully committed, or
    /// storage fails.
    pub fn compact(
        &mut self,
        id: SegmentId,
        retain: &mut dyn FnMut(&Entry) -> bool,
    ) -> LogResult<()> {
        self.manager.compact(id, retain)
    }

    /// Returns the segments in order, for inspection and compaction
    /// planning.
    pub fn segments(&self) -> impl Iterator<Item = &Segment> {
        self.manager.segments()
    }

    /// Flushes all buffered writes to durable storage.
    ///
    /// # Errors
    /// Returns an error if a sync fails.
    pub fn flush(&self) -> LogResult<()> {
        self.manager.flush()
    }

    /// Flushes and closes the log.
    ///
    /// # Errors
    /// Returns an error if a sync fails.
    pub fn close(&mut self) -> LogResult<()> {
        self.manager.close()
    }

    /// Deletes all log data.
    ///
    /// # Errors
    /// Returns an error if storage fails.
    pub fn delete(&mut self) -> LogResult<()> {
        self.manager.delete()
    }
}
