//! A single log segment.
//!
//! A segment is a pair of files: a data file holding a descriptor header
//! followed by entry records, and an offset index mapping entry offsets to
//! record positions. Segments are append-only; a per-segment commit
//! watermark tracks how much of the segment is known durable on a quorum.
//!
//! ```text
//! [ SegmentDescriptor | Entry0 | Entry1 | ... | EntryN-1 ]
//! ```

use std::path::{Path, PathBuf};

use bytes::Buf;
use copycat_core::LogIndex;
use tracing::debug;

use crate::descriptor::{SegmentDescriptor, DESCRIPTOR_BYTES};
use crate::entry::Entry;
use crate::error::{LogError, LogResult};
use crate::index::{OffsetIndex, OrderedOffsetIndex, SearchableOffsetIndex};
use crate::pool::BufferPool;
use crate::storage::{Storage, StorageFile};

/// A segment of the replicated log.
pub struct Segment {
    descriptor: SegmentDescriptor,
    file: Box<dyn StorageFile>,
    index: OffsetIndex,
    path: PathBuf,
    index_path: PathBuf,
    write_position: u64,
    /// Highest committed index in this segment; `first_index - 1` when
    /// nothing is committed yet.
    commit_index: u64,
    max_entries: u64,
    sealed: bool,
}

impl Segment {
    /// Creates a fresh segment, writing its descriptor.
    ///
    /// # Errors
    /// Returns an error if the files cannot be created or written.
    pub fn create<S: Storage>(
        storage: &S,
        path: PathBuf,
        index_path: PathBuf,
        descriptor: SegmentDescriptor,
        max_entries: u64,
    ) -> LogResult<Self> {
        let mut file = storage.open(&path)?;

        let mut buf = bytes::BytesMut::with_capacity(DESCRIPTOR_BYTES);
        descriptor.encode(&mut buf);
        file.write_at(0, &buf)?;

        let index_file = storage.open(&index_path)?;
        let index = if descriptor.version.get() == 1 {
            OffsetIndex::Ordered(OrderedOffsetIndex::open(index_file)?)
        } else {
            OffsetIndex::Searchable(SearchableOffsetIndex::open(index_file, None)?)
        };

        debug!(
            id = descriptor.id.get(),
            version = descriptor.version.get(),
            first_index = descriptor.index.get(),
            "created segment"
        );

        Ok(Self {
            commit_index: descriptor.index.get() - 1,
            descriptor,
            file,
            index,
            path,
            index_path,
            write_position: DESCRIPTOR_BYTES as u64,
            max_entries,
            sealed: false,
        })
    }

    /// Loads an existing segment, validating its descriptor against the
    /// identity parsed from its filename.
    ///
    /// # Errors
    /// Returns an error if the descriptor is unreadable or disagrees with
    /// the filename.
    pub fn load<S: Storage>(
        storage: &S,
        path: PathBuf,
        index_path: PathBuf,
        file_id: u64,
        file_version: u64,
        max_entries: u64,
    ) -> LogResult<Self> {
        let file = storage.open(&path)?;
        let descriptor = read_descriptor(file.as_ref(), &path)?;

        if descriptor.id.get() != file_id {
            return Err(LogError::DescriptorMismatch {
                file: file_name(&path),
                reason: "descriptor ID does not match filename ID",
            });
        }
        if descriptor.version.get() != file_version {
            return Err(LogError::DescriptorMismatch {
                file: file_name(&path),
                reason: "descriptor version does not match filename version",
            });
        }

        let index_file = storage.open(&index_path)?;
        let index = if descriptor.version.get() == 1 {
            OffsetIndex::Ordered(OrderedOffsetIndex::open(index_file)?)
        } else {
            let span = u32::try_from(descriptor.range).ok();
            OffsetIndex::Searchable(SearchableOffsetIndex::open(index_file, span)?)
        };

        // Recompute the write position from the last present entry.
        let write_position = match index.last_present_offset() {
            Some(offset) => {
                let position = index.position(offset).expect("present offset has position");
                let mut len_buf = file.read_at(u64::from(position), 4)?;
                u64::from(position) + u64::from(len_buf.get_u32_le())
            }
            None => DESCRIPTOR_BYTES as u64,
        };

        debug!(
            id = descriptor.id.get(),
            version = descriptor.version.get(),
            first_index = descriptor.index.get(),
            entries = index.entry_count(),
            "loaded segment"
        );

        // A locked segment is fully committed by definition.
        let next_offset = u64::from(index.next_offset());
        let commit_index = if descriptor.locked && next_offset > 0 {
            descriptor.index.get() + next_offset - 1
        } else {
            descriptor.index.get() - 1
        };

        Ok(Self {
            descriptor,
            file,
            index,
            path,
            index_path,
            write_position,
            commit_index,
            max_entries,
            sealed: descriptor.locked,
        })
    }

    /// Returns the segment descriptor.
    #[must_use]
    pub const fn descriptor(&self) -> &SegmentDescriptor {
        &self.descriptor
    }

    /// Returns the segment's first log index.
    #[must_use]
    pub const fn first_index(&self) -> LogIndex {
        self.descriptor.index
    }

    /// Returns the next index this segment would assign (accounting for
    /// skipped slots).
    #[must_use]
    pub fn next_index(&self) -> LogIndex {
        LogIndex::new(self.descriptor.index.get() + u64::from(self.index.next_offset()))
    }

    /// Returns the last index covered by this segment (present or
    /// skipped), or `None` if the segment is empty.
    #[must_use]
    pub fn last_index(&self) -> Option<LogIndex> {
        let next = self.index.next_offset();
        if next == 0 {
            None
        } else {
            Some(LogIndex::new(
                self.descriptor.index.get() + u64::from(next) - 1,
            ))
        }
    }

    /// Returns the number of present entries.
    #[must_use]
    pub fn entry_count(&self) -> u64 {
        self.index.entry_count()
    }

    /// Returns the segment's commit watermark (`first_index - 1` when
    /// nothing is committed).
    #[must_use]
    pub const fn commit_index(&self) -> LogIndex {
        LogIndex::new(self.commit_index)
    }

    /// Returns the current size of the data file in bytes.
    #[must_use]
    pub const fn size_bytes(&self) -> u64 {
        self.write_position
    }

    /// Returns true if the segment no longer accepts appends.
    #[must_use]
    pub const fn is_sealed(&self) -> bool {
        self.sealed
    }

    /// Returns true if every covered index is committed.
    #[must_use]
    pub fn is_fully_committed(&self) -> bool {
        self.last_index()
            .map_or(true, |last| self.commit_index >= last.get())
    }

    /// Returns true if an entry (not a skipped slot) exists at `index`.
    #[must_use]
    pub fn contains_index(&self, index: LogIndex) -> bool {
        self.offset_of(index)
            .is_some_and(|offset| self.index.position(offset).is_some())
    }

    /// Returns true if the segment covers `index` (present or skipped).
    #[must_use]
    pub fn covers_index(&self, index: LogIndex) -> bool {
        self.offset_of(index).is_some()
    }

    /// Returns true if an entry of `size` encoded bytes fits.
    #[must_use]
    pub fn has_space_for(&self, size: u64) -> bool {
        if self.sealed {
            return false;
        }
        let data_used = self.write_position - DESCRIPTOR_BYTES as u64;
        data_used + size <= u64::from(self.descriptor.max_segment_size)
            && u64::from(self.index.next_offset()) < self.max_entries
    }

    /// Appends an entry to the segment.
    ///
    /// # Errors
    /// Returns an error if the entry is too large or the segment is full.
    ///
    /// # Panics
    /// Panics if the segment is sealed or the entry index is not the next
    /// expected index.
    pub fn append(&mut self, entry: &Entry, pool: &BufferPool) -> LogResult<LogIndex> {
        assert!(!self.sealed, "cannot append to sealed segment");
        assert_eq!(
            entry.index,
            self.next_index(),
            "entry index must be sequential"
        );

        let size = entry.encoded_len();
        if size > u64::from(self.descriptor.max_entry_size) {
            return Err(LogError::EntryTooLarge {
                size,
                max: self.descriptor.max_entry_size,
            });
        }

        let data_used = self.write_position - DESCRIPTOR_BYTES as u64;
        if data_used + size > u64::from(self.descriptor.max_segment_size) {
            return Err(LogError::SegmentFull {
                reason: "size limit reached",
            });
        }
        if u64::from(self.index.next_offset()) >= self.max_entries {
            return Err(LogError::SegmentFull {
                reason: "entry count limit reached",
            });
        }

        let mut buf = pool.acquire();
        entry.encode(&mut buf);

        self.file.write_at(self.write_position, &buf)?;

        let offset = self.index.next_offset();
        // Safe cast: positions are bounded by the 1 GiB segment cap.
        #[allow(clippy::cast_possible_truncation)]
        let position = self.write_position as u32;
        self.index.append(offset, position)?;
        self.write_position += size;

        Ok(entry.index)
    }

    /// Reads the entry at `index`.
    ///
    /// # Errors
    /// Returns `IndexOutOfBounds` outside the segment's range, `NotFound`
    /// for a skipped or compacted-away slot, and corruption errors for
    /// damaged records.
    pub fn get(&self, index: LogIndex) -> LogResult<Entry> {
        let offset = self.offset_of(index).ok_or_else(|| {
            let last = self.last_index().unwrap_or(self.descriptor.index);
            LogError::IndexOutOfBounds {
                index,
                first: self.descriptor.index,
                last,
            }
        })?;

        let position = self
            .index
            .position(offset)
            .ok_or(LogError::NotFound { index })?;

        let mut len_buf = self.file.read_at(u64::from(position), 4)?;
        let length = len_buf.get_u32_le() as usize;
        let mut record = self.file.read_at(u64::from(position), length)?;
        Entry::decode(&mut record, index)
    }

    /// Skips `count` index slots, recording the gap.
    ///
    /// # Errors
    /// Returns an error if the index has no room for the slots.
    ///
    /// # Panics
    /// Panics if the segment is sealed.
    pub fn skip(&mut self, count: u64) -> LogResult<()> {
        assert!(!self.sealed, "cannot skip in sealed segment");

        if u64::from(self.index.next_offset()) + count > self.max_entries {
            return Err(LogError::SegmentFull {
                reason: "entry count limit reached",
            });
        }
        // Safe cast: slot count is bounded by the entries-per-segment cap.
        #[allow(clippy::cast_possible_truncation)]
        let count = count as u32;
        self.index.skip(count)
    }

    /// Advances the commit watermark to `index` (clamped to the last
    /// covered index). Seals and locks the segment once everything in a
    /// sealed segment is committed.
    ///
    /// # Errors
    /// Returns an error if the descriptor lock cannot be persisted.
    pub fn commit(&mut self, index: LogIndex) -> LogResult<()> {
        let Some(last) = self.last_index() else {
            return Ok(());
        };
        let new_commit = index.get().min(last.get());
        if new_commit > self.commit_index {
            self.commit_index = new_commit;
        }
        if self.sealed && self.is_fully_committed() {
            self.lock()?;
        }
        Ok(())
    }

    /// Seals the segment: no more appends or skips.
    ///
    /// # Errors
    /// Returns an error if sealed data cannot be flushed, or if the lock
    /// cannot be persisted for an already fully committed segment.
    pub fn seal(&mut self) -> LogResult<()> {
        self.sealed = true;
        self.flush()?;
        if self.is_fully_committed() {
            self.lock()?;
        }
        Ok(())
    }

    /// Persists the `locked` flag, marking every entry committed.
    ///
    /// # Errors
    /// Returns an error if the descriptor cannot be rewritten.
    pub fn lock(&mut self) -> LogResult<()> {
        if self.descriptor.locked {
            return Ok(());
        }
        self.descriptor.locked = true;
        let mut buf = bytes::BytesMut::with_capacity(DESCRIPTOR_BYTES);
        self.descriptor.encode(&mut buf);
        self.file.write_at(0, &buf)?;
        self.file.sync()
    }

    /// Removes all entries with index greater than `index`.
    ///
    /// # Errors
    /// Returns an error if `index` would truncate committed entries or the
    /// files cannot be resized.
    ///
    /// # Panics
    /// Panics if the segment is sealed.
    pub fn truncate(&mut self, index: LogIndex) -> LogResult<()> {
        assert!(!self.sealed, "cannot truncate sealed segment");

        if index.get() + 1 >= self.next_index().get() {
            // Nothing above the truncation point.
            return Ok(());
        }
        if index.get() < self.commit_index {
            return Err(LogError::InvalidTruncate {
                index,
                reason: "cannot truncate committed entries",
            });
        }

        if index.get() < self.descriptor.index.get() {
            self.index.clear()?;
            self.write_position = DESCRIPTOR_BYTES as u64;
        } else {
            // Safe cast: in-segment offsets are bounded by the cap.
            #[allow(clippy::cast_possible_truncation)]
            let offset = (index.get() - self.descriptor.index.get()) as u32;
            self.index.truncate(offset)?;
            self.write_position = match self.index.last_present_offset() {
                Some(last) => {
                    let position = self
                        .index
                        .position(last)
                        .expect("present offset has position");
                    let mut len_buf = self.file.read_at(u64::from(position), 4)?;
                    u64::from(position) + u64::from(len_buf.get_u32_le())
                }
                None => DESCRIPTOR_BYTES as u64,
            };
        }
        self.file.set_len(self.write_position)
    }

    /// Flushes data and index writes to durable storage.
    ///
    /// # Errors
    /// Returns an error if either sync fails.
    pub fn flush(&self) -> LogResult<()> {
        self.file.sync()?;
        self.index.sync()
    }

    /// Deletes the segment's files.
    ///
    /// # Errors
    /// Returns an error if a file cannot be removed.
    pub fn delete<S: Storage>(&self, storage: &S) -> LogResult<()> {
        debug!(
            id = self.descriptor.id.get(),
            version = self.descriptor.version.get(),
            "deleting segment"
        );
        storage.remove(&self.path)?;
        storage.remove(&self.index_path)
    }

    /// Marks the segment appendable again after a truncation made it the
    /// tail of the log.
    pub fn unseal(&mut self) {
        self.sealed = false;
    }

    fn offset_of(&self, index: LogIndex) -> Option<u32> {
        let first = self.descriptor.index.get();
        if index.get() < first || index.get() >= self.next_index().get() {
            return None;
        }
        // Safe cast: in-segment offsets are bounded by the cap.
        #[allow(clippy::cast_possible_truncation)]
        let offset = (index.get() - first) as u32;
        Some(offset)
    }
}

fn read_descriptor(file: &dyn StorageFile, path: &Path) -> LogResult<SegmentDescriptor> {
    if file.len()? < DESCRIPTOR_BYTES as u64 {
        return Err(LogError::DescriptorMismatch {
            file: file_name(path),
            reason: "file too small for descriptor",
        });
    }
    let mut buf = file.read_at(0, DESCRIPTOR_BYTES)?;
    SegmentDescriptor::decode(&mut buf)
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map_or_else(|| path.display().to_string(), |n| n.to_string_lossy().into_owned())
}
