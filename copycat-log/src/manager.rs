//! Segment manager.
//!
//! The segment manager keeps track of the ordered collection of segments
//! backing a log: loading them from disk on open, rotating to a new
//! segment when the active one fills, cascading commit watermarks across
//! segment boundaries, and compacting fully committed segments into
//! higher-version replacements.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use copycat_core::{LogIndex, SegmentId, Version};
use tracing::{debug, info, warn};

use crate::descriptor::{SegmentDescriptor, DESCRIPTOR_BYTES};
use crate::entry::Entry;
use crate::error::{LogError, LogResult};
use crate::log::LogConfig;
use crate::pool::BufferPool;
use crate::segment::Segment;
use crate::storage::Storage;

/// Manages the segments of a log.
pub struct SegmentManager<S: Storage> {
    storage: Arc<S>,
    config: LogConfig,
    pool: Arc<BufferPool>,
    /// Segments keyed by first index.
    segments: BTreeMap<u64, Segment>,
    commit_index: u64,
}

impl<S: Storage> SegmentManager<S> {
    /// Opens the manager, recovering existing segments from the log
    /// directory or creating the initial segment.
    ///
    /// # Errors
    /// Returns an error on invalid configuration, storage failure, or
    /// corruption (descriptor/filename disagreement, non-contiguous
    /// segments).
    pub fn open(storage: S, config: LogConfig) -> LogResult<Self> {
        config.validate()?;

        let storage = Arc::new(storage);
        storage.create_dir_all(&config.directory)?;

        let mut manager = Self {
            storage,
            config,
            pool: Arc::new(BufferPool::new()),
            segments: BTreeMap::new(),
            commit_index: 0,
        };

        for segment in manager.load_segments()? {
            manager
                .segments
                .insert(segment.first_index().get(), segment);
        }

        if manager.segments.is_empty() {
            let segment = manager.create_segment(
                SegmentId::new(1),
                Version::new(1),
                LogIndex::new(1),
                -1,
            )?;
            manager.segments.insert(1, segment);
        } else {
            manager.validate_tiling()?;
            // Locked segments are fully committed; restore the watermark.
            manager.commit_index = manager
                .segments
                .values()
                .filter(|s| s.descriptor().locked)
                .filter_map(|s| s.last_index().map(LogIndex::get))
                .max()
                .unwrap_or(0);
            // Only the tail accepts appends.
            let last_key = *manager.segments.keys().next_back().expect("non-empty");
            for (key, segment) in &mut manager.segments {
                if *key != last_key && !segment.is_sealed() {
                    segment.seal()?;
                }
            }
        }

        info!(
            segments = manager.segments.len(),
            last_index = ?manager.last_index(),
            commit_index = manager.commit_index,
            "opened log"
        );
        Ok(manager)
    }

    /// Returns the first index covered by the log.
    #[must_use]
    pub fn first_index(&self) -> LogIndex {
        self.segments
            .values()
            .next()
            .map_or(LogIndex::new(1), Segment::first_index)
    }

    /// Returns the last index covered by the log, or `None` if empty.
    #[must_use]
    pub fn last_index(&self) -> Option<LogIndex> {
        self.segments.values().rev().find_map(Segment::last_index)
    }

    /// Returns the next index the log will assign.
    #[must_use]
    pub fn next_index(&self) -> LogIndex {
        self.segments
            .values()
            .next_back()
            .map_or(LogIndex::new(1), Segment::next_index)
    }

    /// Returns the log-wide commit index.
    #[must_use]
    pub const fn commit_index(&self) -> LogIndex {
        LogIndex::new(self.commit_index)
    }

    /// Appends an entry, rotating to a new segment when the active one is
    /// out of room.
    ///
    /// # Errors
    /// Returns an error if the entry is over the size cap or storage
    /// fails.
    pub fn append(&mut self, entry: &Entry) -> LogResult<LogIndex> {
        let size = entry.encoded_len();
        if size > u64::from(self.config.max_entry_size) {
            return Err(LogError::EntryTooLarge {
                size,
                max: self.config.max_entry_size,
            });
        }

        if !self.current().has_space_for(size) {
            self.rotate()?;
        }
        let pool = Arc::clone(&self.pool);
        self.current_mut().append(entry, &pool)
    }

    /// Skips `count` indexes, recording gaps and rotating as needed.
    ///
    /// # Errors
    /// Returns an error if storage fails.
    pub fn skip(&mut self, count: u64) -> LogResult<()> {
        let mut remaining = count;
        while remaining > 0 {
            let capacity = self.config.max_entries_per_segment
                - (self.current().next_index().get() - self.current().first_index().get());
            if capacity == 0 {
                self.rotate()?;
                continue;
            }
            let step = remaining.min(capacity);
            self.current_mut().skip(step)?;
            remaining -= step;
        }
        Ok(())
    }

    /// Reads the entry at `index`.
    ///
    /// # Errors
    /// Returns `IndexOutOfBounds` outside the log, `NotFound` for skipped
    /// or compacted slots.
    pub fn get(&self, index: LogIndex) -> LogResult<Entry> {
        let segment = self.segment_for(index).ok_or_else(|| {
            LogError::IndexOutOfBounds {
                index,
                first: self.first_index(),
                last: self.last_index().unwrap_or_else(|| LogIndex::new(0)),
            }
        })?;
        segment.get(index)
    }

    /// Returns true if an entry exists at `index`.
    #[must_use]
    pub fn contains_index(&self, index: LogIndex) -> bool {
        self.segment_for(index)
            .is_some_and(|s| s.contains_index(index))
    }

    /// Commits all entries up to `index`.
    ///
    /// Walks backwards through segments: when the commit lands mid-segment
    /// it may leave earlier segments with uncommitted tails, so each prior
    /// segment with a lower watermark is promoted to fully committed.
    ///
    /// # Errors
    /// Returns an error if a descriptor lock cannot be persisted.
    pub fn commit(&mut self, index: LogIndex) -> LogResult<()> {
        if index.get() <= self.commit_index {
            return Ok(());
        }
        let clamped = self
            .last_index()
            .map_or(0, |last| index.get().min(last.get()));
        if clamped <= self.commit_index {
            return Ok(());
        }

        let mut next = clamped;
        while next > 0 {
            let Some(segment) = self.segment_for_mut(LogIndex::new(next)) else {
                break;
            };
            if segment.commit_index().get() >= next {
                break;
            }
            segment.commit(LogIndex::new(next))?;
            next = segment.first_index().get() - 1;
        }

        self.commit_index = clamped;
        Ok(())
    }

    /// Removes all entries with index greater than `index`, deleting whole
    /// segments above it where possible.
    ///
    /// # Errors
    /// Returns an error if `index` precedes the log or the commit
    /// watermark, or if storage fails.
    pub fn truncate(&mut self, index: LogIndex) -> LogResult<()> {
        // `first_index - 1` clears the whole (uncommitted) log; anything
        // lower reaches into indexes the log no longer owns.
        if index.get() + 1 < self.first_index().get() {
            return Err(LogError::InvalidTruncate {
                index,
                reason: "before the first index in the log",
            });
        }
        if index.get() < self.commit_index {
            return Err(LogError::InvalidTruncate {
                index,
                reason: "cannot truncate committed entries",
            });
        }
        if self.last_index().map_or(true, |last| index >= last) {
            // Truncating past the end is a no-op.
            return Ok(());
        }

        // Delete whole segments that start above the truncation point.
        let doomed: Vec<u64> = self
            .segments
            .range(index.get() + 1..)
            .map(|(k, _)| *k)
            .collect();
        for key in doomed {
            let segment = self.segments.remove(&key).expect("segment exists");
            segment.delete(self.storage.as_ref())?;
        }

        // Truncate within the now-last segment and reopen it for appends,
        // or start over from an empty initial segment.
        if let Some(segment) = self.segments.values_mut().next_back() {
            segment.unseal();
            segment.truncate(index)?;
        } else {
            let segment =
                self.create_segment(SegmentId::new(1), Version::new(1), LogIndex::new(1), -1)?;
            self.segments.insert(1, segment);
        }

        debug!(index = index.get(), "truncated log");
        Ok(())
    }

    /// Compacts the segment identified by `id`: writes a replacement
    /// segment at the next version holding only the entries `retain`
    /// keeps, atomically swaps it in, and deletes the old files.
    ///
    /// Only sealed, fully committed segments may be compacted.
    ///
    /// # Errors
    /// Returns an error if the segment is unknown, not compactable, or
    /// storage fails.
    pub fn compact(
        &mut self,
        id: SegmentId,
        retain: &mut dyn FnMut(&Entry) -> bool,
    ) -> LogResult<()> {
        let key = self
            .segments
            .values()
            .find(|s| s.descriptor().id == id)
            .map(|s| s.first_index().get())
            .ok_or(LogError::InvalidCompaction {
                reason: "unknown segment",
            })?;

        let old = self.segments.get(&key).expect("segment exists");
        if !old.is_sealed() || !old.is_fully_committed() {
            return Err(LogError::InvalidCompaction {
                reason: "segment is not sealed and fully committed",
            });
        }

        let descriptor = *old.descriptor();
        let first = descriptor.index;
        let span = old.next_index().get() - first.get();
        let next_version = descriptor.version.next();

        let mut replacement = self.create_segment(
            descriptor.id,
            next_version,
            first,
            i64::try_from(span).unwrap_or(i64::MAX),
        )?;

        let mut retained = 0u64;
        for slot in 0..span {
            let index = LogIndex::new(first.get() + slot);
            match old.get(index) {
                Ok(entry) if retain(&entry) => {
                    let pool = Arc::clone(&self.pool);
                    replacement.append(&entry, &pool)?;
                    retained += 1;
                }
                Ok(_) | Err(LogError::NotFound { .. }) => replacement.skip(1)?,
                Err(e) => return Err(e),
            }
        }

        // Lock the replacement before the swap so an interrupted compaction
        // is recoverable: recovery discards an unlocked higher version.
        replacement.commit(LogIndex::new(first.get() + span - 1))?;
        replacement.seal()?;

        let old = self
            .segments
            .insert(key, replacement)
            .expect("segment exists");
        old.delete(self.storage.as_ref())?;

        info!(
            id = id.get(),
            version = next_version.get(),
            retained,
            span,
            "compacted segment"
        );
        Ok(())
    }

    /// Flushes every segment to durable storage.
    ///
    /// # Errors
    /// Returns an error if a sync fails.
    pub fn flush(&self) -> LogResult<()> {
        for segment in self.segments.values() {
            segment.flush()?;
        }
        Ok(())
    }

    /// Flushes and drops all segments.
    ///
    /// # Errors
    /// Returns an error if a sync fails.
    pub fn close(&mut self) -> LogResult<()> {
        self.flush()?;
        self.segments.clear();
        Ok(())
    }

    /// Deletes every segment file and resets to an empty initial segment.
    ///
    /// # Errors
    /// Returns an error if storage fails.
    pub fn delete(&mut self) -> LogResult<()> {
        let segments = std::mem::take(&mut self.segments);
        for segment in segments.values() {
            segment.delete(self.storage.as_ref())?;
        }
        self.commit_index = 0;
        let segment =
            self.create_segment(SegmentId::new(1), Version::new(1), LogIndex::new(1), -1)?;
        self.segments.insert(1, segment);
        Ok(())
    }

    /// Returns the segments in first-index order.
    pub fn segments(&self) -> impl Iterator<Item = &Segment> {
        self.segments.values()
    }

    /// Returns the segment covering `index`, if any.
    #[must_use]
    pub fn segment_for(&self, index: LogIndex) -> Option<&Segment> {
        self.segments
            .range(..=index.get())
            .next_back()
            .map(|(_, s)| s)
            .filter(|s| s.covers_index(index))
    }

    fn segment_for_mut(&mut self, index: LogIndex) -> Option<&mut Segment> {
        self.segments
            .range_mut(..=index.get())
            .next_back()
            .map(|(_, s)| s)
            .filter(|s| s.covers_index(index))
    }

    fn current(&self) -> &Segment {
        self.segments.values().next_back().expect("segments empty")
    }

    fn current_mut(&mut self) -> &mut Segment {
        self.segments
            .values_mut()
            .next_back()
            .expect("segments empty")
    }

    fn rotate(&mut self) -> LogResult<()> {
        let (next_id, first_index) = {
            let current = self.current_mut();
            current.seal()?;
            (current.descriptor().id.next(), current.next_index())
        };
        let segment = self.create_segment(next_id, Version::new(1), first_index, -1)?;
        self.segments.insert(first_index.get(), segment);
        Ok(())
    }

    fn create_segment(
        &self,
        id: SegmentId,
        version: Version,
        index: LogIndex,
        range: i64,
    ) -> LogResult<Segment> {
        let descriptor = SegmentDescriptor::new(
            id,
            version,
            index,
            range,
            self.config.max_entry_size,
            self.config.max_segment_size,
        );
        Segment::create(
            self.storage.as_ref(),
            self.segment_path(id, version, "log"),
            self.segment_path(id, version, "index"),
            descriptor,
            self.config.max_entries_per_segment,
        )
    }

    fn segment_path(&self, id: SegmentId, version: Version, extension: &str) -> PathBuf {
        self.config.directory.join(format!(
            "{}-{:010}-{:03}.{extension}",
            self.config.name,
            id.get(),
            version.get()
        ))
    }

    /// Loads all segments from the log directory, resolving interrupted
    /// compactions by the version/locked rules.
    fn load_segments(&self) -> LogResult<Vec<Segment>> {
        // For each segment id pick the winning file: the highest locked
        // version, else the highest version. A newer unlocked version next
        // to an older locked one is an unfinished compaction and is
        // deleted.
        let mut best: HashMap<u64, (u64, bool, PathBuf)> = HashMap::new();

        for path in self.storage.list(&self.config.directory, "log")? {
            let Some((file_id, file_version)) = parse_segment_file(&path, &self.config.name)
            else {
                continue;
            };

            let locked = match self.read_locked_flag(&path) {
                Ok(locked) => locked,
                Err(e) if e.is_corruption() => return Err(e),
                Err(e) => {
                    warn!(?path, error = %e, "skipping unreadable segment file");
                    continue;
                }
            };

            match best.get(&file_id) {
                None => {
                    best.insert(file_id, (file_version, locked, path));
                }
                Some(&(existing_version, existing_locked, _)) => {
                    let wins = if locked == existing_locked {
                        file_version > existing_version
                    } else {
                        locked
                    };
                    if wins {
                        let (_, _, loser) = best
                            .insert(file_id, (file_version, locked, path))
                            .expect("existing entry");
                        self.delete_segment_files(&loser)?;
                    } else {
                        debug!(?path, "discarding superseded segment version");
                        self.delete_segment_files(&path)?;
                    }
                }
            }
        }

        let mut segments = Vec::with_capacity(best.len());
        for (file_id, (file_version, _, path)) in best {
            let index_path = path.with_extension("index");
            let segment = Segment::load(
                self.storage.as_ref(),
                path,
                index_path,
                file_id,
                file_version,
                self.config.max_entries_per_segment,
            )?;
            segments.push(segment);
        }
        segments.sort_by_key(|s| s.first_index().get());
        Ok(segments)
    }

    fn read_locked_flag(&self, path: &Path) -> LogResult<bool> {
        let file = self.storage.open(path)?;
        if file.len()? < DESCRIPTOR_BYTES as u64 {
            return Err(LogError::io("descriptor", "file too small"));
        }
        let mut buf = file.read_at(0, DESCRIPTOR_BYTES)?;
        let descriptor = SegmentDescriptor::decode(&mut buf)?;
        Ok(descriptor.locked)
    }

    fn delete_segment_files(&self, path: &Path) -> LogResult<()> {
        self.storage.remove(path)?;
        self.storage.remove(&path.with_extension("index"))
    }

    /// Validates that recovered segments tile the index space with no
    /// gaps, starting at index 1.
    fn validate_tiling(&self) -> LogResult<()> {
        let mut expected = 1u64;
        for segment in self.segments.values() {
            if segment.first_index().get() != expected {
                return Err(LogError::SegmentGap {
                    expected: LogIndex::new(expected),
                    found: segment.first_index(),
                });
            }
            expected = segment.next_index().get();
        }
        Ok(())
    }
}

/// Parses `{name}-{id}-{version}` out of a segment file stem. Files whose
/// name prefix does not match this log are ignored.
fn parse_segment_file(path: &Path, log_name: &str) -> Option<(u64, u64)> {
    let stem = path.file_stem()?.to_str()?;
    let mut parts = stem.rsplitn(3, '-');
    let version: u64 = parts.next()?.parse().ok()?;
    let id: u64 = parts.next()?.parse().ok()?;
    let name = parts.next()?;
    (name == log_name).then_some((id, version))
}
