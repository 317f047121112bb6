//! Per-segment offset indexes.
//!
//! An offset index maps an entry offset (its zero-based position slot
//! within the segment) to the file position of its record. Two layouts:
//!
//! - **Ordered** (version-1 segments): one packed `u32` position per slot,
//!   entry count inferred from file length. Skipped slots store the absent
//!   sentinel.
//! - **Searchable** (compacted segments): `{u32 offset, u32 position}`
//!   pairs sorted by offset; gaps are simply absent and lookup is a binary
//!   search.
//!
//! Indexes are rebuilt from their file on load; a torn tail (partial slot
//! or pair) is dropped.

use bytes::Buf;

use crate::error::LogResult;
use crate::storage::StorageFile;

/// Sentinel marking a skipped slot in an ordered index.
const SLOT_ABSENT: u32 = u32::MAX;

/// An offset index in either layout.
pub enum OffsetIndex {
    /// Packed layout used by version-1 segments.
    Ordered(OrderedOffsetIndex),
    /// Sparse layout used by compacted segments.
    Searchable(SearchableOffsetIndex),
}

impl OffsetIndex {
    /// Returns the file position of the entry at `offset`, if present.
    #[must_use]
    pub fn position(&self, offset: u32) -> Option<u32> {
        match self {
            Self::Ordered(index) => index.position(offset),
            Self::Searchable(index) => index.position(offset),
        }
    }

    /// Returns the next unassigned offset slot.
    #[must_use]
    pub fn next_offset(&self) -> u32 {
        match self {
            Self::Ordered(index) => index.next_offset(),
            Self::Searchable(index) => index.next_offset(),
        }
    }

    /// Returns the number of present (non-skipped) entries.
    #[must_use]
    pub fn entry_count(&self) -> u64 {
        match self {
            Self::Ordered(index) => index.entry_count(),
            Self::Searchable(index) => index.entry_count(),
        }
    }

    /// Returns the highest present offset, if any.
    #[must_use]
    pub fn last_present_offset(&self) -> Option<u32> {
        match self {
            Self::Ordered(index) => index.last_present_offset(),
            Self::Searchable(index) => index.last_present_offset(),
        }
    }

    /// Records the position of the entry at `offset`.
    ///
    /// Offsets must be appended in ascending order; intervening skipped
    /// slots are recorded as absent.
    ///
    /// # Errors
    /// Returns an error if the index file cannot be written.
    ///
    /// # Panics
    /// Panics if `offset` is below the next unassigned slot.
    pub fn append(&mut self, offset: u32, position: u32) -> LogResult<()> {
        match self {
            Self::Ordered(index) => index.append(offset, position),
            Self::Searchable(index) => index.append(offset, position),
        }
    }

    /// Skips `count` offset slots without recording entries.
    ///
    /// # Errors
    /// Returns an error if the index file cannot be written.
    pub fn skip(&mut self, count: u32) -> LogResult<()> {
        match self {
            Self::Ordered(index) => index.skip(count),
            Self::Searchable(index) => {
                index.skip(count);
                Ok(())
            }
        }
    }

    /// Drops all slots with offset greater than `last_offset_to_keep`.
    ///
    /// # Errors
    /// Returns an error if the index file cannot be resized.
    pub fn truncate(&mut self, last_offset_to_keep: u32) -> LogResult<()> {
        match self {
            Self::Ordered(index) => index.truncate(last_offset_to_keep),
            Self::Searchable(index) => index.truncate(last_offset_to_keep),
        }
    }

    /// Removes every slot.
    ///
    /// # Errors
    /// Returns an error if the index file cannot be resized.
    pub fn clear(&mut self) -> LogResult<()> {
        match self {
            Self::Ordered(index) => index.clear(),
            Self::Searchable(index) => index.clear(),
        }
    }

    /// Flushes index writes to durable storage.
    ///
    /// # Errors
    /// Returns an error if the sync fails.
    pub fn sync(&self) -> LogResult<()> {
        match self {
            Self::Ordered(index) => index.file.sync(),
            Self::Searchable(index) => index.file.sync(),
        }
    }
}

/// Packed offset index: slot `i` holds the position of the entry at offset
/// `i`, or the absent sentinel for skipped slots.
pub struct OrderedOffsetIndex {
    file: Box<dyn StorageFile>,
    slots: Vec<u32>,
}

impl OrderedOffsetIndex {
    /// Opens an ordered index, rebuilding slots from the file.
    ///
    /// # Errors
    /// Returns an error if the file cannot be read.
    pub fn open(file: Box<dyn StorageFile>) -> LogResult<Self> {
        let len = file.len()?;
        // Drop a torn trailing slot.
        let count = usize::try_from(len / 4).unwrap_or(0);
        let mut slots = Vec::with_capacity(count);
        if count > 0 {
            let mut data = file.read_at(0, count * 4)?;
            for _ in 0..count {
                slots.push(data.get_u32_le());
            }
        }
        Ok(Self { file, slots })
    }

    fn position(&self, offset: u32) -> Option<u32> {
        self.slots
            .get(offset as usize)
            .copied()
            .filter(|&p| p != SLOT_ABSENT)
    }

    fn next_offset(&self) -> u32 {
        // Safe cast: slot count is bounded by the entries-per-segment cap.
        #[allow(clippy::cast_possible_truncation)]
        let next = self.slots.len() as u32;
        next
    }

    fn entry_count(&self) -> u64 {
        self.slots.iter().filter(|&&p| p != SLOT_ABSENT).count() as u64
    }

    fn last_present_offset(&self) -> Option<u32> {
        self.slots
            .iter()
            .rposition(|&p| p != SLOT_ABSENT)
            .map(|i| {
                // Safe cast: slot count is bounded by the cap.
                #[allow(clippy::cast_possible_truncation)]
                let offset = i as u32;
                offset
            })
    }

    fn append(&mut self, offset: u32, position: u32) -> LogResult<()> {
        assert!(
            offset >= self.next_offset(),
            "offsets must be appended in order"
        );

        let first_new = self.slots.len();
        while self.next_offset() < offset {
            self.slots.push(SLOT_ABSENT);
        }
        self.slots.push(position);
        self.write_slots_from(first_new)
    }

    fn skip(&mut self, count: u32) -> LogResult<()> {
        let first_new = self.slots.len();
        for _ in 0..count {
            self.slots.push(SLOT_ABSENT);
        }
        self.write_slots_from(first_new)
    }

    fn truncate(&mut self, last_offset_to_keep: u32) -> LogResult<()> {
        let keep = (last_offset_to_keep as usize).saturating_add(1);
        if keep < self.slots.len() {
            self.slots.truncate(keep);
            self.file.set_len(self.slots.len() as u64 * 4)?;
        }
        Ok(())
    }

    fn clear(&mut self) -> LogResult<()> {
        self.slots.clear();
        self.file.set_len(0)
    }

    fn write_slots_from(&mut self, first: usize) -> LogResult<()> {
        let mut data = Vec::with_capacity((self.slots.len() - first) * 4);
        for slot in &self.slots[first..] {
            data.extend_from_slice(&slot.to_le_bytes());
        }
        self.file.write_at(first as u64 * 4, &data)
    }
}

/// Sparse offset index: sorted `{offset, position}` pairs with binary
/// search lookup.
pub struct SearchableOffsetIndex {
    file: Box<dyn StorageFile>,
    pairs: Vec<(u32, u32)>,
    next_offset: u32,
}

impl SearchableOffsetIndex {
    /// Opens a searchable index, rebuilding pairs from the file.
    ///
    /// `offset_span` is the segment's recorded slot span (the descriptor
    /// `range`); it restores trailing gaps that the pair list alone cannot
    /// represent. Pass `None` for a fresh index.
    ///
    /// # Errors
    /// Returns an error if the file cannot be read.
    pub fn open(file: Box<dyn StorageFile>, offset_span: Option<u32>) -> LogResult<Self> {
        let len = file.len()?;
        // Drop a torn trailing pair.
        let count = usize::try_from(len / 8).unwrap_or(0);
        let mut pairs = Vec::with_capacity(count);
        if count > 0 {
            let mut data = file.read_at(0, count * 8)?;
            for _ in 0..count {
                let offset = data.get_u32_le();
                let position = data.get_u32_le();
                pairs.push((offset, position));
            }
        }

        let loaded_next = pairs.last().map_or(0, |&(o, _)| o + 1);
        let next_offset = offset_span.map_or(loaded_next, |span| span.max(loaded_next));
        Ok(Self {
            file,
            pairs,
            next_offset,
        })
    }

    fn position(&self, offset: u32) -> Option<u32> {
        self.pairs
            .binary_search_by_key(&offset, |&(o, _)| o)
            .ok()
            .map(|i| self.pairs[i].1)
    }

    const fn next_offset(&self) -> u32 {
        self.next_offset
    }

    fn entry_count(&self) -> u64 {
        self.pairs.len() as u64
    }

    fn last_present_offset(&self) -> Option<u32> {
        self.pairs.last().map(|&(o, _)| o)
    }

    fn append(&mut self, offset: u32, position: u32) -> LogResult<()> {
        assert!(
            offset >= self.next_offset,
            "offsets must be appended in order"
        );

        self.pairs.push((offset, position));
        self.next_offset = offset + 1;

        let mut data = [0u8; 8];
        data[..4].copy_from_slice(&offset.to_le_bytes());
        data[4..].copy_from_slice(&position.to_le_bytes());
        self.file
            .write_at((self.pairs.len() as u64 - 1) * 8, &data)
    }

    fn skip(&mut self, count: u32) {
        self.next_offset += count;
    }

    fn truncate(&mut self, last_offset_to_keep: u32) -> LogResult<()> {
        let keep = self
            .pairs
            .partition_point(|&(o, _)| o <= last_offset_to_keep);
        self.pairs.truncate(keep);
        self.next_offset = last_offset_to_keep.saturating_add(1);
        self.file.set_len(self.pairs.len() as u64 * 8)
    }

    fn clear(&mut self) -> LogResult<()> {
        self.pairs.clear();
        self.next_offset = 0;
        self.file.set_len(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{MemoryStorage, Storage};
    use std::path::Path;

    fn memory_file(storage: &MemoryStorage, name: &str) -> Box<dyn StorageFile> {
        storage.open(Path::new(name)).unwrap()
    }

    #[test]
    fn test_ordered_append_and_lookup() {
        let storage = MemoryStorage::new();
        let mut index =
            OrderedOffsetIndex::open(memory_file(&storage, "/idx/a.index")).unwrap();

        index.append(0, 64).unwrap();
        index.append(1, 128).unwrap();
        index.append(2, 200).unwrap();

        assert_eq!(index.position(0), Some(64));
        assert_eq!(index.position(2), Some(200));
        assert_eq!(index.position(3), None);
        assert_eq!(index.next_offset(), 3);
        assert_eq!(index.entry_count(), 3);
    }

    #[test]
    fn test_ordered_skip_records_gap() {
        let storage = MemoryStorage::new();
        let mut index =
            OrderedOffsetIndex::open(memory_file(&storage, "/idx/b.index")).unwrap();

        index.append(0, 64).unwrap();
        index.skip(2).unwrap();
        index.append(3, 300).unwrap();

        assert_eq!(index.position(1), None);
        assert_eq!(index.position(2), None);
        assert_eq!(index.position(3), Some(300));
        assert_eq!(index.next_offset(), 4);
        assert_eq!(index.entry_count(), 2);
        assert_eq!(index.last_present_offset(), Some(3));
    }

    #[test]
    fn test_ordered_rebuild_from_file() {
        let storage = MemoryStorage::new();
        {
            let mut index =
                OrderedOffsetIndex::open(memory_file(&storage, "/idx/c.index")).unwrap();
            index.append(0, 64).unwrap();
            index.skip(1).unwrap();
            index.append(2, 190).unwrap();
        }

        let index = OrderedOffsetIndex::open(memory_file(&storage, "/idx/c.index")).unwrap();
        assert_eq!(index.position(0), Some(64));
        assert_eq!(index.position(1), None);
        assert_eq!(index.position(2), Some(190));
        assert_eq!(index.next_offset(), 3);
    }

    #[test]
    fn test_ordered_truncate() {
        let storage = MemoryStorage::new();
        let mut index =
            OrderedOffsetIndex::open(memory_file(&storage, "/idx/d.index")).unwrap();
        for i in 0..5 {
            index.append(i, i * 100).unwrap();
        }

        index.truncate(2).unwrap();
        assert_eq!(index.next_offset(), 3);
        assert_eq!(index.position(3), None);

        // File shrank too.
        let reopened =
            OrderedOffsetIndex::open(memory_file(&storage, "/idx/d.index")).unwrap();
        assert_eq!(reopened.next_offset(), 3);
    }

    #[test]
    fn test_searchable_lookup_with_gaps() {
        let storage = MemoryStorage::new();
        let mut index =
            SearchableOffsetIndex::open(memory_file(&storage, "/idx/e.index"), None).unwrap();

        index.append(0, 64).unwrap();
        index.skip(1);
        index.append(2, 150).unwrap();
        index.skip(1);
        index.append(4, 280).unwrap();

        assert_eq!(index.position(0), Some(64));
        assert_eq!(index.position(1), None);
        assert_eq!(index.position(2), Some(150));
        assert_eq!(index.position(4), Some(280));
        assert_eq!(index.next_offset(), 5);
        assert_eq!(index.entry_count(), 3);
    }

    #[test]
    fn test_searchable_span_restores_trailing_gap() {
        let storage = MemoryStorage::new();
        {
            let mut index =
                SearchableOffsetIndex::open(memory_file(&storage, "/idx/f.index"), None)
                    .unwrap();
            index.append(0, 64).unwrap();
            index.skip(3);
        }

        // Without a span, the trailing skips are lost...
        let bare =
            SearchableOffsetIndex::open(memory_file(&storage, "/idx/f.index"), None).unwrap();
        assert_eq!(bare.next_offset(), 1);

        // ...the recorded span restores them.
        let spanned =
            SearchableOffsetIndex::open(memory_file(&storage, "/idx/f.index"), Some(4))
                .unwrap();
        assert_eq!(spanned.next_offset(), 4);
    }

    #[test]
    fn test_searchable_truncate() {
        let storage = MemoryStorage::new();
        let mut index =
            SearchableOffsetIndex::open(memory_file(&storage, "/idx/g.index"), None).unwrap();
        index.append(0, 64).unwrap();
        index.append(1, 128).unwrap();
        index.append(2, 192).unwrap();

        index.truncate(1).unwrap();
        assert_eq!(index.position(2), None);
        assert_eq!(index.next_offset(), 2);
        assert_eq!(index.entry_count(), 2);
    }
}
