//! Segment descriptor header.
//!
//! Every segment data file begins with a fixed-size descriptor identifying
//! the segment. The descriptor is written once at segment creation; only
//! the `locked` flag changes afterwards, flipped exactly once when every
//! entry in the segment has been committed (after a seal or a completed
//! compaction).
//!
//! Layout (little-endian, padded to [`DESCRIPTOR_BYTES`]):
//!
//! ```text
//! magic u32 | header_version u32 | id u64 | version u64 | index u64 |
//! range i64 | max_entry_size u32 | max_segment_size u32 | locked u8 | pad
//! ```

use bytes::{Buf, BufMut, BytesMut};
use copycat_core::{LogIndex, SegmentId, Version};

use crate::error::{LogError, LogResult};

/// Fixed descriptor size in bytes.
pub const DESCRIPTOR_BYTES: usize = 64;

/// Magic identifying a Copycat segment file.
const DESCRIPTOR_MAGIC: u32 = 0x4350_5943; // "CPYC"

/// Current descriptor format version.
const DESCRIPTOR_VERSION: u32 = 1;

/// The descriptor at the head of a segment data file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentDescriptor {
    /// Segment identifier; consecutive across the log.
    pub id: SegmentId,
    /// Segment version; starts at 1, bumped by each compaction.
    pub version: Version,
    /// The segment's effective first log index.
    pub index: LogIndex,
    /// Number of index slots this segment spans, or -1 when the span is
    /// still growing (version-1 segments). Compacted segments record their
    /// span here so trailing gaps survive a reload.
    pub range: i64,
    /// Hard cap on a single encoded entry in this segment.
    pub max_entry_size: u32,
    /// Soft cap on the data region before rotation.
    pub max_segment_size: u32,
    /// True once every entry in the segment is committed.
    pub locked: bool,
}

impl SegmentDescriptor {
    /// Creates a descriptor for a fresh segment.
    #[must_use]
    pub const fn new(
        id: SegmentId,
        version: Version,
        index: LogIndex,
        range: i64,
        max_entry_size: u32,
        max_segment_size: u32,
    ) -> Self {
        Self {
            id,
            version,
            index,
            range,
            max_entry_size,
            max_segment_size,
            locked: false,
        }
    }

    /// Encodes the descriptor as exactly [`DESCRIPTOR_BYTES`] bytes.
    pub fn encode(&self, buf: &mut BytesMut) {
        let start = buf.len();
        buf.put_u32_le(DESCRIPTOR_MAGIC);
        buf.put_u32_le(DESCRIPTOR_VERSION);
        buf.put_u64_le(self.id.get());
        buf.put_u64_le(self.version.get());
        buf.put_u64_le(self.index.get());
        buf.put_i64_le(self.range);
        buf.put_u32_le(self.max_entry_size);
        buf.put_u32_le(self.max_segment_size);
        buf.put_u8(u8::from(self.locked));
        buf.resize(start + DESCRIPTOR_BYTES, 0);
    }

    /// Decodes a descriptor from the head of a segment file.
    ///
    /// # Errors
    /// Returns an error if the buffer is too small or the magic or format
    /// version is wrong.
    pub fn decode(buf: &mut impl Buf) -> LogResult<Self> {
        if buf.remaining() < DESCRIPTOR_BYTES {
            return Err(LogError::InvalidHeader {
                reason: "descriptor too small",
            });
        }

        if buf.get_u32_le() != DESCRIPTOR_MAGIC {
            return Err(LogError::InvalidHeader {
                reason: "bad segment magic",
            });
        }
        if buf.get_u32_le() != DESCRIPTOR_VERSION {
            return Err(LogError::InvalidHeader {
                reason: "unsupported descriptor version",
            });
        }

        let id = SegmentId::new(buf.get_u64_le());
        let version = Version::new(buf.get_u64_le());
        let index = LogIndex::new(buf.get_u64_le());
        let range = buf.get_i64_le();
        let max_entry_size = buf.get_u32_le();
        let max_segment_size = buf.get_u32_le();
        let locked = buf.get_u8() != 0;
        buf.advance(DESCRIPTOR_BYTES - 4 - 4 - 8 - 8 - 8 - 8 - 4 - 4 - 1);

        Ok(Self {
            id,
            version,
            index,
            range,
            max_entry_size,
            max_segment_size,
            locked,
        })
    }
}
