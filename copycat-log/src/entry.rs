//! Log entry format.
//!
//! Each entry on disk has the following binary layout:
//!
//! ```text
//! +----------+----------+--------+----------+-------------+---------+-----+---------+
//! |  Length  |  CRC32   |  Kind  |   Term   |  Timestamp  | KeyLen  | Key | Payload |
//! | (4 bytes)| (4 bytes)|(1 byte)| (8 bytes)|  (8 bytes)  | (varint)|     |         |
//! +----------+----------+--------+----------+-------------+---------+-----+---------+
//! ```
//!
//! - Length: total record size in bytes, including the length field itself,
//!   which permits skip-scan recovery over a damaged tail
//! - CRC32: checksum of everything after the CRC field
//! - KeyLen: unsigned LEB128 varint
//!
//! The entry index is not stored in the record; it is derived from the
//! entry's offset within its owning segment. All fixed-width integers are
//! little-endian.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use copycat_core::{limits::ENTRY_SIZE_BYTES_MAX, LogIndex, TermId};

use crate::error::{LogError, LogResult};

/// Fixed portion of the entry record in bytes (length + crc + kind + term +
/// timestamp).
pub const ENTRY_HEADER_SIZE: usize = 4 + 4 + 1 + 8 + 8;

/// The kind of a log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum EntryKind {
    /// A user command applied to the state machine.
    Command = 0,
    /// A leader no-op appended on election to commit prior-term entries.
    NoOp = 1,
    /// A cluster membership change.
    Config = 2,
}

impl EntryKind {
    /// Decodes a kind from its wire byte.
    ///
    /// # Errors
    /// Returns an error for unknown kind bytes.
    pub fn from_u8(value: u8) -> LogResult<Self> {
        match value {
            0 => Ok(Self::Command),
            1 => Ok(Self::NoOp),
            2 => Ok(Self::Config),
            _ => Err(LogError::InvalidHeader {
                reason: "unknown entry kind",
            }),
        }
    }

    /// Returns the wire byte for this kind.
    #[must_use]
    pub const fn as_u8(self) -> u8 {
        self as u8
    }
}

/// A single entry in the replicated log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    /// One-based log index; assigned by the log, derived on read.
    pub index: LogIndex,
    /// Term in which the entry was created.
    pub term: TermId,
    /// Entry kind.
    pub kind: EntryKind,
    /// Leader-assigned creation time in milliseconds since the epoch.
    pub timestamp: u64,
    /// The entry key (may be empty).
    pub key: Bytes,
    /// The entry payload (may be empty).
    pub payload: Bytes,
}

impl Entry {
    /// Creates a new entry.
    ///
    /// # Errors
    /// Returns an error if key plus payload exceed the global entry cap.
    pub fn new(
        index: LogIndex,
        term: TermId,
        kind: EntryKind,
        timestamp: u64,
        key: Bytes,
        payload: Bytes,
    ) -> LogResult<Self> {
        let size = key.len() as u64 + payload.len() as u64;
        if size > u64::from(ENTRY_SIZE_BYTES_MAX) {
            return Err(LogError::EntryTooLarge {
                size,
                max: ENTRY_SIZE_BYTES_MAX,
            });
        }
        Ok(Self {
            index,
            term,
            kind,
            timestamp,
            key,
            payload,
        })
    }

    /// Returns the total encoded record size in bytes.
    #[must_use]
    pub fn encoded_len(&self) -> u64 {
        ENTRY_HEADER_SIZE as u64
            + uvarint_len(self.key.len() as u64)
            + self.key.len() as u64
            + self.payload.len() as u64
    }

    /// Encodes the entry record into the buffer.
    pub fn encode(&self, buf: &mut BytesMut) {
        let start = buf.len();

        // Placeholders for length and crc, patched below.
        buf.put_u32_le(0);
        buf.put_u32_le(0);

        buf.put_u8(self.kind.as_u8());
        buf.put_u64_le(self.term.get());
        buf.put_u64_le(self.timestamp);
        put_uvarint(buf, self.key.len() as u64);
        buf.put_slice(&self.key);
        buf.put_slice(&self.payload);

        // Record length includes the length field itself.
        // Safe cast: record size is bounded by the entry cap.
        #[allow(clippy::cast_possible_truncation)]
        let length = (buf.len() - start) as u32;
        let crc = crc32fast::hash(&buf[start + 8..]);
        buf[start..start + 4].copy_from_slice(&length.to_le_bytes());
        buf[start + 4..start + 8].copy_from_slice(&crc.to_le_bytes());
    }

    /// Decodes an entry record, assigning it the given index.
    ///
    /// # Errors
    /// Returns an error if the record is truncated, malformed, or fails its
    /// checksum.
    pub fn decode(buf: &mut impl Buf, index: LogIndex) -> LogResult<Self> {
        if buf.remaining() < ENTRY_HEADER_SIZE {
            return Err(LogError::TruncatedEntry {
                expected: ENTRY_HEADER_SIZE as u32,
                // Safe cast: remaining is below ENTRY_HEADER_SIZE.
                #[allow(clippy::cast_possible_truncation)]
                found: buf.remaining() as u32,
            });
        }

        let length = buf.get_u32_le();
        if (length as usize) < ENTRY_HEADER_SIZE
            || length > ENTRY_SIZE_BYTES_MAX + ENTRY_HEADER_SIZE as u32 + 10
        {
            return Err(LogError::InvalidHeader {
                reason: "entry length out of range",
            });
        }

        let crc = buf.get_u32_le();
        let body_len = length as usize - 8;
        if buf.remaining() < body_len {
            return Err(LogError::TruncatedEntry {
                expected: length,
                // Safe cast: remaining is below the validated length.
                #[allow(clippy::cast_possible_truncation)]
                found: buf.remaining() as u32 + 8,
            });
        }

        let body = buf.copy_to_bytes(body_len);
        let actual = crc32fast::hash(&body);
        if actual != crc {
            return Err(LogError::ChecksumMismatch {
                index,
                expected: crc,
                actual,
            });
        }

        let mut body = body;
        let kind = EntryKind::from_u8(body.get_u8())?;
        let term = TermId::new(body.get_u64_le());
        let timestamp = body.get_u64_le();
        let key_len = get_uvarint(&mut body).ok_or(LogError::InvalidHeader {
            reason: "invalid key length varint",
        })?;
        let key_len = usize::try_from(key_len).map_err(|_| LogError::InvalidHeader {
            reason: "key length out of range",
        })?;
        if body.remaining() < key_len {
            return Err(LogError::InvalidHeader {
                reason: "key length exceeds record",
            });
        }
        let key = body.copy_to_bytes(key_len);
        let payload = body.copy_to_bytes(body.remaining());

        Ok(Self {
            index,
            term,
            kind,
            timestamp,
            key,
            payload,
        })
    }
}

/// Returns the encoded size of an unsigned LEB128 varint.
pub(crate) const fn uvarint_len(mut value: u64) -> u64 {
    let mut len = 1;
    while value >= 0x80 {
        value >>= 7;
        len += 1;
    }
    len
}

/// Writes an unsigned LEB128 varint.
pub(crate) fn put_uvarint(buf: &mut BytesMut, mut value: u64) {
    while value >= 0x80 {
        // Safe cast: masked to seven bits.
        #[allow(clippy::cast_possible_truncation)]
        buf.put_u8((value as u8 & 0x7f) | 0x80);
        value >>= 7;
    }
    // Safe cast: below 0x80.
    #[allow(clippy::cast_possible_truncation)]
    buf.put_u8(value as u8);
}

/// Reads an unsigned LEB128 varint, returning `None` on malformed input.
pub(crate) fn get_uvarint(buf: &mut impl Buf) -> Option<u64> {
    let mut value: u64 = 0;
    let mut shift = 0u32;
    loop {
        if !buf.has_remaining() || shift >= 64 {
            return None;
        }
        let byte = buf.get_u8();
        value |= u64::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            return Some(value);
        }
        shift += 7;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_entry(index: u64, key: &str, payload: &str) -> Entry {
        Entry::new(
            LogIndex::new(index),
            TermId::new(3),
            EntryKind::Command,
            1_700_000_000_000,
            Bytes::copy_from_slice(key.as_bytes()),
            Bytes::copy_from_slice(payload.as_bytes()),
        )
        .unwrap()
    }

    #[test]
    fn test_entry_roundtrip() {
        let entry = make_entry(42, "foo", "bar baz");

        let mut buf = BytesMut::new();
        entry.encode(&mut buf);
        assert_eq!(buf.len() as u64, entry.encoded_len());

        let decoded = Entry::decode(&mut buf.freeze(), LogIndex::new(42)).unwrap();
        assert_eq!(decoded, entry);
    }

    #[test]
    fn test_empty_key_and_payload() {
        let entry = Entry::new(
            LogIndex::new(1),
            TermId::new(1),
            EntryKind::NoOp,
            0,
            Bytes::new(),
            Bytes::new(),
        )
        .unwrap();

        let mut buf = BytesMut::new();
        entry.encode(&mut buf);

        let decoded = Entry::decode(&mut buf.freeze(), LogIndex::new(1)).unwrap();
        assert_eq!(decoded.kind, EntryKind::NoOp);
        assert!(decoded.key.is_empty());
        assert!(decoded.payload.is_empty());
    }

    #[test]
    fn test_checksum_detects_corruption() {
        let entry = make_entry(1, "k", "v");
        let mut buf = BytesMut::new();
        entry.encode(&mut buf);

        let last = buf.len() - 1;
        buf[last] ^= 0xFF;

        let result = Entry::decode(&mut buf.freeze(), LogIndex::new(1));
        assert!(matches!(result, Err(LogError::ChecksumMismatch { .. })));
    }

    #[test]
    fn test_truncated_record() {
        let entry = make_entry(1, "key", "payload");
        let mut buf = BytesMut::new();
        entry.encode(&mut buf);
        buf.truncate(ENTRY_HEADER_SIZE + 1);

        let result = Entry::decode(&mut buf.freeze(), LogIndex::new(1));
        assert!(matches!(result, Err(LogError::TruncatedEntry { .. })));
    }

    #[test]
    fn test_entry_too_large() {
        let payload = Bytes::from(vec![0u8; ENTRY_SIZE_BYTES_MAX as usize + 1]);
        let result = Entry::new(
            LogIndex::new(1),
            TermId::new(1),
            EntryKind::Command,
            0,
            Bytes::new(),
            payload,
        );
        assert!(matches!(result, Err(LogError::EntryTooLarge { .. })));
    }

    #[test]
    fn test_unknown_kind_rejected() {
        assert!(EntryKind::from_u8(3).is_err());
    }

    #[test]
    fn test_uvarint_roundtrip() {
        for value in [0u64, 1, 127, 128, 300, 16_383, 16_384, u64::MAX] {
            let mut buf = BytesMut::new();
            put_uvarint(&mut buf, value);
            assert_eq!(buf.len() as u64, uvarint_len(value));
            assert_eq!(get_uvarint(&mut buf.freeze()), Some(value));
        }
    }
}
