//! Durable vote metadata.
//!
//! Raft requires `currentTerm` and `votedFor` on stable storage before a
//! vote response leaves the node. The metadata lives in a tiny fixed-format
//! file next to the segment files:
//!
//! ```text
//! term u64 | voted_flag u8 | voted_for u32
//! ```

use std::path::Path;

use bytes::{Buf, BufMut, BytesMut};
use copycat_core::{MemberId, TermId};
use copycat_log::{Storage, StorageFile};

use crate::{RaftError, RaftResult};

const META_BYTES: usize = 8 + 1 + 4;

/// The durable term/vote record.
pub struct MetaStore {
    file: Box<dyn StorageFile>,
}

impl MetaStore {
    /// Opens (or creates) the metadata file for the named log.
    ///
    /// # Errors
    /// Returns an error if the file cannot be opened.
    pub fn open<S: Storage>(storage: &S, directory: &Path, name: &str) -> RaftResult<Self> {
        storage.create_dir_all(directory)?;
        let path = directory.join(format!("{name}.meta"));
        let file = storage.open(&path)?;
        Ok(Self { file })
    }

    /// Loads the persisted term and vote, or `None` on a fresh node.
    ///
    /// # Errors
    /// Returns an error if the file cannot be read.
    pub fn load(&self) -> RaftResult<Option<(TermId, Option<MemberId>)>> {
        if self.file.len()? < META_BYTES as u64 {
            return Ok(None);
        }
        let mut buf = self.file.read_at(0, META_BYTES)?;
        let term = TermId::new(buf.get_u64_le());
        let flag = buf.get_u8();
        let id = buf.get_u32_le();
        let voted_for = (flag != 0).then(|| MemberId::new(id));
        Ok(Some((term, voted_for)))
    }

    /// Persists the term and vote, syncing before returning.
    ///
    /// # Errors
    /// Returns an error if the write or sync fails.
    pub fn save(&mut self, term: TermId, voted_for: Option<MemberId>) -> RaftResult<()> {
        let mut buf = BytesMut::with_capacity(META_BYTES);
        buf.put_u64_le(term.get());
        match voted_for {
            Some(id) => {
                buf.put_u8(1);
                buf.put_u32_le(id.get());
            }
            None => {
                buf.put_u8(0);
                buf.put_u32_le(0);
            }
        }
        self.file.write_at(0, &buf)?;
        self.file.sync().map_err(RaftError::from)
    }
}
