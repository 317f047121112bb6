//! Pluggable storage backends for segment files.
//!
//! The log is only ever touched from its owning context thread, so the
//! storage seam is synchronous: positioned reads and writes against file
//! handles manufactured by a [`Storage`] implementation. `FsStorage` backs
//! segments with real files; `MemoryStorage` keeps them in process memory
//! for tests and simulation.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use bytes::Bytes;

use crate::error::{LogError, LogResult};

/// A storage backend that manufactures file handles.
pub trait Storage: Send + Sync + 'static {
    /// Creates a directory and all its parents.
    ///
    /// # Errors
    /// Returns an error if the directory cannot be created.
    fn create_dir_all(&self, dir: &Path) -> LogResult<()>;

    /// Opens (or creates) a file for positioned reads and writes.
    ///
    /// # Errors
    /// Returns an error if the file cannot be opened.
    fn open(&self, path: &Path) -> LogResult<Box<dyn StorageFile>>;

    /// Lists files in a directory with the given extension.
    ///
    /// # Errors
    /// Returns an error if the directory cannot be read.
    fn list(&self, dir: &Path, extension: &str) -> LogResult<Vec<PathBuf>>;

    /// Removes a file. Removing a missing file is not an error.
    ///
    /// # Errors
    /// Returns an error if the file exists but cannot be removed.
    fn remove(&self, path: &Path) -> LogResult<()>;
}

/// A single file opened through a [`Storage`] backend.
pub trait StorageFile: Send {
    /// Reads exactly `len` bytes at the given position.
    ///
    /// # Errors
    /// Returns an error if the read fails or hits end-of-file early.
    fn read_at(&self, position: u64, len: usize) -> LogResult<Bytes>;

    /// Writes all of `data` at the given position, extending the file if
    /// needed.
    ///
    /// # Errors
    /// Returns an error if the write fails.
    fn write_at(&mut self, position: u64, data: &[u8]) -> LogResult<()>;

    /// Returns the current file length in bytes.
    ///
    /// # Errors
    /// Returns an error if the length cannot be determined.
    fn len(&self) -> LogResult<u64>;

    /// Truncates or extends the file to the given length.
    ///
    /// # Errors
    /// Returns an error if the resize fails.
    fn set_len(&mut self, len: u64) -> LogResult<()>;

    /// Flushes all written data to durable storage.
    ///
    /// # Errors
    /// Returns an error if the sync fails.
    fn sync(&self) -> LogResult<()>;
}

/// Filesystem-backed storage.
#[derive(Debug, Clone, Copy, Default)]
pub struct FsStorage;

impl FsStorage {
    /// Creates a new filesystem storage backend.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

impl Storage for FsStorage {
    fn create_dir_all(&self, dir: &Path) -> LogResult<()> {
        std::fs::create_dir_all(dir).map_err(|e| LogError::io("create_dir", e))
    }

    fn open(&self, path: &Path) -> LogResult<Box<dyn StorageFile>> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(|e| LogError::io("open", e))?;
        Ok(Box::new(FsFile { file }))
    }

    fn list(&self, dir: &Path, extension: &str) -> LogResult<Vec<PathBuf>> {
        let mut paths = Vec::new();
        let entries = std::fs::read_dir(dir).map_err(|e| LogError::io("list", e))?;
        for entry in entries {
            let entry = entry.map_err(|e| LogError::io("list", e))?;
            let path = entry.path();
            if path.is_file() && path.extension().is_some_and(|e| e == extension) {
                paths.push(path);
            }
        }
        paths.sort();
        Ok(paths)
    }

    fn remove(&self, path: &Path) -> LogResult<()> {
        match std::fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(LogError::io("remove", e)),
        }
    }
}

/// A file handle backed by the local filesystem.
struct FsFile {
    file: File,
}

impl StorageFile for FsFile {
    fn read_at(&self, position: u64, len: usize) -> LogResult<Bytes> {
        use std::os::unix::fs::FileExt;

        let mut buf = vec![0u8; len];
        let mut read = 0;
        while read < len {
            let n = self
                .file
                .read_at(&mut buf[read..], position + read as u64)
                .map_err(|e| LogError::io("read", e))?;
            if n == 0 {
                return Err(LogError::io("read", "unexpected end of file"));
            }
            read += n;
        }
        Ok(Bytes::from(buf))
    }

    fn write_at(&mut self, position: u64, data: &[u8]) -> LogResult<()> {
        use std::os::unix::fs::FileExt;

        self.file
            .write_all_at(data, position)
            .map_err(|e| LogError::io("write", e))
    }

    fn len(&self) -> LogResult<u64> {
        let meta = self.file.metadata().map_err(|e| LogError::io("len", e))?;
        Ok(meta.len())
    }

    fn set_len(&mut self, len: u64) -> LogResult<()> {
        self.file.set_len(len).map_err(|e| LogError::io("set_len", e))
    }

    fn sync(&self) -> LogResult<()> {
        self.file.sync_data().map_err(|e| LogError::io("sync", e))
    }
}

/// In-memory storage for tests.
///
/// Files are shared buffers: every handle opened for a path sees the same
/// contents, so "reopening" a log against the same `MemoryStorage` behaves
/// like a process restart against the same disk.
#[derive(Debug, Clone, Default)]
pub struct MemoryStorage {
    files: Arc<Mutex<HashMap<PathBuf, Arc<Mutex<Vec<u8>>>>>>,
}

impl MemoryStorage {
    /// Creates a new in-memory storage backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl Storage for MemoryStorage {
    fn create_dir_all(&self, _dir: &Path) -> LogResult<()> {
        Ok(())
    }

    fn open(&self, path: &Path) -> LogResult<Box<dyn StorageFile>> {
        let mut files = self.files.lock().expect("storage lock poisoned");
        let data = files
            .entry(path.to_path_buf())
            .or_insert_with(|| Arc::new(Mutex::new(Vec::new())))
            .clone();
        Ok(Box::new(MemoryFile { data }))
    }

    fn list(&self, dir: &Path, extension: &str) -> LogResult<Vec<PathBuf>> {
        let files = self.files.lock().expect("storage lock poisoned");
        let mut paths: Vec<PathBuf> = files
            .keys()
            .filter(|p| {
                p.parent() == Some(dir) && p.extension().is_some_and(|e| e == extension)
            })
            .cloned()
            .collect();
        paths.sort();
        Ok(paths)
    }

    fn remove(&self, path: &Path) -> LogResult<()> {
        let mut files = self.files.lock().expect("storage lock poisoned");
        files.remove(path);
        Ok(())
    }
}

/// A file handle backed by a shared in-memory buffer.
struct MemoryFile {
    data: Arc<Mutex<Vec<u8>>>,
}

impl StorageFile for MemoryFile {
    fn read_at(&self, position: u64, len: usize) -> LogResult<Bytes> {
        let data = self.data.lock().expect("file lock poisoned");
        let start = usize::try_from(position).map_err(|e| LogError::io("read", e))?;
        let end = start + len;
        if end > data.len() {
            return Err(LogError::io("read", "unexpected end of file"));
        }
        Ok(Bytes::copy_from_slice(&data[start..end]))
    }

    fn write_at(&mut self, position: u64, bytes: &[u8]) -> LogResult<()> {
        let mut data = self.data.lock().expect("file lock poisoned");
        let start = usize::try_from(position).map_err(|e| LogError::io("write", e))?;
        let end = start + bytes.len();
        if end > data.len() {
            data.resize(end, 0);
        }
        data[start..end].copy_from_slice(bytes);
        Ok(())
    }

    fn len(&self) -> LogResult<u64> {
        let data = self.data.lock().expect("file lock poisoned");
        Ok(data.len() as u64)
    }

    fn set_len(&mut self, len: u64) -> LogResult<()> {
        let mut data = self.data.lock().expect("file lock poisoned");
        let len = usize::try_from(len).map_err(|e| LogError::io("set_len", e))?;
        data.resize(len, 0);
        Ok(())
    }

    fn sync(&self) -> LogResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_storage_roundtrip() {
        let storage = MemoryStorage::new();
        let path = Path::new("/mem/test.log");

        let mut file = storage.open(path).unwrap();
        file.write_at(0, b"hello").unwrap();
        file.write_at(5, b" world").unwrap();

        assert_eq!(file.len().unwrap(), 11);
        assert_eq!(&file.read_at(0, 11).unwrap()[..], b"hello world");

        // A second handle sees the same contents.
        let other = storage.open(path).unwrap();
        assert_eq!(&other.read_at(6, 5).unwrap()[..], b"world");
    }

    #[test]
    fn test_memory_storage_list_and_remove() {
        let storage = MemoryStorage::new();
        let dir = Path::new("/mem");
        storage.open(&dir.join("a-001.log")).unwrap();
        storage.open(&dir.join("a-001.index")).unwrap();
        storage.open(&dir.join("a-002.log")).unwrap();

        let logs = storage.list(dir, "log").unwrap();
        assert_eq!(logs.len(), 2);

        storage.remove(&dir.join("a-001.log")).unwrap();
        assert_eq!(storage.list(dir, "log").unwrap().len(), 1);
    }

    #[test]
    fn test_memory_read_past_end_fails() {
        let storage = MemoryStorage::new();
        let mut file = storage.open(Path::new("/mem/short.log")).unwrap();
        file.write_at(0, b"abc").unwrap();
        assert!(file.read_at(0, 4).is_err());
    }

    #[test]
    fn test_fs_storage_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FsStorage::new();
        let path = dir.path().join("test.log");

        let mut file = storage.open(&path).unwrap();
        file.write_at(0, b"copycat").unwrap();
        file.sync().unwrap();

        assert_eq!(&file.read_at(0, 7).unwrap()[..], b"copycat");

        file.set_len(4).unwrap();
        assert_eq!(file.len().unwrap(), 4);
    }
}
