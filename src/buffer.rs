//! The mutable in-memory layer, mirrored to a write-ahead log.
//!
//! Mutations go to an in-memory hash map and are appended to an
//! append-only log file, flushed to the operating system before the call
//! returns. Lookups never touch disk. On open the map is rebuilt by
//! replaying the log from the start; the last record wins for duplicated
//! keys, and a torn trailing record (a crash mid-append) ends the replay
//! rather than failing it.
//!
//! Rotation support: the engine renames the log file away, moves the map
//! out with [`WriteBuffer::take_data`], rebuilds a frozen buffer over the
//! renamed log with [`WriteBuffer::with_data`], and gives the live buffer
//! a fresh empty log with [`WriteBuffer::reset`].

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, RwLock};

use crate::error::{Error, Result};
use crate::record::{self, RecordIter, TOMBSTONE};

pub struct WriteBuffer {
    path: PathBuf,
    wal: Mutex<BufWriter<File>>,
    data: RwLock<HashMap<Vec<u8>, Vec<u8>>>,
}

impl WriteBuffer {
    /// Opens the log at `path` in append mode, creating it if missing, and
    /// replays any existing records into memory.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let wal = Self::append_handle(&path)?;

        let mut data = HashMap::new();
        if std::fs::metadata(&path)?.len() > 0 {
            Self::replay(&path, &mut data)?;
        }

        Ok(Self {
            path,
            wal: Mutex::new(wal),
            data: RwLock::new(data),
        })
    }

    /// Builds a buffer over an already-written log without replaying it,
    /// adopting `data` as the in-memory state. Used when the engine
    /// freezes the live buffer: the map was moved, the file was renamed.
    pub fn with_data(path: impl Into<PathBuf>, data: HashMap<Vec<u8>, Vec<u8>>) -> Result<Self> {
        let path = path.into();
        let wal = Self::append_handle(&path)?;

        Ok(Self {
            path,
            wal: Mutex::new(wal),
            data: RwLock::new(data),
        })
    }

    fn append_handle(path: &Path) -> Result<BufWriter<File>> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(BufWriter::new(file))
    }

    fn replay(path: &Path, data: &mut HashMap<Vec<u8>, Vec<u8>>) -> Result<()> {
        let reader = BufReader::new(File::open(path)?);
        for entry in RecordIter::new(reader) {
            match entry {
                Ok((key, value, _)) => {
                    data.insert(key, value);
                }
                Err(Error::Corrupt(msg)) => {
                    // A partial record at the tail of the log is a crash
                    // mid-append; everything before it is intact. The torn
                    // bytes die with the log at the next rotation.
                    tracing::warn!(log = %path.display(), %msg, "Torn record at log tail, stopping replay");
                    break;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Stores `key` → `value`. Appends to the log and flushes the
    /// user-space buffer before the in-memory entry is updated; if the
    /// append fails the map is left untouched. Storing a value identical
    /// to the current one is a no-op.
    pub fn set(&self, key: &[u8], value: &[u8]) -> Result<()> {
        let mut data = self.data.write()?;
        if data.get(key).is_some_and(|current| current == value) {
            return Ok(());
        }

        {
            let mut wal = self.wal.lock()?;
            record::encode(&mut *wal, key, value)?;
            wal.flush()?;
        }

        data.insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    /// Marks `key` as deleted by storing the tombstone sentinel.
    pub fn remove(&self, key: &[u8]) -> Result<()> {
        self.set(key, TOMBSTONE)
    }

    /// Looks up `key` in memory. `None` means the key is not present in
    /// this layer; `Some(None)` means it was deleted here.
    pub fn get(&self, key: &[u8]) -> Result<Option<Option<Vec<u8>>>> {
        let data = self.data.read()?;
        Ok(data.get(key).map(|value| {
            if record::is_tombstone(value) {
                None
            } else {
                Some(value.clone())
            }
        }))
    }

    pub fn len(&self) -> usize {
        self.data.read().map_or(0, |data| data.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Moves the in-memory map out, leaving the buffer's map empty.
    pub fn take_data(&self) -> Result<HashMap<Vec<u8>, Vec<u8>>> {
        Ok(std::mem::take(&mut *self.data.write()?))
    }

    /// Reopens the log as a fresh empty file at the buffer's path and
    /// drops the in-memory map. Called after the old log file was renamed
    /// away by a rotation.
    pub fn reset(&self) -> Result<()> {
        let mut data = self.data.write()?;
        let mut wal = self.wal.lock()?;
        *wal = Self::append_handle(&self.path)?;
        data.clear();
        Ok(())
    }

    /// Closes the log and removes its file.
    pub fn delete(self) -> Result<()> {
        let path = self.path;
        drop(self.wal);
        std::fs::remove_file(&path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn create_temp_dir() -> TempDir {
        TempDir::new().expect("Failed to create temporary directory")
    }

    fn log_len(path: &Path) -> u64 {
        fs::metadata(path).map(|m| m.len()).unwrap_or(0)
    }

    #[test]
    fn test_set_get_remove() {
        let dir = create_temp_dir();
        let buffer = WriteBuffer::open(dir.path().join("wal.log")).expect("open failed");

        buffer.set(b"key1", b"value1").expect("set failed");
        buffer.set(b"key2", b"value2").expect("set failed");

        assert_eq!(buffer.get(b"key1").unwrap(), Some(Some(b"value1".to_vec())));
        assert_eq!(buffer.get(b"key2").unwrap(), Some(Some(b"value2".to_vec())));
        assert_eq!(buffer.get(b"key3").unwrap(), None);

        buffer.remove(b"key1").expect("remove failed");
        assert_eq!(buffer.get(b"key1").unwrap(), Some(None));
        assert_eq!(buffer.len(), 2);
    }

    #[test]
    fn test_identical_set_appends_nothing() {
        let dir = create_temp_dir();
        let path = dir.path().join("wal.log");
        let buffer = WriteBuffer::open(&path).expect("open failed");

        buffer.set(b"key", b"value").expect("set failed");
        let len_after_first = log_len(&path);
        assert!(len_after_first > 0);

        buffer.set(b"key", b"value").expect("set failed");
        assert_eq!(log_len(&path), len_after_first);

        buffer.set(b"key", b"other").expect("set failed");
        assert!(log_len(&path) > len_after_first);
    }

    #[test]
    fn test_replay_restores_state() {
        let dir = create_temp_dir();
        let path = dir.path().join("wal.log");

        {
            let buffer = WriteBuffer::open(&path).expect("open failed");
            buffer.set(b"key1", b"value1").expect("set failed");
            buffer.set(b"key1", b"value2").expect("set failed");
            buffer.remove(b"gone").expect("remove failed");
        }

        let buffer = WriteBuffer::open(&path).expect("reopen failed");
        assert_eq!(buffer.get(b"key1").unwrap(), Some(Some(b"value2".to_vec())));
        assert_eq!(buffer.get(b"gone").unwrap(), Some(None));
        assert_eq!(buffer.len(), 2);
    }

    #[test]
    fn test_torn_tail_is_tolerated() {
        let dir = create_temp_dir();
        let path = dir.path().join("wal.log");

        {
            let buffer = WriteBuffer::open(&path).expect("open failed");
            buffer.set(b"whole", b"record").expect("set failed");
        }

        // Simulate a crash mid-append: a dangling length prefix.
        let mut bytes = fs::read(&path).unwrap();
        bytes.extend_from_slice(&[9, 0, 0, 0]);
        fs::write(&path, bytes).unwrap();

        let buffer = WriteBuffer::open(&path).expect("reopen failed");
        assert_eq!(buffer.get(b"whole").unwrap(), Some(Some(b"record".to_vec())));
        assert_eq!(buffer.len(), 1);
    }

    #[test]
    fn test_take_data_and_adopt() {
        let dir = create_temp_dir();
        let live_path = dir.path().join("live.log");
        let frozen_path = dir.path().join("frozen.log");

        let buffer = WriteBuffer::open(&live_path).expect("open failed");
        buffer.set(b"key", b"value").expect("set failed");

        fs::rename(&live_path, &frozen_path).unwrap();
        let map = buffer.take_data().expect("take failed");
        buffer.reset().expect("reset failed");

        let frozen = WriteBuffer::with_data(&frozen_path, map).expect("adopt failed");
        assert_eq!(frozen.get(b"key").unwrap(), Some(Some(b"value".to_vec())));
        assert!(buffer.is_empty());
        assert_eq!(log_len(&live_path), 0);

        frozen.delete().expect("delete failed");
        assert!(!frozen_path.exists());
    }
}
