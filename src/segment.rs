//! Immutable on-disk sorted layer.
//!
//! A segment is a file of records in strictly ascending key order, plus
//! two in-memory companions built by a single scan at open time: a
//! membership filter over full keys and a prefix index giving the byte
//! offset to start scanning from. Point lookups go filter → index →
//! forward scan over the mapped bytes.
//!
//! Segments are produced two ways:
//!
//! - [`Segment::from_log`] collapses an unsorted write-ahead log
//!   (duplicates last-wins) into sorted records.
//! - [`Segment::merge`] joins two sorted segment files, newer side
//!   winning ties.
//!
//! Both write exactly where they are told; the engine builds under a
//! [`staging_path`] and publishes with [`Segment::rename`] so a crash
//! never leaves a half-written `.data` file.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::errcorrupt;
use crate::error::{Error, Result};
use crate::filter::KeyFilter;
use crate::index::PrefixIndex;
use crate::mmap::ByteView;
use crate::record::{self, RecordIter, SliceIter};

pub struct Segment {
    id: u64,
    path: PathBuf,
    view: ByteView,
    filter: KeyFilter,
    index: PrefixIndex,
}

impl Segment {
    /// Opens the segment file and scans it once, populating the filter and
    /// index and verifying that keys are strictly ascending. Any decoding
    /// failure or ordering violation is `Corrupt`.
    pub fn open(id: u64, path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let view = ByteView::open(&path)?;

        let mut filter = KeyFilter::new();
        let mut index = PrefixIndex::new();
        let mut prev_key: Option<&[u8]> = None;

        for entry in SliceIter::new(view.as_slice()) {
            let (key, _, offset) = entry?;
            if let Some(prev) = prev_key {
                if prev >= key {
                    return Err(errcorrupt!(
                        "segment {} keys not strictly ascending at offset {offset}",
                        path.display()
                    ));
                }
            }
            filter.add(key);
            index.add(key, offset);
            prev_key = Some(key);
        }

        Ok(Self {
            id,
            path,
            view,
            filter,
            index,
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Size of the backing file in bytes.
    pub fn file_size(&self) -> u64 {
        self.view.len() as u64
    }

    /// Point lookup. `None` means the key is not in this segment;
    /// `Some(None)` means the segment records its deletion.
    pub fn get(&self, key: &[u8]) -> Result<Option<Option<Vec<u8>>>> {
        if !self.filter.contains(key) {
            return Ok(None);
        }
        let offset = match self.index.find(key) {
            Some(offset) => offset,
            None => return Ok(None),
        };

        for entry in SliceIter::starting_at(self.view.as_slice(), offset) {
            let (record_key, value, _) = entry?;
            if record_key == key {
                if record::is_tombstone(value) {
                    return Ok(Some(None));
                }
                return Ok(Some(Some(value.to_vec())));
            }
            // Keys are ascending; once past the target it cannot appear.
            if record_key > key {
                break;
            }
        }
        Ok(None)
    }

    /// Renames the backing file and remaps the view over the new path.
    pub fn rename(&mut self, new_path: impl Into<PathBuf>) -> Result<()> {
        let new_path = new_path.into();
        std::fs::rename(&self.path, &new_path)?;
        self.view.remap(&new_path)?;
        self.path = new_path;
        Ok(())
    }

    /// Converts an unsorted write-ahead log into a sorted segment file at
    /// `segment_path`. Duplicate keys collapse to the last record; a torn
    /// record at the log tail ends the replay. Tombstones are written
    /// through — dropping them is only safe for a bottom-level merge.
    pub fn from_log(segment_path: &Path, log_path: &Path) -> Result<()> {
        let mut entries: BTreeMap<Vec<u8>, Vec<u8>> = BTreeMap::new();
        let reader = BufReader::new(File::open(log_path)?);
        for entry in RecordIter::new(reader) {
            match entry {
                Ok((key, value, _)) => {
                    entries.insert(key, value);
                }
                Err(Error::Corrupt(msg)) => {
                    tracing::warn!(log = %log_path.display(), %msg, "Torn record at log tail, stopping replay");
                    break;
                }
                Err(e) => return Err(e),
            }
        }

        let mut writer = BufWriter::new(File::create(segment_path)?);
        for (key, value) in &entries {
            record::encode(&mut writer, key, value)?;
        }
        writer.flush()?;
        Ok(())
    }

    /// Merges two sorted segment files into their sorted union at
    /// `output_path`. A key present in both sides takes the record from
    /// `newer_path`, including a tombstone, which preserves delete
    /// semantics through partial merges. With `elide_tombstones` the
    /// tombstones are dropped instead; callers pass it only when the
    /// output becomes the oldest segment.
    pub fn merge(
        output_path: &Path,
        newer_path: &Path,
        older_path: &Path,
        elide_tombstones: bool,
    ) -> Result<()> {
        let mut newer = RecordIter::new(BufReader::new(File::open(newer_path)?));
        let mut older = RecordIter::new(BufReader::new(File::open(older_path)?));

        let mut writer = BufWriter::new(File::create(output_path)?);

        let mut emit = |key: &[u8], value: &[u8]| -> Result<()> {
            if elide_tombstones && record::is_tombstone(value) {
                return Ok(());
            }
            record::encode(&mut writer, key, value)
        };

        // One record of look-ahead per side.
        let mut next_newer = newer.next().transpose()?;
        let mut next_older = older.next().transpose()?;

        loop {
            match (&next_newer, &next_older) {
                (Some((new_key, new_value, _)), Some((old_key, old_value, _))) => {
                    match new_key.cmp(old_key) {
                        std::cmp::Ordering::Less => {
                            emit(new_key, new_value)?;
                            next_newer = newer.next().transpose()?;
                        }
                        std::cmp::Ordering::Greater => {
                            emit(old_key, old_value)?;
                            next_older = older.next().transpose()?;
                        }
                        std::cmp::Ordering::Equal => {
                            emit(new_key, new_value)?;
                            next_newer = newer.next().transpose()?;
                            next_older = older.next().transpose()?;
                        }
                    }
                }
                (Some((key, value, _)), None) => {
                    emit(key, value)?;
                    next_newer = newer.next().transpose()?;
                }
                (None, Some((key, value, _))) => {
                    emit(key, value)?;
                    next_older = older.next().transpose()?;
                }
                (None, None) => break,
            }
        }

        writer.flush()?;
        Ok(())
    }
}

/// Build location for a segment file before it is renamed into place.
pub fn staging_path(path: &Path) -> PathBuf {
    let mut staged = path.as_os_str().to_owned();
    staged.push(".tmp");
    PathBuf::from(staged)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::TOMBSTONE;
    use tempfile::TempDir;

    fn create_temp_dir() -> TempDir {
        TempDir::new().expect("Failed to create temporary directory")
    }

    fn write_log(path: &Path, records: &[(&[u8], &[u8])]) {
        let mut buf = Vec::new();
        for (key, value) in records {
            record::encode(&mut buf, key, value).expect("encode failed");
        }
        std::fs::write(path, buf).expect("write failed");
    }

    fn read_segment(path: &Path) -> Vec<(Vec<u8>, Vec<u8>)> {
        let reader = BufReader::new(File::open(path).expect("open failed"));
        RecordIter::new(reader)
            .map(|entry| entry.map(|(key, value, _)| (key, value)))
            .collect::<Result<Vec<_>>>()
            .expect("decode failed")
    }

    #[test]
    fn test_from_log_sorts_and_collapses() {
        let dir = create_temp_dir();
        let log = dir.path().join("wal.log");
        let seg = dir.path().join("0.data");

        write_log(
            &log,
            &[
                (b"zebra", b"1"),
                (b"apple", b"2"),
                (b"zebra", b"3"),
                (b"mango", TOMBSTONE),
            ],
        );
        Segment::from_log(&seg, &log).expect("from_log failed");

        let records = read_segment(&seg);
        assert_eq!(
            records,
            vec![
                (b"apple".to_vec(), b"2".to_vec()),
                (b"mango".to_vec(), TOMBSTONE.to_vec()),
                (b"zebra".to_vec(), b"3".to_vec()),
            ]
        );
    }

    #[test]
    fn test_get_value_tombstone_absent() {
        let dir = create_temp_dir();
        let log = dir.path().join("wal.log");
        let seg = dir.path().join("0.data");

        write_log(&log, &[(b"key1", b"value1"), (b"key2", TOMBSTONE)]);
        Segment::from_log(&seg, &log).expect("from_log failed");

        let segment = Segment::open(0, &seg).expect("open failed");
        assert_eq!(segment.get(b"key1").unwrap(), Some(Some(b"value1".to_vec())));
        assert_eq!(segment.get(b"key2").unwrap(), Some(None));
        assert_eq!(segment.get(b"key3").unwrap(), None);
        assert_eq!(segment.get(b"").unwrap(), None);
    }

    #[test]
    fn test_keys_sharing_a_long_prefix_are_all_reachable() {
        let dir = create_temp_dir();
        let log = dir.path().join("wal.log");
        let seg = dir.path().join("0.data");

        // All three truncate to the same 7-byte index prefix.
        write_log(
            &log,
            &[
                (b"customer:a", b"1"),
                (b"customer:b", b"2"),
                (b"customer:c", b"3"),
            ],
        );
        Segment::from_log(&seg, &log).expect("from_log failed");

        let segment = Segment::open(0, &seg).expect("open failed");
        assert_eq!(segment.get(b"customer:a").unwrap(), Some(Some(b"1".to_vec())));
        assert_eq!(segment.get(b"customer:b").unwrap(), Some(Some(b"2".to_vec())));
        assert_eq!(segment.get(b"customer:c").unwrap(), Some(Some(b"3".to_vec())));
        assert_eq!(segment.get(b"customer:d").unwrap(), None);
    }

    #[test]
    fn test_open_rejects_unsorted_file() {
        let dir = create_temp_dir();
        let seg = dir.path().join("0.data");

        write_log(&seg, &[(b"b", b"1"), (b"a", b"2")]);
        assert!(matches!(Segment::open(0, &seg), Err(Error::Corrupt(_))));

        write_log(&seg, &[(b"a", b"1"), (b"a", b"2")]);
        assert!(matches!(Segment::open(0, &seg), Err(Error::Corrupt(_))));
    }

    #[test]
    fn test_open_empty_file() {
        let dir = create_temp_dir();
        let seg = dir.path().join("0.data");
        std::fs::write(&seg, b"").unwrap();

        let segment = Segment::open(0, &seg).expect("open failed");
        assert_eq!(segment.file_size(), 0);
        assert_eq!(segment.get(b"anything").unwrap(), None);
    }

    #[test]
    fn test_rename_keeps_lookups_working() {
        let dir = create_temp_dir();
        let log = dir.path().join("wal.log");
        let seg = dir.path().join("0.data.tmp");

        write_log(&log, &[(b"key", b"value")]);
        Segment::from_log(&seg, &log).expect("from_log failed");

        let mut segment = Segment::open(0, &seg).expect("open failed");
        let published = dir.path().join("0.data");
        segment.rename(&published).expect("rename failed");

        assert!(!seg.exists());
        assert_eq!(segment.path(), published.as_path());
        assert_eq!(segment.get(b"key").unwrap(), Some(Some(b"value".to_vec())));
    }

    #[test]
    fn test_merge_newer_wins_and_keeps_tombstones() {
        let dir = create_temp_dir();
        let older = dir.path().join("0.data");
        let newer = dir.path().join("1.data");
        let merged = dir.path().join("2.data");

        write_log(&older, &[(b"a", b"old"), (b"b", b"old"), (b"d", b"old")]);
        write_log(&newer, &[(b"b", b"new"), (b"c", b"new"), (b"d", TOMBSTONE)]);

        Segment::merge(&merged, &newer, &older, false).expect("merge failed");
        assert_eq!(
            read_segment(&merged),
            vec![
                (b"a".to_vec(), b"old".to_vec()),
                (b"b".to_vec(), b"new".to_vec()),
                (b"c".to_vec(), b"new".to_vec()),
                (b"d".to_vec(), TOMBSTONE.to_vec()),
            ]
        );
    }

    #[test]
    fn test_merge_can_elide_tombstones() {
        let dir = create_temp_dir();
        let older = dir.path().join("0.data");
        let newer = dir.path().join("1.data");
        let merged = dir.path().join("2.data");

        write_log(&older, &[(b"a", b"keep"), (b"b", b"shadowed")]);
        write_log(&newer, &[(b"b", TOMBSTONE), (b"c", TOMBSTONE)]);

        Segment::merge(&merged, &newer, &older, true).expect("merge failed");
        assert_eq!(read_segment(&merged), vec![(b"a".to_vec(), b"keep".to_vec())]);
    }

    #[test]
    fn test_staging_path_appends_suffix() {
        assert_eq!(
            staging_path(Path::new("/db/7.data")),
            PathBuf::from("/db/7.data.tmp")
        );
    }

    #[test]
    fn test_from_log_tolerates_torn_tail() {
        let dir = create_temp_dir();
        let log = dir.path().join("wal.log");
        let seg = dir.path().join("0.data");

        write_log(&log, &[(b"key", b"value")]);
        let mut bytes = std::fs::read(&log).unwrap();
        bytes.extend_from_slice(&[7, 7, 7]);
        std::fs::write(&log, bytes).unwrap();

        Segment::from_log(&seg, &log).expect("from_log failed");
        assert_eq!(read_segment(&seg), vec![(b"key".to_vec(), b"value".to_vec())]);
    }
}
