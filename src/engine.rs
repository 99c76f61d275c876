//! The storage engine: a log-structured merge pipeline over byte-string
//! keys and values.
//!
//! # Architecture
//!
//! Writes land in a mutable in-memory buffer mirrored to a write-ahead
//! log; frozen snapshots of that buffer are converted to immutable sorted
//! segments by a background worker, which also merges adjacent segments to
//! bound read amplification.
//!
//! ```text
//! set/remove                    get
//!     │                          │
//!     ▼                          ▼
//! ┌──────────────────┐   1. ┌──────────────┐
//! │   WriteBuffer    │◄─────┤ layered read │
//! │ (uncommitted.log)│      │ newest-first │
//! └────────┬─────────┘      └──────────────┘
//!          │ rotate (rename log + move map)
//!          ▼
//! ┌──────────────────┐   2.
//! │  frozen buffer   │◄─────
//! │ (committing.log) │
//! └────────┬─────────┘
//!          │ flush (sort, write, publish)
//!          ▼
//! ┌──────────────────┐   3.
//! │     segments     │◄─────
//! │ <N>.data, newest │
//! │ id wins          │
//! └────────┬─────────┘
//!          │ compact (merge two newest)
//!          ▼
//!        fewer, larger segments
//! ```
//!
//! # Data Flow
//!
//! ## Write Path
//! 1. `set`/`remove` append to the live buffer's log and update its map
//! 2. Past the rotation threshold, `uncommitted.log` is renamed to
//!    `committing.log` and the map moves to the frozen buffer
//! 3. The worker flushes the frozen buffer into a new sorted segment
//! 4. The worker merges the two newest segments when they are small enough
//!
//! ## Read Path
//! Live buffer → frozen buffer → segments from newest to oldest. The
//! first layer that knows the key decides: a tombstone there means the key
//! is gone, no older layer is consulted.
//!
//! # Concurrency and Recovery
//!
//! One writer and any number of readers are supported; the engine owns a
//! single background thread, joined on drop. Recovery needs no replay
//! machinery of its own: opening the directory re-reads the two logs into
//! buffers and re-scans the `<N>.data` files, because the logs *are* the
//! recovery state.

use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::buffer::WriteBuffer;
use crate::config::Config;
use crate::errcorrupt;
use crate::error::Result;
use crate::flock::FileLock;
use crate::segment::{staging_path, Segment};

const UNCOMMITTED_LOG: &str = "uncommitted.log";
const COMMITTING_LOG: &str = "committing.log";
const LOCK_FILE: &str = "engine.lock";
const SEGMENT_EXT: &str = "data";
const STAGING_EXT: &str = "tmp";

/// State shared between the engine handle and its background worker.
struct Shared {
    config: Config,

    /// Live mutable layer, mirrored to `uncommitted.log`.
    buffer: WriteBuffer,
    /// Frozen snapshot awaiting flush, mirrored to `committing.log`.
    /// Present iff a rotation is in progress.
    committing: Mutex<Option<WriteBuffer>>,
    /// Immutable sorted layers by id; the largest id is the newest.
    segments: Mutex<BTreeMap<u64, Segment>>,

    next_segment_id: AtomicU64,
    running: AtomicBool,
    /// Serializes flush against compaction so a merge plan cannot be
    /// invalidated by a concurrent segment insertion.
    maintenance: Mutex<()>,
}

impl Shared {
    fn uncommitted_path(&self) -> PathBuf {
        self.config.dir.join(UNCOMMITTED_LOG)
    }

    fn committing_path(&self) -> PathBuf {
        self.config.dir.join(COMMITTING_LOG)
    }

    fn segment_path(&self, id: u64) -> PathBuf {
        self.config.dir.join(format!("{id}.{SEGMENT_EXT}"))
    }

    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        if let Some(value) = self.buffer.get(key)? {
            return Ok(value);
        }

        {
            let committing = self.committing.lock()?;
            if let Some(frozen) = &*committing {
                if let Some(value) = frozen.get(key)? {
                    return Ok(value);
                }
            }
        }

        let segments = self.segments.lock()?;
        for segment in segments.values().rev() {
            if let Some(value) = segment.get(key)? {
                return Ok(value);
            }
        }
        Ok(None)
    }

    /// Freezes the live buffer: rename `uncommitted.log` to
    /// `committing.log`, move the map into a frozen buffer, give the live
    /// buffer a fresh empty log. A no-op while a frozen buffer exists or
    /// the live buffer is empty.
    ///
    /// Readers that miss the live map serialize behind the frozen-buffer
    /// lock held here, so the swap is never observable as a gap.
    fn rotate(&self) -> Result<()> {
        let mut committing = self.committing.lock()?;
        if committing.is_some() || self.buffer.is_empty() {
            return Ok(());
        }

        fs::rename(self.uncommitted_path(), self.committing_path())?;
        let data = self.buffer.take_data()?;
        *committing = Some(WriteBuffer::with_data(self.committing_path(), data)?);
        self.buffer.reset()?;
        Ok(())
    }

    /// Converts the frozen buffer's log into a new segment. A no-op when
    /// nothing is staged.
    fn flush(&self) -> Result<()> {
        let _maintenance = self.maintenance.lock()?;

        {
            let committing = self.committing.lock()?;
            match &*committing {
                Some(frozen) if !frozen.is_empty() => {}
                _ => return Ok(()),
            }
        }

        let id = self.next_segment_id.fetch_add(1, Ordering::SeqCst);
        let path = self.segment_path(id);
        let staged = staging_path(&path);

        Segment::from_log(&staged, &self.committing_path())?;
        let mut segment = Segment::open(id, &staged)?;
        segment.rename(&path)?;

        self.segments.lock()?.insert(id, segment);

        // The key is now served from the segment; only then is the frozen
        // layer torn down.
        let frozen = self.committing.lock()?.take();
        if let Some(frozen) = frozen {
            frozen.delete()?;
        }

        tracing::info!(segment_id = id, "Flushed committing log to segment");
        Ok(())
    }

    /// Merges the two newest segments when their combined file size fits
    /// the configured bound. The merged output takes a fresh id larger
    /// than both inputs, so id order keeps matching recency order on disk
    /// and across restarts. Tombstones are dropped only when the pair is
    /// the entire segment set, i.e. nothing older could resurrect the key.
    fn compact(&self) -> Result<()> {
        let _maintenance = self.maintenance.lock()?;

        let plan = {
            let segments = self.segments.lock()?;
            let mut newest_first = segments.values().rev();
            match (newest_first.next(), newest_first.next()) {
                (Some(newer), Some(older))
                    if newer.file_size() + older.file_size() <= self.config.max_merge_size =>
                {
                    Some(MergePlan {
                        newer_id: newer.id(),
                        newer_path: newer.path().to_path_buf(),
                        older_id: older.id(),
                        older_path: older.path().to_path_buf(),
                        is_whole_set: segments.len() == 2,
                    })
                }
                _ => None,
            }
        };
        let Some(plan) = plan else {
            return Ok(());
        };

        let id = self.next_segment_id.fetch_add(1, Ordering::SeqCst);
        let path = self.segment_path(id);
        let staged = staging_path(&path);

        Segment::merge(&staged, &plan.newer_path, &plan.older_path, plan.is_whole_set)?;
        let mut segment = Segment::open(id, &staged)?;
        segment.rename(&path)?;

        {
            let mut segments = self.segments.lock()?;
            segments.insert(id, segment);
            segments.remove(&plan.older_id);
            segments.remove(&plan.newer_id);
            // Unlinked after the swap: if an unlink fails, the stray file
            // reloads on restart below the merged segment and stays
            // shadowed by it.
            fs::remove_file(&plan.older_path)?;
            fs::remove_file(&plan.newer_path)?;
        }

        tracing::info!(
            older_id = plan.older_id,
            newer_id = plan.newer_id,
            segment_id = id,
            "Compacted adjacent segments"
        );
        Ok(())
    }
}

struct MergePlan {
    newer_id: u64,
    newer_path: PathBuf,
    older_id: u64,
    older_path: PathBuf,
    is_whole_set: bool,
}

fn worker_loop(shared: &Shared) {
    loop {
        // Parked rather than slept so shutdown can interrupt the wait.
        std::thread::park_timeout(shared.config.worker_interval);
        if !shared.running.load(Ordering::SeqCst) {
            return;
        }
        if let Err(e) = shared.compact() {
            tracing::error!(error = %e, "Background compaction failed");
        }
        if let Err(e) = shared.flush() {
            tracing::error!(error = %e, "Background flush failed");
        }
    }
}

/// The public handle to a database directory.
pub struct Engine {
    shared: Arc<Shared>,
    worker: Option<JoinHandle<()>>,
    // Declared last: the directory stays locked until everything else,
    // including the final flush in Drop, is done.
    _lock: FileLock,
}

impl Engine {
    /// Opens a database with default configuration, creating the
    /// directory if missing.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        Self::open_with_config(Config::new(dir))
    }

    /// Opens a database with custom configuration.
    pub fn open_with_config(config: Config) -> Result<Self> {
        fs::create_dir_all(&config.dir)?;
        let lock = FileLock::lock(config.dir.join(LOCK_FILE))?;

        let mut segments = BTreeMap::new();
        for entry in fs::read_dir(&config.dir)? {
            let path = entry?.path();
            match path.extension().and_then(|ext| ext.to_str()) {
                Some(STAGING_EXT) => {
                    // A crash mid-build; the segment was never published.
                    tracing::warn!(file = %path.display(), "Removing stale staging file");
                    fs::remove_file(&path)?;
                }
                Some(SEGMENT_EXT) => {
                    let id = path
                        .file_stem()
                        .and_then(|stem| stem.to_str())
                        .and_then(|stem| stem.parse::<u64>().ok())
                        .ok_or_else(|| {
                            errcorrupt!("unexpected segment file name {}", path.display())
                        })?;
                    segments.insert(id, Segment::open(id, &path)?);
                }
                _ => {}
            }
        }
        let next_segment_id = segments.keys().next_back().map_or(0, |id| id + 1);

        let buffer = WriteBuffer::open(config.dir.join(UNCOMMITTED_LOG))?;

        // A leftover committing log means the previous run died between
        // rotate and flush. Adopt it as the frozen buffer so its keys are
        // readable right away; the worker will flush it.
        let committing_path = config.dir.join(COMMITTING_LOG);
        let committing = if committing_path.try_exists()? {
            if fs::metadata(&committing_path)?.len() == 0 {
                tracing::warn!("Removing stray empty committing log");
                fs::remove_file(&committing_path)?;
                None
            } else {
                tracing::info!("Adopting committing log left by an earlier run");
                Some(WriteBuffer::open(&committing_path)?)
            }
        } else {
            None
        };

        let shared = Arc::new(Shared {
            config,
            buffer,
            committing: Mutex::new(committing),
            segments: Mutex::new(segments),
            next_segment_id: AtomicU64::new(next_segment_id),
            running: AtomicBool::new(true),
            maintenance: Mutex::new(()),
        });

        let worker = {
            let shared = Arc::clone(&shared);
            std::thread::spawn(move || worker_loop(&shared))
        };

        Ok(Self {
            shared,
            worker: Some(worker),
            _lock: lock,
        })
    }

    /// Stores `key` → `value`. Durable in the write-ahead log (flushed to
    /// the operating system) before returning; rotates the live buffer
    /// when it grows past the configured threshold.
    pub fn set(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.shared.buffer.set(key, value)?;
        if self.shared.buffer.len() > self.shared.config.rotate_threshold {
            self.rotate()?;
        }
        Ok(())
    }

    /// Deletes `key`. A tombstone is recorded; older occurrences of the
    /// key stay shadowed until compaction retires them.
    pub fn remove(&self, key: &[u8]) -> Result<()> {
        self.shared.buffer.remove(key)?;
        if self.shared.buffer.len() > self.shared.config.rotate_threshold {
            self.rotate()?;
        }
        Ok(())
    }

    /// Looks up `key` across all layers, newest first.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.shared.get(key)
    }

    /// Freezes the live buffer so writes continue into a fresh one. See
    /// [`Shared::rotate`]; normally invoked by the write path.
    pub fn rotate(&self) -> Result<()> {
        self.shared.rotate()
    }

    /// Converts a frozen buffer into a segment now instead of waiting for
    /// the background worker.
    pub fn flush(&self) -> Result<()> {
        self.shared.flush()
    }

    /// Runs one compaction step now instead of waiting for the background
    /// worker.
    pub fn compact(&self) -> Result<()> {
        self.shared.compact()
    }

    /// Number of on-disk segments currently serving reads.
    pub fn segment_count(&self) -> usize {
        self.shared
            .segments
            .lock()
            .map_or(0, |segments| segments.len())
    }

    /// Blocks until every buffered write has reached a segment: rotates
    /// the live buffer and waits for the background worker to drain the
    /// frozen one.
    pub fn await_idle(&self) -> Result<()> {
        loop {
            self.rotate()?;
            let drained = self.shared.buffer.is_empty() && self.shared.committing.lock()?.is_none();
            if drained {
                return Ok(());
            }
            std::thread::sleep(Duration::from_millis(10));
        }
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.shared.running.store(false, Ordering::SeqCst);
        if let Some(worker) = self.worker.take() {
            worker.thread().unpark();
            if worker.join().is_err() {
                tracing::error!("Background worker panicked");
            }
        }

        // Persist residual state: drain any frozen buffer, stage the live
        // one, drain again. Failures are logged; the logs replay on the
        // next open either way.
        if let Err(e) = self.shared.flush() {
            tracing::error!(error = %e, "Final flush failed");
        }
        if let Err(e) = self.shared.rotate() {
            tracing::error!(error = %e, "Final rotation failed");
        }
        if let Err(e) = self.shared.flush() {
            tracing::error!(error = %e, "Final flush failed");
        }
    }
}
