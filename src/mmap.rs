//! Read-only memory-mapped view over a file.

use memmap2::Mmap;
use std::fs::File;
use std::path::Path;

use crate::error::Result;

/// A read-only window onto a file's bytes. Empty files are never mapped
/// (mapping a zero-length file is an error on most platforms); they are
/// represented by an unmapped view whose slice is empty.
pub struct ByteView {
    mmap: Option<Mmap>,
}

impl ByteView {
    /// Maps the file at `path`.
    ///
    /// # Safety
    ///
    /// Uses `unsafe { Mmap::map(...) }` but is memory-safe under the
    /// engine's discipline: segment files are immutable once published and
    /// the mapping is read-only.
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        if file.metadata()?.len() == 0 {
            return Ok(Self { mmap: None });
        }
        let mmap = unsafe { Mmap::map(&file)? };
        Ok(Self { mmap: Some(mmap) })
    }

    /// Re-establishes the mapping over a (possibly renamed or extended)
    /// file.
    pub fn remap(&mut self, path: &Path) -> Result<()> {
        *self = Self::open(path)?;
        Ok(())
    }

    pub fn as_slice(&self) -> &[u8] {
        self.mmap.as_deref().unwrap_or(&[])
    }

    pub fn len(&self) -> usize {
        self.as_slice().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
