use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

#[cfg(unix)]
use std::os::unix::io::AsRawFd;

/// An exclusive advisory lock on the database directory. Held for the
/// lifetime of the engine; released when dropped.
pub struct FileLock {
    _file: File,
    path: PathBuf,
}

impl FileLock {
    /// Creates a new FileLock and locks the file.
    /// The lock file contains the process ID for debugging purposes.
    pub fn lock<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)?;

        Self::try_lock(&file)
            .map_err(|e| Error::Locked(format!("{}: {}", path.display(), e)))?;

        // Write process ID to the lock file for debugging
        writeln!(file, "{}", std::process::id())?;
        file.flush()?;

        Ok(Self { _file: file, path })
    }

    #[cfg(unix)]
    fn try_lock(file: &File) -> std::io::Result<()> {
        use libc::{flock, LOCK_EX, LOCK_NB};

        let fd = file.as_raw_fd();
        let result = unsafe { flock(fd, LOCK_EX | LOCK_NB) };
        if result != 0 {
            return Err(std::io::Error::last_os_error());
        }
        Ok(())
    }

    #[cfg(not(unix))]
    fn try_lock(_file: &File) -> std::io::Result<()> {
        // No advisory locking on this platform; single-process use is
        // assumed.
        Ok(())
    }

    /// Get the path of the lock file
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        // The lock is released when the file handle closes. The lock file
        // itself is left in place to avoid unlink races with a concurrent
        // opener.
    }
}
