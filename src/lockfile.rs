//! Scoped advisory file locks.
//!
//! Every content access in this crate goes through [`LockedFile`]: it opens the
//! file, tries the lock once and hands back a guard. Contention is reported as
//! `LockUnavailable` rather than blocking. The lock is dropped together with the
//! descriptor on every exit path, including `?` returns.

use fs4::FileExt;
use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

use crate::error::{DatalinkError, DatalinkResult, IoResultExt};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockKind {
    Shared,
    Exclusive,
}

impl LockKind {
    fn access(self) -> &'static str {
        match self {
            LockKind::Shared => "reading",
            LockKind::Exclusive => "writing",
        }
    }
}

/// An open file holding an advisory lock until dropped.
#[derive(Debug)]
pub struct LockedFile {
    file: File,
    path: PathBuf,
    kind: LockKind,
}

impl LockedFile {
    /// Open an existing file read-only under a shared lock.
    pub fn open_shared(path: &Path) -> DatalinkResult<Self> {
        let file = File::open(path).io_context(|| format!("could not open file \"{}\"", path.display()))?;
        Self::lock(file, path, LockKind::Shared)
    }

    /// Open (creating if needed) for writing under an exclusive lock.
    /// The file is NOT truncated: callers truncate once the lock is held.
    pub fn open_exclusive(path: &Path) -> DatalinkResult<Self> {
        let file = write_options(false)
            .open(path)
            .io_context(|| format!("could not create file \"{}\"", path.display()))?;
        Self::lock(file, path, LockKind::Exclusive)
    }

    /// Create a file that must not exist yet, under an exclusive lock.
    pub fn create_new_exclusive(path: &Path) -> DatalinkResult<Self> {
        let file = write_options(true)
            .open(path)
            .io_context(|| format!("could not create file \"{}\"", path.display()))?;
        Self::lock(file, path, LockKind::Exclusive)
    }

    /// Try once to take `kind` on an already open file.
    pub fn lock(file: File, path: &Path, kind: LockKind) -> DatalinkResult<Self> {
        let res = match kind {
            LockKind::Shared => FileExt::try_lock_shared(&file),
            LockKind::Exclusive => FileExt::try_lock_exclusive(&file),
        };
        match res {
            Ok(()) => Ok(Self { file, path: path.to_path_buf(), kind }),
            Err(e) if is_contended(&e) => Err(DatalinkError::lock_unavailable(path, kind.access())),
            Err(e) => Err(DatalinkError::io(format!("could not lock file \"{}\"", path.display()), e)),
        }
    }

    pub fn file(&self) -> &File { &self.file }

    pub fn file_mut(&mut self) -> &mut File { &mut self.file }

    pub fn path(&self) -> &Path { &self.path }

    pub fn kind(&self) -> LockKind { self.kind }

    /// Truncate to zero bytes. Only meaningful under an exclusive lock.
    pub fn truncate(&self) -> DatalinkResult<()> {
        debug_assert_eq!(self.kind, LockKind::Exclusive);
        self.file
            .set_len(0)
            .io_context(|| format!("could not truncate file \"{}\"", self.path.display()))
    }

    /// Flush file data and metadata to stable storage.
    pub fn sync(&self) -> DatalinkResult<()> {
        self.file
            .sync_all()
            .io_context(|| format!("could not fsync file \"{}\"", self.path.display()))
    }
}

impl Drop for LockedFile {
    fn drop(&mut self) {
        // The close that follows releases the lock too.
        let _ = FileExt::unlock(&self.file);
    }
}

fn write_options(create_new: bool) -> OpenOptions {
    let mut opts = OpenOptions::new();
    opts.read(true).write(true);
    if create_new { opts.create_new(true); } else { opts.create(true); }
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        opts.mode(0o644);
    }
    opts
}

fn is_contended(e: &io::Error) -> bool {
    if e.kind() == io::ErrorKind::WouldBlock {
        return true;
    }
    // ERROR_LOCK_VIOLATION
    #[cfg(windows)]
    if e.raw_os_error() == Some(33) {
        return true;
    }
    false
}

#[cfg(test)]
#[path = "lockfile_tests.rs"]
mod lockfile_tests;
