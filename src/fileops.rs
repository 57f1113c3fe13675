//! Locked file primitives used by the SQL layer on external files.
//!
//! Content is only touched under an advisory lock taken through
//! [`LockedFile`]: shared for reads, exclusive for writes. Lock contention comes
//! back as `LockUnavailable` and is never waited on.

use std::fs;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::error::{DatalinkError, DatalinkResult, IoResultExt};
use crate::lockfile::LockedFile;

pub const COPY_BUFFER_SIZE: usize = 8192;

/// Largest single read_range result.
pub const MAX_READ_BYTES: u64 = 1 << 30;

fn warn_if_busy<T>(r: DatalinkResult<T>) -> DatalinkResult<T> {
    if let Err(e @ DatalinkError::LockUnavailable { .. }) = &r {
        warn!(target: "datalink", "{}", e);
    }
    r
}

/// Copy `src` to `dst` in fixed-size chunks. The destination is fsynced before
/// the locks are released. Returns the number of bytes copied.
pub fn copy(src: &Path, dst: &Path) -> DatalinkResult<u64> {
    warn_if_busy(copy_locked(src, dst))
}

fn copy_locked(src: &Path, dst: &Path) -> DatalinkResult<u64> {
    let input = LockedFile::open_shared(src)?;
    let mut output = LockedFile::open_exclusive(dst)?;
    output.truncate()?;

    let mut buf = [0u8; COPY_BUFFER_SIZE];
    let mut total: u64 = 0;
    loop {
        let n = match (&*input.file()).read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(DatalinkError::io(format!("could not read server file \"{}\"", src.display()), e)),
        };
        let written = output
            .file_mut()
            .write(&buf[..n])
            .io_context(|| format!("could not write server file \"{}\"", dst.display()))?;
        if written != n {
            return Err(DatalinkError::io(
                format!("short write to server file \"{}\": {} of {} bytes", dst.display(), written, n),
                io::Error::from(io::ErrorKind::WriteZero),
            ));
        }
        total += n as u64;
    }
    output.sync()?;
    debug!(target: "datalink", src = %src.display(), dst = %dst.display(), bytes = total, "file copied");
    Ok(total)
}

/// Read a byte range under a shared lock.
///
/// A negative `offset` counts back from the end of the file. `len = None` reads
/// to the end. Returns `Ok(None)` when the file (following symlinks) does not exist.
pub fn read_range(path: &Path, offset: i64, len: Option<u64>) -> DatalinkResult<Option<Vec<u8>>> {
    let guard = match LockedFile::open_shared(path) {
        Ok(g) => g,
        Err(e) if e.is_not_found() => return Ok(None),
        Err(e) => return Err(e),
    };
    let size = guard
        .file()
        .metadata()
        .io_context(|| format!("could not stat file \"{}\"", path.display()))?
        .len();

    let start = if offset >= 0 {
        (offset as u64).min(size)
    } else {
        size.saturating_sub(offset.unsigned_abs())
    };
    let want = len.unwrap_or(size - start).min(size - start);
    if want > MAX_READ_BYTES {
        return Err(DatalinkError::InvalidArgument(format!("requested length {} is too large", want)));
    }

    let mut f = guard.file();
    f.seek(SeekFrom::Start(start))
        .io_context(|| format!("could not seek in file \"{}\"", path.display()))?;
    let mut out = Vec::with_capacity(want as usize);
    f.take(want)
        .read_to_end(&mut out)
        .io_context(|| format!("could not read file \"{}\"", path.display()))?;
    Ok(Some(out))
}

/// Replace the content of `path` with `data` under an exclusive lock, then fsync.
pub fn write(path: &Path, data: &[u8]) -> DatalinkResult<()> {
    warn_if_busy(write_locked(path, data))
}

fn write_locked(path: &Path, data: &[u8]) -> DatalinkResult<()> {
    let mut guard = LockedFile::open_exclusive(path)?;
    guard.truncate()?;
    guard
        .file_mut()
        .write_all(data)
        .io_context(|| format!("could not write server file \"{}\"", path.display()))?;
    guard.sync()
}

pub fn rename(src: &Path, dst: &Path) -> DatalinkResult<()> {
    fs::rename(src, dst)
        .io_context(|| format!("could not rename file \"{}\" to \"{}\"", src.display(), dst.display()))
}

/// Unlink a file or symlink. Returns false if nothing was there.
pub fn unlink(path: &Path) -> DatalinkResult<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(DatalinkError::io(format!("could not unlink file \"{}\"", path.display()), e)),
    }
}

/// Create a symlink at `link` pointing to `target`.
pub fn create_link(link: &Path, target: &Path) -> DatalinkResult<()> {
    make_symlink(target, link)
        .io_context(|| format!("could not symlink \"{}\" to \"{}\"", link.display(), target.display()))
}

/// Point the existing symlink `link` at `new_target`. A temporary link is
/// renamed over the old one so `link` never disappears in between.
pub fn relink(link: &Path, new_target: &Path) -> DatalinkResult<()> {
    if !is_symlink(link)? {
        return Err(DatalinkError::InvalidArgument(format!("\"{}\" is not a symlink", link.display())));
    }
    let name = link
        .file_name()
        .ok_or_else(|| DatalinkError::InvalidArgument(format!("\"{}\" has no file name", link.display())))?;
    let tmp = link.with_file_name(format!(".{}.{}.relink", name.to_string_lossy(), uuid::Uuid::new_v4().simple()));
    make_symlink(new_target, &tmp)
        .io_context(|| format!("could not symlink \"{}\" to \"{}\"", tmp.display(), new_target.display()))?;
    if let Err(e) = fs::rename(&tmp, link) {
        let _ = fs::remove_file(&tmp);
        return Err(DatalinkError::io(format!("could not replace symlink \"{}\"", link.display()), e));
    }
    Ok(())
}

/// True if `path` itself is a symlink. Missing paths are not symlinks.
pub fn is_symlink(path: &Path) -> DatalinkResult<bool> {
    match fs::symlink_metadata(path) {
        Ok(m) => Ok(m.file_type().is_symlink()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(DatalinkError::io(format!("could not stat file \"{}\"", path.display()), e)),
    }
}

/// Target of the symlink at `path`, or `None` when it is missing or not a symlink.
pub fn symlink_target(path: &Path) -> DatalinkResult<Option<PathBuf>> {
    if !is_symlink(path)? {
        return Ok(None);
    }
    fs::read_link(path)
        .map(Some)
        .io_context(|| format!("could not get target file path for \"{}\"", path.display()))
}

#[cfg(unix)]
fn make_symlink(target: &Path, link: &Path) -> io::Result<()> { std::os::unix::fs::symlink(target, link) }

#[cfg(windows)]
fn make_symlink(target: &Path, link: &Path) -> io::Result<()> { std::os::windows::fs::symlink_file(target, link) }

#[cfg(test)]
#[path = "fileops_tests.rs"]
mod fileops_tests;
