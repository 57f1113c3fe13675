//! Token store
//! -----------
//! One file per live access token under the token directory. The file name is
//! the caller-supplied token id; the content is a fixed-size binary record:
//!
//! ```text
//! offset  size  field
//!      0     1  mode ('R' | 'W')
//!      1     3  reserved, zero
//!      4     4  owner txid (u32 LE, 0 = invalid)
//!      8     8  created_at (i64 LE, unix millis)
//!     16  4096  target path, UTF-8, NUL-terminated and NUL-padded
//! ```
//!
//! Records are written to a hidden temp file under an exclusive lock, fsynced and
//! then published with a hard link, so a second registration of the same id fails
//! instead of clobbering the first and readers never observe a half-written record.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::clock::Clock;
use crate::error::{DatalinkError, DatalinkResult, IoResultExt};
use crate::lockfile::LockedFile;
use crate::paths;
use crate::txn::TxnId;

pub const PATH_FIELD_LEN: usize = 4096;
const MODE_OFF: usize = 0;
const TXID_OFF: usize = 4;
const CREATED_OFF: usize = 8;
const PATH_OFF: usize = 16;
pub const RECORD_LEN: usize = PATH_OFF + PATH_FIELD_LEN;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TokenMode {
    Read,
    Write,
}

impl TokenMode {
    pub fn as_byte(self) -> u8 {
        match self {
            TokenMode::Read => b'R',
            TokenMode::Write => b'W',
        }
    }

    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            b'R' => Some(TokenMode::Read),
            b'W' => Some(TokenMode::Write),
            _ => None,
        }
    }

    pub fn from_want_write(want_write: bool) -> Self {
        if want_write { TokenMode::Write } else { TokenMode::Read }
    }

    /// Verb used in log lines: "reading" / "writing".
    pub fn access(self) -> &'static str {
        match self {
            TokenMode::Read => "reading",
            TokenMode::Write => "writing",
        }
    }
}

impl fmt::Display for TokenMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_byte() as char)
    }
}

impl FromStr for TokenMode {
    type Err = DatalinkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "R" | "r" => Ok(TokenMode::Read),
            "W" | "w" => Ok(TokenMode::Write),
            other => Err(DatalinkError::InvalidArgument(format!("token mode must be 'R' or 'W', got '{}'", other))),
        }
    }
}

/// A decoded token file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenRecord {
    pub token_id: String,
    pub mode: TokenMode,
    pub owner_txid: TxnId,
    pub target_path: PathBuf,
    pub created_at_ms: i64,
}

impl TokenRecord {
    pub fn age_ms(&self, now_ms: i64) -> i64 { now_ms.saturating_sub(self.created_at_ms).max(0) }

    /// A token is expired once its age reaches the expiry window.
    pub fn is_expired(&self, now_ms: i64, expiry_ms: i64) -> bool { self.age_ms(now_ms) >= expiry_ms }

    pub fn encode(&self) -> DatalinkResult<[u8; RECORD_LEN]> {
        let path = self.target_path.to_str().ok_or_else(|| {
            DatalinkError::InvalidArgument(format!("external file path \"{}\" is not valid UTF-8", self.target_path.display()))
        })?;
        let pb = path.as_bytes();
        if pb.is_empty() {
            return Err(DatalinkError::InvalidArgument("external file path is empty".into()));
        }
        if pb.len() >= PATH_FIELD_LEN {
            return Err(DatalinkError::InvalidArgument(format!(
                "external file path is {} bytes, the limit is {}",
                pb.len(),
                PATH_FIELD_LEN - 1
            )));
        }
        if pb.contains(&0) {
            return Err(DatalinkError::InvalidArgument("external file path contains NUL".into()));
        }
        let mut buf = [0u8; RECORD_LEN];
        buf[MODE_OFF] = self.mode.as_byte();
        buf[TXID_OFF..TXID_OFF + 4].copy_from_slice(&self.owner_txid.0.to_le_bytes());
        buf[CREATED_OFF..CREATED_OFF + 8].copy_from_slice(&self.created_at_ms.to_le_bytes());
        buf[PATH_OFF..PATH_OFF + pb.len()].copy_from_slice(pb);
        Ok(buf)
    }

    /// Decode a record read from `file`. Anything but an exact-size, well-formed
    /// record is `Corrupt`.
    pub fn decode(token_id: &str, file: &Path, buf: &[u8]) -> DatalinkResult<Self> {
        if buf.len() != RECORD_LEN {
            return Err(DatalinkError::corrupt(file, format!("record is {} bytes, expected {}", buf.len(), RECORD_LEN)));
        }
        let mode = TokenMode::from_byte(buf[MODE_OFF])
            .ok_or_else(|| DatalinkError::corrupt(file, format!("unknown mode byte 0x{:02x}", buf[MODE_OFF])))?;
        let txid = u32::from_le_bytes([buf[TXID_OFF], buf[TXID_OFF + 1], buf[TXID_OFF + 2], buf[TXID_OFF + 3]]);
        let mut created = [0u8; 8];
        created.copy_from_slice(&buf[CREATED_OFF..CREATED_OFF + 8]);
        let created_at_ms = i64::from_le_bytes(created);

        let field = &buf[PATH_OFF..];
        let end = field
            .iter()
            .position(|&b| b == 0)
            .ok_or_else(|| DatalinkError::corrupt(file, "path is not NUL-terminated"))?;
        if end == 0 {
            return Err(DatalinkError::corrupt(file, "path is empty"));
        }
        let path = std::str::from_utf8(&field[..end])
            .map_err(|_| DatalinkError::corrupt(file, "path is not valid UTF-8"))?;

        Ok(Self {
            token_id: token_id.to_string(),
            mode,
            owner_txid: TxnId(txid),
            target_path: PathBuf::from(path),
            created_at_ms,
        })
    }
}

/// Token records on the local filesystem.
#[derive(Clone)]
pub struct TokenStore {
    dir: PathBuf,
    clock: Arc<dyn Clock>,
}

impl TokenStore {
    /// Open the store, creating the token directory if needed.
    pub fn open<P: AsRef<Path>>(dir: P, clock: Arc<dyn Clock>) -> DatalinkResult<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir).io_context(|| format!("could not create token directory \"{}\"", dir.display()))?;
        Ok(Self { dir, clock })
    }

    pub fn dir(&self) -> &Path { &self.dir }

    pub fn now_ms(&self) -> i64 { self.clock.now_ms() }

    /// Create the record for `token_id`. Fails with `NoActiveTransaction` when
    /// `owner` is absent or invalid, and with `TokenAlreadyExists` when the id is live.
    pub fn register(&self, token_id: &str, mode: TokenMode, owner: Option<TxnId>, target_path: &Path) -> DatalinkResult<TokenRecord> {
        let owner_txid = match owner {
            Some(t) if t.is_valid() => t,
            _ => return Err(DatalinkError::NoActiveTransaction),
        };
        paths::validate_token_id(token_id)?;
        let rec = TokenRecord {
            token_id: token_id.to_string(),
            mode,
            owner_txid,
            target_path: target_path.to_path_buf(),
            created_at_ms: self.clock.now_ms(),
        };
        let bytes = rec.encode()?;

        let final_path = paths::token_file(&self.dir, token_id);
        let tmp_path = paths::token_temp_file(&self.dir);
        let published = self.write_and_publish(&tmp_path, &final_path, &bytes);
        if let Err(e) = fs::remove_file(&tmp_path) {
            if e.kind() != io::ErrorKind::NotFound {
                warn!(target: "datalink", "could not remove temporary token file \"{}\": {}", tmp_path.display(), e);
            }
        }
        published.map_err(|e| match e {
            DatalinkError::Io { source, .. } if source.kind() == io::ErrorKind::AlreadyExists => {
                DatalinkError::TokenAlreadyExists(token_id.to_string())
            }
            other => other,
        })?;

        debug!(target: "datalink", token = token_id, mode = %mode, txid = %owner_txid, path = %rec.target_path.display(), "token registered");
        Ok(rec)
    }

    fn write_and_publish(&self, tmp_path: &Path, final_path: &Path, bytes: &[u8]) -> DatalinkResult<()> {
        let mut guard = LockedFile::create_new_exclusive(tmp_path)?;
        guard
            .file_mut()
            .write_all(bytes)
            .io_context(|| format!("could not write token file \"{}\"", tmp_path.display()))?;
        guard.sync()?;
        // The lock stays held until the record is visible under its final name.
        fs::hard_link(tmp_path, final_path)
            .io_context(|| format!("could not create token file \"{}\"", final_path.display()))?;
        Ok(())
    }

    /// Read a record under a shared lock.
    pub fn read(&self, token_id: &str) -> DatalinkResult<TokenRecord> {
        paths::validate_token_id(token_id)?;
        let path = paths::token_file(&self.dir, token_id);
        let guard = LockedFile::open_shared(&path).map_err(|e| {
            if e.is_not_found() { DatalinkError::NotFound(token_id.to_string()) } else { e }
        })?;
        let mut buf = Vec::with_capacity(RECORD_LEN);
        guard
            .file()
            .take(RECORD_LEN as u64 + 1)
            .read_to_end(&mut buf)
            .io_context(|| format!("could not read token file \"{}\"", path.display()))?;
        drop(guard);
        TokenRecord::decode(token_id, &path, &buf)
    }

    /// Unlink a record. Returns false if it was already gone.
    pub fn remove(&self, token_id: &str) -> DatalinkResult<bool> {
        paths::validate_token_id(token_id)?;
        let path = paths::token_file(&self.dir, token_id);
        match fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(DatalinkError::io(format!("could not remove token file \"{}\"", path.display()), e)),
        }
    }

    /// Unlink the record only if it still holds `rec`. A record re-registered
    /// under the same id since `rec` was read is left alone. Returns whether
    /// `rec` was removed.
    pub fn remove_if_unchanged(&self, rec: &TokenRecord) -> DatalinkResult<bool> {
        match self.read(&rec.token_id) {
            Ok(cur) if cur == *rec => self.remove(&rec.token_id),
            Ok(cur) => {
                debug!(
                    target: "datalink",
                    token = %rec.token_id, txid = %cur.owner_txid,
                    "token was registered again, keeping the new record"
                );
                Ok(false)
            }
            Err(DatalinkError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Ids of all records currently present, sorted. Temp files are skipped.
    pub fn list(&self) -> DatalinkResult<Vec<String>> {
        let entries = fs::read_dir(&self.dir)
            .io_context(|| format!("could not open token directory \"{}\"", self.dir.display()))?;
        let mut ids = Vec::new();
        for entry in entries {
            let entry = entry.io_context(|| format!("could not read token directory \"{}\"", self.dir.display()))?;
            let is_file = entry.file_type().map(|t| t.is_file()).unwrap_or(false);
            if !is_file { continue; }
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                warn!(target: "datalink", "skipping token file with non UTF-8 name {:?}", name);
                continue;
            };
            if paths::is_temp_name(name) { continue; }
            ids.push(name.to_string());
        }
        ids.sort();
        Ok(ids)
    }

    /// Remove temp files left behind by interrupted registrations.
    pub fn remove_stale_temps(&self, max_age: Duration) -> DatalinkResult<usize> {
        let entries = fs::read_dir(&self.dir)
            .io_context(|| format!("could not open token directory \"{}\"", self.dir.display()))?;
        let mut removed = 0usize;
        for entry in entries.flatten() {
            let name = entry.file_name();
            if !name.to_str().map(paths::is_temp_name).unwrap_or(false) { continue; }
            let age = entry
                .metadata()
                .and_then(|m| m.modified())
                .ok()
                .and_then(|m| m.elapsed().ok());
            if !matches!(age, Some(a) if a >= max_age) { continue; }
            match fs::remove_file(entry.path()) {
                Ok(()) => removed += 1,
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => warn!(target: "datalink", "could not remove stale temp file \"{}\": {}", entry.path().display(), e),
            }
        }
        Ok(removed)
    }
}

#[cfg(test)]
#[path = "token_tests.rs"]
mod token_tests;
