//! Transaction status as seen by the datalink core.
//!
//! The surrounding engine owns transaction bookkeeping; this module only defines
//! the question the core asks ([`TxnStatusOracle`]) and two answers to it:
//!
//! - [`TxnLog`], an in-memory log for embedders without a transaction manager
//!   of their own, and for tests;
//! - [`TxnOutcomeDir`], terminal outcomes published on disk by the engine and
//!   read by a reaper running in another process.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use tracing::warn;

use crate::error::{DatalinkError, DatalinkResult, IoResultExt};
use crate::paths;

/// Transaction identifier as stored in token records. Zero is never a valid id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TxnId(pub u32);

impl TxnId {
    pub const INVALID: TxnId = TxnId(0);

    pub fn is_valid(self) -> bool { self.0 != 0 }
}

impl fmt::Display for TxnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write!(f, "{}", self.0) }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxnStatus {
    InProgress,
    Committed,
    Aborted,
}

impl TxnStatus {
    /// Committed and Aborted can not change any more.
    pub fn is_terminal(self) -> bool { !matches!(self, TxnStatus::InProgress) }

    pub fn as_str(self) -> &'static str {
        match self {
            TxnStatus::InProgress => "in progress",
            TxnStatus::Committed => "committed",
            TxnStatus::Aborted => "aborted",
        }
    }
}

/// Authoritative transaction status, queried on demand and never cached.
///
/// An id the oracle knows nothing about must come back as `Aborted` only when
/// the oracle saw every transaction begin (`TxnLog`). An oracle fed from
/// outside answers `InProgress` instead, so nothing is deleted on a guess.
pub trait TxnStatusOracle: Send + Sync {
    fn status(&self, txid: TxnId) -> TxnStatus;
}

/// In-memory transaction log. Optionally mirrors terminal outcomes into a
/// [`TxnOutcomeDir`] so an out-of-process reaper sees them.
#[derive(Debug)]
pub struct TxnLog {
    next: AtomicU32,
    states: RwLock<HashMap<TxnId, TxnStatus>>,
    publish: Option<TxnOutcomeDir>,
}

impl Default for TxnLog {
    fn default() -> Self { Self::new() }
}

impl TxnLog {
    pub fn new() -> Self {
        Self { next: AtomicU32::new(1), states: RwLock::new(HashMap::new()), publish: None }
    }

    /// A log whose commits and aborts are also written to `outcomes`.
    pub fn publishing_to(outcomes: TxnOutcomeDir) -> Self {
        Self { publish: Some(outcomes), ..Self::new() }
    }

    /// Start a transaction and return its id.
    pub fn begin(&self) -> TxnId {
        let mut id = self.next.fetch_add(1, Ordering::SeqCst);
        if id == 0 {
            // wrapped around; skip the invalid id
            id = self.next.fetch_add(1, Ordering::SeqCst);
        }
        let txid = TxnId(id);
        self.states.write().insert(txid, TxnStatus::InProgress);
        txid
    }

    pub fn commit(&self, txid: TxnId) { self.set_status(txid, TxnStatus::Committed); }

    pub fn abort(&self, txid: TxnId) { self.set_status(txid, TxnStatus::Aborted); }

    /// Record an arbitrary status, e.g. for an id handed out by an external engine.
    pub fn set_status(&self, txid: TxnId, status: TxnStatus) {
        self.states.write().insert(txid, status);
        if let (Some(out), true) = (&self.publish, status.is_terminal()) {
            // Unpublished outcomes read as in progress elsewhere: tokens are held, not lost.
            if let Err(e) = out.publish(txid, status) {
                warn!(target: "datalink", txid = %txid, "could not publish transaction outcome: {}", e);
            }
        }
    }
}

impl TxnStatusOracle for TxnLog {
    fn status(&self, txid: TxnId) -> TxnStatus {
        self.states.read().get(&txid).copied().unwrap_or(TxnStatus::Aborted)
    }
}

/// Terminal transaction outcomes, one small file per transaction id.
///
/// The engine publishes `committed` or `aborted` once a transaction ends; the
/// reaper daemon reads them. An id with no published outcome is reported as
/// `InProgress`: its expired tokens are held rather than cleaned up.
#[derive(Debug, Clone)]
pub struct TxnOutcomeDir {
    dir: PathBuf,
}

impl TxnOutcomeDir {
    pub fn open<P: AsRef<Path>>(dir: P) -> DatalinkResult<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)
            .io_context(|| format!("could not create transaction status directory \"{}\"", dir.display()))?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path { &self.dir }

    fn outcome_file(&self, txid: TxnId) -> PathBuf { self.dir.join(txid.0.to_string()) }

    /// Record the outcome of `txid`. Written to a temp file, fsynced and renamed
    /// into place, so readers see either nothing or the whole word.
    pub fn publish(&self, txid: TxnId, status: TxnStatus) -> DatalinkResult<()> {
        let word = match status {
            TxnStatus::Committed => "committed",
            TxnStatus::Aborted => "aborted",
            TxnStatus::InProgress => {
                return Err(DatalinkError::InvalidArgument(format!("transaction {} has no outcome yet", txid)));
            }
        };
        if !txid.is_valid() {
            return Err(DatalinkError::InvalidArgument("invalid transaction id".into()));
        }
        let tmp = paths::token_temp_file(&self.dir);
        let res = write_outcome(&tmp, &self.outcome_file(txid), word);
        if res.is_err() {
            let _ = fs::remove_file(&tmp);
        }
        res
    }
}

fn write_outcome(tmp: &Path, dst: &Path, word: &str) -> DatalinkResult<()> {
    let mut f = fs::File::create(tmp).io_context(|| format!("could not create file \"{}\"", tmp.display()))?;
    f.write_all(word.as_bytes())
        .io_context(|| format!("could not write file \"{}\"", tmp.display()))?;
    f.sync_all().io_context(|| format!("could not fsync file \"{}\"", tmp.display()))?;
    fs::rename(tmp, dst).io_context(|| format!("could not rename file \"{}\" to \"{}\"", tmp.display(), dst.display()))
}

impl TxnStatusOracle for TxnOutcomeDir {
    fn status(&self, txid: TxnId) -> TxnStatus {
        let path = self.outcome_file(txid);
        match fs::read_to_string(&path) {
            Ok(s) => match s.trim() {
                "committed" => TxnStatus::Committed,
                "aborted" => TxnStatus::Aborted,
                other => {
                    warn!(target: "datalink", txid = %txid, "unreadable outcome {:?} in \"{}\"", other, path.display());
                    TxnStatus::InProgress
                }
            },
            Err(e) if e.kind() == io::ErrorKind::NotFound => TxnStatus::InProgress,
            Err(e) => {
                warn!(target: "datalink", txid = %txid, "could not read \"{}\": {}", path.display(), e);
                TxnStatus::InProgress
            }
        }
    }
}
