//!
//! Datalink reaper
//! ---------------
//! Background maintenance of access tokens. Each sweep lists the token directory
//! and evaluates every record:
//!
//! - fresh (younger than the expiry window): nothing to do;
//! - expired, owner still in progress: kept and looked at again next sweep, a
//!   long transaction never loses its grant;
//! - expired, owner aborted: the write copy or the read symlink is unlinked,
//!   then the record;
//! - expired, owner committed: a read symlink is unlinked (never its target), a
//!   write copy is live data and stays; the record goes in both cases.
//!
//! An expired record with an invalid owner id is left untouched and fails the
//! sweep with `InvariantViolation`, after the remaining tokens have been
//! processed. Any other per-token failure is logged and the sweep moves on. The background loop sleeps between sweeps and wakes early on a
//! configuration reload or a shutdown request.

use std::path::Path;
use std::sync::Arc;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::clock::Clock;
use crate::config::DatalinkConfig;
use crate::error::{DatalinkError, DatalinkResult};
use crate::fileops;
use crate::token::{TokenMode, TokenRecord, TokenStore};
use crate::txn::{TxnStatus, TxnStatusOracle};

/// Where a token stands in its lifecycle at the time of a sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenState {
    Fresh,
    ExpiredInProgress,
    ExpiredAborted,
    ExpiredCommitted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SweepOutcome {
    Fresh,
    Held,
    Reaped { artifact_removed: bool },
    /// The record vanished between listing and reading it.
    Gone,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub scanned: usize,
    pub fresh: usize,
    pub held: usize,
    pub reaped: usize,
    pub artifacts_removed: usize,
    pub errors: usize,
    /// Expired records with an invalid owner. Any of these fails the sweep
    /// once the rest of the pass is done.
    pub violations: usize,
    pub temps_removed: usize,
    /// True when a shutdown request cut the sweep short.
    pub interrupted: bool,
}

pub struct Reaper {
    store: TokenStore,
    oracle: Arc<dyn TxnStatusOracle>,
    expiry_ms: i64,
}

impl Reaper {
    pub fn new(store: TokenStore, oracle: Arc<dyn TxnStatusOracle>, expiry_ms: i64) -> Self {
        Self { store, oracle, expiry_ms }
    }

    pub fn from_config(cfg: &DatalinkConfig, oracle: Arc<dyn TxnStatusOracle>, clock: Arc<dyn Clock>) -> DatalinkResult<Self> {
        let store = TokenStore::open(cfg.token_dir(), clock)?;
        Ok(Self::new(store, oracle, cfg.token_expiry_ms()))
    }

    pub fn store(&self) -> &TokenStore { &self.store }

    /// Classify a record. Fresh records are never sent to the oracle.
    pub fn classify(&self, rec: &TokenRecord, now_ms: i64) -> DatalinkResult<TokenState> {
        if !rec.is_expired(now_ms, self.expiry_ms) {
            return Ok(TokenState::Fresh);
        }
        if !rec.owner_txid.is_valid() {
            return Err(DatalinkError::InvariantViolation(format!(
                "invalid datalink token access control in file \"{}\"",
                self.store.dir().join(&rec.token_id).display()
            )));
        }
        Ok(match self.oracle.status(rec.owner_txid) {
            TxnStatus::InProgress => TokenState::ExpiredInProgress,
            TxnStatus::Aborted => TokenState::ExpiredAborted,
            TxnStatus::Committed => TokenState::ExpiredCommitted,
        })
    }

    /// Evaluate one token and apply whatever its state calls for.
    pub fn process_token(&self, token_id: &str) -> DatalinkResult<SweepOutcome> {
        let rec = match self.store.read(token_id) {
            Ok(r) => r,
            Err(DatalinkError::NotFound(_)) => return Ok(SweepOutcome::Gone),
            Err(e) => return Err(e),
        };
        let now = self.store.now_ms();
        let status = match self.classify(&rec, now)? {
            TokenState::Fresh => return Ok(SweepOutcome::Fresh),
            TokenState::ExpiredInProgress => {
                debug!(target: "datalink", token = token_id, txid = %rec.owner_txid, "expired token held by a transaction in progress");
                return Ok(SweepOutcome::Held);
            }
            TokenState::ExpiredAborted => TxnStatus::Aborted,
            TokenState::ExpiredCommitted => TxnStatus::Committed,
        };
        let artifact_removed = self.cleanup(&rec, status)?;
        warn!(
            target: "datalink",
            "token \"{}\" to access file \"{}\" has expired, {} seconds after its creation ({})",
            token_id, rec.target_path.display(), rec.age_ms(now) / 1000, status.as_str()
        );
        Ok(SweepOutcome::Reaped { artifact_removed })
    }

    /// Remove what an expired token leaves behind once its owner is terminal,
    /// then the record itself. Nothing is touched unless the stored record is
    /// still `rec`, so calling again for a cleaned or re-registered token is a no-op.
    /// Returns whether an external file or symlink was unlinked.
    pub fn cleanup(&self, rec: &TokenRecord, status: TxnStatus) -> DatalinkResult<bool> {
        if !status.is_terminal() {
            return Err(DatalinkError::InvariantViolation(format!(
                "cleanup requested for token \"{}\" while transaction {} is in progress",
                rec.token_id, rec.owner_txid
            )));
        }
        match self.store.read(&rec.token_id) {
            Ok(cur) if cur == *rec => {}
            Ok(_) => {
                debug!(target: "datalink", token = %rec.token_id, "token registered again since it was read, skipping cleanup");
                return Ok(false);
            }
            Err(DatalinkError::NotFound(_)) => return Ok(false),
            Err(e) => return Err(e),
        }
        let removed = match (rec.mode, status) {
            (TokenMode::Read, _) => remove_read_link(&rec.target_path)?,
            (TokenMode::Write, TxnStatus::Aborted) => fileops::unlink(&rec.target_path)?,
            (TokenMode::Write, _) => false,
        };
        self.store.remove_if_unchanged(rec)?;
        Ok(removed)
    }

    /// One pass over the token directory. `should_stop` is checked between tokens.
    /// Returns the first `InvariantViolation` met, if any, once the pass is over.
    pub fn sweep(&self, should_stop: &dyn Fn() -> bool) -> DatalinkResult<SweepReport> {
        let ids = self.store.list()?;
        let mut rep = SweepReport::default();
        let mut violation = None;
        for id in ids {
            if should_stop() {
                rep.interrupted = true;
                break;
            }
            rep.scanned += 1;
            match self.process_token(&id) {
                Ok(SweepOutcome::Fresh) => rep.fresh += 1,
                Ok(SweepOutcome::Held) => rep.held += 1,
                Ok(SweepOutcome::Reaped { artifact_removed }) => {
                    rep.reaped += 1;
                    if artifact_removed { rep.artifacts_removed += 1; }
                }
                Ok(SweepOutcome::Gone) => {}
                Err(e @ DatalinkError::InvariantViolation(_)) => {
                    error!(target: "datalink", token = %id, "{}", e);
                    rep.violations += 1;
                    violation.get_or_insert(e);
                }
                Err(e) => {
                    rep.errors += 1;
                    if e.is_recoverable() {
                        debug!(target: "datalink", token = %id, "token skipped this sweep: {}", e);
                    } else {
                        error!(target: "datalink", token = %id, "token cleanup failed: {}", e);
                    }
                }
            }
        }
        if !rep.interrupted {
            match self.store.remove_stale_temps(std::time::Duration::from_millis(self.expiry_ms.max(0) as u64)) {
                Ok(n) => rep.temps_removed = n,
                Err(e) => warn!(target: "datalink", "could not collect stale token temp files: {}", e),
            }
        }
        if let Some(e) = violation {
            return Err(e);
        }
        Ok(rep)
    }
}

// A read grant is a symlink; a regular file at that path is somebody's data.
fn remove_read_link(path: &Path) -> DatalinkResult<bool> {
    if fileops::is_symlink(path)? {
        return fileops::unlink(path);
    }
    if path.exists() {
        warn!(target: "datalink", "read token target \"{}\" is not a symlink, leaving it in place", path.display());
    }
    Ok(false)
}

/// Handle on the background reaper task.
pub struct ReaperHandle {
    shutdown: watch::Sender<bool>,
    wake: Arc<Notify>,
    join: JoinHandle<()>,
}

impl ReaperHandle {
    /// Start a sweep now with the latest published configuration instead of
    /// waiting out the interval.
    pub fn reload(&self) { self.wake.notify_one(); }

    /// Ask the reaper to stop and wait for it. A sweep in progress finishes
    /// its current token first.
    pub async fn shutdown(self) {
        self.shutdown.send_replace(true);
        if let Err(e) = self.join.await {
            error!(target: "datalink", "reaper task ended abnormally: {}", e);
        }
    }

    pub fn is_finished(&self) -> bool { self.join.is_finished() }
}

/// Start the reaper loop on the current tokio runtime. Configuration changes
/// published on `config` wake it immediately and apply to the next sweep.
pub fn spawn_reaper(
    config: watch::Receiver<Arc<DatalinkConfig>>,
    oracle: Arc<dyn TxnStatusOracle>,
    clock: Arc<dyn Clock>,
) -> ReaperHandle {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let wake = Arc::new(Notify::new());
    let join = tokio::spawn(run(config, shutdown_rx, wake.clone(), oracle, clock));
    ReaperHandle { shutdown: shutdown_tx, wake, join }
}

async fn run(
    mut config: watch::Receiver<Arc<DatalinkConfig>>,
    mut shutdown: watch::Receiver<bool>,
    wake: Arc<Notify>,
    oracle: Arc<dyn TxnStatusOracle>,
    clock: Arc<dyn Clock>,
) {
    info!(target: "datalink", "datalink reaper started");
    let mut iteration: u64 = 0;
    loop {
        if *shutdown.borrow_and_update() { break; }
        let cfg = config.borrow_and_update().clone();

        match Reaper::from_config(&cfg, oracle.clone(), clock.clone()) {
            Ok(reaper) => {
                let stop = shutdown.clone();
                let res = tokio::task::spawn_blocking(move || reaper.sweep(&|| *stop.borrow())).await;
                match res {
                    Ok(Ok(rep)) => debug!(
                        target: "datalink",
                        iteration, scanned = rep.scanned, fresh = rep.fresh, held = rep.held,
                        reaped = rep.reaped, artifacts_removed = rep.artifacts_removed, errors = rep.errors,
                        "token sweep finished"
                    ),
                    Ok(Err(e)) => error!(target: "datalink", iteration, "token sweep failed: {}", e),
                    Err(e) => error!(target: "datalink", iteration, "token sweep panicked: {}", e),
                }
            }
            Err(e) => error!(target: "datalink", "could not open token directory \"{}\": {}", cfg.token_dir().display(), e),
        }
        iteration += 1;

        tokio::select! {
            _ = tokio::time::sleep(cfg.sweep_interval()) => {}
            changed = config.changed() => {
                if changed.is_err() { break; }
                info!(target: "datalink", "datalink reaper configuration reloaded");
            }
            _ = wake.notified() => {
                debug!(target: "datalink", "datalink reaper woken for an early sweep");
            }
            changed = shutdown.changed() => {
                if changed.is_err() { break; }
            }
        }
    }
    info!(target: "datalink", iterations = iteration, "datalink reaper stopped");
}

#[cfg(test)]
#[path = "reaper_tests.rs"]
mod reaper_tests;
