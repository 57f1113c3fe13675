//! Access verification for external files.
//! Gating only: the verifier never deletes external files or symlinks, that is
//! left to the reaper so destructive filesystem actions have a single writer.

use std::fmt;
use std::path::PathBuf;
use tracing::{debug, error, warn};

use crate::error::{DatalinkError, DatalinkResult};
use crate::token::{TokenMode, TokenRecord, TokenStore};
use crate::txn::{TxnStatus, TxnStatusOracle};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DenyReason {
    /// No record exists for the token id.
    UnknownToken,
    ModeMismatch { granted: TokenMode, requested: TokenMode },
    /// The owning transaction rolled back; the change it protected never became durable.
    TransactionAborted,
}

impl fmt::Display for DenyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DenyReason::UnknownToken => write!(f, "unknown token"),
            DenyReason::ModeMismatch { granted, requested } => {
                write!(f, "token grants mode {} but {} was requested", granted, requested.access())
            }
            DenyReason::TransactionAborted => write!(f, "owning transaction aborted"),
        }
    }
}

/// Outcome of a verification that ran to completion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Access {
    Granted(PathBuf),
    Denied(DenyReason),
    Expired { age_ms: i64 },
}

impl Access {
    pub fn is_granted(&self) -> bool { matches!(self, Access::Granted(_)) }

    pub fn granted_path(self) -> Option<PathBuf> {
        match self {
            Access::Granted(p) => Some(p),
            _ => None,
        }
    }

    /// Turn a refusal into the matching error, for callers that want `?`.
    pub fn into_result(self, token_id: &str) -> DatalinkResult<PathBuf> {
        match self {
            Access::Granted(p) => Ok(p),
            Access::Denied(reason) => Err(DatalinkError::Denied(format!("token \"{}\": {}", token_id, reason))),
            Access::Expired { age_ms } => Err(DatalinkError::Expired { token: token_id.to_string(), age_secs: age_ms / 1000 }),
        }
    }
}

/// Decide whether `token_id` currently allows `requested` access.
///
/// Environment faults (`Io`, `Corrupt`, `LockUnavailable`) come back as errors;
/// every policy refusal is an `Ok(Access::Denied | Access::Expired)`.
pub fn verify_access(
    store: &TokenStore,
    oracle: &dyn TxnStatusOracle,
    expiry_ms: i64,
    token_id: &str,
    requested: TokenMode,
) -> DatalinkResult<Access> {
    let rec = match store.read(token_id) {
        Ok(r) => r,
        Err(DatalinkError::NotFound(_)) => {
            warn!(target: "datalink", "attempt to access a file for {} with unknown token \"{}\"", requested.access(), token_id);
            return Ok(Access::Denied(DenyReason::UnknownToken));
        }
        Err(e) => return Err(e),
    };

    let now = store.now_ms();
    if rec.is_expired(now, expiry_ms) {
        let age_ms = rec.age_ms(now);
        warn!(
            target: "datalink",
            "token \"{}\" to file \"{}\" has expired, {} seconds after its creation",
            token_id, rec.target_path.display(), age_ms / 1000
        );
        drop_expired_if_nothing_owed(store, oracle, &rec);
        return Ok(Access::Expired { age_ms });
    }

    if rec.mode != requested {
        warn!(
            target: "datalink",
            "attempt to access file \"{}\" for {} without a valid token \"{}\", mode was {}",
            rec.target_path.display(), requested.access(), token_id, rec.mode
        );
        return Ok(Access::Denied(DenyReason::ModeMismatch { granted: rec.mode, requested }));
    }

    if !rec.owner_txid.is_valid() {
        error!(target: "datalink", "token \"{}\" carries an invalid transaction id", token_id);
        return Err(DatalinkError::corrupt(&store.dir().join(token_id), "invalid owner transaction id"));
    }

    match oracle.status(rec.owner_txid) {
        TxnStatus::InProgress | TxnStatus::Committed => {
            debug!(target: "datalink", token = token_id, txid = %rec.owner_txid, "access granted for {}", requested.access());
            Ok(Access::Granted(rec.target_path))
        }
        TxnStatus::Aborted => Ok(Access::Denied(DenyReason::TransactionAborted)),
    }
}

// An expired write token whose transaction committed owes no artifact cleanup,
// so its record can go now. Everything else waits for the reaper.
fn drop_expired_if_nothing_owed(store: &TokenStore, oracle: &dyn TxnStatusOracle, rec: &TokenRecord) {
    if rec.mode != TokenMode::Write || !rec.owner_txid.is_valid() {
        return;
    }
    if oracle.status(rec.owner_txid) != TxnStatus::Committed {
        return;
    }
    match store.remove_if_unchanged(rec) {
        Ok(false) => {}
        Ok(true) => debug!(target: "datalink", token = %rec.token_id, "expired token record removed"),
        Err(e) => warn!(target: "datalink", "could not remove expired token \"{}\": {}", rec.token_id, e),
    }
}

#[cfg(test)]
#[path = "verify_tests.rs"]
mod verify_tests;
