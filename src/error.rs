//! Unified datalink error model and mapping helpers.
//! One enum covers the token store, the verifier, the reaper and the file primitives.
//! Each variant carries a stable code and maps onto a PostgreSQL sqlstate so the
//! SQL layer can surface it without re-classifying.

use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DatalinkError {
    /// Another process holds a competing advisory lock. Callers may retry.
    #[error("can not lock file for {access} \"{}\"", .path.display())]
    LockUnavailable { path: PathBuf, access: &'static str },

    #[error("token \"{0}\" does not exist")]
    NotFound(String),

    #[error("access denied: {0}")]
    Denied(String),

    #[error("token \"{token}\" has expired, {age_secs} seconds after its creation")]
    Expired { token: String, age_secs: i64 },

    #[error("token \"{0}\" already exists")]
    TokenAlreadyExists(String),

    #[error("datalink token access control can only be used in transactions")]
    NoActiveTransaction,

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },

    #[error("corrupt token record \"{}\": {reason}", .path.display())]
    Corrupt { path: PathBuf, reason: String },

    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    #[error("configuration error: {0}")]
    Config(String),
}

pub type DatalinkResult<T> = Result<T, DatalinkError>;

impl DatalinkError {
    pub fn io<S: Into<String>>(context: S, source: io::Error) -> Self {
        DatalinkError::Io { context: context.into(), source }
    }

    pub fn corrupt<S: Into<String>>(path: &Path, reason: S) -> Self {
        DatalinkError::Corrupt { path: path.to_path_buf(), reason: reason.into() }
    }

    pub fn lock_unavailable(path: &Path, access: &'static str) -> Self {
        DatalinkError::LockUnavailable { path: path.to_path_buf(), access }
    }

    pub fn code_str(&self) -> &'static str {
        match self {
            DatalinkError::LockUnavailable { .. } => "lock_unavailable",
            DatalinkError::NotFound(_) => "not_found",
            DatalinkError::Denied(_) => "denied",
            DatalinkError::Expired { .. } => "expired",
            DatalinkError::TokenAlreadyExists(_) => "token_exists",
            DatalinkError::NoActiveTransaction => "no_active_transaction",
            DatalinkError::InvalidArgument(_) => "invalid_argument",
            DatalinkError::Io { .. } => "io",
            DatalinkError::Corrupt { .. } => "corrupt",
            DatalinkError::InvariantViolation(_) => "invariant_violation",
            DatalinkError::Config(_) => "config",
        }
    }

    /// Recoverable conditions: the caller may retry or treat the answer as a plain denial.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            DatalinkError::LockUnavailable { .. }
                | DatalinkError::NotFound(_)
                | DatalinkError::Denied(_)
                | DatalinkError::Expired { .. }
        )
    }

    /// True when the underlying cause is a missing file, whatever layer reported it.
    pub fn is_not_found(&self) -> bool {
        match self {
            DatalinkError::NotFound(_) => true,
            DatalinkError::Io { source, .. } => source.kind() == io::ErrorKind::NotFound,
            _ => false,
        }
    }

    /// Pgwire mapping: return (sqlstate, severity, message)
    pub fn pgwire_fields(&self) -> (&'static str, &'static str, String) {
        let msg = self.to_string();
        match self {
            DatalinkError::LockUnavailable { .. } => ("55P03", "WARNING", msg), // lock_not_available
            DatalinkError::NotFound(_) => ("58P01", "ERROR", msg),             // undefined_file
            DatalinkError::Denied(_) | DatalinkError::Expired { .. } => ("42501", "WARNING", msg), // insufficient_privilege
            DatalinkError::TokenAlreadyExists(_) => ("58P02", "ERROR", msg),   // duplicate_file
            DatalinkError::NoActiveTransaction => ("25P01", "ERROR", msg),     // no_active_sql_transaction
            DatalinkError::InvalidArgument(_) => ("22023", "ERROR", msg),      // invalid_parameter_value
            DatalinkError::Io { .. } => ("58030", "ERROR", msg),               // io_error
            DatalinkError::Corrupt { .. } => ("XX001", "ERROR", msg),          // data_corrupted
            DatalinkError::InvariantViolation(_) => ("XX000", "ERROR", msg),   // internal_error
            DatalinkError::Config(_) => ("F0000", "FATAL", msg),               // config_file_error
        }
    }
}

/// Attach a context string to io::Result values, the way anyhow's `with_context` reads.
pub trait IoResultExt<T> {
    fn io_context<F, S>(self, f: F) -> DatalinkResult<T>
    where
        F: FnOnce() -> S,
        S: Into<String>;
}

impl<T> IoResultExt<T> for io::Result<T> {
    fn io_context<F, S>(self, f: F) -> DatalinkResult<T>
    where
        F: FnOnce() -> S,
        S: Into<String>,
    {
        self.map_err(|e| DatalinkError::io(f(), e))
    }
}

#[cfg(test)]
#[path = "error_tests.rs"]
mod error_tests;
