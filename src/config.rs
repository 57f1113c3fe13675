use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{DatalinkError, DatalinkResult};

pub const DEFAULT_BASE_DIRECTORY: &str = "/var/lib/datalink/pg_external_files";
pub const DEFAULT_TOKEN_SUBDIR: &str = "pg_dltoken";
pub const DEFAULT_TXN_STATUS_SUBDIR: &str = "pg_dltxn";
pub const DEFAULT_TOKEN_EXPIRY_SECS: u64 = 60;
pub const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 10;
pub const MIN_SWEEP_INTERVAL_SECS: u64 = 1;
pub const MAX_SWEEP_INTERVAL_SECS: u64 = 60;
pub const DEFAULT_KEEP_MAX_COPIES: u32 = 5;

/// Datalink settings shared by the token store, the verifier and the reaper.
/// Passed explicitly at construction and swapped as a whole on reload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DatalinkConfig {
    /// Where external files live. Relative target paths resolve against it.
    pub base_directory: PathBuf,
    /// Token records directory; defaults to `<base_directory>/pg_dltoken` when unset.
    #[serde(default)]
    pub token_directory: Option<PathBuf>,
    /// Transaction outcomes published by the engine for a standalone reaper;
    /// defaults to `<base_directory>/pg_dltxn` when unset.
    #[serde(default)]
    pub txn_status_directory: Option<PathBuf>,
    /// Validity of an access token, in seconds. Must be > 0.
    #[serde(default = "DatalinkConfig::default_token_expiry_secs")]
    pub token_expiry_secs: u64,
    /// Wait between two reaper sweeps; clamped to [1, 60].
    #[serde(default = "DatalinkConfig::default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
    /// Copies of a linked file kept in the base directory; 0 keeps everything.
    #[serde(default = "DatalinkConfig::default_keep_max_copies")]
    pub keep_max_copies: u32,
}

impl DatalinkConfig {
    fn default_token_expiry_secs() -> u64 { DEFAULT_TOKEN_EXPIRY_SECS }
    fn default_sweep_interval_secs() -> u64 { DEFAULT_SWEEP_INTERVAL_SECS }
    fn default_keep_max_copies() -> u32 { DEFAULT_KEEP_MAX_COPIES }

    /// Config rooted at `base`, everything else default.
    pub fn with_base<P: AsRef<Path>>(base: P) -> Self {
        Self { base_directory: base.as_ref().to_path_buf(), ..Self::default() }
    }

    pub fn token_dir(&self) -> PathBuf {
        self.token_directory
            .clone()
            .unwrap_or_else(|| self.base_directory.join(DEFAULT_TOKEN_SUBDIR))
    }

    pub fn txn_status_dir(&self) -> PathBuf {
        self.txn_status_directory
            .clone()
            .unwrap_or_else(|| self.base_directory.join(DEFAULT_TXN_STATUS_SUBDIR))
    }

    pub fn token_expiry(&self) -> Duration { Duration::from_secs(self.token_expiry_secs) }

    pub fn token_expiry_ms(&self) -> i64 {
        i64::try_from(self.token_expiry_secs.saturating_mul(1000)).unwrap_or(i64::MAX)
    }

    /// Sweep interval after clamping into the allowed range.
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.clamp(MIN_SWEEP_INTERVAL_SECS, MAX_SWEEP_INTERVAL_SECS))
    }

    pub fn validate(&self) -> DatalinkResult<()> {
        if self.token_expiry_secs == 0 {
            return Err(DatalinkError::Config("token_expiry_secs must be greater than 0".into()));
        }
        if self.base_directory.as_os_str().is_empty() {
            return Err(DatalinkError::Config("base_directory must not be empty".into()));
        }
        if let Some(dir) = &self.token_directory {
            if dir.as_os_str().is_empty() {
                return Err(DatalinkError::Config("token_directory must not be empty".into()));
            }
        }
        if let Some(dir) = &self.txn_status_directory {
            if dir.as_os_str().is_empty() {
                return Err(DatalinkError::Config("txn_status_directory must not be empty".into()));
            }
        }
        Ok(())
    }

    /// Load settings from a JSON file. Missing keys take their defaults.
    pub fn load<P: AsRef<Path>>(path: P) -> DatalinkResult<Self> {
        let path = path.as_ref();
        let bytes = std::fs::read(path)
            .map_err(|e| DatalinkError::Config(format!("could not read {}: {}", path.display(), e)))?;
        let cfg: Self = serde_json::from_slice(&bytes)
            .map_err(|e| DatalinkError::Config(format!("could not parse {}: {}", path.display(), e)))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Build from `DATALINK_*` environment variables over defaults.
    pub fn from_env() -> DatalinkResult<Self> {
        Self::from_lookup(|k| std::env::var(k).ok())
    }

    pub(crate) fn from_lookup<F>(lookup: F) -> DatalinkResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut cfg = Self::default();
        if let Some(v) = lookup("DATALINK_BASE_DIRECTORY") { cfg.base_directory = PathBuf::from(v); }
        if let Some(v) = lookup("DATALINK_TOKEN_DIRECTORY") { cfg.token_directory = Some(PathBuf::from(v)); }
        if let Some(v) = lookup("DATALINK_TXN_STATUS_DIRECTORY") { cfg.txn_status_directory = Some(PathBuf::from(v)); }
        if let Some(v) = lookup("DATALINK_TOKEN_EXPIRY_SECS") { cfg.token_expiry_secs = parse_num("DATALINK_TOKEN_EXPIRY_SECS", &v)?; }
        if let Some(v) = lookup("DATALINK_SWEEP_INTERVAL_SECS") { cfg.sweep_interval_secs = parse_num("DATALINK_SWEEP_INTERVAL_SECS", &v)?; }
        if let Some(v) = lookup("DATALINK_KEEP_MAX_COPIES") { cfg.keep_max_copies = parse_num("DATALINK_KEEP_MAX_COPIES", &v)?; }
        cfg.validate()?;
        Ok(cfg)
    }
}

fn parse_num<T: std::str::FromStr>(key: &str, v: &str) -> DatalinkResult<T> {
    v.trim()
        .parse::<T>()
        .map_err(|_| DatalinkError::Config(format!("{} must be a non-negative integer, got '{}'", key, v)))
}

impl Default for DatalinkConfig {
    fn default() -> Self {
        Self {
            base_directory: PathBuf::from(DEFAULT_BASE_DIRECTORY),
            token_directory: None,
            txn_status_directory: None,
            token_expiry_secs: DEFAULT_TOKEN_EXPIRY_SECS,
            sweep_interval_secs: DEFAULT_SWEEP_INTERVAL_SECS,
            keep_max_copies: DEFAULT_KEEP_MAX_COPIES,
        }
    }
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod config_tests;
