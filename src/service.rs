//! SQL-facing entry point.
//!
//! `Datalink` ties one configuration, one token store, the transaction oracle
//! and the clock together. Sessions call [`Datalink::register_token`] when a
//! column value is linked and [`Datalink::verify_token`] before touching the
//! external file. The reaper started from here follows configuration reloads.

use parking_lot::RwLock;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::info;

use crate::clock::{Clock, SystemClock};
use crate::config::DatalinkConfig;
use crate::error::DatalinkResult;
use crate::paths;
use crate::reaper::{self, ReaperHandle};
use crate::token::{TokenMode, TokenStore};
use crate::txn::{TxnId, TxnOutcomeDir, TxnStatusOracle};
use crate::verify::{verify_access, Access};

pub struct Datalink {
    config: watch::Sender<Arc<DatalinkConfig>>,
    store: RwLock<TokenStore>,
    oracle: Arc<dyn TxnStatusOracle>,
    clock: Arc<dyn Clock>,
}

impl Datalink {
    pub fn new(cfg: DatalinkConfig, oracle: Arc<dyn TxnStatusOracle>) -> DatalinkResult<Self> {
        Self::with_clock(cfg, oracle, Arc::new(SystemClock))
    }

    /// For a reaper running outside the engine: transaction status comes from
    /// the outcomes the engine publishes under `txn_status_dir()`. Owners with
    /// no published outcome count as in progress, so their tokens are held.
    pub fn standalone(cfg: DatalinkConfig) -> DatalinkResult<Self> {
        let outcomes = TxnOutcomeDir::open(cfg.txn_status_dir())?;
        info!(target: "datalink", "reading transaction outcomes from '{}'", outcomes.dir().display());
        Self::new(cfg, Arc::new(outcomes))
    }

    /// Validate `cfg` and open (creating if needed) its token directory.
    pub fn with_clock(cfg: DatalinkConfig, oracle: Arc<dyn TxnStatusOracle>, clock: Arc<dyn Clock>) -> DatalinkResult<Self> {
        cfg.validate()?;
        let store = TokenStore::open(cfg.token_dir(), clock.clone())?;
        info!(
            target: "datalink",
            "datalink ready: base_directory='{}', token_directory='{}', token_expiry={}s",
            cfg.base_directory.display(), store.dir().display(), cfg.token_expiry_secs
        );
        let (config, _) = watch::channel(Arc::new(cfg));
        Ok(Self { config, store: RwLock::new(store), oracle, clock })
    }

    /// Snapshot of the configuration in effect.
    pub fn config(&self) -> Arc<DatalinkConfig> { self.config.borrow().clone() }

    pub fn store(&self) -> TokenStore { self.store.read().clone() }

    /// Register an access token for `path` on behalf of `txn`.
    ///
    /// Relative paths resolve against the base directory; anything outside it is
    /// rejected. Returns true once the record is durable.
    pub fn register_token(&self, txn: Option<TxnId>, token_id: &str, mode: TokenMode, path: &Path) -> DatalinkResult<bool> {
        let cfg = self.config();
        let target = paths::resolve_target(&cfg.base_directory, path)?;
        self.store().register(token_id, mode, txn, &target)?;
        Ok(true)
    }

    pub fn verify(&self, token_id: &str, mode: TokenMode) -> DatalinkResult<Access> {
        let expiry_ms = self.config.borrow().token_expiry_ms();
        verify_access(&self.store(), self.oracle.as_ref(), expiry_ms, token_id, mode)
    }

    /// The granted path, or `None` when the token is unknown, expired, of the
    /// wrong mode, or owned by an aborted transaction.
    pub fn verify_token(&self, token_id: &str, want_write: bool) -> DatalinkResult<Option<PathBuf>> {
        Ok(self.verify(token_id, TokenMode::from_want_write(want_write))?.granted_path())
    }

    /// Swap in a new configuration. Rejected settings leave the current ones in
    /// place. A running reaper picks the change up right away.
    pub fn apply_config(&self, cfg: DatalinkConfig) -> DatalinkResult<()> {
        cfg.validate()?;
        let store = TokenStore::open(cfg.token_dir(), self.clock.clone())?;
        *self.store.write() = store;
        info!(
            target: "datalink",
            "datalink configuration applied: token_directory='{}', token_expiry={}s, sweep_interval={}s",
            cfg.token_dir().display(), cfg.token_expiry_secs, cfg.sweep_interval().as_secs()
        );
        self.config.send_replace(Arc::new(cfg));
        Ok(())
    }

    /// Start the background reaper on the current tokio runtime.
    pub fn spawn_reaper(&self) -> ReaperHandle {
        reaper::spawn_reaper(self.config.subscribe(), self.oracle.clone(), self.clock.clone())
    }
}

#[cfg(test)]
#[path = "service_tests.rs"]
mod service_tests;
