//! Token-gated, transaction-aware access to files referenced from DATALINK
//! columns.
//!
//! A session registers a token for an external file inside its transaction and
//! verifies it before every read or write. The reaper removes expired tokens
//! once their transactions finish, together with the files aborted writers left
//! behind and the symlinks that granted read access.

pub mod clock;
pub mod config;
pub mod error;
pub mod fileops;
pub mod lockfile;
pub mod paths;
pub mod reaper;
pub mod service;
pub mod token;
pub mod txn;
pub mod verify;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::DatalinkConfig;
pub use error::{DatalinkError, DatalinkResult};
pub use reaper::{spawn_reaper, Reaper, ReaperHandle, SweepReport};
pub use service::Datalink;
pub use token::{TokenMode, TokenRecord, TokenStore};
pub use txn::{TxnId, TxnLog, TxnOutcomeDir, TxnStatus, TxnStatusOracle};
pub use verify::{verify_access, Access, DenyReason};
