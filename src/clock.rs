use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

/// Wall clock used for token creation stamps and expiry checks.
pub trait Clock: Send + Sync {
    /// Current time as unix milliseconds.
    fn now_ms(&self) -> i64;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> i64 { chrono::Utc::now().timestamp_millis() }
}

/// Settable clock for deterministic expiry tests. Clones share the same time.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    now: Arc<AtomicI64>,
}

impl ManualClock {
    pub fn new(now_ms: i64) -> Self { Self { now: Arc::new(AtomicI64::new(now_ms)) } }

    pub fn set(&self, now_ms: i64) { self.now.store(now_ms, Ordering::SeqCst); }

    pub fn advance_secs(&self, secs: i64) { self.now.fetch_add(secs * 1000, Ordering::SeqCst); }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> i64 { self.now.load(Ordering::SeqCst) }
}
