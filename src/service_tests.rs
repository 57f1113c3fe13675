use super::*;
use crate::clock::ManualClock;
use crate::error::DatalinkError;
use crate::txn::TxnLog;
use crate::verify::DenyReason;
use std::time::Duration;

struct Fixture {
    tmp: tempfile::TempDir,
    clock: ManualClock,
    txns: Arc<TxnLog>,
    dl: Datalink,
}

fn fixture() -> Fixture {
    let tmp = tempfile::tempdir().unwrap();
    let clock = ManualClock::new(1_700_000_000_000);
    let txns = Arc::new(TxnLog::new());
    let dl = Datalink::with_clock(DatalinkConfig::with_base(tmp.path()), txns.clone(), Arc::new(clock.clone())).unwrap();
    Fixture { tmp, clock, txns, dl }
}

#[test]
fn new_creates_token_directory() {
    let f = fixture();
    assert!(f.tmp.path().join("pg_dltoken").is_dir());
    assert_eq!(f.dl.store().dir(), f.tmp.path().join("pg_dltoken"));
}

#[test]
fn invalid_config_is_rejected_at_construction() {
    let tmp = tempfile::tempdir().unwrap();
    let mut cfg = DatalinkConfig::with_base(tmp.path());
    cfg.token_expiry_secs = 0;
    let err = Datalink::new(cfg, Arc::new(TxnLog::new())).err().unwrap();
    assert!(matches!(err, DatalinkError::Config(_)));
}

#[test]
fn relative_target_resolves_under_base() {
    let f = fixture();
    let tx = f.txns.begin();
    assert!(f.dl.register_token(Some(tx), "t1", TokenMode::Write, Path::new("sub/file1")).unwrap());
    let granted = f.dl.verify_token("t1", true).unwrap().unwrap();
    assert!(granted.is_absolute());
    assert!(granted.ends_with("sub/file1"));
    assert!(granted.starts_with(f.tmp.path()));
}

#[test]
fn target_outside_base_is_invalid() {
    let f = fixture();
    let tx = f.txns.begin();
    for bad in ["/etc/passwd", "../escape", "."] {
        let err = f.dl.register_token(Some(tx), "t", TokenMode::Read, Path::new(bad)).unwrap_err();
        assert!(matches!(err, DatalinkError::InvalidArgument(_)), "{}: {:?}", bad, err);
    }
    assert!(f.dl.store().list().unwrap().is_empty());
}

#[test]
fn register_needs_a_transaction() {
    let f = fixture();
    let err = f.dl.register_token(None, "t", TokenMode::Read, Path::new("f")).unwrap_err();
    assert!(matches!(err, DatalinkError::NoActiveTransaction));
    let err = f.dl.register_token(Some(TxnId::INVALID), "t", TokenMode::Read, Path::new("f")).unwrap_err();
    assert!(matches!(err, DatalinkError::NoActiveTransaction));
}

#[test]
fn duplicate_token_id_is_refused() {
    let f = fixture();
    let tx = f.txns.begin();
    f.dl.register_token(Some(tx), "dup", TokenMode::Read, Path::new("a")).unwrap();
    let err = f.dl.register_token(Some(tx), "dup", TokenMode::Write, Path::new("b")).unwrap_err();
    assert!(matches!(err, DatalinkError::TokenAlreadyExists(_)));
    // the first registration is untouched
    assert_eq!(f.dl.verify("dup", TokenMode::Read).unwrap().granted_path().unwrap(), f.tmp.path().join("a"));
}

#[test]
fn verify_token_hides_refusal_reasons() {
    let f = fixture();
    let tx = f.txns.begin();
    f.dl.register_token(Some(tx), "r", TokenMode::Read, Path::new("link")).unwrap();
    assert_eq!(f.dl.verify_token("r", true).unwrap(), None);
    assert_eq!(
        f.dl.verify("r", TokenMode::Write).unwrap(),
        Access::Denied(DenyReason::ModeMismatch { granted: TokenMode::Read, requested: TokenMode::Write })
    );
    assert_eq!(f.dl.verify_token("missing", false).unwrap(), None);
    f.clock.advance_secs(60);
    assert_eq!(f.dl.verify_token("r", false).unwrap(), None);
}

#[test]
fn apply_config_changes_expiry_window() {
    let f = fixture();
    let tx = f.txns.begin();
    f.dl.register_token(Some(tx), "t", TokenMode::Read, Path::new("l")).unwrap();
    f.clock.advance_secs(90);
    assert!(matches!(f.dl.verify("t", TokenMode::Read).unwrap(), Access::Expired { .. }));

    let mut cfg = (*f.dl.config()).clone();
    cfg.token_expiry_secs = 300;
    f.dl.apply_config(cfg).unwrap();
    assert!(f.dl.verify("t", TokenMode::Read).unwrap().is_granted());
}

#[test]
fn rejected_config_keeps_current_settings() {
    let f = fixture();
    let before = f.dl.config();
    let mut cfg = (*before).clone();
    cfg.token_expiry_secs = 0;
    assert!(f.dl.apply_config(cfg).is_err());
    assert_eq!(*f.dl.config(), *before);
}

#[test]
fn apply_config_moves_token_directory() {
    let f = fixture();
    let mut cfg = (*f.dl.config()).clone();
    cfg.token_directory = Some(f.tmp.path().join("elsewhere"));
    f.dl.apply_config(cfg).unwrap();
    let tx = f.txns.begin();
    f.dl.register_token(Some(tx), "t", TokenMode::Read, Path::new("l")).unwrap();
    assert!(f.tmp.path().join("elsewhere").join("t").is_file());
}

#[tokio::test]
async fn reaper_follows_applied_config() {
    let f = fixture();
    let tx = f.txns.begin();
    let file = f.tmp.path().join("w");
    std::fs::write(&file, b"x").unwrap();
    f.dl.register_token(Some(tx), "w", TokenMode::Write, &file).unwrap();
    f.txns.abort(tx);

    let mut cfg = (*f.dl.config()).clone();
    cfg.sweep_interval_secs = 60;
    f.dl.apply_config(cfg.clone()).unwrap();
    let handle = f.dl.spawn_reaper();

    // still fresh under the default window
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(file.exists());

    f.clock.advance_secs(20);
    cfg.token_expiry_secs = 10;
    f.dl.apply_config(cfg).unwrap();
    for _ in 0..250 {
        if !file.exists() { break; }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(!file.exists());
    handle.shutdown().await;
}
