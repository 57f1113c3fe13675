use super::*;
use crate::clock::ManualClock;

fn store(tmp: &tempfile::TempDir) -> (TokenStore, ManualClock) {
    let clock = ManualClock::new(1_700_000_000_000);
    let store = TokenStore::open(tmp.path().join("pg_dltoken"), Arc::new(clock.clone())).unwrap();
    (store, clock)
}

#[test]
fn register_then_read_returns_same_record() {
    let tmp = tempfile::tempdir().unwrap();
    let (store, _clock) = store(&tmp);
    for (id, mode, txid, path) in [
        ("tok1", TokenMode::Write, 42u32, "/data/ext/file1"),
        ("tok2", TokenMode::Read, 7, "/data/ext/link2"),
        ("tok-ü", TokenMode::Read, u32::MAX, "/data/ext/ünïcode name.bin"),
    ] {
        let written = store.register(id, mode, Some(TxnId(txid)), Path::new(path)).unwrap();
        let read = store.read(id).unwrap();
        assert_eq!(read, written);
        assert_eq!(read.mode, mode);
        assert_eq!(read.owner_txid, TxnId(txid));
        assert_eq!(read.target_path, PathBuf::from(path));
        assert_eq!(read.created_at_ms, 1_700_000_000_000);
    }
}

#[test]
fn register_requires_a_transaction() {
    let tmp = tempfile::tempdir().unwrap();
    let (store, _) = store(&tmp);
    let err = store.register("tok1", TokenMode::Write, None, Path::new("/data/f")).unwrap_err();
    assert!(matches!(err, DatalinkError::NoActiveTransaction));
    let err = store.register("tok1", TokenMode::Write, Some(TxnId::INVALID), Path::new("/data/f")).unwrap_err();
    assert!(matches!(err, DatalinkError::NoActiveTransaction));
    assert!(store.list().unwrap().is_empty());
}

#[test]
fn second_registration_does_not_clobber_the_first() {
    let tmp = tempfile::tempdir().unwrap();
    let (store, _) = store(&tmp);
    store.register("tok1", TokenMode::Write, Some(TxnId(42)), Path::new("/data/ext/file1")).unwrap();
    let err = store.register("tok1", TokenMode::Read, Some(TxnId(43)), Path::new("/data/ext/other")).unwrap_err();
    assert!(matches!(err, DatalinkError::TokenAlreadyExists(ref id) if id == "tok1"), "{err}");
    let rec = store.read("tok1").unwrap();
    assert_eq!(rec.owner_txid, TxnId(42));
    assert_eq!(rec.mode, TokenMode::Write);
    // no temp files are left behind
    let names: Vec<_> = fs::read_dir(store.dir()).unwrap().map(|e| e.unwrap().file_name()).collect();
    assert_eq!(names.len(), 1);
}

#[test]
fn read_missing_is_not_found() {
    let tmp = tempfile::tempdir().unwrap();
    let (store, _) = store(&tmp);
    assert!(matches!(store.read("nope"), Err(DatalinkError::NotFound(_))));
}

#[test]
fn short_record_is_corrupt_not_zero_filled() {
    let tmp = tempfile::tempdir().unwrap();
    let (store, _) = store(&tmp);
    let rec = store.register("tok1", TokenMode::Write, Some(TxnId(42)), Path::new("/data/ext/file1")).unwrap();
    let full = rec.encode().unwrap();
    fs::write(store.dir().join("short"), &full[..RECORD_LEN - 1]).unwrap();
    assert!(matches!(store.read("short"), Err(DatalinkError::Corrupt { .. })));

    let mut long = full.to_vec();
    long.push(0);
    fs::write(store.dir().join("long"), &long).unwrap();
    assert!(matches!(store.read("long"), Err(DatalinkError::Corrupt { .. })));

    let mut bad_mode = full;
    bad_mode[0] = b'X';
    fs::write(store.dir().join("badmode"), bad_mode).unwrap();
    assert!(matches!(store.read("badmode"), Err(DatalinkError::Corrupt { .. })));
}

#[test]
fn unterminated_path_is_corrupt() {
    let mut buf = [b'a'; RECORD_LEN];
    buf[0] = b'R';
    let err = TokenRecord::decode("t", Path::new("/tok/t"), &buf).unwrap_err();
    assert!(matches!(err, DatalinkError::Corrupt { ref reason, .. } if reason.contains("NUL")));
}

#[test]
fn overlong_path_is_rejected_at_register() {
    let tmp = tempfile::tempdir().unwrap();
    let (store, _) = store(&tmp);
    let long = format!("/{}", "p".repeat(PATH_FIELD_LEN));
    let err = store.register("tok1", TokenMode::Read, Some(TxnId(1)), Path::new(&long)).unwrap_err();
    assert!(matches!(err, DatalinkError::InvalidArgument(_)));
    let max = format!("/{}", "p".repeat(PATH_FIELD_LEN - 2));
    let rec = store.register("tok2", TokenMode::Read, Some(TxnId(1)), Path::new(&max)).unwrap();
    assert_eq!(store.read("tok2").unwrap().target_path, rec.target_path);
}

#[test]
fn remove_is_idempotent() {
    let tmp = tempfile::tempdir().unwrap();
    let (store, _) = store(&tmp);
    store.register("tok1", TokenMode::Read, Some(TxnId(1)), Path::new("/data/l")).unwrap();
    assert!(store.remove("tok1").unwrap());
    assert!(!store.remove("tok1").unwrap());
    assert!(matches!(store.read("tok1"), Err(DatalinkError::NotFound(_))));
}

#[test]
fn list_skips_temps_and_directories() {
    let tmp = tempfile::tempdir().unwrap();
    let (store, _) = store(&tmp);
    store.register("b", TokenMode::Read, Some(TxnId(1)), Path::new("/data/l")).unwrap();
    store.register("a", TokenMode::Write, Some(TxnId(2)), Path::new("/data/f")).unwrap();
    fs::write(store.dir().join(".a.deadbeef.tmp"), b"partial").unwrap();
    fs::create_dir(store.dir().join("subdir")).unwrap();
    assert_eq!(store.list().unwrap(), vec!["a".to_string(), "b".to_string()]);
}

#[test]
fn stale_temps_are_collected() {
    let tmp = tempfile::tempdir().unwrap();
    let (store, _) = store(&tmp);
    fs::write(store.dir().join(".x.1.tmp"), b"partial").unwrap();
    store.register("keep", TokenMode::Read, Some(TxnId(1)), Path::new("/data/l")).unwrap();
    assert_eq!(store.remove_stale_temps(Duration::from_secs(3600)).unwrap(), 0);
    assert_eq!(store.remove_stale_temps(Duration::ZERO).unwrap(), 1);
    assert_eq!(store.list().unwrap(), vec!["keep".to_string()]);
}

#[test]
fn expiry_uses_stored_creation_time() {
    let tmp = tempfile::tempdir().unwrap();
    let (store, clock) = store(&tmp);
    let rec = store.register("tok1", TokenMode::Read, Some(TxnId(1)), Path::new("/data/l")).unwrap();
    assert!(!rec.is_expired(clock.now_ms(), 60_000));
    clock.advance_secs(59);
    assert!(!rec.is_expired(clock.now_ms(), 60_000));
    clock.advance_secs(1);
    assert!(rec.is_expired(clock.now_ms(), 60_000));
    assert_eq!(rec.age_ms(clock.now_ms()), 60_000);
}

#[test]
fn mode_parsing() {
    assert_eq!("R".parse::<TokenMode>().unwrap(), TokenMode::Read);
    assert_eq!("w".parse::<TokenMode>().unwrap(), TokenMode::Write);
    assert!("RW".parse::<TokenMode>().is_err());
    assert_eq!(TokenMode::from_want_write(true), TokenMode::Write);
    assert_eq!(TokenMode::Read.to_string(), "R");
}

#[test]
fn longest_valid_id_registers() {
    let tmp = tempfile::tempdir().unwrap();
    let (store, _) = store(&tmp);
    let id = "a".repeat(crate::paths::MAX_TOKEN_ID_LEN);
    store.register(&id, TokenMode::Write, Some(TxnId(5)), Path::new("/data/ext/f")).unwrap();
    assert_eq!(store.read(&id).unwrap().owner_txid, TxnId(5));
    assert_eq!(store.list().unwrap(), vec![id]);
}

#[test]
fn conditional_remove_spares_a_reregistered_token() {
    let tmp = tempfile::tempdir().unwrap();
    let (store, clock) = store(&tmp);
    let old = store.register("tok1", TokenMode::Write, Some(TxnId(1)), Path::new("/data/f")).unwrap();
    assert!(store.remove("tok1").unwrap());
    clock.advance_secs(1);
    let new = store.register("tok1", TokenMode::Write, Some(TxnId(2)), Path::new("/data/f")).unwrap();

    assert!(!store.remove_if_unchanged(&old).unwrap());
    assert_eq!(store.read("tok1").unwrap(), new);
    assert!(store.remove_if_unchanged(&new).unwrap());
    assert!(!store.remove_if_unchanged(&new).unwrap());
}
