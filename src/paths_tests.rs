use super::*;

#[test]
fn relative_target_resolves_under_base() {
    let base = Path::new("/data/ext");
    let p = resolve_target(base, Path::new("sub/file1")).unwrap();
    assert_eq!(p, PathBuf::from("/data/ext/sub/file1"));
}

#[test]
fn absolute_target_inside_base_is_kept() {
    let base = Path::new("/data/ext");
    let p = resolve_target(base, Path::new("/data/ext/file1")).unwrap();
    assert_eq!(p, PathBuf::from("/data/ext/file1"));
}

#[test]
fn escaping_targets_are_rejected() {
    let base = Path::new("/data/ext");
    assert!(matches!(resolve_target(base, Path::new("../etc/passwd")), Err(DatalinkError::InvalidArgument(_))));
    assert!(matches!(resolve_target(base, Path::new("/data/ext2/f")), Err(DatalinkError::InvalidArgument(_))));
    assert!(matches!(resolve_target(base, Path::new("/data/ext")), Err(DatalinkError::InvalidArgument(_))));
    assert!(matches!(resolve_target(base, Path::new("")), Err(DatalinkError::InvalidArgument(_))));
}

#[test]
fn token_ids_are_plain_file_names() {
    validate_token_id("tok1").unwrap();
    validate_token_id("0b1e2f-aa").unwrap();
    for bad in ["", ".hidden", "a/b", "a\\b", "a\0b"] {
        assert!(validate_token_id(bad).is_err(), "accepted {:?}", bad);
    }
    let long = "x".repeat(MAX_TOKEN_ID_LEN + 1);
    assert!(validate_token_id(&long).is_err());
}

#[test]
fn temp_names_are_hidden_and_unique() {
    let dir = Path::new("/tok");
    let a = token_temp_file(dir);
    let b = token_temp_file(dir);
    assert_ne!(a, b);
    let name = a.file_name().unwrap().to_str().unwrap();
    assert!(is_temp_name(name));
    assert!(!is_temp_name("tok1"));
    assert!(name.len() < MAX_TOKEN_ID_LEN);
}
