//! Integration tests for the directory-backed persistent store

use std::fs;

use sysprop::persist::TEMP_FILE_NAME;
use sysprop::{DirStore, PersistentStore, PropertyError, PropertyStore, StoreConfig};

fn config_for(dir: &std::path::Path) -> StoreConfig {
    StoreConfig::new().with_persist_dir(dir)
}

#[test]
fn test_value_survives_restart() {
    let dir = tempfile::tempdir().unwrap();

    {
        let store = PropertyStore::init(&config_for(dir.path())).unwrap();
        store.set("persist.test.key1", "hi").unwrap();
        store.set("test.volatile", "gone").unwrap();
    }

    let store = PropertyStore::init(&config_for(dir.path())).unwrap();
    assert_eq!(store.get("persist.test.key1").as_deref(), Some("hi"));
    assert_eq!(store.get("test.volatile"), None);
}

#[test]
fn test_file_layout() {
    let dir = tempfile::tempdir().unwrap();
    let store = PropertyStore::init(&config_for(dir.path())).unwrap();

    store.set("persist.sys.lang", "en").unwrap();
    store.set("persist.sys.lang", "fr").unwrap();

    // One file named after the property, raw value, no trailing newline
    assert_eq!(fs::read(dir.path().join("persist.sys.lang")).unwrap(), b"fr");
    // The shared temp file is renamed away
    assert!(!dir.path().join(TEMP_FILE_NAME).exists());
}

#[cfg(unix)]
#[test]
fn test_files_are_private() {
    use std::os::unix::fs::PermissionsExt;

    let dir = tempfile::tempdir().unwrap();
    let store = DirStore::new(dir.path());
    store.write("persist.secret", "x").unwrap();

    let mode = fs::metadata(dir.path().join("persist.secret"))
        .unwrap()
        .permissions()
        .mode();
    assert_eq!(mode & 0o777, 0o600);
}

#[test]
fn test_load_filters_entries() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("persist.a"), "1").unwrap();
    fs::write(dir.path().join("persist.b"), "two words").unwrap();
    fs::write(dir.path().join("other.c"), "3").unwrap();
    fs::write(dir.path().join(TEMP_FILE_NAME), "half-written").unwrap();
    fs::create_dir(dir.path().join("persist.dir")).unwrap();
    fs::write(dir.path().join("persist.bin"), [0xFF, 0xFE]).unwrap();

    let entries = DirStore::new(dir.path()).load_all().unwrap();
    assert_eq!(
        entries,
        vec![
            ("persist.a".to_string(), "1".to_string()),
            ("persist.b".to_string(), "two words".to_string()),
        ]
    );
}

#[test]
fn test_long_file_is_truncated() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("persist.long"), "x".repeat(200)).unwrap();

    let store = PropertyStore::init(&config_for(dir.path())).unwrap();
    assert_eq!(store.get("persist.long"), Some("x".repeat(91)));
}

#[test]
fn test_loading_does_not_rewrite_files() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("persist.keep");
    fs::write(&path, "value").unwrap();
    let before = fs::metadata(&path).unwrap().modified().unwrap();

    let store = PropertyStore::init(&config_for(dir.path())).unwrap();
    assert_eq!(store.get("persist.keep").as_deref(), Some("value"));

    let after = fs::metadata(&path).unwrap().modified().unwrap();
    assert_eq!(before, after);
    assert!(!dir.path().join(TEMP_FILE_NAME).exists());
}

#[test]
fn test_missing_directory_is_not_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let missing = dir.path().join("absent");

    let store = PropertyStore::init(&config_for(&missing)).unwrap();
    assert!(store.is_empty());

    // Writes fail in the backing store only
    store.set("persist.x", "1").unwrap();
    assert_eq!(store.get("persist.x").as_deref(), Some("1"));
    assert!(!missing.exists());
}

#[test]
fn test_unsafe_names_are_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let store = DirStore::new(dir.path());

    let err = store.write("persist./../escape", "x").unwrap_err();
    assert!(matches!(err, PropertyError::PersistIo { .. }));
    assert!(!dir.path().join("escape").exists());
}

#[test]
fn test_failed_rename_cleans_up_and_keeps_value() {
    let dir = tempfile::tempdir().unwrap();
    // A non-empty directory cannot be replaced by a file
    let blocker = dir.path().join("persist.x");
    fs::create_dir(&blocker).unwrap();
    fs::write(blocker.join("inside"), "keep").unwrap();

    let err = DirStore::new(dir.path()).write("persist.x", "1").unwrap_err();
    assert!(matches!(err, PropertyError::PersistIo { .. }));
    assert!(!dir.path().join(TEMP_FILE_NAME).exists());

    let store = PropertyStore::init(&config_for(dir.path())).unwrap();
    store.set("persist.x", "2").unwrap();
    assert_eq!(store.get("persist.x").as_deref(), Some("2"));
    assert!(!dir.path().join(TEMP_FILE_NAME).exists());
    assert!(blocker.join("inside").exists());
}
