// tests/store_integration.rs

//! Manifest database behavior across driver boundaries: identity
//! uniqueness, index integrity, and the remove guards.

mod common;

use common::TestEnv;
use newpkg::{PackageQuery, RemoveOptions};
use std::fs;

#[test]
fn test_manifest_uniqueness_is_preserved() {
    let env = TestEnv::new();
    env.register("alpha", "1.0", &[]);
    env.register("alpha", "1.0", &[]); // replace=true path
    env.register("alpha", "1.1", &[]);

    let store = env.store();
    let entries = store.list(None).unwrap();
    let mut ids: Vec<String> = entries
        .iter()
        .map(|e| format!("{}-{}", e.name, e.version))
        .collect();
    let before_dedup = ids.len();
    ids.dedup();
    assert_eq!(ids.len(), before_dedup, "no duplicate (name, version) pairs");

    // every index entry points at a manifest file that parses
    for entry in &entries {
        let path = env.config.db_dir.join(&entry.manifest);
        assert!(path.exists(), "{} missing", entry.manifest);
        newpkg::Manifest::load(&path).unwrap();
    }
}

#[test]
fn test_reindex_recovers_from_missing_index() {
    let env = TestEnv::new();
    env.register("alpha", "1.0", &[]);
    env.register("beta", "1.0", &["alpha"]);

    // simulate a crash between manifest write and index update
    fs::remove_file(env.config.db_dir.join("index.json")).unwrap();

    let store = env.store();
    let entries = store.reindex().unwrap();
    assert_eq!(entries.len(), 2);
    assert_eq!(store.revdeps("alpha").unwrap(), vec!["beta-1.0"]);
}

#[test]
fn test_ambiguous_remove_leaves_store_unchanged() {
    let env = TestEnv::new();
    env.register("alpha", "1.0", &[]);
    // second version with its own file
    let rel = "usr/bin/alpha-new";
    fs::write(env.root().join("usr/bin").join("alpha-new"), "v2").unwrap();
    let manifest: newpkg::Manifest = serde_json::from_value(serde_json::json!({
        "name": "alpha", "version": "1.1", "files": [format!("/{rel}")],
    }))
    .unwrap();
    env.store().add(&manifest, false).unwrap();

    let before = env.db_state();
    let summary = newpkg::remove(
        &env.config,
        &["alpha".to_string()],
        &RemoveOptions::default(),
    )
    .unwrap();
    assert_eq!(summary.exit_code(), 2);
    assert_eq!(env.db_state(), before, "failed remove must not mutate the db");

    // exact identity removes only that version
    let summary = newpkg::remove(
        &env.config,
        &["alpha-1.0".to_string()],
        &RemoveOptions::default(),
    )
    .unwrap();
    assert_eq!(summary.exit_code(), 0);
    let left = env.store().list(None).unwrap();
    assert_eq!(left.len(), 1);
    assert_eq!(left[0].version, "1.1");
}

#[test]
fn test_backup_restore_roundtrips_the_whole_db() {
    let env = TestEnv::new();
    env.register("alpha", "1.0", &[]);
    env.register("beta", "2.0", &["alpha"]);

    let store = env.store();
    let archive = store.backup().unwrap();

    store
        .remove(&PackageQuery::parse("beta"), true)
        .unwrap();
    assert_eq!(store.list(None).unwrap().len(), 1);

    let located =
        newpkg::db::BackupArchive::locate(&env.config, &archive.to_string_lossy()).unwrap();
    store.restore(&located).unwrap();
    assert_eq!(store.list(None).unwrap().len(), 2);
    assert_eq!(store.revdeps("alpha").unwrap(), vec!["beta-2.0"]);
}

#[test]
fn test_protected_removal_reports_and_preserves() {
    let env = TestEnv::new();
    env.register("bash", "5.2", &[]);
    fs::create_dir_all(env.config.protected_set_path.parent().unwrap()).unwrap();
    fs::write(&env.config.protected_set_path, "bash\n").unwrap();

    let before = env.db_state();
    let summary = newpkg::remove(
        &env.config,
        &["bash".to_string()],
        &RemoveOptions::default(),
    )
    .unwrap();
    assert_eq!(summary.exit_code(), 2);
    assert!(summary.failed[0].reason.contains("protected"));
    assert_eq!(env.db_state(), before);
    assert!(env.deployed_bin("bash").exists());
}
