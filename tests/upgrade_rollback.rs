// tests/upgrade_rollback.rs

//! Upgrade driver: version swaps, rollback on failure, stale-file pruning,
//! and resume state.

mod common;

use common::TestEnv;
use newpkg::{InstallOptions, PackageQuery, UpgradeOptions};
use std::fs;

fn install_v1(env: &TestEnv, name: &str) {
    env.write_port(name, "1.0", &[]);
    let summary = newpkg::install(
        &env.config,
        &[name.to_string()],
        &InstallOptions::default(),
    )
    .unwrap();
    assert_eq!(summary.exit_code(), 0);
}

#[test]
fn test_successful_upgrade_swaps_versions() {
    let env = TestEnv::new();
    install_v1(&env, "alpha");
    let v1_contents = fs::read(env.deployed_bin("alpha")).unwrap();

    // new recipe in the ports tree
    env.write_port("alpha", "1.1", &[]);
    let summary = newpkg::upgrade(
        &env.config,
        &["alpha".to_string()],
        &UpgradeOptions {
            auto: true,
            ..Default::default()
        },
    )
    .unwrap();
    assert_eq!(summary.exit_code(), 0);
    assert_eq!(summary.completed, vec!["alpha-1.1"]);

    let manifest = env.store().get(&PackageQuery::parse("alpha")).unwrap();
    assert_eq!(manifest.version, "1.1");
    // only one manifest for the name remains
    assert_eq!(env.store().list(None).unwrap().len(), 1);

    let v2_contents = fs::read(env.deployed_bin("alpha")).unwrap();
    assert_ne!(v1_contents, v2_contents);

    // a snapshot of the pre-upgrade version exists
    let snaps = newpkg::SnapshotStore::new(&env.config);
    let snap = snaps.latest_for("alpha").unwrap().unwrap();
    assert_eq!(snap.metadata.version, "1.0");
}

#[test]
fn test_failed_upgrade_rolls_back() {
    let env = TestEnv::new();
    install_v1(&env, "alpha");
    let before_bin = fs::read(env.deployed_bin("alpha")).unwrap();
    let before_manifest = env.store().get(&PackageQuery::parse("alpha")).unwrap();

    // 1.1 has a failing build command
    env.write_port_with_build("alpha", "1.1", &[], "exit 1");
    let summary = newpkg::upgrade(
        &env.config,
        &["alpha".to_string()],
        &UpgradeOptions::default(),
    )
    .unwrap();
    assert_eq!(summary.exit_code(), 2);
    assert_eq!(summary.failed[0].package, "alpha");

    // the snapshot was restored: same version, same file contents
    let after_manifest = env.store().get(&PackageQuery::parse("alpha")).unwrap();
    assert_eq!(after_manifest.version, "1.0");
    assert_eq!(
        serde_json::to_string(&before_manifest.files).unwrap(),
        serde_json::to_string(&after_manifest.files).unwrap()
    );
    assert_eq!(fs::read(env.deployed_bin("alpha")).unwrap(), before_bin);

    // driver state persisted for --resume
    assert!(env.config.state_dir.join("upgrade_state.json").exists());
}

#[test]
fn test_equal_versions_are_skipped_without_force() {
    let env = TestEnv::new();
    install_v1(&env, "alpha");

    let summary = newpkg::upgrade(
        &env.config,
        &["alpha".to_string()],
        &UpgradeOptions::default(),
    )
    .unwrap();
    assert_eq!(summary.exit_code(), 0);
    assert_eq!(summary.skipped, vec!["alpha-1.0"]);
    assert!(summary.completed.is_empty());
}

#[test]
fn test_upgrade_prunes_files_the_new_version_dropped() {
    let env = TestEnv::new();
    install_v1(&env, "alpha");

    // give 1.0 an extra data file that 1.1 will not ship
    let extra_rel = "usr/share/alpha/legacy.dat";
    let extra = env.root().join(extra_rel);
    fs::create_dir_all(extra.parent().unwrap()).unwrap();
    fs::write(&extra, "legacy").unwrap();
    let store = env.store();
    let mut manifest = store.get(&PackageQuery::parse("alpha")).unwrap();
    manifest
        .files
        .push(newpkg::ManifestFile::Path(format!("/{extra_rel}")));
    store.add(&manifest, true).unwrap();

    env.write_port("alpha", "1.1", &[]);
    let summary = newpkg::upgrade(
        &env.config,
        &["alpha".to_string()],
        &UpgradeOptions {
            auto: true,
            ..Default::default()
        },
    )
    .unwrap();
    assert_eq!(summary.exit_code(), 0);
    assert!(!extra.exists(), "orphaned file of the old version removed");
    assert!(env.deployed_bin("alpha").exists());
}

#[test]
fn test_rollback_flag_restores_latest_snapshot() {
    let env = TestEnv::new();
    install_v1(&env, "alpha");

    env.write_port("alpha", "1.1", &[]);
    newpkg::upgrade(
        &env.config,
        &["alpha".to_string()],
        &UpgradeOptions {
            auto: true,
            ..Default::default()
        },
    )
    .unwrap();
    assert_eq!(
        env.store().get(&PackageQuery::parse("alpha")).unwrap().version,
        "1.1"
    );

    let summary = newpkg::upgrade(
        &env.config,
        &["alpha".to_string()],
        &UpgradeOptions {
            rollback: true,
            ..Default::default()
        },
    )
    .unwrap();
    assert_eq!(summary.exit_code(), 0);
    assert_eq!(
        env.store().get(&PackageQuery::parse("alpha")).unwrap().version,
        "1.0"
    );
}

#[test]
fn test_upgrade_all_skips_current_and_upgrades_stale() {
    let env = TestEnv::new();
    install_v1(&env, "alpha");
    install_v1(&env, "beta");

    env.write_port("beta", "2.0", &[]);
    let summary = newpkg::upgrade(
        &env.config,
        &[],
        &UpgradeOptions {
            all: true,
            auto: true,
            ..Default::default()
        },
    )
    .unwrap();
    assert_eq!(summary.exit_code(), 0);
    assert_eq!(summary.completed, vec!["beta-2.0"]);
    assert_eq!(summary.skipped, vec!["alpha-1.0"]);
}
