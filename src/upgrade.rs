// src/upgrade.rs

//! Upgrade driver: snapshot, rebuild, commit or roll back
//!
//! Each package is snapshotted before anything destructive happens, then
//! driven through the full pipeline for the new version. A failure at any
//! point restores the snapshot, so the installed state of that package is
//! bit-for-bit what it was before the attempt. Progress is persisted so an
//! interrupted batch resumes with the failed package first.

use crate::config::Config;
use crate::db::ManifestStore;
use crate::depclean::{DepcleanMode, DepcleanOptions, confirm, depclean_locked};
use crate::error::{Error, Result};
use crate::fsutil::{remove_file_pruning, rooted, write_atomic};
use crate::graph::DepGraph;
use crate::hash::{fingerprint, sha256_file};
use crate::hooks::run_hooks;
use crate::lock::StoreLock;
use crate::manifest::Manifest;
use crate::metafile::{Metafile, find_metafile};
use crate::package::{PackageId, PackageQuery, Stage, compare_versions};
use crate::pipeline::{RunOptions, StageRunner};
use crate::snapshot::SnapshotStore;
use crate::summary::RunSummary;
use crate::vcs::commit_ports_tree;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs;
use std::path::PathBuf;
use tracing::{error, info, warn};

/// Options for one upgrade run
#[derive(Debug, Clone, Default)]
pub struct UpgradeOptions {
    /// Upgrade every installed package
    pub all: bool,
    /// Continue an interrupted batch; the failed package replays first
    pub resume: bool,
    /// Report planned upgrades without building
    pub dry_run: bool,
    /// Upgrade even when the versions are equal
    pub force: bool,
    /// Remove orphaned files and packages without confirmation
    pub auto: bool,
    /// Restore the latest snapshot instead of upgrading
    pub rollback: bool,
    /// Suppress the ports-tree commit even when auto-commit is configured
    pub no_commit: bool,
    /// Override the stage of every metafile in the batch
    pub stage: Option<Stage>,
    /// Keep going after a package fails
    pub continue_on_error: bool,
}

/// Persisted progress of an upgrade batch
#[derive(Debug, Default, Serialize, Deserialize)]
struct UpgradeState {
    remaining: Vec<String>,
    completed: Vec<String>,
    failed_current: Option<String>,
}

fn state_path(config: &Config) -> PathBuf {
    config.state_dir.join("upgrade_state.json")
}

/// Upgrade a batch of packages (or everything installed with `all`)
pub fn upgrade(config: &Config, targets: &[String], options: &UpgradeOptions) -> Result<RunSummary> {
    let _lock = StoreLock::acquire(config)?;
    config.ensure_dirs()?;
    let store = ManifestStore::new(config);
    store.init()?;
    let snapshots = SnapshotStore::new(config);

    if options.rollback {
        return rollback_targets(config, &store, &snapshots, targets);
    }

    let mut queue = build_queue(config, &store, targets, options)?;
    if queue.is_empty() {
        return Err(Error::Usage(
            "no packages to upgrade (give package names or --all)".into(),
        ));
    }
    queue.dedup();

    let mut state = UpgradeState {
        remaining: queue.clone(),
        completed: Vec::new(),
        failed_current: None,
    };
    let mut summary = RunSummary::new();
    // orphaned files of each successful upgrade: (stage root, paths)
    let mut stale_files: Vec<(PathBuf, Vec<String>)> = Vec::new();
    let mut upgraded: Vec<(String, String, String)> = Vec::new();

    for name in &queue {
        state.remaining.retain(|n| n != name);
        if crate::chroot::interrupted() {
            warn!("interrupted; persisting upgrade state");
            state.remaining.insert(0, name.clone());
            write_atomic(&state_path(config), &serde_json::to_vec_pretty(&state)?)?;
            for rest in &state.remaining {
                summary.skipped(rest.clone());
            }
            return Ok(summary);
        }

        match upgrade_one(config, &store, &snapshots, name, options) {
            Ok(UpgradeOutcome::Skipped(version)) => {
                info!(package = name, version, "already current");
                summary.skipped(format!("{name}-{version}"));
            }
            Ok(UpgradeOutcome::DryRun { from, to }) => {
                println!(
                    "{name}: {} -> {to}",
                    from.as_deref().unwrap_or("not installed")
                );
                summary.skipped(name.clone());
            }
            Ok(UpgradeOutcome::Upgraded { from, to, orphans, root }) => {
                summary.completed(format!("{name}-{to}"));
                state.completed.push(name.clone());
                if !orphans.is_empty() {
                    stale_files.push((root, orphans));
                }
                upgraded.push((name.clone(), from.unwrap_or_else(|| "none".into()), to));
            }
            Err(err) => {
                error!(event = "upgrade-failed", package = name, error = %err);
                run_hooks(&config.hooks_dir, "upgrade-failed", &[name]);
                summary.failed(name.clone(), err.to_string());
                state.failed_current = Some(name.clone());
                if !options.dry_run {
                    write_atomic(&state_path(config), &serde_json::to_vec_pretty(&state)?)?;
                }
                if !options.continue_on_error {
                    for rest in &state.remaining {
                        summary.skipped(rest.clone());
                    }
                    return Ok(summary);
                }
            }
        }
        if !options.dry_run {
            write_atomic(&state_path(config), &serde_json::to_vec_pretty(&state)?)?;
        }
    }

    // only a fully clean batch prunes old files and runs the collaborators
    if summary.is_clean() && !options.dry_run {
        prune_stale_files(&stale_files, options.auto);
        // orphan packages are only reported here; removing them is the
        // explicit job of `depclean --auto`
        depclean_locked(
            config,
            &store,
            &DepcleanOptions {
                mode: DepcleanMode::DryRun,
                ..Default::default()
            },
        )?;
        DepGraph::sync(&store, &config.graph_cache_path())?;
        let pruned = snapshots.prune(config.keep_snapshots_days)?;
        if pruned > 0 {
            info!(pruned, "expired snapshots removed");
        }
        if config.auto_commit && !options.no_commit && !upgraded.is_empty() {
            let lines: Vec<String> = upgraded
                .iter()
                .map(|(n, from, to)| format!("{n} {from} -> {to}"))
                .collect();
            commit_ports_tree(config, &format!("upgrade: {}", lines.join(", ")));
        }
        let _ = fs::remove_file(state_path(config));
    }

    info!(%summary, "upgrade run finished");
    Ok(summary)
}

enum UpgradeOutcome {
    Skipped(String),
    DryRun {
        from: Option<String>,
        to: String,
    },
    Upgraded {
        from: Option<String>,
        to: String,
        orphans: Vec<String>,
        root: PathBuf,
    },
}

fn upgrade_one(
    config: &Config,
    store: &ManifestStore,
    snapshots: &SnapshotStore,
    name: &str,
    options: &UpgradeOptions,
) -> Result<UpgradeOutcome> {
    let metafile_path = find_metafile(&config.ports_dir, name)?;
    let mut meta = Metafile::load(&metafile_path)?;
    if let Some(stage) = options.stage {
        meta.stage = stage;
    }
    let v_new = meta.version.clone();

    let old = installed_manifest(store, name)?;
    if let Some(old_manifest) = &old
        && old_manifest.version == v_new
        && !options.force
    {
        return Ok(UpgradeOutcome::Skipped(v_new));
    }

    if options.dry_run {
        return Ok(UpgradeOutcome::DryRun {
            from: old.map(|m| m.version),
            to: v_new,
        });
    }

    run_hooks(&config.hooks_dir, "pre-upgrade", &[name]);

    // a snapshot must exist before any destructive step when an install is
    // present
    let snapshot = match &old {
        Some(old_manifest) => Some(snapshots.create(store, &old_manifest.id())?),
        None => None,
    };

    let runner = StageRunner::new(config, store, &meta, &metafile_path);
    let run = runner.run(RunOptions {
        resume: options.resume,
        force_fetch: options.force,
    });

    if let Err(err) = run {
        if let (Some(snap), Some(old_manifest)) = (&snapshot, &old) {
            warn!(package = name, "build failed, restoring snapshot");
            snapshots.restore(store, snap, old_manifest.stage)?;
        }
        return Err(err);
    }

    // replace the old manifest; the new one registered under the new version
    let new_id = PackageId::new(name, &v_new);
    if let Some(old_manifest) = &old
        && old_manifest.version != v_new
    {
        store.remove(&PackageQuery::Exact(old_manifest.id()), true)?;
    }

    check_integrity(config, store, &new_id)?;
    run_hooks(&config.hooks_dir, "post-upgrade", &[name]);

    let new_manifest = store.get(&PackageQuery::Exact(new_id))?;
    let orphans = match &old {
        Some(old_manifest) => orphan_files(old_manifest, &new_manifest),
        None => Vec::new(),
    };
    Ok(UpgradeOutcome::Upgraded {
        from: old.map(|m| m.version),
        to: v_new,
        orphans,
        root: config.root_for(new_manifest.stage).to_path_buf(),
    })
}

/// The installed manifest for `name`, highest version when several exist
fn installed_manifest(store: &ManifestStore, name: &str) -> Result<Option<Manifest>> {
    match store.get_all(&PackageQuery::Name(name.to_string())) {
        Ok(mut manifests) => {
            manifests.sort_by(|a, b| compare_versions(&a.version, &b.version));
            Ok(manifests.pop())
        }
        Err(Error::NotFound(_)) => Ok(None),
        Err(err) => Err(err),
    }
}

/// Files the old version owned that the new one does not
fn orphan_files(old: &Manifest, new: &Manifest) -> Vec<String> {
    let kept: BTreeSet<&str> = new.file_paths().collect();
    old.file_paths()
        .filter(|p| !kept.contains(p))
        .map(str::to_string)
        .collect()
}

fn prune_stale_files(stale: &[(PathBuf, Vec<String>)], auto: bool) {
    for (root, files) in stale {
        if !auto {
            let listing = files.join("\n  ");
            if !confirm(&format!(
                "Remove {} file(s) left behind by the old version?\n  {listing}\n[y/N] ",
                files.len()
            )) {
                info!("stale files kept");
                continue;
            }
        }
        for path in files {
            let on_disk = rooted(root, path);
            if !on_disk.exists() && !on_disk.is_symlink() {
                continue;
            }
            if let Err(err) = remove_file_pruning(root, &on_disk) {
                warn!(file = %on_disk.display(), error = %err, "could not remove stale file");
            }
        }
    }
}

/// Advisory comparison of recorded hashes against the deployed files
///
/// A mismatch is logged, never fatal: it usually means something else
/// touched the tree while the upgrade ran.
fn check_integrity(config: &Config, store: &ManifestStore, id: &PackageId) -> Result<()> {
    let manifest = store.get(&PackageQuery::Exact(id.clone()))?;
    let root = config.root_for(manifest.stage);

    let recorded: Vec<String> = manifest
        .files
        .iter()
        .filter_map(|f| f.sha256().map(str::to_string))
        .collect();
    if recorded.is_empty() {
        return Ok(());
    }

    let mut actual = Vec::new();
    for file in &manifest.files {
        if file.sha256().is_none() {
            continue;
        }
        let on_disk = rooted(root, file.path());
        match sha256_file(&on_disk) {
            Ok(hash) => actual.push(hash),
            Err(_) => actual.push(String::from("missing")),
        }
    }

    if fingerprint(recorded.iter()) != fingerprint(actual.iter()) {
        warn!(package = %id, "integrity fingerprint changed between build and deploy");
    }
    Ok(())
}

/// Restore each target's most recent snapshot
fn rollback_targets(
    config: &Config,
    store: &ManifestStore,
    snapshots: &SnapshotStore,
    targets: &[String],
) -> Result<RunSummary> {
    if targets.is_empty() {
        return Err(Error::Usage("rollback needs package names".into()));
    }
    let mut summary = RunSummary::new();
    for name in targets {
        match snapshots.latest_for(name)? {
            Some(snapshot) => {
                let stage = snapshot.manifest().map(|m| m.stage).unwrap_or_default();
                match snapshots.restore(store, &snapshot, stage) {
                    Ok(()) => summary.completed(snapshot.id().to_string()),
                    Err(err) => summary.failed(name.clone(), err.to_string()),
                }
            }
            None => summary.failed(name.clone(), format!("no snapshot for '{name}'")),
        }
    }
    let _ = DepGraph::sync(store, &config.graph_cache_path());
    info!(%summary, "rollback finished");
    Ok(summary)
}

fn build_queue(
    config: &Config,
    store: &ManifestStore,
    targets: &[String],
    options: &UpgradeOptions,
) -> Result<Vec<String>> {
    let mut queue: Vec<String> = if options.resume {
        let state: UpgradeState = fs::read_to_string(state_path(config))
            .ok()
            .and_then(|text| serde_json::from_str(&text).ok())
            .unwrap_or_default();
        // the failed package replays first
        let mut q: Vec<String> = state.failed_current.into_iter().collect();
        q.extend(state.remaining);
        q
    } else {
        Vec::new()
    };

    if options.all {
        let mut names: Vec<String> = store.list(None)?.into_iter().map(|e| e.name).collect();
        names.sort();
        names.dedup();
        queue.extend(names);
    } else {
        queue.extend(targets.iter().cloned());
    }
    Ok(queue)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_orphan_files_difference() {
        let old: Manifest = serde_json::from_str(
            r#"{"name": "a", "version": "1.0",
                "files": ["/usr/bin/a", "/usr/share/a/old.dat", "/usr/share/a/keep.dat"]}"#,
        )
        .unwrap();
        let new: Manifest = serde_json::from_str(
            r#"{"name": "a", "version": "1.1",
                "files": ["/usr/bin/a", "/usr/share/a/keep.dat", "/usr/share/a/new.dat"]}"#,
        )
        .unwrap();
        assert_eq!(orphan_files(&old, &new), vec!["/usr/share/a/old.dat"]);
        assert!(orphan_files(&new, &new).is_empty());
    }

    #[test]
    fn test_state_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::for_root(dir.path());
        config.ensure_dirs().unwrap();

        let state = UpgradeState {
            remaining: vec!["beta".into()],
            completed: vec!["alpha".into()],
            failed_current: Some("gamma".into()),
        };
        write_atomic(
            &state_path(&config),
            &serde_json::to_vec_pretty(&state).unwrap(),
        )
        .unwrap();

        let store = ManifestStore::new(&config);
        store.init().unwrap();
        let queue = build_queue(
            &config,
            &store,
            &[],
            &UpgradeOptions {
                resume: true,
                ..Default::default()
            },
        )
        .unwrap();
        // failed package first, then the remaining ones
        assert_eq!(queue, vec!["gamma", "beta"]);
    }

    #[test]
    fn test_build_queue_all_lists_installed_names() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::for_root(dir.path());
        config.ensure_dirs().unwrap();
        let store = ManifestStore::new(&config);
        store.init().unwrap();
        for (name, version) in [("b", "1"), ("a", "1"), ("a", "2")] {
            let m: Manifest = serde_json::from_value(serde_json::json!({
                "name": name, "version": version,
                "files": [format!("/usr/bin/{name}-{version}")],
            }))
            .unwrap();
            store.add(&m, false).unwrap();
        }

        let queue = build_queue(
            &config,
            &store,
            &[],
            &UpgradeOptions {
                all: true,
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(queue, vec!["a", "b"]);
    }

    #[test]
    fn test_installed_manifest_picks_highest_version() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::for_root(dir.path());
        config.ensure_dirs().unwrap();
        let store = ManifestStore::new(&config);
        store.init().unwrap();
        for version in ["1.2", "1.10"] {
            let m: Manifest = serde_json::from_value(serde_json::json!({
                "name": "a", "version": version,
                "files": [format!("/usr/bin/a-{version}")],
            }))
            .unwrap();
            store.add(&m, false).unwrap();
        }
        let picked = installed_manifest(&store, "a").unwrap().unwrap();
        assert_eq!(picked.version, "1.10");
        assert!(installed_manifest(&store, "zzz").unwrap().is_none());
    }
}
