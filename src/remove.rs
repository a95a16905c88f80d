// src/remove.rs

//! Remove driver: safe uninstallation of packages
//!
//! Each package goes through guards (protected set, reverse dependencies,
//! ambiguity) before anything is touched. The manifest moves to the backup
//! area first so the operation stays reversible, then the owned files are
//! deleted deepest-first with empty parent directories pruned.

use crate::config::Config;
use crate::db::ManifestStore;
use crate::error::{Error, Result};
use crate::fsutil::{remove_file_pruning, rooted, write_atomic};
use crate::graph::DepGraph;
use crate::hooks::run_hooks;
use crate::lock::StoreLock;
use crate::manifest::Manifest;
use crate::package::PackageQuery;
use crate::summary::RunSummary;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs;
use std::path::PathBuf;
use tracing::{info, warn};

/// Options for one remove run
#[derive(Debug, Clone, Default)]
pub struct RemoveOptions {
    /// Do not prompt; proceed with every eligible removal
    pub auto: bool,
    /// Override protected-set and reverse-dependency guards, and allow a
    /// bare name to remove several versions at once
    pub force: bool,
    /// Also remove conventional configuration and state directories
    pub purge: bool,
    /// Report what would be removed without touching anything
    pub dry_run: bool,
    /// Continue an interrupted run from its persisted state
    pub resume: bool,
    /// Skip the orphan sweep after removals
    pub no_depclean: bool,
    /// Skip the dependency-graph cache refresh after removals
    pub no_sync: bool,
}

/// Persisted progress of a remove batch, for `--resume`
#[derive(Debug, Default, Serialize, Deserialize)]
struct RemoveState {
    remaining: Vec<String>,
    completed: Vec<String>,
}

fn state_path(config: &Config) -> PathBuf {
    config.state_dir.join("remove_state.json")
}

/// Remove a batch of packages by name or `name-version`
pub fn remove(config: &Config, targets: &[String], options: &RemoveOptions) -> Result<RunSummary> {
    if targets.is_empty() && !options.resume {
        return Err(Error::Usage("no packages given".into()));
    }
    let _lock = StoreLock::acquire(config)?;
    config.ensure_dirs()?;
    let store = ManifestStore::new(config);
    store.init()?;
    let protected = config.protected_set();

    let mut queue: Vec<String> = if options.resume {
        let state: RemoveState = fs::read_to_string(state_path(config))
            .ok()
            .and_then(|text| serde_json::from_str(&text).ok())
            .unwrap_or_default();
        let mut q = state.remaining;
        q.extend(targets.iter().cloned());
        q
    } else {
        targets.to_vec()
    };
    queue.dedup();

    let mut summary = RunSummary::new();
    let mut state = RemoveState {
        remaining: queue.clone(),
        completed: Vec::new(),
    };

    for target in &queue {
        state.remaining.retain(|t| t != target);
        let result = remove_single(config, &store, &protected, target, options);
        match result {
            Ok(RemovalOutcome::Removed(ids)) => {
                for id in ids {
                    summary.completed(id);
                }
                state.completed.push(target.clone());
            }
            Ok(RemovalOutcome::DryRun(ids)) => {
                for id in ids {
                    println!("would remove {id}");
                    summary.skipped(id);
                }
            }
            Err(err) => {
                warn!(package = target, error = %err, "removal refused");
                summary.failed(target.clone(), err.to_string());
            }
        }
        write_atomic(&state_path(config), &serde_json::to_vec_pretty(&state)?)?;
    }

    if summary.is_clean() {
        let _ = fs::remove_file(state_path(config));
    }

    if !options.no_depclean && !options.dry_run {
        let orphans = store.orphans()?;
        if !orphans.is_empty() {
            info!(
                orphans = orphans.len(),
                "orphaned packages remain; run depclean to remove them"
            );
        }
    }
    if !options.no_sync {
        DepGraph::sync(&store, &config.graph_cache_path())?;
    }

    info!(%summary, "remove run finished");
    Ok(summary)
}

enum RemovalOutcome {
    Removed(Vec<String>),
    DryRun(Vec<String>),
}

fn remove_single(
    config: &Config,
    store: &ManifestStore,
    protected: &BTreeSet<String>,
    target: &str,
    options: &RemoveOptions,
) -> Result<RemovalOutcome> {
    let query = PackageQuery::parse(target);

    // resolve to exactly one manifest unless force permits more
    let manifests = store.get_all(&query)?;
    if manifests.len() > 1 && !options.force {
        return Err(Error::Ambiguous {
            query: target.to_string(),
            matches: manifests.iter().map(|m| m.id().to_string()).collect(),
        });
    }

    let name = query.name();
    if protected.contains(name) && !options.force {
        return Err(Error::Protected(name.to_string()));
    }

    // a package is still needed while other installed packages depend on it;
    // removing the last version is what the guard protects against
    let revdeps = store.revdeps(name)?;
    let removing_all = manifests.len() == store.get_all(&PackageQuery::Name(name.into()))?.len();
    if removing_all && !revdeps.is_empty() && !options.force {
        return Err(Error::Dependency(format!(
            "'{name}' is required by: {}",
            revdeps.join(", ")
        )));
    }

    if options.dry_run {
        return Ok(RemovalOutcome::DryRun(
            manifests.iter().map(|m| m.id().to_string()).collect(),
        ));
    }

    run_hooks(&config.hooks_dir, "pre-remove", &[target]);

    let mut removed = Vec::new();
    for manifest in &manifests {
        delete_package(config, store, manifest, options.purge)?;
        removed.push(manifest.id().to_string());
    }

    run_hooks(&config.hooks_dir, "post-remove", &[target]);
    Ok(RemovalOutcome::Removed(removed))
}

/// Delete one installed package: manifest to backup first, then the owned
/// files, then conventional state paths when purging
pub(crate) fn delete_package(
    config: &Config,
    store: &ManifestStore,
    manifest: &Manifest,
    purge: bool,
) -> Result<()> {
    let id = manifest.id();
    let root = config.root_for(manifest.stage);

    // manifest and index first; the file moves to backup so this step is
    // reversible by hand if the file sweep fails below
    store.remove(&PackageQuery::Exact(id.clone()), true)?;

    // deepest paths first so directories empty out as we go
    let mut paths: Vec<&str> = manifest.file_paths().collect();
    paths.sort_by_key(|p| std::cmp::Reverse(p.matches('/').count()));

    let mut failures = 0u32;
    for path in paths {
        let on_disk = rooted(root, path);
        if !on_disk.exists() && !on_disk.is_symlink() {
            continue;
        }
        if let Err(err) = remove_file_pruning(root, &on_disk) {
            warn!(file = %on_disk.display(), error = %err, "could not remove file");
            failures += 1;
        }
    }

    if purge {
        for conventional in [
            format!("etc/{}", manifest.name),
            format!("var/lib/{}", manifest.name),
            format!("var/cache/{}", manifest.name),
            format!("var/log/{}", manifest.name),
        ] {
            let dir = root.join(&conventional);
            if dir.is_dir() {
                info!(dir = %dir.display(), "purging");
                if let Err(err) = fs::remove_dir_all(&dir) {
                    warn!(dir = %dir.display(), error = %err, "could not purge");
                    failures += 1;
                }
            }
        }
    }

    if failures > 0 {
        return Err(Error::Io(format!(
            "{failures} file(s) of {id} could not be removed"
        )));
    }
    info!(package = %id, "removed");
    Ok(())
}
