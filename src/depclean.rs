// src/depclean.rs

//! Depclean driver: find and remove orphaned packages
//!
//! Orphans come from the dependency graph when one can be built, with a
//! store-only fallback (every installed name whose revdeps list is empty).
//! Nothing is removed unless the caller chose an explicit mode: the default
//! is a dry run, `--interactive` confirms each candidate on the terminal,
//! and `--auto` removes without asking.

use crate::config::Config;
use crate::db::ManifestStore;
use crate::error::Result;
use crate::graph::DepGraph;
use crate::lock::StoreLock;
use crate::package::PackageQuery;
use crate::remove::delete_package;
use crate::summary::RunSummary;
use crate::vcs::commit_ports_tree;
use std::io::{self, BufRead, Write};
use tracing::{info, warn};

/// How depclean decides to act on a candidate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DepcleanMode {
    /// Report candidates without removing anything
    #[default]
    DryRun,
    /// Ask for confirmation per candidate
    Interactive,
    /// Remove every eligible candidate
    Auto,
}

/// Options for one depclean run
#[derive(Debug, Clone, Default)]
pub struct DepcleanOptions {
    pub mode: DepcleanMode,
    /// Remove candidates even when the double-check still sees revdeps
    pub force: bool,
    /// Verify the surviving packages' files afterwards
    pub verify: bool,
    /// Drop the dependency-graph cache before computing orphans
    pub purge_cache: bool,
    /// Commit the ports tree after removals
    pub auto_commit: bool,
}

/// Remove orphaned packages
pub fn depclean(config: &Config, options: &DepcleanOptions) -> Result<RunSummary> {
    let _lock = StoreLock::acquire(config)?;
    config.ensure_dirs()?;
    let store = ManifestStore::new(config);
    store.init()?;
    depclean_locked(config, &store, options)
}

/// Depclean body for callers that already hold the store lock
pub(crate) fn depclean_locked(
    config: &Config,
    store: &ManifestStore,
    options: &DepcleanOptions,
) -> Result<RunSummary> {
    if options.purge_cache {
        DepGraph::purge_cache(&config.graph_cache_path())?;
    }
    let protected = config.protected_set();

    // graph-based detection preferred; the store scan is the fallback
    let candidates: Vec<String> = match DepGraph::from_store(store) {
        Ok(graph) => graph.orphans(&protected),
        Err(err) => {
            warn!(error = %err, "graph unavailable, falling back to store scan");
            store
                .orphans()?
                .into_iter()
                .map(|e| e.name)
                .filter(|n| !protected.contains(n))
                .collect()
        }
    };
    info!(candidates = candidates.len(), "orphan candidates");

    let mut summary = RunSummary::new();
    for name in &candidates {
        if protected.contains(name) {
            summary.skipped(name.clone());
            continue;
        }
        // the graph may be stale; re-check against the live store
        let revdeps = store.revdeps(name)?;
        if !revdeps.is_empty() && !options.force {
            info!(package = name, revdeps = ?revdeps, "kept: still depended upon");
            summary.skipped(name.clone());
            continue;
        }

        match options.mode {
            DepcleanMode::DryRun => {
                println!("orphan: {name}");
                summary.skipped(name.clone());
            }
            DepcleanMode::Interactive => {
                if confirm(&format!("Remove orphan '{name}'? [y/N] ")) {
                    remove_orphan(config, store, name, &mut summary);
                } else {
                    summary.skipped(name.clone());
                }
            }
            DepcleanMode::Auto => {
                remove_orphan(config, store, name, &mut summary);
            }
        }
    }

    if matches!(options.mode, DepcleanMode::Auto | DepcleanMode::Interactive) {
        DepGraph::sync(store, &config.graph_cache_path())?;
        if options.auto_commit && !summary.completed.is_empty() {
            commit_ports_tree(
                config,
                &format!("depclean: removed {}", summary.completed.join(", ")),
            );
        }
    }

    if options.verify {
        for entry in store.list(None)? {
            let issues = store.verify(&PackageQuery::Exact(entry.id()))?;
            for issue in issues {
                warn!(%issue, "verification");
            }
        }
    }

    info!(%summary, "depclean finished");
    Ok(summary)
}

fn remove_orphan(config: &Config, store: &ManifestStore, name: &str, summary: &mut RunSummary) {
    let query = PackageQuery::Name(name.to_string());
    let manifests = match store.get_all(&query) {
        Ok(m) => m,
        Err(err) => {
            summary.failed(name.to_string(), err.to_string());
            return;
        }
    };
    for manifest in &manifests {
        match delete_package(config, store, manifest, false) {
            Ok(()) => summary.completed(manifest.id().to_string()),
            Err(err) => summary.failed(manifest.id().to_string(), err.to_string()),
        }
    }
}

pub(crate) fn confirm(prompt: &str) -> bool {
    print!("{prompt}");
    let _ = io::stdout().flush();
    let mut line = String::new();
    if io::stdin().lock().read_line(&mut line).is_err() {
        return false;
    }
    matches!(line.trim().to_lowercase().as_str(), "y" | "yes")
}

/// Orphans as depclean would see them, without acting; used by callers that
/// only want the report
pub fn orphan_report(config: &Config, store: &ManifestStore) -> Result<Vec<String>> {
    let protected = config.protected_set();
    Ok(DepGraph::from_store(store)?.orphans(&protected))
}
