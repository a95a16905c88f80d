// src/install.rs

//! Install driver: dependency-ordered batch installation
//!
//! Resolves the requested packages and their dependency closure against the
//! ports tree, orders them leaves-first, prepares the staging root when the
//! batch contains bootstrap packages, then drives each package through the
//! pipeline. The manifest store is locked for the whole run.

use crate::chroot::{ChrootGuard, interrupted};
use crate::config::Config;
use crate::db::ManifestStore;
use crate::error::{Error, Result};
use crate::graph::DepGraph;
use crate::lock::StoreLock;
use crate::metafile::{Metafile, find_metafile};
use crate::package::{Stage, dep_name};
use crate::pipeline::{RunOptions, StageRunner};
use crate::summary::RunSummary;
use nix::unistd::geteuid;
use std::collections::BTreeMap;
use std::path::PathBuf;
use tracing::{info, warn};

/// Options for one install run
#[derive(Debug, Clone, Default)]
pub struct InstallOptions {
    /// Resume each package from its checkpoint
    pub resume: bool,
    /// Print the plan without building anything
    pub dry_run: bool,
    /// Reinstall targets that are already installed and re-fetch sources
    pub force: bool,
    /// Override the stage of every metafile in the batch
    pub stage: Option<Stage>,
    /// Keep going after a package fails
    pub continue_on_error: bool,
}

/// Install a batch of packages by name
pub fn install(config: &Config, targets: &[String], options: &InstallOptions) -> Result<RunSummary> {
    if targets.is_empty() {
        return Err(Error::Usage("no packages given".into()));
    }
    let _lock = StoreLock::acquire(config)?;
    config.ensure_dirs()?;
    let store = ManifestStore::new(config);
    store.init()?;

    let (graph, metafiles) =
        resolve_closure(config, &store, targets, options.stage, options.force)?;
    let order = graph.order(targets, !options.force)?;
    info!(order = ?order, "install order computed");

    if options.dry_run {
        let mut summary = RunSummary::new();
        for name in &order {
            println!("{name}");
            summary.skipped(name.clone());
        }
        return Ok(summary);
    }

    // the staging root only needs mounts when the batch builds bootstrap
    // packages, and mounting needs real privilege
    let needs_chroot = order
        .iter()
        .filter_map(|n| metafiles.get(n))
        .any(|(meta, _)| meta.stage.is_bootstrap());
    let mut chroot = if needs_chroot && geteuid().is_root() {
        Some(ChrootGuard::mount(&config.lfs_root)?)
    } else {
        if needs_chroot {
            warn!("not running as root; skipping staging-root mounts");
        }
        None
    };

    let mut summary = RunSummary::new();
    for name in &order {
        if interrupted() {
            warn!("interrupted; not scheduling further packages");
            for rest in order.iter().skip_while(|n| *n != name) {
                summary.skipped(rest.clone());
            }
            break;
        }
        let Some((meta, metafile_path)) = metafiles.get(name) else {
            // already installed; ordering kept it only as a dependency
            summary.skipped(name.clone());
            continue;
        };

        let runner = StageRunner::new(config, &store, meta, metafile_path);
        let run = runner.run(RunOptions {
            resume: options.resume,
            force_fetch: options.force,
        });
        match run {
            Ok(()) => {
                summary.completed(meta.id().to_string());
                if let Some(guard) = &chroot {
                    guard.clean_between()?;
                }
            }
            Err(err) => {
                summary.failed(meta.id().to_string(), err.to_string());
                if !options.continue_on_error {
                    break;
                }
            }
        }
    }

    if let Some(guard) = &mut chroot {
        guard.umount();
    }
    DepGraph::sync(&store, &config.graph_cache_path())?;
    info!(%summary, "install run finished");
    Ok(summary)
}

/// Load metafiles for the targets and every missing dependency until the
/// closure is complete
///
/// Returns the graph (installed packages plus candidates) and the metafiles
/// loaded from the ports tree, keyed by package name.
fn resolve_closure(
    config: &Config,
    store: &ManifestStore,
    targets: &[String],
    stage_override: Option<Stage>,
    force: bool,
) -> Result<(DepGraph, BTreeMap<String, (Metafile, PathBuf)>)> {
    let mut graph = DepGraph::from_store(store)?;
    let mut metafiles: BTreeMap<String, (Metafile, PathBuf)> = BTreeMap::new();
    let mut worklist: Vec<String> = targets.to_vec();

    while let Some(name) = worklist.pop() {
        if metafiles.contains_key(&name) {
            continue;
        }
        let is_target = targets.contains(&name);
        let installed = graph.node(&name).map(|n| n.installed).unwrap_or(false);
        if installed && !(is_target && force) {
            continue; // satisfied by an installed package
        }
        let path = find_metafile(&config.ports_dir, &name).map_err(|_| {
            Error::Dependency(format!(
                "'{name}' is not installed and has no metafile in {}",
                config.ports_dir.display()
            ))
        })?;
        let mut meta = Metafile::load(&path)?;
        if let Some(stage) = stage_override {
            meta.stage = stage;
        }
        graph.add_metafile(&meta);
        for token in meta.depends.all() {
            worklist.push(dep_name(token).to_string());
        }
        metafiles.insert(name, (meta, path));
    }

    // everything in the closure must now resolve inside the graph
    for name in metafiles.keys() {
        let unresolved = graph.unresolved_of(name);
        if !unresolved.is_empty() {
            return Err(Error::Dependency(format!(
                "'{name}' has unsatisfiable dependencies: {}",
                unresolved.join(", ")
            )));
        }
    }
    Ok((graph, metafiles))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn write_port(config: &Config, name: &str, version: &str, run_deps: &[&str]) {
        let deps = run_deps
            .iter()
            .map(|d| format!("    - {d}"))
            .collect::<Vec<_>>()
            .join("\n");
        let deps_block = if run_deps.is_empty() {
            String::new()
        } else {
            format!("depends:\n  run:\n{deps}\n")
        };
        let yaml = format!("name: {name}\nversion: \"{version}\"\n{deps_block}");
        fs::create_dir_all(&config.ports_dir).unwrap();
        fs::write(config.ports_dir.join(format!("{name}.yaml")), yaml).unwrap();
    }

    #[test]
    fn test_resolve_closure_pulls_dependencies() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::for_root(dir.path());
        config.ensure_dirs().unwrap();
        let store = ManifestStore::new(&config);
        store.init().unwrap();

        write_port(&config, "beta", "1.0", &["alpha"]);
        write_port(&config, "alpha", "1.0", &[]);

        let (graph, metafiles) =
            resolve_closure(&config, &store, &["beta".to_string()], None, false).unwrap();
        assert!(metafiles.contains_key("alpha"));
        assert!(metafiles.contains_key("beta"));
        let order = graph.order(&["beta".to_string()], true).unwrap();
        assert_eq!(order, vec!["alpha", "beta"]);
    }

    #[test]
    fn test_resolve_closure_missing_dep_fails() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::for_root(dir.path());
        config.ensure_dirs().unwrap();
        let store = ManifestStore::new(&config);
        store.init().unwrap();

        write_port(&config, "beta", "1.0", &["nonexistent"]);
        let err = resolve_closure(&config, &store, &["beta".to_string()], None, false).unwrap_err();
        assert!(matches!(err, Error::Dependency(_)));
    }

    #[test]
    fn test_installed_dep_is_not_reloaded() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::for_root(dir.path());
        config.ensure_dirs().unwrap();
        let store = ManifestStore::new(&config);
        store.init().unwrap();
        let installed: crate::manifest::Manifest = serde_json::from_str(
            r#"{"name": "alpha", "version": "1.0", "files": ["/usr/bin/alpha"]}"#,
        )
        .unwrap();
        store.add(&installed, false).unwrap();

        write_port(&config, "beta", "1.0", &["alpha"]);
        let (graph, metafiles) =
            resolve_closure(&config, &store, &["beta".to_string()], None, false).unwrap();
        assert!(!metafiles.contains_key("alpha"));
        // installed alpha is skipped in the order
        let order = graph.order(&["beta".to_string()], true).unwrap();
        assert_eq!(order, vec!["beta"]);
    }

    #[test]
    fn test_install_requires_targets() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::for_root(dir.path());
        let err = install(&config, &[], &InstallOptions::default()).unwrap_err();
        assert!(matches!(err, Error::Usage(_)));
    }
}
