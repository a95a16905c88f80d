// src/commands.rs
//! Command handlers for the newpkg CLI
//!
//! Thin adapters between parsed CLI arguments and the library drivers.
//! Each handler returns the process exit code.

use anyhow::Result;
use newpkg::db::{BackupArchive, list_backups};
use newpkg::{
    Config, DepGraph, DepcleanOptions, InstallOptions, Manifest, ManifestStore, PackageQuery,
    RemoveOptions, RunSummary, UpgradeOptions,
};
use std::path::Path;

/// Print the end-of-run summary the way every driver reports it
fn finish(summary: RunSummary) -> i32 {
    print!("{summary}");
    summary.exit_code()
}

pub fn cmd_install(config: &Config, packages: &[String], options: &InstallOptions) -> Result<i32> {
    let summary = newpkg::install(config, packages, options)?;
    Ok(finish(summary))
}

pub fn cmd_remove(config: &Config, packages: &[String], options: &RemoveOptions) -> Result<i32> {
    let summary = newpkg::remove(config, packages, options)?;
    Ok(finish(summary))
}

pub fn cmd_upgrade(config: &Config, packages: &[String], options: &UpgradeOptions) -> Result<i32> {
    let summary = newpkg::upgrade(config, packages, options)?;
    Ok(finish(summary))
}

pub fn cmd_depclean(config: &Config, options: &DepcleanOptions) -> Result<i32> {
    let summary = newpkg::depclean(config, options)?;
    Ok(finish(summary))
}

// ---------------------------------------------------------------------
// db subcommands
// ---------------------------------------------------------------------

pub fn cmd_db_init(config: &Config) -> Result<i32> {
    ManifestStore::new(config).init()?;
    println!("manifest database ready at {}", config.db_dir.display());
    Ok(0)
}

pub fn cmd_db_add(config: &Config, file: &Path, replace: bool) -> Result<i32> {
    let manifest = Manifest::load(file)?;
    ManifestStore::new(config).add(&manifest, replace)?;
    println!("registered {}", manifest.id());
    Ok(0)
}

pub fn cmd_db_remove(config: &Config, query: &str, force: bool) -> Result<i32> {
    let removed = ManifestStore::new(config).remove(&PackageQuery::parse(query), force)?;
    for id in removed {
        println!("removed {id}");
    }
    Ok(0)
}

pub fn cmd_db_query(config: &Config, query: &str, files: bool, raw: bool) -> Result<i32> {
    let store = ManifestStore::new(config);
    for manifest in store.get_all(&PackageQuery::parse(query))? {
        if raw {
            println!("{}", serde_json::to_string_pretty(&manifest)?);
        } else if files {
            for f in &manifest.files {
                println!("{}", f.path());
            }
        } else {
            println!("name:    {}", manifest.name);
            println!("version: {}", manifest.version);
            println!("stage:   {}", manifest.stage);
            if let Some(origin) = &manifest.origin {
                println!("origin:  {origin}");
            }
            if let Some(date) = &manifest.build_date {
                println!("built:   {}", date.to_rfc3339());
            }
            println!("files:   {}", manifest.files.len());
        }
    }
    Ok(0)
}

pub fn cmd_db_list(
    config: &Config,
    stage: Option<newpkg::Stage>,
    json: bool,
    count: bool,
) -> Result<i32> {
    let entries = ManifestStore::new(config).list(stage)?;
    if count {
        println!("{}", entries.len());
    } else if json {
        println!("{}", serde_json::to_string_pretty(&entries)?);
    } else {
        for entry in entries {
            println!("{}-{}", entry.name, entry.version);
        }
    }
    Ok(0)
}

pub fn cmd_db_revdeps(config: &Config, name: &str) -> Result<i32> {
    for id in ManifestStore::new(config).revdeps(name)? {
        println!("{id}");
    }
    Ok(0)
}

pub fn cmd_db_provides(config: &Config, path: &str) -> Result<i32> {
    let owners = ManifestStore::new(config).provides_path(path)?;
    if owners.is_empty() {
        println!("no package owns {path}");
        return Ok(2);
    }
    for id in owners {
        println!("{id}");
    }
    Ok(0)
}

pub fn cmd_db_backup(config: &Config) -> Result<i32> {
    let archive = ManifestStore::new(config).backup()?;
    println!("{}", archive.display());
    Ok(0)
}

pub fn cmd_db_restore(config: &Config, name: Option<&str>) -> Result<i32> {
    let store = ManifestStore::new(config);
    let archive = match name {
        Some(name) => BackupArchive::locate(config, name)?,
        None => list_backups(config)?
            .into_iter()
            .next()
            .ok_or_else(|| newpkg::Error::NotFound("no database backups".into()))?,
    };
    store.restore(&archive)?;
    println!("restored from {}", archive.path.display());
    Ok(0)
}

pub fn cmd_db_reindex(config: &Config) -> Result<i32> {
    let entries = ManifestStore::new(config).reindex()?;
    println!("indexed {} manifests", entries.len());
    Ok(0)
}

pub fn cmd_db_verify(config: &Config, query: &str) -> Result<i32> {
    let issues = ManifestStore::new(config).verify(&PackageQuery::parse(query))?;
    if issues.is_empty() {
        println!("ok");
        return Ok(0);
    }
    for issue in &issues {
        println!("{issue}");
    }
    Ok(2)
}

pub fn cmd_db_orphans(config: &Config) -> Result<i32> {
    for entry in ManifestStore::new(config).orphans()? {
        println!("{}-{}", entry.name, entry.version);
    }
    Ok(0)
}

pub fn cmd_db_search(config: &Config, term: &str) -> Result<i32> {
    for entry in ManifestStore::new(config).search(term)? {
        match &entry.origin {
            Some(origin) => println!("{}-{} ({origin})", entry.name, entry.version),
            None => println!("{}-{}", entry.name, entry.version),
        }
    }
    Ok(0)
}

pub fn cmd_db_size(config: &Config, query: &str) -> Result<i32> {
    let bytes = ManifestStore::new(config).size(&PackageQuery::parse(query))?;
    println!("{}", human_size(bytes));
    Ok(0)
}

pub fn cmd_graph_sync(config: &Config) -> Result<i32> {
    let store = ManifestStore::new(config);
    let graph = DepGraph::sync(&store, &config.graph_cache_path())?;
    println!("graph cache rebuilt ({} packages)", graph.names().count());
    Ok(0)
}

pub fn cmd_db_rebuild(config: &Config, name: &str) -> Result<i32> {
    let store = ManifestStore::new(config);
    let graph = DepGraph::from_store(&store)?;
    let dependents = graph.rebuild(name)?;
    if dependents.is_empty() {
        println!("nothing depends on {name}");
    } else {
        for pkg in dependents {
            println!("{pkg}");
        }
    }
    Ok(0)
}

pub fn cmd_db_graph(config: &Config, format: &str, out: &Path) -> Result<i32> {
    let store = ManifestStore::new(config);
    let graph = DepGraph::from_store(&store)?;
    let rendered = match format {
        "dot" => graph.to_dot(),
        _ => serde_json::to_string_pretty(&graph)?,
    };
    newpkg::fsutil::write_atomic(out, rendered.as_bytes())?;
    println!("graph exported to {} ({format})", out.display());
    Ok(0)
}

fn human_size(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}
