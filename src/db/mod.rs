// src/db/mod.rs

//! Manifest database: one JSON manifest per installed package plus a
//! derived index
//!
//! The manifest directory is authoritative; `index.json` is a performance
//! cache rebuilt from it at any time. All index mutations are
//! write-tmp-then-rename, and every destructive update to a manifest first
//! moves the prior file into the timestamped backup area, so a crash at any
//! point leaves the store recoverable with `reindex`.

mod backup;

pub use backup::{BackupArchive, list_backups};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::fsutil::{self, write_atomic};
use crate::hash::sha256_file;
use crate::hooks::run_hooks;
use crate::manifest::{IndexEntry, Manifest};
use crate::package::{PackageId, PackageQuery, Stage, compare_versions, dep_name};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::PathBuf;
use tracing::{debug, info, warn};

/// Name of the derived index file inside the db directory
pub const INDEX_FILE: &str = "index.json";

/// One problem found by `verify`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerifyIssue {
    Missing { package: String, path: String },
    HashMismatch { package: String, path: String },
}

impl std::fmt::Display for VerifyIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VerifyIssue::Missing { package, path } => {
                write!(f, "{package}: missing {path}")
            }
            VerifyIssue::HashMismatch { package, path } => {
                write!(f, "{package}: checksum mismatch {path}")
            }
        }
    }
}

/// The manifest database
pub struct ManifestStore {
    config: Config,
}

impl ManifestStore {
    pub fn new(config: &Config) -> Self {
        Self {
            config: config.clone(),
        }
    }

    /// Ensure the db directories exist and the index is present
    pub fn init(&self) -> Result<()> {
        fs::create_dir_all(&self.config.db_dir)
            .map_err(|e| Error::io(format!("creating {}", self.config.db_dir.display()), e))?;
        fs::create_dir_all(&self.config.db_backup_dir).map_err(|e| {
            Error::io(format!("creating {}", self.config.db_backup_dir.display()), e)
        })?;
        let index = self.index_path();
        if !index.exists() {
            write_atomic(&index, b"[]")?;
        }
        Ok(())
    }

    pub fn index_path(&self) -> PathBuf {
        self.config.db_dir.join(INDEX_FILE)
    }

    pub fn manifest_path(&self, id: &PackageId) -> PathBuf {
        self.config.db_dir.join(id.manifest_filename())
    }

    // ------------------------------------------------------------------
    // Index handling
    // ------------------------------------------------------------------

    /// Load the index, rebuilding it from the manifest directory when it is
    /// missing or unreadable. The manifests always win a disagreement.
    pub fn load_index(&self) -> Result<Vec<IndexEntry>> {
        let path = self.index_path();
        match fs::read_to_string(&path) {
            Ok(text) => match serde_json::from_str(&text) {
                Ok(entries) => Ok(entries),
                Err(err) => {
                    warn!(error = %err, "index unreadable, rebuilding from manifests");
                    self.reindex()
                }
            },
            Err(_) => self.reindex(),
        }
    }

    fn write_index(&self, entries: &[IndexEntry]) -> Result<()> {
        let json = serde_json::to_vec_pretty(entries)?;
        write_atomic(&self.index_path(), &json)
    }

    /// Rebuild the index from the manifest files and return it
    pub fn reindex(&self) -> Result<Vec<IndexEntry>> {
        let mut entries = Vec::new();
        for manifest in self.all_manifests()? {
            entries.push(IndexEntry::from_manifest(&manifest));
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.version.cmp(&b.version)));
        self.write_index(&entries)?;
        debug!(count = entries.len(), "index rebuilt");
        Ok(entries)
    }

    /// Parse every manifest in the db directory
    pub fn all_manifests(&self) -> Result<Vec<Manifest>> {
        let mut manifests = Vec::new();
        let rd = fs::read_dir(&self.config.db_dir)
            .map_err(|e| Error::io(format!("reading {}", self.config.db_dir.display()), e))?;
        for entry in rd.filter_map(|e| e.ok()) {
            let path = entry.path();
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name == INDEX_FILE || !name.ends_with(".json") {
                continue;
            }
            manifests.push(Manifest::load(&path)?);
        }
        Ok(manifests)
    }

    // ------------------------------------------------------------------
    // Mutation
    // ------------------------------------------------------------------

    /// Register a manifest
    ///
    /// Fails with `AlreadyExists` when the identity is present and `replace`
    /// is false, or when a listed file is owned by a different package that
    /// the new manifest does not declare in `replaces`.
    pub fn add(&self, manifest: &Manifest, replace: bool) -> Result<()> {
        manifest.validate()?;
        let id = manifest.id();
        let dest = self.manifest_path(&id);

        self.check_file_ownership(manifest)?;

        if dest.exists() {
            if !replace {
                return Err(Error::AlreadyExists(format!(
                    "manifest {id} is already registered"
                )));
            }
            self.backup_manifest_file(&id)?;
        }

        let json = serde_json::to_vec_pretty(manifest)?;
        write_atomic(&dest, &json)?;

        let mut entries = self.load_index()?;
        entries.retain(|e| !(e.name == manifest.name && e.version == manifest.version));
        entries.push(IndexEntry::from_manifest(manifest));
        entries.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.version.cmp(&b.version)));
        self.write_index(&entries)?;

        info!(event = "db_add", package = %id, "manifest registered");
        run_hooks(&self.config.hooks_dir, "post-db-add", &[&id.to_string()]);
        Ok(())
    }

    /// Remove manifests matching a query, moving them to the backup area
    ///
    /// A bare-name query matching several versions requires `force`.
    /// Returns the identities removed.
    pub fn remove(&self, query: &PackageQuery, force: bool) -> Result<Vec<PackageId>> {
        let matches = self.resolve(query)?;
        if matches.len() > 1 && !force {
            return Err(Error::Ambiguous {
                query: query.to_string(),
                matches: matches.iter().map(|e| e.id().to_string()).collect(),
            });
        }

        let mut removed = Vec::new();
        for entry in &matches {
            let id = entry.id();
            self.backup_manifest_file(&id)?;
            removed.push(id);
        }

        let mut entries = self.load_index()?;
        entries.retain(|e| !removed.iter().any(|id| id.name == e.name && id.version == e.version));
        self.write_index(&entries)?;

        for id in &removed {
            info!(event = "db_remove", package = %id, "manifest removed");
            run_hooks(&self.config.hooks_dir, "post-db-remove", &[&id.to_string()]);
        }
        Ok(removed)
    }

    /// Move the manifest file for `id` into the backup area under a
    /// timestamp prefix
    fn backup_manifest_file(&self, id: &PackageId) -> Result<()> {
        let src = self.manifest_path(id);
        if !src.exists() {
            return Err(Error::NotFound(format!("manifest file for {id}")));
        }
        fs::create_dir_all(&self.config.db_backup_dir).map_err(|e| {
            Error::io(format!("creating {}", self.config.db_backup_dir.display()), e)
        })?;
        let dest = self
            .config
            .db_backup_dir
            .join(format!("{}-{}", fsutil::timestamp(), id.manifest_filename()));
        fsutil::move_file(&src, &dest)
            .map_err(|e| Error::io(format!("backing up {}", src.display()), e))?;
        Ok(())
    }

    /// Enforce file-ownership uniqueness across manifests
    fn check_file_ownership(&self, manifest: &Manifest) -> Result<()> {
        let new_paths: BTreeSet<&str> = manifest.file_paths().collect();
        if new_paths.is_empty() {
            return Ok(());
        }
        for other in self.all_manifests()? {
            if other.name == manifest.name {
                continue;
            }
            if manifest.replaces.iter().any(|r| *r == other.name) {
                continue;
            }
            if let Some(taken) = other.file_paths().find(|p| new_paths.contains(p)) {
                return Err(Error::AlreadyExists(format!(
                    "file {} is owned by {} (add it to 'replaces' to take over)",
                    taken,
                    other.id()
                )));
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    /// Resolve a query to index entries: exact `name-version` first, then a
    /// filter on the whole string as a name (for packages whose name itself
    /// looks like an identity)
    pub fn resolve(&self, query: &PackageQuery) -> Result<Vec<IndexEntry>> {
        let entries = self.load_index()?;
        let matches: Vec<IndexEntry> = match query {
            PackageQuery::Exact(id) => {
                let exact: Vec<IndexEntry> = entries
                    .iter()
                    .filter(|e| e.name == id.name && e.version == id.version)
                    .cloned()
                    .collect();
                if exact.is_empty() {
                    let full = query.to_string();
                    entries.into_iter().filter(|e| e.name == full).collect()
                } else {
                    exact
                }
            }
            PackageQuery::Name(name) => {
                entries.into_iter().filter(|e| &e.name == name).collect()
            }
        };
        if matches.is_empty() {
            return Err(Error::NotFound(format!("no installed package matches '{query}'")));
        }
        Ok(matches)
    }

    /// Resolve a query to exactly one manifest
    pub fn get(&self, query: &PackageQuery) -> Result<Manifest> {
        let matches = self.resolve(query)?;
        if matches.len() > 1 {
            return Err(Error::Ambiguous {
                query: query.to_string(),
                matches: matches.iter().map(|e| e.id().to_string()).collect(),
            });
        }
        Manifest::load(&self.manifest_path(&matches[0].id()))
    }

    /// Load every manifest matching the query
    pub fn get_all(&self, query: &PackageQuery) -> Result<Vec<Manifest>> {
        self.resolve(query)?
            .iter()
            .map(|e| Manifest::load(&self.manifest_path(&e.id())))
            .collect()
    }

    /// Whether any version of `name` is installed, directly or via provides
    pub fn satisfies(&self, dep_token: &str) -> Result<bool> {
        let name = dep_name(dep_token);
        Ok(self.load_index()?.iter().any(|e| {
            e.name == name || e.provides.iter().any(|p| p == name)
        }))
    }

    /// List index entries, optionally filtered by stage
    pub fn list(&self, stage: Option<Stage>) -> Result<Vec<IndexEntry>> {
        let mut entries = self.load_index()?;
        if let Some(s) = stage {
            entries.retain(|e| e.stage == s);
        }
        Ok(entries)
    }

    /// Every installed `name-version` that depends on `name` (by stripped
    /// dependency token) or lists it in `provides`
    pub fn revdeps(&self, name: &str) -> Result<Vec<String>> {
        let entries = self.load_index()?;
        let mut out = Vec::new();
        for entry in &entries {
            if entry.name == name {
                continue;
            }
            let depends_on_it = entry.depends.all().any(|t| dep_name(t) == name);
            let provides_it = entry.provides.iter().any(|p| p == name);
            if depends_on_it || provides_it {
                out.push(entry.id().to_string());
            }
        }
        out.sort();
        Ok(out)
    }

    /// Every installed `name-version` that owns `path` (linear manifest scan)
    pub fn provides_path(&self, path: &str) -> Result<Vec<String>> {
        let mut out = Vec::new();
        for manifest in self.all_manifests()? {
            if manifest.file_paths().any(|p| p == path) {
                out.push(manifest.id().to_string());
            }
        }
        out.sort();
        Ok(out)
    }

    /// Installed packages with no reverse-dependents, deduplicated to the
    /// highest version per name
    pub fn orphans(&self) -> Result<Vec<IndexEntry>> {
        let entries = self.load_index()?;
        let mut best: BTreeMap<String, IndexEntry> = BTreeMap::new();
        for entry in entries {
            if !self.revdeps(&entry.name)?.is_empty() {
                continue;
            }
            match best.get(&entry.name) {
                Some(prev)
                    if compare_versions(&prev.version, &entry.version)
                        != std::cmp::Ordering::Less => {}
                _ => {
                    best.insert(entry.name.clone(), entry);
                }
            }
        }
        Ok(best.into_values().collect())
    }

    /// Substring search over name, description, and origin
    pub fn search(&self, term: &str) -> Result<Vec<IndexEntry>> {
        let term = term.to_lowercase();
        let mut out = Vec::new();
        for entry in self.load_index()? {
            let name_hit = entry.name.to_lowercase().contains(&term);
            let origin_hit = entry
                .origin
                .as_deref()
                .is_some_and(|o| o.to_lowercase().contains(&term));
            let description_hit = if name_hit || origin_hit {
                false
            } else {
                Manifest::load(&self.manifest_path(&entry.id()))
                    .ok()
                    .and_then(|m| m.description)
                    .is_some_and(|d| d.to_lowercase().contains(&term))
            };
            if name_hit || origin_hit || description_hit {
                out.push(entry);
            }
        }
        Ok(out)
    }

    /// Check listed files exist on disk and, where the manifest carries a
    /// sha256, that it still matches
    pub fn verify(&self, query: &PackageQuery) -> Result<Vec<VerifyIssue>> {
        let mut issues = Vec::new();
        for manifest in self.get_all(query)? {
            let root = self.config.root_for(manifest.stage);
            let id = manifest.id().to_string();
            for file in &manifest.files {
                let on_disk = fsutil::rooted(root, file.path());
                if !on_disk.exists() {
                    issues.push(VerifyIssue::Missing {
                        package: id.clone(),
                        path: file.path().to_string(),
                    });
                    continue;
                }
                if let Some(expected) = file.sha256()
                    && on_disk.is_file()
                {
                    let actual = sha256_file(&on_disk)?;
                    if actual != expected {
                        issues.push(VerifyIssue::HashMismatch {
                            package: id.clone(),
                            path: file.path().to_string(),
                        });
                    }
                }
            }
        }
        Ok(issues)
    }

    /// Sum of on-disk sizes of the files owned by matching packages,
    /// falling back to recorded sizes for files that are gone
    pub fn size(&self, query: &PackageQuery) -> Result<u64> {
        let mut total = 0u64;
        for manifest in self.get_all(query)? {
            let root = self.config.root_for(manifest.stage);
            for file in &manifest.files {
                let on_disk = fsutil::rooted(root, file.path());
                match fs::metadata(&on_disk) {
                    Ok(meta) if meta.is_file() => total += meta.len(),
                    _ => total += file.size().unwrap_or(0),
                }
            }
        }
        Ok(total)
    }

    // ------------------------------------------------------------------
    // Backup / restore
    // ------------------------------------------------------------------

    /// Archive the manifest directory into the backup area and rotate old
    /// archives
    pub fn backup(&self) -> Result<PathBuf> {
        backup::create_archive(&self.config)
    }

    /// Replace the manifest directory with the contents of an archive
    ///
    /// The prior directory is kept as `.old.TIMESTAMP` until the swap and
    /// reindex succeed.
    pub fn restore(&self, archive: &BackupArchive) -> Result<()> {
        backup::restore_archive(&self.config, archive)?;
        self.reindex()?;
        Ok(())
    }
}
