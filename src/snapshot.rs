// src/snapshot.rs

//! Point-in-time snapshots of installed packages for upgrade rollback
//!
//! A snapshot is a directory `name-version-TIMESTAMP/` holding the package
//! archive (when one can be produced), a copy of the live manifest, a small
//! metadata record, and a checksum line over the archive. The archive is
//! taken from the best available source: the binary package cache, else a
//! tar of the files the manifest lists, else the manifest alone.

use crate::archive;
use crate::config::Config;
use crate::db::ManifestStore;
use crate::error::{Error, Result};
use crate::fsutil::{self, write_atomic};
use crate::hash::sha256_file;
use crate::manifest::Manifest;
use crate::package::{PackageId, PackageQuery, Stage};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tracing::{debug, info, warn};

const ARCHIVE_NAME: &str = "package.tar.zst";
const MANIFEST_NAME: &str = "manifest.json";
const METADATA_NAME: &str = "metadata.json";
const CHECKSUM_NAME: &str = "sha256.sum";

/// Metadata record stored inside each snapshot directory
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotMetadata {
    pub package: String,
    pub version: String,
    pub timestamp: String,
}

/// One snapshot on disk
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub dir: PathBuf,
    pub metadata: SnapshotMetadata,
}

impl Snapshot {
    pub fn open(dir: &Path) -> Result<Self> {
        let text = fs::read_to_string(dir.join(METADATA_NAME))
            .map_err(|e| Error::io(format!("reading snapshot metadata in {}", dir.display()), e))?;
        let metadata: SnapshotMetadata = serde_json::from_str(&text)?;
        Ok(Self {
            dir: dir.to_path_buf(),
            metadata,
        })
    }

    pub fn id(&self) -> PackageId {
        PackageId::new(&self.metadata.package, &self.metadata.version)
    }

    pub fn archive_path(&self) -> Option<PathBuf> {
        let zst = self.dir.join(ARCHIVE_NAME);
        if zst.exists() {
            return Some(zst);
        }
        let plain = self.dir.join("package.tar");
        plain.exists().then_some(plain)
    }

    pub fn manifest(&self) -> Result<Manifest> {
        Manifest::load(&self.dir.join(MANIFEST_NAME))
    }

    /// Check the recorded checksum against the archive
    pub fn verify_archive(&self) -> Result<()> {
        let Some(archive) = self.archive_path() else {
            return Ok(()); // manifest-only snapshot
        };
        let sum_path = self.dir.join(CHECKSUM_NAME);
        let recorded = fs::read_to_string(&sum_path)
            .map_err(|e| Error::io(format!("reading {}", sum_path.display()), e))?;
        let expected = recorded.split_whitespace().next().unwrap_or_default();
        let actual = sha256_file(&archive)?;
        if actual != expected {
            return Err(Error::Malformed(format!(
                "snapshot archive {} fails its checksum",
                archive.display()
            )));
        }
        Ok(())
    }
}

/// Snapshot creation, restore, and pruning
pub struct SnapshotStore {
    config: Config,
}

impl SnapshotStore {
    pub fn new(config: &Config) -> Self {
        Self {
            config: config.clone(),
        }
    }

    /// Capture the currently installed state of one package
    pub fn create(&self, store: &ManifestStore, id: &PackageId) -> Result<Snapshot> {
        let manifest = store.get(&PackageQuery::Exact(id.clone()))?;
        let stamp = fsutil::timestamp();
        let dir = self.config.snapshot_dir.join(format!("{id}-{stamp}"));
        fs::create_dir_all(&dir)
            .map_err(|e| Error::io(format!("creating {}", dir.display()), e))?;

        let archive_dest = dir.join(ARCHIVE_NAME);
        let archived = self.capture_archive(&manifest, id, &archive_dest)?;
        if let Some(path) = &archived {
            let digest = sha256_file(path)?;
            let line = format!(
                "{digest}  {}\n",
                path.file_name().unwrap_or_default().to_string_lossy()
            );
            write_atomic(&dir.join(CHECKSUM_NAME), line.as_bytes())?;
        }

        write_atomic(&dir.join(MANIFEST_NAME), &serde_json::to_vec_pretty(&manifest)?)?;
        let metadata = SnapshotMetadata {
            package: id.name.clone(),
            version: id.version.clone(),
            timestamp: stamp,
        };
        write_atomic(&dir.join(METADATA_NAME), &serde_json::to_vec_pretty(&metadata)?)?;

        info!(
            package = %id,
            snapshot = %dir.display(),
            archived = archived.is_some(),
            "snapshot created"
        );
        Ok(Snapshot { dir, metadata })
    }

    /// Best-available archive source, in preference order
    fn capture_archive(
        &self,
        manifest: &Manifest,
        id: &PackageId,
        dest: &Path,
    ) -> Result<Option<PathBuf>> {
        // (i) an already-built package archive in the binary cache
        if let Some(cached) = self.cached_package(id) {
            fs::copy(&cached, dest)
                .map_err(|e| Error::io(format!("copying {}", cached.display()), e))?;
            debug!(source = %cached.display(), "snapshot archive from package cache");
            return Ok(Some(dest.to_path_buf()));
        }

        // (ii) a tar of the files the manifest lists
        let files: Vec<&str> = manifest.file_paths().collect();
        if !files.is_empty() {
            let root = self.config.root_for(manifest.stage);
            let written = archive::pack_files(root, &files, dest)?;
            debug!(root = %root.display(), "snapshot archive from live files");
            return Ok(Some(written));
        }

        // (iii) manifest copy only
        warn!(package = %id, "no archive source available, manifest-only snapshot");
        Ok(None)
    }

    fn cached_package(&self, id: &PackageId) -> Option<PathBuf> {
        let arch = std::env::consts::ARCH;
        for name in [
            format!("{id}-{arch}.tar.zst"),
            format!("{id}-{arch}.tar"),
        ] {
            let path = self.config.cache_packages_dir.join(name);
            if path.exists() {
                return Some(path);
            }
        }
        None
    }

    /// Extract a snapshot back into its stage root and re-register the
    /// archived manifest
    pub fn restore(&self, store: &ManifestStore, snapshot: &Snapshot, stage: Stage) -> Result<()> {
        snapshot.verify_archive()?;
        let manifest = snapshot.manifest()?;
        let root = self.config.root_for(stage);

        if let Some(archive_path) = snapshot.archive_path() {
            archive::unpack(&archive_path, root)?;
        }
        store.add(&manifest, true)?;
        info!(package = %snapshot.id(), root = %root.display(), "snapshot restored");
        Ok(())
    }

    /// All snapshots, newest first
    pub fn list(&self) -> Result<Vec<Snapshot>> {
        let mut snapshots = Vec::new();
        let rd = match fs::read_dir(&self.config.snapshot_dir) {
            Ok(rd) => rd,
            Err(_) => return Ok(snapshots),
        };
        for entry in rd.filter_map(|e| e.ok()) {
            if !entry.path().is_dir() {
                continue;
            }
            match Snapshot::open(&entry.path()) {
                Ok(snap) => snapshots.push(snap),
                Err(err) => {
                    warn!(dir = %entry.path().display(), error = %err, "unreadable snapshot");
                }
            }
        }
        snapshots.sort_by(|a, b| b.metadata.timestamp.cmp(&a.metadata.timestamp));
        Ok(snapshots)
    }

    /// Newest snapshot of the named package, any version
    pub fn latest_for(&self, name: &str) -> Result<Option<Snapshot>> {
        Ok(self
            .list()?
            .into_iter()
            .find(|s| s.metadata.package == name))
    }

    /// Remove snapshot directories older than `age_days`; returns how many
    /// were pruned
    pub fn prune(&self, age_days: u32) -> Result<usize> {
        let cutoff = SystemTime::now() - Duration::from_secs(u64::from(age_days) * 86_400);
        let mut pruned = 0;
        for snapshot in self.list()? {
            let modified = fs::metadata(&snapshot.dir).and_then(|m| m.modified());
            if matches!(modified, Ok(mtime) if mtime < cutoff) {
                debug!(dir = %snapshot.dir.display(), "pruning expired snapshot");
                fs::remove_dir_all(&snapshot.dir)
                    .map_err(|e| Error::io(format!("removing {}", snapshot.dir.display()), e))?;
                pruned += 1;
            }
        }
        Ok(pruned)
    }
}
