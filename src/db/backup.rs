// src/db/backup.rs

//! Whole-database backup archives and restore
//!
//! A backup is a gzip-compressed tar of the manifest directory, named
//! `db-TIMESTAMP.tar.gz` in the backup area. Restore extracts next to the
//! live directory and swaps via rename, keeping the prior directory as
//! `.old.TIMESTAMP` until the swap has succeeded.

use crate::config::Config;
use crate::error::{Error, Result};
use crate::fsutil;
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

const BACKUP_PREFIX: &str = "db-";
const BACKUP_SUFFIX: &str = ".tar.gz";

/// A rotated database backup archive on disk
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct BackupArchive {
    pub path: PathBuf,
}

impl BackupArchive {
    /// Interpret a user-supplied path or bare filename relative to the
    /// backup area
    pub fn locate(config: &Config, name: &str) -> Result<Self> {
        let direct = PathBuf::from(name);
        if direct.is_file() {
            return Ok(Self { path: direct });
        }
        let in_backups = config.db_backup_dir.join(name);
        if in_backups.is_file() {
            return Ok(Self { path: in_backups });
        }
        Err(Error::NotFound(format!("backup archive '{name}'")))
    }
}

/// List database backup archives, newest first
pub fn list_backups(config: &Config) -> Result<Vec<BackupArchive>> {
    let mut archives = Vec::new();
    let rd = match fs::read_dir(&config.db_backup_dir) {
        Ok(rd) => rd,
        Err(_) => return Ok(archives),
    };
    for entry in rd.filter_map(|e| e.ok()) {
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if name.starts_with(BACKUP_PREFIX) && name.ends_with(BACKUP_SUFFIX) {
            archives.push(BackupArchive { path: entry.path() });
        }
    }
    archives.sort();
    archives.reverse();
    Ok(archives)
}

/// Archive the manifest directory and rotate old archives
pub fn create_archive(config: &Config) -> Result<PathBuf> {
    fs::create_dir_all(&config.db_backup_dir)
        .map_err(|e| Error::io(format!("creating {}", config.db_backup_dir.display()), e))?;

    let dest = config
        .db_backup_dir
        .join(format!("{BACKUP_PREFIX}{}{BACKUP_SUFFIX}", fsutil::timestamp()));

    let file = File::create(&dest)
        .map_err(|e| Error::io(format!("creating {}", dest.display()), e))?;
    let encoder = GzEncoder::new(file, Compression::default());
    let mut builder = tar::Builder::new(encoder);
    builder
        .append_dir_all(".", &config.db_dir)
        .map_err(|e| Error::io(format!("archiving {}", config.db_dir.display()), e))?;
    builder
        .into_inner()
        .and_then(|enc| enc.finish())
        .map_err(|e| Error::io(format!("finishing {}", dest.display()), e))?;

    rotate(config)?;
    info!(archive = %dest.display(), "database backup written");
    Ok(dest)
}

/// Keep only the `db_backup_keep` most recent archives
fn rotate(config: &Config) -> Result<()> {
    let archives = list_backups(config)?;
    for stale in archives.iter().skip(config.db_backup_keep as usize) {
        if let Err(err) = fs::remove_file(&stale.path) {
            warn!(archive = %stale.path.display(), error = %err, "could not rotate backup");
        }
    }
    Ok(())
}

/// Swap the live manifest directory with the contents of an archive
pub fn restore_archive(config: &Config, archive: &BackupArchive) -> Result<()> {
    let db_dir = &config.db_dir;
    let parent = db_dir
        .parent()
        .ok_or_else(|| Error::Io(format!("{} has no parent", db_dir.display())))?;
    let stamp = fsutil::timestamp();
    let incoming = parent.join(format!("db.new.{stamp}"));
    let old = parent.join(format!("db.old.{stamp}"));

    extract(&archive.path, &incoming)?;

    // swap: live -> .old, incoming -> live; undo on failure
    fs::rename(db_dir, &old)
        .map_err(|e| Error::io(format!("moving {} aside", db_dir.display()), e))?;
    if let Err(err) = fs::rename(&incoming, db_dir) {
        // put the original back before reporting
        let _ = fs::rename(&old, db_dir);
        let _ = fs::remove_dir_all(&incoming);
        return Err(Error::io("activating restored database", err));
    }

    fs::remove_dir_all(&old)
        .map_err(|e| Error::io(format!("removing {}", old.display()), e))?;
    info!(archive = %archive.path.display(), "database restored");
    Ok(())
}

fn extract(archive: &Path, dest: &Path) -> Result<()> {
    fs::create_dir_all(dest)
        .map_err(|e| Error::io(format!("creating {}", dest.display()), e))?;
    let file = File::open(archive)
        .map_err(|e| Error::io(format!("opening {}", archive.display()), e))?;
    let mut tar = tar::Archive::new(GzDecoder::new(file));
    tar.unpack(dest)
        .map_err(|e| Error::io(format!("extracting {}", archive.display()), e))
}
