// src/config.rs

//! Runtime configuration
//!
//! One `Config` value carries every path and knob the drivers need. It is
//! built from defaults, optionally overlaid with `/etc/newpkg/newpkg.yaml`,
//! then with `NEWPKG_*` environment variables, and passed explicitly to each
//! store and driver. Nothing in the crate reads configuration globally.

use crate::error::{Error, Result};
use serde::Deserialize;
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Default site configuration file
pub const SITE_CONFIG: &str = "/etc/newpkg/newpkg.yaml";

/// Full configuration surface for one driver run
#[derive(Debug, Clone)]
pub struct Config {
    /// Manifest database directory
    pub db_dir: PathBuf,
    /// Backup area for replaced/removed manifests and db archives
    pub db_backup_dir: PathBuf,
    /// Per-run and per-package log files
    pub log_dir: PathBuf,
    /// Root of the hook directories (one subdirectory per hook name)
    pub hooks_dir: PathBuf,
    /// Snapshot directories for upgrade rollback
    pub snapshot_dir: PathBuf,
    /// Checkpoints, driver state, lock file, graph cache
    pub state_dir: PathBuf,
    /// Downloaded source archives
    pub cache_sources_dir: PathBuf,
    /// Built package archives
    pub cache_packages_dir: PathBuf,
    /// Ports tree of metafiles
    pub ports_dir: PathBuf,
    /// Staging root for pass1/pass2 packages
    pub lfs_root: PathBuf,
    /// Deploy root for normal-stage packages
    pub install_root: PathBuf,

    /// Concurrent source downloads
    pub parallel: u32,
    /// Retry count for downloads and build commands
    pub retry: u32,
    /// Snapshot retention in days
    pub keep_snapshots_days: u32,
    /// How many rotated db backup archives to keep
    pub db_backup_keep: u32,
    /// Commit the ports tree after upgrade/depclean runs
    pub auto_commit: bool,
    /// Remove work directories after successful builds
    pub clean_after_build: bool,
    /// File listing packages that must not be removed without --force
    pub protected_set_path: PathBuf,
}

/// Serde shape of the optional site configuration file; every field is
/// optional and overlays the defaults
#[derive(Debug, Deserialize, Default)]
struct SiteConfig {
    db_dir: Option<PathBuf>,
    db_backup_dir: Option<PathBuf>,
    log_dir: Option<PathBuf>,
    hooks_dir: Option<PathBuf>,
    snapshot_dir: Option<PathBuf>,
    state_dir: Option<PathBuf>,
    cache_sources_dir: Option<PathBuf>,
    cache_packages_dir: Option<PathBuf>,
    ports_dir: Option<PathBuf>,
    lfs_root: Option<PathBuf>,
    install_root: Option<PathBuf>,
    parallel: Option<u32>,
    retry: Option<u32>,
    keep_snapshots_days: Option<u32>,
    db_backup_keep: Option<u32>,
    auto_commit: Option<bool>,
    clean_after_build: Option<bool>,
    protected_set_path: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        let jobs = std::thread::available_parallelism()
            .map(|p| p.get() as u32)
            .unwrap_or(4);
        Self {
            db_dir: PathBuf::from("/var/lib/newpkg/db"),
            db_backup_dir: PathBuf::from("/var/lib/newpkg/backup"),
            log_dir: PathBuf::from("/var/log/newpkg"),
            hooks_dir: PathBuf::from("/etc/newpkg/hooks"),
            snapshot_dir: PathBuf::from("/var/lib/newpkg/snapshots"),
            state_dir: PathBuf::from("/var/lib/newpkg/state"),
            cache_sources_dir: PathBuf::from("/var/cache/newpkg/sources"),
            cache_packages_dir: PathBuf::from("/var/cache/newpkg/packages"),
            ports_dir: PathBuf::from("/usr/ports"),
            lfs_root: PathBuf::from("/mnt/lfs"),
            install_root: PathBuf::from("/"),
            parallel: jobs.min(4),
            retry: 3,
            keep_snapshots_days: 30,
            db_backup_keep: 10,
            auto_commit: false,
            clean_after_build: true,
            protected_set_path: PathBuf::from("/etc/newpkg/protected"),
        }
    }
}

impl Config {
    /// Load configuration: defaults, site file (if present), environment
    pub fn load() -> Result<Self> {
        let mut config = Config::default();
        let site_path = Path::new(SITE_CONFIG);
        if site_path.is_file() {
            config.apply_site(site_path)?;
        }
        config.apply_env();
        Ok(config)
    }

    /// Overlay a site configuration file
    pub fn apply_site(&mut self, path: &Path) -> Result<()> {
        let text = fs::read_to_string(path)
            .map_err(|e| Error::io(format!("reading config {}", path.display()), e))?;
        let site: SiteConfig = serde_yaml::from_str(&text)?;
        debug!(config = %path.display(), "applying site configuration");

        macro_rules! overlay {
            ($($field:ident),* $(,)?) => {
                $(if let Some(v) = site.$field { self.$field = v; })*
            };
        }
        overlay!(
            db_dir,
            db_backup_dir,
            log_dir,
            hooks_dir,
            snapshot_dir,
            state_dir,
            cache_sources_dir,
            cache_packages_dir,
            ports_dir,
            lfs_root,
            install_root,
            parallel,
            retry,
            keep_snapshots_days,
            db_backup_keep,
            auto_commit,
            clean_after_build,
            protected_set_path,
        );
        Ok(())
    }

    /// Overlay `NEWPKG_*` environment variables
    pub fn apply_env(&mut self) {
        let path = |name: &str, field: &mut PathBuf| {
            if let Ok(v) = std::env::var(name)
                && !v.is_empty()
            {
                *field = PathBuf::from(v);
            }
        };
        path("NEWPKG_DB_DIR", &mut self.db_dir);
        path("NEWPKG_DB_BACKUP_DIR", &mut self.db_backup_dir);
        path("NEWPKG_LOG_DIR", &mut self.log_dir);
        path("NEWPKG_HOOKS_DIR", &mut self.hooks_dir);
        path("NEWPKG_SNAPSHOT_DIR", &mut self.snapshot_dir);
        path("NEWPKG_STATE_DIR", &mut self.state_dir);
        path("NEWPKG_CACHE_SOURCES_DIR", &mut self.cache_sources_dir);
        path("NEWPKG_CACHE_PACKAGES_DIR", &mut self.cache_packages_dir);
        path("NEWPKG_PORTS_DIR", &mut self.ports_dir);
        path("NEWPKG_LFS_ROOT", &mut self.lfs_root);
        path("NEWPKG_INSTALL_ROOT", &mut self.install_root);
        path("NEWPKG_PROTECTED_SET", &mut self.protected_set_path);

        if let Ok(v) = std::env::var("NEWPKG_PARALLEL")
            && let Ok(n) = v.parse()
        {
            self.parallel = n;
        }
        if let Ok(v) = std::env::var("NEWPKG_RETRY")
            && let Ok(n) = v.parse()
        {
            self.retry = n;
        }
    }

    /// Rebase every newpkg-owned path under one directory
    ///
    /// Used by tests and by `--root` to run a fully self-contained
    /// installation. The ports tree and deploy roots move too.
    pub fn for_root(root: &Path) -> Self {
        let defaults = Config::default();
        Self {
            db_dir: root.join("var/lib/newpkg/db"),
            db_backup_dir: root.join("var/lib/newpkg/backup"),
            log_dir: root.join("var/log/newpkg"),
            hooks_dir: root.join("etc/newpkg/hooks"),
            snapshot_dir: root.join("var/lib/newpkg/snapshots"),
            state_dir: root.join("var/lib/newpkg/state"),
            cache_sources_dir: root.join("var/cache/newpkg/sources"),
            cache_packages_dir: root.join("var/cache/newpkg/packages"),
            ports_dir: root.join("usr/ports"),
            lfs_root: root.join("mnt/lfs"),
            install_root: root.to_path_buf(),
            protected_set_path: root.join("etc/newpkg/protected"),
            ..defaults
        }
    }

    /// Create every directory newpkg writes into
    pub fn ensure_dirs(&self) -> Result<()> {
        for dir in [
            &self.db_dir,
            &self.db_backup_dir,
            &self.log_dir,
            &self.snapshot_dir,
            &self.state_dir,
            &self.cache_sources_dir,
            &self.cache_packages_dir,
        ] {
            fs::create_dir_all(dir)
                .map_err(|e| Error::io(format!("creating {}", dir.display()), e))?;
        }
        Ok(())
    }

    /// The deploy root for a given bootstrap stage
    pub fn root_for(&self, stage: crate::package::Stage) -> &Path {
        if stage.is_bootstrap() {
            &self.lfs_root
        } else {
            &self.install_root
        }
    }

    /// Load the protected package set (one name per line, `#` comments)
    pub fn protected_set(&self) -> BTreeSet<String> {
        let Ok(text) = fs::read_to_string(&self.protected_set_path) else {
            return BTreeSet::new();
        };
        text.lines()
            .map(str::trim)
            .filter(|l| !l.is_empty() && !l.starts_with('#'))
            .map(str::to_string)
            .collect()
    }

    /// Path of the process-wide store lock file
    pub fn lock_path(&self) -> PathBuf {
        self.state_dir.join("newpkg.lock")
    }

    /// Path of the persisted dependency graph cache
    pub fn graph_cache_path(&self) -> PathBuf {
        self.state_dir.join("depgraph.json")
    }
}
