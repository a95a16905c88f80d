// src/pipeline/mod.rs

//! The per-package build pipeline
//!
//! Eight checkpointed stages take a metafile from source URLs to a
//! registered manifest:
//!
//! ```text
//! downloaded -> extracted -> patched -> built -> installed_destdir
//!     -> packaged -> deployed -> registered
//! ```
//!
//! Every transition is idempotent and guarded by the package checkpoint;
//! a re-run with `resume` picks up at the first incomplete stage. Recipe
//! commands run through `sh -c` with `@DESTDIR@` and `@MAKEJOBS@`
//! interpolated, and their output is appended to a per-package build log.

mod checkpoint;

pub use checkpoint::{BuildStage, Checkpoint};

use crate::archive;
use crate::chroot::interrupted;
use crate::config::Config;
use crate::db::ManifestStore;
use crate::error::{Error, Result};
use crate::fetch::Fetcher;
use crate::hash::sha256_file;
use crate::hooks::run_hooks;
use crate::manifest::{Manifest, ManifestFile};
use crate::metafile::{Metafile, interpolate};
use crate::package::PackageId;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// Options controlling one pipeline run
#[derive(Debug, Clone, Copy, Default)]
pub struct RunOptions {
    /// Start from the first incomplete stage instead of from scratch
    pub resume: bool,
    /// Re-download sources even when cached
    pub force_fetch: bool,
}

/// Drives one package through the pipeline
pub struct StageRunner<'a> {
    config: &'a Config,
    store: &'a ManifestStore,
    meta: &'a Metafile,
    metafile_path: PathBuf,
    id: PackageId,
    work_dir: PathBuf,
    src_dir: PathBuf,
    dest_dir: PathBuf,
    build_log: PathBuf,
}

impl<'a> StageRunner<'a> {
    pub fn new(
        config: &'a Config,
        store: &'a ManifestStore,
        meta: &'a Metafile,
        metafile_path: &Path,
    ) -> Self {
        let id = meta.id();
        let work_dir = config.state_dir.join("work").join(id.to_string());
        Self {
            config,
            store,
            meta,
            metafile_path: metafile_path.to_path_buf(),
            src_dir: work_dir.join("src"),
            dest_dir: work_dir.join("destdir"),
            build_log: config.log_dir.join(format!("{id}.build.log")),
            id,
            work_dir,
        }
    }

    pub fn id(&self) -> &PackageId {
        &self.id
    }

    /// Path of the package archive this pipeline produces
    pub fn package_archive(&self) -> PathBuf {
        self.config
            .cache_packages_dir
            .join(format!("{}-{}.tar.zst", self.id, std::env::consts::ARCH))
    }

    /// Run the pipeline to completion
    ///
    /// On failure the checkpoint stays at the last successful stage and the
    /// work directory is preserved for inspection. On success the
    /// checkpoint is cleared and the work directory removed (unless
    /// configured otherwise).
    pub fn run(&self, options: RunOptions) -> Result<()> {
        let mut checkpoint = Checkpoint::load(&self.config.state_dir, &self.id)?;
        if !options.resume {
            checkpoint.clear()?;
        }

        let hook_args = [self.id.to_string(), self.metafile_path.display().to_string()];
        let hook_args: Vec<&str> = hook_args.iter().map(String::as_str).collect();
        run_hooks(&self.config.hooks_dir, "pre-init", &hook_args);

        for stage in BuildStage::ALL {
            if checkpoint.is_done(stage) {
                debug!(package = %self.id, %stage, "stage already complete, skipping");
                continue;
            }
            if interrupted() {
                return Err(Error::StateConflict(format!(
                    "interrupted before stage {stage} of {}",
                    self.id
                )));
            }
            info!(package = %self.id, %stage, "running stage");
            self.execute(stage, options).map_err(|err| {
                warn!(package = %self.id, %stage, error = %err, "stage failed");
                err
            })?;
            checkpoint.mark(stage)?;
            run_hooks(&self.config.hooks_dir, stage.post_hook(), &hook_args);
        }

        checkpoint.clear()?;
        if self.config.clean_after_build {
            run_hooks(&self.config.hooks_dir, "pre-cleanup", &hook_args);
            if self.work_dir.exists() {
                fs::remove_dir_all(&self.work_dir)
                    .map_err(|e| Error::io(format!("removing {}", self.work_dir.display()), e))?;
            }
            run_hooks(&self.config.hooks_dir, "post-cleanup", &hook_args);
        }
        info!(package = %self.id, "pipeline complete");
        Ok(())
    }

    fn execute(&self, stage: BuildStage, options: RunOptions) -> Result<()> {
        match stage {
            BuildStage::Downloaded => self.download(options.force_fetch),
            BuildStage::Extracted => self.extract(),
            BuildStage::Patched => self.patch(),
            BuildStage::Built => self.build(),
            BuildStage::InstalledDestdir => self.install_destdir(),
            BuildStage::Packaged => self.package(),
            BuildStage::Deployed => self.deploy(),
            BuildStage::Registered => self.register(),
        }
    }

    // ------------------------------------------------------------------
    // Stages
    // ------------------------------------------------------------------

    fn download(&self, force: bool) -> Result<()> {
        Fetcher::new(self.config, force).fetch(&self.id, &self.meta.sources)?;
        Ok(())
    }

    fn extract(&self) -> Result<()> {
        fs::create_dir_all(&self.src_dir)
            .map_err(|e| Error::io(format!("creating {}", self.src_dir.display()), e))?;
        let fetcher = Fetcher::new(self.config, false);
        for source in &self.meta.sources {
            let cached = fetcher.cache_path(source);
            if !cached.exists() {
                return Err(Error::NotFound(format!(
                    "cached source {} (run the download stage first)",
                    cached.display()
                )));
            }
            archive::unpack(&cached, &self.src_dir)?;
        }
        Ok(())
    }

    /// The directory build commands run in: the single top-level directory
    /// most tarballs extract to, or the extraction root itself, with the
    /// metafile's `build_dir` appended when set
    fn source_root(&self) -> Result<PathBuf> {
        let mut root = self.src_dir.clone();
        let entries: Vec<_> = fs::read_dir(&self.src_dir)
            .map_err(|e| Error::io(format!("reading {}", self.src_dir.display()), e))?
            .filter_map(|e| e.ok())
            .collect();
        if entries.len() == 1 && entries[0].path().is_dir() {
            root = entries[0].path();
        }
        if let Some(sub) = &self.meta.build_dir {
            root = root.join(sub);
        }
        Ok(root)
    }

    fn patch(&self) -> Result<()> {
        if self.meta.patches.is_empty() {
            return Ok(());
        }
        let source_root = self.source_root()?;
        let patch_base = self
            .metafile_path
            .parent()
            .unwrap_or(Path::new("."))
            .to_path_buf();

        for patch in &self.meta.patches {
            let patch_path = patch_base.join(patch);
            if !patch_path.is_file() {
                return Err(Error::NotFound(format!("patch {}", patch_path.display())));
            }
            info!(package = %self.id, patch = %patch, "applying patch");
            let output = Command::new("patch")
                .args(["-p1", "-i"])
                .arg(&patch_path)
                .current_dir(&source_root)
                .output()
                .map_err(|e| Error::io("running patch", e))?;
            self.append_log(&format!("=== patch {patch} ==="), &output.stdout, &output.stderr)?;
            if !output.status.success() {
                return Err(Error::Build {
                    package: self.id.to_string(),
                    stage: BuildStage::Patched.as_str().to_string(),
                    reason: format!(
                        "patch {patch} failed: {}",
                        String::from_utf8_lossy(&output.stderr)
                    ),
                });
            }
        }
        Ok(())
    }

    fn build(&self) -> Result<()> {
        let source_root = self.source_root()?;
        for command in self.meta.build_commands() {
            self.run_command(BuildStage::Built, &command, &source_root, false)?;
        }
        Ok(())
    }

    fn install_destdir(&self) -> Result<()> {
        fs::create_dir_all(&self.dest_dir)
            .map_err(|e| Error::io(format!("creating {}", self.dest_dir.display()), e))?;
        let source_root = self.source_root()?;
        for command in self.meta.install_commands() {
            self.run_command(BuildStage::InstalledDestdir, &command, &source_root, true)?;
        }
        if dir_is_empty(&self.dest_dir)? {
            return Err(Error::Build {
                package: self.id.to_string(),
                stage: BuildStage::InstalledDestdir.as_str().to_string(),
                reason: "nothing was installed into the staging directory".to_string(),
            });
        }
        Ok(())
    }

    fn package(&self) -> Result<()> {
        fs::create_dir_all(&self.config.cache_packages_dir).map_err(|e| {
            Error::io(format!("creating {}", self.config.cache_packages_dir.display()), e)
        })?;
        let written = archive::pack_dir(&self.dest_dir, &self.package_archive())?;
        info!(package = %self.id, archive = %written.display(), "package archived");
        Ok(())
    }

    fn deploy(&self) -> Result<()> {
        let archive_path = self.find_package_archive()?;
        let root = self.config.root_for(self.meta.stage);
        fs::create_dir_all(root)
            .map_err(|e| Error::io(format!("creating {}", root.display()), e))?;
        archive::unpack(&archive_path, root)?;
        info!(package = %self.id, root = %root.display(), "deployed");
        Ok(())
    }

    fn register(&self) -> Result<()> {
        let mut manifest = Manifest::from_metafile(self.meta);
        manifest.files = self.collect_staged_files()?;
        self.store.add(&manifest, true)
    }

    // ------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------

    fn find_package_archive(&self) -> Result<PathBuf> {
        let zst = self.package_archive();
        if zst.exists() {
            return Ok(zst);
        }
        // the package stage falls back to an uncompressed tar
        let plain = PathBuf::from(
            zst.to_string_lossy()
                .trim_end_matches(".zst")
                .to_string(),
        );
        if plain.exists() {
            return Ok(plain);
        }
        Err(Error::NotFound(format!(
            "package archive for {} (run the package stage first)",
            self.id
        )))
    }

    /// Walk the staging tree and describe every file for the manifest
    fn collect_staged_files(&self) -> Result<Vec<ManifestFile>> {
        let mut files = Vec::new();
        for entry in WalkDir::new(&self.dest_dir)
            .follow_links(false)
            .sort_by_file_name()
            .into_iter()
            .filter_map(|e| e.ok())
        {
            let file_type = entry.file_type();
            if file_type.is_dir() {
                continue;
            }
            let rel = entry
                .path()
                .strip_prefix(&self.dest_dir)
                .map_err(|e| Error::Io(format!("path outside staging tree: {e}")))?;
            let path = format!("/{}", rel.display());
            let metadata = entry
                .metadata()
                .map_err(|e| Error::Io(format!("stat {}: {e}", entry.path().display())))?;
            let mode = metadata.permissions().mode() & 0o7777;

            if file_type.is_symlink() {
                files.push(ManifestFile::Detailed {
                    path,
                    sha256: None,
                    size: None,
                    mode: Some(mode),
                });
            } else {
                files.push(ManifestFile::Detailed {
                    path,
                    sha256: Some(sha256_file(entry.path())?),
                    size: Some(metadata.len()),
                    mode: Some(mode),
                });
            }
        }
        Ok(files)
    }

    /// Run one recipe command through `sh -c`, retrying on failure
    ///
    /// Install commands run under fakeroot when it is available so file
    /// ownership is recorded without real privilege.
    fn run_command(
        &self,
        stage: BuildStage,
        command: &str,
        cwd: &Path,
        fake_root: bool,
    ) -> Result<()> {
        let command = interpolate(command, &self.dest_dir, self.config.parallel.max(1));
        let attempts = self.config.retry.max(1);
        let mut last_failure = String::new();

        for attempt in 1..=attempts {
            debug!(package = %self.id, %stage, attempt, command = %command, "running command");
            let mut process = if fake_root && let Some(fakeroot) = fakeroot_binary() {
                let mut c = Command::new(fakeroot);
                c.args(["sh", "-c", &command]);
                c
            } else {
                let mut c = Command::new("sh");
                c.args(["-c", &command]);
                c
            };
            process
                .current_dir(cwd)
                .env("DESTDIR", &self.dest_dir)
                .env("MAKEFLAGS", format!("-j{}", self.config.parallel.max(1)))
                .envs(&self.meta.environment);

            let output = process
                .output()
                .map_err(|e| Error::io(format!("spawning '{command}'"), e))?;
            self.append_log(
                &format!("=== {stage} (attempt {attempt}): {command} ==="),
                &output.stdout,
                &output.stderr,
            )?;

            if output.status.success() {
                return Ok(());
            }
            last_failure = format!(
                "exit {:?}: {}",
                output.status.code(),
                String::from_utf8_lossy(&output.stderr)
                    .lines()
                    .last()
                    .unwrap_or_default()
            );
            warn!(package = %self.id, %stage, attempt, "command failed");
        }

        Err(Error::Build {
            package: self.id.to_string(),
            stage: stage.as_str().to_string(),
            reason: format!("'{command}' failed after {attempts} attempts ({last_failure})"),
        })
    }

    fn append_log(&self, header: &str, stdout: &[u8], stderr: &[u8]) -> Result<()> {
        if let Some(parent) = self.build_log.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| Error::io(format!("creating {}", parent.display()), e))?;
        }
        let mut log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.build_log)
            .map_err(|e| Error::io(format!("opening {}", self.build_log.display()), e))?;
        writeln!(log, "{header}")
            .and_then(|_| log.write_all(stdout))
            .and_then(|_| log.write_all(stderr))
            .map_err(|e| Error::io(format!("writing {}", self.build_log.display()), e))?;
        Ok(())
    }
}

fn dir_is_empty(dir: &Path) -> Result<bool> {
    Ok(fs::read_dir(dir)
        .map_err(|e| Error::io(format!("reading {}", dir.display()), e))?
        .next()
        .is_none())
}

/// Locate fakeroot once per process
fn fakeroot_binary() -> Option<&'static Path> {
    use std::sync::OnceLock;
    static FAKEROOT: OnceLock<Option<PathBuf>> = OnceLock::new();
    FAKEROOT
        .get_or_init(|| {
            ["/usr/bin/fakeroot", "/usr/local/bin/fakeroot"]
                .iter()
                .map(Path::new)
                .find(|p| p.exists())
                .map(Path::to_path_buf)
        })
        .as_deref()
}
