// src/pipeline/checkpoint.rs

//! Per-package pipeline checkpoints
//!
//! Each package carries a state file recording which stages have completed.
//! The file is written atomically after every stage, so a crash at any
//! point leaves an accurate record and `--resume` replays from the first
//! incomplete stage.

use crate::error::{Error, Result};
use crate::fsutil::write_atomic;
use crate::package::PackageId;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// The ordered stages of the build pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum BuildStage {
    Downloaded,
    Extracted,
    Patched,
    Built,
    InstalledDestdir,
    Packaged,
    Deployed,
    Registered,
}

impl BuildStage {
    /// Every stage in pipeline order
    pub const ALL: [BuildStage; 8] = [
        BuildStage::Downloaded,
        BuildStage::Extracted,
        BuildStage::Patched,
        BuildStage::Built,
        BuildStage::InstalledDestdir,
        BuildStage::Packaged,
        BuildStage::Deployed,
        BuildStage::Registered,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            BuildStage::Downloaded => "downloaded",
            BuildStage::Extracted => "extracted",
            BuildStage::Patched => "patched",
            BuildStage::Built => "built",
            BuildStage::InstalledDestdir => "installed_destdir",
            BuildStage::Packaged => "packaged",
            BuildStage::Deployed => "deployed",
            BuildStage::Registered => "registered",
        }
    }

    /// The hook that fires after this stage completes
    pub fn post_hook(&self) -> &'static str {
        match self {
            BuildStage::Downloaded => "post-download",
            BuildStage::Extracted => "post-extract",
            BuildStage::Patched => "post-patch",
            BuildStage::Built => "post-build",
            BuildStage::InstalledDestdir => "post-install",
            BuildStage::Packaged => "post-package",
            BuildStage::Deployed => "post-deploy",
            BuildStage::Registered => "post-register",
        }
    }
}

impl std::fmt::Display for BuildStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct CheckpointFile {
    package: String,
    completed: Vec<String>,
}

/// Persistent record of a package's completed stages
#[derive(Debug)]
pub struct Checkpoint {
    path: PathBuf,
    package: String,
    completed: Vec<String>,
}

impl Checkpoint {
    /// Load the checkpoint for `id`, empty when none exists
    pub fn load(state_dir: &Path, id: &PackageId) -> Result<Self> {
        let path = state_dir.join(id.state_filename());
        let (package, completed) = match fs::read_to_string(&path) {
            Ok(text) => {
                let file: CheckpointFile = serde_json::from_str(&text).map_err(|e| {
                    Error::Malformed(format!("checkpoint {}: {e}", path.display()))
                })?;
                (file.package, file.completed)
            }
            Err(_) => (id.to_string(), Vec::new()),
        };
        Ok(Self {
            path,
            package,
            completed,
        })
    }

    pub fn is_done(&self, stage: BuildStage) -> bool {
        self.completed.iter().any(|s| s == stage.as_str())
    }

    /// The first stage that has not completed yet
    pub fn first_incomplete(&self) -> Option<BuildStage> {
        BuildStage::ALL.into_iter().find(|s| !self.is_done(*s))
    }

    /// Record a completed stage and persist
    pub fn mark(&mut self, stage: BuildStage) -> Result<()> {
        if !self.is_done(stage) {
            self.completed.push(stage.as_str().to_string());
        }
        let file = CheckpointFile {
            package: self.package.clone(),
            completed: self.completed.clone(),
        };
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| Error::io(format!("creating {}", parent.display()), e))?;
        }
        write_atomic(&self.path, &serde_json::to_vec_pretty(&file)?)
    }

    /// Drop the checkpoint file (after registration or on clean)
    pub fn clear(&mut self) -> Result<()> {
        self.completed.clear();
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::io(format!("removing {}", self.path.display()), e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_order_is_the_pipeline() {
        let names: Vec<&str> = BuildStage::ALL.iter().map(|s| s.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "downloaded",
                "extracted",
                "patched",
                "built",
                "installed_destdir",
                "packaged",
                "deployed",
                "registered",
            ]
        );
    }

    #[test]
    fn test_checkpoint_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let id = PackageId::new("alpha", "1.0");

        let mut cp = Checkpoint::load(dir.path(), &id).unwrap();
        assert_eq!(cp.first_incomplete(), Some(BuildStage::Downloaded));

        cp.mark(BuildStage::Downloaded).unwrap();
        cp.mark(BuildStage::Extracted).unwrap();

        // a fresh load sees the persisted progress
        let reloaded = Checkpoint::load(dir.path(), &id).unwrap();
        assert!(reloaded.is_done(BuildStage::Downloaded));
        assert!(reloaded.is_done(BuildStage::Extracted));
        assert_eq!(reloaded.first_incomplete(), Some(BuildStage::Patched));
    }

    #[test]
    fn test_mark_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let id = PackageId::new("alpha", "1.0");
        let mut cp = Checkpoint::load(dir.path(), &id).unwrap();
        cp.mark(BuildStage::Downloaded).unwrap();
        cp.mark(BuildStage::Downloaded).unwrap();
        assert_eq!(cp.completed.len(), 1);
    }

    #[test]
    fn test_clear_removes_state_file() {
        let dir = tempfile::tempdir().unwrap();
        let id = PackageId::new("alpha", "1.0");
        let mut cp = Checkpoint::load(dir.path(), &id).unwrap();
        cp.mark(BuildStage::Downloaded).unwrap();
        let path = dir.path().join(id.state_filename());
        assert!(path.exists());

        cp.clear().unwrap();
        assert!(!path.exists());
        assert_eq!(cp.first_incomplete(), Some(BuildStage::Downloaded));
        // clearing an absent file is fine
        cp.clear().unwrap();
    }

    #[test]
    fn test_all_stages_complete() {
        let dir = tempfile::tempdir().unwrap();
        let id = PackageId::new("alpha", "1.0");
        let mut cp = Checkpoint::load(dir.path(), &id).unwrap();
        for stage in BuildStage::ALL {
            cp.mark(stage).unwrap();
        }
        assert_eq!(cp.first_incomplete(), None);
    }
}
