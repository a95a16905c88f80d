// src/vcs.rs

//! Version-control integration for the ports tree
//!
//! The upgrade and depclean drivers may record one summary commit per run
//! when the ports tree is a git checkout and auto-commit is enabled. The
//! commit is best-effort: a failure is logged, never fatal.

use crate::config::Config;
use std::process::Command;
use tracing::{debug, info, warn};

/// Commit the ports tree with the given message, if it is a git checkout
///
/// Returns true when a commit was made.
pub fn commit_ports_tree(config: &Config, message: &str) -> bool {
    let ports = &config.ports_dir;
    if !ports.join(".git").exists() {
        debug!(ports = %ports.display(), "ports tree is not version-controlled");
        return false;
    }

    let add = Command::new("git")
        .args(["add", "-A"])
        .current_dir(ports)
        .output();
    if !matches!(&add, Ok(out) if out.status.success()) {
        warn!("git add failed in ports tree");
        return false;
    }

    let commit = Command::new("git")
        .args(["commit", "-m", message])
        .current_dir(ports)
        .output();
    match commit {
        Ok(out) if out.status.success() => {
            info!(message, "ports tree committed");
            true
        }
        Ok(out) => {
            // "nothing to commit" lands here; worth only a debug line
            debug!(
                stderr = %String::from_utf8_lossy(&out.stderr).trim(),
                stdout = %String::from_utf8_lossy(&out.stdout).trim(),
                "git commit did not create a commit"
            );
            false
        }
        Err(err) => {
            warn!(error = %err, "git not runnable");
            false
        }
    }
}
