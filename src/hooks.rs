// src/hooks.rs

//! Hook execution: directories of executables run at stage boundaries
//!
//! Each hook name maps to a directory under the configured hooks root.
//! Every executable file in that directory runs, sorted by name, with the
//! package id and metafile path as arguments. Hooks are advisory: a
//! non-zero exit is logged and does not abort the operation.

use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::process::Command;
use tracing::{debug, warn};

/// Run every executable in `<hooks_dir>/<hook>/` with the given arguments
pub fn run_hooks(hooks_dir: &Path, hook: &str, args: &[&str]) {
    let dir = hooks_dir.join(hook);
    if !dir.is_dir() {
        return;
    }

    let mut entries: Vec<_> = match std::fs::read_dir(&dir) {
        Ok(rd) => rd.filter_map(|e| e.ok()).collect(),
        Err(err) => {
            warn!(hook, error = %err, "cannot read hook directory");
            return;
        }
    };
    entries.sort_by_key(|e| e.file_name());

    for entry in entries {
        let path = entry.path();
        if !is_executable_file(&path) {
            continue;
        }
        debug!(hook, script = %path.display(), "running hook");
        match Command::new(&path).args(args).status() {
            Ok(status) if status.success() => {}
            Ok(status) => {
                warn!(hook, script = %path.display(), code = status.code(), "hook exited non-zero");
            }
            Err(err) => {
                warn!(hook, script = %path.display(), error = %err, "hook failed to start");
            }
        }
    }
}

fn is_executable_file(path: &Path) -> bool {
    path.is_file()
        && path
            .metadata()
            .map(|m| m.permissions().mode() & 0o111 != 0)
            .unwrap_or(false)
}
