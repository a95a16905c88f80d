// src/lock.rs

//! Process-wide store lock
//!
//! Only one driver may mutate the manifest database at a time. The lock is
//! an advisory flock on a file in the state directory; it is released when
//! the guard drops, including on panic.

use crate::config::Config;
use crate::error::{Error, Result};
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use tracing::debug;

/// Held for the duration of a mutating driver run
pub struct StoreLock {
    file: File,
}

impl StoreLock {
    /// Acquire the lock, failing immediately with `StateConflict` when
    /// another driver holds it
    pub fn acquire(config: &Config) -> Result<Self> {
        let path = config.lock_path();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| Error::io(format!("creating {}", parent.display()), e))?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&path)
            .map_err(|e| Error::io(format!("opening {}", path.display()), e))?;

        file.try_lock_exclusive().map_err(|_| {
            Error::StateConflict(format!(
                "another newpkg driver holds the lock at {}",
                path.display()
            ))
        })?;

        // record the holder for post-mortem inspection; content is advisory
        let _ = file.set_len(0);
        let _ = writeln!(file, "{}", std::process::id());
        debug!(lock = %path.display(), "store lock acquired");
        Ok(Self { file })
    }
}

impl Drop for StoreLock {
    fn drop(&mut self) {
        let _ = fs2::FileExt::unlock(&self.file);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_excludes_second_holder() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::for_root(dir.path());

        let first = StoreLock::acquire(&config).unwrap();
        let second = StoreLock::acquire(&config);
        assert!(matches!(second, Err(Error::StateConflict(_))));

        drop(first);
        let third = StoreLock::acquire(&config);
        assert!(third.is_ok());
    }

    #[test]
    fn test_lock_file_records_pid() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::for_root(dir.path());
        let _lock = StoreLock::acquire(&config).unwrap();
        let content = fs::read_to_string(config.lock_path()).unwrap();
        assert_eq!(content.trim(), std::process::id().to_string());
    }
}
