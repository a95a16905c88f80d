// src/fsutil.rs

//! Small filesystem primitives shared by the store, pipeline, and drivers

use crate::error::{Error, Result};
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

/// Write a file atomically: write to a temporary sibling, fsync, rename
///
/// The temporary lives in the destination directory so the final rename
/// never crosses filesystems.
pub fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    let dir = path
        .parent()
        .ok_or_else(|| Error::Io(format!("{} has no parent directory", path.display())))?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir)
        .map_err(|e| Error::io(format!("creating temp file in {}", dir.display()), e))?;
    tmp.write_all(contents)
        .map_err(|e| Error::io(format!("writing {}", path.display()), e))?;
    tmp.as_file()
        .sync_all()
        .map_err(|e| Error::io(format!("syncing {}", path.display()), e))?;
    tmp.persist(path)
        .map_err(|e| Error::io(format!("renaming into {}", path.display()), e))?;
    Ok(())
}

/// Move a file, falling back to copy+fsync+delete for cross-filesystem moves
pub fn move_file(src: &Path, dst: &Path) -> io::Result<()> {
    match fs::rename(src, dst) {
        Ok(()) => Ok(()),
        Err(e) if e.raw_os_error() == Some(libc::EXDEV) => {
            fs::copy(src, dst)?;
            let file = File::open(dst)?;
            file.sync_all()?;
            drop(file);
            fs::remove_file(src)?;
            Ok(())
        }
        Err(e) => Err(e),
    }
}

/// Current UTC timestamp in the compact form used for backups and snapshots
pub fn timestamp() -> String {
    chrono::Utc::now().format("%Y%m%d%H%M%S").to_string()
}

/// Join an absolute or relative path under a root directory
///
/// `/usr/bin/alpha` under `/mnt/lfs` becomes `/mnt/lfs/usr/bin/alpha`.
pub fn rooted(root: &Path, path: &str) -> PathBuf {
    root.join(path.trim_start_matches('/'))
}

/// Remove a file and prune now-empty parent directories up to `root`
pub fn remove_file_pruning(root: &Path, path: &Path) -> io::Result<()> {
    if path.is_dir() {
        // owned directories are only removed when empty
        let _ = fs::remove_dir(path);
    } else {
        fs::remove_file(path)?;
    }
    let mut parent = path.parent();
    while let Some(dir) = parent {
        if dir == root || !dir.starts_with(root) {
            break;
        }
        if fs::remove_dir(dir).is_err() {
            break; // not empty or not removable; stop pruning
        }
        parent = dir.parent();
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_atomic_replaces_contents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.json");
        write_atomic(&path, b"[1]").unwrap();
        write_atomic(&path, b"[1,2]").unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"[1,2]");
    }

    #[test]
    fn test_rooted() {
        assert_eq!(
            rooted(Path::new("/mnt/lfs"), "/usr/bin/alpha"),
            PathBuf::from("/mnt/lfs/usr/bin/alpha")
        );
        assert_eq!(
            rooted(Path::new("/"), "/usr/bin/alpha"),
            PathBuf::from("/usr/bin/alpha")
        );
    }

    #[test]
    fn test_move_file() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("a");
        let dst = dir.path().join("b");
        fs::write(&src, b"data").unwrap();
        move_file(&src, &dst).unwrap();
        assert!(!src.exists());
        assert_eq!(fs::read(&dst).unwrap(), b"data");
    }

    #[test]
    fn test_remove_file_pruning() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        let nested = root.join("usr/share/alpha");
        fs::create_dir_all(&nested).unwrap();
        let file = nested.join("data");
        fs::write(&file, b"x").unwrap();

        remove_file_pruning(root, &file).unwrap();
        assert!(!file.exists());
        assert!(!root.join("usr/share/alpha").exists());
        assert!(!root.join("usr").exists());
        assert!(root.exists());
    }

    #[test]
    fn test_pruning_stops_at_nonempty_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        fs::create_dir_all(root.join("usr/bin")).unwrap();
        fs::write(root.join("usr/bin/alpha"), b"x").unwrap();
        fs::write(root.join("usr/keep"), b"y").unwrap();

        remove_file_pruning(root, &root.join("usr/bin/alpha")).unwrap();
        assert!(!root.join("usr/bin").exists());
        assert!(root.join("usr").exists());
    }
}
