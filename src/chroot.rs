// src/chroot.rs

//! Bind-mount lifecycle for the bootstrap staging root
//!
//! When a driver run contains pass1/pass2 packages, the staging root needs
//! the usual virtual filesystems before chrooted commands can work.
//! `ChrootGuard` mounts them, copies the host resolver configuration, and
//! guarantees teardown on every exit path: explicit `umount`, drop, or the
//! driver noticing an interrupt flag. Teardown runs exactly once.

use crate::error::{Error, Result};
use nix::mount::{MntFlags, MsFlags, mount, umount2};
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info, warn};

/// Set by the signal handler; drivers poll this between packages
static INTERRUPTED: AtomicBool = AtomicBool::new(false);

/// True once INT or TERM has been received
pub fn interrupted() -> bool {
    INTERRUPTED.load(Ordering::SeqCst)
}

extern "C" fn flag_interrupt(_sig: libc::c_int) {
    INTERRUPTED.store(true, Ordering::SeqCst);
}

/// Install INT/TERM handlers that set the interrupt flag
///
/// The handlers only flip an atomic; all cleanup happens on the normal
/// unwind path so mounts are released exactly once.
pub fn install_signal_handlers() {
    unsafe {
        libc::signal(libc::SIGINT, flag_interrupt as libc::sighandler_t);
        libc::signal(libc::SIGTERM, flag_interrupt as libc::sighandler_t);
    }
}

/// The bind/virtual filesystems set up inside a staging root, in mount
/// order; unmounting walks this list in reverse
const MOUNTS: &[(&str, &str, Option<&str>)] = &[
    ("/dev", "dev", None),
    ("/dev/pts", "dev/pts", None),
    ("proc", "proc", Some("proc")),
    ("sysfs", "sys", Some("sysfs")),
    ("/run", "run", None),
];

/// Scoped owner of the staging-root mounts
#[derive(Debug)]
pub struct ChrootGuard {
    root: PathBuf,
    mounted: Vec<PathBuf>,
    torn_down: bool,
}

impl ChrootGuard {
    /// Mount the virtual filesystems onto `root`
    ///
    /// Idempotent: targets that already appear in the mount table are left
    /// alone and not recorded for teardown.
    pub fn mount(root: &Path) -> Result<Self> {
        let mut guard = Self {
            root: root.to_path_buf(),
            mounted: Vec::new(),
            torn_down: false,
        };
        let table = mount_table()?;

        for (source, target_rel, fstype) in MOUNTS {
            let target = root.join(target_rel);
            if table.contains(&target) {
                debug!(target = %target.display(), "already mounted, skipping");
                continue;
            }
            fs::create_dir_all(&target)
                .map_err(|e| Error::io(format!("creating {}", target.display()), e))?;

            let flags = if fstype.is_none() {
                MsFlags::MS_BIND
            } else {
                MsFlags::empty()
            };
            mount(Some(Path::new(source)), &target, *fstype, flags, None::<&str>).map_err(
                |e| Error::Io(format!("mounting {source} on {}: {e}", target.display())),
            )?;
            debug!(source, target = %target.display(), "mounted");
            guard.mounted.push(target);
        }

        copy_resolv_conf(root)?;
        info!(root = %root.display(), mounts = guard.mounted.len(), "staging root prepared");
        Ok(guard)
    }

    /// Empty the scratch directories inside the root between packages
    ///
    /// Safe to call any number of times while the guard is alive.
    pub fn clean_between(&self) -> Result<()> {
        for scratch in ["tmp", "var/tmp", "build"] {
            let dir = self.root.join(scratch);
            if !dir.is_dir() {
                continue;
            }
            for entry in fs::read_dir(&dir)
                .map_err(|e| Error::io(format!("reading {}", dir.display()), e))?
                .filter_map(|e| e.ok())
            {
                let path = entry.path();
                let result = if path.is_dir() {
                    fs::remove_dir_all(&path)
                } else {
                    fs::remove_file(&path)
                };
                if let Err(err) = result {
                    warn!(path = %path.display(), error = %err, "could not clean scratch entry");
                }
            }
        }
        Ok(())
    }

    /// Lazily unmount everything this guard mounted, in reverse order
    ///
    /// Tolerant of children that are already gone. Idempotent.
    pub fn umount(&mut self) {
        if self.torn_down {
            return;
        }
        self.torn_down = true;
        for target in self.mounted.iter().rev() {
            match umount2(target, MntFlags::MNT_DETACH) {
                Ok(()) => debug!(target = %target.display(), "unmounted"),
                Err(nix::errno::Errno::EINVAL) | Err(nix::errno::Errno::ENOENT) => {
                    // already unmounted underneath us
                }
                Err(err) => {
                    warn!(target = %target.display(), error = %err, "unmount failed");
                }
            }
        }
        self.mounted.clear();
    }
}

impl Drop for ChrootGuard {
    fn drop(&mut self) {
        self.umount();
    }
}

/// Copy (or re-copy) the host DNS resolver file into the root
fn copy_resolv_conf(root: &Path) -> Result<()> {
    let host = Path::new("/etc/resolv.conf");
    if !host.exists() {
        return Ok(());
    }
    let etc = root.join("etc");
    fs::create_dir_all(&etc).map_err(|e| Error::io(format!("creating {}", etc.display()), e))?;
    let dest = etc.join("resolv.conf");
    // the host file is frequently a symlink; resolve it to real contents
    let contents = fs::read(host).map_err(|e| Error::io("reading /etc/resolv.conf", e))?;
    fs::write(&dest, contents)
        .map_err(|e| Error::io(format!("writing {}", dest.display()), e))?;
    Ok(())
}

/// Current mount targets from /proc/mounts
fn mount_table() -> Result<BTreeSet<PathBuf>> {
    let text = fs::read_to_string("/proc/mounts")
        .map_err(|e| Error::io("reading /proc/mounts", e))?;
    Ok(parse_mount_table(&text))
}

fn parse_mount_table(text: &str) -> BTreeSet<PathBuf> {
    text.lines()
        .filter_map(|line| line.split_whitespace().nth(1))
        .map(unescape_mount_path)
        .map(PathBuf::from)
        .collect()
}

/// /proc/mounts escapes spaces and other characters as octal sequences
fn unescape_mount_path(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '\\' {
            let digits: String = chars.by_ref().take(3).collect();
            if let Ok(code) = u8::from_str_radix(&digits, 8) {
                out.push(code as char);
                continue;
            }
            out.push(c);
            out.push_str(&digits);
        } else {
            out.push(c);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
proc /proc proc rw,nosuid,nodev,noexec 0 0
/dev/sda2 / ext4 rw,relatime 0 0
/dev/sda2 /mnt/lfs ext4 rw,relatime 0 0
dev /mnt/lfs/dev devtmpfs rw 0 0
tmpfs /mnt/mount\\040point tmpfs rw 0 0
";

    #[test]
    fn test_parse_mount_table() {
        let table = parse_mount_table(SAMPLE);
        assert!(table.contains(Path::new("/proc")));
        assert!(table.contains(Path::new("/mnt/lfs/dev")));
        assert!(!table.contains(Path::new("/mnt/lfs/proc")));
    }

    #[test]
    fn test_unescape_octal_spaces() {
        assert_eq!(unescape_mount_path("/mnt/mount\\040point"), "/mnt/mount point");
        assert_eq!(unescape_mount_path("/plain"), "/plain");
    }

    #[test]
    fn test_mount_order_covers_spec_filesystems() {
        let targets: Vec<&str> = MOUNTS.iter().map(|(_, t, _)| *t).collect();
        assert_eq!(targets, vec!["dev", "dev/pts", "proc", "sys", "run"]);
        // dev/pts must come after dev so teardown (reverse order) detaches
        // the child first
        assert!(
            targets.iter().position(|t| *t == "dev").unwrap()
                < targets.iter().position(|t| *t == "dev/pts").unwrap()
        );
    }

}
