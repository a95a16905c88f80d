// src/archive.rs

//! Archive packing and unpacking
//!
//! Package archives are always written as tar streams, zstd-compressed when
//! possible. Source archives arrive in whatever format upstream ships;
//! gzip, xz, and zstd tarballs are handled natively, zip via the system
//! `unzip`, and anything else falls back to `tar -xf`, which copes with
//! formats like `.tar.bz2` without a dedicated decoder here.

use crate::error::{Error, Result};
use flate2::read::GzDecoder;
use std::fs::{self, File};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::{debug, warn};
use xz2::read::XzDecoder;

/// Compression formats recognized by filename
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressionFormat {
    None,
    Gzip,
    Xz,
    Zstd,
    Zip,
    /// Not recognized; handled by the system tar fallback
    Other,
}

impl CompressionFormat {
    pub fn from_filename(name: &str) -> Self {
        if name.ends_with(".tar.gz") || name.ends_with(".tgz") {
            Self::Gzip
        } else if name.ends_with(".tar.xz") || name.ends_with(".txz") {
            Self::Xz
        } else if name.ends_with(".tar.zst") || name.ends_with(".tar.zstd") {
            Self::Zstd
        } else if name.ends_with(".zip") {
            Self::Zip
        } else if name.ends_with(".tar") {
            Self::None
        } else {
            Self::Other
        }
    }
}

/// Unpack a source or package archive into `dest`
pub fn unpack(archive: &Path, dest: &Path) -> Result<()> {
    fs::create_dir_all(dest)
        .map_err(|e| Error::io(format!("creating {}", dest.display()), e))?;

    let name = archive
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or_default();

    match CompressionFormat::from_filename(name) {
        CompressionFormat::Gzip => {
            let file = open(archive)?;
            unpack_tar_stream(GzDecoder::new(file), archive, dest)
        }
        CompressionFormat::Xz => {
            let file = open(archive)?;
            unpack_tar_stream(XzDecoder::new(file), archive, dest)
        }
        CompressionFormat::Zstd => {
            let file = open(archive)?;
            let decoder = zstd::Decoder::new(file)
                .map_err(|e| Error::io(format!("opening zstd stream {}", archive.display()), e))?;
            unpack_tar_stream(decoder, archive, dest)
        }
        CompressionFormat::None => {
            let file = open(archive)?;
            unpack_tar_stream(file, archive, dest)
        }
        CompressionFormat::Zip => unpack_with_tool(
            "unzip",
            &["-q", "-o", &archive.to_string_lossy(), "-d", &dest.to_string_lossy()],
            archive,
        ),
        CompressionFormat::Other => {
            debug!(archive = %archive.display(), "unknown format, falling back to tar -xf");
            unpack_with_tool(
                "tar",
                &["-xf", &archive.to_string_lossy(), "-C", &dest.to_string_lossy()],
                archive,
            )
        }
    }
}

fn open(path: &Path) -> Result<File> {
    File::open(path).map_err(|e| Error::io(format!("opening {}", path.display()), e))
}

fn unpack_tar_stream<R: Read>(reader: R, archive: &Path, dest: &Path) -> Result<()> {
    let mut tar = tar::Archive::new(reader);
    tar.set_preserve_permissions(true);
    tar.unpack(dest)
        .map_err(|e| Error::io(format!("extracting {}", archive.display()), e))
}

fn unpack_with_tool(tool: &str, args: &[&str], archive: &Path) -> Result<()> {
    let output = Command::new(tool)
        .args(args)
        .output()
        .map_err(|e| Error::io(format!("running {tool}"), e))?;
    if !output.status.success() {
        return Err(Error::Io(format!(
            "{tool} failed to extract {}: {}",
            archive.display(),
            String::from_utf8_lossy(&output.stderr)
        )));
    }
    Ok(())
}

/// Pack the contents of a directory into a tar archive at `dest`
///
/// `dest` should end in `.tar.zst`; when the zstd encoder cannot be set up
/// the archive is written uncompressed with a `.tar` suffix instead. Returns
/// the path actually written. Entries are stored relative to `src_dir` so
/// they extract directly into a target root.
pub fn pack_dir(src_dir: &Path, dest: &Path) -> Result<PathBuf> {
    match pack_dir_zstd(src_dir, dest) {
        Ok(path) => Ok(path),
        Err(err) => {
            warn!(error = %err, "zstd packing failed, writing uncompressed tar");
            let plain = swap_zst_suffix(dest);
            pack_dir_plain(src_dir, &plain)?;
            Ok(plain)
        }
    }
}

fn pack_dir_zstd(src_dir: &Path, dest: &Path) -> Result<PathBuf> {
    let file = File::create(dest)
        .map_err(|e| Error::io(format!("creating {}", dest.display()), e))?;
    let encoder = zstd::Encoder::new(file, 0)
        .map_err(|e| Error::io("creating zstd encoder", e))?;
    let mut builder = tar::Builder::new(encoder);
    builder.follow_symlinks(false);
    append_dir_contents(&mut builder, src_dir)?;
    let encoder = builder
        .into_inner()
        .map_err(|e| Error::io(format!("finishing {}", dest.display()), e))?;
    encoder
        .finish()
        .map_err(|e| Error::io(format!("finishing {}", dest.display()), e))?;
    Ok(dest.to_path_buf())
}

fn pack_dir_plain(src_dir: &Path, dest: &Path) -> Result<()> {
    let file = File::create(dest)
        .map_err(|e| Error::io(format!("creating {}", dest.display()), e))?;
    let mut builder = tar::Builder::new(file);
    builder.follow_symlinks(false);
    append_dir_contents(&mut builder, src_dir)?;
    builder
        .finish()
        .map_err(|e| Error::io(format!("finishing {}", dest.display()), e))
}

fn append_dir_contents<W: std::io::Write>(
    builder: &mut tar::Builder<W>,
    src_dir: &Path,
) -> Result<()> {
    builder
        .append_dir_all(".", src_dir)
        .map_err(|e| Error::io(format!("archiving {}", src_dir.display()), e))
}

/// Pack a selected list of files (absolute paths under `root`) into a tar
/// archive, preserving their root-relative paths
pub fn pack_files(root: &Path, files: &[&str], dest: &Path) -> Result<PathBuf> {
    let file = File::create(dest)
        .map_err(|e| Error::io(format!("creating {}", dest.display()), e))?;
    let encoder = zstd::Encoder::new(file, 0)
        .map_err(|e| Error::io("creating zstd encoder", e))?;
    let mut builder = tar::Builder::new(encoder);
    builder.follow_symlinks(false);

    for path in files {
        let rel = path.trim_start_matches('/');
        let on_disk = root.join(rel);
        if !on_disk.exists() {
            warn!(file = %on_disk.display(), "listed file missing, skipping in archive");
            continue;
        }
        if on_disk.is_dir() {
            builder
                .append_dir_all(rel, &on_disk)
                .map_err(|e| Error::io(format!("archiving {}", on_disk.display()), e))?;
        } else {
            builder
                .append_path_with_name(&on_disk, rel)
                .map_err(|e| Error::io(format!("archiving {}", on_disk.display()), e))?;
        }
    }

    let encoder = builder
        .into_inner()
        .map_err(|e| Error::io(format!("finishing {}", dest.display()), e))?;
    encoder
        .finish()
        .map_err(|e| Error::io(format!("finishing {}", dest.display()), e))?;
    Ok(dest.to_path_buf())
}

fn swap_zst_suffix(dest: &Path) -> PathBuf {
    let name = dest.to_string_lossy();
    match name.strip_suffix(".tar.zst") {
        Some(stem) => PathBuf::from(format!("{stem}.tar")),
        None => dest.with_extension("tar"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_detection() {
        assert_eq!(CompressionFormat::from_filename("a.tar.gz"), CompressionFormat::Gzip);
        assert_eq!(CompressionFormat::from_filename("a.tgz"), CompressionFormat::Gzip);
        assert_eq!(CompressionFormat::from_filename("a.tar.xz"), CompressionFormat::Xz);
        assert_eq!(CompressionFormat::from_filename("a.tar.zst"), CompressionFormat::Zstd);
        assert_eq!(CompressionFormat::from_filename("a.zip"), CompressionFormat::Zip);
        assert_eq!(CompressionFormat::from_filename("a.tar"), CompressionFormat::None);
        assert_eq!(CompressionFormat::from_filename("a.tar.bz2"), CompressionFormat::Other);
    }

    #[test]
    fn test_pack_unpack_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("tree");
        fs::create_dir_all(src.join("usr/bin")).unwrap();
        fs::write(src.join("usr/bin/hello"), b"#!/bin/sh\necho hi\n").unwrap();

        let archive = dir.path().join("pkg.tar.zst");
        let written = pack_dir(&src, &archive).unwrap();
        assert!(written.exists());

        let out = dir.path().join("out");
        unpack(&written, &out).unwrap();
        let content = fs::read(out.join("usr/bin/hello")).unwrap();
        assert_eq!(content, b"#!/bin/sh\necho hi\n");
    }

    #[test]
    fn test_pack_files_subset() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("root");
        fs::create_dir_all(root.join("usr/bin")).unwrap();
        fs::create_dir_all(root.join("etc")).unwrap();
        fs::write(root.join("usr/bin/a"), b"a").unwrap();
        fs::write(root.join("etc/a.conf"), b"conf").unwrap();
        fs::write(root.join("etc/other.conf"), b"other").unwrap();

        let archive = dir.path().join("subset.tar.zst");
        pack_files(&root, &["/usr/bin/a", "/etc/a.conf"], &archive).unwrap();

        let out = dir.path().join("out");
        unpack(&archive, &out).unwrap();
        assert!(out.join("usr/bin/a").exists());
        assert!(out.join("etc/a.conf").exists());
        assert!(!out.join("etc/other.conf").exists());
    }

    #[test]
    fn test_swap_zst_suffix() {
        assert_eq!(
            swap_zst_suffix(Path::new("/x/pkg-1.0.tar.zst")),
            PathBuf::from("/x/pkg-1.0.tar")
        );
    }
}
