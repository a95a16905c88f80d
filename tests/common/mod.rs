// tests/common/mod.rs

//! Shared test utilities for the integration tests.
//!
//! Everything runs inside a throwaway root: the manifest database, caches,
//! ports tree, and the deploy root itself all live under one tempdir, so
//! tests never touch the host system and never need privileges.

#![allow(dead_code)]

use newpkg::{Config, Manifest, ManifestStore};
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// A fully self-contained newpkg installation rooted in a tempdir.
///
/// Keep the `TempDir` alive for the duration of the test.
pub struct TestEnv {
    pub dir: TempDir,
    pub config: Config,
}

impl TestEnv {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::for_root(dir.path());
        config.parallel = 1;
        config.retry = 1;
        config.ensure_dirs().unwrap();
        fs::create_dir_all(&config.ports_dir).unwrap();
        let env = Self { dir, config };
        env.store().init().unwrap();
        env
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    pub fn store(&self) -> ManifestStore {
        ManifestStore::new(&self.config)
    }

    /// Create a source tarball `<name>-<version>.tar.zst` containing a
    /// single `<name>.sh` script, and return its `file://` URL.
    pub fn make_source(&self, name: &str, version: &str) -> String {
        let tree = self.root().join(format!("upstream/{name}-{version}"));
        fs::create_dir_all(&tree).unwrap();
        fs::write(
            tree.join(format!("{name}.sh")),
            format!("#!/bin/sh\necho {name} {version}\n"),
        )
        .unwrap();

        let tarball = self
            .root()
            .join(format!("upstream/{name}-{version}.tar.zst"));
        let file = fs::File::create(&tarball).unwrap();
        let encoder = zstd::Encoder::new(file, 0).unwrap();
        let mut builder = tar::Builder::new(encoder);
        builder
            .append_dir_all(format!("{name}-{version}"), &tree)
            .unwrap();
        builder.into_inner().unwrap().finish().unwrap();
        format!("file://{}", tarball.display())
    }

    /// Write a metafile whose build is trivial and whose install stage
    /// produces `/usr/bin/<name>`. Returns the metafile path.
    pub fn write_port(&self, name: &str, version: &str, run_deps: &[&str]) -> PathBuf {
        self.write_port_with_build(name, version, run_deps, "true")
    }

    /// Same as `write_port` but with a custom build command, so tests can
    /// make the build stage fail or count attempts.
    pub fn write_port_with_build(
        &self,
        name: &str,
        version: &str,
        run_deps: &[&str],
        build_command: &str,
    ) -> PathBuf {
        let source = self.make_source(name, version);
        let deps_block = if run_deps.is_empty() {
            String::new()
        } else {
            let list = run_deps
                .iter()
                .map(|d| format!("    - {d}"))
                .collect::<Vec<_>>()
                .join("\n");
            format!("depends:\n  run:\n{list}\n")
        };
        let yaml = format!(
            r#"name: {name}
version: "{version}"
sources:
  - {source}
commands:
  configure: "true"
  build: "{build_command}"
  install: |
    mkdir -p @DESTDIR@/usr/bin
    cp {name}.sh @DESTDIR@/usr/bin/{name}
{deps_block}"#
        );
        let path = self.config.ports_dir.join(format!("{name}.yaml"));
        fs::write(&path, yaml).unwrap();
        path
    }

    /// Register a manifest directly, bypassing the pipeline, with the file
    /// laid down in the deploy root.
    pub fn register(&self, name: &str, version: &str, run_deps: &[&str]) {
        let rel = format!("usr/bin/{name}");
        let on_disk = self.root().join(&rel);
        fs::create_dir_all(on_disk.parent().unwrap()).unwrap();
        fs::write(&on_disk, format!("{name}-{version}")).unwrap();
        let manifest: Manifest = serde_json::from_value(serde_json::json!({
            "name": name,
            "version": version,
            "files": [format!("/{rel}")],
            "depends": {"run": run_deps},
        }))
        .unwrap();
        self.store().add(&manifest, true).unwrap();
    }

    /// The deployed path of `/usr/bin/<name>` inside the test root.
    pub fn deployed_bin(&self, name: &str) -> PathBuf {
        self.root().join("usr/bin").join(name)
    }

    /// Snapshot the full manifest-db state (filenames plus contents),
    /// ignoring backups and logs, for before/after comparisons.
    pub fn db_state(&self) -> Vec<(String, String)> {
        let mut state: Vec<(String, String)> = fs::read_dir(&self.config.db_dir)
            .unwrap()
            .filter_map(|e| e.ok())
            .map(|e| {
                (
                    e.file_name().to_string_lossy().into_owned(),
                    fs::read_to_string(e.path()).unwrap_or_default(),
                )
            })
            .collect();
        state.sort();
        state
    }
}
