// src/metafile.rs

//! Metafile parsing: the YAML recipe describing how to build one package
//!
//! A metafile lives in the ports tree and drives the whole pipeline: where
//! the sources come from, which patches apply, which commands build and
//! install, and what the package depends on. Unknown top-level keys are
//! ignored so trees can carry annotations newpkg does not understand.

use crate::error::{Error, Result};
use crate::package::{Depends, PackageId, Stage};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;
use walkdir::WalkDir;

/// Variable interpolated with the staging directory in recipe commands
pub const DESTDIR_VAR: &str = "@DESTDIR@";
/// Variable interpolated with the effective build parallelism
pub const MAKEJOBS_VAR: &str = "@MAKEJOBS@";

/// Build commands for one package, run through `sh -c` in order
///
/// Each field may hold several newline-separated commands. Empty fields fall
/// back to a conventional autotools build.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Commands {
    #[serde(default)]
    pub configure: Option<String>,
    #[serde(default)]
    pub build: Option<String>,
    #[serde(default)]
    pub install: Option<String>,
}

/// A parsed metafile
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Metafile {
    pub name: String,
    pub version: String,

    #[serde(default)]
    pub stage: Stage,

    /// Source archive URLs (http(s), file://, or plain paths)
    #[serde(default)]
    pub sources: Vec<String>,

    /// Patch files, relative to the metafile's directory
    #[serde(default)]
    pub patches: Vec<String>,

    #[serde(default)]
    pub commands: Commands,

    #[serde(default)]
    pub depends: Depends,

    /// Alternate names this package satisfies during resolution
    #[serde(default)]
    pub provides: Vec<String>,

    #[serde(default)]
    pub install_prefix: Option<String>,

    /// Subdirectory of the extracted tree to build in
    #[serde(default)]
    pub build_dir: Option<String>,

    /// Extra environment for every build command
    #[serde(default)]
    pub environment: BTreeMap<String, String>,

    /// Free-form provenance recorded into the manifest
    #[serde(default)]
    pub origin: Option<String>,

    #[serde(default)]
    pub description: Option<String>,
}

impl Metafile {
    /// Parse a metafile from a YAML file
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .map_err(|e| Error::io(format!("reading metafile {}", path.display()), e))?;
        let meta: Metafile = serde_yaml::from_str(&text)?;
        meta.validate()?;
        Ok(meta)
    }

    fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(Error::Malformed("metafile has empty name".into()));
        }
        if self.version.is_empty() {
            return Err(Error::Malformed(format!(
                "metafile for '{}' has empty version",
                self.name
            )));
        }
        Ok(())
    }

    pub fn id(&self) -> PackageId {
        PackageId::new(&self.name, &self.version)
    }

    /// The configure/build command sequence, defaulted when the metafile
    /// gives none
    pub fn build_commands(&self) -> Vec<String> {
        let mut cmds = Vec::new();
        match (&self.commands.configure, &self.commands.build) {
            (None, None) => {
                cmds.push("./configure --prefix=/usr".to_string());
                cmds.push(format!("make -j{MAKEJOBS_VAR}"));
            }
            (configure, build) => {
                if let Some(c) = configure {
                    cmds.extend(split_commands(c));
                }
                if let Some(b) = build {
                    cmds.extend(split_commands(b));
                }
            }
        }
        cmds
    }

    /// The install command sequence, defaulted when the metafile gives none
    pub fn install_commands(&self) -> Vec<String> {
        match &self.commands.install {
            Some(i) => split_commands(i),
            None => vec![format!("make DESTDIR={DESTDIR_VAR} install")],
        }
    }
}

/// Substitute the two recipe interpolations into a command string
pub fn interpolate(command: &str, destdir: &Path, jobs: u32) -> String {
    command
        .replace(DESTDIR_VAR, &destdir.to_string_lossy())
        .replace(MAKEJOBS_VAR, &jobs.to_string())
}

fn split_commands(block: &str) -> Vec<String> {
    block
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .map(str::to_string)
        .collect()
}

/// Locate the metafile for a package name in the ports tree
///
/// Conventional locations are tried first (`<ports>/<name>/metafile.yaml`,
/// `<ports>/<name>.yaml`), then the tree is walked and every YAML document
/// with a matching `name` field is considered.
pub fn find_metafile(ports_dir: &Path, name: &str) -> Result<PathBuf> {
    for candidate in [
        ports_dir.join(name).join("metafile.yaml"),
        ports_dir.join(name).join("metafile.yml"),
        ports_dir.join(format!("{name}.yaml")),
        ports_dir.join(format!("{name}.yml")),
    ] {
        if candidate.is_file() {
            return Ok(candidate);
        }
    }

    for entry in WalkDir::new(ports_dir)
        .follow_links(false)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
    {
        let path = entry.path();
        let is_yaml = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e == "yaml" || e == "yml");
        if !is_yaml {
            continue;
        }
        if let Ok(meta) = Metafile::load(path)
            && meta.name == name
        {
            debug!(metafile = %path.display(), package = name, "found metafile by tree walk");
            return Ok(path.to_path_buf());
        }
    }

    Err(Error::NotFound(format!(
        "no metafile for '{name}' under {}",
        ports_dir.display()
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
name: nginx
version: 1.24.0
stage: normal
sources:
  - https://nginx.org/download/nginx-1.24.0.tar.gz
patches:
  - nginx-headers.patch
commands:
  configure: ./configure --prefix=/usr --with-http_ssl_module
  build: make -j@MAKEJOBS@
  install: make DESTDIR=@DESTDIR@ install
depends:
  build: [openssl, pcre, zlib]
  run: [openssl, "pcre>=8.45"]
provides: [webserver]
environment:
  CFLAGS: "-O2"
origin: ports/nginx
unknown_future_key: ignored
"#;

    #[test]
    fn test_parse_metafile() {
        let meta: Metafile = serde_yaml::from_str(SAMPLE).unwrap();
        assert_eq!(meta.name, "nginx");
        assert_eq!(meta.version, "1.24.0");
        assert_eq!(meta.stage, Stage::Normal);
        assert_eq!(meta.sources.len(), 1);
        assert_eq!(meta.patches, vec!["nginx-headers.patch"]);
        assert_eq!(meta.depends.build.len(), 3);
        assert_eq!(meta.depends.run.len(), 2);
        assert_eq!(meta.provides, vec!["webserver"]);
        assert_eq!(meta.environment.get("CFLAGS").unwrap(), "-O2");
        assert_eq!(meta.id().to_string(), "nginx-1.24.0");
    }

    #[test]
    fn test_default_commands() {
        let meta: Metafile = serde_yaml::from_str("name: hello\nversion: '1.0'\n").unwrap();
        let build = meta.build_commands();
        assert_eq!(build[0], "./configure --prefix=/usr");
        assert_eq!(build[1], "make -j@MAKEJOBS@");
        assert_eq!(
            meta.install_commands(),
            vec!["make DESTDIR=@DESTDIR@ install"]
        );
    }

    #[test]
    fn test_multiline_commands() {
        let meta: Metafile = serde_yaml::from_str(
            "name: hello\nversion: '1.0'\ncommands:\n  build: |\n    ./autogen.sh\n    make\n",
        )
        .unwrap();
        assert_eq!(meta.build_commands(), vec!["./autogen.sh", "make"]);
    }

    #[test]
    fn test_interpolate() {
        let cmd = interpolate(
            "make -j@MAKEJOBS@ DESTDIR=@DESTDIR@ install",
            Path::new("/tmp/dest"),
            8,
        );
        assert_eq!(cmd, "make -j8 DESTDIR=/tmp/dest install");
    }

    #[test]
    fn test_missing_name_rejected() {
        let meta: std::result::Result<Metafile, _> = serde_yaml::from_str("version: '1.0'\n");
        assert!(meta.is_err() || meta.unwrap().validate().is_err());
    }

    #[test]
    fn test_find_metafile_conventional_layout() {
        let dir = tempfile::tempdir().unwrap();
        let pkg_dir = dir.path().join("hello");
        fs::create_dir_all(&pkg_dir).unwrap();
        fs::write(pkg_dir.join("metafile.yaml"), "name: hello\nversion: '1.0'\n").unwrap();

        let found = find_metafile(dir.path(), "hello").unwrap();
        assert_eq!(found, pkg_dir.join("metafile.yaml"));
    }

    #[test]
    fn test_find_metafile_by_walk() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("net/misc");
        fs::create_dir_all(&nested).unwrap();
        fs::write(nested.join("curl-8.yaml"), "name: curl\nversion: '8.0'\n").unwrap();

        let found = find_metafile(dir.path(), "curl").unwrap();
        assert_eq!(found, nested.join("curl-8.yaml"));
        assert!(find_metafile(dir.path(), "wget").is_err());
    }
}
