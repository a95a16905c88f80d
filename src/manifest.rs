// src/manifest.rs

//! Manifest and index records: the canonical description of an installed
//! package
//!
//! A manifest is one JSON file per installed package. The index is a derived
//! array of compact entries used for fast listing and dependency queries;
//! the manifest directory remains authoritative.

use crate::error::{Error, Result};
use crate::metafile::Metafile;
use crate::package::{Depends, PackageId, Stage};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// One file owned by a package
///
/// Manifests written by newpkg always carry hash and size, but hand-written
/// or migrated manifests may list bare paths, so both shapes deserialize.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ManifestFile {
    Path(String),
    Detailed {
        path: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sha256: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        size: Option<u64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        mode: Option<u32>,
    },
}

impl ManifestFile {
    pub fn path(&self) -> &str {
        match self {
            ManifestFile::Path(p) => p,
            ManifestFile::Detailed { path, .. } => path,
        }
    }

    pub fn sha256(&self) -> Option<&str> {
        match self {
            ManifestFile::Path(_) => None,
            ManifestFile::Detailed { sha256, .. } => sha256.as_deref(),
        }
    }

    pub fn size(&self) -> Option<u64> {
        match self {
            ManifestFile::Path(_) => None,
            ManifestFile::Detailed { size, .. } => *size,
        }
    }
}

/// Canonical record of an installed package
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    pub name: String,
    pub version: String,

    #[serde(default)]
    pub stage: Stage,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub install_prefix: Option<String>,

    pub files: Vec<ManifestFile>,

    #[serde(default)]
    pub depends: Depends,

    #[serde(default)]
    pub provides: Vec<String>,

    /// UTC build timestamp, RFC 3339
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build_date: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Packages whose file ownership this manifest may take over
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub replaces: Vec<String>,
}

impl Manifest {
    pub fn id(&self) -> PackageId {
        PackageId::new(&self.name, &self.version)
    }

    /// Parse and validate a manifest from a JSON file
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .map_err(|e| Error::io(format!("reading manifest {}", path.display()), e))?;
        let manifest: Manifest = serde_json::from_str(&text).map_err(|e| {
            Error::Malformed(format!("manifest {}: {e}", path.display()))
        })?;
        manifest.validate()?;
        Ok(manifest)
    }

    /// Check the required fields (`name`, `version`, `files`)
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(Error::Malformed("manifest has empty name".into()));
        }
        if self.version.is_empty() {
            return Err(Error::Malformed(format!(
                "manifest for '{}' has empty version",
                self.name
            )));
        }
        for f in &self.files {
            if f.path().is_empty() {
                return Err(Error::Malformed(format!(
                    "manifest {} lists an empty file path",
                    self.id()
                )));
            }
        }
        Ok(())
    }

    /// Start a manifest from recipe metadata; files are filled in by the
    /// register stage
    pub fn from_metafile(meta: &Metafile) -> Self {
        Self {
            name: meta.name.clone(),
            version: meta.version.clone(),
            stage: meta.stage,
            origin: meta.origin.clone(),
            install_prefix: meta.install_prefix.clone(),
            files: Vec::new(),
            depends: meta.depends.clone(),
            provides: meta.provides.clone(),
            build_date: Some(Utc::now()),
            description: meta.description.clone(),
            replaces: Vec::new(),
        }
    }

    /// Iterate the owned file paths
    pub fn file_paths(&self) -> impl Iterator<Item = &str> {
        self.files.iter().map(ManifestFile::path)
    }
}

/// Compact index entry derived from one manifest
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexEntry {
    pub name: String,
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<String>,
    #[serde(default)]
    pub provides: Vec<String>,
    #[serde(default)]
    pub depends: Depends,
    #[serde(default)]
    pub stage: Stage,
    /// The manifest's stable filename, `name-version.json`
    pub manifest: String,
}

impl IndexEntry {
    pub fn from_manifest(m: &Manifest) -> Self {
        Self {
            name: m.name.clone(),
            version: m.version.clone(),
            origin: m.origin.clone(),
            provides: m.provides.clone(),
            depends: m.depends.clone(),
            stage: m.stage,
            manifest: m.id().manifest_filename(),
        }
    }

    pub fn id(&self) -> PackageId {
        PackageId::new(&self.name, &self.version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manifest_file_shapes() {
        let json = r#"{
            "name": "alpha",
            "version": "1.0",
            "files": [
                "/usr/bin/alpha",
                {"path": "/usr/share/alpha/data", "sha256": "ab12", "size": 42, "mode": 420}
            ]
        }"#;
        let m: Manifest = serde_json::from_str(json).unwrap();
        assert_eq!(m.files.len(), 2);
        assert_eq!(m.files[0].path(), "/usr/bin/alpha");
        assert_eq!(m.files[0].sha256(), None);
        assert_eq!(m.files[1].sha256(), Some("ab12"));
        assert_eq!(m.files[1].size(), Some(42));
    }

    #[test]
    fn test_validate_rejects_missing_fields() {
        let m: Manifest =
            serde_json::from_str(r#"{"name": "", "version": "1.0", "files": []}"#).unwrap();
        assert!(m.validate().is_err());

        let m: Manifest =
            serde_json::from_str(r#"{"name": "a", "version": "", "files": []}"#).unwrap();
        assert!(m.validate().is_err());
    }

    #[test]
    fn test_index_entry_from_manifest() {
        let m: Manifest = serde_json::from_str(
            r#"{"name": "alpha", "version": "1.0", "files": ["/usr/bin/alpha"],
                "provides": ["letters"], "depends": {"run": ["beta"]}}"#,
        )
        .unwrap();
        let e = IndexEntry::from_manifest(&m);
        assert_eq!(e.manifest, "alpha-1.0.json");
        assert_eq!(e.provides, vec!["letters"]);
        assert_eq!(e.depends.run, vec!["beta"]);
    }

    #[test]
    fn test_detailed_serializes_without_nulls() {
        let f = ManifestFile::Detailed {
            path: "/usr/bin/x".into(),
            sha256: None,
            size: None,
            mode: None,
        };
        let json = serde_json::to_string(&f).unwrap();
        assert!(!json.contains("null"));
    }
}
