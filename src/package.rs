// src/package.rs

//! Package identity, bootstrap stages, and dependency tokens
//!
//! The canonical identity of a package is `name-version`. Manifest files,
//! checkpoints, package archives, and snapshots all derive their filenames
//! from it, so parsing must round-trip exactly.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Identity of one package: a name plus an opaque version string
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PackageId {
    pub name: String,
    pub version: String,
}

impl PackageId {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
        }
    }

    /// Stable manifest filename for this package
    pub fn manifest_filename(&self) -> String {
        format!("{self}.json")
    }

    /// Stable checkpoint filename for this package
    pub fn state_filename(&self) -> String {
        format!("{self}.state")
    }
}

impl fmt::Display for PackageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.name, self.version)
    }
}

impl FromStr for PackageId {
    type Err = Error;

    /// Parse `name-version`. The split point is the last `-` whose suffix
    /// starts with a digit, so hyphenated names like `linux-headers-6.1`
    /// parse as expected.
    fn from_str(s: &str) -> Result<Self> {
        for (idx, _) in s.match_indices('-').collect::<Vec<_>>().into_iter().rev() {
            let (name, rest) = s.split_at(idx);
            let version = &rest[1..];
            if !name.is_empty() && version.chars().next().is_some_and(|c| c.is_ascii_digit()) {
                return Ok(Self::new(name, version));
            }
        }
        Err(Error::Malformed(format!(
            "'{s}' is not a name-version package identifier"
        )))
    }
}

/// A query that is either a full `name-version` identity or a bare name
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PackageQuery {
    Exact(PackageId),
    Name(String),
}

impl PackageQuery {
    /// Interpret a user-supplied string. Anything that parses as
    /// `name-version` is treated as exact; the rest is a name filter.
    pub fn parse(s: &str) -> Self {
        match PackageId::from_str(s) {
            Ok(id) => PackageQuery::Exact(id),
            Err(_) => PackageQuery::Name(s.to_string()),
        }
    }

    pub fn name(&self) -> &str {
        match self {
            PackageQuery::Exact(id) => &id.name,
            PackageQuery::Name(n) => n,
        }
    }
}

impl fmt::Display for PackageQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PackageQuery::Exact(id) => write!(f, "{id}"),
            PackageQuery::Name(n) => write!(f, "{n}"),
        }
    }
}

/// Bootstrap stage a package builds in
///
/// `pass1` and `pass2` deploy into the LFS staging root; `normal` packages
/// deploy into the live system root.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Pass1,
    Pass2,
    #[default]
    Normal,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Pass1 => "pass1",
            Stage::Pass2 => "pass2",
            Stage::Normal => "normal",
        }
    }

    /// True when the package deploys into the LFS staging root
    pub fn is_bootstrap(&self) -> bool {
        matches!(self, Stage::Pass1 | Stage::Pass2)
    }
}

impl FromStr for Stage {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pass1" => Ok(Stage::Pass1),
            "pass2" => Ok(Stage::Pass2),
            "normal" => Ok(Stage::Normal),
            other => Err(Error::Usage(format!(
                "unknown stage '{other}' (expected pass1, pass2, or normal)"
            ))),
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Build- and run-time dependency lists as they appear in metafiles and
/// manifests
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Depends {
    #[serde(default)]
    pub build: Vec<String>,
    #[serde(default)]
    pub run: Vec<String>,
}

impl Depends {
    pub fn is_empty(&self) -> bool {
        self.build.is_empty() && self.run.is_empty()
    }

    /// Iterate the union of build and run dependency tokens
    pub fn all(&self) -> impl Iterator<Item = &str> {
        self.build.iter().chain(self.run.iter()).map(String::as_str)
    }
}

/// Strip a version predicate from a dependency token
///
/// `libfoo>=1.0` -> `libfoo`. Only the unqualified name participates in
/// graph edges; the predicate is kept for display purposes by callers that
/// need it.
pub fn dep_name(token: &str) -> &str {
    let end = token
        .find(|c| matches!(c, '>' | '<' | '=' | ' '))
        .unwrap_or(token.len());
    &token[..end]
}

/// Compare two opaque version strings
///
/// Segments split on `.`, `-`, and `_` compare numerically when both sides
/// are numeric, lexicographically otherwise. More segments wins a tie. This
/// is only used to pick the "highest" version among duplicates; ordering
/// beyond that is not load-bearing.
pub fn compare_versions(a: &str, b: &str) -> std::cmp::Ordering {
    let split = |v: &str| -> Vec<String> {
        v.split(['.', '-', '_']).map(str::to_string).collect()
    };
    let (sa, sb) = (split(a), split(b));
    for (x, y) in sa.iter().zip(sb.iter()) {
        let ord = match (x.parse::<u64>(), y.parse::<u64>()) {
            (Ok(nx), Ok(ny)) => nx.cmp(&ny),
            _ => x.cmp(y),
        };
        if ord != std::cmp::Ordering::Equal {
            return ord;
        }
    }
    sa.len().cmp(&sb.len())
}
