// src/lib.rs

//! newpkg — source-based package manager
//!
//! Builds packages from YAML metafiles in a ports tree, stages them through
//! a checkpointed pipeline, and tracks the result in a JSON manifest
//! database.
//!
//! # Architecture
//!
//! - Manifest-first: one JSON manifest per installed package, with a
//!   derived index; the manifest directory is always authoritative
//! - Checkpointed pipeline: fetch, extract, patch, build, stage-install,
//!   package, deploy, register — resumable at every boundary
//! - Rollback: snapshots taken before every destructive upgrade step
//! - Bootstrap-aware: pass1/pass2 packages deploy into an LFS-style
//!   staging root behind a scoped bind-mount guard

pub mod archive;
pub mod chroot;
pub mod config;
pub mod db;
pub mod depclean;
mod error;
pub mod fetch;
pub mod fsutil;
pub mod graph;
pub mod hash;
pub mod hooks;
pub mod install;
pub mod lock;
pub mod manifest;
pub mod metafile;
pub mod package;
pub mod pipeline;
pub mod remove;
pub mod snapshot;
pub mod summary;
pub mod upgrade;
pub mod vcs;

pub use config::Config;
pub use db::{ManifestStore, VerifyIssue};
pub use depclean::{DepcleanMode, DepcleanOptions, depclean};
pub use error::{Error, Result};
pub use graph::DepGraph;
pub use install::{InstallOptions, install};
pub use manifest::{IndexEntry, Manifest, ManifestFile};
pub use metafile::Metafile;
pub use package::{Depends, PackageId, PackageQuery, Stage};
pub use pipeline::{BuildStage, Checkpoint, RunOptions, StageRunner};
pub use remove::{RemoveOptions, remove};
pub use snapshot::{Snapshot, SnapshotStore};
pub use summary::RunSummary;
pub use upgrade::{UpgradeOptions, upgrade};
