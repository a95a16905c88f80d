// src/hash.rs

//! SHA-256 helpers for file digests and integrity fingerprints

use crate::error::{Error, Result};
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io;
use std::path::Path;

/// Hex SHA-256 digest of a file, streamed
pub fn sha256_file(path: &Path) -> Result<String> {
    let mut file = File::open(path)
        .map_err(|e| Error::io(format!("opening {} for hashing", path.display()), e))?;
    let mut hasher = Sha256::new();
    io::copy(&mut file, &mut hasher)
        .map_err(|e| Error::io(format!("hashing {}", path.display()), e))?;
    Ok(format!("{:x}", hasher.finalize()))
}

/// Hex SHA-256 digest of a byte slice
pub fn sha256_bytes(data: &[u8]) -> String {
    format!("{:x}", Sha256::digest(data))
}

/// Order-independent fingerprint over a set of per-file hashes
///
/// Used by the upgrade driver to compare the installed file set before and
/// after an operation. The inputs are sorted so the fingerprint does not
/// depend on traversal order.
pub fn fingerprint<I, S>(hashes: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut sorted: Vec<String> = hashes.into_iter().map(|h| h.as_ref().to_string()).collect();
    sorted.sort();
    let mut hasher = Sha256::new();
    for h in &sorted {
        hasher.update(h.as_bytes());
        hasher.update(b"\n");
    }
    format!("{:x}", hasher.finalize())
}
