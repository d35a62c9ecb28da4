//! SHA-256 verification of downloaded payloads

use sha2::{Digest, Sha256};
use std::fs::File;
use std::io;
use std::path::Path;
use walkdir::WalkDir;

use crate::install::error::InstallError;

/// Digest of a file, or of every file below a directory in path order
///
/// A single file hashes its bytes only, so it matches a published archive
/// checksum. A directory hashes each regular file as its relative path with
/// `/` separators, then its byte length as little-endian `u64`, then its
/// contents.
pub fn payload_digest(path: &Path) -> io::Result<String> {
    let mut hasher = Sha256::new();

    if path.is_dir() {
        for entry in WalkDir::new(path).sort_by_file_name() {
            let entry = entry.map_err(io::Error::other)?;
            if !entry.file_type().is_file() {
                continue;
            }
            let relative = entry
                .path()
                .strip_prefix(path)
                .map_err(io::Error::other)?;
            let len = entry.metadata().map_err(io::Error::other)?.len();

            hasher.update(relative_name(relative).as_bytes());
            hasher.update(len.to_le_bytes());
            io::copy(&mut File::open(entry.path())?, &mut hasher)?;
        }
    } else {
        io::copy(&mut File::open(path)?, &mut hasher)?;
    }

    Ok(format!("{:x}", hasher.finalize()))
}

fn relative_name(relative: &Path) -> String {
    relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

/// Expected directory digest for `files` given as `(relative path, contents)`
#[cfg(test)]
pub(crate) fn tree_digest(files: &[(&str, &[u8])]) -> String {
    let mut files = files.to_vec();
    files.sort_by(|a, b| a.0.split('/').cmp(b.0.split('/')));

    let mut hasher = Sha256::new();
    for (name, contents) in files {
        hasher.update(name.as_bytes());
        hasher.update((contents.len() as u64).to_le_bytes());
        hasher.update(contents);
    }
    format!("{:x}", hasher.finalize())
}

/// Compare the payload digest against `expected` (hex, case-insensitive)
pub fn verify(path: &Path, expected: &str) -> Result<(), InstallError> {
    let actual = payload_digest(path)?;
    if actual.eq_ignore_ascii_case(expected.trim()) {
        Ok(())
    } else {
        Err(InstallError::IntegrityCheckFailure {
            path: path.to_path_buf(),
            expected: expected.trim().to_string(),
            actual,
        })
    }
}
