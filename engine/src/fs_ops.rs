//! Filesystem operations module.
//!
//! This module provides low-level operations for:
//! - Enumerating directory trees into relative-path entries
//! - Streaming content fingerprints
//! - Atomic file promotion (temp file + rename, never in place)
//! - Modification-time preservation

use std::fs;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use chrono::{DateTime, Utc};
use sha2::Digest;

use crate::error::EngineError;
use crate::model::FingerprintAlgorithm;

/// One file found while walking a tree.
///
/// `rel_path` always uses `/` separators so records stay portable across
/// platforms; [`rel_to_path`] maps back to a native path.
#[derive(Debug, Clone)]
pub struct ScannedFile {
    /// Path relative to the scanned root, `/`-separated
    pub rel_path: String,

    /// File size in bytes
    pub size: u64,

    /// Modification time
    pub modified: DateTime<Utc>,
}

/// Join a `/`-separated relative path onto a root directory.
pub fn rel_to_path(root: &Path, rel: &str) -> PathBuf {
    let mut path = root.to_path_buf();
    for part in rel.split('/') {
        path.push(part);
    }
    path
}

/// Enumerate all regular files under `root`, recursively.
///
/// Directories are not returned as entries; they are implied by the relative
/// paths and recreated on demand. The directory whose full path equals
/// `skip` is not descended into (used to keep the destination's state-store
/// directory out of scans). Only that exact path is excluded; user
/// directories that happen to share its name are enumerated like any other.
///
/// # Errors
/// Returns `EngineError::Io` if enumeration fails at any level; a tree that
/// cannot be listed is a fatal condition, not a per-file one.
pub fn enumerate_tree(root: &Path, skip: Option<&Path>) -> Result<Vec<ScannedFile>, EngineError> {
    let mut items = Vec::new();

    fn recurse(
        path: &Path,
        rel: &str,
        skip: Option<&Path>,
        items: &mut Vec<ScannedFile>,
    ) -> Result<(), EngineError> {
        let entries = fs::read_dir(path).map_err(|e| EngineError::io(path, e))?;
        for entry in entries {
            let entry = entry.map_err(|e| EngineError::io(path, e))?;
            let metadata = entry.metadata().map_err(|e| EngineError::io(entry.path(), e))?;

            let name = entry.file_name();
            let name = name.to_string_lossy();
            let child_rel = if rel.is_empty() {
                name.to_string()
            } else {
                format!("{}/{}", rel, name)
            };

            if metadata.is_dir() {
                let child = entry.path();
                if Some(child.as_path()) == skip {
                    continue;
                }
                recurse(&child, &child_rel, skip, items)?;
            } else if metadata.is_file() {
                let modified = metadata
                    .modified()
                    .map_err(|e| EngineError::io(entry.path(), e))?;
                items.push(ScannedFile {
                    rel_path: child_rel,
                    size: metadata.len(),
                    modified: DateTime::<Utc>::from(modified),
                });
            }
            // Symlinks and other special files are ignored.
        }
        Ok(())
    }

    recurse(root, "", skip, &mut items)?;
    items.sort_by(|a, b| a.rel_path.cmp(&b.rel_path));
    Ok(items)
}

/// Ensure the parent directory of a path exists, creating it if necessary.
pub fn ensure_parent_dir_exists(path: &Path) -> Result<(), EngineError> {
    if let Some(parent) = path.parent() {
        if parent.as_os_str().is_empty() {
            return Ok(());
        }
        fs::create_dir_all(parent).map_err(|e| EngineError::io(parent, e))?;
    }
    Ok(())
}

/// Write `bytes` to `path` atomically: a temp file in the same directory is
/// fully written, then renamed over the target. A crash leaves either the
/// previous file or the complete new one.
pub fn atomic_write(path: &Path, bytes: &[u8]) -> Result<(), EngineError> {
    ensure_parent_dir_exists(path)?;
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(|e| EngineError::io(dir, e))?;
    io::Write::write_all(&mut tmp, bytes).map_err(|e| EngineError::io(path, e))?;
    tmp.as_file()
        .sync_all()
        .map_err(|e| EngineError::io(path, e))?;
    tmp.persist(path)
        .map_err(|e| EngineError::io(path, e.error))?;
    Ok(())
}

/// Apply a recorded modification time to a file or directory.
pub fn set_modified(path: &Path, modified: DateTime<Utc>) -> Result<(), EngineError> {
    let system: SystemTime = modified.into();
    filetime::set_file_mtime(path, filetime::FileTime::from_system_time(system))
        .map_err(|e| EngineError::io(path, e))
}

/// Incremental content fingerprint, fed chunk by chunk.
pub enum FingerprintHasher {
    Sha256(sha2::Sha256),
    Blake3(Box<blake3::Hasher>),
}

impl FingerprintHasher {
    pub fn new(algorithm: FingerprintAlgorithm) -> Self {
        match algorithm {
            FingerprintAlgorithm::Sha256 => Self::Sha256(sha2::Sha256::default()),
            FingerprintAlgorithm::Blake3 => Self::Blake3(Box::new(blake3::Hasher::new())),
        }
    }

    pub fn update(&mut self, data: &[u8]) {
        match self {
            Self::Sha256(h) => h.update(data),
            Self::Blake3(h) => {
                h.update(data);
            }
        }
    }

    /// Finish and render as `"algo:hex"`.
    pub fn finalize(self) -> String {
        match self {
            Self::Sha256(h) => format!("sha256:{:x}", h.finalize()),
            Self::Blake3(h) => format!("blake3:{}", h.finalize().to_hex()),
        }
    }
}

/// Compute the fingerprint of a file by streaming its content.
pub fn fingerprint_file(
    path: &Path,
    algorithm: FingerprintAlgorithm,
) -> Result<String, EngineError> {
    let mut file = fs::File::open(path).map_err(|e| EngineError::io(path, e))?;
    let mut hasher = FingerprintHasher::new(algorithm);
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf).map_err(|e| EngineError::io(path, e))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hasher.finalize())
}
