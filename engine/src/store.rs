//! Persisted per-pair state store.
//!
//! One JSON document per backup pair, kept inside the destination under
//! `.backup-state/`, at a path derived deterministically from the pair's
//! (origin, destination) identity. The store is the commit record for
//! incremental decisions: an entry is written only after the file's
//! ciphertext is confirmed on disk, and the document itself is only ever
//! replaced by an atomic rename, never edited in place.

use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, OnceLock};

use sha2::{Digest, Sha256};

use crate::error::EngineError;
use crate::fs_ops;
use crate::keys;
use crate::model::FileRecord;

/// Directory under the destination holding the store and key record.
pub const META_DIR: &str = ".backup-state";

/// Derived on-disk locations for one backup pair.
#[derive(Debug, Clone)]
pub struct PairPaths {
    /// Short stable identifier for the pair, used in file names and the
    /// run-exclusivity registry
    pub pair_id: String,

    pub meta_dir: PathBuf,
    pub state_file: PathBuf,
    pub key_file: PathBuf,
}

impl PairPaths {
    /// Derive the pair's paths from its (origin, destination) identity.
    pub fn derive(origin: &Path, destination: &Path) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(origin.to_string_lossy().as_bytes());
        hasher.update(b"\n");
        hasher.update(destination.to_string_lossy().as_bytes());
        let digest = hasher.finalize();
        let pair_id = keys::encode_hex(&digest[..8]);

        let meta_dir = destination.join(META_DIR);
        PairPaths {
            state_file: meta_dir.join(format!("state-{}.json", pair_id)),
            key_file: meta_dir.join(format!("key-{}.json", pair_id)),
            meta_dir,
            pair_id,
        }
    }
}

/// Ordered mapping of relative path to [`FileRecord`] for one pair.
#[derive(Debug)]
pub struct StateStore {
    path: PathBuf,
    entries: BTreeMap<String, FileRecord>,
}

impl StateStore {
    /// Load the store for a pair; a pair that was never backed up gets an
    /// empty store.
    ///
    /// # Errors
    /// `EngineError::StateStoreCorrupt` if the file exists but cannot be
    /// parsed: guessing state would risk both missed and phantom backups, so
    /// the run must abort.
    pub fn load(paths: &PairPaths) -> Result<StateStore, EngineError> {
        let entries = match fs::read(&paths.state_file) {
            Ok(bytes) => {
                serde_json::from_slice(&bytes).map_err(|e| EngineError::StateStoreCorrupt {
                    path: paths.state_file.clone(),
                    reason: e.to_string(),
                })?
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(EngineError::io(&paths.state_file, e)),
        };
        Ok(StateStore {
            path: paths.state_file.clone(),
            entries,
        })
    }

    /// An empty in-memory store for runs that opt out of state tracking.
    pub fn detached(paths: &PairPaths) -> StateStore {
        StateStore {
            path: paths.state_file.clone(),
            entries: BTreeMap::new(),
        }
    }

    pub fn lookup(&self, rel_path: &str) -> Option<&FileRecord> {
        self.entries.get(rel_path)
    }

    pub fn upsert(&mut self, rel_path: impl Into<String>, record: FileRecord) {
        self.entries.insert(rel_path.into(), record);
    }

    /// Remove an entry; returns whether it existed.
    pub fn remove(&mut self, rel_path: &str) -> bool {
        self.entries.remove(rel_path).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &FileRecord)> {
        self.entries.iter()
    }

    /// Relative paths currently recorded, for diffing against a scan.
    pub fn paths(&self) -> impl Iterator<Item = &String> {
        self.entries.keys()
    }

    /// Write the store durably: temp file in the same directory, fsync,
    /// atomic rename. A crash mid-persist leaves the previous valid store.
    pub fn persist(&self) -> Result<(), EngineError> {
        let bytes =
            serde_json::to_vec_pretty(&self.entries).map_err(|e| EngineError::StateStoreCorrupt {
                path: self.path.clone(),
                reason: e.to_string(),
            })?;
        fs_ops::atomic_write(&self.path, &bytes)
    }

    /// Explicitly delete a pair's persisted store. Destructive and
    /// separately authorized: the next backup treats every file as new.
    /// Returns whether a store file existed.
    pub fn delete(paths: &PairPaths) -> Result<bool, EngineError> {
        match fs::remove_file(&paths.state_file) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(EngineError::io(&paths.state_file, e)),
        }
    }

    pub fn exists(paths: &PairPaths) -> bool {
        paths.state_file.exists()
    }
}

/// Process-wide guard making runs per pair mutually exclusive.
///
/// The destination tree and the store file tolerate only one writer; a
/// second run against the same pair is rejected with `PairBusy` rather than
/// queued.
pub struct PairLock {
    pair_id: String,
}

fn active_pairs() -> &'static Mutex<HashSet<String>> {
    static ACTIVE: OnceLock<Mutex<HashSet<String>>> = OnceLock::new();
    ACTIVE.get_or_init(|| Mutex::new(HashSet::new()))
}

impl PairLock {
    pub fn acquire(pair_id: &str) -> Result<PairLock, EngineError> {
        let mut active = match active_pairs().lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if !active.insert(pair_id.to_string()) {
            return Err(EngineError::PairBusy {
                pair_id: pair_id.to_string(),
            });
        }
        Ok(PairLock {
            pair_id: pair_id.to_string(),
        })
    }
}

impl Drop for PairLock {
    fn drop(&mut self) {
        let mut active = match active_pairs().lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        active.remove(&self.pair_id);
    }
}
