//! Core data model for backup runs.
//!
//! This module defines the main data structures shared across the engine:
//! - PairSettings / SettingsOverlay: resolved per-run configuration
//! - FileRecord: persisted per-file state backing incremental decisions
//! - RunSummary, RunError, RunOutcome: terminal result reporting
//! - FingerprintAlgorithm, ChangeDetection: change-detection strictness

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Resolved configuration for one backup pair, immutable once a run starts.
///
/// Built by [`PairSettings::resolve`] from up to two [`SettingsOverlay`]
/// layers: pair-specific values win over global values, which win over the
/// built-in defaults.
#[derive(Debug, Clone)]
pub struct PairSettings {
    /// Directory tree being backed up (and restored into)
    pub origin: PathBuf,

    /// Directory receiving the mirrored ciphertext tree
    pub destination: PathBuf,

    /// Track per-file state for incremental backups and selective restore
    pub use_state_store: bool,

    /// Persist a password verifier so later runs can detect password changes
    pub record_password: bool,

    /// Restore only filesystem attributes, never file content
    pub attributes_only: bool,

    /// Rebuild the state store from the restored tree after a restore
    pub write_store_on_restore: bool,

    /// How aggressively to look for changed files
    pub change_detection: ChangeDetection,

    /// Hash used for content fingerprints
    pub fingerprint: FingerprintAlgorithm,
}

impl PairSettings {
    /// Settings for a pair with built-in defaults for every flag.
    pub fn new(origin: impl Into<PathBuf>, destination: impl Into<PathBuf>) -> Self {
        PairSettings {
            origin: origin.into(),
            destination: destination.into(),
            use_state_store: true,
            record_password: true,
            attributes_only: false,
            write_store_on_restore: false,
            change_detection: ChangeDetection::Fast,
            fingerprint: FingerprintAlgorithm::Sha256,
        }
    }

    /// Resolve settings for a pair, applying overlays by precedence:
    /// pair-specific > global > built-in defaults.
    pub fn resolve(
        origin: impl Into<PathBuf>,
        destination: impl Into<PathBuf>,
        pair: Option<&SettingsOverlay>,
        global: Option<&SettingsOverlay>,
    ) -> Self {
        let mut settings = PairSettings::new(origin, destination);
        if let Some(overlay) = global {
            settings.apply(overlay);
        }
        if let Some(overlay) = pair {
            settings.apply(overlay);
        }
        settings
    }

    fn apply(&mut self, overlay: &SettingsOverlay) {
        if let Some(v) = overlay.use_state_store {
            self.use_state_store = v;
        }
        if let Some(v) = overlay.record_password {
            self.record_password = v;
        }
        if let Some(v) = overlay.attributes_only {
            self.attributes_only = v;
        }
        if let Some(v) = overlay.write_store_on_restore {
            self.write_store_on_restore = v;
        }
        if let Some(v) = overlay.change_detection {
            self.change_detection = v;
        }
        if let Some(v) = overlay.fingerprint {
            self.fingerprint = v;
        }
    }
}

/// A partial settings layer; unset fields fall through to the next layer.
///
/// Serializable so pair-specific and global overlays can be kept on disk by
/// the front-end configuration loader.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SettingsOverlay {
    pub use_state_store: Option<bool>,
    pub record_password: Option<bool>,
    pub attributes_only: Option<bool>,
    pub write_store_on_restore: Option<bool>,
    pub change_detection: Option<ChangeDetection>,
    pub fingerprint: Option<FingerprintAlgorithm>,
}

/// How a backup decides whether a file changed since the last run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeDetection {
    /// Trust size + modification time (cheap, may miss same-size edits)
    Fast,
    /// Re-hash content whenever size + mtime match the record
    Hash,
}

/// Supported content fingerprint algorithms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FingerprintAlgorithm {
    Sha256,
    Blake3,
}

impl fmt::Display for FingerprintAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sha256 => write!(f, "sha256"),
            Self::Blake3 => write!(f, "blake3"),
        }
    }
}

impl FingerprintAlgorithm {
    /// Parse algorithm from string
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "sha256" => Some(Self::Sha256),
            "blake3" => Some(Self::Blake3),
            _ => None,
        }
    }
}

/// Persisted metadata describing one file's last-known state at backup time.
///
/// An entry exists only for files whose ciphertext write was confirmed
/// complete; absence means "not yet backed up".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileRecord {
    /// File size in bytes at backup time
    pub size: u64,

    /// Modification time at backup time
    pub modified: DateTime<Utc>,

    /// Content fingerprint, `"algo:hex"`
    pub fingerprint: Option<String>,

    /// Hex-encoded per-file nonce prefix used for its ciphertext
    pub nonce: String,

    /// When this file was last successfully backed up
    pub backed_up_at: DateTime<Utc>,
}

/// Whether a run reached its natural end, aborted, or was cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// All files processed (some may have failed individually)
    Done,
    /// A fatal condition aborted the run
    Failed,
    /// The caller cancelled; committed work was kept
    Cancelled,
}

impl fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Done => write!(f, "done"),
            Self::Failed => write!(f, "failed"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// A single file's failure, kept for the terminal report.
#[derive(Debug, Clone)]
pub struct RunError {
    pub path: PathBuf,
    pub message: String,
}

impl RunError {
    pub fn new(path: impl AsRef<Path>, message: impl Into<String>) -> Self {
        RunError {
            path: path.as_ref().to_path_buf(),
            message: message.into(),
        }
    }
}

/// Terminal summary of a backup or restore run.
#[derive(Debug, Clone)]
pub struct RunSummary {
    /// Unique identifier for this run
    pub run_id: Uuid,

    pub outcome: RunOutcome,

    /// Files newly encrypted into the destination
    pub added: usize,

    /// Files re-encrypted because they changed
    pub updated: usize,

    /// Entries removed because the origin file disappeared
    pub removed: usize,

    /// Files left untouched because their record matched
    pub skipped: usize,

    /// Files decrypted (or attribute-restored) into the origin
    pub restored: usize,

    /// Per-file failures, with paths and causes
    pub errors: Vec<RunError>,

    pub elapsed: Duration,
}

impl RunSummary {
    pub fn new(run_id: Uuid) -> Self {
        RunSummary {
            run_id,
            outcome: RunOutcome::Done,
            added: 0,
            updated: 0,
            removed: 0,
            skipped: 0,
            restored: 0,
            errors: Vec::new(),
            elapsed: Duration::ZERO,
        }
    }

    /// True only for a clean run with zero per-file errors.
    pub fn is_clean(&self) -> bool {
        self.outcome == RunOutcome::Done && self.errors.is_empty()
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let status = match (self.outcome, self.errors.len()) {
            (RunOutcome::Done, 0) => "completed".to_string(),
            (RunOutcome::Done, n) => format!("completed with {} errors", n),
            (RunOutcome::Failed, _) => "failed".to_string(),
            (RunOutcome::Cancelled, _) => "cancelled".to_string(),
        };
        write!(
            f,
            "{}: {} added, {} updated, {} removed, {} skipped, {} restored in {:.1}s",
            status,
            self.added,
            self.updated,
            self.removed,
            self.skipped,
            self.restored,
            self.elapsed.as_secs_f64()
        )
    }
}
