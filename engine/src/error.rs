//! Error types for the backup engine.
//!
//! The primary error type is `EngineError`, which represents run-level errors
//! that prevent a backup or restore from executing (or force it to abort).
//! Per-file failures are not `EngineError`s: they are recorded in the run
//! summary and processing continues with the next file.

use std::error::Error;
use std::fmt::{self, Display};
use std::io;
use std::path::PathBuf;

/// Errors that abort a run or prevent it from starting.
///
/// Anything that only affects a single file (an unreadable source file, a
/// corrupt ciphertext during restore) is captured as a `RunError` in the
/// summary instead, so one bad file never unwinds the whole run.
#[derive(Debug)]
pub enum EngineError {
    /// Origin directory does not exist
    OriginNotFound { path: PathBuf },

    /// A supplied path is unusable for the requested operation
    InvalidPath { path: PathBuf, reason: String },

    /// File or directory I/O failed
    Io { path: PathBuf, source: io::Error },

    /// The password does not match the recorded verifier for this pair
    KeyMismatch,

    /// Authentication tag check failed: wrong key or corrupted ciphertext
    Integrity { path: PathBuf },

    /// No key record exists for this pair, so the key cannot be re-derived
    KeyRecordMissing { path: PathBuf },

    /// The persisted state store (or key record) exists but cannot be parsed
    StateStoreCorrupt { path: PathBuf, reason: String },

    /// Another run against the same backup pair is already active
    PairBusy { pair_id: String },

    /// A cryptographic primitive failed (KDF parameters, cipher init)
    Crypto { message: String },

    /// The run was cancelled by the caller
    Cancelled,
}

impl Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OriginNotFound { path } => {
                write!(f, "Origin directory not found: {}", path.display())
            }
            Self::InvalidPath { path, reason } => {
                write!(f, "Invalid path: {} ({})", path.display(), reason)
            }
            Self::Io { path, source } => {
                write!(f, "I/O error on {}: {}", path.display(), source)
            }
            Self::KeyMismatch => {
                write!(f, "Password does not match the one recorded for this backup pair")
            }
            Self::Integrity { path } => {
                write!(
                    f,
                    "Integrity check failed for {} (wrong password or corrupted file)",
                    path.display()
                )
            }
            Self::KeyRecordMissing { path } => {
                write!(f, "No key record found at {}", path.display())
            }
            Self::StateStoreCorrupt { path, reason } => {
                write!(f, "State store unreadable: {} ({})", path.display(), reason)
            }
            Self::PairBusy { pair_id } => {
                write!(f, "Another run is already active for pair {}", pair_id)
            }
            Self::Crypto { message } => {
                write!(f, "Cryptographic failure: {}", message)
            }
            Self::Cancelled => write!(f, "Run cancelled"),
        }
    }
}

impl Error for EngineError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Io { source, .. } => Some(source),
            _ => None,
        }
    }
}

impl EngineError {
    /// Attach a path to an `io::Error`.
    pub fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        EngineError::Io {
            path: path.into(),
            source,
        }
    }

    /// Extract the OS error code, if available.
    pub fn raw_os_error(&self) -> Option<u32> {
        match self {
            Self::Io { source, .. } => source.raw_os_error().map(|e| e as u32),
            _ => None,
        }
    }

    /// True for errors that must abort the run rather than skip a file.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::OriginNotFound { .. }
                | Self::InvalidPath { .. }
                | Self::KeyMismatch
                | Self::KeyRecordMissing { .. }
                | Self::StateStoreCorrupt { .. }
                | Self::PairBusy { .. }
                | Self::Cancelled
        )
    }
}
