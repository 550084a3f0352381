//! # Encrypted Incremental Backup Engine
//!
//! A headless engine that backs a directory tree up to an encrypted
//! destination and restores it later. Designed as the foundation for
//! multiple front-ends (CLI, GUI, automation); no presentation code lives
//! here.
//!
//! ## Overview
//!
//! Every backup pair (origin directory, destination directory) carries a
//! persisted state store mapping relative paths to per-file records, which
//! is what makes repeated backups incremental: only new, changed, or
//! deleted files cause destination I/O. Files are encrypted independently
//! with a password-derived AES-256-GCM key; the password lifecycle
//! (derivation, persistence, mismatch detection) is handled per pair.
//!
//! The engine features:
//! - Incremental diffing with configurable strictness (cheap signatures or
//!   full content fingerprints)
//! - Streaming chunked encryption with per-file integrity verification
//! - Crash-safe commit ordering (ciphertext before record, atomic renames
//!   everywhere)
//! - Per-file error isolation: one bad file never aborts a run
//! - An ordered progress event stream decoupled from any UI technology
//! - Cooperative cancellation at file boundaries
//!
//! ## Basic Usage
//!
//! ```no_run
//! use engine::{run_backup, CancelToken, EventSink, PairSettings};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let settings = PairSettings::new("/home/me/documents", "/mnt/backup/documents");
//! let (events, receiver) = EventSink::channel();
//! let cancel = CancelToken::new();
//!
//! std::thread::spawn(move || {
//!     for event in receiver {
//!         println!("{}", event);
//!     }
//! });
//!
//! let summary = run_backup(&settings, "correct horse battery staple", &events, &cancel)?;
//! println!("{}", summary);
//! # Ok(())
//! # }
//! ```
//!
//! ## Modules
//!
//! - **model**: Core data structures (PairSettings, FileRecord, RunSummary)
//! - **error**: Error types and handling
//! - **keys**: Password-derived key management and mismatch detection
//! - **codec**: Per-file streaming encryption/decryption
//! - **store**: Persisted per-pair state store and run exclusivity
//! - **fs_ops**: Low-level filesystem operations
//! - **backup**: Backup engine (plan + run)
//! - **restore**: Restore engine
//! - **progress**: Progress event stream and cancellation

pub mod backup;
pub mod codec;
pub mod error;
pub mod fs_ops;
pub mod keys;
pub mod model;
pub mod progress;
pub mod restore;
pub mod store;

// Re-export main types and functions
pub use backup::{plan_backup, run_backup, BackupPlan, PlanAction, PlannedFile};
pub use codec::{decrypt_file, encrypt_file};
pub use error::EngineError;
pub use keys::{authorize, authorize_existing, derive_key, rekey, KeyFile, Verification};
pub use model::{
    ChangeDetection, FileRecord, FingerprintAlgorithm, PairSettings, RunError, RunOutcome,
    RunSummary, SettingsOverlay,
};
pub use progress::{CancelToken, EventSink, ProgressEvent, RunKind};
pub use restore::run_restore;
pub use store::{PairPaths, StateStore};
