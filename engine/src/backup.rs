//! Backup engine: diff the origin tree against the state store, encrypt
//! what changed, and commit state per file.
//!
//! A run moves through Scanning (plan), PerFileEncrypt (execute), and
//! Finalizing (persist + summary). Per-file failures are recorded and the
//! run keeps going; only a missing origin, an unusable key, or a corrupt or
//! unwritable store aborts it.

use std::collections::BTreeSet;
use std::fs;
use std::time::Instant;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::codec;
use crate::error::EngineError;
use crate::fs_ops::{self, rel_to_path};
use crate::keys;
use crate::model::{ChangeDetection, FileRecord, PairSettings, RunError, RunOutcome, RunSummary};
use crate::progress::{CancelToken, EventSink, ProgressEvent, RunKind};
use crate::store::{PairLock, PairPaths, StateStore, META_DIR};

/// What the scan decided for one relative path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanAction {
    /// No record exists; encrypt for the first time
    Add,
    /// The record no longer matches; re-encrypt
    Update,
    /// Recorded but gone from the origin; drop ciphertext and record
    Remove,
    /// Record matches; no I/O
    Skip,
}

#[derive(Debug, Clone)]
pub struct PlannedFile {
    pub rel_path: String,
    pub size: u64,
    pub modified: DateTime<Utc>,
    pub action: PlanAction,
}

/// Output of the Scanning state.
#[derive(Debug)]
pub struct BackupPlan {
    pub files: Vec<PlannedFile>,
}

impl BackupPlan {
    pub fn count(&self, action: PlanAction) -> usize {
        self.files.iter().filter(|f| f.action == action).count()
    }
}

/// Walk the origin and diff every file against the store.
///
/// The cheap signature is size + modification time; `ChangeDetection::Hash`
/// additionally re-fingerprints files whose cheap signature matches, trading
/// a full read for immunity to same-size same-mtime edits.
pub fn plan_backup(settings: &PairSettings, store: &StateStore) -> Result<BackupPlan, EngineError> {
    // The state-store directory lives under the destination; it is excluded
    // by its exact path so it stays out of the scan when the destination is
    // nested inside the origin, while origin directories that merely share
    // its name are backed up like everything else.
    let meta_dir = settings.destination.join(META_DIR);
    let scanned = fs_ops::enumerate_tree(&settings.origin, Some(meta_dir.as_path()))?;

    let mut files = Vec::with_capacity(scanned.len());
    let mut seen = BTreeSet::new();
    for file in &scanned {
        seen.insert(file.rel_path.clone());
        let action = match store.lookup(&file.rel_path) {
            None => PlanAction::Add,
            Some(record) => {
                if record.size != file.size || record.modified != file.modified {
                    PlanAction::Update
                } else if settings.change_detection == ChangeDetection::Hash {
                    let origin_path = rel_to_path(&settings.origin, &file.rel_path);
                    match (
                        fs_ops::fingerprint_file(&origin_path, settings.fingerprint),
                        &record.fingerprint,
                    ) {
                        (Ok(current), Some(recorded)) if &current == recorded => PlanAction::Skip,
                        // Unknown or unreadable content: re-encrypt rather
                        // than risk a missed change.
                        _ => PlanAction::Update,
                    }
                } else {
                    PlanAction::Skip
                }
            }
        };
        files.push(PlannedFile {
            rel_path: file.rel_path.clone(),
            size: file.size,
            modified: file.modified,
            action,
        });
    }

    for rel_path in store.paths() {
        if !seen.contains(rel_path) {
            files.push(PlannedFile {
                rel_path: rel_path.clone(),
                size: 0,
                modified: Utc::now(),
                action: PlanAction::Remove,
            });
        }
    }

    Ok(BackupPlan { files })
}

/// Execute a full backup run for a pair.
///
/// Commit ordering per file: ciphertext is written and atomically renamed
/// first, the store entry second, so the store never claims a file that is
/// not actually backed up. The store itself is persisted once at finalize
/// (and after cancellation, covering the files already committed).
pub fn run_backup(
    settings: &PairSettings,
    password: &str,
    events: &EventSink,
    cancel: &CancelToken,
) -> Result<RunSummary, EngineError> {
    match fs::metadata(&settings.origin) {
        Ok(metadata) if metadata.is_dir() => {}
        Ok(_) => {
            return Err(EngineError::InvalidPath {
                path: settings.origin.clone(),
                reason: "origin must be a directory".to_string(),
            })
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(EngineError::OriginNotFound {
                path: settings.origin.clone(),
            })
        }
        Err(e) => return Err(EngineError::io(&settings.origin, e)),
    }

    let paths = PairPaths::derive(&settings.origin, &settings.destination);
    let _lock = PairLock::acquire(&paths.pair_id)?;

    // Key mismatch is fatal here, before any file is touched.
    let key = keys::authorize(&paths.key_file, password, settings.record_password)?;

    let mut store = if settings.use_state_store {
        StateStore::load(&paths)?
    } else {
        StateStore::detached(&paths)
    };

    let plan = plan_backup(settings, &store)?;
    let run_id = Uuid::new_v4();
    let started = Instant::now();
    tracing::info!(
        run_id = %run_id,
        origin = %settings.origin.display(),
        destination = %settings.destination.display(),
        files = plan.files.len(),
        "backup run starting"
    );
    events.emit(ProgressEvent::RunStarted {
        run_id,
        kind: RunKind::Backup,
        origin: settings.origin.display().to_string(),
        destination: settings.destination.display().to_string(),
        total_files: plan.files.len(),
    });

    let mut summary = RunSummary::new(run_id);
    for planned in &plan.files {
        if cancel.is_cancelled() {
            summary.outcome = RunOutcome::Cancelled;
            break;
        }

        match planned.action {
            PlanAction::Skip => {
                summary.skipped += 1;
                events.emit(ProgressEvent::FileCompleted {
                    rel_path: planned.rel_path.clone(),
                    action: "skipped",
                    detail: None,
                });
            }
            PlanAction::Remove => {
                let dst = rel_to_path(&settings.destination, &planned.rel_path);
                let removed = match fs::remove_file(&dst) {
                    Ok(()) => true,
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => true,
                    Err(e) => {
                        tracing::warn!(path = %dst.display(), error = %e, "removal failed");
                        summary
                            .errors
                            .push(RunError::new(&dst, format!("removal failed: {}", e)));
                        events.emit(ProgressEvent::FileCompleted {
                            rel_path: planned.rel_path.clone(),
                            action: "failed",
                            detail: Some(e.to_string()),
                        });
                        false
                    }
                };
                if removed {
                    // The ciphertext is gone; only now may the record go.
                    store.remove(&planned.rel_path);
                    summary.removed += 1;
                    events.emit(ProgressEvent::FileCompleted {
                        rel_path: planned.rel_path.clone(),
                        action: "removed",
                        detail: None,
                    });
                }
            }
            PlanAction::Add | PlanAction::Update => {
                events.emit(ProgressEvent::FileStarted {
                    rel_path: planned.rel_path.clone(),
                });
                let src = rel_to_path(&settings.origin, &planned.rel_path);
                let dst = rel_to_path(&settings.destination, &planned.rel_path);
                match codec::encrypt_file(&src, &dst, &key, settings.fingerprint) {
                    Ok(outcome) => {
                        // Ciphertext rename confirmed; commit the record.
                        store.upsert(
                            planned.rel_path.clone(),
                            FileRecord {
                                size: outcome.bytes,
                                modified: planned.modified,
                                fingerprint: Some(outcome.fingerprint),
                                nonce: outcome.nonce,
                                backed_up_at: Utc::now(),
                            },
                        );
                        let action = if planned.action == PlanAction::Add {
                            summary.added += 1;
                            "added"
                        } else {
                            summary.updated += 1;
                            "updated"
                        };
                        events.emit(ProgressEvent::FileCompleted {
                            rel_path: planned.rel_path.clone(),
                            action,
                            detail: None,
                        });
                    }
                    Err(e) => {
                        tracing::warn!(path = %src.display(), error = %e, "encryption failed");
                        summary.errors.push(RunError::new(&src, e.to_string()));
                        events.emit(ProgressEvent::FileCompleted {
                            rel_path: planned.rel_path.clone(),
                            action: "failed",
                            detail: Some(e.to_string()),
                        });
                    }
                }
            }
        }
    }

    // Finalizing: an unwritable store is fatal; committed ciphertexts are
    // safe either way (worst case the next run re-encrypts them).
    if settings.use_state_store {
        store.persist()?;
    }

    summary.elapsed = started.elapsed();
    tracing::info!(run_id = %run_id, outcome = %summary.outcome, errors = summary.errors.len(), "backup run finished");
    events.emit(ProgressEvent::RunFinished {
        summary: summary.clone(),
    });
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::FingerprintAlgorithm;
    use std::fs;
    use std::path::Path;

    fn write(path: &Path, content: &[u8]) {
        fs_ops::ensure_parent_dir_exists(path).expect("mkdir");
        fs::write(path, content).expect("write");
    }

    fn settings(origin: &Path, dest: &Path) -> PairSettings {
        PairSettings::new(origin, dest)
    }

    fn backup(settings: &PairSettings, password: &str) -> RunSummary {
        run_backup(settings, password, &EventSink::disabled(), &CancelToken::new())
            .expect("backup run")
    }

    #[test]
    fn test_first_backup_adds_everything() {
        let temp_dir = tempfile::tempdir().expect("tempdir");
        let origin = temp_dir.path().join("origin");
        let dest = temp_dir.path().join("dest");
        write(&origin.join("a.txt"), b"alpha");
        write(&origin.join("sub/b.txt"), b"beta");

        let settings = settings(&origin, &dest);
        let summary = backup(&settings, "pw");

        assert_eq!(summary.outcome, RunOutcome::Done);
        assert_eq!(summary.added, 2);
        assert!(summary.errors.is_empty());
        assert!(dest.join("a.txt").exists());
        assert!(dest.join("sub").join("b.txt").exists());

        let paths = PairPaths::derive(&origin, &dest);
        let store = StateStore::load(&paths).expect("load store");
        assert_eq!(store.len(), 2);
        assert!(store.lookup("sub/b.txt").is_some());
    }

    #[test]
    fn test_second_backup_is_idempotent() {
        let temp_dir = tempfile::tempdir().expect("tempdir");
        let origin = temp_dir.path().join("origin");
        let dest = temp_dir.path().join("dest");
        write(&origin.join("a.txt"), b"alpha");
        write(&origin.join("b.txt"), b"beta");

        let settings = settings(&origin, &dest);
        backup(&settings, "pw");
        let cipher_before = fs::read(dest.join("a.txt")).expect("read cipher");

        let summary = backup(&settings, "pw");
        assert_eq!(summary.added + summary.updated, 0);
        assert_eq!(summary.skipped, 2);
        // Unchanged files produce zero destination writes.
        assert_eq!(fs::read(dest.join("a.txt")).expect("read cipher"), cipher_before);
    }

    #[test]
    fn test_single_change_reencrypts_single_file() {
        let temp_dir = tempfile::tempdir().expect("tempdir");
        let origin = temp_dir.path().join("origin");
        let dest = temp_dir.path().join("dest");
        write(&origin.join("a.txt"), b"alpha");
        write(&origin.join("b.txt"), b"beta");
        write(&origin.join("c.txt"), b"gamma");

        let settings = settings(&origin, &dest);
        backup(&settings, "pw");
        let untouched = fs::read(dest.join("b.txt")).expect("read cipher");

        write(&origin.join("a.txt"), b"alpha, but longer now");
        let summary = backup(&settings, "pw");

        assert_eq!(summary.updated, 1);
        assert_eq!(summary.skipped, 2);
        assert_eq!(fs::read(dest.join("b.txt")).expect("read cipher"), untouched);

        let store = StateStore::load(&PairPaths::derive(&origin, &dest)).expect("load");
        assert_eq!(store.lookup("a.txt").unwrap().size, 21);
    }

    #[test]
    fn test_origin_dirs_named_like_meta_dir_are_backed_up() {
        let temp_dir = tempfile::tempdir().expect("tempdir");
        let origin = temp_dir.path().join("origin");
        let dest = temp_dir.path().join("dest");
        write(&origin.join("docs/.backup-state/notes.txt"), b"user data");
        write(&origin.join("docs/visible.txt"), b"also user data");

        let settings = settings(&origin, &dest);
        let summary = backup(&settings, "pw");

        // A user directory that shares the state-store directory's name is
        // ordinary origin data and must not be excluded from the run.
        assert_eq!(summary.added, 2);
        assert!(summary.errors.is_empty());
        assert!(dest.join("docs/.backup-state/notes.txt").exists());

        let store = StateStore::load(&PairPaths::derive(&origin, &dest)).expect("load");
        assert!(store.lookup("docs/.backup-state/notes.txt").is_some());
        assert!(store.lookup("docs/visible.txt").is_some());
    }

    #[test]
    fn test_deletion_propagates_to_store_and_destination() {
        let temp_dir = tempfile::tempdir().expect("tempdir");
        let origin = temp_dir.path().join("origin");
        let dest = temp_dir.path().join("dest");
        write(&origin.join("keep.txt"), b"keep");
        write(&origin.join("drop.txt"), b"drop");

        let settings = settings(&origin, &dest);
        backup(&settings, "pw");
        fs::remove_file(origin.join("drop.txt")).expect("remove origin file");

        let summary = backup(&settings, "pw");
        assert_eq!(summary.removed, 1);
        assert!(!dest.join("drop.txt").exists());
        assert!(dest.join("keep.txt").exists());

        let store = StateStore::load(&PairPaths::derive(&origin, &dest)).expect("load");
        assert!(store.lookup("drop.txt").is_none());
        assert!(store.lookup("keep.txt").is_some());
    }

    #[test]
    fn test_fast_detection_misses_same_size_same_mtime_edit() {
        let temp_dir = tempfile::tempdir().expect("tempdir");
        let origin = temp_dir.path().join("origin");
        let dest = temp_dir.path().join("dest");
        write(&origin.join("a.txt"), b"aaaa");

        let mut settings = settings(&origin, &dest);
        backup(&settings, "pw");
        let recorded = StateStore::load(&PairPaths::derive(&origin, &dest))
            .expect("load")
            .lookup("a.txt")
            .expect("record")
            .clone();

        // Same length, mtime reset to the recorded stamp.
        write(&origin.join("a.txt"), b"bbbb");
        fs_ops::set_modified(&origin.join("a.txt"), recorded.modified).expect("set mtime");

        let summary = backup(&settings, "pw");
        assert_eq!(summary.skipped, 1);
        assert_eq!(summary.updated, 0);

        // Hash strictness catches it.
        settings.change_detection = ChangeDetection::Hash;
        let summary = backup(&settings, "pw");
        assert_eq!(summary.updated, 1);
    }

    #[test]
    fn test_partial_failure_still_completes() {
        let temp_dir = tempfile::tempdir().expect("tempdir");
        let origin = temp_dir.path().join("origin");
        let dest = temp_dir.path().join("dest");
        for name in ["a", "b", "c", "d"] {
            write(&origin.join(format!("{}.txt", name)), b"ok");
        }
        write(&origin.join("blocked/e.txt"), b"ok");
        // Make the mirrored parent impossible to create: a file occupies the
        // directory's place in the destination.
        write(&dest.join("blocked"), b"in the way");

        let settings = settings(&origin, &dest);
        let summary = backup(&settings, "pw");

        assert_eq!(summary.outcome, RunOutcome::Done);
        assert_eq!(summary.added, 4);
        assert_eq!(summary.errors.len(), 1);
        assert!(!summary.is_clean());

        // The failed file must not have been committed to the store.
        let store = StateStore::load(&PairPaths::derive(&origin, &dest)).expect("load");
        assert!(store.lookup("blocked/e.txt").is_none());
        assert_eq!(store.len(), 4);
    }

    #[test]
    fn test_missing_store_forces_safe_reencrypt() {
        // Simulates dying after ciphertext writes but before the store
        // persists: the files exist, the store does not. The next run just
        // re-encrypts; nothing is lost and no record points at anything
        // missing.
        let temp_dir = tempfile::tempdir().expect("tempdir");
        let origin = temp_dir.path().join("origin");
        let dest = temp_dir.path().join("dest");
        write(&origin.join("a.txt"), b"alpha");
        write(&origin.join("b.txt"), b"beta");

        let settings = settings(&origin, &dest);
        backup(&settings, "pw");
        StateStore::delete(&PairPaths::derive(&origin, &dest)).expect("drop store");

        let summary = backup(&settings, "pw");
        assert_eq!(summary.added, 2);
        assert!(summary.errors.is_empty());

        let store = StateStore::load(&PairPaths::derive(&origin, &dest)).expect("load");
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_password_change_aborts_before_processing() {
        let temp_dir = tempfile::tempdir().expect("tempdir");
        let origin = temp_dir.path().join("origin");
        let dest = temp_dir.path().join("dest");
        write(&origin.join("a.txt"), b"alpha");

        let settings = settings(&origin, &dest);
        backup(&settings, "first");
        let cipher_before = fs::read(dest.join("a.txt")).expect("read cipher");

        write(&origin.join("a.txt"), b"alpha v2");
        let result = run_backup(&settings, "second", &EventSink::disabled(), &CancelToken::new());
        assert!(matches!(result, Err(EngineError::KeyMismatch)));
        // Nothing was re-encrypted under the wrong key.
        assert_eq!(fs::read(dest.join("a.txt")).expect("read cipher"), cipher_before);
    }

    #[test]
    fn test_cancelled_before_start_keeps_nothing_half_done() {
        let temp_dir = tempfile::tempdir().expect("tempdir");
        let origin = temp_dir.path().join("origin");
        let dest = temp_dir.path().join("dest");
        write(&origin.join("a.txt"), b"alpha");

        let settings = settings(&origin, &dest);
        let cancel = CancelToken::new();
        cancel.cancel();
        let summary =
            run_backup(&settings, "pw", &EventSink::disabled(), &cancel).expect("run");
        assert_eq!(summary.outcome, RunOutcome::Cancelled);
        assert_eq!(summary.added, 0);
        assert!(!dest.join("a.txt").exists());
    }

    #[test]
    fn test_cancel_mid_run_persists_committed_records() {
        let temp_dir = tempfile::tempdir().expect("tempdir");
        let origin = temp_dir.path().join("origin");
        let dest = temp_dir.path().join("dest");
        write(&origin.join("a.txt"), b"alpha");
        // A large sparse file keeps the run busy long after the first
        // completion event reaches the subscriber.
        let big = fs::File::create(origin.join("b.bin")).expect("create big");
        big.set_len(64 * 1024 * 1024).expect("grow big");
        drop(big);
        write(&origin.join("c.txt"), b"gamma");

        let settings = settings(&origin, &dest);
        let (sink, rx) = EventSink::channel();
        let cancel = CancelToken::new();
        let trigger = cancel.clone();
        let watcher = std::thread::spawn(move || {
            for event in rx {
                if matches!(event, ProgressEvent::FileCompleted { .. }) {
                    trigger.cancel();
                }
            }
        });

        let summary = run_backup(&settings, "pw", &sink, &cancel).expect("run");
        drop(sink);
        watcher.join().expect("watcher");

        assert_eq!(summary.outcome, RunOutcome::Cancelled);
        assert!(summary.added >= 1);
        // Sorted processing order puts c.txt last; cancellation lands while
        // b.bin is still encrypting, so c.txt is never reached.
        assert!(!dest.join("c.txt").exists());

        // Work committed before the cancellation is persisted, and only
        // that work: the store on disk matches the summary exactly.
        let store = StateStore::load(&PairPaths::derive(&origin, &dest)).expect("load");
        assert_eq!(store.len(), summary.added);
        assert!(store.lookup("a.txt").is_some());
        assert!(store.lookup("c.txt").is_none());
    }

    #[test]
    fn test_concurrent_run_on_same_pair_is_rejected() {
        let temp_dir = tempfile::tempdir().expect("tempdir");
        let origin = temp_dir.path().join("origin");
        let dest = temp_dir.path().join("dest");
        write(&origin.join("a.txt"), b"alpha");

        let settings = settings(&origin, &dest);
        let paths = PairPaths::derive(&origin, &dest);
        let _held = PairLock::acquire(&paths.pair_id).expect("hold lock");

        let result = run_backup(&settings, "pw", &EventSink::disabled(), &CancelToken::new());
        assert!(matches!(result, Err(EngineError::PairBusy { .. })));
    }

    #[test]
    fn test_event_stream_reports_lifecycle() {
        let temp_dir = tempfile::tempdir().expect("tempdir");
        let origin = temp_dir.path().join("origin");
        let dest = temp_dir.path().join("dest");
        write(&origin.join("a.txt"), b"alpha");

        let settings = settings(&origin, &dest);
        let (sink, rx) = EventSink::channel();
        run_backup(&settings, "pw", &sink, &CancelToken::new()).expect("run");
        drop(sink);

        let events: Vec<_> = rx.iter().collect();
        assert!(matches!(events.first(), Some(ProgressEvent::RunStarted { .. })));
        assert!(matches!(events.last(), Some(ProgressEvent::RunFinished { .. })));
        assert!(events
            .iter()
            .any(|e| matches!(e, ProgressEvent::FileCompleted { action: "added", .. })));
    }

    #[test]
    fn test_disabled_state_store_reencrypts_every_run() {
        let temp_dir = tempfile::tempdir().expect("tempdir");
        let origin = temp_dir.path().join("origin");
        let dest = temp_dir.path().join("dest");
        write(&origin.join("a.txt"), b"alpha");

        let mut settings = settings(&origin, &dest);
        settings.use_state_store = false;
        backup(&settings, "pw");
        let summary = backup(&settings, "pw");
        // No store means no incremental decisions.
        assert_eq!(summary.added, 1);
        assert!(!StateStore::exists(&PairPaths::derive(&origin, &dest)));
    }

    #[test]
    fn test_fingerprint_algorithm_is_respected() {
        let temp_dir = tempfile::tempdir().expect("tempdir");
        let origin = temp_dir.path().join("origin");
        let dest = temp_dir.path().join("dest");
        write(&origin.join("a.txt"), b"alpha");

        let mut settings = settings(&origin, &dest);
        settings.fingerprint = FingerprintAlgorithm::Blake3;
        backup(&settings, "pw");

        let store = StateStore::load(&PairPaths::derive(&origin, &dest)).expect("load");
        let record = store.lookup("a.txt").expect("record");
        assert!(record.fingerprint.as_deref().unwrap().starts_with("blake3:"));
    }
}
