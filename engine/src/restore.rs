//! Restore engine: decrypt the destination tree back into the origin.
//!
//! Resolution prefers the state store (which also enables attributes-only
//! and selective restore); without one, the destination tree is scanned
//! directly. A key mismatch against the recorded verifier is detected once,
//! before any file, and aborts the run; per-file integrity or I/O failures
//! are counted and skipped like the backup side.

use std::fs;
use std::time::Instant;

use chrono::Utc;
use uuid::Uuid;

use crate::codec;
use crate::error::EngineError;
use crate::fs_ops::{self, rel_to_path};
use crate::keys;
use crate::model::{FileRecord, PairSettings, RunError, RunOutcome, RunSummary};
use crate::progress::{CancelToken, EventSink, ProgressEvent, RunKind};
use crate::store::{PairLock, PairPaths, StateStore};

struct RestoreEntry {
    rel_path: String,
    record: Option<FileRecord>,
}

/// Execute a full restore run for a pair.
pub fn run_restore(
    settings: &PairSettings,
    password: &str,
    events: &EventSink,
    cancel: &CancelToken,
) -> Result<RunSummary, EngineError> {
    let paths = PairPaths::derive(&settings.origin, &settings.destination);
    let _lock = PairLock::acquire(&paths.pair_id)?;

    // The pair's salt must exist to re-derive the key; a verifier mismatch
    // aborts here, once per run, never per file.
    let key = keys::authorize_existing(&paths.key_file, password)?;

    let store_available = settings.use_state_store && StateStore::exists(&paths);
    let mut store = if store_available {
        StateStore::load(&paths)?
    } else {
        StateStore::detached(&paths)
    };

    let entries: Vec<RestoreEntry> = if store_available {
        store
            .iter()
            .map(|(rel_path, record)| RestoreEntry {
                rel_path: rel_path.clone(),
                record: Some(record.clone()),
            })
            .collect()
    } else {
        if settings.attributes_only {
            return Err(EngineError::InvalidPath {
                path: paths.state_file.clone(),
                reason: "attributes-only restore requires a state store".to_string(),
            });
        }
        fs_ops::enumerate_tree(&settings.destination, Some(paths.meta_dir.as_path()))?
            .into_iter()
            .map(|f| RestoreEntry {
                rel_path: f.rel_path,
                record: None,
            })
            .collect()
    };

    let run_id = Uuid::new_v4();
    let started = Instant::now();
    tracing::info!(
        run_id = %run_id,
        origin = %settings.origin.display(),
        destination = %settings.destination.display(),
        files = entries.len(),
        attributes_only = settings.attributes_only,
        "restore run starting"
    );
    events.emit(ProgressEvent::RunStarted {
        run_id,
        kind: RunKind::Restore,
        origin: settings.destination.display().to_string(),
        destination: settings.origin.display().to_string(),
        total_files: entries.len(),
    });

    let mut summary = RunSummary::new(run_id);
    let mut restored_paths = Vec::new();
    for entry in &entries {
        if cancel.is_cancelled() {
            summary.outcome = RunOutcome::Cancelled;
            break;
        }
        events.emit(ProgressEvent::FileStarted {
            rel_path: entry.rel_path.clone(),
        });

        let target = rel_to_path(&settings.origin, &entry.rel_path);
        let result = if settings.attributes_only {
            restore_attributes(&target, entry.record.as_ref())
        } else {
            let src = rel_to_path(&settings.destination, &entry.rel_path);
            codec::decrypt_file(&src, &target, &key).map(|_| ()).and_then(|()| {
                match &entry.record {
                    Some(record) => fs_ops::set_modified(&target, record.modified),
                    None => Ok(()),
                }
            })
        };

        match result {
            Ok(()) => {
                summary.restored += 1;
                restored_paths.push(entry.rel_path.clone());
                events.emit(ProgressEvent::FileCompleted {
                    rel_path: entry.rel_path.clone(),
                    action: "restored",
                    detail: None,
                });
            }
            Err(e) => {
                tracing::warn!(path = %target.display(), error = %e, "restore failed");
                summary.errors.push(RunError::new(&target, e.to_string()));
                events.emit(ProgressEvent::FileCompleted {
                    rel_path: entry.rel_path.clone(),
                    action: "failed",
                    detail: Some(e.to_string()),
                });
            }
        }
    }

    // Optional refresh: re-derive records from the restored tree so the next
    // backup treats it as a clean baseline.
    if settings.write_store_on_restore
        && settings.use_state_store
        && !settings.attributes_only
        && summary.outcome != RunOutcome::Cancelled
    {
        for rel_path in &restored_paths {
            if let Err(e) = refresh_record(settings, &mut store, rel_path) {
                summary.errors.push(RunError::new(
                    rel_to_path(&settings.origin, rel_path),
                    format!("store refresh failed: {}", e),
                ));
            }
        }
        store.persist()?;
    }

    summary.elapsed = started.elapsed();
    tracing::info!(run_id = %run_id, outcome = %summary.outcome, errors = summary.errors.len(), "restore run finished");
    events.emit(ProgressEvent::RunFinished {
        summary: summary.clone(),
    });
    Ok(summary)
}

/// Attributes-only mode: materialize the tree and stored metadata without
/// decrypting any content. Missing files become empty placeholders, so this
/// works even when the origin does not pre-exist.
fn restore_attributes(target: &std::path::Path, record: Option<&FileRecord>) -> Result<(), EngineError> {
    let record = record.ok_or_else(|| EngineError::InvalidPath {
        path: target.to_path_buf(),
        reason: "no stored attributes for this file".to_string(),
    })?;
    fs_ops::ensure_parent_dir_exists(target)?;
    if !target.exists() {
        fs::File::create(target).map_err(|e| EngineError::io(target, e))?;
    }
    fs_ops::set_modified(target, record.modified)
}

/// Recompute one restored file's record in place, keeping the nonce of the
/// ciphertext that is still sitting in the destination.
fn refresh_record(
    settings: &PairSettings,
    store: &mut StateStore,
    rel_path: &str,
) -> Result<(), EngineError> {
    let restored = rel_to_path(&settings.origin, rel_path);
    let metadata = fs::metadata(&restored).map_err(|e| EngineError::io(&restored, e))?;
    let modified = metadata
        .modified()
        .map_err(|e| EngineError::io(&restored, e))?;
    let nonce = match store.lookup(rel_path) {
        Some(record) => record.nonce.clone(),
        None => codec::read_nonce(&rel_to_path(&settings.destination, rel_path))?,
    };
    store.upsert(
        rel_path.to_string(),
        FileRecord {
            size: metadata.len(),
            modified: modified.into(),
            fingerprint: Some(fs_ops::fingerprint_file(&restored, settings.fingerprint)?),
            nonce,
            backed_up_at: Utc::now(),
        },
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::run_backup;
    use std::path::Path;

    fn write(path: &Path, content: &[u8]) {
        fs_ops::ensure_parent_dir_exists(path).expect("mkdir");
        fs::write(path, content).expect("write");
    }

    fn backup(settings: &PairSettings, password: &str) -> RunSummary {
        run_backup(settings, password, &EventSink::disabled(), &CancelToken::new())
            .expect("backup run")
    }

    fn restore(settings: &PairSettings, password: &str) -> RunSummary {
        run_restore(settings, password, &EventSink::disabled(), &CancelToken::new())
            .expect("restore run")
    }

    #[test]
    fn test_roundtrip_restores_content_and_mtime() {
        let temp_dir = tempfile::tempdir().expect("tempdir");
        let origin = temp_dir.path().join("origin");
        let dest = temp_dir.path().join("dest");
        write(&origin.join("a.txt"), b"alpha");
        write(&origin.join("sub/b.txt"), b"beta");

        let settings = PairSettings::new(&origin, &dest);
        backup(&settings, "pw");
        let record = StateStore::load(&PairPaths::derive(&origin, &dest))
            .expect("load")
            .lookup("a.txt")
            .expect("record")
            .clone();

        fs::remove_dir_all(&origin).expect("wipe origin");
        let summary = restore(&settings, "pw");

        assert_eq!(summary.outcome, RunOutcome::Done);
        assert_eq!(summary.restored, 2);
        assert_eq!(fs::read(origin.join("a.txt")).expect("read"), b"alpha");
        assert_eq!(fs::read(origin.join("sub/b.txt")).expect("read"), b"beta");

        let restored_mtime = fs::metadata(origin.join("a.txt"))
            .unwrap()
            .modified()
            .unwrap();
        assert_eq!(
            chrono::DateTime::<Utc>::from(restored_mtime),
            record.modified
        );
    }

    #[test]
    fn test_recorded_password_mismatch_aborts_before_files() {
        let temp_dir = tempfile::tempdir().expect("tempdir");
        let origin = temp_dir.path().join("origin");
        let dest = temp_dir.path().join("dest");
        write(&origin.join("a.txt"), b"alpha");

        let settings = PairSettings::new(&origin, &dest);
        backup(&settings, "right");
        fs::remove_dir_all(&origin).expect("wipe origin");

        let result =
            run_restore(&settings, "wrong", &EventSink::disabled(), &CancelToken::new());
        assert!(matches!(result, Err(EngineError::KeyMismatch)));
        assert!(!origin.exists());
    }

    #[test]
    fn test_unrecorded_wrong_password_fails_per_file() {
        let temp_dir = tempfile::tempdir().expect("tempdir");
        let origin = temp_dir.path().join("origin");
        let dest = temp_dir.path().join("dest");
        write(&origin.join("a.txt"), b"alpha");
        write(&origin.join("b.txt"), b"beta");

        let mut settings = PairSettings::new(&origin, &dest);
        settings.record_password = false;
        backup(&settings, "right");
        fs::remove_dir_all(&origin).expect("wipe origin");

        // No verifier exists, so the mismatch surfaces as integrity errors.
        let summary = restore(&settings, "wrong");
        assert_eq!(summary.outcome, RunOutcome::Done);
        assert_eq!(summary.restored, 0);
        assert_eq!(summary.errors.len(), 2);
        // Never a partially restored file.
        assert!(!origin.join("a.txt").exists());
        assert!(!origin.join("b.txt").exists());
    }

    #[test]
    fn test_attributes_only_creates_tree_from_metadata() {
        let temp_dir = tempfile::tempdir().expect("tempdir");
        let origin = temp_dir.path().join("origin");
        let dest = temp_dir.path().join("dest");
        write(&origin.join("deep/nested/f.txt"), b"payload");

        let settings = PairSettings::new(&origin, &dest);
        backup(&settings, "pw");
        let record = StateStore::load(&PairPaths::derive(&origin, &dest))
            .expect("load")
            .lookup("deep/nested/f.txt")
            .expect("record")
            .clone();

        fs::remove_dir_all(&origin).expect("wipe origin");
        let mut settings = settings;
        settings.attributes_only = true;
        let summary = restore(&settings, "pw");

        assert_eq!(summary.restored, 1);
        let target = origin.join("deep").join("nested").join("f.txt");
        assert!(target.exists());
        // Placeholder only: attributes, not content.
        assert_eq!(fs::metadata(&target).unwrap().len(), 0);
        let mtime = fs::metadata(&target).unwrap().modified().unwrap();
        assert_eq!(chrono::DateTime::<Utc>::from(mtime), record.modified);
    }

    #[test]
    fn test_scan_fallback_without_state_store() {
        let temp_dir = tempfile::tempdir().expect("tempdir");
        let origin = temp_dir.path().join("origin");
        let dest = temp_dir.path().join("dest");
        write(&origin.join("a.txt"), b"alpha");
        write(&origin.join("sub/b.txt"), b"beta");

        let settings = PairSettings::new(&origin, &dest);
        backup(&settings, "pw");
        StateStore::delete(&PairPaths::derive(&origin, &dest)).expect("drop store");
        fs::remove_dir_all(&origin).expect("wipe origin");

        let summary = restore(&settings, "pw");
        assert_eq!(summary.restored, 2);
        assert_eq!(fs::read(origin.join("sub/b.txt")).expect("read"), b"beta");
    }

    #[test]
    fn test_one_corrupt_ciphertext_does_not_abort() {
        let temp_dir = tempfile::tempdir().expect("tempdir");
        let origin = temp_dir.path().join("origin");
        let dest = temp_dir.path().join("dest");
        for name in ["a", "b", "c"] {
            write(&origin.join(format!("{}.txt", name)), b"data");
        }

        let settings = PairSettings::new(&origin, &dest);
        backup(&settings, "pw");
        fs::write(dest.join("b.txt"), b"garbage, not a ciphertext").expect("corrupt");
        fs::remove_dir_all(&origin).expect("wipe origin");

        let summary = restore(&settings, "pw");
        assert_eq!(summary.outcome, RunOutcome::Done);
        assert_eq!(summary.restored, 2);
        assert_eq!(summary.errors.len(), 1);
        assert!(!origin.join("b.txt").exists());
    }

    #[test]
    fn test_refresh_store_makes_next_backup_a_baseline() {
        let temp_dir = tempfile::tempdir().expect("tempdir");
        let origin = temp_dir.path().join("origin");
        let dest = temp_dir.path().join("dest");
        write(&origin.join("a.txt"), b"alpha");
        write(&origin.join("b.txt"), b"beta");

        let mut settings = PairSettings::new(&origin, &dest);
        backup(&settings, "pw");
        fs::remove_dir_all(&origin).expect("wipe origin");

        settings.write_store_on_restore = true;
        restore(&settings, "pw");

        // Records now describe the restored files, so nothing changed.
        let summary = backup(&settings, "pw");
        assert_eq!(summary.skipped, 2);
        assert_eq!(summary.added + summary.updated, 0);
    }

    #[test]
    fn test_restore_without_key_record_is_fatal() {
        let temp_dir = tempfile::tempdir().expect("tempdir");
        let origin = temp_dir.path().join("origin");
        let dest = temp_dir.path().join("dest");
        fs::create_dir_all(&dest).expect("mkdir");

        let settings = PairSettings::new(&origin, &dest);
        let result = run_restore(&settings, "pw", &EventSink::disabled(), &CancelToken::new());
        assert!(matches!(result, Err(EngineError::KeyRecordMissing { .. })));
    }

    #[test]
    fn test_cancelled_restore_stops_at_file_boundary() {
        let temp_dir = tempfile::tempdir().expect("tempdir");
        let origin = temp_dir.path().join("origin");
        let dest = temp_dir.path().join("dest");
        write(&origin.join("a.txt"), b"alpha");

        let settings = PairSettings::new(&origin, &dest);
        backup(&settings, "pw");
        fs::remove_dir_all(&origin).expect("wipe origin");

        let cancel = CancelToken::new();
        cancel.cancel();
        let summary =
            run_restore(&settings, "pw", &EventSink::disabled(), &cancel).expect("run");
        assert_eq!(summary.outcome, RunOutcome::Cancelled);
        assert_eq!(summary.restored, 0);
    }
}
