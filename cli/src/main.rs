//! Command-line front-end for the encrypted backup engine.
//!
//! Supplies configuration and a password to the engine, starts runs, and
//! drains the progress event stream to stderr. All the actual work happens
//! in the `engine` crate.

use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;
use std::thread;

use clap::{Parser, Subcommand};
use engine::{
    run_backup, run_restore, CancelToken, ChangeDetection, EngineError, EventSink,
    FingerprintAlgorithm, PairSettings, ProgressEvent, RunOutcome, RunSummary,
};

/// Encrypted incremental directory backup
#[derive(Parser, Debug)]
#[command(name = "backup")]
#[command(version = "0.1.0")]
#[command(about = "Back up a directory tree to an encrypted destination")]
struct Cli {
    /// Print per-file progress lines
    #[arg(long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run an incremental backup of origin into dest
    Backup {
        /// Directory tree to back up
        #[arg(long, value_name = "PATH")]
        origin: PathBuf,

        /// Destination directory for the encrypted mirror
        #[arg(long, value_name = "PATH")]
        dest: PathBuf,

        /// Password (prompted interactively when omitted)
        #[arg(long)]
        password: Option<String>,

        /// Re-hash content even when size and mtime match the record
        #[arg(long)]
        hash_check: bool,

        /// Fingerprint algorithm: sha256 or blake3
        #[arg(long, value_name = "ALGORITHM", default_value = "sha256")]
        fingerprint: String,

        /// Skip the state store entirely (every run re-encrypts everything)
        #[arg(long)]
        no_state_store: bool,

        /// Don't persist a password verifier for this pair
        #[arg(long)]
        no_record_password: bool,

        /// On a password change, re-key the pair and start a fresh baseline
        /// (deletes the state store; prior ciphertexts become stale)
        #[arg(long)]
        accept_new_password: bool,
    },

    /// Restore the encrypted destination back into origin
    Restore {
        /// Directory tree to restore into
        #[arg(long, value_name = "PATH")]
        origin: PathBuf,

        /// Destination directory holding the encrypted mirror
        #[arg(long, value_name = "PATH")]
        dest: PathBuf,

        /// Password (prompted interactively when omitted)
        #[arg(long)]
        password: Option<String>,

        /// Recreate directories and attributes only, no content
        #[arg(long)]
        attributes_only: bool,

        /// Ignore the state store and scan the destination directly
        #[arg(long)]
        no_state_store: bool,

        /// Rebuild the state store from the restored tree afterwards
        #[arg(long)]
        refresh_store: bool,
    },

    /// Delete a pair's state store, forcing the next backup to start over
    DeleteStore {
        #[arg(long, value_name = "PATH")]
        origin: PathBuf,

        #[arg(long, value_name = "PATH")]
        dest: PathBuf,

        /// Skip the confirmation prompt
        #[arg(long)]
        yes: bool,
    },
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match run(cli) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {}", e);
            ExitCode::from(2)
        }
    }
}

fn run(cli: Cli) -> Result<ExitCode, EngineError> {
    match cli.command {
        Command::Backup {
            origin,
            dest,
            password,
            hash_check,
            fingerprint,
            no_state_store,
            no_record_password,
            accept_new_password,
        } => {
            let mut settings = PairSettings::new(origin, dest);
            settings.use_state_store = !no_state_store;
            settings.record_password = !no_record_password;
            if hash_check {
                settings.change_detection = ChangeDetection::Hash;
            }
            settings.fingerprint = match FingerprintAlgorithm::from_str(&fingerprint) {
                Some(algorithm) => algorithm,
                None => {
                    eprintln!("unknown fingerprint algorithm: {}", fingerprint);
                    return Ok(ExitCode::from(2));
                }
            };
            let password = resolve_password(password)?;

            let result = with_event_stream(cli.verbose, |events, cancel| {
                run_backup(&settings, &password, events, cancel)
            });
            let summary = match result {
                Ok(summary) => summary,
                Err(EngineError::KeyMismatch) if accept_new_password => {
                    eprintln!("password changed; re-keying pair and starting a fresh baseline");
                    let paths = engine::PairPaths::derive(&settings.origin, &settings.destination);
                    engine::rekey(
                        &paths.key_file,
                        &paths.state_file,
                        &password,
                        settings.record_password,
                        true,
                    )?;
                    with_event_stream(cli.verbose, |events, cancel| {
                        run_backup(&settings, &password, events, cancel)
                    })?
                }
                Err(e) => return Err(e),
            };
            Ok(exit_code_for(&summary))
        }

        Command::Restore {
            origin,
            dest,
            password,
            attributes_only,
            no_state_store,
            refresh_store,
        } => {
            let mut settings = PairSettings::new(origin, dest);
            settings.attributes_only = attributes_only;
            settings.use_state_store = !no_state_store;
            settings.write_store_on_restore = refresh_store;
            let password = resolve_password(password)?;

            let summary = with_event_stream(cli.verbose, |events, cancel| {
                run_restore(&settings, &password, events, cancel)
            })?;
            Ok(exit_code_for(&summary))
        }

        Command::DeleteStore { origin, dest, yes } => {
            let paths = engine::PairPaths::derive(&origin, &dest);
            if !engine::StateStore::exists(&paths) {
                eprintln!("no state store exists for this pair");
                return Ok(ExitCode::SUCCESS);
            }
            if !yes && !confirm(&format!(
                "Delete {}? The next backup will re-encrypt every file.",
                paths.state_file.display()
            )) {
                eprintln!("aborted");
                return Ok(ExitCode::from(1));
            }
            engine::StateStore::delete(&paths)?;
            eprintln!("state store deleted");
            Ok(ExitCode::SUCCESS)
        }
    }
}

/// Run an engine operation with a subscriber thread draining its events.
fn with_event_stream<F>(verbose: bool, op: F) -> Result<RunSummary, EngineError>
where
    F: FnOnce(&EventSink, &CancelToken) -> Result<RunSummary, EngineError>,
{
    let (events, receiver) = EventSink::channel();
    let cancel = CancelToken::new();
    let printer = thread::spawn(move || {
        for event in receiver {
            match &event {
                ProgressEvent::FileStarted { .. } => {
                    if verbose {
                        eprintln!("{}", event);
                    }
                }
                ProgressEvent::FileCompleted { action, .. } => {
                    if verbose || *action == "failed" {
                        eprintln!("{}", event);
                    }
                }
                _ => eprintln!("{}", event),
            }
        }
    });

    let result = op(&events, &cancel);
    drop(events);
    let _ = printer.join();

    if let Ok(summary) = &result {
        for error in &summary.errors {
            eprintln!("  {}: {}", error.path.display(), error.message);
        }
    }
    result
}

fn exit_code_for(summary: &RunSummary) -> ExitCode {
    match (summary.outcome, summary.errors.is_empty()) {
        (RunOutcome::Done, true) => ExitCode::SUCCESS,
        (RunOutcome::Done, false) | (RunOutcome::Cancelled, _) => ExitCode::from(1),
        (RunOutcome::Failed, _) => ExitCode::from(2),
    }
}

fn resolve_password(flag: Option<String>) -> Result<String, EngineError> {
    match flag {
        Some(password) => Ok(password),
        None => rpassword::prompt_password("Password: ").map_err(|e| EngineError::io("stdin", e)),
    }
}

fn confirm(prompt: &str) -> bool {
    eprint!("{} [y/N] ", prompt);
    let _ = std::io::stderr().flush();
    let mut answer = String::new();
    if std::io::stdin().read_line(&mut answer).is_err() {
        return false;
    }
    matches!(answer.trim(), "y" | "Y" | "yes")
}
