//! Progress events and cooperative cancellation.
//!
//! An engine run publishes an ordered, append-only sequence of events into
//! an unbounded channel; any number of subscribers drain it asynchronously.
//! Producers never block on a slow consumer, and nothing in the engine ever
//! calls back into presentation code.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crossbeam_channel::{unbounded, Receiver, Sender};
use uuid::Uuid;

use crate::model::RunSummary;

/// Which engine produced a run's events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunKind {
    Backup,
    Restore,
}

impl fmt::Display for RunKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Backup => write!(f, "backup"),
            Self::Restore => write!(f, "restore"),
        }
    }
}

/// One entry in a run's event stream. Immutable once emitted.
#[derive(Debug, Clone)]
pub enum ProgressEvent {
    RunStarted {
        run_id: Uuid,
        kind: RunKind,
        origin: String,
        destination: String,
        total_files: usize,
    },
    FileStarted {
        rel_path: String,
    },
    /// `action` is one of added/updated/removed/skipped/restored/failed
    FileCompleted {
        rel_path: String,
        action: &'static str,
        detail: Option<String>,
    },
    RunFinished {
        summary: RunSummary,
    },
}

impl fmt::Display for ProgressEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RunStarted {
                kind,
                origin,
                destination,
                total_files,
                ..
            } => write!(
                f,
                "{} started: '{}' => '{}' ({} files)",
                kind, origin, destination, total_files
            ),
            Self::FileStarted { rel_path } => write!(f, "processing {}", rel_path),
            Self::FileCompleted {
                rel_path,
                action,
                detail,
            } => match detail {
                Some(detail) => write!(f, "{}: {} ({})", action, rel_path, detail),
                None => write!(f, "{}: {}", action, rel_path),
            },
            Self::RunFinished { summary } => write!(f, "{}", summary),
        }
    }
}

/// Producer half of a run's event stream.
///
/// A disabled sink swallows events, which keeps engine code free of
/// `Option` plumbing when no subscriber exists (tests, fire-and-forget).
#[derive(Clone)]
pub struct EventSink {
    sender: Option<Sender<ProgressEvent>>,
}

impl EventSink {
    /// Create a sink plus the receiver subscribers drain.
    pub fn channel() -> (EventSink, Receiver<ProgressEvent>) {
        let (tx, rx) = unbounded();
        (EventSink { sender: Some(tx) }, rx)
    }

    /// A sink with no subscribers.
    pub fn disabled() -> EventSink {
        EventSink { sender: None }
    }

    /// Publish an event. Never blocks; a hung or dropped subscriber is the
    /// subscriber's problem.
    pub fn emit(&self, event: ProgressEvent) {
        tracing::debug!(event = %event, "progress");
        if let Some(sender) = &self.sender {
            let _ = sender.send(event);
        }
    }
}

/// Cooperative cancellation flag, checked between files, never mid-file.
#[derive(Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> CancelToken {
        CancelToken::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_events_arrive_in_order() {
        let (sink, rx) = EventSink::channel();
        sink.emit(ProgressEvent::FileStarted {
            rel_path: "a".to_string(),
        });
        sink.emit(ProgressEvent::FileCompleted {
            rel_path: "a".to_string(),
            action: "added",
            detail: None,
        });
        drop(sink);

        let events: Vec<_> = rx.iter().collect();
        assert_eq!(events.len(), 2);
        assert!(matches!(&events[0], ProgressEvent::FileStarted { rel_path } if rel_path == "a"));
        assert!(matches!(&events[1], ProgressEvent::FileCompleted { action: "added", .. }));
    }

    #[test]
    fn test_disabled_sink_swallows_events() {
        let sink = EventSink::disabled();
        sink.emit(ProgressEvent::FileStarted {
            rel_path: "x".to_string(),
        });
    }

    #[test]
    fn test_emit_survives_dropped_subscriber() {
        let (sink, rx) = EventSink::channel();
        drop(rx);
        sink.emit(ProgressEvent::FileStarted {
            rel_path: "x".to_string(),
        });
    }

    #[test]
    fn test_cancel_token() {
        let token = CancelToken::new();
        assert!(!token.is_cancelled());
        let clone = token.clone();
        clone.cancel();
        assert!(token.is_cancelled());
    }
}
