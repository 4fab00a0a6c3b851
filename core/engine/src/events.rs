//! Progress and log reporting.
//!
//! The orchestrator writes [`LockEvent`]s to an unbounded channel. Sending
//! never blocks, works from any worker thread, and is a no-op once the
//! receiver is gone. Every event is mirrored to `tracing`.

use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::{debug, error, info, warn};

/// Phase of a lock or unlock operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationState {
    Idle,
    DerivingKey,
    Processing,
    Committing,
    CleaningUp,
    Done,
    /// Failed and rolled back.
    Failed,
    /// Cancelled and rolled back.
    Cancelled,
}

/// Severity of a log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Info,
    Warning,
    Error,
}

/// Event emitted during an operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockEvent {
    /// The operation entered a new phase.
    State(OperationState),
    /// Percentage of files completed.
    Progress(u8),
    /// Human-readable log line.
    Log { level: LogLevel, message: String },
}

/// Sending half of the event channel.
#[derive(Debug, Clone, Default)]
pub struct EventSink {
    tx: Option<UnboundedSender<LockEvent>>,
}

impl EventSink {
    /// Wrap an existing sender.
    pub fn new(tx: UnboundedSender<LockEvent>) -> Self {
        Self { tx: Some(tx) }
    }

    /// Create a sink together with its receiver.
    pub fn channel() -> (Self, UnboundedReceiver<LockEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(tx), rx)
    }

    /// A sink that only logs through `tracing`.
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    fn send(&self, event: LockEvent) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(event);
        }
    }

    /// Report a phase transition.
    pub fn state(&self, state: OperationState) {
        debug!("Operation state: {:?}", state);
        self.send(LockEvent::State(state));
    }

    /// Report `done` of `total` files completed.
    pub fn progress(&self, done: usize, total: usize) {
        let percent = if total == 0 {
            100
        } else {
            (done.min(total) * 100 / total) as u8
        };
        self.send(LockEvent::Progress(percent));
    }

    pub fn info(&self, message: impl Into<String>) {
        let message = message.into();
        info!("{}", message);
        self.send(LockEvent::Log {
            level: LogLevel::Info,
            message,
        });
    }

    pub fn warn(&self, message: impl Into<String>) {
        let message = message.into();
        warn!("{}", message);
        self.send(LockEvent::Log {
            level: LogLevel::Warning,
            message,
        });
    }

    pub fn error(&self, message: impl Into<String>) {
        let message = message.into();
        error!("{}", message);
        self.send(LockEvent::Log {
            level: LogLevel::Error,
            message,
        });
    }
}

/// Human-readable size with one decimal, e.g. `4.0MB`.
pub fn format_size(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.1}GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.1}MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.1}KB", bytes as f64 / KB as f64)
    } else {
        format!("{}B", bytes)
    }
}
