//! Error types for taskwarden.

use std::path::PathBuf;

use uuid::Uuid;

/// Top-level error type for the orchestration engine.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Parse error: {0}")]
    Parse(#[from] ParseError),

    #[error("Executor error: {0}")]
    Executor(#[from] ExecutorError),

    #[error("Recovery error: {0}")]
    Recovery(#[from] RecoveryError),

    #[error("Schedule error: {0}")]
    Schedule(#[from] ScheduleError),

    #[error("Audit error: {0}")]
    Audit(#[from] AuditError),

    #[error("Handler error: {0}")]
    Handler(#[from] HandlerError),
}

/// Task store errors.
///
/// A missing source record on a transition is *not* an error — transitions
/// report that through `TransitionOutcome::NotFound`. These variants cover
/// genuine I/O and encoding failures; `RootInaccessible` is the only fatal one.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Store root inaccessible: {path}: {reason}")]
    RootInaccessible { path: PathBuf, reason: String },

    #[error("I/O error in partition {partition}: {source}")]
    Io {
        partition: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Artifact parsing errors. A malformed artifact is skipped and logged,
/// never allowed to abort a scan.
#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("Missing header block")]
    MissingHeader,

    #[error("Unsupported artifact format version: {0}")]
    UnsupportedVersion(String),

    #[error("Missing required header field: {0}")]
    MissingField(String),

    #[error("Invalid value for header field {field}: {value}")]
    InvalidField { field: String, value: String },
}

/// Plan execution errors.
///
/// Step and approval failures are not errors at this level; they are
/// recorded in the plan and resolved by strategy. The executor only errors
/// out when it must stop entirely.
#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    #[error("Task {task_id} was moved out of the in-progress partition")]
    Abandoned { task_id: Uuid },
}

/// Error-recovery subsystem errors.
#[derive(Debug, thiserror::Error)]
pub enum RecoveryError {
    #[error("No fallback registered for operation '{operation}'")]
    NoFallback { operation: String },

    #[error("Error journal write failed: {0}")]
    Journal(String),
}

/// Scheduled-task runner errors.
#[derive(Debug, thiserror::Error)]
pub enum ScheduleError {
    #[error("Unknown scheduled task: {0}")]
    UnknownTask(String),

    #[error("Invalid schedule expression: {0}")]
    InvalidExpression(String),

    #[error("Scheduler state I/O failed: {0}")]
    State(String),
}

/// Audit journal errors.
#[derive(Debug, thiserror::Error)]
pub enum AuditError {
    #[error("Audit journal I/O failed: {0}")]
    Io(String),

    #[error("Audit event serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Error raised by a collaborator-supplied action handler.
///
/// Handlers perform the real side effect (send a message, publish a post);
/// how they fail is opaque to the engine, so this is message-only.
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct HandlerError(pub String);

impl HandlerError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

/// Result type alias for the engine.
pub type Result<T> = std::result::Result<T, Error>;
