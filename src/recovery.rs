//! Error recovery — strategy dispatch, per-operation circuit breaker, and a
//! per-day error journal.
//!
//! Every recoverable failure in the engine funnels through
//! [`ErrorRecovery::handle_error`] with an explicit strategy. The circuit
//! breaker counts errors per operation key; once it opens, the chosen
//! strategy is overridden with [`RecoveryStrategy::Alert`] so a human sees
//! the repeated failure instead of the engine retrying forever.

use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::error::RecoveryError;
use crate::store::TaskStore;
use crate::task::model::{Priority, Task, TaskType};
use crate::task::TaskDocument;

/// How to respond to a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryStrategy {
    /// Re-run the failing operation with exponential backoff.
    Retry,
    /// Run the registered fallback for the operation instead.
    Fallback,
    /// Give up on the artifact; move it to the skipped partition.
    Skip,
    /// Enqueue an urgent task asking a human to intervene.
    Alert,
    /// Isolate the artifact with diagnostics for manual review.
    Quarantine,
}

impl std::fmt::Display for RecoveryStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Retry => "retry",
            Self::Fallback => "fallback",
            Self::Skip => "skip",
            Self::Alert => "alert",
            Self::Quarantine => "quarantine",
        };
        f.write_str(s)
    }
}

/// A retryable unit of work. Returns a success note or an error message.
pub type RecoveryOp =
    Arc<dyn Fn() -> Pin<Box<dyn Future<Output = Result<String, String>> + Send>> + Send + Sync>;

/// Everything recovery needs to know about a failure.
pub struct ErrorContext {
    /// Stable operation key; the circuit breaker counts per key.
    pub operation: String,
    /// Artifact involved, if any. Required for Skip and Quarantine.
    pub artifact: Option<Uuid>,
    /// Human-readable description of what went wrong.
    pub details: String,
    /// The operation to re-run under the Retry strategy.
    pub retry: Option<RecoveryOp>,
}

impl ErrorContext {
    pub fn new(operation: impl Into<String>, details: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            artifact: None,
            details: details.into(),
            retry: None,
        }
    }

    pub fn with_artifact(mut self, id: Uuid) -> Self {
        self.artifact = Some(id);
        self
    }

    pub fn with_retry(mut self, op: RecoveryOp) -> Self {
        self.retry = Some(op);
        self
    }
}

/// What recovery actually did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryOutcome {
    /// The retry or fallback succeeded; carries its result note.
    Recovered(String),
    /// The artifact was moved to the skipped partition.
    Skipped,
    /// An urgent intervention task was enqueued.
    Alerted { task_id: Uuid },
    /// The artifact was isolated.
    Quarantined,
    /// The strategy ran but did not recover; carries the final message.
    Unrecovered(String),
}

/// One line in the error journal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub operation: String,
    pub strategy: RecoveryStrategy,
    pub artifact: Option<Uuid>,
    pub message: String,
    pub attempts: u32,
    pub recovered: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct BreakerEntry {
    count: u32,
    last_error: DateTime<Utc>,
}

/// Per-operation error counter with a sliding reset window.
///
/// The count is reset lazily: the next `record` after a quiet period longer
/// than the window starts from zero. State survives restarts via a JSON file.
pub struct CircuitBreaker {
    threshold: u32,
    window: Duration,
    state_path: PathBuf,
    state: Mutex<HashMap<String, BreakerEntry>>,
}

impl CircuitBreaker {
    /// Load breaker state from `state_path`, starting empty if absent.
    pub async fn load(
        state_path: impl Into<PathBuf>,
        threshold: u32,
        window: Duration,
    ) -> Result<Self, RecoveryError> {
        let state_path = state_path.into();
        if let Some(parent) = state_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| RecoveryError::Journal(e.to_string()))?;
        }
        let state = match tokio::fs::read_to_string(&state_path).await {
            Ok(raw) => serde_json::from_str(&raw).unwrap_or_default(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => return Err(RecoveryError::Journal(e.to_string())),
        };
        Ok(Self {
            threshold,
            window,
            state_path,
            state: Mutex::new(state),
        })
    }

    /// Count one error against `operation` and return the running count.
    pub async fn record(
        &self,
        operation: &str,
        now: DateTime<Utc>,
    ) -> Result<u32, RecoveryError> {
        let mut state = self.state.lock().await;
        let entry = state.entry(operation.to_string()).or_insert(BreakerEntry {
            count: 0,
            last_error: now,
        });
        if elapsed(entry.last_error, now) > self.window {
            entry.count = 0;
        }
        entry.count += 1;
        entry.last_error = now;
        let count = entry.count;
        self.persist(&state).await?;
        Ok(count)
    }

    /// True while the threshold was reached within the window.
    pub async fn is_open(&self, operation: &str, now: DateTime<Utc>) -> bool {
        let state = self.state.lock().await;
        match state.get(operation) {
            Some(entry) => {
                entry.count >= self.threshold && elapsed(entry.last_error, now) <= self.window
            }
            None => false,
        }
    }

    /// Manually close the circuit for an operation.
    pub async fn reset(&self, operation: &str) -> Result<(), RecoveryError> {
        let mut state = self.state.lock().await;
        state.remove(operation);
        self.persist(&state).await
    }

    async fn persist(&self, state: &HashMap<String, BreakerEntry>) -> Result<(), RecoveryError> {
        let raw = serde_json::to_string_pretty(state)
            .map_err(|e| RecoveryError::Journal(e.to_string()))?;
        tokio::fs::write(&self.state_path, raw)
            .await
            .map_err(|e| RecoveryError::Journal(e.to_string()))
    }
}

fn elapsed(from: DateTime<Utc>, to: DateTime<Utc>) -> Duration {
    (to - from).to_std().unwrap_or(Duration::ZERO)
}

/// Delay before retry attempt `attempt` (zero-based): `base * 2^attempt`.
pub fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    base.saturating_mul(2u32.saturating_pow(attempt))
}

/// Central failure handler shared by every subsystem.
pub struct ErrorRecovery {
    store: Arc<dyn TaskStore>,
    breaker: CircuitBreaker,
    journal_dir: PathBuf,
    max_retries: u32,
    retry_base_delay: Duration,
    fallbacks: Mutex<HashMap<String, RecoveryOp>>,
}

impl ErrorRecovery {
    pub async fn new(
        store: Arc<dyn TaskStore>,
        state_dir: impl Into<PathBuf>,
        breaker_threshold: u32,
        breaker_window: Duration,
        max_retries: u32,
        retry_base_delay: Duration,
    ) -> Result<Self, RecoveryError> {
        let state_dir = state_dir.into();
        let breaker =
            CircuitBreaker::load(state_dir.join("breaker.json"), breaker_threshold, breaker_window)
                .await?;
        let journal_dir = state_dir.join("errors");
        tokio::fs::create_dir_all(&journal_dir)
            .await
            .map_err(|e| RecoveryError::Journal(e.to_string()))?;
        Ok(Self {
            store,
            breaker,
            journal_dir,
            max_retries,
            retry_base_delay,
            fallbacks: Mutex::new(HashMap::new()),
        })
    }

    /// Register the fallback to run when `operation` fails under the
    /// Fallback strategy.
    pub async fn register_fallback(&self, operation: impl Into<String>, op: RecoveryOp) {
        self.fallbacks.lock().await.insert(operation.into(), op);
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// Handle one failure with the requested strategy.
    ///
    /// If the circuit for the operation is already open the strategy is
    /// overridden with Alert, whatever the caller asked for.
    pub async fn handle_error(
        &self,
        strategy: RecoveryStrategy,
        ctx: ErrorContext,
    ) -> Result<RecoveryOutcome, RecoveryError> {
        let now = Utc::now();
        let count = self.breaker.record(&ctx.operation, now).await?;
        warn!(
            operation = %ctx.operation,
            %strategy,
            error_count = count,
            details = %ctx.details,
            "recovering from error"
        );

        let effective = if self.breaker.is_open(&ctx.operation, now).await
            && strategy != RecoveryStrategy::Alert
        {
            error!(
                operation = %ctx.operation,
                error_count = count,
                "circuit open, escalating to alert"
            );
            RecoveryStrategy::Alert
        } else {
            strategy
        };

        // The journal record id is fixed before dispatch so an alert can
        // name the journal line it belongs to.
        let record_id = Uuid::new_v4();
        let (outcome, attempts) = self.apply(effective, &ctx, record_id).await?;
        self.journal(record_id, &ctx, effective, attempts, &outcome)
            .await?;
        Ok(outcome)
    }

    async fn apply(
        &self,
        strategy: RecoveryStrategy,
        ctx: &ErrorContext,
        record_id: Uuid,
    ) -> Result<(RecoveryOutcome, u32), RecoveryError> {
        match strategy {
            RecoveryStrategy::Retry => {
                let Some(op) = &ctx.retry else {
                    return Ok((
                        RecoveryOutcome::Unrecovered("nothing to retry".to_string()),
                        0,
                    ));
                };
                let mut last = String::new();
                for attempt in 0..self.max_retries {
                    if attempt > 0 {
                        tokio::time::sleep(backoff_delay(self.retry_base_delay, attempt - 1))
                            .await;
                    }
                    match op().await {
                        Ok(note) => {
                            info!(operation = %ctx.operation, attempt, "retry recovered");
                            return Ok((RecoveryOutcome::Recovered(note), attempt + 1));
                        }
                        Err(msg) => last = msg,
                    }
                }
                Ok((RecoveryOutcome::Unrecovered(last), self.max_retries))
            }
            RecoveryStrategy::Fallback => {
                let fallbacks = self.fallbacks.lock().await;
                let Some(op) = fallbacks.get(&ctx.operation).cloned() else {
                    return Err(RecoveryError::NoFallback {
                        operation: ctx.operation.clone(),
                    });
                };
                drop(fallbacks);
                match op().await {
                    Ok(note) => Ok((RecoveryOutcome::Recovered(note), 1)),
                    Err(msg) => Ok((RecoveryOutcome::Unrecovered(msg), 1)),
                }
            }
            RecoveryStrategy::Skip => {
                if let Some(id) = ctx.artifact {
                    self.store
                        .skip(id)
                        .await
                        .map_err(|e| RecoveryError::Journal(e.to_string()))?;
                }
                Ok((RecoveryOutcome::Skipped, 0))
            }
            RecoveryStrategy::Alert => {
                let task_id = self.raise_alert(ctx, record_id).await?;
                Ok((RecoveryOutcome::Alerted { task_id }, 0))
            }
            RecoveryStrategy::Quarantine => {
                if let Some(id) = ctx.artifact {
                    self.store
                        .quarantine(id, &ctx.details)
                        .await
                        .map_err(|e| RecoveryError::Journal(e.to_string()))?;
                }
                Ok((RecoveryOutcome::Quarantined, 0))
            }
        }
    }

    /// Enqueue an urgent task so a human sees the failure in their inbox.
    /// The alert names its journal record so the two can be correlated.
    async fn raise_alert(
        &self,
        ctx: &ErrorContext,
        record_id: Uuid,
    ) -> Result<Uuid, RecoveryError> {
        let body = format!(
            "# Intervention needed\n\n\
             Operation `{}` is failing repeatedly.\n\n\
             Error id: {record_id}\n\n\
             Last error: {}\n\n\
             Affected artifact: {}\n\n\
             Suggested actions:\n\
             - Look up error {record_id} in the journal under the state directory\n\
             - Fix the underlying cause, then reset the circuit for this operation\n",
            ctx.operation,
            ctx.details,
            ctx.artifact
                .map(|id| id.to_string())
                .unwrap_or_else(|| "none".to_string()),
        );
        let task = Task::new(TaskType::Generic, "error_recovery", Priority::Urgent)
            .with_requires_approval(false)
            .with_payload("operation", &ctx.operation)
            .with_payload("error_id", record_id.to_string());
        let id = task.id;
        self.store
            .enqueue(&TaskDocument::new(task, body))
            .await
            .map_err(|e| RecoveryError::Journal(e.to_string()))?;
        Ok(id)
    }

    async fn journal(
        &self,
        record_id: Uuid,
        ctx: &ErrorContext,
        strategy: RecoveryStrategy,
        attempts: u32,
        outcome: &RecoveryOutcome,
    ) -> Result<(), RecoveryError> {
        let record = ErrorRecord {
            id: record_id,
            timestamp: Utc::now(),
            operation: ctx.operation.clone(),
            strategy,
            artifact: ctx.artifact,
            message: ctx.details.clone(),
            attempts,
            recovered: matches!(outcome, RecoveryOutcome::Recovered(_)),
        };
        let mut line = serde_json::to_string(&record)
            .map_err(|e| RecoveryError::Journal(e.to_string()))?;
        line.push('\n');

        let path = self.journal_dir.join(format!(
            "errors_{}.jsonl",
            record.timestamp.format("%Y%m%d")
        ));
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|e| RecoveryError::Journal(e.to_string()))?;
        file.write_all(line.as_bytes())
            .await
            .map_err(|e| RecoveryError::Journal(e.to_string()))
    }
}
