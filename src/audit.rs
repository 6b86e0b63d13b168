//! Audit journal — append-only, checksummed record of everything the engine
//! does: task lifecycle, approvals, handler invocations, scheduled runs,
//! handled errors. One JSONL file per day; each entry carries a checksum over
//! all of its other fields so tampering is detectable after the fact.

use std::path::PathBuf;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

use crate::error::AuditError;

/// What happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventType {
    SystemStart,
    SystemStop,
    TaskCreated,
    TaskStarted,
    TaskCompleted,
    TaskFailed,
    StepCompleted,
    ApprovalRequested,
    ApprovalGranted,
    ApprovalDenied,
    HandlerInvoked,
    ScheduledRun,
    ErrorHandled,
}

/// How serious it was.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Debug,
    Info,
    Warning,
    Error,
    Critical,
}

/// One journal entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub session_id: String,
    pub event_type: AuditEventType,
    pub severity: Severity,
    pub actor: String,
    pub payload: serde_json::Value,
    /// Hex sha256 prefix over every other field.
    pub checksum: String,
}

/// Integrity verdict for one day's journal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IntegrityReport {
    pub date: NaiveDate,
    pub total: usize,
    pub valid: usize,
    pub invalid: usize,
}

impl IntegrityReport {
    /// Valid iff zero mismatches.
    pub fn is_valid(&self) -> bool {
        self.invalid == 0
    }
}

/// Per-event-type counts for one day.
#[derive(Debug, Clone, Default)]
pub struct DailySummary {
    pub total: usize,
    pub by_type: std::collections::BTreeMap<String, usize>,
    pub errors: usize,
}

/// Append-only audit journal writer/verifier.
pub struct AuditLogger {
    dir: PathBuf,
    session_id: String,
}

impl AuditLogger {
    /// Open a journal under `dir`, creating it if needed. Each process run
    /// gets its own session ID.
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self, AuditError> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| AuditError::Io(e.to_string()))?;
        Ok(Self {
            dir,
            session_id: Utc::now().format("%Y%m%d_%H%M%S").to_string(),
        })
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    fn journal_path(&self, date: NaiveDate) -> PathBuf {
        self.dir
            .join(format!("audit_{}.jsonl", date.format("%Y%m%d")))
    }

    /// Append one event and return its ID.
    pub async fn log(
        &self,
        event_type: AuditEventType,
        severity: Severity,
        actor: &str,
        payload: serde_json::Value,
    ) -> Result<Uuid, AuditError> {
        let mut event = AuditEvent {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            session_id: self.session_id.clone(),
            event_type,
            severity,
            actor: actor.to_string(),
            payload,
            checksum: String::new(),
        };
        event.checksum = checksum_of(&serde_json::to_value(&event)?);

        let mut line = serde_json::to_string(&event)?;
        line.push('\n');

        let path = self.journal_path(event.timestamp.date_naive());
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|e| AuditError::Io(e.to_string()))?;
        file.write_all(line.as_bytes())
            .await
            .map_err(|e| AuditError::Io(e.to_string()))?;

        Ok(event.id)
    }

    /// Shorthand for an informational event by the engine itself.
    pub async fn info(
        &self,
        event_type: AuditEventType,
        payload: serde_json::Value,
    ) -> Result<Uuid, AuditError> {
        self.log(event_type, Severity::Info, "taskwarden", payload)
            .await
    }

    /// Recompute every checksum in one day's journal.
    pub async fn verify(&self, date: NaiveDate) -> Result<IntegrityReport, AuditError> {
        let mut report = IntegrityReport {
            date,
            total: 0,
            valid: 0,
            invalid: 0,
        };

        let raw = match tokio::fs::read_to_string(self.journal_path(date)).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(report),
            Err(e) => return Err(AuditError::Io(e.to_string())),
        };

        for line in raw.lines().filter(|l| !l.trim().is_empty()) {
            report.total += 1;
            let Ok(value) = serde_json::from_str::<serde_json::Value>(line) else {
                report.invalid += 1;
                continue;
            };
            let stored = value
                .get("checksum")
                .and_then(|c| c.as_str())
                .unwrap_or_default()
                .to_string();
            if checksum_of(&value) == stored {
                report.valid += 1;
            } else {
                report.invalid += 1;
            }
        }

        Ok(report)
    }

    /// Per-type event counts for one day.
    pub async fn daily_summary(&self, date: NaiveDate) -> Result<DailySummary, AuditError> {
        let mut summary = DailySummary::default();

        let raw = match tokio::fs::read_to_string(self.journal_path(date)).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(summary),
            Err(e) => return Err(AuditError::Io(e.to_string())),
        };

        for line in raw.lines().filter(|l| !l.trim().is_empty()) {
            let Ok(event) = serde_json::from_str::<AuditEvent>(line) else {
                continue;
            };
            summary.total += 1;
            *summary
                .by_type
                .entry(format!("{:?}", event.event_type))
                .or_default() += 1;
            if matches!(event.severity, Severity::Error | Severity::Critical) {
                summary.errors += 1;
            }
        }

        Ok(summary)
    }
}

/// Checksum over every field except `checksum` itself. serde_json orders
/// object keys, so the digest is stable across serialization round-trips.
fn checksum_of(event: &serde_json::Value) -> String {
    let mut stripped = event.clone();
    if let Some(obj) = stripped.as_object_mut() {
        obj.remove("checksum");
    }
    let canonical = stripped.to_string();
    let digest = Sha256::digest(canonical.as_bytes());
    hex::encode(&digest[..8])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn log_and_verify_valid() {
        let dir = tempfile::tempdir().unwrap();
        let audit = AuditLogger::open(dir.path()).await.unwrap();

        audit
            .info(AuditEventType::TaskCreated, serde_json::json!({"n": 1}))
            .await
            .unwrap();
        audit
            .log(
                AuditEventType::TaskFailed,
                Severity::Error,
                "executor",
                serde_json::json!({"reason": "boom"}),
            )
            .await
            .unwrap();

        let report = audit.verify(Utc::now().date_naive()).await.unwrap();
        assert_eq!(report.total, 2);
        assert_eq!(report.valid, 2);
        assert!(report.is_valid());
    }

    #[tokio::test]
    async fn tampering_is_detected() {
        let dir = tempfile::tempdir().unwrap();
        let audit = AuditLogger::open(dir.path()).await.unwrap();
        audit
            .info(AuditEventType::TaskCreated, serde_json::json!({"who": "alice"}))
            .await
            .unwrap();

        let date = Utc::now().date_naive();
        let path = dir
            .path()
            .join(format!("audit_{}.jsonl", date.format("%Y%m%d")));
        let tampered = std::fs::read_to_string(&path)
            .unwrap()
            .replace("alice", "mallory");
        std::fs::write(&path, tampered).unwrap();

        let report = audit.verify(date).await.unwrap();
        assert_eq!(report.invalid, 1);
        assert!(!report.is_valid());
    }

    #[tokio::test]
    async fn verify_missing_day_is_empty_and_valid() {
        let dir = tempfile::tempdir().unwrap();
        let audit = AuditLogger::open(dir.path()).await.unwrap();
        let report = audit
            .verify(NaiveDate::from_ymd_opt(1999, 1, 1).unwrap())
            .await
            .unwrap();
        assert_eq!(report.total, 0);
        assert!(report.is_valid());
    }

    #[tokio::test]
    async fn daily_summary_counts_by_type() {
        let dir = tempfile::tempdir().unwrap();
        let audit = AuditLogger::open(dir.path()).await.unwrap();
        for _ in 0..3 {
            audit
                .info(AuditEventType::TaskCompleted, serde_json::json!({}))
                .await
                .unwrap();
        }
        audit
            .log(
                AuditEventType::TaskFailed,
                Severity::Error,
                "executor",
                serde_json::json!({}),
            )
            .await
            .unwrap();

        let summary = audit.daily_summary(Utc::now().date_naive()).await.unwrap();
        assert_eq!(summary.total, 4);
        assert_eq!(summary.errors, 1);
        assert_eq!(summary.by_type.get("TaskCompleted"), Some(&3));
    }
}
