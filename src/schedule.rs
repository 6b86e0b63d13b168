//! Scheduled task runner — recurring maintenance work (inbox sweeps, audit
//! verification, morning summaries) on interval or cron schedules.
//!
//! Last-run times are persisted, so a restart never replays work that
//! already ran. A run that fails or times out still advances the last-run
//! time; recurring work waits for its next slot instead of retrying in a
//! tight loop.

use std::collections::HashMap;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::audit::{AuditEventType, AuditLogger};
use crate::error::ScheduleError;

/// When a task should run.
pub enum Schedule {
    /// At most once per interval.
    Every(Duration),
    /// On a cron expression (with seconds field).
    Cron(Box<cron::Schedule>),
}

impl Schedule {
    pub fn every(interval: Duration) -> Self {
        Self::Every(interval)
    }

    pub fn cron(expr: &str) -> Result<Self, ScheduleError> {
        cron::Schedule::from_str(expr)
            .map(|s| Self::Cron(Box::new(s)))
            .map_err(|e| ScheduleError::InvalidExpression(format!("{expr}: {e}")))
    }
}

/// Whether a schedule is due at `now`, given when it last ran. A task that
/// never ran is always due.
pub fn should_run(schedule: &Schedule, last_run: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
    let Some(last) = last_run else {
        return true;
    };
    match schedule {
        Schedule::Every(interval) => {
            (now - last).to_std().map(|e| e >= *interval).unwrap_or(false)
        }
        Schedule::Cron(sched) => sched
            .after(&last)
            .next()
            .map(|next| next <= now)
            .unwrap_or(false),
    }
}

/// A recurring unit of maintenance work.
#[async_trait]
pub trait ScheduledAction: Send + Sync {
    /// Stable name; also the persistence key for last-run state.
    fn name(&self) -> &str;

    /// Do the work. Returns a short summary for the run log.
    async fn run(&self) -> crate::error::Result<String>;
}

/// Outcome of one scheduled run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunResult {
    pub name: String,
    pub at: DateTime<Utc>,
    pub ok: bool,
    pub message: String,
    pub duration_ms: u64,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct RunnerState {
    last_runs: HashMap<String, DateTime<Utc>>,
    last_results: HashMap<String, RunResult>,
}

struct Entry {
    schedule: Schedule,
    action: Arc<dyn ScheduledAction>,
}

/// Drives registered scheduled actions, persisting last-run state.
pub struct ScheduleRunner {
    tasks: HashMap<String, Entry>,
    state_path: PathBuf,
    state: Mutex<RunnerState>,
    timeout: Duration,
    audit: Arc<AuditLogger>,
}

impl ScheduleRunner {
    /// Load runner state from `state_path`, starting fresh if absent.
    pub async fn load(
        state_path: impl Into<PathBuf>,
        timeout: Duration,
        audit: Arc<AuditLogger>,
    ) -> Result<Self, ScheduleError> {
        let state_path = state_path.into();
        if let Some(parent) = state_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| ScheduleError::State(e.to_string()))?;
        }
        let state = match tokio::fs::read_to_string(&state_path).await {
            Ok(raw) => serde_json::from_str(&raw).unwrap_or_default(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => RunnerState::default(),
            Err(e) => return Err(ScheduleError::State(e.to_string())),
        };
        Ok(Self {
            tasks: HashMap::new(),
            state_path,
            state: Mutex::new(state),
            timeout,
            audit,
        })
    }

    /// Register an action under its own name.
    pub fn register(&mut self, schedule: Schedule, action: Arc<dyn ScheduledAction>) {
        self.tasks.insert(action.name().to_string(), Entry { schedule, action });
    }

    pub fn task_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.tasks.keys().map(String::as_str).collect();
        names.sort();
        names
    }

    /// Run one task by name. Returns `None` if it is not yet due and
    /// `force` is false. The last-run time advances whether or not the run
    /// succeeds.
    pub async fn run_named(
        &self,
        name: &str,
        force: bool,
    ) -> Result<Option<RunResult>, ScheduleError> {
        let entry = self
            .tasks
            .get(name)
            .ok_or_else(|| ScheduleError::UnknownTask(name.to_string()))?;

        let now = Utc::now();
        {
            let state = self.state.lock().await;
            let last_run = state.last_runs.get(name).copied();
            if !force && !should_run(&entry.schedule, last_run, now) {
                return Ok(None);
            }
        }

        let started = std::time::Instant::now();
        let outcome = tokio::time::timeout(self.timeout, entry.action.run()).await;
        let (ok, message) = match outcome {
            Ok(Ok(summary)) => (true, summary),
            Ok(Err(e)) => (false, e.to_string()),
            Err(_) => (false, format!("timed out after {:?}", self.timeout)),
        };

        let result = RunResult {
            name: name.to_string(),
            at: now,
            ok,
            message: message.clone(),
            duration_ms: started.elapsed().as_millis() as u64,
        };
        if ok {
            info!(task = name, %message, "scheduled task ran");
        } else {
            warn!(task = name, %message, "scheduled task failed");
        }
        if let Err(e) = self
            .audit
            .info(
                AuditEventType::ScheduledRun,
                serde_json::json!({ "task": name, "ok": ok, "message": message }),
            )
            .await
        {
            warn!(error = %e, "audit write failed for scheduled run");
        }

        {
            let mut state = self.state.lock().await;
            state.last_runs.insert(name.to_string(), now);
            state.last_results.insert(name.to_string(), result.clone());
            self.persist(&state).await?;
        }
        Ok(Some(result))
    }

    /// Run everything that is due, in name order.
    pub async fn run_all_due(&self) -> Result<Vec<RunResult>, ScheduleError> {
        let mut ran = Vec::new();
        for name in self.task_names() {
            let name = name.to_string();
            if let Some(result) = self.run_named(&name, false).await? {
                ran.push(result);
            }
        }
        Ok(ran)
    }

    /// Run forever, checking for due tasks on an interval.
    pub async fn run(&self, check_interval: Duration) -> Result<(), ScheduleError> {
        let mut ticker = tokio::time::interval(check_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            if let Err(e) = self.run_all_due().await {
                warn!(error = %e, "scheduled sweep failed");
            }
        }
    }

    /// Most recent result for a task, if it ever ran.
    pub async fn last_result(&self, name: &str) -> Option<RunResult> {
        self.state.lock().await.last_results.get(name).cloned()
    }

    async fn persist(&self, state: &RunnerState) -> Result<(), ScheduleError> {
        let raw = serde_json::to_string_pretty(state)
            .map_err(|e| ScheduleError::State(e.to_string()))?;
        tokio::fs::write(&self.state_path, raw)
            .await
            .map_err(|e| ScheduleError::State(e.to_string()))
    }
}
