//! Watchers — pollers that detect external work (mail, messages,
//! notifications) and enqueue tasks for the orchestrator.
//!
//! A watcher only observes and describes; it never claims or executes. Its
//! drafts become inbox artifacts, and everything downstream is the
//! orchestrator's business.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{info, warn};
use uuid::Uuid;

use crate::audit::AuditEventType;
use crate::context::WardenContext;
use crate::error::Result;
use crate::task::model::{Priority, Task, TaskType};
use crate::task::TaskDocument;

/// A unit of detected work, before it becomes a task.
pub struct TaskDraft {
    pub task_type: TaskType,
    pub priority: Priority,
    pub requires_approval: bool,
    pub payload: BTreeMap<String, String>,
    pub body: String,
}

impl TaskDraft {
    pub fn new(task_type: TaskType, body: impl Into<String>) -> Self {
        Self {
            task_type,
            priority: Priority::Medium,
            requires_approval: true,
            payload: BTreeMap::new(),
            body: body.into(),
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_requires_approval(mut self, requires_approval: bool) -> Self {
        self.requires_approval = requires_approval;
        self
    }

    pub fn with_payload(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.payload.insert(key.into(), value.into());
        self
    }
}

/// A source of new work.
#[async_trait]
pub trait Watcher: Send + Sync {
    /// Stable name; recorded as the `source` of every task it produces.
    fn name(&self) -> &str;

    fn poll_interval(&self) -> Duration {
        Duration::from_secs(60)
    }

    /// Check the source once and describe anything new.
    async fn poll(&self) -> Result<Vec<TaskDraft>>;
}

/// Enqueue a batch of drafts from one watcher. Returns the new task IDs.
pub async fn enqueue_drafts(
    ctx: &WardenContext,
    source: &str,
    drafts: Vec<TaskDraft>,
) -> Result<Vec<Uuid>> {
    let mut ids = Vec::with_capacity(drafts.len());
    for draft in drafts {
        let mut task = Task::new(draft.task_type, source, draft.priority)
            .with_requires_approval(draft.requires_approval);
        task.payload = draft.payload;
        let id = task.id;

        ctx.store.enqueue(&TaskDocument::new(task, draft.body)).await?;
        ctx.audit
            .info(
                AuditEventType::TaskCreated,
                serde_json::json!({ "task": id, "source": source, "type": draft.task_type }),
            )
            .await?;
        info!(task = %id, source, "task enqueued");
        ids.push(id);
    }
    Ok(ids)
}

/// Run a watcher forever on its own poll interval.
pub fn spawn_watcher(
    ctx: Arc<WardenContext>,
    watcher: Arc<dyn Watcher>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(watcher.poll_interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            match watcher.poll().await {
                Ok(drafts) if !drafts.is_empty() => {
                    if let Err(e) = enqueue_drafts(&ctx, watcher.name(), drafts).await {
                        warn!(watcher = watcher.name(), error = %e, "failed to enqueue drafts");
                    }
                }
                Ok(_) => {}
                Err(e) => warn!(watcher = watcher.name(), error = %e, "watcher poll failed"),
            }
        }
    })
}
