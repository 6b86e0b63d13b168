//! Plan executor — walks a task's plan step by step, persisting the plan
//! after every transition so execution resumes exactly where it stopped.
//!
//! Approval-gated steps publish a request and then only *watch* for the
//! outcome; the approval gate performs the effect. Ungated steps run their
//! action directly, with bounded retries and exponential backoff. The
//! executor re-checks that its task is still claimed at every boundary and
//! stands down if a human moved the artifact away.

use std::sync::Arc;

use tokio::time::Instant;
use tracing::{info, warn};
use uuid::Uuid;

use crate::approval::ApprovalGate;
use crate::audit::AuditEventType;
use crate::context::{HandlerRequest, WardenContext};
use crate::error::{Error, ExecutorError, Result, StoreError};
use crate::plan::{Plan, Step, StepAction, StepStatus};
use crate::recovery::{backoff_delay, ErrorContext, RecoveryStrategy};
use crate::store::Partition;
use crate::task::artifact::ApprovalDocument;
use crate::task::model::{Priority, Task, TaskType};
use crate::task::TaskDocument;

/// How a gated step's approval request ended.
enum GateOutcome {
    Approved,
    Rejected(String),
    TimedOut,
}

pub struct PlanExecutor {
    ctx: Arc<WardenContext>,
    gate: ApprovalGate,
}

impl PlanExecutor {
    pub fn new(ctx: Arc<WardenContext>) -> Self {
        Self {
            gate: ApprovalGate::new(ctx.clone()),
            ctx,
        }
    }

    /// Execute (or resume) a plan for a claimed task. The task must be in
    /// the in-progress partition; when every step completes the task moves
    /// to done, otherwise to failed.
    pub async fn execute(&self, doc: &TaskDocument, mut plan: Plan) -> Result<()> {
        let task = &doc.task;
        self.ctx
            .audit
            .info(
                AuditEventType::TaskStarted,
                serde_json::json!({ "task": task.id, "type": task.task_type }),
            )
            .await?;

        for index in 0..plan.steps.len() {
            let step = plan.steps[index].clone();
            if step.status.is_settled() {
                continue;
            }
            self.check_claimed(task.id).await?;

            // A rejected or failed step does not abort the plan; remaining
            // steps still run and the per-step statuses are kept for triage.
            if step.needs_approval && task.requires_approval {
                self.run_gated_step(doc, &mut plan, index).await?;
            } else {
                self.run_step(doc, &mut plan, index).await?;
            }
        }

        self.persist(&plan).await?;
        if plan.all_completed() {
            self.ctx.store.complete(task.id).await?;
            self.ctx
                .audit
                .info(
                    AuditEventType::TaskCompleted,
                    serde_json::json!({ "task": task.id }),
                )
                .await?;
            info!(task = %task.id, "task completed");
        } else {
            self.ctx.store.fail(task.id).await?;
            self.ctx
                .audit
                .info(
                    AuditEventType::TaskFailed,
                    serde_json::json!({ "task": task.id }),
                )
                .await?;
            warn!(task = %task.id, "task failed");
        }
        Ok(())
    }

    /// Error out if the task artifact left the in-progress partition. A
    /// human moving the file is an instruction to stand down.
    async fn check_claimed(&self, task_id: Uuid) -> Result<()> {
        match self.ctx.store.locate(task_id).await? {
            Some(Partition::InProgress) => Ok(()),
            other => {
                warn!(task = %task_id, partition = ?other, "task no longer claimed, standing down");
                Err(Error::Executor(ExecutorError::Abandoned { task_id }))
            }
        }
    }

    /// Publish the approval request for a gated step and wait for the
    /// human decision, polling the store.
    async fn run_gated_step(
        &self,
        doc: &TaskDocument,
        plan: &mut Plan,
        index: usize,
    ) -> Result<()> {
        let task = &doc.task;
        let step = plan.steps[index].clone();

        // Reuse the request published before a restart, if it still exists.
        let request_id = match step.approval_request {
            Some(id) if self.ctx.store.locate(id).await?.is_some() => id,
            _ => {
                let request = ApprovalDocument::new(
                    task.id,
                    step.name.clone(),
                    task.task_type,
                    approval_body(doc, &step),
                );
                self.gate.create_request(&request).await?;
                request.id
            }
        };
        plan.steps[index].approval_request = Some(request_id);
        plan.record(index, StepStatus::WaitingApproval, None);
        self.persist(plan).await?;

        match self.await_decision(task.id, request_id).await? {
            GateOutcome::Approved => {
                plan.record(index, StepStatus::Completed, Some("approved".to_string()));
            }
            GateOutcome::Rejected(reason) => {
                plan.record(
                    index,
                    StepStatus::Skipped,
                    Some(format!("rejected: {reason}")),
                );
            }
            GateOutcome::TimedOut => {
                let reason = format!(
                    "timeout: no decision within {:?}",
                    self.ctx.config.approval_max_wait
                );
                self.ctx.store.reject(request_id, &reason).await?;
                plan.record(index, StepStatus::Skipped, Some(reason));
            }
        }
        self.persist(plan).await?;
        Ok(())
    }

    /// Poll the approval request's partition until it settles or the
    /// decision window closes.
    async fn await_decision(&self, task_id: Uuid, request_id: Uuid) -> Result<GateOutcome> {
        let deadline = Instant::now() + self.ctx.config.approval_max_wait;
        loop {
            match self.ctx.store.locate(request_id).await? {
                Some(Partition::PendingApproval) => {}
                Some(Partition::Approved) | Some(Partition::Done) => {
                    return Ok(GateOutcome::Approved)
                }
                Some(Partition::Rejected) => {
                    let reason = self
                        .ctx
                        .store
                        .read(Partition::Rejected, request_id)
                        .await?
                        .and_then(|c| crate::task::artifact::extract_reason(&c))
                        .unwrap_or_else(|| "no reason given".to_string());
                    return Ok(GateOutcome::Rejected(reason));
                }
                // Anyone moving the request elsewhere counts as a refusal.
                _ => return Ok(GateOutcome::Rejected("request withdrawn".to_string())),
            }
            if Instant::now() >= deadline {
                return Ok(GateOutcome::TimedOut);
            }
            self.check_claimed(task_id).await?;
            tokio::time::sleep(self.ctx.config.approval_poll_interval).await;
        }
    }

    /// Run an ungated step with bounded retries.
    async fn run_step(
        &self,
        doc: &TaskDocument,
        plan: &mut Plan,
        index: usize,
    ) -> Result<()> {
        let step = plan.steps[index].clone();
        plan.record(index, StepStatus::InProgress, None);
        self.persist(plan).await?;

        let max_retries = self.ctx.config.max_retries;
        let mut last_error = String::new();
        for attempt in 0..max_retries {
            if attempt > 0 {
                tokio::time::sleep(backoff_delay(self.ctx.config.retry_base_delay, attempt - 1))
                    .await;
            }
            plan.steps[index].attempts = attempt + 1;

            let run = self.run_action(doc, &step);
            let result = match tokio::time::timeout(self.ctx.config.step_timeout, run).await {
                Ok(result) => result,
                Err(_) => Err(format!(
                    "timed out after {:?}",
                    self.ctx.config.step_timeout
                )),
            };

            match result {
                Ok(note) => {
                    plan.record(index, StepStatus::Completed, Some(note.clone()));
                    self.persist(plan).await?;
                    self.ctx
                        .audit
                        .info(
                            AuditEventType::StepCompleted,
                            serde_json::json!({
                                "task": doc.task.id,
                                "step": step.name,
                                "note": note,
                            }),
                        )
                        .await?;
                    return Ok(());
                }
                Err(msg) => {
                    warn!(
                        task = %doc.task.id,
                        step = %step.name,
                        attempt = attempt + 1,
                        error = %msg,
                        "step attempt failed"
                    );
                    plan.steps[index].last_error = Some(msg.clone());
                    last_error = msg;
                    self.persist(plan).await?;
                }
            }
        }

        plan.record(index, StepStatus::Failed, Some(last_error.clone()));
        self.persist(plan).await?;
        self.ctx
            .recovery
            .handle_error(
                RecoveryStrategy::Skip,
                ErrorContext::new(
                    format!("step:{}", step.name),
                    format!(
                        "step '{}' failed after {} attempts: {}",
                        step.name, max_retries, last_error
                    ),
                ),
            )
            .await?;
        Ok(())
    }

    /// Perform a single step action once.
    async fn run_action(&self, doc: &TaskDocument, step: &Step) -> std::result::Result<String, String> {
        let task = &doc.task;
        match step.action {
            StepAction::Review => Ok(format!("{} reviewed", step.name)),
            StepAction::Verify => Ok(format!("{} verified", step.name)),
            // A Draft step reaching this path belongs to an approval-exempt
            // task; it behaves like a direct invocation.
            StepAction::Draft | StepAction::Invoke => {
                match self.ctx.handler(task.task_type).await {
                    Some(handler) => handler
                        .handle(HandlerRequest {
                            task_id: task.id,
                            task_type: task.task_type,
                            payload: &task.payload,
                            content: &doc.body,
                        })
                        .await
                        .map_err(|e| e.to_string()),
                    None => Ok("no handler registered; manual follow-up required".to_string()),
                }
            }
            StepAction::FollowUp => {
                let follow_up = Task::new(TaskType::Generic, "follow_up", Priority::Medium)
                    .with_requires_approval(false)
                    .with_payload("parent_task", task.id.to_string());
                let id = follow_up.id;
                let body = format!(
                    "# Follow up\n\nCheck on the outcome of task {} ({}).\n",
                    task.id, task.task_type
                );
                self.ctx
                    .store
                    .enqueue(&TaskDocument::new(follow_up, body))
                    .await
                    .map_err(|e| e.to_string())?;
                Ok(format!("follow-up task {id} enqueued"))
            }
        }
    }

    async fn persist(&self, plan: &Plan) -> Result<()> {
        let raw = plan
            .to_json()
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        self.ctx.store.save_plan(plan.task_id, &raw).await?;
        Ok(())
    }
}

/// Body of the approval request shown to the human for a gated step.
fn approval_body(doc: &TaskDocument, step: &Step) -> String {
    let mut out = format!(
        "# Approval needed: {}\n\n{}\n\n## Task\n\n",
        step.name, step.description
    );
    out.push_str(&format!("- id: {}\n", doc.task.id));
    out.push_str(&format!("- type: {}\n", doc.task.task_type));
    out.push_str(&format!("- source: {}\n", doc.task.source));
    for (key, value) in &doc.task.payload {
        out.push_str(&format!("- {key}: {value}\n"));
    }
    out.push_str("\n## Content\n\n");
    out.push_str(&doc.body);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;

    use crate::audit::AuditLogger;
    use crate::config::WardenConfig;
    use crate::context::ActionHandler;
    use crate::error::HandlerError;
    use crate::recovery::ErrorRecovery;
    use crate::store::FsTaskStore;

    struct StubHandler {
        calls: AtomicU32,
        fail: bool,
    }

    #[async_trait]
    impl ActionHandler for StubHandler {
        async fn handle(
            &self,
            _req: HandlerRequest<'_>,
        ) -> std::result::Result<String, HandlerError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(HandlerError::new("backend unavailable"))
            } else {
                Ok("done".to_string())
            }
        }
    }

    fn fast_config() -> WardenConfig {
        WardenConfig {
            max_retries: 3,
            retry_base_delay: Duration::from_millis(1),
            step_timeout: Duration::from_secs(5),
            approval_poll_interval: Duration::from_millis(10),
            approval_max_wait: Duration::from_secs(5),
            ..WardenConfig::default()
        }
    }

    async fn context(dir: &tempfile::TempDir, config: WardenConfig) -> Arc<WardenContext> {
        let store = Arc::new(FsTaskStore::open(dir.path().join("vault")).await.unwrap());
        let recovery = Arc::new(
            ErrorRecovery::new(
                store.clone(),
                dir.path().join("state"),
                config.breaker_threshold,
                config.breaker_reset_window,
                config.max_retries,
                config.retry_base_delay,
            )
            .await
            .unwrap(),
        );
        let audit = Arc::new(AuditLogger::open(dir.path().join("audit")).await.unwrap());
        Arc::new(WardenContext::new(config, store, recovery, audit))
    }

    async fn claimed_task(ctx: &WardenContext, task: Task, body: &str) -> TaskDocument {
        let doc = TaskDocument::new(task, body);
        ctx.store.enqueue(&doc).await.unwrap();
        ctx.store.claim(doc.task.id).await.unwrap();
        doc
    }

    #[tokio::test]
    async fn ungated_plan_runs_to_done() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(&dir, fast_config()).await;
        let handler = Arc::new(StubHandler {
            calls: AtomicU32::new(0),
            fail: false,
        });
        ctx.register_handler(TaskType::Generic, handler.clone()).await;

        let task = Task::new(TaskType::Generic, "test", Priority::Medium)
            .with_requires_approval(false);
        let doc = claimed_task(&ctx, task, "do the thing").await;
        let plan = Plan::for_task(doc.task.id, doc.task.task_type);

        PlanExecutor::new(ctx.clone())
            .execute(&doc, plan)
            .await
            .unwrap();

        assert_eq!(
            ctx.store.locate(doc.task.id).await.unwrap(),
            Some(Partition::Done)
        );
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
        let saved = ctx.store.load_plan(doc.task.id).await.unwrap().unwrap();
        let plan = Plan::from_json(&saved).unwrap();
        assert!(plan.all_completed());
    }

    #[tokio::test]
    async fn failing_handler_exhausts_retries_then_fails_task() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(&dir, fast_config()).await;
        let handler = Arc::new(StubHandler {
            calls: AtomicU32::new(0),
            fail: true,
        });
        ctx.register_handler(TaskType::Generic, handler.clone()).await;

        let task = Task::new(TaskType::Generic, "test", Priority::Medium)
            .with_requires_approval(false);
        let doc = claimed_task(&ctx, task, "doomed").await;
        let plan = Plan::for_task(doc.task.id, doc.task.task_type);

        PlanExecutor::new(ctx.clone())
            .execute(&doc, plan)
            .await
            .unwrap();

        assert_eq!(handler.calls.load(Ordering::SeqCst), 3);
        assert_eq!(
            ctx.store.locate(doc.task.id).await.unwrap(),
            Some(Partition::Failed)
        );

        let saved = ctx.store.load_plan(doc.task.id).await.unwrap().unwrap();
        let plan = Plan::from_json(&saved).unwrap();
        let failed = plan
            .steps
            .iter()
            .find(|s| s.action == StepAction::Invoke)
            .unwrap();
        assert_eq!(failed.status, StepStatus::Failed);
        assert_eq!(failed.attempts, 3);
        assert!(failed.last_error.as_deref().unwrap().contains("backend unavailable"));
        // Execution degrades gracefully: the surrounding steps still ran.
        assert_eq!(plan.steps[0].status, StepStatus::Completed);
        assert_eq!(plan.steps.last().unwrap().status, StepStatus::Completed);
    }

    #[tokio::test]
    async fn approval_exempt_post_with_broken_handler_retries_then_degrades() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(&dir, fast_config()).await;
        let handler = Arc::new(StubHandler {
            calls: AtomicU32::new(0),
            fail: true,
        });
        ctx.register_handler(TaskType::SocialPost, handler.clone()).await;

        let task = Task::new(TaskType::SocialPost, "test", Priority::Medium)
            .with_requires_approval(false);
        let doc = claimed_task(&ctx, task, "post body").await;
        let plan = Plan::for_task(doc.task.id, doc.task.task_type);

        PlanExecutor::new(ctx.clone())
            .execute(&doc, plan)
            .await
            .unwrap();

        assert_eq!(handler.calls.load(Ordering::SeqCst), 3);
        let saved = ctx.store.load_plan(doc.task.id).await.unwrap().unwrap();
        let plan = Plan::from_json(&saved).unwrap();
        let draft = plan
            .steps
            .iter()
            .find(|s| s.action == StepAction::Draft)
            .unwrap();
        assert_eq!(draft.status, StepStatus::Failed);
        assert_eq!(draft.attempts, 3);
        for step in plan.steps.iter().filter(|s| s.action != StepAction::Draft) {
            assert_eq!(step.status, StepStatus::Completed);
        }
        assert_eq!(
            ctx.store.locate(doc.task.id).await.unwrap(),
            Some(Partition::Failed)
        );
    }

    #[tokio::test]
    async fn gated_step_completes_when_request_is_approved() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(&dir, fast_config()).await;

        let task = Task::new(TaskType::Email, "gmail", Priority::High);
        let doc = claimed_task(&ctx, task, "client email").await;
        let plan = Plan::for_task(doc.task.id, doc.task.task_type);

        let exec_ctx = ctx.clone();
        let exec_doc = doc.clone();
        let exec = tokio::spawn(async move {
            PlanExecutor::new(exec_ctx).execute(&exec_doc, plan).await
        });

        // Wait for the request to appear, then play the approving human.
        let request_id = loop {
            let pending = ctx.store.list(Partition::PendingApproval).await.unwrap();
            if let Some(&id) = pending.first() {
                break id;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        };
        ctx.store.approve(request_id).await.unwrap();

        exec.await.unwrap().unwrap();
        assert_eq!(
            ctx.store.locate(doc.task.id).await.unwrap(),
            Some(Partition::Done)
        );
        let saved = ctx.store.load_plan(doc.task.id).await.unwrap().unwrap();
        assert!(Plan::from_json(&saved).unwrap().all_completed());

        // Publishing went through the gate, which journals the request
        // exactly once.
        let summary = ctx
            .audit
            .daily_summary(chrono::Utc::now().date_naive())
            .await
            .unwrap();
        assert_eq!(summary.by_type.get("ApprovalRequested"), Some(&1));
    }

    #[tokio::test]
    async fn approval_timeout_rejects_request_and_fails_task() {
        let dir = tempfile::tempdir().unwrap();
        let config = WardenConfig {
            approval_poll_interval: Duration::from_millis(5),
            approval_max_wait: Duration::from_millis(30),
            ..fast_config()
        };
        let ctx = context(&dir, config).await;

        let task = Task::new(TaskType::Email, "gmail", Priority::High);
        let doc = claimed_task(&ctx, task, "client email").await;
        let plan = Plan::for_task(doc.task.id, doc.task.task_type);

        PlanExecutor::new(ctx.clone())
            .execute(&doc, plan)
            .await
            .unwrap();

        assert_eq!(
            ctx.store.locate(doc.task.id).await.unwrap(),
            Some(Partition::Failed)
        );
        let rejected = ctx.store.list(Partition::Rejected).await.unwrap();
        assert_eq!(rejected.len(), 1);
        let content = ctx
            .store
            .read(Partition::Rejected, rejected[0])
            .await
            .unwrap()
            .unwrap();
        assert!(content.contains("timeout"));
    }

    #[tokio::test]
    async fn unclaimed_task_makes_executor_stand_down() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(&dir, fast_config()).await;

        // Enqueued but never claimed; the artifact sits in the inbox.
        let doc = TaskDocument::new(
            Task::new(TaskType::Generic, "test", Priority::Medium).with_requires_approval(false),
            "body",
        );
        ctx.store.enqueue(&doc).await.unwrap();
        let plan = Plan::for_task(doc.task.id, doc.task.task_type);

        let result = PlanExecutor::new(ctx.clone()).execute(&doc, plan).await;
        assert!(matches!(
            result,
            Err(Error::Executor(ExecutorError::Abandoned { .. }))
        ));
        assert_eq!(
            ctx.store.locate(doc.task.id).await.unwrap(),
            Some(Partition::Inbox)
        );
    }

    #[tokio::test]
    async fn resume_skips_settled_steps() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(&dir, fast_config()).await;
        let handler = Arc::new(StubHandler {
            calls: AtomicU32::new(0),
            fail: false,
        });
        ctx.register_handler(TaskType::Generic, handler.clone()).await;

        let task = Task::new(TaskType::Generic, "test", Priority::Medium)
            .with_requires_approval(false);
        let doc = claimed_task(&ctx, task, "body").await;

        // A plan interrupted after its first two steps.
        let mut plan = Plan::for_task(doc.task.id, doc.task.task_type);
        plan.record(0, StepStatus::Completed, None);
        plan.record(1, StepStatus::Completed, None);

        PlanExecutor::new(ctx.clone())
            .execute(&doc, plan)
            .await
            .unwrap();

        assert_eq!(
            ctx.store.locate(doc.task.id).await.unwrap(),
            Some(Partition::Done)
        );
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
    }
}
