//! Orchestrator — scans the inbox, plans new tasks, and dispatches them to
//! executors under a concurrency bound.
//!
//! Scan order is priority rank first, then enqueue time, then ID, so equal
//! priorities are served strictly in arrival order. The plan is persisted
//! *before* the claim: a crash between the two leaves a plan on disk and the
//! task still in the inbox, which the next cycle simply redoes.

use std::collections::BTreeMap;
use std::sync::Arc;

use futures::future::try_join_all;
use tokio::sync::Semaphore;
use tracing::{info, warn};
use uuid::Uuid;

use crate::context::WardenContext;
use crate::error::Result;
use crate::executor::PlanExecutor;
use crate::plan::Plan;
use crate::recovery::{ErrorContext, RecoveryStrategy};
use crate::store::Partition;
use crate::task::artifact::parse_task;
use crate::task::TaskDocument;

/// What one scan cycle did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    /// Artifacts found in the inbox.
    pub scanned: usize,
    /// Tasks claimed and dispatched, in dispatch order.
    pub processed: Vec<Uuid>,
    /// Malformed artifacts routed to the skipped partition.
    pub skipped: usize,
    /// Tasks left in the inbox because all execution slots were busy.
    pub deferred: usize,
}

pub struct Orchestrator {
    ctx: Arc<WardenContext>,
    permits: Arc<Semaphore>,
}

impl Orchestrator {
    pub fn new(ctx: Arc<WardenContext>) -> Self {
        let permits = Arc::new(Semaphore::new(ctx.config.max_concurrent_tasks));
        Self { ctx, permits }
    }

    /// Scan the inbox once: parse, sort, and dispatch up to the concurrency
    /// bound. Tasks that do not get a slot stay in the inbox untouched.
    pub async fn run_cycle(&self) -> Result<CycleReport> {
        let mut report = CycleReport::default();

        let ids = self.ctx.store.list(Partition::Inbox).await?;
        report.scanned = ids.len();

        let mut docs: Vec<TaskDocument> = Vec::new();
        for id in ids {
            let Some(content) = self.ctx.store.read(Partition::Inbox, id).await? else {
                continue;
            };
            match parse_task(&content) {
                Ok(doc) => docs.push(doc),
                Err(e) => {
                    warn!(artifact = %id, error = %e, "malformed inbox artifact");
                    self.ctx
                        .recovery
                        .handle_error(
                            RecoveryStrategy::Skip,
                            ErrorContext::new("parse_task", e.to_string()).with_artifact(id),
                        )
                        .await?;
                    report.skipped += 1;
                }
            }
        }

        docs.sort_by_key(|doc| (doc.task.priority.rank(), doc.task.created, doc.task.id));

        let mut remaining = docs.len();
        for doc in docs {
            let Ok(permit) = self.permits.clone().try_acquire_owned() else {
                report.deferred = remaining;
                break;
            };
            remaining -= 1;

            let task_id = doc.task.id;
            let plan = Plan::for_task(task_id, doc.task.task_type);
            self.save_plan(&plan).await?;

            if !self.ctx.store.claim(task_id).await?.moved() {
                // Gone between scan and claim; someone else has it.
                drop(permit);
                continue;
            }
            report.processed.push(task_id);
            info!(task = %task_id, task_type = %doc.task.task_type, "task dispatched");

            let executor = PlanExecutor::new(self.ctx.clone());
            tokio::spawn(async move {
                let _permit = permit;
                if let Err(e) = executor.execute(&doc, plan).await {
                    warn!(task = %task_id, error = %e, "task execution ended with error");
                }
            });
        }

        Ok(report)
    }

    /// Resume tasks left in the in-progress partition by a previous run.
    /// Called once at startup, before the first scan cycle.
    pub async fn recover(&self) -> Result<usize> {
        let mut resumed = 0;
        for id in self.ctx.store.list(Partition::InProgress).await? {
            let Some(content) = self.ctx.store.read(Partition::InProgress, id).await? else {
                continue;
            };
            let doc = match parse_task(&content) {
                Ok(doc) => doc,
                Err(e) => {
                    warn!(artifact = %id, error = %e, "unreadable in-progress artifact");
                    self.ctx
                        .recovery
                        .handle_error(
                            RecoveryStrategy::Quarantine,
                            ErrorContext::new("parse_task", e.to_string()).with_artifact(id),
                        )
                        .await?;
                    continue;
                }
            };

            let plan = match self.ctx.store.load_plan(id).await? {
                Some(raw) => match Plan::from_json(&raw) {
                    Ok(plan) => plan,
                    Err(e) => {
                        warn!(task = %id, error = %e, "persisted plan unreadable, rebuilding");
                        Plan::for_task(id, doc.task.task_type)
                    }
                },
                None => Plan::for_task(id, doc.task.task_type),
            };

            let Ok(permit) = self.permits.clone().acquire_owned().await else {
                break;
            };
            resumed += 1;
            info!(task = %id, "resuming interrupted task");

            let executor = PlanExecutor::new(self.ctx.clone());
            tokio::spawn(async move {
                let _permit = permit;
                if let Err(e) = executor.execute(&doc, plan).await {
                    warn!(task = %id, error = %e, "resumed task ended with error");
                }
            });
        }
        Ok(resumed)
    }

    /// Run forever: recover once, then scan on the configured interval.
    pub async fn run(&self) -> Result<()> {
        let resumed = self.recover().await?;
        if resumed > 0 {
            info!(resumed, "recovered interrupted tasks");
        }
        let mut ticker = tokio::time::interval(self.ctx.config.scan_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            match self.run_cycle().await {
                Ok(report) if !report.processed.is_empty() => {
                    info!(
                        scanned = report.scanned,
                        dispatched = report.processed.len(),
                        deferred = report.deferred,
                        "scan cycle done"
                    );
                }
                Ok(_) => {}
                Err(e) => warn!(error = %e, "scan cycle failed"),
            }
        }
    }

    /// Artifact counts per partition.
    pub async fn status(&self) -> Result<BTreeMap<Partition, usize>> {
        let counts = try_join_all(Partition::ALL.map(|partition| {
            let store = self.ctx.store.clone();
            async move {
                store
                    .list(partition)
                    .await
                    .map(|ids| (partition, ids.len()))
            }
        }))
        .await?;
        Ok(counts.into_iter().collect())
    }

    async fn save_plan(&self, plan: &Plan) -> Result<()> {
        let raw = plan
            .to_json()
            .map_err(|e| crate::error::StoreError::Serialization(e.to_string()))?;
        self.ctx.store.save_plan(plan.task_id, &raw).await?;
        Ok(())
    }
}
