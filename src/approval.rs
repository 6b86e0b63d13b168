//! Approval gate — watches the pending-approval partition for human
//! decisions and carries them out.
//!
//! The gate owns the side effect of every approval-gated step: when it
//! observes an approval it invokes the registered handler for the task's
//! type, and only a successful invocation moves the request to done. The
//! plan executor watches the same partitions to advance its plan but never
//! performs the effect itself, so the effect runs at most once.
//!
//! Idempotence comes from the store's atomic transitions. A decision is
//! processed by whoever wins the partition move; everyone else observes
//! `NotFound` and does nothing.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};
use uuid::Uuid;

use crate::audit::AuditEventType;
use crate::context::{HandlerRequest, WardenContext};
use crate::error::Result;
use crate::recovery::{ErrorContext, RecoveryStrategy};
use crate::store::Partition;
use crate::task::artifact::{classify_decision, extract_reason, parse_approval, ApprovalDocument};
use crate::task::Decision;

/// Outcome of one gate scan.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GateReport {
    pub scanned: usize,
    pub approved: usize,
    pub rejected: usize,
    pub needs_edit: usize,
    pub pending: usize,
}

pub struct ApprovalGate {
    ctx: Arc<WardenContext>,
}

impl ApprovalGate {
    pub fn new(ctx: Arc<WardenContext>) -> Self {
        Self { ctx }
    }

    /// Publish an approval request for a human decision.
    pub async fn create_request(&self, doc: &ApprovalDocument) -> Result<()> {
        self.ctx.store.request_approval(doc).await?;
        self.ctx
            .audit
            .info(
                AuditEventType::ApprovalRequested,
                serde_json::json!({
                    "request": doc.id,
                    "task": doc.task_id,
                    "step": doc.step,
                }),
            )
            .await?;
        info!(request = %doc.id, task = %doc.task_id, step = %doc.step, "approval requested");
        Ok(())
    }

    /// Scan the pending-approval partition once and act on every decision
    /// found. Undecided requests are left in place.
    pub async fn scan(&self) -> Result<GateReport> {
        let mut report = GateReport::default();
        for id in self.ctx.store.list(Partition::PendingApproval).await? {
            report.scanned += 1;
            match self.process(id).await {
                Ok(Decision::Approved) => report.approved += 1,
                Ok(Decision::Rejected) => report.rejected += 1,
                Ok(Decision::NeedsEdit) => report.needs_edit += 1,
                Ok(Decision::Pending) => report.pending += 1,
                Err(e) => {
                    warn!(request = %id, error = %e, "failed to process approval request");
                }
            }
        }
        Ok(report)
    }

    /// Run the gate forever, scanning on an interval.
    pub async fn run(&self, interval: Duration) -> Result<()> {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            if let Err(e) = self.scan().await {
                warn!(error = %e, "approval scan failed");
            }
        }
    }

    async fn process(&self, id: Uuid) -> Result<Decision> {
        let Some(content) = self.ctx.store.read(Partition::PendingApproval, id).await? else {
            // Raced with another scanner; nothing left to do.
            return Ok(Decision::Pending);
        };

        let decision = classify_decision(&content);
        match decision {
            Decision::Pending => {}
            Decision::Approved => self.carry_out_approval(id, &content).await?,
            Decision::Rejected => {
                let reason =
                    extract_reason(&content).unwrap_or_else(|| "no reason given".to_string());
                if self.ctx.store.reject(id, &reason).await?.moved() {
                    self.ctx
                        .audit
                        .info(
                            AuditEventType::ApprovalDenied,
                            serde_json::json!({ "request": id, "reason": reason }),
                        )
                        .await?;
                    info!(request = %id, %reason, "approval rejected");
                }
            }
            Decision::NeedsEdit => {
                // The human is still editing; check again next scan.
                info!(request = %id, "request marked for editing");
            }
        }
        Ok(decision)
    }

    /// Record the approval and run the gated side effect.
    async fn carry_out_approval(&self, id: Uuid, content: &str) -> Result<()> {
        let doc = match parse_approval(content) {
            Ok(doc) => doc,
            Err(e) => {
                warn!(request = %id, error = %e, "approved artifact is malformed, skipping");
                self.ctx
                    .recovery
                    .handle_error(
                        RecoveryStrategy::Skip,
                        ErrorContext::new("parse_approval", e.to_string()).with_artifact(id),
                    )
                    .await?;
                return Ok(());
            }
        };

        if !self.ctx.store.approve(id).await?.moved() {
            return Ok(());
        }
        self.ctx
            .audit
            .info(
                AuditEventType::ApprovalGranted,
                serde_json::json!({ "request": id, "task": doc.task_id }),
            )
            .await?;

        let Some(handler) = self.ctx.handler(doc.task_type).await else {
            let note = format!(
                "\n---\n**APPROVED** {} — no handler registered for `{}`; requires manual execution\n",
                chrono::Utc::now().to_rfc3339(),
                doc.task_type,
            );
            self.ctx.store.append(Partition::Approved, id, &note).await?;
            info!(request = %id, task_type = %doc.task_type, "approved, awaiting manual execution");
            return Ok(());
        };

        let payload = BTreeMap::new();
        let result = handler
            .handle(HandlerRequest {
                task_id: doc.task_id,
                task_type: doc.task_type,
                payload: &payload,
                content: &doc.body,
            })
            .await;

        match result {
            Ok(note) => {
                self.ctx
                    .audit
                    .info(
                        AuditEventType::HandlerInvoked,
                        serde_json::json!({ "request": id, "task": doc.task_id, "result": note }),
                    )
                    .await?;
                let stamp = format!(
                    "\n---\n**EXECUTED** {} — {}\n",
                    chrono::Utc::now().to_rfc3339(),
                    note
                );
                self.ctx.store.append(Partition::Approved, id, &stamp).await?;
                self.ctx.store.finish_approved(id).await?;
                info!(request = %id, "approved effect executed");
            }
            Err(e) => {
                // Stays in the approved partition with the failure attached.
                // scan() only lists pending requests, so from here the
                // execution is manual.
                warn!(request = %id, error = %e, "approved effect failed");
                let stamp = format!(
                    "\n---\n**EXECUTION FAILED** {} — {}\n",
                    chrono::Utc::now().to_rfc3339(),
                    e
                );
                self.ctx.store.append(Partition::Approved, id, &stamp).await?;
            }
        }
        Ok(())
    }
}
