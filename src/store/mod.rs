//! Task store — lifecycle state as a physical location.
//!
//! A task's state *is* the partition holding its artifact, and every state
//! change is a single atomic move between partitions. The `TaskStore` trait
//! is the only shared mutable resource in the engine; subsystems coordinate
//! exclusively through its transitions. The filesystem backend in
//! [`fs`] keeps artifacts human-inspectable, but nothing outside this module
//! depends on that — an embedded KV backend could satisfy the same trait.

pub mod fs;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::StoreError;
use crate::task::artifact::{render_approval, render_task, ApprovalDocument, TaskDocument};

pub use fs::FsTaskStore;

/// Named lifecycle partitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Partition {
    /// New work produced by watchers, not yet claimed.
    Inbox,
    /// Claimed by the orchestrator; a plan is executing.
    InProgress,
    /// Approval requests awaiting a human decision.
    PendingApproval,
    /// Decision observed; side effect pending or needing manual follow-up.
    Approved,
    /// Decision was negative.
    Rejected,
    /// All steps completed.
    Done,
    /// At least one step failed or was skipped; kept for triage.
    Failed,
    /// Deliberately skipped by error recovery.
    Skipped,
    /// Isolated with diagnostics for manual review.
    Quarantine,
}

impl Partition {
    /// Directory name used by the filesystem backend.
    pub fn dir_name(&self) -> &'static str {
        match self {
            Self::Inbox => "inbox",
            Self::InProgress => "in_progress",
            Self::PendingApproval => "pending_approval",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::Done => "done",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
            Self::Quarantine => "quarantine",
        }
    }

    /// All partitions, in the order `locate` searches them.
    pub const ALL: [Partition; 9] = [
        Self::Inbox,
        Self::InProgress,
        Self::PendingApproval,
        Self::Approved,
        Self::Rejected,
        Self::Done,
        Self::Failed,
        Self::Skipped,
        Self::Quarantine,
    ];

    /// Partitions a live artifact can occupy.
    pub const ACTIVE: [Partition; 4] = [
        Self::Inbox,
        Self::InProgress,
        Self::PendingApproval,
        Self::Approved,
    ];

    pub fn is_active(&self) -> bool {
        Self::ACTIVE.contains(self)
    }
}

impl std::fmt::Display for Partition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.dir_name())
    }
}

/// Result of a transition. A missing source record is a reportable no-op,
/// never an error that aborts the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionOutcome {
    Moved,
    NotFound,
}

impl TransitionOutcome {
    pub fn moved(&self) -> bool {
        matches!(self, Self::Moved)
    }
}

/// Backend-agnostic store of artifacts partitioned by lifecycle state.
///
/// Implementors provide the primitives (`put`/`read`/`append`/`transition`/
/// `list`/`locate` and plan persistence); the named lifecycle operations are
/// expressed on top of them.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Write (or overwrite) an artifact in a partition. Must publish
    /// atomically: readers never observe a partially written artifact.
    async fn put(&self, partition: Partition, id: Uuid, content: &str) -> Result<(), StoreError>;

    /// Read an artifact, if present.
    async fn read(&self, partition: Partition, id: Uuid) -> Result<Option<String>, StoreError>;

    /// Append text to an existing artifact.
    async fn append(
        &self,
        partition: Partition,
        id: Uuid,
        suffix: &str,
    ) -> Result<TransitionOutcome, StoreError>;

    /// Atomically move an artifact between partitions.
    async fn transition(
        &self,
        id: Uuid,
        from: Partition,
        to: Partition,
    ) -> Result<TransitionOutcome, StoreError>;

    /// List artifact IDs in a partition, in stable (lexicographic) order.
    async fn list(&self, partition: Partition) -> Result<Vec<Uuid>, StoreError>;

    /// Find which partition currently holds an artifact, if any.
    async fn locate(&self, id: Uuid) -> Result<Option<Partition>, StoreError>;

    /// Persist a task's plan. Overwrites any previous revision.
    async fn save_plan(&self, task_id: Uuid, plan: &str) -> Result<(), StoreError>;

    /// Load a task's persisted plan.
    async fn load_plan(&self, task_id: Uuid) -> Result<Option<String>, StoreError>;

    // ── Named lifecycle transitions ─────────────────────────────────

    /// Place a new task into the inbox. Watcher entry point.
    async fn enqueue(&self, doc: &TaskDocument) -> Result<(), StoreError> {
        self.put(Partition::Inbox, doc.task.id, &render_task(doc))
            .await
    }

    /// Claim a task for execution.
    async fn claim(&self, id: Uuid) -> Result<TransitionOutcome, StoreError> {
        self.transition(id, Partition::Inbox, Partition::InProgress)
            .await
    }

    /// Publish an approval request for a human decision.
    async fn request_approval(&self, doc: &ApprovalDocument) -> Result<(), StoreError> {
        self.put(Partition::PendingApproval, doc.id, &render_approval(doc))
            .await
    }

    /// Record an observed approval.
    async fn approve(&self, id: Uuid) -> Result<TransitionOutcome, StoreError> {
        self.transition(id, Partition::PendingApproval, Partition::Approved)
            .await
    }

    /// Record an observed rejection, stamping the reason onto the artifact.
    async fn reject(&self, id: Uuid, reason: &str) -> Result<TransitionOutcome, StoreError> {
        let note = format!(
            "\n---\n**REJECTED:** {}\n**Reason:** {}\n",
            Utc::now().to_rfc3339(),
            reason
        );
        if !self
            .append(Partition::PendingApproval, id, &note)
            .await?
            .moved()
        {
            return Ok(TransitionOutcome::NotFound);
        }
        self.transition(id, Partition::PendingApproval, Partition::Rejected)
            .await
    }

    /// Mark a claimed task fully completed.
    async fn complete(&self, id: Uuid) -> Result<TransitionOutcome, StoreError> {
        self.transition(id, Partition::InProgress, Partition::Done)
            .await
    }

    /// Mark a claimed task failed, preserving it for triage.
    async fn fail(&self, id: Uuid) -> Result<TransitionOutcome, StoreError> {
        self.transition(id, Partition::InProgress, Partition::Failed)
            .await
    }

    /// Move an approved artifact to done after its side effect succeeded.
    async fn finish_approved(&self, id: Uuid) -> Result<TransitionOutcome, StoreError> {
        self.transition(id, Partition::Approved, Partition::Done)
            .await
    }

    /// Move an active artifact to the skipped partition.
    async fn skip(&self, id: Uuid) -> Result<TransitionOutcome, StoreError> {
        self.move_out_of_active(id, Partition::Skipped, None).await
    }

    /// Isolate an active artifact with a diagnostic note.
    async fn quarantine(&self, id: Uuid, reason: &str) -> Result<TransitionOutcome, StoreError> {
        let note = format!(
            "\n---\n**QUARANTINED:** {}\n**Reason:** {}\n",
            Utc::now().to_rfc3339(),
            reason
        );
        self.move_out_of_active(id, Partition::Quarantine, Some(&note))
            .await
    }

    /// Find an artifact in the active partitions and move it to `to`,
    /// optionally appending a note first.
    async fn move_out_of_active(
        &self,
        id: Uuid,
        to: Partition,
        note: Option<&str>,
    ) -> Result<TransitionOutcome, StoreError> {
        for from in Partition::ACTIVE {
            if self.read(from, id).await?.is_none() {
                continue;
            }
            if let Some(note) = note {
                self.append(from, id, note).await?;
            }
            return self.transition(id, from, to).await;
        }
        Ok(TransitionOutcome::NotFound)
    }
}
