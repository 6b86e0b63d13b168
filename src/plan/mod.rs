//! Plans — the ordered execution breakdown generated for a task.
//!
//! A plan is owned 1:1 by its task, created once by the orchestrator, and
//! persisted through the task store after every step transition so a crash
//! mid-plan resumes instead of restarting.

pub mod templates;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::task::model::TaskType;

/// Status of a single plan step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    InProgress,
    WaitingApproval,
    Completed,
    Failed,
    Skipped,
}

impl StepStatus {
    /// A settled step is not revisited on resume.
    pub fn is_settled(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Skipped)
    }
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::WaitingApproval => "waiting_approval",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        };
        f.write_str(s)
    }
}

/// What a step does when executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepAction {
    /// Internal analysis/bookkeeping; always succeeds.
    Review,
    /// Produce an approval request for the task's irreversible effect.
    Draft,
    /// Invoke the registered handler for the task's type directly.
    Invoke,
    /// Enqueue a follow-up task.
    FollowUp,
    /// Internal verification/archival note.
    Verify,
}

/// One step of a plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    /// Short step name, unique within the plan.
    pub name: String,
    /// What executing this step means.
    pub action: StepAction,
    /// Human-readable description of the step.
    pub description: String,
    /// Whether this step's effect is gated on a human decision.
    pub needs_approval: bool,
    pub status: StepStatus,
    /// Number of attempts made so far.
    pub attempts: u32,
    /// Last error message, if any attempt failed.
    pub last_error: Option<String>,
    /// ID of the approval request this step published, once it has.
    pub approval_request: Option<Uuid>,
}

impl Step {
    pub fn new(name: impl Into<String>, action: StepAction, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            action,
            description: description.into(),
            needs_approval: false,
            status: StepStatus::Pending,
            attempts: 0,
            last_error: None,
            approval_request: None,
        }
    }

    pub fn gated(mut self) -> Self {
        self.needs_approval = true;
        self
    }
}

/// Append-only progress log entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressEntry {
    pub at: DateTime<Utc>,
    pub step: String,
    pub status: StepStatus,
    pub note: Option<String>,
}

/// The persisted execution breakdown for one task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    /// The task this plan belongs to.
    pub task_id: Uuid,
    pub task_type: TaskType,
    /// When the plan was generated.
    pub created: DateTime<Utc>,
    pub steps: Vec<Step>,
    /// Append-only log of step transitions.
    pub progress: Vec<ProgressEntry>,
}

impl Plan {
    /// Build a plan for a task from the template matching its type.
    pub fn for_task(task_id: Uuid, task_type: TaskType) -> Self {
        Self {
            task_id,
            task_type,
            created: Utc::now(),
            steps: templates::steps_for(task_type),
            progress: Vec::new(),
        }
    }

    /// Record a step transition in the plan and its progress log.
    pub fn record(&mut self, index: usize, status: StepStatus, note: Option<String>) {
        if let Some(step) = self.steps.get_mut(index) {
            step.status = status;
            self.progress.push(ProgressEntry {
                at: Utc::now(),
                step: step.name.clone(),
                status,
                note,
            });
        }
    }

    /// True iff every step reached `Completed`.
    pub fn all_completed(&self) -> bool {
        self.steps
            .iter()
            .all(|s| s.status == StepStatus::Completed)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    pub fn from_json(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }
}
