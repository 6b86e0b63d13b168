//! Core task entities.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Classifies a task so plan templates and handlers can dispatch on it.
///
/// Closed set with an explicit generic fallback — unknown type tags parse to
/// `Generic` instead of being misclassified by substring guesses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    Email,
    LinkedIn,
    SocialPost,
    WhatsApp,
    ClientInquiry,
    Invoice,
    Generic,
}

impl TaskType {
    /// Canonical tag used in artifact headers.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Email => "email",
            Self::LinkedIn => "linkedin",
            Self::SocialPost => "social_post",
            Self::WhatsApp => "whatsapp",
            Self::ClientInquiry => "client_inquiry",
            Self::Invoice => "invoice",
            Self::Generic => "generic",
        }
    }

    /// Parse a type tag. Anything unrecognized is the generic fallback.
    pub fn parse(tag: &str) -> Self {
        match tag.trim().to_ascii_lowercase().as_str() {
            "email" => Self::Email,
            "linkedin" => Self::LinkedIn,
            "social_post" => Self::SocialPost,
            "whatsapp" => Self::WhatsApp,
            "client_inquiry" => Self::ClientInquiry,
            "invoice" => Self::Invoice,
            _ => Self::Generic,
        }
    }
}

impl std::fmt::Display for TaskType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Urgency of a task. Lower rank is processed first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Urgent,
    High,
    Medium,
    Low,
}

impl Priority {
    /// Numeric rank: lower is more urgent.
    pub fn rank(&self) -> u8 {
        match self {
            Self::Urgent => 1,
            Self::High => 2,
            Self::Medium => 3,
            Self::Low => 4,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Urgent => "urgent",
            Self::High => "high",
            Self::Medium => "medium",
            Self::Low => "low",
        }
    }

    /// Parse a priority label. Unknown labels default to `Medium`.
    pub fn parse(label: &str) -> Self {
        match label.trim().to_ascii_lowercase().as_str() {
            "urgent" => Self::Urgent,
            "high" => Self::High,
            "low" => Self::Low,
            _ => Self::Medium,
        }
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A unit of work detected by a watcher.
///
/// Mutated only through store transitions; its lifecycle state is the
/// partition currently holding its artifact.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Unique task ID.
    pub id: Uuid,
    /// Task classification, drives plan template and handler dispatch.
    pub task_type: TaskType,
    /// Which watcher produced this task.
    pub source: String,
    /// When the task was enqueued. Also the enqueue-order tie-break.
    pub created: DateTime<Utc>,
    /// Urgency label.
    pub priority: Priority,
    /// Whether the task's irreversible effect requires a human decision.
    pub requires_approval: bool,
    /// Opaque key/value payload supplied by the watcher.
    pub payload: BTreeMap<String, String>,
}

impl Task {
    /// Create a new task with a fresh ID, timestamped now.
    pub fn new(task_type: TaskType, source: impl Into<String>, priority: Priority) -> Self {
        Self {
            id: Uuid::new_v4(),
            task_type,
            source: source.into(),
            created: Utc::now(),
            priority,
            requires_approval: true,
            payload: BTreeMap::new(),
        }
    }

    pub fn with_payload(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.payload.insert(key.into(), value.into());
        self
    }

    pub fn with_requires_approval(mut self, requires_approval: bool) -> Self {
        self.requires_approval = requires_approval;
        self
    }
}
