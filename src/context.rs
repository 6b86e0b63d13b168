//! Shared engine context — configuration, the task store, the handler
//! registry, recovery, and the audit journal, bundled behind one `Arc` so
//! every subsystem sees the same state.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::audit::AuditLogger;
use crate::config::WardenConfig;
use crate::error::HandlerError;
use crate::recovery::ErrorRecovery;
use crate::store::TaskStore;
use crate::task::model::TaskType;

/// Input to an action handler: the task being worked plus the content the
/// side effect should act on (a drafted reply, a post, an invoice body).
pub struct HandlerRequest<'a> {
    pub task_id: Uuid,
    pub task_type: TaskType,
    pub payload: &'a std::collections::BTreeMap<String, String>,
    pub content: &'a str,
}

/// Performs the real side effect for a task type.
///
/// Handlers are registered per task type by the deployment. The engine never
/// performs an external effect itself; with no handler registered the effect
/// is left for manual execution.
#[async_trait]
pub trait ActionHandler: Send + Sync {
    /// Execute the effect. Returns a short result note for the audit trail.
    async fn handle(&self, req: HandlerRequest<'_>) -> Result<String, HandlerError>;
}

/// Everything the engine's subsystems share.
pub struct WardenContext {
    pub config: WardenConfig,
    pub store: Arc<dyn TaskStore>,
    pub recovery: Arc<ErrorRecovery>,
    pub audit: Arc<AuditLogger>,
    handlers: RwLock<HashMap<TaskType, Arc<dyn ActionHandler>>>,
}

impl WardenContext {
    pub fn new(
        config: WardenConfig,
        store: Arc<dyn TaskStore>,
        recovery: Arc<ErrorRecovery>,
        audit: Arc<AuditLogger>,
    ) -> Self {
        Self {
            config,
            store,
            recovery,
            audit,
            handlers: RwLock::new(HashMap::new()),
        }
    }

    /// Register the handler that performs side effects for `task_type`.
    /// Replaces any previous registration.
    pub async fn register_handler(&self, task_type: TaskType, handler: Arc<dyn ActionHandler>) {
        self.handlers.write().await.insert(task_type, handler);
    }

    /// Look up the handler for a task type, if one is registered.
    pub async fn handler(&self, task_type: TaskType) -> Option<Arc<dyn ActionHandler>> {
        self.handlers.read().await.get(&task_type).cloned()
    }
}
