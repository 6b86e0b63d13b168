//! End-to-end flows through the whole engine: watcher to inbox, orchestrator
//! to executor, approval gate to handler, with the audit journal checked at
//! the end.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use taskwarden::approval::ApprovalGate;
use taskwarden::audit::AuditLogger;
use taskwarden::config::WardenConfig;
use taskwarden::context::{ActionHandler, HandlerRequest, WardenContext};
use taskwarden::error::HandlerError;
use taskwarden::orchestrator::Orchestrator;
use taskwarden::recovery::ErrorRecovery;
use taskwarden::store::{FsTaskStore, Partition, TaskStore};
use taskwarden::task::model::{Priority, TaskType};
use taskwarden::watcher::{enqueue_drafts, TaskDraft};

struct SendCounter {
    calls: AtomicU32,
}

#[async_trait]
impl ActionHandler for SendCounter {
    async fn handle(&self, _req: HandlerRequest<'_>) -> Result<String, HandlerError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok("reply sent".to_string())
    }
}

struct Rig {
    _dir: tempfile::TempDir,
    ctx: Arc<WardenContext>,
    orchestrator: Orchestrator,
    gate: ApprovalGate,
}

async fn rig(config: WardenConfig) -> Rig {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(FsTaskStore::open(dir.path().join("vault")).await.unwrap());
    let recovery = Arc::new(
        ErrorRecovery::new(
            store.clone(),
            dir.path().join("state"),
            config.breaker_threshold,
            config.breaker_reset_window,
            config.max_retries,
            Duration::from_millis(1),
        )
        .await
        .unwrap(),
    );
    let audit = Arc::new(AuditLogger::open(dir.path().join("audit")).await.unwrap());
    let ctx = Arc::new(WardenContext::new(config, store, recovery, audit));
    Rig {
        _dir: dir,
        orchestrator: Orchestrator::new(ctx.clone()),
        gate: ApprovalGate::new(ctx.clone()),
        ctx,
    }
}

fn fast_config() -> WardenConfig {
    WardenConfig {
        approval_poll_interval: Duration::from_millis(10),
        approval_max_wait: Duration::from_secs(10),
        retry_base_delay: Duration::from_millis(1),
        ..WardenConfig::default()
    }
}

async fn wait_for_request(store: &dyn TaskStore) -> Uuid {
    for _ in 0..500 {
        let pending = store.list(Partition::PendingApproval).await.unwrap();
        if let Some(&id) = pending.first() {
            return id;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("no approval request appeared");
}

async fn wait_for_partition(store: &dyn TaskStore, id: Uuid, expected: Partition) {
    for _ in 0..500 {
        if store.locate(id).await.unwrap() == Some(expected) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("artifact {id} never reached {expected}");
}

/// Simulate the human editing the decision field of a pending request.
async fn decide(store: &dyn TaskStore, id: Uuid, decision: &str, reason: Option<&str>) {
    let mut content = store
        .read(Partition::PendingApproval, id)
        .await
        .unwrap()
        .unwrap()
        .replace("decision: pending", &format!("decision: {decision}"));
    if let Some(reason) = reason {
        content = content.replace("reason:", &format!("reason: {reason}"));
    }
    store.put(Partition::PendingApproval, id, &content).await.unwrap();
}

#[tokio::test]
async fn approved_email_runs_effect_once_and_ends_done() {
    let rig = rig(fast_config()).await;
    let handler = Arc::new(SendCounter {
        calls: AtomicU32::new(0),
    });
    rig.ctx.register_handler(TaskType::Email, handler.clone()).await;

    let ids = enqueue_drafts(
        &rig.ctx,
        "mail_watcher",
        vec![TaskDraft::new(TaskType::Email, "Client asks for a quote")
            .with_priority(Priority::High)],
    )
    .await
    .unwrap();
    let task_id = ids[0];

    let report = rig.orchestrator.run_cycle().await.unwrap();
    assert_eq!(report.processed, vec![task_id]);

    // The executor publishes the request; the human approves it; the gate
    // carries out the effect.
    let request_id = wait_for_request(rig.ctx.store.as_ref()).await;
    decide(rig.ctx.store.as_ref(), request_id, "approved", None).await;
    rig.gate.scan().await.unwrap();

    wait_for_partition(rig.ctx.store.as_ref(), task_id, Partition::Done).await;
    assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
    assert_eq!(
        rig.ctx.store.locate(request_id).await.unwrap(),
        Some(Partition::Done)
    );

    // Re-scanning the gate never replays the effect.
    rig.gate.scan().await.unwrap();
    assert_eq!(handler.calls.load(Ordering::SeqCst), 1);

    // Everything above left a verifiable audit trail. Give the spawned
    // executor a moment to finish its final journal write.
    tokio::time::sleep(Duration::from_millis(100)).await;
    let report = rig
        .ctx
        .audit
        .verify(chrono::Utc::now().date_naive())
        .await
        .unwrap();
    assert!(report.total > 0);
    assert!(report.is_valid());
}

#[tokio::test]
async fn rejected_email_skips_effect_and_ends_failed() {
    let rig = rig(fast_config()).await;
    let handler = Arc::new(SendCounter {
        calls: AtomicU32::new(0),
    });
    rig.ctx.register_handler(TaskType::Email, handler.clone()).await;

    let ids = enqueue_drafts(
        &rig.ctx,
        "mail_watcher",
        vec![TaskDraft::new(TaskType::Email, "Spam, probably")],
    )
    .await
    .unwrap();
    let task_id = ids[0];
    rig.orchestrator.run_cycle().await.unwrap();

    let request_id = wait_for_request(rig.ctx.store.as_ref()).await;
    decide(
        rig.ctx.store.as_ref(),
        request_id,
        "rejected",
        Some("do not engage"),
    )
    .await;
    rig.gate.scan().await.unwrap();

    wait_for_partition(rig.ctx.store.as_ref(), task_id, Partition::Failed).await;
    assert_eq!(handler.calls.load(Ordering::SeqCst), 0);

    let content = rig
        .ctx
        .store
        .read(Partition::Rejected, request_id)
        .await
        .unwrap()
        .unwrap();
    assert!(content.contains("do not engage"));
}

#[tokio::test]
async fn undecided_request_times_out_and_fails_task() {
    let config = WardenConfig {
        approval_poll_interval: Duration::from_millis(5),
        approval_max_wait: Duration::from_millis(50),
        ..fast_config()
    };
    let rig = rig(config).await;

    let ids = enqueue_drafts(
        &rig.ctx,
        "mail_watcher",
        vec![TaskDraft::new(TaskType::Email, "Nobody is home")],
    )
    .await
    .unwrap();
    let task_id = ids[0];
    rig.orchestrator.run_cycle().await.unwrap();

    wait_for_partition(rig.ctx.store.as_ref(), task_id, Partition::Failed).await;

    let rejected = rig.ctx.store.list(Partition::Rejected).await.unwrap();
    assert_eq!(rejected.len(), 1);
    let content = rig
        .ctx
        .store
        .read(Partition::Rejected, rejected[0])
        .await
        .unwrap()
        .unwrap();
    assert!(content.contains("timeout"));
}

#[tokio::test]
async fn approval_exempt_generic_task_completes_without_gate() {
    let rig = rig(fast_config()).await;
    let handler = Arc::new(SendCounter {
        calls: AtomicU32::new(0),
    });
    rig.ctx
        .register_handler(TaskType::Generic, handler.clone())
        .await;

    let ids = enqueue_drafts(
        &rig.ctx,
        "cli",
        vec![TaskDraft::new(TaskType::Generic, "internal chore").with_requires_approval(false)],
    )
    .await
    .unwrap();
    rig.orchestrator.run_cycle().await.unwrap();

    wait_for_partition(rig.ctx.store.as_ref(), ids[0], Partition::Done).await;
    assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
    assert!(rig
        .ctx
        .store
        .list(Partition::PendingApproval)
        .await
        .unwrap()
        .is_empty());
}
