use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use async_trait::async_trait;
use chrono::Utc;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use taskwarden::approval::ApprovalGate;
use taskwarden::audit::{AuditEventType, AuditLogger};
use taskwarden::config::WardenConfig;
use taskwarden::context::WardenContext;
use taskwarden::orchestrator::Orchestrator;
use taskwarden::recovery::ErrorRecovery;
use taskwarden::schedule::{Schedule, ScheduleRunner, ScheduledAction};
use taskwarden::store::FsTaskStore;

/// Verifies the integrity of the previous day's audit journal.
struct AuditVerifySweep {
    audit: Arc<AuditLogger>,
}

#[async_trait]
impl ScheduledAction for AuditVerifySweep {
    fn name(&self) -> &str {
        "audit_verify"
    }

    async fn run(&self) -> taskwarden::Result<String> {
        let Some(date) = Utc::now().date_naive().pred_opt() else {
            return Ok("no previous day to verify".to_string());
        };
        let report = self.audit.verify(date).await?;
        if !report.is_valid() {
            warn!(%date, invalid = report.invalid, "audit journal integrity check failed");
        }
        Ok(format!(
            "{}: {} events, {} valid, {} invalid",
            date, report.total, report.valid, report.invalid
        ))
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let home = std::env::var("TASKWARDEN_HOME").unwrap_or_else(|_| "./data".to_string());
    let home = PathBuf::from(home);

    let file_appender = tracing_appender::rolling::daily(home.join("logs"), "taskwarden.log");
    let (file_writer, _guard) = tracing_appender::non_blocking(file_appender);
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(file_writer)
                .with_ansi(false),
        )
        .init();

    let config = WardenConfig::from_env();
    info!(name = %config.name, home = %home.display(), "starting");

    let store = Arc::new(
        FsTaskStore::open(home.join("vault"))
            .await
            .context("opening task store")?,
    );
    let recovery = Arc::new(
        ErrorRecovery::new(
            store.clone(),
            home.join("state"),
            config.breaker_threshold,
            config.breaker_reset_window,
            config.max_retries,
            config.retry_base_delay,
        )
        .await
        .context("initializing error recovery")?,
    );
    let audit = Arc::new(
        AuditLogger::open(home.join("audit"))
            .await
            .context("opening audit journal")?,
    );
    let ctx = Arc::new(WardenContext::new(config, store, recovery, audit.clone()));

    // Action handlers and watchers are wired up per deployment; without
    // them, approved effects wait for manual execution.

    audit
        .info(
            AuditEventType::SystemStart,
            serde_json::json!({ "session": audit.session_id() }),
        )
        .await?;

    let gate = Arc::new(ApprovalGate::new(ctx.clone()));
    let gate_interval = ctx.config.approval_poll_interval;
    tokio::spawn({
        let gate = gate.clone();
        async move {
            if let Err(e) = gate.run(gate_interval).await {
                warn!(error = %e, "approval gate stopped");
            }
        }
    });

    let mut runner = ScheduleRunner::load(
        home.join("state/scheduler.json"),
        ctx.config.scheduled_task_timeout,
        audit.clone(),
    )
    .await
    .context("loading scheduler state")?;
    runner.register(
        Schedule::cron("0 0 7 * * *").context("parsing audit verification schedule")?,
        Arc::new(AuditVerifySweep {
            audit: audit.clone(),
        }),
    );
    let runner = Arc::new(runner);
    tokio::spawn({
        let runner = runner.clone();
        async move {
            if let Err(e) = runner.run(Duration::from_secs(60)).await {
                warn!(error = %e, "scheduler stopped");
            }
        }
    });

    let orchestrator = Orchestrator::new(ctx.clone());
    tokio::select! {
        result = orchestrator.run() => result?,
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown signal received");
        }
    }

    audit
        .info(AuditEventType::SystemStop, serde_json::json!({}))
        .await?;
    Ok(())
}
