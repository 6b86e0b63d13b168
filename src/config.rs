//! Configuration types.

use std::time::Duration;

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct WardenConfig {
    /// Engine name for identification in logs and audit entries.
    pub name: String,
    /// Interval between orchestrator scan cycles.
    pub scan_interval: Duration,
    /// Maximum number of tasks executing concurrently.
    pub max_concurrent_tasks: usize,
    /// Maximum attempts per plan step before it is marked failed.
    pub max_retries: u32,
    /// Base delay for exponential backoff between step attempts.
    pub retry_base_delay: Duration,
    /// Hard timeout for a single step action.
    pub step_timeout: Duration,
    /// How often the executor polls a pending approval request.
    pub approval_poll_interval: Duration,
    /// Maximum time a step waits for a human decision before the request
    /// is treated as rejected.
    pub approval_max_wait: Duration,
    /// Circuit breaker: errors per operation key before the circuit opens.
    pub breaker_threshold: u32,
    /// Circuit breaker: window after the last error in which the circuit
    /// stays open and the error count keeps accumulating.
    pub breaker_reset_window: Duration,
    /// Hard timeout for a scheduled maintenance task run.
    pub scheduled_task_timeout: Duration,
}

impl Default for WardenConfig {
    fn default() -> Self {
        Self {
            name: "taskwarden".to_string(),
            scan_interval: Duration::from_secs(60),
            max_concurrent_tasks: 8,
            max_retries: 3,
            retry_base_delay: Duration::from_secs(1),
            step_timeout: Duration::from_secs(120),
            approval_poll_interval: Duration::from_secs(30),
            approval_max_wait: Duration::from_secs(24 * 3600), // 1 day
            breaker_threshold: 5,
            breaker_reset_window: Duration::from_secs(15 * 60), // 15 minutes
            scheduled_task_timeout: Duration::from_secs(300),
        }
    }
}

impl WardenConfig {
    /// Build a config from `TASKWARDEN_*` environment variables, falling back
    /// to defaults for anything unset or unparseable.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(v) = env_secs("TASKWARDEN_SCAN_INTERVAL_SECS") {
            config.scan_interval = v;
        }
        if let Some(v) = env_usize("TASKWARDEN_MAX_CONCURRENT_TASKS") {
            config.max_concurrent_tasks = v.max(1);
        }
        if let Some(v) = env_u32("TASKWARDEN_MAX_RETRIES") {
            config.max_retries = v.max(1);
        }
        if let Some(v) = env_secs("TASKWARDEN_RETRY_BASE_DELAY_SECS") {
            config.retry_base_delay = v;
        }
        if let Some(v) = env_secs("TASKWARDEN_STEP_TIMEOUT_SECS") {
            config.step_timeout = v;
        }
        if let Some(v) = env_secs("TASKWARDEN_APPROVAL_POLL_SECS") {
            config.approval_poll_interval = v;
        }
        if let Some(v) = env_secs("TASKWARDEN_APPROVAL_MAX_WAIT_SECS") {
            config.approval_max_wait = v;
        }
        if let Some(v) = env_u32("TASKWARDEN_BREAKER_THRESHOLD") {
            config.breaker_threshold = v.max(1);
        }
        if let Some(v) = env_secs("TASKWARDEN_BREAKER_WINDOW_SECS") {
            config.breaker_reset_window = v;
        }
        if let Some(v) = env_secs("TASKWARDEN_SCHEDULED_TIMEOUT_SECS") {
            config.scheduled_task_timeout = v;
        }

        config
    }
}

fn env_secs(key: &str) -> Option<Duration> {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_secs)
}

fn env_u32(key: &str) -> Option<u32> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

fn env_usize(key: &str) -> Option<usize> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}
