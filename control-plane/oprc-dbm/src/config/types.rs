use std::time::Duration;

use envconfig::Envconfig;

#[derive(Envconfig, Clone, Debug)]
pub struct DbmConfig {
    #[envconfig(from = "HTTP_PORT", default = "8088")]
    pub http_port: u16,

    /// Restrict the watch to one namespace; all namespaces when unset.
    /// Env: OPRC_DBM_WATCH_NAMESPACE
    #[envconfig(from = "OPRC_DBM_WATCH_NAMESPACE")]
    pub watch_namespace: Option<String>,

    #[envconfig(nested)]
    pub queue: QueueConfig,

    #[envconfig(nested)]
    pub cleanup: CleanupConfig,

    /// Conflict-retry policy for read-modify-write updates
    #[envconfig(from = "OPRC_DBM_RETRY_INTERVAL_MS", default = "50")]
    pub retry_interval_ms: u64,
    #[envconfig(from = "OPRC_DBM_RETRY_ATTEMPTS", default = "40")]
    pub retry_attempts: u32,

    /// Period of the lister cache full refresh.
    /// Env: OPRC_DBM_LISTER_RESYNC_SECS
    #[envconfig(from = "OPRC_DBM_LISTER_RESYNC_SECS", default = "30")]
    pub lister_resync_secs: u64,
}

#[derive(Envconfig, Clone, Debug)]
pub struct QueueConfig {
    #[envconfig(from = "OPRC_DBM_WORKERS", default = "2")]
    pub workers: usize,
    /// Failed keys are dropped after this many requeues
    #[envconfig(from = "OPRC_DBM_MAX_REQUEUES", default = "5")]
    pub max_requeues: u32,
    #[envconfig(from = "OPRC_DBM_REQUEUE_BASE_MS", default = "250")]
    pub requeue_base_ms: u64,
    #[envconfig(from = "OPRC_DBM_REQUEUE_MAX_SECS", default = "300")]
    pub requeue_max_secs: u64,
}

#[derive(Envconfig, Clone, Debug)]
pub struct CleanupConfig {
    #[envconfig(from = "OPRC_DBM_POLL_INTERVAL_MS", default = "2000")]
    pub poll_interval_ms: u64,
    /// Upper bound on each wait-until-absent step
    #[envconfig(from = "OPRC_DBM_POLL_TIMEOUT_SECS", default = "300")]
    pub poll_timeout_secs: u64,
}

/// Runtime knobs of the controller, decoupled from the environment so tests
/// can build them directly.
#[derive(Clone, Debug)]
pub struct ControllerSettings {
    pub workers: usize,
    pub max_requeues: u32,
    pub requeue_base: Duration,
    pub requeue_max: Duration,
    pub poll_interval: Duration,
    pub poll_timeout: Duration,
    pub retry: RetryPolicy,
    pub lister_resync: Duration,
}

#[derive(Clone, Copy, Debug)]
pub struct RetryPolicy {
    pub interval: Duration,
    pub attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(50),
            attempts: 40,
        }
    }
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            workers: 2,
            max_requeues: 5,
            requeue_base: Duration::from_millis(250),
            requeue_max: Duration::from_secs(300),
            poll_interval: Duration::from_secs(2),
            poll_timeout: Duration::from_secs(300),
            retry: RetryPolicy::default(),
            lister_resync: Duration::from_secs(30),
        }
    }
}

impl DbmConfig {
    pub fn controller_settings(&self) -> ControllerSettings {
        ControllerSettings {
            // A zero-sized pool would never drain the queue
            workers: self.queue.workers.max(1),
            max_requeues: self.queue.max_requeues,
            requeue_base: Duration::from_millis(self.queue.requeue_base_ms),
            requeue_max: Duration::from_secs(self.queue.requeue_max_secs),
            poll_interval: Duration::from_millis(self.cleanup.poll_interval_ms),
            poll_timeout: Duration::from_secs(self.cleanup.poll_timeout_secs),
            retry: RetryPolicy {
                interval: Duration::from_millis(self.retry_interval_ms),
                attempts: self.retry_attempts.max(1),
            },
            lister_resync: Duration::from_secs(self.lister_resync_secs),
        }
    }
}
