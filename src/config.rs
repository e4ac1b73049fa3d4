use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Scheduler-wide configuration.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Address the HTTP ingress listens on.
    pub listen_addr: SocketAddr,
    /// Directory for durable saga segments. `None` keeps sagas in memory.
    pub saga_dir: Option<PathBuf>,
    /// Interval between dispatch ticks.
    pub tick_interval: Duration,
    /// Default command timeout when a task supplies none.
    pub default_task_timeout: Duration,
    /// Extra slack added on top of a task's timeout before the runner
    /// force-aborts the run.
    pub timeout_slack: Duration,
    /// How often a task runner polls the worker for run status.
    pub status_poll_interval: Duration,
    /// Retry policy for worker RPCs.
    pub worker_retry: RetryConfig,
    /// Abort the whole job when any task fails (strict mode).
    pub abort_on_task_failure: bool,
    /// Grace period for runners to finish during shutdown.
    pub shutdown_grace: Duration,
}

/// Exponential backoff parameters for transient worker errors.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(5),
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:9090".parse().unwrap(),
            saga_dir: None,
            tick_interval: Duration::from_millis(100),
            default_task_timeout: Duration::from_secs(30 * 60),
            timeout_slack: Duration::from_secs(30),
            status_poll_interval: Duration::from_millis(250),
            worker_retry: RetryConfig::default(),
            abort_on_task_failure: false,
            shutdown_grace: Duration::from_secs(10),
        }
    }
}

impl SchedulerConfig {
    pub fn with_saga_dir(mut self, dir: PathBuf) -> Self {
        self.saga_dir = Some(dir);
        self
    }

    /// Shorter intervals for tests so scenarios settle quickly.
    pub fn fast() -> Self {
        Self {
            tick_interval: Duration::from_millis(10),
            status_poll_interval: Duration::from_millis(10),
            timeout_slack: Duration::from_secs(2),
            worker_retry: RetryConfig {
                max_attempts: 3,
                initial_backoff: Duration::from_millis(10),
                max_backoff: Duration::from_millis(100),
            },
            shutdown_grace: Duration::from_secs(2),
            ..Default::default()
        }
    }
}
