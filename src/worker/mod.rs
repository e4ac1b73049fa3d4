pub mod local;
pub mod stats;

pub use local::{LocalConnector, LocalWorker};

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::cluster::Node;
use crate::error::Result;
use crate::scheduler::job::CommandSpec;

pub type RunId = Uuid;

/// Lifecycle of one command execution on a worker.
///
/// `Pending -> Preparing -> Running` and then exactly one terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Pending,
    Preparing,
    Running,
    Completed,
    Failed,
    Aborted,
    TimedOut,
    BadRequest,
}

impl RunState {
    pub fn is_done(&self) -> bool {
        matches!(
            self,
            RunState::Completed
                | RunState::Failed
                | RunState::Aborted
                | RunState::TimedOut
                | RunState::BadRequest
        )
    }
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RunState::Pending => "pending",
            RunState::Preparing => "preparing",
            RunState::Running => "running",
            RunState::Completed => "completed",
            RunState::Failed => "failed",
            RunState::Aborted => "aborted",
            RunState::TimedOut => "timed_out",
            RunState::BadRequest => "bad_request",
        };
        write!(f, "{}", s)
    }
}

/// Latest known status of a run, served from the worker's cache.
#[derive(Debug, Clone)]
pub struct RunStatus {
    pub run_id: RunId,
    pub state: RunState,
    /// Argv the run was started with; used to recognize duplicate retries.
    pub argv: Vec<String>,
    pub exit_code: Option<i32>,
    pub stdout: Option<String>,
    pub stderr: Option<String>,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
}

impl RunStatus {
    pub fn new(run_id: RunId, argv: Vec<String>) -> Self {
        Self {
            run_id,
            state: RunState::Pending,
            argv,
            exit_code: None,
            stdout: None,
            stderr: None,
            error: None,
            started_at: Utc::now(),
        }
    }

    pub fn is_done(&self) -> bool {
        self.state.is_done()
    }
}

/// A worker runs one command at a time. A second `run` while any prior run
/// is non-terminal fails with `ScootError::QueueFull` carrying the active
/// argv, which callers use to detect duplicate retries.
#[async_trait]
pub trait Worker: Send + Sync {
    async fn run(&self, cmd: &CommandSpec) -> Result<RunStatus>;
    async fn status(&self, run_id: RunId) -> Result<RunStatus>;
    async fn status_all(&self) -> Result<Vec<RunStatus>>;
    async fn abort(&self, run_id: RunId) -> Result<RunStatus>;
    async fn erase(&self, run_id: RunId) -> Result<()>;
}

/// Turns a cluster node into a worker handle. The wire protocol behind the
/// handle is pluggable; tests plug in fakes, the binary runs commands
/// locally.
pub trait WorkerConnector: Send + Sync {
    fn connect(&self, node: &Node) -> Arc<dyn Worker>;
}
