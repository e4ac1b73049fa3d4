use std::collections::HashMap;
use std::process::Stdio;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::cluster::Node;
use crate::error::{Result, ScootError};
use crate::scheduler::job::CommandSpec;
use crate::worker::{RunId, RunState, RunStatus, Worker, WorkerConnector};

/// Runs commands as local child processes, one at a time.
///
/// This is the reference binding of the worker interface: `run` spawns the
/// argv directly (no shell), `status`/`status_all` serve from a cache the
/// execution task keeps current, `abort` cancels the child.
#[derive(Clone)]
pub struct LocalWorker {
    inner: Arc<Inner>,
}

struct Inner {
    name: String,
    default_timeout: Duration,
    runs: RwLock<HashMap<RunId, RunStatus>>,
    active: Mutex<Option<ActiveRun>>,
    last_rpc: RwLock<std::time::Instant>,
}

struct ActiveRun {
    run_id: RunId,
    argv: Vec<String>,
    cancel: CancellationToken,
}

impl LocalWorker {
    pub fn new(name: impl Into<String>, default_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                name: name.into(),
                default_timeout,
                runs: RwLock::new(HashMap::new()),
                active: Mutex::new(None),
                last_rpc: RwLock::new(std::time::Instant::now()),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn time_since_last_rpc(&self) -> Duration {
        self.inner.last_rpc.read().unwrap().elapsed()
    }

    fn touch(&self) {
        *self.inner.last_rpc.write().unwrap() = std::time::Instant::now();
    }

    fn cached(&self, run_id: RunId) -> Result<RunStatus> {
        self.inner
            .runs
            .read()
            .unwrap()
            .get(&run_id)
            .cloned()
            .ok_or_else(|| ScootError::RunNotFound(run_id.to_string()))
    }
}

impl Inner {
    /// Update a cached run unless it already reached a terminal state.
    fn update(&self, run_id: RunId, f: impl FnOnce(&mut RunStatus)) {
        let mut runs = self.runs.write().unwrap();
        if let Some(status) = runs.get_mut(&run_id) {
            if !status.is_done() {
                f(status);
            }
        }
    }

    fn clear_active(&self, run_id: RunId) {
        let mut active = self.active.lock().unwrap();
        if active.as_ref().map(|a| a.run_id) == Some(run_id) {
            *active = None;
        }
    }
}

#[async_trait]
impl Worker for LocalWorker {
    async fn run(&self, cmd: &CommandSpec) -> Result<RunStatus> {
        self.touch();
        let run_id = Uuid::new_v4();

        if cmd.argv.is_empty() {
            let mut status = RunStatus::new(run_id, Vec::new());
            status.state = RunState::BadRequest;
            status.error = Some("empty argv".to_string());
            self.inner.runs.write().unwrap().insert(run_id, status.clone());
            return Ok(status);
        }

        let cancel = CancellationToken::new();
        {
            let mut active = self.inner.active.lock().unwrap();
            if let Some(current) = active.as_ref() {
                let busy = self
                    .inner
                    .runs
                    .read()
                    .unwrap()
                    .get(&current.run_id)
                    .map(|s| !s.is_done())
                    .unwrap_or(false);
                if busy {
                    return Err(ScootError::QueueFull {
                        active_argv: current.argv.clone(),
                    });
                }
            }
            *active = Some(ActiveRun {
                run_id,
                argv: cmd.argv.clone(),
                cancel: cancel.clone(),
            });
        }

        let status = RunStatus::new(run_id, cmd.argv.clone());
        self.inner.runs.write().unwrap().insert(run_id, status.clone());

        let inner = self.inner.clone();
        let cmd = cmd.clone();
        let timeout = cmd
            .timeout()
            .unwrap_or(self.inner.default_timeout);
        tokio::spawn(async move {
            execute(inner, run_id, cmd, timeout, cancel).await;
        });

        Ok(status)
    }

    async fn status(&self, run_id: RunId) -> Result<RunStatus> {
        self.touch();
        self.cached(run_id)
    }

    async fn status_all(&self) -> Result<Vec<RunStatus>> {
        Ok(self.inner.runs.read().unwrap().values().cloned().collect())
    }

    async fn abort(&self, run_id: RunId) -> Result<RunStatus> {
        self.touch();
        let status = self.cached(run_id)?;
        if status.is_done() {
            return Ok(status);
        }
        {
            let active = self.inner.active.lock().unwrap();
            if let Some(current) = active.as_ref() {
                if current.run_id == run_id {
                    current.cancel.cancel();
                }
            }
        }
        self.inner.update(run_id, |s| {
            s.state = RunState::Aborted;
            s.error = Some("aborted".to_string());
        });
        self.inner.clear_active(run_id);
        self.cached(run_id)
    }

    async fn erase(&self, run_id: RunId) -> Result<()> {
        self.touch();
        let status = self.cached(run_id)?;
        if !status.is_done() {
            return Err(ScootError::Internal(format!(
                "cannot erase active run {}",
                run_id
            )));
        }
        self.inner.runs.write().unwrap().remove(&run_id);
        Ok(())
    }
}

async fn execute(
    inner: Arc<Inner>,
    run_id: RunId,
    cmd: CommandSpec,
    timeout: Duration,
    cancel: CancellationToken,
) {
    // Snapshot resolution would happen here; the id is opaque to the
    // local runner.
    inner.update(run_id, |s| s.state = RunState::Preparing);
    tracing::info!(
        worker = %inner.name,
        %run_id,
        argv = ?cmd.argv,
        snapshot_id = %cmd.snapshot_id,
        "Starting run"
    );

    let mut command = tokio::process::Command::new(&cmd.argv[0]);
    command
        .args(&cmd.argv[1..])
        .envs(&cmd.env)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let child = match command.spawn() {
        Ok(child) => child,
        Err(e) => {
            tracing::warn!(worker = %inner.name, %run_id, error = %e, "Spawn failed");
            inner.update(run_id, |s| {
                s.state = RunState::Failed;
                s.error = Some(e.to_string());
            });
            inner.clear_active(run_id);
            return;
        }
    };

    inner.update(run_id, |s| s.state = RunState::Running);

    let output = child.wait_with_output();
    tokio::pin!(output);
    tokio::select! {
        result = &mut output => match result {
            Ok(out) => {
                let exit_code = out.status.code();
                let state = if out.status.success() {
                    RunState::Completed
                } else {
                    RunState::Failed
                };
                inner.update(run_id, |s| {
                    s.state = state;
                    s.exit_code = exit_code;
                    s.stdout = non_empty(String::from_utf8_lossy(&out.stdout).into_owned());
                    s.stderr = non_empty(String::from_utf8_lossy(&out.stderr).into_owned());
                });
                tracing::info!(worker = %inner.name, %run_id, %state, ?exit_code, "Run finished");
            }
            Err(e) => {
                inner.update(run_id, |s| {
                    s.state = RunState::Failed;
                    s.error = Some(e.to_string());
                });
            }
        },
        _ = cancel.cancelled() => {
            // Dropping the wait future kills the child (kill_on_drop).
            inner.update(run_id, |s| {
                s.state = RunState::Aborted;
                s.error = Some("aborted".to_string());
            });
            tracing::info!(worker = %inner.name, %run_id, "Run aborted");
        }
        _ = tokio::time::sleep(timeout) => {
            inner.update(run_id, |s| {
                s.state = RunState::TimedOut;
                s.error = Some(format!("timed out after {:?}", timeout));
            });
            tracing::warn!(worker = %inner.name, %run_id, ?timeout, "Run timed out");
        }
    }

    inner.clear_active(run_id);
}

fn non_empty(s: String) -> Option<String> {
    if s.is_empty() {
        None
    } else {
        Some(s)
    }
}

/// Connector that backs every cluster node with a local process runner and
/// a stats sampler tied to the process-wide shutdown token.
pub struct LocalConnector {
    pub default_timeout: Duration,
    pub stats_interval: Duration,
    pub shutdown: CancellationToken,
}

impl WorkerConnector for LocalConnector {
    fn connect(&self, node: &Node) -> Arc<dyn Worker> {
        let worker = LocalWorker::new(node.id.as_str(), self.default_timeout);
        crate::worker::stats::spawn_sampler(
            worker.clone(),
            self.stats_interval,
            self.shutdown.clone(),
        );
        Arc::new(worker)
    }
}
