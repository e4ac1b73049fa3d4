use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::cluster::NodeId;
use crate::config::RetryConfig;
use crate::error::ScootError;
use crate::saga::{JobId, Saga};
use crate::scheduler::job::TaskDefinition;
use crate::worker::{RunId, RunState, RunStatus, Worker};

/// Payload recorded with every EndTask message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResult {
    pub ok: bool,
    pub state: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl TaskResult {
    fn from_status(status: &RunStatus) -> Self {
        Self {
            ok: status.state == RunState::Completed,
            state: status.state.to_string(),
            exit_code: status.exit_code,
            error: status.error.clone(),
        }
    }

    fn aborted() -> Self {
        Self {
            ok: false,
            state: RunState::Aborted.to_string(),
            exit_code: None,
            error: Some("aborted".to_string()),
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("task result serializes")
    }

    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        serde_json::from_slice(bytes).ok()
    }
}

/// What a task runner reports back to the scheduler loop.
#[derive(Debug)]
pub struct TaskEvent {
    pub job_id: JobId,
    pub task_id: String,
    pub node_id: NodeId,
    pub outcome: TaskOutcome,
}

#[derive(Debug, PartialEq, Eq)]
pub enum TaskOutcome {
    /// EndTask(ok) logged.
    Completed,
    /// EndTask(failed) logged; the attempt ran and lost.
    Failed,
    /// EndTask(aborted) logged after a kill.
    Aborted,
    /// The worker stopped answering; nothing was logged. The task reverts
    /// to runnable and the worker is written off.
    WorkerLost,
    /// Told to stop because the cluster removed the worker; nothing was
    /// logged.
    Abandoned,
    /// A saga-log append kept failing; nothing further was logged. The
    /// task reverts to runnable, the worker is still good.
    LogError,
}

/// Tunables for one attempt.
#[derive(Clone)]
pub struct TaskRunnerPolicy {
    pub retry: RetryConfig,
    pub poll_interval: Duration,
    pub default_timeout: Duration,
    pub timeout_slack: Duration,
}

/// Run one task attempt against one worker and report the outcome.
///
/// The runner owns all worker RPCs and the per-task saga appends so the
/// scheduler loop never blocks on either.
#[allow(clippy::too_many_arguments)]
pub async fn run_task(
    saga: Arc<Saga>,
    task: TaskDefinition,
    worker: Arc<dyn Worker>,
    node_id: NodeId,
    policy: TaskRunnerPolicy,
    cancel: CancellationToken,
    abandon: CancellationToken,
    events: mpsc::Sender<TaskEvent>,
) {
    let job_id = saga.job_id();
    let task_id = task.task_id.clone();
    let outcome = attempt(&saga, &task, worker, &policy, &cancel, &abandon).await;
    tracing::debug!(%job_id, task_id = %task_id, node = %node_id, ?outcome, "Task attempt finished");
    let _ = events
        .send(TaskEvent {
            job_id,
            task_id,
            node_id,
            outcome,
        })
        .await;
}

async fn attempt(
    saga: &Saga,
    task: &TaskDefinition,
    worker: Arc<dyn Worker>,
    policy: &TaskRunnerPolicy,
    cancel: &CancellationToken,
    abandon: &CancellationToken,
) -> TaskOutcome {
    let task_id = task.task_id.as_str();

    // A prior attempt may have logged its EndTask right before its worker
    // vanished; the recorded result stands.
    if saga.is_task_completed(task_id) {
        let ok = saga
            .task_result(task_id)
            .and_then(|data| TaskResult::from_bytes(&data))
            .map(|r| r.ok)
            .unwrap_or(false);
        return if ok {
            TaskOutcome::Completed
        } else {
            TaskOutcome::Failed
        };
    }

    // Recovery re-dispatches tasks whose StartTask is already logged.
    if !saga.is_task_started(task_id) {
        if let Err(e) = log_with_retries(policy, || saga.start_task(task_id, Vec::new())) {
            tracing::error!(job_id = %saga.job_id(), task_id, error = %e, "StartTask append failed");
            return TaskOutcome::LogError;
        }
    }

    let run_id = match start_run(task, worker.as_ref(), policy, cancel, abandon).await {
        Ok(run_id) => run_id,
        Err(TaskOutcome::Aborted) => {
            // Killed before anything ran; the aborted EndTask closes the
            // open StartTask.
            return match log_with_retries(policy, || {
                saga.end_task(task_id, TaskResult::aborted().to_bytes())
            }) {
                Ok(()) => TaskOutcome::Aborted,
                Err(e) => {
                    tracing::error!(job_id = %saga.job_id(), task_id, error = %e, "EndTask append failed");
                    TaskOutcome::LogError
                }
            };
        }
        Err(outcome) => return outcome,
    };

    poll_run(saga, task, worker.as_ref(), run_id, policy, cancel, abandon).await
}

/// Start the command, absorbing duplicate-retry QueueFull responses and
/// retrying transient transport errors with capped exponential backoff.
async fn start_run(
    task: &TaskDefinition,
    worker: &dyn Worker,
    policy: &TaskRunnerPolicy,
    cancel: &CancellationToken,
    abandon: &CancellationToken,
) -> std::result::Result<RunId, TaskOutcome> {
    let mut backoff = policy.retry.initial_backoff;
    for attempt in 0..policy.retry.max_attempts {
        if abandon.is_cancelled() {
            return Err(TaskOutcome::Abandoned);
        }
        if cancel.is_cancelled() {
            return Err(TaskOutcome::Aborted);
        }
        match worker.run(&task.command).await {
            Ok(status) => return Ok(status.run_id),
            Err(ScootError::QueueFull { active_argv }) if active_argv == task.command.argv => {
                // Duplicate retry of a command the worker already runs:
                // adopt the live run instead of erroring.
                match worker.status_all().await {
                    Ok(runs) => {
                        if let Some(live) = runs
                            .iter()
                            .find(|r| !r.is_done() && r.argv == task.command.argv)
                        {
                            tracing::info!(run_id = %live.run_id, "Adopting duplicate run");
                            return Ok(live.run_id);
                        }
                    }
                    Err(e) if e.is_transient() => {}
                    Err(_) => return Err(TaskOutcome::WorkerLost),
                }
            }
            Err(e) if e.is_transient() || matches!(e, ScootError::QueueFull { .. }) => {
                tracing::debug!(attempt, error = %e, "Worker run failed, backing off");
            }
            Err(e) => {
                tracing::warn!(error = %e, "Worker rejected run");
                return Err(TaskOutcome::WorkerLost);
            }
        }
        tokio::select! {
            _ = tokio::time::sleep(with_jitter(backoff)) => {}
            _ = cancel.cancelled() => return Err(TaskOutcome::Aborted),
            _ = abandon.cancelled() => return Err(TaskOutcome::Abandoned),
        }
        backoff = std::cmp::min(backoff * 2, policy.retry.max_backoff);
    }
    Err(TaskOutcome::WorkerLost)
}

async fn poll_run(
    saga: &Saga,
    task: &TaskDefinition,
    worker: &dyn Worker,
    run_id: RunId,
    policy: &TaskRunnerPolicy,
    cancel: &CancellationToken,
    abandon: &CancellationToken,
) -> TaskOutcome {
    let task_id = task.task_id.as_str();
    let timeout = task.command.timeout().unwrap_or(policy.default_timeout);
    let deadline = tokio::time::Instant::now() + timeout + policy.timeout_slack;
    let mut consecutive_errors: u32 = 0;

    loop {
        tokio::select! {
            _ = abandon.cancelled() => return TaskOutcome::Abandoned,
            _ = cancel.cancelled() => {
                // Kill: abort the run, record the aborted end.
                let _ = worker.abort(run_id).await;
                return match log_with_retries(policy, || {
                    saga.end_task(task_id, TaskResult::aborted().to_bytes())
                }) {
                    Ok(()) => TaskOutcome::Aborted,
                    Err(e) => {
                        tracing::error!(job_id = %saga.job_id(), task_id, error = %e, "EndTask append failed");
                        TaskOutcome::LogError
                    }
                };
            }
            _ = tokio::time::sleep_until(deadline) => {
                tracing::warn!(job_id = %saga.job_id(), task_id, %run_id, "Run deadline expired, aborting");
                let _ = worker.abort(run_id).await;
                let result = TaskResult {
                    ok: false,
                    state: RunState::TimedOut.to_string(),
                    exit_code: None,
                    error: Some("deadline expired".to_string()),
                };
                return match log_with_retries(policy, || saga.end_task(task_id, result.to_bytes())) {
                    Ok(()) => TaskOutcome::Failed,
                    Err(e) => {
                        tracing::error!(job_id = %saga.job_id(), task_id, error = %e, "EndTask append failed");
                        TaskOutcome::LogError
                    }
                };
            }
            _ = tokio::time::sleep(policy.poll_interval) => {
                match worker.status(run_id).await {
                    Ok(status) if status.is_done() => {
                        let result = TaskResult::from_status(&status);
                        let ok = result.ok;
                        return match log_with_retries(policy, || {
                            saga.end_task(task_id, result.to_bytes())
                        }) {
                            Ok(()) if ok => TaskOutcome::Completed,
                            Ok(()) => TaskOutcome::Failed,
                            Err(e) => {
                                tracing::error!(job_id = %saga.job_id(), task_id, error = %e, "EndTask append failed");
                                TaskOutcome::LogError
                            }
                        };
                    }
                    Ok(_) => {
                        consecutive_errors = 0;
                    }
                    Err(e) => {
                        consecutive_errors += 1;
                        if consecutive_errors >= policy.retry.max_attempts {
                            tracing::warn!(%run_id, error = %e, "Worker stopped answering status polls");
                            return TaskOutcome::WorkerLost;
                        }
                    }
                }
            }
        }
    }
}

/// Saga appends get a short bounded retry; the log surfaces transient IO
/// errors rather than blocking forever.
fn log_with_retries(
    policy: &TaskRunnerPolicy,
    mut append: impl FnMut() -> crate::error::Result<()>,
) -> crate::error::Result<()> {
    let mut last = None;
    for _ in 0..policy.retry.max_attempts {
        match append() {
            Ok(()) => return Ok(()),
            Err(e @ ScootError::Io(_)) => last = Some(e),
            Err(e) => return Err(e),
        }
    }
    Err(last.unwrap_or_else(|| ScootError::Internal("append retries exhausted".to_string())))
}

fn with_jitter(base: Duration) -> Duration {
    let jitter = rand::thread_rng().gen_range(0..=base.as_millis() as u64 / 2);
    base + Duration::from_millis(jitter)
}
