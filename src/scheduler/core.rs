use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::cluster::{NodeId, NodeUpdate, Subscription};
use crate::config::SchedulerConfig;
use crate::error::{Result, ScootError};
use crate::saga::{JobId, MessageKind, Saga, SagaLog, SagaMessage};
use crate::scheduler::job::{JobDefinition, Priority};
use crate::scheduler::state::{JobState, RunningTask, TaskStatus};
use crate::scheduler::task_runner::{
    run_task, TaskEvent, TaskOutcome, TaskResult, TaskRunnerPolicy,
};
use crate::worker::{Worker, WorkerConnector};

/// Client-visible job state, derived from the saga.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    InProgress,
    Completed,
    Aborted,
    NotFound,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobStatusReport {
    pub job_id: JobId,
    pub status: JobStatus,
    #[serde(default)]
    pub tasks: BTreeMap<String, TaskStatus>,
}

/// Requests serialized into the scheduler loop.
pub enum SchedulerMessage {
    Schedule {
        definition: JobDefinition,
        reply: oneshot::Sender<Result<JobId>>,
    },
    Status {
        job_id: JobId,
        reply: oneshot::Sender<JobStatusReport>,
    },
    Kill {
        job_id: JobId,
        reply: oneshot::Sender<Result<()>>,
    },
}

/// Cheap-to-clone handle for submitting requests to a running scheduler.
#[derive(Clone)]
pub struct SchedulerHandle {
    tx: mpsc::Sender<SchedulerMessage>,
}

impl SchedulerHandle {
    pub async fn schedule(&self, definition: JobDefinition) -> Result<JobId> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(SchedulerMessage::Schedule { definition, reply })
            .await
            .map_err(|_| ScootError::Internal("scheduler stopped".to_string()))?;
        rx.await
            .map_err(|_| ScootError::Internal("scheduler stopped".to_string()))?
    }

    pub async fn status(&self, job_id: JobId) -> Result<JobStatusReport> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(SchedulerMessage::Status { job_id, reply })
            .await
            .map_err(|_| ScootError::Internal("scheduler stopped".to_string()))?;
        rx.await
            .map_err(|_| ScootError::Internal("scheduler stopped".to_string()))
    }

    pub async fn kill(&self, job_id: JobId) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(SchedulerMessage::Kill { job_id, reply })
            .await
            .map_err(|_| ScootError::Internal("scheduler stopped".to_string()))?;
        rx.await
            .map_err(|_| ScootError::Internal("scheduler stopped".to_string()))?
    }
}

/// Hook for driving compensating tasks while a job aborts. The default
/// policy compensates nothing.
pub trait CompensationStrategy: Send + Sync {
    fn compensate(&self, saga: &Saga) -> Result<()>;
}

pub struct NoCompensation;

impl CompensationStrategy for NoCompensation {
    fn compensate(&self, _saga: &Saga) -> Result<()> {
        Ok(())
    }
}

/// The single-threaded arbiter. All JobState mutation happens inside
/// `run`; task runners and the cluster view communicate with it purely
/// through channels.
pub struct Scheduler {
    config: SchedulerConfig,
    log: Arc<dyn SagaLog>,
    connector: Arc<dyn WorkerConnector>,
    compensation: Arc<dyn CompensationStrategy>,

    jobs: HashMap<JobId, JobState>,
    admission_counter: u64,
    members: BTreeSet<NodeId>,
    free_workers: BTreeMap<NodeId, Arc<dyn Worker>>,
    busy_workers: HashMap<NodeId, BusyWorker>,

    msg_rx: mpsc::Receiver<SchedulerMessage>,
    events_tx: mpsc::Sender<TaskEvent>,
    events_rx: mpsc::Receiver<TaskEvent>,
}

struct BusyWorker {
    worker: Arc<dyn Worker>,
    job_id: JobId,
    task_id: String,
}

enum LoopInput {
    Message(Option<SchedulerMessage>),
    Cluster(Option<Vec<NodeUpdate>>),
    Task(Option<TaskEvent>),
    Tick,
    Shutdown,
}

impl Scheduler {
    pub fn new(
        config: SchedulerConfig,
        log: Arc<dyn SagaLog>,
        connector: Arc<dyn WorkerConnector>,
    ) -> (Self, SchedulerHandle) {
        Self::with_compensation(config, log, connector, Arc::new(NoCompensation))
    }

    pub fn with_compensation(
        config: SchedulerConfig,
        log: Arc<dyn SagaLog>,
        connector: Arc<dyn WorkerConnector>,
        compensation: Arc<dyn CompensationStrategy>,
    ) -> (Self, SchedulerHandle) {
        let (msg_tx, msg_rx) = mpsc::channel(64);
        let (events_tx, events_rx) = mpsc::channel(256);
        let scheduler = Self {
            config,
            log,
            connector,
            compensation,
            jobs: HashMap::new(),
            admission_counter: 0,
            members: BTreeSet::new(),
            free_workers: BTreeMap::new(),
            busy_workers: HashMap::new(),
            msg_rx,
            events_tx,
            events_rx,
        };
        (scheduler, SchedulerHandle { tx: msg_tx })
    }

    fn policy(&self) -> TaskRunnerPolicy {
        TaskRunnerPolicy {
            retry: self.config.worker_retry.clone(),
            poll_interval: self.config.status_poll_interval,
            default_timeout: self.config.default_task_timeout,
            timeout_slack: self.config.timeout_slack,
        }
    }

    /// Rebuild in-memory job state from the log, then run the loop until
    /// shutdown. A corrupt log or a persistent append failure is fatal and
    /// surfaces as the returned error after a best-effort clean stop.
    pub async fn run(
        mut self,
        mut cluster: Subscription,
        shutdown: CancellationToken,
    ) -> Result<()> {
        self.recover()?;

        let mut tick = tokio::time::interval(self.config.tick_interval);
        let mut cluster_open = true;
        let result = loop {
            // Resolve the select to a value first so handlers can take
            // &mut self without fighting the borrowed futures.
            let input = tokio::select! {
                msg = self.msg_rx.recv() => LoopInput::Message(msg),
                updates = cluster.recv(), if cluster_open => LoopInput::Cluster(updates),
                event = self.events_rx.recv() => LoopInput::Task(event),
                _ = tick.tick() => LoopInput::Tick,
                _ = shutdown.cancelled() => LoopInput::Shutdown,
            };
            match input {
                LoopInput::Message(Some(msg)) => self.handle_message(msg),
                LoopInput::Message(None) => break Ok(()),
                LoopInput::Cluster(Some(batch)) => self.apply_cluster_updates(batch),
                LoopInput::Cluster(None) => {
                    tracing::warn!("Cluster membership stream closed");
                    cluster_open = false;
                }
                // Task events are never None: the scheduler holds a sender.
                LoopInput::Task(Some(event)) => self.handle_task_event(event),
                LoopInput::Task(None) | LoopInput::Tick => {}
                LoopInput::Shutdown => break Ok(()),
            }

            self.dispatch();
            if let Err(e) = self.finalize_jobs() {
                break Err(e);
            }
        };

        self.drain().await;
        result
    }

    /// Replay active sagas into fresh JobStates. Tasks with an open
    /// StartTask become runnable again; recorded EndTasks keep their
    /// terminal status.
    fn recover(&mut self) -> Result<()> {
        let active = self.log.active_sagas()?;
        for job_id in active {
            let messages = self.log.messages(job_id)?;
            let saga = Arc::new(Saga::rehydrate(self.log.clone(), job_id, &messages)?);
            let definition: JobDefinition = serde_json::from_slice(&saga.job_blob())
                .map_err(|e| ScootError::Corrupt(format!("job blob for {}: {}", job_id, e)))?;

            let seq = self.admission_counter;
            self.admission_counter += 1;
            let mut state = JobState::new(job_id, definition, saga.clone(), seq);
            state.aborting = saga.is_aborted();
            for msg in &messages {
                if msg.kind != MessageKind::EndTask {
                    continue;
                }
                let task_id = msg.task_id.as_deref().unwrap_or_default();
                let status = end_task_status(&msg.data);
                state.set_status(task_id, status);
            }
            if state.aborting {
                // An aborting job dispatches nothing; close out whatever
                // never reached a terminal status so the saga can end.
                let open: Vec<String> = state
                    .statuses()
                    .iter()
                    .filter(|(_, s)| !s.is_terminal())
                    .map(|(t, _)| t.clone())
                    .collect();
                for task_id in open {
                    state.set_status(&task_id, TaskStatus::Aborted);
                }
            }
            tracing::info!(
                %job_id,
                tasks = state.statuses().len(),
                aborting = state.aborting,
                "Recovered job from saga log"
            );
            self.jobs.insert(job_id, state);
        }
        Ok(())
    }

    fn handle_message(&mut self, msg: SchedulerMessage) {
        match msg {
            SchedulerMessage::Schedule { definition, reply } => {
                let _ = reply.send(self.admit(definition));
            }
            SchedulerMessage::Status { job_id, reply } => {
                let _ = reply.send(self.status_report(job_id));
            }
            SchedulerMessage::Kill { job_id, reply } => {
                let _ = reply.send(self.kill(job_id));
            }
        }
    }

    fn admit(&mut self, definition: JobDefinition) -> Result<JobId> {
        definition.validate()?;
        let job_id = uuid::Uuid::new_v4();
        let blob = serde_json::to_vec(&definition)?;

        let saga = with_io_retries(|| Saga::create(self.log.clone(), job_id, blob.clone()))?;

        let seq = self.admission_counter;
        self.admission_counter += 1;
        tracing::info!(
            %job_id,
            priority = %definition.priority,
            tasks = definition.tasks.len(),
            tag = definition.tag.as_deref().unwrap_or(""),
            "Job admitted"
        );
        self.jobs
            .insert(job_id, JobState::new(job_id, definition, Arc::new(saga), seq));
        Ok(job_id)
    }

    fn status_report(&self, job_id: JobId) -> JobStatusReport {
        if let Some(job) = self.jobs.get(&job_id) {
            return JobStatusReport {
                job_id,
                status: JobStatus::InProgress,
                tasks: job
                    .statuses()
                    .iter()
                    .map(|(k, v)| (k.clone(), *v))
                    .collect(),
            };
        }
        // Not in memory: either ended (derive from the log) or unknown.
        match self.log.messages(job_id) {
            Ok(messages) => report_from_messages(job_id, &messages),
            Err(_) => JobStatusReport {
                job_id,
                status: JobStatus::NotFound,
                tasks: BTreeMap::new(),
            },
        }
    }

    fn kill(&mut self, job_id: JobId) -> Result<()> {
        if !self.jobs.contains_key(&job_id) {
            return match self.log.messages(job_id) {
                Ok(_) => Err(ScootError::AlreadyTerminal(job_id.to_string())),
                Err(_) => Err(ScootError::JobNotFound(job_id.to_string())),
            };
        }
        self.abort_job(job_id)
    }

    fn abort_job(&mut self, job_id: JobId) -> Result<()> {
        let job = self.jobs.get_mut(&job_id).expect("caller checked");
        if job.aborting {
            // Kill is idempotent while the abort drains.
            return Ok(());
        }
        with_io_retries(|| job.saga.abort_saga())?;
        job.aborting = true;
        tracing::info!(%job_id, "Job aborting");

        // Cancel live attempts; their runners log the aborted EndTasks.
        for (task_id, running) in job.running_tasks() {
            tracing::debug!(%job_id, task_id = %task_id, "Cancelling task runner");
            running.cancel.cancel();
        }
        // Queued tasks will never start; mark them off now.
        let queued: Vec<String> = job
            .statuses()
            .iter()
            .filter(|(_, s)| **s == TaskStatus::NotStarted)
            .map(|(t, _)| t.clone())
            .collect();
        for task_id in queued {
            let _ = job.mark_terminal(&task_id, TaskStatus::Aborted);
        }
        Ok(())
    }

    fn apply_cluster_updates(&mut self, updates: Vec<NodeUpdate>) {
        for update in updates {
            match update {
                NodeUpdate::Added(node) => {
                    if !self.members.insert(node.id.clone()) {
                        continue;
                    }
                    tracing::info!(node = %node.id, addr = %node.addr, "Worker joined");
                    if !self.busy_workers.contains_key(&node.id) {
                        let worker = self.connector.connect(&node);
                        self.free_workers.insert(node.id, worker);
                    }
                }
                NodeUpdate::Removed(node_id) => {
                    self.members.remove(&node_id);
                    self.free_workers.remove(&node_id);
                    tracing::info!(node = %node_id, "Worker left");
                    let Some(busy) = self.busy_workers.remove(&node_id) else {
                        continue;
                    };
                    // The attempt on that worker is unobservable now; tell
                    // the runner to stop quietly and make the task
                    // runnable again.
                    if let Some(job) = self.jobs.get_mut(&busy.job_id) {
                        if let Some(running) = job.take_running(&busy.task_id) {
                            running.abandon.cancel();
                        }
                        self.rollback_task(busy.job_id, &busy.task_id);
                    }
                }
            }
        }
    }

    /// Started -> NotStarted, or straight to Aborted when the job is
    /// already draining. If the attempt's EndTask actually reached the log
    /// before the worker vanished, keep the recorded result instead of
    /// re-running a finished task.
    fn rollback_task(&mut self, job_id: JobId, task_id: &str) {
        let Some(job) = self.jobs.get_mut(&job_id) else {
            return;
        };
        let result = if let Some(recorded) = job.saga.task_result(task_id) {
            job.mark_terminal(task_id, end_task_status(&recorded))
        } else if job.aborting {
            job.mark_terminal(task_id, TaskStatus::Aborted)
        } else {
            job.revert_to_not_started(task_id)
        };
        match result {
            Ok(()) => {
                tracing::info!(%job_id, task_id, "Task rolled back")
            }
            Err(e) => tracing::debug!(%job_id, task_id, error = %e, "Rollback skipped"),
        }
    }

    fn handle_task_event(&mut self, event: TaskEvent) {
        let TaskEvent {
            job_id,
            task_id,
            node_id,
            outcome,
        } = event;

        // Release the worker first, but only if this event belongs to the
        // attempt the worker is booked for (a stale event must not free a
        // re-assigned worker). Lost workers are written off; workers the
        // cluster dropped mid-run were already released.
        let booked_for_event = self
            .busy_workers
            .get(&node_id)
            .map(|b| b.job_id == job_id && b.task_id == task_id)
            .unwrap_or(false);
        if booked_for_event {
            let busy = self.busy_workers.remove(&node_id).expect("checked above");
            let keep =
                !matches!(outcome, TaskOutcome::WorkerLost) && self.members.contains(&node_id);
            if keep {
                self.free_workers.insert(node_id.clone(), busy.worker);
            }
        }

        if !self.jobs.contains_key(&job_id) {
            tracing::debug!(%job_id, task_id = %task_id, "Event for finished job ignored");
            return;
        }

        match outcome {
            TaskOutcome::WorkerLost | TaskOutcome::LogError => {
                self.rollback_task(job_id, &task_id);
            }
            TaskOutcome::Abandoned => {}
            _ => {
                let status = match outcome {
                    TaskOutcome::Completed => TaskStatus::Completed,
                    TaskOutcome::Failed => TaskStatus::Failed,
                    _ => TaskStatus::Aborted,
                };
                let job = self.jobs.get_mut(&job_id).expect("checked above");
                if let Err(e) = job.mark_terminal(&task_id, status) {
                    tracing::warn!(%job_id, task_id = %task_id, error = %e, "Task event dropped");
                }
            }
        }

        if matches!(outcome, TaskOutcome::Failed) && self.config.abort_on_task_failure {
            if self.jobs.get(&job_id).map(|j| !j.aborting).unwrap_or(false) {
                tracing::info!(%job_id, task_id = %task_id, "Task failed in strict mode, aborting job");
                if let Err(e) = self.abort_job(job_id) {
                    tracing::error!(%job_id, error = %e, "Strict-mode abort failed");
                }
            }
        }
    }

    /// Pair runnable tasks with free workers, highest rank first.
    fn dispatch(&mut self) {
        if self.free_workers.is_empty() {
            return;
        }
        let policy = self.policy();
        let mut candidates = rank_candidates(&self.jobs);
        candidates.reverse(); // pop from the front via Vec::pop

        while let Some((job_id, task_id)) = candidates.pop().map(|c| (c.job_id, c.task_id)) {
            let Some((node_id, worker)) = self.free_workers.pop_first() else {
                break;
            };
            let job = self.jobs.get_mut(&job_id).expect("candidate from live job");
            let task = job
                .definition
                .tasks
                .iter()
                .find(|t| t.task_id == task_id)
                .expect("candidate task exists")
                .clone();

            let cancel = CancellationToken::new();
            let abandon = CancellationToken::new();
            if let Err(e) = job.mark_started(
                &task_id,
                RunningTask {
                    node_id: node_id.clone(),
                    cancel: cancel.clone(),
                    abandon: abandon.clone(),
                },
            ) {
                tracing::warn!(%job_id, task_id = %task_id, error = %e, "Dispatch skipped");
                self.free_workers.insert(node_id, worker);
                continue;
            }

            tracing::info!(%job_id, task_id = %task_id, node = %node_id, "Task dispatched");
            self.busy_workers.insert(
                node_id.clone(),
                BusyWorker {
                    worker: worker.clone(),
                    job_id,
                    task_id: task_id.clone(),
                },
            );
            tokio::spawn(run_task(
                job.saga.clone(),
                task,
                worker,
                node_id,
                policy.clone(),
                cancel,
                abandon,
                self.events_tx.clone(),
            ));
        }
    }

    /// Seal jobs whose tasks have all reached a terminal status.
    fn finalize_jobs(&mut self) -> Result<()> {
        let done: Vec<JobId> = self
            .jobs
            .values()
            .filter(|j| j.all_terminal() && !j.has_running_tasks())
            .map(|j| j.job_id)
            .collect();

        for job_id in done {
            let job = self.jobs.get(&job_id).expect("collected above");
            if job.saga.is_aborted() {
                if let Err(e) = self.compensation.compensate(&job.saga) {
                    tracing::error!(%job_id, error = %e, "Compensation failed");
                }
            }
            with_io_retries(|| job.saga.end_saga())?;
            let job = self.jobs.remove(&job_id).expect("still present");
            tracing::info!(
                %job_id,
                aborted = job.saga.is_aborted(),
                "Job reached terminal state"
            );
        }
        Ok(())
    }

    /// Shutdown: cancel every runner and absorb their final events within
    /// the grace period so aborted EndTasks make it to the log.
    async fn drain(&mut self) {
        for job in self.jobs.values() {
            for (_, running) in job.running_tasks() {
                running.cancel.cancel();
            }
        }
        let deadline = tokio::time::Instant::now() + self.config.shutdown_grace;
        while self.jobs.values().any(|j| j.has_running_tasks()) {
            let event = tokio::select! {
                event = self.events_rx.recv() => event,
                _ = tokio::time::sleep_until(deadline) => {
                    tracing::warn!("Shutdown grace period expired with runners outstanding");
                    break;
                }
            };
            match event {
                Some(event) => self.handle_task_event(event),
                None => break,
            }
        }
        if let Err(e) = self.finalize_jobs() {
            tracing::error!(error = %e, "Failed to seal finished jobs during shutdown");
        }
        tracing::info!("Scheduler stopped");
    }
}

#[derive(Debug, PartialEq, Eq)]
struct Candidate {
    priority: Priority,
    admission_seq: u64,
    task_id: String,
    job_id: JobId,
}

/// Dispatch order: priority first (P0 wins), then job admission order,
/// then task id for a stable ranking.
fn rank_candidates(jobs: &HashMap<JobId, JobState>) -> Vec<Candidate> {
    let mut candidates: Vec<Candidate> = jobs
        .values()
        .flat_map(|job| {
            job.runnable_tasks().into_iter().map(|task| Candidate {
                priority: job.definition.priority,
                admission_seq: job.admission_seq,
                task_id: task.task_id.clone(),
                job_id: job.job_id,
            })
        })
        .collect();
    candidates.sort_by(|a, b| {
        (a.priority, a.admission_seq, &a.task_id).cmp(&(b.priority, b.admission_seq, &b.task_id))
    });
    candidates
}

fn end_task_status(data: &[u8]) -> TaskStatus {
    match TaskResult::from_bytes(data) {
        Some(result) if result.ok => TaskStatus::Completed,
        Some(result) if result.state == "aborted" => TaskStatus::Aborted,
        Some(_) => TaskStatus::Failed,
        None => TaskStatus::Failed,
    }
}

/// Derive a report for a job that is no longer in memory.
fn report_from_messages(job_id: JobId, messages: &[SagaMessage]) -> JobStatusReport {
    let aborted = messages.iter().any(|m| m.kind == MessageKind::AbortSaga);
    let ended = messages.iter().any(|m| m.kind == MessageKind::EndSaga);

    let mut tasks: BTreeMap<String, TaskStatus> = BTreeMap::new();
    if let Some(start) = messages.first() {
        if let Ok(definition) = serde_json::from_slice::<JobDefinition>(&start.data) {
            for task in &definition.tasks {
                let fallback = if aborted {
                    TaskStatus::Aborted
                } else {
                    TaskStatus::NotStarted
                };
                tasks.insert(task.task_id.clone(), fallback);
            }
        }
    }
    for msg in messages {
        if msg.kind == MessageKind::EndTask {
            if let Some(task_id) = msg.task_id.clone() {
                tasks.insert(task_id, end_task_status(&msg.data));
            }
        }
    }

    let status = if !ended {
        // In the log but not in memory and not ended: visible only in the
        // gap before recovery re-admits it.
        JobStatus::InProgress
    } else if aborted {
        JobStatus::Aborted
    } else {
        JobStatus::Completed
    };
    JobStatusReport {
        job_id,
        status,
        tasks,
    }
}

/// Bounded retry for saga-log appends on the loop thread.
fn with_io_retries<T>(mut op: impl FnMut() -> Result<T>) -> Result<T> {
    const ATTEMPTS: u32 = 3;
    let mut last = None;
    for _ in 0..ATTEMPTS {
        match op() {
            Ok(value) => return Ok(value),
            Err(e @ ScootError::Io(_)) => last = Some(e),
            Err(e) => return Err(e),
        }
    }
    Err(last.unwrap_or_else(|| ScootError::Internal("retries exhausted".to_string())))
}
