//! Test harness for scheduler integration tests.
//!
//! Provides a scriptable fake worker fleet and a running scheduler fixture
//! wired to an in-memory (or caller-supplied) saga log.

// Each test target includes this module and uses a different slice of it.
#![allow(dead_code)]

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use scoot::cluster::{ClusterIngest, ClusterView, Node, NodeUpdate};
use scoot::config::SchedulerConfig;
use scoot::error::{Result, ScootError};
use scoot::saga::{InMemorySagaLog, JobId, SagaLog};
use scoot::scheduler::{
    CommandSpec, JobDefinition, Priority, Scheduler, SchedulerHandle, TaskDefinition,
};
use scoot::worker::{RunId, RunState, RunStatus, Worker, WorkerConnector};

/// A worker whose runs are driven by the test instead of real processes.
///
/// In auto mode every run completes immediately with exit 0. In manual
/// mode runs stay `Running` until the test calls `complete_active`.
#[derive(Clone)]
pub struct FakeWorker {
    inner: Arc<FakeInner>,
}

struct FakeInner {
    name: String,
    auto_complete: bool,
    runs: Mutex<HashMap<RunId, RunStatus>>,
    order: Mutex<Vec<Vec<String>>>,
    active: Mutex<Option<RunId>>,
}

impl FakeWorker {
    pub fn auto(name: &str) -> Self {
        Self::new(name, true)
    }

    pub fn manual(name: &str) -> Self {
        Self::new(name, false)
    }

    fn new(name: &str, auto_complete: bool) -> Self {
        Self {
            inner: Arc::new(FakeInner {
                name: name.to_string(),
                auto_complete,
                runs: Mutex::new(HashMap::new()),
                order: Mutex::new(Vec::new()),
                active: Mutex::new(None),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Pretend a run for `argv` is already in flight, as if a previous
    /// attempt's RPC made it through.
    pub fn seed_active(&self, argv: Vec<String>) -> RunId {
        let run_id = Uuid::new_v4();
        let mut status = RunStatus::new(run_id, argv);
        status.state = RunState::Running;
        self.inner.runs.lock().unwrap().insert(run_id, status);
        *self.inner.active.lock().unwrap() = Some(run_id);
        run_id
    }

    /// Finish the active run with the given exit code.
    pub fn complete_active(&self, exit_code: i32) {
        let active = self.inner.active.lock().unwrap().take();
        if let Some(run_id) = active {
            let mut runs = self.inner.runs.lock().unwrap();
            if let Some(status) = runs.get_mut(&run_id) {
                if !status.is_done() {
                    status.state = if exit_code == 0 {
                        RunState::Completed
                    } else {
                        RunState::Failed
                    };
                    status.exit_code = Some(exit_code);
                }
            }
        }
    }

    pub fn run_count(&self) -> usize {
        self.inner.runs.lock().unwrap().len()
    }

    /// Argv of every `run` call that was accepted, in order.
    pub fn accepted_argvs(&self) -> Vec<Vec<String>> {
        self.inner.order.lock().unwrap().clone()
    }

    pub fn has_active_run(&self) -> bool {
        self.inner.active.lock().unwrap().is_some()
    }
}

#[async_trait]
impl Worker for FakeWorker {
    async fn run(&self, cmd: &CommandSpec) -> Result<RunStatus> {
        let mut active = self.inner.active.lock().unwrap();
        if let Some(current) = *active {
            let runs = self.inner.runs.lock().unwrap();
            if let Some(status) = runs.get(&current) {
                if !status.is_done() {
                    return Err(ScootError::QueueFull {
                        active_argv: status.argv.clone(),
                    });
                }
            }
        }

        let run_id = Uuid::new_v4();
        let mut status = RunStatus::new(run_id, cmd.argv.clone());
        if self.inner.auto_complete {
            status.state = RunState::Completed;
            status.exit_code = Some(0);
        } else {
            status.state = RunState::Running;
            *active = Some(run_id);
        }
        self.inner.order.lock().unwrap().push(cmd.argv.clone());
        self.inner
            .runs
            .lock()
            .unwrap()
            .insert(run_id, status.clone());
        Ok(status)
    }

    async fn status(&self, run_id: RunId) -> Result<RunStatus> {
        self.inner
            .runs
            .lock()
            .unwrap()
            .get(&run_id)
            .cloned()
            .ok_or_else(|| ScootError::RunNotFound(run_id.to_string()))
    }

    async fn status_all(&self) -> Result<Vec<RunStatus>> {
        Ok(self.inner.runs.lock().unwrap().values().cloned().collect())
    }

    async fn abort(&self, run_id: RunId) -> Result<RunStatus> {
        // Lock order matches run(): active before runs.
        let mut active = self.inner.active.lock().unwrap();
        let mut runs = self.inner.runs.lock().unwrap();
        let status = runs
            .get_mut(&run_id)
            .ok_or_else(|| ScootError::RunNotFound(run_id.to_string()))?;
        if !status.is_done() {
            status.state = RunState::Aborted;
        }
        if *active == Some(run_id) {
            *active = None;
        }
        Ok(status.clone())
    }

    async fn erase(&self, run_id: RunId) -> Result<()> {
        self.inner.runs.lock().unwrap().remove(&run_id);
        Ok(())
    }
}

/// Hands the scheduler pre-registered fakes when nodes join.
#[derive(Default)]
pub struct FakeConnector {
    workers: Mutex<HashMap<String, FakeWorker>>,
}

impl FakeConnector {
    pub fn register(&self, worker: FakeWorker) {
        self.workers
            .lock()
            .unwrap()
            .insert(worker.name().to_string(), worker);
    }
}

impl WorkerConnector for FakeConnector {
    fn connect(&self, node: &Node) -> Arc<dyn Worker> {
        let mut workers = self.workers.lock().unwrap();
        let worker = workers
            .entry(node.id.as_str().to_string())
            .or_insert_with(|| FakeWorker::auto(node.id.as_str()));
        Arc::new(worker.clone())
    }
}

/// A scheduler running against a fake fleet.
pub struct TestScheduler {
    pub handle: SchedulerHandle,
    pub log: Arc<dyn SagaLog>,
    pub connector: Arc<FakeConnector>,
    pub ingest: mpsc::Sender<ClusterIngest>,
    pub shutdown: CancellationToken,
    join: JoinHandle<Result<()>>,
}

impl TestScheduler {
    pub async fn start() -> Self {
        Self::start_with_log(Arc::new(InMemorySagaLog::new())).await
    }

    pub async fn start_with_log(log: Arc<dyn SagaLog>) -> Self {
        Self::start_with(log, SchedulerConfig::fast()).await
    }

    pub async fn start_with(log: Arc<dyn SagaLog>, config: SchedulerConfig) -> Self {
        let connector = Arc::new(FakeConnector::default());
        let (cluster, ingest) = ClusterView::spawn(Vec::new());
        let subscription = cluster.subscribe().await.expect("cluster view running");

        let (scheduler, handle) = Scheduler::new(config, log.clone(), connector.clone());
        let shutdown = CancellationToken::new();
        let join = tokio::spawn(scheduler.run(subscription, shutdown.clone()));

        Self {
            handle,
            log,
            connector,
            ingest,
            shutdown,
            join,
        }
    }

    /// Register a fake and announce its node to the scheduler.
    pub async fn add_worker(&self, worker: FakeWorker) {
        let node = Node::new(worker.name(), "fake");
        self.connector.register(worker);
        self.ingest
            .send(ClusterIngest::Updates(vec![NodeUpdate::Added(node)]))
            .await
            .expect("cluster view running");
    }

    pub async fn remove_worker(&self, name: &str) {
        self.ingest
            .send(ClusterIngest::Updates(vec![NodeUpdate::Removed(
                name.into(),
            )]))
            .await
            .expect("cluster view running");
    }

    /// Graceful stop; returns the loop's exit result.
    pub async fn stop(self) -> Result<()> {
        self.shutdown.cancel();
        self.join.await.expect("scheduler task panicked")
    }
}

pub fn job(priority: Priority, tasks: &[(&str, &[&str])]) -> JobDefinition {
    JobDefinition {
        priority,
        tag: None,
        basis: None,
        requestor: None,
        tasks: tasks
            .iter()
            .map(|(task_id, argv)| TaskDefinition {
                task_id: task_id.to_string(),
                command: CommandSpec::new(
                    argv.iter().map(|s| s.to_string()).collect(),
                    "empty",
                ),
            })
            .collect(),
    }
}

pub fn single_task_job(priority: Priority, task_id: &str, argv: &[&str]) -> JobDefinition {
    job(priority, &[(task_id, argv)])
}

/// Wait for a condition to become true with timeout.
pub async fn wait_for<F, Fut>(condition: F, timeout: Duration) -> bool
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    let start = tokio::time::Instant::now();
    while start.elapsed() < timeout {
        if condition().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

/// Assert a condition eventually becomes true.
pub async fn assert_eventually<F, Fut>(condition: F, timeout: Duration, message: &str)
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    assert!(wait_for(condition, timeout).await, "{}", message);
}

/// Saga message kinds for `job_id`, in log order.
pub fn message_kinds(log: &Arc<dyn SagaLog>, job_id: JobId) -> Vec<scoot::saga::MessageKind> {
    log.messages(job_id)
        .map(|msgs| msgs.iter().map(|m| m.kind).collect())
        .unwrap_or_default()
}
