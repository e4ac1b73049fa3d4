//! End-to-end scheduler scenarios against the fake worker fleet.

mod test_harness;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use scoot::config::{RetryConfig, SchedulerConfig};
use scoot::error::ScootError;
use scoot::saga::{InMemorySagaLog, MessageKind, Saga, SagaLog, SagaMessage};
use scoot::scheduler::task_runner::{run_task, TaskRunnerPolicy};
use scoot::scheduler::{JobStatus, Priority, TaskOutcome, TaskResult, TaskStatus};
use test_harness::{
    assert_eventually, job, message_kinds, single_task_job, FakeWorker, TestScheduler,
};

const WAIT: Duration = Duration::from_secs(5);

#[tokio::test]
async fn test_single_task_happy_path() {
    let fixture = TestScheduler::start().await;
    fixture.add_worker(FakeWorker::auto("n1")).await;

    let job_id = fixture
        .handle
        .schedule(single_task_job(Priority::P2, "t1", &["echo", "hi"]))
        .await
        .unwrap();

    let handle = fixture.handle.clone();
    assert_eventually(
        || async { handle.status(job_id).await.unwrap().status == JobStatus::Completed },
        WAIT,
        "job should complete",
    )
    .await;

    assert_eq!(
        message_kinds(&fixture.log, job_id),
        vec![
            MessageKind::StartSaga,
            MessageKind::StartTask,
            MessageKind::EndTask,
            MessageKind::EndSaga,
        ]
    );

    let report = fixture.handle.status(job_id).await.unwrap();
    assert_eq!(report.tasks.get("t1"), Some(&TaskStatus::Completed));
    fixture.stop().await.unwrap();
}

#[tokio::test]
async fn test_worker_loss_mid_run() {
    let fixture = TestScheduler::start().await;
    let n1 = FakeWorker::manual("n1");
    fixture.add_worker(n1.clone()).await;

    let job_id = fixture
        .handle
        .schedule(single_task_job(Priority::P2, "t2", &["sleep", "60"]))
        .await
        .unwrap();

    // Wait for the attempt to land on n1, then lose the worker.
    let probe = n1.clone();
    assert_eventually(
        || async { probe.has_active_run() },
        WAIT,
        "task should start on n1",
    )
    .await;
    fixture.remove_worker("n1").await;
    fixture.add_worker(FakeWorker::auto("n2")).await;

    let handle = fixture.handle.clone();
    assert_eventually(
        || async { handle.status(job_id).await.unwrap().status == JobStatus::Completed },
        WAIT,
        "task should be re-dispatched and complete",
    )
    .await;

    // One StartTask-EndTask pair: the abandoned attempt logged no EndTask
    // and the retry adopted the already-logged StartTask.
    assert_eq!(
        message_kinds(&fixture.log, job_id),
        vec![
            MessageKind::StartSaga,
            MessageKind::StartTask,
            MessageKind::EndTask,
            MessageKind::EndSaga,
        ]
    );
    fixture.stop().await.unwrap();
}

#[tokio::test]
async fn test_job_abort() {
    let fixture = TestScheduler::start().await;
    let worker = FakeWorker::manual("n1");
    fixture.add_worker(worker.clone()).await;

    let job_id = fixture
        .handle
        .schedule(job(
            Priority::P2,
            &[("t1", &["build"]), ("t2", &["test"])],
        ))
        .await
        .unwrap();

    // t1 runs first (stable task order) and completes.
    let probe = worker.clone();
    assert_eventually(
        || async { probe.has_active_run() },
        WAIT,
        "t1 should start",
    )
    .await;
    worker.complete_active(0);

    // Wait for t2 to be live, then kill the job.
    let probe = worker.clone();
    assert_eventually(
        || async { probe.has_active_run() },
        WAIT,
        "t2 should start",
    )
    .await;
    fixture.handle.kill(job_id).await.unwrap();

    let handle = fixture.handle.clone();
    assert_eventually(
        || async { handle.status(job_id).await.unwrap().status == JobStatus::Aborted },
        WAIT,
        "job should abort",
    )
    .await;

    assert_eq!(
        message_kinds(&fixture.log, job_id),
        vec![
            MessageKind::StartSaga,
            MessageKind::StartTask,
            MessageKind::EndTask,
            MessageKind::StartTask,
            MessageKind::AbortSaga,
            MessageKind::EndTask,
            MessageKind::EndSaga,
        ]
    );

    let report = fixture.handle.status(job_id).await.unwrap();
    assert_eq!(report.tasks.get("t1"), Some(&TaskStatus::Completed));
    assert_eq!(report.tasks.get("t2"), Some(&TaskStatus::Aborted));
    fixture.stop().await.unwrap();
}

#[tokio::test]
async fn test_crash_recovery() {
    // Build the log a crashed scheduler would leave behind: t1 done, t2
    // started but unfinished, t3 untouched.
    let log: Arc<dyn SagaLog> = Arc::new(InMemorySagaLog::new());
    let job_id = Uuid::new_v4();
    let definition = job(
        Priority::P2,
        &[("t1", &["step", "one"]), ("t2", &["step", "two"]), ("t3", &["step", "three"])],
    );
    log.start_saga(job_id, &serde_json::to_vec(&definition).unwrap())
        .unwrap();
    log.log_message(&SagaMessage::start_task(job_id, "t1", Vec::new()))
        .unwrap();
    let done = TaskResult {
        ok: true,
        state: "completed".to_string(),
        exit_code: Some(0),
        error: None,
    };
    log.log_message(&SagaMessage::end_task(job_id, "t1", done.to_bytes()))
        .unwrap();
    log.log_message(&SagaMessage::start_task(job_id, "t2", Vec::new()))
        .unwrap();

    let fixture = TestScheduler::start_with_log(log).await;
    let worker = FakeWorker::auto("n1");
    fixture.add_worker(worker.clone()).await;

    let handle = fixture.handle.clone();
    assert_eventually(
        || async { handle.status(job_id).await.unwrap().status == JobStatus::Completed },
        WAIT,
        "recovered job should finish",
    )
    .await;

    // t1 was not re-run; t2 and t3 each ran once.
    let mut ran: Vec<Vec<String>> = worker.accepted_argvs();
    ran.sort();
    assert_eq!(
        ran,
        vec![
            vec!["step".to_string(), "three".to_string()],
            vec!["step".to_string(), "two".to_string()],
        ]
    );

    let kinds = message_kinds(&fixture.log, job_id);
    assert_eq!(
        kinds.iter().filter(|k| **k == MessageKind::EndTask).count(),
        3
    );
    assert_eq!(kinds.last(), Some(&MessageKind::EndSaga));
    fixture.stop().await.unwrap();
}

#[tokio::test]
async fn test_priority_orders_pending_work() {
    let fixture = TestScheduler::start().await;

    // No workers yet, so both jobs queue.
    let low = fixture
        .handle
        .schedule(single_task_job(Priority::P3, "t-low", &["low"]))
        .await
        .unwrap();
    let high = fixture
        .handle
        .schedule(single_task_job(Priority::P0, "t-high", &["high"]))
        .await
        .unwrap();

    let worker = FakeWorker::manual("n1");
    fixture.add_worker(worker.clone()).await;

    let probe = worker.clone();
    assert_eventually(
        || async { probe.has_active_run() },
        WAIT,
        "something should dispatch",
    )
    .await;
    assert_eq!(worker.accepted_argvs(), vec![vec!["high".to_string()]]);
    worker.complete_active(0);

    let handle = fixture.handle.clone();
    assert_eventually(
        || async { handle.status(high).await.unwrap().status == JobStatus::Completed },
        WAIT,
        "high-priority job should finish first",
    )
    .await;

    let probe = worker.clone();
    assert_eventually(
        || async { probe.has_active_run() },
        WAIT,
        "low-priority task should follow",
    )
    .await;
    assert_eq!(
        worker.accepted_argvs(),
        vec![vec!["high".to_string()], vec!["low".to_string()]]
    );
    worker.complete_active(0);

    let handle = fixture.handle.clone();
    assert_eventually(
        || async { handle.status(low).await.unwrap().status == JobStatus::Completed },
        WAIT,
        "low-priority job should finish",
    )
    .await;
    fixture.stop().await.unwrap();
}

#[tokio::test]
async fn test_duplicate_run_adopts_live_attempt() {
    // A worker already executing the same argv answers QueueFull; the task
    // runner must adopt the live run instead of failing.
    let log: Arc<dyn SagaLog> = Arc::new(InMemorySagaLog::new());
    let job_id = Uuid::new_v4();
    let saga = Arc::new(Saga::create(log.clone(), job_id, Vec::new()).unwrap());

    let definition = single_task_job(Priority::P2, "t1", &["make", "all"]);
    let task = definition.tasks[0].clone();
    let argv = task.command.argv.clone();

    let worker = FakeWorker::manual("n1");
    worker.seed_active(argv);
    let runs_before = worker.run_count();

    let (events_tx, mut events_rx) = mpsc::channel(8);
    let policy = TaskRunnerPolicy {
        retry: RetryConfig {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(50),
        },
        poll_interval: Duration::from_millis(10),
        default_timeout: Duration::from_secs(5),
        timeout_slack: Duration::from_secs(1),
    };
    tokio::spawn(run_task(
        saga.clone(),
        task,
        Arc::new(worker.clone()),
        "n1".into(),
        policy,
        CancellationToken::new(),
        CancellationToken::new(),
        events_tx,
    ));

    // Let the runner adopt the run, then finish it.
    let probe = worker.clone();
    assert_eventually(
        || async { probe.has_active_run() },
        WAIT,
        "seeded run should stay live",
    )
    .await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    worker.complete_active(0);

    let event = tokio::time::timeout(WAIT, events_rx.recv())
        .await
        .expect("runner should report")
        .expect("channel open");
    assert_eq!(event.outcome, TaskOutcome::Completed);
    // No second run was created on the worker.
    assert_eq!(worker.run_count(), runs_before);
    assert!(saga.is_task_completed("t1"));
}

#[tokio::test]
async fn test_failed_task_keeps_job_running_by_default() {
    let fixture = TestScheduler::start().await;
    let worker = FakeWorker::manual("n1");
    fixture.add_worker(worker.clone()).await;

    let job_id = fixture
        .handle
        .schedule(job(Priority::P2, &[("t1", &["a"]), ("t2", &["b"])]))
        .await
        .unwrap();

    // Fail the first task; the second still runs.
    let probe = worker.clone();
    assert_eventually(|| async { probe.has_active_run() }, WAIT, "t1 starts").await;
    worker.complete_active(3);

    let probe = worker.clone();
    assert_eventually(|| async { probe.has_active_run() }, WAIT, "t2 starts").await;
    worker.complete_active(0);

    let handle = fixture.handle.clone();
    assert_eventually(
        || async { handle.status(job_id).await.unwrap().status == JobStatus::Completed },
        WAIT,
        "job should finish despite the failed task",
    )
    .await;

    let report = fixture.handle.status(job_id).await.unwrap();
    assert_eq!(report.tasks.get("t1"), Some(&TaskStatus::Failed));
    assert_eq!(report.tasks.get("t2"), Some(&TaskStatus::Completed));
    fixture.stop().await.unwrap();
}

#[tokio::test]
async fn test_strict_mode_aborts_job_on_task_failure() {
    let log: Arc<dyn SagaLog> = Arc::new(InMemorySagaLog::new());
    let mut config = SchedulerConfig::fast();
    config.abort_on_task_failure = true;
    let fixture = TestScheduler::start_with(log, config).await;

    let worker = FakeWorker::manual("n1");
    fixture.add_worker(worker.clone()).await;

    let job_id = fixture
        .handle
        .schedule(job(Priority::P2, &[("t1", &["a"]), ("t2", &["b"])]))
        .await
        .unwrap();

    let probe = worker.clone();
    assert_eventually(|| async { probe.has_active_run() }, WAIT, "t1 starts").await;
    worker.complete_active(1);

    let handle = fixture.handle.clone();
    assert_eventually(
        || async { handle.status(job_id).await.unwrap().status == JobStatus::Aborted },
        WAIT,
        "strict mode should abort the job",
    )
    .await;

    let report = fixture.handle.status(job_id).await.unwrap();
    assert_eq!(report.tasks.get("t1"), Some(&TaskStatus::Failed));
    assert_eq!(report.tasks.get("t2"), Some(&TaskStatus::Aborted));
    fixture.stop().await.unwrap();
}

#[tokio::test]
async fn test_admission_rejects_invalid_jobs() {
    let fixture = TestScheduler::start().await;

    let err = fixture
        .handle
        .schedule(job(Priority::P2, &[]))
        .await
        .unwrap_err();
    assert!(matches!(err, ScootError::InvalidJob(_)));

    let err = fixture
        .handle
        .schedule(job(Priority::P2, &[("t1", &["a"]), ("t1", &["b"])]))
        .await
        .unwrap_err();
    assert!(matches!(err, ScootError::InvalidJob(_)));
    fixture.stop().await.unwrap();
}

#[tokio::test]
async fn test_kill_errors() {
    let fixture = TestScheduler::start().await;
    fixture.add_worker(FakeWorker::auto("n1")).await;

    let err = fixture.handle.kill(Uuid::new_v4()).await.unwrap_err();
    assert!(matches!(err, ScootError::JobNotFound(_)));

    let job_id = fixture
        .handle
        .schedule(single_task_job(Priority::P2, "t1", &["x"]))
        .await
        .unwrap();
    let handle = fixture.handle.clone();
    assert_eventually(
        || async { handle.status(job_id).await.unwrap().status == JobStatus::Completed },
        WAIT,
        "job should complete",
    )
    .await;

    let err = fixture.handle.kill(job_id).await.unwrap_err();
    assert!(matches!(err, ScootError::AlreadyTerminal(_)));
    fixture.stop().await.unwrap();
}

#[tokio::test]
async fn test_status_unknown_job() {
    let fixture = TestScheduler::start().await;
    let report = fixture.handle.status(Uuid::new_v4()).await.unwrap();
    assert_eq!(report.status, JobStatus::NotFound);
    assert!(report.tasks.is_empty());
    fixture.stop().await.unwrap();
}

#[tokio::test]
async fn test_shutdown_drains_running_tasks() {
    let log: Arc<dyn SagaLog> = Arc::new(InMemorySagaLog::new());
    let fixture = TestScheduler::start_with_log(log.clone()).await;
    let worker = FakeWorker::manual("n1");
    fixture.add_worker(worker.clone()).await;

    let job_id = fixture
        .handle
        .schedule(single_task_job(Priority::P2, "t1", &["slow"]))
        .await
        .unwrap();
    let probe = worker.clone();
    assert_eventually(|| async { probe.has_active_run() }, WAIT, "t1 starts").await;

    fixture.stop().await.unwrap();

    // The runner recorded its aborted end before the loop exited.
    let kinds = message_kinds(&log, job_id);
    assert!(kinds.contains(&MessageKind::EndTask));
}
