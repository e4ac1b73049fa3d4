use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::cluster::NodeId;
use crate::error::{Result, ScootError};
use crate::saga::{JobId, Saga};
use crate::scheduler::job::{JobDefinition, TaskDefinition};

/// Scheduler-level status of one task.
///
/// Transitions are monotonic with one exception: `Started -> NotStarted`
/// is the rollback move taken when the assigned worker is lost before the
/// task completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    NotStarted,
    Started,
    Completed,
    Failed,
    Aborted,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Aborted
        )
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskStatus::NotStarted => "not_started",
            TaskStatus::Started => "started",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Aborted => "aborted",
        };
        write!(f, "{}", s)
    }
}

/// Signals held for a task's live runner.
pub struct RunningTask {
    pub node_id: NodeId,
    /// Kill path: the runner aborts the worker run and logs an aborted
    /// EndTask.
    pub cancel: CancellationToken,
    /// Worker-loss path: the runner stops silently, logging nothing.
    pub abandon: CancellationToken,
}

/// Per-job state owned exclusively by the scheduler loop.
pub struct JobState {
    pub job_id: JobId,
    pub definition: JobDefinition,
    pub saga: Arc<Saga>,
    /// Admission order; ties on priority break toward older jobs.
    pub admission_seq: u64,
    pub aborting: bool,
    statuses: HashMap<String, TaskStatus>,
    running: HashMap<String, RunningTask>,
}

impl JobState {
    pub fn new(
        job_id: JobId,
        definition: JobDefinition,
        saga: Arc<Saga>,
        admission_seq: u64,
    ) -> Self {
        let statuses = definition
            .tasks
            .iter()
            .map(|t| (t.task_id.clone(), TaskStatus::NotStarted))
            .collect();
        Self {
            job_id,
            definition,
            saga,
            admission_seq,
            aborting: false,
            statuses,
            running: HashMap::new(),
        }
    }

    pub fn status(&self, task_id: &str) -> Option<TaskStatus> {
        self.statuses.get(task_id).copied()
    }

    pub fn statuses(&self) -> &HashMap<String, TaskStatus> {
        &self.statuses
    }

    /// Used by recovery to seed statuses replayed from the log.
    pub fn set_status(&mut self, task_id: &str, status: TaskStatus) {
        if let Some(slot) = self.statuses.get_mut(task_id) {
            *slot = status;
        }
    }

    /// Tasks eligible for dispatch, in definition order. Aborting jobs
    /// dispatch nothing new.
    pub fn runnable_tasks(&self) -> Vec<&TaskDefinition> {
        if self.aborting {
            return Vec::new();
        }
        self.definition
            .tasks
            .iter()
            .filter(|t| self.statuses.get(&t.task_id) == Some(&TaskStatus::NotStarted))
            .collect()
    }

    pub fn mark_started(&mut self, task_id: &str, running: RunningTask) -> Result<()> {
        self.transition(task_id, TaskStatus::Started, &[TaskStatus::NotStarted])?;
        self.running.insert(task_id.to_string(), running);
        Ok(())
    }

    /// Worker-loss rollback: the task becomes runnable again.
    pub fn revert_to_not_started(&mut self, task_id: &str) -> Result<()> {
        self.transition(task_id, TaskStatus::NotStarted, &[TaskStatus::Started])?;
        self.running.remove(task_id);
        Ok(())
    }

    pub fn mark_terminal(&mut self, task_id: &str, status: TaskStatus) -> Result<()> {
        if !status.is_terminal() {
            return Err(ScootError::Internal(format!(
                "{} is not a terminal task status",
                status
            )));
        }
        // Aborted may also hit tasks that never started (kill of a queued
        // job); the other terminals require a live attempt.
        let from: &[TaskStatus] = if status == TaskStatus::Aborted {
            &[TaskStatus::Started, TaskStatus::NotStarted]
        } else {
            &[TaskStatus::Started]
        };
        self.transition(task_id, status, from)?;
        self.running.remove(task_id);
        Ok(())
    }

    fn transition(&mut self, task_id: &str, to: TaskStatus, from: &[TaskStatus]) -> Result<()> {
        let current = self.statuses.get_mut(task_id).ok_or_else(|| {
            ScootError::Internal(format!("unknown task {} in job {}", task_id, self.job_id))
        })?;
        if !from.contains(current) {
            return Err(ScootError::Internal(format!(
                "task {} cannot move {} -> {}",
                task_id, current, to
            )));
        }
        *current = to;
        Ok(())
    }

    pub fn running_task(&self, task_id: &str) -> Option<&RunningTask> {
        self.running.get(task_id)
    }

    pub fn take_running(&mut self, task_id: &str) -> Option<RunningTask> {
        self.running.remove(task_id)
    }

    pub fn running_tasks(&self) -> impl Iterator<Item = (&String, &RunningTask)> {
        self.running.iter()
    }

    pub fn has_running_tasks(&self) -> bool {
        !self.running.is_empty()
    }

    pub fn all_terminal(&self) -> bool {
        self.statuses.values().all(|s| s.is_terminal())
    }
}
