use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use crate::error::{Result, ScootError};
use crate::saga::log::SagaLog;
use crate::saga::message::{JobId, MessageKind, SagaMessage};

/// In-memory projection of one job's saga, backed by a durable log.
///
/// Every mutating call validates the message against the current
/// projection, appends it to the log, and only then updates the cache, so
/// the cache and the log advance together or not at all.
pub struct Saga {
    job_id: JobId,
    log: Arc<dyn SagaLog>,
    state: Mutex<SagaState>,
}

#[derive(Debug, Default)]
struct SagaState {
    job_blob: Vec<u8>,
    /// Tasks with a StartTask and no EndTask yet.
    running: HashSet<String>,
    /// Tasks with an EndTask, mapped to the recorded result payload.
    completed: HashMap<String, Vec<u8>>,
    /// Every task that ever logged a StartTask.
    started: HashSet<String>,
    comp_running: HashSet<String>,
    comp_completed: HashSet<String>,
    aborted: bool,
    ended: bool,
}

impl SagaState {
    /// Check a message against the saga ordering rules without applying it.
    fn validate(&self, msg: &SagaMessage) -> Result<()> {
        if self.ended {
            return Err(ScootError::InvalidTransition(format!(
                "{} after end_saga",
                msg.kind
            )));
        }
        let task_id = msg.task_id.as_deref();
        match msg.kind {
            MessageKind::StartSaga => Err(ScootError::InvalidTransition(
                "duplicate start_saga".to_string(),
            )),
            MessageKind::EndSaga => Ok(()),
            MessageKind::AbortSaga => {
                if self.aborted {
                    Err(ScootError::InvalidTransition(
                        "duplicate abort_saga".to_string(),
                    ))
                } else {
                    Ok(())
                }
            }
            MessageKind::StartTask => {
                let task = require_task(task_id, msg.kind)?;
                if self.aborted {
                    return Err(ScootError::InvalidTransition(format!(
                        "start_task {} after abort_saga",
                        task
                    )));
                }
                if self.completed.contains_key(task) {
                    return Err(ScootError::InvalidTransition(format!(
                        "start_task {} after end_task",
                        task
                    )));
                }
                Ok(())
            }
            MessageKind::EndTask => {
                let task = require_task(task_id, msg.kind)?;
                if !self.running.contains(task) {
                    return Err(ScootError::InvalidTransition(format!(
                        "end_task {} without open start_task",
                        task
                    )));
                }
                Ok(())
            }
            MessageKind::StartCompTask => {
                let task = require_task(task_id, msg.kind)?;
                if !self.aborted {
                    return Err(ScootError::InvalidTransition(format!(
                        "start_comp_task {} before abort_saga",
                        task
                    )));
                }
                if !self.started.contains(task) {
                    return Err(ScootError::InvalidTransition(format!(
                        "start_comp_task {} for never-started task",
                        task
                    )));
                }
                if self.comp_completed.contains(task) {
                    return Err(ScootError::InvalidTransition(format!(
                        "start_comp_task {} after end_comp_task",
                        task
                    )));
                }
                Ok(())
            }
            MessageKind::EndCompTask => {
                let task = require_task(task_id, msg.kind)?;
                if !self.comp_running.contains(task) {
                    return Err(ScootError::InvalidTransition(format!(
                        "end_comp_task {} without open start_comp_task",
                        task
                    )));
                }
                Ok(())
            }
        }
    }

    fn apply(&mut self, msg: &SagaMessage) {
        let task_id = msg.task_id.clone();
        match msg.kind {
            MessageKind::StartSaga => {
                self.job_blob = msg.data.clone();
            }
            MessageKind::EndSaga => {
                self.ended = true;
            }
            MessageKind::AbortSaga => {
                self.aborted = true;
            }
            MessageKind::StartTask => {
                let task = task_id.unwrap();
                self.started.insert(task.clone());
                self.running.insert(task);
            }
            MessageKind::EndTask => {
                let task = task_id.unwrap();
                self.running.remove(&task);
                self.completed.insert(task, msg.data.clone());
            }
            MessageKind::StartCompTask => {
                self.comp_running.insert(task_id.unwrap());
            }
            MessageKind::EndCompTask => {
                let task = task_id.unwrap();
                self.comp_running.remove(&task);
                self.comp_completed.insert(task);
            }
        }
    }
}

fn require_task(task_id: Option<&str>, kind: MessageKind) -> Result<&str> {
    task_id.ok_or_else(|| ScootError::InvalidTransition(format!("{} without task id", kind)))
}

impl Saga {
    /// Start a new saga: writes StartSaga to the log and returns the live
    /// projection.
    pub fn create(log: Arc<dyn SagaLog>, job_id: JobId, job_blob: Vec<u8>) -> Result<Self> {
        log.start_saga(job_id, &job_blob)?;
        let state = SagaState {
            job_blob,
            ..Default::default()
        };
        Ok(Self {
            job_id,
            log,
            state: Mutex::new(state),
        })
    }

    /// Rebuild a saga from its logged messages, applying the same
    /// validation as live appends. A validation failure here means the log
    /// is corrupt.
    pub fn rehydrate(
        log: Arc<dyn SagaLog>,
        job_id: JobId,
        messages: &[SagaMessage],
    ) -> Result<Self> {
        let mut state = SagaState::default();
        let mut iter = messages.iter();
        match iter.next() {
            Some(first) if first.kind == MessageKind::StartSaga => state.apply(first),
            _ => {
                return Err(ScootError::Corrupt(format!(
                    "saga {} does not begin with start_saga",
                    job_id
                )))
            }
        }
        for msg in iter {
            state
                .validate(msg)
                .map_err(|e| ScootError::Corrupt(format!("saga {} replay: {}", job_id, e)))?;
            state.apply(msg);
        }
        Ok(Self {
            job_id,
            log,
            state: Mutex::new(state),
        })
    }

    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    pub fn job_blob(&self) -> Vec<u8> {
        self.state.lock().unwrap().job_blob.clone()
    }

    /// Validate, append to the log, then update the projection.
    fn log_and_apply(&self, msg: SagaMessage) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.validate(&msg)?;
        self.log.log_message(&msg)?;
        state.apply(&msg);
        Ok(())
    }

    pub fn start_task(&self, task_id: &str, data: Vec<u8>) -> Result<()> {
        self.log_and_apply(SagaMessage::start_task(self.job_id, task_id, data))
    }

    pub fn end_task(&self, task_id: &str, result: Vec<u8>) -> Result<()> {
        self.log_and_apply(SagaMessage::end_task(self.job_id, task_id, result))
    }

    pub fn abort_saga(&self) -> Result<()> {
        self.log_and_apply(SagaMessage::abort_saga(self.job_id))
    }

    pub fn start_comp_task(&self, task_id: &str, data: Vec<u8>) -> Result<()> {
        self.log_and_apply(SagaMessage::start_comp_task(self.job_id, task_id, data))
    }

    pub fn end_comp_task(&self, task_id: &str, result: Vec<u8>) -> Result<()> {
        self.log_and_apply(SagaMessage::end_comp_task(self.job_id, task_id, result))
    }

    pub fn end_saga(&self) -> Result<()> {
        self.log_and_apply(SagaMessage::end_saga(self.job_id))
    }

    pub fn is_completed(&self) -> bool {
        self.state.lock().unwrap().ended
    }

    pub fn is_aborted(&self) -> bool {
        self.state.lock().unwrap().aborted
    }

    pub fn is_task_started(&self, task_id: &str) -> bool {
        self.state.lock().unwrap().started.contains(task_id)
    }

    pub fn is_task_completed(&self, task_id: &str) -> bool {
        self.state.lock().unwrap().completed.contains_key(task_id)
    }

    /// Result payload recorded with a task's EndTask, if any.
    pub fn task_result(&self, task_id: &str) -> Option<Vec<u8>> {
        self.state.lock().unwrap().completed.get(task_id).cloned()
    }

    pub fn is_comp_task_started(&self, task_id: &str) -> bool {
        let state = self.state.lock().unwrap();
        state.comp_running.contains(task_id) || state.comp_completed.contains(task_id)
    }

    pub fn is_comp_task_completed(&self, task_id: &str) -> bool {
        self.state.lock().unwrap().comp_completed.contains(task_id)
    }

    /// Tasks with an open StartTask.
    pub fn running_tasks(&self) -> Vec<String> {
        let mut tasks: Vec<String> = self
            .state
            .lock()
            .unwrap()
            .running
            .iter()
            .cloned()
            .collect();
        tasks.sort();
        tasks
    }

    /// Tasks with an EndTask.
    pub fn completed_tasks(&self) -> Vec<String> {
        let mut tasks: Vec<String> = self
            .state
            .lock()
            .unwrap()
            .completed
            .keys()
            .cloned()
            .collect();
        tasks.sort();
        tasks
    }
}
