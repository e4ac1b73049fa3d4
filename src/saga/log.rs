use std::collections::HashMap;
use std::sync::Mutex;

use crate::error::{Result, ScootError};
use crate::saga::message::{JobId, MessageKind, SagaMessage};

/// Durable keyed append-only store: one ordered message sequence per job.
///
/// Implementations serialize writes to the same job id; writes to different
/// job ids may proceed concurrently. `log_message` must be atomic with
/// respect to readers: a record is fully visible or not at all.
pub trait SagaLog: Send + Sync {
    /// Create the saga and write its StartSaga record atomically.
    /// Calling again with an identical job blob is a no-op; a different
    /// blob is `AlreadyStarted`.
    fn start_saga(&self, job_id: JobId, job_blob: &[u8]) -> Result<()>;

    /// Append a message to an existing saga.
    fn log_message(&self, msg: &SagaMessage) -> Result<()>;

    /// Full message sequence for a job, in append order.
    fn messages(&self, job_id: JobId) -> Result<Vec<SagaMessage>>;

    /// Job ids of sagas without an EndSaga record, for recovery.
    fn active_sagas(&self) -> Result<Vec<JobId>>;
}

/// Non-durable log with the same semantics as the file-backed one.
/// Backing store for tests and for running without a saga directory.
#[derive(Default)]
pub struct InMemorySagaLog {
    sagas: Mutex<HashMap<JobId, Vec<SagaMessage>>>,
}

impl InMemorySagaLog {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SagaLog for InMemorySagaLog {
    fn start_saga(&self, job_id: JobId, job_blob: &[u8]) -> Result<()> {
        let mut sagas = self.sagas.lock().unwrap();
        if let Some(msgs) = sagas.get(&job_id) {
            // Duplicate admission of the same definition is harmless.
            if msgs.first().map(|m| m.data.as_slice()) == Some(job_blob) {
                return Ok(());
            }
            return Err(ScootError::AlreadyStarted(job_id.to_string()));
        }
        sagas.insert(
            job_id,
            vec![SagaMessage::start_saga(job_id, job_blob.to_vec())],
        );
        Ok(())
    }

    fn log_message(&self, msg: &SagaMessage) -> Result<()> {
        let mut sagas = self.sagas.lock().unwrap();
        match sagas.get_mut(&msg.job_id) {
            Some(msgs) => {
                msgs.push(msg.clone());
                Ok(())
            }
            None => Err(ScootError::SagaNotStarted(msg.job_id.to_string())),
        }
    }

    fn messages(&self, job_id: JobId) -> Result<Vec<SagaMessage>> {
        let sagas = self.sagas.lock().unwrap();
        sagas
            .get(&job_id)
            .cloned()
            .ok_or_else(|| ScootError::JobNotFound(job_id.to_string()))
    }

    fn active_sagas(&self) -> Result<Vec<JobId>> {
        let sagas = self.sagas.lock().unwrap();
        Ok(sagas
            .iter()
            .filter(|(_, msgs)| !msgs.iter().any(|m| m.kind == MessageKind::EndSaga))
            .map(|(id, _)| *id)
            .collect())
    }
}
