use uuid::Uuid;

pub type JobId = Uuid;

/// Kinds of record a saga can carry, with their on-disk codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageKind {
    StartSaga = 0,
    EndSaga = 1,
    AbortSaga = 2,
    StartTask = 3,
    EndTask = 4,
    StartCompTask = 5,
    EndCompTask = 6,
}

impl MessageKind {
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(MessageKind::StartSaga),
            1 => Some(MessageKind::EndSaga),
            2 => Some(MessageKind::AbortSaga),
            3 => Some(MessageKind::StartTask),
            4 => Some(MessageKind::EndTask),
            5 => Some(MessageKind::StartCompTask),
            6 => Some(MessageKind::EndCompTask),
            _ => None,
        }
    }
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MessageKind::StartSaga => write!(f, "start_saga"),
            MessageKind::EndSaga => write!(f, "end_saga"),
            MessageKind::AbortSaga => write!(f, "abort_saga"),
            MessageKind::StartTask => write!(f, "start_task"),
            MessageKind::EndTask => write!(f, "end_task"),
            MessageKind::StartCompTask => write!(f, "start_comp_task"),
            MessageKind::EndCompTask => write!(f, "end_comp_task"),
        }
    }
}

/// One record in a job's saga. Task-level kinds carry a task id; start and
/// end-of-task records may carry an opaque payload (job blob, task result).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SagaMessage {
    pub job_id: JobId,
    pub kind: MessageKind,
    pub task_id: Option<String>,
    pub data: Vec<u8>,
}

impl SagaMessage {
    pub fn start_saga(job_id: JobId, job_blob: Vec<u8>) -> Self {
        Self {
            job_id,
            kind: MessageKind::StartSaga,
            task_id: None,
            data: job_blob,
        }
    }

    pub fn end_saga(job_id: JobId) -> Self {
        Self {
            job_id,
            kind: MessageKind::EndSaga,
            task_id: None,
            data: Vec::new(),
        }
    }

    pub fn abort_saga(job_id: JobId) -> Self {
        Self {
            job_id,
            kind: MessageKind::AbortSaga,
            task_id: None,
            data: Vec::new(),
        }
    }

    pub fn start_task(job_id: JobId, task_id: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            job_id,
            kind: MessageKind::StartTask,
            task_id: Some(task_id.into()),
            data,
        }
    }

    pub fn end_task(job_id: JobId, task_id: impl Into<String>, result: Vec<u8>) -> Self {
        Self {
            job_id,
            kind: MessageKind::EndTask,
            task_id: Some(task_id.into()),
            data: result,
        }
    }

    pub fn start_comp_task(job_id: JobId, task_id: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            job_id,
            kind: MessageKind::StartCompTask,
            task_id: Some(task_id.into()),
            data,
        }
    }

    pub fn end_comp_task(job_id: JobId, task_id: impl Into<String>, result: Vec<u8>) -> Self {
        Self {
            job_id,
            kind: MessageKind::EndCompTask,
            task_id: Some(task_id.into()),
            data: result,
        }
    }
}
