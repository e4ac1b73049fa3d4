use thiserror::Error;

#[derive(Error, Debug)]
pub enum ScootError {
    #[error("Invalid job: {0}")]
    InvalidJob(String),

    #[error("Saga not started: {0}")]
    SagaNotStarted(String),

    #[error("Saga already started: {0}")]
    AlreadyStarted(String),

    #[error("Invalid saga transition: {0}")]
    InvalidTransition(String),

    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error("Job already terminal: {0}")]
    AlreadyTerminal(String),

    #[error("Run not found: {0}")]
    RunNotFound(String),

    #[error("Worker queue full, active argv {active_argv:?}")]
    QueueFull { active_argv: Vec<String> },

    #[error("Worker unreachable: {0}")]
    WorkerUnreachable(String),

    #[error("Worker lost")]
    WorkerLost,

    #[error("Saga log corrupt: {0}")]
    Corrupt(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ScootError {
    /// Transient errors are worth retrying; everything else surfaces.
    pub fn is_transient(&self) -> bool {
        matches!(self, ScootError::WorkerUnreachable(_))
    }
}

pub type Result<T> = std::result::Result<T, ScootError>;
