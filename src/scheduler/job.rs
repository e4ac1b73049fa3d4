use std::collections::{HashMap, HashSet};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, ScootError};

/// Timeouts above this are treated as garbage input at admission.
const MAX_TIMEOUT_MS: u64 = 24 * 60 * 60 * 1000;

/// Job priority. `P0` is the most urgent; the derived ordering puts it
/// first so dispatch can sort ascending.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum Priority {
    P0,
    P1,
    P2,
    P3,
}

impl Default for Priority {
    fn default() -> Self {
        Priority::P2
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Priority::P0 => write!(f, "P0"),
            Priority::P1 => write!(f, "P1"),
            Priority::P2 => write!(f, "P2"),
            Priority::P3 => write!(f, "P3"),
        }
    }
}

/// The command one task executes on a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandSpec {
    pub argv: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Zero or absent means the scheduler default applies.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    /// Opaque content handle for the input file tree; resolved at the
    /// worker.
    pub snapshot_id: String,
    /// Pass-through remote-execution request, untouched by the core.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execute_request: Option<serde_json::Value>,
}

impl CommandSpec {
    pub fn new(argv: Vec<String>, snapshot_id: impl Into<String>) -> Self {
        Self {
            argv,
            env: HashMap::new(),
            timeout_ms: None,
            snapshot_id: snapshot_id.into(),
            execute_request: None,
        }
    }

    /// Effective timeout, `None` when the scheduler default applies.
    pub fn timeout(&self) -> Option<Duration> {
        match self.timeout_ms {
            None | Some(0) => None,
            Some(ms) => Some(Duration::from_millis(ms)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskDefinition {
    pub task_id: String,
    pub command: CommandSpec,
}

/// A client-submitted job: an ordered list of independent tasks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobDefinition {
    #[serde(default)]
    pub priority: Priority,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub basis: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requestor: Option<String>,
    pub tasks: Vec<TaskDefinition>,
}

impl JobDefinition {
    /// Admission gate. Rejected jobs never reach the saga log.
    pub fn validate(&self) -> Result<()> {
        if self.tasks.is_empty() {
            return Err(ScootError::InvalidJob("job has no tasks".to_string()));
        }
        let mut seen = HashSet::new();
        for task in &self.tasks {
            if task.task_id.is_empty() {
                return Err(ScootError::InvalidJob("empty task id".to_string()));
            }
            if !seen.insert(task.task_id.as_str()) {
                return Err(ScootError::InvalidJob(format!(
                    "duplicate task id {}",
                    task.task_id
                )));
            }
            if task.command.argv.is_empty() {
                return Err(ScootError::InvalidJob(format!(
                    "task {} has empty argv",
                    task.task_id
                )));
            }
            if task.command.snapshot_id.is_empty() {
                return Err(ScootError::InvalidJob(format!(
                    "task {} has no snapshot id",
                    task.task_id
                )));
            }
            if let Some(ms) = task.command.timeout_ms {
                if ms > MAX_TIMEOUT_MS {
                    return Err(ScootError::InvalidJob(format!(
                        "task {} timeout {}ms exceeds maximum",
                        task.task_id, ms
                    )));
                }
            }
        }
        Ok(())
    }
}
