//! Task state machine
//!
//! PENDING -> PROCESSING -> {SUCCEEDED, FAILED, TERMINATED}, with a direct
//! PENDING -> TERMINATED edge for aborts before a claim. The final states
//! have no outgoing edges; the Manager enforces the legal transitions.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};

/// Possible states of a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    /// Task is waiting to be claimed by a worker
    Pending,

    /// Task has been claimed and is executing
    Processing,

    /// Task was aborted, or superseded by a restart
    Terminated,

    /// Task completed successfully
    Succeeded,

    /// Task failed with an error
    Failed,
}

impl TaskState {
    /// Final states - no transition leaves them
    pub const FINAL: [TaskState; 3] = [
        TaskState::Terminated,
        TaskState::Succeeded,
        TaskState::Failed,
    ];

    /// Check if this is a final state (cannot transition further)
    pub fn is_final(&self) -> bool {
        Self::FINAL.contains(self)
    }

    /// Check if task is waiting to be claimed
    pub fn is_pending(&self) -> bool {
        matches!(self, TaskState::Pending)
    }

    /// Check if task is currently being processed
    pub fn is_processing(&self) -> bool {
        matches!(self, TaskState::Processing)
    }

    /// Canonical storage string for the state
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskState::Pending => "pending",
            TaskState::Processing => "processing",
            TaskState::Terminated => "terminated",
            TaskState::Succeeded => "succeeded",
            TaskState::Failed => "failed",
        }
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for TaskState {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(TaskState::Pending),
            "processing" => Ok(TaskState::Processing),
            "terminated" => Ok(TaskState::Terminated),
            "succeeded" => Ok(TaskState::Succeeded),
            "failed" => Ok(TaskState::Failed),
            other => Err(Error::Validation(format!("Unknown task state: {}", other))),
        }
    }
}
