//! Error types for Conveyor
//!
//! One central enum for the whole workspace; callers match on the
//! variants that matter to them and render the rest via Display.

use crate::storage::TaskRecord;
use thiserror::Error;

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Conveyor error type
#[derive(Error, Debug)]
pub enum Error {
    // ========================================================================
    // Configuration
    // ========================================================================
    #[error("Configuration error: {0}")]
    Config(String),

    // ========================================================================
    // Task lifecycle
    // ========================================================================
    /// Bad caller input, e.g. an empty code where one is required
    #[error("Validation error: {0}")]
    Validation(String),

    /// A non-final task with the same code already exists; carries the
    /// conflicting record so callers can render "already running" instead
    /// of a hard failure
    #[error("Task {} is already running", .task.id)]
    AlreadyRunning { task: Box<TaskRecord> },

    #[error("Not found: {0}")]
    NotFound(String),

    /// Ending a task that already reached SUCCEEDED or FAILED
    #[error("Task {0} has already completed")]
    DoubleCompletion(i64),

    /// The advisory lock could not be acquired within its timeout
    #[error("Lock timeout: {0}")]
    LockTimeout(String),

    /// The task type identifier is not registered
    #[error("Unknown task type: {0}")]
    TypeResolution(String),

    /// A failure raised by a task handler's execute()
    #[error("Task execution failed: {0}")]
    Execution(String),

    // ========================================================================
    // Storage
    // ========================================================================
    #[error("Storage error: {0}")]
    Storage(String),

    // ========================================================================
    // External conversions
    // ========================================================================
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    // ========================================================================
    // Other
    // ========================================================================
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Errors a controller layer may surface to end users verbatim
    pub fn is_user_facing(&self) -> bool {
        matches!(
            self,
            Error::Validation(_)
                | Error::AlreadyRunning { .. }
                | Error::NotFound(_)
                | Error::DoubleCompletion(_)
        )
    }

    /// AlreadyRunning constructor helper
    pub fn already_running(task: TaskRecord) -> Self {
        Error::AlreadyRunning {
            task: Box::new(task),
        }
    }

    /// The conflicting task, if this is an AlreadyRunning error
    pub fn conflicting_task(&self) -> Option<&TaskRecord> {
        match self {
            Error::AlreadyRunning { task } => Some(task),
            _ => None,
        }
    }
}

// ============================================================================
// From implementations
// ============================================================================

impl From<String> for Error {
    fn from(s: String) -> Self {
        Error::Internal(s)
    }
}

impl From<&str> for Error {
    fn from(s: &str) -> Self {
        Error::Internal(s.to_string())
    }
}
