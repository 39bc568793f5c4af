//! # conveyor-foundation
//!
//! Foundation layer for Conveyor:
//! - Error: central error taxonomy for the whole workspace
//! - State: the five-state task lifecycle enum
//! - Storage: SQLite task table (schema, advisory lock, record CRUD)
//! - Config: queue configuration (QueueConfig)

pub mod config;
pub mod error;
pub mod state;
pub mod storage;

// ============================================================================
// Error
// ============================================================================
pub use error::{Error, Result};

// ============================================================================
// State
// ============================================================================
pub use state::TaskState;

// ============================================================================
// Config
// ============================================================================
pub use config::{QueueConfig, QUEUE_CONFIG_FILE};

// ============================================================================
// Storage
// ============================================================================
pub use storage::{TaskRecord, TaskStore, DB_FILE};
