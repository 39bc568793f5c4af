//! Task Manager - concurrency-safe orchestration of the task lifecycle
//!
//! Features:
//! - Atomic create/claim/finish/abort operations
//! - At most one active task per non-empty code
//! - Fire-and-forget worker launching
//! - Read-only status lookups for polling callers
//!
//! Every mutating operation runs its whole check-then-act sequence inside
//! the store's advisory lock (bounded wait, then LockTimeout). That
//! atomicity is the sole guarantee preventing two workers from claiming
//! the same row and two starts from racing on the same code.

use crate::launcher::WorkerLauncher;
use crate::registry::HandlerRegistry;
use crate::task::Task;
use chrono::{DateTime, Utc};
use conveyor_foundation::{Error, QueueConfig, Result, TaskRecord, TaskState, TaskStore};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info};

/// Configuration for the task manager
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Advisory lock timeout for mutating operations
    pub lock_timeout: Duration,

    /// Worker command override: program followed by leading arguments.
    /// Defaults to re-invoking the current executable in worker mode.
    pub worker_command: Option<Vec<String>>,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            lock_timeout: Duration::from_secs(15),
            worker_command: None,
        }
    }
}

impl From<&QueueConfig> for ManagerConfig {
    fn from(config: &QueueConfig) -> Self {
        Self {
            lock_timeout: config.lock_timeout(),
            worker_command: config.worker_command.clone(),
        }
    }
}

/// Task Manager - the single coordinator for all lifecycle mutations.
///
/// Construct one instance per process and share it by reference; all
/// cross-process coordination happens through the shared store.
pub struct Manager {
    store: Arc<TaskStore>,
    registry: Arc<HandlerRegistry>,
    launcher: WorkerLauncher,
    config: ManagerConfig,
}

impl Manager {
    /// Create a new manager
    pub fn new(
        store: Arc<TaskStore>,
        registry: Arc<HandlerRegistry>,
        config: ManagerConfig,
    ) -> Result<Self> {
        let launcher = match &config.worker_command {
            Some(command) => WorkerLauncher::from_command(command.clone())?,
            None => WorkerLauncher::from_current_exe()?,
        };

        Ok(Self {
            store,
            registry,
            launcher,
            config,
        })
    }

    /// Get the underlying store
    pub fn store(&self) -> Arc<TaskStore> {
        Arc::clone(&self.store)
    }

    /// Get the handler registry
    pub fn registry(&self) -> Arc<HandlerRegistry> {
        Arc::clone(&self.registry)
    }

    // ========================================================================
    // Enqueueing
    // ========================================================================

    /// Create a new PENDING task.
    ///
    /// With a non-empty `code`, fails with [`Error::AlreadyRunning`]
    /// (carrying the conflicting record) if a non-final task for that code
    /// exists. An empty code skips the uniqueness check.
    pub async fn start(&self, type_name: &str, input: Value, code: &str) -> Result<Task> {
        self.registry.resolve(type_name)?;

        let record = self.store.locked(self.config.lock_timeout, |conn| {
            if !code.is_empty() {
                if let Some(existing) = TaskStore::fetch_active_by_code(conn, code)? {
                    return Err(Error::already_running(existing));
                }
            }

            TaskStore::create(conn, type_name, &input, code)
        })?;

        info!("Started task {} ({})", record.id, type_name);

        let task = self.materialize(record)?;
        task.notify_state_changed(None);
        Ok(task)
    }

    /// Unconditionally supersede any active task for `code` and create a
    /// new PENDING one.
    ///
    /// The superseded task is force-terminated with a direct state flip -
    /// its state-change hook is deliberately not invoked.
    pub async fn restart(&self, code: &str, type_name: &str, input: Value) -> Result<Task> {
        if code.is_empty() {
            return Err(Error::Validation("Task code is required".to_string()));
        }
        self.registry.resolve(type_name)?;

        let (superseded, record) = self.store.locked(self.config.lock_timeout, |conn| {
            let superseded = match TaskStore::fetch_active_by_code(conn, code)? {
                Some(mut active) => {
                    active.state = TaskState::Terminated;
                    TaskStore::persist(conn, &mut active, true)?;
                    Some(active.id)
                }
                None => None,
            };

            let record = TaskStore::create(conn, type_name, &input, code)?;
            Ok((superseded, record))
        })?;

        if let Some(old_id) = superseded {
            info!("Task {} superseded by restart of code '{}'", old_id, code);
        }
        info!("Restarted code '{}' as task {}", code, record.id);

        let task = self.materialize(record)?;
        task.notify_state_changed(None);
        Ok(task)
    }

    // ========================================================================
    // Claim / finish
    // ========================================================================

    /// Atomically claim one PENDING task - the given id, or any eligible
    /// row - and flip it to PROCESSING. Returns `None` when no eligible
    /// row exists. Claim order among multiple eligible rows is
    /// unspecified.
    pub async fn begin_processing(&self, target: Option<i64>) -> Result<Option<Task>> {
        let claimed = self.store.locked(self.config.lock_timeout, |conn| {
            let Some(mut record) = TaskStore::fetch_pending(conn, target)? else {
                return Ok(None);
            };
            // Resolve before the flip so an unknown type never leaves a
            // half-claimed row behind
            self.registry.resolve(&record.type_name)?;

            record.state = TaskState::Processing;
            TaskStore::persist(conn, &mut record, true)?;
            Ok(Some(record))
        })?;

        let Some(record) = claimed else {
            return Ok(None);
        };

        debug!("Claimed task {}", record.id);

        let task = self.materialize(record)?;
        task.notify_state_changed(Some(TaskState::Pending));
        Ok(Some(task))
    }

    /// Request termination. No-op if the task is already final; otherwise
    /// flips it to TERMINATED. A running handler keeps executing until it
    /// observes the state through refresh (cancellation is cooperative).
    pub async fn abort_processing(&self, task_id: i64) -> Result<Task> {
        let (record, previous) = self.store.locked(self.config.lock_timeout, |conn| {
            let Some(mut record) = TaskStore::fetch_by_id(conn, task_id)? else {
                return Err(Error::NotFound(format!("Task {} not found", task_id)));
            };
            self.registry.resolve(&record.type_name)?;

            if record.state.is_final() {
                return Ok((record, None));
            }

            let previous = record.state;
            record.state = TaskState::Terminated;
            TaskStore::persist(conn, &mut record, true)?;
            Ok((record, Some(previous)))
        })?;

        if previous.is_some() {
            info!("Aborted task {}", task_id);
        }

        let task = self.materialize(record)?;
        if let Some(previous) = previous {
            task.notify_state_changed(Some(previous));
        }
        Ok(task)
    }

    /// Record the outcome of a processing run.
    ///
    /// No-op if the task was TERMINATED in the meantime. Fails with
    /// [`Error::DoubleCompletion`] if it already reached another final
    /// state. Otherwise flips to SUCCEEDED (progress forced to 1.0) when
    /// `fail` is `None`, FAILED otherwise.
    pub async fn end_processing(&self, task_id: i64, fail: Option<Error>) -> Result<Task> {
        let (record, previous) = self.store.locked(self.config.lock_timeout, |conn| {
            let Some(mut record) = TaskStore::fetch_by_id(conn, task_id)? else {
                return Err(Error::NotFound(format!("Task {} not found", task_id)));
            };
            self.registry.resolve(&record.type_name)?;

            if record.state == TaskState::Terminated {
                return Ok((record, None));
            }

            if record.state.is_final() {
                return Err(Error::DoubleCompletion(task_id));
            }

            if let Some(e) = &fail {
                error!("Task {} execution interrupted by error: {}", task_id, e);
            }

            let previous = record.state;
            if fail.is_none() {
                record.state = TaskState::Succeeded;
                record.progress = 1.0;
            } else {
                record.state = TaskState::Failed;
            }

            TaskStore::persist(conn, &mut record, true)?;
            Ok((record, Some(previous)))
        })?;

        if previous.is_some() {
            info!("Task {} finished as {}", task_id, record.state);
        }

        let task = self.materialize(record)?;
        if let Some(previous) = previous {
            task.notify_state_changed(Some(previous));
        }
        Ok(task)
    }

    // ========================================================================
    // Worker launching
    // ========================================================================

    /// Spawn a detached worker process scoped to `task_id`.
    ///
    /// Fire-and-forget: returns as soon as the spawn is issued; the
    /// worker's exit status is never observed through this call.
    pub async fn force_launch(&self, task_id: i64) -> Result<()> {
        self.launcher.spawn(task_id)
    }

    // ========================================================================
    // Read-only lookups (unlocked)
    // ========================================================================

    /// Get a task by id
    pub async fn get_by_id(&self, task_id: i64) -> Result<Option<Task>> {
        match self.store.get(task_id)? {
            Some(record) => Ok(Some(self.materialize(record)?)),
            None => Ok(None),
        }
    }

    /// Get the most recent task for a code (any state)
    pub async fn get_by_code(&self, code: &str) -> Result<Option<Task>> {
        match self.store.get_by_code(code)? {
            Some(record) => Ok(Some(self.materialize(record)?)),
            None => Ok(None),
        }
    }

    /// Get recent tasks for a code, most recent first.
    ///
    /// With a cutoff, tasks whose last activity predates it are excluded -
    /// except a currently active one. `limit` of 0 means unlimited.
    pub async fn get_last(
        &self,
        code: &str,
        since: Option<DateTime<Utc>>,
        limit: usize,
    ) -> Result<Vec<Task>> {
        self.store
            .get_last(code, since, limit)?
            .into_iter()
            .map(|record| self.materialize(record))
            .collect()
    }

    fn materialize(&self, record: TaskRecord) -> Result<Task> {
        Task::from_record(record, Arc::clone(&self.store), &self.registry)
    }
}
