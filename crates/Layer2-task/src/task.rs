//! Task definition and the handler execution contract

use crate::registry::HandlerRegistry;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use conveyor_foundation::{Error, Result, TaskRecord, TaskState, TaskStore};
use serde_json::Value;
use std::sync::Arc;

/// Execution contract for concrete task types.
///
/// Implementations perform the actual work and may call [`Task::save`]
/// repeatedly mid-run to report progress or partial output. Long-running
/// implementations should call [`Task::refresh`] at safe points and return
/// early once they observe a terminated task (cancellation is cooperative;
/// nothing preempts a running handler).
#[async_trait]
pub trait TaskHandler: Send + Sync {
    /// Perform the work for one task
    async fn execute(&self, task: &mut Task) -> Result<()>;

    /// Invoked after a state change has been persisted. Default no-op;
    /// override to react to transitions (e.g. external termination).
    fn on_state_changed(
        &self,
        _task: &Task,
        _previous: Option<TaskState>,
        _current: TaskState,
    ) {
    }
}

/// One persisted unit of background work, paired with its store handle and
/// the handler resolved from its type identifier
pub struct Task {
    record: TaskRecord,
    /// State as last persisted; save() fires the hook when it changes
    persisted_state: TaskState,
    /// Set when the caller assigned last_activity_datetime explicitly
    /// since the last persist
    activity_overridden: bool,
    store: Arc<TaskStore>,
    handler: Arc<dyn TaskHandler>,
}

impl Task {
    /// Materialize a task from a stored record, resolving its handler.
    /// Fails with [`Error::TypeResolution`] for unregistered types.
    pub fn from_record(
        record: TaskRecord,
        store: Arc<TaskStore>,
        registry: &HandlerRegistry,
    ) -> Result<Self> {
        let handler = registry.resolve(&record.type_name)?;

        Ok(Self {
            persisted_state: record.state,
            activity_overridden: false,
            record,
            store,
            handler,
        })
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    pub fn id(&self) -> i64 {
        self.record.id
    }

    pub fn code(&self) -> &str {
        &self.record.code
    }

    pub fn type_name(&self) -> &str {
        &self.record.type_name
    }

    pub fn state(&self) -> TaskState {
        self.record.state
    }

    pub fn set_state(&mut self, state: TaskState) {
        self.record.state = state;
    }

    /// The cancellation check for cooperative handlers
    pub fn is_terminated(&self) -> bool {
        self.record.state == TaskState::Terminated
    }

    pub fn input(&self) -> &Value {
        &self.record.input
    }

    pub fn set_input(&mut self, input: Value) {
        self.record.input = input;
    }

    pub fn output(&self) -> &Value {
        &self.record.output
    }

    pub fn set_output(&mut self, output: Value) {
        self.record.output = output;
    }

    pub fn progress(&self) -> f64 {
        self.record.progress
    }

    /// Set completion level; values are clamped to [0, 1]
    pub fn set_progress(&mut self, progress: f64) {
        self.record.progress = progress.clamp(0.0, 1.0);
    }

    pub fn initializing_datetime(&self) -> DateTime<Utc> {
        self.record.initializing_datetime
    }

    pub fn last_activity_datetime(&self) -> DateTime<Utc> {
        self.record.last_activity_datetime
    }

    /// Explicitly assign the activity timestamp; suppresses the automatic
    /// touch on the next save
    pub fn set_last_activity_datetime(&mut self, datetime: DateTime<Utc>) {
        self.record.last_activity_datetime = datetime;
        self.activity_overridden = true;
    }

    /// The underlying persisted record
    pub fn record(&self) -> &TaskRecord {
        &self.record
    }

    // ========================================================================
    // Persistence
    // ========================================================================

    /// Persist the in-memory record.
    ///
    /// The activity timestamp is auto-touched unless it was explicitly set
    /// since the last persist. The stored state is only written when the
    /// in-memory state actually changed, so a progress save never
    /// overwrites a concurrent external termination. When the persisted
    /// state changes, the handler's state-change hook is invoked. A
    /// storage failure leaves the in-memory mutation uncommitted.
    pub fn save(&mut self) -> Result<()> {
        let touch = !self.activity_overridden;
        let state_changed = self.persisted_state != self.record.state;

        if state_changed {
            self.store.save(&mut self.record, touch)?;
        } else {
            self.store.save_data(&mut self.record, touch)?;
        }
        self.activity_overridden = false;

        if state_changed {
            let previous = self.persisted_state;
            self.persisted_state = self.record.state;
            let handler = Arc::clone(&self.handler);
            handler.on_state_changed(self, Some(previous), self.record.state);
        }

        Ok(())
    }

    /// Discard all in-memory fields except the id and reload from storage.
    ///
    /// This is how a long-running handler detects an externally requested
    /// termination without losing its identity.
    pub fn refresh(&mut self) -> Result<()> {
        let record = self
            .store
            .get(self.record.id)?
            .ok_or_else(|| Error::NotFound(format!("Task {} not found", self.record.id)))?;

        self.record = record;
        self.persisted_state = self.record.state;
        self.activity_overridden = false;

        Ok(())
    }

    // ========================================================================
    // Execution
    // ========================================================================

    /// Run the resolved handler against this task. Handler failures are
    /// wrapped as [`Error::Execution`].
    pub async fn execute(&mut self) -> Result<()> {
        let handler = Arc::clone(&self.handler);

        handler.execute(self).await.map_err(|e| match e {
            Error::Execution(_) => e,
            other => Error::Execution(other.to_string()),
        })
    }

    /// Fire the state-change hook for a transition the Manager persisted
    /// on our behalf
    pub(crate) fn notify_state_changed(&self, previous: Option<TaskState>) {
        let handler = Arc::clone(&self.handler);
        handler.on_state_changed(self, previous, self.record.state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex;
    use std::time::Duration;

    struct NoopHandler;

    #[async_trait]
    impl TaskHandler for NoopHandler {
        async fn execute(&self, _task: &mut Task) -> Result<()> {
            Ok(())
        }
    }

    struct RecordingHandler {
        transitions: Mutex<Vec<(Option<TaskState>, TaskState)>>,
    }

    #[async_trait]
    impl TaskHandler for RecordingHandler {
        async fn execute(&self, _task: &mut Task) -> Result<()> {
            Ok(())
        }

        fn on_state_changed(
            &self,
            _task: &Task,
            previous: Option<TaskState>,
            current: TaskState,
        ) {
            self.transitions.lock().unwrap().push((previous, current));
        }
    }

    struct FailingHandler;

    #[async_trait]
    impl TaskHandler for FailingHandler {
        async fn execute(&self, _task: &mut Task) -> Result<()> {
            Err(Error::Internal("disk full".to_string()))
        }
    }

    fn setup(handler: Arc<dyn TaskHandler>) -> (Arc<TaskStore>, HandlerRegistry, TaskRecord) {
        let store = Arc::new(TaskStore::in_memory().expect("Failed to create store"));
        let registry = HandlerRegistry::new();
        registry.register("test", handler);

        let record = store
            .locked(Duration::from_secs(5), |conn| {
                TaskStore::create(conn, "test", &json!({"n": 1}), "")
            })
            .expect("Failed to create record");

        (store, registry, record)
    }

    #[test]
    fn test_unknown_type_fails_resolution() {
        let (store, registry, mut record) = setup(Arc::new(NoopHandler));
        record.type_name = "unknown".to_string();

        let result = Task::from_record(record, store, &registry);
        assert!(matches!(result, Err(Error::TypeResolution(_))));
    }

    #[test]
    fn test_save_auto_touches_activity() {
        let (store, registry, record) = setup(Arc::new(NoopHandler));
        let mut task = Task::from_record(record, store, &registry).unwrap();
        let before = task.last_activity_datetime();

        task.set_progress(0.3);
        task.save().expect("Failed to save");

        assert!(task.last_activity_datetime() >= before);
        assert_eq!(task.progress(), 0.3);
    }

    #[test]
    fn test_save_respects_explicit_activity() {
        let (store, registry, record) = setup(Arc::new(NoopHandler));
        let mut task = Task::from_record(record, store.clone(), &registry).unwrap();

        let fixed = "2021-06-01T00:00:00Z".parse::<DateTime<Utc>>().unwrap();
        task.set_last_activity_datetime(fixed);
        task.save().expect("Failed to save");

        let stored = store.get(task.id()).unwrap().unwrap();
        assert_eq!(stored.last_activity_datetime, fixed);

        // The override is one-shot: the next save touches again
        task.set_progress(0.9);
        task.save().expect("Failed to save");
        assert!(task.last_activity_datetime() > fixed);
    }

    #[test]
    fn test_set_progress_clamps() {
        let (store, registry, record) = setup(Arc::new(NoopHandler));
        let mut task = Task::from_record(record, store, &registry).unwrap();

        task.set_progress(1.7);
        assert_eq!(task.progress(), 1.0);
        task.set_progress(-0.2);
        assert_eq!(task.progress(), 0.0);
    }

    #[test]
    fn test_save_fires_hook_on_state_change() {
        let handler = Arc::new(RecordingHandler {
            transitions: Mutex::new(Vec::new()),
        });
        let (store, registry, record) = setup(handler.clone());
        let mut task = Task::from_record(record, store, &registry).unwrap();

        // No state change - no hook
        task.set_progress(0.5);
        task.save().unwrap();
        assert!(handler.transitions.lock().unwrap().is_empty());

        task.set_state(TaskState::Processing);
        task.save().unwrap();
        task.save().unwrap(); // unchanged state - still one invocation

        let transitions = handler.transitions.lock().unwrap();
        assert_eq!(
            *transitions,
            vec![(Some(TaskState::Pending), TaskState::Processing)]
        );
    }

    #[test]
    fn test_progress_save_preserves_external_termination() {
        let (store, registry, record) = setup(Arc::new(NoopHandler));
        let mut task = Task::from_record(record.clone(), store.clone(), &registry).unwrap();

        // Abort lands while the handler still holds the old in-memory state
        let mut external = store.get(record.id).unwrap().unwrap();
        external.state = TaskState::Terminated;
        store.save(&mut external, true).unwrap();

        task.set_progress(0.4);
        task.save().expect("Failed to save");

        // The progress write went through without resurrecting the task
        let stored = store.get(record.id).unwrap().unwrap();
        assert_eq!(stored.state, TaskState::Terminated);
        assert_eq!(stored.progress, 0.4);

        task.refresh().unwrap();
        assert!(task.is_terminated());
    }

    #[test]
    fn test_refresh_observes_external_change() {
        let (store, registry, record) = setup(Arc::new(NoopHandler));
        let mut task = Task::from_record(record.clone(), store.clone(), &registry).unwrap();

        // Another party flips the stored state
        let mut external = store.get(record.id).unwrap().unwrap();
        external.state = TaskState::Terminated;
        store.save(&mut external, true).unwrap();

        assert!(!task.is_terminated());
        task.refresh().expect("Failed to refresh");
        assert!(task.is_terminated());
        assert_eq!(task.id(), record.id);
    }

    #[tokio::test]
    async fn test_execute_wraps_handler_failure() {
        let (store, registry, record) = setup(Arc::new(FailingHandler));
        let mut task = Task::from_record(record, store, &registry).unwrap();

        let result = task.execute().await;
        match result {
            Err(Error::Execution(message)) => assert!(message.contains("disk full")),
            other => panic!("Expected execution error, got {:?}", other.err()),
        }
    }
}
