//! Reference task handlers
//!
//! Concrete payloads (report generation, exports, recalculation) live in
//! the embedding application; these handlers exist so the queue can be
//! exercised end to end from the CLI.

use async_trait::async_trait;
use conveyor_task::{HandlerRegistry, Result, Task, TaskHandler};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Copies the input payload to the output and succeeds
pub struct EchoHandler;

#[async_trait]
impl TaskHandler for EchoHandler {
    async fn execute(&self, task: &mut Task) -> Result<()> {
        let input = task.input().clone();
        task.set_output(input);
        task.save()
    }
}

/// Sleeps through its configured duration in steps, reporting progress
/// and honoring cooperative cancellation at every step.
///
/// Input: `{"seconds": <f64, default 10>, "steps": <u64, default 10>}`
pub struct SleepHandler;

#[async_trait]
impl TaskHandler for SleepHandler {
    async fn execute(&self, task: &mut Task) -> Result<()> {
        let seconds = task.input()["seconds"].as_f64().unwrap_or(10.0);
        let steps = task.input()["steps"].as_u64().unwrap_or(10).max(1);
        let step_duration = Duration::from_secs_f64(seconds / steps as f64);

        for step in 1..=steps {
            tokio::time::sleep(step_duration).await;

            task.refresh()?;
            if task.is_terminated() {
                info!("Task {} terminated externally, stopping", task.id());
                return Ok(());
            }

            task.set_progress(step as f64 / steps as f64);
            task.save()?;
        }

        task.set_output(json!({ "sleptSeconds": seconds }));
        task.save()
    }
}

/// Register the built-in handlers
pub fn register_builtin(registry: &HandlerRegistry) {
    registry.register("echo", Arc::new(EchoHandler));
    registry.register("sleep", Arc::new(SleepHandler));
}

#[cfg(test)]
mod tests {
    use super::*;
    use conveyor_task::{Manager, ManagerConfig, TaskState, TaskStore, Worker};

    fn cli_manager() -> Arc<Manager> {
        let store = Arc::new(TaskStore::in_memory().expect("Failed to create store"));
        let registry = Arc::new(HandlerRegistry::new());
        register_builtin(&registry);

        Arc::new(
            Manager::new(store, registry, ManagerConfig::default())
                .expect("Failed to create manager"),
        )
    }

    #[tokio::test]
    async fn test_echo_round_trip() {
        let manager = cli_manager();
        let task = manager
            .start("echo", json!({"report": "monthly"}), "")
            .await
            .unwrap();

        Worker::new(Arc::clone(&manager), Some(task.id()))
            .run()
            .await
            .unwrap();

        let task = manager.get_by_id(task.id()).await.unwrap().unwrap();
        assert_eq!(task.state(), TaskState::Succeeded);
        assert_eq!(task.output(), &json!({"report": "monthly"}));
    }

    #[tokio::test]
    async fn test_sleep_reports_progress() {
        let manager = cli_manager();
        let task = manager
            .start("sleep", json!({"seconds": 0.02, "steps": 4}), "")
            .await
            .unwrap();

        Worker::new(Arc::clone(&manager), Some(task.id()))
            .run()
            .await
            .unwrap();

        let task = manager.get_by_id(task.id()).await.unwrap().unwrap();
        assert_eq!(task.state(), TaskState::Succeeded);
        assert_eq!(task.progress(), 1.0);
        assert_eq!(task.output(), &json!({"sleptSeconds": 0.02}));
    }
}
