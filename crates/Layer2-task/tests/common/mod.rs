//! Shared fixtures for integration tests

use async_trait::async_trait;
use conveyor_task::{
    Error, HandlerRegistry, Manager, ManagerConfig, Result, Task, TaskHandler, TaskStore,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

/// Copies input to output and succeeds
pub struct EchoHandler;

#[async_trait]
impl TaskHandler for EchoHandler {
    async fn execute(&self, task: &mut Task) -> Result<()> {
        let input = task.input().clone();
        task.set_output(input);
        task.save()
    }
}

/// Always fails
pub struct FailingHandler;

#[async_trait]
impl TaskHandler for FailingHandler {
    async fn execute(&self, _task: &mut Task) -> Result<()> {
        Err(Error::Execution("synthetic failure".to_string()))
    }
}

/// Always panics
pub struct PanickingHandler;

#[async_trait]
impl TaskHandler for PanickingHandler {
    async fn execute(&self, _task: &mut Task) -> Result<()> {
        panic!("synthetic panic");
    }
}

/// Works in small steps, saving progress and checking for termination at
/// each safe point - the cooperative cancellation pattern
pub struct SteppingHandler;

#[async_trait]
impl TaskHandler for SteppingHandler {
    async fn execute(&self, task: &mut Task) -> Result<()> {
        let steps = task.input()["steps"].as_u64().unwrap_or(10);
        let delay_ms = task.input()["delayMs"].as_u64().unwrap_or(10);

        for step in 1..=steps {
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;

            task.refresh()?;
            if task.is_terminated() {
                return Ok(());
            }

            task.set_progress(step as f64 / steps as f64);
            task.save()?;
        }

        task.set_output(json!({ "steps": steps }));
        task.save()
    }
}

/// A manager over a fresh in-memory store with every test handler
/// registered
pub fn test_manager() -> Arc<Manager> {
    let store = Arc::new(TaskStore::in_memory().expect("Failed to create store"));
    let registry = Arc::new(HandlerRegistry::new());
    registry.register("echo", Arc::new(EchoHandler));
    registry.register("failing", Arc::new(FailingHandler));
    registry.register("panicking", Arc::new(PanickingHandler));
    registry.register("stepping", Arc::new(SteppingHandler));

    Arc::new(
        Manager::new(store, registry, ManagerConfig::default()).expect("Failed to create manager"),
    )
}
