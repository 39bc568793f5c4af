//! Worker - the claim/execute/report loop
//!
//! Runs inside a detached process with no imposed time limit. Per-task
//! failures (errors and panics alike) are captured and reported through
//! `end_processing`; they never stop a drain loop from continuing to
//! other pending work.

use crate::manager::Manager;
use conveyor_foundation::{Error, Result};
use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::{info, warn};

/// A processing loop bound to a target task id, or to the whole queue
/// (drain mode) when no target is given
pub struct Worker {
    manager: Arc<Manager>,
    target: Option<i64>,
}

impl Worker {
    pub fn new(manager: Arc<Manager>, target: Option<i64>) -> Self {
        Self { manager, target }
    }

    /// Claim and execute tasks until no eligible row remains.
    ///
    /// With a target id the loop ends after that one task is handled (the
    /// claimed row is no longer eligible on the next iteration). Returns
    /// the number of tasks handled; an `Err` means the loop itself failed,
    /// which is distinct from a task ending FAILED.
    pub async fn run(&self) -> Result<usize> {
        let mut handled = 0;

        while let Some(mut task) = self.manager.begin_processing(self.target).await? {
            let task_id = task.id();
            info!("Worker claimed task {} ({})", task_id, task.type_name());

            let fail = match AssertUnwindSafe(task.execute()).catch_unwind().await {
                Ok(Ok(())) => None,
                Ok(Err(e)) => {
                    warn!("Task {} failed: {}", task_id, e);
                    Some(e)
                }
                Err(panic) => {
                    let message = panic_message(panic.as_ref());
                    warn!("Task {} panicked: {}", task_id, message);
                    Some(Error::Execution(message))
                }
            };

            self.manager.end_processing(task_id, fail).await?;
            handled += 1;
        }

        info!("Worker finished, {} task(s) handled", handled);
        Ok(handled)
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "handler panicked".to_string()
    }
}
