//! Process launcher for detached workers
//!
//! Builds the worker command line and spawns it fully detached: null
//! stdio, no waiting, no imposed time limit. The child is reaped in the
//! background so the launching process never accumulates zombies, but its
//! exit status is never observed by the caller.

use conveyor_foundation::{Error, Result};
use std::path::PathBuf;
use std::process::Stdio;
use tokio::process::Command;
use tracing::debug;

/// Spawns detached worker processes scoped to one task id
#[derive(Debug, Clone)]
pub struct WorkerLauncher {
    program: PathBuf,
    args: Vec<String>,
}

impl WorkerLauncher {
    /// Launch workers by re-invoking the current executable in worker mode
    pub fn from_current_exe() -> Result<Self> {
        let program = std::env::current_exe()
            .map_err(|e| Error::Config(format!("Cannot resolve current executable: {}", e)))?;

        Ok(Self {
            program,
            args: vec!["worker".to_string()],
        })
    }

    /// Launch workers with an explicit command: program followed by
    /// leading arguments
    pub fn from_command(command: Vec<String>) -> Result<Self> {
        let mut parts = command.into_iter();
        let program = parts
            .next()
            .ok_or_else(|| Error::Validation("Worker command is empty".to_string()))?;

        Ok(Self {
            program: PathBuf::from(program),
            args: parts.collect(),
        })
    }

    /// Spawn a detached worker for one task id, fire-and-forget
    pub fn spawn(&self, task_id: i64) -> Result<()> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .arg("--target-task-id")
            .arg(task_id.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()?;

        debug!(
            "Launched worker for task {}: {} {:?}",
            task_id,
            self.program.display(),
            self.args
        );

        // Reap in the background; the exit status is intentionally dropped
        tokio::spawn(async move {
            let _ = child.wait().await;
        });

        Ok(())
    }
}
