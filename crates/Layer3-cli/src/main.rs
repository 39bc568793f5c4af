//! Conveyor CLI - Main entry point
//!
//! `conveyor worker` is the detached worker entrypoint spawned by
//! `Manager::force_launch`; the remaining subcommands are the operational
//! surface for enqueueing, polling and aborting tasks.

mod handlers;

use anyhow::Context;
use chrono::Utc;
use clap::{Parser, Subcommand};
use conveyor_foundation::{QueueConfig, QUEUE_CONFIG_FILE};
use conveyor_task::{Error, HandlerRegistry, Manager, ManagerConfig, Task, TaskStore, Worker};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::error;

/// Conveyor - persistent background-task queue
#[derive(Parser, Debug)]
#[command(name = "conveyor")]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Directory holding the task database
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Path to a config file (defaults to <data-dir>/config.json)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the worker loop: claim and execute tasks
    Worker {
        /// Process only this task, then exit; without it the loop drains
        /// every pending task
        #[arg(long)]
        target_task_id: Option<i64>,
    },
    /// Enqueue a task and launch a detached worker for it
    Start {
        /// Registered task type
        #[arg(long = "type", value_name = "TYPE")]
        type_name: String,

        /// Logical deduplication code (empty disables deduplication)
        #[arg(long, default_value = "")]
        code: String,

        /// JSON input payload
        #[arg(long, default_value = "{}")]
        input: String,

        /// Enqueue only; do not launch a worker process
        #[arg(long)]
        no_launch: bool,
    },
    /// Show one task
    Status {
        #[arg(long)]
        id: Option<i64>,

        #[arg(long)]
        code: Option<String>,
    },
    /// List recent tasks for a code, most recent first
    List {
        #[arg(long)]
        code: String,

        /// Only show tasks active within the last N hours
        #[arg(long)]
        since_hours: Option<i64>,

        /// Number of tasks to show (0 = all)
        #[arg(long, default_value = "10")]
        limit: usize,
    },
    /// Request termination of a task
    Abort {
        #[arg(long)]
        id: i64,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| {
            tracing_subscriber::EnvFilter::new(if args.debug { "debug" } else { "info" })
        });
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = load_config(&args);
    let data_dir = args
        .data_dir
        .clone()
        .or_else(|| config.data_dir.clone())
        .unwrap_or_else(default_data_dir);

    let store = Arc::new(TaskStore::new(&data_dir)?);
    let registry = Arc::new(HandlerRegistry::new());
    handlers::register_builtin(&registry);

    // Launched workers must open the same database as this process
    let mut manager_config = ManagerConfig::from(&config);
    if manager_config.worker_command.is_none() {
        let exe = std::env::current_exe().context("Cannot resolve current executable")?;
        manager_config.worker_command = Some(vec![
            exe.to_string_lossy().into_owned(),
            "--data-dir".to_string(),
            data_dir.to_string_lossy().into_owned(),
            "worker".to_string(),
        ]);
    }
    let manager = Arc::new(Manager::new(store, registry, manager_config)?);

    match args.command {
        Command::Worker { target_task_id } => run_worker(manager, target_task_id).await,
        Command::Start {
            type_name,
            code,
            input,
            no_launch,
        } => start_task(manager, &type_name, &code, &input, no_launch).await,
        Command::Status { id, code } => show_status(manager, id, code).await,
        Command::List {
            code,
            since_hours,
            limit,
        } => list_tasks(manager, &code, since_hours, limit).await,
        Command::Abort { id } => abort_task(manager, id).await,
    }
}

/// Worker entrypoint contract: exit 0 on normal completion, 1 if the loop
/// itself failed. A task ending FAILED is recorded in the task's state,
/// not in the exit code.
async fn run_worker(manager: Arc<Manager>, target_task_id: Option<i64>) -> anyhow::Result<()> {
    let worker = Worker::new(manager, target_task_id);

    match worker.run().await {
        Ok(_handled) => Ok(()),
        Err(e) => {
            error!("Worker loop failed: {}", e);
            std::process::exit(1);
        }
    }
}

async fn start_task(
    manager: Arc<Manager>,
    type_name: &str,
    code: &str,
    input: &str,
    no_launch: bool,
) -> anyhow::Result<()> {
    let input = serde_json::from_str(input).context("Invalid input JSON")?;

    match manager.start(type_name, input, code).await {
        Ok(task) => {
            println!("Started task {}", task.id());
            if !no_launch {
                manager.force_launch(task.id()).await?;
            }
            Ok(())
        }
        Err(Error::AlreadyRunning { task }) => {
            println!("Already running as task {} ({})", task.id, task.state);
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

async fn show_status(
    manager: Arc<Manager>,
    id: Option<i64>,
    code: Option<String>,
) -> anyhow::Result<()> {
    let task = match (id, code) {
        (Some(id), None) => manager.get_by_id(id).await?,
        (None, Some(code)) => manager.get_by_code(&code).await?,
        _ => anyhow::bail!("Pass exactly one of --id or --code"),
    };

    match task {
        Some(task) => print_task(&task),
        None => println!("No such task"),
    }
    Ok(())
}

async fn list_tasks(
    manager: Arc<Manager>,
    code: &str,
    since_hours: Option<i64>,
    limit: usize,
) -> anyhow::Result<()> {
    let since = since_hours.map(|hours| Utc::now() - chrono::Duration::hours(hours));
    let tasks = manager.get_last(code, since, limit).await?;

    if tasks.is_empty() {
        println!("No tasks for code '{}'", code);
        return Ok(());
    }

    for task in &tasks {
        println!(
            "{:>6}  {:<12}  {:>4.0}%  {}  {}",
            task.id(),
            task.state().to_string(),
            task.progress() * 100.0,
            task.last_activity_datetime().format("%Y-%m-%d %H:%M:%S"),
            task.type_name(),
        );
    }
    Ok(())
}

async fn abort_task(manager: Arc<Manager>, id: i64) -> anyhow::Result<()> {
    let task = manager.abort_processing(id).await?;
    println!("Task {} is now {}", task.id(), task.state());
    Ok(())
}

fn print_task(task: &Task) {
    println!("Task {}", task.id());
    println!("  type:      {}", task.type_name());
    if !task.code().is_empty() {
        println!("  code:      {}", task.code());
    }
    println!("  state:     {}", task.state());
    println!("  progress:  {:.0}%", task.progress() * 100.0);
    println!("  created:   {}", task.initializing_datetime());
    println!("  activity:  {}", task.last_activity_datetime());
    if task.output() != &serde_json::json!({}) {
        println!("  output:    {}", task.output());
    }
}

fn load_config(args: &Args) -> QueueConfig {
    let path = args.config.clone().unwrap_or_else(|| {
        args.data_dir
            .clone()
            .unwrap_or_else(default_data_dir)
            .join(QUEUE_CONFIG_FILE)
    });

    QueueConfig::load_or_default(&path)
}

fn default_data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".conveyor")
}
