use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use nanoclaw::config::Config;
use nanoclaw::events::EventBus;
use nanoclaw::host::{self, Host};
use nanoclaw::plugins::TasksApi;
use nanoclaw::tasks::engine::TaskService;
use nanoclaw::tasks::TaskStore;

/// `NanoClaw` - a multi-channel assistant orchestrator.
#[derive(Parser, Debug)]
#[command(name = "nanoclaw")]
#[command(version)]
#[command(about = "Per-chat agent subprocesses, scheduled tasks, capability-gated plugins.", long_about = None)]
struct Cli {
    /// Path to config.toml (defaults to ~/.nanoclaw/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the host process
    Start,
    /// Manage scheduled tasks
    #[command(subcommand)]
    Task(TaskCommands),
    /// List registered chats
    Chats,
}

#[derive(Subcommand, Debug)]
enum TaskCommands {
    /// List all scheduled tasks
    List,
    /// Pause a task
    Pause { id: String },
    /// Resume a paused or errored task
    Resume { id: String },
    /// Cancel and delete a task
    Cancel { id: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Start => {
            host::ensure_main_folder(&config)?;
            // Channel implementations are supplied by the embedding build;
            // the bare binary still runs the scheduler, IPC monitor, and
            // plugin host.
            let host = Host::new(config, Vec::new())?;
            host.run().await
        }
        Commands::Task(command) => handle_task_command(command, &config).await,
        Commands::Chats => {
            let chats = nanoclaw::db::ChatStore::open(&config.db_path())?;
            let list = chats.list_chats()?;
            if list.is_empty() {
                println!("No registered chats yet.");
                return Ok(());
            }
            println!("Registered chats ({}):", list.len());
            for chat in list {
                let main = if chat.folder == config.channels.main_folder {
                    " [main]"
                } else {
                    ""
                };
                let trigger = chat
                    .trigger_pattern
                    .map_or_else(String::new, |t| format!(" | trigger: {t}"));
                println!("- {} | {} ({}){main}{trigger}", chat.jid, chat.display_name, chat.folder);
            }
            Ok(())
        }
    }
}

async fn handle_task_command(command: TaskCommands, config: &Config) -> Result<()> {
    let store = TaskStore::open(&config.db_path())?;
    let service = TaskService::new(config.clone(), store.clone(), EventBus::new());

    match command {
        TaskCommands::List => {
            let tasks = store.list_all()?;
            if tasks.is_empty() {
                println!("No scheduled tasks yet.");
                return Ok(());
            }
            println!("Scheduled tasks ({}):", tasks.len());
            for task in tasks {
                let next = task
                    .next_run
                    .map_or_else(|| "never".into(), |d| d.to_rfc3339());
                let last = task
                    .last_run
                    .map_or_else(|| "never".into(), |d| d.to_rfc3339());
                println!(
                    "- {} | {} {} | {} | next={next} | last={last} | retries={}/{}\n    prompt: {}",
                    task.id,
                    task.schedule_type.as_str(),
                    task.schedule_value,
                    task.status.as_str(),
                    task.retry_count,
                    task.max_retries,
                    task.prompt,
                );
            }
            Ok(())
        }
        TaskCommands::Pause { id } => {
            if service.pause_task(&id).await? {
                println!("⏸️  Paused task {id}");
            } else {
                println!("Task {id} was not pausable (missing or completed).");
            }
            Ok(())
        }
        TaskCommands::Resume { id } => {
            if service.resume_task(&id).await? {
                println!("▶️  Resumed task {id}");
            } else {
                println!("Task {id} was not resumable (missing or not paused).");
            }
            Ok(())
        }
        TaskCommands::Cancel { id } => {
            if service.cancel_task(&id).await? {
                println!("✅ Cancelled task {id}");
            } else {
                println!("Task {id} does not exist (already cancelled?).");
            }
            Ok(())
        }
    }
}
