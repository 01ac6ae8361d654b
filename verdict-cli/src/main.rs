//! Verdict CLI: drive the research engine from a terminal.
//!
//! Every subcommand builds the engine from the layered configuration of the
//! selected workspace, runs one operation and shuts the queue worker down.

mod commands;
mod runtime;

use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};
use uuid::Uuid;

/// Verdict: legal research orchestration over a case-law store
#[derive(Parser, Debug)]
#[command(name = "verdict", version, about, long_about = None)]
struct Cli {
    /// Workspace directory
    #[arg(short, long, default_value = ".", global = true)]
    workspace: PathBuf,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Suppress non-essential output
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Answer inference calls with canned responses instead of the configured service
    #[arg(long, global = true)]
    dry_run: bool,

    /// Subcommand
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Discover candidate cases for a query and persist an execution plan
    Plan {
        /// Research question
        query: String,
        /// Address notified when the plan finishes executing
        #[arg(long)]
        email: Option<String>,
    },
    /// Execute a stored plan: analyze every chunk, then synthesize
    Execute {
        plan_id: Uuid,
        #[arg(long)]
        email: Option<String>,
    },
    /// Plan and execute a query in one go
    Research {
        query: String,
        #[arg(long)]
        email: Option<String>,
    },
    /// Truncate a plan to its first N candidates
    Limit { plan_id: Uuid, max_cases: usize },
    /// Show plan progress (all plans when no id is given)
    Status { plan_id: Option<Uuid> },
    /// Split a broad question into sub-research tasks and start a new task queue
    Decompose { query: String },
    /// Manage the task queue
    Tasks {
        #[command(subcommand)]
        action: TaskAction,
    },
    /// Execute every approved (and previously failed) task
    RunQueue {
        #[arg(long)]
        email: Option<String>,
    },
    /// Generate the final report from completed tasks
    Report {
        /// Write the report JSON here instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Load case records from a JSON array file into the case store
    Import { file: PathBuf },
    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(clap::Subcommand, Debug)]
enum TaskAction {
    /// List tasks and their states
    List,
    /// Plan every pending task
    Plan,
    /// Approve a planned task
    Approve { id: String },
    /// Approve every planned task
    ApproveAll,
    /// Move a failed task back to approved
    Retry { id: String },
    /// Remove a task
    Remove { id: String },
    /// Remove completed tasks
    ClearCompleted,
}

#[derive(clap::Subcommand, Debug)]
enum ConfigAction {
    /// Show the effective configuration
    Show,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    // Set up tracing: human-readable stderr + JSON file logging
    let filter = match cli.verbose {
        0 if cli.quiet => "error",
        0 => "info",
        1 => "debug",
        _ => "trace",
    };

    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_filter(EnvFilter::new(filter));

    let log_dir = directories::ProjectDirs::from("dev", "verdict", "verdict")
        .map(|d| d.data_dir().join("logs"))
        .unwrap_or_else(|| PathBuf::from("."));
    let _ = std::fs::create_dir_all(&log_dir);
    let file_appender = tracing_appender::rolling::daily(&log_dir, "verdict.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);
    let json_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_writer(non_blocking)
        .with_filter(EnvFilter::new("debug"));

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(json_layer)
        .init();

    let workspace = cli
        .workspace
        .canonicalize()
        .unwrap_or_else(|_| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")));

    commands::handle_command(cli.command, &workspace, cli.dry_run).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_parse_research_with_global_flags() {
        let cli = Cli::try_parse_from([
            "verdict",
            "research",
            "furt calificat",
            "--email",
            "avocat@example.ro",
            "--dry-run",
            "-vv",
        ])
        .unwrap();
        assert!(cli.dry_run);
        assert_eq!(cli.verbose, 2);
        match cli.command {
            Commands::Research { query, email } => {
                assert_eq!(query, "furt calificat");
                assert_eq!(email.as_deref(), Some("avocat@example.ro"));
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_parse_limit_requires_uuid() {
        let id = Uuid::new_v4();
        let cli =
            Cli::try_parse_from(["verdict", "limit", &id.to_string(), "25"]).unwrap();
        match cli.command {
            Commands::Limit { plan_id, max_cases } => {
                assert_eq!(plan_id, id);
                assert_eq!(max_cases, 25);
            }
            other => panic!("unexpected command: {other:?}"),
        }
        assert!(Cli::try_parse_from(["verdict", "limit", "not-a-uuid", "25"]).is_err());
    }

    #[test]
    fn test_parse_task_subcommands() {
        let cli = Cli::try_parse_from(["verdict", "tasks", "approve-all"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Tasks {
                action: TaskAction::ApproveAll
            }
        ));
        let cli = Cli::try_parse_from(["verdict", "-w", "/tmp", "tasks", "retry", "t1"]).unwrap();
        assert_eq!(cli.workspace, PathBuf::from("/tmp"));
        assert!(matches!(
            cli.command,
            Commands::Tasks {
                action: TaskAction::Retry { ref id }
            } if id == "t1"
        ));
    }

    #[test]
    fn test_subcommand_is_required() {
        assert!(Cli::try_parse_from(["verdict"]).is_err());
    }
}
