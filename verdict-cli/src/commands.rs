//! CLI subcommand handlers.

use crate::runtime::{Runtime, database_path};
use crate::{Commands, ConfigAction, TaskAction};
use std::path::Path;
use verdict_core::search::CaseRecord;
use verdict_core::{EngineConfig, Plan, SqliteSearchBackend, Task, TaskExecutor};

/// Handle a CLI subcommand.
pub async fn handle_command(
    command: Commands,
    workspace: &Path,
    dry_run: bool,
) -> anyhow::Result<()> {
    let config = verdict_core::config::load_config(Some(workspace), None)
        .map_err(|e| anyhow::anyhow!("Configuration error: {}", e))?;

    match command {
        Commands::Config { action } => handle_config(action, &config),
        Commands::Import { file } => handle_import(&file, &config, workspace).await,
        command => {
            let runtime = Runtime::build(config, workspace, dry_run)?;
            let result = run(command, &runtime).await;
            runtime.shutdown().await;
            result
        }
    }
}

async fn run(command: Commands, runtime: &Runtime) -> anyhow::Result<()> {
    let orchestrator = &runtime.orchestrator;
    match command {
        Commands::Plan { query, email } => {
            let planned = orchestrator.plan_queued(&query, email).await?;
            println!("Plan {}", planned.plan_id);
            println!(
                "  {} cases in {} chunks via {} (eta {}s)",
                planned.total_cases, planned.total_chunks, planned.strategy_type, planned.eta_seconds
            );
            for (strategy, count) in &planned.strategy_breakdown {
                println!("    {strategy}: {count}");
            }
            if !planned.preview_verified {
                println!("  Preview check did not complete; the plan is still usable.");
            }
            Ok(())
        }
        Commands::Execute { plan_id, email } => {
            let outcome = orchestrator.execute_queued(plan_id, email).await?;
            print_json(&outcome)
        }
        Commands::Research { query, email } => {
            let outcome = orchestrator.research(&query, email).await?;
            print_json(&outcome)
        }
        Commands::Limit { plan_id, max_cases } => {
            let plan = orchestrator.plans().update_case_limit(&plan_id, max_cases)?;
            println!(
                "Plan {} now covers {} cases in {} chunks",
                plan.plan_id, plan.total_cases, plan.total_chunks
            );
            Ok(())
        }
        Commands::Status { plan_id: Some(plan_id) } => {
            let plan = orchestrator.plans().load(&plan_id)?;
            let progress = orchestrator.plans().progress(&plan_id)?;
            print_plan(&plan);
            println!(
                "  progress: {}/{} chunks ({:.0}%)",
                progress.completed_chunks,
                progress.total_chunks,
                progress.fraction() * 100.0
            );
            if !progress.missing_chunks.is_empty() {
                println!("  missing chunks: {:?}", progress.missing_chunks);
            }
            if let Some(error) = &plan.error {
                println!("  error: {error}");
            }
            Ok(())
        }
        Commands::Status { plan_id: None } => {
            let plans = orchestrator.plans().list()?;
            if plans.is_empty() {
                println!("No plans yet.");
            }
            for plan in &plans {
                print_plan(plan);
            }
            Ok(())
        }
        Commands::Decompose { query } => {
            let decomposition = orchestrator.decompose(&query).await?;
            if let Some(rationale) = &decomposition.rationale {
                println!("{rationale}\n");
            }
            let tasks = runtime
                .tasks
                .initialize(&query, decomposition.rationale, decomposition.tasks)?;
            println!("Task queue initialized with {} tasks:", tasks.len());
            for task in &tasks {
                print_task(task);
            }
            Ok(())
        }
        Commands::Tasks { action } => handle_tasks(action, runtime).await,
        Commands::RunQueue { email } => {
            let executor = TaskExecutor::new(runtime.tasks.clone(), std::sync::Arc::new(orchestrator.clone()));
            let summary = executor.execute_queue(email.as_deref()).await?;
            println!(
                "Executed {} tasks: {} succeeded, {} failed",
                summary.total, summary.succeeded, summary.failed
            );
            Ok(())
        }
        Commands::Report { output } => {
            let result = orchestrator.generate_report(&runtime.tasks).await?;
            if result.fallback_used {
                eprintln!(
                    "Report built from the raw model answer after {} attempts.",
                    result.attempts
                );
            }
            let json = serde_json::to_string_pretty(&result.report)?;
            match output {
                Some(path) => {
                    std::fs::write(&path, json)?;
                    println!("Report written to {}", path.display());
                }
                None => println!("{json}"),
            }
            Ok(())
        }
        Commands::Config { .. } | Commands::Import { .. } => Ok(()),
    }
}

async fn handle_tasks(action: TaskAction, runtime: &Runtime) -> anyhow::Result<()> {
    let tasks = &runtime.tasks;
    match action {
        TaskAction::List => {
            let all = tasks.list()?;
            if all.is_empty() {
                println!("Task queue is empty. Run `verdict decompose <question>` first.");
            }
            for task in &all {
                print_task(task);
            }
            Ok(())
        }
        TaskAction::Plan => {
            let executor = TaskExecutor::new(
                tasks.clone(),
                std::sync::Arc::new(runtime.orchestrator.clone()),
            );
            let summary = executor.plan_pending().await?;
            println!(
                "Planned {} tasks: {} succeeded, {} failed",
                summary.total, summary.succeeded, summary.failed
            );
            Ok(())
        }
        TaskAction::Approve { id } => {
            let task = tasks.approve(&id)?;
            print_task(&task);
            Ok(())
        }
        TaskAction::ApproveAll => {
            let count = tasks.approve_all_planned()?;
            println!("Approved {count} tasks");
            Ok(())
        }
        TaskAction::Retry { id } => {
            let task = tasks.retry(&id)?;
            print_task(&task);
            Ok(())
        }
        TaskAction::Remove { id } => {
            let task = tasks.remove(&id)?;
            println!("Removed {}", task.id);
            Ok(())
        }
        TaskAction::ClearCompleted => {
            let count = tasks.clear_completed()?;
            println!("Removed {count} completed tasks");
            Ok(())
        }
    }
}

fn handle_config(action: ConfigAction, config: &EngineConfig) -> anyhow::Result<()> {
    match action {
        ConfigAction::Show => {
            let toml_str = toml::to_string_pretty(config)?;
            println!("{}", toml_str);
            Ok(())
        }
    }
}

async fn handle_import(file: &Path, config: &EngineConfig, workspace: &Path) -> anyhow::Result<()> {
    let raw = std::fs::read_to_string(file)?;
    let cases: Vec<CaseRecord> = serde_json::from_str(&raw)
        .map_err(|e| anyhow::anyhow!("{} is not a JSON array of cases: {}", file.display(), e))?;
    let database = database_path(config, workspace);
    if let Some(parent) = database.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let backend = SqliteSearchBackend::open(&database)?;
    let inserted = backend.insert_cases(cases).await?;
    println!("Imported {} cases into {}", inserted, database.display());
    Ok(())
}

fn print_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn print_plan(plan: &Plan) {
    println!(
        "{}  [{}]  {} cases / {} chunks  {}",
        plan.plan_id, plan.status, plan.total_cases, plan.total_chunks, plan.user_query
    );
}

fn print_task(task: &Task) {
    let title = if task.user_metadata.title.is_empty() {
        task.query.as_str()
    } else {
        task.user_metadata.title.as_str()
    };
    match &task.plan {
        Some(plan) => println!(
            "  {:<20} {:<10} {} ({} cases)",
            task.id, task.state, title, plan.total_cases
        ),
        None => println!("  {:<20} {:<10} {}", task.id, task.state, title),
    }
    if let Some(error) = &task.error {
        println!("  {:<20} error: {}", "", error);
    }
}
