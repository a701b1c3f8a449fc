//! The `codexflow` binary: start and drive a pipeline run in a worktree.

use clap::{Parser, Subcommand};
use codexflow_core::{EventBus, ExecSettings, KernelEvent, RunMode, RunPaths, RunStatus, TaskRecord};
use codexflow_orchestrator::{
    Coordinator, StartRunRequest, WorkerConfigUpdate, WorkerSupervisor, WorktreeResolver,
};
use codexflow_store::TaskStore;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Worktree id used by the single-worktree CLI front-end.
const WORKTREE_ID: &str = "default";

#[derive(Parser)]
#[command(name = "codexflow", about = "Orchestrator for multi-role AI coding pipelines")]
struct Cli {
    /// Path to an optional config file
    #[arg(short, long, default_value = "codexflow.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a run and drive it until the pipeline finishes
    Run {
        /// Worktree directory
        #[arg(long, default_value = ".")]
        worktree: PathBuf,
        /// Feature (or hunt) description
        #[arg(long)]
        description: String,
        /// Extra guidance for the agents
        #[arg(long)]
        guidance: Option<String>,
        /// Hunt for bugs instead of implementing a feature
        #[arg(long)]
        bug_hunt: bool,
        /// Number of analyst seeds
        #[arg(long)]
        analysts: Option<u32>,
        /// Number of hunters in bug-hunt mode
        #[arg(long)]
        hunters: Option<u32>,
        /// Seed the run but do not start workers
        #[arg(long)]
        no_workers: bool,
    },
    /// Print the task table of the most recent run in a worktree
    Status {
        /// Worktree directory
        #[arg(long, default_value = ".")]
        worktree: PathBuf,
    },
}

#[derive(Deserialize, Default)]
struct CliConfig {
    #[serde(default)]
    workers: Vec<WorkerConfigUpdate>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli.config)?;

    match cli.command {
        Commands::Run {
            worktree,
            description,
            guidance,
            bug_hunt,
            analysts,
            hunters,
            no_workers,
        } => {
            run_pipeline(
                worktree,
                description,
                guidance,
                bug_hunt,
                analysts,
                hunters,
                no_workers,
                config,
            )
            .await
        }
        Commands::Status { worktree } => print_status(&worktree),
    }
}

fn load_config(path: &Path) -> anyhow::Result<CliConfig> {
    match std::fs::read_to_string(path) {
        Ok(text) => toml::from_str(&text)
            .map_err(|err| anyhow::anyhow!("failed to parse config '{}': {err}", path.display())),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(CliConfig::default()),
        Err(err) => Err(anyhow::anyhow!("failed to read config '{}': {err}", path.display())),
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_pipeline(
    worktree: PathBuf,
    description: String,
    guidance: Option<String>,
    bug_hunt: bool,
    analysts: Option<u32>,
    hunters: Option<u32>,
    no_workers: bool,
    config: CliConfig,
) -> anyhow::Result<()> {
    let worktree_path = worktree
        .canonicalize()
        .map_err(|err| anyhow::anyhow!("worktree '{}' not usable: {err}", worktree.display()))?;

    let settings = ExecSettings::from_env();
    let bus = EventBus::new();
    let supervisor = Arc::new(WorkerSupervisor::new(bus.clone(), settings.clone()));
    let resolver: WorktreeResolver = {
        let path = worktree_path.clone();
        Arc::new(move |worktree_id: &str| (worktree_id == WORKTREE_ID).then(|| path.clone()))
    };
    let coordinator = Coordinator::new(bus.clone(), supervisor, settings, resolver);

    let _subscription = bus.subscribe(|event| match event {
        KernelEvent::WorkerLog {
            worker_id, chunk, ..
        } => {
            for line in chunk.lines() {
                println!("[{worker_id}] {line}");
            }
        }
        KernelEvent::RunStatus { status, .. } => {
            println!("== run status: {}", status_label(*status));
        }
        _ => {}
    });

    let summary = coordinator
        .start_run(
            WORKTREE_ID,
            StartRunRequest {
                description,
                guidance,
                mode: if bug_hunt {
                    RunMode::BugHunt
                } else {
                    RunMode::ImplementFeature
                },
                auto_start_workers: false,
                analysis_count: analysts,
                bug_hunter_count: hunters,
            },
        )
        .await?;
    info!(run_id = %summary.run_id, run_root = %summary.run_root.display(), "run started");

    if !config.workers.is_empty() {
        coordinator
            .update_worker_configurations(WORKTREE_ID, config.workers)
            .await?;
    }
    if !no_workers {
        coordinator.start_workers(WORKTREE_ID).await?;
    }

    let final_status = loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                println!("interrupted; stopping run");
                break RunStatus::Stopped;
            }
            () = tokio::time::sleep(Duration::from_millis(500)) => {}
        }
        match coordinator.get_snapshot(WORKTREE_ID).await {
            Some(snapshot) if snapshot.run.status != RunStatus::Running => {
                break snapshot.run.status;
            }
            Some(_) => {}
            None => break RunStatus::Stopped,
        }
    };

    if let Some(snapshot) = coordinator.get_snapshot(WORKTREE_ID).await {
        print_task_table(&snapshot.tasks);
    }
    let _ = coordinator.stop_run(WORKTREE_ID).await;
    coordinator.dispose().await;

    println!("run {} finished: {}", summary.run_id, status_label(final_status));
    Ok(())
}

fn print_status(worktree: &Path) -> anyhow::Result<()> {
    let worktree = worktree.canonicalize()?;
    let run_id = latest_run_id(&worktree)?
        .ok_or_else(|| anyhow::anyhow!("no runs under {}", worktree.display()))?;
    let store = TaskStore::new(RunPaths::for_run(&worktree, &run_id));
    let tasks = store.load_tasks()?;
    println!("run {run_id}:");
    print_task_table(&tasks);
    Ok(())
}

/// Most recently modified run directory under `<worktree>/codex-runs`.
fn latest_run_id(worktree: &Path) -> anyhow::Result<Option<String>> {
    let runs_dir = worktree.join(codexflow_core::run::RUNS_DIR);
    let read_dir = match std::fs::read_dir(&runs_dir) {
        Ok(read_dir) => read_dir,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err.into()),
    };

    let mut latest: Option<(std::time::SystemTime, String)> = None;
    for dirent in read_dir {
        let dirent = dirent?;
        if !dirent.file_type()?.is_dir() {
            continue;
        }
        let modified = dirent.metadata()?.modified()?;
        let name = dirent.file_name().to_string_lossy().into_owned();
        if latest.as_ref().map_or(true, |(when, _)| modified > *when) {
            latest = Some((modified, name));
        }
    }
    Ok(latest.map(|(_, name)| name))
}

fn print_task_table(tasks: &[TaskRecord]) {
    println!("{:<28} {:<18} {:<18} summary", "task", "status", "role");
    for task in tasks {
        println!(
            "{:<28} {:<18} {:<18} {}",
            task.id,
            task.status.to_string(),
            task.role.to_string(),
            task.summary.as_deref().unwrap_or("-")
        );
    }
}

fn status_label(status: RunStatus) -> &'static str {
    match status {
        RunStatus::Running => "running",
        RunStatus::Stopped => "stopped",
        RunStatus::Completed => "completed",
    }
}
