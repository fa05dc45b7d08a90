use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::info;

use forgeplan::config::Config;
use forgeplan::core::task::{load_records, TaskId, TaskStatus};
use forgeplan::orchestration::{summarize, Orchestrator};
use forgeplan::state::{FileStore, StateStore};
use forgeplan::workflow::{BlockerKind, Metadata};
use forgeplan::{Error, Result};

/// forgeplan - dependency-aware build planner
#[derive(Parser, Debug)]
#[command(name = "forgeplan")]
#[command(version, about, long_about = None)]
#[command(
    after_help = "ENVIRONMENT:\n    FORGEPLAN_DEBUG=1     Enable debug logging (alternative to --debug)\n    RUST_LOG              Override the log filter"
)]
pub struct Cli {
    /// Enable debug logging (writes to <state dir>/forgeplan.log)
    #[arg(short = 'd', long)]
    pub debug: bool,

    /// Project root; state lives in <project>/.forgeplan
    #[arg(short = 'p', long, default_value = ".")]
    pub project: PathBuf,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Load tasks from a JSON array file and print the plan
    Plan {
        /// Path to the task records
        tasks: PathBuf,
    },

    /// Run build phases until completion, a blocker, or a failure
    Run {
        /// Load these task records before running
        #[arg(long)]
        tasks: Option<PathBuf>,

        /// Stop after each phase and wait for the next `run`
        #[arg(long)]
        step: bool,
    },

    /// Show build status and task progress
    Status,

    /// Update a single task
    Task {
        #[command(subcommand)]
        action: TaskAction,
    },

    /// Manage checkpoints
    Checkpoint {
        #[command(subcommand)]
        action: CheckpointAction,
    },

    /// Manage blockers
    Blocker {
        #[command(subcommand)]
        action: BlockerAction,
    },

    /// Pause the build before the next phase
    Pause,

    /// Resume a paused or stopped build
    Resume,

    /// Stop the build
    Stop,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum TaskAction {
    Start { id: String },
    Complete { id: String },
    Fail { id: String, error: String },
    Skip { id: String, reason: String },
    Block { id: String, reason: String },
    Unblock { id: String },
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum CheckpointAction {
    /// List checkpoints, oldest first
    List,
    /// Show what resuming from a checkpoint would restore (latest by default)
    Show { id: Option<String> },
    /// Record a checkpoint for the current phase
    Create,
    /// Roll back to a checkpoint by id or unique prefix
    Rollback { id: String },
    /// Keep only the latest N checkpoints
    Prune { keep: usize },
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum BlockerAction {
    /// Add a blocker (missing_credentials, test_failures, user_intervention,
    /// compilation_error, resource_constraint)
    Add { kind: String, description: String },
    /// Clear every blocker of a kind
    Clear { kind: String },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_dir = Config::default_state_dir(Some(cli.project.as_path()))?;
    let config = Config::load(&default_dir)?;
    let state_dir = config.resolve_state_dir(&default_dir);
    Config::ensure_dirs(&state_dir)?;

    forgeplan::log::init(cli.debug, &state_dir)?;
    info!(state_dir = %state_dir.display(), debug = forgeplan::log::is_debug(), "forgeplan starting");

    let store: Arc<dyn StateStore> = Arc::new(FileStore::new(&state_dir));
    let mut orch = Orchestrator::open(&config, store)?;

    match cli.command {
        Command::Plan { tasks } => run_plan(&mut orch, &tasks),
        Command::Run { tasks, step } => run_build(&mut orch, tasks.as_deref(), step),
        Command::Status => run_status(&orch),
        Command::Task { action } => run_task(&mut orch, action),
        Command::Checkpoint { action } => run_checkpoint(&mut orch, action),
        Command::Blocker { action } => run_blocker(&mut orch, action),
        Command::Pause => {
            orch.pause()?;
            println!("Build paused.");
            Ok(())
        }
        Command::Resume => {
            orch.resume()?;
            println!("Build resumed.");
            Ok(())
        }
        Command::Stop => {
            orch.stop()?;
            println!("Build stopped.");
            Ok(())
        }
    }
}

fn run_plan(orch: &mut Orchestrator, tasks: &Path) -> Result<()> {
    orch.load_tasks(load_records(tasks)?)?;
    let analysis = orch.analyze_dependencies()?;

    println!("Tasks:         {}", analysis.total_tasks);
    println!("Levels:        {}", analysis.levels.len());
    for level in &analysis.levels {
        let ids: Vec<&str> = level.task_ids.iter().map(TaskId::as_str).collect();
        println!(
            "  [{}] {} ({} min)",
            level.index,
            ids.join(", "),
            level.duration_minutes
        );
    }
    let path: Vec<&str> = analysis.critical_path.tasks.iter().map(TaskId::as_str).collect();
    println!(
        "Critical path: {} ({} min)",
        path.join(" -> "),
        analysis.critical_path_minutes()
    );
    println!(
        "Serial time:   {} min, with parallelism: {} min",
        analysis.total_serial_minutes, analysis.parallel_minutes
    );

    let batches = orch.plan_batches();
    println!();
    println!("Ready batches: {}", summarize(&batches));
    for batch in &batches {
        println!(
            "  #{} [{} / {}] {} ({} min)",
            batch.id,
            batch.domain,
            batch.complexity,
            batch.task_ids().join(", "),
            batch.total_minutes
        );
    }
    Ok(())
}

fn run_build(orch: &mut Orchestrator, tasks: Option<&Path>, step: bool) -> Result<()> {
    if let Some(path) = tasks {
        orch.load_tasks(load_records(path)?)?;
    }
    if step {
        orch.set_continuous_mode(false)?;
    }

    let report = orch.run()?;
    for phase in &report.phases_completed {
        println!("  completed {}", phase);
    }
    println!("{} ({:.1}%)", report.outcome, report.progress_percent);
    Ok(())
}

fn run_status(orch: &Orchestrator) -> Result<()> {
    println!("{}", orch.status());

    let progress = orch.queue().progress();
    println!();
    println!(
        "Tasks:    {}/{} completed ({:.1}%)",
        progress.completed, progress.total, progress.percent_complete
    );
    for status in TaskStatus::ALL {
        let tasks = orch.queue().tasks_with_status(status);
        if tasks.is_empty() {
            continue;
        }
        let ids: Vec<&str> = tasks.iter().map(|t| t.id.as_str()).collect();
        println!("  {:<12} {}", status.to_string(), ids.join(", "));
    }
    Ok(())
}

fn run_task(orch: &mut Orchestrator, action: TaskAction) -> Result<()> {
    let queue = orch.queue_mut();
    match action {
        TaskAction::Start { id } => {
            queue.start_task(&TaskId::from(id.as_str()))?;
            println!("Started {}", id);
        }
        TaskAction::Complete { id } => {
            let promoted = queue.complete_task(&TaskId::from(id.as_str()))?;
            println!("Completed {}", id);
            if !promoted.is_empty() {
                let ids: Vec<&str> = promoted.iter().map(TaskId::as_str).collect();
                println!("Now ready: {}", ids.join(", "));
            }
        }
        TaskAction::Fail { id, error } => {
            let status = queue.fail_task(&TaskId::from(id.as_str()), &error)?;
            println!("{} is now {}", id, status);
        }
        TaskAction::Skip { id, reason } => {
            queue.skip_task(&TaskId::from(id.as_str()), &reason)?;
            println!("Skipped {}", id);
        }
        TaskAction::Block { id, reason } => {
            queue.block_task(&TaskId::from(id.as_str()), &reason)?;
            println!("Blocked {}", id);
        }
        TaskAction::Unblock { id } => {
            let status = queue.unblock_task(&TaskId::from(id.as_str()))?;
            println!("{} is now {}", id, status);
        }
    }
    Ok(())
}

fn run_checkpoint(orch: &mut Orchestrator, action: CheckpointAction) -> Result<()> {
    match action {
        CheckpointAction::List => {
            let checkpoints = orch.checkpoints().list_checkpoints();
            if checkpoints.is_empty() {
                println!("No checkpoints.");
            }
            for checkpoint in checkpoints {
                println!(
                    "{}  {:<22} {:<12} {}  tasks={} files={}",
                    checkpoint.id.short(),
                    checkpoint.phase.to_string(),
                    checkpoint.status.to_string(),
                    checkpoint.created_at.format("%Y-%m-%d %H:%M:%S"),
                    checkpoint.completed_tasks.len(),
                    checkpoint.created_files.len()
                );
            }
        }
        CheckpointAction::Show { id } => {
            let target = match id {
                Some(prefix) => Some(orch.checkpoints().find(&prefix)?.id),
                None => None,
            };
            let snapshot = orch.checkpoints().resume_from_checkpoint(target.as_ref())?;
            let tasks: Vec<&str> = snapshot.completed_tasks.iter().map(TaskId::as_str).collect();
            println!("Checkpoint: {}", snapshot.checkpoint_id);
            println!("Phase:      {}", snapshot.phase);
            println!("Completed:  {}", tasks.join(", "));
            println!("Files:      {}", snapshot.created_files.join(", "));
            if !snapshot.metadata.is_empty() {
                println!("{}", serde_json::to_string_pretty(&snapshot.metadata)?);
            }
        }
        CheckpointAction::Create => {
            let checkpoint = orch.create_checkpoint(Metadata::new())?;
            println!("Created checkpoint {} ({})", checkpoint.id.short(), checkpoint.phase);
        }
        CheckpointAction::Rollback { id } => {
            let target = orch.checkpoints().find(&id)?.id;
            let result = orch.rollback_to_checkpoint(&target)?;
            println!(
                "Rolled back to {} ({}); {} later checkpoints discarded",
                result.target.short(),
                result.phase,
                result.rolled_back.len()
            );
            if !result.files_to_rollback.is_empty() {
                println!("Files created after this checkpoint:");
                for file in &result.files_to_rollback {
                    println!("  {}", file);
                }
            }
        }
        CheckpointAction::Prune { keep } => {
            if keep == 0 {
                return Err(Error::Validation("keep must be at least 1".to_string()));
            }
            let removed = orch.prune_checkpoints(keep)?;
            println!("Pruned {} checkpoints", removed);
        }
    }
    Ok(())
}

fn run_blocker(orch: &mut Orchestrator, action: BlockerAction) -> Result<()> {
    match action {
        BlockerAction::Add { kind, description } => {
            let kind: BlockerKind = kind.parse()?;
            orch.add_blocker(kind, &description)?;
            println!("Added blocker {}", kind);
        }
        BlockerAction::Clear { kind } => {
            let kind: BlockerKind = kind.parse()?;
            let removed = orch.clear_blocker(kind)?;
            println!("Cleared {} {} blocker(s)", removed, kind);
        }
    }
    Ok(())
}
