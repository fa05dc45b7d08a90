//! The orchestrator drives the phase loop over the planning components.
//!
//! It owns the dependency graph, task queue, phase manager, checkpoint log,
//! and batch optimizer, and invokes an injected handler for each phase.
//! Handler errors and panics are caught and reported as a failed run rather
//! than propagated.

use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::core::dag::{CriticalPath, DependencyGraph, ExecutionLevel, MissingDependency};
use crate::core::queue::TaskQueue;
use crate::core::task::{validate_records, TaskId, TaskRecord};
use crate::orchestration::batch::{summarize, BatchOptimizer, TaskBatch};
use crate::state::checkpoint::{Checkpoint, CheckpointId, CheckpointManager, RollbackResult};
use crate::state::store::{MemoryStore, StateStore};
use crate::workflow::{
    BlockerKind, BuildPhase, Metadata, PhaseManager, RunControl, StatusReport,
};
use crate::{Error, Result};

/// What a phase handler reports.
#[derive(Debug, Clone, PartialEq)]
pub enum PhaseOutcome {
    /// The phase finished; metadata and files go into its checkpoint.
    Success {
        metadata: Metadata,
        created_files: Vec<String>,
    },
    Failure {
        error: String,
    },
    /// An external condition must be cleared before the build can go on.
    Blocked {
        kind: BlockerKind,
        description: String,
    },
}

impl PhaseOutcome {
    pub fn success() -> Self {
        PhaseOutcome::Success {
            metadata: Metadata::new(),
            created_files: Vec::new(),
        }
    }

    pub fn success_with(metadata: Metadata, created_files: Vec<String>) -> Self {
        PhaseOutcome::Success {
            metadata,
            created_files,
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        PhaseOutcome::Failure {
            error: error.into(),
        }
    }

    pub fn blocked(kind: BlockerKind, description: impl Into<String>) -> Self {
        PhaseOutcome::Blocked {
            kind,
            description: description.into(),
        }
    }
}

/// Everything a phase handler may look at or change.
pub struct PhaseContext<'a> {
    pub phase: BuildPhase,
    pub graph: &'a DependencyGraph,
    pub queue: &'a mut TaskQueue,
    pub optimizer: &'a mut BatchOptimizer,
    pub gates: &'a HashSet<TaskId>,
}

impl PhaseContext<'_> {
    /// Ready tasks that are not held by an interruption gate.
    pub fn dispatchable_tasks(&self) -> Vec<TaskRecord> {
        self.queue
            .ready_tasks()
            .into_iter()
            .filter(|t| !self.gates.contains(&t.id))
            .cloned()
            .collect()
    }
}

/// Work performed for one phase.
pub trait PhaseHandler: Send {
    fn run(&mut self, ctx: &mut PhaseContext<'_>) -> Result<PhaseOutcome>;
}

/// Adapter that lets a closure act as a phase handler.
pub struct FnHandler<F>(F);

/// Wrap a closure as a phase handler.
pub fn handler_fn<F>(f: F) -> FnHandler<F>
where
    F: FnMut(&mut PhaseContext<'_>) -> Result<PhaseOutcome> + Send,
{
    FnHandler(f)
}

impl<F> PhaseHandler for FnHandler<F>
where
    F: FnMut(&mut PhaseContext<'_>) -> Result<PhaseOutcome> + Send,
{
    fn run(&mut self, ctx: &mut PhaseContext<'_>) -> Result<PhaseOutcome> {
        (self.0)(ctx)
    }
}

/// Structural facts about the loaded plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DependencyAnalysis {
    pub total_tasks: usize,
    pub levels: Vec<ExecutionLevel>,
    /// Number of tasks per level.
    pub parallel_counts: Vec<usize>,
    pub max_parallelism: usize,
    pub critical_path: CriticalPath,
    /// Sum of every task's duration.
    pub total_serial_minutes: u64,
    /// Sum of level durations, i.e. wall time with unlimited parallelism.
    pub parallel_minutes: u64,
    pub missing_dependencies: Vec<MissingDependency>,
}

impl DependencyAnalysis {
    pub fn from_graph(graph: &DependencyGraph) -> Result<Self> {
        let levels = graph.get_execution_levels()?;
        let critical_path = graph.get_critical_path()?;
        let parallel_counts: Vec<usize> = levels.iter().map(|l| l.parallel_count()).collect();

        Ok(Self {
            total_tasks: graph.task_count(),
            max_parallelism: parallel_counts.iter().copied().max().unwrap_or(0),
            parallel_minutes: levels.iter().map(|l| l.duration_minutes).sum(),
            total_serial_minutes: graph
                .all_tasks()
                .iter()
                .map(|t| u64::from(t.duration_minutes))
                .sum(),
            missing_dependencies: graph.validate_dependencies(),
            parallel_counts,
            levels,
            critical_path,
        })
    }

    pub fn critical_path_minutes(&self) -> u64 {
        self.critical_path.total_duration
    }
}

/// Default handler for `dependency_analysis`: computes levels and the
/// critical path and records them as phase metadata.
#[derive(Debug, Default)]
pub struct DependencyAnalysisHandler;

impl PhaseHandler for DependencyAnalysisHandler {
    fn run(&mut self, ctx: &mut PhaseContext<'_>) -> Result<PhaseOutcome> {
        let analysis = DependencyAnalysis::from_graph(ctx.graph)?;
        if !analysis.missing_dependencies.is_empty() {
            return Ok(PhaseOutcome::failure(format!(
                "{} dependencies reference unknown tasks",
                analysis.missing_dependencies.len()
            )));
        }

        let mut metadata = Metadata::new();
        metadata.insert("total_tasks".to_string(), json!(analysis.total_tasks));
        metadata.insert("level_count".to_string(), json!(analysis.levels.len()));
        metadata.insert(
            "parallel_counts".to_string(),
            json!(analysis.parallel_counts),
        );
        metadata.insert(
            "critical_path".to_string(),
            json!(analysis.critical_path.tasks),
        );
        metadata.insert(
            "critical_path_minutes".to_string(),
            json!(analysis.critical_path_minutes()),
        );
        metadata.insert(
            "total_serial_minutes".to_string(),
            json!(analysis.total_serial_minutes),
        );
        Ok(PhaseOutcome::success_with(metadata, Vec::new()))
    }
}

/// Default handler for `batch_creation`: batches the currently
/// dispatchable tasks.
#[derive(Debug, Default)]
pub struct BatchCreationHandler;

impl PhaseHandler for BatchCreationHandler {
    fn run(&mut self, ctx: &mut PhaseContext<'_>) -> Result<PhaseOutcome> {
        let ready = ctx.dispatchable_tasks();
        let batches = ctx.optimizer.create_batches(&ready);
        let violations: Vec<String> = batches
            .iter()
            .flat_map(|b| {
                ctx.optimizer
                    .validate_batch(b)
                    .into_iter()
                    .map(move |v| format!("batch {}: {}", b.id, v))
            })
            .collect();
        if !violations.is_empty() {
            warn!(count = violations.len(), "planned batches break policy");
        }

        let mut metadata = Metadata::new();
        metadata.insert("batch_count".to_string(), json!(batches.len()));
        metadata.insert(
            "batches".to_string(),
            json!(batches.iter().map(|b| b.task_ids()).collect::<Vec<_>>()),
        );
        metadata.insert(
            "summary".to_string(),
            serde_json::to_value(summarize(&batches))?,
        );
        metadata.insert("violations".to_string(), json!(violations));
        Ok(PhaseOutcome::success_with(metadata, Vec::new()))
    }
}

/// How a run of the phase loop ended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RunOutcome {
    /// Every phase has completed.
    Completed,
    /// Step mode: the next phase waits for confirmation.
    AwaitingConfirmation { next: BuildPhase },
    PausedForBlockers { blockers: Vec<BlockerKind> },
    Paused,
    Stopped,
    Failed { phase: BuildPhase, error: String },
}

impl std::fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunOutcome::Completed => write!(f, "build completed"),
            RunOutcome::AwaitingConfirmation { next } => {
                write!(f, "waiting for confirmation before {}", next)
            }
            RunOutcome::PausedForBlockers { blockers } => {
                let kinds: Vec<String> = blockers.iter().map(|k| k.to_string()).collect();
                write!(f, "paused for blockers: {}", kinds.join(", "))
            }
            RunOutcome::Paused => write!(f, "paused"),
            RunOutcome::Stopped => write!(f, "stopped"),
            RunOutcome::Failed { phase, error } => write!(f, "{} failed: {}", phase, error),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub outcome: RunOutcome,
    pub phases_completed: Vec<BuildPhase>,
    pub checkpoints_created: Vec<CheckpointId>,
    pub progress_percent: f64,
}

/// Composes the planning components and runs the phase loop.
pub struct Orchestrator {
    graph: DependencyGraph,
    queue: TaskQueue,
    phases: PhaseManager,
    checkpoints: CheckpointManager,
    optimizer: BatchOptimizer,
    handlers: HashMap<BuildPhase, Box<dyn PhaseHandler>>,
    gates: HashSet<TaskId>,
    store: Arc<dyn StateStore>,
    max_retries: u32,
    keep_checkpoints: Option<usize>,
}

impl Orchestrator {
    /// Open the orchestrator over a state store, restoring any persisted
    /// queue, phase state, and checkpoints.
    pub fn open(config: &Config, store: Arc<dyn StateStore>) -> Result<Self> {
        let queue = TaskQueue::load(config.max_retries, store.clone());
        let phases = PhaseManager::load(store.clone(), config.continuous);
        let checkpoints = CheckpointManager::load(store.clone())?;

        let mut graph = DependencyGraph::new();
        let records: Vec<TaskRecord> = queue.tasks().iter().map(|t| t.record.clone()).collect();
        if !records.is_empty() {
            graph.build_graph(&records)?;
        }

        let mut handlers: HashMap<BuildPhase, Box<dyn PhaseHandler>> = HashMap::new();
        handlers.insert(
            BuildPhase::DependencyAnalysis,
            Box::new(DependencyAnalysisHandler),
        );
        handlers.insert(BuildPhase::BatchCreation, Box::new(BatchCreationHandler));

        debug!(
            tasks = queue.len(),
            checkpoints = checkpoints.list_checkpoints().len(),
            "orchestrator opened"
        );

        Ok(Self {
            graph,
            queue,
            phases,
            checkpoints,
            optimizer: BatchOptimizer::new(config.batch.clone()),
            handlers,
            gates: config.interruption_gates.iter().cloned().collect(),
            store,
            max_retries: config.max_retries,
            keep_checkpoints: config.keep_checkpoints,
        })
    }

    /// Orchestrator over a volatile store.
    pub fn in_memory(config: &Config) -> Result<Self> {
        Self::open(config, Arc::new(MemoryStore::new()))
    }

    /// Install the handler for `phase`, replacing any default.
    pub fn with_handler(mut self, phase: BuildPhase, handler: impl PhaseHandler + 'static) -> Self {
        self.set_handler(phase, handler);
        self
    }

    pub fn set_handler(&mut self, phase: BuildPhase, handler: impl PhaseHandler + 'static) {
        self.handlers.insert(phase, Box::new(handler));
    }

    /// Replace the optimizer, e.g. to swap its complexity policy.
    pub fn set_optimizer(&mut self, optimizer: BatchOptimizer) {
        self.optimizer = optimizer;
    }

    pub fn graph(&self) -> &DependencyGraph {
        &self.graph
    }

    pub fn queue(&self) -> &TaskQueue {
        &self.queue
    }

    pub fn queue_mut(&mut self) -> &mut TaskQueue {
        &mut self.queue
    }

    pub fn phases(&self) -> &PhaseManager {
        &self.phases
    }

    pub fn checkpoints(&self) -> &CheckpointManager {
        &self.checkpoints
    }

    pub fn optimizer(&self) -> &BatchOptimizer {
        &self.optimizer
    }

    /// Replace the loaded plan with `records`.
    ///
    /// Records are validated as a unit: a bad record, a missing dependency,
    /// or a cycle rejects the whole set and leaves the current plan intact.
    pub fn load_tasks(&mut self, records: Vec<TaskRecord>) -> Result<()> {
        validate_records(&records)?;

        let mut graph = DependencyGraph::new();
        graph.build_graph(&records)?;
        let missing = graph.validate_dependencies();
        if !missing.is_empty() {
            return Err(Error::MissingDependencies(
                missing.into_iter().map(|m| (m.task, m.dependency)).collect(),
            ));
        }

        let mut queue = TaskQueue::new(self.max_retries);
        for record in records {
            queue.add_task(record)?;
        }
        queue.attach_store(self.store.clone())?;

        info!(
            tasks = graph.task_count(),
            dependencies = graph.dependency_count(),
            ready = queue.ready_tasks().len(),
            "tasks loaded"
        );
        self.graph = graph;
        self.queue = queue;
        Ok(())
    }

    pub fn analyze_dependencies(&self) -> Result<DependencyAnalysis> {
        DependencyAnalysis::from_graph(&self.graph)
    }

    /// Up to `max` ready tasks, skipping interruption gates.
    pub fn get_next_parallelizable_batch(&self, max: usize) -> Vec<TaskRecord> {
        self.queue
            .ready_tasks()
            .into_iter()
            .filter(|t| !self.gates.contains(&t.id))
            .take(max)
            .cloned()
            .collect()
    }

    /// Batch the currently dispatchable tasks.
    pub fn plan_batches(&mut self) -> Vec<TaskBatch> {
        let ready = self.get_next_parallelizable_batch(usize::MAX);
        self.optimizer.create_batches(&ready)
    }

    /// Batch every task of one execution level.
    pub fn plan_level_batches(&mut self, level: usize) -> Result<Vec<TaskBatch>> {
        let levels = self.graph.get_execution_levels()?;
        let Some(level) = levels.get(level) else {
            return Err(Error::Validation(format!(
                "Execution level {} out of range (plan has {})",
                level,
                levels.len()
            )));
        };
        let records: Vec<TaskRecord> = level
            .task_ids
            .iter()
            .filter_map(|id| self.graph.get_task(id).cloned())
            .collect();
        Ok(self.optimizer.create_batches(&records))
    }

    /// Run phases until the build completes, stops, blocks, or fails.
    ///
    /// Starts at the first phase that has not completed, so a failed phase
    /// is retried on the next call.
    pub fn run(&mut self) -> Result<RunReport> {
        let mut phases_completed = Vec::new();
        let mut checkpoints_created = Vec::new();

        let outcome = loop {
            match self.phases.run_control() {
                RunControl::Paused => break RunOutcome::Paused,
                RunControl::Stopped => break RunOutcome::Stopped,
                RunControl::Running => {}
            }
            if !self.phases.active_blockers().is_empty() {
                break RunOutcome::PausedForBlockers {
                    blockers: self.active_blocker_kinds(),
                };
            }
            let Some(phase) = self.phases.next_phase() else {
                break RunOutcome::Completed;
            };

            self.phases.start_phase(phase)?;
            match self.invoke(phase) {
                Ok(PhaseOutcome::Success {
                    metadata,
                    created_files,
                }) => {
                    self.phases.complete_phase(metadata.clone())?;
                    let checkpoint = self.checkpoints.create_checkpoint(
                        phase,
                        self.queue.completed_list(),
                        created_files,
                        metadata,
                    )?;
                    checkpoints_created.push(checkpoint.id);
                    phases_completed.push(phase);

                    let Some(next) = phase.next() else {
                        break RunOutcome::Completed;
                    };
                    if !self.phases.should_continue() {
                        break match self.phases.run_control() {
                            RunControl::Paused => RunOutcome::Paused,
                            RunControl::Stopped => RunOutcome::Stopped,
                            RunControl::Running => RunOutcome::AwaitingConfirmation { next },
                        };
                    }
                }
                Ok(PhaseOutcome::Blocked { kind, description }) => {
                    self.phases.add_blocker(kind, &description, Metadata::new())?;
                    break RunOutcome::PausedForBlockers {
                        blockers: self.active_blocker_kinds(),
                    };
                }
                Ok(PhaseOutcome::Failure { error }) | Err(error) => {
                    self.phases.fail_phase(&error, Metadata::new())?;
                    break RunOutcome::Failed { phase, error };
                }
            }
        };

        if let Some(keep) = self.keep_checkpoints {
            self.checkpoints.prune(keep)?;
        }

        let report = RunReport {
            outcome,
            phases_completed,
            checkpoints_created,
            progress_percent: self.phases.progress_percent(),
        };
        info!(
            outcome = %report.outcome,
            phases = report.phases_completed.len(),
            progress = report.progress_percent,
            "run finished"
        );
        Ok(report)
    }

    /// Run the handler for `phase`, turning errors and panics into a
    /// failure message.
    fn invoke(&mut self, phase: BuildPhase) -> std::result::Result<PhaseOutcome, String> {
        let Some(handler) = self.handlers.get_mut(&phase) else {
            debug!(phase = %phase, "no handler, passing through");
            return Ok(PhaseOutcome::success());
        };

        let mut ctx = PhaseContext {
            phase,
            graph: &self.graph,
            queue: &mut self.queue,
            optimizer: &mut self.optimizer,
            gates: &self.gates,
        };

        match catch_unwind(AssertUnwindSafe(|| handler.run(&mut ctx))) {
            Ok(Ok(outcome)) => Ok(outcome),
            Ok(Err(e)) => Err(e.to_string()),
            Err(payload) => Err(format!("handler panicked: {}", panic_message(&*payload))),
        }
    }

    fn active_blocker_kinds(&self) -> Vec<BlockerKind> {
        let mut kinds = Vec::new();
        for blocker in self.phases.active_blockers() {
            if !kinds.contains(&blocker.kind) {
                kinds.push(blocker.kind);
            }
        }
        kinds
    }

    // ========== Control ==========

    pub fn pause(&mut self) -> Result<()> {
        self.phases.pause()
    }

    pub fn resume(&mut self) -> Result<()> {
        self.phases.resume()
    }

    pub fn stop(&mut self) -> Result<()> {
        self.phases.stop()
    }

    pub fn set_continuous_mode(&mut self, enabled: bool) -> Result<()> {
        self.phases.set_continuous_mode(enabled)
    }

    pub fn add_blocker(&mut self, kind: BlockerKind, description: &str) -> Result<()> {
        self.phases.add_blocker(kind, description, Metadata::new())
    }

    pub fn clear_blocker(&mut self, kind: BlockerKind) -> Result<usize> {
        self.phases.clear_blocker(kind)
    }

    /// Record a checkpoint for the current phase outside the loop.
    pub fn create_checkpoint(&mut self, metadata: Metadata) -> Result<Checkpoint> {
        let phase = self
            .phases
            .current_phase()
            .ok_or_else(|| Error::Validation("No phase has been started".to_string()))?;
        self.checkpoints
            .create_checkpoint(phase, self.queue.completed_list(), Vec::new(), metadata)
    }

    /// Drop all but the latest `keep` checkpoints.
    pub fn prune_checkpoints(&mut self, keep: usize) -> Result<usize> {
        self.checkpoints.prune(keep)
    }

    /// Roll the build back to a checkpoint.
    ///
    /// Tasks completed after the checkpoint return to pending and every
    /// phase after the checkpoint's phase is reset.
    pub fn rollback_to_checkpoint(&mut self, id: &CheckpointId) -> Result<RollbackResult> {
        let checkpoint = self
            .checkpoints
            .get_checkpoint(id)
            .cloned()
            .ok_or_else(|| Error::CheckpointNotFound(id.to_string()))?;

        let result = self.checkpoints.rollback(id)?;
        let completed: HashSet<TaskId> = checkpoint.completed_tasks.iter().cloned().collect();
        self.queue.restore_completed(&completed)?;
        if let Some(next) = checkpoint.phase.next() {
            self.phases.reset_from(next)?;
        }

        info!(
            checkpoint = %id.short(),
            phase = %checkpoint.phase,
            files = result.files_to_rollback.len(),
            "build rolled back"
        );
        Ok(result)
    }

    pub fn status(&self) -> StatusReport {
        self.phases.status_report()
    }
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("graph", &self.graph)
            .field("queue", &self.queue)
            .field("phases", &self.phases)
            .field("handlers", &self.handlers.len())
            .finish()
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
