//! Build phase type definitions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::Error;

/// Free-form JSON metadata attached to phases, blockers, and checkpoints.
pub type Metadata = serde_json::Map<String, serde_json::Value>;

/// Phases of a build, in execution order.
///
/// 1. SpecParsing - read the requirements into structured form
/// 2. TaskDecomposition - break requirements into task records
/// 3. DependencyAnalysis - build the graph, levels, and critical path
/// 4. BatchCreation - group ready tasks into batches
/// 5. CodeGeneration - execute batches
/// 6. TestExecution - run the test suites
/// 7. QualityVerification - review and lint
/// 8. Documentation - final write-up; completes the build
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildPhase {
    SpecParsing,
    TaskDecomposition,
    DependencyAnalysis,
    BatchCreation,
    CodeGeneration,
    TestExecution,
    QualityVerification,
    Documentation,
}

impl BuildPhase {
    /// Every phase in execution order.
    pub const ALL: [BuildPhase; 8] = [
        BuildPhase::SpecParsing,
        BuildPhase::TaskDecomposition,
        BuildPhase::DependencyAnalysis,
        BuildPhase::BatchCreation,
        BuildPhase::CodeGeneration,
        BuildPhase::TestExecution,
        BuildPhase::QualityVerification,
        BuildPhase::Documentation,
    ];

    /// Position in the fixed order.
    pub fn index(self) -> usize {
        self as usize
    }

    /// The following phase, or `None` after documentation.
    pub fn next(self) -> Option<BuildPhase> {
        Self::ALL.get(self.index() + 1).copied()
    }

    pub fn is_last(self) -> bool {
        self == BuildPhase::Documentation
    }
}

impl std::fmt::Display for BuildPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BuildPhase::SpecParsing => write!(f, "spec_parsing"),
            BuildPhase::TaskDecomposition => write!(f, "task_decomposition"),
            BuildPhase::DependencyAnalysis => write!(f, "dependency_analysis"),
            BuildPhase::BatchCreation => write!(f, "batch_creation"),
            BuildPhase::CodeGeneration => write!(f, "code_generation"),
            BuildPhase::TestExecution => write!(f, "test_execution"),
            BuildPhase::QualityVerification => write!(f, "quality_verification"),
            BuildPhase::Documentation => write!(f, "documentation"),
        }
    }
}

impl std::str::FromStr for BuildPhase {
    type Err = Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        BuildPhase::ALL
            .iter()
            .copied()
            .find(|p| p.to_string() == s)
            .ok_or_else(|| Error::Validation(format!("Unknown phase: {}", s)))
    }
}

/// Status of a single phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PhaseStatus {
    #[default]
    Pending,
    InProgress,
    Completed,
    Failed,
    Blocked,
}

impl std::fmt::Display for PhaseStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PhaseStatus::Pending => write!(f, "pending"),
            PhaseStatus::InProgress => write!(f, "in_progress"),
            PhaseStatus::Completed => write!(f, "completed"),
            PhaseStatus::Failed => write!(f, "failed"),
            PhaseStatus::Blocked => write!(f, "blocked"),
        }
    }
}

/// Conditions that halt the build until cleared.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockerKind {
    MissingCredentials,
    TestFailures,
    UserIntervention,
    CompilationError,
    ResourceConstraint,
}

impl BlockerKind {
    pub const ALL: [BlockerKind; 5] = [
        BlockerKind::MissingCredentials,
        BlockerKind::TestFailures,
        BlockerKind::UserIntervention,
        BlockerKind::CompilationError,
        BlockerKind::ResourceConstraint,
    ];
}

impl std::fmt::Display for BlockerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BlockerKind::MissingCredentials => write!(f, "missing_credentials"),
            BlockerKind::TestFailures => write!(f, "test_failures"),
            BlockerKind::UserIntervention => write!(f, "user_intervention"),
            BlockerKind::CompilationError => write!(f, "compilation_error"),
            BlockerKind::ResourceConstraint => write!(f, "resource_constraint"),
        }
    }
}

impl std::str::FromStr for BlockerKind {
    type Err = Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        BlockerKind::ALL
            .iter()
            .copied()
            .find(|k| k.to_string() == s)
            .ok_or_else(|| Error::Validation(format!("Unknown blocker kind: {}", s)))
    }
}

/// A detected blocking condition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Blocker {
    pub kind: BlockerKind,
    /// Phase that was current when the blocker was raised.
    pub phase: Option<BuildPhase>,
    pub description: String,
    pub detected_at: DateTime<Utc>,
    #[serde(default)]
    pub metadata: Metadata,
}

/// Recorded state of one phase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseRecord {
    pub phase: BuildPhase,
    #[serde(default)]
    pub status: PhaseStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_seconds: Option<f64>,
    pub error: Option<String>,
    /// Every blocker raised while this phase was current.
    #[serde(default)]
    pub blockers: Vec<Blocker>,
    #[serde(default)]
    pub metadata: Metadata,
}

impl PhaseRecord {
    pub fn new(phase: BuildPhase) -> Self {
        Self {
            phase,
            status: PhaseStatus::Pending,
            started_at: None,
            completed_at: None,
            duration_seconds: None,
            error: None,
            blockers: Vec::new(),
            metadata: Metadata::new(),
        }
    }
}

/// Operator control over the driving loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RunControl {
    #[default]
    Running,
    Paused,
    Stopped,
}

impl std::fmt::Display for RunControl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunControl::Running => write!(f, "running"),
            RunControl::Paused => write!(f, "paused"),
            RunControl::Stopped => write!(f, "stopped"),
        }
    }
}

/// Durable state of the whole build.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildState {
    pub current_phase: Option<BuildPhase>,
    /// One record per phase, in phase order.
    pub phases: Vec<PhaseRecord>,
    #[serde(default)]
    pub active_blockers: Vec<Blocker>,
    pub build_started_at: Option<DateTime<Utc>>,
    pub build_completed_at: Option<DateTime<Utc>>,
    pub continuous_mode: bool,
    #[serde(default)]
    pub run_control: RunControl,
}

impl BuildState {
    pub fn new(continuous_mode: bool) -> Self {
        Self {
            current_phase: None,
            phases: BuildPhase::ALL.iter().copied().map(PhaseRecord::new).collect(),
            active_blockers: Vec::new(),
            build_started_at: None,
            build_completed_at: None,
            continuous_mode,
            run_control: RunControl::Running,
        }
    }

    pub fn record(&self, phase: BuildPhase) -> &PhaseRecord {
        &self.phases[phase.index()]
    }

    pub fn record_mut(&mut self, phase: BuildPhase) -> &mut PhaseRecord {
        &mut self.phases[phase.index()]
    }

    /// Check that the phase list has one record per phase in order.
    pub fn is_well_formed(&self) -> bool {
        self.phases.len() == BuildPhase::ALL.len()
            && self
                .phases
                .iter()
                .zip(BuildPhase::ALL.iter())
                .all(|(record, phase)| record.phase == *phase)
    }
}
