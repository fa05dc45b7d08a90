//! Phase manager: drives the fixed phase sequence and tracks blockers.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::state::store::{load_json, save_json, StateStore};
use crate::workflow::types::{
    Blocker, BlockerKind, BuildPhase, BuildState, Metadata, PhaseRecord, PhaseStatus, RunControl,
};
use crate::{Error, Result};

/// Store key of the persisted build state.
pub const PHASE_STATE_KEY: &str = "phase_state";

/// Snapshot of build progress for presentation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusReport {
    pub current_phase: Option<BuildPhase>,
    pub current_status: Option<PhaseStatus>,
    pub completed_phases: usize,
    pub total_phases: usize,
    pub progress_percent: f64,
    pub active_blockers: Vec<String>,
    pub continuous_mode: bool,
    pub run_control: RunControl,
    pub build_started_at: Option<DateTime<Utc>>,
    pub build_completed_at: Option<DateTime<Utc>>,
}

impl std::fmt::Display for StatusReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (self.current_phase, self.current_status) {
            (Some(phase), Some(status)) => writeln!(f, "Phase:    {} ({})", phase, status)?,
            _ => writeln!(f, "Phase:    not started")?,
        }
        writeln!(
            f,
            "Progress: {}/{} phases ({:.1}%)",
            self.completed_phases, self.total_phases, self.progress_percent
        )?;
        writeln!(
            f,
            "Mode:     {} ({})",
            if self.continuous_mode {
                "continuous"
            } else {
                "step"
            },
            self.run_control
        )?;
        if self.active_blockers.is_empty() {
            write!(f, "Blockers: none")
        } else {
            write!(f, "Blockers: {}", self.active_blockers.join(", "))
        }
    }
}

/// Owns the build state and persists it after every mutation.
pub struct PhaseManager {
    state: BuildState,
    store: Option<Arc<dyn StateStore>>,
}

impl PhaseManager {
    /// Fresh in-memory state.
    pub fn new(continuous_mode: bool) -> Self {
        Self {
            state: BuildState::new(continuous_mode),
            store: None,
        }
    }

    /// Load persisted state, falling back to fresh state when the record is
    /// missing, unreadable, or malformed.
    pub fn load(store: Arc<dyn StateStore>, continuous_mode: bool) -> Self {
        let state = match load_json::<BuildState>(store.as_ref(), PHASE_STATE_KEY) {
            Ok(Some(state)) if state.is_well_formed() => {
                debug!(current = ?state.current_phase, "restored phase state");
                state
            }
            Ok(Some(_)) => {
                warn!("persisted phase state is malformed, starting fresh");
                BuildState::new(continuous_mode)
            }
            Ok(None) => BuildState::new(continuous_mode),
            Err(e) => {
                warn!(error = %e, "phase state unreadable, starting fresh");
                BuildState::new(continuous_mode)
            }
        };
        Self {
            state,
            store: Some(store),
        }
    }

    pub fn state(&self) -> &BuildState {
        &self.state
    }

    pub fn current_phase(&self) -> Option<BuildPhase> {
        self.state.current_phase
    }

    pub fn phase_record(&self, phase: BuildPhase) -> &PhaseRecord {
        self.state.record(phase)
    }

    pub fn phase_status(&self, phase: BuildPhase) -> PhaseStatus {
        self.state.record(phase).status
    }

    pub fn active_blockers(&self) -> &[Blocker] {
        &self.state.active_blockers
    }

    pub fn run_control(&self) -> RunControl {
        self.state.run_control
    }

    pub fn is_continuous(&self) -> bool {
        self.state.continuous_mode
    }

    /// Whether the final phase has completed.
    pub fn is_complete(&self) -> bool {
        self.phase_status(BuildPhase::Documentation) == PhaseStatus::Completed
    }

    fn persist(&self) -> Result<()> {
        match &self.store {
            Some(store) => save_json(store.as_ref(), PHASE_STATE_KEY, &self.state),
            None => Ok(()),
        }
    }

    fn require_current(&self) -> Result<BuildPhase> {
        self.state
            .current_phase
            .ok_or_else(|| Error::Validation("No phase has been started".to_string()))
    }

    /// Begin a phase.
    ///
    /// # Errors
    /// Returns `Error::PhaseBlocked` while any blocker is active; the state
    /// is left untouched.
    pub fn start_phase(&mut self, phase: BuildPhase) -> Result<()> {
        if !self.state.active_blockers.is_empty() {
            let blockers = self
                .state
                .active_blockers
                .iter()
                .map(|b| b.kind.to_string())
                .collect();
            return Err(Error::PhaseBlocked {
                phase: phase.to_string(),
                blockers,
            });
        }

        let now = Utc::now();
        let record = self.state.record_mut(phase);
        record.status = PhaseStatus::InProgress;
        record.started_at = Some(now);
        record.completed_at = None;
        record.duration_seconds = None;
        record.error = None;

        if self.state.build_started_at.is_none() {
            self.state.build_started_at = Some(now);
        }
        self.state.current_phase = Some(phase);

        info!(phase = %phase, "phase started");
        self.persist()
    }

    /// Complete the current phase, merging `metadata` into its record.
    ///
    /// Returns the phase that was completed.
    pub fn complete_phase(&mut self, metadata: Metadata) -> Result<BuildPhase> {
        let phase = self.require_current()?;
        let now = Utc::now();

        let record = self.state.record_mut(phase);
        record.duration_seconds = record
            .started_at
            .map(|started| (now - started).num_milliseconds() as f64 / 1000.0);
        record.metadata.extend(metadata);
        record.status = PhaseStatus::Completed;
        record.completed_at = Some(now);
        let duration = record.duration_seconds;

        if phase.is_last() {
            self.state.build_completed_at = Some(now);
            info!("build completed");
        }

        info!(phase = %phase, duration_seconds = ?duration, "phase completed");
        self.persist()?;
        Ok(phase)
    }

    /// Mark the current phase failed. Does not advance.
    pub fn fail_phase(&mut self, error: &str, metadata: Metadata) -> Result<BuildPhase> {
        let phase = self.require_current()?;
        let now = Utc::now();

        let record = self.state.record_mut(phase);
        record.status = PhaseStatus::Failed;
        record.error = Some(error.to_string());
        record.completed_at = Some(now);
        record.duration_seconds = record
            .started_at
            .map(|started| (now - started).num_milliseconds() as f64 / 1000.0);
        record.metadata.extend(metadata);

        warn!(phase = %phase, error, "phase failed");
        self.persist()?;
        Ok(phase)
    }

    /// Record an active blocker. The current phase becomes blocked unless it
    /// has already completed; the blocker still halts the next `start_phase`.
    pub fn add_blocker(
        &mut self,
        kind: BlockerKind,
        description: &str,
        metadata: Metadata,
    ) -> Result<()> {
        let blocker = Blocker {
            kind,
            phase: self.state.current_phase,
            description: description.to_string(),
            detected_at: Utc::now(),
            metadata,
        };

        if let Some(phase) = self.state.current_phase {
            let record = self.state.record_mut(phase);
            record.blockers.push(blocker.clone());
            if record.status != PhaseStatus::Completed {
                record.status = PhaseStatus::Blocked;
            }
        }
        self.state.active_blockers.push(blocker);

        warn!(kind = %kind, phase = ?self.state.current_phase, description, "blocker added");
        self.persist()
    }

    /// Remove every active blocker of `kind`. Returns how many were removed.
    ///
    /// Once no blockers remain, a blocked current phase resumes.
    pub fn clear_blocker(&mut self, kind: BlockerKind) -> Result<usize> {
        let before = self.state.active_blockers.len();
        self.state.active_blockers.retain(|b| b.kind != kind);
        let removed = before - self.state.active_blockers.len();

        if removed > 0 && self.state.active_blockers.is_empty() {
            if let Some(phase) = self.state.current_phase {
                let record = self.state.record_mut(phase);
                if record.status == PhaseStatus::Blocked {
                    record.status = PhaseStatus::InProgress;
                }
            }
        }

        info!(kind = %kind, removed, remaining = self.state.active_blockers.len(), "blocker cleared");
        self.persist()?;
        Ok(removed)
    }

    /// Current phase completed and nothing is blocking.
    pub fn can_proceed(&self) -> bool {
        match self.state.current_phase {
            Some(phase) => {
                self.phase_status(phase) == PhaseStatus::Completed
                    && self.state.active_blockers.is_empty()
            }
            None => false,
        }
    }

    /// Whether the driving loop should start the next phase unattended.
    pub fn should_continue(&self) -> bool {
        self.can_proceed()
            && self.state.continuous_mode
            && self.state.run_control == RunControl::Running
    }

    /// First phase in order that has not completed.
    pub fn next_phase(&self) -> Option<BuildPhase> {
        BuildPhase::ALL
            .iter()
            .copied()
            .find(|p| self.phase_status(*p) != PhaseStatus::Completed)
    }

    pub fn completed_phases(&self) -> usize {
        self.state
            .phases
            .iter()
            .filter(|p| p.status == PhaseStatus::Completed)
            .count()
    }

    /// Completed phases over all phases, as a percentage.
    pub fn progress_percent(&self) -> f64 {
        self.completed_phases() as f64 / BuildPhase::ALL.len() as f64 * 100.0
    }

    pub fn status_report(&self) -> StatusReport {
        StatusReport {
            current_phase: self.state.current_phase,
            current_status: self.state.current_phase.map(|p| self.phase_status(p)),
            completed_phases: self.completed_phases(),
            total_phases: BuildPhase::ALL.len(),
            progress_percent: self.progress_percent(),
            active_blockers: self
                .state
                .active_blockers
                .iter()
                .map(|b| format!("{}: {}", b.kind, b.description))
                .collect(),
            continuous_mode: self.state.continuous_mode,
            run_control: self.state.run_control,
            build_started_at: self.state.build_started_at,
            build_completed_at: self.state.build_completed_at,
        }
    }

    pub fn set_continuous_mode(&mut self, enabled: bool) -> Result<()> {
        self.state.continuous_mode = enabled;
        debug!(enabled, "continuous mode set");
        self.persist()
    }

    fn set_run_control(&mut self, control: RunControl) -> Result<()> {
        self.state.run_control = control;
        info!(control = %control, "run control changed");
        self.persist()
    }

    pub fn pause(&mut self) -> Result<()> {
        self.set_run_control(RunControl::Paused)
    }

    pub fn resume(&mut self) -> Result<()> {
        self.set_run_control(RunControl::Running)
    }

    pub fn stop(&mut self) -> Result<()> {
        self.set_run_control(RunControl::Stopped)
    }

    /// Return `phase` and every later phase to pending.
    ///
    /// The current phase moves back to the phase before `phase`.
    pub fn reset_from(&mut self, phase: BuildPhase) -> Result<()> {
        for later in BuildPhase::ALL.iter().copied().filter(|p| *p >= phase) {
            *self.state.record_mut(later) = PhaseRecord::new(later);
        }
        self.state.current_phase = phase
            .index()
            .checked_sub(1)
            .map(|prev| BuildPhase::ALL[prev]);
        self.state.build_completed_at = None;

        info!(phase = %phase, "phases reset");
        self.persist()
    }
}

impl std::fmt::Debug for PhaseManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PhaseManager")
            .field("current_phase", &self.state.current_phase)
            .field("blockers", &self.state.active_blockers.len())
            .field("persistent", &self.store.is_some())
            .finish()
    }
}
