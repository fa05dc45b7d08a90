//! Build phase tracking.
//!
//! This module provides the fixed phase sequence of a build, the blockers
//! that can halt it, and the manager that persists phase state.

pub mod manager;
mod types;

pub use manager::{PhaseManager, StatusReport, PHASE_STATE_KEY};
pub use types::{
    Blocker, BlockerKind, BuildPhase, BuildState, Metadata, PhaseRecord, PhaseStatus, RunControl,
};
