//! Durable planner state.
//!
//! This module provides the key/value store every component persists
//! through, and the checkpoint log built on top of it.

pub mod checkpoint;
pub mod store;

pub use checkpoint::{
    Checkpoint, CheckpointId, CheckpointManager, CheckpointStatus, ResumeSnapshot, RollbackResult,
};
pub use store::{load_json, save_json, FileStore, MemoryStore, StateStore};
