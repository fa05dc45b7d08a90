//! Checkpoints: immutable snapshots of build progress.
//!
//! Each checkpoint is its own record under `checkpoints/<id>`, with an
//! ordered id list under `checkpoints/index`. Rollback is logical: it marks
//! checkpoints and reports the files recorded after the target, but never
//! touches the file system itself.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::core::task::TaskId;
use crate::state::store::{load_json, save_json, StateStore};
use crate::workflow::{BuildPhase, Metadata};
use crate::{Error, Result};

const CHECKPOINT_PREFIX: &str = "checkpoints/";
const INDEX_KEY: &str = "checkpoints/index";

/// Unique, time-ordered checkpoint identifier (UUID v7).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CheckpointId(pub Uuid);

impl CheckpointId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    /// Return first 8 characters of the UUID for display.
    pub fn short(&self) -> String {
        self.0.to_string()[..8].to_string()
    }

    fn key(&self) -> String {
        format!("{}{}", CHECKPOINT_PREFIX, self.0)
    }
}

impl Default for CheckpointId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for CheckpointId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for CheckpointId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointStatus {
    #[default]
    Created,
    /// The state the build was last rolled back to.
    Active,
    /// Superseded by a rollback to an earlier checkpoint.
    RolledBack,
}

impl std::fmt::Display for CheckpointStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CheckpointStatus::Created => write!(f, "created"),
            CheckpointStatus::Active => write!(f, "active"),
            CheckpointStatus::RolledBack => write!(f, "rolled_back"),
        }
    }
}

/// A snapshot of progress at the end of a phase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub id: CheckpointId,
    pub phase: BuildPhase,
    pub created_at: DateTime<Utc>,
    pub completed_tasks: Vec<TaskId>,
    pub created_files: Vec<String>,
    #[serde(default)]
    pub status: CheckpointStatus,
    #[serde(default)]
    pub metadata: Metadata,
}

/// Outcome of a rollback.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RollbackResult {
    pub target: CheckpointId,
    pub phase: BuildPhase,
    /// Checkpoints marked rolled back, oldest first.
    pub rolled_back: Vec<CheckpointId>,
    /// Files created after the target; the caller decides what to do with them.
    pub files_to_rollback: Vec<String>,
}

/// Everything needed to resume from a checkpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResumeSnapshot {
    pub checkpoint_id: CheckpointId,
    pub phase: BuildPhase,
    pub completed_tasks: Vec<TaskId>,
    pub created_files: Vec<String>,
    pub metadata: Metadata,
}

/// Owns the append-only checkpoint log.
pub struct CheckpointManager {
    store: Arc<dyn StateStore>,
    checkpoints: Vec<Checkpoint>,
}

impl CheckpointManager {
    /// Load every readable checkpoint from the store.
    ///
    /// Unreadable records are skipped with a warning.
    pub fn load(store: Arc<dyn StateStore>) -> Result<Self> {
        let ids = match load_json::<Vec<CheckpointId>>(store.as_ref(), INDEX_KEY) {
            Ok(Some(ids)) => ids,
            Ok(None) => Vec::new(),
            Err(e) => {
                warn!(error = %e, "checkpoint index unreadable, rebuilding from records");
                Self::scan_ids(store.as_ref())?
            }
        };

        let mut checkpoints = Vec::with_capacity(ids.len());
        for id in ids {
            match load_json::<Checkpoint>(store.as_ref(), &id.key()) {
                Ok(Some(checkpoint)) => checkpoints.push(checkpoint),
                Ok(None) => warn!(checkpoint = %id, "checkpoint record missing, skipping"),
                Err(e) => warn!(checkpoint = %id, error = %e, "checkpoint unreadable, skipping"),
            }
        }

        debug!(count = checkpoints.len(), "loaded checkpoints");
        Ok(Self { store, checkpoints })
    }

    fn scan_ids(store: &dyn StateStore) -> Result<Vec<CheckpointId>> {
        let mut ids: Vec<CheckpointId> = store
            .list(CHECKPOINT_PREFIX)?
            .iter()
            .filter_map(|key| key.strip_prefix(CHECKPOINT_PREFIX))
            .filter_map(|name| name.parse().ok())
            .collect();
        ids.sort();
        Ok(ids)
    }

    fn save_index(&self) -> Result<()> {
        let ids: Vec<CheckpointId> = self.checkpoints.iter().map(|c| c.id).collect();
        save_json(self.store.as_ref(), INDEX_KEY, &ids)
    }

    /// Record a new checkpoint and persist it immediately.
    pub fn create_checkpoint(
        &mut self,
        phase: BuildPhase,
        completed_tasks: Vec<TaskId>,
        created_files: Vec<String>,
        metadata: Metadata,
    ) -> Result<Checkpoint> {
        let checkpoint = Checkpoint {
            id: CheckpointId::new(),
            phase,
            created_at: Utc::now(),
            completed_tasks,
            created_files,
            status: CheckpointStatus::Created,
            metadata,
        };

        let bytes = serde_json::to_vec_pretty(&checkpoint)?;
        self.store.put(&checkpoint.id.key(), &bytes)?;
        self.checkpoints.push(checkpoint.clone());
        self.save_index()?;

        info!(
            checkpoint = %checkpoint.id.short(),
            phase = %phase,
            tasks = checkpoint.completed_tasks.len(),
            files = checkpoint.created_files.len(),
            "checkpoint created"
        );
        Ok(checkpoint)
    }

    /// All checkpoints, oldest first.
    pub fn list_checkpoints(&self) -> &[Checkpoint] {
        &self.checkpoints
    }

    /// Most recent checkpoint that has not been rolled back.
    pub fn get_latest_checkpoint(&self) -> Option<&Checkpoint> {
        self.checkpoints
            .iter()
            .rev()
            .find(|c| c.status != CheckpointStatus::RolledBack)
    }

    pub fn get_checkpoint(&self, id: &CheckpointId) -> Option<&Checkpoint> {
        self.checkpoints.iter().find(|c| c.id == *id)
    }

    /// Resolve a full id or a unique id prefix.
    pub fn find(&self, prefix: &str) -> Result<&Checkpoint> {
        let matches: Vec<&Checkpoint> = self
            .checkpoints
            .iter()
            .filter(|c| c.id.to_string().starts_with(prefix))
            .collect();
        match matches.as_slice() {
            [single] if !prefix.is_empty() => Ok(*single),
            _ => Err(Error::CheckpointNotFound(prefix.to_string())),
        }
    }

    fn position(&self, id: &CheckpointId) -> Result<usize> {
        self.checkpoints
            .iter()
            .position(|c| c.id == *id)
            .ok_or_else(|| Error::CheckpointNotFound(id.to_string()))
    }

    /// Files recorded by checkpoints after `id`, deduplicated in first-seen
    /// order.
    ///
    /// A file that `id` itself recorded is never listed, even when a later
    /// checkpoint records it again: it already existed at the rollback
    /// target, so rolling back must keep it.
    pub fn get_files_to_rollback(&self, id: &CheckpointId) -> Result<Vec<String>> {
        let pos = self.position(id)?;
        let kept: HashSet<&String> = self.checkpoints[pos].created_files.iter().collect();
        let mut seen: HashSet<&String> = HashSet::new();
        let mut files = Vec::new();

        for checkpoint in &self.checkpoints[pos + 1..] {
            for file in &checkpoint.created_files {
                if !kept.contains(file) && seen.insert(file) {
                    files.push(file.clone());
                }
            }
        }
        Ok(files)
    }

    /// Mark `id` active and every later checkpoint rolled back.
    pub fn rollback(&mut self, id: &CheckpointId) -> Result<RollbackResult> {
        let pos = self.position(id)?;
        let files_to_rollback = self.get_files_to_rollback(id)?;

        let mut rolled_back = Vec::new();
        let mut changed = Vec::new();
        for (i, checkpoint) in self.checkpoints.iter_mut().enumerate() {
            let status = if i == pos {
                CheckpointStatus::Active
            } else if i > pos {
                CheckpointStatus::RolledBack
            } else if checkpoint.status == CheckpointStatus::Active {
                CheckpointStatus::Created
            } else {
                continue;
            };
            if i > pos && checkpoint.status != CheckpointStatus::RolledBack {
                rolled_back.push(checkpoint.id);
            }
            if checkpoint.status != status {
                checkpoint.status = status;
                changed.push(i);
            }
        }

        for i in changed {
            save_json(
                self.store.as_ref(),
                &self.checkpoints[i].id.key(),
                &self.checkpoints[i],
            )?;
        }

        let target = &self.checkpoints[pos];
        info!(
            checkpoint = %target.id.short(),
            phase = %target.phase,
            rolled_back = rolled_back.len(),
            files = files_to_rollback.len(),
            "rolled back to checkpoint"
        );

        Ok(RollbackResult {
            target: target.id,
            phase: target.phase,
            rolled_back,
            files_to_rollback,
        })
    }

    /// Snapshot of `id`, or of the latest checkpoint when `id` is `None`.
    pub fn resume_from_checkpoint(&self, id: Option<&CheckpointId>) -> Result<ResumeSnapshot> {
        let checkpoint = match id {
            Some(id) => self
                .get_checkpoint(id)
                .ok_or_else(|| Error::CheckpointNotFound(id.to_string()))?,
            None => self.get_latest_checkpoint().ok_or(Error::NoCheckpoints)?,
        };

        Ok(ResumeSnapshot {
            checkpoint_id: checkpoint.id,
            phase: checkpoint.phase,
            completed_tasks: checkpoint.completed_tasks.clone(),
            created_files: checkpoint.created_files.clone(),
            metadata: checkpoint.metadata.clone(),
        })
    }

    /// Drop all but the newest `keep_latest` checkpoints. Returns how many
    /// records were removed.
    pub fn prune(&mut self, keep_latest: usize) -> Result<usize> {
        if self.checkpoints.len() <= keep_latest {
            return Ok(0);
        }
        let excess = self.checkpoints.len() - keep_latest;
        let removed: Vec<Checkpoint> = self.checkpoints.drain(..excess).collect();
        for checkpoint in &removed {
            self.store.remove(&checkpoint.id.key())?;
        }
        self.save_index()?;
        info!(removed = removed.len(), kept = keep_latest, "pruned checkpoints");
        Ok(removed.len())
    }
}

impl std::fmt::Debug for CheckpointManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CheckpointManager")
            .field("checkpoints", &self.checkpoints.len())
            .finish()
    }
}
