//! Spindle Store
//!
//! Snapshot persistence for workflow runs. A [`Snapshot`] is the serialized
//! state of one run; the engine saves it after every step transition and
//! loads it again to resume.
//!
//! The [`SnapshotStore`] trait is the storage contract:
//! - `save` upserts the snapshot of a run
//! - `load` fetches it back, or fails with [`Error::NotFound`]
//! - `list_runs` summarizes the runs of a workflow, newest first
//!
//! [`InMemoryStore`] and [`SqliteStore`] implement it.

mod memory;
mod sqlite;
mod types;

pub use memory::InMemoryStore;
pub use sqlite::SqliteStore;
pub use types::{
  ControlState, Failure, ItemRecord, RunStatus, RunSummary, Snapshot, StepRecord, StepStatus,
  ValidationStage,
};

use async_trait::async_trait;

/// Error type for storage operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
  /// No snapshot exists for the run.
  #[error("no snapshot for run '{run_id}' of workflow '{workflow_id}'")]
  NotFound { workflow_id: String, run_id: String },

  /// A database error occurred.
  #[error("database error: {0}")]
  Database(#[from] sqlx::Error),

  #[error("snapshot serialization error: {0}")]
  Serialization(#[from] serde_json::Error),

  #[error("migration error: {0}")]
  Migrate(#[from] sqlx::migrate::MigrateError),
}

/// Durable storage for run snapshots.
///
/// Implementations must allow concurrent saves and loads for different runs.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
  /// Insert or replace the snapshot of a run.
  async fn save(&self, workflow_id: &str, run_id: &str, snapshot: &Snapshot) -> Result<(), Error>;

  /// Load the latest snapshot of a run.
  async fn load(&self, workflow_id: &str, run_id: &str) -> Result<Snapshot, Error>;

  /// Summaries of a workflow's runs, most recently updated first.
  async fn list_runs(&self, workflow_id: &str, limit: Option<usize>)
  -> Result<Vec<RunSummary>, Error>;
}
