//! Workflow runtime.

use std::sync::Arc;

use spindle_store::{RunSummary, Snapshot, SnapshotStore};
use spindle_workflow::{Resources, Workflow};
use tracing::debug;

use crate::error::EngineError;
use crate::run::Run;

/// Configuration for the workflow runtime.
#[derive(Debug, Clone, Default)]
pub struct RuntimeConfig {
  /// Stop a `parallel` node as soon as one child fails. Siblings still
  /// running are failed with an abort reason. When unset every child runs to
  /// completion before the failure is reported.
  pub fail_fast: bool,
}

/// The workflow runtime.
///
/// Owns a committed workflow together with the snapshot store its runs are
/// persisted to, and hands out [`Run`] handles.
pub struct WorkflowRuntime {
  workflow: Arc<Workflow>,
  store: Arc<dyn SnapshotStore>,
  resources: Resources,
  config: RuntimeConfig,
}

impl WorkflowRuntime {
  pub fn new(workflow: impl Into<Arc<Workflow>>, store: Arc<dyn SnapshotStore>) -> Self {
    Self {
      workflow: workflow.into(),
      store,
      resources: Resources::default(),
      config: RuntimeConfig::default(),
    }
  }

  #[must_use]
  pub fn with_config(mut self, config: RuntimeConfig) -> Self {
    self.config = config;
    self
  }

  /// Capabilities handed to every step through its context.
  #[must_use]
  pub fn with_resources(mut self, resources: Resources) -> Self {
    self.resources = resources;
    self
  }

  /// Get a reference to the workflow.
  pub fn workflow(&self) -> &Workflow {
    &self.workflow
  }

  pub fn config(&self) -> &RuntimeConfig {
    &self.config
  }

  /// Allocate a new run with a fresh id. Nothing is persisted until it starts.
  pub fn create_run(&self) -> Run {
    self.create_run_with_id(uuid::Uuid::new_v4().to_string())
  }

  pub fn create_run_with_id(&self, run_id: impl Into<String>) -> Run {
    let snapshot = Snapshot::new(self.workflow.id(), run_id);
    debug!(workflow_id = %self.workflow.id(), run_id = %snapshot.run_id, "run_created");
    self.handle(snapshot)
  }

  /// Rebuild a handle for a persisted run, e.g. to resume it after a restart.
  pub async fn run(&self, run_id: &str) -> Result<Run, EngineError> {
    let snapshot = self
      .store
      .load(self.workflow.id(), run_id)
      .await
      .map_err(|e| match e {
        spindle_store::Error::NotFound {
          workflow_id,
          run_id,
        } => EngineError::RunNotFound {
          workflow_id,
          run_id,
        },
        other => EngineError::Store(other),
      })?;
    Ok(self.handle(snapshot))
  }

  /// Persisted runs of this workflow, most recently updated first.
  pub async fn get_runs(&self, limit: Option<usize>) -> Result<Vec<RunSummary>, EngineError> {
    Ok(self.store.list_runs(self.workflow.id(), limit).await?)
  }

  fn handle(&self, snapshot: Snapshot) -> Run {
    Run::new(
      self.workflow.clone(),
      self.store.clone(),
      self.resources.clone(),
      self.config.clone(),
      snapshot,
    )
  }
}
