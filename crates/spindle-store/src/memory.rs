use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::{Error, RunSummary, Snapshot, SnapshotStore};

/// Process-local store, for tests and runs that need no durability.
#[derive(Debug, Default)]
pub struct InMemoryStore {
  snapshots: RwLock<HashMap<(String, String), Snapshot>>,
}

impl InMemoryStore {
  pub fn new() -> Self {
    Self::default()
  }
}

#[async_trait]
impl SnapshotStore for InMemoryStore {
  async fn save(&self, workflow_id: &str, run_id: &str, snapshot: &Snapshot) -> Result<(), Error> {
    self
      .snapshots
      .write()
      .await
      .insert((workflow_id.to_string(), run_id.to_string()), snapshot.clone());
    Ok(())
  }

  async fn load(&self, workflow_id: &str, run_id: &str) -> Result<Snapshot, Error> {
    self
      .snapshots
      .read()
      .await
      .get(&(workflow_id.to_string(), run_id.to_string()))
      .cloned()
      .ok_or_else(|| Error::NotFound {
        workflow_id: workflow_id.to_string(),
        run_id: run_id.to_string(),
      })
  }

  async fn list_runs(
    &self,
    workflow_id: &str,
    limit: Option<usize>,
  ) -> Result<Vec<RunSummary>, Error> {
    let snapshots = self.snapshots.read().await;
    let mut runs: Vec<RunSummary> = snapshots
      .values()
      .filter(|snapshot| snapshot.workflow_id == workflow_id)
      .map(Snapshot::summary)
      .collect();
    runs.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
    if let Some(limit) = limit {
      runs.truncate(limit);
    }
    Ok(runs)
  }
}
