use std::path::Path;

use async_trait::async_trait;
use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::types::Json;

use crate::{Error, RunSummary, Snapshot, SnapshotStore};

/// SQLite-based snapshot store. One row per run, replaced on every save.
#[derive(Debug, Clone)]
pub struct SqliteStore {
  pool: SqlitePool,
}

impl SqliteStore {
  /// Create a new SQLite store with the given connection pool.
  pub fn new(pool: SqlitePool) -> Self {
    Self { pool }
  }

  /// Open (creating if needed) the database file at `path` and migrate it.
  pub async fn connect(path: impl AsRef<Path>) -> Result<Self, Error> {
    let options = SqliteConnectOptions::new()
      .filename(path)
      .create_if_missing(true);
    let pool = SqlitePoolOptions::new().connect_with(options).await?;
    let store = Self::new(pool);
    store.migrate().await?;
    Ok(store)
  }

  /// A migrated store backed by a private in-memory database.
  pub async fn in_memory() -> Result<Self, Error> {
    let pool = SqlitePoolOptions::new()
      .max_connections(1)
      .idle_timeout(None)
      .max_lifetime(None)
      .connect("sqlite::memory:")
      .await?;
    let store = Self::new(pool);
    store.migrate().await?;
    Ok(store)
  }

  /// Run database migrations.
  pub async fn migrate(&self) -> Result<(), Error> {
    sqlx::migrate!("../../migrations").run(&self.pool).await?;
    Ok(())
  }
}

#[async_trait]
impl SnapshotStore for SqliteStore {
  async fn save(&self, workflow_id: &str, run_id: &str, snapshot: &Snapshot) -> Result<(), Error> {
    sqlx::query(
      r#"
            INSERT INTO workflow_snapshots (workflow_id, run_id, status, snapshot, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT (workflow_id, run_id) DO UPDATE SET
              status = excluded.status,
              snapshot = excluded.snapshot,
              updated_at = excluded.updated_at
            "#,
    )
    .bind(workflow_id)
    .bind(run_id)
    .bind(snapshot.status)
    .bind(Json(snapshot))
    .bind(snapshot.created_at)
    .bind(snapshot.updated_at)
    .execute(&self.pool)
    .await?;

    Ok(())
  }

  async fn load(&self, workflow_id: &str, run_id: &str) -> Result<Snapshot, Error> {
    let row: Option<(Json<Snapshot>,)> = sqlx::query_as(
      r#"
            SELECT snapshot
            FROM workflow_snapshots
            WHERE workflow_id = ? AND run_id = ?
            "#,
    )
    .bind(workflow_id)
    .bind(run_id)
    .fetch_optional(&self.pool)
    .await?;

    row
      .map(|(Json(snapshot),)| snapshot)
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
    // SQLite treats a negative LIMIT as no limit.
    let limit = limit.map_or(-1, |n| i64::try_from(n).unwrap_or(i64::MAX));
    let runs = sqlx::query_as(
      r#"
            SELECT workflow_id, run_id, status, created_at, updated_at
            FROM workflow_snapshots
            WHERE workflow_id = ?
            ORDER BY updated_at DESC
            LIMIT ?
            "#,
    )
    .bind(workflow_id)
    .bind(limit)
    .fetch_all(&self.pool)
    .await?;

    Ok(runs)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::{RunStatus, StepRecord, StepStatus};
  use chrono::{Duration, Utc};
  use serde_json::json;

  #[tokio::test]
  async fn test_save_load_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let store = SqliteStore::connect(dir.path().join("spindle.db"))
      .await
      .unwrap();

    let mut snapshot = Snapshot::new("wf", "run-1");
    snapshot.status = RunStatus::Suspended;
    snapshot.input = json!({"inputValue": 30});
    snapshot.steps.insert(
      "stepOne".into(),
      StepRecord {
        status: StepStatus::Success,
        output: Some(json!({"doubled": 60})),
        attempt: 1,
        ..Default::default()
      },
    );
    snapshot.suspended = vec!["stepTwo".into()];
    store.save("wf", "run-1", &snapshot).await.unwrap();

    let loaded = store.load("wf", "run-1").await.unwrap();
    assert_eq!(loaded, snapshot);
  }

  #[tokio::test]
  async fn test_save_replaces_existing_row() {
    let store = SqliteStore::in_memory().await.unwrap();
    let mut snapshot = Snapshot::new("wf", "run-1");
    store.save("wf", "run-1", &snapshot).await.unwrap();

    snapshot.status = RunStatus::Success;
    snapshot.result = Some(json!(1));
    snapshot.updated_at = Utc::now();
    store.save("wf", "run-1", &snapshot).await.unwrap();

    let runs = store.list_runs("wf", None).await.unwrap();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].status, RunStatus::Success);
    assert_eq!(store.load("wf", "run-1").await.unwrap().result, Some(json!(1)));
  }

  #[tokio::test]
  async fn test_load_missing_run() {
    let store = SqliteStore::in_memory().await.unwrap();
    assert!(matches!(
      store.load("wf", "missing").await,
      Err(Error::NotFound { .. })
    ));
  }

  #[tokio::test]
  async fn test_list_runs_ordering_and_limit() {
    let store = SqliteStore::in_memory().await.unwrap();
    let base = Utc::now();
    for (i, run_id) in ["first", "second", "third"].into_iter().enumerate() {
      let mut snapshot = Snapshot::new("wf", run_id);
      snapshot.updated_at = base + Duration::seconds(i as i64);
      store.save("wf", run_id, &snapshot).await.unwrap();
    }
    store
      .save("other", "elsewhere", &Snapshot::new("other", "elsewhere"))
      .await
      .unwrap();

    let runs = store.list_runs("wf", None).await.unwrap();
    let ids: Vec<_> = runs.iter().map(|r| r.run_id.as_str()).collect();
    assert_eq!(ids, vec!["third", "second", "first"]);

    let runs = store.list_runs("wf", Some(1)).await.unwrap();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].run_id, "third");
  }
}
