use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;
use spindle_store::{Failure, RunStatus, Snapshot, SnapshotStore, ValidationStage};
use spindle_workflow::{Resources, Workflow};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use crate::error::EngineError;
use crate::events::{RunObserver, WatchEvent, WatchId, Watchers};
use crate::execution::{Flow, validation_failure};
use crate::result::{ResumeRequest, RunResult};
use crate::runtime::RuntimeConfig;

/// Handle to one execution of a workflow.
///
/// Cheap to clone; clones share state, so one clone can `abort` or `watch`
/// while another is inside `start` or `resume`.
#[derive(Clone)]
pub struct Run {
  inner: Arc<RunInner>,
}

pub(crate) struct RunInner {
  pub(crate) run_id: String,
  pub(crate) workflow: Arc<Workflow>,
  pub(crate) store: Arc<dyn SnapshotStore>,
  pub(crate) resources: Resources,
  pub(crate) config: RuntimeConfig,
  pub(crate) cancel: CancellationToken,
  pub(crate) watchers: Watchers,
  pub(crate) state: Mutex<RunState>,
  /// Held for the duration of `start` and `resume`.
  exec: Mutex<()>,
}

pub(crate) struct RunState {
  pub(crate) snapshot: Snapshot,
  /// Suspended step the current traversal should re-invoke.
  pub(crate) resume: Option<ResumeTarget>,
}

pub(crate) struct ResumeTarget {
  pub(crate) path: String,
  pub(crate) data: Value,
}

impl Run {
  pub(crate) fn new(
    workflow: Arc<Workflow>,
    store: Arc<dyn SnapshotStore>,
    resources: Resources,
    config: RuntimeConfig,
    snapshot: Snapshot,
  ) -> Self {
    Self {
      inner: Arc::new(RunInner {
        run_id: snapshot.run_id.clone(),
        workflow,
        store,
        resources,
        config,
        cancel: CancellationToken::new(),
        watchers: Watchers::default(),
        state: Mutex::new(RunState {
          snapshot,
          resume: None,
        }),
        exec: Mutex::new(()),
      }),
    }
  }

  pub fn run_id(&self) -> &str {
    &self.inner.run_id
  }

  pub fn workflow_id(&self) -> &str {
    self.inner.workflow.id()
  }

  pub async fn status(&self) -> RunStatus {
    self.inner.state.lock().await.snapshot.status
  }

  /// Copy of the current run state.
  pub async fn snapshot(&self) -> Snapshot {
    self.inner.state.lock().await.snapshot.clone()
  }

  /// Execute the workflow from the beginning with `input`.
  ///
  /// Resolves with the outcome of the run, including failures; `Err` is
  /// reserved for misuse such as starting a run twice.
  #[instrument(
    name = "run_start",
    skip(self, input),
    fields(
      workflow_id = %self.inner.workflow.id(),
      run_id = %self.inner.run_id,
    )
  )]
  pub async fn start(&self, input: Value) -> Result<RunResult, EngineError> {
    let _exec = self.inner.exec.lock().await;

    {
      let mut state = self.inner.state.lock().await;
      if state.snapshot.status != RunStatus::Pending {
        return Err(EngineError::AlreadyStarted {
          run_id: self.inner.run_id.clone(),
        });
      }
      let now = Utc::now();
      state.snapshot.status = RunStatus::Running;
      state.snapshot.input = input.clone();
      state.snapshot.created_at = now;
      state.snapshot.updated_at = now;
      self.inner.save(&state.snapshot).await?;
    }

    info!(input = %input, "workflow_started");

    let flow = match self.inner.workflow.input_schema().validate(&input) {
      Ok(input) => {
        self.inner.state.lock().await.snapshot.input = input.clone();
        self.inner.execute(input).await?
      }
      Err(e) => Flow::Failed(validation_failure(None, ValidationStage::WorkflowInput, e)),
    };

    self.inner.finish(flow).await
  }

  /// Continue a suspended run.
  ///
  /// The target step is re-invoked with the resume data; steps that already
  /// succeeded are not run again. A request naming a step that is not
  /// suspended, or carrying data its resume schema rejects, fails without
  /// touching the run.
  #[instrument(
    name = "run_resume",
    skip(self, request),
    fields(
      workflow_id = %self.inner.workflow.id(),
      run_id = %self.inner.run_id,
      step = ?request.step,
    )
  )]
  pub async fn resume(&self, request: ResumeRequest) -> Result<RunResult, EngineError> {
    let _exec = self.inner.exec.lock().await;
    let run_id = self.inner.run_id.clone();

    let (input, path) = {
      let mut state = self.inner.state.lock().await;
      if state.snapshot.status != RunStatus::Suspended {
        return Err(EngineError::ResumeMismatch {
          run_id,
          step: request.step,
          message: format!("run is {}, not suspended", state.snapshot.status),
        });
      }

      let path = resolve_resume_path(&state.snapshot.suspended, request.step.as_deref()).map_err(
        |message| EngineError::ResumeMismatch {
          run_id: run_id.clone(),
          step: request.step.clone(),
          message,
        },
      )?;

      let step = self.inner.workflow.find_step(&path).ok_or_else(|| {
        EngineError::ResumeMismatch {
          run_id: run_id.clone(),
          step: Some(path.clone()),
          message: "no such step in the workflow".to_string(),
        }
      })?;

      let data = match step.resume_schema() {
        Some(schema) => {
          schema
            .validate(&request.resume_data)
            .map_err(|source| EngineError::InvalidResumeData {
              run_id: run_id.clone(),
              step: path.clone(),
              source,
            })?
        }
        None => request.resume_data,
      };

      state.resume = Some(ResumeTarget {
        path: path.clone(),
        data,
      });
      state.snapshot.status = RunStatus::Running;
      state.snapshot.updated_at = Utc::now();
      self.inner.save(&state.snapshot).await?;
      (state.snapshot.input.clone(), path)
    };

    info!(step = %path, "workflow_resumed");

    let flow = self.inner.execute(input).await?;
    self.inner.finish(flow).await
  }

  /// Signal abort.
  ///
  /// Steps observe it through their context; no further node is started and
  /// the run settles as failed with an abort reason. A suspended run that is
  /// not executing is settled immediately.
  pub async fn abort(&self) -> Result<(), EngineError> {
    self.inner.cancel.cancel();
    warn!(run_id = %self.inner.run_id, "run_abort_requested");

    if let Ok(_exec) = self.inner.exec.try_lock() {
      let status = self.inner.state.lock().await.snapshot.status;
      if status == RunStatus::Suspended {
        self.inner.finish(Flow::Failed(Failure::aborted())).await?;
      }
    }
    Ok(())
  }

  pub fn is_aborted(&self) -> bool {
    self.inner.cancel.is_cancelled()
  }

  /// Call `callback` after every step transition from now on.
  pub fn watch<F>(&self, callback: F) -> WatchId
  where
    F: Fn(&WatchEvent) + Send + Sync + 'static,
  {
    self.inner.watchers.add(Arc::new(callback))
  }

  pub fn observe(&self, observer: impl RunObserver + 'static) -> WatchId {
    self.inner.watchers.add(Arc::new(observer))
  }

  /// Stop a watcher. Returns `false` if it was already removed.
  pub fn unwatch(&self, id: WatchId) -> bool {
    self.inner.watchers.remove(id)
  }
}

impl RunInner {
  pub(crate) async fn save(&self, snapshot: &Snapshot) -> Result<(), EngineError> {
    self
      .store
      .save(&snapshot.workflow_id, &snapshot.run_id, snapshot)
      .await?;
    Ok(())
  }
}

/// Pick the suspended path a resume request refers to.
///
/// `None` selects the only suspended step. A name that is not itself
/// suspended may still be a prefix (such as a nested workflow id) of exactly
/// one suspended path.
fn resolve_resume_path(suspended: &[String], step: Option<&str>) -> Result<String, String> {
  let Some(step) = step else {
    return match suspended {
      [only] => Ok(only.clone()),
      [] => Err("no step is suspended".to_string()),
      many => Err(format!(
        "several steps are suspended ({}), name one",
        many.join(", ")
      )),
    };
  };

  if suspended.iter().any(|path| path == step) {
    return Ok(step.to_string());
  }

  let prefix = format!("{step}.");
  let candidates: Vec<&String> = suspended
    .iter()
    .filter(|path| path.starts_with(&prefix))
    .collect();
  match candidates.as_slice() {
    [only] => Ok((*only).clone()),
    [] => Err(format!("'{step}' is not suspended")),
    many => Err(format!(
      "'{step}' matches several suspended steps ({})",
      many
        .iter()
        .map(|path| path.as_str())
        .collect::<Vec<_>>()
        .join(", ")
    )),
  }
}
