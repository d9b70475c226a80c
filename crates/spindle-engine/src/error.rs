use spindle_workflow::ValidationError;

/// Errors returned to the caller of a run operation.
///
/// Workflow outcomes, including failed steps, are reported through
/// [`RunResult`](crate::RunResult). These are misuse of the API or a broken
/// snapshot store.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
  #[error("run '{run_id}' of workflow '{workflow_id}' not found")]
  RunNotFound { workflow_id: String, run_id: String },

  #[error("run '{run_id}' has already been started")]
  AlreadyStarted { run_id: String },

  #[error("cannot resume run '{run_id}'{}: {message}", step.as_deref().map(|s| format!(" at '{s}'")).unwrap_or_default())]
  ResumeMismatch {
    run_id: String,
    step: Option<String>,
    message: String,
  },

  #[error("resume data for '{step}' in run '{run_id}' is invalid: {source}")]
  InvalidResumeData {
    run_id: String,
    step: String,
    #[source]
    source: ValidationError,
  },

  #[error("snapshot store error: {0}")]
  Store(#[from] spindle_store::Error),
}
