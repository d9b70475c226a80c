use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use spindle_store::{Failure, RunStatus, StepRecord};

/// Outcome of `start` or `resume`.
///
/// `steps` is the per-step state map at the moment the run settled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RunResult {
  Success {
    result: Value,
    steps: BTreeMap<String, StepRecord>,
  },
  Failed {
    error: Failure,
    steps: BTreeMap<String, StepRecord>,
  },
  Suspended {
    /// Paths of the suspended steps, usable as resume targets.
    suspended: Vec<String>,
    steps: BTreeMap<String, StepRecord>,
  },
}

impl RunResult {
  pub fn status(&self) -> RunStatus {
    match self {
      RunResult::Success { .. } => RunStatus::Success,
      RunResult::Failed { .. } => RunStatus::Failed,
      RunResult::Suspended { .. } => RunStatus::Suspended,
    }
  }

  pub fn result(&self) -> Option<&Value> {
    match self {
      RunResult::Success { result, .. } => Some(result),
      _ => None,
    }
  }

  pub fn error(&self) -> Option<&Failure> {
    match self {
      RunResult::Failed { error, .. } => Some(error),
      _ => None,
    }
  }

  pub fn suspended(&self) -> &[String] {
    match self {
      RunResult::Suspended { suspended, .. } => suspended,
      _ => &[],
    }
  }

  pub fn steps(&self) -> &BTreeMap<String, StepRecord> {
    match self {
      RunResult::Success { steps, .. }
      | RunResult::Failed { steps, .. }
      | RunResult::Suspended { steps, .. } => steps,
    }
  }
}

/// Arguments to [`Run::resume`](crate::Run::resume).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResumeRequest {
  /// Suspended step path, or a prefix of exactly one. `None` picks the only
  /// suspended step.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub step: Option<String>,
  pub resume_data: Value,
}

impl ResumeRequest {
  pub fn new(resume_data: Value) -> Self {
    Self {
      step: None,
      resume_data,
    }
  }

  #[must_use]
  pub fn step(mut self, step: impl Into<String>) -> Self {
    self.step = Some(step.into());
    self
  }
}
