use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::FromRow;

/// Status of a run as a whole.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum RunStatus {
  Pending,
  Running,
  Success,
  Failed,
  Suspended,
}

impl RunStatus {
  pub fn is_terminal(self) -> bool {
    matches!(self, RunStatus::Success | RunStatus::Failed)
  }
}

impl fmt::Display for RunStatus {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let s = match self {
      RunStatus::Pending => "pending",
      RunStatus::Running => "running",
      RunStatus::Success => "success",
      RunStatus::Failed => "failed",
      RunStatus::Suspended => "suspended",
    };
    f.write_str(s)
  }
}

/// Status of a single step within a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
  #[default]
  Pending,
  Running,
  Success,
  Failed,
  Suspended,
}

impl StepStatus {
  pub fn is_terminal(self) -> bool {
    matches!(self, StepStatus::Success | StepStatus::Failed)
  }

  /// Whether a step may move from `self` to `next`.
  ///
  /// `suspended -> running` is only legal as part of a resume.
  pub fn can_transition_to(self, next: StepStatus) -> bool {
    use StepStatus::*;
    matches!(
      (self, next),
      (Pending, Running)
        | (Pending, Failed)
        | (Running, Success)
        | (Running, Failed)
        | (Running, Suspended)
        | (Suspended, Running)
        | (Suspended, Failed)
    )
  }
}

impl fmt::Display for StepStatus {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let s = match self {
      StepStatus::Pending => "pending",
      StepStatus::Running => "running",
      StepStatus::Success => "success",
      StepStatus::Failed => "failed",
      StepStatus::Suspended => "suspended",
    };
    f.write_str(s)
  }
}

/// Which boundary a validation failure happened at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationStage {
  Input,
  Output,
  Suspend,
  WorkflowInput,
  WorkflowOutput,
}

impl fmt::Display for ValidationStage {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let s = match self {
      ValidationStage::Input => "input",
      ValidationStage::Output => "output",
      ValidationStage::Suspend => "suspend payload",
      ValidationStage::WorkflowInput => "workflow input",
      ValidationStage::WorkflowOutput => "workflow output",
    };
    f.write_str(s)
  }
}

/// Why a step or run failed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Failure {
  /// A value did not match its declared schema.
  #[error("invalid {stage}{}: {message}", step.as_deref().map(|s| format!(" for '{s}'")).unwrap_or_default())]
  Validation {
    step: Option<String>,
    stage: ValidationStage,
    message: String,
    schema: Value,
    value: Value,
  },

  /// The step's execute function returned an error.
  #[error("step '{step}' failed: {message}")]
  Execution { step: String, message: String },

  /// The run was cancelled.
  #[error("aborted: {reason}")]
  Aborted { reason: String },
}

impl Failure {
  pub fn aborted() -> Self {
    Failure::Aborted {
      reason: "run aborted".to_string(),
    }
  }

  pub fn is_abort(&self) -> bool {
    matches!(self, Failure::Aborted { .. })
  }
}

/// Persisted state of one step path.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
  pub status: StepStatus,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub input: Option<Value>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub output: Option<Value>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub error: Option<Failure>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub suspend_payload: Option<Value>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub resume_payload: Option<Value>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub started_at: Option<DateTime<Utc>>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub ended_at: Option<DateTime<Utc>>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub suspended_at: Option<DateTime<Utc>>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub resumed_at: Option<DateTime<Utc>>,
  /// Number of times the step has been invoked in this run.
  #[serde(default)]
  pub attempt: u32,
}

/// Progress of one `foreach` item.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ItemRecord {
  pub status: StepStatus,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub output: Option<Value>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub suspend_payload: Option<Value>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub error: Option<Failure>,
}

/// Persisted progress of a control-flow node, keyed by its graph position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ControlState {
  /// Arm chosen on first evaluation; `None` when no arm matched.
  Branch { selected: Option<usize> },
  Loop {
    /// 1-based number of the current (or last) iteration.
    iteration: u32,
    /// An iteration has started but not yet produced output.
    in_progress: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    last_output: Option<Value>,
  },
  Foreach { items: Vec<ItemRecord> },
  Sleep { completed: bool },
}

/// Serializable state of a run, sufficient to resume it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
  pub workflow_id: String,
  pub run_id: String,
  pub status: RunStatus,
  #[serde(default)]
  pub input: Value,
  /// Step records keyed by path (`step`, or `workflow.step` when nested).
  #[serde(default)]
  pub steps: BTreeMap<String, StepRecord>,
  /// Control-flow progress keyed by graph position.
  #[serde(default)]
  pub control: BTreeMap<String, ControlState>,
  /// Paths of the leaf steps currently suspended.
  #[serde(default)]
  pub suspended: Vec<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub result: Option<Value>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub error: Option<Failure>,
  pub created_at: DateTime<Utc>,
  pub updated_at: DateTime<Utc>,
}

impl Snapshot {
  pub fn new(workflow_id: impl Into<String>, run_id: impl Into<String>) -> Self {
    let now = Utc::now();
    Self {
      workflow_id: workflow_id.into(),
      run_id: run_id.into(),
      status: RunStatus::Pending,
      input: Value::Null,
      steps: BTreeMap::new(),
      control: BTreeMap::new(),
      suspended: Vec::new(),
      result: None,
      error: None,
      created_at: now,
      updated_at: now,
    }
  }

  pub fn summary(&self) -> RunSummary {
    RunSummary {
      workflow_id: self.workflow_id.clone(),
      run_id: self.run_id.clone(),
      status: self.status,
      created_at: self.created_at,
      updated_at: self.updated_at,
    }
  }

  /// Outputs of every successful step, keyed by path.
  pub fn outputs(&self) -> BTreeMap<String, Value> {
    self
      .steps
      .iter()
      .filter(|(_, record)| record.status == StepStatus::Success)
      .filter_map(|(path, record)| record.output.clone().map(|output| (path.clone(), output)))
      .collect()
  }

  /// Paths currently running or suspended.
  pub fn active_paths(&self) -> Vec<String> {
    self
      .steps
      .iter()
      .filter(|(_, record)| matches!(record.status, StepStatus::Running | StepStatus::Suspended))
      .map(|(path, _)| path.clone())
      .collect()
  }
}

/// Listing entry for a persisted run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct RunSummary {
  pub workflow_id: String,
  pub run_id: String,
  pub status: RunStatus,
  pub created_at: DateTime<Utc>,
  pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn test_step_transitions() {
    use StepStatus::*;
    assert!(Pending.can_transition_to(Running));
    assert!(Running.can_transition_to(Suspended));
    assert!(Suspended.can_transition_to(Running));
    assert!(!Success.can_transition_to(Running));
    assert!(!Success.can_transition_to(Failed));
    assert!(!Failed.can_transition_to(Running));
    assert!(!Pending.can_transition_to(Success));
  }

  #[test]
  fn test_failure_serialization() {
    let failure = Failure::Validation {
      step: Some("one".into()),
      stage: ValidationStage::Input,
      message: "expected number".into(),
      schema: json!({"type": "number"}),
      value: json!("x"),
    };
    let value = serde_json::to_value(&failure).unwrap();
    assert_eq!(value["kind"], "validation");
    assert_eq!(value["stage"], "input");
    assert_eq!(failure.to_string(), "invalid input for 'one': expected number");

    let aborted: Failure = serde_json::from_value(json!({"kind": "aborted", "reason": "stop"})).unwrap();
    assert!(aborted.is_abort());
  }

  #[test]
  fn test_validation_stages() {
    let stages = [
      ValidationStage::Input,
      ValidationStage::Output,
      ValidationStage::Suspend,
      ValidationStage::WorkflowInput,
      ValidationStage::WorkflowOutput,
    ];
    let names: Vec<Value> = stages
      .iter()
      .map(|stage| serde_json::to_value(stage).unwrap())
      .collect();
    assert_eq!(
      names,
      vec![
        json!("input"),
        json!("output"),
        json!("suspend"),
        json!("workflow_input"),
        json!("workflow_output"),
      ]
    );
    // Resume data is checked before the run changes, so it has no stage.
    assert!(serde_json::from_value::<ValidationStage>(json!("resume")).is_err());
  }

  #[test]
  fn test_snapshot_views() {
    let mut snapshot = Snapshot::new("wf", "run");
    snapshot.steps.insert(
      "a".into(),
      StepRecord {
        status: StepStatus::Success,
        output: Some(json!(1)),
        ..Default::default()
      },
    );
    snapshot.steps.insert(
      "b".into(),
      StepRecord {
        status: StepStatus::Suspended,
        ..Default::default()
      },
    );
    snapshot.steps.insert("c".into(), StepRecord::default());

    assert_eq!(snapshot.outputs(), BTreeMap::from([("a".to_string(), json!(1))]));
    assert_eq!(snapshot.active_paths(), vec!["b"]);
    assert_eq!(snapshot.summary().status, RunStatus::Pending);
  }

  #[test]
  fn test_snapshot_round_trips_control_state() {
    let mut snapshot = Snapshot::new("wf", "run");
    snapshot.control.insert(
      "0".into(),
      ControlState::Loop {
        iteration: 3,
        in_progress: true,
        last_output: Some(json!({"value": 2})),
      },
    );
    snapshot
      .control
      .insert("1".into(), ControlState::Branch { selected: None });

    let json = serde_json::to_string(&snapshot).unwrap();
    let restored: Snapshot = serde_json::from_str(&json).unwrap();
    assert_eq!(restored, snapshot);
  }
}
