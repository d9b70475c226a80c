//! Graph traversal for a run.
//!
//! Every `start` and `resume` walks the committed plan from the root. State
//! recorded in the snapshot decides what actually runs: successful steps are
//! not invoked again, a suspended step stays suspended unless it is the
//! resume target, and control-flow nodes pick up the branch, loop iteration
//! or foreach items they had reached. Control state is keyed by graph
//! position (`0`, `1.2`, ...) so it survives a process restart.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::future::BoxFuture;
use futures::stream::{self, FuturesUnordered};
use futures::{FutureExt, StreamExt};
use serde_json::{Map, Value, json};
use spindle_store::{
  ControlState, Failure, ItemRecord, RunStatus, Snapshot, StepRecord, StepStatus,
  ValidationStage,
};
use spindle_workflow::{
  BranchArm, Condition, MapContext, Node, Step, StepContext, StepError, StepOutcome, Transform,
  ValidationError, Workflow,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::EngineError;
use crate::events::WatchEvent;
use crate::result::RunResult;
use crate::run::RunInner;

/// How a node settled.
#[derive(Debug, Clone)]
pub(crate) enum Flow {
  Completed(Value),
  Suspended,
  Failed(Failure),
}

/// Where in a (possibly nested) workflow a node sits.
struct Scope<'w> {
  workflow_id: &'w str,
  /// Prepended to step ids to form state-map paths.
  prefix: String,
}

impl Scope<'_> {
  fn path(&self, id: &str) -> String {
    format!("{}{}", self.prefix, id)
  }
}

fn child_pos(pos: &str, index: usize) -> String {
  if pos.is_empty() {
    index.to_string()
  } else {
    format!("{pos}.{index}")
  }
}

pub(crate) fn validation_failure(
  step: Option<String>,
  stage: ValidationStage,
  error: ValidationError,
) -> Failure {
  let message = if error.path == "$" {
    error.message
  } else {
    format!("{}: {}", error.path, error.message)
  };
  Failure::Validation {
    step,
    stage,
    message,
    schema: error.schema,
    value: error.value,
  }
}

/// A step that stops on the abort signal may report it as any error.
fn aborted_outcome<T>(
  outcome: Result<T, StepError>,
  cancel: &CancellationToken,
) -> Result<T, StepError> {
  match outcome {
    Err(_) if cancel.is_cancelled() => Err(StepError::Aborted),
    other => other,
  }
}

fn step_failure(path: &str, error: StepError) -> Failure {
  match error {
    StepError::Aborted => Failure::aborted(),
    other => Failure::Execution {
      step: path.to_string(),
      message: other.to_string(),
    },
  }
}

impl RunInner {
  /// Walk the workflow's top-level plan.
  pub(crate) async fn execute(&self, input: Value) -> Result<Flow, EngineError> {
    let scope = Scope {
      workflow_id: self.workflow.id(),
      prefix: String::new(),
    };
    self.run_sequence(self.workflow.nodes(), input, &scope, "").await
  }

  fn run_node<'a>(
    &'a self,
    node: &'a Node,
    input: Value,
    scope: &'a Scope<'a>,
    pos: String,
  ) -> BoxFuture<'a, Result<Flow, EngineError>> {
    async move {
      if self.cancel.is_cancelled() {
        return Ok(Flow::Failed(Failure::aborted()));
      }

      match node {
        Node::Step(step) => self.run_step(step, input, scope.path(step.id()), scope).await,
        Node::Sequence(children) => self.run_sequence(children, input, scope, &pos).await,
        Node::Parallel(children) => self.run_parallel(children, input, scope, &pos).await,
        Node::Branch(arms) => self.run_branch(arms, input, scope, &pos).await,
        Node::DoWhile { body, condition } => {
          self
            .run_loop(body, condition, true, input, scope, &pos)
            .await
        }
        Node::DoUntil { body, condition } => {
          self
            .run_loop(body, condition, false, input, scope, &pos)
            .await
        }
        Node::Foreach { step, concurrency } => {
          self
            .run_foreach(step, *concurrency, input, scope, &pos)
            .await
        }
        Node::Map { id, transform } => Ok(self.run_map(id, transform, input, scope).await),
        Node::Sleep { duration, .. } => self.run_sleep(*duration, input, &pos).await,
        Node::Workflow(workflow) => self.run_nested(workflow, input, scope, &pos).await,
      }
    }
    .boxed()
  }

  async fn run_sequence(
    &self,
    children: &[Node],
    input: Value,
    scope: &Scope<'_>,
    pos: &str,
  ) -> Result<Flow, EngineError> {
    let mut current = input;
    for (index, child) in children.iter().enumerate() {
      match self
        .run_node(child, current, scope, child_pos(pos, index))
        .await?
      {
        Flow::Completed(output) => current = output,
        other => return Ok(other),
      }
    }
    Ok(Flow::Completed(current))
  }

  // === Steps ===

  async fn run_step(
    &self,
    step: &Arc<Step>,
    input: Value,
    path: String,
    scope: &Scope<'_>,
  ) -> Result<Flow, EngineError> {
    let (record, resume) = self.claim_record(&path).await;
    match record.status {
      StepStatus::Success => return Ok(Flow::Completed(record.output.unwrap_or(Value::Null))),
      StepStatus::Suspended if resume.is_none() => return Ok(Flow::Suspended),
      StepStatus::Failed => {
        return Ok(Flow::Failed(record.error.unwrap_or_else(|| {
          Failure::Execution {
            step: path.clone(),
            message: "step failed earlier in this run".to_string(),
          }
        })));
      }
      _ => {}
    }

    let resumed = resume.is_some();
    self
      .transition(&path, StepStatus::Running, true, |r| {
        r.attempt += 1;
        r.input = Some(input.clone());
        r.output = None;
        r.error = None;
        r.ended_at = None;
        if r.started_at.is_none() {
          r.started_at = Some(Utc::now());
        }
        if let Some(data) = &resume {
          r.resume_payload = Some(data.clone());
          r.resumed_at = Some(Utc::now());
        }
      })
      .await?;
    info!(run_id = %self.run_id, step = %path, resumed, "step_started");

    let input = match step.input_schema().validate(&input) {
      Ok(input) => input,
      Err(e) => {
        let failure = validation_failure(Some(path.clone()), ValidationStage::Input, e);
        return self.fail_step(&path, failure).await;
      }
    };

    let ctx = self
      .step_context(scope, &path, input)
      .await
      .with_resume_data(resume);

    match self.invoke(step, ctx).await {
      Ok(StepOutcome::Success(output)) => match step.output_schema().validate(&output) {
        Ok(output) => {
          self
            .transition(&path, StepStatus::Success, true, |r| {
              r.output = Some(output.clone());
              r.ended_at = Some(Utc::now());
            })
            .await?;
          info!(run_id = %self.run_id, step = %path, output = %output, "step_completed");
          Ok(Flow::Completed(output))
        }
        Err(e) => {
          let failure = validation_failure(Some(path.clone()), ValidationStage::Output, e);
          self.fail_step(&path, failure).await
        }
      },
      Ok(StepOutcome::Suspended(payload)) => {
        let validated = step
          .suspend_schema()
          .map(|schema| schema.validate(&payload))
          .transpose();
        let payload = match validated {
          Ok(validated) => validated.unwrap_or(payload),
          Err(e) => {
            let failure = validation_failure(Some(path.clone()), ValidationStage::Suspend, e);
            return self.fail_step(&path, failure).await;
          }
        };
        self
          .transition(&path, StepStatus::Suspended, true, |r| {
            r.suspend_payload = Some(payload.clone());
            r.suspended_at = Some(Utc::now());
          })
          .await?;
        info!(run_id = %self.run_id, step = %path, payload = %payload, "step_suspended");
        Ok(Flow::Suspended)
      }
      Err(e) => {
        let failure = step_failure(&path, e);
        self.fail_step(&path, failure).await
      }
    }
  }

  /// Current record for `path`, plus the resume data if `path` is the
  /// pending resume target.
  async fn claim_record(&self, path: &str) -> (StepRecord, Option<Value>) {
    let mut state = self.state.lock().await;
    let record = state.snapshot.steps.get(path).cloned().unwrap_or_default();
    let resume = if record.status == StepStatus::Suspended
      && state.resume.as_ref().is_some_and(|target| target.path == path)
    {
      state.resume.take().map(|target| target.data)
    } else {
      None
    };
    (record, resume)
  }

  async fn step_context(&self, scope: &Scope<'_>, path: &str, input: Value) -> StepContext {
    let (init_data, results) = {
      let state = self.state.lock().await;
      (state.snapshot.input.clone(), state.snapshot.outputs())
    };
    StepContext::new(self.run_id.as_str(), scope.workflow_id, path, input)
      .with_init_data(init_data)
      .with_results(Arc::new(results))
      .with_abort(self.cancel.clone())
      .with_resources(self.resources.clone())
  }

  /// Run a step body, racing it against the abort signal.
  async fn invoke(&self, step: &Step, ctx: StepContext) -> Result<StepOutcome, StepError> {
    let outcome = tokio::select! {
      biased;
      _ = self.cancel.cancelled() => Err(StepError::Aborted),
      outcome = step.execute(ctx) => outcome,
    };
    aborted_outcome(outcome, &self.cancel)
  }

  async fn fail_step(&self, path: &str, failure: Failure) -> Result<Flow, EngineError> {
    self
      .transition(path, StepStatus::Failed, true, |r| {
        r.error = Some(failure.clone());
        r.ended_at = Some(Utc::now());
      })
      .await?;
    error!(run_id = %self.run_id, step = %path, error = %failure, "step_failed");
    Ok(Flow::Failed(failure))
  }

  /// Record a status change, persist it, then notify watchers.
  ///
  /// The state lock is held across the save, so transitions reach the store
  /// in the order they happen and the engine never moves past an
  /// unacknowledged save. `leaf` marks records that can be resume targets.
  async fn transition<F>(
    &self,
    path: &str,
    status: StepStatus,
    leaf: bool,
    update: F,
  ) -> Result<(), EngineError>
  where
    F: FnOnce(&mut StepRecord),
  {
    let mut state = self.state.lock().await;
    let snapshot = &mut state.snapshot;

    let record = snapshot.steps.entry(path.to_string()).or_default();
    if record.status != status && !record.status.can_transition_to(status) {
      warn!(
        run_id = %self.run_id,
        step = %path,
        from = %record.status,
        to = %status,
        "unexpected_step_transition"
      );
    }
    record.status = status;
    update(record);

    snapshot.suspended.retain(|p| p != path);
    if leaf && status == StepStatus::Suspended {
      snapshot.suspended.push(path.to_string());
    }
    snapshot.updated_at = Utc::now();

    self.save(snapshot).await?;
    self.notify(snapshot, path, status);
    Ok(())
  }

  fn notify(&self, snapshot: &Snapshot, path: &str, status: StepStatus) {
    if self.watchers.is_empty() {
      return;
    }
    let event = WatchEvent {
      run_id: self.run_id.clone(),
      workflow_id: snapshot.workflow_id.clone(),
      path: path.to_string(),
      status,
      run_status: snapshot.status,
      active_paths: snapshot.active_paths(),
      context: snapshot.steps.clone(),
    };
    self.watchers.emit(&event);
  }

  /// Fail every running or suspended record among `paths`.
  async fn fail_active(&self, paths: &[String], failure: &Failure) -> Result<(), EngineError> {
    for path in paths {
      let active = {
        let state = self.state.lock().await;
        state
          .snapshot
          .steps
          .get(path)
          .is_some_and(|r| matches!(r.status, StepStatus::Running | StepStatus::Suspended))
      };
      if active {
        self
          .transition(path, StepStatus::Failed, false, |r| {
            r.error = Some(failure.clone());
            r.ended_at = Some(Utc::now());
          })
          .await?;
      }
    }
    Ok(())
  }

  async fn set_control(&self, pos: &str, control: ControlState) {
    let mut state = self.state.lock().await;
    state.snapshot.control.insert(pos.to_string(), control);
  }

  async fn control(&self, pos: &str) -> Option<ControlState> {
    self.state.lock().await.snapshot.control.get(pos).cloned()
  }

  // === Parallel and branch ===

  async fn run_parallel(
    &self,
    children: &[Node],
    input: Value,
    scope: &Scope<'_>,
    pos: &str,
  ) -> Result<Flow, EngineError> {
    let mut pending: FuturesUnordered<_> = children
      .iter()
      .enumerate()
      .map(|(index, child)| {
        let input = input.clone();
        let pos = child_pos(pos, index);
        async move { (index, self.run_node(child, input, scope, pos).await) }
      })
      .collect();

    let mut flows: Vec<Option<Flow>> = vec![None; children.len()];
    while let Some((index, flow)) = pending.next().await {
      let flow = flow?;
      let failed = matches!(flow, Flow::Failed(_));
      flows[index] = Some(flow);
      if failed && self.config.fail_fast {
        break;
      }
    }

    if !pending.is_empty() {
      // Siblings cut short by fail-fast.
      drop(pending);
      let mut paths = Vec::new();
      for (child, flow) in children.iter().zip(&flows) {
        if flow.is_none() {
          child.step_paths(&scope.prefix, &mut paths);
        }
      }
      let failure = Failure::Aborted {
        reason: "a parallel sibling failed".to_string(),
      };
      self.fail_active(&paths, &failure).await?;
    }

    let mut outputs = Map::new();
    let mut suspended = false;
    for (child, flow) in children.iter().zip(flows) {
      match flow {
        Some(Flow::Failed(failure)) => return Ok(Flow::Failed(failure)),
        Some(Flow::Suspended) => suspended = true,
        Some(Flow::Completed(output)) => {
          if let Some(id) = child.id() {
            outputs.insert(id.to_string(), output);
          }
        }
        None => {}
      }
    }

    if suspended {
      Ok(Flow::Suspended)
    } else {
      Ok(Flow::Completed(Value::Object(outputs)))
    }
  }

  async fn run_branch(
    &self,
    arms: &[BranchArm],
    input: Value,
    scope: &Scope<'_>,
    pos: &str,
  ) -> Result<Flow, EngineError> {
    let selected = match self.control(pos).await {
      Some(ControlState::Branch { selected }) => selected,
      _ => {
        let selected = arms.iter().position(|arm| (arm.condition)(&input));
        self
          .set_control(pos, ControlState::Branch { selected })
          .await;
        debug!(run_id = %self.run_id, position = %pos, ?selected, "branch_selected");
        selected
      }
    };

    let Some((index, arm)) = selected.and_then(|index| arms.get(index).map(|arm| (index, arm)))
    else {
      return Ok(Flow::Completed(json!({})));
    };

    match self
      .run_node(&arm.node, input, scope, child_pos(pos, index))
      .await?
    {
      Flow::Completed(output) => {
        let mut outputs = Map::new();
        outputs.insert(arm.node.id().unwrap_or_default().to_string(), output);
        Ok(Flow::Completed(Value::Object(outputs)))
      }
      other => Ok(other),
    }
  }

  // === Loops ===

  async fn run_loop(
    &self,
    body: &Node,
    condition: &Condition,
    repeat_while: bool,
    input: Value,
    scope: &Scope<'_>,
    pos: &str,
  ) -> Result<Flow, EngineError> {
    let body_pos = child_pos(pos, 0);
    loop {
      let (iteration, in_progress, last_output) = match self.control(pos).await {
        Some(ControlState::Loop {
          iteration,
          in_progress,
          last_output,
        }) => (iteration, in_progress, last_output),
        _ => (0, false, None),
      };

      if !in_progress {
        if let Some(last) = &last_output {
          // The condition sees each iteration's output before the next begins.
          let holds = condition(last);
          if holds != repeat_while {
            debug!(run_id = %self.run_id, position = %pos, iteration, "loop_finished");
            return Ok(Flow::Completed(last.clone()));
          }
        }
        self
          .begin_iteration(body, scope, pos, &body_pos, iteration + 1, last_output.clone())
          .await;
      }

      let iteration_input = last_output.unwrap_or_else(|| input.clone());
      match self
        .run_node(body, iteration_input, scope, body_pos.clone())
        .await?
      {
        Flow::Completed(output) => {
          let iteration = if in_progress { iteration } else { iteration + 1 };
          self
            .set_control(
              pos,
              ControlState::Loop {
                iteration,
                in_progress: false,
                last_output: Some(output),
              },
            )
            .await;
        }
        // The iteration stays in progress, so a resume continues it.
        other => return Ok(other),
      }
    }
  }

  /// Reset the body's records and nested control state for a new iteration.
  async fn begin_iteration(
    &self,
    body: &Node,
    scope: &Scope<'_>,
    pos: &str,
    body_pos: &str,
    iteration: u32,
    last_output: Option<Value>,
  ) {
    let mut paths = Vec::new();
    body.step_paths(&scope.prefix, &mut paths);

    let mut state = self.state.lock().await;
    let snapshot = &mut state.snapshot;
    for path in &paths {
      if let Some(record) = snapshot.steps.get_mut(path) {
        *record = StepRecord {
          attempt: record.attempt,
          ..StepRecord::default()
        };
      }
    }
    let nested = format!("{body_pos}.");
    snapshot
      .control
      .retain(|key, _| key != body_pos && !key.starts_with(&nested));
    snapshot.control.insert(
      pos.to_string(),
      ControlState::Loop {
        iteration,
        in_progress: true,
        last_output,
      },
    );
    debug!(run_id = %self.run_id, position = %pos, iteration, "loop_iteration_started");
  }

  // === Foreach ===

  async fn run_foreach(
    &self,
    step: &Arc<Step>,
    concurrency: usize,
    input: Value,
    scope: &Scope<'_>,
    pos: &str,
  ) -> Result<Flow, EngineError> {
    let path = scope.path(step.id());
    let (record, resume) = self.claim_record(&path).await;
    match record.status {
      StepStatus::Success => return Ok(Flow::Completed(record.output.unwrap_or(Value::Null))),
      StepStatus::Suspended if resume.is_none() => return Ok(Flow::Suspended),
      _ => {}
    }

    let items = match input {
      Value::Array(items) => items,
      other => {
        let failure = Failure::Validation {
          step: Some(path.clone()),
          stage: ValidationStage::Input,
          message: "foreach input must be an array".to_string(),
          schema: json!({ "type": "array" }),
          value: other,
        };
        return self.fail_step(&path, failure).await;
      }
    };

    let resumed = resume.is_some();
    self
      .transition(&path, StepStatus::Running, true, |r| {
        r.attempt += 1;
        r.input = Some(Value::Array(items.clone()));
        r.error = None;
        r.ended_at = None;
        if r.started_at.is_none() {
          r.started_at = Some(Utc::now());
        }
        if let Some(data) = &resume {
          r.resume_payload = Some(data.clone());
          r.resumed_at = Some(Utc::now());
        }
      })
      .await?;
    info!(run_id = %self.run_id, step = %path, items = items.len(), resumed, "step_started");

    let mut records = match self.control(pos).await {
      Some(ControlState::Foreach { items: records }) if records.len() == items.len() => records,
      _ => vec![ItemRecord::default(); items.len()],
    };
    self
      .set_control(pos, ControlState::Foreach { items: records.clone() })
      .await;

    let outcomes: Vec<(usize, Result<ItemRecord, EngineError>)> =
      stream::iter(items.into_iter().enumerate())
        .map(|(index, item)| {
          let previous = records[index].clone();
          let resume = resume.clone();
          let path = path.as_str();
          async move {
            let record = self
              .run_item(step, scope, path, pos, index, item, previous, resume)
              .await;
            (index, record)
          }
        })
        .buffered(concurrency.max(1))
        .collect()
        .await;

    for (index, record) in outcomes {
      records[index] = record?;
    }

    if let Some(failure) = records.iter().find_map(|r| r.error.clone()) {
      return self.fail_step(&path, failure).await;
    }

    if records.iter().any(|r| r.status == StepStatus::Suspended) {
      let payloads: Vec<Value> = records
        .iter()
        .filter_map(|r| r.suspend_payload.clone())
        .collect();
      self
        .transition(&path, StepStatus::Suspended, true, |r| {
          r.suspend_payload = Some(Value::Array(payloads));
          r.suspended_at = Some(Utc::now());
        })
        .await?;
      info!(run_id = %self.run_id, step = %path, "step_suspended");
      return Ok(Flow::Suspended);
    }

    let output = Value::Array(
      records
        .into_iter()
        .map(|r| r.output.unwrap_or(Value::Null))
        .collect(),
    );
    self
      .transition(&path, StepStatus::Success, true, |r| {
        r.output = Some(output.clone());
        r.suspend_payload = None;
        r.ended_at = Some(Utc::now());
      })
      .await?;
    info!(run_id = %self.run_id, step = %path, "step_completed");
    Ok(Flow::Completed(output))
  }

  /// Run one foreach element. Suspended items receive `resume` when set.
  ///
  /// Each item that runs is saved and reported as `path[index]` when it
  /// settles, so completed items survive a restart mid-foreach.
  #[allow(clippy::too_many_arguments)]
  async fn run_item(
    &self,
    step: &Step,
    scope: &Scope<'_>,
    path: &str,
    pos: &str,
    index: usize,
    item: Value,
    previous: ItemRecord,
    resume: Option<Value>,
  ) -> Result<ItemRecord, EngineError> {
    let resume = match previous.status {
      StepStatus::Success => return Ok(previous),
      StepStatus::Suspended if resume.is_none() => return Ok(previous),
      StepStatus::Suspended => resume,
      _ => None,
    };

    let record = match step.input_schema().validate(&item) {
      Err(e) => ItemRecord {
        status: StepStatus::Failed,
        error: Some(validation_failure(
          Some(format!("{path}[{index}]")),
          ValidationStage::Input,
          e,
        )),
        ..ItemRecord::default()
      },
      Ok(item) => {
        let item_path = format!("{path}[{index}]");
        let ctx = self
          .step_context(scope, &item_path, item)
          .await
          .with_resume_data(resume);
        match self.invoke(step, ctx).await {
          Ok(StepOutcome::Success(output)) => match step.output_schema().validate(&output) {
            Ok(output) => ItemRecord {
              status: StepStatus::Success,
              output: Some(output),
              ..ItemRecord::default()
            },
            Err(e) => ItemRecord {
              status: StepStatus::Failed,
              error: Some(validation_failure(Some(item_path), ValidationStage::Output, e)),
              ..ItemRecord::default()
            },
          },
          Ok(StepOutcome::Suspended(payload)) => match step
            .suspend_schema()
            .map(|schema| schema.validate(&payload))
            .transpose()
          {
            Ok(validated) => ItemRecord {
              status: StepStatus::Suspended,
              suspend_payload: Some(validated.unwrap_or(payload)),
              ..ItemRecord::default()
            },
            Err(e) => ItemRecord {
              status: StepStatus::Failed,
              error: Some(validation_failure(Some(item_path), ValidationStage::Suspend, e)),
              ..ItemRecord::default()
            },
          },
          Err(e) => ItemRecord {
            status: StepStatus::Failed,
            error: Some(step_failure(&item_path, e)),
            ..ItemRecord::default()
          },
        }
      }
    };

    let mut state = self.state.lock().await;
    let snapshot = &mut state.snapshot;
    if let Some(ControlState::Foreach { items }) = snapshot.control.get_mut(pos)
      && let Some(slot) = items.get_mut(index)
    {
      *slot = record.clone();
    }
    snapshot.updated_at = Utc::now();
    self.save(snapshot).await?;
    self.notify(snapshot, &format!("{path}[{index}]"), record.status);
    debug!(
      run_id = %self.run_id,
      step = %path,
      index,
      status = %record.status,
      "foreach_item_settled"
    );
    Ok(record)
  }

  // === Map, sleep and nested workflows ===

  async fn run_map(&self, id: &str, transform: &Transform, input: Value, scope: &Scope<'_>) -> Flow {
    let ctx = {
      let state = self.state.lock().await;
      MapContext {
        input,
        results: state.snapshot.outputs(),
        init_data: state.snapshot.input.clone(),
      }
    };

    let outcome = tokio::select! {
      biased;
      _ = self.cancel.cancelled() => Err(StepError::Aborted),
      outcome = transform(ctx) => outcome,
    };
    let outcome = aborted_outcome(outcome, &self.cancel);
    match outcome {
      Ok(output) => Flow::Completed(output),
      Err(e) => {
        let failure = step_failure(&scope.path(id), e);
        error!(run_id = %self.run_id, map = %id, error = %failure, "map_failed");
        Flow::Failed(failure)
      }
    }
  }

  async fn run_sleep(&self, duration: Duration, input: Value, pos: &str) -> Result<Flow, EngineError> {
    if let Some(ControlState::Sleep { completed: true }) = self.control(pos).await {
      return Ok(Flow::Completed(input));
    }

    tokio::select! {
      _ = tokio::time::sleep(duration) => {
        self.set_control(pos, ControlState::Sleep { completed: true }).await;
        Ok(Flow::Completed(input))
      }
      _ = self.cancel.cancelled() => Ok(Flow::Failed(Failure::aborted())),
    }
  }

  async fn run_nested(
    &self,
    workflow: &Arc<Workflow>,
    input: Value,
    scope: &Scope<'_>,
    pos: &str,
  ) -> Result<Flow, EngineError> {
    let path = scope.path(workflow.id());
    let nested_prefix = format!("{path}.");

    let (record, resume_inside) = {
      let state = self.state.lock().await;
      let record = state.snapshot.steps.get(&path).cloned().unwrap_or_default();
      let resume_inside = state
        .resume
        .as_ref()
        .is_some_and(|target| target.path.starts_with(&nested_prefix));
      (record, resume_inside)
    };
    match record.status {
      StepStatus::Success => return Ok(Flow::Completed(record.output.unwrap_or(Value::Null))),
      StepStatus::Suspended if !resume_inside => return Ok(Flow::Suspended),
      _ => {}
    }

    let resumed = record.status == StepStatus::Suspended;
    self
      .transition(&path, StepStatus::Running, false, |r| {
        r.attempt += 1;
        r.input = Some(input.clone());
        r.error = None;
        r.ended_at = None;
        if r.started_at.is_none() {
          r.started_at = Some(Utc::now());
        }
        if resumed {
          r.resumed_at = Some(Utc::now());
        }
      })
      .await?;
    info!(run_id = %self.run_id, workflow = %path, resumed, "nested_workflow_started");

    let input = match workflow.input_schema().validate(&input) {
      Ok(input) => input,
      Err(e) => {
        let failure = validation_failure(Some(path.clone()), ValidationStage::Input, e);
        return self.fail_nested(&path, failure).await;
      }
    };

    let inner = Scope {
      workflow_id: workflow.id(),
      prefix: nested_prefix,
    };
    match self.run_sequence(workflow.nodes(), input, &inner, pos).await? {
      Flow::Completed(output) => match workflow.output_schema().validate(&output) {
        Ok(output) => {
          self
            .transition(&path, StepStatus::Success, false, |r| {
              r.output = Some(output.clone());
              r.ended_at = Some(Utc::now());
            })
            .await?;
          info!(run_id = %self.run_id, workflow = %path, "nested_workflow_completed");
          Ok(Flow::Completed(output))
        }
        Err(e) => {
          let failure = validation_failure(Some(path.clone()), ValidationStage::Output, e);
          self.fail_nested(&path, failure).await
        }
      },
      Flow::Suspended => {
        self
          .transition(&path, StepStatus::Suspended, false, |r| {
            r.suspended_at = Some(Utc::now());
          })
          .await?;
        Ok(Flow::Suspended)
      }
      Flow::Failed(failure) => self.fail_nested(&path, failure).await,
    }
  }

  async fn fail_nested(&self, path: &str, failure: Failure) -> Result<Flow, EngineError> {
    self
      .transition(path, StepStatus::Failed, false, |r| {
        r.error = Some(failure.clone());
        r.ended_at = Some(Utc::now());
      })
      .await?;
    Ok(Flow::Failed(failure))
  }

  // === Settling ===

  /// Record the run's outcome and build the caller-facing result.
  pub(crate) async fn finish(&self, flow: Flow) -> Result<RunResult, EngineError> {
    let flow = match flow {
      Flow::Completed(output) => match self.workflow.output_schema().validate(&output) {
        Ok(output) => Flow::Completed(output),
        Err(e) => Flow::Failed(validation_failure(None, ValidationStage::WorkflowOutput, e)),
      },
      other => other,
    };

    // Once abort is signalled the run settles as aborted, whatever the walk
    // ended with.
    let flow = if self.cancel.is_cancelled() {
      Flow::Failed(Failure::aborted())
    } else {
      flow
    };

    if let Flow::Failed(failure) = &flow
      && failure.is_abort()
    {
      let paths: Vec<String> = {
        let state = self.state.lock().await;
        state.snapshot.active_paths()
      };
      self.fail_active(&paths, failure).await?;
    }

    let result = {
      let mut state = self.state.lock().await;
      state.resume = None;
      let snapshot = &mut state.snapshot;
      snapshot.updated_at = Utc::now();
      let result = match flow {
        Flow::Completed(output) => {
          snapshot.status = RunStatus::Success;
          snapshot.result = Some(output.clone());
          snapshot.error = None;
          RunResult::Success {
            result: output,
            steps: snapshot.steps.clone(),
          }
        }
        Flow::Suspended => {
          snapshot.status = RunStatus::Suspended;
          RunResult::Suspended {
            suspended: snapshot.suspended.clone(),
            steps: snapshot.steps.clone(),
          }
        }
        Flow::Failed(failure) => {
          snapshot.status = RunStatus::Failed;
          snapshot.error = Some(failure.clone());
          snapshot.suspended.clear();
          RunResult::Failed {
            error: failure,
            steps: snapshot.steps.clone(),
          }
        }
      };
      self.save(snapshot).await?;
      result
    };

    match &result {
      RunResult::Success { result, .. } => {
        info!(run_id = %self.run_id, result = %result, "workflow_completed");
      }
      RunResult::Suspended { suspended, .. } => {
        info!(run_id = %self.run_id, suspended = ?suspended, "workflow_suspended");
      }
      RunResult::Failed { error, .. } => {
        error!(run_id = %self.run_id, error = %error, "workflow_failed");
      }
    }

    Ok(result)
  }
}
