//! Steps: named, schema-typed units of work.

use std::any::{Any, TypeId};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::schema::{JsonSchema, Schema};

/// Result of a step invocation that did not fail.
///
/// Suspension is ordinary control flow, so it is a variant here rather
/// than an error.
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
  /// The step finished with this output.
  Success(Value),
  /// The step asks the run to pause, carrying this payload to the caller.
  Suspended(Value),
}

/// A genuine step failure.
#[derive(Debug, thiserror::Error)]
pub enum StepError {
  #[error("{0}")]
  Message(String),

  /// The step observed the run's abort signal and stopped.
  #[error("step aborted")]
  Aborted,

  #[error(transparent)]
  Json(#[from] serde_json::Error),
}

impl StepError {
  pub fn msg(message: impl Into<String>) -> Self {
    Self::Message(message.into())
  }
}

/// Typed capabilities handed to steps, keyed by type.
///
/// This is how steps reach clients, loggers or stores without global state:
/// the runtime is built with a `Resources` set and every [`StepContext`]
/// carries a cheap clone of it.
#[derive(Clone, Default)]
pub struct Resources {
  entries: Arc<HashMap<TypeId, Arc<dyn Any + Send + Sync>>>,
}

impl Resources {
  pub fn new() -> Self {
    Self::default()
  }

  /// Register a capability, replacing any previous value of the same type.
  pub fn insert<T: Any + Send + Sync>(&mut self, value: T) {
    Arc::make_mut(&mut self.entries).insert(TypeId::of::<T>(), Arc::new(value));
  }

  pub fn get<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
    self
      .entries
      .get(&TypeId::of::<T>())
      .cloned()
      .and_then(|value| value.downcast::<T>().ok())
  }

  pub fn len(&self) -> usize {
    self.entries.len()
  }

  pub fn is_empty(&self) -> bool {
    self.entries.is_empty()
  }
}

impl fmt::Debug for Resources {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Resources")
      .field("entries", &self.entries.len())
      .finish()
  }
}

/// Everything a step invocation can see.
#[derive(Debug, Clone)]
pub struct StepContext {
  run_id: String,
  workflow_id: String,
  step_path: String,
  input: Value,
  init_data: Value,
  resume_data: Option<Value>,
  results: Arc<BTreeMap<String, Value>>,
  abort: CancellationToken,
  resources: Resources,
}

impl StepContext {
  pub fn new(
    run_id: impl Into<String>,
    workflow_id: impl Into<String>,
    step_path: impl Into<String>,
    input: Value,
  ) -> Self {
    Self {
      run_id: run_id.into(),
      workflow_id: workflow_id.into(),
      step_path: step_path.into(),
      input,
      init_data: Value::Null,
      resume_data: None,
      results: Arc::default(),
      abort: CancellationToken::new(),
      resources: Resources::default(),
    }
  }

  pub fn with_init_data(mut self, init_data: Value) -> Self {
    self.init_data = init_data;
    self
  }

  pub fn with_resume_data(mut self, resume_data: Option<Value>) -> Self {
    self.resume_data = resume_data;
    self
  }

  pub fn with_results(mut self, results: Arc<BTreeMap<String, Value>>) -> Self {
    self.results = results;
    self
  }

  pub fn with_abort(mut self, abort: CancellationToken) -> Self {
    self.abort = abort;
    self
  }

  pub fn with_resources(mut self, resources: Resources) -> Self {
    self.resources = resources;
    self
  }

  pub fn run_id(&self) -> &str {
    &self.run_id
  }

  pub fn workflow_id(&self) -> &str {
    &self.workflow_id
  }

  /// Path of this step in the run's state map (nested steps are `parent.child`).
  pub fn step_path(&self) -> &str {
    &self.step_path
  }

  /// The resolved, already validated input.
  pub fn input(&self) -> &Value {
    &self.input
  }

  pub fn input_as<T: DeserializeOwned>(&self) -> Result<T, StepError> {
    Ok(serde_json::from_value(self.input.clone())?)
  }

  /// Input the run was started with.
  pub fn init_data(&self) -> &Value {
    &self.init_data
  }

  /// Present only when this invocation continues a suspension.
  pub fn resume_data(&self) -> Option<&Value> {
    self.resume_data.as_ref()
  }

  pub fn resume_data_as<T: DeserializeOwned>(&self) -> Result<Option<T>, StepError> {
    self
      .resume_data
      .clone()
      .map(serde_json::from_value)
      .transpose()
      .map_err(StepError::from)
  }

  /// Output of a step that already succeeded in this run.
  pub fn step_output(&self, path: &str) -> Option<&Value> {
    self.results.get(path)
  }

  pub fn step_outputs(&self) -> &BTreeMap<String, Value> {
    &self.results
  }

  /// Request suspension of the run with `payload`.
  pub fn suspend(&self, payload: Value) -> StepOutcome {
    StepOutcome::Suspended(payload)
  }

  pub fn abort_signal(&self) -> &CancellationToken {
    &self.abort
  }

  pub fn is_aborted(&self) -> bool {
    self.abort.is_cancelled()
  }

  pub fn resource<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
    self.resources.get::<T>()
  }
}

/// The body of a step.
#[async_trait]
pub trait Execute: Send + Sync {
  async fn execute(&self, ctx: StepContext) -> Result<StepOutcome, StepError>;
}

#[async_trait]
impl<F, Fut> Execute for F
where
  F: Fn(StepContext) -> Fut + Send + Sync,
  Fut: Future<Output = Result<StepOutcome, StepError>> + Send,
{
  async fn execute(&self, ctx: StepContext) -> Result<StepOutcome, StepError> {
    (self)(ctx).await
  }
}

/// A named unit of work with declared data shapes.
///
/// Steps are immutable once built and are shared (not copied) by the graph
/// nodes that reference them.
pub struct Step {
  id: String,
  description: Option<String>,
  input_schema: Arc<dyn Schema>,
  output_schema: Arc<dyn Schema>,
  suspend_schema: Option<Arc<dyn Schema>>,
  resume_schema: Option<Arc<dyn Schema>>,
  executor: Arc<dyn Execute>,
}

impl Step {
  pub fn builder(id: impl Into<String>) -> StepBuilder {
    StepBuilder {
      id: id.into(),
      description: None,
      input_schema: Arc::new(JsonSchema::any()),
      output_schema: Arc::new(JsonSchema::any()),
      suspend_schema: None,
      resume_schema: None,
    }
  }

  pub fn id(&self) -> &str {
    &self.id
  }

  pub fn description(&self) -> Option<&str> {
    self.description.as_deref()
  }

  pub fn input_schema(&self) -> &dyn Schema {
    self.input_schema.as_ref()
  }

  pub fn output_schema(&self) -> &dyn Schema {
    self.output_schema.as_ref()
  }

  pub fn suspend_schema(&self) -> Option<&dyn Schema> {
    self.suspend_schema.as_deref()
  }

  pub fn resume_schema(&self) -> Option<&dyn Schema> {
    self.resume_schema.as_deref()
  }

  pub async fn execute(&self, ctx: StepContext) -> Result<StepOutcome, StepError> {
    self.executor.execute(ctx).await
  }
}

impl fmt::Debug for Step {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Step")
      .field("id", &self.id)
      .field("input_schema", &self.input_schema)
      .field("output_schema", &self.output_schema)
      .field("suspend_schema", &self.suspend_schema)
      .field("resume_schema", &self.resume_schema)
      .finish_non_exhaustive()
  }
}

/// Builder for [`Step`]. Unset schemas accept any value.
pub struct StepBuilder {
  id: String,
  description: Option<String>,
  input_schema: Arc<dyn Schema>,
  output_schema: Arc<dyn Schema>,
  suspend_schema: Option<Arc<dyn Schema>>,
  resume_schema: Option<Arc<dyn Schema>>,
}

impl StepBuilder {
  #[must_use]
  pub fn description(mut self, description: impl Into<String>) -> Self {
    self.description = Some(description.into());
    self
  }

  #[must_use]
  pub fn input_schema(mut self, schema: impl Schema + 'static) -> Self {
    self.input_schema = Arc::new(schema);
    self
  }

  #[must_use]
  pub fn output_schema(mut self, schema: impl Schema + 'static) -> Self {
    self.output_schema = Arc::new(schema);
    self
  }

  #[must_use]
  pub fn suspend_schema(mut self, schema: impl Schema + 'static) -> Self {
    self.suspend_schema = Some(Arc::new(schema));
    self
  }

  #[must_use]
  pub fn resume_schema(mut self, schema: impl Schema + 'static) -> Self {
    self.resume_schema = Some(Arc::new(schema));
    self
  }

  /// Finish the step with an async closure body.
  pub fn execute<F, Fut>(self, f: F) -> Step
  where
    F: Fn(StepContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<StepOutcome, StepError>> + Send + 'static,
  {
    self.executor(f)
  }

  /// Finish the step with any [`Execute`] implementation.
  pub fn executor(self, executor: impl Execute + 'static) -> Step {
    Step {
      id: self.id,
      description: self.description,
      input_schema: self.input_schema,
      output_schema: self.output_schema,
      suspend_schema: self.suspend_schema,
      resume_schema: self.resume_schema,
      executor: Arc::new(executor),
    }
  }
}
