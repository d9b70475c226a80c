use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use serde_json::{Map, Value, json};
use tracing::debug;

use crate::error::BuildError;
use crate::node::{BranchArm, MapContext, Node, Transform};
use crate::schema::{JsonSchema, Schema, array_items, check_assignable};
use crate::step::{Step, StepError};
use crate::workflow::Workflow;

/// Options for [`WorkflowBuilder::foreach`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ForeachOptions {
  /// Maximum number of items in flight at once.
  pub concurrency: usize,
}

impl Default for ForeachOptions {
  fn default() -> Self {
    Self { concurrency: 1 }
  }
}

/// Composes nodes into a [`Workflow`].
///
/// Every method fails with [`BuildError::AlreadyCommitted`] once
/// [`commit`](Self::commit) has succeeded. Structural problems are reported
/// by `commit`, never by the combinators themselves.
pub struct WorkflowBuilder {
  id: String,
  description: Option<String>,
  input_schema: Arc<dyn Schema>,
  output_schema: Arc<dyn Schema>,
  nodes: Vec<Node>,
  anonymous: usize,
  committed: bool,
}

impl WorkflowBuilder {
  pub fn new(id: impl Into<String>) -> Self {
    Self {
      id: id.into(),
      description: None,
      input_schema: Arc::new(JsonSchema::any()),
      output_schema: Arc::new(JsonSchema::any()),
      nodes: Vec::new(),
      anonymous: 0,
      committed: false,
    }
  }

  fn ensure_open(&self) -> Result<(), BuildError> {
    if self.committed {
      return Err(BuildError::AlreadyCommitted {
        workflow_id: self.id.clone(),
      });
    }
    Ok(())
  }

  fn push(&mut self, node: Node) -> Result<&mut Self, BuildError> {
    self.ensure_open()?;
    self.nodes.push(node);
    Ok(self)
  }

  fn next_id(&mut self, kind: &str) -> String {
    self.anonymous += 1;
    format!("{kind}_{}", self.anonymous)
  }

  pub fn description(&mut self, description: impl Into<String>) -> Result<&mut Self, BuildError> {
    self.ensure_open()?;
    self.description = Some(description.into());
    Ok(self)
  }

  pub fn input_schema(&mut self, schema: impl Schema + 'static) -> Result<&mut Self, BuildError> {
    self.ensure_open()?;
    self.input_schema = Arc::new(schema);
    Ok(self)
  }

  pub fn output_schema(&mut self, schema: impl Schema + 'static) -> Result<&mut Self, BuildError> {
    self.ensure_open()?;
    self.output_schema = Arc::new(schema);
    Ok(self)
  }

  /// Append a node fed by the previous node's output.
  ///
  /// Accepts a [`Step`], a committed [`Workflow`] (run as a nested workflow)
  /// or any prebuilt [`Node`].
  pub fn then(&mut self, node: impl Into<Node>) -> Result<&mut Self, BuildError> {
    self.push(node.into())
  }

  /// Append children that run concurrently on the same input. The node's
  /// output maps each child id to that child's output.
  pub fn parallel<I, N>(&mut self, children: I) -> Result<&mut Self, BuildError>
  where
    I: IntoIterator<Item = N>,
    N: Into<Node>,
  {
    let children = children.into_iter().map(Into::into).collect();
    self.push(Node::Parallel(children))
  }

  /// Append a branch: the first arm whose condition holds on the input runs.
  pub fn branch(&mut self, arms: impl IntoIterator<Item = BranchArm>) -> Result<&mut Self, BuildError> {
    self.push(Node::Branch(arms.into_iter().collect()))
  }

  /// Run `body` at least once, repeating while `condition` holds on the
  /// latest iteration's output.
  pub fn dowhile<F>(&mut self, body: impl Into<Node>, condition: F) -> Result<&mut Self, BuildError>
  where
    F: Fn(&Value) -> bool + Send + Sync + 'static,
  {
    self.push(Node::DoWhile {
      body: Box::new(body.into()),
      condition: Arc::new(condition),
    })
  }

  /// Run `body` at least once, repeating until `condition` holds on the
  /// latest iteration's output.
  pub fn dountil<F>(&mut self, body: impl Into<Node>, condition: F) -> Result<&mut Self, BuildError>
  where
    F: Fn(&Value) -> bool + Send + Sync + 'static,
  {
    self.push(Node::DoUntil {
      body: Box::new(body.into()),
      condition: Arc::new(condition),
    })
  }

  /// Apply `step` to every element of an array input, collecting outputs in
  /// input order.
  pub fn foreach(
    &mut self,
    step: impl Into<Arc<Step>>,
    options: ForeachOptions,
  ) -> Result<&mut Self, BuildError> {
    self.push(Node::Foreach {
      step: step.into(),
      concurrency: options.concurrency,
    })
  }

  /// Append an async transform of the previous output.
  pub fn map<F, Fut>(&mut self, f: F) -> Result<&mut Self, BuildError>
  where
    F: Fn(MapContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, StepError>> + Send + 'static,
  {
    self.ensure_open()?;
    let id = self.next_id("map");
    let transform: Transform = Arc::new(move |ctx: MapContext| f(ctx).boxed());
    self.push(Node::Map { id, transform })
  }

  /// Wait for `duration`, then pass the input through unchanged.
  pub fn sleep(&mut self, duration: Duration) -> Result<&mut Self, BuildError> {
    self.ensure_open()?;
    let id = self.next_id("sleep");
    self.push(Node::Sleep { id, duration })
  }

  /// Validate the composed graph and freeze it into a [`Workflow`].
  ///
  /// The builder is sealed on success; later calls, including a second
  /// `commit`, fail with [`BuildError::AlreadyCommitted`].
  pub fn commit(&mut self) -> Result<Workflow, BuildError> {
    self.ensure_open()?;

    if self.nodes.is_empty() {
      return Err(BuildError::Empty {
        workflow_id: self.id.clone(),
      });
    }

    let mut checker = ChainChecker::new(&self.id);
    let mut current = self.input_schema.json_schema();
    let mut from = format!("{} input", self.id);
    for node in &self.nodes {
      current = checker.check(node, current, &from)?;
      from = label(node);
    }

    check_assignable(&current, &self.output_schema.json_schema()).map_err(|reason| {
      BuildError::IncompatibleSchema {
        from,
        to: format!("{} output", self.id),
        reason,
      }
    })?;

    let nodes = std::mem::take(&mut self.nodes);
    let mut steps = HashMap::new();
    let mut workflows = HashMap::new();
    for node in &nodes {
      register(node, &mut steps, &mut workflows);
    }

    self.committed = true;
    debug!(
      workflow_id = %self.id,
      nodes = nodes.len(),
      steps = steps.len(),
      "workflow_committed"
    );

    Ok(Workflow {
      id: self.id.clone(),
      description: self.description.clone(),
      input_schema: self.input_schema.clone(),
      output_schema: self.output_schema.clone(),
      nodes,
      steps,
      workflows,
    })
  }
}

fn label(node: &Node) -> String {
  node.id().map_or_else(|| node.kind().to_string(), str::to_string)
}

fn register(
  node: &Node,
  steps: &mut HashMap<String, Arc<Step>>,
  workflows: &mut HashMap<String, Arc<Workflow>>,
) {
  match node {
    Node::Step(step) | Node::Foreach { step, .. } => {
      steps.insert(step.id().to_string(), step.clone());
    }
    Node::Workflow(workflow) => {
      workflows.insert(workflow.id().to_string(), workflow.clone());
    }
    Node::Sequence(children) | Node::Parallel(children) => {
      for child in children {
        register(child, steps, workflows);
      }
    }
    Node::Branch(arms) => {
      for arm in arms {
        register(&arm.node, steps, workflows);
      }
    }
    Node::DoWhile { body, .. } | Node::DoUntil { body, .. } => register(body, steps, workflows),
    Node::Map { .. } | Node::Sleep { .. } => {}
  }
}

/// Walks the plan, threading the output schema of each node into the next.
struct ChainChecker<'a> {
  workflow_id: &'a str,
  ids: HashSet<String>,
}

impl<'a> ChainChecker<'a> {
  fn new(workflow_id: &'a str) -> Self {
    Self {
      workflow_id,
      ids: HashSet::new(),
    }
  }

  fn claim(&mut self, id: &str) -> Result<(), BuildError> {
    if id.is_empty() {
      return Err(BuildError::InvalidId {
        node_id: id.to_string(),
        reason: "ids must not be empty".to_string(),
      });
    }
    if id.contains('.') {
      return Err(BuildError::InvalidId {
        node_id: id.to_string(),
        reason: "'.' is reserved as the nested path separator".to_string(),
      });
    }
    if !self.ids.insert(id.to_string()) {
      return Err(BuildError::DuplicateId {
        workflow_id: self.workflow_id.to_string(),
        node_id: id.to_string(),
      });
    }
    Ok(())
  }

  fn invalid(&self, kind: &'static str, reason: impl Into<String>) -> BuildError {
    BuildError::InvalidNode {
      workflow_id: self.workflow_id.to_string(),
      kind,
      reason: reason.into(),
    }
  }

  fn feed(input: &Value, from: &str, to: &str, expected: &Value) -> Result<(), BuildError> {
    check_assignable(input, expected).map_err(|reason| BuildError::IncompatibleSchema {
      from: from.to_string(),
      to: to.to_string(),
      reason,
    })
  }

  /// Check `node` against the schema of its input and return the schema of
  /// its output.
  fn check(&mut self, node: &Node, input: Value, from: &str) -> Result<Value, BuildError> {
    match node {
      Node::Step(step) => {
        self.claim(step.id())?;
        Self::feed(&input, from, step.id(), &step.input_schema().json_schema())?;
        Ok(step.output_schema().json_schema())
      }
      Node::Sequence(children) => {
        if children.is_empty() {
          return Err(self.invalid("sequence", "a sequence needs at least one node"));
        }
        let mut current = input;
        let mut from = from.to_string();
        for child in children {
          current = self.check(child, current, &from)?;
          from = label(child);
        }
        Ok(current)
      }
      Node::Parallel(children) => {
        if children.is_empty() {
          return Err(self.invalid("parallel", "a parallel node needs at least one child"));
        }
        let mut properties = Map::new();
        let mut required = Vec::new();
        for child in children {
          let Some(id) = child.id() else {
            return Err(self.invalid(
              "parallel",
              format!("{} child has no id to key its output by", child.kind()),
            ));
          };
          let output = self.check(child, input.clone(), from)?;
          properties.insert(id.to_string(), output);
          required.push(Value::String(id.to_string()));
        }
        Ok(json!({ "type": "object", "properties": properties, "required": required }))
      }
      Node::Branch(arms) => {
        if arms.is_empty() {
          return Err(self.invalid("branch", "a branch needs at least one arm"));
        }
        let mut properties = Map::new();
        for arm in arms {
          let Some(id) = arm.node.id() else {
            return Err(self.invalid(
              "branch",
              format!("{} arm has no id to key its output by", arm.node.kind()),
            ));
          };
          let output = self.check(&arm.node, input.clone(), from)?;
          properties.insert(id.to_string(), output);
        }
        Ok(json!({ "type": "object", "properties": properties }))
      }
      Node::DoWhile { body, .. } | Node::DoUntil { body, .. } => {
        let output = self.check(body, input, from)?;
        // Later iterations are fed the previous iteration's output.
        let mut replay = ChainChecker::new(self.workflow_id);
        replay.check(body, output.clone(), &label(body))?;
        Ok(output)
      }
      Node::Foreach { step, concurrency } => {
        self.claim(step.id())?;
        if *concurrency == 0 {
          return Err(self.invalid("foreach", "concurrency must be at least 1"));
        }
        let items = array_items(&input).map_err(|reason| BuildError::IncompatibleSchema {
          from: from.to_string(),
          to: step.id().to_string(),
          reason,
        })?;
        Self::feed(&items, from, step.id(), &step.input_schema().json_schema())?;
        Ok(json!({ "type": "array", "items": step.output_schema().json_schema() }))
      }
      Node::Map { id, .. } => {
        self.claim(id)?;
        Ok(json!({}))
      }
      Node::Sleep { id, .. } => {
        self.claim(id)?;
        Ok(input)
      }
      Node::Workflow(workflow) => {
        self.claim(workflow.id())?;
        Self::feed(&input, from, workflow.id(), &workflow.input_schema().json_schema())?;
        Ok(workflow.output_schema().json_schema())
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::step::{StepContext, StepOutcome};

  fn step(id: &str, input: Value, output: Value) -> Step {
    Step::builder(id)
      .input_schema(JsonSchema::new(input))
      .output_schema(JsonSchema::new(output))
      .execute(|ctx: StepContext| async move { Ok(StepOutcome::Success(ctx.input().clone())) })
  }

  fn passthrough(id: &str) -> Step {
    step(id, json!({}), json!({}))
  }

  fn object(field: &str, ty: &str) -> Value {
    json!({
      "type": "object",
      "properties": { field: { "type": ty } },
      "required": [field]
    })
  }

  // === Commit ===

  #[test]
  fn test_commit_builds_registry() {
    let mut builder = Workflow::builder("wf");
    builder
      .then(passthrough("a"))
      .unwrap()
      .parallel([passthrough("b"), passthrough("c")])
      .unwrap()
      .map(|ctx| async move { Ok(ctx.input) })
      .unwrap();
    let workflow = builder.commit().unwrap();

    assert_eq!(workflow.id(), "wf");
    assert_eq!(workflow.nodes().len(), 3);
    assert!(workflow.step("a").is_some());
    assert!(workflow.step("c").is_some());
    assert!(workflow.step("map_1").is_none());
    assert_eq!(workflow.step_paths(), vec!["a", "b", "c"]);
  }

  #[test]
  fn test_commit_twice_fails() {
    let mut builder = Workflow::builder("wf");
    builder.then(passthrough("a")).unwrap();
    builder.commit().unwrap();

    assert!(matches!(
      builder.commit(),
      Err(BuildError::AlreadyCommitted { .. })
    ));
  }

  #[test]
  fn test_mutation_after_commit_fails() {
    let mut builder = Workflow::builder("wf");
    builder.then(passthrough("a")).unwrap();
    builder.commit().unwrap();

    assert!(matches!(
      builder.then(passthrough("b")),
      Err(BuildError::AlreadyCommitted { .. })
    ));
    assert!(matches!(
      builder.sleep(Duration::from_millis(1)),
      Err(BuildError::AlreadyCommitted { .. })
    ));
    assert!(matches!(
      builder.description("late"),
      Err(BuildError::AlreadyCommitted { .. })
    ));
  }

  #[test]
  fn test_empty_workflow_rejected() {
    assert!(matches!(
      Workflow::builder("wf").commit(),
      Err(BuildError::Empty { .. })
    ));
  }

  #[test]
  fn test_duplicate_step_id_rejected() {
    let mut builder = Workflow::builder("wf");
    builder
      .then(passthrough("a"))
      .unwrap()
      .then(passthrough("a"))
      .unwrap();

    let err = builder.commit().unwrap_err();
    assert!(matches!(err, BuildError::DuplicateId { ref node_id, .. } if node_id == "a"));
  }

  #[test]
  fn test_dotted_id_rejected() {
    let mut builder = Workflow::builder("wf");
    builder.then(passthrough("a.b")).unwrap();

    assert!(matches!(
      builder.commit(),
      Err(BuildError::InvalidId { .. })
    ));
  }

  #[test]
  fn test_failed_commit_leaves_builder_open() {
    let mut builder = Workflow::builder("wf");
    assert!(builder.commit().is_err());
    builder.then(passthrough("a")).unwrap();
    assert!(builder.commit().is_ok());
  }

  // === Schema chain ===

  #[test]
  fn test_missing_required_field_is_build_error() {
    let mut builder = Workflow::builder("wf");
    builder
      .then(step("one", json!({}), object("doubled", "number")))
      .unwrap()
      .then(step("two", object("value", "number"), json!({})))
      .unwrap();

    let err = builder.commit().unwrap_err();
    match err {
      BuildError::IncompatibleSchema { from, to, reason } => {
        assert_eq!(from, "one");
        assert_eq!(to, "two");
        assert!(reason.contains("value"));
      }
      other => panic!("unexpected error: {other:?}"),
    }
  }

  #[test]
  fn test_compatible_chain_commits() {
    let mut builder = Workflow::builder("wf");
    builder
      .input_schema(JsonSchema::new(object("value", "integer")))
      .unwrap()
      .then(step("one", object("value", "number"), object("doubled", "number")))
      .unwrap()
      .then(step("two", object("doubled", "number"), json!({})))
      .unwrap();

    assert!(builder.commit().is_ok());
  }

  #[test]
  fn test_workflow_input_checked_against_first_step() {
    let mut builder = Workflow::builder("wf");
    builder
      .input_schema(JsonSchema::new(json!({ "type": "string" })))
      .unwrap()
      .then(step("one", json!({ "type": "number" }), json!({})))
      .unwrap();

    assert!(matches!(
      builder.commit(),
      Err(BuildError::IncompatibleSchema { ref from, .. }) if from == "wf input"
    ));
  }

  #[test]
  fn test_declared_output_checked() {
    let mut builder = Workflow::builder("wf");
    builder
      .output_schema(JsonSchema::new(object("total", "number")))
      .unwrap()
      .then(step("one", json!({}), object("count", "number")))
      .unwrap();

    assert!(matches!(
      builder.commit(),
      Err(BuildError::IncompatibleSchema { ref to, .. }) if to == "wf output"
    ));
  }

  #[test]
  fn test_parallel_output_keyed_by_child_id() {
    let mut builder = Workflow::builder("wf");
    builder
      .parallel([
        step("left", json!({}), object("l", "number")),
        step("right", json!({}), object("r", "number")),
      ])
      .unwrap()
      .then(step(
        "join",
        json!({
          "type": "object",
          "properties": { "left": object("l", "number") },
          "required": ["left", "right"]
        }),
        json!({}),
      ))
      .unwrap();

    assert!(builder.commit().is_ok());
  }

  #[test]
  fn test_branch_output_is_optional() {
    let mut builder = Workflow::builder("wf");
    builder
      .branch([
        BranchArm::new(|_| true, passthrough("yes")),
        BranchArm::new(|_| false, passthrough("no")),
      ])
      .unwrap()
      .then(step(
        "after",
        json!({ "type": "object", "required": ["yes"] }),
        json!({}),
      ))
      .unwrap();

    assert!(matches!(
      builder.commit(),
      Err(BuildError::IncompatibleSchema { .. })
    ));
  }

  #[test]
  fn test_parallel_child_needs_id() {
    let mut builder = Workflow::builder("wf");
    builder
      .parallel([
        Node::from(passthrough("a")),
        Node::Sequence(vec![passthrough("b").into()]),
      ])
      .unwrap();

    assert!(matches!(
      builder.commit(),
      Err(BuildError::InvalidNode { kind: "parallel", .. })
    ));
  }

  #[test]
  fn test_loop_feedback_checked() {
    let mut builder = Workflow::builder("wf");
    builder
      .dountil(
        step("count", object("value", "number"), object("total", "number")),
        |out| out["total"].as_i64().unwrap_or_default() > 3,
      )
      .unwrap();

    assert!(matches!(
      builder.commit(),
      Err(BuildError::IncompatibleSchema { .. })
    ));

    let mut builder = Workflow::builder("wf");
    builder
      .dountil(
        step("count", object("value", "number"), object("value", "number")),
        |out| out["value"].as_i64().unwrap_or_default() > 3,
      )
      .unwrap();
    assert!(builder.commit().is_ok());
  }

  #[test]
  fn test_foreach_requires_array_input() {
    let mut builder = Workflow::builder("wf");
    builder
      .then(step("list", json!({}), json!({ "type": "array", "items": { "type": "number" } })))
      .unwrap()
      .foreach(
        step("square", json!({ "type": "number" }), json!({ "type": "number" })),
        ForeachOptions { concurrency: 4 },
      )
      .unwrap()
      .then(step(
        "sum",
        json!({ "type": "array", "items": { "type": "number" } }),
        json!({}),
      ))
      .unwrap();
    assert!(builder.commit().is_ok());

    let mut builder = Workflow::builder("wf");
    builder
      .then(step("one", json!({}), json!({ "type": "object" })))
      .unwrap()
      .foreach(passthrough("each"), ForeachOptions::default())
      .unwrap();
    assert!(matches!(
      builder.commit(),
      Err(BuildError::IncompatibleSchema { ref to, .. }) if to == "each"
    ));
  }

  #[test]
  fn test_foreach_zero_concurrency_rejected() {
    let mut builder = Workflow::builder("wf");
    builder
      .foreach(passthrough("each"), ForeachOptions { concurrency: 0 })
      .unwrap();

    assert!(matches!(
      builder.commit(),
      Err(BuildError::InvalidNode { kind: "foreach", .. })
    ));
  }

  #[test]
  fn test_map_bridges_incompatible_steps() {
    let mut builder = Workflow::builder("wf");
    builder
      .then(step("one", json!({}), object("doubled", "number")))
      .unwrap()
      .map(|ctx| async move { Ok(json!({ "value": ctx.input["doubled"] })) })
      .unwrap()
      .then(step("two", object("value", "number"), json!({})))
      .unwrap();

    assert!(builder.commit().is_ok());
  }

  // === Nesting ===

  #[test]
  fn test_nested_workflow_registry() {
    let mut inner = Workflow::builder("inner");
    inner
      .then(passthrough("a"))
      .unwrap()
      .then(passthrough("b"))
      .unwrap();
    let inner = inner.commit().unwrap();

    let mut outer = Workflow::builder("outer");
    outer
      .then(passthrough("a"))
      .unwrap()
      .then(inner)
      .unwrap()
      .sleep(Duration::from_millis(5))
      .unwrap();
    let outer = outer.commit().unwrap();

    assert!(outer.nested("inner").is_some());
    assert_eq!(outer.find_step("inner.b").map(|s| s.id()), Some("b"));
    assert!(outer.find_step("inner.missing").is_none());
    assert_eq!(outer.step_paths(), vec!["a", "inner", "inner.a", "inner.b"]);
  }
}
