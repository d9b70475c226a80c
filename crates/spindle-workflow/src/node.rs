use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use serde_json::Value;

use crate::step::{Step, StepError};
use crate::workflow::Workflow;

/// Predicate evaluated against a value produced during the run.
pub type Condition = Arc<dyn Fn(&Value) -> bool + Send + Sync>;

/// Async transformation between steps, used by `map` nodes.
pub type Transform =
  Arc<dyn Fn(MapContext) -> BoxFuture<'static, Result<Value, StepError>> + Send + Sync>;

/// What a `map` transform can see.
#[derive(Debug, Clone)]
pub struct MapContext {
  /// Output of the preceding node.
  pub input: Value,
  /// Outputs of every step that has succeeded so far, keyed by step path.
  pub results: BTreeMap<String, Value>,
  /// Input the run was started with.
  pub init_data: Value,
}

impl MapContext {
  pub fn step_output(&self, path: &str) -> Option<&Value> {
    self.results.get(path)
  }
}

/// One arm of a `branch` node.
#[derive(Clone)]
pub struct BranchArm {
  pub condition: Condition,
  pub node: Node,
}

impl BranchArm {
  pub fn new<F>(condition: F, node: impl Into<Node>) -> Self
  where
    F: Fn(&Value) -> bool + Send + Sync + 'static,
  {
    Self {
      condition: Arc::new(condition),
      node: node.into(),
    }
  }
}

impl fmt::Debug for BranchArm {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("BranchArm").field("node", &self.node).finish()
  }
}

/// A node in a committed workflow's execution plan.
#[derive(Clone)]
pub enum Node {
  Step(Arc<Step>),
  /// Children run in order, each fed the previous child's output.
  Sequence(Vec<Node>),
  /// Children run concurrently on the same input.
  Parallel(Vec<Node>),
  /// The first arm whose condition holds on the input runs.
  Branch(Vec<BranchArm>),
  /// Body runs, then repeats while the condition holds on its output.
  DoWhile { body: Box<Node>, condition: Condition },
  /// Body runs, then repeats until the condition holds on its output.
  DoUntil { body: Box<Node>, condition: Condition },
  /// The step runs once per element of an array input.
  Foreach { step: Arc<Step>, concurrency: usize },
  Map { id: String, transform: Transform },
  /// Waits, then passes its input through.
  Sleep { id: String, duration: Duration },
  Workflow(Arc<Workflow>),
}

impl Node {
  /// The identifier under which this node's result is recorded, if any.
  pub fn id(&self) -> Option<&str> {
    match self {
      Node::Step(step) | Node::Foreach { step, .. } => Some(step.id()),
      Node::Map { id, .. } | Node::Sleep { id, .. } => Some(id),
      Node::Workflow(workflow) => Some(workflow.id()),
      Node::Sequence(_)
      | Node::Parallel(_)
      | Node::Branch(_)
      | Node::DoWhile { .. }
      | Node::DoUntil { .. } => None,
    }
  }

  pub fn kind(&self) -> &'static str {
    match self {
      Node::Step(_) => "step",
      Node::Sequence(_) => "sequence",
      Node::Parallel(_) => "parallel",
      Node::Branch(_) => "branch",
      Node::DoWhile { .. } => "dowhile",
      Node::DoUntil { .. } => "dountil",
      Node::Foreach { .. } => "foreach",
      Node::Map { .. } => "map",
      Node::Sleep { .. } => "sleep",
      Node::Workflow(_) => "workflow",
    }
  }

  /// Collect the step record paths this node can write, qualified by
  /// `prefix`. `map` and `sleep` nodes keep no step record.
  pub fn step_paths(&self, prefix: &str, out: &mut Vec<String>) {
    match self {
      Node::Sequence(children) | Node::Parallel(children) => {
        for child in children {
          child.step_paths(prefix, out);
        }
      }
      Node::Branch(arms) => {
        for arm in arms {
          arm.node.step_paths(prefix, out);
        }
      }
      Node::DoWhile { body, .. } | Node::DoUntil { body, .. } => body.step_paths(prefix, out),
      Node::Workflow(workflow) => {
        let path = format!("{prefix}{}", workflow.id());
        let nested = format!("{path}.");
        out.push(path);
        for child in workflow.nodes() {
          child.step_paths(&nested, out);
        }
      }
      Node::Step(step) | Node::Foreach { step, .. } => out.push(format!("{prefix}{}", step.id())),
      Node::Map { .. } | Node::Sleep { .. } => {}
    }
  }
}

impl fmt::Debug for Node {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Node::Step(step) => f.debug_tuple("Step").field(&step.id()).finish(),
      Node::Sequence(children) => f.debug_tuple("Sequence").field(children).finish(),
      Node::Parallel(children) => f.debug_tuple("Parallel").field(children).finish(),
      Node::Branch(arms) => f.debug_tuple("Branch").field(arms).finish(),
      Node::DoWhile { body, .. } => f.debug_struct("DoWhile").field("body", body).finish(),
      Node::DoUntil { body, .. } => f.debug_struct("DoUntil").field("body", body).finish(),
      Node::Foreach { step, concurrency } => f
        .debug_struct("Foreach")
        .field("step", &step.id())
        .field("concurrency", concurrency)
        .finish(),
      Node::Map { id, .. } => f.debug_struct("Map").field("id", id).finish(),
      Node::Sleep { id, duration } => f
        .debug_struct("Sleep")
        .field("id", id)
        .field("duration", duration)
        .finish(),
      Node::Workflow(workflow) => f.debug_tuple("Workflow").field(&workflow.id()).finish(),
    }
  }
}

impl From<Step> for Node {
  fn from(step: Step) -> Self {
    Node::Step(Arc::new(step))
  }
}

impl From<Arc<Step>> for Node {
  fn from(step: Arc<Step>) -> Self {
    Node::Step(step)
  }
}

impl From<Workflow> for Node {
  fn from(workflow: Workflow) -> Self {
    Node::Workflow(Arc::new(workflow))
  }
}

impl From<Arc<Workflow>> for Node {
  fn from(workflow: Arc<Workflow>) -> Self {
    Node::Workflow(workflow)
  }
}
