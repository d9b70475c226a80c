use std::collections::HashMap;
use std::sync::Arc;

use crate::builder::WorkflowBuilder;
use crate::node::Node;
use crate::schema::Schema;
use crate::step::Step;

/// A committed workflow ready for execution.
///
/// Only [`WorkflowBuilder::commit`] produces one, so every instance has a
/// validated plan. It is immutable and can be shared across any number of
/// runs.
#[derive(Debug)]
pub struct Workflow {
  pub(crate) id: String,
  pub(crate) description: Option<String>,
  pub(crate) input_schema: Arc<dyn Schema>,
  pub(crate) output_schema: Arc<dyn Schema>,
  pub(crate) nodes: Vec<Node>,
  pub(crate) steps: HashMap<String, Arc<Step>>,
  pub(crate) workflows: HashMap<String, Arc<Workflow>>,
}

impl Workflow {
  pub fn builder(id: impl Into<String>) -> WorkflowBuilder {
    WorkflowBuilder::new(id)
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

  /// Top-level plan, executed as a sequence.
  pub fn nodes(&self) -> &[Node] {
    &self.nodes
  }

  /// Step registered directly in this workflow (not inside a nested one).
  pub fn step(&self, id: &str) -> Option<&Arc<Step>> {
    self.steps.get(id)
  }

  pub fn steps(&self) -> impl Iterator<Item = &Arc<Step>> {
    self.steps.values()
  }

  /// Nested workflow registered directly in this workflow.
  pub fn nested(&self, id: &str) -> Option<&Arc<Workflow>> {
    self.workflows.get(id)
  }

  /// Find the step behind a dotted path such as `outer.inner.step`.
  pub fn find_step(&self, path: &str) -> Option<&Arc<Step>> {
    match path.split_once('.') {
      None => self.step(path),
      Some((head, rest)) => self.nested(head)?.find_step(rest),
    }
  }

  /// Every state-map path a run of this workflow can write.
  pub fn step_paths(&self) -> Vec<String> {
    let mut paths = Vec::new();
    for node in &self.nodes {
      node.step_paths("", &mut paths);
    }
    paths
  }
}
