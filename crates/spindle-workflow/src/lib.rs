//! Spindle Workflow
//!
//! Building blocks for spindle workflows: schema-typed [`Step`]s, the
//! combinators of [`WorkflowBuilder`], and the immutable [`Workflow`] plan
//! produced by [`WorkflowBuilder::commit`].
//!
//! A committed workflow is validated up front:
//! - node ids are unique and usable as state-map paths
//! - each node's output schema is assignable to the next node's input schema
//! - loop bodies accept their own output and `foreach` consumes arrays
//!
//! Execution lives in `spindle-engine`; this crate has no runtime state.

mod builder;
mod error;
mod node;
pub mod schema;
mod step;
mod workflow;

pub use builder::{ForeachOptions, WorkflowBuilder};
pub use error::BuildError;
pub use node::{BranchArm, Condition, MapContext, Node, Transform};
pub use schema::{JsonSchema, Schema, SchemaType, ValidationError};
pub use step::{Execute, Resources, Step, StepBuilder, StepContext, StepError, StepOutcome};
pub use workflow::Workflow;
