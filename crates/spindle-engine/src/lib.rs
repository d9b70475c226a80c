//! Spindle Engine
//!
//! Executes committed workflows. A [`WorkflowRuntime`] pairs a workflow with
//! a snapshot store and creates [`Run`]s; each run walks the workflow's plan,
//! persisting a snapshot after every step transition so it can be suspended
//! and resumed, even from another process.
//!
//! # Usage
//!
//! ```ignore
//! let runtime = WorkflowRuntime::new(workflow, Arc::new(InMemoryStore::new()));
//!
//! let run = runtime.create_run();
//! run.watch(|event| println!("{} -> {}", event.path, event.status));
//!
//! match run.start(json!({ "inputValue": 30 })).await? {
//!   RunResult::Suspended { suspended, .. } => {
//!     let run = runtime.run(run.run_id()).await?;
//!     run.resume(ResumeRequest::new(json!({ "extraNumber": 5 })).step(&suspended[0])).await?;
//!   }
//!   other => println!("{:?}", other.status()),
//! }
//! ```

mod error;
mod events;
mod execution;
mod result;
mod run;
mod runtime;

pub use error::EngineError;
pub use events::{ChannelObserver, RunObserver, WatchEvent, WatchId};
pub use result::{ResumeRequest, RunResult};
pub use run::Run;
pub use runtime::{RuntimeConfig, WorkflowRuntime};
