#![forbid(unsafe_code)]
//! Hierarchical, cancellable task trees for driving external tools.
//!
//! A task is submitted to a [`Scheduler`], which runs its hooks on a worker
//! pool and grows the tree from whatever children the hooks return. Parents
//! react to each terminated child in [`TypedTask::on_child_finished`]; the
//! first failure of a child becomes the failure of the parent, a canceled
//! child cancels it. Every task gets its [`TypedTask::cleanup`] exactly once,
//! children before parents, and loses its scratch directories when it
//! terminates.
//!
//! ```no_run
//! use taskforge::{Children, Scheduler, SchedulerConfig, TaskContext, TaskResult, TypedTask};
//!
//! struct Count(usize);
//!
//! impl TypedTask for Count {
//!     type Output = usize;
//!
//!     fn get_name(&self) -> String {
//!         String::from("count")
//!     }
//!
//!     fn run(&mut self, context: &TaskContext) -> TaskResult<Children> {
//!         context.check_canceled()?;
//!         self.0 = 42;
//!         Ok(Vec::new())
//!     }
//!
//!     fn output(&mut self) -> Option<usize> {
//!         Some(self.0)
//!     }
//! }
//!
//! let scheduler = Scheduler::new(SchedulerConfig::default())?;
//! let handle = scheduler.submit(Count(0))?;
//! assert_eq!(handle.output::<usize>()?.as_deref(), Some(&42));
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! [`ActiveOperations`] keeps at most one task per key alive, which is what
//! interactive callers restarting a search on every keystroke need.
//! [`pipeline::Pipeline`] shows a complete composition: write an input
//! artifact, run a tool over it, collect what it produced.

mod core;
mod engine;
mod error;
#[cfg(feature = "logging")]
mod logging;
mod operation;
pub mod pipeline;
pub mod process;
mod scheduler;
mod scratch;
mod utils;

pub use crate::core::{CancelToken, Dynamic, TaskId, TaskState};
pub use crate::engine::{
    BoxedTask, ChildReport, Children, Diagnostics, Task, TaskContext, TaskExecution, TaskHandle,
    TaskRecord, TypedTask, boxed,
};
pub use crate::error::*;
#[cfg(feature = "logging")]
pub use crate::logging::init_logging;
pub use crate::operation::ActiveOperations;
pub use crate::scheduler::{FailurePolicy, Scheduler, SchedulerConfig};
pub use crate::scratch::ScratchSpace;
