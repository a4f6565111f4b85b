//! The task model.
//!
//! A task is a unit of work with four hooks, all optional:
//!
//! * `prepare` does synchronous setup and may return the first children,
//! * `run` is the body of leaf work and may return more children,
//! * `on_child_finished` is called once for every child that terminates and
//!   may return follow-up children,
//! * `cleanup` runs exactly once when the task itself terminates.
//!
//! Users implement [`TypedTask`], which names its output type. The blanket
//! impl below erases it into [`Task`], which is what the scheduler stores.
mod diagnostics;
mod handle;
mod runner;

use std::any::{Any, type_name};
use std::sync::{Arc, Mutex};

use camino::Utf8PathBuf;

use crate::core::{CancelToken, Dynamic, TaskId, TaskState};
use crate::error::{ScratchError, TaskError, TaskResult};
use crate::scratch::ScratchSpace;

pub use crate::engine::diagnostics::{Diagnostics, TaskExecution, TaskRecord};
pub use crate::engine::handle::TaskHandle;
pub(crate) use crate::engine::runner::Runner;

/// A type-erased task, as stored in the task tree.
pub type BoxedTask = Box<dyn Task>;

/// Children returned from a hook, in the order they should be spawned.
pub type Children = Vec<BoxedTask>;

/// Erases a typed task so it can be returned as a child.
pub fn boxed<T>(task: T) -> BoxedTask
where
    T: TypedTask + 'static,
{
    Box::new(task)
}

pub trait TypedTask: Send {
    /// The concrete output type of this task.
    type Output: Send + Sync + 'static;

    fn get_name(&self) -> String;

    fn prepare(&mut self, _: &TaskContext) -> TaskResult<Children> {
        Ok(Vec::new())
    }

    fn run(&mut self, _: &TaskContext) -> TaskResult<Children> {
        Ok(Vec::new())
    }

    fn on_child_finished(&mut self, _: &TaskContext, _: &ChildReport) -> TaskResult<Children> {
        Ok(Vec::new())
    }

    /// Releases whatever the task holds. Errors are recorded as diagnostics
    /// and never change the outcome of the task.
    fn cleanup(&mut self, _: &TaskContext) -> TaskResult<()> {
        Ok(())
    }

    /// Called once, only if the task finished successfully.
    fn output(&mut self) -> Option<Self::Output> {
        None
    }
}

/// The object-safe foundation under [`TypedTask`].
///
/// This trait is implemented for every `TypedTask` and should not need to be
/// implemented by hand.
pub trait Task: Send {
    fn get_name(&self) -> String;

    fn get_output_type_name(&self) -> &'static str;

    fn prepare(&mut self, context: &TaskContext) -> TaskResult<Children>;

    fn run(&mut self, context: &TaskContext) -> TaskResult<Children>;

    fn on_child_finished(&mut self, context: &TaskContext, child: &ChildReport)
    -> TaskResult<Children>;

    fn cleanup(&mut self, context: &TaskContext) -> TaskResult<()>;

    fn output(&mut self) -> Option<Dynamic>;

    fn as_any(&self) -> &dyn Any;
}

// A blanket implementation to automatically bridge the two. This is where the
// type erasure actually happens.
impl<T> Task for T
where
    T: TypedTask + 'static,
{
    fn get_name(&self) -> String {
        T::get_name(self)
    }

    fn get_output_type_name(&self) -> &'static str {
        type_name::<T::Output>()
    }

    fn prepare(&mut self, context: &TaskContext) -> TaskResult<Children> {
        T::prepare(self, context)
    }

    fn run(&mut self, context: &TaskContext) -> TaskResult<Children> {
        T::run(self, context)
    }

    fn on_child_finished(
        &mut self,
        context: &TaskContext,
        child: &ChildReport,
    ) -> TaskResult<Children> {
        T::on_child_finished(self, context, child)
    }

    fn cleanup(&mut self, context: &TaskContext) -> TaskResult<()> {
        T::cleanup(self, context)
    }

    fn output(&mut self) -> Option<Dynamic> {
        T::output(self).map(|output| Arc::new(output) as Dynamic)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Everything a hook may need from the engine while it runs.
pub struct TaskContext {
    id: TaskId,
    name: String,
    token: CancelToken,
    scratch: Arc<ScratchSpace>,
    warnings: Mutex<Vec<String>>,
    span: tracing::Span,
}

impl TaskContext {
    pub(crate) fn new(
        id: TaskId,
        name: String,
        token: CancelToken,
        scratch: Arc<ScratchSpace>,
        span: tracing::Span,
    ) -> Self {
        Self {
            id,
            name,
            token,
            scratch,
            warnings: Mutex::new(Vec::new()),
            span,
        }
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn token(&self) -> &CancelToken {
        &self.token
    }

    pub fn is_canceled(&self) -> bool {
        self.token.is_canceled()
    }

    /// Returns a `Canceled` error if cancellation was requested, for use
    /// with `?` at stage boundaries inside long hooks.
    pub fn check_canceled(&self) -> Result<(), TaskError> {
        if self.is_canceled() {
            Err(TaskError::canceled(&self.name))
        } else {
            Ok(())
        }
    }

    /// Allocates a scratch directory owned by this task. It is removed when
    /// the task terminates, whatever the outcome.
    pub fn scratch_dir(&self, hint: &str) -> Result<Utf8PathBuf, ScratchError> {
        self.scratch.create_dir(self.id, hint)
    }

    pub fn scratch(&self) -> &ScratchSpace {
        &self.scratch
    }

    /// Attaches a warning to this task. Warnings end up in the
    /// [`Diagnostics`] of the whole tree.
    pub fn warn(&self, message: impl Into<String>) {
        let message = message.into();
        tracing::warn!(parent: &self.span, "{message}");
        self.warnings
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(message);
    }

    pub fn span(&self) -> &tracing::Span {
        &self.span
    }

    pub(crate) fn take_warnings(&self) -> Vec<String> {
        std::mem::take(&mut *self.warnings.lock().unwrap_or_else(|e| e.into_inner()))
    }
}

/// A child which has just reached a terminal state, as seen by its parent.
pub struct ChildReport<'a> {
    pub(crate) id: TaskId,
    pub(crate) name: &'a str,
    pub(crate) state: TaskState,
    pub(crate) error: Option<&'a TaskError>,
    pub(crate) output: Option<&'a Dynamic>,
    pub(crate) task: Option<&'a dyn Task>,
}

impl<'a> ChildReport<'a> {
    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn name(&self) -> &'a str {
        self.name
    }

    pub fn state(&self) -> TaskState {
        self.state
    }

    pub fn error(&self) -> Option<&'a TaskError> {
        self.error
    }

    pub fn is_finished(&self) -> bool {
        self.state == TaskState::Finished
    }

    pub fn is_canceled(&self) -> bool {
        self.state == TaskState::Canceled
    }

    pub fn has_error(&self) -> bool {
        self.state == TaskState::Failed
    }

    /// Whether the child is a task of type `T`.
    pub fn is<T: Any>(&self) -> bool {
        self.task.is_some_and(|task| task.as_any().is::<T>())
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&'a T> {
        self.task.and_then(|task| task.as_any().downcast_ref::<T>())
    }

    /// The output of a finished child, if it has the expected type.
    pub fn output<T: Any>(&self) -> Option<&'a T> {
        self.output.and_then(|output| output.downcast_ref::<T>())
    }
}
