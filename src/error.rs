use std::fmt::Display;
use std::sync::Arc;

use camino::Utf8PathBuf;
use serde::Serialize;
use thiserror::Error;

/// Result returned from every task hook.
pub type TaskResult<T> = anyhow::Result<T, anyhow::Error>;

/// Broad classification of a task failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ErrorKind {
    /// Setup failed in `prepare`, e.g. a scratch directory could not be made.
    Preparation,
    /// The task body or a completion hook failed.
    Execution,
    /// A child failed and the failure was not attributed to a more specific kind.
    ChildFailure,
    /// An external tool exited abnormally or could not be launched.
    Process,
    /// Cancellation was requested. This is a terminal outcome, not a fault.
    Canceled,
    /// A hook panicked.
    Panic,
}

impl Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            ErrorKind::Preparation => "preparation failure",
            ErrorKind::Execution => "execution failure",
            ErrorKind::ChildFailure => "child failure",
            ErrorKind::Process => "process failure",
            ErrorKind::Canceled => "canceled",
            ErrorKind::Panic => "panic",
        };

        f.write_str(text)
    }
}

/// Structured error attached to a task once it fails.
///
/// `TaskError` is cheap to clone, the optional source is shared. When a
/// failure travels up the tree the kind is kept and every ancestor that
/// adopted it is appended to the trail, so the error surfaced at the root
/// still says *what* went wrong and *where*.
#[derive(Debug, Error, Clone)]
#[error("{kind} in task '{task}': {message}")]
pub struct TaskError {
    kind: ErrorKind,
    task: String,
    message: String,
    trail: Vec<String>,
    #[source]
    source: Option<SharedError>,
}

/// An `anyhow::Error` behind an `Arc`, so that [`TaskError`] stays `Clone`.
#[derive(Debug, Clone)]
pub struct SharedError(pub(crate) Arc<anyhow::Error>);

impl Display for SharedError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        Display::fmt(&*self.0, f)
    }
}

impl std::error::Error for SharedError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        let inner: &(dyn std::error::Error + Send + Sync + 'static) = (*self.0).as_ref();
        inner.source()
    }
}

impl TaskError {
    pub fn new(kind: ErrorKind, task: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind,
            task: task.into(),
            message: message.into(),
            trail: Vec::new(),
            source: None,
        }
    }

    pub fn preparation(task: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Preparation, task, message)
    }

    pub fn execution(task: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Execution, task, message)
    }

    pub fn process(task: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Process, task, message)
    }

    pub fn canceled(task: impl Into<String>) -> Self {
        Self::new(ErrorKind::Canceled, task, "cancellation requested")
    }

    /// Wraps an arbitrary error produced by the hook of `task`. If the error
    /// already is a [`TaskError`] it is returned untouched.
    pub fn from_anyhow(kind: ErrorKind, task: &str, err: anyhow::Error) -> Self {
        match err.downcast::<TaskError>() {
            Ok(err) => err,
            Err(err) => Self {
                kind,
                task: task.to_string(),
                message: format!("{err:#}"),
                trail: Vec::new(),
                source: Some(SharedError(Arc::new(err))),
            },
        }
    }

    pub fn with_source(mut self, source: impl Into<anyhow::Error>) -> Self {
        self.source = Some(SharedError(Arc::new(source.into())));
        self
    }

    /// The same error, as adopted by the parent `task`.
    pub(crate) fn propagate(&self, task: &str) -> Self {
        let mut err = self.clone();
        err.trail.push(task.to_string());
        err
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Name of the task where the failure originated.
    pub fn task(&self) -> &str {
        &self.task
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// Ancestors which adopted this error, innermost first.
    pub fn trail(&self) -> &[String] {
        &self.trail
    }

    /// True when this error was reported by a child rather than raised by
    /// the task holding it.
    pub fn is_child_failure(&self) -> bool {
        self.kind == ErrorKind::ChildFailure || !self.trail.is_empty()
    }

    pub fn is_canceled(&self) -> bool {
        self.kind == ErrorKind::Canceled
    }
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Failed to build the worker pool")]
    Pool(#[from] rayon::ThreadPoolBuildError),

    #[error("Failed to spawn the coordinator thread for '{0}'")]
    Coordinator(String, #[source] std::io::Error),

    #[error("Invalid scheduler configuration:\n{0}")]
    Config(#[from] serde_json::Error),

    #[error("Invalid value '{1}' for {0}")]
    ConfigValue(&'static str, String),
}

#[derive(Debug, Error)]
pub enum ScratchError {
    #[error("Couldn't create temporary root '{0}'.\n{1}")]
    Root(Utf8PathBuf, #[source] std::io::Error),

    #[error("Couldn't create directory '{0}'.\n{1}")]
    Create(Utf8PathBuf, #[source] std::io::Error),
}

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("Couldn't launch '{0}'.\n{1}")]
    Launch(String, #[source] std::io::Error),

    #[error("Couldn't wait for '{0}'.\n{1}")]
    Wait(String, #[source] std::io::Error),

    #[error("Couldn't extend search path.\n{0}")]
    SearchPath(#[from] std::env::JoinPathsError),

    #[error("Process '{0}' was canceled")]
    Canceled(String),
}
