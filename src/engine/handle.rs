use std::sync::mpsc::Sender;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::core::{CancelToken, Dynamic, TaskId, TaskState};
use crate::engine::diagnostics::Diagnostics;
use crate::engine::runner::Event;
use crate::error::TaskError;

/// Root state published by the coordinator, read by handles.
pub(crate) struct Shared {
    status: Mutex<Status>,
    changed: Condvar,
}

struct Status {
    state: TaskState,
    outcome: Option<Result<Dynamic, TaskError>>,
    diagnostics: Option<Arc<Diagnostics>>,
}

impl Shared {
    pub(crate) fn new() -> Self {
        Self {
            status: Mutex::new(Status {
                state: TaskState::Created,
                outcome: None,
                diagnostics: None,
            }),
            changed: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Status> {
        self.status.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn set_state(&self, state: TaskState) {
        self.lock().state = state;
        self.changed.notify_all();
    }

    pub(crate) fn complete(
        &self,
        state: TaskState,
        outcome: Result<Dynamic, TaskError>,
        diagnostics: Diagnostics,
    ) {
        let mut status = self.lock();
        status.state = state;
        status.outcome = Some(outcome);
        status.diagnostics = Some(Arc::new(diagnostics));
        drop(status);
        self.changed.notify_all();
    }
}

/// A handle to a submitted task tree.
///
/// Handles are cheap to clone; every clone observes the same root task.
/// Dropping all handles does not cancel the tree, it keeps running until it
/// reaches a terminal state.
#[derive(Clone)]
pub struct TaskHandle {
    id: TaskId,
    name: Arc<str>,
    token: CancelToken,
    shared: Arc<Shared>,
    events: Sender<Event>,
}

impl TaskHandle {
    pub(crate) fn new(
        id: TaskId,
        name: Arc<str>,
        token: CancelToken,
        shared: Arc<Shared>,
        events: Sender<Event>,
    ) -> Self {
        Self {
            id,
            name,
            token,
            shared,
            events,
        }
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Requests cancellation of the root and, through it, of every
    /// descendant. Running work is expected to notice cooperatively.
    pub fn cancel(&self) {
        if self.token.is_canceled() {
            return;
        }

        tracing::info!(task = %self.id, name = %self.name, "cancellation requested");
        self.token.cancel();
        // The coordinator is gone once the tree is terminal.
        self.events.send(Event::Cancel).ok();
    }

    pub fn is_cancel_requested(&self) -> bool {
        self.token.is_canceled()
    }

    pub fn state(&self) -> TaskState {
        self.shared.lock().state
    }

    pub fn is_terminal(&self) -> bool {
        self.state().is_terminal()
    }

    /// Blocks until the root reaches a terminal state.
    pub fn wait(&self) -> TaskState {
        let mut status = self.shared.lock();

        while status.outcome.is_none() {
            status = self
                .shared
                .changed
                .wait(status)
                .unwrap_or_else(|e| e.into_inner());
        }

        status.state
    }

    /// Like [`wait`](Self::wait), giving up after `timeout`.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<TaskState> {
        let deadline = Instant::now() + timeout;
        let mut status = self.shared.lock();

        while status.outcome.is_none() {
            let left = deadline.checked_duration_since(Instant::now())?;
            let (guard, _) = self
                .shared
                .changed
                .wait_timeout(status, left)
                .unwrap_or_else(|e| e.into_inner());
            status = guard;
        }

        Some(status.state)
    }

    /// Blocks until the tree is done and returns the root output, or the
    /// error that terminated it. A canceled tree yields an error of kind
    /// [`Canceled`](crate::ErrorKind::Canceled).
    pub fn result(&self) -> Result<Dynamic, TaskError> {
        self.wait();
        self.try_result()
            .unwrap_or_else(|| Err(TaskError::canceled(self.name.as_ref())))
    }

    /// The outcome, if the tree is already done.
    pub fn try_result(&self) -> Option<Result<Dynamic, TaskError>> {
        self.shared.lock().outcome.clone()
    }

    /// Blocks and downcasts the root output. `Ok(None)` means the root
    /// finished without an output of type `T`.
    pub fn output<T>(&self) -> Result<Option<Arc<T>>, TaskError>
    where
        T: Send + Sync + 'static,
    {
        let output = self.result()?;
        Ok(output.downcast::<T>().ok())
    }

    /// Diagnostics of the whole tree, available once it is done.
    pub fn diagnostics(&self) -> Option<Arc<Diagnostics>> {
        self.shared.lock().diagnostics.clone()
    }
}

impl std::fmt::Debug for TaskHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskHandle")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("state", &self.state())
            .finish()
    }
}
