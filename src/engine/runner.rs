use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::mpsc::{Receiver, Sender, channel};
use std::time::{Duration, Instant};

use petgraph::Direction;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::Dfs;
use rayon::ThreadPool;
use tracing::Level;
use tracing_indicatif::span_ext::IndicatifSpanExt;

use crate::core::{CancelToken, Dynamic, TaskId, TaskState};
use crate::engine::diagnostics::{Diagnostics, TaskExecution, TaskRecord};
use crate::engine::handle::{Shared, TaskHandle};
use crate::engine::{BoxedTask, ChildReport, Children, TaskContext};
use crate::error::{ErrorKind, TaskError, TaskResult};
use crate::scheduler::FailurePolicy;
use crate::scratch::ScratchSpace;
use crate::utils::{as_overhead, get_style_task, get_style_tree};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Stage {
    Prepare,
    Run,
}

/// Messages delivered to the coordinator of one task tree.
pub(crate) enum Event {
    /// A worker finished a `prepare` or `run` body and hands the task back.
    Done {
        index: NodeIndex,
        stage: Stage,
        task: BoxedTask,
        result: TaskResult<Children>,
        warnings: Vec<String>,
        elapsed: Duration,
    },
    /// The root token was canceled from outside.
    Cancel,
}

/// One entry of the task arena.
struct Node {
    id: TaskId,
    name: String,
    /// `None` while the task is out on a worker.
    task: Option<BoxedTask>,
    state: TaskState,
    token: CancelToken,
    error: Option<TaskError>,
    child_canceled: bool,
    children: Vec<NodeIndex>,
    pending: usize,
    /// Children returned from `prepare`, spawned once `run` is done.
    staged: Children,
    output: Option<Dynamic>,
    execution: TaskExecution,
    warnings: Vec<String>,
    span: tracing::Span,
}

impl Node {
    fn accepts_children(&self) -> bool {
        self.error.is_none() && !self.child_canceled && !self.token.is_canceled()
    }

    /// First failure wins, then cancellation, then success.
    fn resolve(&self) -> TaskState {
        if self.error.is_some() {
            TaskState::Failed
        } else if self.child_canceled || self.token.is_canceled() {
            TaskState::Canceled
        } else {
            TaskState::Finished
        }
    }
}

/// Drives a single submitted task tree to its terminal state.
///
/// The runner is the only owner of the tree. It lives on a dedicated
/// coordinator thread and reacts to events sent by rayon workers:
///
/// 1. Every new task is sent to the pool for `prepare`.
/// 2. When `prepare` returns, the task is sent back to the pool for `run`.
/// 3. When `run` returns, the children collected from both stages are added
///    to the arena and started, and the parent waits.
/// 4. When a task terminates, its cleanup runs here, then the parent's
///    `on_child_finished` runs here, so hooks of one parent never overlap.
/// 5. A parent terminates once its last pending child did.
///
/// Nothing blocks a worker while a parent waits for its children.
pub(crate) struct Runner {
    graph: DiGraph<Node, ()>,
    root: NodeIndex,
    pool: Arc<ThreadPool>,
    scratch: Arc<ScratchSpace>,
    policy: FailurePolicy,
    shared: Arc<Shared>,
    sender: Sender<Event>,
    receiver: Receiver<Event>,
    records: Vec<TaskRecord>,
    span: tracing::Span,
    done: bool,
}

impl Runner {
    pub(crate) fn new(
        task: BoxedTask,
        pool: Arc<ThreadPool>,
        scratch: Arc<ScratchSpace>,
        policy: FailurePolicy,
    ) -> (Self, TaskHandle) {
        let (sender, receiver) = channel();
        let name = task.get_name();

        let span = tracing::span!(Level::INFO, "tree", name = %name);
        if let Some(style) = get_style_tree() {
            span.pb_set_style(&style);
        }
        span.pb_set_length(0);
        span.pb_set_message(&name);

        let shared = Arc::new(Shared::new());
        let token = CancelToken::new();

        let mut runner = Runner {
            graph: DiGraph::new(),
            root: NodeIndex::end(),
            pool,
            scratch,
            policy,
            shared: shared.clone(),
            sender: sender.clone(),
            receiver,
            records: Vec::new(),
            span: span.clone(),
            done: false,
        };

        runner.root = runner.add_node(task, token.clone(), &span);
        let id = runner.graph[runner.root].id;
        let handle = TaskHandle::new(id, Arc::from(name), token, shared, sender);

        (runner, handle)
    }

    /// The scheduler loop. Returns once the root is terminal.
    pub(crate) fn run(mut self) {
        let span = self.span.clone();
        let _enter = span.enter();
        let start = Instant::now();

        tracing::info!("starting task tree");
        self.start(self.root);

        while !self.done {
            // The runner holds a sender itself, so this never disconnects.
            let Ok(event) = self.receiver.recv() else {
                break;
            };

            match event {
                Event::Done {
                    index,
                    stage,
                    task,
                    result,
                    warnings,
                    elapsed,
                } => self.on_done(index, stage, task, result, warnings, elapsed),
                Event::Cancel => {
                    tracing::info!("canceling task tree");
                    self.cancel_subtree(self.root);
                }
            }
        }

        let state = self.graph[self.root].state;
        tracing::info!("task tree {:?} {}", state, as_overhead(start.elapsed()));
    }

    fn add_node(
        &mut self,
        task: BoxedTask,
        token: CancelToken,
        parent: &tracing::Span,
    ) -> NodeIndex {
        let id = TaskId::next();
        let name = task.get_name();

        let span = tracing::span!(parent: parent, Level::INFO, "task", name = %name, id = %id);
        if let Some(style) = get_style_task() {
            span.pb_set_style(&style);
        }
        span.pb_set_message(&name);
        self.span.pb_inc_length(1);

        self.graph.add_node(Node {
            id,
            name,
            task: Some(task),
            state: TaskState::Created,
            token,
            error: None,
            child_canceled: false,
            children: Vec::new(),
            pending: 0,
            staged: Vec::new(),
            output: None,
            execution: TaskExecution::default(),
            warnings: Vec::new(),
            span,
        })
    }

    fn context(&self, index: NodeIndex) -> TaskContext {
        let node = &self.graph[index];
        TaskContext::new(
            node.id,
            node.name.clone(),
            node.token.clone(),
            self.scratch.clone(),
            node.span.clone(),
        )
    }

    fn parent(&self, index: NodeIndex) -> Option<NodeIndex> {
        self.graph
            .neighbors_directed(index, Direction::Incoming)
            .next()
    }

    fn set_state(&mut self, index: NodeIndex, state: TaskState) {
        let node = &mut self.graph[index];
        node.state = state;
        tracing::debug!(parent: &node.span, ?state, "transition");

        // The terminal state of the root is published by `complete`, after
        // cleanup has run.
        if index == self.root && !state.is_terminal() {
            self.shared.set_state(state);
        }
    }

    fn start(&mut self, index: NodeIndex) {
        if self.graph[index].token.is_canceled() {
            tracing::debug!(parent: &self.graph[index].span, "canceled before start");
            self.finalize(index);
            return;
        }

        self.dispatch(index, Stage::Prepare);
    }

    /// Sends one body of the task to the worker pool.
    fn dispatch(&mut self, index: NodeIndex, stage: Stage) {
        let context = self.context(index);
        let Some(mut task) = self.graph[index].task.take() else {
            return;
        };

        if stage == Stage::Run {
            self.set_state(index, TaskState::Running);
        }

        let sender = self.sender.clone();

        self.pool.spawn(move || {
            let start = Instant::now();

            // Canceled while waiting for a worker, the hook never starts.
            let result = if context.is_canceled() {
                Err(TaskError::canceled(context.name()).into())
            } else {
                let _enter = context.span().enter();
                guarded(context.name(), || match stage {
                    Stage::Prepare => task.prepare(&context),
                    Stage::Run => task.run(&context),
                })
            };

            let elapsed = start.elapsed();
            let warnings = context.take_warnings();

            // The coordinator only goes away once the tree is terminal.
            sender
                .send(Event::Done {
                    index,
                    stage,
                    task,
                    result,
                    warnings,
                    elapsed,
                })
                .ok();
        });
    }

    fn on_done(
        &mut self,
        index: NodeIndex,
        stage: Stage,
        task: BoxedTask,
        result: TaskResult<Children>,
        warnings: Vec<String>,
        elapsed: Duration,
    ) {
        let node = &mut self.graph[index];
        node.task = Some(task);
        node.warnings.extend(warnings);

        let kind = match stage {
            Stage::Prepare => {
                node.execution.prepare = elapsed;
                ErrorKind::Preparation
            }
            Stage::Run => {
                node.execution.run = elapsed;
                ErrorKind::Execution
            }
        };

        let children = match result {
            Ok(children) => children,
            Err(err) => {
                let err = TaskError::from_anyhow(kind, &node.name, err);

                if err.is_canceled() || node.token.is_canceled() {
                    tracing::debug!(parent: &node.span, "stopped after cancellation: {err}");
                    node.token.cancel();
                } else {
                    tracing::debug!(parent: &node.span, "failed: {err}");
                    node.error = Some(err);
                }

                self.finalize(index);
                return;
            }
        };

        if node.token.is_canceled() {
            if !children.is_empty() {
                tracing::debug!(parent: &node.span, "discarding {} children", children.len());
            }
            self.finalize(index);
            return;
        }

        match stage {
            Stage::Prepare => {
                node.staged = children;
                self.set_state(index, TaskState::Prepared);
                self.dispatch(index, Stage::Run);
            }
            Stage::Run => {
                let mut children_all = std::mem::take(&mut node.staged);
                children_all.extend(children);

                if children_all.is_empty() {
                    self.finalize(index);
                } else {
                    self.set_state(index, TaskState::WaitingOnChildren);
                    self.spawn_children(index, children_all);
                }
            }
        }
    }

    fn spawn_children(&mut self, parent: NodeIndex, children: Children) {
        let token = self.graph[parent].token.clone();
        let span = self.graph[parent].span.clone();

        let mut spawned = Vec::with_capacity(children.len());

        // Register every child first, so that a child which terminates
        // immediately cannot leave the parent with zero pending children.
        for task in children {
            let index = self.add_node(task, token.child(), &span);
            self.graph.add_edge(parent, index, ());

            let node = &mut self.graph[parent];
            node.children.push(index);
            node.pending += 1;
            spawned.push(index);
        }

        for index in spawned {
            self.start(index);
        }
    }

    /// Moves a task into its terminal state, runs its cleanup and reports it
    /// to the parent. All children are already terminal at this point.
    fn finalize(&mut self, index: NodeIndex) {
        if self.graph[index].state.is_terminal() {
            return;
        }

        let context = self.context(index);
        let node = &mut self.graph[index];

        if node.resolve() == TaskState::Finished
            && let Some(task) = node.task.as_mut()
        {
            match guarded(&node.name, || Ok(task.output())) {
                Ok(output) => node.output = output,
                Err(err) => {
                    let err = TaskError::from_anyhow(ErrorKind::Panic, &node.name, err);
                    tracing::debug!(parent: &node.span, "output failed: {err}");
                    node.error = Some(err);
                }
            }
        }

        let state = node.resolve();
        self.set_state(index, state);

        let node = &mut self.graph[index];
        if let Some(task) = node.task.as_mut() {
            if let Err(err) = guarded(&node.name, || task.cleanup(&context)) {
                tracing::warn!(parent: &node.span, "cleanup failed: {err:#}");
                node.warnings.push(format!("cleanup failed: {err:#}"));
            }
        }

        node.warnings.extend(context.take_warnings());
        node.warnings.extend(self.scratch.release(node.id));
        node.span = tracing::Span::none();
        self.span.pb_inc(1);

        let parent = self.parent(index);
        self.record(index, parent);

        match parent {
            Some(parent) => self.child_finished(parent, index),
            None => self.complete(),
        }
    }

    fn record(&mut self, index: NodeIndex, parent: Option<NodeIndex>) {
        let parent = parent.map(|parent| self.graph[parent].id);
        let node = &self.graph[index];

        self.records.push(TaskRecord {
            id: node.id,
            name: node.name.clone(),
            parent,
            state: node.state,
            execution: node.execution,
            error: node.error.as_ref().map(ToString::to_string),
            warnings: node.warnings.clone(),
        });
    }

    fn child_finished(&mut self, parent: NodeIndex, child: NodeIndex) {
        let child_state = self.graph[child].state;
        let child_error = self.graph[child].error.clone();

        let node = &mut self.graph[parent];
        node.pending -= 1;

        match child_state {
            // A failure observed after cancellation is just a consequence of it.
            TaskState::Failed if node.error.is_none() && !node.token.is_canceled() => {
                node.error = child_error.map(|err| err.propagate(&node.name));

                if self.policy == FailurePolicy::CancelSiblings {
                    let siblings = node.children.clone();
                    for sibling in siblings.into_iter().filter(|&s| s != child) {
                        if !self.graph[sibling].state.is_terminal() {
                            self.cancel_subtree(sibling);
                        }
                    }
                }
            }
            TaskState::Canceled => node.child_canceled = true,
            _ => {}
        }

        let context = self.context(parent);
        let Some(mut task) = self.graph[parent].task.take() else {
            return;
        };

        let result = {
            let node = &self.graph[child];
            let report = ChildReport {
                id: node.id,
                name: &node.name,
                state: node.state,
                error: node.error.as_ref(),
                output: node.output.as_ref(),
                task: node.task.as_deref(),
            };

            guarded(context.name(), || task.on_child_finished(&context, &report))
        };

        let node = &mut self.graph[parent];
        node.task = Some(task);
        node.warnings.extend(context.take_warnings());

        match result {
            Ok(children) if children.is_empty() => {}
            Ok(children) => {
                if node.accepts_children() {
                    self.spawn_children(parent, children);
                } else {
                    tracing::debug!(parent: &node.span, "discarding {} children", children.len());
                }
            }
            Err(err) => {
                let err = TaskError::from_anyhow(ErrorKind::Execution, &node.name, err);

                if err.is_canceled() {
                    node.token.cancel();
                } else if node.error.is_none() {
                    node.error = Some(err);
                }
            }
        }

        if self.graph[parent].pending == 0 {
            self.finalize(parent);
        }
    }

    fn cancel_subtree(&self, start: NodeIndex) {
        let mut dfs = Dfs::new(&self.graph, start);

        while let Some(index) = dfs.next(&self.graph) {
            self.graph[index].token.cancel();
        }
    }

    fn complete(&mut self) {
        let node = &self.graph[self.root];

        let outcome = match node.state {
            TaskState::Finished => Ok(node
                .output
                .clone()
                .unwrap_or_else(|| Arc::new(()) as Dynamic)),
            TaskState::Failed => Err(node
                .error
                .clone()
                .unwrap_or_else(|| TaskError::execution(&node.name, "failed without an error"))),
            _ => Err(TaskError::canceled(&node.name)),
        };

        let diagnostics = Diagnostics {
            records: std::mem::take(&mut self.records),
        };

        self.shared.complete(node.state, outcome, diagnostics);
        self.done = true;
    }
}

/// Runs a hook, turning a panic into an error of kind `Panic`.
fn guarded<T>(name: &str, f: impl FnOnce() -> TaskResult<T>) -> TaskResult<T> {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(result) => result,
        Err(panic) => {
            let msg = if let Some(s) = panic.downcast_ref::<&str>() {
                s.to_string()
            } else if let Some(s) = panic.downcast_ref::<String>() {
                s.clone()
            } else {
                String::from("unknown payload")
            };

            Err(TaskError::new(ErrorKind::Panic, name, format!("task panicked: {msg}")).into())
        }
    }
}
