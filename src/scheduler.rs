use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::core::Dynamic;
use crate::engine::{BoxedTask, Runner, TaskHandle, TypedTask};
use crate::error::{EngineError, TaskError};
use crate::scratch::ScratchSpace;

/// What happens to the siblings of a child that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailurePolicy {
    /// No further children are spawned, siblings already running are left
    /// to finish on their own.
    #[default]
    FailFast,
    /// Like `FailFast`, and the running siblings are canceled as well.
    CancelSiblings,
}

/// Settings of a [`Scheduler`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Worker threads in the pool, `0` lets rayon decide.
    pub workers: usize,
    pub failure_policy: FailurePolicy,
    /// Prefix for the names of worker and coordinator threads.
    pub thread_prefix: String,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            workers: 0,
            failure_policy: FailurePolicy::FailFast,
            thread_prefix: String::from("taskforge"),
        }
    }
}

impl SchedulerConfig {
    /// Reads `TASKFORGE_WORKERS` and `TASKFORGE_FAILURE_POLICY`
    /// (`fail-fast` or `cancel-siblings`), keeping defaults for anything
    /// unset.
    pub fn from_env() -> Result<Self, EngineError> {
        let mut config = Self::default();

        if let Ok(workers) = std::env::var("TASKFORGE_WORKERS") {
            config.workers = workers
                .trim()
                .parse()
                .map_err(|_| EngineError::ConfigValue("TASKFORGE_WORKERS", workers))?;
        }

        if let Ok(policy) = std::env::var("TASKFORGE_FAILURE_POLICY") {
            config.failure_policy = match policy.trim() {
                "fail-fast" => FailurePolicy::FailFast,
                "cancel-siblings" => FailurePolicy::CancelSiblings,
                _ => return Err(EngineError::ConfigValue("TASKFORGE_FAILURE_POLICY", policy)),
            };
        }

        Ok(config)
    }

    pub fn from_json(json: &str) -> Result<Self, EngineError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.failure_policy = policy;
        self
    }
}

/// Executes task trees on a shared worker pool.
///
/// Every submitted tree gets its own coordinator thread which owns the tree
/// and serializes all completion callbacks; the bodies of the tasks run on
/// the pool. The scheduler itself is cheap to clone.
#[derive(Clone)]
pub struct Scheduler {
    pool: Arc<rayon::ThreadPool>,
    scratch: Arc<ScratchSpace>,
    config: Arc<SchedulerConfig>,
}

impl Scheduler {
    pub fn new(config: SchedulerConfig) -> Result<Self, EngineError> {
        let prefix = config.thread_prefix.clone();
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(config.workers)
            .thread_name(move |i| format!("{prefix}-worker-{i}"))
            .build()?;

        Ok(Self {
            pool: Arc::new(pool),
            scratch: ScratchSpace::global(),
            config: Arc::new(config),
        })
    }

    /// Replaces the process-wide scratch space with `scratch`.
    pub fn with_scratch(mut self, scratch: Arc<ScratchSpace>) -> Self {
        self.scratch = scratch;
        self
    }

    pub fn scratch(&self) -> &Arc<ScratchSpace> {
        &self.scratch
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Starts executing `task` and returns immediately.
    pub fn submit<T>(&self, task: T) -> Result<TaskHandle, EngineError>
    where
        T: TypedTask + 'static,
    {
        self.submit_boxed(Box::new(task))
    }

    pub fn submit_boxed(&self, task: BoxedTask) -> Result<TaskHandle, EngineError> {
        let (runner, handle) = Runner::new(
            task,
            self.pool.clone(),
            self.scratch.clone(),
            self.config.failure_policy,
        );

        std::thread::Builder::new()
            .name(format!("{}-{}", self.config.thread_prefix, handle.id().get()))
            .spawn(move || runner.run())
            .map_err(|e| EngineError::Coordinator(handle.name().to_string(), e))?;

        Ok(handle)
    }

    /// Submits `task` and blocks until it is done.
    pub fn run<T>(&self, task: T) -> Result<Dynamic, TaskError>
    where
        T: TypedTask + 'static,
    {
        let name = task.get_name();
        let handle = self
            .submit(task)
            .map_err(|e| {
                TaskError::execution(name, "couldn't start the task tree").with_source(e)
            })?;

        handle.result()
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("workers", &self.pool.current_num_threads())
            .field("scratch", &self.scratch)
            .field("config", &self.config)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_from_json() {
        let config = SchedulerConfig::from_json(
            r#"{ "workers": 3, "failure_policy": "cancel-siblings" }"#,
        )
        .unwrap();

        assert_eq!(config.workers, 3);
        assert_eq!(config.failure_policy, FailurePolicy::CancelSiblings);
        assert_eq!(config.thread_prefix, "taskforge");
    }

    #[test]
    fn test_config_rejects_unknown_policy() {
        let err = SchedulerConfig::from_json(r#"{ "failure_policy": "retry" }"#).unwrap_err();
        assert!(matches!(err, EngineError::Config(_)));
    }

    #[test]
    fn test_builder() {
        let config = SchedulerConfig::default()
            .workers(2)
            .failure_policy(FailurePolicy::CancelSiblings);

        let scheduler = Scheduler::new(config).unwrap();
        assert_eq!(scheduler.config().workers, 2);
        assert_eq!(scheduler.pool.current_num_threads(), 2);
    }
}
