//! At most one running task per named operation.
//!
//! Interactive consumers, e.g. a motif search restarted on every edit of the
//! pattern, register their task under a key. A new registration cancels the
//! task currently held under that key and waits until it is terminal before
//! the new one is submitted, so results of a superseded task are never
//! observable through [`ActiveOperations::current`].
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::core::{Dynamic, Hash32, TaskState};
use crate::engine::{TaskHandle, TypedTask};
use crate::error::{EngineError, TaskError};
use crate::scheduler::Scheduler;

#[derive(Default)]
struct Slot {
    handle: Option<TaskHandle>,
    fingerprint: Option<Hash32>,
}

pub struct ActiveOperations {
    scheduler: Scheduler,
    slots: Mutex<HashMap<String, Arc<Mutex<Slot>>>>,
}

impl ActiveOperations {
    pub fn new(scheduler: Scheduler) -> Self {
        Self {
            scheduler,
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// The registry lock is only held to find the slot, each slot has its
    /// own lock so that replacing one operation doesn't stall the others.
    fn slot(&self, key: &str) -> Arc<Mutex<Slot>> {
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        slots.entry(key.to_string()).or_default().clone()
    }

    /// Cancels whatever runs under `key`, waits for it to terminate, then
    /// submits the task built by `factory`.
    pub fn submit<T, F>(&self, key: &str, factory: F) -> Result<TaskHandle, EngineError>
    where
        T: TypedTask + 'static,
        F: FnOnce() -> T,
    {
        let slot = self.slot(key);
        let mut slot = lock(&slot);
        self.replace(key, &mut slot, factory, None)
    }

    /// Like [`submit`](Self::submit), but keeps the current task when it was
    /// started from the same `input` and has not failed or been canceled.
    pub fn submit_if_changed<T, F>(
        &self,
        key: &str,
        input: impl AsRef<[u8]>,
        factory: F,
    ) -> Result<TaskHandle, EngineError>
    where
        T: TypedTask + 'static,
        F: FnOnce() -> T,
    {
        let fingerprint = Hash32::hash(input);

        let slot = self.slot(key);
        let mut slot = lock(&slot);

        if let Some(handle) = &slot.handle
            && slot.fingerprint == Some(fingerprint)
            && !matches!(handle.state(), TaskState::Failed | TaskState::Canceled)
        {
            tracing::debug!(key, "input unchanged, keeping {}", handle.id());
            return Ok(handle.clone());
        }

        self.replace(key, &mut slot, factory, Some(fingerprint))
    }

    fn replace<T, F>(
        &self,
        key: &str,
        slot: &mut Slot,
        factory: F,
        fingerprint: Option<Hash32>,
    ) -> Result<TaskHandle, EngineError>
    where
        T: TypedTask + 'static,
        F: FnOnce() -> T,
    {
        if let Some(previous) = slot.handle.take() {
            tracing::info!(key, "superseding {}", previous.id());
            previous.cancel();
            previous.wait();
        }
        slot.fingerprint = None;

        let handle = self.scheduler.submit(factory())?;
        if let Some(fingerprint) = fingerprint {
            tracing::debug!(key, "started {} for input {}", handle.id(), fingerprint.to_hex());
        }

        slot.handle = Some(handle.clone());
        slot.fingerprint = fingerprint;
        Ok(handle)
    }

    /// The task currently registered under `key`.
    pub fn current(&self, key: &str) -> Option<TaskHandle> {
        let slot = self.slots.lock().unwrap_or_else(|e| e.into_inner()).get(key).cloned()?;
        let slot = lock(&slot);
        slot.handle.clone()
    }

    /// The outcome of the current task, if it is already done.
    pub fn current_result(&self, key: &str) -> Option<Result<Dynamic, TaskError>> {
        self.current(key)?.try_result()
    }

    /// Cancels the current task, waits for it and forgets it. Returns the
    /// state it ended in.
    ///
    /// The slot stays registered and locked until the task is terminal, a
    /// concurrent [`submit`](Self::submit) under the same key starts only
    /// afterwards.
    pub fn stop(&self, key: &str) -> Option<TaskState> {
        let slot = self.slots.lock().unwrap_or_else(|e| e.into_inner()).get(key).cloned()?;
        let mut slot = lock(&slot);
        let handle = slot.handle.take()?;
        slot.fingerprint = None;

        tracing::info!(key, "stopping {}", handle.id());
        handle.cancel();
        Some(handle.wait())
    }

    /// Keys that currently hold a task.
    pub fn keys(&self) -> Vec<String> {
        let slots: Vec<_> = {
            let slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
            slots.iter().map(|(key, slot)| (key.clone(), slot.clone())).collect()
        };

        slots
            .into_iter()
            .filter(|(_, slot)| lock(slot).handle.is_some())
            .map(|(key, _)| key)
            .collect()
    }
}

fn lock(slot: &Mutex<Slot>) -> MutexGuard<'_, Slot> {
    slot.lock().unwrap_or_else(|e| e.into_inner())
}
