//! Registry of active agent runs.
//!
//! The `RunRegistry` is owned by the scheduler actor. It holds one
//! [`ActiveRun`] per task that currently occupies an agent slot and enforces
//! the concurrency limit for AUTO tasks.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::core::task::{Task, TaskId, TaskStatus};
use crate::{Error, Result};

/// An agent slot held by one task.
///
/// The slot is kept across `Continue` iterations of the same task and only
/// released when the task leaves the running state.
#[derive(Debug)]
pub struct ActiveRun {
    pub task_id: TaskId,
    /// 1-based number of the iteration currently executing.
    pub iteration: u32,
    pub started_at: DateTime<Utc>,
    /// Status the task returns to if the run is cancelled.
    pub pre_status: TaskStatus,
    pub is_auto: bool,
    /// Set while waiting out the retry delay after a failed iteration.
    pub awaiting_retry: bool,
    cancel: CancellationToken,
    handle: Option<JoinHandle<()>>,
    stop_waiters: Vec<oneshot::Sender<Result<Task>>>,
}

impl ActiveRun {
    pub fn new(task_id: TaskId, pre_status: TaskStatus, is_auto: bool) -> Self {
        Self {
            task_id,
            iteration: 0,
            started_at: Utc::now(),
            pre_status,
            is_auto,
            awaiting_retry: false,
            cancel: CancellationToken::new(),
            handle: None,
            stop_waiters: Vec::new(),
        }
    }

    /// Token for the iteration worker.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Record the worker executing the current iteration.
    pub fn attach(&mut self, iteration: u32, handle: JoinHandle<()>) {
        self.iteration = iteration;
        self.awaiting_retry = false;
        self.handle = Some(handle);
    }

    /// Forget the worker once it has reported back.
    pub fn detach(&mut self) -> Option<JoinHandle<()>> {
        self.handle.take()
    }

    pub fn is_executing(&self) -> bool {
        self.handle.is_some()
    }

    pub fn add_stop_waiter(&mut self, reply: oneshot::Sender<Result<Task>>) {
        self.stop_waiters.push(reply);
    }

    pub fn take_stop_waiters(&mut self) -> Vec<oneshot::Sender<Result<Task>>> {
        std::mem::take(&mut self.stop_waiters)
    }
}

/// Active runs keyed by task.
#[derive(Debug)]
pub struct RunRegistry {
    runs: HashMap<TaskId, ActiveRun>,
    max_concurrent: usize,
}

impl RunRegistry {
    /// # Arguments
    ///
    /// * `max_concurrent` - Maximum number of AUTO runs holding a slot at once
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            runs: HashMap::new(),
            max_concurrent,
        }
    }

    /// Register a run.
    ///
    /// # Errors
    ///
    /// Returns `TaskBusy` if the task already has a run, or a validation
    /// error if an AUTO run would exceed capacity.
    pub fn insert(&mut self, run: ActiveRun) -> Result<()> {
        if self.runs.contains_key(&run.task_id) {
            return Err(Error::TaskBusy(run.task_id));
        }
        if run.is_auto && !self.has_capacity() {
            return Err(Error::Validation(format!(
                "run registry is full ({} agents)",
                self.max_concurrent
            )));
        }
        self.runs.insert(run.task_id, run);
        Ok(())
    }

    pub fn get(&self, id: &TaskId) -> Option<&ActiveRun> {
        self.runs.get(id)
    }

    pub fn get_mut(&mut self, id: &TaskId) -> Option<&mut ActiveRun> {
        self.runs.get_mut(id)
    }

    pub fn remove(&mut self, id: &TaskId) -> Option<ActiveRun> {
        self.runs.remove(id)
    }

    pub fn contains(&self, id: &TaskId) -> bool {
        self.runs.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.runs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.runs.is_empty()
    }

    /// Number of AUTO runs holding a slot.
    pub fn auto_count(&self) -> usize {
        self.runs.values().filter(|r| r.is_auto).count()
    }

    pub fn has_capacity(&self) -> bool {
        self.auto_count() < self.max_concurrent
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    pub fn task_ids(&self) -> Vec<TaskId> {
        self.runs.keys().copied().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ActiveRun> {
        self.runs.values()
    }

    /// Cancel a task's run. Returns false if the task has none.
    pub fn cancel(&self, id: &TaskId) -> bool {
        match self.runs.get(id) {
            Some(run) => {
                run.cancel();
                true
            }
            None => false,
        }
    }

    pub fn cancel_all(&self) {
        for run in self.runs.values() {
            run.cancel();
        }
    }

    /// Remove every run, e.g. on shutdown.
    pub fn drain(&mut self) -> Vec<ActiveRun> {
        self.runs.drain().map(|(_, run)| run).collect()
    }
}
