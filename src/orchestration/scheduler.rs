//! Scheduler for agent runs.
//!
//! The `Scheduler` is an actor that owns the task state machine. It admits
//! AUTO tasks from a FIFO queue up to the agent capacity, keeps at most one
//! run per task, applies the signal of every finished iteration and hands
//! reviewed tasks to the merge coordinator. Callers talk to it through a
//! cloneable [`SchedulerHandle`] and observe it through [`SchedulerEvent`]s.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::core::task::{MergeReadiness, Task, TaskFilter, TaskId, TaskStatus, TaskType, TaskUpdate};
use crate::error::FailureReport;
use crate::orchestration::merge::{MergeCoordinator, MergeOutcome};
use crate::orchestration::prompt::{self, PromptContext};
use crate::orchestration::registry::{ActiveRun, RunRegistry};
use crate::orchestration::runner::{AgentRunner, IterationResult};
use crate::orchestration::signal::Signal;
use crate::store::TaskStore;
use crate::util::blocking;
use crate::workspace::{DiffSummary, WorkspaceManager};
use crate::{llog, llog_debug, llog_error, llog_warn, Error, Result};

/// `block_reason` when the iteration budget runs out.
pub const MAX_ITERATIONS_REASON: &str = "max_iterations_exceeded";
/// `block_reason` after too many iterations without a signal.
pub const AMBIGUOUS_REASON: &str = "ambiguous_output";
/// `block_reason` for a stopped run.
pub const CANCELLED_REASON: &str = "cancelled";

/// Why a queued task was not admitted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Deferral {
    /// All agent slots are taken.
    Capacity,
    /// Its footprint overlaps a running or reviewing task.
    Overlap { with: TaskId },
}

/// Events emitted by the scheduler for task lifecycle changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchedulerEvent {
    /// A task took an agent slot.
    Admitted { task_id: TaskId },
    /// A queued task was skipped for now.
    Deferred { task_id: TaskId, deferral: Deferral },
    IterationFinished {
        task_id: TaskId,
        iteration: u32,
        signal: Signal,
    },
    MovedToReview {
        task_id: TaskId,
        readiness: MergeReadiness,
        no_changes: bool,
    },
    ReturnedToBacklog { task_id: TaskId, reason: String },
    /// A run was stopped and the task restored to `status`.
    Cancelled { task_id: TaskId, status: TaskStatus },
    Merged { task_id: TaskId, commit: String },
    MergeConflict { task_id: TaskId, files: Vec<String> },
    MergeFailed { task_id: TaskId, report: FailureReport },
    Rejected { task_id: TaskId, status: TaskStatus },
    /// Nothing running and nothing queued.
    Idle,
    /// The control loop has exited.
    Stopped,
}

/// Scheduler limits, usually taken from [`Config`].
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub max_concurrent_agents: usize,
    pub max_iterations: u32,
    pub iteration_timeout: Duration,
    pub ambiguity_threshold: u32,
    pub retry_delay: Duration,
    /// Queue AUTO tasks left IN_PROGRESS by an earlier process on startup.
    pub resume_on_start: bool,
}

impl From<&Config> for SchedulerConfig {
    fn from(config: &Config) -> Self {
        Self {
            max_concurrent_agents: config.max_concurrent_agents,
            max_iterations: config.max_iterations,
            iteration_timeout: config.iteration_timeout(),
            ambiguity_threshold: config.ambiguity_threshold,
            retry_delay: config.retry_delay(),
            resume_on_start: true,
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self::from(&Config::default())
    }
}

/// A running task as seen from outside.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunInfo {
    pub task_id: TaskId,
    pub iteration: u32,
    pub awaiting_retry: bool,
}

/// Point-in-time view of the scheduler.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchedulerSnapshot {
    pub running: Vec<RunInfo>,
    /// Waiting for admission, in queue order.
    pub queued: Vec<TaskId>,
    /// Subset of `queued` skipped because of footprint overlap.
    pub pending: Vec<TaskId>,
    pub reviews_in_flight: Vec<TaskId>,
    pub max_concurrent_agents: usize,
}

impl SchedulerSnapshot {
    pub fn is_running(&self, id: TaskId) -> bool {
        self.running.iter().any(|r| r.task_id == id)
    }
}

enum Command {
    Start {
        id: TaskId,
        reply: oneshot::Sender<Result<Task>>,
    },
    Stop {
        id: TaskId,
        reply: oneshot::Sender<Result<Task>>,
    },
    RequestReview {
        id: TaskId,
        summary: Option<String>,
        reply: oneshot::Sender<Result<Task>>,
    },
    Approve {
        id: TaskId,
        reply: oneshot::Sender<Result<MergeOutcome>>,
    },
    Reject {
        id: TaskId,
        feedback: String,
        target: TaskStatus,
        reply: oneshot::Sender<Result<Task>>,
    },
    Snapshot {
        reply: oneshot::Sender<SchedulerSnapshot>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// What an iteration worker reports back.
enum WorkerOutcome {
    Finished {
        result: IterationResult,
        diff: Option<DiffSummary>,
    },
    Cancelled,
    Failed(Error),
}

enum Internal {
    IterationDone {
        task_id: TaskId,
        iteration: u32,
        outcome: WorkerOutcome,
    },
    RetryDue {
        task_id: TaskId,
    },
    ReviewDone {
        task_id: TaskId,
        event: Option<SchedulerEvent>,
        requeue: bool,
    },
    /// The worktree of a task parked in BACKLOG is gone.
    BacklogCleanupDone {
        task_id: TaskId,
        reason: String,
    },
    PairWorkspaceReady {
        task_id: TaskId,
        result: Result<()>,
        reply: oneshot::Sender<Result<Task>>,
    },
    ReviewDiffReady {
        task_id: TaskId,
        summary: Option<String>,
        result: Result<DiffSummary>,
        reply: oneshot::Sender<Result<Task>>,
    },
}

/// Cloneable handle for sending commands to a running [`Scheduler`].
#[derive(Clone)]
pub struct SchedulerHandle {
    tx: mpsc::UnboundedSender<Command>,
}

impl SchedulerHandle {
    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(make(reply))
            .map_err(|_| Error::SchedulerStopped)?;
        rx.await.map_err(|_| Error::SchedulerStopped)
    }

    /// Queue a task for admission (AUTO) or open its workspace (PAIR).
    pub async fn start_task(&self, id: TaskId) -> Result<Task> {
        self.request(|reply| Command::Start { id, reply }).await?
    }

    /// Cancel the task's current iteration, or take it off the queue.
    /// Resolves once the task has been restored.
    pub async fn stop_task(&self, id: TaskId) -> Result<Task> {
        self.request(|reply| Command::Stop { id, reply }).await?
    }

    pub async fn request_review(&self, id: TaskId, summary: Option<String>) -> Result<Task> {
        self.request(|reply| Command::RequestReview { id, summary, reply })
            .await?
    }

    /// Approve a task in review. Resolves when the merge has finished.
    pub async fn approve(&self, id: TaskId) -> Result<MergeOutcome> {
        self.request(|reply| Command::Approve { id, reply }).await?
    }

    pub async fn reject(&self, id: TaskId, feedback: &str, target: TaskStatus) -> Result<Task> {
        let feedback = feedback.to_string();
        self.request(|reply| Command::Reject {
            id,
            feedback,
            target,
            reply,
        })
        .await?
    }

    pub async fn snapshot(&self) -> Result<SchedulerSnapshot> {
        self.request(|reply| Command::Snapshot { reply }).await
    }

    /// Cancel all runs and stop the control loop.
    pub async fn shutdown(&self) -> Result<()> {
        self.request(|reply| Command::Shutdown { reply }).await
    }
}

/// Shared pieces an iteration worker needs.
#[derive(Clone)]
struct WorkerContext {
    store: Arc<dyn TaskStore>,
    workspaces: Arc<WorkspaceManager>,
    runner: Arc<AgentRunner>,
    timeout: Duration,
    max_iterations: u32,
}

pub struct Scheduler {
    config: SchedulerConfig,
    store: Arc<dyn TaskStore>,
    workspaces: Arc<WorkspaceManager>,
    merges: Arc<MergeCoordinator>,
    worker: WorkerContext,
    registry: RunRegistry,
    /// FIFO of AUTO tasks waiting for a slot.
    queue: VecDeque<TaskId>,
    /// Status each queued task had before it was started.
    queued_from: HashMap<TaskId, TaskStatus>,
    /// Last deferral reported per queued task.
    deferred: HashMap<TaskId, Deferral>,
    ambiguity: HashMap<TaskId, u32>,
    failures: HashMap<TaskId, u32>,
    reviews_in_flight: HashMap<TaskId, JoinHandle<()>>,
    /// Worktree git work running off the control loop.
    git_jobs: HashMap<TaskId, JoinHandle<()>>,
    commands: mpsc::UnboundedReceiver<Command>,
    internal_tx: mpsc::UnboundedSender<Internal>,
    internal_rx: mpsc::UnboundedReceiver<Internal>,
    events: mpsc::UnboundedSender<SchedulerEvent>,
    idle: bool,
}

impl Scheduler {
    /// Create a scheduler and the handle used to drive it.
    ///
    /// # Arguments
    ///
    /// * `config` - Capacity, iteration and retry limits
    /// * `store` - Task store port; the scheduler is its only writer while running
    /// * `workspaces` - Workspace manager for the repository
    /// * `runner` - Agent runner used for every iteration
    /// * `merges` - Merge coordinator sharing `store` and `workspaces`
    /// * `events` - Channel for emitting scheduler events
    pub fn new(
        config: SchedulerConfig,
        store: Arc<dyn TaskStore>,
        workspaces: Arc<WorkspaceManager>,
        runner: Arc<AgentRunner>,
        merges: Arc<MergeCoordinator>,
        events: mpsc::UnboundedSender<SchedulerEvent>,
    ) -> (Self, SchedulerHandle) {
        let (tx, commands) = mpsc::unbounded_channel();
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        let worker = WorkerContext {
            store: Arc::clone(&store),
            workspaces: Arc::clone(&workspaces),
            runner,
            timeout: config.iteration_timeout,
            max_iterations: config.max_iterations,
        };
        let scheduler = Self {
            registry: RunRegistry::new(config.max_concurrent_agents),
            config,
            store,
            workspaces,
            merges,
            worker,
            queue: VecDeque::new(),
            queued_from: HashMap::new(),
            deferred: HashMap::new(),
            ambiguity: HashMap::new(),
            failures: HashMap::new(),
            reviews_in_flight: HashMap::new(),
            git_jobs: HashMap::new(),
            commands,
            internal_tx,
            internal_rx,
            events,
            idle: false,
        };
        (scheduler, SchedulerHandle { tx })
    }

    /// Run the control loop until shutdown or until every handle is dropped.
    ///
    /// AUTO tasks persisted as IN_PROGRESS are queued again first unless
    /// `resume_on_start` is off.
    pub async fn run(mut self) -> Result<()> {
        if self.config.resume_on_start {
            self.resume()?;
        }
        self.admit();

        loop {
            tokio::select! {
                biased;
                Some(internal) = self.internal_rx.recv() => {
                    self.handle_internal(internal).await;
                }
                command = self.commands.recv() => match command {
                    Some(Command::Shutdown { reply }) => {
                        self.shutdown().await;
                        let _ = reply.send(());
                        return Ok(());
                    }
                    Some(command) => self.handle_command(command).await,
                    None => {
                        self.shutdown().await;
                        return Ok(());
                    }
                },
            }
            self.admit();
        }
    }

    fn emit(&self, event: SchedulerEvent) {
        llog_debug!("SchedulerEvent: {:?}", event);
        let _ = self.events.send(event);
    }

    fn resume(&mut self) -> Result<()> {
        let filter = TaskFilter::status(TaskStatus::InProgress).of_type(TaskType::Auto);
        for task in self.store.list_tasks(&filter)? {
            llog!("Resuming task {} ({})", task.id.short(), task.title);
            self.enqueue(task.id, TaskStatus::InProgress);
        }
        Ok(())
    }

    fn enqueue(&mut self, id: TaskId, from: TaskStatus) {
        if self.queue.contains(&id) || self.registry.contains(&id) {
            return;
        }
        self.queue.push_back(id);
        self.queued_from.insert(id, from);
        self.idle = false;
    }

    fn dequeue(&mut self, id: TaskId) -> Option<TaskStatus> {
        let pos = self.queue.iter().position(|q| *q == id)?;
        self.queue.remove(pos);
        self.deferred.remove(&id);
        self.queued_from.remove(&id)
    }

    // ========== Admission ==========

    /// Admit queued tasks in FIFO order while capacity remains. Tasks whose
    /// footprint overlaps active work are skipped and later tasks may
    /// overtake them.
    fn admit(&mut self) {
        let mut idx = 0;
        while idx < self.queue.len() {
            let id = self.queue[idx];
            if !self.registry.has_capacity() {
                self.defer(id, Deferral::Capacity);
                break;
            }
            let task = match self.store.get_task(id) {
                Ok(task) => task,
                Err(e) => {
                    llog_warn!("Dropping queued task {}: {}", id.short(), e);
                    self.dequeue(id);
                    continue;
                }
            };
            if let Some(with) = self.overlapping(&task) {
                self.defer(id, Deferral::Overlap { with });
                idx += 1;
                continue;
            }

            let pre_status = self.dequeue(id).unwrap_or(TaskStatus::InProgress);
            let run = ActiveRun::new(id, pre_status, true);
            if let Err(e) = self.registry.insert(run) {
                llog_error!("Admission of task {} failed: {}", id.short(), e);
                continue;
            }
            llog!(
                "Admitted task {} ({}/{} slots)",
                id.short(),
                self.registry.auto_count(),
                self.registry.max_concurrent()
            );
            self.emit(SchedulerEvent::Admitted { task_id: id });
            self.spawn_iteration(id, task.iteration_count + 1);
        }

        let now_idle =
            self.registry.is_empty() && self.queue.is_empty() && self.git_jobs.is_empty();
        if now_idle && !self.idle {
            self.emit(SchedulerEvent::Idle);
        }
        self.idle = now_idle;
    }

    fn defer(&mut self, id: TaskId, deferral: Deferral) {
        if self.deferred.get(&id) == Some(&deferral) {
            return;
        }
        llog_debug!("Deferring task {}: {:?}", id.short(), deferral);
        self.deferred.insert(id, deferral.clone());
        self.emit(SchedulerEvent::Deferred {
            task_id: id,
            deferral,
        });
    }

    /// First running or reviewing task whose footprint shares a file with `task`.
    fn overlapping(&self, task: &Task) -> Option<TaskId> {
        if task.diff_files.is_empty() {
            return None;
        }
        let running = self
            .registry
            .task_ids()
            .into_iter()
            .filter_map(|id| self.store.get_task(id).ok());
        let reviewing = self
            .store
            .list_tasks(&TaskFilter::status(TaskStatus::Review))
            .unwrap_or_default();
        running
            .chain(reviewing)
            .filter(|other| other.id != task.id)
            .find(|other| task.overlaps(&other.diff_files))
            .map(|other| other.id)
    }

    // ========== Iterations ==========

    fn spawn_iteration(&mut self, task_id: TaskId, iteration: u32) {
        let Some(run) = self.registry.get_mut(&task_id) else {
            return;
        };
        let cancel = run.cancel_token();
        let ctx = self.worker.clone();
        let tx = self.internal_tx.clone();
        let handle = tokio::spawn(async move {
            let outcome = run_worker(ctx, task_id, iteration, cancel).await;
            let _ = tx.send(Internal::IterationDone {
                task_id,
                iteration,
                outcome,
            });
        });
        run.attach(iteration, handle);
        llog_debug!("Spawned iteration {} for task {}", iteration, task_id.short());
    }

    async fn handle_internal(&mut self, internal: Internal) {
        match internal {
            Internal::IterationDone {
                task_id,
                iteration,
                outcome,
            } => {
                if let Err(e) = self.iteration_done(task_id, iteration, outcome).await {
                    llog_error!("Handling iteration of task {} failed: {}", task_id.short(), e);
                    self.abandon_run(task_id, &e);
                }
            }
            Internal::RetryDue { task_id } => {
                let due = self
                    .registry
                    .get(&task_id)
                    .map(|r| r.awaiting_retry && !r.is_cancelled())
                    .unwrap_or(false);
                if due {
                    let iteration = self.registry.get(&task_id).map(|r| r.iteration).unwrap_or(1);
                    llog!("Retrying iteration {} of task {}", iteration, task_id.short());
                    self.spawn_iteration(task_id, iteration);
                }
            }
            Internal::ReviewDone {
                task_id,
                event,
                requeue,
            } => {
                self.reviews_in_flight.remove(&task_id);
                if requeue {
                    self.enqueue(task_id, TaskStatus::InProgress);
                }
                if let Some(event) = event {
                    self.emit(event);
                }
            }
            Internal::BacklogCleanupDone { task_id, reason } => {
                self.git_jobs.remove(&task_id);
                self.release(task_id);
                llog!("Task {} returned to backlog: {}", task_id.short(), reason);
                self.emit(SchedulerEvent::ReturnedToBacklog { task_id, reason });
            }
            Internal::PairWorkspaceReady {
                task_id,
                result,
                reply,
            } => {
                self.git_jobs.remove(&task_id);
                let _ = reply.send(result.and_then(|()| self.open_pair_session(task_id)));
            }
            Internal::ReviewDiffReady {
                task_id,
                summary,
                result,
                reply,
            } => {
                self.git_jobs.remove(&task_id);
                let _ = reply.send(
                    result.and_then(|diff| self.finish_review_request(task_id, diff, summary)),
                );
            }
        }
    }

    async fn iteration_done(
        &mut self,
        task_id: TaskId,
        iteration: u32,
        outcome: WorkerOutcome,
    ) -> Result<()> {
        let Some(run) = self.registry.get_mut(&task_id) else {
            return Ok(());
        };
        run.detach();
        if run.is_cancelled() {
            return self.finish_cancelled(task_id).await;
        }

        let (result, diff) = match outcome {
            WorkerOutcome::Cancelled => return self.finish_cancelled(task_id).await,
            WorkerOutcome::Failed(error) => return self.iteration_failed(task_id, error),
            WorkerOutcome::Finished { result, diff } => (result, diff),
        };
        self.failures.remove(&task_id);

        let task = self.store.get_task(task_id)?;
        let mut update = TaskUpdate::new()
            .iteration_count(task.iteration_count + 1)
            .total_iterations(task.total_iterations + 1);
        if let Some(ref diff) = diff {
            update = update.diff_files(diff.files.clone());
        }
        let task = self.store.update_task(task_id, update)?;
        llog!(
            "Task {} iteration {} finished: {} ({:?})",
            task_id.short(),
            iteration,
            result.signal,
            result.exit_status
        );
        self.emit(SchedulerEvent::IterationFinished {
            task_id,
            iteration,
            signal: result.signal.clone(),
        });

        match result.signal {
            Signal::Complete => {
                self.release(task_id);
                self.move_to_review(task_id, diff.unwrap_or_default(), None)?;
            }
            Signal::Blocked(reason) => {
                self.return_to_backlog(task_id, &reason, None)?;
            }
            Signal::Continue | Signal::Ambiguous(_) => {
                if result.signal.is_ambiguous() {
                    let count = self.ambiguity.entry(task_id).or_insert(0);
                    *count += 1;
                    let count = *count;
                    llog_warn!(
                        "Task {} produced no signal ({} in a row)",
                        task_id.short(),
                        count
                    );
                    if count >= self.config.ambiguity_threshold {
                        return self.return_to_backlog(task_id, AMBIGUOUS_REASON, None);
                    }
                } else {
                    self.ambiguity.remove(&task_id);
                }

                if task.iteration_count >= self.config.max_iterations {
                    llog_warn!(
                        "Task {} reached {} iterations without finishing",
                        task_id.short(),
                        task.iteration_count
                    );
                    return self.return_to_backlog(task_id, MAX_ITERATIONS_REASON, None);
                }
                self.spawn_iteration(task_id, task.iteration_count + 1);
            }
        }
        Ok(())
    }

    /// One retry per run for workspace or process failures; the second
    /// failure sends the task back to the backlog.
    fn iteration_failed(&mut self, task_id: TaskId, error: Error) -> Result<()> {
        let failures = self.failures.entry(task_id).or_insert(0);
        *failures += 1;
        if *failures > 1 {
            llog_error!("Task {} failed again: {}", task_id.short(), error);
            let reason = error.code().to_string();
            return self.return_to_backlog(task_id, &reason, Some(error.to_string()));
        }

        llog_warn!(
            "Task {} iteration failed, retrying in {:?}: {}",
            task_id.short(),
            self.config.retry_delay,
            error
        );
        self.store
            .update_task(task_id, TaskUpdate::new().last_error(Some(error.to_string())))?;
        if let Some(run) = self.registry.get_mut(&task_id) {
            run.awaiting_retry = true;
        }
        let tx = self.internal_tx.clone();
        let delay = self.config.retry_delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(Internal::RetryDue { task_id });
        });
        Ok(())
    }

    fn release(&mut self, task_id: TaskId) -> Option<ActiveRun> {
        self.ambiguity.remove(&task_id);
        self.failures.remove(&task_id);
        self.registry.remove(&task_id)
    }

    fn move_to_review(
        &mut self,
        task_id: TaskId,
        diff: DiffSummary,
        summary: Option<String>,
    ) -> Result<Task> {
        self.store.update_task(
            task_id,
            TaskUpdate::new()
                .status(TaskStatus::Review)
                .session_active(false)
                .block_reason(None),
        )?;
        let task = match self.merges.record_review(task_id, &diff, summary) {
            Ok(task) => task,
            Err(e) => {
                // A task never stays in REVIEW without a readiness verdict.
                let parked = self.store.update_task(
                    task_id,
                    TaskUpdate::new()
                        .status(TaskStatus::Backlog)
                        .block_reason(Some(e.code().to_string()))
                        .last_error(Some(e.to_string())),
                );
                if let Err(parked) = parked {
                    llog_error!("Failed to park task {}: {}", task_id.short(), parked);
                }
                return Err(e);
            }
        };
        llog!(
            "Task {} moved to review ({}, {} files)",
            task_id.short(),
            task.merge_readiness,
            task.diff_files.len()
        );
        self.emit(SchedulerEvent::MovedToReview {
            task_id,
            readiness: task.merge_readiness,
            no_changes: task.no_changes,
        });
        Ok(task)
    }

    /// Park the task in BACKLOG with `reason` and drop its worktree in the
    /// background (the branch stays). The slot is released once the worktree
    /// is gone.
    fn return_to_backlog(
        &mut self,
        task_id: TaskId,
        reason: &str,
        error: Option<String>,
    ) -> Result<()> {
        let mut update = TaskUpdate::new()
            .status(TaskStatus::Backlog)
            .block_reason(Some(reason.to_string()))
            .session_active(false);
        if error.is_some() {
            update = update.last_error(error);
        }
        let task = self.store.update_task(task_id, update)?;

        let workspaces = Arc::clone(&self.workspaces);
        let workspace = workspaces.workspace_for(&task);
        let tx = self.internal_tx.clone();
        let reason = reason.to_string();
        let handle = tokio::spawn(async move {
            if let Err(e) = blocking(move || workspaces.remove(&workspace)).await {
                llog_warn!("Failed to remove workspace of task {}: {}", task_id.short(), e);
            }
            let _ = tx.send(Internal::BacklogCleanupDone { task_id, reason });
        });
        self.git_jobs.insert(task_id, handle);
        Ok(())
    }

    /// Park a task whose iteration could not be applied so it neither
    /// holds a slot nor sits in a status nothing will advance.
    fn abandon_run(&mut self, task_id: TaskId, error: &Error) {
        let waiters = self
            .release(task_id)
            .map(|mut run| run.take_stop_waiters())
            .unwrap_or_default();
        let reason = error.code().to_string();
        let result = self.store.update_task(
            task_id,
            TaskUpdate::new()
                .status(TaskStatus::Backlog)
                .block_reason(Some(reason.clone()))
                .session_active(false)
                .last_error(Some(error.to_string())),
        );
        match &result {
            Ok(_) => {
                llog_error!("Task {} parked in backlog: {}", task_id.short(), error);
                self.emit(SchedulerEvent::ReturnedToBacklog { task_id, reason });
            }
            Err(e) => llog_error!("Failed to park task {}: {}", task_id.short(), e),
        }
        for waiter in waiters {
            let _ = waiter.send(
                result
                    .as_ref()
                    .cloned()
                    .map_err(|e| Error::Validation(e.to_string())),
            );
        }
    }

    /// Restore a cancelled task to the status it had before its run began.
    async fn finish_cancelled(&mut self, task_id: TaskId) -> Result<()> {
        let Some(mut run) = self.release(task_id) else {
            return Ok(());
        };
        let waiters = run.take_stop_waiters();
        let result = self.store.update_task(
            task_id,
            TaskUpdate::new()
                .status(run.pre_status)
                .block_reason(Some(CANCELLED_REASON.to_string())),
        );
        llog!(
            "Task {} cancelled during iteration {}, restored to {}",
            task_id.short(),
            run.iteration,
            run.pre_status
        );
        self.emit(SchedulerEvent::Cancelled {
            task_id,
            status: run.pre_status,
        });
        for waiter in waiters {
            let _ = waiter.send(
                result
                    .as_ref()
                    .cloned()
                    .map_err(|e| Error::Validation(e.to_string())),
            );
        }
        result.map(|_| ())
    }

    // ========== Commands ==========

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Start { id, reply } => self.start_task(id, reply),
            Command::Stop { id, reply } => self.stop_task(id, reply).await,
            Command::RequestReview { id, summary, reply } => {
                self.request_review(id, summary, reply)
            }
            Command::Approve { id, reply } => self.approve(id, reply),
            Command::Reject {
                id,
                feedback,
                target,
                reply,
            } => self.reject(id, feedback, target, reply),
            Command::Snapshot { reply } => {
                let _ = reply.send(self.snapshot());
            }
            Command::Shutdown { reply } => {
                // Handled by the control loop.
                let _ = reply.send(());
            }
        }
    }

    fn is_busy(&self, id: TaskId) -> bool {
        self.registry.contains(&id) || self.queue.contains(&id) || self.git_jobs.contains_key(&id)
    }

    fn start_task(&mut self, id: TaskId, reply: oneshot::Sender<Result<Task>>) {
        let task = match self.store.get_task(id) {
            Ok(_) if self.is_busy(id) => {
                let _ = reply.send(Err(Error::TaskBusy(id)));
                return;
            }
            Ok(task) => task,
            Err(e) => {
                let _ = reply.send(Err(e));
                return;
            }
        };

        match (task.task_type, task.status) {
            (TaskType::Pair, TaskStatus::Backlog | TaskStatus::InProgress) => {
                let workspaces = Arc::clone(&self.workspaces);
                let tx = self.internal_tx.clone();
                let handle = tokio::spawn(async move {
                    let result = blocking(move || Ok(workspaces.ensure(&task)?))
                        .await
                        .map(|_| ());
                    let _ = tx.send(Internal::PairWorkspaceReady {
                        task_id: id,
                        result,
                        reply,
                    });
                });
                self.git_jobs.insert(id, handle);
            }
            (TaskType::Auto, status) => {
                let _ = reply.send(self.queue_auto_task(id, status));
            }
            (_, status) => {
                let _ = reply.send(Err(Error::invalid_transition(status, TaskStatus::InProgress)));
            }
        }
    }

    fn open_pair_session(&mut self, id: TaskId) -> Result<Task> {
        let task = self.store.update_task(
            id,
            TaskUpdate::new()
                .status(TaskStatus::InProgress)
                .session_active(true)
                .block_reason(None),
        )?;
        llog!("Pair session started for task {}", id.short());
        Ok(task)
    }

    fn queue_auto_task(&mut self, id: TaskId, status: TaskStatus) -> Result<Task> {
        match status {
            TaskStatus::Backlog => {
                let task = self.store.update_task(
                    id,
                    TaskUpdate::new()
                        .status(TaskStatus::InProgress)
                        .iteration_count(0)
                        .block_reason(None)
                        .last_error(None),
                )?;
                self.ambiguity.remove(&id);
                self.failures.remove(&id);
                self.enqueue(id, TaskStatus::Backlog);
                llog!("Task {} queued", id.short());
                Ok(task)
            }
            TaskStatus::InProgress => {
                let task = self
                    .store
                    .update_task(id, TaskUpdate::new().block_reason(None))?;
                self.enqueue(id, TaskStatus::InProgress);
                llog!("Task {} queued to resume", id.short());
                Ok(task)
            }
            status => Err(Error::invalid_transition(status, TaskStatus::InProgress)),
        }
    }

    async fn stop_task(&mut self, id: TaskId, reply: oneshot::Sender<Result<Task>>) {
        if self.git_jobs.contains_key(&id) {
            let _ = reply.send(Err(Error::TaskBusy(id)));
            return;
        }
        if let Some(run) = self.registry.get_mut(&id) {
            run.cancel();
            run.add_stop_waiter(reply);
            // A run waiting out its retry delay has no worker to report back.
            if !run.is_executing() {
                if let Err(e) = self.finish_cancelled(id).await {
                    llog_error!("Cancelling task {} failed: {}", id.short(), e);
                }
            }
            return;
        }

        if let Some(from) = self.dequeue(id) {
            let result = self.store.update_task(
                id,
                TaskUpdate::new()
                    .status(from)
                    .block_reason(Some(CANCELLED_REASON.to_string())),
            );
            if result.is_ok() {
                llog!("Task {} removed from queue", id.short());
                self.emit(SchedulerEvent::Cancelled {
                    task_id: id,
                    status: from,
                });
            }
            let _ = reply.send(result);
            return;
        }

        let result = match self.store.get_task(id) {
            Ok(task) if task.task_type == TaskType::Pair && task.session_active => self
                .store
                .update_task(id, TaskUpdate::new().session_active(false)),
            Ok(task) => Err(Error::invalid_transition(task.status, "stopped")),
            Err(e) => Err(e),
        };
        let _ = reply.send(result);
    }

    fn request_review(
        &mut self,
        id: TaskId,
        summary: Option<String>,
        reply: oneshot::Sender<Result<Task>>,
    ) {
        let task = match self.store.get_task(id) {
            Ok(task) => task,
            Err(e) => {
                let _ = reply.send(Err(e));
                return;
            }
        };
        if self.registry.contains(&id)
            || self.reviews_in_flight.contains_key(&id)
            || self.git_jobs.contains_key(&id)
        {
            let _ = reply.send(Err(Error::TaskBusy(id)));
            return;
        }
        if task.status != TaskStatus::InProgress {
            let _ = reply.send(Err(Error::invalid_transition(task.status, TaskStatus::Review)));
            return;
        }
        self.dequeue(id);

        let workspaces = Arc::clone(&self.workspaces);
        let workspace = workspaces.workspace_for(&task);
        let tx = self.internal_tx.clone();
        let handle = tokio::spawn(async move {
            let result = blocking(move || workspaces.diff(&workspace)).await;
            let _ = tx.send(Internal::ReviewDiffReady {
                task_id: id,
                summary,
                result,
                reply,
            });
        });
        self.git_jobs.insert(id, handle);
    }

    fn finish_review_request(
        &mut self,
        id: TaskId,
        diff: DiffSummary,
        summary: Option<String>,
    ) -> Result<Task> {
        let task = self.store.get_task(id)?;
        if task.status != TaskStatus::InProgress {
            return Err(Error::invalid_transition(task.status, TaskStatus::Review));
        }
        self.move_to_review(id, diff, summary)
    }

    fn approve(&mut self, id: TaskId, reply: oneshot::Sender<Result<MergeOutcome>>) {
        if self.reviews_in_flight.contains_key(&id) {
            let _ = reply.send(Err(Error::TaskBusy(id)));
            return;
        }
        let merges = Arc::clone(&self.merges);
        let tx = self.internal_tx.clone();
        let handle = tokio::spawn(async move {
            let result = merges.approve_and_merge(id).await;
            let event = match &result {
                Ok(MergeOutcome::Merged { commit, .. }) => Some(SchedulerEvent::Merged {
                    task_id: id,
                    commit: commit.clone(),
                }),
                Ok(MergeOutcome::Conflict(conflict)) => Some(SchedulerEvent::MergeConflict {
                    task_id: id,
                    files: conflict.files.clone(),
                }),
                Ok(MergeOutcome::Failed(report)) => Some(SchedulerEvent::MergeFailed {
                    task_id: id,
                    report: report.clone(),
                }),
                Err(_) => None,
            };
            let _ = tx.send(Internal::ReviewDone {
                task_id: id,
                event,
                requeue: false,
            });
            let _ = reply.send(result);
        });
        self.reviews_in_flight.insert(id, handle);
    }

    fn reject(
        &mut self,
        id: TaskId,
        feedback: String,
        target: TaskStatus,
        reply: oneshot::Sender<Result<Task>>,
    ) {
        if self.reviews_in_flight.contains_key(&id) {
            let _ = reply.send(Err(Error::TaskBusy(id)));
            return;
        }
        let merges = Arc::clone(&self.merges);
        let tx = self.internal_tx.clone();
        let handle = tokio::spawn(async move {
            let result = merges.reject(id, &feedback, target).await;
            let (event, requeue) = match &result {
                Ok(task) => (
                    Some(SchedulerEvent::Rejected {
                        task_id: id,
                        status: task.status,
                    }),
                    task.status == TaskStatus::InProgress && task.is_auto(),
                ),
                Err(_) => (None, false),
            };
            let _ = tx.send(Internal::ReviewDone {
                task_id: id,
                event,
                requeue,
            });
            let _ = reply.send(result);
        });
        self.reviews_in_flight.insert(id, handle);
    }

    fn snapshot(&self) -> SchedulerSnapshot {
        let mut running: Vec<RunInfo> = self
            .registry
            .iter()
            .map(|r| RunInfo {
                task_id: r.task_id,
                iteration: r.iteration,
                awaiting_retry: r.awaiting_retry,
            })
            .collect();
        running.sort_by_key(|r| r.task_id);
        let pending = self
            .queue
            .iter()
            .filter(|id| matches!(self.deferred.get(id), Some(Deferral::Overlap { .. })))
            .copied()
            .collect();
        SchedulerSnapshot {
            running,
            queued: self.queue.iter().copied().collect(),
            pending,
            reviews_in_flight: self.reviews_in_flight.keys().copied().collect(),
            max_concurrent_agents: self.registry.max_concurrent(),
        }
    }

    /// Cancel every run, wait for the workers and persist iteration counts.
    /// Interrupted tasks stay IN_PROGRESS so the next start resumes them.
    async fn shutdown(&mut self) {
        llog!("Scheduler shutting down ({} active runs)", self.registry.len());
        self.registry.cancel_all();
        let mut runs = self.registry.drain();
        let workers: Vec<_> = runs.iter_mut().filter_map(ActiveRun::detach).collect();
        join_all(workers).await;

        for mut run in runs {
            let persisted = self.store.get_task(run.task_id).and_then(|task| {
                self.store.update_task(
                    run.task_id,
                    TaskUpdate::new().iteration_count(task.iteration_count),
                )
            });
            if let Err(ref e) = persisted {
                llog_error!("Failed to persist task {}: {}", run.task_id.short(), e);
            }
            for waiter in run.take_stop_waiters() {
                let _ = waiter.send(self.store.get_task(run.task_id));
            }
        }

        let pending: Vec<_> = self
            .reviews_in_flight
            .drain()
            .chain(self.git_jobs.drain())
            .map(|(_, h)| h)
            .collect();
        join_all(pending).await;
        self.queue.clear();
        self.queued_from.clear();
        self.emit(SchedulerEvent::Stopped);
    }
}

/// Execute one iteration: make sure the workspace exists, render the prompt,
/// run the agent and record the resulting footprint.
async fn run_worker(
    ctx: WorkerContext,
    task_id: TaskId,
    iteration: u32,
    cancel: CancellationToken,
) -> WorkerOutcome {
    let prepared = async {
        let task = ctx.store.get_task(task_id)?;
        let workspaces = Arc::clone(&ctx.workspaces);
        let for_ensure = task.clone();
        let workspace = blocking(move || Ok(workspaces.ensure(&for_ensure)?)).await?;
        let scratchpad = ctx.store.scratchpad(task_id)?;
        let parent = task.parent_id.and_then(|p| ctx.store.get_task(p).ok());
        let prompt = prompt::build(&PromptContext {
            task: &task,
            iteration,
            max_iterations: ctx.max_iterations,
            scratchpad: &scratchpad,
            parent: parent.as_ref(),
        });
        Ok::<_, Error>((task, workspace, prompt))
    }
    .await;

    let (task, workspace, prompt) = match prepared {
        Ok(prepared) => prepared,
        Err(e) => return WorkerOutcome::Failed(e),
    };
    if cancel.is_cancelled() {
        return WorkerOutcome::Cancelled;
    }

    let result = match ctx
        .runner
        .run_iteration(&task, &workspace, iteration, &prompt, ctx.timeout, &cancel)
        .await
    {
        Ok(result) => result,
        Err(e) => return WorkerOutcome::Failed(e.into()),
    };
    if result.exit_status.was_cancelled() {
        return WorkerOutcome::Cancelled;
    }

    let workspaces = Arc::clone(&ctx.workspaces);
    let diff = match blocking(move || workspaces.diff(&workspace)).await {
        Ok(diff) => Some(diff),
        Err(e) => {
            llog_warn!("Diff after iteration failed for task {}: {}", task_id.short(), e);
            None
        }
    };
    WorkerOutcome::Finished { result, diff }
}
