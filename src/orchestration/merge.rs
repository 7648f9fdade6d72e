//! Merge coordination for tasks in review.
//!
//! The `MergeCoordinator` classifies how risky an immediate merge is, lands
//! approved work on the base branch through the workspace manager, and
//! handles rejection back to work or to the backlog.

use std::sync::Arc;

use tokio::sync::Mutex;

use crate::core::task::{MergeReadiness, Task, TaskFilter, TaskId, TaskStatus, TaskUpdate};
use crate::error::{FailureReport, MergeConflictError};
use crate::store::TaskStore;
use crate::util::blocking;
use crate::workspace::{DiffSummary, MergeAttemptOutcome, MergeStrategy, WorkspaceManager};
use crate::{llog, llog_debug, llog_warn, Error, Result};

/// Final result of an approval.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeOutcome {
    /// Landed on the base branch; the task is DONE.
    Merged { commit: String, attempts: u8 },
    /// Conflicting paths; the task stays in REVIEW.
    Conflict(MergeConflictError),
    /// Any other failure; the task stays in REVIEW.
    Failed(FailureReport),
}

impl MergeOutcome {
    pub fn is_merged(&self) -> bool {
        matches!(self, MergeOutcome::Merged { .. })
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, MergeOutcome::Conflict(_))
    }
}

/// Readiness plus the tasks that caused it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadinessReport {
    pub readiness: MergeReadiness,
    pub overlaps: Vec<(TaskId, Vec<String>)>,
}

pub struct MergeCoordinator {
    store: Arc<dyn TaskStore>,
    workspaces: Arc<WorkspaceManager>,
    /// Present when merges are serialized. Tokio's mutex grants the lock in
    /// request order.
    merge_lock: Option<Arc<Mutex<()>>>,
}

impl MergeCoordinator {
    pub fn new(
        store: Arc<dyn TaskStore>,
        workspaces: Arc<WorkspaceManager>,
        serialize_merges: bool,
    ) -> Self {
        Self {
            store,
            workspaces,
            merge_lock: serialize_merges.then(|| Arc::new(Mutex::new(()))),
        }
    }

    /// Classify `task` against every other IN_PROGRESS or REVIEW task using
    /// the recorded diff footprints.
    pub fn readiness_report(&self, task: &Task) -> Result<ReadinessReport> {
        let others = self.store.list_tasks(&TaskFilter::statuses(&[
            TaskStatus::InProgress,
            TaskStatus::Review,
        ]))?;
        let overlaps: Vec<(TaskId, Vec<String>)> = others
            .iter()
            .filter(|other| other.id != task.id)
            .filter_map(|other| {
                let shared: Vec<String> = task
                    .diff_files
                    .iter()
                    .filter(|f| other.diff_files.contains(f))
                    .cloned()
                    .collect();
                (!shared.is_empty()).then_some((other.id, shared))
            })
            .collect();

        let readiness = if task.merge_failed {
            MergeReadiness::Blocked
        } else if !overlaps.is_empty() {
            MergeReadiness::AtRisk
        } else {
            MergeReadiness::Ready
        };
        Ok(ReadinessReport {
            readiness,
            overlaps,
        })
    }

    /// Recompute and store the task's readiness.
    pub fn evaluate_readiness(&self, task_id: TaskId) -> Result<MergeReadiness> {
        let task = self.store.get_task(task_id)?;
        let report = self.readiness_report(&task)?;
        if report.readiness != task.merge_readiness {
            self.store.update_task(
                task_id,
                TaskUpdate::new().merge_readiness(report.readiness),
            )?;
        }
        llog_debug!(
            "Readiness for task {}: {} ({} overlaps)",
            task_id.short(),
            report.readiness,
            report.overlaps.len()
        );
        Ok(report.readiness)
    }

    /// Record the footprint of a task entering review. An empty diff is
    /// marked explicitly with `no_changes`.
    pub fn record_review(
        &self,
        task_id: TaskId,
        diff: &DiffSummary,
        summary: Option<String>,
    ) -> Result<Task> {
        let mut update = TaskUpdate::new()
            .diff_files(diff.files.clone())
            .no_changes(diff.is_empty());
        if summary.is_some() {
            update = update.review_summary(summary);
        }
        self.store.update_task(task_id, update)?;
        if diff.is_empty() {
            llog!("Task {} entered review with no changes", task_id.short());
        }
        self.evaluate_readiness(task_id)?;
        self.store.get_task(task_id)
    }

    /// Merge an approved task into the base branch.
    ///
    /// # Errors
    ///
    /// Returns `InvalidTransition` if the task is not in REVIEW. Merge
    /// problems are reported through [`MergeOutcome`], not as errors.
    pub async fn approve_and_merge(&self, task_id: TaskId) -> Result<MergeOutcome> {
        let task = self.store.get_task(task_id)?;
        if task.status != TaskStatus::Review {
            return Err(Error::invalid_transition(task.status, TaskStatus::Done));
        }

        let _guard = match &self.merge_lock {
            Some(lock) => {
                llog_debug!("Waiting for merge lock (task {})", task_id.short());
                Some(lock.lock().await)
            }
            None => None,
        };
        llog!("Merging task {} ({})", task_id.short(), task.title);

        let workspaces = Arc::clone(&self.workspaces);
        let workspace = workspaces.workspace_for(&task);
        let attempt = {
            let workspaces = Arc::clone(&workspaces);
            let workspace = workspace.clone();
            blocking(move || Ok(workspaces.merge_to_base(&workspace, MergeStrategy::Squash)))
                .await?
        };

        match attempt.outcome {
            MergeAttemptOutcome::Success { commit } => {
                if let Err(e) = blocking(move || workspaces.discard(&workspace)).await {
                    llog_warn!("Merged task {} but cleanup failed: {}", task_id.short(), e);
                }
                self.store.update_task(
                    task_id,
                    TaskUpdate::new()
                        .status(TaskStatus::Done)
                        .merge_failed(false)
                        .merge_error(None)
                        .last_error(None)
                        .block_reason(None)
                        .merge_readiness(MergeReadiness::Ready),
                )?;
                llog!(
                    "Task {} merged as {} (attempt {})",
                    task_id.short(),
                    commit,
                    attempt.attempt
                );
                Ok(MergeOutcome::Merged {
                    commit,
                    attempts: attempt.attempt,
                })
            }
            MergeAttemptOutcome::Conflict(files) => {
                let conflict = MergeConflictError::new(task_id, files);
                llog_warn!("Task {}: {}", task_id.short(), conflict);
                self.store.update_task(
                    task_id,
                    TaskUpdate::new()
                        .merge_failed(true)
                        .merge_error(Some(format!("{} (hint: {})", conflict, conflict.hint())))
                        .merge_readiness(MergeReadiness::Blocked),
                )?;
                Ok(MergeOutcome::Conflict(conflict))
            }
            MergeAttemptOutcome::Error(message) => {
                let report = Error::Merge(message).report();
                llog_warn!("Task {}: {}", task_id.short(), report);
                self.store.update_task(
                    task_id,
                    TaskUpdate::new()
                        .merge_failed(true)
                        .merge_error(Some(report.message.clone()))
                        .last_error(Some(report.message.clone()))
                        .merge_readiness(MergeReadiness::Blocked),
                )?;
                Ok(MergeOutcome::Failed(report))
            }
        }
    }

    /// Send a reviewed task back to work or to the backlog.
    ///
    /// Feedback goes to the task scratchpad so the next iteration sees it.
    /// Rejecting to IN_PROGRESS keeps the workspace; rejecting to BACKLOG
    /// discards it together with its branch.
    pub async fn reject(&self, task_id: TaskId, feedback: &str, target: TaskStatus) -> Result<Task> {
        let task = self.store.get_task(task_id)?;
        if task.status != TaskStatus::Review {
            return Err(Error::invalid_transition(task.status, target));
        }
        if !matches!(target, TaskStatus::InProgress | TaskStatus::Backlog) {
            return Err(Error::invalid_transition(task.status, target));
        }

        if !feedback.trim().is_empty() {
            self.store
                .append_scratchpad(task_id, &format!("Reviewer feedback:\n{}\n", feedback.trim()))?;
        }

        let mut update = TaskUpdate::new()
            .status(target)
            .iteration_count(0)
            .merge_failed(false)
            .merge_error(None)
            .no_changes(false)
            .review_summary(None)
            .merge_readiness(MergeReadiness::Ready);

        if target == TaskStatus::Backlog {
            let workspaces = Arc::clone(&self.workspaces);
            let workspace = workspaces.workspace_for(&task);
            blocking(move || workspaces.discard(&workspace)).await?;
            update = update.diff_files(Vec::new()).session_active(false);
        }

        let updated = self.store.update_task(task_id, update)?;
        llog!("Task {} rejected to {}", task_id.short(), target);
        Ok(updated)
    }
}
