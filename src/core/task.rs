//! Task data model for the board.
//!
//! Tasks are the units of work the scheduler hands to agents. They are owned
//! by the task store; the scheduler and merge coordinator change them only
//! through [`TaskUpdate`]s.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for a task.
///
/// Uses UUID v4 for generation and provides a short form display
/// for human-readable output and branch names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub Uuid);

impl TaskId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Return first 8 characters of the UUID for display.
    pub fn short(&self) -> String {
        self.0.to_string()[..8].to_string()
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for TaskId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Board column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    #[default]
    Backlog,
    InProgress,
    Review,
    Done,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Backlog => "BACKLOG",
            TaskStatus::InProgress => "IN_PROGRESS",
            TaskStatus::Review => "REVIEW",
            TaskStatus::Done => "DONE",
        }
    }

    /// States in which a task owns a workspace.
    pub fn has_workspace(&self) -> bool {
        matches!(self, TaskStatus::InProgress | TaskStatus::Review)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_uppercase().replace('-', "_").as_str() {
            "BACKLOG" => Ok(TaskStatus::Backlog),
            "IN_PROGRESS" => Ok(TaskStatus::InProgress),
            "REVIEW" => Ok(TaskStatus::Review),
            "DONE" => Ok(TaskStatus::Done),
            other => Err(format!("unknown status: {}", other)),
        }
    }
}

/// AUTO tasks run unattended under the scheduler; PAIR tasks are worked by a
/// human and only reuse workspaces and the merge pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskType {
    #[default]
    Auto,
    Pair,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
}

/// Advisory classification of how safe an immediate merge is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MergeReadiness {
    #[default]
    Ready,
    AtRisk,
    Blocked,
}

impl std::fmt::Display for MergeReadiness {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MergeReadiness::Ready => write!(f, "READY"),
            MergeReadiness::AtRisk => write!(f, "AT_RISK"),
            MergeReadiness::Blocked => write!(f, "BLOCKED"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub title: String,
    pub description: String,
    pub status: TaskStatus,
    pub task_type: TaskType,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub acceptance_criteria: Vec<String>,
    /// Parent task, resolved through the store when needed.
    #[serde(default)]
    pub parent_id: Option<TaskId>,
    /// Iterations in the current run.
    #[serde(default)]
    pub iteration_count: u32,
    /// Iterations over the task's lifetime. Never decreases.
    #[serde(default)]
    pub total_iterations: u32,
    #[serde(default)]
    pub last_error: Option<String>,
    #[serde(default)]
    pub block_reason: Option<String>,
    #[serde(default)]
    pub merge_readiness: MergeReadiness,
    #[serde(default)]
    pub merge_failed: bool,
    #[serde(default)]
    pub merge_error: Option<String>,
    #[serde(default)]
    pub session_active: bool,
    /// Most recent known diff footprint.
    #[serde(default)]
    pub diff_files: Vec<String>,
    /// Set when the task entered review with an empty diff.
    #[serde(default)]
    pub no_changes: bool,
    #[serde(default)]
    pub review_summary: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

impl Task {
    /// Create a new AUTO task in the backlog.
    pub fn new(title: &str, description: &str) -> Self {
        let now = Utc::now();
        Self {
            id: TaskId::new(),
            title: title.to_string(),
            description: description.to_string(),
            status: TaskStatus::Backlog,
            task_type: TaskType::Auto,
            priority: Priority::Medium,
            acceptance_criteria: Vec::new(),
            parent_id: None,
            iteration_count: 0,
            total_iterations: 0,
            last_error: None,
            block_reason: None,
            merge_readiness: MergeReadiness::Ready,
            merge_failed: false,
            merge_error: None,
            session_active: false,
            diff_files: Vec::new(),
            no_changes: false,
            review_summary: None,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
        }
    }

    pub fn with_type(mut self, task_type: TaskType) -> Self {
        self.task_type = task_type;
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_criteria<I, S>(mut self, criteria: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.acceptance_criteria = criteria.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_parent(mut self, parent: TaskId) -> Self {
        self.parent_id = Some(parent);
        self
    }

    /// Seed the diff footprint, e.g. from a previous run.
    pub fn with_diff_files<I, S>(mut self, files: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.diff_files = files.into_iter().map(Into::into).collect();
        self
    }

    pub fn is_auto(&self) -> bool {
        self.task_type == TaskType::Auto
    }

    /// True if the two footprints share a path. An empty footprint never overlaps.
    pub fn overlaps(&self, other_files: &[String]) -> bool {
        self.diff_files.iter().any(|f| other_files.contains(f))
    }
}

/// Partial update applied atomically to a single task.
///
/// `None` leaves a field untouched. Clearable fields are `Option<Option<_>>`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskUpdate {
    pub status: Option<TaskStatus>,
    pub iteration_count: Option<u32>,
    pub total_iterations: Option<u32>,
    pub last_error: Option<Option<String>>,
    pub block_reason: Option<Option<String>>,
    pub merge_readiness: Option<MergeReadiness>,
    pub merge_failed: Option<bool>,
    pub merge_error: Option<Option<String>>,
    pub session_active: Option<bool>,
    pub diff_files: Option<Vec<String>>,
    pub no_changes: Option<bool>,
    pub review_summary: Option<Option<String>>,
}

impl TaskUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(mut self, status: TaskStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn iteration_count(mut self, count: u32) -> Self {
        self.iteration_count = Some(count);
        self
    }

    pub fn total_iterations(mut self, count: u32) -> Self {
        self.total_iterations = Some(count);
        self
    }

    pub fn last_error(mut self, error: Option<String>) -> Self {
        self.last_error = Some(error);
        self
    }

    pub fn block_reason(mut self, reason: Option<String>) -> Self {
        self.block_reason = Some(reason);
        self
    }

    pub fn merge_readiness(mut self, readiness: MergeReadiness) -> Self {
        self.merge_readiness = Some(readiness);
        self
    }

    pub fn merge_failed(mut self, failed: bool) -> Self {
        self.merge_failed = Some(failed);
        self
    }

    pub fn merge_error(mut self, error: Option<String>) -> Self {
        self.merge_error = Some(error);
        self
    }

    pub fn session_active(mut self, active: bool) -> Self {
        self.session_active = Some(active);
        self
    }

    pub fn diff_files(mut self, files: Vec<String>) -> Self {
        self.diff_files = Some(files);
        self
    }

    pub fn no_changes(mut self, no_changes: bool) -> Self {
        self.no_changes = Some(no_changes);
        self
    }

    pub fn review_summary(mut self, summary: Option<String>) -> Self {
        self.review_summary = Some(summary);
        self
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Apply to a task, maintaining timestamps for status changes.
    pub fn apply(&self, task: &mut Task) {
        let now = Utc::now();
        if let Some(status) = self.status {
            if status != task.status {
                match status {
                    TaskStatus::InProgress if task.started_at.is_none() => {
                        task.started_at = Some(now);
                    }
                    TaskStatus::Done => task.completed_at = Some(now),
                    _ => {}
                }
            }
            task.status = status;
        }
        if let Some(count) = self.iteration_count {
            task.iteration_count = count;
        }
        if let Some(total) = self.total_iterations {
            task.total_iterations = task.total_iterations.max(total);
        }
        if let Some(ref error) = self.last_error {
            task.last_error = error.clone();
        }
        if let Some(ref reason) = self.block_reason {
            task.block_reason = reason.clone();
        }
        if let Some(readiness) = self.merge_readiness {
            task.merge_readiness = readiness;
        }
        if let Some(failed) = self.merge_failed {
            task.merge_failed = failed;
        }
        if let Some(ref error) = self.merge_error {
            task.merge_error = error.clone();
        }
        if let Some(active) = self.session_active {
            task.session_active = active;
        }
        if let Some(ref files) = self.diff_files {
            task.diff_files = files.clone();
        }
        if let Some(no_changes) = self.no_changes {
            task.no_changes = no_changes;
        }
        if let Some(ref summary) = self.review_summary {
            task.review_summary = summary.clone();
        }
        task.updated_at = now;
    }
}

/// Filter for `list_tasks`. Empty vectors match everything.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskFilter {
    pub statuses: Vec<TaskStatus>,
    pub task_type: Option<TaskType>,
}

impl TaskFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn status(status: TaskStatus) -> Self {
        Self {
            statuses: vec![status],
            task_type: None,
        }
    }

    pub fn statuses(statuses: &[TaskStatus]) -> Self {
        Self {
            statuses: statuses.to_vec(),
            task_type: None,
        }
    }

    pub fn of_type(mut self, task_type: TaskType) -> Self {
        self.task_type = Some(task_type);
        self
    }

    pub fn matches(&self, task: &Task) -> bool {
        (self.statuses.is_empty() || self.statuses.contains(&task.status))
            && self.task_type.map_or(true, |t| t == task.task_type)
    }
}
