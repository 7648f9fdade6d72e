use std::path::PathBuf;

use serde::Serialize;
use thiserror::Error;

use crate::core::task::TaskId;

/// Failures creating, inspecting or removing a task workspace.
#[derive(Error, Debug)]
pub enum WorkspaceError {
    #[error("Worktree already exists: {}", .0.display())]
    AlreadyExists(PathBuf),

    #[error("Base branch not found: {0}")]
    BaseBranchNotFound(String),

    #[error("Git error: {0}")]
    Git(#[from] git2::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failures launching or supervising an agent process.
#[derive(Error, Debug)]
pub enum AgentProcessError {
    #[error("Agent command is empty")]
    EmptyCommand,

    #[error("Agent binary not found: {0}")]
    BinaryNotFound(String),

    #[error("Failed to spawn agent '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed waiting on agent process: {0}")]
    Wait(std::io::Error),
}

/// A merge that stopped on conflicting paths. The base branch is untouched.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Merge conflict in {} file(s): {}", files.len(), files.join(", "))]
pub struct MergeConflictError {
    pub task_id: TaskId,
    pub files: Vec<String>,
}

impl MergeConflictError {
    pub const HINT: &'static str = "rebase onto base branch, resolve, retry merge";

    pub fn new(task_id: TaskId, files: Vec<String>) -> Self {
        Self { task_id, files }
    }

    pub fn hint(&self) -> &'static str {
        Self::HINT
    }
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Git error: {0}")]
    Git(#[from] git2::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("Workspace error: {0}")]
    Workspace(#[from] WorkspaceError),

    #[error("Agent process error: {0}")]
    AgentProcess(#[from] AgentProcessError),

    #[error(transparent)]
    MergeConflict(#[from] MergeConflictError),

    #[error("Merge failed: {0}")]
    Merge(String),

    #[error("Task not found: {0}")]
    TaskNotFound(TaskId),

    #[error("Task is busy: {0}")]
    TaskBusy(TaskId),

    #[error("Invalid transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    #[error("No home directory")]
    NoHomeDir,

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Task join error: {0}")]
    TaskJoin(String),

    #[error("Scheduler is not running")]
    SchedulerStopped,
}

impl Error {
    /// Stable machine-readable code, also used as a task's `block_reason`.
    pub fn code(&self) -> &'static str {
        match self {
            Error::Io(_) | Error::Json(_) | Error::TomlParse(_) | Error::TomlSerialize(_) => {
                "io_error"
            }
            Error::Git(_) | Error::Workspace(_) => "workspace_error",
            Error::AgentProcess(_) => "agent_process_error",
            Error::MergeConflict(_) => "merge_conflict",
            Error::Merge(_) => "merge_error",
            Error::TaskNotFound(_) => "task_not_found",
            Error::TaskBusy(_) => "task_busy",
            Error::InvalidTransition { .. } => "invalid_transition",
            Error::NoHomeDir | Error::Validation(_) => "invalid_input",
            Error::TaskJoin(_) => "internal_error",
            Error::SchedulerStopped => "scheduler_stopped",
        }
    }

    /// What a human should do about it.
    pub fn hint(&self) -> &'static str {
        match self {
            Error::Git(_) | Error::Workspace(_) => {
                "check the repository and worktree directory, then start the task again"
            }
            Error::AgentProcess(AgentProcessError::BinaryNotFound(_))
            | Error::AgentProcess(AgentProcessError::EmptyCommand) => {
                "set `command` in the config to an installed agent binary"
            }
            Error::AgentProcess(_) => "inspect the agent output and start the task again",
            Error::MergeConflict(_) => MergeConflictError::HINT,
            Error::Merge(_) => "commit or stash changes on the base branch checkout, then retry the merge",
            Error::TaskNotFound(_) => "check the task id",
            Error::TaskBusy(_) => "wait for the current operation on this task to finish",
            Error::InvalidTransition { .. } => "move the task to a state that allows this action",
            Error::SchedulerStopped => "restart the scheduler",
            _ => "see the log for details",
        }
    }

    pub fn report(&self) -> FailureReport {
        FailureReport {
            code: self.code().to_string(),
            message: self.to_string(),
            hint: self.hint().to_string(),
        }
    }

    pub fn invalid_transition(from: impl ToString, to: impl ToString) -> Self {
        Error::InvalidTransition {
            from: from.to_string(),
            to: to.to_string(),
        }
    }
}

/// The `(code, message, hint)` triple every terminal failure surfaces.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailureReport {
    pub code: String,
    pub message: String,
    pub hint: String,
}

impl std::fmt::Display for FailureReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {} (hint: {})", self.code, self.message, self.hint)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
