//! Per-task git workspaces.
//!
//! Each AUTO or PAIR task that is IN_PROGRESS or REVIEW owns one worktree on
//! its own branch. Paths and branch names are derived from the task, so a
//! workspace can be located again after a restart without any extra state.

use std::path::{Path, PathBuf};

use crate::config::Config;
use crate::core::task::{Task, TaskId};
use crate::error::WorkspaceError;
use crate::git::{BaseCheckout, FastForward, GitOps, Rebase};
use crate::util::slugify;
use crate::{llog, llog_debug, llog_warn, Result};

pub use crate::git::DiffSummary;

pub const BRANCH_PREFIX: &str = "lanekeeper";
const SLUG_MAX_LEN: usize = 40;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Workspace {
    pub task_id: TaskId,
    pub title: String,
    pub path: PathBuf,
    pub branch: String,
    pub base_branch: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MergeStrategy {
    /// Land the branch as a single commit on the base.
    #[default]
    Squash,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeAttemptOutcome {
    Success { commit: String },
    Conflict(Vec<String>),
    Error(String),
}

/// Result of [`WorkspaceManager::merge_to_base`]. `attempt` is 1 for the
/// original merge and 2 when the rebase retry ran.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeAttempt {
    pub task_id: TaskId,
    pub attempt: u8,
    pub outcome: MergeAttemptOutcome,
}

impl MergeAttempt {
    pub fn is_success(&self) -> bool {
        matches!(self.outcome, MergeAttemptOutcome::Success { .. })
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self.outcome, MergeAttemptOutcome::Conflict(_))
    }
}

pub struct WorkspaceManager {
    git: GitOps,
    worktrees_dir: PathBuf,
    base_branch: String,
}

impl WorkspaceManager {
    pub fn new(git: GitOps, worktrees_dir: PathBuf, base_branch: String) -> Self {
        Self {
            git,
            worktrees_dir,
            base_branch,
        }
    }

    /// Build from config. The base branch defaults to the repository's
    /// current branch.
    pub fn from_config(repo_path: &Path, config: &Config) -> Result<Self> {
        let git = GitOps::new(repo_path)?;
        let base_branch = match &config.base_branch {
            Some(branch) => branch.clone(),
            None => git.current_head()?,
        };
        let worktrees_dir = config.worktrees_dir()?.join(git.repo_name());
        llog_debug!(
            "WorkspaceManager base={} worktrees={}",
            base_branch,
            worktrees_dir.display()
        );
        Ok(Self::new(git, worktrees_dir, base_branch))
    }

    pub fn base_branch(&self) -> &str {
        &self.base_branch
    }

    pub fn repo_path(&self) -> &Path {
        self.git.repo_path()
    }

    pub fn git(&self) -> &GitOps {
        &self.git
    }

    /// Deterministic workspace location for a task. Touches nothing on disk.
    pub fn workspace_for(&self, task: &Task) -> Workspace {
        let name = format!("{}-{}", task.id.short(), slugify(&task.title, SLUG_MAX_LEN));
        Workspace {
            task_id: task.id,
            title: task.title.clone(),
            path: self.worktrees_dir.join(&name),
            branch: format!("{}/{}", BRANCH_PREFIX, name),
            base_branch: self.base_branch.clone(),
        }
    }

    pub fn exists(&self, workspace: &Workspace) -> bool {
        workspace.path.exists()
    }

    /// Create the worktree for `task` from `base_branch`. A branch left
    /// behind by an earlier run is checked out again rather than recreated.
    pub fn create(
        &self,
        task: &Task,
        base_branch: &str,
    ) -> std::result::Result<Workspace, WorkspaceError> {
        let mut workspace = self.workspace_for(task);
        workspace.base_branch = base_branch.to_string();
        if workspace.path.exists() {
            return Err(WorkspaceError::AlreadyExists(workspace.path));
        }

        let branch_exists = self
            .git
            .branch_exists(&workspace.branch)
            .map_err(into_workspace_error)?;
        if branch_exists {
            llog_debug!("Reusing branch {} for task {}", workspace.branch, task.id.short());
            self.git
                .create_worktree_from_branch(&workspace.branch, &workspace.path)?;
        } else {
            self.git
                .create_worktree(&workspace.branch, &workspace.path, base_branch)?;
        }
        llog!(
            "Workspace created for task {} at {}",
            task.id.short(),
            workspace.path.display()
        );
        Ok(workspace)
    }

    /// Return the task's workspace, creating it from the default base if absent.
    pub fn ensure(&self, task: &Task) -> std::result::Result<Workspace, WorkspaceError> {
        let workspace = self.workspace_for(task);
        if self.exists(&workspace) {
            return Ok(workspace);
        }
        self.create(task, &self.base_branch)
    }

    /// Changes on the workspace relative to its merge base. A workspace that
    /// is not on disk has an empty diff.
    pub fn diff(&self, workspace: &Workspace) -> Result<DiffSummary> {
        if !self.exists(workspace) {
            llog_debug!("diff: no worktree for task {}", workspace.task_id.short());
            return Ok(DiffSummary::default());
        }
        self.git.diff_against(&workspace.path, &workspace.base_branch)
    }

    /// Remove the worktree, keeping the branch. Idempotent.
    pub fn remove(&self, workspace: &Workspace) -> Result<()> {
        llog_debug!("Removing workspace {}", workspace.path.display());
        self.git.remove_worktree(&workspace.path)
    }

    /// Remove the worktree and delete the branch.
    pub fn discard(&self, workspace: &Workspace) -> Result<()> {
        self.remove(workspace)?;
        self.git.delete_branch(&workspace.branch)
    }

    /// Land the workspace branch on its base branch.
    ///
    /// Uncommitted work is committed first. If the base has moved, the branch
    /// is rebased onto the new tip once and the merge retried. Conflicts leave
    /// the base branch and the main checkout untouched.
    pub fn merge_to_base(&self, workspace: &Workspace, strategy: MergeStrategy) -> MergeAttempt {
        let mut attempt = 1;
        let outcome = match self.try_merge(workspace, strategy, &mut attempt) {
            Ok(outcome) => outcome,
            Err(e) => {
                llog_warn!("Merge of task {} failed: {}", workspace.task_id.short(), e);
                MergeAttemptOutcome::Error(e.to_string())
            }
        };
        MergeAttempt {
            task_id: workspace.task_id,
            attempt,
            outcome,
        }
    }

    fn try_merge(
        &self,
        workspace: &Workspace,
        strategy: MergeStrategy,
        attempt: &mut u8,
    ) -> Result<MergeAttemptOutcome> {
        let MergeStrategy::Squash = strategy;
        let base = &workspace.base_branch;
        llog_debug!(
            "merge_to_base task={} branch={} base={}",
            workspace.task_id.short(),
            workspace.branch,
            base
        );

        if let BaseCheckout::Dirty(files) = self.git.base_checkout(base)? {
            return Ok(MergeAttemptOutcome::Error(format!(
                "base branch '{}' is checked out with uncommitted changes: {}",
                base,
                files.join(", ")
            )));
        }

        if self.exists(workspace) {
            self.git.commit_all(
                &workspace.path,
                &format!("lanekeeper: snapshot {}", workspace.title),
            )?;
        }

        let message = format!("{} (lanekeeper {})", workspace.title, workspace.task_id.short());
        if let Some(refused) = self.untracked_in_the_way(workspace)? {
            return Ok(refused);
        }
        if let FastForward::Published(commit) =
            self.git
                .squash_fast_forward(base, &workspace.branch, &message)?
        {
            return Ok(self.published(base, commit));
        }

        *attempt = 2;
        llog!(
            "Base {} moved, rebasing task {} once",
            base,
            workspace.task_id.short()
        );
        let rebase_message = format!("lanekeeper: rebase {}", workspace.title);
        if let Rebase::Conflict(files) =
            self.git
                .rebase_squash(base, &workspace.branch, &workspace.path, &rebase_message)?
        {
            return Ok(MergeAttemptOutcome::Conflict(files));
        }
        if let Some(refused) = self.untracked_in_the_way(workspace)? {
            return Ok(refused);
        }

        match self
            .git
            .squash_fast_forward(base, &workspace.branch, &message)?
        {
            FastForward::Published(commit) => Ok(self.published(base, commit)),
            FastForward::NotFastForward => Ok(MergeAttemptOutcome::Error(format!(
                "base branch '{}' moved again during the retry",
                base
            ))),
        }
    }

    /// The checkout refresh after publishing would clobber untracked files
    /// the branch also adds, so refuse before the base ref moves.
    fn untracked_in_the_way(&self, workspace: &Workspace) -> Result<Option<MergeAttemptOutcome>> {
        let base = &workspace.base_branch;
        let files = self.git.untracked_collisions(base, &workspace.branch)?;
        if files.is_empty() {
            return Ok(None);
        }
        Ok(Some(MergeAttemptOutcome::Error(format!(
            "base branch '{}' is checked out with untracked files the merge would overwrite: {}",
            base,
            files.join(", ")
        ))))
    }

    fn published(&self, base: &str, commit: git2::Oid) -> MergeAttemptOutcome {
        if let Err(e) = self.git.refresh_checkout(base) {
            llog_warn!("Failed to refresh checkout of {}: {}", base, e);
        }
        MergeAttemptOutcome::Success {
            commit: commit.to_string(),
        }
    }
}

fn into_workspace_error(err: crate::Error) -> WorkspaceError {
    match err {
        crate::Error::Git(e) => WorkspaceError::Git(e),
        crate::Error::Io(e) => WorkspaceError::Io(e),
        crate::Error::Workspace(e) => e,
        other => WorkspaceError::Io(std::io::Error::other(other.to_string())),
    }
}
