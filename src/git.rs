use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use git2::{
    BranchType, Commit, DiffOptions, ErrorCode, IndexAddOption, Oid, Repository, ResetType,
    Signature, Status, StatusOptions,
};

use crate::error::WorkspaceError;
use crate::{llog_debug, llog_warn, Result};

/// Line and file counts for a branch against its merge base.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiffSummary {
    /// Sorted, de-duplicated paths relative to the repository root.
    pub files: Vec<String>,
    pub insertions: usize,
    pub deletions: usize,
}

impl DiffSummary {
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

/// Result of publishing a squash commit onto the base branch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FastForward {
    /// The base ref now points at this commit.
    Published(Oid),
    /// The base has commits the task branch lacks, or moved under us.
    NotFastForward,
}

/// Result of replaying the task branch onto the current base tip.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rebase {
    Rebased(Oid),
    Conflict(Vec<String>),
}

/// State of the base branch in the main checkout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BaseCheckout {
    NotCheckedOut,
    Clean,
    /// Tracked files with local modifications.
    Dirty(Vec<String>),
}

pub struct GitOps {
    repo_path: PathBuf,
}

impl GitOps {
    pub fn new(repo_path: &Path) -> Result<Self> {
        llog_debug!("GitOps::new path={}", repo_path.display());
        let repo = Repository::discover(repo_path)?;
        let root = repo
            .workdir()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| repo_path.to_path_buf());
        Ok(Self { repo_path: root })
    }

    fn repo(&self) -> Result<Repository> {
        Ok(Repository::discover(&self.repo_path)?)
    }

    pub fn repo_path(&self) -> &Path {
        &self.repo_path
    }

    /// Repository folder name, used to key the task board.
    pub fn repo_name(&self) -> String {
        self.repo_path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("unknown")
            .to_string()
    }

    /// Name of the checked-out branch, or the short commit id when detached.
    pub fn current_head(&self) -> Result<String> {
        let repo = self.repo()?;
        let head = repo.head()?;
        if head.is_branch() {
            if let Some(name) = head.shorthand() {
                return Ok(name.to_string());
            }
        }
        let commit = head.peel_to_commit()?;
        Ok(format!("{:.7}", commit.id()))
    }

    pub fn branch_exists(&self, branch: &str) -> Result<bool> {
        let repo = self.repo()?;
        let result = repo.find_branch(branch, BranchType::Local);
        match result {
            Ok(_) => Ok(true),
            Err(e) if e.code() == ErrorCode::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    pub fn branch_tip(&self, branch: &str) -> Result<Oid> {
        let repo = self.repo()?;
        let id = branch_commit(&repo, branch)?.id();
        Ok(id)
    }

    /// Create `branch` from the tip of `base` and check it out at `worktree_path`.
    pub fn create_worktree(
        &self,
        branch: &str,
        worktree_path: &Path,
        base: &str,
    ) -> std::result::Result<(), WorkspaceError> {
        llog_debug!(
            "GitOps::create_worktree branch={} base={} path={}",
            branch,
            base,
            worktree_path.display()
        );
        let repo = Repository::discover(&self.repo_path)?;
        let commit = match repo.find_branch(base, BranchType::Local) {
            Ok(b) => b.get().peel_to_commit()?,
            Err(e) if e.code() == ErrorCode::NotFound => {
                return Err(WorkspaceError::BaseBranchNotFound(base.to_string()))
            }
            Err(e) => return Err(e.into()),
        };
        llog_debug!("Creating branch {} from commit {}", branch, commit.id());
        let branch_obj = repo.branch(branch, &commit, false)?;
        add_worktree(&repo, &branch_obj.into_reference(), worktree_path, branch)?;
        llog_debug!("Worktree created successfully");
        Ok(())
    }

    /// Check out an existing branch at `worktree_path`.
    pub fn create_worktree_from_branch(
        &self,
        branch: &str,
        worktree_path: &Path,
    ) -> std::result::Result<(), WorkspaceError> {
        llog_debug!(
            "GitOps::create_worktree_from_branch branch={} path={}",
            branch,
            worktree_path.display()
        );
        let repo = Repository::discover(&self.repo_path)?;
        let reference = repo.find_branch(branch, BranchType::Local)?.into_reference();
        add_worktree(&repo, &reference, worktree_path, branch)?;
        Ok(())
    }

    /// Remove a worktree and its admin directory. Missing pieces are skipped,
    /// so calling this twice is fine.
    pub fn remove_worktree(&self, worktree_path: &Path) -> Result<()> {
        llog_debug!("GitOps::remove_worktree path={}", worktree_path.display());
        let repo = self.repo()?;
        let worktrees = repo.worktrees()?;

        // Path comparison can miss on canonicalization, fall back to folder name.
        let folder_name = worktree_path
            .file_name()
            .and_then(|n| n.to_str())
            .map(|s| s.to_string());
        let worktree_name: Option<String> = worktrees
            .iter()
            .flatten()
            .find(|name| {
                repo.find_worktree(name)
                    .map(|wt| wt.path() == worktree_path)
                    .unwrap_or(false)
                    || folder_name.as_deref() == Some(*name)
            })
            .map(|s| s.to_string());

        if let Some(ref name) = worktree_name {
            if let Ok(worktree) = repo.find_worktree(name) {
                let _ = worktree.unlock();
                let prune_result = worktree.prune(Some(
                    git2::WorktreePruneOptions::new()
                        .valid(true)
                        .working_tree(true)
                        .locked(true),
                ));
                if let Err(e) = prune_result {
                    llog_warn!("Worktree prune failed for '{}': {}", name, e);
                }
            }
        }

        if worktree_path.exists() {
            llog_debug!("Removing worktree directory: {}", worktree_path.display());
            std::fs::remove_dir_all(worktree_path)?;
        }

        // A leftover admin dir keeps the branch marked as checked out.
        for name in worktree_name.iter().chain(folder_name.iter()) {
            let admin_dir = repo.path().join("worktrees").join(name);
            if admin_dir.exists() {
                llog_debug!("Cleaning up worktree admin dir: {}", admin_dir.display());
                let _ = std::fs::remove_dir_all(&admin_dir);
            }
        }
        Ok(())
    }

    /// Delete a local branch. Missing branches are not an error.
    pub fn delete_branch(&self, branch: &str) -> Result<()> {
        llog_debug!("GitOps::delete_branch branch={}", branch);
        let repo = self.repo()?;
        match repo.find_branch(branch, BranchType::Local) {
            Ok(mut branch_ref) => {
                if let Err(e) = branch_ref.delete() {
                    llog_warn!("Failed to delete branch '{}': {}", branch, e);
                } else {
                    llog_debug!("Branch deleted: {}", branch);
                }
            }
            Err(e) if e.code() == ErrorCode::NotFound => {
                llog_debug!("Branch '{}' not found (already deleted?)", branch);
            }
            Err(e) => {
                llog_warn!("Error looking up branch '{}': {}", branch, e);
            }
        }
        Ok(())
    }

    /// Stage everything in the worktree and commit it. Returns false when
    /// there was nothing to commit.
    pub fn commit_all(&self, worktree_path: &Path, message: &str) -> Result<bool> {
        llog_debug!(
            "GitOps::commit_all path={} message={}",
            worktree_path.display(),
            message
        );
        let repo = Repository::open(worktree_path)?;
        let mut index = repo.index()?;
        index.add_all(["*"].iter(), IndexAddOption::DEFAULT, None)?;
        index.update_all(["*"].iter(), None)?;
        index.write()?;

        let tree_id = index.write_tree()?;
        let parent = match repo.head() {
            Ok(head) => Some(head.peel_to_commit()?),
            Err(e) if e.code() == ErrorCode::UnbornBranch => None,
            Err(e) => return Err(e.into()),
        };
        if let Some(ref p) = parent {
            if p.tree_id() == tree_id {
                llog_debug!("Nothing to commit in {}", worktree_path.display());
                return Ok(false);
            }
        }

        let tree = repo.find_tree(tree_id)?;
        let sig = signature(&repo)?;
        let parents: Vec<&Commit> = parent.iter().collect();
        let commit_id = repo.commit(Some("HEAD"), &sig, &sig, message, &tree, &parents)?;
        llog_debug!("Commit created: {}", commit_id);
        Ok(true)
    }

    /// Diff of the worktree (committed, staged, unstaged and untracked)
    /// against the merge base with `base`.
    pub fn diff_against(&self, worktree_path: &Path, base: &str) -> Result<DiffSummary> {
        llog_debug!(
            "GitOps::diff_against path={} base={}",
            worktree_path.display(),
            base
        );
        let repo = Repository::open(worktree_path)?;
        let base_tip = branch_commit(&repo, base)?.id();
        let head = repo.head()?.peel_to_commit()?.id();
        let merge_base = repo.merge_base(base_tip, head)?;
        let tree = repo.find_commit(merge_base)?.tree()?;

        let mut opts = DiffOptions::new();
        opts.include_untracked(true)
            .recurse_untracked_dirs(true)
            .show_untracked_content(true);
        let diff = repo.diff_tree_to_workdir_with_index(Some(&tree), Some(&mut opts))?;

        let mut files = BTreeSet::new();
        for delta in diff.deltas() {
            for file in [delta.old_file(), delta.new_file()] {
                if let Some(path) = file.path().and_then(|p| p.to_str()) {
                    files.insert(path.to_string());
                }
            }
        }
        let stats = diff.stats()?;
        Ok(DiffSummary {
            files: files.into_iter().collect(),
            insertions: stats.insertions(),
            deletions: stats.deletions(),
        })
    }

    /// Publish `task_branch` as one commit on `base` if `base` is an
    /// ancestor of it. The ref moves with a compare-and-swap.
    pub fn squash_fast_forward(
        &self,
        base: &str,
        task_branch: &str,
        message: &str,
    ) -> Result<FastForward> {
        llog_debug!(
            "GitOps::squash_fast_forward base={} branch={}",
            base,
            task_branch
        );
        let repo = self.repo()?;
        let base_tip = branch_commit(&repo, base)?;
        let head = branch_commit(&repo, task_branch)?;
        let merge_base = repo.merge_base(base_tip.id(), head.id())?;
        if merge_base != base_tip.id() {
            llog_debug!("Base {} has moved past merge base {}", base, merge_base);
            return Ok(FastForward::NotFastForward);
        }
        if head.tree_id() == base_tip.tree_id() {
            llog_debug!("Branch {} adds nothing to {}", task_branch, base);
            return Ok(FastForward::Published(base_tip.id()));
        }

        let sig = signature(&repo)?;
        let tree = head.tree()?;
        let commit_id = repo.commit(None, &sig, &sig, message, &tree, &[&base_tip])?;
        let refname = format!("refs/heads/{}", base);
        let reflog = format!("lanekeeper: squash merge {}", task_branch);
        let result = match repo.reference_matching(&refname, commit_id, true, base_tip.id(), &reflog) {
            Ok(_) => {
                llog_debug!("Base {} moved to {}", base, commit_id);
                Ok(FastForward::Published(commit_id))
            }
            Err(e) if e.code() == ErrorCode::Modified => {
                llog_debug!("Base {} changed during publish: {}", base, e);
                Ok(FastForward::NotFastForward)
            }
            Err(e) => Err(e.into()),
        };
        result
    }

    /// Rewrite `task_branch` as a single commit on the current tip of `base`
    /// and reset its worktree. Computed in memory; on conflict nothing moves.
    pub fn rebase_squash(
        &self,
        base: &str,
        task_branch: &str,
        worktree_path: &Path,
        message: &str,
    ) -> Result<Rebase> {
        llog_debug!(
            "GitOps::rebase_squash base={} branch={} path={}",
            base,
            task_branch,
            worktree_path.display()
        );
        let repo = self.repo()?;
        let base_tip = branch_commit(&repo, base)?;
        let head = branch_commit(&repo, task_branch)?;

        let mut index = repo.merge_commits(&base_tip, &head, None)?;
        if index.has_conflicts() {
            let mut files = BTreeSet::new();
            for conflict in index.conflicts()? {
                let conflict = conflict?;
                for entry in [conflict.our, conflict.their, conflict.ancestor]
                    .into_iter()
                    .flatten()
                {
                    files.insert(String::from_utf8_lossy(&entry.path).into_owned());
                }
            }
            let files: Vec<String> = files.into_iter().collect();
            llog_debug!("Rebase of {} conflicts in {:?}", task_branch, files);
            return Ok(Rebase::Conflict(files));
        }

        let tree_id = index.write_tree_to(&repo)?;
        let tree = repo.find_tree(tree_id)?;
        let sig = signature(&repo)?;
        let commit_id = repo.commit(None, &sig, &sig, message, &tree, &[&base_tip])?;
        repo.reference(
            &format!("refs/heads/{}", task_branch),
            commit_id,
            true,
            &format!("lanekeeper: rebase onto {}", base),
        )?;

        if worktree_path.exists() {
            let wt_repo = Repository::open(worktree_path)?;
            let commit = wt_repo.find_commit(commit_id)?;
            wt_repo.reset(commit.as_object(), ResetType::Hard, None)?;
        }
        llog_debug!("Branch {} rebased to {}", task_branch, commit_id);
        Ok(Rebase::Rebased(commit_id))
    }

    /// Whether `base` is checked out in the main repository and if tracked
    /// files there are modified.
    pub fn base_checkout(&self, base: &str) -> Result<BaseCheckout> {
        let repo = self.repo()?;
        if repo.is_bare() || !head_is_branch(&repo, base) {
            return Ok(BaseCheckout::NotCheckedOut);
        }
        let mut opts = StatusOptions::new();
        opts.include_untracked(false).include_ignored(false);
        let statuses = repo.statuses(Some(&mut opts))?;
        let dirty: Vec<String> = statuses
            .iter()
            .filter(|s| !s.status().is_empty())
            .filter_map(|s| s.path().map(String::from))
            .collect();
        if dirty.is_empty() {
            Ok(BaseCheckout::Clean)
        } else {
            Ok(BaseCheckout::Dirty(dirty))
        }
    }

    /// Untracked or ignored paths in the main checkout of `base` that
    /// publishing `task_branch` would overwrite. Empty when `base` is not
    /// checked out.
    pub fn untracked_collisions(&self, base: &str, task_branch: &str) -> Result<Vec<String>> {
        let repo = self.repo()?;
        if repo.is_bare() || !head_is_branch(&repo, base) {
            return Ok(Vec::new());
        }
        let mut opts = StatusOptions::new();
        opts.include_untracked(true)
            .include_ignored(true)
            .recurse_untracked_dirs(false)
            .recurse_ignored_dirs(false);
        let statuses = repo.statuses(Some(&mut opts))?;
        // Unrecursed directories come back with a trailing slash.
        let untracked: Vec<String> = statuses
            .iter()
            .filter(|s| s.status().intersects(Status::WT_NEW | Status::IGNORED))
            .filter_map(|s| s.path().map(String::from))
            .collect();
        if untracked.is_empty() {
            return Ok(Vec::new());
        }

        let base_tree = branch_commit(&repo, base)?.tree()?;
        let head_tree = branch_commit(&repo, task_branch)?.tree()?;
        let diff = repo.diff_tree_to_tree(Some(&base_tree), Some(&head_tree), None)?;
        let mut hits = BTreeSet::new();
        for delta in diff.deltas() {
            let Some(path) = delta.new_file().path().and_then(|p| p.to_str()) else {
                continue;
            };
            let covered = untracked
                .iter()
                .any(|u| u == path || (u.ends_with('/') && path.starts_with(u.as_str())));
            if covered {
                hits.insert(path.to_string());
            }
        }
        Ok(hits.into_iter().collect())
    }

    /// Bring the main checkout up to date after its branch moved.
    pub fn refresh_checkout(&self, base: &str) -> Result<()> {
        let repo = self.repo()?;
        if repo.is_bare() || !head_is_branch(&repo, base) {
            return Ok(());
        }
        llog_debug!("Refreshing checkout of {}", base);
        let mut checkout = git2::build::CheckoutBuilder::new();
        checkout.force();
        repo.checkout_head(Some(&mut checkout))?;
        Ok(())
    }
}

fn branch_commit<'r>(repo: &'r Repository, branch: &str) -> Result<Commit<'r>> {
    match repo.find_branch(branch, BranchType::Local) {
        Ok(b) => Ok(b.get().peel_to_commit()?),
        Err(e) if e.code() == ErrorCode::NotFound => {
            Err(WorkspaceError::BaseBranchNotFound(branch.to_string()).into())
        }
        Err(e) => Err(e.into()),
    }
}

fn head_is_branch(repo: &Repository, branch: &str) -> bool {
    repo.head()
        .ok()
        .map(|h| h.is_branch() && h.shorthand() == Some(branch))
        .unwrap_or(false)
}

fn signature(repo: &Repository) -> std::result::Result<Signature<'static>, git2::Error> {
    repo.signature()
        .or_else(|_| Signature::now("Lanekeeper", "lanekeeper@localhost"))
}

fn add_worktree(
    repo: &Repository,
    reference: &git2::Reference<'_>,
    worktree_path: &Path,
    branch: &str,
) -> std::result::Result<(), WorkspaceError> {
    // Use worktree path's folder name as worktree name (branch contains slashes)
    let worktree_name = worktree_path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or(branch);

    if let Ok(stale) = repo.find_worktree(worktree_name) {
        if !stale.path().exists() {
            llog_debug!("Pruning stale worktree reference: {}", worktree_name);
            let _ = stale.prune(Some(
                git2::WorktreePruneOptions::new()
                    .valid(true)
                    .working_tree(true)
                    .locked(true),
            ));
        }
    }
    if let Some(parent) = worktree_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let mut opts = git2::WorktreeAddOptions::new();
    opts.reference(Some(reference));
    llog_debug!("Creating worktree with name: {}", worktree_name);
    repo.worktree(worktree_name, worktree_path, Some(&opts))?;
    Ok(())
}
