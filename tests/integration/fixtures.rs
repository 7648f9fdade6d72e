//! Test fixtures for integration tests.
//!
//! Provides helpers for:
//! - Creating temporary git repositories
//! - Fake agents written as shell scripts
//! - A running scheduler with its event stream

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use git2::{Oid, Repository, Signature};
use tempfile::TempDir;
use tokio::sync::mpsc;

use lanekeeper::core::task::{Task, TaskId};
use lanekeeper::git::GitOps;
use lanekeeper::orchestration::{
    AgentRunner, MergeCoordinator, Scheduler, SchedulerConfig, SchedulerEvent, SchedulerHandle,
};
use lanekeeper::store::{MemoryTaskStore, TaskStore};
use lanekeeper::workspace::WorkspaceManager;

/// How long any single wait in a test may take.
pub const EVENT_TIMEOUT: Duration = Duration::from_secs(30);

/// A test repository with a temporary directory and an initial commit.
pub struct TestRepo {
    /// The temporary directory containing the repo.
    pub temp_dir: TempDir,
    /// Path to the repository root.
    pub path: PathBuf,
}

impl TestRepo {
    /// Create a new test repository with an initial commit.
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let path = temp_dir.path().to_path_buf();
        let repo = Repository::init(&path).expect("Failed to init git");
        {
            let mut config = repo.config().expect("Failed to open repo config");
            config.set_str("user.name", "Test").unwrap();
            config.set_str("user.email", "test@example.com").unwrap();
        }
        let this = Self { temp_dir, path };
        this.create_and_commit("README.md", "# Test Repository\n", "Initial commit");
        this
    }

    pub fn repo(&self) -> Repository {
        Repository::open(&self.path).expect("Failed to open repo")
    }

    /// Write a file in the main checkout and commit it on the current branch.
    pub fn create_and_commit(&self, filename: &str, content: &str, message: &str) -> Oid {
        let file_path = self.path.join(filename);
        if let Some(parent) = file_path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(&file_path, content).unwrap();

        let repo = self.repo();
        let mut index = repo.index().unwrap();
        index.add_path(Path::new(filename)).unwrap();
        index.write().unwrap();
        let tree = repo.find_tree(index.write_tree().unwrap()).unwrap();
        let sig = Signature::now("Test", "test@example.com").unwrap();
        let parents = match repo.head() {
            Ok(head) => vec![head.peel_to_commit().unwrap()],
            Err(_) => Vec::new(),
        };
        let parent_refs: Vec<_> = parents.iter().collect();
        repo.commit(Some("HEAD"), &sig, &sig, message, &tree, &parent_refs)
            .unwrap()
    }

    pub fn current_branch(&self) -> String {
        self.repo().head().unwrap().shorthand().unwrap().to_string()
    }

    pub fn branch_tip(&self, branch: &str) -> Oid {
        self.repo()
            .find_branch(branch, git2::BranchType::Local)
            .unwrap()
            .get()
            .peel_to_commit()
            .unwrap()
            .id()
    }

    pub fn branch_exists(&self, branch: &str) -> bool {
        self.repo()
            .find_branch(branch, git2::BranchType::Local)
            .is_ok()
    }

    /// Contents of `file` in the tip commit of `branch`.
    pub fn read_at(&self, branch: &str, file: &str) -> Option<String> {
        let repo = self.repo();
        let commit = repo
            .find_branch(branch, git2::BranchType::Local)
            .ok()?
            .get()
            .peel_to_commit()
            .ok()?;
        let entry = commit.tree().ok()?.get_path(Path::new(file)).ok()?;
        let blob = repo.find_blob(entry.id()).ok()?;
        Some(String::from_utf8_lossy(blob.content()).to_string())
    }

    pub fn git_ops(&self) -> GitOps {
        GitOps::new(&self.path).expect("Failed to open GitOps")
    }
}

impl Default for TestRepo {
    fn default() -> Self {
        Self::new()
    }
}

/// A shell script standing in for a coding agent.
///
/// The script runs with the task's workspace as its working directory and
/// sees the `LANEKEEPER_*` variables, so one script can act differently per
/// task title or iteration.
pub struct FakeAgent {
    _dir: TempDir,
    pub path: PathBuf,
}

impl FakeAgent {
    pub fn new(body: &str) -> Self {
        use std::os::unix::fs::PermissionsExt;

        let dir = TempDir::new().expect("Failed to create agent dir");
        let path = dir.path().join("agent.sh");
        std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        Self { _dir: dir, path }
    }

    pub fn command(&self) -> String {
        self.path.display().to_string()
    }
}

/// Create a test task with the given name.
pub fn test_task(name: &str) -> Task {
    Task::new(name, &format!("{} description", name))
}

/// Scheduler limits suited to fast fake agents.
pub fn test_config(max_agents: usize) -> SchedulerConfig {
    SchedulerConfig {
        max_concurrent_agents: max_agents,
        max_iterations: 5,
        iteration_timeout: Duration::from_secs(20),
        ambiguity_threshold: 3,
        retry_delay: Duration::from_millis(50),
        resume_on_start: true,
    }
}

/// Test harness: a repository, a persisted task board and a running scheduler.
pub struct SchedulerHarness {
    pub repo: TestRepo,
    pub worktrees: TempDir,
    pub board_dir: TempDir,
    pub agent: FakeAgent,
    pub config: SchedulerConfig,
    pub serialize_merges: bool,
    pub store: Arc<MemoryTaskStore>,
    pub workspaces: Arc<WorkspaceManager>,
    pub handle: SchedulerHandle,
    pub events: mpsc::UnboundedReceiver<SchedulerEvent>,
    /// Every event received so far, in order.
    pub seen: Vec<SchedulerEvent>,
}

impl SchedulerHarness {
    /// Create a harness whose agent runs `agent_body`.
    pub fn new(agent_body: &str, config: SchedulerConfig) -> Self {
        Self::build(
            TestRepo::new(),
            TempDir::new().unwrap(),
            TempDir::new().unwrap(),
            FakeAgent::new(agent_body),
            config,
            true,
        )
    }

    fn build(
        repo: TestRepo,
        worktrees: TempDir,
        board_dir: TempDir,
        agent: FakeAgent,
        config: SchedulerConfig,
        serialize_merges: bool,
    ) -> Self {
        let store = Arc::new(
            MemoryTaskStore::open(&board_dir.path().join("board.json"))
                .expect("Failed to open board"),
        );
        let workspaces = Arc::new(WorkspaceManager::new(
            repo.git_ops(),
            worktrees.path().to_path_buf(),
            repo.current_branch(),
        ));
        let runner = AgentRunner::new(&agent.command(), &repo.path, Duration::from_millis(200))
            .expect("Failed to create runner");
        let merges = Arc::new(MergeCoordinator::new(
            store.clone() as Arc<dyn TaskStore>,
            Arc::clone(&workspaces),
            serialize_merges,
        ));
        let (event_tx, events) = mpsc::unbounded_channel();
        let (scheduler, handle) = Scheduler::new(
            config.clone(),
            store.clone() as Arc<dyn TaskStore>,
            Arc::clone(&workspaces),
            Arc::new(runner),
            merges,
            event_tx,
        );
        tokio::spawn(scheduler.run());

        Self {
            repo,
            worktrees,
            board_dir,
            agent,
            config,
            serialize_merges,
            store,
            workspaces,
            handle,
            events,
            seen: Vec::new(),
        }
    }

    /// Shut the scheduler down and start a new one over the same repository
    /// and board file, with a different agent.
    pub async fn restart(self, agent_body: &str) -> Self {
        // Already stopped is fine.
        let _ = self.handle.shutdown().await;
        Self::build(
            self.repo,
            self.worktrees,
            self.board_dir,
            FakeAgent::new(agent_body),
            self.config,
            self.serialize_merges,
        )
    }

    pub fn add(&self, task: Task) -> TaskId {
        let id = task.id;
        self.store.insert_task(task).expect("Failed to insert task");
        id
    }

    pub fn task(&self, id: TaskId) -> Task {
        self.store.get_task(id).expect("Task missing")
    }

    /// Wait for the first event matching `pred`.
    pub async fn wait_for<F>(&mut self, mut pred: F) -> SchedulerEvent
    where
        F: FnMut(&SchedulerEvent) -> bool,
    {
        let events = &mut self.events;
        let seen = &mut self.seen;
        tokio::time::timeout(EVENT_TIMEOUT, async {
            loop {
                let event = events.recv().await.expect("Scheduler stopped");
                seen.push(event.clone());
                if pred(&event) {
                    return event;
                }
            }
        })
        .await
        .expect("Timed out waiting for scheduler event")
    }

    /// Wait until nothing is running and nothing is queued.
    pub async fn wait_idle(&mut self) {
        loop {
            let snapshot = self.handle.snapshot().await.unwrap();
            if snapshot.running.is_empty() && snapshot.queued.is_empty() {
                return;
            }
            self.wait_for(|e| matches!(e, SchedulerEvent::Idle)).await;
        }
    }
}

/// Agent that writes `<title>.txt` and finishes.
pub const WRITE_AND_COMPLETE: &str =
    "echo \"work for $LANEKEEPER_TASK_TITLE\" > \"$LANEKEEPER_TASK_TITLE.txt\"\necho '<complete/>'";
