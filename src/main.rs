use std::cmp::Reverse;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand, ValueEnum};
use tokio::sync::mpsc;

use lanekeeper::orchestration::{AgentRunner, Deferral, MergeCoordinator, MergeOutcome};
use lanekeeper::store::{MemoryTaskStore, TaskStore};
use lanekeeper::workspace::WorkspaceManager;
use lanekeeper::{
    llog, Config, Error, Priority, Result, Scheduler, SchedulerConfig, SchedulerEvent,
    SchedulerHandle, Task, TaskFilter, TaskId, TaskStatus, TaskType,
};

/// Lanekeeper - run coding agents on a kanban board, one git worktree per task
#[derive(Parser, Debug)]
#[command(name = "lanekeeper")]
#[command(version, about, long_about = None)]
#[command(
    after_help = "ENVIRONMENT:\n    LANEKEEPER_LOG=<level>  Log threshold (error, warn, info, debug, trace)"
)]
pub struct Cli {
    /// Repository to operate on (defaults to the current directory)
    #[arg(long, global = true)]
    pub repo: Option<PathBuf>,

    /// Config file (defaults to ~/.lanekeeper/config.toml)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Enable debug logging (writes to ~/.lanekeeper/lanekeeper.log)
    #[arg(short = 'd', long, global = true)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Add a task to the backlog
    Add {
        title: String,

        #[arg(long, short = 'm', default_value = "")]
        description: String,

        /// Human-driven task: no agent is run for it
        #[arg(long)]
        pair: bool,

        #[arg(long, value_enum, default_value_t = PriorityArg::Medium)]
        priority: PriorityArg,

        /// Acceptance criterion (repeatable)
        #[arg(long = "criterion", short = 'c')]
        criteria: Vec<String>,

        /// Parent task id or prefix
        #[arg(long)]
        parent: Option<String>,
    },

    /// List tasks on the board
    List {
        #[arg(long, value_enum)]
        status: Option<StatusArg>,
    },

    /// Show one task with its notes
    Show { id: String },

    /// Start tasks and supervise agents until the board is idle (Ctrl-C stops)
    Run {
        /// Tasks to start; defaults to every AUTO task in the backlog
        ids: Vec<String>,
    },

    /// Move an IN_PROGRESS task to review
    Review {
        id: String,

        #[arg(long, short = 's')]
        summary: Option<String>,
    },

    /// Approve a reviewed task and merge it into the base branch
    Approve { id: String },

    /// Send a reviewed task back with feedback
    Reject {
        id: String,

        #[arg(long, short = 'f', default_value = "")]
        feedback: String,

        /// Return the task to the backlog and discard its workspace
        #[arg(long)]
        backlog: bool,
    },

    /// Show merge readiness of tasks in review
    Readiness { id: Option<String> },

    /// Show the files a task's workspace changes
    Diff { id: String },

    /// Delete a BACKLOG or DONE task and any branch it left behind
    Remove { id: String },

    /// Write the default config file if there is none
    Init,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum PriorityArg {
    Low,
    Medium,
    High,
}

impl From<PriorityArg> for Priority {
    fn from(arg: PriorityArg) -> Self {
        match arg {
            PriorityArg::Low => Priority::Low,
            PriorityArg::Medium => Priority::Medium,
            PriorityArg::High => Priority::High,
        }
    }
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusArg {
    Backlog,
    InProgress,
    Review,
    Done,
}

impl From<StatusArg> for TaskStatus {
    fn from(arg: StatusArg) -> Self {
        match arg {
            StatusArg::Backlog => TaskStatus::Backlog,
            StatusArg::InProgress => TaskStatus::InProgress,
            StatusArg::Review => TaskStatus::Review,
            StatusArg::Done => TaskStatus::Done,
        }
    }
}

/// Everything a command needs for one repository.
struct Board {
    config: Config,
    repo_path: PathBuf,
    store: Arc<MemoryTaskStore>,
    workspaces: Arc<WorkspaceManager>,
}

impl Board {
    fn open(repo: Option<PathBuf>, config_path: Option<PathBuf>) -> Result<Self> {
        let config = match config_path {
            Some(path) => Config::load_from(&path)?,
            None => Config::load()?,
        };
        let repo = match repo {
            Some(path) => path,
            None => std::env::current_dir()?,
        };
        config.ensure_dirs()?;
        let workspaces = WorkspaceManager::from_config(&repo, &config)?;
        let repo_path = workspaces.repo_path().to_path_buf();
        let board_path = Config::board_path(&workspaces.git().repo_name())?;
        let store = MemoryTaskStore::open(&board_path)?;
        Ok(Self {
            config,
            repo_path,
            store: Arc::new(store),
            workspaces: Arc::new(workspaces),
        })
    }

    fn resolve(&self, id: &str) -> Result<TaskId> {
        self.store.resolve(id)
    }

    fn merges(&self) -> Arc<MergeCoordinator> {
        Arc::new(MergeCoordinator::new(
            self.store.clone() as Arc<dyn TaskStore>,
            Arc::clone(&self.workspaces),
            self.config.serialize_merges,
        ))
    }

    /// Spawn a scheduler on the current runtime.
    fn scheduler(
        &self,
        resume: bool,
    ) -> Result<(SchedulerHandle, mpsc::UnboundedReceiver<SchedulerEvent>)> {
        let runner = AgentRunner::from_config(&self.config, &self.repo_path)?;
        let mut config = SchedulerConfig::from(&self.config);
        config.resume_on_start = resume;
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (scheduler, handle) = Scheduler::new(
            config,
            self.store.clone() as Arc<dyn TaskStore>,
            Arc::clone(&self.workspaces),
            Arc::new(runner),
            self.merges(),
            event_tx,
        );
        tokio::spawn(async move {
            if let Err(e) = scheduler.run().await {
                llog!("Scheduler exited with error: {}", e);
            }
        });
        Ok((handle, event_rx))
    }
}

fn main() {
    let cli = Cli::parse();

    lanekeeper::log::init(cli.debug);

    if let Err(e) = run_command(cli) {
        eprintln!("error: {}", e);
        eprintln!("hint: {}", e.hint());
        std::process::exit(1);
    }
}

fn run_command(cli: Cli) -> Result<()> {
    llog!("Command: {:?}", cli.command);
    let board = match cli.command {
        Command::Init => return run_init(cli.config),
        _ => Board::open(cli.repo, cli.config)?,
    };

    match cli.command {
        Command::Add {
            title,
            description,
            pair,
            priority,
            criteria,
            parent,
        } => run_add(&board, title, description, pair, priority, criteria, parent),
        Command::List { status } => run_list(&board, status),
        Command::Show { id } => run_show(&board, &id),
        Command::Run { ids } => block_on(run_agents(&board, ids)),
        Command::Review { id, summary } => block_on(run_review(&board, &id, summary)),
        Command::Approve { id } => block_on(run_approve(&board, &id)),
        Command::Reject {
            id,
            feedback,
            backlog,
        } => block_on(run_reject(&board, &id, &feedback, backlog)),
        Command::Readiness { id } => run_readiness(&board, id),
        Command::Diff { id } => run_diff(&board, &id),
        Command::Remove { id } => run_remove(&board, &id),
        // Needs no board; returned above.
        Command::Init => Ok(()),
    }
}

fn block_on<F: std::future::Future<Output = Result<()>>>(future: F) -> Result<()> {
    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(future)
}

fn run_add(
    board: &Board,
    title: String,
    description: String,
    pair: bool,
    priority: PriorityArg,
    criteria: Vec<String>,
    parent: Option<String>,
) -> Result<()> {
    if title.trim().is_empty() {
        return Err(Error::Validation("title must not be empty".to_string()));
    }
    let mut task = Task::new(&title, &description)
        .with_type(if pair { TaskType::Pair } else { TaskType::Auto })
        .with_priority(priority.into())
        .with_criteria(criteria);
    if let Some(parent) = parent {
        task = task.with_parent(board.resolve(&parent)?);
    }
    let id = task.id;
    board.store.insert_task(task)?;
    println!("{}", id.short());
    Ok(())
}

fn run_list(board: &Board, status: Option<StatusArg>) -> Result<()> {
    let filter = match status {
        Some(status) => TaskFilter::status(status.into()),
        None => TaskFilter::all(),
    };
    let tasks = board.store.list_tasks(&filter)?;
    if tasks.is_empty() {
        println!("No tasks.");
        return Ok(());
    }
    println!(
        "{:<9} {:<12} {:<5} {:<7} {:>5}  TITLE",
        "ID", "STATUS", "TYPE", "PRIO", "ITER"
    );
    for task in tasks {
        let mut note = String::new();
        if let Some(reason) = &task.block_reason {
            note = format!("  [{}]", reason);
        } else if task.status == TaskStatus::Review {
            note = format!("  [{}]", task.merge_readiness);
        }
        println!(
            "{:<9} {:<12} {:<5} {:<7} {:>5}  {}{}",
            task.id.short(),
            task.status.to_string(),
            format!("{:?}", task.task_type).to_uppercase(),
            format!("{:?}", task.priority).to_lowercase(),
            task.iteration_count,
            truncate_string(&task.title, 50),
            note
        );
    }
    Ok(())
}

fn run_show(board: &Board, id: &str) -> Result<()> {
    let task = board.store.get_task(board.resolve(id)?)?;
    let workspace = board.workspaces.workspace_for(&task);

    println!();
    println!("  ID:          {}", task.id);
    println!("  Title:       {}", task.title);
    println!("  Status:      {}", task.status);
    println!("  Type:        {:?}", task.task_type);
    println!("  Priority:    {:?}", task.priority);
    println!(
        "  Iterations:  {} (total {})",
        task.iteration_count, task.total_iterations
    );
    println!("  Created:     {}", task.created_at.format("%Y-%m-%d %H:%M:%S UTC"));
    if let Some(started) = task.started_at {
        println!("  Started:     {}", started.format("%Y-%m-%d %H:%M:%S UTC"));
    }
    if let Some(completed) = task.completed_at {
        println!("  Completed:   {}", completed.format("%Y-%m-%d %H:%M:%S UTC"));
    }
    if task.status.has_workspace() {
        println!("  Branch:      {}", workspace.branch);
        println!("  Worktree:    {}", workspace.path.display());
    }
    if let Some(reason) = &task.block_reason {
        println!("  Blocked:     {}", reason);
    }
    if let Some(error) = &task.last_error {
        println!("  Last error:  {}", error);
    }
    if task.status == TaskStatus::Review {
        println!("  Readiness:   {}", task.merge_readiness);
    }
    if let Some(error) = &task.merge_error {
        println!("  Merge error: {}", error);
    }
    if !task.description.is_empty() {
        println!();
        println!("{}", task.description);
    }
    if !task.acceptance_criteria.is_empty() {
        println!();
        println!("Acceptance criteria:");
        for criterion in &task.acceptance_criteria {
            println!("  • {}", criterion);
        }
    }
    let notes = board.store.scratchpad(task.id)?;
    if !notes.trim().is_empty() {
        println!();
        println!("Notes:");
        for line in notes.lines() {
            println!("  {}", line);
        }
    }
    println!();
    Ok(())
}

async fn run_agents(board: &Board, ids: Vec<String>) -> Result<()> {
    let ids = if ids.is_empty() {
        let mut backlog = board
            .store
            .list_tasks(&TaskFilter::status(TaskStatus::Backlog).of_type(TaskType::Auto))?;
        backlog.sort_by_key(|t| Reverse(t.priority));
        backlog.into_iter().map(|t| t.id).collect()
    } else {
        ids.iter()
            .map(|id| board.resolve(id))
            .collect::<Result<Vec<_>>>()?
    };

    let (handle, mut events) = board.scheduler(true)?;
    for id in ids {
        match handle.start_task(id).await {
            Ok(task) => println!("started  {} {}", id.short(), task.title),
            Err(e) => println!("skipped  {} ({})", id.short(), e),
        }
    }

    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else { break };
                print_event(board, &event);
                match event {
                    SchedulerEvent::Idle => {
                        let snapshot = handle.snapshot().await?;
                        if snapshot.running.is_empty() && snapshot.queued.is_empty() {
                            break;
                        }
                    }
                    SchedulerEvent::Stopped => return Ok(()),
                    _ => {}
                }
            }
            _ = tokio::signal::ctrl_c() => {
                println!("interrupted, stopping agents...");
                break;
            }
        }
    }
    handle.shutdown().await
}

fn print_event(board: &Board, event: &SchedulerEvent) {
    let title = |id: &TaskId| {
        board
            .store
            .get_task(*id)
            .map(|t| truncate_string(&t.title, 40))
            .unwrap_or_default()
    };
    match event {
        SchedulerEvent::Admitted { task_id } => {
            println!("admitted {} {}", task_id.short(), title(task_id))
        }
        SchedulerEvent::Deferred { task_id, deferral } => match deferral {
            Deferral::Capacity => println!("waiting  {} (all agents busy)", task_id.short()),
            Deferral::Overlap { with } => println!(
                "waiting  {} (overlaps {})",
                task_id.short(),
                with.short()
            ),
        },
        SchedulerEvent::IterationFinished {
            task_id,
            iteration,
            signal,
        } => println!("iter     {} #{} -> {}", task_id.short(), iteration, signal),
        SchedulerEvent::MovedToReview {
            task_id,
            readiness,
            no_changes,
        } => println!(
            "review   {} {} [{}{}]",
            task_id.short(),
            title(task_id),
            readiness,
            if *no_changes { ", no changes" } else { "" }
        ),
        SchedulerEvent::ReturnedToBacklog { task_id, reason } => {
            println!("backlog  {} ({})", task_id.short(), reason)
        }
        SchedulerEvent::Cancelled { task_id, status } => {
            println!("stopped  {} -> {}", task_id.short(), status)
        }
        SchedulerEvent::Merged { task_id, commit } => {
            println!("merged   {} as {}", task_id.short(), &commit[..commit.len().min(8)])
        }
        SchedulerEvent::MergeConflict { task_id, files } => {
            println!("conflict {} in {}", task_id.short(), files.join(", "))
        }
        SchedulerEvent::MergeFailed { task_id, report } => {
            println!("failed   {} {}", task_id.short(), report)
        }
        SchedulerEvent::Rejected { task_id, status } => {
            println!("rejected {} -> {}", task_id.short(), status)
        }
        SchedulerEvent::Idle | SchedulerEvent::Stopped => {}
    }
}

async fn run_review(board: &Board, id: &str, summary: Option<String>) -> Result<()> {
    let id = board.resolve(id)?;
    let (handle, _events) = board.scheduler(false)?;
    let result = handle.request_review(id, summary).await;
    handle.shutdown().await?;
    let task = result?;
    println!(
        "{} in review: {} file(s) changed, {}",
        task.id.short(),
        task.diff_files.len(),
        task.merge_readiness
    );
    Ok(())
}

async fn run_approve(board: &Board, id: &str) -> Result<()> {
    let id = board.resolve(id)?;
    let (handle, _events) = board.scheduler(false)?;
    let result = handle.approve(id).await;
    handle.shutdown().await?;

    match result? {
        MergeOutcome::Merged { commit, attempts } => {
            println!(
                "Merged {} into {} as {} ({} attempt{})",
                id.short(),
                board.workspaces.base_branch(),
                &commit[..commit.len().min(8)],
                attempts,
                if attempts == 1 { "" } else { "s" }
            );
            Ok(())
        }
        MergeOutcome::Conflict(conflict) => Err(conflict.into()),
        MergeOutcome::Failed(report) => {
            println!("Merge failed [{}]: {}", report.code, report.message);
            println!("hint: {}", report.hint);
            std::process::exit(1);
        }
    }
}

async fn run_reject(board: &Board, id: &str, feedback: &str, backlog: bool) -> Result<()> {
    let id = board.resolve(id)?;
    let target = if backlog {
        TaskStatus::Backlog
    } else {
        TaskStatus::InProgress
    };
    let (handle, _events) = board.scheduler(false)?;
    let result = handle.reject(id, feedback, target).await;
    handle.shutdown().await?;
    let task = result?;
    println!("{} -> {}", task.id.short(), task.status);
    if task.status == TaskStatus::InProgress && task.is_auto() {
        println!("Run `lanekeeper run {}` to continue it.", task.id.short());
    }
    Ok(())
}

fn run_readiness(board: &Board, id: Option<String>) -> Result<()> {
    let merges = board.merges();
    let tasks = match id {
        Some(id) => vec![board.store.get_task(board.resolve(&id)?)?],
        None => board
            .store
            .list_tasks(&TaskFilter::status(TaskStatus::Review))?,
    };
    if tasks.is_empty() {
        println!("No tasks in review.");
        return Ok(());
    }
    for task in tasks {
        let report = merges.readiness_report(&task)?;
        println!(
            "{:<9} {:<8} {}",
            task.id.short(),
            report.readiness.to_string(),
            truncate_string(&task.title, 50)
        );
        for (other, files) in &report.overlaps {
            println!("    overlaps {} on {}", other.short(), files.join(", "));
        }
        if let Some(error) = &task.merge_error {
            println!("    last merge: {}", error);
        }
    }
    Ok(())
}

fn run_diff(board: &Board, id: &str) -> Result<()> {
    let task = board.store.get_task(board.resolve(id)?)?;
    let workspace = board.workspaces.workspace_for(&task);
    if !board.workspaces.exists(&workspace) {
        return Err(Error::Validation(format!(
            "task {} has no workspace ({})",
            task.id.short(),
            task.status
        )));
    }
    let diff = board.workspaces.diff(&workspace)?;
    println!(
        "{} vs {}: {} file(s), \x1b[32m+{}\x1b[0m \x1b[31m-{}\x1b[0m",
        workspace.branch,
        workspace.base_branch,
        diff.files.len(),
        diff.insertions,
        diff.deletions
    );
    for file in &diff.files {
        println!("  • {}", file);
    }
    Ok(())
}

fn run_remove(board: &Board, id: &str) -> Result<()> {
    let task = board.store.get_task(board.resolve(id)?)?;
    if !matches!(task.status, TaskStatus::Backlog | TaskStatus::Done) {
        return Err(Error::invalid_transition(task.status, "removed"));
    }
    board
        .workspaces
        .discard(&board.workspaces.workspace_for(&task))?;
    let task = board.store.remove_task(task.id)?;
    println!("Removed {} {}", task.id.short(), task.title);
    Ok(())
}

fn run_init(config_path: Option<PathBuf>) -> Result<()> {
    let path = match config_path {
        Some(path) => path,
        None => Config::config_path()?,
    };
    if path.exists() {
        println!("Config already exists at {}", path.display());
        return Ok(());
    }
    Config::default().save_to(&path)?;
    println!("Wrote {}", path.display());
    Ok(())
}

fn truncate_string(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let truncated: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", truncated)
    }
}
