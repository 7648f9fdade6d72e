//! Task Store port and the JSON-backed in-memory adapter.
//!
//! The scheduler and merge coordinator own task mutation; everything they
//! change goes through [`TaskStore::update_task`] as a single atomic patch.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::core::task::{Task, TaskFilter, TaskId, TaskUpdate};
use crate::{llog_debug, Error, Result};

const BOARD_VERSION: u32 = 1;

pub trait TaskStore: Send + Sync {
    fn get_task(&self, id: TaskId) -> Result<Task>;

    /// Apply `update` atomically and return the updated task.
    fn update_task(&self, id: TaskId, update: TaskUpdate) -> Result<Task>;

    /// Tasks matching `filter`, oldest first.
    fn list_tasks(&self, filter: &TaskFilter) -> Result<Vec<Task>>;

    fn append_scratchpad(&self, id: TaskId, text: &str) -> Result<()>;

    fn scratchpad(&self, id: TaskId) -> Result<String>;
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Board {
    version: u32,
    tasks: Vec<Task>,
    #[serde(default)]
    scratchpads: HashMap<TaskId, String>,
}

/// In-memory task store, optionally persisted to a JSON board file on every
/// mutation.
pub struct MemoryTaskStore {
    board: Mutex<Board>,
    path: Option<PathBuf>,
}

impl Default for MemoryTaskStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryTaskStore {
    /// A store that never touches disk.
    pub fn new() -> Self {
        Self {
            board: Mutex::new(Board {
                version: BOARD_VERSION,
                ..Default::default()
            }),
            path: None,
        }
    }

    /// Load the board at `path`, or start empty if the file does not exist.
    pub fn open(path: &Path) -> Result<Self> {
        llog_debug!("MemoryTaskStore::open path={}", path.display());
        let board = if path.exists() {
            let contents = fs::read_to_string(path)?;
            let board: Board = serde_json::from_str(&contents)?;
            llog_debug!("Board loaded: {} tasks", board.tasks.len());
            board
        } else {
            llog_debug!("Board file not found, starting empty");
            Board {
                version: BOARD_VERSION,
                ..Default::default()
            }
        };
        Ok(Self {
            board: Mutex::new(board),
            path: Some(path.to_path_buf()),
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn insert_task(&self, task: Task) -> Result<()> {
        self.mutate(|board| {
            if board.tasks.iter().any(|t| t.id == task.id) {
                return Err(Error::Validation(format!("task {} already exists", task.id)));
            }
            llog_debug!("insert_task id={} title={}", task.id.short(), task.title);
            board.tasks.push(task);
            Ok(())
        })
    }

    pub fn remove_task(&self, id: TaskId) -> Result<Task> {
        self.mutate(|board| {
            let idx = board
                .tasks
                .iter()
                .position(|t| t.id == id)
                .ok_or(Error::TaskNotFound(id))?;
            board.scratchpads.remove(&id);
            Ok(board.tasks.remove(idx))
        })
    }

    /// Resolve a full id or a unique id prefix (as shown by `TaskId::short`).
    pub fn resolve(&self, prefix: &str) -> Result<TaskId> {
        let board = self.board.lock();
        let matches: Vec<TaskId> = board
            .tasks
            .iter()
            .filter(|t| t.id.to_string().starts_with(prefix))
            .map(|t| t.id)
            .collect();
        match matches.as_slice() {
            [id] => Ok(*id),
            [] => Err(Error::Validation(format!("no task matches '{}'", prefix))),
            _ => Err(Error::Validation(format!(
                "'{}' is ambiguous ({} tasks)",
                prefix,
                matches.len()
            ))),
        }
    }

    /// Apply `change` to a copy of the board and keep it only once it is on
    /// disk, so memory never runs ahead of the board file.
    fn mutate<T>(&self, change: impl FnOnce(&mut Board) -> Result<T>) -> Result<T> {
        let mut board = self.board.lock();
        let mut next = board.clone();
        let out = change(&mut next)?;
        self.persist(&next)?;
        *board = next;
        Ok(out)
    }

    fn persist(&self, board: &Board) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            if !parent.exists() {
                fs::create_dir_all(parent)?;
            }
        }
        let temp_path = path.with_extension("json.tmp");
        fs::write(&temp_path, serde_json::to_string_pretty(board)?)?;
        fs::rename(&temp_path, path)?;
        Ok(())
    }
}

impl TaskStore for MemoryTaskStore {
    fn get_task(&self, id: TaskId) -> Result<Task> {
        self.board
            .lock()
            .tasks
            .iter()
            .find(|t| t.id == id)
            .cloned()
            .ok_or(Error::TaskNotFound(id))
    }

    fn update_task(&self, id: TaskId, update: TaskUpdate) -> Result<Task> {
        self.mutate(|board| {
            let task = board
                .tasks
                .iter_mut()
                .find(|t| t.id == id)
                .ok_or(Error::TaskNotFound(id))?;
            update.apply(task);
            Ok(task.clone())
        })
    }

    fn list_tasks(&self, filter: &TaskFilter) -> Result<Vec<Task>> {
        let board = self.board.lock();
        let mut tasks: Vec<Task> = board
            .tasks
            .iter()
            .filter(|t| filter.matches(t))
            .cloned()
            .collect();
        tasks.sort_by_key(|t| t.created_at);
        Ok(tasks)
    }

    fn append_scratchpad(&self, id: TaskId, text: &str) -> Result<()> {
        self.mutate(|board| {
            if !board.tasks.iter().any(|t| t.id == id) {
                return Err(Error::TaskNotFound(id));
            }
            let pad = board.scratchpads.entry(id).or_default();
            if !pad.is_empty() && !pad.ends_with('\n') {
                pad.push('\n');
            }
            pad.push_str(text);
            Ok(())
        })
    }

    fn scratchpad(&self, id: TaskId) -> Result<String> {
        let board = self.board.lock();
        if !board.tasks.iter().any(|t| t.id == id) {
            return Err(Error::TaskNotFound(id));
        }
        Ok(board.scratchpads.get(&id).cloned().unwrap_or_default())
    }
}
