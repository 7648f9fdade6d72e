pub mod config;
pub mod core;
pub mod error;
pub mod git;
pub mod log;
pub mod store;
pub mod util;
pub mod workspace;

// Agent scheduling and merge pipeline
pub mod orchestration;

pub use config::Config;
pub use crate::core::task::{MergeReadiness, Priority, Task, TaskFilter, TaskId, TaskStatus, TaskType, TaskUpdate};
pub use error::{AgentProcessError, Error, FailureReport, MergeConflictError, Result, WorkspaceError};
pub use orchestration::{
    MergeCoordinator, MergeOutcome, Scheduler, SchedulerConfig, SchedulerEvent, SchedulerHandle,
    Signal,
};
pub use store::{MemoryTaskStore, TaskStore};
pub use workspace::{Workspace, WorkspaceManager};
