//! Core domain models for the task board.

pub mod task;

pub use task::{MergeReadiness, Priority, Task, TaskFilter, TaskId, TaskStatus, TaskType, TaskUpdate};
