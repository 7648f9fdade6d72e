//! Orchestration layer for Lanekeeper.
//!
//! This module drives agents through their tasks: the scheduler admits and
//! supervises runs, the runner executes one agent iteration, the signal
//! parser reads how the iteration ended, and the merge coordinator lands
//! reviewed work on the base branch.

pub mod merge;
pub mod prompt;
pub mod registry;
pub mod runner;
pub mod scheduler;
pub mod signal;

pub use merge::{MergeCoordinator, MergeOutcome, ReadinessReport};
pub use prompt::PromptContext;
pub use registry::{ActiveRun, RunRegistry};
pub use runner::{AgentRunner, IterationResult, KillReason, ProcessState};
pub use scheduler::{
    Deferral, RunInfo, Scheduler, SchedulerConfig, SchedulerEvent, SchedulerHandle,
    SchedulerSnapshot,
};
pub use signal::Signal;
