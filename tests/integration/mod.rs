//! Integration test suite for Lanekeeper.
//!
//! These tests drive a real scheduler against temporary git repositories,
//! with shell scripts standing in for coding agents. They verify that the
//! state machine, the workspaces and the merge pipeline work together.
//!
//! # Test Categories
//!
//! - `workflow_e2e`: A task from backlog to merged
//! - `parallel_agents`: Admission, capacity and footprint overlap
//! - `conflict_resolution`: Merge retries, conflicts and readiness
//! - `recovery`: Crashes, timeouts, cancellation and restart
//!
//! # CI Compatibility
//!
//! No agent binary or network access is needed. The suites need a Unix
//! shell for the fake agents.

#![cfg(unix)]

mod fixtures;

mod conflict_resolution;
mod recovery;
mod workflow_e2e;
