//! Failure and recovery tests.
//!
//! These tests verify how the scheduler handles agents that crash, hang or
//! are stopped, and that a restart resumes interrupted work.

use std::time::Duration;

use lanekeeper::core::task::{Task, TaskStatus, TaskUpdate};
use lanekeeper::orchestration::SchedulerEvent;
use lanekeeper::store::{MemoryTaskStore, TaskStore};

use crate::fixtures::{test_config, test_task, SchedulerHarness, WRITE_AND_COMPLETE};

/// Test: Agent killed externally
/// Given an agent that is killed mid-iteration without emitting a signal
/// When the iteration ends
/// Then the task returns to the backlog as agent_terminated_unexpectedly
#[tokio::test]
async fn test_killed_agent_returns_to_backlog() {
    let mut harness = SchedulerHarness::new("echo 'working...'\nkill -9 $$", test_config(1));
    let id = harness.add(test_task("crashy"));
    harness.handle.start_task(id).await.unwrap();

    let event = harness
        .wait_for(|e| matches!(e, SchedulerEvent::ReturnedToBacklog { .. }))
        .await;
    assert_eq!(
        event,
        SchedulerEvent::ReturnedToBacklog {
            task_id: id,
            reason: "agent_terminated_unexpectedly".to_string(),
        }
    );
    let task = harness.task(id);
    assert_eq!(task.status, TaskStatus::Backlog);
    assert_eq!(
        task.block_reason.as_deref(),
        Some("agent_terminated_unexpectedly")
    );
    // Worktree removed, branch kept for inspection.
    let workspace = harness.workspaces.workspace_for(&task);
    assert!(!workspace.path.exists());
    assert!(harness.repo.branch_exists(&workspace.branch));
}

/// Test: Stop restores the pre-iteration status
/// Given a task started from the backlog with a long-running agent
/// When stop_task is called mid-iteration
/// Then the workspace is kept, the task is back in BACKLOG and the
/// iteration count is unchanged
#[tokio::test]
async fn test_stop_task_restores_status() {
    let mut harness = SchedulerHarness::new("exec sleep 30", test_config(1));
    let id = harness.add(test_task("long"));
    harness.handle.start_task(id).await.unwrap();
    harness
        .wait_for(|e| matches!(e, SchedulerEvent::Admitted { .. }))
        .await;

    let stopped = tokio::time::timeout(Duration::from_secs(10), harness.handle.stop_task(id))
        .await
        .expect("stop did not finish")
        .unwrap();
    assert_eq!(stopped.status, TaskStatus::Backlog);
    assert_eq!(stopped.block_reason.as_deref(), Some("cancelled"));
    assert_eq!(stopped.iteration_count, 0);
    assert_eq!(stopped.total_iterations, 0);

    let workspace = harness.workspaces.workspace_for(&stopped);
    assert!(workspace.path.exists());

    let event = harness
        .wait_for(|e| matches!(e, SchedulerEvent::Cancelled { .. }))
        .await;
    assert_eq!(
        event,
        SchedulerEvent::Cancelled {
            task_id: id,
            status: TaskStatus::Backlog,
        }
    );
    assert!(harness.handle.snapshot().await.unwrap().running.is_empty());
    assert!(!harness
        .seen
        .iter()
        .any(|e| matches!(e, SchedulerEvent::IterationFinished { .. })));
}

/// Test: Stopping a resumed task keeps it IN_PROGRESS
/// Given an AUTO task left IN_PROGRESS on the board
/// When the scheduler starts it is resumed without a start command
/// And stopping it leaves it IN_PROGRESS with its iteration count
#[tokio::test]
async fn test_stop_resumed_task_stays_in_progress() {
    let mut harness = SchedulerHarness::new("exec sleep 30", test_config(1));
    let mut task = test_task("resumed");
    task.status = TaskStatus::InProgress;
    task.iteration_count = 2;
    // Inserted before the scheduler's first poll, so startup sees it.
    let id = harness.add(task);

    harness
        .wait_for(|e| matches!(e, SchedulerEvent::Admitted { .. }))
        .await;

    let stopped = harness.handle.stop_task(id).await.unwrap();
    assert_eq!(stopped.status, TaskStatus::InProgress);
    assert_eq!(stopped.iteration_count, 2);
}

/// Test: Stopping a queued task takes it off the queue
#[tokio::test]
async fn test_stop_queued_task() {
    let mut harness = SchedulerHarness::new("exec sleep 30", test_config(1));
    let running = harness.add(test_task("running"));
    let waiting = harness.add(test_task("waiting"));
    harness.handle.start_task(running).await.unwrap();
    harness.handle.start_task(waiting).await.unwrap();
    harness
        .wait_for(|e| matches!(e, SchedulerEvent::Deferred { task_id, .. } if *task_id == waiting))
        .await;

    let stopped = harness.handle.stop_task(waiting).await.unwrap();
    assert_eq!(stopped.status, TaskStatus::Backlog);
    let snapshot = harness.handle.snapshot().await.unwrap();
    assert!(snapshot.queued.is_empty());
    assert!(snapshot.is_running(running));

    harness.handle.shutdown().await.unwrap();
}

/// Test: Timeout blocks the task
#[tokio::test]
async fn test_timeout_blocks_task() {
    let mut config = test_config(1);
    config.iteration_timeout = Duration::from_millis(500);
    let mut harness = SchedulerHarness::new("exec sleep 30", config);
    let id = harness.add(test_task("hangs"));
    harness.handle.start_task(id).await.unwrap();

    let event = harness
        .wait_for(|e| matches!(e, SchedulerEvent::ReturnedToBacklog { .. }))
        .await;
    assert_eq!(
        event,
        SchedulerEvent::ReturnedToBacklog {
            task_id: id,
            reason: "timeout".to_string(),
        }
    );
    assert_eq!(harness.task(id).iteration_count, 1);
}

/// Test: A failing agent is retried once, then parked
/// Given an agent binary that disappears after the task is queued
/// When the iteration cannot be spawned twice in a row
/// Then the task returns to the backlog with the error recorded
#[tokio::test]
async fn test_spawn_failure_retries_once() {
    let mut harness = SchedulerHarness::new(WRITE_AND_COMPLETE, test_config(1));
    std::fs::remove_file(&harness.agent.path).unwrap();
    let id = harness.add(test_task("unlucky"));
    harness.handle.start_task(id).await.unwrap();

    let event = harness
        .wait_for(|e| matches!(e, SchedulerEvent::ReturnedToBacklog { .. }))
        .await;
    assert_eq!(
        event,
        SchedulerEvent::ReturnedToBacklog {
            task_id: id,
            reason: "agent_process_error".to_string(),
        }
    );
    let admitted = harness
        .seen
        .iter()
        .filter(|e| matches!(e, SchedulerEvent::Admitted { .. }))
        .count();
    assert_eq!(admitted, 1, "the retry reuses the slot");

    let task = harness.task(id);
    assert_eq!(task.status, TaskStatus::Backlog);
    assert_eq!(task.iteration_count, 0);
    assert!(task.last_error.unwrap().contains("not found"));
}

/// Test: Shutdown persists progress and a restart resumes it
/// Given a task interrupted by shutdown mid-iteration
/// When a new scheduler starts over the same board
/// Then the task is picked up again and finishes
#[tokio::test]
async fn test_shutdown_persists_and_resumes() {
    let agent = "if [ \"$LANEKEEPER_ITERATION\" -lt 2 ]; then echo '<continue/>'; else exec sleep 30; fi";
    let mut harness = SchedulerHarness::new(agent, test_config(1));
    let id = harness.add(test_task("interrupted"));
    harness.handle.start_task(id).await.unwrap();
    harness
        .wait_for(|e| {
            matches!(
                e,
                SchedulerEvent::IterationFinished { iteration: 1, .. }
            )
        })
        .await;

    harness.handle.shutdown().await.unwrap();
    harness
        .wait_for(|e| matches!(e, SchedulerEvent::Stopped))
        .await;
    assert!(harness.handle.snapshot().await.is_err());

    let board_path = harness.board_dir.path().join("board.json");
    let persisted = MemoryTaskStore::open(&board_path).unwrap();
    let task: Task = persisted.get_task(id).unwrap();
    assert_eq!(task.status, TaskStatus::InProgress);
    assert_eq!(task.iteration_count, 1);

    let mut harness = harness.restart(WRITE_AND_COMPLETE).await;
    harness
        .wait_for(|e| matches!(e, SchedulerEvent::MovedToReview { task_id, .. } if *task_id == id))
        .await;
    let task = harness.task(id);
    assert_eq!(task.status, TaskStatus::Review);
    assert_eq!(task.iteration_count, 2);
}

/// Test: Restart resumes only AUTO tasks
#[tokio::test]
async fn test_restart_ignores_pair_sessions() {
    let harness = SchedulerHarness::new(WRITE_AND_COMPLETE, test_config(1));
    let pair = harness.add(
        test_task("pairing").with_type(lanekeeper::core::task::TaskType::Pair),
    );
    harness
        .store
        .update_task(pair, TaskUpdate::new().status(TaskStatus::InProgress))
        .unwrap();

    let harness = harness.restart(WRITE_AND_COMPLETE).await;
    let snapshot = harness.handle.snapshot().await.unwrap();
    assert!(snapshot.running.is_empty());
    assert!(snapshot.queued.is_empty());
    assert_eq!(harness.task(pair).status, TaskStatus::InProgress);
}
