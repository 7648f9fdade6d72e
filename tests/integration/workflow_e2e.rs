//! End-to-end task lifecycle tests.
//!
//! A task moves BACKLOG -> IN_PROGRESS -> REVIEW -> DONE with a fake agent
//! doing the work in the task's worktree.

use lanekeeper::core::task::{MergeReadiness, TaskStatus, TaskType};
use lanekeeper::orchestration::{MergeOutcome, SchedulerEvent, Signal};
use lanekeeper::Error;

use crate::fixtures::{test_config, test_task, SchedulerHarness, WRITE_AND_COMPLETE};

/// Test: AUTO task from backlog to merged
/// Given a task whose agent writes a file and completes
/// When the task is started and then approved
/// Then the change lands on the base branch and the workspace is gone
#[tokio::test]
async fn test_auto_task_full_lifecycle() {
    let mut harness = SchedulerHarness::new(WRITE_AND_COMPLETE, test_config(2));
    let base = harness.repo.current_branch();
    let id = harness.add(test_task("feature"));

    let started = harness.handle.start_task(id).await.unwrap();
    assert_eq!(started.status, TaskStatus::InProgress);

    let event = harness
        .wait_for(|e| matches!(e, SchedulerEvent::MovedToReview { .. }))
        .await;
    assert_eq!(
        event,
        SchedulerEvent::MovedToReview {
            task_id: id,
            readiness: MergeReadiness::Ready,
            no_changes: false,
        }
    );
    let task = harness.task(id);
    assert_eq!(task.status, TaskStatus::Review);
    assert_eq!(task.iteration_count, 1);
    assert_eq!(task.diff_files, vec!["feature.txt".to_string()]);
    let workspace = harness.workspaces.workspace_for(&task);
    assert!(workspace.path.exists());

    let outcome = harness.handle.approve(id).await.unwrap();
    assert!(matches!(outcome, MergeOutcome::Merged { attempts: 1, .. }));

    let task = harness.task(id);
    assert_eq!(task.status, TaskStatus::Done);
    assert!(task.completed_at.is_some());
    assert!(!task.merge_failed);
    assert_eq!(
        harness.repo.read_at(&base, "feature.txt").as_deref(),
        Some("work for feature\n")
    );
    assert!(!workspace.path.exists());
    assert!(!harness.repo.branch_exists(&workspace.branch));
    // Main checkout follows the base branch.
    assert!(harness.repo.path.join("feature.txt").exists());
}

/// Test: Continue keeps the slot until Complete
/// Given an agent that continues twice before completing
/// When the task runs
/// Then three iterations run back to back and the task reaches review
#[tokio::test]
async fn test_continue_then_complete() {
    let agent = r#"
echo "step $LANEKEEPER_ITERATION" >> progress.txt
if [ "$LANEKEEPER_ITERATION" -lt 3 ]; then
  echo '<continue/>'
else
  echo '<complete/>'
fi"#;
    let mut harness = SchedulerHarness::new(agent, test_config(1));
    let id = harness.add(test_task("iterative"));
    harness.handle.start_task(id).await.unwrap();

    harness
        .wait_for(|e| matches!(e, SchedulerEvent::MovedToReview { .. }))
        .await;

    let iterations: Vec<(u32, Signal)> = harness
        .seen
        .iter()
        .filter_map(|e| match e {
            SchedulerEvent::IterationFinished {
                iteration, signal, ..
            } => Some((*iteration, signal.clone())),
            _ => None,
        })
        .collect();
    assert_eq!(
        iterations,
        vec![
            (1, Signal::Continue),
            (2, Signal::Continue),
            (3, Signal::Complete)
        ]
    );
    let admitted = harness
        .seen
        .iter()
        .filter(|e| matches!(e, SchedulerEvent::Admitted { .. }))
        .count();
    assert_eq!(admitted, 1, "slot is kept across Continue iterations");

    let task = harness.task(id);
    assert_eq!(task.iteration_count, 3);
    assert_eq!(task.total_iterations, 3);
    let workspace = harness.workspaces.workspace_for(&task);
    let progress = std::fs::read_to_string(workspace.path.join("progress.txt")).unwrap();
    assert_eq!(progress, "step 1\nstep 2\nstep 3\n");
}

/// Test: Iteration budget exhausted
/// Given an agent that always continues and max_iterations = 3
/// When the task runs
/// Then it returns to the backlog with max_iterations_exceeded
#[tokio::test]
async fn test_max_iterations_exceeded() {
    let mut config = test_config(1);
    config.max_iterations = 3;
    let mut harness = SchedulerHarness::new("echo '<continue/>'", config);
    let id = harness.add(test_task("endless"));
    harness.handle.start_task(id).await.unwrap();

    let event = harness
        .wait_for(|e| matches!(e, SchedulerEvent::ReturnedToBacklog { .. }))
        .await;
    assert_eq!(
        event,
        SchedulerEvent::ReturnedToBacklog {
            task_id: id,
            reason: "max_iterations_exceeded".to_string(),
        }
    );
    let task = harness.task(id);
    assert_eq!(task.status, TaskStatus::Backlog);
    assert_eq!(task.iteration_count, 3);
    assert_eq!(task.block_reason.as_deref(), Some("max_iterations_exceeded"));

    // A fresh start resets the per-run counter.
    let restarted = harness.handle.start_task(id).await.unwrap();
    assert_eq!(restarted.iteration_count, 0);
    assert!(restarted.block_reason.is_none());
}

/// Test: Reviewer feedback reaches the next iteration
/// Given a task in review
/// When it is rejected back to work with feedback
/// Then the next prompt carries the feedback and the task returns to review
#[tokio::test]
async fn test_reject_with_feedback_reaches_next_iteration() {
    let agent = "printf '%s\\n' \"$1\" > last_prompt.txt\necho '<complete/>'";
    let mut harness = SchedulerHarness::new(agent, test_config(1));
    let id = harness.add(test_task("styled"));
    harness.handle.start_task(id).await.unwrap();
    harness
        .wait_for(|e| matches!(e, SchedulerEvent::MovedToReview { .. }))
        .await;

    let rejected = harness
        .handle
        .reject(id, "use snake_case names", TaskStatus::InProgress)
        .await
        .unwrap();
    assert_eq!(rejected.status, TaskStatus::InProgress);
    assert_eq!(rejected.iteration_count, 0);

    harness
        .wait_for(|e| matches!(e, SchedulerEvent::MovedToReview { .. }))
        .await;
    let task = harness.task(id);
    assert_eq!(task.status, TaskStatus::Review);
    assert_eq!(task.iteration_count, 1);
    assert_eq!(task.total_iterations, 2);

    let workspace = harness.workspaces.workspace_for(&task);
    let prompt = std::fs::read_to_string(workspace.path.join("last_prompt.txt")).unwrap();
    assert!(prompt.contains("Reviewer feedback:"));
    assert!(prompt.contains("use snake_case names"));
}

/// Test: Reject to backlog discards the workspace
#[tokio::test]
async fn test_reject_to_backlog_discards_workspace() {
    let mut harness = SchedulerHarness::new(WRITE_AND_COMPLETE, test_config(1));
    let id = harness.add(test_task("unwanted"));
    harness.handle.start_task(id).await.unwrap();
    harness
        .wait_for(|e| matches!(e, SchedulerEvent::MovedToReview { .. }))
        .await;
    let workspace = harness.workspaces.workspace_for(&harness.task(id));

    let task = harness
        .handle
        .reject(id, "not needed", TaskStatus::Backlog)
        .await
        .unwrap();
    assert_eq!(task.status, TaskStatus::Backlog);
    assert!(task.diff_files.is_empty());
    assert!(!workspace.path.exists());
    assert!(!harness.repo.branch_exists(&workspace.branch));

    harness
        .wait_for(|e| matches!(e, SchedulerEvent::Rejected { .. }))
        .await;
    let snapshot = harness.handle.snapshot().await.unwrap();
    assert!(snapshot.queued.is_empty());
}

/// Test: PAIR task
/// Given a human-driven task
/// When it is started, edited by hand and sent to review
/// Then no agent runs and approval merges the manual change
#[tokio::test]
async fn test_pair_task_review_and_approve() {
    let mut harness = SchedulerHarness::new("exit 1", test_config(1));
    let base = harness.repo.current_branch();
    let id = harness.add(test_task("pairing").with_type(TaskType::Pair));

    let task = harness.handle.start_task(id).await.unwrap();
    assert_eq!(task.status, TaskStatus::InProgress);
    assert!(task.session_active);
    let snapshot = harness.handle.snapshot().await.unwrap();
    assert!(snapshot.running.is_empty());
    assert!(snapshot.queued.is_empty());

    let workspace = harness.workspaces.workspace_for(&task);
    std::fs::write(workspace.path.join("notes.md"), "paired\n").unwrap();

    let task = harness
        .handle
        .request_review(id, Some("wrote notes".to_string()))
        .await
        .unwrap();
    assert_eq!(task.status, TaskStatus::Review);
    assert!(!task.session_active);
    assert_eq!(task.diff_files, vec!["notes.md".to_string()]);
    assert_eq!(task.review_summary.as_deref(), Some("wrote notes"));

    let outcome = harness.handle.approve(id).await.unwrap();
    assert!(outcome.is_merged());
    assert_eq!(harness.repo.read_at(&base, "notes.md").as_deref(), Some("paired\n"));
    assert!(!harness
        .seen
        .iter()
        .any(|e| matches!(e, SchedulerEvent::Admitted { .. })));
}

/// Test: Complete with an empty diff is flagged
#[tokio::test]
async fn test_complete_without_changes_sets_no_changes() {
    let mut harness = SchedulerHarness::new("echo '<complete/>'", test_config(1));
    let id = harness.add(test_task("noop"));
    harness.handle.start_task(id).await.unwrap();

    let event = harness
        .wait_for(|e| matches!(e, SchedulerEvent::MovedToReview { .. }))
        .await;
    assert!(matches!(
        event,
        SchedulerEvent::MovedToReview {
            no_changes: true,
            ..
        }
    ));
    let task = harness.task(id);
    assert!(task.no_changes);
    assert!(task.diff_files.is_empty());
}

/// Test: Transitions that are not allowed are refused
#[tokio::test]
async fn test_invalid_commands_are_refused() {
    let harness = SchedulerHarness::new(WRITE_AND_COMPLETE, test_config(1));
    let id = harness.add(test_task("idle"));

    assert!(matches!(
        harness.handle.approve(id).await,
        Err(Error::InvalidTransition { .. })
    ));
    assert!(matches!(
        harness.handle.request_review(id, None).await,
        Err(Error::InvalidTransition { .. })
    ));
    assert!(matches!(
        harness.handle.stop_task(id).await,
        Err(Error::InvalidTransition { .. })
    ));
    assert!(matches!(
        harness
            .handle
            .reject(id, "", TaskStatus::InProgress)
            .await,
        Err(Error::InvalidTransition { .. })
    ));
    assert!(matches!(
        harness.handle.start_task(lanekeeper::TaskId::new()).await,
        Err(Error::TaskNotFound(_))
    ));
    assert_eq!(harness.task(id).status, TaskStatus::Backlog);
}
