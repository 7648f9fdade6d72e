//! Merge conflict handling tests.
//!
//! These tests verify the merge pipeline: the single rebase retry when the
//! base branch has moved, structured conflicts that leave the base branch
//! alone, and readiness classification of overlapping reviews.

use lanekeeper::core::task::{MergeReadiness, TaskId, TaskStatus};
use lanekeeper::orchestration::{MergeOutcome, SchedulerEvent};
use lanekeeper::MergeConflictError;

use crate::fixtures::{test_config, test_task, SchedulerHarness, WRITE_AND_COMPLETE};

/// Agent that rewrites README.md and completes.
const EDIT_README: &str = "echo \"agent version\" > README.md\necho '<complete/>'";

async fn reach_review(harness: &mut SchedulerHarness, name: &str) -> TaskId {
    let id = harness.add(test_task(name));
    harness.handle.start_task(id).await.unwrap();
    harness
        .wait_for(|e| matches!(e, SchedulerEvent::MovedToReview { task_id, .. } if *task_id == id))
        .await;
    id
}

/// Test: Base moved, no conflict
/// Given a task in review and an unrelated commit on the base branch
/// When the task is approved
/// Then the branch is rebased once and merged on the second attempt
#[tokio::test]
async fn test_non_fast_forward_rebases_once() {
    let mut harness = SchedulerHarness::new(WRITE_AND_COMPLETE, test_config(1));
    let base = harness.repo.current_branch();
    let id = reach_review(&mut harness, "feature").await;

    let moved = harness
        .repo
        .create_and_commit("unrelated.txt", "upstream\n", "Upstream change");

    let outcome = harness.handle.approve(id).await.unwrap();
    match outcome {
        MergeOutcome::Merged { attempts, .. } => assert_eq!(attempts, 2),
        other => panic!("expected merge, got {:?}", other),
    }

    let repo = harness.repo.repo();
    let tip = repo
        .find_commit(harness.repo.branch_tip(&base))
        .unwrap();
    assert_eq!(tip.parent_id(0).unwrap(), moved);
    assert_eq!(
        harness.repo.read_at(&base, "feature.txt").as_deref(),
        Some("work for feature\n")
    );
    assert_eq!(
        harness.repo.read_at(&base, "unrelated.txt").as_deref(),
        Some("upstream\n")
    );
    assert_eq!(harness.task(id).status, TaskStatus::Done);
}

/// Test: Rebase retry conflicts
/// Given a task that edits README.md and a conflicting base commit
/// When the task is approved
/// Then the outcome lists README.md, the base branch is unchanged and the
/// task stays in review with its merge marked failed
#[tokio::test]
async fn test_rebase_conflict_keeps_review() {
    let mut harness = SchedulerHarness::new(EDIT_README, test_config(1));
    let base = harness.repo.current_branch();
    let id = reach_review(&mut harness, "readme").await;

    let upstream = harness
        .repo
        .create_and_commit("README.md", "upstream version\n", "Upstream README");

    let outcome = harness.handle.approve(id).await.unwrap();
    assert_eq!(
        outcome,
        MergeOutcome::Conflict(MergeConflictError::new(id, vec!["README.md".to_string()]))
    );
    let event = harness
        .wait_for(|e| matches!(e, SchedulerEvent::MergeConflict { .. }))
        .await;
    assert_eq!(
        event,
        SchedulerEvent::MergeConflict {
            task_id: id,
            files: vec!["README.md".to_string()],
        }
    );

    assert_eq!(harness.repo.branch_tip(&base), upstream);
    assert_eq!(
        harness.repo.read_at(&base, "README.md").as_deref(),
        Some("upstream version\n")
    );

    let task = harness.task(id);
    assert_eq!(task.status, TaskStatus::Review);
    assert!(task.merge_failed);
    assert_eq!(task.merge_readiness, MergeReadiness::Blocked);
    let merge_error = task.merge_error.unwrap();
    assert!(merge_error.contains("README.md"));
    assert!(merge_error.contains(MergeConflictError::HINT));

    let workspace = harness.workspaces.workspace_for(&harness.task(id));
    assert!(workspace.path.exists(), "workspace kept for resolution");
}

/// Test: A conflicted task rejected back to work is no longer blocked
#[tokio::test]
async fn test_reject_clears_merge_failure() {
    let mut harness = SchedulerHarness::new(EDIT_README, test_config(1));
    let id = reach_review(&mut harness, "readme").await;
    harness
        .repo
        .create_and_commit("README.md", "upstream version\n", "Upstream README");
    assert!(harness.handle.approve(id).await.unwrap().is_conflict());

    let task = harness
        .handle
        .reject(id, "rebase onto the new README", TaskStatus::InProgress)
        .await
        .unwrap();
    assert!(!task.merge_failed);
    assert!(task.merge_error.is_none());
    assert_eq!(task.merge_readiness, MergeReadiness::Ready);
}

/// Test: Dirty base checkout
/// Given uncommitted edits to a tracked file in the main checkout
/// When a task is approved
/// Then the merge fails with a report and nothing is overwritten
#[tokio::test]
async fn test_dirty_base_checkout_fails_merge() {
    let mut harness = SchedulerHarness::new(WRITE_AND_COMPLETE, test_config(1));
    let base = harness.repo.current_branch();
    let id = reach_review(&mut harness, "feature").await;
    let before = harness.repo.branch_tip(&base);

    std::fs::write(harness.repo.path.join("README.md"), "local edit\n").unwrap();

    let outcome = harness.handle.approve(id).await.unwrap();
    let report = match outcome {
        MergeOutcome::Failed(report) => report,
        other => panic!("expected failure, got {:?}", other),
    };
    assert_eq!(report.code, "merge_error");
    assert!(report.message.contains("README.md"));
    assert!(!report.hint.is_empty());

    assert_eq!(harness.repo.branch_tip(&base), before);
    assert_eq!(
        std::fs::read_to_string(harness.repo.path.join("README.md")).unwrap(),
        "local edit\n"
    );
    let task = harness.task(id);
    assert_eq!(task.status, TaskStatus::Review);
    assert!(task.merge_failed);
    assert!(task.last_error.is_some());
}

/// Test: Overlapping reviews are at risk
/// Given two tasks that both change shared.txt
/// When the second reaches review
/// Then it is classified AT_RISK while a disjoint task stays READY
#[tokio::test]
async fn test_overlapping_reviews_are_at_risk() {
    let agent = r#"
case "$LANEKEEPER_TASK_TITLE" in
  solo) echo solo > solo.txt ;;
  *) echo "$LANEKEEPER_TASK_TITLE" > shared.txt ;;
esac
echo '<complete/>'"#;
    let mut harness = SchedulerHarness::new(agent, test_config(1));
    let first = reach_review(&mut harness, "first").await;
    let second = reach_review(&mut harness, "second").await;
    let solo = reach_review(&mut harness, "solo").await;

    assert_eq!(harness.task(second).merge_readiness, MergeReadiness::AtRisk);
    assert_eq!(harness.task(solo).merge_readiness, MergeReadiness::Ready);
    assert!(harness
        .seen
        .iter()
        .any(|e| matches!(e, SchedulerEvent::MovedToReview { task_id, readiness: MergeReadiness::AtRisk, .. } if *task_id == second)));

    // The first merges cleanly; the second then conflicts on shared.txt.
    assert!(harness.handle.approve(first).await.unwrap().is_merged());
    let outcome = harness.handle.approve(second).await.unwrap();
    assert!(outcome.is_conflict());
}

/// Test: Concurrent approvals of disjoint tasks both land
#[tokio::test]
async fn test_concurrent_approvals_both_land() {
    let mut harness = SchedulerHarness::new(WRITE_AND_COMPLETE, test_config(2));
    let base = harness.repo.current_branch();
    let a = reach_review(&mut harness, "alpha").await;
    let b = reach_review(&mut harness, "beta").await;

    let (ra, rb) = tokio::join!(harness.handle.approve(a), harness.handle.approve(b));
    let attempts: Vec<u8> = [ra.unwrap(), rb.unwrap()]
        .into_iter()
        .map(|outcome| match outcome {
            MergeOutcome::Merged { attempts, .. } => attempts,
            other => panic!("expected merge, got {:?}", other),
        })
        .collect();
    assert!(attempts.contains(&1));

    assert!(harness.repo.read_at(&base, "alpha.txt").is_some());
    assert!(harness.repo.read_at(&base, "beta.txt").is_some());
    assert_eq!(harness.task(a).status, TaskStatus::Done);
    assert_eq!(harness.task(b).status, TaskStatus::Done);
}

/// Test: Approving the same task twice at once
#[tokio::test]
async fn test_concurrent_approve_same_task_is_busy() {
    let mut harness = SchedulerHarness::new(WRITE_AND_COMPLETE, test_config(1));
    let id = reach_review(&mut harness, "feature").await;

    let (first, second) = tokio::join!(harness.handle.approve(id), harness.handle.approve(id));
    let results = [first, second];
    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    assert!(results
        .iter()
        .any(|r| matches!(r, Err(lanekeeper::Error::TaskBusy(t)) if *t == id)));
}
