use crate::core::task::Task;

/// Inputs for one iteration's prompt.
pub struct PromptContext<'a> {
    pub task: &'a Task,
    /// 1-based iteration number within the current run.
    pub iteration: u32,
    pub max_iterations: u32,
    /// Notes carried between iterations, including reviewer feedback.
    pub scratchpad: &'a str,
    pub parent: Option<&'a Task>,
}

/// Build the per-iteration prompt for the agent.
///
/// Describes the task, the notes from earlier iterations and the signal
/// protocol the agent must finish with.
pub fn build(ctx: &PromptContext<'_>) -> String {
    let task = ctx.task;

    let criteria = if task.acceptance_criteria.is_empty() {
        String::new()
    } else {
        let list: String = task
            .acceptance_criteria
            .iter()
            .map(|c| format!("- {}", c))
            .collect::<Vec<_>>()
            .join("\n");
        format!("\n## ACCEPTANCE CRITERIA\n\n{list}\n")
    };

    let parent_section = ctx
        .parent
        .map(|p| format!("\n## PARENT TASK\n\n{} ({})\n", p.title, p.id.short()))
        .unwrap_or_default();

    let notes = ctx.scratchpad.trim();
    let notes_section = if notes.is_empty() {
        String::new()
    } else {
        format!("\n## NOTES FROM EARLIER ITERATIONS\n\n{notes}\n")
    };

    let remaining = ctx.max_iterations.saturating_sub(ctx.iteration);

    format!(
        r#"# TASK: {title}

{description}
{criteria}{parent_section}{notes_section}
## ITERATION

This is iteration {iteration} of at most {max}. {remaining} iteration(s) remain after this one.
Work in the current directory only. It is a git worktree on its own branch; commit
freely, uncommitted changes are picked up too.

## FINISHING

End your output with exactly one of these tags on its own line:

- `<continue/>` if you made progress and more work remains.
- `<complete/>` if every acceptance criterion is met and the work is ready for review.
- `<blocked reason="..."/>` if you cannot proceed without help. Say why in `reason`.

Only the last tag in your output counts."#,
        title = task.title,
        description = task.description.trim(),
        iteration = ctx.iteration,
        max = ctx.max_iterations,
    )
}
