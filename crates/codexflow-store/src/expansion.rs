use crate::prompts;
use codexflow_core::{RunMode, TaskKind, TaskRecord, TaskRole, TaskStatus};
use std::collections::HashSet;

/// Briefing context workflow expansion renders tasks and prompts from.
#[derive(Debug, Clone)]
pub struct RunContext {
    /// Run identifier, also used as the epic of every created task.
    pub run_id: String,
    /// Briefing description.
    pub description: String,
    /// Optional briefing guidance.
    pub guidance: Option<String>,
    /// Pipeline mode.
    pub mode: RunMode,
    /// Number of analyst seeds in implement-feature mode.
    pub analyst_count: u32,
    /// Number of hunter seeds in bug-hunt mode.
    pub bug_hunter_count: u32,
}

impl RunContext {
    /// Number of completed analyses consensus waits for.
    pub fn expected_analysis_count(&self) -> usize {
        match self.mode {
            RunMode::ImplementFeature => self.analyst_count.max(1) as usize,
            RunMode::BugHunt => self.bug_hunter_count.max(1) as usize,
        }
    }

    /// Id of the consensus task.
    pub fn consensus_task_id(&self) -> String {
        format!("CONSENSUS-{}", self.run_id)
    }

    /// Id of the splitter task.
    pub fn split_task_id(&self) -> String {
        format!("SPLIT-{}", self.run_id)
    }

    /// Id of the implementer task.
    pub fn impl_task_id(&self) -> String {
        format!("IMPL-{}", self.run_id)
    }

    /// Id of the tester task.
    pub fn test_task_id(&self) -> String {
        format!("TEST-{}", self.run_id)
    }

    /// Id of the reviewer task.
    pub fn review_task_id(&self) -> String {
        format!("REVIEW-{}", self.run_id)
    }
}

/// File creations and status resets proposed by one expansion pass.
///
/// The planner is pure; the task store applies the plan. Applying the same
/// plan twice creates nothing new.
#[derive(Debug, Default)]
pub struct ExpansionPlan {
    /// Tasks to create (skipped when the id already exists on disk).
    pub creates: Vec<TaskRecord>,
    /// Ids of tasks to reset to `ready`, clearing approvals and claims.
    pub resets: Vec<String>,
}

impl ExpansionPlan {
    /// Whether the plan proposes no mutation at all.
    pub fn is_empty(&self) -> bool {
        self.creates.is_empty() && self.resets.is_empty()
    }
}

/// The analyst (or hunter) seed tasks a fresh run starts with.
pub fn analysis_seeds(ctx: &RunContext) -> Vec<TaskRecord> {
    let mut seeds = Vec::new();
    match ctx.mode {
        RunMode::ImplementFeature => {
            for index in 0..ctx.analyst_count.max(1) {
                let letter = perspective_letter(index);
                let role = alternate_analyst(index);
                let task = TaskRecord::new(
                    format!("ANALYSIS-{}-{letter}", ctx.run_id),
                    ctx.run_id.clone(),
                    TaskKind::Analysis,
                    role,
                    format!("Feature analysis {letter}"),
                    prompts::analysis_prompt(ctx, &letter),
                );
                seeds.push(task);
            }
        }
        RunMode::BugHunt => {
            for index in 0..ctx.bug_hunter_count.max(1) {
                let n = index + 1;
                let role = alternate_analyst(index);
                let task = TaskRecord::new(
                    format!("ANALYSIS-{}-H{n}", ctx.run_id),
                    ctx.run_id.clone(),
                    TaskKind::Analysis,
                    role,
                    format!("Bug hunt {n}"),
                    prompts::analysis_prompt(ctx, &format!("H{n}")),
                );
                seeds.push(task);
            }
        }
    }
    seeds
}

fn perspective_letter(index: u32) -> String {
    let letter = (b'A' + (index % 26) as u8) as char;
    letter.to_string()
}

fn alternate_analyst(index: u32) -> TaskRole {
    if index % 2 == 0 {
        TaskRole::AnalystA
    } else {
        TaskRole::AnalystB
    }
}

/// Apply the expansion rules to the current task list.
///
/// Rules, in order, each idempotent:
/// 1. Once the expected number of analyses is `done`, create the consensus
///    task depending on them.
/// 2. Once consensus is `done`, create the splitter task (stored under
///    `analysis/`).
/// 3. Once the splitter is `done`, create implement, test, and review tasks
///    chained by dependencies; review requires one approval.
///
/// Additionally, any review in `changes_requested` resets itself and its
/// dependencies back to `ready` (skipping tasks already `ready` or
/// `in_progress`).
pub fn plan_expansion(ctx: &RunContext, tasks: &[TaskRecord]) -> ExpansionPlan {
    let mut plan = ExpansionPlan::default();
    let existing: HashSet<&str> = tasks.iter().map(|t| t.id.as_str()).collect();
    let status_of = |id: &str| tasks.iter().find(|t| t.id == id).map(|t| t.status);

    // Rule 1: consensus over completed analyses.
    let consensus_id = ctx.consensus_task_id();
    let mut done_analyses: Vec<&TaskRecord> = tasks
        .iter()
        .filter(|t| {
            t.kind == TaskKind::Analysis
                && t.role != TaskRole::Splitter
                && t.status == TaskStatus::Done
        })
        .collect();
    done_analyses.sort_by(|a, b| a.id.cmp(&b.id));
    if done_analyses.len() >= ctx.expected_analysis_count() && !existing.contains(consensus_id.as_str())
    {
        let deps: Vec<String> = done_analyses.iter().map(|t| t.id.clone()).collect();
        plan.creates.push(
            TaskRecord::new(
                consensus_id.clone(),
                ctx.run_id.clone(),
                TaskKind::Consensus,
                TaskRole::ConsensusBuilder,
                "Build consensus plan",
                prompts::consensus_prompt(ctx),
            )
            .with_depends_on(deps),
        );
    }

    // Rule 2: splitter after consensus.
    let split_id = ctx.split_task_id();
    if status_of(&consensus_id) == Some(TaskStatus::Done) && !existing.contains(split_id.as_str()) {
        plan.creates.push(
            TaskRecord::new(
                split_id.clone(),
                ctx.run_id.clone(),
                TaskKind::Analysis,
                TaskRole::Splitter,
                "Split plan into work items",
                prompts::splitter_prompt(ctx),
            )
            .with_depends_on(vec![consensus_id.clone()]),
        );
    }

    // Rule 3: implement / test / review after the splitter.
    if status_of(&split_id) == Some(TaskStatus::Done) {
        let impl_id = ctx.impl_task_id();
        let test_id = ctx.test_task_id();
        let review_id = ctx.review_task_id();
        if !existing.contains(impl_id.as_str()) {
            plan.creates.push(
                TaskRecord::new(
                    impl_id.clone(),
                    ctx.run_id.clone(),
                    TaskKind::Impl,
                    TaskRole::Implementer,
                    "Implement the change",
                    prompts::implementer_prompt(ctx),
                )
                .with_depends_on(vec![split_id.clone()]),
            );
        }
        if !existing.contains(test_id.as_str()) {
            plan.creates.push(
                TaskRecord::new(
                    test_id.clone(),
                    ctx.run_id.clone(),
                    TaskKind::Test,
                    TaskRole::Tester,
                    "Run the test suite",
                    prompts::tester_prompt(ctx),
                )
                .with_depends_on(vec![impl_id.clone()]),
            );
        }
        if !existing.contains(review_id.as_str()) {
            plan.creates.push(
                TaskRecord::new(
                    review_id,
                    ctx.run_id.clone(),
                    TaskKind::Review,
                    TaskRole::Reviewer,
                    "Review the change",
                    prompts::reviewer_prompt(ctx),
                )
                .with_depends_on(vec![impl_id, test_id])
                .with_approvals_required(1),
            );
        }
    }

    // Review feedback: re-open the chain behind a changes_requested review.
    for review in tasks
        .iter()
        .filter(|t| t.kind == TaskKind::Review && t.status == TaskStatus::ChangesRequested)
    {
        for target_id in review.depends_on.iter().chain(std::iter::once(&review.id)) {
            match status_of(target_id) {
                Some(TaskStatus::Ready) | Some(TaskStatus::InProgress) | None => {}
                Some(_) => plan.resets.push(target_id.clone()),
            }
        }
    }

    plan
}
