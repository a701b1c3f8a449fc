//! Role prompt templates.
//!
//! Each template interpolates the run description, guidance, and run id,
//! with distinct wording for implement-feature and bug-hunt runs.

use crate::expansion::RunContext;
use codexflow_core::RunMode;

const ANALYSIS_FEATURE: &str = "\
You are one of several analysts preparing a feature change. Study the \
codebase in the current worktree and produce an implementation analysis: \
affected modules, risks, and a concrete approach. Work independently from \
the other analysts; a consensus pass merges the perspectives later.
";

const ANALYSIS_BUG_HUNT: &str = "\
You are one of several bug hunters. Study the codebase in the current \
worktree and report concrete defects: what breaks, where, and how to \
reproduce it. Work independently from the other hunters; a consensus pass \
merges the findings later.
";

const CONSENSUS_FEATURE: &str = "\
You are the consensus builder. Read the completed analyses for this run and \
merge them into a single implementation plan: resolve disagreements, pick \
one approach, and list the concrete steps.
";

const CONSENSUS_BUG_HUNT: &str = "\
You are the consensus builder. Read the completed bug reports for this run, \
deduplicate the findings, rank them by severity, and produce a single fix \
plan for the most important defects.
";

const SPLITTER: &str = "\
You are the planner. Split the consensus plan into the implement, test, and \
review work items for this run. Keep the implementation step self-contained \
and note anything the tester or reviewer must pay attention to.
";

const IMPLEMENTER_FEATURE: &str = "\
You are the implementer. Apply the planned feature change to the worktree. \
Follow the consensus plan, keep the change minimal, and leave the tree in a \
state where the test command passes.
";

const IMPLEMENTER_BUG_HUNT: &str = "\
You are the implementer. Fix the defects selected by the consensus plan in \
the worktree. Keep each fix minimal and leave the tree in a state where the \
test command passes.
";

const TESTER: &str = "\
You are the tester. Run the configured test command for this worktree and \
report the result.
";

const REVIEWER: &str = "\
You are the reviewer. Inspect the implemented change in the worktree against \
the consensus plan. Finish your reply with a single JSON line of the form \
{\"status\": \"ok\" | \"changes_requested\" | \"blocked\", \"summary\": \"...\"} \
summarising your verdict.
";

fn briefing_block(ctx: &RunContext) -> String {
    let mut block = format!("Run {run_id}.\n\nBriefing: {description}\n", run_id = ctx.run_id, description = ctx.description);
    if let Some(guidance) = ctx.guidance.as_deref().filter(|g| !g.trim().is_empty()) {
        block.push_str(&format!("Guidance: {guidance}\n"));
    }
    block
}

/// Prompt for one analyst (or bug hunter) perspective.
pub fn analysis_prompt(ctx: &RunContext, perspective: &str) -> String {
    let template = match ctx.mode {
        RunMode::ImplementFeature => ANALYSIS_FEATURE,
        RunMode::BugHunt => ANALYSIS_BUG_HUNT,
    };
    format!("{template}\nYou are perspective {perspective}.\n\n{}", briefing_block(ctx))
}

/// Prompt for the consensus builder.
pub fn consensus_prompt(ctx: &RunContext) -> String {
    let template = match ctx.mode {
        RunMode::ImplementFeature => CONSENSUS_FEATURE,
        RunMode::BugHunt => CONSENSUS_BUG_HUNT,
    };
    format!("{template}\n{}", briefing_block(ctx))
}

/// Prompt for the splitter.
pub fn splitter_prompt(ctx: &RunContext) -> String {
    format!("{SPLITTER}\n{}", briefing_block(ctx))
}

/// Prompt for the implementer.
pub fn implementer_prompt(ctx: &RunContext) -> String {
    let template = match ctx.mode {
        RunMode::ImplementFeature => IMPLEMENTER_FEATURE,
        RunMode::BugHunt => IMPLEMENTER_BUG_HUNT,
    };
    format!("{template}\n{}", briefing_block(ctx))
}

/// Prompt for the tester.
pub fn tester_prompt(ctx: &RunContext) -> String {
    format!("{TESTER}\n{}", briefing_block(ctx))
}

/// Prompt for the reviewer.
pub fn reviewer_prompt(ctx: &RunContext) -> String {
    format!("{REVIEWER}\n{}", briefing_block(ctx))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(mode: RunMode) -> RunContext {
        RunContext {
            run_id: "r1".to_string(),
            description: "Add pagination".to_string(),
            guidance: Some("keep it small".to_string()),
            mode,
            analyst_count: 2,
            bug_hunter_count: 2,
        }
    }

    #[test]
    fn test_prompts_interpolate_briefing() {
        let prompt = analysis_prompt(&ctx(RunMode::ImplementFeature), "A");
        assert!(prompt.contains("Run r1"));
        assert!(prompt.contains("Add pagination"));
        assert!(prompt.contains("keep it small"));
        assert!(prompt.contains("perspective A"));
    }

    #[test]
    fn test_modes_use_distinct_wording() {
        let feature = consensus_prompt(&ctx(RunMode::ImplementFeature));
        let hunt = consensus_prompt(&ctx(RunMode::BugHunt));
        assert_ne!(feature, hunt);
        assert!(hunt.contains("bug reports"));
        assert!(feature.contains("implementation plan"));
    }

    #[test]
    fn test_reviewer_prompt_requests_verdict_json() {
        let prompt = reviewer_prompt(&ctx(RunMode::ImplementFeature));
        assert!(prompt.contains("changes_requested"));
        assert!(prompt.contains("\"status\""));
    }

    #[test]
    fn test_empty_guidance_is_omitted() {
        let mut ctx = ctx(RunMode::ImplementFeature);
        ctx.guidance = Some("  ".to_string());
        let prompt = tester_prompt(&ctx);
        assert!(!prompt.contains("Guidance:"));
    }
}
