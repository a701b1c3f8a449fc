use crate::task::TaskRecord;
use crate::worker::{RoleWorkerConfig, WorkerStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Pipeline mode a run was started in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    /// Analyse, plan, implement, test, and review a feature briefing.
    #[default]
    ImplementFeature,
    /// Hunt for bugs instead of building a feature.
    BugHunt,
}

/// Lifecycle status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// The pipeline is active.
    Running,
    /// An explicit stop arrived.
    Stopped,
    /// Every task reached a terminal state.
    Completed,
}

/// Summary of one run, as returned by the command surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    /// Run identifier (random UUID).
    pub run_id: String,
    /// The worktree this run belongs to.
    pub worktree_id: String,
    /// Briefing description.
    pub description: String,
    /// Optional briefing guidance.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guidance: Option<String>,
    /// Pipeline mode.
    pub mode: RunMode,
    /// Lifecycle status.
    pub status: RunStatus,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Last mutation timestamp.
    pub updated_at: DateTime<Utc>,
    /// Absolute run root directory.
    pub run_root: PathBuf,
    /// Absolute tasks root directory.
    pub tasks_root: PathBuf,
    /// Absolute conversations root directory.
    pub conversation_root: PathBuf,
}

/// Deep-copied view of a run handed to external shells.
#[derive(Debug, Clone, Serialize)]
pub struct RunSnapshot {
    /// Run summary.
    pub run: RunSummary,
    /// Most recently loaded task records.
    pub tasks: Vec<TaskRecord>,
    /// Live worker statuses.
    pub workers: Vec<WorkerStatus>,
    /// Worker id currently holding the implementer lock, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub implementer_lock_holder: Option<String>,
    /// Desired worker counts and model priorities per role.
    pub worker_configurations: Vec<RoleWorkerConfig>,
}

/// Directory layout of one run under its worktree.
///
/// ```text
/// <worktree>/codex-runs/<runId>/
///   tasks/<bucket>/*.json
///   conversations/<taskId>.md
///   artifacts/...
///   locks/implementer.lock
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunPaths {
    /// Absolute worktree path.
    pub worktree: PathBuf,
    /// `<worktree>/codex-runs/<runId>`.
    pub run_root: PathBuf,
    /// `<runRoot>/tasks`.
    pub tasks_root: PathBuf,
    /// `<runRoot>/conversations`.
    pub conversation_root: PathBuf,
    /// `<runRoot>/artifacts`.
    pub artifacts_root: PathBuf,
    /// `<runRoot>/locks`.
    pub locks_root: PathBuf,
}

/// Name of the per-worktree directory all runs live under.
pub const RUNS_DIR: &str = "codex-runs";

impl RunPaths {
    /// Derive the layout for `run_id` under `worktree`.
    pub fn for_run(worktree: impl AsRef<Path>, run_id: &str) -> Self {
        let worktree = worktree.as_ref().to_path_buf();
        let run_root = worktree.join(RUNS_DIR).join(run_id);
        Self {
            tasks_root: run_root.join("tasks"),
            conversation_root: run_root.join("conversations"),
            artifacts_root: run_root.join("artifacts"),
            locks_root: run_root.join("locks"),
            run_root,
            worktree,
        }
    }

    /// Task file path for a task id in a given bucket.
    pub fn task_file(&self, bucket: &str, task_id: &str) -> PathBuf {
        self.tasks_root.join(bucket).join(format!("{task_id}.json"))
    }

    /// Conversation file for a task.
    pub fn conversation_file(&self, task_id: &str) -> PathBuf {
        self.conversation_root.join(format!("{task_id}.md"))
    }

    /// The per-run implementer lock file.
    pub fn implementer_lock(&self) -> PathBuf {
        self.locks_root.join("implementer.lock")
    }

    /// Run-root-relative path of a task's outcome document.
    pub fn outcome_document_rel(task_id: &str) -> String {
        format!("artifacts/{task_id}.outcome.json")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_for_run_layout() {
        let paths = RunPaths::for_run("/w", "run-1");
        assert_eq!(paths.run_root, PathBuf::from("/w/codex-runs/run-1"));
        assert_eq!(paths.tasks_root, PathBuf::from("/w/codex-runs/run-1/tasks"));
        assert_eq!(
            paths.conversation_file("T-1"),
            PathBuf::from("/w/codex-runs/run-1/conversations/T-1.md")
        );
        assert_eq!(
            paths.implementer_lock(),
            PathBuf::from("/w/codex-runs/run-1/locks/implementer.lock")
        );
    }

    #[test]
    fn test_task_file_uses_bucket() {
        let paths = RunPaths::for_run("/w", "run-1");
        assert_eq!(
            paths.task_file("impl", "IMPL-run-1"),
            PathBuf::from("/w/codex-runs/run-1/tasks/impl/IMPL-run-1.json")
        );
    }

    #[test]
    fn test_outcome_document_rel() {
        assert_eq!(
            RunPaths::outcome_document_rel("REVIEW-1"),
            "artifacts/REVIEW-1.outcome.json"
        );
    }

    #[test]
    fn test_run_mode_serialization() {
        assert_eq!(
            serde_json::to_string(&RunMode::ImplementFeature).unwrap(),
            "\"implement_feature\""
        );
        assert_eq!(serde_json::to_string(&RunMode::BugHunt).unwrap(), "\"bug_hunt\"");
    }
}
