use crate::outcome::WorkerOutcome;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};

/// Kind of a task, which doubles as its storage bucket under `tasks/`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    /// Requirement analysis (analysts and the splitter live here).
    Analysis,
    /// Consensus building over completed analyses.
    Consensus,
    /// Worktree implementation.
    Impl,
    /// Test execution.
    Test,
    /// Code review.
    Review,
}

impl TaskKind {
    /// Directory name this kind is stored under.
    pub fn bucket(&self) -> &'static str {
        match self {
            TaskKind::Analysis => "analysis",
            TaskKind::Consensus => "consensus",
            TaskKind::Impl => "impl",
            TaskKind::Test => "test",
            TaskKind::Review => "review",
        }
    }

    /// Map a storage directory name back to a kind, if it names one.
    pub fn from_bucket(bucket: &str) -> Option<TaskKind> {
        match bucket {
            "analysis" => Some(TaskKind::Analysis),
            "consensus" => Some(TaskKind::Consensus),
            "impl" => Some(TaskKind::Impl),
            "test" => Some(TaskKind::Test),
            "review" => Some(TaskKind::Review),
            _ => None,
        }
    }

    fn parse(s: &str) -> Option<TaskKind> {
        TaskKind::from_bucket(s)
    }

    /// The role that executes tasks of this kind by default.
    pub fn default_role(&self) -> TaskRole {
        match self {
            TaskKind::Analysis => TaskRole::AnalystA,
            TaskKind::Consensus => TaskRole::ConsensusBuilder,
            TaskKind::Impl => TaskRole::Implementer,
            TaskKind::Test => TaskRole::Tester,
            TaskKind::Review => TaskRole::Reviewer,
        }
    }
}

impl std::fmt::Display for TaskKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.bucket())
    }
}

/// The logical persona that executes a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskRole {
    /// First analyst perspective.
    AnalystA,
    /// Second analyst perspective.
    AnalystB,
    /// Merges completed analyses into a consensus plan.
    ConsensusBuilder,
    /// Splits the consensus plan into implement/test/review work.
    Splitter,
    /// Mutates the worktree.
    Implementer,
    /// Runs the test command.
    Tester,
    /// Reviews the change and approves or requests changes.
    Reviewer,
}

impl TaskRole {
    /// Stable string form, matching the on-disk representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskRole::AnalystA => "analyst_a",
            TaskRole::AnalystB => "analyst_b",
            TaskRole::ConsensusBuilder => "consensus_builder",
            TaskRole::Splitter => "splitter",
            TaskRole::Implementer => "implementer",
            TaskRole::Tester => "tester",
            TaskRole::Reviewer => "reviewer",
        }
    }

    /// Parse the on-disk string form.
    pub fn parse(s: &str) -> Option<TaskRole> {
        match s {
            "analyst_a" => Some(TaskRole::AnalystA),
            "analyst_b" => Some(TaskRole::AnalystB),
            "consensus_builder" => Some(TaskRole::ConsensusBuilder),
            "splitter" => Some(TaskRole::Splitter),
            "implementer" => Some(TaskRole::Implementer),
            "tester" => Some(TaskRole::Tester),
            "reviewer" => Some(TaskRole::Reviewer),
            _ => None,
        }
    }

    /// All declared roles, in pipeline order.
    pub fn all() -> [TaskRole; 7] {
        [
            TaskRole::AnalystA,
            TaskRole::AnalystB,
            TaskRole::ConsensusBuilder,
            TaskRole::Splitter,
            TaskRole::Implementer,
            TaskRole::Tester,
            TaskRole::Reviewer,
        ]
    }
}

impl std::fmt::Display for TaskRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status of a task. The JSON `status` field is authoritative; directory
/// membership is only a hint used when the field is missing or unrecognised.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Schedulable once dependencies are satisfied.
    Ready,
    /// Claimed by exactly one worker.
    InProgress,
    /// Finished its executor run and waiting on approvals.
    AwaitingReview,
    /// A reviewer requested changes; expansion re-opens the chain.
    ChangesRequested,
    /// Approved, terminal for scheduling purposes.
    Approved,
    /// A worker could not complete the task.
    Blocked,
    /// Completed successfully.
    Done,
    /// The task record itself is in an error state.
    Error,
}

impl TaskStatus {
    /// Stable string form, matching the on-disk representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Ready => "ready",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::AwaitingReview => "awaiting_review",
            TaskStatus::ChangesRequested => "changes_requested",
            TaskStatus::Approved => "approved",
            TaskStatus::Blocked => "blocked",
            TaskStatus::Done => "done",
            TaskStatus::Error => "error",
        }
    }

    /// Parse the on-disk string form.
    pub fn parse(s: &str) -> Option<TaskStatus> {
        match s {
            "ready" => Some(TaskStatus::Ready),
            "in_progress" => Some(TaskStatus::InProgress),
            "awaiting_review" => Some(TaskStatus::AwaitingReview),
            "changes_requested" => Some(TaskStatus::ChangesRequested),
            "approved" => Some(TaskStatus::Approved),
            "blocked" => Some(TaskStatus::Blocked),
            "done" => Some(TaskStatus::Done),
            "error" => Some(TaskStatus::Error),
            _ => None,
        }
    }

    /// Status inferred from the storage directory when the JSON carries no
    /// recognised status.
    pub fn infer_from_bucket(bucket: &str) -> TaskStatus {
        match bucket {
            "done" => TaskStatus::Done,
            "review" => TaskStatus::AwaitingReview,
            _ => TaskStatus::Ready,
        }
    }

    /// Whether a dependency in this status counts as satisfied.
    pub fn satisfies_dependency(&self) -> bool {
        matches!(self, TaskStatus::Done | TaskStatus::Approved)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The unit scheduled by the kernel, persisted as one JSON file.
///
/// The on-disk JSON is open-ended: fields the kernel does not model are
/// carried through the `extra` bag so a round-trip never loses them.
#[derive(Debug, Clone, Serialize)]
pub struct TaskRecord {
    /// Stable identifier, unique within a run.
    pub id: String,
    /// Logical grouping, usually the run id.
    pub epic: String,
    /// Kind, which also names the storage bucket.
    pub kind: TaskKind,
    /// Role that executes this task.
    pub role: TaskRole,
    /// Human-readable title.
    pub title: String,
    /// Prompt handed to the executor.
    pub prompt: String,
    /// Authoritative status.
    pub status: TaskStatus,
    /// Working directory, relative to the worktree.
    pub cwd: String,
    /// Ids of tasks that must be done or approved first.
    pub depends_on: Vec<String>,
    /// Number of approvals required before external approval promotes the
    /// task to approved.
    pub approvals_required: u32,
    /// Names of approvers collected so far.
    pub approvals: Vec<String>,
    /// Worktree-relative artifact paths recorded by workers.
    pub artifacts: Vec<String>,
    /// Last executor summary.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    /// Role holding the current claim, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_claimed_by: Option<TaskRole>,
    /// Structured verdict recorded by the last worker, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worker_outcome: Option<WorkerOutcome>,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Last mutation timestamp.
    pub updated_at: DateTime<Utc>,
    /// Fields present on disk that the kernel does not model.
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

const KNOWN_FIELDS: &[&str] = &[
    "id",
    "epic",
    "kind",
    "role",
    "title",
    "prompt",
    "status",
    "cwd",
    "depends_on",
    "approvals_required",
    "approvals",
    "artifacts",
    "summary",
    "last_claimed_by",
    "worker_outcome",
    "created_at",
    "updated_at",
];

impl TaskRecord {
    /// Create a fresh `ready` task with no dependencies.
    pub fn new(
        id: impl Into<String>,
        epic: impl Into<String>,
        kind: TaskKind,
        role: TaskRole,
        title: impl Into<String>,
        prompt: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            epic: epic.into(),
            kind,
            role,
            title: title.into(),
            prompt: prompt.into(),
            status: TaskStatus::Ready,
            cwd: ".".to_string(),
            depends_on: Vec::new(),
            approvals_required: 0,
            approvals: Vec::new(),
            artifacts: Vec::new(),
            summary: None,
            last_claimed_by: None,
            worker_outcome: None,
            created_at: now,
            updated_at: now,
            extra: BTreeMap::new(),
        }
    }

    /// Builder-style dependency assignment.
    pub fn with_depends_on(mut self, deps: Vec<String>) -> Self {
        self.depends_on = deps;
        self
    }

    /// Builder-style approval requirement.
    pub fn with_approvals_required(mut self, n: u32) -> Self {
        self.approvals_required = n;
        self
    }

    /// Whether every dependency exists in `statuses` and is done or approved.
    pub fn dependencies_satisfied(&self, statuses: &HashMap<String, TaskStatus>) -> bool {
        self.depends_on
            .iter()
            .all(|dep| statuses.get(dep).is_some_and(TaskStatus::satisfies_dependency))
    }

    /// Serialize to the canonical on-disk JSON text (pretty, trailing newline).
    pub fn to_disk_json(&self) -> serde_json::Result<String> {
        let mut text = serde_json::to_string_pretty(self)?;
        text.push('\n');
        Ok(text)
    }

    /// Project an on-disk JSON document to a closed record.
    ///
    /// Unknown `status` / `kind` / `role` strings fall back to inferred
    /// defaults; missing identifiers fall back to the file stem. Unknown
    /// fields are preserved in the `extra` bag. Returns an error only when
    /// the text is not a JSON object at all.
    pub fn from_disk_json(
        text: &str,
        bucket: &str,
        file_stem: &str,
    ) -> serde_json::Result<TaskRecord> {
        let value: Value = serde_json::from_str(text)?;
        let obj = match value {
            Value::Object(map) => map,
            other => {
                return Err(serde::de::Error::custom(format!(
                    "expected a JSON object, got {other}"
                )))
            }
        };

        let str_field = |key: &str| obj.get(key).and_then(Value::as_str).map(str::to_string);

        let id = str_field("id").unwrap_or_else(|| file_stem.to_string());
        let kind = str_field("kind")
            .and_then(|s| TaskKind::parse(&s))
            .or_else(|| TaskKind::from_bucket(bucket))
            .unwrap_or(TaskKind::Analysis);
        let role = str_field("role")
            .and_then(|s| TaskRole::parse(&s))
            .unwrap_or_else(|| kind.default_role());
        let status = str_field("status")
            .and_then(|s| TaskStatus::parse(&s))
            .unwrap_or_else(|| TaskStatus::infer_from_bucket(bucket));

        let string_list = |key: &str| -> Vec<String> {
            obj.get(key)
                .and_then(Value::as_array)
                .map(|items| {
                    items
                        .iter()
                        .filter_map(Value::as_str)
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default()
        };

        let timestamp = |key: &str| -> DateTime<Utc> {
            obj.get(key)
                .cloned()
                .and_then(|v| serde_json::from_value::<DateTime<Utc>>(v).ok())
                .unwrap_or_else(Utc::now)
        };

        let extra: BTreeMap<String, Value> = obj
            .iter()
            .filter(|(key, _)| !KNOWN_FIELDS.contains(&key.as_str()))
            .map(|(key, v)| (key.clone(), v.clone()))
            .collect();

        Ok(TaskRecord {
            epic: str_field("epic").unwrap_or_else(|| id.clone()),
            title: str_field("title").unwrap_or_else(|| id.clone()),
            prompt: str_field("prompt").unwrap_or_default(),
            cwd: str_field("cwd").unwrap_or_else(|| ".".to_string()),
            depends_on: string_list("depends_on"),
            approvals_required: obj
                .get("approvals_required")
                .and_then(Value::as_u64)
                .unwrap_or(0) as u32,
            approvals: string_list("approvals"),
            artifacts: string_list("artifacts"),
            summary: str_field("summary"),
            last_claimed_by: str_field("last_claimed_by").and_then(|s| TaskRole::parse(&s)),
            worker_outcome: obj
                .get("worker_outcome")
                .cloned()
                .and_then(|v| serde_json::from_value(v).ok()),
            created_at: timestamp("created_at"),
            updated_at: timestamp("updated_at"),
            id,
            kind,
            role,
            status,
            extra,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_task() -> TaskRecord {
        TaskRecord::new(
            "ANALYSIS-run1-A",
            "run1",
            TaskKind::Analysis,
            TaskRole::AnalystA,
            "Analyse feature",
            "Analyse the briefing",
        )
    }

    #[test]
    fn test_kind_bucket_round_trip() {
        for kind in [
            TaskKind::Analysis,
            TaskKind::Consensus,
            TaskKind::Impl,
            TaskKind::Test,
            TaskKind::Review,
        ] {
            assert_eq!(TaskKind::from_bucket(kind.bucket()), Some(kind));
        }
        assert_eq!(TaskKind::from_bucket("backlog"), None);
    }

    #[test]
    fn test_role_serialization_is_snake_case() {
        let json = serde_json::to_string(&TaskRole::ConsensusBuilder).unwrap();
        assert_eq!(json, "\"consensus_builder\"");
        assert_eq!(TaskRole::parse("analyst_b"), Some(TaskRole::AnalystB));
        assert_eq!(TaskRole::parse("unknown"), None);
    }

    #[test]
    fn test_status_inference_from_bucket() {
        assert_eq!(TaskStatus::infer_from_bucket("done"), TaskStatus::Done);
        assert_eq!(
            TaskStatus::infer_from_bucket("review"),
            TaskStatus::AwaitingReview
        );
        assert_eq!(TaskStatus::infer_from_bucket("impl"), TaskStatus::Ready);
        assert_eq!(TaskStatus::infer_from_bucket("backlog"), TaskStatus::Ready);
    }

    #[test]
    fn test_dependencies_satisfied() {
        let task = sample_task().with_depends_on(vec!["a".into(), "b".into()]);
        let mut statuses = HashMap::new();
        statuses.insert("a".to_string(), TaskStatus::Done);
        assert!(!task.dependencies_satisfied(&statuses));

        statuses.insert("b".to_string(), TaskStatus::Approved);
        assert!(task.dependencies_satisfied(&statuses));

        statuses.insert("b".to_string(), TaskStatus::InProgress);
        assert!(!task.dependencies_satisfied(&statuses));
    }

    #[test]
    fn test_missing_dependency_blocks() {
        let task = sample_task().with_depends_on(vec!["ghost".into()]);
        assert!(!task.dependencies_satisfied(&HashMap::new()));
    }

    #[test]
    fn test_disk_round_trip_identity() {
        let mut task = sample_task().with_depends_on(vec!["x".into()]);
        task.approvals_required = 1;
        task.approvals.push("alice".to_string());
        task.summary = Some("done".to_string());
        task.last_claimed_by = Some(TaskRole::AnalystA);

        let text = task.to_disk_json().unwrap();
        assert!(text.ends_with('\n'));

        let parsed = TaskRecord::from_disk_json(&text, "analysis", "ANALYSIS-run1-A").unwrap();
        assert_eq!(parsed.id, task.id);
        assert_eq!(parsed.epic, task.epic);
        assert_eq!(parsed.kind, task.kind);
        assert_eq!(parsed.role, task.role);
        assert_eq!(parsed.status, task.status);
        assert_eq!(parsed.depends_on, task.depends_on);
        assert_eq!(parsed.approvals_required, 1);
        assert_eq!(parsed.approvals, task.approvals);
        assert_eq!(parsed.summary, task.summary);
        assert_eq!(parsed.last_claimed_by, task.last_claimed_by);
        assert_eq!(parsed.created_at, task.created_at);
    }

    #[test]
    fn test_unknown_status_falls_back_to_bucket() {
        let text = r#"{"id":"T-1","status":"weird","kind":"review"}"#;
        let parsed = TaskRecord::from_disk_json(text, "review", "T-1").unwrap();
        assert_eq!(parsed.status, TaskStatus::AwaitingReview);
        assert_eq!(parsed.kind, TaskKind::Review);
        assert_eq!(parsed.role, TaskRole::Reviewer);
    }

    #[test]
    fn test_extra_fields_preserved() {
        let text = r#"{"id":"T-2","status":"ready","kind":"impl","custom_field":{"a":1}}"#;
        let parsed = TaskRecord::from_disk_json(text, "impl", "T-2").unwrap();
        assert!(parsed.extra.contains_key("custom_field"));

        let out = parsed.to_disk_json().unwrap();
        assert!(out.contains("custom_field"));
    }

    #[test]
    fn test_non_object_json_is_an_error() {
        assert!(TaskRecord::from_disk_json("[1,2]", "impl", "T-3").is_err());
        assert!(TaskRecord::from_disk_json("not json", "impl", "T-3").is_err());
    }
}
