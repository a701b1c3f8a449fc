use crate::task::TaskRole;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Live state of a role worker slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerState {
    /// Polling for a claimable task.
    Waiting,
    /// Executing a claimed task.
    Working,
    /// Stopped by the supervisor.
    Stopped,
    /// The last execution failed.
    Error,
}

/// How much reasoning the backing model is asked to spend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReasoningDepth {
    /// Default depth.
    #[default]
    Low,
    /// Medium depth.
    Medium,
    /// Maximum depth.
    High,
}

impl ReasoningDepth {
    /// Stable string form.
    pub fn as_str(&self) -> &'static str {
        match self {
            ReasoningDepth::Low => "low",
            ReasoningDepth::Medium => "medium",
            ReasoningDepth::High => "high",
        }
    }

    /// Lenient parse; unknown strings yield `None`.
    pub fn parse(s: &str) -> Option<ReasoningDepth> {
        match s.trim().to_ascii_lowercase().as_str() {
            "low" => Some(ReasoningDepth::Low),
            "medium" => Some(ReasoningDepth::Medium),
            "high" => Some(ReasoningDepth::High),
            _ => None,
        }
    }
}

impl std::fmt::Display for ReasoningDepth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status published for one logical worker (`<role>-<index>`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerStatus {
    /// Worker id, `<role>-<index>`.
    pub id: String,
    /// Role this worker claims tasks for.
    pub role: TaskRole,
    /// Current state.
    pub state: WorkerState,
    /// Human-readable description of what the worker is doing.
    pub description: String,
    /// Model the worker runs with, if pinned.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Reasoning depth the worker runs with.
    pub reasoning_depth: ReasoningDepth,
    /// Bounded tail of normalised executor output.
    #[serde(default)]
    pub log_tail: String,
    /// When the worker was started.
    pub started_at: DateTime<Utc>,
    /// Last status mutation.
    pub updated_at: DateTime<Utc>,
    /// Last heartbeat, while the loop is alive.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_heartbeat_at: Option<DateTime<Utc>>,
}

impl WorkerStatus {
    /// A fresh `waiting` status for a newly started worker.
    pub fn waiting(id: impl Into<String>, role: TaskRole, model: Option<String>, depth: ReasoningDepth) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            role,
            state: WorkerState::Waiting,
            description: "Waiting for tasks".to_string(),
            model,
            reasoning_depth: depth,
            log_tail: String::new(),
            started_at: now,
            updated_at: now,
            last_heartbeat_at: None,
        }
    }
}

/// Maximum number of entries kept in a model priority list.
pub const MODEL_PRIORITY_LIMIT: usize = 4;

/// Desired worker configuration for one role.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleWorkerConfig {
    /// The role being configured.
    pub role: TaskRole,
    /// Number of worker slots (index 1..=count).
    pub count: u32,
    /// Preferred model per slot; missing slots fall back to the first
    /// available model.
    #[serde(default)]
    pub model_priority: Vec<String>,
}

impl RoleWorkerConfig {
    /// Build a configuration, clamping a possibly-negative count to zero and
    /// truncating the priority list to [`MODEL_PRIORITY_LIMIT`] entries.
    pub fn sanitized(role: TaskRole, count: i64, mut model_priority: Vec<String>) -> Self {
        model_priority.truncate(MODEL_PRIORITY_LIMIT);
        Self {
            role,
            count: count.max(0) as u32,
            model_priority,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reasoning_depth_parse() {
        assert_eq!(ReasoningDepth::parse("LOW"), Some(ReasoningDepth::Low));
        assert_eq!(ReasoningDepth::parse(" high "), Some(ReasoningDepth::High));
        assert_eq!(ReasoningDepth::parse("ultra"), None);
        assert_eq!(ReasoningDepth::default(), ReasoningDepth::Low);
    }

    #[test]
    fn test_worker_status_waiting() {
        let status = WorkerStatus::waiting("analyst_a-1", TaskRole::AnalystA, None, ReasoningDepth::Low);
        assert_eq!(status.state, WorkerState::Waiting);
        assert_eq!(status.id, "analyst_a-1");
        assert!(status.last_heartbeat_at.is_none());
    }

    #[test]
    fn test_sanitized_clamps_negative_count() {
        let config = RoleWorkerConfig::sanitized(TaskRole::Tester, -3, vec![]);
        assert_eq!(config.count, 0);
    }

    #[test]
    fn test_sanitized_truncates_priority_list() {
        let priority: Vec<String> = (0..6).map(|i| format!("model-{i}")).collect();
        let config = RoleWorkerConfig::sanitized(TaskRole::Implementer, 2, priority);
        assert_eq!(config.model_priority.len(), MODEL_PRIORITY_LIMIT);
        assert_eq!(config.model_priority[0], "model-0");
    }

    #[test]
    fn test_worker_state_serialization() {
        assert_eq!(serde_json::to_string(&WorkerState::Waiting).unwrap(), "\"waiting\"");
        assert_eq!(serde_json::to_string(&WorkerState::Error).unwrap(), "\"error\"");
    }
}
