use crate::task::TaskRole;
use crate::worker::ReasoningDepth;
use std::collections::HashMap;

/// Sandbox policy passed to the AI CLI for worktree-mutating roles.
pub const SANDBOX_WORKSPACE_WRITE: &str = "workspace-write";
/// Sandbox policy selected by the unsafe escape hatch.
pub const SANDBOX_FULL_ACCESS: &str = "danger-full-access";

/// Executor configuration resolved from environment variables.
///
/// This is the only process-wide state of the kernel; it is resolved once and
/// injected, never read from hidden globals.
#[derive(Debug, Clone)]
pub struct ExecSettings {
    /// AI CLI binary (`CODEXFLOW_CLI_BIN`, default `codex`).
    pub cli_bin: String,
    /// Tester shell command (`CODEXFLOW_TEST_COMMAND`, default `npm test`).
    pub test_command: String,
    /// Sandbox policy for CLI invocations (`CODEXFLOW_SANDBOX_POLICY`);
    /// `CODEXFLOW_UNSAFE_FULL_ACCESS=1` overrides it to full access.
    pub sandbox_policy: String,
    /// Approval policy for CLI invocations (`CODEXFLOW_APPROVAL_POLICY`,
    /// default `never`).
    pub approval_policy: String,
    /// First available model for worker slots without a priority entry
    /// (`CODEXFLOW_MODEL`).
    pub default_model: Option<String>,
    /// Global reasoning depth default (`CODEXFLOW_REASONING_DEPTH`).
    pub reasoning_default: ReasoningDepth,
    /// Per-role reasoning depth overrides
    /// (`CODEXFLOW_REASONING_DEPTH_<ROLE>`).
    pub reasoning_overrides: HashMap<TaskRole, ReasoningDepth>,
    /// Shell-level tester timeout in seconds; zero disables it
    /// (`CODEXFLOW_TEST_TIMEOUT_SECS`).
    pub test_timeout_secs: u64,
    /// Age threshold for the startup stale-lock sweep
    /// (`CODEXFLOW_STALE_LOCK_SECS`, default 1800).
    pub stale_lock_secs: u64,
}

impl Default for ExecSettings {
    fn default() -> Self {
        Self {
            cli_bin: "codex".to_string(),
            test_command: "npm test".to_string(),
            sandbox_policy: SANDBOX_WORKSPACE_WRITE.to_string(),
            approval_policy: "never".to_string(),
            default_model: None,
            reasoning_default: ReasoningDepth::Low,
            reasoning_overrides: HashMap::new(),
            test_timeout_secs: 0,
            stale_lock_secs: 1800,
        }
    }
}

impl ExecSettings {
    /// Resolve settings from the process environment.
    pub fn from_env() -> Self {
        let mut settings = Self::default();

        if let Ok(bin) = std::env::var("CODEXFLOW_CLI_BIN") {
            if !bin.trim().is_empty() {
                settings.cli_bin = bin;
            }
        }
        if let Ok(cmd) = std::env::var("CODEXFLOW_TEST_COMMAND") {
            if !cmd.trim().is_empty() {
                settings.test_command = cmd;
            }
        }
        if let Ok(policy) = std::env::var("CODEXFLOW_SANDBOX_POLICY") {
            if !policy.trim().is_empty() {
                settings.sandbox_policy = policy;
            }
        }
        if env_flag("CODEXFLOW_UNSAFE_FULL_ACCESS") {
            settings.sandbox_policy = SANDBOX_FULL_ACCESS.to_string();
        }
        if let Ok(policy) = std::env::var("CODEXFLOW_APPROVAL_POLICY") {
            if !policy.trim().is_empty() {
                settings.approval_policy = policy;
            }
        }
        if let Ok(model) = std::env::var("CODEXFLOW_MODEL") {
            if !model.trim().is_empty() {
                settings.default_model = Some(model);
            }
        }
        if let Some(depth) = std::env::var("CODEXFLOW_REASONING_DEPTH")
            .ok()
            .and_then(|s| ReasoningDepth::parse(&s))
        {
            settings.reasoning_default = depth;
        }
        for role in TaskRole::all() {
            let key = format!(
                "CODEXFLOW_REASONING_DEPTH_{}",
                role.as_str().to_ascii_uppercase()
            );
            if let Some(depth) = std::env::var(key).ok().and_then(|s| ReasoningDepth::parse(&s)) {
                settings.reasoning_overrides.insert(role, depth);
            }
        }
        if let Some(secs) = std::env::var("CODEXFLOW_TEST_TIMEOUT_SECS")
            .ok()
            .and_then(|s| s.trim().parse().ok())
        {
            settings.test_timeout_secs = secs;
        }
        if let Some(secs) = std::env::var("CODEXFLOW_STALE_LOCK_SECS")
            .ok()
            .and_then(|s| s.trim().parse().ok())
        {
            settings.stale_lock_secs = secs;
        }

        settings
    }

    /// Reasoning depth for a role: per-role override, then the global
    /// default.
    pub fn reasoning_for(&self, role: TaskRole) -> ReasoningDepth {
        self.reasoning_overrides
            .get(&role)
            .copied()
            .unwrap_or(self.reasoning_default)
    }
}

fn env_flag(key: &str) -> bool {
    std::env::var(key)
        .map(|v| {
            let v = v.trim().to_ascii_lowercase();
            v == "1" || v == "true" || v == "yes"
        })
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let settings = ExecSettings::default();
        assert_eq!(settings.cli_bin, "codex");
        assert_eq!(settings.test_command, "npm test");
        assert_eq!(settings.sandbox_policy, SANDBOX_WORKSPACE_WRITE);
        assert_eq!(settings.reasoning_default, ReasoningDepth::Low);
        assert_eq!(settings.stale_lock_secs, 1800);
    }

    #[test]
    fn test_reasoning_for_prefers_override() {
        let mut settings = ExecSettings::default();
        settings.reasoning_default = ReasoningDepth::Medium;
        settings
            .reasoning_overrides
            .insert(TaskRole::Reviewer, ReasoningDepth::High);

        assert_eq!(settings.reasoning_for(TaskRole::Reviewer), ReasoningDepth::High);
        assert_eq!(settings.reasoning_for(TaskRole::Tester), ReasoningDepth::Medium);
    }
}
