use crate::executor::{ExecutionContext, ExecutionResult, Executor, LogSink, LogSource};
use crate::outcome::{extract_outcome, reviewer_outcome_from_text};
use async_trait::async_trait;
use codexflow_core::{CodexflowError, CodexflowResult, OutcomePayload, TaskRole};
use serde_json::Value;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tracing::{info, warn};

/// Generic AI CLI executor used for the analyst, consensus, splitter, and
/// reviewer roles.
///
/// Spawns the configured CLI binary in JSON event mode, streams stdout and
/// stderr through the log sink, and parses the event stream for the final
/// agent message and any embedded structured outcome.
pub struct CliExecutor;

impl CliExecutor {
    /// Create the executor.
    pub fn new() -> Self {
        Self
    }
}

impl Default for CliExecutor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Executor for CliExecutor {
    async fn execute(&self, ctx: ExecutionContext) -> CodexflowResult<ExecutionResult> {
        let lines = run_cli(&ctx).await?;
        let (summary, mut outcome) = summarize_event_stream(&lines);

        // Reviewer fallback: free-form verdict phrases, only when the CLI
        // emitted no structured outcome.
        if outcome.is_none() && ctx.role == TaskRole::Reviewer {
            outcome = reviewer_outcome_from_text(&summary).map(|status| OutcomePayload {
                status,
                summary: summary.clone(),
                details: None,
            });
        }

        Ok(ExecutionResult {
            summary,
            artifacts: Vec::new(),
            outcome,
        })
    }
}

/// Spawn the AI CLI for `ctx` and return the collected stdout lines.
///
/// Shared by the generic and the implementer executors.
pub(crate) async fn run_cli(ctx: &ExecutionContext) -> CodexflowResult<Vec<String>> {
    let cwd = ctx.worktree_path.join(&ctx.task.cwd);

    let mut cmd = Command::new(&ctx.settings.cli_bin);
    cmd.arg("exec")
        .arg("--json")
        .arg("--sandbox")
        .arg(&ctx.settings.sandbox_policy)
        .arg("--ask-for-approval")
        .arg(&ctx.settings.approval_policy)
        .arg("-c")
        .arg(format!("model_reasoning_effort={}", ctx.reasoning_depth));
    if let Some(model) = &ctx.model {
        cmd.arg("--model").arg(model);
    }
    cmd.arg(&ctx.task.prompt)
        .current_dir(&cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    info!(
        task_id = %ctx.task.id,
        role = %ctx.role,
        bin = %ctx.settings.cli_bin,
        cwd = %cwd.display(),
        "spawning AI CLI"
    );

    let mut child = cmd.spawn().map_err(|err| {
        CodexflowError::Executor(format!(
            "failed to spawn '{}': {err}. Is the AI CLI installed?",
            ctx.settings.cli_bin
        ))
    })?;

    let stdout_lines = Arc::new(Mutex::new(Vec::new()));
    let stderr_lines = Arc::new(Mutex::new(Vec::new()));
    let stdout_task = pump(
        child.stdout.take(),
        Arc::clone(&ctx.on_log),
        LogSource::Stdout,
        Arc::clone(&stdout_lines),
    );
    let stderr_task = pump(
        child.stderr.take(),
        Arc::clone(&ctx.on_log),
        LogSource::Stderr,
        Arc::clone(&stderr_lines),
    );

    let status = wait_with_cancellation(&mut child, ctx).await?;
    if let Some(task) = stdout_task {
        let _ = task.await;
    }
    if let Some(task) = stderr_task {
        let _ = task.await;
    }

    if !status.success() {
        let stderr_tail = last_lines(&stderr_lines, 10);
        return Err(CodexflowError::Executor(format!(
            "AI CLI exited with {status}: {stderr_tail}"
        )));
    }

    let lines = match stdout_lines.lock() {
        Ok(guard) => guard.clone(),
        Err(poisoned) => poisoned.into_inner().clone(),
    };
    Ok(lines)
}

/// Wait for the child, terminating it when cancellation fires.
pub(crate) async fn wait_with_cancellation(
    child: &mut Child,
    ctx: &ExecutionContext,
) -> CodexflowResult<std::process::ExitStatus> {
    tokio::select! {
        status = child.wait() => Ok(status?),
        () = ctx.cancellation.cancelled() => {
            if let Err(err) = child.start_kill() {
                warn!(task_id = %ctx.task.id, error = %err, "kill after cancellation failed");
            }
            let _ = child.wait().await;
            Err(CodexflowError::Executor("execution cancelled".to_string()))
        }
    }
}

fn pump(
    stream: Option<impl AsyncRead + Unpin + Send + 'static>,
    sink: LogSink,
    source: LogSource,
    collected: Arc<Mutex<Vec<String>>>,
) -> Option<tokio::task::JoinHandle<()>> {
    let stream = stream?;
    Some(tokio::spawn(async move {
        let mut lines = BufReader::new(stream).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            sink(&line, source);
            if let Ok(mut guard) = collected.lock() {
                guard.push(line);
            }
        }
    }))
}

fn last_lines(lines: &Arc<Mutex<Vec<String>>>, n: usize) -> String {
    let guard = match lines.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    };
    let start = guard.len().saturating_sub(n);
    guard[start..].join(" | ")
}

/// Pull the final agent message and the last structured outcome out of a CLI
/// event stream.
pub(crate) fn summarize_event_stream(lines: &[String]) -> (String, Option<OutcomePayload>) {
    let mut summary = None;
    let mut outcome = None;
    for line in lines {
        let Ok(value) = serde_json::from_str::<Value>(line) else {
            continue;
        };
        let msg = value.get("msg").unwrap_or(&value);
        if msg.get("type").and_then(Value::as_str) != Some("agent_message") {
            continue;
        }
        let text = msg.get("text").and_then(Value::as_str).unwrap_or_default();
        if !text.is_empty() {
            summary = Some(text.to_string());
        }
        if let Some(payload) = extract_outcome(text) {
            outcome = Some(payload);
        }
    }
    let summary =
        summary.unwrap_or_else(|| "executor finished without an agent message".to_string());
    (summary, outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use codexflow_core::OutcomeStatus;

    fn message_line(text: &str) -> String {
        serde_json::json!({"msg": {"type": "agent_message", "text": text}}).to_string()
    }

    #[test]
    fn test_summary_is_last_agent_message() {
        let lines = vec![
            message_line("first"),
            "{\"msg\":{\"type\":\"token_count\",\"total\":5}}".to_string(),
            message_line("second"),
        ];
        let (summary, outcome) = summarize_event_stream(&lines);
        assert_eq!(summary, "second");
        assert!(outcome.is_none());
    }

    #[test]
    fn test_structured_outcome_extracted_from_message() {
        let lines = vec![message_line(
            "Verdict follows\n{\"status\": \"ok\", \"summary\": \"LGTM\"}",
        )];
        let (_, outcome) = summarize_event_stream(&lines);
        let outcome = outcome.unwrap();
        assert_eq!(outcome.status, OutcomeStatus::Ok);
        assert_eq!(outcome.summary, "LGTM");
    }

    #[test]
    fn test_empty_stream_has_placeholder_summary() {
        let (summary, outcome) = summarize_event_stream(&[]);
        assert!(summary.contains("without an agent message"));
        assert!(outcome.is_none());
    }
}
