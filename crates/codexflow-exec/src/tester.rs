use crate::cli::wait_with_cancellation;
use crate::executor::{ExecutionArtifact, ExecutionContext, ExecutionResult, Executor, LogSource};
use async_trait::async_trait;
use codexflow_core::{CodexflowError, CodexflowResult};
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::{info, warn};

/// Runs the configured shell test command in the worktree.
///
/// Non-zero exit is an executor error; on success the captured output becomes
/// the task artifact.
pub struct TestExecutor;

impl TestExecutor {
    /// Create the executor.
    pub fn new() -> Self {
        Self
    }
}

impl Default for TestExecutor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Executor for TestExecutor {
    async fn execute(&self, ctx: ExecutionContext) -> CodexflowResult<ExecutionResult> {
        let cwd = ctx.worktree_path.join(&ctx.task.cwd);
        let command = ctx.settings.test_command.clone();
        info!(task_id = %ctx.task.id, command = %command, cwd = %cwd.display(), "running test command");

        let mut child = Command::new("sh")
            .arg("-c")
            .arg(&command)
            .current_dir(&cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| {
                CodexflowError::Executor(format!("failed to spawn test command: {err}"))
            })?;

        let log = Arc::new(Mutex::new(String::new()));
        let mut readers = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            readers.push(tokio::spawn(pump_into(
                stdout,
                Arc::clone(&ctx.on_log),
                LogSource::Stdout,
                Arc::clone(&log),
            )));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(tokio::spawn(pump_into(
                stderr,
                Arc::clone(&ctx.on_log),
                LogSource::Stderr,
                Arc::clone(&log),
            )));
        }

        let timeout = ctx.settings.test_timeout_secs;
        let status = if timeout > 0 {
            match tokio::time::timeout(
                Duration::from_secs(timeout),
                wait_with_cancellation(&mut child, &ctx),
            )
            .await
            {
                Ok(status) => status?,
                Err(_) => {
                    if let Err(err) = child.start_kill() {
                        warn!(error = %err, "kill after test timeout failed");
                    }
                    let _ = child.wait().await;
                    return Err(CodexflowError::Executor(format!(
                        "test command timed out after {timeout}s"
                    )));
                }
            }
        } else {
            wait_with_cancellation(&mut child, &ctx).await?
        };
        for reader in readers {
            let _ = reader.await;
        }

        if !status.success() {
            let code = status.code().unwrap_or(-1);
            return Err(CodexflowError::Executor(format!(
                "test command failed (exit {code})"
            )));
        }

        let contents = match log.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };
        Ok(ExecutionResult {
            summary: format!("Tests passed: {command}"),
            artifacts: vec![ExecutionArtifact {
                path: format!("artifacts/{}.test.log", ctx.task.id),
                contents,
            }],
            outcome: None,
        })
    }
}

async fn pump_into(
    stream: impl tokio::io::AsyncRead + Unpin,
    sink: crate::executor::LogSink,
    source: LogSource,
    log: Arc<Mutex<String>>,
) {
    let mut lines = BufReader::new(stream).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        sink(&line, source);
        if let Ok(mut guard) = log.lock() {
            guard.push_str(&line);
            guard.push('\n');
        }
    }
}
