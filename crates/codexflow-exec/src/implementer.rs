use crate::cli::{run_cli, summarize_event_stream};
use crate::executor::{ExecutionArtifact, ExecutionContext, ExecutionResult, Executor};
use async_trait::async_trait;
use codexflow_core::{CodexflowError, CodexflowResult, OutcomePayload, OutcomeStatus};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, warn};

/// Poll interval while waiting for the implementer lock.
const LOCK_RETRY: Duration = Duration::from_millis(500);

/// CLI executor for the implementer role.
///
/// Holds the per-run implementer lock file for the duration of the execution
/// so at most one implementer mutates the worktree at a time, then captures
/// `git diff` as the task artifact.
pub struct ImplementerExecutor {
    lock_path: PathBuf,
}

impl ImplementerExecutor {
    /// Create an executor guarding the given lock file
    /// (`<runRoot>/locks/implementer.lock`).
    pub fn new(lock_path: PathBuf) -> Self {
        Self { lock_path }
    }
}

#[async_trait]
impl Executor for ImplementerExecutor {
    async fn execute(&self, ctx: ExecutionContext) -> CodexflowResult<ExecutionResult> {
        let _lock = ImplementerLock::acquire(&self.lock_path, &ctx).await?;

        let lines = run_cli(&ctx).await?;
        let (summary, _) = summarize_event_stream(&lines);

        let diff = capture_git_diff(&ctx.worktree_path).await;
        let mut artifacts = Vec::new();
        let details = if diff.trim().is_empty() {
            Some("no changes detected in the worktree".to_string())
        } else {
            let line_count = diff.lines().count();
            artifacts.push(ExecutionArtifact {
                path: format!("artifacts/{}.diff", ctx.task.id),
                contents: diff,
            });
            Some(format!("captured a {line_count}-line diff"))
        };

        Ok(ExecutionResult {
            outcome: Some(OutcomePayload {
                status: OutcomeStatus::Ok,
                summary: summary.clone(),
                details,
            }),
            summary,
            artifacts,
        })
    }
}

/// Exclusive-create guard over the per-run implementer lock file.
///
/// The file is removed when the guard drops, including on early returns and
/// executor errors.
#[derive(Debug)]
struct ImplementerLock {
    path: PathBuf,
}

impl ImplementerLock {
    async fn acquire(path: &Path, ctx: &ExecutionContext) -> CodexflowResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        loop {
            match std::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(path)
            {
                Ok(mut file) => {
                    let _ = writeln!(file, "{}", ctx.task.id);
                    debug!(path = %path.display(), task_id = %ctx.task.id, "implementer lock acquired");
                    return Ok(Self {
                        path: path.to_path_buf(),
                    });
                }
                Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                    if ctx.cancellation.is_cancelled() {
                        return Err(CodexflowError::Executor("execution cancelled".to_string()));
                    }
                    debug!(path = %path.display(), "implementer lock held; waiting");
                    tokio::time::sleep(LOCK_RETRY).await;
                }
                Err(err) => return Err(err.into()),
            }
        }
    }
}

impl Drop for ImplementerLock {
    fn drop(&mut self) {
        if let Err(err) = std::fs::remove_file(&self.path) {
            if err.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %self.path.display(), error = %err, "implementer lock removal failed");
            }
        }
    }
}

/// Capture the worktree diff. Failures degrade to an empty diff with a
/// warning rather than failing the task.
async fn capture_git_diff(worktree: &Path) -> String {
    let output = Command::new("git")
        .arg("diff")
        .current_dir(worktree)
        .output()
        .await;
    match output {
        Ok(output) if output.status.success() => {
            String::from_utf8_lossy(&output.stdout).into_owned()
        }
        Ok(output) => {
            warn!(status = %output.status, "git diff failed; recording empty diff");
            String::new()
        }
        Err(err) => {
            warn!(error = %err, "git diff could not be run; recording empty diff");
            String::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::LogSource;
    use codexflow_core::{ExecSettings, ReasoningDepth, RunPaths, TaskKind, TaskRecord, TaskRole};
    use std::sync::Arc;
    use tempfile::TempDir;
    use tokio_util::sync::CancellationToken;

    fn test_ctx(dir: &TempDir) -> ExecutionContext {
        let paths = RunPaths::for_run(dir.path(), "run-1");
        ExecutionContext {
            worktree_path: dir.path().to_path_buf(),
            run_id: "run-1".to_string(),
            run_root: paths.run_root.clone(),
            task: TaskRecord::new(
                "IMPL-run-1",
                "run-1",
                TaskKind::Impl,
                TaskRole::Implementer,
                "Implement",
                "p",
            ),
            role: TaskRole::Implementer,
            model: None,
            reasoning_depth: ReasoningDepth::Low,
            on_log: Arc::new(|_: &str, _: LogSource| {}),
            cancellation: CancellationToken::new(),
            settings: ExecSettings::default(),
        }
    }

    #[tokio::test]
    async fn test_lock_acquire_and_release() {
        let dir = TempDir::new().unwrap();
        let ctx = test_ctx(&dir);
        let lock_path = dir.path().join("locks").join("implementer.lock");

        {
            let _lock = ImplementerLock::acquire(&lock_path, &ctx).await.unwrap();
            assert!(lock_path.is_file());
            // Record of the holder is written into the file.
            let contents = std::fs::read_to_string(&lock_path).unwrap();
            assert!(contents.contains("IMPL-run-1"));
        }
        assert!(!lock_path.exists());
    }

    #[tokio::test]
    async fn test_lock_waits_until_cancelled() {
        let dir = TempDir::new().unwrap();
        let ctx = test_ctx(&dir);
        let lock_path = dir.path().join("locks").join("implementer.lock");

        let _held = ImplementerLock::acquire(&lock_path, &ctx).await.unwrap();

        // A second acquire spins until its token is cancelled.
        let mut blocked_ctx = test_ctx(&dir);
        blocked_ctx.cancellation = CancellationToken::new();
        blocked_ctx.cancellation.cancel();
        let err = ImplementerLock::acquire(&lock_path, &blocked_ctx)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("cancelled"));
    }

    #[tokio::test]
    async fn test_git_diff_degrades_outside_a_repo() {
        let dir = TempDir::new().unwrap();
        let diff = capture_git_diff(dir.path()).await;
        assert!(diff.is_empty());
    }
}
