use async_trait::async_trait;
use codexflow_core::{
    CodexflowResult, ExecSettings, OutcomePayload, ReasoningDepth, TaskRecord, TaskRole,
};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Which stream a log chunk arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogSource {
    /// Child process stdout.
    Stdout,
    /// Child process stderr.
    Stderr,
    /// Messages produced by the executor itself.
    System,
}

/// Callback receiving raw output chunks as they arrive.
pub type LogSink = Arc<dyn Fn(&str, LogSource) + Send + Sync>;

/// Everything an executor needs to run one task.
pub struct ExecutionContext {
    /// Absolute worktree path.
    pub worktree_path: PathBuf,
    /// Run the task belongs to.
    pub run_id: String,
    /// Absolute run root (artifact resolution base).
    pub run_root: PathBuf,
    /// The claimed task.
    pub task: TaskRecord,
    /// Role executing the task.
    pub role: TaskRole,
    /// Model to pin the CLI to, if any.
    pub model: Option<String>,
    /// Reasoning depth for the CLI.
    pub reasoning_depth: ReasoningDepth,
    /// Sink for streamed output.
    pub on_log: LogSink,
    /// Cancellation signal; executors must terminate their child when it
    /// fires.
    pub cancellation: CancellationToken,
    /// Process-wide executor settings.
    pub settings: ExecSettings,
}

/// A file an executor wants persisted under the run root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionArtifact {
    /// Run-root-relative destination path.
    pub path: String,
    /// File contents.
    pub contents: String,
}

/// What an executor produced.
#[derive(Debug, Clone, Default)]
pub struct ExecutionResult {
    /// Human-readable summary of the work.
    pub summary: String,
    /// Files to persist under the run root.
    pub artifacts: Vec<ExecutionArtifact>,
    /// Structured verdict, when the executor emitted one.
    pub outcome: Option<OutcomePayload>,
}

/// Runs one task to completion.
#[async_trait]
pub trait Executor: Send + Sync {
    /// Execute the task described by `ctx`.
    ///
    /// Implementations stream output through `ctx.on_log`, observe
    /// `ctx.cancellation`, and never write outside the run root themselves;
    /// artifact persistence is the caller's job.
    async fn execute(&self, ctx: ExecutionContext) -> CodexflowResult<ExecutionResult>;
}
