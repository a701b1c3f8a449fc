use chrono::Utc;
use codexflow_core::{
    CodexflowError, CodexflowResult, EventBus, ExecSettings, KernelEvent, OutcomeDocument,
    OutcomeStatus, ReasoningDepth, RunPaths, TaskRole, TaskStatus, WorkerOutcome, WorkerState,
    WorkerStatus,
};
use codexflow_exec::{
    normalize_chunk, ExecutionContext, ExecutionResult, Executor, LogSink, LogSource, LogTail,
};
use codexflow_store::{ClaimStore, ClaimedTask, FinalizeUpdates};
use parking_lot::Mutex;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Idle sleep between claim attempts.
pub const POLL_INTERVAL: Duration = Duration::from_millis(500);
/// Interval between heartbeat publications.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(2);

/// Construction parameters for one worker slot.
#[derive(Debug, Clone)]
pub struct RoleWorkerSpec {
    /// Worker id, `<role>-<index>`.
    pub id: String,
    /// Role this worker claims tasks for.
    pub role: TaskRole,
    /// 1-based slot index.
    pub index: u32,
    /// Model the worker pins the CLI to, if any.
    pub model: Option<String>,
    /// Reasoning depth resolved from the environment.
    pub reasoning_depth: ReasoningDepth,
}

/// One `(role, index)` worker: a claim/execute loop plus a heartbeat.
///
/// State machine: `waiting -> working -> waiting` on success,
/// `working -> error -> waiting` on failure, any state to `stopped` on
/// [`RoleWorker::stop`].
pub struct RoleWorker {
    spec: RoleWorkerSpec,
    worktree_id: String,
    worktree_path: PathBuf,
    run_id: String,
    paths: RunPaths,
    bus: EventBus,
    claims: Arc<ClaimStore>,
    executor: Arc<dyn Executor>,
    settings: ExecSettings,
    cancel: CancellationToken,
    status: Arc<Mutex<WorkerStatus>>,
    tail: Arc<Mutex<LogTail>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl RoleWorker {
    /// Create a worker. Call [`RoleWorker::start`] to spawn its loops.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        spec: RoleWorkerSpec,
        worktree_id: String,
        worktree_path: PathBuf,
        run_id: String,
        paths: RunPaths,
        bus: EventBus,
        claims: Arc<ClaimStore>,
        executor: Arc<dyn Executor>,
        settings: ExecSettings,
    ) -> Arc<Self> {
        let status = WorkerStatus::waiting(
            spec.id.clone(),
            spec.role,
            spec.model.clone(),
            spec.reasoning_depth,
        );
        Arc::new(Self {
            spec,
            worktree_id,
            worktree_path,
            run_id,
            paths,
            bus,
            claims,
            executor,
            settings,
            cancel: CancellationToken::new(),
            status: Arc::new(Mutex::new(status)),
            tail: Arc::new(Mutex::new(LogTail::new())),
            handles: Mutex::new(Vec::new()),
        })
    }

    /// The worker's construction spec.
    pub fn spec(&self) -> &RoleWorkerSpec {
        &self.spec
    }

    /// Snapshot of the current status.
    pub fn status(&self) -> WorkerStatus {
        self.status.lock().clone()
    }

    /// Spawn the claim loop and the heartbeat.
    pub fn start(self: &Arc<Self>) {
        let mut handles = self.handles.lock();
        if !handles.is_empty() {
            return;
        }
        info!(worker_id = %self.spec.id, role = %self.spec.role, "worker starting");
        let loop_worker = Arc::clone(self);
        handles.push(tokio::spawn(async move { loop_worker.run_loop().await }));
        let heartbeat_worker = Arc::clone(self);
        handles.push(tokio::spawn(async move { heartbeat_worker.heartbeat().await }));
        self.publish_status();
    }

    /// Cancel the loops, await their exit, and publish `stopped`.
    pub async fn stop(&self) {
        self.cancel.cancel();
        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.handles.lock());
        for handle in handles {
            let _ = handle.await;
        }
        self.set_state(WorkerState::Stopped, "Stopped");
        info!(worker_id = %self.spec.id, "worker stopped");
    }

    async fn run_loop(self: Arc<Self>) {
        loop {
            if self.cancel.is_cancelled() {
                break;
            }

            let claim = match self.claims.claim_next(self.spec.role) {
                Ok(claim) => claim,
                Err(err) => {
                    warn!(worker_id = %self.spec.id, error = %err, "claim attempt failed");
                    None
                }
            };

            let Some(claim) = claim else {
                if self.status.lock().state != WorkerState::Waiting {
                    self.set_state(WorkerState::Waiting, "Waiting for tasks");
                }
                tokio::select! {
                    () = tokio::time::sleep(POLL_INTERVAL) => {}
                    () = self.cancel.cancelled() => break,
                }
                continue;
            };

            self.set_state(
                WorkerState::Working,
                format!("Working on {}", claim.record.title),
            );
            let token = self.cancel.child_token();
            match self.execute_claim(&claim, token.clone()).await {
                Ok(result) => match persist_artifacts(&self.paths, &claim.record.id, &result) {
                    Ok((artifacts, worker_outcome)) => {
                        let status =
                            resolve_status_override(result.outcome.as_ref().map(|o| o.status), self.spec.role);
                        let updates = FinalizeUpdates {
                            summary: Some(result.summary.clone()),
                            artifacts,
                            worker_outcome,
                            status,
                        };
                        match self.claims.mark_done(&claim, updates) {
                            Ok(Some(record)) => {
                                debug!(worker_id = %self.spec.id, task_id = %record.id, status = %record.status, "task finalized");
                            }
                            Ok(None) => {
                                warn!(worker_id = %self.spec.id, task_id = %claim.record.id, "finalization dropped: claim went stale");
                            }
                            Err(err) => {
                                error!(worker_id = %self.spec.id, error = %err, "finalization failed");
                            }
                        }
                        self.set_state(WorkerState::Waiting, "Waiting for tasks");
                    }
                    Err(err) => self.fail_claim(&claim, &err).await,
                },
                Err(err) => {
                    if token.is_cancelled() || self.cancel.is_cancelled() {
                        // Stopping: drop the claim without marking failure.
                        self.claims.release(&claim);
                        break;
                    }
                    self.fail_claim(&claim, &err).await;
                }
            }
        }
        self.set_state(WorkerState::Stopped, "Stopped");
    }

    async fn execute_claim(
        &self,
        claim: &ClaimedTask,
        token: CancellationToken,
    ) -> CodexflowResult<ExecutionResult> {
        let ctx = ExecutionContext {
            worktree_path: self.worktree_path.clone(),
            run_id: self.run_id.clone(),
            run_root: self.paths.run_root.clone(),
            task: claim.record.clone(),
            role: self.spec.role,
            model: self.spec.model.clone(),
            reasoning_depth: self.spec.reasoning_depth,
            on_log: self.log_sink(),
            cancellation: token,
            settings: self.settings.clone(),
        };
        self.executor.execute(ctx).await
    }

    async fn fail_claim(&self, claim: &ClaimedTask, err: &CodexflowError) {
        let message = err.to_string();
        error!(worker_id = %self.spec.id, task_id = %claim.record.id, error = %message, "task failed");
        if let Err(mark_err) = self.claims.mark_blocked(claim, &message) {
            error!(worker_id = %self.spec.id, error = %mark_err, "mark_blocked failed");
        }
        self.set_state(WorkerState::Error, message);
        tokio::select! {
            () = tokio::time::sleep(POLL_INTERVAL) => {}
            () = self.cancel.cancelled() => {}
        }
    }

    async fn heartbeat(self: Arc<Self>) {
        loop {
            tokio::select! {
                () = tokio::time::sleep(HEARTBEAT_INTERVAL) => {}
                () = self.cancel.cancelled() => break,
            }
            self.status.lock().last_heartbeat_at = Some(Utc::now());
            self.publish_status();
        }
    }

    /// Sink normalising executor chunks into the rolling tail and worker-log
    /// events.
    fn log_sink(&self) -> LogSink {
        let bus = self.bus.clone();
        let worktree_id = self.worktree_id.clone();
        let worker_id = self.spec.id.clone();
        let status = Arc::clone(&self.status);
        let tail = Arc::clone(&self.tail);
        Arc::new(move |chunk: &str, _source: LogSource| {
            let normalised = normalize_chunk(chunk);
            if normalised.is_empty() {
                return;
            }
            {
                let mut tail = tail.lock();
                tail.push(&normalised);
                status.lock().log_tail = tail.contents().to_string();
            }
            bus.publish(&KernelEvent::WorkerLog {
                worktree_id: worktree_id.clone(),
                worker_id: worker_id.clone(),
                chunk: normalised,
            });
        })
    }

    fn set_state(&self, state: WorkerState, description: impl Into<String>) {
        {
            let mut status = self.status.lock();
            status.state = state;
            status.description = description.into();
            status.updated_at = Utc::now();
        }
        self.publish_status();
    }

    fn publish_status(&self) {
        self.bus.publish(&KernelEvent::WorkersUpdated {
            worktree_id: self.worktree_id.clone(),
            workers: vec![self.status()],
        });
    }
}

/// Status override derived from a structured outcome.
///
/// `blocked` and `changes_requested` always override; `ok` maps to
/// `approved` only for reviewers. Everything else finalizes as `done`.
pub fn resolve_status_override(outcome: Option<OutcomeStatus>, role: TaskRole) -> Option<TaskStatus> {
    match outcome {
        Some(OutcomeStatus::Blocked) => Some(TaskStatus::Blocked),
        Some(OutcomeStatus::ChangesRequested) => Some(TaskStatus::ChangesRequested),
        Some(OutcomeStatus::Ok) if role == TaskRole::Reviewer => Some(TaskStatus::Approved),
        _ => None,
    }
}

/// Write executor artifacts under the run root and materialise the outcome
/// document.
///
/// Every artifact path is validated against traversal before anything is
/// written; a single escaping path fails the whole persistence step.
pub fn persist_artifacts(
    paths: &RunPaths,
    task_id: &str,
    result: &ExecutionResult,
) -> CodexflowResult<(Vec<String>, Option<WorkerOutcome>)> {
    let mut recorded = Vec::new();
    for artifact in &result.artifacts {
        let rel = sanitize_artifact_path(&artifact.path)?;
        let dest = paths.run_root.join(&rel);
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&dest, &artifact.contents)?;
        recorded.push(rel);
    }

    let worker_outcome = match &result.outcome {
        Some(payload) => {
            let rel = RunPaths::outcome_document_rel(task_id);
            let dest = paths.run_root.join(&rel);
            if let Some(parent) = dest.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let mut text = serde_json::to_string_pretty(&OutcomeDocument::from_payload(payload))?;
            text.push('\n');
            std::fs::write(&dest, text)?;
            Some(WorkerOutcome::from_payload(payload, Some(rel)))
        }
        None => None,
    };

    Ok((recorded, worker_outcome))
}

fn sanitize_artifact_path(path: &str) -> CodexflowResult<String> {
    let escape = || CodexflowError::PathEscape(format!("artifact path '{path}' escapes run root"));
    if path.trim().is_empty() || Path::new(path).is_absolute() {
        return Err(escape());
    }
    let mut parts: Vec<&str> = Vec::new();
    for component in Path::new(path).components() {
        match component {
            Component::Normal(part) => parts.push(part.to_str().ok_or_else(escape)?),
            Component::CurDir => {}
            _ => return Err(escape()),
        }
    }
    if parts.is_empty() {
        return Err(escape());
    }
    Ok(parts.join("/"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use codexflow_core::{OutcomePayload, TaskKind, TaskRecord};
    use codexflow_store::TaskStore;
    use tempfile::TempDir;

    struct FixedExecutor {
        result: std::sync::Mutex<Option<CodexflowResult<ExecutionResult>>>,
    }

    impl FixedExecutor {
        fn ok(result: ExecutionResult) -> Arc<Self> {
            Arc::new(Self {
                result: std::sync::Mutex::new(Some(Ok(result))),
            })
        }

        fn failing(message: &str) -> Arc<Self> {
            Arc::new(Self {
                result: std::sync::Mutex::new(Some(Err(CodexflowError::Executor(
                    message.to_string(),
                )))),
            })
        }
    }

    #[async_trait]
    impl Executor for FixedExecutor {
        async fn execute(&self, _ctx: ExecutionContext) -> CodexflowResult<ExecutionResult> {
            self.result
                .lock()
                .unwrap()
                .take()
                .unwrap_or_else(|| Ok(ExecutionResult::default()))
        }
    }

    fn harness(executor: Arc<dyn Executor>) -> (TempDir, Arc<ClaimStore>, Arc<RoleWorker>, TaskStore) {
        let dir = TempDir::new().unwrap();
        let paths = RunPaths::for_run(dir.path(), "run-1");
        let store = TaskStore::new(paths.clone());
        store.ensure_layout().unwrap();
        let claims = Arc::new(ClaimStore::new(store.clone()));
        let worker = RoleWorker::new(
            RoleWorkerSpec {
                id: "reviewer-1".to_string(),
                role: TaskRole::Reviewer,
                index: 1,
                model: None,
                reasoning_depth: ReasoningDepth::Low,
            },
            "wt-1".to_string(),
            dir.path().to_path_buf(),
            "run-1".to_string(),
            paths,
            EventBus::new(),
            Arc::clone(&claims),
            executor,
            ExecSettings::default(),
        );
        (dir, claims, worker, store)
    }

    fn review_task() -> TaskRecord {
        TaskRecord::new(
            "REVIEW-run-1",
            "run-1",
            TaskKind::Review,
            TaskRole::Reviewer,
            "Review",
            "p",
        )
        .with_approvals_required(1)
    }

    async fn wait_for_status(store: &TaskStore, task_id: &str, status: TaskStatus) -> TaskRecord {
        for _ in 0..100 {
            if let Some(entry) = store.find_entry(task_id).unwrap() {
                if entry.record.status == status {
                    return entry.record;
                }
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("task {task_id} never reached {status}");
    }

    #[test]
    fn test_resolve_status_override_mapping() {
        assert_eq!(
            resolve_status_override(Some(OutcomeStatus::Blocked), TaskRole::AnalystA),
            Some(TaskStatus::Blocked)
        );
        assert_eq!(
            resolve_status_override(Some(OutcomeStatus::ChangesRequested), TaskRole::Reviewer),
            Some(TaskStatus::ChangesRequested)
        );
        assert_eq!(
            resolve_status_override(Some(OutcomeStatus::Ok), TaskRole::Reviewer),
            Some(TaskStatus::Approved)
        );
        assert_eq!(resolve_status_override(Some(OutcomeStatus::Ok), TaskRole::Implementer), None);
        assert_eq!(resolve_status_override(None, TaskRole::Reviewer), None);
    }

    #[test]
    fn test_sanitize_rejects_traversal_and_absolute() {
        assert!(sanitize_artifact_path("../escape.txt").is_err());
        assert!(sanitize_artifact_path("/etc/passwd").is_err());
        assert!(sanitize_artifact_path("a/../../b").is_err());
        assert!(sanitize_artifact_path("").is_err());
        assert_eq!(
            sanitize_artifact_path("./artifacts/x.diff").unwrap(),
            "artifacts/x.diff"
        );
    }

    #[test]
    fn test_persist_artifacts_writes_outcome_document() {
        let dir = TempDir::new().unwrap();
        let paths = RunPaths::for_run(dir.path(), "run-1");
        let result = ExecutionResult {
            summary: "LGTM".to_string(),
            artifacts: vec![],
            outcome: Some(OutcomePayload {
                status: OutcomeStatus::Ok,
                summary: "LGTM".to_string(),
                details: None,
            }),
        };

        let (recorded, outcome) = persist_artifacts(&paths, "REVIEW-1", &result).unwrap();
        assert!(recorded.is_empty());
        let outcome = outcome.unwrap();
        assert_eq!(outcome.status, OutcomeStatus::Ok);
        assert_eq!(
            outcome.document_path.as_deref(),
            Some("artifacts/REVIEW-1.outcome.json")
        );

        let doc_text =
            std::fs::read_to_string(paths.run_root.join("artifacts/REVIEW-1.outcome.json")).unwrap();
        let doc: serde_json::Value = serde_json::from_str(&doc_text).unwrap();
        assert_eq!(doc["status"], "OK");
        assert_eq!(doc["summary"], "LGTM");
    }

    #[test]
    fn test_persist_artifacts_rejects_escape_without_writing() {
        let dir = TempDir::new().unwrap();
        let paths = RunPaths::for_run(dir.path(), "run-1");
        let result = ExecutionResult {
            summary: "oops".to_string(),
            artifacts: vec![codexflow_exec::ExecutionArtifact {
                path: "../escape.txt".to_string(),
                contents: "x".to_string(),
            }],
            outcome: None,
        };

        let err = persist_artifacts(&paths, "T-1", &result).unwrap_err();
        assert!(err.to_string().contains("escapes run root"));
        assert!(!dir.path().join("codex-runs").join("escape.txt").exists());
        assert!(!dir.path().join("escape.txt").exists());
    }

    #[tokio::test]
    async fn test_reviewer_ok_outcome_approves_task() {
        let executor = FixedExecutor::ok(ExecutionResult {
            summary: "LGTM".to_string(),
            artifacts: vec![],
            outcome: Some(OutcomePayload {
                status: OutcomeStatus::Ok,
                summary: "LGTM".to_string(),
                details: None,
            }),
        });
        let (_dir, _claims, worker, store) = harness(executor);
        store.write_task(&review_task()).unwrap();

        worker.start();
        let record = wait_for_status(&store, "REVIEW-run-1", TaskStatus::Approved).await;
        worker.stop().await;

        let outcome = record.worker_outcome.unwrap();
        assert_eq!(outcome.status, OutcomeStatus::Ok);
        let doc_path = store
            .paths()
            .run_root
            .join(outcome.document_path.unwrap());
        let doc: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(doc_path).unwrap()).unwrap();
        assert_eq!(doc["status"], "OK");
        assert_eq!(doc["summary"], "LGTM");
    }

    #[tokio::test]
    async fn test_reviewer_changes_requested_outcome() {
        let executor = FixedExecutor::ok(ExecutionResult {
            summary: "needs work".to_string(),
            artifacts: vec![],
            outcome: Some(OutcomePayload {
                status: OutcomeStatus::ChangesRequested,
                summary: "needs work".to_string(),
                details: None,
            }),
        });
        let (_dir, _claims, worker, store) = harness(executor);
        store.write_task(&review_task()).unwrap();

        worker.start();
        let record =
            wait_for_status(&store, "REVIEW-run-1", TaskStatus::ChangesRequested).await;
        worker.stop().await;
        assert_eq!(record.worker_outcome.unwrap().status, OutcomeStatus::ChangesRequested);
    }

    #[tokio::test]
    async fn test_escaping_artifact_blocks_task() {
        let executor = FixedExecutor::ok(ExecutionResult {
            summary: "bad artifact".to_string(),
            artifacts: vec![codexflow_exec::ExecutionArtifact {
                path: "../escape.txt".to_string(),
                contents: "x".to_string(),
            }],
            outcome: None,
        });
        let (dir, _claims, worker, store) = harness(executor);
        store.write_task(&review_task()).unwrap();

        worker.start();
        let record = wait_for_status(&store, "REVIEW-run-1", TaskStatus::Blocked).await;
        worker.stop().await;

        assert!(record.summary.unwrap().contains("escapes run root"));
        assert!(!dir.path().join("escape.txt").exists());
    }

    #[tokio::test]
    async fn test_executor_failure_blocks_task_and_worker_recovers() {
        let executor = FixedExecutor::failing("the CLI exploded");
        let (_dir, _claims, worker, store) = harness(executor);
        store.write_task(&review_task()).unwrap();

        worker.start();
        let record = wait_for_status(&store, "REVIEW-run-1", TaskStatus::Blocked).await;
        assert!(record.summary.unwrap().contains("the CLI exploded"));
        worker.stop().await;
        assert_eq!(worker.status().state, WorkerState::Stopped);
    }

    #[tokio::test]
    async fn test_stop_publishes_stopped_state() {
        let executor = FixedExecutor::ok(ExecutionResult::default());
        let (_dir, _claims, worker, _store) = harness(executor);
        worker.start();
        tokio::time::sleep(Duration::from_millis(100)).await;
        worker.stop().await;
        assert_eq!(worker.status().state, WorkerState::Stopped);
    }
}
