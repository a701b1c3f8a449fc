use crate::supervisor::{WorkerRuntimeContext, WorkerSupervisor};
use chrono::Utc;
use codexflow_core::{
    CodexflowError, CodexflowResult, EventBus, ExecSettings, KernelEvent, RoleWorkerConfig,
    RunMode, RunPaths, RunSnapshot, RunStatus, RunSummary, Subscription, TaskRecord, TaskRole,
    WorkerState, WorkerStatus,
};
use codexflow_store::{append_conversation_entry, ClaimStore, RunContext, TaskStore, TaskWatcher};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

/// Default analyst seed count.
const DEFAULT_ANALYST_COUNT: u32 = 2;
/// Default bug hunter seed count.
const DEFAULT_BUG_HUNTER_COUNT: u32 = 2;

/// Resolves a worktree id to its absolute path (provided by the shell's
/// worktree registry).
pub type WorktreeResolver = Arc<dyn Fn(&str) -> Option<PathBuf> + Send + Sync>;

/// Briefing submitted to start a run.
#[derive(Debug, Clone, Deserialize)]
pub struct StartRunRequest {
    /// Feature (or hunt) description.
    pub description: String,
    /// Optional extra guidance.
    #[serde(default)]
    pub guidance: Option<String>,
    /// Pipeline mode.
    #[serde(default)]
    pub mode: RunMode,
    /// Whether to start the configured workers immediately.
    #[serde(default)]
    pub auto_start_workers: bool,
    /// Analyst seed count override.
    #[serde(default)]
    pub analysis_count: Option<u32>,
    /// Bug hunter seed count override.
    #[serde(default)]
    pub bug_hunter_count: Option<u32>,
}

/// A follow-up amendment to a running briefing.
#[derive(Debug, Clone, Deserialize)]
pub struct FollowUpRequest {
    /// Updated description.
    pub description: String,
    /// Updated guidance.
    #[serde(default)]
    pub guidance: Option<String>,
}

/// A comment to append to a task conversation.
#[derive(Debug, Clone, Deserialize)]
pub struct CommentRequest {
    /// Task the comment belongs to.
    pub task_id: String,
    /// Comment author.
    pub author: String,
    /// Comment body.
    pub message: String,
}

/// A desired worker configuration change, as submitted by the shell.
///
/// Counts are accepted as signed and clamped to zero; priority lists are
/// truncated to the model priority limit.
#[derive(Debug, Clone, Deserialize)]
pub struct WorkerConfigUpdate {
    /// Role to configure.
    pub role: TaskRole,
    /// Desired worker count (clamped to >= 0).
    pub count: i64,
    /// Preferred model per slot.
    #[serde(default)]
    pub model_priority: Vec<String>,
}

enum InternalEvent {
    Workers {
        worktree_id: String,
        workers: Vec<WorkerStatus>,
    },
    Tasks {
        worktree_id: String,
        tasks: Vec<TaskRecord>,
    },
}

struct RunState {
    summary: RunSummary,
    ctx: RunContext,
    store: TaskStore,
    tasks: Vec<TaskRecord>,
    workers: HashMap<String, WorkerStatus>,
    worker_configurations: Vec<RoleWorkerConfig>,
    implementer_lock_holder: Option<String>,
    watcher: Option<TaskWatcher>,
}

impl RunState {
    fn snapshot(&self) -> RunSnapshot {
        let mut workers: Vec<WorkerStatus> = self.workers.values().cloned().collect();
        workers.sort_by(|a, b| a.id.cmp(&b.id));
        RunSnapshot {
            run: self.summary.clone(),
            tasks: self.tasks.clone(),
            workers,
            implementer_lock_holder: self.implementer_lock_holder.clone(),
            worker_configurations: self.worker_configurations.clone(),
        }
    }
}

struct CoordinatorInner {
    bus: EventBus,
    supervisor: Arc<WorkerSupervisor>,
    settings: ExecSettings,
    resolver: WorktreeResolver,
    runs: Mutex<HashMap<String, RunState>>,
    events_tx: mpsc::UnboundedSender<InternalEvent>,
    dispatcher: parking_lot::Mutex<Option<JoinHandle<()>>>,
    _subscription: Subscription,
}

/// Owns per-worktree run state and exposes the kernel's command surface.
///
/// The coordinator holds the bus and invokes the supervisor; the supervisor
/// publishes only to the bus; the coordinator subscribes to the bus to track
/// worker state (including the implementer lock holder). No component stores
/// a back-reference, so the graph stays acyclic.
pub struct Coordinator {
    inner: Arc<CoordinatorInner>,
}

impl Coordinator {
    /// Wire a coordinator to a bus and supervisor.
    pub fn new(
        bus: EventBus,
        supervisor: Arc<WorkerSupervisor>,
        settings: ExecSettings,
        resolver: WorktreeResolver,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let subscription = bus.subscribe({
            let tx = events_tx.clone();
            move |event| {
                if let KernelEvent::WorkersUpdated {
                    worktree_id,
                    workers,
                } = event
                {
                    let _ = tx.send(InternalEvent::Workers {
                        worktree_id: worktree_id.clone(),
                        workers: workers.clone(),
                    });
                }
            }
        });

        let inner = Arc::new(CoordinatorInner {
            bus,
            supervisor,
            settings,
            resolver,
            runs: Mutex::new(HashMap::new()),
            events_tx,
            dispatcher: parking_lot::Mutex::new(None),
            _subscription: subscription,
        });

        let weak = Arc::downgrade(&inner);
        let handle = tokio::spawn(dispatch_loop(weak, events_rx));
        *inner.dispatcher.lock() = Some(handle);

        Self { inner }
    }

    /// Start (or replace) a run for a worktree: seed analysts, publish the
    /// initial snapshot, and start the task watcher.
    pub async fn start_run(
        &self,
        worktree_id: &str,
        request: StartRunRequest,
    ) -> CodexflowResult<RunSummary> {
        let description = request.description.trim().to_string();
        if description.is_empty() {
            return Err(CodexflowError::InvalidInput(
                "briefing description must not be empty".to_string(),
            ));
        }
        let worktree_path = (self.inner.resolver)(worktree_id)
            .ok_or_else(|| CodexflowError::NotFound(format!("worktree {worktree_id}")))?;

        let run_id = Uuid::new_v4().to_string();
        let paths = RunPaths::for_run(&worktree_path, &run_id);
        let store = TaskStore::new(paths.clone());
        store.ensure_layout()?;

        // Startup lock policy: sweep claim locks older than the threshold.
        let swept = ClaimStore::new(store.clone())
            .sweep_stale_locks(Duration::from_secs(self.inner.settings.stale_lock_secs))?;
        if swept > 0 {
            warn!(run_id = %run_id, swept, "stale claim locks removed at startup");
        }

        let ctx = RunContext {
            run_id: run_id.clone(),
            description: description.clone(),
            guidance: request
                .guidance
                .as_deref()
                .map(str::trim)
                .filter(|g| !g.is_empty())
                .map(str::to_string),
            mode: request.mode,
            analyst_count: request.analysis_count.unwrap_or(DEFAULT_ANALYST_COUNT),
            bug_hunter_count: request.bug_hunter_count.unwrap_or(DEFAULT_BUG_HUNTER_COUNT),
        };
        store.ensure_analysis_seeds(&ctx)?;

        let now = Utc::now();
        let summary = RunSummary {
            run_id: run_id.clone(),
            worktree_id: worktree_id.to_string(),
            description,
            guidance: ctx.guidance.clone(),
            mode: ctx.mode,
            status: RunStatus::Running,
            created_at: now,
            updated_at: now,
            run_root: paths.run_root.clone(),
            tasks_root: paths.tasks_root.clone(),
            conversation_root: paths.conversation_root.clone(),
        };

        let mut state = RunState {
            summary: summary.clone(),
            ctx,
            store: store.clone(),
            tasks: store.load_tasks()?,
            workers: HashMap::new(),
            worker_configurations: default_worker_configurations(),
            implementer_lock_holder: None,
            watcher: None,
        };

        {
            let mut runs = self.inner.runs.lock().await;
            // Stop any prior watcher by dropping the previous run state.
            if runs.remove(worktree_id).is_some() {
                info!(worktree_id = %worktree_id, "replacing existing run");
            }

            self.inner.bus.publish(&KernelEvent::Snapshot {
                worktree_id: worktree_id.to_string(),
                snapshot: state.snapshot(),
            });
            self.inner.bus.publish(&KernelEvent::RunStatus {
                worktree_id: worktree_id.to_string(),
                run_id: run_id.clone(),
                status: RunStatus::Running,
            });

            let tx = self.inner.events_tx.clone();
            let watch_worktree = worktree_id.to_string();
            state.watcher = Some(TaskWatcher::start(store, move |tasks| {
                let _ = tx.send(InternalEvent::Tasks {
                    worktree_id: watch_worktree.clone(),
                    tasks,
                });
            })?);

            runs.insert(worktree_id.to_string(), state);
        }

        self.inner
            .supervisor
            .register_context(WorkerRuntimeContext {
                worktree_id: worktree_id.to_string(),
                worktree_path,
                run_id: run_id.clone(),
                paths,
            })
            .await;
        if request.auto_start_workers {
            self.start_workers(worktree_id).await?;
        }

        info!(worktree_id = %worktree_id, run_id = %run_id, "run started");
        Ok(summary)
    }

    /// Amend the briefing of an existing run and mark it running again.
    pub async fn submit_follow_up(
        &self,
        worktree_id: &str,
        request: FollowUpRequest,
    ) -> CodexflowResult<RunSummary> {
        let description = request.description.trim().to_string();
        if description.is_empty() {
            return Err(CodexflowError::InvalidInput(
                "follow-up description must not be empty".to_string(),
            ));
        }
        let mut runs = self.inner.runs.lock().await;
        let state = run_state_mut(&mut runs, worktree_id)?;

        state.summary.description = description.clone();
        state.summary.guidance = request.guidance.clone();
        state.summary.status = RunStatus::Running;
        state.summary.updated_at = Utc::now();
        state.ctx.description = description;
        state.ctx.guidance = request.guidance;

        self.inner.bus.publish(&KernelEvent::RunStatus {
            worktree_id: worktree_id.to_string(),
            run_id: state.summary.run_id.clone(),
            status: RunStatus::Running,
        });
        self.inner.bus.publish(&KernelEvent::Snapshot {
            worktree_id: worktree_id.to_string(),
            snapshot: state.snapshot(),
        });
        Ok(state.summary.clone())
    }

    /// Record an external approval on a task.
    pub async fn approve_task(
        &self,
        worktree_id: &str,
        task_id: &str,
        approver: &str,
    ) -> CodexflowResult<TaskRecord> {
        let mut runs = self.inner.runs.lock().await;
        let state = run_state_mut(&mut runs, worktree_id)?;

        let record = state.store.approve_task(task_id, approver)?;
        merge_task(&mut state.tasks, record.clone());
        self.inner.run_expansion(worktree_id, state);
        Ok(record)
    }

    /// Append a comment to a task's conversation.
    pub async fn add_comment(
        &self,
        worktree_id: &str,
        request: CommentRequest,
    ) -> CodexflowResult<()> {
        let runs = self.inner.runs.lock().await;
        let state = run_state(&runs, worktree_id)?;
        if !state.tasks.iter().any(|t| t.id == request.task_id) {
            return Err(CodexflowError::NotFound(format!("task {}", request.task_id)));
        }

        append_conversation_entry(
            state.store.paths(),
            &request.task_id,
            &request.author,
            &request.message,
        )?;
        self.inner.bus.publish(&KernelEvent::ConversationAppended {
            worktree_id: worktree_id.to_string(),
            task_id: request.task_id,
            author: request.author.trim().to_string(),
            message: request.message.trim().to_string(),
        });
        Ok(())
    }

    /// Deep copy of the current run state, if a run exists.
    pub async fn get_snapshot(&self, worktree_id: &str) -> Option<RunSnapshot> {
        let runs = self.inner.runs.lock().await;
        runs.get(worktree_id).map(RunState::snapshot)
    }

    /// Current desired worker configurations.
    pub async fn get_worker_configurations(
        &self,
        worktree_id: &str,
    ) -> CodexflowResult<Vec<RoleWorkerConfig>> {
        let runs = self.inner.runs.lock().await;
        Ok(run_state(&runs, worktree_id)?.worker_configurations.clone())
    }

    /// Update desired worker counts and model priorities.
    ///
    /// Counts are clamped to zero, priority lists truncated to the limit. If
    /// workers are currently running the supervisor is reconciled right away;
    /// otherwise the configuration applies at the next worker start.
    pub async fn update_worker_configurations(
        &self,
        worktree_id: &str,
        updates: Vec<WorkerConfigUpdate>,
    ) -> CodexflowResult<Vec<RoleWorkerConfig>> {
        let configs = {
            let mut runs = self.inner.runs.lock().await;
            let state = run_state_mut(&mut runs, worktree_id)?;
            for update in updates {
                let sanitized =
                    RoleWorkerConfig::sanitized(update.role, update.count, update.model_priority);
                match state
                    .worker_configurations
                    .iter_mut()
                    .find(|c| c.role == sanitized.role)
                {
                    Some(existing) => *existing = sanitized,
                    None => state.worker_configurations.push(sanitized),
                }
            }
            let configs = state.worker_configurations.clone();
            self.inner.bus.publish(&KernelEvent::Snapshot {
                worktree_id: worktree_id.to_string(),
                snapshot: state.snapshot(),
            });
            configs
        };

        if !self.inner.supervisor.get_statuses(worktree_id).await.is_empty() {
            self.inner.supervisor.configure(worktree_id, &configs).await?;
        }
        Ok(configs)
    }

    /// Start (or reconcile) the configured workers.
    pub async fn start_workers(&self, worktree_id: &str) -> CodexflowResult<()> {
        let configs = self.get_worker_configurations(worktree_id).await?;
        self.inner.supervisor.configure(worktree_id, &configs).await
    }

    /// Stop every worker of the worktree.
    pub async fn stop_workers(&self, worktree_id: &str) {
        self.inner.supervisor.stop_all(worktree_id).await;
    }

    /// Stop the run: halt workers and the watcher, mark the run stopped.
    pub async fn stop_run(&self, worktree_id: &str) -> CodexflowResult<RunSummary> {
        let summary = {
            let mut runs = self.inner.runs.lock().await;
            let state = run_state_mut(&mut runs, worktree_id)?;
            state.watcher = None;
            state.summary.status = RunStatus::Stopped;
            state.summary.updated_at = Utc::now();
            self.inner.bus.publish(&KernelEvent::RunStatus {
                worktree_id: worktree_id.to_string(),
                run_id: state.summary.run_id.clone(),
                status: RunStatus::Stopped,
            });
            self.inner.bus.publish(&KernelEvent::Snapshot {
                worktree_id: worktree_id.to_string(),
                snapshot: state.snapshot(),
            });
            state.summary.clone()
        };
        self.inner.supervisor.stop_all(worktree_id).await;
        Ok(summary)
    }

    /// The worktree is gone: drop all run state and workers.
    pub async fn handle_worktree_removed(&self, worktree_id: &str) {
        self.inner.runs.lock().await.remove(worktree_id);
        self.inner.supervisor.remove_worktree(worktree_id).await;
        info!(worktree_id = %worktree_id, "worktree removed; run state dropped");
    }

    /// Tear down every run and the internal dispatcher.
    pub async fn dispose(&self) {
        let worktree_ids: Vec<String> = {
            let mut runs = self.inner.runs.lock().await;
            let ids = runs.keys().cloned().collect();
            runs.clear();
            ids
        };
        for worktree_id in worktree_ids {
            self.inner.supervisor.remove_worktree(&worktree_id).await;
        }
        if let Some(handle) = self.inner.dispatcher.lock().take() {
            handle.abort();
        }
    }
}

impl CoordinatorInner {
    async fn handle_workers_updated(&self, worktree_id: &str, workers: Vec<WorkerStatus>) {
        let mut runs = self.runs.lock().await;
        let Some(state) = runs.get_mut(worktree_id) else {
            return;
        };

        let mut lock_changed = false;
        for status in workers {
            if status.role == TaskRole::Implementer {
                match status.state {
                    WorkerState::Working => {
                        if state.implementer_lock_holder.as_deref() != Some(status.id.as_str()) {
                            state.implementer_lock_holder = Some(status.id.clone());
                            lock_changed = true;
                        }
                    }
                    WorkerState::Waiting | WorkerState::Stopped | WorkerState::Error => {
                        if state.implementer_lock_holder.as_deref() == Some(status.id.as_str()) {
                            state.implementer_lock_holder = None;
                            lock_changed = true;
                        }
                    }
                }
            }
            state.workers.insert(status.id.clone(), status);
        }

        if lock_changed {
            self.bus.publish(&KernelEvent::Snapshot {
                worktree_id: worktree_id.to_string(),
                snapshot: state.snapshot(),
            });
        }
    }

    async fn handle_tasks_changed(&self, worktree_id: &str, tasks: Vec<TaskRecord>) {
        let mut runs = self.runs.lock().await;
        let Some(state) = runs.get_mut(worktree_id) else {
            return;
        };

        state.tasks = tasks.clone();
        self.bus.publish(&KernelEvent::TasksUpdated {
            worktree_id: worktree_id.to_string(),
            tasks,
        });
        self.run_expansion(worktree_id, state);
    }

    /// Apply workflow expansion, refresh run status, and republish the
    /// snapshot.
    fn run_expansion(&self, worktree_id: &str, state: &mut RunState) {
        match state.store.ensure_workflow_expansion(&state.ctx) {
            Ok((tasks, mutated)) => {
                if mutated {
                    state.tasks = tasks;
                }
            }
            Err(err) => warn!(worktree_id = %worktree_id, error = %err, "workflow expansion failed"),
        }

        if state.summary.status == RunStatus::Running
            && !state.tasks.is_empty()
            && state
                .tasks
                .iter()
                .all(|t| t.status.satisfies_dependency())
        {
            state.summary.status = RunStatus::Completed;
            state.summary.updated_at = Utc::now();
            self.bus.publish(&KernelEvent::RunStatus {
                worktree_id: worktree_id.to_string(),
                run_id: state.summary.run_id.clone(),
                status: RunStatus::Completed,
            });
        }

        self.bus.publish(&KernelEvent::Snapshot {
            worktree_id: worktree_id.to_string(),
            snapshot: state.snapshot(),
        });
    }
}

async fn dispatch_loop(
    weak: Weak<CoordinatorInner>,
    mut events_rx: mpsc::UnboundedReceiver<InternalEvent>,
) {
    while let Some(event) = events_rx.recv().await {
        let Some(inner) = weak.upgrade() else { break };
        match event {
            InternalEvent::Workers {
                worktree_id,
                workers,
            } => inner.handle_workers_updated(&worktree_id, workers).await,
            InternalEvent::Tasks { worktree_id, tasks } => {
                inner.handle_tasks_changed(&worktree_id, tasks).await;
            }
        }
    }
}

fn run_state<'a>(
    runs: &'a HashMap<String, RunState>,
    worktree_id: &str,
) -> CodexflowResult<&'a RunState> {
    runs.get(worktree_id)
        .ok_or_else(|| CodexflowError::NotFound(format!("no run for worktree {worktree_id}")))
}

fn run_state_mut<'a>(
    runs: &'a mut HashMap<String, RunState>,
    worktree_id: &str,
) -> CodexflowResult<&'a mut RunState> {
    runs.get_mut(worktree_id)
        .ok_or_else(|| CodexflowError::NotFound(format!("no run for worktree {worktree_id}")))
}

fn merge_task(tasks: &mut Vec<TaskRecord>, record: TaskRecord) {
    match tasks.iter_mut().find(|t| t.id == record.id) {
        Some(existing) => *existing = record,
        None => tasks.push(record),
    }
}

fn default_worker_configurations() -> Vec<RoleWorkerConfig> {
    TaskRole::all()
        .into_iter()
        .map(|role| RoleWorkerConfig {
            role,
            count: 1,
            model_priority: Vec::new(),
        })
        .collect()
}
