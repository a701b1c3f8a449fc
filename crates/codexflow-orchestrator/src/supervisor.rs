use crate::worker::{RoleWorker, RoleWorkerSpec};
use codexflow_core::{
    CodexflowError, CodexflowResult, EventBus, ExecSettings, RoleWorkerConfig, RunPaths, TaskRole,
    WorkerStatus,
};
use codexflow_exec::{CliExecutor, Executor, ImplementerExecutor, TestExecutor};
use codexflow_store::{ClaimStore, TaskStore};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Runtime context a worktree's workers operate in.
#[derive(Debug, Clone)]
pub struct WorkerRuntimeContext {
    /// Worktree identifier.
    pub worktree_id: String,
    /// Absolute worktree path.
    pub worktree_path: PathBuf,
    /// Run identifier.
    pub run_id: String,
    /// Run directory layout.
    pub paths: RunPaths,
}

/// Produces the executor for a role within a runtime context.
pub type ExecutorFactory =
    Arc<dyn Fn(TaskRole, &WorkerRuntimeContext, &ExecSettings) -> Arc<dyn Executor> + Send + Sync>;

/// The default role-to-executor wiring: the implementer executor (with the
/// run's lock path) for `implementer`, the test executor for `tester`, and
/// the generic CLI executor for everything else.
pub fn default_executor_factory() -> ExecutorFactory {
    Arc::new(|role, ctx, _settings| match role {
        TaskRole::Implementer => Arc::new(ImplementerExecutor::new(ctx.paths.implementer_lock())),
        TaskRole::Tester => Arc::new(TestExecutor::new()),
        _ => Arc::new(CliExecutor::new()),
    })
}

struct SupervisedWorktree {
    ctx: WorkerRuntimeContext,
    claims: Arc<ClaimStore>,
    workers: BTreeMap<String, Arc<RoleWorker>>,
}

/// Maintains the desired worker set per `(worktree, role)`.
///
/// Reconciliation is idempotent: a worker whose `(role, index, model)` is
/// unchanged keeps running; a model change stops and replaces the slot;
/// slots beyond the desired count are stopped and removed.
pub struct WorkerSupervisor {
    bus: EventBus,
    settings: ExecSettings,
    factory: ExecutorFactory,
    state: Mutex<HashMap<String, SupervisedWorktree>>,
}

impl WorkerSupervisor {
    /// Supervisor with the default executor factory.
    pub fn new(bus: EventBus, settings: ExecSettings) -> Self {
        Self::with_factory(bus, settings, default_executor_factory())
    }

    /// Supervisor with a custom executor factory (tests, alternative CLIs).
    pub fn with_factory(bus: EventBus, settings: ExecSettings, factory: ExecutorFactory) -> Self {
        Self {
            bus,
            settings,
            factory,
            state: Mutex::new(HashMap::new()),
        }
    }

    /// Set or replace the runtime context for a worktree.
    ///
    /// Existing workers are restarted against the new context so a new run's
    /// paths propagate to every slot.
    pub async fn register_context(&self, ctx: WorkerRuntimeContext) {
        let mut state = self.state.lock().await;
        let store = TaskStore::new(ctx.paths.clone());
        let claims = Arc::new(ClaimStore::new(store));

        if let Some(existing) = state.get_mut(&ctx.worktree_id) {
            let specs: Vec<RoleWorkerSpec> = existing
                .workers
                .values()
                .map(|w| w.spec().clone())
                .collect();
            for worker in std::mem::take(&mut existing.workers).into_values() {
                worker.stop().await;
            }
            existing.ctx = ctx.clone();
            existing.claims = Arc::clone(&claims);
            for spec in specs {
                let worker = self.spawn_worker(spec, &ctx, Arc::clone(&claims));
                existing.workers.insert(worker.spec().id.clone(), worker);
            }
            info!(worktree_id = %ctx.worktree_id, run_id = %ctx.run_id, "runtime context replaced");
        } else {
            state.insert(
                ctx.worktree_id.clone(),
                SupervisedWorktree {
                    ctx,
                    claims,
                    workers: BTreeMap::new(),
                },
            );
        }
    }

    /// Reconcile the worker set of a worktree against `configs`.
    pub async fn configure(
        &self,
        worktree_id: &str,
        configs: &[RoleWorkerConfig],
    ) -> CodexflowResult<()> {
        let mut state = self.state.lock().await;
        let entry = state.get_mut(worktree_id).ok_or_else(|| {
            CodexflowError::NotFound(format!("no runtime context for worktree {worktree_id}"))
        })?;

        let ctx = entry.ctx.clone();
        let desired: HashMap<TaskRole, &RoleWorkerConfig> =
            configs.iter().map(|c| (c.role, c)).collect();
        let mut roles: HashSet<TaskRole> = desired.keys().copied().collect();
        for worker in entry.workers.values() {
            roles.insert(worker.spec().role);
        }

        for role in roles {
            let config = desired.get(&role);
            let count = config.map(|c| c.count).unwrap_or(0);
            let priority: &[String] = config.map(|c| c.model_priority.as_slice()).unwrap_or(&[]);

            for index in 1..=count {
                let id = format!("{role}-{index}");
                let model = priority
                    .get(index as usize - 1)
                    .cloned()
                    .or_else(|| self.settings.default_model.clone());

                let model_matches = entry.workers.get(&id).map(|w| w.spec().model == model);
                match model_matches {
                    Some(true) => {
                        debug!(worker_id = %id, "worker unchanged; keeping");
                        continue;
                    }
                    Some(false) => {
                        info!(worker_id = %id, "model changed; replacing worker");
                        if let Some(old) = entry.workers.remove(&id) {
                            old.stop().await;
                        }
                    }
                    None => {}
                }

                let spec = RoleWorkerSpec {
                    id: id.clone(),
                    role,
                    index,
                    model,
                    reasoning_depth: self.settings.reasoning_for(role),
                };
                let worker = self.spawn_worker(spec, &ctx, Arc::clone(&entry.claims));
                entry.workers.insert(id, worker);
            }

            // Slots beyond the desired count are retired.
            let excess: Vec<String> = entry
                .workers
                .values()
                .filter(|w| w.spec().role == role && w.spec().index > count)
                .map(|w| w.spec().id.clone())
                .collect();
            for id in excess {
                if let Some(worker) = entry.workers.remove(&id) {
                    info!(worker_id = %id, "slot above desired count; stopping");
                    worker.stop().await;
                }
            }
        }

        Ok(())
    }

    /// Configure the given roles down to zero workers.
    pub async fn stop_roles(&self, worktree_id: &str, roles: &[TaskRole]) -> CodexflowResult<()> {
        let configs: Vec<RoleWorkerConfig> = roles
            .iter()
            .map(|role| RoleWorkerConfig {
                role: *role,
                count: 0,
                model_priority: Vec::new(),
            })
            .collect();
        self.configure(worktree_id, &configs).await
    }

    /// Stop every worker of a worktree.
    pub async fn stop_all(&self, worktree_id: &str) {
        let mut state = self.state.lock().await;
        if let Some(entry) = state.get_mut(worktree_id) {
            for worker in std::mem::take(&mut entry.workers).into_values() {
                worker.stop().await;
            }
        }
    }

    /// Stop every worker and forget the worktree entirely.
    pub async fn remove_worktree(&self, worktree_id: &str) {
        let removed = self.state.lock().await.remove(worktree_id);
        if let Some(entry) = removed {
            for worker in entry.workers.into_values() {
                worker.stop().await;
            }
        }
    }

    /// Snapshot of the current workers of a worktree.
    pub async fn get_statuses(&self, worktree_id: &str) -> Vec<WorkerStatus> {
        let state = self.state.lock().await;
        state
            .get(worktree_id)
            .map(|entry| entry.workers.values().map(|w| w.status()).collect())
            .unwrap_or_default()
    }

    /// The claim store shared by a worktree's workers (counters surface).
    pub async fn claim_store(&self, worktree_id: &str) -> Option<Arc<ClaimStore>> {
        let state = self.state.lock().await;
        state.get(worktree_id).map(|entry| Arc::clone(&entry.claims))
    }

    fn spawn_worker(
        &self,
        spec: RoleWorkerSpec,
        ctx: &WorkerRuntimeContext,
        claims: Arc<ClaimStore>,
    ) -> Arc<RoleWorker> {
        let executor = (self.factory)(spec.role, ctx, &self.settings);
        let worker = RoleWorker::new(
            spec,
            ctx.worktree_id.clone(),
            ctx.worktree_path.clone(),
            ctx.run_id.clone(),
            ctx.paths.clone(),
            self.bus.clone(),
            claims,
            executor,
            self.settings.clone(),
        );
        worker.start();
        worker
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use codexflow_exec::{ExecutionContext, ExecutionResult};
    use tempfile::TempDir;

    struct IdleExecutor;

    #[async_trait]
    impl Executor for IdleExecutor {
        async fn execute(&self, _ctx: ExecutionContext) -> CodexflowResult<ExecutionResult> {
            Ok(ExecutionResult::default())
        }
    }

    fn idle_factory() -> ExecutorFactory {
        Arc::new(|_, _, _| Arc::new(IdleExecutor))
    }

    fn test_ctx(dir: &TempDir) -> WorkerRuntimeContext {
        WorkerRuntimeContext {
            worktree_id: "wt-1".to_string(),
            worktree_path: dir.path().to_path_buf(),
            run_id: "run-1".to_string(),
            paths: RunPaths::for_run(dir.path(), "run-1"),
        }
    }

    fn supervisor() -> WorkerSupervisor {
        WorkerSupervisor::with_factory(EventBus::new(), ExecSettings::default(), idle_factory())
    }

    fn config(role: TaskRole, count: u32, priority: &[&str]) -> RoleWorkerConfig {
        RoleWorkerConfig {
            role,
            count,
            model_priority: priority.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[tokio::test]
    async fn test_configure_without_context_fails() {
        let sup = supervisor();
        let err = sup
            .configure("wt-1", &[config(TaskRole::Tester, 1, &[])])
            .await
            .unwrap_err();
        assert!(matches!(err, CodexflowError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_configure_creates_indexed_workers() {
        let dir = TempDir::new().unwrap();
        let sup = supervisor();
        sup.register_context(test_ctx(&dir)).await;
        sup.configure("wt-1", &[config(TaskRole::AnalystA, 2, &["m1", "m2"])])
            .await
            .unwrap();

        let statuses = sup.get_statuses("wt-1").await;
        assert_eq!(statuses.len(), 2);
        assert_eq!(statuses[0].id, "analyst_a-1");
        assert_eq!(statuses[0].model.as_deref(), Some("m1"));
        assert_eq!(statuses[1].id, "analyst_a-2");
        assert_eq!(statuses[1].model.as_deref(), Some("m2"));

        sup.stop_all("wt-1").await;
    }

    #[tokio::test]
    async fn test_priority_shorter_than_count_falls_back() {
        let dir = TempDir::new().unwrap();
        let mut settings = ExecSettings::default();
        settings.default_model = Some("fallback".to_string());
        let sup = WorkerSupervisor::with_factory(EventBus::new(), settings, idle_factory());
        sup.register_context(test_ctx(&dir)).await;
        sup.configure("wt-1", &[config(TaskRole::Tester, 2, &["m1"])])
            .await
            .unwrap();

        let statuses = sup.get_statuses("wt-1").await;
        assert_eq!(statuses[0].model.as_deref(), Some("m1"));
        assert_eq!(statuses[1].model.as_deref(), Some("fallback"));
        sup.stop_all("wt-1").await;
    }

    #[tokio::test]
    async fn test_configure_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let sup = supervisor();
        sup.register_context(test_ctx(&dir)).await;
        let configs = [config(TaskRole::Tester, 1, &["m1"])];
        sup.configure("wt-1", &configs).await.unwrap();
        let before = sup.get_statuses("wt-1").await;

        sup.configure("wt-1", &configs).await.unwrap();
        let after = sup.get_statuses("wt-1").await;

        // Unchanged (role, index, model): the worker was not restarted.
        assert_eq!(before.len(), 1);
        assert_eq!(after.len(), 1);
        assert_eq!(before[0].started_at, after[0].started_at);
        sup.stop_all("wt-1").await;
    }

    #[tokio::test]
    async fn test_model_change_replaces_worker() {
        let dir = TempDir::new().unwrap();
        let sup = supervisor();
        sup.register_context(test_ctx(&dir)).await;
        sup.configure("wt-1", &[config(TaskRole::Tester, 1, &["m1"])])
            .await
            .unwrap();
        let before = sup.get_statuses("wt-1").await;

        sup.configure("wt-1", &[config(TaskRole::Tester, 1, &["m2"])])
            .await
            .unwrap();
        let after = sup.get_statuses("wt-1").await;

        assert_eq!(after[0].model.as_deref(), Some("m2"));
        assert_ne!(before[0].started_at, after[0].started_at);
        sup.stop_all("wt-1").await;
    }

    #[tokio::test]
    async fn test_scale_down_removes_excess_slots() {
        let dir = TempDir::new().unwrap();
        let sup = supervisor();
        sup.register_context(test_ctx(&dir)).await;
        sup.configure("wt-1", &[config(TaskRole::AnalystB, 3, &[])])
            .await
            .unwrap();
        assert_eq!(sup.get_statuses("wt-1").await.len(), 3);

        sup.configure("wt-1", &[config(TaskRole::AnalystB, 1, &[])])
            .await
            .unwrap();
        let statuses = sup.get_statuses("wt-1").await;
        assert_eq!(statuses.len(), 1);
        assert_eq!(statuses[0].id, "analyst_b-1");
        sup.stop_all("wt-1").await;
    }

    #[tokio::test]
    async fn test_stop_roles_reaches_zero() {
        let dir = TempDir::new().unwrap();
        let sup = supervisor();
        sup.register_context(test_ctx(&dir)).await;
        sup.configure(
            "wt-1",
            &[config(TaskRole::Tester, 1, &[]), config(TaskRole::Reviewer, 1, &[])],
        )
        .await
        .unwrap();
        assert_eq!(sup.get_statuses("wt-1").await.len(), 2);

        sup.stop_roles("wt-1", &[TaskRole::Tester]).await.unwrap();
        let statuses = sup.get_statuses("wt-1").await;
        assert_eq!(statuses.len(), 1);
        assert_eq!(statuses[0].role, TaskRole::Reviewer);
        sup.stop_all("wt-1").await;
    }

    #[tokio::test]
    async fn test_remove_worktree_forgets_state() {
        let dir = TempDir::new().unwrap();
        let sup = supervisor();
        sup.register_context(test_ctx(&dir)).await;
        sup.configure("wt-1", &[config(TaskRole::Tester, 1, &[])])
            .await
            .unwrap();

        sup.remove_worktree("wt-1").await;
        assert!(sup.get_statuses("wt-1").await.is_empty());
        assert!(sup.claim_store("wt-1").await.is_none());
    }
}
