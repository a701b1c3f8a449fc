use crate::task_store::{TaskEntry, TaskStore};
use chrono::Utc;
use codexflow_core::{CodexflowResult, TaskRecord, TaskRole, TaskStatus, WorkerOutcome};
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, warn};

/// Observable tally of claim store activity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ClaimCountersSnapshot {
    /// Claims that reached `in_progress`.
    pub claims_succeeded: u64,
    /// Lock directories that already existed.
    pub claim_conflicts: u64,
    /// Explicit releases without finalization.
    pub releases: u64,
    /// I/O failures and rejected stale finalizations.
    pub failures: u64,
}

#[derive(Debug, Default)]
struct ClaimCounters {
    claims_succeeded: AtomicU64,
    claim_conflicts: AtomicU64,
    releases: AtomicU64,
    failures: AtomicU64,
}

/// An exclusive reservation of one task, materialised as a lock directory.
#[derive(Debug)]
pub struct ClaimedTask {
    /// The record as written at claim time (`in_progress`).
    pub record: TaskRecord,
    /// Path of the task JSON file.
    pub path: PathBuf,
    /// Path of the held lock directory.
    pub lock_path: PathBuf,
    /// Role that holds the claim.
    pub role: TaskRole,
}

/// Updates applied when a claim is finalized as done.
#[derive(Debug, Default)]
pub struct FinalizeUpdates {
    /// New task summary.
    pub summary: Option<String>,
    /// Worktree-relative artifact paths to record.
    pub artifacts: Vec<String>,
    /// Structured verdict to record.
    pub worker_outcome: Option<WorkerOutcome>,
    /// Status override; `done` when absent.
    pub status: Option<TaskStatus>,
}

/// Ensures each ready task is executed by at most one worker at a time,
/// without a central broker.
///
/// The mutex primitive is atomic directory creation: a claim is the
/// `<taskFile>.lock` directory, and finalization re-checks on-disk ownership
/// (`in_progress` and a matching `last_claimed_by`) so a stale claim can
/// never overwrite a newer one.
pub struct ClaimStore {
    store: TaskStore,
    counters: ClaimCounters,
}

impl ClaimStore {
    /// Create a claim store over a task store.
    pub fn new(store: TaskStore) -> Self {
        Self {
            store,
            counters: ClaimCounters::default(),
        }
    }

    /// The underlying task store.
    pub fn store(&self) -> &TaskStore {
        &self.store
    }

    /// Current counter values.
    pub fn counters(&self) -> ClaimCountersSnapshot {
        ClaimCountersSnapshot {
            claims_succeeded: self.counters.claims_succeeded.load(Ordering::Relaxed),
            claim_conflicts: self.counters.claim_conflicts.load(Ordering::Relaxed),
            releases: self.counters.releases.load(Ordering::Relaxed),
            failures: self.counters.failures.load(Ordering::Relaxed),
        }
    }

    /// Claim the oldest ready task for `role` whose dependencies are all done
    /// or approved. Returns `None` when nothing is claimable.
    pub fn claim_next(&self, role: TaskRole) -> CodexflowResult<Option<ClaimedTask>> {
        let entries = self.store.read_task_entries()?;
        let statuses: HashMap<String, TaskStatus> = entries
            .iter()
            .map(|entry| (entry.record.id.clone(), entry.record.status))
            .collect();

        let mut candidates: Vec<&TaskEntry> = entries
            .iter()
            .filter(|entry| {
                entry.record.role == role
                    && entry.record.status == TaskStatus::Ready
                    && entry.record.dependencies_satisfied(&statuses)
            })
            .collect();
        candidates.sort_by(|a, b| a.record.created_at.cmp(&b.record.created_at));

        for entry in candidates {
            let lock_path = lock_path_for(&entry.path);
            match std::fs::create_dir(&lock_path) {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                    self.counters.claim_conflicts.fetch_add(1, Ordering::Relaxed);
                    continue;
                }
                Err(err) => {
                    self.counters.failures.fetch_add(1, Ordering::Relaxed);
                    warn!(path = %lock_path.display(), error = %err, "lock creation failed");
                    continue;
                }
            }

            // Holding the lock; re-check the record before mutating it.
            let current = match self.store.read_entry_at(&entry.path) {
                Ok(Some(current)) => current,
                Ok(None) => {
                    remove_lock(&lock_path);
                    continue;
                }
                Err(err) => {
                    self.counters.failures.fetch_add(1, Ordering::Relaxed);
                    warn!(path = %entry.path.display(), error = %err, "re-read under lock failed");
                    remove_lock(&lock_path);
                    continue;
                }
            };
            if current.record.status != TaskStatus::Ready {
                remove_lock(&lock_path);
                continue;
            }

            let mut record = current.record;
            record.status = TaskStatus::InProgress;
            record.last_claimed_by = Some(role);
            record.updated_at = Utc::now();
            if let Err(err) = self.store.write_task_at(&entry.path, &record) {
                self.counters.failures.fetch_add(1, Ordering::Relaxed);
                warn!(path = %entry.path.display(), error = %err, "claim write failed");
                remove_lock(&lock_path);
                continue;
            }

            self.counters.claims_succeeded.fetch_add(1, Ordering::Relaxed);
            debug!(task_id = %record.id, role = %role, "task claimed");
            return Ok(Some(ClaimedTask {
                record,
                path: entry.path.clone(),
                lock_path,
                role,
            }));
        }

        Ok(None)
    }

    /// Finalize a claim. Returns the written record, or `None` when the
    /// on-disk record no longer shows this claim's ownership (the claim is
    /// dropped without mutating anything).
    pub fn mark_done(
        &self,
        claim: &ClaimedTask,
        updates: FinalizeUpdates,
    ) -> CodexflowResult<Option<TaskRecord>> {
        let Some(mut record) = self.owned_record(claim)? else {
            return Ok(None);
        };

        if let Some(summary) = updates.summary {
            record.summary = Some(summary);
        }
        for artifact in updates.artifacts {
            if !record.artifacts.contains(&artifact) {
                record.artifacts.push(artifact);
            }
        }
        if updates.worker_outcome.is_some() {
            record.worker_outcome = updates.worker_outcome;
        }
        record.status = updates.status.unwrap_or(TaskStatus::Done);
        record.updated_at = Utc::now();

        self.store.write_task_at(&claim.path, &record)?;
        remove_lock(&claim.lock_path);
        debug!(task_id = %record.id, status = %record.status, "task finalized");
        Ok(Some(record))
    }

    /// Finalize a claim as blocked with a message.
    pub fn mark_blocked(
        &self,
        claim: &ClaimedTask,
        message: &str,
    ) -> CodexflowResult<Option<TaskRecord>> {
        let Some(mut record) = self.owned_record(claim)? else {
            return Ok(None);
        };
        record.status = TaskStatus::Blocked;
        record.summary = Some(message.to_string());
        record.updated_at = Utc::now();

        self.store.write_task_at(&claim.path, &record)?;
        remove_lock(&claim.lock_path);
        warn!(task_id = %record.id, message = %message, "task blocked");
        Ok(Some(record))
    }

    /// Drop a claim without mutating the record (cancelled worker).
    pub fn release(&self, claim: &ClaimedTask) {
        remove_lock(&claim.lock_path);
        self.counters.releases.fetch_add(1, Ordering::Relaxed);
        debug!(task_id = %claim.record.id, "claim released");
    }

    /// Remove lock directories older than `max_age` and re-open orphaned
    /// `in_progress` tasks. Returns the number of locks removed.
    pub fn sweep_stale_locks(&self, max_age: Duration) -> CodexflowResult<usize> {
        let tasks_root = self.store.paths().tasks_root.clone();
        let mut removed = 0;
        for bucket in crate::task_store::ALL_BUCKETS {
            let dir = tasks_root.join(bucket);
            let read_dir = match std::fs::read_dir(&dir) {
                Ok(rd) => rd,
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => continue,
                Err(err) => return Err(err.into()),
            };
            for dirent in read_dir {
                let path = dirent?.path();
                let is_lock = path.is_dir()
                    && path
                        .file_name()
                        .and_then(|n| n.to_str())
                        .is_some_and(|n| n.ends_with(".json.lock"));
                if !is_lock {
                    continue;
                }
                let age = std::fs::metadata(&path)
                    .and_then(|m| m.modified())
                    .ok()
                    .and_then(|t| t.elapsed().ok());
                if age.is_some_and(|age| age >= max_age) {
                    warn!(path = %path.display(), "removing stale claim lock");
                    if std::fs::remove_dir_all(&path).is_ok() {
                        removed += 1;
                    }
                }
            }
        }

        // Tasks left in_progress with no lock can never finalize; re-open them.
        for entry in self.store.read_task_entries()? {
            if entry.record.status != TaskStatus::InProgress {
                continue;
            }
            if lock_path_for(&entry.path).exists() {
                continue;
            }
            let mut record = entry.record;
            warn!(task_id = %record.id, "re-opening orphaned in_progress task");
            record.status = TaskStatus::Ready;
            record.last_claimed_by = None;
            record.updated_at = Utc::now();
            self.store.write_task_at(&entry.path, &record)?;
        }

        Ok(removed)
    }

    /// Re-read the claimed record and verify ownership. Stale claims are
    /// counted as failures and yield `None`.
    fn owned_record(&self, claim: &ClaimedTask) -> CodexflowResult<Option<TaskRecord>> {
        let current = match self.store.read_entry_at(&claim.path) {
            Ok(Some(current)) => current,
            Ok(None) => {
                self.counters.failures.fetch_add(1, Ordering::Relaxed);
                warn!(task_id = %claim.record.id, "claimed task file vanished; dropping claim");
                return Ok(None);
            }
            Err(err) => {
                self.counters.failures.fetch_add(1, Ordering::Relaxed);
                warn!(task_id = %claim.record.id, error = %err, "claimed task unreadable; dropping claim");
                return Ok(None);
            }
        };
        if current.record.status != TaskStatus::InProgress
            || current.record.last_claimed_by != Some(claim.role)
        {
            self.counters.failures.fetch_add(1, Ordering::Relaxed);
            warn!(
                task_id = %claim.record.id,
                status = %current.record.status,
                "ownership check failed; dropping stale claim"
            );
            return Ok(None);
        }
        Ok(Some(current.record))
    }
}

fn lock_path_for(path: &Path) -> PathBuf {
    let mut os = path.as_os_str().to_os_string();
    os.push(".lock");
    PathBuf::from(os)
}

fn remove_lock(lock_path: &Path) {
    if let Err(err) = std::fs::remove_dir(lock_path) {
        if err.kind() != std::io::ErrorKind::NotFound {
            warn!(path = %lock_path.display(), error = %err, "lock removal failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use codexflow_core::{RunPaths, TaskKind};
    use std::sync::Arc;
    use tempfile::TempDir;

    fn test_claims() -> (TempDir, Arc<ClaimStore>) {
        let dir = TempDir::new().unwrap();
        let store = TaskStore::new(RunPaths::for_run(dir.path(), "run-1"));
        store.ensure_layout().unwrap();
        (dir, Arc::new(ClaimStore::new(store)))
    }

    fn ready_task(id: &str, kind: TaskKind, role: TaskRole) -> TaskRecord {
        TaskRecord::new(id, "run-1", kind, role, id, "prompt")
    }

    #[test]
    fn test_claim_next_claims_ready_task() {
        let (_dir, claims) = test_claims();
        claims
            .store()
            .write_task(&ready_task("A-1", TaskKind::Analysis, TaskRole::AnalystA))
            .unwrap();

        let claim = claims.claim_next(TaskRole::AnalystA).unwrap().unwrap();
        assert_eq!(claim.record.id, "A-1");
        assert_eq!(claim.record.status, TaskStatus::InProgress);
        assert_eq!(claim.record.last_claimed_by, Some(TaskRole::AnalystA));
        assert!(claim.lock_path.is_dir());

        // The same role sees nothing else to claim.
        assert!(claims.claim_next(TaskRole::AnalystA).unwrap().is_none());
        assert_eq!(claims.counters().claims_succeeded, 1);
    }

    #[test]
    fn test_claim_next_ignores_other_roles() {
        let (_dir, claims) = test_claims();
        claims
            .store()
            .write_task(&ready_task("A-1", TaskKind::Analysis, TaskRole::AnalystA))
            .unwrap();
        assert!(claims.claim_next(TaskRole::Tester).unwrap().is_none());
    }

    #[test]
    fn test_dependency_gating() {
        let (_dir, claims) = test_claims();
        let splitter = ready_task("SPLIT-run-1", TaskKind::Analysis, TaskRole::Splitter);
        claims.store().write_task(&splitter).unwrap();
        claims
            .store()
            .write_task(
                &ready_task("IMPL-run-1", TaskKind::Impl, TaskRole::Implementer)
                    .with_depends_on(vec!["SPLIT-run-1".to_string()]),
            )
            .unwrap();

        // Splitter not done: implementer has nothing.
        assert!(claims.claim_next(TaskRole::Implementer).unwrap().is_none());

        let entry = claims.store().find_entry("SPLIT-run-1").unwrap().unwrap();
        let mut record = entry.record;
        record.status = TaskStatus::Done;
        claims.store().write_task_at(&entry.path, &record).unwrap();

        let claim = claims.claim_next(TaskRole::Implementer).unwrap().unwrap();
        assert_eq!(claim.record.id, "IMPL-run-1");
    }

    #[test]
    fn test_missing_dependency_blocks_claim() {
        let (_dir, claims) = test_claims();
        claims
            .store()
            .write_task(
                &ready_task("IMPL-run-1", TaskKind::Impl, TaskRole::Implementer)
                    .with_depends_on(vec!["GHOST".to_string()]),
            )
            .unwrap();
        assert!(claims.claim_next(TaskRole::Implementer).unwrap().is_none());
    }

    #[test]
    fn test_existing_lock_is_a_conflict() {
        let (_dir, claims) = test_claims();
        let task = ready_task("A-1", TaskKind::Analysis, TaskRole::AnalystA);
        let path = claims.store().write_task(&task).unwrap();
        std::fs::create_dir(lock_path_for(&path)).unwrap();

        assert!(claims.claim_next(TaskRole::AnalystA).unwrap().is_none());
        let counters = claims.counters();
        assert_eq!(counters.claims_succeeded, 0);
        assert!(counters.claim_conflicts >= 1);
    }

    #[test]
    fn test_two_workers_one_task() {
        let (_dir, claims) = test_claims();
        claims
            .store()
            .write_task(&ready_task("A-1", TaskKind::Analysis, TaskRole::AnalystA))
            .unwrap();

        let mut handles = Vec::new();
        for _ in 0..2 {
            let claims = Arc::clone(&claims);
            handles.push(std::thread::spawn(move || {
                claims.claim_next(TaskRole::AnalystA).unwrap()
            }));
        }
        let results: Vec<Option<ClaimedTask>> =
            handles.into_iter().map(|h| h.join().unwrap()).collect();

        let claimed: Vec<&ClaimedTask> = results.iter().flatten().collect();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claims.counters().claims_succeeded, 1);

        let done = claims
            .mark_done(claimed[0], FinalizeUpdates::default())
            .unwrap()
            .unwrap();
        assert_eq!(done.status, TaskStatus::Done);
    }

    #[test]
    fn test_mark_done_applies_updates() {
        let (_dir, claims) = test_claims();
        claims
            .store()
            .write_task(&ready_task("A-1", TaskKind::Analysis, TaskRole::AnalystA))
            .unwrap();
        let claim = claims.claim_next(TaskRole::AnalystA).unwrap().unwrap();

        let record = claims
            .mark_done(
                &claim,
                FinalizeUpdates {
                    summary: Some("analysed".to_string()),
                    artifacts: vec!["artifacts/A-1.md".to_string()],
                    worker_outcome: None,
                    status: None,
                },
            )
            .unwrap()
            .unwrap();
        assert_eq!(record.status, TaskStatus::Done);
        assert_eq!(record.summary.as_deref(), Some("analysed"));
        assert_eq!(record.artifacts, vec!["artifacts/A-1.md"]);
        assert!(!claim.lock_path.exists());
    }

    #[test]
    fn test_mark_done_rejects_stale_claim() {
        let (_dir, claims) = test_claims();
        claims
            .store()
            .write_task(&ready_task("A-1", TaskKind::Analysis, TaskRole::AnalystA))
            .unwrap();
        let claim = claims.claim_next(TaskRole::AnalystA).unwrap().unwrap();

        // An operator cleared the lock and the task was re-claimed elsewhere.
        let mut record = claim.record.clone();
        record.last_claimed_by = Some(TaskRole::AnalystB);
        claims.store().write_task_at(&claim.path, &record).unwrap();

        let result = claims
            .mark_done(&claim, FinalizeUpdates::default())
            .unwrap();
        assert!(result.is_none());
        assert!(claims.counters().failures >= 1);

        // The other claimant's record is untouched.
        let current = claims.store().find_entry("A-1").unwrap().unwrap();
        assert_eq!(current.record.last_claimed_by, Some(TaskRole::AnalystB));
        assert_eq!(current.record.status, TaskStatus::InProgress);
    }

    #[test]
    fn test_mark_blocked_sets_message() {
        let (_dir, claims) = test_claims();
        claims
            .store()
            .write_task(&ready_task("A-1", TaskKind::Analysis, TaskRole::AnalystA))
            .unwrap();
        let claim = claims.claim_next(TaskRole::AnalystA).unwrap().unwrap();

        let record = claims.mark_blocked(&claim, "executor exploded").unwrap().unwrap();
        assert_eq!(record.status, TaskStatus::Blocked);
        assert_eq!(record.summary.as_deref(), Some("executor exploded"));
        assert!(!claim.lock_path.exists());
    }

    #[test]
    fn test_release_leaves_record_in_progress() {
        let (_dir, claims) = test_claims();
        claims
            .store()
            .write_task(&ready_task("A-1", TaskKind::Analysis, TaskRole::AnalystA))
            .unwrap();
        let claim = claims.claim_next(TaskRole::AnalystA).unwrap().unwrap();

        claims.release(&claim);
        assert!(!claim.lock_path.exists());
        assert_eq!(claims.counters().releases, 1);

        let current = claims.store().find_entry("A-1").unwrap().unwrap();
        assert_eq!(current.record.status, TaskStatus::InProgress);
    }

    #[test]
    fn test_sweep_reopens_orphaned_in_progress() {
        let (_dir, claims) = test_claims();
        let mut task = ready_task("A-1", TaskKind::Analysis, TaskRole::AnalystA);
        task.status = TaskStatus::InProgress;
        task.last_claimed_by = Some(TaskRole::AnalystA);
        claims.store().write_task(&task).unwrap();

        claims.sweep_stale_locks(Duration::from_secs(0)).unwrap();

        let current = claims.store().find_entry("A-1").unwrap().unwrap();
        assert_eq!(current.record.status, TaskStatus::Ready);
        assert_eq!(current.record.last_claimed_by, None);
    }

    #[test]
    fn test_sweep_removes_old_locks() {
        let (_dir, claims) = test_claims();
        let task = ready_task("A-1", TaskKind::Analysis, TaskRole::AnalystA);
        let path = claims.store().write_task(&task).unwrap();
        std::fs::create_dir(lock_path_for(&path)).unwrap();

        let removed = claims.sweep_stale_locks(Duration::from_secs(0)).unwrap();
        assert_eq!(removed, 1);
        assert!(!lock_path_for(&path).exists());
    }
}
