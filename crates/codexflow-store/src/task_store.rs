use crate::expansion::{self, RunContext};
use chrono::Utc;
use codexflow_core::{CodexflowError, CodexflowResult, RunPaths, TaskRecord, TaskStatus};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Buckets holding live tasks, one per [`codexflow_core::TaskKind`].
pub const KIND_BUCKETS: [&str; 5] = ["analysis", "consensus", "impl", "test", "review"];
/// All buckets scanned by a task load, including the hint-only ones.
pub const ALL_BUCKETS: [&str; 7] = [
    "analysis",
    "consensus",
    "impl",
    "test",
    "review",
    "done",
    "backlog",
];

/// One task record together with its on-disk location.
#[derive(Debug, Clone)]
pub struct TaskEntry {
    /// The parsed record.
    pub record: TaskRecord,
    /// Absolute path of the JSON file.
    pub path: PathBuf,
    /// Bucket directory the file lives in.
    pub bucket: String,
}

/// Read/write access to the task files of one run.
#[derive(Debug, Clone)]
pub struct TaskStore {
    paths: RunPaths,
}

impl TaskStore {
    /// Create a store over the given run layout.
    pub fn new(paths: RunPaths) -> Self {
        Self { paths }
    }

    /// The run layout this store operates on.
    pub fn paths(&self) -> &RunPaths {
        &self.paths
    }

    /// Create the bucket directories, the conversation root, the artifacts
    /// root, and the locks root. Idempotent.
    pub fn ensure_layout(&self) -> CodexflowResult<()> {
        for bucket in ALL_BUCKETS {
            std::fs::create_dir_all(self.paths.tasks_root.join(bucket))?;
        }
        std::fs::create_dir_all(&self.paths.conversation_root)?;
        std::fs::create_dir_all(&self.paths.artifacts_root)?;
        std::fs::create_dir_all(&self.paths.locks_root)?;
        Ok(())
    }

    /// Scan all buckets and return the parsed records.
    ///
    /// Unparseable files are logged and skipped; the scan never aborts.
    pub fn load_tasks(&self) -> CodexflowResult<Vec<TaskRecord>> {
        Ok(self
            .read_task_entries()?
            .into_iter()
            .map(|entry| entry.record)
            .collect())
    }

    /// Scan all buckets and return records together with their file paths.
    pub fn read_task_entries(&self) -> CodexflowResult<Vec<TaskEntry>> {
        let mut entries = Vec::new();
        for bucket in ALL_BUCKETS {
            let dir = self.paths.tasks_root.join(bucket);
            let read_dir = match std::fs::read_dir(&dir) {
                Ok(rd) => rd,
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => continue,
                Err(err) => return Err(err.into()),
            };
            for dirent in read_dir {
                let path = dirent?.path();
                if path.extension().and_then(|e| e.to_str()) != Some("json") {
                    continue;
                }
                match self.read_entry_at(&path) {
                    Ok(Some(entry)) => entries.push(entry),
                    Ok(None) => {}
                    Err(err) => {
                        warn!(path = %path.display(), error = %err, "skipping unreadable task file");
                    }
                }
            }
        }
        entries.sort_by(|a, b| a.record.created_at.cmp(&b.record.created_at));
        Ok(entries)
    }

    /// Read one task file. Returns `Ok(None)` when the file vanished between
    /// the scan and the read.
    pub fn read_entry_at(&self, path: &Path) -> CodexflowResult<Option<TaskEntry>> {
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        let bucket = path
            .parent()
            .and_then(|p| p.file_name())
            .and_then(|n| n.to_str())
            .unwrap_or("backlog")
            .to_string();
        let stem = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or_default();
        let record = TaskRecord::from_disk_json(&text, &bucket, stem)
            .map_err(|err| CodexflowError::Corrupted(format!("{}: {err}", path.display())))?;
        Ok(Some(TaskEntry {
            record,
            path: path.to_path_buf(),
            bucket,
        }))
    }

    /// Find the entry for a task id across all buckets.
    pub fn find_entry(&self, task_id: &str) -> CodexflowResult<Option<TaskEntry>> {
        Ok(self
            .read_task_entries()?
            .into_iter()
            .find(|entry| entry.record.id == task_id))
    }

    /// Write a record into its kind bucket and return the file path.
    pub fn write_task(&self, record: &TaskRecord) -> CodexflowResult<PathBuf> {
        let path = self.paths.task_file(record.kind.bucket(), &record.id);
        self.write_task_at(&path, record)?;
        Ok(path)
    }

    /// Write a record to an explicit path.
    ///
    /// The write is whole-file with a trailing newline, followed by a
    /// directory fsync so the entry survives a crash.
    pub fn write_task_at(&self, path: &Path, record: &TaskRecord) -> CodexflowResult<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, record.to_disk_json()?)?;
        sync_parent_dir(path);
        Ok(())
    }

    /// Idempotently create the analyst seed tasks for a fresh run.
    ///
    /// Implement-feature mode seeds `analysisCount` analysts (A, B, ...);
    /// bug-hunt mode seeds `bugHunterCount` hunters. Existing files are left
    /// untouched.
    pub fn ensure_analysis_seeds(&self, ctx: &RunContext) -> CodexflowResult<Vec<TaskRecord>> {
        self.ensure_layout()?;
        let seeds = expansion::analysis_seeds(ctx);
        let mut created = Vec::new();
        for seed in seeds {
            let path = self.paths.task_file(seed.kind.bucket(), &seed.id);
            if path.exists() {
                debug!(task_id = %seed.id, "analysis seed already present");
                continue;
            }
            self.write_task_at(&path, &seed)?;
            created.push(seed);
        }
        Ok(created)
    }

    /// Apply the workflow expansion rules and the review-feedback rule.
    ///
    /// Returns the updated task list and whether anything was created or
    /// reset. Repeated invocation with identical inputs is a no-op.
    pub fn ensure_workflow_expansion(
        &self,
        ctx: &RunContext,
    ) -> CodexflowResult<(Vec<TaskRecord>, bool)> {
        let entries = self.read_task_entries()?;
        let records: Vec<TaskRecord> = entries.iter().map(|e| e.record.clone()).collect();
        let plan = expansion::plan_expansion(ctx, &records);

        let mut mutated = false;
        for record in &plan.creates {
            let path = self.paths.task_file(record.kind.bucket(), &record.id);
            if path.exists() {
                continue;
            }
            self.write_task_at(&path, record)?;
            debug!(task_id = %record.id, kind = %record.kind, "workflow expansion created task");
            mutated = true;
        }
        for task_id in &plan.resets {
            let Some(entry) = entries.iter().find(|e| e.record.id == *task_id) else {
                warn!(task_id = %task_id, "reset target not found");
                continue;
            };
            let mut record = entry.record.clone();
            record.status = TaskStatus::Ready;
            record.approvals.clear();
            record.last_claimed_by = None;
            record.updated_at = Utc::now();
            self.write_task_at(&entry.path, &record)?;
            debug!(task_id = %task_id, "review feedback reset task to ready");
            mutated = true;
        }

        if mutated {
            Ok((self.load_tasks()?, true))
        } else {
            Ok((records, false))
        }
    }

    /// Append a unique approver to a task and promote it to `approved` once
    /// the required count is met.
    ///
    /// Tasks already `done`, `blocked`, or `error` can no longer take
    /// approvals; approving them is rejected as a state conflict.
    pub fn approve_task(&self, task_id: &str, approver: &str) -> CodexflowResult<TaskRecord> {
        let approver = approver.trim();
        if approver.is_empty() {
            return Err(CodexflowError::InvalidInput("approver must not be empty".to_string()));
        }
        let entry = self
            .find_entry(task_id)?
            .ok_or_else(|| CodexflowError::NotFound(format!("task {task_id}")))?;

        let mut record = entry.record;
        if matches!(
            record.status,
            TaskStatus::Done | TaskStatus::Blocked | TaskStatus::Error
        ) {
            return Err(CodexflowError::Busy(format!(
                "task {task_id} is {}; approvals no longer apply",
                record.status
            )));
        }
        if !record.approvals.iter().any(|a| a == approver) {
            record.approvals.push(approver.to_string());
        }
        if record.status == TaskStatus::AwaitingReview
            && record.approvals.len() as u32 >= record.approvals_required
        {
            record.status = TaskStatus::Approved;
        }
        record.updated_at = Utc::now();
        self.write_task_at(&entry.path, &record)?;
        Ok(record)
    }
}

/// Fsync the parent directory of a freshly written file so the directory
/// entry is durable. Best effort; failures are logged.
fn sync_parent_dir(path: &Path) {
    #[cfg(unix)]
    if let Some(parent) = path.parent() {
        match std::fs::File::open(parent) {
            Ok(dir) => {
                if let Err(err) = dir.sync_all() {
                    warn!(dir = %parent.display(), error = %err, "directory fsync failed");
                }
            }
            Err(err) => {
                warn!(dir = %parent.display(), error = %err, "directory open for fsync failed");
            }
        }
    }
    #[cfg(not(unix))]
    let _ = path;
}
