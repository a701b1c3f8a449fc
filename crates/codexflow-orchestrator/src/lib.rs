//! Orchestration layer of the codexflow kernel.
//!
//! Role workers claim tasks from the filesystem-backed claim store and run
//! them through executors; the supervisor reconciles the desired worker set
//! per worktree; the coordinator owns run state, seeds and expands the task
//! DAG, and republishes snapshots over the event bus.
//!
//! # Main types
//!
//! - [`RoleWorker`] — One `(role, index)` claim/execute loop.
//! - [`WorkerSupervisor`] — Maintains the desired worker set per run.
//! - [`Coordinator`] — Command surface: runs, approvals, comments, snapshots.

/// Coordinator: run state and the external command surface.
pub mod coordinator;
/// Role worker loop and artifact persistence.
pub mod worker;
/// Worker supervisor and the executor factory.
pub mod supervisor;

pub use coordinator::{CommentRequest, Coordinator, FollowUpRequest, StartRunRequest, WorkerConfigUpdate, WorktreeResolver};
pub use supervisor::{default_executor_factory, ExecutorFactory, WorkerRuntimeContext, WorkerSupervisor};
pub use worker::{persist_artifacts, resolve_status_override, RoleWorker, RoleWorkerSpec};
