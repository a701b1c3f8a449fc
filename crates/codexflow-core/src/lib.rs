//! Core types for the codexflow orchestration kernel.
//!
//! This crate provides the foundational types shared across all codexflow
//! crates: the error taxonomy, the task/run/worker data model, executor
//! outcome types, the in-process event bus, and the environment-driven
//! executor settings.
//!
//! # Main types
//!
//! - [`CodexflowError`] — Unified error enum for all kernel subsystems.
//! - [`CodexflowResult`] — Convenience alias for `Result<T, CodexflowError>`.
//! - [`TaskRecord`] — A single scheduled unit of work, persisted as JSON.
//! - [`RunSummary`] / [`RunPaths`] — One pipeline run and its directory layout.
//! - [`WorkerStatus`] — Live state of one role worker slot.
//! - [`EventBus`] / [`KernelEvent`] — Synchronous publish/subscribe fan-out.
//! - [`ExecSettings`] — Executor configuration resolved from the environment.

/// Error taxonomy and result alias.
pub mod error;
/// In-process event bus and kernel event payloads.
pub mod event;
/// Executor outcome types (structured verdicts and their on-disk document).
pub mod outcome;
/// Run lifecycle types and the run directory layout.
pub mod run;
/// Executor settings resolved from environment variables.
pub mod settings;
/// Task data model: kinds, roles, statuses, and the task record.
pub mod task;
/// Worker state, reasoning depth, and per-role worker configuration.
pub mod worker;

pub use error::{CodexflowError, CodexflowResult};
pub use event::{EventBus, KernelEvent, Subscription};
pub use outcome::{OutcomeDocument, OutcomePayload, OutcomeStatus, WorkerOutcome};
pub use run::{RunMode, RunPaths, RunSnapshot, RunStatus, RunSummary};
pub use settings::ExecSettings;
pub use task::{TaskKind, TaskRecord, TaskRole, TaskStatus};
pub use worker::{ReasoningDepth, RoleWorkerConfig, WorkerState, WorkerStatus};
