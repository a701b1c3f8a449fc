//! Filesystem persistence for the codexflow kernel.
//!
//! The task store owns the on-disk representation of a run: one JSON file per
//! task under per-kind buckets, append-only conversation files, and the lock
//! namespace used by the claim protocol. Other components read through the
//! store and mutate only through the claim store.
//!
//! # Main types
//!
//! - [`TaskStore`] — Load, write, seed, and expand task files.
//! - [`ClaimStore`] — Atomic claim/release of tasks via lock directories.
//! - [`TaskWatcher`] — Debounced filesystem watcher re-emitting snapshots.
//! - [`RunContext`] — Briefing context workflow expansion renders prompts from.

/// Claim protocol: lock directories, finalization, counters, stale sweep.
pub mod claim;
/// Append-only per-task conversation files.
pub mod conversation;
/// Workflow expansion planner (pure) and its application.
pub mod expansion;
/// Role prompt templates.
pub mod prompts;
/// Task file storage.
pub mod task_store;
/// Debounced task directory watcher.
pub mod watcher;

pub use claim::{ClaimCountersSnapshot, ClaimStore, ClaimedTask, FinalizeUpdates};
pub use conversation::append_conversation_entry;
pub use expansion::{plan_expansion, ExpansionPlan, RunContext};
pub use task_store::{TaskEntry, TaskStore};
pub use watcher::TaskWatcher;
