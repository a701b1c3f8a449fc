//! Task executors for the codexflow kernel.
//!
//! An executor runs one claimed task to completion: it spawns the AI CLI (or
//! the test command), streams output through the caller's log sink, honours
//! cancellation, and returns a summary with optional artifacts and a
//! structured outcome.
//!
//! # Main types
//!
//! - [`Executor`] — The capability trait role workers invoke.
//! - [`CliExecutor`] — Generic AI CLI executor (analyst, consensus, splitter,
//!   reviewer).
//! - [`ImplementerExecutor`] — CLI executor guarded by the per-run
//!   implementer lock; captures `git diff` as its artifact.
//! - [`TestExecutor`] — Runs the configured shell test command.
//! - [`logparse`] — Normalises the CLI's JSON event stream for display.

/// Generic AI CLI executor.
pub mod cli;
/// Executor trait, execution context, and result types.
pub mod executor;
/// Implementer executor and the per-run implementer lock.
pub mod implementer;
/// Normalisation of CLI event streams and the bounded log tail.
pub mod logparse;
/// Structured outcome extraction from executor output.
pub mod outcome;
/// Shell test command executor.
pub mod tester;

pub use cli::CliExecutor;
pub use executor::{ExecutionArtifact, ExecutionContext, ExecutionResult, Executor, LogSink, LogSource};
pub use implementer::ImplementerExecutor;
pub use logparse::{normalize_chunk, LogTail};
pub use tester::TestExecutor;
