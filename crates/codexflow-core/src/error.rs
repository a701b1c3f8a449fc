use thiserror::Error;

/// A convenience `Result` alias using [`CodexflowError`].
pub type CodexflowResult<T> = Result<T, CodexflowError>;

/// Top-level error type for the codexflow kernel.
///
/// Each variant corresponds to a failure class the kernel distinguishes.
#[derive(Error, Debug)]
pub enum CodexflowError {
    /// An unknown worktree, run, or task was referenced.
    #[error("not found: {0}")]
    NotFound(String),

    /// A caller-supplied value failed validation (empty approver, empty
    /// comment message, malformed briefing).
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// An operation was attempted while the target is not in a compatible
    /// state.
    #[error("busy: {0}")]
    Busy(String),

    /// A child process exited non-zero, threw, or was torn down; the message
    /// is preserved and stored on the task.
    #[error("executor failure: {0}")]
    Executor(String),

    /// An artifact path would resolve outside the run root.
    #[error("path escape: {0}")]
    PathEscape(String),

    /// A task file could not be parsed. Scans log-and-skip these; the variant
    /// exists for callers that address a single file directly.
    #[error("corrupted task file: {0}")]
    Corrupted(String),

    /// The filesystem watcher could not be created or attached.
    #[error("watch error: {0}")]
    Watch(String),

    /// An error in configuration parsing or validation.
    #[error("config error: {0}")]
    Config(String),

    /// A JSON serialization or deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A standard I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_includes_message() {
        let err = CodexflowError::NotFound("worktree wt-1".to_string());
        assert_eq!(err.to_string(), "not found: worktree wt-1");

        let err = CodexflowError::PathEscape("../x escapes run root".to_string());
        assert!(err.to_string().contains("escapes run root"));
    }

    #[test]
    fn test_io_error_converts() {
        let io = std::io::Error::new(std::io::ErrorKind::Other, "boom");
        let err: CodexflowError = io.into();
        assert!(matches!(err, CodexflowError::Io(_)));
    }
}
