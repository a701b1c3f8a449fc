use chrono::{SecondsFormat, Utc};
use codexflow_core::{CodexflowError, CodexflowResult, RunPaths};
use std::io::Write;
use std::path::PathBuf;

/// Append one markdown block to a task's conversation file.
///
/// The file is append-only; each comment gets a header line with an ISO
/// timestamp and the author. Concurrent appends interleave whole blocks,
/// which is acceptable for a conversation log.
pub fn append_conversation_entry(
    paths: &RunPaths,
    task_id: &str,
    author: &str,
    message: &str,
) -> CodexflowResult<PathBuf> {
    let author = author.trim();
    let message = message.trim();
    if author.is_empty() {
        return Err(CodexflowError::InvalidInput("comment author must not be empty".to_string()));
    }
    if message.is_empty() {
        return Err(CodexflowError::InvalidInput("comment message must not be empty".to_string()));
    }

    std::fs::create_dir_all(&paths.conversation_root)?;
    let path = paths.conversation_file(task_id);
    let timestamp = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);

    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)?;
    writeln!(file, "### {timestamp} {author}")?;
    writeln!(file)?;
    writeln!(file, "{message}")?;
    writeln!(file)?;

    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn paths() -> (TempDir, RunPaths) {
        let dir = TempDir::new().unwrap();
        let paths = RunPaths::for_run(dir.path(), "run-1");
        (dir, paths)
    }

    #[test]
    fn test_append_creates_file_with_header() {
        let (_dir, paths) = paths();
        let path = append_conversation_entry(&paths, "T-1", "alice", "looks wrong").unwrap();
        let text = std::fs::read_to_string(path).unwrap();
        assert!(text.starts_with("### "));
        assert!(text.contains("alice"));
        assert!(text.contains("looks wrong"));
    }

    #[test]
    fn test_append_is_append_only() {
        let (_dir, paths) = paths();
        append_conversation_entry(&paths, "T-1", "alice", "first").unwrap();
        let path = append_conversation_entry(&paths, "T-1", "bob", "second").unwrap();
        let text = std::fs::read_to_string(path).unwrap();
        let first = text.find("first").unwrap();
        let second = text.find("second").unwrap();
        assert!(first < second);
    }

    #[test]
    fn test_empty_author_or_message_rejected() {
        let (_dir, paths) = paths();
        assert!(matches!(
            append_conversation_entry(&paths, "T-1", " ", "msg"),
            Err(CodexflowError::InvalidInput(_))
        ));
        assert!(matches!(
            append_conversation_entry(&paths, "T-1", "alice", "\n"),
            Err(CodexflowError::InvalidInput(_))
        ));
    }
}
