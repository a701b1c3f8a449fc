use serde::{Deserialize, Serialize};

/// Structured verdict status emitted by an executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeStatus {
    /// The work succeeded.
    Ok,
    /// The work could not proceed.
    Blocked,
    /// A reviewer wants the chain re-opened.
    ChangesRequested,
}

impl OutcomeStatus {
    /// Code used in the on-disk outcome document.
    pub fn document_code(&self) -> &'static str {
        match self {
            OutcomeStatus::Ok => "OK",
            OutcomeStatus::Blocked => "BLOCKED",
            OutcomeStatus::ChangesRequested => "CHANGES_REQUESTED",
        }
    }

    /// Parse either the snake_case or the document form, case-insensitively.
    pub fn parse(s: &str) -> Option<OutcomeStatus> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ok" | "success" => Some(OutcomeStatus::Ok),
            "blocked" => Some(OutcomeStatus::Blocked),
            "changes_requested" => Some(OutcomeStatus::ChangesRequested),
            _ => None,
        }
    }
}

/// A structured verdict returned by an executor alongside its summary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutcomePayload {
    /// Verdict status.
    pub status: OutcomeStatus,
    /// One-line summary of the verdict.
    pub summary: String,
    /// Optional longer explanation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

/// The verdict as recorded on the task record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerOutcome {
    /// Verdict status.
    pub status: OutcomeStatus,
    /// One-line summary of the verdict.
    pub summary: String,
    /// Optional longer explanation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
    /// Run-root-relative path of the outcome document, once written.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub document_path: Option<String>,
}

impl WorkerOutcome {
    /// Build the task-record form from an executor payload.
    pub fn from_payload(payload: &OutcomePayload, document_path: Option<String>) -> Self {
        Self {
            status: payload.status,
            summary: payload.summary.clone(),
            details: payload.details.clone(),
            document_path,
        }
    }
}

/// The on-disk `artifacts/<taskId>.outcome.json` document.
///
/// The status is written in its document code form (`OK`, `BLOCKED`,
/// `CHANGES_REQUESTED`), unlike the snake_case form used on task records.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutcomeDocument {
    /// Document status code.
    pub status: String,
    /// One-line summary of the verdict.
    pub summary: String,
    /// Optional longer explanation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl OutcomeDocument {
    /// Build the document form from an executor payload.
    pub fn from_payload(payload: &OutcomePayload) -> Self {
        Self {
            status: payload.status.document_code().to_string(),
            summary: payload.summary.clone(),
            details: payload.details.clone(),
        }
    }
}
