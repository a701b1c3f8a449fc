use codexflow_core::{OutcomePayload, OutcomeStatus};
use serde_json::Value;

/// Extract the last structured outcome embedded in executor output.
///
/// Accepts either the whole text as a JSON object or a JSON object embedded
/// in a single line, as the reviewer prompt requests. The object must carry a
/// recognised `status`; `summary` and `details` are optional.
pub fn extract_outcome(text: &str) -> Option<OutcomePayload> {
    let mut found = parse_candidate(text.trim());
    for line in text.lines() {
        if let (Some(start), Some(end)) = (line.find('{'), line.rfind('}')) {
            if start < end {
                if let Some(payload) = parse_candidate(&line[start..=end]) {
                    found = Some(payload);
                }
            }
        }
    }
    found
}

fn parse_candidate(candidate: &str) -> Option<OutcomePayload> {
    let value: Value = serde_json::from_str(candidate).ok()?;
    let status = OutcomeStatus::parse(value.get("status")?.as_str()?)?;
    Some(OutcomePayload {
        status,
        summary: value
            .get("summary")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        details: value
            .get("details")
            .and_then(Value::as_str)
            .map(str::to_string),
    })
}

const APPROVE_MARKERS: &[&str] = &["lgtm", "looks good", "approved", "ship it"];
const CHANGES_MARKERS: &[&str] = &[
    "changes requested",
    "request changes",
    "requesting changes",
    "needs changes",
];
const BLOCKED_MARKERS: &[&str] = &["blocked", "unable to review", "cannot review"];

/// Fallback reviewer verdict parsed from free-form summary text.
///
/// Only consulted when no structured outcome is present; a structured status
/// always wins.
pub fn reviewer_outcome_from_text(summary: &str) -> Option<OutcomeStatus> {
    let lower = summary.to_lowercase();
    if CHANGES_MARKERS.iter().any(|m| lower.contains(m)) {
        return Some(OutcomeStatus::ChangesRequested);
    }
    if BLOCKED_MARKERS.iter().any(|m| lower.contains(m)) {
        return Some(OutcomeStatus::Blocked);
    }
    if APPROVE_MARKERS.iter().any(|m| lower.contains(m)) {
        return Some(OutcomeStatus::Ok);
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_from_whole_text() {
        let payload = extract_outcome(r#"{"status":"ok","summary":"LGTM"}"#).unwrap();
        assert_eq!(payload.status, OutcomeStatus::Ok);
        assert_eq!(payload.summary, "LGTM");
    }

    #[test]
    fn test_extract_from_embedded_line() {
        let text = "Review complete.\nVerdict: {\"status\": \"changes_requested\", \"summary\": \"missing tests\", \"details\": \"no coverage for the parser\"}\n";
        let payload = extract_outcome(text).unwrap();
        assert_eq!(payload.status, OutcomeStatus::ChangesRequested);
        assert_eq!(payload.summary, "missing tests");
        assert_eq!(payload.details.as_deref(), Some("no coverage for the parser"));
    }

    #[test]
    fn test_last_outcome_wins() {
        let text = "{\"status\":\"blocked\",\"summary\":\"first\"}\n{\"status\":\"ok\",\"summary\":\"second\"}";
        let payload = extract_outcome(text).unwrap();
        assert_eq!(payload.status, OutcomeStatus::Ok);
        assert_eq!(payload.summary, "second");
    }

    #[test]
    fn test_no_outcome_in_plain_text() {
        assert!(extract_outcome("all done, nothing structured here").is_none());
        assert!(extract_outcome(r#"{"status":"sideways"}"#).is_none());
    }

    #[test]
    fn test_reviewer_fallback_phrases() {
        assert_eq!(
            reviewer_outcome_from_text("LGTM, nice work"),
            Some(OutcomeStatus::Ok)
        );
        assert_eq!(
            reviewer_outcome_from_text("Changes requested: please add tests"),
            Some(OutcomeStatus::ChangesRequested)
        );
        assert_eq!(
            reviewer_outcome_from_text("I am blocked on missing context"),
            Some(OutcomeStatus::Blocked)
        );
        assert_eq!(reviewer_outcome_from_text("neutral text"), None);
    }

    #[test]
    fn test_changes_marker_beats_approve_marker() {
        // "looks good otherwise, but changes requested" must not approve.
        assert_eq!(
            reviewer_outcome_from_text("Looks good otherwise, but changes requested"),
            Some(OutcomeStatus::ChangesRequested)
        );
    }
}
