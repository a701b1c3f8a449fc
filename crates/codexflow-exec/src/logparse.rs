use base64::Engine;
use serde_json::Value;

/// Default cap on the rolling log tail, in bytes.
pub const LOG_TAIL_LIMIT: usize = 4096;

/// Normalise a chunk of CLI output into presentation lines.
///
/// Chunks usually arrive as newline-delimited JSON events; each recognised
/// event type is rendered to a terse human line, `token_count` events are
/// dropped, and anything unrecognised passes through unchanged. The result is
/// empty or newline-terminated.
pub fn normalize_chunk(chunk: &str) -> String {
    let mut out = String::new();
    for line in chunk.lines() {
        if line.trim().is_empty() {
            continue;
        }
        if let Some(rendered) = normalize_line(line) {
            out.push_str(&rendered);
            out.push('\n');
        }
    }
    out
}

fn normalize_line(line: &str) -> Option<String> {
    let value: Value = match serde_json::from_str(line.trim()) {
        Ok(value) => value,
        Err(_) => return Some(line.to_string()),
    };
    if !value.is_object() {
        return Some(line.to_string());
    }
    let msg = value.get("msg").unwrap_or(&value);
    let Some(kind) = msg.get("type").and_then(Value::as_str) else {
        return Some(line.to_string());
    };

    match kind {
        "agent_reasoning" => Some(format!("🧠 {}", text_field(msg))),
        "agent_message" => Some(text_field(msg)),
        "exec_command_begin" => {
            let command = command_field(msg);
            let cwd = msg.get("cwd").and_then(Value::as_str).unwrap_or(".");
            Some(format!("$ {command} (cwd: {cwd})"))
        }
        "exec_command_output_delta" | "exec_command_output" => {
            let raw = msg
                .get("chunk")
                .or_else(|| msg.get("output"))
                .and_then(Value::as_str)
                .unwrap_or_default();
            Some(decode_output(raw))
        }
        "exec_command_end" => {
            let mut parts = Vec::new();
            if let Some(stdout) = msg.get("stdout").and_then(Value::as_str) {
                if !stdout.is_empty() {
                    parts.push(stdout.to_string());
                }
            }
            if let Some(stderr) = msg.get("stderr").and_then(Value::as_str) {
                if !stderr.is_empty() {
                    parts.push(stderr.to_string());
                }
            }
            let code = msg
                .get("exit_code")
                .and_then(Value::as_i64)
                .unwrap_or_default();
            parts.push(format!("✔ command finished (code {code})"));
            Some(parts.join("\n"))
        }
        "token_count" => None,
        _ => Some(line.to_string()),
    }
}

fn text_field(msg: &Value) -> String {
    msg.get("text")
        .or_else(|| msg.get("message"))
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

fn command_field(msg: &Value) -> String {
    match msg.get("command") {
        Some(Value::Array(parts)) => parts
            .iter()
            .filter_map(Value::as_str)
            .collect::<Vec<_>>()
            .join(" "),
        Some(Value::String(s)) => s.clone(),
        _ => String::new(),
    }
}

/// Decode a command output chunk that looks like padded base64.
///
/// Chunks that are not valid base64, or whose decoded bytes are not clean
/// UTF-8, pass through unmodified.
fn decode_output(raw: &str) -> String {
    if !looks_like_padded_base64(raw) {
        return raw.to_string();
    }
    let Ok(bytes) = base64::engine::general_purpose::STANDARD.decode(raw) else {
        return raw.to_string();
    };
    match String::from_utf8(bytes) {
        Ok(decoded) if !decoded.contains('\u{FFFD}') => decoded,
        _ => raw.to_string(),
    }
}

fn looks_like_padded_base64(s: &str) -> bool {
    if s.is_empty() || s.len() % 4 != 0 {
        return false;
    }
    let trailing_pad = s.chars().rev().take_while(|c| *c == '=').count();
    if trailing_pad > 2 {
        return false;
    }
    s.char_indices().all(|(i, c)| {
        c.is_ascii_alphanumeric()
            || c == '+'
            || c == '/'
            || (c == '=' && i >= s.len() - trailing_pad)
    })
}

/// Rolling tail of normalised output, bounded in bytes.
#[derive(Debug, Clone)]
pub struct LogTail {
    buf: String,
    limit: usize,
}

impl LogTail {
    /// Tail with the default [`LOG_TAIL_LIMIT`] cap.
    pub fn new() -> Self {
        Self::with_limit(LOG_TAIL_LIMIT)
    }

    /// Tail with an explicit byte cap.
    pub fn with_limit(limit: usize) -> Self {
        Self {
            buf: String::new(),
            limit,
        }
    }

    /// Append text, trimming the front to stay within the cap.
    pub fn push(&mut self, text: &str) {
        self.buf.push_str(text);
        if self.buf.len() > self.limit {
            let cut = self.buf.len() - self.limit;
            let mut boundary = cut;
            while !self.buf.is_char_boundary(boundary) {
                boundary += 1;
            }
            self.buf.drain(..boundary);
        }
    }

    /// Current contents.
    pub fn contents(&self) -> &str {
        &self.buf
    }
}

impl Default for LogTail {
    fn default() -> Self {
        Self::new()
    }
}
