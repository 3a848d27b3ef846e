//! Result envelope posted back by the agent.
//!
//! Results are size-bounded at construction time so an oversized subprocess
//! dump can never reach the queue, and time-bounded by the backend's
//! retention sweep.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{CodedError, ErrorCode};

/// Cap on stdout/stderr, each.
pub const MAX_STREAM_BYTES: usize = 64 * 1024;
/// Cap on the summary line.
pub const MAX_SUMMARY_BYTES: usize = 2 * 1024;
/// How long the backend keeps a stored result.
pub const RESULT_RETENTION_DAYS: i64 = 14;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CommandResult {
    pub command_id: String,
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<ErrorCode>,
    pub summary: String,
    pub stdout: String,
    pub stderr: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<Value>,
}

impl CommandResult {
    pub fn success(command_id: impl Into<String>, summary: impl Into<String>) -> Self {
        Self {
            command_id: command_id.into(),
            ok: true,
            error_code: None,
            summary: truncate_utf8(&summary.into(), MAX_SUMMARY_BYTES),
            stdout: String::new(),
            stderr: String::new(),
            meta: None,
        }
    }

    pub fn failure(command_id: impl Into<String>, error: &CodedError) -> Self {
        Self {
            command_id: command_id.into(),
            ok: false,
            error_code: Some(error.code),
            summary: truncate_utf8(&error.detail, MAX_SUMMARY_BYTES),
            stdout: String::new(),
            stderr: String::new(),
            meta: None,
        }
    }

    pub fn with_output(mut self, stdout: &str, stderr: &str) -> Self {
        self.stdout = truncate_utf8(stdout, MAX_STREAM_BYTES);
        self.stderr = truncate_utf8(stderr, MAX_STREAM_BYTES);
        self
    }

    pub fn with_meta(mut self, meta: Value) -> Self {
        self.meta = Some(meta);
        self
    }

    /// Re-apply the size caps, for results received over the wire.
    pub fn clamped(mut self) -> Self {
        self.summary = truncate_utf8(&self.summary, MAX_SUMMARY_BYTES);
        self.stdout = truncate_utf8(&self.stdout, MAX_STREAM_BYTES);
        self.stderr = truncate_utf8(&self.stderr, MAX_STREAM_BYTES);
        self
    }
}

/// Truncate to at most `max_bytes` without splitting a UTF-8 sequence.
fn truncate_utf8(input: &str, max_bytes: usize) -> String {
    if input.len() <= max_bytes {
        return input.to_string();
    }
    let mut end = max_bytes;
    while end > 0 && !input.is_char_boundary(end) {
        end -= 1;
    }
    input[..end].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn result_round_trips() {
        let result = CommandResult::success("cmd-1", "server ready on port 4096")
            .with_output("out", "err")
            .with_meta(serde_json::json!({"port": 4096}));
        let encoded = serde_json::to_string(&result).unwrap();
        let decoded: CommandResult = serde_json::from_str(&encoded).unwrap();
        assert_eq!(result, decoded);
    }

    #[test]
    fn unknown_result_field_rejected() {
        let raw = r#"{"command_id":"c","ok":true,"summary":"s","stdout":"","stderr":"","bonus":1}"#;
        assert!(serde_json::from_str::<CommandResult>(raw).is_err());
    }

    #[test]
    fn failure_carries_error_code() {
        let err = CodedError::new(ErrorCode::PortExhausted, "no free ports in 4096-4196");
        let result = CommandResult::failure("cmd-2", &err);
        assert!(!result.ok);
        assert_eq!(result.error_code, Some(ErrorCode::PortExhausted));
        assert_eq!(result.summary, "no free ports in 4096-4196");
    }

    #[test]
    fn streams_capped_at_64k() {
        let big = "x".repeat(MAX_STREAM_BYTES + 100);
        let result = CommandResult::success("cmd-3", "ok").with_output(&big, &big);
        assert_eq!(result.stdout.len(), MAX_STREAM_BYTES);
        assert_eq!(result.stderr.len(), MAX_STREAM_BYTES);
    }

    #[test]
    fn summary_capped_at_2k() {
        let big = "y".repeat(MAX_SUMMARY_BYTES * 2);
        let result = CommandResult::success("cmd-4", big);
        assert_eq!(result.summary.len(), MAX_SUMMARY_BYTES);
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        let s = "é".repeat(MAX_SUMMARY_BYTES); // 2 bytes per char
        let result = CommandResult::success("cmd-5", s);
        assert!(result.summary.len() <= MAX_SUMMARY_BYTES);
        assert!(result.summary.chars().all(|c| c == 'é'));
    }
}
