//! Error-code taxonomy shared by the backend and the agent.
//!
//! Every failure that crosses a process boundary is one of these codes; the
//! human-readable detail travels next to the code, never inside it.

use serde::{Deserialize, Serialize};

/// Closed set of wire-visible error codes (`ERR_<DOMAIN>_<REASON>`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorCode {
    #[serde(rename = "ERR_VALIDATION_REQUIRED_FIELD")]
    ValidationRequiredField,
    #[serde(rename = "ERR_VALIDATION_INVALID_PAYLOAD")]
    ValidationInvalidPayload,
    #[serde(rename = "ERR_COMMAND_UNKNOWN")]
    CommandUnknown,
    #[serde(rename = "ERR_COMMAND_INVALID")]
    CommandInvalid,
    #[serde(rename = "ERR_AUTH_UNAUTHORIZED")]
    AuthUnauthorized,
    #[serde(rename = "ERR_PAIRING_EXPIRED")]
    PairingExpired,
    #[serde(rename = "ERR_PAIRING_REUSED")]
    PairingReused,
    #[serde(rename = "ERR_AGENT_NOT_PAIRED")]
    AgentNotPaired,
    #[serde(rename = "ERR_POLICY_DENIED")]
    PolicyDenied,
    #[serde(rename = "ERR_PATH_FORBIDDEN")]
    PathForbidden,
    #[serde(rename = "ERR_PATH_INVALID")]
    PathInvalid,
    #[serde(rename = "ERR_PROJECT_UNKNOWN")]
    ProjectUnknown,
    #[serde(rename = "ERR_PORT_EXHAUSTED")]
    PortExhausted,
    #[serde(rename = "ERR_START_TIMEOUT")]
    StartTimeout,
    #[serde(rename = "ERR_TASK_FAILED")]
    TaskFailed,
    #[serde(rename = "ERR_INTERNAL_TIMEOUT")]
    InternalTimeout,
    #[serde(rename = "ERR_INTERNAL")]
    Internal,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::ValidationRequiredField => "ERR_VALIDATION_REQUIRED_FIELD",
            ErrorCode::ValidationInvalidPayload => "ERR_VALIDATION_INVALID_PAYLOAD",
            ErrorCode::CommandUnknown => "ERR_COMMAND_UNKNOWN",
            ErrorCode::CommandInvalid => "ERR_COMMAND_INVALID",
            ErrorCode::AuthUnauthorized => "ERR_AUTH_UNAUTHORIZED",
            ErrorCode::PairingExpired => "ERR_PAIRING_EXPIRED",
            ErrorCode::PairingReused => "ERR_PAIRING_REUSED",
            ErrorCode::AgentNotPaired => "ERR_AGENT_NOT_PAIRED",
            ErrorCode::PolicyDenied => "ERR_POLICY_DENIED",
            ErrorCode::PathForbidden => "ERR_PATH_FORBIDDEN",
            ErrorCode::PathInvalid => "ERR_PATH_INVALID",
            ErrorCode::ProjectUnknown => "ERR_PROJECT_UNKNOWN",
            ErrorCode::PortExhausted => "ERR_PORT_EXHAUSTED",
            ErrorCode::StartTimeout => "ERR_START_TIMEOUT",
            ErrorCode::TaskFailed => "ERR_TASK_FAILED",
            ErrorCode::InternalTimeout => "ERR_INTERNAL_TIMEOUT",
            ErrorCode::Internal => "ERR_INTERNAL",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An error code paired with a human-readable detail string.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{code}: {detail}")]
pub struct CodedError {
    pub code: ErrorCode,
    pub detail: String,
}

impl CodedError {
    pub fn new(code: ErrorCode, detail: impl Into<String>) -> Self {
        Self {
            code,
            detail: detail.into(),
        }
    }

    pub fn internal(detail: impl Into<String>) -> Self {
        Self::new(ErrorCode::Internal, detail)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_codes_serialize_to_taxonomy_strings() {
        let json = serde_json::to_string(&ErrorCode::PolicyDenied).unwrap();
        assert_eq!(json, "\"ERR_POLICY_DENIED\"");

        let parsed: ErrorCode = serde_json::from_str("\"ERR_PAIRING_REUSED\"").unwrap();
        assert_eq!(parsed, ErrorCode::PairingReused);
    }

    #[test]
    fn unknown_code_rejected() {
        assert!(serde_json::from_str::<ErrorCode>("\"ERR_NOPE\"").is_err());
    }

    #[test]
    fn coded_error_display_includes_code_and_detail() {
        let err = CodedError::new(ErrorCode::PathForbidden, "path /etc is forbidden");
        assert_eq!(
            err.to_string(),
            "ERR_PATH_FORBIDDEN: path /etc is forbidden"
        );
    }
}
