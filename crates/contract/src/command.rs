//! Command envelope and per-type payload validation.
//!
//! The command set is a closed five-member enumeration. An envelope decodes in
//! two steps: the outer fields (strict, no unknown fields, no trailing input),
//! then the type-specific payload. The `type` string is checked against the
//! closed set before the payload is even looked at.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{CodedError, ErrorCode};

/// Wire envelope for a queued command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CommandEnvelope {
    pub command_id: String,
    pub idempotency_key: String,
    #[serde(rename = "type")]
    pub command_type: String,
    pub created_at: DateTime<Utc>,
    pub payload: Value,
}

/// The closed set of command types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandType {
    Status,
    RegisterProject,
    ApplyProjectPolicy,
    StartServer,
    RunTask,
}

impl CommandType {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "status" => Some(CommandType::Status),
            "register_project" => Some(CommandType::RegisterProject),
            "apply_project_policy" => Some(CommandType::ApplyProjectPolicy),
            "start_server" => Some(CommandType::StartServer),
            "run_task" => Some(CommandType::RunTask),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CommandType::Status => "status",
            CommandType::RegisterProject => "register_project",
            CommandType::ApplyProjectPolicy => "apply_project_policy",
            CommandType::StartServer => "start_server",
            CommandType::RunTask => "run_task",
        }
    }

    /// Mutating commands are serialized on the agent; `status` is not.
    pub fn is_mutating(&self) -> bool {
        !matches!(self, CommandType::Status)
    }
}

/// Scope of a project permission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PolicyScope {
    #[serde(rename = "start_server")]
    StartServer,
    #[serde(rename = "run_task")]
    RunTask,
}

/// The four fixed approval shapes. No other combination is representable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PolicyGrant {
    #[serde(rename = "deny")]
    Deny,
    #[serde(rename = "allow_server_30m")]
    AllowServer30m,
    #[serde(rename = "allow_all_30m")]
    AllowAll30m,
    #[serde(rename = "allow_all_forever")]
    AllowAllForever,
}

impl PolicyGrant {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "deny" => Some(PolicyGrant::Deny),
            "allow_server_30m" => Some(PolicyGrant::AllowServer30m),
            "allow_all_30m" => Some(PolicyGrant::AllowAll30m),
            "allow_all_forever" => Some(PolicyGrant::AllowAllForever),
            _ => None,
        }
    }

    pub fn scopes(&self) -> &'static [PolicyScope] {
        match self {
            PolicyGrant::Deny => &[],
            PolicyGrant::AllowServer30m => &[PolicyScope::StartServer],
            PolicyGrant::AllowAll30m | PolicyGrant::AllowAllForever => {
                &[PolicyScope::StartServer, PolicyScope::RunTask]
            }
        }
    }

    /// Time-to-live of the grant; `None` means until revoked.
    pub fn ttl(&self) -> Option<chrono::Duration> {
        match self {
            PolicyGrant::AllowServer30m | PolicyGrant::AllowAll30m => {
                Some(chrono::Duration::minutes(30))
            }
            PolicyGrant::Deny | PolicyGrant::AllowAllForever => None,
        }
    }
}

/// A fully validated command, one variant per payload schema.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Status,
    RegisterProject {
        path: String,
    },
    ApplyProjectPolicy {
        project_id: String,
        decision: PolicyGrant,
    },
    StartServer {
        project_id: String,
    },
    RunTask {
        project_id: String,
        prompt: String,
    },
}

impl Command {
    pub fn command_type(&self) -> CommandType {
        match self {
            Command::Status => CommandType::Status,
            Command::RegisterProject { .. } => CommandType::RegisterProject,
            Command::ApplyProjectPolicy { .. } => CommandType::ApplyProjectPolicy,
            Command::StartServer { .. } => CommandType::StartServer,
            Command::RunTask { .. } => CommandType::RunTask,
        }
    }

    /// Validate an envelope's type and payload into a typed command.
    pub fn parse(envelope: &CommandEnvelope) -> Result<Self, CodedError> {
        let command_type = CommandType::parse(&envelope.command_type).ok_or_else(|| {
            CodedError::new(
                ErrorCode::CommandUnknown,
                format!("unknown command type '{}'", envelope.command_type),
            )
        })?;

        let empty = serde_json::Map::new();
        let payload = match &envelope.payload {
            Value::Object(map) => map,
            Value::Null => &empty,
            other => {
                return Err(CodedError::new(
                    ErrorCode::CommandInvalid,
                    format!("payload must be a JSON object, got {}", json_kind(other)),
                ));
            }
        };

        match command_type {
            CommandType::Status => {
                reject_unknown_payload_fields(payload, &[])?;
                Ok(Command::Status)
            }
            CommandType::RegisterProject => {
                reject_unknown_payload_fields(payload, &["path"])?;
                let path = required_string(payload, "path")?;
                Ok(Command::RegisterProject { path })
            }
            CommandType::ApplyProjectPolicy => {
                reject_unknown_payload_fields(payload, &["project_id", "decision"])?;
                let project_id = required_string(payload, "project_id")?;
                let raw_decision = required_string(payload, "decision")?;
                let decision = PolicyGrant::parse(&raw_decision).ok_or_else(|| {
                    CodedError::new(
                        ErrorCode::ValidationInvalidPayload,
                        format!("'{raw_decision}' is not a valid decision"),
                    )
                })?;
                Ok(Command::ApplyProjectPolicy {
                    project_id,
                    decision,
                })
            }
            CommandType::StartServer => {
                reject_unknown_payload_fields(payload, &["project_id"])?;
                let project_id = required_string(payload, "project_id")?;
                Ok(Command::StartServer { project_id })
            }
            CommandType::RunTask => {
                reject_unknown_payload_fields(payload, &["project_id", "prompt"])?;
                let project_id = required_string(payload, "project_id")?;
                let prompt = required_string(payload, "prompt")?;
                Ok(Command::RunTask { project_id, prompt })
            }
        }
    }
}

/// Decode a raw JSON envelope, rejecting unknown fields and trailing input.
pub fn decode_envelope(raw: &str) -> Result<CommandEnvelope, CodedError> {
    serde_json::from_str(raw)
        .map_err(|err| CodedError::new(ErrorCode::CommandInvalid, err.to_string()))
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

fn reject_unknown_payload_fields(
    payload: &serde_json::Map<String, Value>,
    allowed: &[&str],
) -> Result<(), CodedError> {
    for key in payload.keys() {
        if !allowed.contains(&key.as_str()) {
            return Err(CodedError::new(
                ErrorCode::ValidationInvalidPayload,
                format!("unexpected payload field '{key}'"),
            ));
        }
    }
    Ok(())
}

fn required_string(
    payload: &serde_json::Map<String, Value>,
    field: &str,
) -> Result<String, CodedError> {
    let value = payload.get(field).ok_or_else(|| {
        CodedError::new(
            ErrorCode::ValidationRequiredField,
            format!("missing required field '{field}'"),
        )
    })?;
    let text = value.as_str().ok_or_else(|| {
        CodedError::new(
            ErrorCode::ValidationInvalidPayload,
            format!("field '{field}' must be a string"),
        )
    })?;
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Err(CodedError::new(
            ErrorCode::ValidationRequiredField,
            format!("field '{field}' must not be empty"),
        ));
    }
    Ok(trimmed.to_string())
}
