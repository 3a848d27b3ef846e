//! Shared contract layer for the tether control plane.
//!
//! Defines the command/result envelopes exchanged between the backend and the
//! agent, the closed set of command types with their payload validators, and
//! the error-code taxonomy. Everything on the wire decodes strictly: unknown
//! fields, unknown command types, and trailing input are rejected before any
//! side effect.

pub mod command;
pub mod error;
pub mod result;

pub use command::{
    decode_envelope, Command, CommandEnvelope, CommandType, PolicyGrant, PolicyScope,
};
pub use error::{CodedError, ErrorCode};
pub use result::{CommandResult, MAX_STREAM_BYTES, MAX_SUMMARY_BYTES, RESULT_RETENTION_DAYS};
