//! Tether backend daemon library.
//!
//! Pairing exchange, per-agent command queue and the HTTP surface the agents
//! and the chat adapter talk to. The binary in `main.rs` wires these together.

pub mod auth;
pub mod config;
pub mod http;
pub mod pairing;
pub mod queue;
