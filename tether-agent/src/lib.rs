//! Tether agent library.
//!
//! The unattended local side of the control plane: a dispatcher that
//! long-polls the backend for commands, a deny-by-default policy store, a
//! project registry keyed by canonical path fingerprints, and a supervisor
//! that runs one assistant server per project.

pub mod client;
pub mod config;
pub mod dispatcher;
pub mod idempotency;
pub mod policy;
pub mod projects;
pub mod supervisor;
