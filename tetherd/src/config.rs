//! Daemon configuration: a small TOML file plus env/flag overrides.

use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;

pub const DEFAULT_BIND: &str = "127.0.0.1:8787";

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct DaemonConfig {
    /// Bind address for the HTTP surface.
    #[serde(default)]
    pub bind: Option<String>,
    /// Shared token for the chat-adapter surface. Unset leaves that surface
    /// closed.
    #[serde(default)]
    pub adapter_token: Option<String>,
}

impl DaemonConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        toml::from_str(&raw).with_context(|| format!("invalid config {}", path.display()))
    }
}
