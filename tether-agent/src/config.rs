//! Agent configuration and on-disk credentials.
//!
//! Configuration is a small TOML file plus flag overrides; credentials are
//! written once by the pairing flow and read back on every start.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

pub const DEFAULT_BACKEND_URL: &str = "http://127.0.0.1:8787";
const CREDENTIALS_FILE: &str = "credentials.json";
pub const PROJECTS_FILE: &str = "projects.json";
pub const POLICIES_FILE: &str = "policies.json";

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct AgentConfig {
    /// Base URL of the backend daemon.
    #[serde(default)]
    pub backend_url: Option<String>,
    /// Directory holding credentials, the project registry and policies.
    #[serde(default)]
    pub state_dir: Option<PathBuf>,
    /// Assistant server binary launched per project.
    #[serde(default)]
    pub server_command: Option<String>,
    #[serde(default)]
    pub server_args: Vec<String>,
}

impl AgentConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        toml::from_str(&raw).with_context(|| format!("invalid config {}", path.display()))
    }
}

/// Default state directory: `$HOME/.tether`.
pub fn default_state_dir() -> Result<PathBuf> {
    let home = std::env::var_os("HOME").context("HOME is not set; pass --state-dir")?;
    Ok(PathBuf::from(home).join(".tether"))
}

/// Pairing credentials issued by the backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Credentials {
    pub agent_id: String,
    pub agent_key: String,
}

impl Credentials {
    pub fn load(state_dir: &Path) -> Result<Self> {
        let path = state_dir.join(CREDENTIALS_FILE);
        let raw = std::fs::read_to_string(&path).with_context(|| {
            format!(
                "no credentials at {}; run `tether-agent pair` first",
                path.display()
            )
        })?;
        serde_json::from_str(&raw)
            .with_context(|| format!("corrupt credentials file {}", path.display()))
    }

    pub fn save(&self, state_dir: &Path) -> Result<()> {
        std::fs::create_dir_all(state_dir)
            .with_context(|| format!("failed to create {}", state_dir.display()))?;
        let path = state_dir.join(CREDENTIALS_FILE);
        let raw = serde_json::to_string_pretty(self).context("serialize credentials")?;
        std::fs::write(&path, raw)
            .with_context(|| format!("failed to write {}", path.display()))?;

        // The key is a bearer secret; keep it owner-readable only.
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600))
                .with_context(|| format!("failed to chmod {}", path.display()))?;
        }
        Ok(())
    }
}
