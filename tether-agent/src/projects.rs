//! Project registry: canonical paths and deterministic fingerprints.
//!
//! A project id is a pure function of `(agent_id, canonical_path)`, so
//! registering the same directory twice yields the same id. Canonicalization
//! resolves symlinks to an absolute path and refuses filesystem roots, the
//! user's home directory itself, and OS-critical directories.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tether_contract::{CodedError, ErrorCode};
use tracing::info;

/// Directories no project may live in or under.
const FORBIDDEN_PREFIXES: &[&str] = &[
    "/etc", "/usr", "/bin", "/sbin", "/lib", "/lib64", "/var", "/boot", "/proc", "/sys", "/dev",
    "/root",
];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectRecord {
    pub project_id: String,
    pub agent_id: String,
    pub canonical_path: PathBuf,
}

/// JSON-file-backed registry of projects the agent owns.
pub struct ProjectStore {
    path: PathBuf,
    projects: HashMap<String, ProjectRecord>,
}

impl ProjectStore {
    /// Load the registry from `path`, starting empty when the file does not
    /// exist yet.
    pub fn load(path: PathBuf) -> Result<Self, CodedError> {
        let projects = match std::fs::read_to_string(&path) {
            Ok(raw) => serde_json::from_str(&raw).map_err(|err| {
                CodedError::internal(format!("corrupt project registry: {err}"))
            })?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(err) => {
                return Err(CodedError::internal(format!(
                    "failed to read project registry: {err}"
                )))
            }
        };
        Ok(Self { path, projects })
    }

    /// Register a raw path: canonicalize, screen against the deny-list,
    /// fingerprint and persist. Re-registration returns the existing id.
    pub fn register(&mut self, agent_id: &str, raw_path: &str) -> Result<String, CodedError> {
        let canonical = canonicalize_project_path(raw_path)?;
        let project_id = fingerprint(agent_id, &canonical);

        if !self.projects.contains_key(&project_id) {
            info!(
                project_id = %project_id,
                path = %canonical.display(),
                "Registered project"
            );
            self.projects.insert(
                project_id.clone(),
                ProjectRecord {
                    project_id: project_id.clone(),
                    agent_id: agent_id.to_string(),
                    canonical_path: canonical,
                },
            );
            self.save()?;
        }
        Ok(project_id)
    }

    pub fn get(&self, project_id: &str) -> Result<&ProjectRecord, CodedError> {
        self.projects.get(project_id).ok_or_else(|| {
            CodedError::new(
                ErrorCode::ProjectUnknown,
                format!("project '{project_id}' is not registered"),
            )
        })
    }

    pub fn len(&self) -> usize {
        self.projects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.projects.is_empty()
    }

    fn save(&self) -> Result<(), CodedError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|err| CodedError::internal(format!("create state dir: {err}")))?;
        }
        let raw = serde_json::to_string_pretty(&self.projects)
            .map_err(|err| CodedError::internal(format!("serialize project registry: {err}")))?;
        std::fs::write(&self.path, raw)
            .map_err(|err| CodedError::internal(format!("write project registry: {err}")))
    }
}

/// Resolve a raw input path to its canonical, symlink-resolved absolute form
/// and screen it against forbidden locations.
pub fn canonicalize_project_path(raw: &str) -> Result<PathBuf, CodedError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() || trimmed.contains('\0') {
        return Err(CodedError::new(
            ErrorCode::PathInvalid,
            "path is empty or contains a null byte",
        ));
    }

    let canonical = std::fs::canonicalize(trimmed).map_err(|err| {
        CodedError::new(
            ErrorCode::PathInvalid,
            format!("cannot resolve '{trimmed}': {err}"),
        )
    })?;

    if !canonical.is_dir() {
        return Err(CodedError::new(
            ErrorCode::PathInvalid,
            format!("'{}' is not a directory", canonical.display()),
        ));
    }

    screen_forbidden(&canonical)?;
    Ok(canonical)
}

fn screen_forbidden(canonical: &Path) -> Result<(), CodedError> {
    // Filesystem root.
    if canonical.parent().is_none() {
        return Err(forbidden(canonical, "filesystem root"));
    }

    // The home directory itself; projects must live below it.
    if let Some(home) = std::env::var_os("HOME") {
        let home = PathBuf::from(home);
        if canonical == home {
            return Err(forbidden(canonical, "home directory"));
        }
    }

    for prefix in FORBIDDEN_PREFIXES {
        let prefix = Path::new(prefix);
        if canonical == prefix || canonical.starts_with(prefix) {
            return Err(forbidden(canonical, "OS-critical directory"));
        }
    }

    Ok(())
}

fn forbidden(path: &Path, what: &str) -> CodedError {
    CodedError::new(
        ErrorCode::PathForbidden,
        format!("'{}' is a {what} and cannot be a project", path.display()),
    )
}

/// Deterministic fingerprint of `(agent_id, canonical_path)`.
pub fn fingerprint(agent_id: &str, canonical_path: &Path) -> String {
    let mut hasher = Sha256::new();
    hasher.update(agent_id.as_bytes());
    hasher.update([0u8]);
    hasher.update(canonical_path.as_os_str().as_encoded_bytes());
    let digest = hasher.finalize();
    format!("proj-{}", &hex::encode(digest)[..16])
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store(dir: &TempDir) -> ProjectStore {
        ProjectStore::load(dir.path().join("projects.json")).unwrap()
    }

    #[test]
    fn registration_is_deterministic() {
        let state = TempDir::new().unwrap();
        let project = TempDir::new().unwrap();
        let mut projects = store(&state);

        let raw = project.path().to_string_lossy().to_string();
        let first = projects.register("agent-1", &raw).unwrap();
        let second = projects.register("agent-1", &raw).unwrap();
        assert_eq!(first, second);
        assert_eq!(projects.len(), 1);
        assert!(first.starts_with("proj-"));
    }

    #[test]
    fn different_agents_get_different_ids() {
        let project = TempDir::new().unwrap();
        let a = fingerprint("agent-1", project.path());
        let b = fingerprint("agent-2", project.path());
        assert_ne!(a, b);
    }

    #[test]
    fn etc_is_forbidden() {
        let err = canonicalize_project_path("/etc").unwrap_err();
        assert_eq!(err.code, ErrorCode::PathForbidden);
    }

    #[test]
    fn root_is_forbidden() {
        let err = canonicalize_project_path("/").unwrap_err();
        assert_eq!(err.code, ErrorCode::PathForbidden);
    }

    #[test]
    fn missing_path_is_invalid() {
        let err = canonicalize_project_path("/definitely/not/here-xyz").unwrap_err();
        assert_eq!(err.code, ErrorCode::PathInvalid);
    }

    #[test]
    fn empty_path_is_invalid() {
        let err = canonicalize_project_path("   ").unwrap_err();
        assert_eq!(err.code, ErrorCode::PathInvalid);
    }

    #[test]
    fn file_is_not_a_project() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("file.txt");
        std::fs::write(&file, "x").unwrap();
        let err = canonicalize_project_path(&file.to_string_lossy()).unwrap_err();
        assert_eq!(err.code, ErrorCode::PathInvalid);
    }

    #[test]
    fn symlinks_resolve_to_one_project() {
        let state = TempDir::new().unwrap();
        let project = TempDir::new().unwrap();
        let link_holder = TempDir::new().unwrap();
        let link = link_holder.path().join("link");
        std::os::unix::fs::symlink(project.path(), &link).unwrap();

        let mut projects = store(&state);
        let via_real = projects
            .register("agent-1", &project.path().to_string_lossy())
            .unwrap();
        let via_link = projects
            .register("agent-1", &link.to_string_lossy())
            .unwrap();
        assert_eq!(via_real, via_link);
    }

    #[test]
    fn registry_survives_reload() {
        let state = TempDir::new().unwrap();
        let project = TempDir::new().unwrap();
        let raw = project.path().to_string_lossy().to_string();

        let first = {
            let mut projects = store(&state);
            projects.register("agent-1", &raw).unwrap()
        };

        let reloaded = store(&state);
        let record = reloaded.get(&first).unwrap();
        assert_eq!(record.agent_id, "agent-1");
        assert_eq!(
            record.canonical_path,
            std::fs::canonicalize(project.path()).unwrap()
        );
    }

    #[test]
    fn unknown_project_lookup_fails() {
        let state = TempDir::new().unwrap();
        let projects = store(&state);
        let err = projects.get("proj-nope").unwrap_err();
        assert_eq!(err.code, ErrorCode::ProjectUnknown);
    }
}
