//! Per-project permission records. Defaults to deny.
//!
//! Only an explicit approval decision mutates policy state, and only the four
//! fixed grant shapes are representable. Authorization is evaluated at call
//! time: an ALLOW past its expiry enforces as DENY while the record itself is
//! kept as history.

use std::collections::HashMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tether_contract::{CodedError, ErrorCode, PolicyGrant, PolicyScope};
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Decision {
    Allow,
    Deny,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyRecord {
    pub project_id: String,
    pub decision: Decision,
    pub scopes: Vec<PolicyScope>,
    pub expires_at: Option<DateTime<Utc>>,
    pub decided_at: DateTime<Utc>,
}

/// JSON-file-backed policy store; the sole source of truth for enforcement.
pub struct PolicyStore {
    path: PathBuf,
    policies: HashMap<String, PolicyRecord>,
}

impl PolicyStore {
    pub fn load(path: PathBuf) -> Result<Self, CodedError> {
        let policies = match std::fs::read_to_string(&path) {
            Ok(raw) => serde_json::from_str(&raw)
                .map_err(|err| CodedError::internal(format!("corrupt policy store: {err}")))?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(err) => {
                return Err(CodedError::internal(format!(
                    "failed to read policy store: {err}"
                )))
            }
        };
        Ok(Self { path, policies })
    }

    /// Apply one of the four fixed grant shapes. The only mutator of policy
    /// state.
    pub fn apply(
        &mut self,
        project_id: &str,
        grant: PolicyGrant,
        now: DateTime<Utc>,
    ) -> Result<PolicyRecord, CodedError> {
        let decision = match grant {
            PolicyGrant::Deny => Decision::Deny,
            _ => Decision::Allow,
        };
        let record = PolicyRecord {
            project_id: project_id.to_string(),
            decision,
            scopes: grant.scopes().to_vec(),
            expires_at: grant.ttl().map(|ttl| now + ttl),
            decided_at: now,
        };

        info!(
            project_id = %project_id,
            decision = ?decision,
            scopes = ?record.scopes,
            expires_at = ?record.expires_at,
            "Applied policy decision"
        );
        self.policies.insert(project_id.to_string(), record.clone());
        self.save()?;
        Ok(record)
    }

    /// Evaluate the current decision for `scope` at `now`. Unregistered
    /// projects, expired grants and out-of-scope requests all deny.
    pub fn authorize(
        &self,
        project_id: &str,
        scope: PolicyScope,
        now: DateTime<Utc>,
    ) -> Result<(), CodedError> {
        let denied = |reason: &str| {
            CodedError::new(
                ErrorCode::PolicyDenied,
                format!("project '{project_id}' denied: {reason}"),
            )
        };

        let record = self
            .policies
            .get(project_id)
            .ok_or_else(|| denied("no approval on record"))?;

        if record.decision == Decision::Deny {
            return Err(denied("explicitly denied"));
        }
        if let Some(expires_at) = record.expires_at {
            if now > expires_at {
                return Err(denied("approval has expired"));
            }
        }
        if !record.scopes.contains(&scope) {
            return Err(denied("approval does not cover this operation"));
        }
        Ok(())
    }

    pub fn get(&self, project_id: &str) -> Option<&PolicyRecord> {
        self.policies.get(project_id)
    }

    pub fn len(&self) -> usize {
        self.policies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.policies.is_empty()
    }

    fn save(&self) -> Result<(), CodedError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|err| CodedError::internal(format!("create state dir: {err}")))?;
        }
        let raw = serde_json::to_string_pretty(&self.policies)
            .map_err(|err| CodedError::internal(format!("serialize policy store: {err}")))?;
        std::fs::write(&self.path, raw)
            .map_err(|err| CodedError::internal(format!("write policy store: {err}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use tempfile::TempDir;

    fn store(dir: &TempDir) -> PolicyStore {
        PolicyStore::load(dir.path().join("policies.json")).unwrap()
    }

    #[test]
    fn unregistered_project_denies() {
        let dir = TempDir::new().unwrap();
        let policies = store(&dir);
        let err = policies
            .authorize("proj-1", PolicyScope::StartServer, Utc::now())
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::PolicyDenied);
    }

    #[test]
    fn server_only_grant_excludes_run_task() {
        let dir = TempDir::new().unwrap();
        let mut policies = store(&dir);
        let now = Utc::now();
        policies
            .apply("proj-1", PolicyGrant::AllowServer30m, now)
            .unwrap();

        assert!(policies
            .authorize("proj-1", PolicyScope::StartServer, now)
            .is_ok());
        let err = policies
            .authorize("proj-1", PolicyScope::RunTask, now)
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::PolicyDenied);
    }

    #[test]
    fn expired_allow_enforces_as_deny_but_keeps_history() {
        let dir = TempDir::new().unwrap();
        let mut policies = store(&dir);
        let now = Utc::now();
        policies
            .apply("proj-1", PolicyGrant::AllowAll30m, now)
            .unwrap();

        assert!(policies
            .authorize("proj-1", PolicyScope::RunTask, now)
            .is_ok());

        let later = now + Duration::minutes(31);
        let err = policies
            .authorize("proj-1", PolicyScope::RunTask, later)
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::PolicyDenied);

        // The record itself survives expiry.
        let record = policies.get("proj-1").unwrap();
        assert_eq!(record.decision, Decision::Allow);
    }

    #[test]
    fn forever_grant_never_expires() {
        let dir = TempDir::new().unwrap();
        let mut policies = store(&dir);
        let now = Utc::now();
        policies
            .apply("proj-1", PolicyGrant::AllowAllForever, now)
            .unwrap();

        let much_later = now + Duration::days(365);
        assert!(policies
            .authorize("proj-1", PolicyScope::RunTask, much_later)
            .is_ok());
    }

    #[test]
    fn explicit_deny_overrides_earlier_allow() {
        let dir = TempDir::new().unwrap();
        let mut policies = store(&dir);
        let now = Utc::now();
        policies
            .apply("proj-1", PolicyGrant::AllowAllForever, now)
            .unwrap();
        policies.apply("proj-1", PolicyGrant::Deny, now).unwrap();

        let err = policies
            .authorize("proj-1", PolicyScope::StartServer, now)
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::PolicyDenied);
    }

    #[test]
    fn decisions_survive_reload() {
        let dir = TempDir::new().unwrap();
        let now = Utc::now();
        {
            let mut policies = store(&dir);
            policies
                .apply("proj-1", PolicyGrant::AllowAllForever, now)
                .unwrap();
        }
        let policies = store(&dir);
        assert!(policies
            .authorize("proj-1", PolicyScope::RunTask, now)
            .is_ok());
    }
}
