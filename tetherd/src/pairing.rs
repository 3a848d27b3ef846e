//! Pairing codes and agent credentials.
//!
//! A user asks for a short-lived pairing code through the chat adapter; the
//! unattended agent claims it once and receives a durable bearer key. Exactly
//! one agent may be active per user: a successful claim supersedes and revokes
//! any earlier agent of the same user. A superseded key keeps a short grace
//! window in which it may still post a result for work it already holds, but
//! can never poll again.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use rand::Rng;
use tether_contract::{CodedError, ErrorCode};
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

/// Pairing codes expire after this long.
pub const PAIRING_CODE_TTL: Duration = Duration::minutes(10);
/// How long a superseded key may still post results for inflight work.
pub const REVOKED_KEY_DRAIN: Duration = Duration::seconds(600);

const CODE_LEN: usize = 8;
// No 0/O or 1/I so codes survive being read aloud over chat.
const CODE_ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";

#[derive(Debug, Clone)]
struct PairingCode {
    owning_user_id: i64,
    expires_at: DateTime<Utc>,
    claimed: bool,
}

#[derive(Debug, Clone)]
pub struct AgentRecord {
    pub agent_id: String,
    pub agent_key: String,
    pub owning_user_id: i64,
    pub device_info: String,
    pub paired_at: DateTime<Utc>,
    pub revoked_at: Option<DateTime<Utc>>,
}

/// What a bearer key is still allowed to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyGrade {
    /// Active credential: poll and post results.
    Active,
    /// Superseded credential inside its drain window: post results only.
    Draining,
}

#[derive(Default)]
struct PairingState {
    codes: HashMap<String, PairingCode>,
    /// owning_user_id -> active agent. Keyed by the owner, not the agent id,
    /// so a re-pairing replaces exactly one entry.
    active_by_user: HashMap<i64, AgentRecord>,
    /// agent_key -> superseded record, kept for the drain window.
    revoked: HashMap<String, AgentRecord>,
    /// owning_user_id -> superseded agent ids, oldest first. Result pickup
    /// consults these so a drained result stays reachable after a re-pair.
    former_by_user: HashMap<i64, Vec<String>>,
}

pub struct PairingService {
    state: Mutex<PairingState>,
}

impl PairingService {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(PairingState::default()),
        }
    }

    /// Issue a fresh single-use code for the user.
    pub async fn start_pairing(&self, owning_user_id: i64, now: DateTime<Utc>) -> (String, DateTime<Utc>) {
        let mut state = self.state.lock().await;
        prune_expired_codes(&mut state, now);

        let code = generate_code();
        let expires_at = now + PAIRING_CODE_TTL;
        state.codes.insert(
            code.clone(),
            PairingCode {
                owning_user_id,
                expires_at,
                claimed: false,
            },
        );

        info!(user_id = owning_user_id, %code, "Issued pairing code");
        (code, expires_at)
    }

    /// Exchange a claimed code for a fresh agent credential. Claimed and
    /// expired codes fail with distinct errors; a successful claim revokes
    /// any prior agent of the same user.
    pub async fn claim_pairing(
        &self,
        code: &str,
        device_info: &str,
        now: DateTime<Utc>,
    ) -> Result<AgentRecord, CodedError> {
        let mut state = self.state.lock().await;

        let entry = state.codes.get_mut(code).ok_or_else(|| {
            CodedError::new(ErrorCode::PairingExpired, "unknown or expired pairing code")
        })?;

        if entry.claimed {
            warn!(%code, "Rejected reuse of claimed pairing code");
            return Err(CodedError::new(
                ErrorCode::PairingReused,
                "pairing code was already claimed",
            ));
        }
        if now > entry.expires_at {
            return Err(CodedError::new(
                ErrorCode::PairingExpired,
                "pairing code has expired",
            ));
        }

        entry.claimed = true;
        let owning_user_id = entry.owning_user_id;

        let record = AgentRecord {
            agent_id: format!("agent-{}", Uuid::new_v4()),
            agent_key: generate_key(),
            owning_user_id,
            device_info: device_info.to_string(),
            paired_at: now,
            revoked_at: None,
        };

        if let Some(mut previous) = state.active_by_user.remove(&owning_user_id) {
            info!(
                user_id = owning_user_id,
                old_agent = %previous.agent_id,
                new_agent = %record.agent_id,
                "Superseding previously paired agent"
            );
            previous.revoked_at = Some(now);
            state
                .former_by_user
                .entry(owning_user_id)
                .or_default()
                .push(previous.agent_id.clone());
            state.revoked.insert(previous.agent_key.clone(), previous);
        }

        state
            .active_by_user
            .insert(owning_user_id, record.clone());

        info!(user_id = owning_user_id, agent_id = %record.agent_id, "Agent paired");
        Ok(record)
    }

    /// Resolve a bearer key to an agent id, with the grade of access the key
    /// still carries.
    pub async fn authenticate(
        &self,
        agent_key: &str,
        now: DateTime<Utc>,
    ) -> Result<(String, KeyGrade), CodedError> {
        let mut state = self.state.lock().await;

        if let Some(record) = state
            .active_by_user
            .values()
            .find(|record| record.agent_key == agent_key)
        {
            return Ok((record.agent_id.clone(), KeyGrade::Active));
        }

        // Superseded keys can still drain results for a bounded window, so an
        // inflight command finishes and only the next poll fails.
        if let Some(record) = state.revoked.get(agent_key) {
            let revoked_at = record.revoked_at.unwrap_or(record.paired_at);
            if now - revoked_at <= REVOKED_KEY_DRAIN {
                return Ok((record.agent_id.clone(), KeyGrade::Draining));
            }
            state.revoked.remove(agent_key);
        }

        Err(CodedError::new(
            ErrorCode::AuthUnauthorized,
            "unknown or revoked agent key",
        ))
    }

    /// Active agent for a user, if any.
    pub async fn active_agent_for_user(&self, owning_user_id: i64) -> Option<String> {
        let state = self.state.lock().await;
        state
            .active_by_user
            .get(&owning_user_id)
            .map(|record| record.agent_id.clone())
    }

    /// Every agent id that may hold results for this user: the active agent
    /// first, then superseded ones, most recent first.
    pub async fn agent_ids_for_user(&self, owning_user_id: i64) -> Vec<String> {
        let state = self.state.lock().await;
        let mut ids: Vec<String> = state
            .active_by_user
            .get(&owning_user_id)
            .map(|record| record.agent_id.clone())
            .into_iter()
            .collect();
        if let Some(former) = state.former_by_user.get(&owning_user_id) {
            ids.extend(former.iter().rev().cloned());
        }
        ids
    }
}

// Claimed codes stay until their window ends so reuse is reported distinctly
// from expiry; after that both collapse into "expired".
fn prune_expired_codes(state: &mut PairingState, now: DateTime<Utc>) {
    state.codes.retain(|_, entry| now <= entry.expires_at);
}

fn generate_code() -> String {
    let mut rng = rand::thread_rng();
    (0..CODE_LEN)
        .map(|_| {
            let idx = rng.gen_range(0..CODE_ALPHABET.len());
            CODE_ALPHABET[idx] as char
        })
        .collect()
}

fn generate_key() -> String {
    use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill(&mut bytes);
    format!("tk_{}", URL_SAFE_NO_PAD.encode(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn claim_twice_reports_reuse() {
        let svc = PairingService::new();
        let now = Utc::now();
        let (code, _) = svc.start_pairing(7, now).await;

        svc.claim_pairing(&code, "laptop", now).await.unwrap();
        let err = svc.claim_pairing(&code, "laptop", now).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::PairingReused);
    }

    #[tokio::test]
    async fn claim_after_expiry_reports_expired() {
        let svc = PairingService::new();
        let now = Utc::now();
        let (code, expires_at) = svc.start_pairing(7, now).await;
        assert_eq!(expires_at, now + PAIRING_CODE_TTL);

        let late = expires_at + Duration::seconds(1);
        let err = svc.claim_pairing(&code, "laptop", late).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::PairingExpired);
    }

    #[tokio::test]
    async fn unknown_code_reports_expired() {
        let svc = PairingService::new();
        let err = svc
            .claim_pairing("NOPE1234", "laptop", Utc::now())
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::PairingExpired);
    }

    #[tokio::test]
    async fn repairing_revokes_previous_key() {
        let svc = PairingService::new();
        let now = Utc::now();

        let (code_a, _) = svc.start_pairing(7, now).await;
        let first = svc.claim_pairing(&code_a, "laptop", now).await.unwrap();

        let (code_b, _) = svc.start_pairing(7, now).await;
        let second = svc.claim_pairing(&code_b, "desktop", now).await.unwrap();
        assert_ne!(first.agent_key, second.agent_key);

        // New key is fully active.
        let (agent_id, grade) = svc.authenticate(&second.agent_key, now).await.unwrap();
        assert_eq!(agent_id, second.agent_id);
        assert_eq!(grade, KeyGrade::Active);

        // Old key drains, then dies.
        let (_, grade) = svc.authenticate(&first.agent_key, now).await.unwrap();
        assert_eq!(grade, KeyGrade::Draining);

        let after_drain = now + REVOKED_KEY_DRAIN + Duration::seconds(1);
        let err = svc
            .authenticate(&first.agent_key, after_drain)
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::AuthUnauthorized);

        assert_eq!(
            svc.active_agent_for_user(7).await.as_deref(),
            Some(second.agent_id.as_str())
        );
        // Result pickup still knows about the superseded agent.
        assert_eq!(
            svc.agent_ids_for_user(7).await,
            vec![second.agent_id.clone(), first.agent_id.clone()]
        );
    }

    #[tokio::test]
    async fn codes_are_single_user_scoped() {
        let svc = PairingService::new();
        let now = Utc::now();
        let (code, _) = svc.start_pairing(42, now).await;
        let record = svc.claim_pairing(&code, "box", now).await.unwrap();
        assert_eq!(record.owning_user_id, 42);
        assert!(record.agent_key.starts_with("tk_"));
    }
}
