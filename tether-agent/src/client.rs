//! HTTP client for the backend daemon.
//!
//! Thin wrapper over `reqwest` speaking the three agent-facing routes:
//! claim, poll and result. Transport failures are surfaced as errors for the
//! dispatcher's retry loop to absorb; an empty poll is a normal outcome.

use std::time::Duration;

use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tether_contract::{CommandEnvelope, CommandResult};
use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("unauthorized: agent key rejected by backend")]
    Unauthorized,
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("unexpected status {0}")]
    UnexpectedStatus(StatusCode),
    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

#[derive(Debug, Serialize)]
struct ClaimRequest<'a> {
    pairing_code: &'a str,
    device_info: &'a str,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ClaimedCredentials {
    pub agent_id: String,
    pub agent_key: String,
}

pub struct BackendClient {
    http: reqwest::Client,
    base_url: String,
    agent_key: String,
}

impl BackendClient {
    pub fn new(base_url: &str, agent_key: &str) -> Result<Self, ClientError> {
        // The poll request itself blocks server-side for up to 25s; leave
        // headroom on top of that before the transport gives up.
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(40))
            .build()?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            agent_key: agent_key.to_string(),
        })
    }

    /// One-time pairing claim; does not need an agent key yet.
    pub async fn claim_pairing(
        base_url: &str,
        pairing_code: &str,
        device_info: &str,
    ) -> Result<ClaimedCredentials, ClientError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        let url = format!("{}/pair/claim", base_url.trim_end_matches('/'));
        let response = http
            .post(url)
            .json(&ClaimRequest {
                pairing_code,
                device_info,
            })
            .send()
            .await?;

        match response.status() {
            StatusCode::OK => response
                .json::<ClaimedCredentials>()
                .await
                .map_err(|err| ClientError::InvalidResponse(err.to_string())),
            status => {
                let body = response.text().await.unwrap_or_default();
                Err(ClientError::InvalidResponse(format!(
                    "claim failed with {status}: {body}"
                )))
            }
        }
    }

    /// Long-poll for the next command. `None` means no work within the
    /// timeout.
    pub async fn poll(&self, timeout: Duration) -> Result<Option<CommandEnvelope>, ClientError> {
        let url = format!(
            "{}/poll?timeout_seconds={}",
            self.base_url,
            timeout.as_secs()
        );
        let response = self
            .http
            .get(url)
            .bearer_auth(&self.agent_key)
            .send()
            .await?;

        match response.status() {
            StatusCode::OK => {
                let command = response
                    .json::<CommandEnvelope>()
                    .await
                    .map_err(|err| ClientError::InvalidResponse(err.to_string()))?;
                debug!(command_id = %command.command_id, "Polled command");
                Ok(Some(command))
            }
            StatusCode::NO_CONTENT => Ok(None),
            StatusCode::UNAUTHORIZED => Err(ClientError::Unauthorized),
            status => Err(ClientError::UnexpectedStatus(status)),
        }
    }

    /// Post a result for a completed (or failed) command.
    pub async fn post_result(&self, result: &CommandResult) -> Result<(), ClientError> {
        let url = format!("{}/result", self.base_url);
        let response = self
            .http
            .post(url)
            .bearer_auth(&self.agent_key)
            .json(result)
            .send()
            .await?;

        match response.status() {
            StatusCode::OK => Ok(()),
            StatusCode::UNAUTHORIZED => Err(ClientError::Unauthorized),
            status => Err(ClientError::UnexpectedStatus(status)),
        }
    }
}
