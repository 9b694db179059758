use crate::config::StartConfig;
use crate::error::BootstrapError;
use crate::types::{decode_hooks, Webhook};
use reqwest::header::AUTHORIZATION;
use serde::Deserialize;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

const CLIENT_ID_HEADER: &str = "X-Client-Id";
const CLIENT_SECRET_HEADER: &str = "X-Client-Secret";

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SatResponse {
    #[serde(default)]
    service_access_token: String,
}

/// Fetches the fleet's current hook list from a peer at startup.
pub struct Bootstrapper {
    config: StartConfig,
    client: reqwest::Client,
    token: Mutex<Option<String>>,
}

impl Bootstrapper {
    pub fn new(config: StartConfig, client: reqwest::Client) -> Self {
        Self {
            config,
            client,
            token: Mutex::new(None),
        }
    }

    pub fn is_configured(&self) -> bool {
        !self.config.api_path.is_empty()
    }

    /// Poll the peer until it returns a non-empty list or the configured
    /// timeout elapses.
    pub async fn fetch_hooks(&self) -> Result<Vec<Webhook>, BootstrapError> {
        let timeout = self.config.timeout();
        tokio::select! {
            hooks = self.poll() => Ok(hooks),
            _ = tokio::time::sleep(timeout) => {
                warn!(?timeout, api_path = %self.config.api_path, "hook bootstrap timed out");
                Err(BootstrapError::Timeout(timeout))
            }
        }
    }

    async fn poll(&self) -> Vec<Webhook> {
        let retry: Duration = self.config.retry_interval();
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            match self.fetch_once().await {
                Ok(hooks) => {
                    info!(count = hooks.len(), attempt, "obtained current hook list");
                    return hooks;
                }
                Err(BootstrapError::Empty) => debug!(attempt, "peer hook list empty, retrying"),
                Err(e) => warn!(attempt, error = %e, "hook list request failed, retrying"),
            }
            tokio::time::sleep(retry).await;
        }
    }

    async fn fetch_once(&self) -> Result<Vec<Webhook>, BootstrapError> {
        let mut req = self.client.get(&self.config.api_path);
        if let Some(authorization) = self.authorization().await? {
            req = req.header(AUTHORIZATION, authorization);
        }

        let resp = req.send().await?;
        let status = resp.status();
        if !status.is_success() {
            if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
                // Force a fresh token on the next attempt.
                self.token.lock().await.take();
            }
            return Err(BootstrapError::Status(status.as_u16()));
        }

        let body = resp.bytes().await?;
        let hooks = decode_hooks(&body)?;
        if hooks.is_empty() {
            return Err(BootstrapError::Empty);
        }
        Ok(hooks)
    }

    /// `Bearer <SAT>` when an issuer is configured, otherwise the static
    /// `auth_delivery` header, otherwise nothing.
    async fn authorization(&self) -> Result<Option<String>, BootstrapError> {
        if self.config.sat.path.is_empty() {
            return Ok(Some(self.config.auth_delivery.clone()).filter(|a| !a.is_empty()));
        }

        let mut cached = self.token.lock().await;
        if let Some(token) = cached.as_ref() {
            return Ok(Some(format!("Bearer {token}")));
        }

        let token = self.fetch_token().await?;
        *cached = Some(token.clone());
        Ok(Some(format!("Bearer {token}")))
    }

    async fn fetch_token(&self) -> Result<String, BootstrapError> {
        let sat = &self.config.sat;
        let mut req = self
            .client
            .get(&sat.path)
            .header(CLIENT_ID_HEADER, &sat.id)
            .header(CLIENT_SECRET_HEADER, &sat.secret);
        if !sat.capabilities.is_empty() {
            req = req.query(&[("capabilities", sat.capabilities.as_str())]);
        }

        let resp = req
            .send()
            .await
            .map_err(|e| BootstrapError::Auth(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(BootstrapError::Auth(format!(
                "issuer returned HTTP {}",
                resp.status()
            )));
        }
        let body: SatResponse = resp
            .json()
            .await
            .map_err(|e| BootstrapError::Auth(format!("undecodable issuer response: {e}")))?;
        if body.service_access_token.is_empty() {
            return Err(BootstrapError::Auth("issuer returned no token".into()));
        }
        debug!("obtained service access token");
        Ok(body.service_access_token)
    }
}
