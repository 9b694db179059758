use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::NotifierError;

/// Top-level configuration, read from a JSON file at startup.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    pub aws: AwsConfig,
    #[serde(default)]
    pub webhook: WebhookConfig,
    #[serde(default)]
    pub start: StartConfig,
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        let config: Config = serde_json::from_str(&raw)
            .with_context(|| format!("failed to parse config {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.aws.validate()?;
        let url = reqwest::Url::parse(&self.server.self_url)
            .with_context(|| format!("invalid server.self_url {:?}", self.server.self_url))?;
        if url.host_str().is_none() {
            return Err(anyhow!("server.self_url must include a host"));
        }
        Ok(())
    }
}

// ─── Server ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Externally reachable scheme and host of this instance, e.g.
    /// `https://scytale-1.example.com`.
    #[serde(default)]
    pub self_url: String,
    #[serde(default = "default_hooks_path")]
    pub hooks_path: String,
}

fn default_listen() -> String {
    "0.0.0.0:6100".into()
}
fn default_hooks_path() -> String {
    "/hooks".into()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            self_url: String::new(),
            hooks_path: default_hooks_path(),
        }
    }
}

// ─── AWS / SNS ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SnsConfig {
    #[serde(default)]
    pub region: String,
    #[serde(default = "default_protocol")]
    pub protocol: String,
    #[serde(default)]
    pub topic_arn: String,
    #[serde(default)]
    pub url_path: String,
}

fn default_protocol() -> String {
    "https".into()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AwsConfig {
    #[serde(default)]
    pub access_key: String,
    #[serde(default)]
    pub secret_key: String,
    /// Environment tag attached to every publish and required on every
    /// inbound notification.
    #[serde(default)]
    pub env: String,
    pub sns: SnsConfig,
    #[serde(default = "default_publish_buffer")]
    pub publish_buffer: usize,
    #[serde(default = "default_publish_timeout_secs")]
    pub publish_timeout_secs: u64,
    #[serde(default = "default_subscribe_retry_secs")]
    pub subscribe_retry_secs: u64,
    /// `None` retries forever.
    #[serde(default)]
    pub max_subscribe_attempts: Option<u32>,
    /// How long to wait for our own hostname to resolve before subscribing.
    /// Subscribing proceeds once this elapses. Zero disables the check.
    #[serde(default)]
    pub dns_wait_secs: u64,
}

fn default_publish_buffer() -> usize {
    50
}
fn default_publish_timeout_secs() -> u64 {
    5
}
fn default_subscribe_retry_secs() -> u64 {
    5
}

impl Default for AwsConfig {
    fn default() -> Self {
        Self {
            access_key: String::new(),
            secret_key: String::new(),
            env: String::new(),
            sns: SnsConfig {
                protocol: default_protocol(),
                ..Default::default()
            },
            publish_buffer: default_publish_buffer(),
            publish_timeout_secs: default_publish_timeout_secs(),
            subscribe_retry_secs: default_subscribe_retry_secs(),
            max_subscribe_attempts: None,
            dns_wait_secs: 0,
        }
    }
}

impl AwsConfig {
    pub fn validate(&self) -> Result<(), NotifierError> {
        let required = [
            ("aws.sns.region", &self.sns.region),
            ("aws.sns.topic_arn", &self.sns.topic_arn),
            ("aws.sns.url_path", &self.sns.url_path),
            ("aws.sns.protocol", &self.sns.protocol),
        ];
        for (name, value) in required {
            if value.trim().is_empty() {
                return Err(NotifierError::InvalidConfig(format!("{name} is required")));
            }
        }
        if self.access_key.is_empty() != self.secret_key.is_empty() {
            return Err(NotifierError::InvalidConfig(
                "aws.access_key and aws.secret_key must be set together".into(),
            ));
        }
        if self.publish_buffer == 0 {
            return Err(NotifierError::InvalidConfig(
                "aws.publish_buffer must be positive".into(),
            ));
        }
        Ok(())
    }

    pub fn publish_timeout(&self) -> Duration {
        Duration::from_secs(self.publish_timeout_secs)
    }

    pub fn subscribe_retry(&self) -> Duration {
        Duration::from_secs(self.subscribe_retry_secs)
    }

    pub fn dns_wait(&self) -> Duration {
        Duration::from_secs(self.dns_wait_secs)
    }
}

// ─── Webhook registry ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookConfig {
    #[serde(default = "default_max_duration_secs")]
    pub max_duration_secs: u64,
    #[serde(default = "default_undertaker_interval_secs")]
    pub undertaker_interval_secs: u64,
    #[serde(default = "default_changes_buffer")]
    pub changes_buffer: usize,
}

fn default_max_duration_secs() -> u64 {
    300
}
fn default_undertaker_interval_secs() -> u64 {
    60
}
fn default_changes_buffer() -> usize {
    100
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            max_duration_secs: default_max_duration_secs(),
            undertaker_interval_secs: default_undertaker_interval_secs(),
            changes_buffer: default_changes_buffer(),
        }
    }
}

impl WebhookConfig {
    pub fn max_duration(&self) -> Duration {
        Duration::from_secs(self.max_duration_secs)
    }

    pub fn undertaker_interval(&self) -> Duration {
        Duration::from_secs(self.undertaker_interval_secs.max(1))
    }
}

// ─── Startup bootstrap ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SatConfig {
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub secret: String,
    #[serde(default)]
    pub capabilities: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartConfig {
    /// Peer endpoint returning the current hook list. Empty disables the
    /// bootstrap fetch.
    #[serde(default)]
    pub api_path: String,
    /// Full `Authorization` header value, scheme included (for example
    /// `Basic dXNlcjpwYXNz`), used when no SAT issuer is configured.
    #[serde(default)]
    pub auth_delivery: String,
    #[serde(default = "default_start_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_start_retry_secs")]
    pub retry_secs: u64,
    #[serde(default)]
    pub sat: SatConfig,
}

fn default_start_timeout_secs() -> u64 {
    60
}
fn default_start_retry_secs() -> u64 {
    2
}

impl Default for StartConfig {
    fn default() -> Self {
        Self {
            api_path: String::new(),
            auth_delivery: String::new(),
            timeout_secs: default_start_timeout_secs(),
            retry_secs: default_start_retry_secs(),
            sat: SatConfig::default(),
        }
    }
}

impl StartConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_secs(self.retry_secs)
    }
}
