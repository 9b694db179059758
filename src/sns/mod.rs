//! AWS SNS bridge: keeps this instance subscribed to the shared topic,
//! verifies inbound callbacks and publishes outbound hook registrations.
//!
//! Lifecycle: `Unsubscribed -> Pending -> Confirmed`. Any loss of the
//! subscription (`not_ready`) returns to `Unsubscribed`, stops the publish
//! worker and makes `publish_message` reject until the next confirmation.

pub mod client;
pub mod message;

use crate::config::AwsConfig;
use crate::error::{HandlerError, NotifierError};
use crate::verification::SignatureValidator;
use arc_swap::ArcSwap;
use async_trait::async_trait;
use axum::http::HeaderMap;
use chrono::{DateTime, Utc};
use client::{SnsApi, TopicSubscription};
use message::{
    SnsMessage, ENV_ATTRIBUTE, PENDING_CONFIRMATION, SUBSCRIPTION_ARN_HEADER, TYPE_NOTIFICATION,
    TYPE_SUBSCRIPTION_CONFIRMATION,
};
use reqwest::Url;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

const CERT_FETCH_TIMEOUT: Duration = Duration::from_secs(10);
const DNS_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Where this process stands with respect to its SNS subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscriptionState {
    Unsubscribed,
    Pending,
    Confirmed(String),
}

impl SubscriptionState {
    fn from_arn(arn: &str) -> Self {
        if arn.is_empty() || arn.eq_ignore_ascii_case(PENDING_CONFIRMATION) {
            Self::Pending
        } else {
            Self::Confirmed(arn.to_string())
        }
    }
}

/// Capability the monitor and HTTP handlers depend on.
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Subscribe this instance's endpoint to the topic, retrying on failure.
    async fn subscribe(&self) -> Result<(), NotifierError>;

    /// Queue `message` for publishing to the topic.
    async fn publish_message(&self, message: String) -> Result<(), NotifierError>;

    async fn unsubscribe(&self, subscription_arn: &str) -> Result<(), NotifierError>;

    /// Handle a `SubscriptionConfirmation` callback body.
    async fn subscribe_confirm_handle(&self, body: &[u8]) -> Result<(), HandlerError>;

    /// Handle a `Notification` callback, returning the inner `Message` bytes.
    async fn notification_handle(
        &self,
        headers: &HeaderMap,
        body: &[u8],
    ) -> Result<Vec<u8>, HandlerError>;

    fn validate_subscription_arn(&self, subscription_arn: &str) -> bool;

    /// Succeeds once this instance's own hostname resolves.
    async fn dns_ready(&self) -> Result<(), NotifierError>;
}

pub struct SnsServer {
    config: AwsConfig,
    api: Arc<dyn SnsApi>,
    validator: SignatureValidator,
    self_url: Url,
    state: ArcSwap<SubscriptionState>,
    publish_tx: mpsc::Sender<String>,
    publish_rx: Arc<Mutex<mpsc::Receiver<String>>>,
    quit: watch::Sender<bool>,
}

impl SnsServer {
    /// `self_base` is the externally reachable base URL, optionally with a
    /// path prefix; the SNS endpoint becomes `<self_base><url_path>/<unix seconds>`.
    pub fn new(
        config: AwsConfig,
        api: Arc<dyn SnsApi>,
        self_base: &str,
    ) -> Result<Self, NotifierError> {
        Self::with_start_time(config, api, self_base, Utc::now())
    }

    pub fn with_start_time(
        config: AwsConfig,
        api: Arc<dyn SnsApi>,
        self_base: &str,
        started: DateTime<Utc>,
    ) -> Result<Self, NotifierError> {
        config.validate()?;

        let mut self_url = Url::parse(self_base)
            .map_err(|e| NotifierError::InvalidConfig(format!("self url {self_base:?}: {e}")))?;
        // Any path prefix on the base (a load balancer route) is kept.
        let path = format!(
            "{}/{}/{}",
            self_url.path().trim_end_matches('/'),
            config.sns.url_path.trim_matches('/'),
            started.timestamp()
        );
        self_url.set_path(&path);

        let http = reqwest::Client::builder()
            .timeout(CERT_FETCH_TIMEOUT)
            .build()
            .map_err(|e| NotifierError::InvalidConfig(format!("http client: {e}")))?;

        let (publish_tx, publish_rx) = mpsc::channel(config.publish_buffer);
        let (quit, _) = watch::channel(false);

        Ok(Self {
            config,
            api,
            validator: SignatureValidator::new(http),
            self_url,
            state: ArcSwap::from_pointee(SubscriptionState::Unsubscribed),
            publish_tx,
            publish_rx: Arc::new(Mutex::new(publish_rx)),
            quit,
        })
    }

    /// Full SNS endpoint of this process, timestamp suffix included.
    pub fn self_url(&self) -> &Url {
        &self.self_url
    }

    /// Path component of [`Self::self_url`], used to mount the callback route.
    pub fn callback_path(&self) -> &str {
        self.self_url.path()
    }

    pub fn subscription_state(&self) -> SubscriptionState {
        SubscriptionState::clone(&self.state.load())
    }

    /// Start the publish worker and subscribe on a background task.
    pub fn prepare_and_start(self: &Arc<Self>) -> JoinHandle<()> {
        self.start_publisher();
        let server = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = server.subscribe().await {
                error!(error = %e, "giving up on SNS subscription");
            }
        })
    }

    /// Spawn the worker draining the publish queue into SNS.
    pub fn start_publisher(&self) -> JoinHandle<()> {
        self.quit.send_replace(false);
        let worker = PublishWorker {
            api: Arc::clone(&self.api),
            topic_arn: self.config.sns.topic_arn.clone(),
            env: self.config.env.clone(),
        };
        let rx = Arc::clone(&self.publish_rx);
        let quit = self.quit.subscribe();
        tokio::spawn(worker.run(rx, quit))
    }

    /// Drop back to `Unsubscribed` and stop the publish worker.
    pub fn not_ready(&self) {
        self.state.store(Arc::new(SubscriptionState::Unsubscribed));
        self.quit.send_replace(true);
        warn!(topic_arn = %self.config.sns.topic_arn, "SNS subscription marked not ready");
    }

    /// Subscriptions on the topic left behind by earlier runs of this endpoint.
    pub async fn list_subscriptions_by_matching_endpoint(
        &self,
    ) -> Result<Vec<String>, NotifierError> {
        self.sweeper().stale_subscriptions().await
    }

    /// Unsubscribe every stale subscription, returning how many were removed.
    pub async fn unsubscribe_old_subscriptions(&self) -> Result<usize, NotifierError> {
        self.sweeper().run().await
    }

    fn sweeper(&self) -> StaleSweep {
        StaleSweep {
            api: Arc::clone(&self.api),
            topic_arn: self.config.sns.topic_arn.clone(),
            self_url: self.self_url.clone(),
        }
    }

    async fn wait_for_dns(&self) -> Result<(), NotifierError> {
        let deadline = tokio::time::Instant::now() + self.config.dns_wait();
        loop {
            match self.dns_ready().await {
                Ok(()) => return Ok(()),
                Err(e) if tokio::time::Instant::now() >= deadline => return Err(e),
                Err(e) => {
                    debug!(error = %e, "waiting for DNS");
                    tokio::time::sleep(DNS_POLL_INTERVAL).await;
                }
            }
        }
    }

    async fn check_signature(&self, msg: &SnsMessage) -> Result<(), HandlerError> {
        match self.validator.validate(msg).await {
            Ok(true) => Ok(()),
            Ok(false) => {
                error!(
                    message_id = %msg.message_id,
                    topic_arn = %msg.topic_arn,
                    "SNS message signature did not verify"
                );
                Err(HandlerError::bad_request("invalid SNS message signature"))
            }
            Err(e) => {
                error!(
                    message_id = %msg.message_id,
                    topic_arn = %msg.topic_arn,
                    error = %e,
                    "SNS message signature could not be checked"
                );
                Err(HandlerError::bad_request(format!(
                    "SNS signature validation failed: {e}"
                )))
            }
        }
    }

    fn check_topic(&self, msg: &SnsMessage) -> Result<(), HandlerError> {
        if msg.topic_arn.eq_ignore_ascii_case(&self.config.sns.topic_arn) {
            return Ok(());
        }
        error!(
            message_id = %msg.message_id,
            topic_arn = %msg.topic_arn,
            expected = %self.config.sns.topic_arn,
            "SNS message topic does not match"
        );
        Err(HandlerError::bad_request("TopicArn does not match"))
    }
}

fn decode_message(body: &[u8], expected_type: &str) -> Result<SnsMessage, HandlerError> {
    let msg: SnsMessage = serde_json::from_slice(body).map_err(|e| {
        error!(error = %e, "undecodable SNS message");
        HandlerError::bad_request(format!("invalid SNS message: {e}"))
    })?;
    if msg.message_type != expected_type {
        error!(
            message_id = %msg.message_id,
            message_type = %msg.message_type,
            expected = expected_type,
            "unexpected SNS message type"
        );
        return Err(HandlerError::bad_request(format!(
            "unexpected SNS message type {:?}",
            msg.message_type
        )));
    }
    Ok(msg)
}

#[async_trait]
impl Notifier for SnsServer {
    async fn subscribe(&self) -> Result<(), NotifierError> {
        if !self.config.dns_wait().is_zero() {
            if let Err(e) = self.wait_for_dns().await {
                warn!(error = %e, "DNS still not ready, subscribing anyway");
            }
        }

        let endpoint = self.self_url.to_string();
        let topic_arn = &self.config.sns.topic_arn;
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;
            match self
                .api
                .subscribe(topic_arn, &self.config.sns.protocol, &endpoint)
                .await
            {
                Ok(arn) => {
                    let reported = SubscriptionState::from_arn(&arn);
                    // A confirmation callback can land before Subscribe returns.
                    self.state.rcu(|current| match **current {
                        SubscriptionState::Confirmed(_) => SubscriptionState::clone(current),
                        _ => reported.clone(),
                    });
                    info!(%topic_arn, %endpoint, attempt, state = ?self.subscription_state(), "subscribed to SNS topic");
                    return Ok(());
                }
                Err(e) => {
                    if self
                        .config
                        .max_subscribe_attempts
                        .is_some_and(|max| attempt >= max)
                    {
                        return Err(e);
                    }
                    warn!(%topic_arn, attempt, error = %e, "SNS subscribe failed, retrying");
                    tokio::time::sleep(self.config.subscribe_retry()).await;
                }
            }
        }
    }

    async fn publish_message(&self, message: String) -> Result<(), NotifierError> {
        if !matches!(**self.state.load(), SubscriptionState::Confirmed(_)) {
            return Err(NotifierError::NotReady);
        }
        let timeout = self.config.publish_timeout();
        self.publish_tx
            .send_timeout(message, timeout)
            .await
            .map_err(|e| match e {
                mpsc::error::SendTimeoutError::Timeout(_) => {
                    warn!(?timeout, "publish queue full, dropping message");
                    NotifierError::PublishTimeout(timeout)
                }
                mpsc::error::SendTimeoutError::Closed(_) => NotifierError::Closed,
            })
    }

    async fn unsubscribe(&self, subscription_arn: &str) -> Result<(), NotifierError> {
        self.api.unsubscribe(subscription_arn).await?;
        info!(%subscription_arn, "unsubscribed from SNS topic");
        Ok(())
    }

    async fn subscribe_confirm_handle(&self, body: &[u8]) -> Result<(), HandlerError> {
        let msg = decode_message(body, TYPE_SUBSCRIPTION_CONFIRMATION)?;
        self.check_signature(&msg).await?;
        self.check_topic(&msg)?;

        let token = msg.token.as_deref().unwrap_or_default();
        if token.is_empty() {
            return Err(HandlerError::bad_request("SubscriptionConfirmation without Token"));
        }

        let arn = self
            .api
            .confirm_subscription(&msg.topic_arn, token)
            .await
            .map_err(|e| {
                error!(message_id = %msg.message_id, error = %e, "SNS confirm subscription failed");
                HandlerError::internal("failed to confirm SNS subscription")
            })?;

        let confirmed = SubscriptionState::from_arn(&arn);
        if !matches!(confirmed, SubscriptionState::Confirmed(_)) {
            error!(message_id = %msg.message_id, "ConfirmSubscription returned no subscription ARN");
            return Err(HandlerError::internal("SNS did not return a subscription ARN"));
        }
        self.state.store(Arc::new(confirmed));
        info!(subscription_arn = %arn, "SNS subscription confirmed");

        let sweep = self.sweeper();
        tokio::spawn(async move {
            if let Err(e) = sweep.run().await {
                warn!(error = %e, "stale SNS subscription cleanup failed");
            }
        });
        Ok(())
    }

    async fn notification_handle(
        &self,
        headers: &HeaderMap,
        body: &[u8],
    ) -> Result<Vec<u8>, HandlerError> {
        let subscription_arn = headers
            .get(SUBSCRIPTION_ARN_HEADER)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();
        if !self.validate_subscription_arn(subscription_arn) {
            // 5xx so SNS redelivers once our own confirmation has landed.
            warn!(%subscription_arn, state = ?self.subscription_state(), "notification for unknown subscription");
            return Err(HandlerError::internal("invalid SubscriptionArn"));
        }

        let msg = decode_message(body, TYPE_NOTIFICATION)?;
        self.check_signature(&msg).await?;
        self.check_topic(&msg)?;

        let env = msg.attribute(ENV_ATTRIBUTE).unwrap_or_default();
        if env != self.config.env {
            error!(
                message_id = %msg.message_id,
                msg_env = %env,
                env = %self.config.env,
                "SNS message environment does not match"
            );
            return Err(HandlerError::bad_request(
                "SNS message env does not match this environment",
            ));
        }

        debug!(message_id = %msg.message_id, "accepted SNS notification");
        Ok(msg.message.into_bytes())
    }

    fn validate_subscription_arn(&self, subscription_arn: &str) -> bool {
        match &**self.state.load() {
            SubscriptionState::Confirmed(current) => current == subscription_arn,
            _ => false,
        }
    }

    async fn dns_ready(&self) -> Result<(), NotifierError> {
        let host = self.self_url.host_str().unwrap_or_default().to_string();
        let port = self.self_url.port_or_known_default().unwrap_or(443);
        let dns_err = |reason: String| NotifierError::Dns {
            host: host.clone(),
            reason,
        };

        let mut addrs = tokio::net::lookup_host((host.as_str(), port))
            .await
            .map_err(|e| dns_err(e.to_string()))?;
        match addrs.next() {
            Some(_) => Ok(()),
            None => Err(dns_err("no addresses".to_string())),
        }
    }
}

// ─── Publish worker ──────────────────────────────────────────────────────────

struct PublishWorker {
    api: Arc<dyn SnsApi>,
    topic_arn: String,
    env: String,
}

impl PublishWorker {
    async fn run(self, rx: Arc<Mutex<mpsc::Receiver<String>>>, mut quit: watch::Receiver<bool>) {
        let mut rx = rx.lock().await;
        loop {
            tokio::select! {
                changed = quit.changed() => {
                    if changed.is_err() || *quit.borrow() {
                        debug!("SNS publish worker stopping");
                        return;
                    }
                }
                next = rx.recv() => match next {
                    Some(message) => self.publish(&message).await,
                    None => return,
                },
            }
        }
    }

    async fn publish(&self, message: &str) {
        let attributes = [(ENV_ATTRIBUTE, self.env.as_str())];
        match self.api.publish(&self.topic_arn, message, &attributes).await {
            Ok(message_id) => debug!(%message_id, "published to SNS"),
            Err(e) => error!(topic_arn = %self.topic_arn, error = %e, "SNS publish failed"),
        }
    }
}

// ─── Stale subscription sweep ────────────────────────────────────────────────

#[derive(Clone)]
struct StaleSweep {
    api: Arc<dyn SnsApi>,
    topic_arn: String,
    self_url: Url,
}

impl StaleSweep {
    async fn stale_subscriptions(&self) -> Result<Vec<String>, NotifierError> {
        let mut stale = Vec::new();
        let mut next_token = None;
        loop {
            let page = self
                .api
                .list_subscriptions_by_topic(&self.topic_arn, next_token)
                .await?;
            stale.extend(stale_arns(&page.subscriptions, self.self_url.as_str()));
            match page.next_token {
                Some(token) if !token.is_empty() => next_token = Some(token),
                _ => return Ok(stale),
            }
        }
    }

    async fn run(&self) -> Result<usize, NotifierError> {
        let stale = self.stale_subscriptions().await?;
        let mut removed = 0;
        for arn in &stale {
            match self.api.unsubscribe(arn).await {
                Ok(()) => {
                    removed += 1;
                    info!(subscription_arn = %arn, "removed stale SNS subscription");
                }
                Err(e) => warn!(subscription_arn = %arn, error = %e, "failed to remove stale SNS subscription"),
            }
        }
        Ok(removed)
    }
}

/// Split `<base>/<unix seconds>` endpoints.
fn split_timestamp(endpoint: &str) -> Option<(&str, i64)> {
    let (base, suffix) = endpoint.rsplit_once('/')?;
    suffix.parse().ok().map(|ts| (base, ts))
}

/// Subscriptions sharing our endpoint base with an older timestamp suffix.
fn stale_arns(subscriptions: &[TopicSubscription], current: &str) -> Vec<String> {
    let Some((base, current_ts)) = split_timestamp(current) else {
        return Vec::new();
    };
    subscriptions
        .iter()
        .filter(|sub| sub.endpoint != current)
        .filter(|sub| !sub.subscription_arn.eq_ignore_ascii_case(PENDING_CONFIRMATION))
        .filter(|sub| {
            matches!(split_timestamp(&sub.endpoint), Some((b, ts)) if b == base && ts < current_ts)
        })
        .map(|sub| sub.subscription_arn.clone())
        .collect()
}
