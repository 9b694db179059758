use crate::error::HandlerError;
use crate::sns::message::{
    MESSAGE_TYPE_HEADER, TYPE_NOTIFICATION, TYPE_SUBSCRIPTION_CONFIRMATION,
    TYPE_UNSUBSCRIBE_CONFIRMATION,
};
use crate::sns::Notifier;
use crate::store::{prune_expired, Registry};
use crate::types::{decode_hook, Webhook};
use axum::http::{HeaderMap, StatusCode};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Ties the registry to the notifier.
///
/// All registry writes go through one listener task: hook lists arriving on
/// the changes channel are upserted, and an undertaker tick prunes expired
/// entries.
pub struct Monitor {
    registry: Registry,
    notifier: Arc<dyn Notifier>,
    changes: mpsc::Sender<Vec<Webhook>>,
    shutdown: watch::Sender<bool>,
}

impl Monitor {
    /// Build the monitor and spawn its listener.
    pub fn start(
        registry: Registry,
        notifier: Arc<dyn Notifier>,
        undertaker_interval: Duration,
        changes_buffer: usize,
    ) -> (Arc<Self>, JoinHandle<()>) {
        let (changes, changes_rx) = mpsc::channel(changes_buffer.max(1));
        let (shutdown, shutdown_rx) = watch::channel(false);

        let listener = tokio::spawn(listen(
            registry.clone(),
            changes_rx,
            undertaker_interval,
            shutdown_rx,
        ));

        let monitor = Arc::new(Self {
            registry,
            notifier,
            changes,
            shutdown,
        });
        (monitor, listener)
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn notifier(&self) -> &Arc<dyn Notifier> {
        &self.notifier
    }

    /// Queue hooks for the listener without waiting. Returns `false` if the
    /// queue is full or the listener has stopped.
    pub fn enqueue(&self, hooks: Vec<Webhook>) -> bool {
        match self.changes.try_send(hooks) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(dropped)) => {
                warn!(count = dropped.len(), "webhook change queue full, dropping update");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                warn!("webhook listener stopped, dropping update");
                false
            }
        }
    }

    pub fn stop(&self) {
        self.shutdown.send_replace(true);
    }

    /// Entry point for SNS callbacks, dispatched on the message type header.
    pub async fn handle_sns(
        &self,
        headers: &HeaderMap,
        body: &[u8],
    ) -> Result<StatusCode, HandlerError> {
        let message_type = headers
            .get(MESSAGE_TYPE_HEADER)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();

        match message_type {
            TYPE_SUBSCRIPTION_CONFIRMATION => {
                self.notifier.subscribe_confirm_handle(body).await?;
                Ok(StatusCode::OK)
            }
            TYPE_NOTIFICATION => self.handle_notification(headers, body).await,
            TYPE_UNSUBSCRIBE_CONFIRMATION => {
                info!("received SNS UnsubscribeConfirmation");
                Ok(StatusCode::OK)
            }
            other => Err(HandlerError::bad_request(format!(
                "unsupported SNS message type {other:?}"
            ))),
        }
    }

    async fn handle_notification(
        &self,
        headers: &HeaderMap,
        body: &[u8],
    ) -> Result<StatusCode, HandlerError> {
        let payload = self.notifier.notification_handle(headers, body).await?;

        let hook = decode_hook(&payload).map_err(|e| {
            warn!(error = %e, "SNS notification does not carry a webhook");
            HandlerError::bad_request(format!("invalid webhook payload: {e}"))
        })?;

        debug!(url = %hook.config.url, "webhook update received");
        // SNS only retries on error responses, so a full queue loses this
        // delivery. The next registration refresh will carry it again.
        self.enqueue(vec![hook]);
        Ok(StatusCode::OK)
    }
}

async fn listen(
    registry: Registry,
    mut changes: mpsc::Receiver<Vec<Webhook>>,
    undertaker_interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut undertaker = tokio::time::interval(undertaker_interval);
    undertaker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick fires immediately; nothing can have expired yet.
    undertaker.tick().await;

    loop {
        tokio::select! {
            update = changes.recv() => match update {
                Some(hooks) => {
                    let count = hooks.len();
                    registry.update(hooks);
                    debug!(count, total = registry.len(), "webhook list updated");
                }
                None => return,
            },
            _ = undertaker.tick() => {
                let before = registry.len();
                registry.filter(prune_expired(Utc::now()));
                let removed = before.saturating_sub(registry.len());
                if removed > 0 {
                    info!(removed, total = registry.len(), "expired webhooks removed");
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    return;
                }
            }
        }
    }
}
