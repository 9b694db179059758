use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::signal;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;
use xmidt_webhook::bootstrap::Bootstrapper;
use xmidt_webhook::config::Config;
use xmidt_webhook::sns::client::AwsSns;
use xmidt_webhook::{http_server, Monitor, Notifier, Registry, SnsServer};

const DEFAULT_CONFIG_PATH: &str = "webhook.json";

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => tracing::info!("received SIGINT"),
        () = terminate => tracing::info!("received SIGTERM"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string());
    let config = Config::load(&config_path)?;
    tracing::info!(config_path = %config_path, env = %config.aws.env, "starting xmidt-webhook");

    // ---- SNS notifier ----
    let api = Arc::new(AwsSns::from_config(&config.aws).await);
    let sns = Arc::new(
        SnsServer::new(config.aws.clone(), api, &config.server.self_url)
            .context("failed to configure SNS notifier")?,
    );
    tracing::info!(endpoint = %sns.self_url(), "SNS endpoint");

    // ---- Registry + monitor ----
    let registry = Registry::new(config.webhook.max_duration());
    let notifier: Arc<dyn Notifier> = sns.clone();
    let (monitor, listener) = Monitor::start(
        registry,
        notifier,
        config.webhook.undertaker_interval(),
        config.webhook.changes_buffer,
    );

    // ---- Bootstrap from a peer ----
    let http_client = reqwest::Client::builder()
        .user_agent("xmidt-webhook/0.1")
        .build()
        .context("failed to build reqwest client")?;
    let bootstrapper = Bootstrapper::new(config.start.clone(), http_client);
    if bootstrapper.is_configured() {
        let monitor = Arc::clone(&monitor);
        tokio::spawn(async move {
            match bootstrapper.fetch_hooks().await {
                Ok(hooks) => {
                    monitor.enqueue(hooks);
                }
                Err(e) => tracing::error!(error = %e, "starting with an empty webhook list"),
            }
        });
    }

    // ---- HTTP ----
    let app = http_server::router(
        Arc::clone(&monitor),
        &config.server.hooks_path,
        sns.callback_path(),
    );
    let tcp = tokio::net::TcpListener::bind(&config.server.listen)
        .await
        .with_context(|| format!("failed to bind {}", config.server.listen))?;
    let server = tokio::spawn(http_server::serve(tcp, app, shutdown_signal()));

    // The callback route is bound, so SNS can reach the confirmation handler.
    sns.prepare_and_start();

    server
        .await
        .context("HTTP server task panicked")?
        .context("HTTP server failed")?;

    sns.not_ready();
    monitor.stop();
    listener.await.ok();
    tracing::info!("shutdown complete");
    Ok(())
}
