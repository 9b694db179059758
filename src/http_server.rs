use crate::monitor::Monitor;
use crate::types::Webhook;
use axum::{
    body::{to_bytes, Bytes},
    extract::{ConnectInfo, Request, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

/// Upper bound on a registration body.
const MAX_REGISTRATION_BYTES: usize = 64 * 1024;

#[derive(Clone)]
struct ServerState {
    monitor: Arc<Monitor>,
}

#[derive(Serialize)]
struct MessageBody {
    message: String,
}

fn message(status: StatusCode, message: impl Into<String>) -> Response {
    (
        status,
        Json(MessageBody {
            message: message.into(),
        }),
    )
        .into_response()
}

/// Registry API on `hooks_path` plus the SNS callback on `sns_path`.
pub fn router(monitor: Arc<Monitor>, hooks_path: &str, sns_path: &str) -> Router {
    let state = ServerState { monitor };
    Router::new()
        .route(hooks_path, get(list_hooks).post(register_hook))
        .route(sns_path, post(sns_callback))
        .with_state(state)
}

/// Serve `app` on `listener` until `shutdown` resolves.
pub async fn serve(
    listener: TcpListener,
    app: Router,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    info!(addr = %listener.local_addr()?, "HTTP server listening");
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await
}

async fn list_hooks(State(state): State<ServerState>) -> Json<Vec<Webhook>> {
    let hooks = state.monitor.registry().get_all();
    Json(Vec::clone(&hooks))
}

async fn register_hook(State(state): State<ServerState>, request: Request) -> Response {
    let remote = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);

    let body = match to_bytes(request.into_body(), MAX_REGISTRATION_BYTES).await {
        Ok(b) => b,
        Err(e) => return message(StatusCode::BAD_REQUEST, format!("unreadable body: {e}")),
    };

    let max_duration = state.monitor.registry().max_duration();
    let hook = match Webhook::from_registration(&body, remote, max_duration) {
        Ok(h) => h,
        Err(e) => {
            warn!(error = %e, "rejected webhook registration");
            return message(StatusCode::BAD_REQUEST, e.to_string());
        }
    };

    let payload = match serde_json::to_string(&hook) {
        Ok(p) => p,
        Err(e) => {
            error!(error = %e, "failed to encode webhook");
            return message(StatusCode::INTERNAL_SERVER_ERROR, "failed to encode webhook");
        }
    };

    if let Err(e) = state.monitor.notifier().publish_message(payload).await {
        error!(url = %hook.config.url, error = %e, "failed to publish webhook registration");
        return message(StatusCode::INTERNAL_SERVER_ERROR, e.to_string());
    }

    info!(url = %hook.config.url, address = %hook.address, "webhook registration published");
    message(StatusCode::OK, "Success")
}

async fn sns_callback(
    State(state): State<ServerState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    match state.monitor.handle_sns(&headers, &body).await {
        Ok(status) => status.into_response(),
        Err(e) => e.into_response(),
    }
}
