//! Process HTTP surface: `/metrics`, `/health`, and the dynamically
//! registered webhook paths (served through the fallback handler so
//! endpoints come and go without rebuilding the router).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use axum::body::to_bytes;
use axum::extract::{Request, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use axum::Router;
use prometheus::{Encoder, Registry, TextEncoder};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::info;

use zen_engine::Metrics;

use crate::adapters::webhook::{handle_request, SecretCache, WebhookRegistry};

#[derive(Clone)]
pub struct AppState {
    pub webhooks: Arc<WebhookRegistry>,
    pub secrets: Arc<SecretCache>,
    pub metrics: Metrics,
    pub registry: Registry,
    /// Flipped once the initial Ingester list has synced.
    pub ready: Arc<AtomicBool>,
    pub max_body_bytes: usize,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/health", get(health_handler))
        .fallback(webhook_handler)
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(state)
}

async fn metrics_handler(State(state): State<AppState>) -> Response {
    let families = state.registry.gather();
    let mut buffer = Vec::new();
    let encoder = TextEncoder::new();
    if encoder.encode(&families, &mut buffer).is_err() {
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    }
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, encoder.format_type().to_string())],
        buffer,
    )
        .into_response()
}

async fn health_handler(State(state): State<AppState>) -> Response {
    if state.ready.load(Ordering::SeqCst) {
        (StatusCode::OK, "ok").into_response()
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "initial sync pending").into_response()
    }
}

async fn webhook_handler(State(state): State<AppState>, request: Request) -> Response {
    let path = request.uri().path().to_string();
    let method = request.method().as_str().to_string();

    let Some(endpoint) = state.webhooks.lookup(&path) else {
        return (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({"error": "no such endpoint"})),
        )
            .into_response();
    };

    let auth_header = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    let body = match to_bytes(request.into_body(), state.max_body_bytes).await {
        Ok(bytes) => bytes,
        Err(_) => {
            state
                .metrics
                .webhook_requests_total
                .with_label_values(&[&path, "413"])
                .inc();
            return (
                StatusCode::PAYLOAD_TOO_LARGE,
                Json(serde_json::json!({"error": "request body too large"})),
            )
                .into_response();
        }
    };

    let (status, payload) = handle_request(
        &endpoint,
        &method,
        auth_header.as_deref(),
        &body,
        &state.secrets,
        &state.metrics,
    )
    .await;

    state
        .metrics
        .webhook_requests_total
        .with_label_values(&[&path, status.as_str()])
        .inc();

    (status, Json(payload)).into_response()
}

/// Serve until shutdown; in-flight requests drain within axum's graceful
/// shutdown before the listener closes.
pub async fn serve(
    listener: TcpListener,
    router: Router,
    mut shutdown: watch::Receiver<bool>,
) -> std::io::Result<()> {
    info!(addr = %listener.local_addr()?, "HTTP server listening");
    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            let _ = shutdown.changed().await;
        })
        .await
}
