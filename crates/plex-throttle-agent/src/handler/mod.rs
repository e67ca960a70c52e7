//! HTTP surface: health, Plex webhook and Prometheus metrics

use axum::{
    extract::{multipart::MultipartRejection, DefaultBodyLimit, Multipart, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use plex_throttle_core::dispatcher::{Mailbox, PushEvent};
use plex_throttle_core::manual::ManualThrottle;
use plex_throttle_core::metrics::ThrottleMetrics;
use plex_throttle_core::ports::{Actuator, MediaServer, PortResult};
use plex_throttle_core::state::SharedState;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use tower_http::trace::TraceLayer;
use tracing::debug;

/// Plex attaches a thumbnail to some webhooks
const WEBHOOK_BODY_LIMIT: usize = 10 * 1024 * 1024;

/// Events that can change the remote stream count
pub const PLAYBACK_EVENTS: [&str; 4] = ["media.play", "media.resume", "media.stop", "media.pause"];

/// Shared with every request
pub struct AppState {
    pub shared: Arc<SharedState>,
    pub manual: Arc<ManualThrottle>,
    pub media_server: Arc<dyn MediaServer>,
    pub actuator: Arc<dyn Actuator>,
    pub events: Mailbox<PushEvent>,
    pub metrics: Arc<ThrottleMetrics>,
}

/// Create the router
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route(
            "/webhook",
            post(plex_webhook).layer(DefaultBodyLimit::max(WEBHOOK_BODY_LIMIT)),
        )
        .route("/metrics", get(metrics))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Snapshot plus live reachability of both upstreams
async fn health_check(State(state): State<Arc<AppState>>) -> (StatusCode, Json<HealthResponse>) {
    let snapshot = state.shared.snapshot();

    let (plex, qbittorrent) = tokio::join!(
        probe("plex", state.media_server.ping()),
        probe("qbittorrent", state.actuator.ping()),
    );

    let healthy = plex.reachable && qbittorrent.reachable;
    let (status, code) = if healthy {
        ("healthy", StatusCode::OK)
    } else {
        ("degraded", StatusCode::SERVICE_UNAVAILABLE)
    };

    let manual_override = state.manual.status().map(|o| ManualOverrideView {
        active: true,
        remaining_sec: o.remaining.as_secs(),
        requested_by: o.requested_by,
    });

    let body = HealthResponse {
        status: status.to_string(),
        state: snapshot.state.to_string(),
        uptime_sec: snapshot.uptime().as_secs(),
        last_check: snapshot.last_check.map(|t| t.to_rfc3339()),
        remote_streams: snapshot.remote_streams,
        current_upload_limit_kbps: snapshot.current_limit.kbps(),
        manual_override,
        services: Services { plex, qbittorrent },
    };

    (code, Json(body))
}

async fn probe<F>(service: &'static str, check: F) -> ServiceHealth
where
    F: Future<Output = PortResult<()>>,
{
    let start = Instant::now();
    let result = check.await;
    let latency_ms = u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX);

    if let Err(e) = &result {
        debug!(service, error = %e, "Health probe failed");
    }

    ServiceHealth {
        reachable: result.is_ok(),
        latency_ms,
    }
}

/// Plex webhook: a multipart form whose `payload` field holds the event JSON
async fn plex_webhook(
    State(state): State<Arc<AppState>>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<StatusCode, (StatusCode, Json<ApiError>)> {
    let mut multipart = multipart.map_err(|_| bad_request("failed to parse form"))?;

    let mut payload = None;
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|_| bad_request("failed to parse form"))?
    {
        if field.name() == Some("payload") {
            let text = field
                .text()
                .await
                .map_err(|_| bad_request("failed to parse form"))?;
            payload = Some(text);
        }
    }

    let payload = payload
        .filter(|p| !p.is_empty())
        .ok_or_else(|| bad_request("missing payload"))?;
    let webhook: WebhookPayload =
        serde_json::from_str(&payload).map_err(|_| bad_request("invalid JSON"))?;

    if PLAYBACK_EVENTS.contains(&webhook.event.as_str()) {
        debug!(event = %webhook.event, local = webhook.player.local, "Webhook: {} (local={})", webhook.event, webhook.player.local);
        state.events.post(PushEvent::new(webhook.event));
    }

    Ok(StatusCode::OK)
}

async fn metrics(State(state): State<Arc<AppState>>) -> Response {
    match state.metrics.encode() {
        Ok(text) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            text,
        )
            .into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

fn bad_request(message: &str) -> (StatusCode, Json<ApiError>) {
    (
        StatusCode::BAD_REQUEST,
        Json(ApiError {
            error: "InvalidInput".to_string(),
            message: message.to_string(),
        }),
    )
}

#[derive(Debug, Default, Deserialize)]
struct WebhookPayload {
    #[serde(default)]
    event: String,
    #[serde(rename = "Player", default)]
    player: WebhookPlayer,
}

#[derive(Debug, Default, Deserialize)]
struct WebhookPlayer {
    #[serde(default)]
    local: bool,
}

/// Health response
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub state: String,
    pub uptime_sec: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_check: Option<String>,
    pub remote_streams: u32,
    pub current_upload_limit_kbps: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub manual_override: Option<ManualOverrideView>,
    pub services: Services,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ManualOverrideView {
    pub active: bool,
    pub remaining_sec: u64,
    pub requested_by: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Services {
    pub plex: ServiceHealth,
    pub qbittorrent: ServiceHealth,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ServiceHealth {
    pub reachable: bool,
    pub latency_ms: u64,
}

/// API error
#[derive(Debug, Serialize, Deserialize)]
pub struct ApiError {
    pub error: String,
    pub message: String,
}
