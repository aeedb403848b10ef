use crate::cache::Cache;
use crate::error::JamboxError;
use crate::events::Broadcaster;
use crate::Result;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};
use tokio::sync::broadcast::error::RecvError;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

/// Shared state for metrics
#[derive(Debug, Default)]
pub struct Metrics {
    pub total_requests: AtomicU64,
    pub cache_hits: AtomicU64,
    pub stubbed: AtomicU64,
    pub forwarded: AtomicU64,
    pub passed_through: AtomicU64,
    pub unmatched: AtomicU64,
    pub failures: AtomicU64,
    pub websocket_upgrades: AtomicU64,
}

#[derive(Clone)]
pub struct AdminState {
    pub metrics: Arc<Metrics>,
    pub broadcaster: Broadcaster,
    pub cache: Arc<Cache>,
}

#[derive(Serialize)]
struct HealthResponse {
    status: String,
}

#[derive(Serialize)]
struct MetricsResponse {
    total_requests: u64,
    cache_hits: u64,
    stubbed: u64,
    forwarded: u64,
    passed_through: u64,
    unmatched: u64,
    failures: u64,
    websocket_upgrades: u64,
    observers: usize,
    cache: CacheMetrics,
}

#[derive(Serialize)]
struct CacheMetrics {
    committed: usize,
    staged: usize,
    bypass: bool,
}

pub fn router(state: AdminState) -> Router {
    Router::new()
        .route("/", get(events_handler))
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn start_admin_server(port: u16, state: AdminState) -> Result<()> {
    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    info!("Starting Admin API on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await.map_err(|e| {
        JamboxError::Network(format!("Failed to bind admin port {}: {}", port, e))
    })?;

    axum::serve(listener, router(state))
        .await
        .map_err(|e| JamboxError::Network(format!("Admin server failed: {}", e)))?;

    Ok(())
}

async fn health_handler() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
    })
}

async fn metrics_handler(State(state): State<AdminState>) -> Json<MetricsResponse> {
    let metrics = &state.metrics;
    let committed = state.cache.len();

    Json(MetricsResponse {
        total_requests: metrics.total_requests.load(Ordering::Relaxed),
        cache_hits: metrics.cache_hits.load(Ordering::Relaxed),
        stubbed: metrics.stubbed.load(Ordering::Relaxed),
        forwarded: metrics.forwarded.load(Ordering::Relaxed),
        passed_through: metrics.passed_through.load(Ordering::Relaxed),
        unmatched: metrics.unmatched.load(Ordering::Relaxed),
        failures: metrics.failures.load(Ordering::Relaxed),
        websocket_upgrades: metrics.websocket_upgrades.load(Ordering::Relaxed),
        observers: state.broadcaster.observer_count(),
        cache: CacheMetrics {
            committed,
            staged: state.cache.staged_len(),
            bypass: state.cache.bypass(),
        },
    })
}

/// Live event feed: every broadcast event as a text frame.
async fn events_handler(ws: WebSocketUpgrade, State(state): State<AdminState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| stream_events(socket, state.broadcaster))
}

async fn stream_events(mut socket: WebSocket, broadcaster: Broadcaster) {
    let mut events = broadcaster.subscribe();
    debug!("Observer connected ({} total)", broadcaster.observer_count());

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(message) => {
                    if socket.send(Message::Text(message)).await.is_err() {
                        break;
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!("Observer lagging, {} events dropped", skipped);
                }
                Err(RecvError::Closed) => break,
            },
            incoming = socket.recv() => match incoming {
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                Some(Ok(_)) => {}
            },
        }
    }

    debug!("Observer disconnected");
}
