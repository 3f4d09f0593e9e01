use crate::pipeline::PipelineHandle;
use crate::stats::StatsSnapshot;
use axum::{
    extract::{ConnectInfo, State},
    http::{header, StatusCode},
    middleware,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use ipnet::IpNet;
use prometheus_client::encoding::text::encode;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use std::time::Instant;
use tower_http::trace::TraceLayer;

pub struct AppState {
    pub pipeline: PipelineHandle,
    pub start_time: Instant,
}

// ── Prometheus Metrics ────────────────────────────────────────────────────────

/// Build a registry holding the given snapshot. Counters are created fresh for
/// every scrape, so they always carry the absolute values.
fn metrics_registry(snapshot: &StatsSnapshot, uptime_seconds: f64) -> Registry {
    let mut registry = Registry::default();

    let uptime = Gauge::<f64, AtomicU64>::default();
    uptime.set(uptime_seconds);
    registry.register(
        "plc_relay_uptime_seconds",
        "Time since service started",
        uptime,
    );

    let counters = [
        ("plc_relay_packets_processed", "Total packets processed", snapshot.processed),
        ("plc_relay_packets_forwarded", "Total packets forwarded", snapshot.forwarded),
        ("plc_relay_packets_dropped", "Total packets dropped", snapshot.dropped),
        (
            "plc_relay_packets_rate_limited",
            "Packets dropped due to rate limit",
            snapshot.rate_limited,
        ),
        (
            "plc_relay_packets_oversized",
            "Packets dropped due to size",
            snapshot.oversized,
        ),
        ("plc_relay_errors", "Total errors encountered", snapshot.errors),
        ("plc_relay_bytes_forwarded", "Total bytes forwarded", snapshot.bytes_forwarded),
    ];
    // prometheus-client appends the `_total` suffix to counters.
    for (name, help, value) in counters {
        let counter: Counter = Counter::default();
        counter.inc_by(value);
        registry.register(name, help, counter);
    }

    let rate = Gauge::<f64, AtomicU64>::default();
    rate.set(snapshot.current_rate);
    registry.register(
        "plc_relay_current_packet_rate",
        "Current packets per second",
        rate,
    );

    registry
}

// ── Response Types ────────────────────────────────────────────────────────────

#[derive(Serialize)]
pub struct HealthResponse {
    status: &'static str,
    timestamp: String,
    uptime_seconds: f64,
}

#[derive(Serialize)]
pub struct ReadyResponse {
    status: &'static str,
    timestamp: String,
}

// ── Router ────────────────────────────────────────────────────────────────────

pub fn router(state: Arc<AppState>, allowed_ips: &[IpNet]) -> Router {
    let mut app = Router::new()
        .route("/health", get(get_health))
        .route("/ready", get(get_ready))
        .route("/metrics", get(get_metrics))
        .route("/api/stats", get(get_stats));

    // Apply IP allowlist middleware if configured.
    if !allowed_ips.is_empty() {
        let nets: Arc<Vec<IpNet>> = Arc::new(allowed_ips.to_vec());
        app = app.layer(middleware::from_fn(
            move |req: axum::extract::Request, next: middleware::Next| {
                let nets = nets.clone();
                ip_allowlist(req, next, nets)
            },
        ));
    }

    app.layer(TraceLayer::new_for_http()).with_state(state)
}

// ── IP Allowlist Middleware ────────────────────────────────────────────────────

async fn ip_allowlist(
    req: axum::extract::Request,
    next: middleware::Next,
    allowed: Arc<Vec<IpNet>>,
) -> Response {
    if let Some(connect_info) = req.extensions().get::<ConnectInfo<SocketAddr>>() {
        let ip = connect_info.0.ip();
        if allowed.iter().any(|net| net.contains(&ip)) {
            return next.run(req).await;
        }
        return StatusCode::FORBIDDEN.into_response();
    }
    // No ConnectInfo means the router is not served over a socket (tests).
    next.run(req).await
}

// ── Handlers ──────────────────────────────────────────────────────────────────

fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339()
}

/// Liveness: the process is up.
async fn get_health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        timestamp: now_rfc3339(),
        uptime_seconds: state.start_time.elapsed().as_secs_f64(),
    })
}

/// Readiness: the capture pipeline is running.
async fn get_ready(State(state): State<Arc<AppState>>) -> Response {
    if state.pipeline.is_running() {
        Json(ReadyResponse {
            status: "ready",
            timestamp: now_rfc3339(),
        })
        .into_response()
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "Service not ready").into_response()
    }
}

async fn get_metrics(State(state): State<Arc<AppState>>) -> Response {
    if !state.pipeline.is_attached() {
        return (StatusCode::SERVICE_UNAVAILABLE, "Service not initialized").into_response();
    }

    let snapshot = state.pipeline.stats().snapshot();
    let registry = metrics_registry(&snapshot, state.start_time.elapsed().as_secs_f64());

    let mut buf = String::new();
    if let Err(e) = encode(&mut buf, &registry) {
        tracing::error!(error = %e, "Failed to encode metrics");
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    }
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        buf,
    )
        .into_response()
}

async fn get_stats(State(state): State<Arc<AppState>>) -> Response {
    if !state.pipeline.is_attached() {
        return (StatusCode::SERVICE_UNAVAILABLE, "Service not initialized").into_response();
    }
    Json(state.pipeline.stats().snapshot()).into_response()
}
