//! Route handlers and status mapping.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Json;
use axum::Router;
use axum::extract::rejection::JsonRejection;
use axum::extract::{ConnectInfo, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use serde_json::json;

use crate::model::PreparedInput;
use crate::scanner::{SCANNER_VERSION, ScanDisposition};

use super::ServerContext;

/// Build the service router.
#[must_use]
pub fn router(ctx: Arc<ServerContext>) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/scan", post(scan))
        .route("/datasets/reload", post(reload_datasets))
        .route("/health/live", get(liveness))
        .route("/health/ready", get(readiness))
        .route("/health", get(health))
        .route("/stats", get(stats))
        .route("/metrics", get(metrics_scrape))
        .with_state(ctx)
}

fn error_response(status: StatusCode, detail: impl Into<String>) -> Response {
    (status, Json(json!({ "detail": detail.into() }))).into_response()
}

/// Static API-key check. Anonymous access is allowed when no key is
/// configured.
fn authorize(ctx: &ServerContext, headers: &HeaderMap) -> Result<(), Response> {
    let Some(expected) = ctx.settings.api_key.as_deref() else {
        return Ok(());
    };
    let presented = headers.get("x-api-key").and_then(|v| v.to_str().ok());
    if presented == Some(expected) {
        return Ok(());
    }
    metrics::counter!("layer0_auth_failures_total").increment(1);
    Err((
        StatusCode::UNAUTHORIZED,
        [("www-authenticate", "ApiKey")],
        Json(json!({ "detail": "invalid or missing API key" })),
    )
        .into_response())
}

/// RAII counter for the in-flight request gauge.
struct ActiveRequestGuard;

impl ActiveRequestGuard {
    fn arm() -> Self {
        metrics::gauge!("layer0_active_requests").increment(1.0);
        Self
    }
}

impl Drop for ActiveRequestGuard {
    fn drop(&mut self) {
        metrics::gauge!("layer0_active_requests").decrement(1.0);
    }
}

// ── POST /scan ─────────────────────────────────────────────────────────

async fn scan(
    State(ctx): State<Arc<ServerContext>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    body: Result<Json<PreparedInput>, JsonRejection>,
) -> Response {
    if let Err(denied) = authorize(&ctx, &headers) {
        return denied;
    }
    if !ctx.scan_limiter.try_acquire(addr.ip()) {
        metrics::counter!("layer0_requests_total", "status" => "rate_limited", "endpoint" => "scan")
            .increment(1);
        return error_response(StatusCode::TOO_MANY_REQUESTS, "rate limit exceeded");
    }
    if !ctx.breaker.try_pass() {
        return error_response(
            StatusCode::SERVICE_UNAVAILABLE,
            "service temporarily unavailable due to high error rate",
        );
    }
    // Fail-closed with nothing loaded means nothing can be vetted.
    if !ctx.settings.fail_open && ctx.registry.rule_count() == 0 {
        return error_response(
            StatusCode::SERVICE_UNAVAILABLE,
            "service not ready: no rules loaded",
        );
    }

    let mut input = match body {
        Ok(Json(input)) => input,
        Err(rejection) => {
            metrics::counter!("layer0_requests_total", "status" => "validation_error", "endpoint" => "scan")
                .increment(1);
            return error_response(
                StatusCode::UNPROCESSABLE_ENTITY,
                format!("malformed request body: {rejection}"),
            );
        }
    };
    input.drop_empty_chunks();
    if let Err(err) = input.check_limits(ctx.settings.max_input_length, ctx.settings.max_chunks) {
        metrics::counter!("layer0_requests_total", "status" => "validation_error", "endpoint" => "scan")
            .increment(1);
        return error_response(StatusCode::UNPROCESSABLE_ENTITY, err.to_string());
    }

    let _active = ActiveRequestGuard::arm();
    let outcome = ctx.scanner.scan(&input).await;

    metrics::counter!(
        "layer0_requests_total",
        "status" => outcome.result.status.to_string(),
        "endpoint" => "scan",
    )
    .increment(1);
    metrics::histogram!("layer0_scan_duration_ms").record(outcome.result.processing_time_ms);

    match outcome.disposition {
        ScanDisposition::Completed => ctx.breaker.record_success(),
        ScanDisposition::Failed | ScanDisposition::TimedOut => {
            if ctx.breaker.record_failure() {
                metrics::counter!("layer0_circuit_breaker_trips_total").increment(1);
            }
        }
    }

    let status = if outcome.disposition == ScanDisposition::TimedOut {
        StatusCode::GATEWAY_TIMEOUT
    } else {
        StatusCode::OK
    };
    (status, Json(outcome.result)).into_response()
}

// ── POST /datasets/reload ──────────────────────────────────────────────

async fn reload_datasets(
    State(ctx): State<Arc<ServerContext>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Response {
    if let Err(denied) = authorize(&ctx, &headers) {
        return denied;
    }
    if !ctx.reload_limiter.try_acquire(addr.ip()) {
        return error_response(StatusCode::TOO_MANY_REQUESTS, "reload rate limit exceeded");
    }

    let scanner = Arc::clone(&ctx.scanner);
    let report = match tokio::task::spawn_blocking(move || scanner.reload_datasets()).await {
        Ok(report) => report,
        Err(err) => {
            metrics::counter!("layer0_dataset_reload_failures_total").increment(1);
            return error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("reload worker failed: {err}"),
            );
        }
    };

    if report.is_success() {
        (StatusCode::OK, Json(report)).into_response()
    } else {
        metrics::counter!("layer0_dataset_reload_failures_total").increment(1);
        (StatusCode::INTERNAL_SERVER_ERROR, Json(report)).into_response()
    }
}

// ── Probes ─────────────────────────────────────────────────────────────

async fn liveness() -> Response {
    Json(json!({
        "status": "alive",
        "timestamp": epoch_seconds(),
    }))
    .into_response()
}

async fn readiness(State(ctx): State<Arc<ServerContext>>) -> Response {
    if ctx.registry.rule_count() == 0 {
        return error_response(
            StatusCode::SERVICE_UNAVAILABLE,
            "service not ready: no rules loaded",
        );
    }
    Json(json!({
        "status": "ready",
        "rule_count": ctx.registry.rule_count(),
        "dataset_count": ctx.registry.dataset_count(),
        "timestamp": epoch_seconds(),
    }))
    .into_response()
}

async fn health(State(ctx): State<Arc<ServerContext>>) -> Response {
    Json(json!({
        "status": "healthy",
        "rule_set_version": ctx.registry.version(),
        "total_rules": ctx.registry.rule_count(),
        "total_datasets": ctx.registry.dataset_count(),
    }))
    .into_response()
}

// ── GET /stats ─────────────────────────────────────────────────────────

async fn stats(State(ctx): State<Arc<ServerContext>>, headers: HeaderMap) -> Response {
    if let Err(denied) = authorize(&ctx, &headers) {
        return denied;
    }
    Json(ctx.registry.stats()).into_response()
}

// ── GET /metrics ───────────────────────────────────────────────────────

async fn metrics_scrape(State(ctx): State<Arc<ServerContext>>) -> Response {
    match (&ctx.prometheus, ctx.settings.metrics_enabled) {
        (Some(handle), true) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4")],
            handle.render(),
        )
            .into_response(),
        _ => error_response(StatusCode::NOT_FOUND, "metrics not enabled"),
    }
}

// ── GET / ──────────────────────────────────────────────────────────────

async fn root() -> Response {
    Json(json!({
        "name": "layer0",
        "version": SCANNER_VERSION,
        "status": "operational",
        "endpoints": {
            "scan": "POST /scan",
            "reload": "POST /datasets/reload",
            "liveness": "GET /health/live",
            "readiness": "GET /health/ready",
            "health": "GET /health",
            "stats": "GET /stats",
            "metrics": "GET /metrics",
        },
    }))
    .into_response()
}

fn epoch_seconds() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

// ── Tests ──────────────────────────────────────────────────────────────
