//! HTTP boundary: request framing, protection, probes, and metrics.
//!
//! The service deserializes [`PreparedInput`](crate::model::PreparedInput),
//! dispatches to the [`Scanner`](crate::scanner::Scanner), and serializes
//! [`ScanResult`](crate::model::ScanResult). Around that call it applies,
//! in order: static API-key auth, a per-client request budget, and a
//! process-wide circuit breaker that opens after repeated scanner failures.
//!
//! Status mapping: 200 for any verdict, 401 on auth failure, 422 on
//! malformed or invalid input, 429 over budget, 503 when the breaker is
//! open or the service is not ready, 504 when a scan hits its deadline.
//!
//! All shared state is wired explicitly through [`ServerContext`]; there
//! are no process globals.

pub mod breaker;
pub mod ratelimit;
mod routes;

use std::sync::Arc;
use std::time::Duration;

use metrics_exporter_prometheus::PrometheusHandle;

use crate::config::Settings;
use crate::registry::RuleRegistry;
use crate::scanner::Scanner;
use breaker::CircuitBreaker;
use ratelimit::FixedWindowLimiter;

pub use routes::router;

/// Consecutive scanner failures before the breaker opens.
const BREAKER_FAILURES: u32 = 10;

/// How long the breaker stays open.
const BREAKER_COOLDOWN: Duration = Duration::from_secs(60);

/// Everything the route handlers need, wired once at startup.
pub struct ServerContext {
    /// Runtime settings.
    pub settings: Arc<Settings>,
    /// The scanning engine.
    pub scanner: Arc<Scanner>,
    /// Registry shared with the scanner, for probes and statistics.
    pub registry: Arc<RuleRegistry>,
    /// Scan-path circuit breaker.
    pub breaker: CircuitBreaker,
    /// Per-client `/scan` budget.
    pub scan_limiter: FixedWindowLimiter,
    /// Per-client `/datasets/reload` budget.
    pub reload_limiter: FixedWindowLimiter,
    /// Prometheus render handle when metrics are enabled.
    pub prometheus: Option<PrometheusHandle>,
}

impl ServerContext {
    /// Wire up the context from settings and an initialized scanner.
    #[must_use]
    pub fn new(
        settings: Arc<Settings>,
        scanner: Arc<Scanner>,
        prometheus: Option<PrometheusHandle>,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry: scanner.registry(),
            breaker: CircuitBreaker::new(BREAKER_FAILURES, BREAKER_COOLDOWN),
            scan_limiter: FixedWindowLimiter::per_minute(settings.rate_limit_per_minute),
            reload_limiter: FixedWindowLimiter::per_hour(settings.reload_rate_per_hour),
            prometheus,
            scanner,
            settings,
        })
    }
}
