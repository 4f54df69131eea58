//! Service entry point: settings, tracing, dataset boot load, HTTP serve.

use std::net::SocketAddr;
use std::sync::Arc;

use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use tracing_subscriber::EnvFilter;

use layer0::config::Settings;
use layer0::scanner::Scanner;
use layer0::service::{self, ServerContext};

/// Histogram buckets for `layer0_scan_duration_ms`, in milliseconds.
const SCAN_DURATION_BUCKETS: &[f64] = &[
    5.0, 10.0, 20.0, 50.0, 100.0, 200.0, 500.0, 1000.0, 2000.0,
];

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let settings = Settings::from_env()?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(settings.log_level.clone())),
        )
        .init();

    tracing::info!(version = layer0::scanner::SCANNER_VERSION, "starting layer0");

    let prometheus = if settings.metrics_enabled {
        Some(install_metrics()?)
    } else {
        None
    };

    let scanner = Arc::new(Scanner::new(Arc::clone(&settings)));
    match scanner.load_datasets() {
        Ok(()) => {}
        Err(err) if settings.fail_open => {
            tracing::error!(error = %err, "dataset load failed, continuing (fail-open)");
        }
        Err(err) => {
            // Fail-closed: stay alive but not ready; /datasets/reload can
            // recover the process once the bundles are fixed.
            tracing::error!(error = %err, "dataset load failed, service will refuse readiness");
        }
    }
    if scanner.registry().rule_count() == 0 {
        tracing::warn!("no active rules loaded; /health/ready will return 503 until a reload");
    }

    let ctx = ServerContext::new(Arc::clone(&settings), scanner, prometheus);
    let app = service::router(ctx);

    let addr: SocketAddr = format!("{}:{}", settings.api_host, settings.api_port).parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "listening");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    tracing::info!("shutdown complete");
    Ok(())
}

fn install_metrics() -> Result<PrometheusHandle, Box<dyn std::error::Error>> {
    let handle = PrometheusBuilder::new()
        .set_buckets_for_metric(
            Matcher::Full("layer0_scan_duration_ms".to_string()),
            SCAN_DURATION_BUCKETS,
        )?
        .install_recorder()?;
    Ok(handle)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.ok();
    };
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
    tracing::info!("shutdown signal received");
}
