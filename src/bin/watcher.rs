use std::net::SocketAddr;

use kidneytx::{bootstrap, config::AppConfig};
use metrics_exporter_prometheus::PrometheusBuilder;

#[tokio::main]
async fn main() {
    // Initialize structured logging
    bootstrap::init_tracing();

    tracing::info!("Starting pipeline watcher");

    // Load configuration
    let config = AppConfig::from_env().expect("Failed to load configuration");

    if let Some(addr) = &config.metrics_addr {
        let addr: SocketAddr = addr.parse().expect("Invalid METRICS_ADDR");
        PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()
            .expect("Failed to install Prometheus exporter");
        tracing::info!(%addr, "Serving watcher metrics");
    }
    bootstrap::describe_metrics();

    if config.database_url.is_none() {
        tracing::warn!("Standalone watcher without DATABASE_URL cannot see jobs submitted to the API");
    }
    let store = bootstrap::open_store(&config)
        .await
        .expect("Failed to open job store");
    let contacts = bootstrap::contact_book(&config).expect("Failed to initialize encryption");
    let launcher = bootstrap::launcher(&config);

    let monitor = bootstrap::start_monitor(&config, store, launcher, contacts.into())
        .expect("Failed to start lifecycle monitor");

    tracing::info!(root = %config.watch_root.display(), "Watcher ready");

    tokio::select! {
        _ = bootstrap::supervise_monitor(monitor) => {}
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Shutdown signal received");
        }
    }
}
