use axum::{routing::get, Router};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::sync::Arc;
use tower_http::compression::CompressionLayer;
use tower_http::cors::CorsLayer;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;

use kidneytx::{
    app_state::AppState, bootstrap, config::AppConfig, routes, services::intake::IntakeService,
};

#[tokio::main]
async fn main() {
    // Initialize structured logging
    bootstrap::init_tracing();

    // Load configuration from environment
    let config = AppConfig::from_env().expect("Failed to load configuration from environment");

    tracing::info!("Initializing kidneytx API server");

    // Initialize Prometheus metrics recorder
    let prometheus_handle = PrometheusBuilder::new()
        .install_recorder()
        .expect("Failed to install Prometheus metrics recorder");
    let prometheus_handle = Arc::new(prometheus_handle);
    bootstrap::describe_metrics();

    let store = bootstrap::open_store(&config)
        .await
        .expect("Failed to open job store");

    tracing::info!("Initializing contact book");
    let contacts = Arc::new(bootstrap::contact_book(&config).expect("Failed to initialize encryption"));
    let launcher = bootstrap::launcher(&config);

    if config.embedded_watcher {
        tracing::info!(root = %config.watch_root.display(), "Starting embedded lifecycle monitor");
        let monitor =
            bootstrap::start_monitor(&config, store.clone(), launcher.clone(), contacts.clone())
                .expect("Failed to start lifecycle monitor");
        tokio::spawn(bootstrap::supervise_monitor(monitor));
    }

    let intake = IntakeService::new(
        store.clone(),
        launcher,
        config.watch_root.clone(),
        config.cancel_script.clone(),
    );
    let state = AppState::new(store, intake, contacts);

    let app = Router::new()
        .merge(routes::api_router(state))
        // Prometheus metrics endpoint (separate state)
        .route(
            "/metrics",
            get(routes::metrics::prometheus_metrics).with_state(prometheus_handle),
        )
        .layer(TraceLayer::new_for_http())
        .layer(CompressionLayer::new())
        .layer(CorsLayer::permissive())
        .layer(RequestBodyLimitLayer::new(2 * 1024 * 1024)); // 2 MB limit

    tracing::info!("Starting kidneytx on {}", config.bind_addr);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .expect("Failed to bind to address");

    tracing::info!("Server listening on {}", config.bind_addr);

    axum::serve(listener, app)
        .await
        .expect("Server error");
}
