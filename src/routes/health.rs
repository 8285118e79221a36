use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde::Serialize;

use crate::app_state::AppState;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub checks: HealthChecks,
}

#[derive(Serialize)]
pub struct HealthChecks {
    pub store: ComponentHealth,
    pub watch_root: ComponentHealth,
}

#[derive(Serialize)]
pub struct ComponentHealth {
    pub status: String,
    pub latency_ms: Option<u64>,
}

impl ComponentHealth {
    fn ok(latency_ms: u64) -> Self {
        Self {
            status: "ok".to_string(),
            latency_ms: Some(latency_ms),
        }
    }

    fn error() -> Self {
        Self {
            status: "error".to_string(),
            latency_ms: None,
        }
    }
}

/// GET /health: Store connectivity and watch root availability.
pub async fn health_check(
    State(state): State<AppState>,
) -> (StatusCode, Json<HealthResponse>) {
    let start = std::time::Instant::now();
    let store_check = match state.store.ping().await {
        Ok(()) => ComponentHealth::ok(start.elapsed().as_millis() as u64),
        Err(e) => {
            tracing::warn!(error = %e, "Store health check failed");
            ComponentHealth::error()
        }
    };

    let root_start = std::time::Instant::now();
    let root_check = match tokio::fs::metadata(state.intake.root()).await {
        Ok(meta) if meta.is_dir() => ComponentHealth::ok(root_start.elapsed().as_millis() as u64),
        _ => ComponentHealth::error(),
    };

    let all_healthy = store_check.status == "ok" && root_check.status == "ok";
    let status_code = if all_healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    let response = HealthResponse {
        status: if all_healthy {
            "ok".to_string()
        } else {
            "degraded".to_string()
        },
        version: env!("CARGO_PKG_VERSION").to_string(),
        checks: HealthChecks {
            store: store_check,
            watch_root: root_check,
        },
    };

    (status_code, Json(response))
}
