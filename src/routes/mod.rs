use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;

use crate::app_state::AppState;
use crate::services::contacts::ContactError;
use crate::services::intake::IntakeError;
use crate::services::store::StoreError;

pub mod contacts;
pub mod health;
pub mod jobs;
pub mod metrics;

/// Errors surfaced to API clients. Anything that is not a lookup miss or
/// bad input is logged and reported as a bare 500.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    InvalidInput(String),

    #[error("{0}")]
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::NotFound(message) => {
                (StatusCode::NOT_FOUND, Json(json!({ "error": message }))).into_response()
            }
            ApiError::InvalidInput(message) => {
                (StatusCode::BAD_REQUEST, Json(json!({ "error": message }))).into_response()
            }
            ApiError::Internal(message) => {
                tracing::error!(error = %message, "Request failed");
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error").into_response()
            }
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(_) => ApiError::NotFound(e.to_string()),
            StoreError::InvalidInput(_) => ApiError::InvalidInput(e.to_string()),
            StoreError::Persistence(_) => ApiError::Internal(e.to_string()),
        }
    }
}

impl From<IntakeError> for ApiError {
    fn from(e: IntakeError) -> Self {
        match e {
            IntakeError::Store(e) => e.into(),
            IntakeError::InvalidInput(message) => ApiError::InvalidInput(message),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl From<ContactError> for ApiError {
    fn from(e: ContactError) -> Self {
        ApiError::Internal(e.to_string())
    }
}

impl From<garde::Report> for ApiError {
    fn from(report: garde::Report) -> Self {
        ApiError::InvalidInput(report.to_string())
    }
}

/// Job, image and contact endpoints. Metrics are mounted separately.
pub fn api_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health::health_check))
        .route("/api/v1/jobs", post(jobs::submit_job))
        .route("/api/v1/images", get(jobs::images_by_file))
        .route("/api/v1/users/{user_id}/jobs", get(jobs::list_jobs))
        .route("/api/v1/users/{user_id}/ongoing", get(jobs::ongoing_job))
        .route(
            "/api/v1/users/{user_id}/jobs/{job_id}",
            axum::routing::delete(jobs::cancel_job),
        )
        .route(
            "/api/v1/users/{user_id}/jobs/{job_id}/images",
            get(jobs::job_images)
                .post(jobs::append_images)
                .patch(jobs::update_images),
        )
        .route(
            "/api/v1/users/{user_id}/jobs/{job_id}/start",
            post(jobs::start_job),
        )
        .route(
            "/api/v1/users/{user_id}/jobs/{job_id}/report",
            get(jobs::job_report),
        )
        .route("/api/v1/contacts", post(contacts::store_contact))
        .with_state(state)
}
