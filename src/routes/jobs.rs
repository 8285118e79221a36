use axum::extract::{Path, Query, State};
use axum::response::Html;
use axum::Json;
use garde::Validate;
use serde::Deserialize;
use serde_json::{Map, Value};

use crate::app_state::AppState;
use crate::models::image::ImageRecord;
use crate::models::job::{JobStatus, JobSummary};
use crate::models::submission::{
    AppendImagesRequest, BatchResponse, CancelResponse, OngoingResponse, SubmitJobRequest,
    SubmitJobResponse, UpdateImagesRequest,
};
use crate::routes::ApiError;
use crate::services::codec;

/// POST /api/v1/jobs: Create a job from its first image batch.
pub async fn submit_job(
    State(state): State<AppState>,
    Json(request): Json<SubmitJobRequest>,
) -> Result<Json<SubmitJobResponse>, ApiError> {
    request.validate()?;
    Ok(Json(state.intake.submit(&request).await?))
}

/// POST /api/v1/users/{user_id}/jobs/{job_id}/images: Append an image batch.
pub async fn append_images(
    State(state): State<AppState>,
    Path((user_id, job_id)): Path<(String, String)>,
    Json(request): Json<AppendImagesRequest>,
) -> Result<Json<BatchResponse>, ApiError> {
    request.validate()?;
    Ok(Json(
        state
            .intake
            .append(&user_id, &job_id, &request.entries)
            .await?,
    ))
}

/// POST /api/v1/users/{user_id}/jobs/{job_id}/start: Start a deferred job.
pub async fn start_job(
    State(state): State<AppState>,
    Path((user_id, job_id)): Path<(String, String)>,
) -> Result<Json<SubmitJobResponse>, ApiError> {
    state.intake.start(&user_id, &job_id).await?;
    Ok(Json(SubmitJobResponse {
        job_id,
        status: JobStatus::Created,
        message: "Job submitted for processing".to_string(),
        results: Vec::new(),
    }))
}

/// GET /api/v1/users/{user_id}/jobs
pub async fn list_jobs(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> Result<Json<Vec<JobSummary>>, ApiError> {
    Ok(Json(state.store.list_jobs(&user_id).await?))
}

/// GET /api/v1/users/{user_id}/ongoing: First job still waiting for results.
pub async fn ongoing_job(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> Result<Json<OngoingResponse>, ApiError> {
    let job_id = state.store.ongoing_job(&user_id).await?;
    let message = match &job_id {
        Some(job_id) => format!("Job {job_id} is still processing"),
        None => "No ongoing jobs".to_string(),
    };
    Ok(Json(OngoingResponse { job_id, message }))
}

/// GET /api/v1/users/{user_id}/jobs/{job_id}/images
pub async fn job_images(
    State(state): State<AppState>,
    Path((user_id, job_id)): Path<(String, String)>,
) -> Result<Json<Vec<ImageRecord>>, ApiError> {
    Ok(Json(state.store.job_images(&user_id, &job_id).await?))
}

/// PATCH /api/v1/users/{user_id}/jobs/{job_id}/images: Merge update records.
pub async fn update_images(
    State(state): State<AppState>,
    Path((user_id, job_id)): Path<(String, String)>,
    Json(request): Json<UpdateImagesRequest>,
) -> Result<Json<BatchResponse>, ApiError> {
    let updates = update_records(request.updates)?;
    let results = state
        .store
        .update_images(&user_id, &job_id, &updates)
        .await?;
    let merged = results.iter().filter(|r| r.is_success()).count();
    Ok(Json(BatchResponse {
        message: format!("Updated {merged} of {} image(s)", results.len()),
        results,
    }))
}

fn update_records(payload: Value) -> Result<Vec<Map<String, Value>>, ApiError> {
    let Value::Array(items) = payload else {
        return Err(ApiError::InvalidInput("updates must be an array".to_string()));
    };
    items
        .into_iter()
        .map(|item| match item {
            Value::Object(map) => Ok(map),
            _ => Err(ApiError::InvalidInput(
                "each update must be an object".to_string(),
            )),
        })
        .collect()
}

/// DELETE /api/v1/users/{user_id}/jobs/{job_id}: Cancel a job.
pub async fn cancel_job(
    State(state): State<AppState>,
    Path((user_id, job_id)): Path<(String, String)>,
) -> Result<Json<CancelResponse>, ApiError> {
    state.intake.cancel(&user_id, &job_id).await?;
    Ok(Json(CancelResponse {
        job_id,
        status: JobStatus::Cancelled,
        message: "Job cancellation process started".to_string(),
    }))
}

/// GET /api/v1/users/{user_id}/jobs/{job_id}/report: Download the report.
pub async fn job_report(
    State(state): State<AppState>,
    Path((user_id, job_id)): Path<(String, String)>,
) -> Result<Html<String>, ApiError> {
    let root = state.intake.root();
    let name = codec::report_file_name(&user_id, &job_id);
    let candidates = [
        root.join(&user_id).join(&job_id).join(&name),
        root.join(codec::output_dir_name(&user_id)).join(&name),
    ];

    for path in &candidates {
        match tokio::fs::read_to_string(path).await {
            Ok(html) => return Ok(Html(html)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
            Err(e) => return Err(ApiError::Internal(e.to_string())),
        }
    }
    Err(ApiError::NotFound(format!("Report for job {job_id}")))
}

#[derive(Debug, Deserialize)]
pub struct FilesQuery {
    /// Comma-separated file names.
    pub files: String,
}

/// GET /api/v1/images?files=a,b: Image documents by file name.
pub async fn images_by_file(
    State(state): State<AppState>,
    Query(query): Query<FilesQuery>,
) -> Result<Json<Vec<ImageRecord>>, ApiError> {
    let files: Vec<String> = query
        .files
        .split(',')
        .map(str::trim)
        .filter(|f| !f.is_empty())
        .map(str::to_string)
        .collect();
    if files.is_empty() {
        return Err(ApiError::InvalidInput("no file names given".to_string()));
    }
    Ok(Json(state.store.images_by_file(&files).await?))
}
