use garde::Validate;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::models::image::NewImageEntry;
use crate::models::job::{EntryOutcome, JobStatus};
use crate::services::codec::DELIMITER;

/// Identifiers that sit at fixed positions of the marker file name must not
/// contain the delimiter. The job id may.
fn no_delimiter(value: &String, _ctx: &()) -> garde::Result {
    if value.contains(DELIMITER) {
        return Err(garde::Error::new(format!("must not contain '{DELIMITER}'")));
    }
    Ok(())
}

/// Identifiers end up in file and directory names under the watch root.
fn path_safe(value: &String, _ctx: &()) -> garde::Result {
    if value.contains(['/', '\\']) || value.starts_with('.') {
        return Err(garde::Error::new("must be a plain file name component"));
    }
    Ok(())
}

fn start_immediately() -> bool {
    true
}

/// POST /api/v1/jobs request body.
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct SubmitJobRequest {
    #[garde(length(min = 1, max = 128), custom(no_delimiter), custom(path_safe))]
    pub user_id: String,

    #[garde(length(min = 1, max = 128), custom(path_safe))]
    pub job_id: String,

    #[garde(length(min = 1, max = 16), custom(no_delimiter))]
    pub file_type: String,

    #[garde(length(min = 1, max = 8), custom(no_delimiter))]
    pub skip_flag: String,

    #[garde(length(min = 1, max = 10), dive)]
    pub entries: Vec<NewImageEntry>,

    /// With `false` the job waits for further image batches and an explicit
    /// start request.
    #[serde(default = "start_immediately")]
    #[garde(skip)]
    pub start: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct AppendImagesRequest {
    #[garde(length(min = 1, max = 10), dive)]
    pub entries: Vec<NewImageEntry>,
}

/// Update records are free-form image fields keyed by `file`. Kept as a raw
/// value so a non-array payload is reported as invalid input.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct UpdateImagesRequest {
    pub updates: Value,
}

#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct ContactRequest {
    #[garde(length(min = 1, max = 128))]
    pub user_id: String,

    #[garde(email)]
    pub email: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SubmitJobResponse {
    pub job_id: String,
    pub status: JobStatus,
    pub message: String,
    pub results: Vec<EntryOutcome>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct BatchResponse {
    pub message: String,
    pub results: Vec<EntryOutcome>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct OngoingResponse {
    pub job_id: Option<String>,
    pub message: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CancelResponse {
    pub job_id: String,
    pub status: JobStatus,
    pub message: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ContactResponse {
    pub stored: bool,
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(user_id: &str, job_id: &str) -> SubmitJobRequest {
        SubmitJobRequest {
            user_id: user_id.to_string(),
            job_id: job_id.to_string(),
            file_type: "svs".to_string(),
            skip_flag: "n".to_string(),
            entries: vec![NewImageEntry {
                file_id: "a.svs".to_string(),
                kdpi: 0.5,
                induction: "LymDep".to_string(),
                age: 40.0,
                pump: "N".to_string(),
                cit: 8.0,
                wedge: Some("y".to_string()),
            }],
            start: true,
        }
    }

    #[test]
    fn test_job_id_may_contain_delimiter() {
        assert!(request("u1", "batch_7").validate().is_ok());
    }

    #[test]
    fn test_user_id_must_not_contain_delimiter() {
        assert!(request("u_1", "batch").validate().is_err());
    }

    #[test]
    fn test_empty_entries_rejected() {
        let mut req = request("u1", "batch");
        req.entries.clear();
        assert!(req.validate().is_err());
    }

    #[test]
    fn test_identifiers_must_be_path_safe() {
        assert!(request("u1", "../etc").validate().is_err());
        assert!(request("u1", "a/b").validate().is_err());
        assert!(request(".u1", "batch").validate().is_err());
    }

    #[test]
    fn test_start_defaults_to_true() {
        let body = serde_json::json!({
            "user_id": "u1",
            "job_id": "j1",
            "file_type": "svs",
            "skip_flag": "n",
            "entries": [{
                "file_id": "a.svs", "kdpi": 0.5, "induction": "LND",
                "age": 40.0, "pump": "N", "cit": 8.0
            }]
        });
        let req: SubmitJobRequest = serde_json::from_value(body).unwrap();
        assert!(req.start);
        assert_eq!(req.entries[0].wedge, None);
    }
}
