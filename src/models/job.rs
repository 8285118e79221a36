use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use crate::services::codec::JobIdentity;

/// Lifecycle of a submitted job.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, EnumString, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum JobStatus {
    Created,
    Running,
    Completed,
    Cancelled,
}

/// Structured job identity, recorded when the job is submitted. The marker
/// file written afterwards only triggers the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobTicket {
    pub user_id: String,
    pub job_id: String,
    pub file_type: String,
    pub skip_flag: String,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
}

impl JobTicket {
    pub fn new(user_id: &str, job_id: &str, file_type: &str, skip_flag: &str) -> Self {
        Self {
            user_id: user_id.to_string(),
            job_id: job_id.to_string(),
            file_type: file_type.to_string(),
            skip_flag: skip_flag.to_string(),
            status: JobStatus::Created,
            created_at: Utc::now(),
        }
    }

    pub fn identity(&self) -> JobIdentity {
        JobIdentity {
            user_id: self.user_id.clone(),
            job_id: self.job_id.clone(),
            file_type: self.file_type.clone(),
            skip_flag: self.skip_flag.clone(),
        }
    }
}

/// A user's job with the file names of its images, in submission order.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobSummary {
    pub job_id: String,
    pub status: JobStatus,
    pub file_ids: Vec<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EntryStatus {
    Success,
    Failed,
}

/// Per-entry result of a batch store operation. One failed entry never
/// prevents the others from being applied.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EntryOutcome {
    pub file_id: String,
    pub status: EntryStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl EntryOutcome {
    pub fn success(file_id: impl Into<String>) -> Self {
        Self {
            file_id: file_id.into(),
            status: EntryStatus::Success,
            error: None,
        }
    }

    pub fn failed(file_id: impl Into<String>, error: impl ToString) -> Self {
        Self {
            file_id: file_id.into(),
            status: EntryStatus::Failed,
            error: Some(error.to_string()),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == EntryStatus::Success
    }
}
