//! Job state store: users, job tickets, image documents and the donor and
//! recipient covariate records they reference.
//!
//! [`JobStore`] is implemented by [`MemoryJobStore`] here and by
//! [`crate::db::PgJobStore`] for PostgreSQL.

use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::models::image::{ImageRecord, NewImageEntry, FILE_KEY};
use crate::models::job::{EntryOutcome, JobStatus, JobSummary, JobTicket};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("{0} not found")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Database error: {0}")]
    Persistence(#[from] sqlx::Error),
}

#[async_trait]
pub trait JobStore: Send + Sync {
    /// Connectivity check for health reporting.
    async fn ping(&self) -> Result<(), StoreError>;

    /// Record a new job ticket and insert its images. Each entry is applied
    /// independently; the returned list has one outcome per entry.
    async fn create_job(
        &self,
        ticket: &JobTicket,
        entries: &[NewImageEntry],
    ) -> Result<Vec<EntryOutcome>, StoreError>;

    async fn append_images(
        &self,
        user_id: &str,
        job_id: &str,
        entries: &[NewImageEntry],
    ) -> Result<Vec<EntryOutcome>, StoreError>;

    async fn find_ticket(&self, user_id: &str, job_id: &str) -> Result<JobTicket, StoreError>;

    async fn set_status(
        &self,
        user_id: &str,
        job_id: &str,
        status: JobStatus,
    ) -> Result<(), StoreError>;

    /// Images of a job, in submission order.
    async fn job_images(&self, user_id: &str, job_id: &str) -> Result<Vec<ImageRecord>, StoreError>;

    /// Merge update records into the job's image documents, matching on
    /// `file`. One outcome per update record.
    async fn update_images(
        &self,
        user_id: &str,
        job_id: &str,
        updates: &[Map<String, Value>],
    ) -> Result<Vec<EntryOutcome>, StoreError>;

    /// Delete a job, its images and their donor/recipient records.
    async fn delete_job(&self, user_id: &str, job_id: &str) -> Result<(), StoreError>;

    async fn list_jobs(&self, user_id: &str) -> Result<Vec<JobSummary>, StoreError>;

    /// Image documents whose `file` is one of `files`, across all jobs.
    async fn images_by_file(&self, files: &[String]) -> Result<Vec<ImageRecord>, StoreError>;

    /// First job of the user with an image the pipeline has not measured yet.
    async fn ongoing_job(&self, user_id: &str) -> Result<Option<String>, StoreError> {
        for job in self.list_jobs(user_id).await? {
            let images = self.job_images(user_id, &job.job_id).await?;
            if images.iter().any(ImageRecord::is_pending) {
                return Ok(Some(job.job_id));
            }
        }
        Ok(None)
    }
}

/// Keys touched by a merge.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct MergeReport {
    pub added: Vec<String>,
    pub overwritten: Vec<String>,
}

/// Field-by-field upsert of `update` into `doc`. New keys are added and
/// existing keys replaced; the `file` key is never written.
pub fn merge_image_fields(doc: &mut Map<String, Value>, update: &Map<String, Value>) -> MergeReport {
    let mut report = MergeReport::default();
    for (key, value) in update {
        if key == FILE_KEY {
            continue;
        }
        match doc.insert(key.clone(), value.clone()) {
            None => report.added.push(key.clone()),
            Some(previous) if previous != *value => report.overwritten.push(key.clone()),
            Some(_) => {}
        }
    }
    report
}

/// `file` value of an update record.
pub fn update_file_key(update: &Map<String, Value>) -> Option<&str> {
    update.get(FILE_KEY).and_then(Value::as_str)
}

struct StoredJob {
    ticket: JobTicket,
    image_ids: Vec<Uuid>,
}

#[derive(Default)]
struct MemoryState {
    /// User id → jobs in submission order.
    users: HashMap<String, Vec<StoredJob>>,
    images: HashMap<Uuid, Map<String, Value>>,
    donors: HashMap<Uuid, Value>,
    recipients: HashMap<Uuid, Value>,
}

impl MemoryState {
    fn job(&self, user_id: &str, job_id: &str) -> Result<&StoredJob, StoreError> {
        let jobs = self
            .users
            .get(user_id)
            .ok_or_else(|| StoreError::NotFound(format!("User {user_id}")))?;
        jobs.iter()
            .find(|j| j.ticket.job_id == job_id)
            .ok_or_else(|| StoreError::NotFound(format!("Job {job_id}")))
    }

    fn job_mut(&mut self, user_id: &str, job_id: &str) -> Result<&mut StoredJob, StoreError> {
        let jobs = self
            .users
            .get_mut(user_id)
            .ok_or_else(|| StoreError::NotFound(format!("User {user_id}")))?;
        jobs.iter_mut()
            .find(|j| j.ticket.job_id == job_id)
            .ok_or_else(|| StoreError::NotFound(format!("Job {job_id}")))
    }

    fn insert_entry(&mut self, entry: &NewImageEntry) -> Uuid {
        let recipient = Uuid::new_v4();
        let donor = Uuid::new_v4();
        self.recipients.insert(
            recipient,
            json!({ "recipient_age": entry.age, "induction_type": entry.induction, "donor": donor }),
        );
        self.donors.insert(
            donor,
            json!({ "cold_ischemia": entry.cit, "pump": entry.pump, "kdpi": entry.kdpi, "recipient": recipient }),
        );
        let image = Uuid::new_v4();
        self.images.insert(image, entry.initial_doc(donor, recipient));
        image
    }

    fn records(&self, ids: &[Uuid]) -> Vec<ImageRecord> {
        ids.iter()
            .filter_map(|id| {
                self.images.get(id).map(|doc| ImageRecord {
                    id: *id,
                    doc: doc.clone(),
                })
            })
            .collect()
    }
}

/// In-process store, used when no database is configured.
#[derive(Default)]
pub struct MemoryJobStore {
    state: RwLock<MemoryState>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of donor and recipient records currently held.
    pub async fn covariate_counts(&self) -> (usize, usize) {
        let state = self.state.read().await;
        (state.donors.len(), state.recipients.len())
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }

    async fn create_job(
        &self,
        ticket: &JobTicket,
        entries: &[NewImageEntry],
    ) -> Result<Vec<EntryOutcome>, StoreError> {
        let mut state = self.state.write().await;
        let jobs = state.users.entry(ticket.user_id.clone()).or_default();
        if jobs.iter().any(|j| j.ticket.job_id == ticket.job_id) {
            return Err(StoreError::InvalidInput(format!(
                "job {} already exists for user {}",
                ticket.job_id, ticket.user_id
            )));
        }
        jobs.push(StoredJob {
            ticket: ticket.clone(),
            image_ids: Vec::new(),
        });
        drop(state);

        self.append_images(&ticket.user_id, &ticket.job_id, entries).await
    }

    async fn append_images(
        &self,
        user_id: &str,
        job_id: &str,
        entries: &[NewImageEntry],
    ) -> Result<Vec<EntryOutcome>, StoreError> {
        let mut state = self.state.write().await;
        state.job(user_id, job_id)?;

        let mut outcomes = Vec::with_capacity(entries.len());
        for entry in entries {
            let image = state.insert_entry(entry);
            state.job_mut(user_id, job_id)?.image_ids.push(image);
            outcomes.push(EntryOutcome::success(&entry.file_id));
        }
        Ok(outcomes)
    }

    async fn find_ticket(&self, user_id: &str, job_id: &str) -> Result<JobTicket, StoreError> {
        let state = self.state.read().await;
        Ok(state.job(user_id, job_id)?.ticket.clone())
    }

    async fn set_status(
        &self,
        user_id: &str,
        job_id: &str,
        status: JobStatus,
    ) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        state.job_mut(user_id, job_id)?.ticket.status = status;
        Ok(())
    }

    async fn job_images(&self, user_id: &str, job_id: &str) -> Result<Vec<ImageRecord>, StoreError> {
        let state = self.state.read().await;
        let job = state.job(user_id, job_id)?;
        Ok(state.records(&job.image_ids))
    }

    async fn update_images(
        &self,
        user_id: &str,
        job_id: &str,
        updates: &[Map<String, Value>],
    ) -> Result<Vec<EntryOutcome>, StoreError> {
        let mut state = self.state.write().await;
        let image_ids = state.job(user_id, job_id)?.image_ids.clone();

        let mut outcomes = Vec::with_capacity(updates.len());
        for update in updates {
            let Some(file) = update_file_key(update) else {
                outcomes.push(EntryOutcome::failed("", "update record has no file key"));
                continue;
            };

            let mut matched = false;
            for id in &image_ids {
                let Some(doc) = state.images.get_mut(id) else {
                    warn!(image_id = %id, "Image referenced by job is missing");
                    continue;
                };
                if doc.get(FILE_KEY).and_then(Value::as_str) != Some(file) {
                    continue;
                }
                let report = merge_image_fields(doc, update);
                debug!(image_id = %id, file, added = ?report.added, overwritten = ?report.overwritten, "Merged image fields");
                matched = true;
            }

            outcomes.push(if matched {
                EntryOutcome::success(file)
            } else {
                EntryOutcome::failed(file, StoreError::NotFound(format!("Image {file}")))
            });
        }
        Ok(outcomes)
    }

    async fn delete_job(&self, user_id: &str, job_id: &str) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        state.job(user_id, job_id)?;

        let jobs = state.users.get_mut(user_id).map(std::mem::take).unwrap_or_default();
        let (removed, kept): (Vec<_>, Vec<_>) =
            jobs.into_iter().partition(|j| j.ticket.job_id == job_id);
        state.users.insert(user_id.to_string(), kept);

        for job in removed {
            for id in job.image_ids {
                let Some(doc) = state.images.remove(&id) else {
                    warn!(image_id = %id, "Image already gone during cascade delete");
                    continue;
                };
                let record = ImageRecord { id, doc };
                if let Some(donor) = record.donor_id() {
                    state.donors.remove(&donor);
                }
                if let Some(recipient) = record.recipient_id() {
                    state.recipients.remove(&recipient);
                }
            }
        }
        info!(user_id, job_id, "Deleted job and owned records");
        Ok(())
    }

    async fn list_jobs(&self, user_id: &str) -> Result<Vec<JobSummary>, StoreError> {
        let state = self.state.read().await;
        let jobs = state
            .users
            .get(user_id)
            .ok_or_else(|| StoreError::NotFound(format!("User {user_id}")))?;
        Ok(jobs
            .iter()
            .map(|job| JobSummary {
                job_id: job.ticket.job_id.clone(),
                status: job.ticket.status,
                file_ids: state
                    .records(&job.image_ids)
                    .iter()
                    .filter_map(|r| r.file().map(str::to_string))
                    .collect(),
            })
            .collect())
    }

    async fn images_by_file(&self, files: &[String]) -> Result<Vec<ImageRecord>, StoreError> {
        let state = self.state.read().await;
        Ok(state
            .images
            .iter()
            .filter(|(_, doc)| {
                doc.get(FILE_KEY)
                    .and_then(Value::as_str)
                    .is_some_and(|f| files.iter().any(|wanted| wanted == f))
            })
            .map(|(id, doc)| ImageRecord {
                id: *id,
                doc: doc.clone(),
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(file_id: &str) -> NewImageEntry {
        NewImageEntry {
            file_id: file_id.to_string(),
            kdpi: 0.6,
            induction: "LymDep".to_string(),
            age: 52.0,
            pump: "Y".to_string(),
            cit: 14.0,
            wedge: None,
        }
    }

    fn object(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected a JSON object"),
        }
    }

    #[test]
    fn test_merge_never_overwrites_file() {
        let mut doc = object(json!({ "file": "A", "kdpi": 3, "extra": 1 }));
        let report = merge_image_fields(&mut doc, &object(json!({ "file": "A", "kdpi": 5 })));
        assert_eq!(Value::Object(doc), json!({ "file": "A", "kdpi": 5, "extra": 1 }));
        assert_eq!(report.overwritten, vec!["kdpi".to_string()]);
        assert!(report.added.is_empty());
    }

    #[test]
    fn test_merge_reports_added_keys() {
        let mut doc = object(json!({ "file": "A" }));
        let report = merge_image_fields(&mut doc, &object(json!({ "file": "B", "kdqs": 4 })));
        assert_eq!(doc.get("file"), Some(&json!("A")));
        assert_eq!(report.added, vec!["kdqs".to_string()]);
    }

    #[tokio::test]
    async fn test_create_and_list() {
        let store = MemoryJobStore::new();
        let ticket = JobTicket::new("u1", "job1", "svs", "n");
        let outcomes = store
            .create_job(&ticket, &[entry("a.svs"), entry("b.svs")])
            .await
            .unwrap();
        assert!(outcomes.iter().all(EntryOutcome::is_success));

        let jobs = store.list_jobs("u1").await.unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].file_ids, vec!["a".to_string(), "b".to_string()]);
        assert_eq!(jobs[0].status, JobStatus::Created);
    }

    #[tokio::test]
    async fn test_ongoing_until_base_size_merged() {
        let store = MemoryJobStore::new();
        store
            .create_job(&JobTicket::new("u1", "job1", "svs", "n"), &[entry("a.svs")])
            .await
            .unwrap();
        assert_eq!(store.ongoing_job("u1").await.unwrap(), Some("job1".to_string()));

        let outcomes = store
            .update_images("u1", "job1", &[object(json!({ "file": "a", "base_size": 12.5 }))])
            .await
            .unwrap();
        assert!(outcomes[0].is_success());
        assert_eq!(store.ongoing_job("u1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_update_isolates_failed_entries() {
        let store = MemoryJobStore::new();
        store
            .create_job(&JobTicket::new("u1", "job1", "svs", "n"), &[entry("a.svs")])
            .await
            .unwrap();
        let outcomes = store
            .update_images(
                "u1",
                "job1",
                &[
                    object(json!({ "file": "missing", "kdqs": 1 })),
                    object(json!({ "kdqs": 2 })),
                    object(json!({ "file": "a", "kdqs": 3 })),
                ],
            )
            .await
            .unwrap();
        assert!(!outcomes[0].is_success());
        assert!(!outcomes[1].is_success());
        assert!(outcomes[2].is_success());
        let images = store.job_images("u1", "job1").await.unwrap();
        assert_eq!(images[0].doc.get("kdqs"), Some(&json!(3)));
    }

    #[tokio::test]
    async fn test_cascade_delete() {
        let store = MemoryJobStore::new();
        store
            .create_job(&JobTicket::new("u1", "job1", "svs", "n"), &[entry("a.svs"), entry("b.svs")])
            .await
            .unwrap();
        store
            .create_job(&JobTicket::new("u1", "job2", "svs", "n"), &[entry("c.svs")])
            .await
            .unwrap();
        assert_eq!(store.covariate_counts().await, (3, 3));

        store.delete_job("u1", "job1").await.unwrap();
        assert_eq!(store.covariate_counts().await, (1, 1));
        let jobs = store.list_jobs("u1").await.unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].job_id, "job2");
        assert!(matches!(
            store.job_images("u1", "job1").await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_lookup_misses_are_not_found() {
        let store = MemoryJobStore::new();
        assert!(matches!(store.list_jobs("nobody").await, Err(StoreError::NotFound(_))));
        assert!(matches!(
            store.find_ticket("nobody", "job").await,
            Err(StoreError::NotFound(_))
        ));
        assert!(matches!(
            store.append_images("nobody", "job", &[entry("a.svs")]).await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_duplicate_job_rejected() {
        let store = MemoryJobStore::new();
        let ticket = JobTicket::new("u1", "job1", "svs", "n");
        store.create_job(&ticket, &[entry("a.svs")]).await.unwrap();
        assert!(matches!(
            store.create_job(&ticket, &[entry("a.svs")]).await,
            Err(StoreError::InvalidInput(_))
        ));
    }

    #[tokio::test]
    async fn test_images_by_file() {
        let store = MemoryJobStore::new();
        store
            .create_job(&JobTicket::new("u1", "job1", "svs", "n"), &[entry("a.svs"), entry("b.svs")])
            .await
            .unwrap();
        let found = store.images_by_file(&["b".to_string()]).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].file(), Some("b"));
    }
}
