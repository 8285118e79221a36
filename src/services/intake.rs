//! Job submission and cancellation.
//!
//! Submission records the ticket and images in the store first, then writes
//! the clinical covariates file, and only then the marker file the watcher
//! reacts to. Cancellation removes the job from the store, stops the owner's
//! pipeline with the cancel script and sweeps its files.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use csv::WriterBuilder;
use tokio::io::AsyncWriteExt;
use tracing::{error, info, warn};

use crate::models::image::{ImageRecord, NewImageEntry};
use crate::models::job::{EntryOutcome, JobStatus, JobTicket};
use crate::models::submission::{BatchResponse, SubmitJobRequest, SubmitJobResponse};
use crate::services::codec::{self, JobIdentity};
use crate::services::process::ScriptLauncher;
use crate::services::store::{JobStore, StoreError};
use crate::services::sweeper::{self, SweepError, SweepReport};

const MARKER_HEADER: [&str; 4] = ["File", "Include", "Set", "Wedge"];
const CLINICAL_HEADER: [&str; 6] = [
    "File",
    "KDPI",
    "Induction",
    "Recipient Ag",
    "PUMP_KI",
    "CIT(hours)",
];
const INCLUDE_FLAG: &str = "y";
const SAMPLE_SET: &str = "test";

/// One line of the pipeline input listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MarkerRow {
    pub file: String,
    pub wedge: String,
}

impl From<&ImageRecord> for MarkerRow {
    fn from(record: &ImageRecord) -> Self {
        Self {
            file: record.file().unwrap_or_default().to_string(),
            wedge: record.wedge().to_string(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum IntakeError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Failed to write job input file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to encode job input file: {0}")]
    Csv(#[from] csv::Error),

    #[error(transparent)]
    Sweep(#[from] SweepError),
}

fn encode_rows<const N: usize>(header: Option<[&str; N]>, rows: &[[String; N]]) -> Result<Vec<u8>, IntakeError> {
    let mut writer = WriterBuilder::new().delimiter(b'\t').from_writer(Vec::new());
    if let Some(header) = header {
        writer.write_record(header)?;
    }
    for row in rows {
        writer.write_record(row)?;
    }
    writer.into_inner().map_err(|e| IntakeError::Io(e.into_error()))
}

fn clinical_row(entry: &NewImageEntry) -> [String; 6] {
    let (file, _) = entry.split_file_id();
    [
        file.to_string(),
        entry.kdpi.to_string(),
        entry.induction.clone(),
        entry.age.to_string(),
        entry.pump.clone(),
        entry.cit.to_string(),
    ]
}

/// Append clinical rows for `entries`, creating the file with its header.
pub async fn append_clinical_rows(
    root: &Path,
    user_id: &str,
    job_id: &str,
    entries: &[&NewImageEntry],
) -> Result<PathBuf, IntakeError> {
    let path = root.join(codec::clinical_file_name(user_id, job_id));
    let exists = tokio::fs::try_exists(&path).await?;
    let rows: Vec<_> = entries.iter().map(|e| clinical_row(e)).collect();
    let bytes = encode_rows((!exists).then_some(CLINICAL_HEADER), &rows)?;

    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .await?;
    file.write_all(&bytes).await?;
    file.flush().await?;
    Ok(path)
}

/// Write the marker file. Content is staged under a hidden name and renamed
/// into place, so the file appears complete.
pub async fn write_marker(
    root: &Path,
    identity: &JobIdentity,
    rows: &[MarkerRow],
) -> Result<PathBuf, IntakeError> {
    let name = identity.marker_name();
    let rows: Vec<_> = rows
        .iter()
        .map(|r| {
            [
                r.file.clone(),
                INCLUDE_FLAG.to_string(),
                SAMPLE_SET.to_string(),
                r.wedge.clone(),
            ]
        })
        .collect();
    let bytes = encode_rows(Some(MARKER_HEADER), &rows)?;

    let staging = root.join(format!(".{name}.tmp"));
    let path = root.join(&name);
    tokio::fs::write(&staging, bytes).await?;
    tokio::fs::rename(&staging, &path).await?;
    Ok(path)
}

/// Submission and cancellation against the store and the watch root.
#[derive(Clone)]
pub struct IntakeService {
    store: Arc<dyn JobStore>,
    launcher: Arc<dyn ScriptLauncher>,
    root: PathBuf,
    cancel_script: PathBuf,
}

impl IntakeService {
    pub fn new(
        store: Arc<dyn JobStore>,
        launcher: Arc<dyn ScriptLauncher>,
        root: impl Into<PathBuf>,
        cancel_script: impl Into<PathBuf>,
    ) -> Self {
        Self {
            store,
            launcher,
            root: root.into(),
            cancel_script: cancel_script.into(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    async fn record_clinical(
        &self,
        user_id: &str,
        job_id: &str,
        entries: &[NewImageEntry],
        outcomes: &[EntryOutcome],
    ) -> Result<(), IntakeError> {
        let stored: Vec<&NewImageEntry> = entries
            .iter()
            .filter(|e| outcomes.iter().any(|o| o.is_success() && o.file_id == e.file_id))
            .collect();
        if !stored.is_empty() {
            append_clinical_rows(&self.root, user_id, job_id, &stored).await?;
        }
        Ok(())
    }

    /// Create the job and, unless deferred, start it.
    pub async fn submit(&self, request: &SubmitJobRequest) -> Result<SubmitJobResponse, IntakeError> {
        let ticket = JobTicket::new(
            &request.user_id,
            &request.job_id,
            &request.file_type,
            &request.skip_flag,
        );
        let outcomes = self.store.create_job(&ticket, &request.entries).await?;
        self.record_clinical(&ticket.user_id, &ticket.job_id, &request.entries, &outcomes)
            .await?;

        let stored = outcomes.iter().filter(|o| o.is_success()).count();
        info!(
            user_id = %ticket.user_id,
            job_id = %ticket.job_id,
            stored,
            failed = outcomes.len() - stored,
            "Job submitted"
        );

        let message = if !request.start {
            "Job created, awaiting further images"
        } else if stored == 0 {
            warn!(user_id = %ticket.user_id, job_id = %ticket.job_id, "No images stored, job not started");
            "No images stored, job not started"
        } else {
            self.start(&ticket.user_id, &ticket.job_id).await?;
            "Job submitted for processing"
        };

        Ok(SubmitJobResponse {
            job_id: ticket.job_id,
            status: ticket.status,
            message: message.to_string(),
            results: outcomes,
        })
    }

    /// Add images to a job that has not been started yet.
    pub async fn append(
        &self,
        user_id: &str,
        job_id: &str,
        entries: &[NewImageEntry],
    ) -> Result<BatchResponse, IntakeError> {
        let ticket = self.store.find_ticket(user_id, job_id).await?;
        if ticket.status != JobStatus::Created || self.marker_exists(&ticket).await? {
            return Err(IntakeError::InvalidInput(format!("job {job_id} has already started")));
        }
        let outcomes = self.store.append_images(user_id, job_id, entries).await?;
        self.record_clinical(user_id, job_id, entries, &outcomes).await?;
        Ok(BatchResponse {
            message: format!("Appended {} image(s)", outcomes.iter().filter(|o| o.is_success()).count()),
            results: outcomes,
        })
    }

    async fn marker_exists(&self, ticket: &JobTicket) -> Result<bool, IntakeError> {
        let path = self.root.join(ticket.identity().marker_name());
        Ok(tokio::fs::try_exists(path).await?)
    }

    /// Write the marker for a stored job, listing all of its images.
    pub async fn start(&self, user_id: &str, job_id: &str) -> Result<PathBuf, IntakeError> {
        let ticket = self.store.find_ticket(user_id, job_id).await?;
        if ticket.status != JobStatus::Created || self.marker_exists(&ticket).await? {
            return Err(IntakeError::InvalidInput(format!("job {job_id} has already started")));
        }
        let images = self.store.job_images(user_id, job_id).await?;
        if images.is_empty() {
            return Err(IntakeError::InvalidInput(format!("job {job_id} has no images")));
        }

        let rows: Vec<MarkerRow> = images.iter().map(MarkerRow::from).collect();
        let path = write_marker(&self.root, &ticket.identity(), &rows).await?;
        info!(user_id, job_id, path = %path.display(), images = rows.len(), "Job marker written");
        Ok(path)
    }

    /// Remove the job from the store, then stop and sweep in the background.
    pub async fn cancel(&self, user_id: &str, job_id: &str) -> Result<(), IntakeError> {
        self.store.delete_job(user_id, job_id).await?;
        metrics::counter!("pipeline_jobs_cancelled_total").increment(1);
        info!(user_id, job_id, "Job cancelled");

        let service = self.clone();
        let owner = user_id.to_string();
        tokio::spawn(async move {
            if let Err(e) = service.stop_and_sweep(&owner).await {
                error!(user_id = %owner, error = %e, "Cleanup after cancellation failed");
            }
        });
        Ok(())
    }

    /// Run the cancel script for the owner, then sweep its files. A failing
    /// script is logged and the sweep still runs.
    pub async fn stop_and_sweep(&self, user_id: &str) -> Result<SweepReport, IntakeError> {
        let args = [user_id.to_string()];
        if let Err(e) = self.launcher.launch(&self.cancel_script, &args).wait().await {
            error!(user_id, error = %e, "Cancel script failed");
        }

        let root = self.root.clone();
        let owner = user_id.to_string();
        let report = tokio::task::spawn_blocking(move || sweeper::sweep_job(&root, &owner))
            .await
            .map_err(|e| IntakeError::Io(std::io::Error::new(ErrorKind::Other, e.to_string())))??;
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::process::{ScriptOutput, ScriptTask};
    use crate::services::store::MemoryJobStore;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingLauncher {
        calls: Mutex<Vec<(PathBuf, Vec<String>)>>,
    }

    impl ScriptLauncher for RecordingLauncher {
        fn launch(&self, script: &Path, args: &[String]) -> ScriptTask {
            self.calls
                .lock()
                .unwrap()
                .push((script.to_path_buf(), args.to_vec()));
            ScriptTask::finished(
                "stub",
                Ok(ScriptOutput {
                    exit_code: 0,
                    stderr: String::new(),
                    duration_ms: 0,
                }),
            )
        }
    }

    fn entry(file_id: &str, wedge: Option<&str>) -> NewImageEntry {
        NewImageEntry {
            file_id: file_id.to_string(),
            kdpi: 0.45,
            induction: "LymDep".to_string(),
            age: 61.0,
            pump: "Y".to_string(),
            cit: 17.5,
            wedge: wedge.map(str::to_string),
        }
    }

    fn request(start: bool) -> SubmitJobRequest {
        SubmitJobRequest {
            user_id: "u1".into(),
            job_id: "job_7".into(),
            file_type: "svs".into(),
            skip_flag: "n".into(),
            entries: vec![entry("s1.svs", Some("y")), entry("s2.svs", None)],
            start,
        }
    }

    fn service(root: &Path) -> (IntakeService, Arc<MemoryJobStore>, Arc<RecordingLauncher>) {
        let store = Arc::new(MemoryJobStore::new());
        let launcher = Arc::new(RecordingLauncher::default());
        let svc = IntakeService::new(store.clone(), launcher.clone(), root, "./bashCancel.sh");
        (svc, store, launcher)
    }

    #[tokio::test]
    async fn test_submit_writes_clinical_then_marker() {
        let dir = tempfile::tempdir().unwrap();
        let (svc, _, _) = service(dir.path());

        let response = svc.submit(&request(true)).await.unwrap();
        assert_eq!(response.results.len(), 2);
        assert!(response.results.iter().all(EntryOutcome::is_success));

        let clinical = std::fs::read_to_string(dir.path().join("u1_job_7_clinical.txt")).unwrap();
        assert_eq!(
            clinical,
            "File\tKDPI\tInduction\tRecipient Ag\tPUMP_KI\tCIT(hours)\n\
             s1\t0.45\tLymDep\t61\tY\t17.5\n\
             s2\t0.45\tLymDep\t61\tY\t17.5\n"
        );

        let marker = std::fs::read_to_string(dir.path().join("u1_job_7_svs_n_newtest.txt")).unwrap();
        assert_eq!(marker, "File\tInclude\tSet\tWedge\ns1\ty\ttest\ty\ns2\ty\ttest\t\n");
        assert!(!dir.path().join(".u1_job_7_svs_n_newtest.txt.tmp").exists());
    }

    #[tokio::test]
    async fn test_deferred_start_accepts_appends() {
        let dir = tempfile::tempdir().unwrap();
        let (svc, store, _) = service(dir.path());

        svc.submit(&request(false)).await.unwrap();
        assert!(!dir.path().join("u1_job_7_svs_n_newtest.txt").exists());

        svc.append("u1", "job_7", &[entry("s3.svs", None)]).await.unwrap();
        svc.start("u1", "job_7").await.unwrap();

        let marker = std::fs::read_to_string(dir.path().join("u1_job_7_svs_n_newtest.txt")).unwrap();
        assert_eq!(marker.lines().count(), 4);
        assert_eq!(store.job_images("u1", "job_7").await.unwrap().len(), 3);

        let clinical = std::fs::read_to_string(dir.path().join("u1_job_7_clinical.txt")).unwrap();
        assert_eq!(clinical.matches("File\t").count(), 1);
        assert_eq!(clinical.lines().count(), 4);

        assert!(matches!(
            svc.append("u1", "job_7", &[entry("s4.svs", None)]).await,
            Err(IntakeError::InvalidInput(_))
        ));
        assert!(matches!(
            svc.start("u1", "job_7").await,
            Err(IntakeError::InvalidInput(_))
        ));
    }

    #[tokio::test]
    async fn test_append_to_unknown_job_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let (svc, _, _) = service(dir.path());
        assert!(matches!(
            svc.append("u1", "nope", &[entry("s.svs", None)]).await,
            Err(IntakeError::Store(StoreError::NotFound(_)))
        ));
    }

    #[tokio::test]
    async fn test_cancel_runs_script_and_sweeps() {
        let dir = tempfile::tempdir().unwrap();
        let (svc, store, launcher) = service(dir.path());
        svc.submit(&request(true)).await.unwrap();
        std::fs::create_dir_all(dir.path().join("u1_newpipeline/tmp")).unwrap();
        std::fs::write(dir.path().join("u1_newpipeline/tmp/x.log"), b"x").unwrap();

        svc.store.delete_job("u1", "job_7").await.unwrap();
        let report = svc.stop_and_sweep("u1").await.unwrap();

        assert_eq!(
            launcher.calls.lock().unwrap().clone(),
            vec![(PathBuf::from("./bashCancel.sh"), vec!["u1".to_string()])]
        );
        assert_eq!(report.inputs_removed, 2);
        assert!(!dir.path().join("u1_newpipeline").exists());
        assert!(matches!(
            store.find_ticket("u1", "job_7").await,
            Err(StoreError::NotFound(_))
        ));
        assert!(matches!(
            svc.cancel("u1", "job_7").await,
            Err(IntakeError::Store(StoreError::NotFound(_)))
        ));
    }
}
