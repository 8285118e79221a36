//! Job lifecycle monitor.
//!
//! Turns filesystem events under the watch root into job state transitions:
//!
//! 1. a marker file directly under the root starts the pipeline script;
//! 2. the owner's `_newpipeline` directory appearing gets a secondary watch;
//! 3. the aggregate results CSV appearing inside it finalizes the job.
//!
//! Job identity travels in a per-owner [`JobContext`] from step 1 to step 3.
//! When the context is missing (the watcher restarted mid-job) the job id is
//! recovered from the owner's marker file, which is still on disk until the
//! sweep.
//!
//! Failures are logged and counted. Nothing is retried or rolled back.

use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::models::job::JobStatus;
use crate::services::codec::{self, CodecError, JobIdentity, RESULTS_FILE, RESULTS_SUBDIR};
use crate::services::contacts::ContactBook;
use crate::services::process::{ProcessError, ScriptLauncher};
use crate::services::report::{self, ReportError};
use crate::services::results::{self, ResultsError, ScoredImage};
use crate::services::store::{JobStore, StoreError};
use crate::services::sweeper::{self, SweepError};
use crate::services::watcher::{EventSource, FsEvent, FsEventKind, WatchError};

/// How many times the results file size is sampled before reading it.
const SETTLE_ATTEMPTS: u32 = 30;

#[derive(Debug, Clone)]
pub struct MonitorSettings {
    pub root: PathBuf,
    pub pipeline_script: PathBuf,
    pub finalize_script: PathBuf,
    pub app_url: String,
    /// Delay between size samples of the results file. Zero disables waiting.
    pub settle_interval: Duration,
}

/// What the monitor knows about a running job.
#[derive(Debug, Clone)]
pub struct JobContext {
    pub identity: JobIdentity,
    pub output_dir: Option<PathBuf>,
    pub started_at: Instant,
}

/// Outcome of handling one event.
#[derive(Debug)]
pub enum Transition {
    Ignored,
    Started(JobIdentity),
    Running { owner: String, output_dir: PathBuf },
    Completing(Completion),
}

/// A finalization in progress.
#[derive(Debug)]
pub struct Completion {
    pub user_id: String,
    pub job_id: String,
    handle: JoinHandle<Result<(), LifecycleError>>,
}

impl Completion {
    /// Wait for finalization to finish.
    pub async fn join(self) -> Result<(), LifecycleError> {
        self.handle.await.map_err(|e| LifecycleError::Aborted(e.to_string()))?
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LifecycleError {
    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Process(#[from] ProcessError),

    #[error(transparent)]
    Results(#[from] ResultsError),

    #[error(transparent)]
    Report(#[from] ReportError),

    #[error(transparent)]
    Sweep(#[from] SweepError),

    #[error(transparent)]
    Watch(#[from] WatchError),

    #[error("Failed to relocate {from} to {to}: {source}")]
    Relocate {
        from: PathBuf,
        to: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Background task aborted: {0}")]
    Aborted(String),
}

/// Collaborators shared with spawned finalization tasks.
struct Shared {
    settings: MonitorSettings,
    store: Arc<dyn JobStore>,
    launcher: Arc<dyn ScriptLauncher>,
    contacts: Arc<ContactBook>,
    events: Arc<dyn EventSource>,
    /// Owners whose finalization is running.
    finalizing: Mutex<HashSet<String>>,
}

pub struct Monitor {
    shared: Arc<Shared>,
    contexts: HashMap<String, JobContext>,
}

impl Monitor {
    pub fn new(
        settings: MonitorSettings,
        store: Arc<dyn JobStore>,
        launcher: Arc<dyn ScriptLauncher>,
        contacts: Arc<ContactBook>,
        events: Arc<dyn EventSource>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                settings,
                store,
                launcher,
                contacts,
                events,
                finalizing: Mutex::new(HashSet::new()),
            }),
            contexts: HashMap::new(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.shared.settings.root
    }

    pub fn context(&self, owner: &str) -> Option<&JobContext> {
        self.contexts.get(owner)
    }

    /// Register the root watch. Only direct children of the root are
    /// relevant; output directories get their own recursive watch.
    pub fn watch_root(&self) -> Result<(), LifecycleError> {
        self.shared.events.watch(self.root(), false)?;
        info!(root = %self.root().display(), "Watching for new jobs");
        Ok(())
    }

    /// Consume events until the channel closes.
    pub async fn run(mut self, mut events: tokio::sync::mpsc::UnboundedReceiver<FsEvent>) {
        while let Some(event) = events.recv().await {
            let transition = self.handle_event(event).await;
            debug!(?transition, "Handled filesystem event");
        }
        info!("Event channel closed, monitor stopping");
    }

    pub async fn handle_event(&mut self, event: FsEvent) -> Transition {
        match event.kind {
            FsEventKind::FileCreated => {
                if self.is_start_marker(&event.path) {
                    self.start_job(&event.path).await
                } else if let Some(owner) = self.results_owner(&event.path) {
                    self.complete_job(owner, &event.path).await
                } else {
                    Transition::Ignored
                }
            }
            FsEventKind::DirCreated => self.attach_output_dir(&event.path),
        }
    }

    fn is_start_marker(&self, path: &Path) -> bool {
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            return false;
        };
        codec::is_marker_name(name)
            && path.parent() == Some(self.root())
            && !codec::is_nested_in_output_dir(self.root(), path)
    }

    /// Owner of `<root>/<owner>_newpipeline/ensemble_wsi/<results file>`.
    fn results_owner(&self, path: &Path) -> Option<String> {
        if path.file_name()?.to_str()? != RESULTS_FILE {
            return None;
        }
        let results_dir = path.parent()?;
        if results_dir.file_name()?.to_str()? != RESULTS_SUBDIR {
            return None;
        }
        let output_dir = results_dir.parent()?;
        if output_dir.parent()? != self.root() {
            return None;
        }
        codec::owner_of_output_dir(output_dir.file_name()?.to_str()?).map(str::to_string)
    }

    async fn start_job(&mut self, marker: &Path) -> Transition {
        let name = marker.file_name().and_then(|n| n.to_str()).unwrap_or_default();
        let decoded = match codec::decode(name) {
            Ok(identity) => identity,
            Err(e) => {
                warn!(path = %marker.display(), error = %e, "Ignoring unparseable marker");
                return Transition::Ignored;
            }
        };

        let identity = self.resolve_ticket(decoded).await;
        let shared = &self.shared;
        if let Err(e) = shared
            .store
            .set_status(&identity.user_id, &identity.job_id, JobStatus::Running)
            .await
        {
            warn!(user_id = %identity.user_id, job_id = %identity.job_id, error = %e, "Failed to mark job running");
        }

        let previous = self.contexts.insert(
            identity.user_id.clone(),
            JobContext {
                identity: identity.clone(),
                output_dir: None,
                started_at: Instant::now(),
            },
        );
        if let Some(previous) = previous {
            warn!(
                user_id = %identity.user_id,
                replaced_job_id = %previous.identity.job_id,
                "Owner already had a job in flight"
            );
        }

        let args = [
            identity.user_id.clone(),
            identity.job_id.clone(),
            identity.file_type.clone(),
            identity.skip_flag.clone(),
        ];
        let task = shared.launcher.launch(&shared.settings.pipeline_script, &args);
        metrics::counter!("pipeline_jobs_started_total").increment(1);
        info!(user_id = %identity.user_id, job_id = %identity.job_id, "Pipeline started");

        let (user_id, job_id) = (identity.user_id.clone(), identity.job_id.clone());
        tokio::spawn(async move {
            match task.wait().await {
                Ok(output) => info!(%user_id, %job_id, exit_code = output.exit_code, "Pipeline script exited"),
                Err(e) => {
                    metrics::counter!("pipeline_jobs_failed_total").increment(1);
                    error!(%user_id, %job_id, error = %e, "Pipeline script failed");
                }
            }
        });

        Transition::Started(identity)
    }

    /// Prefer the ticket recorded at submission over the decoded name.
    async fn resolve_ticket(&self, decoded: JobIdentity) -> JobIdentity {
        match self.shared.store.find_ticket(&decoded.user_id, &decoded.job_id).await {
            Ok(ticket) => ticket.identity(),
            Err(StoreError::NotFound(_)) => {
                warn!(user_id = %decoded.user_id, job_id = %decoded.job_id, "No ticket for marker, using file name");
                decoded
            }
            Err(e) => {
                warn!(user_id = %decoded.user_id, job_id = %decoded.job_id, error = %e, "Ticket lookup failed, using file name");
                decoded
            }
        }
    }

    fn attach_output_dir(&mut self, dir: &Path) -> Transition {
        if dir.parent() != Some(self.root()) {
            return Transition::Ignored;
        }
        let Some(owner) = dir
            .file_name()
            .and_then(|n| n.to_str())
            .and_then(codec::owner_of_output_dir)
            .map(str::to_string)
        else {
            return Transition::Ignored;
        };

        if let Err(e) = self.shared.events.watch(dir, true) {
            error!(user_id = %owner, path = %dir.display(), error = %e, "Failed to watch output directory");
            return Transition::Ignored;
        }

        match self.contexts.get_mut(&owner) {
            Some(context) => context.output_dir = Some(dir.to_path_buf()),
            None => warn!(user_id = %owner, "Output directory without a started job"),
        }
        info!(user_id = %owner, path = %dir.display(), "Pipeline output directory created");

        Transition::Running {
            owner,
            output_dir: dir.to_path_buf(),
        }
    }

    async fn complete_job(&mut self, owner: String, results_path: &Path) -> Transition {
        let shared = Arc::clone(&self.shared);
        {
            let mut finalizing = shared.finalizing.lock().await;
            if !finalizing.insert(owner.clone()) {
                debug!(user_id = %owner, "Finalization already running");
                return Transition::Ignored;
            }
        }

        let identity = match self.contexts.remove(&owner) {
            Some(context) => context.identity,
            None => match recover_identity(self.root(), &owner).await {
                Some(identity) => {
                    info!(user_id = %owner, job_id = %identity.job_id, "Recovered job id from marker file");
                    identity
                }
                None => {
                    shared.finalizing.lock().await.remove(&owner);
                    metrics::counter!("pipeline_jobs_failed_total").increment(1);
                    error!(user_id = %owner, "Results appeared but the job id cannot be determined");
                    return Transition::Ignored;
                }
            },
        };

        let output_dir = results_path
            .parent()
            .and_then(Path::parent)
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.root().join(codec::output_dir_name(&owner)));

        let user_id = identity.user_id.clone();
        let job_id = identity.job_id.clone();
        let results_path = results_path.to_path_buf();
        let task_shared = Arc::clone(&shared);
        let handle = tokio::spawn(async move {
            let started = Instant::now();
            let result = finalize(&task_shared, &identity, &output_dir, &results_path).await;
            task_shared.finalizing.lock().await.remove(&identity.user_id);
            match &result {
                Ok(()) => {
                    metrics::counter!("pipeline_jobs_completed_total").increment(1);
                    metrics::histogram!("pipeline_finalize_seconds").record(started.elapsed().as_secs_f64());
                    info!(user_id = %identity.user_id, job_id = %identity.job_id, "Job completed");
                }
                Err(e) => {
                    metrics::counter!("pipeline_jobs_failed_total").increment(1);
                    error!(user_id = %identity.user_id, job_id = %identity.job_id, error = %e, "Job finalization failed");
                }
            }
            result
        });

        Transition::Completing(Completion {
            user_id,
            job_id,
            handle,
        })
    }
}

/// Find the owner's marker under `root`. With several, the newest wins.
pub fn rederive_identity(root: &Path, owner: &str) -> Option<JobIdentity> {
    let entries = std::fs::read_dir(root).ok()?;
    entries
        .flatten()
        .filter_map(|entry| {
            let name = entry.file_name().to_str()?.to_string();
            let identity = codec::decode(&name).ok()?;
            if identity.user_id != owner {
                return None;
            }
            let modified = entry
                .metadata()
                .and_then(|m| m.modified())
                .unwrap_or(SystemTime::UNIX_EPOCH);
            Some((modified, identity))
        })
        .max_by_key(|(modified, _)| *modified)
        .map(|(_, identity)| identity)
}

/// Run filesystem work on the blocking pool.
async fn blocking<T, F>(work: F) -> Result<T, LifecycleError>
where
    F: FnOnce() -> Result<T, LifecycleError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| LifecycleError::Aborted(e.to_string()))?
}

async fn recover_identity(root: &Path, owner: &str) -> Option<JobIdentity> {
    let (root, owner) = (root.to_path_buf(), owner.to_string());
    match blocking(move || Ok(rederive_identity(&root, &owner))).await {
        Ok(identity) => identity,
        Err(e) => {
            warn!(error = %e, "Marker scan failed");
            None
        }
    }
}

/// Wait until the results file stops growing.
async fn wait_until_settled(path: &Path, interval: Duration) {
    if interval.is_zero() {
        return;
    }
    let mut last = None;
    for _ in 0..SETTLE_ATTEMPTS {
        let size = tokio::fs::metadata(path).await.map(|m| m.len()).ok();
        if size.is_some() && size == last {
            return;
        }
        last = size;
        tokio::time::sleep(interval).await;
    }
    warn!(path = %path.display(), "Results file still changing, reading anyway");
}

fn score_outputs(results_path: &Path, clinical_path: &Path) -> Result<Vec<ScoredImage>, ResultsError> {
    let rows = results::parse_results(File::open(results_path)?)?;
    let clinical = match File::open(clinical_path) {
        Ok(file) => results::parse_clinical(file)?,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            warn!(path = %clinical_path.display(), "Clinical file missing, scores will be empty");
            Default::default()
        }
        Err(e) => return Err(e.into()),
    };
    Ok(results::score_results(&rows, &clinical))
}

async fn finalize(
    shared: &Shared,
    identity: &JobIdentity,
    output_dir: &Path,
    results_path: &Path,
) -> Result<(), LifecycleError> {
    let settings = &shared.settings;
    let root = settings.root.as_path();
    let user_id = identity.user_id.as_str();
    let job_id = identity.job_id.as_str();

    wait_until_settled(results_path, settings.settle_interval).await;

    let clinical_path = root.join(codec::clinical_file_name(user_id, job_id));
    let results = results_path.to_path_buf();
    let rows = blocking(move || Ok(score_outputs(&results, &clinical_path)?)).await?;
    info!(user_id, job_id, samples = rows.len(), "Scored pipeline results");

    let updates: Vec<_> = rows.iter().map(ScoredImage::to_update).collect();
    let outcomes = shared.store.update_images(user_id, job_id, &updates).await?;
    for failed in outcomes.iter().filter(|o| !o.is_success()) {
        warn!(user_id, job_id, file = %failed.file_id, error = ?failed.error, "Image update failed");
    }

    let report_path = {
        let (dir, user, job, url) = (
            output_dir.to_path_buf(),
            user_id.to_string(),
            job_id.to_string(),
            settings.app_url.clone(),
        );
        blocking(move || Ok(report::write_report(&dir, &user, &job, &rows, &url)?)).await?
    };
    info!(user_id, job_id, path = %report_path.display(), "Report written");

    let contact = match shared.contacts.lookup(user_id).await {
        Ok(contact) => contact.unwrap_or_default(),
        Err(e) => {
            warn!(user_id, error = %e, "Contact lookup failed");
            String::new()
        }
    };

    let args = [user_id.to_string(), contact, job_id.to_string()];
    let output = shared
        .launcher
        .launch(&settings.finalize_script, &args)
        .wait()
        .await?;
    info!(user_id, job_id, exit_code = output.exit_code, "Finalize script exited");

    let (sweep_root, owner) = (root.to_path_buf(), user_id.to_string());
    blocking(move || Ok(sweeper::sweep_job(&sweep_root, &owner)?)).await?;

    if let Err(e) = shared.events.unwatch(output_dir) {
        warn!(user_id, path = %output_dir.display(), error = %e, "Failed to detach output watch");
    }

    let (relocate_root, dir, owner, job) = (
        root.to_path_buf(),
        output_dir.to_path_buf(),
        user_id.to_string(),
        job_id.to_string(),
    );
    blocking(move || relocate(&relocate_root, &dir, &owner, &job)).await?;

    shared.store.set_status(user_id, job_id, JobStatus::Completed).await?;
    Ok(())
}

/// Move `<root>/<owner>_newpipeline` to `<root>/<owner>/<job_id>`.
fn relocate(root: &Path, output_dir: &Path, owner: &str, job_id: &str) -> Result<(), LifecycleError> {
    if !output_dir.exists() {
        warn!(user_id = owner, job_id, path = %output_dir.display(), "Nothing left to relocate");
        return Ok(());
    }
    let owner_dir = root.join(owner);
    let target = owner_dir.join(job_id);
    let relocation_error = |source| LifecycleError::Relocate {
        from: output_dir.to_path_buf(),
        to: target.clone(),
        source,
    };
    std::fs::create_dir_all(&owner_dir).map_err(relocation_error)?;
    std::fs::rename(output_dir, &target).map_err(relocation_error)?;
    info!(user_id = owner, job_id, path = %target.display(), "Relocated pipeline output");
    Ok(())
}
