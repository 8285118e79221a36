use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Deserialize)]
pub struct AppConfig {
    /// Server bind address (e.g., "0.0.0.0:3001"). Unused by the watcher.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// PostgreSQL connection string. Without it jobs are kept in memory.
    #[serde(default)]
    pub database_url: Option<String>,

    /// Directory shared with the pipeline: markers, clinical files and
    /// pipeline output all live here.
    pub watch_root: PathBuf,

    /// Starts the pipeline: `<script> <user_id> <job_id> <file_type> <skip_flag>`
    #[serde(default = "default_pipeline_script")]
    pub pipeline_script: PathBuf,

    /// Archives and notifies: `<script> <user_id> <contact> <job_id>`
    #[serde(default = "default_finalize_script")]
    pub finalize_script: PathBuf,

    /// Stops a user's pipeline: `<script> <user_id>`
    #[serde(default = "default_cancel_script")]
    pub cancel_script: PathBuf,

    #[serde(default = "default_script_shell")]
    pub script_shell: String,

    /// Notification contacts file. Defaults to `email_data` in the watch root.
    #[serde(default)]
    pub contacts_file: Option<PathBuf>,

    /// AES-256-GCM encryption key (base64-encoded, 32 bytes)
    pub encryption_key: String,

    /// Web application link placed in reports
    #[serde(default = "default_app_url")]
    pub app_url: String,

    /// Poll the watch root at this interval instead of native events.
    #[serde(default)]
    pub watch_poll_ms: Option<u64>,

    /// Interval between size checks of a freshly created results file.
    #[serde(default = "default_settle_ms")]
    pub settle_ms: u64,

    /// Run the lifecycle monitor inside the API process. Required for the
    /// in-memory store; turn off when a separate watcher process runs.
    #[serde(default = "default_embedded_watcher")]
    pub embedded_watcher: bool,

    /// Prometheus listener of the standalone watcher (e.g., "0.0.0.0:9101").
    #[serde(default)]
    pub metrics_addr: Option<String>,
}

fn default_bind_addr() -> String {
    "0.0.0.0:3001".to_string()
}

fn default_pipeline_script() -> PathBuf {
    PathBuf::from("./bashDocker.sh")
}

fn default_finalize_script() -> PathBuf {
    PathBuf::from("./bashZip.sh")
}

fn default_cancel_script() -> PathBuf {
    PathBuf::from("./bashCancel.sh")
}

fn default_script_shell() -> String {
    "bash".to_string()
}

fn default_app_url() -> String {
    "http://localhost:3000/".to_string()
}

fn default_settle_ms() -> u64 {
    1000
}

fn default_embedded_watcher() -> bool {
    true
}

impl AppConfig {
    pub fn from_env() -> Result<Self, envy::Error> {
        dotenvy::dotenv().ok();
        envy::from_env()
    }

    pub fn contacts_path(&self) -> PathBuf {
        self.contacts_file
            .clone()
            .unwrap_or_else(|| self.watch_root.join("email_data"))
    }

    pub fn poll_interval(&self) -> Option<Duration> {
        self.watch_poll_ms.map(Duration::from_millis)
    }

    pub fn settle_interval(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }
}
