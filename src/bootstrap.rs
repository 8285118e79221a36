//! Start-up wiring shared by the API server and the standalone watcher.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing_subscriber::EnvFilter;

use crate::config::AppConfig;
use crate::db::{self, PgJobStore};
use crate::services::contacts::ContactBook;
use crate::services::encryption::{EncryptionError, EncryptionService};
use crate::services::lifecycle::{LifecycleError, Monitor, MonitorSettings};
use crate::services::process::{ScriptLauncher, ShellLauncher};
use crate::services::store::{JobStore, MemoryJobStore};
use crate::services::watcher::NotifyEventSource;

/// JSON logs, filtered by `RUST_LOG` (default `info`).
pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();
}

pub fn describe_metrics() {
    metrics::describe_counter!(
        "pipeline_jobs_started_total",
        "Pipeline runs launched from marker files"
    );
    metrics::describe_counter!(
        "pipeline_jobs_completed_total",
        "Jobs finalized and relocated"
    );
    metrics::describe_counter!(
        "pipeline_jobs_failed_total",
        "Pipeline or finalization failures"
    );
    metrics::describe_counter!(
        "pipeline_jobs_cancelled_total",
        "Jobs cancelled through the API"
    );
    metrics::describe_histogram!(
        "pipeline_finalize_seconds",
        "Time from results file creation to job completion"
    );
}

/// PostgreSQL when `DATABASE_URL` is set, otherwise an in-process store.
pub async fn open_store(config: &AppConfig) -> Result<Arc<dyn JobStore>, sqlx::Error> {
    match &config.database_url {
        Some(url) => {
            tracing::info!("Connecting to PostgreSQL database");
            let pool = db::init_pool(url).await?;
            tracing::info!("Running database migrations");
            db::run_migrations(&pool).await?;
            Ok(Arc::new(PgJobStore::new(pool)))
        }
        None => {
            tracing::warn!("DATABASE_URL not set, jobs are kept in memory");
            Ok(Arc::new(MemoryJobStore::new()))
        }
    }
}

pub fn contact_book(config: &AppConfig) -> Result<ContactBook, EncryptionError> {
    let crypto = EncryptionService::new(&config.encryption_key)?;
    Ok(ContactBook::new(config.contacts_path(), Arc::new(crypto)))
}

pub fn launcher(config: &AppConfig) -> Arc<dyn ScriptLauncher> {
    Arc::new(ShellLauncher::new(&config.script_shell))
}

/// How the lifecycle monitor task ended.
#[derive(Debug, PartialEq, Eq)]
pub enum MonitorExit {
    /// Event channel closed.
    Stopped,
    Panicked(String),
    Cancelled,
}

/// Wait for the monitor task and log its end. The monitor is meant to run
/// for the life of the process, so every exit is an error.
pub async fn supervise_monitor(handle: JoinHandle<()>) -> MonitorExit {
    let exit = match handle.await {
        Ok(()) => MonitorExit::Stopped,
        Err(e) if e.is_panic() => MonitorExit::Panicked(e.to_string()),
        Err(_) => MonitorExit::Cancelled,
    };
    tracing::error!(?exit, "Lifecycle monitor stopped, new jobs will not be picked up");
    exit
}

/// Watch the configured root and run the lifecycle monitor on its own task.
pub fn start_monitor(
    config: &AppConfig,
    store: Arc<dyn JobStore>,
    launcher: Arc<dyn ScriptLauncher>,
    contacts: Arc<ContactBook>,
) -> Result<JoinHandle<()>, LifecycleError> {
    let (events, receiver) = NotifyEventSource::new(config.poll_interval())?;
    let monitor = Monitor::new(
        MonitorSettings {
            root: config.watch_root.clone(),
            pipeline_script: config.pipeline_script.clone(),
            finalize_script: config.finalize_script.clone(),
            app_url: config.app_url.clone(),
            settle_interval: config.settle_interval(),
        },
        store,
        launcher,
        contacts,
        Arc::new(events),
    );
    monitor.watch_root()?;
    Ok(tokio::spawn(monitor.run(receiver)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_supervise_reports_stopped_monitor() {
        let handle = tokio::spawn(async {});
        assert_eq!(supervise_monitor(handle).await, MonitorExit::Stopped);
    }

    #[tokio::test]
    async fn test_supervise_reports_panicked_monitor() {
        let handle = tokio::spawn(async { panic!("watch backend gone") });
        assert!(matches!(
            supervise_monitor(handle).await,
            MonitorExit::Panicked(_)
        ));
    }

    #[tokio::test]
    async fn test_supervise_reports_cancelled_monitor() {
        let handle = tokio::spawn(std::future::pending::<()>());
        handle.abort();
        assert_eq!(supervise_monitor(handle).await, MonitorExit::Cancelled);
    }
}
