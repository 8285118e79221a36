//! Post-job cleanup of pipeline output and root-level input files.
//!
//! Only images, archives, reports and the aggregate results CSV survive a
//! sweep. Everything that is already gone is treated as swept.

use std::fs;
use std::io::ErrorKind;
use std::path::Path;

use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::services::codec::{self, RESULTS_FILE};

const RETAINED_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "zip", "html", "pdf"];

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub files_removed: usize,
    pub dirs_removed: usize,
    pub inputs_removed: usize,
}

/// Whether a pipeline output file is kept by the sweep.
pub fn is_retained(path: &Path) -> bool {
    if path.file_name().and_then(|n| n.to_str()) == Some(RESULTS_FILE) {
        return true;
    }
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .is_some_and(|e| RETAINED_EXTENSIONS.contains(&e.as_str()))
}

fn remove_file(path: &Path) -> bool {
    match fs::remove_file(path) {
        Ok(()) => {
            debug!(path = %path.display(), "Deleted file");
            true
        }
        Err(e) if e.kind() == ErrorKind::NotFound => false,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Failed to delete file");
            false
        }
    }
}

fn remove_dir_if_empty(path: &Path) -> bool {
    let is_empty = match fs::read_dir(path) {
        Ok(mut entries) => entries.next().is_none(),
        Err(_) => return false,
    };
    if !is_empty {
        return false;
    }
    match fs::remove_dir(path) {
        Ok(()) => {
            debug!(path = %path.display(), "Deleted empty directory");
            true
        }
        Err(e) if e.kind() == ErrorKind::NotFound => false,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Failed to delete directory");
            false
        }
    }
}

/// Delete non-retained files below `dir`, then every directory left empty,
/// `dir` itself included.
pub fn sweep_output_dir(dir: &Path) -> SweepReport {
    let mut report = SweepReport::default();
    if !dir.is_dir() {
        return report;
    }

    for entry in WalkDir::new(dir).follow_links(false).contents_first(true) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                debug!(error = %e, "Skipping entry during sweep");
                continue;
            }
        };
        let path = entry.path();
        if entry.file_type().is_dir() {
            if remove_dir_if_empty(path) {
                report.dirs_removed += 1;
            }
        } else if !is_retained(path) && remove_file(path) {
            report.files_removed += 1;
        }
    }
    report
}

/// Delete `user_id`'s marker and clinical files directly under `root`.
pub fn sweep_root_inputs(root: &Path, user_id: &str) -> Result<usize, SweepError> {
    let entries = match fs::read_dir(root) {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(SweepError::Io(e)),
    };

    let mut removed = 0;
    for entry in entries.flatten() {
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if codec::is_transient_root_file(name, user_id) && remove_file(&entry.path()) {
            removed += 1;
        }
    }
    Ok(removed)
}

/// Full sweep for one owner: its pipeline output directory and its inputs.
pub fn sweep_job(root: &Path, user_id: &str) -> Result<SweepReport, SweepError> {
    let mut report = sweep_output_dir(&root.join(codec::output_dir_name(user_id)));
    report.inputs_removed = sweep_root_inputs(root, user_id)?;
    info!(
        user_id,
        files_removed = report.files_removed,
        dirs_removed = report.dirs_removed,
        inputs_removed = report.inputs_removed,
        "Sweep complete"
    );
    Ok(report)
}

#[derive(Debug, thiserror::Error)]
pub enum SweepError {
    #[error("I/O error during sweep: {0}")]
    Io(#[from] std::io::Error),
}
