//! Filesystem naming conventions shared by the intake API and the watcher.
//!
//! A job is announced by a marker file directly under the watch root:
//!
//! ```text
//! <user_id>_<job_id>_<file_type>_<skip_flag>_newtest.txt
//! ```
//!
//! Decoding splits from the right, so a job id may itself contain `_`.
//! A user id containing `_` is not supported: the first delimiter always
//! ends the user id, which shifts the decoded boundaries.

use std::path::Path;

use serde::{Deserialize, Serialize};

pub const DELIMITER: char = '_';

/// Suffix of the job-start marker file.
pub const MARKER_SUFFIX: &str = "_newtest.txt";

/// Suffix of the per-owner pipeline output directory.
pub const OUTPUT_DIR_SUFFIX: &str = "_newpipeline";

/// Results subdirectory inside the output directory.
pub const RESULTS_SUBDIR: &str = "ensemble_wsi";

/// File whose creation inside [`RESULTS_SUBDIR`] marks pipeline completion.
pub const RESULTS_FILE: &str = "ensembled_group_features_per_sample.csv";

const CLINICAL_SUFFIX: &str = "_clinical.txt";
const REPORT_SUFFIX: &str = "_report.html";

/// Job identity as carried by a marker file name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobIdentity {
    pub user_id: String,
    pub job_id: String,
    pub file_type: String,
    pub skip_flag: String,
}

/// Encode a marker file name.
pub fn encode(user_id: &str, job_id: &str, file_type: &str, skip_flag: &str) -> String {
    format!(
        "{user_id}{d}{job_id}{d}{file_type}{d}{skip_flag}{MARKER_SUFFIX}",
        d = DELIMITER
    )
}

/// Decode a marker file name (bare name, not a path).
pub fn decode(name: &str) -> Result<JobIdentity, CodecError> {
    let stem = name
        .strip_suffix(MARKER_SUFFIX)
        .ok_or_else(|| CodecError::Malformed(name.to_string()))?;

    let mut from_right = stem.rsplitn(3, DELIMITER);
    let skip_flag = from_right.next();
    let file_type = from_right.next();
    let head = from_right.next();

    let (Some(skip_flag), Some(file_type), Some(head)) = (skip_flag, file_type, head) else {
        return Err(CodecError::Malformed(name.to_string()));
    };

    let (user_id, job_id) = head
        .split_once(DELIMITER)
        .ok_or_else(|| CodecError::Malformed(name.to_string()))?;

    if [user_id, job_id, file_type, skip_flag]
        .iter()
        .any(|part| part.is_empty())
    {
        return Err(CodecError::Malformed(name.to_string()));
    }

    Ok(JobIdentity {
        user_id: user_id.to_string(),
        job_id: job_id.to_string(),
        file_type: file_type.to_string(),
        skip_flag: skip_flag.to_string(),
    })
}

impl JobIdentity {
    pub fn marker_name(&self) -> String {
        encode(&self.user_id, &self.job_id, &self.file_type, &self.skip_flag)
    }
}

pub fn is_marker_name(name: &str) -> bool {
    name.ends_with(MARKER_SUFFIX)
}

/// Pipeline output directory name for an owner.
pub fn output_dir_name(owner: &str) -> String {
    format!("{owner}{OUTPUT_DIR_SUFFIX}")
}

/// Owner segment of a `_newpipeline` directory name. Only the first
/// delimited segment survives in the directory name; the job id has to be
/// recovered from elsewhere.
pub fn owner_of_output_dir(name: &str) -> Option<&str> {
    let stem = name.strip_suffix(OUTPUT_DIR_SUFFIX)?;
    let owner = stem.split(DELIMITER).next()?;
    (!owner.is_empty()).then_some(owner)
}

/// True when any ancestor component of `path` (below `root`) is a pipeline
/// output directory. The pipeline copies its input marker into its own
/// output tree and those copies must never start a job.
pub fn is_nested_in_output_dir(root: &Path, path: &Path) -> bool {
    let relative = path.strip_prefix(root).unwrap_or(path);
    relative
        .parent()
        .map(|parent| {
            parent.components().any(|c| {
                c.as_os_str()
                    .to_str()
                    .is_some_and(|s| s.contains(OUTPUT_DIR_SUFFIX))
            })
        })
        .unwrap_or(false)
}

pub fn clinical_file_name(user_id: &str, job_id: &str) -> String {
    format!("{user_id}{DELIMITER}{job_id}{CLINICAL_SUFFIX}")
}

pub fn report_file_name(user_id: &str, job_id: &str) -> String {
    format!("{user_id}{DELIMITER}{job_id}{REPORT_SUFFIX}")
}

/// Root-level transient files owned by `user_id` (markers and clinical inputs).
/// The owner segment must match exactly: `u1` does not own `u10_...`.
pub fn is_transient_root_file(name: &str, user_id: &str) -> bool {
    let owned = name
        .strip_prefix(user_id)
        .is_some_and(|rest| rest.starts_with(DELIMITER));
    owned && (name.ends_with(MARKER_SUFFIX) || name.ends_with(CLINICAL_SUFFIX))
}

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("Malformed marker file name: {0}")]
    Malformed(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_round_trip() {
        let name = encode("UYtOhH78", "retest3", "svs", "n");
        assert_eq!(name, "UYtOhH78_retest3_svs_n_newtest.txt");
        let id = decode(&name).unwrap();
        assert_eq!(id.user_id, "UYtOhH78");
        assert_eq!(id.job_id, "retest3");
        assert_eq!(id.file_type, "svs");
        assert_eq!(id.skip_flag, "n");
        assert_eq!(id.marker_name(), name);
    }

    #[test]
    fn test_round_trip_varied_identifiers() {
        let long_user = "A".repeat(128);
        let long_job = "job-".repeat(30);
        let cases = [
            ("u1", "j1", "svs", "n"),
            ("0042", "2024", "tif", "y"),
            ("MiXeDcAsE", "ReTest", "SVS", "N"),
            ("user-7", "batch-01.v2", "ndpi", "y"),
            ("a.b", "x.y-z", "tiff", "n"),
            ("k9", "run_2024_03_01", "svs", "n"),
            (long_user.as_str(), long_job.as_str(), "svs", "y"),
        ];
        for (user_id, job_id, file_type, skip_flag) in cases {
            let name = encode(user_id, job_id, file_type, skip_flag);
            let id = decode(&name).unwrap_or_else(|e| panic!("{name}: {e}"));
            assert_eq!(
                (id.user_id.as_str(), id.job_id.as_str(), id.file_type.as_str(), id.skip_flag.as_str()),
                (user_id, job_id, file_type, skip_flag),
                "{name}"
            );
            assert_eq!(id.marker_name(), name);
        }
    }

    #[test]
    fn test_job_id_with_delimiter_survives() {
        let id = decode("user1_batch_2024_01_tif_y_newtest.txt").unwrap();
        assert_eq!(id.user_id, "user1");
        assert_eq!(id.job_id, "batch_2024_01");
        assert_eq!(id.file_type, "tif");
        assert_eq!(id.skip_flag, "y");
    }

    #[test]
    fn test_user_id_with_delimiter_shifts_boundaries() {
        // Documented limitation: the first delimiter always ends the user id.
        let name = encode("ab_cd", "job", "svs", "n");
        let id = decode(&name).unwrap();
        assert_eq!(id.user_id, "ab");
        assert_eq!(id.job_id, "cd_job");
    }

    #[test]
    fn test_rejects_malformed_names() {
        assert!(decode("user_job_svs_n.txt").is_err());
        assert!(decode("user_svs_n_newtest.txt").is_err());
        assert!(decode("_job_svs_n_newtest.txt").is_err());
        assert!(decode("_newtest.txt").is_err());
    }

    #[test]
    fn test_output_dir_owner() {
        assert_eq!(output_dir_name("u1"), "u1_newpipeline");
        assert_eq!(owner_of_output_dir("u1_newpipeline"), Some("u1"));
        assert_eq!(owner_of_output_dir("u1_extra_newpipeline"), Some("u1"));
        assert_eq!(owner_of_output_dir("u1_results"), None);
        assert_eq!(owner_of_output_dir("_newpipeline"), None);
    }

    #[test]
    fn test_nested_marker_detection() {
        let root = PathBuf::from("/data/root");
        let top = root.join("u1_j1_svs_n_newtest.txt");
        let nested = root.join("u1_newpipeline").join("input").join("u1_j1_svs_n_newtest.txt");
        assert!(!is_nested_in_output_dir(&root, &top));
        assert!(is_nested_in_output_dir(&root, &nested));
    }

    #[test]
    fn test_transient_root_files() {
        assert!(is_transient_root_file("u1_j1_svs_n_newtest.txt", "u1"));
        assert!(is_transient_root_file("u1_j1_clinical.txt", "u1"));
        assert!(!is_transient_root_file("u1_j1_report.html", "u1"));
        assert!(!is_transient_root_file("u2_j1_clinical.txt", "u1"));
    }

    #[test]
    fn test_transient_owner_is_not_a_prefix_match() {
        assert!(!is_transient_root_file("u10_jobB_svs_n_newtest.txt", "u1"));
        assert!(!is_transient_root_file("u10_jobB_clinical.txt", "u1"));
        assert!(!is_transient_root_file("u1x_clinical.txt", "u1"));
        assert!(is_transient_root_file("u10_jobB_clinical.txt", "u10"));
    }
}
