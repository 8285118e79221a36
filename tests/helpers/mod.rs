//! Test helper utilities shared by the integration and E2E suites
#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use base64::Engine;
use serde::Deserialize;
use tokio::time::sleep;

use kidneytx::services::contacts::ContactBook;
use kidneytx::services::encryption::EncryptionService;
use kidneytx::services::process::{ScriptLauncher, ScriptOutput, ScriptTask};

/// Records every script invocation and reports success without running it.
#[derive(Default)]
pub struct StubLauncher {
    calls: Mutex<Vec<(PathBuf, Vec<String>)>>,
}

impl StubLauncher {
    pub fn calls(&self) -> Vec<(PathBuf, Vec<String>)> {
        self.calls.lock().unwrap().clone()
    }

    /// Arguments of every call to `script`.
    pub fn calls_to(&self, script: &str) -> Vec<Vec<String>> {
        self.calls()
            .into_iter()
            .filter(|(path, _)| path == Path::new(script))
            .map(|(_, args)| args)
            .collect()
    }
}

impl ScriptLauncher for StubLauncher {
    fn launch(&self, script: &Path, args: &[String]) -> ScriptTask {
        self.calls
            .lock()
            .unwrap()
            .push((script.to_path_buf(), args.to_vec()));
        ScriptTask::finished(
            script.display().to_string(),
            Ok(ScriptOutput {
                exit_code: 0,
                stderr: String::new(),
                duration_ms: 1,
            }),
        )
    }
}

pub fn test_key() -> String {
    base64::engine::general_purpose::STANDARD.encode([11u8; 32])
}

pub fn contact_book(root: &Path) -> Arc<ContactBook> {
    let crypto = EncryptionService::new(&test_key()).expect("valid test key");
    Arc::new(ContactBook::new(root.join("email_data"), Arc::new(crypto)))
}

/// Response from GET /api/v1/users/{user_id}/ongoing
#[derive(Debug, Deserialize)]
pub struct OngoingResponse {
    pub job_id: Option<String>,
    pub message: String,
}

/// Response from POST /api/v1/jobs
#[derive(Debug, Deserialize)]
pub struct SubmitResponse {
    pub job_id: String,
    pub status: String,
    pub message: String,
    pub results: Vec<serde_json::Value>,
}

/// Poll the ongoing endpoint until the job is no longer pending (with timeout)
pub async fn wait_for_job_completion(
    client: &reqwest::Client,
    base_url: &str,
    user_id: &str,
    job_id: &str,
    timeout_secs: u64,
) -> Result<(), Box<dyn std::error::Error>> {
    let max_attempts = timeout_secs * 2; // Poll every 500ms

    for attempt in 0..max_attempts {
        let response = client
            .get(format!("{}/api/v1/users/{}/ongoing", base_url, user_id))
            .send()
            .await?;

        if !response.status().is_success() {
            let error_text = response.text().await?;
            return Err(format!("Ongoing check failed: {}", error_text).into());
        }

        let ongoing = response.json::<OngoingResponse>().await?;
        if ongoing.job_id.as_deref() != Some(job_id) {
            return Ok(());
        }
        if attempt % 20 == 0 && attempt > 0 {
            println!("  ... still waiting (attempt {}/{})", attempt, max_attempts);
        }
        sleep(Duration::from_millis(500)).await;
    }

    Err(format!("Job did not complete within {} seconds", timeout_secs).into())
}
