//! End-to-end tests against a running deployment
//!
//! These tests require:
//! 1. API server running (with the embedded watcher or a separate watcher)
//! 2. The pipeline scripts installed next to the server
//! 3. A watch root shared with the pipeline
//!
//! Run with: cargo test --test e2e_test -- --ignored --nocapture
//!
//! Set API_BASE_URL to override default (http://localhost:3001)

mod fixtures;
mod helpers;

use fixtures::*;
use helpers::*;
use uuid::Uuid;

/// Get base URL from env or default to localhost
fn get_base_url() -> String {
    std::env::var("API_BASE_URL").unwrap_or_else(|_| "http://localhost:3001".to_string())
}

fn unique_user() -> String {
    format!("e2e{}", Uuid::new_v4().simple())
}

#[tokio::test]
#[ignore] // Requires running API server and pipeline
async fn test_e2e_health_check() {
    let base_url = get_base_url();
    let client = reqwest::Client::new();

    let response = client
        .get(format!("{}/health", base_url))
        .send()
        .await
        .expect("Health check failed");

    assert!(
        response.status().is_success(),
        "Health check returned non-success status: {}",
        response.status()
    );

    println!("✓ Health check passed");
}

#[tokio::test]
#[ignore] // Requires running API server and pipeline
async fn test_e2e_job_completes_with_report() {
    let base_url = get_base_url();
    let client = reqwest::Client::new();
    let user_id = unique_user();

    client
        .post(format!("{}/api/v1/contacts", base_url))
        .json(&serde_json::json!({ "user_id": user_id, "email": "e2e@example.org" }))
        .send()
        .await
        .expect("Contact request failed");

    let response = client
        .post(format!("{}/api/v1/jobs", base_url))
        .json(&submit_request(&user_id, "e2e_job", true))
        .send()
        .await
        .expect("Submit failed");
    assert!(response.status().is_success(), "Submit returned {}", response.status());
    let submitted = response.json::<SubmitResponse>().await.unwrap();
    println!("Submitted {} ({})", submitted.job_id, submitted.message);

    wait_for_job_completion(&client, &base_url, &user_id, "e2e_job", 1800)
        .await
        .expect("Job did not complete");

    let images: Vec<serde_json::Value> = client
        .get(format!("{}/api/v1/users/{}/jobs/e2e_job/images", base_url, user_id))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    for sample in SAMPLES {
        let image = images
            .iter()
            .find(|i| i["file"] == sample.stem())
            .unwrap_or_else(|| panic!("{} missing", sample.stem()));
        assert!(!image["base_size"].is_null(), "{} was not measured", sample.description);
    }

    let report = client
        .get(format!("{}/api/v1/users/{}/jobs/e2e_job/report", base_url, user_id))
        .send()
        .await
        .unwrap();
    assert!(report.status().is_success());
    let html = report.text().await.unwrap();
    assert!(html.contains(SAMPLES[0].stem()));

    println!("✓ Job completed and report available");
}

#[tokio::test]
#[ignore] // Requires running API server and pipeline
async fn test_e2e_cancel_removes_job() {
    let base_url = get_base_url();
    let client = reqwest::Client::new();
    let user_id = unique_user();

    client
        .post(format!("{}/api/v1/jobs", base_url))
        .json(&submit_request(&user_id, "to_cancel", true))
        .send()
        .await
        .expect("Submit failed");

    let response = client
        .delete(format!("{}/api/v1/users/{}/jobs/to_cancel", base_url, user_id))
        .send()
        .await
        .unwrap();
    assert!(response.status().is_success());

    let response = client
        .get(format!("{}/api/v1/users/{}/jobs/to_cancel/images", base_url, user_id))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::NOT_FOUND);

    println!("✓ Cancelled job is gone");
}
