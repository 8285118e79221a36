mod fixtures;

use fixtures::*;
use kidneytx::{
    config::AppConfig,
    db::{self, PgJobStore},
    models::job::{JobStatus, JobTicket},
    services::store::{JobStore, StoreError},
};
use serde_json::{json, Map, Value};
use uuid::Uuid;

/// Integration test: job store against PostgreSQL
///
/// This test verifies:
/// 1. Database connection and schema
/// 2. Job and image creation with donor/recipient records
/// 3. Merge updates keyed by file name
/// 4. Ongoing job detection
/// 5. Cascade delete
///
/// Note: This requires a running PostgreSQL instance configured via
/// DATABASE_URL (plus WATCH_ROOT and ENCRYPTION_KEY for the config).
#[tokio::test]
#[ignore] // Run with: cargo test --test integration_test -- --ignored
async fn test_full_store_integration() {
    let config = AppConfig::from_env().expect("Failed to load config");
    let database_url = config.database_url.expect("DATABASE_URL must be set");

    let pool = db::init_pool(&database_url)
        .await
        .expect("Failed to connect to database");
    db::run_migrations(&pool)
        .await
        .expect("Failed to run migrations");
    let store = PgJobStore::new(pool);
    store.ping().await.expect("Ping failed");

    let user_id = format!("it-{}", Uuid::new_v4().simple());
    let ticket = JobTicket::new(&user_id, "job_1", "svs", "n");
    let entries: Vec<_> = SAMPLES.iter().map(SampleFixture::entry).collect();

    // 1. Create
    let outcomes = store
        .create_job(&ticket, &entries)
        .await
        .expect("Failed to create job");
    assert!(outcomes.iter().all(|o| o.is_success()));

    let stored = store.find_ticket(&user_id, "job_1").await.unwrap();
    assert_eq!(stored.status, JobStatus::Created);
    assert_eq!(stored.file_type, "svs");

    // 2. Duplicate is rejected
    assert!(matches!(
        store.create_job(&ticket, &entries).await,
        Err(StoreError::InvalidInput(_))
    ));

    // 3. Listing keeps submission order
    let jobs = store.list_jobs(&user_id).await.unwrap();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].file_ids, vec!["biopsy_a".to_string(), "biopsy_b".to_string()]);
    assert_eq!(
        store.ongoing_job(&user_id).await.unwrap().as_deref(),
        Some("job_1")
    );

    // 4. Merge updates
    let updates: Vec<Map<String, Value>> = SAMPLES
        .iter()
        .map(|s| {
            json!({ "file": s.stem(), "base_size": 900.0, "kdqs": 7.0 })
                .as_object()
                .cloned()
                .unwrap()
        })
        .chain(std::iter::once(
            json!({ "file": "missing", "base_size": 1.0 }).as_object().cloned().unwrap(),
        ))
        .collect();
    let outcomes = store.update_images(&user_id, "job_1", &updates).await.unwrap();
    assert_eq!(outcomes.iter().filter(|o| o.is_success()).count(), SAMPLES.len());
    assert!(!outcomes.last().unwrap().is_success());

    let images = store.job_images(&user_id, "job_1").await.unwrap();
    assert!(images.iter().all(|i| !i.is_pending()));
    assert_eq!(images[0].doc["kdqs"], json!(7.0));
    assert!(store.ongoing_job(&user_id).await.unwrap().is_none());

    // 5. Status
    store
        .set_status(&user_id, "job_1", JobStatus::Completed)
        .await
        .unwrap();
    assert_eq!(
        store.find_ticket(&user_id, "job_1").await.unwrap().status,
        JobStatus::Completed
    );

    // 6. Cascade delete
    let donor = images[0].donor_id().expect("image references donor");
    store.delete_job(&user_id, "job_1").await.unwrap();
    assert!(matches!(
        store.job_images(&user_id, "job_1").await,
        Err(StoreError::NotFound(_))
    ));
    let remaining: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM donors WHERE id = $1")
        .bind(donor)
        .fetch_one(store.pool())
        .await
        .unwrap();
    assert_eq!(remaining, 0);
    assert!(matches!(
        store.delete_job(&user_id, "job_1").await,
        Err(StoreError::NotFound(_))
    ));
}
