use std::collections::HashMap;

use serde_json::{Map, Value};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::models::image::{ImageRecord, NewImageEntry};
use crate::models::job::{EntryOutcome, JobStatus, JobSummary, JobTicket};
use crate::services::store::{merge_image_fields, update_file_key, StoreError};

fn status_from_db(raw: &str) -> JobStatus {
    raw.parse().unwrap_or_else(|_| {
        warn!(status = raw, "Unknown job status in database");
        JobStatus::Created
    })
}

fn ticket_from_row(row: &PgRow) -> Result<JobTicket, sqlx::Error> {
    let status: String = row.try_get("status")?;
    Ok(JobTicket {
        user_id: row.try_get("user_id")?,
        job_id: row.try_get("job_id")?,
        file_type: row.try_get("file_type")?,
        skip_flag: row.try_get("skip_flag")?,
        status: status_from_db(&status),
        created_at: row.try_get("created_at")?,
    })
}

fn image_from_row(row: &PgRow) -> Result<ImageRecord, sqlx::Error> {
    let doc = match row.try_get::<Value, _>("doc")? {
        Value::Object(doc) => doc,
        other => {
            warn!(doc = %other, "Image document is not an object");
            Map::new()
        }
    };
    Ok(ImageRecord {
        id: row.try_get("id")?,
        doc,
    })
}

fn is_unique_violation(e: &sqlx::Error) -> bool {
    matches!(e, sqlx::Error::Database(db) if db.is_unique_violation())
}

/// Connectivity check
pub async fn ping(pool: &PgPool) -> Result<(), sqlx::Error> {
    sqlx::query("SELECT 1").execute(pool).await?;
    Ok(())
}

/// Insert the ticket, creating the user on first submission
pub async fn insert_ticket(pool: &PgPool, ticket: &JobTicket) -> Result<(), StoreError> {
    let mut tx = pool.begin().await?;

    sqlx::query("INSERT INTO users (fb_id) VALUES ($1) ON CONFLICT (fb_id) DO NOTHING")
        .bind(&ticket.user_id)
        .execute(&mut *tx)
        .await?;

    let inserted = sqlx::query(
        r#"
        INSERT INTO jobs (user_id, job_id, file_type, skip_flag, status, created_at)
        VALUES ($1, $2, $3, $4, $5, $6)
        "#,
    )
    .bind(&ticket.user_id)
    .bind(&ticket.job_id)
    .bind(&ticket.file_type)
    .bind(&ticket.skip_flag)
    .bind(ticket.status.to_string())
    .bind(ticket.created_at)
    .execute(&mut *tx)
    .await;

    match inserted {
        Ok(_) => {}
        Err(e) if is_unique_violation(&e) => {
            return Err(StoreError::InvalidInput(format!(
                "job {} already exists for user {}",
                ticket.job_id, ticket.user_id
            )));
        }
        Err(e) => return Err(e.into()),
    }

    tx.commit().await?;
    Ok(())
}

/// Insert one image with its recipient and donor records in one transaction
pub async fn insert_image(
    pool: &PgPool,
    user_id: &str,
    job_id: &str,
    entry: &NewImageEntry,
) -> Result<Uuid, sqlx::Error> {
    let recipient = Uuid::new_v4();
    let donor = Uuid::new_v4();
    let image = Uuid::new_v4();

    let mut tx = pool.begin().await?;

    sqlx::query("INSERT INTO recipients (id, recipient_age, induction_type) VALUES ($1, $2, $3)")
        .bind(recipient)
        .bind(entry.age)
        .bind(&entry.induction)
        .execute(&mut *tx)
        .await?;

    sqlx::query(
        "INSERT INTO donors (id, cold_ischemia, pump, kdpi, recipient_id) VALUES ($1, $2, $3, $4, $5)",
    )
    .bind(donor)
    .bind(entry.cit)
    .bind(&entry.pump)
    .bind(entry.kdpi)
    .bind(recipient)
    .execute(&mut *tx)
    .await?;

    sqlx::query(
        r#"
        INSERT INTO images (id, user_id, job_id, doc, donor_id, recipient_id)
        VALUES ($1, $2, $3, $4, $5, $6)
        "#,
    )
    .bind(image)
    .bind(user_id)
    .bind(job_id)
    .bind(Value::Object(entry.initial_doc(donor, recipient)))
    .bind(donor)
    .bind(recipient)
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;
    Ok(image)
}

/// Insert each entry independently; one failure does not stop the others
pub async fn insert_images(
    pool: &PgPool,
    user_id: &str,
    job_id: &str,
    entries: &[NewImageEntry],
) -> Vec<EntryOutcome> {
    let mut outcomes = Vec::with_capacity(entries.len());
    for entry in entries {
        match insert_image(pool, user_id, job_id, entry).await {
            Ok(id) => {
                debug!(user_id, job_id, image_id = %id, file_id = %entry.file_id, "Inserted image");
                outcomes.push(EntryOutcome::success(&entry.file_id));
            }
            Err(e) => {
                warn!(user_id, job_id, file_id = %entry.file_id, error = %e, "Failed to insert image");
                outcomes.push(EntryOutcome::failed(&entry.file_id, StoreError::from(e)));
            }
        }
    }
    outcomes
}

/// Get a job ticket
pub async fn get_ticket(pool: &PgPool, user_id: &str, job_id: &str) -> Result<JobTicket, StoreError> {
    let row = sqlx::query(
        r#"
        SELECT user_id, job_id, file_type, skip_flag, status, created_at
        FROM jobs
        WHERE user_id = $1 AND job_id = $2
        "#,
    )
    .bind(user_id)
    .bind(job_id)
    .fetch_optional(pool)
    .await?;

    match row {
        Some(row) => Ok(ticket_from_row(&row)?),
        None => Err(StoreError::NotFound(format!("Job {job_id}"))),
    }
}

/// Update job status
pub async fn update_status(
    pool: &PgPool,
    user_id: &str,
    job_id: &str,
    status: JobStatus,
) -> Result<(), StoreError> {
    let result = sqlx::query(
        "UPDATE jobs SET status = $3, updated_at = NOW() WHERE user_id = $1 AND job_id = $2",
    )
    .bind(user_id)
    .bind(job_id)
    .bind(status.to_string())
    .execute(pool)
    .await?;

    if result.rows_affected() == 0 {
        return Err(StoreError::NotFound(format!("Job {job_id}")));
    }
    Ok(())
}

/// Images of a job in submission order
pub async fn get_job_images(
    pool: &PgPool,
    user_id: &str,
    job_id: &str,
) -> Result<Vec<ImageRecord>, sqlx::Error> {
    let rows = sqlx::query(
        "SELECT id, doc FROM images WHERE user_id = $1 AND job_id = $2 ORDER BY seq",
    )
    .bind(user_id)
    .bind(job_id)
    .fetch_all(pool)
    .await?;

    rows.iter().map(image_from_row).collect()
}

/// Merge one update record into the job's images whose `file` matches.
/// Returns the number of documents changed.
pub async fn merge_update(
    pool: &PgPool,
    user_id: &str,
    job_id: &str,
    file: &str,
    update: &Map<String, Value>,
) -> Result<usize, sqlx::Error> {
    let mut tx = pool.begin().await?;

    let rows = sqlx::query(
        r#"
        SELECT id, doc FROM images
        WHERE user_id = $1 AND job_id = $2 AND doc ->> 'file' = $3
        FOR UPDATE
        "#,
    )
    .bind(user_id)
    .bind(job_id)
    .bind(file)
    .fetch_all(&mut *tx)
    .await?;

    for row in &rows {
        let mut image = image_from_row(row)?;
        let report = merge_image_fields(&mut image.doc, update);
        debug!(image_id = %image.id, file, added = ?report.added, overwritten = ?report.overwritten, "Merged image fields");

        sqlx::query("UPDATE images SET doc = $2 WHERE id = $1")
            .bind(image.id)
            .bind(Value::Object(image.doc))
            .execute(&mut *tx)
            .await?;
    }

    tx.commit().await?;
    Ok(rows.len())
}

/// Apply update records one by one, isolating failures per record
pub async fn merge_updates(
    pool: &PgPool,
    user_id: &str,
    job_id: &str,
    updates: &[Map<String, Value>],
) -> Vec<EntryOutcome> {
    let mut outcomes = Vec::with_capacity(updates.len());
    for update in updates {
        let Some(file) = update_file_key(update) else {
            outcomes.push(EntryOutcome::failed("", "update record has no file key"));
            continue;
        };
        outcomes.push(match merge_update(pool, user_id, job_id, file, update).await {
            Ok(0) => EntryOutcome::failed(file, StoreError::NotFound(format!("Image {file}"))),
            Ok(_) => EntryOutcome::success(file),
            Err(e) => {
                warn!(user_id, job_id, file, error = %e, "Failed to merge image update");
                EntryOutcome::failed(file, StoreError::from(e))
            }
        });
    }
    outcomes
}

/// Delete a job, its images and their donor and recipient records
pub async fn delete_job(pool: &PgPool, user_id: &str, job_id: &str) -> Result<(), StoreError> {
    let mut tx = pool.begin().await?;

    let covariates = sqlx::query(
        "SELECT donor_id, recipient_id FROM images WHERE user_id = $1 AND job_id = $2",
    )
    .bind(user_id)
    .bind(job_id)
    .fetch_all(&mut *tx)
    .await?;

    let deleted = sqlx::query("DELETE FROM jobs WHERE user_id = $1 AND job_id = $2")
        .bind(user_id)
        .bind(job_id)
        .execute(&mut *tx)
        .await?;
    if deleted.rows_affected() == 0 {
        return Err(StoreError::NotFound(format!("Job {job_id}")));
    }

    let mut donors: Vec<Uuid> = Vec::new();
    let mut recipients: Vec<Uuid> = Vec::new();
    for row in &covariates {
        donors.extend(row.try_get::<Option<Uuid>, _>("donor_id")?);
        recipients.extend(row.try_get::<Option<Uuid>, _>("recipient_id")?);
    }

    sqlx::query("DELETE FROM donors WHERE id = ANY($1)")
        .bind(&donors)
        .execute(&mut *tx)
        .await?;
    sqlx::query("DELETE FROM recipients WHERE id = ANY($1)")
        .bind(&recipients)
        .execute(&mut *tx)
        .await?;

    tx.commit().await?;
    Ok(())
}

/// A user's jobs with their image file names, in submission order
pub async fn list_jobs(pool: &PgPool, user_id: &str) -> Result<Vec<JobSummary>, StoreError> {
    let user = sqlx::query("SELECT fb_id FROM users WHERE fb_id = $1")
        .bind(user_id)
        .fetch_optional(pool)
        .await?;
    if user.is_none() {
        return Err(StoreError::NotFound(format!("User {user_id}")));
    }

    let jobs = sqlx::query(
        r#"
        SELECT user_id, job_id, file_type, skip_flag, status, created_at
        FROM jobs
        WHERE user_id = $1
        ORDER BY seq
        "#,
    )
    .bind(user_id)
    .fetch_all(pool)
    .await?;

    let files = sqlx::query(
        "SELECT job_id, doc ->> 'file' AS file FROM images WHERE user_id = $1 ORDER BY seq",
    )
    .bind(user_id)
    .fetch_all(pool)
    .await?;

    let mut by_job: HashMap<String, Vec<String>> = HashMap::new();
    for row in &files {
        let job_id: String = row.try_get("job_id")?;
        if let Some(file) = row.try_get::<Option<String>, _>("file")? {
            by_job.entry(job_id).or_default().push(file);
        }
    }

    jobs.iter()
        .map(|row| {
            let ticket = ticket_from_row(row)?;
            Ok::<_, StoreError>(JobSummary {
                file_ids: by_job.remove(&ticket.job_id).unwrap_or_default(),
                job_id: ticket.job_id,
                status: ticket.status,
            })
        })
        .collect()
}

/// Image documents whose `file` is one of `files`
pub async fn get_images_by_file(pool: &PgPool, files: &[String]) -> Result<Vec<ImageRecord>, sqlx::Error> {
    let rows = sqlx::query("SELECT id, doc FROM images WHERE doc ->> 'file' = ANY($1) ORDER BY seq")
        .bind(files)
        .fetch_all(pool)
        .await?;

    rows.iter().map(image_from_row).collect()
}
