use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::types::Json;
use sqlx::{PgPool, Row};
use std::str::FromStr;
use uuid::Uuid;

use crate::models::job::{
    AnalysisJob, BatchProgress, JobId, JobInput, JobResult, JobStatus, NewJob,
};
use crate::services::store::{StatusCounts, Transition};

const JOB_COLUMNS: &str = "id, owner_id, input, meal_type, status, result, error, retry_count, \
     priority, progress, claim_token, created_at, started_at, completed_at, expires_at, \
     available_at, lease_expires_at, updated_at, resubmitted_at";

fn job_from_row(row: &PgRow) -> Result<AnalysisJob, sqlx::Error> {
    let status_str: String = row.try_get("status")?;
    let status = JobStatus::from_str(&status_str).map_err(|e| sqlx::Error::ColumnDecode {
        index: "status".to_string(),
        source: Box::new(e),
    })?;
    let id: Uuid = row.try_get("id")?;
    let input: Json<JobInput> = row.try_get("input")?;
    let result: Option<Json<JobResult>> = row.try_get("result")?;
    let progress: Option<Json<BatchProgress>> = row.try_get("progress")?;

    Ok(AnalysisJob {
        id: JobId::from(id),
        owner_id: row.try_get("owner_id")?,
        input: input.0,
        meal_type: row.try_get("meal_type")?,
        status,
        result: result.map(|r| r.0),
        error: row.try_get("error")?,
        retry_count: row.try_get("retry_count")?,
        priority: row.try_get("priority")?,
        progress: progress.map(|p| p.0),
        claim_token: row.try_get("claim_token")?,
        created_at: row.try_get("created_at")?,
        started_at: row.try_get("started_at")?,
        completed_at: row.try_get("completed_at")?,
        expires_at: row.try_get("expires_at")?,
        available_at: row.try_get("available_at")?,
        lease_expires_at: row.try_get("lease_expires_at")?,
        updated_at: row.try_get("updated_at")?,
        resubmitted_at: row.try_get("resubmitted_at")?,
    })
}

/// Insert a new pending job
pub async fn create_job(
    pool: &PgPool,
    id: Uuid,
    job: &NewJob,
    now: DateTime<Utc>,
    expires_at: DateTime<Utc>,
) -> Result<AnalysisJob, sqlx::Error> {
    let progress = match &job.input {
        JobInput::Batch { images } => Some(Json(BatchProgress {
            processed: 0,
            total: images.len() as u32,
        })),
        JobInput::Single { .. } => None,
    };

    let sql = format!(
        r#"
        INSERT INTO analysis_jobs
            (id, owner_id, input, meal_type, status, retry_count, priority, progress,
             created_at, expires_at, available_at, updated_at)
        VALUES ($1, $2, $3, $4, 'PENDING', 0, $5, $6, $7, $8, $7, $7)
        RETURNING {JOB_COLUMNS}
        "#
    );

    let row = sqlx::query(&sql)
        .bind(id)
        .bind(&job.owner_id)
        .bind(Json(&job.input))
        .bind(&job.meal_type)
        .bind(job.priority)
        .bind(progress)
        .bind(now)
        .bind(expires_at)
        .fetch_one(pool)
        .await?;

    job_from_row(&row)
}

/// Get a job by ID, scoped to its owner
pub async fn get_job(
    pool: &PgPool,
    job_id: Uuid,
    owner_id: &str,
) -> Result<Option<AnalysisJob>, sqlx::Error> {
    let sql = format!("SELECT {JOB_COLUMNS} FROM analysis_jobs WHERE id = $1 AND owner_id = $2");
    let row = sqlx::query(&sql)
        .bind(job_id)
        .bind(owner_id)
        .fetch_optional(pool)
        .await?;

    row.as_ref().map(job_from_row).transpose()
}

/// Current status of a job, ignoring ownership
pub async fn get_status(pool: &PgPool, job_id: Uuid) -> Result<Option<JobStatus>, sqlx::Error> {
    let row = sqlx::query("SELECT status FROM analysis_jobs WHERE id = $1")
        .bind(job_id)
        .fetch_optional(pool)
        .await?;

    match row {
        Some(r) => {
            let status: String = r.try_get("status")?;
            Ok(JobStatus::from_str(&status).ok())
        }
        None => Ok(None),
    }
}

/// List an owner's jobs, newest first
pub async fn list_jobs_for_owner(
    pool: &PgPool,
    owner_id: &str,
    limit: i64,
) -> Result<Vec<AnalysisJob>, sqlx::Error> {
    let sql = format!(
        "SELECT {JOB_COLUMNS} FROM analysis_jobs WHERE owner_id = $1 \
         ORDER BY created_at DESC LIMIT $2"
    );
    let rows = sqlx::query(&sql)
        .bind(owner_id)
        .bind(limit)
        .fetch_all(pool)
        .await?;

    rows.iter().map(job_from_row).collect()
}

/// Claim up to `limit` pending jobs for this worker.
///
/// `FOR UPDATE SKIP LOCKED` lets concurrent dispatchers pass over rows another
/// transaction is already claiming instead of blocking on them.
pub async fn claim_jobs(
    pool: &PgPool,
    limit: i64,
    now: DateTime<Utc>,
    lease_until: DateTime<Utc>,
) -> Result<Vec<AnalysisJob>, sqlx::Error> {
    let sql = format!(
        r#"
        UPDATE analysis_jobs
        SET status = 'PROCESSING',
            claim_token = gen_random_uuid(),
            started_at = $2,
            lease_expires_at = $3,
            updated_at = $2
        WHERE id IN (
            SELECT id FROM analysis_jobs
            WHERE status = 'PENDING'
              AND expires_at > $2
              AND available_at <= $2
            ORDER BY created_at ASC
            LIMIT $1
            FOR UPDATE SKIP LOCKED
        )
        RETURNING {JOB_COLUMNS}
        "#
    );

    let rows = sqlx::query(&sql)
        .bind(limit)
        .bind(now)
        .bind(lease_until)
        .fetch_all(pool)
        .await?;

    let mut jobs = rows.iter().map(job_from_row).collect::<Result<Vec<_>, _>>()?;
    jobs.sort_by_key(|j| j.created_at);
    Ok(jobs)
}

/// Conditionally apply a transition. Returns `None` when the job is missing
/// or no longer matches the expected status / claim token.
pub async fn transition_job(
    pool: &PgPool,
    job_id: Uuid,
    change: &Transition,
    now: DateTime<Utc>,
) -> Result<Option<AnalysisJob>, sqlx::Error> {
    let sql = format!(
        r#"
        UPDATE analysis_jobs
        SET status = $3::text,
            result = COALESCE($4::jsonb, result),
            error = COALESCE($5::text, error),
            retry_count = retry_count + $6::int,
            available_at = COALESCE($7::timestamptz, available_at),
            completed_at = CASE WHEN $3::text IN ('COMPLETED', 'FAILED') THEN $8 ELSE NULL END,
            claim_token = CASE WHEN $3::text = 'PROCESSING' THEN claim_token ELSE NULL END,
            lease_expires_at = CASE WHEN $3::text = 'PROCESSING' THEN lease_expires_at ELSE NULL END,
            updated_at = $8
        WHERE id = $1
          AND status = $2
          AND ($9::uuid IS NULL OR claim_token = $9::uuid)
        RETURNING {JOB_COLUMNS}
        "#
    );

    let expected: &str = change.expected.as_ref();
    let to: &str = change.to.as_ref();

    let row = sqlx::query(&sql)
        .bind(job_id)
        .bind(expected)
        .bind(to)
        .bind(change.result.as_ref().map(Json))
        .bind(change.error.as_deref())
        .bind(if change.increment_retry { 1i32 } else { 0i32 })
        .bind(change.available_at)
        .bind(now)
        .bind(change.claim_token)
        .fetch_optional(pool)
        .await?;

    row.as_ref().map(job_from_row).transpose()
}

/// Extend the lease of a job still held by `claim_token`
pub async fn renew_lease(
    pool: &PgPool,
    job_id: Uuid,
    claim_token: Uuid,
    until: DateTime<Utc>,
) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        r#"
        UPDATE analysis_jobs
        SET lease_expires_at = $3
        WHERE id = $1 AND status = 'PROCESSING' AND claim_token = $2
        "#,
    )
    .bind(job_id)
    .bind(claim_token)
    .bind(until)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() == 1)
}

/// Store batch progress for a job still held by `claim_token`
pub async fn update_progress(
    pool: &PgPool,
    job_id: Uuid,
    claim_token: Uuid,
    progress: BatchProgress,
    now: DateTime<Utc>,
) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        r#"
        UPDATE analysis_jobs
        SET progress = $3, updated_at = $4
        WHERE id = $1 AND status = 'PROCESSING' AND claim_token = $2
        "#,
    )
    .bind(job_id)
    .bind(claim_token)
    .bind(Json(progress))
    .bind(now)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() == 1)
}

/// Processing jobs whose lease has run out
pub async fn get_stale_leases(
    pool: &PgPool,
    now: DateTime<Utc>,
    limit: i64,
) -> Result<Vec<AnalysisJob>, sqlx::Error> {
    let sql = format!(
        "SELECT {JOB_COLUMNS} FROM analysis_jobs \
         WHERE status = 'PROCESSING' AND lease_expires_at < $1 \
         ORDER BY lease_expires_at ASC LIMIT $2"
    );
    let rows = sqlx::query(&sql).bind(now).bind(limit).fetch_all(pool).await?;
    rows.iter().map(job_from_row).collect()
}

/// Pending jobs past their expiry
pub async fn get_expired_pending(
    pool: &PgPool,
    now: DateTime<Utc>,
    limit: i64,
) -> Result<Vec<AnalysisJob>, sqlx::Error> {
    let sql = format!(
        "SELECT {JOB_COLUMNS} FROM analysis_jobs \
         WHERE status = 'PENDING' AND expires_at <= $1 \
         ORDER BY expires_at ASC LIMIT $2"
    );
    let rows = sqlx::query(&sql).bind(now).bind(limit).fetch_all(pool).await?;
    rows.iter().map(job_from_row).collect()
}

/// Delete terminal jobs past their retention window
pub async fn delete_terminal_before(
    pool: &PgPool,
    completed_before: DateTime<Utc>,
    failed_before: DateTime<Utc>,
) -> Result<u64, sqlx::Error> {
    let result = sqlx::query(
        r#"
        DELETE FROM analysis_jobs
        WHERE (status = 'COMPLETED' AND completed_at < $1)
           OR (status = 'FAILED' AND completed_at < $2)
        "#,
    )
    .bind(completed_before)
    .bind(failed_before)
    .execute(pool)
    .await?;

    Ok(result.rows_affected())
}

/// Job counts per lifecycle bucket
pub async fn count_jobs(pool: &PgPool, now: DateTime<Utc>) -> Result<StatusCounts, sqlx::Error> {
    let row = sqlx::query(
        r#"
        SELECT
            COUNT(*) FILTER (WHERE status = 'PENDING' AND expires_at > $1 AND available_at <= $1) AS waiting,
            COUNT(*) FILTER (WHERE status = 'PENDING' AND expires_at > $1 AND available_at > $1) AS delayed,
            COUNT(*) FILTER (WHERE status = 'PROCESSING') AS active,
            COUNT(*) FILTER (WHERE status = 'COMPLETED') AS completed,
            COUNT(*) FILTER (WHERE status = 'FAILED') AS failed
        FROM analysis_jobs
        "#,
    )
    .bind(now)
    .fetch_one(pool)
    .await?;

    let count = |name: &str| -> Result<u64, sqlx::Error> {
        let n: i64 = row.try_get(name)?;
        Ok(n.max(0) as u64)
    };

    Ok(StatusCounts {
        waiting: count("waiting")?,
        delayed: count("delayed")?,
        active: count("active")?,
        completed: count("completed")?,
        failed: count("failed")?,
    })
}

/// Most recently failed jobs that have not been resubmitted
pub async fn get_recent_failed(pool: &PgPool, limit: i64) -> Result<Vec<AnalysisJob>, sqlx::Error> {
    let sql = format!(
        "SELECT {JOB_COLUMNS} FROM analysis_jobs \
         WHERE status = 'FAILED' AND resubmitted_at IS NULL \
         ORDER BY completed_at DESC LIMIT $1"
    );
    let rows = sqlx::query(&sql).bind(limit).fetch_all(pool).await?;
    rows.iter().map(job_from_row).collect()
}

/// Mark a failed job as resubmitted. Only the first caller wins.
pub async fn mark_resubmitted(pool: &PgPool, id: Uuid, now: DateTime<Utc>) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        r#"
        UPDATE analysis_jobs
        SET resubmitted_at = $2
        WHERE id = $1 AND status = 'FAILED' AND resubmitted_at IS NULL
        "#,
    )
    .bind(id)
    .bind(now)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() == 1)
}

/// Delete every pending job
pub async fn delete_pending(pool: &PgPool) -> Result<u64, sqlx::Error> {
    let result = sqlx::query("DELETE FROM analysis_jobs WHERE status = 'PENDING'")
        .execute(pool)
        .await?;
    Ok(result.rows_affected())
}
