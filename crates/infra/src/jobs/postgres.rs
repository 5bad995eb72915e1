//! Postgres-backed job store.
//!
//! ## Claiming
//!
//! `claim` is a single conditional `UPDATE ... WHERE id = $1 AND status = 'pending'`
//! with `RETURNING`. Postgres row locking guarantees that of several concurrent
//! claimers exactly one sees the row come back; the others get no row and skip
//! the record.
//!
//! Writes that finish an execution go through `update_claimed`, which repeats
//! the claim's `started_at` and `attempts` in its `WHERE` clause. A worker that
//! outlived its timeout and lost the record to `reset_stuck` matches no row.
//!
//! ## Error Mapping
//!
//! | SQLx Error | JobStoreError |
//! |------------|---------------|
//! | Database / PoolClosed / I/O / other | `Storage` |
//! | Row decode failure, unknown status/backoff, negative counters | `Corrupt` |
//!
//! ## Runtime
//!
//! `JobStore` is synchronous. Each call blocks on the tokio runtime handle given
//! at construction, so the store must be used from threads that are not
//! themselves driving that runtime (worker threads, `main` before entering it).

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{FromRow, PgPool, Row};
use tokio::runtime::Handle;
use tracing::{Span, instrument};

use forgejobs_core::JobId;

use super::store::{JobStore, JobStoreError, retention_cutoff};
use super::types::{BackoffStrategy, ClaimToken, JobRecord, JobStatus, NewJobRecord, QueueStats, RetryPolicy};

const MIGRATION: &str = include_str!("../../migrations/0001_create_jobs.sql");

const RECORD_COLUMNS: &str = r#"
    id,
    job_type,
    payload,
    status,
    attempts,
    max_attempts,
    retry_delay_seconds,
    timeout_seconds,
    backoff,
    last_error,
    scheduled_at,
    started_at,
    completed_at,
    created_at
"#;

/// Postgres-backed job store.
///
/// Cheap to clone; clones share the connection pool.
#[derive(Debug, Clone)]
pub struct PostgresJobStore {
    pool: Arc<PgPool>,
    runtime: Handle,
}

impl PostgresJobStore {
    pub fn new(pool: PgPool, runtime: Handle) -> Self {
        Self {
            pool: Arc::new(pool),
            runtime,
        }
    }

    /// Open a pool against `database_url`.
    pub fn connect(database_url: &str, max_connections: u32, runtime: Handle) -> Result<Self, JobStoreError> {
        let pool = runtime
            .block_on(
                PgPoolOptions::new()
                    .max_connections(max_connections)
                    .connect(database_url),
            )
            .map_err(|e| map_sqlx_error("connect", e))?;
        Ok(Self::new(pool, runtime))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create the `jobs` table and its indexes if they do not exist.
    pub fn migrate(&self) -> Result<(), JobStoreError> {
        self.runtime.block_on(self.migrate_async())
    }

    #[instrument(skip(self), err)]
    async fn migrate_async(&self) -> Result<(), JobStoreError> {
        sqlx::raw_sql(MIGRATION)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("migrate", e))?;
        Ok(())
    }

    #[instrument(skip(self, record), fields(job_type = %record.job_type, job_id = tracing::field::Empty), err)]
    async fn insert_async(&self, record: NewJobRecord) -> Result<JobId, JobStoreError> {
        let row = sqlx::query(
            r#"
            INSERT INTO jobs (
                job_type,
                payload,
                status,
                attempts,
                max_attempts,
                retry_delay_seconds,
                timeout_seconds,
                backoff,
                scheduled_at,
                created_at
            )
            VALUES ($1, $2, 'pending', 0, $3, $4, $5, $6, $7, $8)
            RETURNING id
            "#,
        )
        .bind(&record.job_type)
        .bind(Value::Object(record.payload))
        .bind(to_db_int(record.policy.max_attempts))
        .bind(to_db_bigint(record.policy.retry_delay_seconds))
        .bind(to_db_bigint(record.policy.timeout_seconds))
        .bind(record.policy.backoff.as_str())
        .bind(record.scheduled_at)
        .bind(record.created_at)
        .fetch_one(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("insert_job", e))?;

        let id: i64 = row
            .try_get("id")
            .map_err(|e| JobStoreError::Corrupt(format!("failed to read id: {e}")))?;
        Span::current().record("job_id", id);
        Ok(JobId::new(id))
    }

    #[instrument(skip(self, record), fields(job_id = %record.id, status = %record.status), err)]
    async fn update_async(&self, record: &JobRecord) -> Result<(), JobStoreError> {
        let result = sqlx::query(
            r#"
            UPDATE jobs SET
                status = $2,
                attempts = $3,
                last_error = $4,
                scheduled_at = $5,
                started_at = $6,
                completed_at = $7
            WHERE id = $1
            "#,
        )
        .bind(record.id.as_i64())
        .bind(record.status.as_str())
        .bind(to_db_int(record.attempts))
        .bind(record.last_error.as_deref())
        .bind(record.scheduled_at)
        .bind(record.started_at)
        .bind(record.completed_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("update_job", e))?;

        if result.rows_affected() == 0 {
            return Err(JobStoreError::NotFound(record.id));
        }
        Ok(())
    }

    #[instrument(skip(self, record), fields(job_id = %record.id, status = %record.status), err)]
    async fn update_claimed_async(&self, record: &JobRecord, claim: ClaimToken) -> Result<bool, JobStoreError> {
        let result = sqlx::query(
            r#"
            UPDATE jobs SET
                status = $2,
                attempts = $3,
                last_error = $4,
                scheduled_at = $5,
                started_at = $6,
                completed_at = $7
            WHERE id = $1
              AND status = 'running'
              AND started_at = $8
              AND attempts = $9
            "#,
        )
        .bind(record.id.as_i64())
        .bind(record.status.as_str())
        .bind(to_db_int(record.attempts))
        .bind(record.last_error.as_deref())
        .bind(record.scheduled_at)
        .bind(record.started_at)
        .bind(record.completed_at)
        .bind(claim.started_at)
        .bind(to_db_int(claim.attempts))
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("update_claimed_job", e))?;

        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self), err)]
    async fn find_ready_async(&self, limit: usize, now: DateTime<Utc>) -> Result<Vec<JobRecord>, JobStoreError> {
        let sql = format!(
            "SELECT {RECORD_COLUMNS} FROM jobs
             WHERE status = 'pending' AND scheduled_at <= $1
             ORDER BY scheduled_at ASC, id ASC
             LIMIT $2"
        );
        let rows = sqlx::query(&sql)
            .bind(now)
            .bind(to_db_limit(limit))
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("find_ready", e))?;

        decode_rows(rows)
    }

    #[instrument(skip(self), fields(job_id = %id), err)]
    async fn find_by_id_async(&self, id: JobId) -> Result<Option<JobRecord>, JobStoreError> {
        let sql = format!("SELECT {RECORD_COLUMNS} FROM jobs WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(id.as_i64())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("find_by_id", e))?;

        row.map(decode_row).transpose()
    }

    #[instrument(skip(self), fields(job_id = %id), err)]
    async fn claim_async(&self, id: JobId, now: DateTime<Utc>) -> Result<Option<JobRecord>, JobStoreError> {
        let sql = format!(
            "UPDATE jobs SET
                status = 'running',
                started_at = $2,
                attempts = attempts + 1,
                completed_at = NULL
             WHERE id = $1 AND status = 'pending'
             RETURNING {RECORD_COLUMNS}"
        );
        let row = sqlx::query(&sql)
            .bind(id.as_i64())
            .bind(now)
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("claim_job", e))?;

        row.map(decode_row).transpose()
    }

    #[instrument(skip(self), err)]
    async fn stats_async(&self) -> Result<QueueStats, JobStoreError> {
        let rows = sqlx::query("SELECT status, COUNT(*) AS count FROM jobs GROUP BY status")
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("job_stats", e))?;

        let mut stats = QueueStats::default();
        for row in rows {
            let status: String = row
                .try_get("status")
                .map_err(|e| JobStoreError::Corrupt(format!("failed to read status: {e}")))?;
            let count: i64 = row
                .try_get("count")
                .map_err(|e| JobStoreError::Corrupt(format!("failed to read count: {e}")))?;
            let status = status
                .parse::<JobStatus>()
                .map_err(|e| JobStoreError::Corrupt(e.to_string()))?;
            stats.add(status, count.max(0) as u64);
        }
        Ok(stats)
    }

    #[instrument(skip(self), err)]
    async fn delete_terminal_async(&self, days: u32, now: DateTime<Utc>) -> Result<u64, JobStoreError> {
        let result = sqlx::query(
            r#"
            DELETE FROM jobs
            WHERE status IN ('completed', 'failed')
              AND completed_at < $1
            "#,
        )
        .bind(retention_cutoff(days, now))
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("delete_terminal", e))?;

        Ok(result.rows_affected())
    }

    #[instrument(skip(self), err)]
    async fn reset_stuck_async(&self, now: DateTime<Utc>) -> Result<u64, JobStoreError> {
        // SET expressions read pre-update values. The epoch comparison avoids
        // interval overflow for very large timeouts.
        let result = sqlx::query(
            r#"
            UPDATE jobs SET
                attempts = LEAST(attempts + 1, max_attempts),
                status = CASE WHEN attempts + 1 >= max_attempts THEN 'failed' ELSE 'pending' END,
                completed_at = CASE WHEN attempts + 1 >= max_attempts THEN $1 ELSE completed_at END,
                last_error = 'timed out: exceeded ' || timeout_seconds || 's while running',
                started_at = NULL
            WHERE status = 'running'
              AND started_at IS NOT NULL
              AND EXTRACT(EPOCH FROM ($1 - started_at)) > timeout_seconds
            "#,
        )
        .bind(now)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("reset_stuck", e))?;

        Ok(result.rows_affected())
    }

    #[instrument(skip(self), fields(status = %status), err)]
    async fn list_by_status_async(&self, status: JobStatus, limit: usize) -> Result<Vec<JobRecord>, JobStoreError> {
        let sql = format!(
            "SELECT {RECORD_COLUMNS} FROM jobs
             WHERE status = $1
             ORDER BY created_at ASC, id ASC
             LIMIT $2"
        );
        let rows = sqlx::query(&sql)
            .bind(status.as_str())
            .bind(to_db_limit(limit))
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("list_by_status", e))?;

        decode_rows(rows)
    }

    #[instrument(skip(self), err)]
    async fn list_by_type_async(&self, job_type: &str, limit: usize) -> Result<Vec<JobRecord>, JobStoreError> {
        let sql = format!(
            "SELECT {RECORD_COLUMNS} FROM jobs
             WHERE job_type = $1
             ORDER BY created_at ASC, id ASC
             LIMIT $2"
        );
        let rows = sqlx::query(&sql)
            .bind(job_type)
            .bind(to_db_limit(limit))
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("list_by_type", e))?;

        decode_rows(rows)
    }
}

impl JobStore for PostgresJobStore {
    fn insert(&self, record: NewJobRecord) -> Result<JobId, JobStoreError> {
        self.runtime.block_on(self.insert_async(record))
    }

    fn update(&self, record: &JobRecord) -> Result<(), JobStoreError> {
        self.runtime.block_on(self.update_async(record))
    }

    fn update_claimed(&self, record: &JobRecord, claim: ClaimToken) -> Result<bool, JobStoreError> {
        self.runtime.block_on(self.update_claimed_async(record, claim))
    }

    fn find_ready(&self, limit: usize, now: DateTime<Utc>) -> Result<Vec<JobRecord>, JobStoreError> {
        self.runtime.block_on(self.find_ready_async(limit, now))
    }

    fn find_by_id(&self, id: JobId) -> Result<Option<JobRecord>, JobStoreError> {
        self.runtime.block_on(self.find_by_id_async(id))
    }

    fn claim(&self, id: JobId, now: DateTime<Utc>) -> Result<Option<JobRecord>, JobStoreError> {
        self.runtime.block_on(self.claim_async(id, now))
    }

    fn stats(&self) -> Result<QueueStats, JobStoreError> {
        self.runtime.block_on(self.stats_async())
    }

    fn delete_terminal_older_than(&self, days: u32, now: DateTime<Utc>) -> Result<u64, JobStoreError> {
        self.runtime.block_on(self.delete_terminal_async(days, now))
    }

    fn reset_stuck(&self, now: DateTime<Utc>) -> Result<u64, JobStoreError> {
        self.runtime.block_on(self.reset_stuck_async(now))
    }

    fn list_by_status(&self, status: JobStatus, limit: usize) -> Result<Vec<JobRecord>, JobStoreError> {
        self.runtime.block_on(self.list_by_status_async(status, limit))
    }

    fn list_by_type(&self, job_type: &str, limit: usize) -> Result<Vec<JobRecord>, JobStoreError> {
        self.runtime.block_on(self.list_by_type_async(job_type, limit))
    }
}

/// Raw `jobs` row, decoded column by column.
struct JobRow {
    id: i64,
    job_type: String,
    payload: Value,
    status: String,
    attempts: i32,
    max_attempts: i32,
    retry_delay_seconds: i64,
    timeout_seconds: i64,
    backoff: String,
    last_error: Option<String>,
    scheduled_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
}

impl<'r> FromRow<'r, PgRow> for JobRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(JobRow {
            id: row.try_get("id")?,
            job_type: row.try_get("job_type")?,
            payload: row.try_get("payload")?,
            status: row.try_get("status")?,
            attempts: row.try_get("attempts")?,
            max_attempts: row.try_get("max_attempts")?,
            retry_delay_seconds: row.try_get("retry_delay_seconds")?,
            timeout_seconds: row.try_get("timeout_seconds")?,
            backoff: row.try_get("backoff")?,
            last_error: row.try_get("last_error")?,
            scheduled_at: row.try_get("scheduled_at")?,
            started_at: row.try_get("started_at")?,
            completed_at: row.try_get("completed_at")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

impl TryFrom<JobRow> for JobRecord {
    type Error = JobStoreError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        let corrupt = |field: &str, detail: String| {
            JobStoreError::Corrupt(format!("job {}: {field}: {detail}", row.id))
        };

        let payload = match row.payload {
            Value::Object(map) => map,
            other => return Err(corrupt("payload", format!("expected object, got {other}"))),
        };
        let status = row
            .status
            .parse::<JobStatus>()
            .map_err(|e| corrupt("status", e.to_string()))?;
        let backoff = row
            .backoff
            .parse::<BackoffStrategy>()
            .map_err(|e| corrupt("backoff", e.to_string()))?;

        Ok(JobRecord {
            id: JobId::new(row.id),
            job_type: row.job_type,
            payload,
            status,
            attempts: u32::try_from(row.attempts).map_err(|e| corrupt("attempts", e.to_string()))?,
            policy: RetryPolicy {
                max_attempts: u32::try_from(row.max_attempts)
                    .map_err(|e| corrupt("max_attempts", e.to_string()))?,
                retry_delay_seconds: u64::try_from(row.retry_delay_seconds)
                    .map_err(|e| corrupt("retry_delay_seconds", e.to_string()))?,
                timeout_seconds: u64::try_from(row.timeout_seconds)
                    .map_err(|e| corrupt("timeout_seconds", e.to_string()))?,
                backoff,
            },
            last_error: row.last_error,
            scheduled_at: row.scheduled_at,
            started_at: row.started_at,
            completed_at: row.completed_at,
            created_at: row.created_at,
        })
    }
}

fn decode_row(row: PgRow) -> Result<JobRecord, JobStoreError> {
    let row = JobRow::from_row(&row)
        .map_err(|e| JobStoreError::Corrupt(format!("failed to decode job row: {e}")))?;
    JobRecord::try_from(row)
}

fn decode_rows(rows: Vec<PgRow>) -> Result<Vec<JobRecord>, JobStoreError> {
    rows.into_iter().map(decode_row).collect()
}

fn to_db_int(value: u32) -> i32 {
    i32::try_from(value).unwrap_or(i32::MAX)
}

fn to_db_bigint(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn to_db_limit(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

/// Map SQLx errors to JobStoreError.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> JobStoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let code = db_err.code().map(|c| c.to_string()).unwrap_or_default();
            JobStoreError::Storage(format!(
                "database error in {operation} ({code}): {}",
                db_err.message()
            ))
        }
        sqlx::Error::PoolClosed => {
            JobStoreError::Storage(format!("connection pool closed in {operation}"))
        }
        sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => {
            JobStoreError::Corrupt(format!("decode error in {operation}: {err}"))
        }
        _ => JobStoreError::Storage(format!("sqlx error in {operation}: {err}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn oversized_values_clamp_to_column_range() {
        assert_eq!(to_db_int(u32::MAX), i32::MAX);
        assert_eq!(to_db_int(7), 7);
        assert_eq!(to_db_bigint(u64::MAX), i64::MAX);
        assert_eq!(to_db_limit(usize::MAX), i64::MAX);
    }

    fn row(status: &str, payload: Value, attempts: i32) -> JobRow {
        let now = Utc::now();
        JobRow {
            id: 9,
            job_type: "send_email".to_string(),
            payload,
            status: status.to_string(),
            attempts,
            max_attempts: 3,
            retry_delay_seconds: 60,
            timeout_seconds: 300,
            backoff: "linear".to_string(),
            last_error: None,
            scheduled_at: now,
            started_at: None,
            completed_at: None,
            created_at: now,
        }
    }

    #[test]
    fn row_converts_to_record() {
        let record = JobRecord::try_from(row("pending", serde_json::json!({"to": "x"}), 1)).unwrap();
        assert_eq!(record.id, JobId::new(9));
        assert_eq!(record.status, JobStatus::Pending);
        assert_eq!(record.attempts, 1);
        assert_eq!(record.policy.backoff, BackoffStrategy::Linear);
        assert_eq!(record.payload["to"], "x");
    }

    #[test]
    fn malformed_rows_are_corrupt() {
        let bad_status = JobRecord::try_from(row("sleeping", serde_json::json!({}), 0));
        assert!(matches!(bad_status, Err(JobStoreError::Corrupt(_))));

        let bad_payload = JobRecord::try_from(row("pending", serde_json::json!([1, 2]), 0));
        assert!(matches!(bad_payload, Err(JobStoreError::Corrupt(_))));

        let negative = JobRecord::try_from(row("pending", serde_json::json!({}), -1));
        assert!(matches!(negative, Err(JobStoreError::Corrupt(_))));
    }
}
