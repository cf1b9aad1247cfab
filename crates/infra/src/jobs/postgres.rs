//! Postgres-backed job store.
//!
//! ## Claiming
//!
//! `claim_next` runs in one transaction: it selects the best eligible row
//! with `FOR UPDATE SKIP LOCKED`, applies the state machine's claim to the
//! rehydrated job, and writes the result back guarded on the prior state.
//! Concurrent workers skip each other's locked rows instead of blocking, so
//! no two transactions ever claim the same job.
//!
//! A selected row that fails to decode or violates the job invariants is
//! dead-lettered in the same transaction, with the decode error recorded in
//! `error_message`, and the next candidate is tried.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | JobStoreError |
//! |------------|----------------------|---------------|
//! | Database (unique violation) | `23505` | `Conflict` |
//! | Database (other) | Any other | `Storage` |
//! | PoolClosed | N/A | `Pool(NotReady)` |
//! | PoolTimedOut | N/A | `Pool(Unreachable)` |
//! | Other | N/A | `Storage` |

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{FromRow, PgPool, Postgres, Row, Transaction};
use tracing::{debug, instrument, warn};

use jobforge_core::{Job, JobId, JobRecord, JobState, Priority};

use super::store::{Enqueued, JobStats, JobStore, JobStoreError, ensure_enqueueable};
use crate::db::{PoolError, PoolManager};

/// Cap on unreadable rows dead-lettered by one `claim_next` call.
const MAX_UNREADABLE_PER_CLAIM: usize = 16;

const SELECT_COLUMNS: &str = r#"
    SELECT
        id,
        job_type,
        payload,
        state,
        attempts,
        max_attempts,
        run_at,
        last_run_at,
        finished_at,
        error_message,
        priority,
        idempotency_key,
        created_at,
        updated_at
    FROM jobs
"#;

/// Postgres-backed job store.
///
/// Holds the shared [`PoolManager`] rather than a pool handle, so every
/// operation observes the current pool and fails with `Pool(NotReady)` after
/// the manager is closed.
#[derive(Debug, Clone)]
pub struct PgJobStore {
    pool: Arc<PoolManager>,
}

impl PgJobStore {
    pub fn new(pool: Arc<PoolManager>) -> Self {
        Self { pool }
    }

    fn pool(&self) -> Result<PgPool, JobStoreError> {
        self.pool.get().ok_or(JobStoreError::Pool(PoolError::NotReady))
    }

    #[instrument(
        skip(self, job),
        fields(job_id = %job.id(), job_type = job.job_type()),
        err
    )]
    pub async fn enqueue(&self, job: Job) -> Result<Enqueued, JobStoreError> {
        ensure_enqueueable(&job)?;
        let pool = self.pool()?;
        let record = job.into_record();

        let inserted: Option<uuid::Uuid> = sqlx::query_scalar(
            r#"
            INSERT INTO jobs (
                id, job_type, payload, state, attempts, max_attempts,
                run_at, not_before, last_run_at, finished_at, error_message,
                priority, idempotency_key, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, NULL, $8, $9, $10, $11, $12, $13, $14)
            ON CONFLICT (idempotency_key) DO NOTHING
            RETURNING id
            "#,
        )
        .bind(record.id.as_uuid())
        .bind(&record.job_type)
        .bind(serde_json::Value::Object(record.payload.clone()))
        .bind(record.state.as_str())
        .bind(to_i32("attempts", record.attempts)?)
        .bind(to_i32("max_attempts", record.max_attempts)?)
        .bind(record.run_at)
        .bind(record.last_run_at)
        .bind(record.finished_at)
        .bind(&record.error_message)
        .bind(record.priority.as_i16())
        .bind(&record.idempotency_key)
        .bind(record.created_at)
        .bind(record.updated_at)
        .fetch_optional(&pool)
        .await
        .map_err(|e| map_sqlx_error("enqueue", e))?;

        if let Some(id) = inserted {
            return Ok(Enqueued::Created(JobId::from_uuid(id)));
        }

        let existing: Option<uuid::Uuid> =
            sqlx::query_scalar("SELECT id FROM jobs WHERE idempotency_key = $1")
                .bind(&record.idempotency_key)
                .fetch_optional(&pool)
                .await
                .map_err(|e| map_sqlx_error("enqueue", e))?;

        match existing {
            Some(id) => {
                debug!(existing_id = %id, "duplicate idempotency key");
                Ok(Enqueued::Duplicate(JobId::from_uuid(id)))
            }
            None => Err(JobStoreError::Conflict(format!(
                "idempotency key {:?} conflicted but no row was found",
                record.idempotency_key
            ))),
        }
    }

    #[instrument(skip(self), fields(job_id = %job_id), err)]
    pub async fn get(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
        let pool = self.pool()?;
        let row = sqlx::query(&format!("{SELECT_COLUMNS} WHERE id = $1"))
            .bind(job_id.as_uuid())
            .fetch_optional(&pool)
            .await
            .map_err(|e| map_sqlx_error("get", e))?;

        row.map(|row| job_from_row(&row)).transpose()
    }

    #[instrument(skip(self), err)]
    pub async fn claim_next(&self, now: DateTime<Utc>) -> Result<Option<Job>, JobStoreError> {
        let pool = self.pool()?;
        let mut tx = pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("claim_next", e))?;

        // Unreadable rows are dead-lettered in place; try the next candidate.
        let mut quarantined = 0;
        let mut job = loop {
            let row = sqlx::query(&format!(
                r#"{SELECT_COLUMNS}
                WHERE state = 'pending'
                   OR (state = 'scheduled' AND run_at < $1)
                   OR (state = 'retrying' AND (not_before IS NULL OR not_before <= $1))
                ORDER BY priority DESC, COALESCE(run_at, created_at) ASC, created_at ASC, id ASC
                LIMIT 1
                FOR UPDATE SKIP LOCKED
                "#
            ))
            .bind(now)
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("claim_next", e))?;

            let Some(row) = row else {
                tx.commit()
                    .await
                    .map_err(|e| map_sqlx_error("claim_next", e))?;
                return Ok(None);
            };

            match job_from_row(&row) {
                Ok(job) => break job,
                Err(reason) => {
                    dead_letter_unreadable(&mut tx, &row, &reason, now).await?;
                    quarantined += 1;
                    if quarantined >= MAX_UNREADABLE_PER_CLAIM {
                        tx.commit()
                            .await
                            .map_err(|e| map_sqlx_error("claim_next", e))?;
                        return Ok(None);
                    }
                }
            }
        };

        let previous = job.state();
        job.claim_at(now)?;

        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET state = $2,
                run_at = NULL,
                not_before = NULL,
                last_run_at = $3,
                error_message = NULL,
                updated_at = $4
            WHERE id = $1 AND state = $5
            "#,
        )
        .bind(job.id().as_uuid())
        .bind(job.state().as_str())
        .bind(job.last_run_at())
        .bind(job.updated_at())
        .bind(previous.as_str())
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("claim_next", e))?;

        if result.rows_affected() != 1 {
            return Err(JobStoreError::Conflict(format!(
                "job {} changed state while being claimed",
                job.id()
            )));
        }

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("claim_next", e))?;

        debug!(job_id = %job.id(), from = %previous, "claimed job");
        Ok(Some(job))
    }

    #[instrument(
        skip(self, job),
        fields(job_id = %job.id(), state = %job.state(), expected = %expected),
        err
    )]
    pub async fn save(
        &self,
        job: &Job,
        expected: JobState,
        not_before: Option<DateTime<Utc>>,
    ) -> Result<(), JobStoreError> {
        let pool = self.pool()?;
        let not_before = not_before.filter(|_| job.state() == JobState::Retrying);

        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET state = $2,
                attempts = $3,
                run_at = $4,
                not_before = $5,
                last_run_at = $6,
                finished_at = $7,
                error_message = $8,
                updated_at = $9
            WHERE id = $1 AND state = $10
            "#,
        )
        .bind(job.id().as_uuid())
        .bind(job.state().as_str())
        .bind(to_i32("attempts", job.attempts())?)
        .bind(job.run_at())
        .bind(not_before)
        .bind(job.last_run_at())
        .bind(job.finished_at())
        .bind(job.error_message())
        .bind(job.updated_at())
        .bind(expected.as_str())
        .execute(&pool)
        .await
        .map_err(|e| map_sqlx_error("save", e))?;

        if result.rows_affected() == 1 {
            return Ok(());
        }

        let current: Option<String> = sqlx::query_scalar("SELECT state FROM jobs WHERE id = $1")
            .bind(job.id().as_uuid())
            .fetch_optional(&pool)
            .await
            .map_err(|e| map_sqlx_error("save", e))?;

        match current {
            None => Err(JobStoreError::NotFound(job.id())),
            Some(state) => Err(JobStoreError::Conflict(format!(
                "job {} is {state}, expected {expected}",
                job.id()
            ))),
        }
    }

    #[instrument(skip(self), err)]
    pub async fn list_by_state(
        &self,
        state: JobState,
        limit: usize,
    ) -> Result<Vec<Job>, JobStoreError> {
        let pool = self.pool()?;
        let rows = sqlx::query(&format!(
            "{SELECT_COLUMNS} WHERE state = $1 ORDER BY created_at ASC, id ASC LIMIT $2"
        ))
        .bind(state.as_str())
        .bind(to_limit(limit))
        .fetch_all(&pool)
        .await
        .map_err(|e| map_sqlx_error("list_by_state", e))?;

        rows.iter().map(job_from_row).collect()
    }

    #[instrument(skip(self), err)]
    pub async fn list_by_type(
        &self,
        job_type: &str,
        limit: usize,
    ) -> Result<Vec<Job>, JobStoreError> {
        let pool = self.pool()?;
        let rows = sqlx::query(&format!(
            "{SELECT_COLUMNS} WHERE job_type = $1 ORDER BY created_at ASC, id ASC LIMIT $2"
        ))
        .bind(job_type)
        .bind(to_limit(limit))
        .fetch_all(&pool)
        .await
        .map_err(|e| map_sqlx_error("list_by_type", e))?;

        rows.iter().map(job_from_row).collect()
    }

    #[instrument(skip(self), err)]
    pub async fn stats(&self) -> Result<JobStats, JobStoreError> {
        let pool = self.pool()?;
        let rows = sqlx::query("SELECT state, COUNT(*) AS count FROM jobs GROUP BY state")
            .fetch_all(&pool)
            .await
            .map_err(|e| map_sqlx_error("stats", e))?;

        let mut stats = JobStats::default();
        for row in rows {
            let state: String = row.try_get("state").map_err(|e| map_sqlx_error("stats", e))?;
            let count: i64 = row.try_get("count").map_err(|e| map_sqlx_error("stats", e))?;
            stats.add(state.parse()?, usize::try_from(count).unwrap_or(0));
        }
        Ok(stats)
    }
}

#[async_trait]
impl JobStore for PgJobStore {
    async fn enqueue(&self, job: Job) -> Result<Enqueued, JobStoreError> {
        PgJobStore::enqueue(self, job).await
    }

    async fn get(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
        PgJobStore::get(self, job_id).await
    }

    async fn claim_next(&self, now: DateTime<Utc>) -> Result<Option<Job>, JobStoreError> {
        PgJobStore::claim_next(self, now).await
    }

    async fn save(
        &self,
        job: &Job,
        expected: JobState,
        not_before: Option<DateTime<Utc>>,
    ) -> Result<(), JobStoreError> {
        PgJobStore::save(self, job, expected, not_before).await
    }

    async fn list_by_state(&self, state: JobState, limit: usize) -> Result<Vec<Job>, JobStoreError> {
        PgJobStore::list_by_state(self, state, limit).await
    }

    async fn list_by_type(&self, job_type: &str, limit: usize) -> Result<Vec<Job>, JobStoreError> {
        PgJobStore::list_by_type(self, job_type, limit).await
    }

    async fn stats(&self) -> Result<JobStats, JobStoreError> {
        PgJobStore::stats(self).await
    }
}

fn to_i32(field: &str, value: u32) -> Result<i32, JobStoreError> {
    i32::try_from(value)
        .map_err(|_| JobStoreError::Storage(format!("{field} out of range: {value}")))
}

fn to_limit(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

/// Mark a claimable row that cannot be rehydrated as `dead`, guarded on the
/// state it was selected in.
async fn dead_letter_unreadable(
    tx: &mut Transaction<'_, Postgres>,
    row: &PgRow,
    reason: &JobStoreError,
    now: DateTime<Utc>,
) -> Result<(), JobStoreError> {
    let id: uuid::Uuid = row
        .try_get("id")
        .map_err(|e| map_sqlx_error("claim_next", e))?;
    let state: String = row
        .try_get("state")
        .map_err(|e| map_sqlx_error("claim_next", e))?;

    sqlx::query(
        r#"
        UPDATE jobs
        SET state = 'dead',
            run_at = NULL,
            not_before = NULL,
            finished_at = $3,
            error_message = $2,
            updated_at = $3
        WHERE id = $1 AND state = $4
        "#,
    )
    .bind(id)
    .bind(format!("unreadable job row in state {state}: {reason}"))
    .bind(now)
    .bind(&state)
    .execute(&mut **tx)
    .await
    .map_err(|e| map_sqlx_error("claim_next", e))?;

    warn!(job_id = %id, state = %state, error = %reason, "dead-lettered unreadable job row");
    Ok(())
}

fn job_from_row(row: &PgRow) -> Result<Job, JobStoreError> {
    let row = JobRow::from_row(row)
        .map_err(|e| JobStoreError::Storage(format!("failed to decode job row: {e}")))?;
    let record = JobRecord::try_from(row)?;
    Ok(Job::try_from(record)?)
}

/// Map SQLx errors to job store errors.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> JobStoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code().as_deref() {
                // Unique violation
                Some("23505") => JobStoreError::Conflict(msg),
                _ => JobStoreError::Storage(msg),
            }
        }
        sqlx::Error::PoolClosed => JobStoreError::Pool(PoolError::NotReady),
        sqlx::Error::PoolTimedOut => JobStoreError::Pool(PoolError::unreachable(format!(
            "timed out acquiring a connection in {operation}"
        ))),
        _ => JobStoreError::Storage(format!("sqlx error in {}: {}", operation, err)),
    }
}

// SQLx row types

#[derive(Debug)]
struct JobRow {
    id: uuid::Uuid,
    job_type: String,
    payload: serde_json::Value,
    state: String,
    attempts: i32,
    max_attempts: i32,
    run_at: Option<DateTime<Utc>>,
    last_run_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
    error_message: Option<String>,
    priority: i16,
    idempotency_key: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl<'r> sqlx::FromRow<'r, PgRow> for JobRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(JobRow {
            id: row.try_get("id")?,
            job_type: row.try_get("job_type")?,
            payload: row.try_get("payload")?,
            state: row.try_get("state")?,
            attempts: row.try_get("attempts")?,
            max_attempts: row.try_get("max_attempts")?,
            run_at: row.try_get("run_at")?,
            last_run_at: row.try_get("last_run_at")?,
            finished_at: row.try_get("finished_at")?,
            error_message: row.try_get("error_message")?,
            priority: row.try_get("priority")?,
            idempotency_key: row.try_get("idempotency_key")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

impl TryFrom<JobRow> for JobRecord {
    type Error = JobStoreError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        let serde_json::Value::Object(payload) = row.payload else {
            return Err(JobStoreError::Storage(format!(
                "job {} payload is not a JSON object",
                row.id
            )));
        };
        let attempts = u32::try_from(row.attempts)
            .map_err(|_| JobStoreError::Storage(format!("negative attempts on job {}", row.id)))?;
        let max_attempts = u32::try_from(row.max_attempts).map_err(|_| {
            JobStoreError::Storage(format!("negative max_attempts on job {}", row.id))
        })?;

        Ok(JobRecord {
            id: JobId::from_uuid(row.id),
            job_type: row.job_type,
            payload,
            state: row.state.parse()?,
            attempts,
            max_attempts,
            run_at: row.run_at,
            last_run_at: row.last_run_at,
            finished_at: row.finished_at,
            error_message: row.error_message,
            priority: Priority::try_from(row.priority)?,
            idempotency_key: row.idempotency_key,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}
