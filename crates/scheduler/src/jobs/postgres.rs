//! Postgres-backed job store.
//!
//! Persistent implementation of [`JobStore`] suitable for a small fleet of
//! application instances sharing one database.
//!
//! ## Concurrency
//!
//! - `claim_next` is a single `UPDATE … FOR UPDATE SKIP LOCKED … RETURNING`
//!   round trip, so concurrent dispatchers never double-claim a job.
//! - Single-flight per conversation is enforced by a partial unique index on
//!   `conversation_id` over rows in `queued`/`running`; a violating
//!   `enqueue`/`requeue_for_retry` maps to [`JobStoreError::Busy`].
//! - All other transitions load the row, run the same state machine as the
//!   in-memory store, and persist behind an optimistic `WHERE state = <old>`
//!   guard, retrying on a lost race.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL code | JobStoreError | Scenario |
//! |------------|-----------------|---------------|----------|
//! | Database (unique violation) | `23505` | `Busy` | Second active job for a conversation |
//! | Database (other) | any other | `Storage` | Constraint/database failure |
//! | RowNotFound | N/A | `NotFound` | Job id unknown |
//! | Other | N/A | `Storage` | Pool closed, network failure, decode error |

use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use uuid::Uuid;

use genqueue_core::{ConversationId, JobId, ModelId, OutputRef, ProviderId};

use super::store::{JobStore, JobStoreError};
use super::types::{FailureKind, Job, JobState, Transition, TransitionError};

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS generation_jobs (
        id UUID PRIMARY KEY,
        conversation_id UUID NOT NULL,
        provider_id TEXT NOT NULL,
        model_id TEXT NOT NULL,
        state TEXT NOT NULL,
        inputs JSONB NOT NULL,
        external_handle TEXT,
        retry_count INTEGER NOT NULL,
        max_retries INTEGER NOT NULL,
        error TEXT,
        failure_kind TEXT,
        output_ref TEXT,
        created_at TIMESTAMPTZ NOT NULL,
        queued_at TIMESTAMPTZ,
        started_at TIMESTAMPTZ,
        finished_at TIMESTAMPTZ,
        last_polled_at TIMESTAMPTZ,
        updated_at TIMESTAMPTZ NOT NULL
    )
    "#,
    r#"
    CREATE UNIQUE INDEX IF NOT EXISTS generation_jobs_single_flight
        ON generation_jobs (conversation_id)
        WHERE state IN ('queued', 'running')
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS generation_jobs_provider_state
        ON generation_jobs (provider_id, state, queued_at)
    "#,
];

const JOB_COLUMNS: &str = "id, conversation_id, provider_id, model_id, state, inputs, \
     external_handle, retry_count, max_retries, error, failure_kind, output_ref, \
     created_at, queued_at, started_at, finished_at, last_polled_at, updated_at";

/// Postgres-backed job store.
///
/// Bridges sqlx's async API onto the synchronous [`JobStore`] trait with an
/// owned current-thread runtime, so scheduler loops stay plain threads.
#[derive(Debug)]
pub struct PostgresJobStore {
    pool: PgPool,
    rt: tokio::runtime::Runtime,
}

impl PostgresJobStore {
    /// Connect to the database and build the bridge runtime.
    pub fn connect(database_url: &str) -> Result<Self, JobStoreError> {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| JobStoreError::Storage(format!("runtime: {e}")))?;
        let pool = rt
            .block_on(PgPoolOptions::new().max_connections(5).connect(database_url))
            .map_err(|e| map_sqlx_error("connect", e))?;
        Ok(Self { pool, rt })
    }

    /// Wrap an existing pool (the caller keeps ownership of migrations).
    pub fn from_pool(pool: PgPool) -> Result<Self, JobStoreError> {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| JobStoreError::Storage(format!("runtime: {e}")))?;
        Ok(Self { pool, rt })
    }

    /// Create the jobs table and indexes if they do not exist yet.
    pub fn ensure_schema(&self) -> Result<(), JobStoreError> {
        for ddl in SCHEMA {
            self.rt
                .block_on(sqlx::query(ddl).execute(&self.pool))
                .map_err(|e| map_sqlx_error("ensure_schema", e))?;
        }
        Ok(())
    }

    fn fetch(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM generation_jobs WHERE id = $1");
        let row = self
            .rt
            .block_on(
                sqlx::query(&sql)
                    .bind(job_id.as_uuid())
                    .fetch_optional(&self.pool),
            )
            .map_err(|e| map_sqlx_error("get", e))?;
        row.map(|r| job_from_row(&r)).transpose()
    }

    /// Persist a transition behind an optimistic state guard.
    ///
    /// Returns `false` when another writer moved the row first; the caller
    /// reloads and re-applies.
    fn persist_transition(&self, before: &Job, after: &Job) -> Result<bool, JobStoreError> {
        let result = self.rt.block_on(
            sqlx::query(
                r#"
                UPDATE generation_jobs
                SET state = $2,
                    external_handle = $3,
                    retry_count = $4,
                    error = $5,
                    failure_kind = $6,
                    output_ref = $7,
                    queued_at = $8,
                    started_at = $9,
                    finished_at = $10,
                    last_polled_at = $11,
                    updated_at = $12
                WHERE id = $1 AND state = $13
                "#,
            )
            .bind(after.id.as_uuid())
            .bind(after.state.as_str())
            .bind(after.external_handle.as_deref())
            .bind(after.retry_count as i32)
            .bind(after.error.as_deref())
            .bind(after.failure.map(|f| f.as_str()))
            .bind(after.output_ref.as_ref().map(|r| r.as_str()))
            .bind(after.queued_at)
            .bind(after.started_at)
            .bind(after.finished_at)
            .bind(after.last_polled_at)
            .bind(after.updated_at)
            .bind(before.state.as_str())
            .execute(&self.pool),
        );

        match result {
            Ok(done) => Ok(done.rows_affected() > 0),
            Err(e) if is_unique_violation(&e) => Err(JobStoreError::Busy(before.conversation_id)),
            Err(e) => Err(map_sqlx_error("persist_transition", e)),
        }
    }

    /// Load, apply a state-machine event, and persist; retries lost races.
    fn apply_transition(
        &self,
        job_id: JobId,
        f: impl Fn(&mut Job) -> Result<Transition, TransitionError>,
    ) -> Result<Job, JobStoreError> {
        for _ in 0..3 {
            let before = self.fetch(job_id)?.ok_or(JobStoreError::NotFound(job_id))?;
            let mut after = before.clone();
            match f(&mut after)? {
                Transition::AlreadyApplied => return Ok(before),
                Transition::Applied => {
                    if self.persist_transition(&before, &after)? {
                        return Ok(after);
                    }
                }
            }
        }
        Err(JobStoreError::Storage(format!(
            "job {job_id}: transition kept losing races"
        )))
    }

    fn count_where(
        &self,
        sql: &str,
        provider_id: &ProviderId,
    ) -> Result<usize, JobStoreError> {
        let row = self
            .rt
            .block_on(
                sqlx::query(sql)
                    .bind(provider_id.as_str())
                    .fetch_one(&self.pool),
            )
            .map_err(|e| map_sqlx_error("count", e))?;
        let count: i64 = row.try_get(0).map_err(|e| map_sqlx_error("count", e))?;
        Ok(count as usize)
    }
}

impl JobStore for PostgresJobStore {
    fn create(
        &self,
        conversation_id: ConversationId,
        provider_id: &ProviderId,
        model_id: &ModelId,
        inputs: JsonValue,
        max_retries: u32,
    ) -> Result<Job, JobStoreError> {
        let job = Job::new(
            conversation_id,
            provider_id.clone(),
            model_id.clone(),
            inputs,
            max_retries,
        );
        self.rt
            .block_on(
                sqlx::query(
                    r#"
                    INSERT INTO generation_jobs
                        (id, conversation_id, provider_id, model_id, state, inputs,
                         retry_count, max_retries, created_at, updated_at)
                    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
                    "#,
                )
                .bind(job.id.as_uuid())
                .bind(job.conversation_id.as_uuid())
                .bind(job.provider_id.as_str())
                .bind(job.model_id.as_str())
                .bind(job.state.as_str())
                .bind(&job.inputs)
                .bind(job.retry_count as i32)
                .bind(job.max_retries as i32)
                .bind(job.created_at)
                .bind(job.updated_at)
                .execute(&self.pool),
            )
            .map_err(|e| map_sqlx_error("create", e))?;
        Ok(job)
    }

    fn enqueue(&self, job_id: JobId) -> Result<Job, JobStoreError> {
        self.apply_transition(job_id, |job| job.enqueue())
    }

    fn claim_next(&self, provider_id: &ProviderId) -> Result<Option<Job>, JobStoreError> {
        let sql = format!(
            r#"
            UPDATE generation_jobs
            SET state = 'running', started_at = now(), updated_at = now()
            WHERE id = (
                SELECT id FROM generation_jobs
                WHERE provider_id = $1 AND state = 'queued'
                ORDER BY queued_at ASC, id ASC
                FOR UPDATE SKIP LOCKED
                LIMIT 1
            )
            RETURNING {JOB_COLUMNS}
            "#
        );
        let row = self
            .rt
            .block_on(
                sqlx::query(&sql)
                    .bind(provider_id.as_str())
                    .fetch_optional(&self.pool),
            )
            .map_err(|e| map_sqlx_error("claim_next", e))?;
        row.map(|r| job_from_row(&r)).transpose()
    }

    fn attach_handle(&self, job_id: JobId, external_handle: &str) -> Result<(), JobStoreError> {
        self.apply_transition(job_id, |job| job.attach_handle(external_handle))
            .map(|_| ())
    }

    fn mark_completed(&self, job_id: JobId, output_ref: &OutputRef) -> Result<(), JobStoreError> {
        self.apply_transition(job_id, |job| job.complete(output_ref))
            .map(|_| ())
    }

    fn mark_failed(
        &self,
        job_id: JobId,
        error: &str,
        failure: FailureKind,
    ) -> Result<(), JobStoreError> {
        self.apply_transition(job_id, |job| job.fail(error, failure))
            .map(|_| ())
    }

    fn mark_cancelled(&self, job_id: JobId) -> Result<(), JobStoreError> {
        self.apply_transition(job_id, |job| job.cancel()).map(|_| ())
    }

    fn requeue_for_retry(&self, job_id: JobId) -> Result<Job, JobStoreError> {
        self.apply_transition(job_id, |job| job.requeue_for_retry())
    }

    fn record_poll(&self, job_id: JobId) -> Result<(), JobStoreError> {
        self.apply_transition(job_id, |job| job.record_poll())
            .map(|_| ())
    }

    fn get(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
        self.fetch(job_id)
    }

    fn list_in_state(&self, state: JobState, limit: usize) -> Result<Vec<Job>, JobStoreError> {
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM generation_jobs WHERE state = $1 \
             ORDER BY created_at ASC, id ASC LIMIT $2"
        );
        let rows = self
            .rt
            .block_on(
                sqlx::query(&sql)
                    .bind(state.as_str())
                    .bind(limit as i64)
                    .fetch_all(&self.pool),
            )
            .map_err(|e| map_sqlx_error("list_in_state", e))?;
        rows.iter().map(job_from_row).collect()
    }

    fn list_stale_running(
        &self,
        older_than: DateTime<Utc>,
    ) -> Result<Vec<Job>, JobStoreError> {
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM generation_jobs \
             WHERE state = 'running' \
               AND COALESCE(last_polled_at, started_at, updated_at) < $1 \
             ORDER BY created_at ASC, id ASC"
        );
        let rows = self
            .rt
            .block_on(sqlx::query(&sql).bind(older_than).fetch_all(&self.pool))
            .map_err(|e| map_sqlx_error("list_stale_running", e))?;
        rows.iter().map(job_from_row).collect()
    }

    fn providers_with_queued(&self) -> Result<Vec<ProviderId>, JobStoreError> {
        let rows = self
            .rt
            .block_on(
                sqlx::query(
                    "SELECT DISTINCT provider_id FROM generation_jobs \
                     WHERE state = 'queued' ORDER BY provider_id",
                )
                .fetch_all(&self.pool),
            )
            .map_err(|e| map_sqlx_error("providers_with_queued", e))?;
        rows.iter()
            .map(|row| {
                let id: String = row
                    .try_get("provider_id")
                    .map_err(|e| map_sqlx_error("providers_with_queued", e))?;
                Ok(ProviderId::new(id))
            })
            .collect()
    }

    fn count_running(&self, provider_id: &ProviderId) -> Result<usize, JobStoreError> {
        self.count_where(
            "SELECT COUNT(*) FROM generation_jobs WHERE provider_id = $1 AND state = 'running'",
            provider_id,
        )
    }

    fn count_queued(&self, provider_id: &ProviderId) -> Result<usize, JobStoreError> {
        self.count_where(
            "SELECT COUNT(*) FROM generation_jobs WHERE provider_id = $1 AND state = 'queued'",
            provider_id,
        )
    }

    fn count_active_for_conversation(
        &self,
        conversation_id: ConversationId,
    ) -> Result<usize, JobStoreError> {
        let row = self
            .rt
            .block_on(
                sqlx::query(
                    "SELECT COUNT(*) FROM generation_jobs \
                     WHERE conversation_id = $1 AND state IN ('queued', 'running')",
                )
                .bind(conversation_id.as_uuid())
                .fetch_one(&self.pool),
            )
            .map_err(|e| map_sqlx_error("count_active_for_conversation", e))?;
        let count: i64 = row
            .try_get(0)
            .map_err(|e| map_sqlx_error("count_active_for_conversation", e))?;
        Ok(count as usize)
    }

    fn queue_position(&self, job_id: JobId) -> Result<Option<usize>, JobStoreError> {
        let Some(job) = self.fetch(job_id)? else {
            return Err(JobStoreError::NotFound(job_id));
        };
        if job.state != JobState::Queued {
            return Ok(None);
        }
        let row = self
            .rt
            .block_on(
                sqlx::query(
                    "SELECT COUNT(*) FROM generation_jobs \
                     WHERE provider_id = $1 AND state = 'queued' \
                       AND (queued_at, id) < ($2, $3)",
                )
                .bind(job.provider_id.as_str())
                .bind(job.queued_at)
                .bind(job.id.as_uuid())
                .fetch_one(&self.pool),
            )
            .map_err(|e| map_sqlx_error("queue_position", e))?;
        let ahead: i64 = row
            .try_get(0)
            .map_err(|e| map_sqlx_error("queue_position", e))?;
        Ok(Some(ahead as usize + 1))
    }

    fn list_for_conversation(
        &self,
        conversation_id: ConversationId,
    ) -> Result<Vec<Job>, JobStoreError> {
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM generation_jobs WHERE conversation_id = $1 \
             ORDER BY created_at ASC, id ASC"
        );
        let rows = self
            .rt
            .block_on(
                sqlx::query(&sql)
                    .bind(conversation_id.as_uuid())
                    .fetch_all(&self.pool),
            )
            .map_err(|e| map_sqlx_error("list_for_conversation", e))?;
        rows.iter().map(job_from_row).collect()
    }

    fn list_finished_since(
        &self,
        provider_id: &ProviderId,
        since: DateTime<Utc>,
    ) -> Result<Vec<Job>, JobStoreError> {
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM generation_jobs \
             WHERE provider_id = $1 \
               AND state IN ('completed', 'failed', 'cancelled') \
               AND finished_at >= $2 \
             ORDER BY finished_at ASC, id ASC"
        );
        let rows = self
            .rt
            .block_on(
                sqlx::query(&sql)
                    .bind(provider_id.as_str())
                    .bind(since)
                    .fetch_all(&self.pool),
            )
            .map_err(|e| map_sqlx_error("list_finished_since", e))?;
        rows.iter().map(job_from_row).collect()
    }

    fn purge_terminal(&self, older_than: DateTime<Utc>) -> Result<usize, JobStoreError> {
        let done = self
            .rt
            .block_on(
                sqlx::query(
                    "DELETE FROM generation_jobs \
                     WHERE state IN ('completed', 'failed', 'cancelled') \
                       AND finished_at < $1",
                )
                .bind(older_than)
                .execute(&self.pool),
            )
            .map_err(|e| map_sqlx_error("purge_terminal", e))?;
        Ok(done.rows_affected() as usize)
    }
}

fn job_from_row(row: &PgRow) -> Result<Job, JobStoreError> {
    let decode = |e: sqlx::Error| map_sqlx_error("decode", e);

    let state_raw: String = row.try_get("state").map_err(decode)?;
    let state = JobState::parse(&state_raw)
        .ok_or_else(|| JobStoreError::Storage(format!("unknown job state '{state_raw}'")))?;

    let failure_raw: Option<String> = row.try_get("failure_kind").map_err(decode)?;
    let failure = match failure_raw {
        Some(raw) => Some(FailureKind::parse(&raw).ok_or_else(|| {
            JobStoreError::Storage(format!("unknown failure kind '{raw}'"))
        })?),
        None => None,
    };

    Ok(Job {
        id: JobId::from_uuid(row.try_get::<Uuid, _>("id").map_err(decode)?),
        conversation_id: ConversationId::from_uuid(
            row.try_get::<Uuid, _>("conversation_id").map_err(decode)?,
        ),
        provider_id: ProviderId::new(row.try_get::<String, _>("provider_id").map_err(decode)?),
        model_id: ModelId::new(row.try_get::<String, _>("model_id").map_err(decode)?),
        state,
        inputs: row.try_get::<JsonValue, _>("inputs").map_err(decode)?,
        external_handle: row
            .try_get::<Option<String>, _>("external_handle")
            .map_err(decode)?,
        retry_count: row.try_get::<i32, _>("retry_count").map_err(decode)? as u32,
        max_retries: row.try_get::<i32, _>("max_retries").map_err(decode)? as u32,
        error: row.try_get::<Option<String>, _>("error").map_err(decode)?,
        failure,
        output_ref: row
            .try_get::<Option<String>, _>("output_ref")
            .map_err(decode)?
            .map(OutputRef::new),
        created_at: row.try_get("created_at").map_err(decode)?,
        queued_at: row.try_get("queued_at").map_err(decode)?,
        started_at: row.try_get("started_at").map_err(decode)?,
        finished_at: row.try_get("finished_at").map_err(decode)?,
        last_polled_at: row.try_get("last_polled_at").map_err(decode)?,
        updated_at: row.try_get("updated_at").map_err(decode)?,
    })
}

fn is_unique_violation(e: &sqlx::Error) -> bool {
    matches!(e, sqlx::Error::Database(db) if db.code().as_deref() == Some("23505"))
}

fn map_sqlx_error(operation: &str, e: sqlx::Error) -> JobStoreError {
    match e {
        sqlx::Error::RowNotFound => {
            JobStoreError::Storage(format!("{operation}: row not found"))
        }
        other => JobStoreError::Storage(format!("{operation}: {other}")),
    }
}
