//! Postgres-backed job queue.
//!
//! ## Claiming
//!
//! `claim_next` selects the oldest due row with `FOR UPDATE SKIP LOCKED` and
//! flips it to `running` in the same statement, so concurrent workers never
//! receive the same job and never block on each other's candidate rows.
//!
//! ## Duplicate advance jobs
//!
//! A partial unique index on `(kind, task_id) WHERE status = 'queued'` allows
//! at most one queued `advance_pipeline` job per task. Enqueue uses
//! `ON CONFLICT DO NOTHING` against it and returns the existing job's id.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::{Map, Value as JsonValue};
use sqlx::{postgres::PgRow, Row};
use tracing::{debug, instrument};

use carpipe_core::{Clock, ErrorKind, JobId, JobStatus, RetryPolicy, SystemClock};

use super::queue::{JobQueue, QueueError, DEFAULT_LEASE_SECS};
use super::types::{
    ClaimedJob, FailureOutcome, JobKind, NewJob, QueueStats, QueuedJob, TASK_SUBJECT,
};
use crate::db::{describe_sqlx_error, to_u32, Db};

const JOB_COLUMNS: &str = "job_id, kind, subject_type, subject_id, payload_json, status, attempt, \
     available_at, lease_expires_at, last_error_kind, created_at, updated_at";

#[derive(Debug, Clone)]
pub struct PostgresJobQueue {
    db: Db,
    clock: Arc<dyn Clock>,
    policy: RetryPolicy,
    lease: chrono::Duration,
}

impl PostgresJobQueue {
    pub fn new(db: Db) -> Self {
        Self {
            db,
            clock: Arc::new(SystemClock),
            policy: RetryPolicy::default(),
            lease: chrono::Duration::seconds(DEFAULT_LEASE_SECS),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_lease(mut self, lease: chrono::Duration) -> Self {
        self.lease = lease;
        self
    }

    #[instrument(skip(self, job), fields(kind = %job.kind, subject_id = %job.subject_id), err)]
    async fn insert(&self, job: NewJob) -> Result<JobId, QueueError> {
        let now = self.clock.now();
        let id = JobId::generate();
        let is_advance = job.kind == JobKind::AdvancePipeline;
        let task_id = (job.subject_type == TASK_SUBJECT).then(|| job.subject_id.clone());

        let sql = if is_advance {
            r#"
            INSERT INTO jobs (job_id, kind, subject_type, subject_id, task_id, payload_json,
                              status, attempt, available_at, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, 'queued', 0, $7, $8, $8)
            ON CONFLICT (kind, task_id) WHERE status = 'queued' AND kind = 'advance_pipeline'
            DO NOTHING
            RETURNING job_id
            "#
        } else {
            r#"
            INSERT INTO jobs (job_id, kind, subject_type, subject_id, task_id, payload_json,
                              status, attempt, available_at, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, 'queued', 0, $7, $8, $8)
            RETURNING job_id
            "#
        };

        let inserted = sqlx::query(sql)
            .bind(id.as_str())
            .bind(job.kind.as_str())
            .bind(&job.subject_type)
            .bind(&job.subject_id)
            .bind(task_id.as_deref())
            .bind(JsonValue::Object(job.payload))
            .bind(job.available_at.unwrap_or(now))
            .bind(now)
            .fetch_optional(self.db.pool())
            .await
            .map_err(|e| map_sqlx_error("enqueue", e))?;

        if inserted.is_some() {
            return Ok(id);
        }

        // Lost to an already-queued advance job for the same task.
        let existing = sqlx::query(
            "SELECT job_id FROM jobs WHERE kind = $1 AND task_id = $2 AND status = 'queued'",
        )
        .bind(JobKind::AdvancePipeline.as_str())
        .bind(task_id.as_deref())
        .fetch_optional(self.db.pool())
        .await
        .map_err(|e| map_sqlx_error("enqueue", e))?;

        match existing {
            Some(row) => {
                let existing: String = row
                    .try_get("job_id")
                    .map_err(|e| map_sqlx_error("enqueue", e))?;
                debug!(job_id = %existing, "advance job already queued");
                parse_job_id(&existing)
            }
            // The queued job was claimed in between; try again.
            None => Err(QueueError::Storage(
                "advance job conflict resolved concurrently, retry enqueue".to_string(),
            )),
        }
    }

    #[instrument(skip(self), err)]
    async fn claim(&self) -> Result<Option<ClaimedJob>, QueueError> {
        let now = self.clock.now();
        let row = sqlx::query(&format!(
            r#"
            UPDATE jobs
            SET status = 'running',
                attempt = attempt + 1,
                lease_expires_at = $2,
                updated_at = $1
            WHERE job_id = (
                SELECT job_id FROM jobs
                WHERE (status = 'queued' AND available_at <= $1)
                   OR (status = 'running' AND lease_expires_at <= $1)
                ORDER BY available_at, seq
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(now)
        .bind(now + self.lease)
        .fetch_optional(self.db.pool())
        .await
        .map_err(|e| map_sqlx_error("claim_next", e))?;

        row.map(|row| job_from_row(&row).map(|job| job.claimed()))
            .transpose()
    }

    async fn fetch(&self, job_id: &JobId) -> Result<Option<QueuedJob>, QueueError> {
        let row = sqlx::query(&format!("SELECT {JOB_COLUMNS} FROM jobs WHERE job_id = $1"))
            .bind(job_id.as_str())
            .fetch_optional(self.db.pool())
            .await
            .map_err(|e| map_sqlx_error("get", e))?;
        row.map(|row| job_from_row(&row)).transpose()
    }

    /// Conditional single-row update; explains a miss as not-found or a bad state.
    async fn transition(
        &self,
        job_id: &JobId,
        action: &'static str,
        sql: &str,
        binds: Transition,
    ) -> Result<(), QueueError> {
        let mut query = sqlx::query(sql).bind(job_id.as_str()).bind(self.clock.now());
        match binds {
            Transition::Plain => {}
            Transition::Lease(lease) => query = query.bind(lease),
            Transition::Kind(kind) => query = query.bind(kind.as_str()),
        }
        let result = query
            .execute(self.db.pool())
            .await
            .map_err(|e| map_sqlx_error(action, e))?;

        if result.rows_affected() == 1 {
            return Ok(());
        }
        match self.fetch(job_id).await? {
            None => Err(QueueError::NotFound(job_id.clone())),
            Some(job) => Err(QueueError::InvalidState {
                job_id: job_id.clone(),
                from: job.status,
                action,
            }),
        }
    }

    #[instrument(skip(self), err)]
    async fn fail(
        &self,
        job_id: &JobId,
        kind: ErrorKind,
        retryable: bool,
    ) -> Result<FailureOutcome, QueueError> {
        let now = self.clock.now();
        let mut tx = self
            .db
            .pool()
            .begin()
            .await
            .map_err(|e| map_sqlx_error("mark_failed", e))?;

        let row = sqlx::query("SELECT status, attempt FROM jobs WHERE job_id = $1 FOR UPDATE")
            .bind(job_id.as_str())
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("mark_failed", e))?
            .ok_or_else(|| QueueError::NotFound(job_id.clone()))?;

        let status: String = row
            .try_get("status")
            .map_err(|e| map_sqlx_error("mark_failed", e))?;
        let status = parse_status(&status)?;
        if status != JobStatus::Running {
            return Err(QueueError::InvalidState {
                job_id: job_id.clone(),
                from: status,
                action: "fail",
            });
        }
        let attempt: i32 = row
            .try_get("attempt")
            .map_err(|e| map_sqlx_error("mark_failed", e))?;
        let attempt = to_u32(attempt);

        let outcome = if retryable && self.policy.has_attempts_left(attempt) {
            FailureOutcome::Rescheduled {
                attempt,
                available_at: self.policy.next_retry_at(attempt, now),
            }
        } else {
            FailureOutcome::Failed { attempts: attempt }
        };

        let (status, available_at): (JobStatus, Option<DateTime<Utc>>) = match &outcome {
            FailureOutcome::Rescheduled { available_at, .. } => {
                (JobStatus::Queued, Some(*available_at))
            }
            FailureOutcome::Failed { .. } => (JobStatus::Failed, None),
        };

        sqlx::query(
            r#"
            UPDATE jobs
            SET status = $2,
                available_at = COALESCE($3, available_at),
                lease_expires_at = NULL,
                last_error_kind = $4,
                updated_at = $5
            WHERE job_id = $1
            "#,
        )
        .bind(job_id.as_str())
        .bind(status.as_str())
        .bind(available_at)
        .bind(kind.as_str())
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("mark_failed", e))?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("mark_failed", e))?;
        Ok(outcome)
    }

    async fn by_status(
        &self,
        status: JobStatus,
        limit: usize,
    ) -> Result<Vec<QueuedJob>, QueueError> {
        let rows = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs WHERE status = $1 ORDER BY seq LIMIT $2"
        ))
        .bind(status.as_str())
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(self.db.pool())
        .await
        .map_err(|e| map_sqlx_error("list_by_status", e))?;

        rows.iter().map(job_from_row).collect()
    }

    async fn counts(&self) -> Result<QueueStats, QueueError> {
        let rows = sqlx::query("SELECT status, COUNT(*) AS n FROM jobs GROUP BY status")
            .fetch_all(self.db.pool())
            .await
            .map_err(|e| map_sqlx_error("stats", e))?;

        let mut stats = QueueStats::default();
        for row in rows {
            let status: String = row.try_get("status").map_err(|e| map_sqlx_error("stats", e))?;
            let n: i64 = row.try_get("n").map_err(|e| map_sqlx_error("stats", e))?;
            let n = usize::try_from(n).unwrap_or(0);
            match parse_status(&status)? {
                JobStatus::Queued => stats.queued += n,
                JobStatus::Running => stats.running += n,
                JobStatus::Succeeded => stats.succeeded += n,
                JobStatus::Failed => stats.failed += n,
                JobStatus::DeadLetter => stats.dead_letter += n,
            }
        }
        Ok(stats)
    }
}

enum Transition {
    Plain,
    Lease(DateTime<Utc>),
    Kind(ErrorKind),
}

impl JobQueue for PostgresJobQueue {
    fn enqueue(&self, job: NewJob) -> Result<JobId, QueueError> {
        self.db.block_on(self.insert(job))
    }

    fn claim_next(&self) -> Result<Option<ClaimedJob>, QueueError> {
        self.db.block_on(self.claim())
    }

    fn heartbeat(&self, job_id: &JobId) -> Result<(), QueueError> {
        let lease = self.clock.now() + self.lease;
        self.db.block_on(self.transition(
            job_id,
            "heartbeat",
            "UPDATE jobs SET lease_expires_at = $3, updated_at = $2 \
             WHERE job_id = $1 AND status = 'running'",
            Transition::Lease(lease),
        ))
    }

    fn mark_succeeded(&self, job_id: &JobId) -> Result<(), QueueError> {
        self.db.block_on(self.transition(
            job_id,
            "succeed",
            "UPDATE jobs SET status = 'succeeded', lease_expires_at = NULL, updated_at = $2 \
             WHERE job_id = $1 AND status = 'running'",
            Transition::Plain,
        ))
    }

    fn mark_failed(
        &self,
        job_id: &JobId,
        kind: ErrorKind,
        retryable: bool,
    ) -> Result<FailureOutcome, QueueError> {
        self.db.block_on(self.fail(job_id, kind, retryable))
    }

    fn move_to_dlq(&self, job_id: &JobId, kind: ErrorKind) -> Result<(), QueueError> {
        self.db.block_on(self.transition(
            job_id,
            "dead-letter",
            "UPDATE jobs SET status = 'dead_letter', lease_expires_at = NULL, \
             last_error_kind = $3, updated_at = $2 \
             WHERE job_id = $1 AND status NOT IN ('succeeded', 'dead_letter')",
            Transition::Kind(kind),
        ))
    }

    fn get(&self, job_id: &JobId) -> Result<Option<QueuedJob>, QueueError> {
        self.db.block_on(self.fetch(job_id))
    }

    fn list_by_status(
        &self,
        status: JobStatus,
        limit: usize,
    ) -> Result<Vec<QueuedJob>, QueueError> {
        self.db.block_on(self.by_status(status, limit))
    }

    fn stats(&self) -> Result<QueueStats, QueueError> {
        self.db.block_on(self.counts())
    }
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> QueueError {
    QueueError::Storage(describe_sqlx_error(operation, &err))
}

fn parse_status(value: &str) -> Result<JobStatus, QueueError> {
    value
        .parse()
        .map_err(|e| QueueError::Storage(format!("invalid job status {value:?}: {e}")))
}

fn parse_job_id(value: &str) -> Result<JobId, QueueError> {
    JobId::new(value).map_err(|e| QueueError::Storage(format!("invalid job id {value:?}: {e}")))
}

fn job_from_row(row: &PgRow) -> Result<QueuedJob, QueueError> {
    let get = |e| map_sqlx_error("decode_job", e);
    let id: String = row.try_get("job_id").map_err(get)?;
    let kind: String = row.try_get("kind").map_err(get)?;
    let status: String = row.try_get("status").map_err(get)?;
    let attempt: i32 = row.try_get("attempt").map_err(get)?;
    let payload: JsonValue = row.try_get("payload_json").map_err(get)?;
    let last_error: Option<String> = row.try_get("last_error_kind").map_err(get)?;

    Ok(QueuedJob {
        id: parse_job_id(&id)?,
        kind: JobKind::from(kind),
        subject_type: row.try_get("subject_type").map_err(get)?,
        subject_id: row.try_get("subject_id").map_err(get)?,
        payload: match payload {
            JsonValue::Object(map) => map,
            _ => Map::new(),
        },
        status: parse_status(&status)?,
        attempt: to_u32(attempt),
        available_at: row.try_get("available_at").map_err(get)?,
        lease_expires_at: row.try_get("lease_expires_at").map_err(get)?,
        last_error_kind: last_error
            .as_deref()
            .map(|k| {
                k.parse::<ErrorKind>()
                    .map_err(|e| QueueError::Storage(format!("invalid error kind {k:?}: {e}")))
            })
            .transpose()?,
        created_at: row.try_get("created_at").map_err(get)?,
        updated_at: row.try_get("updated_at").map_err(get)?,
    })
}
