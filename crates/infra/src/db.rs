//! Postgres plumbing shared by the durable stores.
//!
//! Store traits are synchronous and driven from worker threads, so every
//! Postgres store carries a [`Db`]: the pool plus an explicit runtime handle
//! used to block on queries. Calling these stores from inside an async task
//! would panic; use them from worker threads only.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | Meaning |
//! |------------|----------------------|---------|
//! | Database | `23505` | Unique violation (duplicate key or claim race) |
//! | Database | other | Storage failure |
//! | PoolClosed | N/A | Storage failure |
//! | Other | N/A | Network errors, connection failures, etc. |

use std::future::Future;
use std::sync::Arc;

use sqlx::PgPool;
use tokio::runtime::Handle;

/// Tables and indexes required by the Postgres stores.
pub const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS jobs (
    seq BIGSERIAL,
    job_id TEXT PRIMARY KEY,
    kind TEXT NOT NULL,
    subject_type TEXT NOT NULL,
    subject_id TEXT NOT NULL,
    task_id TEXT,
    payload_json JSONB NOT NULL DEFAULT '{}'::jsonb,
    status TEXT NOT NULL,
    attempt INTEGER NOT NULL DEFAULT 0,
    available_at TIMESTAMPTZ NOT NULL,
    lease_expires_at TIMESTAMPTZ,
    last_error_kind TEXT,
    created_at TIMESTAMPTZ NOT NULL,
    updated_at TIMESTAMPTZ NOT NULL
);

CREATE INDEX IF NOT EXISTS jobs_claim_idx ON jobs (status, available_at, seq);

CREATE UNIQUE INDEX IF NOT EXISTS jobs_one_queued_advance_idx
    ON jobs (kind, task_id)
    WHERE status = 'queued' AND kind = 'advance_pipeline';

CREATE TABLE IF NOT EXISTS idempotency_keys (
    key TEXT PRIMARY KEY,
    state TEXT NOT NULL,
    acquired_at TIMESTAMPTZ NOT NULL,
    committed_at TIMESTAMPTZ
);

CREATE TABLE IF NOT EXISTS pipeline_states (
    task_id TEXT PRIMARY KEY,
    stage TEXT NOT NULL,
    status TEXT NOT NULL,
    attempt INTEGER NOT NULL DEFAULT 0,
    last_error_kind TEXT,
    updated_at TIMESTAMPTZ NOT NULL
);

CREATE TABLE IF NOT EXISTS tasks (
    task_id TEXT PRIMARY KEY,
    actor_id TEXT NOT NULL,
    idempotency_key TEXT NOT NULL,
    created_at TIMESTAMPTZ NOT NULL,
    UNIQUE (actor_id, idempotency_key)
);

CREATE TABLE IF NOT EXISTS task_outputs (
    task_id TEXT NOT NULL,
    stage TEXT NOT NULL,
    payload JSONB NOT NULL,
    recorded_at TIMESTAMPTZ NOT NULL,
    PRIMARY KEY (task_id, stage)
);
"#;

/// Create all tables and indexes if they do not exist.
pub async fn ensure_schema(pool: &PgPool) -> Result<(), sqlx::Error> {
    sqlx::raw_sql(SCHEMA).execute(pool).await?;
    Ok(())
}

/// Pool plus the runtime that drives it.
#[derive(Debug, Clone)]
pub struct Db {
    pool: Arc<PgPool>,
    handle: Handle,
}

impl Db {
    pub fn new(pool: PgPool, handle: Handle) -> Self {
        Self {
            pool: Arc::new(pool),
            handle,
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub(crate) fn block_on<F: Future>(&self, future: F) -> F::Output {
        self.handle.block_on(future)
    }
}

pub(crate) fn describe_sqlx_error(operation: &str, err: &sqlx::Error) -> String {
    match err {
        sqlx::Error::Database(db_err) => {
            format!("database error in {}: {}", operation, db_err.message())
        }
        sqlx::Error::PoolClosed => format!("connection pool closed in {}", operation),
        other => format!("sqlx error in {}: {}", operation, other),
    }
}

/// Check if an error is a unique constraint violation.
pub(crate) fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Database(db_err) if db_err.code().as_deref() == Some("23505")
    )
}

/// Postgres integer columns are signed.
pub(crate) fn to_i32(value: u32) -> i32 {
    i32::try_from(value).unwrap_or(i32::MAX)
}

pub(crate) fn to_u32(value: i32) -> u32 {
    u32::try_from(value).unwrap_or(0)
}
