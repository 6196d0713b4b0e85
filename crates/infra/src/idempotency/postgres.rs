//! Postgres-backed idempotency store.
//!
//! `acquire` is a single `INSERT .. ON CONFLICT` statement, so two workers
//! racing on the same key cannot both win. A claim is identified by the
//! row's `acquired_at`; `release` deletes only a row that still carries it.

use std::sync::Arc;

use sqlx::Row;
use tracing::instrument;

use carpipe_core::{Clock, SystemClock};

use super::{
    check_key, IdempotencyError, IdempotencyStore, KeyClaim, KeyState, DEFAULT_IN_FLIGHT_TTL_SECS,
};
use crate::db::{describe_sqlx_error, Db};

pub struct PostgresIdempotencyStore {
    db: Db,
    clock: Arc<dyn Clock>,
    in_flight_ttl: chrono::Duration,
}

impl PostgresIdempotencyStore {
    pub fn new(db: Db) -> Self {
        Self {
            db,
            clock: Arc::new(SystemClock),
            in_flight_ttl: chrono::Duration::seconds(DEFAULT_IN_FLIGHT_TTL_SECS),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_in_flight_ttl(mut self, ttl: chrono::Duration) -> Self {
        self.in_flight_ttl = ttl;
        self
    }

    #[instrument(skip(self), err)]
    async fn acquire_key(&self, key: &str) -> Result<Option<KeyClaim>, IdempotencyError> {
        let now = self.clock.now();
        let claim = KeyClaim::new(key, now);
        let row = sqlx::query(
            r#"
            INSERT INTO idempotency_keys (key, state, acquired_at)
            VALUES ($1, 'in_flight', $2)
            ON CONFLICT (key) DO UPDATE
                SET acquired_at = EXCLUDED.acquired_at
                WHERE idempotency_keys.state = 'in_flight'
                  AND idempotency_keys.acquired_at <= $3
            RETURNING key
            "#,
        )
        .bind(key)
        .bind(claim.acquired_at())
        .bind(now - self.in_flight_ttl)
        .fetch_optional(self.db.pool())
        .await
        .map_err(|e| map_sqlx_error("acquire", e))?;
        Ok(row.map(|_| claim))
    }

    #[instrument(skip(self, claim), fields(key = %claim.key()), err)]
    async fn commit_key(&self, claim: &KeyClaim) -> Result<bool, IdempotencyError> {
        let mut tx = self
            .db
            .pool()
            .begin()
            .await
            .map_err(|e| map_sqlx_error("commit", e))?;

        let current = sqlx::query(
            "SELECT state, acquired_at FROM idempotency_keys WHERE key = $1 FOR UPDATE",
        )
        .bind(claim.key())
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("commit", e))?;

        let held = match current {
            Some(row) => {
                let acquired_at: chrono::DateTime<chrono::Utc> = row
                    .try_get("acquired_at")
                    .map_err(|e| map_sqlx_error("commit", e))?;
                acquired_at == claim.acquired_at()
            }
            None => false,
        };

        sqlx::query(
            r#"
            INSERT INTO idempotency_keys (key, state, acquired_at, committed_at)
            VALUES ($1, 'committed', $2, $3)
            ON CONFLICT (key) DO UPDATE
                SET state = 'committed', committed_at = EXCLUDED.committed_at
            "#,
        )
        .bind(claim.key())
        .bind(claim.acquired_at())
        .bind(self.clock.now())
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("commit", e))?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit", e))?;
        Ok(held)
    }

    #[instrument(skip(self, claim), fields(key = %claim.key()), err)]
    async fn release_key(&self, claim: &KeyClaim) -> Result<bool, IdempotencyError> {
        let result = sqlx::query(
            r#"
            DELETE FROM idempotency_keys
            WHERE key = $1 AND state = 'in_flight' AND acquired_at = $2
            "#,
        )
        .bind(claim.key())
        .bind(claim.acquired_at())
        .execute(self.db.pool())
        .await
        .map_err(|e| map_sqlx_error("release", e))?;
        Ok(result.rows_affected() > 0)
    }

    async fn key_state(&self, key: &str) -> Result<Option<KeyState>, IdempotencyError> {
        let row = sqlx::query("SELECT state FROM idempotency_keys WHERE key = $1")
            .bind(key)
            .fetch_optional(self.db.pool())
            .await
            .map_err(|e| map_sqlx_error("state", e))?;

        match row {
            Some(row) => {
                let state: String = row
                    .try_get("state")
                    .map_err(|e| map_sqlx_error("state", e))?;
                Ok(Some(state.parse()?))
            }
            None => Ok(None),
        }
    }
}

impl IdempotencyStore for PostgresIdempotencyStore {
    fn acquire(&self, key: &str) -> Result<Option<KeyClaim>, IdempotencyError> {
        check_key(key)?;
        self.db.block_on(self.acquire_key(key))
    }

    fn commit(&self, claim: &KeyClaim) -> Result<bool, IdempotencyError> {
        check_key(claim.key())?;
        self.db.block_on(self.commit_key(claim))
    }

    fn release(&self, claim: &KeyClaim) -> Result<bool, IdempotencyError> {
        check_key(claim.key())?;
        self.db.block_on(self.release_key(claim))
    }

    fn state(&self, key: &str) -> Result<Option<KeyState>, IdempotencyError> {
        self.db.block_on(self.key_state(key))
    }
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> IdempotencyError {
    IdempotencyError::Storage(describe_sqlx_error(operation, &err))
}
