//! Postgres-backed pipeline persistence.

use std::sync::Arc;

use serde_json::{Map, Value as JsonValue};
use sqlx::{postgres::PgRow, Row};
use tracing::instrument;

use carpipe_core::{
    ActorId, Clock, ErrorKind, JobStatus, PipelineStage, PipelineState, SystemClock, TaskId,
};

use super::{PipelineStateRepository, RepositoryError, TaskOutput, TaskOutputStore, TaskRegistry};
use crate::db::{describe_sqlx_error, to_i32, to_u32, Db};

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> RepositoryError {
    RepositoryError::Storage(describe_sqlx_error(operation, &err))
}

fn decode<T: std::str::FromStr>(column: &str, value: &str) -> Result<T, RepositoryError>
where
    T::Err: std::fmt::Display,
{
    value
        .parse()
        .map_err(|e: T::Err| RepositoryError::Storage(format!("invalid {column} {value:?}: {e}")))
}

#[derive(Debug, Clone)]
pub struct PostgresPipelineStateRepository {
    db: Db,
    clock: Arc<dyn Clock>,
}

impl PostgresPipelineStateRepository {
    pub fn new(db: Db) -> Self {
        Self {
            db,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    #[instrument(skip(self), fields(task_id = %task_id), err)]
    async fn load(&self, task_id: &TaskId) -> Result<Option<PipelineState>, RepositoryError> {
        let row = sqlx::query(
            r#"
            SELECT task_id, stage, status, attempt, last_error_kind
            FROM pipeline_states
            WHERE task_id = $1
            "#,
        )
        .bind(task_id.as_str())
        .fetch_optional(self.db.pool())
        .await
        .map_err(|e| map_sqlx_error("load_pipeline_state", e))?;

        row.map(|row| state_from_row(&row)).transpose()
    }

    #[instrument(skip(self, state), fields(task_id = %state.task_id()), err)]
    async fn store(&self, state: &PipelineState) -> Result<(), RepositoryError> {
        sqlx::query(
            r#"
            INSERT INTO pipeline_states
                (task_id, stage, status, attempt, last_error_kind, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (task_id) DO UPDATE SET
                stage = EXCLUDED.stage,
                status = EXCLUDED.status,
                attempt = EXCLUDED.attempt,
                last_error_kind = EXCLUDED.last_error_kind,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(state.task_id().as_str())
        .bind(state.stage().as_str())
        .bind(state.status().as_str())
        .bind(to_i32(state.attempt_count()))
        .bind(state.last_error().map(ErrorKind::as_str))
        .bind(self.clock.now())
        .execute(self.db.pool())
        .await
        .map_err(|e| map_sqlx_error("save_pipeline_state", e))?;
        Ok(())
    }
}

fn state_from_row(row: &PgRow) -> Result<PipelineState, RepositoryError> {
    let get = |e| map_sqlx_error("decode_pipeline_state", e);
    let task_id: String = row.try_get("task_id").map_err(get)?;
    let stage: String = row.try_get("stage").map_err(get)?;
    let status: String = row.try_get("status").map_err(get)?;
    let attempt: i32 = row.try_get("attempt").map_err(get)?;
    let last_error: Option<String> = row.try_get("last_error_kind").map_err(get)?;

    Ok(PipelineState::restore(
        decode::<TaskId>("task_id", &task_id)?,
        decode::<PipelineStage>("stage", &stage)?,
        decode::<JobStatus>("status", &status)?,
        to_u32(attempt),
        last_error
            .as_deref()
            .map(|kind| decode::<ErrorKind>("last_error_kind", kind))
            .transpose()?,
    ))
}

impl PipelineStateRepository for PostgresPipelineStateRepository {
    fn find(&self, task_id: &TaskId) -> Result<Option<PipelineState>, RepositoryError> {
        self.db.block_on(self.load(task_id))
    }

    fn save(&self, state: &PipelineState) -> Result<(), RepositoryError> {
        self.db.block_on(self.store(state))
    }
}

#[derive(Debug, Clone)]
pub struct PostgresTaskOutputStore {
    db: Db,
}

impl PostgresTaskOutputStore {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    async fn insert(&self, output: TaskOutput) -> Result<(), RepositoryError> {
        sqlx::query(
            r#"
            INSERT INTO task_outputs (task_id, stage, payload, recorded_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (task_id, stage) DO UPDATE SET
                payload = EXCLUDED.payload,
                recorded_at = EXCLUDED.recorded_at
            "#,
        )
        .bind(output.task_id.as_str())
        .bind(output.stage.as_str())
        .bind(JsonValue::Object(output.payload))
        .bind(output.recorded_at)
        .execute(self.db.pool())
        .await
        .map_err(|e| map_sqlx_error("write_task_output", e))?;
        Ok(())
    }

    async fn select(&self, task_id: &TaskId) -> Result<Vec<TaskOutput>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT stage, payload, recorded_at FROM task_outputs WHERE task_id = $1",
        )
        .bind(task_id.as_str())
        .fetch_all(self.db.pool())
        .await
        .map_err(|e| map_sqlx_error("read_task_outputs", e))?;

        let get = |e| map_sqlx_error("decode_task_output", e);
        let mut outputs = Vec::with_capacity(rows.len());
        for row in rows {
            let stage: String = row.try_get("stage").map_err(get)?;
            let payload: JsonValue = row.try_get("payload").map_err(get)?;
            outputs.push(TaskOutput {
                task_id: task_id.clone(),
                stage: decode("stage", &stage)?,
                payload: match payload {
                    JsonValue::Object(map) => map,
                    _ => Map::new(),
                },
                recorded_at: row.try_get("recorded_at").map_err(get)?,
            });
        }
        outputs.sort_by_key(|o| o.stage);
        Ok(outputs)
    }
}

impl TaskOutputStore for PostgresTaskOutputStore {
    fn write(&self, output: TaskOutput) -> Result<(), RepositoryError> {
        self.db.block_on(self.insert(output))
    }

    fn read(&self, task_id: &TaskId) -> Result<Vec<TaskOutput>, RepositoryError> {
        self.db.block_on(self.select(task_id))
    }
}

#[derive(Debug, Clone)]
pub struct PostgresTaskRegistry {
    db: Db,
}

impl PostgresTaskRegistry {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    async fn lookup(
        &self,
        actor_id: &ActorId,
        idempotency_key: &str,
    ) -> Result<Option<TaskId>, RepositoryError> {
        let row = sqlx::query(
            "SELECT task_id FROM tasks WHERE actor_id = $1 AND idempotency_key = $2",
        )
        .bind(actor_id.as_str())
        .bind(idempotency_key)
        .fetch_optional(self.db.pool())
        .await
        .map_err(|e| map_sqlx_error("find_task", e))?;

        match row {
            Some(row) => {
                let id: String = row
                    .try_get("task_id")
                    .map_err(|e| map_sqlx_error("decode_task", e))?;
                Ok(Some(decode("task_id", &id)?))
            }
            None => Ok(None),
        }
    }

    async fn insert(
        &self,
        actor_id: &ActorId,
        idempotency_key: &str,
        task_id: &TaskId,
    ) -> Result<TaskId, RepositoryError> {
        sqlx::query(
            r#"
            INSERT INTO tasks (task_id, actor_id, idempotency_key, created_at)
            VALUES ($1, $2, $3, now())
            ON CONFLICT (actor_id, idempotency_key) DO NOTHING
            "#,
        )
        .bind(task_id.as_str())
        .bind(actor_id.as_str())
        .bind(idempotency_key)
        .execute(self.db.pool())
        .await
        .map_err(|e| map_sqlx_error("register_task", e))?;

        self.lookup(actor_id, idempotency_key)
            .await?
            .ok_or_else(|| RepositoryError::NotFound(task_id.clone()))
    }
}

impl TaskRegistry for PostgresTaskRegistry {
    fn find_by_idempotency_key(
        &self,
        actor_id: &ActorId,
        idempotency_key: &str,
    ) -> Result<Option<TaskId>, RepositoryError> {
        self.db.block_on(self.lookup(actor_id, idempotency_key))
    }

    fn register(
        &self,
        actor_id: &ActorId,
        idempotency_key: &str,
        task_id: &TaskId,
    ) -> Result<TaskId, RepositoryError> {
        self.db.block_on(self.insert(actor_id, idempotency_key, task_id))
    }
}
