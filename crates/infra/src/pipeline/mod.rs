//! Persistence ports for task progress.
//!
//! - `PipelineStateRepository`: load/save a task's [`PipelineState`] by id
//! - `TaskOutputStore`: per-stage integration payloads
//! - `TaskRegistry`: `(actor, idempotency key) -> task` mapping for task creation
//!
//! In-memory implementations live here; Postgres ones in [`postgres`].

pub mod postgres;

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

use carpipe_core::{ActorId, Entity, PipelineStage, PipelineState, TaskId};

pub use postgres::{PostgresPipelineStateRepository, PostgresTaskOutputStore, PostgresTaskRegistry};

#[derive(Debug, Clone, thiserror::Error)]
pub enum RepositoryError {
    #[error("not found: {0}")]
    NotFound(TaskId),
    #[error("storage error: {0}")]
    Storage(String),
}

pub trait PipelineStateRepository: Send + Sync {
    fn find(&self, task_id: &TaskId) -> Result<Option<PipelineState>, RepositoryError>;

    /// Insert or overwrite the state for its task.
    fn save(&self, state: &PipelineState) -> Result<(), RepositoryError>;

    /// Like [`find`](Self::find), but a missing state is an error.
    fn get(&self, task_id: &TaskId) -> Result<PipelineState, RepositoryError> {
        self.find(task_id)?
            .ok_or_else(|| RepositoryError::NotFound(task_id.clone()))
    }
}

/// Payload produced by one successful stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskOutput {
    pub task_id: TaskId,
    pub stage: PipelineStage,
    pub payload: Map<String, JsonValue>,
    pub recorded_at: DateTime<Utc>,
}

pub trait TaskOutputStore: Send + Sync {
    /// Record a stage's payload; a rerun of the same stage overwrites it.
    fn write(&self, output: TaskOutput) -> Result<(), RepositoryError>;

    /// Outputs for a task in pipeline order.
    fn read(&self, task_id: &TaskId) -> Result<Vec<TaskOutput>, RepositoryError>;
}

pub trait TaskRegistry: Send + Sync {
    fn find_by_idempotency_key(
        &self,
        actor_id: &ActorId,
        idempotency_key: &str,
    ) -> Result<Option<TaskId>, RepositoryError>;

    /// Record `task_id` for the pair unless one already exists. Returns the
    /// task that owns the pair afterwards, which is the earlier one on a race.
    fn register(
        &self,
        actor_id: &ActorId,
        idempotency_key: &str,
        task_id: &TaskId,
    ) -> Result<TaskId, RepositoryError>;
}

/// In-memory repository keyed by [`Entity::Id`].
#[derive(Debug)]
pub struct InMemoryRepository<E: Entity> {
    rows: RwLock<HashMap<E::Id, E>>,
}

impl<E: Entity> InMemoryRepository<E> {
    pub fn new() -> Self {
        Self {
            rows: RwLock::new(HashMap::new()),
        }
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    pub fn len(&self) -> usize {
        self.rows.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<E: Entity> Default for InMemoryRepository<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: Entity + Clone> InMemoryRepository<E> {
    pub fn find_entity(&self, id: &E::Id) -> Option<E> {
        self.rows.read().unwrap().get(id).cloned()
    }

    pub fn save_entity(&self, entity: &E) {
        self.rows
            .write()
            .unwrap()
            .insert(entity.id().clone(), entity.clone());
    }
}

pub type InMemoryPipelineStates = InMemoryRepository<PipelineState>;

impl PipelineStateRepository for InMemoryRepository<PipelineState> {
    fn find(&self, task_id: &TaskId) -> Result<Option<PipelineState>, RepositoryError> {
        Ok(self.find_entity(task_id))
    }

    fn save(&self, state: &PipelineState) -> Result<(), RepositoryError> {
        self.save_entity(state);
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct InMemoryTaskOutputs {
    outputs: RwLock<HashMap<TaskId, HashMap<PipelineStage, TaskOutput>>>,
}

impl InMemoryTaskOutputs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }
}

impl TaskOutputStore for InMemoryTaskOutputs {
    fn write(&self, output: TaskOutput) -> Result<(), RepositoryError> {
        self.outputs
            .write()
            .unwrap()
            .entry(output.task_id.clone())
            .or_default()
            .insert(output.stage, output);
        Ok(())
    }

    fn read(&self, task_id: &TaskId) -> Result<Vec<TaskOutput>, RepositoryError> {
        let outputs = self.outputs.read().unwrap();
        let mut rows: Vec<_> = outputs
            .get(task_id)
            .map(|by_stage| by_stage.values().cloned().collect())
            .unwrap_or_default();
        rows.sort_by_key(|o| o.stage);
        Ok(rows)
    }
}

#[derive(Debug, Default)]
pub struct InMemoryTaskRegistry {
    keys: RwLock<HashMap<(ActorId, String), TaskId>>,
}

impl InMemoryTaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }
}

impl TaskRegistry for InMemoryTaskRegistry {
    fn find_by_idempotency_key(
        &self,
        actor_id: &ActorId,
        idempotency_key: &str,
    ) -> Result<Option<TaskId>, RepositoryError> {
        let keys = self.keys.read().unwrap();
        Ok(keys
            .get(&(actor_id.clone(), idempotency_key.to_string()))
            .cloned())
    }

    fn register(
        &self,
        actor_id: &ActorId,
        idempotency_key: &str,
        task_id: &TaskId,
    ) -> Result<TaskId, RepositoryError> {
        let mut keys = self.keys.write().unwrap();
        Ok(keys
            .entry((actor_id.clone(), idempotency_key.to_string()))
            .or_insert_with(|| task_id.clone())
            .clone())
    }
}

impl<R: PipelineStateRepository + ?Sized> PipelineStateRepository for Arc<R> {
    fn find(&self, task_id: &TaskId) -> Result<Option<PipelineState>, RepositoryError> {
        (**self).find(task_id)
    }

    fn save(&self, state: &PipelineState) -> Result<(), RepositoryError> {
        (**self).save(state)
    }
}

impl<S: TaskOutputStore + ?Sized> TaskOutputStore for Arc<S> {
    fn write(&self, output: TaskOutput) -> Result<(), RepositoryError> {
        (**self).write(output)
    }

    fn read(&self, task_id: &TaskId) -> Result<Vec<TaskOutput>, RepositoryError> {
        (**self).read(task_id)
    }
}

impl<R: TaskRegistry + ?Sized> TaskRegistry for Arc<R> {
    fn find_by_idempotency_key(
        &self,
        actor_id: &ActorId,
        idempotency_key: &str,
    ) -> Result<Option<TaskId>, RepositoryError> {
        (**self).find_by_idempotency_key(actor_id, idempotency_key)
    }

    fn register(
        &self,
        actor_id: &ActorId,
        idempotency_key: &str,
        task_id: &TaskId,
    ) -> Result<TaskId, RepositoryError> {
        (**self).register(actor_id, idempotency_key, task_id)
    }
}
