//! Pipeline commands (application-level orchestration).
//!
//! This module is the command layer the worker and operators call into. It
//! composes the persistence ports, the job queue and the stage integrations
//! around the [`PipelineState`] state machine.
//!
//! ## Tick Flow
//!
//! ```text
//! tick(task)
//!   ↓
//! 1. Load pipeline state (done → Done, dead letter → error)
//!   ↓
//! 2. mark_running, persist
//!   ↓
//! 3. Run the integration bound to the current stage
//!   ↓
//! 4a. Success: write task output, mark_succeeded (advances stage), persist
//! 4b. Failure: mark_failed; anything but a transient failure the
//!     integration itself calls retryable also moves to dead letter
//! ```
//!
//! Enqueueing the follow-up job and acknowledging the current one are the
//! worker's business; `tick` only reports what happened.
//!
//! Every state change is emitted as an audit event (`target: "audit"`).

use std::sync::Arc;

use serde::Serialize;
use tracing::{info, warn};

use carpipe_core::{
    ActorId, Clock, DomainError, ErrorKind, InvalidTransition, JobId, JobStatus, PipelineStage,
    PipelineState, SystemClock, TaskId, TraceContext,
};

use crate::integrations::IntegrationRegistry;
use crate::jobs::{JobQueue, QueueError};
use crate::pipeline::{
    PipelineStateRepository, RepositoryError, TaskOutput, TaskOutputStore, TaskRegistry,
};

#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error("task not found: {0}")]
    NotFound(TaskId),
    /// State machine refused the change; a programming error in correct operation.
    #[error(transparent)]
    InvalidTransition(#[from] InvalidTransition),
    #[error("invalid state: {0}")]
    InvalidState(String),
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("no integration registered for stage {0}")]
    MissingIntegration(PipelineStage),
    #[error(transparent)]
    Domain(#[from] DomainError),
    #[error("repository error: {0}")]
    Repository(RepositoryError),
    #[error("queue error: {0}")]
    Queue(#[from] QueueError),
}

impl From<RepositoryError> for CommandError {
    fn from(value: RepositoryError) -> Self {
        match value {
            RepositoryError::NotFound(task_id) => CommandError::NotFound(task_id),
            other => CommandError::Repository(other),
        }
    }
}

/// What a tick did to the task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TickOutcome {
    /// `cleanup` already succeeded; nothing was run.
    Done { stage: PipelineStage },
    /// The stage succeeded. `next` is `None` once the pipeline is done.
    Advanced {
        completed: PipelineStage,
        next: Option<PipelineStage>,
    },
    /// The stage's integration failed.
    Failed {
        stage: PipelineStage,
        error_kind: ErrorKind,
        retryable: bool,
    },
}

/// Command layer over a task's pipeline.
#[derive(Clone)]
pub struct PipelineCommands {
    states: Arc<dyn PipelineStateRepository>,
    outputs: Arc<dyn TaskOutputStore>,
    tasks: Arc<dyn TaskRegistry>,
    queue: Arc<dyn JobQueue>,
    integrations: IntegrationRegistry,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for PipelineCommands {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineCommands")
            .field("integrations", &self.integrations)
            .finish_non_exhaustive()
    }
}

impl PipelineCommands {
    pub fn new(
        states: Arc<dyn PipelineStateRepository>,
        outputs: Arc<dyn TaskOutputStore>,
        tasks: Arc<dyn TaskRegistry>,
        queue: Arc<dyn JobQueue>,
        integrations: IntegrationRegistry,
    ) -> Self {
        Self {
            states,
            outputs,
            tasks,
            queue,
            integrations,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn queue(&self) -> &Arc<dyn JobQueue> {
        &self.queue
    }

    /// Create a task, or return the existing one when the same actor repeats
    /// the same idempotency key. A new task starts at `(parse, queued)` with
    /// its first advance job enqueued. Repeating the call for a task that
    /// never started re-enqueues that job, so a failed first enqueue is
    /// recovered by retrying the request.
    pub fn create_task(
        &self,
        actor_id: &ActorId,
        idempotency_key: &str,
        trace: &TraceContext,
    ) -> Result<TaskId, CommandError> {
        if idempotency_key.trim().is_empty() {
            return Err(DomainError::validation("idempotency key must not be empty").into());
        }

        if let Some(existing) = self.tasks.find_by_idempotency_key(actor_id, idempotency_key)? {
            info!(
                task_id = %existing,
                actor_id = %actor_id,
                trace_id = %trace,
                "task already exists for idempotency key"
            );
            self.ensure_started(&existing, trace)?;
            return Ok(existing);
        }

        let candidate = TaskId::generate();
        let task_id = self.tasks.register(actor_id, idempotency_key, &candidate)?;
        if task_id != candidate {
            self.ensure_started(&task_id, trace)?;
            return Ok(task_id);
        }

        self.states.save(&PipelineState::create(task_id.clone()))?;
        self.queue.enqueue_advance(&task_id, trace)?;

        info!(
            target: "audit",
            action = "task.created",
            task_id = %task_id,
            actor_id = %actor_id,
            trace_id = %trace
        );
        Ok(task_id)
    }

    /// Run the integration for the task's current stage and record the result.
    pub fn tick(
        &self,
        task_id: &TaskId,
        trace: &TraceContext,
    ) -> Result<TickOutcome, CommandError> {
        let mut state = self.states.get(task_id)?;

        if state.is_done() {
            return Ok(TickOutcome::Done {
                stage: state.stage(),
            });
        }
        if state.is_in_dead_letter() {
            return Err(CommandError::InvalidState(format!(
                "pipeline for task {task_id} is in dead letter"
            )));
        }

        let stage = state.stage();
        let integration = self
            .integrations
            .for_stage(stage)
            .ok_or(CommandError::MissingIntegration(stage))?;

        state.mark_running()?;
        self.states.save(&state)?;

        let result = integration.run(task_id, trace);

        if result.is_success() {
            self.outputs.write(TaskOutput {
                task_id: task_id.clone(),
                stage,
                payload: result.into_payload(),
                recorded_at: self.clock.now(),
            })?;
            state.mark_succeeded()?;
            self.states.save(&state)?;

            let next = (!state.is_done()).then(|| state.stage());
            info!(
                target: "audit",
                action = "pipeline.stage.succeeded",
                task_id = %task_id,
                stage = %stage,
                next_stage = ?next.map(PipelineStage::as_str),
                trace_id = %trace
            );
            return Ok(TickOutcome::Advanced {
                completed: stage,
                next,
            });
        }

        let error_kind = result.error_kind().unwrap_or(ErrorKind::Unknown);
        // Only an unavailable integration that reports itself retryable is retried.
        let retryable = error_kind == ErrorKind::Transient && result.is_retryable();
        state.mark_failed(error_kind)?;
        if !retryable {
            state.move_to_dead_letter()?;
        }
        self.states.save(&state)?;

        warn!(
            target: "audit",
            action = "pipeline.stage.failed",
            task_id = %task_id,
            stage = %stage,
            error_kind = %error_kind,
            retryable,
            attempt = state.attempt_count(),
            trace_id = %trace
        );
        if !retryable {
            self.audit_dead_lettered(&state, trace);
        }

        Ok(TickOutcome::Failed {
            stage,
            error_kind,
            retryable,
        })
    }

    /// Re-queue a failed stage after the queue rescheduled its job.
    pub fn schedule_retry(&self, task_id: &TaskId) -> Result<PipelineState, CommandError> {
        let mut state = self.states.get(task_id)?;
        state.schedule_retry()?;
        self.states.save(&state)?;
        Ok(state)
    }

    /// Park the pipeline in dead letter. Already dead-lettered pipelines are left as is.
    pub fn dead_letter(
        &self,
        task_id: &TaskId,
        trace: &TraceContext,
    ) -> Result<PipelineState, CommandError> {
        let mut state = self.states.get(task_id)?;
        if state.is_in_dead_letter() {
            return Ok(state);
        }
        state.move_to_dead_letter()?;
        self.states.save(&state)?;
        self.audit_dead_lettered(&state, trace);
        Ok(state)
    }

    /// Operator retry. A failed pipeline is re-queued; a dead-lettered one is
    /// rescued only with `allow_dead_letter_override`. Either way a fresh
    /// advance job is enqueued and its id returned.
    pub fn retry_task(
        &self,
        task_id: &TaskId,
        allow_dead_letter_override: bool,
        trace: &TraceContext,
    ) -> Result<JobId, CommandError> {
        let mut state = self.states.get(task_id)?;

        if state.is_in_dead_letter() {
            if !allow_dead_letter_override {
                return Err(CommandError::PermissionDenied(
                    "cannot retry a dead-lettered task without explicit override".to_string(),
                ));
            }
            state.rescue_from_dead_letter()?;
            info!(
                target: "audit",
                action = "pipeline.rescued",
                task_id = %task_id,
                stage = %state.stage(),
                trace_id = %trace
            );
        } else {
            state.schedule_retry()?;
            info!(
                target: "audit",
                action = "pipeline.retry.invoked",
                task_id = %task_id,
                stage = %state.stage(),
                trace_id = %trace
            );
        }

        self.states.save(&state)?;
        Ok(self.queue.enqueue_advance(task_id, trace)?)
    }

    pub fn state(&self, task_id: &TaskId) -> Result<PipelineState, CommandError> {
        Ok(self.states.get(task_id)?)
    }

    pub fn outputs(&self, task_id: &TaskId) -> Result<Vec<TaskOutput>, CommandError> {
        Ok(self.outputs.read(task_id)?)
    }

    /// Make sure a registered task that never ran has its state and first
    /// advance job. A still-queued job is reused by the queue.
    fn ensure_started(&self, task_id: &TaskId, trace: &TraceContext) -> Result<(), CommandError> {
        match self.states.find(task_id)? {
            Some(state) => {
                let unstarted = state.stage() == PipelineStage::Parse
                    && state.status() == JobStatus::Queued
                    && state.attempt_count() == 0;
                if unstarted {
                    self.queue.enqueue_advance(task_id, trace)?;
                }
            }
            None => {
                self.states.save(&PipelineState::create(task_id.clone()))?;
                self.queue.enqueue_advance(task_id, trace)?;
            }
        }
        Ok(())
    }

    fn audit_dead_lettered(&self, state: &PipelineState, trace: &TraceContext) {
        debug_assert_eq!(state.status(), JobStatus::DeadLetter);
        warn!(
            target: "audit",
            action = "pipeline.dead_lettered",
            task_id = %state.task_id(),
            stage = %state.stage(),
            error_kind = ?state.last_error().map(ErrorKind::as_str),
            trace_id = %trace
        );
    }
}
