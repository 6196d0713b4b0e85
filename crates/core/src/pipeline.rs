//! Per-task pipeline stage state machine.
//!
//! A task walks `parse → photos → publish → export → cleanup`. The state is
//! only ever changed through the transition methods below; each one either
//! applies fully or returns [`InvalidTransition`] without touching the state.

use core::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::entity::Entity;
use crate::error::{DomainError, InvalidTransition};
use crate::error_kind::ErrorKind;
use crate::id::TaskId;

/// Ordered, closed set of pipeline stages.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStage {
    Parse,
    Photos,
    Publish,
    Export,
    Cleanup,
}

impl PipelineStage {
    pub const ALL: [PipelineStage; 5] = [
        PipelineStage::Parse,
        PipelineStage::Photos,
        PipelineStage::Publish,
        PipelineStage::Export,
        PipelineStage::Cleanup,
    ];

    /// The following stage; `None` for `Cleanup`, which is final.
    pub fn next(self) -> Option<PipelineStage> {
        match self {
            PipelineStage::Parse => Some(PipelineStage::Photos),
            PipelineStage::Photos => Some(PipelineStage::Publish),
            PipelineStage::Publish => Some(PipelineStage::Export),
            PipelineStage::Export => Some(PipelineStage::Cleanup),
            PipelineStage::Cleanup => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PipelineStage::Parse => "parse",
            PipelineStage::Photos => "photos",
            PipelineStage::Publish => "publish",
            PipelineStage::Export => "export",
            PipelineStage::Cleanup => "cleanup",
        }
    }
}

impl core::fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PipelineStage {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        PipelineStage::ALL
            .into_iter()
            .find(|stage| stage.as_str() == s)
            .ok_or_else(|| DomainError::validation(format!("unknown pipeline stage: {s}")))
    }
}

/// Execution status shared by pipeline states and queued jobs.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
    DeadLetter,
}

impl JobStatus {
    pub const ALL: [JobStatus; 5] = [
        JobStatus::Queued,
        JobStatus::Running,
        JobStatus::Succeeded,
        JobStatus::Failed,
        JobStatus::DeadLetter,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Succeeded => "succeeded",
            JobStatus::Failed => "failed",
            JobStatus::DeadLetter => "dead_letter",
        }
    }
}

impl core::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| DomainError::validation(format!("unknown job status: {s}")))
    }
}

const ENTITY: &str = "PipelineState";

/// Progress record of one task. Never deleted: it is the task's audit trail.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineState {
    task_id: TaskId,
    stage: PipelineStage,
    status: JobStatus,
    attempt_count: u32,
    last_error: Option<ErrorKind>,
}

impl PipelineState {
    /// Fresh state for a newly created task: `(parse, queued, 0, none)`.
    pub fn create(task_id: TaskId) -> Self {
        Self {
            task_id,
            stage: PipelineStage::Parse,
            status: JobStatus::Queued,
            attempt_count: 0,
            last_error: None,
        }
    }

    /// Rebuild a state loaded from storage.
    pub fn restore(
        task_id: TaskId,
        stage: PipelineStage,
        status: JobStatus,
        attempt_count: u32,
        last_error: Option<ErrorKind>,
    ) -> Self {
        Self {
            task_id,
            stage,
            status,
            attempt_count,
            last_error,
        }
    }

    pub fn task_id(&self) -> &TaskId {
        &self.task_id
    }

    pub fn stage(&self) -> PipelineStage {
        self.stage
    }

    pub fn status(&self) -> JobStatus {
        self.status
    }

    pub fn attempt_count(&self) -> u32 {
        self.attempt_count
    }

    pub fn last_error(&self) -> Option<ErrorKind> {
        self.last_error
    }

    /// `cleanup` has succeeded. Not terminal for the state machine itself.
    pub fn is_done(&self) -> bool {
        self.stage == PipelineStage::Cleanup && self.status == JobStatus::Succeeded
    }

    pub fn is_in_dead_letter(&self) -> bool {
        self.status == JobStatus::DeadLetter
    }

    pub fn start(&mut self) -> Result<(), InvalidTransition> {
        self.guard_not_terminal("start")?;
        self.status = JobStatus::Queued;
        self.attempt_count = 0;
        self.last_error = None;
        Ok(())
    }

    pub fn mark_running(&mut self) -> Result<(), InvalidTransition> {
        self.guard_not_terminal(JobStatus::Running.as_str())?;
        self.status = JobStatus::Running;
        self.attempt_count += 1;
        Ok(())
    }

    /// Completes the current stage and, unless it was `cleanup`, queues the next one.
    pub fn mark_succeeded(&mut self) -> Result<(), InvalidTransition> {
        self.guard_not_terminal(JobStatus::Succeeded.as_str())?;
        self.status = JobStatus::Succeeded;
        self.last_error = None;

        if let Some(next) = self.stage.next() {
            self.stage = next;
            self.status = JobStatus::Queued;
            self.attempt_count = 0;
        }
        Ok(())
    }

    pub fn mark_failed(&mut self, error: ErrorKind) -> Result<(), InvalidTransition> {
        self.guard_not_terminal(JobStatus::Failed.as_str())?;
        self.status = JobStatus::Failed;
        self.last_error = Some(error);
        Ok(())
    }

    /// Re-queue a failed stage. The attempt count is preserved.
    pub fn schedule_retry(&mut self) -> Result<(), InvalidTransition> {
        self.guard_not_terminal("retry")?;
        if self.status != JobStatus::Failed {
            return Err(self.refuse("retry"));
        }
        self.status = JobStatus::Queued;
        Ok(())
    }

    pub fn move_to_dead_letter(&mut self) -> Result<(), InvalidTransition> {
        self.guard_not_terminal(JobStatus::DeadLetter.as_str())?;
        self.status = JobStatus::DeadLetter;
        Ok(())
    }

    /// Manual rescue: restart the stage the task was on.
    pub fn rescue_from_dead_letter(&mut self) -> Result<(), InvalidTransition> {
        if !self.is_in_dead_letter() {
            return Err(self.refuse("rescue from dead letter"));
        }
        self.status = JobStatus::Queued;
        self.attempt_count = 0;
        self.last_error = None;
        Ok(())
    }

    fn guard_not_terminal(&self, to: &str) -> Result<(), InvalidTransition> {
        if self.is_in_dead_letter() {
            return Err(self.refuse(to));
        }
        Ok(())
    }

    fn refuse(&self, to: &str) -> InvalidTransition {
        InvalidTransition::new(ENTITY, format!("{}:{}", self.stage, self.status), to)
    }
}

impl Entity for PipelineState {
    type Id = TaskId;

    fn id(&self) -> &TaskId {
        &self.task_id
    }
}
