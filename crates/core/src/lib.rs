//! `carpipe-core`: domain building blocks for the listing pipeline.
//!
//! This crate contains **pure domain** primitives (no infrastructure concerns):
//! identifiers, the error taxonomy, the retry policy and the per-task stage
//! state machine.

pub mod clock;
pub mod entity;
pub mod error;
pub mod error_kind;
pub mod id;
pub mod integration;
pub mod pipeline;
pub mod retry;
pub mod trace;

pub use clock::{Clock, ManualClock, SystemClock};
pub use entity::Entity;
pub use error::{DomainError, DomainResult, InvalidTransition};
pub use error_kind::{ErrorClassifier, ErrorKind, JobError};
pub use id::{ActorId, JobId, TaskId};
pub use integration::IntegrationResult;
pub use pipeline::{JobStatus, PipelineStage, PipelineState};
pub use retry::RetryPolicy;
pub use trace::TraceContext;
