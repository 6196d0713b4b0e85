//! Infrastructure layer: job queue, idempotency, dead letters, persistence,
//! the pipeline command layer and the worker loop.

pub mod command_dispatcher;
pub mod config;
pub mod db;
pub mod dlq;
pub mod idempotency;
pub mod integrations;
pub mod jobs;
pub mod pipeline;
pub mod reliability;
pub mod workers;
