//! Background workers.

pub mod pipeline_worker;

pub use pipeline_worker::{
    PipelineWorker, PipelineWorkerConfig, WorkerError, WorkerHandle, WorkerStats,
};
