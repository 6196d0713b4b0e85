//! Durable job queue with leased claims, bounded retry and dead-letter parking.
//!
//! ## Lifecycle
//!
//! ```text
//! queued ──claim──► running ──ack──► succeeded
//!   ▲                 │
//!   └──reschedule─────┤ (retryable, attempts left)
//!                     └──fail──► failed ──move_to_dlq──► dead_letter
//! ```
//!
//! A running job whose lease expires without a heartbeat is claimable again,
//! which is what makes delivery at-least-once.
//!
//! ## Components
//!
//! - `JobQueue`: queue contract
//! - `InMemoryJobQueue`: process-local queue for tests and single-node runs
//! - `PostgresJobQueue`: `FOR UPDATE SKIP LOCKED` claims over the `jobs` table
//! - `Job`: materialized job carrying its idempotency key and trace id

pub mod postgres;
pub mod queue;
#[cfg(test)]
pub(crate) mod testing;
pub mod types;

pub use postgres::PostgresJobQueue;
pub use queue::{InMemoryJobQueue, JobQueue, QueueError, DEFAULT_LEASE_SECS};
pub use types::{
    ClaimedJob, FailureOutcome, Job, JobKind, NewJob, QueueStats, QueuedJob,
    CORRELATION_ID_FIELD, IDEMPOTENCY_KEY_FIELD, TASK_SUBJECT, TRACE_ID_FIELD,
};
