//! Dead-letter records for terminally failed jobs.
//!
//! Records are append-only: one per terminal failure event, so a job that is
//! rescued and fails again produces a second record. Writers never make a
//! caller fail twice: use [`record_dead_letter`], which logs write errors
//! instead of propagating them.

pub mod file;

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use tracing::error;

use carpipe_core::JobError;

use crate::jobs::Job;

pub use file::FileDeadLetterWriter;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DlqRecord {
    pub job_type: String,
    pub subject_type: String,
    pub subject_id: String,
    pub attempts: u32,
    pub trace_id: String,
    pub idempotency_key: String,
    pub payload: Map<String, JsonValue>,
    pub error: JobError,
    pub failed_at: DateTime<Utc>,
}

impl DlqRecord {
    pub fn new(job: &Job, error: JobError, attempts: u32, failed_at: DateTime<Utc>) -> Self {
        Self {
            job_type: job.kind().to_string(),
            subject_type: job.subject_type().to_string(),
            subject_id: job.subject_id().to_string(),
            attempts,
            trace_id: job.trace_id().to_string(),
            idempotency_key: job.idempotency_key().to_string(),
            payload: job.payload().clone(),
            error,
            failed_at,
        }
    }
}

pub trait DeadLetterWriter: Send + Sync {
    /// Durably append one record.
    fn write(&self, record: &DlqRecord) -> Result<(), DlqError>;
}

#[derive(Debug, thiserror::Error)]
pub enum DlqError {
    #[error("dead-letter io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("dead-letter encoding error: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Write `record`, logging rather than returning any failure.
pub fn record_dead_letter(writer: &dyn DeadLetterWriter, record: &DlqRecord) {
    if let Err(err) = writer.write(record) {
        error!(
            job_type = %record.job_type,
            subject_id = %record.subject_id,
            trace_id = %record.trace_id,
            error = %err,
            "failed to write dead-letter record"
        );
    }
}

/// In-memory dead-letter sink for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryDeadLetters {
    records: Mutex<Vec<DlqRecord>>,
}

impl InMemoryDeadLetters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// All records, oldest first.
    pub fn records(&self) -> Vec<DlqRecord> {
        self.records.lock().unwrap().clone()
    }

    pub fn len(&self) -> usize {
        self.records.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl DeadLetterWriter for InMemoryDeadLetters {
    fn write(&self, record: &DlqRecord) -> Result<(), DlqError> {
        self.records.lock().unwrap().push(record.clone());
        Ok(())
    }
}

impl<W: DeadLetterWriter + ?Sized> DeadLetterWriter for Arc<W> {
    fn write(&self, record: &DlqRecord) -> Result<(), DlqError> {
        (**self).write(record)
    }
}
