//! Queue wrapper that fails a chosen enqueue call.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use carpipe_core::{ErrorKind, JobId, JobStatus};

use super::queue::{InMemoryJobQueue, JobQueue, QueueError};
use super::types::{ClaimedJob, FailureOutcome, NewJob, QueueStats, QueuedJob};

pub(crate) struct FlakyEnqueue {
    inner: Arc<InMemoryJobQueue>,
    calls: AtomicUsize,
    fail_on: usize,
}

impl FlakyEnqueue {
    /// The `fail_on`-th enqueue (1-indexed) returns a storage error.
    pub(crate) fn new(inner: Arc<InMemoryJobQueue>, fail_on: usize) -> Arc<Self> {
        Arc::new(Self {
            inner,
            calls: AtomicUsize::new(0),
            fail_on,
        })
    }
}

impl JobQueue for FlakyEnqueue {
    fn enqueue(&self, job: NewJob) -> Result<JobId, QueueError> {
        if self.calls.fetch_add(1, Ordering::SeqCst) + 1 == self.fail_on {
            return Err(QueueError::Storage("blip".to_string()));
        }
        self.inner.enqueue(job)
    }

    fn claim_next(&self) -> Result<Option<ClaimedJob>, QueueError> {
        self.inner.claim_next()
    }

    fn heartbeat(&self, job_id: &JobId) -> Result<(), QueueError> {
        self.inner.heartbeat(job_id)
    }

    fn mark_succeeded(&self, job_id: &JobId) -> Result<(), QueueError> {
        self.inner.mark_succeeded(job_id)
    }

    fn mark_failed(
        &self,
        job_id: &JobId,
        kind: ErrorKind,
        retryable: bool,
    ) -> Result<FailureOutcome, QueueError> {
        self.inner.mark_failed(job_id, kind, retryable)
    }

    fn move_to_dlq(&self, job_id: &JobId, kind: ErrorKind) -> Result<(), QueueError> {
        self.inner.move_to_dlq(job_id, kind)
    }

    fn get(&self, job_id: &JobId) -> Result<Option<QueuedJob>, QueueError> {
        self.inner.get(job_id)
    }

    fn list_by_status(
        &self,
        status: JobStatus,
        limit: usize,
    ) -> Result<Vec<QueuedJob>, QueueError> {
        self.inner.list_by_status(status, limit)
    }

    fn stats(&self) -> Result<QueueStats, QueueError> {
        self.inner.stats()
    }
}
