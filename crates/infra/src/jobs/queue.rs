//! Job queue abstraction and the in-memory implementation.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};

use carpipe_core::{
    Clock, ErrorKind, JobId, JobStatus, RetryPolicy, SystemClock, TaskId, TraceContext,
};

use super::types::{ClaimedJob, FailureOutcome, JobKind, NewJob, QueueStats, QueuedJob};

/// Default lease granted to a claimed job.
pub const DEFAULT_LEASE_SECS: i64 = 300;

/// Durable work queue with at-least-once delivery.
///
/// Every claim increments the job's delivery counter; a claimed job is leased
/// and becomes claimable again once the lease expires without a heartbeat.
pub trait JobQueue: Send + Sync {
    /// Enqueue a new job. A queued `advance_pipeline` job for the same task is
    /// reused rather than duplicated; its id is returned.
    fn enqueue(&self, job: NewJob) -> Result<JobId, QueueError>;

    /// Atomically claim the next due job. `None` when nothing is eligible.
    fn claim_next(&self) -> Result<Option<ClaimedJob>, QueueError>;

    /// Extend the lease of a running job.
    fn heartbeat(&self, job_id: &JobId) -> Result<(), QueueError>;

    fn mark_succeeded(&self, job_id: &JobId) -> Result<(), QueueError>;

    /// Record a failed delivery. Retryable failures with attempts left are
    /// rescheduled per the backoff table; anything else is terminally failed.
    fn mark_failed(
        &self,
        job_id: &JobId,
        kind: ErrorKind,
        retryable: bool,
    ) -> Result<FailureOutcome, QueueError>;

    /// Irreversibly park a job in the dead-letter state.
    fn move_to_dlq(&self, job_id: &JobId, kind: ErrorKind) -> Result<(), QueueError>;

    fn get(&self, job_id: &JobId) -> Result<Option<QueuedJob>, QueueError>;

    /// Oldest first, at most `limit`.
    fn list_by_status(&self, status: JobStatus, limit: usize) -> Result<Vec<QueuedJob>, QueueError>;

    fn stats(&self) -> Result<QueueStats, QueueError>;

    /// Enqueue the job that advances `task_id` one stage.
    fn enqueue_advance(&self, task_id: &TaskId, trace: &TraceContext) -> Result<JobId, QueueError> {
        self.enqueue(NewJob::advance(task_id).with_trace(trace))
    }
}

/// Job queue error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum QueueError {
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("job {job_id} is {from}, cannot {action}")]
    InvalidState {
        job_id: JobId,
        from: JobStatus,
        action: &'static str,
    },
    #[error("storage error: {0}")]
    Storage(String),
}

#[derive(Debug)]
struct Entry {
    seq: u64,
    job: QueuedJob,
}

#[derive(Debug, Default)]
struct Jobs {
    next_seq: u64,
    by_id: HashMap<JobId, Entry>,
}

/// In-memory job queue for tests/dev.
pub struct InMemoryJobQueue {
    jobs: Mutex<Jobs>,
    clock: Arc<dyn Clock>,
    policy: RetryPolicy,
    lease: chrono::Duration,
}

impl std::fmt::Debug for InMemoryJobQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryJobQueue")
            .field("policy", &self.policy)
            .field("lease", &self.lease)
            .finish_non_exhaustive()
    }
}

impl InMemoryJobQueue {
    pub fn new() -> Self {
        Self {
            jobs: Mutex::new(Jobs::default()),
            clock: Arc::new(SystemClock),
            policy: RetryPolicy::default(),
            lease: chrono::Duration::seconds(DEFAULT_LEASE_SECS),
        }
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_lease(mut self, lease: chrono::Duration) -> Self {
        self.lease = lease;
        self
    }

    fn update<T>(
        &self,
        job_id: &JobId,
        f: impl FnOnce(&mut QueuedJob, DateTime<Utc>) -> Result<T, QueueError>,
    ) -> Result<T, QueueError> {
        let now = self.clock.now();
        let mut jobs = self.jobs.lock().unwrap();
        let entry = jobs
            .by_id
            .get_mut(job_id)
            .ok_or_else(|| QueueError::NotFound(job_id.clone()))?;
        let out = f(&mut entry.job, now)?;
        entry.job.updated_at = now;
        Ok(out)
    }
}

impl Default for InMemoryJobQueue {
    fn default() -> Self {
        Self::new()
    }
}

fn require(job: &QueuedJob, status: JobStatus, action: &'static str) -> Result<(), QueueError> {
    if job.status == status {
        Ok(())
    } else {
        Err(QueueError::InvalidState {
            job_id: job.id.clone(),
            from: job.status,
            action,
        })
    }
}

impl JobQueue for InMemoryJobQueue {
    fn enqueue(&self, job: NewJob) -> Result<JobId, QueueError> {
        let now = self.clock.now();
        let mut jobs = self.jobs.lock().unwrap();

        if job.kind == JobKind::AdvancePipeline {
            let existing = jobs.by_id.values().find(|e| {
                e.job.status == JobStatus::Queued
                    && e.job.kind == job.kind
                    && e.job.subject_type == job.subject_type
                    && e.job.subject_id == job.subject_id
            });
            if let Some(existing) = existing {
                return Ok(existing.job.id.clone());
            }
        }

        let id = JobId::generate();
        let seq = jobs.next_seq;
        jobs.next_seq += 1;
        jobs.by_id.insert(
            id.clone(),
            Entry {
                seq,
                job: QueuedJob::from_new(id.clone(), job, now),
            },
        );
        Ok(id)
    }

    fn claim_next(&self) -> Result<Option<ClaimedJob>, QueueError> {
        let now = self.clock.now();
        let mut jobs = self.jobs.lock().unwrap();

        // Earliest due first, FIFO among equals.
        let next = jobs
            .by_id
            .values()
            .filter(|e| e.job.is_claimable(now))
            .min_by_key(|e| (e.job.available_at, e.seq))
            .map(|e| e.job.id.clone());

        let Some(job_id) = next else {
            return Ok(None);
        };
        let Some(entry) = jobs.by_id.get_mut(&job_id) else {
            return Ok(None);
        };

        let job = &mut entry.job;
        job.status = JobStatus::Running;
        job.attempt += 1;
        job.lease_expires_at = Some(now + self.lease);
        job.updated_at = now;
        Ok(Some(job.claimed()))
    }

    fn heartbeat(&self, job_id: &JobId) -> Result<(), QueueError> {
        let lease = self.lease;
        self.update(job_id, |job, now| {
            require(job, JobStatus::Running, "heartbeat")?;
            job.lease_expires_at = Some(now + lease);
            Ok(())
        })
    }

    fn mark_succeeded(&self, job_id: &JobId) -> Result<(), QueueError> {
        self.update(job_id, |job, _| {
            require(job, JobStatus::Running, "succeed")?;
            job.status = JobStatus::Succeeded;
            job.lease_expires_at = None;
            Ok(())
        })
    }

    fn mark_failed(
        &self,
        job_id: &JobId,
        kind: ErrorKind,
        retryable: bool,
    ) -> Result<FailureOutcome, QueueError> {
        let policy = &self.policy;
        self.update(job_id, |job, now| {
            require(job, JobStatus::Running, "fail")?;
            job.lease_expires_at = None;
            job.last_error_kind = Some(kind);

            if retryable && policy.has_attempts_left(job.attempt) {
                let available_at = policy.next_retry_at(job.attempt, now);
                job.status = JobStatus::Queued;
                job.available_at = available_at;
                Ok(FailureOutcome::Rescheduled {
                    attempt: job.attempt,
                    available_at,
                })
            } else {
                job.status = JobStatus::Failed;
                Ok(FailureOutcome::Failed {
                    attempts: job.attempt,
                })
            }
        })
    }

    fn move_to_dlq(&self, job_id: &JobId, kind: ErrorKind) -> Result<(), QueueError> {
        self.update(job_id, |job, _| {
            if matches!(job.status, JobStatus::Succeeded | JobStatus::DeadLetter) {
                return Err(QueueError::InvalidState {
                    job_id: job.id.clone(),
                    from: job.status,
                    action: "dead-letter",
                });
            }
            job.status = JobStatus::DeadLetter;
            job.lease_expires_at = None;
            job.last_error_kind = Some(kind);
            Ok(())
        })
    }

    fn get(&self, job_id: &JobId) -> Result<Option<QueuedJob>, QueueError> {
        let jobs = self.jobs.lock().unwrap();
        Ok(jobs.by_id.get(job_id).map(|e| e.job.clone()))
    }

    fn list_by_status(
        &self,
        status: JobStatus,
        limit: usize,
    ) -> Result<Vec<QueuedJob>, QueueError> {
        let jobs = self.jobs.lock().unwrap();
        let mut entries: Vec<_> = jobs
            .by_id
            .values()
            .filter(|e| e.job.status == status)
            .collect();
        entries.sort_by_key(|e| e.seq);
        Ok(entries
            .into_iter()
            .take(limit)
            .map(|e| e.job.clone())
            .collect())
    }

    fn stats(&self) -> Result<QueueStats, QueueError> {
        let jobs = self.jobs.lock().unwrap();
        let mut stats = QueueStats::default();
        for entry in jobs.by_id.values() {
            stats.record(entry.job.status);
        }
        Ok(stats)
    }
}

impl<Q: JobQueue + ?Sized> JobQueue for Arc<Q> {
    fn enqueue(&self, job: NewJob) -> Result<JobId, QueueError> {
        (**self).enqueue(job)
    }

    fn claim_next(&self) -> Result<Option<ClaimedJob>, QueueError> {
        (**self).claim_next()
    }

    fn heartbeat(&self, job_id: &JobId) -> Result<(), QueueError> {
        (**self).heartbeat(job_id)
    }

    fn mark_succeeded(&self, job_id: &JobId) -> Result<(), QueueError> {
        (**self).mark_succeeded(job_id)
    }

    fn mark_failed(
        &self,
        job_id: &JobId,
        kind: ErrorKind,
        retryable: bool,
    ) -> Result<FailureOutcome, QueueError> {
        (**self).mark_failed(job_id, kind, retryable)
    }

    fn move_to_dlq(&self, job_id: &JobId, kind: ErrorKind) -> Result<(), QueueError> {
        (**self).move_to_dlq(job_id, kind)
    }

    fn get(&self, job_id: &JobId) -> Result<Option<QueuedJob>, QueueError> {
        (**self).get(job_id)
    }

    fn list_by_status(
        &self,
        status: JobStatus,
        limit: usize,
    ) -> Result<Vec<QueuedJob>, QueueError> {
        (**self).list_by_status(status, limit)
    }

    fn stats(&self) -> Result<QueueStats, QueueError> {
        (**self).stats()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use carpipe_core::ManualClock;
    use chrono::TimeZone;

    fn setup() -> (Arc<ManualClock>, InMemoryJobQueue) {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
        ));
        let queue = InMemoryJobQueue::new().with_clock(clock.clone());
        (clock, queue)
    }

    fn task(id: &str) -> TaskId {
        TaskId::new(id).unwrap()
    }

    #[test]
    fn enqueue_and_claim() {
        let (_, queue) = setup();
        let job_id = queue
            .enqueue_advance(&task("t-1"), &TraceContext::from_id("trace-1"))
            .unwrap();

        let claimed = queue.claim_next().unwrap().unwrap();
        assert_eq!(claimed.job_id, job_id);
        assert_eq!(claimed.attempt, 1);
        assert_eq!(claimed.trace().trace_id(), "trace-1");
        assert_eq!(
            queue.get(&job_id).unwrap().unwrap().status,
            JobStatus::Running
        );

        // No more jobs
        assert!(queue.claim_next().unwrap().is_none());
    }

    #[test]
    fn claims_are_fifo_among_due_jobs() {
        let (_, queue) = setup();
        let first = queue.enqueue(NewJob::new(JobKind::Photos, "card", "1")).unwrap();
        let second = queue.enqueue(NewJob::new(JobKind::Photos, "card", "2")).unwrap();

        assert_eq!(queue.claim_next().unwrap().unwrap().job_id, first);
        assert_eq!(queue.claim_next().unwrap().unwrap().job_id, second);
    }

    #[test]
    fn queued_advance_jobs_are_not_duplicated() {
        let (_, queue) = setup();
        let trace = TraceContext::new();
        let a = queue.enqueue_advance(&task("t-1"), &trace).unwrap();
        let b = queue.enqueue_advance(&task("t-1"), &trace).unwrap();
        let other = queue.enqueue_advance(&task("t-2"), &trace).unwrap();

        assert_eq!(a, b);
        assert_ne!(a, other);
        assert_eq!(queue.stats().unwrap().queued, 2);

        // Once claimed, a fresh advance job may be queued.
        queue.claim_next().unwrap();
        let c = queue.enqueue_advance(&task("t-1"), &trace).unwrap();
        assert_ne!(a, c);
    }

    #[test]
    fn future_jobs_are_not_claimable() {
        let (clock, queue) = setup();
        let later = clock.now() + chrono::Duration::seconds(30);
        queue
            .enqueue(NewJob::new(JobKind::Export, "export", "1").available_at(later))
            .unwrap();

        assert!(queue.claim_next().unwrap().is_none());
        clock.advance(chrono::Duration::seconds(30));
        assert!(queue.claim_next().unwrap().is_some());
    }

    #[test]
    fn retryable_failure_follows_backoff_table_then_fails() {
        let (clock, queue) = setup();
        let job_id = queue.enqueue(NewJob::new(JobKind::Photos, "card", "1")).unwrap();

        let expected = [60, 300];
        for (i, delay) in expected.into_iter().enumerate() {
            let claimed = queue.claim_next().unwrap().unwrap();
            assert_eq!(claimed.attempt as usize, i + 1);
            let outcome = queue
                .mark_failed(&job_id, ErrorKind::Transient, true)
                .unwrap();
            let due = clock.now() + chrono::Duration::seconds(delay);
            assert_eq!(
                outcome,
                FailureOutcome::Rescheduled {
                    attempt: claimed.attempt,
                    available_at: due,
                }
            );
            assert!(queue.claim_next().unwrap().is_none());
            clock.set(due);
        }

        queue.claim_next().unwrap().unwrap();
        let outcome = queue
            .mark_failed(&job_id, ErrorKind::Transient, true)
            .unwrap();
        assert_eq!(outcome, FailureOutcome::Failed { attempts: 3 });

        let job = queue.get(&job_id).unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.last_error_kind, Some(ErrorKind::Transient));

        clock.advance(chrono::Duration::days(1));
        assert!(queue.claim_next().unwrap().is_none());
    }

    #[test]
    fn non_retryable_failure_is_terminal_immediately() {
        let (_, queue) = setup();
        let job_id = queue.enqueue(NewJob::new(JobKind::Parser, "feed", "1")).unwrap();
        queue.claim_next().unwrap();

        let outcome = queue
            .mark_failed(&job_id, ErrorKind::BadInput, false)
            .unwrap();
        assert!(outcome.is_terminal());
    }

    #[test]
    fn expired_lease_makes_job_claimable_again() {
        let (clock, queue) = setup();
        let queue = queue.with_lease(chrono::Duration::seconds(10));
        let job_id = queue.enqueue(NewJob::new(JobKind::Photos, "card", "1")).unwrap();

        queue.claim_next().unwrap().unwrap();
        clock.advance(chrono::Duration::seconds(8));
        queue.heartbeat(&job_id).unwrap();
        clock.advance(chrono::Duration::seconds(8));
        assert!(queue.claim_next().unwrap().is_none());

        clock.advance(chrono::Duration::seconds(3));
        let reclaimed = queue.claim_next().unwrap().unwrap();
        assert_eq!(reclaimed.job_id, job_id);
        assert_eq!(reclaimed.attempt, 2);
    }

    #[test]
    fn dead_letter_is_irreversible() {
        let (_, queue) = setup();
        let job_id = queue.enqueue(NewJob::new(JobKind::Photos, "card", "1")).unwrap();
        queue.claim_next().unwrap();
        queue.mark_failed(&job_id, ErrorKind::Auth, false).unwrap();
        queue.move_to_dlq(&job_id, ErrorKind::Auth).unwrap();

        assert!(matches!(
            queue.move_to_dlq(&job_id, ErrorKind::Auth),
            Err(QueueError::InvalidState { .. })
        ));
        assert!(matches!(
            queue.mark_succeeded(&job_id),
            Err(QueueError::InvalidState { .. })
        ));
        let parked = queue.list_by_status(JobStatus::DeadLetter, 10).unwrap();
        assert_eq!(parked.len(), 1);
        assert_eq!(parked[0].id, job_id);
    }

    #[test]
    fn unknown_job_is_not_found() {
        let (_, queue) = setup();
        let missing = JobId::new("job-missing").unwrap();
        assert!(matches!(
            queue.mark_succeeded(&missing),
            Err(QueueError::NotFound(_))
        ));
        assert!(queue.get(&missing).unwrap().is_none());
    }

    #[test]
    fn stats_tracking() {
        let (_, queue) = setup();
        for i in 0..5 {
            queue
                .enqueue(NewJob::new(JobKind::Photos, "card", i.to_string()))
                .unwrap();
        }
        assert_eq!(queue.stats().unwrap().queued, 5);

        let claimed = queue.claim_next().unwrap().unwrap();
        queue.claim_next().unwrap();
        queue.mark_succeeded(&claimed.job_id).unwrap();

        let stats = queue.stats().unwrap();
        assert_eq!(stats.queued, 3);
        assert_eq!(stats.running, 1);
        assert_eq!(stats.succeeded, 1);
    }
}
