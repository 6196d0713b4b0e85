//! Reliability handler: runs one claimed job under the idempotency bracket and
//! turns its outcome into a queue decision.
//!
//! ```text
//! claimed job ─► materialize Job (key + trace)
//!      │
//!      ├─ effectful and key already taken ─► ack, on_success (duplicate)
//!      │
//!      └─ execute (lease renewed while it runs)
//!           ├─ Ok  ─► commit key, ack, on_success
//!           └─ Err ─► normalize to JobError, release key,
//!                     reschedule or fail terminally (+ dead-letter record),
//!                     on_failure
//! ```
//!
//! The key is committed before the queue ack: if the ack is lost, the
//! redelivery finds the key committed and is acknowledged without rerunning
//! the side effect.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value as JsonValue;
use tracing::{debug, info, warn};

use carpipe_core::{Clock, ErrorKind, JobError, JobId, RetryPolicy, SystemClock, TraceContext};

use crate::dlq::{record_dead_letter, DeadLetterWriter, DlqRecord};
use crate::idempotency::{IdempotencyError, IdempotencyStore};
use crate::jobs::{ClaimedJob, FailureOutcome, Job, JobQueue, QueueError, DEFAULT_LEASE_SECS};

/// Failure raised by a unit of work.
#[derive(Debug, thiserror::Error)]
pub enum WorkError {
    /// Reported through the adapter contract; its flag decides retryability.
    #[error("{code}: {message}")]
    Adapter {
        code: String,
        retryable: bool,
        message: String,
    },
    /// Already normalized.
    #[error(transparent)]
    Classified(#[from] JobError),
    /// Anything else; classified as `unknown`.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl WorkError {
    pub fn adapter(code: impl Into<String>, retryable: bool, message: impl Into<String>) -> Self {
        WorkError::Adapter {
            code: code.into(),
            retryable,
            message: message.into(),
        }
    }

    fn normalize(self, trace: &TraceContext) -> JobError {
        match self {
            WorkError::Adapter {
                code,
                retryable,
                message,
            } => JobError::from_adapter(code, retryable, message, trace),
            WorkError::Classified(error) => error,
            WorkError::Other(err) => JobError::unknown(format!("{err:#}"), trace),
        }
    }
}

/// A job kind's unit of work plus its completion callbacks.
pub trait JobHandler: Send + Sync {
    fn execute(&self, job: &Job, trace: &TraceContext) -> Result<(), WorkError>;

    /// Effectful work runs under the idempotency bracket.
    fn is_effectful(&self) -> bool {
        true
    }

    fn on_success(&self, _job: &Job) {}

    /// `error` is [`JobError::to_payload`]; `outcome` is the queue's decision.
    fn on_failure(&self, _job: &Job, _error: &JsonValue, _outcome: &ProcessOutcome) {}
}

impl<F> JobHandler for F
where
    F: Fn(&Job, &TraceContext) -> Result<(), WorkError> + Send + Sync,
{
    fn execute(&self, job: &Job, trace: &TraceContext) -> Result<(), WorkError> {
        self(job, trace)
    }
}

/// What `process` did with the job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ProcessOutcome {
    Succeeded,
    /// Key already in flight or committed; acknowledged without running.
    Duplicate,
    Rescheduled {
        attempt: u32,
        available_at: DateTime<Utc>,
    },
    /// Terminally failed and dead-lettered.
    DeadLettered { attempts: u32 },
}

#[derive(Debug, thiserror::Error)]
pub enum ReliabilityError {
    #[error(transparent)]
    Queue(#[from] QueueError),
    #[error(transparent)]
    Idempotency(#[from] IdempotencyError),
}

pub struct ReliabilityHandler {
    queue: Arc<dyn JobQueue>,
    idempotency: Arc<dyn IdempotencyStore>,
    dlq: Arc<dyn DeadLetterWriter>,
    policy: RetryPolicy,
    clock: Arc<dyn Clock>,
    heartbeat_interval: Duration,
}

impl std::fmt::Debug for ReliabilityHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReliabilityHandler")
            .field("policy", &self.policy)
            .field("heartbeat_interval", &self.heartbeat_interval)
            .finish_non_exhaustive()
    }
}

impl ReliabilityHandler {
    pub fn new(
        queue: Arc<dyn JobQueue>,
        idempotency: Arc<dyn IdempotencyStore>,
        dlq: Arc<dyn DeadLetterWriter>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            queue,
            idempotency,
            dlq,
            policy,
            clock: Arc::new(SystemClock),
            heartbeat_interval: Duration::from_secs(DEFAULT_LEASE_SECS.unsigned_abs() / 3),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// How often a running job's lease is renewed. Keep it well under the lease.
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn process(
        &self,
        claimed: &ClaimedJob,
        handler: &dyn JobHandler,
    ) -> Result<ProcessOutcome, ReliabilityError> {
        let trace = claimed.trace();
        let job = Job::from_claimed(claimed, &trace);

        let claim = if handler.is_effectful() {
            let Some(claim) = self.idempotency.acquire(job.idempotency_key())? else {
                debug!(
                    job_id = %claimed.job_id,
                    idempotency_key = %job.idempotency_key(),
                    "already handled, acknowledging"
                );
                self.queue.mark_succeeded(&claimed.job_id)?;
                handler.on_success(&job);
                return Ok(ProcessOutcome::Duplicate);
            };
            Some(claim)
        } else {
            None
        };

        let result = self.renewing_lease(&claimed.job_id, || {
            catch_unwind(AssertUnwindSafe(|| handler.execute(&job, &trace)))
                .unwrap_or_else(|panic| Err(WorkError::Classified(panic_error(panic, &trace))))
        });

        match result {
            Ok(()) => {
                if let Some(claim) = &claim {
                    if !self.idempotency.commit(claim)? {
                        warn!(
                            job_id = %claimed.job_id,
                            idempotency_key = %claim.key(),
                            "idempotency key was taken over while the job ran"
                        );
                    }
                }
                self.queue.mark_succeeded(&claimed.job_id)?;
                info!(
                    job_id = %claimed.job_id,
                    kind = %job.kind(),
                    attempt = job.attempt(),
                    "job succeeded"
                );
                handler.on_success(&job);
                Ok(ProcessOutcome::Succeeded)
            }
            Err(err) => {
                let error = err.normalize(&trace);
                if let Some(claim) = &claim {
                    match self.idempotency.release(claim) {
                        Ok(true) => {}
                        Ok(false) => debug!(
                            job_id = %claimed.job_id,
                            idempotency_key = %claim.key(),
                            "idempotency key held elsewhere, left in place"
                        ),
                        Err(release_err) => warn!(
                            job_id = %claimed.job_id,
                            error = %release_err,
                            "failed to release idempotency key"
                        ),
                    }
                }
                let outcome = self.fail(claimed, &job, &error)?;
                let payload = error.to_payload(outcome_is_terminal(&outcome));
                handler.on_failure(&job, &payload, &outcome);
                Ok(outcome)
            }
        }
    }

    /// Run `work` on the calling thread while a scoped thread renews
    /// `job_id`'s lease every heartbeat interval.
    pub fn renewing_lease<T>(&self, job_id: &JobId, work: impl FnOnce() -> T) -> T {
        let (done, stopped) = mpsc::channel::<()>();
        let queue = self.queue.as_ref();
        let every = self.heartbeat_interval;

        thread::scope(|scope| {
            scope.spawn(move || {
                while let Err(RecvTimeoutError::Timeout) = stopped.recv_timeout(every) {
                    if let Err(err) = queue.heartbeat(job_id) {
                        warn!(job_id = %job_id, error = %err, "lease renewal failed");
                    }
                }
            });
            let out = work();
            drop(done);
            out
        })
    }

    /// Reschedule or terminally fail `claimed`, dead-lettering terminal
    /// failures. Retryability follows the error's kind.
    pub fn fail(
        &self,
        claimed: &ClaimedJob,
        job: &Job,
        error: &JobError,
    ) -> Result<ProcessOutcome, ReliabilityError> {
        let retry = self.policy.classify_and_decide(error, claimed.attempt);
        self.settle(claimed, job, error, retry)
    }

    /// Like [`fail`](Self::fail), with the caller's retryability verdict in
    /// place of the kind's. Attempts stay bounded by the policy.
    pub fn fail_with_verdict(
        &self,
        claimed: &ClaimedJob,
        job: &Job,
        error: &JobError,
        retryable: bool,
    ) -> Result<ProcessOutcome, ReliabilityError> {
        let retry = retryable && self.policy.has_attempts_left(claimed.attempt);
        self.settle(claimed, job, error, retry)
    }

    fn settle(
        &self,
        claimed: &ClaimedJob,
        job: &Job,
        error: &JobError,
        retry: bool,
    ) -> Result<ProcessOutcome, ReliabilityError> {
        match self.queue.mark_failed(&claimed.job_id, error.kind, retry)? {
            FailureOutcome::Rescheduled {
                attempt,
                available_at,
            } => {
                warn!(
                    job_id = %claimed.job_id,
                    kind = %job.kind(),
                    attempt,
                    error_kind = %error.kind,
                    error = %error,
                    retry_at = %available_at,
                    trace_id = %error.trace_id,
                    "job failed, retry scheduled"
                );
                Ok(ProcessOutcome::Rescheduled {
                    attempt,
                    available_at,
                })
            }
            FailureOutcome::Failed { attempts } => {
                self.queue.move_to_dlq(&claimed.job_id, error.kind)?;
                record_dead_letter(
                    self.dlq.as_ref(),
                    &DlqRecord::new(job, error.clone(), attempts, self.clock.now()),
                );
                warn!(
                    target: "audit",
                    action = "job.dead_lettered",
                    job_id = %claimed.job_id,
                    kind = %job.kind(),
                    attempts,
                    error_kind = %error.kind,
                    error = %error,
                    trace_id = %error.trace_id
                );
                Ok(ProcessOutcome::DeadLettered { attempts })
            }
        }
    }
}

fn outcome_is_terminal(outcome: &ProcessOutcome) -> bool {
    matches!(outcome, ProcessOutcome::DeadLettered { .. })
}

/// Panics are never retried.
pub(crate) fn panic_error(panic: Box<dyn std::any::Any + Send>, trace: &TraceContext) -> JobError {
    let message = panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string());
    JobError::new("panic", ErrorKind::Permanent, message, trace)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    use carpipe_core::{JobStatus, ManualClock};
    use chrono::TimeZone;

    use crate::dlq::InMemoryDeadLetters;
    use crate::idempotency::{InMemoryIdempotencyStore, KeyState, DEFAULT_IN_FLIGHT_TTL_SECS};
    use crate::jobs::{InMemoryJobQueue, JobKind, NewJob};

    struct Harness {
        clock: Arc<ManualClock>,
        queue: Arc<InMemoryJobQueue>,
        keys: Arc<InMemoryIdempotencyStore>,
        dlq: Arc<InMemoryDeadLetters>,
        handler: ReliabilityHandler,
    }

    fn harness() -> Harness {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
        ));
        let queue = Arc::new(InMemoryJobQueue::new().with_clock(clock.clone()));
        let keys = Arc::new(InMemoryIdempotencyStore::new().with_clock(clock.clone()));
        let dlq = InMemoryDeadLetters::arc();
        let handler = ReliabilityHandler::new(
            queue.clone(),
            keys.clone(),
            dlq.clone(),
            RetryPolicy::default(),
        )
        .with_clock(clock.clone())
        .with_heartbeat_interval(Duration::from_millis(5));
        Harness {
            clock,
            queue,
            keys,
            dlq,
            handler,
        }
    }

    fn enqueue_and_claim(h: &Harness) -> ClaimedJob {
        h.queue
            .enqueue(NewJob::new(JobKind::Photos, "card", "42").with_idempotency_key("photos-42"))
            .unwrap();
        h.queue.claim_next().unwrap().unwrap()
    }

    #[derive(Default)]
    struct Recording {
        runs: AtomicU32,
        successes: AtomicU32,
        failures: Mutex<Vec<JsonValue>>,
        fail_with: Option<(bool, &'static str)>,
    }

    impl JobHandler for Recording {
        fn execute(&self, _job: &Job, _trace: &TraceContext) -> Result<(), WorkError> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            match self.fail_with {
                Some((retryable, code)) => {
                    Err(WorkError::adapter(code, retryable, "adapter said no"))
                }
                None => Ok(()),
            }
        }

        fn on_success(&self, _job: &Job) {
            self.successes.fetch_add(1, Ordering::SeqCst);
        }

        fn on_failure(&self, _job: &Job, error: &JsonValue, _outcome: &ProcessOutcome) {
            self.failures.lock().unwrap().push(error.clone());
        }
    }

    #[test]
    fn success_commits_key_and_acks() {
        let h = harness();
        let claimed = enqueue_and_claim(&h);
        let work = Recording::default();

        let outcome = h.handler.process(&claimed, &work).unwrap();

        assert_eq!(outcome, ProcessOutcome::Succeeded);
        assert_eq!(h.keys.state("photos-42").unwrap(), Some(KeyState::Committed));
        assert_eq!(
            h.queue.get(&claimed.job_id).unwrap().unwrap().status,
            JobStatus::Succeeded
        );
        assert_eq!(work.successes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn redelivery_of_committed_work_is_acked_without_running() {
        let h = harness();
        let claim = h.keys.acquire("photos-42").unwrap().unwrap();
        h.keys.commit(&claim).unwrap();

        let claimed = enqueue_and_claim(&h);
        let work = Recording::default();
        let outcome = h.handler.process(&claimed, &work).unwrap();

        assert_eq!(outcome, ProcessOutcome::Duplicate);
        assert_eq!(work.runs.load(Ordering::SeqCst), 0);
        assert_eq!(work.successes.load(Ordering::SeqCst), 1);
        assert_eq!(
            h.queue.get(&claimed.job_id).unwrap().unwrap().status,
            JobStatus::Succeeded
        );
    }

    #[test]
    fn retryable_failure_releases_key_and_reschedules() {
        let h = harness();
        let claimed = enqueue_and_claim(&h);
        let work = Recording {
            fail_with: Some((true, "integration_unavailable")),
            ..Default::default()
        };

        let outcome = h.handler.process(&claimed, &work).unwrap();

        assert_eq!(
            outcome,
            ProcessOutcome::Rescheduled {
                attempt: 1,
                available_at: h.clock.now() + chrono::Duration::seconds(60),
            }
        );
        assert_eq!(h.keys.state("photos-42").unwrap(), None);
        assert!(h.dlq.is_empty());

        let failures = work.failures.lock().unwrap();
        assert_eq!(failures[0]["kind"], "transient");
        assert_eq!(failures[0]["fatal"], false);
    }

    #[test]
    fn non_retryable_failure_is_dead_lettered_once() {
        let h = harness();
        let claimed = enqueue_and_claim(&h);
        let work = Recording {
            fail_with: Some((false, "validation_error")),
            ..Default::default()
        };

        let outcome = h.handler.process(&claimed, &work).unwrap();

        assert_eq!(outcome, ProcessOutcome::DeadLettered { attempts: 1 });
        assert_eq!(
            h.queue.get(&claimed.job_id).unwrap().unwrap().status,
            JobStatus::DeadLetter
        );
        let records = h.dlq.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].error.kind, ErrorKind::Permanent);
        assert_eq!(records[0].idempotency_key, "photos-42");
        assert_eq!(work.failures.lock().unwrap()[0]["fatal"], true);
    }

    #[test]
    fn unclassified_errors_are_unknown_and_retried() {
        let h = harness();
        let claimed = enqueue_and_claim(&h);
        let work = |_: &Job, _: &TraceContext| -> Result<(), WorkError> {
            Err(anyhow::anyhow!("socket closed").into())
        };

        let outcome = h.handler.process(&claimed, &work).unwrap();
        assert!(matches!(outcome, ProcessOutcome::Rescheduled { .. }));
        assert_eq!(
            h.queue.get(&claimed.job_id).unwrap().unwrap().last_error_kind,
            Some(ErrorKind::Unknown)
        );
    }

    #[test]
    fn panics_are_dead_lettered() {
        let h = harness();
        let claimed = enqueue_and_claim(&h);
        let work = |_: &Job, _: &TraceContext| -> Result<(), WorkError> { panic!("boom") };

        let outcome = h.handler.process(&claimed, &work).unwrap();
        assert_eq!(outcome, ProcessOutcome::DeadLettered { attempts: 1 });
        assert_eq!(h.dlq.records()[0].error.code, "panic");
        assert_eq!(h.dlq.records()[0].error.message, "boom");
    }

    #[test]
    fn long_running_work_keeps_its_lease() {
        let h = harness();
        let claimed = enqueue_and_claim(&h);
        let job_id = claimed.job_id.clone();

        let work = |_: &Job, _: &TraceContext| -> Result<(), WorkError> {
            h.clock.advance(chrono::Duration::seconds(200));
            let renewed = h.clock.now() + chrono::Duration::seconds(300);
            let deadline = std::time::Instant::now() + Duration::from_secs(5);
            while h.queue.get(&job_id).unwrap().unwrap().lease_expires_at != Some(renewed)
                && std::time::Instant::now() < deadline
            {
                thread::sleep(Duration::from_millis(2));
            }
            // past the original lease, still not reclaimable
            h.clock.advance(chrono::Duration::seconds(200));
            assert!(h.queue.claim_next().unwrap().is_none());
            Ok(())
        };

        assert_eq!(h.handler.process(&claimed, &work).unwrap(), ProcessOutcome::Succeeded);
        assert_eq!(h.queue.get(&job_id).unwrap().unwrap().attempt, 1);
    }

    #[test]
    fn failed_run_leaves_a_taken_over_key_alone() {
        let h = harness();
        let claimed = enqueue_and_claim(&h);

        let work = |_: &Job, _: &TraceContext| -> Result<(), WorkError> {
            h.clock
                .advance(chrono::Duration::seconds(DEFAULT_IN_FLIGHT_TTL_SECS));
            assert!(h.keys.acquire("photos-42").unwrap().is_some());
            Err(WorkError::adapter("integration_unavailable", true, "slow upstream"))
        };

        let outcome = h.handler.process(&claimed, &work).unwrap();

        assert!(matches!(outcome, ProcessOutcome::Rescheduled { .. }));
        assert_eq!(h.keys.state("photos-42").unwrap(), Some(KeyState::InFlight));
    }

    #[test]
    fn caller_verdict_overrides_kind_retryability() {
        let h = harness();
        let claimed = enqueue_and_claim(&h);
        let job = Job::from_claimed(&claimed, &claimed.trace());
        let error =
            JobError::new("rate_limit", ErrorKind::RateLimit, "slow down", &claimed.trace());

        let outcome = h.handler.fail_with_verdict(&claimed, &job, &error, false).unwrap();

        assert_eq!(outcome, ProcessOutcome::DeadLettered { attempts: 1 });
        assert_eq!(h.dlq.records()[0].error.kind, ErrorKind::RateLimit);
    }

    #[test]
    fn non_effectful_work_skips_the_bracket() {
        struct ReadOnly;
        impl JobHandler for ReadOnly {
            fn execute(&self, _job: &Job, _trace: &TraceContext) -> Result<(), WorkError> {
                Ok(())
            }
            fn is_effectful(&self) -> bool {
                false
            }
        }

        let h = harness();
        let claimed = enqueue_and_claim(&h);
        h.handler.process(&claimed, &ReadOnly).unwrap();
        assert_eq!(h.keys.state("photos-42").unwrap(), None);
    }
}
