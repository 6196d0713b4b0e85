//! Pipeline worker: claims jobs and dispatches them by kind.
//!
//! `advance_pipeline` jobs go through the command layer; every other kind goes
//! to a registered [`JobHandler`] wrapped by the [`ReliabilityHandler`]. An
//! unknown kind, a command error or a panic in dispatch fails the job
//! terminally so it is never left claimed.
//!
//! The next stage's job is enqueued before the current one is acknowledged.
//! If that enqueue fails the current job stays claimed and is redelivered
//! once its lease expires.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::mpsc::{self, RecvTimeoutError, TryRecvError};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, error, info, info_span, warn};

use carpipe_core::{ErrorKind, JobError, TraceContext};

use crate::command_dispatcher::{CommandError, PipelineCommands, TickOutcome};
use crate::jobs::{ClaimedJob, Job, JobKind, JobQueue, QueueError};
use crate::reliability::{
    panic_error, JobHandler, ProcessOutcome, ReliabilityError, ReliabilityHandler,
};

/// Per-thread worker settings.
#[derive(Debug, Clone)]
pub struct PipelineWorkerConfig {
    /// Thread name, also used in logs
    pub name: String,
    /// Fixed sleep when the queue has nothing eligible
    pub poll_interval: Duration,
}

impl Default for PipelineWorkerConfig {
    fn default() -> Self {
        Self {
            name: "pipeline-worker".to_string(),
            poll_interval: Duration::from_millis(1000),
        }
    }
}

impl PipelineWorkerConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }
}

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error(transparent)]
    Queue(#[from] QueueError),
    #[error(transparent)]
    Reliability(#[from] ReliabilityError),
    #[error(transparent)]
    Command(#[from] CommandError),
}

/// Worker runtime statistics.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct WorkerStats {
    pub jobs_processed: u64,
    pub jobs_succeeded: u64,
    pub jobs_duplicate: u64,
    pub jobs_retried: u64,
    pub jobs_dead_lettered: u64,
    /// Loop iterations that failed on storage rather than on the job itself.
    pub errors: u64,
    pub uptime_secs: u64,
}

impl WorkerStats {
    fn record(&mut self, outcome: &ProcessOutcome) {
        self.jobs_processed += 1;
        match outcome {
            ProcessOutcome::Succeeded => self.jobs_succeeded += 1,
            ProcessOutcome::Duplicate => self.jobs_duplicate += 1,
            ProcessOutcome::Rescheduled { .. } => self.jobs_retried += 1,
            ProcessOutcome::DeadLettered { .. } => self.jobs_dead_lettered += 1,
        }
    }
}

/// Handle to control a running worker.
#[derive(Debug)]
pub struct WorkerHandle {
    shutdown: mpsc::Sender<()>,
    join: Option<thread::JoinHandle<()>>,
    stats: Arc<Mutex<WorkerStats>>,
}

impl WorkerHandle {
    /// Request graceful shutdown and wait for the current job to finish.
    pub fn shutdown(mut self) {
        let _ = self.shutdown.send(());
        if let Some(j) = self.join.take() {
            let _ = j.join();
        }
    }

    pub fn stats(&self) -> WorkerStats {
        self.stats.lock().unwrap().clone()
    }
}

#[derive(Clone)]
pub struct PipelineWorker {
    commands: PipelineCommands,
    reliability: Arc<ReliabilityHandler>,
    handlers: HashMap<JobKind, Arc<dyn JobHandler>>,
}

impl std::fmt::Debug for PipelineWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut kinds: Vec<_> = self.handlers.keys().map(JobKind::as_str).collect();
        kinds.sort_unstable();
        f.debug_struct("PipelineWorker")
            .field("commands", &self.commands)
            .field("handlers", &kinds)
            .finish()
    }
}

impl PipelineWorker {
    pub fn new(commands: PipelineCommands, reliability: ReliabilityHandler) -> Self {
        Self {
            commands,
            reliability: Arc::new(reliability),
            handlers: HashMap::new(),
        }
    }

    /// Register the handler for a job kind. `advance_pipeline` always routes
    /// to the command layer and cannot be overridden.
    pub fn register_handler(&mut self, kind: JobKind, handler: impl JobHandler + 'static) {
        self.handlers.insert(kind, Arc::new(handler));
    }

    pub fn with_handler(mut self, kind: JobKind, handler: impl JobHandler + 'static) -> Self {
        self.register_handler(kind, handler);
        self
    }

    pub fn commands(&self) -> &PipelineCommands {
        &self.commands
    }

    fn queue(&self) -> &Arc<dyn JobQueue> {
        self.commands.queue()
    }

    /// Claim and process one job. `None` when nothing was eligible.
    pub fn run_once(&self) -> Result<Option<ProcessOutcome>, WorkerError> {
        let Some(claimed) = self.queue().claim_next()? else {
            return Ok(None);
        };
        let trace = claimed.trace();
        let span = info_span!(
            "job",
            job_id = %claimed.job_id,
            kind = %claimed.kind,
            attempt = claimed.attempt,
            trace_id = %trace
        );
        let _entered = span.enter();
        debug!("claimed job");

        let outcome = match &claimed.kind {
            JobKind::AdvancePipeline => self.advance(&claimed, &trace)?,
            kind => match self.handlers.get(kind) {
                Some(handler) => self.reliability.process(&claimed, handler.as_ref())?,
                None => {
                    warn!("no handler for job kind");
                    let error = JobError::new(
                        "unknown_job_kind",
                        ErrorKind::Permanent,
                        format!("no handler for job kind {kind}"),
                        &trace,
                    );
                    self.reject(&claimed, &trace, error)?
                }
            },
        };
        Ok(Some(outcome))
    }

    /// Drain the queue on the calling thread. Returns the number of jobs processed.
    pub fn run_until_idle(&self) -> Result<usize, WorkerError> {
        let mut processed = 0;
        while self.run_once()?.is_some() {
            processed += 1;
        }
        Ok(processed)
    }

    fn advance(
        &self,
        claimed: &ClaimedJob,
        trace: &TraceContext,
    ) -> Result<ProcessOutcome, WorkerError> {
        let task_id = match claimed.task_id() {
            Ok(task_id) => task_id,
            Err(err) => {
                let error =
                    JobError::new("invalid_subject", ErrorKind::BadInput, err.to_string(), trace);
                return self.reject(claimed, trace, error);
            }
        };

        let tick = self.reliability.renewing_lease(&claimed.job_id, || {
            catch_unwind(AssertUnwindSafe(|| self.commands.tick(&task_id, trace)))
        });
        let error = match tick {
            Ok(Ok(TickOutcome::Done { .. })) => {
                self.queue().mark_succeeded(&claimed.job_id)?;
                return Ok(ProcessOutcome::Succeeded);
            }
            Ok(Ok(TickOutcome::Advanced { completed, next })) => {
                if let Some(next) = next {
                    let job_id = self.queue().enqueue_advance(&task_id, trace)?;
                    debug!(
                        task_id = %task_id,
                        completed = %completed,
                        next = %next,
                        next_job_id = %job_id,
                        "enqueued next stage"
                    );
                } else {
                    info!(task_id = %task_id, "pipeline complete");
                }
                self.queue().mark_succeeded(&claimed.job_id)?;
                return Ok(ProcessOutcome::Succeeded);
            }
            Ok(Ok(TickOutcome::Failed {
                stage,
                error_kind,
                retryable,
            })) => {
                let error = JobError::new(
                    error_kind.as_str(),
                    error_kind,
                    format!("{stage} integration failed"),
                    trace,
                )
                .with_detail("task_id", task_id.as_str())
                .with_detail("stage", stage.as_str());

                let job = Job::from_claimed(claimed, trace);
                let outcome = self
                    .reliability
                    .fail_with_verdict(claimed, &job, &error, retryable)?;
                match outcome {
                    ProcessOutcome::Rescheduled { .. } => {
                        self.commands.schedule_retry(&task_id)?;
                    }
                    ProcessOutcome::DeadLettered { .. } => {
                        self.commands.dead_letter(&task_id, trace)?;
                    }
                    ProcessOutcome::Succeeded | ProcessOutcome::Duplicate => {}
                }
                return Ok(outcome);
            }
            Ok(Err(err)) => {
                JobError::new("command_failed", ErrorKind::Permanent, err.to_string(), trace)
                    .with_detail("task_id", task_id.as_str())
            }
            Err(panic) => panic_error(panic, trace).with_detail("task_id", task_id.as_str()),
        };

        let outcome = self.reject(claimed, trace, error)?;
        if let Err(err) = self.commands.dead_letter(&task_id, trace) {
            warn!(task_id = %task_id, error = %err, "could not dead-letter pipeline");
        }
        Ok(outcome)
    }

    /// Fail a job without retry and dead-letter it.
    fn reject(
        &self,
        claimed: &ClaimedJob,
        trace: &TraceContext,
        error: JobError,
    ) -> Result<ProcessOutcome, WorkerError> {
        error!(code = %error.code, error = %error, "job dispatch failed");
        let job = Job::from_claimed(claimed, trace);
        Ok(self.reliability.fail(claimed, &job, &error)?)
    }

    /// Spawn the worker loop on a named thread.
    pub fn spawn(self, config: PipelineWorkerConfig) -> std::io::Result<WorkerHandle> {
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
        let stats = Arc::new(Mutex::new(WorkerStats::default()));
        let stats_clone = stats.clone();

        let join = thread::Builder::new()
            .name(config.name.clone())
            .spawn(move || worker_loop(self, config, shutdown_rx, stats_clone))?;

        Ok(WorkerHandle {
            shutdown: shutdown_tx,
            join: Some(join),
            stats,
        })
    }
}

fn worker_loop(
    worker: PipelineWorker,
    config: PipelineWorkerConfig,
    shutdown_rx: mpsc::Receiver<()>,
    stats: Arc<Mutex<WorkerStats>>,
) {
    info!(worker = %config.name, "pipeline worker started");
    let started = Instant::now();

    loop {
        if !matches!(shutdown_rx.try_recv(), Err(TryRecvError::Empty)) {
            break;
        }

        let result = worker.run_once();
        let idle = {
            let mut s = stats.lock().unwrap();
            s.uptime_secs = started.elapsed().as_secs();
            match &result {
                Ok(Some(outcome)) => {
                    s.record(outcome);
                    false
                }
                Ok(None) => true,
                Err(_) => {
                    s.errors += 1;
                    true
                }
            }
        };

        if let Err(err) = result {
            error!(worker = %config.name, error = %err, "failed to process job");
        }

        if idle && stop_requested(&shutdown_rx, config.poll_interval) {
            break;
        }
    }

    info!(worker = %config.name, "pipeline worker stopped");
}

/// Sleep for `timeout` unless shutdown arrives first.
fn stop_requested(shutdown_rx: &mpsc::Receiver<()>, timeout: Duration) -> bool {
    !matches!(shutdown_rx.recv_timeout(timeout), Err(RecvTimeoutError::Timeout))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    use carpipe_core::{
        ActorId, IntegrationResult, JobStatus, ManualClock, PipelineStage, RetryPolicy, TaskId,
    };
    use chrono::{TimeZone, Utc};

    use crate::dlq::InMemoryDeadLetters;
    use crate::idempotency::InMemoryIdempotencyStore;
    use crate::integrations::IntegrationRegistry;
    use crate::jobs::testing::FlakyEnqueue;
    use crate::jobs::{InMemoryJobQueue, NewJob, DEFAULT_LEASE_SECS};
    use crate::pipeline::{InMemoryPipelineStates, InMemoryTaskOutputs, InMemoryTaskRegistry};
    use crate::reliability::WorkError;

    struct Harness {
        worker: PipelineWorker,
        queue: Arc<InMemoryJobQueue>,
        dlq: Arc<InMemoryDeadLetters>,
    }

    fn harness(integrations: IntegrationRegistry) -> Harness {
        let queue = InMemoryJobQueue::arc();
        let dlq = InMemoryDeadLetters::arc();
        let commands = PipelineCommands::new(
            InMemoryPipelineStates::arc(),
            InMemoryTaskOutputs::arc(),
            InMemoryTaskRegistry::arc(),
            queue.clone(),
            integrations,
        );
        let reliability = ReliabilityHandler::new(
            queue.clone(),
            InMemoryIdempotencyStore::arc(),
            dlq.clone(),
            RetryPolicy::default(),
        );
        Harness {
            worker: PipelineWorker::new(commands, reliability),
            queue,
            dlq,
        }
    }

    fn create_task(h: &Harness) -> TaskId {
        h.worker
            .commands()
            .create_task(&ActorId::new("actor-1").unwrap(), "listing-1", &TraceContext::new())
            .unwrap()
    }

    #[test]
    fn advances_a_task_through_every_stage() {
        let h = harness(IntegrationRegistry::succeeding());
        let task_id = create_task(&h);

        let processed = h.worker.run_until_idle().unwrap();

        assert_eq!(processed, PipelineStage::ALL.len());
        let state = h.worker.commands().state(&task_id).unwrap();
        assert!(state.is_done());
        assert_eq!(h.worker.commands().outputs(&task_id).unwrap().len(), 5);
        assert_eq!(h.queue.stats().unwrap().succeeded, 5);
    }

    #[test]
    fn retryable_stage_failure_reschedules_job_and_requeues_pipeline() {
        let h = harness(IntegrationRegistry::succeeding().with(
            PipelineStage::Parse,
            |_: &TaskId, _: &TraceContext| IntegrationResult::failed_with(ErrorKind::Transient),
        ));
        let task_id = create_task(&h);

        let outcome = h.worker.run_once().unwrap().unwrap();

        assert!(matches!(outcome, ProcessOutcome::Rescheduled { attempt: 1, .. }));
        let state = h.worker.commands().state(&task_id).unwrap();
        assert_eq!(state.status(), JobStatus::Queued);
        assert_eq!(state.attempt_count(), 1);
        assert_eq!(state.last_error(), Some(ErrorKind::Transient));
        // backoff keeps it out of reach for now
        assert!(h.worker.run_once().unwrap().is_none());
    }

    #[test]
    fn non_retryable_stage_failure_dead_letters_job_and_pipeline() {
        let h = harness(IntegrationRegistry::succeeding().with(
            PipelineStage::Parse,
            |_: &TaskId, _: &TraceContext| IntegrationResult::failed_with(ErrorKind::BadInput),
        ));
        let task_id = create_task(&h);

        let outcome = h.worker.run_once().unwrap().unwrap();

        assert_eq!(outcome, ProcessOutcome::DeadLettered { attempts: 1 });
        assert!(h.worker.commands().state(&task_id).unwrap().is_in_dead_letter());
        let records = h.dlq.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].job_type, "advance_pipeline");
        assert_eq!(records[0].subject_id, task_id.as_str());
        assert_eq!(records[0].error.kind, ErrorKind::BadInput);
    }

    #[test]
    fn failures_the_integration_does_not_call_transient_are_dead_lettered() {
        let cases = [
            (IntegrationResult::failed_with(ErrorKind::RateLimit), ErrorKind::RateLimit),
            (IntegrationResult::failed(ErrorKind::Transient, false), ErrorKind::Transient),
        ];
        for (result, kind) in cases {
            let h = harness(IntegrationRegistry::succeeding().with(
                PipelineStage::Parse,
                move |_: &TaskId, _: &TraceContext| result.clone(),
            ));
            let task_id = create_task(&h);

            let outcome = h.worker.run_once().unwrap().unwrap();

            assert_eq!(outcome, ProcessOutcome::DeadLettered { attempts: 1 });
            assert!(h.worker.commands().state(&task_id).unwrap().is_in_dead_letter());
            assert_eq!(h.dlq.records()[0].error.kind, kind);
        }
    }

    #[test]
    fn lost_next_stage_enqueue_is_recovered_by_redelivery() {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
        ));
        let inner = Arc::new(InMemoryJobQueue::new().with_clock(clock.clone()));
        // 1st enqueue is the task's first job, 2nd is the photos job
        let queue = FlakyEnqueue::new(inner.clone(), 2);
        let commands = PipelineCommands::new(
            InMemoryPipelineStates::arc(),
            InMemoryTaskOutputs::arc(),
            InMemoryTaskRegistry::arc(),
            queue.clone(),
            IntegrationRegistry::succeeding(),
        );
        let reliability = ReliabilityHandler::new(
            queue,
            InMemoryIdempotencyStore::arc(),
            InMemoryDeadLetters::arc(),
            RetryPolicy::default(),
        )
        .with_clock(clock.clone());
        let worker = PipelineWorker::new(commands, reliability);
        let task_id = worker
            .commands()
            .create_task(&ActorId::new("actor-1").unwrap(), "listing-1", &TraceContext::new())
            .unwrap();

        assert!(matches!(
            worker.run_once(),
            Err(WorkerError::Queue(QueueError::Storage(_)))
        ));
        let state = worker.commands().state(&task_id).unwrap();
        assert_eq!(
            (state.stage(), state.status()),
            (PipelineStage::Photos, JobStatus::Queued)
        );
        // the parse job was not acknowledged
        let stats = inner.stats().unwrap();
        assert_eq!((stats.running, stats.succeeded), (1, 0));
        assert_eq!(worker.run_until_idle().unwrap(), 0);

        clock.advance(chrono::Duration::seconds(DEFAULT_LEASE_SECS + 1));
        assert_eq!(worker.run_until_idle().unwrap(), 4);

        assert!(worker.commands().state(&task_id).unwrap().is_done());
        assert_eq!(worker.commands().outputs(&task_id).unwrap().len(), 5);
        assert_eq!(inner.stats().unwrap().succeeded, 4);
    }

    #[test]
    fn panicking_integration_is_never_retried() {
        let h = harness(IntegrationRegistry::succeeding().with(
            PipelineStage::Parse,
            |_: &TaskId, _: &TraceContext| -> IntegrationResult { panic!("parser crashed") },
        ));
        let task_id = create_task(&h);

        let outcome = h.worker.run_once().unwrap().unwrap();

        assert_eq!(outcome, ProcessOutcome::DeadLettered { attempts: 1 });
        assert_eq!(h.dlq.records()[0].error.code, "panic");
        assert!(h.worker.commands().state(&task_id).unwrap().is_in_dead_letter());
    }

    #[test]
    fn unknown_kind_is_dead_lettered() {
        let h = harness(IntegrationRegistry::succeeding());
        let job_id = h
            .queue
            .enqueue(NewJob::new(JobKind::from("mystery"), "card", "7"))
            .unwrap();

        let outcome = h.worker.run_once().unwrap().unwrap();

        assert_eq!(outcome, ProcessOutcome::DeadLettered { attempts: 1 });
        assert_eq!(h.queue.get(&job_id).unwrap().unwrap().status, JobStatus::DeadLetter);
        assert_eq!(h.dlq.records()[0].error.code, "unknown_job_kind");
    }

    #[test]
    fn legacy_kinds_run_through_registered_handlers() {
        let calls = Arc::new(AtomicU32::new(0));
        let seen = calls.clone();
        let mut h = harness(IntegrationRegistry::succeeding());
        h.worker.register_handler(JobKind::Photos, move |job: &Job, _: &TraceContext| {
            assert_eq!(job.subject_id(), "42");
            seen.fetch_add(1, Ordering::SeqCst);
            Ok::<(), WorkError>(())
        });

        h.queue
            .enqueue(NewJob::new(JobKind::Photos, "card", "42").with_idempotency_key("photos-42"))
            .unwrap();
        h.queue
            .enqueue(NewJob::new(JobKind::Photos, "card", "42").with_idempotency_key("photos-42"))
            .unwrap();

        assert_eq!(h.worker.run_once().unwrap(), Some(ProcessOutcome::Succeeded));
        assert_eq!(h.worker.run_once().unwrap(), Some(ProcessOutcome::Duplicate));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn spawned_worker_drains_queue_and_shuts_down() {
        let h = harness(IntegrationRegistry::succeeding());
        let task_id = create_task(&h);
        let commands = h.worker.commands().clone();

        let handle = h
            .worker
            .spawn(
                PipelineWorkerConfig::default()
                    .with_name("test-worker")
                    .with_poll_interval(Duration::from_millis(5)),
            )
            .unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while handle.stats().jobs_succeeded < 5 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }

        let stats = handle.stats();
        handle.shutdown();

        assert!(commands.state(&task_id).unwrap().is_done());
        assert_eq!(stats.jobs_succeeded, 5);
        assert_eq!(stats.errors, 0);
    }
}
