//! Core job types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

use carpipe_core::{DomainError, ErrorKind, JobId, JobStatus, TaskId, TraceContext};

/// Subject type used for pipeline-advance jobs.
pub const TASK_SUBJECT: &str = "task";

/// Payload key carrying the idempotency key downstream.
pub const IDEMPOTENCY_KEY_FIELD: &str = "idempotency_key";
/// Payload key carrying the trace id downstream.
pub const TRACE_ID_FIELD: &str = "trace_id";
/// Payload key used to build default idempotency keys.
pub const CORRELATION_ID_FIELD: &str = "correlation_id";

/// Job kind for routing to the appropriate handler.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum JobKind {
    /// Tick a task's pipeline one stage forward.
    AdvancePipeline,
    Photos,
    Export,
    Publish,
    Parser,
    RobotStatus,
    /// Any kind without a dedicated variant.
    Custom(String),
}

impl JobKind {
    pub fn as_str(&self) -> &str {
        match self {
            JobKind::AdvancePipeline => "advance_pipeline",
            JobKind::Photos => "photos",
            JobKind::Export => "export",
            JobKind::Publish => "publish",
            JobKind::Parser => "parser",
            JobKind::RobotStatus => "robot_status",
            JobKind::Custom(kind) => kind,
        }
    }
}

impl From<&str> for JobKind {
    fn from(value: &str) -> Self {
        match value {
            "advance_pipeline" => JobKind::AdvancePipeline,
            "photos" => JobKind::Photos,
            "export" => JobKind::Export,
            "publish" => JobKind::Publish,
            "parser" => JobKind::Parser,
            "robot_status" => JobKind::RobotStatus,
            other => JobKind::Custom(other.to_string()),
        }
    }
}

impl From<String> for JobKind {
    fn from(value: String) -> Self {
        JobKind::from(value.as_str())
    }
}

impl From<JobKind> for String {
    fn from(value: JobKind) -> Self {
        value.as_str().to_string()
    }
}

impl std::fmt::Display for JobKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Request to enqueue a job.
#[derive(Debug, Clone, PartialEq)]
pub struct NewJob {
    pub kind: JobKind,
    pub subject_type: String,
    pub subject_id: String,
    pub payload: Map<String, JsonValue>,
    /// Earliest time the job may run; `None` means immediately.
    pub available_at: Option<DateTime<Utc>>,
}

impl NewJob {
    pub fn new(
        kind: JobKind,
        subject_type: impl Into<String>,
        subject_id: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            subject_type: subject_type.into(),
            subject_id: subject_id.into(),
            payload: Map::new(),
            available_at: None,
        }
    }

    /// An `advance_pipeline` job for `task_id`.
    pub fn advance(task_id: &TaskId) -> Self {
        Self::new(JobKind::AdvancePipeline, TASK_SUBJECT, task_id.as_str())
    }

    pub fn with_payload(mut self, payload: Map<String, JsonValue>) -> Self {
        self.payload.extend(payload);
        self
    }

    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.payload
            .insert(IDEMPOTENCY_KEY_FIELD.to_string(), JsonValue::String(key.into()));
        self
    }

    pub fn with_trace(mut self, trace: &TraceContext) -> Self {
        self.payload.insert(
            TRACE_ID_FIELD.to_string(),
            JsonValue::String(trace.trace_id().to_string()),
        );
        self
    }

    pub fn available_at(mut self, at: DateTime<Utc>) -> Self {
        self.available_at = Some(at);
        self
    }
}

/// A job as held by the queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedJob {
    pub id: JobId,
    pub kind: JobKind,
    pub subject_type: String,
    pub subject_id: String,
    pub payload: Map<String, JsonValue>,
    pub status: JobStatus,
    /// Number of deliveries so far; incremented on every claim.
    pub attempt: u32,
    pub available_at: DateTime<Utc>,
    /// Set while running; the job may be re-claimed once it passes.
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub last_error_kind: Option<ErrorKind>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl QueuedJob {
    pub fn from_new(id: JobId, new: NewJob, now: DateTime<Utc>) -> Self {
        Self {
            id,
            kind: new.kind,
            subject_type: new.subject_type,
            subject_id: new.subject_id,
            payload: new.payload,
            status: JobStatus::Queued,
            attempt: 0,
            available_at: new.available_at.unwrap_or(now),
            lease_expires_at: None,
            last_error_kind: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Queued and due, or running with an expired lease.
    pub fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        match self.status {
            JobStatus::Queued => self.available_at <= now,
            JobStatus::Running => self.lease_expires_at.is_some_and(|lease| lease <= now),
            _ => false,
        }
    }

    pub fn claimed(&self) -> ClaimedJob {
        ClaimedJob {
            job_id: self.id.clone(),
            kind: self.kind.clone(),
            subject_type: self.subject_type.clone(),
            subject_id: self.subject_id.clone(),
            payload: self.payload.clone(),
            attempt: self.attempt,
        }
    }
}

/// What a worker receives from `claim_next`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClaimedJob {
    pub job_id: JobId,
    pub kind: JobKind,
    pub subject_type: String,
    pub subject_id: String,
    pub payload: Map<String, JsonValue>,
    /// Delivery number of this claim (1 on first delivery).
    pub attempt: u32,
}

impl ClaimedJob {
    /// The task this job advances.
    pub fn task_id(&self) -> Result<TaskId, DomainError> {
        if self.subject_type != TASK_SUBJECT {
            return Err(DomainError::validation(format!(
                "job {} targets a {}, not a task",
                self.job_id, self.subject_type
            )));
        }
        TaskId::new(self.subject_id.clone())
    }

    fn payload_str(&self, field: &str) -> Option<&str> {
        self.payload.get(field).and_then(JsonValue::as_str)
    }

    pub fn trace(&self) -> TraceContext {
        TraceContext::ensure(self.payload_str(TRACE_ID_FIELD))
    }
}

/// Result of `JobQueue::mark_failed`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum FailureOutcome {
    /// Back to `queued`, eligible again at `available_at`.
    Rescheduled {
        attempt: u32,
        available_at: DateTime<Utc>,
    },
    /// Terminally `failed`; no further deliveries.
    Failed { attempts: u32 },
}

impl FailureOutcome {
    pub fn is_terminal(&self) -> bool {
        matches!(self, FailureOutcome::Failed { .. })
    }
}

/// Job statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub queued: usize,
    pub running: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub dead_letter: usize,
}

impl QueueStats {
    pub fn record(&mut self, status: JobStatus) {
        match status {
            JobStatus::Queued => self.queued += 1,
            JobStatus::Running => self.running += 1,
            JobStatus::Succeeded => self.succeeded += 1,
            JobStatus::Failed => self.failed += 1,
            JobStatus::DeadLetter => self.dead_letter += 1,
        }
    }
}

/// A materialized unit of work: the value the reliability layer reasons about.
///
/// The idempotency key, not the job id, is the dedup unit: redeliveries of the
/// same logical work share it. Both the key and the trace id are echoed into
/// the payload for downstream propagation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    kind: JobKind,
    subject_type: String,
    subject_id: String,
    payload: Map<String, JsonValue>,
    idempotency_key: String,
    trace_id: String,
    attempt: u32,
}

impl Job {
    pub fn create(
        kind: JobKind,
        subject_type: impl Into<String>,
        subject_id: impl Into<String>,
        mut payload: Map<String, JsonValue>,
        idempotency_key: Option<String>,
        trace: &TraceContext,
        attempt: u32,
    ) -> Self {
        let subject_type = subject_type.into();
        let subject_id = subject_id.into();
        let idempotency_key = idempotency_key
            .filter(|k| !k.is_empty())
            .unwrap_or_else(|| {
                default_idempotency_key(&kind, &subject_type, &subject_id, &payload)
            });

        payload.insert(
            IDEMPOTENCY_KEY_FIELD.to_string(),
            JsonValue::String(idempotency_key.clone()),
        );
        payload.insert(
            TRACE_ID_FIELD.to_string(),
            JsonValue::String(trace.trace_id().to_string()),
        );

        Self {
            kind,
            subject_type,
            subject_id,
            payload,
            idempotency_key,
            trace_id: trace.trace_id().to_string(),
            attempt,
        }
    }

    /// Materialize from a claimed queue item, propagating key and trace.
    pub fn from_claimed(claimed: &ClaimedJob, trace: &TraceContext) -> Self {
        let key = claimed
            .payload_str(IDEMPOTENCY_KEY_FIELD)
            .map(str::to_string);
        Self::create(
            claimed.kind.clone(),
            claimed.subject_type.clone(),
            claimed.subject_id.clone(),
            claimed.payload.clone(),
            key,
            trace,
            claimed.attempt,
        )
    }

    pub fn kind(&self) -> &JobKind {
        &self.kind
    }

    pub fn subject_type(&self) -> &str {
        &self.subject_type
    }

    pub fn subject_id(&self) -> &str {
        &self.subject_id
    }

    pub fn payload(&self) -> &Map<String, JsonValue> {
        &self.payload
    }

    pub fn idempotency_key(&self) -> &str {
        &self.idempotency_key
    }

    pub fn trace_id(&self) -> &str {
        &self.trace_id
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}

/// `kind:subject_type:subject_id:correlation`, correlation defaulting to `nocorrelation`.
fn default_idempotency_key(
    kind: &JobKind,
    subject_type: &str,
    subject_id: &str,
    payload: &Map<String, JsonValue>,
) -> String {
    let correlation = match payload.get(CORRELATION_ID_FIELD) {
        Some(JsonValue::String(s)) => s.clone(),
        Some(JsonValue::Null) | None => "nocorrelation".to_string(),
        Some(other) => other.to_string(),
    };
    format!("{kind}:{subject_type}:{subject_id}:{correlation}")
}
