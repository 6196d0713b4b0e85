//! Failure taxonomy used for every retry decision.
//!
//! Adapter and transport failures are normalized into [`ErrorKind`] before any
//! retry decision is made. The taxonomy is closed; retryability is a fixed
//! table ([`ErrorKind::is_retryable`]).
//!
//! Integration adapters historically reported a second, narrower set of codes.
//! They are accepted by [`ErrorKind::from_str`] and mapped as follows:
//!
//! | Integration code          | ErrorKind    |
//! |---------------------------|--------------|
//! | `integration_unavailable` | `Transient`  |
//! | `rate_limited`            | `RateLimit`  |
//! | `validation_error`        | `BadInput`   |
//! | `security_denied`         | `Auth`       |
//! | `not_found`               | `NotFound`   |
//! | `internal_error`          | `Permanent`  |

use core::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

use crate::error::DomainError;
use crate::trace::TraceContext;

/// Closed set of failure kinds.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Temporary failure (network blip, integration unavailable).
    Transient,
    /// Upstream throttling.
    RateLimit,
    /// Unclassified failure.
    Unknown,
    /// Will never succeed on retry.
    Permanent,
    /// Credentials or permissions rejected.
    Auth,
    /// Input cannot be processed as given.
    BadInput,
    /// Conflicting concurrent change.
    Conflict,
    /// Subject of the job does not exist.
    NotFound,
}

impl ErrorKind {
    pub const ALL: [ErrorKind; 8] = [
        ErrorKind::Transient,
        ErrorKind::RateLimit,
        ErrorKind::Unknown,
        ErrorKind::Permanent,
        ErrorKind::Auth,
        ErrorKind::BadInput,
        ErrorKind::Conflict,
        ErrorKind::NotFound,
    ];

    /// `Transient`, `RateLimit` and `Unknown` are retryable; everything else is not.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            ErrorKind::Transient | ErrorKind::RateLimit | ErrorKind::Unknown
        )
    }

    /// Canonical storage/wire name.
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Transient => "transient",
            ErrorKind::RateLimit => "rate_limit",
            ErrorKind::Unknown => "unknown",
            ErrorKind::Permanent => "permanent",
            ErrorKind::Auth => "auth",
            ErrorKind::BadInput => "bad_input",
            ErrorKind::Conflict => "conflict",
            ErrorKind::NotFound => "not_found",
        }
    }
}

impl core::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ErrorKind {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let kind = match s.to_ascii_lowercase().as_str() {
            "transient" | "integration_unavailable" => ErrorKind::Transient,
            "rate_limit" | "rate_limited" => ErrorKind::RateLimit,
            "unknown" => ErrorKind::Unknown,
            "permanent" | "internal_error" => ErrorKind::Permanent,
            "auth" | "security_denied" => ErrorKind::Auth,
            "bad_input" | "validation_error" => ErrorKind::BadInput,
            "conflict" => ErrorKind::Conflict,
            "not_found" => ErrorKind::NotFound,
            other => {
                return Err(DomainError::validation(format!("unknown error kind: {other}")));
            }
        };
        Ok(kind)
    }
}

/// Classifies normalized errors into retryable / non-retryable.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ErrorClassifier;

impl ErrorClassifier {
    pub fn is_retryable(&self, kind: ErrorKind) -> bool {
        kind.is_retryable()
    }

    pub fn classify(&self, error: &JobError) -> ErrorKind {
        error.kind
    }
}

/// A failure normalized at the reliability boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobError {
    pub code: String,
    pub kind: ErrorKind,
    pub message: String,
    #[serde(default)]
    pub details: Map<String, JsonValue>,
    pub trace_id: String,
}

impl JobError {
    pub fn new(
        code: impl Into<String>,
        kind: ErrorKind,
        message: impl Into<String>,
        trace: &TraceContext,
    ) -> Self {
        Self {
            code: code.into(),
            kind,
            message: message.into(),
            details: Map::new(),
            trace_id: trace.trace_id().to_string(),
        }
    }

    /// A failure reported by an adapter: its retryable flag decides the kind.
    pub fn from_adapter(
        code: impl Into<String>,
        retryable: bool,
        message: impl Into<String>,
        trace: &TraceContext,
    ) -> Self {
        let kind = if retryable {
            ErrorKind::Transient
        } else {
            ErrorKind::Permanent
        };
        Self::new(code, kind, message, trace)
    }

    /// Anything that was not reported through the adapter contract.
    pub fn unknown(message: impl Into<String>, trace: &TraceContext) -> Self {
        Self::new("internal_error", ErrorKind::Unknown, message, trace)
    }

    pub fn with_detail(mut self, key: impl Into<String>, value: impl Into<JsonValue>) -> Self {
        self.details.insert(key.into(), value.into());
        self
    }

    /// JSON view handed to failure callbacks; `fatal` marks a terminal decision.
    pub fn to_payload(&self, fatal: bool) -> JsonValue {
        serde_json::json!({
            "code": self.code,
            "kind": self.kind,
            "message": self.message,
            "details": self.details,
            "traceId": self.trace_id,
            "fatal": fatal,
        })
    }
}

impl core::fmt::Display for JobError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{} ({}): {}", self.code, self.kind, self.message)
    }
}

impl std::error::Error for JobError {}
