//! Uniform result contract for side-effecting integrations.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

use crate::error_kind::ErrorKind;

/// What every stage integration returns.
///
/// Expected failure modes are values, never panics. A failed result carries the
/// kind and the adapter's own retryability verdict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntegrationResult {
    success: bool,
    #[serde(default)]
    payload: Map<String, JsonValue>,
    error_kind: Option<ErrorKind>,
    retryable: bool,
}

impl IntegrationResult {
    pub fn succeeded(payload: Map<String, JsonValue>) -> Self {
        Self {
            success: true,
            payload,
            error_kind: None,
            retryable: false,
        }
    }

    pub fn succeeded_empty() -> Self {
        Self::succeeded(Map::new())
    }

    pub fn failed(kind: ErrorKind, retryable: bool) -> Self {
        Self {
            success: false,
            payload: Map::new(),
            error_kind: Some(kind),
            retryable,
        }
    }

    /// Failure whose retryability follows the taxonomy table.
    pub fn failed_with(kind: ErrorKind) -> Self {
        Self::failed(kind, kind.is_retryable())
    }

    pub fn is_success(&self) -> bool {
        self.success
    }

    pub fn is_retryable(&self) -> bool {
        self.retryable
    }

    pub fn payload(&self) -> &Map<String, JsonValue> {
        &self.payload
    }

    pub fn into_payload(self) -> Map<String, JsonValue> {
        self.payload
    }

    /// Kind reported for a failure. A failure without one is `Unknown`.
    pub fn error_kind(&self) -> Option<ErrorKind> {
        if self.success {
            None
        } else {
            Some(self.error_kind.unwrap_or(ErrorKind::Unknown))
        }
    }
}
