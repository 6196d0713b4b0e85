//! Explicit trace context.
//!
//! There is no process-wide "current trace": every handler receives the
//! context it should log under and propagate downstream.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TraceContext {
    trace_id: String,
}

impl TraceContext {
    /// Start a new trace.
    pub fn new() -> Self {
        Self {
            trace_id: Uuid::now_v7().to_string(),
        }
    }

    /// Continue an existing trace.
    pub fn from_id(trace_id: impl Into<String>) -> Self {
        Self {
            trace_id: trace_id.into(),
        }
    }

    /// Continue `trace_id` when present and non-empty, otherwise start a new trace.
    pub fn ensure(trace_id: Option<&str>) -> Self {
        match trace_id {
            Some(id) if !id.is_empty() => Self::from_id(id),
            _ => Self::new(),
        }
    }

    pub fn trace_id(&self) -> &str {
        &self.trace_id
    }
}

impl Default for TraceContext {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Display for TraceContext {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.trace_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ensure_keeps_existing_trace() {
        assert_eq!(TraceContext::ensure(Some("abc")).trace_id(), "abc");
        assert!(!TraceContext::ensure(Some("")).trace_id().is_empty());
        assert_ne!(TraceContext::ensure(None), TraceContext::ensure(None));
    }
}
