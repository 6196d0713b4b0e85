//! Domain error model.

use thiserror::Error;

/// Result type used across the domain layer.
pub type DomainResult<T> = Result<T, DomainError>;

/// Domain-level error.
///
/// Keep this focused on deterministic, business/domain failures (validation,
/// invariants). Infrastructure concerns belong elsewhere.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// A value failed validation (e.g. malformed input).
    #[error("validation failed: {0}")]
    Validation(String),

    /// A domain invariant was violated.
    #[error("invariant violated: {0}")]
    InvariantViolation(String),

    /// An identifier was invalid (empty, too long, unparsable).
    #[error("invalid identifier: {0}")]
    InvalidId(String),

    /// A state machine refused a transition.
    #[error(transparent)]
    InvalidTransition(#[from] InvalidTransition),
}

impl DomainError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn invariant(msg: impl Into<String>) -> Self {
        Self::InvariantViolation(msg.into())
    }

    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }
}

/// A refused state transition.
///
/// Raised loudly by state machines; it is never expected in correct operation.
/// `from` describes the current state (`stage:status`), `to` the attempted one.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("invalid state transition for {entity}: {from} -> {to}")]
pub struct InvalidTransition {
    pub entity: &'static str,
    pub from: String,
    pub to: String,
}

impl InvalidTransition {
    pub fn new(entity: &'static str, from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            entity,
            from: from.into(),
            to: to.into(),
        }
    }
}
