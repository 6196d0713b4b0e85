//! Strongly-typed identifiers used across the domain.
//!
//! Identifiers are opaque strings: any non-empty value up to
//! [`MAX_ID_LEN`] bytes is accepted, so ids minted by other systems (UUIDs,
//! database keys, `job-…` prefixes) round-trip unchanged.

use core::str::FromStr;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::DomainError;

/// Maximum identifier length in bytes.
pub const MAX_ID_LEN: usize = 255;

/// Identifier of a task (one listing moving through the pipeline).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TaskId(String);

/// Identifier of a queued job.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct JobId(String);

/// Identifier of an already-authenticated actor (user or service).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ActorId(String);

fn validate(name: &str, value: &str) -> Result<(), DomainError> {
    if value.is_empty() {
        return Err(DomainError::invalid_id(format!("{name}: must not be empty")));
    }
    if value.len() > MAX_ID_LEN {
        return Err(DomainError::invalid_id(format!(
            "{name}: {} bytes exceeds {MAX_ID_LEN}",
            value.len()
        )));
    }
    Ok(())
}

macro_rules! impl_string_id {
    ($t:ident, $name:literal, $prefix:literal) => {
        impl $t {
            /// Validate and wrap an existing identifier.
            pub fn new(value: impl Into<String>) -> Result<Self, DomainError> {
                let value = value.into();
                validate($name, &value)?;
                Ok(Self(value))
            }

            /// Mint a fresh, time-ordered identifier (UUIDv7).
            ///
            /// Prefer passing IDs explicitly in tests for determinism.
            pub fn generate() -> Self {
                Self(format!(concat!($prefix, "{}"), Uuid::now_v7()))
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl core::fmt::Display for $t {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl FromStr for $t {
            type Err = DomainError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::new(s)
            }
        }

        impl TryFrom<String> for $t {
            type Error = DomainError;

            fn try_from(value: String) -> Result<Self, Self::Error> {
                Self::new(value)
            }
        }

        impl From<$t> for String {
            fn from(value: $t) -> Self {
                value.0
            }
        }

        impl AsRef<str> for $t {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

impl_string_id!(TaskId, "TaskId", "");
impl_string_id!(JobId, "JobId", "job-");
impl_string_id!(ActorId, "ActorId", "actor-");
