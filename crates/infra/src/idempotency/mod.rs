//! Idempotency keys: at-most-once side effects under at-least-once delivery.
//!
//! A key is `in_flight` between `acquire` and `commit`/`release`, and
//! `committed` forever after a successful run. `acquire` on a key that is
//! in flight or committed returns `false`; callers treat that as "already
//! handled" and skip the side effect.
//!
//! In-flight keys older than the configured TTL may be re-acquired, so a
//! worker that died mid-job does not pin its key forever. Each acquire hands
//! out a [`KeyClaim`]; `release` only removes the slot while that claim is
//! still the current holder.

pub mod postgres;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};

use carpipe_core::{Clock, SystemClock};

pub use postgres::PostgresIdempotencyStore;

/// Default time after which an in-flight key is considered abandoned: three
/// default job leases.
pub const DEFAULT_IN_FLIGHT_TTL_SECS: i64 = 900;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyState {
    InFlight,
    Committed,
}

impl KeyState {
    pub fn as_str(self) -> &'static str {
        match self {
            KeyState::InFlight => "in_flight",
            KeyState::Committed => "committed",
        }
    }
}

impl std::str::FromStr for KeyState {
    type Err = IdempotencyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "in_flight" => Ok(KeyState::InFlight),
            "committed" => Ok(KeyState::Committed),
            other => Err(IdempotencyError::Storage(format!(
                "unknown idempotency key state: {other}"
            ))),
        }
    }
}

/// Ownership of an in-flight key, identified by the instant it was acquired.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyClaim {
    key: String,
    acquired_at: DateTime<Utc>,
}

impl KeyClaim {
    /// Timestamps are kept at microsecond precision to match Postgres.
    pub(crate) fn new(key: &str, acquired_at: DateTime<Utc>) -> Self {
        Self {
            key: key.to_string(),
            acquired_at: acquired_at.trunc_subsecs(6),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn acquired_at(&self) -> DateTime<Utc> {
        self.acquired_at
    }
}

pub trait IdempotencyStore: Send + Sync {
    /// `Some` when the caller now owns the key; `None` when it is already in
    /// flight elsewhere or committed.
    fn acquire(&self, key: &str) -> Result<Option<KeyClaim>, IdempotencyError>;

    /// Mark the key's work as done. Later acquires return `None` forever.
    /// The key is committed even if the claim was taken over meanwhile, since
    /// the side effect already ran; returns whether the claim was still held.
    fn commit(&self, claim: &KeyClaim) -> Result<bool, IdempotencyError>;

    /// Give the key back after a failed run so a retry can acquire it. Only
    /// the current holder's slot is removed; returns whether it was.
    fn release(&self, claim: &KeyClaim) -> Result<bool, IdempotencyError>;

    fn state(&self, key: &str) -> Result<Option<KeyState>, IdempotencyError>;
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum IdempotencyError {
    #[error("idempotency key must not be empty")]
    EmptyKey,
    #[error("storage error: {0}")]
    Storage(String),
}

pub(crate) fn check_key(key: &str) -> Result<(), IdempotencyError> {
    if key.is_empty() {
        return Err(IdempotencyError::EmptyKey);
    }
    Ok(())
}

#[derive(Debug, Clone, Copy)]
struct Slot {
    state: KeyState,
    acquired_at: DateTime<Utc>,
}

/// In-memory idempotency store for tests/dev.
pub struct InMemoryIdempotencyStore {
    keys: Mutex<HashMap<String, Slot>>,
    clock: Arc<dyn Clock>,
    in_flight_ttl: chrono::Duration,
}

impl InMemoryIdempotencyStore {
    pub fn new() -> Self {
        Self {
            keys: Mutex::new(HashMap::new()),
            clock: Arc::new(SystemClock),
            in_flight_ttl: chrono::Duration::seconds(DEFAULT_IN_FLIGHT_TTL_SECS),
        }
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_in_flight_ttl(mut self, ttl: chrono::Duration) -> Self {
        self.in_flight_ttl = ttl;
        self
    }
}

impl Default for InMemoryIdempotencyStore {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for InMemoryIdempotencyStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryIdempotencyStore")
            .field("in_flight_ttl", &self.in_flight_ttl)
            .finish_non_exhaustive()
    }
}

impl IdempotencyStore for InMemoryIdempotencyStore {
    fn acquire(&self, key: &str) -> Result<Option<KeyClaim>, IdempotencyError> {
        check_key(key)?;
        let now = self.clock.now();
        let mut keys = self.keys.lock().unwrap();

        match keys.get(key) {
            Some(slot) if slot.state == KeyState::Committed => Ok(None),
            Some(slot) if now < slot.acquired_at + self.in_flight_ttl => Ok(None),
            _ => {
                let claim = KeyClaim::new(key, now);
                keys.insert(
                    key.to_string(),
                    Slot {
                        state: KeyState::InFlight,
                        acquired_at: claim.acquired_at,
                    },
                );
                Ok(Some(claim))
            }
        }
    }

    fn commit(&self, claim: &KeyClaim) -> Result<bool, IdempotencyError> {
        check_key(&claim.key)?;
        let mut keys = self.keys.lock().unwrap();
        let slot = keys.entry(claim.key.clone()).or_insert(Slot {
            state: KeyState::Committed,
            acquired_at: claim.acquired_at,
        });
        let held = slot.acquired_at == claim.acquired_at;
        slot.state = KeyState::Committed;
        Ok(held)
    }

    fn release(&self, claim: &KeyClaim) -> Result<bool, IdempotencyError> {
        check_key(&claim.key)?;
        let mut keys = self.keys.lock().unwrap();
        let held = keys.get(&claim.key).is_some_and(|slot| {
            slot.state == KeyState::InFlight && slot.acquired_at == claim.acquired_at
        });
        if held {
            keys.remove(&claim.key);
        }
        Ok(held)
    }

    fn state(&self, key: &str) -> Result<Option<KeyState>, IdempotencyError> {
        let keys = self.keys.lock().unwrap();
        Ok(keys.get(key).map(|slot| slot.state))
    }
}

impl<S: IdempotencyStore + ?Sized> IdempotencyStore for Arc<S> {
    fn acquire(&self, key: &str) -> Result<Option<KeyClaim>, IdempotencyError> {
        (**self).acquire(key)
    }

    fn commit(&self, claim: &KeyClaim) -> Result<bool, IdempotencyError> {
        (**self).commit(claim)
    }

    fn release(&self, claim: &KeyClaim) -> Result<bool, IdempotencyError> {
        (**self).release(claim)
    }

    fn state(&self, key: &str) -> Result<Option<KeyState>, IdempotencyError> {
        (**self).state(key)
    }
}
