//! Worker configuration loaded from the environment.

use std::path::PathBuf;
use std::time::Duration;

use carpipe_core::RetryPolicy;

pub const WORKERS_VAR: &str = "CARPIPE_WORKERS";
pub const POLL_INTERVAL_VAR: &str = "CARPIPE_POLL_INTERVAL_MS";
pub const LEASE_VAR: &str = "CARPIPE_LEASE_SECS";
pub const MAX_ATTEMPTS_VAR: &str = "CARPIPE_MAX_ATTEMPTS";
pub const BACKOFF_VAR: &str = "CARPIPE_BACKOFF_SECONDS";
pub const DLQ_PATH_VAR: &str = "CARPIPE_DLQ_PATH";
pub const DATABASE_URL_VAR: &str = "DATABASE_URL";
pub const LOG_FORMAT_VAR: &str = "LOG_FORMAT";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid {var}={value:?}: {reason}")]
pub struct ConfigError {
    pub var: &'static str,
    pub value: String,
    pub reason: String,
}

impl ConfigError {
    fn new(var: &'static str, value: &str, reason: impl Into<String>) -> Self {
        Self {
            var,
            value: value.to_string(),
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerConfig {
    pub workers: usize,
    pub poll_interval: Duration,
    pub lease: Duration,
    pub max_attempts: u32,
    pub backoff_seconds: Vec<u64>,
    /// JSON-lines dead-letter file; in-memory when unset.
    pub dlq_path: Option<PathBuf>,
    /// Postgres backing; in-memory stores when unset.
    pub database_url: Option<String>,
    /// Raw `LOG_FORMAT`, parsed by the binary.
    pub log_format: String,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        let policy = RetryPolicy::default();
        Self {
            workers: 1,
            poll_interval: Duration::from_millis(1000),
            lease: Duration::from_secs(300),
            max_attempts: policy.max_attempts(),
            backoff_seconds: policy.backoff_seconds().to_vec(),
            dlq_path: None,
            database_url: None,
            log_format: "json".to_string(),
        }
    }
}

impl WorkerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Build from any variable source. Unset or blank variables keep their default.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |var: &str| lookup(var).filter(|v| !v.trim().is_empty());
        let mut config = Self::default();

        if let Some(v) = get(WORKERS_VAR) {
            config.workers = parse_positive(WORKERS_VAR, &v)?;
        }
        if let Some(v) = get(POLL_INTERVAL_VAR) {
            config.poll_interval = Duration::from_millis(parse_positive(POLL_INTERVAL_VAR, &v)?);
        }
        if let Some(v) = get(LEASE_VAR) {
            config.lease = Duration::from_secs(parse_positive(LEASE_VAR, &v)?);
        }
        if let Some(v) = get(MAX_ATTEMPTS_VAR) {
            config.max_attempts = parse_positive(MAX_ATTEMPTS_VAR, &v)?;
        }
        if let Some(v) = get(BACKOFF_VAR) {
            config.backoff_seconds = v
                .split(',')
                .map(|part| {
                    part.trim()
                        .parse::<u64>()
                        .map_err(|e| ConfigError::new(BACKOFF_VAR, &v, e.to_string()))
                })
                .collect::<Result<_, _>>()?;
        }
        config.dlq_path = get(DLQ_PATH_VAR).map(PathBuf::from);
        config.database_url = get(DATABASE_URL_VAR);
        if let Some(v) = get(LOG_FORMAT_VAR) {
            config.log_format = v;
        }

        // Surface a bad backoff table now rather than at first retry.
        RetryPolicy::new(config.max_attempts, config.backoff_seconds.clone())
            .map_err(|e| {
                ConfigError::new(BACKOFF_VAR, &join(&config.backoff_seconds), e.to_string())
            })?;

        Ok(config)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_attempts, self.backoff_seconds.clone()).unwrap_or_default()
    }

    pub fn lease(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.lease).unwrap_or_else(|_| chrono::Duration::seconds(300))
    }

    /// Running jobs renew their lease three times per lease period.
    pub fn heartbeat_interval(&self) -> Duration {
        self.lease / 3
    }

    /// In-flight idempotency keys stay owned for three lease periods.
    pub fn in_flight_ttl(&self) -> chrono::Duration {
        self.lease() * 3
    }
}

fn parse_positive<T>(var: &'static str, value: &str) -> Result<T, ConfigError>
where
    T: std::str::FromStr + PartialEq + Default,
    T::Err: std::fmt::Display,
{
    let parsed: T = value
        .trim()
        .parse()
        .map_err(|e: T::Err| ConfigError::new(var, value, e.to_string()))?;
    if parsed == T::default() {
        return Err(ConfigError::new(var, value, "must be greater than zero"));
    }
    Ok(parsed)
}

fn join(values: &[u64]) -> String {
    values
        .iter()
        .map(u64::to_string)
        .collect::<Vec<_>>()
        .join(",")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |var| vars.get(var).cloned()
    }

    #[test]
    fn defaults_when_nothing_is_set() {
        let config = WorkerConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, WorkerConfig::default());
        assert_eq!(config.backoff_seconds, vec![60, 300, 900]);
        assert_eq!(config.retry_policy(), RetryPolicy::default());
    }

    #[test]
    fn reads_every_variable() {
        let config = WorkerConfig::from_lookup(lookup(&[
            (WORKERS_VAR, "4"),
            (POLL_INTERVAL_VAR, "250"),
            (LEASE_VAR, "30"),
            (MAX_ATTEMPTS_VAR, "5"),
            (BACKOFF_VAR, "1, 2,3"),
            (DLQ_PATH_VAR, "/var/lib/carpipe/dlq.jsonl"),
            (DATABASE_URL_VAR, "postgres://localhost/carpipe"),
            (LOG_FORMAT_VAR, "pretty"),
        ]))
        .unwrap();

        assert_eq!(config.workers, 4);
        assert_eq!(config.poll_interval, Duration::from_millis(250));
        assert_eq!(config.lease(), chrono::Duration::seconds(30));
        assert_eq!(config.retry_policy().max_attempts(), 5);
        assert_eq!(config.retry_policy().backoff_seconds(), &[1, 2, 3]);
        assert_eq!(config.dlq_path, Some(PathBuf::from("/var/lib/carpipe/dlq.jsonl")));
        assert_eq!(config.database_url.as_deref(), Some("postgres://localhost/carpipe"));
        assert_eq!(config.log_format, "pretty");
    }

    #[test]
    fn blank_values_keep_defaults() {
        let config =
            WorkerConfig::from_lookup(lookup(&[(WORKERS_VAR, "  "), (DATABASE_URL_VAR, "")]))
                .unwrap();
        assert_eq!(config.workers, 1);
        assert_eq!(config.database_url, None);
    }

    #[test]
    fn invalid_values_name_the_variable() {
        let err = WorkerConfig::from_lookup(lookup(&[(WORKERS_VAR, "many")])).unwrap_err();
        assert_eq!(err.var, WORKERS_VAR);

        let err = WorkerConfig::from_lookup(lookup(&[(POLL_INTERVAL_VAR, "0")])).unwrap_err();
        assert_eq!(err.var, POLL_INTERVAL_VAR);
        assert!(err.to_string().contains("greater than zero"));

        let err = WorkerConfig::from_lookup(lookup(&[(BACKOFF_VAR, "60,soon")])).unwrap_err();
        assert_eq!(err.var, BACKOFF_VAR);
    }

    #[test]
    fn backoff_beyond_thirty_days_is_rejected() {
        let err =
            WorkerConfig::from_lookup(lookup(&[(BACKOFF_VAR, "100000000000000")])).unwrap_err();
        assert_eq!(err.var, BACKOFF_VAR);
        assert!(err.to_string().contains("must not exceed"));
    }

    #[test]
    fn in_flight_ttl_outlives_the_lease() {
        let config = WorkerConfig::from_lookup(lookup(&[(LEASE_VAR, "30")])).unwrap();
        assert_eq!(config.heartbeat_interval(), Duration::from_secs(10));
        assert_eq!(config.in_flight_ttl(), chrono::Duration::seconds(90));
        assert!(config.in_flight_ttl() > config.lease());
    }
}
