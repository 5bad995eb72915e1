//! Worker configuration, overridable from the environment.

use std::str::FromStr;
use std::time::Duration;

/// Worker configuration error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {key}: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

pub const BATCH_SIZE_ENV: &str = "FORGEJOBS_BATCH_SIZE";
pub const POLL_INTERVAL_ENV: &str = "FORGEJOBS_POLL_INTERVAL_SECS";
pub const CLEANUP_INTERVAL_ENV: &str = "FORGEJOBS_CLEANUP_INTERVAL_SECS";
pub const RETENTION_DAYS_ENV: &str = "FORGEJOBS_RETENTION_DAYS";
pub const WORKER_NAME_ENV: &str = "FORGEJOBS_WORKER_NAME";
pub const ONESHOT_ENV: &str = "FORGEJOBS_ONESHOT";
pub const DB_MAX_CONNECTIONS_ENV: &str = "FORGEJOBS_DB_MAX_CONNECTIONS";
pub const DATABASE_URL_ENV: &str = "DATABASE_URL";

/// Scheduler worker configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerConfig {
    /// Records processed per tick
    pub batch_size: usize,
    /// Time between ticks
    pub poll_interval: Duration,
    /// Time between retention cleanups
    pub cleanup_interval: Duration,
    /// Terminal records older than this are deleted
    pub retention_days: u32,
    /// Thread name and log field
    pub name: String,
    /// Run a single tick and exit
    pub oneshot: bool,
    /// Postgres connection string; `None` selects the in-memory store
    pub database_url: Option<String>,
    pub db_max_connections: u32,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            batch_size: 50,
            poll_interval: Duration::from_secs(60),
            cleanup_interval: Duration::from_secs(86_400),
            retention_days: 7,
            name: "forgejobs-worker".to_string(),
            oneshot: false,
            database_url: None,
            db_max_connections: 5,
        }
    }
}

impl WorkerConfig {
    /// Defaults overridden by any `FORGEJOBS_*` / `DATABASE_URL` variables set.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Like [`WorkerConfig::from_env`], reading variables through `lookup`.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(v) = var(BATCH_SIZE_ENV) {
            config.batch_size = parse_positive(BATCH_SIZE_ENV, &v)?;
        }
        if let Some(v) = var(POLL_INTERVAL_ENV) {
            config.poll_interval = Duration::from_secs(parse_positive(POLL_INTERVAL_ENV, &v)?);
        }
        if let Some(v) = var(CLEANUP_INTERVAL_ENV) {
            config.cleanup_interval = Duration::from_secs(parse_positive(CLEANUP_INTERVAL_ENV, &v)?);
        }
        if let Some(v) = var(RETENTION_DAYS_ENV) {
            config.retention_days = parse(RETENTION_DAYS_ENV, &v)?;
        }
        if let Some(v) = var(WORKER_NAME_ENV) {
            config.name = v.trim().to_string();
        }
        if let Some(v) = var(ONESHOT_ENV) {
            config.oneshot = parse_bool(ONESHOT_ENV, &v)?;
        }
        if let Some(v) = var(DB_MAX_CONNECTIONS_ENV) {
            config.db_max_connections = parse_positive(DB_MAX_CONNECTIONS_ENV, &v)?;
        }
        config.database_url = var(DATABASE_URL_ENV);

        Ok(config)
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_cleanup_interval(mut self, interval: Duration) -> Self {
        self.cleanup_interval = interval;
        self
    }

    pub fn with_retention_days(mut self, days: u32) -> Self {
        self.retention_days = days;
        self
    }

    pub fn with_oneshot(mut self, oneshot: bool) -> Self {
        self.oneshot = oneshot;
        self
    }

    pub fn with_database_url(mut self, url: impl Into<String>) -> Self {
        self.database_url = Some(url.into());
        self
    }
}

fn parse<T>(key: &'static str, value: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    value.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
        key,
        value: value.to_string(),
        reason: e.to_string(),
    })
}

fn parse_positive<T>(key: &'static str, value: &str) -> Result<T, ConfigError>
where
    T: FromStr + PartialOrd + Default,
    T::Err: std::fmt::Display,
{
    let parsed: T = parse(key, value)?;
    if parsed <= T::default() {
        return Err(ConfigError::Invalid {
            key,
            value: value.to_string(),
            reason: "must be greater than zero".to_string(),
        });
    }
    Ok(parsed)
}

fn parse_bool(key: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::Invalid {
            key,
            value: value.to_string(),
            reason: "expected a boolean".to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn defaults_when_nothing_is_set() {
        let config = WorkerConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, WorkerConfig::default());
        assert_eq!(config.batch_size, 50);
        assert_eq!(config.poll_interval, Duration::from_secs(60));
        assert_eq!(config.retention_days, 7);
        assert!(config.database_url.is_none());
    }

    #[test]
    fn overrides_are_applied() {
        let config = WorkerConfig::from_lookup(lookup(&[
            (BATCH_SIZE_ENV, "10"),
            (POLL_INTERVAL_ENV, " 5 "),
            (CLEANUP_INTERVAL_ENV, "3600"),
            (RETENTION_DAYS_ENV, "0"),
            (WORKER_NAME_ENV, "reports"),
            (ONESHOT_ENV, "TRUE"),
            (DATABASE_URL_ENV, "postgres://localhost/jobs"),
        ]))
        .unwrap();

        assert_eq!(config.batch_size, 10);
        assert_eq!(config.poll_interval, Duration::from_secs(5));
        assert_eq!(config.cleanup_interval, Duration::from_secs(3600));
        assert_eq!(config.retention_days, 0);
        assert_eq!(config.name, "reports");
        assert!(config.oneshot);
        assert_eq!(config.database_url.as_deref(), Some("postgres://localhost/jobs"));
    }

    #[test]
    fn malformed_values_are_rejected() {
        let err = WorkerConfig::from_lookup(lookup(&[(BATCH_SIZE_ENV, "lots")])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: BATCH_SIZE_ENV, .. }));

        let err = WorkerConfig::from_lookup(lookup(&[(POLL_INTERVAL_ENV, "0")])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: POLL_INTERVAL_ENV, .. }));

        let err = WorkerConfig::from_lookup(lookup(&[(ONESHOT_ENV, "maybe")])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: ONESHOT_ENV, .. }));
    }

    #[test]
    fn blank_values_are_ignored() {
        let config = WorkerConfig::from_lookup(lookup(&[(DATABASE_URL_ENV, "  ")])).unwrap();
        assert!(config.database_url.is_none());
    }
}
