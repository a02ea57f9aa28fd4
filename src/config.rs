use std::{env, str::FromStr, time::Duration};

use crate::{telemetry::LogFormat, Error, Result};

/// Runtime knobs of the operator, read from the environment by the binary.
#[derive(Clone, Debug)]
pub struct OperatorConfig {
    /// Namespace to watch, all namespaces when unset
    pub watch_namespace: Option<String>,
    /// Number of concurrent reconcile workers
    pub workers: usize,
    /// Transient failures tolerated per object before giving up on it
    pub max_requeues: u32,
    /// Initial delay of the per-object exponential backoff
    pub backoff_base: Duration,
    /// Upper bound of the per-object exponential backoff
    pub backoff_max: Duration,
    /// How long to wait for workloads to become ready (or go away)
    pub readiness_timeout: Duration,
    /// Poll interval used while waiting
    pub poll_interval: Duration,
    /// Requeue delay while prerequisite secrets are missing
    pub dependency_requeue: Duration,
    /// Period of the full resync of all known databases
    pub resync_period: Duration,
    pub listen_addr: String,
    pub log_format: LogFormat,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            watch_namespace: None,
            workers: 2,
            max_requeues: 5,
            backoff_base: Duration::from_millis(500),
            backoff_max: Duration::from_secs(300),
            readiness_timeout: Duration::from_secs(300),
            poll_interval: Duration::from_secs(2),
            dependency_requeue: Duration::from_secs(10),
            resync_period: Duration::from_secs(600),
            listen_addr: "0.0.0.0:8080".into(),
            log_format: LogFormat::Compact,
        }
    }
}

impl OperatorConfig {
    /// Build the config from process environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build the config from an arbitrary key lookup, falling back to defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Self::default();
        let secs = |key: &str, fallback: Duration| -> Result<Duration> {
            Ok(parse::<u64>(&lookup, key)?.map_or(fallback, Duration::from_secs))
        };
        let millis = |key: &str, fallback: Duration| -> Result<Duration> {
            Ok(parse::<u64>(&lookup, key)?.map_or(fallback, Duration::from_millis))
        };

        let config = Self {
            watch_namespace: lookup("WATCH_NAMESPACE").filter(|ns| !ns.is_empty()),
            workers: parse(&lookup, "WORKERS")?.unwrap_or(defaults.workers),
            max_requeues: parse(&lookup, "MAX_REQUEUES")?.unwrap_or(defaults.max_requeues),
            backoff_base: millis("BACKOFF_BASE_MS", defaults.backoff_base)?,
            backoff_max: secs("BACKOFF_MAX_SECS", defaults.backoff_max)?,
            readiness_timeout: secs("READINESS_TIMEOUT_SECS", defaults.readiness_timeout)?,
            poll_interval: secs("READINESS_POLL_SECS", defaults.poll_interval)?,
            dependency_requeue: secs("DEPENDENCY_REQUEUE_SECS", defaults.dependency_requeue)?,
            resync_period: secs("RESYNC_SECS", defaults.resync_period)?,
            listen_addr: lookup("LISTEN_ADDR").unwrap_or(defaults.listen_addr),
            log_format: lookup("LOG_FORMAT")
                .map(|f| LogFormat::parse(&f))
                .unwrap_or(defaults.log_format),
        };

        if config.workers == 0 {
            return Err(Error::Config("WORKERS must be at least 1".into()));
        }
        Ok(config)
    }
}

fn parse<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>> {
    lookup(key)
        .map(|raw| {
            raw.trim()
                .parse::<T>()
                .map_err(|_| Error::Config(format!("{key} has an unparsable value {raw:?}")))
        })
        .transpose()
}
