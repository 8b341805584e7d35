//! Engine configuration from environment variables or TOML.
//!
//! Values missing from the environment, or that fail to parse, fall back to
//! defaults. Out-of-range values are rejected by [`EngineConfig::validate`],
//! never clamped.
//!
//! # Environment Variables
//!
//! | Variable | Default | Description |
//! |---|---|---|
//! | `PNIO_REQUEST_MAX_BYTES` | 1048576 | Largest accepted request body |
//! | `PNIO_RESPONSE_MAX_BYTES` | 1048576 | Response buffer capacity |
//! | `PNIO_TIMEOUT_MS` | 1000 | Per-exchange deadline |
//! | `PNIO_WORKER_THREADS` | 0 | Worker threads (0 = one per CPU) |
//! | `PNIO_BLOCKING_POOL_SIZE` | 8 | Blocking pool threads (0 = no pool) |
//! | `PNIO_BLOCKING_QUEUE_SIZE` | 1024 | Jobs waiting for a blocking thread |
//! | `PNIO_QUEUE_CAPACITY` | 1024 | Normal capacity of each work queue |
//! | `PNIO_QUEUE_COUNT` | 1 | Number of work queues |
//! | `PNIO_IMPORTANT_CAPACITY` | unset | Bound on the important lane |
//! | `PNIO_ASYNC_THREADS` | 2 | Threads driving async steps |
//! | `PNIO_MAX_JOIN_DEPTH` | 8 | Nested tasks a joining worker may run |
//! | `PNIO_SWEEP_INTERVAL_MS` | 10 | Deadline sweep period (0 = no sweeper) |
//! | `PNIO_THREAD_NAME_PREFIX` | pnio | Worker thread name prefix |
//! | `PNIO_SHUTDOWN_TIMEOUT` | 30 | Graceful shutdown timeout (secs) |

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Exchange engine configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub request_max_bytes: usize,
    pub response_max_bytes: usize,
    pub timeout_ms: u64,
    pub worker_threads: usize,
    pub blocking_pool_size: usize,
    pub blocking_queue_size: usize,
    pub queue_capacity: usize,
    pub queue_count: usize,
    pub important_capacity: Option<usize>,
    pub async_threads: usize,
    pub max_join_depth: usize,
    pub sweep_interval_ms: u64,
    pub thread_name_prefix: String,
    #[serde(with = "secs")]
    pub shutdown_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            request_max_bytes: 1024 * 1024,
            response_max_bytes: 1024 * 1024,
            timeout_ms: 1000,
            worker_threads: 0,
            blocking_pool_size: 8,
            blocking_queue_size: 1024,
            queue_capacity: 1024,
            queue_count: 1,
            important_capacity: None,
            async_threads: 2,
            max_join_depth: 8,
            sweep_interval_ms: 10,
            thread_name_prefix: "pnio".to_string(),
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

/// Effective runtime configuration summary (serializable).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EffectiveConfig {
    pub request_max_bytes: usize,
    pub response_max_bytes: usize,
    pub timeout_ms: u64,
    pub worker_threads: usize,
    pub blocking_pool_size: usize,
    pub blocking_queue_size: usize,
    pub queue_capacity: usize,
    pub queue_count: usize,
    pub important_capacity: Option<usize>,
    pub async_threads: usize,
    pub max_join_depth: usize,
    pub sweep_interval_ms: u64,
    pub thread_name_prefix: String,
    pub shutdown_timeout_secs: u64,
}

/// Parse a `usize` env var, returning `default` on missing or invalid.
fn parse_usize(key: &str, default: usize) -> usize {
    match std::env::var(key) {
        Ok(val) => val.parse::<usize>().unwrap_or(default),
        Err(_) => default,
    }
}

/// Parse a `u64` env var, returning `default` on missing or invalid.
fn parse_u64(key: &str, default: u64) -> u64 {
    match std::env::var(key) {
        Ok(val) => val.parse::<u64>().unwrap_or(default),
        Err(_) => default,
    }
}

/// Parse an optional `usize` env var. Unset or invalid means `None`.
fn parse_opt_usize(key: &str) -> Option<usize> {
    std::env::var(key).ok().and_then(|val| val.parse::<usize>().ok())
}

/// Load configuration from `PNIO_*` environment variables.
///
/// Missing or invalid values fall back to defaults without panicking.
pub fn load() -> EngineConfig {
    let d = EngineConfig::default();
    EngineConfig {
        request_max_bytes: parse_usize("PNIO_REQUEST_MAX_BYTES", d.request_max_bytes),
        response_max_bytes: parse_usize("PNIO_RESPONSE_MAX_BYTES", d.response_max_bytes),
        timeout_ms: parse_u64("PNIO_TIMEOUT_MS", d.timeout_ms),
        worker_threads: parse_usize("PNIO_WORKER_THREADS", d.worker_threads),
        blocking_pool_size: parse_usize("PNIO_BLOCKING_POOL_SIZE", d.blocking_pool_size),
        blocking_queue_size: parse_usize("PNIO_BLOCKING_QUEUE_SIZE", d.blocking_queue_size),
        queue_capacity: parse_usize("PNIO_QUEUE_CAPACITY", d.queue_capacity),
        queue_count: parse_usize("PNIO_QUEUE_COUNT", d.queue_count),
        important_capacity: parse_opt_usize("PNIO_IMPORTANT_CAPACITY"),
        async_threads: parse_usize("PNIO_ASYNC_THREADS", d.async_threads),
        max_join_depth: parse_usize("PNIO_MAX_JOIN_DEPTH", d.max_join_depth),
        sweep_interval_ms: parse_u64("PNIO_SWEEP_INTERVAL_MS", d.sweep_interval_ms),
        thread_name_prefix: std::env::var("PNIO_THREAD_NAME_PREFIX")
            .unwrap_or(d.thread_name_prefix),
        shutdown_timeout: Duration::from_secs(parse_u64(
            "PNIO_SHUTDOWN_TIMEOUT",
            d.shutdown_timeout.as_secs(),
        )),
    }
}

impl EngineConfig {
    /// Parse a TOML document. Absent keys keep their defaults.
    pub fn from_toml_str(input: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(input)?)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Deadline sweep period, `None` when disabled.
    pub fn sweep_interval(&self) -> Option<Duration> {
        (self.sweep_interval_ms > 0).then(|| Duration::from_millis(self.sweep_interval_ms))
    }

    /// Worker thread count with `0` resolved to the CPU count.
    pub fn effective_worker_threads(&self) -> usize {
        if self.worker_threads == 0 {
            num_cpus::get().max(1)
        } else {
            self.worker_threads
        }
    }

    /// Check every bound the engine relies on.
    pub fn validate(&self) -> Result<(), ConfigError> {
        fn positive(field: &'static str, value: u64) -> Result<(), ConfigError> {
            if value == 0 {
                return Err(ConfigError::Invalid { field, reason: "must be greater than zero".into() });
            }
            Ok(())
        }

        positive("timeout_ms", self.timeout_ms)?;
        positive("response_max_bytes", self.response_max_bytes as u64)?;
        positive("request_max_bytes", self.request_max_bytes as u64)?;
        positive("queue_capacity", self.queue_capacity as u64)?;
        positive("queue_count", self.queue_count as u64)?;
        positive("async_threads", self.async_threads as u64)?;

        let workers = self.effective_worker_threads();
        if self.queue_count > workers {
            return Err(ConfigError::Invalid {
                field: "queue_count",
                reason: format!("{} queues but only {workers} worker threads", self.queue_count),
            });
        }
        if self.blocking_pool_size > 0 && self.blocking_queue_size == 0 {
            return Err(ConfigError::Invalid {
                field: "blocking_queue_size",
                reason: "must be greater than zero when a blocking pool is configured".into(),
            });
        }
        if self.important_capacity == Some(0) {
            return Err(ConfigError::Invalid {
                field: "important_capacity",
                reason: "use no bound instead of zero".into(),
            });
        }
        Ok(())
    }

    /// Return a serializable summary of all effective values.
    pub fn effective_config(&self) -> EffectiveConfig {
        EffectiveConfig {
            request_max_bytes: self.request_max_bytes,
            response_max_bytes: self.response_max_bytes,
            timeout_ms: self.timeout_ms,
            worker_threads: self.effective_worker_threads(),
            blocking_pool_size: self.blocking_pool_size,
            blocking_queue_size: self.blocking_queue_size,
            queue_capacity: self.queue_capacity,
            queue_count: self.queue_count,
            important_capacity: self.important_capacity,
            async_threads: self.async_threads,
            max_join_depth: self.max_join_depth,
            sweep_interval_ms: self.sweep_interval_ms,
            thread_name_prefix: self.thread_name_prefix.clone(),
            shutdown_timeout_secs: self.shutdown_timeout.as_secs(),
        }
    }
}

mod secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // Serialize env-mutating tests to avoid cross-test pollution.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    const ENV_KEYS: &[&str] = &[
        "PNIO_REQUEST_MAX_BYTES",
        "PNIO_RESPONSE_MAX_BYTES",
        "PNIO_TIMEOUT_MS",
        "PNIO_WORKER_THREADS",
        "PNIO_BLOCKING_POOL_SIZE",
        "PNIO_BLOCKING_QUEUE_SIZE",
        "PNIO_QUEUE_CAPACITY",
        "PNIO_QUEUE_COUNT",
        "PNIO_IMPORTANT_CAPACITY",
        "PNIO_ASYNC_THREADS",
        "PNIO_MAX_JOIN_DEPTH",
        "PNIO_SWEEP_INTERVAL_MS",
        "PNIO_THREAD_NAME_PREFIX",
        "PNIO_SHUTDOWN_TIMEOUT",
    ];

    fn clear_env_vars() {
        for k in ENV_KEYS {
            std::env::remove_var(k);
        }
    }

    #[test]
    fn test_defaults_are_sensible() {
        let _lock = ENV_LOCK.lock().unwrap();
        clear_env_vars();
        let cfg = load();
        assert_eq!(cfg, EngineConfig::default());
        assert_eq!(cfg.timeout(), Duration::from_secs(1));
        assert!(cfg.important_capacity.is_none());
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_env_vars_override_defaults() {
        let _lock = ENV_LOCK.lock().unwrap();
        clear_env_vars();
        std::env::set_var("PNIO_TIMEOUT_MS", "250");
        std::env::set_var("PNIO_QUEUE_CAPACITY", "64");
        std::env::set_var("PNIO_IMPORTANT_CAPACITY", "16");
        std::env::set_var("PNIO_THREAD_NAME_PREFIX", "edge");
        std::env::set_var("PNIO_SHUTDOWN_TIMEOUT", "5");
        let cfg = load();
        assert_eq!(cfg.timeout_ms, 250);
        assert_eq!(cfg.queue_capacity, 64);
        assert_eq!(cfg.important_capacity, Some(16));
        assert_eq!(cfg.thread_name_prefix, "edge");
        assert_eq!(cfg.shutdown_timeout, Duration::from_secs(5));
        clear_env_vars();
    }

    #[test]
    fn test_invalid_env_falls_back_to_default() {
        let _lock = ENV_LOCK.lock().unwrap();
        clear_env_vars();
        std::env::set_var("PNIO_TIMEOUT_MS", "soon");
        std::env::set_var("PNIO_QUEUE_COUNT", "-3");
        std::env::set_var("PNIO_IMPORTANT_CAPACITY", "lots");
        let cfg = load();
        assert_eq!(cfg.timeout_ms, 1000);
        assert_eq!(cfg.queue_count, 1);
        assert!(cfg.important_capacity.is_none());
        clear_env_vars();
    }

    #[test]
    fn test_zero_values_are_rejected_not_clamped() {
        for field in ["timeout_ms", "response_max_bytes", "request_max_bytes", "queue_capacity", "queue_count"] {
            let mut cfg = EngineConfig { worker_threads: 4, ..Default::default() };
            match field {
                "timeout_ms" => cfg.timeout_ms = 0,
                "response_max_bytes" => cfg.response_max_bytes = 0,
                "request_max_bytes" => cfg.request_max_bytes = 0,
                "queue_capacity" => cfg.queue_capacity = 0,
                _ => cfg.queue_count = 0,
            }
            match cfg.validate() {
                Err(ConfigError::Invalid { field: f, .. }) => assert_eq!(f, field),
                other => panic!("{field}: expected invalid, got {other:?}"),
            }
        }
    }

    #[test]
    fn test_more_queues_than_workers_is_rejected() {
        let cfg = EngineConfig { worker_threads: 2, queue_count: 3, ..Default::default() };
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::Invalid { field: "queue_count", .. })
        ));
    }

    #[test]
    fn test_toml_overrides_and_defaults() {
        let cfg = EngineConfig::from_toml_str(
            r#"
            timeout_ms = 100
            queue_count = 2
            worker_threads = 4
            important_capacity = 8
            shutdown_timeout = 3
            "#,
        )
        .unwrap();
        assert_eq!(cfg.timeout_ms, 100);
        assert_eq!(cfg.queue_count, 2);
        assert_eq!(cfg.important_capacity, Some(8));
        assert_eq!(cfg.shutdown_timeout, Duration::from_secs(3));
        assert_eq!(cfg.queue_capacity, 1024);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_malformed_toml_is_a_parse_error() {
        let err = EngineConfig::from_toml_str("timeout_ms = \"fast\"").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_from_file_reads_toml() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        std::io::Write::write_all(&mut file, b"queue_capacity = 12\n").unwrap();
        let cfg = EngineConfig::from_file(file.path()).unwrap();
        assert_eq!(cfg.queue_capacity, 12);
    }

    #[test]
    fn test_effective_config_resolves_worker_threads() {
        let cfg = EngineConfig::default();
        let eff = cfg.effective_config();
        assert!(eff.worker_threads >= 1);
        assert_eq!(eff.shutdown_timeout_secs, 30);
        let json = serde_json::to_value(&eff).unwrap();
        assert_eq!(json["important_capacity"], serde_json::Value::Null);
    }
}
