//! Process configuration, read once from the environment at startup.

use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use scribe_core::RetryPolicy;

pub const DEFAULT_HTTP_ADDR: &str = "0.0.0.0:8080";
pub const DEFAULT_DATABASE_URL: &str = "postgres://postgres@postgres:5432/scribe";
pub const DEFAULT_TASK_QUEUE: &str = "TRANSCRIBE_QUEUE";
pub const DEFAULT_UPLOAD_DIR: &str = "/app/data/uploads";
pub const DEFAULT_TRANSCRIBER_CMD: &str = "python3 scripts/whisper_transcribe.py";

/// Which job store backs the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum JobStoreKind {
    /// Durable, at `database_url`
    #[default]
    Postgres,
    /// Nothing survives a restart. Only for local runs and tests.
    Memory,
}

impl FromStr for JobStoreKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "postgres" => Ok(JobStoreKind::Postgres),
            "memory" => Ok(JobStoreKind::Memory),
            other => Err(format!("unknown job store: {other}")),
        }
    }
}

impl fmt::Display for JobStoreKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobStoreKind::Postgres => write!(f, "postgres"),
            JobStoreKind::Memory => write!(f, "memory"),
        }
    }
}

/// Everything the binary needs to wire the service.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub http_addr: SocketAddr,
    pub job_store: JobStoreKind,
    /// Ignored by the in-memory store.
    pub database_url: String,
    pub task_queue: String,
    pub upload_dir: PathBuf,
    pub transcriber_cmd: String,
    pub worker_count: usize,
    /// How long `POST /transcribe` waits for the job before giving up.
    pub request_timeout: Duration,
    pub retry: RetryPolicy,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            http_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            job_store: JobStoreKind::Postgres,
            database_url: DEFAULT_DATABASE_URL.to_string(),
            task_queue: DEFAULT_TASK_QUEUE.to_string(),
            upload_dir: PathBuf::from(DEFAULT_UPLOAD_DIR),
            transcriber_cmd: DEFAULT_TRANSCRIBER_CMD.to_string(),
            worker_count: 2,
            request_timeout: Duration::from_secs(2 * 60 * 60),
            retry: RetryPolicy::default(),
        }
    }
}

impl AppConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup. Unset or blank keys take the
    /// default; unparseable ones too, with a warning.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let defaults = Self::default();

        let http_addr = match (get("HTTP_ADDR"), get("HTTP_PORT")) {
            (Some(addr), _) => parse_or("HTTP_ADDR", &addr, defaults.http_addr),
            (None, Some(port)) => SocketAddr::from((
                [0, 0, 0, 0],
                parse_or("HTTP_PORT", &port, defaults.http_addr.port()),
            )),
            (None, None) => defaults.http_addr,
        };

        let retry = RetryPolicy {
            max_attempts: get("RETRY_MAX_ATTEMPTS")
                .map(|v| parse_or("RETRY_MAX_ATTEMPTS", &v, defaults.retry.max_attempts))
                .unwrap_or(defaults.retry.max_attempts),
            initial_backoff: get("RETRY_INITIAL_BACKOFF_MS")
                .map(|v| {
                    Duration::from_millis(parse_or(
                        "RETRY_INITIAL_BACKOFF_MS",
                        &v,
                        defaults.retry.initial_backoff.as_millis() as u64,
                    ))
                })
                .unwrap_or(defaults.retry.initial_backoff),
            backoff_multiplier: get("RETRY_BACKOFF_MULTIPLIER")
                .map(|v| parse_or("RETRY_BACKOFF_MULTIPLIER", &v, defaults.retry.backoff_multiplier))
                .unwrap_or(defaults.retry.backoff_multiplier),
            per_attempt_timeout: get("ATTEMPT_TIMEOUT_SECS")
                .map(|v| {
                    Duration::from_secs(parse_or(
                        "ATTEMPT_TIMEOUT_SECS",
                        &v,
                        defaults.retry.per_attempt_timeout.as_secs(),
                    ))
                })
                .unwrap_or(defaults.retry.per_attempt_timeout),
        };
        let retry = match retry.validate() {
            Ok(()) => retry,
            Err(e) => {
                tracing::warn!(error = %e, "invalid retry settings; using defaults");
                defaults.retry
            }
        };

        Self {
            http_addr,
            job_store: get("JOB_STORE")
                .map(|v| parse_or("JOB_STORE", &v, defaults.job_store))
                .unwrap_or(defaults.job_store),
            database_url: get("DATABASE_URL").unwrap_or(defaults.database_url),
            task_queue: get("TASK_QUEUE").unwrap_or(defaults.task_queue),
            upload_dir: get("UPLOAD_DIR").map(PathBuf::from).unwrap_or(defaults.upload_dir),
            transcriber_cmd: get("TRANSCRIBER_CMD").unwrap_or(defaults.transcriber_cmd),
            worker_count: get("WORKER_COUNT")
                .map(|v| parse_or("WORKER_COUNT", &v, defaults.worker_count))
                .unwrap_or(defaults.worker_count)
                .max(1),
            request_timeout: get("REQUEST_TIMEOUT_SECS")
                .map(|v| {
                    Duration::from_secs(parse_or(
                        "REQUEST_TIMEOUT_SECS",
                        &v,
                        defaults.request_timeout.as_secs(),
                    ))
                })
                .unwrap_or(defaults.request_timeout),
            retry,
        }
    }
}

fn parse_or<T: FromStr>(key: &str, value: &str, default: T) -> T {
    value.parse().unwrap_or_else(|_| {
        tracing::warn!(key, value, "unparseable setting; using default");
        default
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(vars: &[(&str, &str)]) -> AppConfig {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        AppConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults_when_nothing_is_set() {
        let cfg = config(&[]);

        assert_eq!(cfg.http_addr.to_string(), DEFAULT_HTTP_ADDR);
        assert_eq!(cfg.job_store, JobStoreKind::Postgres);
        assert_eq!(cfg.database_url, "postgres://postgres@postgres:5432/scribe");
        assert_eq!(cfg.task_queue, "TRANSCRIBE_QUEUE");
        assert_eq!(cfg.upload_dir, PathBuf::from("/app/data/uploads"));
        assert_eq!(cfg.transcriber_cmd, DEFAULT_TRANSCRIBER_CMD);
        assert_eq!(cfg.worker_count, 2);
        assert_eq!(cfg.request_timeout, Duration::from_secs(7200));
        assert_eq!(cfg.retry, RetryPolicy::default());
    }

    #[test]
    fn overrides_are_applied() {
        let cfg = config(&[
            ("HTTP_PORT", "9090"),
            ("DATABASE_URL", "postgres://localhost/scribe"),
            ("TASK_QUEUE", "GPU_QUEUE"),
            ("UPLOAD_DIR", "/tmp/uploads"),
            ("WORKER_COUNT", "4"),
            ("REQUEST_TIMEOUT_SECS", "30"),
            ("RETRY_MAX_ATTEMPTS", "3"),
            ("RETRY_INITIAL_BACKOFF_MS", "250"),
            ("RETRY_BACKOFF_MULTIPLIER", "1.5"),
            ("ATTEMPT_TIMEOUT_SECS", "60"),
        ]);

        assert_eq!(cfg.http_addr.to_string(), "0.0.0.0:9090");
        assert_eq!(cfg.database_url, "postgres://localhost/scribe");
        assert_eq!(cfg.task_queue, "GPU_QUEUE");
        assert_eq!(cfg.upload_dir, PathBuf::from("/tmp/uploads"));
        assert_eq!(cfg.worker_count, 4);
        assert_eq!(cfg.request_timeout, Duration::from_secs(30));
        assert_eq!(cfg.retry.max_attempts, 3);
        assert_eq!(cfg.retry.initial_backoff, Duration::from_millis(250));
        assert_eq!(cfg.retry.backoff_multiplier, 1.5);
        assert_eq!(cfg.retry.per_attempt_timeout, Duration::from_secs(60));
    }

    #[test]
    fn in_memory_store_must_be_asked_for() {
        assert_eq!(config(&[("JOB_STORE", "memory")]).job_store, JobStoreKind::Memory);
        assert_eq!(config(&[("JOB_STORE", "Memory")]).job_store, JobStoreKind::Memory);
        assert_eq!(config(&[("JOB_STORE", "postgres")]).job_store, JobStoreKind::Postgres);
        // A typo never silently drops durability
        assert_eq!(config(&[("JOB_STORE", "memroy")]).job_store, JobStoreKind::Postgres);
    }

    #[test]
    fn http_addr_wins_over_port() {
        let cfg = config(&[("HTTP_ADDR", "127.0.0.1:3000"), ("HTTP_PORT", "9090")]);
        assert_eq!(cfg.http_addr.to_string(), "127.0.0.1:3000");
    }

    #[test]
    fn garbage_falls_back_to_defaults() {
        let cfg = config(&[
            ("HTTP_PORT", "eighty"),
            ("WORKER_COUNT", "-1"),
            ("DATABASE_URL", "   "),
            ("RETRY_MAX_ATTEMPTS", "0"),
        ]);

        assert_eq!(cfg.http_addr.to_string(), DEFAULT_HTTP_ADDR);
        assert_eq!(cfg.worker_count, 2);
        assert_eq!(cfg.database_url, DEFAULT_DATABASE_URL);
        assert_eq!(cfg.job_store, JobStoreKind::Postgres);
        // Zero attempts parses but is not a valid policy
        assert_eq!(cfg.retry, RetryPolicy::default());
    }
}
