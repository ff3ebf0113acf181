// Runtime tunables, read once from the process environment

use std::path::PathBuf;
use std::time::Duration;
use tracing::warn;

pub const ENV_QUERY_TTL: &str = "QUERY_TTL_SECONDS";
pub const ENV_QUERY_MAX_LIMIT: &str = "QUERY_MAX_LIMIT";
pub const ENV_QUERY_ASYNC_WORKERS: &str = "QUERY_ASYNC_WORKERS";
pub const ENV_BUILD_CMD: &str = "METRICFLOW_BUILD_CMD";
pub const ENV_BUILD_TIMEOUT: &str = "METRICFLOW_BUILD_TIMEOUT";
pub const ENV_PERF_LOG_PATH: &str = "METRICFLOW_PERF_LOG_PATH";

const DEFAULT_QUERY_TTL_SECONDS: u64 = 3_600;
const DEFAULT_QUERY_MAX_LIMIT: u64 = 10_000;
const DEFAULT_QUERY_ASYNC_WORKERS: usize = 4;
const DEFAULT_BUILD_TIMEOUT_SECONDS: u64 = 600;
const DEFAULT_BUILD_LOG_TAIL_LINES: usize = 200;

/// Service-wide knobs. Built once at startup; components take copies or
/// individual fields rather than re-reading the environment.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub query_ttl: Duration,
    pub query_max_limit: u64,
    pub query_async_workers: usize,
    pub build_timeout: Duration,
    pub build_log_tail_lines: usize,
    /// Whitespace-tokenized override of the compile command, if set.
    pub build_cmd_override: Option<Vec<String>>,
    pub perf_log_path: Option<PathBuf>,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            query_ttl: Duration::from_secs(DEFAULT_QUERY_TTL_SECONDS),
            query_max_limit: DEFAULT_QUERY_MAX_LIMIT,
            query_async_workers: DEFAULT_QUERY_ASYNC_WORKERS,
            build_timeout: Duration::from_secs(DEFAULT_BUILD_TIMEOUT_SECONDS),
            build_log_tail_lines: DEFAULT_BUILD_LOG_TAIL_LINES,
            build_cmd_override: None,
            perf_log_path: None,
        }
    }
}

impl ServiceConfig {
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(ttl) = parse_env::<u64>(ENV_QUERY_TTL) {
            config.query_ttl = Duration::from_secs(ttl);
        }
        if let Some(limit) = parse_env::<u64>(ENV_QUERY_MAX_LIMIT) {
            config.query_max_limit = limit;
        }
        if let Some(workers) = parse_env::<usize>(ENV_QUERY_ASYNC_WORKERS) {
            config.query_async_workers = workers.max(1);
        }
        if let Some(timeout) = parse_env::<u64>(ENV_BUILD_TIMEOUT) {
            config.build_timeout = Duration::from_secs(timeout);
        }
        config.build_cmd_override = std::env::var(ENV_BUILD_CMD).ok().and_then(|raw| {
            let tokens: Vec<String> = raw.split_whitespace().map(str::to_string).collect();
            if tokens.is_empty() {
                None
            } else {
                Some(tokens)
            }
        });
        config.perf_log_path = std::env::var(ENV_PERF_LOG_PATH).ok().map(PathBuf::from);
        config
    }
}

fn parse_env<T: std::str::FromStr>(name: &str) -> Option<T> {
    let raw = std::env::var(name).ok()?;
    match raw.parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!("ignoring unparseable {}={:?}", name, raw);
            None
        }
    }
}
