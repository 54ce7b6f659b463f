//! Configuration for a conformance run.
//!
//! Values come from built-in defaults, then `KCON_*` environment variables,
//! then command-line flags; each value remembers where it came from.
//! Problems are collected and reported together.

pub mod env;
pub mod source;

pub use env::{EnvError, EnvParser, expand_home};
pub use source::{ConfigSource, Sourced};

use std::path::PathBuf;
use std::time::Duration;

use regex::Regex;
use tracing::debug;

use crate::exec::ExecOptions;
use crate::poll::Poller;
use crate::pool::{DEFAULT_CLEANUP_TIMEOUT, DEFAULT_NAMESPACE_PREFIX, PoolConfig};
use crate::scheduler::{MAX_CONCURRENCY, SchedulerConfig};

/// Default cluster command.
pub const DEFAULT_KUBECTL: &str = "kubectl";

/// Longest prefix that still leaves room for a counter in a 63-character name.
pub const MAX_PREFIX_LEN: usize = 50;

const DEFAULT_POLL_INTERVAL_MS: u64 = 1000;

/// Invalid configuration, with every problem found.
#[derive(Debug, thiserror::Error)]
#[error("Invalid configuration: {}", .problems.join("; "))]
pub struct ConfigError {
    pub problems: Vec<String>,
}

/// Settings for one run.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub kubectl: Sourced<String>,
    pub namespace_prefix: Sourced<String>,
    pub concurrency: Sourced<usize>,
    pub cleanup_timeout: Sourced<Duration>,
    pub poll_interval: Sourced<Duration>,
    pub verbose: Sourced<bool>,
    pub scratch_dir: Sourced<Option<PathBuf>>,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            kubectl: Sourced::default_value(DEFAULT_KUBECTL.to_string()),
            namespace_prefix: Sourced::default_value(DEFAULT_NAMESPACE_PREFIX.to_string()),
            concurrency: Sourced::default_value(1),
            cleanup_timeout: Sourced::default_value(DEFAULT_CLEANUP_TIMEOUT),
            poll_interval: Sourced::default_value(Duration::from_millis(DEFAULT_POLL_INTERVAL_MS)),
            verbose: Sourced::default_value(false),
            scratch_dir: Sourced::default_value(None),
        }
    }
}

impl RunConfig {
    /// Defaults overlaid with `KCON_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut parser = EnvParser::new();
        let config = Self::from_parser(&mut parser);
        let errors = parser.take_errors();
        if errors.is_empty() {
            Ok(config)
        } else {
            Err(ConfigError {
                problems: errors.iter().map(ToString::to_string).collect(),
            })
        }
    }

    fn from_parser(parser: &mut EnvParser) -> Self {
        let cleanup = parser.get_range(
            "CLEANUP_TIMEOUT_SECS",
            DEFAULT_CLEANUP_TIMEOUT.as_secs(),
            1,
            3600,
            "whole seconds",
        );
        let interval = parser.get_range(
            "POLL_INTERVAL_MS",
            DEFAULT_POLL_INTERVAL_MS,
            10,
            60_000,
            "milliseconds",
        );
        Self {
            kubectl: parser.get_string("KUBECTL", DEFAULT_KUBECTL),
            namespace_prefix: parser.get_string("NAMESPACE_PREFIX", DEFAULT_NAMESPACE_PREFIX),
            concurrency: parser.get_range("CONCURRENCY", 1, 1, MAX_CONCURRENCY, "positive integer"),
            cleanup_timeout: map_sourced(cleanup, Duration::from_secs),
            poll_interval: map_sourced(interval, Duration::from_millis),
            verbose: parser.get_bool("VERBOSE", false),
            scratch_dir: parser.get_optional_path("SCRATCH_DIR"),
        }
    }

    /// Check values regardless of where they came from.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut problems = Vec::new();

        let concurrency = self.concurrency.value;
        if concurrency == 0 || concurrency > MAX_CONCURRENCY {
            problems.push(format!(
                "concurrency {concurrency} from {} is out of range (1..={MAX_CONCURRENCY})",
                self.concurrency.describe_source()
            ));
        }

        if !valid_prefix(&self.namespace_prefix.value) {
            problems.push(format!(
                "namespace prefix {:?} from {} must be lowercase alphanumerics or '-', start with a letter and be at most {MAX_PREFIX_LEN} characters",
                self.namespace_prefix.value,
                self.namespace_prefix.describe_source()
            ));
        }

        if self.cleanup_timeout.value.is_zero() {
            problems.push(format!(
                "cleanup timeout from {} must be positive",
                self.cleanup_timeout.describe_source()
            ));
        }

        if self.kubectl.value.trim().is_empty() {
            problems.push("cluster command must not be empty".to_string());
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(ConfigError { problems })
        }
    }

    /// Log every value with its origin at debug level.
    pub fn log_sources(&self) {
        debug!(value = %self.kubectl.value, source = %self.kubectl.describe_source(), "kubectl");
        debug!(value = %self.namespace_prefix.value, source = %self.namespace_prefix.describe_source(), "namespace_prefix");
        debug!(value = self.concurrency.value, source = %self.concurrency.describe_source(), "concurrency");
        debug!(value = ?self.cleanup_timeout.value, source = %self.cleanup_timeout.describe_source(), "cleanup_timeout");
        debug!(value = ?self.poll_interval.value, source = %self.poll_interval.describe_source(), "poll_interval");
        debug!(value = self.verbose.value, source = %self.verbose.describe_source(), "verbose");
        debug!(value = ?self.scratch_dir.value, source = %self.scratch_dir.describe_source(), "scratch_dir");
    }

    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            concurrency: self.concurrency.value,
            exec: ExecOptions {
                verbose: self.verbose.value,
                poll_interval: self.poll_interval.value,
                scratch_dir: self.scratch_dir.value.clone(),
            },
            pool: PoolConfig {
                prefix: self.namespace_prefix.value.clone(),
                verify: Poller::new(self.cleanup_timeout.value).with_interval(self.poll_interval.value),
            },
        }
    }
}

fn map_sourced<T, U>(sourced: Sourced<T>, f: impl FnOnce(T) -> U) -> Sourced<U> {
    Sourced {
        value: f(sourced.value),
        source: sourced.source,
        var: sourced.var,
    }
}

fn valid_prefix(prefix: &str) -> bool {
    let Ok(re) = Regex::new(r"^[a-z][-a-z0-9]*$") else {
        return false;
    };
    prefix.len() <= MAX_PREFIX_LEN && re.is_match(prefix)
}

#[cfg(test)]
pub(crate) fn env_test_lock() -> std::sync::MutexGuard<'static, ()> {
    use std::sync::{Mutex, OnceLock};

    static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    ENV_LOCK
        .get_or_init(|| Mutex::new(()))
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}
