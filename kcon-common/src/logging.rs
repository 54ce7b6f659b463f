//! Process-wide diagnostic logging.
//!
//! Diagnostics go to stderr through `tracing`; test output never does, it is
//! captured per test and printed by the reporter on stdout.

use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use crate::config::EnvParser;

/// Output format for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

/// Logging settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogConfig {
    pub level: String,
    pub format: LogFormat,
    /// Honor `RUST_LOG` when set.
    pub use_rust_log: bool,
}

/// Error installing the global subscriber.
#[derive(Debug, thiserror::Error)]
pub enum LoggingError {
    #[error("Invalid log filter {filter:?}: {message}")]
    Filter { filter: String, message: String },

    #[error("Logging already initialized: {0}")]
    AlreadyInitialized(String),
}

impl LogConfig {
    /// Settings from `KCON_LOG_LEVEL` and `KCON_LOG_FORMAT`.
    ///
    /// Invalid values fall back to the defaults; logging is not worth
    /// refusing to start over.
    pub fn from_env(default_level: &str) -> Self {
        let mut parser = EnvParser::new();
        let level = parser.get_log_level("LOG_LEVEL", default_level);
        let format = parser.get_string("LOG_FORMAT", "text");
        Self {
            level: level.value,
            format: if format.value.eq_ignore_ascii_case("json") {
                LogFormat::Json
            } else {
                LogFormat::Text
            },
            use_rust_log: true,
        }
    }

    #[must_use]
    pub fn with_level(mut self, level: &str) -> Self {
        self.level = level.to_string();
        self
    }

    #[must_use]
    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    /// Filter directive for the configured level.
    pub fn directive(&self) -> String {
        format!("kcon={level},kcon_common={level},warn", level = self.level)
    }

    fn filter(&self) -> Result<EnvFilter, LoggingError> {
        if self.use_rust_log
            && let Ok(filter) = EnvFilter::try_from_default_env()
        {
            return Ok(filter);
        }
        let directive = self.directive();
        EnvFilter::try_new(&directive).map_err(|err| LoggingError::Filter {
            filter: directive,
            message: err.to_string(),
        })
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Text,
            use_rust_log: true,
        }
    }
}

/// Install the global subscriber. Call once, early in `main`.
pub fn init_logging(config: &LogConfig) -> Result<(), LoggingError> {
    let filter = config.filter()?;
    let registry = tracing_subscriber::registry().with(filter);
    let result = match config.format {
        LogFormat::Text => registry
            .with(fmt::layer().with_writer(std::io::stderr).with_target(false))
            .try_init(),
        LogFormat::Json => registry
            .with(fmt::layer().with_writer(std::io::stderr).json())
            .try_init(),
    };
    result.map_err(|err| LoggingError::AlreadyInitialized(err.to_string()))
}

#[cfg(test)]
#[allow(unsafe_code)]
mod tests {
    use super::*;
    use crate::config::env_test_lock;

    fn cleanup_env() {
        for var in ["KCON_LOG_LEVEL", "KCON_LOG_FORMAT"] {
            // SAFETY: Tests are serialized via env_test_lock
            unsafe { std::env::remove_var(var) };
        }
    }

    #[test]
    fn test_from_env() {
        let _guard = env_test_lock();
        cleanup_env();

        let config = LogConfig::from_env("info");
        assert_eq!(config.level, "info");
        assert_eq!(config.format, LogFormat::Text);

        // SAFETY: Tests are serialized via env_test_lock
        unsafe {
            std::env::set_var("KCON_LOG_LEVEL", "TRACE");
            std::env::set_var("KCON_LOG_FORMAT", "json");
        }
        let config = LogConfig::from_env("info");
        assert_eq!(config.level, "trace");
        assert_eq!(config.format, LogFormat::Json);

        // SAFETY: Tests are serialized via env_test_lock
        unsafe { std::env::set_var("KCON_LOG_LEVEL", "shouty") };
        assert_eq!(LogConfig::from_env("warn").level, "warn");

        cleanup_env();
    }

    #[test]
    fn test_with_level_and_directive() {
        let config = LogConfig::default().with_level("debug");
        assert_eq!(config.directive(), "kcon=debug,kcon_common=debug,warn");
        let config = LogConfig {
            use_rust_log: false,
            ..config
        };
        assert!(config.filter().is_ok());
    }
}
