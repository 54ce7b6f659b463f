//! Source tracking for configuration values.

use std::fmt;

/// Where a configuration value came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConfigSource {
    /// Built-in default.
    Default,
    /// A `KCON_*` environment variable.
    Environment,
    /// A command-line flag.
    CommandLine,
}

impl fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Default => write!(f, "default"),
            Self::Environment => write!(f, "environment"),
            Self::CommandLine => write!(f, "command line"),
        }
    }
}

/// A value together with its origin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sourced<T> {
    pub value: T,
    pub source: ConfigSource,
    /// Environment variable name, when the value came from one.
    pub var: Option<String>,
}

impl<T> Sourced<T> {
    pub fn default_value(value: T) -> Self {
        Self {
            value,
            source: ConfigSource::Default,
            var: None,
        }
    }

    pub fn from_env(value: T, var: impl Into<String>) -> Self {
        Self {
            value,
            source: ConfigSource::Environment,
            var: Some(var.into()),
        }
    }

    pub fn from_cli(value: T) -> Self {
        Self {
            value,
            source: ConfigSource::CommandLine,
            var: None,
        }
    }

    /// Replace the value if a command-line flag supplied one.
    pub fn override_with(&mut self, value: Option<T>) {
        if let Some(value) = value {
            *self = Self::from_cli(value);
        }
    }

    /// Human-readable origin, e.g. `environment (KCON_CONCURRENCY)`.
    pub fn describe_source(&self) -> String {
        match &self.var {
            Some(var) => format!("{} ({var})", self.source),
            None => self.source.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_override_with() {
        let mut value = Sourced::from_env(4usize, "KCON_CONCURRENCY");
        value.override_with(None);
        assert_eq!(value.source, ConfigSource::Environment);
        assert_eq!(value.describe_source(), "environment (KCON_CONCURRENCY)");

        value.override_with(Some(8));
        assert_eq!(value.value, 8);
        assert_eq!(value.source, ConfigSource::CommandLine);
        assert_eq!(value.describe_source(), "command line");
    }

    #[test]
    fn test_default_value() {
        let value = Sourced::default_value("kubectl".to_string());
        assert_eq!(value.source, ConfigSource::Default);
        assert!(value.var.is_none());
    }
}
