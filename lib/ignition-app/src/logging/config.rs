use ignition_config::{ConfigurationError, GenericConfiguration};
use ignition_error::{generic_error, ErrorContext as _, GenericError};
use serde::Deserialize;
use tracing_subscriber::{filter::LevelFilter, EnvFilter};

fn default_log_level() -> LogLevel {
    LevelFilter::INFO.into()
}

const fn default_false() -> bool {
    false
}

/// Logging configuration.
#[derive(Debug, Deserialize)]
pub struct LoggingConfiguration {
    /// Log level filtering directives, in `EnvFilter` syntax.
    ///
    /// Defaults to `info`.
    #[serde(default = "default_log_level")]
    pub log_level: LogLevel,

    /// Whether to emit logs as JSON instead of human-readable text.
    ///
    /// Defaults to `false`.
    #[serde(default = "default_false")]
    pub log_format_json: bool,
}

impl Default for LoggingConfiguration {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format_json: default_false(),
        }
    }
}

impl LoggingConfiguration {
    /// Creates a new `LoggingConfiguration` from the given configuration.
    ///
    /// # Errors
    ///
    /// If a logging setting is present but cannot be deserialized, an error is returned.
    pub fn from_configuration(config: &GenericConfiguration) -> Result<Self, ConfigurationError> {
        Ok(Self {
            log_level: config.try_get_typed("log_level")?.unwrap_or_else(default_log_level),
            log_format_json: config.try_get_typed("log_format_json")?.unwrap_or_else(default_false),
        })
    }
}

/// Log level filtering directives.
///
/// Accepts anything `EnvFilter` does, from a bare level (`debug`) to per-target directives
/// (`info,ignition_io=trace`).
#[derive(Debug, Deserialize)]
#[serde(try_from = "String")]
pub struct LogLevel(String);

impl LogLevel {
    /// Builds an `EnvFilter` from these directives.
    pub fn as_env_filter(&self) -> EnvFilter {
        // Directives were validated on construction.
        EnvFilter::builder().parse_lossy(&self.0)
    }
}

impl From<LevelFilter> for LogLevel {
    fn from(level: LevelFilter) -> Self {
        Self(level.to_string().to_lowercase())
    }
}

impl TryFrom<String> for LogLevel {
    type Error = GenericError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        if value.is_empty() {
            return Err(generic_error!("Log level cannot be empty."));
        }

        EnvFilter::builder()
            .parse(&value)
            .map(|_| Self(value))
            .error_context("Failed to parse valid log level.")
    }
}

#[cfg(test)]
mod tests {
    use ignition_config::ConfigurationLoader;

    use super::*;

    #[test]
    fn defaults_when_unset() {
        let config = ConfigurationLoader::default()
            .from_json_str("{}")
            .unwrap()
            .into_generic()
            .unwrap();

        let logging_config = LoggingConfiguration::from_configuration(&config).unwrap();
        assert_eq!(logging_config.log_level.0, "info");
        assert!(!logging_config.log_format_json);
    }

    #[test]
    fn reads_directives_and_format() {
        let config = ConfigurationLoader::default()
            .from_yaml_str("log_level: warn,ignition_io=debug\nlog_format_json: true\n")
            .unwrap()
            .into_generic()
            .unwrap();

        let logging_config = LoggingConfiguration::from_configuration(&config).unwrap();
        assert_eq!(logging_config.log_level.0, "warn,ignition_io=debug");
        assert!(logging_config.log_format_json);
    }

    #[test]
    fn rejects_invalid_levels() {
        assert!(LogLevel::try_from(String::new()).is_err());
        assert!(LogLevel::try_from("info,ignition_io=notalevel".to_string()).is_err());
    }
}
