//! Logging.

use ignition_error::{ErrorContext as _, GenericError};
use tracing_subscriber::{layer::SubscriberExt as _, util::SubscriberInitExt as _, Layer};

mod config;
pub use self::config::{LogLevel, LoggingConfiguration};

/// Logs a message to standard error and exits the process with a non-zero exit code.
pub fn fatal_and_exit(message: String) -> ! {
    eprintln!("FATAL: {}", message);
    std::process::exit(1);
}

/// Initializes the logging subsystem for `tracing`.
///
/// Events are filtered by the directives in `config.log_level`, and written to standard output either as JSON (when
/// `config.log_format_json` is set) or in a human-readable format.
///
/// # Errors
///
/// If the logging subsystem was already initialized, an error will be returned.
pub fn initialize_logging(config: &LoggingConfiguration) -> Result<(), GenericError> {
    let filter = config.log_level.as_env_filter();

    let fmt_layer = if config.log_format_json {
        tracing_subscriber::fmt::Layer::new()
            .json()
            .flatten_event(true)
            .with_target(true)
            .with_file(true)
            .with_line_number(true)
            .boxed()
    } else {
        tracing_subscriber::fmt::Layer::new().with_target(true).boxed()
    };

    tracing_subscriber::registry()
        .with(fmt_layer.with_filter(filter))
        .try_init()
        .error_context("Failed to initialize logging subsystem.")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_initialization_fails() {
        let config = LoggingConfiguration::default();

        // Another test in this binary may have won the race to initialize, so only the second call is checked.
        let _ = initialize_logging(&config);
        assert!(initialize_logging(&config).is_err());
    }
}
