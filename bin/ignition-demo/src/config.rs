use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use ignition_config::{ConfigurationLoader, GenericConfiguration};
use ignition_error::{ErrorContext as _, GenericError};

/// Environment variable prefix for configuration overrides.
const ENV_PREFIX: &str = "IGNITION";

/// Configuration used when no file or environment variable overrides a setting.
const DEFAULT_CONFIGURATION: &str = r#"
public_api:
  listen_address: tcp://127.0.0.1:8080
admin_api:
  listen_address: tcp://127.0.0.1:8081
"#;

/// Command-line interface.
#[derive(Parser)]
#[command(about)]
pub struct Cli {
    /// Subcommand to run.
    #[command(subcommand)]
    pub action: Option<Action>,
}

/// Subcommands.
#[derive(Subcommand)]
pub enum Action {
    /// Runs the public and admin API servers until interrupted.
    #[command(name = "run")]
    Run(RunConfig),
}

/// Run configuration.
#[derive(Args, Debug, Default)]
pub struct RunConfig {
    /// Path to a YAML configuration file.
    ///
    /// Settings can also be overridden with `IGNITION_`-prefixed environment variables, using a double underscore to
    /// separate nested keys (`IGNITION_PUBLIC_API__LISTEN_ADDRESS`).
    #[arg(short = 'c', long)]
    pub config: Option<PathBuf>,
}

/// Loads configuration from the built-in defaults, the optional configuration file, and the environment, in increasing
/// order of precedence.
///
/// # Errors
///
/// If the configuration file cannot be read or parsed, an error is returned.
pub fn load_configuration(config_path: Option<&std::path::Path>) -> Result<GenericConfiguration, GenericError> {
    let mut loader = ConfigurationLoader::default().from_yaml_str(DEFAULT_CONFIGURATION)?;

    if let Some(path) = config_path {
        loader = loader
            .from_yaml(path)
            .with_error_context(|| format!("Failed to load configuration file '{}'.", path.display()))?;
    }

    let config = loader.from_environment(ENV_PREFIX)?.into_generic()?;
    Ok(config)
}
