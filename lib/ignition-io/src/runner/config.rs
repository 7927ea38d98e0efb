use std::time::Duration;

use ignition_config::{ConfigurationError, GenericConfiguration};
use serde::Deserialize;

use crate::net::ListenAddress;

const fn default_drain_window_secs() -> u64 {
    5
}

const fn default_shutdown_timeout_secs() -> u64 {
    10
}

/// HTTP server configuration.
///
/// Deserialized from a configuration section, such as `public_api`:
///
/// ```yaml
/// public_api:
///   listen_address: tcp://0.0.0.0:8080
///   drain_window_secs: 5
///   shutdown_timeout_secs: 10
/// ```
#[derive(Clone, Debug, Deserialize)]
pub struct HttpServerConfiguration {
    /// Address to listen on.
    pub listen_address: ListenAddress,

    /// How long, in seconds, new requests are answered with `503 Service Unavailable` once stopping begins.
    ///
    /// Defaults to 5 seconds.
    #[serde(default = "default_drain_window_secs")]
    pub drain_window_secs: u64,

    /// How long, in seconds, to wait for open connections to finish after the drain window before forcefully closing
    /// them.
    ///
    /// Defaults to 10 seconds.
    #[serde(default = "default_shutdown_timeout_secs")]
    pub shutdown_timeout_secs: u64,
}

impl HttpServerConfiguration {
    /// Creates a new `HttpServerConfiguration` with default timeouts.
    pub fn new(listen_address: ListenAddress) -> Self {
        Self {
            listen_address,
            drain_window_secs: default_drain_window_secs(),
            shutdown_timeout_secs: default_shutdown_timeout_secs(),
        }
    }

    /// Reads the configuration from the given section of `config`.
    ///
    /// Each field is queried individually, so that both nested values (`public_api.listen_address` in a file) and flat
    /// environment variables (`PREFIX_PUBLIC_API_LISTEN_ADDRESS`) are picked up. Timeouts fall back to their defaults
    /// when not set.
    ///
    /// ## Errors
    ///
    /// If the listen address is missing, or any field cannot be deserialized, an error is returned.
    pub fn from_configuration(config: &GenericConfiguration, section: &str) -> Result<Self, ConfigurationError> {
        Ok(Self {
            listen_address: config.get_typed(&format!("{}.listen_address", section))?,
            drain_window_secs: config
                .try_get_typed(&format!("{}.drain_window_secs", section))?
                .unwrap_or_else(default_drain_window_secs),
            shutdown_timeout_secs: config
                .try_get_typed(&format!("{}.shutdown_timeout_secs", section))?
                .unwrap_or_else(default_shutdown_timeout_secs),
        })
    }

    /// Returns the drain window.
    pub fn drain_window(&self) -> Duration {
        Duration::from_secs(self.drain_window_secs)
    }

    /// Returns the shutdown timeout.
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}
