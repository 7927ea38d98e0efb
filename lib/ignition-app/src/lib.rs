//! High-level application primitives.
//!
//! This crate provides the pieces needed to bootstrap and drive a process built from runners: initializing logging from
//! configuration, and running a runner until the process is asked to shut down.
#![deny(warnings)]
#![deny(missing_docs)]

#[cfg(feature = "logging")]
pub mod logging;

#[cfg(feature = "runner")]
pub mod runner;

/// Common imports.
pub mod prelude {
    #[cfg(feature = "logging")]
    pub use super::logging::{fatal_and_exit, initialize_logging, LoggingConfiguration};
    #[cfg(feature = "runner")]
    pub use super::runner::{run_until_shutdown, shutdown_signal};
}
