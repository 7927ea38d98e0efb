//! Demo process.
//!
//! Serves a public API and an admin API, each from its own graceful HTTP server runner, started and stopped together
//! until the process receives SIGINT or SIGTERM.
//!
//! Both servers run under a single `RunAll`, whose `start` only finishes once every server has stopped. If one server
//! fails, such as when its address is already in use, the failure is logged and the other keeps serving: the process
//! carries on without the failed API until it is signalled, and then exits with status 1, reporting the failure.

#![deny(warnings)]
#![deny(missing_docs)]
use std::time::Instant;

use clap::Parser as _;
use ignition_app::{logging::LoggingConfiguration, prelude::*};
use ignition_config::GenericConfiguration;
use ignition_core::RunAll;
use ignition_error::{ErrorContext as _, GenericError};
use ignition_io::{
    net::util::hyper::TowerToHyperService,
    runner::{GracefulHttpServerRunner, HttpServerConfiguration},
};
use tracing::{error, info};

mod api;

mod config;
use self::config::{load_configuration, Action, Cli, RunConfig};

#[tokio::main]
async fn main() {
    let started = Instant::now();
    let cli = Cli::parse();

    let run_config = match cli.action {
        Some(Action::Run(run_config)) => run_config,
        // If no subcommand is provided, run with the default configuration.
        None => RunConfig::default(),
    };

    let configuration = load_configuration(run_config.config.as_deref())
        .unwrap_or_else(|e| fatal_and_exit(format!("failed to load configuration: {:?}", e)));

    let logging_config = LoggingConfiguration::from_configuration(&configuration)
        .unwrap_or_else(|e| fatal_and_exit(format!("failed to load logging configuration: {}", e)));
    if let Err(e) = initialize_logging(&logging_config) {
        fatal_and_exit(format!("failed to initialize logging: {}", e));
    }

    match run(started, configuration).await {
        Ok(()) => info!("Ignition demo stopped."),
        Err(e) => {
            error!("{:?}", e);
            std::process::exit(1);
        }
    }
}

async fn run(started: Instant, configuration: GenericConfiguration) -> Result<(), GenericError> {
    let public_config = HttpServerConfiguration::from_configuration(&configuration, "public_api")
        .error_context("Failed to load public API configuration.")?;
    let admin_config = HttpServerConfiguration::from_configuration(&configuration, "admin_api")
        .error_context("Failed to load admin API configuration.")?;

    info!(
        public_listen_addr = %public_config.listen_address,
        admin_listen_addr = %admin_config.listen_address,
        process_id = std::process::id(),
        "Ignition demo starting..."
    );

    let servers = RunAll::new("servers")
        .with_runner(GracefulHttpServerRunner::from_configuration(
            "public_api",
            &public_config,
            TowerToHyperService::new(api::public_router()),
        ))
        .with_runner(GracefulHttpServerRunner::from_configuration(
            "admin_api",
            &admin_config,
            TowerToHyperService::new(api::admin_router(started)),
        ));

    // A server that fails on its own does not end the aggregate `start` while the other is still serving.
    run_until_shutdown(&servers, shutdown_signal()).await
}
