//! Driving a runner for the lifetime of a process.

use std::{future::Future, sync::Arc};

use ignition_core::{task::spawn_traced, RunnerFactory};
use ignition_error::{generic_error, GenericError};
use tokio::select;
use tracing::{error, info, warn};

/// Runs a runner until `shutdown` resolves.
///
/// A runner is created from `factory` and started in the background. Once `shutdown` resolves, or the runner's `start`
/// finishes on its own (for example, because its listener could not be bound), the runner is stopped and its `start`
/// is awaited.
///
/// For a [`RunAll`][ignition_core::RunAll], `start` only finishes once every child has, so a single child failing to
/// bind does not end the run early while its siblings are still serving.
///
/// # Errors
///
/// If either `start` or `stop` fails, an error is returned. When both fail, the error from `start` is returned, and the
/// error from `stop` is logged.
pub async fn run_until_shutdown<F, S>(factory: &F, shutdown: S) -> Result<(), GenericError>
where
    F: RunnerFactory + ?Sized,
    S: Future<Output = ()>,
{
    let runner = factory.create();
    let name = runner.name().to_string();

    let mut start = spawn_traced({
        let runner = Arc::clone(&runner);
        async move { runner.start().await }
    });

    info!(runner = %name, "Runner started.");

    tokio::pin!(shutdown);
    let early_start_result = select! {
        result = &mut start => {
            warn!(runner = %name, "Runner exited before shutdown was requested.");
            Some(result)
        },
        _ = &mut shutdown => {
            info!(runner = %name, "Shutdown requested. Stopping runner.");
            None
        },
    };

    let stop_result = runner.stop().await;

    let start_result = match early_start_result {
        Some(result) => result,
        None => start.await,
    };
    let start_result = start_result
        .map_err(|e| generic_error!("Runner '{}' panicked while running: {}", name, e))
        .and_then(|result| result);

    match (start_result, stop_result) {
        (Ok(()), Ok(())) => {
            info!(runner = %name, "Runner stopped.");
            Ok(())
        }
        (Err(start_err), Ok(())) => Err(start_err),
        (Ok(()), Err(stop_err)) => Err(stop_err),
        (Err(start_err), Err(stop_err)) => {
            error!(runner = %name, error = %stop_err, "Runner also failed to stop cleanly.");
            Err(start_err)
        }
    }
}

/// Waits for the process to be asked to shut down.
///
/// Resolves on `SIGINT` (Ctrl-C) or, on Unix platforms, `SIGTERM`. If a signal handler cannot be installed, the failure
/// is logged and that signal is never observed.
pub async fn shutdown_signal() {
    let interrupt = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for SIGINT.");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut handler) => {
                handler.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGTERM.");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    select! {
        _ = interrupt => info!("Received SIGINT, shutting down..."),
        _ = terminate => info!("Received SIGTERM, shutting down..."),
    }
}
