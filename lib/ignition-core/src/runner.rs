use std::sync::Arc;

use async_trait::async_trait;
use ignition_error::GenericError;

/// A unit of background work with a start/stop lifecycle.
///
/// `start` runs the work: the returned future resolves only once the work has ceased, either because `stop` was
/// called or because the work failed on its own. `stop` requests that the work cease, and resolves only once it has
/// fully done so, including any graceful draining.
///
/// Runners are shared as `Arc<dyn Runner>` so that `start` can be driven from a background task while `stop` is called
/// from elsewhere, such as a signal handler.
///
/// # Preconditions
///
/// A runner represents a single lifecycle: callers should call `start` at most once, and `stop` at most once, after
/// `start` has been called. Implementations must not deadlock when these preconditions are violated, but the outcome of
/// doing so is defined by each implementation rather than by this trait.
#[async_trait]
pub trait Runner: Send + Sync {
    /// Returns the name of the runner.
    ///
    /// Used to attribute log events and errors; names need not be unique.
    fn name(&self) -> &str;

    /// Starts the work, resolving once it has ceased.
    ///
    /// # Errors
    ///
    /// If the work could not be started, or failed while running, an error is returned. Ceasing because `stop` was
    /// called is not itself an error unless an implementation documents otherwise.
    async fn start(&self) -> Result<(), GenericError>;

    /// Stops the work, resolving once it has fully ceased.
    ///
    /// # Errors
    ///
    /// If the work could not be stopped cleanly, an error is returned.
    async fn stop(&self) -> Result<(), GenericError>;
}

/// A factory for runners.
///
/// Every call to [`create`][RunnerFactory::create] produces a new, independent runner with its own internal state, so
/// a factory can be used to create any number of runners over time.
///
/// Implemented for any `Fn() -> Arc<dyn Runner>` closure.
pub trait RunnerFactory: Send + Sync {
    /// Creates a new runner.
    fn create(&self) -> Arc<dyn Runner>;
}

impl<F> RunnerFactory for F
where
    F: Fn() -> Arc<dyn Runner> + Send + Sync,
{
    fn create(&self) -> Arc<dyn Runner> {
        self()
    }
}
