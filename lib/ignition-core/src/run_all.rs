use std::{collections::HashMap, fmt, sync::Arc};

use async_trait::async_trait;
use ignition_error::GenericError;
use snafu::Snafu;
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, error, info};

use crate::{
    runner::{Runner, RunnerFactory},
    task::JoinSetExt as _,
};

/// A lifecycle phase.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Phase {
    /// The `start` operation.
    Start,

    /// The `stop` operation.
    Stop,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Start => f.write_str("start"),
            Self::Stop => f.write_str("stop"),
        }
    }
}

/// A failure of a single child runner.
#[derive(Debug, Snafu)]
#[snafu(context(suffix(false)))]
pub enum ChildFailure {
    /// The child returned an error.
    #[snafu(display("runner '{}' failed: {}", runner, source))]
    Failed {
        /// Name of the child runner.
        runner: String,

        /// The error returned by the child.
        source: GenericError,
    },

    /// The task driving the child panicked.
    #[snafu(display("runner '{}' panicked", runner))]
    Panicked {
        /// Name of the child runner.
        runner: String,
    },

    /// The task driving the child was cancelled before it finished, such as when the runtime is shutting down.
    #[snafu(display("runner '{}' was cancelled", runner))]
    Cancelled {
        /// Name of the child runner.
        runner: String,
    },
}

impl ChildFailure {
    /// Returns the name of the child runner that failed.
    pub fn runner(&self) -> &str {
        match self {
            Self::Failed { runner, .. } | Self::Panicked { runner } | Self::Cancelled { runner } => runner,
        }
    }
}

/// `RunAll` errors.
#[derive(Debug, Snafu)]
#[snafu(context(suffix(false)))]
pub enum RunAllError {
    /// One or more child runners failed during a phase.
    ///
    /// Every failure is retained, in the order the children were added.
    #[snafu(display(
        "{} of {} runner(s) failed to {}: {}",
        failures.len(),
        total,
        phase,
        join_failures(failures)
    ))]
    ChildrenFailed {
        /// The phase that failed.
        phase: Phase,

        /// Total number of child runners.
        total: usize,

        /// Each failed child.
        failures: Vec<ChildFailure>,
    },
}

impl RunAllError {
    /// Returns the phase that failed.
    pub fn phase(&self) -> Phase {
        match self {
            Self::ChildrenFailed { phase, .. } => *phase,
        }
    }

    /// Returns every child failure.
    pub fn failures(&self) -> &[ChildFailure] {
        match self {
            Self::ChildrenFailed { failures, .. } => failures,
        }
    }
}

fn join_failures(failures: &[ChildFailure]) -> String {
    failures.iter().map(ToString::to_string).collect::<Vec<_>>().join("; ")
}

fn child_failure(runner: String, result: Result<Result<(), GenericError>, JoinError>) -> Option<ChildFailure> {
    match result {
        Ok(Ok(())) => None,
        Ok(Err(source)) => Some(ChildFailure::Failed { runner, source }),
        Err(e) if e.is_cancelled() => Some(ChildFailure::Cancelled { runner }),
        Err(_) => Some(ChildFailure::Panicked { runner }),
    }
}

/// Combines many runner factories into one.
///
/// `RunAll` is itself a [`RunnerFactory`]. Each runner it creates owns one freshly-created runner per child factory,
/// created eagerly when the aggregate runner is created.
///
/// # Start and stop
///
/// The aggregate `start` spawns every child's `start` as an independent task and resolves once all of them have
/// resolved. The aggregate `stop` does the same for every child's `stop`. Children are never ordered relative to each
/// other: when one runner depends on another having started, layer multiple `RunAll`s instead.
///
/// When any child fails, the aggregate still waits for every other child to finish before returning
/// [`RunAllError::ChildrenFailed`], which carries every failure rather than only the first. Children are never
/// retried or restarted.
///
/// # Missing
///
/// - No timeout: a child whose `start` or `stop` never resolves will hang the corresponding aggregate operation.
pub struct RunAll {
    name: Arc<str>,
    factories: Vec<Arc<dyn RunnerFactory>>,
}

impl RunAll {
    /// Creates an empty `RunAll` with the given name.
    pub fn new<S: AsRef<str>>(name: S) -> Self {
        Self {
            name: name.as_ref().into(),
            factories: Vec::new(),
        }
    }

    /// Creates a `RunAll` with the given name from a set of factories.
    pub fn from_factories<S, I>(name: S, factories: I) -> Self
    where
        S: AsRef<str>,
        I: IntoIterator<Item = Arc<dyn RunnerFactory>>,
    {
        Self {
            name: name.as_ref().into(),
            factories: factories.into_iter().collect(),
        }
    }

    /// Adds a child runner factory.
    pub fn add_runner<F: RunnerFactory + 'static>(&mut self, factory: F) {
        debug!(run_all = %self.name, "Adding child runner factory #{}.", self.factories.len());
        self.factories.push(Arc::new(factory));
    }

    /// Adds a child runner factory.
    pub fn with_runner<F: RunnerFactory + 'static>(mut self, factory: F) -> Self {
        self.add_runner(factory);
        self
    }

    /// Returns the number of child runner factories.
    pub fn len(&self) -> usize {
        self.factories.len()
    }

    /// Returns `true` if there are no child runner factories.
    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }
}

impl RunnerFactory for RunAll {
    fn create(&self) -> Arc<dyn Runner> {
        let children = self.factories.iter().map(|factory| factory.create()).collect();
        Arc::new(AggregateRunner {
            name: Arc::clone(&self.name),
            children,
        })
    }
}

struct AggregateRunner {
    name: Arc<str>,
    children: Vec<Arc<dyn Runner>>,
}

impl AggregateRunner {
    async fn run_phase(&self, phase: Phase) -> Result<(), RunAllError> {
        debug!(run_all = %self.name, %phase, children = self.children.len(), "Running phase for all child runners.");

        let mut tasks = JoinSet::new();
        let mut task_children = HashMap::with_capacity(self.children.len());

        for (child_idx, child) in self.children.iter().enumerate() {
            let child = Arc::clone(child);
            let abort_handle = tasks.spawn_traced(async move {
                match phase {
                    Phase::Start => child.start().await,
                    Phase::Stop => child.stop().await,
                }
            });
            task_children.insert(abort_handle.id(), child_idx);
        }

        // Every task is driven to completion, even after a failure: the barrier only opens once all children are done.
        let mut failures = Vec::new();
        while let Some(task_result) = tasks.join_next_with_id().await {
            let (task_id, result) = match task_result {
                Ok((task_id, result)) => (task_id, Ok(result)),
                Err(e) => (e.id(), Err(e)),
            };

            let child_idx = match task_children.get(&task_id) {
                Some(child_idx) => *child_idx,
                None => unreachable!("child task ID should always be tracked"),
            };
            let runner = self.children[child_idx].name().to_string();

            match child_failure(runner, result) {
                None => debug!(run_all = %self.name, %phase, runner = %self.children[child_idx].name(), "Child runner finished."),
                Some(failure) => {
                    error!(run_all = %self.name, %phase, error = %failure, "Child runner failed.");
                    failures.push((child_idx, failure));
                }
            }
        }

        if failures.is_empty() {
            info!(run_all = %self.name, %phase, children = self.children.len(), "All child runners finished.");
            return Ok(());
        }

        failures.sort_by_key(|(child_idx, _)| *child_idx);
        Err(RunAllError::ChildrenFailed {
            phase,
            total: self.children.len(),
            failures: failures.into_iter().map(|(_, failure)| failure).collect(),
        })
    }
}

#[async_trait]
impl Runner for AggregateRunner {
    fn name(&self) -> &str {
        &self.name
    }

    async fn start(&self) -> Result<(), GenericError> {
        self.run_phase(Phase::Start).await.map_err(Into::into)
    }

    async fn stop(&self) -> Result<(), GenericError> {
        self.run_phase(Phase::Stop).await.map_err(Into::into)
    }
}
