use std::fmt;

use tokio::sync::watch;

/// Lifecycle state of an HTTP server runner.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ServerState {
    /// Created, but not yet started.
    Idle,

    /// Accepting connections and serving requests normally.
    Serving,

    /// Stopping: requests are still accepted, but answered with `503 Service Unavailable`.
    Draining,

    /// Stopped, or never started and stopped anyway. Terminal.
    Stopped,
}

impl fmt::Display for ServerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Serving => "serving",
            Self::Draining => "draining",
            Self::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// Outcome of attempting to start.
#[derive(Debug, Eq, PartialEq)]
pub(crate) enum StartTransition {
    /// Moved from `Idle` to `Serving`; the caller must now serve.
    Proceed,

    /// Already started by another caller.
    AlreadyStarted,

    /// Stopped before ever being started.
    AlreadyStopped,
}

/// Outcome of attempting to stop.
#[derive(Debug, Eq, PartialEq)]
pub(crate) enum StopTransition {
    /// Never started: moved straight from `Idle` to `Stopped`.
    NotStarted,

    /// Moved from `Serving` to `Draining`; the caller must now drive the shutdown.
    Proceed,

    /// Another caller is already driving the shutdown.
    InProgress,

    /// Already stopped.
    Finished,
}

/// Shared lifecycle of a runner.
///
/// Transitions are made atomically against the current state, so concurrent callers of `start` and `stop` each observe
/// a single, consistent outcome.
#[derive(Debug)]
pub(crate) struct Lifecycle {
    state: watch::Sender<ServerState>,
}

impl Lifecycle {
    pub fn new() -> Self {
        Self {
            state: watch::Sender::new(ServerState::Idle),
        }
    }

    pub fn current(&self) -> ServerState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ServerState> {
        self.state.subscribe()
    }

    pub fn begin_start(&self) -> StartTransition {
        let mut outcome = StartTransition::AlreadyStarted;
        self.state.send_if_modified(|state| match state {
            ServerState::Idle => {
                *state = ServerState::Serving;
                outcome = StartTransition::Proceed;
                true
            }
            ServerState::Stopped => {
                outcome = StartTransition::AlreadyStopped;
                false
            }
            ServerState::Serving | ServerState::Draining => false,
        });
        outcome
    }

    pub fn begin_stop(&self) -> StopTransition {
        let mut outcome = StopTransition::Finished;
        self.state.send_if_modified(|state| match state {
            ServerState::Idle => {
                *state = ServerState::Stopped;
                outcome = StopTransition::NotStarted;
                true
            }
            ServerState::Serving => {
                *state = ServerState::Draining;
                outcome = StopTransition::Proceed;
                true
            }
            ServerState::Draining => {
                outcome = StopTransition::InProgress;
                false
            }
            ServerState::Stopped => false,
        });
        outcome
    }

    pub fn finish(&self) {
        self.state.send_replace(ServerState::Stopped);
    }

    pub async fn wait_until_stopped(&self) {
        let mut state_rx = self.subscribe();
        // The sender lives as long as `self`, so this cannot fail while we are borrowed.
        let _ = state_rx.wait_for(|state| *state == ServerState::Stopped).await;
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use super::*;

    #[test]
    fn start_then_stop() {
        let lifecycle = Lifecycle::new();
        assert_eq!(lifecycle.current(), ServerState::Idle);

        assert_eq!(lifecycle.begin_start(), StartTransition::Proceed);
        assert_eq!(lifecycle.current(), ServerState::Serving);
        assert_eq!(lifecycle.begin_start(), StartTransition::AlreadyStarted);

        assert_eq!(lifecycle.begin_stop(), StopTransition::Proceed);
        assert_eq!(lifecycle.current(), ServerState::Draining);
        assert_eq!(lifecycle.begin_stop(), StopTransition::InProgress);
        assert_eq!(lifecycle.begin_start(), StartTransition::AlreadyStarted);

        lifecycle.finish();
        assert_eq!(lifecycle.begin_stop(), StopTransition::Finished);
        assert_eq!(lifecycle.begin_start(), StartTransition::AlreadyStopped);
    }

    #[test]
    fn stop_before_start() {
        let lifecycle = Lifecycle::new();
        assert_eq!(lifecycle.begin_stop(), StopTransition::NotStarted);
        assert_eq!(lifecycle.current(), ServerState::Stopped);
        assert_eq!(lifecycle.begin_start(), StartTransition::AlreadyStopped);
    }

    #[tokio::test(start_paused = true)]
    async fn waiters_observe_stopped() {
        let lifecycle = Arc::new(Lifecycle::new());
        lifecycle.begin_start();

        let waiter = {
            let lifecycle = Arc::clone(&lifecycle);
            tokio::spawn(async move { lifecycle.wait_until_stopped().await })
        };

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(!waiter.is_finished());

        lifecycle.finish();
        waiter.await.unwrap();
    }
}
