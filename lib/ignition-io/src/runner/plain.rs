use std::{error::Error as StdError, sync::Arc};

use async_trait::async_trait;
use http::{Request, Response};
use http_body::Body;
use hyper::{body::Incoming, service::Service};
use ignition_core::{Runner, RunnerFactory};
use ignition_error::GenericError;
use tracing::{debug, info};

use super::{
    state::{StartTransition, StopTransition},
    HttpServerConfiguration, ServerCore, ServerState,
};
use crate::net::{
    server::http::{AlreadyStarted, ServerClosed},
    ListenAddress,
};

/// A factory for basic HTTP server runners.
///
/// Stopping the produced runner closes the listener immediately and asks every open connection to finish its in-flight
/// requests and close, waiting for them with no deadline. Its `start` reports the closure as
/// [`HttpServerError::ServerClosed`][crate::net::server::http::HttpServerError::ServerClosed].
pub struct HttpServerRunner<S> {
    name: Arc<str>,
    listen_address: ListenAddress,
    service: S,
}

impl<S> HttpServerRunner<S> {
    /// Creates a new `HttpServerRunner`.
    pub fn new<N>(name: N, listen_address: ListenAddress, service: S) -> Self
    where
        N: Into<Arc<str>>,
    {
        Self {
            name: name.into(),
            listen_address,
            service,
        }
    }

    /// Creates a new `HttpServerRunner` from the given configuration.
    ///
    /// Drain and shutdown timeouts do not apply to this runner, and are ignored.
    pub fn from_configuration<N>(name: N, config: &HttpServerConfiguration, service: S) -> Self
    where
        N: Into<Arc<str>>,
    {
        Self::new(name, config.listen_address.clone(), service)
    }
}

impl<S: Clone> HttpServerRunner<S> {
    /// Creates a new runner.
    pub fn build(&self) -> Arc<HttpServerHandle<S>> {
        Arc::new(HttpServerHandle {
            core: ServerCore::new(Arc::clone(&self.name), self.listen_address.clone()),
            service: self.service.clone(),
        })
    }
}

impl<S, B> RunnerFactory for HttpServerRunner<S>
where
    S: Service<Request<Incoming>, Response = Response<B>> + Clone + Send + Sync + 'static,
    S::Error: Into<Box<dyn StdError + Send + Sync>>,
    S::Future: Send + 'static,
    B: Body + Send + 'static,
    B::Data: Send,
    B::Error: Into<Box<dyn StdError + Send + Sync>>,
{
    fn create(&self) -> Arc<dyn Runner> {
        self.build()
    }
}

/// A basic HTTP server runner.
///
/// Created by [`HttpServerRunner`].
pub struct HttpServerHandle<S> {
    core: ServerCore,
    service: S,
}

impl<S> HttpServerHandle<S> {
    /// Returns the current state of the runner.
    pub fn state(&self) -> ServerState {
        self.core.lifecycle.current()
    }

    /// Waits until the listener is bound, and returns the address it is bound to.
    ///
    /// If the runner stops without ever binding, `None` is returned.
    pub async fn local_addr(&self) -> Option<ListenAddress> {
        self.core.local_addr().await
    }
}

#[async_trait]
impl<S, B> Runner for HttpServerHandle<S>
where
    S: Service<Request<Incoming>, Response = Response<B>> + Clone + Send + Sync + 'static,
    S::Error: Into<Box<dyn StdError + Send + Sync>>,
    S::Future: Send + 'static,
    B: Body + Send + 'static,
    B::Data: Send,
    B::Error: Into<Box<dyn StdError + Send + Sync>>,
{
    fn name(&self) -> &str {
        &self.core.name
    }

    async fn start(&self) -> Result<(), GenericError> {
        match self.core.lifecycle.begin_start() {
            StartTransition::Proceed => {}
            StartTransition::AlreadyStopped => return Err(ServerClosed.build().into()),
            StartTransition::AlreadyStarted => return Err(AlreadyStarted.build().into()),
        }

        self.core.bind_and_serve(self.service.clone()).await?;

        self.core.lifecycle.wait_until_stopped().await;
        Err(ServerClosed.build().into())
    }

    async fn stop(&self) -> Result<(), GenericError> {
        match self.core.lifecycle.begin_stop() {
            StopTransition::Proceed => {}
            StopTransition::NotStarted => {
                debug!(runner = %self.core.name, "Runner stopped before being started.");
                self.core.shutdown.trigger();
                return Ok(());
            }
            StopTransition::InProgress => {
                self.core.lifecycle.wait_until_stopped().await;
                return Ok(());
            }
            StopTransition::Finished => {
                // The server may have stopped on its own, leaving connections that are still closing.
                self.core.shutdown.shutdown().await;
                return Ok(());
            }
        }

        self.core.shutdown.shutdown().await;
        self.core.lifecycle.finish();

        info!(runner = %self.core.name, "HTTP server stopped.");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::{
        io,
        time::{Duration, Instant},
    };

    use super::*;
    use crate::{
        net::server::http::HttpServerError,
        runner::test_support::{router, url, TestService},
    };

    fn runner() -> Arc<HttpServerHandle<TestService>> {
        HttpServerRunner::new("plain", ListenAddress::local_tcp(0), router()).build()
    }

    fn is_server_closed(err: &GenericError) -> bool {
        matches!(err.downcast_ref::<HttpServerError>(), Some(HttpServerError::ServerClosed))
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn start_reports_server_closed_after_stop() {
        let runner = runner();
        let start = {
            let runner = Arc::clone(&runner);
            tokio::spawn(async move { runner.start().await })
        };
        let addr = runner.local_addr().await.unwrap();

        let body = reqwest::get(url(&addr, "/")).await.unwrap().text().await.unwrap();
        assert_eq!(body, "ok");

        runner.stop().await.unwrap();
        assert_eq!(runner.state(), ServerState::Stopped);

        let err = start.await.unwrap().unwrap_err();
        assert!(is_server_closed(&err));
        assert!(reqwest::get(url(&addr, "/")).await.unwrap_err().is_connect());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn stop_waits_for_in_flight_requests() {
        let runner = runner();
        let start = {
            let runner = Arc::clone(&runner);
            tokio::spawn(async move { runner.start().await })
        };
        let addr = runner.local_addr().await.unwrap();

        let slow_url = url(&addr, "/slow");
        let slow = tokio::spawn(async move { reqwest::get(slow_url).await?.text().await });
        tokio::time::sleep(Duration::from_millis(100)).await;

        runner.stop().await.unwrap();
        assert_eq!(slow.await.unwrap().unwrap(), "slow");
        assert!(is_server_closed(&start.await.unwrap().unwrap_err()));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn stop_after_accept_failure_waits_for_open_connections() {
        let runner = runner();
        let accept_errors = runner.core.inject_accept_errors();
        let start = {
            let runner = Arc::clone(&runner);
            tokio::spawn(async move { runner.start().await })
        };
        let addr = runner.local_addr().await.unwrap();

        let slow_started = Instant::now();
        let slow_url = url(&addr, "/slow");
        let slow = tokio::spawn(async move { reqwest::get(slow_url).await?.text().await });
        tokio::time::sleep(Duration::from_millis(100)).await;

        accept_errors.send(io::ErrorKind::InvalidInput.into()).unwrap();
        let err = start.await.unwrap().unwrap_err();
        assert!(matches!(
            err.downcast_ref::<HttpServerError>(),
            Some(HttpServerError::Listener { .. })
        ));
        assert_eq!(runner.state(), ServerState::Stopped);

        runner.stop().await.unwrap();
        assert!(slow_started.elapsed() >= Duration::from_millis(500));
        assert_eq!(slow.await.unwrap().unwrap(), "slow");
    }

    #[tokio::test]
    async fn start_after_stop_reports_server_closed() {
        let runner = runner();
        runner.stop().await.unwrap();

        let err = runner.start().await.unwrap_err();
        assert!(is_server_closed(&err));
    }
}
