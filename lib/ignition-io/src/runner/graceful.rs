use std::{
    error::Error as StdError,
    future::Future,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use http::{header, HeaderValue, Request, Response, StatusCode, Version};
use http_body::Body;
use http_body_util::{Either, Full};
use hyper::{body::Incoming, service::Service};
use ignition_core::{Runner, RunnerFactory};
use ignition_error::GenericError;
use pin_project::pin_project;
use tokio::{select, sync::watch, time::sleep};
use tracing::{debug, info};

use super::{
    state::{StartTransition, StopTransition},
    HttpServerConfiguration, ServerCore, ServerState,
};
use crate::net::{server::http::AlreadyStarted, ListenAddress};

/// A factory for HTTP server runners that drain gracefully.
///
/// When the produced runner is stopped, it enters a drain window: the listener stays open, but every request that
/// reaches the service is answered with `503 Service Unavailable` (and, for HTTP/1, `Connection: close`) so that clients
/// and load balancers move elsewhere. Requests already being handled complete normally. Once the drain window elapses,
/// the listener is closed and open connections are given until the shutdown timeout to finish before they are
/// forcefully closed.
pub struct GracefulHttpServerRunner<S> {
    name: Arc<str>,
    listen_address: ListenAddress,
    service: S,
    drain_window: Duration,
    shutdown_timeout: Duration,
}

impl<S> GracefulHttpServerRunner<S> {
    /// Creates a new `GracefulHttpServerRunner` with default drain window (5 seconds) and shutdown timeout (10 seconds).
    pub fn new<N>(name: N, listen_address: ListenAddress, service: S) -> Self
    where
        N: Into<Arc<str>>,
    {
        Self::from_configuration(name, &HttpServerConfiguration::new(listen_address), service)
    }

    /// Creates a new `GracefulHttpServerRunner` from the given configuration.
    pub fn from_configuration<N>(name: N, config: &HttpServerConfiguration, service: S) -> Self
    where
        N: Into<Arc<str>>,
    {
        Self {
            name: name.into(),
            listen_address: config.listen_address.clone(),
            service,
            drain_window: config.drain_window(),
            shutdown_timeout: config.shutdown_timeout(),
        }
    }

    /// Sets how long new requests are answered with `503 Service Unavailable` once stopping begins.
    pub fn with_drain_window(mut self, drain_window: Duration) -> Self {
        self.drain_window = drain_window;
        self
    }

    /// Sets how long to wait for open connections to finish, after the drain window, before forcefully closing them.
    pub fn with_shutdown_timeout(mut self, shutdown_timeout: Duration) -> Self {
        self.shutdown_timeout = shutdown_timeout;
        self
    }
}

impl<S: Clone> GracefulHttpServerRunner<S> {
    /// Creates a new runner.
    ///
    /// Unlike [`RunnerFactory::create`], this returns the concrete runner type, which exposes its state and bound
    /// address.
    pub fn build(&self) -> Arc<GracefulHttpServerHandle<S>> {
        Arc::new(GracefulHttpServerHandle {
            core: ServerCore::new(Arc::clone(&self.name), self.listen_address.clone()),
            service: self.service.clone(),
            drain_window: self.drain_window,
            shutdown_timeout: self.shutdown_timeout,
        })
    }
}

impl<S, B> RunnerFactory for GracefulHttpServerRunner<S>
where
    S: Service<Request<Incoming>, Response = Response<B>> + Clone + Send + Sync + 'static,
    S::Error: Into<Box<dyn StdError + Send + Sync>>,
    S::Future: Send + 'static,
    B: Body<Data = Bytes> + Send + 'static,
    B::Error: Into<Box<dyn StdError + Send + Sync>>,
{
    fn create(&self) -> Arc<dyn Runner> {
        self.build()
    }
}

/// An HTTP server runner that drains gracefully.
///
/// Created by [`GracefulHttpServerRunner`].
pub struct GracefulHttpServerHandle<S> {
    core: ServerCore,
    service: S,
    drain_window: Duration,
    shutdown_timeout: Duration,
}

impl<S> GracefulHttpServerHandle<S> {
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
impl<S, B> Runner for GracefulHttpServerHandle<S>
where
    S: Service<Request<Incoming>, Response = Response<B>> + Clone + Send + Sync + 'static,
    S::Error: Into<Box<dyn StdError + Send + Sync>>,
    S::Future: Send + 'static,
    B: Body<Data = Bytes> + Send + 'static,
    B::Error: Into<Box<dyn StdError + Send + Sync>>,
{
    fn name(&self) -> &str {
        &self.core.name
    }

    async fn start(&self) -> Result<(), GenericError> {
        match self.core.lifecycle.begin_start() {
            StartTransition::Proceed => {}
            StartTransition::AlreadyStopped => {
                debug!(runner = %self.core.name, "Runner was stopped before being started. Not serving.");
                return Ok(());
            }
            StartTransition::AlreadyStarted => return Err(AlreadyStarted.build().into()),
        }

        let service = DrainGate::new(self.service.clone(), self.core.lifecycle.subscribe());
        self.core.bind_and_serve(service).await?;

        self.core.lifecycle.wait_until_stopped().await;
        Ok(())
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
                return self
                    .core
                    .shutdown
                    .shutdown_with_timeout(self.shutdown_timeout)
                    .await
                    .map_err(Into::into);
            }
        }

        info!(
            runner = %self.core.name,
            drain_window = ?self.drain_window,
            "Draining HTTP server. New requests will be rejected."
        );

        // The server may fail on its own mid-drain, at which point there is nothing left to drain.
        select! {
            _ = sleep(self.drain_window) => {},
            _ = self.core.lifecycle.wait_until_stopped() => {},
        }

        debug!(runner = %self.core.name, shutdown_timeout = ?self.shutdown_timeout, "Drain window elapsed. Closing listener.");
        let result = self.core.shutdown.shutdown_with_timeout(self.shutdown_timeout).await;
        self.core.lifecycle.finish();

        info!(runner = %self.core.name, "HTTP server stopped.");
        result.map_err(Into::into)
    }
}

/// Wraps a service so that requests are answered with `503 Service Unavailable` once the runner is draining.
#[derive(Clone)]
struct DrainGate<S> {
    inner: S,
    state: watch::Receiver<ServerState>,
}

impl<S> DrainGate<S> {
    fn new(inner: S, state: watch::Receiver<ServerState>) -> Self {
        Self { inner, state }
    }
}

impl<S, R, B> Service<Request<R>> for DrainGate<S>
where
    S: Service<Request<R>, Response = Response<B>>,
    B: Body<Data = Bytes>,
{
    type Response = Response<Either<B, Full<Bytes>>>;
    type Error = S::Error;
    type Future = DrainGateFuture<S::Future>;

    fn call(&self, req: Request<R>) -> Self::Future {
        let state = *self.state.borrow();
        match state {
            ServerState::Draining | ServerState::Stopped => DrainGateFuture::Unavailable {
                close_connection: req.version() < Version::HTTP_2,
            },
            ServerState::Idle | ServerState::Serving => DrainGateFuture::Inner {
                future: self.inner.call(req),
            },
        }
    }
}

#[pin_project(project = DrainGateFutureProjected)]
enum DrainGateFuture<F> {
    Inner {
        #[pin]
        future: F,
    },
    Unavailable {
        close_connection: bool,
    },
}

impl<F, B, E> Future for DrainGateFuture<F>
where
    F: Future<Output = Result<Response<B>, E>>,
{
    type Output = Result<Response<Either<B, Full<Bytes>>>, E>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match self.project() {
            DrainGateFutureProjected::Inner { future } => future.poll(cx).map_ok(|resp| resp.map(Either::Left)),
            DrainGateFutureProjected::Unavailable { close_connection } => {
                Poll::Ready(Ok(service_unavailable(*close_connection)))
            }
        }
    }
}

fn service_unavailable<B>(close_connection: bool) -> Response<Either<B, Full<Bytes>>> {
    let mut response = Response::new(Either::Right(Full::new(Bytes::from_static(b"Service Unavailable"))));
    *response.status_mut() = StatusCode::SERVICE_UNAVAILABLE;

    let headers = response.headers_mut();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("text/plain; charset=utf-8"));

    // HTTP/2 forbids connection-specific headers; closing is handled by GOAWAY once the listener shuts down.
    if close_connection {
        headers.insert(header::CONNECTION, HeaderValue::from_static("close"));
    }

    response
}
