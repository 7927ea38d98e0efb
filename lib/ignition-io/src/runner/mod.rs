//! HTTP server runners.
//!
//! Runners adapt an [`HttpServer`] into the [`Runner`][ignition_core::Runner] lifecycle. Two flavors are provided:
//!
//! - [`GracefulHttpServerRunner`]: on stop, keeps the listener open for a drain window during which new requests are
//!   answered with `503 Service Unavailable`, then closes the listener and waits (up to a deadline) for open connections
//!   to finish.
//! - [`HttpServerRunner`]: on stop, closes the listener immediately and waits for open connections to finish, with no
//!   deadline.
use std::{error::Error as StdError, sync::Arc};

use http::{Request, Response};
use http_body::Body;
use hyper::{body::Incoming, service::Service};
use snafu::ResultExt as _;
use tokio::{select, sync::watch};
use tracing::{error, info_span, Instrument as _};

use crate::net::{
    server::http::{HttpServer, HttpServerError, Listener, ShutdownHandle},
    ConnectionOrientedListener, ListenAddress,
};

mod config;
pub use self::config::HttpServerConfiguration;

mod graceful;
pub use self::graceful::{GracefulHttpServerHandle, GracefulHttpServerRunner};

mod plain;
pub use self::plain::{HttpServerHandle, HttpServerRunner};

mod state;
use self::state::Lifecycle;
pub use self::state::ServerState;

/// State shared by both runner flavors: lifecycle, shutdown coordination, and the bound address.
struct ServerCore {
    name: Arc<str>,
    listen_address: ListenAddress,
    lifecycle: Lifecycle,
    shutdown: ShutdownHandle,
    bound: watch::Sender<Option<ListenAddress>>,
    #[cfg(test)]
    accept_errors: std::sync::Mutex<Option<tokio::sync::mpsc::UnboundedReceiver<std::io::Error>>>,
}

impl ServerCore {
    fn new(name: Arc<str>, listen_address: ListenAddress) -> Self {
        Self {
            name,
            listen_address,
            lifecycle: Lifecycle::new(),
            shutdown: ShutdownHandle::new(),
            bound: watch::Sender::new(None),
            #[cfg(test)]
            accept_errors: std::sync::Mutex::new(None),
        }
    }

    /// Returns a sender whose errors are returned, in order, by the listener's `accept` once the runner is serving.
    #[cfg(test)]
    fn inject_accept_errors(&self) -> tokio::sync::mpsc::UnboundedSender<std::io::Error> {
        let (errors_tx, errors_rx) = tokio::sync::mpsc::unbounded_channel();
        *self.accept_errors.lock().unwrap() = Some(errors_rx);
        errors_tx
    }

    async fn local_addr(&self) -> Option<ListenAddress> {
        let mut bound_rx = self.bound.subscribe();
        let mut state_rx = self.lifecycle.subscribe();

        loop {
            if let Some(addr) = bound_rx.borrow_and_update().clone() {
                return Some(addr);
            }

            if *state_rx.borrow_and_update() == ServerState::Stopped {
                return None;
            }

            // Both senders are owned by `self`, so neither channel can close while we hold a borrow of it.
            select! {
                _ = bound_rx.changed() => {},
                _ = state_rx.changed() => {},
            }
        }
    }

    /// Binds the listener and serves connections with `service` until shutdown is triggered.
    ///
    /// On failure, the runner is moved to `Stopped` before the error is returned. Connections that were already open
    /// are asked to close, but not waited on: a later `stop` does that.
    async fn bind_and_serve<S, B>(&self, service: S) -> Result<(), HttpServerError>
    where
        S: Service<Request<Incoming>, Response = Response<B>> + Send + Clone + 'static,
        S::Error: Into<Box<dyn StdError + Send + Sync>>,
        S::Future: Send + 'static,
        B: Body + Send + 'static,
        B::Data: Send,
        B::Error: Into<Box<dyn StdError + Send + Sync>>,
    {
        let span = info_span!("http_server", runner = %self.name, listen_addr = %self.listen_address);

        async {
            // Held until the accept loop has exited, so a concurrent `stop` cannot finish before we do.
            let server_token = self.shutdown.server_token();

            let result = match ConnectionOrientedListener::from_listen_address(self.listen_address.clone()).await {
                Ok(listener) => {
                    #[cfg(test)]
                    let listener = match self.accept_errors.lock().unwrap().take() {
                        Some(errors) => listener.with_injected_errors(errors),
                        None => listener,
                    };

                    self.bound.send_replace(Some(listener.local_address().clone()));

                    HttpServer::from_listener(listener, service)
                        .serve(self.shutdown.clone())
                        .await
                        .context(Listener)
                }
                Err(e) => Err(HttpServerError::Listener { source: e }),
            };

            drop(server_token);

            if let Err(e) = &result {
                error!(error = %e, "HTTP server failed.");
                self.shutdown.trigger();
                self.lifecycle.finish();
            }

            result
        }
        .instrument(span)
        .await
    }
}
