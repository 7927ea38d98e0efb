//! Basic HTTP server.

use std::{error::Error as StdError, future::Future, time::Duration};

use http::{Request, Response};
use http_body::Body;
use hyper::{body::Incoming, rt::Executor, service::Service};
use hyper_util::{rt::TokioIo, server::conn::auto::Builder};
use ignition_core::task::spawn_traced;
use snafu::Snafu;
use tokio::{
    select,
    time::{sleep, timeout},
};
use tokio_util::{
    sync::CancellationToken,
    task::{task_tracker::TaskTrackerToken, TaskTracker},
};
use tracing::{debug, info, warn};

use crate::net::{
    listener::{ConnectionOrientedListener, ListenerError},
    Connection, ListenAddress,
};

/// An HTTP server error.
#[derive(Debug, Snafu)]
#[snafu(context(suffix(false)), visibility(pub(crate)))]
pub enum HttpServerError {
    /// The server has been stopped, and will not serve again.
    #[snafu(display("server closed"))]
    ServerClosed,

    /// The server was already started.
    #[snafu(display("server has already been started"))]
    AlreadyStarted,

    /// Open connections did not finish within the shutdown timeout, and were forcefully closed.
    #[snafu(display(
        "timed out after {:?} waiting for connections to close; forcefully closed {} connection(s)",
        timeout,
        remaining
    ))]
    ShutdownTimedOut {
        /// Shutdown timeout that elapsed.
        timeout: Duration,

        /// Number of connections still open when the timeout elapsed.
        remaining: usize,
    },

    /// The listener failed.
    #[snafu(display("{}", source))]
    Listener {
        /// Source of the error.
        source: ListenerError,
    },
}

/// Coordinates the shutdown of an HTTP server and its connections.
///
/// Triggering shutdown stops the server from accepting new connections and asks every open connection to finish its
/// in-flight requests and then close. The handle tracks open connections, so that callers can wait for all of them to
/// close, optionally with a deadline after which the remaining connections are forcefully closed.
///
/// Handles are cheap to clone, and all clones refer to the same server.
#[derive(Clone, Debug, Default)]
pub struct ShutdownHandle {
    graceful: CancellationToken,
    force: CancellationToken,
    connections: TaskTracker,
}

impl ShutdownHandle {
    /// Creates a new `ShutdownHandle`.
    pub fn new() -> Self {
        Self::default()
    }

    /// Triggers a graceful shutdown without waiting for it to complete.
    pub fn trigger(&self) {
        self.graceful.cancel();
    }

    /// Returns `true` if shutdown has been triggered.
    pub fn is_triggered(&self) -> bool {
        self.graceful.is_cancelled()
    }

    /// Returns the number of tracked tasks, which includes open connections, their HTTP/2 streams, and any running
    /// accept loop.
    pub fn active_connections(&self) -> usize {
        self.connections.len()
    }

    /// Marks the server as active until the returned token is dropped.
    ///
    /// Waiting for shutdown does not complete while any such token is alive, which closes the window between a server
    /// being started and its accept loop actually running.
    pub fn server_token(&self) -> TaskTrackerToken {
        self.connections.token()
    }

    /// Triggers a graceful shutdown and waits for every connection to close.
    pub async fn shutdown(&self) {
        self.trigger();
        self.connections.close();
        self.connections.wait().await;
    }

    /// Triggers a graceful shutdown and waits up to `timeout` for every connection to close.
    ///
    /// ## Errors
    ///
    /// If connections are still open once the timeout elapses, they are forcefully closed and an error is returned.
    pub async fn shutdown_with_timeout(&self, timeout_duration: Duration) -> Result<(), HttpServerError> {
        self.trigger();
        self.connections.close();

        if timeout(timeout_duration, self.connections.wait()).await.is_ok() {
            return Ok(());
        }

        let remaining = self.connections.len();
        warn!(
            timeout = ?timeout_duration,
            remaining,
            "Connections did not close before shutdown timeout. Forcefully closing."
        );

        self.force.cancel();
        self.connections.wait().await;

        ShutdownTimedOut {
            timeout: timeout_duration,
            remaining,
        }
        .fail()
    }
}

/// Spawns the tasks hyper needs per connection, such as HTTP/2 stream handlers, as tracked tasks of a server.
///
/// Spawned tasks count towards the server's open connections, and are cancelled when the server is forcefully shut
/// down, so no request handler outlives the server.
#[derive(Clone)]
struct ServerExecutor {
    shutdown: ShutdownHandle,
}

impl<F> Executor<F> for ServerExecutor
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    fn execute(&self, fut: F) {
        let force = self.shutdown.force.clone();
        spawn_traced(self.shutdown.connections.track_future(async move {
            select! {
                _ = fut => {},
                _ = force.cancelled() => {},
            }
        }));
    }
}

/// Delay before retrying after the first transient accept failure.
const MIN_ACCEPT_BACKOFF: Duration = Duration::from_millis(5);

/// Upper bound on the delay between retries after consecutive transient accept failures.
const MAX_ACCEPT_BACKOFF: Duration = Duration::from_secs(1);

/// An HTTP server that listens for incoming connections and serves them using a given service.
///
/// HTTP/1.1 and HTTP/2 are both supported, with the protocol detected per connection.
pub struct HttpServer<S> {
    listener: ConnectionOrientedListener,
    service: S,
}

impl<S> HttpServer<S> {
    /// Create a new `HttpServer` from the given listener and service.
    ///
    /// The service must be able to be cloned, as a copy is given to each incoming connection.
    pub fn from_listener(listener: ConnectionOrientedListener, service: S) -> Self {
        Self { listener, service }
    }

    /// Returns the address the server is bound to.
    pub fn local_address(&self) -> &ListenAddress {
        self.listener.local_address()
    }
}

impl<S, B> HttpServer<S>
where
    S: Service<Request<Incoming>, Response = Response<B>> + Send + Clone + 'static,
    S::Error: Into<Box<dyn StdError + Send + Sync>>,
    S::Future: Send + 'static,
    B: Body + Send + 'static,
    B::Data: Send,
    B::Error: Into<Box<dyn StdError + Send + Sync>>,
{
    /// Serves connections until shutdown is triggered on the given handle.
    ///
    /// Once shutdown is triggered, the listener is closed immediately, and open connections are asked to close once
    /// their in-flight requests complete. This method does not wait for them to do so: use the handle for that.
    ///
    /// Transient accept failures, such as running out of file descriptors, are logged and retried with an exponential
    /// backoff capped at one second.
    ///
    /// ## Errors
    ///
    /// If the listener fails to accept a new connection for any other reason, an error is returned and shutdown is
    /// triggered.
    pub async fn serve(self, shutdown: ShutdownHandle) -> Result<(), ListenerError> {
        let _server_token = shutdown.server_token();

        let Self { mut listener, service } = self;
        let conn_builder = Builder::new(ServerExecutor {
            shutdown: shutdown.clone(),
        });

        let listen_addr = listener.local_address().clone();
        info!(%listen_addr, "HTTP server started.");

        let mut accept_backoff: Option<Duration> = None;

        let result = loop {
            select! {
                // Shutdown wins over pending connections, so nothing is accepted once it has been triggered.
                biased;

                _ = shutdown.graceful.cancelled() => {
                    debug!(%listen_addr, "Received shutdown signal.");
                    break Ok(());
                }

                result = listener.accept() => match result {
                    Ok(conn) => {
                        accept_backoff = None;

                        let handler = serve_connection(conn_builder.clone(), conn, service.clone(), shutdown.clone());
                        spawn_traced(shutdown.connections.track_future(handler));
                    }
                    Err(e) if e.is_transient() => {
                        let delay = accept_backoff.map_or(MIN_ACCEPT_BACKOFF, |delay| (delay * 2).min(MAX_ACCEPT_BACKOFF));
                        accept_backoff = Some(delay);
                        warn!(%listen_addr, error = %e, retry_after = ?delay, "Transient error while accepting connection.");

                        select! {
                            _ = shutdown.graceful.cancelled() => {
                                debug!(%listen_addr, "Received shutdown signal.");
                                break Ok(());
                            }
                            _ = sleep(delay) => {}
                        }
                    }
                    Err(e) => break Err(e),
                },
            }
        };

        // Closing the listener first means new connection attempts are refused while existing connections drain.
        drop(listener);
        shutdown.trigger();
        shutdown.connections.close();

        info!(%listen_addr, "HTTP server stopped.");
        result
    }
}

async fn serve_connection<S, B>(
    conn_builder: Builder<ServerExecutor>, conn: Connection, service: S, shutdown: ShutdownHandle,
)
where
    S: Service<Request<Incoming>, Response = Response<B>> + Send + 'static,
    S::Error: Into<Box<dyn StdError + Send + Sync>>,
    S::Future: Send + 'static,
    B: Body + Send + 'static,
    B::Data: Send,
    B::Error: Into<Box<dyn StdError + Send + Sync>>,
{
    let peer = conn.peer();
    let conn = conn_builder.serve_connection(TokioIo::new(conn), service);
    tokio::pin!(conn);

    let mut graceful_requested = false;
    loop {
        select! {
            result = conn.as_mut() => {
                if let Err(e) = result {
                    debug!(%peer, error = %e, "HTTP connection closed with error.");
                }
                break;
            }

            _ = shutdown.graceful.cancelled(), if !graceful_requested => {
                graceful_requested = true;
                conn.as_mut().graceful_shutdown();
            }

            _ = shutdown.force.cancelled() => {
                debug!(%peer, "Forcefully closing HTTP connection.");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        convert::Infallible,
        io,
        sync::{
            atomic::{AtomicBool, Ordering},
            Arc,
        },
        time::Duration,
    };

    use axum::{routing::get, Router};
    use http_body_util::Full;
    use hyper::body::Bytes;
    use tokio::sync::mpsc;

    use super::*;
    use crate::net::util::hyper::TowerToHyperService;

    async fn bound_server<S>(service: S) -> (HttpServer<S>, String) {
        let listener = ConnectionOrientedListener::from_listen_address(ListenAddress::local_tcp(0))
            .await
            .unwrap();
        let server = HttpServer::from_listener(listener, service);
        let base_url = match server.local_address() {
            ListenAddress::Tcp(addr) => format!("http://{}", addr),
            #[cfg(unix)]
            other => panic!("unexpected address: {}", other),
        };

        (server, base_url)
    }

    #[tokio::test]
    async fn serves_until_shutdown() {
        let router = Router::new().route("/", get(|| async { "hello" }));
        let (server, base_url) = bound_server(TowerToHyperService::new(router)).await;

        let shutdown = ShutdownHandle::new();
        let serve = tokio::spawn(server.serve(shutdown.clone()));

        let body = reqwest::get(format!("{}/", base_url)).await.unwrap().text().await.unwrap();
        assert_eq!(body, "hello");

        shutdown.shutdown().await;
        serve.await.unwrap().unwrap();
        assert_eq!(shutdown.active_connections(), 0);

        assert!(reqwest::get(format!("{}/", base_url)).await.is_err());
    }

    #[tokio::test]
    async fn in_flight_requests_complete_during_shutdown() {
        let service = hyper::service::service_fn(|_req: Request<Incoming>| async {
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok::<_, Infallible>(Response::new(Full::new(Bytes::from_static(b"slow"))))
        });
        let (server, base_url) = bound_server(service).await;

        let shutdown = ShutdownHandle::new();
        let serve = tokio::spawn(server.serve(shutdown.clone()));

        let request = tokio::spawn(async move { reqwest::get(format!("{}/", base_url)).await?.text().await });
        tokio::time::sleep(Duration::from_millis(50)).await;

        shutdown.shutdown_with_timeout(Duration::from_secs(5)).await.unwrap();
        serve.await.unwrap().unwrap();

        assert_eq!(request.await.unwrap().unwrap(), "slow");
    }

    #[tokio::test]
    async fn connections_are_forcefully_closed_after_timeout() {
        let service = hyper::service::service_fn(|_req: Request<Incoming>| async {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok::<_, Infallible>(Response::new(Full::new(Bytes::from_static(b"never"))))
        });
        let (server, base_url) = bound_server(service).await;

        let shutdown = ShutdownHandle::new();
        let serve = tokio::spawn(server.serve(shutdown.clone()));

        let request = tokio::spawn(async move { reqwest::get(format!("{}/", base_url)).await });
        tokio::time::sleep(Duration::from_millis(50)).await;

        let err = shutdown
            .shutdown_with_timeout(Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err, HttpServerError::ShutdownTimedOut { remaining, .. } if remaining >= 1));

        serve.await.unwrap().unwrap();
        assert!(request.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn stuck_http2_streams_are_cancelled_after_timeout() {
        struct SetOnDrop(Arc<AtomicBool>);

        impl Drop for SetOnDrop {
            fn drop(&mut self) {
                self.0.store(true, Ordering::SeqCst);
            }
        }

        let handler_dropped = Arc::new(AtomicBool::new(false));
        let service = {
            let handler_dropped = Arc::clone(&handler_dropped);
            hyper::service::service_fn(move |_req: Request<Incoming>| {
                let guard = SetOnDrop(Arc::clone(&handler_dropped));
                async move {
                    let _guard = guard;
                    tokio::time::sleep(Duration::from_secs(30)).await;
                    Ok::<_, Infallible>(Response::new(Full::new(Bytes::from_static(b"never"))))
                }
            })
        };
        let (server, base_url) = bound_server(service).await;

        let shutdown = ShutdownHandle::new();
        let serve = tokio::spawn(server.serve(shutdown.clone()));

        let client = reqwest::Client::builder().http2_prior_knowledge().build().unwrap();
        let request = tokio::spawn(async move { client.get(format!("{}/", base_url)).send().await });
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!handler_dropped.load(Ordering::SeqCst));

        let err = shutdown
            .shutdown_with_timeout(Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err, HttpServerError::ShutdownTimedOut { .. }));

        // Once shutdown returns, no request handler may still be running.
        assert!(handler_dropped.load(Ordering::SeqCst));
        assert_eq!(shutdown.active_connections(), 0);

        serve.await.unwrap().unwrap();
        assert!(request.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn transient_accept_errors_are_retried() {
        let router = Router::new().route("/", get(|| async { "hello" }));
        let (errors_tx, errors_rx) = mpsc::unbounded_channel();
        let (server, base_url) = bound_server(TowerToHyperService::new(router)).await;
        let server = HttpServer::from_listener(server.listener.with_injected_errors(errors_rx), server.service);

        let shutdown = ShutdownHandle::new();
        let serve = tokio::spawn(server.serve(shutdown.clone()));

        errors_tx.send(io::ErrorKind::ConnectionAborted.into()).unwrap();
        #[cfg(unix)]
        errors_tx.send(io::Error::from_raw_os_error(libc::EMFILE)).unwrap();
        errors_tx.send(io::ErrorKind::ConnectionReset.into()).unwrap();

        let body = reqwest::get(format!("{}/", base_url)).await.unwrap().text().await.unwrap();
        assert_eq!(body, "hello");
        assert!(!shutdown.is_triggered());

        shutdown.shutdown().await;
        serve.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_interrupts_accept_backoff() {
        let router = Router::new().route("/", get(|| async { "hello" }));
        let (errors_tx, errors_rx) = mpsc::unbounded_channel();
        let (server, _) = bound_server(TowerToHyperService::new(router)).await;
        let server = HttpServer::from_listener(server.listener.with_injected_errors(errors_rx), server.service);

        let shutdown = ShutdownHandle::new();
        let serve = tokio::spawn(server.serve(shutdown.clone()));

        // Enough consecutive failures to reach the longest backoff.
        for _ in 0..10 {
            errors_tx.send(io::ErrorKind::ConnectionAborted.into()).unwrap();
        }
        tokio::time::sleep(Duration::from_secs(2)).await;

        shutdown.trigger();
        let result = tokio::time::timeout(Duration::from_millis(10), serve).await;
        assert!(result.unwrap().unwrap().is_ok());
    }

    #[tokio::test]
    async fn fatal_accept_error_stops_server() {
        let router = Router::new().route("/", get(|| async { "hello" }));
        let (errors_tx, errors_rx) = mpsc::unbounded_channel();
        let (server, base_url) = bound_server(TowerToHyperService::new(router)).await;
        let server = HttpServer::from_listener(server.listener.with_injected_errors(errors_rx), server.service);

        let shutdown = ShutdownHandle::new();
        let serve = tokio::spawn(server.serve(shutdown.clone()));

        errors_tx.send(io::ErrorKind::InvalidInput.into()).unwrap();
        let err = serve.await.unwrap().unwrap_err();
        assert!(matches!(err, ListenerError::FailedToAccept { .. }));
        assert_eq!(err.io_error().kind(), io::ErrorKind::InvalidInput);
        assert!(shutdown.is_triggered());

        assert!(reqwest::get(format!("{}/", base_url)).await.is_err());
    }

    #[tokio::test]
    async fn shutdown_without_server_completes() {
        let shutdown = ShutdownHandle::new();
        shutdown.shutdown_with_timeout(Duration::from_millis(10)).await.unwrap();
        assert!(shutdown.is_triggered());
    }
}
