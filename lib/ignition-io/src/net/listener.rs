//! Network listeners.
use std::io;

use snafu::{ResultExt as _, Snafu};
use tokio::net::TcpListener;

#[cfg(unix)]
use super::unix::ensure_unix_socket_free;
use super::{addr::ListenAddress, stream::Connection};

/// A listener error.
#[derive(Debug, Snafu)]
#[snafu(context(suffix(false)))]
pub enum ListenerError {
    /// Failed to bind to the listen address.
    #[snafu(display("failed to bind to listen address {}: {}", address, source))]
    FailedToBind {
        /// Listen address.
        address: ListenAddress,

        /// Source of the error.
        source: io::Error,
    },

    /// Failed to query the address the listener is bound to.
    #[snafu(display("failed to resolve local address for listener on address {}: {}", address, source))]
    FailedToResolveLocalAddress {
        /// Listen address.
        address: ListenAddress,

        /// Source of the error.
        source: io::Error,
    },

    /// Failed to accept a new connection from the listener.
    #[snafu(display("failed to accept new connection for listener on address {}: {}", address, source))]
    FailedToAccept {
        /// Listen address.
        address: ListenAddress,

        /// Source of the error.
        source: io::Error,
    },
}

impl ListenerError {
    /// Returns the underlying I/O error.
    pub fn io_error(&self) -> &io::Error {
        match self {
            Self::FailedToBind { source, .. }
            | Self::FailedToResolveLocalAddress { source, .. }
            | Self::FailedToAccept { source, .. } => source,
        }
    }

    /// Returns `true` if this is an accept failure that is expected to clear up on its own.
    ///
    /// This covers connections that were aborted or reset before they could be accepted, as well as the process or
    /// system temporarily running out of file descriptors or buffer space. Retrying the accept, after a short delay, is
    /// expected to eventually succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::FailedToAccept { source, .. } => is_transient_accept_error(source),
            Self::FailedToBind { .. } | Self::FailedToResolveLocalAddress { .. } => false,
        }
    }
}

fn is_transient_accept_error(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionRefused
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
            | io::ErrorKind::TimedOut
            | io::ErrorKind::OutOfMemory
    ) || is_resource_exhaustion(e)
}

#[cfg(unix)]
fn is_resource_exhaustion(e: &io::Error) -> bool {
    matches!(
        e.raw_os_error(),
        Some(libc::EMFILE | libc::ENFILE | libc::ENOBUFS | libc::ENOMEM)
    )
}

#[cfg(not(unix))]
fn is_resource_exhaustion(_: &io::Error) -> bool {
    false
}

enum ConnectionOrientedListenerInner {
    Tcp(TcpListener),
    #[cfg(unix)]
    Unix(tokio::net::UnixListener),
}

/// A connection-oriented network listener.
///
/// Binds TCP or Unix stream sockets and accepts new connections from them, such as for an HTTP server. Dropping the
/// listener closes the underlying socket, after which new connection attempts are refused.
pub struct ConnectionOrientedListener {
    listen_address: ListenAddress,
    local_address: ListenAddress,
    inner: ConnectionOrientedListenerInner,
    #[cfg(test)]
    injected_errors: Option<tokio::sync::mpsc::UnboundedReceiver<io::Error>>,
}

impl ConnectionOrientedListener {
    /// Creates a new `ConnectionOrientedListener` from the given listen address.
    ///
    /// ## Errors
    ///
    /// If the listen address cannot be bound, an error is returned.
    pub async fn from_listen_address(listen_address: ListenAddress) -> Result<Self, ListenerError> {
        let (inner, local_address) = match &listen_address {
            ListenAddress::Tcp(addr) => {
                let listener = TcpListener::bind(addr).await.context(FailedToBind {
                    address: listen_address.clone(),
                })?;

                // Binding to port 0 picks an ephemeral port, so the bound address is what callers need to connect to.
                let local_addr = listener.local_addr().context(FailedToResolveLocalAddress {
                    address: listen_address.clone(),
                })?;

                (ConnectionOrientedListenerInner::Tcp(listener), ListenAddress::Tcp(local_addr))
            }
            #[cfg(unix)]
            ListenAddress::Unix(addr) => {
                ensure_unix_socket_free(addr).await.context(FailedToBind {
                    address: listen_address.clone(),
                })?;

                let listener = tokio::net::UnixListener::bind(addr).context(FailedToBind {
                    address: listen_address.clone(),
                })?;

                (
                    ConnectionOrientedListenerInner::Unix(listener),
                    listen_address.clone(),
                )
            }
        };

        Ok(Self {
            listen_address,
            local_address,
            inner,
            #[cfg(test)]
            injected_errors: None,
        })
    }

    /// Makes `accept` fail with each error sent on `errors`, as it arrives.
    #[cfg(test)]
    pub(crate) fn with_injected_errors(mut self, errors: tokio::sync::mpsc::UnboundedReceiver<io::Error>) -> Self {
        self.injected_errors = Some(errors);
        self
    }

    /// Gets a reference to the configured listen address.
    pub fn listen_address(&self) -> &ListenAddress {
        &self.listen_address
    }

    /// Gets a reference to the address the listener is actually bound to.
    ///
    /// This differs from the listen address when binding to TCP port 0.
    pub fn local_address(&self) -> &ListenAddress {
        &self.local_address
    }

    /// Accepts a new connection from the listener.
    ///
    /// ## Errors
    ///
    /// If the listener fails to accept a new connection, an error is returned.
    pub async fn accept(&mut self) -> Result<Connection, ListenerError> {
        #[cfg(test)]
        if let Some(injected) = self.injected_errors.as_mut() {
            tokio::select! {
                biased;

                Some(source) = injected.recv() => {
                    return Err(ListenerError::FailedToAccept {
                        address: self.local_address.clone(),
                        source,
                    });
                }
                result = accept_connection(&mut self.inner, &self.local_address) => return result,
            }
        }

        accept_connection(&mut self.inner, &self.local_address).await
    }
}

async fn accept_connection(
    inner: &mut ConnectionOrientedListenerInner, local_address: &ListenAddress,
) -> Result<Connection, ListenerError> {
    match inner {
        ConnectionOrientedListenerInner::Tcp(tcp) => tcp
            .accept()
            .await
            .map(|(stream, addr)| Connection::Tcp(stream, addr))
            .context(FailedToAccept {
                address: local_address.clone(),
            }),
        #[cfg(unix)]
        ConnectionOrientedListenerInner::Unix(unix) => unix
            .accept()
            .await
            .map(|(stream, _)| Connection::Unix(stream))
            .context(FailedToAccept {
                address: local_address.clone(),
            }),
    }
}
