//! Transport collaborator seam and the TCP implementation.
//!
//! The connection core owns lifecycle, not byte streams: it dials through a
//! [`Connector`], holds the resulting [`Connection`] inside a channel
//! reference, and closes it exactly once from the deferred-close or shutdown
//! paths. Keeping the seam as traits lets tests drive the core with the
//! in-memory doubles in [`crate::testing`] and leaves room for a TLS-capable
//! connector behind the same interface.

use std::fmt::Debug;
use std::io;
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use r66_core::ConnectionError;

/// One physical transport-level connection to a remote peer.
///
/// The object is exclusively owned by its channel reference once registered;
/// closing it is the sole responsibility of the deferred-close scheduler and
/// the registry teardown paths.
pub trait Connection: Debug + Send + Sync {
    /// Returns the remote socket address of this connection.
    fn remote_addr(&self) -> SocketAddr;

    /// Closes the connection. Idempotent; teardown callers swallow errors.
    fn close(&self) -> io::Result<()>;

    /// Returns `true` once [`close`](Self::close) has run.
    fn is_closed(&self) -> bool;
}

/// Factory for outbound physical connections.
pub trait Connector: Send + Sync {
    /// Dials `addr` within `timeout`.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectionError::NoConnection`] for structural failures
    /// (including a TLS request the connector cannot honour) and
    /// [`ConnectionError::NetworkTransient`] for timeouts and refusals.
    fn dial(
        &self,
        addr: SocketAddr,
        use_tls: bool,
        timeout: Duration,
    ) -> Result<Box<dyn Connection>, ConnectionError>;
}

/// Plain-TCP connection backed by [`TcpStream`].
#[derive(Debug)]
pub struct TcpConnection {
    stream: TcpStream,
    remote: SocketAddr,
    closed: AtomicBool,
}

impl TcpConnection {
    /// Wraps an already-established stream, e.g. one taken from an accept loop.
    pub fn from_stream(stream: TcpStream) -> io::Result<Self> {
        let remote = stream.peer_addr()?;
        Ok(Self {
            stream,
            remote,
            closed: AtomicBool::new(false),
        })
    }
}

impl Connection for TcpConnection {
    fn remote_addr(&self) -> SocketAddr {
        self.remote
    }

    fn close(&self) -> io::Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.stream.shutdown(Shutdown::Both)
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// [`Connector`] over plain TCP.
///
/// TLS is negotiated by a dedicated connector; this one reports a structural
/// [`ConnectionError::NoConnection`] when a caller requires TLS, matching the
/// "TLS unavailable when required" failure class.
#[derive(Debug, Default)]
pub struct TcpConnector;

impl TcpConnector {
    /// Creates a plain-TCP connector.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

impl Connector for TcpConnector {
    fn dial(
        &self,
        addr: SocketAddr,
        use_tls: bool,
        timeout: Duration,
    ) -> Result<Box<dyn Connection>, ConnectionError> {
        if use_tls {
            return Err(ConnectionError::NoConnection(
                "TLS required but this connector is plain TCP".into(),
            ));
        }

        let stream = TcpStream::connect_timeout(&addr, timeout)
            .map_err(|err| ConnectionError::from_dial_error(&err))?;
        stream
            .set_nodelay(true)
            .map_err(|err| ConnectionError::NoConnection(err.to_string()))?;
        let connection =
            TcpConnection::from_stream(stream).map_err(|err| ConnectionError::from_dial_error(&err))?;
        Ok(Box::new(connection))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    #[test]
    fn tls_request_is_a_structural_failure() {
        let connector = TcpConnector::new();
        let addr = "127.0.0.1:1".parse().expect("valid socket address");

        let err = connector
            .dial(addr, true, Duration::from_millis(10))
            .expect_err("plain connector cannot honour TLS");

        assert!(matches!(err, ConnectionError::NoConnection(_)));
    }

    #[test]
    fn dial_reaches_local_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind ephemeral listener");
        let addr = listener.local_addr().expect("listener address");
        let connector = TcpConnector::new();

        let connection = connector
            .dial(addr, false, Duration::from_secs(1))
            .expect("dial local listener");

        assert_eq!(connection.remote_addr(), addr);
        assert!(!connection.is_closed());
        connection.close().expect("close succeeds");
        assert!(connection.is_closed());
    }

    #[test]
    fn close_is_idempotent() {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind ephemeral listener");
        let addr = listener.local_addr().expect("listener address");
        let connection = TcpConnector::new()
            .dial(addr, false, Duration::from_secs(1))
            .expect("dial local listener");

        connection.close().expect("first close succeeds");
        connection.close().expect("second close is a no-op");
    }
}
