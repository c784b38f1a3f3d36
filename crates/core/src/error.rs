//! Error taxonomy for fallible connection operations.
//!
//! The connection core distinguishes five failure kinds, and the retry loop
//! in the establisher branches purely on [`ConnectionError::is_retryable`]:
//!
//! - [`ConnectionError::RemoteShutdown`]: the target is known to be shutting
//!   down; surfaced immediately, never retried.
//! - [`ConnectionError::NoConnection`]: a structural failure (bind error,
//!   TLS requested without TLS support); never retried.
//! - [`ConnectionError::NetworkTransient`]: timeout or refused connection;
//!   retried up to the configured limit with a fixed backoff.
//! - [`ConnectionError::Overload`]: local admission control rejected the
//!   attempt; surfaced without retry at this layer.
//! - [`ConnectionError::ProtocolInvalid`]: the post-connect handshake failed;
//!   the partially-established channel is torn down before this surfaces.
//!
//! Variants carry rendered descriptions rather than source errors so the
//! enum stays `Clone + PartialEq`, which keeps retry bookkeeping and test
//! assertions straightforward.

use std::io;
use std::net::SocketAddr;

/// Error returned by connection-core operations.
#[derive(Clone, Debug, Eq, PartialEq, thiserror::Error)]
pub enum ConnectionError {
    /// The remote address or host is shutting down; never retried.
    #[error("remote {0} is shutting down")]
    RemoteShutdown(SocketAddr),

    /// A structural failure prevents connecting; never retried.
    #[error("no connection possible: {0}")]
    NoConnection(String),

    /// A timeout, refusal, or otherwise ambiguous transport failure; retryable.
    #[error("transient network failure: {0}")]
    NetworkTransient(String),

    /// Local admission control rejected the attempt.
    #[error("local overload: {0}")]
    Overload(String),

    /// The post-connect handshake failed or timed out.
    #[error("protocol handshake failed: {0}")]
    ProtocolInvalid(String),
}

impl ConnectionError {
    /// Classifies a dial-time I/O error into the taxonomy.
    ///
    /// Timeouts and refusals are ambiguous (the peer may be restarting) and
    /// therefore transient; address and permission failures are structural.
    #[must_use]
    pub fn from_dial_error(err: &io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::TimedOut
            | io::ErrorKind::WouldBlock
            | io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::Interrupted => Self::NetworkTransient(err.to_string()),
            _ => Self::NoConnection(err.to_string()),
        }
    }

    /// Returns `true` when the retry loop may attempt the operation again.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::NetworkTransient(_))
    }

    /// Returns `true` for failures that abort without touching the transport
    /// again (remote shutdown and structural failures).
    #[must_use]
    pub const fn is_structural(&self) -> bool {
        matches!(self, Self::RemoteShutdown(_) | Self::NoConnection(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr() -> SocketAddr {
        "127.0.0.1:6666".parse().expect("valid socket address")
    }

    #[test]
    fn only_transient_errors_are_retryable() {
        assert!(ConnectionError::NetworkTransient("timed out".into()).is_retryable());
        assert!(!ConnectionError::RemoteShutdown(addr()).is_retryable());
        assert!(!ConnectionError::NoConnection("bind failed".into()).is_retryable());
        assert!(!ConnectionError::Overload("cpu".into()).is_retryable());
        assert!(!ConnectionError::ProtocolInvalid("bad greeting".into()).is_retryable());
    }

    #[test]
    fn dial_timeouts_classify_as_transient() {
        let err = io::Error::new(io::ErrorKind::TimedOut, "connect timed out");

        assert!(ConnectionError::from_dial_error(&err).is_retryable());
    }

    #[test]
    fn dial_refusals_classify_as_transient() {
        let err = io::Error::new(io::ErrorKind::ConnectionRefused, "refused");

        assert!(ConnectionError::from_dial_error(&err).is_retryable());
    }

    #[test]
    fn dial_address_failures_classify_as_structural() {
        let err = io::Error::new(io::ErrorKind::AddrNotAvailable, "no route");

        let classified = ConnectionError::from_dial_error(&err);
        assert!(classified.is_structural());
        assert!(!classified.is_retryable());
    }

    #[test]
    fn display_includes_cause() {
        let err = ConnectionError::ProtocolInvalid("greeting timeout".into());

        assert!(err.to_string().contains("greeting timeout"));
    }
}
