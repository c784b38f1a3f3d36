//! Daemon error reporting.
//!
//! [`DaemonError`] covers the failures the runtime surfaces to its caller:
//! bad command lines, invalid configuration, and listener-level socket
//! errors. Per-connection failures never reach this type; the accept loop
//! logs them and keeps serving.

use std::io;
use std::net::SocketAddr;

use r66_core::ConfigError;

/// Error returned when the daemon fails to start or its listener dies.
#[derive(Debug, thiserror::Error)]
pub enum DaemonError {
    /// The command line did not parse.
    #[error("invalid command line: {0}")]
    Cli(String),

    /// The assembled configuration failed validation.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Binding the listening socket failed.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        /// The address the daemon tried to listen on.
        addr: SocketAddr,
        /// The underlying socket error.
        #[source]
        source: io::Error,
    },

    /// The accept loop hit an unrecoverable socket error.
    #[error("listener failed: {0}")]
    Accept(#[source] io::Error),
}

impl DaemonError {
    /// Returns the process exit code for this error.
    #[must_use]
    pub const fn exit_code(&self) -> i32 {
        match self {
            Self::Cli(_) => 2,
            Self::Config(_) => 3,
            Self::Bind { .. } | Self::Accept(_) => 10,
        }
    }
}
