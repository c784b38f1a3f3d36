//! Logical-session collaborator seam.
//!
//! A logical session is one in-flight request or transfer multiplexed over a
//! physical connection. The connection core never inspects session payloads;
//! it only needs to deliver terminal outcomes during shutdown and to know
//! whether a session already finished or holds an unreported failure. The
//! [`LogicalSession`] trait is that boundary.

use std::fmt;

/// Identifier of a logical session within one process.
pub type SessionId = u64;

/// Terminal outcome delivered to a logical session by the connection core.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum SessionOutcome {
    /// The session's channel is being administratively or remotely shut down.
    Shutdown,
    /// The underlying physical connection disappeared.
    ConnectionLost(String),
}

impl fmt::Display for SessionOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Shutdown => f.write_str("channel shutdown"),
            Self::ConnectionLost(reason) => write!(f, "connection lost: {reason}"),
        }
    }
}

/// One logical request/transfer attached to a [`NetworkChannelReference`].
///
/// Implementations live in the task/session layer. The core calls
/// [`deliver`](Self::deliver) at most once per shutdown sequence and then
/// [`close`](Self::close); both must be non-blocking and infallible since
/// they often run from timer or teardown contexts with no caller to report
/// to.
///
/// [`NetworkChannelReference`]: crate::channel::NetworkChannelReference
pub trait LogicalSession: Send + Sync {
    /// Returns the session identifier, unique within the process.
    fn id(&self) -> SessionId;

    /// Delivers a terminal outcome to the session's owner.
    fn deliver(&self, outcome: SessionOutcome);

    /// Returns `true` once the session completed and needs no outcome.
    fn is_finished(&self) -> bool;

    /// Returns `true` while the session holds a definitive failure outcome it
    /// has not yet reported back to its caller. Such sessions are closed late
    /// during shutdown so the failure report is not yanked mid-flight.
    fn failed(&self) -> bool;

    /// Releases session-local resources. Best effort, must not block.
    fn close(&self);
}
