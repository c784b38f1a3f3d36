//! Reference-counted wrapper around one physical connection.
//!
//! A [`NetworkChannelReference`] owns a physical [`Connection`], the set of
//! logical sessions multiplexed over it, a signed reference count, and the
//! idle/shutdown bookkeeping the registry and scheduler act on. Identity is
//! an opaque [`ChannelId`] drawn from a monotonic counter, never the socket:
//! two references must stay distinguishable even while a stale one lingers
//! during teardown.
//!
//! The reference count equals attached sessions plus outstanding *claims*. A
//! claim is the slot reserved for a session between the moment a caller wins
//! the channel (creation, or a `reuse` under the address lock) and the moment
//! its session attaches; the attach consumes the claim instead of counting
//! twice. A direct attach without a prior claim increments the count, so the
//! count always equals `#attaches - #detaches` from the caller's view.

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use r66_core::{ConnectionError, HostId};

use crate::session::{LogicalSession, SessionId};
use crate::transport::Connection;

/// Opaque identity of a channel reference, assigned at creation.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, PartialOrd, Ord)]
pub struct ChannelId(u64);

impl ChannelId {
    pub(crate) const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Returns the numeric value of this channel id.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Observable lifecycle state of a channel reference.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ChannelState {
    /// Sessions are attached or claimed; the channel is in use.
    Active,
    /// Refcount reached zero; a deferred close is pending unless reused.
    IdlePendingClose,
    /// No new attach permitted; existing sessions are being drained.
    ShuttingDown,
    /// Removed from all registries, physical connection closed.
    Closed,
}

struct ChannelInner {
    refcount: i64,
    pending_claims: u32,
    sessions: HashMap<SessionId, Arc<dyn LogicalSession>>,
    last_used: Instant,
}

/// One physical connection shared by many logical sessions.
pub struct NetworkChannelReference {
    id: ChannelId,
    remote: SocketAddr,
    connection: Mutex<Option<Box<dyn Connection>>>,
    shutting_down: AtomicBool,
    closed: AtomicBool,
    host_id: Mutex<Option<HostId>>,
    inner: Mutex<ChannelInner>,
}

impl NetworkChannelReference {
    /// Creates a reference with refcount 1: the creating caller holds the
    /// claim for the first session to attach.
    pub(crate) fn new(id: ChannelId, connection: Box<dyn Connection>) -> Self {
        let remote = connection.remote_addr();
        Self {
            id,
            remote,
            connection: Mutex::new(Some(connection)),
            shutting_down: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            host_id: Mutex::new(None),
            inner: Mutex::new(ChannelInner {
                refcount: 1,
                pending_claims: 1,
                sessions: HashMap::new(),
                last_used: Instant::now(),
            }),
        }
    }

    /// Returns the opaque channel identity.
    #[must_use]
    pub fn id(&self) -> ChannelId {
        self.id
    }

    /// Returns the remote socket address of the underlying connection.
    #[must_use]
    pub fn remote_addr(&self) -> SocketAddr {
        self.remote
    }

    /// Returns the current signed reference count.
    #[must_use]
    pub fn refcount(&self) -> i64 {
        self.lock_inner().refcount
    }

    /// Returns the number of attached logical sessions.
    #[must_use]
    pub fn session_count(&self) -> usize {
        self.lock_inner().sessions.len()
    }

    /// Returns the instant of the last attach, reuse, or keep-alive touch.
    #[must_use]
    pub fn last_used(&self) -> Instant {
        self.lock_inner().last_used
    }

    /// Returns `true` when the channel was used within `delay`.
    #[must_use]
    pub fn used_within(&self, delay: Duration) -> bool {
        self.last_used().elapsed() <= delay
    }

    /// Returns `true` once a shutdown sequence started for this channel.
    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    /// Returns `true` once the physical connection was closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Returns the observable lifecycle state.
    #[must_use]
    pub fn state(&self) -> ChannelState {
        if self.is_closed() {
            ChannelState::Closed
        } else if self.is_shutting_down() {
            ChannelState::ShuttingDown
        } else if self.refcount() > 0 {
            ChannelState::Active
        } else {
            ChannelState::IdlePendingClose
        }
    }

    /// Returns the resolved remote host identifier, if authentication ran.
    #[must_use]
    pub fn host_id(&self) -> Option<HostId> {
        self.host_id.lock().expect("host id lock poisoned").clone()
    }

    pub(crate) fn set_host_id(&self, host: HostId) {
        *self.host_id.lock().expect("host id lock poisoned") = Some(host);
    }

    /// Claims the channel for one more session: refcount + last-used update.
    ///
    /// # Errors
    ///
    /// Fails with [`ConnectionError::RemoteShutdown`] once a shutdown sequence
    /// started; a shutting-down channel admits no new users.
    pub(crate) fn reuse(&self) -> Result<(), ConnectionError> {
        if self.is_shutting_down() {
            return Err(ConnectionError::RemoteShutdown(self.remote));
        }
        let mut inner = self.lock_inner();
        inner.refcount += 1;
        inner.pending_claims += 1;
        inner.last_used = Instant::now();
        Ok(())
    }

    /// Attaches a logical session, consuming an outstanding claim when one
    /// exists and incrementing the refcount otherwise.
    ///
    /// # Errors
    ///
    /// Fails with [`ConnectionError::RemoteShutdown`] once shutting down.
    pub(crate) fn attach(
        &self,
        session: Arc<dyn LogicalSession>,
    ) -> Result<(), ConnectionError> {
        if self.is_shutting_down() {
            return Err(ConnectionError::RemoteShutdown(self.remote));
        }
        let mut inner = self.lock_inner();
        if inner.pending_claims > 0 {
            inner.pending_claims -= 1;
        } else {
            inner.refcount += 1;
        }
        inner.sessions.insert(session.id(), session);
        inner.last_used = Instant::now();
        Ok(())
    }

    /// Detaches a session and returns the new refcount.
    ///
    /// The count never goes negative; a spurious detach is logged and ignored.
    pub(crate) fn detach(&self, session: SessionId) -> i64 {
        let mut inner = self.lock_inner();
        if inner.sessions.remove(&session).is_none() {
            tracing::warn!(channel = %self.id, session, "detach of unknown session ignored");
            return inner.refcount;
        }
        inner.refcount -= 1;
        if inner.refcount < 0 {
            tracing::warn!(channel = %self.id, "refcount underflow clamped to zero");
            inner.refcount = 0;
        }
        inner.refcount
    }

    /// Releases a claim taken by [`reuse`](Self::reuse) when the session never
    /// attached (e.g. the handshake failed). Returns the new refcount.
    pub(crate) fn release_claim(&self) -> i64 {
        let mut inner = self.lock_inner();
        if inner.pending_claims > 0 {
            inner.pending_claims -= 1;
            inner.refcount -= 1;
        }
        inner.refcount
    }

    /// Advances the last-used timestamp, e.g. on a keep-alive acknowledgement.
    /// No-op while shutting down.
    pub(crate) fn touch(&self) {
        if self.is_shutting_down() {
            return;
        }
        self.lock_inner().last_used = Instant::now();
    }

    /// Marks the channel as shutting down. Returns `true` on the first call.
    pub(crate) fn begin_shutdown(&self) -> bool {
        !self.shutting_down.swap(true, Ordering::SeqCst)
    }

    /// Snapshots the attached sessions for the shutdown sweep.
    pub(crate) fn sessions_snapshot(&self) -> Vec<Arc<dyn LogicalSession>> {
        self.lock_inner().sessions.values().cloned().collect()
    }

    /// Closes the physical connection exactly once, swallowing close errors.
    pub(crate) fn close_connection(&self) {
        let connection = self
            .connection
            .lock()
            .expect("connection lock poisoned")
            .take();
        if let Some(connection) = connection {
            if let Err(err) = connection.close() {
                tracing::debug!(channel = %self.id, %err, "ignoring close failure");
            }
        }
        self.closed.store(true, Ordering::SeqCst);
    }

    fn lock_inner(&self) -> MutexGuard<'_, ChannelInner> {
        self.inner.lock().expect("channel state lock poisoned")
    }
}

impl fmt::Debug for NetworkChannelReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NetworkChannelReference")
            .field("id", &self.id)
            .field("remote", &self.remote)
            .field("refcount", &self.refcount())
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl PartialEq for NetworkChannelReference {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for NetworkChannelReference {}

impl std::hash::Hash for NetworkChannelReference {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MemoryConnection, TestSession};

    fn channel() -> NetworkChannelReference {
        let addr = "127.0.0.1:6666".parse().expect("valid socket address");
        NetworkChannelReference::new(ChannelId::new(1), Box::new(MemoryConnection::new(addr)))
    }

    #[test]
    fn creation_holds_one_claim() {
        let channel = channel();

        assert_eq!(channel.refcount(), 1);
        assert_eq!(channel.session_count(), 0);
        assert_eq!(channel.state(), ChannelState::Active);
    }

    #[test]
    fn first_attach_consumes_the_creation_claim() {
        let channel = channel();
        let session = Arc::new(TestSession::new(1));

        channel.attach(session).expect("attach succeeds");

        assert_eq!(channel.refcount(), 1);
        assert_eq!(channel.session_count(), 1);
    }

    #[test]
    fn direct_attach_increments_refcount() {
        let channel = channel();
        channel
            .attach(Arc::new(TestSession::new(1)))
            .expect("first attach");

        channel
            .attach(Arc::new(TestSession::new(2)))
            .expect("second attach");

        assert_eq!(channel.refcount(), 2);
        assert_eq!(channel.session_count(), 2);
    }

    #[test]
    fn reuse_then_attach_counts_once() {
        let channel = channel();
        channel
            .attach(Arc::new(TestSession::new(1)))
            .expect("first attach");

        channel.reuse().expect("reuse succeeds");
        assert_eq!(channel.refcount(), 2);

        channel
            .attach(Arc::new(TestSession::new(2)))
            .expect("claimed attach");
        assert_eq!(channel.refcount(), 2);
        assert_eq!(channel.session_count(), 2);
    }

    #[test]
    fn detach_to_zero_enters_idle_pending_close() {
        let channel = channel();
        channel
            .attach(Arc::new(TestSession::new(1)))
            .expect("attach succeeds");

        assert_eq!(channel.detach(1), 0);
        assert_eq!(channel.state(), ChannelState::IdlePendingClose);
    }

    #[test]
    fn refcount_never_goes_negative() {
        let channel = channel();
        channel
            .attach(Arc::new(TestSession::new(1)))
            .expect("attach succeeds");

        channel.detach(1);
        assert_eq!(channel.detach(1), 0);
        assert_eq!(channel.refcount(), 0);
    }

    #[test]
    fn shutting_down_rejects_attach_and_reuse() {
        let channel = channel();
        assert!(channel.begin_shutdown());
        assert!(!channel.begin_shutdown());

        let attach_err = channel
            .attach(Arc::new(TestSession::new(1)))
            .expect_err("attach fails while shutting down");
        assert!(matches!(attach_err, ConnectionError::RemoteShutdown(_)));
        assert!(matches!(
            channel.reuse().expect_err("reuse fails while shutting down"),
            ConnectionError::RemoteShutdown(_)
        ));
        assert_eq!(channel.state(), ChannelState::ShuttingDown);
    }

    #[test]
    fn touch_is_ignored_while_shutting_down() {
        let channel = channel();
        let before = channel.last_used();
        channel.begin_shutdown();

        std::thread::sleep(Duration::from_millis(5));
        channel.touch();

        assert_eq!(channel.last_used(), before);
    }

    #[test]
    fn release_claim_undoes_reuse() {
        let channel = channel();
        channel
            .attach(Arc::new(TestSession::new(1)))
            .expect("attach succeeds");
        channel.reuse().expect("reuse succeeds");

        assert_eq!(channel.release_claim(), 1);
        assert_eq!(channel.refcount(), 1);
    }

    #[test]
    fn close_connection_is_idempotent() {
        let channel = channel();

        channel.close_connection();
        channel.close_connection();

        assert!(channel.is_closed());
        assert_eq!(channel.state(), ChannelState::Closed);
    }
}
