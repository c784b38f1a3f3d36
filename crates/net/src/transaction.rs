//! The facade the rest of the server talks to.
//!
//! [`NetworkTransaction`] composes admission control, the establisher, the
//! registry, and the authentication handshake into the operations callers
//! actually use: create a connection with retry, accept an inbound one,
//! attach and detach logical sessions, shut down a host, query blacklist and
//! idle state. Callers never reach into the registries directly.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use r66_core::{ConnectionError, HostId, R66Config};

use crate::channel::NetworkChannelReference;
use crate::establisher::ConnectionEstablisher;
use crate::limit::ConstraintLimitHandler;
use crate::registry::ConnectionRegistry;
use crate::session::{LogicalSession, SessionId};
use crate::transport::{Connection, Connector};

/// Post-connect authentication collaborator.
///
/// Runs once per fresh physical connection and resolves the remote's host
/// identity. Reused channels already carry their identity and skip the
/// handshake.
pub trait Authenticator: Send + Sync {
    /// Authenticates the remote on a fresh connection.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectionError::ProtocolInvalid`] when the remote fails
    /// authentication; the caller tears the reference down before surfacing.
    fn handshake(&self, connection: &dyn Connection) -> Result<HostId, ConnectionError>;
}

/// Handle returned by [`NetworkTransaction::create_connection_with_retry`],
/// binding one logical session to its channel reference.
#[derive(Debug)]
pub struct LocalChannelHandle {
    channel: Arc<NetworkChannelReference>,
    session_id: SessionId,
    reused: bool,
}

impl LocalChannelHandle {
    /// Returns the channel reference this handle is bound to.
    #[must_use]
    pub const fn channel(&self) -> &Arc<NetworkChannelReference> {
        &self.channel
    }

    /// Returns the bound logical session's identifier.
    #[must_use]
    pub const fn session_id(&self) -> SessionId {
        self.session_id
    }

    /// Returns `true` when the handle rides an already-live channel.
    #[must_use]
    pub const fn reused(&self) -> bool {
        self.reused
    }
}

/// Facade over the connection core.
pub struct NetworkTransaction {
    registry: Arc<ConnectionRegistry>,
    establisher: ConnectionEstablisher,
    limits: ConstraintLimitHandler,
    authenticator: Arc<dyn Authenticator>,
    server_side: bool,
}

impl NetworkTransaction {
    /// Creates a facade with its own registry and timer thread.
    ///
    /// `server_side` enables admission control; genuinely client-only roles
    /// leave it off and are never throttled by load.
    #[must_use]
    pub fn new(
        config: R66Config,
        connector: Arc<dyn Connector>,
        authenticator: Arc<dyn Authenticator>,
        server_side: bool,
    ) -> Self {
        let registry = ConnectionRegistry::new(config);
        let establisher = ConnectionEstablisher::new(Arc::clone(&registry), connector);
        let limits = ConstraintLimitHandler::new(config);
        Self {
            registry,
            establisher,
            limits,
            authenticator,
            server_side,
        }
    }

    /// Replaces the admission handler, e.g. to inject a load probe or attach
    /// a bandwidth ceiling.
    #[must_use]
    pub fn with_limit_handler(mut self, limits: ConstraintLimitHandler) -> Self {
        self.limits = limits;
        self
    }

    /// Returns the underlying registry, for collaborators that react to
    /// transport events (peer-close notifications, administrative shutdown).
    #[must_use]
    pub const fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Connects to `addr` (reusing a live channel where possible) and binds
    /// `session` to the resulting reference.
    ///
    /// Server side, admission control runs first: an overloaded node fails
    /// with [`ConnectionError::Overload`] without ever dialing. A fresh
    /// connection is authenticated before it is published, so a concurrent
    /// caller can only ever reuse a channel whose handshake already
    /// succeeded; a failed handshake closes the socket and surfaces
    /// [`ConnectionError::ProtocolInvalid`] without registering anything.
    ///
    /// # Errors
    ///
    /// Any variant of [`ConnectionError`], per the rules above and the retry
    /// policy of [`ConnectionEstablisher::connect_with_retry`].
    pub fn create_connection_with_retry(
        &self,
        addr: SocketAddr,
        use_tls: bool,
        session: Arc<dyn LogicalSession>,
    ) -> Result<LocalChannelHandle, ConnectionError> {
        if self.server_side {
            self.limits
                .wait_for_admission(|| self.registry.live_count())?;
        }

        let handshake =
            |connection: &dyn Connection| self.run_handshake(connection);
        let (channel, reused) = self
            .establisher
            .connect_with_retry(addr, use_tls, &handshake)?;

        let session_id = session.id();
        match self.registry.attach_session(&channel, session) {
            Ok(()) => Ok(LocalChannelHandle {
                channel,
                session_id,
                reused,
            }),
            Err(error) => {
                self.registry.release_claim(&channel);
                Err(error)
            }
        }
    }

    /// Registers an inbound connection accepted by the transport layer.
    ///
    /// Blacklisted IPs and addresses mid-shutdown are refused with the
    /// connection closed. The handshake runs before the channel is
    /// published; failure blacklists the remote IP and closes the socket
    /// without registering anything.
    ///
    /// The returned reference holds one unconsumed claim for the first
    /// session the caller attaches.
    ///
    /// # Errors
    ///
    /// [`ConnectionError::NoConnection`] for blacklisted remotes,
    /// [`ConnectionError::RemoteShutdown`] mid-shutdown,
    /// [`ConnectionError::Overload`] on admission failure, and
    /// [`ConnectionError::ProtocolInvalid`] after a failed handshake.
    pub fn accept_connection(
        &self,
        connection: Box<dyn Connection>,
    ) -> Result<Arc<NetworkChannelReference>, ConnectionError> {
        let addr = connection.remote_addr();
        if self.registry.is_blacklisted(addr.ip()) {
            Self::discard(&*connection);
            return Err(ConnectionError::NoConnection(format!(
                "remote ip {} is blacklisted",
                addr.ip()
            )));
        }
        if self.server_side {
            if let Err(error) = self.limits.wait_for_admission(|| self.registry.live_count()) {
                Self::discard(&*connection);
                return Err(error);
            }
        }

        let guard = self.registry.address_guard(addr);
        let _held = guard.enter();
        if let Err(error) = self.registry.refuse_if_shutting_down(addr) {
            Self::discard(&*connection);
            return Err(error);
        }
        let host = match self.run_handshake(&*connection) {
            Ok(host) => host,
            Err(error) => {
                self.registry.blacklist(addr.ip());
                Self::discard(&*connection);
                return Err(error);
            }
        };
        let channel = self.registry.put_new(addr, connection)?;
        self.registry.client_channels().register(host, &channel);
        Ok(channel)
    }

    /// Shuts down every channel the given host maintains, draining sessions
    /// with the configured grace period.
    pub fn shutdown_host(&self, host: &HostId) {
        for channel in self.registry.client_channels().channels_for(host) {
            self.registry.mark_shutting_down(channel.remote_addr());
            self.registry.shutdown_all_sessions(&channel);
        }
    }

    /// Returns `true` while `ip` is blacklisted.
    #[must_use]
    pub fn is_blacklisted(&self, ip: IpAddr) -> bool {
        self.registry.is_blacklisted(ip)
    }

    /// Returns how many channels `host` currently maintains.
    #[must_use]
    pub fn number_of_client_connections(&self, host: &HostId) -> usize {
        self.registry.client_channels().count_for(host)
    }

    /// Returns `true` when the channel was used within `delay`. Keep-alive
    /// senders use this to skip probing recently active channels.
    #[must_use]
    pub fn check_idle(&self, channel: &NetworkChannelReference, delay: Duration) -> bool {
        channel.used_within(delay)
    }

    /// Attaches another logical session to an already-held channel.
    ///
    /// # Errors
    ///
    /// Fails with [`ConnectionError::RemoteShutdown`] once the channel is
    /// shutting down.
    pub fn add_local_channel(
        &self,
        channel: &Arc<NetworkChannelReference>,
        session: Arc<dyn LogicalSession>,
    ) -> Result<(), ConnectionError> {
        self.registry.attach_session(channel, session)
    }

    /// Detaches a logical session; the last detach arms the deferred close.
    pub fn remove_local_channel(&self, channel: &Arc<NetworkChannelReference>, session: SessionId) {
        self.registry.detach_session(channel, session);
    }

    /// Returns the number of sessions attached to `channel`.
    #[must_use]
    pub fn number_of_local_channels(&self, channel: &NetworkChannelReference) -> usize {
        channel.session_count()
    }

    /// Refreshes the channel's last-used stamp, e.g. on a received
    /// keep-alive acknowledgement.
    pub fn update_last_time_used(&self, channel: &NetworkChannelReference) {
        channel.touch();
    }

    /// Runs one background throttle adjustment based on current load.
    pub fn adjust_throttle(&self) {
        self.limits.adjust_throttle();
    }

    /// Closes every live channel and stops the timer thread.
    pub fn shutdown(&self) {
        self.registry.shutdown_registry();
    }

    fn run_handshake(&self, connection: &dyn Connection) -> Result<HostId, ConnectionError> {
        self.authenticator
            .handshake(connection)
            .map_err(|error| match error {
                invalid @ ConnectionError::ProtocolInvalid(_) => invalid,
                other => ConnectionError::ProtocolInvalid(other.to_string()),
            })
    }

    fn discard(connection: &dyn Connection) {
        if let Err(err) = connection.close() {
            tracing::debug!(%err, "ignoring close failure on refused connection");
        }
    }
}
