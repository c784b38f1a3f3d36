//! Outbound connection establishment with reuse and bounded retry.
//!
//! The [`ConnectionEstablisher`] is the only path that dials. It serializes
//! per remote address: under the address lock it first refuses addresses
//! mid-shutdown, then reuses the live channel when one exists, and only
//! dials when neither applies. Two threads racing for the same address
//! therefore produce one physical connection, never two. A fresh connection
//! is handed to the caller's handshake inside the same critical section,
//! before the channel is published, so reusers only ever see authenticated
//! channels.

use std::net::SocketAddr;
use std::sync::Arc;
use std::thread;

use r66_core::{ConnectionError, HostId};

use crate::channel::NetworkChannelReference;
use crate::registry::ConnectionRegistry;
use crate::transport::{Connection, Connector};

/// Handshake run on a freshly dialed connection before it is published.
pub type Handshake<'a> = &'a dyn Fn(&dyn Connection) -> Result<HostId, ConnectionError>;

/// Dials remote addresses, reusing live channels where possible.
pub struct ConnectionEstablisher {
    registry: Arc<ConnectionRegistry>,
    connector: Arc<dyn Connector>,
}

impl ConnectionEstablisher {
    /// Creates an establisher dialing through `connector`.
    #[must_use]
    pub fn new(registry: Arc<ConnectionRegistry>, connector: Arc<dyn Connector>) -> Self {
        Self {
            registry,
            connector,
        }
    }

    /// Returns a channel reference for `addr`, reusing the live one or
    /// dialing a fresh connection. The boolean is `true` when an existing
    /// channel was reused.
    ///
    /// A fresh connection runs `handshake` before the channel becomes
    /// visible; failure closes the socket without registering anything, so
    /// no other caller can ride an unauthenticated channel. On success the
    /// channel is indexed under the resolved host id.
    ///
    /// The returned reference holds one unconsumed claim either way; the
    /// caller must follow up with an attach or release it.
    ///
    /// # Errors
    ///
    /// - [`ConnectionError::RemoteShutdown`] while `addr` is mid-shutdown.
    /// - Whatever the dial produced, mapped through
    ///   [`ConnectionError::from_dial_error`].
    /// - Whatever `handshake` produced, on a fresh connection.
    pub fn connect(
        &self,
        addr: SocketAddr,
        use_tls: bool,
        handshake: Handshake<'_>,
    ) -> Result<(Arc<NetworkChannelReference>, bool), ConnectionError> {
        let guard = self.registry.address_guard(addr);
        let _held = guard.enter();

        self.registry.refuse_if_shutting_down(addr)?;
        if let Some(channel) = self.registry.channel_for(addr) {
            channel.reuse()?;
            channel.touch();
            tracing::debug!(channel = %channel.id(), %addr, "reusing live channel");
            return Ok((channel, true));
        }

        let timeout = self.registry.config().connection_timeout();
        let connection = self.connector.dial(addr, use_tls, timeout)?;
        let host = match handshake(&*connection) {
            Ok(host) => host,
            Err(error) => {
                if let Err(err) = connection.close() {
                    tracing::debug!(%err, "ignoring close failure after failed handshake");
                }
                return Err(error);
            }
        };
        let channel = self.registry.put_new(addr, connection)?;
        self.registry.client_channels().register(host, &channel);
        Ok((channel, false))
    }

    /// Like [`connect`](Self::connect), but retries transient dial failures
    /// up to the configured retry limit with a fixed pause between attempts.
    /// Structural failures surface immediately; exhaustion surfaces the last
    /// transient error.
    ///
    /// # Errors
    ///
    /// As [`connect`](Self::connect), after retries are spent.
    pub fn connect_with_retry(
        &self,
        addr: SocketAddr,
        use_tls: bool,
        handshake: Handshake<'_>,
    ) -> Result<(Arc<NetworkChannelReference>, bool), ConnectionError> {
        let attempts = self.registry.config().retry_limit().max(1);
        let mut attempt = 0_u32;
        loop {
            attempt += 1;
            match self.connect(addr, use_tls, handshake) {
                Ok(result) => return Ok(result),
                Err(error) if error.is_retryable() && attempt < attempts => {
                    tracing::debug!(%addr, attempt, %error, "dial failed, retrying");
                    thread::sleep(self.registry.config().retry_interval());
                }
                Err(error) => return Err(error),
            }
        }
    }
}
