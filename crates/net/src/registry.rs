//! Authoritative registries for live, shutting-down, and blacklisted peers.
//!
//! The [`ConnectionRegistry`] owns three maps keyed by remote identity:
//!
//! - **live**: socket address → the single live channel reference for that
//!   address. At most one entry per address, guaranteed by the per-address
//!   lock every mutating path holds.
//! - **shutdown**: addresses mid-shutdown. Entries expire automatically
//!   after 3× the connection timeout.
//! - **blacklist**: remote IPs refused after bad authentication, expiring on
//!   the same multiplier, independent of the shutdown map.
//!
//! The registry also arms and cancels the deferred close of idle channels: a
//! channel whose refcount reaches zero is re-checked after 2× the connection
//! timeout and closed only if it stayed unused.

use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use r66_core::{ConnectionError, R66Config};

use crate::channel::{ChannelId, NetworkChannelReference};
use crate::client_channels::ClientNetworkChannels;
use crate::lock_table::{AddressGuard, AddressLockTable};
use crate::scheduler::{CancelToken, Scheduler};
use crate::session::{LogicalSession, SessionOutcome};
use crate::transport::Connection;

/// Granularity deferred-close re-arms are rounded up to, coalescing timers.
const RESCHEDULE_GRANULARITY_MS: u64 = 10;

/// Entry in the shutdown map: the live reference when one existed at
/// shutdown time, or a stub marking an address shut down pre-registration.
enum ShutdownEntry {
    Channel(Arc<NetworkChannelReference>),
    Stub,
}

/// Registry of every channel reference the process holds, plus the shutdown
/// and blacklist side tables.
pub struct ConnectionRegistry {
    config: R66Config,
    live: DashMap<SocketAddr, Arc<NetworkChannelReference>>,
    shutdown: DashMap<SocketAddr, ShutdownEntry>,
    blacklist: DashMap<IpAddr, Instant>,
    locks: AddressLockTable,
    clients: ClientNetworkChannels,
    scheduler: Scheduler,
    pending_closes: DashMap<ChannelId, CancelToken>,
    next_channel_id: AtomicU64,
}

impl ConnectionRegistry {
    /// Creates a registry with its own timer thread.
    #[must_use]
    pub fn new(config: R66Config) -> Arc<Self> {
        Arc::new(Self {
            config,
            live: DashMap::new(),
            shutdown: DashMap::new(),
            blacklist: DashMap::new(),
            locks: AddressLockTable::new(),
            clients: ClientNetworkChannels::new(),
            scheduler: Scheduler::new(),
            pending_closes: DashMap::new(),
            next_channel_id: AtomicU64::new(1),
        })
    }

    /// Returns the configuration this registry was built with.
    #[must_use]
    pub const fn config(&self) -> &R66Config {
        &self.config
    }

    /// Returns the host-id index over client-side channels.
    #[must_use]
    pub const fn client_channels(&self) -> &ClientNetworkChannels {
        &self.clients
    }

    /// Returns the number of live channel references.
    #[must_use]
    pub fn live_count(&self) -> usize {
        self.live.len()
    }

    /// Returns the live channel reference for `addr`, if any.
    #[must_use]
    pub fn channel_for(&self, addr: SocketAddr) -> Option<Arc<NetworkChannelReference>> {
        self.live.get(&addr).map(|entry| Arc::clone(entry.value()))
    }

    /// Returns `true` while `addr` sits in the shutdown map.
    #[must_use]
    pub fn is_shutting_down_addr(&self, addr: SocketAddr) -> bool {
        self.shutdown.contains_key(&addr)
    }

    /// Returns `true` while `ip` is blacklisted.
    #[must_use]
    pub fn is_blacklisted(&self, ip: IpAddr) -> bool {
        self.blacklist.contains_key(&ip)
    }

    pub(crate) fn address_guard(&self, addr: SocketAddr) -> AddressGuard {
        AddressGuard::acquire(&self.locks, addr)
    }

    /// Fails with [`ConnectionError::RemoteShutdown`] while `addr` is
    /// mid-shutdown. Call under the address lock.
    pub(crate) fn refuse_if_shutting_down(&self, addr: SocketAddr) -> Result<(), ConnectionError> {
        if self.is_shutting_down_addr(addr) {
            return Err(ConnectionError::RemoteShutdown(addr));
        }
        Ok(())
    }

    /// Registers a fresh connection under `addr` with refcount 1.
    ///
    /// Call under the address lock, after [`channel_for`](Self::channel_for)
    /// returned nothing; the lookup and insert must form one atomic sequence
    /// under that lock.
    ///
    /// # Errors
    ///
    /// Fails with [`ConnectionError::NoConnection`] if a live entry already
    /// exists for `addr`.
    pub(crate) fn put_new(
        &self,
        addr: SocketAddr,
        connection: Box<dyn Connection>,
    ) -> Result<Arc<NetworkChannelReference>, ConnectionError> {
        let id = ChannelId::new(self.next_channel_id.fetch_add(1, Ordering::Relaxed));
        let channel = Arc::new(NetworkChannelReference::new(id, connection));
        match self.live.entry(addr) {
            Entry::Occupied(_) => Err(ConnectionError::NoConnection(format!(
                "address {addr} already has a live channel"
            ))),
            Entry::Vacant(slot) => {
                slot.insert(Arc::clone(&channel));
                tracing::debug!(channel = %id, %addr, "registered new channel");
                Ok(channel)
            }
        }
    }

    /// Attaches a logical session to `channel`.
    ///
    /// # Errors
    ///
    /// Fails with [`ConnectionError::RemoteShutdown`] once the channel is
    /// shutting down; the session must not use the connection in that case.
    pub fn attach_session(
        &self,
        channel: &Arc<NetworkChannelReference>,
        session: Arc<dyn LogicalSession>,
    ) -> Result<(), ConnectionError> {
        channel.attach(session)
    }

    /// Detaches a logical session; arms the deferred close when the refcount
    /// reaches zero. Never blocks on I/O.
    pub fn detach_session(self: &Arc<Self>, channel: &Arc<NetworkChannelReference>, session: u64) {
        let refcount = channel.detach(session);
        if refcount <= 0 && !channel.is_shutting_down() {
            self.arm_deferred_close(channel, self.config.deferred_close_delay());
        }
    }

    /// Releases an unconsumed reuse claim; arms the deferred close when the
    /// refcount reaches zero.
    pub(crate) fn release_claim(self: &Arc<Self>, channel: &Arc<NetworkChannelReference>) {
        let refcount = channel.release_claim();
        if refcount <= 0 && !channel.is_shutting_down() {
            self.arm_deferred_close(channel, self.config.deferred_close_delay());
        }
    }

    /// Marks `addr` as shutting down. Returns `false` when a shutdown is
    /// already in progress for that address, making concurrent callers
    /// collapse into one shutdown sequence.
    pub fn mark_shutting_down(self: &Arc<Self>, addr: SocketAddr) -> bool {
        let guard = self.address_guard(addr);
        let _held = guard.enter();

        if self.shutdown.contains_key(&addr) {
            return false;
        }
        let entry = match self.channel_for(addr) {
            Some(channel) => {
                channel.begin_shutdown();
                self.cancel_deferred_close(channel.id());
                ShutdownEntry::Channel(channel)
            }
            None => ShutdownEntry::Stub,
        };
        self.shutdown.insert(addr, entry);
        tracing::info!(%addr, "address marked shutting down");

        let registry = Arc::downgrade(self);
        self.scheduler
            .schedule_after(self.config.expiry_delay(), move || {
                let Some(registry) = registry.upgrade() else {
                    return;
                };
                if let Some((_, ShutdownEntry::Channel(channel))) = registry.shutdown.remove(&addr)
                {
                    // A shutdown whose drain never ran must not leak the
                    // connection past the expiry.
                    if !channel.is_closed() {
                        registry.remove_force(addr);
                    }
                }
                registry.maybe_release_lock(addr);
                tracing::debug!(%addr, "shutdown entry expired");
            });
        true
    }

    /// Drains and closes every session attached to `channel`, then closes the
    /// physical connection and drops the live entry.
    ///
    /// Sessions holding an unreported failure outcome are closed only after
    /// the configured grace sleep, so their failure report is not yanked
    /// mid-flight; everything else receives a terminal
    /// [`SessionOutcome::Shutdown`] and closes immediately.
    pub fn shutdown_all_sessions(self: &Arc<Self>, channel: &Arc<NetworkChannelReference>) {
        channel.begin_shutdown();
        self.cancel_deferred_close(channel.id());

        let mut close_later = Vec::new();
        for session in channel.sessions_snapshot() {
            if session.is_finished() {
                continue;
            }
            if session.failed() {
                close_later.push(session);
            } else {
                session.deliver(SessionOutcome::Shutdown);
                session.close();
            }
        }

        thread::sleep(self.config.shutdown_grace());
        for session in close_later {
            session.close();
        }

        self.remove_live_entry(channel);
        tracing::info!(channel = %channel.id(), addr = %channel.remote_addr(), "channel shut down");
    }

    /// Blacklists `ip` with an automatic expiry, independent of any shutdown.
    pub fn blacklist(self: &Arc<Self>, ip: IpAddr) {
        let expiry = self.config.expiry_delay();
        self.blacklist.insert(ip, Instant::now());
        tracing::warn!(%ip, "remote ip blacklisted");

        let registry = Arc::downgrade(self);
        self.scheduler.schedule_after(expiry, move || {
            if let Some(registry) = registry.upgrade() {
                // A refreshed entry outlives the timer that saw the old stamp.
                registry
                    .blacklist
                    .remove_if(&ip, |_, inserted| inserted.elapsed() >= expiry);
            }
        });
    }

    /// Unconditionally removes the live entry for `addr`, closing attached
    /// sessions first. Used when the underlying connection is observed
    /// closed, or to tear down a reference whose handshake failed.
    pub fn remove_force(self: &Arc<Self>, addr: SocketAddr) -> Option<Arc<NetworkChannelReference>> {
        let guard = self.address_guard(addr);
        let _held = guard.enter();

        let (_, channel) = self.live.remove(&addr)?;
        channel.begin_shutdown();
        self.cancel_deferred_close(channel.id());
        for session in channel.sessions_snapshot() {
            if !session.is_finished() {
                session.deliver(SessionOutcome::ConnectionLost(format!(
                    "connection to {addr} closed"
                )));
                session.close();
            }
        }
        self.clients.unregister(&channel);
        channel.close_connection();
        self.maybe_release_lock(addr);
        tracing::debug!(channel = %channel.id(), %addr, "channel force-removed");
        Some(channel)
    }

    /// Closes every live channel and stops the timer thread.
    pub fn shutdown_registry(self: &Arc<Self>) {
        let addrs: Vec<SocketAddr> = self.live.iter().map(|entry| *entry.key()).collect();
        for addr in addrs {
            self.remove_force(addr);
        }
        self.scheduler.stop();
    }

    /// Returns `true` when a deferred close is armed for `id`.
    #[must_use]
    pub fn close_pending(&self, id: ChannelId) -> bool {
        self.pending_closes.contains_key(&id)
    }

    fn arm_deferred_close(self: &Arc<Self>, channel: &Arc<NetworkChannelReference>, delay: Duration) {
        // At most one pending check per channel.
        if self.pending_closes.contains_key(&channel.id()) {
            return;
        }
        let registry = Arc::downgrade(self);
        let target = Arc::clone(channel);
        let token = self.scheduler.schedule_after(delay, move || {
            if let Some(registry) = registry.upgrade() {
                registry.deferred_close_check(&target);
            }
        });
        self.pending_closes.insert(channel.id(), token);
    }

    fn cancel_deferred_close(&self, id: ChannelId) {
        if let Some((_, token)) = self.pending_closes.remove(&id) {
            token.cancel();
        }
    }

    /// Fired by the timer: close the channel if it stayed idle, otherwise
    /// reschedule for the remaining idle time or stand down entirely.
    fn deferred_close_check(self: &Arc<Self>, channel: &Arc<NetworkChannelReference>) {
        self.pending_closes.remove(&channel.id());
        if channel.is_shutting_down() || channel.is_closed() {
            return;
        }
        if channel.refcount() > 0 {
            tracing::trace!(channel = %channel.id(), "deferred close cancelled, channel reused");
            return;
        }

        let deadline = channel.last_used() + self.config.deferred_close_delay();
        let now = Instant::now();
        if deadline > now {
            let remaining = round_up_millis(deadline - now);
            self.arm_deferred_close(channel, remaining);
            return;
        }

        self.remove_live_entry(channel);
        tracing::debug!(channel = %channel.id(), addr = %channel.remote_addr(), "idle channel closed");
    }

    /// Drops the live entry for `channel` (only if it still maps to this
    /// reference), detaches it from the client index, and closes the socket.
    fn remove_live_entry(&self, channel: &Arc<NetworkChannelReference>) {
        let addr = channel.remote_addr();
        let guard = self.address_guard(addr);
        let _held = guard.enter();

        self.live
            .remove_if(&addr, |_, live| live.id() == channel.id());
        self.clients.unregister(channel);
        channel.close_connection();
        self.maybe_release_lock(addr);
    }

    /// Drops the per-address lock entry once the address is gone from both
    /// the live and shutdown maps.
    fn maybe_release_lock(&self, addr: SocketAddr) {
        if !self.live.contains_key(&addr) && !self.shutdown.contains_key(&addr) {
            self.locks.release(addr);
        }
    }
}

fn round_up_millis(duration: Duration) -> Duration {
    let millis = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX);
    let rounded = millis.div_ceil(RESCHEDULE_GRANULARITY_MS) * RESCHEDULE_GRANULARITY_MS;
    Duration::from_millis(rounded.max(RESCHEDULE_GRANULARITY_MS))
}
