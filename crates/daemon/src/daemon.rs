//! Listener and accept loop.
//!
//! The daemon binds one TCP listener, registers every accepted connection
//! with the connection core, and runs a reader thread per peer. The reader
//! never parses protocol payloads here; it watches for activity (refreshing
//! the channel's last-used stamp) and for the peer closing its end, which
//! triggers a forced removal of the channel. A maintenance thread adjusts
//! the bandwidth ceiling against CPU load.

use std::io::{self, Read};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use socket2::{Domain, Protocol, SockAddr, Socket, Type};

use r66_core::{ConnectionError, HostId};
use r66_net::{
    Authenticator, BandwidthCeiling, Connection, ConstraintLimitHandler, LogicalSession,
    NetworkChannelReference, NetworkTransaction, SessionId, SessionOutcome, TcpConnection,
    TcpConnector,
};

use crate::config::DaemonConfig;
use crate::error::DaemonError;

const LISTEN_BACKLOG: i32 = 128;
const ACCEPT_POLL: Duration = Duration::from_millis(50);
const PEER_READ_TIMEOUT: Duration = Duration::from_millis(200);
const THROTTLE_INTERVAL: Duration = Duration::from_secs(1);

/// Resolves the remote's host identity from its socket address.
///
/// Stands in for the credential exchange of the full protocol layer; every
/// peer authenticates successfully under its address-derived identity.
struct AddressAuthenticator;

impl Authenticator for AddressAuthenticator {
    fn handshake(&self, connection: &dyn Connection) -> Result<HostId, ConnectionError> {
        Ok(HostId::new(connection.remote_addr().to_string()))
    }
}

/// Session placeholder the daemon attaches to each accepted channel.
///
/// Records the terminal outcome in the log; the transfer layer replaces this
/// with real request sessions.
struct PeerSession {
    id: SessionId,
    closed: AtomicBool,
}

impl PeerSession {
    const fn new(id: SessionId) -> Self {
        Self {
            id,
            closed: AtomicBool::new(false),
        }
    }
}

impl LogicalSession for PeerSession {
    fn id(&self) -> SessionId {
        self.id
    }

    fn deliver(&self, outcome: SessionOutcome) {
        tracing::info!(session = self.id, %outcome, "session terminated");
    }

    fn is_finished(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn failed(&self) -> bool {
        false
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// The daemon runtime: one listener plus the connection core behind it.
pub struct Daemon {
    transaction: Arc<NetworkTransaction>,
    config: DaemonConfig,
    stop: Arc<AtomicBool>,
}

/// Handle over a started daemon's worker threads.
pub struct DaemonHandle {
    addr: SocketAddr,
    stop: Arc<AtomicBool>,
    workers: Vec<thread::JoinHandle<()>>,
}

impl DaemonHandle {
    /// Returns the address the listener actually bound, which differs from
    /// the configured one when port 0 was requested.
    #[must_use]
    pub const fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Blocks until the worker threads exit on their own, i.e. until the
    /// listener fails or another holder of the stop flag raises it.
    pub fn wait(self) {
        for worker in self.workers {
            if worker.join().is_err() {
                tracing::error!("daemon worker panicked");
            }
        }
    }

    /// Signals the accept loop to stop and joins the worker threads.
    pub fn shutdown(self) {
        self.stop.store(true, Ordering::SeqCst);
        for worker in self.workers {
            if worker.join().is_err() {
                tracing::error!("daemon worker panicked");
            }
        }
    }
}

impl Daemon {
    /// Assembles the runtime from a validated configuration.
    #[must_use]
    pub fn new(config: DaemonConfig) -> Self {
        let mut limits = ConstraintLimitHandler::new(config.core);
        if let Some(rate) = config.bandwidth_limit {
            limits = limits.with_ceiling(Arc::new(BandwidthCeiling::new(rate)));
        }
        let transaction = Arc::new(
            NetworkTransaction::new(
                config.core,
                Arc::new(TcpConnector::new()),
                Arc::new(AddressAuthenticator),
                true,
            )
            .with_limit_handler(limits),
        );
        Self {
            transaction,
            config,
            stop: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Returns the connection-core facade, e.g. for administrative shutdown
    /// commands.
    #[must_use]
    pub const fn transaction(&self) -> &Arc<NetworkTransaction> {
        &self.transaction
    }

    /// Binds the listener and starts the accept and maintenance threads.
    ///
    /// # Errors
    ///
    /// Returns [`DaemonError::Bind`] when the listening socket cannot be
    /// set up.
    pub fn start(&self) -> Result<DaemonHandle, DaemonError> {
        let listener = bind_listener(self.config.bind).map_err(|source| DaemonError::Bind {
            addr: self.config.bind,
            source,
        })?;
        let addr = listener.local_addr().map_err(|source| DaemonError::Bind {
            addr: self.config.bind,
            source,
        })?;
        tracing::info!(%addr, "daemon listening");

        let mut workers = Vec::with_capacity(2);
        workers.push(self.spawn_accept_loop(listener).map_err(DaemonError::Accept)?);
        match self.spawn_maintenance() {
            Ok(worker) => workers.push(worker),
            Err(source) => {
                // Stop the already-running accept thread before surfacing.
                abort_workers(&self.stop, workers);
                return Err(DaemonError::Accept(source));
            }
        }

        Ok(DaemonHandle {
            addr,
            stop: Arc::clone(&self.stop),
            workers,
        })
    }

    fn spawn_accept_loop(&self, listener: TcpListener) -> io::Result<thread::JoinHandle<()>> {
        let transaction = Arc::clone(&self.transaction);
        let stop = Arc::clone(&self.stop);
        thread::Builder::new()
            .name("oxr66-accept".into())
            .spawn(move || {
                accept_loop(&listener, &transaction, &stop);
                transaction.shutdown();
            })
    }

    fn spawn_maintenance(&self) -> io::Result<thread::JoinHandle<()>> {
        let transaction = Arc::clone(&self.transaction);
        let stop = Arc::clone(&self.stop);
        thread::Builder::new()
            .name("oxr66-maintenance".into())
            .spawn(move || {
                let mut elapsed = Duration::ZERO;
                while !stop.load(Ordering::SeqCst) {
                    thread::sleep(ACCEPT_POLL);
                    elapsed += ACCEPT_POLL;
                    if elapsed >= THROTTLE_INTERVAL {
                        elapsed = Duration::ZERO;
                        transaction.adjust_throttle();
                    }
                }
            })
    }
}

fn accept_loop(listener: &TcpListener, transaction: &Arc<NetworkTransaction>, stop: &Arc<AtomicBool>) {
    while !stop.load(Ordering::SeqCst) {
        match listener.accept() {
            Ok((stream, peer)) => {
                tracing::debug!(%peer, "inbound connection");
                if let Err(error) = register_peer(transaction, stop, stream) {
                    tracing::warn!(%peer, %error, "inbound connection refused");
                }
            }
            Err(error) if error.kind() == io::ErrorKind::WouldBlock => {
                thread::sleep(ACCEPT_POLL);
            }
            Err(error) if error.kind() == io::ErrorKind::Interrupted => {}
            Err(error) => {
                tracing::error!(%error, "listener failed, stopping");
                stop.store(true, Ordering::SeqCst);
            }
        }
    }
}

/// Registers one accepted stream with the connection core and hands it to a
/// reader thread.
fn register_peer(
    transaction: &Arc<NetworkTransaction>,
    stop: &Arc<AtomicBool>,
    stream: TcpStream,
) -> Result<(), ConnectionError> {
    let reader = stream
        .try_clone()
        .map_err(|err| ConnectionError::NoConnection(err.to_string()))?;
    let connection =
        TcpConnection::from_stream(stream).map_err(|err| ConnectionError::NoConnection(err.to_string()))?;

    let channel = transaction.accept_connection(Box::new(connection))?;
    let session_id = channel.id().as_u64();
    transaction.add_local_channel(&channel, Arc::new(PeerSession::new(session_id)))?;

    let worker_transaction = Arc::clone(transaction);
    let worker_channel = Arc::clone(&channel);
    let worker_stop = Arc::clone(stop);
    let worker = thread::Builder::new()
        .name(format!("oxr66-peer-{session_id}"))
        .spawn(move || {
            serve_peer(&worker_transaction, &worker_channel, session_id, reader, &worker_stop);
        });
    if let Err(error) = worker {
        transaction.registry().remove_force(channel.remote_addr());
        return Err(ConnectionError::NoConnection(format!(
            "failed to spawn peer reader: {error}"
        )));
    }
    Ok(())
}

/// Watches one peer for activity, idleness, and end-of-stream.
///
/// Incoming bytes refresh the channel's last-used stamp; a clean or dirty
/// end of stream, or silence past the expiry delay, forces the channel out
/// of the registry, delivering a connection-lost outcome to whatever is
/// still attached.
fn serve_peer(
    transaction: &Arc<NetworkTransaction>,
    channel: &Arc<NetworkChannelReference>,
    session_id: SessionId,
    mut reader: TcpStream,
    stop: &Arc<AtomicBool>,
) {
    if let Err(error) = reader.set_read_timeout(Some(PEER_READ_TIMEOUT)) {
        tracing::warn!(%error, "cannot set peer read timeout");
    }
    let idle_cutoff = transaction.registry().config().expiry_delay();
    let mut buffer = [0_u8; 1024];
    loop {
        if stop.load(Ordering::SeqCst) || channel.is_closed() || channel.is_shutting_down() {
            break;
        }
        match reader.read(&mut buffer) {
            Ok(0) => {
                tracing::debug!(addr = %channel.remote_addr(), "peer closed the connection");
                transaction.registry().remove_force(channel.remote_addr());
                return;
            }
            Ok(_) => transaction.update_last_time_used(channel),
            Err(error)
                if matches!(
                    error.kind(),
                    io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted
                ) =>
            {
                if !transaction.check_idle(channel, idle_cutoff) {
                    tracing::info!(addr = %channel.remote_addr(), "peer idle past expiry, dropping");
                    transaction.registry().remove_force(channel.remote_addr());
                    return;
                }
            }
            Err(error) => {
                tracing::debug!(addr = %channel.remote_addr(), %error, "peer read failed");
                transaction.registry().remove_force(channel.remote_addr());
                return;
            }
        }
    }
    transaction.remove_local_channel(channel, session_id);
}

/// Raises the stop flag and joins whatever workers already started, so a
/// partially started daemon never leaks a running thread.
fn abort_workers(stop: &Arc<AtomicBool>, workers: Vec<thread::JoinHandle<()>>) {
    stop.store(true, Ordering::SeqCst);
    for worker in workers {
        let _ = worker.join();
    }
}

fn bind_listener(addr: SocketAddr) -> io::Result<TcpListener> {
    let domain = if addr.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };
    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.bind(&SockAddr::from(addr))?;
    socket.listen(LISTEN_BACKLOG)?;
    let listener: TcpListener = socket.into();
    listener.set_nonblocking(true)?;
    Ok(listener)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::DaemonOptions;
    use std::io::Write;

    fn test_config() -> DaemonConfig {
        DaemonConfig::from_options(DaemonOptions {
            bind: SocketAddr::from(([127, 0, 0, 1], 0)),
            timeout: Duration::from_millis(200),
            retry_limit: 3,
            max_connections: 0,
            cpu_limit: 0.0,
            bandwidth_limit: 0,
            log_filter: "info".into(),
        })
        .expect("test options validate")
    }

    #[test]
    fn bind_listener_honours_port_zero() {
        let listener = bind_listener(SocketAddr::from(([127, 0, 0, 1], 0)))
            .expect("ephemeral bind succeeds");
        let addr = listener.local_addr().expect("bound address");
        assert_ne!(addr.port(), 0);
    }

    #[test]
    fn abort_workers_stops_and_joins_started_threads() {
        let stop = Arc::new(AtomicBool::new(false));
        let worker_stop = Arc::clone(&stop);
        let worker = thread::Builder::new()
            .name("oxr66-test-worker".into())
            .spawn(move || {
                while !worker_stop.load(Ordering::SeqCst) {
                    thread::sleep(Duration::from_millis(5));
                }
            })
            .expect("worker spawns");

        abort_workers(&stop, vec![worker]);

        assert!(stop.load(Ordering::SeqCst));
    }

    #[test]
    fn accepted_peer_registers_one_channel() {
        let daemon = Daemon::new(test_config());
        let handle = daemon.start().expect("daemon starts");

        let stream = TcpStream::connect(handle.local_addr()).expect("client connects");
        thread::sleep(Duration::from_millis(150));
        assert_eq!(daemon.transaction().registry().live_count(), 1);

        drop(stream);
        handle.shutdown();
    }

    #[test]
    fn peer_disconnect_clears_the_registry() {
        let daemon = Daemon::new(test_config());
        let handle = daemon.start().expect("daemon starts");

        let mut stream = TcpStream::connect(handle.local_addr()).expect("client connects");
        stream.write_all(b"ping").expect("peer bytes go through");
        thread::sleep(Duration::from_millis(150));
        assert_eq!(daemon.transaction().registry().live_count(), 1);

        drop(stream);
        thread::sleep(Duration::from_millis(400));
        assert_eq!(daemon.transaction().registry().live_count(), 0);

        handle.shutdown();
    }
}
