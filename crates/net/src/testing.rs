//! In-memory doubles for exercising the connection core without sockets.
//!
//! Enabled for this crate's own unit tests and, behind the `test-support`
//! feature, for the integration tests and downstream crates. Nothing here is
//! part of the stable API.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use r66_core::ConnectionError;

use crate::session::{LogicalSession, SessionId, SessionOutcome};
use crate::transport::{Connection, Connector};

/// A [`Connection`] backed by nothing but a closed flag.
///
/// Clones share the flag, so a clone kept by a test observes a close
/// performed through the registry.
#[derive(Clone, Debug)]
pub struct MemoryConnection {
    addr: SocketAddr,
    closed: Arc<AtomicBool>,
}

impl MemoryConnection {
    /// Creates an open in-memory connection pretending to reach `addr`.
    #[must_use]
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            closed: Arc::new(AtomicBool::new(false)),
        }
    }
}

impl Connection for MemoryConnection {
    fn remote_addr(&self) -> SocketAddr {
        self.addr
    }

    fn close(&self) -> std::io::Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// A [`Connector`] replaying a scripted sequence of dial outcomes.
///
/// An empty script means every dial succeeds. Each successful dial hands out
/// a fresh [`MemoryConnection`] and keeps a clone for later inspection.
#[derive(Debug, Default)]
pub struct MemoryConnector {
    script: Mutex<VecDeque<Result<(), ConnectionError>>>,
    issued: Mutex<Vec<MemoryConnection>>,
    dials: AtomicUsize,
}

impl MemoryConnector {
    /// Creates a connector whose dials all succeed.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues the outcome of the next unscripted dial.
    pub fn push_outcome(&self, outcome: Result<(), ConnectionError>) {
        self.script
            .lock()
            .expect("script mutex poisoned")
            .push_back(outcome);
    }

    /// Queues `count` failing dials followed by unscripted successes.
    pub fn fail_times(&self, count: usize, error: &ConnectionError) {
        for _ in 0..count {
            self.push_outcome(Err(error.clone()));
        }
    }

    /// Returns how many times [`Connector::dial`] ran.
    #[must_use]
    pub fn dial_count(&self) -> usize {
        self.dials.load(Ordering::SeqCst)
    }

    /// Returns clones of every connection handed out so far.
    #[must_use]
    pub fn issued(&self) -> Vec<MemoryConnection> {
        self.issued.lock().expect("issued mutex poisoned").clone()
    }
}

impl Connector for MemoryConnector {
    fn dial(
        &self,
        addr: SocketAddr,
        _use_tls: bool,
        _timeout: Duration,
    ) -> Result<Box<dyn Connection>, ConnectionError> {
        self.dials.fetch_add(1, Ordering::SeqCst);
        let scripted = self
            .script
            .lock()
            .expect("script mutex poisoned")
            .pop_front();
        if let Some(Err(error)) = scripted {
            return Err(error);
        }
        let connection = MemoryConnection::new(addr);
        self.issued
            .lock()
            .expect("issued mutex poisoned")
            .push(connection.clone());
        Ok(Box::new(connection))
    }
}

/// A [`LogicalSession`] recording what the core delivers to it.
#[derive(Debug)]
pub struct TestSession {
    id: SessionId,
    outcomes: Mutex<Vec<SessionOutcome>>,
    finished: AtomicBool,
    failed: AtomicBool,
    closed: AtomicBool,
}

impl TestSession {
    /// Creates a pending session with the given identifier.
    #[must_use]
    pub fn new(id: SessionId) -> Self {
        Self {
            id,
            outcomes: Mutex::new(Vec::new()),
            finished: AtomicBool::new(false),
            failed: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }

    /// Marks the session as already completed.
    pub fn mark_finished(&self) {
        self.finished.store(true, Ordering::SeqCst);
    }

    /// Marks the session as holding an unreported failure.
    pub fn mark_failed(&self) {
        self.failed.store(true, Ordering::SeqCst);
    }

    /// Returns every outcome delivered so far, in order.
    #[must_use]
    pub fn outcomes(&self) -> Vec<SessionOutcome> {
        self.outcomes.lock().expect("outcomes mutex poisoned").clone()
    }

    /// Returns `true` once [`LogicalSession::close`] ran.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl LogicalSession for TestSession {
    fn id(&self) -> SessionId {
        self.id
    }

    fn deliver(&self, outcome: SessionOutcome) {
        self.outcomes
            .lock()
            .expect("outcomes mutex poisoned")
            .push(outcome);
    }

    fn is_finished(&self) -> bool {
        self.finished.load(Ordering::SeqCst)
    }

    fn failed(&self) -> bool {
        self.failed.load(Ordering::SeqCst)
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}
