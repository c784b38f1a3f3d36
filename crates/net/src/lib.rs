#![deny(unsafe_code)]
#![deny(rustdoc::broken_intra_doc_links)]
#![deny(missing_docs)]

//! # Overview
//!
//! `r66_net` is the connection lifecycle and multiplexing core of the OXR66
//! server. It owns every physical connection the process holds, multiplexes
//! logical sessions over them, and decides when connections open, get
//! reused, and close. Byte streams, protocol framing, and transfer logic
//! live elsewhere; this crate manages references, registries, and timers.
//!
//! # Design
//!
//! The modules compose bottom-up:
//!
//! - [`channel`] defines [`NetworkChannelReference`], the reference-counted
//!   wrapper around one physical connection and its attached sessions.
//! - [`registry`] holds the live, shutdown, and blacklist maps in
//!   [`ConnectionRegistry`], plus the deferred close of idle channels.
//! - [`establisher`] dials with reuse and bounded retry.
//! - [`limit`] implements load-based admission control and the proactive
//!   bandwidth throttle in [`throttle`].
//! - [`transaction`] is the facade the rest of the server calls.
//!
//! Collaborator seams are traits: [`Connector`]/[`Connection`] toward the
//! transport, [`LogicalSession`] toward the session layer, and
//! [`Authenticator`] toward the protocol handshake. The `test-support`
//! feature exposes in-memory doubles for all three.
//!
//! # Invariants
//!
//! - At most one live [`NetworkChannelReference`] exists per remote address;
//!   all registry mutation for an address runs under that address's lock.
//! - A channel becomes visible for reuse only after its handshake succeeded.
//! - A reference's count never goes negative, and a shutting-down reference
//!   admits no new session.
//! - An idle channel is closed no earlier than twice the connection timeout
//!   after its last use, and not at all if reused before that deadline.
//! - Shutdown and blacklist entries expire on their own after three times
//!   the connection timeout.
//!
//! # Errors
//!
//! Every fallible operation surfaces
//! [`ConnectionError`](r66_core::ConnectionError); only the
//! `NetworkTransient` kind is ever retried.

pub mod channel;
pub mod client_channels;
pub mod establisher;
pub mod limit;
mod lock_table;
pub mod registry;
mod scheduler;
pub mod session;
#[cfg(any(test, feature = "test-support"))]
pub mod testing;
pub mod throttle;
pub mod transaction;
pub mod transport;

pub use channel::{ChannelId, ChannelState, NetworkChannelReference};
pub use client_channels::ClientNetworkChannels;
pub use establisher::{ConnectionEstablisher, Handshake};
pub use limit::{ConstraintLimitHandler, LoadAvgProbe, LoadProbe};
pub use registry::ConnectionRegistry;
pub use session::{LogicalSession, SessionId, SessionOutcome};
pub use throttle::BandwidthCeiling;
pub use transaction::{Authenticator, LocalChannelHandle, NetworkTransaction};
pub use transport::{Connection, Connector, TcpConnection, TcpConnector};
