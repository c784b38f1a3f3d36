#![deny(unsafe_code)]
#![deny(rustdoc::broken_intra_doc_links)]
#![deny(missing_docs)]

//! # Overview
//!
//! `r66_core` is the leaf crate shared by the R66 connection core and the
//! daemon front-end. It carries the externally-configured tunables consumed
//! by the connection manager ([`config::R66Config`]), the error taxonomy for
//! fallible connection operations ([`error::ConnectionError`]), and the
//! resolved remote host identifier ([`host::HostId`]).
//!
//! # Design
//!
//! The crate deliberately owns no I/O and no shared mutable state. Retry
//! policy is expressed as a pure function of the error kind
//! ([`error::ConnectionError::is_retryable`]) so callers never branch on
//! exception identity, and every timing constant flows through
//! [`config::R66Config`] rather than module-level magic numbers.

pub mod config;
pub mod error;
pub mod host;

pub use config::{ConfigError, R66Config};
pub use error::ConnectionError;
pub use host::HostId;
