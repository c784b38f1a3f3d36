#![deny(unsafe_code)]
#![deny(rustdoc::broken_intra_doc_links)]
#![deny(missing_docs)]

//! # Overview
//!
//! `r66_daemon` wraps the connection core of the OXR66 server in a runnable
//! daemon: command-line parsing, configuration validation, a TCP listener
//! with its accept loop, and structured logging. Protocol framing and
//! transfer logic are separate layers; here every accepted peer gets a
//! placeholder session and is managed purely at the connection level.
//!
//! # Design
//!
//! - [`cli`] parses the command line into [`DaemonOptions`](cli::DaemonOptions).
//! - [`config`] validates them into a [`DaemonConfig`](config::DaemonConfig)
//!   carrying the core tunables.
//! - [`daemon`] binds the listener and drives the accept and maintenance
//!   threads over a [`NetworkTransaction`](r66_net::NetworkTransaction).
//! - [`error`] maps failures to process exit codes.
//!
//! The [`run`] entry point ties these together for the `oxr66d` binary.

pub mod cli;
pub mod config;
pub mod daemon;
pub mod error;

pub use cli::DaemonOptions;
pub use config::DaemonConfig;
pub use daemon::{Daemon, DaemonHandle};
pub use error::DaemonError;

use std::ffi::OsString;

use tracing_subscriber::EnvFilter;

/// Runs the daemon from a raw argument iterator and returns the process
/// exit code.
pub fn run<I, S>(arguments: I) -> i32
where
    I: IntoIterator<Item = S>,
    S: Into<OsString> + Clone,
{
    let options = match cli::parse_args(arguments) {
        Ok(options) => options,
        Err(error) if error.use_stderr() => {
            eprintln!("{error}");
            return DaemonError::Cli(error.to_string()).exit_code();
        }
        Err(help_or_version) => {
            print!("{help_or_version}");
            return 0;
        }
    };

    let config = match DaemonConfig::from_options(options) {
        Ok(config) => config,
        Err(error) => {
            eprintln!("oxr66d: {error}");
            return error.exit_code();
        }
    };

    init_tracing(&config.log_filter);

    let daemon = Daemon::new(config);
    match daemon.start() {
        Ok(handle) => {
            handle.wait();
            0
        }
        Err(error) => {
            tracing::error!(%error, "daemon failed to start");
            error.exit_code()
        }
    }
}

fn init_tracing(filter: &str) {
    let filter = EnvFilter::try_new(filter).unwrap_or_else(|_| EnvFilter::new("info"));
    // try_init keeps embedded callers that already installed a subscriber working.
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}
