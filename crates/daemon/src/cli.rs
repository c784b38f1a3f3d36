//! Command-line parsing for the daemon binary.

use std::ffi::OsString;
use std::net::SocketAddr;
use std::time::Duration;

use clap::{Arg, ArgAction, Command, value_parser};

/// Options collected from the command line, before validation.
#[derive(Clone, Debug)]
pub struct DaemonOptions {
    /// Listening address.
    pub bind: SocketAddr,
    /// Connection timeout; also the base of the deferred-close and expiry
    /// timers.
    pub timeout: Duration,
    /// Transient-failure retry limit for outbound connects.
    pub retry_limit: u32,
    /// Maximum simultaneous connections, 0 for unlimited.
    pub max_connections: usize,
    /// Normalized CPU load above which admission refuses, 0 to disable.
    pub cpu_limit: f64,
    /// Global bandwidth ceiling in bytes per second, 0 for unlimited.
    pub bandwidth_limit: u64,
    /// Tracing filter directive, e.g. `info` or `r66_net=debug`.
    pub log_filter: String,
}

fn command() -> Command {
    Command::new("oxr66d")
        .about("R66 managed file-transfer daemon")
        .disable_help_flag(true)
        .disable_version_flag(true)
        .arg(
            Arg::new("help")
                .long("help")
                .short('h')
                .action(ArgAction::Help)
                .help("Print help"),
        )
        .arg(
            Arg::new("version")
                .long("version")
                .short('V')
                .action(ArgAction::Version)
                .help("Print version"),
        )
        .version(env!("CARGO_PKG_VERSION"))
        .arg(
            Arg::new("bind")
                .long("bind")
                .value_name("ADDR")
                .value_parser(value_parser!(SocketAddr))
                .default_value("0.0.0.0:6666")
                .help("Address to listen on"),
        )
        .arg(
            Arg::new("timeout")
                .long("timeout")
                .value_name("SECONDS")
                .value_parser(value_parser!(u64).range(1..))
                .default_value("30")
                .help("Connection timeout in seconds"),
        )
        .arg(
            Arg::new("retry-limit")
                .long("retry-limit")
                .value_name("COUNT")
                .value_parser(value_parser!(u32).range(1..))
                .default_value("3")
                .help("Outbound connect attempts before giving up"),
        )
        .arg(
            Arg::new("max-connections")
                .long("max-connections")
                .value_name("COUNT")
                .value_parser(value_parser!(usize))
                .default_value("0")
                .help("Maximum simultaneous connections, 0 for unlimited"),
        )
        .arg(
            Arg::new("cpu-limit")
                .long("cpu-limit")
                .value_name("FRACTION")
                .value_parser(value_parser!(f64))
                .default_value("0")
                .help("Refuse new connections above this normalized CPU load, 0 disables"),
        )
        .arg(
            Arg::new("bwlimit")
                .long("bwlimit")
                .value_name("BYTES_PER_SEC")
                .value_parser(value_parser!(u64))
                .default_value("0")
                .help("Global bandwidth ceiling, 0 for unlimited"),
        )
        .arg(
            Arg::new("log-level")
                .long("log-level")
                .value_name("FILTER")
                .default_value("info")
                .help("Tracing filter, e.g. info or r66_net=debug"),
        )
}

/// Parses the daemon command line.
///
/// # Errors
///
/// Returns the underlying [`clap::Error`], including the help and version
/// display kinds, which the caller renders with exit code 0.
pub fn parse_args<I, S>(arguments: I) -> Result<DaemonOptions, clap::Error>
where
    I: IntoIterator<Item = S>,
    S: Into<OsString> + Clone,
{
    let matches = command().try_get_matches_from(arguments)?;
    Ok(DaemonOptions {
        bind: *matches
            .get_one::<SocketAddr>("bind")
            .expect("bind has a default"),
        timeout: Duration::from_secs(
            *matches.get_one::<u64>("timeout").expect("timeout has a default"),
        ),
        retry_limit: *matches
            .get_one::<u32>("retry-limit")
            .expect("retry-limit has a default"),
        max_connections: *matches
            .get_one::<usize>("max-connections")
            .expect("max-connections has a default"),
        cpu_limit: *matches
            .get_one::<f64>("cpu-limit")
            .expect("cpu-limit has a default"),
        bandwidth_limit: *matches
            .get_one::<u64>("bwlimit")
            .expect("bwlimit has a default"),
        log_filter: matches
            .get_one::<String>("log-level")
            .expect("log-level has a default")
            .clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_parse() {
        let options = parse_args(["oxr66d"]).expect("defaults are valid");

        assert_eq!(options.bind, "0.0.0.0:6666".parse().expect("valid addr"));
        assert_eq!(options.timeout, Duration::from_secs(30));
        assert_eq!(options.retry_limit, 3);
        assert_eq!(options.max_connections, 0);
        assert_eq!(options.bandwidth_limit, 0);
        assert_eq!(options.log_filter, "info");
    }

    #[test]
    fn explicit_values_override_defaults() {
        let options = parse_args([
            "oxr66d",
            "--bind",
            "127.0.0.1:7777",
            "--timeout",
            "5",
            "--retry-limit",
            "2",
            "--max-connections",
            "100",
            "--cpu-limit",
            "0.8",
            "--bwlimit",
            "1048576",
            "--log-level",
            "r66_net=debug",
        ])
        .expect("explicit values are valid");

        assert_eq!(options.bind, "127.0.0.1:7777".parse().expect("valid addr"));
        assert_eq!(options.timeout, Duration::from_secs(5));
        assert_eq!(options.retry_limit, 2);
        assert_eq!(options.max_connections, 100);
        assert!((options.cpu_limit - 0.8).abs() < f64::EPSILON);
        assert_eq!(options.bandwidth_limit, 1_048_576);
        assert_eq!(options.log_filter, "r66_net=debug");
    }

    #[test]
    fn zero_timeout_is_rejected_at_parse_time() {
        parse_args(["oxr66d", "--timeout", "0"]).expect_err("range excludes zero");
    }
}
