//! Bridges command-line options to the validated core configuration.

use std::net::SocketAddr;
use std::num::NonZeroU64;

use r66_core::R66Config;

use crate::cli::DaemonOptions;
use crate::error::DaemonError;

/// Validated daemon configuration.
#[derive(Clone, Debug)]
pub struct DaemonConfig {
    /// Listening address.
    pub bind: SocketAddr,
    /// Connection-core tunables.
    pub core: R66Config,
    /// Global bandwidth ceiling, if one is configured.
    pub bandwidth_limit: Option<NonZeroU64>,
    /// Tracing filter directive.
    pub log_filter: String,
}

impl DaemonConfig {
    /// Builds and validates the configuration from parsed options.
    ///
    /// # Errors
    ///
    /// Returns [`DaemonError::Config`] when the core tunables are
    /// inconsistent.
    pub fn from_options(options: DaemonOptions) -> Result<Self, DaemonError> {
        let core = R66Config::new()
            .with_connection_timeout(options.timeout)
            .with_retry_limit(options.retry_limit)
            .with_max_connections(options.max_connections)
            .with_cpu_limit(options.cpu_limit);
        core.validate()?;

        Ok(Self {
            bind: options.bind,
            core,
            bandwidth_limit: NonZeroU64::new(options.bandwidth_limit),
            log_filter: options.log_filter,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn options() -> DaemonOptions {
        DaemonOptions {
            bind: SocketAddr::from(([127, 0, 0, 1], 6666)),
            timeout: Duration::from_secs(30),
            retry_limit: 3,
            max_connections: 0,
            cpu_limit: 0.0,
            bandwidth_limit: 0,
            log_filter: "info".into(),
        }
    }

    #[test]
    fn zero_bandwidth_means_unlimited() {
        let config = DaemonConfig::from_options(options()).expect("valid options");
        assert!(config.bandwidth_limit.is_none());
    }

    #[test]
    fn bandwidth_limit_survives_the_mapping() {
        let config = DaemonConfig::from_options(DaemonOptions {
            bandwidth_limit: 1_048_576,
            ..options()
        })
        .expect("valid options");
        assert_eq!(config.bandwidth_limit.map(NonZeroU64::get), Some(1_048_576));
    }

    #[test]
    fn out_of_range_cpu_limit_is_rejected() {
        let error = DaemonConfig::from_options(DaemonOptions {
            cpu_limit: 1.5,
            ..options()
        })
        .expect_err("cpu limit above 1.0 is invalid");
        assert!(matches!(error, DaemonError::Config(_)));
    }
}
