//! Tunables consumed by the connection manager and the daemon runtime.
//!
//! Every timing constant referenced by the connection core flows through
//! [`R66Config`]: the transport connect timeout, the bounded retry loop, the
//! deferred-close and registry-expiry multipliers, and the admission-control
//! thresholds. The struct is plain data with builder-style setters; an
//! explicit [`R66Config::validate`] pass rejects combinations the runtime
//! cannot honour instead of silently clamping them.

use std::time::Duration;

/// Multiplier applied to the connection timeout before an idle channel is closed.
const DEFERRED_CLOSE_MULTIPLIER: u32 = 2;

/// Multiplier applied to the connection timeout before shutdown and blacklist
/// registry entries expire.
const EXPIRY_MULTIPLIER: u32 = 3;

/// Error returned when a configuration fails validation.
#[derive(Clone, Debug, PartialEq, thiserror::Error)]
pub enum ConfigError {
    /// The connection timeout is zero, which would disable every derived timer.
    #[error("connection timeout must be non-zero")]
    ZeroTimeout,
    /// The retry limit is zero, which would make every connect attempt fail.
    #[error("retry limit must be at least 1")]
    ZeroRetryLimit,
    /// A CPU threshold falls outside the `0.0..=1.0` range.
    #[error("cpu threshold {0} is outside 0.0..=1.0")]
    CpuThresholdRange(f64),
    /// The low CPU watermark is not below the high watermark.
    #[error("cpu low watermark {low} must be below high watermark {high}")]
    WatermarkOrder {
        /// Configured low watermark.
        low: f64,
        /// Configured high watermark.
        high: f64,
    },
    /// The throttle step is outside `1..=99` percent.
    #[error("throttle step {0}% is outside 1..=99")]
    ThrottleStepRange(u8),
}

/// Externally-configured tunables for the R66 connection core.
///
/// Defaults mirror a production deployment: a 30 second connect timeout, three
/// connect attempts with a half-second backoff, and admission control disabled
/// until thresholds are set. Derived delays are computed on demand so the
/// multipliers stay in one place:
///
/// - [`deferred_close_delay`](Self::deferred_close_delay) = 2 × timeout
/// - [`expiry_delay`](Self::expiry_delay) = 3 × timeout
///
/// # Examples
///
/// ```
/// use r66_core::R66Config;
/// use std::time::Duration;
///
/// let config = R66Config::new()
///     .with_connection_timeout(Duration::from_secs(10))
///     .with_retry_limit(5)
///     .with_max_connections(200);
/// config.validate().expect("valid configuration");
/// assert_eq!(config.deferred_close_delay(), Duration::from_secs(20));
/// ```
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct R66Config {
    connection_timeout: Duration,
    retry_limit: u32,
    retry_interval: Duration,
    admission_retry_interval: Duration,
    shutdown_grace: Duration,
    max_connections: usize,
    cpu_limit: f64,
    cpu_low_watermark: f64,
    cpu_high_watermark: f64,
    throttle_step_percent: u8,
}

impl R66Config {
    /// Creates a configuration with production defaults.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            connection_timeout: Duration::from_secs(30),
            retry_limit: 3,
            retry_interval: Duration::from_millis(500),
            admission_retry_interval: Duration::from_millis(100),
            shutdown_grace: Duration::from_secs(5),
            max_connections: 0,
            cpu_limit: 0.0,
            cpu_low_watermark: 0.2,
            cpu_high_watermark: 0.8,
            throttle_step_percent: 20,
        }
    }

    /// Sets the transport-level connect timeout.
    #[must_use]
    pub const fn with_connection_timeout(mut self, timeout: Duration) -> Self {
        self.connection_timeout = timeout;
        self
    }

    /// Sets the maximum number of underlying connect attempts.
    #[must_use]
    pub const fn with_retry_limit(mut self, limit: u32) -> Self {
        self.retry_limit = limit;
        self
    }

    /// Sets the fixed backoff slept between transient connect failures.
    #[must_use]
    pub const fn with_retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = interval;
        self
    }

    /// Sets the sleep between admission-control re-checks.
    ///
    /// Kept as an explicit tunable so tests and operators can bound the
    /// admission wait precisely.
    #[must_use]
    pub const fn with_admission_retry_interval(mut self, interval: Duration) -> Self {
        self.admission_retry_interval = interval;
        self
    }

    /// Sets the grace period slept before deferred-close sessions are torn down.
    #[must_use]
    pub const fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    /// Sets the maximum number of live channels (0 = unlimited).
    #[must_use]
    pub const fn with_max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }

    /// Sets the normalised CPU load above which new connections are refused
    /// (0.0 = disabled).
    #[must_use]
    pub const fn with_cpu_limit(mut self, limit: f64) -> Self {
        self.cpu_limit = limit;
        self
    }

    /// Sets the CPU watermarks steering proactive bandwidth throttling.
    #[must_use]
    pub const fn with_cpu_watermarks(mut self, low: f64, high: f64) -> Self {
        self.cpu_low_watermark = low;
        self.cpu_high_watermark = high;
        self
    }

    /// Sets the percentage step applied when the bandwidth ceiling is adjusted.
    #[must_use]
    pub const fn with_throttle_step_percent(mut self, percent: u8) -> Self {
        self.throttle_step_percent = percent;
        self
    }

    /// Returns the transport-level connect timeout.
    #[must_use]
    pub const fn connection_timeout(&self) -> Duration {
        self.connection_timeout
    }

    /// Returns the maximum number of underlying connect attempts.
    #[must_use]
    pub const fn retry_limit(&self) -> u32 {
        self.retry_limit
    }

    /// Returns the fixed backoff between transient connect failures.
    #[must_use]
    pub const fn retry_interval(&self) -> Duration {
        self.retry_interval
    }

    /// Returns the sleep between admission-control re-checks.
    #[must_use]
    pub const fn admission_retry_interval(&self) -> Duration {
        self.admission_retry_interval
    }

    /// Returns the number of admission re-checks performed before rejecting.
    #[must_use]
    pub const fn admission_attempts(&self) -> u32 {
        self.retry_limit * 2
    }

    /// Returns the grace period before deferred-close sessions are torn down.
    #[must_use]
    pub const fn shutdown_grace(&self) -> Duration {
        self.shutdown_grace
    }

    /// Returns the maximum number of live channels (0 = unlimited).
    #[must_use]
    pub const fn max_connections(&self) -> usize {
        self.max_connections
    }

    /// Returns the normalised CPU admission limit (0.0 = disabled).
    #[must_use]
    pub const fn cpu_limit(&self) -> f64 {
        self.cpu_limit
    }

    /// Returns the low CPU watermark for throttle recovery.
    #[must_use]
    pub const fn cpu_low_watermark(&self) -> f64 {
        self.cpu_low_watermark
    }

    /// Returns the high CPU watermark for throttle reduction.
    #[must_use]
    pub const fn cpu_high_watermark(&self) -> f64 {
        self.cpu_high_watermark
    }

    /// Returns the percentage step used by throttle adjustments.
    #[must_use]
    pub const fn throttle_step_percent(&self) -> u8 {
        self.throttle_step_percent
    }

    /// Returns the idle delay after which a zero-refcount channel is closed.
    #[must_use]
    pub fn deferred_close_delay(&self) -> Duration {
        self.connection_timeout * DEFERRED_CLOSE_MULTIPLIER
    }

    /// Returns the delay after which shutdown and blacklist entries expire.
    #[must_use]
    pub fn expiry_delay(&self) -> Duration {
        self.connection_timeout * EXPIRY_MULTIPLIER
    }

    /// Checks the configuration for combinations the runtime cannot honour.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.connection_timeout.is_zero() {
            return Err(ConfigError::ZeroTimeout);
        }
        if self.retry_limit == 0 {
            return Err(ConfigError::ZeroRetryLimit);
        }
        for threshold in [self.cpu_limit, self.cpu_low_watermark, self.cpu_high_watermark] {
            if !(0.0..=1.0).contains(&threshold) {
                return Err(ConfigError::CpuThresholdRange(threshold));
            }
        }
        if self.cpu_low_watermark >= self.cpu_high_watermark {
            return Err(ConfigError::WatermarkOrder {
                low: self.cpu_low_watermark,
                high: self.cpu_high_watermark,
            });
        }
        if !(1..=99).contains(&self.throttle_step_percent) {
            return Err(ConfigError::ThrottleStepRange(self.throttle_step_percent));
        }
        Ok(())
    }
}

impl Default for R66Config {
    fn default() -> Self {
        Self::new()
    }
}
