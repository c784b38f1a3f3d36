//! Local admission control for new physical connections.
//!
//! Before the accepting side registers a new connection it consults the
//! [`ConstraintLimitHandler`]: a pure check of current CPU load and live
//! channel count against the configured thresholds, wrapped in a bounded
//! busy-wait so transient load spikes do not refuse connections outright.
//! Genuinely client-only roles never consult it.
//!
//! The handler also performs proactive traffic shaping: while load sits
//! above the high watermark it steps a shared [`BandwidthCeiling`] down, and
//! once load recovers below the low watermark it steps the ceiling back up.
//! That adjustment runs as a periodic background task, independent of the
//! per-connection admission decision.

use std::sync::Arc;
use std::thread;

use r66_core::{ConnectionError, R66Config};

use crate::throttle::BandwidthCeiling;

/// Source of the normalised CPU load used by admission decisions.
///
/// Implementations return a value in `0.0..` where `1.0` means every core is
/// busy. The probe is pluggable so tests can simulate load deterministically.
pub trait LoadProbe: Send + Sync {
    /// Returns the current normalised CPU load.
    fn normalized_load(&self) -> f64;
}

/// [`LoadProbe`] reading the one-minute load average, normalised by core count.
///
/// On non-Linux targets (no `/proc/loadavg`) the probe reports zero load, so
/// only the connection-count constraint applies there.
#[derive(Debug, Default)]
pub struct LoadAvgProbe;

impl LoadAvgProbe {
    /// Creates the default system probe.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

impl LoadProbe for LoadAvgProbe {
    fn normalized_load(&self) -> f64 {
        let Ok(contents) = std::fs::read_to_string("/proc/loadavg") else {
            return 0.0;
        };
        let Some(one_minute) = contents
            .split_whitespace()
            .next()
            .and_then(|field| field.parse::<f64>().ok())
        else {
            return 0.0;
        };
        one_minute / num_cpus::get() as f64
    }
}

/// Admission-control oracle consulted before creating a new connection.
pub struct ConstraintLimitHandler {
    config: R66Config,
    probe: Arc<dyn LoadProbe>,
    ceiling: Option<Arc<BandwidthCeiling>>,
}

impl ConstraintLimitHandler {
    /// Creates a handler with the default system load probe and no ceiling.
    #[must_use]
    pub fn new(config: R66Config) -> Self {
        Self::with_probe(config, Arc::new(LoadAvgProbe::new()))
    }

    /// Creates a handler with a caller-supplied load probe.
    #[must_use]
    pub fn with_probe(config: R66Config, probe: Arc<dyn LoadProbe>) -> Self {
        Self {
            config,
            probe,
            ceiling: None,
        }
    }

    /// Attaches the shared bandwidth ceiling adjusted by
    /// [`adjust_throttle`](Self::adjust_throttle).
    #[must_use]
    pub fn with_ceiling(mut self, ceiling: Arc<BandwidthCeiling>) -> Self {
        self.ceiling = Some(ceiling);
        self
    }

    /// Decides whether a new connection may proceed right now.
    ///
    /// A threshold of zero disables the corresponding constraint.
    #[must_use]
    pub fn admit(&self, open_channels: usize) -> bool {
        let max = self.config.max_connections();
        if max != 0 && open_channels >= max {
            return false;
        }
        let cpu_limit = self.config.cpu_limit();
        if cpu_limit > 0.0 && self.probe.normalized_load() >= cpu_limit {
            return false;
        }
        true
    }

    /// Re-checks admission up to `2 × retry limit` times, sleeping the
    /// configured admission interval between attempts.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectionError::Overload`] once every check refused.
    pub fn wait_for_admission(
        &self,
        open_channels: impl Fn() -> usize,
    ) -> Result<(), ConnectionError> {
        let attempts = self.config.admission_attempts().max(1);
        for attempt in 1..=attempts {
            if self.admit(open_channels()) {
                return Ok(());
            }
            tracing::debug!(attempt, attempts, "admission refused, waiting");
            if attempt < attempts {
                thread::sleep(self.config.admission_retry_interval());
            }
        }
        Err(ConnectionError::Overload(format!(
            "admission refused after {attempts} checks"
        )))
    }

    /// Performs one step of proactive bandwidth throttling.
    ///
    /// Call periodically from a background task. No-op without a ceiling.
    pub fn adjust_throttle(&self) {
        let Some(ceiling) = &self.ceiling else {
            return;
        };
        let load = self.probe.normalized_load();
        let step = self.config.throttle_step_percent();
        if load >= self.config.cpu_high_watermark() {
            let rate = ceiling.decrease(step);
            tracing::debug!(load, rate, "cpu high, bandwidth ceiling lowered");
        } else if load <= self.config.cpu_low_watermark() && ceiling.is_throttled() {
            let rate = ceiling.restore(step);
            tracing::debug!(load, rate, "cpu recovered, bandwidth ceiling raised");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::num::NonZeroU64;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::time::Duration;

    struct FixedLoad(f64);

    impl LoadProbe for FixedLoad {
        fn normalized_load(&self) -> f64 {
            self.0
        }
    }

    /// Probe whose load drops after a number of readings.
    struct RecoveringLoad {
        readings: AtomicU64,
        busy_until: u64,
    }

    impl LoadProbe for RecoveringLoad {
        fn normalized_load(&self) -> f64 {
            if self.readings.fetch_add(1, Ordering::SeqCst) < self.busy_until {
                1.0
            } else {
                0.0
            }
        }
    }

    fn config() -> R66Config {
        R66Config::new()
            .with_retry_limit(2)
            .with_admission_retry_interval(Duration::from_millis(5))
            .with_cpu_limit(0.9)
            .with_max_connections(10)
    }

    #[test]
    fn admits_under_both_thresholds() {
        let handler = ConstraintLimitHandler::with_probe(config(), Arc::new(FixedLoad(0.1)));

        assert!(handler.admit(3));
    }

    #[test]
    fn refuses_at_connection_cap() {
        let handler = ConstraintLimitHandler::with_probe(config(), Arc::new(FixedLoad(0.1)));

        assert!(!handler.admit(10));
    }

    #[test]
    fn refuses_above_cpu_limit() {
        let handler = ConstraintLimitHandler::with_probe(config(), Arc::new(FixedLoad(0.95)));

        assert!(!handler.admit(0));
    }

    #[test]
    fn zero_thresholds_disable_constraints() {
        let config = R66Config::new().with_cpu_limit(0.0).with_max_connections(0);
        let handler = ConstraintLimitHandler::with_probe(config, Arc::new(FixedLoad(50.0)));

        assert!(handler.admit(usize::MAX - 1));
    }

    #[test]
    fn wait_succeeds_once_load_recovers() {
        let probe = Arc::new(RecoveringLoad {
            readings: AtomicU64::new(0),
            busy_until: 2,
        });
        let handler = ConstraintLimitHandler::with_probe(config(), probe);

        handler
            .wait_for_admission(|| 0)
            .expect("admission succeeds after recovery");
    }

    #[test]
    fn wait_rejects_with_overload_after_all_attempts() {
        let handler = ConstraintLimitHandler::with_probe(config(), Arc::new(FixedLoad(1.0)));

        let err = handler
            .wait_for_admission(|| 0)
            .expect_err("persistent load refuses admission");

        assert!(matches!(err, ConnectionError::Overload(_)));
    }

    #[test]
    fn throttle_steps_down_then_restores() {
        let ceiling = Arc::new(BandwidthCeiling::new(
            NonZeroU64::new(10_000).expect("non-zero rate"),
        ));
        let probe = Arc::new(RecoveringLoad {
            readings: AtomicU64::new(0),
            busy_until: 1,
        });
        let handler = ConstraintLimitHandler::with_probe(config(), probe)
            .with_ceiling(Arc::clone(&ceiling));

        handler.adjust_throttle();
        assert_eq!(ceiling.current(), 8_000);

        handler.adjust_throttle();
        assert_eq!(ceiling.current(), 10_000);
    }
}
