//! Shared bandwidth ceiling adjusted by admission control.
//!
//! The ceiling is the traffic-shaping knob the data path reads before sizing
//! its write batches. Admission control nudges it downward while CPU load
//! sits above the high watermark and restores it stepwise once load drops
//! below the low watermark. Adjustments reset no transfer state; readers
//! observe the new limit on their next batch.

use std::num::NonZeroU64;
use std::sync::atomic::{AtomicU64, Ordering};

/// Fraction of the configured rate the ceiling never drops below.
const FLOOR_DIVISOR: u64 = 10;

/// Shared byte-per-second ceiling with stepwise decrease/restore.
#[derive(Debug)]
pub struct BandwidthCeiling {
    configured: NonZeroU64,
    current: AtomicU64,
}

impl BandwidthCeiling {
    /// Creates a ceiling at the configured byte-per-second rate.
    #[must_use]
    pub fn new(configured: NonZeroU64) -> Self {
        Self {
            configured,
            current: AtomicU64::new(configured.get()),
        }
    }

    /// Returns the rate the operator configured.
    #[must_use]
    pub const fn configured(&self) -> NonZeroU64 {
        self.configured
    }

    /// Returns the effective rate after throttle adjustments.
    #[must_use]
    pub fn current(&self) -> u64 {
        self.current.load(Ordering::Relaxed)
    }

    /// Returns `true` while the effective rate sits below the configured one.
    #[must_use]
    pub fn is_throttled(&self) -> bool {
        self.current() < self.configured.get()
    }

    /// Lowers the effective rate by `step_percent`, bounded by a floor of one
    /// tenth of the configured rate. Returns the new effective rate.
    pub fn decrease(&self, step_percent: u8) -> u64 {
        let floor = (self.configured.get() / FLOOR_DIVISOR).max(1);
        self.update(|current| {
            let cut = current * u64::from(step_percent) / 100;
            current.saturating_sub(cut).max(floor)
        })
    }

    /// Raises the effective rate by `step_percent` of the configured rate,
    /// capped at the configured rate. Returns the new effective rate.
    pub fn restore(&self, step_percent: u8) -> u64 {
        let cap = self.configured.get();
        let step = (cap * u64::from(step_percent) / 100).max(1);
        self.update(|current| current.saturating_add(step).min(cap))
    }

    fn update(&self, next: impl Fn(u64) -> u64) -> u64 {
        let mut current = self.current.load(Ordering::Relaxed);
        loop {
            let target = next(current);
            match self.current.compare_exchange_weak(
                current,
                target,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return target,
                Err(observed) => current = observed,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ceiling(rate: u64) -> BandwidthCeiling {
        BandwidthCeiling::new(NonZeroU64::new(rate).expect("non-zero rate"))
    }

    #[test]
    fn starts_at_configured_rate() {
        let ceiling = ceiling(10_000);

        assert_eq!(ceiling.current(), 10_000);
        assert!(!ceiling.is_throttled());
    }

    #[test]
    fn decrease_applies_percentage_step() {
        let ceiling = ceiling(10_000);

        assert_eq!(ceiling.decrease(20), 8_000);
        assert_eq!(ceiling.decrease(20), 6_400);
        assert!(ceiling.is_throttled());
    }

    #[test]
    fn decrease_never_drops_below_the_floor() {
        let ceiling = ceiling(1_000);

        for _ in 0..50 {
            ceiling.decrease(90);
        }

        assert_eq!(ceiling.current(), 100);
    }

    #[test]
    fn restore_returns_to_configured_rate() {
        let ceiling = ceiling(10_000);
        ceiling.decrease(50);

        assert_eq!(ceiling.restore(30), 8_000);
        assert_eq!(ceiling.restore(30), 10_000);
        assert_eq!(ceiling.restore(30), 10_000);
        assert!(!ceiling.is_throttled());
    }
}
