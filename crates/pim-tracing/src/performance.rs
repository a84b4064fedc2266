//! Timing of transfers, launches, checkpoints and other driver round-trips
//!
//! ```rust
//! use pim_tracing::performance::{record_transfer, PerformanceSpan};
//!
//! let span = PerformanceSpan::new("push_xfer", Some(100));
//! // ... work ...
//! drop(span); // logged only when it took at least 100us
//!
//! record_transfer(4096, "to_device", 250);
//! ```
//!
//! Spans follow the settings installed by [`crate::init_global_tracing`]:
//! they can be switched off, and spans created without a threshold use
//! the configured default one.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Instant;

use tracing::{Level, Span};

static SPANS_ENABLED: AtomicBool = AtomicBool::new(true);
/// `u64::MAX` encodes "no default threshold".
static DEFAULT_THRESHOLD_US: AtomicU64 = AtomicU64::new(u64::MAX);

/// Apply the performance part of a tracing configuration.
pub fn configure(enabled: bool, default_threshold_us: Option<u64>) {
    SPANS_ENABLED.store(enabled, Ordering::Relaxed);
    DEFAULT_THRESHOLD_US.store(default_threshold_us.unwrap_or(u64::MAX), Ordering::Relaxed);
}

pub fn spans_enabled() -> bool {
    SPANS_ENABLED.load(Ordering::Relaxed)
}

fn default_threshold_us() -> Option<u64> {
    match DEFAULT_THRESHOLD_US.load(Ordering::Relaxed) {
        u64::MAX => None,
        threshold => Some(threshold),
    }
}

/// Times a region and logs its duration when dropped
///
/// Regions shorter than the threshold are not logged. A disabled span
/// still measures time but never logs.
pub struct PerformanceSpan {
    name: String,
    threshold_us: Option<u64>,
    enabled: bool,
    started: Instant,
    span: Span,
}

impl PerformanceSpan {
    /// Debug-level span. Without a threshold, the configured default applies.
    pub fn new(name: impl Into<String>, threshold_us: Option<u64>) -> Self {
        Self::with_level(Level::DEBUG, name, threshold_us)
    }

    pub fn with_level(level: Level, name: impl Into<String>, threshold_us: Option<u64>) -> Self {
        let name = name.into();
        let enabled = spans_enabled();
        let span = if !enabled {
            Span::none()
        } else {
            match level {
                Level::TRACE => tracing::trace_span!("perf", name = %name),
                Level::DEBUG => tracing::debug_span!("perf", name = %name),
                Level::INFO => tracing::info_span!("perf", name = %name),
                Level::WARN => tracing::warn_span!("perf", name = %name),
                Level::ERROR => tracing::error_span!("perf", name = %name),
            }
        };

        Self {
            name,
            threshold_us: threshold_us.or_else(default_threshold_us),
            enabled,
            started: Instant::now(),
            span,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn threshold_us(&self) -> Option<u64> {
        self.threshold_us
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn elapsed_us(&self) -> u64 {
        self.started.elapsed().as_micros() as u64
    }

    pub fn enter(&self) -> tracing::span::Entered<'_> {
        self.span.enter()
    }
}

impl Drop for PerformanceSpan {
    fn drop(&mut self) {
        if !self.enabled {
            return;
        }
        let elapsed_us = self.elapsed_us();
        if self.threshold_us.is_some_and(|threshold| elapsed_us < threshold) {
            return;
        }
        let _entered = self.span.enter();
        tracing::debug!(duration_us = elapsed_us, "perf_span_end");
    }
}

/// MiB/s for `bytes` moved in `duration_us`; zero for an instant transfer.
pub fn bandwidth_mbps(bytes: usize, duration_us: u64) -> f64 {
    if duration_us == 0 {
        return 0.0;
    }
    bytes as f64 / (1024.0 * 1024.0) / (duration_us as f64 / 1_000_000.0)
}

/// `direction` is `"to_device"` or `"from_device"`.
pub fn record_transfer(bytes: usize, direction: &str, duration_us: u64) {
    tracing::debug!(
        event = "transfer",
        bytes,
        direction,
        duration_us,
        bandwidth_mbps = bandwidth_mbps(bytes, duration_us),
        "transfer_complete"
    );
}

pub fn record_launch(units: usize, duration_us: u64, asynchronous: bool) {
    tracing::debug!(event = "launch", units, asynchronous, duration_us, "launch_complete");
}

/// `operation` is `"save"` or `"restore"`; `bytes` is the serialized size.
pub fn record_checkpoint(operation: &str, bytes: usize, duration_us: u64) {
    tracing::debug!(event = "checkpoint", operation, bytes, duration_us, "checkpoint_complete");
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::thread;
    use std::time::Duration;

    #[test]
    #[serial]
    fn explicit_threshold_wins_over_default() {
        configure(true, Some(50));
        let explicit = PerformanceSpan::new("push_xfer", Some(1000));
        let inherited = PerformanceSpan::new("push_xfer", None);
        configure(true, None);

        assert_eq!(explicit.name(), "push_xfer");
        assert_eq!(explicit.threshold_us(), Some(1000));
        assert_eq!(inherited.threshold_us(), Some(50));
        assert_eq!(PerformanceSpan::new("launch", None).threshold_us(), None);
    }

    #[test]
    #[serial]
    fn disabled_spans_still_measure() {
        configure(false, None);
        let span = PerformanceSpan::with_level(Level::INFO, "sleep", None);
        configure(true, None);

        assert!(!span.is_enabled());
        thread::sleep(Duration::from_millis(5));
        assert!(span.elapsed_us() >= 5_000);
    }

    #[test]
    fn one_mebibyte_per_millisecond() {
        let mbps = bandwidth_mbps(1024 * 1024, 1000);
        assert!((mbps - 1000.0).abs() < 0.01);
        assert_eq!(bandwidth_mbps(4096, 0), 0.0);
    }

    #[test]
    fn recorders_accept_any_values() {
        record_transfer(4096, "to_device", 250);
        record_launch(64, 1200, true);
        record_checkpoint("save", 1 << 20, 800);
    }
}
