//! Shorthands over [`crate::performance`]

/// [`crate::performance::PerformanceSpan`] for the rest of the scope.
/// Fields, when given, go on a start event.
///
/// ```rust
/// use pim_tracing::perf_span;
///
/// let _span = perf_span!("broadcast", bytes = 4096, units = 64);
/// ```
#[macro_export]
macro_rules! perf_span {
    ($name:expr) => {
        $crate::performance::PerformanceSpan::new($name, None)
    };
    ($name:expr, $($field:tt = $value:expr),+ $(,)?) => {{
        $crate::__tracing::debug!(span = $name, $($field = $value),+, "perf_span_start");
        $crate::performance::PerformanceSpan::new($name, None)
    }};
}

/// [`perf_span!`] that stays silent under `threshold_us` microseconds.
#[macro_export]
macro_rules! perf_span_threshold {
    ($name:expr, $threshold_us:expr) => {
        $crate::performance::PerformanceSpan::new($name, Some($threshold_us))
    };
}

/// Debug event tagged `event = name`.
///
/// ```rust
/// use pim_tracing::perf_event;
///
/// perf_event!("callback_finished", id = 3, ok = true);
/// ```
#[macro_export]
macro_rules! perf_event {
    ($name:expr, $($field:tt = $value:expr),+ $(,)?) => {
        $crate::__tracing::debug!(event = $name, $($field = $value),+)
    };
}

/// Evaluate a block, returning `(value, duration_us)`.
///
/// ```rust
/// use pim_tracing::timed_block;
///
/// let (sum, _us) = timed_block!("sum", { (1..=10).sum::<u32>() });
/// assert_eq!(sum, 55);
/// ```
#[macro_export]
macro_rules! timed_block {
    ($name:expr, $block:block) => {{
        let started = ::std::time::Instant::now();
        let value = $block;
        let duration_us = started.elapsed().as_micros() as u64;
        $crate::__tracing::debug!(operation = $name, duration_us, "timed_block_end");
        (value, duration_us)
    }};
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use std::thread;
    use std::time::Duration;

    #[test]
    fn span_with_fields_keeps_its_name() {
        let span = perf_span!("copy", bytes = 16, units = 4);
        assert_eq!(span.name(), "copy");
    }

    #[test]
    fn threshold_span_carries_threshold() {
        let span = perf_span_threshold!("launch", 500);
        assert_eq!(span.threshold_us(), Some(500));
    }

    #[test]
    fn event_takes_fields() {
        perf_event!("callback_finished", id = 1, ok = true);
    }

    #[test]
    fn timed_block_yields_value_and_duration() {
        let (value, duration_us) = timed_block!("sleep", {
            thread::sleep(Duration::from_millis(2));
            7
        });
        assert_eq!(value, 7);
        assert!(duration_us >= 2_000);
    }
}
