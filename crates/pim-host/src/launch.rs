//! Execution status and unit log routing

use std::collections::HashMap;
use std::fmt;
use std::io::{self, Write};
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};
use pim_driver::UnitStatus;

use crate::error::{Error, Result};

/// Whether a set finished running and whether any unit faulted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ExecutionStatus {
    pub done: bool,
    pub fault: bool,
}

impl From<UnitStatus> for ExecutionStatus {
    fn from(status: UnitStatus) -> Self {
        Self {
            done: status.done,
            fault: status.fault,
        }
    }
}

/// Shared destination for unit logs
#[derive(Clone)]
pub struct LogSink(Arc<Mutex<dyn Write + Send>>);

impl LogSink {
    pub fn new<W: Write + Send + 'static>(writer: W) -> Self {
        LogSink(Arc::new(Mutex::new(writer)))
    }

    pub fn stdout() -> Self {
        Self::new(io::stdout())
    }

    pub fn from_shared(writer: Arc<Mutex<dyn Write + Send>>) -> Self {
        LogSink(writer)
    }

    /// In-memory sink, and a handle to read what was written to it.
    pub fn buffer() -> (Self, LogBuffer) {
        let buffer = LogBuffer::default();
        (Self::new(buffer.clone()), buffer)
    }

    pub fn lock(&self) -> MutexGuard<'_, dyn Write + Send> {
        self.0.lock()
    }

    pub fn ptr_eq(&self, other: &LogSink) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for LogSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("LogSink").field(&Arc::as_ptr(&self.0)).finish()
    }
}

/// Growable byte buffer usable as a log sink
#[derive(Debug, Clone, Default)]
pub struct LogBuffer(Arc<Mutex<Vec<u8>>>);

impl LogBuffer {
    pub fn contents(&self) -> Vec<u8> {
        self.0.lock().clone()
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.0.lock()).into_owned()
    }

    pub fn clear(&self) {
        self.0.lock().clear();
    }
}

impl Write for LogBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Where one `log` call sends each unit's log
#[derive(Debug, Clone)]
pub enum LogTarget {
    /// Every unit of the set
    All(LogSink),
    /// One entry per unit, in set order; `None` falls back to the defaults
    PerUnit(Vec<Option<LogSink>>),
    /// By position in the set; missing units fall back to the defaults
    ByUnit(HashMap<usize, LogSink>),
}

/// Sink of every unit: explicit target, then the unit's own sink, then the
/// hierarchy default. Units left with `None` are not read.
pub(crate) fn resolve_sinks(
    target: Option<&LogTarget>,
    unit_defaults: &[Option<LogSink>],
    global: Option<&LogSink>,
) -> Result<Vec<Option<LogSink>>> {
    let unit_count = unit_defaults.len();
    let explicit: Vec<Option<LogSink>> = match target {
        None => vec![None; unit_count],
        Some(LogTarget::All(sink)) => vec![Some(sink.clone()); unit_count],
        Some(LogTarget::PerUnit(sinks)) => {
            if sinks.len() != unit_count {
                return Err(Error::invalid_log_target(format!(
                    "{} sink(s) for {unit_count} unit(s)",
                    sinks.len()
                )));
            }
            sinks.clone()
        }
        Some(LogTarget::ByUnit(sinks)) => {
            if let Some(position) = sinks.keys().find(|&&position| position >= unit_count) {
                return Err(Error::invalid_log_target(format!(
                    "unit {position} is not in a set of {unit_count}"
                )));
            }
            (0..unit_count).map(|position| sinks.get(&position).cloned()).collect()
        }
    };

    Ok(explicit
        .into_iter()
        .zip(unit_defaults)
        .map(|(explicit, default)| explicit.or_else(|| default.clone()).or_else(|| global.cloned()))
        .collect())
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn same(left: &Option<LogSink>, right: &LogSink) -> bool {
        left.as_ref().is_some_and(|sink| sink.ptr_eq(right))
    }

    #[test]
    fn explicit_target_wins_over_defaults() {
        let (explicit, _) = LogSink::buffer();
        let (unit, _) = LogSink::buffer();
        let (global, _) = LogSink::buffer();

        let sinks = resolve_sinks(
            Some(&LogTarget::PerUnit(vec![Some(explicit.clone()), None, None])),
            &[Some(unit.clone()), Some(unit.clone()), None],
            Some(&global),
        )
        .unwrap();
        assert!(same(&sinks[0], &explicit));
        assert!(same(&sinks[1], &unit));
        assert!(same(&sinks[2], &global));
    }

    #[test]
    fn unresolved_units_are_skipped() {
        let (unit, _) = LogSink::buffer();
        let sinks = resolve_sinks(None, &[None, Some(unit)], None).unwrap();
        assert!(sinks[0].is_none());
        assert!(sinks[1].is_some());
    }

    #[test]
    fn invalid_targets_are_configuration_errors() {
        let (sink, _) = LogSink::buffer();
        let err = resolve_sinks(Some(&LogTarget::PerUnit(vec![None])), &[None, None], None).unwrap_err();
        assert!(matches!(err, Error::InvalidLogTarget(_)));

        let by_unit = HashMap::from([(2, sink)]);
        let err = resolve_sinks(Some(&LogTarget::ByUnit(by_unit)), &[None, None], None).unwrap_err();
        assert!(err.is_configuration());
    }

    #[test]
    fn buffer_sink_collects_writes() {
        let (sink, buffer) = LogSink::buffer();
        write!(sink.lock(), "hello {}", 42).unwrap();
        assert_eq!(buffer.text(), "hello 42");
        buffer.clear();
        assert!(buffer.contents().is_empty());
    }
}
