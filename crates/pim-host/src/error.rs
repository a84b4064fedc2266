//! Error types for host-side orchestration

use pim_driver::DriverError;

/// Result type for pim-host operations
pub type Result<T> = std::result::Result<T, Error>;

/// Log retrieval failure for one unit of a batch
#[derive(Debug)]
pub struct LogFailure {
    /// Position of the unit in the set
    pub unit: usize,
    pub source: DriverError,
}

/// Errors that can occur in pim-host operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Neither or both transfer endpoints designate device memory
    #[error("Invalid transfer: {0}")]
    InvalidTransfer(String),

    /// A buffer list does not hold one entry per unit
    #[error("Buffer count mismatch: expected {expected}, got {actual}")]
    BufferCountMismatch { expected: usize, actual: usize },

    /// Explicit transfer size larger than a host buffer
    #[error("Buffer too small: transfer of {size} bytes, buffer holds {len}")]
    BufferTooSmall { size: usize, len: usize },

    /// Load called with no program, or with several kinds of program
    #[error("Invalid load source: {0}")]
    InvalidLoadSource(String),

    /// Allocation requested both a unit count and a rank count
    #[error("Conflicting allocation: {units} units and {ranks} ranks requested")]
    ConflictingAllocation { units: u32, ranks: u32 },

    /// Symbol not present in the loaded program
    #[error("Unknown symbol: {0}")]
    UnknownSymbol(String),

    /// Log destination that cannot be applied to the set
    #[error("Invalid log target: {0}")]
    InvalidLogTarget(String),

    /// The hierarchy this set belongs to was released
    #[error("Set used after release")]
    Released,

    #[error("Set already released")]
    AlreadyReleased,

    /// A program faulted on at least one unit
    #[error("Execution fault: {0}")]
    ExecutionFault(DriverError),

    /// Native driver error
    #[error("Driver error: {0}")]
    Driver(DriverError),

    /// Logs could not be read for some units; the others were written
    #[error("Log retrieval failed for {} unit(s)", failures.len())]
    Log { failures: Vec<LogFailure> },

    /// External compiler failure
    #[error("Compilation failed: {0}")]
    Compile(String),

    /// A user callback returned an error
    #[error("Callback failed: {0}")]
    Callback(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<DriverError> for Error {
    fn from(err: DriverError) -> Self {
        match err {
            DriverError::Callback(message) => Error::Callback(message),
            err if err.is_fault() => Error::ExecutionFault(err),
            err => Error::Driver(err),
        }
    }
}

impl Error {
    pub fn invalid_transfer(msg: impl Into<String>) -> Self {
        Error::InvalidTransfer(msg.into())
    }

    pub fn invalid_load_source(msg: impl Into<String>) -> Self {
        Error::InvalidLoadSource(msg.into())
    }

    pub fn invalid_log_target(msg: impl Into<String>) -> Self {
        Error::InvalidLogTarget(msg.into())
    }

    /// Errors raised locally, before any native call was made.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Error::InvalidTransfer(_)
                | Error::BufferCountMismatch { .. }
                | Error::BufferTooSmall { .. }
                | Error::InvalidLoadSource(_)
                | Error::ConflictingAllocation { .. }
                | Error::UnknownSymbol(_)
                | Error::InvalidLogTarget(_)
        )
    }

    pub fn is_execution_fault(&self) -> bool {
        matches!(self, Error::ExecutionFault(_))
    }

    /// Native error code when the error came from the driver.
    pub fn driver_code(&self) -> Option<u32> {
        match self {
            Error::ExecutionFault(err) | Error::Driver(err) => Some(err.code()),
            _ => None,
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unit_faults_become_execution_faults() {
        let err = Error::from(DriverError::UnitFault { units: vec![3] });
        assert!(err.is_execution_fault());
        assert!(!err.is_configuration());

        let err = Error::from(DriverError::NoProgramLoaded);
        assert!(matches!(err, Error::Driver(DriverError::NoProgramLoaded)));
        assert_eq!(err.driver_code(), Some(DriverError::NoProgramLoaded.code()));
    }

    #[test]
    fn callback_failures_keep_their_message() {
        let err = Error::from(DriverError::callback("rank 1 gave up"));
        assert!(matches!(err, Error::Callback(ref message) if message == "rank 1 gave up"));
        assert_eq!(err.driver_code(), None);
    }

    #[test]
    fn configuration_errors_are_classified() {
        assert!(Error::invalid_transfer("both sides on host").is_configuration());
        assert!(Error::BufferCountMismatch { expected: 4, actual: 3 }.is_configuration());
        assert!(!Error::Released.is_configuration());
        assert_eq!(Error::Released.driver_code(), None);
    }

    #[test]
    fn log_error_counts_failures() {
        let err = Error::Log {
            failures: vec![
                LogFailure {
                    unit: 0,
                    source: DriverError::LogContextMissing(0),
                },
                LogFailure {
                    unit: 2,
                    source: DriverError::LogContextMissing(2),
                },
            ],
        };
        assert_eq!(err.to_string(), "Log retrieval failed for 2 unit(s)");
    }
}
