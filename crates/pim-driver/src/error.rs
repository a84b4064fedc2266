//! Error type returned by every driver entry point.
//!
//! Variants mirror the native driver's error taxonomy. [`DriverError::code`]
//! returns the numeric status the native library uses for the same
//! condition, so callers that log or forward codes stay compatible.

use std::fmt;

/// Result type for driver operations
pub type Result<T> = std::result::Result<T, DriverError>;

/// Memory region of a processing unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemoryRegion {
    /// Instruction memory (64-bit words)
    Iram,
    /// Main DRAM bank (bytes)
    Mram,
    /// Working scratchpad (32-bit words)
    Wram,
}

impl fmt::Display for MemoryRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MemoryRegion::Iram => write!(f, "IRAM"),
            MemoryRegion::Mram => write!(f, "MRAM"),
            MemoryRegion::Wram => write!(f, "WRAM"),
        }
    }
}

/// Errors reported by a driver
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DriverError {
    /// Driver bug or broken internal state
    #[error("internal driver error: {0}")]
    Internal(String),

    /// Operating-system level failure (threads, files)
    #[error("system error: {0}")]
    System(String),

    /// The pool cannot satisfy the requested allocation
    #[error("allocation failed: {0}")]
    Allocation(String),

    /// Handle is unknown, already freed, or of the wrong kind for the call
    #[error("invalid unit set: {0}")]
    InvalidSet(String),

    /// Address range falls outside a memory region
    #[error("invalid {region} access: address {address:#x} + {size} bytes exceeds {limit} bytes")]
    InvalidMemoryAccess {
        region: MemoryRegion,
        address: u32,
        size: usize,
        limit: usize,
    },

    /// Offset/size falls outside the symbol it targets
    #[error("invalid access to symbol {symbol}: offset {offset} + size {size} > symbol size {symbol_size}")]
    InvalidSymbolAccess {
        symbol: String,
        offset: usize,
        size: usize,
        symbol_size: usize,
    },

    /// A unit in the set has no program
    #[error("no program loaded")]
    NoProgramLoaded,

    /// Transfer matrix is missing, inconsistent, or mis-sized
    #[error("invalid memory transfer: {0}")]
    InvalidMemoryTransfer(String),

    /// One or more units faulted while running their program
    #[error("program fault on unit(s) {units:?}")]
    UnitFault { units: Vec<u32> },

    /// The binary or serialized context is malformed
    #[error("invalid program or context file: {0}")]
    InvalidFile(String),

    /// The binary path does not exist
    #[error("no such file: {0}")]
    NoSuchFile(String),

    /// The allocation profile could not be parsed or is unsupported
    #[error("invalid profile: {0}")]
    InvalidProfile(String),

    /// The loaded program has no symbol with this name
    #[error("unknown symbol: {0}")]
    UnknownSymbol(String),

    /// The unit has no log buffer to read
    #[error("log context missing for unit {0}")]
    LogContextMissing(u32),

    /// A caller-provided buffer has the wrong size
    #[error("invalid buffer size: expected {expected} bytes, got {actual}")]
    InvalidBufferSize { expected: usize, actual: usize },

    /// Non-blocking callbacks must be registered in asynchronous mode
    #[error("non-blocking callbacks must be asynchronous")]
    NonblockingSyncCallback,

    /// A host callback reported failure
    #[error("callback failed: {0}")]
    Callback(String),
}

impl DriverError {
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    pub fn system(msg: impl Into<String>) -> Self {
        Self::System(msg.into())
    }

    pub fn invalid_set(msg: impl Into<String>) -> Self {
        Self::InvalidSet(msg.into())
    }

    pub fn invalid_transfer(msg: impl Into<String>) -> Self {
        Self::InvalidMemoryTransfer(msg.into())
    }

    pub fn invalid_file(msg: impl fmt::Display) -> Self {
        Self::InvalidFile(msg.to_string())
    }

    pub fn callback(msg: impl fmt::Display) -> Self {
        Self::Callback(msg.to_string())
    }

    /// Numeric status used by the native driver for this condition.
    pub fn code(&self) -> u32 {
        match self {
            DriverError::Internal(_) => 1,
            DriverError::System(_) | DriverError::Callback(_) => 2,
            DriverError::Allocation(_) => 4,
            DriverError::InvalidSet(_) => 5,
            DriverError::InvalidMemoryAccess { region, .. } => match region {
                MemoryRegion::Wram => 8,
                MemoryRegion::Iram => 9,
                MemoryRegion::Mram => 10,
            },
            DriverError::InvalidSymbolAccess { .. } => 11,
            DriverError::NoProgramLoaded => 14,
            DriverError::InvalidMemoryTransfer(_) => 19,
            DriverError::UnitFault { .. } => 21,
            DriverError::InvalidFile(_) => 22,
            DriverError::NoSuchFile(_) => 23,
            DriverError::InvalidProfile(_) => 26,
            DriverError::UnknownSymbol(_) => 27,
            DriverError::LogContextMissing(_) => 29,
            DriverError::InvalidBufferSize { .. } => 34,
            DriverError::NonblockingSyncCallback => 35,
        }
    }

    /// Whether this error reports a program fault rather than a driver or
    /// host failure.
    pub fn is_fault(&self) -> bool {
        matches!(self, DriverError::UnitFault { .. })
    }
}
