//! # pim-host - Host Orchestration for Processing-in-Memory Units
//!
//! Allocate units, load programs, move data and run kernels on a
//! [`pim_driver::Driver`].
//!
//! ## Architecture
//!
//! An allocation is a three-level hierarchy: the allocated set, its ranks
//! and their units. Every level is a [`ResourceSet`] and supports the same
//! operations; a call on a rank or a unit only touches that part of the
//! allocation.
//!
//! - **Programs**: loading on any node binds the program's symbol table on
//!   the whole hierarchy
//! - **Transfers**: the native primitive (broadcast, scatter/gather or a
//!   single staged push) is chosen from the shape of the endpoints
//! - **Execution**: synchronous or asynchronous launches, with unit logs
//!   routed to per-call, per-unit or default sinks
//! - **Callbacks**: host functions scheduled after queued work, once per
//!   rank or once per set
//! - **Checkpoints**: unit contexts captured, restored and serialized in the
//!   native layout
//!
//! ## Example
//!
//! ```rust
//! use std::sync::Arc;
//! use pim_driver::{HostBuffer, ProgramBuilder, SimConfig, SimDriver};
//! use pim_host::ResourceSet;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let driver = Arc::new(SimDriver::new(SimConfig::small(1, 4))?);
//! let image = ProgramBuilder::new().symbol("counter", 0x100, 4).build();
//!
//! let set = ResourceSet::builder().units(4).binary(image.to_bytes()?).allocate(driver)?;
//!
//! // One buffer to every unit, then one buffer back from each.
//! set.copy("counter", HostBuffer::from_vec(vec![1, 2, 3, 4]))?;
//! let values = set.get("counter")?;
//! assert!(values.contents().iter().all(|bytes| bytes == &[1u8, 2, 3, 4]));
//!
//! set.release()?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Modules
//!
//! - [`set`] - Hierarchy, allocation and every set operation
//! - [`transfer`] - Endpoints and copy options
//! - [`symbol`] - Programs, symbol tables and typed symbol values
//! - [`launch`] - Execution status and log sinks
//! - [`callback`] - Callback options and registry
//! - [`checkpoint`] - Device contexts and their serialized form
//! - [`compiler`] - External compiler invocation

pub mod callback;
pub mod checkpoint;
pub mod compiler;
pub mod error;
pub mod launch;
pub mod set;
pub mod symbol;
pub mod transfer;

pub use callback::{CallOptions, CallbackId, CallbackRegistry, Completion};
pub use checkpoint::{
    CheckpointRegions, DeviceContext, ThreadContext, CONTEXT_CHIP_VERSION, CONTEXT_MAGIC, CONTEXT_VERSION,
};
pub use compiler::{CompileRequest, Compiler, LoadRequest, OptLevel, SourceFile, SourceKind};
pub use error::{Error, LogFailure, Result};
pub use launch::{ExecutionStatus, LogBuffer, LogSink, LogTarget};
pub use set::{ResourceSet, SetBuilder, SetKind};
pub use symbol::{Program, Symbol, SymbolTable, SymbolValue};
pub use transfer::{CopyOptions, Endpoint};

// Driver types that appear in this crate's signatures
pub use pim_driver::{Driver, HostBuffer, SetHandle, ALLOCATE_ALL};
