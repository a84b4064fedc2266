//! Driver seam for processing-in-memory units
//!
//! This crate provides:
//! - **Driver trait**: the narrow native interface the host library talks to
//! - **Handles and flags**: set/program handles, transfer, callback and
//!   checkpoint flags
//! - **Program images**: the binary format loaded onto units
//! - **SimDriver**: an in-process reference driver
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────┐
//! │              pim-host (sets)               │
//! └─────────────────────┬─────────────────────┘
//!                       │  dyn Driver
//!                       ▼
//! ┌───────────────────────────────────────────┐
//! │  Driver: allocate / load / xfer / launch  │
//! └──────────┬─────────────────────┬──────────┘
//!            ▼                     ▼
//!      ┌───────────┐         ┌───────────┐
//!      │ SimDriver │         │  native   │
//!      │ (threads) │         │  driver   │
//!      └───────────┘         └───────────┘
//! ```

pub mod context;
pub mod driver;
pub mod error;
pub mod image;
pub mod sim;

pub use context::{ContextInfo, ContextSnapshot};
pub use driver::{
    AllocRequest, CallbackFlags, CallbackTarget, CheckpointFlags, Driver, HostBuffer, LaunchPolicy, NativeCallback,
    ProgramBinary, ProgramHandle, SetHandle, SymbolInfo, UnitStatus, XferDirection, XferFlags, XferTarget,
    ALLOCATE_ALL,
};
pub use error::{DriverError, MemoryRegion, Result};
pub use image::{FaultKind, ImageError, Instruction, ProgramBuilder, ProgramImage, Segment, SymbolEntry};
pub use sim::{check_profile, SimConfig, SimDriver, IRAM_BASE, MRAM_BASE};
