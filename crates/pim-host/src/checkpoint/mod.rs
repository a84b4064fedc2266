//! Device context checkpoints
//!
//! A [`DeviceContext`] owns the state captured from one unit: optional
//! memory images plus the thread, flag and fault state that is always
//! captured. It is moved, never copied, so its buffers are released
//! exactly once.

mod codec;

pub use codec::{CONTEXT_CHIP_VERSION, CONTEXT_MAGIC, CONTEXT_VERSION};

use pim_driver::{CheckpointFlags, ContextInfo, ContextSnapshot};

use crate::error::Result;

/// Memories captured or restored along with the internal state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CheckpointRegions {
    pub iram: bool,
    pub mram: bool,
    pub wram: bool,
}

impl CheckpointRegions {
    pub const fn all() -> Self {
        Self {
            iram: true,
            mram: true,
            wram: true,
        }
    }

    /// Internal state only.
    pub const fn none() -> Self {
        Self {
            iram: false,
            mram: false,
            wram: false,
        }
    }

    pub const fn new(iram: bool, mram: bool, wram: bool) -> Self {
        Self { iram, mram, wram }
    }

    pub(crate) fn flags(self) -> CheckpointFlags {
        let mut flags = CheckpointFlags::INTERNAL;
        if self.iram {
            flags |= CheckpointFlags::IRAM;
        }
        if self.mram {
            flags |= CheckpointFlags::MRAM;
        }
        if self.wram {
            flags |= CheckpointFlags::WRAM;
        }
        flags
    }
}

/// State of one hardware thread inside a [`DeviceContext`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThreadContext<'a> {
    pub index: usize,
    regs: &'a [u32],
    pc: u16,
    zf: bool,
    cf: bool,
}

impl<'a> ThreadContext<'a> {
    pub fn regs(&self) -> &'a [u32] {
        self.regs
    }

    pub fn pc(&self) -> u16 {
        self.pc
    }

    pub fn zf(&self) -> bool {
        self.zf
    }

    pub fn cf(&self) -> bool {
        self.cf
    }
}

/// Checkpointed state of one unit
#[derive(Debug, PartialEq, Eq)]
pub struct DeviceContext {
    snapshot: ContextSnapshot,
}

impl DeviceContext {
    pub fn from_snapshot(snapshot: ContextSnapshot) -> Self {
        Self { snapshot }
    }

    pub fn snapshot(&self) -> &ContextSnapshot {
        &self.snapshot
    }

    pub fn into_snapshot(self) -> ContextSnapshot {
        self.snapshot
    }

    pub fn info(&self) -> ContextInfo {
        self.snapshot.info
    }

    /// IRAM instructions, `None` when IRAM was not captured.
    pub fn iram(&self) -> Option<&[u64]> {
        self.snapshot.iram.as_deref()
    }

    pub fn mram(&self) -> Option<&[u8]> {
        self.snapshot.mram.as_deref()
    }

    pub fn wram(&self) -> Option<&[u32]> {
        self.snapshot.wram.as_deref()
    }

    /// Memories present in this context.
    pub fn regions(&self) -> CheckpointRegions {
        CheckpointRegions {
            iram: self.snapshot.iram.is_some(),
            mram: self.snapshot.mram.is_some(),
            wram: self.snapshot.wram.is_some(),
        }
    }

    /// Per-thread state. Entries missing from a hand-built snapshot read
    /// as zero.
    pub fn threads(&self) -> impl Iterator<Item = ThreadContext<'_>> + '_ {
        (0..self.snapshot.info.nr_threads as usize).map(move |index| ThreadContext {
            index,
            regs: self.snapshot.thread_registers(index),
            pc: self.snapshot.pcs.get(index).copied().unwrap_or_default(),
            zf: self.snapshot.zero_flags.get(index).copied().unwrap_or_default(),
            cf: self.snapshot.carry_flags.get(index).copied().unwrap_or_default(),
        })
    }

    pub fn atomic_bits(&self) -> &[bool] {
        &self.snapshot.atomic_bits
    }

    pub fn nr_running_threads(&self) -> u8 {
        self.snapshot.nr_running_threads
    }

    /// Faulting thread and breakpoint id.
    pub fn bkp_fault(&self) -> Option<(u8, u32)> {
        self.snapshot
            .bkp_fault
            .then_some((self.snapshot.bkp_fault_thread_index, self.snapshot.bkp_fault_id))
    }

    pub fn dma_fault(&self) -> Option<u8> {
        self.snapshot.dma_fault.then_some(self.snapshot.dma_fault_thread_index)
    }

    pub fn mem_fault(&self) -> Option<u8> {
        self.snapshot.mem_fault.then_some(self.snapshot.mem_fault_thread_index)
    }

    /// Bytes needed by [`DeviceContext::serialize_into`].
    pub fn serialized_size(&self) -> usize {
        codec::serialized_size(&self.snapshot)
    }

    /// Encode into `out`, which must be exactly
    /// [`DeviceContext::serialized_size`] bytes long.
    pub fn serialize_into(&self, out: &mut [u8]) -> Result<()> {
        codec::serialize_into(&self.snapshot, out)
    }

    pub fn serialize(&self) -> Result<Vec<u8>> {
        let mut out = vec![0; self.serialized_size()];
        self.serialize_into(&mut out)?;
        Ok(out)
    }

    pub fn deserialize(bytes: &[u8]) -> Result<Self> {
        codec::deserialize(bytes).map(Self::from_snapshot)
    }
}

// ============================================================================
// Tests
// ============================================================================
