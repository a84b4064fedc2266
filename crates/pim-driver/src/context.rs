//! Architectural state captured by a checkpoint.

/// Geometry of a unit: thread state and memory sizes.
///
/// Memory sizes describe the unit, whether or not the region was captured.
/// A decoded context only knows the sizes of the regions it carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ContextInfo {
    pub nr_threads: u32,
    pub nr_registers: u32,
    pub nr_atomic_bits: u32,
    /// IRAM size in instructions
    pub iram_size: u32,
    /// MRAM size in bytes
    pub mram_size: u32,
    /// WRAM size in 32-bit words
    pub wram_size: u32,
}

impl ContextInfo {
    /// Same threads, registers and atomic bits, memory sizes aside.
    pub fn same_threads(&self, other: &ContextInfo) -> bool {
        (self.nr_threads, self.nr_registers, self.nr_atomic_bits)
            == (other.nr_threads, other.nr_registers, other.nr_atomic_bits)
    }
}

/// Snapshot of one unit.
///
/// Memory regions not requested at capture time are `None`. Register,
/// program counter and flag vectors are always sized from `info`; they are
/// zero when the internal state was not captured.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextSnapshot {
    pub info: ContextInfo,
    pub iram: Option<Vec<u64>>,
    pub mram: Option<Vec<u8>>,
    pub wram: Option<Vec<u32>>,
    /// Thread-major: registers of thread `t` are
    /// `registers[t * nr_registers..(t + 1) * nr_registers]`.
    pub registers: Vec<u32>,
    pub pcs: Vec<u16>,
    pub atomic_bits: Vec<bool>,
    pub zero_flags: Vec<bool>,
    pub carry_flags: Vec<bool>,
    pub nr_running_threads: u8,
    pub scheduling: Vec<u8>,
    pub bkp_fault: bool,
    pub dma_fault: bool,
    pub mem_fault: bool,
    pub bkp_fault_thread_index: u8,
    pub dma_fault_thread_index: u8,
    pub mem_fault_thread_index: u8,
    pub bkp_fault_id: u32,
}

impl ContextSnapshot {
    /// Zeroed snapshot with no memory regions.
    pub fn empty(info: ContextInfo) -> Self {
        let threads = info.nr_threads as usize;
        Self {
            info,
            iram: None,
            mram: None,
            wram: None,
            registers: vec![0; threads * info.nr_registers as usize],
            pcs: vec![0; threads],
            atomic_bits: vec![false; info.nr_atomic_bits as usize],
            zero_flags: vec![false; threads],
            carry_flags: vec![false; threads],
            nr_running_threads: 0,
            scheduling: vec![0xff; threads],
            bkp_fault: false,
            dma_fault: false,
            mem_fault: false,
            bkp_fault_thread_index: 0,
            dma_fault_thread_index: 0,
            mem_fault_thread_index: 0,
            bkp_fault_id: 0,
        }
    }

    /// Whether every per-thread vector has the length `info` implies.
    pub fn is_consistent(&self) -> bool {
        let threads = self.info.nr_threads as usize;
        self.registers.len() == threads * self.info.nr_registers as usize
            && self.pcs.len() == threads
            && self.zero_flags.len() == threads
            && self.carry_flags.len() == threads
            && self.scheduling.len() == threads
            && self.atomic_bits.len() == self.info.nr_atomic_bits as usize
    }

    /// Registers of `thread`, empty when out of range.
    pub fn thread_registers(&self, thread: usize) -> &[u32] {
        let width = self.info.nr_registers as usize;
        self.registers.get(thread * width..(thread + 1) * width).unwrap_or(&[])
    }

    pub fn iram_instructions(&self) -> u32 {
        self.iram.as_ref().map_or(0, |iram| iram.len() as u32)
    }

    pub fn mram_size(&self) -> u32 {
        self.mram.as_ref().map_or(0, |mram| mram.len() as u32)
    }

    pub fn wram_words(&self) -> u32 {
        self.wram.as_ref().map_or(0, |wram| wram.len() as u32)
    }
}
