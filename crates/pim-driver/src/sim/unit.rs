//! One simulated processing unit: memories, thread state and the
//! interpreter for [`Instruction`]s

use std::sync::Arc;

use crate::context::{ContextInfo, ContextSnapshot};
use crate::driver::{CheckpointFlags, SymbolInfo, XferTarget};
use crate::error::{DriverError, MemoryRegion, Result};
use crate::image::{FaultKind, Instruction, ProgramImage};
use crate::sim::config::SimConfig;
use crate::sim::memory::{UnitMemory, IRAM_BASE, MRAM_BASE};

/// Fault flags with the index of the offending thread.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct FaultState {
    pub breakpoint: Option<(u8, u32)>,
    pub dma: Option<u8>,
    pub memory: Option<u8>,
}

impl FaultState {
    pub fn any(&self) -> bool {
        self.breakpoint.is_some() || self.dma.is_some() || self.memory.is_some()
    }
}

/// Thread state shared by every hardware thread of a unit.
#[derive(Debug, Clone)]
struct Threads {
    registers: Vec<u32>,
    pcs: Vec<u16>,
    zero_flags: Vec<bool>,
    carry_flags: Vec<bool>,
    scheduling: Vec<u8>,
    nr_running: u8,
}

impl Threads {
    fn new(info: ContextInfo) -> Self {
        let snapshot = ContextSnapshot::empty(info);
        Self {
            registers: snapshot.registers,
            pcs: snapshot.pcs,
            zero_flags: snapshot.zero_flags,
            carry_flags: snapshot.carry_flags,
            scheduling: snapshot.scheduling,
            nr_running: 0,
        }
    }
}

enum Step {
    Next,
    Stop,
}

pub(crate) struct SimUnit {
    /// Position in the whole pool
    pub index: u32,
    info: ContextInfo,
    memory: UnitMemory,
    threads: Threads,
    atomic_bits: Vec<bool>,
    program: Option<Arc<ProgramImage>>,
    log: Option<Vec<u8>>,
    faults: FaultState,
}

impl SimUnit {
    pub fn new(index: u32, config: &SimConfig) -> Self {
        let info = ContextInfo {
            nr_threads: config.nr_threads,
            nr_registers: config.nr_registers,
            nr_atomic_bits: config.nr_atomic_bits,
            iram_size: config.iram_instructions,
            mram_size: config.mram_size,
            wram_size: config.wram_words,
        };
        Self {
            index,
            info,
            memory: UnitMemory::new(config),
            threads: Threads::new(info),
            atomic_bits: vec![false; config.nr_atomic_bits as usize],
            program: None,
            log: None,
            faults: FaultState::default(),
        }
    }

    /// Back to the power-on state.
    pub fn reset(&mut self) {
        self.memory.reset();
        self.threads = Threads::new(self.info);
        self.atomic_bits.fill(false);
        self.program = None;
        self.log = None;
        self.faults = FaultState::default();
    }

    pub fn faulted(&self) -> bool {
        self.faults.any()
    }

    pub fn memory_mut(&mut self) -> &mut UnitMemory {
        &mut self.memory
    }

    pub fn memory(&self) -> &UnitMemory {
        &self.memory
    }

    pub fn log(&self) -> Option<&[u8]> {
        self.log.as_deref()
    }

    // ============================================================================================
    // Programs
    // ============================================================================================

    pub fn load(&mut self, image: Arc<ProgramImage>) -> Result<()> {
        if image.text.len() > self.memory.iram.len() {
            return Err(DriverError::InvalidMemoryAccess {
                region: MemoryRegion::Iram,
                address: IRAM_BASE,
                size: image.text.len() * 8,
                limit: self.memory.iram.len() * 8,
            });
        }

        self.reset();
        self.memory.iram[..image.text.len()].copy_from_slice(&image.text);
        for segment in &image.segments {
            self.memory.write(segment.address, &segment.data)?;
        }
        self.program = Some(image);
        Ok(())
    }

    /// Address of `size` bytes at `offset` inside `target`.
    pub fn resolve(&self, target: &XferTarget, offset: usize, size: usize) -> Result<u32> {
        let (name, info) = match target {
            XferTarget::Name(name) => {
                let program = self.program.as_ref().ok_or(DriverError::NoProgramLoaded)?;
                let info = program
                    .symbol(name)
                    .ok_or_else(|| DriverError::UnknownSymbol(name.clone()))?;
                (name.as_str(), info)
            }
            XferTarget::Symbol(info) => ("<resolved>", *info),
            XferTarget::Mram => (
                "<mram>",
                SymbolInfo {
                    address: MRAM_BASE,
                    size: self.memory.mram.len() as u32,
                },
            ),
        };

        if offset.checked_add(size).is_none_or(|end| end > info.size as usize) {
            return Err(DriverError::InvalidSymbolAccess {
                symbol: name.to_string(),
                offset,
                size,
                symbol_size: info.size as usize,
            });
        }
        Ok(info.address + offset as u32)
    }

    // ============================================================================================
    // Execution
    // ============================================================================================

    /// Run the loaded program on thread 0 until it halts or faults.
    ///
    /// Faults are recorded on the unit, not returned.
    pub fn run(&mut self) -> Result<()> {
        let program = self.program.clone().ok_or(DriverError::NoProgramLoaded)?;

        self.log = Some(Vec::new());
        self.faults = FaultState::default();
        self.threads.pcs.fill(0);
        self.threads.nr_running = 1;
        self.threads.scheduling[0] = 0;

        for instruction in &program.instructions {
            match self.step(instruction) {
                Ok(Step::Next) => self.threads.pcs[0] = self.threads.pcs[0].wrapping_add(1),
                Ok(Step::Stop) => break,
                Err(DriverError::InvalidMemoryAccess { .. }) | Err(DriverError::InvalidSymbolAccess { .. }) => {
                    self.faults.memory = Some(0);
                    break;
                }
                Err(err) => return Err(err),
            }
        }

        self.threads.nr_running = 0;
        self.threads.scheduling[0] = 0xff;
        Ok(())
    }

    fn step(&mut self, instruction: &Instruction) -> Result<Step> {
        match instruction {
            Instruction::Store { address, bytes } => self.memory.write(*address, bytes)?,
            Instruction::StoreId { address } => self.memory.write_word(*address, self.index)?,
            Instruction::Copy { dst, src, size } => self.memory.copy_within(*dst, *src, *size as usize)?,
            Instruction::AddImm { address, value } => {
                let (sum, carry) = self.memory.read_word(*address)?.overflowing_add(*value);
                self.memory.write_word(*address, sum)?;
                self.threads.zero_flags[0] = sum == 0;
                self.threads.carry_flags[0] = carry;
            }
            Instruction::Load { register, address } => {
                let value = self.memory.read_word(*address)?;
                let slot = self
                    .threads
                    .registers
                    .get_mut(*register as usize)
                    .ok_or_else(|| DriverError::internal(format!("register r{register} does not exist")))?;
                *slot = value;
            }
            Instruction::Print { text } => self.append_log(text.as_bytes()),
            Instruction::PrintWord { label, address } => {
                let value = self.memory.read_word(*address)?;
                self.append_log(format!("{label} = {value}\n").as_bytes());
            }
            Instruction::Fault(kind) => {
                match kind {
                    FaultKind::Breakpoint { id } => self.faults.breakpoint = Some((0, *id)),
                    FaultKind::Dma => self.faults.dma = Some(0),
                    FaultKind::Memory => self.faults.memory = Some(0),
                }
                return Ok(Step::Stop);
            }
            Instruction::Halt => return Ok(Step::Stop),
        }
        Ok(Step::Next)
    }

    fn append_log(&mut self, bytes: &[u8]) {
        self.log.get_or_insert_with(Vec::new).extend_from_slice(bytes);
    }

    // ============================================================================================
    // Checkpoints
    // ============================================================================================

    pub fn save(&self, flags: CheckpointFlags) -> ContextSnapshot {
        let mut snapshot = ContextSnapshot::empty(self.info);

        if flags.contains(CheckpointFlags::INTERNAL) {
            snapshot.registers = self.threads.registers.clone();
            snapshot.pcs = self.threads.pcs.clone();
            snapshot.zero_flags = self.threads.zero_flags.clone();
            snapshot.carry_flags = self.threads.carry_flags.clone();
            snapshot.scheduling = self.threads.scheduling.clone();
            snapshot.nr_running_threads = self.threads.nr_running;
            snapshot.atomic_bits = self.atomic_bits.clone();

            if let Some((thread, id)) = self.faults.breakpoint {
                snapshot.bkp_fault = true;
                snapshot.bkp_fault_thread_index = thread;
                snapshot.bkp_fault_id = id;
            }
            if let Some(thread) = self.faults.dma {
                snapshot.dma_fault = true;
                snapshot.dma_fault_thread_index = thread;
            }
            if let Some(thread) = self.faults.memory {
                snapshot.mem_fault = true;
                snapshot.mem_fault_thread_index = thread;
            }
        }

        if flags.contains(CheckpointFlags::IRAM) {
            snapshot.iram = Some(self.memory.iram.clone());
        }
        if flags.contains(CheckpointFlags::MRAM) {
            snapshot.mram = Some(self.memory.mram.clone());
        }
        if flags.contains(CheckpointFlags::WRAM) {
            snapshot.wram = Some(self.memory.wram.clone());
        }
        snapshot
    }

    /// Restore the selected state. Nothing is modified when the snapshot
    /// does not match the unit.
    pub fn restore(&mut self, flags: CheckpointFlags, snapshot: &ContextSnapshot) -> Result<()> {
        if !snapshot.info.same_threads(&self.info) {
            return Err(DriverError::invalid_transfer(format!(
                "context geometry {:?} does not match unit geometry {:?}",
                snapshot.info, self.info
            )));
        }
        if !snapshot.is_consistent() {
            return Err(DriverError::invalid_transfer("context state does not match its descriptor"));
        }
        if flags.contains(CheckpointFlags::IRAM) {
            check_region("IRAM", snapshot.iram.as_deref(), self.memory.iram.len())?;
        }
        if flags.contains(CheckpointFlags::MRAM) {
            check_region("MRAM", snapshot.mram.as_deref(), self.memory.mram.len())?;
        }
        if flags.contains(CheckpointFlags::WRAM) {
            check_region("WRAM", snapshot.wram.as_deref(), self.memory.wram.len())?;
        }

        if flags.contains(CheckpointFlags::INTERNAL) {
            self.threads.registers.copy_from_slice(&snapshot.registers);
            self.threads.pcs.copy_from_slice(&snapshot.pcs);
            self.threads.zero_flags.copy_from_slice(&snapshot.zero_flags);
            self.threads.carry_flags.copy_from_slice(&snapshot.carry_flags);
            self.threads.scheduling.copy_from_slice(&snapshot.scheduling);
            self.threads.nr_running = snapshot.nr_running_threads;
            self.atomic_bits.copy_from_slice(&snapshot.atomic_bits);
            self.faults = FaultState {
                breakpoint: snapshot
                    .bkp_fault
                    .then_some((snapshot.bkp_fault_thread_index, snapshot.bkp_fault_id)),
                dma: snapshot.dma_fault.then_some(snapshot.dma_fault_thread_index),
                memory: snapshot.mem_fault.then_some(snapshot.mem_fault_thread_index),
            };
        }

        if let (true, Some(iram)) = (flags.contains(CheckpointFlags::IRAM), &snapshot.iram) {
            self.memory.iram.copy_from_slice(iram);
        }
        if let (true, Some(mram)) = (flags.contains(CheckpointFlags::MRAM), &snapshot.mram) {
            self.memory.mram.copy_from_slice(mram);
        }
        if let (true, Some(wram)) = (flags.contains(CheckpointFlags::WRAM), &snapshot.wram) {
            self.memory.wram.copy_from_slice(wram);
        }
        Ok(())
    }
}

fn check_region<T>(name: &str, data: Option<&[T]>, expected: usize) -> Result<()> {
    match data {
        None => Err(DriverError::invalid_transfer(format!("{name} was not captured by this context"))),
        Some(data) if data.len() != expected => Err(DriverError::InvalidBufferSize {
            expected,
            actual: data.len(),
        }),
        Some(_) => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::ProgramBuilder;

    fn unit() -> SimUnit {
        SimUnit::new(7, &SimConfig::small(1, 1))
    }

    fn load(unit: &mut SimUnit, builder: ProgramBuilder) {
        unit.load(Arc::new(builder.build())).unwrap();
    }

    #[test]
    fn run_without_program_fails() {
        assert!(matches!(unit().run(), Err(DriverError::NoProgramLoaded)));
    }

    #[test]
    fn load_writes_segments_and_text() {
        let mut unit = unit();
        load(
            &mut unit,
            ProgramBuilder::new().data(MRAM_BASE + 4, vec![1, 2]).text(vec![0xabcd]),
        );
        let mut out = [0u8; 2];
        unit.memory().read(MRAM_BASE + 4, &mut out).unwrap();
        assert_eq!(out, [1, 2]);
        assert_eq!(unit.memory().iram[0], 0xabcd);
    }

    #[test]
    fn add_sets_carry_and_zero_flags() {
        let mut unit = unit();
        load(
            &mut unit,
            ProgramBuilder::new()
                .store(0x20, u32::MAX.to_le_bytes().to_vec())
                .add(0x20, 1)
                .load(2, 0x20),
        );
        unit.run().unwrap();
        let snapshot = unit.save(CheckpointFlags::INTERNAL);
        assert!(snapshot.zero_flags[0]);
        assert!(snapshot.carry_flags[0]);
        assert_eq!(snapshot.thread_registers(0)[2], 0);
        assert_eq!(snapshot.pcs[0], 3);
    }

    #[test]
    fn store_id_writes_pool_index() {
        let mut unit = unit();
        load(&mut unit, ProgramBuilder::new().store_id(0));
        unit.run().unwrap();
        assert_eq!(unit.memory().read_word(0).unwrap(), 7);
    }

    #[test]
    fn out_of_range_access_is_a_memory_fault() {
        let mut unit = unit();
        load(&mut unit, ProgramBuilder::new().add(MRAM_BASE - 4, 1).print("unreachable"));
        unit.run().unwrap();
        assert!(unit.faulted());
        assert_eq!(unit.log(), Some(&b""[..]));
        assert!(unit.save(CheckpointFlags::INTERNAL).mem_fault);
    }

    #[test]
    fn breakpoint_fault_records_id() {
        let mut unit = unit();
        load(&mut unit, ProgramBuilder::new().fault(FaultKind::Breakpoint { id: 42 }));
        unit.run().unwrap();
        let snapshot = unit.save(CheckpointFlags::ALL);
        assert!(snapshot.bkp_fault);
        assert_eq!(snapshot.bkp_fault_id, 42);
        assert!(!snapshot.dma_fault);
    }

    #[test]
    fn resolve_checks_symbol_bounds() {
        let mut unit = unit();
        load(&mut unit, ProgramBuilder::new().symbol("counter", 0x100, 4));
        let target = XferTarget::Name("counter".into());
        assert_eq!(unit.resolve(&target, 2, 2).unwrap(), 0x102);
        assert!(matches!(
            unit.resolve(&target, 2, 4),
            Err(DriverError::InvalidSymbolAccess { .. })
        ));
        assert!(matches!(
            unit.resolve(&XferTarget::Name("nope".into()), 0, 1),
            Err(DriverError::UnknownSymbol(_))
        ));
        assert_eq!(unit.resolve(&XferTarget::Mram, 16, 4).unwrap(), MRAM_BASE + 16);
    }

    #[test]
    fn restore_rejects_missing_region_without_side_effects() {
        let mut unit = unit();
        load(&mut unit, ProgramBuilder::new().store(0, vec![9]));
        unit.run().unwrap();
        let snapshot = unit.save(CheckpointFlags::INTERNAL);

        let err = unit.restore(CheckpointFlags::ALL, &snapshot).unwrap_err();
        assert!(matches!(err, DriverError::InvalidMemoryTransfer(_)));
        assert_eq!(unit.memory().read_word(0).unwrap(), 9);
    }

    #[test]
    fn restore_brings_memory_back() {
        let mut unit = unit();
        load(&mut unit, ProgramBuilder::new().store(MRAM_BASE, vec![1, 2, 3, 4]));
        unit.run().unwrap();
        let snapshot = unit.save(CheckpointFlags::ALL);

        unit.memory_mut().write(MRAM_BASE, &[0; 4]).unwrap();
        unit.restore(CheckpointFlags::ALL, &snapshot).unwrap();
        assert_eq!(unit.memory().read_word(MRAM_BASE).unwrap(), 0x0403_0201);
    }

    #[test]
    fn save_reports_memory_sizes_of_uncaptured_regions() {
        let config = SimConfig::small(1, 1);
        let snapshot = unit().save(CheckpointFlags::INTERNAL | CheckpointFlags::WRAM);
        assert!(snapshot.mram.is_none());
        assert_eq!(snapshot.info.mram_size, config.mram_size);
        assert_eq!(snapshot.info.iram_size, config.iram_instructions);
        assert_eq!(snapshot.info.wram_size, config.wram_words);
    }

    #[test]
    fn restore_rejects_short_thread_state() {
        let mut unit = unit();
        let mut snapshot = unit.save(CheckpointFlags::INTERNAL);
        snapshot.carry_flags.clear();

        let err = unit.restore(CheckpointFlags::INTERNAL, &snapshot).unwrap_err();
        assert!(matches!(err, DriverError::InvalidMemoryTransfer(_)));
    }
}
