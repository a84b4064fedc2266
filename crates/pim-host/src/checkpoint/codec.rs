//! Flat encoding of a context snapshot
//!
//! ```text
//! magic | chip version | format version | reserved (= magic)
//! nr_threads | nr_registers | nr_atomic_bits
//! iram instructions | mram bytes | wram words      (0 = not captured)
//! iram | mram | wram
//! registers | pcs | atomic bits | zero flags | carry flags
//! running threads | scheduling
//! bkp / dma / mem fault | bkp / dma / mem fault thread | bkp fault id
//! ```
//!
//! Words are 32-bit little-endian, program counters 16-bit, flags and
//! thread indices one byte each.

use pim_driver::{ContextInfo, ContextSnapshot, DriverError};

use crate::error::Result;

pub const CONTEXT_MAGIC: u32 = 0xfabd_dbaf;
pub const CONTEXT_CHIP_VERSION: u32 = 18;
pub const CONTEXT_VERSION: u32 = 3;

const HEADER_WORDS: usize = 10;

pub(crate) fn serialized_size(snapshot: &ContextSnapshot) -> usize {
    let info = snapshot.info;
    let threads = info.nr_threads as usize;
    HEADER_WORDS * 4
        + snapshot.iram.as_ref().map_or(0, |iram| iram.len() * 8)
        + snapshot.mram.as_ref().map_or(0, Vec::len)
        + snapshot.wram.as_ref().map_or(0, |wram| wram.len() * 4)
        + threads * info.nr_registers as usize * 4
        + threads * 2
        + info.nr_atomic_bits as usize
        + threads * 2
        + 1
        + threads
        + 6
        + 4
}

struct Writer<'a> {
    out: &'a mut [u8],
    position: usize,
}

impl Writer<'_> {
    fn put(&mut self, bytes: &[u8]) {
        self.out[self.position..self.position + bytes.len()].copy_from_slice(bytes);
        self.position += bytes.len();
    }

    fn u32(&mut self, value: u32) {
        self.put(&value.to_le_bytes());
    }

    fn u8(&mut self, value: u8) {
        self.put(&[value]);
    }

    fn flags(&mut self, flags: &[bool]) {
        for &flag in flags {
            self.u8(flag as u8);
        }
    }
}

pub(crate) fn serialize_into(snapshot: &ContextSnapshot, out: &mut [u8]) -> Result<()> {
    let expected = serialized_size(snapshot);
    if out.len() != expected {
        return Err(DriverError::InvalidBufferSize {
            expected,
            actual: out.len(),
        }
        .into());
    }

    let info = snapshot.info;
    if !snapshot.is_consistent() {
        return Err(DriverError::internal("context state does not match its descriptor").into());
    }

    let mut writer = Writer { out, position: 0 };
    writer.u32(CONTEXT_MAGIC);
    writer.u32(CONTEXT_CHIP_VERSION);
    writer.u32(CONTEXT_VERSION);
    writer.u32(CONTEXT_MAGIC);
    writer.u32(info.nr_threads);
    writer.u32(info.nr_registers);
    writer.u32(info.nr_atomic_bits);
    writer.u32(snapshot.iram.as_ref().map_or(0, Vec::len) as u32);
    writer.u32(snapshot.mram.as_ref().map_or(0, Vec::len) as u32);
    writer.u32(snapshot.wram.as_ref().map_or(0, Vec::len) as u32);

    for &instruction in snapshot.iram.iter().flatten() {
        writer.put(&instruction.to_le_bytes());
    }
    if let Some(mram) = &snapshot.mram {
        writer.put(mram);
    }
    for &word in snapshot.wram.iter().flatten() {
        writer.u32(word);
    }

    for &register in &snapshot.registers {
        writer.u32(register);
    }
    for &pc in &snapshot.pcs {
        writer.put(&pc.to_le_bytes());
    }
    writer.flags(&snapshot.atomic_bits);
    writer.flags(&snapshot.zero_flags);
    writer.flags(&snapshot.carry_flags);
    writer.u8(snapshot.nr_running_threads);
    writer.put(&snapshot.scheduling);
    writer.flags(&[snapshot.bkp_fault, snapshot.dma_fault, snapshot.mem_fault]);
    writer.u8(snapshot.bkp_fault_thread_index);
    writer.u8(snapshot.dma_fault_thread_index);
    writer.u8(snapshot.mem_fault_thread_index);
    writer.u32(snapshot.bkp_fault_id);
    Ok(())
}

struct Reader<'a> {
    bytes: &'a [u8],
}

impl<'a> Reader<'a> {
    fn take(&mut self, count: usize, width: usize) -> Result<&'a [u8]> {
        let len = count
            .checked_mul(width)
            .filter(|&len| len <= self.bytes.len())
            .ok_or_else(|| DriverError::invalid_file("truncated context"))?;
        let (head, rest) = self.bytes.split_at(len);
        self.bytes = rest;
        Ok(head)
    }

    fn u32(&mut self) -> Result<u32> {
        let bytes = self.take(1, 4)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1, 1)?[0])
    }

    fn expect(&mut self, value: u32, what: &str) -> Result<()> {
        let found = self.u32()?;
        if found != value {
            return Err(DriverError::invalid_file(format!("bad {what}: {found:#x}")).into());
        }
        Ok(())
    }

    fn words(&mut self, count: usize) -> Result<Vec<u32>> {
        Ok(self
            .take(count, 4)?
            .chunks_exact(4)
            .map(|chunk| u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
            .collect())
    }

    fn flags(&mut self, count: usize) -> Result<Vec<bool>> {
        Ok(self.take(count, 1)?.iter().map(|&byte| byte != 0).collect())
    }
}

pub(crate) fn deserialize(bytes: &[u8]) -> Result<ContextSnapshot> {
    let mut reader = Reader { bytes };
    reader.expect(CONTEXT_MAGIC, "magic")?;
    reader.expect(CONTEXT_CHIP_VERSION, "chip version")?;
    reader.expect(CONTEXT_VERSION, "context version")?;
    reader.expect(CONTEXT_MAGIC, "reserved word")?;

    let nr_threads = reader.u32()?;
    let nr_registers = reader.u32()?;
    let nr_atomic_bits = reader.u32()?;
    let iram_size = reader.u32()?;
    let mram_size = reader.u32()?;
    let wram_size = reader.u32()?;
    // Only the sizes of the regions carried by the file are known.
    let info = ContextInfo {
        nr_threads,
        nr_registers,
        nr_atomic_bits,
        iram_size,
        mram_size,
        wram_size,
    };
    let iram_instructions = iram_size as usize;
    let mram_bytes = mram_size as usize;
    let wram_words = wram_size as usize;
    let threads = info.nr_threads as usize;

    let iram = match iram_instructions {
        0 => None,
        count => Some(
            reader
                .take(count, 8)?
                .chunks_exact(8)
                .map(|chunk| {
                    let mut word = [0u8; 8];
                    word.copy_from_slice(chunk);
                    u64::from_le_bytes(word)
                })
                .collect(),
        ),
    };
    let mram = match mram_bytes {
        0 => None,
        count => Some(reader.take(count, 1)?.to_vec()),
    };
    let wram = match wram_words {
        0 => None,
        count => Some(reader.words(count)?),
    };

    let registers = threads
        .checked_mul(info.nr_registers as usize)
        .ok_or_else(|| DriverError::invalid_file("register count overflows"))?;
    let registers = reader.words(registers)?;
    let pcs = reader
        .take(threads, 2)?
        .chunks_exact(2)
        .map(|chunk| u16::from_le_bytes([chunk[0], chunk[1]]))
        .collect();
    let atomic_bits = reader.flags(info.nr_atomic_bits as usize)?;
    let zero_flags = reader.flags(threads)?;
    let carry_flags = reader.flags(threads)?;
    let nr_running_threads = reader.u8()?;
    let scheduling = reader.take(threads, 1)?.to_vec();
    let faults = reader.flags(3)?;

    Ok(ContextSnapshot {
        info,
        iram,
        mram,
        wram,
        registers,
        pcs,
        atomic_bits,
        zero_flags,
        carry_flags,
        nr_running_threads,
        scheduling,
        bkp_fault: faults[0],
        dma_fault: faults[1],
        mem_fault: faults[2],
        bkp_fault_thread_index: reader.u8()?,
        dma_fault_thread_index: reader.u8()?,
        mem_fault_thread_index: reader.u8()?,
        bkp_fault_id: reader.u32()?,
    })
}

// ============================================================================
// Tests
// ============================================================================
