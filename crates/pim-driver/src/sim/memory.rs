//! Memories of a simulated unit
//!
//! Each unit exposes one flat address space split in three windows:
//!
//! ```text
//! 0x0000_0000  WRAM  (32-bit words)
//! 0x0800_0000  MRAM  (bytes)
//! 0x8000_0000  IRAM  (64-bit instructions)
//! ```
//!
//! Byte-granular accesses into WRAM and IRAM go through a `u8` view of the
//! word vectors, so a word written as bytes reads back in host byte order.

use crate::error::{DriverError, MemoryRegion, Result};
use crate::sim::config::SimConfig;

/// First address of the MRAM window.
pub const MRAM_BASE: u32 = 0x0800_0000;

/// First address of the IRAM window.
pub const IRAM_BASE: u32 = 0x8000_0000;

/// IRAM, MRAM and WRAM of one unit
#[derive(Debug, Clone)]
pub(crate) struct UnitMemory {
    pub iram: Vec<u64>,
    pub mram: Vec<u8>,
    pub wram: Vec<u32>,
}

impl UnitMemory {
    pub fn new(config: &SimConfig) -> Self {
        Self {
            iram: vec![0; config.iram_instructions as usize],
            mram: vec![0; config.mram_size as usize],
            wram: vec![0; config.wram_words as usize],
        }
    }

    pub fn reset(&mut self) {
        self.iram.fill(0);
        self.mram.fill(0);
        self.wram.fill(0);
    }

    /// Region and region-relative byte offset of `address`, checking that
    /// `len` bytes fit.
    fn locate(&self, address: u32, len: usize) -> Result<(MemoryRegion, usize)> {
        let (region, offset, limit) = if address >= IRAM_BASE {
            (MemoryRegion::Iram, address - IRAM_BASE, self.iram.len() * 8)
        } else if address >= MRAM_BASE {
            (MemoryRegion::Mram, address - MRAM_BASE, self.mram.len())
        } else {
            (MemoryRegion::Wram, address, self.wram.len() * 4)
        };

        let offset = offset as usize;
        if offset.checked_add(len).is_none_or(|end| end > limit) {
            return Err(DriverError::InvalidMemoryAccess {
                region,
                address,
                size: len,
                limit,
            });
        }
        Ok((region, offset))
    }

    fn bytes(&self, region: MemoryRegion) -> &[u8] {
        match region {
            MemoryRegion::Iram => bytemuck::cast_slice(&self.iram),
            MemoryRegion::Mram => &self.mram,
            MemoryRegion::Wram => bytemuck::cast_slice(&self.wram),
        }
    }

    fn bytes_mut(&mut self, region: MemoryRegion) -> &mut [u8] {
        match region {
            MemoryRegion::Iram => bytemuck::cast_slice_mut(&mut self.iram),
            MemoryRegion::Mram => &mut self.mram,
            MemoryRegion::Wram => bytemuck::cast_slice_mut(&mut self.wram),
        }
    }

    pub fn write(&mut self, address: u32, data: &[u8]) -> Result<()> {
        let (region, offset) = self.locate(address, data.len())?;
        self.bytes_mut(region)[offset..offset + data.len()].copy_from_slice(data);
        Ok(())
    }

    pub fn read(&self, address: u32, out: &mut [u8]) -> Result<()> {
        let (region, offset) = self.locate(address, out.len())?;
        out.copy_from_slice(&self.bytes(region)[offset..offset + out.len()]);
        Ok(())
    }

    pub fn read_word(&self, address: u32) -> Result<u32> {
        let mut word = [0u8; 4];
        self.read(address, &mut word)?;
        Ok(u32::from_le_bytes(word))
    }

    pub fn write_word(&mut self, address: u32, value: u32) -> Result<()> {
        self.write(address, &value.to_le_bytes())
    }

    /// Copy within the unit; source and destination may overlap.
    pub fn copy_within(&mut self, dst: u32, src: u32, size: usize) -> Result<()> {
        let mut scratch = vec![0u8; size];
        self.read(src, &mut scratch)?;
        self.write(dst, &scratch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn memory() -> UnitMemory {
        UnitMemory::new(&SimConfig::small(1, 1))
    }

    #[test]
    fn windows_are_independent() {
        let mut mem = memory();
        mem.write(0x10, &[1, 2, 3, 4]).unwrap();
        mem.write(MRAM_BASE + 0x10, &[5, 6, 7, 8]).unwrap();
        mem.write(IRAM_BASE + 0x10, &[9, 9]).unwrap();

        let mut out = [0u8; 4];
        mem.read(0x10, &mut out).unwrap();
        assert_eq!(out, [1, 2, 3, 4]);
        mem.read(MRAM_BASE + 0x10, &mut out).unwrap();
        assert_eq!(out, [5, 6, 7, 8]);
        let mut text = [0u8; 2];
        mem.read(IRAM_BASE + 0x10, &mut text).unwrap();
        assert_eq!(text, [9, 9]);
        assert_ne!(mem.iram[2], 0);
    }

    #[test]
    fn rejects_out_of_range_access() {
        let mut mem = memory();
        let wram_bytes = mem.wram.len() * 4;
        let err = mem.write(wram_bytes as u32 - 2, &[0; 4]).unwrap_err();
        assert!(matches!(
            err,
            DriverError::InvalidMemoryAccess {
                region: MemoryRegion::Wram,
                ..
            }
        ));

        let mut out = vec![0u8; 8];
        let mram_end = MRAM_BASE + mem.mram.len() as u32;
        assert!(mem.read(mram_end - 4, &mut out).is_err());
        assert!(mem.read(mram_end - 8, &mut out).is_ok());
    }

    #[test]
    fn words_are_little_endian() {
        let mut mem = memory();
        mem.write_word(MRAM_BASE, 0x0403_0201).unwrap();
        let mut out = [0u8; 4];
        mem.read(MRAM_BASE, &mut out).unwrap();
        assert_eq!(out, [1, 2, 3, 4]);
        assert_eq!(mem.read_word(MRAM_BASE).unwrap(), 0x0403_0201);
    }

    #[test]
    fn copy_within_handles_overlap() {
        let mut mem = memory();
        mem.write(0, &[1, 2, 3, 4, 5, 6]).unwrap();
        mem.copy_within(2, 0, 4).unwrap();
        let mut out = [0u8; 6];
        mem.read(0, &mut out).unwrap();
        assert_eq!(out, [1, 2, 1, 2, 3, 4]);
    }
}
