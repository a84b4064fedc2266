//! Program image format understood by the reference driver
//!
//! An image is what a compiled unit binary holds once linked: the symbol
//! table, initial data segments, the IRAM text, and the instruction stream the
//! simulator executes at launch. Images are stored as a short header followed
//! by a bincode payload.
//!
//! # Example
//!
//! ```
//! use pim_driver::{Instruction, ProgramBuilder, ProgramImage};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let image = ProgramBuilder::new()
//!     .symbol("counter", 0x100, 4)
//!     .add(0x100, 1)
//!     .build();
//!
//! let bytes = image.to_bytes()?;
//! let loaded = ProgramImage::from_bytes(&bytes)?;
//! assert_eq!(loaded, image);
//! assert!(matches!(loaded.instructions[0], Instruction::AddImm { .. }));
//! # Ok(())
//! # }
//! ```

mod builder;

pub use builder::ProgramBuilder;

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::driver::SymbolInfo;

/// First bytes of every serialized image.
pub const IMAGE_MAGIC: [u8; 4] = *b"PIMB";

/// Current image format version.
pub const IMAGE_VERSION: u16 = 1;

const HEADER_LEN: usize = IMAGE_MAGIC.len() + 2;

/// Errors raised while encoding or decoding an image
#[derive(Debug, thiserror::Error)]
pub enum ImageError {
    #[error("not a program image (bad magic)")]
    BadMagic,

    #[error("unsupported image version {0} (expected {IMAGE_VERSION})")]
    UnsupportedVersion(u16),

    #[error("failed to encode image: {0}")]
    Encode(String),

    #[error("failed to decode image: {0}")]
    Decode(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Address and size of a symbol in the image
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SymbolEntry {
    pub address: u32,
    pub size: u32,
}

impl From<SymbolEntry> for SymbolInfo {
    fn from(entry: SymbolEntry) -> Self {
        SymbolInfo {
            address: entry.address,
            size: entry.size,
        }
    }
}

/// Bytes written to unit memory when the image is loaded
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Segment {
    pub address: u32,
    pub data: Vec<u8>,
}

/// How a [`Instruction::Fault`] stops the unit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FaultKind {
    /// Breakpoint fault carrying its identifier
    Breakpoint { id: u32 },
    Dma,
    Memory,
}

/// Operations executed by thread 0 of a unit at launch
///
/// Addresses use the unit's flat address space: WRAM from 0, MRAM from
/// [`crate::MRAM_BASE`]. Words are little-endian `u32`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Instruction {
    /// Write bytes at `address`
    Store { address: u32, bytes: Vec<u8> },
    /// Write the unit's index in the pool as a word
    StoreId { address: u32 },
    /// Copy `size` bytes from `src` to `dst`
    Copy { dst: u32, src: u32, size: u32 },
    /// Add `value` to the word at `address`, updating the zero and carry flags
    AddImm { address: u32, value: u32 },
    /// Load the word at `address` into a register
    Load { register: u8, address: u32 },
    /// Append text to the unit log
    Print { text: String },
    /// Append `label = <word>` and a newline to the unit log
    PrintWord { label: String, address: u32 },
    /// Stop with a fault
    Fault(FaultKind),
    /// Stop
    Halt,
}

/// Linked program for one unit
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgramImage {
    /// Symbol table (name → location)
    pub symbols: BTreeMap<String, SymbolEntry>,
    /// Initial data written at load time
    pub segments: Vec<Segment>,
    /// IRAM contents
    pub text: Vec<u64>,
    /// Instruction stream executed at launch
    pub instructions: Vec<Instruction>,
}

impl ProgramImage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn symbol(&self, name: &str) -> Option<SymbolInfo> {
        self.symbols.get(name).copied().map(SymbolInfo::from)
    }

    /// Serialize the image with its header.
    pub fn to_bytes(&self) -> Result<Vec<u8>, ImageError> {
        let payload = bincode::serialize(self).map_err(|err| ImageError::Encode(err.to_string()))?;
        let mut bytes = Vec::with_capacity(HEADER_LEN + payload.len());
        bytes.extend_from_slice(&IMAGE_MAGIC);
        bytes.extend_from_slice(&IMAGE_VERSION.to_le_bytes());
        bytes.extend_from_slice(&payload);
        Ok(bytes)
    }

    /// Decode an image produced by [`ProgramImage::to_bytes`].
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ImageError> {
        if bytes.len() < HEADER_LEN || bytes[..IMAGE_MAGIC.len()] != IMAGE_MAGIC {
            return Err(ImageError::BadMagic);
        }
        let version = u16::from_le_bytes([bytes[4], bytes[5]]);
        if version != IMAGE_VERSION {
            return Err(ImageError::UnsupportedVersion(version));
        }
        bincode::deserialize(&bytes[HEADER_LEN..]).map_err(|err| ImageError::Decode(err.to_string()))
    }

    pub fn save_to_file(&self, path: impl AsRef<Path>) -> Result<(), ImageError> {
        std::fs::write(path, self.to_bytes()?)?;
        Ok(())
    }

    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self, ImageError> {
        Self::from_bytes(&std::fs::read(path)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_foreign_bytes() {
        assert!(matches!(ProgramImage::from_bytes(b"\x7fELF\x02\x01"), Err(ImageError::BadMagic)));
        assert!(matches!(ProgramImage::from_bytes(b"PI"), Err(ImageError::BadMagic)));
    }

    #[test]
    fn rejects_future_versions() {
        let mut bytes = ProgramImage::new().to_bytes().unwrap();
        bytes[4] = 9;
        assert!(matches!(ProgramImage::from_bytes(&bytes), Err(ImageError::UnsupportedVersion(9))));
    }

    #[test]
    fn rejects_truncated_payload() {
        let image = ProgramBuilder::new().symbol("buffer", 0, 64).print("hello").build();
        let bytes = image.to_bytes().unwrap();
        let result = ProgramImage::from_bytes(&bytes[..bytes.len() - 3]);
        assert!(matches!(result, Err(ImageError::Decode(_))));
    }

    #[test]
    fn file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("main.dpu");
        let image = ProgramBuilder::new()
            .symbol("counter", 0x100, 4)
            .data(0x100, vec![7, 0, 0, 0])
            .text(vec![0xdead_beef])
            .halt()
            .build();

        image.save_to_file(&path).unwrap();
        let loaded = ProgramImage::load_from_file(&path).unwrap();
        assert_eq!(loaded, image);
        assert_eq!(loaded.symbol("counter"), Some(SymbolInfo { address: 0x100, size: 4 }));
        assert_eq!(loaded.symbol("missing"), None);
    }
}
