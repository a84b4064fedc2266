//! Fluent construction of program images

use super::{FaultKind, Instruction, ProgramImage, Segment, SymbolEntry};

/// Builds a [`ProgramImage`] one symbol or instruction at a time.
///
/// ```
/// use pim_driver::{ProgramBuilder, MRAM_BASE};
///
/// let image = ProgramBuilder::new()
///     .symbol("input", MRAM_BASE, 64)
///     .symbol("sum", 0x40, 4)
///     .add(0x40, 1)
///     .print_word("sum", 0x40)
///     .build();
/// assert_eq!(image.symbols.len(), 2);
/// assert_eq!(image.instructions.len(), 2);
/// ```
#[derive(Debug, Default)]
pub struct ProgramBuilder {
    image: ProgramImage,
}

impl ProgramBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a symbol. A second declaration of the same name replaces the first.
    pub fn symbol(mut self, name: impl Into<String>, address: u32, size: u32) -> Self {
        self.image.symbols.insert(name.into(), SymbolEntry { address, size });
        self
    }

    /// Initial bytes written at `address` on load.
    pub fn data(mut self, address: u32, data: Vec<u8>) -> Self {
        self.image.segments.push(Segment { address, data });
        self
    }

    /// IRAM contents.
    pub fn text(mut self, words: Vec<u64>) -> Self {
        self.image.text = words;
        self
    }

    pub fn instruction(mut self, instruction: Instruction) -> Self {
        self.image.instructions.push(instruction);
        self
    }

    pub fn store(self, address: u32, bytes: Vec<u8>) -> Self {
        self.instruction(Instruction::Store { address, bytes })
    }

    pub fn store_id(self, address: u32) -> Self {
        self.instruction(Instruction::StoreId { address })
    }

    pub fn copy(self, dst: u32, src: u32, size: u32) -> Self {
        self.instruction(Instruction::Copy { dst, src, size })
    }

    pub fn add(self, address: u32, value: u32) -> Self {
        self.instruction(Instruction::AddImm { address, value })
    }

    pub fn load(self, register: u8, address: u32) -> Self {
        self.instruction(Instruction::Load { register, address })
    }

    pub fn print(self, text: impl Into<String>) -> Self {
        self.instruction(Instruction::Print { text: text.into() })
    }

    pub fn print_word(self, label: impl Into<String>, address: u32) -> Self {
        self.instruction(Instruction::PrintWord {
            label: label.into(),
            address,
        })
    }

    pub fn fault(self, kind: FaultKind) -> Self {
        self.instruction(Instruction::Fault(kind))
    }

    pub fn halt(self) -> Self {
        self.instruction(Instruction::Halt)
    }

    pub fn build(self) -> ProgramImage {
        self.image
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn later_symbol_declaration_wins() {
        let image = ProgramBuilder::new().symbol("x", 0, 4).symbol("x", 8, 8).build();
        assert_eq!(image.symbols["x"], SymbolEntry { address: 8, size: 8 });
    }

    #[test]
    fn instructions_keep_order() {
        let image = ProgramBuilder::new()
            .store_id(0)
            .copy(4, 0, 4)
            .fault(FaultKind::Breakpoint { id: 2 })
            .build();
        assert_eq!(
            image.instructions,
            vec![
                Instruction::StoreId { address: 0 },
                Instruction::Copy { dst: 4, src: 0, size: 4 },
                Instruction::Fault(FaultKind::Breakpoint { id: 2 }),
            ]
        );
    }
}
