//! Program symbols, symbol tables and typed symbol values

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use bytemuck::Pod;
use parking_lot::Mutex;
use pim_driver::{Driver, DriverError, ProgramHandle, SymbolInfo};

use crate::error::{Error, Result};

/// A named location in unit memory
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Symbol {
    pub name: String,
    pub address: u32,
    /// Size in bytes
    pub size: u32,
}

impl Symbol {
    pub fn new(name: impl Into<String>, address: u32, size: u32) -> Self {
        Self {
            name: name.into(),
            address,
            size,
        }
    }

    pub fn info(&self) -> SymbolInfo {
        SymbolInfo {
            address: self.address,
            size: self.size,
        }
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{:#x}[{}]", self.name, self.address, self.size)
    }
}

/// Every symbol of one program, by name
///
/// Tables are immutable once built; a load replaces the table of every set
/// in the hierarchy with a new one.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SymbolTable {
    symbols: BTreeMap<String, Symbol>,
}

impl SymbolTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&Symbol> {
        self.symbols.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.symbols.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.symbols.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Symbol> {
        self.symbols.values()
    }
}

impl FromIterator<Symbol> for SymbolTable {
    fn from_iter<I: IntoIterator<Item = Symbol>>(iter: I) -> Self {
        Self {
            symbols: iter.into_iter().map(|symbol| (symbol.name.clone(), symbol)).collect(),
        }
    }
}

/// A program loaded on a set
///
/// Symbol lookups go to the driver at most once per name; misses are
/// cached too.
pub struct Program {
    handle: ProgramHandle,
    driver: Arc<dyn Driver>,
    cache: Mutex<HashMap<String, Option<Symbol>>>,
}

impl Program {
    pub(crate) fn new(handle: ProgramHandle, driver: Arc<dyn Driver>) -> Self {
        Self {
            handle,
            driver,
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn handle(&self) -> ProgramHandle {
        self.handle
    }

    pub fn resolve(&self, name: &str) -> Result<Symbol> {
        if let Some(cached) = self.cache.lock().get(name) {
            return cached.clone().ok_or_else(|| Error::UnknownSymbol(name.to_string()));
        }

        let resolved = match self.driver.symbol(self.handle, name) {
            Ok(info) => Some(Symbol::new(name, info.address, info.size)),
            Err(DriverError::UnknownSymbol(_)) => None,
            Err(err) => return Err(err.into()),
        };
        self.cache.lock().insert(name.to_string(), resolved.clone());
        resolved.ok_or_else(|| Error::UnknownSymbol(name.to_string()))
    }

    /// Table of every symbol the program defines.
    pub fn resolve_all(&self) -> Result<SymbolTable> {
        self.driver
            .symbol_names(self.handle)?
            .iter()
            .map(|name| self.resolve(name))
            .collect()
    }
}

impl fmt::Debug for Program {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Program")
            .field("handle", &self.handle)
            .field("cached", &self.cache.lock().len())
            .finish()
    }
}

/// Contents of a symbol read from every unit of a set
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SymbolValue {
    contents: Vec<Vec<u8>>,
}

impl SymbolValue {
    pub fn new(contents: Vec<Vec<u8>>) -> Self {
        Self { contents }
    }

    /// Raw bytes, one vector per unit in set order.
    pub fn contents(&self) -> &[Vec<u8>] {
        &self.contents
    }

    pub fn into_inner(self) -> Vec<Vec<u8>> {
        self.contents
    }

    pub fn unit(&self, index: usize) -> Option<&[u8]> {
        self.contents.get(index).map(Vec::as_slice)
    }

    pub fn len(&self) -> usize {
        self.contents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contents.is_empty()
    }

    /// Reinterpret each unit's bytes as a sequence of `T`. Trailing bytes
    /// that do not fill a whole `T` are ignored.
    pub fn cast<T: Pod>(&self) -> Vec<Vec<T>> {
        let width = std::mem::size_of::<T>();
        if width == 0 {
            return vec![Vec::new(); self.contents.len()];
        }
        self.contents
            .iter()
            .map(|bytes| bytes.chunks_exact(width).map(bytemuck::pod_read_unaligned).collect())
            .collect()
    }
}

// ============================================================================
// Tests
// ============================================================================
