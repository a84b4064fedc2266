//! Transfer protocol: picking the native primitive from the argument shape
//!
//! A copy names two endpoints. Exactly one of them lives in unit memory (a
//! symbol or the raw MRAM); the other is host memory, either one buffer or
//! one buffer per unit. Planning is pure and happens before any native
//! call, so every configuration error is raised with the device untouched.
//!
//! | host side          | direction   | device side    | primitive         |
//! |--------------------|-------------|----------------|-------------------|
//! | one buffer         | to device   | symbol         | broadcast         |
//! | one buffer         | to device   | raw MRAM       | prepare + push    |
//! | one buffer         | from device | any            | prepare + push    |
//! | list (one/unit)    | either      | any            | scatter / gather  |

use std::time::Instant;

use pim_driver::{Driver, HostBuffer, SetHandle, XferDirection, XferFlags, XferTarget};

use crate::error::{Error, Result};
use crate::symbol::{Symbol, SymbolTable};

/// One side of a copy
#[derive(Debug, Clone)]
pub enum Endpoint {
    /// Symbol of the loaded program, by name
    Name(String),
    /// Symbol already resolved by the caller
    Symbol(Symbol),
    /// Whole MRAM of each unit, addressed by offset
    Mram,
    /// One host buffer shared by every unit
    Buffer(HostBuffer),
    /// One host buffer per unit, in set order; `None` skips the unit
    Buffers(Vec<Option<HostBuffer>>),
}

impl Endpoint {
    pub fn is_device(&self) -> bool {
        matches!(self, Endpoint::Name(_) | Endpoint::Symbol(_) | Endpoint::Mram)
    }
}

impl From<&str> for Endpoint {
    fn from(name: &str) -> Self {
        Endpoint::Name(name.to_string())
    }
}

impl From<String> for Endpoint {
    fn from(name: String) -> Self {
        Endpoint::Name(name)
    }
}

impl From<Symbol> for Endpoint {
    fn from(symbol: Symbol) -> Self {
        Endpoint::Symbol(symbol)
    }
}

impl From<HostBuffer> for Endpoint {
    fn from(buffer: HostBuffer) -> Self {
        Endpoint::Buffer(buffer)
    }
}

impl From<&HostBuffer> for Endpoint {
    fn from(buffer: &HostBuffer) -> Self {
        Endpoint::Buffer(buffer.clone())
    }
}

impl From<Vec<HostBuffer>> for Endpoint {
    fn from(buffers: Vec<HostBuffer>) -> Self {
        Endpoint::Buffers(buffers.into_iter().map(Some).collect())
    }
}

impl From<&[HostBuffer]> for Endpoint {
    fn from(buffers: &[HostBuffer]) -> Self {
        Endpoint::Buffers(buffers.iter().cloned().map(Some).collect())
    }
}

impl From<Vec<Option<HostBuffer>>> for Endpoint {
    fn from(buffers: Vec<Option<HostBuffer>>) -> Self {
        Endpoint::Buffers(buffers)
    }
}

/// Optional parameters of a copy
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CopyOptions {
    /// Bytes per unit; defaults to the host buffer length
    pub size: Option<usize>,
    /// Byte offset inside the device endpoint
    pub offset: usize,
    /// Overrides the set's default mode when present
    pub async_mode: Option<bool>,
}

impl CopyOptions {
    pub fn size(mut self, size: usize) -> Self {
        self.size = Some(size);
        self
    }

    pub fn offset(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }

    pub fn async_mode(mut self, async_mode: bool) -> Self {
        self.async_mode = Some(async_mode);
        self
    }
}

/// Native primitive chosen for a copy
#[derive(Debug, Clone)]
pub(crate) enum TransferMode {
    Broadcast { buffer: HostBuffer, size: usize },
    /// `size` is `None` when it comes from the prepared buffers.
    ScatterGather {
        buffers: Vec<Option<HostBuffer>>,
        size: Option<usize>,
    },
    Single { buffer: HostBuffer, size: usize },
}

#[derive(Debug, Clone)]
pub(crate) struct TransferPlan {
    pub direction: XferDirection,
    pub target: XferTarget,
    pub offset: usize,
    pub mode: TransferMode,
}

fn checked_size(requested: Option<usize>, len: usize) -> Result<usize> {
    match requested {
        Some(size) if size > len => Err(Error::BufferTooSmall { size, len }),
        Some(size) => Ok(size),
        None => Ok(len),
    }
}

/// Choose the primitive for copying `src` into `dst` on a set of
/// `unit_count` units.
pub(crate) fn plan(
    dst: Endpoint,
    src: Endpoint,
    options: &CopyOptions,
    unit_count: usize,
    symbols: &SymbolTable,
) -> Result<TransferPlan> {
    let (device, host, direction) = match (dst.is_device(), src.is_device()) {
        (true, false) => (dst, src, XferDirection::ToDevice),
        (false, true) => (src, dst, XferDirection::FromDevice),
        (true, true) => return Err(Error::invalid_transfer("both endpoints are in unit memory")),
        (false, false) => return Err(Error::invalid_transfer("neither endpoint is in unit memory")),
    };

    let target = match device {
        Endpoint::Name(name) => {
            if !symbols.contains(&name) {
                return Err(Error::UnknownSymbol(name));
            }
            XferTarget::Name(name)
        }
        Endpoint::Symbol(symbol) => XferTarget::Symbol(symbol.info()),
        Endpoint::Mram => XferTarget::Mram,
        Endpoint::Buffer(_) | Endpoint::Buffers(_) => {
            return Err(Error::invalid_transfer("host buffer used as device endpoint"))
        }
    };

    // A one-element list on a one-unit set is the single-buffer case.
    let host = match host {
        Endpoint::Buffers(mut buffers) if unit_count == 1 && buffers.len() == 1 && buffers[0].is_some() => {
            match buffers.pop().flatten() {
                Some(buffer) => Endpoint::Buffer(buffer),
                None => Endpoint::Buffers(buffers),
            }
        }
        other => other,
    };

    let mode = match host {
        Endpoint::Buffer(buffer) => {
            let size = checked_size(options.size, buffer.len())?;
            if direction == XferDirection::ToDevice && !matches!(target, XferTarget::Mram) {
                TransferMode::Broadcast { buffer, size }
            } else {
                TransferMode::Single { buffer, size }
            }
        }
        Endpoint::Buffers(buffers) => {
            if buffers.len() != unit_count {
                return Err(Error::BufferCountMismatch {
                    expected: unit_count,
                    actual: buffers.len(),
                });
            }
            if let Some(size) = options.size {
                for buffer in buffers.iter().flatten() {
                    checked_size(Some(size), buffer.len())?;
                }
            }
            TransferMode::ScatterGather {
                buffers,
                size: options.size,
            }
        }
        Endpoint::Name(_) | Endpoint::Symbol(_) | Endpoint::Mram => {
            return Err(Error::invalid_transfer("device endpoint used as host buffer"))
        }
    };

    Ok(TransferPlan {
        direction,
        target,
        offset: options.offset,
        mode,
    })
}

/// Issue the native calls for `plan` on `set`.
pub(crate) fn execute(driver: &dyn Driver, set: SetHandle, plan: TransferPlan, asynchronous: bool) -> Result<()> {
    let flags = if asynchronous { XferFlags::ASYNC } else { XferFlags::DEFAULT };
    let started = Instant::now();

    let bytes = match plan.mode {
        TransferMode::Broadcast { buffer, size } => {
            driver.broadcast(set, &plan.target, plan.offset, &buffer, size, flags)?;
            size
        }
        TransferMode::ScatterGather { buffers, size } => {
            let present = buffers.iter().flatten().count();
            let common = driver.prepare_xfers(set, buffers)?;
            let size = size.unwrap_or(common);
            driver.push_xfer(set, plan.direction, &plan.target, plan.offset, size, flags)?;
            size * present
        }
        TransferMode::Single { buffer, size } => {
            driver.prepare_xfer(set, buffer)?;
            driver.push_xfer(set, plan.direction, &plan.target, plan.offset, size, flags)?;
            size
        }
    };

    if !asynchronous {
        pim_tracing::performance::record_transfer(
            bytes,
            plan.direction.as_str(),
            started.elapsed().as_micros() as u64,
        );
    }
    Ok(())
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn symbols() -> SymbolTable {
        [Symbol::new("counter", 0x100, 4), Symbol::new("data", 0x200, 64)]
            .into_iter()
            .collect()
    }

    fn buffer(len: usize) -> HostBuffer {
        HostBuffer::new(len)
    }

    #[test]
    fn direction_follows_the_device_side() {
        let cases: Vec<(Endpoint, Endpoint, Option<XferDirection>)> = vec![
            ("counter".into(), buffer(4).into(), Some(XferDirection::ToDevice)),
            (buffer(4).into(), "counter".into(), Some(XferDirection::FromDevice)),
            (Endpoint::Mram, buffer(4).into(), Some(XferDirection::ToDevice)),
            (buffer(4).into(), Endpoint::Mram, Some(XferDirection::FromDevice)),
            (Symbol::new("x", 0, 4).into(), vec![buffer(4); 2].into(), Some(XferDirection::ToDevice)),
            ("counter".into(), Endpoint::Mram, None),
            (Endpoint::Mram, Symbol::new("x", 0, 4).into(), None),
            (buffer(4).into(), buffer(4).into(), None),
            (vec![buffer(4); 2].into(), buffer(4).into(), None),
        ];

        for (dst, src, expected) in cases {
            let description = format!("{dst:?} <- {src:?}");
            match (plan(dst, src, &CopyOptions::default(), 2, &symbols()), expected) {
                (Ok(plan), Some(direction)) => assert_eq!(plan.direction, direction, "{description}"),
                (Err(Error::InvalidTransfer(_)), None) => {}
                (other, _) => panic!("{description}: unexpected {other:?}"),
            }
        }
    }

    #[test]
    fn single_buffer_to_symbol_is_a_broadcast() {
        let plan = plan("counter".into(), buffer(4).into(), &CopyOptions::default(), 4, &symbols()).unwrap();
        assert!(matches!(plan.mode, TransferMode::Broadcast { size: 4, .. }));
        assert_eq!(plan.target, XferTarget::Name("counter".into()));
    }

    #[test]
    fn raw_mram_and_reads_use_prepare_and_push() {
        let to_mram = plan(Endpoint::Mram, buffer(8).into(), &CopyOptions::default(), 4, &symbols()).unwrap();
        assert!(matches!(to_mram.mode, TransferMode::Single { size: 8, .. }));

        let read = plan(buffer(4).into(), "counter".into(), &CopyOptions::default(), 4, &symbols()).unwrap();
        assert!(matches!(read.mode, TransferMode::Single { size: 4, .. }));
    }

    #[test]
    fn one_element_list_on_one_unit_is_unwrapped() {
        let plan = plan("counter".into(), vec![buffer(4)].into(), &CopyOptions::default(), 1, &symbols()).unwrap();
        assert!(matches!(plan.mode, TransferMode::Broadcast { .. }));
    }

    #[test]
    fn list_length_must_match_units() {
        let err = plan("data".into(), vec![buffer(4); 3].into(), &CopyOptions::default(), 4, &symbols()).unwrap_err();
        assert!(matches!(err, Error::BufferCountMismatch { expected: 4, actual: 3 }));

        let plan = plan(
            vec![Some(buffer(4)), None].into(),
            "counter".into(),
            &CopyOptions::default(),
            2,
            &symbols(),
        )
        .unwrap();
        assert!(matches!(plan.mode, TransferMode::ScatterGather { size: None, .. }));
    }

    #[test]
    fn explicit_size_cannot_exceed_buffer() {
        let options = CopyOptions::default().size(16);
        let err = plan("data".into(), buffer(8).into(), &options, 1, &symbols()).unwrap_err();
        assert!(matches!(err, Error::BufferTooSmall { size: 16, len: 8 }));

        let err = plan("data".into(), vec![buffer(16), buffer(8)].into(), &options, 2, &symbols()).unwrap_err();
        assert!(matches!(err, Error::BufferTooSmall { size: 16, len: 8 }));
    }

    #[test]
    fn unknown_name_is_rejected_locally() {
        let err = plan("nope".into(), buffer(4).into(), &CopyOptions::default(), 1, &symbols()).unwrap_err();
        assert!(matches!(err, Error::UnknownSymbol(name) if name == "nope"));
    }

    #[test]
    fn offset_is_carried() {
        let options = CopyOptions::default().offset(8).size(4);
        let plan = plan("data".into(), buffer(16).into(), &options, 1, &symbols()).unwrap();
        assert_eq!(plan.offset, 8);
        assert!(matches!(plan.mode, TransferMode::Broadcast { size: 4, .. }));
    }
}
