//! Handles, flags and argument types exchanged with a driver

use std::fmt;
use std::ops::{BitOr, BitOrAssign};
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};

use crate::error::Result;

/// Request every free unit of the pool.
pub const ALLOCATE_ALL: u32 = u32::MAX;

/// Handle to a set of units owned by the driver
///
/// A handle designates either an allocated set, one of its ranks, or a
/// single unit. Only the handle returned by [`crate::Driver::allocate`] may be
/// freed; rank and unit handles die with it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SetHandle(pub u64);

impl SetHandle {
    pub const fn new(id: u64) -> Self {
        SetHandle(id)
    }

    pub const fn id(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SetHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "set{}", self.0)
    }
}

/// Handle to a program loaded by [`crate::Driver::load`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProgramHandle(pub u64);

impl ProgramHandle {
    pub const fn new(id: u64) -> Self {
        ProgramHandle(id)
    }

    pub const fn id(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ProgramHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "prog{}", self.0)
    }
}

/// How many resources an allocation asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocRequest {
    /// A number of units, or [`ALLOCATE_ALL`]
    Units(u32),
    /// A number of whole ranks, or [`ALLOCATE_ALL`]
    Ranks(u32),
}

impl AllocRequest {
    pub const fn all() -> Self {
        AllocRequest::Units(ALLOCATE_ALL)
    }
}

/// Where a program binary comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProgramBinary {
    /// Binary image held in memory
    Bytes(Vec<u8>),
    /// Binary image on disk
    Path(PathBuf),
}

/// Launch blocking policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchPolicy {
    /// Return once every unit finished
    Synchronous,
    /// Return once the launch is queued
    Asynchronous,
}

/// Direction of a staged transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum XferDirection {
    ToDevice,
    FromDevice,
}

impl XferDirection {
    pub const fn as_str(self) -> &'static str {
        match self {
            XferDirection::ToDevice => "to_device",
            XferDirection::FromDevice => "from_device",
        }
    }
}

/// Location and size of a program symbol on every unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SymbolInfo {
    pub address: u32,
    pub size: u32,
}

/// Device-side end of a transfer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum XferTarget {
    /// Symbol looked up by name in each unit's program
    Name(String),
    /// Symbol already resolved by the caller
    Symbol(SymbolInfo),
    /// The whole MRAM bank, addressed from its start
    Mram,
}

impl fmt::Display for XferTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            XferTarget::Name(name) => write!(f, "{name}"),
            XferTarget::Symbol(info) => write!(f, "{:#x}[{}]", info.address, info.size),
            XferTarget::Mram => write!(f, "mram"),
        }
    }
}

macro_rules! flag_set {
    ($(#[$meta:meta])* $name:ident { $($(#[$cmeta:meta])* $flag:ident = $value:expr),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
        pub struct $name(pub u32);

        impl $name {
            $($(#[$cmeta])* pub const $flag: $name = $name($value);)+

            pub const fn bits(self) -> u32 {
                self.0
            }

            pub const fn contains(self, other: $name) -> bool {
                self.0 & other.0 == other.0
            }

            pub const fn intersects(self, other: $name) -> bool {
                self.0 & other.0 != 0
            }

            pub const fn without(self, other: $name) -> $name {
                $name(self.0 & !other.0)
            }
        }

        impl BitOr for $name {
            type Output = $name;

            fn bitor(self, rhs: $name) -> $name {
                $name(self.0 | rhs.0)
            }
        }

        impl BitOrAssign for $name {
            fn bitor_assign(&mut self, rhs: $name) {
                self.0 |= rhs.0;
            }
        }
    };
}

flag_set!(
    /// Options of a staged or broadcast transfer
    XferFlags {
        DEFAULT = 0,
        /// Keep the staged buffers after the push
        NO_RESET = 1,
        /// Queue the transfer and return immediately
        ASYNC = 2,
    }
);

flag_set!(
    /// Options of a callback registration
    CallbackFlags {
        DEFAULT = 0,
        /// Queue the callback and return immediately
        ASYNC = 1,
        /// Do not block the rank worker while the callback runs
        NONBLOCKING = 2,
        /// Call once for the whole set instead of once per rank
        SINGLE_CALL = 4,
    }
);

flag_set!(
    /// State captured by a checkpoint
    CheckpointFlags {
        NONE = 0,
        /// Registers, program counters, flags, scheduling and faults
        INTERNAL = 1,
        IRAM = 2,
        MRAM = 8,
        WRAM = 16,
        ALL = 27,
    }
);

/// Execution status of a set
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct UnitStatus {
    /// Every unit finished and no work is queued
    pub done: bool,
    /// At least one unit faulted
    pub fault: bool,
}

/// Origin of a callback invocation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallbackTarget {
    /// Single-call registration, or a set of one unit
    WholeSet,
    /// Rank at this position in the registering set's rank list
    Rank(u32),
}

/// Callback handed to the driver. The second argument is the invocation
/// index (the rank slot, or 0 for a whole-set call).
pub type NativeCallback = Arc<dyn Fn(CallbackTarget, u32) -> Result<()> + Send + Sync>;

/// Host memory shared between the caller and queued transfers.
///
/// Asynchronous transfers read or fill the buffer on a rank worker after
/// the call returned; the caller observes the data once it synchronised.
#[derive(Clone, Default)]
pub struct HostBuffer(Arc<Mutex<Vec<u8>>>);

impl HostBuffer {
    /// Zero-filled buffer of `len` bytes.
    pub fn new(len: usize) -> Self {
        Self::from_vec(vec![0; len])
    }

    pub fn from_vec(data: Vec<u8>) -> Self {
        HostBuffer(Arc::new(Mutex::new(data)))
    }

    pub fn len(&self) -> usize {
        self.0.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy of the current contents.
    pub fn to_vec(&self) -> Vec<u8> {
        self.0.lock().clone()
    }

    pub fn lock(&self) -> MutexGuard<'_, Vec<u8>> {
        self.0.lock()
    }

    /// Whether both values share the same storage.
    pub fn ptr_eq(&self, other: &HostBuffer) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl From<Vec<u8>> for HostBuffer {
    fn from(data: Vec<u8>) -> Self {
        HostBuffer::from_vec(data)
    }
}

impl From<&[u8]> for HostBuffer {
    fn from(data: &[u8]) -> Self {
        HostBuffer::from_vec(data.to_vec())
    }
}

impl fmt::Debug for HostBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostBuffer").field("len", &self.len()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checkpoint_all_is_every_region_plus_internal() {
        let all = CheckpointFlags::INTERNAL | CheckpointFlags::IRAM | CheckpointFlags::MRAM | CheckpointFlags::WRAM;
        assert_eq!(all, CheckpointFlags::ALL);
        assert!(!CheckpointFlags::ALL.without(CheckpointFlags::MRAM).contains(CheckpointFlags::MRAM));
        assert!(CheckpointFlags::ALL.without(CheckpointFlags::MRAM).contains(CheckpointFlags::INTERNAL));
    }

    #[test]
    fn callback_flags_combine() {
        let flags = CallbackFlags::ASYNC | CallbackFlags::SINGLE_CALL;
        assert_eq!(flags.bits(), 5);
        assert!(flags.contains(CallbackFlags::ASYNC));
        assert!(!flags.contains(CallbackFlags::NONBLOCKING));
        assert!(flags.intersects(CallbackFlags::SINGLE_CALL | CallbackFlags::NONBLOCKING));
    }

    #[test]
    fn host_buffer_clones_share_storage() {
        let buffer = HostBuffer::new(4);
        let alias = buffer.clone();
        alias.lock().copy_from_slice(&[1, 2, 3, 4]);
        assert_eq!(buffer.to_vec(), vec![1, 2, 3, 4]);
        assert!(buffer.ptr_eq(&alias));
        assert!(!buffer.ptr_eq(&HostBuffer::from_vec(vec![1, 2, 3, 4])));
    }

    #[test]
    fn handles_display_with_prefix() {
        assert_eq!(SetHandle::new(3).to_string(), "set3");
        assert_eq!(ProgramHandle::new(9).to_string(), "prog9");
    }
}
