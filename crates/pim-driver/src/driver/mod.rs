//! Driver trait and the types it exchanges

mod traits;
mod types;

pub use traits::Driver;
pub use types::{
    AllocRequest, CallbackFlags, CallbackTarget, CheckpointFlags, HostBuffer, LaunchPolicy, NativeCallback,
    ProgramBinary, ProgramHandle, SetHandle, SymbolInfo, UnitStatus, XferDirection, XferFlags, XferTarget,
    ALLOCATE_ALL,
};
