//! Driver trait: the narrow interface between host orchestration and a
//! concrete accelerator driver

use std::io::Write;

use super::types::{
    AllocRequest, CallbackFlags, CheckpointFlags, HostBuffer, LaunchPolicy, NativeCallback, ProgramBinary,
    ProgramHandle, SetHandle, SymbolInfo, UnitStatus, XferDirection, XferFlags, XferTarget,
};
use crate::context::ContextSnapshot;
use crate::error::Result;

/// Driver for a pool of processing units grouped in ranks
///
/// Every method is a single native call. Implementations own all device
/// state; callers only hold [`SetHandle`]s and [`ProgramHandle`]s.
///
/// # Threading
///
/// A driver is shared between the caller's thread and its own rank workers.
/// Asynchronous operations are queued per rank and executed in submission
/// order; synchronous operations wait for their own work and everything
/// queued before it on the same ranks. Callbacks registered with
/// [`Driver::register_callback`] run on rank workers and may call back into
/// the driver.
///
/// # Handles
///
/// [`Driver::allocate`] returns the handle of a new set. Rank and unit
/// handles obtained through [`Driver::ranks`] and [`Driver::units`] stay
/// valid until the allocated set is freed.
///
/// # Example
///
/// ```rust
/// use pim_driver::{AllocRequest, Driver, LaunchPolicy, ProgramBinary, ProgramBuilder, SimConfig, SimDriver};
///
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let driver = SimDriver::new(SimConfig::small(1, 2))?;
/// let set = driver.allocate(AllocRequest::Units(2), "")?;
///
/// let image = ProgramBuilder::new().symbol("counter", 0x100, 4).build();
/// driver.load(set, &ProgramBinary::Bytes(image.to_bytes()?))?;
/// driver.launch(set, LaunchPolicy::Synchronous)?;
///
/// driver.free(set)?;
/// # Ok(())
/// # }
/// ```
pub trait Driver: Send + Sync {
    // ============================================================================================
    // Allocation and topology
    // ============================================================================================

    /// Allocate units from the pool selected by `profile`.
    ///
    /// `profile` is a comma-separated `key=value` list; the empty string
    /// selects the default pool.
    fn allocate(&self, request: AllocRequest, profile: &str) -> Result<SetHandle>;

    /// Free an allocated set together with every rank and unit handle
    /// derived from it.
    fn free(&self, set: SetHandle) -> Result<()>;

    /// Rank handles of `set`, in hardware order.
    fn ranks(&self, set: SetHandle) -> Result<Vec<SetHandle>>;

    /// Unit handles of `set`, rank by rank, in hardware order.
    fn units(&self, set: SetHandle) -> Result<Vec<SetHandle>>;

    // ============================================================================================
    // Programs
    // ============================================================================================

    /// Load a binary on every unit of `set`.
    fn load(&self, set: SetHandle, binary: &ProgramBinary) -> Result<ProgramHandle>;

    /// Address and size of one symbol of a loaded program.
    fn symbol(&self, program: ProgramHandle, name: &str) -> Result<SymbolInfo>;

    /// Every symbol name of a loaded program.
    fn symbol_names(&self, program: ProgramHandle) -> Result<Vec<String>>;

    // ============================================================================================
    // Execution
    // ============================================================================================

    /// Boot every unit of `set`.
    ///
    /// A synchronous launch that ends with faulted units returns
    /// [`crate::DriverError::UnitFault`]. For an asynchronous launch the same
    /// error is reported by the next [`Driver::sync`].
    fn launch(&self, set: SetHandle, policy: LaunchPolicy) -> Result<()>;

    /// Poll the execution state of `set`.
    fn status(&self, set: SetHandle) -> Result<UnitStatus>;

    /// Wait until all queued work of `set` finished and report the first
    /// error raised by that work.
    fn sync(&self, set: SetHandle) -> Result<()>;

    // ============================================================================================
    // Raw memory access
    // ============================================================================================

    /// Write `data` at `address` of a single unit.
    fn copy_to(&self, unit: SetHandle, address: u32, data: &[u8]) -> Result<()>;

    /// Read `data.len()` bytes at `address` of a single unit.
    fn copy_from(&self, unit: SetHandle, address: u32, data: &mut [u8]) -> Result<()>;

    // ============================================================================================
    // Staged transfers
    // ============================================================================================

    /// Stage `buffer` for every unit of `set`. Returns the buffer length.
    fn prepare_xfer(&self, set: SetHandle, buffer: HostBuffer) -> Result<usize>;

    /// Stage one buffer per unit of `set` (`None` skips the unit).
    ///
    /// Every present buffer must have the same length, which is returned.
    fn prepare_xfers(&self, set: SetHandle, buffers: Vec<Option<HostBuffer>>) -> Result<usize>;

    /// Run the staged transfer of `size` bytes at `offset` inside `target`.
    fn push_xfer(
        &self,
        set: SetHandle,
        direction: XferDirection,
        target: &XferTarget,
        offset: usize,
        size: usize,
        flags: XferFlags,
    ) -> Result<()>;

    /// Copy the first `size` bytes of `buffer` to every unit of `set`.
    fn broadcast(
        &self,
        set: SetHandle,
        target: &XferTarget,
        offset: usize,
        buffer: &HostBuffer,
        size: usize,
        flags: XferFlags,
    ) -> Result<()>;

    // ============================================================================================
    // Callbacks and logs
    // ============================================================================================

    /// Schedule `callback` after the work already queued on `set`.
    ///
    /// Without [`CallbackFlags::SINGLE_CALL`] the callback runs once per rank
    /// with [`crate::CallbackTarget::Rank`]; with it, or on a single-unit set,
    /// it runs once with [`crate::CallbackTarget::WholeSet`].
    fn register_callback(&self, set: SetHandle, callback: NativeCallback, flags: CallbackFlags) -> Result<()>;

    /// Write the log buffer of a single unit to `sink`.
    fn log_read(&self, unit: SetHandle, sink: &mut dyn Write) -> Result<()>;

    // ============================================================================================
    // Checkpoints
    // ============================================================================================

    /// Capture the state selected by `flags` from a single unit.
    fn checkpoint_save(&self, unit: SetHandle, flags: CheckpointFlags) -> Result<ContextSnapshot>;

    /// Restore the state selected by `flags` onto a single unit.
    fn checkpoint_restore(&self, unit: SetHandle, flags: CheckpointFlags, context: &ContextSnapshot) -> Result<()>;
}
