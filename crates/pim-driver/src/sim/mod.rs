//! In-process reference driver
//!
//! `SimDriver` implements [`Driver`] over a simulated pool of ranks. It is
//! what the host crate's tests run against and what tools use when no
//! hardware is present.
//!
//! # Architecture
//!
//! ```text
//! SimDriver
//!   ├── Registry (Mutex)         handles, programs, staged transfers
//!   └── SimRank × ranks
//!         ├── units (Mutex)      SimUnit × units_per_rank
//!         └── RankWorker         thread + job channel + pending counter
//! ```
//!
//! Every device-touching operation becomes one job per rank. Synchronous
//! calls wait for their jobs, asynchronous ones return once queued.

mod config;
mod memory;
mod unit;
mod worker;

pub use config::{check_profile, SimConfig, ENV_MRAM_SIZE, ENV_RANKS, ENV_UNITS_PER_RANK, ENV_WRAM_WORDS};
pub use memory::{IRAM_BASE, MRAM_BASE};

use std::borrow::Cow;
use std::collections::HashMap;
use std::io::{self, Write};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

use parking_lot::Mutex;
use rayon::prelude::*;

use crate::context::ContextSnapshot;
use crate::driver::{
    AllocRequest, CallbackFlags, CallbackTarget, CheckpointFlags, Driver, HostBuffer, LaunchPolicy, NativeCallback,
    ProgramBinary, ProgramHandle, SetHandle, SymbolInfo, UnitStatus, XferDirection, XferFlags, XferTarget,
    ALLOCATE_ALL,
};
use crate::error::{DriverError, Result};
use crate::image::ProgramImage;
use unit::SimUnit;
use worker::{Pending, RankWorker, Reply};

static NEXT_DRIVER_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SetKind {
    Allocation,
    Rank,
    Unit,
}

/// Units of one rank that belong to a set.
#[derive(Debug, Clone)]
struct RankSlice {
    rank: usize,
    units: Vec<usize>,
}

#[derive(Debug, Clone)]
struct SetEntry {
    kind: SetKind,
    /// Allocation this handle derives from
    owner: SetHandle,
    slices: Vec<RankSlice>,
    ranks: Vec<SetHandle>,
    units: Vec<SetHandle>,
}

struct ProgramEntry {
    owner: SetHandle,
    image: Arc<ProgramImage>,
}

#[derive(Default)]
struct Registry {
    next_id: u64,
    sets: HashMap<SetHandle, SetEntry>,
    programs: HashMap<ProgramHandle, ProgramEntry>,
    staged: HashMap<SetHandle, Vec<Option<HostBuffer>>>,
    allocated: Vec<bool>,
}

impl Registry {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }
}

struct SimRank {
    units: Arc<Mutex<Vec<SimUnit>>>,
    /// Fault state of each unit after the last job of this rank; readable
    /// while a job holds `units`.
    faults: Arc<Vec<AtomicBool>>,
    worker: RankWorker,
}

fn publish_faults(units: &[SimUnit], faults: &[AtomicBool]) {
    for (unit, fault) in units.iter().zip(faults) {
        fault.store(unit.faulted(), Ordering::Release);
    }
}

/// Simulated pool of processing units
pub struct SimDriver {
    id: u64,
    config: SimConfig,
    ranks: Vec<SimRank>,
    registry: Mutex<Registry>,
    native_calls: AtomicU64,
}

impl SimDriver {
    /// Create the pool and start one worker per rank.
    #[tracing::instrument(skip_all, fields(ranks = config.ranks, units_per_rank = config.units_per_rank))]
    pub fn new(config: SimConfig) -> Result<Self> {
        config.validate()?;
        let id = NEXT_DRIVER_ID.fetch_add(1, Ordering::Relaxed);

        let ranks = (0..config.ranks)
            .map(|rank| {
                let units = (0..config.units_per_rank)
                    .map(|unit| SimUnit::new(rank * config.units_per_rank + unit, &config))
                    .collect();
                Ok(SimRank {
                    units: Arc::new(Mutex::new(units)),
                    faults: Arc::new((0..config.units_per_rank).map(|_| AtomicBool::new(false)).collect()),
                    worker: RankWorker::spawn(id, rank as usize)?,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        tracing::debug!(driver = id, total_units = config.total_units(), "sim_driver_created");

        Ok(Self {
            id,
            registry: Mutex::new(Registry {
                allocated: vec![false; ranks.len()],
                ..Registry::default()
            }),
            config,
            ranks,
            native_calls: AtomicU64::new(0),
        })
    }

    pub fn config(&self) -> &SimConfig {
        &self.config
    }

    /// Number of [`Driver`] entry points invoked so far.
    pub fn native_calls(&self) -> u64 {
        self.native_calls.load(Ordering::SeqCst)
    }

    /// Ranks not currently allocated.
    pub fn free_ranks(&self) -> usize {
        self.registry.lock().allocated.iter().filter(|used| !**used).count()
    }

    fn count_call(&self, operation: &'static str) {
        self.native_calls.fetch_add(1, Ordering::SeqCst);
        tracing::trace!(driver = self.id, operation, "native_call");
    }

    fn entry(&self, set: SetHandle) -> Result<SetEntry> {
        self.registry
            .lock()
            .sets
            .get(&set)
            .cloned()
            .ok_or_else(|| DriverError::invalid_set(format!("unknown handle {set}")))
    }

    /// Rank and in-rank position of a single-unit handle.
    fn unit_location(&self, set: SetHandle) -> Result<(usize, usize)> {
        let entry = self.entry(set)?;
        match (entry.kind, entry.slices.as_slice()) {
            (SetKind::Unit, [slice]) if slice.units.len() == 1 => Ok((slice.rank, slice.units[0])),
            _ => Err(DriverError::invalid_set(format!("{set} is not a single unit"))),
        }
    }

    fn run_on_unit<T, F>(&self, set: SetHandle, work: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut SimUnit) -> Result<T> + Send + 'static,
    {
        let (rank, unit) = self.unit_location(set)?;
        let rank = &self.ranks[rank];
        let units = Arc::clone(&rank.units);
        let faults = Arc::clone(&rank.faults);
        rank.worker.run(move || {
            let mut units = units.lock();
            let result = work(&mut units[unit]);
            publish_faults(&units, &faults);
            result
        })
    }

    /// Run `work` once per rank slice, on that rank's worker. The first
    /// argument is the slice position inside `slices`.
    fn dispatch<F>(&self, slices: &[RankSlice], asynchronous: bool, work: F) -> Result<()>
    where
        F: Fn(usize, &mut [SimUnit], &[usize]) -> Result<()> + Send + Sync + 'static,
    {
        let work = Arc::new(work);
        let mut replies = Vec::with_capacity(slices.len());

        for (position, slice) in slices.iter().enumerate() {
            let rank = &self.ranks[slice.rank];
            let units = Arc::clone(&rank.units);
            let faults = Arc::clone(&rank.faults);
            let selected = slice.units.clone();
            let work = Arc::clone(&work);
            let job = move || {
                let mut units = units.lock();
                let result = work(position, &mut units, &selected);
                publish_faults(&units, &faults);
                result
            };

            if asynchronous {
                rank.worker.submit(Box::new(job))?;
            } else {
                replies.push(rank.worker.request(job));
            }
        }

        merge(replies.into_iter().map(|reply| reply.and_then(Reply::wait)))
    }

    /// Wait until the work queued on `slices` before this call has run,
    /// leaving recorded async errors for the next `sync`.
    fn barrier(&self, slices: &[RankSlice]) -> Result<()> {
        merge(
            slices
                .iter()
                .map(|slice| self.ranks[slice.rank].worker.request(|| Ok(())).and_then(Reply::wait)),
        )
    }
}

/// Combine per-rank results: the first non-fault error wins, otherwise the
/// faulted units of every rank are reported together.
fn merge(results: impl Iterator<Item = Result<()>>) -> Result<()> {
    let mut faulted = Vec::new();
    let mut first = None;
    for result in results {
        match result {
            Ok(()) => {}
            Err(DriverError::UnitFault { units }) => faulted.extend(units),
            Err(err) => {
                first.get_or_insert(err);
            }
        }
    }
    if let Some(err) = first {
        return Err(err);
    }
    if faulted.is_empty() {
        Ok(())
    } else {
        faulted.sort_unstable();
        Err(DriverError::UnitFault { units: faulted })
    }
}

/// Call `callback`, or hand it to a detached thread tracked by `pending`.
fn invoke(
    callback: NativeCallback,
    target: CallbackTarget,
    index: u32,
    nonblocking: bool,
    pending: Arc<Pending>,
) -> Result<()> {
    if !nonblocking {
        return callback(target, index);
    }

    pending.begin();
    let detached = Arc::clone(&pending);
    thread::Builder::new()
        .name("pim-callback".to_string())
        .spawn(move || detached.finish(callback(target, index)))
        .map(|_| ())
        .map_err(|err| {
            pending.finish(Ok(()));
            DriverError::system(format!("failed to spawn callback thread: {err}"))
        })
}

fn io_error(err: io::Error) -> DriverError {
    DriverError::system(format!("log sink: {err}"))
}

impl Driver for SimDriver {
    // ============================================================================================
    // Allocation and topology
    // ============================================================================================

    #[tracing::instrument(skip(self), fields(driver = self.id))]
    fn allocate(&self, request: AllocRequest, profile: &str) -> Result<SetHandle> {
        self.count_call("allocate");
        check_profile(profile)?;

        let per_rank = self.config.units_per_rank as usize;
        let mut registry = self.registry.lock();
        let free: Vec<usize> = registry
            .allocated
            .iter()
            .enumerate()
            .filter(|(_, used)| !**used)
            .map(|(rank, _)| rank)
            .collect();
        let full = |rank: usize| RankSlice {
            rank,
            units: (0..per_rank).collect(),
        };

        let slices: Vec<RankSlice> = match request {
            AllocRequest::Units(ALLOCATE_ALL) | AllocRequest::Ranks(ALLOCATE_ALL) => {
                free.iter().copied().map(full).collect()
            }
            AllocRequest::Ranks(count) => {
                let count = count as usize;
                if count > free.len() {
                    return Err(DriverError::Allocation(format!(
                        "{count} rank(s) requested, {} free",
                        free.len()
                    )));
                }
                free[..count].iter().copied().map(full).collect()
            }
            AllocRequest::Units(count) => {
                let count = count as usize;
                let needed = count.div_ceil(per_rank);
                if needed > free.len() {
                    return Err(DriverError::Allocation(format!(
                        "{count} unit(s) requested, {} free",
                        free.len() * per_rank
                    )));
                }
                free[..needed]
                    .iter()
                    .enumerate()
                    .map(|(position, &rank)| RankSlice {
                        rank,
                        units: (0..per_rank.min(count - position * per_rank)).collect(),
                    })
                    .collect()
            }
        };
        if slices.is_empty() {
            return Err(DriverError::Allocation("no unit requested or available".to_string()));
        }

        let top = SetHandle::new(registry.next_id());
        let mut rank_handles = Vec::with_capacity(slices.len());
        let mut unit_handles = Vec::new();

        for slice in &slices {
            registry.allocated[slice.rank] = true;
            let rank_handle = SetHandle::new(registry.next_id());
            let mut rank_units = Vec::with_capacity(slice.units.len());
            for &unit in &slice.units {
                let unit_handle = SetHandle::new(registry.next_id());
                registry.sets.insert(
                    unit_handle,
                    SetEntry {
                        kind: SetKind::Unit,
                        owner: top,
                        slices: vec![RankSlice {
                            rank: slice.rank,
                            units: vec![unit],
                        }],
                        ranks: vec![rank_handle],
                        units: vec![unit_handle],
                    },
                );
                rank_units.push(unit_handle);
            }
            registry.sets.insert(
                rank_handle,
                SetEntry {
                    kind: SetKind::Rank,
                    owner: top,
                    slices: vec![slice.clone()],
                    ranks: vec![rank_handle],
                    units: rank_units.clone(),
                },
            );
            rank_handles.push(rank_handle);
            unit_handles.extend(rank_units);
        }

        tracing::debug!(set = %top, ranks = slices.len(), units = unit_handles.len(), "allocated");
        registry.sets.insert(
            top,
            SetEntry {
                kind: SetKind::Allocation,
                owner: top,
                slices,
                ranks: rank_handles,
                units: unit_handles,
            },
        );
        Ok(top)
    }

    #[tracing::instrument(skip(self), fields(driver = self.id))]
    fn free(&self, set: SetHandle) -> Result<()> {
        self.count_call("free");
        let entry = self.entry(set)?;
        if entry.kind != SetKind::Allocation {
            return Err(DriverError::invalid_set(format!("{set} is not an allocated set")));
        }

        for slice in &entry.slices {
            if let Err(err) = self.ranks[slice.rank].worker.sync() {
                tracing::debug!(rank = slice.rank, error = %err, "discarding_error_on_free");
            }
        }

        {
            let mut registry = self.registry.lock();
            let Registry {
                sets,
                programs,
                staged,
                allocated,
                ..
            } = &mut *registry;
            sets.retain(|_, entry| entry.owner != set);
            programs.retain(|_, program| program.owner != set);
            staged.retain(|handle, _| sets.contains_key(handle));
            for slice in &entry.slices {
                allocated[slice.rank] = false;
            }
        }

        for slice in &entry.slices {
            let rank = &self.ranks[slice.rank];
            let mut units = rank.units.lock();
            units.iter_mut().for_each(SimUnit::reset);
            publish_faults(&units, &rank.faults);
        }
        tracing::debug!(set = %set, "freed");
        Ok(())
    }

    fn ranks(&self, set: SetHandle) -> Result<Vec<SetHandle>> {
        self.count_call("ranks");
        Ok(self.entry(set)?.ranks)
    }

    fn units(&self, set: SetHandle) -> Result<Vec<SetHandle>> {
        self.count_call("units");
        Ok(self.entry(set)?.units)
    }

    // ============================================================================================
    // Programs
    // ============================================================================================

    #[tracing::instrument(skip(self, binary), fields(driver = self.id))]
    fn load(&self, set: SetHandle, binary: &ProgramBinary) -> Result<ProgramHandle> {
        self.count_call("load");
        let entry = self.entry(set)?;

        let bytes = match binary {
            ProgramBinary::Bytes(bytes) => Cow::Borrowed(bytes.as_slice()),
            ProgramBinary::Path(path) => Cow::Owned(std::fs::read(path).map_err(|err| {
                if err.kind() == io::ErrorKind::NotFound {
                    DriverError::NoSuchFile(path.display().to_string())
                } else {
                    DriverError::system(format!("reading {}: {err}", path.display()))
                }
            })?),
        };
        let image = Arc::new(ProgramImage::from_bytes(&bytes).map_err(DriverError::invalid_file)?);

        let loaded = Arc::clone(&image);
        self.dispatch(&entry.slices, false, move |_, units, selected| {
            selected
                .iter()
                .try_for_each(|&unit| units[unit].load(Arc::clone(&loaded)))
        })?;

        let mut registry = self.registry.lock();
        let handle = ProgramHandle::new(registry.next_id());
        registry.programs.insert(
            handle,
            ProgramEntry {
                owner: entry.owner,
                image,
            },
        );
        tracing::debug!(program = %handle, "program_loaded");
        Ok(handle)
    }

    fn symbol(&self, program: ProgramHandle, name: &str) -> Result<SymbolInfo> {
        self.count_call("symbol");
        let registry = self.registry.lock();
        let entry = registry.programs.get(&program).ok_or(DriverError::NoProgramLoaded)?;
        entry
            .image
            .symbol(name)
            .ok_or_else(|| DriverError::UnknownSymbol(name.to_string()))
    }

    fn symbol_names(&self, program: ProgramHandle) -> Result<Vec<String>> {
        self.count_call("symbol_names");
        let registry = self.registry.lock();
        let entry = registry.programs.get(&program).ok_or(DriverError::NoProgramLoaded)?;
        Ok(entry.image.symbols.keys().cloned().collect())
    }

    // ============================================================================================
    // Execution
    // ============================================================================================

    #[tracing::instrument(skip(self), fields(driver = self.id))]
    fn launch(&self, set: SetHandle, policy: LaunchPolicy) -> Result<()> {
        self.count_call("launch");
        let entry = self.entry(set)?;

        self.dispatch(
            &entry.slices,
            policy == LaunchPolicy::Asynchronous,
            |_, units, selected| {
                let outcomes = units
                    .par_iter_mut()
                    .enumerate()
                    .filter(|(position, _)| selected.contains(position))
                    .map(|(_, unit)| {
                        unit.run()?;
                        Ok(unit.faulted().then_some(unit.index))
                    })
                    .collect::<Result<Vec<_>>>()?;

                let faulted: Vec<u32> = outcomes.into_iter().flatten().collect();
                if faulted.is_empty() {
                    Ok(())
                } else {
                    Err(DriverError::UnitFault { units: faulted })
                }
            },
        )
    }

    fn status(&self, set: SetHandle) -> Result<UnitStatus> {
        self.count_call("status");
        let entry = self.entry(set)?;

        let done = entry
            .slices
            .iter()
            .all(|slice| self.ranks[slice.rank].worker.pending().is_idle());
        let fault = entry.slices.iter().any(|slice| {
            let faults = &self.ranks[slice.rank].faults;
            slice.units.iter().any(|&unit| faults[unit].load(Ordering::Acquire))
        });
        Ok(UnitStatus { done, fault })
    }

    fn sync(&self, set: SetHandle) -> Result<()> {
        self.count_call("sync");
        let entry = self.entry(set)?;
        merge(entry.slices.iter().map(|slice| self.ranks[slice.rank].worker.sync()))
    }

    // ============================================================================================
    // Raw memory access
    // ============================================================================================

    fn copy_to(&self, unit: SetHandle, address: u32, data: &[u8]) -> Result<()> {
        self.count_call("copy_to");
        let data = data.to_vec();
        self.run_on_unit(unit, move |unit| unit.memory_mut().write(address, &data))
    }

    fn copy_from(&self, unit: SetHandle, address: u32, data: &mut [u8]) -> Result<()> {
        self.count_call("copy_from");
        let len = data.len();
        let bytes = self.run_on_unit(unit, move |unit| {
            let mut bytes = vec![0; len];
            unit.memory().read(address, &mut bytes)?;
            Ok(bytes)
        })?;
        data.copy_from_slice(&bytes);
        Ok(())
    }

    // ============================================================================================
    // Staged transfers
    // ============================================================================================

    fn prepare_xfer(&self, set: SetHandle, buffer: HostBuffer) -> Result<usize> {
        self.count_call("prepare_xfer");
        let entry = self.entry(set)?;
        let len = buffer.len();
        self.registry
            .lock()
            .staged
            .insert(set, vec![Some(buffer); entry.units.len()]);
        Ok(len)
    }

    fn prepare_xfers(&self, set: SetHandle, buffers: Vec<Option<HostBuffer>>) -> Result<usize> {
        self.count_call("prepare_xfers");
        let entry = self.entry(set)?;
        if buffers.len() != entry.units.len() {
            return Err(DriverError::invalid_transfer(format!(
                "{} buffer(s) for {} unit(s)",
                buffers.len(),
                entry.units.len()
            )));
        }

        let mut size = None;
        for len in buffers.iter().flatten().map(HostBuffer::len) {
            match size {
                None => size = Some(len),
                Some(common) if common != len => {
                    return Err(DriverError::invalid_transfer(format!(
                        "buffers of {common} and {len} bytes in one transfer"
                    )));
                }
                Some(_) => {}
            }
        }

        self.registry.lock().staged.insert(set, buffers);
        Ok(size.unwrap_or(0))
    }

    #[tracing::instrument(skip(self), fields(driver = self.id))]
    fn push_xfer(
        &self,
        set: SetHandle,
        direction: XferDirection,
        target: &XferTarget,
        offset: usize,
        size: usize,
        flags: XferFlags,
    ) -> Result<()> {
        self.count_call("push_xfer");
        let entry = self.entry(set)?;

        let staged = {
            let mut registry = self.registry.lock();
            if flags.contains(XferFlags::NO_RESET) {
                registry.staged.get(&set).cloned()
            } else {
                registry.staged.remove(&set)
            }
        }
        .ok_or_else(|| DriverError::invalid_transfer(format!("no transfer prepared on {set}")))?;

        if let Some(actual) = staged.iter().flatten().map(HostBuffer::len).find(|&len| len < size) {
            return Err(DriverError::InvalidBufferSize { expected: size, actual });
        }

        let mut remaining = staged.into_iter();
        let per_slice: Vec<Vec<Option<HostBuffer>>> = entry
            .slices
            .iter()
            .map(|slice| remaining.by_ref().take(slice.units.len()).collect())
            .collect();
        let per_slice = Arc::new(per_slice);
        let target = target.clone();

        self.dispatch(
            &entry.slices,
            flags.contains(XferFlags::ASYNC),
            move |position, units, selected| {
                for (&unit, buffer) in selected.iter().zip(&per_slice[position]) {
                    let Some(buffer) = buffer else { continue };
                    let unit = &mut units[unit];
                    let address = unit.resolve(&target, offset, size)?;
                    let mut data = buffer.lock();
                    match direction {
                        XferDirection::ToDevice => unit.memory_mut().write(address, &data[..size])?,
                        XferDirection::FromDevice => unit.memory().read(address, &mut data[..size])?,
                    }
                }
                Ok(())
            },
        )
    }

    #[tracing::instrument(skip(self, buffer), fields(driver = self.id))]
    fn broadcast(
        &self,
        set: SetHandle,
        target: &XferTarget,
        offset: usize,
        buffer: &HostBuffer,
        size: usize,
        flags: XferFlags,
    ) -> Result<()> {
        self.count_call("broadcast");
        let entry = self.entry(set)?;

        let data = {
            let data = buffer.lock();
            if data.len() < size {
                return Err(DriverError::InvalidBufferSize {
                    expected: size,
                    actual: data.len(),
                });
            }
            Arc::new(data[..size].to_vec())
        };
        let target = target.clone();

        self.dispatch(
            &entry.slices,
            flags.contains(XferFlags::ASYNC),
            move |_, units, selected| {
                for &unit in selected {
                    let unit = &mut units[unit];
                    let address = unit.resolve(&target, offset, size)?;
                    unit.memory_mut().write(address, &data)?;
                }
                Ok(())
            },
        )
    }

    // ============================================================================================
    // Callbacks and logs
    // ============================================================================================

    fn register_callback(&self, set: SetHandle, callback: NativeCallback, flags: CallbackFlags) -> Result<()> {
        self.count_call("register_callback");
        if flags.contains(CallbackFlags::NONBLOCKING) && !flags.contains(CallbackFlags::ASYNC) {
            return Err(DriverError::NonblockingSyncCallback);
        }
        let entry = self.entry(set)?;
        let asynchronous = flags.contains(CallbackFlags::ASYNC);
        let nonblocking = flags.contains(CallbackFlags::NONBLOCKING);

        if flags.contains(CallbackFlags::SINGLE_CALL) || entry.kind == SetKind::Unit {
            if !asynchronous {
                self.barrier(&entry.slices)?;
                return callback(CallbackTarget::WholeSet, 0);
            }

            // The last rank to reach the registration point makes the call.
            let remaining = Arc::new(AtomicUsize::new(entry.slices.len()));
            for slice in &entry.slices {
                let worker = &self.ranks[slice.rank].worker;
                let remaining = Arc::clone(&remaining);
                let callback = Arc::clone(&callback);
                let pending = Arc::clone(worker.pending());
                worker.submit(Box::new(move || {
                    if remaining.fetch_sub(1, Ordering::AcqRel) != 1 {
                        return Ok(());
                    }
                    invoke(callback, CallbackTarget::WholeSet, 0, nonblocking, pending)
                }))?;
            }
            return Ok(());
        }

        let mut replies = Vec::new();
        for (slot, slice) in entry.slices.iter().enumerate() {
            let slot = slot as u32;
            let worker = &self.ranks[slice.rank].worker;
            let callback = Arc::clone(&callback);
            let pending = Arc::clone(worker.pending());
            let job = move || invoke(callback, CallbackTarget::Rank(slot), slot, nonblocking, pending);

            if asynchronous {
                worker.submit(Box::new(job))?;
            } else {
                replies.push(worker.request(job));
            }
        }
        merge(replies.into_iter().map(|reply| reply.and_then(Reply::wait)))
    }

    fn log_read(&self, unit: SetHandle, sink: &mut dyn Write) -> Result<()> {
        self.count_call("log_read");
        let (index, log) = self.run_on_unit(unit, |unit| Ok((unit.index, unit.log().map(<[u8]>::to_vec))))?;
        let log = log.ok_or(DriverError::LogContextMissing(index))?;

        writeln!(sink, "=== DPU#0x{index:x} ===").map_err(io_error)?;
        sink.write_all(&log).map_err(io_error)?;
        sink.flush().map_err(io_error)
    }

    // ============================================================================================
    // Checkpoints
    // ============================================================================================

    #[tracing::instrument(skip(self), fields(driver = self.id))]
    fn checkpoint_save(&self, unit: SetHandle, flags: CheckpointFlags) -> Result<ContextSnapshot> {
        self.count_call("checkpoint_save");
        self.run_on_unit(unit, move |unit| Ok(unit.save(flags)))
    }

    #[tracing::instrument(skip(self, context), fields(driver = self.id))]
    fn checkpoint_restore(&self, unit: SetHandle, flags: CheckpointFlags, context: &ContextSnapshot) -> Result<()> {
        self.count_call("checkpoint_restore");
        let context = context.clone();
        self.run_on_unit(unit, move |unit| unit.restore(flags, &context))
    }
}

// ============================================================================
// Tests
// ============================================================================
