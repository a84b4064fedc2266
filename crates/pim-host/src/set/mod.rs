//! Resource sets
//!
//! An allocation is a tree of three levels: the allocated set (top), its
//! ranks, and their units. Every node is stored in one arena owned by the
//! hierarchy; nodes refer to each other by index. A [`ResourceSet`] is a
//! cheap view of one node and exposes the whole transfer and execution API
//! at every level.
//!
//! ```text
//! Hierarchy ── nodes[0]  Top   units = [3, 4, 6, 7]  ranks = [1, 5]
//!              nodes[1]  Rank  units = [3, 4]
//!              nodes[3]  Unit  units = [3]
//!              ...
//! ```
//!
//! Only the top set owns the native handle. Releasing it, explicitly or
//! when the last view is dropped, invalidates every node; later calls fail
//! with [`Error::Released`].

mod builder;

pub use builder::SetBuilder;

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

use parking_lot::{Mutex, RwLock};
use pim_driver::{
    CallbackFlags, CallbackTarget, Driver, DriverError, HostBuffer, LaunchPolicy, NativeCallback, ProgramBinary,
    SetHandle,
};

use crate::callback::{CallOptions, CallbackFn, CallbackId, CallbackRegistry, Completion};
use crate::checkpoint::{CheckpointRegions, DeviceContext};
use crate::compiler::{self, Compiler, LoadRequest};
use crate::error::{Error, LogFailure, Result};
use crate::launch::{self, ExecutionStatus, LogSink, LogTarget};
use crate::symbol::{Program, SymbolTable, SymbolValue};
use crate::transfer::{self, CopyOptions, Endpoint};

/// Level of a set in its hierarchy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SetKind {
    Top,
    Rank,
    Unit,
}

struct Node {
    kind: SetKind,
    handle: SetHandle,
    /// Unit nodes, rank order then position in the rank
    units: Vec<usize>,
    /// Rank nodes; a rank lists itself
    ranks: Vec<usize>,
    symbols: RwLock<Arc<SymbolTable>>,
    log_sink: Mutex<Option<LogSink>>,
    callbacks: CallbackRegistry,
}

impl Node {
    fn new(kind: SetKind, handle: SetHandle) -> Self {
        Self {
            kind,
            handle,
            units: Vec::new(),
            ranks: Vec::new(),
            symbols: RwLock::new(Arc::new(SymbolTable::new())),
            log_sink: Mutex::new(None),
            callbacks: CallbackRegistry::default(),
        }
    }
}

/// Options shared by every node of a hierarchy
#[derive(Debug, Clone, Default)]
pub(crate) struct HierarchyOptions {
    pub default_async: bool,
    pub compiler: Compiler,
}

pub(crate) struct Hierarchy {
    driver: Arc<dyn Driver>,
    nodes: Vec<Node>,
    program: RwLock<Option<Arc<Program>>>,
    default_async: bool,
    default_log: Mutex<Option<LogSink>>,
    compiler: Compiler,
    released: AtomicBool,
    /// Serializes releases; `released` is only set once `free` succeeded.
    releasing: Mutex<()>,
    weak_self: Weak<Hierarchy>,
}

impl Hierarchy {
    /// Enumerate the ranks and units of `top`.
    fn build(driver: Arc<dyn Driver>, top: SetHandle, options: HierarchyOptions) -> Result<Arc<Self>> {
        let mut nodes = vec![Node::new(SetKind::Top, top)];

        for rank_handle in driver.ranks(top)? {
            let rank = nodes.len();
            nodes.push(Node::new(SetKind::Rank, rank_handle));
            nodes[rank].ranks.push(rank);
            nodes[0].ranks.push(rank);

            for unit_handle in driver.units(rank_handle)? {
                let unit = nodes.len();
                nodes.push(Node::new(SetKind::Unit, unit_handle));
                nodes[unit].units.push(unit);
                nodes[rank].units.push(unit);
                nodes[0].units.push(unit);
            }
        }

        Ok(Arc::new_cyclic(|weak_self| Hierarchy {
            driver,
            nodes,
            program: RwLock::new(None),
            default_async: options.default_async,
            default_log: Mutex::new(None),
            compiler: options.compiler,
            released: AtomicBool::new(false),
            releasing: Mutex::new(()),
            weak_self: weak_self.clone(),
        }))
    }

    fn ensure_live(&self) -> Result<()> {
        if self.released.load(Ordering::Acquire) {
            Err(Error::Released)
        } else {
            Ok(())
        }
    }

    /// Install `table` on every node while holding all the locks, so no two
    /// nodes ever disagree.
    fn bind(&self, program: Arc<Program>, table: SymbolTable) {
        let table = Arc::new(table);
        let mut current = self.program.write();
        let mut guards: Vec<_> = self.nodes.iter().map(|node| node.symbols.write()).collect();
        for guard in guards.iter_mut() {
            **guard = Arc::clone(&table);
        }
        *current = Some(program);
    }

    /// Wait for outstanding work, then free the allocation.
    ///
    /// The allocation is freed even when that work failed; its error is
    /// returned afterwards. A failed `free` leaves the set live so the
    /// release can be retried.
    #[tracing::instrument(skip(self), fields(set = %self.nodes[0].handle))]
    fn release(&self) -> Result<()> {
        let _releasing = self.releasing.lock();
        if self.released.load(Ordering::Acquire) {
            return Err(Error::AlreadyReleased);
        }
        let top = self.nodes[0].handle;
        let outstanding = self.driver.sync(top);
        if let Err(err) = &outstanding {
            tracing::debug!(error = %err, "outstanding work failed before release");
        }
        self.driver.free(top)?;
        self.released.store(true, Ordering::Release);
        tracing::debug!("released");
        outstanding.map_err(Error::from)
    }
}

impl Drop for Hierarchy {
    fn drop(&mut self) {
        if self.released.load(Ordering::Acquire) {
            return;
        }
        if let Err(err) = self.release() {
            tracing::warn!(error = %err, "failed to release set on drop");
        }
    }
}

/// One node of an allocated hierarchy: the whole allocation, a rank or a
/// single unit
///
/// Views are cheap to clone. The allocation is released by
/// [`ResourceSet::release`] on the top set, or when the last view of the
/// hierarchy is dropped.
#[derive(Clone)]
pub struct ResourceSet {
    hierarchy: Arc<Hierarchy>,
    node: usize,
}

impl ResourceSet {
    pub fn builder() -> SetBuilder {
        SetBuilder::new()
    }

    fn node(&self) -> &Node {
        &self.hierarchy.nodes[self.node]
    }

    fn view(&self, node: usize) -> ResourceSet {
        ResourceSet {
            hierarchy: Arc::clone(&self.hierarchy),
            node,
        }
    }

    fn driver(&self) -> &dyn Driver {
        self.hierarchy.driver.as_ref()
    }

    fn asynchronous(&self, requested: Option<bool>) -> bool {
        requested.unwrap_or(self.hierarchy.default_async)
    }

    // ============================================================================================
    // Hierarchy
    // ============================================================================================

    pub fn kind(&self) -> SetKind {
        self.node().kind
    }

    pub fn is_top(&self) -> bool {
        self.node == 0
    }

    /// Native handle of this node.
    pub fn handle(&self) -> SetHandle {
        self.node().handle
    }

    /// Number of units in the set.
    pub fn len(&self) -> usize {
        self.node().units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.node().units.is_empty()
    }

    /// Units of the set in rank order.
    pub fn units(&self) -> Vec<ResourceSet> {
        self.node().units.iter().map(|&unit| self.view(unit)).collect()
    }

    /// Ranks of the set. A rank returns itself, a unit returns nothing.
    pub fn ranks(&self) -> Vec<ResourceSet> {
        self.node().ranks.iter().map(|&rank| self.view(rank)).collect()
    }

    pub fn unit(&self, index: usize) -> Option<ResourceSet> {
        self.node().units.get(index).map(|&unit| self.view(unit))
    }

    pub fn rank(&self, index: usize) -> Option<ResourceSet> {
        self.node().ranks.get(index).map(|&rank| self.view(rank))
    }

    /// The allocated set this node belongs to.
    pub fn top(&self) -> ResourceSet {
        self.view(0)
    }

    pub fn default_async(&self) -> bool {
        self.hierarchy.default_async
    }

    pub fn is_released(&self) -> bool {
        self.hierarchy.released.load(Ordering::Acquire)
    }

    /// Free the allocation. Only valid on the top set, and only once.
    pub fn release(&self) -> Result<()> {
        if !self.is_top() {
            return Err(DriverError::invalid_set("only the allocated set can be released").into());
        }
        self.hierarchy.release()
    }

    // ============================================================================================
    // Programs and symbols
    // ============================================================================================

    /// Load a program on every unit of this set and bind its symbols on the
    /// whole hierarchy.
    #[tracing::instrument(skip_all, fields(set = %self.handle()))]
    pub fn load(&self, request: LoadRequest) -> Result<Arc<Program>> {
        self.hierarchy.ensure_live()?;
        let _span = pim_tracing::perf_span!("load", units = self.len());

        // The compiled binary lives in `_workdir` until the driver read it.
        let (binary, _workdir) = match request {
            LoadRequest::Binary(bytes) => (ProgramBinary::Bytes(bytes), None),
            LoadRequest::BinaryFile(path) => (ProgramBinary::Path(path), None),
            LoadRequest::Sources(sources) => {
                let prepared = compiler::prepare(&self.hierarchy.compiler, &sources)?;
                (ProgramBinary::Path(prepared.path.clone()), Some(prepared))
            }
        };

        let handle = self.driver().load(self.handle(), &binary)?;
        let program = Arc::new(Program::new(handle, Arc::clone(&self.hierarchy.driver)));
        let table = program.resolve_all()?;
        tracing::debug!(program = %handle, symbols = table.len(), "program_loaded");
        self.hierarchy.bind(Arc::clone(&program), table);
        Ok(program)
    }

    pub fn load_binary(&self, bytes: impl Into<Vec<u8>>) -> Result<Arc<Program>> {
        self.load(LoadRequest::Binary(bytes.into()))
    }

    pub fn load_file(&self, path: impl Into<std::path::PathBuf>) -> Result<Arc<Program>> {
        self.load(LoadRequest::BinaryFile(path.into()))
    }

    /// Program loaded last anywhere in the hierarchy.
    pub fn program(&self) -> Option<Arc<Program>> {
        self.hierarchy.program.read().clone()
    }

    pub fn symbols(&self) -> Arc<SymbolTable> {
        self.node().symbols.read().clone()
    }

    // ============================================================================================
    // Transfers
    // ============================================================================================

    pub fn copy(&self, dst: impl Into<Endpoint>, src: impl Into<Endpoint>) -> Result<()> {
        self.copy_with(dst, src, CopyOptions::default())
    }

    /// Copy between host memory and unit memory. The direction follows
    /// whichever endpoint is on the device.
    #[tracing::instrument(skip_all, fields(set = %self.handle()))]
    pub fn copy_with(&self, dst: impl Into<Endpoint>, src: impl Into<Endpoint>, options: CopyOptions) -> Result<()> {
        self.hierarchy.ensure_live()?;
        let plan = transfer::plan(dst.into(), src.into(), &options, self.len(), &self.symbols())?;
        transfer::execute(self.driver(), self.handle(), plan, self.asynchronous(options.async_mode))
    }

    /// Read symbol `name` from every unit. Always synchronous.
    pub fn get(&self, name: &str) -> Result<SymbolValue> {
        self.hierarchy.ensure_live()?;
        let symbol = self
            .symbols()
            .get(name)
            .cloned()
            .ok_or_else(|| Error::UnknownSymbol(name.to_string()))?;
        let buffers: Vec<HostBuffer> = (0..self.len())
            .map(|_| HostBuffer::new(symbol.size as usize))
            .collect();

        self.copy_with(
            buffers.clone(),
            Endpoint::Name(symbol.name),
            CopyOptions::default().async_mode(false),
        )?;
        Ok(SymbolValue::new(buffers.iter().map(HostBuffer::to_vec).collect()))
    }

    /// Write `value` into symbol `name` on every unit.
    pub fn set(&self, name: &str, value: &[u8]) -> Result<()> {
        self.copy(Endpoint::Name(name.to_string()), HostBuffer::from(value))
    }

    /// Write raw bytes at `address` of a single unit.
    pub fn write_memory(&self, address: u32, data: &[u8]) -> Result<()> {
        self.hierarchy.ensure_live()?;
        self.expect_unit("raw memory access")?;
        Ok(self.driver().copy_to(self.handle(), address, data)?)
    }

    /// Read raw bytes at `address` of a single unit.
    pub fn read_memory(&self, address: u32, out: &mut [u8]) -> Result<()> {
        self.hierarchy.ensure_live()?;
        self.expect_unit("raw memory access")?;
        Ok(self.driver().copy_from(self.handle(), address, out)?)
    }

    fn expect_unit(&self, operation: &str) -> Result<()> {
        if self.kind() == SetKind::Unit {
            Ok(())
        } else {
            Err(Error::invalid_transfer(format!(
                "{operation} needs a single unit, this set has {}",
                self.len()
            )))
        }
    }

    // ============================================================================================
    // Execution
    // ============================================================================================

    pub fn launch(&self) -> Result<()> {
        self.launch_with(None)
    }

    /// Run the loaded program. A synchronous launch returns once every unit
    /// finished and their logs were written; an asynchronous one once the
    /// launch is queued.
    #[tracing::instrument(skip(self), fields(set = %self.handle()))]
    pub fn launch_with(&self, async_mode: Option<bool>) -> Result<()> {
        self.hierarchy.ensure_live()?;
        let asynchronous = self.asynchronous(async_mode);
        let policy = if asynchronous {
            LaunchPolicy::Asynchronous
        } else {
            LaunchPolicy::Synchronous
        };

        let started = Instant::now();
        self.driver().launch(self.handle(), policy)?;
        pim_tracing::performance::record_launch(self.len(), started.elapsed().as_micros() as u64, asynchronous);

        if !asynchronous {
            self.log(None)?;
        }
        Ok(())
    }

    pub fn status(&self) -> Result<ExecutionStatus> {
        self.hierarchy.ensure_live()?;
        Ok(self.driver().status(self.handle())?.into())
    }

    /// Wait for every queued operation on this set and report the first
    /// asynchronous failure.
    pub fn sync(&self) -> Result<()> {
        self.hierarchy.ensure_live()?;
        Ok(self.driver().sync(self.handle())?)
    }

    // ============================================================================================
    // Logs
    // ============================================================================================

    /// Write the log of every unit to its sink: `target` first, then the
    /// unit's own sink, then the hierarchy default. Units without a sink
    /// are not read.
    pub fn log(&self, target: Option<&LogTarget>) -> Result<()> {
        self.hierarchy.ensure_live()?;
        let nodes = &self.hierarchy.nodes;
        let units = &self.node().units;

        let defaults: Vec<Option<LogSink>> = units.iter().map(|&unit| nodes[unit].log_sink.lock().clone()).collect();
        let global = self.hierarchy.default_log.lock().clone();
        let sinks = launch::resolve_sinks(target, &defaults, global.as_ref())?;

        let mut failures = Vec::new();
        for (position, (&unit, sink)) in units.iter().zip(sinks).enumerate() {
            let Some(sink) = sink else { continue };
            let mut writer = sink.lock();
            if let Err(source) = self.driver().log_read(nodes[unit].handle, &mut *writer) {
                tracing::warn!(unit = position, error = %source, "log_read_failed");
                failures.push(LogFailure { unit: position, source });
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(Error::Log { failures })
        }
    }

    /// Default sink of every unit of this set.
    pub fn set_log_sink(&self, sink: Option<LogSink>) -> Result<()> {
        self.hierarchy.ensure_live()?;
        for &unit in &self.node().units {
            *self.hierarchy.nodes[unit].log_sink.lock() = sink.clone();
        }
        Ok(())
    }

    /// One default sink per unit, in set order.
    pub fn set_unit_log_sinks(&self, sinks: Vec<Option<LogSink>>) -> Result<()> {
        self.hierarchy.ensure_live()?;
        let units = &self.node().units;
        if sinks.len() != units.len() {
            return Err(Error::invalid_log_target(format!(
                "{} sink(s) for {} unit(s)",
                sinks.len(),
                units.len()
            )));
        }
        for (&unit, sink) in units.iter().zip(sinks) {
            *self.hierarchy.nodes[unit].log_sink.lock() = sink;
        }
        Ok(())
    }

    /// Sink used when neither the call nor the unit names one.
    pub fn set_default_log_sink(&self, sink: Option<LogSink>) {
        *self.hierarchy.default_log.lock() = sink;
    }

    // ============================================================================================
    // Callbacks
    // ============================================================================================

    /// Run `function` once per rank of this set (or once for the whole set
    /// with `single_call`), after the work queued before it.
    ///
    /// The function receives the rank it runs for (or this set), the
    /// invocation index and `argument`. Synchronous operations it issues on
    /// that set run directly on the rank's worker.
    pub fn call<A, F>(&self, function: F, argument: A, options: CallOptions) -> Result<CallbackId>
    where
        A: Send + Sync + 'static,
        F: Fn(&ResourceSet, u32, &A) -> Result<()> + Send + Sync + 'static,
    {
        self.hierarchy.ensure_live()?;
        let asynchronous = self.asynchronous(options.async_mode);
        let single_call = options.single_call || self.kind() == SetKind::Unit;

        let mut flags = CallbackFlags::DEFAULT;
        if asynchronous {
            flags |= CallbackFlags::ASYNC;
        }
        if !options.blocking {
            flags |= CallbackFlags::NONBLOCKING;
        }
        if options.single_call {
            flags |= CallbackFlags::SINGLE_CALL;
        }

        let function: CallbackFn = Arc::new(move |set: &ResourceSet, index: u32| function(set, index, &argument));
        let expected = if single_call { 1 } else { self.node().ranks.len() };
        let registry = &self.node().callbacks;
        let id = registry.register(function, expected);

        let hierarchy = self.hierarchy.weak_self.clone();
        let owner = self.node;
        let native: NativeCallback = Arc::new(move |target: CallbackTarget, index: u32| {
            dispatch(&hierarchy, owner, id, target, index)
        });

        if let Err(err) = self.driver().register_callback(self.handle(), native, flags) {
            registry.cancel(id);
            return Err(err.into());
        }
        tracing::debug!(callback = %id, expected, asynchronous, "callback_registered");
        Ok(id)
    }

    /// Registrations of this set that have not completed yet.
    pub fn callbacks(&self) -> &CallbackRegistry {
        &self.node().callbacks
    }

    // ============================================================================================
    // Checkpoints
    // ============================================================================================

    #[tracing::instrument(skip(self), fields(set = %self.handle()))]
    pub fn checkpoint(&self, regions: CheckpointRegions) -> Result<DeviceContext> {
        self.hierarchy.ensure_live()?;
        let started = Instant::now();
        let context = DeviceContext::from_snapshot(self.driver().checkpoint_save(self.handle(), regions.flags())?);
        pim_tracing::performance::record_checkpoint(
            "save",
            context.serialized_size(),
            started.elapsed().as_micros() as u64,
        );
        Ok(context)
    }

    #[tracing::instrument(skip(self, context), fields(set = %self.handle()))]
    pub fn restore(&self, context: &DeviceContext, regions: CheckpointRegions) -> Result<()> {
        self.hierarchy.ensure_live()?;
        Ok(self
            .driver()
            .checkpoint_restore(self.handle(), regions.flags(), context.snapshot())?)
    }
}

/// Entry point of every native callback invocation.
fn dispatch(
    hierarchy: &Weak<Hierarchy>,
    owner: usize,
    id: CallbackId,
    target: CallbackTarget,
    index: u32,
) -> pim_driver::Result<()> {
    // The registry is owned by the hierarchy, so a dropped hierarchy has no
    // registration left to complete.
    let hierarchy = hierarchy
        .upgrade()
        .ok_or_else(|| DriverError::callback("set released before its callback ran"))?;
    let node = &hierarchy.nodes[owner];
    let function = node
        .callbacks
        .function(id)
        .ok_or_else(|| DriverError::callback(format!("{id} is not registered")))?;

    let set = match target {
        CallbackTarget::WholeSet => Ok(owner),
        CallbackTarget::Rank(slot) => node
            .ranks
            .get(slot as usize)
            .copied()
            .ok_or_else(|| Error::Callback(format!("rank slot {slot} out of range"))),
    };
    let result = set.and_then(|set| {
        let set = ResourceSet {
            hierarchy: Arc::clone(&hierarchy),
            node: set,
        };
        function(&set, index)
    });

    // Counted even when the user function never ran.
    if node.callbacks.complete(id) == Completion::Finished {
        pim_tracing::perf_event!("callback_finished", id = id.id(), ok = result.is_ok());
    }
    result.map_err(|err| match err {
        Error::Callback(message) => DriverError::Callback(message),
        other => DriverError::callback(other),
    })
}

impl fmt::Debug for ResourceSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceSet")
            .field("kind", &self.kind())
            .field("handle", &self.handle())
            .field("units", &self.len())
            .field("released", &self.is_released())
            .finish()
    }
}

// ============================================================================
// Tests
// ============================================================================
