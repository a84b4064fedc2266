//! Allocation of a new hierarchy

use std::path::PathBuf;
use std::sync::Arc;

use pim_driver::{AllocRequest, Driver, ALLOCATE_ALL};

use super::{Hierarchy, HierarchyOptions, ResourceSet};
use crate::compiler::{Compiler, LoadRequest, SourceFile};
use crate::error::{Error, Result};
use crate::launch::LogSink;

/// Configures and allocates a [`ResourceSet`]
///
/// Every check that does not need the device runs before the first native
/// call. Once the allocation succeeded, any later failure (enumeration,
/// log sinks, initial load) releases it before the error is returned.
///
/// ```rust
/// use std::sync::Arc;
/// use pim_driver::{ProgramBuilder, SimConfig, SimDriver};
/// use pim_host::ResourceSet;
///
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let driver = Arc::new(SimDriver::new(SimConfig::small(1, 4))?);
/// let image = ProgramBuilder::new().symbol("counter", 0x100, 4).build();
///
/// let set = ResourceSet::builder()
///     .units(4)
///     .binary(image.to_bytes()?)
///     .allocate(driver)?;
/// assert_eq!(set.len(), 4);
/// assert!(set.symbols().contains("counter"));
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone, Default)]
pub struct SetBuilder {
    units: Option<u32>,
    ranks: Option<u32>,
    profile: String,
    async_mode: bool,
    binary: Option<Vec<u8>>,
    binary_file: Option<PathBuf>,
    sources: Vec<SourceFile>,
    log: Option<LogSink>,
    unit_logs: Option<Vec<Option<LogSink>>>,
    compiler: Option<Compiler>,
}

impl SetBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of units, or [`ALLOCATE_ALL`].
    pub fn units(mut self, count: u32) -> Self {
        self.units = Some(count);
        self
    }

    /// Number of whole ranks, or [`ALLOCATE_ALL`].
    pub fn ranks(mut self, count: u32) -> Self {
        self.ranks = Some(count);
        self
    }

    /// Pool selector handed to the driver, `key=value` pairs separated by
    /// commas.
    pub fn profile(mut self, profile: impl Into<String>) -> Self {
        self.profile = profile.into();
        self
    }

    /// Default mode of transfers, launches and callbacks on the new set.
    pub fn async_mode(mut self, async_mode: bool) -> Self {
        self.async_mode = async_mode;
        self
    }

    pub fn binary(mut self, bytes: impl Into<Vec<u8>>) -> Self {
        self.binary = Some(bytes.into());
        self
    }

    pub fn binary_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.binary_file = Some(path.into());
        self
    }

    pub fn source(mut self, source: SourceFile) -> Self {
        self.sources.push(source);
        self
    }

    pub fn sources(mut self, sources: impl IntoIterator<Item = SourceFile>) -> Self {
        self.sources.extend(sources);
        self
    }

    /// Sink of every unit. [`SetBuilder::unit_logs`] entries take
    /// precedence; a unit can later drop it with
    /// [`ResourceSet::set_log_sink`].
    pub fn log(mut self, sink: LogSink) -> Self {
        self.log = Some(sink);
        self
    }

    /// One sink per unit, in allocation order.
    pub fn unit_logs(mut self, sinks: Vec<Option<LogSink>>) -> Self {
        self.unit_logs = Some(sinks);
        self
    }

    pub fn compiler(mut self, compiler: Compiler) -> Self {
        self.compiler = Some(compiler);
        self
    }

    fn request(&self) -> Result<AllocRequest> {
        match (self.units, self.ranks) {
            (Some(units), Some(ranks)) => Err(Error::ConflictingAllocation { units, ranks }),
            (Some(units), None) => Ok(AllocRequest::Units(units)),
            (None, Some(ranks)) => Ok(AllocRequest::Ranks(ranks)),
            (None, None) => Ok(AllocRequest::Units(ALLOCATE_ALL)),
        }
    }

    fn load_request(&mut self) -> Result<Option<LoadRequest>> {
        let given = usize::from(self.binary.is_some())
            + usize::from(self.binary_file.is_some())
            + usize::from(!self.sources.is_empty());
        if given > 1 {
            return Err(Error::invalid_load_source(
                "binary, binary file and sources are mutually exclusive",
            ));
        }

        Ok(if let Some(bytes) = self.binary.take() {
            Some(LoadRequest::Binary(bytes))
        } else if let Some(path) = self.binary_file.take() {
            Some(LoadRequest::BinaryFile(path))
        } else if !self.sources.is_empty() {
            Some(LoadRequest::Sources(std::mem::take(&mut self.sources)))
        } else {
            None
        })
    }

    /// Allocate on `driver` and run the initial load, if any.
    #[tracing::instrument(skip_all, fields(units = ?self.units, ranks = ?self.ranks, profile = %self.profile))]
    pub fn allocate(mut self, driver: Arc<dyn Driver>) -> Result<ResourceSet> {
        let request = self.request()?;
        let load = self.load_request()?;

        let handle = driver.allocate(request, &self.profile)?;
        let options = HierarchyOptions {
            default_async: self.async_mode,
            compiler: self.compiler.take().unwrap_or_default(),
        };
        let hierarchy = match Hierarchy::build(Arc::clone(&driver), handle, options) {
            Ok(hierarchy) => hierarchy,
            Err(err) => {
                if let Err(free_err) = driver.free(handle) {
                    tracing::warn!(error = %free_err, "failed to free partially built set");
                }
                return Err(err);
            }
        };

        // From here on, dropping `set` releases the allocation.
        let set = ResourceSet { hierarchy, node: 0 };
        tracing::debug!(set = %set.handle(), units = set.len(), ranks = set.ranks().len(), "allocated");

        match (self.unit_logs.take(), self.log.take()) {
            (Some(sinks), log) => {
                let sinks = sinks.into_iter().map(|sink| sink.or_else(|| log.clone())).collect();
                set.set_unit_log_sinks(sinks)?;
            }
            (None, Some(log)) => set.set_log_sink(Some(log))?,
            (None, None) => {}
        }
        if let Some(load) = load {
            set.load(load)?;
        }
        Ok(set)
    }
}

// ============================================================================
// Tests
// ============================================================================
