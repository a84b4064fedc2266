//! Callback registry
//!
//! A registration stores its function with a completion count: one per
//! rank of the registering set, or one for a single-call registration.
//! Rank workers may complete the same registration concurrently; the count
//! is only touched under the registry mutex and the context is removed by
//! whichever completion brings it to zero.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::Result;
use crate::set::ResourceSet;

/// Function invoked with the set it runs for and the invocation index.
pub(crate) type CallbackFn = Arc<dyn Fn(&ResourceSet, u32) -> Result<()> + Send + Sync>;

/// Identifier of a registration, unique within its set
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CallbackId(u64);

impl CallbackId {
    pub const fn id(self) -> u64 {
        self.0
    }
}

impl fmt::Display for CallbackId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "callback{}", self.0)
    }
}

/// How a callback is scheduled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallOptions {
    /// Overrides the set's default mode when present
    pub async_mode: Option<bool>,
    /// When false the callback runs off the rank worker; requires async
    pub blocking: bool,
    /// Call once for the whole set instead of once per rank
    pub single_call: bool,
}

impl Default for CallOptions {
    fn default() -> Self {
        Self {
            async_mode: None,
            blocking: true,
            single_call: false,
        }
    }
}

impl CallOptions {
    pub fn async_mode(mut self, async_mode: bool) -> Self {
        self.async_mode = Some(async_mode);
        self
    }

    pub fn blocking(mut self, blocking: bool) -> Self {
        self.blocking = blocking;
        self
    }

    pub fn single_call(mut self, single_call: bool) -> Self {
        self.single_call = single_call;
        self
    }
}

/// Outcome of one completed invocation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    /// Invocations still expected
    Pending(usize),
    /// Last invocation; the context was removed
    Finished,
    /// No such registration
    Unknown,
}

struct CallbackContext {
    function: CallbackFn,
    pending: usize,
}

#[derive(Default)]
struct RegistryState {
    next_id: u64,
    contexts: HashMap<CallbackId, CallbackContext>,
}

/// Live callback registrations of one set
#[derive(Default)]
pub struct CallbackRegistry {
    state: Mutex<RegistryState>,
}

impl CallbackRegistry {
    pub(crate) fn register(&self, function: CallbackFn, pending: usize) -> CallbackId {
        let mut state = self.state.lock();
        state.next_id += 1;
        let id = CallbackId(state.next_id);
        state.contexts.insert(id, CallbackContext { function, pending });
        id
    }

    pub(crate) fn function(&self, id: CallbackId) -> Option<CallbackFn> {
        self.state
            .lock()
            .contexts
            .get(&id)
            .map(|context| Arc::clone(&context.function))
    }

    pub(crate) fn complete(&self, id: CallbackId) -> Completion {
        let mut state = self.state.lock();
        let Some(context) = state.contexts.get_mut(&id) else {
            return Completion::Unknown;
        };
        context.pending = context.pending.saturating_sub(1);
        if context.pending > 0 {
            return Completion::Pending(context.pending);
        }
        state.contexts.remove(&id);
        Completion::Finished
    }

    /// Drop a registration the driver refused.
    pub(crate) fn cancel(&self, id: CallbackId) -> bool {
        self.state.lock().contexts.remove(&id).is_some()
    }

    /// Invocations still expected for `id`, `None` once it completed.
    pub fn pending(&self, id: CallbackId) -> Option<usize> {
        self.state.lock().contexts.get(&id).map(|context| context.pending)
    }

    /// Registrations not yet completed.
    pub fn len(&self) -> usize {
        self.state.lock().contexts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Debug for CallbackRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("CallbackRegistry")
            .field("next_id", &state.next_id)
            .field("live", &state.contexts.len())
            .finish()
    }
}

// ============================================================================
// Tests
// ============================================================================
