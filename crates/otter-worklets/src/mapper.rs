//! Mapper engine: a small reactive dataflow graph.
//!
//! A [`Mapper`] is a closure plus declared input and output cells. Once per
//! frame the [`MapperRegistry`] ticks: every mapper that is dirty itself or
//! has a dirty input runs, its consumed inputs are marked clean and its
//! outputs are marked dirty, so mappers downstream run on a later pass of the
//! same tick.
//!
//! ## Tick passes
//!
//! A tick repeats passes until nothing is left to run or
//! [`WorkletConfig::max_mapper_passes`](crate::config::WorkletConfig) is
//! reached. Cyclic graphs (A feeds B feeds A) stop at the cap with a warning;
//! whatever is still dirty runs on the next tick.
//!
//! ## Failures
//!
//! A failing mapper is reported to the [`ErrorHandler`], stays dirty, and is
//! not retried until the next tick. After
//! `max_consecutive_mapper_failures` failures in a row it is disabled until
//! [`MapperRegistry::enable`] is called.

use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use tracing::{debug, trace, warn};

use crate::cell::CellSlab;
use crate::closure::Closure;
use crate::config::WorkletConfig;
use crate::error::{WorkletError, WorkletResult};
use crate::error_handler::{ErrorHandler, ErrorInfo, ErrorSource};
use crate::handle::Handle;
use crate::runtime::ScriptRuntime;

/// A registered mapper.
pub struct Mapper {
    id: Handle,
    owner: Handle,
    closure: Closure,
    inputs: Vec<Handle>,
    outputs: Vec<Handle>,
    dirty: AtomicBool,
    disabled: AtomicBool,
    consecutive_failures: AtomicU32,
    runs: AtomicU64,
}

impl Mapper {
    /// Create a mapper. It starts dirty so it runs on the first tick.
    pub fn new(
        id: Handle,
        owner: Handle,
        closure: Closure,
        inputs: Vec<Handle>,
        outputs: Vec<Handle>,
    ) -> Self {
        Self {
            id,
            owner,
            closure,
            inputs,
            outputs,
            dirty: AtomicBool::new(true),
            disabled: AtomicBool::new(false),
            consecutive_failures: AtomicU32::new(0),
            runs: AtomicU64::new(0),
        }
    }

    /// Mapper id.
    pub fn id(&self) -> Handle {
        self.id
    }

    /// Module or view that registered the mapper.
    pub fn owner(&self) -> Handle {
        self.owner
    }

    /// Input cells, in argument order.
    pub fn inputs(&self) -> &[Handle] {
        &self.inputs
    }

    /// Output cells.
    pub fn outputs(&self) -> &[Handle] {
        &self.outputs
    }

    /// Whether the mapper is scheduled to run regardless of its inputs.
    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    /// Force a run on the next tick.
    pub fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::Release);
    }

    /// Whether the failure policy switched this mapper off.
    pub fn is_disabled(&self) -> bool {
        self.disabled.load(Ordering::Acquire)
    }

    /// Successful executions so far.
    pub fn run_count(&self) -> u64 {
        self.runs.load(Ordering::Relaxed)
    }

    /// Failures since the last successful run.
    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::Relaxed)
    }

    /// Run the mapper body once on the calling thread.
    ///
    /// Must be called on the thread that owns `runtime`. The closure receives
    /// the current input values as positional arguments and writes its
    /// outputs through the runtime's cells.
    pub fn execute(&self, runtime: &dyn ScriptRuntime) -> WorkletResult<()> {
        let cells = runtime.cells();
        let args: Vec<Value> = self
            .inputs
            .iter()
            .map(|input| cells.get(*input).unwrap_or(Value::Null))
            .collect();
        self.closure.call(runtime, &args)?;
        self.runs.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn needs_run(&self, cells: &CellSlab) -> bool {
        !self.is_disabled()
            && (self.is_dirty() || self.inputs.iter().any(|input| cells.is_dirty(*input)))
    }
}

impl std::fmt::Debug for Mapper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mapper")
            .field("id", &self.id)
            .field("owner", &self.owner)
            .field("inputs", &self.inputs)
            .field("outputs", &self.outputs)
            .field("dirty", &self.is_dirty())
            .field("disabled", &self.is_disabled())
            .finish()
    }
}

/// Outcome of one [`MapperRegistry::tick`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Passes that ran at least one mapper
    pub passes: usize,
    /// Successful mapper executions
    pub executed: usize,
    /// Failed mapper executions
    pub failed: usize,
    /// Whether some enabled mapper still needs to run
    pub pending: bool,
}

/// Owns every mapper of a module and runs them once per frame.
pub struct MapperRegistry {
    mappers: Mutex<BTreeMap<Handle, Arc<Mapper>>>,
    error_handler: Arc<dyn ErrorHandler>,
    max_passes: usize,
    max_failures: Option<u32>,
}

impl MapperRegistry {
    /// Create an empty registry.
    pub fn new(error_handler: Arc<dyn ErrorHandler>, config: &WorkletConfig) -> Self {
        Self {
            mappers: Mutex::new(BTreeMap::new()),
            error_handler,
            max_passes: config.max_mapper_passes.max(1),
            max_failures: config.max_consecutive_mapper_failures,
        }
    }

    /// Register a mapper under `id`.
    pub fn add(
        &self,
        owner: Handle,
        id: Handle,
        closure: Closure,
        inputs: Vec<Handle>,
        outputs: Vec<Handle>,
    ) -> WorkletResult<Arc<Mapper>> {
        let mut mappers = self.mappers.lock();
        if mappers.contains_key(&id) {
            return Err(WorkletError::DuplicateId(id));
        }
        let mapper = Arc::new(Mapper::new(id, owner, closure, inputs, outputs));
        mappers.insert(id, mapper.clone());
        debug!(%id, %owner, "Mapper registered");
        Ok(mapper)
    }

    /// Unregister a mapper. Unknown ids are ignored.
    pub fn remove(&self, id: Handle) -> bool {
        let removed = self.mappers.lock().remove(&id);
        match removed {
            Some(_) => {
                debug!(%id, "Mapper removed");
                true
            }
            None => {
                debug!(%id, "Remove of unknown mapper ignored");
                false
            }
        }
    }

    /// Unregister every mapper added by `owner`.
    pub fn remove_owner(&self, owner: Handle) -> usize {
        let removed: Vec<Arc<Mapper>> = {
            let mut mappers = self.mappers.lock();
            let ids: Vec<Handle> = mappers
                .values()
                .filter(|m| m.owner == owner)
                .map(|m| m.id)
                .collect();
            ids.iter().filter_map(|id| mappers.remove(id)).collect()
        };
        removed.len()
    }

    /// Look up a mapper.
    pub fn get(&self, id: Handle) -> Option<Arc<Mapper>> {
        self.mappers.lock().get(&id).cloned()
    }

    /// Whether a mapper is registered under `id`.
    pub fn contains(&self, id: Handle) -> bool {
        self.mappers.lock().contains_key(&id)
    }

    /// Re-enable a mapper disabled by the failure policy. It runs on the next tick.
    pub fn enable(&self, id: Handle) -> bool {
        match self.get(id) {
            Some(mapper) => {
                mapper.consecutive_failures.store(0, Ordering::Relaxed);
                mapper.disabled.store(false, Ordering::Release);
                mapper.mark_dirty();
                true
            }
            None => false,
        }
    }

    /// Number of registered mappers.
    pub fn len(&self) -> usize {
        self.mappers.lock().len()
    }

    /// Whether no mapper is registered.
    pub fn is_empty(&self) -> bool {
        self.mappers.lock().is_empty()
    }

    /// Drop every mapper.
    pub fn clear(&self) {
        let removed = std::mem::take(&mut *self.mappers.lock());
        drop(removed);
    }

    /// Whether any enabled mapper would run on the next tick.
    pub fn has_pending(&self, cells: &CellSlab) -> bool {
        self.snapshot().iter().any(|m| m.needs_run(cells))
    }

    fn snapshot(&self) -> Vec<Arc<Mapper>> {
        self.mappers.lock().values().cloned().collect()
    }

    /// Run one frame's worth of mapper passes on `runtime`.
    ///
    /// Never fails; mapper errors go to the error handler.
    pub fn tick(&self, runtime: &dyn ScriptRuntime) -> TickReport {
        let cells = runtime.cells();
        let mut report = TickReport::default();
        let mut failed_this_tick: HashSet<Handle> = HashSet::new();
        let mut capped = true;

        for pass in 0..self.max_passes {
            let selected: Vec<Arc<Mapper>> = self
                .snapshot()
                .into_iter()
                .filter(|m| !failed_this_tick.contains(&m.id) && m.needs_run(cells))
                .collect();

            if selected.is_empty() {
                capped = false;
                break;
            }

            trace!(pass, count = selected.len(), "Mapper pass");
            report.passes += 1;

            // Consume the inputs for the whole pass up front: a write made by
            // an earlier mapper in this pass must show up on the next pass.
            for mapper in &selected {
                mapper.dirty.store(false, Ordering::Release);
                for input in &mapper.inputs {
                    cells.clear_dirty(*input);
                }
            }

            for mapper in selected {
                if !self.contains(mapper.id) {
                    continue;
                }
                match mapper.execute(runtime) {
                    Ok(()) => {
                        mapper.consecutive_failures.store(0, Ordering::Relaxed);
                        for output in &mapper.outputs {
                            cells.mark_dirty(*output);
                        }
                        report.executed += 1;
                    }
                    Err(err) => {
                        report.failed += 1;
                        failed_this_tick.insert(mapper.id);
                        self.record_failure(&mapper, err);
                    }
                }
            }
        }

        let pending_now = self
            .snapshot()
            .iter()
            .any(|m| !failed_this_tick.contains(&m.id) && m.needs_run(cells));
        if capped && pending_now {
            warn!(
                passes = self.max_passes,
                "Mapper tick hit the pass limit with mappers still dirty (cyclic mapper graph?)"
            );
        }
        report.pending = self.has_pending(cells);
        report
    }

    fn record_failure(&self, mapper: &Mapper, err: WorkletError) {
        mapper.mark_dirty();
        let failures = mapper.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
        if let Some(limit) = self.max_failures
            && failures >= limit
        {
            mapper.disabled.store(true, Ordering::Release);
            warn!(id = %mapper.id, failures, "Mapper disabled after repeated failures");
        }
        self.error_handler.report_error(ErrorInfo::new(
            ErrorSource::Mapper(mapper.id),
            err.into_script_error(),
        ));
    }
}

impl std::fmt::Debug for MapperRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MapperRegistry")
            .field("mappers", &self.len())
            .field("max_passes", &self.max_passes)
            .field("max_failures", &self.max_failures)
            .finish()
    }
}
