//! The worklet module: one embedding context owning every registry.
//!
//! A [`WorkletModule`] is what the host creates per script engine instance.
//! It owns the handle allocator, the cell slab, the value store, the mapper
//! and event registries and the frame-callback queue. Nothing is global, so
//! several modules (or tests) can live side by side.
//!
//! Frame flow:
//!
//! ```text
//! request_animation_frame / start_mapper
//!         │
//!         ▼
//! maybe_request_render ──► platform render requester (once per frame)
//!                                   │
//!                                   ▼
//!                          on_render(runtime, ts)
//!                            ├─ frame callbacks
//!                            └─ mapper tick
//! ```

use parking_lot::Mutex;
use serde_json::Value;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, warn};

use crate::cell::CellSlab;
use crate::closure::Closure;
use crate::config::WorkletConfig;
use crate::error::{ScriptError, WorkletError, WorkletResult};
use crate::error_handler::{ErrorHandler, ErrorInfo, ErrorSource};
use crate::event::{EventHandlerRegistry, WorkletEventHandler};
use crate::handle::{Handle, HandleAllocator};
use crate::mapper::{MapperRegistry, TickReport};
use crate::runtime::{RuntimeId, RuntimeKind, ScriptRuntime, WorkletRuntime};
use crate::scheduler::{Job, Scheduler};
use crate::store::{StoredRef, ValueStore};

/// Platform hook asking for `on_render` to be called on the next frame.
pub type RenderRequester = Box<dyn Fn() + Send + Sync + 'static>;

/// Embedding context for worklets, mappers and event handlers.
pub struct WorkletModule {
    config: WorkletConfig,
    handles: Arc<HandleAllocator>,
    next_runtime_id: AtomicU64,
    cells: Arc<CellSlab>,
    store: ValueStore<Value>,
    mappers: MapperRegistry,
    events: Arc<EventHandlerRegistry>,
    frame_callbacks: Mutex<Vec<Closure>>,
    render_requested: AtomicBool,
    request_render: Option<RenderRequester>,
    scheduler: Weak<dyn Scheduler>,
    error_handler: Arc<dyn ErrorHandler>,
}

impl WorkletModule {
    /// Create a module.
    ///
    /// Only a weak reference to `scheduler` is kept; the embedder controls
    /// its lifetime.
    pub fn new<S>(
        config: WorkletConfig,
        scheduler: &Arc<S>,
        error_handler: Arc<dyn ErrorHandler>,
    ) -> Self
    where
        S: Scheduler + 'static,
    {
        let weak: Weak<S> = Arc::downgrade(scheduler);
        let handles = Arc::new(HandleAllocator::new());
        Self {
            mappers: MapperRegistry::new(error_handler.clone(), &config),
            events: Arc::new(EventHandlerRegistry::new(error_handler.clone())),
            store: ValueStore::with_allocator(handles.clone()),
            handles,
            next_runtime_id: AtomicU64::new(1),
            cells: Arc::new(CellSlab::new()),
            frame_callbacks: Mutex::new(Vec::new()),
            render_requested: AtomicBool::new(false),
            request_render: None,
            scheduler: weak,
            error_handler,
            config,
        }
    }

    /// Install the platform render requester.
    pub fn with_render_requester<F>(mut self, request_render: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.request_render = Some(Box::new(request_render));
        self
    }

    /// Module configuration.
    pub fn config(&self) -> &WorkletConfig {
        &self.config
    }

    /// Create a runtime handle bound to this module's cells.
    pub fn create_runtime(&self, kind: RuntimeKind) -> WorkletRuntime {
        let id = RuntimeId::from_raw(self.next_runtime_id.fetch_add(1, Ordering::Relaxed));
        debug!(runtime = %id, ?kind, "Runtime created");
        WorkletRuntime::new(id, kind, self.cells.clone())
    }

    /// Allocate a fresh handle (e.g. an owner id for a native view).
    pub fn allocate_handle(&self) -> Handle {
        self.handles.allocate()
    }

    // ==================== Mutable Values ====================

    /// Shared cell storage.
    pub fn cells(&self) -> &Arc<CellSlab> {
        &self.cells
    }

    /// Create a mutable value cell.
    pub fn make_mutable(&self, initial: Value) -> Handle {
        let handle = self.handles.allocate();
        let inserted = self.cells.insert(handle, initial);
        debug_assert!(inserted.is_ok(), "fresh handle {handle} already occupied");
        handle
    }

    /// Current value of a cell.
    pub fn mutable_value(&self, cell: Handle) -> Option<Value> {
        self.cells.get(cell)
    }

    /// Write a cell and request a frame so dependent mappers run.
    pub fn set_mutable_value(&self, cell: Handle, value: Value) -> WorkletResult<()> {
        self.cells.set(cell, value)?;
        if !self.mappers.is_empty() {
            self.maybe_request_render();
        }
        Ok(())
    }

    /// Remove a cell. Mappers still naming it read `null` from then on.
    pub fn remove_mutable(&self, cell: Handle) -> bool {
        self.cells.remove(cell).is_some()
    }

    // ==================== Mappers ====================

    /// Register a mapper reading `inputs` and writing `outputs`.
    ///
    /// Every cell must exist. The mapper runs on the next frame.
    pub fn start_mapper(
        &self,
        owner: Handle,
        closure: Closure,
        inputs: Vec<Handle>,
        outputs: Vec<Handle>,
    ) -> WorkletResult<Handle> {
        if let Some(missing) = inputs
            .iter()
            .chain(outputs.iter())
            .find(|cell| !self.cells.contains(**cell))
        {
            return Err(WorkletError::UnknownHandle(*missing));
        }

        let id = self.handles.allocate();
        self.mappers.add(owner, id, closure, inputs, outputs)?;
        self.maybe_request_render();
        Ok(id)
    }

    /// Unregister a mapper. Unknown ids are ignored.
    pub fn stop_mapper(&self, id: Handle) -> bool {
        self.mappers.remove(id)
    }

    /// The mapper registry.
    pub fn mappers(&self) -> &MapperRegistry {
        &self.mappers
    }

    // ==================== Events ====================

    /// Register an event handler.
    ///
    /// The id is returned immediately; the registration itself is posted to
    /// the UI thread, so the handler receives events once the UI queue has
    /// run the job.
    pub fn register_event_handler(
        &self,
        event_name: impl Into<String>,
        closure: Closure,
    ) -> WorkletResult<Handle> {
        self.schedule_registration(event_name.into(), None, closure)
    }

    /// Register an event handler that only receives events emitted by the
    /// view with `emitter_tag`. Registration is posted to the UI thread.
    pub fn register_emitter_event_handler(
        &self,
        event_name: impl Into<String>,
        emitter_tag: i32,
        closure: Closure,
    ) -> WorkletResult<Handle> {
        self.schedule_registration(event_name.into(), Some(emitter_tag), closure)
    }

    fn schedule_registration(
        &self,
        event_name: String,
        emitter_tag: Option<i32>,
        closure: Closure,
    ) -> WorkletResult<Handle> {
        let scheduler = self.scheduler()?;
        let id = self.handles.allocate();
        let mut handler = WorkletEventHandler::new(id, event_name, closure);
        if let Some(tag) = emitter_tag {
            handler = handler.for_emitter(tag);
        }
        let events = self.events.clone();
        scheduler.schedule_on_ui(Box::new(move || {
            if let Err(err) = events.register_event_handler(handler) {
                warn!(error = %err, "Scheduled event handler registration failed");
            }
        }));
        Ok(id)
    }

    /// Unregister an event handler on the UI thread.
    pub fn unregister_event_handler(&self, id: Handle) -> WorkletResult<()> {
        let scheduler = self.scheduler()?;
        let events = self.events.clone();
        scheduler.schedule_on_ui(Box::new(move || {
            events.unregister_event_handler(id);
        }));
        Ok(())
    }

    /// Dispatch a native event. Returns how many handlers ran successfully.
    ///
    /// Requests a frame when the handlers left a mapper with work to do.
    pub fn on_event(
        &self,
        runtime: &dyn ScriptRuntime,
        timestamp: f64,
        event_name: &str,
        payload: &Value,
    ) -> usize {
        let ran = self
            .events
            .process_event_at(runtime, timestamp, event_name, payload);
        self.request_render_if_mappers_pending(runtime);
        ran
    }

    /// Dispatch a native event emitted by the view with `emitter_tag`.
    pub fn on_emitter_event(
        &self,
        runtime: &dyn ScriptRuntime,
        timestamp: f64,
        event_name: &str,
        emitter_tag: i32,
        payload: &Value,
    ) -> usize {
        let ran = self.events.process_emitter_event(
            runtime,
            timestamp,
            event_name,
            emitter_tag,
            payload,
        );
        self.request_render_if_mappers_pending(runtime);
        ran
    }

    /// Dispatch an event straight from the renderer. Native event types use
    /// a `top` prefix (`topScroll`) where handlers subscribe to `onScroll`.
    pub fn handle_raw_event(
        &self,
        runtime: &dyn ScriptRuntime,
        timestamp: f64,
        event_type: &str,
        emitter_tag: i32,
        payload: &Value,
    ) -> usize {
        let event_name = handler_event_name(event_type);
        self.on_emitter_event(runtime, timestamp, &event_name, emitter_tag, payload)
    }

    /// Whether any handler listens to `event_name`. Event producers use this
    /// to skip building payloads nobody will read.
    pub fn is_any_handler_waiting_for_event(&self, event_name: &str) -> bool {
        self.events.is_any_handler_waiting_for_event(event_name)
    }

    /// Whether any handler would receive `event_name` from `emitter_tag`.
    pub fn is_any_handler_waiting_for_emitter(&self, event_name: &str, emitter_tag: i32) -> bool {
        self.events
            .is_any_handler_waiting_for_emitter(event_name, emitter_tag)
    }

    fn request_render_if_mappers_pending(&self, runtime: &dyn ScriptRuntime) {
        if !self.mappers.is_empty() && self.mappers.has_pending(runtime.cells()) {
            self.maybe_request_render();
        }
    }

    /// The event handler registry.
    pub fn event_handlers(&self) -> &EventHandlerRegistry {
        &self.events
    }

    // ==================== Frames ====================

    /// Queue `callback` for the next frame. It receives the frame timestamp.
    pub fn request_animation_frame(&self, callback: Closure) {
        self.frame_callbacks.lock().push(callback);
        self.maybe_request_render();
    }

    /// Ask the platform for a frame unless one is already pending.
    pub fn maybe_request_render(&self) {
        if !self.render_requested.swap(true, Ordering::AcqRel)
            && let Some(request_render) = &self.request_render
        {
            request_render();
        }
    }

    /// Whether a frame has been requested and not yet rendered.
    pub fn is_render_requested(&self) -> bool {
        self.render_requested.load(Ordering::Acquire)
    }

    /// Frame entry point: run queued frame callbacks, then tick the mappers.
    pub fn on_render(&self, runtime: &dyn ScriptRuntime, timestamp_ms: f64) -> TickReport {
        self.render_requested.store(false, Ordering::Release);

        let callbacks = std::mem::take(&mut *self.frame_callbacks.lock());
        let timestamp = Value::from(timestamp_ms);
        for callback in callbacks {
            if let Err(err) = callback.call(runtime, std::slice::from_ref(&timestamp)) {
                self.error_handler.report_error(ErrorInfo::new(
                    ErrorSource::FrameCallback,
                    err.into_script_error(),
                ));
            }
        }

        let report = self.mappers.tick(runtime);
        if report.pending && self.config.rerender_on_pending_mappers {
            self.maybe_request_render();
        }
        report
    }

    // ==================== Scheduling ====================

    /// Post `job` to the UI thread. A panic in the job is reported to the
    /// error handler as [`ErrorSource::ScheduledJob`].
    pub fn run_on_ui<F>(&self, job: F) -> WorkletResult<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.scheduler()?.schedule_on_ui(self.guarded(job));
        Ok(())
    }

    /// Post `job` to the JS thread, reporting panics like [`run_on_ui`](Self::run_on_ui).
    pub fn run_on_js<F>(&self, job: F) -> WorkletResult<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.scheduler()?.schedule_on_js(self.guarded(job));
        Ok(())
    }

    /// Run `worklet` with `args` on `runtime` from the UI queue.
    ///
    /// Script errors, runtime mismatches and panics are reported as
    /// [`ErrorSource::ScheduledJob`].
    pub fn run_worklet_on_ui(
        &self,
        runtime: WorkletRuntime,
        worklet: Closure,
        args: Vec<Value>,
    ) -> WorkletResult<()> {
        let error_handler = self.error_handler.clone();
        self.run_on_ui(move || {
            if let Err(err) = worklet.call(&runtime, &args) {
                error_handler.report_error(ErrorInfo::new(
                    ErrorSource::ScheduledJob,
                    err.into_script_error(),
                ));
            }
        })
    }

    fn guarded<F>(&self, job: F) -> Job
    where
        F: FnOnce() + Send + 'static,
    {
        let error_handler = self.error_handler.clone();
        Box::new(move || {
            if let Err(panic) = catch_unwind(AssertUnwindSafe(job)) {
                error_handler.report_error(ErrorInfo::new(
                    ErrorSource::ScheduledJob,
                    ScriptError::from_panic(panic.as_ref()),
                ));
            }
        })
    }

    fn scheduler(&self) -> WorkletResult<Arc<dyn Scheduler>> {
        self.scheduler.upgrade().ok_or(WorkletError::SchedulerGone)
    }

    // ==================== Value Store ====================

    /// Keep `value` alive under `owner`.
    pub fn retain_value(&self, owner: Handle, value: Value) -> Handle {
        self.store.retain(owner, value)
    }

    /// Non-owning reference to a retained value.
    pub fn value_ref(&self, handle: Handle) -> StoredRef<Value> {
        self.store.get_weak_ref(handle)
    }

    /// Release everything `owner` retained and every mapper it registered.
    pub fn release_owner(&self, owner: Handle) -> usize {
        let mappers = self.mappers.remove_owner(owner);
        if mappers > 0 {
            debug!(%owner, mappers, "Owner mappers removed");
        }
        self.store.remove_refs(owner)
    }

    /// The value store.
    pub fn store(&self) -> &ValueStore<Value> {
        &self.store
    }

    // ==================== Teardown ====================

    /// Drop everything that holds script values. Safe to call repeatedly;
    /// also runs on drop.
    pub fn teardown(&self) {
        self.events.clear();
        self.frame_callbacks.lock().clear();
        self.mappers.clear();
        self.store.clear_store();
        self.cells.clear();
        self.render_requested.store(false, Ordering::Release);
        debug!("Worklet module torn down");
    }
}

/// Map a renderer event type to the name handlers subscribe with.
fn handler_event_name(event_type: &str) -> String {
    match event_type.strip_prefix("top") {
        Some(rest) => format!("on{rest}"),
        None => event_type.to_string(),
    }
}

impl Drop for WorkletModule {
    fn drop(&mut self) {
        self.teardown();
    }
}

impl std::fmt::Debug for WorkletModule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkletModule")
            .field("cells", &self.cells.len())
            .field("mappers", &self.mappers.len())
            .field("event_handlers", &self.events.len())
            .field("stored_values", &self.store.len())
            .field("frame_callbacks", &self.frame_callbacks.lock().len())
            .field("render_requested", &self.is_render_requested())
            .finish()
    }
}
