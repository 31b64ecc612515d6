//! Event handler registry.
//!
//! Native views emit events by name (`onScroll`, `onGestureHandlerEvent`...).
//! Worklets subscribe with a closure. The registry keeps two indexes, by id
//! for removal and by event name for dispatch, and updates both under one
//! lock.
//!
//! Dispatch copies the matching handlers out of the index and invokes them
//! with the lock released, so a handler may unregister itself (or others)
//! while the event is being processed.
//!
//! A handler may be scoped to one emitter (the native view tag). Scoped
//! handlers only see events from that view; unscoped handlers see the event
//! from every emitter.
//!
//! Dispatches are serialized by a second, reentrant lock: at most one thread
//! calls into the script runtime through a registry at a time, while a
//! handler may still dispatch a nested event on its own thread.

use parking_lot::{Mutex, ReentrantMutex};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, trace};

use crate::closure::Closure;
use crate::error::{WorkletError, WorkletResult};
use crate::error_handler::{ErrorHandler, ErrorInfo, ErrorSource};
use crate::handle::Handle;
use crate::runtime::ScriptRuntime;

/// A worklet subscribed to one event name.
#[derive(Debug, Clone)]
pub struct WorkletEventHandler {
    id: Handle,
    event_name: String,
    emitter_tag: Option<i32>,
    closure: Closure,
}

impl WorkletEventHandler {
    /// Create a handler.
    pub fn new(id: Handle, event_name: impl Into<String>, closure: Closure) -> Self {
        Self {
            id,
            event_name: event_name.into(),
            emitter_tag: None,
            closure,
        }
    }

    /// Only receive events emitted by the view with `tag`.
    pub fn for_emitter(mut self, tag: i32) -> Self {
        self.emitter_tag = Some(tag);
        self
    }

    /// Handler id.
    pub fn id(&self) -> Handle {
        self.id
    }

    /// Event this handler listens to.
    pub fn event_name(&self) -> &str {
        &self.event_name
    }

    /// Emitter this handler is scoped to; `None` listens to every emitter.
    pub fn emitter_tag(&self) -> Option<i32> {
        self.emitter_tag
    }

    /// Whether an event from `emitter` reaches this handler.
    pub fn accepts(&self, emitter: Option<i32>) -> bool {
        match (self.emitter_tag, emitter) {
            (None, _) | (_, None) => true,
            (Some(own), Some(other)) => own == other,
        }
    }

    /// The worklet.
    pub fn closure(&self) -> &Closure {
        &self.closure
    }

    /// Invoke the worklet with the event payload (and timestamp, if known).
    pub fn process(
        &self,
        runtime: &dyn ScriptRuntime,
        timestamp: Option<f64>,
        payload: &Value,
    ) -> WorkletResult<Value> {
        match timestamp {
            Some(ts) => self
                .closure
                .call(runtime, &[payload.clone(), Value::from(ts)]),
            None => self.closure.call(runtime, std::slice::from_ref(payload)),
        }
    }
}

#[derive(Default)]
struct Indexes {
    by_id: HashMap<Handle, Arc<WorkletEventHandler>>,
    by_name: HashMap<String, BTreeMap<Handle, Arc<WorkletEventHandler>>>,
}

/// Registry of event handlers for one module.
pub struct EventHandlerRegistry {
    indexes: Mutex<Indexes>,
    dispatching: ReentrantMutex<()>,
    error_handler: Arc<dyn ErrorHandler>,
}

impl EventHandlerRegistry {
    /// Create an empty registry reporting failures to `error_handler`.
    pub fn new(error_handler: Arc<dyn ErrorHandler>) -> Self {
        Self {
            indexes: Mutex::new(Indexes::default()),
            dispatching: ReentrantMutex::new(()),
            error_handler,
        }
    }

    /// Add a handler. Fails if its id is already registered.
    pub fn register_event_handler(&self, handler: WorkletEventHandler) -> WorkletResult<()> {
        let id = handler.id;
        let mut indexes = self.indexes.lock();
        if indexes.by_id.contains_key(&id) {
            return Err(WorkletError::DuplicateId(id));
        }

        let handler = Arc::new(handler);
        indexes
            .by_name
            .entry(handler.event_name.clone())
            .or_default()
            .insert(id, handler.clone());
        debug!(%id, event = %handler.event_name, "Event handler registered");
        indexes.by_id.insert(id, handler);
        Ok(())
    }

    /// Remove a handler. Unknown ids are ignored; returns whether anything
    /// was removed.
    pub fn unregister_event_handler(&self, id: Handle) -> bool {
        let removed = {
            let mut indexes = self.indexes.lock();
            let Some(handler) = indexes.by_id.remove(&id) else {
                trace!(%id, "Unregister of unknown event handler ignored");
                return false;
            };
            if let Some(handlers) = indexes.by_name.get_mut(&handler.event_name) {
                handlers.remove(&id);
                if handlers.is_empty() {
                    indexes.by_name.remove(&handler.event_name);
                }
            }
            handler
        };
        debug!(%id, event = %removed.event_name, "Event handler unregistered");
        true
    }

    /// Whether any handler listens to `event_name`.
    pub fn is_any_handler_waiting_for_event(&self, event_name: &str) -> bool {
        self.indexes.lock().by_name.contains_key(event_name)
    }

    /// Whether a handler would receive `event_name` emitted by the view with
    /// `emitter_tag`.
    pub fn is_any_handler_waiting_for_emitter(&self, event_name: &str, emitter_tag: i32) -> bool {
        self.indexes
            .lock()
            .by_name
            .get(event_name)
            .is_some_and(|handlers| handlers.values().any(|h| h.accepts(Some(emitter_tag))))
    }

    /// Handlers currently registered for `event_name`, in dispatch order.
    pub fn handlers_for(&self, event_name: &str) -> Vec<Arc<WorkletEventHandler>> {
        self.handlers_matching(event_name, None)
    }

    /// Handlers that receive `event_name` from the view with `emitter_tag`.
    pub fn handlers_for_emitter(
        &self,
        event_name: &str,
        emitter_tag: i32,
    ) -> Vec<Arc<WorkletEventHandler>> {
        self.handlers_matching(event_name, Some(emitter_tag))
    }

    fn handlers_matching(
        &self,
        event_name: &str,
        emitter: Option<i32>,
    ) -> Vec<Arc<WorkletEventHandler>> {
        self.indexes
            .lock()
            .by_name
            .get(event_name)
            .map(|handlers| {
                handlers
                    .values()
                    .filter(|h| h.accepts(emitter))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Dispatch an event to every handler registered for `event_name`.
    ///
    /// Returns how many handlers ran successfully. Failures are reported to
    /// the error handler and never stop the remaining handlers.
    pub fn process_event(
        &self,
        runtime: &dyn ScriptRuntime,
        event_name: &str,
        payload: &Value,
    ) -> usize {
        self.dispatch(runtime, None, event_name, None, payload)
    }

    /// Like [`process_event`](Self::process_event), also passing the event
    /// timestamp as the second argument.
    pub fn process_event_at(
        &self,
        runtime: &dyn ScriptRuntime,
        timestamp: f64,
        event_name: &str,
        payload: &Value,
    ) -> usize {
        self.dispatch(runtime, Some(timestamp), event_name, None, payload)
    }

    /// Dispatch an event emitted by the view with `emitter_tag`.
    ///
    /// Reaches handlers scoped to that view and every unscoped handler.
    pub fn process_emitter_event(
        &self,
        runtime: &dyn ScriptRuntime,
        timestamp: f64,
        event_name: &str,
        emitter_tag: i32,
        payload: &Value,
    ) -> usize {
        self.dispatch(runtime, Some(timestamp), event_name, Some(emitter_tag), payload)
    }

    fn dispatch(
        &self,
        runtime: &dyn ScriptRuntime,
        timestamp: Option<f64>,
        event_name: &str,
        emitter: Option<i32>,
        payload: &Value,
    ) -> usize {
        // snapshot under the dispatch lock so an unregister made by an
        // earlier dispatch is visible here
        let _dispatching = self.dispatching.lock();
        let handlers = self.handlers_matching(event_name, emitter);
        if handlers.is_empty() {
            return 0;
        }

        trace!(event = event_name, ?emitter, count = handlers.len(), "Dispatching event");
        let mut succeeded = 0;
        for handler in handlers {
            match handler.process(runtime, timestamp, payload) {
                Ok(_) => succeeded += 1,
                Err(err) => self.error_handler.report_error(ErrorInfo::new(
                    ErrorSource::EventHandler {
                        id: handler.id,
                        event_name: handler.event_name.clone(),
                    },
                    err.into_script_error(),
                )),
            }
        }
        succeeded
    }

    /// Number of registered handlers.
    pub fn len(&self) -> usize {
        self.indexes.lock().by_id.len()
    }

    /// Whether no handler is registered.
    pub fn is_empty(&self) -> bool {
        self.indexes.lock().by_id.is_empty()
    }

    /// Remove every handler.
    pub fn clear(&self) {
        let taken = std::mem::take(&mut *self.indexes.lock());
        drop(taken);
    }
}

impl std::fmt::Debug for EventHandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let indexes = self.indexes.lock();
        f.debug_struct("EventHandlerRegistry")
            .field("handlers", &indexes.by_id.len())
            .field("events", &indexes.by_name.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cell::CellSlab;
    use crate::error::ScriptError;
    use crate::error_handler::CapturingErrorHandler;
    use crate::runtime::{RuntimeId, RuntimeKind, WorkletRuntime};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    fn setup() -> (WorkletRuntime, Arc<CapturingErrorHandler>, EventHandlerRegistry) {
        let runtime = WorkletRuntime::new(
            RuntimeId::from_raw(1),
            RuntimeKind::Ui,
            Arc::new(CellSlab::new()),
        );
        let errors = Arc::new(CapturingErrorHandler::new());
        let registry = EventHandlerRegistry::new(errors.clone());
        (runtime, errors, registry)
    }

    fn counting(runtime: &WorkletRuntime, id: u64, event: &str, counter: Arc<AtomicUsize>) -> WorkletEventHandler {
        let closure = Closure::new(runtime.id(), move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(Value::Null)
        });
        WorkletEventHandler::new(Handle::from_raw(id), event, closure)
    }

    fn assert_consistent(registry: &EventHandlerRegistry) {
        let indexes = registry.indexes.lock();
        let mut named = 0;
        for (name, handlers) in &indexes.by_name {
            assert!(!handlers.is_empty(), "empty bucket left for {}", name);
            for (id, handler) in handlers {
                let primary = indexes.by_id.get(id).expect("name index entry missing from id index");
                assert!(Arc::ptr_eq(primary, handler));
                assert_eq!(&handler.event_name, name);
                named += 1;
            }
        }
        assert_eq!(named, indexes.by_id.len());
    }

    #[test]
    fn test_register_and_dispatch_all() {
        let (rt, errors, registry) = setup();
        let counter = Arc::new(AtomicUsize::new(0));
        for id in [5, 1, 3] {
            registry
                .register_event_handler(counting(&rt, id, "onScroll", counter.clone()))
                .unwrap();
        }
        registry
            .register_event_handler(counting(&rt, 9, "onTouch", Arc::new(AtomicUsize::new(0))))
            .unwrap();

        assert_eq!(registry.process_event(&rt, "onScroll", &json!({})), 3);
        assert_eq!(counter.load(Ordering::SeqCst), 3);
        assert!(!errors.has_error());
        assert_consistent(&registry);
    }

    #[test]
    fn test_duplicate_registration_fails() {
        let (rt, _errors, registry) = setup();
        let counter = Arc::new(AtomicUsize::new(0));
        registry
            .register_event_handler(counting(&rt, 1, "a", counter.clone()))
            .unwrap();
        let result = registry.register_event_handler(counting(&rt, 1, "b", counter));
        assert!(matches!(result, Err(WorkletError::DuplicateId(_))));
        assert!(!registry.is_any_handler_waiting_for_event("b"));
        assert_consistent(&registry);
    }

    #[test]
    fn test_unregister_is_idempotent() {
        let (rt, _errors, registry) = setup();
        registry
            .register_event_handler(counting(&rt, 1, "onScroll", Arc::new(AtomicUsize::new(0))))
            .unwrap();

        assert!(registry.unregister_event_handler(Handle::from_raw(1)));
        assert!(!registry.unregister_event_handler(Handle::from_raw(1)));
        assert!(!registry.unregister_event_handler(Handle::from_raw(77)));
        assert!(registry.is_empty());
        assert!(!registry.is_any_handler_waiting_for_event("onScroll"));
    }

    #[test]
    fn test_failing_handler_does_not_stop_others() {
        let (rt, errors, registry) = setup();
        let counter = Arc::new(AtomicUsize::new(0));
        registry
            .register_event_handler(counting(&rt, 1, "onScroll", counter.clone()))
            .unwrap();
        let failing = Closure::new(rt.id(), |_, _| Err(ScriptError::new("handler threw")));
        registry
            .register_event_handler(WorkletEventHandler::new(Handle::from_raw(2), "onScroll", failing))
            .unwrap();
        registry
            .register_event_handler(counting(&rt, 3, "onScroll", counter.clone()))
            .unwrap();

        assert_eq!(registry.process_event(&rt, "onScroll", &json!({"y": 1})), 2);
        assert_eq!(counter.load(Ordering::SeqCst), 2);

        let report = errors.last_error().unwrap();
        assert_eq!(
            report.source,
            ErrorSource::EventHandler {
                id: Handle::from_raw(2),
                event_name: "onScroll".to_string(),
            }
        );
        assert_eq!(report.error.message, "handler threw");
    }

    #[test]
    fn test_handler_can_unregister_itself_mid_dispatch() {
        let (rt, _errors, registry) = setup();
        let registry = Arc::new(registry);
        let counter = Arc::new(AtomicUsize::new(0));

        let weak = Arc::downgrade(&registry);
        let self_removing = Closure::new(rt.id(), move |_, _| {
            if let Some(registry) = weak.upgrade() {
                registry.unregister_event_handler(Handle::from_raw(1));
            }
            Ok(Value::Null)
        });
        registry
            .register_event_handler(WorkletEventHandler::new(Handle::from_raw(1), "onEnd", self_removing))
            .unwrap();
        registry
            .register_event_handler(counting(&rt, 2, "onEnd", counter.clone()))
            .unwrap();

        assert_eq!(registry.process_event(&rt, "onEnd", &Value::Null), 2);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.process_event(&rt, "onEnd", &Value::Null), 1);
        assert_consistent(&registry);
    }

    #[test]
    fn test_timestamp_is_second_argument() {
        let (rt, _errors, registry) = setup();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_in = seen.clone();
        let closure = Closure::new(rt.id(), move |_, args| {
            seen_in.lock().push(args.to_vec());
            Ok(Value::Null)
        });
        registry
            .register_event_handler(WorkletEventHandler::new(Handle::from_raw(1), "onScroll", closure))
            .unwrap();

        registry.process_event_at(&rt, 16.5, "onScroll", &json!({"y": 3}));
        registry.process_event(&rt, "onScroll", &json!({"y": 4}));

        let seen = seen.lock();
        assert_eq!(seen[0], vec![json!({"y": 3}), json!(16.5)]);
        assert_eq!(seen[1], vec![json!({"y": 4})]);
    }

    #[test]
    fn test_no_handlers_is_noop() {
        let (rt, errors, registry) = setup();
        assert_eq!(registry.process_event(&rt, "nothing", &json!(1)), 0);
        assert!(!errors.has_error());
    }

    #[test]
    fn test_concurrent_register_unregister_keeps_indexes_consistent() {
        let (rt, _errors, registry) = setup();
        let registry = Arc::new(registry);
        let rt_id = rt.id();

        let workers: Vec<_> = (0..2u64)
            .map(|worker| {
                let registry = registry.clone();
                thread::spawn(move || {
                    for i in 0..500u64 {
                        let id = Handle::from_raw(worker * 10_000 + i + 1);
                        let event = if i % 3 == 0 { "onScroll" } else { "onTouch" };
                        let closure = Closure::new(rt_id, |_, _| Ok(Value::Null));
                        registry
                            .register_event_handler(WorkletEventHandler::new(id, event, closure))
                            .unwrap();
                        if i % 2 == 0 {
                            assert!(registry.unregister_event_handler(id));
                        }
                    }
                })
            })
            .collect();

        for worker in workers {
            worker.join().unwrap();
        }

        assert_consistent(&registry);
        assert_eq!(registry.len(), 500);
    }

    #[test]
    fn test_dispatches_from_two_threads_never_overlap() {
        let (rt, errors, registry) = setup();
        let in_flight = Arc::new(AtomicUsize::new(0));
        let overlaps = Arc::new(AtomicUsize::new(0));
        let (in_flight_in, overlaps_in) = (in_flight.clone(), overlaps.clone());
        let closure = Closure::new(rt.id(), move |_, _| {
            if in_flight_in.fetch_add(1, Ordering::SeqCst) > 0 {
                overlaps_in.fetch_add(1, Ordering::SeqCst);
            }
            thread::yield_now();
            in_flight_in.fetch_sub(1, Ordering::SeqCst);
            Ok(Value::Null)
        });
        registry
            .register_event_handler(WorkletEventHandler::new(Handle::from_raw(1), "onScroll", closure))
            .unwrap();
        let registry = Arc::new(registry);

        let workers: Vec<_> = (0..2)
            .map(|_| {
                let registry = registry.clone();
                let rt = rt.clone();
                thread::spawn(move || {
                    for _ in 0..200 {
                        registry.process_event(&rt, "onScroll", &json!({}));
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }

        assert_eq!(overlaps.load(Ordering::SeqCst), 0);
        assert!(!errors.has_error());
    }

    #[test]
    fn test_handler_may_dispatch_nested_event() {
        let (rt, errors, registry) = setup();
        let registry = Arc::new(registry);
        let inner = Arc::new(AtomicUsize::new(0));
        registry
            .register_event_handler(counting(&rt, 1, "onInner", inner.clone()))
            .unwrap();

        let weak = Arc::downgrade(&registry);
        let closure = Closure::new(rt.id(), move |rt, _| {
            if let Some(registry) = weak.upgrade() {
                registry.process_event(rt, "onInner", &Value::Null);
            }
            Ok(Value::Null)
        });
        registry
            .register_event_handler(WorkletEventHandler::new(Handle::from_raw(2), "onOuter", closure))
            .unwrap();

        assert_eq!(registry.process_event(&rt, "onOuter", &Value::Null), 1);
        assert_eq!(inner.load(Ordering::SeqCst), 1);
        assert!(!errors.has_error());
    }

    #[test]
    fn test_scoped_handlers_only_see_their_emitter() {
        let (rt, _errors, registry) = setup();
        let view_a = Arc::new(AtomicUsize::new(0));
        let view_b = Arc::new(AtomicUsize::new(0));
        let any = Arc::new(AtomicUsize::new(0));
        registry
            .register_event_handler(counting(&rt, 1, "onScroll", view_a.clone()).for_emitter(11))
            .unwrap();
        registry
            .register_event_handler(counting(&rt, 2, "onScroll", view_b.clone()).for_emitter(22))
            .unwrap();
        registry
            .register_event_handler(counting(&rt, 3, "onScroll", any.clone()))
            .unwrap();

        assert_eq!(registry.process_emitter_event(&rt, 0.0, "onScroll", 11, &json!({})), 2);
        assert_eq!(view_a.load(Ordering::SeqCst), 1);
        assert_eq!(view_b.load(Ordering::SeqCst), 0);
        assert_eq!(any.load(Ordering::SeqCst), 1);

        // unknown view: only the unscoped handler
        assert_eq!(registry.process_emitter_event(&rt, 0.0, "onScroll", 99, &json!({})), 1);
        assert_eq!(any.load(Ordering::SeqCst), 2);

        // no emitter given: everyone
        assert_eq!(registry.process_event(&rt, "onScroll", &json!({})), 3);
    }

    #[test]
    fn test_waiting_for_emitter() {
        let (rt, _errors, registry) = setup();
        let counter = Arc::new(AtomicUsize::new(0));
        registry
            .register_event_handler(counting(&rt, 1, "onScroll", counter.clone()).for_emitter(11))
            .unwrap();

        assert!(registry.is_any_handler_waiting_for_emitter("onScroll", 11));
        assert!(!registry.is_any_handler_waiting_for_emitter("onScroll", 22));
        assert!(!registry.is_any_handler_waiting_for_emitter("onPress", 11));
        assert_eq!(registry.handlers_for_emitter("onScroll", 22).len(), 0);

        registry
            .register_event_handler(counting(&rt, 2, "onScroll", counter))
            .unwrap();
        assert!(registry.is_any_handler_waiting_for_emitter("onScroll", 22));
    }

    #[test]
    fn test_unregister_during_dispatch_is_seen_by_blocked_dispatch() {
        let (rt, errors, registry) = setup();
        let registry = Arc::new(registry);
        let victim_runs = Arc::new(AtomicUsize::new(0));
        registry
            .register_event_handler(counting(&rt, 2, "onSecond", victim_runs.clone()))
            .unwrap();

        let (started_tx, started_rx) = crossbeam_channel::bounded::<()>(1);
        let weak = Arc::downgrade(&registry);
        let closure = Closure::new(rt.id(), move |_, _| {
            let _ = started_tx.send(());
            // give the other dispatch time to queue up behind this one
            thread::sleep(std::time::Duration::from_millis(50));
            if let Some(registry) = weak.upgrade() {
                registry.unregister_event_handler(Handle::from_raw(2));
            }
            Ok(Value::Null)
        });
        registry
            .register_event_handler(WorkletEventHandler::new(Handle::from_raw(1), "onFirst", closure))
            .unwrap();

        let first = {
            let registry = registry.clone();
            let rt = rt.clone();
            thread::spawn(move || registry.process_event(&rt, "onFirst", &json!({})))
        };
        started_rx.recv().unwrap();
        let second = registry.process_event(&rt, "onSecond", &json!({}));

        assert_eq!(first.join().unwrap(), 1);
        assert_eq!(second, 0);
        assert_eq!(victim_runs.load(Ordering::SeqCst), 0);
        assert!(!errors.has_error());
    }
}
