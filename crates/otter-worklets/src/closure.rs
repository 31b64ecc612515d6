//! Runtime-tagged script closures.
//!
//! A [`Closure`] pairs a callable with the [`RuntimeId`] it was created for.
//! Every invocation checks the calling runtime first, so a closure captured on
//! one runtime can never run against another. Panics inside the callable are
//! caught and surfaced as [`ScriptError`]s.

use serde_json::Value;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use tracing::error;

use crate::error::{ScriptError, WorkletError, WorkletResult};
use crate::runtime::{RuntimeId, ScriptRuntime};

type Callable = dyn Fn(&dyn ScriptRuntime, &[Value]) -> Result<Value, ScriptError> + Send + Sync;

/// A script function bound to the runtime that owns it.
#[derive(Clone)]
pub struct Closure {
    runtime: RuntimeId,
    name: Option<Arc<str>>,
    callable: Arc<Callable>,
}

impl Closure {
    /// Wrap `f` as a closure owned by `runtime`.
    pub fn new<F>(runtime: RuntimeId, f: F) -> Self
    where
        F: Fn(&dyn ScriptRuntime, &[Value]) -> Result<Value, ScriptError> + Send + Sync + 'static,
    {
        Self {
            runtime,
            name: None,
            callable: Arc::new(f),
        }
    }

    /// Attach a debug name (shows up in logs and error reports).
    pub fn named(mut self, name: impl Into<Arc<str>>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// The owning runtime.
    pub fn runtime(&self) -> RuntimeId {
        self.runtime
    }

    /// Debug name, if any.
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Call the closure on `runtime` with positional `args`.
    ///
    /// Fails with [`WorkletError::RuntimeMismatch`] without running anything
    /// if `runtime` is not the owning runtime.
    pub fn call(&self, runtime: &dyn ScriptRuntime, args: &[Value]) -> WorkletResult<Value> {
        let actual = runtime.id();
        if actual != self.runtime {
            return Err(WorkletError::RuntimeMismatch {
                expected: self.runtime,
                actual,
            });
        }

        match catch_unwind(AssertUnwindSafe(|| (self.callable)(runtime, args))) {
            Ok(result) => result.map_err(WorkletError::from),
            Err(panic) => {
                let err = ScriptError::from_panic(panic.as_ref());
                error!(closure = ?self.name, error = %err, "Worklet closure panicked");
                Err(err.into())
            }
        }
    }
}

impl fmt::Debug for Closure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Closure")
            .field("runtime", &self.runtime)
            .field("name", &self.name)
            .finish()
    }
}
