//! Script runtime seam.
//!
//! The embedding engine (JSC, a VM, a test double) is represented by the
//! [`ScriptRuntime`] trait. The coordination core only needs to know which
//! runtime it is talking to and how to reach the module's cells.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

use crate::cell::CellSlab;
use crate::error::WorkletResult;
use crate::handle::Handle;

/// Identifies one runtime instance within a module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RuntimeId(u64);

impl RuntimeId {
    /// Wrap a raw runtime id.
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// The raw id.
    pub const fn as_raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for RuntimeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "rt{}", self.0)
    }
}

/// Which logical thread a runtime is bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeKind {
    /// The runtime driven by the platform UI thread (worklets, mappers, events)
    Ui,
    /// The main application JS runtime
    Js,
}

/// What the core needs from an embedded script runtime.
pub trait ScriptRuntime {
    /// Identity used to validate closure invocations.
    fn id(&self) -> RuntimeId;

    /// Thread affinity of this runtime.
    fn kind(&self) -> RuntimeKind;

    /// Host-exposed reactive cells.
    fn cells(&self) -> &CellSlab;
}

/// Default runtime handle: an id, a kind and a view of the module's cells.
#[derive(Debug, Clone)]
pub struct WorkletRuntime {
    id: RuntimeId,
    kind: RuntimeKind,
    cells: Arc<CellSlab>,
}

impl WorkletRuntime {
    /// Create a runtime handle over `cells`.
    pub fn new(id: RuntimeId, kind: RuntimeKind, cells: Arc<CellSlab>) -> Self {
        Self { id, kind, cells }
    }

    /// Read a cell's value.
    pub fn read(&self, cell: Handle) -> Option<Value> {
        self.cells.get(cell)
    }

    /// Write a cell's value, marking it dirty.
    pub fn write(&self, cell: Handle, value: Value) -> WorkletResult<()> {
        self.cells.set(cell, value)
    }
}

impl ScriptRuntime for WorkletRuntime {
    fn id(&self) -> RuntimeId {
        self.id
    }

    fn kind(&self) -> RuntimeKind {
        self.kind
    }

    fn cells(&self) -> &CellSlab {
        &self.cells
    }
}
