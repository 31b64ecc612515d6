//! Mutable value cells.
//!
//! A cell is the reactive unit mappers read from and write to: a current
//! value plus a dirty flag. Writing a value marks the cell dirty; only the
//! mapper engine clears the flag, after a mapper has consumed the cell.
//!
//! Cells live in a [`CellSlab`] owned by the embedding module. Mappers and
//! scripts refer to them by [`Handle`], never by reference.

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde_json::Value;

use crate::error::{WorkletError, WorkletResult};
use crate::handle::Handle;

/// A single reactive cell.
#[derive(Debug, Clone)]
pub struct MutableCell {
    value: Value,
    dirty: bool,
}

impl MutableCell {
    fn new(value: Value) -> Self {
        Self {
            value,
            dirty: false,
        }
    }

    /// Current value.
    pub fn value(&self) -> &Value {
        &self.value
    }

    /// Whether the value changed since a mapper last consumed it.
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }
}

/// Handle-indexed storage for every cell of a module.
#[derive(Debug, Default)]
pub struct CellSlab {
    cells: DashMap<Handle, MutableCell>,
}

impl CellSlab {
    /// Create an empty slab.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a new, clean cell under `handle`.
    pub fn insert(&self, handle: Handle, initial: Value) -> WorkletResult<()> {
        match self.cells.entry(handle) {
            Entry::Occupied(_) => Err(WorkletError::DuplicateId(handle)),
            Entry::Vacant(slot) => {
                slot.insert(MutableCell::new(initial));
                Ok(())
            }
        }
    }

    /// Snapshot of the cell's current value.
    pub fn get(&self, handle: Handle) -> Option<Value> {
        self.cells.get(&handle).map(|cell| cell.value.clone())
    }

    /// Replace the cell's value and mark it dirty.
    pub fn set(&self, handle: Handle, value: Value) -> WorkletResult<()> {
        let mut cell = self
            .cells
            .get_mut(&handle)
            .ok_or(WorkletError::UnknownHandle(handle))?;
        cell.value = value;
        cell.dirty = true;
        Ok(())
    }

    /// Update the value in place through `f`, marking the cell dirty.
    pub fn update<F>(&self, handle: Handle, f: F) -> WorkletResult<()>
    where
        F: FnOnce(&mut Value),
    {
        let mut cell = self
            .cells
            .get_mut(&handle)
            .ok_or(WorkletError::UnknownHandle(handle))?;
        f(&mut cell.value);
        cell.dirty = true;
        Ok(())
    }

    /// Whether the cell is dirty. Unknown handles are never dirty.
    pub fn is_dirty(&self, handle: Handle) -> bool {
        self.cells.get(&handle).is_some_and(|cell| cell.dirty)
    }

    /// Force the dirty flag on without touching the value.
    pub fn mark_dirty(&self, handle: Handle) -> bool {
        match self.cells.get_mut(&handle) {
            Some(mut cell) => {
                cell.dirty = true;
                true
            }
            None => false,
        }
    }

    pub(crate) fn clear_dirty(&self, handle: Handle) -> bool {
        match self.cells.get_mut(&handle) {
            Some(mut cell) => std::mem::replace(&mut cell.dirty, false),
            None => false,
        }
    }

    /// Remove a cell, returning its last value.
    pub fn remove(&self, handle: Handle) -> Option<Value> {
        self.cells.remove(&handle).map(|(_, cell)| cell.value)
    }

    /// Whether a cell exists under `handle`.
    pub fn contains(&self, handle: Handle) -> bool {
        self.cells.contains_key(&handle)
    }

    /// Number of cells.
    pub fn len(&self) -> usize {
        self.cells.len()
    }

    /// Whether the slab holds no cells.
    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    /// Drop every cell.
    pub fn clear(&self) {
        self.cells.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_set_marks_dirty() {
        let slab = CellSlab::new();
        let h = Handle::from_raw(1);
        slab.insert(h, json!(0)).unwrap();
        assert!(!slab.is_dirty(h));

        slab.set(h, json!(5)).unwrap();
        assert!(slab.is_dirty(h));
        assert_eq!(slab.get(h), Some(json!(5)));

        assert!(slab.clear_dirty(h));
        assert!(!slab.is_dirty(h));
        // value survives the flag reset
        assert_eq!(slab.get(h), Some(json!(5)));
    }

    #[test]
    fn test_update_in_place() {
        let slab = CellSlab::new();
        let h = Handle::from_raw(7);
        slab.insert(h, json!({"x": 1})).unwrap();
        slab.update(h, |v| v["x"] = json!(2)).unwrap();
        assert_eq!(slab.get(h), Some(json!({"x": 2})));
        assert!(slab.is_dirty(h));
    }

    #[test]
    fn test_duplicate_insert() {
        let slab = CellSlab::new();
        let h = Handle::from_raw(3);
        slab.insert(h, json!(null)).unwrap();
        assert!(matches!(
            slab.insert(h, json!(1)),
            Err(WorkletError::DuplicateId(_))
        ));
    }

    #[test]
    fn test_unknown_handle() {
        let slab = CellSlab::new();
        let h = Handle::from_raw(99);
        assert!(matches!(
            slab.set(h, json!(1)),
            Err(WorkletError::UnknownHandle(_))
        ));
        assert!(!slab.is_dirty(h));
        assert!(!slab.mark_dirty(h));
        assert_eq!(slab.get(h), None);
    }

    #[test]
    fn test_remove_and_clear() {
        let slab = CellSlab::new();
        slab.insert(Handle::from_raw(1), json!(1)).unwrap();
        slab.insert(Handle::from_raw(2), json!(2)).unwrap();
        assert_eq!(slab.remove(Handle::from_raw(1)), Some(json!(1)));
        assert_eq!(slab.len(), 1);
        slab.clear();
        assert!(slab.is_empty());
    }
}
