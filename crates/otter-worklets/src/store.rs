//! # Cross-runtime value store
//!
//! [`ValueStore`] lets native code, often running off the scripting thread,
//! keep script values alive until they are read back on the scripting thread.
//! Values are retained under an *owner* handle (the native wrapper that asked
//! for them) and released together when the owner tears down.
//!
//! | Operation | Description |
//! |-----------|-------------|
//! | `retain` | Store a value under an owner and get a handle back |
//! | `get_weak_ref` | Non-owning reference; check it before use |
//! | `release` | Drop a single value |
//! | `remove_refs` | Drop every value of one owner |
//! | `clear_store` | Drop everything (runtime teardown) |
//!
//! ## Locking
//!
//! A single mutex guards the store. Removal is two-phase: values are taken
//! out of the maps while the lock is held and dropped after it is released,
//! so a value whose `Drop` calls back into the store cannot deadlock.
//!
//! ## Example
//!
//! ```
//! use otter_worklets::store::ValueStore;
//! use otter_worklets::Handle;
//! use serde_json::json;
//!
//! let store = ValueStore::new();
//! let owner = Handle::from_raw(100);
//!
//! let handle = store.retain(owner, json!({"y": 42}));
//! let weak = store.get_weak_ref(handle);
//! assert_eq!(*weak.upgrade().unwrap(), json!({"y": 42}));
//!
//! store.remove_refs(owner);
//! assert!(!store.get_weak_ref(handle).is_valid());
//! ```

use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tracing::{debug, error, trace};

use crate::handle::{Handle, HandleAllocator};

/// Non-owning reference to a stored value.
///
/// The store never promises the value outlives the caller's immediate use.
/// Upgrade, use, and drop the strong reference right away.
pub struct StoredRef<T> {
    inner: Weak<T>,
}

impl<T> StoredRef<T> {
    /// An invalid reference.
    pub fn empty() -> Self {
        Self { inner: Weak::new() }
    }

    /// Get a strong reference if the value is still stored.
    pub fn upgrade(&self) -> Option<Arc<T>> {
        self.inner.upgrade()
    }

    /// Whether the value is still alive.
    pub fn is_valid(&self) -> bool {
        self.inner.strong_count() > 0
    }
}

impl<T> Clone for StoredRef<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> Default for StoredRef<T> {
    fn default() -> Self {
        Self::empty()
    }
}

impl<T> std::fmt::Debug for StoredRef<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoredRef")
            .field("valid", &self.is_valid())
            .finish()
    }
}

struct StoredEntry<T> {
    owner: Handle,
    value: Arc<T>,
}

struct StoreInner<T> {
    values: HashMap<Handle, StoredEntry<T>>,
    owners: HashMap<Handle, Vec<Handle>>,
}

impl<T> Default for StoreInner<T> {
    fn default() -> Self {
        Self {
            values: HashMap::new(),
            owners: HashMap::new(),
        }
    }
}

/// Owner-bucketed store of shared script values.
pub struct ValueStore<T = Value> {
    inner: Mutex<StoreInner<T>>,
    handles: Arc<HandleAllocator>,
}

impl<T> ValueStore<T> {
    /// Create a store with its own handle allocator.
    pub fn new() -> Self {
        Self::with_allocator(Arc::new(HandleAllocator::new()))
    }

    /// Create a store that draws handles from a shared allocator, so its
    /// handles never collide with other entities of the same module.
    pub fn with_allocator(handles: Arc<HandleAllocator>) -> Self {
        Self {
            inner: Mutex::new(StoreInner::default()),
            handles,
        }
    }

    /// Retain `value` under `owner` and return its handle.
    pub fn retain(&self, owner: Handle, value: T) -> Handle {
        self.retain_arc(owner, Arc::new(value))
    }

    /// Retain an already shared value.
    pub fn retain_arc(&self, owner: Handle, value: Arc<T>) -> Handle {
        let handle = self.handles.allocate();
        let mut inner = self.inner.lock();
        inner
            .values
            .insert(handle, StoredEntry { owner, value });
        inner.owners.entry(owner).or_default().push(handle);
        trace!(%owner, %handle, "Retained value");
        handle
    }

    /// Non-owning reference to the value under `handle`.
    ///
    /// Returns an invalid reference if the handle is unknown or its owner has
    /// already released it.
    pub fn get_weak_ref(&self, handle: Handle) -> StoredRef<T> {
        let inner = self.inner.lock();
        match inner.values.get(&handle) {
            Some(entry) => StoredRef {
                inner: Arc::downgrade(&entry.value),
            },
            None => {
                debug!(%handle, "Weak ref requested for unknown handle");
                StoredRef::empty()
            }
        }
    }

    /// Release a single value.
    ///
    /// Releasing a handle that is not stored (double release) is a caller bug.
    /// It is logged and otherwise ignored; returns `false`.
    pub fn release(&self, handle: Handle) -> bool {
        let removed = {
            let mut inner = self.inner.lock();
            let entry = inner.values.remove(&handle);
            if let Some(entry) = &entry
                && let Some(bucket) = inner.owners.get_mut(&entry.owner)
            {
                bucket.retain(|h| *h != handle);
                if bucket.is_empty() {
                    inner.owners.remove(&entry.owner);
                }
            }
            entry
        };

        match removed {
            Some(entry) => {
                drop(entry);
                true
            }
            None => {
                error!(%handle, "Release of a handle that is not stored (double release?)");
                false
            }
        }
    }

    /// Release every value retained under `owner`. Returns how many were
    /// released; `0` if the owner never retained anything.
    pub fn remove_refs(&self, owner: Handle) -> usize {
        let removed: Vec<StoredEntry<T>> = {
            let mut inner = self.inner.lock();
            let handles = inner.owners.remove(&owner).unwrap_or_default();
            handles
                .iter()
                .filter_map(|h| inner.values.remove(h))
                .collect()
        };

        let count = removed.len();
        drop(removed);
        if count > 0 {
            debug!(%owner, count, "Released owner values");
        }
        count
    }

    /// Release everything. Every outstanding handle becomes invalid.
    pub fn clear_store(&self) {
        let taken = {
            let mut inner = self.inner.lock();
            std::mem::take(&mut *inner)
        };
        let count = taken.values.len();
        drop(taken);
        debug!(count, "Value store cleared");
    }

    /// Whether `handle` is currently stored.
    pub fn contains(&self, handle: Handle) -> bool {
        self.inner.lock().values.contains_key(&handle)
    }

    /// Number of stored values.
    pub fn len(&self) -> usize {
        self.inner.lock().values.len()
    }

    /// Whether the store is empty.
    pub fn is_empty(&self) -> bool {
        self.inner.lock().values.is_empty()
    }

    /// Number of owners with at least one retained value.
    pub fn owner_count(&self) -> usize {
        self.inner.lock().owners.len()
    }
}

impl<T> Default for ValueStore<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> std::fmt::Debug for ValueStore<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("ValueStore")
            .field("values", &inner.values.len())
            .field("owners", &inner.owners.len())
            .finish()
    }
}
