// src/ecs/storage.rs
//! Sparse/dense component storage with guard-based access.
//!
//! Two parallel arrays hold components in insertion order (dense) and their
//! owning entities (dense_entities); a sparse index array maps entity index
//! -> dense slot. Removal swap-erases: the last dense element moves into the
//! hole and the moved entity's sparse index is fixed up.
//!
//! All access goes through guards. Read guards share the storage lock, write
//! guards hold it exclusively. Guards are *owned* (`arc_lock`), so a prepare
//! function can move them into a shared job context and the last-finishing
//! chunk job releases them.

use std::any::Any;
use std::sync::Arc;

use parking_lot::lock_api::{ArcRwLockReadGuard, ArcRwLockWriteGuard};
use parking_lot::{RawRwLock, RwLock};

use super::EntityId;

const SPARSE_EMPTY: u32 = u32::MAX;

// ============================================================================
// 1. SPARSE SET
// ============================================================================

pub(crate) struct SparseStore<T> {
    dense: Vec<T>,
    dense_entities: Vec<EntityId>,
    sparse: Vec<u32>,
}

impl<T> SparseStore<T> {
    fn new() -> Self {
        Self {
            dense: Vec::new(),
            dense_entities: Vec::new(),
            sparse: Vec::new(),
        }
    }

    #[inline]
    fn len(&self) -> usize {
        debug_assert_eq!(self.dense.len(), self.dense_entities.len());
        self.dense.len()
    }

    #[inline]
    fn dense_slot(&self, id: EntityId) -> Option<usize> {
        let idx = id.index() as usize;
        let slot = *self.sparse.get(idx)?;
        if slot == SPARSE_EMPTY {
            return None;
        }
        // generation check: a recycled entity index must not see the old
        // entity's component
        if self.dense_entities[slot as usize] != id {
            return None;
        }
        Some(slot as usize)
    }

    fn put(&mut self, id: EntityId, value: T) -> bool {
        if let Some(slot) = self.dense_slot(id) {
            self.dense[slot] = value;
            return false;
        }
        let idx = id.index() as usize;
        if idx >= self.sparse.len() {
            self.sparse.resize(idx + 1, SPARSE_EMPTY);
        }
        let slot = self.dense.len() as u32;
        self.dense.push(value);
        self.dense_entities.push(id);
        self.sparse[idx] = slot;
        true
    }

    fn remove(&mut self, id: EntityId) -> Option<T> {
        let slot = self.dense_slot(id)?;
        let last = self.dense.len() - 1;
        let value = self.dense.swap_remove(slot);
        let _ = self.dense_entities.swap_remove(slot);
        if slot < last {
            let moved = self.dense_entities[slot];
            self.sparse[moved.index() as usize] = slot as u32;
        }
        self.sparse[id.index() as usize] = SPARSE_EMPTY;
        Some(value)
    }

    #[inline]
    fn get(&self, id: EntityId) -> Option<&T> {
        self.dense_slot(id).map(|s| &self.dense[s])
    }

    #[inline]
    fn get_mut(&mut self, id: EntityId) -> Option<&mut T> {
        self.dense_slot(id).map(move |s| &mut self.dense[s])
    }
}

// ============================================================================
// 2. SHARED STORAGE HANDLE + GUARDS
// ============================================================================

type ReadInner<T> = ArcRwLockReadGuard<RawRwLock, SparseStore<T>>;
type WriteInner<T> = ArcRwLockWriteGuard<RawRwLock, SparseStore<T>>;

/// Cloneable handle to one component type's storage.
pub struct Storage<T> {
    inner: Arc<RwLock<SparseStore<T>>>,
    name: Arc<str>,
}

impl<T> Clone for Storage<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            name: Arc::clone(&self.name),
        }
    }
}

impl<T: Send + Sync + 'static> Storage<T> {
    pub(crate) fn new(name: &str) -> Self {
        Self {
            inner: Arc::new(RwLock::new(SparseStore::new())),
            name: name.into(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Shared lock. Blocks per reader-writer semantics.
    pub fn acquire_read(&self) -> ReadGuard<T> {
        ReadGuard {
            guard: RwLock::read_arc(&self.inner),
        }
    }

    /// Exclusive lock. Blocks per reader-writer semantics.
    pub fn acquire_write(&self) -> WriteGuard<T> {
        WriteGuard {
            guard: RwLock::write_arc(&self.inner),
        }
    }

    /// Dense length without taking a guard (racy; for sizing decisions only).
    pub fn len_hint(&self) -> usize {
        self.inner.read().len()
    }
}

/// Shared view of a storage. Owned; movable into job contexts.
pub struct ReadGuard<T> {
    guard: ReadInner<T>,
}

impl<T> ReadGuard<T> {
    #[inline]
    pub fn len(&self) -> usize {
        self.guard.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[inline]
    pub fn item_at(&self, slot: usize) -> &T {
        &self.guard.dense[slot]
    }

    #[inline]
    pub fn entity_at(&self, slot: usize) -> EntityId {
        self.guard.dense_entities[slot]
    }

    #[inline]
    pub fn get(&self, id: EntityId) -> Option<&T> {
        self.guard.get(id)
    }

    #[inline]
    pub fn slot_of(&self, id: EntityId) -> Option<usize> {
        self.guard.dense_slot(id)
    }
}

/// Exclusive view of a storage. Owned; movable into job contexts.
pub struct WriteGuard<T> {
    guard: WriteInner<T>,
}

impl<T> WriteGuard<T> {
    #[inline]
    pub fn len(&self) -> usize {
        self.guard.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[inline]
    pub fn item_at(&self, slot: usize) -> &T {
        &self.guard.dense[slot]
    }

    #[inline]
    pub fn item_at_mut(&mut self, slot: usize) -> &mut T {
        &mut self.guard.dense[slot]
    }

    #[inline]
    pub fn entity_at(&self, slot: usize) -> EntityId {
        self.guard.dense_entities[slot]
    }

    #[inline]
    pub fn get(&self, id: EntityId) -> Option<&T> {
        self.guard.get(id)
    }

    #[inline]
    pub fn get_mut(&mut self, id: EntityId) -> Option<&mut T> {
        self.guard.get_mut(id)
    }

    #[inline]
    pub fn slot_of(&self, id: EntityId) -> Option<usize> {
        self.guard.dense_slot(id)
    }

    /// Insert or overwrite. Returns true when a new dense slot was created.
    pub fn put(&mut self, id: EntityId, value: T) -> bool {
        self.guard.put(id, value)
    }

    /// Swap-erase removal.
    pub fn remove(&mut self, id: EntityId) -> Option<T> {
        self.guard.remove(id)
    }

    /// Split the dense range into disjoint windows for chunked jobs.
    ///
    /// Each window aliases this guard's dense/entity arrays through raw
    /// pointers. The windows cover `[0, len)` without overlap, so per-window
    /// mutation is race-free; the caller must keep this guard alive (move it
    /// into the shared job context) for as long as any window exists.
    pub fn windows(&mut self, chunk_size: usize) -> Vec<WriteWindow<T>> {
        let len = self.len();
        let chunk = chunk_size.max(1);
        let items = self.guard.dense.as_mut_ptr();
        let entities = self.guard.dense_entities.as_ptr();
        let mut out = Vec::with_capacity(len.div_ceil(chunk));
        let mut start = 0;
        while start < len {
            let end = (start + chunk).min(len);
            out.push(WriteWindow {
                items,
                entities,
                start,
                end,
            });
            start = end;
        }
        out
    }
}

/// One chunk's mutable view into a write-locked storage.
pub struct WriteWindow<T> {
    items: *mut T,
    entities: *const EntityId,
    start: usize,
    end: usize,
}

// SAFETY: windows are disjoint by construction and the storage stays
// exclusively write-locked while they exist; sending one to a worker moves
// sole access to its range.
unsafe impl<T: Send> Send for WriteWindow<T> {}

impl<T> WriteWindow<T> {
    #[inline]
    pub fn range(&self) -> std::ops::Range<usize> {
        self.start..self.end
    }

    #[inline]
    pub fn item_mut(&mut self, slot: usize) -> &mut T {
        debug_assert!(slot >= self.start && slot < self.end);
        // SAFETY: slot is inside this window's disjoint range (asserted
        // above) and the backing array is write-locked for the window's
        // whole lifetime.
        unsafe { &mut *self.items.add(slot) }
    }

    #[inline]
    pub fn entity_at(&self, slot: usize) -> EntityId {
        debug_assert!(slot >= self.start && slot < self.end);
        // SAFETY: same bounds argument as `item_mut`; entities are only
        // read while the write lock pins them.
        unsafe { *self.entities.add(slot) }
    }
}

// ============================================================================
// 3. TYPE-ERASED ENTRY (for World's storage map)
// ============================================================================

/// What the World needs from a storage without knowing `T`.
pub(crate) trait AnyStorage: Send + Sync {
    fn remove_entity(&self, id: EntityId) -> bool;
    fn as_any(&self) -> &dyn Any;
    fn name(&self) -> &str;
    fn len(&self) -> usize;
}

impl<T: Send + Sync + 'static> AnyStorage for Storage<T> {
    fn remove_entity(&self, id: EntityId) -> bool {
        // dropping the removed value runs the component's destructor
        self.inner.write().remove(id).is_some()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn len(&self) -> usize {
        self.inner.read().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ecs::EntityId;

    fn ent(index: u32) -> EntityId {
        EntityId::new(index, 1)
    }

    #[test]
    fn put_get_remove_swap_erase() {
        let storage: Storage<u32> = Storage::new("health");
        let mut w = storage.acquire_write();
        assert!(w.put(ent(0), 10));
        assert!(w.put(ent(5), 50));
        assert!(w.put(ent(9), 90));
        assert!(!w.put(ent(5), 55)); // overwrite, no new slot
        assert_eq!(w.len(), 3);

        // removing the first slot moves the last dense element into it
        assert_eq!(w.remove(ent(0)), Some(10));
        assert_eq!(w.len(), 2);
        assert_eq!(w.get(ent(9)), Some(&90));
        assert_eq!(w.get(ent(5)), Some(&55));
        assert_eq!(w.get(ent(0)), None);

        // dense/entity arrays stay parallel
        for slot in 0..w.len() {
            let id = w.entity_at(slot);
            assert_eq!(w.get(id), Some(w.item_at(slot)));
        }
    }

    #[test]
    fn stale_generation_resolves_absent() {
        let storage: Storage<u32> = Storage::new("health");
        let mut w = storage.acquire_write();
        let old = EntityId::new(3, 1);
        let new = EntityId::new(3, 2);
        w.put(old, 1);
        assert_eq!(w.get(new), None);
        w.remove(old);
        w.put(new, 2);
        assert_eq!(w.get(old), None);
        assert_eq!(w.get(new), Some(&2));
    }

    #[test]
    fn windows_cover_dense_range_disjointly() {
        let storage: Storage<u64> = Storage::new("mass");
        let mut w = storage.acquire_write();
        for i in 0..1000u32 {
            w.put(ent(i), 0);
        }
        let mut windows = w.windows(256);
        assert_eq!(windows.len(), 4);

        let mut covered = 0;
        for win in &mut windows {
            for slot in win.range() {
                *win.item_mut(slot) += slot as u64;
                covered += 1;
            }
        }
        assert_eq!(covered, 1000);
        drop(windows);

        for slot in 0..w.len() {
            assert_eq!(*w.item_at(slot), slot as u64);
        }
    }

    #[test]
    fn guards_outlive_the_handle_scope() {
        // the owned guard keeps the storage alive and locked after the
        // handle clone goes away, which is what chunked job contexts rely on
        let storage: Storage<u8> = Storage::new("flags");
        storage.acquire_write().put(ent(0), 7);
        let guard = {
            let clone = storage.clone();
            clone.acquire_read()
        };
        assert_eq!(guard.get(ent(0)), Some(&7));
    }
}
