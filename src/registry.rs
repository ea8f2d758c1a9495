// src/registry.rs
//! Generational resource registry.
//!
//! - Handles: compact (index, generation) pairs, typed by the stored value
//! - Refcounts: per-slot atomics; the 0 edge destroys the value in place
//! - Use-after-free: a freed slot bumps its generation, so every handle
//!   minted for the old contents goes stale in one step
//!
//! `get` on a stale handle returns `None`; it never dereferences freed
//! contents and never fails the process.

use std::marker::PhantomData;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use parking_lot::{Mutex, RwLock, RwLockReadGuard};

/// Typed handle into a [`ResourceRegistry`].
///
/// Valid iff the slot's generation equals the handle's and the slot's
/// refcount is non-zero.
pub struct Handle<T> {
    index: u32,
    generation: u32,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Handle<T> {
    #[inline]
    pub fn index(self) -> u32 {
        self.index
    }

    #[inline]
    pub fn generation(self) -> u32 {
        self.generation
    }
}

// Manual impls: the handle is Copy regardless of T.
impl<T> Clone for Handle<T> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<T> Copy for Handle<T> {}
impl<T> PartialEq for Handle<T> {
    fn eq(&self, other: &Self) -> bool {
        self.index == other.index && self.generation == other.generation
    }
}
impl<T> Eq for Handle<T> {}
impl<T> std::hash::Hash for Handle<T> {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.index.hash(state);
        self.generation.hash(state);
    }
}
impl<T> std::fmt::Debug for Handle<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Handle({}v{})", self.index, self.generation)
    }
}

struct Slot<T> {
    generation: u32,
    refs: AtomicU32,
    value: Option<T>,
    name: String,
}

/// Registry stats snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegistryStats {
    pub active: u32,
    pub total_refs: u64,
    pub peak_active: u32,
}

/// Typed handle table with generation + refcount lifetimes.
pub struct ResourceRegistry<T> {
    slots: RwLock<Vec<Slot<T>>>,
    free: Mutex<Vec<u32>>,
    active: AtomicU32,
    total_refs: AtomicU64,
    peak_active: AtomicU32,
}

impl<T> Default for ResourceRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> ResourceRegistry<T> {
    pub fn new() -> Self {
        Self {
            slots: RwLock::new(Vec::new()),
            free: Mutex::new(Vec::new()),
            active: AtomicU32::new(0),
            total_refs: AtomicU64::new(0),
            peak_active: AtomicU32::new(0),
        }
    }

    /// Insert a value. Reuses a free slot or extends the table; the new
    /// handle starts with refcount 1.
    pub fn create(&self, name: &str, value: T) -> Handle<T> {
        let reused = self.free.lock().pop();
        let mut slots = self.slots.write();
        let index = match reused {
            Some(i) => {
                let slot = &mut slots[i as usize];
                slot.value = Some(value);
                slot.refs.store(1, Ordering::Release);
                slot.name.clear();
                slot.name.push_str(name);
                i
            }
            None => {
                slots.push(Slot {
                    generation: 1,
                    refs: AtomicU32::new(1),
                    value: Some(value),
                    name: name.to_owned(),
                });
                (slots.len() - 1) as u32
            }
        };
        let generation = slots[index as usize].generation;
        drop(slots);

        let active = self.active.fetch_add(1, Ordering::Relaxed) + 1;
        self.total_refs.fetch_add(1, Ordering::Relaxed);
        self.peak_active.fetch_max(active, Ordering::Relaxed);

        Handle {
            index,
            generation,
            _marker: PhantomData,
        }
    }

    /// Shared access to the value behind a live handle.
    ///
    /// Returns `None` on generation mismatch or a zero refcount.
    pub fn get(&self, h: Handle<T>) -> Option<parking_lot::MappedRwLockReadGuard<'_, T>> {
        let slots = self.slots.read();
        RwLockReadGuard::try_map(slots, |slots| {
            let slot = slots.get(h.index as usize)?;
            if slot.generation != h.generation || slot.refs.load(Ordering::Acquire) == 0 {
                return None;
            }
            slot.value.as_ref()
        })
        .ok()
    }

    /// Increment the refcount of a live handle. Stale handles are ignored.
    pub fn add_ref(&self, h: Handle<T>) -> bool {
        let slots = self.slots.read();
        let Some(slot) = slots.get(h.index as usize) else {
            return false;
        };
        if slot.generation != h.generation {
            return false;
        }
        // CAS loop: never resurrect a slot that already hit zero.
        let mut refs = slot.refs.load(Ordering::Acquire);
        loop {
            if refs == 0 {
                return false;
            }
            match slot.refs.compare_exchange_weak(
                refs,
                refs + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    self.total_refs.fetch_add(1, Ordering::Relaxed);
                    return true;
                }
                Err(actual) => refs = actual,
            }
        }
    }

    /// Decrement the refcount. Crossing to zero destroys the value in place
    /// and frees the slot (generation + 1). Stale handles are ignored.
    pub fn remove_ref(&self, h: Handle<T>) {
        let hit_zero = {
            let slots = self.slots.read();
            let Some(slot) = slots.get(h.index as usize) else {
                return;
            };
            if slot.generation != h.generation {
                return;
            }
            let mut refs = slot.refs.load(Ordering::Acquire);
            loop {
                if refs == 0 {
                    return; // already destroyed by a racing release
                }
                match slot.refs.compare_exchange_weak(
                    refs,
                    refs - 1,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                ) {
                    Ok(_) => break,
                    Err(actual) => refs = actual,
                }
            }
            self.total_refs.fetch_sub(1, Ordering::Relaxed);
            refs == 1
        };
        if hit_zero {
            self.free_slot(h);
        }
    }

    /// Force the refcount to zero and destroy the value. Tolerates handles
    /// whose generation is already stale (no-op).
    pub fn destroy(&self, h: Handle<T>) {
        let released = {
            let slots = self.slots.read();
            let Some(slot) = slots.get(h.index as usize) else {
                return;
            };
            if slot.generation != h.generation {
                return;
            }
            slot.refs.swap(0, Ordering::AcqRel)
        };
        if released > 0 {
            self.total_refs.fetch_sub(released as u64, Ordering::Relaxed);
            self.free_slot(h);
        }
    }

    /// Destruction happens exactly once, on the refcount 0 edge; the slot is
    /// then reusable under a new generation.
    fn free_slot(&self, h: Handle<T>) {
        let mut slots = self.slots.write();
        let slot = &mut slots[h.index as usize];
        debug_assert_eq!(slot.generation, h.generation);
        debug_assert_eq!(slot.refs.load(Ordering::Acquire), 0);
        slot.value = None; // drop the contents here, under the table lock
        slot.generation = slot.generation.wrapping_add(1);
        drop(slots);

        self.active.fetch_sub(1, Ordering::Relaxed);
        self.free.lock().push(h.index);
    }

    /// Debug name recorded at creation, for live handles only.
    pub fn name_of(&self, h: Handle<T>) -> Option<String> {
        let slots = self.slots.read();
        let slot = slots.get(h.index as usize)?;
        if slot.generation != h.generation || slot.refs.load(Ordering::Acquire) == 0 {
            return None;
        }
        Some(slot.name.clone())
    }

    pub fn stats(&self) -> RegistryStats {
        RegistryStats {
            active: self.active.load(Ordering::Relaxed),
            total_refs: self.total_refs.load(Ordering::Relaxed),
            peak_active: self.peak_active.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn get_after_destroy_is_absent() {
        let reg = ResourceRegistry::new();
        let h = reg.create("mesh", 42u64);
        assert_eq!(*reg.get(h).unwrap(), 42);

        reg.destroy(h);
        assert!(reg.get(h).is_none());

        // slot reuse: same index, different generation, old handle stays stale
        let h2 = reg.create("mesh2", 7u64);
        assert_eq!(h2.index(), h.index());
        assert_ne!(h2.generation(), h.generation());
        assert!(reg.get(h).is_none());
        assert_eq!(*reg.get(h2).unwrap(), 7);
    }

    #[test]
    fn destroy_stale_handle_is_noop() {
        let reg = ResourceRegistry::new();
        let h = reg.create("buf", vec![1u8, 2, 3]);
        reg.destroy(h);
        reg.destroy(h); // stale now; must not touch the freed slot
        let stats = reg.stats();
        assert_eq!(stats.active, 0);
    }

    #[test]
    fn add_remove_ref_round_trip() {
        let reg = ResourceRegistry::new();
        let h = reg.create("tex", 1u32);
        assert!(reg.add_ref(h));
        reg.remove_ref(h);
        // still alive: the create ref remains
        assert!(reg.get(h).is_some());
        reg.remove_ref(h);
        assert!(reg.get(h).is_none());
        assert!(!reg.add_ref(h)); // cannot resurrect
    }

    #[test]
    fn stats_track_active_and_peak() {
        let reg = ResourceRegistry::new();
        let a = reg.create("a", 0u8);
        let b = reg.create("b", 1u8);
        assert_eq!(reg.stats().active, 2);
        reg.destroy(a);
        let stats = reg.stats();
        assert_eq!(stats.active, 1);
        assert_eq!(stats.peak_active, 2);
        reg.destroy(b);
        assert_eq!(reg.stats().total_refs, 0);
    }

    #[test]
    fn concurrent_ref_churn_destroys_once() {
        struct Payload(Arc<AtomicU32>);
        impl Drop for Payload {
            fn drop(&mut self) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let drops = Arc::new(AtomicU32::new(0));
        let reg = Arc::new(ResourceRegistry::new());
        let h = reg.create("shared", Payload(drops.clone()));

        let mut handles = vec![];
        for _ in 0..8 {
            let reg = reg.clone();
            handles.push(thread::spawn(move || {
                for _ in 0..1000 {
                    if reg.add_ref(h) {
                        reg.remove_ref(h);
                    }
                }
            }));
        }
        for t in handles {
            t.join().unwrap();
        }

        assert_eq!(drops.load(Ordering::SeqCst), 0);
        reg.remove_ref(h); // drop the create ref
        assert_eq!(drops.load(Ordering::SeqCst), 1);
        assert!(reg.get(h).is_none());
    }
}
