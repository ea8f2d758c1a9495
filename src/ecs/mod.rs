// src/ecs/mod.rs
//! ECS core: entity lifecycle, component registration, guarded storage
//! access, and the staged scheduler.
//!
//! Component types are plain data records registered once at startup. An
//! entity's components live in per-type sparse/dense stores; destroying the
//! entity removes it from every registered store (running each component's
//! destructor exactly once) and recycles the id under a new generation, so
//! stale ids always resolve to "absent".

use std::any::TypeId;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::{Mutex, RwLock};
use std::sync::Arc;

use crate::diagnostics::Diagnostics;

pub mod extraction;
pub mod scheduler;
pub mod storage;
pub mod transform;

pub use scheduler::{Scheduler, StageIndex, SystemDesc};
pub use storage::{ReadGuard, Storage, WriteGuard, WriteWindow};

// ============================================================================
// 1. ENTITY IDS
// ============================================================================

/// Entity id: slot index in the low half, generation in the high half.
/// A stale id (generation mismatch) always resolves to "absent".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntityId(u64);

impl EntityId {
    #[inline]
    pub fn new(index: u32, generation: u32) -> Self {
        Self(((generation as u64) << 32) | index as u64)
    }

    #[inline]
    pub fn index(self) -> u32 {
        (self.0 & 0xFFFF_FFFF) as u32
    }

    #[inline]
    pub fn generation(self) -> u32 {
        (self.0 >> 32) as u32
    }
}

struct EntityRegistry {
    generations: Vec<u32>,
    tags: Vec<String>,
    free: Vec<u32>,
    alive: usize,
}

impl EntityRegistry {
    fn new() -> Self {
        Self {
            generations: Vec::new(),
            tags: Vec::new(),
            free: Vec::new(),
            alive: 0,
        }
    }

    fn create(&mut self, tag: &str) -> EntityId {
        self.alive += 1;
        if let Some(index) = self.free.pop() {
            let i = index as usize;
            self.tags[i].clear();
            self.tags[i].push_str(tag);
            return EntityId::new(index, self.generations[i]);
        }
        let index = self.generations.len() as u32;
        self.generations.push(1);
        self.tags.push(tag.to_owned());
        EntityId::new(index, 1)
    }

    fn is_alive(&self, id: EntityId) -> bool {
        self.generations
            .get(id.index() as usize)
            .is_some_and(|&g| g == id.generation())
    }

    /// Returns the slot to the free list under generation + 1.
    fn destroy(&mut self, id: EntityId) -> bool {
        if !self.is_alive(id) {
            return false;
        }
        let i = id.index() as usize;
        self.generations[i] = self.generations[i].wrapping_add(1);
        self.free.push(id.index());
        self.alive -= 1;
        true
    }
}

// ============================================================================
// 2. WORLD
// ============================================================================

struct StorageEntry {
    storage: Box<dyn storage::AnyStorage>,
}

/// Frame counters recorded by `begin_frame` and read by systems.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameInfo {
    pub frame_index: u64,
    pub dt: f32,
}

/// The component/entity container every system operates on.
pub struct World {
    entities: Mutex<EntityRegistry>,
    storages: RwLock<HashMap<TypeId, StorageEntry>>,
    frame_index: AtomicU64,
    dt_bits: AtomicU64,
    pub(crate) diagnostics: Arc<Diagnostics>,
    /// Contiguous per-entity data that extraction systems write and the
    /// render thread reads post-flip.
    pub extraction: Arc<extraction::ExtractionBuffers>,
}

impl World {
    pub fn new(diagnostics: Arc<Diagnostics>) -> Self {
        Self {
            entities: Mutex::new(EntityRegistry::new()),
            storages: RwLock::new(HashMap::new()),
            frame_index: AtomicU64::new(0),
            dt_bits: AtomicU64::new(0),
            diagnostics,
            extraction: Arc::new(extraction::ExtractionBuffers::new()),
        }
    }

    // ------------------------------------------------------------------
    // Component registration
    // ------------------------------------------------------------------

    /// Install a storage for `T`. Idempotent: re-registering returns the
    /// existing storage.
    pub fn register_component<T: Send + Sync + 'static>(&self, name: &str) -> Storage<T> {
        {
            let storages = self.storages.read();
            if let Some(entry) = storages.get(&TypeId::of::<T>()) {
                return entry
                    .storage
                    .as_any()
                    .downcast_ref::<Storage<T>>()
                    .expect("storage entry type matches its key")
                    .clone();
            }
        }
        let mut storages = self.storages.write();
        let entry = storages
            .entry(TypeId::of::<T>())
            .or_insert_with(|| StorageEntry {
                storage: Box::new(Storage::<T>::new(name)),
            });
        entry
            .storage
            .as_any()
            .downcast_ref::<Storage<T>>()
            .expect("storage entry type matches its key")
            .clone()
    }

    /// The storage registered for `T`, or a reported misuse and `None`.
    pub fn storage<T: Send + Sync + 'static>(&self) -> Option<Storage<T>> {
        let storages = self.storages.read();
        match storages.get(&TypeId::of::<T>()) {
            Some(entry) => entry.storage.as_any().downcast_ref::<Storage<T>>().cloned(),
            None => {
                drop(storages);
                self.diagnostics
                    .report_misuse(&format!("unregistered component {}", std::any::type_name::<T>()));
                None
            }
        }
    }

    // ------------------------------------------------------------------
    // Entity lifecycle
    // ------------------------------------------------------------------

    pub fn create_entity(&self, tag: &str) -> EntityId {
        self.entities.lock().create(tag)
    }

    pub fn is_alive(&self, id: EntityId) -> bool {
        self.entities.lock().is_alive(id)
    }

    pub fn entity_count(&self) -> usize {
        self.entities.lock().alive
    }

    /// Remove `id` from every registered storage (running each component's
    /// destructor exactly once), then recycle the slot under generation + 1.
    pub fn destroy_entity(&self, id: EntityId) {
        if !self.entities.lock().is_alive(id) {
            return;
        }
        {
            let storages = self.storages.read();
            for entry in storages.values() {
                entry.storage.remove_entity(id);
            }
        }
        self.entities.lock().destroy(id);
    }

    // ------------------------------------------------------------------
    // Component access
    // ------------------------------------------------------------------

    /// Insert a component. Returns true when a new dense slot was created.
    pub fn add_component<T: Send + Sync + 'static>(&self, id: EntityId, value: T) -> bool {
        if !self.is_alive(id) {
            self.diagnostics
                .report_misuse("add_component on a dead entity");
            return false;
        }
        match self.storage::<T>() {
            Some(storage) => storage.acquire_write().put(id, value),
            None => false,
        }
    }

    pub fn remove_component<T: Send + Sync + 'static>(&self, id: EntityId) -> Option<T> {
        self.storage::<T>()?.acquire_write().remove(id)
    }

    /// Per-item shared borrow, scoped to the caller.
    pub fn borrow_component<T: Send + Sync + 'static>(&self, id: EntityId) -> Option<ComponentRef<T>> {
        let guard = self.storage::<T>()?.acquire_read();
        guard.get(id)?;
        Some(ComponentRef { guard, id })
    }

    /// Per-item exclusive borrow, scoped to the caller.
    pub fn borrow_component_mut<T: Send + Sync + 'static>(
        &self,
        id: EntityId,
    ) -> Option<ComponentMut<T>> {
        let guard = self.storage::<T>()?.acquire_write();
        guard.get(id)?;
        Some(ComponentMut { guard, id })
    }

    // ------------------------------------------------------------------
    // Joins (smallest-storage-first)
    // ------------------------------------------------------------------

    /// Visit every entity holding both `A` and `B`. Drives the smaller
    /// storage and probes the other.
    pub fn for_each2<A, B, F>(&self, mut f: F)
    where
        A: Send + Sync + 'static,
        B: Send + Sync + 'static,
        F: FnMut(EntityId, &A, &B),
    {
        let (Some(sa), Some(sb)) = (self.storage::<A>(), self.storage::<B>()) else {
            return;
        };
        let a = sa.acquire_read();
        let b = sb.acquire_read();
        if a.len() <= b.len() {
            for slot in 0..a.len() {
                let id = a.entity_at(slot);
                if let Some(vb) = b.get(id) {
                    f(id, a.item_at(slot), vb);
                }
            }
        } else {
            for slot in 0..b.len() {
                let id = b.entity_at(slot);
                if let Some(va) = a.get(id) {
                    f(id, va, b.item_at(slot));
                }
            }
        }
    }

    /// Visit every entity holding `A`, `B` and `C`.
    pub fn for_each3<A, B, C, F>(&self, mut f: F)
    where
        A: Send + Sync + 'static,
        B: Send + Sync + 'static,
        C: Send + Sync + 'static,
        F: FnMut(EntityId, &A, &B, &C),
    {
        let (Some(sa), Some(sb), Some(sc)) =
            (self.storage::<A>(), self.storage::<B>(), self.storage::<C>())
        else {
            return;
        };
        let a = sa.acquire_read();
        let b = sb.acquire_read();
        let c = sc.acquire_read();
        // drive the smallest of the three
        let lens = [a.len(), b.len(), c.len()];
        let driver = lens
            .iter()
            .enumerate()
            .min_by_key(|(_, l)| **l)
            .map(|(i, _)| i)
            .unwrap_or(0);
        match driver {
            0 => {
                for slot in 0..a.len() {
                    let id = a.entity_at(slot);
                    if let (Some(vb), Some(vc)) = (b.get(id), c.get(id)) {
                        f(id, a.item_at(slot), vb, vc);
                    }
                }
            }
            1 => {
                for slot in 0..b.len() {
                    let id = b.entity_at(slot);
                    if let (Some(va), Some(vc)) = (a.get(id), c.get(id)) {
                        f(id, va, b.item_at(slot), vc);
                    }
                }
            }
            _ => {
                for slot in 0..c.len() {
                    let id = c.entity_at(slot);
                    if let (Some(va), Some(vb)) = (a.get(id), b.get(id)) {
                        f(id, va, vb, c.item_at(slot));
                    }
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Frame state
    // ------------------------------------------------------------------

    /// Record frame counters and clear extraction buffers. Call once per
    /// frame before stage execution.
    pub fn begin_frame(&self, frame_index: u64, dt: f32) {
        self.frame_index.store(frame_index, Ordering::Release);
        self.dt_bits.store(dt.to_bits() as u64, Ordering::Release);
        self.extraction.clear();
    }

    pub fn frame(&self) -> FrameInfo {
        FrameInfo {
            frame_index: self.frame_index.load(Ordering::Acquire),
            dt: f32::from_bits(self.dt_bits.load(Ordering::Acquire) as u32),
        }
    }
}

/// Shared borrow of one entity's component. Holds the storage read lock.
pub struct ComponentRef<T: Send + Sync + 'static> {
    guard: ReadGuard<T>,
    id: EntityId,
}

impl<T: Send + Sync + 'static> std::ops::Deref for ComponentRef<T> {
    type Target = T;
    fn deref(&self) -> &T {
        self.guard.get(self.id).expect("checked at construction")
    }
}

/// Exclusive borrow of one entity's component. Holds the storage write lock.
pub struct ComponentMut<T: Send + Sync + 'static> {
    guard: WriteGuard<T>,
    id: EntityId,
}

impl<T: Send + Sync + 'static> std::ops::Deref for ComponentMut<T> {
    type Target = T;
    fn deref(&self) -> &T {
        self.guard.get(self.id).expect("checked at construction")
    }
}

impl<T: Send + Sync + 'static> std::ops::DerefMut for ComponentMut<T> {
    fn deref_mut(&mut self) -> &mut T {
        self.guard.get_mut(self.id).expect("checked at construction")
    }
}
