// src/accel.rs
//! Acceleration-structure orchestration: per-geometry BLAS records with
//! atomic publish-replace, and a TLAS worker that collects BLAS results
//! through an atomic slot array and publishes with one pointer swap.
//!
//! The GPU builds themselves are injected; the core owns identity,
//! publication, dependency collection and retirement. Retired records stay
//! on their lists until the main thread drains them at a safe frame
//! boundary, which is what makes the acquire-load readers sound.

use std::sync::atomic::{AtomicPtr, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::Result;
use crate::handoff::{RetireList, SlotArray};
use crate::thread_pool::{Priority, ThreadPool, WorkKind};

/// Scene-allocated geometry identity; indexes the BLAS registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GeometryId(pub u32);

/// One built bottom-level structure: device address + bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlasRecord {
    pub geometry: GeometryId,
    pub device_address: u64,
}

/// One built top-level structure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlasRecord {
    pub device_address: u64,
    pub generation: u64,
    pub blas_addresses: Vec<u64>,
}

// ============================================================================
// 1. BLAS REGISTRY
// ============================================================================

/// Atomic-pointer slots keyed by geometry id. Publish-replace on an existing
/// slot is a lock-free swap; only growth serializes, under a short write
/// lock that replacement never takes.
pub struct BlasRegistry {
    slots: RwLock<Vec<AtomicPtr<BlasRecord>>>,
    retired: RetireList<BlasRecord>,
}

impl Default for BlasRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl BlasRegistry {
    pub fn new() -> Self {
        Self {
            slots: RwLock::new(Vec::new()),
            retired: RetireList::new(),
        }
    }

    fn ensure_capacity(&self, len: usize) {
        if self.slots.read().len() >= len {
            return;
        }
        let mut slots = self.slots.write();
        while slots.len() < len {
            slots.push(AtomicPtr::new(std::ptr::null_mut()));
        }
    }

    /// Publish a freshly built BLAS. The superseded record (if any) moves to
    /// the retirement list for a safe-frame release.
    pub fn publish(&self, record: BlasRecord) {
        let index = record.geometry.0 as usize;
        self.ensure_capacity(index + 1);
        let raw = Box::into_raw(Box::new(record));
        let slots = self.slots.read();
        let old = slots[index].swap(raw, Ordering::AcqRel);
        if !old.is_null() {
            // SAFETY: old came out of this slot's Box::into_raw; the swap
            // made this thread its only owner.
            let boxed = unsafe { Box::from_raw(old) };
            self.retired.push(*boxed);
        }
    }

    /// The current device address for a geometry, if a BLAS exists.
    pub fn device_address(&self, geometry: GeometryId) -> Option<u64> {
        let slots = self.slots.read();
        let slot = slots.get(geometry.0 as usize)?;
        let raw = slot.load(Ordering::Acquire);
        if raw.is_null() {
            None
        } else {
            // SAFETY: published records are only freed by the retirement
            // drain at a frame boundary, never while workers still read.
            Some(unsafe { (*raw).device_address })
        }
    }

    /// Retired records awaiting release. Main thread, between frames.
    pub fn drain_retired(&self) -> Vec<BlasRecord> {
        self.retired.drain()
    }

    pub fn capacity(&self) -> usize {
        self.slots.read().len()
    }
}

impl Drop for BlasRegistry {
    fn drop(&mut self) {
        let slots = self.slots.get_mut();
        for slot in slots.iter() {
            let raw = slot.swap(std::ptr::null_mut(), Ordering::AcqRel);
            if !raw.is_null() {
                // SAFETY: sole owner during drop.
                drop(unsafe { Box::from_raw(raw) });
            }
        }
    }
}

// ============================================================================
// 2. TLAS REGISTRY
// ============================================================================

/// Single atomic pointer to the currently published TLAS.
pub struct TlasRegistry {
    current: AtomicPtr<TlasRecord>,
    generation: AtomicU64,
    retired: RetireList<TlasRecord>,
}

impl Default for TlasRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl TlasRegistry {
    pub fn new() -> Self {
        Self {
            current: AtomicPtr::new(std::ptr::null_mut()),
            generation: AtomicU64::new(0),
            retired: RetireList::new(),
        }
    }

    /// Swap in a new TLAS; the superseded record joins the per-frame
    /// retirement list. Returns the published generation.
    pub fn publish(&self, device_address: u64, blas_addresses: Vec<u64>) -> u64 {
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        let raw = Box::into_raw(Box::new(TlasRecord {
            device_address,
            generation,
            blas_addresses,
        }));
        let old = self.current.swap(raw, Ordering::AcqRel);
        if !old.is_null() {
            // SAFETY: same single-owner argument as the BLAS swap.
            let boxed = unsafe { Box::from_raw(old) };
            self.retired.push(*boxed);
        }
        generation
    }

    /// The render consumer's view: the whole old TLAS or the whole new one,
    /// never a partial structure.
    pub fn current(&self) -> Option<TlasRecord> {
        let raw = self.current.load(Ordering::Acquire);
        if raw.is_null() {
            None
        } else {
            // SAFETY: retirement is deferred to a safe frame boundary, so
            // the record outlives every in-frame reader.
            Some(unsafe { (*raw).clone() })
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    pub fn drain_retired(&self) -> Vec<TlasRecord> {
        self.retired.drain()
    }
}

impl Drop for TlasRegistry {
    fn drop(&mut self) {
        let raw = self.current.swap(std::ptr::null_mut(), Ordering::AcqRel);
        if !raw.is_null() {
            // SAFETY: sole owner during drop.
            drop(unsafe { Box::from_raw(raw) });
        }
    }
}

// ============================================================================
// 3. ORCHESTRATOR
// ============================================================================

/// What the frame update hands to a rebuild: the geometries the scene
/// requires right now.
#[derive(Debug, Clone, Default)]
pub struct SceneGeometry {
    pub geometries: Vec<GeometryId>,
    /// Transforms moved but no geometry changed; every BLAS is expected to
    /// already be present.
    pub transform_only: bool,
}

struct BlasSlot {
    geometry: GeometryId,
    device_address: Option<u64>,
}

type BlasBuildFn = dyn Fn(GeometryId) -> Result<u64> + Send + Sync;
type TlasBuildFn = dyn Fn(&[u64]) -> u64 + Send + Sync;

/// Owns both registries and runs the TLAS worker. Build functions are
/// injected by the renderer; a failing BLAS build leaves its instance out of
/// the TLAS for the frame.
pub struct AccelOrchestrator {
    pub blas: BlasRegistry,
    pub tlas: TlasRegistry,
    blas_build: Box<BlasBuildFn>,
    tlas_build: Box<TlasBuildFn>,
}

impl AccelOrchestrator {
    pub fn new<B, T>(blas_build: B, tlas_build: T) -> Arc<Self>
    where
        B: Fn(GeometryId) -> Result<u64> + Send + Sync + 'static,
        T: Fn(&[u64]) -> u64 + Send + Sync + 'static,
    {
        Arc::new(Self {
            blas: BlasRegistry::new(),
            tlas: TlasRegistry::new(),
            blas_build: Box::new(blas_build),
            tlas_build: Box::new(tlas_build),
        })
    }

    /// Submit one rebuild as a high-priority *bvh-build* work item. The
    /// worker runs exactly once per request; no hot polling.
    pub fn request_rebuild(
        self: &Arc<Self>,
        scene: SceneGeometry,
        pool: &Arc<ThreadPool>,
    ) -> Result<()> {
        let this = Arc::clone(self);
        let pool_for_job = Arc::clone(pool);
        pool.submit_with(Priority::High, WorkKind::BvhBuild, move || {
            this.run_tlas_job(scene, &pool_for_job)
        })
    }

    /// The TLAS worker body. Collects required BLAS through the slot array,
    /// spawning builds for the missing ones, then builds and publishes.
    fn run_tlas_job(self: Arc<Self>, scene: SceneGeometry, pool: &Arc<ThreadPool>) -> Result<()> {
        let required = scene.geometries;
        if required.is_empty() {
            return Ok(()); // nothing to trace; keep the previous TLAS
        }
        let slots = Arc::new(SlotArray::<BlasSlot>::new(required.len() as u32));

        let mut missing = 0usize;
        for (index, &geometry) in required.iter().enumerate() {
            if let Some(device_address) = self.blas.device_address(geometry) {
                slots.fill(
                    index,
                    Box::new(BlasSlot {
                        geometry,
                        device_address: Some(device_address),
                    }),
                );
                continue;
            }
            if scene.transform_only {
                log::warn!(
                    "transform-only rebuild missing BLAS for geometry {}",
                    geometry.0
                );
            }
            missing += 1;
            let this = Arc::clone(&self);
            let slots = Arc::clone(&slots);
            pool.submit_with(Priority::High, WorkKind::BvhBuild, move || {
                match (this.blas_build)(geometry) {
                    Ok(device_address) => {
                        this.blas.publish(BlasRecord {
                            geometry,
                            device_address,
                        });
                        slots.fill(
                            index,
                            Box::new(BlasSlot {
                                geometry,
                                device_address: Some(device_address),
                            }),
                        );
                        Ok(())
                    }
                    Err(e) => {
                        // the TLAS omits this instance for the frame
                        slots.fill(
                            index,
                            Box::new(BlasSlot {
                                geometry,
                                device_address: None,
                            }),
                        );
                        Err(e.context(format!("building BLAS for geometry {}", geometry.0)))
                    }
                }
            })?;
        }
        if missing > 0 {
            pool.request_workers(WorkKind::BvhBuild, missing.min(4));
        }

        slots.wait_complete();

        let mut blas_addresses = Vec::with_capacity(required.len());
        for result in slots.take_results().into_iter().flatten() {
            if let Some(device_address) = result.device_address {
                blas_addresses.push(device_address);
            } else {
                log::debug!("TLAS omits geometry {} this frame", result.geometry.0);
            }
        }

        let device_address = (self.tlas_build)(&blas_addresses);
        let generation = self.tlas.publish(device_address, blas_addresses);
        log::trace!("published TLAS generation {}", generation);
        Ok(())
    }

    /// Drain both retirement lists at the safe frame boundary. Returns
    /// (retired BLAS, retired TLAS) for the renderer to free.
    pub fn drain_retired(&self) -> (Vec<BlasRecord>, Vec<TlasRecord>) {
        (self.blas.drain_retired(), self.tlas.drain_retired())
    }
}
