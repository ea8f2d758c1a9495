// src/ecs/transform.rs
//! Transform components and the chunked transform-update system.
//!
//! Each transform carries local TRS, an optional parent entity, and a cached
//! world matrix with a dirty flag. The update system integrates velocities,
//! recomputes local matrices for dirty entries in parallel windows, and (when
//! any entity is parented) runs one ordered propagation job that multiplies
//! parent world x local in parent-first order.
//!
//! Cyclic parent chains are a programmer error: the propagation pass detects
//! them, reports a diagnostic, and isolates the affected subtree for the
//! frame instead of looping.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use glam::{Mat4, Quat, Vec3};
use parking_lot::Mutex;

use crate::diagnostics::Diagnostics;

use super::scheduler::{AccessSet, SystemDesc};
use super::storage::{ReadGuard, WriteGuard};
use super::{EntityId, World};

// ============================================================================
// 1. COMPONENTS
// ============================================================================

/// Linear velocity, units per second.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Velocity(pub Vec3);

/// Local TRS + cached matrices. `dirty` marks entries whose matrices need
/// recomputing this frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Transform {
    pub translation: Vec3,
    pub rotation: Quat,
    pub scale: Vec3,
    pub parent: Option<EntityId>,
    pub local: Mat4,
    pub world: Mat4,
    pub dirty: bool,
}

impl Default for Transform {
    fn default() -> Self {
        Self::identity()
    }
}

impl Transform {
    pub fn identity() -> Self {
        Self {
            translation: Vec3::ZERO,
            rotation: Quat::IDENTITY,
            scale: Vec3::ONE,
            parent: None,
            local: Mat4::IDENTITY,
            world: Mat4::IDENTITY,
            dirty: true,
        }
    }

    pub fn from_translation(translation: Vec3) -> Self {
        Self {
            translation,
            ..Self::identity()
        }
    }

    pub fn with_parent(mut self, parent: EntityId) -> Self {
        self.parent = Some(parent);
        self
    }

    /// Recompute the local matrix from TRS.
    pub fn update_local(&mut self) {
        self.local = Mat4::from_scale_rotation_translation(self.scale, self.rotation, self.translation);
    }
}

// ============================================================================
// 2. UPDATE SYSTEM (canonical chunked job)
// ============================================================================

struct UpdateCtx {
    velocities: ReadGuard<Velocity>,
    /// Held here for the lifetime of the stage's jobs; the propagation job
    /// takes it, otherwise the last window job's context drop releases it.
    transforms: Mutex<Option<WriteGuard<Transform>>>,
    windows_remaining: AtomicU32,
    dt: f32,
    flat: bool,
    diagnostics: Arc<Diagnostics>,
}

/// Build the transform-update system. Integrates `Velocity` into
/// `Transform`, refreshes local matrices, and resolves world matrices —
/// inline when everything fits one chunk, otherwise as window jobs plus (for
/// parented scenes) one ordered propagation job.
pub fn transform_update_system(chunk_size: usize) -> SystemDesc {
    let chunk = chunk_size.max(1);
    SystemDesc::new("transform_update", move |world: &World, builder| {
        let (Some(ts), Some(vs)) = (world.storage::<Transform>(), world.storage::<Velocity>())
        else {
            return;
        };
        let velocities = vs.acquire_read();
        let mut transforms = ts.acquire_write();
        let n = transforms.len();
        if n == 0 {
            return; // guards drop here; no jobs, no barriers
        }
        let dt = world.frame().dt;
        let flat = (0..n).all(|slot| transforms.item_at(slot).parent.is_none());

        if n <= chunk && flat {
            // single chunk, no hierarchy: process inline and release guards
            for slot in 0..n {
                let id = transforms.entity_at(slot);
                let v = velocities.get(id).copied();
                let t = transforms.item_at_mut(slot);
                integrate(t, v, dt, true);
            }
            return;
        }

        let windows = transforms.windows(chunk);
        let shared = Arc::new(UpdateCtx {
            velocities,
            transforms: Mutex::new(Some(transforms)),
            windows_remaining: AtomicU32::new(windows.len() as u32),
            dt,
            flat,
            diagnostics: world.diagnostics.clone(),
        });

        for mut window in windows {
            let ctx = Arc::clone(&shared);
            builder.spawn(move || {
                for slot in window.range() {
                    let id = window.entity_at(slot);
                    let v = ctx.velocities.get(id).copied();
                    integrate(window.item_mut(slot), v, ctx.dt, ctx.flat);
                }
                ctx.windows_remaining.fetch_sub(1, Ordering::AcqRel);
                Ok(())
            });
        }

        if !flat {
            // Submitted after the window jobs in the same priority class, so
            // every window job has at least started when this one runs; the
            // wait below is bounded by their remaining work.
            let ctx = Arc::clone(&shared);
            builder.spawn(move || {
                let mut spins = 0u32;
                while ctx.windows_remaining.load(Ordering::Acquire) > 0 {
                    spins += 1;
                    if spins < 128 {
                        std::hint::spin_loop();
                    } else {
                        std::thread::yield_now();
                    }
                }
                let mut guard = ctx
                    .transforms
                    .lock()
                    .take()
                    .expect("propagation job runs once per stage");
                propagate_worlds(&mut guard, &ctx.diagnostics);
                Ok(())
            });
        }
    })
    .with_access(AccessSet::new().reads::<Velocity>().writes::<Transform>())
}

#[inline]
fn integrate(t: &mut Transform, v: Option<Velocity>, dt: f32, flat: bool) {
    if let Some(v) = v {
        t.translation += v.0 * dt;
        t.dirty = true;
    }
    if t.dirty {
        t.update_local();
        if flat {
            t.world = t.local;
            t.dirty = false;
        }
    }
}

// ============================================================================
// 3. WORLD PROPAGATION (parent-first, cycle-guarded)
// ============================================================================

const FRESH: u8 = 0;
const ON_PATH: u8 = 1;
const RESOLVED: u8 = 2;

/// Resolve world matrices parent-first. An entity's world is recomputed when
/// it is dirty or any ancestor was recomputed this pass. A parent edge that
/// loops back onto the current path is a cycle: it is reported once and the
/// offending entity falls back to its local matrix for the frame.
fn propagate_worlds(tf: &mut WriteGuard<Transform>, diagnostics: &Diagnostics) {
    let n = tf.len();
    let mut state = vec![FRESH; n];
    let mut changed = vec![false; n];
    let mut stack: Vec<usize> = Vec::new();

    for start in 0..n {
        if state[start] != FRESH {
            continue;
        }
        stack.clear();
        stack.push(start);
        while let Some(&slot) = stack.last() {
            match state[slot] {
                FRESH => {
                    state[slot] = ON_PATH;
                    let parent_slot = tf
                        .item_at(slot)
                        .parent
                        .and_then(|pid| tf.slot_of(pid));
                    match parent_slot {
                        Some(p) if state[p] == FRESH => stack.push(p),
                        Some(p) if state[p] == ON_PATH => {
                            // the parent is an ancestor on the current path
                            let id = tf.entity_at(slot);
                            diagnostics.report_recoverable(&format!(
                                "transform parent cycle through entity {:?}; subtree isolated",
                                id
                            ));
                            let t = tf.item_at_mut(slot);
                            t.world = t.local;
                            t.dirty = false;
                            changed[slot] = true;
                            state[slot] = RESOLVED;
                            stack.pop();
                        }
                        _ => {} // parent resolved or absent: compute on revisit
                    }
                }
                ON_PATH => {
                    let parent_slot = tf
                        .item_at(slot)
                        .parent
                        .and_then(|pid| tf.slot_of(pid))
                        .filter(|&p| state[p] == RESOLVED);
                    let parent_changed = parent_slot.is_some_and(|p| changed[p]);
                    let parent_world = parent_slot.map(|p| tf.item_at(p).world);

                    let t = tf.item_at_mut(slot);
                    if t.dirty || parent_changed {
                        t.world = match parent_world {
                            Some(pw) => pw * t.local,
                            None => t.local,
                        };
                        t.dirty = false;
                        changed[slot] = true;
                    }
                    state[slot] = RESOLVED;
                    stack.pop();
                }
                _ => {
                    stack.pop();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ecs::Scheduler;
    use crate::thread_pool::{Priority, ThreadPool};
    use std::time::Duration;

    fn fixture() -> (World, ThreadPool, Scheduler) {
        let diag = Arc::new(Diagnostics::new());
        let world = World::new(diag.clone());
        world.register_component::<Transform>("transform");
        world.register_component::<Velocity>("velocity");
        let pool = ThreadPool::new(4, Duration::from_secs(2), diag);
        let sched = Scheduler::new(Priority::Normal, 0);
        (world, pool, sched)
    }

    #[test]
    fn chunked_update_moves_ten_thousand_entities() {
        let (world, pool, mut sched) = fixture();
        let stage = sched.add_stage("simulation");
        sched.add_system(stage, transform_update_system(256), &world);

        let mut ids = Vec::new();
        for i in 0..10_000u32 {
            let id = world.create_entity("mover");
            world.add_component(id, Transform::identity());
            world.add_component(id, Velocity(Vec3::new(1.0, 2.0, 3.0)));
            ids.push((i, id));
        }

        world.begin_frame(1, 0.016);
        sched.run(&world, &pool).unwrap();

        // 10,000 entities at chunk 256 -> 40 window jobs, no hierarchy job
        assert_eq!(sched.stage_stats(stage).unwrap().last_job_count, 40);

        let ts = world.storage::<Transform>().unwrap();
        let guard = ts.acquire_read();
        let expected = Vec3::new(1.0, 2.0, 3.0) * 0.016;
        for (_, id) in &ids {
            let t = guard.get(*id).unwrap();
            assert!((t.translation - expected).length() < 1e-6);
            assert!(!t.dirty, "dirty flag must be clear after the frame");
            assert!((t.world.w_axis.truncate() - expected).length() < 1e-6);
        }
        pool.shutdown();
    }

    #[test]
    fn zero_entities_spawn_no_jobs() {
        let (world, pool, mut sched) = fixture();
        let stage = sched.add_stage("simulation");
        sched.add_system(stage, transform_update_system(256), &world);
        world.begin_frame(1, 0.016);
        sched.run(&world, &pool).unwrap();
        assert_eq!(sched.stage_stats(stage).unwrap().last_job_count, 0);
        pool.shutdown();
    }

    #[test]
    fn child_world_composes_with_parent() {
        let (world, pool, mut sched) = fixture();
        let stage = sched.add_stage("simulation");
        sched.add_system(stage, transform_update_system(4), &world);

        let parent = world.create_entity("parent");
        world.add_component(parent, Transform::from_translation(Vec3::new(10.0, 0.0, 0.0)));
        world.add_component(parent, Velocity(Vec3::ZERO));
        let child = world.create_entity("child");
        world.add_component(
            child,
            Transform::from_translation(Vec3::new(0.0, 5.0, 0.0)).with_parent(parent),
        );
        // pad past one chunk so the windowed path runs
        for _ in 0..16 {
            let id = world.create_entity("pad");
            world.add_component(id, Transform::identity());
        }

        world.begin_frame(1, 0.016);
        sched.run(&world, &pool).unwrap();

        let ts = world.storage::<Transform>().unwrap();
        let guard = ts.acquire_read();
        let child_t = guard.get(child).unwrap();
        let world_pos = child_t.world.w_axis.truncate();
        assert!((world_pos - Vec3::new(10.0, 5.0, 0.0)).length() < 1e-5);
        assert!(!child_t.dirty);
        pool.shutdown();
    }

    #[test]
    fn parent_cycle_is_reported_and_isolated() {
        let (world, pool, mut sched) = fixture();
        let stage = sched.add_stage("simulation");
        sched.add_system(stage, transform_update_system(4), &world);

        let a = world.create_entity("a");
        let b = world.create_entity("b");
        world.add_component(
            a,
            Transform::from_translation(Vec3::new(1.0, 0.0, 0.0)).with_parent(b),
        );
        world.add_component(
            b,
            Transform::from_translation(Vec3::new(2.0, 0.0, 0.0)).with_parent(a),
        );
        for _ in 0..8 {
            let id = world.create_entity("pad");
            world.add_component(id, Transform::identity());
        }

        world.begin_frame(1, 0.016);
        sched.run(&world, &pool).unwrap();

        // one report, no hang, cycle members resolved against local space
        assert!(world.diagnostics.snapshot().misuse >= 1);
        let ts = world.storage::<Transform>().unwrap();
        let guard = ts.acquire_read();
        assert!(!guard.get(a).unwrap().dirty);
        assert!(!guard.get(b).unwrap().dirty);
        pool.shutdown();
    }
}
