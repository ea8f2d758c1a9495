// src/ecs/extraction.rs
//! Render extraction: contiguous per-entity data the render thread consumes
//! after the snapshot flip.
//!
//! Extraction jobs stage records per chunk and publish them into the
//! world-owned buffers with one short append. The engine moves the buffers
//! into the published snapshot at the end of the frame.

use std::sync::Arc;

use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Vec3};
use parking_lot::Mutex;

use super::scheduler::{AccessSet, SystemDesc};
use super::transform::Transform;
use super::World;

/// Marks an entity as renderable and selects its material.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RenderInstance {
    pub material: u32,
    pub visible: bool,
}

/// One extracted renderable, laid out for direct GPU upload.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct ExtractedInstance {
    pub world: Mat4,
    pub position: Vec3,
    pub material: u32,
}

/// World-owned extraction arrays, cleared by `begin_frame`.
pub struct ExtractionBuffers {
    instances: Mutex<Vec<ExtractedInstance>>,
}

impl Default for ExtractionBuffers {
    fn default() -> Self {
        Self::new()
    }
}

impl ExtractionBuffers {
    pub fn new() -> Self {
        Self {
            instances: Mutex::new(Vec::new()),
        }
    }

    pub fn clear(&self) {
        self.instances.lock().clear();
    }

    /// Short publish step for a chunk's staged records.
    pub fn append_instances(&self, staged: Vec<ExtractedInstance>) {
        self.instances.lock().extend(staged);
    }

    /// Move the frame's records out (the engine hands them to the snapshot).
    pub fn take_instances(&self) -> Vec<ExtractedInstance> {
        std::mem::take(&mut *self.instances.lock())
    }

    pub fn instance_count(&self) -> usize {
        self.instances.lock().len()
    }
}

struct ExtractCtx {
    transforms: super::storage::ReadGuard<Transform>,
    instances: super::storage::ReadGuard<RenderInstance>,
    buffers: Arc<ExtractionBuffers>,
}

/// Build the extraction system for the `render_extraction` stage. Drives the
/// `RenderInstance` storage and probes transforms; invisible instances and
/// entities without a transform are skipped.
pub fn extraction_system(chunk_size: usize) -> SystemDesc {
    let chunk = chunk_size.max(1);
    SystemDesc::new("extract_instances", move |world: &World, builder| {
        let (Some(ts), Some(rs)) = (
            world.storage::<Transform>(),
            world.storage::<RenderInstance>(),
        ) else {
            return;
        };
        let ctx = ExtractCtx {
            transforms: ts.acquire_read(),
            instances: rs.acquire_read(),
            buffers: Arc::clone(&world.extraction),
        };
        let n = ctx.instances.len();
        if n == 0 {
            return;
        }

        if n <= chunk {
            let mut staged = Vec::with_capacity(n);
            extract_range(&ctx, 0, n, &mut staged);
            ctx.buffers.append_instances(staged);
            return;
        }

        let ctx = Arc::new(ctx);
        let mut start = 0;
        while start < n {
            let end = (start + chunk).min(n);
            let ctx = Arc::clone(&ctx);
            builder.spawn(move || {
                // stage locally, publish once
                let mut staged = Vec::with_capacity(end - start);
                extract_range(&ctx, start, end, &mut staged);
                ctx.buffers.append_instances(staged);
                Ok(())
            });
            start = end;
        }
    })
    .with_access(
        AccessSet::new()
            .reads::<Transform>()
            .reads::<RenderInstance>(),
    )
}

fn extract_range(ctx: &ExtractCtx, start: usize, end: usize, out: &mut Vec<ExtractedInstance>) {
    for slot in start..end {
        let inst = ctx.instances.item_at(slot);
        if !inst.visible {
            continue;
        }
        let id = ctx.instances.entity_at(slot);
        if let Some(t) = ctx.transforms.get(id) {
            out.push(ExtractedInstance {
                world: t.world,
                position: t.world.w_axis.truncate(),
                material: inst.material,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagnostics::Diagnostics;
    use crate::ecs::transform::{transform_update_system, Velocity};
    use crate::ecs::Scheduler;
    use crate::thread_pool::{Priority, ThreadPool};
    use std::time::Duration;

    #[test]
    fn extraction_collects_visible_instances() {
        let diag = Arc::new(Diagnostics::new());
        let world = World::new(diag.clone());
        world.register_component::<Transform>("transform");
        world.register_component::<Velocity>("velocity");
        world.register_component::<RenderInstance>("render_instance");
        let pool = ThreadPool::new(4, Duration::from_secs(2), diag);

        let mut sched = Scheduler::new(Priority::Normal, 0);
        let sim = sched.stage_index("physics_animation").unwrap();
        let extract = sched.stage_index("render_extraction").unwrap();
        sched.add_system(sim, transform_update_system(256), &world);
        sched.add_system(extract, extraction_system(256), &world);

        for i in 0..1000u32 {
            let id = world.create_entity("prop");
            world.add_component(id, Transform::from_translation(Vec3::new(i as f32, 0.0, 0.0)));
            world.add_component(
                id,
                RenderInstance {
                    material: i % 7,
                    visible: i % 10 != 0, // every tenth is hidden
                },
            );
        }

        world.begin_frame(1, 0.016);
        sched.run(&world, &pool).unwrap();

        let instances = world.extraction.take_instances();
        assert_eq!(instances.len(), 900);
        for inst in &instances {
            assert!(inst.material < 7);
            assert_eq!(inst.position, inst.world.w_axis.truncate());
        }

        // next frame starts clean
        world.begin_frame(2, 0.016);
        assert_eq!(world.extraction.instance_count(), 0);
        pool.shutdown();
    }

    #[test]
    fn zero_instances_short_circuit() {
        let diag = Arc::new(Diagnostics::new());
        let world = World::new(diag.clone());
        world.register_component::<Transform>("transform");
        world.register_component::<RenderInstance>("render_instance");
        let pool = ThreadPool::new(2, Duration::from_secs(2), diag);
        let mut sched = Scheduler::new(Priority::Normal, 0);
        let extract = sched.stage_index("render_extraction").unwrap();
        sched.add_system(extract, extraction_system(256), &world);

        world.begin_frame(1, 0.016);
        sched.run(&world, &pool).unwrap();
        assert_eq!(sched.stage_stats(extract).unwrap().last_job_count, 0);
        assert_eq!(world.extraction.instance_count(), 0);
        pool.shutdown();
    }
}
