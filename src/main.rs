// src/main.rs
//! Demo driver for the runtime core: a headless frame loop with a toy
//! arithmetic "interpreter", a few thousand moving entities, a cvar change
//! and one TLAS rebuild. Run with RUST_LOG=debug for the play-by-play.

use std::sync::Arc;

use anyhow::Context as _;
use glam::Vec3;

use ember_engine::accel::{AccelOrchestrator, GeometryId, SceneGeometry};
use ember_engine::ecs::extraction::{extraction_system, RenderInstance};
use ember_engine::ecs::transform::{transform_update_system, Transform, Velocity};
use ember_engine::scripting::{ScriptOutcome, ScriptState, StatePool};
use ember_engine::{CoreConfig, EngineCore};

/// Stand-in interpreter: evaluates "+"-separated integer expressions and
/// logs handler invocations.
struct CalcState;

impl ScriptState for CalcState {
    fn execute(&mut self, source: &[u8]) -> ScriptOutcome {
        let text = String::from_utf8_lossy(source);
        let expr = text.trim().trim_start_matches("return").trim();
        let mut total = 0i64;
        for part in expr.split('+') {
            match part.trim().parse::<i64>() {
                Ok(v) => total += v,
                Err(_) => return ScriptOutcome::failed(format!("cannot evaluate '{expr}'")),
            }
        }
        ScriptOutcome::ok(total.to_string())
    }

    fn call_handler(
        &mut self,
        handler: &str,
        name: &str,
        old: &str,
        new: &str,
    ) -> ember_engine::Result<()> {
        log::info!("[script] {handler}({name}: {old} -> {new})");
        Ok(())
    }
}

fn main() -> anyhow::Result<()> {
    // one logging frontend: the tracing subscriber also bridges `log` records
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = CoreConfig::default();
    let states = StatePool::new(
        config.resolved_state_pool_size(),
        || Box::new(CalcState),
        |_| {},
    );
    // fake GPU builds: a BLAS is its geometry id in a made-up address space
    let accel = AccelOrchestrator::new(
        |g| Ok(0xB1A5_0000 + g.0 as u64),
        |blas| 0x71A5_0000 + blas.len() as u64,
    );

    let chunk = config.ecs_chunk_size;
    let mut core = EngineCore::new(config, states, Arc::clone(&accel));

    core.world().register_component::<Transform>("transform");
    core.world().register_component::<Velocity>("velocity");
    core.world()
        .register_component::<RenderInstance>("render_instance");

    let sim = core
        .scheduler()
        .stage_index("physics_animation")
        .context("default stage missing")?;
    let extract = core
        .scheduler()
        .stage_index("render_extraction")
        .context("default stage missing")?;
    core.add_system(sim, transform_update_system(chunk));
    core.add_system(extract, extraction_system(chunk));

    // a field of drifting props
    for i in 0..5_000u32 {
        let id = core.world().create_entity("prop");
        core.world().add_component(
            id,
            Transform::from_translation(Vec3::new(i as f32 * 0.1, 0.0, 0.0)),
        );
        core.world()
            .add_component(id, Velocity(Vec3::new(0.0, 1.0, 0.0)));
        core.world().add_component(
            id,
            RenderInstance {
                material: i % 16,
                visible: true,
            },
        );
    }

    core.cvars().register("fov", "60", Some("OnFovChanged"));
    core.scripts()
        .enqueue_script(b"return 2 + 2", None, None)
        .context("enqueueing demo script")?;
    accel
        .request_rebuild(
            SceneGeometry {
                geometries: (0..8).map(GeometryId).collect(),
                transform_only: false,
            },
            core.pool(),
        )
        .context("requesting TLAS rebuild")?;

    for frame in 0..120u64 {
        if frame == 30 {
            core.cvars().set("fov", "90");
        }
        core.update()?;

        // a real render thread would execute these; here we just consume
        if let Some(snapshot) = core.render().take_snapshot() {
            core.render().signal_frame_consumed(snapshot.frame_index);
        }
    }

    let stats = core.stats();
    log::info!(
        "120 frames: {} jobs completed, {} failed, peak {} workers, TLAS gen {}",
        stats.pool.completed,
        stats.pool.failed,
        stats.pool.peak_workers,
        accel.tlas.generation()
    );
    for stage in &stats.stages {
        log::debug!(
            "stage {:<18} jobs={:<4} {}us",
            stage.name,
            stage.last_job_count,
            stage.last_duration_ns / 1_000
        );
    }

    core.shutdown();
    Ok(())
}
