// src/engine.rs
//! The core orchestrator: owns the pool, the world, the scheduler, the
//! scripting runtime, the acceleration-structure orchestrator and the render
//! handoff, and fixes the per-frame order in one place.
//!
//! Per frame (main thread): tick the clock, begin the world frame, run the
//! main-thread dispatcher, execute the stages, publish the snapshot, and
//! drain retirement lists once the render thread has caught up.

use std::sync::Arc;
use std::time::Duration;

use crate::accel::AccelOrchestrator;
use crate::config::CoreConfig;
use crate::cvar::CvarRegistry;
use crate::diagnostics::{Diagnostics, DiagnosticsSnapshot};
use crate::ecs::{Scheduler, World};
use crate::error::Result;
use crate::render::{RenderHandoff, RenderSnapshot};
use crate::scripting::{ActionQueue, MainDispatcher, ScriptRunner, StatePool};
use crate::thread_pool::{PoolStats, Priority, SubsystemConfig, ThreadPool, WorkKind};
use crate::time::{FrameClock, FrameTime};

/// Aggregated stats for overlays and shutdown logs.
#[derive(Debug, Clone)]
pub struct EngineStats {
    pub pool: PoolStats,
    pub diagnostics: DiagnosticsSnapshot,
    pub stages: Vec<crate::ecs::scheduler::StageStats>,
    pub frame: u64,
}

pub struct EngineCore {
    config: CoreConfig,
    diagnostics: Arc<Diagnostics>,
    pool: Arc<ThreadPool>,
    world: World,
    scheduler: Scheduler,
    cvars: Arc<CvarRegistry>,
    actions: Arc<ActionQueue>,
    scripts: ScriptRunner,
    dispatcher: MainDispatcher,
    accel: Arc<AccelOrchestrator>,
    render: Arc<RenderHandoff>,
    clock: FrameClock,
}

impl EngineCore {
    /// Wire the core together. The interpreter-state pool and the
    /// acceleration-structure builders are injected; everything else comes
    /// from the configuration record.
    pub fn new(config: CoreConfig, states: StatePool, accel: Arc<AccelOrchestrator>) -> Self {
        let diagnostics = Arc::new(Diagnostics::new());
        let pool = Arc::new(ThreadPool::new(
            config.max_workers,
            Duration::from_secs(config.worker_idle_timeout_secs),
            diagnostics.clone(),
        ));
        for budget in &config.subsystems {
            pool.register_subsystem(SubsystemConfig {
                name: budget.name.clone(),
                min_workers: budget.min_workers,
                max_workers: budget.max_workers,
                priority: budget.priority,
                kind: budget.kind,
            });
        }

        let world = World::new(diagnostics.clone());
        let ecs_priority = config
            .subsystems
            .iter()
            .find(|s| s.kind == WorkKind::Ecs)
            .map(|s| s.priority)
            .unwrap_or(Priority::Normal);
        let scheduler = Scheduler::new(ecs_priority, config.stage_budget_us);
        let cvars = Arc::new(CvarRegistry::new());
        let actions = ActionQueue::new(config.action_queue_capacity);
        let scripts = ScriptRunner::new(
            pool.clone(),
            states.clone(),
            actions.clone(),
            diagnostics.clone(),
        );
        let dispatcher =
            MainDispatcher::new(actions.clone(), states, cvars.clone(), diagnostics.clone());
        let render = RenderHandoff::new(diagnostics.clone());

        Self {
            config,
            diagnostics,
            pool,
            world,
            scheduler,
            cvars,
            actions,
            scripts,
            dispatcher,
            accel,
            render,
            clock: FrameClock::new(),
        }
    }

    // ------------------------------------------------------------------
    // Frame loop
    // ------------------------------------------------------------------

    /// Run one whole frame on the main thread.
    pub fn update(&mut self) -> Result<FrameTime> {
        let time = self.clock.tick();
        self.world.begin_frame(time.frame, time.delta);

        // apply deferred side effects before simulation reads the world
        self.dispatcher.tick();

        self.scheduler.run(&self.world, &self.pool)?;

        self.publish_frame(time.frame);
        self.drain_retirement(time.frame);
        Ok(time)
    }

    fn publish_frame(&mut self, frame_index: u64) {
        let tlas_generation = match self.accel.tlas.generation() {
            0 => None,
            g => Some(g),
        };
        self.render.publish_snapshot(RenderSnapshot {
            frame_index,
            instances: self.world.extraction.take_instances(),
            tlas_generation,
        });
    }

    /// Free retired BLAS/TLAS records once the render thread has finished
    /// consuming the previous frame's snapshot.
    fn drain_retirement(&mut self, frame_index: u64) {
        if !self.render.retirement_safe(frame_index) {
            return;
        }
        let (blas, tlas) = self.accel.drain_retired();
        if !blas.is_empty() || !tlas.is_empty() {
            log::trace!(
                "frame {}: released {} BLAS / {} TLAS records",
                frame_index,
                blas.len(),
                tlas.len()
            );
        }
    }

    /// Device-loss-equivalent condition from the renderer: log it and begin
    /// an orderly shutdown. Every later `submit` fails explicitly.
    pub fn handle_fatal(&mut self, what: &str) {
        log::error!("fatal: {}; shutting the core down", what);
        self.shutdown();
    }

    /// Orderly shutdown: refuse new scripts, finalize interpreter states,
    /// stop the pool.
    pub fn shutdown(&mut self) {
        self.scripts.shutdown();
        self.scripts.state_pool().shutdown();
        self.pool.shutdown();
        let stats = self.stats();
        log::info!(
            "core shut down after frame {}: {} jobs completed, {} failed, {} misuse reports",
            stats.frame,
            stats.pool.completed,
            stats.pool.failed,
            stats.diagnostics.misuse
        );
    }

    // ------------------------------------------------------------------
    // Frame graph setup
    // ------------------------------------------------------------------

    pub fn add_stage(&mut self, name: &str) -> crate::ecs::StageIndex {
        self.scheduler.add_stage(name)
    }

    /// Attach a system; conflict checks run against the engine's world.
    pub fn add_system(&mut self, stage: crate::ecs::StageIndex, system: crate::ecs::SystemDesc) {
        self.scheduler.add_system(stage, system, &self.world);
    }

    // ------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    pub fn world(&self) -> &World {
        &self.world
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn scheduler_mut(&mut self) -> &mut Scheduler {
        &mut self.scheduler
    }

    pub fn pool(&self) -> &Arc<ThreadPool> {
        &self.pool
    }

    pub fn cvars(&self) -> &Arc<CvarRegistry> {
        &self.cvars
    }

    pub fn actions(&self) -> &Arc<ActionQueue> {
        &self.actions
    }

    pub fn scripts(&self) -> &ScriptRunner {
        &self.scripts
    }

    pub fn dispatcher_mut(&mut self) -> &mut MainDispatcher {
        &mut self.dispatcher
    }

    pub fn accel(&self) -> &Arc<AccelOrchestrator> {
        &self.accel
    }

    pub fn render(&self) -> &Arc<RenderHandoff> {
        &self.render
    }

    pub fn stats(&self) -> EngineStats {
        EngineStats {
            pool: self.pool.stats(),
            diagnostics: self.diagnostics.snapshot(),
            stages: self.scheduler.stats(),
            frame: self.clock.frame(),
        }
    }
}
