// src/ecs/scheduler.rs
//! Staged job scheduler.
//!
//! A frame is an ordered list of stages; stages never overlap. Each stage
//! holds systems, each system a `prepare` that spawns 0..n jobs through a
//! [`JobBuilder`]. Spawned jobs are submitted to the thread pool under the
//! stage's subsystem tag and may run in any order, in parallel; the stage
//! completes when its counter drains, then the next stage starts.
//!
//! Chunking is a prepare-time decision: the canonical shape acquires guards
//! once, splits the dense range into windows, moves the guards into a shared
//! `Arc` context, and lets the last-finishing chunk release them.

use std::any::TypeId;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::{Condvar, Mutex};

use crate::error::{Error, Result};
use crate::thread_pool::{Priority, ThreadPool, WorkKind};

use super::World;

/// The six default per-frame phases, in execution order.
pub const DEFAULT_STAGES: [&str; 6] = [
    "asset_resolve",
    "input_script",
    "physics_animation",
    "visibility",
    "render_extraction",
    "presentation",
];

// ============================================================================
// 1. JOBS
// ============================================================================

type StageJob = Box<dyn FnOnce() -> Result<()> + Send + 'static>;

/// Collects the jobs one stage run will submit. Bound to the stage's scratch
/// list, which resets between stages.
pub struct JobBuilder<'a> {
    jobs: &'a mut Vec<StageJob>,
}

impl JobBuilder<'_> {
    /// Queue one job for this stage. The job runs on a pool worker.
    pub fn spawn<F>(&mut self, job: F)
    where
        F: FnOnce() -> Result<()> + Send + 'static,
    {
        self.jobs.push(Box::new(job));
    }

    pub fn job_count(&self) -> usize {
        self.jobs.len()
    }
}

/// Counts outstanding jobs of one stage; the main thread blocks on it.
struct Completion {
    remaining: Mutex<usize>,
    done: Condvar,
}

impl Completion {
    fn new(count: usize) -> Self {
        Self {
            remaining: Mutex::new(count),
            done: Condvar::new(),
        }
    }

    fn complete(&self) {
        let mut remaining = self.remaining.lock();
        *remaining -= 1;
        if *remaining == 0 {
            self.done.notify_all();
        }
    }

    fn wait(&self) {
        let mut remaining = self.remaining.lock();
        while *remaining > 0 {
            self.done.wait(&mut remaining);
        }
    }
}

/// Completes its counter even if the job body panics mid-run.
struct CompleteOnDrop(Arc<Completion>);

impl Drop for CompleteOnDrop {
    fn drop(&mut self) {
        self.0.complete();
    }
}

// ============================================================================
// 2. SYSTEMS
// ============================================================================

/// Component storages a system touches, declared at registration so the
/// scheduler can reject incompatible same-stage guard usage up front.
#[derive(Default)]
pub struct AccessSet {
    reads: Vec<TypeId>,
    writes: Vec<TypeId>,
}

impl AccessSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reads<T: 'static>(mut self) -> Self {
        self.reads.push(TypeId::of::<T>());
        self
    }

    pub fn writes<T: 'static>(mut self) -> Self {
        self.writes.push(TypeId::of::<T>());
        self
    }

    fn conflicts_with(&self, other: &AccessSet) -> bool {
        let writes_hit = |w: &TypeId| other.writes.contains(w) || other.reads.contains(w);
        self.writes.iter().any(writes_hit) || other.writes.iter().any(|w| self.reads.contains(w))
    }

    fn is_declared(&self) -> bool {
        !self.reads.is_empty() || !self.writes.is_empty()
    }
}

type PrepareFn = Box<dyn FnMut(&World, &mut JobBuilder) + Send>;

/// A named unit of work attached to one stage.
pub struct SystemDesc {
    pub name: String,
    access: AccessSet,
    prepare: PrepareFn,
    enabled: bool,
}

impl SystemDesc {
    pub fn new<F>(name: &str, prepare: F) -> Self
    where
        F: FnMut(&World, &mut JobBuilder) + Send + 'static,
    {
        Self {
            name: name.to_owned(),
            access: AccessSet::default(),
            prepare: Box::new(prepare),
            enabled: true,
        }
    }

    pub fn with_access(mut self, access: AccessSet) -> Self {
        self.access = access;
        self
    }
}

// ============================================================================
// 3. STAGES
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageIndex(pub usize);

#[derive(Debug, Default)]
struct StageMetrics {
    last_job_count: AtomicUsize,
    last_duration_ns: AtomicU64,
}

struct Stage {
    name: String,
    systems: Vec<SystemDesc>,
    metrics: StageMetrics,
}

/// Per-stage stats snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageStats {
    pub name: String,
    pub last_job_count: usize,
    pub last_duration_ns: u64,
}

// ============================================================================
// 4. SCHEDULER
// ============================================================================

pub struct Scheduler {
    stages: Vec<Stage>,
    scratch: Vec<StageJob>,
    priority: Priority,
    stage_budget_us: u64,
}

impl Scheduler {
    /// A scheduler with the six default stages pre-registered in order.
    pub fn new(priority: Priority, stage_budget_us: u64) -> Self {
        let mut s = Self {
            stages: Vec::new(),
            scratch: Vec::new(),
            priority,
            stage_budget_us,
        };
        for name in DEFAULT_STAGES {
            s.add_stage(name);
        }
        s
    }

    /// Append a stage. Order of addition is execution order; re-adding a
    /// name returns the existing stage.
    pub fn add_stage(&mut self, name: &str) -> StageIndex {
        if let Some(i) = self.stages.iter().position(|s| s.name == name) {
            return StageIndex(i);
        }
        self.stages.push(Stage {
            name: name.to_owned(),
            systems: Vec::new(),
            metrics: StageMetrics::default(),
        });
        StageIndex(self.stages.len() - 1)
    }

    pub fn stage_index(&self, name: &str) -> Option<StageIndex> {
        self.stages.iter().position(|s| s.name == name).map(StageIndex)
    }

    /// Attach a system to a stage. A system whose declared writes collide
    /// with another same-stage system's declared access is rejected as
    /// misuse (the registration becomes a no-op in release builds).
    pub fn add_system(&mut self, stage: StageIndex, system: SystemDesc, world: &World) {
        let Some(entry) = self.stages.get_mut(stage.0) else {
            world.diagnostics.report_misuse("add_system on unknown stage");
            return;
        };
        if system.access.is_declared() {
            for other in &entry.systems {
                if other.access.is_declared() && system.access.conflicts_with(&other.access) {
                    world.diagnostics.report_misuse(&format!(
                        "system '{}' conflicts with '{}' in stage '{}'",
                        system.name, other.name, entry.name
                    ));
                    return;
                }
            }
        }
        entry.systems.push(system);
    }

    /// Enable or disable a system. Idempotent per stage.
    pub fn set_system_enabled(&mut self, stage: StageIndex, name: &str, enabled: bool) {
        if let Some(entry) = self.stages.get_mut(stage.0) {
            for system in &mut entry.systems {
                if system.name == name {
                    system.enabled = enabled;
                }
            }
        }
    }

    /// Execute every stage in order. Jobs within a stage run in parallel on
    /// the pool; the next stage starts only when the counter drains.
    pub fn run(&mut self, world: &World, pool: &ThreadPool) -> Result<()> {
        for stage in &mut self.stages {
            let span = tracing::debug_span!("stage", name = %stage.name);
            let _enter = span.enter();
            let start = Instant::now();

            self.scratch.clear();
            for system in &mut stage.systems {
                if !system.enabled {
                    continue;
                }
                let mut builder = JobBuilder {
                    jobs: &mut self.scratch,
                };
                (system.prepare)(world, &mut builder);
            }

            let job_count = self.scratch.len();
            if job_count > 0 {
                let completion = Arc::new(Completion::new(job_count));
                let mut submit_err: Option<Error> = None;
                for job in self.scratch.drain(..) {
                    if submit_err.is_some() {
                        completion.complete();
                        continue;
                    }
                    let guard = CompleteOnDrop(Arc::clone(&completion));
                    let submitted = pool.submit_with(self.priority, WorkKind::Ecs, move || {
                        let _guard = guard;
                        job()
                    });
                    if let Err(e) = submitted {
                        // the guard was consumed by the rejected closure and
                        // dropped with it, which already completed the counter
                        submit_err = Some(e);
                    }
                }
                completion.wait();
                if let Some(e) = submit_err {
                    return Err(e.context(format!("stage '{}'", stage.name)));
                }
            }

            let elapsed = start.elapsed();
            stage
                .metrics
                .last_job_count
                .store(job_count, Ordering::Relaxed);
            stage
                .metrics
                .last_duration_ns
                .store(elapsed.as_nanos() as u64, Ordering::Relaxed);
            if self.stage_budget_us > 0 && elapsed.as_micros() as u64 > self.stage_budget_us {
                log::debug!(
                    "stage '{}' over budget: {}us > {}us",
                    stage.name,
                    elapsed.as_micros(),
                    self.stage_budget_us
                );
            }
        }
        Ok(())
    }

    pub fn stats(&self) -> Vec<StageStats> {
        self.stages
            .iter()
            .map(|s| StageStats {
                name: s.name.clone(),
                last_job_count: s.metrics.last_job_count.load(Ordering::Relaxed),
                last_duration_ns: s.metrics.last_duration_ns.load(Ordering::Relaxed),
            })
            .collect()
    }

    pub fn stage_stats(&self, stage: StageIndex) -> Option<StageStats> {
        self.stages.get(stage.0).map(|s| StageStats {
            name: s.name.clone(),
            last_job_count: s.metrics.last_job_count.load(Ordering::Relaxed),
            last_duration_ns: s.metrics.last_duration_ns.load(Ordering::Relaxed),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagnostics::Diagnostics;
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;

    fn fixture() -> (World, ThreadPool) {
        let diag = Arc::new(Diagnostics::new());
        let world = World::new(diag.clone());
        let pool = ThreadPool::new(4, Duration::from_secs(2), diag);
        (world, pool)
    }

    #[test]
    fn stages_execute_strictly_in_order() {
        let (world, pool) = fixture();
        let mut sched = Scheduler::new(Priority::Normal, 0);
        let log = Arc::new(Mutex::new(Vec::new()));

        let a = sched.stage_index("physics_animation").unwrap();
        let b = sched.stage_index("render_extraction").unwrap();

        for i in 0..8 {
            let log = log.clone();
            sched.add_system(
                a,
                SystemDesc::new("sim", move |_, builder| {
                    let log = log.clone();
                    builder.spawn(move || {
                        std::thread::sleep(Duration::from_millis(2));
                        log.lock().push(("sim", i));
                        Ok(())
                    });
                }),
                &world,
            );
        }
        let log2 = log.clone();
        sched.add_system(
            b,
            SystemDesc::new("extract", move |_, builder| {
                let log = log2.clone();
                builder.spawn(move || {
                    log.lock().push(("extract", 0));
                    Ok(())
                });
            }),
            &world,
        );

        sched.run(&world, &pool).unwrap();
        let entries = log.lock().clone();
        assert_eq!(entries.len(), 9);
        // every sim job finished before the extract job started
        assert_eq!(entries.last().unwrap().0, "extract");
    }

    #[test]
    fn job_count_matches_spawn_calls() {
        let (world, pool) = fixture();
        let mut sched = Scheduler::new(Priority::Normal, 0);
        let stage = sched.add_stage("simulation");
        sched.add_system(
            stage,
            SystemDesc::new("forty", |_, builder| {
                for _ in 0..40 {
                    builder.spawn(|| Ok(()));
                }
            }),
            &world,
        );
        sched.run(&world, &pool).unwrap();
        let stats = sched.stage_stats(stage).unwrap();
        assert_eq!(stats.last_job_count, 40);
        assert!(stats.last_duration_ns > 0);
    }

    #[test]
    fn empty_stage_short_circuits() {
        let (world, pool) = fixture();
        let mut sched = Scheduler::new(Priority::Normal, 0);
        let stage = sched.add_stage("simulation");
        sched.add_system(
            stage,
            SystemDesc::new("noop", |_, _builder| {
                // zero entities: spawn nothing
            }),
            &world,
        );
        sched.run(&world, &pool).unwrap();
        assert_eq!(sched.stage_stats(stage).unwrap().last_job_count, 0);
        assert_eq!(pool.stats().submitted, 0);
    }

    #[test]
    fn disable_is_idempotent() {
        let (world, pool) = fixture();
        let mut sched = Scheduler::new(Priority::Normal, 0);
        let stage = sched.add_stage("simulation");
        let hits = Arc::new(AtomicU32::new(0));
        let h = hits.clone();
        sched.add_system(
            stage,
            SystemDesc::new("counted", move |_, builder| {
                let h = h.clone();
                builder.spawn(move || {
                    h.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                });
            }),
            &world,
        );

        sched.set_system_enabled(stage, "counted", false);
        sched.set_system_enabled(stage, "counted", false);
        sched.run(&world, &pool).unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 0);

        sched.set_system_enabled(stage, "counted", true);
        sched.set_system_enabled(stage, "counted", true);
        sched.run(&world, &pool).unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn run_after_pool_shutdown_reports_stopped() {
        let (world, pool) = fixture();
        let mut sched = Scheduler::new(Priority::Normal, 0);
        let stage = sched.add_stage("simulation");
        sched.add_system(
            stage,
            SystemDesc::new("one", |_, builder| builder.spawn(|| Ok(()))),
            &world,
        );
        pool.shutdown();
        let err = sched.run(&world, &pool).unwrap_err();
        assert!(err.to_string().contains("thread pool stopped"));
    }

    #[cfg(debug_assertions)]
    #[test]
    #[should_panic(expected = "misuse")]
    fn same_stage_write_read_conflict_is_detected() {
        struct Pos;
        let (world, _pool) = fixture();
        let mut sched = Scheduler::new(Priority::Normal, 0);
        let stage = sched.add_stage("simulation");
        sched.add_system(
            stage,
            SystemDesc::new("writer", |_, _| {}).with_access(AccessSet::new().writes::<Pos>()),
            &world,
        );
        sched.add_system(
            stage,
            SystemDesc::new("reader", |_, _| {}).with_access(AccessSet::new().reads::<Pos>()),
            &world,
        );
    }

    #[test]
    fn add_stage_is_idempotent_on_name() {
        let mut sched = Scheduler::new(Priority::Normal, 0);
        let a = sched.add_stage("simulation");
        let b = sched.add_stage("simulation");
        assert_eq!(a, b);
    }
}
