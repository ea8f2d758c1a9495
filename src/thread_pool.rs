// src/thread_pool.rs
//! Demand-driven worker pool with priority scheduling and per-subsystem
//! worker budgets.
//!
//! - Four FIFO queues, one per priority class; critical drains before high,
//!   high before normal, normal before low.
//! - Subsystems register (name, min, max, priority, kind) budgets;
//!   registration is idempotent on the name.
//! - Scaling is demand-driven: queue pressure spawns workers up to the
//!   global cap, idle workers exit after a timeout while the aggregate
//!   minimum stays met.
//! - A task failure is counted and reported; the pool keeps running.

use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::{Condvar, Mutex, RwLock};
use serde::{Deserialize, Serialize};

use crate::diagnostics::Diagnostics;
use crate::error::{Error, Result};

// ============================================================================
// 1. WORK ITEMS
// ============================================================================

/// Priority classes, highest first. FIFO within a class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Priority {
    Critical,
    High,
    Normal,
    Low,
}

impl Priority {
    pub const COUNT: usize = 4;

    #[inline]
    fn queue_index(self) -> usize {
        match self {
            Priority::Critical => 0,
            Priority::High => 1,
            Priority::Normal => 2,
            Priority::Low => 3,
        }
    }
}

/// What a work item is for. Workers are fungible; the kind feeds budgeting
/// and lets workloads build per-worker context (command recorders,
/// interpreter states) lazily.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WorkKind {
    General,
    Ecs,
    Script,
    BvhBuild,
}

type Job = Box<dyn FnOnce() -> Result<()> + Send + 'static>;

/// (priority, subsystem kind, run fn) — the unit the pool schedules.
pub struct WorkItem {
    pub priority: Priority,
    pub kind: WorkKind,
    job: Job,
}

impl WorkItem {
    pub fn new<F>(priority: Priority, kind: WorkKind, job: F) -> Self
    where
        F: FnOnce() -> Result<()> + Send + 'static,
    {
        Self {
            priority,
            kind,
            job: Box::new(job),
        }
    }
}

// ============================================================================
// 2. SUBSYSTEM REGISTRATION
// ============================================================================

/// Worker budget for one subsystem.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubsystemConfig {
    pub name: String,
    pub min_workers: usize,
    pub max_workers: usize,
    pub priority: Priority,
    pub kind: WorkKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubsystemId(pub usize);

// ============================================================================
// 3. POOL INTERNALS
// ============================================================================

/// Queue pressure above which the pool scales up: queued / workers > 0.8.
const SCALE_UP_PRESSURE_NUM: usize = 4;
const SCALE_UP_PRESSURE_DEN: usize = 5;

struct PoolState {
    queues: [VecDeque<WorkItem>; Priority::COUNT],
    workers_alive: usize,
    shutting_down: bool,
}

impl PoolState {
    fn queued_total(&self) -> usize {
        self.queues.iter().map(|q| q.len()).sum()
    }

    fn pop_highest(&mut self) -> Option<WorkItem> {
        self.queues.iter_mut().find_map(|q| q.pop_front())
    }
}

/// Per-worker start/exit hooks. Workloads install these to build and tear
/// down thread-local context (GPU command pools, interpreter states).
type WorkerHook = Arc<dyn Fn(usize) + Send + Sync>;

#[derive(Default, Clone)]
struct WorkerHooks {
    on_start: Option<WorkerHook>,
    on_exit: Option<WorkerHook>,
}

#[derive(Debug, Default)]
struct PoolCounters {
    submitted: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    discarded: AtomicU64,
    spawned: AtomicU64,
    peak_workers: AtomicUsize,
}

/// Pool stats snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub submitted: u64,
    pub completed: u64,
    pub failed: u64,
    pub discarded: u64,
    pub spawned: u64,
    pub alive_workers: usize,
    pub active_workers: usize,
    pub peak_workers: usize,
    pub queued: usize,
}

struct PoolInner {
    state: Mutex<PoolState>,
    work_available: Condvar,
    subsystems: RwLock<Vec<SubsystemConfig>>,
    hooks: RwLock<WorkerHooks>,
    handles: Mutex<Vec<thread::JoinHandle<()>>>,
    counters: PoolCounters,
    active_workers: AtomicUsize,
    next_worker_id: AtomicUsize,
    diagnostics: Arc<Diagnostics>,
    global_max: usize,
    idle_timeout: Duration,
}

impl PoolInner {
    fn aggregate_min(&self) -> usize {
        self.subsystems
            .read()
            .iter()
            .map(|s| s.min_workers)
            .sum::<usize>()
            .min(self.global_max)
    }
}

thread_local! {
    static WORKER_INDEX: std::cell::Cell<Option<usize>> = const { std::cell::Cell::new(None) };
}

/// Index of the pool worker running the current thread, if any.
pub fn current_worker_index() -> Option<usize> {
    WORKER_INDEX.with(|c| c.get())
}

// ============================================================================
// 4. PUBLIC API
// ============================================================================

/// Demand-driven thread pool. Cheap to clone-share via the inner `Arc`.
pub struct ThreadPool {
    inner: Arc<PoolInner>,
}

impl ThreadPool {
    pub fn new(global_max: usize, idle_timeout: Duration, diagnostics: Arc<Diagnostics>) -> Self {
        let inner = Arc::new(PoolInner {
            state: Mutex::new(PoolState {
                queues: Default::default(),
                workers_alive: 0,
                shutting_down: false,
            }),
            work_available: Condvar::new(),
            subsystems: RwLock::new(Vec::new()),
            hooks: RwLock::new(WorkerHooks::default()),
            handles: Mutex::new(Vec::new()),
            counters: PoolCounters::default(),
            active_workers: AtomicUsize::new(0),
            next_worker_id: AtomicUsize::new(0),
            diagnostics,
            global_max: global_max.max(1),
            idle_timeout,
        });
        Self { inner }
    }

    /// Install worker start/exit hooks. Call before the first submit; hooks
    /// only apply to workers spawned after installation.
    pub fn set_worker_hooks<S, E>(&self, on_start: S, on_exit: E)
    where
        S: Fn(usize) + Send + Sync + 'static,
        E: Fn(usize) + Send + Sync + 'static,
    {
        let mut hooks = self.inner.hooks.write();
        hooks.on_start = Some(Arc::new(on_start));
        hooks.on_exit = Some(Arc::new(on_exit));
    }

    /// Record a subsystem's worker budget. Idempotent: a duplicate name
    /// returns the existing registration untouched.
    pub fn register_subsystem(&self, config: SubsystemConfig) -> SubsystemId {
        {
            let subsystems = self.inner.subsystems.read();
            if let Some(i) = subsystems.iter().position(|s| s.name == config.name) {
                return SubsystemId(i);
            }
        }
        let id = {
            let mut subsystems = self.inner.subsystems.write();
            // re-check under the write lock
            if let Some(i) = subsystems.iter().position(|s| s.name == config.name) {
                return SubsystemId(i);
            }
            subsystems.push(config);
            SubsystemId(subsystems.len() - 1)
        };
        self.ensure_workers(self.inner.aggregate_min());
        id
    }

    pub fn subsystem_config(&self, id: SubsystemId) -> Option<SubsystemConfig> {
        self.inner.subsystems.read().get(id.0).cloned()
    }

    /// Hint the pool to scale toward `desired` workers for `kind`.
    /// Returns the granted count (best-effort).
    pub fn request_workers(&self, kind: WorkKind, desired: usize) -> usize {
        let kind_max: usize = {
            let subsystems = self.inner.subsystems.read();
            let sum: usize = subsystems
                .iter()
                .filter(|s| s.kind == kind)
                .map(|s| s.max_workers)
                .sum();
            if sum == 0 {
                self.inner.global_max
            } else {
                sum
            }
        };
        let granted = desired.min(kind_max).min(self.inner.global_max);
        self.ensure_workers(granted);
        granted
    }

    /// Insert a work item. FIFO within its priority class; critical drains
    /// before high before normal before low.
    pub fn submit(&self, item: WorkItem) -> Result<()> {
        let spawn_needed = {
            let mut state = self.inner.state.lock();
            if state.shutting_down {
                return Err(Error::PoolStopped);
            }
            state.queues[item.priority.queue_index()].push_back(item);
            self.inner.counters.submitted.fetch_add(1, Ordering::Relaxed);

            let queued = state.queued_total();
            let alive = state.workers_alive;
            // scale up when queued / alive > 0.8, or when nobody is alive
            alive == 0
                || (alive < self.inner.global_max
                    && queued * SCALE_UP_PRESSURE_DEN > alive * SCALE_UP_PRESSURE_NUM)
        };
        self.inner.work_available.notify_one();
        if spawn_needed {
            self.spawn_worker();
        }
        Ok(())
    }

    /// Convenience wrapper around [`ThreadPool::submit`].
    pub fn submit_with<F>(&self, priority: Priority, kind: WorkKind, job: F) -> Result<()>
    where
        F: FnOnce() -> Result<()> + Send + 'static,
    {
        self.submit(WorkItem::new(priority, kind, job))
    }

    /// Signal stop, discard queued work, join workers. Idempotent.
    pub fn shutdown(&self) {
        let discarded = {
            let mut state = self.inner.state.lock();
            if state.shutting_down {
                0
            } else {
                state.shutting_down = true;
                let n = state.queued_total();
                for q in &mut state.queues {
                    q.clear();
                }
                n
            }
        };
        if discarded > 0 {
            self.inner
                .counters
                .discarded
                .fetch_add(discarded as u64, Ordering::Relaxed);
            log::debug!("pool shutdown discarded {} queued items", discarded);
        }
        self.inner.work_available.notify_all();

        let handles: Vec<_> = self.inner.handles.lock().drain(..).collect();
        for h in handles {
            let _ = h.join();
        }
    }

    pub fn stats(&self) -> PoolStats {
        let (alive, queued) = {
            let state = self.inner.state.lock();
            (state.workers_alive, state.queued_total())
        };
        let c = &self.inner.counters;
        PoolStats {
            submitted: c.submitted.load(Ordering::Relaxed),
            completed: c.completed.load(Ordering::Relaxed),
            failed: c.failed.load(Ordering::Relaxed),
            discarded: c.discarded.load(Ordering::Relaxed),
            spawned: c.spawned.load(Ordering::Relaxed),
            alive_workers: alive,
            active_workers: self.inner.active_workers.load(Ordering::Relaxed),
            peak_workers: c.peak_workers.load(Ordering::Relaxed),
            queued,
        }
    }

    // ------------------------------------------------------------------
    // Scaling
    // ------------------------------------------------------------------

    fn ensure_workers(&self, target: usize) {
        loop {
            {
                let state = self.inner.state.lock();
                if state.shutting_down || state.workers_alive >= target.min(self.inner.global_max) {
                    return;
                }
            }
            if !self.spawn_worker() {
                return;
            }
        }
    }

    fn spawn_worker(&self) -> bool {
        {
            let mut state = self.inner.state.lock();
            if state.shutting_down || state.workers_alive >= self.inner.global_max {
                return false;
            }
            state.workers_alive += 1;
        }
        let id = self.inner.next_worker_id.fetch_add(1, Ordering::Relaxed);
        let inner = Arc::clone(&self.inner);
        let handle = thread::Builder::new()
            .name(format!("ember-worker-{id}"))
            .spawn(move || worker_loop(inner, id))
            .expect("spawning pool worker");
        self.inner.handles.lock().push(handle);
        self.inner.counters.spawned.fetch_add(1, Ordering::Relaxed);

        let alive = self.inner.state.lock().workers_alive;
        self.inner
            .counters
            .peak_workers
            .fetch_max(alive, Ordering::Relaxed);
        true
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

// ============================================================================
// 5. WORKER LOOP
// ============================================================================

enum WorkerStep {
    Run(WorkItem),
    Exit,
}

fn worker_loop(inner: Arc<PoolInner>, id: usize) {
    WORKER_INDEX.with(|c| c.set(Some(id)));
    #[cfg(feature = "high_priority")]
    {
        let _ = thread_priority::set_current_thread_priority(thread_priority::ThreadPriority::Max);
    }
    let hooks = inner.hooks.read().clone();
    if let Some(on_start) = &hooks.on_start {
        on_start(id);
    }

    loop {
        let step = next_step(&inner);
        match step {
            WorkerStep::Run(item) => {
                inner.active_workers.fetch_add(1, Ordering::Relaxed);
                let outcome = catch_unwind(AssertUnwindSafe(move || (item.job)()));
                inner.active_workers.fetch_sub(1, Ordering::Relaxed);
                match outcome {
                    Ok(Ok(())) => {
                        inner.counters.completed.fetch_add(1, Ordering::Relaxed);
                    }
                    Ok(Err(e)) => {
                        inner.counters.failed.fetch_add(1, Ordering::Relaxed);
                        inner.diagnostics.report_task_failure(&e.to_string());
                    }
                    Err(_) => {
                        inner.counters.failed.fetch_add(1, Ordering::Relaxed);
                        inner.diagnostics.report_task_failure("job panicked");
                    }
                }
            }
            WorkerStep::Exit => break,
        }
    }

    if let Some(on_exit) = &hooks.on_exit {
        on_exit(id);
    }
    WORKER_INDEX.with(|c| c.set(None));
}

/// Block until there is work, shutdown, or an idle timeout that the pool
/// can afford. Workers never hold the pool mutex while running work.
fn next_step(inner: &PoolInner) -> WorkerStep {
    let mut state = inner.state.lock();
    loop {
        if let Some(item) = state.pop_highest() {
            return WorkerStep::Run(item);
        }
        if state.shutting_down {
            state.workers_alive -= 1;
            return WorkerStep::Exit;
        }
        let timed_out = inner
            .work_available
            .wait_for(&mut state, inner.idle_timeout)
            .timed_out();
        if timed_out
            && state.queued_total() == 0
            && !state.shutting_down
            && state.workers_alive > inner.aggregate_min()
        {
            state.workers_alive -= 1;
            return WorkerStep::Exit;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use std::time::Instant;

    fn test_pool(max: usize) -> ThreadPool {
        ThreadPool::new(max, Duration::from_secs(2), Arc::new(Diagnostics::new()))
    }

    fn wait_for<F: Fn() -> bool>(cond: F) {
        let start = Instant::now();
        while !cond() {
            assert!(start.elapsed() < Duration::from_secs(5), "condition timed out");
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn runs_submitted_work() {
        let pool = test_pool(4);
        let counter = Arc::new(AtomicU32::new(0));
        for _ in 0..100 {
            let counter = counter.clone();
            pool.submit_with(Priority::Normal, WorkKind::General, move || {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .unwrap();
        }
        wait_for(|| counter.load(Ordering::SeqCst) == 100);
        pool.shutdown();
        assert_eq!(pool.stats().completed, 100);
    }

    #[test]
    fn priority_classes_drain_in_order() {
        // Single worker; stall it while we queue one item per class, then
        // observe the completion order.
        let pool = test_pool(1);
        let order = Arc::new(Mutex::new(Vec::new()));
        let gate = Arc::new(AtomicU32::new(0));

        let g = gate.clone();
        pool.submit_with(Priority::Critical, WorkKind::General, move || {
            while g.load(Ordering::SeqCst) == 0 {
                thread::yield_now();
            }
            Ok(())
        })
        .unwrap();

        for (prio, tag) in [
            (Priority::Low, "low"),
            (Priority::Normal, "normal"),
            (Priority::High, "high"),
            (Priority::Critical, "critical"),
        ] {
            let order = order.clone();
            pool.submit_with(prio, WorkKind::General, move || {
                order.lock().push(tag);
                Ok(())
            })
            .unwrap();
        }

        gate.store(1, Ordering::SeqCst);
        wait_for(|| order.lock().len() == 4);
        assert_eq!(*order.lock(), vec!["critical", "high", "normal", "low"]);
        pool.shutdown();
    }

    #[test]
    fn duplicate_subsystem_registration_returns_existing() {
        let pool = test_pool(4);
        let cfg = SubsystemConfig {
            name: "ecs".into(),
            min_workers: 1,
            max_workers: 4,
            priority: Priority::Normal,
            kind: WorkKind::Ecs,
        };
        let a = pool.register_subsystem(cfg.clone());
        let b = pool.register_subsystem(SubsystemConfig {
            min_workers: 3,
            ..cfg
        });
        assert_eq!(a, b);
        assert_eq!(pool.subsystem_config(a).unwrap().min_workers, 1);
        pool.shutdown();
    }

    #[test]
    fn registration_spawns_min_workers() {
        let pool = test_pool(8);
        pool.register_subsystem(SubsystemConfig {
            name: "script".into(),
            min_workers: 2,
            max_workers: 4,
            priority: Priority::Normal,
            kind: WorkKind::Script,
        });
        wait_for(|| pool.stats().alive_workers >= 2);
        pool.shutdown();
    }

    #[test]
    fn submit_after_shutdown_fails() {
        let pool = test_pool(2);
        pool.shutdown();
        let err = pool
            .submit_with(Priority::Normal, WorkKind::General, || Ok(()))
            .unwrap_err();
        assert!(matches!(err, Error::PoolStopped));
    }

    #[test]
    fn task_failures_are_counted_and_pool_continues() {
        let pool = test_pool(2);
        pool.submit_with(Priority::Normal, WorkKind::General, || {
            Err(Error::task("intentional"))
        })
        .unwrap();
        let ok = Arc::new(AtomicU32::new(0));
        let ok2 = ok.clone();
        pool.submit_with(Priority::Normal, WorkKind::General, move || {
            ok2.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .unwrap();
        wait_for(|| ok.load(Ordering::SeqCst) == 1);
        wait_for(|| pool.stats().failed == 1);
        pool.shutdown();
    }

    #[test]
    fn request_workers_is_capped_by_kind_budget() {
        let pool = test_pool(8);
        pool.register_subsystem(SubsystemConfig {
            name: "bvh".into(),
            min_workers: 0,
            max_workers: 2,
            priority: Priority::High,
            kind: WorkKind::BvhBuild,
        });
        let granted = pool.request_workers(WorkKind::BvhBuild, 6);
        assert_eq!(granted, 2);
        pool.shutdown();
    }

    #[test]
    fn worker_hooks_fire() {
        let pool = test_pool(2);
        let started = Arc::new(AtomicU32::new(0));
        let exited = Arc::new(AtomicU32::new(0));
        let s = started.clone();
        let e = exited.clone();
        pool.set_worker_hooks(move |_| { s.fetch_add(1, Ordering::SeqCst); },
                              move |_| { e.fetch_add(1, Ordering::SeqCst); });
        pool.submit_with(Priority::Normal, WorkKind::General, || Ok(())).unwrap();
        wait_for(|| pool.stats().completed == 1);
        pool.shutdown();
        assert!(started.load(Ordering::SeqCst) >= 1);
        assert_eq!(started.load(Ordering::SeqCst), exited.load(Ordering::SeqCst));
    }
}
