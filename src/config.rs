// src/config.rs
//! Configuration record consumed by the runtime core.
//!
//! The engine's outer layers (CLI, config files) deserialize this with serde
//! and hand it to `EngineCore::new`. Every knob has a default tuned for a
//! desktop machine; adjust to your needs.

use serde::{Deserialize, Serialize};

use crate::thread_pool::{Priority, WorkKind};

/// Per-subsystem worker budget.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubsystemBudget {
    pub name: String,
    pub min_workers: usize,
    pub max_workers: usize,
    pub priority: Priority,
    pub kind: WorkKind,
}

/// Top-level configuration for the concurrent runtime core.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoreConfig {
    /// Hard cap on pool workers across all subsystems.
    pub max_workers: usize,
    /// Seconds an idle worker waits before exiting (while above the
    /// aggregate minimum).
    pub worker_idle_timeout_secs: u64,
    /// Per-subsystem min/max budgets registered at startup.
    pub subsystems: Vec<SubsystemBudget>,
    /// Bounded capacity of the worker -> main-thread action queue.
    pub action_queue_capacity: usize,
    /// Interpreter states in the pool. Zero means `pool workers + 1`.
    pub state_pool_size: usize,
    /// Items per chunk for chunked ECS dispatch.
    pub ecs_chunk_size: usize,
    /// Soft per-stage time budget in microseconds, recorded against
    /// `last_duration_ns` in stats overlays. Zero disables the warning.
    pub stage_budget_us: u64,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            max_workers: default_worker_cap(),
            worker_idle_timeout_secs: 4,
            subsystems: vec![
                SubsystemBudget {
                    name: "ecs".into(),
                    min_workers: 2,
                    max_workers: default_worker_cap(),
                    priority: Priority::Normal,
                    kind: WorkKind::Ecs,
                },
                SubsystemBudget {
                    name: "script".into(),
                    min_workers: 1,
                    max_workers: 4,
                    priority: Priority::Normal,
                    kind: WorkKind::Script,
                },
                SubsystemBudget {
                    name: "bvh".into(),
                    min_workers: 1,
                    max_workers: 2,
                    priority: Priority::High,
                    kind: WorkKind::BvhBuild,
                },
            ],
            action_queue_capacity: 256,
            state_pool_size: 0,
            ecs_chunk_size: 256,
            stage_budget_us: 4_000,
        }
    }
}

impl CoreConfig {
    /// Resolved state-pool size: explicit value, or workers + 1.
    pub fn resolved_state_pool_size(&self) -> usize {
        if self.state_pool_size > 0 {
            self.state_pool_size
        } else {
            self.max_workers + 1
        }
    }
}

/// Leave a core for the main thread and one for the render thread.
fn default_worker_cap() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get().saturating_sub(2).max(2))
        .unwrap_or(4)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let cfg = CoreConfig::default();
        assert!(cfg.max_workers >= 2);
        assert_eq!(cfg.action_queue_capacity, 256);
        assert_eq!(cfg.resolved_state_pool_size(), cfg.max_workers + 1);
    }

    #[test]
    fn round_trips_through_json() {
        let cfg = CoreConfig::default();
        let text = serde_json::to_string(&cfg).unwrap();
        let back: CoreConfig = serde_json::from_str(&text).unwrap();
        assert_eq!(back.max_workers, cfg.max_workers);
        assert_eq!(back.subsystems.len(), cfg.subsystems.len());
    }
}
