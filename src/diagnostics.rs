// src/diagnostics.rs
//! Misuse and failure accounting for the runtime core.
//!
//! The only process-wide mutable state the core permits is the log sink;
//! everything here lives inside an owning struct that is passed explicitly
//! (World, ThreadPool, EngineCore all hold one and share it via `Arc`).

use std::sync::atomic::{AtomicU64, Ordering};

/// Counters for conditions that must not abort a shipping build.
#[derive(Debug, Default)]
pub struct Diagnostics {
    /// API misuse observations (unregistered component, guard conflict,
    /// cyclic parent chain, double release).
    pub misuse: AtomicU64,
    /// Jobs whose run function returned an error.
    pub task_failures: AtomicU64,
    /// Actions dropped because the action queue was full.
    pub actions_dropped: AtomicU64,
}

impl Diagnostics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Report API misuse. Debug builds abort here so the bug is caught at
    /// the source; release builds count it and let the caller no-op.
    #[track_caller]
    pub fn report_misuse(&self, what: &str) {
        self.misuse.fetch_add(1, Ordering::Relaxed);
        let loc = std::panic::Location::caller();
        log::error!("misuse at {}:{}: {}", loc.file(), loc.line(), what);
        debug_assert!(false, "misuse: {what}");
    }

    /// Report misuse that the runtime can contain to one subtree or
    /// operation (e.g. a cyclic parent chain). Counted and logged, but the
    /// frame continues even in debug builds.
    pub fn report_recoverable(&self, what: &str) {
        self.misuse.fetch_add(1, Ordering::Relaxed);
        log::error!("recoverable misuse: {}", what);
    }

    /// Report a failed job. The pool keeps running.
    pub fn report_task_failure(&self, what: &str) {
        self.task_failures.fetch_add(1, Ordering::Relaxed);
        log::warn!("task failed: {}", what);
    }

    pub fn report_dropped_action(&self) {
        self.actions_dropped.fetch_add(1, Ordering::Relaxed);
    }

    /// Snapshot for stats overlays / shutdown logs.
    pub fn snapshot(&self) -> DiagnosticsSnapshot {
        DiagnosticsSnapshot {
            misuse: self.misuse.load(Ordering::Relaxed),
            task_failures: self.task_failures.load(Ordering::Relaxed),
            actions_dropped: self.actions_dropped.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiagnosticsSnapshot {
    pub misuse: u64,
    pub task_failures: u64,
    pub actions_dropped: u64,
}
