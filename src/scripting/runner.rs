// src/scripting/runner.rs
//! Script runner: copies the source, dispatches a *script* work item, and
//! routes the result back through the action queue.
//!
//! Workers acquire a pooled state, execute, emit a `ScriptResult` action and
//! release the state. The optional completion callback runs on the worker
//! thread and must not mutate engine state directly; side effects go through
//! actions.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::diagnostics::Diagnostics;
use crate::ecs::EntityId;
use crate::error::{Error, Result};
use crate::thread_pool::{Priority, ThreadPool, WorkKind};

use super::action_queue::{Action, ActionQueue};
use super::state_pool::StatePool;
use super::ScriptOutcome;

type CompletionFn = Box<dyn FnOnce(&ScriptOutcome) + Send>;

pub struct ScriptRunner {
    pool: Arc<ThreadPool>,
    states: StatePool,
    actions: Arc<ActionQueue>,
    diagnostics: Arc<Diagnostics>,
    stopped: AtomicBool,
}

impl ScriptRunner {
    pub fn new(
        pool: Arc<ThreadPool>,
        states: StatePool,
        actions: Arc<ActionQueue>,
        diagnostics: Arc<Diagnostics>,
    ) -> Self {
        Self {
            pool,
            states,
            actions,
            diagnostics,
            stopped: AtomicBool::new(false),
        }
    }

    /// Queue a script for execution on the pool at normal priority. The
    /// source is copied; the caller's buffer is free to go away.
    pub fn enqueue_script(
        &self,
        source: &[u8],
        owner: Option<EntityId>,
        on_complete: Option<CompletionFn>,
    ) -> Result<()> {
        if self.stopped.load(Ordering::Acquire) {
            return Err(Error::ScriptRuntimeStopped);
        }
        let source = source.to_vec();
        let states = self.states.clone();
        let actions = Arc::clone(&self.actions);
        let diagnostics = Arc::clone(&self.diagnostics);

        self.pool
            .submit_with(Priority::Normal, WorkKind::Script, move || {
                let mut lease = states.acquire()?;
                let outcome = lease.state().execute(&source);
                drop(lease); // release before the queue push can stall anyone

                if let Some(owner) = owner {
                    log::trace!("script for entity {:?} finished: {}", owner, outcome.success);
                }
                if actions.push(Action::script_result(&outcome.message)).is_err() {
                    // producer frees the rejected payload (drop above)
                    diagnostics.report_dropped_action();
                }
                if let Some(cb) = on_complete {
                    cb(&outcome);
                }
                if outcome.success {
                    Ok(())
                } else {
                    Err(Error::task(outcome.message))
                }
            })
    }

    /// Main-thread-only synchronous path for sub-millisecond scripts. Not
    /// for anything that can block or take I/O.
    pub fn run_now(&self, source: &[u8]) -> Result<ScriptOutcome> {
        if self.stopped.load(Ordering::Acquire) {
            return Err(Error::ScriptRuntimeStopped);
        }
        let mut lease = self.states.acquire()?;
        Ok(lease.state().execute(source))
    }

    /// Reject new submissions; scripts already dispatched run to completion.
    pub fn shutdown(&self) {
        self.stopped.store(true, Ordering::Release);
    }

    pub fn state_pool(&self) -> &StatePool {
        &self.states
    }
}
