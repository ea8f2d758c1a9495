// src/scripting/mod.rs
//! Scripting execution model: pooled interpreter states, a script runner
//! over the thread pool, a bounded cross-thread action queue, and the
//! main-thread dispatcher that applies side effects.
//!
//! The engine binds no particular language. Callers inject a
//! [`ScriptState`] implementation (one instance per pooled state) and the
//! runtime guarantees exclusive, single-thread use of each instance.

pub mod action_queue;
pub mod dispatcher;
pub mod runner;
pub mod state_pool;

pub use action_queue::{Action, ActionKind, ActionQueue};
pub use dispatcher::MainDispatcher;
pub use runner::ScriptRunner;
pub use state_pool::{StateLease, StatePool};

/// Result of executing one script buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptOutcome {
    pub success: bool,
    pub message: String,
}

impl ScriptOutcome {
    pub fn ok<S: Into<String>>(message: S) -> Self {
        Self {
            success: true,
            message: message.into(),
        }
    }

    pub fn failed<S: Into<String>>(message: S) -> Self {
        Self {
            success: false,
            message: message.into(),
        }
    }
}

/// The minimal binding surface a language integration exposes to scripts.
/// Cloned into each interpreter state at construction.
pub struct ScriptBindings {
    cvars: std::sync::Arc<crate::cvar::CvarRegistry>,
    actions: std::sync::Arc<ActionQueue>,
}

impl ScriptBindings {
    pub fn new(
        cvars: std::sync::Arc<crate::cvar::CvarRegistry>,
        actions: std::sync::Arc<ActionQueue>,
    ) -> Self {
        Self { cvars, actions }
    }

    /// Script-visible logger entry point.
    pub fn log(&self, level: log::Level, message: &str) {
        log::log!(level, "[script] {}", message);
    }

    pub fn cvar_get(&self, name: &str) -> Option<String> {
        self.cvars.get(name)
    }

    pub fn cvar_set(&self, name: &str, value: &str) -> bool {
        self.cvars.set(name, value)
    }

    /// Post a request to the main thread (a *custom* action). Returns false
    /// when the queue is full; the payload stays with the caller.
    pub fn post_to_main(&self, payload: Vec<u8>) -> bool {
        self.actions
            .push(Action::new(ActionKind::Custom, payload))
            .is_ok()
    }
}

/// One interpreter state. Exclusive-access: the pool hands a state to at
/// most one thread at a time.
pub trait ScriptState: Send {
    /// Execute a script buffer, producing a success flag and an optional
    /// message (the console output or the error text).
    fn execute(&mut self, source: &[u8]) -> ScriptOutcome;

    /// Invoke a named handler with three string arguments (cvar name, old
    /// value, new value). Handlers may mutate engine state through the
    /// binding surface; plain script execution cannot.
    fn call_handler(&mut self, handler: &str, name: &str, old: &str, new: &str)
        -> crate::Result<()>;
}
