// src/error.rs
//! Error handling for the runtime core.
//!
//! - **Performance**: Enum discriminant (cheap match), allocations *only* on error paths.
//! - **Taxonomy**: capacity, stopped substrate, misuse, task failure, fatal — each variant
//!   maps to one recovery policy. Stale handles and absent components are *not* errors;
//!   they surface as `Option` at the call site.
//! - Works with `?`, threads, and the `anyhow` layer in the demo binary.

use thiserror::Error;

/// Main error type — lightweight, Send + Sync + 'static.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum Error {
    /// A bounded queue rejected a push. The caller keeps ownership of its
    /// payload and must free or retry it.
    #[error("queue full: {0}")]
    QueueFull(&'static str),

    /// The thread pool has been shut down; no further work is accepted.
    #[error("thread pool stopped")]
    PoolStopped,

    /// The scripting runtime no longer accepts submissions.
    #[error("script runtime stopped")]
    ScriptRuntimeStopped,

    /// API misuse (unregistered component, guard conflict, cyclic parent
    /// chain). Debug builds abort at the report site; release builds see
    /// this error and a bumped counter.
    #[error("misuse: {0}")]
    Misuse(String),

    /// A job's run function failed. The pool keeps running.
    #[error("task failed: {0}")]
    TaskFailed(String),

    /// Device-loss-equivalent condition from the renderer. Triggers an
    /// orderly shutdown of the core.
    #[error("fatal: {0}")]
    Fatal(String),

    /// Simple custom message (allocation only when the error happens).
    #[error("{0}")]
    Custom(String),

    /// Rich context chaining.
    #[error("{message}: {source}")]
    WithContext {
        message: String,
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    /// Create a custom error message.
    #[inline]
    pub fn custom<S: Into<String>>(msg: S) -> Self {
        Self::Custom(msg.into())
    }

    /// Create a misuse error (pair with `Diagnostics::report_misuse`).
    #[inline]
    pub fn misuse<S: Into<String>>(msg: S) -> Self {
        Self::Misuse(msg.into())
    }

    /// Create a task-failure error.
    #[inline]
    pub fn task<S: Into<String>>(msg: S) -> Self {
        Self::TaskFailed(msg.into())
    }

    /// Add context to any error (chainable).
    #[inline]
    pub fn context<C: Into<String>>(self, context: C) -> Self {
        Self::WithContext {
            message: context.into(),
            source: Box::new(self),
        }
    }

    /// Quick static message (no formatting machinery).
    #[inline]
    pub fn msg(msg: &'static str) -> Self {
        Self::Custom(msg.into())
    }

    // === Kind checks (branch prediction friendly) ===

    #[inline]
    pub fn is_capacity(&self) -> bool {
        matches!(self, Error::QueueFull(_))
    }

    #[inline]
    pub fn is_stopped(&self) -> bool {
        matches!(self, Error::PoolStopped | Error::ScriptRuntimeStopped)
    }

    #[inline]
    pub fn is_misuse(&self) -> bool {
        matches!(self, Error::Misuse(_))
    }

    #[inline]
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Fatal(_))
    }
}

/// Convenient `Result` alias — use `crate::Result<T>` everywhere.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_checks() {
        assert!(Error::QueueFull("actions").is_capacity());
        assert!(Error::PoolStopped.is_stopped());
        assert!(Error::misuse("x").is_misuse());
        assert!(!Error::custom("x").is_fatal());
    }

    #[test]
    fn context_chains_display() {
        let e = Error::PoolStopped.context("submitting extraction job");
        assert_eq!(e.to_string(), "submitting extraction job: thread pool stopped");
    }
}
