// src/scripting/state_pool.rs
//! Fixed-capacity interpreter-state multiplexer.
//!
//! States are created eagerly to capacity by an injected factory and
//! destroyed by an injected finalizer on shutdown. `acquire` blocks while
//! all states are leased; the lease returns its state on drop. Sized at
//! (pool workers + 1), each worker holds at most one state and never
//! contends.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam::channel::{bounded, Receiver, RecvTimeoutError, Sender};

use crate::error::{Error, Result};

use super::ScriptState;

type StateBox = Box<dyn ScriptState>;
type Finalizer = Box<dyn Fn(StateBox) + Send + Sync>;

struct PoolShared {
    slots_tx: Sender<StateBox>,
    slots_rx: Receiver<StateBox>,
    finalizer: Finalizer,
    capacity: usize,
    stopped: AtomicBool,
}

/// Blocking-acquire pool of interpreter states.
pub struct StatePool {
    shared: Arc<PoolShared>,
}

impl Clone for StatePool {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl StatePool {
    /// Build `capacity` states up front.
    pub fn new<F, D>(capacity: usize, factory: F, finalizer: D) -> Self
    where
        F: Fn() -> StateBox,
        D: Fn(StateBox) + Send + Sync + 'static,
    {
        let capacity = capacity.max(1);
        let (slots_tx, slots_rx) = bounded(capacity);
        for _ in 0..capacity {
            slots_tx
                .send(factory())
                .expect("channel sized to capacity");
        }
        Self {
            shared: Arc::new(PoolShared {
                slots_tx,
                slots_rx,
                finalizer: Box::new(finalizer),
                capacity,
                stopped: AtomicBool::new(false),
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    /// Lease a state, blocking while every state is out. The lease's drop
    /// returns the state to the pool, so a worker holding one state and
    /// blocking here cannot deadlock the others.
    pub fn acquire(&self) -> Result<StateLease> {
        loop {
            if self.shared.stopped.load(Ordering::Acquire) {
                return Err(Error::ScriptRuntimeStopped);
            }
            match self.shared.slots_rx.recv_timeout(Duration::from_millis(50)) {
                Ok(state) => {
                    return Ok(StateLease {
                        state: Some(state),
                        shared: Arc::clone(&self.shared),
                    })
                }
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => return Err(Error::ScriptRuntimeStopped),
            }
        }
    }

    /// Destroy every state through the finalizer and refuse further
    /// acquires. States still leased are finalized when their lease drops.
    pub fn shutdown(&self) {
        self.shared.stopped.store(true, Ordering::Release);
        while let Ok(state) = self.shared.slots_rx.try_recv() {
            (self.shared.finalizer)(state);
        }
    }
}

/// Exclusive lease on one interpreter state.
pub struct StateLease {
    state: Option<StateBox>,
    shared: Arc<PoolShared>,
}

impl StateLease {
    pub fn state(&mut self) -> &mut dyn ScriptState {
        self.state.as_mut().expect("present until drop").as_mut()
    }
}

impl Drop for StateLease {
    fn drop(&mut self) {
        if let Some(state) = self.state.take() {
            if self.shared.stopped.load(Ordering::Acquire) {
                (self.shared.finalizer)(state);
            } else if let Err(returned) = self.shared.slots_tx.try_send(state) {
                (self.shared.finalizer)(returned.into_inner());
            }
        }
    }
}
