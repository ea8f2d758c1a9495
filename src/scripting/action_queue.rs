// src/scripting/action_queue.rs
//! Bounded MPSC action queue: many producer threads, one consumer (the
//! main-thread dispatcher).
//!
//! Payload ownership is strict: a pushed action's payload belongs to the
//! queue until the consumer pops and drops it; a rejected push hands the
//! action back so the producer frees the payload. Exactly one side frees,
//! always.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crossbeam::channel::{bounded, Receiver, Sender, TrySendError};

/// Message classes the dispatcher understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActionKind {
    /// A finished script's output. Forwarded to the console/log sink.
    ScriptResult,
    /// A `handler\0name\0old\0new` payload; the dispatcher calls the named
    /// script handler.
    CvarChange,
    /// Deferred to the caller-provided handler.
    Custom,
}

/// A typed, opaque-payload message from a worker to the main thread.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Action {
    pub kind: ActionKind,
    pub payload: Vec<u8>,
}

impl Action {
    pub fn new(kind: ActionKind, payload: Vec<u8>) -> Self {
        Self { kind, payload }
    }

    pub fn script_result(message: &str) -> Self {
        Self::new(ActionKind::ScriptResult, message.as_bytes().to_vec())
    }
}

#[derive(Debug, Default)]
struct QueueMetrics {
    pushed: AtomicU64,
    popped: AtomicU64,
    rejected: AtomicU64,
}

/// Queue stats snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActionQueueStats {
    pub pushed: u64,
    pub popped: u64,
    pub rejected: u64,
    pub pending: usize,
}

/// Bounded many-producer / one-consumer action channel.
pub struct ActionQueue {
    tx: Sender<Action>,
    rx: Receiver<Action>,
    capacity: usize,
    metrics: QueueMetrics,
}

impl ActionQueue {
    pub fn new(capacity: usize) -> Arc<Self> {
        let capacity = capacity.max(1);
        let (tx, rx) = bounded(capacity);
        Arc::new(Self {
            tx,
            rx,
            capacity,
            metrics: QueueMetrics::default(),
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Fail-fast push. On a full queue the action comes back in `Err` and
    /// the producer owns (and frees) the payload.
    pub fn push(&self, action: Action) -> Result<(), Action> {
        match self.tx.try_send(action) {
            Ok(()) => {
                self.metrics.pushed.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(TrySendError::Full(action)) | Err(TrySendError::Disconnected(action)) => {
                self.metrics.rejected.fetch_add(1, Ordering::Relaxed);
                Err(action)
            }
        }
    }

    /// Consumer-side drain step. Popped payloads are freed by the consumer
    /// when the action drops.
    pub fn try_pop(&self) -> Option<Action> {
        let action = self.rx.try_recv().ok()?;
        self.metrics.popped.fetch_add(1, Ordering::Relaxed);
        Some(action)
    }

    pub fn stats(&self) -> ActionQueueStats {
        ActionQueueStats {
            pushed: self.metrics.pushed.load(Ordering::Relaxed),
            popped: self.metrics.popped.load(Ordering::Relaxed),
            rejected: self.metrics.rejected.load(Ordering::Relaxed),
            pending: self.rx.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn fifo_order_per_producer() {
        let queue = ActionQueue::new(64);
        for i in 0..10u8 {
            queue
                .push(Action::new(ActionKind::Custom, vec![i]))
                .unwrap();
        }
        for i in 0..10u8 {
            assert_eq!(queue.try_pop().unwrap().payload, vec![i]);
        }
        assert!(queue.try_pop().is_none());
    }

    #[test]
    fn full_queue_hands_the_action_back() {
        let queue = ActionQueue::new(2);
        queue.push(Action::script_result("a")).unwrap();
        queue.push(Action::script_result("b")).unwrap();

        let rejected = queue.push(Action::script_result("c")).unwrap_err();
        assert_eq!(rejected.payload, b"c");
        drop(rejected); // the producer's failure path frees the payload

        let stats = queue.stats();
        assert_eq!(stats.pushed, 2);
        assert_eq!(stats.rejected, 1);
        assert_eq!(stats.pending, 2);
    }

    #[test]
    fn many_producers_one_consumer() {
        let queue = ActionQueue::new(4096);
        let mut handles = vec![];
        for t in 0..4u8 {
            let queue = queue.clone();
            handles.push(thread::spawn(move || {
                for i in 0..100u8 {
                    queue
                        .push(Action::new(ActionKind::Custom, vec![t, i]))
                        .unwrap();
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }

        let mut per_producer_last: [i16; 4] = [-1; 4];
        let mut count = 0;
        while let Some(action) = queue.try_pop() {
            let (t, i) = (action.payload[0] as usize, action.payload[1] as i16);
            assert!(i > per_producer_last[t], "per-producer FIFO violated");
            per_producer_last[t] = i;
            count += 1;
        }
        assert_eq!(count, 400);
    }
}
