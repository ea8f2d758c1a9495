// src/render.rs
//! The core <-> render-thread interface.
//!
//! Workers record secondary command buffers through thread-local recorders
//! and push the finished handles onto the pending double-buffer. The render
//! thread flips, executes, and moves handles to the submitted list for the
//! cleanup pass. Extraction results travel the same way, bundled into one
//! snapshot per frame.
//!
//! Command buffers are opaque handles here; the GPU objects live on the
//! renderer side and per-thread command pools stay owned by their threads.

use std::cell::Cell;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::diagnostics::Diagnostics;
use crate::ecs::extraction::ExtractedInstance;
use crate::handoff::DoubleBuffer;

/// Opaque identity of one recorded secondary command buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SecondaryCmdHandle(pub u64);

/// Everything the render thread needs from one frame, published whole.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RenderSnapshot {
    pub frame_index: u64,
    pub instances: Vec<ExtractedInstance>,
    pub tlas_generation: Option<u64>,
}

thread_local! {
    static RECORDER_OPEN: Cell<bool> = const { Cell::new(false) };
}

/// Shared handoff fabric between workers, the main thread and the render
/// thread.
pub struct RenderHandoff {
    pending: DoubleBuffer<SecondaryCmdHandle>,
    submitted: DoubleBuffer<SecondaryCmdHandle>,
    snapshots: DoubleBuffer<RenderSnapshot>,
    next_handle: AtomicU64,
    /// Highest frame index the render thread has fully consumed. Gates the
    /// retirement drains on the main thread.
    consumed_frame: AtomicU64,
    diagnostics: Arc<Diagnostics>,
}

impl RenderHandoff {
    pub fn new(diagnostics: Arc<Diagnostics>) -> Arc<Self> {
        Arc::new(Self {
            pending: DoubleBuffer::new(),
            submitted: DoubleBuffer::new(),
            snapshots: DoubleBuffer::new(),
            next_handle: AtomicU64::new(1),
            consumed_frame: AtomicU64::new(0),
            diagnostics,
        })
    }

    // ------------------------------------------------------------------
    // Worker side
    // ------------------------------------------------------------------

    /// Open this thread's secondary command recorder. One at a time per
    /// thread; a second begin without an end is reported as misuse and
    /// returns the same-thread recorder anyway so the frame can continue.
    pub fn begin_worker_secondary(self: &Arc<Self>) -> SecondaryCmdRecorder {
        if RECORDER_OPEN.with(|open| open.replace(true)) {
            self.diagnostics
                .report_recoverable("begin_worker_secondary while a recorder is open");
        }
        SecondaryCmdRecorder {
            handoff: Some(Arc::clone(self)),
            handle: SecondaryCmdHandle(self.next_handle.fetch_add(1, Ordering::Relaxed)),
        }
    }

    // ------------------------------------------------------------------
    // Render-thread side
    // ------------------------------------------------------------------

    /// Flip and take every pending secondary buffer (execute these).
    pub fn take_pending(&self) -> Vec<SecondaryCmdHandle> {
        self.pending.consume()
    }

    /// Record executed buffers for the cleanup pass.
    pub fn mark_submitted(&self, handles: impl IntoIterator<Item = SecondaryCmdHandle>) {
        self.submitted.push_batch(handles);
    }

    /// Flip and take the submitted list (free these on their owner threads).
    pub fn take_submitted(&self) -> Vec<SecondaryCmdHandle> {
        self.submitted.consume()
    }

    /// The latest published snapshot, if a new one arrived since last call.
    ///
    /// `publish_snapshot` already flips, so this only drains the read side;
    /// a stale snapshot stranded behind a newer one is discarded.
    pub fn take_snapshot(&self) -> Option<RenderSnapshot> {
        self.snapshots.drain().pop()
    }

    /// Render thread: frame `frame_index` is fully consumed; retirement for
    /// older frames is now safe.
    pub fn signal_frame_consumed(&self, frame_index: u64) {
        self.consumed_frame.fetch_max(frame_index, Ordering::AcqRel);
    }

    // ------------------------------------------------------------------
    // Main-thread side
    // ------------------------------------------------------------------

    /// Publish one frame's snapshot (main thread, end of frame).
    pub fn publish_snapshot(&self, snapshot: RenderSnapshot) {
        self.snapshots.push(snapshot);
        self.snapshots.flip();
    }

    pub fn last_consumed_frame(&self) -> u64 {
        self.consumed_frame.load(Ordering::Acquire)
    }

    /// True when the render thread has caught up far enough that resources
    /// retired before `frame_index` can be freed.
    pub fn retirement_safe(&self, frame_index: u64) -> bool {
        self.last_consumed_frame() + 1 >= frame_index
    }
}

/// Thread-local recorder for one secondary command buffer. Finish pushes the
/// handle onto the pending buffer; dropping without finishing abandons the
/// recording (and is reported).
pub struct SecondaryCmdRecorder {
    handoff: Option<Arc<RenderHandoff>>,
    handle: SecondaryCmdHandle,
}

impl SecondaryCmdRecorder {
    pub fn handle(&self) -> SecondaryCmdHandle {
        self.handle
    }

    /// Close the recorder and hand the buffer to the render thread.
    pub fn finish(mut self) {
        let handoff = self.handoff.take().expect("present until finish or drop");
        RECORDER_OPEN.with(|open| open.set(false));
        handoff.pending.push(self.handle);
    }
}

impl Drop for SecondaryCmdRecorder {
    fn drop(&mut self) {
        if let Some(handoff) = self.handoff.take() {
            RECORDER_OPEN.with(|open| open.set(false));
            handoff
                .diagnostics
                .report_recoverable("secondary command recorder dropped without finish");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::thread;

    fn handoff() -> Arc<RenderHandoff> {
        RenderHandoff::new(Arc::new(Diagnostics::new()))
    }

    #[test]
    fn worker_recorders_hand_unique_buffers_to_the_consumer() {
        let handoff = handoff();
        let mut producers = vec![];
        for _ in 0..4 {
            let handoff = handoff.clone();
            producers.push(thread::spawn(move || {
                for _ in 0..1000 {
                    let recorder = handoff.begin_worker_secondary();
                    recorder.finish();
                }
            }));
        }
        for p in producers {
            p.join().unwrap();
        }

        let first = handoff.take_pending();
        assert_eq!(first.len(), 4000);
        let unique: HashSet<_> = first.iter().copied().collect();
        assert_eq!(unique.len(), 4000, "no handle observed twice");

        handoff.mark_submitted(first);
        assert_eq!(handoff.take_pending().len(), 0, "no handle lost or repeated");
        assert_eq!(handoff.take_submitted().len(), 4000);
    }

    #[test]
    fn snapshot_flip_hands_over_whole_frames() {
        let handoff = handoff();
        assert!(handoff.take_snapshot().is_none());

        handoff.publish_snapshot(RenderSnapshot {
            frame_index: 1,
            instances: Vec::new(),
            tlas_generation: Some(3),
        });
        let snap = handoff.take_snapshot().unwrap();
        assert_eq!(snap.frame_index, 1);
        assert_eq!(snap.tlas_generation, Some(3));
        assert!(handoff.take_snapshot().is_none(), "consumed exactly once");
    }

    #[test]
    fn retirement_waits_for_the_render_thread() {
        let handoff = handoff();
        assert!(handoff.retirement_safe(1));
        assert!(!handoff.retirement_safe(2));
        handoff.signal_frame_consumed(1);
        assert!(handoff.retirement_safe(2));
        handoff.signal_frame_consumed(5);
        handoff.signal_frame_consumed(3); // late signal never regresses
        assert_eq!(handoff.last_consumed_frame(), 5);
    }
}
