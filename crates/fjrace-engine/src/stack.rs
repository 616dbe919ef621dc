//! The shadow stack: per-strand access summaries merged at join and sync.
//!
//! The stack mirrors the spawn structure of the instrumented program. A
//! detach pushes a continuation frame (separating the parent's pre-detach
//! work from its post-detach work) and a task frame for the child; a join
//! pops the child's frame and compares it against the parallel work already
//! recorded below; a sync collapses every continuation frame of one sync
//! region back into serial work.
//!
//! Every merge returns a [`Witness`]: the addresses written by two strands
//! that ran logically in parallel. An empty witness means the strands were
//! disjoint. Reporting is the caller's business; the engine only computes.
//!
//! # Invariants
//!
//! Popping from an empty stack, joining a continuation frame, and dropping
//! a stack that still holds more than one frame are program-invariant
//! violations and panic. A sync that finds no matching continuation frame
//! is an instrumentation anomaly: it degrades to the final serial fold and
//! logs a warning.

use tracing::warn;

use crate::frame::{Frame, FrameKind, SyncReg};
use crate::set::{AccessSet, Addr, Witness};

/// Per-worker shadow stack of access-summary frames.
#[derive(Clone, Debug, Default)]
pub struct ShadowStack {
    frames: Vec<Frame>,
}

/// Collapse a completed strand's parallel sets into its serial sets.
///
/// Anything left in `pw`/`pr` ran in parallel with the strand's own
/// accesses, so an overlap with `sw`/`sr` is a race in its own right (a
/// continuation that wrote what its already-joined sibling wrote, with no
/// sync in between).
pub(crate) fn fold_parallel(frame: &mut Frame, witness: &mut Witness) {
    AccessSet::intersect_into(&frame.sw, &frame.pw, witness);
    AccessSet::intersect_into(&frame.sw, &frame.pr, witness);
    AccessSet::intersect_into(&frame.sr, &frame.pw, witness);
    AccessSet::union_into(&mut frame.sw, &mut frame.pw);
    AccessSet::union_into(&mut frame.sr, &mut frame.pr);
}

/// Record a popped sibling's accesses as parallel work of the frame below,
/// witnessing any overlap with the parallel work already recorded there.
pub(crate) fn merge_sibling(below: &mut Frame, oth: &mut Frame, witness: &mut Witness) {
    AccessSet::intersect_into(&below.pw, &oth.sw, witness);
    AccessSet::intersect_into(&below.pw, &oth.sr, witness);
    AccessSet::intersect_into(&below.pr, &oth.sw, witness);
    AccessSet::union_into(&mut below.pw, &mut oth.sw);
    AccessSet::union_into(&mut below.pr, &mut oth.sr);
}

impl ShadowStack {
    /// Stack for a worker entering the computation: one empty task frame
    /// for the outermost serial context.
    pub fn new() -> Self {
        Self {
            frames: vec![Frame::task()],
        }
    }

    /// Stack with no frames at all, as produced by the concatenating
    /// reducer identity. The first detach or continuation event creates
    /// the frames.
    pub fn empty() -> Self {
        Self { frames: Vec::new() }
    }

    /// Number of frames.
    #[inline]
    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    /// Whether the stack has no frames.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// The topmost frame.
    ///
    /// # Panics
    ///
    /// Panics if the stack is empty.
    pub fn top(&self) -> &Frame {
        self.frames.last().expect("top of empty shadow stack")
    }

    pub(crate) fn top_mut(&mut self) -> &mut Frame {
        self.frames.last_mut().expect("top of empty shadow stack")
    }

    pub(crate) fn pop(&mut self) -> Frame {
        self.frames.pop().expect("pop from empty shadow stack")
    }

    /// Push a fresh task frame for a spawned child (or an entered function).
    pub fn push_task(&mut self) {
        self.frames.push(Frame::task());
    }

    /// Ensure the top frame is a continuation for `sync_reg`, pushing one
    /// if it is not. Pushing is skipped when a detach for the same region
    /// already reserved the slot: the parent's post-detach work keeps
    /// accumulating in that frame.
    pub fn push_continue(&mut self, sync_reg: SyncReg) {
        let covered = self
            .frames
            .last()
            .is_some_and(|f| f.is_continuation_for(sync_reg));
        if !covered {
            self.frames.push(Frame::continuation(sync_reg));
        }
    }

    /// Record a write by the current strand.
    ///
    /// # Panics
    ///
    /// Panics if the stack is empty.
    #[inline]
    pub fn register_write(&mut self, addr: Addr) {
        self.top_mut().sw.insert(addr);
    }

    /// Record a read by the current strand. Only called when read tracking
    /// is enabled; with reads untracked the read sets stay empty and every
    /// read/write intersection is a no-op.
    #[inline]
    pub fn register_read(&mut self, addr: Addr) {
        self.top_mut().sr.insert(addr);
    }

    /// Drop accesses to `[lo, hi)` from the top frame. Used to erase a
    /// returning function's stack locals, which cannot race beyond the
    /// function.
    pub fn erase_range(&mut self, lo: Addr, hi: Addr) {
        let top = self.top_mut();
        top.sw.remove_range(lo, hi);
        top.sr.remove_range(lo, hi);
    }

    /// Join the topmost task frame into the frame below.
    ///
    /// The popped strand is done: its parallel-known accesses fold into its
    /// serial sets, the result is compared against the parallel work the
    /// enclosing frame has already seen, and then recorded there so later
    /// siblings are compared against it too.
    ///
    /// # Panics
    ///
    /// Panics if fewer than two frames remain or if the top frame is a
    /// continuation.
    pub fn join(&mut self) -> Witness {
        assert!(
            self.frames.len() >= 2,
            "join on shadow stack with no enclosing frame"
        );
        let mut witness = Witness::new();
        let mut oth = self.pop();
        assert!(
            oth.kind == FrameKind::Task,
            "join popped a continuation frame"
        );
        fold_parallel(&mut oth, &mut witness);
        merge_sibling(self.top_mut(), &mut oth, &mut witness);
        witness
    }

    /// Collapse the sync region `sync_reg`.
    ///
    /// Every continuation frame tagged `sync_reg` on top of the stack is
    /// folded and merged downward exactly like a join; continuations of
    /// outer regions stay put. Afterwards the surviving top frame's
    /// parallel sets fold into its serial sets without a disjointness
    /// check: the region is closed, and that frame's serial work predates
    /// every strand in it.
    ///
    /// # Panics
    ///
    /// Panics if the stack is empty.
    pub fn enter_serial(&mut self, sync_reg: SyncReg) -> Witness {
        let mut witness = Witness::new();
        if !self.top().is_continuation_for(sync_reg) {
            warn!(sync_reg, "sync without matching continuation frame");
        }
        while self.frames.len() >= 2 && self.top().is_continuation_for(sync_reg) {
            let mut oth = self.pop();
            fold_parallel(&mut oth, &mut witness);
            merge_sibling(self.top_mut(), &mut oth, &mut witness);
        }
        let top = self.top_mut();
        AccessSet::union_into(&mut top.sw, &mut top.pw);
        AccessSet::union_into(&mut top.sr, &mut top.pr);
        witness
    }

    /// Append another stack's frames above this stack's, preserving strand
    /// order. Leaves `oth` empty.
    pub fn append(&mut self, oth: &mut ShadowStack) {
        self.frames.append(&mut oth.frames);
    }
}

impl Drop for ShadowStack {
    fn drop(&mut self) {
        // A balanced event stream leaves at most the outermost frame.
        if self.frames.len() > 1 && !std::thread::panicking() {
            panic!(
                "shadow stack dropped with {} frames of information",
                self.frames.len()
            );
        }
    }
}
