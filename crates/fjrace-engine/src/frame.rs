//! Shadow-stack frames.
//!
//! A frame summarizes one strand's memory accesses, split into serial work
//! (`sw`/`sr`, the strand's own accesses) and parallel work (`pw`/`pr`,
//! accesses of already-joined siblings that ran logically in parallel with
//! whatever the strand does next). The frame is a plain container; all
//! merge logic lives in [`crate::stack::ShadowStack`].

use crate::set::AccessSet;

/// Sync-region tag. Identifies the sync statement that will eventually
/// collapse a continuation frame.
pub type SyncReg = u32;

/// Sentinel tag for frames that do not belong to a sync region.
pub const NO_SYNC_REG: SyncReg = SyncReg::MAX;

/// Whether a frame tracks a spawned child or the parent's post-detach work.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameKind {
    /// A spawned child strand.
    Task,
    /// The parent's work after a detach, bound to one sync region.
    Continuation,
}

/// One shadow-stack frame.
#[derive(Clone, Debug)]
pub struct Frame {
    pub kind: FrameKind,
    /// Meaningful only for continuation frames; [`NO_SYNC_REG`] otherwise.
    pub sync_reg: SyncReg,
    /// Serial reads of this frame's own strand.
    pub sr: AccessSet,
    /// Serial writes of this frame's own strand.
    pub sw: AccessSet,
    /// Reads of already-joined parallel siblings.
    pub pr: AccessSet,
    /// Writes of already-joined parallel siblings.
    pub pw: AccessSet,
}

impl Frame {
    /// Fresh frame for a spawned child.
    pub fn task() -> Self {
        Self {
            kind: FrameKind::Task,
            sync_reg: NO_SYNC_REG,
            sr: AccessSet::new(),
            sw: AccessSet::new(),
            pr: AccessSet::new(),
            pw: AccessSet::new(),
        }
    }

    /// Fresh frame for the parent's post-detach work in region `sync_reg`.
    pub fn continuation(sync_reg: SyncReg) -> Self {
        Self {
            kind: FrameKind::Continuation,
            sync_reg,
            ..Self::task()
        }
    }

    /// Whether this is a continuation frame for region `sync_reg`.
    #[inline]
    pub fn is_continuation_for(&self, sync_reg: SyncReg) -> bool {
        self.kind == FrameKind::Continuation && self.sync_reg == sync_reg
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_frame() {
        let f = Frame::task();
        assert_eq!(f.kind, FrameKind::Task);
        assert_eq!(f.sync_reg, NO_SYNC_REG);
        assert!(f.sw.is_empty() && f.pw.is_empty());
        assert!(!f.is_continuation_for(0));
    }

    #[test]
    fn test_continuation_frame() {
        let f = Frame::continuation(3);
        assert_eq!(f.kind, FrameKind::Continuation);
        assert_eq!(f.sync_reg, 3);
        assert!(f.is_continuation_for(3));
        assert!(!f.is_continuation_for(0));
    }
}
