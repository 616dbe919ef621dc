//! The reducer protocol: how per-worker shadow-stack views merge.
//!
//! The shadow stack is a hyperobject. Each worker mutates its own view;
//! when the runtime migrates work it calls `identity` to create a fresh
//! view and `reduce` to merge a finished right view into its left
//! neighbor, in the order of the program's serial elision.
//!
//! Two strategies are implemented; a process picks one and stays with it:
//!
//! - [`ReduceStrategy::Concatenate`] (the default): `identity` creates an
//!   empty view and `reduce` appends the right view's frames above the
//!   left's. Race checking happens at the next join or sync, which sees
//!   the concatenated frames exactly as a serial execution would have.
//! - [`ReduceStrategy::SoftJoin`]: `identity` creates a one-frame view and
//!   `reduce` treats the merge as an implicit join, comparing the right
//!   view's single frame against everything the left view's top frame has
//!   accumulated. Races surface during the reduction itself.
//!
//! Both strategies leave the right view empty, and both are associative
//! under the runtime's left-to-right merge order.

use std::ffi::c_void;

use crate::frame::Frame;
use crate::set::{AccessSet, Witness};
use crate::stack::{ShadowStack, fold_parallel};

/// How `reduce` merges a right view into its left neighbor.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ReduceStrategy {
    /// Append the right view's frames; defer checking to the next merge.
    #[default]
    Concatenate,
    /// Treat the reduction as an implicit join and check immediately.
    SoftJoin,
}

/// Fresh view for a worker picking up migrated work.
pub fn identity_stack(strategy: ReduceStrategy) -> ShadowStack {
    match strategy {
        ReduceStrategy::Concatenate => ShadowStack::empty(),
        ReduceStrategy::SoftJoin => ShadowStack::new(),
    }
}

/// Merge `right` into `left`, leaving `right` empty.
///
/// Under [`ReduceStrategy::SoftJoin`] the two views hold the work of
/// logically parallel strands, so the right frame's accesses are checked
/// against both the serial and the parallel sets of the left top frame
/// before being recorded as parallel work.
///
/// # Panics
///
/// Panics under `SoftJoin` if `right` does not hold exactly one frame or
/// `left` is empty.
pub fn reduce(left: &mut ShadowStack, right: &mut ShadowStack, strategy: ReduceStrategy) -> Witness {
    match strategy {
        ReduceStrategy::Concatenate => {
            left.append(right);
            Witness::new()
        }
        ReduceStrategy::SoftJoin => {
            assert!(
                right.depth() == 1,
                "soft-join reduce of a right view with {} frames",
                right.depth()
            );
            let mut witness = Witness::new();
            let mut oth = right.pop();
            fold_parallel(&mut oth, &mut witness);
            soft_join(left.top_mut(), &mut oth, &mut witness);
            witness
        }
    }
}

/// Implicit join of a migrated sibling frame into `below`.
///
/// Unlike a stack join, the sibling is parallel to everything in `below`,
/// including its serial sets.
fn soft_join(below: &mut Frame, oth: &mut Frame, witness: &mut Witness) {
    AccessSet::intersect_into(&below.sw, &oth.sw, witness);
    AccessSet::intersect_into(&below.pw, &oth.sw, witness);
    AccessSet::intersect_into(&below.sw, &oth.sr, witness);
    AccessSet::intersect_into(&below.pw, &oth.sr, witness);
    AccessSet::intersect_into(&below.sr, &oth.sw, witness);
    AccessSet::intersect_into(&below.pr, &oth.sw, witness);
    AccessSet::union_into(&mut below.pw, &mut oth.sw);
    AccessSet::union_into(&mut below.pr, &mut oth.sr);
}

/// Construct a fresh view in place at `view`.
///
/// # Safety
///
/// `view` must point to uninitialized storage with the size and alignment
/// of [`ShadowStack`], owned by the runtime for the life of the view.
pub unsafe fn identity_in_place(view: *mut ShadowStack, strategy: ReduceStrategy) {
    unsafe { view.write(identity_stack(strategy)) };
}

/// Merge the view at `right` into the view at `left` and destroy `right`
/// in place. Returns any witness found during the merge.
///
/// # Safety
///
/// `left` and `right` must point to distinct, initialized views. After
/// the call the storage at `right` no longer holds a live value.
pub unsafe fn reduce_in_place(
    left: *mut ShadowStack,
    right: *mut ShadowStack,
    strategy: ReduceStrategy,
) -> Witness {
    unsafe {
        let left = &mut *left;
        let mut right = right.read();
        let witness = reduce(left, &mut right, strategy);
        debug_assert!(right.is_empty());
        witness
    }
}

/// Hook signatures shared with the scheduling runtime.
pub type IdentityHook = unsafe extern "C" fn(view: *mut c_void);
/// See [`IdentityHook`].
pub type ReduceHook = unsafe extern "C" fn(left: *mut c_void, right: *mut c_void);

/// The runtime's reducer registry, as seen by the tool.
pub trait ReducerRuntime {
    /// Register a hyperobject at `view` with its hook pair.
    ///
    /// # Safety
    ///
    /// `view` must point to `size` bytes of storage holding the leftmost
    /// view, valid until unregistration.
    unsafe fn register(&self, view: *mut c_void, size: usize, identity: IdentityHook, reduce: ReduceHook);

    /// Unregister a previously registered hyperobject.
    ///
    /// # Safety
    ///
    /// `view` must be a pointer previously passed to `register`.
    unsafe fn unregister(&self, view: *mut c_void);
}

/// Pairs registration with unregistration so a view cannot outlive its
/// runtime entry.
pub struct ReducerRegistration<'rt, R: ReducerRuntime> {
    runtime: &'rt R,
    view: *mut c_void,
}

impl<'rt, R: ReducerRuntime> ReducerRegistration<'rt, R> {
    /// Register `view` with the runtime.
    ///
    /// # Safety
    ///
    /// Same contract as [`ReducerRuntime::register`]; additionally `view`
    /// must stay valid for the life of the returned guard.
    pub unsafe fn new(
        runtime: &'rt R,
        view: *mut c_void,
        size: usize,
        identity: IdentityHook,
        reduce: ReduceHook,
    ) -> Self {
        unsafe { runtime.register(view, size, identity, reduce) };
        Self { runtime, view }
    }
}

impl<R: ReducerRuntime> Drop for ReducerRegistration<'_, R> {
    fn drop(&mut self) {
        unsafe { self.runtime.unregister(self.view) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    fn view_with_writes(addrs: &[u64]) -> ShadowStack {
        let mut s = ShadowStack::new();
        for &a in addrs {
            s.register_write(a);
        }
        s
    }

    fn sorted(mut w: Witness) -> Witness {
        w.sort_unstable();
        w.dedup();
        w
    }

    #[test]
    fn test_identity_matches_strategy() {
        assert!(identity_stack(ReduceStrategy::Concatenate).is_empty());
        assert_eq!(identity_stack(ReduceStrategy::SoftJoin).depth(), 1);
    }

    #[test]
    fn test_concatenate_defers_and_empties_right() {
        // Original worker: a spawned child wrote 0xB and joined.
        let mut left = ShadowStack::new();
        left.push_continue(0);
        left.push_task();
        left.register_write(0xB);
        assert!(left.join().is_empty());

        // Thief: resumed the continuation and wrote 0xB too.
        let mut right = ShadowStack::empty();
        right.push_continue(0);
        right.register_write(0xB);

        let witness = reduce(&mut left, &mut right, ReduceStrategy::Concatenate);
        assert!(witness.is_empty());
        assert!(right.is_empty());
        assert_eq!(left.depth(), 3);

        // The deferred check fires at the sync that closes the region.
        assert_eq!(sorted(left.enter_serial(0)), vec![0xB]);
        assert_eq!(left.depth(), 1);
    }

    #[test]
    fn test_soft_join_reports_immediately() {
        let mut left = view_with_writes(&[0xB]);
        let mut right = view_with_writes(&[0xB]);

        let witness = reduce(&mut left, &mut right, ReduceStrategy::SoftJoin);
        assert_eq!(sorted(witness), vec![0xB]);
        assert!(right.is_empty());
        assert_eq!(left.depth(), 1);
        assert!(left.top().pw.contains(0xB));
    }

    #[test]
    fn test_soft_join_disjoint_views() {
        let mut left = view_with_writes(&[0x1]);
        let mut right = view_with_writes(&[0x2]);
        let witness = reduce(&mut left, &mut right, ReduceStrategy::SoftJoin);
        assert!(witness.is_empty());
    }

    #[test]
    #[should_panic(expected = "soft-join reduce")]
    fn test_soft_join_rejects_multi_frame_right() {
        let mut left = view_with_writes(&[0x1]);
        let mut right = ShadowStack::empty();
        right.push_task();
        right.push_task();
        let _ = reduce(&mut left, &mut right, ReduceStrategy::SoftJoin);
    }

    #[test]
    fn test_concatenate_associative() {
        let make = |addr: u64| {
            let mut s = ShadowStack::empty();
            s.push_task();
            s.register_write(addr);
            s
        };

        // (a . b) . c
        let mut ab = view_with_writes(&[0xB]);
        let mut b = make(0xB);
        let mut c = make(0xC);
        let mut w_left = reduce(&mut ab, &mut b, ReduceStrategy::Concatenate);
        w_left.extend(reduce(&mut ab, &mut c, ReduceStrategy::Concatenate));

        // a . (b . c)
        let mut a = view_with_writes(&[0xB]);
        let mut b2 = make(0xB);
        let mut c2 = make(0xC);
        let mut w_right = reduce(&mut b2, &mut c2, ReduceStrategy::Concatenate);
        w_right.extend(reduce(&mut a, &mut b2, ReduceStrategy::Concatenate));

        assert_eq!(w_left, w_right);
        assert_eq!(ab.depth(), a.depth());

        // Drain the concatenated frames the way a sync would.
        while ab.depth() > 1 {
            let _ = ab.join();
        }
        while a.depth() > 1 {
            let _ = a.join();
        }
    }

    #[test]
    fn test_soft_join_associative_witnesses() {
        let run = |order: fn(&mut ShadowStack, &mut ShadowStack, &mut ShadowStack) -> Witness| {
            let mut a = view_with_writes(&[0x1, 0x9]);
            let mut b = view_with_writes(&[0x1, 0x2]);
            let mut c = view_with_writes(&[0x2, 0x9]);
            order(&mut a, &mut b, &mut c)
        };

        let left_assoc = run(|a, b, c| {
            let mut w = reduce(a, b, ReduceStrategy::SoftJoin);
            w.extend(reduce(a, c, ReduceStrategy::SoftJoin));
            w
        });
        let right_assoc = run(|a, b, c| {
            let mut w = reduce(b, c, ReduceStrategy::SoftJoin);
            w.extend(reduce(a, b, ReduceStrategy::SoftJoin));
            w
        });

        assert_eq!(sorted(left_assoc), sorted(right_assoc));
    }

    #[test]
    fn test_in_place_round_trip() {
        use std::mem::MaybeUninit;

        let mut left = view_with_writes(&[0xB]);
        let mut slot = MaybeUninit::<ShadowStack>::uninit();
        unsafe {
            identity_in_place(slot.as_mut_ptr(), ReduceStrategy::SoftJoin);
            let view = &mut *slot.as_mut_ptr();
            view.register_write(0xB);
            let witness = reduce_in_place(&mut left, slot.as_mut_ptr(), ReduceStrategy::SoftJoin);
            assert_eq!(witness, vec![0xB]);
        }
    }

    struct MockRuntime {
        log: RefCell<Vec<&'static str>>,
    }

    impl ReducerRuntime for MockRuntime {
        unsafe fn register(
            &self,
            _view: *mut c_void,
            _size: usize,
            _identity: IdentityHook,
            _reduce: ReduceHook,
        ) {
            self.log.borrow_mut().push("register");
        }

        unsafe fn unregister(&self, _view: *mut c_void) {
            self.log.borrow_mut().push("unregister");
        }
    }

    unsafe extern "C" fn noop_identity(_view: *mut c_void) {}
    unsafe extern "C" fn noop_reduce(_left: *mut c_void, _right: *mut c_void) {}

    #[test]
    fn test_registration_guard_unregisters() {
        let runtime = MockRuntime {
            log: RefCell::new(Vec::new()),
        };
        let mut view = ShadowStack::new();
        {
            let _guard = unsafe {
                ReducerRegistration::new(
                    &runtime,
                    (&raw mut view).cast(),
                    size_of::<ShadowStack>(),
                    noop_identity,
                    noop_reduce,
                )
            };
            assert_eq!(*runtime.log.borrow(), vec!["register"]);
        }
        assert_eq!(*runtime.log.borrow(), vec!["register", "unregister"]);
    }
}
