//! Shadow-stack race engine for fork-join determinacy-race detection.
//!
//! This crate is the data-structure core of the detector: per-worker
//! [`ShadowStack`] views that summarize memory accesses at the granularity
//! of serial vs. parallel work, merged at every join and sync. A race is
//! an overlap between the writes of two logically parallel strands; every
//! merge returns the overlapping addresses as a [`Witness`].
//!
//! # Layers
//!
//! - [`AccessSet`]: hash set of addresses with size-asymmetric union and
//!   witnessing intersection.
//! - [`Frame`]: one strand's serial and parallel access sets, tagged as a
//!   task or continuation frame.
//! - [`ShadowStack`]: the join/sync algebra over frames.
//! - [`reducer`]: the identity/reduce protocol that merges views across
//!   work-stealing workers.
//!
//! The engine is single-threaded per view and holds no locks; all
//! cross-worker coordination goes through [`reducer::reduce`], which the
//! runtime invokes with a happens-before guarantee. Callers decide what to
//! do with witnesses; the engine never reports.

mod frame;
mod set;
mod stack;

pub mod reducer;

pub use frame::{Frame, FrameKind, NO_SYNC_REG, SyncReg};
pub use reducer::{
    IdentityHook, ReduceHook, ReduceStrategy, ReducerRegistration, ReducerRuntime,
    identity_in_place, identity_stack, reduce, reduce_in_place,
};
pub use set::{AccessSet, Addr, Witness};
pub use stack::ShadowStack;
