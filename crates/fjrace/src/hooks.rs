//! C-linkage entry points for the instrumentation front-end.
//!
//! The instrumented program calls these functions on whatever worker
//! thread executes the event. Each hook forwards to the calling thread's
//! [`WorkerView`]; the view is created on first use, and the process-wide
//! [`RaceTool`] (configuration, report sink, diagnostic logging) is
//! initialized lazily with it.
//!
//! The reducer hooks at the bottom operate on runtime-owned view storage
//! and are the only ones that touch raw pointers besides `unit_init`.
//!
//! # Safety
//!
//! The front-end must ensure:
//! - hooks are called from the thread executing the instrumented code
//! - `unit_init`'s `file_name` is null or a valid NUL-terminated string
//! - reducer hook pointers refer to storage sized and aligned for a
//!   shadow-stack view, per the contracts in `fjrace_engine::reducer`
//!
//! A program-invariant violation inside the engine unwinds into these
//! `extern "C"` frames and aborts the process, which is the intended
//! failure mode: continuing after a corrupted shadow stack would poison
//! every later result.

use std::cell::RefCell;
use std::ffi::{CStr, c_char, c_void};
use std::sync::{Arc, OnceLock};

use fjrace_engine::{ShadowStack, identity_in_place, reduce_in_place};
use tracing::{error, trace};
use tracing_subscriber::EnvFilter;

use crate::config::ToolConfig;
use crate::report::{Phase, ReportBuffer, ReportSink};
use crate::tool::{EventId, RaceTool, WorkerView};

static TOOL: OnceLock<Arc<RaceTool>> = OnceLock::new();

/// The process-wide tool, created on first use.
fn tool() -> &'static Arc<RaceTool> {
    TOOL.get_or_init(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_target(false)
            .try_init();
        match RaceTool::from_env() {
            Ok(tool) => Arc::new(tool),
            Err(e) => {
                error!(error = %e, "falling back to stdout for race reports");
                let mut config = ToolConfig::from_env();
                config.output = None;
                Arc::new(RaceTool::with_sink(
                    config,
                    ReportSink::from_writer(Box::new(std::io::stdout())),
                ))
            }
        }
    })
}

thread_local! {
    static VIEW: RefCell<Option<WorkerView>> = const { RefCell::new(None) };
}

/// Run `f` against the calling worker's view.
fn with_view(f: impl FnOnce(&mut WorkerView)) {
    VIEW.with(|cell| {
        let mut slot = cell.borrow_mut();
        let view = slot.get_or_insert_with(|| WorkerView::new(tool().clone()));
        f(view);
    });
}

// =============================================================================
// Instrumentation hooks - called by the instrumented program
// =============================================================================

/// Tool initialization. The tool is otherwise created lazily; this just
/// front-loads the work before the first real event.
#[unsafe(no_mangle)]
pub extern "C" fn __fjrace_init() {
    let _ = tool();
    trace!("init");
}

/// Per-translation-unit initialization. No per-unit state is kept.
///
/// # Safety
///
/// `file_name` must be null or point to a valid NUL-terminated string.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn __fjrace_unit_init(file_name: *const c_char, _counts: *const c_void) {
    if !file_name.is_null() {
        let name = unsafe { CStr::from_ptr(file_name) };
        trace!(unit = %name.to_string_lossy(), "unit_init");
    }
}

/// Function entry.
#[unsafe(no_mangle)]
pub extern "C" fn __fjrace_func_entry(func_id: EventId, _prop: u64) {
    with_view(|view| view.func_entry(func_id));
}

/// Function exit.
#[unsafe(no_mangle)]
pub extern "C" fn __fjrace_func_exit(func_exit_id: EventId, func_id: EventId, _prop: u64) {
    with_view(|view| view.func_exit(func_exit_id, func_id));
}

/// Basic-block entry. Not used by the detector.
#[unsafe(no_mangle)]
pub extern "C" fn __fjrace_bb_entry(bb_id: EventId, _prop: u64) {
    trace!(bb_id, "bb_entry");
}

/// Basic-block exit. Not used by the detector.
#[unsafe(no_mangle)]
pub extern "C" fn __fjrace_bb_exit(bb_id: EventId, _prop: u64) {
    trace!(bb_id, "bb_exit");
}

/// About to load `nbytes` from `addr`.
#[unsafe(no_mangle)]
pub extern "C" fn __fjrace_before_load(load_id: EventId, addr: u64, nbytes: u64, _prop: u64) {
    with_view(|view| view.before_load(load_id, addr, nbytes));
}

/// Load completed. Not used by the detector.
#[unsafe(no_mangle)]
pub extern "C" fn __fjrace_after_load(load_id: EventId, _addr: u64, _nbytes: u64, _prop: u64) {
    trace!(load_id, "after_load");
}

/// About to store `nbytes` at `addr`.
#[unsafe(no_mangle)]
pub extern "C" fn __fjrace_before_store(store_id: EventId, addr: u64, nbytes: u64, _prop: u64) {
    with_view(|view| view.before_store(store_id, addr, nbytes));
}

/// Store completed. Not used by the detector.
#[unsafe(no_mangle)]
pub extern "C" fn __fjrace_after_store(store_id: EventId, _addr: u64, _nbytes: u64, _prop: u64) {
    trace!(store_id, "after_store");
}

/// A child strand is being detached in sync region `sync_reg`.
#[unsafe(no_mangle)]
pub extern "C" fn __fjrace_detach(detach_id: EventId, sync_reg: u32, _prop: u64) {
    with_view(|view| view.detach(detach_id, sync_reg));
}

/// The continuation after detach `detach_id` is resuming.
#[unsafe(no_mangle)]
pub extern "C" fn __fjrace_detach_continue(
    continue_id: EventId,
    detach_id: EventId,
    sync_reg: u32,
    _prop: u64,
) {
    with_view(|view| view.detach_continue(continue_id, detach_id, sync_reg));
}

/// A detached task is starting.
#[unsafe(no_mangle)]
pub extern "C" fn __fjrace_task(task_id: EventId, detach_id: EventId, _prop: u64) {
    with_view(|view| view.task(task_id, detach_id));
}

/// A detached task is done.
#[unsafe(no_mangle)]
pub extern "C" fn __fjrace_task_exit(
    exit_id: EventId,
    task_id: EventId,
    _detach_id: EventId,
    sync_reg: u32,
    _prop: u64,
) {
    with_view(|view| view.task_exit(exit_id, task_id, sync_reg));
}

/// A sync is about to be awaited.
#[unsafe(no_mangle)]
pub extern "C" fn __fjrace_before_sync(sync_id: EventId, sync_reg: u32) {
    with_view(|view| view.before_sync(sync_id, sync_reg));
}

/// A sync completed for region `sync_reg`.
#[unsafe(no_mangle)]
pub extern "C" fn __fjrace_after_sync(sync_id: EventId, sync_reg: u32) {
    with_view(|view| view.after_sync(sync_id, sync_reg));
}

/// A function allocated `nbytes` of stack storage at `addr`.
#[unsafe(no_mangle)]
pub extern "C" fn __fjrace_after_alloca(alloca_id: EventId, addr: u64, nbytes: u64, _prop: u64) {
    with_view(|view| view.after_alloca(alloca_id, addr, nbytes));
}

// =============================================================================
// Reducer hooks - registered with the scheduling runtime
// =============================================================================

/// Construct the reducer identity view at `view`.
///
/// # Safety
///
/// `view` must be null (ignored) or point to uninitialized storage sized
/// and aligned for a shadow-stack view, owned by the runtime.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn __fjrace_identity(view: *mut c_void) {
    if view.is_null() {
        return;
    }
    let strategy = tool().config().reduce_strategy;
    trace!(?strategy, "identity");
    unsafe { identity_in_place(view.cast::<ShadowStack>(), strategy) };
}

/// Merge the view at `right` into the view at `left` and destroy `right`.
///
/// # Safety
///
/// `left` and `right` must be null (ignored) or point to distinct live
/// views created by [`__fjrace_identity`] or owned by worker entry. The
/// storage at `right` holds no live value afterwards.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn __fjrace_reduce(left: *mut c_void, right: *mut c_void) {
    if left.is_null() || right.is_null() {
        return;
    }
    let tool = tool();
    let strategy = tool.config().reduce_strategy;
    trace!(?strategy, "reduce");
    let witness = unsafe {
        reduce_in_place(
            left.cast::<ShadowStack>(),
            right.cast::<ShadowStack>(),
            strategy,
        )
    };
    if witness.is_empty() {
        return;
    }
    let mut buffer = ReportBuffer::new();
    buffer.record(Phase::Reduce, &witness);
    if let Err(e) = tool.sink().absorb(&mut buffer) {
        error!(error = %e, "failed to flush race reports");
    }
    if tool.config().fatal {
        std::process::abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem::MaybeUninit;

    #[test]
    fn test_balanced_stream_through_hooks() {
        __fjrace_init();
        unsafe { __fjrace_unit_init(c"demo.c".as_ptr(), std::ptr::null()) };
        __fjrace_func_entry(1, 0);
        __fjrace_before_store(2, 0x100, 8, 0);
        __fjrace_detach(3, 0, 0);
        __fjrace_task(4, 3, 0);
        __fjrace_before_store(5, 0x200, 8, 0);
        __fjrace_task_exit(6, 4, 3, 0, 0);
        __fjrace_detach_continue(7, 3, 0, 0);
        __fjrace_before_store(8, 0x300, 8, 0);
        __fjrace_before_sync(9, 0);
        __fjrace_after_sync(9, 0);
        __fjrace_func_exit(10, 1, 0);

        VIEW.with(|cell| {
            let slot = cell.borrow();
            assert_eq!(slot.as_ref().expect("view exists").depth(), 1);
        });
    }

    #[test]
    fn test_reducer_hooks_round_trip() {
        let mut left = MaybeUninit::<ShadowStack>::uninit();
        let mut right = MaybeUninit::<ShadowStack>::uninit();
        unsafe {
            __fjrace_identity(left.as_mut_ptr().cast());
            __fjrace_identity(right.as_mut_ptr().cast());

            // Default strategy is concatenation: identities are empty.
            (*left.as_mut_ptr()).push_task();
            (*left.as_mut_ptr()).register_write(0xB);
            (*right.as_mut_ptr()).push_task();

            __fjrace_reduce(left.as_mut_ptr().cast(), right.as_mut_ptr().cast());

            let mut merged = left.assume_init();
            assert_eq!(merged.depth(), 2);
            let _ = merged.join();
            assert_eq!(merged.depth(), 1);
        }
    }

    #[test]
    fn test_reducer_hooks_tolerate_null() {
        unsafe {
            __fjrace_identity(std::ptr::null_mut());
            __fjrace_reduce(std::ptr::null_mut(), std::ptr::null_mut());
        }
    }
}
