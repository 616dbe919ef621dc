//! fjrace - determinacy-race detection for instrumented fork-join programs.
//!
//! A race exists when two logically parallel strands access the same
//! location and at least one writes. The detector attaches to a program
//! whose compiler emitted callbacks at function entry/exit, loads and
//! stores, task detach/exit, and sync. Every worker thread feeds its
//! events into its own shadow-stack view; at each join and sync the views
//! prove the just-completed siblings disjoint or report the overlap.
//!
//! This crate is the tool surface: the `extern "C"` hook vocabulary the
//! front-end targets ([`hooks`]), the per-worker event dispatch
//! ([`RaceTool`] / [`WorkerView`]), the report sink, and configuration.
//! The underlying shadow-stack algebra lives in [`fjrace_engine`] and is
//! re-exported here.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use fjrace::{RaceTool, ToolConfig, WorkerView};
//! use fjrace::report::ReportSink;
//!
//! let tool = Arc::new(RaceTool::with_sink(
//!     ToolConfig::default(),
//!     ReportSink::from_writer(Box::new(std::io::sink())),
//! ));
//! let mut view = WorkerView::new(tool);
//!
//! // spawn { write 0x100 }; write 0x100; sync
//! view.detach(1, 0);
//! view.task(2, 1);
//! view.before_store(3, 0x100, 8);
//! view.task_exit(4, 2, 0);
//! view.detach_continue(5, 1, 0);
//! view.before_store(6, 0x100, 8);
//! view.after_sync(7, 0);
//! ```

pub mod config;
pub mod hooks;
pub mod report;
pub mod tool;

// Re-export from the engine crate
pub use fjrace_engine::{
    AccessSet, Addr, Frame, FrameKind, ReduceStrategy, ShadowStack, SyncReg, Witness,
};

pub use config::ToolConfig;
pub use report::{Phase, RaceReport, ReportBuffer, ReportError, ReportSink};
pub use tool::{EventId, RaceTool, WorkerView};
