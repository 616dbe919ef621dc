//! Event dispatch: instrumentation callbacks become stack operations.
//!
//! A [`RaceTool`] holds the process-wide pieces (configuration and report
//! sink). A [`WorkerView`] holds everything one worker mutates: its shadow
//! stack, the stack extents of the functions it is currently inside, and
//! its report buffer. Callbacks execute to completion on the calling
//! worker; nothing here takes a lock except the final drain into the sink.
//!
//! Function entry/exit are modeled as a task push and join, so a function
//! body is checked like a strand joining its caller. On exit, any address
//! inside the function's recorded alloca extent is erased from the frame
//! first: stack locals cannot race beyond the function that owned them.

use std::sync::Arc;

use fjrace_engine::{Addr, ShadowStack, SyncReg, Witness, identity_stack, reduce};
use tracing::{error, trace, warn};

use crate::config::ToolConfig;
use crate::report::{Phase, ReportBuffer, ReportError, ReportSink};

/// Instrumentation event id, as assigned by the front-end.
pub type EventId = i64;

/// Process-wide tool state shared by all worker views.
#[derive(Debug)]
pub struct RaceTool {
    config: ToolConfig,
    sink: ReportSink,
}

impl RaceTool {
    /// Build the tool from a configuration, opening its report sink.
    pub fn new(config: ToolConfig) -> Result<Self, ReportError> {
        let sink = ReportSink::from_config(&config)?;
        Ok(Self { config, sink })
    }

    /// Build the tool from the process environment.
    pub fn from_env() -> Result<Self, ReportError> {
        Self::new(ToolConfig::from_env())
    }

    /// Build the tool with an explicit sink. Used by tests that want to
    /// inspect the report stream.
    pub fn with_sink(config: ToolConfig, sink: ReportSink) -> Self {
        Self { config, sink }
    }

    /// The active configuration.
    pub fn config(&self) -> &ToolConfig {
        &self.config
    }

    /// The shared report sink.
    pub fn sink(&self) -> &ReportSink {
        &self.sink
    }
}

/// Accumulated alloca extent of one entered function.
///
/// Empty until the first `after_alloca`; grows to cover every alloca the
/// function performs.
#[derive(Clone, Copy, Debug)]
struct StackExtent {
    lo: Addr,
    hi: Addr,
}

impl StackExtent {
    fn new() -> Self {
        Self {
            lo: Addr::MAX,
            hi: 0,
        }
    }

    fn extend(&mut self, addr: Addr, nbytes: u64) {
        self.lo = self.lo.min(addr);
        self.hi = self.hi.max(addr.saturating_add(nbytes));
    }

    fn is_empty(&self) -> bool {
        self.lo >= self.hi
    }
}

/// One worker's view of the computation.
#[derive(Debug)]
pub struct WorkerView {
    tool: Arc<RaceTool>,
    stack: ShadowStack,
    scopes: Vec<StackExtent>,
    buffer: ReportBuffer,
}

impl WorkerView {
    /// View for a worker entering the computation: a single empty task
    /// frame for the outermost serial context.
    pub fn new(tool: Arc<RaceTool>) -> Self {
        Self {
            tool,
            stack: ShadowStack::new(),
            scopes: Vec::new(),
            buffer: ReportBuffer::new(),
        }
    }

    /// View for a worker picking up stolen work: the reducer identity of
    /// the configured strategy.
    pub fn stolen(tool: Arc<RaceTool>) -> Self {
        let stack = identity_stack(tool.config.reduce_strategy);
        Self {
            tool,
            stack,
            scopes: Vec::new(),
            buffer: ReportBuffer::new(),
        }
    }

    /// Current shadow-stack depth.
    pub fn depth(&self) -> usize {
        self.stack.depth()
    }

    /// An instrumented function was entered: its body is a strand joining
    /// the caller at exit.
    pub fn func_entry(&mut self, func_id: EventId) {
        trace!(func_id, "func_entry");
        self.scopes.push(StackExtent::new());
        self.stack.push_task();
    }

    /// An instrumented function is returning: erase its stack locals, then
    /// join its frame into the caller's.
    pub fn func_exit(&mut self, func_exit_id: EventId, func_id: EventId) {
        trace!(func_exit_id, func_id, "func_exit");
        match self.scopes.pop() {
            Some(extent) => {
                if !extent.is_empty() && !self.stack.is_empty() {
                    self.stack.erase_range(extent.lo, extent.hi);
                }
            }
            None => warn!(func_id, "function exit without matching entry"),
        }
        if self.stack.depth() < 2 {
            warn!(func_id, "function exit with no enclosing frame");
            return;
        }
        let witness = self.stack.join();
        self.report(Phase::Join, witness);
    }

    /// A load is about to execute. Registered only when read tracking is
    /// enabled; writes alone already witness every race.
    pub fn before_load(&mut self, load_id: EventId, addr: Addr, nbytes: u64) {
        trace!(load_id, addr, nbytes, "before_load");
        if !self.tool.config.track_reads {
            return;
        }
        if self.stack.is_empty() {
            warn!(load_id, "load observed with no open frame");
            return;
        }
        self.stack.register_read(addr);
    }

    /// A store is about to execute. Multi-byte stores register their base
    /// address.
    pub fn before_store(&mut self, store_id: EventId, addr: Addr, nbytes: u64) {
        trace!(store_id, addr, nbytes, "before_store");
        if self.stack.is_empty() {
            warn!(store_id, "store observed with no open frame");
            return;
        }
        self.stack.register_write(addr);
    }

    /// A child strand is being spawned: reserve a continuation frame for
    /// the parent's post-detach work in this sync region, then a task
    /// frame for the child.
    pub fn detach(&mut self, detach_id: EventId, sync_reg: SyncReg) {
        trace!(detach_id, sync_reg, "detach");
        self.stack.push_continue(sync_reg);
        self.stack.push_task();
    }

    /// The continuation after a detach is resuming, possibly on a
    /// different worker than the one that detached.
    pub fn detach_continue(&mut self, continue_id: EventId, detach_id: EventId, sync_reg: SyncReg) {
        trace!(continue_id, detach_id, sync_reg, "detach_continue");
        self.stack.push_continue(sync_reg);
    }

    /// A spawned task is starting. Its frame was pushed at the detach.
    pub fn task(&mut self, task_id: EventId, detach_id: EventId) {
        trace!(task_id, detach_id, "task");
    }

    /// A spawned task is done: join its frame into the enclosing one.
    pub fn task_exit(&mut self, exit_id: EventId, task_id: EventId, sync_reg: SyncReg) {
        trace!(exit_id, task_id, sync_reg, "task_exit");
        if self.stack.depth() < 2 {
            warn!(task_id, "task exit with no enclosing frame");
            return;
        }
        let witness = self.stack.join();
        self.report(Phase::Join, witness);
    }

    /// A sync is about to be awaited. Nothing to do until it completes.
    pub fn before_sync(&mut self, sync_id: EventId, sync_reg: SyncReg) {
        trace!(sync_id, sync_reg, "before_sync");
    }

    /// A sync completed: collapse the region's continuation frames.
    pub fn after_sync(&mut self, sync_id: EventId, sync_reg: SyncReg) {
        trace!(sync_id, sync_reg, "after_sync");
        if self.stack.is_empty() {
            warn!(sync_id, sync_reg, "sync observed with no open frame");
            return;
        }
        let witness = self.stack.enter_serial(sync_reg);
        self.report(Phase::Sync, witness);
    }

    /// A function allocated stack storage: widen its recorded extent.
    pub fn after_alloca(&mut self, alloca_id: EventId, addr: Addr, nbytes: u64) {
        trace!(alloca_id, addr, nbytes, "after_alloca");
        match self.scopes.last_mut() {
            Some(extent) => extent.extend(addr, nbytes),
            None => warn!(alloca_id, "alloca observed outside any function"),
        }
    }

    /// Absorb a finished right view, as the runtime's reduce would. The
    /// right view is left empty and may be dropped.
    pub fn merge_stolen(&mut self, right: &mut WorkerView) {
        let strategy = self.tool.config.reduce_strategy;
        trace!(?strategy, "reduce");
        self.buffer.reduce(&mut right.buffer);
        self.scopes.append(&mut right.scopes);
        let witness = reduce(&mut self.stack, &mut right.stack, strategy);
        self.report(Phase::Reduce, witness);
    }

    /// Drain this worker's buffered reports into the shared sink.
    pub fn flush(&mut self) -> Result<(), ReportError> {
        self.tool.sink.absorb(&mut self.buffer)
    }

    fn report(&mut self, phase: Phase, witness: Witness) {
        if witness.is_empty() {
            return;
        }
        self.buffer.record(phase, &witness);
        if self.tool.config.fatal {
            // First race is fatal: get the reports out, then abort.
            if let Err(e) = self.flush() {
                error!(error = %e, "failed to flush race reports");
            }
            std::process::abort();
        }
    }
}

impl Drop for WorkerView {
    fn drop(&mut self) {
        if let Err(e) = self.flush() {
            error!(error = %e, "failed to flush race reports");
        }
    }
}
