//! Race reports and the buffered output sink.
//!
//! Reports follow the same hyperobject discipline as the shadow stack
//! itself: each worker accumulates lines in its own [`ReportBuffer`]
//! (identity = fresh buffer, reduce = concatenate), and buffers are
//! absorbed into the process-wide [`ReportSink`] at migration points and
//! at teardown. The sink is the only place a lock is taken.
//!
//! One line per offending address:
//!
//! ```text
//! RACE JOIN addr=0x1008
//! ```

use std::fmt;
use std::fs::File;
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Mutex;

use fjrace_engine::{Addr, Witness};
use thiserror::Error;

use crate::config::ToolConfig;

/// Failure in the report output path.
#[derive(Debug, Error)]
pub enum ReportError {
    #[error("failed to open race report output {path}: {source}")]
    Open {
        path: PathBuf,
        source: io::Error,
    },

    #[error("failed to write race report: {0}")]
    Write(#[from] io::Error),
}

/// Which merge produced a witness.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    /// A task or function joined its enclosing frame.
    Join,
    /// A sync collapsed its region's continuation frames.
    Sync,
    /// A soft-join reduction merged two worker views.
    Reduce,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Phase::Join => "JOIN",
            Phase::Sync => "SYNC",
            Phase::Reduce => "REDUCE",
        })
    }
}

/// One reported race: an address two parallel strands wrote.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RaceReport {
    pub phase: Phase,
    pub addr: Addr,
}

impl fmt::Display for RaceReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RACE {} addr=0x{:x}", self.phase, self.addr)
    }
}

/// Per-worker accumulation of race reports.
#[derive(Debug, Default)]
pub struct ReportBuffer {
    entries: Vec<RaceReport>,
}

impl ReportBuffer {
    /// Fresh, empty buffer (the reducer identity).
    pub fn new() -> Self {
        Self::default()
    }

    /// Record every address of a witness under one phase.
    pub fn record(&mut self, phase: Phase, witness: &Witness) {
        self.entries
            .extend(witness.iter().map(|&addr| RaceReport { phase, addr }));
    }

    /// Append `right`'s reports after this buffer's, preserving the order
    /// of the serial elision. Leaves `right` empty.
    pub fn reduce(&mut self, right: &mut ReportBuffer) {
        self.entries.append(&mut right.entries);
    }

    /// Number of buffered reports.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether any reports are buffered.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Process-wide sink the per-worker buffers drain into.
pub struct ReportSink {
    out: Mutex<Box<dyn Write + Send>>,
}

impl ReportSink {
    /// Open the sink named by the configuration: `CILKSCALE_OUT` if set,
    /// stdout otherwise.
    pub fn from_config(config: &ToolConfig) -> Result<Self, ReportError> {
        let out: Box<dyn Write + Send> = match &config.output {
            Some(path) => Box::new(File::create(path).map_err(|source| ReportError::Open {
                path: path.clone(),
                source,
            })?),
            None => Box::new(io::stdout()),
        };
        Ok(Self::from_writer(out))
    }

    /// Sink writing to an arbitrary writer. Used directly by tests.
    pub fn from_writer(out: Box<dyn Write + Send>) -> Self {
        Self {
            out: Mutex::new(out),
        }
    }

    /// Write out and clear a worker's buffer.
    pub fn absorb(&self, buffer: &mut ReportBuffer) -> Result<(), ReportError> {
        if buffer.entries.is_empty() {
            return Ok(());
        }
        let mut out = self.out.lock().expect("report sink lock poisoned");
        for report in buffer.entries.drain(..) {
            writeln!(out, "{report}")?;
        }
        out.flush()?;
        Ok(())
    }
}

impl fmt::Debug for ReportSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReportSink").finish_non_exhaustive()
    }
}
