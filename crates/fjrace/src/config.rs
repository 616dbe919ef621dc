//! Tool configuration, read once from the environment.
//!
//! | Variable        | Effect                                              |
//! |-----------------|-----------------------------------------------------|
//! | `CILKSCALE_OUT` | Race report output path; absent means stdout.       |
//! | `FJRACE_READS`  | `1`/`true` also tracks loads (read/write races).    |
//! | `FJRACE_REDUCE` | `softjoin` checks races during reduction; default   |
//! |                 | `concat` defers them to the next join or sync.      |
//! | `FJRACE_FATAL`  | `1`/`true` aborts after the first reported race.    |
//!
//! Diagnostic logging is controlled by `RUST_LOG` through the usual
//! `tracing_subscriber` environment filter.

use std::path::PathBuf;

use fjrace_engine::ReduceStrategy;
use tracing::warn;

/// Snapshot of the tool's configuration.
#[derive(Clone, Debug, Default)]
pub struct ToolConfig {
    /// Where race reports go; `None` means stdout.
    pub output: Option<PathBuf>,
    /// Whether loads are registered into the read sets.
    pub track_reads: bool,
    /// How shadow-stack views merge on work migration.
    pub reduce_strategy: ReduceStrategy,
    /// Abort the process after the first reported race.
    pub fatal: bool,
}

impl ToolConfig {
    /// Read the configuration from the process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let reduce_strategy = match lookup("FJRACE_REDUCE").as_deref() {
            None | Some("concat") | Some("concatenate") => ReduceStrategy::Concatenate,
            Some("softjoin") | Some("soft-join") => ReduceStrategy::SoftJoin,
            Some(other) => {
                warn!(value = other, "unknown FJRACE_REDUCE value, using concat");
                ReduceStrategy::Concatenate
            }
        };
        Self {
            output: lookup("CILKSCALE_OUT").map(PathBuf::from),
            track_reads: lookup("FJRACE_READS").as_deref().is_some_and(truthy),
            reduce_strategy,
            fatal: lookup("FJRACE_FATAL").as_deref().is_some_and(truthy),
        }
    }
}

fn truthy(value: &str) -> bool {
    matches!(value, "1" | "true" | "yes" | "on")
}
