//! The per-tick drivers for the two simulators.

pub mod cpu;
pub mod gpu;

use crate::profile::Profiler;
use crate::stats::StatsSink;
use std::time::Duration;

/// What a finished simulation hands back to the caller.
pub struct RunOutput {
    pub sink: StatsSink,
    pub profiler: Profiler,
    pub compiler_opts: String,
    pub elapsed: Duration,
}
