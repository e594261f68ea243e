//! tegraprof: high-frequency profiling for NVIDIA Jetson Orin boards.
//!
//! Samples GPU load, per-core and aggregate CPU utilization, EMC
//! (external memory controller) utilization, power-rail
//! voltage/current/power, RAM usage, and thermal sensors by reading the
//! kernel's sysfs/procfs/debugfs pseudo-files, and writes everything
//! into one self-describing binary trace file.
//!
//! Three sampling tiers run on dedicated threads against absolute
//! deadline grids: fast (default 1 kHz: GPU, CPU, RAM, EMC), medium
//! (default 100 Hz: power rails), slow (default 10 Hz: thermal zones).
//! A writer thread drains lock-free rings into the trace file;
//! `sync()` interleaves monotonically increasing markers that a reader
//! joins back against the fast stream.
//!
//! ```no_run
//! use tegraprof::{boards, Profiler, TraceFile};
//!
//! let config = boards::detect()?;
//! let profiler = Profiler::open("trace.bin", config)?;
//! profiler.sync(); // mark a phase boundary
//! // ... run the workload ...
//! profiler.sync();
//! profiler.close()?;
//!
//! let trace = TraceFile::open("trace.bin")?;
//! println!("{} fast samples", trace.fast.len());
//! # Ok::<(), tegraprof::Error>(())
//! ```
//!
//! Dropping a [`Profiler`] finalizes the trace as well, so the file is
//! valid on every exit path, panics included.

use std::io;

use thiserror::Error as ThisError;

pub mod boards;
pub mod config;
mod profiler;
mod ring;
mod sampler;
mod sources;
pub mod trace;
mod writer;

pub use crate::config::{BoardConfig, PowerRail, ThermalZone};
pub use crate::profiler::{Profiler, ProfilerBuilder, RingOverflows, Status};
pub use crate::sources::{SoftErrorCounts, SourceFlags};
pub use crate::trace::TraceFile;

/// Everything that can go wrong opening a session or reading a trace.
#[derive(Debug, ThisError)]
pub enum Error {
    /// A sampling rate outside 1..=2000 Hz.
    #[error("invalid {tier}: {hz} Hz (must be in 1..=2000)")]
    InvalidRate { tier: &'static str, hz: u32 },

    /// A `BoardConfig` violating the header limits.
    #[error("invalid board config: {0}")]
    InvalidConfig(String),

    /// The device-tree model (or table name) is not in the pre-baked
    /// board table.
    #[error("unknown board: {0:?}")]
    UnknownBoard(String),

    /// A trace file shorter than its fixed header.
    #[error("trace file too small: {0} bytes")]
    FileTooSmall(usize),

    /// A trace file that does not start with the expected magic.
    #[error("bad magic: 0x{0:08X}")]
    BadMagic(u32),

    /// A trace file written by an incompatible format version.
    #[error("unsupported version: {0}")]
    UnsupportedVersion(u32),

    /// A trace file whose byte length cannot hold the record counts in
    /// its header.
    #[error("truncated trace file ({0})")]
    Truncated(&'static str),

    /// The writer thread died without reporting an error.
    #[error("writer thread panicked")]
    WriterPanicked,

    #[error(transparent)]
    Io(#[from] io::Error),
}
