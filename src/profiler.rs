//! Profiler lifecycle: open, sync, status, close.
//!
//! `open` validates everything up front (no file is created and no
//! thread is spawned on a configuration error), writes the placeholder
//! header, and starts the three sampler threads plus the writer.
//! Shutdown runs from `close` or from `Drop`, so a panic or early
//! return inside the recording scope still finalizes the trace file
//! with correct counts.

use std::fs::File;
use std::io::Write;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use log::{debug, error, warn};

use crate::config::BoardConfig;
use crate::ring::{tier_capacity, SampleRing};
use crate::sampler::{fast_loop, medium_loop, monotonic_ns, slow_loop};
use crate::sources::{self, SoftErrorCounts, SoftErrors, SourceFlags};
use crate::trace::format::{
    FastSample, MediumSample, SlowSample, SyncPoint, TraceHeader, HEADER_SIZE, MAGIC, VERSION,
};
use crate::writer::{writer_loop, TierRings};
use crate::Error;

const DEFAULT_FAST_HZ: u32 = 1000;
const DEFAULT_MEDIUM_HZ: u32 = 100;
const DEFAULT_SLOW_HZ: u32 = 10;

/// Sampling rates must fit a non-realtime kernel's timer resolution.
const MAX_HZ: u32 = 2000;

/// Configures and starts a [`Profiler`].
///
/// ```no_run
/// use tegraprof::{boards, Profiler};
///
/// let config = boards::detect()?;
/// let profiler = Profiler::builder(config)
///     .fast_hz(500)
///     .medium_hz(50)
///     .start("trace.bin")?;
/// # Ok::<(), tegraprof::Error>(())
/// ```
pub struct ProfilerBuilder {
    config: BoardConfig,
    fast_hz: u32,
    medium_hz: u32,
    slow_hz: u32,
}

impl ProfilerBuilder {
    pub fn new(config: BoardConfig) -> ProfilerBuilder {
        ProfilerBuilder {
            config,
            fast_hz: DEFAULT_FAST_HZ,
            medium_hz: DEFAULT_MEDIUM_HZ,
            slow_hz: DEFAULT_SLOW_HZ,
        }
    }

    /// Fast-tier rate in Hz, 1..=2000. Default 1000.
    pub fn fast_hz(&mut self, hz: u32) -> &mut ProfilerBuilder {
        self.fast_hz = hz;
        self
    }

    /// Medium-tier rate in Hz, 1..=2000. Default 100.
    pub fn medium_hz(&mut self, hz: u32) -> &mut ProfilerBuilder {
        self.medium_hz = hz;
        self
    }

    /// Slow-tier rate in Hz, 1..=2000. Default 10.
    pub fn slow_hz(&mut self, hz: u32) -> &mut ProfilerBuilder {
        self.slow_hz = hz;
        self
    }

    /// Creates the trace file and starts sampling.
    pub fn start<P: AsRef<Path>>(&self, path: P) -> Result<Profiler, Error> {
        let path = path.as_ref();
        check_rate("fast_hz", self.fast_hz)?;
        check_rate("medium_hz", self.medium_hz)?;
        check_rate("slow_hz", self.slow_hz)?;
        self.config.validate()?;

        let soft_errors = Arc::new(SoftErrors::default());
        let (fast_sources, medium_sources, slow_sources, flags) =
            sources::open_all(&self.config, &soft_errors)?;

        let mut file = File::create(path)?;
        file.write_all(&[0u8; HEADER_SIZE])?;

        let header = TraceHeader {
            magic: MAGIC,
            version: VERSION,
            board_name: self.config.board_name.clone(),
            num_cpu_cores: self.config.num_cpu_cores as u8,
            num_power_rails: self.config.power_rails.len() as u8,
            num_thermal_zones: self.config.thermal_zones.len() as u8,
            emc_available: flags.contains(SourceFlags::EMC),
            fast_hz: self.fast_hz,
            medium_hz: self.medium_hz,
            slow_hz: self.slow_hz,
            n_fast: 0,
            n_medium: 0,
            n_slow: 0,
            n_sync: 0,
            power_rail_names: self.config.power_rails.iter().map(|r| r.label.clone()).collect(),
            thermal_zone_names: self.config.thermal_zones.iter().map(|z| z.name.clone()).collect(),
        };

        let stop = Arc::new(AtomicBool::new(false));
        let fast_written = Arc::new(AtomicU64::new(0));
        let sync_counter = Arc::new(AtomicU64::new(0));
        let fast_ring = Arc::new(SampleRing::with_capacity(tier_capacity(self.fast_hz, 1024)));
        let medium_ring = Arc::new(SampleRing::with_capacity(tier_capacity(self.medium_hz, 128)));
        let slow_ring = Arc::new(SampleRing::with_capacity(tier_capacity(self.slow_hz, 16)));
        let sync_ring = Arc::new(SampleRing::with_capacity(64));

        debug!(
            "profiling {} at {}/{}/{} Hz into {}",
            self.config.board_name,
            self.fast_hz,
            self.medium_hz,
            self.slow_hz,
            path.display()
        );

        let start_ns = monotonic_ns();
        let mut samplers: Vec<JoinHandle<()>> = Vec::with_capacity(3);

        {
            let ring = fast_ring.clone();
            let thread_stop = stop.clone();
            let hz = self.fast_hz;
            spawn_sampler(&stop, &mut samplers, "tegraprof-fast", move || {
                fast_loop(fast_sources, ring, thread_stop, start_ns, hz)
            })?;
        }
        {
            let ring = medium_ring.clone();
            let thread_stop = stop.clone();
            let hz = self.medium_hz;
            spawn_sampler(&stop, &mut samplers, "tegraprof-medium", move || {
                medium_loop(medium_sources, ring, thread_stop, start_ns, hz)
            })?;
        }
        {
            let ring = slow_ring.clone();
            let thread_stop = stop.clone();
            let hz = self.slow_hz;
            spawn_sampler(&stop, &mut samplers, "tegraprof-slow", move || {
                slow_loop(slow_sources, ring, thread_stop, start_ns, hz)
            })?;
        }

        let writer = {
            let rings = TierRings {
                fast: fast_ring.clone(),
                medium: medium_ring.clone(),
                slow: slow_ring.clone(),
                sync: sync_ring.clone(),
            };
            let writer_stop = stop.clone();
            let writer_counter = fast_written.clone();
            let spawned = thread::Builder::new()
                .name("tegraprof-writer".to_string())
                .spawn(move || writer_loop(file, header, rings, writer_stop, writer_counter));
            match spawned {
                Ok(handle) => handle,
                Err(err) => {
                    stop.store(true, Ordering::Release);
                    for handle in samplers.drain(..) {
                        let _ = handle.join();
                    }
                    return Err(err.into());
                }
            }
        };

        Ok(Profiler {
            stop,
            fast_written,
            sync_counter,
            fast_ring,
            medium_ring,
            slow_ring,
            sync_ring,
            soft_errors,
            sources: flags,
            samplers,
            writer: Some(writer),
        })
    }
}

fn check_rate(tier: &'static str, hz: u32) -> Result<(), Error> {
    if hz == 0 || hz > MAX_HZ {
        return Err(Error::InvalidRate { tier, hz });
    }
    Ok(())
}

fn spawn_sampler<F>(
    stop: &Arc<AtomicBool>,
    samplers: &mut Vec<JoinHandle<()>>,
    name: &str,
    body: F,
) -> Result<(), Error>
where
    F: FnOnce() + Send + 'static,
{
    match thread::Builder::new().name(name.to_string()).spawn(body) {
        Ok(handle) => {
            samplers.push(handle);
            Ok(())
        }
        Err(err) => {
            stop.store(true, Ordering::Release);
            for handle in samplers.drain(..) {
                let _ = handle.join();
            }
            Err(err.into())
        }
    }
}

/// Ring overflow counters, one per tier stream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RingOverflows {
    pub fast: u64,
    pub medium: u64,
    pub slow: u64,
    pub sync: u64,
}

/// Point-in-time view of a running (or stopped) profiler.
#[derive(Debug, Clone)]
pub struct Status {
    pub running: bool,
    /// Fast records flushed to the trace so far.
    pub fast_samples_written: u64,
    /// Sync markers issued so far.
    pub sync_points_issued: u64,
    pub ring_overflows: RingOverflows,
    pub soft_errors: SoftErrorCounts,
    pub sources: SourceFlags,
}

/// A recording session. Dropping it finalizes the trace file.
pub struct Profiler {
    stop: Arc<AtomicBool>,
    fast_written: Arc<AtomicU64>,
    sync_counter: Arc<AtomicU64>,
    fast_ring: Arc<SampleRing<FastSample>>,
    medium_ring: Arc<SampleRing<MediumSample>>,
    slow_ring: Arc<SampleRing<SlowSample>>,
    sync_ring: Arc<SampleRing<SyncPoint>>,
    soft_errors: Arc<SoftErrors>,
    sources: SourceFlags,
    samplers: Vec<JoinHandle<()>>,
    writer: Option<JoinHandle<Result<TraceHeader, Error>>>,
}

impl Profiler {
    /// Opens a session with default rates (1000/100/10 Hz).
    pub fn open<P: AsRef<Path>>(path: P, config: BoardConfig) -> Result<Profiler, Error> {
        ProfilerBuilder::new(config).start(path)
    }

    pub fn builder(config: BoardConfig) -> ProfilerBuilder {
        ProfilerBuilder::new(config)
    }

    /// Issues the next sync marker and returns its 1-based ID.
    ///
    /// Lock-free: one counter increment plus one read of the fast
    /// write counter; safe from any thread and never blocks the fast
    /// tier. Once shutdown has begun this is a no-op returning the
    /// last issued ID.
    pub fn sync(&self) -> u64 {
        if self.stop.load(Ordering::Acquire) {
            return self.sync_counter.load(Ordering::Acquire);
        }
        let sync_id = self.sync_counter.fetch_add(1, Ordering::AcqRel) + 1;
        let fast_sample_idx = self.fast_written.load(Ordering::Acquire);
        self.sync_ring.push(SyncPoint {
            sync_id,
            fast_sample_idx,
        });
        sync_id
    }

    /// Fast records flushed to the trace so far. Non-blocking.
    pub fn sample_count(&self) -> u64 {
        self.fast_written.load(Ordering::Acquire)
    }

    pub fn is_running(&self) -> bool {
        self.writer.is_some() && !self.stop.load(Ordering::Acquire)
    }

    pub fn status(&self) -> Status {
        Status {
            running: self.is_running(),
            fast_samples_written: self.sample_count(),
            sync_points_issued: self.sync_counter.load(Ordering::Acquire),
            ring_overflows: RingOverflows {
                fast: self.fast_ring.overflow_count(),
                medium: self.medium_ring.overflow_count(),
                slow: self.slow_ring.overflow_count(),
                sync: self.sync_ring.overflow_count(),
            },
            soft_errors: self.soft_errors.snapshot(),
            sources: self.sources,
        }
    }

    /// Stops sampling, drains the rings, rewrites the header with the
    /// final counts, and closes the file. Surfaces any writer error.
    pub fn close(mut self) -> Result<(), Error> {
        self.shutdown()
    }

    /// Idempotent shutdown shared by `close` and `Drop`. Samplers are
    /// joined first so the rings stop filling, the writer last.
    fn shutdown(&mut self) -> Result<(), Error> {
        let writer = match self.writer.take() {
            Some(writer) => writer,
            None => return Ok(()),
        };
        self.stop.store(true, Ordering::Release);
        for handle in self.samplers.drain(..) {
            let _ = handle.join();
        }
        let result = match writer.join() {
            Ok(Ok(header)) => {
                debug!(
                    "trace finalized: {} fast / {} medium / {} slow / {} sync records",
                    header.n_fast, header.n_medium, header.n_slow, header.n_sync
                );
                Ok(())
            }
            Ok(Err(err)) => Err(err),
            Err(_) => Err(Error::WriterPanicked),
        };
        let overflows = RingOverflows {
            fast: self.fast_ring.overflow_count(),
            medium: self.medium_ring.overflow_count(),
            slow: self.slow_ring.overflow_count(),
            sync: self.sync_ring.overflow_count(),
        };
        if overflows != RingOverflows::default() {
            warn!("samples dropped on ring overflow: {:?}", overflows);
        }
        result
    }
}

impl Drop for Profiler {
    fn drop(&mut self) {
        if let Err(err) = self.shutdown() {
            error!("trace finalization failed: {}", err);
        }
    }
}
