//! Stateful readers for the kernel pseudo-files backing each metric
//! family.
//!
//! Every file is opened once at profiler start and held for the whole
//! session. Reads go through `pread` at offset 0: debugfs files
//! (notably `mc_all`) answer `lseek` with `ESPIPE`, and a seek-then-read
//! loop silently returns stale data there. Transient read failures
//! never fail a sample; the affected field is zeroed (-1.0 for EMC) and
//! a per-source soft-error counter is bumped.

use std::fs::File;
use std::io;
use std::os::unix::io::AsRawFd;
use std::path::Path;
use std::str;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bitflags::*;
use log::{debug, warn};

use crate::config::BoardConfig;
use crate::trace::format::{FastSample, MediumSample, SlowSample, MAX_CPU_CORES};

bitflags! {
    /// Metric families active for a session. `/proc` sources are always
    /// present; the rest depend on the board config and on what could
    /// actually be opened at start.
    pub struct SourceFlags: u32 {
        const CPU_STAT    = 0b00_0001;
        const MEMINFO     = 0b00_0010;
        const GPU_LOAD    = 0b00_0100;
        const EMC         = 0b00_1000;
        const POWER_RAILS = 0b01_0000;
        const THERMAL     = 0b10_0000;
    }
}

/// Per-source counters of transient read failures. Shared between the
/// sampler threads and the status API.
#[derive(Debug, Default)]
pub struct SoftErrors {
    pub gpu: AtomicU64,
    pub cpu: AtomicU64,
    pub ram: AtomicU64,
    pub emc: AtomicU64,
    pub rails: AtomicU64,
    pub thermal: AtomicU64,
}

/// Point-in-time copy of [`SoftErrors`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SoftErrorCounts {
    pub gpu: u64,
    pub cpu: u64,
    pub ram: u64,
    pub emc: u64,
    pub rails: u64,
    pub thermal: u64,
}

impl SoftErrors {
    pub fn snapshot(&self) -> SoftErrorCounts {
        SoftErrorCounts {
            gpu: self.gpu.load(Ordering::Relaxed),
            cpu: self.cpu.load(Ordering::Relaxed),
            ram: self.ram.load(Ordering::Relaxed),
            emc: self.emc.load(Ordering::Relaxed),
            rails: self.rails.load(Ordering::Relaxed),
            thermal: self.thermal.load(Ordering::Relaxed),
        }
    }

    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// A kernel pseudo-file sampled via positional reads.
pub(crate) struct PseudoFile {
    file: File,
}

impl PseudoFile {
    pub fn open(path: &Path) -> io::Result<PseudoFile> {
        Ok(PseudoFile {
            file: File::open(path)?,
        })
    }

    /// Reads from offset 0 without moving any file offset.
    pub fn pread(&self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            let ret = unsafe {
                libc::pread(
                    self.file.as_raw_fd(),
                    buf.as_mut_ptr() as *mut libc::c_void,
                    buf.len(),
                    0,
                )
            };
            if ret >= 0 {
                return Ok(ret as usize);
            }
            let err = io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::EINTR) {
                return Err(err);
            }
        }
    }

    pub fn read_ascii_u64(&self, buf: &mut [u8]) -> io::Result<u64> {
        let n = self.pread(buf)?;
        parse_ascii::<u64>(&buf[..n])
    }

    pub fn read_ascii_i64(&self, buf: &mut [u8]) -> io::Result<i64> {
        let n = self.pread(buf)?;
        parse_ascii::<i64>(&buf[..n])
    }
}

fn parse_ascii<T: str::FromStr>(bytes: &[u8]) -> io::Result<T> {
    str::from_utf8(bytes)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "not an ASCII integer"))
}

// ---------------------------------------------------------------------
// GPU load

pub(crate) struct GpuLoadSource {
    file: PseudoFile,
    buf: [u8; 32],
    errors: Arc<SoftErrors>,
}

impl GpuLoadSource {
    pub fn open(path: &Path, errors: Arc<SoftErrors>) -> io::Result<GpuLoadSource> {
        Ok(GpuLoadSource {
            file: PseudoFile::open(path)?,
            buf: [0; 32],
            errors,
        })
    }

    /// GPU load in milliunits, clamped to 0..=1000.
    pub fn read(&mut self) -> u16 {
        match self.file.read_ascii_u64(&mut self.buf) {
            Ok(raw) => raw.min(1000) as u16,
            Err(_) => {
                SoftErrors::bump(&self.errors.gpu);
                0
            }
        }
    }
}

// ---------------------------------------------------------------------
// CPU utilization from /proc/stat

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct CpuTimes {
    idle: u64,
    total: u64,
}

/// Parses one `cpu*` line: `(user nice system idle iowait irq softirq
/// steal)`, idle including iowait, total the sum of all eight.
fn parse_cpu_line(line: &str) -> Option<CpuTimes> {
    let mut fields = line.split_whitespace();
    fields.next()?; // label
    let mut values = [0u64; 8];
    for v in values.iter_mut() {
        *v = fields.next()?.parse().ok()?;
    }
    Some(CpuTimes {
        idle: values[3] + values[4],
        total: values.iter().sum(),
    })
}

/// Fills `out[0]` with the aggregate line and `out[1 + i]` with core i.
/// Returns false unless the aggregate and all `num_cores` cores were
/// found.
fn parse_proc_stat(text: &str, num_cores: usize, out: &mut [CpuTimes]) -> bool {
    let mut seen = 0usize;
    for line in text.lines() {
        if !line.starts_with("cpu") {
            continue;
        }
        let label = line.split_whitespace().next().unwrap_or("");
        let slot = if label == "cpu" {
            0
        } else {
            match label[3..].parse::<usize>() {
                Ok(core) if core < num_cores => core + 1,
                _ => continue,
            }
        };
        if let Some(times) = parse_cpu_line(line) {
            out[slot] = times;
            seen += 1;
        }
    }
    seen == num_cores + 1
}

fn utilization(prev: CpuTimes, cur: CpuTimes) -> f32 {
    let total = cur.total.saturating_sub(prev.total);
    if total == 0 {
        return 0.0;
    }
    let idle = cur.idle.saturating_sub(prev.idle);
    let pct = (1.0 - idle as f64 / total as f64) * 100.0;
    pct.max(0.0).min(100.0) as f32
}

pub(crate) struct CpuStatSource {
    file: PseudoFile,
    buf: Vec<u8>,
    prev: [CpuTimes; MAX_CPU_CORES + 1],
    cur: [CpuTimes; MAX_CPU_CORES + 1],
    primed: bool,
    num_cores: usize,
    errors: Arc<SoftErrors>,
}

impl CpuStatSource {
    pub fn open(num_cores: usize, errors: Arc<SoftErrors>) -> io::Result<CpuStatSource> {
        Ok(CpuStatSource {
            file: PseudoFile::open(Path::new("/proc/stat"))?,
            buf: vec![0; 64 * 1024],
            prev: [CpuTimes::default(); MAX_CPU_CORES + 1],
            cur: [CpuTimes::default(); MAX_CPU_CORES + 1],
            primed: false,
            num_cores,
            errors,
        })
    }

    /// Per-core utilization into `per_core`, aggregate as return value.
    /// The first call primes the delta state and reports zeros.
    pub fn read(&mut self, per_core: &mut [f32; MAX_CPU_CORES]) -> f32 {
        for v in per_core.iter_mut() {
            *v = 0.0;
        }
        let n = match self.file.pread(&mut self.buf) {
            Ok(n) => n,
            Err(_) => {
                SoftErrors::bump(&self.errors.cpu);
                return 0.0;
            }
        };
        let text = String::from_utf8_lossy(&self.buf[..n]);
        if !parse_proc_stat(&text, self.num_cores, &mut self.cur) {
            SoftErrors::bump(&self.errors.cpu);
            return 0.0;
        }
        if !self.primed {
            self.prev = self.cur;
            self.primed = true;
            return 0.0;
        }
        for core in 0..self.num_cores {
            per_core[core] = utilization(self.prev[core + 1], self.cur[core + 1]);
        }
        let aggregate = utilization(self.prev[0], self.cur[0]);
        self.prev = self.cur;
        aggregate
    }
}

// ---------------------------------------------------------------------
// RAM from /proc/meminfo

fn first_u64(text: &str) -> Option<u64> {
    text.split_whitespace().next()?.parse().ok()
}

fn parse_meminfo(text: &str) -> Option<(u64, u64)> {
    let mut total = None;
    let mut available = None;
    for line in text.lines() {
        if let Some(rest) = line.strip_prefix("MemTotal:") {
            total = first_u64(rest);
        } else if let Some(rest) = line.strip_prefix("MemAvailable:") {
            available = first_u64(rest);
        }
        if total.is_some() && available.is_some() {
            break;
        }
    }
    Some((total?, available?))
}

pub(crate) struct MemInfoSource {
    file: PseudoFile,
    buf: Vec<u8>,
    errors: Arc<SoftErrors>,
}

impl MemInfoSource {
    pub fn open(errors: Arc<SoftErrors>) -> io::Result<MemInfoSource> {
        Ok(MemInfoSource {
            file: PseudoFile::open(Path::new("/proc/meminfo"))?,
            buf: vec![0; 8 * 1024],
            errors,
        })
    }

    /// `(used_kb, available_kb)` with `used = MemTotal - MemAvailable`.
    pub fn read(&mut self) -> (u64, u64) {
        let n = match self.file.pread(&mut self.buf) {
            Ok(n) => n,
            Err(_) => {
                SoftErrors::bump(&self.errors.ram);
                return (0, 0);
            }
        };
        let text = String::from_utf8_lossy(&self.buf[..n]);
        match parse_meminfo(&text) {
            Some((total, available)) => (total.saturating_sub(available), available),
            None => {
                SoftErrors::bump(&self.errors.ram);
                (0, 0)
            }
        }
    }
}

// ---------------------------------------------------------------------
// EMC utilization from the memory-controller activity counter

/// `Δcounter / (clk_rate_hz * Δt_s) * 100`, clamped to [0, 100]. A
/// stale or zero clock must clamp rather than produce NaN/inf.
fn emc_utilization(delta_count: u64, clk_hz: u64, delta_ns: u64) -> f32 {
    let denom = clk_hz as f64 * (delta_ns as f64 / 1e9);
    if denom <= 0.0 {
        return 0.0;
    }
    let pct = delta_count as f64 / denom * 100.0;
    pct.max(0.0).min(100.0) as f32
}

pub(crate) struct EmcSource {
    actmon: PseudoFile,
    clk: PseudoFile,
    buf: [u8; 64],
    prev: Option<(u64, u64)>, // (counter, t_ns)
    errors: Arc<SoftErrors>,
}

impl EmcSource {
    /// Opens `mc_all` and the EMC clock-rate file, and reads the actmon
    /// window from `mc_all_period` once. Any failure here disables the
    /// EMC feature for the run.
    pub fn open(
        actmon_path: &Path,
        clk_rate_path: &Path,
        errors: Arc<SoftErrors>,
    ) -> io::Result<EmcSource> {
        let actmon = PseudoFile::open(actmon_path)?;
        let clk = PseudoFile::open(clk_rate_path)?;
        let period_path = actmon_path
            .parent()
            .map(|dir| dir.join("mc_all_period"))
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "mc_all has no parent"))?;
        let mut buf = [0u8; 64];
        let sample_period_ns = PseudoFile::open(&period_path)?.read_ascii_u64(&mut buf)?;
        debug!("EMC actmon window: {} ns", sample_period_ns);
        Ok(EmcSource {
            actmon,
            clk,
            buf,
            prev: None,
            errors,
        })
    }

    /// Utilization in percent. The first call primes the counter state
    /// and reports 0.
    pub fn read(&mut self, now_ns: u64) -> f32 {
        let counter = match self.actmon.read_ascii_u64(&mut self.buf) {
            Ok(v) => v,
            Err(_) => {
                SoftErrors::bump(&self.errors.emc);
                return -1.0;
            }
        };
        let clk_hz = match self.clk.read_ascii_u64(&mut self.buf) {
            Ok(v) => v,
            Err(_) => {
                SoftErrors::bump(&self.errors.emc);
                return -1.0;
            }
        };
        let util = match self.prev {
            Some((prev_counter, prev_ns)) => emc_utilization(
                counter.saturating_sub(prev_counter),
                clk_hz,
                now_ns.saturating_sub(prev_ns),
            ),
            None => 0.0,
        };
        self.prev = Some((counter, now_ns));
        util
    }
}

// ---------------------------------------------------------------------
// Power rails and thermal zones

pub(crate) struct RailSource {
    voltage: PseudoFile,
    current: PseudoFile,
    buf: [u8; 32],
    errors: Arc<SoftErrors>,
}

impl RailSource {
    pub fn open(voltage: &Path, current: &Path, errors: Arc<SoftErrors>) -> io::Result<RailSource> {
        Ok(RailSource {
            voltage: PseudoFile::open(voltage)?,
            current: PseudoFile::open(current)?,
            buf: [0; 32],
            errors,
        })
    }

    /// `(voltage_mv, current_ma, power_mw)`.
    pub fn read(&mut self) -> (u32, u32, f32) {
        let voltage = self.voltage.read_ascii_u64(&mut self.buf);
        let current = self.current.read_ascii_u64(&mut self.buf);
        match (voltage, current) {
            (Ok(mv), Ok(ma)) => {
                let mv = mv.min(u32::MAX as u64) as u32;
                let ma = ma.min(u32::MAX as u64) as u32;
                (mv, ma, mv as f32 * ma as f32 / 1000.0)
            }
            _ => {
                SoftErrors::bump(&self.errors.rails);
                (0, 0, 0.0)
            }
        }
    }
}

pub(crate) struct ThermalSource {
    file: PseudoFile,
    buf: [u8; 32],
    errors: Arc<SoftErrors>,
}

impl ThermalSource {
    pub fn open(path: &Path, errors: Arc<SoftErrors>) -> io::Result<ThermalSource> {
        Ok(ThermalSource {
            file: PseudoFile::open(path)?,
            buf: [0; 32],
            errors,
        })
    }

    /// Temperature in degrees Celsius (the file holds millidegrees).
    pub fn read(&mut self) -> f32 {
        match self.file.read_ascii_i64(&mut self.buf) {
            Ok(millideg) => millideg as f32 / 1000.0,
            Err(_) => {
                SoftErrors::bump(&self.errors.thermal);
                0.0
            }
        }
    }
}

// ---------------------------------------------------------------------
// Per-tier source bundles

pub(crate) struct FastSources {
    gpu: Option<GpuLoadSource>,
    cpu: CpuStatSource,
    ram: MemInfoSource,
    emc: Option<EmcSource>,
}

impl FastSources {
    pub fn read_into(&mut self, sample: &mut FastSample, now_ns: u64) {
        if let Some(gpu) = self.gpu.as_mut() {
            sample.gpu_load = gpu.read();
        }
        sample.cpu_aggregate = self.cpu.read(&mut sample.cpu_util);
        let (used, available) = self.ram.read();
        sample.ram_used_kb = used;
        sample.ram_available_kb = available;
        sample.emc_util = match self.emc.as_mut() {
            Some(emc) => emc.read(now_ns),
            None => -1.0,
        };
    }
}

pub(crate) struct MediumSources {
    rails: Vec<Option<RailSource>>,
}

impl MediumSources {
    pub fn read_into(&mut self, sample: &mut MediumSample) {
        for (i, rail) in self.rails.iter_mut().enumerate() {
            if let Some(rail) = rail.as_mut() {
                let (mv, ma, mw) = rail.read();
                sample.voltage_mv[i] = mv;
                sample.current_ma[i] = ma;
                sample.power_mw[i] = mw;
            }
        }
    }
}

pub(crate) struct SlowSources {
    zones: Vec<Option<ThermalSource>>,
}

impl SlowSources {
    pub fn read_into(&mut self, sample: &mut SlowSample) {
        for (i, zone) in self.zones.iter_mut().enumerate() {
            if let Some(zone) = zone.as_mut() {
                sample.temp_c[i] = zone.read();
            }
        }
    }
}

/// Opens every configured source. `/proc` sources must open; everything
/// else degrades to "disabled" with a warning, per the optional-source
/// policy.
pub(crate) fn open_all(
    config: &BoardConfig,
    errors: &Arc<SoftErrors>,
) -> io::Result<(FastSources, MediumSources, SlowSources, SourceFlags)> {
    let mut flags = SourceFlags::CPU_STAT | SourceFlags::MEMINFO;

    let cpu = CpuStatSource::open(config.num_cpu_cores, errors.clone())?;
    let ram = MemInfoSource::open(errors.clone())?;

    let gpu = match config.gpu_load_path.as_deref() {
        Some(path) => match GpuLoadSource::open(path, errors.clone()) {
            Ok(source) => {
                flags |= SourceFlags::GPU_LOAD;
                Some(source)
            }
            Err(err) => {
                warn!("GPU load source {} unavailable: {}", path.display(), err);
                None
            }
        },
        None => None,
    };

    let emc = match (config.emc_actmon_path.as_deref(), config.emc_clk_rate_path.as_deref()) {
        (Some(actmon), Some(clk)) => match EmcSource::open(actmon, clk, errors.clone()) {
            Ok(source) => {
                flags |= SourceFlags::EMC;
                Some(source)
            }
            Err(err) => {
                warn!("EMC source {} unavailable: {}", actmon.display(), err);
                None
            }
        },
        _ => None,
    };

    let mut rails = Vec::with_capacity(config.power_rails.len());
    for rail in &config.power_rails {
        match RailSource::open(&rail.voltage_path, &rail.current_path, errors.clone()) {
            Ok(source) => rails.push(Some(source)),
            Err(err) => {
                warn!("power rail {} unavailable: {}", rail.label, err);
                rails.push(None);
            }
        }
    }
    if rails.iter().any(Option::is_some) {
        flags |= SourceFlags::POWER_RAILS;
    }

    let mut zones = Vec::with_capacity(config.thermal_zones.len());
    for zone in &config.thermal_zones {
        match ThermalSource::open(&zone.temp_path, errors.clone()) {
            Ok(source) => zones.push(Some(source)),
            Err(err) => {
                warn!("thermal zone {} unavailable: {}", zone.name, err);
                zones.push(None);
            }
        }
    }
    if zones.iter().any(Option::is_some) {
        flags |= SourceFlags::THERMAL;
    }

    debug!("active sources: {:?}", flags);
    Ok((
        FastSources { gpu, cpu, ram, emc },
        MediumSources { rails },
        SlowSources { zones },
        flags,
    ))
}
