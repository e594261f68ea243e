//! The drain thread: consumes all four rings and produces the trace
//! file.
//!
//! Fast records are the bulk of the data and stream straight into a
//! `BufWriter` positioned after the placeholder header. Medium, slow,
//! and sync records are held in writer-local vectors and appended at
//! quiesce, which keeps the on-disk layout contiguous
//! (header | fast | medium | slow | sync) without temp files; at
//! nominal rates the deferred streams amount to ~11 KiB per second.
//!
//! A fatal I/O error raises the shared stop flag so the samplers shut
//! down, and surfaces from `Profiler::close`.

use std::fs::File;
use std::io::{BufWriter, Seek, SeekFrom, Write};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::ring::SampleRing;
use crate::trace::format::{FastSample, MediumSample, SlowSample, SyncPoint, TraceHeader};
use crate::Error;

/// How long the writer naps when every ring is empty.
const IDLE_WAIT: Duration = Duration::from_millis(1);

pub(crate) struct TierRings {
    pub fast: Arc<SampleRing<FastSample>>,
    pub medium: Arc<SampleRing<MediumSample>>,
    pub slow: Arc<SampleRing<SlowSample>>,
    pub sync: Arc<SampleRing<SyncPoint>>,
}

impl TierRings {
    fn all_empty(&self) -> bool {
        self.fast.is_empty()
            && self.medium.is_empty()
            && self.slow.is_empty()
            && self.sync.is_empty()
    }
}

/// Runs until the stop flag is set and every ring has drained, then
/// finalizes the file. Returns the header as written to disk.
pub(crate) fn writer_loop(
    file: File,
    header: TraceHeader,
    rings: TierRings,
    stop: Arc<AtomicBool>,
    fast_written: Arc<AtomicU64>,
) -> Result<TraceHeader, Error> {
    let result = drain_and_finalize(file, header, &rings, &stop, &fast_written);
    if result.is_err() {
        // bring the samplers down with us
        stop.store(true, Ordering::Release);
    }
    result
}

fn drain_and_finalize(
    file: File,
    mut header: TraceHeader,
    rings: &TierRings,
    stop: &AtomicBool,
    fast_written: &AtomicU64,
) -> Result<TraceHeader, Error> {
    let mut out = BufWriter::new(file);
    let mut medium: Vec<MediumSample> = Vec::new();
    let mut slow: Vec<SlowSample> = Vec::new();
    let mut sync: Vec<SyncPoint> = Vec::new();
    let mut n_fast: u64 = 0;

    loop {
        let mut drained = false;
        while let Some(sample) = rings.fast.pop() {
            out.write_all(&sample.encode())?;
            n_fast += 1;
            fast_written.store(n_fast, Ordering::Release);
            drained = true;
        }
        while let Some(sample) = rings.medium.pop() {
            medium.push(sample);
            drained = true;
        }
        while let Some(sample) = rings.slow.pop() {
            slow.push(sample);
            drained = true;
        }
        while let Some(point) = rings.sync.pop() {
            sync.push(point);
            drained = true;
        }
        if !drained {
            if stop.load(Ordering::Acquire) && rings.all_empty() {
                break;
            }
            thread::sleep(IDLE_WAIT);
        }
    }

    // deferred streams, in their on-disk order
    for sample in &medium {
        out.write_all(&sample.encode())?;
    }
    for sample in &slow {
        out.write_all(&sample.encode())?;
    }
    for point in &sync {
        out.write_all(&point.encode())?;
    }
    out.flush()?;

    header.n_fast = n_fast;
    header.n_medium = medium.len() as u64;
    header.n_slow = slow.len() as u64;
    header.n_sync = sync.len() as u64;

    let mut file = out.into_inner().map_err(|e| e.into_error())?;
    file.seek(SeekFrom::Start(0))?;
    file.write_all(&header.encode())?;
    file.sync_all()?;
    Ok(header)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trace::format::{HEADER_SIZE, MAGIC, VERSION};
    use crate::trace::TraceFile;

    fn proto_header() -> TraceHeader {
        TraceHeader {
            magic: MAGIC,
            version: VERSION,
            board_name: "testbench".to_string(),
            num_cpu_cores: 2,
            num_power_rails: 0,
            num_thermal_zones: 0,
            emc_available: false,
            fast_hz: 1000,
            medium_hz: 100,
            slow_hz: 10,
            n_fast: 0,
            n_medium: 0,
            n_slow: 0,
            n_sync: 0,
            power_rail_names: Vec::new(),
            thermal_zone_names: Vec::new(),
        }
    }

    #[test]
    fn drains_prefilled_rings_and_finalizes_counts() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("trace.bin");
        let mut file = File::create(&path).expect("create");
        file.write_all(&[0u8; HEADER_SIZE]).expect("placeholder");

        let rings = TierRings {
            fast: Arc::new(SampleRing::with_capacity(16)),
            medium: Arc::new(SampleRing::with_capacity(16)),
            slow: Arc::new(SampleRing::with_capacity(16)),
            sync: Arc::new(SampleRing::with_capacity(16)),
        };
        for i in 0..4 {
            let mut s = FastSample::default();
            s.time_s = i as f64 * 1e-3;
            s.emc_util = -1.0;
            rings.fast.push(s);
        }
        let mut m = MediumSample::default();
        m.time_s = 0.01;
        rings.medium.push(m);
        rings.sync.push(SyncPoint { sync_id: 1, fast_sample_idx: 2 });

        let stop = Arc::new(AtomicBool::new(true));
        let fast_written = Arc::new(AtomicU64::new(0));
        let header = writer_loop(file, proto_header(), rings, stop, fast_written.clone())
            .expect("writer should finish");

        assert_eq!(header.n_fast, 4);
        assert_eq!(header.n_medium, 1);
        assert_eq!(header.n_slow, 0);
        assert_eq!(header.n_sync, 1);
        assert_eq!(fast_written.load(Ordering::Acquire), 4);

        let trace = TraceFile::open(&path).expect("trace should parse");
        assert_eq!(trace.fast.len(), 4);
        assert_eq!(trace.medium.len(), 1);
        assert_eq!(trace.sync_points.len(), 1);
        assert_eq!(trace.sync_id_per_fast_sample(), vec![0, 0, 1, 1]);
    }
}
