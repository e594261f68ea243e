//! High-level abstractions for a trace file.
//!
//! `TraceFile` owns the raw bytes of a recorded trace and exposes the
//! parsed header plus the four typed record streams. Layout on disk:
//!
//! ```text
//! header (728 B) | fast records | medium records | slow records | sync records
//! ```
//!
//! The record counts in the header are authoritative; a file whose
//! byte length cannot hold them is rejected as truncated.

use std::fs;
use std::path::Path;

use nom::IResult;

use crate::Error;

pub mod format;
pub mod parser;

pub use self::format::{
    FastSample, MediumSample, SlowSample, SyncPoint, TraceHeader, FAST_SAMPLE_SIZE, HEADER_SIZE,
    MAGIC, MAX_CPU_CORES, MAX_POWER_RAILS, MAX_THERMAL_ZONES, MEDIUM_SAMPLE_SIZE,
    SLOW_SAMPLE_SIZE, SYNC_POINT_SIZE, VERSION,
};

/// A fully parsed trace file.
#[derive(Debug)]
pub struct TraceFile {
    pub header: TraceHeader,
    pub fast: Vec<FastSample>,
    pub medium: Vec<MediumSample>,
    pub slow: Vec<SlowSample>,
    pub sync_points: Vec<SyncPoint>,
}

fn parse_stream<T, F>(
    bytes: &[u8],
    count: u64,
    size: usize,
    what: &'static str,
    parse: F,
) -> Result<Vec<T>, Error>
where
    F: Fn(&[u8]) -> IResult<&[u8], T>,
{
    let mut records = Vec::with_capacity(count as usize);
    for chunk in bytes.chunks(size).take(count as usize) {
        match parse(chunk) {
            Ok((_, record)) => records.push(record),
            Err(_) => return Err(Error::Truncated(what)),
        }
    }
    Ok(records)
}

impl TraceFile {
    /// Reads and parses a trace file from disk.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<TraceFile, Error> {
        TraceFile::new(fs::read(path)?)
    }

    /// Parses a trace from its raw bytes.
    pub fn new(bytes: Vec<u8>) -> Result<TraceFile, Error> {
        if bytes.len() < HEADER_SIZE {
            return Err(Error::FileTooSmall(bytes.len()));
        }
        let header = match parser::parse_header(&bytes[..HEADER_SIZE]) {
            Ok((_, header)) => header,
            Err(_) => return Err(Error::Truncated("header")),
        };
        if header.magic != MAGIC {
            return Err(Error::BadMagic(header.magic));
        }
        if header.version != VERSION {
            return Err(Error::UnsupportedVersion(header.version));
        }

        let fast_bytes = header.n_fast as usize * FAST_SAMPLE_SIZE;
        let medium_bytes = header.n_medium as usize * MEDIUM_SAMPLE_SIZE;
        let slow_bytes = header.n_slow as usize * SLOW_SAMPLE_SIZE;
        let sync_bytes = header.n_sync as usize * SYNC_POINT_SIZE;
        let expected = HEADER_SIZE + fast_bytes + medium_bytes + slow_bytes + sync_bytes;
        if bytes.len() < expected {
            return Err(Error::Truncated("record streams"));
        }

        let mut offset = HEADER_SIZE;
        let fast = parse_stream(
            &bytes[offset..],
            header.n_fast,
            FAST_SAMPLE_SIZE,
            "fast stream",
            parser::parse_fast_sample,
        )?;
        offset += fast_bytes;
        let medium = parse_stream(
            &bytes[offset..],
            header.n_medium,
            MEDIUM_SAMPLE_SIZE,
            "medium stream",
            parser::parse_medium_sample,
        )?;
        offset += medium_bytes;
        let slow = parse_stream(
            &bytes[offset..],
            header.n_slow,
            SLOW_SAMPLE_SIZE,
            "slow stream",
            parser::parse_slow_sample,
        )?;
        offset += slow_bytes;
        let sync_points = parse_stream(
            &bytes[offset..],
            header.n_sync,
            SYNC_POINT_SIZE,
            "sync stream",
            parser::parse_sync_point,
        )?;

        Ok(TraceFile {
            header,
            fast,
            medium,
            slow,
            sync_points,
        })
    }

    /// Forward-fills the sparse sync stream into one `sync_id` per fast
    /// sample. Samples before the first marker get 0; a marker issued
    /// after the last fast sample affects nothing.
    pub fn sync_id_per_fast_sample(&self) -> Vec<u64> {
        let mut ids = vec![0u64; self.fast.len()];
        for sp in &self.sync_points {
            let idx = sp.fast_sample_idx as usize;
            if idx < ids.len() {
                for id in &mut ids[idx..] {
                    *id = sp.sync_id;
                }
            }
        }
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn trace_bytes(n_fast: u64, sync_points: &[SyncPoint]) -> Vec<u8> {
        let header = TraceHeader {
            magic: MAGIC,
            version: VERSION,
            board_name: "testbench".to_string(),
            num_cpu_cores: 4,
            num_power_rails: 0,
            num_thermal_zones: 0,
            emc_available: false,
            fast_hz: 1000,
            medium_hz: 100,
            slow_hz: 10,
            n_fast,
            n_medium: 0,
            n_slow: 0,
            n_sync: sync_points.len() as u64,
            power_rail_names: Vec::new(),
            thermal_zone_names: Vec::new(),
        };
        let mut bytes = header.encode().to_vec();
        for i in 0..n_fast {
            let mut s = FastSample::default();
            s.time_s = i as f64 * 1e-3;
            s.emc_util = -1.0;
            bytes.extend_from_slice(&s.encode());
        }
        for sp in sync_points {
            bytes.extend_from_slice(&sp.encode());
        }
        bytes
    }

    #[test]
    fn parses_streams_to_header_counts() {
        let bytes = trace_bytes(5, &[SyncPoint { sync_id: 1, fast_sample_idx: 2 }]);
        let trace = TraceFile::new(bytes).expect("trace should parse");
        assert_eq!(trace.fast.len(), 5);
        assert_eq!(trace.medium.len(), 0);
        assert_eq!(trace.slow.len(), 0);
        assert_eq!(trace.sync_points.len(), 1);
    }

    #[test]
    fn rejects_too_small() {
        match TraceFile::new(vec![0u8; 10]) {
            Err(Error::FileTooSmall(10)) => {}
            other => panic!("expected FileTooSmall, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn rejects_bad_magic() {
        match TraceFile::new(vec![0u8; HEADER_SIZE]) {
            Err(Error::BadMagic(0)) => {}
            other => panic!("expected BadMagic, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn rejects_unsupported_version() {
        let mut bytes = vec![0u8; HEADER_SIZE];
        bytes[0..4].copy_from_slice(&MAGIC.to_le_bytes());
        bytes[4..8].copy_from_slice(&99u32.to_le_bytes());
        match TraceFile::new(bytes) {
            Err(Error::UnsupportedVersion(99)) => {}
            other => panic!("expected UnsupportedVersion, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn rejects_truncated_streams() {
        let mut bytes = trace_bytes(5, &[]);
        bytes.truncate(HEADER_SIZE + 2 * FAST_SAMPLE_SIZE);
        match TraceFile::new(bytes) {
            Err(Error::Truncated(_)) => {}
            other => panic!("expected Truncated, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn forward_fill_is_non_decreasing_and_complete() {
        let bytes = trace_bytes(
            6,
            &[
                SyncPoint { sync_id: 1, fast_sample_idx: 2 },
                SyncPoint { sync_id: 2, fast_sample_idx: 4 },
            ],
        );
        let trace = TraceFile::new(bytes).unwrap();
        assert_eq!(trace.sync_id_per_fast_sample(), vec![0, 0, 1, 1, 2, 2]);
    }

    #[test]
    fn forward_fill_ignores_marker_past_last_sample() {
        let bytes = trace_bytes(3, &[SyncPoint { sync_id: 1, fast_sample_idx: 3 }]);
        let trace = TraceFile::new(bytes).unwrap();
        assert_eq!(trace.sync_id_per_fast_sample(), vec![0, 0, 0]);
    }
}
