//! Uses the `nom` library to parse the binary trace format back into
//! the structures of format.rs.
//!
//! Every parser here is the exact mirror of an `encode()` method in
//! format.rs; the two must stay byte-for-byte in agreement. All fields
//! are little-endian at fixed offsets, so these are plain sequential
//! combinators with no length-prefixed sections.
//!
//! # See also
//!   * `mod.rs` -- `TraceFile`, which applies these parsers to a whole file
//!   * `format.rs` -- the struct definitions that are parsed here

use super::format::*;
use nom::*;

/// Decodes a null-padded name cell, dropping everything from the first
/// null byte on.
fn trimmed_string(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

named!(pub parse_header<&[u8], TraceHeader>,
    do_parse!(
        magic: le_u32 >>
        version: le_u32 >>
        board_name: take!(32) >>
        num_cpu_cores: le_u8 >>
        num_power_rails: le_u8 >>
        num_thermal_zones: le_u8 >>
        emc_available: le_u8 >>
        fast_hz: le_u32 >>
        medium_hz: le_u32 >>
        slow_hz: le_u32 >>
        n_fast: le_u64 >>
        n_medium: le_u64 >>
        n_slow: le_u64 >>
        n_sync: le_u64 >>
        rail_names: count!(map!(take!(24), trimmed_string), 8) >>
        zone_names: count!(map!(take!(24), trimmed_string), 16) >>
        take!(64) >> // reserved
        (TraceHeader {
            magic: magic,
            version: version,
            board_name: trimmed_string(board_name),
            num_cpu_cores: num_cpu_cores,
            num_power_rails: num_power_rails,
            num_thermal_zones: num_thermal_zones,
            emc_available: emc_available != 0,
            fast_hz: fast_hz,
            medium_hz: medium_hz,
            slow_hz: slow_hz,
            n_fast: n_fast,
            n_medium: n_medium,
            n_slow: n_slow,
            n_sync: n_sync,
            power_rail_names: rail_names.into_iter().take(num_power_rails as usize).collect(),
            thermal_zone_names: zone_names.into_iter().take(num_thermal_zones as usize).collect(),
        })
    )
);

named!(pub parse_fast_sample<&[u8], FastSample>,
    do_parse!(
        time_s: le_f64 >>
        gpu_load: le_u16 >>
        cpu_util: count_fixed!(f32, le_f32, 16) >>
        cpu_aggregate: le_f32 >>
        ram_used_kb: le_u64 >>
        ram_available_kb: le_u64 >>
        emc_util: le_f32 >>
        (FastSample {
            time_s: time_s,
            gpu_load: gpu_load,
            cpu_util: cpu_util,
            cpu_aggregate: cpu_aggregate,
            ram_used_kb: ram_used_kb,
            ram_available_kb: ram_available_kb,
            emc_util: emc_util,
        })
    )
);

named!(pub parse_medium_sample<&[u8], MediumSample>,
    do_parse!(
        time_s: le_f64 >>
        voltage_mv: count_fixed!(u32, le_u32, 8) >>
        current_ma: count_fixed!(u32, le_u32, 8) >>
        power_mw: count_fixed!(f32, le_f32, 8) >>
        (MediumSample {
            time_s: time_s,
            voltage_mv: voltage_mv,
            current_ma: current_ma,
            power_mw: power_mw,
        })
    )
);

named!(pub parse_slow_sample<&[u8], SlowSample>,
    do_parse!(
        time_s: le_f64 >>
        temp_c: count_fixed!(f32, le_f32, 16) >>
        (SlowSample { time_s: time_s, temp_c: temp_c })
    )
);

named!(pub parse_sync_point<&[u8], SyncPoint>,
    do_parse!(
        sync_id: le_u64 >>
        fast_sample_idx: le_u64 >>
        (SyncPoint { sync_id: sync_id, fast_sample_idx: fast_sample_idx })
    )
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trip() {
        let header = TraceHeader {
            magic: MAGIC,
            version: VERSION,
            board_name: "orin_nx".to_string(),
            num_cpu_cores: 8,
            num_power_rails: 3,
            num_thermal_zones: 2,
            emc_available: false,
            fast_hz: 500,
            medium_hz: 50,
            slow_hz: 5,
            n_fast: 123,
            n_medium: 45,
            n_slow: 6,
            n_sync: 7,
            power_rail_names: vec![
                "VDD_IN".to_string(),
                "VDD_CPU_GPU_CV".to_string(),
                "VDD_SOC".to_string(),
            ],
            thermal_zone_names: vec!["cpu-thermal".to_string(), "gpu-thermal".to_string()],
        };
        let buf = header.encode();
        let (rest, parsed) = parse_header(&buf).expect("header should parse");
        assert!(rest.is_empty());
        assert_eq!(parsed.magic, MAGIC);
        assert_eq!(parsed.version, VERSION);
        assert_eq!(parsed.board_name, "orin_nx");
        assert_eq!(parsed.num_cpu_cores, 8);
        assert_eq!(parsed.emc_available, false);
        assert_eq!(parsed.fast_hz, 500);
        assert_eq!(parsed.n_fast, 123);
        assert_eq!(parsed.n_sync, 7);
        assert_eq!(parsed.power_rail_names, header.power_rail_names);
        assert_eq!(parsed.thermal_zone_names, header.thermal_zone_names);
    }

    #[test]
    fn fast_sample_round_trip() {
        let mut sample = FastSample::default();
        sample.time_s = 0.125;
        sample.gpu_load = 1000;
        sample.cpu_util[3] = 42.5;
        sample.cpu_aggregate = 17.0;
        sample.ram_used_kb = 1_234_567;
        sample.ram_available_kb = 7_654_321;
        sample.emc_util = 3.75;
        let buf = sample.encode();
        let (rest, parsed) = parse_fast_sample(&buf).expect("sample should parse");
        assert!(rest.is_empty());
        assert_eq!(parsed.time_s, 0.125);
        assert_eq!(parsed.gpu_load, 1000);
        assert_eq!(parsed.cpu_util[3], 42.5);
        assert_eq!(parsed.cpu_util[4], 0.0);
        assert_eq!(parsed.ram_used_kb, 1_234_567);
        assert_eq!(parsed.emc_util, 3.75);
    }

    #[test]
    fn medium_and_slow_round_trip() {
        let mut m = MediumSample::default();
        m.time_s = 0.01;
        m.voltage_mv[0] = 5012;
        m.current_ma[0] = 1250;
        m.power_mw[0] = 6265.0;
        let buf = m.encode();
        let (_, parsed) = parse_medium_sample(&buf).expect("medium should parse");
        assert_eq!(parsed.voltage_mv[0], 5012);
        assert_eq!(parsed.current_ma[0], 1250);
        assert_eq!(parsed.power_mw[0], 6265.0);

        let mut s = SlowSample::default();
        s.time_s = 0.1;
        s.temp_c[1] = 48.5;
        let buf = s.encode();
        let (_, parsed) = parse_slow_sample(&buf).expect("slow should parse");
        assert_eq!(parsed.temp_c[1], 48.5);
        assert_eq!(parsed.temp_c[0], 0.0);
    }

    #[test]
    fn sync_point_round_trip() {
        let sp = SyncPoint { sync_id: 3, fast_sample_idx: 1717 };
        let (_, parsed) = parse_sync_point(&sp.encode()).expect("sync point should parse");
        assert_eq!(parsed, sp);
    }
}
