//! Pre-baked board descriptions for the supported Jetson Orin modules
//! and detection of the running board.
//!
//! Boards outside this table are not supported; `detect` refuses to
//! guess. The INA3221 hwmon index is assigned at boot, so rail paths
//! are resolved through the driver's `hwmon/` directory rather than
//! hardcoded.

use std::fs;
use std::path::{Path, PathBuf};

use log::{debug, warn};

use crate::config::{BoardConfig, PowerRail, ThermalZone};
use crate::Error;

const DEVICE_TREE_MODEL: &str = "/proc/device-tree/model";
const THERMAL_ROOT: &str = "/sys/devices/virtual/thermal";
const GPU_LOAD: &str = "/sys/devices/platform/17000000.gpu/load";
const EMC_ACTMON: &str = "/sys/kernel/debug/cactmon/mc_all";
const EMC_CLK_RATE: &str = "/sys/kernel/debug/bpmp/debug/clk/emc/rate";

/// Resolves `inN_input`/`currN_input` under an INA3221 device, going
/// through the boot-assigned `hwmon/hwmonX` directory.
fn ina3221_path(i2c_dev: &str, file: &str) -> PathBuf {
    let hwmon_dir = PathBuf::from(format!("/sys/bus/i2c/drivers/ina3221/{}/hwmon", i2c_dev));
    let hwmon = fs::read_dir(&hwmon_dir)
        .ok()
        .and_then(|mut entries| entries.next())
        .and_then(|entry| entry.ok())
        .map(|entry| entry.path())
        .unwrap_or_else(|| hwmon_dir.join("hwmon0"));
    hwmon.join(file)
}

fn rail(label: &str, i2c_dev: &str, channel: u8) -> PowerRail {
    PowerRail {
        label: label.to_string(),
        voltage_path: ina3221_path(i2c_dev, &format!("in{}_input", channel)),
        current_path: ina3221_path(i2c_dev, &format!("curr{}_input", channel)),
    }
}

fn zone(name: &str, index: usize) -> ThermalZone {
    ThermalZone {
        name: name.to_string(),
        temp_path: PathBuf::from(format!("{}/thermal_zone{}/temp", THERMAL_ROOT, index)),
    }
}

/// Returns the pre-baked config for a board by table name.
///
/// Known names: `agx_orin`, `orin_nx` (also used for the Orin Nano,
/// which shares the carrier layout).
pub fn board_config(name: &str) -> Result<BoardConfig, Error> {
    match name {
        "agx_orin" => Ok(BoardConfig {
            board_name: "agx_orin".to_string(),
            num_cpu_cores: 12,
            power_rails: vec![
                rail("VDD_GPU_SOC", "1-0040", 1),
                rail("VDD_CPU_CV", "1-0040", 2),
                rail("VIN_SYS_5V0", "1-0040", 3),
                rail("VDDQ_VDD2_1V8AO", "1-0041", 2),
            ],
            thermal_zones: vec![
                zone("cpu-thermal", 0),
                zone("gpu-thermal", 1),
                zone("cv0-thermal", 2),
                zone("cv1-thermal", 3),
                zone("cv2-thermal", 4),
                zone("soc0-thermal", 5),
                zone("soc1-thermal", 6),
                zone("soc2-thermal", 7),
                zone("tj-thermal", 8),
                zone("tboard-thermal", 9),
                zone("tdiode-thermal", 10),
            ],
            gpu_load_path: Some(PathBuf::from(GPU_LOAD)),
            emc_actmon_path: Some(PathBuf::from(EMC_ACTMON)),
            emc_clk_rate_path: Some(PathBuf::from(EMC_CLK_RATE)),
        }),
        "orin_nx" => Ok(BoardConfig {
            board_name: "orin_nx".to_string(),
            num_cpu_cores: 8,
            power_rails: vec![
                rail("VDD_IN", "1-0040", 1),
                rail("VDD_CPU_GPU_CV", "1-0040", 2),
                rail("VDD_SOC", "1-0040", 3),
            ],
            thermal_zones: vec![
                zone("cpu-thermal", 0),
                zone("gpu-thermal", 1),
                zone("cv0-thermal", 2),
                zone("cv1-thermal", 3),
                zone("cv2-thermal", 4),
                zone("soc0-thermal", 5),
                zone("soc1-thermal", 6),
                zone("soc2-thermal", 7),
                zone("tj-thermal", 8),
                zone("tdiode-thermal", 9),
            ],
            gpu_load_path: Some(PathBuf::from(GPU_LOAD)),
            emc_actmon_path: Some(PathBuf::from(EMC_ACTMON)),
            emc_clk_rate_path: Some(PathBuf::from(EMC_CLK_RATE)),
        }),
        other => Err(Error::UnknownBoard(other.to_string())),
    }
}

/// Maps a device-tree model string to a table name.
fn table_name_for_model(model: &str) -> Option<&'static str> {
    if model.contains("AGX Orin") {
        Some("agx_orin")
    } else if model.contains("Orin NX") || model.contains("Orin Nano") {
        Some("orin_nx")
    } else {
        None
    }
}

/// Detects the running board from `/proc/device-tree/model` and returns
/// its pre-baked config with unreachable paths pruned.
pub fn detect() -> Result<BoardConfig, Error> {
    let raw = fs::read(DEVICE_TREE_MODEL)?;
    // device-tree strings carry a trailing NUL
    let model = String::from_utf8_lossy(&raw)
        .trim_end_matches('\0')
        .trim()
        .to_string();
    let name =
        table_name_for_model(&model).ok_or_else(|| Error::UnknownBoard(model.clone()))?;
    debug!("detected {:?} as board table entry {}", model, name);
    let mut config = board_config(name)?;
    prune_missing_paths(&mut config);
    Ok(config)
}

/// Drops rails and zones whose files do not exist and clears missing
/// optional paths, so the corresponding features disable cleanly
/// instead of soft-failing every sample.
pub fn prune_missing_paths(config: &mut BoardConfig) {
    config.power_rails.retain(|rail| {
        let ok = rail.voltage_path.exists() && rail.current_path.exists();
        if !ok {
            warn!("power rail {} not present, dropping", rail.label);
        }
        ok
    });
    config.thermal_zones.retain(|zone| {
        let ok = zone.temp_path.exists();
        if !ok {
            warn!("thermal zone {} not present, dropping", zone.name);
        }
        ok
    });
    clear_if_missing(&mut config.gpu_load_path, "gpu load");
    // Both EMC paths are needed; losing either disables the feature.
    let emc_ok = path_exists(&config.emc_actmon_path) && path_exists(&config.emc_clk_rate_path);
    if !emc_ok && (config.emc_actmon_path.is_some() || config.emc_clk_rate_path.is_some()) {
        warn!("EMC paths not accessible, disabling EMC sampling");
        config.emc_actmon_path = None;
        config.emc_clk_rate_path = None;
    }
}

fn path_exists(path: &Option<PathBuf>) -> bool {
    path.as_deref().map_or(false, Path::exists)
}

fn clear_if_missing(path: &mut Option<PathBuf>, what: &str) {
    if let Some(p) = path.as_deref() {
        if !p.exists() {
            warn!("{} file {} not present, disabling", what, p.display());
            *path = None;
        }
    }
}
