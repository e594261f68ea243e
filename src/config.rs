//! Board description consumed by the profiler.
//!
//! A `BoardConfig` is assembled once (from the pre-baked table in
//! `boards`, or by hand for unusual setups), validated at profiler
//! start, and frozen for the session. Paths point at kernel
//! pseudo-files; the three optional paths disable their feature when
//! `None`.

use std::path::PathBuf;

use crate::trace::format::{BOARD_NAME_SIZE, MAX_CPU_CORES, MAX_POWER_RAILS, MAX_THERMAL_ZONES, NAME_SIZE};
use crate::Error;

/// One INA3221-style power rail: voltage and current as ASCII integers
/// (mV / mA) in separate files.
#[derive(Debug, Clone)]
pub struct PowerRail {
    pub label: String,
    pub voltage_path: PathBuf,
    pub current_path: PathBuf,
}

/// One thermal zone: temperature as ASCII integer millidegrees.
#[derive(Debug, Clone)]
pub struct ThermalZone {
    pub name: String,
    pub temp_path: PathBuf,
}

/// Immutable description of the target hardware.
#[derive(Debug, Clone)]
pub struct BoardConfig {
    pub board_name: String,
    pub num_cpu_cores: usize,
    pub power_rails: Vec<PowerRail>,
    pub thermal_zones: Vec<ThermalZone>,
    /// GPU load file (milliunits 0..=1000); `None` disables GPU sampling.
    pub gpu_load_path: Option<PathBuf>,
    /// Memory-controller activity counter (`mc_all`, debugfs); `None`
    /// disables EMC sampling.
    pub emc_actmon_path: Option<PathBuf>,
    /// EMC clock rate in Hz; required together with `emc_actmon_path`.
    pub emc_clk_rate_path: Option<PathBuf>,
}

impl BoardConfig {
    /// A minimal config with only the always-present `/proc` sources.
    pub fn new<S: Into<String>>(board_name: S, num_cpu_cores: usize) -> BoardConfig {
        BoardConfig {
            board_name: board_name.into(),
            num_cpu_cores,
            power_rails: Vec::new(),
            thermal_zones: Vec::new(),
            gpu_load_path: None,
            emc_actmon_path: None,
            emc_clk_rate_path: None,
        }
    }

    /// Checks the header-imposed limits. Called by the profiler at
    /// start; failing here means no file is created and no thread is
    /// spawned.
    pub fn validate(&self) -> Result<(), Error> {
        if self.board_name.is_empty() || self.board_name.len() >= BOARD_NAME_SIZE {
            return Err(Error::InvalidConfig(format!(
                "board name must be 1..={} bytes, got {}",
                BOARD_NAME_SIZE - 1,
                self.board_name.len()
            )));
        }
        if self.num_cpu_cores == 0 || self.num_cpu_cores > MAX_CPU_CORES {
            return Err(Error::InvalidConfig(format!(
                "num_cpu_cores must be 1..={}, got {}",
                MAX_CPU_CORES, self.num_cpu_cores
            )));
        }
        if self.power_rails.len() > MAX_POWER_RAILS {
            return Err(Error::InvalidConfig(format!(
                "at most {} power rails supported, got {}",
                MAX_POWER_RAILS,
                self.power_rails.len()
            )));
        }
        for rail in &self.power_rails {
            if rail.label.is_empty() || rail.label.len() >= NAME_SIZE {
                return Err(Error::InvalidConfig(format!(
                    "rail label {:?} must be 1..={} bytes",
                    rail.label,
                    NAME_SIZE - 1
                )));
            }
        }
        if self.thermal_zones.len() > MAX_THERMAL_ZONES {
            return Err(Error::InvalidConfig(format!(
                "at most {} thermal zones supported, got {}",
                MAX_THERMAL_ZONES,
                self.thermal_zones.len()
            )));
        }
        for zone in &self.thermal_zones {
            if zone.name.is_empty() || zone.name.len() >= NAME_SIZE {
                return Err(Error::InvalidConfig(format!(
                    "zone name {:?} must be 1..={} bytes",
                    zone.name,
                    NAME_SIZE - 1
                )));
            }
        }
        if self.emc_actmon_path.is_some() != self.emc_clk_rate_path.is_some() {
            return Err(Error::InvalidConfig(
                "emc_actmon_path and emc_clk_rate_path must be set together".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_config_validates() {
        BoardConfig::new("testbench", 4).validate().expect("valid");
    }

    #[test]
    fn rejects_zero_and_excess_cores() {
        assert!(BoardConfig::new("t", 0).validate().is_err());
        assert!(BoardConfig::new("t", 17).validate().is_err());
        assert!(BoardConfig::new("t", 16).validate().is_ok());
    }

    #[test]
    fn rejects_long_board_name() {
        let name = "x".repeat(32);
        assert!(BoardConfig::new(name, 4).validate().is_err());
        assert!(BoardConfig::new("x".repeat(31), 4).validate().is_ok());
    }

    #[test]
    fn rejects_too_many_rails() {
        let mut cfg = BoardConfig::new("t", 4);
        for i in 0..9 {
            cfg.power_rails.push(PowerRail {
                label: format!("RAIL{}", i),
                voltage_path: PathBuf::from("/dev/null"),
                current_path: PathBuf::from("/dev/null"),
            });
        }
        assert!(cfg.validate().is_err());
        cfg.power_rails.truncate(8);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn rejects_long_rail_label() {
        let mut cfg = BoardConfig::new("t", 4);
        cfg.power_rails.push(PowerRail {
            label: "R".repeat(24),
            voltage_path: PathBuf::from("/dev/null"),
            current_path: PathBuf::from("/dev/null"),
        });
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_half_configured_emc() {
        let mut cfg = BoardConfig::new("t", 4);
        cfg.emc_actmon_path = Some(PathBuf::from("/sys/kernel/debug/cactmon/mc_all"));
        assert!(cfg.validate().is_err());
        cfg.emc_clk_rate_path = Some(PathBuf::from("/sys/kernel/debug/bpmp/debug/clk/emc/rate"));
        assert!(cfg.validate().is_ok());
    }
}
