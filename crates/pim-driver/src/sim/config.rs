//! Geometry of the simulated pool and allocation profile parsing

use std::env;

use serde::{Deserialize, Serialize};

use super::memory::{IRAM_BASE, MRAM_BASE};
use crate::error::{DriverError, Result};

/// Environment variable overriding [`SimConfig::ranks`].
pub const ENV_RANKS: &str = "PIM_SIM_RANKS";
/// Environment variable overriding [`SimConfig::units_per_rank`].
pub const ENV_UNITS_PER_RANK: &str = "PIM_SIM_UNITS_PER_RANK";
/// Environment variable overriding [`SimConfig::mram_size`].
pub const ENV_MRAM_SIZE: &str = "PIM_SIM_MRAM_SIZE";
/// Environment variable overriding [`SimConfig::wram_words`].
pub const ENV_WRAM_WORDS: &str = "PIM_SIM_WRAM_WORDS";

/// Shape of the simulated pool
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimConfig {
    pub ranks: u32,
    pub units_per_rank: u32,
    /// Hardware threads per unit
    pub nr_threads: u32,
    /// Work registers per thread
    pub nr_registers: u32,
    pub nr_atomic_bits: u32,
    /// IRAM capacity in 64-bit instructions
    pub iram_instructions: u32,
    /// MRAM capacity in bytes
    pub mram_size: u32,
    /// WRAM capacity in 32-bit words
    pub wram_words: u32,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            ranks: 2,
            units_per_rank: 8,
            nr_threads: 24,
            nr_registers: 24,
            nr_atomic_bits: 256,
            iram_instructions: 4096,
            mram_size: 1 << 20,
            wram_words: 16 * 1024,
        }
    }
}

impl SimConfig {
    /// A pool with small memories, for tests and examples.
    pub fn small(ranks: u32, units_per_rank: u32) -> Self {
        Self {
            ranks,
            units_per_rank,
            nr_threads: 4,
            nr_registers: 8,
            nr_atomic_bits: 32,
            iram_instructions: 64,
            mram_size: 64 * 1024,
            wram_words: 1024,
        }
    }

    pub fn total_units(&self) -> u32 {
        self.ranks * self.units_per_rank
    }

    /// Parse a JSON document; missing fields take their default value.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self =
            serde_json::from_str(json).map_err(|err| DriverError::InvalidProfile(format!("invalid config: {err}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Default configuration with `PIM_SIM_*` overrides applied.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        for (key, field) in [
            (ENV_RANKS, &mut config.ranks),
            (ENV_UNITS_PER_RANK, &mut config.units_per_rank),
            (ENV_MRAM_SIZE, &mut config.mram_size),
            (ENV_WRAM_WORDS, &mut config.wram_words),
        ] {
            if let Ok(value) = env::var(key) {
                *field = value
                    .trim()
                    .parse()
                    .map_err(|_| DriverError::InvalidProfile(format!("{key}: `{value}` is not a number")))?;
            }
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: &str| Err(DriverError::InvalidProfile(msg.to_string()));
        if self.ranks == 0 || self.units_per_rank == 0 {
            return invalid("the pool needs at least one rank and one unit per rank");
        }
        if self.nr_threads == 0 || self.nr_threads > u8::MAX as u32 {
            return invalid("thread count must be between 1 and 255");
        }
        if self.nr_registers == 0 {
            return invalid("threads need at least one register");
        }
        if u64::from(self.wram_words) * 4 > u64::from(MRAM_BASE) {
            return invalid("WRAM overlaps the MRAM window");
        }
        if u64::from(self.mram_size) > u64::from(IRAM_BASE - MRAM_BASE) {
            return invalid("MRAM overlaps the IRAM window");
        }
        Ok(())
    }
}

/// Check an allocation profile (`key=value` pairs separated by commas).
///
/// Only `backend=simulator` is understood.
pub fn check_profile(profile: &str) -> Result<()> {
    for entry in profile.split(',').map(str::trim).filter(|entry| !entry.is_empty()) {
        let (key, value) = entry
            .split_once('=')
            .ok_or_else(|| DriverError::InvalidProfile(format!("expected key=value, got `{entry}`")))?;
        match (key.trim(), value.trim()) {
            ("backend", "simulator") => {}
            ("backend", other) => {
                return Err(DriverError::InvalidProfile(format!("unsupported backend `{other}`")));
            }
            (other, _) => return Err(DriverError::InvalidProfile(format!("unknown profile key `{other}`"))),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn accepts_empty_and_simulator_profiles() {
        assert!(check_profile("").is_ok());
        assert!(check_profile("backend=simulator").is_ok());
        assert!(check_profile(" backend = simulator , ").is_ok());
    }

    #[test]
    fn rejects_unknown_profiles() {
        assert!(matches!(check_profile("backend=hw"), Err(DriverError::InvalidProfile(_))));
        assert!(matches!(check_profile("cycleAccurate=true"), Err(DriverError::InvalidProfile(_))));
        assert!(matches!(check_profile("simulator"), Err(DriverError::InvalidProfile(_))));
    }

    #[test]
    fn json_fills_missing_fields_with_defaults() {
        let config = SimConfig::from_json(r#"{ "ranks": 3, "mram_size": 4096 }"#).unwrap();
        assert_eq!(config.ranks, 3);
        assert_eq!(config.mram_size, 4096);
        assert_eq!(config.units_per_rank, SimConfig::default().units_per_rank);
    }

    #[test]
    fn json_rejects_empty_pool() {
        assert!(SimConfig::from_json(r#"{ "ranks": 0 }"#).is_err());
        assert!(SimConfig::from_json("not json").is_err());
    }

    #[test]
    #[serial]
    fn env_overrides_apply() {
        env::set_var(ENV_RANKS, "5");
        env::set_var(ENV_UNITS_PER_RANK, "2");
        let config = SimConfig::from_env();
        env::remove_var(ENV_RANKS);
        env::remove_var(ENV_UNITS_PER_RANK);

        let config = config.unwrap();
        assert_eq!(config.ranks, 5);
        assert_eq!(config.total_units(), 10);
    }

    #[test]
    #[serial]
    fn env_rejects_garbage() {
        env::set_var(ENV_MRAM_SIZE, "lots");
        let result = SimConfig::from_env();
        env::remove_var(ENV_MRAM_SIZE);
        assert!(matches!(result, Err(DriverError::InvalidProfile(_))));
    }
}
