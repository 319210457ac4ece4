use std::time::Duration;

use serde::Deserialize;

use crate::plan::{CommissionPlan, MAX_COMMISSION_LEVEL};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub server_port: u16,
    pub database_url: String,
    /// Maximum cache age before a forced re-fetch, in seconds.
    #[serde(default = "default_staleness_secs")]
    pub staleness_secs: u64,
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
    #[serde(default = "default_fetch_timeout_secs")]
    pub fetch_timeout_secs: u64,
    /// Minimum balance an affiliate must keep un-withdrawn.
    #[serde(default)]
    pub minimum_retention_floor: i64,
    /// Commission rate per level in basis points, level 1 first.
    #[serde(default = "default_commission_rates_bps")]
    pub commission_rates_bps: Vec<u32>,
}

fn default_staleness_secs() -> u64 {
    300
}

fn default_debounce_ms() -> u64 {
    500
}

fn default_fetch_timeout_secs() -> u64 {
    10
}

fn default_commission_rates_bps() -> Vec<u32> {
    vec![1000, 500, 300, 200, 100, 100, 50, 50, 25, 25]
}

impl Config {
    pub fn from_env() -> Result<Self, config::ConfigError> {
        let config = config::Config::builder()
            .add_source(
                config::Environment::default()
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("commission_rates_bps"),
            )
            .build()?;
        let config: Config = config.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), config::ConfigError> {
        if self.staleness_secs == 0 {
            return Err(config::ConfigError::Message(
                "staleness_secs must be greater than 0".into(),
            ));
        }
        if self.fetch_timeout_secs == 0 {
            return Err(config::ConfigError::Message(
                "fetch_timeout_secs must be greater than 0".into(),
            ));
        }
        if self.minimum_retention_floor < 0 {
            return Err(config::ConfigError::Message(
                "minimum_retention_floor must be >= 0".into(),
            ));
        }
        if self.commission_rates_bps.len() > MAX_COMMISSION_LEVEL as usize {
            return Err(config::ConfigError::Message(format!(
                "at most {} commission levels are supported",
                MAX_COMMISSION_LEVEL
            )));
        }
        Ok(())
    }

    pub fn engine_settings(&self) -> EngineSettings {
        EngineSettings {
            staleness: Duration::from_secs(self.staleness_secs),
            debounce: Duration::from_millis(self.debounce_ms),
            fetch_timeout: Duration::from_secs(self.fetch_timeout_secs),
            minimum_retention_floor: self.minimum_retention_floor,
        }
    }

    pub fn commission_plan(&self) -> CommissionPlan {
        CommissionPlan::new(self.commission_rates_bps.clone())
    }
}

/// Runtime knobs shared by the approval and withdrawal engines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineSettings {
    pub staleness: Duration,
    pub debounce: Duration,
    pub fetch_timeout: Duration,
    pub minimum_retention_floor: i64,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            staleness: Duration::from_secs(default_staleness_secs()),
            debounce: Duration::from_millis(default_debounce_ms()),
            fetch_timeout: Duration::from_secs(default_fetch_timeout_secs()),
            minimum_retention_floor: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Config {
        Config {
            server_port: 8000,
            database_url: "postgres://localhost/affiliates".into(),
            staleness_secs: default_staleness_secs(),
            debounce_ms: default_debounce_ms(),
            fetch_timeout_secs: default_fetch_timeout_secs(),
            minimum_retention_floor: 20_000,
            commission_rates_bps: default_commission_rates_bps(),
        }
    }

    #[test]
    fn defaults_validate() {
        assert!(sample().validate().is_ok());
        assert_eq!(default_commission_rates_bps().len(), 10);
    }

    #[test]
    fn rejects_negative_floor_and_extra_levels() {
        let mut config = sample();
        config.minimum_retention_floor = -1;
        assert!(config.validate().is_err());

        let mut config = sample();
        config.commission_rates_bps = vec![100; 11];
        assert!(config.validate().is_err());
    }

    #[test]
    fn engine_settings_carry_config_values() {
        let settings = sample().engine_settings();
        assert_eq!(settings.staleness, Duration::from_secs(300));
        assert_eq!(settings.debounce, Duration::from_millis(500));
        assert_eq!(settings.fetch_timeout, Duration::from_secs(10));
        assert_eq!(settings.minimum_retention_floor, 20_000);
        assert_eq!(EngineSettings::default().minimum_retention_floor, 0);
    }
}
