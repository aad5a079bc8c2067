// ABOUTME: Control plane configuration loaded from LITEBOXD_* environment variables
// ABOUTME: Supplies reconcile timing, fix deadlines and prepull limits with sensible defaults

use crate::drift::DetectorSettings;
use std::env;
use std::num::ParseIntError;
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_DATABASE_URL: &str = "sqlite://liteboxd.db";
pub const DEFAULT_RECONCILE_INTERVAL_SECS: u64 = 30;
pub const DEFAULT_CREATION_GRACE_SECS: u64 = 600;
pub const DEFAULT_STALE_THRESHOLD_SECS: u64 = 60;
pub const DEFAULT_FIX_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_FIX_CONCURRENCY: usize = 4;
pub const DEFAULT_PREPULL_TIMEOUT_SECS: u64 = 600;
pub const DEFAULT_PREPULL_SWEEP_SECS: u64 = 15;
pub const DEFAULT_PREPULL_NODES: u64 = 1;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid value for {name}: {source}")]
    InvalidNumber {
        name: &'static str,
        #[source]
        source: ParseIntError,
    },
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ControlConfig {
    pub database_url: String,
    pub reconcile_interval: Duration,
    pub creation_grace: Duration,
    pub stale_threshold: Duration,
    pub fix_timeout: Duration,
    pub fix_concurrency: usize,
    pub prepull_timeout: Duration,
    pub prepull_sweep_interval: Duration,
    /// Nodes a template's auto-prepull task must reach
    pub prepull_nodes: i64,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            database_url: DEFAULT_DATABASE_URL.to_string(),
            reconcile_interval: Duration::from_secs(DEFAULT_RECONCILE_INTERVAL_SECS),
            creation_grace: Duration::from_secs(DEFAULT_CREATION_GRACE_SECS),
            stale_threshold: Duration::from_secs(DEFAULT_STALE_THRESHOLD_SECS),
            fix_timeout: Duration::from_secs(DEFAULT_FIX_TIMEOUT_SECS),
            fix_concurrency: DEFAULT_FIX_CONCURRENCY,
            prepull_timeout: Duration::from_secs(DEFAULT_PREPULL_TIMEOUT_SECS),
            prepull_sweep_interval: Duration::from_secs(DEFAULT_PREPULL_SWEEP_SECS),
            prepull_nodes: DEFAULT_PREPULL_NODES as i64,
        }
    }
}

impl ControlConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url =
            env::var("LITEBOXD_DATABASE_URL").unwrap_or_else(|_| DEFAULT_DATABASE_URL.to_string());

        Ok(Self {
            database_url,
            reconcile_interval: secs_var(
                "LITEBOXD_RECONCILE_INTERVAL_SECS",
                DEFAULT_RECONCILE_INTERVAL_SECS,
            )?,
            creation_grace: secs_var("LITEBOXD_CREATION_GRACE_SECS", DEFAULT_CREATION_GRACE_SECS)?,
            stale_threshold: secs_var(
                "LITEBOXD_STALE_THRESHOLD_SECS",
                DEFAULT_STALE_THRESHOLD_SECS,
            )?,
            fix_timeout: secs_var("LITEBOXD_FIX_TIMEOUT_SECS", DEFAULT_FIX_TIMEOUT_SECS)?,
            fix_concurrency: positive_var("LITEBOXD_FIX_CONCURRENCY", DEFAULT_FIX_CONCURRENCY as u64)?
                as usize,
            prepull_timeout: secs_var(
                "LITEBOXD_PREPULL_TIMEOUT_SECS",
                DEFAULT_PREPULL_TIMEOUT_SECS,
            )?,
            prepull_sweep_interval: secs_var(
                "LITEBOXD_PREPULL_SWEEP_SECS",
                DEFAULT_PREPULL_SWEEP_SECS,
            )?,
            prepull_nodes: positive_var("LITEBOXD_PREPULL_NODES", DEFAULT_PREPULL_NODES)?
                .min(i64::MAX as u64) as i64,
        })
    }

    pub fn detector_settings(&self) -> DetectorSettings {
        DetectorSettings {
            creation_grace: chrono::Duration::from_std(self.creation_grace)
                .unwrap_or_else(|_| chrono::Duration::seconds(DEFAULT_CREATION_GRACE_SECS as i64)),
            stale_threshold: chrono::Duration::from_std(self.stale_threshold)
                .unwrap_or_else(|_| chrono::Duration::seconds(DEFAULT_STALE_THRESHOLD_SECS as i64)),
        }
    }
}

fn positive_var(name: &'static str, default: u64) -> Result<u64, ConfigError> {
    let value = match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<u64>()
            .map_err(|source| ConfigError::InvalidNumber { name, source })?,
        Err(_) => default,
    };

    if value == 0 {
        return Err(ConfigError::Zero(name));
    }
    Ok(value)
}

fn secs_var(name: &'static str, default: u64) -> Result<Duration, ConfigError> {
    positive_var(name, default).map(Duration::from_secs)
}

#[cfg(test)]
mod tests {
    use super::*;

    // All env manipulation lives in one test so parallel tests cannot interleave.
    #[test]
    fn test_config_from_env() {
        for name in [
            "LITEBOXD_DATABASE_URL",
            "LITEBOXD_RECONCILE_INTERVAL_SECS",
            "LITEBOXD_FIX_CONCURRENCY",
            "LITEBOXD_PREPULL_TIMEOUT_SECS",
            "LITEBOXD_PREPULL_NODES",
        ] {
            env::remove_var(name);
        }

        let config = ControlConfig::from_env().unwrap();
        assert_eq!(config, ControlConfig::default());

        env::set_var("LITEBOXD_RECONCILE_INTERVAL_SECS", "5");
        env::set_var("LITEBOXD_FIX_CONCURRENCY", "8");
        env::set_var("LITEBOXD_DATABASE_URL", "sqlite::memory:");
        env::set_var("LITEBOXD_PREPULL_NODES", "3");
        let config = ControlConfig::from_env().unwrap();
        assert_eq!(config.reconcile_interval, Duration::from_secs(5));
        assert_eq!(config.fix_concurrency, 8);
        assert_eq!(config.prepull_nodes, 3);
        assert_eq!(config.database_url, "sqlite::memory:");

        env::set_var("LITEBOXD_RECONCILE_INTERVAL_SECS", "soon");
        assert!(matches!(
            ControlConfig::from_env(),
            Err(ConfigError::InvalidNumber { name: "LITEBOXD_RECONCILE_INTERVAL_SECS", .. })
        ));

        env::set_var("LITEBOXD_RECONCILE_INTERVAL_SECS", "5");
        env::set_var("LITEBOXD_PREPULL_TIMEOUT_SECS", "0");
        assert!(matches!(
            ControlConfig::from_env(),
            Err(ConfigError::Zero("LITEBOXD_PREPULL_TIMEOUT_SECS"))
        ));

        for name in [
            "LITEBOXD_DATABASE_URL",
            "LITEBOXD_RECONCILE_INTERVAL_SECS",
            "LITEBOXD_FIX_CONCURRENCY",
            "LITEBOXD_PREPULL_TIMEOUT_SECS",
            "LITEBOXD_PREPULL_NODES",
        ] {
            env::remove_var(name);
        }
    }

    #[test]
    fn test_detector_settings_follow_config() {
        let config = ControlConfig {
            creation_grace: Duration::from_secs(90),
            ..Default::default()
        };
        let settings = config.detector_settings();
        assert_eq!(settings.creation_grace, chrono::Duration::seconds(90));
        assert_eq!(settings.stale_threshold, chrono::Duration::seconds(60));
    }
}
