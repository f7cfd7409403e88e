use std::time::Duration;

use anyhow::{bail, Context, Result};
use jobplane_scheduling::{PassSettings, DEFAULT_CONTROL_PLANE_GROUP, DEFAULT_SCHEDULE_INTERVAL};

use crate::db::DbConfig;

#[derive(Debug, Clone)]
pub struct Config {
    pub log_level: String,
    pub dev_mode: bool,
    pub schedule_interval: Duration,
    pub control_plane_group: String,
    pub database: DbConfig,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the configuration from an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let log_level = lookup("JOBPLANE_LOG_LEVEL").unwrap_or_else(|| "info".to_string());

        let dev_mode = lookup("JOBPLANE_DEV")
            .map(|v| v == "1" || v.to_lowercase() == "true")
            .unwrap_or(false);

        let schedule_interval = parse_interval(lookup("JOBPLANE_SCHEDULE_INTERVAL_SECS"))?;

        let control_plane_group = lookup("JOBPLANE_CONTROL_PLANE_GROUP")
            .filter(|name| !name.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_CONTROL_PLANE_GROUP.to_string());

        let database = DbConfig::from_lookup(&lookup);

        Ok(Self {
            log_level,
            dev_mode,
            schedule_interval,
            control_plane_group,
            database,
        })
    }

    pub fn pass_settings(&self) -> PassSettings {
        PassSettings {
            control_plane_group: self.control_plane_group.clone(),
        }
    }
}

fn parse_interval(value: Option<String>) -> Result<Duration> {
    let Some(value) = value else {
        return Ok(DEFAULT_SCHEDULE_INTERVAL);
    };
    let secs: u64 = value
        .trim()
        .parse()
        .with_context(|| format!("JOBPLANE_SCHEDULE_INTERVAL_SECS must be a number, got {value:?}"))?;
    if secs == 0 {
        bail!("JOBPLANE_SCHEDULE_INTERVAL_SECS must be greater than zero");
    }
    Ok(Duration::from_secs(secs))
}
