//! Per-instance settings, read from `FLEET_*` environment variables.

use std::time::Duration;

use anyhow::{Context, Result};
use fleet_process::process::{InstanceId, DEFAULT_AWAIT_TIMEOUT};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InstanceConfig {
    pub instance_id: InstanceId,
    pub host: String,
    pub port: u16,
    /// Upper bound a cluster-wide process-list request waits for instances.
    pub show_process_list_timeout: Duration,
    pub tracked_dialects: Vec<String>,
    pub process_cleaners: Vec<String>,
    pub event_bus_capacity: usize,
}

impl Default for InstanceConfig {
    fn default() -> Self {
        Self {
            instance_id: InstanceId::generate(),
            host: "127.0.0.1".to_string(),
            port: 3307,
            show_process_list_timeout: DEFAULT_AWAIT_TIMEOUT,
            tracked_dialects: vec!["MySQL".to_string()],
            process_cleaners: vec!["idle-session".to_string()],
            event_bus_capacity: 1024,
        }
    }
}

impl InstanceConfig {
    /// Loads configuration from environment variables with sensible defaults.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Same as [`InstanceConfig::from_env`] with an explicit variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Self::default();
        let instance_id = lookup("FLEET_INSTANCE_ID")
            .map(|raw| raw.trim().to_string())
            .filter(|raw| !raw.is_empty())
            .map(InstanceId::new)
            .unwrap_or(defaults.instance_id);
        let host = lookup("FLEET_INSTANCE_HOST").unwrap_or(defaults.host);
        let port = parse_port(lookup("FLEET_INSTANCE_PORT"), defaults.port)
            .context("FLEET_INSTANCE_PORT")?;
        let timeout_ms = parse_u64(
            lookup("FLEET_SHOW_PROCESSLIST_TIMEOUT_MS"),
            defaults.show_process_list_timeout.as_millis() as u64,
        )
        .context("FLEET_SHOW_PROCESSLIST_TIMEOUT_MS")?;
        anyhow::ensure!(
            timeout_ms > 0,
            "FLEET_SHOW_PROCESSLIST_TIMEOUT_MS must be positive"
        );
        let tracked_dialects = parse_list(lookup("FLEET_TRACKED_DIALECTS"), defaults.tracked_dialects);
        let process_cleaners = parse_list(lookup("FLEET_PROCESS_CLEANERS"), defaults.process_cleaners);
        let event_bus_capacity = parse_usize(
            lookup("FLEET_EVENT_BUS_CAPACITY"),
            defaults.event_bus_capacity,
        )
        .context("FLEET_EVENT_BUS_CAPACITY")?
        .max(1);

        Ok(Self {
            instance_id,
            host,
            port,
            show_process_list_timeout: Duration::from_millis(timeout_ms),
            tracked_dialects,
            process_cleaners,
            event_bus_capacity,
        })
    }
}

fn parse_port(value: Option<String>, default_port: u16) -> Result<u16> {
    match value {
        Some(raw) => raw
            .trim()
            .parse::<u16>()
            .with_context(|| format!("invalid port value: {raw}")),
        None => Ok(default_port),
    }
}

fn parse_usize(value: Option<String>, default_value: usize) -> Result<usize> {
    match value {
        Some(raw) => raw
            .trim()
            .parse::<usize>()
            .with_context(|| format!("invalid usize value: {raw}")),
        None => Ok(default_value),
    }
}

fn parse_u64(value: Option<String>, default_value: u64) -> Result<u64> {
    match value {
        Some(raw) => raw
            .trim()
            .parse::<u64>()
            .with_context(|| format!("invalid u64 value: {raw}")),
        None => Ok(default_value),
    }
}

/// Comma-separated list; an unset variable keeps the default, an empty one
/// yields an empty list.
fn parse_list(value: Option<String>, default_value: Vec<String>) -> Vec<String> {
    match value {
        Some(raw) => raw
            .split(',')
            .map(str::trim)
            .filter(|item| !item.is_empty())
            .map(str::to_string)
            .collect(),
        None => default_value,
    }
}
