//! Service configuration loaded from YAML.

use std::path::Path;
use std::time::Duration;

use common::StorageConfig;
use serde::Deserialize;

use crate::error::{Error, Result};

/// Root configuration file structure.
#[derive(Debug, Clone, Deserialize)]
pub struct VaultConfig {
    #[serde(default)]
    pub storage: StorageConfig,
    /// How long shutdown waits for feeds to close, e.g. `5s` or `500ms`.
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace: String,
    /// Outbound envelopes buffered per connection before responses and
    /// deliveries wait on the client.
    #[serde(default = "default_outbound_buffer")]
    pub outbound_buffer: usize,
}

fn default_shutdown_grace() -> String {
    "5s".to_string()
}

fn default_outbound_buffer() -> usize {
    1024
}

impl Default for VaultConfig {
    fn default() -> Self {
        Self {
            storage: StorageConfig::default(),
            shutdown_grace: default_shutdown_grace(),
            outbound_buffer: default_outbound_buffer(),
        }
    }
}

impl VaultConfig {
    pub fn shutdown_grace(&self) -> Result<Duration> {
        parse_duration(&self.shutdown_grace)
    }
}

/// Load configuration from a YAML file.
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<VaultConfig> {
    let contents = std::fs::read_to_string(path.as_ref())
        .map_err(|e| Error::Config(format!("Failed to read config file: {}", e)))?;

    let config: VaultConfig = serde_yaml::from_str(&contents)
        .map_err(|e| Error::Config(format!("Failed to parse config file: {}", e)))?;
    if config.outbound_buffer == 0 {
        return Err(Error::Config(
            "outbound_buffer must be at least 1".to_string(),
        ));
    }
    config.shutdown_grace()?;
    Ok(config)
}

/// Parse a duration string such as `15s`, `1m` or `500ms`. A bare number is
/// seconds.
pub fn parse_duration(s: &str) -> Result<Duration> {
    let s = s.trim();
    if s.is_empty() {
        return Err(Error::Config("Empty duration string".to_string()));
    }

    let num_end = s
        .find(|c: char| !c.is_ascii_digit() && c != '.')
        .unwrap_or(s.len());
    if num_end == 0 {
        return Err(Error::Config(format!(
            "Duration must start with a number: {}",
            s
        )));
    }

    let value: f64 = s[..num_end]
        .parse()
        .map_err(|_| Error::Config(format!("Invalid duration number: {}", s)))?;
    let millis_per_unit = match &s[num_end..] {
        "ms" => 1.0,
        "s" | "" => 1_000.0,
        "m" => 60_000.0,
        "h" => 3_600_000.0,
        unit => {
            return Err(Error::Config(format!("Unknown duration unit: {}", unit)));
        }
    };

    Ok(Duration::from_millis((value * millis_per_unit).round() as u64))
}
