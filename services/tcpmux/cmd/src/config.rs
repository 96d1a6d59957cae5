//! Configuration handling for the tcpmux binary.
//!
//! Settings come from an optional YAML file, then `TCPMUX_*` environment
//! variables, then command line flags.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tcpmux_session::ManagerConfig;
use tracing::{info, warn};

/// First id handed to accepted sockets by the bridge, well above the ids
/// hosts usually pick for their own sockets
pub const DEFAULT_FIRST_CHILD_ID: u32 = 100_000;

/// Bridge configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Log level (trace, debug, info, warn, error)
    pub log_level: String,
    /// First id handed to accepted sockets
    pub first_child_id: u32,
    /// Default write deadline, e.g. `5s`
    #[serde(with = "humantime_serde")]
    pub send_timeout: Option<Duration>,
    /// Read buffer size per socket
    pub read_buffer_size: usize,
    /// Disable Nagle's algorithm on new streams
    pub no_delay: bool,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        let manager = ManagerConfig::default();
        Self {
            log_level: "info".to_string(),
            first_child_id: DEFAULT_FIRST_CHILD_ID,
            send_timeout: manager.send_timeout,
            read_buffer_size: manager.read_buffer_size,
            no_delay: manager.no_delay,
        }
    }
}

impl BridgeConfig {
    /// Session manager settings
    pub fn manager_config(&self) -> ManagerConfig {
        ManagerConfig {
            first_child_id: self.first_child_id,
            send_timeout: self.send_timeout,
            read_buffer_size: self.read_buffer_size,
            no_delay: self.no_delay,
        }
    }

    /// Load configuration from file and environment variables
    ///
    /// A missing file means defaults; a file that does not parse is an error.
    pub fn load_from_file<P: AsRef<Path>>(config_path: P) -> Result<Self> {
        let path = config_path.as_ref();
        let mut config = match std::fs::read_to_string(path) {
            Ok(content) => {
                let config = serde_yaml::from_str::<Self>(&content)
                    .with_context(|| format!("Failed to parse config file {:?}", path))?;
                info!("Loaded configuration from {:?}", path);
                config
            }
            Err(_) => {
                warn!("Config file {:?} not found, using defaults", path);
                Self::default()
            }
        };

        config.apply_environment_overrides(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Apply `TCPMUX_*` overrides looked up through `var`
    pub fn apply_environment_overrides<F>(&mut self, var: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(level) = var("TCPMUX_LOG_LEVEL") {
            self.log_level = level;
            info!("Log level overridden by environment: {}", self.log_level);
        }

        if let Some(id) = var("TCPMUX_FIRST_CHILD_ID") {
            self.first_child_id = id
                .parse()
                .with_context(|| format!("Invalid TCPMUX_FIRST_CHILD_ID: {}", id))?;
            info!("First child id overridden by environment: {}", id);
        }

        if let Some(timeout) = var("TCPMUX_SEND_TIMEOUT") {
            self.send_timeout = parse_optional_duration(&timeout)
                .with_context(|| format!("Invalid TCPMUX_SEND_TIMEOUT: {}", timeout))?;
            info!("Send timeout overridden by environment: {}", timeout);
        }

        if let Some(size) = var("TCPMUX_READ_BUFFER_SIZE") {
            let size: usize = size
                .parse()
                .with_context(|| format!("Invalid TCPMUX_READ_BUFFER_SIZE: {}", size))?;
            if size == 0 {
                anyhow::bail!("TCPMUX_READ_BUFFER_SIZE must be positive");
            }
            self.read_buffer_size = size;
        }

        if let Some(no_delay) = var("TCPMUX_NO_DELAY") {
            self.no_delay = matches!(no_delay.to_lowercase().as_str(), "1" | "true" | "yes");
        }

        Ok(())
    }
}

/// `"off"`/`"none"`/empty disable the timeout, anything else is a humantime duration
pub fn parse_optional_duration(value: &str) -> Result<Option<Duration>> {
    match value.trim() {
        "" | "off" | "none" => Ok(None),
        text => Ok(Some(humantime::parse_duration(text)?)),
    }
}
