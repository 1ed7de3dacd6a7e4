//! Daemon configuration.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Configuration for the daemon
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Serial device path; `None` enumerates all ports.
    pub port: Option<String>,
    /// Directory receiving the rolling CSV sample logs.
    pub recordings_directory: String,
    /// Prepend a host timestamp to every CSV record.
    pub csv_debug_format: bool,
    /// New samples required between classifications.
    pub predict_rate: u32,
    /// Classification history folded into the confidence value.
    pub prediction_history: usize,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            port: None,
            recordings_directory: "./recordings".to_string(),
            csv_debug_format: false,
            predict_rate: 2,
            prediction_history: 5,
        }
    }
}

/// Load daemon configuration from file, falling back to defaults when the
/// file does not exist.
pub fn load_config(path: &str) -> Result<DaemonConfig> {
    match std::fs::read_to_string(path) {
        Ok(contents) => {
            let config: DaemonConfig = serde_json::from_str(&contents)
                .with_context(|| format!("could not parse configuration file at '{}'", path))?;
            log::info!("loaded configuration from {}", path);
            Ok(config)
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            log::info!("no configuration file at {}, using defaults", path);
            Ok(DaemonConfig::default())
        }
        Err(e) => Err(e).with_context(|| format!("could not read configuration file at '{}'", path)),
    }
}
