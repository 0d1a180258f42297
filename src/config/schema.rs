use crate::plugin::schema::DEFAULT_MAX_FRAME_BYTES;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub filters: FilterConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Where plugins live and how their processes are managed
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FilterConfig {
    /// Directory scanned for plugin executables; empty disables filtering
    #[serde(default)]
    pub plugin_dir: PathBuf,
    #[serde(default = "default_start_timeout")]
    pub start_timeout_ms: u64,
    #[serde(default = "default_stop_grace_period")]
    pub stop_grace_period_ms: u64,
    #[serde(default = "default_max_frame_bytes")]
    pub max_frame_bytes: usize,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
    /// Log to this file instead of stderr
    #[serde(default)]
    pub file: Option<PathBuf>,
}

// Default value functions
fn default_start_timeout() -> u64 {
    60_000
}

fn default_stop_grace_period() -> u64 {
    2_000
}

fn default_max_frame_bytes() -> usize {
    DEFAULT_MAX_FRAME_BYTES
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            plugin_dir: PathBuf::new(),
            start_timeout_ms: default_start_timeout(),
            stop_grace_period_ms: default_stop_grace_period(),
            max_frame_bytes: default_max_frame_bytes(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
            file: None,
        }
    }
}

impl FilterConfig {
    pub fn start_timeout(&self) -> Duration {
        Duration::from_millis(self.start_timeout_ms)
    }

    pub fn stop_grace_period(&self) -> Duration {
        Duration::from_millis(self.stop_grace_period_ms)
    }

    /// Filtering is off when no plugin directory is configured
    pub fn is_enabled(&self) -> bool {
        !self.plugin_dir.as_os_str().is_empty()
    }
}
