use std::io;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Failed to read plugin directory {}: {source}", path.display())]
    Discovery {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Plugin error: {0}")]
    Plugin(#[from] PluginError),

    #[error("Filter error: {0}")]
    Filter(#[from] FilterCallError),

    #[error("{} plugin process(es) failed to stop", .0.len())]
    Shutdown(Vec<PluginError>),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Environment variable error: {0}")]
    EnvVar(String),
}

/// Failures while bringing a single plugin process up or down.
#[derive(Error, Debug)]
pub enum PluginError {
    #[error("Failed to spawn plugin {}: {source}", path.display())]
    Spawn {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Handshake with plugin {} failed: {reason}", path.display())]
    Handshake { path: PathBuf, reason: String },

    #[error("Failed to dispense filter from plugin {}: {reason}", path.display())]
    Dispense { path: PathBuf, reason: String },

    #[error("Failed to stop plugin '{name}': {source}")]
    Stop {
        name: String,
        #[source]
        source: io::Error,
    },
}

/// Error surfaced by a filter while transforming a single message.
///
/// Filter-originated errors keep their message verbatim so that the caller
/// sees exactly what the filter reported, whether it ran in-process or in a
/// plugin.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FilterCallError {
    #[error("{0}")]
    Rejected(String),

    #[error("Connection to plugin lost: {0}")]
    ConnectionLost(String),

    #[error("Plugin protocol error: {0}")]
    Protocol(String),
}

pub type Result<T> = std::result::Result<T, Error>;
