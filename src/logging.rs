//! Tracing setup for the host CLI and for plugin binaries

use crate::config::LoggingConfig;
use crate::error::{ConfigError, Error, Result};
use std::fs::OpenOptions;
use std::io;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::EnvFilter;

/// Install the global subscriber described by `config`.
///
/// `RUST_LOG` directives are honoured on top of the configured level, and
/// `debug` forces this crate to debug level. When logging to a file the
/// returned guard must be held until exit so buffered lines are flushed.
pub fn init(config: &LoggingConfig, debug: bool) -> Result<Option<WorkerGuard>> {
    let level = if debug { "debug" } else { config.level.as_str() };
    let directive = format!("kafka_proxy_filters={level}")
        .parse()
        .map_err(|e| ConfigError::Parse(format!("Invalid log level '{level}': {e}")))?;
    let filter = EnvFilter::from_default_env().add_directive(directive);

    match &config.file {
        Some(path) => {
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            let (writer, guard) = tracing_appender::non_blocking(file);
            install(filter, writer, config.json, false)?;
            Ok(Some(guard))
        }
        None => {
            install(filter, io::stderr, config.json, true)?;
            Ok(None)
        }
    }
}

/// Logging for plugin binaries.
///
/// Stdout carries the RPC stream, so plugins log to stderr without colour;
/// the host forwards those lines into its own log.
pub fn init_plugin() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_ansi(false)
        .with_target(false)
        .try_init();
}

fn install<W>(filter: EnvFilter, writer: W, json: bool, ansi: bool) -> Result<()>
where
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(ansi);

    let result = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    result.map_err(|e| Error::Io(io::Error::other(e)))
}
