//! Request/response filtering for a Kafka wire-protocol proxy.
//!
//! Filters run as separate plugin executables discovered in a directory,
//! started once and chained in file-name order. See [`chain::FilterChain`].

pub mod chain;
pub mod commands;
pub mod config;
pub mod error;
pub mod filter;
pub mod logging;
pub mod plugin;

pub use chain::FilterChain;
pub use error::{Error, FilterCallError, Result};
pub use filter::Filter;
