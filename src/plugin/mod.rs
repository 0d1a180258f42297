//! Out-of-process filter plugins
//!
//! Filters can live in separately compiled executables. The proxy launches
//! each one as a child process and talks to it over the child's stdio.
//!
//! # Architecture
//!
//! - **Handshake**: a magic cookie and protocol version keep arbitrary
//!   executables from being mistaken for plugins
//! - **RPC**: newline-delimited JSON-RPC frames, correlated by id so many
//!   proxy connections can share one plugin
//! - **Supervision**: the host owns each process and terminates it on shutdown
//!
//! # Modules
//!
//! - `handshake`: cookie/version constants and handshake line checks
//! - `schema`: RPC frame and method definitions
//! - `rpc`: host-side multiplexed client
//! - `process`: spawning, dispensing and stopping plugin processes
//! - `serve`: plugin-side server used by plugin binaries

pub mod handshake;
pub mod process;
pub mod rpc;
pub mod schema;
pub mod serve;

pub use handshake::{HandshakeConfig, HANDSHAKE};
pub use process::{PluginProcess, StartOptions};
pub use rpc::RpcClient;
pub use serve::{serve, serve_connection};
