//! Plugin process supervision
//!
//! This module spawns filter plugin executables, runs the handshake over their
//! stdio, dispenses the filter capability and owns the process until it is
//! stopped.

use crate::config::FilterConfig;
use crate::error::PluginError;
use crate::filter::RemoteFilter;
use crate::plugin::handshake::{HandshakeConfig, HANDSHAKE};
use crate::plugin::rpc::RpcClient;
use crate::plugin::schema::{DispenseArgs, FILTER_PLUGIN_NAME, METHOD_DISPENSE};
use futures::StreamExt;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, Command};
use tokio::sync::Mutex;
use tokio::time::timeout;
use tokio_util::codec::{FramedRead, LinesCodec};
use tracing::{debug, info, warn};

/// Knobs for starting and stopping plugin processes
#[derive(Debug, Clone)]
pub struct StartOptions {
    pub handshake: HandshakeConfig,
    /// Budget for the handshake and for dispensing the filter
    pub start_timeout: Duration,
    /// How long a plugin gets to exit after SIGTERM before it is killed
    pub stop_grace_period: Duration,
    pub max_frame_bytes: usize,
}

impl Default for StartOptions {
    fn default() -> Self {
        Self::from(&FilterConfig::default())
    }
}

impl From<&FilterConfig> for StartOptions {
    fn from(config: &FilterConfig) -> Self {
        Self {
            handshake: HANDSHAKE,
            start_timeout: config.start_timeout(),
            stop_grace_period: config.stop_grace_period(),
            max_frame_bytes: config.max_frame_bytes,
        }
    }
}

/// A running filter plugin
pub struct PluginProcess {
    name: String,
    path: PathBuf,
    pid: Option<u32>,
    /// `None` once the process has been stopped and reaped
    child: Mutex<Option<Child>>,
    client: Arc<RpcClient>,
    stop_grace_period: Duration,
}

impl PluginProcess {
    /// Launch `path`, verify it is a conforming plugin and dispense its filter.
    ///
    /// On any failure the child is killed and reaped before returning.
    pub async fn start(
        path: &Path,
        options: &StartOptions,
    ) -> Result<(Self, RemoteFilter), PluginError> {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());

        let mut cmd = Command::new(path);
        cmd.envs(options.handshake.plugin_env())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|source| PluginError::Spawn {
            path: path.to_path_buf(),
            source,
        })?;
        let pid = child.id();

        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_stderr(name.clone(), stderr));
        }

        let (stdin, stdout) = match (child.stdin.take(), child.stdout.take()) {
            (Some(stdin), Some(stdout)) => (stdin, stdout),
            _ => {
                reap(&mut child).await;
                return Err(PluginError::Spawn {
                    path: path.to_path_buf(),
                    source: std::io::Error::new(
                        std::io::ErrorKind::Other,
                        "plugin stdio was not captured",
                    ),
                });
            }
        };

        let mut frames = FramedRead::new(
            stdout,
            LinesCodec::new_with_max_length(options.max_frame_bytes),
        );

        let mismatch = match timeout(options.start_timeout, frames.next()).await {
            Err(_) => Some(format!(
                "timed out after {:?} waiting for handshake",
                options.start_timeout
            )),
            Ok(None) => Some("plugin exited before completing the handshake".to_string()),
            Ok(Some(Err(e))) => Some(format!("failed to read handshake: {e}")),
            Ok(Some(Ok(line))) => options.handshake.verify_line(&line).err(),
        };
        if let Some(reason) = mismatch {
            reap(&mut child).await;
            return Err(PluginError::Handshake {
                path: path.to_path_buf(),
                reason,
            });
        }
        debug!(plugin = %name, "Handshake complete");

        let client = Arc::new(RpcClient::new(frames, stdin));
        let args = DispenseArgs {
            name: FILTER_PLUGIN_NAME.to_string(),
        };
        let dispensed = timeout(
            options.start_timeout,
            client.call::<_, Value>(METHOD_DISPENSE, &args),
        )
        .await;
        let failure = match dispensed {
            Err(_) => Some(format!(
                "timed out after {:?} waiting for the filter",
                options.start_timeout
            )),
            Ok(Err(e)) => Some(e.to_string()),
            Ok(Ok(_)) => None,
        };
        if let Some(reason) = failure {
            client.close();
            reap(&mut child).await;
            return Err(PluginError::Dispense {
                path: path.to_path_buf(),
                reason,
            });
        }

        info!(plugin = %name, pid = ?pid, "Plugin started");

        let filter = RemoteFilter::new(name.clone(), client.clone());
        let process = Self {
            name,
            path: path.to_path_buf(),
            pid,
            child: Mutex::new(Some(child)),
            client,
            stop_grace_period: options.stop_grace_period,
        };

        Ok((process, filter))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Whether the process is still alive
    pub async fn is_running(&self) -> bool {
        match self.child.lock().await.as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        }
    }

    /// Terminate the plugin: SIGTERM, wait for the grace period, then kill.
    ///
    /// Calls in flight fail with a lost-connection error. Stopping an already
    /// stopped or exited plugin is a no-op.
    pub async fn stop(&self) -> Result<(), PluginError> {
        self.client.close();

        let Some(mut child) = self.child.lock().await.take() else {
            return Ok(());
        };

        if let Ok(Some(status)) = child.try_wait() {
            debug!(plugin = %self.name, %status, "Plugin had already exited");
            return Ok(());
        }

        terminate(&child);

        match timeout(self.stop_grace_period, child.wait()).await {
            Ok(Ok(status)) => {
                debug!(plugin = %self.name, %status, "Plugin exited");
                Ok(())
            }
            Ok(Err(source)) => Err(PluginError::Stop {
                name: self.name.clone(),
                source,
            }),
            Err(_) => {
                warn!(
                    plugin = %self.name,
                    grace_period = ?self.stop_grace_period,
                    "Plugin ignored SIGTERM, killing"
                );
                child.kill().await.map_err(|source| PluginError::Stop {
                    name: self.name.clone(),
                    source,
                })
            }
        }
    }
}

#[cfg(unix)]
fn terminate(child: &Child) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    if let Some(pid) = child.id() {
        if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
            debug!(pid, error = %e, "Failed to send SIGTERM");
        }
    }
}

#[cfg(not(unix))]
fn terminate(_child: &Child) {}

/// Kill and reap a child that never made it into a chain
async fn reap(child: &mut Child) {
    if let Err(e) = child.kill().await {
        debug!(error = %e, "Failed to kill plugin process");
    }
}

async fn forward_stderr(name: String, stderr: ChildStderr) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        debug!(plugin = %name, "{}", line);
    }
}
