//! Pass-through filter plugin that records every call it sees

use async_trait::async_trait;
use kafka_proxy_filters::filter::{Filter, RequestArgs, RequestResult, ResponseArgs, ResponseResult};
use kafka_proxy_filters::{logging, plugin, FilterCallError};
use std::path::PathBuf;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{info, warn};

const DEFAULT_LOG_PATH: &str = "/tmp/kafka-proxy-debug-filter.log";
const LOG_PATH_ENV: &str = "DEBUG_FILTER_LOG";

struct DebugFilter {
    log: Mutex<File>,
}

impl DebugFilter {
    async fn record(&self, line: String) {
        let mut log = self.log.lock().await;
        let written = match log.write_all(format!("{line}\n").as_bytes()).await {
            Ok(()) => log.flush().await,
            Err(e) => Err(e),
        };
        if let Err(e) = written {
            warn!(error = %e, "Failed to write debug log");
        }
    }
}

#[async_trait]
impl Filter for DebugFilter {
    async fn on_request(&self, args: RequestArgs) -> Result<RequestResult, FilterCallError> {
        self.record(format!(
            "Request: ApiKey={}, ApiVersion={}, Size={}",
            args.api_key,
            args.api_version,
            args.body.len()
        ))
        .await;
        Ok(RequestResult { body: args.body })
    }

    async fn on_response(&self, args: ResponseArgs) -> Result<ResponseResult, FilterCallError> {
        self.record(format!(
            "Response: ApiKey={}, ApiVersion={}, Size={}",
            args.api_key,
            args.api_version,
            args.body.len()
        ))
        .await;
        Ok(ResponseResult { body: args.body })
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    logging::init_plugin();

    let path = std::env::var_os(LOG_PATH_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_LOG_PATH));
    let log = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .await?;
    info!(log = %path.display(), "Debug filter started");

    plugin::serve(DebugFilter {
        log: Mutex::new(log),
    })
    .await?;
    Ok(())
}
