//! Filter plugin that tags requests with its own file name.
//!
//! Requests get `|<name>` appended and responses must end with the same tag,
//! which is stripped. Several copies under different names show the order in
//! which a chain visits them.

use async_trait::async_trait;
use kafka_proxy_filters::filter::{Filter, RequestArgs, RequestResult, ResponseArgs, ResponseResult};
use kafka_proxy_filters::{logging, plugin, FilterCallError};
use std::path::Path;
use tracing::{debug, info};

struct TagFilter {
    name: String,
    tag: Vec<u8>,
}

impl TagFilter {
    fn new(name: String) -> Self {
        let tag = format!("|{name}").into_bytes();
        Self { name, tag }
    }
}

#[async_trait]
impl Filter for TagFilter {
    async fn on_request(&self, args: RequestArgs) -> Result<RequestResult, FilterCallError> {
        let mut body = args.body;
        body.extend_from_slice(&self.tag);
        debug!(size = body.len(), "Tagged request");
        Ok(RequestResult { body })
    }

    async fn on_response(&self, args: ResponseArgs) -> Result<ResponseResult, FilterCallError> {
        let mut body = args.body;
        if !body.ends_with(&self.tag) {
            return Err(FilterCallError::Rejected(format!(
                "response not tagged by {}",
                self.name
            )));
        }
        body.truncate(body.len() - self.tag.len());
        Ok(ResponseResult { body })
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    logging::init_plugin();

    let name = std::env::args_os()
        .next()
        .as_deref()
        .and_then(|arg0| Path::new(arg0).file_name())
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "tag-filter".to_string());
    info!(name = %name, "Tag filter started");

    plugin::serve(TagFilter::new(name)).await?;
    Ok(())
}
