//! Filter capability shared by in-process and plugin-backed filters
//!
//! A filter sees every Kafka request and response the proxy forwards, keyed by
//! the message's API key and version, and may rewrite the body. Bodies are
//! opaque bytes here; any structure is the filter's own business.
//!
//! The chain only ever talks to [`Filter`], so a filter compiled into the
//! proxy and one running as a separate plugin process are interchangeable.

pub mod remote;

use crate::error::FilterCallError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub use remote::RemoteFilter;

/// Arguments of `Plugin.OnRequest`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct RequestArgs {
    pub api_key: i16,
    pub api_version: i16,
    pub body: Vec<u8>,
}

/// Result of `Plugin.OnRequest`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct RequestResult {
    pub body: Vec<u8>,
}

/// Arguments of `Plugin.OnResponse`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ResponseArgs {
    pub api_key: i16,
    pub api_version: i16,
    pub body: Vec<u8>,
}

/// Result of `Plugin.OnResponse`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ResponseResult {
    pub body: Vec<u8>,
}

/// A request/response body transform.
///
/// Implementations must tolerate concurrent calls: the proxy services many
/// connections at once and makes no ordering promise between them. A returned
/// body is only meaningful when no error is returned.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Filter: Send + Sync {
    async fn on_request(&self, args: RequestArgs) -> Result<RequestResult, FilterCallError>;

    async fn on_response(&self, args: ResponseArgs) -> Result<ResponseResult, FilterCallError>;
}
