//! Frame definitions for the filter plugin RPC channel
//!
//! After the handshake, host and plugin exchange newline-delimited JSON-RPC
//! 2.0 frames over the plugin's stdin/stdout. Calls are correlated by `id`, so
//! responses may come back in any order.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Obtain a named capability from the plugin
pub const METHOD_DISPENSE: &str = "Dispenser.Dispense";
/// Filter a request body
pub const METHOD_ON_REQUEST: &str = "Plugin.OnRequest";
/// Filter a response body
pub const METHOD_ON_RESPONSE: &str = "Plugin.OnResponse";

/// Name under which plugins expose their filter
pub const FILTER_PLUGIN_NAME: &str = "filter";

pub const METHOD_NOT_FOUND: i64 = -32601;
pub const INVALID_PARAMS: i64 = -32602;
/// The filter itself returned an error; the message is passed through untouched
pub const FILTER_ERROR: i64 = -32000;

/// Upper bound on a single frame, in bytes
pub const DEFAULT_MAX_FRAME_BYTES: usize = 64 * 1024 * 1024;

const JSONRPC_VERSION: &str = "2.0";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcRequest {
    pub jsonrpc: String,
    pub id: u64,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

impl RpcRequest {
    pub fn new(id: u64, method: &str, params: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            method: method.to_string(),
            params,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcResponse {
    #[serde(default)]
    pub jsonrpc: String,
    pub id: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcErrorObject>,
}

impl RpcResponse {
    pub fn success(id: u64, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(id: u64, code: i64, message: impl Into<String>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result: None,
            error: Some(RpcErrorObject {
                code,
                message: message.into(),
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcErrorObject {
    pub code: i64,
    pub message: String,
}

/// Parameters of `Dispenser.Dispense`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct DispenseArgs {
    pub name: String,
}
