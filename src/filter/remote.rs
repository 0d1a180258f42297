use super::{Filter, RequestArgs, RequestResult, ResponseArgs, ResponseResult};
use crate::error::FilterCallError;
use crate::plugin::rpc::RpcClient;
use crate::plugin::schema::{METHOD_ON_REQUEST, METHOD_ON_RESPONSE};
use async_trait::async_trait;
use std::sync::Arc;

/// A [`Filter`] whose calls are forwarded to a plugin process
#[derive(Clone)]
pub struct RemoteFilter {
    name: String,
    client: Arc<RpcClient>,
}

impl RemoteFilter {
    pub fn new(name: String, client: Arc<RpcClient>) -> Self {
        Self { name, client }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

#[async_trait]
impl Filter for RemoteFilter {
    async fn on_request(&self, args: RequestArgs) -> Result<RequestResult, FilterCallError> {
        self.client.call(METHOD_ON_REQUEST, &args).await
    }

    async fn on_response(&self, args: ResponseArgs) -> Result<ResponseResult, FilterCallError> {
        self.client.call(METHOD_ON_RESPONSE, &args).await
    }
}
