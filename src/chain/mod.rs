//! Filter chain construction and execution
//!
//! A chain is an ordered list of filters. Requests pass through it front to
//! back and responses back to front, so the filter that wrapped a request on
//! its way out is the first to unwrap the matching response:
//!
//! ```text
//! request:  F1 -> F2 -> ... -> Fn -> broker
//! response: F1 <- F2 <- ... <- Fn <- broker
//! ```
//!
//! The list is fixed once the chain is built and only read afterwards, so a
//! chain can be shared behind an `Arc` by every connection of the proxy.

pub mod discovery;

use crate::error::{Error, FilterCallError, Result};
use crate::filter::{Filter, RequestArgs, ResponseArgs};
use crate::plugin::{PluginProcess, StartOptions};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, debug_span, error, info, warn, Instrument};

struct ChainEntry {
    name: String,
    filter: Arc<dyn Filter>,
}

/// Ordered filters plus the plugin processes backing them
pub struct FilterChain {
    filters: Vec<ChainEntry>,
    /// Index-aligned with `filters` for plugin-backed chains, empty otherwise
    processes: Vec<PluginProcess>,
}

impl FilterChain {
    /// A chain with no filters; bodies pass through untouched
    pub fn empty() -> Self {
        Self {
            filters: Vec::new(),
            processes: Vec::new(),
        }
    }

    /// Chain of in-process filters, in the given order
    pub fn from_filters<I, S>(filters: I) -> Self
    where
        I: IntoIterator<Item = (S, Arc<dyn Filter>)>,
        S: Into<String>,
    {
        Self {
            filters: filters
                .into_iter()
                .map(|(name, filter)| ChainEntry {
                    name: name.into(),
                    filter,
                })
                .collect(),
            processes: Vec::new(),
        }
    }

    /// Build a chain from the plugins in `plugin_dir` with default options
    pub async fn build(plugin_dir: impl AsRef<Path>) -> Result<Self> {
        Self::build_with(plugin_dir, &StartOptions::default()).await
    }

    /// Build a chain from the plugins in `plugin_dir`.
    ///
    /// An empty path disables filtering and a missing directory means no
    /// plugins. A plugin that fails to start is logged and left out; only an
    /// unreadable directory fails the whole build.
    pub async fn build_with(plugin_dir: impl AsRef<Path>, options: &StartOptions) -> Result<Self> {
        let plugin_dir = plugin_dir.as_ref();
        let mut chain = Self::empty();

        if plugin_dir.as_os_str().is_empty() {
            debug!("No plugin directory configured, filters disabled");
            return Ok(chain);
        }

        for path in discovery::plugin_candidates(plugin_dir)? {
            info!(plugin = %path.display(), "Loading plugin");
            match PluginProcess::start(&path, options).await {
                Ok((process, filter)) => {
                    chain.filters.push(ChainEntry {
                        name: process.name().to_string(),
                        filter: Arc::new(filter),
                    });
                    chain.processes.push(process);
                }
                Err(e) => {
                    error!(plugin = %path.display(), error = %e, "Skipping plugin");
                }
            }
        }

        debug_assert_eq!(chain.filters.len(), chain.processes.len());
        info!(
            dir = %plugin_dir.display(),
            filters = chain.len(),
            "Filter chain ready"
        );
        Ok(chain)
    }

    pub fn len(&self) -> usize {
        self.filters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    /// Filter names in request order
    pub fn names(&self) -> Vec<&str> {
        self.filters.iter().map(|entry| entry.name.as_str()).collect()
    }

    /// Thread a request body through every filter in chain order.
    ///
    /// The first failing filter aborts the traversal and its error is returned
    /// as is; later filters are not called.
    pub async fn apply_request_filters(
        &self,
        api_key: i16,
        api_version: i16,
        body: Vec<u8>,
    ) -> std::result::Result<Vec<u8>, FilterCallError> {
        let span = debug_span!("request_filters", api_key, api_version);
        async {
            let mut current = body;
            for entry in &self.filters {
                let args = RequestArgs {
                    api_key,
                    api_version,
                    body: current,
                };
                match entry.filter.on_request(args).await {
                    Ok(result) => {
                        debug!(filter = %entry.name, size = result.body.len(), "Request filtered");
                        current = result.body;
                    }
                    Err(e) => {
                        warn!(filter = %entry.name, error = %e, "Request filter failed");
                        return Err(e);
                    }
                }
            }
            Ok(current)
        }
        .instrument(span)
        .await
    }

    /// Thread a response body through every filter in reverse chain order.
    ///
    /// Failure handling matches [`FilterChain::apply_request_filters`].
    pub async fn apply_response_filters(
        &self,
        api_key: i16,
        api_version: i16,
        body: Vec<u8>,
    ) -> std::result::Result<Vec<u8>, FilterCallError> {
        let span = debug_span!("response_filters", api_key, api_version);
        async {
            let mut current = body;
            for entry in self.filters.iter().rev() {
                let args = ResponseArgs {
                    api_key,
                    api_version,
                    body: current,
                };
                match entry.filter.on_response(args).await {
                    Ok(result) => {
                        debug!(filter = %entry.name, size = result.body.len(), "Response filtered");
                        current = result.body;
                    }
                    Err(e) => {
                        warn!(filter = %entry.name, error = %e, "Response filter failed");
                        return Err(e);
                    }
                }
            }
            Ok(current)
        }
        .instrument(span)
        .await
    }

    /// Stop every plugin process owned by the chain.
    ///
    /// All processes are signalled even if some fail to stop; the failures are
    /// returned together.
    pub async fn close(&self) -> Result<()> {
        let results =
            futures::future::join_all(self.processes.iter().map(|process| process.stop())).await;

        let failures: Vec<_> = results
            .into_iter()
            .filter_map(|result| result.err())
            .inspect(|e| error!(error = %e, "Failed to stop plugin"))
            .collect();

        if failures.is_empty() {
            debug!(processes = self.processes.len(), "Filter chain closed");
            Ok(())
        } else {
            Err(Error::Shutdown(failures))
        }
    }
}

impl Default for FilterChain {
    fn default() -> Self {
        Self::empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::{MockFilter, RequestResult, ResponseResult};
    use mockall::predicate::eq;
    use mockall::Sequence;

    fn chain_of(filters: Vec<MockFilter>) -> FilterChain {
        FilterChain::from_filters(
            filters
                .into_iter()
                .enumerate()
                .map(|(i, f)| (format!("mock-{i}"), Arc::new(f) as Arc<dyn Filter>)),
        )
    }

    fn request(body: &[u8]) -> RequestArgs {
        RequestArgs {
            api_key: 1,
            api_version: 2,
            body: body.to_vec(),
        }
    }

    fn response(body: &[u8]) -> ResponseArgs {
        ResponseArgs {
            api_key: 1,
            api_version: 2,
            body: body.to_vec(),
        }
    }

    #[tokio::test]
    async fn test_apply_request_filters() {
        let mut seq = Sequence::new();
        let mut first = MockFilter::new();
        let mut second = MockFilter::new();

        first
            .expect_on_request()
            .with(eq(request(b"initial")))
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| {
                Ok(RequestResult {
                    body: b"modified1".to_vec(),
                })
            });
        second
            .expect_on_request()
            .with(eq(request(b"modified1")))
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| {
                Ok(RequestResult {
                    body: b"modified2".to_vec(),
                })
            });

        let chain = chain_of(vec![first, second]);
        let body = chain
            .apply_request_filters(1, 2, b"initial".to_vec())
            .await
            .unwrap();
        assert_eq!(body, b"modified2");
    }

    #[tokio::test]
    async fn test_apply_response_filters_runs_in_reverse() {
        let mut seq = Sequence::new();
        let mut first = MockFilter::new();
        let mut second = MockFilter::new();

        second
            .expect_on_response()
            .with(eq(response(b"initial")))
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| {
                Ok(ResponseResult {
                    body: b"modified2".to_vec(),
                })
            });
        first
            .expect_on_response()
            .with(eq(response(b"modified2")))
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| {
                Ok(ResponseResult {
                    body: b"modified1".to_vec(),
                })
            });

        let chain = chain_of(vec![first, second]);
        let body = chain
            .apply_response_filters(1, 2, b"initial".to_vec())
            .await
            .unwrap();
        assert_eq!(body, b"modified1");
    }

    #[tokio::test]
    async fn test_request_error_stops_chain() {
        let mut first = MockFilter::new();
        let mut failing = MockFilter::new();
        let mut last = MockFilter::new();

        first.expect_on_request().times(1).returning(|args| {
            Ok(RequestResult {
                body: [args.body, b"+1".to_vec()].concat(),
            })
        });
        failing
            .expect_on_request()
            .with(eq(request(b"body+1")))
            .times(1)
            .returning(|_| Err(FilterCallError::Rejected("unsupported api version".into())));
        last.expect_on_request().never();

        let chain = chain_of(vec![first, failing, last]);
        let err = chain
            .apply_request_filters(1, 2, b"body".to_vec())
            .await
            .unwrap_err();
        assert_eq!(
            err,
            FilterCallError::Rejected("unsupported api version".into())
        );
    }

    #[tokio::test]
    async fn test_response_error_stops_chain() {
        let mut first = MockFilter::new();
        let mut failing = MockFilter::new();
        let mut last = MockFilter::new();

        first.expect_on_response().never();
        failing
            .expect_on_response()
            .times(1)
            .returning(|_| Err(FilterCallError::ConnectionLost("plugin exited".into())));
        last.expect_on_response().times(1).returning(|args| {
            Ok(ResponseResult { body: args.body })
        });

        let chain = chain_of(vec![first, failing, last]);
        let err = chain
            .apply_response_filters(1, 2, b"body".to_vec())
            .await
            .unwrap_err();
        assert_eq!(err, FilterCallError::ConnectionLost("plugin exited".into()));
    }

    #[tokio::test]
    async fn test_empty_chain_is_identity() {
        let chain = FilterChain::empty();
        assert!(chain.is_empty());
        assert_eq!(chain.len(), 0);

        let body = chain
            .apply_request_filters(0, 0, b"untouched".to_vec())
            .await
            .unwrap();
        assert_eq!(body, b"untouched");
        let body = chain
            .apply_response_filters(0, 0, b"untouched".to_vec())
            .await
            .unwrap();
        assert_eq!(body, b"untouched");

        chain.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_single_filter_chain_both_directions() {
        let mut only = MockFilter::new();
        only.expect_on_request()
            .times(1)
            .returning(|_| Ok(RequestResult { body: b"req".to_vec() }));
        only.expect_on_response()
            .times(1)
            .returning(|_| Ok(ResponseResult { body: b"resp".to_vec() }));

        let chain = chain_of(vec![only]);
        assert_eq!(chain.names(), ["mock-0"]);
        assert_eq!(
            chain.apply_request_filters(1, 2, Vec::new()).await.unwrap(),
            b"req"
        );
        assert_eq!(
            chain.apply_response_filters(1, 2, Vec::new()).await.unwrap(),
            b"resp"
        );
    }

    #[tokio::test]
    async fn test_build_without_directory_is_empty() {
        let chain = FilterChain::build("").await.unwrap();
        assert!(chain.is_empty());

        let chain = FilterChain::build("/nonexistent/kafka-proxy-filters")
            .await
            .unwrap();
        assert!(chain.is_empty());
    }
}
