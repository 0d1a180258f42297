//! Multiplexed RPC client bound to one plugin process
//!
//! Any number of tasks may call into the same plugin at once. Each call gets a
//! fresh id and parks on a oneshot channel; a single background reader routes
//! responses back by id. When the plugin's output ends, every parked call and
//! every later call fails with [`FilterCallError::ConnectionLost`]. Frames that
//! cannot be read as responses fail with [`FilterCallError::Protocol`]: only
//! the addressed call if its id is recoverable, otherwise every call.

use crate::error::FilterCallError;
use crate::plugin::schema::{RpcRequest, RpcResponse, FILTER_ERROR};
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec, LinesCodecError};
use tracing::{debug, warn};

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;
type PendingCalls = DashMap<u64, oneshot::Sender<Result<Value, FilterCallError>>>;

pub struct RpcClient {
    writer: Mutex<Option<FramedWrite<BoxedWriter, LinesCodec>>>,
    pending: Arc<PendingCalls>,
    next_id: AtomicU64,
    closed: Arc<AtomicBool>,
    reader: JoinHandle<()>,
}

impl RpcClient {
    /// Wrap an already-framed plugin output and the plugin's input.
    ///
    /// The reader is taken framed because the handshake line is consumed from
    /// the same stream before RPC traffic starts.
    pub fn new<R, W>(reader: FramedRead<R, LinesCodec>, writer: W) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let pending = Arc::new(PendingCalls::new());
        let closed = Arc::new(AtomicBool::new(false));
        let writer: BoxedWriter = Box::new(writer);

        let reader = tokio::spawn(read_loop(reader, pending.clone(), closed.clone()));

        Self {
            writer: Mutex::new(Some(FramedWrite::new(writer, LinesCodec::new()))),
            pending,
            next_id: AtomicU64::new(1),
            closed,
            reader,
        }
    }

    /// Build a client over a raw byte stream pair
    pub fn connect<R, W>(reader: R, writer: W, max_frame_bytes: usize) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        Self::new(
            FramedRead::new(reader, LinesCodec::new_with_max_length(max_frame_bytes)),
            writer,
        )
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Issue one call and wait for its response
    pub async fn call<P, T>(&self, method: &str, params: &P) -> Result<T, FilterCallError>
    where
        P: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        if self.is_closed() {
            return Err(closed_error());
        }

        let params = serde_json::to_value(params).map_err(|e| {
            FilterCallError::Protocol(format!("failed to encode {method} params: {e}"))
        })?;
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let frame = serde_json::to_string(&RpcRequest::new(id, method, params)).map_err(|e| {
            FilterCallError::Protocol(format!("failed to encode {method} request: {e}"))
        })?;

        let (tx, rx) = oneshot::channel();
        self.pending.insert(id, tx);
        // Unregisters the call however it ends, including when the caller
        // drops this future while the plugin has not answered yet.
        let _registration = Registration {
            pending: &*self.pending,
            id,
        };

        // The reader marks the client closed before failing pending calls, so a
        // call registered after that sweep is caught here.
        if self.is_closed() {
            return Err(closed_error());
        }

        {
            let mut writer = self.writer.lock().await;
            let Some(writer) = writer.as_mut() else {
                return Err(closed_error());
            };
            if let Err(e) = writer.send(frame).await {
                return Err(FilterCallError::ConnectionLost(format!(
                    "failed to send {method}: {e}"
                )));
            }
        }

        let value = rx
            .await
            .map_err(|_| FilterCallError::ConnectionLost("call abandoned by client".into()))??;

        serde_json::from_value(value).map_err(|e| {
            FilterCallError::Protocol(format!("invalid {method} result from plugin: {e}"))
        })
    }

    /// Stop routing responses and fail every outstanding call
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.reader.abort();
        fail_pending(&self.pending, &closed_error());

        // Dropping the sink gives the plugin EOF on stdin. Skip it if a writer
        // is mid-send; the process is about to be terminated anyway.
        if let Ok(mut writer) = self.writer.try_lock() {
            writer.take();
        }
    }
}

impl Drop for RpcClient {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

async fn read_loop<R>(
    mut reader: FramedRead<R, LinesCodec>,
    pending: Arc<PendingCalls>,
    closed: Arc<AtomicBool>,
) where
    R: AsyncRead + Unpin + Send + 'static,
{
    let failure = loop {
        match reader.next().await {
            Some(Ok(line)) => {
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<RpcResponse>(&line) {
                    Ok(response) => dispatch(&pending, response),
                    Err(e) => {
                        let error = FilterCallError::Protocol(format!(
                            "malformed response from plugin: {e}"
                        ));
                        match recover_id(&line) {
                            Some(id) => {
                                warn!(id, error = %e, "Malformed response from plugin");
                                if let Some((_, tx)) = pending.remove(&id) {
                                    let _ = tx.send(Err(error));
                                }
                            }
                            // Without an id the stream can no longer be trusted.
                            None => break error,
                        }
                    }
                }
            }
            Some(Err(LinesCodecError::MaxLineLengthExceeded)) => {
                break FilterCallError::Protocol(
                    "plugin sent a frame larger than the configured maximum".to_string(),
                )
            }
            Some(Err(e)) => {
                break FilterCallError::ConnectionLost(format!(
                    "failed to read from plugin: {e}"
                ))
            }
            None => {
                break FilterCallError::ConnectionLost("plugin closed its output".to_string())
            }
        }
    };

    debug!(reason = %failure, "Plugin reader stopped");
    closed.store(true, Ordering::SeqCst);
    fail_pending(&pending, &failure);
}

/// Best-effort id of a frame that is not a well-formed response
fn recover_id(line: &str) -> Option<u64> {
    let frame: Value = serde_json::from_str(line).ok()?;
    match frame.get("id")? {
        Value::Number(id) => id.as_u64(),
        Value::String(id) => id.parse().ok(),
        _ => None,
    }
}

fn dispatch(pending: &PendingCalls, response: RpcResponse) {
    let Some((_, tx)) = pending.remove(&response.id) else {
        warn!(id = response.id, "Response for unknown call from plugin");
        return;
    };

    let outcome = match response.error {
        Some(err) if err.code == FILTER_ERROR => Err(FilterCallError::Rejected(err.message)),
        Some(err) => Err(FilterCallError::Protocol(format!(
            "{} (code {})",
            err.message, err.code
        ))),
        None => Ok(response.result.unwrap_or(Value::Null)),
    };

    // The caller may have given up on the call; nothing to do then.
    let _ = tx.send(outcome);
}

fn fail_pending(pending: &PendingCalls, error: &FilterCallError) {
    let ids: Vec<u64> = pending.iter().map(|entry| *entry.key()).collect();
    for id in ids {
        if let Some((_, tx)) = pending.remove(&id) {
            let _ = tx.send(Err(error.clone()));
        }
    }
}

struct Registration<'a> {
    pending: &'a PendingCalls,
    id: u64,
}

impl Drop for Registration<'_> {
    fn drop(&mut self) {
        self.pending.remove(&self.id);
    }
}

fn closed_error() -> FilterCallError {
    FilterCallError::ConnectionLost("plugin connection closed".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::{
        Filter, MockFilter, RequestArgs, RequestResult, ResponseArgs, ResponseResult,
    };
    use crate::plugin::schema::{
        DispenseArgs, DEFAULT_MAX_FRAME_BYTES, METHOD_DISPENSE, METHOD_ON_REQUEST,
        METHOD_ON_RESPONSE,
    };
    use crate::plugin::serve::serve_connection;
    use async_trait::async_trait;
    use mockall::predicate::eq;
    use std::time::Duration;
    use tokio::io::{AsyncWriteExt, DuplexStream, ReadHalf, WriteHalf};

    type Requests = FramedRead<ReadHalf<DuplexStream>, LinesCodec>;

    /// Client talking to a hand-driven plugin: the test reads the raw request
    /// frames and writes whatever reply bytes it wants.
    fn scripted_plugin(
        max_frame_bytes: usize,
    ) -> (Arc<RpcClient>, Requests, WriteHalf<DuplexStream>) {
        let (client_io, server_io) = tokio::io::duplex(64 * 1024);
        let (server_read, server_write) = tokio::io::split(server_io);
        let (client_read, client_write) = tokio::io::split(client_io);
        let client = Arc::new(RpcClient::connect(
            client_read,
            client_write,
            max_frame_bytes,
        ));
        (
            client,
            FramedRead::new(server_read, LinesCodec::new()),
            server_write,
        )
    }

    async fn send_frame(replies: &mut WriteHalf<DuplexStream>, frame: Value) {
        let line = format!("{}\n", serde_json::to_string(&frame).unwrap());
        replies.write_all(line.as_bytes()).await.unwrap();
    }

    fn spawn_request(
        client: &Arc<RpcClient>,
    ) -> tokio::task::JoinHandle<Result<RequestResult, FilterCallError>> {
        let client = client.clone();
        tokio::spawn(async move {
            client
                .call(
                    METHOD_ON_REQUEST,
                    &RequestArgs {
                        api_key: 0,
                        api_version: 0,
                        body: vec![9],
                    },
                )
                .await
        })
    }

    async fn next_request(requests: &mut Requests) -> RpcRequest {
        let line = requests.next().await.unwrap().unwrap();
        serde_json::from_str(&line).unwrap()
    }

    /// Connect a client to a plugin-side server over an in-memory pipe
    fn pipe_to(filter: Arc<dyn Filter>) -> Arc<RpcClient> {
        let (client_io, server_io) = tokio::io::duplex(64 * 1024);
        let (server_read, server_write) = tokio::io::split(server_io);
        tokio::spawn(serve_connection(
            server_read,
            server_write,
            filter,
            DEFAULT_MAX_FRAME_BYTES,
        ));

        let (client_read, client_write) = tokio::io::split(client_io);
        Arc::new(RpcClient::connect(
            client_read,
            client_write,
            DEFAULT_MAX_FRAME_BYTES,
        ))
    }

    /// Echoes bodies back after sleeping for as many milliseconds as the first byte
    struct SlowEcho;

    #[async_trait]
    impl Filter for SlowEcho {
        async fn on_request(&self, args: RequestArgs) -> Result<RequestResult, FilterCallError> {
            let delay = args.body.first().copied().unwrap_or(0);
            tokio::time::sleep(Duration::from_millis(delay as u64)).await;
            Ok(RequestResult { body: args.body })
        }

        async fn on_response(
            &self,
            args: ResponseArgs,
        ) -> Result<ResponseResult, FilterCallError> {
            Ok(ResponseResult { body: args.body })
        }
    }

    #[tokio::test]
    async fn test_filter_calls_over_rpc() {
        let mut mock = MockFilter::new();
        mock.expect_on_request()
            .with(eq(RequestArgs {
                api_key: 1,
                api_version: 2,
                body: b"request".to_vec(),
            }))
            .times(1)
            .returning(|_| {
                Ok(RequestResult {
                    body: b"modified request".to_vec(),
                })
            });
        mock.expect_on_response()
            .with(eq(ResponseArgs {
                api_key: 1,
                api_version: 2,
                body: b"response".to_vec(),
            }))
            .times(1)
            .returning(|_| {
                Ok(ResponseResult {
                    body: b"modified response".to_vec(),
                })
            });

        let client = pipe_to(Arc::new(mock));

        let result: RequestResult = client
            .call(
                METHOD_ON_REQUEST,
                &RequestArgs {
                    api_key: 1,
                    api_version: 2,
                    body: b"request".to_vec(),
                },
            )
            .await
            .unwrap();
        assert_eq!(result.body, b"modified request");

        let result: ResponseResult = client
            .call(
                METHOD_ON_RESPONSE,
                &ResponseArgs {
                    api_key: 1,
                    api_version: 2,
                    body: b"response".to_vec(),
                },
            )
            .await
            .unwrap();
        assert_eq!(result.body, b"modified response");
    }

    #[tokio::test]
    async fn test_filter_error_is_passed_through_verbatim() {
        let mut mock = MockFilter::new();
        mock.expect_on_request()
            .returning(|_| {
                Err(FilterCallError::Rejected(
                    "quota exceeded for topic orders".into(),
                ))
            });

        let client = pipe_to(Arc::new(mock));
        let err = client
            .call::<_, RequestResult>(
                METHOD_ON_REQUEST,
                &RequestArgs {
                    api_key: 0,
                    api_version: 9,
                    body: vec![1, 2, 3],
                },
            )
            .await
            .unwrap_err();

        assert_eq!(
            err,
            FilterCallError::Rejected("quota exceeded for topic orders".into())
        );
    }

    #[tokio::test]
    async fn test_dispense() {
        let client = pipe_to(Arc::new(MockFilter::new()));

        let ok: Value = client
            .call(
                METHOD_DISPENSE,
                &DispenseArgs {
                    name: "filter".into(),
                },
            )
            .await
            .unwrap();
        assert!(ok.is_object());

        let err = client
            .call::<_, Value>(
                METHOD_DISPENSE,
                &DispenseArgs {
                    name: "authorizer".into(),
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, FilterCallError::Protocol(ref msg) if msg.contains("authorizer")));
    }

    #[tokio::test]
    async fn test_unknown_method_is_protocol_error() {
        let client = pipe_to(Arc::new(MockFilter::new()));
        let err = client
            .call::<_, Value>("Plugin.OnFetch", &serde_json::json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, FilterCallError::Protocol(ref msg) if msg.contains("-32601")));
    }

    #[tokio::test]
    async fn test_concurrent_calls_are_correlated() {
        let client = pipe_to(Arc::new(SlowEcho));

        // Later calls finish first, so responses arrive in reverse order.
        let calls = (0u8..16).map(|i| {
            let client = client.clone();
            async move {
                let body = vec![(16 - i) * 3, i];
                let result: RequestResult = client
                    .call(
                        METHOD_ON_REQUEST,
                        &RequestArgs {
                            api_key: i as i16,
                            api_version: 0,
                            body: body.clone(),
                        },
                    )
                    .await
                    .unwrap();
                (body, result.body)
            }
        });

        for (sent, received) in futures::future::join_all(calls).await {
            assert_eq!(sent, received);
        }
    }

    #[tokio::test]
    async fn test_lost_connection_fails_pending_call() {
        let (client_io, server_io) = tokio::io::duplex(64 * 1024);
        let (client_read, client_write) = tokio::io::split(client_io);
        let client = Arc::new(RpcClient::connect(
            client_read,
            client_write,
            DEFAULT_MAX_FRAME_BYTES,
        ));

        let call = {
            let client = client.clone();
            tokio::spawn(async move {
                client
                    .call::<_, RequestResult>(
                        METHOD_ON_REQUEST,
                        &RequestArgs {
                            api_key: 0,
                            api_version: 0,
                            body: Vec::new(),
                        },
                    )
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(server_io);

        let err = call.await.unwrap().unwrap_err();
        assert!(matches!(err, FilterCallError::ConnectionLost(_)), "{err:?}");

        // Everything after the loss fails fast as well.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(client.is_closed());
        let err = client
            .call::<_, Value>(METHOD_DISPENSE, &serde_json::json!({"Name": "filter"}))
            .await
            .unwrap_err();
        assert!(matches!(err, FilterCallError::ConnectionLost(_)));
    }

    #[tokio::test]
    async fn test_close_rejects_new_calls() {
        let client = pipe_to(Arc::new(SlowEcho));
        client.close();
        client.close();

        let err = client
            .call::<_, RequestResult>(
                METHOD_ON_REQUEST,
                &RequestArgs {
                    api_key: 0,
                    api_version: 0,
                    body: vec![0],
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, FilterCallError::ConnectionLost(_)));
    }

    #[tokio::test]
    async fn test_reply_without_version_field_is_accepted() {
        let (client, mut requests, mut replies) = scripted_plugin(DEFAULT_MAX_FRAME_BYTES);
        let call = spawn_request(&client);

        let request = next_request(&mut requests).await;
        send_frame(
            &mut replies,
            serde_json::json!({"id": request.id, "result": {"Body": [1]}}),
        )
        .await;

        let result = tokio::time::timeout(Duration::from_secs(2), call)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(result.body, vec![1]);
    }

    #[tokio::test]
    async fn test_malformed_reply_fails_only_its_call() {
        let (client, mut requests, mut replies) = scripted_plugin(DEFAULT_MAX_FRAME_BYTES);
        let call = spawn_request(&client);

        // A string id is not a valid response id but still names the call.
        let request = next_request(&mut requests).await;
        send_frame(
            &mut replies,
            serde_json::json!({
                "jsonrpc": "2.0",
                "id": request.id.to_string(),
                "error": {"code": -32000, "message": "no"}
            }),
        )
        .await;

        let err = tokio::time::timeout(Duration::from_secs(2), call)
            .await
            .unwrap()
            .unwrap()
            .unwrap_err();
        assert!(matches!(err, FilterCallError::Protocol(_)), "{err:?}");
        assert!(!client.is_closed());

        // The connection stays usable for well-formed traffic.
        let call = spawn_request(&client);
        let request = next_request(&mut requests).await;
        let reply = RpcResponse::success(request.id, serde_json::json!({"Body": [2]}));
        send_frame(&mut replies, serde_json::to_value(reply).unwrap()).await;

        let result = tokio::time::timeout(Duration::from_secs(2), call)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(result.body, vec![2]);
    }

    #[tokio::test]
    async fn test_reply_without_id_fails_all_calls() {
        let (client, mut requests, mut replies) = scripted_plugin(DEFAULT_MAX_FRAME_BYTES);
        let first = spawn_request(&client);
        let second = spawn_request(&client);
        next_request(&mut requests).await;
        next_request(&mut requests).await;

        replies.write_all(b"this is not json\n").await.unwrap();

        for call in [first, second] {
            let err = tokio::time::timeout(Duration::from_secs(2), call)
                .await
                .unwrap()
                .unwrap()
                .unwrap_err();
            assert!(matches!(err, FilterCallError::Protocol(_)), "{err:?}");
        }
        assert!(client.is_closed());
    }

    #[tokio::test]
    async fn test_oversized_frame_is_protocol_error() {
        let (client, mut requests, mut replies) = scripted_plugin(1024);
        let call = spawn_request(&client);
        next_request(&mut requests).await;

        let mut frame = vec![b'x'; 4096];
        frame.push(b'\n');
        replies.write_all(&frame).await.unwrap();

        let err = tokio::time::timeout(Duration::from_secs(2), call)
            .await
            .unwrap()
            .unwrap()
            .unwrap_err();
        assert!(matches!(err, FilterCallError::Protocol(_)), "{err:?}");
    }

    #[tokio::test]
    async fn test_abandoned_call_is_unregistered() {
        let (client, mut requests, _replies) = scripted_plugin(DEFAULT_MAX_FRAME_BYTES);

        let args = RequestArgs {
            api_key: 0,
            api_version: 0,
            body: Vec::new(),
        };
        let call = client.call::<_, RequestResult>(METHOD_ON_REQUEST, &args);
        let outcome = tokio::time::timeout(Duration::from_millis(50), call).await;
        assert!(outcome.is_err());

        next_request(&mut requests).await;
        assert!(client.pending.is_empty());
    }
}
