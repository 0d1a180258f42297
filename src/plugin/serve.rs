//! Plugin side of the filter protocol
//!
//! A plugin binary hands its [`Filter`] to [`serve`], which checks that it was
//! launched by a proxy, announces itself with the handshake line and then
//! answers calls on stdin/stdout until the proxy closes stdin.

use crate::filter::{Filter, RequestArgs, ResponseArgs};
use crate::plugin::handshake::{HandshakeConfig, HANDSHAKE};
use crate::plugin::schema::{
    DispenseArgs, RpcRequest, RpcResponse, DEFAULT_MAX_FRAME_BYTES, FILTER_ERROR,
    FILTER_PLUGIN_NAME, INVALID_PARAMS, METHOD_DISPENSE, METHOD_NOT_FOUND, METHOD_ON_REQUEST,
    METHOD_ON_RESPONSE,
};
use futures::{SinkExt, StreamExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::io;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec, LinesCodecError};
use tracing::{debug, warn};

const NOT_LAUNCHED_BY_HOST: &str = "This binary is a plugin. These are not meant to be executed \
directly. Please execute the program that consumes these plugins, which will load any plugins \
automatically";

/// Serve `filter` over this process's stdio using the standard handshake
pub async fn serve<F>(filter: F) -> io::Result<()>
where
    F: Filter + 'static,
{
    serve_with(filter, HANDSHAKE).await
}

/// Serve `filter` over this process's stdio with an explicit handshake
pub async fn serve_with<F>(filter: F, handshake: HandshakeConfig) -> io::Result<()>
where
    F: Filter + 'static,
{
    let cookie = std::env::var(handshake.magic_cookie_key).ok();
    if !handshake.cookie_matches(cookie.as_deref()) {
        return Err(io::Error::new(
            io::ErrorKind::PermissionDenied,
            NOT_LAUNCHED_BY_HOST,
        ));
    }

    let mut stdout = tokio::io::stdout();
    stdout
        .write_all(format!("{}\n", handshake.handshake_line()).as_bytes())
        .await?;
    stdout.flush().await?;

    serve_connection(
        tokio::io::stdin(),
        stdout,
        Arc::new(filter),
        DEFAULT_MAX_FRAME_BYTES,
    )
    .await
}

/// Answer filter calls arriving on `reader` until it reaches EOF.
///
/// Each call runs on its own task so a slow call never holds up the others;
/// responses are written as they complete.
pub async fn serve_connection<R, W>(
    reader: R,
    writer: W,
    filter: Arc<dyn Filter>,
    max_frame_bytes: usize,
) -> io::Result<()>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let mut frames = FramedRead::new(reader, LinesCodec::new_with_max_length(max_frame_bytes));
    let mut sink = FramedWrite::new(writer, LinesCodec::new());
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();

    let writer_task = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            sink.send(frame).await.map_err(codec_to_io)?;
        }
        Ok::<_, io::Error>(())
    });

    while let Some(frame) = frames.next().await {
        let line = frame.map_err(codec_to_io)?;
        if line.trim().is_empty() {
            continue;
        }

        let request: RpcRequest = match serde_json::from_str(&line) {
            Ok(request) => request,
            Err(e) => {
                warn!(error = %e, "Ignoring malformed frame from host");
                continue;
            }
        };

        let filter = filter.clone();
        let tx = tx.clone();
        tokio::spawn(async move {
            let response = handle_request(&*filter, request).await;
            match serde_json::to_string(&response) {
                Ok(frame) => {
                    let _ = tx.send(frame);
                }
                Err(e) => warn!(error = %e, "Failed to encode response"),
            }
        });
    }

    debug!("Host closed the connection");
    drop(tx);
    writer_task
        .await
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?
}

async fn handle_request(filter: &dyn Filter, request: RpcRequest) -> RpcResponse {
    let id = request.id;
    match request.method.as_str() {
        METHOD_DISPENSE => match parse_params::<DispenseArgs>(id, request.params) {
            Ok(args) if args.name == FILTER_PLUGIN_NAME => {
                RpcResponse::success(id, Value::Object(Default::default()))
            }
            Ok(args) => RpcResponse::failure(
                id,
                METHOD_NOT_FOUND,
                format!("unknown plugin {:?}", args.name),
            ),
            Err(response) => response,
        },
        METHOD_ON_REQUEST => match parse_params::<RequestArgs>(id, request.params) {
            Ok(args) => reply(id, filter.on_request(args).await),
            Err(response) => response,
        },
        METHOD_ON_RESPONSE => match parse_params::<ResponseArgs>(id, request.params) {
            Ok(args) => reply(id, filter.on_response(args).await),
            Err(response) => response,
        },
        other => RpcResponse::failure(id, METHOD_NOT_FOUND, format!("unknown method {other:?}")),
    }
}

fn parse_params<T: DeserializeOwned>(id: u64, params: Value) -> Result<T, RpcResponse> {
    serde_json::from_value(params)
        .map_err(|e| RpcResponse::failure(id, INVALID_PARAMS, format!("invalid params: {e}")))
}

fn reply<T: Serialize, E: std::fmt::Display>(id: u64, result: Result<T, E>) -> RpcResponse {
    match result {
        Ok(value) => match serde_json::to_value(value) {
            Ok(value) => RpcResponse::success(id, value),
            Err(e) => {
                RpcResponse::failure(id, FILTER_ERROR, format!("failed to encode result: {e}"))
            }
        },
        Err(e) => RpcResponse::failure(id, FILTER_ERROR, e.to_string()),
    }
}

fn codec_to_io(e: LinesCodecError) -> io::Error {
    match e {
        LinesCodecError::Io(e) => e,
        other => io::Error::new(io::ErrorKind::InvalidData, other),
    }
}
