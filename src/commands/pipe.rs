use crate::chain::FilterChain;
use crate::error::Result;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

/// Which half of the chain a piped body goes through
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum Direction {
    Request,
    Response,
    /// Request filters, then response filters on the result
    RoundTrip,
}

/// Read one body from `reader`, filter it and write the result to `writer`
pub async fn run_pipe<R, W>(
    chain: &FilterChain,
    direction: Direction,
    api_key: i16,
    api_version: i16,
    mut reader: R,
    mut writer: W,
) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut body = Vec::new();
    reader.read_to_end(&mut body).await?;
    debug!(size = body.len(), ?direction, "Filtering piped body");

    let body = match direction {
        Direction::Request => {
            chain
                .apply_request_filters(api_key, api_version, body)
                .await?
        }
        Direction::Response => {
            chain
                .apply_response_filters(api_key, api_version, body)
                .await?
        }
        Direction::RoundTrip => {
            let sent = chain
                .apply_request_filters(api_key, api_version, body)
                .await?;
            chain
                .apply_response_filters(api_key, api_version, sent)
                .await?
        }
    };

    writer.write_all(&body).await?;
    writer.flush().await?;
    Ok(())
}
