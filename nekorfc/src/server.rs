use std::net::SocketAddr;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use crate::frame::{receive_frame, send_frame, READ_CHUNK};
use crate::message::{Request, Response};
use crate::{Outcome, Result, Service};

/// Why a request could not be turned into a command. Answered with a 403.
#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error("unknown command {0:?}")]
    Unknown(String),
    #[error("missing {0} header")]
    MissingHeader(&'static str),
    #[error("invalid {name} header {value:?}")]
    InvalidHeader { name: &'static str, value: String },
}

/// Read and parse a required header
pub(crate) fn header<T: std::str::FromStr>(
    request: &Request,
    name: &'static str,
) -> std::result::Result<T, CommandError> {
    let value = request
        .headers
        .get(name)
        .ok_or(CommandError::MissingHeader(name))?;
    value.parse().map_err(|_| CommandError::InvalidHeader {
        name,
        value: value.to_owned(),
    })
}

/// Accept connections forever, building one service per connection with `factory`
pub async fn serve<S, F>(listener: TcpListener, factory: F)
where
    S: Service,
    F: Fn(SocketAddr) -> S,
{
    loop {
        let (stream, addr) = match listener.accept().await {
            Ok(conn) => conn,
            // Ignore accept errors.
            Err(e) => {
                tracing::warn!(error = %e, "accept failed");
                continue;
            }
        };
        tracing::debug!(peer = %addr, "accepted connection");
        tokio::spawn(handle_connection(factory(addr), stream, addr));
    }
}

/// Serve one connection until it ends, logging instead of propagating failures
pub async fn handle_connection<S: Service>(mut service: S, mut stream: TcpStream, addr: SocketAddr) {
    match run_connection(&mut service, &mut stream).await {
        Ok(()) => tracing::debug!(peer = %addr, "connection closed"),
        Err(e) => tracing::warn!(peer = %addr, error = %e, "connection aborted"),
    }
    let _ = stream.shutdown().await;
}

/// Receive, dispatch and answer requests in order until the stream ends or the service closes it
pub async fn run_connection<S, T>(service: &mut S, stream: &mut T) -> Result<()>
where
    S: Service,
    T: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        let payload = receive_frame(stream).await?;
        if payload.is_empty() {
            return Ok(());
        }

        let request = Request::decode(&payload)?;
        tracing::debug!(%request, "handling request");

        match service.handle(request).await {
            Outcome::Reply(response) => {
                send_response(stream, &response).await?;
            }
            Outcome::Stream(response, mut file) => {
                send_response(stream, &response).await?;
                let sent = send_stream(&mut file, stream).await?;
                tracing::debug!(bytes = sent, "streamed content");
            }
            Outcome::Close(response) => {
                if let Some(response) = response {
                    send_response(stream, &response).await?;
                }
                return Ok(());
            }
        }
    }
}

async fn send_response<W: AsyncWrite + Unpin>(writer: &mut W, response: &Response) -> Result<()> {
    tracing::debug!(%response, "sending response");
    send_frame(writer, &response.encode()).await?;
    Ok(())
}

/// Copy `reader` to `writer` as raw frames of at most [READ_CHUNK] bytes, then an empty frame
pub async fn send_stream<R, W>(reader: &mut R, writer: &mut W) -> Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut chunk = [0u8; READ_CHUNK];
    let mut total = 0;
    loop {
        let n = reader.read(&mut chunk).await?;
        send_frame(writer, &chunk[..n]).await?;
        if n == 0 {
            return Ok(total);
        }
        total += n as u64;
    }
}
