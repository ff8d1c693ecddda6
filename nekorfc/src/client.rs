use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::fs::{self, File};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;

use crate::frame::{receive_frame, send_frame};
use crate::message::{Request, Response};
use crate::peer::PeerCommand;
use crate::record;
use crate::registry::{Cookie, Peer};
use crate::rfc::Rfc;
use crate::tracker::TrackerCommand;
use crate::{Error, Result};

/// Client end of one framed connection
pub struct Connection {
    stream: TcpStream,

    /// Hostname sent in the `Host` header
    host: String,

    /// Bound on every wait for an incoming frame
    timeout: Option<Duration>,
}

impl Connection {
    pub async fn connect(addr: &str, host: &str) -> Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        Ok(Connection {
            stream,
            host: host.to_owned(),
            timeout: None,
        })
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub async fn send(&mut self, request: Request) -> Result<()> {
        let request = request.with_default_headers(&self.host);
        request.validate()?;
        tracing::debug!(%request, "sending request");
        send_frame(&mut self.stream, &request.encode()).await?;
        Ok(())
    }

    /// Next raw frame payload; empty once the remote side is done
    pub async fn receive_payload(&mut self) -> Result<Vec<u8>> {
        let read = receive_frame(&mut self.stream);
        let payload = match self.timeout {
            Some(timeout) => tokio::time::timeout(timeout, read)
                .await
                .map_err(|_| Error::Timeout)??,
            None => read.await?,
        };
        Ok(payload)
    }

    pub async fn receive(&mut self) -> Result<Response> {
        let payload = self.receive_payload().await?;
        if payload.is_empty() {
            return Err(Error::Closed);
        }
        Ok(Response::decode(&payload)?)
    }

    /// Send `request` and wait for a successful response
    pub async fn call(&mut self, request: Request) -> Result<Response> {
        self.send(request).await?;
        let response = self.receive().await?;
        if !response.is_ok() {
            return Err(Error::Rejected(response.status));
        }
        Ok(response)
    }

    pub async fn close(mut self) {
        let _ = self.stream.shutdown().await;
    }
}

/// Session with the tracker
///
/// The connection is opened by [TrackerClient::register] and dropped once the tracker ends the
/// session after [TrackerClient::leave].
pub struct TrackerClient {
    /// `host:port` of the tracker
    addr: String,

    /// Hostname and content server port this node registers with
    host: String,
    port: u16,

    timeout: Duration,
    conn: Option<Connection>,

    /// Record returned by the last register
    peer: Option<Peer>,
}

impl TrackerClient {
    pub fn new(addr: impl Into<String>, host: impl Into<String>, port: u16, timeout: Duration) -> Self {
        TrackerClient {
            addr: addr.into(),
            host: host.into(),
            port,
            timeout,
            conn: None,
            peer: None,
        }
    }

    pub fn peer(&self) -> Option<&Peer> {
        self.peer.as_ref()
    }

    pub fn cookie(&self) -> Option<Cookie> {
        self.peer.as_ref().map(|p| p.cookie)
    }

    pub fn is_connected(&self) -> bool {
        self.conn.is_some()
    }

    /// Register, opening a connection first if there is none
    pub async fn register(&mut self) -> Result<Peer> {
        if self.conn.is_none() {
            let conn = Connection::connect(&self.addr, &self.host).await?;
            self.conn = Some(conn.with_timeout(self.timeout));
        }
        let request = TrackerCommand::Register {
            hostname: self.host.clone(),
            port: self.port,
        }
        .into_request();

        let peer: Peer = self.call(request).await?;
        tracing::info!(cookie = peer.cookie, tracker = %self.addr, "registered with tracker");
        self.peer = Some(peer.clone());
        Ok(peer)
    }

    /// Leave the network; the tracker closes the connection afterwards
    pub async fn leave(&mut self) -> Result<()> {
        let cookie = self.cookie().ok_or(Error::NotRegistered)?;
        self.exchange(TrackerCommand::Leave { cookie }.into_request())
            .await?;
        self.close().await;
        tracing::info!(cookie, "left tracker");
        Ok(())
    }

    /// Every other active peer
    pub async fn pquery(&mut self) -> Result<Vec<Peer>> {
        let cookie = self.cookie().ok_or(Error::NotRegistered)?;
        let response = self
            .exchange(TrackerCommand::PQuery { cookie }.into_request())
            .await?;
        Ok(record::decode_list(&response.body)?)
    }

    pub async fn keep_alive(&mut self) -> Result<Peer> {
        let cookie = self.cookie().ok_or(Error::NotRegistered)?;
        let peer: Peer = self.call(TrackerCommand::KeepAlive { cookie }.into_request()).await?;
        self.peer = Some(peer.clone());
        Ok(peer)
    }

    pub async fn close(&mut self) {
        if let Some(conn) = self.conn.take() {
            conn.close().await;
        }
    }

    async fn call<T: serde::de::DeserializeOwned>(&mut self, request: Request) -> Result<T> {
        let response = self.exchange(request).await?;
        Ok(record::decode(&response.body)?)
    }

    /// One request/response on the open connection, dropping it if the exchange broke off
    ///
    /// The next [TrackerClient::register] reconnects.
    async fn exchange(&mut self, request: Request) -> Result<Response> {
        let conn = self.conn.as_mut().ok_or(Error::NotRegistered)?;
        let result = conn.call(request).await;
        if let Err(e) = &result {
            if e.breaks_connection() {
                tracing::warn!(tracker = %self.addr, error = %e, "dropping tracker connection");
                self.close().await;
            }
        }
        result
    }
}

/// A downloaded RFC
#[derive(Debug, Clone)]
pub struct Download {
    pub rfc: Rfc,

    /// Where the content was written
    pub path: PathBuf,
    pub bytes: u64,
}

/// Short-lived connection to another peer's content server
///
/// The connection is dropped once an exchange breaks off; later calls fail with [Error::Closed].
pub struct PeerClient {
    conn: Option<Connection>,
}

impl PeerClient {
    pub async fn connect(addr: &str, host: &str) -> Result<Self> {
        Ok(PeerClient {
            conn: Some(Connection::connect(addr, host).await?),
        })
    }

    pub fn with_timeout(self, timeout: Duration) -> Self {
        PeerClient {
            conn: self.conn.map(|conn| conn.with_timeout(timeout)),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.conn.is_some()
    }

    /// The remote peer's whole catalog
    pub async fn rfc_query(&mut self) -> Result<Vec<Rfc>> {
        let conn = self.conn.as_mut().ok_or(Error::Closed)?;
        let result = conn.call(PeerCommand::RfcQuery.into_request()).await;
        let response = self.check(result)?;
        Ok(record::decode_list(&response.body)?)
    }

    /// Fetch RFC `number` into `dir`, keeping the owner's file name
    ///
    /// Content goes to a `.part` file that is renamed once complete and removed otherwise.
    pub async fn get_rfc(&mut self, number: u32, dir: &Path) -> Result<Download> {
        let conn = self.conn.as_mut().ok_or(Error::Closed)?;
        let result = fetch(conn, number, dir).await;
        if let Err(e) = &result {
            // only a refusal or a stream ended at its empty frame leaves the connection in step
            if !matches!(e, Error::Rejected(_) | Error::IncompleteContent { .. }) {
                self.drop_conn().await;
            }
        }
        result
    }

    /// Tell the remote peer to stop serving this connection
    pub async fn leave(self) -> Result<()> {
        let Some(mut conn) = self.conn else {
            return Ok(());
        };
        conn.send(PeerCommand::Leave.into_request()).await?;
        conn.close().await;
        Ok(())
    }

    fn check(&mut self, result: Result<Response>) -> Result<Response> {
        if let Err(e) = &result {
            if e.breaks_connection() {
                self.conn = None;
            }
        }
        result
    }

    async fn drop_conn(&mut self) {
        if let Some(conn) = self.conn.take() {
            conn.close().await;
        }
    }
}

async fn fetch(conn: &mut Connection, number: u32, dir: &Path) -> Result<Download> {
    let response = conn
        .call(PeerCommand::GetRfc { number }.into_request())
        .await?;
    let rfc: Rfc = record::decode(&response.body)?;
    let expected: Option<u64> = response
        .headers
        .get("Content-Size")
        .and_then(|s| s.parse().ok());

    fs::create_dir_all(dir).await?;
    let path = dir.join(rfc.file_name());
    let partial = partial_path(&path);

    let bytes = match receive_content(conn, &partial, expected).await {
        Ok(bytes) => bytes,
        Err(e) => {
            let _ = fs::remove_file(&partial).await;
            return Err(e);
        }
    };
    if let Err(e) = fs::rename(&partial, &path).await {
        let _ = fs::remove_file(&partial).await;
        return Err(e.into());
    }

    tracing::info!(rfc = number, path = %path.display(), bytes, "downloaded rfc");
    Ok(Download { rfc, path, bytes })
}

/// Write content frames to `path` up to the empty frame, checking the total against `expected`
async fn receive_content(
    conn: &mut Connection,
    path: &Path,
    expected: Option<u64>,
) -> Result<u64> {
    let mut file = File::create(path).await?;
    let mut bytes = 0;
    loop {
        let chunk = conn.receive_payload().await?;
        if chunk.is_empty() {
            break;
        }
        file.write_all(&chunk).await?;
        bytes += chunk.len() as u64;
    }
    file.flush().await?;

    match expected {
        Some(expected) if expected != bytes => Err(Error::IncompleteContent {
            expected,
            got: bytes,
        }),
        _ => Ok(bytes),
    }
}

fn partial_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".part");
    PathBuf::from(name)
}
