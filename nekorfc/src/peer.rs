use std::net::SocketAddr;
use std::sync::Arc;

use tokio::fs::File;

use crate::message::{Request, Response};
use crate::record;
use crate::rfc::{Catalog, Rfc};
use crate::server::{header, CommandError};
use crate::{Outcome, Service};

/// Requests understood by a peer's content server
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerCommand {
    RfcQuery,
    GetRfc { number: u32 },
    Leave,
}

impl PeerCommand {
    pub fn into_request(self) -> Request {
        match self {
            PeerCommand::RfcQuery => Request::new("RFCQuery", "/"),
            PeerCommand::GetRfc { number } => {
                Request::new("GetRFC", "/").header("RFC-Number", number)
            }
            PeerCommand::Leave => Request::new("Leave", "/"),
        }
    }
}

impl TryFrom<&Request> for PeerCommand {
    type Error = CommandError;

    fn try_from(request: &Request) -> Result<Self, Self::Error> {
        match request.command.to_ascii_lowercase().as_str() {
            "rfcquery" => Ok(PeerCommand::RfcQuery),
            "getrfc" => Ok(PeerCommand::GetRfc {
                number: header(request, "RFC-Number")?,
            }),
            "leave" => Ok(PeerCommand::Leave),
            _ => Err(CommandError::Unknown(request.command.clone())),
        }
    }
}

/// Reference content server implementation, one per connection
#[derive(Clone)]
pub struct PeerServer {
    /// Address of remote peer
    addr: SocketAddr,

    /// Catalog shared between all connections
    catalog: Arc<Catalog>,
}

impl PeerServer {
    /// Create a new [PeerServer] serving `catalog` to the remote peer at `addr`
    pub fn new(addr: SocketAddr, catalog: &Arc<Catalog>) -> Self {
        PeerServer {
            addr,
            catalog: Arc::clone(catalog),
        }
    }

    fn rfc_query(&self) -> Outcome {
        tracing::debug!(peer = %self.addr, rfcs = self.catalog.len(), "rfc query");
        match record::encode_list(self.catalog.iter()) {
            Ok(body) => Outcome::Reply(Response::ok().body(body)),
            Err(e) => {
                tracing::warn!(error = %e, "failed to encode catalog");
                Outcome::Reply(Response::forbidden())
            }
        }
    }

    async fn get_rfc(&self, number: u32) -> Outcome {
        let Some(rfc) = self.catalog.get(number) else {
            tracing::debug!(peer = %self.addr, rfc = number, "rfc not in catalog");
            return Outcome::Reply(Response::forbidden());
        };
        let (file, size) = match open(rfc).await {
            Ok(opened) => opened,
            Err(e) => {
                tracing::warn!(rfc = number, path = %rfc.path.display(), error = %e, "rfc unreadable");
                return Outcome::Reply(Response::forbidden());
            }
        };
        let body = match record::encode(rfc) {
            Ok(body) => body,
            Err(e) => {
                tracing::warn!(rfc = number, error = %e, "failed to encode rfc");
                return Outcome::Reply(Response::forbidden());
            }
        };

        tracing::info!(peer = %self.addr, rfc = number, bytes = size, "sending rfc");
        // metadata first, the content follows as raw frames
        Outcome::Stream(Response::ok().header("Content-Size", size).body(body), file)
    }
}

/// Open the content of `rfc`, which must be a regular file
async fn open(rfc: &Rfc) -> std::io::Result<(File, u64)> {
    let file = File::open(&rfc.path).await?;
    let meta = file.metadata().await?;
    if !meta.is_file() {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            "not a regular file",
        ));
    }
    Ok((file, meta.len()))
}

impl Service for PeerServer {
    async fn handle(&mut self, request: Request) -> Outcome {
        let command = match PeerCommand::try_from(&request) {
            Ok(command) => command,
            Err(e) => {
                tracing::warn!(peer = %self.addr, error = %e, "rejected request");
                return Outcome::Reply(Response::forbidden());
            }
        };
        match command {
            PeerCommand::RfcQuery => self.rfc_query(),
            PeerCommand::GetRfc { number } => self.get_rfc(number).await,
            PeerCommand::Leave => {
                tracing::debug!(peer = %self.addr, "peer left");
                Outcome::Close(None)
            }
        }
    }
}
