use std::net::SocketAddr;
use std::sync::Arc;

use serde::Deserialize;

use crate::message::{Request, Response};
use crate::record;
use crate::registry::{Cookie, PeerRegistry, DEFAULT_TTL};
use crate::server::{header, CommandError};
use crate::{Outcome, Service};

/// Well-known tracker port
pub const DEFAULT_PORT: u16 = 65243;

/// [TrackerServer] config values
#[derive(Debug, Clone, Deserialize)]
pub struct TrackerConfig {
    /// Host
    #[serde(default = "default_host")]
    pub host: String,

    /// [TrackerServer] Port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Sweeps a peer survives without a refresh
    #[serde(default = "default_ttl")]
    pub ttl: u32,

    /// Seconds between sweeps
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
}

fn default_host() -> String {
    "localhost".to_owned()
}
fn default_port() -> u16 {
    DEFAULT_PORT
}
fn default_ttl() -> u32 {
    DEFAULT_TTL
}
fn default_sweep_interval() -> u64 {
    1
}

impl Default for TrackerConfig {
    fn default() -> Self {
        TrackerConfig {
            host: default_host(),
            port: default_port(),
            ttl: default_ttl(),
            sweep_interval_secs: default_sweep_interval(),
        }
    }
}

/// Requests understood by the tracker
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrackerCommand {
    Register { hostname: String, port: u16 },
    Leave { cookie: Cookie },
    PQuery { cookie: Cookie },
    KeepAlive { cookie: Cookie },
}

impl TrackerCommand {
    pub fn into_request(self) -> Request {
        match self {
            TrackerCommand::Register { hostname, port } => {
                Request::new("Register", hostname).header("Port", port)
            }
            TrackerCommand::Leave { cookie } => {
                Request::new("Leave", "/").header("Peer-Cookie", cookie)
            }
            TrackerCommand::PQuery { cookie } => {
                Request::new("PQuery", "/").header("Peer-Cookie", cookie)
            }
            TrackerCommand::KeepAlive { cookie } => {
                Request::new("KeepAlive", "/").header("Peer-Cookie", cookie)
            }
        }
    }
}

impl TryFrom<&Request> for TrackerCommand {
    type Error = CommandError;

    fn try_from(request: &Request) -> Result<Self, Self::Error> {
        match request.command.to_ascii_lowercase().as_str() {
            "register" => Ok(TrackerCommand::Register {
                hostname: request.target.clone(),
                port: header(request, "Port")?,
            }),
            "leave" => Ok(TrackerCommand::Leave {
                cookie: header(request, "Peer-Cookie")?,
            }),
            "pquery" => Ok(TrackerCommand::PQuery {
                cookie: header(request, "Peer-Cookie")?,
            }),
            "keepalive" => Ok(TrackerCommand::KeepAlive {
                cookie: header(request, "Peer-Cookie")?,
            }),
            _ => Err(CommandError::Unknown(request.command.clone())),
        }
    }
}

/// Reference tracker implementation, one per connection
#[derive(Clone)]
pub struct TrackerServer {
    /// Address of the remote peer
    addr: SocketAddr,

    /// Registry shared between all connections and the sweeper
    registry: Arc<PeerRegistry>,
}

impl TrackerServer {
    /// Create a new [TrackerServer] for `addr` with a shared `registry`
    pub fn new(addr: SocketAddr, registry: &Arc<PeerRegistry>) -> Self {
        TrackerServer {
            addr,
            registry: Arc::clone(registry),
        }
    }

    fn dispatch(&self, command: TrackerCommand) -> serde_json::Result<Outcome> {
        let outcome = match command {
            TrackerCommand::Register { hostname, port } => {
                let peer = self.registry.register(&hostname, port);
                tracing::info!(
                    cookie = peer.cookie,
                    peer = %peer.endpoint(),
                    from = %self.addr,
                    "registered peer"
                );
                Outcome::Reply(Response::ok().body(record::encode(&peer)?))
            }
            TrackerCommand::Leave { cookie } => match self.registry.leave(cookie) {
                Some(peer) => {
                    tracing::info!(cookie, peer = %peer.endpoint(), "peer left");
                    Outcome::Close(Some(Response::ok()))
                }
                None => Outcome::Reply(Response::forbidden()),
            },
            TrackerCommand::PQuery { cookie } => match self.registry.query(cookie) {
                Some(peers) => {
                    tracing::debug!(cookie, active = peers.len(), "peer query");
                    Outcome::Reply(Response::ok().body(record::encode_list(&peers)?))
                }
                None => Outcome::Reply(Response::forbidden()),
            },
            TrackerCommand::KeepAlive { cookie } => match self.registry.keep_alive(cookie) {
                Some(peer) => {
                    tracing::debug!(cookie, "keep alive");
                    Outcome::Reply(Response::ok().body(record::encode(&peer)?))
                }
                None => Outcome::Reply(Response::forbidden()),
            },
        };
        Ok(outcome)
    }
}

impl Service for TrackerServer {
    async fn handle(&mut self, request: Request) -> Outcome {
        let command = match TrackerCommand::try_from(&request) {
            Ok(command) => command,
            Err(e) => {
                tracing::warn!(peer = %self.addr, error = %e, "rejected request");
                return Outcome::Reply(Response::forbidden());
            }
        };
        self.dispatch(command).unwrap_or_else(|e| {
            tracing::warn!(peer = %self.addr, error = %e, "failed to encode record");
            Outcome::Reply(Response::forbidden())
        })
    }
}
