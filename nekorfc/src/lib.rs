//! A small tracker/peer RFC sharing network.
//!
//! A central tracker ([TrackerServer]) keeps membership and liveness of peers, while every peer
//! serves its own [Catalog] of RFCs ([PeerServer]) and downloads from others. All connections
//! speak the same framed, HTTP-shaped protocol ([frame], [message]).
use std::future::Future;

use tokio::fs::File;

pub mod client;
pub mod error;
pub mod frame;
pub mod message;
pub mod node;
pub mod peer;
pub mod record;
pub mod registry;
pub mod rfc;
pub mod server;
pub mod tracker;

pub use client::{Connection, Download, PeerClient, TrackerClient};
pub use error::{Error, Result};
pub use message::{Request, Response};
pub use node::{Command, KeepAlive, Node, NodeConfig, Report};
pub use peer::{PeerCommand, PeerServer};
pub use registry::{spawn_sweeper, Cookie, Peer, PeerRegistry};
pub use rfc::{Catalog, Rfc};
pub use server::{serve, CommandError};
pub use tracker::{TrackerCommand, TrackerConfig, TrackerServer};

/// What a connection handler does after dispatching one request
#[derive(Debug)]
pub enum Outcome {
    /// Send the response and wait for the next request
    Reply(Response),

    /// Send the response, then the file as raw content frames ended by an empty frame
    Stream(Response, File),

    /// Optionally send a final response, then close the connection
    Close(Option<Response>),
}

/// One side of a connection serving decoded requests
///
/// A value is built per accepted connection and owns that connection's state.
pub trait Service: Send + 'static {
    fn handle(&mut self, request: Request) -> impl Future<Output = Outcome> + Send;
}
