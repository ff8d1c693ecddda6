//! Client role of a peer: a fixed prologue with the tracker followed by a scripted list of
//! commands against the tracker and other peers.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;

use crate::client::{PeerClient, TrackerClient};
use crate::rfc::{Catalog, Rfc};
use crate::tracker::DEFAULT_PORT;
use crate::Result;

/// A peer's config values
#[derive(Debug, Clone, Deserialize)]
pub struct NodeConfig {
    /// Hostname registered with the tracker and sent in the `Host` header
    #[serde(default = "default_host")]
    pub host: String,

    /// Content server port
    pub port: u16,

    /// `host:port` of the tracker
    #[serde(default = "default_tracker")]
    pub tracker: String,

    /// Directory scanned for `rfc<N>.txt` files to serve
    #[serde(default)]
    pub rfc_dir: Option<PathBuf>,

    /// Extra RFCs to serve
    #[serde(default)]
    pub rfcs: Vec<CatalogEntry>,

    /// Where downloaded RFCs are written
    #[serde(default = "default_download_dir")]
    pub download_dir: PathBuf,

    #[serde(default = "default_keep_alive")]
    pub keep_alive_secs: u64,

    /// Bound on every wait for a tracker or peer response
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,

    /// Peer whose catalog seeds the known RFCs before the script runs
    #[serde(default)]
    pub seed: Option<String>,

    #[serde(default)]
    pub script: Vec<Command>,
}

fn default_host() -> String {
    "localhost".to_owned()
}
fn default_tracker() -> String {
    format!("localhost:{DEFAULT_PORT}")
}
fn default_download_dir() -> PathBuf {
    PathBuf::from("downloads")
}
fn default_keep_alive() -> u64 {
    60
}
fn default_timeout() -> u64 {
    10
}

impl NodeConfig {
    /// Config with defaults for everything but the identity and the tracker
    pub fn new(host: impl Into<String>, port: u16, tracker: impl Into<String>) -> Self {
        NodeConfig {
            host: host.into(),
            port,
            tracker: tracker.into(),
            rfc_dir: None,
            rfcs: Vec::new(),
            download_dir: default_download_dir(),
            keep_alive_secs: default_keep_alive(),
            timeout_secs: default_timeout(),
            seed: None,
            script: Vec::new(),
        }
    }

    /// Catalog of `rfc_dir` plus the listed `rfcs`, all owned by `host`
    pub async fn catalog(&self) -> std::io::Result<Catalog> {
        let mut catalog = match &self.rfc_dir {
            Some(dir) => Catalog::from_dir(&self.host, dir).await?,
            None => Catalog::new(),
        };
        for entry in &self.rfcs {
            catalog.insert(Rfc::new(
                entry.number,
                entry.title.clone(),
                self.host.clone(),
                entry.path.clone(),
            ));
        }
        Ok(catalog)
    }

    /// `host:port` other peers reach this node's content server on
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// An RFC listed directly in config
#[derive(Debug, Clone, Deserialize)]
pub struct CatalogEntry {
    pub number: u32,
    pub title: String,
    pub path: PathBuf,
}

/// One scripted step
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum Command {
    Register,
    Leave,
    #[serde(rename = "pquery")]
    PQuery,
    KeepAlive,
    RfcQuery { peer: String },
    GetRfc { peer: String, number: u32 },

    /// Sleep between steps
    Pause { millis: u64 },
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Register => write!(f, "Register"),
            Command::Leave => write!(f, "Leave"),
            Command::PQuery => write!(f, "PQuery"),
            Command::KeepAlive => write!(f, "KeepAlive"),
            Command::RfcQuery { peer } => write!(f, "RFCQuery {peer}"),
            Command::GetRfc { peer, number } => write!(f, "GetRFC {number} from {peer}"),
            Command::Pause { millis } => write!(f, "Pause {millis}ms"),
        }
    }
}

/// Timing and result of one executed step
#[derive(Debug, Clone)]
pub struct Step {
    pub command: Command,
    pub elapsed: Duration,

    /// Failure message if the step did not succeed
    pub error: Option<String>,
}

/// Everything a [Node::run] did, in order
#[derive(Debug, Clone, Default)]
pub struct Report {
    pub steps: Vec<Step>,
}

impl Report {
    pub fn failures(&self) -> impl Iterator<Item = &Step> {
        self.steps.iter().filter(|s| s.error.is_some())
    }

    /// Elapsed time of every successful download
    pub fn download_times(&self) -> Vec<Duration> {
        self.steps
            .iter()
            .filter(|s| s.error.is_none() && matches!(s.command, Command::GetRfc { .. }))
            .map(|s| s.elapsed)
            .collect()
    }
}

/// Recurring keep-alive against the tracker
pub struct KeepAlive {
    stop: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

impl KeepAlive {
    /// Send a keep-alive every `every` until cancelled; the first one goes out after one period
    pub fn spawn(tracker: &Arc<Mutex<TrackerClient>>, every: Duration) -> Self {
        let tracker = Arc::clone(tracker);
        let (stop, mut stopped) = oneshot::channel();
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = &mut stopped => break,
                    _ = ticker.tick() => {
                        // a stop request is only noticed between exchanges
                        let mut tracker = tracker.lock().await;
                        if tracker.is_connected() {
                            match tracker.keep_alive().await {
                                Ok(peer) => tracing::debug!(cookie = peer.cookie, "keep alive"),
                                Err(e) => tracing::warn!(error = %e, "keep alive failed"),
                            }
                        }
                    }
                }
            }
        });
        KeepAlive { stop, task }
    }

    /// Stop the timer, waiting for an in-flight keep-alive to finish
    pub async fn cancel(self) {
        let _ = self.stop.send(());
        let _ = self.task.await;
    }
}

/// Orchestrates one peer's session with the tracker and other peers
pub struct Node {
    config: NodeConfig,
    tracker: Arc<Mutex<TrackerClient>>,

    /// RFCs learned from other peers by owner and number, separate from the local catalog
    known: BTreeMap<(String, u32), Rfc>,
}

impl Node {
    pub fn new(config: NodeConfig) -> Self {
        let tracker = TrackerClient::new(
            config.tracker.clone(),
            config.host.clone(),
            config.port,
            Duration::from_secs(config.timeout_secs),
        );
        Node {
            config,
            tracker: Arc::new(Mutex::new(tracker)),
            known: BTreeMap::new(),
        }
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    /// RFCs learned through `RFCQuery`
    pub fn known(&self) -> impl Iterator<Item = &Rfc> {
        self.known.values()
    }

    /// Register, seed, then run `script` with keep-alives in the background
    ///
    /// Only a failed registration aborts the run; failed steps are logged and recorded.
    pub async fn run(&mut self, script: &[Command]) -> Result<Report> {
        self.tracker.lock().await.register().await?;

        let mut report = Report::default();
        if let Some(seed) = self.config.seed.clone() {
            report.steps.push(self.step(Command::RfcQuery { peer: seed }).await);
        }

        let keep_alive =
            KeepAlive::spawn(&self.tracker, Duration::from_secs(self.config.keep_alive_secs));
        for command in script {
            report.steps.push(self.step(command.clone()).await);
        }
        keep_alive.cancel().await;
        self.tracker.lock().await.close().await;

        Ok(report)
    }

    /// Run the configured script
    pub async fn run_script(&mut self) -> Result<Report> {
        let script = self.config.script.clone();
        self.run(&script).await
    }

    async fn step(&mut self, command: Command) -> Step {
        let start = Instant::now();
        let result = self.execute(&command).await;
        let elapsed = start.elapsed();
        let error = match result {
            Ok(()) => {
                tracing::debug!(host = %self.config.endpoint(), %command, ?elapsed, "step done");
                None
            }
            Err(e) => {
                tracing::warn!(host = %self.config.endpoint(), %command, error = %e, "step failed");
                Some(e.to_string())
            }
        };
        Step {
            command,
            elapsed,
            error,
        }
    }

    async fn execute(&mut self, command: &Command) -> Result<()> {
        match command {
            Command::Register => {
                self.tracker.lock().await.register().await?;
            }
            Command::Leave => {
                self.tracker.lock().await.leave().await?;
            }
            Command::PQuery => {
                let peers = self.tracker.lock().await.pquery().await?;
                tracing::info!(
                    host = %self.config.endpoint(),
                    peers = ?peers.iter().map(|p| p.endpoint()).collect::<Vec<_>>(),
                    "active peers"
                );
            }
            Command::KeepAlive => {
                self.tracker.lock().await.keep_alive().await?;
            }
            Command::RfcQuery { peer } => {
                let mut client = self.connect(peer).await?;
                let rfcs = client.rfc_query().await?;
                client.leave().await?;
                tracing::info!(host = %self.config.endpoint(), %peer, rfcs = rfcs.len(), "learned rfcs");
                for rfc in rfcs {
                    self.known.insert((rfc.hostname.clone(), rfc.number), rfc);
                }
            }
            Command::GetRfc { peer, number } => {
                let mut client = self.connect(peer).await?;
                let download = client.get_rfc(*number, &self.config.download_dir).await?;
                client.leave().await?;
                self.known
                    .entry((download.rfc.hostname.clone(), download.rfc.number))
                    .or_insert(download.rfc);
            }
            Command::Pause { millis } => {
                tokio::time::sleep(Duration::from_millis(*millis)).await;
            }
        }
        Ok(())
    }

    async fn connect(&self, peer: &str) -> Result<PeerClient> {
        let client = PeerClient::connect(peer, &self.config.host).await?;
        Ok(client.with_timeout(Duration::from_secs(self.config.timeout_secs)))
    }
}
