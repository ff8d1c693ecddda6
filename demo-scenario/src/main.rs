//! Demonstration scenarios for the nekorfc network.
//!
//! Starts a tracker and a handful of peers in-process on localhost, each serving generated RFC
//! files out of a temporary directory, then drives them through one of three scenarios:
//!
//! - `simple`: peer A queries the tracker, downloads rfc1 from B, B leaves, A queries again
//! - `central`: one seeding peer and `-c` downloaders fetching every RFC from it concurrently
//! - `mesh`: `-c` peers each owning a random share of the RFCs and fetching everyone else's
//!
//! Download times can be plotted using the [plotly] crate.
use std::iter::repeat;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use futures::future;
use plotly::common::Mode;
use plotly::Histogram;
use plotly::{layout::Axis, Layout, Plot, Scatter};
use rand::{distributions::Alphanumeric, seq::SliceRandom, Rng};
use tokio::{fs, net::TcpListener};
use tracing_subscriber::EnvFilter;

use nekorfc::{
    serve, spawn_sweeper, Command, Node, NodeConfig, PeerRegistry, PeerServer, Report,
    TrackerServer,
};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Scenario {
    Simple,
    Central,
    Mesh,
}

#[derive(Parser)]
#[command(version, about, long_about = None)]
struct Args {
    #[arg(value_enum, default_value_t = Scenario::Simple)]
    scenario: Scenario,

    /// Whether or not to plot
    #[arg(short, long, action)]
    plot: bool,

    /// Number of concurrent downloading peers
    #[arg(short, long, default_value_t = 4)]
    clients: usize,

    /// Number of RFCs owned by each serving peer
    #[arg(short, long, default_value_t = 10)]
    num_rfcs: u32,

    /// Size of each generated RFC in bytes
    #[arg(short, long, default_value_t = 64 * 1024)]
    size: usize,
}

/// Sets-up a tracker and the peers of [Args::scenario], runs it and reports download times,
/// optionally plotting if [Args::plot] is set
#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();

    let args = Args::parse();
    let data = tempfile::tempdir().context("failed to create scenario directory")?;

    println!("Welcome to the nekorfc demo!");
    let tracker = spawn_tracker().await?;
    println!("Tracker listening on {tracker}");

    tracing::info!(
        scenario = ?args.scenario,
        clients = args.clients,
        rfcs = args.num_rfcs,
        "starting scenario"
    );
    let reports = match args.scenario {
        Scenario::Simple => simple(&args, data.path(), &tracker).await?,
        Scenario::Central => central(&args, data.path(), &tracker).await?,
        Scenario::Mesh => mesh(&args, data.path(), &tracker).await?,
    };

    let durations: Vec<_> = reports.iter().flat_map(Report::download_times).collect();
    let failed = reports.iter().map(|r| r.failures().count()).sum::<usize>();
    tracing::info!(scenario = ?args.scenario, runs = reports.len(), failed, "scenario finished");
    println!("{0} downloads, {failed} failed steps", durations.len());
    if durations.is_empty() {
        return Ok(());
    }

    let average = durations
        .iter()
        .sum::<Duration>()
        .div_f64(durations.len() as f64);
    println!("Average download time: {:0.2?}", average);

    if args.plot {
        plot(&durations, reports.len());
    }

    Ok(())
}

/// Tracker on an ephemeral localhost port, returning its address
async fn spawn_tracker() -> Result<String> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?.to_string();

    let registry = Arc::new(PeerRegistry::default());
    spawn_sweeper(&registry, Duration::from_secs(1));
    tokio::spawn(serve(listener, move |peer| TrackerServer::new(peer, &registry)));
    Ok(addr)
}

/// Write `numbers` as generated `rfc<N>.txt` files under `root/name` and serve them, returning the
/// config of a node registered with the content server's port
async fn spawn_peer(
    root: &Path,
    name: &str,
    tracker: &str,
    numbers: &[u32],
    size: usize,
) -> Result<NodeConfig> {
    let rfc_dir = root.join(name).join("rfcs");
    fs::create_dir_all(&rfc_dir).await?;
    tracing::debug!(peer = name, rfcs = numbers.len(), size, "generating rfc files");
    for n in numbers {
        let text: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(size)
            .map(char::from)
            .collect();
        fs::write(rfc_dir.join(format!("rfc{n}.txt")), text).await?;
    }

    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let mut config = NodeConfig::new("127.0.0.1", listener.local_addr()?.port(), tracker);
    config.rfc_dir = Some(rfc_dir);
    config.download_dir = root.join(name).join("downloads");

    let catalog = Arc::new(config.catalog().await?);
    println!(
        "Peer {name} serving {0} rfcs on {1}",
        catalog.len(),
        config.endpoint()
    );
    tokio::spawn(serve(listener, move |peer| PeerServer::new(peer, &catalog)));
    Ok(config)
}

/// `GetRFC` of each of `numbers` from `peer`
fn get_all<'a>(
    peer: &'a str,
    numbers: impl IntoIterator<Item = u32, IntoIter: 'a>,
) -> impl Iterator<Item = Command> + 'a {
    numbers.into_iter().map(move |number| Command::GetRfc {
        peer: peer.to_owned(),
        number,
    })
}

fn print_report(name: &str, report: &Report) {
    for step in &report.steps {
        match &step.error {
            None => println!("{name}: {0} in {1:0.2?}", step.command, step.elapsed),
            Some(e) => println!("{name}: {0} failed: {e}", step.command),
        }
    }
}

async fn simple(args: &Args, root: &Path, tracker: &str) -> Result<Vec<Report>> {
    let numbers: Vec<_> = (1..=args.num_rfcs).collect();
    let mut a = Node::new(spawn_peer(root, "a", tracker, &[], args.size).await?);
    let mut b = Node::new(spawn_peer(root, "b", tracker, &numbers, args.size).await?);
    let b_addr = b.config().endpoint();

    let mut reports = Vec::new();
    reports.push(b.run(&[]).await?);
    reports.push(
        a.run(&[
            Command::PQuery,
            Command::RfcQuery {
                peer: b_addr.clone(),
            },
            Command::GetRfc {
                peer: b_addr,
                number: 1,
            },
        ])
        .await?,
    );
    reports.push(b.run(&[Command::Leave]).await?);
    reports.push(a.run(&[Command::PQuery]).await?);

    for (name, report) in ["b", "a", "b", "a"].into_iter().zip(&reports) {
        print_report(name, report);
    }
    Ok(reports)
}

async fn central(args: &Args, root: &Path, tracker: &str) -> Result<Vec<Report>> {
    let numbers: Vec<_> = (1..=args.num_rfcs).collect();
    let mut seed = Node::new(spawn_peer(root, "seed", tracker, &numbers, args.size).await?);
    let seed_addr = seed.config().endpoint();
    seed.run(&[]).await?;

    let mut clients = Vec::new();
    for i in 0..args.clients {
        let mut config = spawn_peer(root, &format!("client{i}"), tracker, &[], args.size).await?;
        config.seed = Some(seed_addr.clone());
        clients.push(Node::new(config));
    }

    let script: Vec<_> = [Command::PQuery]
        .into_iter()
        .chain(get_all(&seed_addr, numbers.iter().copied()))
        .chain([Command::Leave])
        .collect();

    println!("Starting {0} downloaders!", clients.len());
    let reports = future::join_all(clients.iter_mut().map(|c| c.run(&script)))
        .await
        .into_iter()
        .collect::<nekorfc::Result<Vec<_>>>()?;

    for (i, report) in reports.iter().enumerate() {
        print_report(&format!("client{i}"), report);
    }
    Ok(reports)
}

async fn mesh(args: &Args, root: &Path, tracker: &str) -> Result<Vec<Report>> {
    // deal distinct rfc numbers out to the peers at random
    let mut numbers: Vec<_> = (1..=args.num_rfcs * args.clients as u32).collect();
    numbers.shuffle(&mut rand::thread_rng());
    let owned: Vec<Vec<u32>> = numbers
        .chunks(args.num_rfcs.max(1) as usize)
        .map(<[u32]>::to_vec)
        .collect();

    let mut peers = Vec::new();
    for (i, rfcs) in owned.iter().enumerate() {
        let config = spawn_peer(root, &format!("peer{i}"), tracker, rfcs, args.size).await?;
        peers.push(Node::new(config));
    }
    let addrs: Vec<_> = peers.iter().map(|p| p.config().endpoint()).collect();

    let scripts: Vec<Vec<Command>> = (0..peers.len())
        .map(|i| {
            let mut script = vec![Command::PQuery];
            for (j, addr) in addrs.iter().enumerate().filter(|(j, _)| *j != i) {
                script.push(Command::RfcQuery { peer: addr.clone() });
                script.extend(get_all(addr, owned[j].iter().copied()));
            }
            script.push(Command::Leave);
            script
        })
        .collect();

    println!("Starting {0} peers!", peers.len());
    let reports = future::join_all(peers.iter_mut().zip(&scripts).map(|(p, s)| p.run(s)))
        .await
        .into_iter()
        .collect::<nekorfc::Result<Vec<_>>>()?;

    for (i, (peer, report)) in peers.iter().zip(&reports).enumerate() {
        print_report(&format!("peer{i}"), report);
        println!("peer{i}: knows {0} rfcs", peer.known().count());
    }
    Ok(reports)
}

/// Scatter of every download time in order, plus its distribution
fn plot(durations: &[Duration], runs: usize) {
    let mut plot = Plot::new();
    let x_axis: Vec<_> = (1..=durations.len()).collect();
    let y_axis: Vec<_> = durations.iter().map(|d| d.as_micros()).collect();
    let trace = Scatter::new(x_axis, y_axis.clone())
        .name("Raw Data")
        .mode(Mode::Markers);
    plot.add_trace(trace);

    let average = durations
        .iter()
        .sum::<Duration>()
        .div_f64(durations.len() as f64)
        .as_micros();
    let trace_avg = Scatter::new(vec![1, durations.len()], repeat(average).take(2).collect())
        .name(&format!("Average over {runs} runs"))
        .mode(Mode::Lines);
    plot.add_trace(trace_avg);

    let layout = Layout::new()
        .title("`GetRFC` Download Time")
        .x_axis(Axis::new().title("Download"))
        .y_axis(Axis::new().title("Download Time (microseconds)"));
    plot.set_layout(layout);

    plot.show();

    let mut histogram = Plot::new();
    let hist_trace = Histogram::new(y_axis);
    histogram.add_trace(hist_trace);

    let hist_layout = Layout::new()
        .title("Distribution of `GetRFC` Download Time")
        .x_axis(Axis::new().title("Download Time (microseconds)"))
        .y_axis(Axis::new().title("Count"));
    histogram.set_layout(hist_layout);

    histogram.show();
}
