//! End-to-end runs over real sockets on localhost.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;
use tokio::sync::Mutex;

use nekorfc::frame::{receive_frame, send_frame};
use nekorfc::{
    record, serve, Catalog, Command, Error, KeepAlive, Node, NodeConfig, Peer, PeerClient,
    PeerRegistry, PeerServer, Request, Response, Rfc, TrackerClient, TrackerServer,
};

const TIMEOUT: Duration = Duration::from_secs(5);

async fn spawn_tracker(ttl: u32) -> (String, Arc<PeerRegistry>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let registry = Arc::new(PeerRegistry::new(ttl));
    let shared = Arc::clone(&registry);
    tokio::spawn(serve(listener, move |peer| TrackerServer::new(peer, &shared)));
    (addr, registry)
}

async fn spawn_peer(catalog: Catalog) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let catalog = Arc::new(catalog);
    tokio::spawn(serve(listener, move |peer| PeerServer::new(peer, &catalog)));
    addr
}

/// Tracker that always answers as peer 0 and holds back its KeepAlive replies for `delay`
async fn spawn_slow_tracker(delay: Duration) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let me = Peer {
                    hostname: "alpha".to_owned(),
                    port: 1,
                    cookie: 0,
                    last_active_time: 0,
                    registration_count: 1,
                    active: true,
                    ttl: 10,
                };
                loop {
                    let request = match receive_frame(&mut stream).await {
                        Ok(payload) if !payload.is_empty() => Request::decode(&payload).unwrap(),
                        _ => return,
                    };
                    let body = match request.command.as_str() {
                        "PQuery" => Vec::new(),
                        "KeepAlive" => {
                            tokio::time::sleep(delay).await;
                            record::encode(&me).unwrap()
                        }
                        _ => record::encode(&me).unwrap(),
                    };
                    let response = Response::ok().body(body).encode();
                    if send_frame(&mut stream, &response).await.is_err() {
                        return;
                    }
                }
            });
        }
    });
    addr
}

/// Content server that answers any request with the record of `rfc` and a `Content-Size` of 100,
/// then sends `wire` verbatim and hangs up
async fn spawn_broken_peer(rfc: Rfc, wire: &'static [u8]) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            let rfc = rfc.clone();
            tokio::spawn(async move {
                if receive_frame(&mut stream).await.is_err() {
                    return;
                }
                let response = Response::ok()
                    .header("Content-Size", 100)
                    .body(record::encode(&rfc).unwrap());
                let _ = send_frame(&mut stream, &response.encode()).await;
                let _ = stream.write_all(wire).await;
            });
        }
    });
    addr
}

fn content(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 % 256) as u8).collect()
}

#[tokio::test]
async fn leave_removes_peer_from_queries() {
    let (tracker, registry) = spawn_tracker(100).await;
    let mut a = TrackerClient::new(tracker.clone(), "alpha", 1234, TIMEOUT);
    let mut b = TrackerClient::new(tracker, "beta", 1235, TIMEOUT);

    assert_eq!(a.register().await.unwrap().cookie, 0);
    assert_eq!(b.register().await.unwrap().cookie, 1);

    let seen = a.pquery().await.unwrap();
    assert_eq!(seen.len(), 1);
    assert_eq!((seen[0].cookie, seen[0].hostname.as_str(), seen[0].port), (1, "beta", 1235));

    b.leave().await.unwrap();
    assert!(!b.is_connected());
    assert!(a.pquery().await.unwrap().is_empty());

    let gone = registry.get(1).unwrap();
    assert!(!gone.active);
    assert_eq!(gone.ttl, 0);

    // a fresh session gets the old cookie back
    assert_eq!(b.register().await.unwrap().cookie, 1);
    assert_eq!(a.pquery().await.unwrap().len(), 1);
}

#[tokio::test]
async fn expired_peer_cannot_refresh_itself() {
    let (tracker, registry) = spawn_tracker(2).await;
    let mut a = TrackerClient::new(tracker, "alpha", 1234, TIMEOUT);
    a.register().await.unwrap();

    registry.sweep();
    registry.sweep();

    assert!(matches!(a.keep_alive().await, Err(Error::Rejected(403))));
    assert!(matches!(a.pquery().await, Err(Error::Rejected(403))));
    assert!(a.register().await.unwrap().active);
    assert_eq!(a.keep_alive().await.unwrap().ttl, 2);
}

#[tokio::test]
async fn concurrent_registrations_get_distinct_cookies() {
    let (tracker, registry) = spawn_tracker(100).await;
    let tasks: Vec<_> = (0..16)
        .map(|i| {
            let tracker = tracker.clone();
            tokio::spawn(async move {
                let mut client = TrackerClient::new(tracker, "host", 2000 + i, TIMEOUT);
                client.register().await.unwrap().cookie
            })
        })
        .collect();

    let mut cookies = HashSet::new();
    for task in tasks {
        assert!(cookies.insert(task.await.unwrap()));
    }
    assert_eq!(cookies, (0..16).collect::<HashSet<_>>());
    assert_eq!(registry.len(), 16);
}

#[tokio::test]
async fn keep_alive_timer_refreshes_ttl() {
    let (tracker, registry) = spawn_tracker(10).await;
    let client = Arc::new(Mutex::new(TrackerClient::new(tracker, "alpha", 1, TIMEOUT)));
    let cookie = client.lock().await.register().await.unwrap().cookie;

    for _ in 0..5 {
        registry.sweep();
    }
    assert_eq!(registry.get(cookie).unwrap().ttl, 5);

    let keep_alive = KeepAlive::spawn(&client, Duration::from_millis(20));
    tokio::time::sleep(Duration::from_millis(150)).await;
    keep_alive.cancel().await;

    assert_eq!(registry.get(cookie).unwrap().ttl, 10);
    // the session is still usable after cancelling
    assert!(client.lock().await.pquery().await.unwrap().is_empty());
}

#[tokio::test]
async fn get_rfc_reconstructs_file() {
    let served = tempfile::tempdir().unwrap();
    let downloads = tempfile::tempdir().unwrap();
    let path = served.path().join("rfc1.txt");
    let bytes = content(10_000);
    std::fs::write(&path, &bytes).unwrap();

    let rfc = Rfc::new(1, "rfc1", "beta", &path);
    let peer = spawn_peer([rfc.clone()].into_iter().collect()).await;

    let mut client = PeerClient::connect(&peer, "alpha").await.unwrap().with_timeout(TIMEOUT);
    let download = client.get_rfc(1, downloads.path()).await.unwrap();

    assert_eq!(download.rfc, rfc);
    assert_eq!(download.bytes, 10_000);
    assert_eq!(download.path, downloads.path().join("rfc1.txt"));
    assert_eq!(std::fs::read(&download.path).unwrap(), bytes);

    // a second fetch on the same connection works too
    let again = client.get_rfc(1, downloads.path()).await.unwrap();
    assert_eq!(again.bytes, 10_000);
    client.leave().await.unwrap();
}

#[tokio::test]
async fn empty_rfc_downloads_as_empty_file() {
    let served = tempfile::tempdir().unwrap();
    let downloads = tempfile::tempdir().unwrap();
    let path = served.path().join("rfc9.txt");
    std::fs::write(&path, b"").unwrap();
    let peer = spawn_peer([Rfc::new(9, "rfc9", "beta", &path)].into_iter().collect()).await;

    let mut client = PeerClient::connect(&peer, "alpha").await.unwrap().with_timeout(TIMEOUT);
    let download = client.get_rfc(9, downloads.path()).await.unwrap();
    assert_eq!(download.bytes, 0);
    assert!(std::fs::read(&download.path).unwrap().is_empty());
}

#[tokio::test]
async fn missing_rfc_keeps_connection_open() {
    let downloads = tempfile::tempdir().unwrap();
    let peer = spawn_peer(
        [Rfc::new(2, "rfc2", "beta", "/nonexistent/rfc2.txt")]
            .into_iter()
            .collect(),
    )
    .await;

    let mut client = PeerClient::connect(&peer, "alpha").await.unwrap().with_timeout(TIMEOUT);
    assert!(matches!(
        client.get_rfc(1, downloads.path()).await,
        Err(Error::Rejected(403))
    ));
    assert!(matches!(
        client.get_rfc(2, downloads.path()).await,
        Err(Error::Rejected(403))
    ));

    let rfcs = client.rfc_query().await.unwrap();
    assert_eq!(rfcs.len(), 1);
    assert_eq!(rfcs[0].number, 2);
}

#[tokio::test]
async fn node_runs_script_against_peers() {
    let served = tempfile::tempdir().unwrap();
    let downloads = tempfile::tempdir().unwrap();
    for n in [1, 2] {
        std::fs::write(served.path().join(format!("rfc{n}.txt")), content(3000 + n)).unwrap();
    }

    let (tracker, registry) = spawn_tracker(100).await;

    let mut b_config = NodeConfig::new("127.0.0.1", 0, tracker.clone());
    b_config.rfc_dir = Some(served.path().to_path_buf());
    let catalog = b_config.catalog().await.unwrap();
    assert_eq!(catalog.len(), 2);
    let b_addr = spawn_peer(catalog).await;
    b_config.port = b_addr.rsplit(':').next().unwrap().parse().unwrap();
    let mut b = Node::new(b_config);

    let mut a_config = NodeConfig::new("127.0.0.1", 4321, tracker);
    a_config.download_dir = downloads.path().to_path_buf();
    a_config.seed = Some(b_addr.clone());
    let mut a = Node::new(a_config);

    // b registers and stays registered
    b.run(&[]).await.unwrap();
    assert!(registry.get(0).unwrap().active);

    let report = a
        .run(&[
            Command::PQuery,
            Command::GetRfc {
                peer: b_addr.clone(),
                number: 2,
            },
            Command::GetRfc {
                peer: b_addr.clone(),
                number: 7,
            },
            Command::Leave,
        ])
        .await
        .unwrap();

    assert_eq!(report.steps.len(), 5);
    let failed: Vec<_> = report.failures().map(|s| s.command.clone()).collect();
    assert_eq!(
        failed,
        [Command::GetRfc {
            peer: b_addr,
            number: 7
        }]
    );
    assert_eq!(report.download_times().len(), 1);

    let known: Vec<_> = a.known().map(|r| r.number).collect();
    assert_eq!(known, [1, 2]);
    assert_eq!(
        std::fs::read(downloads.path().join("rfc2.txt")).unwrap(),
        content(3002)
    );
    assert!(!registry.get(1).unwrap().active);
}

#[tokio::test]
async fn timed_out_reply_is_not_taken_for_the_next_one() {
    let tracker = spawn_slow_tracker(Duration::from_millis(300)).await;
    let mut client = TrackerClient::new(tracker, "alpha", 1, Duration::from_millis(100));
    assert_eq!(client.register().await.unwrap().cookie, 0);

    assert!(matches!(client.keep_alive().await, Err(Error::Timeout)));
    assert!(!client.is_connected());
    assert!(matches!(client.pquery().await, Err(Error::NotRegistered)));

    // a fresh connection is back in step
    client.register().await.unwrap();
    assert!(client.pquery().await.unwrap().is_empty());
}

#[tokio::test]
async fn invalid_hostname_is_never_sent() {
    let (tracker, registry) = spawn_tracker(100).await;
    let mut client = TrackerClient::new(tracker, "evil\r\nPort: 1", 1234, TIMEOUT);

    assert!(matches!(client.register().await, Err(Error::Protocol(_))));
    assert!(!client.is_connected());
    assert!(registry.is_empty());
}

#[tokio::test]
async fn interrupted_download_leaves_no_file() {
    let downloads = tempfile::tempdir().unwrap();
    let rfc = Rfc::new(1, "rfc1", "beta", "rfc1.txt");

    // a frame promising 50 bytes cut off after 10
    let truncated = spawn_broken_peer(rfc.clone(), b"50      0123456789").await;
    let mut client = PeerClient::connect(&truncated, "alpha").await.unwrap().with_timeout(TIMEOUT);
    assert!(matches!(
        client.get_rfc(1, downloads.path()).await,
        Err(Error::Frame(_))
    ));
    assert!(!client.is_connected());
    assert!(matches!(client.rfc_query().await, Err(Error::Closed)));

    // whole frames, but 10 of the 100 announced bytes
    let short = spawn_broken_peer(rfc, b"10      0123456789").await;
    let mut client = PeerClient::connect(&short, "alpha").await.unwrap().with_timeout(TIMEOUT);
    assert!(matches!(
        client.get_rfc(1, downloads.path()).await,
        Err(Error::IncompleteContent {
            expected: 100,
            got: 10
        })
    ));

    assert_eq!(std::fs::read_dir(downloads.path()).unwrap().count(), 0);
}
