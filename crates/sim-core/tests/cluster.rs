//! Cluster integration tests.
//!
//! Drives whole clusters through spawn, link, kill and close, including a
//! network wrapper that injects construction and release failures.

use std::collections::{BTreeSet, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use sim_core::network::Result as NetResult;
use sim_core::{
    Cluster, ClusterConfig, ClusterError, Connectivity, Diff, Edge, Graph, Host, InProcHost,
    InProcNetwork, InProcOverlay, Network, NetworkError, Node, Overlay, PeerId, ReleaseError,
    Ring, StateChanged, Subscription,
};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

const WAIT: Duration = Duration::from_secs(5);

async fn next(sub: &mut Subscription<StateChanged>) -> StateChanged {
    timeout(WAIT, sub.recv())
        .await
        .expect("Timed out waiting for state change")
        .expect("State stream ended")
}

fn config() -> ClusterConfig {
    ClusterConfig::default().with_bus_capacity(256)
}

#[derive(Default)]
struct Faults {
    fail_host: AtomicBool,
    fail_overlay: AtomicBool,
    doomed: Mutex<HashSet<PeerId>>,
    overlay_closes: AtomicUsize,
}

impl Faults {
    fn doom(&self, peer: PeerId) {
        self.doomed.lock().unwrap().insert(peer);
    }

    fn is_doomed(&self, peer: PeerId) -> bool {
        self.doomed.lock().unwrap().contains(&peer)
    }
}

/// In-process network whose hosts and overlays fail on demand.
#[derive(Clone, Default)]
struct FaultyNetwork {
    inner: InProcNetwork,
    faults: Arc<Faults>,
}

struct FaultyOverlay {
    id: PeerId,
    inner: InProcOverlay,
    faults: Arc<Faults>,
}

#[async_trait]
impl Network for FaultyNetwork {
    type Host = InProcHost;
    type Overlay = FaultyOverlay;

    async fn host(&self) -> NetResult<InProcHost> {
        if self.faults.fail_host.load(Ordering::SeqCst) {
            return Err(NetworkError::Other("injected host failure".into()));
        }
        self.inner.host().await
    }

    async fn overlay(&self, host: &InProcHost) -> NetResult<FaultyOverlay> {
        if self.faults.fail_overlay.load(Ordering::SeqCst) {
            return Err(NetworkError::Other("injected overlay failure".into()));
        }
        Ok(FaultyOverlay {
            id: host.id(),
            inner: self.inner.overlay(host).await?,
            faults: Arc::clone(&self.faults),
        })
    }
}

#[async_trait]
impl Overlay for FaultyOverlay {
    fn subscribe(&self) -> NetResult<Subscription<Connectivity>> {
        self.inner.subscribe()
    }

    async fn connect(&self, peer: PeerId) -> NetResult<()> {
        self.inner.connect(peer).await
    }

    async fn disconnect(&self, peer: PeerId) -> NetResult<()> {
        self.inner.disconnect(peer).await
    }

    fn neighbors(&self) -> Vec<PeerId> {
        self.inner.neighbors()
    }

    async fn close(&self) -> NetResult<()> {
        self.faults.overlay_closes.fetch_add(1, Ordering::SeqCst);
        self.inner.close().await?;
        if self.faults.is_doomed(self.id) {
            return Err(NetworkError::Other("injected close failure".into()));
        }
        Ok(())
    }
}

#[tokio::test]
async fn test_spawn_link_kill_scenario() {
    let cluster = Cluster::new(config()).unwrap();
    let cancel = CancellationToken::new();
    let mut events = cluster.events(&cancel).unwrap();

    let p1 = cluster.spawn(&cancel).await.unwrap();
    let p2 = cluster.spawn(&cancel).await.unwrap();
    let p3 = cluster.spawn(&cancel).await.unwrap();
    for p in [p1, p2, p3] {
        assert_eq!(next(&mut events).await, StateChanged::added(Diff::node(p)));
    }

    cluster.connect(p1, p2).await.unwrap();
    assert_eq!(
        next(&mut events).await,
        StateChanged::added(Diff::link(Edge::new(p1, p2)))
    );
    cluster.connect(p2, p3).await.unwrap();
    assert_eq!(
        next(&mut events).await,
        StateChanged::added(Diff::link(Edge::new(p2, p3)))
    );

    cluster.kill(p2).await.unwrap();
    let change = next(&mut events).await;
    assert!(change.add.is_none());
    let rm = change.rm.unwrap();
    assert_eq!(rm.nodes, vec![Node { id: p2 }]);
    let removed: BTreeSet<Edge> = rm.links.iter().map(|l| l.edge()).collect();
    assert_eq!(removed, BTreeSet::from([Edge::new(p1, p2), Edge::new(p2, p3)]));

    let graph = cluster.snapshot().await.unwrap();
    let mut expected = vec![Node { id: p1 }, Node { id: p3 }];
    expected.sort_by_key(|n| n.id);
    assert_eq!(graph.nodes, expected);
    assert!(graph.links.is_empty());

    cluster.close().await.unwrap();
}

#[tokio::test]
async fn test_kill_unknown_peer_leaves_graph_unchanged() {
    let cluster = Cluster::new(config()).unwrap();
    let cancel = CancellationToken::new();
    let a = cluster.spawn(&cancel).await.unwrap();
    let b = cluster.spawn(&cancel).await.unwrap();
    let before = cluster.snapshot().await.unwrap();

    let result = cluster.kill(PeerId::from(0xdead)).await;

    assert!(matches!(result, Err(ClusterError::NotFound(p)) if p == PeerId::from(0xdead)));
    assert_eq!(cluster.snapshot().await.unwrap(), before);
    assert_eq!(cluster.len().await, 2);
    assert!(cluster.peers().await.contains(&a));
    assert!(cluster.peers().await.contains(&b));

    cluster.close().await.unwrap();
}

#[tokio::test]
async fn test_close_attempts_every_member() {
    let network = FaultyNetwork::default();
    let faults = Arc::clone(&network.faults);
    let cluster = Cluster::with_network(network, config()).unwrap();
    let cancel = CancellationToken::new();

    let mut ids = Vec::new();
    for _ in 0..5 {
        ids.push(cluster.spawn(&cancel).await.unwrap());
    }
    faults.doom(ids[1]);
    faults.doom(ids[3]);

    let err = match cluster.close().await {
        Err(ClusterError::Shutdown(err)) => err,
        other => panic!("Expected shutdown error, got {:?}", other),
    };

    assert_eq!(faults.overlay_closes.load(Ordering::SeqCst), 5);
    assert_eq!(err.len(), 2);
    assert_eq!(err.peers(), BTreeSet::from([ids[1], ids[3]]));
    assert!(
        err.errors()
            .iter()
            .all(|e| matches!(e, ReleaseError::Overlay { .. }))
    );

    // Hosts are still released after their overlay failed to close.
    assert!(cluster.network().inner.is_empty());
    assert!(cluster.is_empty().await);
}

#[tokio::test]
async fn test_kill_reports_release_failure() {
    let network = FaultyNetwork::default();
    let faults = Arc::clone(&network.faults);
    let cluster = Cluster::with_network(network, config()).unwrap();
    let cancel = CancellationToken::new();
    let mut events = cluster.events(&cancel).unwrap();

    let id = cluster.spawn(&cancel).await.unwrap();
    next(&mut events).await;
    faults.doom(id);

    let result = cluster.kill(id).await;

    match result {
        Err(ClusterError::Shutdown(err)) => {
            assert_eq!(err.len(), 1);
            assert_eq!(err.errors()[0].peer(), Some(id));
        }
        other => panic!("Expected shutdown error, got {:?}", other),
    }
    assert!(cluster.is_empty().await);
    assert_eq!(
        next(&mut events).await,
        StateChanged::removed(Diff::node(id))
    );

    cluster.close().await.unwrap();
}

#[tokio::test]
async fn test_construction_failure_releases_partial_member() {
    let network = FaultyNetwork::default();
    let faults = Arc::clone(&network.faults);
    let cluster = Cluster::with_network(network, config()).unwrap();
    let cancel = CancellationToken::new();

    faults.fail_overlay.store(true, Ordering::SeqCst);
    let result = cluster.spawn(&cancel).await;
    assert!(matches!(result, Err(ClusterError::Construction(_))));
    assert!(cluster.network().inner.is_empty());

    faults.fail_overlay.store(false, Ordering::SeqCst);
    faults.fail_host.store(true, Ordering::SeqCst);
    assert!(matches!(
        cluster.spawn(&cancel).await,
        Err(ClusterError::Construction(_))
    ));

    assert!(cluster.is_empty().await);
    assert!(cluster.snapshot().await.unwrap().nodes.is_empty());
    cluster.close().await.unwrap();
}

#[tokio::test]
async fn test_node_count_tracks_live_members() {
    let cluster = Cluster::new(config()).unwrap();
    let cancel = CancellationToken::new();
    let mut rng = StdRng::seed_from_u64(7);
    let mut live: Vec<PeerId> = Vec::new();

    for _ in 0..60 {
        if live.is_empty() || rng.random_bool(0.6) {
            live.push(cluster.spawn(&cancel).await.unwrap());
        } else {
            let victim = live.swap_remove(rng.random_range(0..live.len()));
            cluster.kill(victim).await.unwrap();
        }

        let graph = cluster.snapshot().await.unwrap();
        assert_eq!(graph.nodes.len(), live.len());
        assert_eq!(cluster.len().await, live.len());
    }

    cluster.close().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_spawns() {
    let cluster = Arc::new(Cluster::new(config()).unwrap());
    let cancel = CancellationToken::new();

    let mut tasks = Vec::new();
    for _ in 0..20 {
        let cluster = Arc::clone(&cluster);
        let cancel = cancel.clone();
        tasks.push(tokio::spawn(async move { cluster.spawn(&cancel).await }));
    }
    let mut ids = BTreeSet::new();
    for task in tasks {
        ids.insert(task.await.unwrap().unwrap());
    }

    assert_eq!(ids.len(), 20);
    let graph = cluster.snapshot().await.unwrap();
    let nodes: BTreeSet<PeerId> = graph.nodes.iter().map(|n| n.id).collect();
    assert_eq!(nodes, ids);

    cluster.close().await.unwrap();
}

/// Random spawn, kill, connect and disconnect from several tasks at once.
async fn churn(cluster: Arc<Cluster>, seed: u64, cancel: CancellationToken) {
    let mut rng = StdRng::seed_from_u64(seed);
    for _ in 0..40 {
        let peers = cluster.peers().await;
        let roll = rng.random_range(0..10);
        if peers.len() < 2 || roll < 3 {
            cluster.spawn(&cancel).await.unwrap();
            continue;
        }

        let a = peers[rng.random_range(0..peers.len())];
        let mut b = peers[rng.random_range(0..peers.len())];
        if a == b {
            b = peers.iter().copied().find(|&p| p != a).unwrap();
        }

        // Other tasks may have killed a or b since the peer list was taken.
        let _ = match roll {
            3 | 4 => cluster.kill(a).await,
            5..=7 => cluster.connect(a, b).await,
            _ => cluster.disconnect(a, b).await,
        };
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_churn_keeps_graph_consistent() {
    let cluster = Arc::new(Cluster::new(config()).unwrap());
    let cancel = CancellationToken::new();

    let (mut graph, mut sub) = cluster.watch(&cancel).await.unwrap();
    let watcher = tokio::spawn(async move {
        while let Some(change) = sub.recv().await {
            graph.apply(&change);
        }
        graph
    });

    let mut workers = Vec::new();
    for seed in 0..6 {
        workers.push(tokio::spawn(churn(Arc::clone(&cluster), seed, cancel.clone())));
    }
    for worker in workers {
        timeout(WAIT, worker).await.unwrap().unwrap();
    }

    let live: BTreeSet<PeerId> = cluster.peers().await.into_iter().collect();
    let snapshot = cluster.snapshot().await.unwrap();
    let nodes: BTreeSet<PeerId> = snapshot.nodes.iter().map(|n| n.id).collect();
    assert_eq!(nodes, live);
    for link in &snapshot.links {
        assert!(live.contains(&link.source) && live.contains(&link.target));
        assert_ne!(link.source, link.target);
    }

    cluster.close().await.unwrap();
    let replayed = timeout(WAIT, watcher).await.unwrap().unwrap();
    assert!(replayed.nodes.is_empty());
    assert!(replayed.links.is_empty());
}

#[tokio::test]
async fn test_watcher_sees_everything_removed_on_close() {
    let cluster = Cluster::new(config()).unwrap();
    let cancel = CancellationToken::new();
    for _ in 0..3 {
        cluster.spawn(&cancel).await.unwrap();
    }

    let (mut graph, mut sub): (Graph, _) = cluster.watch(&cancel).await.unwrap();
    assert_eq!(graph.nodes.len(), 3);

    cluster.bootstrap(&Ring).await.unwrap();
    cluster.spawn(&cancel).await.unwrap();
    cluster.close().await.unwrap();

    while let Some(change) = timeout(WAIT, sub.recv()).await.unwrap() {
        graph.apply(&change);
    }
    assert!(graph.nodes.is_empty());
    assert!(graph.links.is_empty());
}

#[tokio::test]
async fn test_cancelled_spawn_token_stops_translation() {
    let cluster = Cluster::new(config()).unwrap();
    let cancel = CancellationToken::new();
    let member_token = CancellationToken::new();
    let mut events = cluster.events(&cancel).unwrap();

    let a = cluster.spawn(&member_token).await.unwrap();
    let b = cluster.spawn(&cancel).await.unwrap();
    next(&mut events).await;
    next(&mut events).await;

    // Only b still reports links, so the link still shows up once.
    member_token.cancel();
    cluster.connect(a, b).await.unwrap();
    assert_eq!(
        next(&mut events).await,
        StateChanged::added(Diff::link(Edge::new(a, b)))
    );

    cluster.close().await.unwrap();
}
